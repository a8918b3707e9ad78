// Posterior draws keyed by parameter name, and their on-disk representation.

use crate::error::{Error, Result};
use arrow::array::{
    Array, ArrayRef, Float64Array, Float64Builder, ListArray, ListBuilder, RecordBatch,
    StringArray, UInt32Array,
};
use arrow::datatypes::{DataType, Field, Schema};
use log::info;
use ndarray::{Array1, ArrayD, ArrayView, ArrayView1, ArrayView2, ArrayView3, Axis, Dimension, IxDyn};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression::ZSTD, ZstdLevel};
use parquet::file::metadata::KeyValue;
use parquet::file::properties::WriterProperties;
use std::collections::BTreeMap;
use std::fs::File;
use std::sync::Arc;

pub const ALPHA: &str = "alpha";
pub const BETA_TILDE: &str = "beta_tilde";
pub const LAMBDA: &str = "lambda";
pub const TAU_TILDE: &str = "tau_tilde";
pub const C2_TILDE: &str = "c2_tilde";
pub const SIGMA: &str = "sigma";
pub const B_CONDITION: &str = "b_condition";
pub const NEW_ALPHA: &str = "new_alpha";
pub const NEW_BETA: &str = "new_beta";

// Raw sampled parameters that are only needed to compute `b_condition`.
pub const AUXILIARY: [&str; 4] = [BETA_TILDE, LAMBDA, TAU_TILDE, C2_TILDE];

// Parquet key-value metadata entry holding parameter shapes.
const METADATA_KEY: &str = "hsgini";

#[derive(Clone, Debug)]
pub struct PosteriorDraws {
    // chain that produced each draw
    chain: Array1<u32>,
    // every array has a leading draw axis
    params: BTreeMap<String, ArrayD<f64>>,
}

impl PosteriorDraws {
    pub fn new(chain: Array1<u32>) -> PosteriorDraws {
        PosteriorDraws {
            chain,
            params: BTreeMap::new(),
        }
    }

    pub fn ndraws(&self) -> usize {
        self.chain.len()
    }

    pub fn nchains(&self) -> usize {
        self.chain.iter().max().map(|&k| k as usize + 1).unwrap_or(0)
    }

    pub fn chain(&self) -> ArrayView1<u32> {
        self.chain.view()
    }

    pub fn insert(&mut self, name: &str, values: ArrayD<f64>) -> Result<()> {
        if values.ndim() == 0 || values.shape()[0] != self.ndraws() {
            return Err(Error::ShapeMismatch {
                context: format!("draws of '{}'", name),
                expected: vec![self.ndraws()],
                got: values.shape().to_vec(),
            });
        }
        self.params.insert(name.to_string(), values);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(|k| k.as_str())
    }

    pub fn get(&self, name: &str) -> Result<&ArrayD<f64>> {
        self.params
            .get(name)
            .ok_or_else(|| Error::MissingParameter(name.to_string()))
    }

    fn view_as<D: Dimension>(&self, name: &str) -> Result<ArrayView<'_, f64, D>> {
        let values = self.get(name)?;
        let got = values.ndim();
        values
            .view()
            .into_dimensionality::<D>()
            .map_err(|_| Error::Dimensionality {
                name: name.to_string(),
                expected: D::NDIM.unwrap_or(got),
                got,
            })
    }

    pub fn get1(&self, name: &str) -> Result<ArrayView1<f64>> {
        self.view_as(name)
    }

    pub fn get2(&self, name: &str) -> Result<ArrayView2<f64>> {
        self.view_as(name)
    }

    pub fn get3(&self, name: &str) -> Result<ArrayView3<f64>> {
        self.view_as(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<ArrayD<f64>> {
        self.params.remove(name)
    }

    pub fn remove_auxiliary(&mut self) {
        for name in AUXILIARY {
            self.params.remove(name);
        }
    }

    // Per-draw shape of a parameter, i.e. without the leading draw axis.
    fn draw_shape(values: &ArrayD<f64>) -> &[usize] {
        &values.shape()[1..]
    }

    fn shape_metadata(&self) -> String {
        let mut parameters = json::JsonValue::new_object();
        for (name, values) in &self.params {
            parameters[name.as_str()] = Self::draw_shape(values).to_vec().into();
        }
        let mut metadata = json::JsonValue::new_object();
        metadata["ndraws"] = self.ndraws().into();
        metadata["parameters"] = parameters;
        metadata.dump()
    }

    // Write every parameter to a single parquet file, one row per
    // (parameter, draw) holding that draw's values in row-major order.
    pub fn write_parquet(&self, filename: &str) -> Result<()> {
        let schema = Arc::new(draws_schema());
        let props = WriterProperties::builder()
            .set_compression(ZSTD(ZstdLevel::try_new(3)?))
            .set_key_value_metadata(Some(vec![KeyValue::new(
                String::from(METADATA_KEY),
                Some(self.shape_metadata()),
            )]))
            .build();

        let output = File::create(filename)?;
        let mut writer = ArrowWriter::try_new(output, schema.clone(), Some(props))?;

        let ndraws = self.ndraws();
        let chain: ArrayRef = Arc::new(UInt32Array::from(self.chain.to_vec()));
        let draw: ArrayRef = Arc::new((0..ndraws as u32).collect::<UInt32Array>());

        for (name, values) in &self.params {
            let mut builder = ListBuilder::new(Float64Builder::new());
            for draw_values in values.axis_iter(Axis(0)) {
                for &x in draw_values.iter() {
                    builder.values().append_value(x);
                }
                builder.append(true);
            }

            let columns: Vec<ArrayRef> = vec![
                Arc::new(StringArray::from(vec![name.as_str(); ndraws])),
                chain.clone(),
                draw.clone(),
                Arc::new(builder.finish()),
            ];
            writer.write(&RecordBatch::try_new(schema.clone(), columns)?)?;
        }
        writer.close()?;

        info!(
            "Wrote {} draws of {} parameters to {}",
            ndraws,
            self.params.len(),
            filename
        );
        Ok(())
    }

    pub fn read_parquet(filename: &str) -> Result<PosteriorDraws> {
        let input = File::open(filename)?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(input)?;

        let metadata_str = builder
            .metadata()
            .file_metadata()
            .key_value_metadata()
            .and_then(|kvs| kvs.iter().find(|kv| kv.key == METADATA_KEY))
            .and_then(|kv| kv.value.clone())
            .ok_or_else(|| Error::InconsistentMetadata {
                kind: "posterior draws",
                key: filename.to_string(),
                detail: format!("missing '{}' metadata", METADATA_KEY),
            })?;
        let metadata = json::parse(&metadata_str)?;
        let bad_metadata = |detail: &str| Error::InconsistentMetadata {
            kind: "posterior draws",
            key: filename.to_string(),
            detail: detail.to_string(),
        };

        let ndraws = metadata["ndraws"]
            .as_usize()
            .ok_or_else(|| bad_metadata("missing draw count"))?;
        let mut shapes: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (name, shape) in metadata["parameters"].entries() {
            let shape = shape
                .members()
                .map(|d| d.as_usize().ok_or_else(|| bad_metadata("malformed shape")))
                .collect::<Result<Vec<usize>>>()?;
            shapes.insert(name.to_string(), shape);
        }

        let schema = builder.schema().clone();
        let parameter_col = schema.index_of("parameter")?;
        let chain_col = schema.index_of("chain")?;
        let draw_col = schema.index_of("draw")?;
        let values_col = schema.index_of("values")?;

        let mut buffers: BTreeMap<&str, (usize, Vec<f64>, usize)> = shapes
            .iter()
            .map(|(name, shape)| {
                let block = shape.iter().product::<usize>();
                (name.as_str(), (block, vec![0.0; ndraws * block], 0))
            })
            .collect();
        let mut chain = Array1::<u32>::zeros(ndraws);

        for batch in builder.build()? {
            let batch = batch?;
            let parameters = column_as::<StringArray>(&batch, parameter_col, "parameter")?;
            let chains = column_as::<UInt32Array>(&batch, chain_col, "chain")?;
            let draws = column_as::<UInt32Array>(&batch, draw_col, "draw")?;
            let values = column_as::<ListArray>(&batch, values_col, "values")?;

            for row in 0..batch.num_rows() {
                let name = parameters.value(row);
                let d = draws.value(row) as usize;
                if d >= ndraws {
                    return Err(Error::IndexOutOfRange {
                        kind: "draw",
                        index: d as i64,
                        bound: ndraws,
                        row,
                    });
                }

                let (block, buffer, nrows) = buffers
                    .get_mut(name)
                    .ok_or_else(|| Error::MissingParameter(name.to_string()))?;
                let row_values = values.value(row);
                let row_values = row_values
                    .as_any()
                    .downcast_ref::<Float64Array>()
                    .ok_or_else(|| bad_metadata("values column is not a list of f64"))?;
                if row_values.len() != *block {
                    return Err(Error::ShapeMismatch {
                        context: format!("draw {} of '{}'", d, name),
                        expected: vec![*block],
                        got: vec![row_values.len()],
                    });
                }

                buffer[d * *block..(d + 1) * *block].copy_from_slice(row_values.values());
                chain[d] = chains.value(row);
                *nrows += 1;
            }
        }

        let mut posterior = PosteriorDraws::new(chain);
        for (name, (_, buffer, nrows)) in buffers {
            if nrows != ndraws {
                return Err(bad_metadata(&format!(
                    "parameter '{}' has {} draws, expected {}",
                    name, nrows, ndraws
                )));
            }
            let mut shape = vec![ndraws];
            shape.extend_from_slice(&shapes[name]);
            posterior.insert(name, ArrayD::from_shape_vec(IxDyn(&shape), buffer)?)?;
        }

        info!(
            "Read {} draws of {} parameters from {}",
            ndraws,
            posterior.params.len(),
            filename
        );
        Ok(posterior)
    }
}

fn column_as<'a, T: Array + 'static>(batch: &'a RecordBatch, col: usize, name: &str) -> Result<&'a T> {
    batch
        .column(col)
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| Error::InconsistentMetadata {
            kind: "posterior draws",
            key: name.to_string(),
            detail: format!("unexpected column type {}", batch.column(col).data_type()),
        })
}

pub fn draws_schema() -> Schema {
    Schema::new(vec![
        Field::new("parameter", DataType::Utf8, false),
        Field::new("chain", DataType::UInt32, false),
        Field::new("draw", DataType::UInt32, false),
        Field::new(
            "values",
            DataType::List(Arc::new(Field::new("item", DataType::Float64, true))),
            false,
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array3};
    use tempfile::TempDir;

    fn example_draws() -> PosteriorDraws {
        let mut draws = PosteriorDraws::new(array![0, 0, 0, 1, 1, 1]);
        let alpha = Array3::from_shape_fn((6, 2, 1), |(d, g, _)| 10.0 + d as f64 * 0.1 - g as f64 / 3.0);
        let b = Array3::from_shape_fn((6, 2, 3), |(d, g, c)| (d * 6 + g * 3 + c) as f64 * 1e-3 - 0.017);
        let sigma = Array1::from_shape_fn(6, |d| 0.5 + d as f64 / 7.0);
        draws.insert(ALPHA, alpha.index_axis(Axis(2), 0).to_owned().into_dyn()).unwrap();
        draws.insert(B_CONDITION, b.into_dyn()).unwrap();
        draws.insert(SIGMA, sigma.into_dyn()).unwrap();
        draws
    }

    #[test]
    fn test_accessors() {
        let draws = example_draws();
        assert_eq!(draws.ndraws(), 6);
        assert_eq!(draws.nchains(), 2);
        assert_eq!(draws.get2(ALPHA).unwrap().shape(), &[6, 2]);
        assert_eq!(draws.get3(B_CONDITION).unwrap().shape(), &[6, 2, 3]);
        assert_eq!(draws.get1(SIGMA).unwrap().len(), 6);

        assert!(matches!(draws.get3(ALPHA), Err(Error::Dimensionality { expected: 3, got: 2, .. })));
        assert!(matches!(draws.get(LAMBDA), Err(Error::MissingParameter(_))));
    }

    #[test]
    fn test_insert_checks_draw_count() {
        let mut draws = example_draws();
        let wrong = ArrayD::zeros(IxDyn(&[5, 2]));
        assert!(draws.insert("wrong", wrong).is_err());
    }

    #[test]
    fn test_remove_auxiliary() {
        let mut draws = example_draws();
        draws.insert(LAMBDA, ArrayD::zeros(IxDyn(&[6, 2, 3]))).unwrap();
        draws.insert(TAU_TILDE, ArrayD::zeros(IxDyn(&[6, 2, 1]))).unwrap();
        draws.remove_auxiliary();
        let names: Vec<&str> = draws.names().collect();
        assert_eq!(names, vec![ALPHA, B_CONDITION, SIGMA]);
    }

    #[test]
    fn test_parquet_roundtrip_is_exact() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("draws.parquet");
        let path = path.to_str().unwrap();

        let draws = example_draws();
        draws.write_parquet(path).unwrap();
        let restored = PosteriorDraws::read_parquet(path).unwrap();

        assert_eq!(restored.chain(), draws.chain());
        assert_eq!(
            restored.names().collect::<Vec<_>>(),
            draws.names().collect::<Vec<_>>()
        );
        for name in draws.names() {
            let a = draws.get(name).unwrap();
            let b = restored.get(name).unwrap();
            assert_eq!(a.shape(), b.shape());
            assert!(a.iter().zip(b.iter()).all(|(x, y)| x.to_bits() == y.to_bits()));
        }
    }

    #[test]
    fn test_read_rejects_plain_parquet() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plain.parquet");
        let schema = Arc::new(Schema::new(vec![Field::new("x", DataType::UInt32, false)]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(UInt32Array::from(vec![1, 2, 3])) as ArrayRef],
        )
        .unwrap();
        let mut writer = ArrowWriter::try_new(File::create(&path).unwrap(), schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();

        assert!(PosteriorDraws::read_parquet(path.to_str().unwrap()).is_err());
    }
}
