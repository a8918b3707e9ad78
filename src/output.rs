use crate::analysis::summary::SummaryRow;
use crate::error::{Error, Result};
use crate::genes::{GeneInfo, GeneTable, Lookup};
use crate::schemas::{
    gene_info_schema, gene_trends_schema, gini_draws_schema, gini_schema, intercepts_schema,
    OutputFormat,
};
use arrow::array::{
    ArrayRef, Float64Array, LargeStringArray, RecordBatch, StringArray, UInt32Array, UInt8Array,
};
use arrow::datatypes::Schema;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::info;
use ndarray::{ArrayView1, ArrayView2};
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression::ZSTD, ZstdLevel};
use parquet::file::properties::WriterProperties;
use std::fs::File;
use std::io::Write;
use std::sync::Arc;

pub fn determine_format(filename: &str, fmt: OutputFormat) -> Result<OutputFormat> {
    if fmt != OutputFormat::Infer {
        return Ok(fmt);
    }

    if filename.ends_with(".csv.gz") {
        Ok(OutputFormat::CsvGz)
    } else if filename.ends_with(".csv") {
        Ok(OutputFormat::Csv)
    } else if filename.ends_with(".parquet") {
        Ok(OutputFormat::Parquet)
    } else {
        Err(Error::UnknownFormat(filename.to_string()))
    }
}

pub fn write_table(filename: &str, fmt: OutputFormat, batch: RecordBatch) -> Result<()> {
    let fmt = determine_format(filename, fmt)?;
    let file = File::create(filename)?;

    match fmt {
        OutputFormat::Csv => {
            write_table_csv(file, &batch)?;
        }
        OutputFormat::CsvGz => {
            let encoder = GzEncoder::new(file, Compression::default());
            write_table_csv(encoder, &batch)?.finish()?;
        }
        OutputFormat::Parquet => write_table_parquet(file, &batch)?,
        OutputFormat::Infer => return Err(Error::UnknownFormat(filename.to_string())),
    }

    info!("Wrote {} rows to {}", batch.num_rows(), filename);
    Ok(())
}

// Returns the underlying writer so compressed streams can be finished.
fn write_table_csv<W: Write>(output: W, batch: &RecordBatch) -> Result<W> {
    let mut writer = arrow::csv::WriterBuilder::new()
        .with_header(true)
        .build(output);
    writer.write(batch)?;
    Ok(writer.into_inner())
}

fn write_table_parquet(output: File, batch: &RecordBatch) -> Result<()> {
    let props = WriterProperties::builder()
        .set_compression(ZSTD(ZstdLevel::try_new(3)?))
        .build();
    let mut writer = ArrowWriter::try_new(output, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    Ok(())
}

fn string_column<'a, I>(values: I, fmt: OutputFormat) -> ArrayRef
where
    I: Iterator<Item = &'a str>,
{
    match fmt {
        OutputFormat::Parquet => Arc::new(LargeStringArray::from_iter_values(values)),
        _ => Arc::new(StringArray::from_iter_values(values)),
    }
}

fn u32_column<I: Iterator<Item = usize>>(values: I) -> ArrayRef {
    Arc::new(values.map(|v| v as u32).collect::<UInt32Array>())
}

fn f64_column<I: Iterator<Item = f64>>(values: I) -> ArrayRef {
    Arc::new(values.collect::<Float64Array>())
}

fn interval_columns(rows: &[&SummaryRow]) -> Vec<ArrayRef> {
    vec![
        f64_column(rows.iter().map(|r| r.mean_val)),
        f64_column(rows.iter().map(|r| r.lower_cl)),
        f64_column(rows.iter().map(|r| r.upper_cl)),
    ]
}

fn gene_columns(genes: &[&GeneInfo], fmt: OutputFormat) -> Vec<ArrayRef> {
    let directions: Vec<String> = genes.iter().map(|g| g.orientation.to_string()).collect();
    vec![
        string_column(genes.iter().map(|g| g.locus_tag.as_str()), fmt),
        string_column(genes.iter().map(|g| g.name.as_str()), fmt),
        string_column(directions.iter().map(|d| d.as_str()), fmt),
    ]
}

fn lookup_genes<'a>(rows: &[&SummaryRow], genes: &'a GeneTable) -> Result<Vec<&'a GeneInfo>> {
    rows.iter()
        .enumerate()
        .map(|(i, row)| {
            if row.entity < genes.len() {
                Ok(genes.get(row.entity))
            } else {
                Err(Error::IndexOutOfRange {
                    kind: "gene",
                    index: row.entity as i64,
                    bound: genes.len(),
                    row: i,
                })
            }
        })
        .collect()
}

fn batch(schema: Schema, columns: Vec<ArrayRef>) -> Result<RecordBatch> {
    Ok(RecordBatch::try_new(Arc::new(schema), columns)?)
}

// Condition effects relative to baseline, joined with gene and condition names.
pub fn write_gene_trends(
    filename: &str,
    fmt: OutputFormat,
    rows: &[SummaryRow],
    genes: &GeneTable,
    conditions: &Lookup,
) -> Result<()> {
    let fmt = determine_format(filename, fmt)?;
    let rows: Vec<&SummaryRow> = rows.iter().collect();
    let gene_info = lookup_genes(&rows, genes)?;
    for (i, row) in rows.iter().enumerate() {
        if row.category >= conditions.len() {
            return Err(Error::IndexOutOfRange {
                kind: "condition",
                index: row.category as i64,
                bound: conditions.len(),
                row: i,
            });
        }
    }

    let mut columns = vec![
        u32_column(rows.iter().map(|r| r.entity)),
        u32_column(rows.iter().map(|r| r.category)),
    ];
    columns.extend(interval_columns(&rows));
    columns.extend(gene_columns(&gene_info, fmt));
    columns.push(string_column(rows.iter().map(|r| conditions.name(r.category)), fmt));

    write_table(filename, fmt, batch(gene_trends_schema(fmt), columns)?)
}

// Per gene Gini summary sorted by posterior mean, ranked in `x_vals`.
pub fn write_gini(filename: &str, fmt: OutputFormat, rows: &[SummaryRow], genes: &GeneTable) -> Result<()> {
    let fmt = determine_format(filename, fmt)?;
    let mut rows: Vec<&SummaryRow> = rows.iter().collect();
    rows.sort_by(|a, b| a.mean_val.total_cmp(&b.mean_val));
    let gene_info = lookup_genes(&rows, genes)?;

    let mut columns = vec![u32_column(rows.iter().map(|r| r.entity))];
    columns.extend(interval_columns(&rows));
    columns.extend(gene_columns(&gene_info, fmt));
    columns.push(Arc::new(
        gene_info
            .iter()
            .map(|g| g.orientation.flag())
            .collect::<UInt8Array>(),
    ));
    columns.push(u32_column(0..rows.len()));

    write_table(filename, fmt, batch(gini_schema(fmt), columns)?)
}

// Per gene intercept at the baseline condition.
pub fn write_intercepts(
    filename: &str,
    fmt: OutputFormat,
    rows: &[SummaryRow],
    genes: &GeneTable,
) -> Result<()> {
    let fmt = determine_format(filename, fmt)?;
    let rows: Vec<&SummaryRow> = rows.iter().collect();
    let gene_info = lookup_genes(&rows, genes)?;

    let mut columns = vec![u32_column(rows.iter().map(|r| r.entity))];
    columns.extend(interval_columns(&rows));
    columns.extend(gene_columns(&gene_info, fmt));

    write_table(filename, fmt, batch(intercepts_schema(fmt), columns)?)
}

// Every per-draw Gini coefficient in long form. `gini` is [ndraws, ngenes].
pub fn write_gini_draws(
    filename: &str,
    fmt: OutputFormat,
    gini: ArrayView2<f64>,
    chain: ArrayView1<u32>,
) -> Result<()> {
    let (ndraws, ngenes) = gini.dim();
    if chain.len() != ndraws {
        return Err(Error::ShapeMismatch {
            context: "chain labels".to_string(),
            expected: vec![ndraws],
            got: vec![chain.len()],
        });
    }

    let columns: Vec<ArrayRef> = vec![
        u32_column((0..ndraws).flat_map(|d| std::iter::repeat(d).take(ngenes))),
        Arc::new(
            chain
                .iter()
                .flat_map(|&k| std::iter::repeat(k).take(ngenes))
                .collect::<UInt32Array>(),
        ),
        u32_column((0..ndraws).flat_map(|_| 0..ngenes)),
        f64_column(gini.iter().copied()),
    ];

    write_table(filename, fmt, batch(gini_draws_schema(), columns)?)
}

// Genes with their orientation relative to replication.
pub fn write_gene_info(filename: &str, fmt: OutputFormat, genes: &GeneTable) -> Result<()> {
    let fmt = determine_format(filename, fmt)?;
    let gene_info: Vec<&GeneInfo> = genes.genes.iter().collect();

    let mut columns = vec![u32_column(gene_info.iter().map(|g| g.gene_index))];
    columns.extend(gene_columns(&gene_info, fmt));
    columns.push(Arc::new(
        gene_info
            .iter()
            .map(|g| g.orientation.flag())
            .collect::<UInt8Array>(),
    ));

    write_table(filename, fmt, batch(gene_info_schema(fmt), columns)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genes::Orientation;
    use flate2::read::GzDecoder;
    use ndarray::array;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use std::io::Read;
    use tempfile::TempDir;

    fn genes() -> GeneTable {
        GeneTable::new(vec![
            GeneInfo {
                gene_index: 0,
                locus_tag: "BSU00010".to_string(),
                name: "dnaA".to_string(),
                orientation: Orientation::Codirectional,
            },
            GeneInfo {
                gene_index: 1,
                locus_tag: "BSU00020".to_string(),
                name: "dnaN".to_string(),
                orientation: Orientation::HeadOn,
            },
        ])
        .unwrap()
    }

    fn row(entity: usize, category: usize, mean_val: f64) -> SummaryRow {
        SummaryRow {
            entity,
            category,
            mean_val,
            lower_cl: mean_val - 1.0,
            upper_cl: mean_val + 1.0,
        }
    }

    #[test]
    fn test_determine_format() {
        assert_eq!(determine_format("a.csv", OutputFormat::Infer).unwrap(), OutputFormat::Csv);
        assert_eq!(determine_format("a.csv.gz", OutputFormat::Infer).unwrap(), OutputFormat::CsvGz);
        assert_eq!(
            determine_format("a.parquet", OutputFormat::Infer).unwrap(),
            OutputFormat::Parquet
        );
        assert_eq!(determine_format("a.txt", OutputFormat::Csv).unwrap(), OutputFormat::Csv);
        assert!(determine_format("a.txt", OutputFormat::Infer).is_err());
    }

    #[test]
    fn test_gini_table_sorted_and_ranked() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gini.csv");
        let path = path.to_str().unwrap();
        write_gini(path, OutputFormat::Infer, &[row(0, 0, 0.4), row(1, 0, 0.1)], &genes()).unwrap();

        let mut text = String::new();
        File::open(path).unwrap().read_to_string(&mut text).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "gene_index,mean_val,lower_cl,upper_cl,locus_tag,gene,direction,headon,x_vals"
        );
        assert!(lines[1].starts_with("1,0.1,"));
        assert!(lines[1].ends_with("BSU00020,dnaN,Head-on,1,0"));
        assert!(lines[2].ends_with("BSU00010,dnaA,Codirectional,0,1"));
    }

    #[test]
    fn test_gene_trends_gz() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trends.csv.gz");
        let path = path.to_str().unwrap();
        let conditions = Lookup::from_first_appearance(["LBexp", "Heat"]);
        let rows = vec![row(0, 0, 0.0), row(0, 1, 2.0), row(1, 0, 0.0), row(1, 1, -1.5)];
        write_gene_trends(path, OutputFormat::Infer, &rows, &genes(), &conditions).unwrap();

        let mut text = String::new();
        GzDecoder::new(File::open(path).unwrap())
            .read_to_string(&mut text)
            .unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[0].ends_with("locus_tag,gene,direction,condition"));
        assert!(lines[4].starts_with("1,1,-1.5,"));
        assert!(lines[4].ends_with(",Heat"));

        let bad = vec![row(0, 2, 0.0)];
        assert!(write_gene_trends(path, OutputFormat::Infer, &bad, &genes(), &conditions).is_err());
    }

    #[test]
    fn test_gini_draws_parquet() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gini_draws.parquet");
        let gini = array![[0.1, 0.2], [0.3, 0.4], [0.5, 0.6]];
        let chain = array![0, 0, 1];
        write_gini_draws(path.to_str().unwrap(), OutputFormat::Infer, gini.view(), chain.view()).unwrap();

        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(&path).unwrap())
            .unwrap()
            .build()
            .unwrap();
        let batches: Vec<RecordBatch> = reader.map(|b| b.unwrap()).collect();
        let nrows: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(nrows, 6);

        let batch = &batches[0];
        let chain_col = batch.column(1).as_any().downcast_ref::<UInt32Array>().unwrap();
        let gene_col = batch.column(2).as_any().downcast_ref::<UInt32Array>().unwrap();
        let gini_col = batch.column(3).as_any().downcast_ref::<Float64Array>().unwrap();
        assert_eq!(chain_col.value(5), 1);
        assert_eq!(gene_col.value(3), 1);
        assert_eq!(gini_col.value(4), 0.5);
    }

    #[test]
    fn test_unknown_gene_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("intercepts.csv");
        let result = write_intercepts(path.to_str().unwrap(), OutputFormat::Infer, &[row(5, 0, 1.0)], &genes());
        assert!(matches!(result, Err(Error::IndexOutOfRange { .. })));
    }
}
