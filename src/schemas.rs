// Schemas of the exported tables, shared by the writers in output.rs.

use arrow::datatypes::{DataType, Field, Schema};
use clap::ValueEnum;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum OutputFormat {
    Infer,
    Csv,
    CsvGz,
    Parquet,
}

pub fn large_utf8_if_parquet(fmt: OutputFormat) -> DataType {
    match fmt {
        OutputFormat::Parquet => DataType::LargeUtf8,
        _ => DataType::Utf8,
    }
}

fn interval_fields() -> Vec<Field> {
    vec![
        Field::new("mean_val", DataType::Float64, false),
        Field::new("lower_cl", DataType::Float64, false),
        Field::new("upper_cl", DataType::Float64, false),
    ]
}

fn gene_fields(fmt: OutputFormat) -> Vec<Field> {
    vec![
        Field::new("locus_tag", large_utf8_if_parquet(fmt), false),
        Field::new("gene", large_utf8_if_parquet(fmt), false),
        Field::new("direction", large_utf8_if_parquet(fmt), false),
    ]
}

// Per (gene, condition) effect relative to the baseline condition.
pub fn gene_trends_schema(fmt: OutputFormat) -> Schema {
    let mut fields = vec![
        Field::new("gene_index", DataType::UInt32, false),
        Field::new("condition_index", DataType::UInt32, false),
    ];
    fields.extend(interval_fields());
    fields.extend(gene_fields(fmt));
    fields.push(Field::new("condition", large_utf8_if_parquet(fmt), false));
    Schema::new(fields)
}

// Per gene Gini summary, in ascending order of mean with its rank in `x_vals`.
pub fn gini_schema(fmt: OutputFormat) -> Schema {
    let mut fields = vec![Field::new("gene_index", DataType::UInt32, false)];
    fields.extend(interval_fields());
    fields.extend(gene_fields(fmt));
    fields.push(Field::new("headon", DataType::UInt8, false));
    fields.push(Field::new("x_vals", DataType::UInt32, false));
    Schema::new(fields)
}

// Per gene intercept at the baseline condition.
pub fn intercepts_schema(fmt: OutputFormat) -> Schema {
    let mut fields = vec![Field::new("gene_index", DataType::UInt32, false)];
    fields.extend(interval_fields());
    fields.extend(gene_fields(fmt));
    Schema::new(fields)
}

pub fn gini_draws_schema() -> Schema {
    Schema::new(vec![
        Field::new("draw", DataType::UInt32, false),
        Field::new("chain", DataType::UInt32, false),
        Field::new("gene_index", DataType::UInt32, false),
        Field::new("gini", DataType::Float64, false),
    ])
}

// Orientation-labeled gene table.
pub fn gene_info_schema(fmt: OutputFormat) -> Schema {
    let mut fields = vec![Field::new("gene_index", DataType::UInt32, false)];
    fields.extend(gene_fields(fmt));
    fields.push(Field::new("headon", DataType::UInt8, false));
    Schema::new(fields)
}
