use crate::error::{Error, Result};
use crate::genes::{Cds, GeneInfo, GeneTable, Lookup, Orientation, Strand};
use flate2::read::GzDecoder;
use log::{debug, info};
use std::fs::File;
use std::io::{BufReader, Read};

// Names of the input table columns.
#[derive(Clone, Debug)]
pub struct ObservationColumns {
    pub gene_name: String,
    pub locus_tag: String,
    pub orientation: String,
    pub condition: String,
    pub replicate: String,
    pub value: String,
    pub gene_index: String,
    pub condition_index: String,
}

impl Default for ObservationColumns {
    fn default() -> Self {
        ObservationColumns {
            gene_name: "Name".to_string(),
            locus_tag: "Locus_tag".to_string(),
            orientation: "headon".to_string(),
            condition: "condition".to_string(),
            replicate: "replicate".to_string(),
            value: "log2signal".to_string(),
            gene_index: "gene_lookup".to_string(),
            condition_index: "condition_lookup".to_string(),
        }
    }
}

// One row of the input table, before validation.
#[derive(Clone, Debug, PartialEq)]
pub struct ObservationRecord {
    pub gene_name: String,
    pub locus_tag: String,
    pub orientation: u8,
    pub condition: String,
    pub replicate: String,
    pub value: f64,
    pub gene_index: i64,
    pub condition_index: i64,
}

// A validated observation with dense indices.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Observation {
    pub gene: u32,
    pub condition: u32,
    pub value: f64,
}

pub fn open_table(path: &str) -> Result<csv::Reader<Box<dyn Read>>> {
    let file = File::open(path)?;
    let input: Box<dyn Read> = if path.ends_with(".gz") {
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    Ok(csv::Reader::from_reader(input))
}

pub fn find_column(headers: &csv::StringRecord, column: &str) -> Result<usize> {
    headers
        .iter()
        .position(|x| x == column)
        .ok_or_else(|| Error::ColumnNotFound(column.to_string()))
}

pub fn parse_field<T: std::str::FromStr>(
    row: &csv::StringRecord,
    col: usize,
    column: &str,
    rownum: usize,
) -> Result<T> {
    let value = &row[col];
    value.trim().parse::<T>().map_err(|_| Error::Parse {
        column: column.to_string(),
        row: rownum,
        value: value.to_string(),
    })
}

// Read the long-form expression table. When `assign_indices` is set the
// index columns are not required and indices are assigned by first appearance.
pub fn read_observations_csv(
    path: &str,
    columns: &ObservationColumns,
    assign_indices: bool,
) -> Result<Vec<ObservationRecord>> {
    let mut rdr = open_table(path)?;
    let mut records = read_observations(&mut rdr, columns, assign_indices)?;
    if assign_indices {
        assign_dense_indices(&mut records);
    }
    info!("Read {} observations from {}", records.len(), path);
    Ok(records)
}

fn read_observations<T>(
    rdr: &mut csv::Reader<T>,
    columns: &ObservationColumns,
    assign_indices: bool,
) -> Result<Vec<ObservationRecord>>
where
    T: std::io::Read,
{
    let headers = rdr.headers()?.clone();
    let gene_name_col = find_column(&headers, &columns.gene_name)?;
    let locus_tag_col = find_column(&headers, &columns.locus_tag)?;
    let orientation_col = find_column(&headers, &columns.orientation)?;
    let condition_col = find_column(&headers, &columns.condition)?;
    let replicate_col = find_column(&headers, &columns.replicate)?;
    let value_col = find_column(&headers, &columns.value)?;
    let index_cols = if assign_indices {
        None
    } else {
        Some((
            find_column(&headers, &columns.gene_index)?,
            find_column(&headers, &columns.condition_index)?,
        ))
    };

    let mut records = Vec::new();
    for (rownum, result) in rdr.records().enumerate() {
        let row = result?;

        let (gene_index, condition_index) = match index_cols {
            Some((gene_index_col, condition_index_col)) => (
                parse_field::<i64>(&row, gene_index_col, &columns.gene_index, rownum)?,
                parse_field::<i64>(&row, condition_index_col, &columns.condition_index, rownum)?,
            ),
            None => (-1, -1),
        };

        records.push(ObservationRecord {
            gene_name: row[gene_name_col].to_string(),
            locus_tag: row[locus_tag_col].to_string(),
            orientation: parse_field::<u8>(&row, orientation_col, &columns.orientation, rownum)?,
            condition: row[condition_col].to_string(),
            replicate: row[replicate_col].to_string(),
            value: parse_field::<f64>(&row, value_col, &columns.value, rownum)?,
            gene_index,
            condition_index,
        });
    }

    Ok(records)
}

// Genes are indexed by first appearance of their locus tag, conditions by
// first appearance of their name.
pub fn assign_dense_indices(records: &mut [ObservationRecord]) {
    let genes = Lookup::from_first_appearance(records.iter().map(|r| r.locus_tag.as_str()));
    let conditions = Lookup::from_first_appearance(records.iter().map(|r| r.condition.as_str()));
    for record in records.iter_mut() {
        // both lookups were built from these very records
        record.gene_index = genes.index_of(&record.locus_tag).unwrap_or(0) as i64;
        record.condition_index = conditions.index_of(&record.condition).unwrap_or(0) as i64;
    }
    debug!(
        "Assigned indices to {} genes and {} conditions",
        genes.len(),
        conditions.len()
    );
}

// Validated expression data with dense, contiguous indices.
#[derive(Clone, Debug)]
pub struct ExpressionData {
    pub observations: Vec<Observation>,
    pub genes: GeneTable,
    pub conditions: Lookup,
}

impl ExpressionData {
    pub fn from_records(records: &[ObservationRecord]) -> Result<ExpressionData> {
        if records.is_empty() {
            return Err(Error::EmptyData);
        }

        let ngenes = Lookup::from_first_appearance(records.iter().map(|r| r.locus_tag.as_str())).len();
        let nconditions =
            Lookup::from_first_appearance(records.iter().map(|r| r.condition.as_str())).len();

        let mut genes: Vec<Option<GeneInfo>> = vec![None; ngenes];
        let mut conditions: Vec<Option<String>> = vec![None; nconditions];
        let mut observations = Vec::with_capacity(records.len());

        for (rownum, record) in records.iter().enumerate() {
            let gene = checked_index("gene", record.gene_index, ngenes, rownum)?;
            let condition = checked_index("condition", record.condition_index, nconditions, rownum)?;

            let orientation = Orientation::from_flag(record.orientation).ok_or_else(|| Error::Parse {
                column: "orientation".to_string(),
                row: rownum,
                value: record.orientation.to_string(),
            })?;

            match &genes[gene] {
                None => {
                    genes[gene] = Some(GeneInfo {
                        gene_index: gene,
                        locus_tag: record.locus_tag.clone(),
                        name: record.gene_name.clone(),
                        orientation,
                    });
                }
                Some(info) => {
                    if info.locus_tag != record.locus_tag {
                        return Err(Error::InconsistentMetadata {
                            kind: "gene index",
                            key: gene.to_string(),
                            detail: format!(
                                "assigned to both '{}' and '{}'",
                                info.locus_tag, record.locus_tag
                            ),
                        });
                    }
                    if info.name != record.gene_name || info.orientation != orientation {
                        return Err(Error::InconsistentMetadata {
                            kind: "gene",
                            key: record.locus_tag.clone(),
                            detail: "name or orientation differs between rows".to_string(),
                        });
                    }
                }
            }

            match &conditions[condition] {
                None => conditions[condition] = Some(record.condition.clone()),
                Some(name) if name != &record.condition => {
                    return Err(Error::InconsistentMetadata {
                        kind: "condition index",
                        key: condition.to_string(),
                        detail: format!("assigned to both '{}' and '{}'", name, record.condition),
                    });
                }
                _ => {}
            }

            observations.push(Observation {
                gene: gene as u32,
                condition: condition as u32,
                value: record.value,
            });
        }

        let genes = genes
            .into_iter()
            .enumerate()
            .map(|(i, g)| g.ok_or(Error::NonContiguousIndex { kind: "gene", missing: i }))
            .collect::<Result<Vec<_>>>()?;
        let conditions = conditions
            .into_iter()
            .enumerate()
            .map(|(i, c)| c.ok_or(Error::NonContiguousIndex { kind: "condition", missing: i }))
            .collect::<Result<Vec<_>>>()?;

        Ok(ExpressionData {
            observations,
            genes: GeneTable::new(genes)?,
            conditions: Lookup::from_names(conditions)?,
        })
    }

    pub fn ngenes(&self) -> usize {
        self.genes.len()
    }

    pub fn nconditions(&self) -> usize {
        self.conditions.len()
    }

    pub fn values(&self) -> Vec<f64> {
        self.observations.iter().map(|o| o.value).collect()
    }

    // The common per-gene observation count. Every gene must have the same
    // number of observations since it enters the horseshoe prior scale.
    pub fn observations_per_gene(&self) -> Result<usize> {
        let mut counts = vec![0; self.ngenes()];
        for obs in &self.observations {
            counts[obs.gene as usize] += 1;
        }
        let expected = counts[0];
        for (gene, &got) in counts.iter().enumerate() {
            if got != expected {
                return Err(Error::RaggedObservations { gene, expected, got });
            }
        }
        Ok(expected)
    }
}

// Read a CDS annotation table with `locus_tag`, `gene`, `start`, `end` and
// `strand` columns.
pub fn read_cds_csv(path: &str) -> Result<Vec<Cds>> {
    let mut rdr = open_table(path)?;
    let cds = read_cds(&mut rdr)?;
    info!("Read {} CDS records from {}", cds.len(), path);
    Ok(cds)
}

fn read_cds<T: std::io::Read>(rdr: &mut csv::Reader<T>) -> Result<Vec<Cds>> {
    let headers = rdr.headers()?.clone();
    let locus_tag_col = find_column(&headers, "locus_tag")?;
    let gene_col = find_column(&headers, "gene")?;
    let start_col = find_column(&headers, "start")?;
    let end_col = find_column(&headers, "end")?;
    let strand_col = find_column(&headers, "strand")?;

    let mut cds = Vec::new();
    for (rownum, result) in rdr.records().enumerate() {
        let row = result?;
        let strand = Strand::parse(&row[strand_col]).ok_or_else(|| Error::Parse {
            column: "strand".to_string(),
            row: rownum,
            value: row[strand_col].to_string(),
        })?;
        cds.push(Cds {
            locus_tag: row[locus_tag_col].to_string(),
            gene: row[gene_col].to_string(),
            start: parse_field::<u64>(&row, start_col, "start", rownum)?,
            end: parse_field::<u64>(&row, end_col, "end", rownum)?,
            strand,
        });
    }
    Ok(cds)
}

fn checked_index(kind: &'static str, index: i64, bound: usize, row: usize) -> Result<usize> {
    if index < 0 || index as usize >= bound {
        return Err(Error::IndexOutOfRange { kind, index, bound, row });
    }
    Ok(index as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tag: &str, cond: &str, gi: i64, ci: i64, value: f64) -> ObservationRecord {
        ObservationRecord {
            gene_name: format!("name_{}", tag),
            locus_tag: tag.to_string(),
            orientation: 0,
            condition: cond.to_string(),
            replicate: "1".to_string(),
            value,
            gene_index: gi,
            condition_index: ci,
        }
    }

    #[test]
    fn test_read_csv_with_indices() {
        let text = "Name,Locus_tag,headon,condition,replicate,log2signal,gene_lookup,condition_lookup\n\
                    dnaA,BSU00010,0,LBexp,1,10.5,0,0\n\
                    dnaA,BSU00010,0,Heat,1,11.0,0,1\n\
                    sigB,BSU04730,1,LBexp,1,8.25,1,0\n\
                    sigB,BSU04730,1,Heat,1,12.0,1,1\n";
        let mut rdr = csv::Reader::from_reader(text.as_bytes());
        let records = read_observations(&mut rdr, &ObservationColumns::default(), false).unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[2].locus_tag, "BSU04730");
        assert_eq!(records[2].orientation, 1);
        assert_eq!(records[3].value, 12.0);

        let data = ExpressionData::from_records(&records).unwrap();
        assert_eq!(data.ngenes(), 2);
        assert_eq!(data.nconditions(), 2);
        assert_eq!(data.conditions.index_of("Heat"), Some(1));
        assert_eq!(data.genes.get(1).orientation, Orientation::HeadOn);
        assert_eq!(data.genes.name_of_locus_tag("BSU00010"), Some("dnaA"));
        assert_eq!(data.observations_per_gene().unwrap(), 2);
    }

    #[test]
    fn test_missing_column() {
        let text = "Name,Locus_tag\nx,y\n";
        let mut rdr = csv::Reader::from_reader(text.as_bytes());
        let err = read_observations(&mut rdr, &ObservationColumns::default(), true).unwrap_err();
        assert!(matches!(err, Error::ColumnNotFound(_)));
    }

    #[test]
    fn test_bad_value() {
        let text = "Name,Locus_tag,headon,condition,replicate,log2signal\n\
                    dnaA,BSU00010,0,LBexp,1,abc\n";
        let mut rdr = csv::Reader::from_reader(text.as_bytes());
        let err = read_observations(&mut rdr, &ObservationColumns::default(), true).unwrap_err();
        assert!(matches!(err, Error::Parse { row: 0, .. }));
    }

    #[test]
    fn test_assign_dense_indices() {
        let mut records = vec![
            record("g2", "B", -1, -1, 1.0),
            record("g1", "A", -1, -1, 2.0),
            record("g2", "A", -1, -1, 3.0),
            record("g1", "B", -1, -1, 4.0),
        ];
        assign_dense_indices(&mut records);
        let idx: Vec<(i64, i64)> = records
            .iter()
            .map(|r| (r.gene_index, r.condition_index))
            .collect();
        assert_eq!(idx, vec![(0, 0), (1, 1), (0, 1), (1, 0)]);
        assert!(ExpressionData::from_records(&records).is_ok());
    }

    #[test]
    fn test_out_of_range_index() {
        let records = vec![record("g1", "A", 0, 0, 1.0), record("g2", "A", 2, 0, 1.0)];
        let err = ExpressionData::from_records(&records).unwrap_err();
        assert!(matches!(err, Error::IndexOutOfRange { kind: "gene", index: 2, .. }));

        let records = vec![record("g1", "A", 0, -1, 1.0)];
        let err = ExpressionData::from_records(&records).unwrap_err();
        assert!(matches!(err, Error::IndexOutOfRange { kind: "condition", .. }));
    }

    #[test]
    fn test_conflicting_index() {
        let records = vec![record("g1", "A", 0, 0, 1.0), record("g2", "A", 0, 0, 1.0)];
        let err = ExpressionData::from_records(&records).unwrap_err();
        assert!(matches!(err, Error::InconsistentMetadata { .. }));
    }

    #[test]
    fn test_ragged_observations() {
        let records = vec![
            record("g1", "A", 0, 0, 1.0),
            record("g1", "B", 0, 1, 1.0),
            record("g2", "A", 1, 0, 1.0),
        ];
        let data = ExpressionData::from_records(&records).unwrap();
        let err = data.observations_per_gene().unwrap_err();
        assert!(matches!(err, Error::RaggedObservations { gene: 1, expected: 2, got: 1 }));
    }

    #[test]
    fn test_read_cds() {
        let text = "locus_tag,gene,start,end,strand\n\
                    BSU00010,dnaA,410,1750,+\n\
                    BSU18490,rtp,1942000,1942400,-\n";
        let mut rdr = csv::Reader::from_reader(text.as_bytes());
        let cds = read_cds(&mut rdr).unwrap();
        assert_eq!(cds.len(), 2);
        assert_eq!(cds[1].strand, Strand::Reverse);
        assert_eq!(cds[0].end, 1750);

        let text = "locus_tag,gene,start,end,strand\nBSU00010,dnaA,410,1750,x\n";
        let mut rdr = csv::Reader::from_reader(text.as_bytes());
        assert!(matches!(read_cds(&mut rdr), Err(Error::Parse { .. })));
    }

    #[test]
    fn test_empty() {
        assert!(matches!(ExpressionData::from_records(&[]), Err(Error::EmptyData)));
    }
}
