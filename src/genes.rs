// Gene and condition metadata: dense index lookups, per-gene annotation, and
// orientation of genes relative to the direction of replication.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fmt;

// Immutable bidirectional map between names and dense zero-based indices.
#[derive(Clone, Debug, Default)]
pub struct Lookup {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl Lookup {
    // Build from names already ordered by index.
    pub fn from_names(names: Vec<String>) -> Result<Lookup> {
        let mut index = HashMap::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            if index.insert(name.clone(), i).is_some() {
                return Err(Error::InconsistentMetadata {
                    kind: "lookup",
                    key: name.clone(),
                    detail: "name assigned to more than one index".to_string(),
                });
            }
        }
        Ok(Lookup { names, index })
    }

    // Assign indices in order of first appearance.
    pub fn from_first_appearance<'a, I>(names: I) -> Lookup
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut lookup = Lookup::default();
        for name in names {
            if !lookup.index.contains_key(name) {
                lookup.index.insert(name.to_string(), lookup.names.len());
                lookup.names.push(name.to_string());
            }
        }
        lookup
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn name(&self, index: usize) -> &str {
        &self.names[index]
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Orientation {
    Codirectional,
    HeadOn,
}

impl Orientation {
    pub fn from_flag(flag: u8) -> Option<Orientation> {
        match flag {
            0 => Some(Orientation::Codirectional),
            1 => Some(Orientation::HeadOn),
            _ => None,
        }
    }

    pub fn flag(self) -> u8 {
        match self {
            Orientation::Codirectional => 0,
            Orientation::HeadOn => 1,
        }
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Orientation::Codirectional => write!(f, "Codirectional"),
            Orientation::HeadOn => write!(f, "Head-on"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Strand {
    Forward,
    Reverse,
}

impl Strand {
    pub fn parse(s: &str) -> Option<Strand> {
        match s.trim() {
            "+" | "1" => Some(Strand::Forward),
            "-" | "-1" => Some(Strand::Reverse),
            _ => None,
        }
    }
}

// A CDS transcribed on the leading strand moves with the replisome on one arm
// of the chromosome and against it on the other. `terminus` is the coordinate
// splitting the two arms.
pub fn classify_orientation(start: u64, strand: Strand, terminus: u64) -> Orientation {
    match (start > terminus, strand) {
        (true, Strand::Forward) | (false, Strand::Reverse) => Orientation::HeadOn,
        _ => Orientation::Codirectional,
    }
}

// Per-gene annotation carried through to exported tables.
#[derive(Clone, Debug, PartialEq)]
pub struct GeneInfo {
    pub gene_index: usize,
    pub locus_tag: String,
    pub name: String,
    pub orientation: Orientation,
}

// Gene-level metadata for the whole data set, indexed by dense gene index.
#[derive(Clone, Debug)]
pub struct GeneTable {
    pub genes: Vec<GeneInfo>,
    pub locus_tags: Lookup,
}

impl GeneTable {
    pub fn new(genes: Vec<GeneInfo>) -> Result<GeneTable> {
        for (i, gene) in genes.iter().enumerate() {
            if gene.gene_index != i {
                return Err(Error::InconsistentMetadata {
                    kind: "gene",
                    key: gene.locus_tag.clone(),
                    detail: format!("listed at position {} with index {}", i, gene.gene_index),
                });
            }
        }
        let locus_tags = Lookup::from_names(genes.iter().map(|g| g.locus_tag.clone()).collect())?;
        Ok(GeneTable { genes, locus_tags })
    }

    pub fn len(&self) -> usize {
        self.genes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.genes.is_empty()
    }

    pub fn get(&self, gene_index: usize) -> &GeneInfo {
        &self.genes[gene_index]
    }

    // Overwrite orientations with labels derived from CDS coordinates. Genes
    // without a matching CDS keep their orientation. Returns the number of
    // distinct genes matched; repeated CDS records for a locus tag count once.
    pub fn relabel_orientation(&mut self, cds: &[Cds], labels: &[Orientation]) -> usize {
        let mut matched = vec![false; self.genes.len()];
        for (c, &orientation) in cds.iter().zip(labels) {
            if let Some(i) = self.locus_tags.index_of(&c.locus_tag) {
                self.genes[i].orientation = orientation;
                matched[i] = true;
            }
        }
        matched.iter().filter(|&&m| m).count()
    }

    // locus tag -> gene name
    pub fn name_of_locus_tag(&self, locus_tag: &str) -> Option<&str> {
        self.locus_tags
            .index_of(locus_tag)
            .map(|i| self.genes[i].name.as_str())
    }
}

// A coding sequence from a genome annotation.
#[derive(Clone, Debug, PartialEq)]
pub struct Cds {
    pub locus_tag: String,
    pub gene: String,
    pub start: u64,
    pub end: u64,
    pub strand: Strand,
}

// Label every CDS with its orientation, using the end of the named terminus
// gene as the arm boundary.
pub fn label_cds_orientation(cds: &[Cds], terminus_gene: &str) -> Result<Vec<Orientation>> {
    let terminus = cds
        .iter()
        .find(|c| c.gene == terminus_gene)
        .map(|c| c.end)
        .ok_or_else(|| {
            Error::InvalidConfig(format!("terminus gene '{}' not found in CDS table", terminus_gene))
        })?;

    Ok(cds
        .iter()
        .map(|c| classify_orientation(c.start, c.strand, terminus))
        .collect())
}
