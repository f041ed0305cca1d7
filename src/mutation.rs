//! The global, de-duplicated mutation table.

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use taxonium_protocol::{Mutation, MutationClass, MutationId, NUCLEOTIDE_GENE};

lazy_static! {
    static ref MUTATION_LABEL: Regex = Regex::new(r"^(\D*)(\d+)(.*)$").unwrap_or_else(|e| {
        panic!("invalid mutation label pattern: {e}")
    });
}

type MutationKey = (String, u32, String, String);

#[derive(Debug, Clone, Default)]
pub struct MutationTable {
    entries: Vec<Mutation>,
    index: HashMap<MutationKey, MutationId>,
}

impl MutationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the id of the (gene, position, previous, new) combination,
    /// adding it to the table the first time it is seen.
    pub fn intern(&mut self, gene: &str, residue_pos: u32, previous: &str, new: &str) -> MutationId {
        let key = (
            gene.to_string(),
            residue_pos,
            previous.to_string(),
            new.to_string(),
        );
        if let Some(id) = self.index.get(&key) {
            return *id;
        }
        let id = self.entries.len() as MutationId;
        self.entries.push(Mutation {
            gene: key.0.clone(),
            class: MutationClass::for_gene(gene),
            previous_residue: key.2.clone(),
            new_residue: key.3.clone(),
            residue_pos,
            mutation_id: id,
        });
        self.index.insert(key, id);
        id
    }

    /// Parses a Nextstrain-style label such as `A23403G` and interns it under
    /// `gene` (`nuc` meaning nucleotide).
    pub fn intern_label(&mut self, gene: &str, label: &str) -> Option<MutationId> {
        let gene = if gene == "nuc" { NUCLEOTIDE_GENE } else { gene };
        let caps = MUTATION_LABEL.captures(label.trim())?;
        let previous = caps.get(1).map_or("", |m| m.as_str());
        let position = caps.get(2)?.as_str().parse::<u32>().ok()?;
        let new = caps.get(3).map_or("", |m| m.as_str());
        Some(self.intern(gene, position, previous, new))
    }

    /// Adopts an already numbered table (e.g. from a JSONL header). Ids are
    /// taken from the array position; a repeated descriptor keeps its slot
    /// but lookups resolve to the first occurrence.
    pub fn from_entries(entries: Vec<Mutation>) -> Self {
        let mut table = Self::new();
        for (position, mut m) in entries.into_iter().enumerate() {
            m.mutation_id = position as MutationId;
            let key = (
                m.gene.clone(),
                m.residue_pos,
                m.previous_residue.clone(),
                m.new_residue.clone(),
            );
            if table.index.contains_key(&key) {
                log::warn!("Duplicate mutation {} in table", m.label());
            } else {
                table.index.insert(key, m.mutation_id);
            }
            table.entries.push(m);
        }
        table
    }

    pub fn get(&self, id: MutationId) -> Option<&Mutation> {
        self.entries.get(id as usize)
    }

    pub fn entries(&self) -> &[Mutation] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hydrate(&self, ids: &[MutationId]) -> Vec<Mutation> {
        ids.iter().filter_map(|id| self.get(*id).cloned()).collect()
    }

    /// Sorted gene names, nucleotide sentinel excluded.
    pub fn genes(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|m| !m.is_nucleotide())
            .map(|m| m.gene.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Counts `X>Y` nucleotide substitutions over every node occurrence.
pub fn nucleotide_spectrum<'a>(
    table: &MutationTable,
    node_mutations: impl Iterator<Item = &'a [MutationId]>,
) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for ids in node_mutations {
        for m in ids.iter().filter_map(|id| table.get(*id)) {
            if m.is_nucleotide() {
                *counts
                    .entry(format!("{}>{}", m.previous_residue, m.new_residue))
                    .or_insert(0) += 1;
            }
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_descriptors_share_an_id() {
        let mut table = MutationTable::new();
        let a = table.intern("S", 484, "E", "K");
        let b = table.intern_label("S", "E484K").unwrap();
        let c = table.intern("S", 484, "E", "Q");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(c).unwrap().mutation_id, c);
    }

    #[test]
    fn test_nuc_gene_maps_to_nucleotide_sentinel() {
        let mut table = MutationTable::new();
        let id = table.intern_label("nuc", "C241T").unwrap();
        let m = table.get(id).unwrap();
        assert_eq!(m.gene, "nt");
        assert_eq!(m.class, MutationClass::Nt);
        assert_eq!(m.residue_pos, 241);
        assert!(table.intern_label("nuc", "garbage").is_none());
    }

    #[test]
    fn test_genes_and_spectrum() {
        let mut table = MutationTable::new();
        let n1 = table.intern("nt", 1, "C", "T");
        let n2 = table.intern("nt", 2, "A", "G");
        let s = table.intern("S", 5, "D", "G");
        let orf = table.intern("ORF1a", 9, "T", "I");
        assert_eq!(table.genes(), vec!["ORF1a".to_string(), "S".to_string()]);
        let nodes: Vec<Vec<MutationId>> = vec![vec![n1, s], vec![n1, n2, orf]];
        let spectrum = nucleotide_spectrum(&table, nodes.iter().map(|v| v.as_slice()));
        assert_eq!(spectrum.get("C>T"), Some(&2));
        assert_eq!(spectrum.get("A>G"), Some(&1));
        assert_eq!(spectrum.len(), 2);
    }
}
