//! Delimited metadata tables joined onto nodes by taxon name.

use crate::error::{EngineError, EngineResult};
use crate::node_store::Node;
use crate::source::FileType;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use taxonium_protocol::MetaValue;

pub const META_PREFIX: &str = "meta_";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataTable {
    pub headers: Vec<String>,
    pub rows: HashMap<String, BTreeMap<String, MetaValue>>,
}

impl MetadataTable {
    /// `meta_`-prefixed names of every column after the first.
    pub fn attribute_keys(&self) -> Vec<String> {
        self.headers
            .iter()
            .skip(1)
            .map(|h| format!("{META_PREFIX}{h}"))
            .collect()
    }
}

/// Parses a CSV or TSV table. The taxon name is read from `taxon_column`
/// (the first column by default); the attributes are every column after
/// the first, prefixed with `meta_`.
pub fn parse_metadata(
    text: &str,
    file_type: FileType,
    taxon_column: Option<&str>,
    on_progress: &mut dyn FnMut(usize),
) -> EngineResult<MetadataTable> {
    let mut builder = csv::ReaderBuilder::new();
    builder.flexible(true).has_headers(true);
    match file_type {
        FileType::MetaTsv => builder.delimiter(b'\t').quoting(false),
        FileType::MetaCsv => builder.delimiter(b','),
        other => {
            return Err(EngineError::unsupported(format!(
                "{other:?} is not a metadata table type"
            )));
        }
    };
    let mut reader = builder.from_reader(text.as_bytes());
    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    let taxon_index = match taxon_column {
        Some(column) if !column.is_empty() => headers
            .iter()
            .position(|h| h == column)
            .ok_or_else(|| {
                EngineError::invalid(format!("Taxon column '{column}' not found in metadata"))
            })?,
        _ => 0,
    };

    let mut rows = HashMap::new();
    for (i, record) in reader.records().enumerate() {
        let record = record?;
        if i % 10_000 == 0 {
            on_progress(i);
        }
        let Some(name) = record.get(taxon_index) else {
            continue;
        };
        let attributes = headers
            .iter()
            .zip(record.iter())
            .skip(1)
            .map(|(header, value)| {
                (
                    format!("{META_PREFIX}{header}"),
                    MetaValue::Text(value.to_string()),
                )
            })
            .collect();
        rows.insert(name.to_string(), attributes);
    }
    log::info!("Read metadata for {} taxa", rows.len());
    Ok(MetadataTable { headers, rows })
}

/// Gives every node the same attribute shape: keys missing on a node are
/// filled with an empty string, then the node's row (if any) is applied.
pub fn join_metadata(nodes: &mut [Node], table: Option<&MetadataTable>) {
    let mut blanks: BTreeSet<String> = table
        .map(MetadataTable::attribute_keys)
        .unwrap_or_default()
        .into_iter()
        .collect();
    for node in nodes.iter() {
        blanks.extend(
            node.metadata
                .keys()
                .filter(|k| k.starts_with(META_PREFIX))
                .cloned(),
        );
    }
    let mut matched = 0usize;
    for node in nodes.iter_mut() {
        for key in &blanks {
            node.metadata
                .entry(key.clone())
                .or_insert_with(MetaValue::blank);
        }
        if let Some(row) = table.and_then(|t| t.rows.get(&node.name)) {
            matched += 1;
            node.metadata
                .extend(row.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }
    if table.is_some() {
        log::info!("Matched metadata rows to {matched} of {} nodes", nodes.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(name: &str) -> Node {
        Node {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_tsv_and_join_backfills_blanks() {
        let table = parse_metadata(
            "strain\tcountry\tlineage\nA\tUK\tB.1\nC\tPeru\t\"P.1\"\n",
            FileType::MetaTsv,
            None,
            &mut |_| {},
        )
        .unwrap();
        assert_eq!(table.attribute_keys(), vec!["meta_country", "meta_lineage"]);
        let mut nodes = vec![named("A"), named("B"), named("C")];
        nodes[1]
            .metadata
            .insert("meta_clade".to_string(), MetaValue::from("20A"));
        join_metadata(&mut nodes, Some(&table));

        assert_eq!(nodes[0].metadata["meta_country"], MetaValue::from("UK"));
        assert_eq!(nodes[0].metadata["meta_clade"], MetaValue::blank());
        assert_eq!(nodes[1].metadata["meta_country"], MetaValue::blank());
        assert_eq!(nodes[1].metadata["meta_clade"], MetaValue::from("20A"));
        // quoting is off for TSV, so quotes survive
        assert_eq!(nodes[2].metadata["meta_lineage"], MetaValue::from("\"P.1\""));
        assert!(nodes.iter().all(|n| n.metadata.len() == 3));
    }

    #[test]
    fn test_csv_with_taxon_column() {
        let table = parse_metadata(
            "id,name,\"location, full\"\n1,A,\"London, UK\"\n2,B\n",
            FileType::MetaCsv,
            Some("name"),
            &mut |_| {},
        )
        .unwrap();
        let a = &table.rows["A"];
        assert_eq!(a["meta_name"], MetaValue::from("A"));
        assert_eq!(a["meta_location, full"], MetaValue::from("London, UK"));
        assert_eq!(table.rows["B"].len(), 1);
    }

    #[test]
    fn test_missing_taxon_column_is_error() {
        let err = parse_metadata("a,b\n1,2\n", FileType::MetaCsv, Some("strain"), &mut |_| {})
            .unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::InvalidInput);
        assert!(parse_metadata("a\n", FileType::Nwk, None, &mut |_| {}).is_err());
    }
}
