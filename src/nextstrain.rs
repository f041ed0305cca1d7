//! Nextstrain (auspice v2) JSON tree reader.

use crate::error::{EngineError, EngineResult};
use crate::mutation::MutationTable;
use crate::tree::{ParsedTree, TreeNode};
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use taxonium_protocol::{MetaValue, MutationId, NUCLEOTIDE_GENE};

const NOT_METADATA: [&str; 2] = ["div", "num_date"];

lazy_static! {
    static ref MARKDOWN_LINK: Regex = Regex::new(r"\[([^\]]+)\]\(([^)]+)\)")
        .unwrap_or_else(|e| panic!("invalid markdown link pattern: {e}"));
}

fn scalar_meta(value: &Value) -> Option<MetaValue> {
    match value {
        Value::String(s) => Some(MetaValue::Text(s.clone())),
        Value::Number(n) => n.as_f64().map(MetaValue::Number),
        Value::Bool(b) => Some(MetaValue::Flag(*b)),
        _ => None,
    }
}

/// Attributes are usually wrapped as `{"value": ...}` but not always.
fn attribute_value(attr: &Value) -> MetaValue {
    attr.get("value")
        .and_then(scalar_meta)
        .or_else(|| scalar_meta(attr))
        .unwrap_or_else(MetaValue::blank)
}

fn branch_mutations(node: &Value, table: &mut MutationTable) -> Vec<MutationId> {
    let Some(groups) = node
        .get("branch_attrs")
        .and_then(|b| b.get("mutations"))
        .and_then(Value::as_object)
    else {
        return vec![];
    };
    // Nucleotide changes first, then genes by name.
    let ordered = groups
        .iter()
        .sorted_by_key(|(gene, _)| gene.as_str() != "nuc");
    let mut ids = Vec::new();
    for (gene, labels) in ordered {
        for label in labels.as_array().into_iter().flatten().filter_map(Value::as_str) {
            match table.intern_label(gene, label) {
                Some(id) if !ids.contains(&id) => ids.push(id),
                Some(_) => {}
                None => log::warn!("Skipping unparseable mutation '{label}' in gene {gene}"),
            }
        }
    }
    ids
}

fn parse_node(json: &Value, table: &mut MutationTable) -> (TreeNode, Option<f64>, Option<f64>) {
    let attrs = json.get("node_attrs").and_then(Value::as_object);
    let div = attrs.and_then(|a| a.get("div")).and_then(Value::as_f64);
    let time = attrs
        .and_then(|a| a.get("num_date"))
        .and_then(|d| d.get("value"))
        .and_then(Value::as_f64);
    let mut metadata = BTreeMap::new();
    for (key, attr) in attrs.into_iter().flatten() {
        if !NOT_METADATA.contains(&key.as_str()) {
            metadata.insert(format!("meta_{key}"), attribute_value(attr));
        }
    }
    let node = TreeNode {
        name: json
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .replace('\'', ""),
        mutations: branch_mutations(json, table),
        metadata,
        ..Default::default()
    };
    (node, div, time)
}

fn markdown_to_html(markdown: &str) -> String {
    MARKDOWN_LINK
        .replace_all(markdown, r#"<a class="underline" href="$2">$1</a>"#)
        .into_owned()
}

fn names_of(meta: &Value, key: &str) -> Vec<String> {
    meta.get(key)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.get("name").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

/// Title, provenance and an HTML overlay derived from the `meta` block.
pub fn meta_overlay(meta: &Value) -> Map<String, Value> {
    let mut config = Map::new();
    if let Some(title) = meta.get("title") {
        config.insert("title".to_string(), title.clone());
    }
    let mut source = names_of(meta, "data_provenance").join(" & ");
    if source.contains("GISAID") {
        config.insert("enabled_by_gisaid".to_string(), Value::Bool(true));
    }
    let mut overlay = "<p>This is a tree extracted from a <a class='underline' href='//nextstrain.org'>Nextstrain</a> JSON file, being visualised in Taxonium.</p>".to_string();
    if let Some(description) = meta.get("description").and_then(Value::as_str) {
        overlay.push_str(&format!("<p>{}</p>", markdown_to_html(description)));
    }
    if let Some(updated) = meta.get("updated").and_then(Value::as_str) {
        source.push_str(&format!(" in a tree built on {updated}"));
    }
    let maintainers = names_of(meta, "maintainers");
    if !maintainers.is_empty() {
        source.push_str(&format!(
            " in a build maintained by {}",
            maintainers.join(" & ")
        ));
        let links = meta
            .get("maintainers")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .map(|m| {
                format!(
                    "<a class='underline' href='{}'>{}</a>",
                    m.get("url").and_then(Value::as_str).unwrap_or_default(),
                    m.get("name").and_then(Value::as_str).unwrap_or_default()
                )
            })
            .join(" & ");
        overlay.push_str(&format!("<p>The Nextstrain build is maintained by {links}.</p>"));
    }
    if let Some(url) = meta.get("build_url").and_then(Value::as_str) {
        overlay.push_str(&format!(
            "<p>The Nextstrain build is available <a class='underline' href='{url}'>here</a>.</p>"
        ));
    }
    config.insert("source".to_string(), Value::String(source));
    config.insert("overlay".to_string(), Value::String(overlay));
    config
}

fn root_sequence(document: &Value) -> BTreeMap<String, String> {
    document
        .get("root_sequence")
        .and_then(Value::as_object)
        .into_iter()
        .flatten()
        .filter_map(|(gene, seq)| {
            let gene = if gene == "nuc" { NUCLEOTIDE_GENE } else { gene.as_str() };
            Some((gene.to_string(), seq.as_str()?.to_string()))
        })
        .collect()
}

/// Builds a parsed tree from a Nextstrain document. The traversal uses an
/// explicit stack and keeps the document's child order.
pub fn parse_nextstrain(text: &str) -> EngineResult<ParsedTree> {
    let document: Value = serde_json::from_str(text)?;
    let root_json = document
        .get("tree")
        .ok_or_else(|| EngineError::invalid("Nextstrain JSON has no 'tree' entry"))?;

    let mut tree = ParsedTree::default();
    let mut positions: Vec<(Option<f64>, Option<f64>)> = Vec::new();
    let mut stack: Vec<(&Value, Option<usize>)> = vec![(root_json, None)];
    while let Some((json, parent)) = stack.pop() {
        let (node, div, time) = parse_node(json, &mut tree.mutations);
        let id = match parent {
            Some(parent) => tree.add_child(parent, node),
            None => {
                tree.nodes.push(node);
                tree.nodes.len() - 1
            }
        };
        let (branch_length, time_length) = match parent {
            Some(parent) => {
                let (parent_div, parent_time) = positions[parent];
                (
                    div.zip(parent_div).map(|(d, p)| d - p),
                    time.zip(parent_time).map(|(t, p)| t - p),
                )
            }
            None => (div.map(|_| 0.0), time.map(|_| 0.0)),
        };
        tree.nodes[id].branch_length = branch_length;
        tree.nodes[id].time_length = time_length;
        positions.push((div, time));

        match json.get("children").and_then(Value::as_array) {
            Some(children) if !children.is_empty() => {
                for child in children.iter().rev() {
                    stack.push((child, Some(id)));
                }
            }
            _ => tree.n_tips += 1,
        }
    }

    tree.root = 0;
    tree.reference = root_sequence(&document);
    if let Some(meta) = document.get("meta") {
        tree.overlay = meta_overlay(meta);
    }
    log::debug!(
        "Parsed Nextstrain tree with {} nodes, {} tips and {} distinct mutations",
        tree.len(),
        tree.n_tips,
        tree.mutations.len()
    );
    Ok(tree)
}
