//! Reader for pre-laid-out Taxonium JSONL files: one header object followed
//! by one node object per line.

use crate::error::{EngineError, EngineResult};
use crate::mutation::MutationTable;
use crate::node_store::Node;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use taxonium_protocol::{MetaValue, Mutation, MutationClass, MutationId, NodeId};

const NODE_FIELDS: [&str; 11] = [
    "name",
    "x_dist",
    "x_time",
    "y",
    "mutations",
    "parent_id",
    "node_id",
    "num_tips",
    "is_tip",
    "child_nodes",
    "clades",
];

#[derive(Debug, Deserialize)]
struct HeaderMutation {
    gene: String,
    #[serde(default)]
    previous_residue: String,
    #[serde(default)]
    new_residue: String,
    residue_pos: u32,
    #[serde(default)]
    mutation_id: Option<MutationId>,
}

#[derive(Debug, Default, Deserialize)]
struct Header {
    #[serde(default)]
    mutations: Vec<Option<HeaderMutation>>,
    #[serde(default)]
    total_nodes: Option<usize>,
    #[serde(default)]
    config: Map<String, Value>,
}

#[derive(Debug)]
pub struct JsonlTree {
    pub nodes: Vec<Node>,
    pub mutations: MutationTable,
    pub config: Map<String, Value>,
}

fn scalar(value: &Value) -> Option<MetaValue> {
    match value {
        Value::String(s) => Some(MetaValue::Text(s.clone())),
        Value::Number(n) => n.as_f64().map(MetaValue::Number),
        Value::Bool(b) => Some(MetaValue::Flag(*b)),
        _ => None,
    }
}

fn mutation_table(header: Header) -> (MutationTable, HashMap<MutationId, MutationId>) {
    let mut entries = Vec::new();
    let mut remap = HashMap::new();
    for (position, entry) in header.mutations.into_iter().enumerate() {
        let Some(m) = entry else {
            continue;
        };
        let id = entries.len() as MutationId;
        remap.insert(m.mutation_id.unwrap_or(position as MutationId), id);
        entries.push(Mutation {
            class: MutationClass::for_gene(&m.gene),
            gene: m.gene,
            previous_residue: m.previous_residue,
            new_residue: m.new_residue,
            residue_pos: m.residue_pos,
            mutation_id: id,
        });
    }
    (MutationTable::from_entries(entries), remap)
}

fn read_node(
    line_no: usize,
    value: &Value,
    remap: &HashMap<MutationId, MutationId>,
) -> EngineResult<(NodeId, NodeId, Node)> {
    let object = value
        .as_object()
        .ok_or_else(|| EngineError::invalid(format!("Line {line_no} is not a JSON object")))?;
    let id_field = |key: &str| {
        object
            .get(key)
            .and_then(Value::as_u64)
            .map(|v| v as NodeId)
            .ok_or_else(|| EngineError::invalid(format!("Line {line_no} has no numeric '{key}'")))
    };
    let node_id = id_field("node_id")?;
    let parent_id = id_field("parent_id")?;
    let y = object
        .get("y")
        .and_then(Value::as_f64)
        .ok_or_else(|| EngineError::invalid(format!("Line {line_no} has no numeric 'y'")))?;
    let mutations = object
        .get("mutations")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_u64)
        .filter_map(|id| remap.get(&(id as MutationId)).copied())
        .collect();
    let metadata: BTreeMap<String, MetaValue> = object
        .iter()
        .filter(|(key, _)| !NODE_FIELDS.contains(&key.as_str()))
        .filter_map(|(key, value)| Some((key.clone(), scalar(value)?)))
        .collect();
    let has_children = object
        .get("child_nodes")
        .and_then(Value::as_array)
        .is_some_and(|c| !c.is_empty());
    let num_tips = object.get("num_tips").and_then(Value::as_u64).unwrap_or(1) as usize;
    let node = Node {
        name: object
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        parent_id,
        x_dist: object.get("x_dist").and_then(Value::as_f64),
        x_time: object.get("x_time").and_then(Value::as_f64),
        y,
        num_tips,
        is_tip: object
            .get("is_tip")
            .and_then(Value::as_bool)
            .unwrap_or(!has_children && num_tips == 1),
        mutations,
        metadata,
    };
    Ok((node_id, parent_id, node))
}

/// Parses a JSONL document. Nodes are re-sorted by `y` when needed and
/// their ids renumbered to match the array index.
pub fn parse_jsonl(
    text: &str,
    on_progress: &mut dyn FnMut(usize, Option<usize>),
) -> EngineResult<JsonlTree> {
    let mut lines = text
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty());
    let (_, header_line) = lines
        .next()
        .ok_or_else(|| EngineError::invalid("JSONL input is empty"))?;
    let header: Header = serde_json::from_str(header_line)
        .map_err(|e| EngineError::invalid(format!("Could not parse JSONL header: {e}")))?;
    let total = header.total_nodes;
    let config = header.config.clone();
    let (mutations, remap) = mutation_table(header);

    let mut raw: Vec<(NodeId, NodeId, Node)> = Vec::with_capacity(total.unwrap_or(0));
    for (index, line) in lines {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| EngineError::invalid(format!("Line {}: {e}", index + 1)))?;
        raw.push(read_node(index + 1, &value, &remap)?);
        if raw.len() % 10_000 == 0 {
            on_progress(raw.len(), total);
        }
    }
    if let Some(expected) = total {
        if expected != raw.len() {
            log::warn!("JSONL header announced {expected} nodes, found {}", raw.len());
        }
    }

    raw.sort_by(|a, b| a.2.y.total_cmp(&b.2.y));
    let new_index: HashMap<NodeId, NodeId> = raw
        .iter()
        .enumerate()
        .map(|(new, (old, _, _))| (*old, new))
        .collect();
    let nodes = raw
        .into_iter()
        .enumerate()
        .map(|(new, (old, parent, mut node))| {
            node.parent_id = if parent == old {
                new
            } else {
                new_index.get(&parent).copied().unwrap_or_else(|| {
                    log::warn!("Node {old} refers to missing parent {parent}");
                    new
                })
            };
            node
        })
        .collect();
    on_progress(total.unwrap_or(0), total);
    Ok(JsonlTree {
        nodes,
        mutations,
        config,
    })
}
