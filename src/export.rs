//! Nextstrain v2 export of a subtree.

use crate::error::{EngineError, EngineResult, ErrorCode};
use crate::metadata::META_PREFIX;
use crate::node_store::Dataset;
use itertools::Itertools;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use taxonium_protocol::NodeId;

fn branch_mutations(dataset: &Dataset, id: NodeId) -> Map<String, Value> {
    let node = &dataset.store.nodes()[id];
    node.mutations
        .iter()
        .filter_map(|m| dataset.mutations.get(*m))
        .map(|m| {
            let gene = if m.is_nucleotide() { "nuc" } else { m.gene.as_str() };
            (
                gene.to_string(),
                format!("{}{}{}", m.previous_residue, m.residue_pos, m.new_residue),
            )
        })
        .into_group_map()
        .into_iter()
        .map(|(gene, labels)| (gene, json!(labels)))
        .collect()
}

fn node_json(dataset: &Dataset, id: NodeId, origin: f64, children: Vec<Value>) -> Value {
    let node = &dataset.store.nodes()[id];
    let mut attrs: Map<String, Value> = node
        .metadata
        .iter()
        .filter_map(|(key, value)| {
            let name = key.strip_prefix(META_PREFIX)?;
            Some((name.to_string(), json!({ "value": value })))
        })
        .collect();
    if let Some(x) = node.x_dist {
        attrs.insert("div".to_string(), json!(x - origin));
    }
    let mut out = Map::new();
    out.insert("name".to_string(), json!(node.name));
    out.insert("node_id".to_string(), json!(id));
    out.insert("node_attrs".to_string(), Value::Object(attrs));
    let mutations = branch_mutations(dataset, id);
    if !mutations.is_empty() {
        out.insert("branch_attrs".to_string(), json!({ "mutations": mutations }));
    }
    if !children.is_empty() {
        out.insert("children".to_string(), Value::Array(children));
    }
    Value::Object(out)
}

/// The subtree below `root_id` as a Nextstrain v2 document. Keys of
/// `meta_overrides` replace the default `meta` entries.
pub fn nextstrain_subtree(
    dataset: &Dataset,
    root_id: NodeId,
    meta_overrides: Option<&Value>,
) -> EngineResult<Value> {
    let store = &dataset.store;
    let root = store
        .get(root_id)
        .ok_or_else(|| EngineError::not_found(format!("Node {root_id} does not exist")))?;
    let origin = root.x_dist.unwrap_or(0.0);
    let order = store.preorder(root_id);
    let children = store.children();
    let mut built: HashMap<NodeId, Value> = HashMap::with_capacity(order.len());
    for &id in order.iter().rev() {
        let kids = children[id]
            .iter()
            .filter_map(|child| built.remove(child))
            .collect();
        built.insert(id, node_json(dataset, id, origin, kids));
    }
    let tree = built
        .remove(&root_id)
        .ok_or_else(|| EngineError::new(ErrorCode::Internal, "Export lost its root node"))?;

    let mut meta = Map::new();
    meta.insert("description".to_string(), json!("JSON exported from Taxonium."));
    meta.insert("panels".to_string(), json!(["tree"]));
    meta.insert("title".to_string(), json!("Taxonium JSON"));
    if let Some(Value::Object(overrides)) = meta_overrides {
        meta.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    log::info!("Exported {} nodes below node {root_id}", order.len());
    Ok(json!({ "meta": Value::Object(meta), "tree": tree, "version": "v2" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::tests::dataset;

    #[test]
    fn test_subtree_export() {
        let data = dataset();
        let doc = nextstrain_subtree(&data, 5, None).unwrap();
        assert_eq!(doc["version"], json!("v2"));
        assert_eq!(doc["meta"]["title"], json!("Taxonium JSON"));
        let tree = &doc["tree"];
        assert_eq!(tree["node_id"], json!(5));
        assert_eq!(tree["node_attrs"]["div"], json!(0.0));
        assert_eq!(tree["branch_attrs"]["mutations"]["S"], json!(["E484K"]));
        let children = tree["children"].as_array().unwrap();
        let names: Vec<&str> = children.iter().map(|c| c["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["C", "D"]);
        assert_eq!(children[0]["node_attrs"]["Lineage"], json!({"value": "P.1"}));
        assert_eq!(children[0]["node_attrs"]["age"], json!({"value": "42"}));
        assert_eq!(children[0]["node_attrs"]["div"], json!(1.0));
        assert!(children[0].get("children").is_none());
    }

    #[test]
    fn test_root_export_and_meta_overrides() {
        let data = dataset();
        let overrides = json!({"title": "My subtree"});
        let doc = nextstrain_subtree(&data, 3, Some(&overrides)).unwrap();
        assert_eq!(doc["meta"]["title"], json!("My subtree"));
        assert_eq!(doc["meta"]["panels"], json!(["tree"]));
        assert_eq!(doc["tree"]["branch_attrs"]["mutations"]["nuc"], json!(["C241T"]));
        assert_eq!(doc["tree"]["children"].as_array().unwrap().len(), 2);
        assert!(nextstrain_subtree(&data, 99, None).is_err());
    }
}
