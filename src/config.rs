//! The read-only dataset description handed to the rendering layer, and the
//! ordered merge of config overlays.

use crate::error::EngineResult;
use crate::metadata::META_PREFIX;
use crate::node_store::Dataset;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use taxonium_protocol::{ColorBy, Config, SearchType, XType};

fn capitalise(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// `meta_country` -> `Country`, `name` -> `Name`.
pub fn pretty_name(key: &str) -> String {
    capitalise(key.strip_prefix(META_PREFIX).unwrap_or(key))
}

fn search_method(key: &str) -> &'static str {
    match key {
        "mutation" => "mutation",
        "revertant" => "revertant",
        "genbank" => "text_per_line",
        "meta_Lineage" => "text_exact",
        _ => "text_match",
    }
}

pub fn generate_config(dataset: &Dataset) -> Config {
    let store = &dataset.store;
    let extent = store.extent();
    let keys_to_display = store.metadata_keys();
    let mut x_accessors = Vec::new();
    if store.has_distance() || !store.has_time() {
        x_accessors.push(XType::Distance.accessor().to_string());
    }
    if store.has_time() {
        x_accessors.push(XType::Time.accessor().to_string());
    }
    let search_types = std::iter::once("name")
        .chain(keys_to_display.iter().map(String::as_str))
        .chain(["mutation", "revertant"])
        .map(|key| SearchType {
            name: key.to_string(),
            label: pretty_name(key),
            method: search_method(key).to_string(),
        })
        .collect();
    let color_by_options: Vec<String> = keys_to_display
        .iter()
        .cloned()
        .chain(std::iter::once("genotype".to_string()))
        .collect();
    let pretty_color_by_options: BTreeMap<String, String> = color_by_options
        .iter()
        .map(|key| (key.clone(), pretty_name(key)))
        .collect();
    Config {
        num_nodes: store.len(),
        num_tips: store.num_tips(),
        initial_x: (extent.min_x + extent.max_x) / 2.0,
        initial_y: (extent.min_y + extent.max_y) / 2.0,
        initial_zoom: -3.0,
        genes: dataset.mutations.genes(),
        root_id: store.root(),
        root_mutations: dataset.root_mutations(),
        name_accessor: "name".to_string(),
        x_accessors,
        keys_to_display,
        search_types,
        color_by: ColorBy {
            color_by_options,
            pretty_color_by_options,
        },
        mutations: dataset.mutations.entries().to_vec(),
        use_hydrated_mutations: dataset.use_hydrated_mutations,
    }
}

/// Applies `overlays` to `base` in order. Later overlays replace earlier
/// values key by key at the top level; `null` values are skipped.
pub fn merge_overlays(base: Map<String, Value>, overlays: &[&Map<String, Value>]) -> Map<String, Value> {
    let mut merged = base;
    for overlay in overlays {
        for (key, value) in overlay.iter() {
            if !value.is_null() {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}

/// The generated config with the dataset's own overrides and then any
/// caller-supplied overlays applied on top.
pub fn resolved_config(dataset: &Dataset, overlays: &[&Map<String, Value>]) -> EngineResult<Map<String, Value>> {
    let base = match serde_json::to_value(generate_config(dataset))? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    let mut layers: Vec<&Map<String, Value>> = vec![&dataset.overwrite_config];
    layers.extend_from_slice(overlays);
    Ok(merge_overlays(base, &layers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::tests::dataset;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn test_generated_config() {
        let data = dataset();
        let config = generate_config(&data);
        assert_eq!(config.num_nodes, 7);
        assert_eq!(config.num_tips, 4);
        assert_eq!(config.root_id, 3);
        assert_eq!(config.initial_y, 3.0);
        assert_eq!(config.initial_zoom, -3.0);
        assert_eq!(config.genes, vec!["S".to_string()]);
        assert_eq!(config.root_mutations.len(), 1);
        assert_eq!(config.x_accessors, vec!["x_dist".to_string()]);
        assert_eq!(config.keys_to_display, vec!["meta_Lineage", "meta_age"]);
        let methods: Vec<(&str, &str)> = config
            .search_types
            .iter()
            .map(|t| (t.name.as_str(), t.method.as_str()))
            .collect();
        assert_eq!(
            methods,
            vec![
                ("name", "text_match"),
                ("meta_Lineage", "text_exact"),
                ("meta_age", "text_match"),
                ("mutation", "mutation"),
                ("revertant", "revertant"),
            ]
        );
        assert_eq!(config.search_types[2].label, "Age");
        assert_eq!(config.color_by.color_by_options.last().unwrap(), "genotype");
        assert_eq!(config.color_by.pretty_color_by_options["meta_Lineage"], "Lineage");
    }

    #[test]
    fn test_overlays_apply_in_order() {
        let base = object(json!({"title": "default", "num_nodes": 7, "colorBy": {"a": 1}}));
        let file = object(json!({"title": "from file", "overlay": "<p>x</p>"}));
        let query = object(json!({"title": "from query", "overlay": null}));
        let merged = merge_overlays(base, &[&file, &query]);
        assert_eq!(merged["title"], json!("from query"));
        assert_eq!(merged["overlay"], json!("<p>x</p>"));
        assert_eq!(merged["num_nodes"], json!(7));
    }

    #[test]
    fn test_dataset_overrides_generated_values() {
        let mut data = dataset();
        data.overwrite_config = object(json!({"title": "tiny", "initial_zoom": 1}));
        let ui = object(json!({"title": "mine"}));
        let config = resolved_config(&data, &[&ui]).unwrap();
        assert_eq!(config["initial_zoom"], json!(1));
        assert_eq!(config["title"], json!("mine"));
        assert_eq!(config["rootId"], json!(3));
    }
}
