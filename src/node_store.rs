//! The canonical, y-sorted node array of an ingested dataset.

use crate::error::{EngineError, EngineResult};
use crate::mutation::MutationTable;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;
use taxonium_protocol::{MetaValue, MutationId, NodeId, NodeMutations, NodeRecord, XType};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    pub name: String,
    /// Equal to the node's own index for the root.
    pub parent_id: NodeId,
    pub x_dist: Option<f64>,
    pub x_time: Option<f64>,
    pub y: f64,
    pub num_tips: usize,
    pub is_tip: bool,
    pub mutations: Vec<MutationId>,
    pub metadata: BTreeMap<String, MetaValue>,
}

impl Node {
    pub fn x(&self, x_type: XType) -> Option<f64> {
        match x_type {
            XType::Distance => self.x_dist,
            XType::Time => self.x_time.or(self.x_dist),
        }
    }

    /// Looks up a field by its wire name.
    pub fn field(&self, key: &str) -> Option<MetaValue> {
        match key {
            "name" => Some(MetaValue::Text(self.name.clone())),
            "num_tips" => Some(MetaValue::Number(self.num_tips as f64)),
            "x_dist" => self.x_dist.map(MetaValue::Number),
            "x_time" => self.x_time.map(MetaValue::Number),
            "y" => Some(MetaValue::Number(self.y)),
            "parent_id" => Some(MetaValue::Number(self.parent_id as f64)),
            _ => self.metadata.get(key).cloned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extent {
    pub min_x: f64,
    pub max_x: f64,
    pub min_x_time: f64,
    pub max_x_time: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl Extent {
    pub fn x(&self, x_type: XType) -> (f64, f64) {
        match x_type {
            XType::Distance => (self.min_x, self.max_x),
            XType::Time => (self.min_x_time, self.max_x_time),
        }
    }

    fn of(nodes: &[Node]) -> Self {
        fn range(values: impl Iterator<Item = f64>) -> (f64, f64) {
            values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(v), hi.max(v))
            })
        }
        let (min_x, max_x) = range(nodes.iter().filter_map(|n| n.x_dist));
        let (min_x_time, max_x_time) = range(nodes.iter().filter_map(|n| n.x(XType::Time)));
        let (min_y, max_y) = range(nodes.iter().map(|n| n.y));
        let finite = |v: f64| if v.is_finite() { v } else { 0.0 };
        Self {
            min_x: finite(min_x),
            max_x: finite(max_x),
            min_x_time: finite(min_x_time),
            max_x_time: finite(max_x_time),
            min_y: finite(min_y),
            max_y: finite(max_y),
        }
    }
}

#[derive(Debug)]
pub struct NodeStore {
    nodes: Vec<Node>,
    y_positions: Vec<f64>,
    root: NodeId,
    extent: Extent,
    children: OnceLock<Vec<Vec<NodeId>>>,
}

impl NodeStore {
    /// Takes ownership of nodes that are already sorted by `y` and whose ids
    /// equal their index.
    pub fn new(nodes: Vec<Node>) -> EngineResult<Self> {
        if nodes.is_empty() {
            return Err(EngineError::invalid("Tree contains no nodes"));
        }
        if nodes.windows(2).any(|w| w[0].y > w[1].y) {
            return Err(EngineError::invalid("Nodes are not sorted by y"));
        }
        let root = nodes
            .iter()
            .enumerate()
            .find(|(i, n)| n.parent_id == *i)
            .map(|(i, _)| i)
            .ok_or_else(|| EngineError::invalid("Tree has no root node"))?;
        let y_positions = nodes.iter().map(|n| n.y).collect();
        let extent = Extent::of(&nodes);
        Ok(Self {
            nodes,
            y_positions,
            root,
            extent,
            children: OnceLock::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn y_positions(&self) -> &[f64] {
        &self.y_positions
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn extent(&self) -> &Extent {
        &self.extent
    }

    pub fn num_tips(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_tip).count()
    }

    pub fn has_time(&self) -> bool {
        self.nodes.iter().any(|n| n.x_time.is_some())
    }

    pub fn has_distance(&self) -> bool {
        self.nodes.iter().any(|n| n.x_dist.is_some())
    }

    /// Child lists in id order, built on first use.
    pub fn children(&self) -> &[Vec<NodeId>] {
        self.children.get_or_init(|| {
            let mut children = vec![Vec::new(); self.nodes.len()];
            for (id, node) in self.nodes.iter().enumerate() {
                if node.parent_id == id {
                    continue;
                }
                match children.get_mut(node.parent_id) {
                    Some(list) => list.push(id),
                    None => log::warn!("Node {id} refers to missing parent {}", node.parent_id),
                }
            }
            children
        })
    }

    /// The node and all its descendants, parents before children.
    pub fn preorder(&self, from: NodeId) -> Vec<NodeId> {
        let children = self.children();
        let mut order = Vec::new();
        if from >= self.nodes.len() {
            return order;
        }
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(children[id].iter().rev());
        }
        order
    }

    /// Values of `key` on every tip below `id`, in pre-order.
    pub fn tip_attributes(&self, id: NodeId, key: &str) -> Vec<Option<MetaValue>> {
        let children = self.children();
        self.preorder(id)
            .into_iter()
            .filter(|n| children[*n].is_empty())
            .map(|n| self.nodes[n].field(key))
            .collect()
    }

    /// Parent of `id`, or `None` for the root. A dangling parent reference
    /// is logged and treated as a root.
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        let node = self.nodes.get(id)?;
        if node.parent_id == id {
            return None;
        }
        if node.parent_id >= self.nodes.len() {
            log::warn!("Node {id} refers to missing parent {}", node.parent_id);
            return None;
        }
        Some(node.parent_id)
    }

    /// Ancestors of `id` from its parent up to the root.
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut current = id;
        while let Some(parent) = self.parent(current) {
            if !seen.insert(parent) {
                log::warn!("Cycle in parent chain of node {id}");
                break;
            }
            out.push(parent);
            current = parent;
        }
        out
    }

    /// The wire form of a node, with mutations as ids or hydrated records.
    pub fn record(&self, id: NodeId, table: Option<&MutationTable>) -> Option<NodeRecord> {
        let node = self.nodes.get(id)?;
        let mutations = match table {
            Some(table) => NodeMutations::Hydrated(table.hydrate(&node.mutations)),
            None => NodeMutations::Ids(node.mutations.clone()),
        };
        Some(NodeRecord {
            node_id: id,
            parent_id: node.parent_id,
            name: node.name.clone(),
            x_dist: node.x_dist,
            x_time: node.x_time,
            y: node.y,
            num_tips: node.num_tips,
            is_tip: node.is_tip,
            mutations,
            metadata: node.metadata.clone(),
        })
    }

    pub fn records(&self, ids: &[NodeId], table: Option<&MutationTable>) -> Vec<NodeRecord> {
        ids.iter().filter_map(|id| self.record(*id, table)).collect()
    }

    /// Metadata keys present on any node, sorted.
    pub fn metadata_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .nodes
            .iter()
            .flat_map(|n| n.metadata.keys())
            .collect::<HashSet<_>>()
            .into_iter()
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

/// Everything produced by one ingestion.
#[derive(Debug)]
pub struct Dataset {
    pub store: NodeStore,
    pub mutations: MutationTable,
    pub reference: BTreeMap<String, String>,
    /// Config entries from the input that override generated defaults.
    pub overwrite_config: Map<String, Value>,
    pub use_hydrated_mutations: bool,
    /// Changes whenever a new dataset replaces the old one.
    pub generation: u64,
}

impl Dataset {
    pub fn mutation_table_for_records(&self) -> Option<&MutationTable> {
        self.use_hydrated_mutations.then_some(&self.mutations)
    }

    pub fn root_mutations(&self) -> Vec<MutationId> {
        self.store
            .get(self.store.root())
            .map(|n| n.mutations.clone())
            .unwrap_or_default()
    }
}
