//! Parsed, not yet laid out, tree representation shared by all input
//! formats. Nodes live in an arena and refer to each other by index.

use crate::mutation::MutationTable;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use taxonium_protocol::{MetaValue, MutationId};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreeNode {
    pub name: String,
    /// Raw bracketed comment, if any, brackets included.
    pub comment: Option<String>,
    /// Genetic distance to the parent; `None` when absent or negative.
    pub branch_length: Option<f64>,
    /// Time elapsed since the parent; `None` when absent.
    pub time_length: Option<f64>,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    pub mutations: Vec<MutationId>,
    pub metadata: BTreeMap<String, MetaValue>,
}

impl TreeNode {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Parser diagnostics accumulated as a bit field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseFlags(pub u8);

impl ParseFlags {
    pub const MISSING_LEFT: u8 = 0x1;
    pub const MISSING_RIGHT: u8 = 0x2;
    pub const UNPAIRED_BRACKET: u8 = 0x4;

    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }

    pub fn contains(self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    pub fn is_clean(self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParsedTree {
    pub nodes: Vec<TreeNode>,
    pub root: usize,
    /// Number of leaves seen by the parser.
    pub n_tips: usize,
    pub flags: ParseFlags,
    pub mutations: MutationTable,
    /// Reference residues per gene, used for genotype and revertant search.
    pub reference: BTreeMap<String, String>,
    /// Format-specific config entries (title, source, overlay ...).
    pub overlay: Map<String, Value>,
}

impl ParsedTree {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn add_child(&mut self, parent: usize, node: TreeNode) -> usize {
        let id = self.nodes.len();
        self.nodes.push(TreeNode {
            parent: Some(parent),
            ..node
        });
        self.nodes[parent].children.push(id);
        id
    }

    /// Children before parents, leftmost leaf first, root last. Iterative so
    /// that very deep trees do not exhaust the stack.
    pub fn finishing_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        if self.nodes.is_empty() {
            return order;
        }
        let mut stack: Vec<(usize, usize)> = vec![(self.root, 0)];
        while let Some(top) = stack.last_mut() {
            let (node, next_child) = *top;
            match self.nodes[node].children.get(next_child) {
                Some(&child) => {
                    top.1 += 1;
                    stack.push((child, 0));
                }
                None => {
                    order.push(node);
                    stack.pop();
                }
            }
        }
        order
    }

    /// Root first, children in stored order.
    pub fn preorder(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        if self.nodes.is_empty() {
            return order;
        }
        let mut stack = vec![self.root];
        while let Some(node) = stack.pop() {
            order.push(node);
            stack.extend(self.nodes[node].children.iter().rev());
        }
        order
    }

    /// Descendant leaf count for every node (1 for leaves).
    pub fn num_tips(&self) -> Vec<usize> {
        let mut tips = vec![0usize; self.nodes.len()];
        for node in self.finishing_order() {
            let children = &self.nodes[node].children;
            tips[node] = if children.is_empty() {
                1
            } else {
                children.iter().map(|c| tips[*c]).sum()
            };
        }
        tips
    }

    /// Reorders every child list ascending by descendant leaf count. The
    /// sort is stable, so ties keep their input order.
    pub fn ladderize(&mut self, num_tips: &[usize]) {
        for node in self.nodes.iter_mut() {
            node.children.sort_by_key(|c| num_tips[*c]);
        }
    }
}
