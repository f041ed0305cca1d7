//! Two-dimensional layout of a parsed tree.
//!
//! `y` is a leaf rank in [0, 1] with internal nodes centred between their
//! first and last child. `x` accumulates non-negative branch lengths from the
//! root (or tree depth when no lengths exist). Both are rescaled at the end
//! and the nodes are re-sorted by `y`.

use crate::node_store::Node;
use crate::settings::EngineSettings;
use crate::tree::{ParsedTree, TreeNode};
use itertools::Itertools;
use taxonium_protocol::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisPlan {
    /// Always produce `x_dist`, falling back to depth without lengths.
    Distance,
    /// Produce `x_dist` and/or `x_time` depending on which annotations
    /// exist; depth-based `x_dist` when neither does.
    Auto,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayoutOptions {
    pub ladderize: bool,
    pub axes: AxisPlan,
    pub reference_width: f64,
    pub y_scale: f64,
    pub x_percentile: f64,
}

impl LayoutOptions {
    pub fn new(settings: &EngineSettings, ladderize: bool, axes: AxisPlan) -> Self {
        Self {
            ladderize,
            axes,
            reference_width: settings.reference_width,
            y_scale: settings.y_scale,
            x_percentile: settings.x_percentile,
        }
    }
}

fn leaf_ranks(tree: &ParsedTree, order: &[usize]) -> Vec<f64> {
    let leaves = order.iter().filter(|i| tree.nodes[**i].is_leaf()).count();
    let scale = leaves.saturating_sub(1).max(1) as f64;
    let mut y = vec![0.0; tree.nodes.len()];
    let mut rank = 0usize;
    for &i in order {
        let children = &tree.nodes[i].children;
        y[i] = match (children.first(), children.last()) {
            (Some(first), Some(last)) => (y[*first] + y[*last]) / 2.0,
            _ => {
                rank += 1;
                (rank - 1) as f64 / scale
            }
        };
    }
    y
}

/// Horizontal positions in [0, 1] from per-branch lengths.
fn positions(
    tree: &ParsedTree,
    order: &[usize],
    length: impl Fn(&TreeNode) -> Option<f64>,
) -> Vec<f64> {
    let mut x = vec![0.0; tree.nodes.len()];
    let mut scale = 0.0f64;
    // Reverse finishing order visits parents before children.
    for &i in order.iter().rev() {
        let own = length(&tree.nodes[i]).filter(|d| *d >= 0.0).unwrap_or(0.0);
        x[i] = tree.nodes[i].parent.map_or(0.0, |p| x[p]) + own;
        scale = scale.max(x[i]);
    }
    if scale == 0.0 || !scale.is_finite() {
        scale = 1.0;
        for &i in order.iter().rev() {
            x[i] = tree.nodes[i].parent.map_or(1.0, |p| x[p] + 1.0);
            scale = scale.max(x[i]);
        }
        for &i in order {
            if tree.nodes[i].is_leaf() && i != tree.root {
                x[i] = scale;
            }
        }
    }
    x.iter_mut().for_each(|v| *v /= scale);
    x
}

/// Maps the value at `percentile` of the sorted positions to `width`, so a
/// few extreme branches cannot squash the rest of the tree.
fn rescale(values: &mut [f64], percentile: f64, width: f64) {
    if values.is_empty() {
        return;
    }
    let sorted = values.iter().copied().sorted_by(f64::total_cmp).collect_vec();
    let index = ((sorted.len() as f64 * percentile).floor() as usize).min(sorted.len() - 1);
    let reference = sorted[index];
    let reference = if reference > 0.0 {
        reference
    } else {
        sorted[sorted.len() - 1]
    };
    if reference > 0.0 && reference.is_finite() {
        let factor = width / reference;
        values.iter_mut().for_each(|v| *v *= factor);
    }
}

/// Lays out `tree` and returns its nodes sorted by `y`, with node ids equal
/// to the new array index. Per-node mutations and metadata are moved out of
/// `tree`.
pub fn lay_out(tree: &mut ParsedTree, options: &LayoutOptions) -> Vec<Node> {
    if tree.nodes.is_empty() {
        return vec![];
    }
    let mut num_tips = tree.num_tips();
    if options.ladderize {
        tree.ladderize(&num_tips);
        num_tips = tree.num_tips();
    }
    let order = tree.finishing_order();
    let y = leaf_ranks(tree, &order);

    let has_distance = tree.nodes.iter().any(|n| n.branch_length.is_some());
    let has_time = tree.nodes.iter().any(|n| n.time_length.is_some());
    let (want_distance, want_time) = match options.axes {
        AxisPlan::Distance => (true, false),
        AxisPlan::Auto => (has_distance || !has_time, has_time),
    };
    let mut x_dist = want_distance.then(|| positions(tree, &order, |n| n.branch_length));
    let mut x_time = want_time.then(|| positions(tree, &order, |n| n.time_length));
    for axis in [x_dist.as_mut(), x_time.as_mut()].into_iter().flatten() {
        rescale(axis, options.x_percentile, options.reference_width);
    }

    let sorted = (0..tree.nodes.len())
        .sorted_by(|a, b| y[*a].total_cmp(&y[*b]))
        .collect_vec();
    let mut new_id = vec![0 as NodeId; tree.nodes.len()];
    for (new, old) in sorted.iter().enumerate() {
        new_id[*old] = new;
    }

    let nodes = sorted
        .iter()
        .enumerate()
        .map(|(new, &old)| {
            let source = &mut tree.nodes[old];
            Node {
                name: source.name.clone(),
                parent_id: source.parent.map_or(new, |p| new_id[p]),
                x_dist: x_dist.as_ref().map(|x| x[old]),
                x_time: x_time.as_ref().map(|x| x[old]),
                y: y[old] * options.y_scale,
                num_tips: num_tips[old],
                is_tip: source.is_leaf(),
                mutations: std::mem::take(&mut source.mutations),
                metadata: std::mem::take(&mut source.metadata),
            }
        })
        .collect_vec();
    log::debug!(
        "Laid out {} nodes (x_dist: {}, x_time: {})",
        nodes.len(),
        want_distance,
        want_time
    );
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::newick::parse_newick;
    use crate::nextstrain::parse_nextstrain;

    fn options(ladderize: bool, axes: AxisPlan) -> LayoutOptions {
        LayoutOptions::new(&EngineSettings::default(), ladderize, axes)
    }

    fn by_name<'a>(nodes: &'a [Node], name: &str) -> &'a Node {
        nodes.iter().find(|n| n.name == name).unwrap()
    }

    #[test]
    fn test_four_leaf_layout() {
        let mut tree = parse_newick("((A:0.1,B:0.2):0.3,(C:0.4,D:0.5):0.6);").unwrap();
        let nodes = lay_out(&mut tree, &options(false, AxisPlan::Distance));
        assert_eq!(nodes.len(), 7);
        let ys: Vec<f64> = ["A", "B", "C", "D"].iter().map(|n| by_name(&nodes, n).y).collect();
        assert!(ys.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(by_name(&nodes, "A").y, 0.0);
        assert_eq!(by_name(&nodes, "D").y, 2000.0);
        let root = nodes.iter().position(|n| n.num_tips == 4).unwrap();
        assert_eq!(nodes[root].parent_id, root);
        assert!((nodes[root].y - 1000.0).abs() < 1e-9);
        assert_eq!(nodes[root].x_dist, Some(0.0));
        assert!((by_name(&nodes, "D").x_dist.unwrap() - 450.0).abs() < 1e-9);
        let a = by_name(&nodes, "A").x_dist.unwrap();
        assert!((a - 0.4 / 1.1 * 450.0).abs() < 1e-9);
        assert!(nodes.iter().all(|n| n.parent_id < nodes.len()));
        assert!(nodes.windows(2).all(|w| w[0].y <= w[1].y));
    }

    #[test]
    fn test_layout_is_deterministic() {
        let tree = parse_newick("((A:1,(B:2,C:0.5):1):1,(D:3,E:0.1):2,F:9);").unwrap();
        let first = lay_out(&mut tree.clone(), &options(true, AxisPlan::Distance));
        let second = lay_out(&mut tree.clone(), &options(true, AxisPlan::Distance));
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_lengths_fall_back_to_depth() {
        let mut tree = parse_newick("((A,B),C);").unwrap();
        let nodes = lay_out(&mut tree, &options(false, AxisPlan::Distance));
        let leaves: Vec<f64> = ["A", "B", "C"]
            .iter()
            .map(|n| by_name(&nodes, n).x_dist.unwrap())
            .collect();
        assert!(leaves.iter().all(|x| (*x - leaves[0]).abs() < 1e-9));
        assert!(leaves[0] > 0.0);
    }

    #[test]
    fn test_ladderize_reorders_siblings() {
        let mut tree = parse_newick("(((A,B),C),D);").unwrap();
        let plain = lay_out(&mut tree.clone(), &options(false, AxisPlan::Distance));
        assert!(by_name(&plain, "A").y < by_name(&plain, "D").y);
        let nodes = lay_out(&mut tree, &options(true, AxisPlan::Distance));
        assert!(by_name(&nodes, "D").y < by_name(&nodes, "C").y);
        assert!(by_name(&nodes, "C").y < by_name(&nodes, "A").y);
    }

    #[test]
    fn test_outlier_does_not_set_the_width() {
        let leaves = (0..200).map(|i| format!("L{i}:1")).join(",");
        let mut tree = parse_newick(&format!("({leaves},OUT:1000);")).unwrap();
        let nodes = lay_out(&mut tree, &options(false, AxisPlan::Distance));
        assert!((by_name(&nodes, "L0").x_dist.unwrap() - 450.0).abs() < 1e-9);
        assert!(by_name(&nodes, "OUT").x_dist.unwrap() > 450.0);
    }

    #[test]
    fn test_nextstrain_gets_both_axes() {
        let doc = serde_json::json!({
            "tree": {"name": "R", "node_attrs": {"div": 0, "num_date": {"value": 2000.0}},
                "children": [
                    {"name": "A", "node_attrs": {"div": 1, "num_date": {"value": 2010.0}}},
                    {"name": "B", "node_attrs": {"div": 2, "num_date": {"value": 2001.0}}}
                ]}
        });
        let mut tree = parse_nextstrain(&doc.to_string()).unwrap();
        let nodes = lay_out(&mut tree, &options(false, AxisPlan::Auto));
        let a = by_name(&nodes, "A");
        let b = by_name(&nodes, "B");
        assert!(a.x_dist.unwrap() < b.x_dist.unwrap());
        assert!(a.x_time.unwrap() > b.x_time.unwrap());
    }
}
