//! Viewport queries over the y-sorted node array.

use crate::node_store::{Extent, NodeStore};
use std::collections::HashSet;
use std::ops::Range;
use taxonium_protocol::{Bounds, NodeId, XType};

/// Horizontal and vertical extent of a level-of-detail grid.
const GRID_SPAN: f64 = 2000.0;

/// A query rectangle with every side resolved to a finite value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedBounds {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
    pub x_type: XType,
}

impl ResolvedBounds {
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }
}

/// Fills unset or NaN sides from the data extent and clamps y to it.
pub fn resolve_bounds(bounds: Option<&Bounds>, extent: &Extent) -> ResolvedBounds {
    let x_type = bounds.map(|b| b.x_type).unwrap_or_default();
    let (extent_min_x, extent_max_x) = extent.x(x_type);
    let side = |pick: fn(&Bounds) -> Option<f64>, fallback: f64| {
        bounds
            .and_then(|b| Bounds::component(pick(b)))
            .unwrap_or(fallback)
    };
    ResolvedBounds {
        min_x: side(|b| b.min_x, extent_min_x),
        max_x: side(|b| b.max_x, extent_max_x),
        min_y: side(|b| b.min_y, extent.min_y).max(extent.min_y),
        max_y: side(|b| b.max_y, extent.max_y).min(extent.max_y),
        x_type,
    }
}

/// Grid resolution giving roughly `GRID_SPAN` cells across `[min, max]`.
pub fn precision(min: f64, max: f64) -> f64 {
    GRID_SPAN / (max - min)
}

pub struct SpatialIndex<'a> {
    store: &'a NodeStore,
}

impl<'a> SpatialIndex<'a> {
    pub fn new(store: &'a NodeStore) -> Self {
        Self { store }
    }

    /// Index range of nodes with `min_y <= y <= max_y`.
    pub fn y_range(&self, min_y: f64, max_y: f64) -> Range<usize> {
        let ys = self.store.y_positions();
        let start = ys.partition_point(|y| *y < min_y);
        let end = ys.partition_point(|y| *y <= max_y);
        start..end.max(start)
    }

    /// Every node inside the rectangle, in id order. Nodes without a value
    /// on the selected axis are never inside.
    pub fn select(&self, bounds: &ResolvedBounds) -> Vec<NodeId> {
        let nodes = self.store.nodes();
        self.y_range(bounds.min_y, bounds.max_y)
            .filter(|id| {
                let node = &nodes[*id];
                node.x(bounds.x_type)
                    .is_some_and(|x| bounds.contains(x, node.y))
            })
            .collect()
    }
}

/// Keeps the first node landing in each grid cell. `precision_x` is divided
/// by five so horizontal thinning is coarser than vertical thinning. A
/// non-finite precision (zero-width range) disables thinning on that axis.
pub fn reduce_overplotting(
    store: &NodeStore,
    ids: &[NodeId],
    precision_x: f64,
    precision_y: f64,
    x_type: XType,
) -> Vec<NodeId> {
    let precision_x = precision_x / 5.0;
    let cell = |value: f64, precision: f64| -> i64 {
        if precision.is_finite() && precision > 0.0 {
            (value * precision).round() as i64
        } else {
            value.to_bits() as i64
        }
    };
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter()
        .copied()
        .filter(|id| {
            let node = &store.nodes()[*id];
            let x = node.x(x_type).unwrap_or(0.0);
            seen.insert((cell(x, precision_x), cell(node.y, precision_y)))
        })
        .collect()
}

/// `ids` plus every ancestor of each, sorted by id.
pub fn add_ancestors(store: &NodeStore, ids: &[NodeId]) -> Vec<NodeId> {
    let mut selected: HashSet<NodeId> = ids.iter().copied().collect();
    let mut pending: Vec<NodeId> = ids.to_vec();
    while let Some(id) = pending.pop() {
        if let Some(parent) = store.parent(id) {
            if selected.insert(parent) {
                pending.push(parent);
            }
        }
    }
    let mut out: Vec<NodeId> = selected.into_iter().collect();
    out.sort_unstable();
    out
}

/// The node set to draw for a viewport: in-range leaves thinned on a grid,
/// plus their ancestors so that branches can be drawn.
pub fn query_nodes(store: &NodeStore, bounds: Option<&Bounds>) -> Vec<NodeId> {
    let resolved = resolve_bounds(bounds, store.extent());
    let index = SpatialIndex::new(store);
    let leaves: Vec<NodeId> = index
        .select(&resolved)
        .into_iter()
        .filter(|id| store.nodes()[*id].num_tips == 1)
        .collect();
    let reduced = reduce_overplotting(
        store,
        &leaves,
        precision(resolved.min_x, resolved.max_x),
        precision(resolved.min_y, resolved.max_y),
        resolved.x_type,
    );
    let out = add_ancestors(store, &reduced);
    log::debug!(
        "Query y [{}, {}]: {} leaves in range, {} after thinning, {} with ancestors",
        resolved.min_y,
        resolved.max_y,
        leaves.len(),
        reduced.len(),
        out.len()
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_store::tests::{node, small_store};

    fn rect(min_x: f64, max_x: f64, min_y: f64, max_y: f64) -> ResolvedBounds {
        ResolvedBounds {
            min_x,
            max_x,
            min_y,
            max_y,
            x_type: XType::Distance,
        }
    }

    #[test]
    fn test_resolve_bounds_falls_back_to_extent() {
        let store = small_store();
        let bounds = Bounds {
            min_x: Some(f64::NAN),
            max_x: Some(1.5),
            min_y: Some(-10.0),
            max_y: None,
            ..Default::default()
        };
        let resolved = resolve_bounds(Some(&bounds), store.extent());
        assert_eq!(resolved, rect(0.0, 1.5, 0.0, 6.0));
        assert_eq!(resolve_bounds(None, store.extent()), rect(0.0, 2.0, 0.0, 6.0));
    }

    #[test]
    fn test_select_filters_both_axes() {
        let store = small_store();
        let index = SpatialIndex::new(&store);
        assert_eq!(index.select(&rect(0.0, 2.0, 1.0, 4.0)), vec![1, 2, 3, 4]);
        assert_eq!(index.select(&rect(1.5, 2.0, 1.0, 4.0)), vec![2, 4]);
        assert!(index.select(&rect(0.0, 2.0, 6.5, 9.0)).is_empty());
    }

    #[test]
    fn test_select_is_monotone() {
        let store = small_store();
        let index = SpatialIndex::new(&store);
        let inner = index.select(&rect(0.5, 2.0, 1.0, 5.0));
        let outer = index.select(&rect(0.0, 2.0, 0.0, 6.0));
        assert!(inner.iter().all(|id| outer.contains(id)));
    }

    #[test]
    fn test_query_adds_ancestors() {
        let store = small_store();
        let bounds = Bounds {
            min_y: Some(3.5),
            max_y: Some(6.0),
            ..Default::default()
        };
        // C and D plus node2 and the root.
        assert_eq!(query_nodes(&store, Some(&bounds)), vec![3, 4, 5, 6]);
        assert_eq!(query_nodes(&store, None), (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn test_overplotting_keeps_one_per_cell() {
        let store = NodeStore::new(vec![
            node("root", 0, 0.0, 0.0, 3),
            node("A", 0, 1.0, 1.0, 1),
            node("B", 0, 1.0, 1.001, 1),
            node("C", 0, 1.0, 500.0, 1),
        ])
        .unwrap();
        let kept = reduce_overplotting(&store, &[1, 2, 3], precision(0.0, 1.0), precision(0.0, 1000.0), XType::Distance);
        assert_eq!(kept, vec![1, 3]);
    }
}
