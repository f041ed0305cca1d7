//! Per-mutation vertical spans for the genome-position side panel.

use crate::node_store::Dataset;
use crate::settings::EngineSettings;
use crate::spatial::query_nodes;
use std::collections::HashMap;
use taxonium_protocol::{Bounds, MutationClass, NodeId, VariationChunk, VariationEntry};

/// Pre-order over `ids` (which must be closed under taking parents) and the
/// `[min_y, max_y]` span of every listed node's subtree.
fn spans(dataset: &Dataset, ids: &[NodeId]) -> (Vec<NodeId>, HashMap<NodeId, [f64; 2]>) {
    let store = &dataset.store;
    let members: HashMap<NodeId, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();
    let mut children: Vec<Vec<NodeId>> = vec![Vec::new(); ids.len()];
    let mut roots = Vec::new();
    for id in ids {
        match store.parent(*id).and_then(|p| members.get(&p)) {
            Some(parent) => children[*parent].push(*id),
            None => roots.push(*id),
        }
    }

    let mut order = Vec::with_capacity(ids.len());
    let mut stack: Vec<NodeId> = roots.into_iter().rev().collect();
    while let Some(id) = stack.pop() {
        order.push(id);
        stack.extend(children[members[&id]].iter().rev());
    }

    let mut span: HashMap<NodeId, [f64; 2]> = HashMap::with_capacity(order.len());
    for &id in order.iter().rev() {
        let y = store.nodes()[id].y;
        let own = span.entry(id).or_insert([y, y]);
        own[0] = own[0].min(y);
        own[1] = own[1].max(y);
        let own = *own;
        if let Some(parent) = store.parent(id).filter(|p| members.contains_key(p)) {
            let merged = span.entry(parent).or_insert(own);
            merged[0] = merged[0].min(own[0]);
            merged[1] = merged[1].max(own[1]);
        }
    }
    (order, span)
}

/// Entries for `ids`, split into chunks of at most `chunk_size` nodes. The
/// root carries no entries.
pub fn variation_chunks(
    dataset: &Dataset,
    ids: &[NodeId],
    class: MutationClass,
    chunk_size: usize,
) -> Vec<Vec<VariationEntry>> {
    let store = &dataset.store;
    let (order, span) = spans(dataset, ids);
    order
        .chunks(chunk_size.max(1))
        .map(|chunk| {
            chunk
                .iter()
                .filter(|id| store.parent(**id).is_some())
                .flat_map(|id| {
                    let y = span[id];
                    store.nodes()[*id]
                        .mutations
                        .iter()
                        .filter_map(|m| dataset.mutations.get(*m))
                        .filter(|m| m.class == class)
                        .map(move |m| VariationEntry { y, m: m.clone() })
                })
                .collect()
        })
        .collect()
}

/// Drops entries with a short span when both the node count and the
/// visible genome window are large. This loses entries on purpose.
pub fn density_filter(
    entries: Vec<VariationEntry>,
    node_count: usize,
    nt_bounds: [f64; 2],
    settings: &EngineSettings,
) -> Vec<VariationEntry> {
    if node_count < settings.density_min_nodes
        || nt_bounds[1] - nt_bounds[0] < settings.density_min_window
    {
        return entries;
    }
    entries
        .into_iter()
        .filter(|e| e.y[1] - e.y[0] > settings.density_min_span)
        .collect()
}

/// Unfiltered entries of completed passes over the overview node set.
#[derive(Debug, Default)]
pub struct VariationCache {
    generation: Option<u64>,
    base: HashMap<MutationClass, Vec<VariationEntry>>,
}

impl VariationCache {
    fn sync(&mut self, generation: u64) {
        if self.generation != Some(generation) {
            self.base.clear();
            self.generation = Some(generation);
        }
    }
}

/// Computes variation data for the nodes a viewport query would return,
/// handing each chunk to `emit` as soon as it is ready. Above
/// `variation_direct_node_limit` nodes the overview set is used instead and
/// its complete pass is cached for later requests of the same class.
pub fn compute_variation(
    dataset: &Dataset,
    class: MutationClass,
    nt_bounds: [f64; 2],
    bounds: Option<&Bounds>,
    cache: &mut VariationCache,
    settings: &EngineSettings,
    emit: &mut dyn FnMut(VariationChunk),
) {
    cache.sync(dataset.generation);
    let detailed = query_nodes(&dataset.store, bounds);
    let node_count = detailed.len();
    let chunk = |entries: Vec<VariationEntry>, complete: bool, cached: bool| VariationChunk {
        class,
        entries: density_filter(entries, node_count, nt_bounds, settings),
        complete,
        cached,
        reference: dataset.reference.clone(),
    };

    if node_count < settings.variation_direct_node_limit {
        let chunks = variation_chunks(dataset, &detailed, class, settings.variation_chunk_size);
        let last = chunks.len().saturating_sub(1);
        if chunks.is_empty() {
            emit(chunk(vec![], true, false));
        }
        for (i, entries) in chunks.into_iter().enumerate() {
            emit(chunk(entries, i == last, false));
        }
        return;
    }

    if let Some(entries) = cache.base.get(&class) {
        log::debug!("Serving {class:?} variation data from cache");
        emit(chunk(entries.clone(), true, true));
        return;
    }
    let base = query_nodes(&dataset.store, None);
    let chunks = variation_chunks(dataset, &base, class, settings.variation_chunk_size);
    let mut all = Vec::new();
    for entries in chunks {
        all.extend(entries.iter().cloned());
        emit(chunk(entries, false, false));
    }
    log::info!("Cached {} {class:?} variation entries", all.len());
    cache.base.insert(class, all.clone());
    emit(chunk(all, true, true));
}
