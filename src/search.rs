//! Structured search over an ingested dataset.
//!
//! A wire [`SearchSpec`] is compiled into a [`CompiledSearch`] tree once,
//! then evaluated against the whole node array. Result id lists are cached
//! per spec signature so that boolean combinations and repeated requests
//! with different bounds do not re-scan the data.

use crate::error::{EngineError, EngineResult};
use crate::node_store::Dataset;
use crate::settings::EngineSettings;
use crate::spatial::{precision, reduce_overplotting, resolve_bounds};
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{DefaultHasher, Hash, Hasher};
use taxonium_protocol::{
    Bounds, LooseNumber, MutationId, NodeId, SearchResult, SearchResultKind, SearchSpec,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextMode {
    Contains,
    Exact,
    PerLine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberOp {
    Eq,
    Gt,
    Lt,
    Ge,
    Le,
}

impl NumberOp {
    fn parse(method: &str) -> EngineResult<Self> {
        match method {
            "==" => Ok(Self::Eq),
            ">" => Ok(Self::Gt),
            "<" => Ok(Self::Lt),
            ">=" => Ok(Self::Ge),
            "<=" => Ok(Self::Le),
            other => Err(EngineError::invalid(format!("Invalid number_method: {other}"))),
        }
    }

    fn test(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Eq => value == threshold,
            Self::Gt => value > threshold,
            Self::Lt => value < threshold,
            Self::Ge => value >= threshold,
            Self::Le => value <= threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BooleanOp {
    And,
    Or,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SearchQuery {
    Text {
        field: String,
        mode: TextMode,
        text: String,
    },
    Mutation {
        gene: String,
        position: Option<u32>,
        /// `None` matches any new residue.
        residue: Option<String>,
        min_tips: f64,
    },
    Genotype {
        gene: String,
        position: Option<u32>,
        residue: String,
    },
    Revertant {
        min_tips: f64,
    },
    Number {
        field: String,
        op: NumberOp,
        value: Option<f64>,
    },
    Boolean {
        op: BooleanOp,
        children: Vec<CompiledSearch>,
    },
}

/// A query plus the signature its results are cached under.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledSearch {
    pub signature: u64,
    pub query: SearchQuery,
}

const PREDICATE_NAMES: [&str; 7] = [
    "text_match",
    "text_exact",
    "text_per_line",
    "mutation",
    "genotype",
    "revertant",
    "number",
];

fn without_keys(spec: &SearchSpec) -> SearchSpec {
    SearchSpec {
        key: String::new(),
        subspecs: spec.subspecs.iter().map(without_keys).collect(),
        ..spec.clone()
    }
}

/// Stable identity of a spec, ignoring the caller's `key` labels.
pub fn signature(spec: &SearchSpec) -> EngineResult<u64> {
    let text = serde_json::to_string(&without_keys(spec))?;
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    Ok(hasher.finish())
}

fn position(value: Option<&LooseNumber>) -> Option<u32> {
    value
        .and_then(LooseNumber::as_f64)
        .filter(|p| *p >= 0.0)
        .map(|p| p.trunc() as u32)
}

fn min_tips(value: Option<&LooseNumber>) -> f64 {
    value.and_then(LooseNumber::as_f64).unwrap_or(0.0)
}

impl TryFrom<&SearchSpec> for CompiledSearch {
    type Error = EngineError;

    fn try_from(spec: &SearchSpec) -> EngineResult<Self> {
        let method = spec.method.as_deref().unwrap_or(&spec.spec_type);
        let field = |default: &str| {
            if PREDICATE_NAMES.contains(&spec.spec_type.as_str()) || spec.spec_type.is_empty() {
                default.to_string()
            } else {
                spec.spec_type.clone()
            }
        };
        let text = || spec.text.clone().unwrap_or_default();
        let query = match method {
            "boolean" => {
                let op = match spec.boolean_method.as_deref() {
                    Some("and") => BooleanOp::And,
                    Some("or") => BooleanOp::Or,
                    Some("not") => BooleanOp::Not,
                    other => {
                        return Err(EngineError::invalid(format!(
                            "Invalid boolean_method: {}",
                            other.unwrap_or("<missing>")
                        )));
                    }
                };
                let children = spec
                    .subspecs
                    .iter()
                    .map(CompiledSearch::try_from)
                    .collect::<EngineResult<Vec<_>>>()?;
                SearchQuery::Boolean { op, children }
            }
            "text_match" => SearchQuery::Text {
                field: field("name"),
                mode: TextMode::Contains,
                text: text(),
            },
            "text_exact" => SearchQuery::Text {
                field: field("name"),
                mode: TextMode::Exact,
                text: text(),
            },
            "text_per_line" => SearchQuery::Text {
                field: field("name"),
                mode: TextMode::PerLine,
                text: text(),
            },
            "mutation" => SearchQuery::Mutation {
                gene: spec.gene.clone().unwrap_or_default(),
                position: position(spec.position.as_ref()),
                residue: spec.new_residue.clone().filter(|r| r != "any"),
                min_tips: min_tips(spec.min_tips.as_ref()),
            },
            "genotype" => SearchQuery::Genotype {
                gene: spec.gene.clone().unwrap_or_default(),
                position: position(spec.position.as_ref()),
                residue: spec.new_residue.clone().unwrap_or_default(),
            },
            "revertant" => SearchQuery::Revertant {
                min_tips: min_tips(spec.min_tips.as_ref()),
            },
            "number" => {
                let value = spec.number.as_ref().and_then(LooseNumber::as_f64);
                let op = match value {
                    Some(_) => NumberOp::parse(spec.number_method.as_deref().unwrap_or_default())?,
                    None => NumberOp::Eq,
                };
                SearchQuery::Number {
                    field: field("num_tips"),
                    op,
                    value,
                }
            }
            other => {
                return Err(EngineError::invalid(format!("Unknown search method: {other}")));
            }
        };
        Ok(Self {
            signature: signature(spec)?,
            query,
        })
    }
}

/// Search state that lives as long as one dataset: cached result ids,
/// match counts, the revertant mutation set and genotype walks.
#[derive(Debug)]
pub struct SearchCache {
    generation: Option<u64>,
    capacity: usize,
    results: HashMap<u64, Vec<NodeId>>,
    order: VecDeque<u64>,
    stored_ids: usize,
    count_per_signature: HashMap<u64, usize>,
    revertants: Option<HashSet<MutationId>>,
    genotypes: HashMap<(String, u32, String), HashMap<NodeId, bool>>,
}

impl SearchCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            generation: None,
            capacity,
            results: HashMap::new(),
            order: VecDeque::new(),
            stored_ids: 0,
            count_per_signature: HashMap::new(),
            revertants: None,
            genotypes: HashMap::new(),
        }
    }

    /// Drops everything when the dataset generation changes.
    pub fn sync(&mut self, generation: u64) {
        if self.generation != Some(generation) {
            if self.generation.is_some() {
                log::debug!("Dataset changed; clearing search cache");
            }
            *self = Self::new(self.capacity);
            self.generation = Some(generation);
        }
    }

    pub fn retrieve(&self, signature: u64) -> Option<&[NodeId]> {
        self.results.get(&signature).map(Vec::as_slice)
    }

    /// Stores a result, evicting the oldest entries until the total id count
    /// fits. A single result larger than the capacity is not stored.
    pub fn store(&mut self, signature: u64, ids: Vec<NodeId>) {
        if ids.len() > self.capacity || self.results.contains_key(&signature) {
            return;
        }
        while self.stored_ids + ids.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if let Some(evicted) = self.results.remove(&oldest) {
                self.stored_ids -= evicted.len();
            }
        }
        self.stored_ids += ids.len();
        self.order.push_back(signature);
        self.results.insert(signature, ids);
    }

    pub fn stored_ids(&self) -> usize {
        self.stored_ids
    }
}

fn text_matches(value: &str, mode: TextMode, needle: &str, lines: &HashSet<String>) -> bool {
    let value = value.to_lowercase();
    match mode {
        TextMode::Contains => value.contains(needle),
        TextMode::Exact => value == needle,
        TextMode::PerLine => lines.contains(value.trim()),
    }
}

fn reference_residue(dataset: &Dataset, gene: &str, position: u32) -> Option<String> {
    let sequence = dataset.reference.get(gene)?;
    let index = (position as usize).checked_sub(1)?;
    sequence.chars().nth(index).map(String::from)
}

/// Mutations that restore the root (or reference) residue at their site.
fn revertant_set(dataset: &Dataset) -> HashSet<MutationId> {
    let table = &dataset.mutations;
    let root_state: HashMap<(&str, u32), &str> = dataset
        .root_mutations()
        .iter()
        .filter_map(|id| table.get(*id))
        .map(|m| ((m.gene.as_str(), m.residue_pos), m.new_residue.as_str()))
        .collect();
    table
        .entries()
        .iter()
        .filter(|m| m.new_residue != m.previous_residue)
        .filter(|m| {
            if dataset.reference.is_empty() {
                root_state.get(&(m.gene.as_str(), m.residue_pos)) == Some(&m.new_residue.as_str())
            } else {
                reference_residue(dataset, &m.gene, m.residue_pos).as_deref()
                    == Some(m.new_residue.as_str())
            }
        })
        .map(|m| m.mutation_id)
        .collect()
}

fn genotype_matches(
    dataset: &Dataset,
    gene: &str,
    position: u32,
    residue: &str,
    cache: &mut SearchCache,
) -> Vec<NodeId> {
    let relevant: Vec<_> = dataset
        .mutations
        .entries()
        .iter()
        .filter(|m| m.gene == gene && m.residue_pos == position)
        .collect();
    let positive: HashSet<MutationId> = relevant
        .iter()
        .filter(|m| m.new_residue == residue)
        .map(|m| m.mutation_id)
        .collect();
    let negative: HashSet<MutationId> = relevant
        .iter()
        .filter(|m| m.new_residue != residue)
        .map(|m| m.mutation_id)
        .collect();
    let root_has_residue =
        reference_residue(dataset, gene, position).as_deref() == Some(residue);
    if positive.is_empty() && !root_has_residue {
        return vec![];
    }

    let store = &dataset.store;
    let known = cache
        .genotypes
        .entry((gene.to_string(), position, residue.to_string()))
        .or_default();
    let mut out = Vec::new();
    for id in 0..store.len() {
        let mut walked = Vec::new();
        let mut visited = HashSet::new();
        let mut current = id;
        let state = loop {
            if let Some(state) = known.get(&current) {
                break *state;
            }
            walked.push(current);
            visited.insert(current);
            let node = &store.nodes()[current];
            if node.mutations.iter().any(|m| positive.contains(m)) {
                break true;
            }
            if node.mutations.iter().any(|m| negative.contains(m)) {
                break false;
            }
            match store.parent(current) {
                Some(parent) if !visited.contains(&parent) => current = parent,
                _ => break root_has_residue,
            }
        };
        for node in walked {
            known.insert(node, state);
        }
        if state {
            out.push(id);
        }
    }
    out
}

fn evaluate_uncached(
    dataset: &Dataset,
    query: &SearchQuery,
    cache: &mut SearchCache,
) -> Vec<NodeId> {
    let store = &dataset.store;
    let all = 0..store.len();
    match query {
        SearchQuery::Text { field, mode, text } => {
            let needle = text.to_lowercase();
            let lines: HashSet<String> = needle
                .lines()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .collect();
            if needle.is_empty() || (*mode == TextMode::PerLine && lines.is_empty()) {
                return vec![];
            }
            all.filter(|id| {
                store.nodes()[*id]
                    .field(field)
                    .filter(|v| !v.is_blank())
                    .is_some_and(|v| text_matches(&v.to_string(), *mode, &needle, &lines))
            })
            .collect()
        }
        SearchQuery::Mutation {
            gene,
            position,
            residue,
            min_tips,
        } => {
            let Some(position) = position else {
                return vec![];
            };
            let relevant: HashSet<MutationId> = dataset
                .mutations
                .entries()
                .iter()
                .filter(|m| {
                    m.gene == *gene
                        && m.residue_pos == *position
                        && residue.as_ref().is_none_or(|r| m.new_residue == *r)
                })
                .map(|m| m.mutation_id)
                .collect();
            if relevant.is_empty() {
                return vec![];
            }
            all.filter(|id| {
                let node = &store.nodes()[*id];
                node.num_tips as f64 > *min_tips
                    && node.mutations.iter().any(|m| relevant.contains(m))
            })
            .collect()
        }
        SearchQuery::Genotype {
            gene,
            position,
            residue,
        } => match position {
            Some(position) => genotype_matches(dataset, gene, *position, residue, cache),
            None => vec![],
        },
        SearchQuery::Revertant { min_tips } => {
            let revertants = cache.revertants.get_or_insert_with(|| revertant_set(dataset));
            all.filter(|id| {
                let node = &store.nodes()[*id];
                node.num_tips as f64 > *min_tips
                    && node.mutations.iter().any(|m| revertants.contains(m))
            })
            .collect()
        }
        SearchQuery::Number { field, op, value } => {
            let Some(threshold) = value else {
                return vec![];
            };
            all.filter(|id| {
                store.nodes()[*id]
                    .field(field)
                    .and_then(|v| v.as_f64())
                    .is_some_and(|v| op.test(v, *threshold))
            })
            .collect()
        }
        SearchQuery::Boolean { children, .. } if children.is_empty() => vec![],
        SearchQuery::Boolean { op, children } => {
            let mut results = children.iter().map(|c| evaluate(dataset, c, cache));
            match op {
                BooleanOp::And => {
                    let mut working: Vec<NodeId> = results.next().unwrap_or_default();
                    for next in results {
                        let next: HashSet<NodeId> = next.into_iter().collect();
                        working.retain(|id| next.contains(id));
                    }
                    working
                }
                BooleanOp::Or => {
                    let mut union: Vec<NodeId> = results.flatten().collect();
                    union.sort_unstable();
                    union.dedup();
                    union
                }
                BooleanOp::Not => {
                    let excluded: HashSet<NodeId> = results.flatten().collect();
                    all.filter(|id| !excluded.contains(id)).collect()
                }
            }
        }
    }
}

/// Ids of every matching node, ascending.
pub fn evaluate(dataset: &Dataset, search: &CompiledSearch, cache: &mut SearchCache) -> Vec<NodeId> {
    if let Some(ids) = cache.retrieve(search.signature) {
        log::debug!("Search cache hit for {:016x}", search.signature);
        return ids.to_vec();
    }
    let ids = evaluate_uncached(dataset, &search.query, cache);
    cache.store(search.signature, ids.clone());
    ids
}

/// Runs one keyed search. Small result sets are returned whole; larger
/// ones are cut to the bounds and thinned, and report the full count.
pub fn single_search(
    dataset: &Dataset,
    spec: &SearchSpec,
    bounds: Option<&Bounds>,
    cache: &mut SearchCache,
    settings: &EngineSettings,
) -> EngineResult<SearchResult> {
    cache.sync(dataset.generation);
    let compiled = CompiledSearch::try_from(spec)?;
    let ids = evaluate(dataset, &compiled, cache);
    let total_count = *cache
        .count_per_signature
        .entry(compiled.signature)
        .or_insert(ids.len());
    let store = &dataset.store;
    let (kind, ids) = if total_count > settings.max_search_results {
        let resolved = resolve_bounds(bounds, store.extent());
        let cut: Vec<NodeId> = ids
            .into_iter()
            .filter(|id| {
                let y = store.nodes()[*id].y;
                y > resolved.min_y && y < resolved.max_y
            })
            .collect();
        let reduced = reduce_overplotting(
            store,
            &cut,
            precision(resolved.min_x, resolved.max_x),
            precision(resolved.min_y, resolved.max_y),
            resolved.x_type,
        );
        (SearchResultKind::Filtered, reduced)
    } else {
        (SearchResultKind::Complete, ids)
    };
    log::info!(
        "Search '{}' matched {total_count} nodes, returning {} ({kind:?})",
        spec.key,
        ids.len()
    );
    Ok(SearchResult {
        key: spec.key.clone(),
        kind,
        data: store.records(&ids, dataset.mutation_table_for_records()),
        total_count,
    })
}
