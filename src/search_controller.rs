//! Caller-side orchestration of keyed searches: per-key debounce, request
//! de-duplication, cancellation of superseded requests and the bounds
//! independent overview of each search.

use crate::error::EngineResult;
use crate::search::signature;
use std::collections::BTreeMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use taxonium_protocol::{Bounds, NodeRecord, SearchResult, SearchResultKind, SearchSpec};

#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn same_as(&self, other: &CancellationToken) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SearchLane {
    /// Bounds-dependent result for the current viewport.
    Detailed,
    /// Result for the whole tree, used while zoomed out and for the minimap.
    Overview,
}

/// A search the caller should send to the worker.
#[derive(Debug, Clone)]
pub struct OutgoingSearch {
    pub key: String,
    pub lane: SearchLane,
    pub spec: SearchSpec,
    pub bounds: Option<Bounds>,
    pub token: CancellationToken,
}

#[derive(Debug)]
struct InFlight {
    lane: SearchLane,
    request: u64,
    token: CancellationToken,
}

#[derive(Debug)]
struct KeyState {
    spec: SearchSpec,
    signature: u64,
    due: Option<Instant>,
    detailed: Option<SearchResult>,
    detailed_bounds: Option<Bounds>,
    overview: Option<(u64, Vec<NodeRecord>)>,
    in_flight: Vec<InFlight>,
}

impl KeyState {
    fn cancel_all(&mut self) {
        for job in self.in_flight.drain(..) {
            job.token.cancel();
        }
    }
}

fn request_signature(spec_signature: u64, lane: SearchLane, bounds: Option<&Bounds>) -> u64 {
    let mut hasher = DefaultHasher::new();
    spec_signature.hash(&mut hasher);
    lane.hash(&mut hasher);
    serde_json::to_string(&bounds)
        .unwrap_or_default()
        .hash(&mut hasher);
    hasher.finish()
}

fn unbounded(bounds: Option<&Bounds>) -> bool {
    bounds.is_none_or(Bounds::is_unbounded)
}

#[derive(Debug)]
pub struct SearchController {
    debounce: Duration,
    keys: BTreeMap<String, KeyState>,
    bounds: Option<Bounds>,
}

impl SearchController {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            keys: BTreeMap::new(),
            bounds: None,
        }
    }

    /// Replaces the set of active searches. New or edited specs are
    /// scheduled after the debounce window; removed keys are cancelled.
    pub fn set_specs(&mut self, specs: &[SearchSpec], now: Instant) -> EngineResult<()> {
        let wanted: BTreeMap<&str, &SearchSpec> =
            specs.iter().map(|s| (s.key.as_str(), s)).collect();
        self.keys.retain(|key, state| {
            let keep = wanted.contains_key(key.as_str());
            if !keep {
                state.cancel_all();
            }
            keep
        });
        for (key, spec) in wanted {
            let sig = signature(spec)?;
            match self.keys.get_mut(key) {
                Some(state) if state.signature == sig => {}
                Some(state) => {
                    state.spec = spec.clone();
                    state.signature = sig;
                    state.due = Some(now + self.debounce);
                }
                None => {
                    self.keys.insert(
                        key.to_string(),
                        KeyState {
                            spec: spec.clone(),
                            signature: sig,
                            due: Some(now + self.debounce),
                            detailed: None,
                            detailed_bounds: None,
                            overview: None,
                            in_flight: Vec::new(),
                        },
                    );
                }
            }
        }
        Ok(())
    }

    /// New viewport bounds. Only searches whose last result was cut to the
    /// old bounds need to run again.
    pub fn set_bounds(&mut self, bounds: Option<Bounds>, now: Instant) {
        for state in self.keys.values_mut() {
            let complete = state
                .detailed
                .as_ref()
                .is_some_and(|r| r.kind == SearchResultKind::Complete);
            if !complete && state.detailed_bounds != bounds && state.due.is_none() {
                state.due = Some(now + self.debounce);
            }
        }
        self.bounds = bounds;
    }

    fn issue(&mut self, key: &str, lane: SearchLane, bounds: Option<Bounds>) -> Option<OutgoingSearch> {
        let state = self.keys.get_mut(key)?;
        let request = request_signature(state.signature, lane, bounds.as_ref());
        if state
            .in_flight
            .iter()
            .any(|job| job.request == request && !job.token.is_cancelled())
        {
            log::debug!("Search '{key}' already in flight; not sending a duplicate");
            return None;
        }
        state.in_flight.retain(|job| {
            let superseded = job.lane == lane;
            if superseded {
                job.token.cancel();
            }
            !superseded
        });
        let token = CancellationToken::new();
        state.in_flight.push(InFlight {
            lane,
            request,
            token: token.clone(),
        });
        Some(OutgoingSearch {
            key: key.to_string(),
            lane,
            spec: state.spec.clone(),
            bounds,
            token,
        })
    }

    /// Searches whose debounce window has passed.
    pub fn poll(&mut self, now: Instant) -> Vec<OutgoingSearch> {
        let ready: Vec<String> = self
            .keys
            .iter_mut()
            .filter(|(_, state)| state.due.is_some_and(|due| due <= now))
            .map(|(key, state)| {
                state.due = None;
                key.clone()
            })
            .collect();
        let bounds = self.bounds.clone();
        ready
            .into_iter()
            .filter_map(|key| self.issue(&key, SearchLane::Detailed, bounds.clone()))
            .collect()
    }

    /// Handles a reply. Replies for cancelled or unknown requests are
    /// dropped. May return a follow-up overview search.
    pub fn accept(
        &mut self,
        outgoing: &OutgoingSearch,
        result: SearchResult,
    ) -> Option<OutgoingSearch> {
        let state = self.keys.get_mut(&outgoing.key)?;
        let position = state
            .in_flight
            .iter()
            .position(|job| job.token.same_as(&outgoing.token));
        let Some(position) = position.filter(|_| !outgoing.token.is_cancelled()) else {
            log::debug!("Dropping stale result for search '{}'", outgoing.key);
            return None;
        };
        state.in_flight.remove(position);

        match outgoing.lane {
            SearchLane::Overview => {
                state.overview = Some((state.signature, result.data));
                None
            }
            SearchLane::Detailed => {
                let bounds = outgoing.bounds.clone();
                let overview_current = state
                    .overview
                    .as_ref()
                    .is_some_and(|(sig, _)| *sig == state.signature);
                let follow_up = if result.kind == SearchResultKind::Complete
                    || unbounded(bounds.as_ref())
                {
                    state.overview = Some((state.signature, result.data.clone()));
                    false
                } else {
                    !overview_current
                };
                state.detailed = Some(result);
                state.detailed_bounds = bounds;
                if follow_up {
                    let key = outgoing.key.clone();
                    self.issue(&key, SearchLane::Overview, None)
                } else {
                    None
                }
            }
        }
    }

    /// Handles an error reply. The request leaves the in-flight set and the
    /// key is scheduled again after the debounce window.
    pub fn fail(&mut self, outgoing: &OutgoingSearch, now: Instant) {
        let Some(state) = self.keys.get_mut(&outgoing.key) else {
            return;
        };
        let position = state
            .in_flight
            .iter()
            .position(|job| job.token.same_as(&outgoing.token));
        let Some(position) = position.filter(|_| !outgoing.token.is_cancelled()) else {
            return;
        };
        state.in_flight.remove(position);
        log::warn!("Search '{}' failed; retrying", outgoing.key);
        state.due = Some(now + self.debounce);
    }

    pub fn detailed(&self, key: &str) -> Option<&SearchResult> {
        self.keys.get(key)?.detailed.as_ref()
    }

    pub fn overview(&self, key: &str) -> Option<&[NodeRecord]> {
        let state = self.keys.get(key)?;
        state
            .overview
            .as_ref()
            .filter(|(sig, _)| *sig == state.signature)
            .map(|(_, nodes)| nodes.as_slice())
    }

    pub fn in_flight(&self, key: &str) -> usize {
        self.keys.get(key).map_or(0, |s| s.in_flight.len())
    }
}
