//! Caller-side viewport loading: decides when the camera has moved far
//! enough to need new nodes, debounces the request, holds it back while a
//! query is still running and keeps the detailed and base node sets.

use crate::bounds::{ViewBounds, is_outside, needs_refresh, widen};
use std::sync::Arc;
use std::time::{Duration, Instant};
use taxonium_protocol::{Bounds, NodeRecord, QueryResult, XType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Nodes for the current viewport.
    Detailed,
    /// Whole-tree overview queried with no bounds.
    Base,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    NotStarted,
    Loading,
    Loaded,
}

/// A node set together with the bounds that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSet {
    pub nodes: Vec<NodeRecord>,
    pub bounds: Option<Bounds>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingQuery {
    pub tier: Tier,
    pub bounds: Option<Bounds>,
}

#[derive(Debug)]
pub struct DynamicData {
    debounce: Duration,
    retry: Duration,
    wanted: Option<Bounds>,
    due: Option<Instant>,
    in_flight: Option<OutgoingQuery>,
    status: LoadStatus,
    detailed: Option<Arc<NodeSet>>,
    base: Option<Arc<NodeSet>>,
    retries: u64,
    refresh_trigger: u64,
}

impl DynamicData {
    pub fn new(debounce: Duration, retry: Duration) -> Self {
        Self {
            debounce,
            retry,
            wanted: None,
            due: None,
            in_flight: None,
            status: LoadStatus::NotStarted,
            detailed: None,
            base: None,
            retries: 0,
            refresh_trigger: 0,
        }
    }

    /// Feeds the current camera rectangle. Returns true when it moved far
    /// enough that new query bounds were scheduled.
    pub fn on_view(&mut self, view: &ViewBounds, x_type: XType, now: Instant) -> bool {
        if !needs_refresh(view, self.wanted.as_ref(), x_type) {
            return false;
        }
        let bounds = widen(view, x_type);
        log::debug!(
            "Viewport needs new nodes: y {:.1}..{:.1}",
            view.min_y,
            view.max_y
        );
        self.wanted = Some(bounds);
        self.due = Some(now + self.debounce);
        true
    }

    /// Asks for a whole-tree load, e.g. right after a dataset arrived.
    pub fn request_full(&mut self, x_type: XType, now: Instant) {
        self.wanted = Some(Bounds::unbounded(x_type));
        self.due = Some(now + self.debounce);
    }

    /// The query to send now, if any. While a query is still running the
    /// pending one is pushed back by the retry interval.
    pub fn poll(&mut self, now: Instant) -> Option<OutgoingQuery> {
        let due = self.due?;
        if due > now {
            return None;
        }
        if self.in_flight.is_some() {
            self.retries += 1;
            self.due = Some(now + self.retry);
            log::debug!("Query still running; retry #{} scheduled", self.retries);
            return None;
        }
        self.due = None;
        self.status = LoadStatus::Loading;
        let query = OutgoingQuery {
            tier: Tier::Detailed,
            bounds: self.wanted.clone(),
        };
        self.in_flight = Some(query.clone());
        Some(query)
    }

    /// Applies a reply. A detailed reply whose base tier is missing asks for
    /// the base tier next. Failures leave both tiers as they were.
    pub fn on_result<E: std::fmt::Display>(
        &mut self,
        tier: Tier,
        result: Result<QueryResult, E>,
        now: Instant,
    ) -> Option<OutgoingQuery> {
        let Some(sent) = self.in_flight.take_if(|q| q.tier == tier) else {
            log::debug!("Ignoring {tier:?} reply with no matching request");
            return None;
        };
        let result = match result {
            Ok(result) => result,
            Err(err) => {
                log::warn!("{tier:?} query failed: {err}");
                self.refresh_trigger += 1;
                self.due = Some(now + self.retry);
                if self.status == LoadStatus::Loading {
                    self.status = if self.detailed.is_some() {
                        LoadStatus::Loaded
                    } else {
                        LoadStatus::NotStarted
                    };
                }
                return None;
            }
        };
        let unbounded = sent.bounds.as_ref().is_none_or(Bounds::is_unbounded);
        let set = Arc::new(NodeSet {
            nodes: result.nodes,
            bounds: sent.bounds,
        });
        match tier {
            Tier::Base => {
                self.base = Some(set);
                None
            }
            Tier::Detailed => {
                self.detailed = Some(Arc::clone(&set));
                self.status = LoadStatus::Loaded;
                if unbounded {
                    self.base = Some(set);
                    None
                } else if self.base.is_none() {
                    let query = OutgoingQuery {
                        tier: Tier::Base,
                        bounds: None,
                    };
                    self.in_flight = Some(query.clone());
                    Some(query)
                } else {
                    None
                }
            }
        }
    }

    /// Drops both tiers; the next refresh reloads everything.
    pub fn reset(&mut self) {
        self.detailed = None;
        self.base = None;
        self.wanted = None;
        self.due = None;
        self.in_flight = None;
        self.status = LoadStatus::NotStarted;
    }

    /// The set to draw for `view`: the detailed set while it still covers
    /// the view, otherwise the base set.
    pub fn visible(&self, view: &ViewBounds) -> Option<Arc<NodeSet>> {
        match &self.detailed {
            Some(detailed) if !is_outside(view, detailed.bounds.as_ref()) => Some(Arc::clone(detailed)),
            _ => self.base.clone().or_else(|| self.detailed.clone()),
        }
    }

    pub fn detailed(&self) -> Option<Arc<NodeSet>> {
        self.detailed.clone()
    }

    pub fn base(&self) -> Option<Arc<NodeSet>> {
        self.base.clone()
    }

    pub fn status(&self) -> LoadStatus {
        self.status
    }

    pub fn retries(&self) -> u64 {
        self.retries
    }

    /// Bumped after every failed query so observers can force a redraw.
    pub fn refresh_trigger(&self) -> u64 {
        self.refresh_trigger
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }
}
