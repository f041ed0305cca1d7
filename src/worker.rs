//! The long-lived engine worker. It owns the one ingested dataset and its
//! caches, and answers typed requests with typed responses carrying the
//! caller's job id.

use crate::config::resolved_config;
use crate::error::{EngineError, EngineResult, ErrorCode};
use crate::export::nextstrain_subtree;
use crate::ingest::{UploadOptions, ingest};
use crate::mutation::nucleotide_spectrum;
use crate::node_store::Dataset;
use crate::search::{SearchCache, single_search};
use crate::settings::EngineSettings;
use crate::spatial::query_nodes;
use crate::variation::{VariationCache, compute_variation};
use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use taxonium_protocol::{QueryResult, Request, Response, StatusMessage};

/// Single-threaded worker state. Requests needing data that arrive before
/// an ingestion has finished are parked and served in arrival order once a
/// dataset exists.
#[derive(Debug)]
pub struct WorkerState {
    settings: EngineSettings,
    dataset: Option<Dataset>,
    generation: u64,
    search_cache: SearchCache,
    variation_cache: VariationCache,
    pending: VecDeque<Request>,
}

impl WorkerState {
    pub fn new(settings: EngineSettings) -> Self {
        let search_cache = SearchCache::new(settings.search_cache_capacity);
        Self {
            settings,
            dataset: None,
            generation: 0,
            search_cache,
            variation_cache: VariationCache::default(),
            pending: VecDeque::new(),
        }
    }

    pub fn dataset(&self) -> Option<&Dataset> {
        self.dataset.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.dataset.is_some()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Handles one request, passing every response to `emit` as soon as it
    /// exists.
    pub fn handle(&mut self, request: Request, emit: &mut dyn FnMut(Response)) {
        match request {
            Request::Upload { job_id, data } => {
                self.upload(job_id, &data, emit);
                while self.dataset.is_some() {
                    let Some(parked) = self.pending.pop_front() else {
                        break;
                    };
                    self.serve(parked, emit);
                }
            }
            request if request.needs_data() && self.dataset.is_none() => {
                log::debug!(
                    "No dataset yet; parking request (job {:?})",
                    request.job_id()
                );
                self.pending.push_back(request);
            }
            request => self.serve(request, emit),
        }
    }

    /// Collects the responses to `request`.
    pub fn handle_collect(&mut self, request: Request) -> Vec<Response> {
        let mut out = Vec::new();
        self.handle(request, &mut |r| out.push(r));
        out
    }

    fn upload(
        &mut self,
        job_id: Option<u64>,
        payload: &taxonium_protocol::UploadPayload,
        emit: &mut dyn FnMut(Response),
    ) {
        let started = Instant::now();
        self.generation += 1;
        let result = UploadOptions::from_payload(payload).and_then(|options| {
            ingest(&options, &self.settings, self.generation, &mut |status| {
                emit(Response::Status {
                    job_id,
                    data: status,
                })
            })
        });
        match result {
            Ok(dataset) => {
                log::info!(
                    "Dataset {} ready in {:.2?}",
                    self.generation,
                    started.elapsed()
                );
                self.search_cache.sync(dataset.generation);
                self.dataset = Some(dataset);
            }
            Err(err) => {
                log::warn!("Ingestion of '{}' failed: {err}", payload.filename);
                emit(Response::Status {
                    job_id,
                    data: StatusMessage::failure(err.message),
                });
            }
        }
    }

    fn serve(&mut self, request: Request, emit: &mut dyn FnMut(Response)) {
        let job_id = request.job_id();
        if let Err(err) = self.try_serve(request, emit) {
            log::warn!("Request (job {job_id:?}) failed: {err}");
            emit(Response::Status {
                job_id,
                data: StatusMessage::failure(err.message),
            });
        }
    }

    fn try_serve(&mut self, request: Request, emit: &mut dyn FnMut(Response)) -> EngineResult<()> {
        let Some(dataset) = self.dataset.as_ref() else {
            return Err(EngineError::new(ErrorCode::Internal, "No dataset loaded"));
        };
        let store = &dataset.store;
        let started = Instant::now();
        match request {
            Request::Upload { .. } => {
                return Err(EngineError::new(ErrorCode::Internal, "Upload reached the query path"));
            }
            Request::Query { job_id, bounds } => {
                let ids = query_nodes(store, bounds.as_ref());
                let nodes = store.records(&ids, dataset.mutation_table_for_records());
                log::debug!("Query returned {} nodes in {:.2?}", nodes.len(), started.elapsed());
                emit(Response::Query {
                    job_id,
                    data: QueryResult { nodes },
                });
            }
            Request::Search {
                job_id,
                search,
                bounds,
            } => {
                let data = single_search(
                    dataset,
                    &search,
                    bounds.as_ref(),
                    &mut self.search_cache,
                    &self.settings,
                )?;
                log::debug!("Search '{}' took {:.2?}", search.key, started.elapsed());
                emit(Response::Search { job_id, data });
            }
            Request::Config { job_id } => {
                let data = resolved_config(dataset, &[])?;
                emit(Response::Config { job_id, data });
            }
            Request::Details { job_id, node_id } => {
                let data = store
                    .record(node_id, Some(&dataset.mutations))
                    .ok_or_else(|| EngineError::not_found(format!("Node {node_id} does not exist")))?;
                emit(Response::Details { job_id, data });
            }
            Request::List {
                job_id,
                node_id,
                key,
            } => {
                if store.get(node_id).is_none() {
                    return Err(EngineError::not_found(format!("Node {node_id} does not exist")));
                }
                emit(Response::List {
                    job_id,
                    data: store.tip_attributes(node_id, &key),
                });
            }
            Request::Nextstrain {
                job_id,
                node_id,
                config,
            } => {
                let meta = config.as_ref().and_then(|c| c.get("meta"));
                let data = nextstrain_subtree(dataset, node_id, meta)?;
                emit(Response::Nextstrain { job_id, data });
            }
            Request::OverallSpectrum { job_id } => {
                let data = nucleotide_spectrum(
                    &dataset.mutations,
                    store.nodes().iter().map(|n| n.mutations.as_slice()),
                );
                emit(Response::OverallSpectrum { job_id, data });
            }
            Request::VariationData {
                job_id,
                class,
                nt_bounds,
                bounds,
            } => {
                compute_variation(
                    dataset,
                    class,
                    nt_bounds,
                    bounds.as_ref(),
                    &mut self.variation_cache,
                    &self.settings,
                    &mut |data| emit(Response::VariationData { job_id, data }),
                );
                log::debug!("Variation data took {:.2?}", started.elapsed());
            }
        }
        Ok(())
    }
}

/// A worker running on its own thread. Requests go in through `send`;
/// responses arrive on the channel handed to `spawn`.
#[derive(Debug)]
pub struct WorkerHandle {
    requests: Option<Sender<Request>>,
    thread: Option<JoinHandle<()>>,
}

fn run_worker(settings: EngineSettings, requests: Receiver<Request>, replies: Sender<Response>) {
    let poll = settings.barrier_poll();
    let mut state = WorkerState::new(settings);
    let mut open = true;
    loop {
        match requests.recv_timeout(poll) {
            Ok(request) => {
                state.handle(request, &mut |response| {
                    if open && replies.send(response).is_err() {
                        log::warn!("Response receiver is gone");
                        open = false;
                    }
                });
                if !open {
                    return;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if state.pending() > 0 {
                    log::debug!("Waiting for data; {} request(s) parked", state.pending());
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                if state.pending() > 0 {
                    log::warn!(
                        "Worker stopping with {} request(s) still waiting for data",
                        state.pending()
                    );
                }
                return;
            }
        }
    }
}

impl WorkerHandle {
    pub fn spawn(settings: EngineSettings, replies: Sender<Response>) -> Self {
        let (requests, inbox) = mpsc::channel();
        let thread = thread::spawn(move || run_worker(settings, inbox, replies));
        Self {
            requests: Some(requests),
            thread: Some(thread),
        }
    }

    pub fn send(&self, request: Request) -> EngineResult<()> {
        self.requests
            .as_ref()
            .ok_or_else(|| EngineError::new(ErrorCode::Internal, "Worker already shut down"))?
            .send(request)
            .map_err(|_| EngineError::new(ErrorCode::Internal, "Worker thread has stopped"))
    }

    /// Closes the request channel and waits for the worker to finish what
    /// it already received.
    pub fn shutdown(&mut self) {
        self.requests.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("Worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use taxonium_protocol::{MutationClass, SearchResultKind, UploadPayload};

    const NEWICK: &str = "((A:0.1,B:0.2):0.3,(C:0.4,D:0.5):0.6);";

    fn upload(job_id: u64, text: &str) -> Request {
        Request::Upload {
            job_id: Some(job_id),
            data: UploadPayload {
                filename: "tree.nwk".to_string(),
                data: Some(text.to_string()),
                ..Default::default()
            },
        }
    }

    fn request(value: serde_json::Value) -> Request {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_requests_before_upload_wait_for_data() {
        let mut worker = WorkerState::new(EngineSettings::default());
        assert!(worker.handle_collect(request(json!({"type": "config", "jobId": 1}))).is_empty());
        assert!(worker.handle_collect(request(json!({"type": "query", "jobId": 2}))).is_empty());
        assert_eq!(worker.pending(), 2);

        let responses = worker.handle_collect(upload(3, NEWICK));
        let served: Vec<Option<u64>> = responses
            .iter()
            .filter(|r| !matches!(r, Response::Status { .. }))
            .map(Response::job_id)
            .collect();
        assert_eq!(served, vec![Some(1), Some(2)]);
        assert_eq!(worker.pending(), 0);
        let Some(Response::Query { data, .. }) = responses.last() else {
            panic!("expected the parked query last");
        };
        assert_eq!(data.nodes.len(), 7);
    }

    #[test]
    fn test_failed_upload_is_status_error() {
        let mut worker = WorkerState::new(EngineSettings::default());
        let responses = worker.handle_collect(upload(1, " ;"));
        let last = responses.last().unwrap();
        assert_eq!(last.job_id(), Some(1));
        assert!(last.error().is_some());
        assert!(!worker.is_ready());
    }

    #[test]
    fn test_every_request_kind() {
        let mut worker = WorkerState::new(EngineSettings::default());
        worker.handle_collect(upload(1, NEWICK));
        assert!(worker.is_ready());
        let root = worker.dataset().unwrap().store.root();

        let search = worker.handle_collect(request(json!({
            "type": "search", "jobId": 2,
            "search": {"key": "s1", "type": "name", "method": "text_match", "text": "a"}
        })));
        let Response::Search { data, .. } = &search[0] else {
            panic!("expected search response");
        };
        assert_eq!(data.kind, SearchResultKind::Complete);
        assert_eq!(data.total_count, 1);

        let details = worker.handle_collect(request(json!({"type": "details", "jobId": 3, "node_id": root})));
        assert!(matches!(&details[0], Response::Details { data, .. } if data.node_id == root));

        let list = worker.handle_collect(request(json!({"type": "list", "jobId": 4, "node_id": root, "key": "name"})));
        let Response::List { data, .. } = &list[0] else {
            panic!("expected list response");
        };
        assert_eq!(data.len(), 4);

        let export = worker.handle_collect(request(json!({
            "type": "nextstrain", "jobId": 5, "node_id": root,
            "config": {"meta": {"title": "Mine"}}
        })));
        let Response::Nextstrain { data, .. } = &export[0] else {
            panic!("expected nextstrain response");
        };
        assert_eq!(data["meta"]["title"], json!("Mine"));

        let spectrum = worker.handle_collect(request(json!({"type": "overall_spectrum", "jobId": 6})));
        assert!(matches!(&spectrum[0], Response::OverallSpectrum { data, .. } if data.is_empty()));

        let variation = worker.handle_collect(Request::VariationData {
            job_id: Some(7),
            class: MutationClass::Aa,
            nt_bounds: [0.0, 100.0],
            bounds: None,
        });
        assert!(matches!(variation.last(), Some(Response::VariationData { data, .. }) if data.complete));

        let missing = worker.handle_collect(request(json!({"type": "details", "jobId": 8, "node_id": 99})));
        assert_eq!(missing[0].job_id(), Some(8));
        assert!(missing[0].error().is_some());
    }

    #[test]
    fn test_new_upload_replaces_dataset() {
        let mut worker = WorkerState::new(EngineSettings::default());
        worker.handle_collect(upload(1, NEWICK));
        let first = worker.dataset().unwrap().generation;
        worker.handle_collect(upload(2, "(X:1,Y:1,Z:1);"));
        let data = worker.dataset().unwrap();
        assert!(data.generation > first);
        assert_eq!(data.store.num_tips(), 3);
    }

    #[test]
    fn test_threaded_worker_answers_over_channels() {
        let (replies, inbox) = mpsc::channel();
        let mut handle = WorkerHandle::spawn(EngineSettings::default(), replies);
        handle.send(request(json!({"type": "config", "jobId": 9}))).unwrap();
        handle.send(upload(1, NEWICK)).unwrap();
        let mut config = None;
        while let Ok(response) = inbox.recv_timeout(Duration::from_secs(5)) {
            if let Response::Config { job_id, data } = response {
                config = Some((job_id, data));
                break;
            }
        }
        let (job_id, data) = config.unwrap();
        assert_eq!(job_id, Some(9));
        assert_eq!(data["num_tips"], json!(4));
        handle.shutdown();
        assert!(handle.send(request(json!({"type": "config"}))).is_err());
    }
}
