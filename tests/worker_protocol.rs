use serde_json::json;
use std::sync::mpsc::{self, Receiver};
use std::time::{Duration, Instant};
use taxonium::client::Correlator;
use taxonium::dynamic_data::{DynamicData, Tier};
use taxonium::protocol::{
    Request, Response, SearchResultKind, SearchSpec, UploadPayload, XType,
};
use taxonium::search_controller::{OutgoingSearch, SearchController};
use taxonium::settings::EngineSettings;
use taxonium::worker::WorkerHandle;

const NEWICK: &str = "((A:0.1,B:0.2):0.3,(C:0.4,D:0.5):0.6);";

#[derive(Debug, Clone)]
enum Route {
    Upload,
    Viewport(Tier),
    Search(OutgoingSearch),
}

struct Session {
    worker: WorkerHandle,
    inbox: Receiver<Response>,
    jobs: Correlator<Route>,
    viewport: DynamicData,
    searches: SearchController,
    upload_errors: Vec<String>,
    search_errors: usize,
}

impl Session {
    fn new() -> Self {
        let (replies, inbox) = mpsc::channel();
        Self {
            worker: WorkerHandle::spawn(EngineSettings::default(), replies),
            inbox,
            jobs: Correlator::new(),
            viewport: DynamicData::new(Duration::ZERO, Duration::ZERO),
            searches: SearchController::new(Duration::ZERO),
            upload_errors: Vec::new(),
            search_errors: 0,
        }
    }

    fn upload(&mut self, text: &str) {
        let job_id = Some(self.jobs.register(Route::Upload));
        self.worker
            .send(Request::Upload {
                job_id,
                data: UploadPayload {
                    filename: "tree.nwk".to_string(),
                    data: Some(text.to_string()),
                    ..Default::default()
                },
            })
            .unwrap();
    }

    fn send_search(&mut self, outgoing: OutgoingSearch) {
        let job_id = Some(self.jobs.register(Route::Search(outgoing.clone())));
        self.worker
            .send(Request::Search {
                job_id,
                search: outgoing.spec,
                bounds: outgoing.bounds,
            })
            .unwrap();
    }

    fn send_query(&mut self, tier: Tier, bounds: Option<taxonium::protocol::Bounds>) {
        let job_id = Some(self.jobs.register(Route::Viewport(tier)));
        self.worker.send(Request::Query { job_id, bounds }).unwrap();
    }

    fn poll(&mut self, now: Instant) {
        for outgoing in self.searches.poll(now) {
            self.send_search(outgoing);
        }
        if let Some(query) = self.viewport.poll(now) {
            self.send_query(query.tier, query.bounds);
        }
    }

    /// Routes replies until every job is answered.
    fn drain(&mut self) {
        while self.jobs.outstanding() > 0 {
            let response = self
                .inbox
                .recv_timeout(Duration::from_secs(10))
                .expect("worker reply");
            let Some(route) = self.jobs.accept(&response) else {
                continue;
            };
            let now = Instant::now();
            match (route, response) {
                (Route::Upload, Response::Status { data, .. }) => {
                    self.upload_errors.extend(data.error);
                }
                (Route::Viewport(tier), Response::Query { data, .. }) => {
                    if let Some(next) = self.viewport.on_result::<String>(tier, Ok(data), now) {
                        self.send_query(next.tier, next.bounds);
                    }
                }
                (Route::Viewport(tier), Response::Status { data, .. }) => {
                    let error = data.error.unwrap_or_default();
                    self.viewport.on_result(tier, Err(error), now);
                }
                (Route::Search(outgoing), Response::Search { data, .. }) => {
                    if let Some(next) = self.searches.accept(&outgoing, data) {
                        self.send_search(next);
                    }
                }
                (Route::Search(outgoing), Response::Status { data, .. }) => {
                    if data.error.is_some() {
                        self.search_errors += 1;
                        self.searches.fail(&outgoing, now);
                    }
                }
                (route, response) => panic!("unexpected {response:?} for {route:?}"),
            }
        }
    }
}

fn name_search(key: &str, text: &str) -> SearchSpec {
    serde_json::from_value(json!({"key": key, "type": "name", "method": "text_match", "text": text}))
        .unwrap()
}

#[test]
fn requests_sent_before_upload_are_answered_after_ingestion() {
    let start = Instant::now();
    let mut session = Session::new();
    session.viewport.request_full(XType::Distance, start);
    session.searches.set_specs(&[name_search("s1", "b")], start).unwrap();
    session.poll(start);
    session.upload(NEWICK);
    session.drain();

    assert!(session.upload_errors.is_empty());
    let base = session.viewport.base().expect("base tier");
    assert_eq!(base.nodes.len(), 7);
    let result = session.searches.detailed("s1").expect("search result");
    assert_eq!(result.kind, SearchResultKind::Complete);
    assert_eq!(result.data.len(), 1);
    assert_eq!(result.data[0].name, "B");
    assert_eq!(session.searches.overview("s1").map(<[_]>::len), Some(1));
}

#[test]
fn superseded_search_never_overwrites_newer_result() {
    let start = Instant::now();
    let mut session = Session::new();
    session.upload(NEWICK);
    session.drain();

    session.searches.set_specs(&[name_search("s1", "a")], start).unwrap();
    session.poll(start);
    session.searches.set_specs(&[name_search("s1", "c")], start).unwrap();
    session.poll(start);
    session.drain();

    let result = session.searches.detailed("s1").unwrap();
    assert_eq!(result.data.len(), 1);
    assert_eq!(result.data[0].name, "C");
    assert_eq!(session.searches.in_flight("s1"), 0);
}

#[test]
fn failed_upload_reports_status_error() {
    let mut session = Session::new();
    session.upload(" ;");
    session.drain();
    assert_eq!(session.upload_errors.len(), 1);
}

#[test]
fn errored_search_is_sent_again() {
    let start = Instant::now();
    let mut session = Session::new();
    session.upload(NEWICK);
    session.drain();

    let broken: SearchSpec = serde_json::from_value(
        json!({"key": "s1", "type": "number", "number_method": "~", "number": 1}),
    )
    .unwrap();
    session.searches.set_specs(&[broken], start).unwrap();
    session.poll(start);
    session.drain();
    assert_eq!(session.search_errors, 1);
    assert_eq!(session.searches.in_flight("s1"), 0);
    assert!(session.searches.detailed("s1").is_none());

    session.poll(Instant::now());
    assert_eq!(session.searches.in_flight("s1"), 1);
    session.drain();
    assert_eq!(session.search_errors, 2);
}
