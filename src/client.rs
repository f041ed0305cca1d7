//! Caller-side bookkeeping: job ids and the table routing each reply back
//! to whoever asked for it.

use std::collections::HashMap;
use taxonium_protocol::{JobId, Response};

/// Hands out job ids and remembers a route for every outstanding job.
#[derive(Debug)]
pub struct Correlator<R> {
    next_id: JobId,
    pending: HashMap<JobId, R>,
}

impl<R> Default for Correlator<R> {
    fn default() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
        }
    }
}

/// Progress updates and partial variation chunks leave the job open;
/// everything else closes it.
pub fn is_final(response: &Response) -> bool {
    match response {
        Response::Status { data, .. } => data.error.is_some() || data.done,
        Response::VariationData { data, .. } => data.complete,
        _ => true,
    }
}

impl<R> Correlator<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, route: R) -> JobId {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert(id, route);
        id
    }

    /// Route of the job `response` belongs to. The job is dropped from the
    /// table when the response is its last one.
    pub fn accept(&mut self, response: &Response) -> Option<R>
    where
        R: Clone,
    {
        let job_id = response.job_id()?;
        if is_final(response) {
            self.pending.remove(&job_id)
        } else {
            self.pending.get(&job_id).cloned()
        }
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taxonium_protocol::{QueryResult, StatusMessage};

    #[test]
    fn test_out_of_order_replies_reach_their_route() {
        let mut jobs = Correlator::new();
        let first = jobs.register("viewport");
        let second = jobs.register("search:s1");
        assert_ne!(first, second);

        let progress = Response::Status {
            job_id: Some(second),
            data: StatusMessage::progress("searching", None),
        };
        assert_eq!(jobs.accept(&progress), Some("search:s1"));
        assert_eq!(jobs.outstanding(), 2);

        let reply = Response::Query {
            job_id: Some(first),
            data: QueryResult::default(),
        };
        assert_eq!(jobs.accept(&reply), Some("viewport"));
        assert_eq!(jobs.accept(&reply), None);

        let failure = Response::Status {
            job_id: Some(second),
            data: StatusMessage::failure("boom"),
        };
        assert_eq!(jobs.accept(&failure), Some("search:s1"));
        assert_eq!(jobs.outstanding(), 0);
    }
}
