//! Response sequencing state.
//!
//! Each endpoint owns a cursor pointing at the next response to serve. Cursors are
//! transient: they live inside a running instance and start again from zero every
//! time the instance starts.

use crate::model::{Endpoint, MockResponse, ResponseSequenceMode};
use parking_lot::RwLock;
use rand::Rng;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Lock-free cursor for a single endpoint.
///
/// Every advance is one atomic read-modify-write, so concurrent requests to the same
/// endpoint never observe the same position.
#[derive(Default)]
pub struct EndpointCursor(AtomicUsize);

impl EndpointCursor {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    #[must_use]
    pub fn peek(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }

    /// Take the current index and move to the next one, wrapping at `len`.
    #[must_use]
    pub fn advance_wrapping(&self, len: usize) -> usize {
        if len <= 1 {
            return 0;
        }
        let old = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some((v % len + 1) % len))
            .unwrap_or_else(|v| v);
        old % len
    }

    /// Take the current index and move to the next one; stays put once `len` is reached.
    ///
    /// Returns `None` when the cursor is exhausted.
    #[must_use]
    pub fn advance_saturating(&self, len: usize) -> Option<usize> {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                (v < len).then_some(v + 1)
            })
            .ok()
    }
}

impl fmt::Debug for EndpointCursor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("EndpointCursor").field(&self.peek()).finish()
    }
}

/// Tracks the cursor of every endpoint served by one instance.
///
/// The map lock is only held to look a cursor up; the cursor itself is advanced
/// outside of it, so unrelated endpoints never contend.
#[derive(Default)]
pub struct ResponseSequencer {
    cursors: RwLock<HashMap<String, Arc<EndpointCursor>>>,
}

impl ResponseSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequencer with a zeroed cursor for each of the given endpoints.
    pub fn for_endpoints<'a>(endpoint_ids: impl IntoIterator<Item = &'a str>) -> Self {
        let cursors = endpoint_ids
            .into_iter()
            .map(|id| (id.to_string(), Arc::new(EndpointCursor::new())))
            .collect();
        Self {
            cursors: RwLock::new(cursors),
        }
    }

    fn cursor_for(&self, endpoint_id: &str) -> Arc<EndpointCursor> {
        if let Some(cursor) = self.cursors.read().get(endpoint_id) {
            return Arc::clone(cursor);
        }
        let mut cursors = self.cursors.write();
        Arc::clone(cursors.entry(endpoint_id.to_string()).or_default())
    }

    /// Pick the response for the next request to `endpoint`.
    pub fn next_response<'a>(&self, endpoint: &'a Endpoint) -> Cow<'a, MockResponse> {
        let responses = &endpoint.responses;
        if responses.is_empty() {
            return Cow::Owned(MockResponse::no_responses_configured());
        }

        match endpoint.response_sequence_mode {
            ResponseSequenceMode::Random => {
                let index = rand::thread_rng().gen_range(0..responses.len());
                Cow::Borrowed(&responses[index])
            }
            ResponseSequenceMode::Loop if responses.len() == 1 => Cow::Borrowed(&responses[0]),
            ResponseSequenceMode::Loop => {
                let index = self
                    .cursor_for(&endpoint.id)
                    .advance_wrapping(responses.len());
                Cow::Borrowed(&responses[index])
            }
            ResponseSequenceMode::Return404AfterLast => {
                match self
                    .cursor_for(&endpoint.id)
                    .advance_saturating(responses.len())
                {
                    Some(index) => Cow::Borrowed(&responses[index]),
                    None => Cow::Owned(MockResponse::end_of_responses()),
                }
            }
        }
    }

    /// Current cursor position of an endpoint (zero if it has never been served).
    pub fn cursor(&self, endpoint_id: &str) -> usize {
        self.cursors
            .read()
            .get(endpoint_id)
            .map_or(0, |cursor| cursor.peek())
    }

    pub fn reset(&self, endpoint_id: &str) {
        if let Some(cursor) = self.cursors.read().get(endpoint_id) {
            cursor.reset();
        }
    }

    pub fn reset_all(&self) {
        for cursor in self.cursors.read().values() {
            cursor.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HttpAction;
    use std::collections::HashSet;
    use std::thread;

    fn endpoint(bodies: &[&str], mode: ResponseSequenceMode) -> Endpoint {
        let responses = bodies
            .iter()
            .map(|body| MockResponse::new(200, *body))
            .collect();
        Endpoint::with_responses("items", HttpAction::Get, responses).with_mode(mode)
    }

    fn bodies(sequencer: &ResponseSequencer, endpoint: &Endpoint, n: usize) -> Vec<String> {
        (0..n)
            .map(|_| sequencer.next_response(endpoint).json_string.clone())
            .collect()
    }

    #[test]
    fn test_loop_wraps_around() {
        let sequencer = ResponseSequencer::new();
        let endpoint = endpoint(&["A", "B", "C"], ResponseSequenceMode::Loop);
        assert_eq!(bodies(&sequencer, &endpoint, 5), vec!["A", "B", "C", "A", "B"]);
        assert_eq!(sequencer.cursor(&endpoint.id), 2);
    }

    #[test]
    fn test_loop_single_response_always_returns_it() {
        let sequencer = ResponseSequencer::new();
        let endpoint = endpoint(&["A"], ResponseSequenceMode::Loop);
        for _ in 0..10 {
            let response = sequencer.next_response(&endpoint);
            assert_eq!(response.json_string, "A");
            assert_eq!(response.status_code, 200);
        }
    }

    #[test]
    fn test_return_404_after_last_saturates() {
        let sequencer = ResponseSequencer::new();
        let endpoint = endpoint(&["A", "B"], ResponseSequenceMode::Return404AfterLast);

        assert_eq!(sequencer.next_response(&endpoint).json_string, "A");
        assert_eq!(sequencer.next_response(&endpoint).json_string, "B");
        for _ in 0..5 {
            let response = sequencer.next_response(&endpoint);
            assert_eq!(response.status_code, 404);
            assert_eq!(
                response.json_string,
                r#"{"message": "There are no more responses"}"#
            );
            assert_eq!(sequencer.cursor(&endpoint.id), 2);
        }
    }

    #[test]
    fn test_random_visits_every_response_without_moving_cursor() {
        let sequencer = ResponseSequencer::for_endpoints(["seed"]);
        let endpoint = endpoint(&["A", "B"], ResponseSequenceMode::Random);

        let seen: HashSet<String> = bodies(&sequencer, &endpoint, 1000).into_iter().collect();
        assert!(seen.contains("A"));
        assert!(seen.contains("B"));
        assert_eq!(sequencer.cursor(&endpoint.id), 0);
    }

    #[test]
    fn test_empty_responses_yield_synthetic_404() {
        let sequencer = ResponseSequencer::new();
        for mode in [
            ResponseSequenceMode::Loop,
            ResponseSequenceMode::Random,
            ResponseSequenceMode::Return404AfterLast,
        ] {
            let endpoint = endpoint(&[], mode);
            assert_eq!(sequencer.next_response(&endpoint).status_code, 404);
        }
    }

    #[test]
    fn test_endpoints_have_independent_cursors() {
        let sequencer = ResponseSequencer::new();
        let first = endpoint(&["A", "B", "C"], ResponseSequenceMode::Loop);
        let second = endpoint(&["X", "Y"], ResponseSequenceMode::Loop);

        assert_eq!(sequencer.next_response(&first).json_string, "A");
        assert_eq!(sequencer.next_response(&second).json_string, "X");
        assert_eq!(sequencer.next_response(&first).json_string, "B");
        assert_eq!(sequencer.next_response(&second).json_string, "Y");
        assert_eq!(sequencer.next_response(&second).json_string, "X");
    }

    #[test]
    fn test_reset_starts_over() {
        let sequencer = ResponseSequencer::new();
        let endpoint = endpoint(&["A", "B", "C"], ResponseSequenceMode::Return404AfterLast);
        let _ = bodies(&sequencer, &endpoint, 4);

        sequencer.reset(&endpoint.id);
        assert_eq!(sequencer.cursor(&endpoint.id), 0);
        assert_eq!(sequencer.next_response(&endpoint).json_string, "A");

        sequencer.reset_all();
        assert_eq!(sequencer.next_response(&endpoint).json_string, "A");
    }

    #[test]
    fn test_shrunk_response_list_does_not_overflow() {
        let sequencer = ResponseSequencer::new();
        let mut endpoint = endpoint(&["A", "B", "C"], ResponseSequenceMode::Loop);
        let _ = bodies(&sequencer, &endpoint, 2);
        endpoint.responses.truncate(2);
        assert_eq!(bodies(&sequencer, &endpoint, 3), vec!["A", "B", "A"]);
    }

    #[test]
    fn test_concurrent_loop_requests_never_duplicate() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 250;

        let sequencer = Arc::new(ResponseSequencer::new());
        let responses: Vec<MockResponse> = (0..THREADS * PER_THREAD)
            .map(|i| MockResponse::new(200, i.to_string()))
            .collect();
        let endpoint = Arc::new(Endpoint::with_responses(
            "items",
            HttpAction::Get,
            responses,
        ));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let sequencer = Arc::clone(&sequencer);
                let endpoint = Arc::clone(&endpoint);
                thread::spawn(move || {
                    (0..PER_THREAD)
                        .map(|_| sequencer.next_response(&endpoint).json_string.clone())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut served = HashSet::new();
        for handle in handles {
            for body in handle.join().unwrap() {
                assert!(served.insert(body), "a response was served twice");
            }
        }
        assert_eq!(served.len(), THREADS * PER_THREAD);
        assert_eq!(sequencer.cursor(&endpoint.id), 0);
    }

    #[test]
    fn test_concurrent_saturating_requests_serve_each_once() {
        let sequencer = Arc::new(ResponseSequencer::new());
        let responses: Vec<MockResponse> =
            (0..100).map(|i| MockResponse::new(200, i.to_string())).collect();
        let endpoint = Arc::new(
            Endpoint::with_responses("items", HttpAction::Get, responses)
                .with_mode(ResponseSequenceMode::Return404AfterLast),
        );

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let sequencer = Arc::clone(&sequencer);
                let endpoint = Arc::clone(&endpoint);
                thread::spawn(move || {
                    (0..50)
                        .map(|_| sequencer.next_response(&endpoint).into_owned())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let all: Vec<MockResponse> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let served: HashSet<String> = all
            .iter()
            .filter(|r| r.status_code == 200)
            .map(|r| r.json_string.clone())
            .collect();
        assert_eq!(served.len(), 100);
        assert_eq!(all.iter().filter(|r| r.status_code == 404).count(), 100);
        assert_eq!(sequencer.cursor(&endpoint.id), 100);
    }
}
