use std::collections::HashMap;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::PeerError;

const CORRELATION_ID_LEN: usize = 12;

/// Envelope every request and response travels in over the channel.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RequestEnvelope {
    pub id: String,
    pub data: Value,
}

/// Matches responses to pending requests by correlation id.
///
/// The pending map is bounded and every entry is evicted either by its
/// matching response or by the caller's deadline, so an unanswered request
/// cannot leak its waiter.
#[derive(Debug)]
pub(crate) struct Correlator {
    capacity: usize,
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
}

impl Correlator {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self) -> Result<(String, oneshot::Receiver<Value>), PeerError> {
        let mut pending = self.pending.lock();
        if pending.len() >= self.capacity {
            return Err(PeerError::RequestLimit(self.capacity));
        }
        let mut id = correlation_id();
        while pending.contains_key(&id) {
            id = correlation_id();
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(id.clone(), tx);
        Ok((id, rx))
    }

    /// Resolve the waiter whose id matches the inbound payload, if any.
    /// Non-envelope payloads and unknown ids are ignored; each id resolves
    /// at most once.
    pub fn resolve(&self, payload: &[u8]) -> bool {
        let Ok(envelope) = serde_json::from_slice::<RequestEnvelope>(payload) else {
            return false;
        };
        let waiter = self.pending.lock().remove(&envelope.id);
        match waiter {
            Some(tx) => {
                // the waiter may have hit its deadline already
                let _ = tx.send(envelope.data);
                true
            }
            None => false,
        }
    }

    pub fn evict(&self, id: &str) -> bool {
        self.pending.lock().remove(id).is_some()
    }

    pub fn clear(&self) {
        self.pending.lock().clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

fn correlation_id() -> String {
    let mut rng = rand::thread_rng();
    (0..CORRELATION_ID_LEN)
        .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn resolves_matching_id_exactly_once() {
        let correlator = Correlator::new(8);
        let (id, rx) = correlator.register().expect("register");
        assert_eq!(correlator.pending_len(), 1);

        let payload =
            serde_json::to_vec(&json!({ "id": id, "data": { "op": "pong" } })).expect("encode");
        assert!(correlator.resolve(&payload));
        assert_eq!(correlator.pending_len(), 0);
        assert_eq!(rx.await.expect("resolved"), json!({ "op": "pong" }));

        // a duplicate response finds no waiter
        assert!(!correlator.resolve(&payload));
    }

    #[test]
    fn unknown_ids_and_junk_are_ignored() {
        let correlator = Correlator::new(8);
        let (_id, _rx) = correlator.register().expect("register");
        let unknown =
            serde_json::to_vec(&json!({ "id": "nope", "data": null })).expect("encode");
        assert!(!correlator.resolve(&unknown));
        assert!(!correlator.resolve(b"not json"));
        assert_eq!(correlator.pending_len(), 1);
    }

    #[test]
    fn capacity_is_enforced() {
        let correlator = Correlator::new(2);
        let _first = correlator.register().expect("first");
        let _second = correlator.register().expect("second");
        let err = correlator.register().expect_err("third refused");
        assert!(matches!(err, PeerError::RequestLimit(2)));
    }

    #[test]
    fn evict_releases_the_slot() {
        let correlator = Correlator::new(1);
        let (id, _rx) = correlator.register().expect("register");
        assert!(correlator.evict(&id));
        assert!(!correlator.evict(&id));
        assert_eq!(correlator.pending_len(), 0);
        correlator.register().expect("slot reusable");
    }

    #[test]
    fn ids_are_twelve_alphanumerics() {
        let id = correlation_id();
        assert_eq!(id.len(), CORRELATION_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
