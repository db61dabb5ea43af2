//! The queued-response store.
//!
//! Binary payloads cannot ride the string-only message channel into a
//! webview. Instead a service parks the payload here and the reply carries a
//! pickup URI (`ipc://post?id=<id>`); the WebHost fetches the body out of
//! band. Entries are TTL-bounded — a webview that never collects its payload
//! must not leak it — and a once-per-second sweep evicts the expired.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::id::{rand64, Id};

/// Interval between expiry sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Line-oriented ASCII headers attached to a queued response.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: &str, value: impl fmt::Display) -> Self {
        self.fields.push((name.to_string(), value.to_string()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.fields {
            writeln!(f, "{name}: {value}")?;
        }
        Ok(())
    }
}

/// A binary payload pending out-of-band pickup by the WebHost.
#[derive(Debug, Clone)]
pub struct QueuedResponse {
    pub id: Id,
    pub worker_id: Option<String>,
    pub headers: Headers,
    /// Shared body buffer; in-flight writes may hold the same allocation.
    pub body: Bytes,
    /// Absolute expiry, milliseconds since the epoch. Zero until stored.
    ttl: u64,
}

impl QueuedResponse {
    pub fn new(body: Bytes, headers: Headers) -> Self {
        Self {
            id: 0,
            worker_id: None,
            headers,
            body,
            ttl: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    fn is_expired(&self, now_ms: u64) -> bool {
        self.ttl < now_ms
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Owns response bodies pending webview pickup.
pub struct ResponseStore {
    entries: Mutex<HashMap<Id, QueuedResponse>>,
    ttl: Duration,
}

impl ResponseStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Stores `response`, assigning an id if it has none, and stamps its
    /// expiry. Returns the id under which it can be picked up.
    pub fn put(&self, mut response: QueuedResponse) -> Id {
        if response.id == 0 {
            response.id = rand64();
        }
        let id = response.id;
        response.ttl = epoch_ms() + self.ttl.as_millis() as u64;
        self.entries.lock().unwrap().insert(id, response);
        id
    }

    /// Returns the stored response without removing it.
    ///
    /// An entry past its TTL is already dead even if the sweep has not
    /// collected it yet.
    pub fn get(&self, id: Id) -> Option<QueuedResponse> {
        let now = epoch_ms();
        self.entries
            .lock()
            .unwrap()
            .get(&id)
            .filter(|response| !response.is_expired(now))
            .cloned()
    }

    /// Explicit eviction after pickup.
    pub fn remove(&self, id: Id) {
        self.entries.lock().unwrap().remove(&id);
    }

    pub fn has(&self, id: Id) -> bool {
        self.entries.lock().unwrap().contains_key(&id)
    }

    /// Whether `body`'s allocation is still owned by the store.
    ///
    /// The WebHost uses this to decide whether an outbound pointer may still
    /// be handed to the platform webview.
    pub fn has_body(&self, body: &Bytes) -> bool {
        self.entries
            .lock()
            .unwrap()
            .values()
            .any(|response| response.body.as_ptr() == body.as_ptr())
    }

    /// Removes every expired entry. Driven by the periodic sweep.
    pub fn expire(&self) {
        let now = epoch_ms();
        self.entries
            .lock()
            .unwrap()
            .retain(|_, response| !response.is_expired(now));
    }

    /// Drops every entry, expired or not. Used at teardown.
    pub fn remove_all(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Stores `response` and returns the pickup URI the WebHost fetches.
    ///
    /// Snippet generation around the URI is the WebHost's concern; the core
    /// guarantees only that the entry is still present when the fetch
    /// arrives within the TTL window.
    pub fn create_pickup(&self, response: QueuedResponse) -> (Id, String) {
        let id = self.put(response);
        (id, format!("ipc://post?id={id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_ttl(ms: u64) -> ResponseStore {
        ResponseStore::new(Duration::from_millis(ms))
    }

    fn response(body: &'static [u8]) -> QueuedResponse {
        QueuedResponse::new(
            Bytes::from_static(body),
            Headers::new()
                .set("Content-Type", "application/octet-stream")
                .set("Content-Length", body.len()),
        )
    }

    #[test]
    fn put_assigns_nonzero_id() {
        let store = store_with_ttl(1000);
        let id = store.put(response(b"payload"));
        assert_ne!(id, 0);
        assert!(store.has(id));
    }

    #[test]
    fn get_does_not_remove() {
        let store = store_with_ttl(1000);
        let id = store.put(response(b"payload"));

        assert!(store.get(id).is_some());
        assert!(store.get(id).is_some());
        store.remove(id);
        assert!(store.get(id).is_none());
    }

    #[test]
    fn expire_drops_only_stale_entries() {
        let store = store_with_ttl(30);
        let id = store.put(response(b"short-lived"));

        store.expire();
        assert!(store.has(id), "entry inside its TTL window survives");

        std::thread::sleep(Duration::from_millis(50));
        store.expire();
        assert!(!store.has(id), "entry past its TTL window is evicted");
    }

    #[test]
    fn get_respects_ttl_before_sweep() {
        let store = store_with_ttl(30);
        let id = store.put(response(b"stale"));

        std::thread::sleep(Duration::from_millis(50));
        assert!(store.get(id).is_none(), "expired entry is dead to readers");
        assert!(store.has(id), "sweep has not collected it yet");
    }

    #[test]
    fn has_body_matches_shared_allocation() {
        let store = store_with_ttl(1000);
        let body = Bytes::from(vec![1u8, 2, 3, 4]);
        let outbound = body.clone();

        let id = store.put(QueuedResponse::new(body, Headers::new()));
        assert!(store.has_body(&outbound));

        store.remove(id);
        assert!(!store.has_body(&outbound));
    }

    #[test]
    fn create_pickup_uri_shape() {
        let store = store_with_ttl(1000);
        let (id, uri) = store.create_pickup(response(b"x"));
        assert_eq!(uri, format!("ipc://post?id={id}"));
        assert!(store.has(id));
    }

    #[test]
    fn remove_all_clears_store() {
        let store = store_with_ttl(1000);
        store.put(response(b"a"));
        store.put(response(b"b"));
        assert_eq!(store.len(), 2);
        store.remove_all();
        assert!(store.is_empty());
    }

    #[test]
    fn headers_render_line_oriented() {
        let headers = Headers::new()
            .set("Content-Type", "application/octet-stream")
            .set("X-Method", "fsRead");
        let text = headers.to_string();
        assert!(text.contains("Content-Type: application/octet-stream\n"));
        assert!(text.contains("X-Method: fsRead\n"));
        assert_eq!(headers.get("x-method"), Some("fsRead"));
    }
}
