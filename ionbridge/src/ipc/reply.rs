//! The result envelope flowing back through every callback.
//!
//! Routed calls populate exactly one of `data` or `err`; unsolicited events
//! may populate neither (a queued response alone is a valid event). The
//! `source` string names the handler that produced the reply.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::CoreError;
use crate::id::Id;
use crate::ipc::message::{Seq, UNSOLICITED};
use crate::response::{Headers, QueuedResponse};

/// Callback invoked with the outcome of a service operation.
///
/// Event-emitting resources (servers, connected sockets, recv loops) store
/// their callback and invoke it repeatedly.
pub type ReplyFn = Arc<dyn Fn(Reply) + Send + Sync + 'static>;

/// Wraps a closure into a [`ReplyFn`].
pub fn reply_fn(f: impl Fn(Reply) + Send + Sync + 'static) -> ReplyFn {
    Arc::new(f)
}

/// A reply that discards its result. Used for fire-and-forget teardown.
pub fn discard() -> ReplyFn {
    Arc::new(|_| {})
}

/// The result envelope.
#[derive(Debug, Clone)]
pub struct Reply {
    pub seq: Seq,
    pub source: String,
    pub data: Option<Value>,
    pub err: Option<Value>,
    pub headers: Headers,
    pub queued: Option<QueuedResponse>,
}

impl Reply {
    /// A successful reply carrying `value` under `data`.
    pub fn data(seq: impl Into<Seq>, source: &str, value: Value) -> Self {
        Self {
            seq: seq.into(),
            source: source.to_string(),
            data: Some(value),
            err: None,
            headers: Headers::new(),
            queued: None,
        }
    }

    /// A failed reply carrying `value` under `err`.
    pub fn err(seq: impl Into<Seq>, source: &str, value: Value) -> Self {
        Self {
            seq: seq.into(),
            source: source.to_string(),
            data: None,
            err: Some(value),
            headers: Headers::new(),
            queued: None,
        }
    }

    /// An unsolicited event (`seq == "-1"`).
    pub fn event(source: &str, value: Value) -> Self {
        Self::data(UNSOLICITED, source, value)
    }

    /// An unsolicited reply whose payload is only the queued response.
    pub fn queued_event(source: &str, queued: QueuedResponse) -> Self {
        Self {
            seq: UNSOLICITED.to_string(),
            source: source.to_string(),
            data: None,
            err: None,
            headers: queued.headers.clone(),
            queued: Some(queued),
        }
    }

    /// Builds the `{err: {id?, code, message}}` shape from a core error.
    pub fn from_error(seq: impl Into<Seq>, source: &str, error: &CoreError, id: Option<Id>) -> Self {
        let mut body = json!({
            "code": error.code(),
            "message": error.to_string(),
        });
        if let Some(id) = id {
            body["id"] = json!(id.to_string());
        }
        Self::err(seq, source, body)
    }

    /// Attaches a queued response (and adopts its headers).
    pub fn with_queued(mut self, queued: QueuedResponse) -> Self {
        self.headers = queued.headers.clone();
        self.queued = Some(queued);
        self
    }

    pub fn is_err(&self) -> bool {
        self.err.is_some()
    }

    /// Whether this reply is an unsolicited event.
    pub fn is_event(&self) -> bool {
        self.seq == UNSOLICITED
    }

    /// The JSON envelope: `source` plus exactly one of `data`/`err` when
    /// present.
    pub fn json(&self) -> Value {
        let mut envelope = json!({ "source": self.source });
        if let Some(err) = &self.err {
            envelope["err"] = err.clone();
        } else if let Some(data) = &self.data {
            envelope["data"] = data.clone();
        }
        envelope
    }
}

impl std::fmt::Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.json())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_reply_envelope() {
        let reply = Reply::data("7", "fs.open", json!({"fd": 3}));
        let envelope = reply.json();
        assert_eq!(envelope["source"], "fs.open");
        assert_eq!(envelope["data"]["fd"], 3);
        assert!(envelope.get("err").is_none());
        assert!(!reply.is_event());
    }

    #[test]
    fn err_reply_envelope() {
        let reply = Reply::from_error(
            "7",
            "fs.close",
            &CoreError::NotOpen(9),
            Some(9),
        );
        let envelope = reply.json();
        assert_eq!(envelope["err"]["code"], "ENOTOPEN");
        assert_eq!(envelope["err"]["id"], "9");
        assert!(envelope.get("data").is_none());
        assert!(reply.is_err());
    }

    #[test]
    fn event_is_unsolicited() {
        let reply = Reply::event("tcp.bind", json!({"clientId": "1"}));
        assert_eq!(reply.seq, UNSOLICITED);
        assert!(reply.is_event());
    }

    #[test]
    fn queued_event_adopts_headers() {
        let queued = QueuedResponse::new(
            bytes::Bytes::from_static(b"abc"),
            Headers::new().set("X-Method", "fsRead"),
        );
        let reply = Reply::queued_event("fs.read", queued);
        assert_eq!(reply.headers.get("X-Method"), Some("fsRead"));
        assert!(reply.queued.is_some());
        assert!(reply.data.is_none() && reply.err.is_none());
    }
}
