//! Parsed form of an `ipc://` request URI.
//!
//! Grammar: `ipc://<name>[?<query>]` where `<name>` is a dotted identifier
//! and `<query>` is URL-encoded key/value pairs. Reserved keys: `seq`
//! (caller sequence number, `"-1"` for unsolicited), `id` (64-bit decimal),
//! `index` (window index). Duplicate keys keep the last value; keys a
//! handler does not recognize are ignored.

use std::collections::HashMap;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;
use crate::id::Id;

/// Caller sequence tag, echoed back to correlate request and reply.
pub type Seq = String;

/// The sequence value marking an unsolicited event.
pub const UNSOLICITED: &str = "-1";

const SCHEME: &str = "ipc://";

/// The webview (or in-process) caller behind a message.
#[derive(Debug, Clone, Default)]
pub struct MessageClient {
    pub id: Id,
    /// Window index; `-1` when the caller is not a window.
    pub index: i32,
}

/// A parsed IPC request.
#[derive(Clone)]
pub struct Message {
    pub name: String,
    pub seq: Seq,
    pub query: HashMap<String, String>,
    pub body: Option<Bytes>,
    pub client: MessageClient,
    pub href: String,
    pub cancellation: Option<CancellationToken>,
}

impl Message {
    /// Parses `uri`, which must carry the `ipc://` scheme and a nonempty
    /// handler name.
    pub fn parse(uri: &str) -> Result<Self, CoreError> {
        let rest = uri
            .strip_prefix(SCHEME)
            .ok_or_else(|| CoreError::Parse(format!("expected {SCHEME} scheme: {uri}")))?;

        let (name, query_str) = match rest.split_once('?') {
            Some((name, query)) => (name, Some(query)),
            None => (rest, None),
        };

        if name.is_empty() {
            return Err(CoreError::Parse("empty handler name".to_string()));
        }

        let mut query = HashMap::new();
        if let Some(query_str) = query_str {
            for pair in query_str.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                // Last value wins for duplicate keys.
                query.insert(decode_uri_component(key)?, decode_uri_component(value)?);
            }
        }

        let seq = query
            .get("seq")
            .cloned()
            .unwrap_or_else(|| UNSOLICITED.to_string());

        let mut client = MessageClient {
            id: 0,
            index: -1,
        };
        if let Some(id) = query.get("id") {
            client.id = id
                .parse()
                .map_err(|_| CoreError::Parse(format!("invalid id '{id}'")))?;
        }
        if let Some(index) = query.get("index") {
            client.index = index
                .parse()
                .map_err(|_| CoreError::Parse(format!("invalid index '{index}'")))?;
        }

        Ok(Self {
            name: name.to_string(),
            seq,
            query,
            body: None,
            client,
            href: uri.to_string(),
            cancellation: None,
        })
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn has(&self, key: &str) -> bool {
        self.query.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, fallback: &'a str) -> &'a str {
        self.get(key).unwrap_or(fallback)
    }

    /// The query value under `key`, or a `ParseError` naming it.
    pub fn require(&self, key: &str) -> Result<&str, CoreError> {
        self.get(key)
            .ok_or_else(|| CoreError::Parse(format!("missing '{key}'")))
    }

    /// Parses the query value under `key` as a 64-bit decimal id.
    pub fn id(&self, key: &str) -> Result<Id, CoreError> {
        self.parsed(key)
    }

    /// Parses the query value under `key` into any `FromStr` numeric.
    pub fn parsed<T: std::str::FromStr>(&self, key: &str) -> Result<T, CoreError> {
        let raw = self.require(key)?;
        raw.parse()
            .map_err(|_| CoreError::Parse(format!("invalid value for '{key}': {raw}")))
    }

    /// Like [`parsed`](Message::parsed) but falls back when the key is absent.
    pub fn parsed_or<T: std::str::FromStr>(&self, key: &str, fallback: T) -> Result<T, CoreError> {
        match self.get(key) {
            None => Ok(fallback),
            Some(raw) => raw
                .parse()
                .map_err(|_| CoreError::Parse(format!("invalid value for '{key}': {raw}"))),
        }
    }

    /// Whether the caller has abandoned this request.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(|token| token.is_cancelled())
    }

    /// The binary payload: the body when present, otherwise the `value`
    /// query parameter as UTF-8 bytes.
    pub fn payload(&self) -> Bytes {
        match &self.body {
            Some(body) => body.clone(),
            None => Bytes::from(self.get_or("value", "").to_string()),
        }
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("name", &self.name)
            .field("seq", &self.seq)
            .field("query", &self.query)
            .field("body_len", &self.body.as_ref().map(Bytes::len))
            .finish()
    }
}

/// Percent-decodes one URI component. `+` is left intact, matching
/// `decodeURIComponent` rather than form encoding.
pub fn decode_uri_component(input: &str) -> Result<String, CoreError> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| CoreError::Parse(format!("malformed escape in '{input}'")))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8(out).map_err(|_| CoreError::Parse(format!("invalid UTF-8 in '{input}'")))
}

/// Percent-encodes one URI component (unreserved characters pass through).
pub fn encode_uri_component(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_name_and_query() {
        let msg = Message::parse("ipc://fs.open?seq=12&path=%2Ftmp%2Fx&flags=2").unwrap();
        assert_eq!(msg.name, "fs.open");
        assert_eq!(msg.seq, "12");
        assert_eq!(msg.get("path"), Some("/tmp/x"));
        assert_eq!(msg.parsed::<i32>("flags").unwrap(), 2);
    }

    #[test]
    fn missing_seq_means_unsolicited() {
        let msg = Message::parse("ipc://ping").unwrap();
        assert_eq!(msg.seq, UNSOLICITED);
        assert!(msg.query.is_empty());
    }

    #[test]
    fn duplicate_keys_keep_last_value() {
        let msg = Message::parse("ipc://x?k=first&k=last").unwrap();
        assert_eq!(msg.get("k"), Some("last"));
    }

    #[test]
    fn reserved_keys_fill_client() {
        let msg = Message::parse("ipc://x?id=42&index=3").unwrap();
        assert_eq!(msg.client.id, 42);
        assert_eq!(msg.client.index, 3);
    }

    #[test]
    fn bad_scheme_is_a_parse_error() {
        assert!(Message::parse("http://x").is_err());
        assert!(Message::parse("ipc://").is_err());
    }

    #[test]
    fn invalid_numeric_query_is_a_parse_error() {
        assert!(Message::parse("ipc://x?id=abc").is_err());
        let msg = Message::parse("ipc://x?len=ten").unwrap();
        assert!(msg.parsed::<u64>("len").is_err());
    }

    #[test]
    fn decode_round_trips_encode() {
        let original = "a b/c?d&e=f%g";
        let encoded = encode_uri_component(original);
        assert_eq!(decode_uri_component(&encoded).unwrap(), original);
    }

    #[test]
    fn decode_rejects_malformed_escape() {
        assert!(decode_uri_component("%zz").is_err());
        assert!(decode_uri_component("%2").is_err());
    }

    #[test]
    fn payload_prefers_body() {
        let msg = Message::parse("ipc://x?value=hello")
            .unwrap()
            .with_body(Bytes::from_static(b"binary"));
        assert_eq!(msg.payload(), Bytes::from_static(b"binary"));

        let msg = Message::parse("ipc://x?value=hello").unwrap();
        assert_eq!(msg.payload(), Bytes::from_static(b"hello"));
    }

    #[test]
    fn cancellation_is_observable() {
        let token = CancellationToken::new();
        let msg = Message::parse("ipc://x")
            .unwrap()
            .with_cancellation(token.clone());
        assert!(!msg.is_cancelled());
        token.cancel();
        assert!(msg.is_cancelled());
    }
}
