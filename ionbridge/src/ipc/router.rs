//! The name→handler table turning URIs into service calls.
//!
//! Handlers are registered under dotted names (`fs.read`, `udp.bind`).
//! `invoke` parses the URI into a [`Message`] and either calls the handler
//! inline (sync entries) or funnels it through the reactor's dispatcher
//! (async entries, the default). A handler is obliged to call its reply
//! callback exactly once per routed message.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::id::{rand64, Id};
use crate::ipc::message::Message;
use crate::ipc::reply::{Reply, ReplyFn};
use crate::reactor::Dispatcher;

/// A registered message handler.
pub type HandlerFn = Arc<dyn Fn(Message, ReplyFn) + Send + Sync + 'static>;

#[derive(Clone)]
struct RouteEntry {
    is_async: bool,
    handler: HandlerFn,
}

#[derive(Clone)]
struct Listener {
    token: Id,
    handler: HandlerFn,
}

/// Maps `ipc://<name>` requests to handlers.
pub struct Router {
    dispatcher: Dispatcher,
    table: Mutex<HashMap<String, RouteEntry>>,
    preserved: Mutex<Option<HashMap<String, RouteEntry>>>,
    listeners: Mutex<HashMap<String, Vec<Listener>>>,
}

impl Router {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            table: Mutex::new(HashMap::new()),
            preserved: Mutex::new(None),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Registers `handler` under `name`. Async handlers (the default choice
    /// throughout the core) run on the reactor thread.
    pub fn map(&self, name: &str, is_async: bool, handler: impl Fn(Message, ReplyFn) + Send + Sync + 'static) {
        self.table.lock().unwrap().insert(
            name.to_string(),
            RouteEntry {
                is_async,
                handler: Arc::new(handler),
            },
        );
    }

    /// Removes the handler under `name`.
    pub fn unmap(&self, name: &str) {
        self.table.lock().unwrap().remove(name);
    }

    /// Registers a passive listener for `name`. Listeners observe every
    /// message routed to the name but cannot reply.
    pub fn listen(&self, name: &str, handler: impl Fn(Message, ReplyFn) + Send + Sync + 'static) -> Id {
        let token = rand64();
        self.listeners
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .push(Listener {
                token,
                handler: Arc::new(handler),
            });
        token
    }

    /// Removes one listener by token. Returns false if unknown.
    pub fn unlisten(&self, name: &str, token: Id) -> bool {
        let mut listeners = self.listeners.lock().unwrap();
        let Some(list) = listeners.get_mut(name) else {
            return false;
        };
        let before = list.len();
        list.retain(|listener| listener.token != token);
        let removed = list.len() < before;
        if list.is_empty() {
            listeners.remove(name);
        }
        removed
    }

    /// Parses `uri` and routes it.
    ///
    /// Returns `false` if parsing failed or no handler is mapped; otherwise
    /// the handler (and any listeners) will observe the message and the
    /// handler will call `callback` exactly once.
    pub fn invoke(&self, uri: &str, body: Option<Bytes>, callback: ReplyFn) -> bool {
        let message = match Message::parse(uri) {
            Ok(message) => match body {
                Some(body) => message.with_body(body),
                None => message,
            },
            Err(error) => {
                warn!(%uri, %error, "unroutable message");
                return false;
            }
        };
        self.invoke_message(message, callback)
    }

    /// Routes an already-parsed message.
    pub fn invoke_message(&self, message: Message, callback: ReplyFn) -> bool {
        let entry = {
            let table = self.table.lock().unwrap();
            table.get(&message.name).cloned()
        };

        let Some(entry) = entry else {
            debug!(name = %message.name, "no handler mapped");
            return false;
        };

        self.notify_listeners(&message);

        if entry.is_async {
            let handler = entry.handler;
            let dispatched = message;
            self.dispatcher.dispatch(move || handler(dispatched, callback));
        } else {
            (entry.handler)(message, callback);
        }
        true
    }

    fn notify_listeners(&self, message: &Message) {
        let list = {
            let listeners = self.listeners.lock().unwrap();
            listeners.get(&message.name).cloned()
        };
        let Some(list) = list else { return };

        let sink: ReplyFn = Arc::new(|_: Reply| {});
        for listener in list {
            (listener.handler)(message.clone(), Arc::clone(&sink));
        }
    }

    /// Snapshots the current table so a webview reload can restore the
    /// exact handler set.
    pub fn preserve_current_table(&self) {
        let snapshot = self.table.lock().unwrap().clone();
        *self.preserved.lock().unwrap() = Some(snapshot);
    }

    /// Re-applies the preserved snapshot over the current table, if any.
    pub fn restore_preserved_table(&self) {
        let preserved = self.preserved.lock().unwrap().clone();
        if let Some(preserved) = preserved {
            self.table.lock().unwrap().extend(preserved);
        }
    }

    /// Number of mapped handlers.
    pub fn len(&self) -> usize {
        self.table.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::reply::reply_fn;
    use crate::reactor::dispatcher::Dispatcher;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sync_router() -> (Router, tokio::sync::mpsc::UnboundedReceiver<crate::reactor::Job>) {
        let (dispatcher, rx) = Dispatcher::new();
        (Router::new(dispatcher), rx)
    }

    #[test]
    fn sync_handler_runs_inline() {
        let (router, _rx) = sync_router();
        router.map("echo", false, |message, reply| {
            reply(Reply::data(
                message.seq.clone(),
                "echo",
                json!({"name": message.name}),
            ));
        });

        let got = Arc::new(Mutex::new(None));
        let got_clone = Arc::clone(&got);
        let routed = router.invoke(
            "ipc://echo?seq=5",
            None,
            reply_fn(move |reply| {
                *got_clone.lock().unwrap() = Some(reply);
            }),
        );

        assert!(routed);
        let reply = got.lock().unwrap().take().unwrap();
        assert_eq!(reply.seq, "5");
        assert_eq!(reply.json()["data"]["name"], "echo");
    }

    #[test]
    fn async_handler_goes_through_dispatcher() {
        let (router, mut rx) = sync_router();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        router.map("work", true, move |_, _| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(router.invoke("ipc://work", None, reply_fn(|_| {})));
        assert_eq!(hits.load(Ordering::SeqCst), 0, "not yet drained");

        rx.try_recv().unwrap()();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invoke_unknown_name_returns_false() {
        let (router, _rx) = sync_router();
        assert!(!router.invoke("ipc://nobody.home", None, reply_fn(|_| {})));
    }

    #[test]
    fn invoke_bad_uri_returns_false() {
        let (router, _rx) = sync_router();
        router.map("x", false, |_, _| {});
        assert!(!router.invoke("not-a-uri", None, reply_fn(|_| {})));
        assert!(!router.invoke("ipc://x?id=bogus", None, reply_fn(|_| {})));
    }

    #[test]
    fn unmap_removes_handler() {
        let (router, _rx) = sync_router();
        router.map("gone", false, |_, _| {});
        assert!(router.invoke("ipc://gone", None, reply_fn(|_| {})));
        router.unmap("gone");
        assert!(!router.invoke("ipc://gone", None, reply_fn(|_| {})));
    }

    #[test]
    fn listeners_observe_routed_messages() {
        let (router, _rx) = sync_router();
        router.map("observed", false, |_, reply| {
            reply(Reply::data("-1", "observed", json!({})));
        });

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        let token = router.listen("observed", move |_, _| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        router.invoke("ipc://observed", None, reply_fn(|_| {}));
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        assert!(router.unlisten("observed", token));
        assert!(!router.unlisten("observed", token));

        router.invoke("ipc://observed", None, reply_fn(|_| {}));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn preserve_and_restore_table() {
        let (router, _rx) = sync_router();
        router.map("keep.me", false, |_, _| {});
        router.preserve_current_table();

        router.unmap("keep.me");
        assert!(router.is_empty());

        router.restore_preserved_table();
        assert_eq!(router.len(), 1);
        assert!(router.invoke("ipc://keep.me", None, reply_fn(|_| {})));
    }
}
