//! Router dispatch and queued-response pickup, end to end.

use std::collections::HashMap;
use std::sync::mpsc;
use std::time::Duration;

use bytes::Bytes;
use ionbridge::config::CoreOptions;
use ionbridge::ipc::message::encode_uri_component;
use ionbridge::ipc::reply_fn;
use ionbridge::ipc::Reply;
use ionbridge::lifecycle::Core;
use serde_json::json;

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

fn start_core(options: CoreOptions) -> std::sync::Arc<Core> {
    let core = Core::new(options);
    core.start().unwrap();
    core
}

fn call(core: &Core, uri: &str, body: Option<Bytes>) -> Reply {
    let (tx, rx) = mpsc::channel();
    let routed = core.invoke(
        uri,
        body,
        reply_fn(move |reply| {
            let _ = tx.send(reply);
        }),
    );
    assert!(routed, "no handler for {uri}");
    rx.recv_timeout(REPLY_TIMEOUT).expect("reply timed out")
}

#[test]
fn invoke_returns_false_for_unknown_or_malformed() {
    let core = start_core(CoreOptions::default());

    assert!(!core.invoke("ipc://nobody.home?seq=1", None, reply_fn(|_| {})));
    assert!(!core.invoke("http://fs.stat", None, reply_fn(|_| {})));
    assert!(!core.invoke("ipc://fs.stat?id=not-a-number", None, reply_fn(|_| {})));

    core.shutdown();
}

#[test]
fn custom_handlers_compose_with_builtins() {
    let core = start_core(CoreOptions::default());
    let router = core.router();

    router.map("app.echo", true, |msg, reply| {
        let value = msg.get_or("value", "").to_string();
        reply(Reply::data(msg.seq.clone(), "app.echo", json!(value)));
    });

    let reply = call(&core, "ipc://app.echo?seq=9&value=hi%20there", None);
    assert_eq!(reply.seq, "9");
    assert_eq!(reply.json()["data"], "hi there");

    router.unmap("app.echo");
    assert!(!core.invoke("ipc://app.echo?seq=10", None, reply_fn(|_| {})));

    core.shutdown();
}

#[test]
fn queued_response_pickup_and_ttl_expiry() {
    // Shrink the response TTL so expiry is observable.
    let mut map = HashMap::new();
    map.insert("responses.ttlMs".to_string(), "300".to_string());
    let options = CoreOptions::from_map(&map).unwrap();
    let core = start_core(options);

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("payload");
    std::fs::write(&file, b"pickup-me").unwrap();

    let path = encode_uri_component(file.to_str().unwrap());
    let opened = call(
        &core,
        &format!("ipc://fs.open?seq=1&id=55&path={path}&flags=0&mode=0"),
        None,
    );
    assert!(opened.json().get("err").is_none());

    let read = call(&core, "ipc://fs.read?seq=2&id=55&len=9&offset=0", None);
    let queued_id = read.queued.as_ref().expect("read queues a response").id;

    // Pickup within the TTL window succeeds and evicts the entry.
    let pickup = call(&core, &format!("ipc://post?seq=3&id={queued_id}"), None);
    let body = pickup.queued.as_ref().expect("pickup returns the body");
    assert_eq!(&body.body[..], b"pickup-me");
    assert!(!core.responses().has(queued_id));

    // A second read's response dies after the TTL.
    let read = call(&core, "ipc://fs.read?seq=4&id=55&len=9&offset=0", None);
    let queued_id = read.queued.as_ref().unwrap().id;
    std::thread::sleep(Duration::from_millis(500));

    let expired = call(&core, &format!("ipc://post?seq=5&id={queued_id}"), None);
    assert!(expired.json().get("err").is_some(), "expired pickup must fail");

    core.shutdown();
}

#[test]
fn cancelled_message_never_reaches_its_service() {
    use ionbridge::ipc::Message;
    use tokio_util::sync::CancellationToken;

    let core = start_core(CoreOptions::default());

    let token = CancellationToken::new();
    token.cancel();
    let message = Message::parse("ipc://fs.stat?seq=1&path=%2Ftmp")
        .unwrap()
        .with_cancellation(token);

    let (tx, rx) = mpsc::channel();
    assert!(core.router().invoke_message(
        message,
        reply_fn(move |reply| {
            let _ = tx.send(reply);
        })
    ));

    let reply = rx.recv_timeout(REPLY_TIMEOUT).unwrap();
    assert_eq!(reply.json()["err"]["code"], "ECANCELED");

    core.shutdown();
}

#[test]
fn listeners_observe_without_replying() {
    let core = start_core(CoreOptions::default());
    let router = core.router();

    let (tx, rx) = mpsc::channel();
    let token = router.listen("dns.lookup", move |msg, _| {
        let _ = tx.send(msg.get_or("hostname", "").to_string());
    });

    let reply = call(&core, "ipc://dns.lookup?seq=1&hostname=localhost", None);
    assert!(reply.json().get("data").is_some());
    assert_eq!(rx.recv_timeout(REPLY_TIMEOUT).unwrap(), "localhost");

    assert!(router.unlisten("dns.lookup", token));
    core.shutdown();
}

#[test]
fn preserved_table_survives_reload() {
    let core = start_core(CoreOptions::default());
    let router = core.router();

    router.map("app.reloadable", true, |msg, reply| {
        reply(Reply::data(msg.seq.clone(), "app.reloadable", json!("ok")));
    });
    router.preserve_current_table();

    // A webview reload tears the handler down...
    router.unmap("app.reloadable");
    assert!(!core.invoke("ipc://app.reloadable?seq=1", None, reply_fn(|_| {})));

    // ...and restoring brings back the exact set.
    router.restore_preserved_table();
    let reply = call(&core, "ipc://app.reloadable?seq=2", None);
    assert_eq!(reply.json()["data"], "ok");

    core.shutdown();
}
