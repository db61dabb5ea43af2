//! End-to-end filesystem scenarios through the router.

use std::sync::mpsc;
use std::time::Duration;

use bytes::Bytes;
use ionbridge::config::CoreOptions;
use ionbridge::ipc::message::encode_uri_component;
use ionbridge::ipc::reply_fn;
use ionbridge::ipc::Reply;
use ionbridge::lifecycle::Core;

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    core: std::sync::Arc<Core>,
}

impl Harness {
    fn new() -> Self {
        let core = Core::new(CoreOptions::default());
        core.start().unwrap();
        Self { core }
    }

    /// Invokes `uri` and waits for the first reply.
    fn call(&self, uri: &str, body: Option<Bytes>) -> Reply {
        let (tx, rx) = mpsc::channel();
        let routed = self.core.invoke(
            uri,
            body,
            reply_fn(move |reply| {
                let _ = tx.send(reply);
            }),
        );
        assert!(routed, "no handler for {uri}");
        rx.recv_timeout(REPLY_TIMEOUT).expect("reply timed out")
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.core.shutdown();
    }
}

#[test]
fn open_write_read_close_round_trip() {
    let harness = Harness::new();
    let dir = tempfile::tempdir().unwrap();
    let path = encode_uri_component(dir.path().join("x").to_str().unwrap());

    let constants = harness.call("ipc://fs.constants?seq=0", None);
    let envelope = constants.json();
    let o_rdwr = envelope["data"]["O_RDWR"].as_i64().unwrap();
    let o_creat = envelope["data"]["O_CREAT"].as_i64().unwrap();

    // open -> {id, fd}
    let open = harness.call(
        &format!(
            "ipc://fs.open?seq=1&id=101&path={path}&flags={}&mode=384",
            o_rdwr | o_creat
        ),
        None,
    );
    let open_json = open.json();
    assert!(open_json.get("err").is_none(), "open failed: {open_json}");
    assert_eq!(open_json["data"]["id"], "101");
    assert!(open_json["data"]["fd"].as_i64().unwrap() >= 0);

    // write "hello" -> {result: "5"}
    let write = harness.call(
        "ipc://fs.write?seq=2&id=101&offset=0",
        Some(Bytes::from_static(b"hello")),
    );
    assert_eq!(write.json()["data"]["result"], "5");

    // read 5 bytes back -> queued response with the body and headers
    let read = harness.call("ipc://fs.read?seq=3&id=101&len=5&offset=0", None);
    let queued = read.queued.clone().expect("read delivers a queued response");
    assert_eq!(&queued.body[..], b"hello");
    assert_eq!(queued.headers.get("Content-Length"), Some("5"));
    assert_eq!(queued.headers.get("X-Method"), Some("fsRead"));
    assert_eq!(queued.headers.get("X-Id"), Some("101"));
    assert!(harness.core.responses().has(queued.id));

    // close -> success exactly once
    let close = harness.call("ipc://fs.close?seq=4&id=101", None);
    assert!(close.json().get("err").is_none());

    // second close -> ENOTOPEN
    let again = harness.call("ipc://fs.close?seq=5&id=101", None);
    assert_eq!(again.json()["err"]["code"], "ENOTOPEN");

    // so does any further read
    let read = harness.call("ipc://fs.read?seq=6&id=101&len=1&offset=0", None);
    assert_eq!(read.json()["err"]["code"], "ENOTOPEN");
}

#[test]
fn stat_projects_full_metadata() {
    let harness = Harness::new();
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("stat-me");
    std::fs::write(&file, b"123456789").unwrap();

    let stat = harness.call(
        &format!(
            "ipc://fs.stat?seq=1&path={}",
            encode_uri_component(file.to_str().unwrap())
        ),
        None,
    );
    let envelope = stat.json();
    assert_eq!(envelope["data"]["size"], 9);
    assert_eq!(envelope["data"]["kind"], "file");
    for field in ["mode", "mtime", "nlink", "uid", "gid", "ino", "blksize"] {
        assert!(envelope["data"].get(field).is_some(), "missing {field}");
    }

    let missing = harness.call("ipc://fs.stat?seq=2&path=%2Fno%2Fsuch%2Fpath", None);
    assert_eq!(missing.json()["err"]["code"], "ENOENT");
}

#[test]
fn readdir_returns_entries_as_array() {
    let harness = Harness::new();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("plain"), b"").unwrap();
    std::fs::write(dir.path().join("with,commas,inside"), b"").unwrap();
    std::fs::create_dir(dir.path().join("subdir")).unwrap();

    let listing = harness.call(
        &format!(
            "ipc://fs.readdir?seq=1&path={}",
            encode_uri_component(dir.path().to_str().unwrap())
        ),
        None,
    );
    let envelope = listing.json();
    let entries: Vec<&str> = envelope["data"]["entries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();

    assert_eq!(entries.len(), 3);
    assert!(entries.contains(&"plain"));
    assert!(entries.contains(&"subdir"));
    // Commas in names survive as single entries.
    assert!(entries.contains(&"with,commas,inside"));
}

#[test]
fn rename_round_trip_restores_state() {
    let harness = Harness::new();
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a");
    let b = dir.path().join("b");
    std::fs::write(&a, b"payload").unwrap();

    let enc_a = encode_uri_component(a.to_str().unwrap());
    let enc_b = encode_uri_component(b.to_str().unwrap());

    let rename = harness.call(
        &format!("ipc://fs.rename?seq=1&src={enc_a}&dest={enc_b}"),
        None,
    );
    assert!(rename.json().get("err").is_none());
    assert!(!a.exists() && b.exists());

    let back = harness.call(
        &format!("ipc://fs.rename?seq=2&src={enc_b}&dest={enc_a}"),
        None,
    );
    assert!(back.json().get("err").is_none());

    let stat = harness.call(&format!("ipc://fs.stat?seq=3&path={enc_a}"), None);
    assert_eq!(stat.json()["data"]["size"], 7);
}

#[test]
fn mkdir_copy_unlink_rmdir() {
    let harness = Harness::new();
    let dir = tempfile::tempdir().unwrap();
    let sub = dir.path().join("made");
    let enc_sub = encode_uri_component(sub.to_str().unwrap());

    let mkdir = harness.call(&format!("ipc://fs.mkdir?seq=1&path={enc_sub}&mode=448"), None);
    assert!(mkdir.json().get("err").is_none());
    assert!(sub.is_dir());

    let src = dir.path().join("src");
    let dst = dir.path().join("dst");
    std::fs::write(&src, b"copy me").unwrap();
    let enc_src = encode_uri_component(src.to_str().unwrap());
    let enc_dst = encode_uri_component(dst.to_str().unwrap());

    let copy = harness.call(
        &format!("ipc://fs.copyFile?seq=2&src={enc_src}&dest={enc_dst}&flags=0"),
        None,
    );
    assert!(copy.json().get("err").is_none());
    assert_eq!(std::fs::read(&dst).unwrap(), b"copy me");

    // Exclusive copy onto an existing destination fails with EEXIST.
    let excl = harness.call(
        &format!("ipc://fs.copyFile?seq=3&src={enc_src}&dest={enc_dst}&flags=1"),
        None,
    );
    assert_eq!(excl.json()["err"]["code"], "EEXIST");

    let unlink = harness.call(&format!("ipc://fs.unlink?seq=4&path={enc_dst}"), None);
    assert!(unlink.json().get("err").is_none());
    assert!(!dst.exists());

    let rmdir = harness.call(&format!("ipc://fs.rmdir?seq=5&path={enc_sub}"), None);
    assert!(rmdir.json().get("err").is_none());
    assert!(!sub.exists());
}

#[test]
fn operations_on_unknown_descriptor_fail_synchronously() {
    let harness = Harness::new();

    for uri in [
        "ipc://fs.read?seq=1&id=424242&len=4",
        "ipc://fs.write?seq=2&id=424242&value=x",
        "ipc://fs.close?seq=3&id=424242",
    ] {
        let reply = harness.call(uri, None);
        assert_eq!(reply.json()["err"]["code"], "ENOTOPEN", "for {uri}");
    }
}
