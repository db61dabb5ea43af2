//! The default route table.
//!
//! Binds the dotted handler names the webview speaks (`fs.open`,
//! `tcp.bind`, …) to the native services, converting query parameters into
//! typed arguments. Parse failures reply synchronously; everything else
//! flows through the owning service's callback discipline.

use std::sync::Arc;

use serde_json::json;

use crate::error::CoreError;
use crate::fs::constants_json;
use crate::id::{rand64, Id};
use crate::ipc::message::Message;
use crate::ipc::reply::{Reply, ReplyFn};
use crate::lifecycle::Core;
use crate::net::interfaces::network_interfaces;

/// Registers every built-in handler on the core's router.
pub fn map_routes(core: &Arc<Core>) {
    let router = core.router();

    // ── Filesystem ────────────────────────────────────────────────────

    router.map("fs.constants", false, |msg, reply| {
        reply(Reply::data(msg.seq.clone(), "fs.constants", constants_json()));
    });

    route(core, "fs.open", |core, msg, reply| {
        let id = optional_id(&msg, "id")?.unwrap_or_else(rand64);
        let path = msg.require("path")?.to_string();
        let flags = msg.parsed_or("flags", 0i32)?;
        let mode = msg.parsed_or("mode", 0o666u32)?;
        core.fs().open(msg.seq.clone(), id, path, flags, mode, reply);
        Ok(())
    });

    route(core, "fs.close", |core, msg, reply| {
        let id = required_id(&msg, "id")?;
        core.fs().close(msg.seq.clone(), id, reply);
        Ok(())
    });

    route(core, "fs.read", |core, msg, reply| {
        let id = required_id(&msg, "id")?;
        let len = msg.parsed::<usize>("len")?;
        let offset = msg.parsed_or("offset", 0u64)?;
        core.fs().read(msg.seq.clone(), id, len, offset, reply);
        Ok(())
    });

    route(core, "fs.write", |core, msg, reply| {
        let id = required_id(&msg, "id")?;
        let offset = msg.parsed_or("offset", 0u64)?;
        core.fs().write(msg.seq.clone(), id, msg.payload(), offset, reply);
        Ok(())
    });

    route(core, "fs.stat", |core, msg, reply| {
        let path = msg.require("path")?.to_string();
        core.fs().stat(msg.seq.clone(), path, reply);
        Ok(())
    });

    route(core, "fs.unlink", |core, msg, reply| {
        let path = msg.require("path")?.to_string();
        core.fs().unlink(msg.seq.clone(), path, reply);
        Ok(())
    });

    route(core, "fs.rename", |core, msg, reply| {
        let src = msg.require("src")?.to_string();
        let dest = msg.require("dest")?.to_string();
        core.fs().rename(msg.seq.clone(), src, dest, reply);
        Ok(())
    });

    route(core, "fs.copyFile", |core, msg, reply| {
        let src = msg.require("src")?.to_string();
        let dest = msg.require("dest")?.to_string();
        let flags = msg.parsed_or("flags", 0i32)?;
        core.fs().copy_file(msg.seq.clone(), src, dest, flags, reply);
        Ok(())
    });

    route(core, "fs.rmdir", |core, msg, reply| {
        let path = msg.require("path")?.to_string();
        core.fs().rmdir(msg.seq.clone(), path, reply);
        Ok(())
    });

    route(core, "fs.mkdir", |core, msg, reply| {
        let path = msg.require("path")?.to_string();
        let mode = msg.parsed_or("mode", 0o777u32)?;
        core.fs().mkdir(msg.seq.clone(), path, mode, reply);
        Ok(())
    });

    route(core, "fs.readdir", |core, msg, reply| {
        let path = msg.require("path")?.to_string();
        core.fs().readdir(msg.seq.clone(), path, reply);
        Ok(())
    });

    route(core, "fs.retain", |core, msg, reply| {
        let id = required_id(&msg, "id")?;
        let retained = msg.parsed_or("retain", true)?;
        let known = core.fs().retain(id, retained);
        if known {
            reply(Reply::data(
                msg.seq.clone(),
                "fs.retain",
                json!({ "id": id.to_string() }),
            ));
            Ok(())
        } else {
            Err(CoreError::NotOpen(id))
        }
    });

    // ── TCP ───────────────────────────────────────────────────────────

    route(core, "tcp.bind", |core, msg, reply| {
        let server_id = required_id(&msg, "serverId")?;
        let ip = msg.get_or("ip", "0.0.0.0").to_string();
        let port = msg.parsed::<u16>("port")?;
        core.tcp().bind(msg.seq.clone(), server_id, ip, port, reply);
        Ok(())
    });

    route(core, "tcp.connect", |core, msg, reply| {
        let client_id = required_id(&msg, "clientId")?;
        let ip = msg.require("ip")?.to_string();
        let port = msg.parsed::<u16>("port")?;
        core.tcp().connect(msg.seq.clone(), client_id, ip, port, reply);
        Ok(())
    });

    route(core, "tcp.send", |core, msg, reply| {
        let client_id = required_id(&msg, "clientId")?;
        core.tcp().send(msg.seq.clone(), client_id, msg.payload(), reply);
        Ok(())
    });

    route(core, "tcp.readStart", |core, msg, reply| {
        let client_id = required_id(&msg, "clientId")?;
        core.tcp().read_start(msg.seq.clone(), client_id, reply);
        Ok(())
    });

    route(core, "tcp.readStop", |core, msg, reply| {
        let client_id = required_id(&msg, "clientId")?;
        core.tcp().read_stop(msg.seq.clone(), client_id, reply);
        Ok(())
    });

    route(core, "tcp.setKeepAlive", |core, msg, reply| {
        let client_id = required_id(&msg, "clientId")?;
        let seconds = msg.parsed_or("timeout", 0i32)?;
        core.tcp()
            .set_keep_alive(msg.seq.clone(), client_id, seconds, reply);
        Ok(())
    });

    route(core, "tcp.setTimeout", |core, msg, reply| {
        let client_id = required_id(&msg, "clientId")?;
        let ms = msg.parsed::<u64>("timeout")?;
        core.tcp().set_timeout(msg.seq.clone(), client_id, ms, reply);
        Ok(())
    });

    route(core, "tcp.shutdown", |core, msg, reply| {
        let client_id = required_id(&msg, "clientId")?;
        core.tcp().shutdown(msg.seq.clone(), client_id, reply);
        Ok(())
    });

    route(core, "tcp.close", |core, msg, reply| {
        let client_id = required_id(&msg, "clientId")?;
        core.tcp().close(msg.seq.clone(), client_id, reply);
        Ok(())
    });

    route(core, "tcp.sendBufferSize", |core, msg, reply| {
        let id = required_id(&msg, "clientId")?;
        let size = msg.parsed_or("size", 0i32)?;
        core.tcp().send_buffer_size(msg.seq.clone(), id, size, reply);
        Ok(())
    });

    route(core, "tcp.recvBufferSize", |core, msg, reply| {
        let id = required_id(&msg, "clientId")?;
        let size = msg.parsed_or("size", 0i32)?;
        core.tcp().recv_buffer_size(msg.seq.clone(), id, size, reply);
        Ok(())
    });

    // ── UDP ───────────────────────────────────────────────────────────

    route(core, "udp.bind", |core, msg, reply| {
        let server_id = required_id(&msg, "serverId")?;
        let ip = msg.get_or("ip", "0.0.0.0").to_string();
        let port = msg.parsed::<u16>("port")?;
        core.udp().bind(msg.seq.clone(), server_id, ip, port, reply);
        Ok(())
    });

    route(core, "udp.send", |core, msg, reply| {
        let client_id = required_id(&msg, "clientId")?;
        let payload = msg.payload();
        let offset = msg.parsed_or("offset", 0usize)?;
        let len = msg.parsed_or("len", payload.len().saturating_sub(offset))?;
        let port = msg.parsed::<u16>("port")?;
        let ip = msg.require("ip")?.to_string();
        core.udp()
            .send(msg.seq.clone(), client_id, payload, offset, len, port, ip, reply);
        Ok(())
    });

    route(core, "udp.readStart", |core, msg, reply| {
        let server_id = required_id(&msg, "serverId")?;
        core.udp().recv_start(msg.seq.clone(), server_id, reply);
        Ok(())
    });

    // ── DNS / network ─────────────────────────────────────────────────

    route(core, "dns.lookup", |core, msg, reply| {
        let hostname = msg.require("hostname")?.to_string();
        core.dns().lookup(msg.seq.clone(), hostname, reply);
        Ok(())
    });

    router.map("os.networkInterfaces", false, |msg, reply| {
        let result = match network_interfaces() {
            Ok(report) => Reply::data(msg.seq.clone(), "os.networkInterfaces", report),
            Err(error) => Reply::from_error(msg.seq.clone(), "os.networkInterfaces", &error, None),
        };
        reply(result);
    });

    // ── Queued-response pickup ────────────────────────────────────────

    let pickup = Arc::downgrade(core);
    router.map("post", false, move |msg, reply| {
        let seq = msg.seq.clone();
        let Some(pickup) = pickup.upgrade() else {
            reply(Reply::from_error(
                seq,
                "post",
                &CoreError::Internal("core is shut down".to_string()),
                None,
            ));
            return;
        };
        let id = match required_id(&msg, "id") {
            Ok(id) => id,
            Err(error) => {
                reply(Reply::from_error(seq, "post", &error, None));
                return;
            }
        };

        match pickup.responses().get(id) {
            Some(queued) => {
                // Read at most once: the entry leaves the store with the
                // reply.
                pickup.responses().remove(id);
                reply(Reply::data(seq, "post", json!({})).with_queued(queued));
            }
            None => reply(Reply::err(
                seq,
                "post",
                json!({ "id": id.to_string(), "message": "no queued response with that id" }),
            )),
        }
    });
}

/// Registers one async handler with uniform parse-failure replies.
///
/// Handlers hold the core weakly: the router lives inside the core, and a
/// strong capture would cycle and keep both alive forever.
fn route(
    core: &Arc<Core>,
    name: &'static str,
    handler: impl Fn(&Arc<Core>, Message, ReplyFn) -> Result<(), CoreError> + Send + Sync + 'static,
) {
    let weak = Arc::downgrade(core);
    core.router().map(name, true, move |msg, reply| {
        let seq = msg.seq.clone();
        let Some(core) = weak.upgrade() else {
            reply(Reply::from_error(
                seq,
                name,
                &CoreError::Internal("core is shut down".to_string()),
                None,
            ));
            return;
        };
        // Cooperative cancellation boundary: an abandoned request never
        // reaches its service.
        if msg.is_cancelled() {
            reply(Reply::from_error(seq, name, &CoreError::Cancelled, None));
            return;
        }
        if let Err(error) = handler(&core, msg, Arc::clone(&reply)) {
            reply(Reply::from_error(seq, name, &error, None));
        }
    });
}

/// The id under `key`, falling back to the reserved `id` key. Zero and
/// absent are errors.
fn required_id(msg: &Message, key: &str) -> Result<Id, CoreError> {
    match optional_id(msg, key)? {
        Some(id) => Ok(id),
        None => Err(CoreError::Parse(format!("missing '{key}'"))),
    }
}

fn optional_id(msg: &Message, key: &str) -> Result<Option<Id>, CoreError> {
    if msg.has(key) {
        let id = msg.id(key)?;
        if id == 0 {
            return Err(CoreError::Parse(format!("'{key}' must be nonzero")));
        }
        return Ok(Some(id));
    }
    if msg.client.id != 0 {
        return Ok(Some(msg.client.id));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_id_prefers_named_key() {
        let msg = Message::parse("ipc://x?serverId=7&id=9").unwrap();
        assert_eq!(required_id(&msg, "serverId").unwrap(), 7);
    }

    #[test]
    fn required_id_falls_back_to_reserved_id() {
        let msg = Message::parse("ipc://x?id=9").unwrap();
        assert_eq!(required_id(&msg, "serverId").unwrap(), 9);
    }

    #[test]
    fn required_id_rejects_zero_and_absent() {
        let msg = Message::parse("ipc://x?serverId=0").unwrap();
        assert!(required_id(&msg, "serverId").is_err());

        let msg = Message::parse("ipc://x").unwrap();
        assert!(required_id(&msg, "serverId").is_err());
    }
}
