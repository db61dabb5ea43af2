//! UDP service: bound sockets, datagram sends, and receive loops.
//!
//! Inbound datagrams travel as queued responses tagged
//! `X-Method: udpReadStart` with the sender's address in `X-Ip`/`X-Port`.
//! The lifecycle controller quiesces every receive loop on pause and
//! re-attaches them on resume without closing the underlying sockets.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::json;
use tokio::net::UdpSocket;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::buffers::SharedBufferLedger;
use crate::error::CoreError;
use crate::id::{rand64, Id};
use crate::ipc::message::{Seq, UNSOLICITED};
use crate::ipc::reply::{Reply, ReplyFn};
use crate::net::{parse_addr, sockopt, Socket, SocketTable, UdpPeer, READ_BUFFER_SIZE};
use crate::reactor::Dispatcher;
use crate::response::{Headers, QueuedResponse, ResponseStore};

/// The UDP service.
pub struct UdpService {
    dispatcher: Dispatcher,
    sockets: Arc<SocketTable>,
    store: Arc<ResponseStore>,
    ledger: Arc<SharedBufferLedger>,
    buffer_ttl: Duration,
}

impl UdpService {
    pub fn new(
        dispatcher: Dispatcher,
        sockets: Arc<SocketTable>,
        store: Arc<ResponseStore>,
        ledger: Arc<SharedBufferLedger>,
        buffer_ttl: Duration,
    ) -> Self {
        Self {
            dispatcher,
            sockets,
            store,
            ledger,
            buffer_ttl,
        }
    }

    /// Binds a socket under `server_id` with `SO_REUSEADDR` enabled.
    pub fn bind(&self, seq: Seq, server_id: Id, ip: String, port: u16, cb: ReplyFn) {
        let sockets = Arc::clone(&self.sockets);
        self.dispatcher.dispatch(move || {
            tokio::spawn(async move {
                let bound = parse_addr(&ip, port).and_then(|addr| {
                    sockopt::bind_reuse_udp(addr).map_err(|e| CoreError::platform(&e))
                });

                let reply = match bound.and_then(|socket| {
                    UdpSocket::from_std(socket).map_err(|e| CoreError::platform(&e))
                }) {
                    Ok(socket) => {
                        let local = socket.local_addr().ok();
                        sockets.insert(
                            server_id,
                            Socket::Udp(UdpPeer {
                                socket: Arc::new(socket),
                                recv: None,
                                recv_cb: None,
                                paused: false,
                            }),
                        );
                        debug!(server_id, %ip, port, "udp socket bound");
                        Reply::data(
                            seq,
                            "udp.bind",
                            json!({
                                "serverId": server_id.to_string(),
                                "port": local.map(|a| a.port()),
                                "ip": local.map(|a| a.ip().to_string()),
                            }),
                        )
                    }
                    Err(error) => Reply::err(
                        seq,
                        "udp.bind",
                        json!({
                            "serverId": server_id.to_string(),
                            "code": error.code(),
                            "message": error.to_string(),
                        }),
                    ),
                };
                cb(reply);
            });
        });
    }

    /// Sends one datagram from `data[offset..offset + len]` to `ip:port`.
    pub fn send(
        &self,
        seq: Seq,
        client_id: Id,
        data: Bytes,
        offset: usize,
        len: usize,
        port: u16,
        ip: String,
        cb: ReplyFn,
    ) {
        let Some(socket) = self.udp_socket(client_id) else {
            cb(Reply::err(
                seq,
                "udp.send",
                json!({ "clientId": client_id.to_string(), "message": "no such client" }),
            ));
            return;
        };

        let end = offset.saturating_add(len);
        if end > data.len() {
            cb(Reply::from_error(
                seq,
                "udp.send",
                &CoreError::Parse(format!(
                    "datagram range {offset}..{end} exceeds payload of {}",
                    data.len()
                )),
                Some(client_id),
            ));
            return;
        }
        let datagram = data.slice(offset..end);

        self.ledger.retain(datagram.clone(), self.buffer_ttl);
        let ledger = Arc::clone(&self.ledger);

        self.dispatcher.dispatch(move || {
            tokio::spawn(async move {
                let result = match parse_addr(&ip, port) {
                    Ok(addr) => socket
                        .send_to(&datagram, addr)
                        .await
                        .map_err(|e| CoreError::platform(&e)),
                    Err(error) => Err(error),
                };
                ledger.release(&datagram);

                let reply = match result {
                    Ok(_) => Reply::data(
                        seq,
                        "udp.send",
                        json!({ "clientId": client_id.to_string(), "status": "0" }),
                    ),
                    Err(error) => Reply::err(
                        seq,
                        "udp.send",
                        json!({
                            "clientId": client_id.to_string(),
                            "code": error.code(),
                            "message": error.to_string(),
                        }),
                    ),
                };
                cb(reply);
            });
        });
    }

    /// Starts the receive loop for `server_id`. Idempotent while a loop is
    /// attached.
    pub fn recv_start(&self, seq: Seq, server_id: Id, cb: ReplyFn) {
        if !self.sockets.contains(server_id) {
            cb(Reply::err(
                seq,
                "udp.readStart",
                json!({ "serverId": server_id.to_string(), "message": "no such server" }),
            ));
            return;
        }

        let sockets = Arc::clone(&self.sockets);
        let store = Arc::clone(&self.store);
        self.dispatcher.dispatch(move || {
            let socket = sockets
                .with(server_id, |socket| match socket {
                    Socket::Udp(peer) if peer.recv.is_none() => Some(Arc::clone(&peer.socket)),
                    _ => None,
                })
                .flatten();

            if let Some(socket) = socket {
                let handle = spawn_recv_loop(
                    server_id,
                    socket,
                    Arc::clone(&store),
                    Arc::clone(&cb),
                );
                sockets.update(server_id, |entry| {
                    if let Socket::Udp(peer) = entry {
                        peer.recv = Some(handle);
                        peer.recv_cb = Some(Arc::clone(&cb));
                        peer.paused = false;
                    }
                });
            }

            cb(Reply::data(seq, "udp.readStart", json!({})));
        });
    }

    /// Stops every receive loop without closing sockets. Lifecycle pause.
    pub fn pause_all_sockets(&self) {
        let sockets = Arc::clone(&self.sockets);
        self.dispatcher.dispatch(move || {
            let mut paused = 0usize;
            for id in sockets.ids() {
                sockets.update(id, |socket| {
                    if let Socket::Udp(peer) = socket {
                        if let Some(recv) = peer.recv.take() {
                            recv.abort();
                            peer.paused = true;
                            paused += 1;
                        }
                    }
                });
            }
            debug!(paused, "udp receive loops paused");
        });
    }

    /// Re-attaches receive loops paused by [`pause_all_sockets`].
    ///
    /// [`pause_all_sockets`]: UdpService::pause_all_sockets
    pub fn resume_all_sockets(&self) {
        let sockets = Arc::clone(&self.sockets);
        let store = Arc::clone(&self.store);
        self.dispatcher.dispatch(move || {
            let mut resumable = Vec::new();
            for id in sockets.ids() {
                sockets.update(id, |socket| {
                    if let Socket::Udp(peer) = socket {
                        if peer.paused {
                            if let Some(cb) = &peer.recv_cb {
                                resumable.push((id, Arc::clone(&peer.socket), Arc::clone(cb)));
                            }
                        }
                    }
                });
            }

            let resumed = resumable.len();
            for (id, socket, cb) in resumable {
                let handle = spawn_recv_loop(id, socket, Arc::clone(&store), cb);
                sockets.update(id, |entry| {
                    if let Socket::Udp(peer) = entry {
                        peer.recv = Some(handle);
                        peer.paused = false;
                    }
                });
            }
            debug!(resumed, "udp receive loops resumed");
        });
    }

    fn udp_socket(&self, id: Id) -> Option<Arc<UdpSocket>> {
        self.sockets
            .with(id, |socket| match socket {
                Socket::Udp(peer) => Some(Arc::clone(&peer.socket)),
                _ => None,
            })
            .flatten()
    }
}

/// Receives datagrams until error or abort, delivering each as a queued
/// response carrying the sender's address.
fn spawn_recv_loop(
    server_id: Id,
    socket: Arc<UdpSocket>,
    store: Arc<ResponseStore>,
    cb: ReplyFn,
) -> AbortHandle {
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((n, from)) => {
                    let headers = Headers::new()
                        .set("Content-Type", "application/octet-stream")
                        .set("Content-Length", n)
                        .set("X-ServerId", server_id)
                        .set("X-Method", "udpReadStart")
                        .set("X-Port", from.port())
                        .set("X-Ip", from.ip());

                    let mut queued =
                        QueuedResponse::new(Bytes::copy_from_slice(&buf[..n]), headers);
                    queued.id = rand64();
                    store.put(queued.clone());
                    cb(Reply::queued_event("udp.readStart", queued));
                }
                Err(error) => {
                    let error = CoreError::platform(&error);
                    cb(Reply::err(
                        UNSOLICITED,
                        "udp.readStart",
                        json!({
                            "serverId": server_id.to_string(),
                            "code": error.code(),
                            "message": error.to_string(),
                        }),
                    ));
                    break;
                }
            }
        }
    })
    .abort_handle()
}
