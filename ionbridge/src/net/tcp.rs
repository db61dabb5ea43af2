//! TCP service: servers, connections, stream reads, and socket tuning.
//!
//! State flow for a TCP resource: `Idle → (Bound|Connecting) →
//! (Listening|Connected) → Reading → (HalfClosed) → Closed`. Every
//! operation enqueues onto the reactor; inbound data travels as queued
//! responses because the message channel is string-only.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::json;
use tokio::net::{TcpSocket, TcpStream};
use tokio::task::AbortHandle;
use tracing::debug;

use crate::buffers::SharedBufferLedger;
use crate::error::CoreError;
use crate::id::{rand64, Id};
use crate::ipc::message::{Seq, UNSOLICITED};
use crate::ipc::reply::{Reply, ReplyFn};
use crate::net::{
    parse_addr, remove_socket, sockopt, PeerInfo, Socket, SocketTable, TcpClient, TcpServer,
    DEFAULT_BACKLOG, READ_BUFFER_SIZE,
};
use crate::reactor::Dispatcher;
use crate::response::{Headers, QueuedResponse, ResponseStore};

/// Keep-alive idle time applied to outbound connections.
const CONNECT_KEEPALIVE_SECS: i32 = 60;

/// The TCP service.
pub struct TcpService {
    dispatcher: Dispatcher,
    sockets: Arc<SocketTable>,
    store: Arc<ResponseStore>,
    ledger: Arc<SharedBufferLedger>,
    buffer_ttl: Duration,
}

impl TcpService {
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

    /// Binds and listens under `server_id`. Each accepted connection gets a
    /// fresh client id and surfaces as an unsolicited event on `cb`.
    pub fn bind(&self, seq: Seq, server_id: Id, ip: String, port: u16, cb: ReplyFn) {
        let sockets = Arc::clone(&self.sockets);
        self.dispatcher.dispatch(move || {
            tokio::spawn(async move {
                let listener = match listen(&ip, port) {
                    Ok(listener) => listener,
                    Err(error) => {
                        cb(Reply::err(
                            seq,
                            "tcp.bind",
                            json!({
                                "serverId": server_id.to_string(),
                                "code": error.code(),
                                "message": error.to_string(),
                            }),
                        ));
                        return;
                    }
                };

                let local = match listener.local_addr() {
                    Ok(local) => local,
                    Err(error) => {
                        let error = CoreError::platform(&error);
                        cb(Reply::err(
                            seq,
                            "tcp.bind",
                            json!({
                                "serverId": server_id.to_string(),
                                "code": error.code(),
                                "message": error.to_string(),
                            }),
                        ));
                        return;
                    }
                };

                let accept_cb = Arc::clone(&cb);
                let accept_sockets = Arc::clone(&sockets);
                let accept = tokio::spawn(async move {
                    loop {
                        match listener.accept().await {
                            Ok((stream, peer)) => {
                                let client_id = rand64();
                                let info = PeerInfo::from(peer);
                                accept_sockets.insert(
                                    client_id,
                                    Socket::TcpClient(TcpClient {
                                        stream: Arc::new(stream),
                                        server: Some(server_id),
                                        reader: None,
                                        timeout: None,
                                    }),
                                );
                                debug!(server_id, client_id, ip = %info.ip, "accepted connection");
                                accept_cb(Reply::event(
                                    "tcp.bind",
                                    json!({
                                        "serverId": server_id.to_string(),
                                        "clientId": client_id.to_string(),
                                        "ip": info.ip,
                                        "family": info.family,
                                        "port": info.port,
                                    }),
                                ));
                            }
                            Err(error) => {
                                accept_cb(Reply::err(
                                    UNSOLICITED,
                                    "tcp.bind",
                                    json!({
                                        "serverId": server_id.to_string(),
                                        "method": "emit",
                                        "message": format!("connection error {error}"),
                                    }),
                                ));
                            }
                        }
                    }
                })
                .abort_handle();

                sockets.insert(
                    server_id,
                    Socket::TcpServer(TcpServer { local, accept }),
                );

                cb(Reply::data(
                    seq,
                    "tcp.bind",
                    json!({
                        "serverId": server_id.to_string(),
                        "port": local.port(),
                        "ip": local.ip().to_string(),
                    }),
                ));
            });
        });
    }

    /// Connects to `ip:port` under `client_id`, then starts reading.
    ///
    /// Success surfaces as the unsolicited `connection` event; inbound
    /// chunks arrive as queued responses tagged `X-Method: tcpConnect`.
    pub fn connect(&self, seq: Seq, client_id: Id, ip: String, port: u16, cb: ReplyFn) {
        let sockets = Arc::clone(&self.sockets);
        let store = Arc::clone(&self.store);
        self.dispatcher.dispatch(move || {
            tokio::spawn(async move {
                let stream = match connect(&ip, port).await {
                    Ok(stream) => stream,
                    Err(error) => {
                        cb(Reply::err(
                            seq,
                            "tcp.connect",
                            json!({
                                "clientId": client_id.to_string(),
                                "method": "Cb",
                                "message": error.to_string(),
                            }),
                        ));
                        return;
                    }
                };

                let stream = Arc::new(stream);
                sockets.insert(
                    client_id,
                    Socket::TcpClient(TcpClient {
                        stream: Arc::clone(&stream),
                        server: None,
                        reader: None,
                        timeout: None,
                    }),
                );

                cb(Reply::event(
                    "tcp.connect",
                    json!({
                        "clientId": client_id.to_string(),
                        "method": "emit",
                        "message": "connection",
                    }),
                ));

                let reader = spawn_read_loop(
                    Arc::clone(&sockets),
                    store,
                    client_id,
                    stream,
                    Arc::clone(&cb),
                    "tcpConnect",
                    "tcp.connect",
                );
                sockets.update(client_id, |socket| {
                    if let Socket::TcpClient(client) = socket {
                        client.reader = Some(reader);
                    }
                });
            });
        });
    }

    /// Attaches a read handler if the peer is not already reading.
    pub fn read_start(&self, seq: Seq, client_id: Id, cb: ReplyFn) {
        if !self.sockets.contains(client_id) {
            cb(not_connected(seq, "tcp.readStart", client_id));
            return;
        }

        let sockets = Arc::clone(&self.sockets);
        let store = Arc::clone(&self.store);
        self.dispatcher.dispatch(move || {
            let stream = sockets
                .with(client_id, |socket| match socket {
                    Socket::TcpClient(client) if client.reader.is_none() => {
                        Some(Arc::clone(&client.stream))
                    }
                    _ => None,
                })
                .flatten();

            match stream {
                Some(stream) => {
                    let reader = spawn_read_loop(
                        Arc::clone(&sockets),
                        store,
                        client_id,
                        stream,
                        Arc::clone(&cb),
                        "tcpReadStart",
                        "tcp.readStart",
                    );
                    sockets.update(client_id, |socket| {
                        if let Socket::TcpClient(client) = socket {
                            client.reader = Some(reader);
                        }
                    });
                    cb(Reply::data(seq, "tcp.readStart", json!({})));
                }
                // Already reading, or the peer vanished mid-dispatch.
                None => cb(Reply::data(seq, "tcp.readStart", json!({}))),
            }
        });
    }

    /// Detaches the read handler.
    pub fn read_stop(&self, seq: Seq, client_id: Id, cb: ReplyFn) {
        if !self.sockets.contains(client_id) {
            cb(not_connected(seq, "tcp.readStop", client_id));
            return;
        }

        let sockets = Arc::clone(&self.sockets);
        self.dispatcher.dispatch(move || {
            sockets.update(client_id, |socket| {
                if let Socket::TcpClient(client) = socket {
                    if let Some(reader) = client.reader.take() {
                        reader.abort();
                    }
                }
            });
            cb(Reply::data(seq, "tcp.readStop", json!(0)));
        });
    }

    /// One-shot write of `data` to the peer.
    ///
    /// The buffer is held in the shared-buffer ledger until the kernel has
    /// consumed it; failures surface as an unsolicited `emit` error.
    pub fn send(&self, seq: Seq, client_id: Id, data: Bytes, cb: ReplyFn) {
        let Some(stream) = self.client_stream(client_id) else {
            cb(not_connected(seq, "tcp.send", client_id));
            return;
        };

        self.ledger.retain(data.clone(), self.buffer_ttl);
        let ledger = Arc::clone(&self.ledger);
        let sockets = Arc::clone(&self.sockets);

        self.dispatcher.dispatch(move || {
            tokio::spawn(async move {
                let buffer = data.clone();
                let result = write_all(&stream, &data).await;
                ledger.release(&buffer);
                sockets.touch(client_id);

                match result {
                    Ok(written) => cb(Reply::data(
                        seq,
                        "tcp.send",
                        json!({
                            "clientId": client_id.to_string(),
                            "result": written.to_string(),
                        }),
                    )),
                    Err(error) => {
                        let error = CoreError::platform(&error);
                        cb(Reply::err(
                            UNSOLICITED,
                            "tcp.send",
                            json!({
                                "clientId": client_id.to_string(),
                                "method": "emit",
                                "message": format!("Write error {error}"),
                            }),
                        ));
                    }
                }
            });
        });
    }

    /// Applies keep-alive with `seconds` idle time (zero disables).
    pub fn set_keep_alive(&self, seq: Seq, client_id: Id, seconds: i32, cb: ReplyFn) {
        if !self.sockets.contains(client_id) {
            cb(not_connected(seq, "tcp.setKeepAlive", client_id));
            return;
        }

        let sockets = Arc::clone(&self.sockets);
        self.dispatcher.dispatch(move || {
            let result = sockets
                .with(client_id, |socket| socket.raw_fd())
                .flatten()
                .map(|fd| sockopt::set_keepalive(fd, seconds));

            let reply = match result {
                Some(Ok(())) => Reply::data(seq, "tcp.setKeepAlive", json!({})),
                Some(Err(error)) => Reply::from_error(
                    seq,
                    "tcp.setKeepAlive",
                    &CoreError::platform(&error),
                    Some(client_id),
                ),
                None => not_connected(seq, "tcp.setKeepAlive", client_id),
            };
            cb(reply);
        });
    }

    /// Arms an inactivity timeout: if the peer sees no reads or writes for
    /// `ms` milliseconds, a `timeout` event is emitted and the handle
    /// closes. Re-arming replaces the previous timer.
    pub fn set_timeout(&self, seq: Seq, client_id: Id, ms: u64, cb: ReplyFn) {
        if !self.sockets.contains(client_id) {
            cb(not_connected(seq, "tcp.setTimeout", client_id));
            return;
        }

        let sockets = Arc::clone(&self.sockets);
        self.dispatcher.dispatch(move || {
            let timeout = Duration::from_millis(ms);
            let watch_sockets = Arc::clone(&sockets);
            let event_cb = Arc::clone(&cb);

            let handle = tokio::spawn(async move {
                loop {
                    let idle = match watch_sockets.idle_for(client_id) {
                        Some(idle) => idle,
                        None => break,
                    };
                    if idle >= timeout {
                        event_cb(Reply::event(
                            "tcp.setTimeout",
                            json!({
                                "clientId": client_id.to_string(),
                                "method": "emit",
                                "message": "timeout",
                            }),
                        ));
                        remove_socket(&watch_sockets, client_id);
                        break;
                    }
                    tokio::time::sleep(timeout - idle).await;
                }
            })
            .abort_handle();

            let armed = sockets
                .with(client_id, |socket| {
                    if let Socket::TcpClient(client) = socket {
                        if let Some(previous) = client.timeout.replace(handle.clone()) {
                            previous.abort();
                        }
                        true
                    } else {
                        false
                    }
                })
                .unwrap_or(false);

            if armed {
                cb(Reply::data(seq, "tcp.setTimeout", json!({})));
            } else {
                handle.abort();
                cb(not_connected(seq, "tcp.setTimeout", client_id));
            }
        });
    }

    /// Half-closes the write side. The read side stays open.
    pub fn shutdown(&self, seq: Seq, client_id: Id, cb: ReplyFn) {
        if !self.sockets.contains(client_id) {
            cb(not_connected(seq, "tcp.shutdown", client_id));
            return;
        }

        let sockets = Arc::clone(&self.sockets);
        self.dispatcher.dispatch(move || {
            let result = sockets
                .with(client_id, |socket| socket.raw_fd())
                .flatten()
                .map(sockopt::shutdown_write);

            let reply = match result {
                Some(Ok(())) => Reply::data(
                    seq,
                    "tcp.shutdown",
                    json!({ "status": "0" }),
                ),
                Some(Err(error)) => Reply::from_error(
                    seq,
                    "tcp.shutdown",
                    &CoreError::platform(&error),
                    Some(client_id),
                ),
                None => not_connected(seq, "tcp.shutdown", client_id),
            };
            cb(reply);
        });
    }

    /// Fully closes the socket (client, server, or UDP peer) and removes it
    /// from the table. The reply fires after teardown on the reactor thread.
    pub fn close(&self, seq: Seq, client_id: Id, cb: ReplyFn) {
        if !self.sockets.contains(client_id) {
            cb(not_connected(seq, "tcp.close", client_id));
            return;
        }

        let sockets = Arc::clone(&self.sockets);
        self.dispatcher.dispatch(move || {
            remove_socket(&sockets, client_id);
            cb(Reply::data(seq, "tcp.close", json!({})));
        });
    }

    /// Tunes the send buffer, reporting the size the platform adopted.
    pub fn send_buffer_size(&self, seq: Seq, id: Id, size: i32, cb: ReplyFn) {
        self.buffer_size_op(seq, id, size, cb, "tcp.sendBufferSize", sockopt::send_buffer_size);
    }

    /// Tunes the receive buffer, reporting the size the platform adopted.
    pub fn recv_buffer_size(&self, seq: Seq, id: Id, size: i32, cb: ReplyFn) {
        self.buffer_size_op(seq, id, size, cb, "tcp.recvBufferSize", sockopt::recv_buffer_size);
    }

    fn buffer_size_op(
        &self,
        seq: Seq,
        id: Id,
        size: i32,
        cb: ReplyFn,
        source: &'static str,
        op: fn(std::os::unix::io::RawFd, i32) -> io::Result<i32>,
    ) {
        if !self.sockets.contains(id) {
            cb(not_connected(seq, source, id));
            return;
        }

        let sockets = Arc::clone(&self.sockets);
        self.dispatcher.dispatch(move || {
            let result = sockets.with(id, |socket| socket.raw_fd()).flatten().map(|fd| op(fd, size));
            let reply = match result {
                Some(Ok(adopted)) => Reply::data(
                    seq,
                    source,
                    json!({ "clientId": id.to_string(), "size": adopted }),
                ),
                Some(Err(error)) => {
                    Reply::from_error(seq, source, &CoreError::platform(&error), Some(id))
                }
                None => not_connected(seq, source, id),
            };
            cb(reply);
        });
    }

    fn client_stream(&self, client_id: Id) -> Option<Arc<TcpStream>> {
        self.sockets
            .with(client_id, |socket| match socket {
                Socket::TcpClient(client) => Some(Arc::clone(&client.stream)),
                _ => None,
            })
            .flatten()
    }
}

fn not_connected(seq: Seq, source: &str, id: Id) -> Reply {
    Reply::err(
        seq,
        source,
        json!({ "clientId": id.to_string(), "message": "Not connected" }),
    )
}

fn listen(ip: &str, port: u16) -> Result<tokio::net::TcpListener, CoreError> {
    let addr = parse_addr(ip, port)?;
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|e| CoreError::platform(&e))?;

    socket.bind(addr).map_err(|e| CoreError::platform(&e))?;
    socket
        .listen(DEFAULT_BACKLOG)
        .map_err(|e| CoreError::platform(&e))
}

async fn connect(ip: &str, port: u16) -> Result<TcpStream, CoreError> {
    let addr = parse_addr(ip, port)?;
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|e| CoreError::platform(&e))?;

    let stream = socket
        .connect(addr)
        .await
        .map_err(|e| CoreError::platform(&e))?;

    // Nagle stays on; keep-alive probes after a minute of silence.
    stream
        .set_nodelay(false)
        .map_err(|e| CoreError::platform(&e))?;
    {
        use std::os::unix::io::AsRawFd;
        sockopt::set_keepalive(stream.as_raw_fd(), CONNECT_KEEPALIVE_SECS)
            .map_err(|e| CoreError::platform(&e))?;
    }
    Ok(stream)
}

/// Writes the whole buffer through the readiness API.
async fn write_all(stream: &TcpStream, data: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < data.len() {
        stream.writable().await?;
        match stream.try_write(&data[written..]) {
            Ok(n) => written += n,
            Err(ref error) if error.kind() == io::ErrorKind::WouldBlock => continue,
            Err(error) => return Err(error),
        }
    }
    Ok(written)
}

/// Reads chunks off `stream` until EOF, error, or abort, delivering each as
/// a queued response. EOF is a clean end: the handle closes without an
/// error event. Per-read allocations are dropped once the store's TTL runs
/// out or the WebHost collects them.
fn spawn_read_loop(
    sockets: Arc<SocketTable>,
    store: Arc<ResponseStore>,
    client_id: Id,
    stream: Arc<TcpStream>,
    cb: ReplyFn,
    method: &'static str,
    source: &'static str,
) -> AbortHandle {
    tokio::spawn(async move {
        let server_id = sockets
            .with(client_id, |socket| match socket {
                Socket::TcpClient(client) => client.server,
                _ => None,
            })
            .flatten();

        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            if stream.readable().await.is_err() {
                remove_socket(&sockets, client_id);
                break;
            }

            match stream.try_read(&mut buf) {
                Ok(0) => {
                    debug!(client_id, "peer closed; clean end of stream");
                    remove_socket(&sockets, client_id);
                    break;
                }
                Ok(n) => {
                    sockets.touch(client_id);

                    let mut headers = Headers::new()
                        .set("Content-Type", "application/octet-stream")
                        .set("Content-Length", n)
                        .set("X-ClientId", client_id)
                        .set("X-Method", method);
                    if let Some(server_id) = server_id {
                        headers = headers.set("X-ServerId", server_id);
                    }

                    let mut queued =
                        QueuedResponse::new(Bytes::copy_from_slice(&buf[..n]), headers);
                    queued.id = rand64();
                    store.put(queued.clone());
                    cb(Reply::queued_event(source, queued));
                }
                Err(ref error) if error.kind() == io::ErrorKind::WouldBlock => continue,
                Err(error) => {
                    let error = CoreError::platform(&error);
                    let mut body = json!({
                        "clientId": client_id.to_string(),
                        "code": error.code(),
                        "message": error.to_string(),
                    });
                    if let Some(server_id) = server_id {
                        body["serverId"] = json!(server_id.to_string());
                    }
                    cb(Reply::err(UNSOLICITED, source, body));
                    remove_socket(&sockets, client_id);
                    break;
                }
            }
        }
    })
    .abort_handle()
}
