//! Socket services and shared peer types.
//!
//! TCP and UDP peers live in one [`SocketTable`] as explicit enum variants;
//! a peer accepted by a server references its server by id only (a weak
//! index into the same table), never by pointer, so teardown order cannot
//! dangle.

pub mod dns;
pub mod interfaces;
pub mod sockopt;
pub mod tcp;
pub mod udp;

use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use tokio::net::{TcpStream, UdpSocket};
use tokio::task::AbortHandle;

use crate::error::CoreError;
use crate::id::Id;
use crate::ipc::reply::ReplyFn;
use crate::resource::Table;

/// Listen backlog for TCP servers.
pub const DEFAULT_BACKLOG: u32 = 128;

/// Read buffer size for stream and datagram receive loops.
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Remote endpoint details for events.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub ip: String,
    pub family: &'static str,
    pub port: u16,
}

impl From<SocketAddr> for PeerInfo {
    fn from(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip().to_string(),
            family: if addr.is_ipv4() { "ipv4" } else { "ipv6" },
            port: addr.port(),
        }
    }
}

/// A connected (or accepted) TCP endpoint.
pub struct TcpClient {
    pub stream: Arc<TcpStream>,
    /// Owning server's id, for accepted peers. Lookup-only.
    pub server: Option<Id>,
    pub reader: Option<AbortHandle>,
    pub timeout: Option<AbortHandle>,
}

/// A listening TCP server.
pub struct TcpServer {
    pub local: SocketAddr,
    pub accept: AbortHandle,
}

/// A bound UDP socket.
pub struct UdpPeer {
    pub socket: Arc<UdpSocket>,
    pub recv: Option<AbortHandle>,
    /// Callback re-attached when a lifecycle pause ends.
    pub recv_cb: Option<ReplyFn>,
    pub paused: bool,
}

/// A tagged socket resource. Dispatch between protocols is explicit.
pub enum Socket {
    TcpClient(TcpClient),
    TcpServer(TcpServer),
    Udp(UdpPeer),
}

impl Socket {
    /// The raw fd, for socket-option calls.
    pub fn raw_fd(&self) -> Option<RawFd> {
        match self {
            Socket::TcpClient(client) => Some(client.stream.as_raw_fd()),
            Socket::TcpServer(_) => None,
            Socket::Udp(peer) => Some(peer.socket.as_raw_fd()),
        }
    }

    /// Cancels every task attached to this socket. Called on removal; the
    /// handle itself closes when the last `Arc` drops.
    pub fn abort_tasks(&self) {
        match self {
            Socket::TcpClient(client) => {
                if let Some(reader) = &client.reader {
                    reader.abort();
                }
                if let Some(timeout) = &client.timeout {
                    timeout.abort();
                }
            }
            Socket::TcpServer(server) => server.accept.abort(),
            Socket::Udp(peer) => {
                if let Some(recv) = &peer.recv {
                    recv.abort();
                }
            }
        }
    }
}

/// The table owning every socket resource.
pub type SocketTable = Table<Socket>;

/// Removes a socket and cancels its tasks. Runs on the reactor thread.
pub(crate) fn remove_socket(sockets: &SocketTable, id: Id) -> bool {
    match sockets.remove(id) {
        Some(socket) => {
            socket.abort_tasks();
            true
        }
        None => false,
    }
}

/// Parses `ip` and `port` into an address. The presence of `:` in `ip`
/// selects IPv6.
pub fn parse_addr(ip: &str, port: u16) -> Result<SocketAddr, CoreError> {
    let addr = if ip.contains(':') {
        ip.parse::<std::net::Ipv6Addr>()
            .map(|ip| SocketAddr::new(ip.into(), port))
    } else {
        ip.parse::<std::net::Ipv4Addr>()
            .map(|ip| SocketAddr::new(ip.into(), port))
    };
    addr.map_err(|_| CoreError::Parse(format!("invalid address '{ip}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_addr_selects_family_by_colon() {
        assert!(parse_addr("127.0.0.1", 80).unwrap().is_ipv4());
        assert!(parse_addr("::1", 80).unwrap().is_ipv6());
        assert!(parse_addr("not-an-ip", 80).is_err());
        assert!(parse_addr("example.com", 80).is_err());
    }

    #[test]
    fn peer_info_from_addr() {
        let info = PeerInfo::from("127.0.0.1:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(info.ip, "127.0.0.1");
        assert_eq!(info.family, "ipv4");
        assert_eq!(info.port, 8080);

        let info = PeerInfo::from("[::1]:9090".parse::<SocketAddr>().unwrap());
        assert_eq!(info.family, "ipv6");
    }
}
