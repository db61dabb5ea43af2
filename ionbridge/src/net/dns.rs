//! DNS resolution.

use serde_json::json;

use crate::error::CoreError;
use crate::ipc::message::Seq;
use crate::ipc::reply::{Reply, ReplyFn};
use crate::reactor::Dispatcher;

/// The DNS service. Resolution rides the platform resolver via the reactor.
pub struct DnsService {
    dispatcher: Dispatcher,
}

impl DnsService {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Resolves `hostname`, preferring an IPv4 address, and replies with
    /// `{data: ip}`.
    pub fn lookup(&self, seq: Seq, hostname: String, cb: ReplyFn) {
        self.dispatcher.dispatch(move || {
            tokio::spawn(async move {
                let reply = match tokio::net::lookup_host((hostname.as_str(), 0)).await {
                    Ok(addrs) => {
                        let mut addrs: Vec<_> = addrs.collect();
                        addrs.sort_by_key(|addr| !addr.is_ipv4());
                        match addrs.first() {
                            Some(addr) => Reply::data(
                                seq,
                                "dns.lookup",
                                json!(addr.ip().to_string()),
                            ),
                            None => Reply::err(
                                seq,
                                "dns.lookup",
                                json!({
                                    "code": "EAI_NODATA",
                                    "message": format!("no address found for {hostname}"),
                                }),
                            ),
                        }
                    }
                    Err(error) => {
                        // getaddrinfo failures reach us without an errno;
                        // surface the resolver's symbolic name instead.
                        let code = if error.raw_os_error().is_some() {
                            CoreError::platform(&error).code()
                        } else {
                            "EAI_NONAME"
                        };
                        Reply::err(
                            seq,
                            "dns.lookup",
                            json!({ "code": code, "message": error.to_string() }),
                        )
                    }
                };
                cb(reply);
            });
        });
    }
}
