//! IonBridge runtime core.
//!
//! This library is the event-loop, resource, and IPC-dispatch engine that
//! backs a hybrid native/webview application framework. It owns a single
//! asynchronous I/O reactor shared by every subsystem, the lifetime of file
//! descriptors, sockets, and timers, and the request/response dispatch
//! surface that bridges webview `ipc://` URIs into native operations.
//!
//! # High-Level API
//!
//! Most embedders construct a [`lifecycle::Core`] and talk to it through the
//! [`ipc::Router`]:
//!
//! ```ignore
//! use ionbridge::config::CoreOptions;
//! use ionbridge::lifecycle::Core;
//!
//! let core = Core::new(CoreOptions::default())?;
//! core.start()?;
//!
//! let router = core.router();
//! router.invoke("ipc://fs.stat?seq=1&path=/tmp", None, callback);
//! ```
//!
//! Window embedding, script injection, and configuration parsing live in the
//! surrounding application; this crate is deliberately UI-free.

pub mod buffers;
pub mod config;
pub mod error;
pub mod fs;
pub mod id;
pub mod ipc;
pub mod lifecycle;
pub mod logging;
pub mod net;
pub mod reactor;
pub mod resource;
pub mod response;
pub mod timers;

/// Version of the IonBridge core library.
///
/// Synchronized across all components in the workspace; defined in
/// `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
