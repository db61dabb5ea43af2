//! The IPC dispatch surface: messages, the result envelope, and the router.

pub mod message;
pub mod reply;
pub mod router;
pub mod routes;

pub use message::{Message, MessageClient, Seq, UNSOLICITED};
pub use reply::{discard, reply_fn, Reply, ReplyFn};
pub use router::{HandlerFn, Router};
