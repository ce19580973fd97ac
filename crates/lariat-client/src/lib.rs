//! Client for a text-based publish/subscribe messaging broker.
//!
//! # Purpose
//! Maintains a persistent TCP (optionally TLS) connection to a broker,
//! publishes opaque byte payloads on subjects, and delivers matching
//! messages to subscriptions either through callbacks or by synchronous
//! pulling. Request/reply, flush barriers, transparent reconnection
//! with pending-write buffering, and graceful drain are built in.
//!
//! # Design notes
//! Publishes never block on the network: they append to a coalescing
//! write buffer under the connection lock and nudge a flusher task.
//! Each connection runs a reader task and a flusher task; every
//! asynchronous subscription adds one delivery task that serializes its
//! callback.
mod connection;
mod errors;
mod inbox;
mod message;
mod options;
mod server;
mod subscription;
mod transport;

pub use connection::{Connection, Stats, Status, connect};
pub use errors::{Error, Result};
pub use inbox::{INBOX_PREFIX, new_inbox};
pub use message::Message;
pub use options::{ConnCallback, ErrorCallback, Options};
pub use subscription::{MessageHandler, Subscription};

// Header types are part of the public API surface.
pub use lariat_wire::HeaderMap;
pub use lariat_wire::ServerInfo;
pub use lariat_wire::headers;
pub use lariat_wire::subject;
