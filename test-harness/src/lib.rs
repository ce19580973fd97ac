//! In-process broker for integration tests.
//!
//! Speaks the lariat wire protocol over real TCP sockets: SUB/UNSUB
//! bookkeeping with wildcard matching, queue-group fanout, PING/PONG,
//! header passthrough, and 503 no-responders replies. Enough broker to
//! exercise the client end to end without a production deployment.
mod broker;

pub use broker::{BrokerConfig, MockBroker};
