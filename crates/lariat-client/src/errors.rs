// Client error taxonomy.
//
// Errors are cloneable so the last connection error can be both stored
// on the connection and handed to callers and async handlers.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // Configuration
    #[error("invalid server url: {0}")]
    InvalidUrl(String),
    #[error("timeout must be greater than zero")]
    BadTimeout,
    #[error("invalid subject: {0}")]
    BadSubject(String),
    #[error("invalid queue group name: {0}")]
    BadQueueName(String),

    // Connection lifecycle
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection draining")]
    ConnectionDraining,
    #[error("secure connection required by server")]
    SecureConnRequired,
    #[error("secure connection not available from server")]
    SecureConnWanted,
    #[error("operation timed out")]
    Timeout,
    #[error("no servers available for connection")]
    NoServers,
    #[error("outbound buffer limit exceeded during reconnect")]
    ReconnectBufExceeded,
    #[error("stale connection")]
    StaleConnection,
    #[error("authorization failed: {0}")]
    AuthorizationFailed(String),

    // Subscriptions
    #[error("invalid subscription")]
    BadSubscription,
    #[error("illegal operation for this subscription type")]
    TypeSubscription,
    #[error("slow consumer, messages dropped")]
    SlowConsumer,
    #[error("maximum messages delivered")]
    MaxMessages,

    // Request/reply
    #[error("no responders available for request")]
    NoResponders,
    #[error("message payload exceeds server limit")]
    MaxPayload,

    // Parse / protocol / transport
    #[error("control line exceeds {0} bytes")]
    LineTooLong(usize),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("server error: {0}")]
    ServerError(String),
    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<lariat_wire::Error> for Error {
    fn from(err: lariat_wire::Error) -> Self {
        Error::Protocol(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Protocol(format!("bad json: {err}"))
    }
}

// Classify a `-ERR` argument string from the broker. Authorization and
// staleness are fatal in their own right and get dedicated variants so
// callers can match on them.
pub(crate) fn classify_server_error(args: &str) -> Error {
    let message = args.trim().trim_matches('\'');
    let folded = message.to_ascii_lowercase();
    if folded.contains("authorization") || folded.contains("authentication") {
        Error::AuthorizationFailed(message.to_string())
    } else if folded.contains("stale connection") {
        Error::StaleConnection
    } else {
        Error::ServerError(message.to_string())
    }
}
