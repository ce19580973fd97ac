// Connection options and tuning defaults.
use std::sync::Arc;
use std::time::Duration;

use crate::connection::Connection;
use crate::errors::{Error, Result};
use crate::subscription::Subscription;

pub const DEFAULT_PORT: u16 = 4222;
pub const DEFAULT_MAX_RECONNECT: usize = 10;
pub const DEFAULT_RECONNECT_WAIT: Duration = Duration::from_secs(2);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

// Per-subscription mailbox depth between the reader task and delivery.
pub(crate) const DEFAULT_MAILBOX_CAPACITY: usize = 8192;
// Bound on protocol buffered in memory while reconnecting.
pub(crate) const DEFAULT_PENDING_CAPACITY: usize = 1024 * 1024;
// One pending signal is enough to wake the flusher; the channel only
// needs headroom so producers never block on the nudge.
pub(crate) const FLUSH_SIGNAL_CAPACITY: usize = 1024;
pub(crate) const MAX_CONTROL_LINE: usize = 4096;

/// Callback invoked on connection lifecycle events.
pub type ConnCallback = Arc<dyn Fn(&Connection) + Send + Sync>;
/// Callback invoked for asynchronous errors, with the implicated
/// subscription when one exists.
pub type ErrorCallback = Arc<dyn Fn(&Connection, Option<&Subscription>, &Error) + Send + Sync>;

/// Immutable options consumed by [`Options::connect`].
///
/// ```no_run
/// use lariat_client::Options;
/// use std::time::Duration;
///
/// # async fn run() -> lariat_client::Result<()> {
/// let conn = Options::new()
///     .name("billing-worker")
///     .reconnect_wait(Duration::from_millis(500))
///     .connect("nats://127.0.0.1:4222")
///     .await?;
/// # let _ = conn; Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Options {
    pub(crate) name: Option<String>,
    pub(crate) verbose: bool,
    pub(crate) pedantic: bool,
    pub(crate) secure: bool,
    pub(crate) allow_reconnect: bool,
    pub(crate) max_reconnect: usize,
    pub(crate) reconnect_wait: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) drain_timeout: Duration,
    pub(crate) mailbox_capacity: usize,
    pub(crate) pending_capacity: usize,
    pub(crate) disconnected_cb: Option<ConnCallback>,
    pub(crate) reconnected_cb: Option<ConnCallback>,
    pub(crate) closed_cb: Option<ConnCallback>,
    pub(crate) error_cb: Option<ErrorCallback>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            name: None,
            verbose: false,
            pedantic: false,
            secure: false,
            allow_reconnect: true,
            max_reconnect: DEFAULT_MAX_RECONNECT,
            reconnect_wait: DEFAULT_RECONNECT_WAIT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            mailbox_capacity: read_usize_env("LARIAT_MAILBOX_CAP")
                .unwrap_or(DEFAULT_MAILBOX_CAPACITY),
            pending_capacity: read_usize_env("LARIAT_PENDING_CAP")
                .unwrap_or(DEFAULT_PENDING_CAPACITY),
            disconnected_cb: None,
            reconnected_cb: None,
            closed_cb: None,
            error_cb: None,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client name advertised to the broker in `CONNECT`.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Request `+OK` acknowledgements for each protocol operation.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn pedantic(mut self, pedantic: bool) -> Self {
        self.pedantic = pedantic;
        self
    }

    /// Require a TLS connection even for `nats://` urls.
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Disable reconnection; any transport failure closes the connection.
    pub fn no_reconnect(mut self) -> Self {
        self.allow_reconnect = false;
        self
    }

    pub fn max_reconnect(mut self, attempts: usize) -> Self {
        self.max_reconnect = attempts;
        self
    }

    pub fn reconnect_wait(mut self, wait: Duration) -> Self {
        self.reconnect_wait = wait;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Per-subscription mailbox depth. Full mailboxes flag the slow
    /// consumer condition and drop further messages.
    pub fn mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity.max(1);
        self
    }

    pub fn on_disconnected(mut self, cb: impl Fn(&Connection) + Send + Sync + 'static) -> Self {
        self.disconnected_cb = Some(Arc::new(cb));
        self
    }

    pub fn on_reconnected(mut self, cb: impl Fn(&Connection) + Send + Sync + 'static) -> Self {
        self.reconnected_cb = Some(Arc::new(cb));
        self
    }

    pub fn on_closed(mut self, cb: impl Fn(&Connection) + Send + Sync + 'static) -> Self {
        self.closed_cb = Some(Arc::new(cb));
        self
    }

    pub fn on_error(
        mut self,
        cb: impl Fn(&Connection, Option<&Subscription>, &Error) + Send + Sync + 'static,
    ) -> Self {
        self.error_cb = Some(Arc::new(cb));
        self
    }

    /// Connect to the broker. `url` may be a comma-separated cluster
    /// list; reconnection rotates through it.
    pub async fn connect(self, url: &str) -> Result<Connection> {
        if self.connect_timeout.is_zero() {
            return Err(Error::BadTimeout);
        }
        Connection::connect_with_options(url, self).await
    }
}

pub(crate) fn read_usize_env(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
}
