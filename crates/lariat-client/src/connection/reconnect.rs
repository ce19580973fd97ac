// Reconnect controller.
//
// Entered from the reader or flusher on a transport failure. Exactly
// one controller runs at a time: the transition to Reconnecting is made
// under the state lock and later failures for the same or older
// generations are ignored.
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use super::{ConnCore, Connection, Status};
use super::wire_io::establish;
use crate::errors::Error;

impl ConnCore {
    pub(crate) fn handle_io_error(self: &Arc<Self>, generation: u64, err: Error) {
        let reconnecting = {
            let mut state = self.lock_state();
            if state.generation != generation {
                return;
            }
            if matches!(state.status, Status::Closed | Status::Reconnecting) {
                return;
            }
            state.last_error = Some(err);
            let reconnecting = self.opts.allow_reconnect && state.status == Status::Connected;
            if reconnecting {
                state.status = Status::Reconnecting;
                // The output buffer becomes the pending buffer; writes
                // keep succeeding into it up to the configured cap.
                state.pending_mode = true;
                // Dropping these tears down this generation's tasks;
                // the flusher makes a last write attempt on its way out.
                state.flush_tx = None;
                state.stop_tx = None;
            }
            reconnecting
        };
        if reconnecting {
            if let Some(cb) = &self.opts.disconnected_cb {
                cb(&Connection { core: self.clone() });
            }
            tokio::spawn(run_reconnect(self.clone()));
        } else {
            self.close_internal();
        }
    }
}

pub(crate) async fn run_reconnect(core: Arc<ConnCore>) {
    // Give the failed transport a beat to settle before redialing.
    tokio::time::sleep(Duration::from_millis(10)).await;
    for attempt in 1..=core.opts.max_reconnect {
        if core.is_closed() {
            return;
        }
        let addr = core.next_server();
        match establish(&core.opts, &addr).await {
            Ok(est) => {
                if core.install_transport(est, &addr).is_err() {
                    // Closed while we were dialing.
                    return;
                }
                core.stats
                    .reconnects
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                tracing::debug!(host = %addr.host, attempt, "reconnected");
                let conn = Connection { core: core.clone() };
                // Push the replayed state and drained pending buffer to
                // the broker before telling the application.
                let _ = conn.flush_timeout(core.opts.connect_timeout).await;
                if let Some(cb) = &core.opts.reconnected_cb {
                    cb(&conn);
                }
                return;
            }
            Err(err) => {
                tracing::debug!(error = %err, host = %addr.host, attempt, "reconnect attempt failed");
            }
        }
        let jitter = Duration::from_millis(rand::rng().random_range(0..=100));
        tokio::time::sleep(core.opts.reconnect_wait + jitter).await;
    }
    tracing::warn!(
        attempts = core.opts.max_reconnect,
        "reconnect attempts exhausted, closing"
    );
    {
        let mut state = core.lock_state();
        state.last_error.get_or_insert(Error::NoServers);
    }
    core.close_internal();
}
