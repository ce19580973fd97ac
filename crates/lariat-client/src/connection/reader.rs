// Reader task: drives the protocol parser and dispatches frames.
use std::sync::Arc;

use tokio::sync::watch;

use super::ConnCore;
use super::wire_io::OpReader;

pub(crate) async fn run_reader(
    core: Arc<ConnCore>,
    mut reader: OpReader,
    mut stop: watch::Receiver<bool>,
    generation: u64,
) {
    loop {
        tokio::select! {
            // Fires when the connection tears this generation down;
            // dropping the sender counts.
            changed = stop.changed() => {
                let _ = changed;
                break;
            }
            op = reader.read_op() => match op {
                Ok(op) => core.dispatch_op(op, generation),
                Err(err) => {
                    tracing::debug!(error = %err, generation, "reader task stopped");
                    core.handle_io_error(generation, err);
                    break;
                }
            }
        }
    }
}
