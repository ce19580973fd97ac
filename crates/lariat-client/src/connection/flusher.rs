// Flusher task: coalesces buffered writes into fewer socket syscalls.
use std::sync::Arc;

use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc;

use super::ConnCore;
use crate::transport::BoxedStream;

pub(crate) async fn run_flusher(
    core: Arc<ConnCore>,
    mut writer: WriteHalf<BoxedStream>,
    mut signal: mpsc::Receiver<()>,
    generation: u64,
) {
    loop {
        match signal.recv().await {
            Some(()) => {
                // Writers may have batched several protocol units since
                // the nudge; everything buffered goes out in one write.
                let Some(chunk) = core.take_buffered(generation, false) else {
                    continue;
                };
                if let Err(err) = writer.write_all(&chunk).await {
                    tracing::debug!(error = %err, generation, "flusher write failed");
                    core.handle_io_error(generation, err.into());
                    break;
                }
                if let Err(err) = writer.flush().await {
                    tracing::debug!(error = %err, generation, "flusher flush failed");
                    core.handle_io_error(generation, err.into());
                    break;
                }
            }
            None => {
                // Teardown: push out whatever is still buffered before
                // releasing the socket write half.
                if let Some(chunk) = core.take_buffered(generation, true) {
                    let _ = writer.write_all(&chunk).await;
                    let _ = writer.flush().await;
                }
                break;
            }
        }
    }
}
