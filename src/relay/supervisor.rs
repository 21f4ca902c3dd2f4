use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::message::Message;
use crate::metrics::RelayMetrics;

use super::{MessageSource, StreamError};

/// Keeps a [`MessageSource`] connected, reconnecting with exponential
/// backoff on transient failures for as long as the process runs.
pub struct Supervisor {
    backoff: ExponentialBackoff,
    metrics: Arc<RelayMetrics>,
}

impl Supervisor {
    pub fn new(backoff: ExponentialBackoff, metrics: Arc<RelayMetrics>) -> Self {
        Self { backoff, metrics }
    }

    /// Returns `Ok(())` once cancelled or once the receiving side is gone,
    /// and an error only for permanent failures.
    pub async fn run<S>(
        &mut self,
        source: &S,
        tx: &mpsc::Sender<Message>,
        cancel: &CancellationToken,
    ) -> Result<(), StreamError>
    where
        S: MessageSource + ?Sized,
    {
        loop {
            if cancel.is_cancelled() {
                info!("Relay cancelled, not reconnecting");
                return Ok(());
            }

            match source.stream(&mut self.backoff, tx, cancel).await {
                Ok(()) => {
                    info!("Message stream stopped");
                    return Ok(());
                }
                Err(err @ StreamError::Permanent(_)) => return Err(err),
                Err(err @ StreamError::Transient(_)) => {
                    let delay = self.backoff.next_delay();
                    self.metrics.record_reconnect();
                    warn!(retry = ?delay, "Get messages failed: {}", err);

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            info!("Relay cancelled during backoff");
                            return Ok(());
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    debug!(next_interval = ?self.backoff.current_interval(), "Reconnecting");
                }
            }
        }
    }
}
