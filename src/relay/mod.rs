pub mod forwarder;
pub mod reader;
pub mod supervisor;

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::backoff::ExponentialBackoff;
use crate::config::Config;
use crate::message::Message;
use crate::metrics::RelayMetrics;

use self::forwarder::Forwarder;
use self::reader::StreamReader;
use self::supervisor::Supervisor;

/// Why a stream connection ended
#[derive(Debug, Error)]
pub enum StreamError {
    /// Misconfiguration that no amount of retrying will fix
    #[error("{0:#}")]
    Permanent(anyhow::Error),
    /// Connect, read or end-of-stream failure; reconnecting may help
    #[error("{0:#}")]
    Transient(anyhow::Error),
}

/// Something that can stream gateway messages into the hand-off channel
/// for the lifetime of one connection.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Stream until the connection fails or `cancel` fires. Must call
    /// `backoff.reset()` after each message is accepted by the channel.
    /// Returns `Ok(())` only when cancelled or when the receiver is gone.
    async fn stream(
        &self,
        backoff: &mut ExponentialBackoff,
        tx: &mpsc::Sender<Message>,
        cancel: &CancellationToken,
    ) -> Result<(), StreamError>;
}

/// Run the relay until `cancel` fires or the stream fails permanently.
///
/// Spawns the forwarding worker, drives the reconnect supervisor on the
/// current task, and joins the worker before returning.
pub async fn run(config: &Config, metrics: Arc<RelayMetrics>, cancel: CancellationToken) -> Result<()> {
    let cancel = cancel.child_token();
    let (tx, rx) = mpsc::channel(config.relay.channel_capacity);

    let forwarder = Forwarder::new(&config.webhook, config.webhook_url()?, metrics.clone())?;
    let worker_cancel = cancel.clone();
    let worker = tokio::spawn(async move { forwarder.run(rx, worker_cancel).await });

    let reader = StreamReader::new(&config.source, metrics.clone())?;
    let mut supervisor = Supervisor::new(ExponentialBackoff::new(&config.reconnect), metrics);

    info!("Relaying messages from {}", config.source.url);
    let result = supervisor.run(&reader, &tx, &cancel).await;

    cancel.cancel();
    drop(tx);
    let joined = join_worker(worker).await;

    result.context("failed to get messages")?;
    joined
}

async fn join_worker(worker: JoinHandle<()>) -> Result<()> {
    worker.await.map_err(|e| {
        error!("Forwarding worker panicked: {}", e);
        anyhow!("forwarding worker failed: {}", e)
    })
}
