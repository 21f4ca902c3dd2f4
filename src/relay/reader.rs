use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use reqwest::Url;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::config::SourceConfig;
use crate::message::{GatewayRecord, Message};
use crate::metrics::RelayMetrics;

use super::{MessageSource, StreamError};

/// Build `{base}/api/stream`, keeping any path already on the base url
pub fn stream_url(base: &str) -> Result<Url, StreamError> {
    let mut url = Url::parse(base)
        .context("failed to build url")
        .map_err(StreamError::Permanent)?;
    url.path_segments_mut()
        .map_err(|_| StreamError::Permanent(anyhow!("failed to build url: {} cannot be a base", base)))?
        .pop_if_empty()
        .extend(["api", "stream"]);
    Ok(url)
}

/// Reads the gateway's newline-delimited JSON stream over one HTTP connection
pub struct StreamReader {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    metrics: Arc<RelayMetrics>,
}

impl StreamReader {
    pub fn new(config: &SourceConfig, metrics: Arc<RelayMetrics>) -> anyhow::Result<Self> {
        // No overall timeout: the response body stays open indefinitely
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .read_timeout(Duration::from_secs(config.read_timeout_secs))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .context("Failed to build stream client")?;

        Ok(Self {
            client,
            base_url: config.url.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            metrics,
        })
    }

    fn build_request(&self) -> Result<reqwest::Request, StreamError> {
        let url = stream_url(&self.base_url)?;
        let mut request = self.client.get(url);
        if !self.username.is_empty() && !self.password.is_empty() {
            request = request.basic_auth(&self.username, Some(&self.password));
        }
        request
            .build()
            .context("failed to build request")
            .map_err(StreamError::Permanent)
    }

    async fn handle_line(
        &self,
        line: &[u8],
        backoff: &mut ExponentialBackoff,
        tx: &mpsc::Sender<Message>,
        cancel: &CancellationToken,
    ) -> ControlFlow<()> {
        let line = line.trim_ascii();
        if line.is_empty() {
            return ControlFlow::Continue(());
        }

        let msg = match GatewayRecord::decode(line) {
            Ok(GatewayRecord::Chat(msg)) => msg,
            Ok(GatewayRecord::Event(name)) => {
                info!("Received {} event", name);
                return ControlFlow::Continue(());
            }
            Err(e) => {
                self.metrics.record_processing_error();
                warn!(
                    line = %String::from_utf8_lossy(line),
                    "Failed to decode message, skipping: {}", e
                );
                return ControlFlow::Continue(());
            }
        };

        debug!(
            username = %msg.username,
            channel = %msg.channel,
            gateway = %msg.gateway,
            "Received message"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => ControlFlow::Break(()),
            sent = tx.send(msg) => {
                if sent.is_err() {
                    debug!("Forwarding worker is gone, stopping stream");
                    return ControlFlow::Break(());
                }
                self.metrics.record_received();
                backoff.reset();
                ControlFlow::Continue(())
            }
        }
    }
}

#[async_trait]
impl MessageSource for StreamReader {
    async fn stream(
        &self,
        backoff: &mut ExponentialBackoff,
        tx: &mpsc::Sender<Message>,
        cancel: &CancellationToken,
    ) -> Result<(), StreamError> {
        let request = self.build_request()?;

        let mut response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            response = self.client.execute(request) => response
                .context("failed to request messages")
                .map_err(StreamError::Transient)?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(StreamError::Transient(anyhow!(
                "failed to request messages: gateway responded with {}",
                status
            )));
        }

        info!("Listening for messages...");

        let mut lines = LineBuffer::new(MAX_LINE_BYTES);
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                chunk = response.chunk() => chunk
                    .context("failed to read messages")
                    .map_err(StreamError::Transient)?,
            };

            let Some(chunk) = chunk else {
                return Err(StreamError::Transient(anyhow!(
                    "failed to read messages: stream closed by gateway"
                )));
            };

            lines.extend(&chunk);
            while let Some(line) = lines.next_line() {
                let line = match line {
                    Line::Complete(line) => line,
                    Line::Oversize => {
                        self.metrics.record_processing_error();
                        warn!("Discarding record longer than {} bytes", MAX_LINE_BYTES);
                        continue;
                    }
                };
                if self.handle_line(&line, backoff, tx, cancel).await.is_break() {
                    return Ok(());
                }
            }
        }
    }
}

/// Records longer than this are dropped and counted as decode errors
const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, PartialEq, Eq)]
enum Line {
    Complete(Vec<u8>),
    /// A record exceeded the length limit; its bytes were discarded
    Oversize,
}

/// Accumulates body chunks and yields complete `\n`-terminated lines.
///
/// Bytes already searched for a newline are not searched again, and a line
/// growing past `max_len` is thrown away up to its terminating newline.
#[derive(Debug)]
struct LineBuffer {
    pending: Vec<u8>,
    scanned: usize,
    discarding: bool,
    max_len: usize,
}

impl LineBuffer {
    fn new(max_len: usize) -> Self {
        Self {
            pending: Vec::new(),
            scanned: 0,
            discarding: false,
            max_len,
        }
    }

    fn extend(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<Line> {
        match self.pending[self.scanned..].iter().position(|b| *b == b'\n') {
            Some(offset) => {
                let end = self.scanned + offset;
                let mut line: Vec<u8> = self.pending.drain(..=end).collect();
                self.scanned = 0;
                if self.discarding {
                    // Tail of a line already reported as oversize
                    self.discarding = false;
                    return self.next_line();
                }
                line.pop();
                if line.len() > self.max_len {
                    return Some(Line::Oversize);
                }
                Some(Line::Complete(line))
            }
            None => {
                self.scanned = self.pending.len();
                if self.pending.len() > self.max_len {
                    self.pending.clear();
                    self.scanned = 0;
                    if !self.discarding {
                        self.discarding = true;
                        return Some(Line::Oversize);
                    }
                }
                None
            }
        }
    }
}
