use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::CONTENT_TYPE;
use reqwest::Url;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WebhookConfig;
use crate::message::Message;
use crate::metrics::RelayMetrics;

/// Admits messages whose text starts with the configured prefix.
/// An empty prefix admits everything.
#[derive(Debug, Clone)]
pub struct PrefixFilter {
    prefix: String,
}

impl PrefixFilter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn admits(&self, msg: &Message) -> bool {
        self.prefix.is_empty() || msg.text.starts_with(&self.prefix)
    }
}

/// What happened to a single message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Forwarded,
    Dropped,
    Failed,
}

/// Single consumer that posts each admitted message to the webhook
pub struct Forwarder {
    client: reqwest::Client,
    webhook_url: Url,
    filter: PrefixFilter,
    metrics: Arc<RelayMetrics>,
}

impl Forwarder {
    pub fn new(
        config: &WebhookConfig,
        webhook_url: Url,
        metrics: Arc<RelayMetrics>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build webhook client")?;

        Ok(Self {
            client,
            webhook_url,
            filter: PrefixFilter::new(config.message_prefix.clone()),
            metrics,
        })
    }

    /// Drain the channel one message at a time until it closes or `cancel` fires
    pub async fn run(&self, mut rx: mpsc::Receiver<Message>, cancel: CancellationToken) {
        info!("Forwarding messages to {}", self.webhook_url);

        loop {
            let msg = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!("Cancelled while delivering a message");
                    break;
                }
                _ = self.forward(msg) => {}
            }
        }

        debug!("Forwarding worker stopped");
    }

    /// Make one delivery attempt. Never retries.
    pub async fn forward(&self, msg: Message) -> Delivery {
        if !self.filter.admits(&msg) {
            self.metrics.record_dropped();
            debug!(text = %msg.text, "Skipping message without prefix");
            return Delivery::Dropped;
        }

        let body = match msg.to_webhook_body() {
            Ok(body) => body,
            Err(e) => {
                self.metrics.record_processing_error();
                warn!(msg = ?msg, "Failed to encode message: {}", e);
                return Delivery::Failed;
            }
        };

        let request = match self
            .client
            .post(self.webhook_url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .build()
        {
            Ok(request) => request,
            Err(e) => {
                self.metrics.record_processing_error();
                warn!(msg = ?msg, "Failed to build request: {}", e);
                return Delivery::Failed;
            }
        };

        let response = match self.client.execute(request).await {
            Ok(response) => response,
            Err(e) => {
                self.metrics.record_processing_error();
                warn!(msg = ?msg, "Failed to send webhook: {}", e);
                return Delivery::Failed;
            }
        };

        // Any completed request counts as forwarded, whatever the status
        let status = response.status();
        if !status.is_success() {
            warn!(%status, "Webhook responded with an error status");
        }

        self.metrics.record_forwarded();
        debug!("Forwarded message successfully");
        Delivery::Forwarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use serde_json::{json, Value};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn message(text: &str) -> Message {
        Message {
            text: text.to_string(),
            channel: "general".to_string(),
            username: "alice".to_string(),
            protocol: "irc".to_string(),
            ..Default::default()
        }
    }

    fn forwarder(url: &str, prefix: &str) -> (Forwarder, Arc<RelayMetrics>) {
        let mut webhook = Config::default().webhook;
        webhook.message_prefix = prefix.to_string();
        let metrics = Arc::new(RelayMetrics::new());
        let forwarder = Forwarder::new(&webhook, Url::parse(url).unwrap(), metrics.clone()).unwrap();
        (forwarder, metrics)
    }

    #[test]
    fn test_filter_empty_prefix_admits_everything() {
        let filter = PrefixFilter::new("");
        assert!(filter.admits(&message("anything")));
        assert!(filter.admits(&message("")));
    }

    #[test]
    fn test_filter_requires_exact_prefix() {
        let filter = PrefixFilter::new("!bot ");
        assert!(filter.admits(&message("!bot ping")));
        assert!(!filter.admits(&message("hi there")));
        assert!(!filter.admits(&message("!bot")));
        assert!(!filter.admits(&message("!BOT ping")));
        // Same decision every time for the same text
        assert!(!filter.admits(&message("hi there")));
    }

    #[tokio::test]
    async fn test_forwards_single_element_array() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("content-type", "application/json"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let (forwarder, metrics) = forwarder(&format!("{}/hook", server.uri()), "");
        assert_eq!(forwarder.forward(message("hello")).await, Delivery::Forwarded);

        let requests = server.received_requests().await.unwrap();
        let body: Value = requests[0].body_json().unwrap();
        assert_eq!(
            body,
            json!([{
                "text": "hello",
                "channel": "general",
                "username": "alice",
                "userid": "",
                "avatar": "",
                "account": "",
                "protocol": "irc",
                "gateway": "",
                "parent_id": "",
                "timestamp": "",
                "id": "",
                "event": ""
            }])
        );
        assert_eq!(metrics.snapshot().forwarded, 1);
    }

    #[tokio::test]
    async fn test_drops_message_without_prefix() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let (forwarder, metrics) = forwarder(&server.uri(), "!bot ");
        assert_eq!(forwarder.forward(message("hi there")).await, Delivery::Dropped);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.dropped, 1);
        assert_eq!(snapshot.forwarded, 0);
        assert_eq!(snapshot.processing_errors, 0);
    }

    #[tokio::test]
    async fn test_error_status_still_counts_as_forwarded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let (forwarder, metrics) = forwarder(&server.uri(), "");
        assert_eq!(forwarder.forward(message("hello")).await, Delivery::Forwarded);
        assert_eq!(metrics.snapshot().forwarded, 1);
    }

    #[tokio::test]
    async fn test_unreachable_webhook_is_counted_and_survived() {
        let (forwarder, metrics) = forwarder("http://127.0.0.1:1/hook", "");
        assert_eq!(forwarder.forward(message("one")).await, Delivery::Failed);
        assert_eq!(forwarder.forward(message("two")).await, Delivery::Failed);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.processing_errors, 2);
        assert_eq!(snapshot.forwarded, 0);
    }

    #[tokio::test]
    async fn test_run_preserves_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(5)
            .mount(&server)
            .await;

        let (forwarder, metrics) = forwarder(&server.uri(), "");
        let (tx, rx) = mpsc::channel(1);
        let worker = tokio::spawn(async move { forwarder.run(rx, CancellationToken::new()).await });

        for i in 0..5 {
            tx.send(message(&format!("m{}", i))).await.unwrap();
        }
        drop(tx);
        worker.await.unwrap();

        let texts: Vec<String> = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .map(|r| {
                let body: Vec<Message> = serde_json::from_slice(&r.body).unwrap();
                body[0].text.clone()
            })
            .collect();
        assert_eq!(texts, vec!["m0", "m1", "m2", "m3", "m4"]);
        assert_eq!(metrics.snapshot().forwarded, 5);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (forwarder, _) = forwarder("http://127.0.0.1:1/hook", "");
        let (_tx, rx) = mpsc::channel::<Message>(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(5), forwarder.run(rx, cancel))
            .await
            .expect("worker did not stop");
    }
}
