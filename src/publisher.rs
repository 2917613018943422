use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::config::{PublisherConfig, PublisherKind};
use crate::events::{routing_key, SessionEvent};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("bus transport error: {0}")]
    Transport(String),
    #[error("bus rejected publish with status {0}")]
    Status(u16),
    #[error("event was not routed to any queue (routing key {0})")]
    Unrouted(&'static str),
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Sink for outbound session events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &SessionEvent) -> Result<(), PublishError>;
}

/// Pick the publisher once at start-up.
pub fn from_config(config: &PublisherConfig) -> Result<Arc<dyn EventPublisher>, PublishError> {
    match config.kind {
        PublisherKind::Memory => Ok(Arc::new(InMemoryPublisher::new())),
        PublisherKind::Bus => Ok(Arc::new(BusPublisher::new(config)?)),
    }
}

/// In-process broadcast hub for local runs and tests.
pub struct InMemoryPublisher {
    sender: broadcast::Sender<SessionEvent>,
}

impl Default for InMemoryPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self {
            sender: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EventPublisher for InMemoryPublisher {
    /// No-op if nobody is listening.
    async fn publish(&self, event: &SessionEvent) -> Result<(), PublishError> {
        tracing::debug!(
            event_type = event.kind().as_str(),
            session_id = %event.session_id,
            "in-memory publish"
        );
        let _ = self.sender.send(event.clone());
        Ok(())
    }
}

#[derive(Deserialize)]
struct PublishReply {
    routed: bool,
}

/// Publishes to a RabbitMQ exchange through the management HTTP API.
///
/// One HTTP round trip per event, without publisher confirms. Suited to low
/// event rates; a broker under heavy load should be fed over AMQP instead.
pub struct BusPublisher {
    client: reqwest::Client,
    publish_url: String,
    username: String,
    password: String,
}

impl BusPublisher {
    pub fn new(config: &PublisherConfig) -> Result<Self, PublishError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| PublishError::Transport(e.to_string()))?;
        let publish_url = format!(
            "{}/api/exchanges/{}/{}/publish",
            config.bus_url.trim_end_matches('/'),
            config.vhost,
            config.exchange
        );
        Ok(Self {
            client,
            publish_url,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }
}

#[async_trait]
impl EventPublisher for BusPublisher {
    async fn publish(&self, event: &SessionEvent) -> Result<(), PublishError> {
        let key = routing_key(event.kind());
        let body = serde_json::json!({
            "properties": { "content_type": "application/json" },
            "routing_key": key,
            "payload": serde_json::to_string(event)?,
            "payload_encoding": "string",
        });

        let response = self
            .client
            .post(&self.publish_url)
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PublishError::Status(status.as_u16()));
        }
        let reply: PublishReply = response
            .json()
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;
        if !reply.routed {
            return Err(PublishError::Unrouted(key));
        }
        Ok(())
    }
}
