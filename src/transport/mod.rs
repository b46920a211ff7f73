//! The `transport` module defines the capabilities the brew consumes from an
//! external pub/sub service, and ships an in-process implementation of them.
//!
//! The traits mirror how a hosted pub/sub client is split: a publisher side
//! that owns topics and sends payloads, and a subscriber side that manages
//! subscriptions, streams deliveries and takes acknowledgements. A
//! `Connector` builds both clients on demand.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use tracing::debug;

use crate::utils::TransportError;

pub use memory::MemoryTransport;

/// A message handed out by a subscription stream.
///
/// `ack_id` identifies this delivery, not the message; it is what
/// `SubscriberClient::acknowledge` expects back.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub ack_id: String,
    pub data: Bytes,
    pub publish_time: DateTime<Utc>,
}

/// Deliveries for one subscription. The stream ends when the subscription
/// is deleted.
pub type MessageStream = BoxStream<'static, ReceivedMessage>;

#[async_trait]
pub trait PublisherClient: Send + Sync {
    async fn create_topic(&self, topic_path: &str) -> Result<(), TransportError>;

    /// Send `payload` to every subscription of the topic. Returns the
    /// transport's message id.
    async fn publish(&self, topic_path: &str, payload: Bytes) -> Result<String, TransportError>;

    /// Create the topic unless it is already there.
    async fn ensure_topic_exists(&self, topic_path: &str) -> Result<(), TransportError> {
        match self.create_topic(topic_path).await {
            Ok(()) => Ok(()),
            Err(TransportError::AlreadyExists(_)) => {
                debug!("Topic {topic_path} already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
pub trait SubscriberClient: Send + Sync {
    async fn create_subscription(
        &self,
        subscription_path: &str,
        topic_path: &str,
    ) -> Result<(), TransportError>;

    async fn delete_subscription(&self, subscription_path: &str) -> Result<(), TransportError>;

    async fn subscribe(&self, subscription_path: &str) -> Result<MessageStream, TransportError>;

    async fn acknowledge(
        &self,
        subscription_path: &str,
        ack_ids: &[String],
    ) -> Result<(), TransportError>;
}

/// Builds transport clients. Each call may open a new connection, so callers
/// are expected to build once and share.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn publisher(&self) -> Result<Arc<dyn PublisherClient>, TransportError>;
    async fn subscriber(&self) -> Result<Arc<dyn SubscriberClient>, TransportError>;
}
