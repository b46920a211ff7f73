//! The `brew` module holds the lifecycle contract a messaging host expects
//! from a transport plugin, and the pub/sub implementation of it.
//!
//! A host drives a brew through its hooks: `configure` once on activation,
//! `create_brewer`/`brew` for publishers and `create_patron`, `start_patron`,
//! `stop_patron` and `destroy_patron` for subscribers. Every hook except
//! `configure` takes `&self`; the host may call them concurrently.

pub mod delivery;
pub mod pubsub;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::BrewContext;
use crate::utils::BrewError;

pub use delivery::Delivery;
pub use pubsub::PubSubBrew;

/// Receives `(brewer_id, payload)` for every message a patron is sent.
pub type DataCallback = Arc<dyn Fn(&str, Bytes) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrewerDescriptor {
    pub brewer_id: String,
    pub topic: String,
}

impl BrewerDescriptor {
    pub fn new(brewer_id: &str, topic: &str) -> Self {
        Self {
            brewer_id: brewer_id.to_string(),
            topic: topic.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatronDescriptor {
    pub patron_id: String,
    pub topic: String,
}

impl PatronDescriptor {
    pub fn new(patron_id: &str, topic: &str) -> Self {
        Self {
            patron_id: patron_id.to_string(),
            topic: topic.to_string(),
        }
    }
}

/// Lifecycle hooks of a transport plugin.
///
/// Every hook has a no-op default, so a transport only implements what it
/// needs resources for.
#[async_trait]
pub trait Brew: Send + Sync {
    fn name(&self) -> &'static str;

    /// Apply host settings. May write the process environment, so call it
    /// before other threads are reading it.
    fn configure(&mut self, context: &BrewContext) -> Result<(), BrewError>;

    async fn start(&self) {}

    /// Disconnect whatever the brew opened.
    async fn stop(&self) {}

    async fn create_brewer(&self, _brewer: &BrewerDescriptor) -> Result<(), BrewError> {
        Ok(())
    }

    async fn destroy_brewer(&self, _brewer: &BrewerDescriptor) {}

    async fn create_patron(&self, _patron: &PatronDescriptor) -> Result<(), BrewError> {
        Ok(())
    }

    async fn destroy_patron(&self, _patron: &PatronDescriptor) {}

    /// A patron joined the network and will consume this brewer's topic.
    async fn start_brewer(
        &self,
        _brewer_id: &str,
        _topic: &str,
        _patron_id: &str,
        _patron: &Value,
    ) {
    }

    async fn stop_brewer(&self, _brewer_id: &str, _topic: &str, _patron_id: &str) {}

    /// Start consuming `topic` from `brewer_id`. Received payloads go to
    /// `on_data`. Failures are the brew's to report; they never reach the
    /// host.
    async fn start_patron(
        &self,
        _patron_id: &str,
        _topic: &str,
        _brewer_id: &str,
        _brewer_config: &Value,
        _brewer_data: &Value,
        _on_data: DataCallback,
    ) {
    }

    async fn stop_patron(&self, _patron_id: &str, _topic: &str, _brewer_id: &str) {}

    /// Send `data` for `brewer_id` on `topic`. `patrons` lists the current
    /// consumers for transports that route per patron.
    async fn brew(
        &self,
        _brewer_id: &str,
        _topic: &str,
        _data: Bytes,
        _patrons: &[String],
    ) -> Result<(), BrewError> {
        Ok(())
    }
}
