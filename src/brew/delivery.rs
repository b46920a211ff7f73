//! Delivery tasks
//!
//! A `Delivery` owns the task that drains one subscription stream for one
//! started patron. Each message is acknowledged first and then handed to the
//! patron's callback. Dropping or cancelling the `Delivery` aborts the task.

use std::slice;
use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::DataCallback;
use crate::transport::{MessageStream, SubscriberClient};

#[derive(Debug)]
pub struct Delivery {
    subscription: String,
    handle: JoinHandle<()>,
}

impl Delivery {
    pub fn spawn(
        client: Arc<dyn SubscriberClient>,
        subscription: String,
        brewer_id: String,
        mut stream: MessageStream,
        on_data: DataCallback,
    ) -> Self {
        let sub = subscription.clone();
        let handle = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                if let Err(e) = client.acknowledge(&sub, slice::from_ref(&msg.ack_id)).await {
                    warn!(subscription = %sub, error = %e, "Failed to acknowledge message");
                }
                on_data(&brewer_id, msg.data);
            }
            debug!(subscription = %sub, "Subscription stream ended");
        });

        Self {
            subscription,
            handle,
        }
    }

    pub fn cancel(self) {
        debug!(subscription = %self.subscription, "Cancelling delivery");
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
