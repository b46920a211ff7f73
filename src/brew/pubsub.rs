//! Pub/sub brew
//!
//! `PubSubBrew` maps the host's brewer and patron hooks onto an external
//! pub/sub transport. Brewers get a topic each. Patrons get one subscription
//! per (patron, topic), owned by the `SubscriptionLedger`: the first
//! `start_patron` on a pair creates it and the last `stop_patron` (or
//! `destroy_patron`) deletes it. Every started patron also gets a `Delivery`
//! task that acknowledges and forwards messages until it is stopped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, OnceCell};
use tracing::{debug, error, info, trace, warn};

use super::{Brew, BrewerDescriptor, DataCallback, Delivery, PatronDescriptor};
use crate::config::{self, BrewContext, CredentialSource, PubSubSettings, credentials};
use crate::ledger::{ResourceNames, SubscriptionLedger, SubscriptionResources};
use crate::transport::{Connector, PublisherClient, SubscriberClient};
use crate::utils::{BrewError, TransportError};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DeliveryKey {
    patron_id: String,
    topic: String,
    brewer_id: String,
}

impl DeliveryKey {
    fn new(patron_id: &str, topic: &str, brewer_id: &str) -> Self {
        Self {
            patron_id: patron_id.to_string(),
            topic: topic.to_string(),
            brewer_id: brewer_id.to_string(),
        }
    }
}

/// Ledger resources for one project: subscription `sub.<patron>.<topic>`
/// attached to the topic of the same name.
struct ProjectSubscriptions<'a> {
    client: &'a dyn SubscriberClient,
    names: &'a ResourceNames,
}

#[async_trait]
impl SubscriptionResources for ProjectSubscriptions<'_> {
    async fn create(&self, group: &str, topic: &str) -> Result<(), TransportError> {
        self.client
            .create_subscription(
                &self.names.subscription_path(group, topic),
                &self.names.topic_path(topic),
            )
            .await
    }

    async fn delete(&self, group: &str, topic: &str) -> Result<(), TransportError> {
        self.client
            .delete_subscription(&self.names.subscription_path(group, topic))
            .await
    }
}

pub struct PubSubBrew {
    connector: Arc<dyn Connector>,
    settings: PubSubSettings,
    credentials: CredentialSource,
    names: Option<ResourceNames>,
    publisher: OnceCell<Arc<dyn PublisherClient>>,
    subscriber: OnceCell<Arc<dyn SubscriberClient>>,
    ledger: SubscriptionLedger,
    deliveries: Mutex<HashMap<DeliveryKey, Vec<Delivery>>>,
    /// Serialises `start_patron` against `destroy_patron` for one patron.
    patron_turns: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl PubSubBrew {
    pub const NAME: &'static str = "pubsub";

    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            settings: PubSubSettings::default(),
            credentials: CredentialSource::Missing,
            names: None,
            publisher: OnceCell::new(),
            subscriber: OnceCell::new(),
            ledger: SubscriptionLedger::new(),
            deliveries: Mutex::new(HashMap::new()),
            patron_turns: Mutex::new(HashMap::new()),
        }
    }

    /// Settings that `configure` falls back to for keys the host context
    /// leaves out.
    pub fn with_defaults(mut self, settings: PubSubSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &PubSubSettings {
        &self.settings
    }

    /// Where the transport credentials come from, as resolved by the last
    /// `configure`. Connectors that take an explicit key file can use
    /// `CredentialSource::effective` instead of the environment.
    pub fn credentials(&self) -> &CredentialSource {
        &self.credentials
    }

    pub fn ledger(&self) -> &SubscriptionLedger {
        &self.ledger
    }

    /// Number of registered delivery tasks.
    pub fn active_deliveries(&self) -> usize {
        self.deliveries().values().map(Vec::len).sum()
    }

    /// Retry deletion of subscriptions whose teardown failed earlier.
    pub async fn reap_orphans(&self) -> usize {
        let Some(resources) = self.resources() else {
            return 0;
        };
        self.ledger.reap_orphans(&resources).await
    }

    fn names(&self) -> Result<&ResourceNames, BrewError> {
        self.names.as_ref().ok_or(BrewError::MissingProject)
    }

    async fn publisher(&self) -> Result<&Arc<dyn PublisherClient>, TransportError> {
        self.publisher
            .get_or_try_init(|| self.connector.publisher())
            .await
    }

    async fn subscriber(&self) -> Result<&Arc<dyn SubscriberClient>, TransportError> {
        self.subscriber
            .get_or_try_init(|| self.connector.subscriber())
            .await
    }

    /// Resources for teardown paths. `None` when nothing can have been
    /// acquired yet.
    fn resources(&self) -> Option<ProjectSubscriptions<'_>> {
        Some(ProjectSubscriptions {
            client: self.subscriber.get()?.as_ref(),
            names: self.names.as_ref()?,
        })
    }

    fn deliveries(&self) -> MutexGuard<'_, HashMap<DeliveryKey, Vec<Delivery>>> {
        self.deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn patron_turn(&self, patron_id: &str) -> Arc<AsyncMutex<()>> {
        let mut turns = self
            .patron_turns
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(turns.entry(patron_id.to_string()).or_default())
    }

    /// Drop the turn lock of a patron once nobody else holds or waits on it.
    fn forget_patron_turn(&self, patron_id: &str, turn: &Arc<AsyncMutex<()>>) {
        let mut turns = self
            .patron_turns
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let idle = turns
            .get(patron_id)
            .is_some_and(|linked| Arc::ptr_eq(linked, turn) && Arc::strong_count(turn) == 2);
        if idle {
            turns.remove(patron_id);
        }
    }

    async fn subscribe_patron(
        &self,
        patron_id: &str,
        topic: &str,
        brewer_id: &str,
        on_data: DataCallback,
    ) -> Result<(), BrewError> {
        let names = self.names()?;
        let client = self.subscriber().await?;
        let resources = ProjectSubscriptions {
            client: client.as_ref(),
            names,
        };

        self.ledger.acquire(&resources, patron_id, topic).await?;

        let subscription = names.subscription_path(patron_id, topic);
        let stream = match client.subscribe(&subscription).await {
            Ok(stream) => stream,
            Err(e) => {
                self.ledger.release(&resources, patron_id, topic).await;
                return Err(e.into());
            }
        };

        let delivery = Delivery::spawn(
            Arc::clone(client),
            subscription,
            brewer_id.to_string(),
            stream,
            on_data,
        );
        self.deliveries()
            .entry(DeliveryKey::new(patron_id, topic, brewer_id))
            .or_default()
            .push(delivery);

        Ok(())
    }
}

#[async_trait]
impl Brew for PubSubBrew {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn configure(&mut self, context: &BrewContext) -> Result<(), BrewError> {
        info!("Configuring");
        self.settings = config::from_context(context, self.settings.clone())?;

        self.credentials = credentials::apply(self.settings.service_account_file.as_deref());

        self.names = self.settings.project_id.as_deref().map(ResourceNames::new);
        if self.names.is_none() {
            warn!("No project_id configured; brewers and patrons cannot be registered");
        }
        Ok(())
    }

    /// Cancels every delivery and tears down every subscription still held.
    async fn stop(&self) {
        let cancelled: Vec<Delivery> = self.deliveries().drain().flat_map(|(_, d)| d).collect();
        let cancelled_count = cancelled.len();
        cancelled.into_iter().for_each(Delivery::cancel);

        let Some(resources) = self.resources() else {
            return;
        };
        let mut released = 0;
        for group in self.ledger.groups_snapshot() {
            released += self.ledger.release_all(&resources, &group).await;
        }
        info!(
            deliveries = cancelled_count,
            subscriptions = released,
            "Stopped"
        );
    }

    async fn create_brewer(&self, brewer: &BrewerDescriptor) -> Result<(), BrewError> {
        let names = self.names()?;
        let publisher = self.publisher().await?;

        info!("Creating topic for {}", brewer.topic);
        if let Err(e) = publisher
            .ensure_topic_exists(&names.topic_path(&brewer.topic))
            .await
        {
            if e.is_permanent() {
                error!(brewer_id = %brewer.brewer_id, topic = %brewer.topic, error = %e, "Topic rejected by the transport");
            } else {
                warn!(brewer_id = %brewer.brewer_id, topic = %brewer.topic, error = %e, "Couldn't create topic, retry once the transport recovers");
            }
            return Err(e.into());
        }
        Ok(())
    }

    async fn create_patron(&self, patron: &PatronDescriptor) -> Result<(), BrewError> {
        self.subscriber().await?;
        debug!(patron_id = %patron.patron_id, "Subscriber ready");
        Ok(())
    }

    async fn destroy_patron(&self, patron: &PatronDescriptor) {
        info!("Down patron {}", patron.patron_id);

        let turn = self.patron_turn(&patron.patron_id);
        let guard = turn.lock().await;

        let cancelled: Vec<Delivery> = {
            let mut deliveries = self.deliveries();
            let keys: Vec<DeliveryKey> = deliveries
                .keys()
                .filter(|k| k.patron_id == patron.patron_id)
                .cloned()
                .collect();
            keys.iter()
                .filter_map(|k| deliveries.remove(k))
                .flatten()
                .collect()
        };
        cancelled.into_iter().for_each(Delivery::cancel);

        if let Some(resources) = self.resources() {
            let released = self.ledger.release_all(&resources, &patron.patron_id).await;
            debug!(patron_id = %patron.patron_id, released, "Patron subscriptions released");
        }

        drop(guard);
        self.forget_patron_turn(&patron.patron_id, &turn);
    }

    async fn start_patron(
        &self,
        patron_id: &str,
        topic: &str,
        brewer_id: &str,
        _brewer_config: &Value,
        _brewer_data: &Value,
        on_data: DataCallback,
    ) {
        let turn = self.patron_turn(patron_id);
        let _guard = turn.lock().await;

        if let Err(e) = self
            .subscribe_patron(patron_id, topic, brewer_id, on_data)
            .await
        {
            error!(
                patron_id = %patron_id,
                topic = %topic,
                error = %e,
                "Couldn't create subscription for patron {patron_id}, topic {topic}"
            );
        }
    }

    async fn stop_patron(&self, patron_id: &str, topic: &str, brewer_id: &str) {
        let delivery = {
            let mut deliveries = self.deliveries();
            let key = DeliveryKey::new(patron_id, topic, brewer_id);
            let delivery = deliveries.get_mut(&key).and_then(Vec::pop);
            if deliveries.get(&key).is_some_and(Vec::is_empty) {
                deliveries.remove(&key);
            }
            delivery
        };

        // Only started patrons hold a reference.
        let Some(delivery) = delivery else {
            debug!(patron_id = %patron_id, topic = %topic, brewer_id = %brewer_id, "Stop for a patron that never started");
            return;
        };
        delivery.cancel();

        if let Some(resources) = self.resources() {
            self.ledger.release(&resources, patron_id, topic).await;
        }
    }

    async fn brew(
        &self,
        brewer_id: &str,
        topic: &str,
        data: Bytes,
        patrons: &[String],
    ) -> Result<(), BrewError> {
        let names = self.names()?;
        let publisher = self.publisher().await?;

        let message_id = publisher.publish(&names.topic_path(topic), data).await?;
        trace!(
            brewer_id = %brewer_id,
            topic = %topic,
            patrons = patrons.len(),
            message_id = %message_id,
            "Brewed"
        );
        Ok(())
    }
}
