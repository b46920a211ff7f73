//! In-memory transport
//!
//! `MemoryTransport` keeps topics and subscriptions in process and enforces
//! the rules a hosted service would: resource ids are validated, creating an
//! existing resource is a conflict and deleting or publishing to a missing
//! one is `NotFound`. Every subscription keeps its own copy of each message;
//! listeners on the same subscription share its deliveries round-robin, and
//! messages published while nobody listens wait in a backlog.
//!
//! Concurrency note: all state sits behind one mutex that is never held
//! across an `.await`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use futures::channel::mpsc::{self, UnboundedSender};
use tracing::{debug, info, trace};
use uuid::Uuid;

use super::{Connector, MessageStream, PublisherClient, ReceivedMessage, SubscriberClient};
use crate::utils::TransportError;

#[derive(Debug, Default)]
struct TopicState {
    subscriptions: HashSet<String>,
}

#[derive(Debug)]
struct SubscriptionState {
    topic: String,
    backlog: VecDeque<ReceivedMessage>,
    listeners: Vec<UnboundedSender<ReceivedMessage>>,
    next_listener: usize,
    unacked: HashMap<String, Bytes>,
}

impl SubscriptionState {
    fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            backlog: VecDeque::new(),
            listeners: Vec::new(),
            next_listener: 0,
            unacked: HashMap::new(),
        }
    }

    fn deliver(&mut self, mut msg: ReceivedMessage) {
        self.listeners.retain(|tx| !tx.is_closed());

        while !self.listeners.is_empty() {
            let idx = self.next_listener % self.listeners.len();
            self.next_listener = idx + 1;
            match self.listeners[idx].unbounded_send(msg) {
                Ok(()) => return,
                Err(e) => {
                    msg = e.into_inner();
                    self.listeners.remove(idx);
                }
            }
        }

        self.backlog.push_back(msg);
    }
}

#[derive(Debug, Default)]
struct State {
    topics: HashMap<String, TopicState>,
    subscriptions: HashMap<String, SubscriptionState>,
}

#[derive(Debug, Default)]
struct Counters {
    connections: AtomicUsize,
    topics_created: AtomicUsize,
    subscriptions_created: AtomicUsize,
    subscriptions_deleted: AtomicUsize,
    published: AtomicUsize,
    acknowledged: AtomicUsize,
}

/// Point-in-time copy of the transport's operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub connections: usize,
    pub topics_created: usize,
    pub subscriptions_created: usize,
    pub subscriptions_deleted: usize,
    pub published: usize,
    pub acknowledged: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<State>>,
    counters: Arc<Counters>,
    offline: Arc<AtomicBool>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every call fails with `Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn stats(&self) -> TransportStats {
        let c = &self.counters;
        TransportStats {
            connections: c.connections.load(Ordering::Relaxed),
            topics_created: c.topics_created.load(Ordering::Relaxed),
            subscriptions_created: c.subscriptions_created.load(Ordering::Relaxed),
            subscriptions_deleted: c.subscriptions_deleted.load(Ordering::Relaxed),
            published: c.published.load(Ordering::Relaxed),
            acknowledged: c.acknowledged.load(Ordering::Relaxed),
        }
    }

    pub fn topic_exists(&self, topic_path: &str) -> bool {
        self.state().topics.contains_key(topic_path)
    }

    pub fn subscription_exists(&self, subscription_path: &str) -> bool {
        self.state().subscriptions.contains_key(subscription_path)
    }

    /// Sorted paths of all live subscriptions.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.state().subscriptions.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Deliveries handed out on `subscription_path` and not acknowledged yet.
    pub fn unacked(&self, subscription_path: &str) -> usize {
        self.state()
            .subscriptions
            .get(subscription_path)
            .map_or(0, |s| s.unacked.len())
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_online(&self) -> Result<(), TransportError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("memory transport is offline".into()));
        }
        Ok(())
    }
}

/// Check `path` is `projects/<project>/<collection>/<id>` with a valid id.
pub fn validate_path(path: &str, collection: &str) -> Result<(), TransportError> {
    let invalid = |reason: &str| TransportError::InvalidArgument(format!("{path}: {reason}"));

    let segments: Vec<&str> = path.split('/').collect();
    let [projects, project, kind, id] = segments.as_slice() else {
        return Err(invalid("expected projects/<project>/<collection>/<id>"));
    };
    if *projects != "projects" || project.is_empty() {
        return Err(invalid("missing project"));
    }
    if *kind != collection {
        return Err(invalid(&format!("expected a {collection} path")));
    }

    if !(3..=255).contains(&id.len()) {
        return Err(invalid("resource id must be 3 to 255 characters"));
    }
    if !id.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return Err(invalid("resource id must start with a letter"));
    }
    if id.starts_with("goog") {
        return Err(invalid("resource id must not start with \"goog\""));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || "-_.~+%".contains(*c)))
    {
        return Err(invalid(&format!("unsupported character {bad:?}")));
    }

    Ok(())
}

#[async_trait]
impl PublisherClient for MemoryTransport {
    async fn create_topic(&self, topic_path: &str) -> Result<(), TransportError> {
        self.check_online()?;
        validate_path(topic_path, "topics")?;

        let mut state = self.state();
        if state.topics.contains_key(topic_path) {
            return Err(TransportError::AlreadyExists(topic_path.to_string()));
        }
        state
            .topics
            .insert(topic_path.to_string(), TopicState::default());
        self.counters.topics_created.fetch_add(1, Ordering::Relaxed);
        info!("Created topic {topic_path}");
        Ok(())
    }

    async fn publish(&self, topic_path: &str, payload: Bytes) -> Result<String, TransportError> {
        self.check_online()?;

        let mut guard = self.state();
        let state = &mut *guard;
        let topic = state
            .topics
            .get(topic_path)
            .ok_or_else(|| TransportError::NotFound(topic_path.to_string()))?;

        let message_id = Uuid::new_v4().to_string();
        let publish_time = Utc::now();

        for sub_path in &topic.subscriptions {
            if let Some(sub) = state.subscriptions.get_mut(sub_path) {
                let msg = ReceivedMessage {
                    ack_id: Uuid::new_v4().to_string(),
                    data: payload.clone(),
                    publish_time,
                };
                sub.unacked.insert(msg.ack_id.clone(), msg.data.clone());
                sub.deliver(msg);
            }
        }

        self.counters.published.fetch_add(1, Ordering::Relaxed);
        trace!(topic = %topic_path, message_id = %message_id, "Published message");
        Ok(message_id)
    }
}

#[async_trait]
impl SubscriberClient for MemoryTransport {
    async fn create_subscription(
        &self,
        subscription_path: &str,
        topic_path: &str,
    ) -> Result<(), TransportError> {
        self.check_online()?;
        validate_path(subscription_path, "subscriptions")?;

        let mut state = self.state();
        if state.subscriptions.contains_key(subscription_path) {
            return Err(TransportError::AlreadyExists(subscription_path.to_string()));
        }
        let topic = state
            .topics
            .get_mut(topic_path)
            .ok_or_else(|| TransportError::NotFound(topic_path.to_string()))?;
        topic.subscriptions.insert(subscription_path.to_string());
        state.subscriptions.insert(
            subscription_path.to_string(),
            SubscriptionState::new(topic_path),
        );

        self.counters
            .subscriptions_created
            .fetch_add(1, Ordering::Relaxed);
        info!("Created subscription {subscription_path} on {topic_path}");
        Ok(())
    }

    async fn delete_subscription(&self, subscription_path: &str) -> Result<(), TransportError> {
        self.check_online()?;

        let mut state = self.state();
        let sub = state
            .subscriptions
            .remove(subscription_path)
            .ok_or_else(|| TransportError::NotFound(subscription_path.to_string()))?;
        if let Some(topic) = state.topics.get_mut(&sub.topic) {
            topic.subscriptions.remove(subscription_path);
        }

        self.counters
            .subscriptions_deleted
            .fetch_add(1, Ordering::Relaxed);
        info!("Deleted subscription {subscription_path}");
        Ok(())
    }

    async fn subscribe(&self, subscription_path: &str) -> Result<MessageStream, TransportError> {
        self.check_online()?;

        let mut state = self.state();
        let sub = state
            .subscriptions
            .get_mut(subscription_path)
            .ok_or_else(|| TransportError::NotFound(subscription_path.to_string()))?;

        let (tx, rx) = mpsc::unbounded();
        while let Some(msg) = sub.backlog.pop_front() {
            if let Err(e) = tx.unbounded_send(msg) {
                sub.backlog.push_front(e.into_inner());
                break;
            }
        }
        sub.listeners.push(tx);

        debug!(
            subscription = %subscription_path,
            listeners = sub.listeners.len(),
            "Listener attached"
        );
        Ok(rx.boxed())
    }

    async fn acknowledge(
        &self,
        subscription_path: &str,
        ack_ids: &[String],
    ) -> Result<(), TransportError> {
        self.check_online()?;

        let mut state = self.state();
        let sub = state
            .subscriptions
            .get_mut(subscription_path)
            .ok_or_else(|| TransportError::NotFound(subscription_path.to_string()))?;

        let acked = ack_ids
            .iter()
            .filter(|id| sub.unacked.remove(id.as_str()).is_some())
            .count();
        self.counters
            .acknowledged
            .fetch_add(acked, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl Connector for MemoryTransport {
    async fn publisher(&self) -> Result<Arc<dyn PublisherClient>, TransportError> {
        self.check_online()?;
        self.counters.connections.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(self.clone()))
    }

    async fn subscriber(&self) -> Result<Arc<dyn SubscriberClient>, TransportError> {
        self.check_online()?;
        self.counters.connections.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(self.clone()))
    }
}
