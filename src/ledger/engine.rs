//! Subscription ledger
//!
//! The ledger counts, per (consumer group, topic), how many live consumers
//! want the external subscription resource to exist. It creates the resource
//! on the 0 -> 1 transition and deletes it on the transition back to zero.
//!
//! Concurrency and usage notes:
//! - Each key owns an async mutex holding its count. The whole
//!   read -> mutate -> adapter call -> finalise sequence runs under that lock,
//!   so the same key is strictly ordered while other keys proceed in parallel.
//! - The outer map sits behind a `std::sync::Mutex` that is only held for map
//!   lookups, never across an `.await`.
//! - A slot whose count drops to zero is unlinked from the map while its lock
//!   is still held. Waiters that find their slot unlinked start over with a
//!   fresh one, so no zero entry outlives the operation that produced it,
//!   even one that was cancelled.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::utils::TransportError;

type Slot = Arc<AsyncMutex<usize>>;
type Groups = HashMap<String, HashMap<String, Slot>>;

/// The external resource operations the ledger drives.
///
/// Implementations derive resource names from `(group, topic)` themselves;
/// the ledger never sees a path.
#[async_trait]
pub trait SubscriptionResources: Send + Sync {
    async fn create(&self, group: &str, topic: &str) -> Result<(), TransportError>;
    async fn delete(&self, group: &str, topic: &str) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    pub group: String,
    pub topic: String,
}

impl SubscriptionKey {
    pub fn new(group: &str, topic: &str) -> Self {
        Self {
            group: group.to_string(),
            topic: topic.to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionLedger {
    groups: Mutex<Groups>,
    /// Keys whose external deletion failed after the entry was dropped.
    orphans: Mutex<HashSet<SubscriptionKey>>,
}

/// A locked slot. Dropping it at zero unlinks the slot, so an operation
/// that is cancelled midway never leaves a zero entry behind.
struct SlotGuard<'a> {
    ledger: &'a SubscriptionLedger,
    group: &'a str,
    topic: &'a str,
    slot: Slot,
    count: OwnedMutexGuard<usize>,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if *self.count == 0 {
            self.ledger.unlink(self.group, self.topic, &self.slot);
        }
    }
}

impl SubscriptionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `(group, topic)`.
    ///
    /// The first acquirer creates the external resource and the count only
    /// becomes 1 once that succeeded; a resource that already exists counts
    /// as created. On failure, or if the call is cancelled, nothing is left
    /// in the ledger.
    pub async fn acquire(
        &self,
        resources: &dyn SubscriptionResources,
        group: &str,
        topic: &str,
    ) -> Result<(), TransportError> {
        let mut slot = self.lock_slot(group, topic).await;

        if *slot.count > 0 {
            *slot.count += 1;
            debug!(patron_id = %group, topic = %topic, count = *slot.count, "Subscription reference added");
            return Ok(());
        }

        // Until create returns, the resource may or may not exist. Keeping the
        // key in the orphan list covers a cancelled call.
        let key = SubscriptionKey::new(group, topic);
        let newly_orphaned = self.orphans().insert(key.clone());

        info!("Creating a new subscription resource for patron {group}, topic {topic}");
        match resources.create(group, topic).await {
            Ok(()) => {}
            Err(TransportError::AlreadyExists(name)) => {
                debug!("Subscription {name} already exists, reusing it");
            }
            Err(e) => {
                if newly_orphaned {
                    self.orphans().remove(&key);
                }
                return Err(e);
            }
        }

        *slot.count = 1;
        self.orphans().remove(&key);
        Ok(())
    }

    /// Drop one reference to `(group, topic)`.
    ///
    /// The last release deletes the external resource. The entry is removed
    /// whatever the outcome of that deletion; a failed deletion is logged and
    /// remembered as an orphan. Releasing an absent key does nothing.
    pub async fn release(&self, resources: &dyn SubscriptionResources, group: &str, topic: &str) {
        if !self.contains(group, topic) {
            debug!(patron_id = %group, topic = %topic, "Release without a live subscription ignored");
            return;
        }

        let mut slot = self.lock_slot(group, topic).await;
        if *slot.count == 0 {
            return;
        }

        *slot.count -= 1;
        if *slot.count > 0 {
            debug!(patron_id = %group, topic = %topic, count = *slot.count, "Subscription reference dropped");
            return;
        }

        self.delete_resource(resources, group, topic).await;
    }

    /// Tear down every subscription held by `group`.
    ///
    /// Works over a snapshot of the group's topics taken at call time. Each
    /// topic is released down to removal with a single deletion, however many
    /// references it held. Returns the number of subscriptions torn down.
    pub async fn release_all(&self, resources: &dyn SubscriptionResources, group: &str) -> usize {
        let mut released = 0;

        for topic in self.topics(group) {
            let mut slot = self.lock_slot(group, &topic).await;
            if *slot.count == 0 {
                continue;
            }
            if *slot.count > 1 {
                debug!(patron_id = %group, topic = %topic, count = *slot.count, "Releasing every reference at once");
            }
            *slot.count = 0;
            self.delete_resource(resources, group, &topic).await;
            released += 1;
        }

        released
    }

    /// Retry deletion of orphaned subscriptions that nobody uses again.
    ///
    /// Returns how many orphans were cleared.
    pub async fn reap_orphans(&self, resources: &dyn SubscriptionResources) -> usize {
        let mut pending: Vec<SubscriptionKey> = self.orphans().iter().cloned().collect();
        pending.sort();

        let mut reaped = 0;
        for key in pending {
            let slot = self.lock_slot(&key.group, &key.topic).await;
            if *slot.count > 0 {
                // Back in use; the live entry owns the resource now.
                self.orphans().remove(&key);
                continue;
            }
            if !self.orphans().contains(&key) {
                continue;
            }

            match resources.delete(&key.group, &key.topic).await {
                Ok(()) | Err(TransportError::NotFound(_)) => {
                    info!(patron_id = %key.group, topic = %key.topic, "Orphaned subscription reaped");
                    self.orphans().remove(&key);
                    reaped += 1;
                }
                Err(e) => {
                    warn!(patron_id = %key.group, topic = %key.topic, error = %e, "Orphaned subscription still not deletable");
                }
            }
        }

        reaped
    }

    /// Current reference count; zero when the key is absent.
    pub async fn count(&self, group: &str, topic: &str) -> usize {
        if !self.contains(group, topic) {
            return 0;
        }
        *self.lock_slot(group, topic).await.count
    }

    /// Snapshot of the topics `group` currently holds, sorted.
    pub fn topics(&self, group: &str) -> Vec<String> {
        let mut topics: Vec<String> = self
            .groups()
            .get(group)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }

    /// Snapshot of the groups holding at least one topic, sorted.
    pub fn groups_snapshot(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.groups().keys().cloned().collect();
        groups.sort();
        groups
    }

    pub fn is_empty(&self) -> bool {
        self.groups().is_empty()
    }

    pub fn orphaned(&self) -> Vec<SubscriptionKey> {
        let mut keys: Vec<_> = self.orphans().iter().cloned().collect();
        keys.sort();
        keys
    }

    /// Delete the resource of a key whose count just reached zero. The key
    /// stays an orphan until the deletion is known to have happened.
    async fn delete_resource(&self, resources: &dyn SubscriptionResources, group: &str, topic: &str) {
        let key = SubscriptionKey::new(group, topic);
        self.orphans().insert(key.clone());

        info!("Deleting subscription resource for patron {group}, topic {topic}");
        match resources.delete(group, topic).await {
            Ok(()) => {
                self.orphans().remove(&key);
            }
            Err(TransportError::NotFound(name)) => {
                debug!("Subscription {name} was already gone");
                self.orphans().remove(&key);
            }
            Err(e) => {
                error!(patron_id = %group, topic = %topic, error = %e, "Failed to delete subscription resource");
            }
        }
    }

    /// Lock the slot currently linked for `(group, topic)`, inserting a zero
    /// slot if there is none.
    ///
    /// A freshly inserted slot is locked within the same poll that inserted
    /// it. If the wait is cancelled, the slot is held by another guard, which
    /// unlinks it on drop if it is still at zero.
    async fn lock_slot<'a>(&'a self, group: &'a str, topic: &'a str) -> SlotGuard<'a> {
        loop {
            let slot = {
                let mut groups = self.groups();
                groups
                    .entry(group.to_string())
                    .or_default()
                    .entry(topic.to_string())
                    .or_default()
                    .clone()
            };

            let count = slot.clone().lock_owned().await;
            let linked = self.is_linked(group, topic, &slot);
            let guard = SlotGuard {
                ledger: self,
                group,
                topic,
                slot,
                count,
            };
            if linked {
                return guard;
            }
        }
    }

    fn contains(&self, group: &str, topic: &str) -> bool {
        self.groups()
            .get(group)
            .is_some_and(|topics| topics.contains_key(topic))
    }

    fn is_linked(&self, group: &str, topic: &str, slot: &Slot) -> bool {
        self.groups()
            .get(group)
            .and_then(|topics| topics.get(topic))
            .is_some_and(|linked| Arc::ptr_eq(linked, slot))
    }

    /// Remove `slot` from the map, along with its group once empty. Called
    /// with the slot locked at zero.
    fn unlink(&self, group: &str, topic: &str, slot: &Slot) {
        let mut groups = self.groups();
        let Some(topics) = groups.get_mut(group) else {
            return;
        };
        if topics.get(topic).is_some_and(|linked| Arc::ptr_eq(linked, slot)) {
            topics.remove(topic);
        }
        if topics.is_empty() {
            groups.remove(group);
        }
    }

    fn groups(&self) -> MutexGuard<'_, Groups> {
        self.groups.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn orphans(&self) -> MutexGuard<'_, HashSet<SubscriptionKey>> {
        self.orphans.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
