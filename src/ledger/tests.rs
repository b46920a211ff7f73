use super::naming::{ResourceNames, subscription_id};
use super::{SubscriptionKey, SubscriptionLedger, SubscriptionResources};
use crate::utils::TransportError;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::timeout;

/// Records every call and can be told to fail.
#[derive(Default)]
struct RecordingResources {
    calls: Mutex<Vec<String>>,
    fail_create: AtomicBool,
    fail_delete: AtomicBool,
    create_exists: AtomicBool,
    delay: Option<Duration>,
}

impl RecordingResources {
    fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl SubscriptionResources for RecordingResources {
    async fn create(&self, group: &str, topic: &str) -> Result<(), TransportError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.calls
            .lock()
            .unwrap()
            .push(format!("create:{group}:{topic}"));
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("create refused".into()));
        }
        if self.create_exists.load(Ordering::SeqCst) {
            return Err(TransportError::AlreadyExists(subscription_id(group, topic)));
        }
        Ok(())
    }

    async fn delete(&self, group: &str, topic: &str) -> Result<(), TransportError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.calls
            .lock()
            .unwrap()
            .push(format!("delete:{group}:{topic}"));
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("delete refused".into()));
        }
        Ok(())
    }
}

#[test]
fn test_resource_names() {
    let names = ResourceNames::new("acme");
    assert_eq!(names.project_id(), "acme");
    assert_eq!(names.topic_path("t1"), "projects/acme/topics/t1");
    assert_eq!(
        names.subscription_path("patron-a", "t1"),
        "projects/acme/subscriptions/sub.patron-a.t1"
    );
    assert_eq!(
        names.subscription_path("patron-a", "t1"),
        ResourceNames::new("acme").subscription_path("patron-a", "t1")
    );
}

#[tokio::test]
async fn test_first_acquire_creates_once() {
    let ledger = SubscriptionLedger::new();
    let resources = RecordingResources::default();

    ledger.acquire(&resources, "p", "t1").await.unwrap();
    ledger.acquire(&resources, "p", "t1").await.unwrap();
    ledger.acquire(&resources, "p", "t1").await.unwrap();

    assert_eq!(resources.calls(), vec!["create:p:t1"]);
    assert_eq!(ledger.count("p", "t1").await, 3);
}

#[tokio::test]
async fn test_release_deletes_on_last_reference() {
    let ledger = SubscriptionLedger::new();
    let resources = RecordingResources::default();

    ledger.acquire(&resources, "p", "t1").await.unwrap();
    ledger.acquire(&resources, "p", "t1").await.unwrap();

    ledger.release(&resources, "p", "t1").await;
    assert_eq!(resources.count("delete"), 0);
    assert_eq!(ledger.count("p", "t1").await, 1);

    ledger.release(&resources, "p", "t1").await;
    assert_eq!(resources.calls(), vec!["create:p:t1", "delete:p:t1"]);
    assert_eq!(ledger.count("p", "t1").await, 0);
    assert!(ledger.is_empty());
}

#[tokio::test]
async fn test_spurious_release_is_ignored() {
    let ledger = SubscriptionLedger::new();
    let resources = RecordingResources::default();

    ledger.acquire(&resources, "p", "t1").await.unwrap();
    ledger.release(&resources, "p", "t1").await;
    ledger.release(&resources, "p", "t1").await;
    ledger.release(&resources, "never", "seen").await;

    assert_eq!(resources.count("delete"), 1);
    assert_eq!(ledger.count("p", "t1").await, 0);
    assert!(ledger.is_empty());

    // The key behaves as fresh afterwards, not as a negative count.
    ledger.acquire(&resources, "p", "t1").await.unwrap();
    assert_eq!(resources.count("create"), 2);
    assert_eq!(ledger.count("p", "t1").await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquires_create_once() {
    let ledger = Arc::new(SubscriptionLedger::new());
    let resources = Arc::new(RecordingResources::slow(Duration::from_millis(20)));

    let (a, b) = tokio::join!(
        {
            let (ledger, resources) = (ledger.clone(), resources.clone());
            tokio::spawn(async move { ledger.acquire(&*resources, "p", "t1").await })
        },
        {
            let (ledger, resources) = (ledger.clone(), resources.clone());
            tokio::spawn(async move { ledger.acquire(&*resources, "p", "t1").await })
        }
    );
    a.unwrap().unwrap();
    b.unwrap().unwrap();

    assert_eq!(resources.count("create"), 1);
    assert_eq!(ledger.count("p", "t1").await, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_releases_delete_once() {
    let ledger = Arc::new(SubscriptionLedger::new());
    let resources = Arc::new(RecordingResources::slow(Duration::from_millis(10)));
    ledger.acquire(&*resources, "p", "t1").await.unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let (ledger, resources) = (ledger.clone(), resources.clone());
            tokio::spawn(async move { ledger.release(&*resources, "p", "t1").await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(resources.count("delete"), 1);
    assert!(ledger.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interleaved_churn_balances_creates_and_deletes() {
    let ledger = Arc::new(SubscriptionLedger::new());
    let resources = Arc::new(RecordingResources::slow(Duration::from_millis(1)));

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let (ledger, resources) = (ledger.clone(), resources.clone());
            tokio::spawn(async move {
                let topic = if i % 2 == 0 { "even" } else { "odd" };
                for _ in 0..5 {
                    ledger.acquire(&*resources, "p", topic).await.unwrap();
                    tokio::task::yield_now().await;
                    ledger.release(&*resources, "p", topic).await;
                }
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(ledger.is_empty());
    for topic in ["even", "odd"] {
        let creates = resources.count(&format!("create:p:{topic}"));
        let deletes = resources.count(&format!("delete:p:{topic}"));
        assert!(creates >= 1);
        assert_eq!(creates, deletes);
    }

    // Per key, calls must alternate create/delete.
    for topic in ["even", "odd"] {
        let sequence: Vec<String> = resources
            .calls()
            .into_iter()
            .filter(|c| c.ends_with(&format!(":p:{topic}")))
            .collect();
        for (i, call) in sequence.iter().enumerate() {
            let expected = if i % 2 == 0 { "create" } else { "delete" };
            assert!(call.starts_with(expected), "{sequence:?}");
        }
    }
}

#[tokio::test]
async fn test_two_groups_one_topic_scenario() {
    let ledger = SubscriptionLedger::new();
    let resources = RecordingResources::default();

    // Same group, two independent acquirers.
    let mut counts = vec![ledger.count("g", "t1").await];
    ledger.acquire(&resources, "g", "t1").await.unwrap();
    counts.push(ledger.count("g", "t1").await);
    ledger.acquire(&resources, "g", "t1").await.unwrap();
    counts.push(ledger.count("g", "t1").await);
    ledger.release(&resources, "g", "t1").await;
    counts.push(ledger.count("g", "t1").await);
    ledger.release(&resources, "g", "t1").await;
    counts.push(ledger.count("g", "t1").await);

    assert_eq!(counts, vec![0, 1, 2, 1, 0]);
    assert_eq!(resources.calls(), vec!["create:g:t1", "delete:g:t1"]);
}

#[tokio::test]
async fn test_failed_create_rolls_back() {
    let ledger = SubscriptionLedger::new();
    let resources = RecordingResources::default();
    resources.fail_create.store(true, Ordering::SeqCst);

    let err = ledger.acquire(&resources, "p", "t1").await.unwrap_err();
    assert!(matches!(err, TransportError::Unavailable(_)));
    assert_eq!(ledger.count("p", "t1").await, 0);
    assert!(ledger.is_empty());

    // Nothing to delete: the resource never existed.
    ledger.release(&resources, "p", "t1").await;
    assert_eq!(resources.count("delete"), 0);

    resources.fail_create.store(false, Ordering::SeqCst);
    ledger.acquire(&resources, "p", "t1").await.unwrap();
    assert_eq!(resources.count("create"), 2);
    assert_eq!(ledger.count("p", "t1").await, 1);
}

#[tokio::test]
async fn test_already_exists_counts_as_created() {
    let ledger = SubscriptionLedger::new();
    let resources = RecordingResources::default();
    resources.create_exists.store(true, Ordering::SeqCst);

    ledger.acquire(&resources, "p", "t1").await.unwrap();
    assert_eq!(ledger.count("p", "t1").await, 1);
}

#[tokio::test]
async fn test_release_all_tears_down_group() {
    let ledger = SubscriptionLedger::new();
    let resources = RecordingResources::default();

    for topic in ["a", "b", "c"] {
        ledger.acquire(&resources, "p", topic).await.unwrap();
    }
    ledger.acquire(&resources, "p", "b").await.unwrap();
    ledger.acquire(&resources, "other", "a").await.unwrap();

    let released = ledger.release_all(&resources, "p").await;

    assert_eq!(released, 3);
    assert_eq!(resources.count("delete:p:"), 3);
    assert!(ledger.topics("p").is_empty());
    assert_eq!(ledger.topics("other"), vec!["a"]);
    assert_eq!(ledger.count("other", "a").await, 1);

    assert_eq!(ledger.release_all(&resources, "p").await, 0);
    assert_eq!(resources.count("delete:p:"), 3);
}

#[tokio::test]
async fn test_failed_delete_still_removes_entry_and_reaps_later() {
    let ledger = SubscriptionLedger::new();
    let resources = RecordingResources::default();
    resources.fail_delete.store(true, Ordering::SeqCst);

    ledger.acquire(&resources, "p", "t1").await.unwrap();
    ledger.release(&resources, "p", "t1").await;

    assert!(ledger.is_empty());
    assert_eq!(ledger.orphaned(), vec![SubscriptionKey::new("p", "t1")]);

    assert_eq!(ledger.reap_orphans(&resources).await, 0);
    assert_eq!(ledger.orphaned().len(), 1);

    resources.fail_delete.store(false, Ordering::SeqCst);
    assert_eq!(ledger.reap_orphans(&resources).await, 1);
    assert!(ledger.orphaned().is_empty());
    assert!(ledger.is_empty());
    assert_eq!(resources.count("delete:p:t1"), 3);
}

#[tokio::test]
async fn test_reacquired_orphan_is_not_reaped() {
    let ledger = SubscriptionLedger::new();
    let resources = RecordingResources::default();
    resources.fail_delete.store(true, Ordering::SeqCst);

    ledger.acquire(&resources, "p", "t1").await.unwrap();
    ledger.release(&resources, "p", "t1").await;
    assert_eq!(ledger.orphaned().len(), 1);

    resources.fail_delete.store(false, Ordering::SeqCst);
    resources.create_exists.store(true, Ordering::SeqCst);
    ledger.acquire(&resources, "p", "t1").await.unwrap();

    assert!(ledger.orphaned().is_empty());
    assert_eq!(ledger.reap_orphans(&resources).await, 0);
    assert_eq!(ledger.count("p", "t1").await, 1);
    assert_eq!(resources.count("delete"), 1);
}

#[tokio::test]
async fn test_cancelled_acquire_leaves_no_entry() {
    let ledger = SubscriptionLedger::new();
    let resources = RecordingResources::slow(Duration::from_millis(200));

    let outcome = timeout(
        Duration::from_millis(20),
        ledger.acquire(&resources, "p", "t1"),
    )
    .await;
    assert!(outcome.is_err());

    assert_eq!(ledger.count("p", "t1").await, 0);
    assert!(ledger.is_empty());
    assert_eq!(resources.count("create"), 0);

    // The create may have landed server side, so the key is swept later.
    assert_eq!(ledger.orphaned(), vec![SubscriptionKey::new("p", "t1")]);
    assert_eq!(ledger.reap_orphans(&resources).await, 1);
    assert!(ledger.orphaned().is_empty());
    assert!(ledger.is_empty());
}

#[tokio::test]
async fn test_cancelled_waiter_leaves_no_entry() {
    let ledger = Arc::new(SubscriptionLedger::new());
    let resources = Arc::new(RecordingResources::slow(Duration::from_millis(100)));
    resources.fail_create.store(true, Ordering::SeqCst);

    let first = {
        let (ledger, resources) = (ledger.clone(), resources.clone());
        tokio::spawn(async move { ledger.acquire(&*resources, "q", "x").await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let waiter = timeout(
        Duration::from_millis(20),
        ledger.acquire(&*resources, "q", "x"),
    )
    .await;
    assert!(waiter.is_err());

    assert!(first.await.unwrap().is_err());
    assert!(ledger.topics("q").is_empty());
    assert!(ledger.is_empty());
    assert!(ledger.orphaned().is_empty());
    assert_eq!(resources.count("create"), 1);
}

#[tokio::test]
async fn test_cancelled_release_is_reaped_later() {
    let ledger = SubscriptionLedger::new();
    let resources = RecordingResources::slow(Duration::from_millis(100));
    ledger.acquire(&resources, "p", "t1").await.unwrap();

    let outcome = timeout(
        Duration::from_millis(20),
        ledger.release(&resources, "p", "t1"),
    )
    .await;
    assert!(outcome.is_err());

    assert!(ledger.is_empty());
    assert_eq!(ledger.orphaned(), vec![SubscriptionKey::new("p", "t1")]);

    assert_eq!(ledger.reap_orphans(&resources).await, 1);
    assert!(ledger.orphaned().is_empty());
    assert_eq!(resources.count("delete:p:t1"), 1);
}
