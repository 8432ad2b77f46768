//! Sweeper reconciliation of tasks the queue lost track of.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use proxymod_dispatcher::fingerprint::Fingerprint;
use proxymod_dispatcher::model::{State, TaskId};
use proxymod_dispatcher::processor::{ProcessingError, Processor};
use proxymod_dispatcher::queue::MemoryQueue;
use proxymod_dispatcher::store::{MemoryTaskStore, TaskStore, TransitionUpdate};
use proxymod_dispatcher::worker::{SweepReport, Sweeper, Worker, WorkerConfig};
use serde_json::json;

struct NoopProcessor;

#[async_trait]
impl Processor for NoopProcessor {
    async fn process(&self, _payload: &serde_json::Value) -> Result<(), ProcessingError> {
        Ok(())
    }
}

struct Fixture {
    store: Arc<MemoryTaskStore>,
    queue: Arc<MemoryQueue>,
    sweeper: Sweeper,
}

fn fixture(max_attempts: u32) -> Fixture {
    let store = Arc::new(MemoryTaskStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let config = WorkerConfig {
        max_attempts,
        processing_timeout: Duration::from_secs(10),
        lease_grace: Duration::from_secs(5),
        orphan_after: Duration::from_secs(30),
        requeue_after: Duration::from_secs(600),
        ..WorkerConfig::default()
    };
    let worker = Worker::new(store.clone(), queue.clone(), Arc::new(NoopProcessor), config);
    Fixture {
        store,
        queue,
        sweeper: Sweeper::new(Arc::new(worker)),
    }
}

/// A RECEIVED task with no queue message, as left by a failed enqueue.
async fn orphan(store: &MemoryTaskStore, seed: char) -> TaskId {
    let fp = Fingerprint::parse(&seed.to_string().repeat(64)).unwrap();
    let (task, created) = store
        .create_or_fetch(&fp, &json!({"object": "A", "rev": 1}))
        .await
        .unwrap();
    assert!(created);
    task.id
}

async fn claimed(store: &MemoryTaskStore, seed: char) -> TaskId {
    let id = orphan(store, seed).await;
    assert!(store.transition(id, State::Received, State::Queued, TransitionUpdate::none()).await.unwrap());
    assert!(
        store
            .transition(id, State::Queued, State::Processing, TransitionUpdate::begin_attempt())
            .await
            .unwrap()
    );
    id
}

fn ago(seconds: i64) -> chrono::DateTime<Utc> {
    Utc::now() - chrono::Duration::seconds(seconds)
}

#[tokio::test]
async fn old_orphans_are_enqueued() {
    let f = fixture(5);
    let old = orphan(&f.store, 'a').await;
    let fresh = orphan(&f.store, 'b').await;
    f.store.backdate(old, ago(120));

    let report = f.sweeper.sweep_once().await;

    assert_eq!(
        report,
        SweepReport {
            orphans_queued: 1,
            ..SweepReport::default()
        }
    );
    assert_eq!(f.queue.pending(), vec![old]);
    assert_eq!(f.store.get(old).await.unwrap().state, State::Queued);
    assert_eq!(f.store.get(fresh).await.unwrap().state, State::Received);
}

#[tokio::test]
async fn expired_lease_is_retried() {
    let f = fixture(5);
    let id = claimed(&f.store, 'c').await;
    f.store.backdate(id, ago(60));

    let report = f.sweeper.sweep_once().await;

    assert_eq!(report.leases_recovered, 1);
    let task = f.store.get(id).await.unwrap();
    assert_eq!(task.state, State::Queued);
    assert_eq!(task.attempt_count, 1);
    assert_eq!(task.last_error.as_deref(), Some("processing lease expired"));
    assert_eq!(f.queue.pending(), vec![id]);
}

#[tokio::test]
async fn expired_lease_on_last_attempt_fails_the_task() {
    let f = fixture(1);
    let id = claimed(&f.store, 'd').await;
    f.store.backdate(id, ago(60));

    let report = f.sweeper.sweep_once().await;

    assert_eq!(report.leases_recovered, 1);
    assert_eq!(f.store.get(id).await.unwrap().state, State::Failed);
    assert!(f.queue.is_empty());
}

#[tokio::test]
async fn live_lease_is_left_alone() {
    let f = fixture(5);
    let id = claimed(&f.store, 'e').await;

    let report = f.sweeper.sweep_once().await;

    assert_eq!(report, SweepReport::default());
    assert_eq!(f.store.get(id).await.unwrap().state, State::Processing);
}

#[tokio::test]
async fn long_queued_task_is_enqueued_again() {
    let f = fixture(5);
    let id = orphan(&f.store, 'f').await;
    assert!(f.store.transition(id, State::Received, State::Queued, TransitionUpdate::none()).await.unwrap());
    f.store.backdate(id, ago(3600));

    let report = f.sweeper.sweep_once().await;

    assert_eq!(report.requeued, 1);
    assert_eq!(f.queue.pending(), vec![id]);
    assert_eq!(f.store.get(id).await.unwrap().state, State::Queued);
}

#[tokio::test]
async fn terminal_tasks_are_never_swept() {
    let f = fixture(5);
    let id = claimed(&f.store, '1').await;
    assert!(
        f.store
            .transition(id, State::Processing, State::Completed, TransitionUpdate::none())
            .await
            .unwrap()
    );
    f.store.backdate(id, ago(86_400));

    assert_eq!(f.sweeper.sweep_once().await, SweepReport::default());
    assert!(f.queue.is_empty());
}

#[tokio::test]
async fn requeued_task_is_not_enqueued_again_on_the_next_sweep() {
    let f = fixture(5);
    let id = orphan(&f.store, '7').await;
    assert!(f.store.transition(id, State::Received, State::Queued, TransitionUpdate::none()).await.unwrap());
    f.store.backdate(id, ago(3600));

    assert_eq!(f.sweeper.sweep_once().await.requeued, 1);
    for _ in 0..4 {
        assert_eq!(f.sweeper.sweep_once().await, SweepReport::default());
    }
    assert_eq!(f.queue.pending(), vec![id]);
}

#[tokio::test]
async fn requeue_reaches_newer_tasks_once_the_oldest_are_handled() {
    let store = Arc::new(MemoryTaskStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let config = WorkerConfig {
        requeue_after: Duration::from_secs(600),
        sweep_batch: 1,
        ..WorkerConfig::default()
    };
    let worker = Worker::new(store.clone(), queue.clone(), Arc::new(NoopProcessor), config);
    let sweeper = Sweeper::new(Arc::new(worker));

    let mut ids = Vec::new();
    for (seed, age) in [('8', 7200), ('9', 3600)] {
        let id = orphan(&store, seed).await;
        assert!(store.transition(id, State::Received, State::Queued, TransitionUpdate::none()).await.unwrap());
        store.backdate(id, ago(age));
        ids.push(id);
    }

    assert_eq!(sweeper.sweep_once().await.requeued, 1);
    assert_eq!(sweeper.sweep_once().await.requeued, 1);
    assert_eq!(queue.pending(), ids);
}

#[tokio::test(start_paused = true)]
async fn queue_outage_does_not_block_lease_recovery() {
    let f = fixture(1);
    let stuck = orphan(&f.store, '3').await;
    f.store.backdate(stuck, ago(120));
    let abandoned = claimed(&f.store, '4').await;
    f.store.backdate(abandoned, ago(60));

    f.queue.fail_next_enqueues(1_000);
    let report = f.sweeper.sweep_once().await;

    assert_eq!(report.failed, 1);
    assert_eq!(report.leases_recovered, 1);
    assert_eq!(f.store.get(stuck).await.unwrap().state, State::Received);
    // Last attempt: failing the task needs no queue.
    assert_eq!(f.store.get(abandoned).await.unwrap().state, State::Failed);

    // Picked up again once the queue is back.
    f.queue.fail_next_enqueues(0);
    assert_eq!(f.sweeper.sweep_once().await.orphans_queued, 1);
    assert_eq!(f.store.get(stuck).await.unwrap().state, State::Queued);
}

#[tokio::test(start_paused = true)]
async fn store_outage_is_counted_not_raised() {
    let f = fixture(5);
    let id = orphan(&f.store, '5').await;
    f.store.backdate(id, ago(120));

    // Enough for every in-place retry of the first listing.
    f.store.fail_next(WorkerConfig::default().transient.max_tries);
    let report = f.sweeper.sweep_once().await;

    assert_eq!(report.failed, 1);
    assert_eq!(report.orphans_queued, 0);
    assert_eq!(f.store.get(id).await.unwrap().state, State::Received);
}
