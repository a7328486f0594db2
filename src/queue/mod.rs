//! Member Queues
//!
//! Every cluster member owns one bounded FIFO of pending actions and one
//! worker draining it. State changes are published as [`MemberEvent`]s on a
//! broadcast channel the coordinator subscribes to. That channel drops the
//! oldest events when a subscriber falls behind, so quarantine signals are
//! also sent on a dedicated unbounded channel when one is attached.

mod worker;

pub use worker::{MemberWorker, WorkerState};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::action::Action;
use crate::error::{Error, Result};

/// State transitions reported by a member's queue and worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MemberEvent {
    /// The worker polled and found nothing to do
    QueueEmpty { member: String },
    Paused { member: String },
    Unpaused { member: String },
    ActionSucceeded { member: String, action: Uuid },
    /// The worker loop exited
    Stopped { member: String },
    /// Applying an action failed; the member should leave write duty
    Quarantined { member: String, error: String },
    /// An action was lost because the queue stopped while the producer waited
    ActionDropped { member: String, action: Uuid },
}

impl MemberEvent {
    /// Label of the member the event is about
    pub fn member(&self) -> &str {
        match self {
            MemberEvent::QueueEmpty { member }
            | MemberEvent::Paused { member }
            | MemberEvent::Unpaused { member }
            | MemberEvent::ActionSucceeded { member, .. }
            | MemberEvent::Stopped { member }
            | MemberEvent::Quarantined { member, .. }
            | MemberEvent::ActionDropped { member, .. } => member,
        }
    }
}

/// Bounded, ordered buffer of pending actions for exactly one member
pub struct MemberQueue {
    member: String,
    tx: mpsc::Sender<Action>,
    rx: Mutex<mpsc::Receiver<Action>>,
    /// Actions accepted but not yet finished by the worker
    outstanding: AtomicUsize,
    idle: Notify,
    running: AtomicBool,
    stop: CancellationToken,
    events: broadcast::Sender<MemberEvent>,
    failures: Option<mpsc::UnboundedSender<MemberEvent>>,
}

impl MemberQueue {
    /// Create a queue holding at most `capacity` actions. Cancelling `stop`
    /// (directly or through a parent token) stops the queue.
    pub fn new(
        member: impl Into<String>,
        capacity: usize,
        stop: CancellationToken,
        events: broadcast::Sender<MemberEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            member: member.into(),
            tx,
            rx: Mutex::new(rx),
            outstanding: AtomicUsize::new(0),
            idle: Notify::new(),
            running: AtomicBool::new(false),
            stop,
            events,
            failures: None,
        }
    }

    /// Also deliver `Quarantined` events on `failures`, which never drops them
    pub fn with_failure_channel(mut self, failures: mpsc::UnboundedSender<MemberEvent>) -> Self {
        self.failures = Some(failures);
        self
    }

    /// Label of the owning member
    pub fn member(&self) -> &str {
        &self.member
    }

    /// Append an action, waiting for space while the queue is full.
    ///
    /// If the queue is stopped before the action could be accepted, the
    /// action is lost: the loss is logged, published as
    /// [`MemberEvent::ActionDropped`] and returned as `Error::QueueClosed`.
    pub async fn add(&self, action: Action) -> Result<()> {
        let id = action.id();
        let label = action.label().to_string();
        self.outstanding.fetch_add(1, Ordering::SeqCst);

        let accepted = if self.stop.is_cancelled() {
            false
        } else {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => false,
                sent = self.tx.send(action) => sent.is_ok(),
            }
        };

        if accepted {
            return Ok(());
        }

        self.finished();
        tracing::error!(
            "Queue for {} stopped while enqueueing {} [{}]; action dropped",
            self.member,
            label,
            id
        );
        self.emit(MemberEvent::ActionDropped {
            member: self.member.clone(),
            action: id,
        });
        Err(Error::QueueClosed(self.member.clone()))
    }

    /// Remove the head of the queue, waiting up to `timeout` for one to
    /// arrive. Returns `None` on timeout or once the queue is stopped.
    pub async fn remove(&self, timeout: Duration) -> Option<Action> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => None,
            received = tokio::time::timeout(timeout, rx.recv()) => received.ok().flatten(),
        }
    }

    /// Number of actions waiting in the buffer
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Actions accepted and not yet finished, including one being applied
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// No action is queued or being applied
    pub fn is_idle(&self) -> bool {
        self.outstanding() == 0
    }

    /// Wait up to `timeout` for the queue to become idle
    pub async fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_idle() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_idle();
            }
        }
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    /// Signal the worker to terminate. Pending actions stay in the buffer.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stop.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.stop.is_cancelled()
    }

    pub(crate) fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Mark one accepted action as finished (applied or failed)
    pub(crate) fn finished(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    pub(crate) fn emit(&self, event: MemberEvent) {
        if let (MemberEvent::Quarantined { .. }, Some(failures)) = (&event, &self.failures) {
            if failures.send(event.clone()).is_err() {
                tracing::warn!("Nobody is listening for failures of {}", self.member);
            }
        }
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Operation, Value};

    fn queue(capacity: usize) -> (MemberQueue, broadcast::Receiver<MemberEvent>) {
        let (events, rx) = broadcast::channel(64);
        (
            MemberQueue::new("db-1", capacity, CancellationToken::new(), events),
            rx,
        )
    }

    fn insert(id: i64) -> Action {
        Action::from_operation(Operation::Insert {
            table: "users".into(),
            columns: vec!["id".into()],
            values: vec![Value::Int(id)],
        })
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let (queue, _rx) = queue(8);
        let actions: Vec<Action> = (0..5).map(insert).collect();
        for a in &actions {
            queue.add(a.clone()).await.unwrap();
        }
        assert_eq!(queue.len(), 5);

        for expected in &actions {
            let got = queue.remove(Duration::from_millis(10)).await.unwrap();
            assert_eq!(got.id(), expected.id());
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_remove_times_out_when_empty() {
        let (queue, _rx) = queue(8);
        let started = std::time::Instant::now();
        assert!(queue.remove(Duration::from_millis(50)).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_add_blocks_when_full() {
        let (queue, _rx) = queue(2);
        queue.add(insert(1)).await.unwrap();
        queue.add(insert(2)).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), queue.add(insert(3))).await;
        assert!(blocked.is_err(), "third add should wait for space");

        assert!(queue.remove(Duration::from_millis(10)).await.is_some());
        tokio::time::timeout(Duration::from_millis(200), queue.add(insert(4)))
            .await
            .expect("add should proceed once space frees")
            .unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_stop_while_blocked_drops_action() {
        let (queue, mut rx) = queue(1);
        let queue = std::sync::Arc::new(queue);
        queue.add(insert(1)).await.unwrap();

        let dropped = insert(2);
        let dropped_id = dropped.id();
        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.add(dropped).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.stop();

        let result = producer.await.unwrap();
        assert!(matches!(result, Err(Error::QueueClosed(_))));
        assert_eq!(
            rx.recv().await.unwrap(),
            MemberEvent::ActionDropped {
                member: "db-1".into(),
                action: dropped_id,
            }
        );
    }

    #[tokio::test]
    async fn test_quarantine_survives_lagging_subscriber() {
        let (events, mut rx) = broadcast::channel(4);
        let (failures, mut failure_rx) = mpsc::unbounded_channel();
        let queue = MemberQueue::new("db-1", 8, CancellationToken::new(), events)
            .with_failure_channel(failures);

        queue.emit(MemberEvent::Quarantined {
            member: "db-1".into(),
            error: "boom".into(),
        });
        for _ in 0..32 {
            queue.emit(MemberEvent::QueueEmpty { member: "db-1".into() });
        }

        assert!(matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Lagged(_))));
        assert_eq!(
            failure_rx.try_recv().unwrap(),
            MemberEvent::Quarantined {
                member: "db-1".into(),
                error: "boom".into(),
            }
        );
        assert!(failure_rx.try_recv().is_err(), "only failures go on the failure channel");
    }

    #[tokio::test]
    async fn test_idle_tracking() {
        let (queue, _rx) = queue(4);
        assert!(queue.is_idle());

        queue.add(insert(1)).await.unwrap();
        assert!(!queue.is_idle());
        assert!(!queue.wait_until_idle(Duration::from_millis(20)).await);

        let _action = queue.remove(Duration::from_millis(10)).await.unwrap();
        assert!(!queue.is_idle(), "removed but not yet finished");
        queue.finished();
        assert!(queue.wait_until_idle(Duration::from_millis(20)).await);
    }
}
