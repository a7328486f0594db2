//! Member Worker
//!
//! The single execution loop bound to one member queue and one member
//! connection. Applies actions in FIFO order, reports every outcome as an
//! event, and never exits on a failed action.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{MemberEvent, MemberQueue};
use crate::action::Action;
use crate::config::QueueConfig;
use crate::member::Member;

/// Lifecycle of a worker: `New -> Running <-> Paused -> Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum WorkerState {
    New,
    Running,
    Paused,
    Stopped,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::New => write!(f, "NEW"),
            WorkerState::Running => write!(f, "RUNNING"),
            WorkerState::Paused => write!(f, "PAUSED"),
            WorkerState::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Dedicated worker draining one member's queue
pub struct MemberWorker {
    queue: Arc<MemberQueue>,
    member: Arc<dyn Member>,
    /// Cancelled once the worker must not start another iteration
    proceed: CancellationToken,
    /// Cancelled when the loop has exited
    terminated: CancellationToken,
    /// Set once the worker has been spawned or run
    started: AtomicBool,
    /// Set by whichever of `run` or `stop` owns the loop's lifecycle
    claimed: AtomicBool,
    paused: AtomicBool,
    remove_timeout: Duration,
    poll_interval: Duration,
    stop_timeout: Duration,
}

impl MemberWorker {
    /// Create a worker for `queue`, applying actions against `member`
    pub fn new(queue: Arc<MemberQueue>, member: Arc<dyn Member>, config: &QueueConfig) -> Self {
        let proceed = queue.stop_token();
        Self {
            queue,
            member,
            proceed,
            terminated: CancellationToken::new(),
            started: AtomicBool::new(false),
            claimed: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            remove_timeout: config.remove_timeout(),
            poll_interval: config.poll_interval(),
            stop_timeout: config.stop_timeout(),
        }
    }

    /// Label of the member this worker applies actions to
    pub fn member_label(&self) -> &str {
        self.member.label()
    }

    pub fn member(&self) -> Arc<dyn Member> {
        Arc::clone(&self.member)
    }

    pub fn queue(&self) -> &Arc<MemberQueue> {
        &self.queue
    }

    /// Spawn the worker loop on the runtime
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        self.started.store(true, Ordering::SeqCst);
        let worker = Arc::clone(self);
        tokio::spawn(async move { worker.run().await })
    }

    /// Run the worker loop until stopped. A second call returns immediately.
    pub async fn run(self: Arc<Self>) {
        if self.claimed.swap(true, Ordering::SeqCst) {
            tracing::warn!("Worker for {} already started", self.member_label());
            return;
        }
        self.started.store(true, Ordering::SeqCst);

        self.queue.start();
        tracing::info!("Worker for {} started", self.member_label());

        while !self.proceed.is_cancelled() {
            if !self.is_paused() {
                match self.queue.remove(self.remove_timeout).await {
                    Some(action) => self.apply(action).await,
                    None if !self.proceed.is_cancelled() => {
                        self.queue.emit(MemberEvent::QueueEmpty {
                            member: self.member_label().to_string(),
                        });
                    }
                    None => {}
                }
            }

            tokio::select! {
                _ = self.proceed.cancelled() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        self.terminate();
        tracing::info!("Worker for {} stopped", self.member_label());
    }

    async fn apply(&self, action: Action) {
        let label = self.member_label().to_string();
        tracing::debug!("{}: applying {}", label, action);

        match self.member.execute_action(&action).await {
            Ok(()) => {
                action.mark_succeeded();
                action.mark_attempted();
                self.queue.emit(MemberEvent::ActionSucceeded {
                    member: label,
                    action: action.id(),
                });
            }
            Err(e) => {
                action.mark_attempted();
                if e.is_member_unavailable() {
                    tracing::error!("Member {} unavailable while applying {}: {}", label, action, e);
                } else {
                    tracing::error!("Failed to apply {} on {}: {}", action, label, e);
                }
                self.queue.emit(MemberEvent::Quarantined {
                    member: label,
                    error: e.to_string(),
                });
            }
        }

        self.queue.finished();
    }

    fn terminate(&self) {
        self.terminated.cancel();
        self.queue.emit(MemberEvent::Stopped {
            member: self.member_label().to_string(),
        });
    }

    /// Pause the worker. Returns true if this changed its state.
    pub fn pause(&self) -> bool {
        if self.has_stopped() || self.paused.swap(true, Ordering::SeqCst) {
            return false;
        }
        tracing::info!("Worker for {} paused", self.member_label());
        self.queue.emit(MemberEvent::Paused {
            member: self.member_label().to_string(),
        });
        true
    }

    /// Resume a paused worker. Returns true if this changed its state.
    pub fn unpause(&self) -> bool {
        if self.has_stopped() || !self.paused.swap(false, Ordering::SeqCst) {
            return false;
        }
        tracing::info!("Worker for {} unpaused", self.member_label());
        self.queue.emit(MemberEvent::Unpaused {
            member: self.member_label().to_string(),
        });
        true
    }

    /// Ask the worker to stop after its current action and wait up to the
    /// configured stop timeout for confirmation. Returns whether the worker
    /// confirmed termination in time; safe to call repeatedly.
    pub async fn stop(&self) -> bool {
        self.queue.stop();

        // Loop never ran: nothing else will terminate it
        if self
            .claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.terminate();
            return true;
        }

        let confirmed = self.wait_for_termination(self.stop_timeout).await;
        if !confirmed {
            tracing::warn!(
                "Worker for {} did not confirm termination within {:?}",
                self.member_label(),
                self.stop_timeout
            );
        }
        confirmed
    }

    /// Wait up to `timeout` for the loop to exit
    pub async fn wait_for_termination(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.terminated.cancelled())
            .await
            .is_ok()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn has_stopped(&self) -> bool {
        self.terminated.is_cancelled()
    }

    pub fn state(&self) -> WorkerState {
        if self.has_stopped() {
            WorkerState::Stopped
        } else if !self.has_started() {
            WorkerState::New
        } else if self.is_paused() {
            WorkerState::Paused
        } else {
            WorkerState::Running
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ColumnDef, Operation, TableDescriptor, Value};
    use crate::member::InMemoryMember;
    use tokio::sync::broadcast;

    fn fast_config(capacity: usize) -> QueueConfig {
        QueueConfig {
            capacity,
            remove_timeout_ms: 20,
            poll_interval_ms: 1,
            stop_timeout_ms: 200,
            event_capacity: 1024,
        }
    }

    fn table_t() -> TableDescriptor {
        TableDescriptor::new(
            "t",
            vec![ColumnDef::new("id", "int").primary()],
        )
    }

    fn insert(id: i64) -> Action {
        Action::new(
            format!("insert {}", id),
            Operation::Insert {
                table: "t".into(),
                columns: vec!["id".into()],
                values: vec![Value::Int(id)],
            },
        )
    }

    fn worker_for(
        member: Arc<InMemoryMember>,
        capacity: usize,
    ) -> (Arc<MemberWorker>, broadcast::Receiver<MemberEvent>) {
        let (events, rx) = broadcast::channel(1024);
        let config = fast_config(capacity);
        let queue = Arc::new(MemberQueue::new(
            "db-1",
            config.capacity,
            CancellationToken::new(),
            events,
        ));
        (Arc::new(MemberWorker::new(queue, member, &config)), rx)
    }

    async fn next_matching(
        rx: &mut broadcast::Receiver<MemberEvent>,
        pred: impl Fn(&MemberEvent) -> bool,
    ) -> MemberEvent {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = rx.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("expected event")
    }

    #[tokio::test]
    async fn test_applies_scenario_in_order() {
        let member = Arc::new(InMemoryMember::new("db-1"));
        let (worker, _rx) = worker_for(member.clone(), 3);

        let actions = vec![
            Action::new(
                "create t",
                Operation::CreateTable {
                    table: table_t(),
                    if_not_exists: false,
                },
            ),
            insert(1),
            insert(2),
        ];
        for a in &actions {
            worker.queue().add(a.clone()).await.unwrap();
        }

        worker.spawn();
        assert!(worker.queue().wait_until_idle(Duration::from_secs(2)).await);

        let rows = member.scan("t").await.unwrap();
        assert_eq!(rows, vec![vec![Value::Int(1)], vec![Value::Int(2)]]);
        assert!(actions.iter().all(|a| a.succeeded()));
        assert_eq!(member.applied().await, vec!["create t", "insert 1", "insert 2"]);

        assert!(worker.stop().await);
    }

    #[tokio::test]
    async fn test_single_writer_per_member() {
        let member = Arc::new(
            InMemoryMember::new("db-1").with_apply_delay(Duration::from_millis(2)),
        );
        member.create_table(&table_t(), false).await.unwrap();
        let (worker, _rx) = worker_for(member.clone(), 64);
        worker.spawn();

        let mut producers = Vec::new();
        for p in 0..4 {
            let queue = worker.queue().clone();
            producers.push(tokio::spawn(async move {
                for i in 0..10 {
                    queue.add(insert(p * 100 + i)).await.unwrap();
                }
            }));
        }
        for p in producers {
            p.await.unwrap();
        }

        assert!(worker.queue().wait_until_idle(Duration::from_secs(5)).await);
        assert_eq!(member.scan("t").await.unwrap().len(), 40);
        assert_eq!(member.max_concurrent_applies(), 1);
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_failure_quarantines_once_without_retry() {
        let member = Arc::new(InMemoryMember::new("db-1"));
        let (worker, mut rx) = worker_for(member.clone(), 8);

        // Table does not exist: the insert fails
        let failing = insert(1);
        worker.queue().add(failing.clone()).await.unwrap();
        worker.spawn();

        let event = next_matching(&mut rx, |e| matches!(e, MemberEvent::Quarantined { .. })).await;
        assert_eq!(event.member(), "db-1");

        assert!(worker.queue().wait_until_idle(Duration::from_secs(1)).await);
        assert!(failing.attempted());
        assert!(!failing.succeeded());

        // Let the loop spin a few more times; no second quarantine
        tokio::time::sleep(Duration::from_millis(60)).await;
        worker.stop().await;
        let mut quarantines = 0;
        while let Ok(e) = rx.try_recv() {
            if matches!(e, MemberEvent::Quarantined { .. }) {
                quarantines += 1;
            }
        }
        assert_eq!(quarantines, 0);
        assert!(member.applied().await.is_empty());
    }

    #[tokio::test]
    async fn test_loop_survives_failures() {
        let member = Arc::new(InMemoryMember::new("db-1"));
        member.create_table(&table_t(), false).await.unwrap();
        member.fail_on_table("t").await;
        let (worker, _rx) = worker_for(member.clone(), 8);
        worker.spawn();

        worker.queue().add(insert(1)).await.unwrap();
        assert!(worker.queue().wait_until_idle(Duration::from_secs(1)).await);

        member.heal_table("t").await;
        let ok = insert(2);
        worker.queue().add(ok.clone()).await.unwrap();
        assert!(worker.queue().wait_until_idle(Duration::from_secs(1)).await);
        assert!(ok.succeeded());
        assert_eq!(worker.state(), WorkerState::Running);
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_pause_and_unpause() {
        let member = Arc::new(InMemoryMember::new("db-1"));
        member.create_table(&table_t(), false).await.unwrap();
        let (worker, mut rx) = worker_for(member.clone(), 8);
        assert_eq!(worker.state(), WorkerState::New);
        worker.spawn();

        assert!(worker.pause());
        assert!(!worker.pause(), "second pause changes nothing");
        next_matching(&mut rx, |e| matches!(e, MemberEvent::Paused { .. })).await;
        assert_eq!(worker.state(), WorkerState::Paused);

        let action = insert(7);
        worker.queue().add(action.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!action.attempted());

        assert!(worker.unpause());
        assert!(!worker.unpause());
        next_matching(&mut rx, |e| matches!(e, MemberEvent::Unpaused { .. })).await;
        assert!(worker.queue().wait_until_idle(Duration::from_secs(1)).await);
        assert!(action.succeeded());
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let member = Arc::new(InMemoryMember::new("db-1"));
        let (worker, mut rx) = worker_for(member, 8);
        worker.spawn();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(worker.stop().await);
        assert!(worker.has_stopped());
        assert!(worker.stop().await);
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(!worker.pause());

        next_matching(&mut rx, |e| matches!(e, MemberEvent::Stopped { .. })).await;
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let member = Arc::new(InMemoryMember::new("db-1"));
        let (worker, _rx) = worker_for(member, 8);

        assert!(worker.stop().await);
        assert!(!worker.has_started());
        assert!(worker.has_stopped());
        assert_eq!(worker.state(), WorkerState::Stopped);

        // run after stop is a no-op
        tokio::time::timeout(Duration::from_millis(100), worker.clone().run())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_paused_right_after_spawn() {
        let member = Arc::new(InMemoryMember::new("db-1"));
        let (worker, _rx) = worker_for(member, 8);

        worker.spawn();
        assert!(worker.has_started());
        assert!(worker.pause());
        assert_eq!(worker.state(), WorkerState::Paused);
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_stop_times_out_on_slow_action() {
        let member = Arc::new(
            InMemoryMember::new("db-1").with_apply_delay(Duration::from_millis(500)),
        );
        member.create_table(&table_t(), false).await.unwrap();
        let (worker, mut rx) = worker_for(member.clone(), 8);
        worker.spawn();

        let slow = insert(1);
        worker.queue().add(slow.clone()).await.unwrap();
        assert!(eventually_in_flight(&member).await);

        // stop_timeout is 200ms, the action needs 500ms
        assert!(!worker.stop().await);
        assert!(!worker.has_stopped());

        assert!(worker.wait_for_termination(Duration::from_secs(2)).await);
        assert!(worker.has_stopped());
        assert!(slow.succeeded());
        next_matching(&mut rx, |e| matches!(e, MemberEvent::Stopped { .. })).await;
    }

    async fn eventually_in_flight(member: &InMemoryMember) -> bool {
        for _ in 0..100 {
            if member.in_flight() > 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_reports_empty_queue() {
        let member = Arc::new(InMemoryMember::new("db-1"));
        let (worker, mut rx) = worker_for(member, 8);
        worker.spawn();

        next_matching(&mut rx, |e| matches!(e, MemberEvent::QueueEmpty { .. })).await;
        worker.stop().await;
    }
}
