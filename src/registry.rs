//! Queue Registry
//!
//! Maps member labels to their queue and worker. Adding a member starts its
//! worker; removing it stops the worker cooperatively. All workers run on
//! child tokens of one process-wide shutdown token.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::action::Action;
use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::member::Member;
use crate::queue::{MemberEvent, MemberQueue, MemberWorker};

/// Registry of member queues
pub struct QueueRegistry {
    config: QueueConfig,
    workers: RwLock<HashMap<String, Arc<MemberWorker>>>,
    events: broadcast::Sender<MemberEvent>,
    failures: mpsc::UnboundedSender<MemberEvent>,
    /// Handed out once, to whoever quarantines failing members
    failure_rx: Mutex<Option<mpsc::UnboundedReceiver<MemberEvent>>>,
    shutdown: CancellationToken,
}

impl QueueRegistry {
    /// Create an empty registry
    pub fn new(config: QueueConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (failures, failure_rx) = mpsc::unbounded_channel();
        Self {
            config,
            workers: RwLock::new(HashMap::new()),
            events,
            failures,
            failure_rx: Mutex::new(Some(failure_rx)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Subscribe to state transitions of every member
    pub fn subscribe(&self) -> broadcast::Receiver<MemberEvent> {
        self.events.subscribe()
    }

    /// Take the lossless stream of `Quarantined` events. Only the first
    /// caller gets it.
    pub fn take_failures(&self) -> Option<mpsc::UnboundedReceiver<MemberEvent>> {
        self.failure_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    /// Token cancelled when the registry shuts down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Register a member and start its worker. Registering a label twice
    /// returns the existing worker.
    pub async fn add(&self, member: Arc<dyn Member>) -> Result<Arc<MemberWorker>> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        let label = member.label().to_string();
        let mut workers = self.workers.write().await;
        if let Some(existing) = workers.get(&label) {
            tracing::warn!("Member {} is already registered", label);
            return Ok(Arc::clone(existing));
        }

        let queue = Arc::new(MemberQueue::new(
            label.clone(),
            self.config.capacity,
            self.shutdown.child_token(),
            self.events.clone(),
        )
        .with_failure_channel(self.failures.clone()));
        let worker = Arc::new(MemberWorker::new(queue, member, &self.config));
        worker.spawn();
        workers.insert(label.clone(), Arc::clone(&worker));

        tracing::info!("Registered member {} (queue capacity {})", label, self.config.capacity);
        Ok(worker)
    }

    /// Stop a member's worker and unregister it. Returns false if unknown.
    pub async fn remove(&self, label: &str) -> bool {
        let worker = self.workers.write().await.remove(label);
        match worker {
            Some(worker) => {
                worker.stop().await;
                tracing::info!("Unregistered member {}", label);
                true
            }
            None => false,
        }
    }

    /// Append an action to a member's queue. Unknown members are ignored.
    pub async fn enqueue(&self, label: &str, action: Action) {
        let Some(queue) = self.queue(label).await else {
            tracing::debug!("Ignoring {} for unknown member {}", action, label);
            return;
        };
        // Failures are logged and published by the queue itself
        let _ = queue.add(action).await;
    }

    /// Append several actions to a member's queue, in order
    pub async fn enqueue_all(&self, label: &str, actions: Vec<Action>) {
        let Some(queue) = self.queue(label).await else {
            tracing::debug!("Ignoring {} actions for unknown member {}", actions.len(), label);
            return;
        };
        for action in actions {
            if queue.add(action).await.is_err() {
                break;
            }
        }
    }

    /// Enqueue an independent copy of `action` to every member in `labels`.
    /// Returns each member's copy that was actually handed to its queue.
    pub async fn broadcast(&self, labels: &[String], action: &Action) -> Vec<(String, Action)> {
        let mut copies = Vec::with_capacity(labels.len());
        for label in labels {
            let Some(queue) = self.queue(label).await else {
                continue;
            };
            let copy = action.duplicate();
            if queue.add(copy.clone()).await.is_ok() {
                copies.push((label.clone(), copy));
            }
        }
        copies
    }

    /// Stop every worker and empty the registry
    pub async fn clear(&self) {
        let workers: Vec<Arc<MemberWorker>> = {
            let mut map = self.workers.write().await;
            map.drain().map(|(_, w)| w).collect()
        };
        if workers.is_empty() {
            return;
        }

        tracing::info!("Stopping {} member workers", workers.len());
        futures::future::join_all(workers.iter().map(|w| w.stop())).await;
    }

    /// Fan a stop signal out to every worker, then clear the registry
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.clear().await;
    }

    pub async fn worker(&self, label: &str) -> Option<Arc<MemberWorker>> {
        self.workers.read().await.get(label).cloned()
    }

    pub async fn queue(&self, label: &str) -> Option<Arc<MemberQueue>> {
        self.workers
            .read()
            .await
            .get(label)
            .map(|w| Arc::clone(w.queue()))
    }

    pub async fn contains(&self, label: &str) -> bool {
        self.workers.read().await.contains_key(label)
    }

    /// Labels of all registered members, sorted
    pub async fn labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.workers.read().await.keys().cloned().collect();
        labels.sort();
        labels
    }

    pub async fn len(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workers.read().await.is_empty()
    }

    /// Pause a member's worker. Returns true if its state changed.
    pub async fn pause(&self, label: &str) -> bool {
        match self.worker(label).await {
            Some(w) => w.pause(),
            None => false,
        }
    }

    /// Resume a member's worker. Returns true if its state changed.
    pub async fn unpause(&self, label: &str) -> bool {
        match self.worker(label).await {
            Some(w) => w.unpause(),
            None => false,
        }
    }
}
