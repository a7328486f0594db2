//! In-process cluster coordinator
//!
//! Owns member status, the template role and its lease, the tracked tables
//! and the queue registry. Writes are fanned out to active members only and
//! are held off while a synchronization copies the template.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use super::{Coordinator, MemberStatus, TemplateLease};
use crate::action::{Action, TableDescriptor};
use crate::config::{ClusterConfig, QueueConfig, SyncConfig, WolfSyncConfig};
use crate::error::{Error, Result};
use crate::member::Member;
use crate::queue::{MemberEvent, WorkerState};
use crate::registry::QueueRegistry;
use crate::sync::{SyncOutcome, SynchronizationAction};

/// Coordinator-side record of one member
struct MemberRecord {
    member: Arc<dyn Member>,
    status: MemberStatus,
    joined_at: DateTime<Utc>,
    succeeded: u64,
    dropped: u64,
    last_error: Option<String>,
}

impl MemberRecord {
    fn new(member: Arc<dyn Member>) -> Self {
        Self {
            member,
            status: MemberStatus::Synchronizing,
            joined_at: Utc::now(),
            succeeded: 0,
            dropped: 0,
            last_error: None,
        }
    }
}

/// Status snapshot of one member
#[derive(Debug, Clone, Serialize)]
pub struct MemberSummary {
    pub label: String,
    pub status: MemberStatus,
    pub template: bool,
    pub worker: Option<WorkerState>,
    pub queued: usize,
    pub idle: bool,
    pub succeeded: u64,
    pub dropped: u64,
    pub last_error: Option<String>,
    pub joined_at: DateTime<Utc>,
}

/// Status snapshot of the cluster
#[derive(Debug, Clone, Serialize)]
pub struct ClusterSummary {
    pub cluster: String,
    pub template: Option<String>,
    pub tracked_tables: Vec<String>,
    pub members: Vec<MemberSummary>,
}

impl ClusterSummary {
    pub fn count(&self, status: MemberStatus) -> usize {
        self.members.iter().filter(|m| m.status == status).count()
    }
}

/// Coordinates the members of one cluster
pub struct ClusterCoordinator {
    label: String,
    preferred_template: Option<String>,
    sync_config: SyncConfig,
    registry: QueueRegistry,
    members: RwLock<HashMap<String, MemberRecord>>,
    template: RwLock<Option<String>>,
    /// Held by whoever owns the template lease
    template_lock: Arc<Mutex<()>>,
    /// Replicated writes take this shared; a lease takes it exclusively
    write_gate: Arc<RwLock<()>>,
    tracked: RwLock<Vec<TableDescriptor>>,
}

impl ClusterCoordinator {
    pub fn new(cluster: &ClusterConfig, queue: QueueConfig, sync: SyncConfig) -> Self {
        Self {
            label: cluster.label.clone(),
            preferred_template: cluster.template.clone(),
            sync_config: sync,
            registry: QueueRegistry::new(queue),
            members: RwLock::new(HashMap::new()),
            template: RwLock::new(None),
            template_lock: Arc::new(Mutex::new(())),
            write_gate: Arc::new(RwLock::new(())),
            tracked: RwLock::new(Vec::new()),
        }
    }

    pub fn from_config(config: &WolfSyncConfig) -> Self {
        Self::new(&config.cluster, config.queue.clone(), config.sync.clone())
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn registry(&self) -> &QueueRegistry {
        &self.registry
    }

    /// Add a table to the set copied during synchronization. A table with
    /// the same name is replaced in place.
    pub async fn track_table(&self, table: TableDescriptor) {
        let mut tracked = self.tracked.write().await;
        match tracked.iter_mut().find(|t| t.name == table.name) {
            Some(existing) => *existing = table,
            None => tracked.push(table),
        }
    }

    /// Consume member events until shutdown. Quarantines arrive on the
    /// registry's failure channel, which never drops them; the broadcast
    /// copy is only used if another loop already owns that channel.
    pub fn spawn_event_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let mut events = BroadcastStream::new(self.registry.subscribe());
        let mut failures = self.registry.take_failures();
        if failures.is_none() {
            tracing::warn!("Failure channel of {} already taken; quarantines may be lost", self.label);
        }
        let lossless = failures.is_some();
        let shutdown = self.registry.shutdown_token();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    Some(failure) = next_failure(&mut failures) => {
                        coordinator.handle_event(failure).await;
                    }
                    event = events.next() => match event {
                        Some(Ok(MemberEvent::Quarantined { member, .. })) if lossless => {
                            tracing::trace!("Quarantine of {} handled on the failure channel", member);
                        }
                        Some(Ok(event)) => coordinator.handle_event(event).await,
                        Some(Err(BroadcastStreamRecvError::Lagged(missed))) => {
                            tracing::warn!("Cluster event loop lagged, {} member events lost", missed);
                        }
                        None => break,
                    },
                }
            }
            tracing::debug!("Cluster event loop for {} stopped", coordinator.label);
        })
    }

    async fn handle_event(&self, event: MemberEvent) {
        match event {
            MemberEvent::ActionSucceeded { member, .. } => {
                if let Some(record) = self.members.write().await.get_mut(&member) {
                    record.succeeded += 1;
                }
            }
            MemberEvent::Quarantined { member, error } => {
                self.quarantine(&member, &error).await;
            }
            MemberEvent::ActionDropped { member, action } => {
                if let Some(record) = self.members.write().await.get_mut(&member) {
                    record.dropped += 1;
                }
                tracing::warn!("Action {} for {} was dropped before reaching its queue", action, member);
            }
            MemberEvent::Paused { member } => tracing::debug!("Member {} paused", member),
            MemberEvent::Unpaused { member } => tracing::debug!("Member {} unpaused", member),
            MemberEvent::Stopped { member } => tracing::debug!("Worker for {} stopped", member),
            MemberEvent::QueueEmpty { member } => tracing::trace!("Queue for {} is empty", member),
        }
    }

    /// Register a member and bootstrap it from the template. The first
    /// member of an empty cluster becomes the template.
    pub async fn join(&self, member: Arc<dyn Member>) -> Result<SyncOutcome> {
        let label = member.label().to_string();
        if self.is_member(&label).await {
            return Err(Error::Config(format!("member {} already joined cluster {}", label, self.label)));
        }

        self.registry.add(Arc::clone(&member)).await?;

        {
            let mut members = self.members.write().await;
            let bootstrap = members.values().all(|r| r.status == MemberStatus::Removed);
            members.insert(label.clone(), MemberRecord::new(member));
            if bootstrap {
                tracing::info!("{} bootstraps cluster {} as template", label, self.label);
                *self.template.write().await = Some(label.clone());
            }
        }

        tracing::info!("Member {} joined cluster {}", label, self.label);
        self.synchronize(&label).await
    }

    /// Run a synchronization for a registered member. A member that does
    /// not converge is quarantined.
    pub async fn synchronize(&self, label: &str) -> Result<SyncOutcome> {
        let action = SynchronizationAction::new(label, &self.sync_config);
        match action.execute(self).await {
            Ok(outcome) if outcome.is_success() => {
                if self.member_status(label).await != Some(MemberStatus::Active) {
                    tracing::warn!("{} converged but was quarantined meanwhile", label);
                }
                Ok(outcome)
            }
            Ok(outcome) => {
                self.quarantine(label, &format!("synchronization did not converge: {:?}", outcome))
                    .await;
                Ok(outcome)
            }
            Err(e) => {
                self.quarantine(label, &e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Fan an action out to every active member. Waits while a
    /// synchronization holds the template. Returns each member's copy.
    pub async fn replicate(&self, action: Action) -> Result<Vec<(String, Action)>> {
        if self.registry.shutdown_token().is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        let _writes = self.write_gate.read().await;
        let targets = self.active_members().await;
        if targets.is_empty() {
            return Err(Error::NoTemplate(self.label.clone()));
        }

        tracing::debug!("Replicating {} to {} members", action, targets.len());
        Ok(self.registry.broadcast(&targets, &action).await)
    }

    /// Take a member out of the cluster. Returns false if it was not a member.
    pub async fn leave(&self, label: &str) -> bool {
        let known = {
            let mut members = self.members.write().await;
            match members.get_mut(label) {
                Some(record) if record.status != MemberStatus::Removed => {
                    record.status = MemberStatus::Removed;
                    true
                }
                _ => false,
            }
        };
        if !known {
            return false;
        }

        self.registry.remove(label).await;
        if self.template_label().await.as_deref() == Some(label) {
            self.elect_template().await;
        }
        tracing::info!("Member {} left cluster {}", label, self.label);
        true
    }

    /// Bring a quarantined member back: fresh queue, then a full resync
    pub async fn recover(&self, label: &str) -> Result<SyncOutcome> {
        let member = {
            let members = self.members.read().await;
            let record = members
                .get(label)
                .filter(|r| r.status != MemberStatus::Removed)
                .ok_or_else(|| Error::MemberNotFound(label.to_string()))?;
            if record.status != MemberStatus::Quarantined {
                return Err(Error::Sync {
                    member: label.to_string(),
                    reason: format!("cannot recover a member that is {}", record.status),
                });
            }
            Arc::clone(&record.member)
        };

        match member.health_check().await {
            Ok(true) => {}
            Ok(false) => return Err(Error::MemberUnavailable(label.to_string())),
            Err(e) => {
                tracing::warn!("Health check of {} failed: {}", label, e);
                return Err(Error::MemberUnavailable(label.to_string()));
            }
        }

        tracing::info!("Recovering member {}", label);
        self.registry.remove(label).await;
        self.registry.add(member).await?;

        if let Some(record) = self.members.write().await.get_mut(label) {
            record.status = MemberStatus::Synchronizing;
            record.last_error = None;
        }

        // Every member is quarantined: this one bootstraps the cluster again
        {
            let mut template = self.template.write().await;
            if template.is_none() {
                tracing::info!("{} recovers as template of cluster {}", label, self.label);
                *template = Some(label.to_string());
            }
        }

        self.synchronize(label).await
    }

    /// Pause a member's worker. Returns true if its state changed.
    pub async fn pause(&self, label: &str) -> Result<bool> {
        if !self.is_member(label).await {
            return Err(Error::MemberNotFound(label.to_string()));
        }
        Ok(self.registry.pause(label).await)
    }

    /// Resume a member's worker. Quarantined members need `recover`.
    pub async fn unpause(&self, label: &str) -> Result<bool> {
        match self.member_status(label).await {
            None | Some(MemberStatus::Removed) => Err(Error::MemberNotFound(label.to_string())),
            Some(MemberStatus::Quarantined) => {
                tracing::warn!("{} is quarantined; recover it instead of unpausing", label);
                Ok(false)
            }
            Some(_) => Ok(self.registry.unpause(label).await),
        }
    }

    /// Mark a member quarantined, pause its worker and move the template
    /// role elsewhere if needed
    pub async fn quarantine(&self, label: &str, error: &str) {
        {
            let mut members = self.members.write().await;
            let Some(record) = members.get_mut(label) else {
                return;
            };
            if record.status == MemberStatus::Removed {
                return;
            }
            record.last_error = Some(error.to_string());
            if record.status != MemberStatus::Quarantined {
                record.status = MemberStatus::Quarantined;
                tracing::error!("Member {} quarantined: {}", label, error);
            }
        }

        self.registry.pause(label).await;
        if self.template_label().await.as_deref() == Some(label) {
            self.elect_template().await;
        }
    }

    /// Choose a new template among active members, preferring the
    /// configured one
    async fn elect_template(&self) {
        let candidate = {
            let members = self.members.read().await;
            let is_active = |label: &str| {
                members
                    .get(label)
                    .map_or(false, |r| r.status == MemberStatus::Active)
            };
            match &self.preferred_template {
                Some(preferred) if is_active(preferred) => Some(preferred.clone()),
                _ => {
                    let mut active: Vec<&String> = members
                        .iter()
                        .filter(|(_, r)| r.status == MemberStatus::Active)
                        .map(|(label, _)| label)
                        .collect();
                    active.sort();
                    active.first().map(|label| label.to_string())
                }
            }
        };

        let mut template = self.template.write().await;
        if *template != candidate {
            match &candidate {
                Some(label) => tracing::info!("Template of cluster {} is now {}", self.label, label),
                None => tracing::warn!("No active member left to serve as template of {}", self.label),
            }
        }
        *template = candidate;
    }

    pub async fn template_label(&self) -> Option<String> {
        self.template.read().await.clone()
    }

    pub async fn member_status(&self, label: &str) -> Option<MemberStatus> {
        self.members.read().await.get(label).map(|r| r.status)
    }

    async fn is_member(&self, label: &str) -> bool {
        matches!(
            self.member_status(label).await,
            Some(status) if status != MemberStatus::Removed
        )
    }

    /// Labels of active members, sorted
    pub async fn active_members(&self) -> Vec<String> {
        let mut labels: Vec<String> = self
            .members
            .read()
            .await
            .iter()
            .filter(|(_, r)| r.status == MemberStatus::Active)
            .map(|(label, _)| label.clone())
            .collect();
        labels.sort();
        labels
    }

    /// Snapshot of every member and the template
    pub async fn status(&self) -> ClusterSummary {
        let template = self.template_label().await;
        let tracked_tables = self.tracked.read().await.iter().map(|t| t.name.clone()).collect();

        let records: Vec<MemberSummary> = {
            let members = self.members.read().await;
            members
                .iter()
                .map(|(label, r)| MemberSummary {
                    label: label.clone(),
                    status: r.status,
                    template: template.as_deref() == Some(label.as_str()),
                    worker: None,
                    queued: 0,
                    idle: true,
                    succeeded: r.succeeded,
                    dropped: r.dropped,
                    last_error: r.last_error.clone(),
                    joined_at: r.joined_at,
                })
                .collect()
        };

        let mut members = Vec::with_capacity(records.len());
        for mut summary in records {
            if let Some(worker) = self.registry.worker(&summary.label).await {
                summary.worker = Some(worker.state());
                summary.queued = worker.queue().len();
                summary.idle = worker.queue().is_idle();
            }
            members.push(summary);
        }
        members.sort_by(|a, b| a.label.cmp(&b.label));

        ClusterSummary {
            cluster: self.label.clone(),
            template,
            tracked_tables,
            members,
        }
    }

    /// Stop every worker. Later joins and writes fail with `ShuttingDown`.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down cluster {}", self.label);
        self.registry.shutdown().await;
    }
}

#[async_trait]
impl Coordinator for ClusterCoordinator {
    fn cluster_label(&self) -> &str {
        &self.label
    }

    async fn member_count(&self) -> usize {
        self.members
            .read()
            .await
            .values()
            .filter(|r| r.status != MemberStatus::Removed)
            .count()
    }

    async fn member(&self, label: &str) -> Option<Arc<dyn Member>> {
        self.members
            .read()
            .await
            .get(label)
            .filter(|r| r.status != MemberStatus::Removed)
            .map(|r| Arc::clone(&r.member))
    }

    async fn acquire_template(&self) -> Result<TemplateLease> {
        let exclusive = Arc::clone(&self.template_lock).lock_owned().await;
        let writes = Arc::clone(&self.write_gate).write_owned().await;

        let label = self
            .template_label()
            .await
            .ok_or_else(|| Error::NoTemplate(self.label.clone()))?;
        let member = self
            .member(&label)
            .await
            .ok_or_else(|| Error::NoTemplate(self.label.clone()))?;

        tracing::debug!("Acquired template {}", label);
        Ok(TemplateLease::new(member, exclusive).holding_writes(writes))
    }

    async fn release_template(&self, lease: TemplateLease) {
        tracing::debug!("Released template {}", lease.label());
        drop(lease);
    }

    async fn tracked_tables(&self) -> Vec<TableDescriptor> {
        self.tracked.read().await.clone()
    }

    async fn enqueue_to_member(&self, member: &str, actions: Vec<Action>) {
        self.registry.enqueue_all(member, actions).await;
    }

    async fn wait_until_synchronized(&self, member: &str, timeout: Duration) -> bool {
        match self.registry.queue(member).await {
            Some(queue) => queue.wait_until_idle(timeout).await,
            None => false,
        }
    }

    async fn pending_actions(&self, member: &str) -> usize {
        match self.registry.queue(member).await {
            Some(queue) => queue.outstanding(),
            None => 0,
        }
    }

    async fn report_synchronized(&self, template: &str, target: &str) {
        let mut members = self.members.write().await;
        let Some(record) = members.get_mut(target) else {
            return;
        };
        match record.status {
            MemberStatus::Synchronizing => {
                record.status = MemberStatus::Active;
                tracing::info!("Member {} synchronized from {}", target, template);
            }
            status => tracing::warn!("{} reported synchronized while {}", target, status),
        }
    }
}

async fn next_failure(failures: &mut Option<mpsc::UnboundedReceiver<MemberEvent>>) -> Option<MemberEvent> {
    match failures {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
