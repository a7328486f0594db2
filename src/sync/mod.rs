//! Member Synchronization
//!
//! Brings one target member up to date from the current template: every
//! tracked table is recreated on the target and refilled with the template's
//! rows, all through the target's own queue. The synchronization then polls
//! until those actions converge or stop making progress.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::action::{Action, Operation, TableDescriptor};
use crate::cluster::{Coordinator, TemplateLease};
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::member::Member;

/// Result of a synchronization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// The cluster has a single member; nothing to copy
    Trivial,
    /// Every catch-up action succeeded
    Converged { actions: usize, rounds: usize },
    /// Polling stopped with actions still pending
    NotConverged { pending: usize, rounds: usize },
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, SyncOutcome::NotConverged { .. })
    }
}

/// Bootstraps one member from the template
pub struct SynchronizationAction {
    target: String,
    poll_interval: Duration,
    max_rounds: usize,
}

impl SynchronizationAction {
    pub fn new(target: impl Into<String>, config: &SyncConfig) -> Self {
        Self {
            target: target.into(),
            poll_interval: config.poll_interval(),
            max_rounds: config.max_rounds.max(1),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Run the synchronization. The template is held for the whole run and
    /// released on every exit path.
    pub async fn execute<C: Coordinator + ?Sized>(&self, coordinator: &C) -> Result<SyncOutcome> {
        let lease = coordinator.acquire_template().await?;
        tracing::info!(
            "Synchronizing {} from template {} in cluster {}",
            self.target,
            lease.label(),
            coordinator.cluster_label()
        );

        let result = self.synchronize(coordinator, &lease).await;
        coordinator.release_template(lease).await;

        match &result {
            Ok(outcome) => tracing::info!("Synchronization of {} finished: {:?}", self.target, outcome),
            Err(e) => tracing::error!("Synchronization of {} failed: {}", self.target, e),
        }
        result
    }

    async fn synchronize<C: Coordinator + ?Sized>(
        &self,
        coordinator: &C,
        lease: &TemplateLease,
    ) -> Result<SyncOutcome> {
        let template = lease.member();

        if coordinator.member_count().await == 1 {
            tracing::info!("{} is the only member, nothing to synchronize", self.target);
            coordinator.report_synchronized(template.label(), &self.target).await;
            return Ok(SyncOutcome::Trivial);
        }

        let target = coordinator
            .member(&self.target)
            .await
            .ok_or_else(|| Error::MemberNotFound(self.target.clone()))?;

        let actions = if template.settings().same_connection(target.settings()) {
            tracing::info!(
                "{} and template {} share a connection, skipping copy",
                self.target,
                template.label()
            );
            Vec::new()
        } else {
            if let Some(stalled) = self.drain_template(coordinator, template.label()).await {
                return Ok(stalled);
            }
            let tables = coordinator.tracked_tables().await;
            self.plan(template, &target, &tables).await
        };

        tracing::info!("Queueing {} catch-up actions for {}", actions.len(), self.target);
        coordinator.enqueue_to_member(&self.target, actions.clone()).await;

        let outcome = self.converge(coordinator, actions).await;
        if let SyncOutcome::Converged { .. } = outcome {
            coordinator.report_synchronized(template.label(), &self.target).await;
        }
        Ok(outcome)
    }

    /// Wait for the template's own queue to drain before it is copied.
    /// Writes are held off by the lease, so the backlog can only shrink.
    /// Returns `NotConverged` once it has not shrunk for `max_rounds` polls.
    async fn drain_template<C: Coordinator + ?Sized>(
        &self,
        coordinator: &C,
        template: &str,
    ) -> Option<SyncOutcome> {
        let mut backlog = coordinator.pending_actions(template).await;
        let mut rounds = 0;
        let mut stalled = 0;

        while !coordinator.wait_until_synchronized(template, self.poll_interval).await {
            rounds += 1;
            let remaining = coordinator.pending_actions(template).await;
            if remaining < backlog {
                stalled = 0;
            } else {
                stalled += 1;
            }
            backlog = remaining;

            if stalled >= self.max_rounds {
                tracing::warn!(
                    "Template {} is stuck with {} pending actions; not copying it to {}",
                    template,
                    backlog,
                    self.target
                );
                return Some(SyncOutcome::NotConverged {
                    pending: backlog,
                    rounds,
                });
            }
            tracing::debug!("Waiting for template {} to apply {} actions", template, backlog);
        }

        None
    }

    /// Build the structural and data actions that recreate every tracked
    /// table on the target. A table that cannot be read is skipped.
    async fn plan(
        &self,
        template: &Arc<dyn Member>,
        target: &Arc<dyn Member>,
        tables: &[TableDescriptor],
    ) -> Vec<Action> {
        let mut actions = Vec::new();

        for table in tables {
            match template.table_exists(table).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!("Table {} missing on template {}, skipping", table.name, template.label());
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Cannot inspect {} on template: {}; skipping", table.name, e);
                    continue;
                }
            }

            let mut table_actions = Vec::new();
            match target.table_exists(table).await {
                Ok(false) => {}
                Ok(true) => table_actions.push(self.action("drop", table, Operation::DropTable {
                    table: table.clone(),
                })),
                Err(e) => {
                    tracing::warn!("Cannot inspect {} on {}: {}; dropping anyway", table.name, self.target, e);
                    table_actions.push(self.action("drop", table, Operation::DropTable {
                        table: table.clone(),
                    }));
                }
            }
            table_actions.push(self.action("create", table, Operation::CreateTable {
                table: table.clone(),
                if_not_exists: false,
            }));

            let count = match template.count_rows(table).await {
                Ok(count) => count,
                Err(e) => {
                    tracing::warn!("Cannot count rows of {}: {}; skipping table", table.name, e);
                    continue;
                }
            };

            if count > 0 {
                match template.fetch_all_rows(table).await {
                    Ok(rows) => {
                        tracing::debug!("Copying {} rows of {}", rows.len(), table.name);
                        table_actions.push(self.action("copy", table, Operation::BulkInsert {
                            table: table.clone(),
                            rows,
                        }));
                    }
                    Err(e) => {
                        tracing::warn!("Cannot read rows of {}: {}; copying structure only", table.name, e);
                    }
                }
            }

            actions.extend(table_actions);
        }

        actions
    }

    fn action(&self, verb: &str, table: &TableDescriptor, operation: Operation) -> Action {
        Action::new(format!("sync {}: {} {}", self.target, verb, table.name), operation)
    }

    /// Poll until every action succeeded, a round makes no progress, or the
    /// round limit is reached. Actions that failed are resubmitted after a
    /// round in which others made progress.
    async fn converge<C: Coordinator + ?Sized>(&self, coordinator: &C, actions: Vec<Action>) -> SyncOutcome {
        let total = actions.len();
        let mut pending = actions;
        let mut rounds = 0;

        while !pending.is_empty() {
            rounds += 1;
            coordinator
                .wait_until_synchronized(&self.target, self.poll_interval)
                .await;

            let before = pending.len();
            pending.retain(|a| !a.succeeded());
            let progressed = pending.len() < before;

            if pending.is_empty() {
                break;
            }
            if !progressed {
                tracing::warn!(
                    "No progress synchronizing {} ({} of {} actions pending)",
                    self.target,
                    pending.len(),
                    total
                );
                return SyncOutcome::NotConverged {
                    pending: pending.len(),
                    rounds,
                };
            }
            if rounds >= self.max_rounds {
                tracing::warn!("Giving up on {} after {} rounds", self.target, rounds);
                return SyncOutcome::NotConverged {
                    pending: pending.len(),
                    rounds,
                };
            }

            let retry: Vec<Action> = pending.iter().filter(|a| a.attempted()).cloned().collect();
            if !retry.is_empty() {
                tracing::info!("Resubmitting {} failed actions to {}", retry.len(), self.target);
                for action in &retry {
                    action.reset_attempt();
                }
                coordinator.enqueue_to_member(&self.target, retry).await;
            }
        }

        SyncOutcome::Converged {
            actions: total,
            rounds,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::*;
    use crate::action::{ColumnDef, Value};
    use crate::member::{InMemoryMember, MemberSettings};

    /// Coordinator that records what the synchronization asks of it. Queued
    /// actions are applied immediately by `apply`, or left pending.
    struct Recorder {
        template: Arc<InMemoryMember>,
        target: Arc<InMemoryMember>,
        tables: Vec<TableDescriptor>,
        members: usize,
        apply: bool,
        /// Actions stuck on the template's queue
        template_backlog: usize,
        lock: Arc<Mutex<()>>,
        enqueued: Mutex<Vec<Action>>,
        releases: AtomicUsize,
        reported: AtomicUsize,
    }

    impl Recorder {
        fn new(template: InMemoryMember, target: InMemoryMember, tables: Vec<TableDescriptor>) -> Self {
            Self {
                template: Arc::new(template),
                target: Arc::new(target),
                tables,
                members: 2,
                apply: true,
                template_backlog: 0,
                lock: Arc::new(Mutex::new(())),
                enqueued: Mutex::new(Vec::new()),
                releases: AtomicUsize::new(0),
                reported: AtomicUsize::new(0),
            }
        }

        async fn labels(&self) -> Vec<String> {
            self.enqueued.lock().await.iter().map(|a| a.label().to_string()).collect()
        }
    }

    #[async_trait]
    impl Coordinator for Recorder {
        fn cluster_label(&self) -> &str {
            "test"
        }

        async fn member_count(&self) -> usize {
            self.members
        }

        async fn member(&self, label: &str) -> Option<Arc<dyn Member>> {
            match label {
                l if l == self.target.label() => Some(self.target.clone() as Arc<dyn Member>),
                l if l == self.template.label() => Some(self.template.clone() as Arc<dyn Member>),
                _ => None,
            }
        }

        async fn acquire_template(&self) -> Result<TemplateLease> {
            let guard = Arc::clone(&self.lock).lock_owned().await;
            Ok(TemplateLease::new(self.template.clone(), guard))
        }

        async fn release_template(&self, lease: TemplateLease) {
            self.releases.fetch_add(1, Ordering::SeqCst);
            drop(lease);
        }

        async fn tracked_tables(&self) -> Vec<TableDescriptor> {
            self.tables.clone()
        }

        async fn enqueue_to_member(&self, _member: &str, actions: Vec<Action>) {
            for action in actions {
                if self.apply {
                    if self.target.execute_action(&action).await.is_ok() {
                        action.mark_succeeded();
                    }
                    action.mark_attempted();
                }
                self.enqueued.lock().await.push(action);
            }
        }

        async fn wait_until_synchronized(&self, member: &str, _timeout: Duration) -> bool {
            self.pending_actions(member).await == 0
        }

        async fn pending_actions(&self, member: &str) -> usize {
            if member == self.template.label() {
                self.template_backlog
            } else {
                0
            }
        }

        async fn report_synchronized(&self, _template: &str, _target: &str) {
            self.reported.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config() -> SyncConfig {
        SyncConfig {
            poll_interval_ms: 10,
            max_rounds: 5,
        }
    }

    fn table(name: &str) -> TableDescriptor {
        TableDescriptor::new(
            name,
            vec![
                ColumnDef::new("id", "int").primary(),
                ColumnDef::new("name", "varchar(32)"),
            ],
        )
    }

    async fn seeded_template(tables: &[TableDescriptor]) -> InMemoryMember {
        let template = InMemoryMember::new("db-1");
        for t in tables {
            template.create_table(t, false).await.unwrap();
            template
                .bulk_insert(
                    t,
                    &[
                        vec![Value::Int(1), Value::String("a".into())],
                        vec![Value::Int(2), Value::String("b".into())],
                    ],
                )
                .await
                .unwrap();
        }
        template
    }

    #[tokio::test]
    async fn test_copies_tables_and_converges() {
        let tables = vec![table("users"), table("orders")];
        let template = seeded_template(&tables).await;
        let target = InMemoryMember::new("db-2");
        target.create_table(&table("users"), false).await.unwrap();

        let coord = Recorder::new(template, target, tables);
        let outcome = SynchronizationAction::new("db-2", &config())
            .execute(&coord)
            .await
            .unwrap();

        assert_eq!(outcome, SyncOutcome::Converged { actions: 5, rounds: 1 });
        assert_eq!(
            coord.labels().await,
            vec![
                "sync db-2: drop users",
                "sync db-2: create users",
                "sync db-2: copy users",
                "sync db-2: create orders",
                "sync db-2: copy orders",
            ]
        );
        assert_eq!(coord.target.scan("orders").await.unwrap().len(), 2);
        assert_eq!(coord.releases.load(Ordering::SeqCst), 1);
        assert_eq!(coord.reported.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_single_member_is_trivial() {
        let tables = vec![table("users")];
        let template = seeded_template(&tables).await;
        let mut coord = Recorder::new(template, InMemoryMember::new("db-2"), tables);
        coord.members = 1;
        let before = coord.template.table_operations();

        let outcome = SynchronizationAction::new("db-1", &config())
            .execute(&coord)
            .await
            .unwrap();

        assert_eq!(outcome, SyncOutcome::Trivial);
        assert_eq!(coord.template.table_operations(), before);
        assert!(coord.enqueued.lock().await.is_empty());
        assert_eq!(coord.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_same_connection_copies_nothing() {
        let shared = MemberSettings {
            host: "db.internal".into(),
            port: 3306,
            user: "a".into(),
            database: "app".into(),
        };
        let coord = Recorder::new(
            InMemoryMember::with_settings("db-1", shared.clone()),
            InMemoryMember::with_settings("db-2", shared),
            vec![table("users")],
        );

        let outcome = SynchronizationAction::new("db-2", &config())
            .execute(&coord)
            .await
            .unwrap();

        assert_eq!(outcome, SyncOutcome::Converged { actions: 0, rounds: 0 });
        assert!(coord.enqueued.lock().await.is_empty());
        assert_eq!(coord.reported.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_count_failure_skips_only_that_table() {
        let tables = vec![table("broken"), table("healthy")];
        let template = seeded_template(&tables).await;
        template.fail_count_for("broken").await;

        let coord = Recorder::new(template, InMemoryMember::new("db-2"), tables);
        let outcome = SynchronizationAction::new("db-2", &config())
            .execute(&coord)
            .await
            .unwrap();

        assert!(outcome.is_success());
        assert_eq!(
            coord.labels().await,
            vec!["sync db-2: create healthy", "sync db-2: copy healthy"]
        );
        assert!(coord.target.scan("broken").await.is_none());
        assert_eq!(coord.target.scan("healthy").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_structure() {
        let tables = vec![table("users")];
        let template = seeded_template(&tables).await;
        template.fail_fetch_for("users").await;

        let coord = Recorder::new(template, InMemoryMember::new("db-2"), tables);
        SynchronizationAction::new("db-2", &config())
            .execute(&coord)
            .await
            .unwrap();

        assert_eq!(coord.labels().await, vec!["sync db-2: create users"]);
        assert_eq!(coord.target.scan("users").await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_tables_missing_on_template_are_skipped() {
        let template = seeded_template(&[table("users")]).await;
        let coord = Recorder::new(
            template,
            InMemoryMember::new("db-2"),
            vec![table("ghost"), table("users")],
        );
        SynchronizationAction::new("db-2", &config())
            .execute(&coord)
            .await
            .unwrap();

        assert!(coord.labels().await.iter().all(|l| !l.contains("ghost")));
    }

    #[tokio::test]
    async fn test_no_progress_reports_not_converged() {
        let tables = vec![table("users")];
        let template = seeded_template(&tables).await;
        let mut coord = Recorder::new(template, InMemoryMember::new("db-2"), tables);
        coord.apply = false;

        let outcome = SynchronizationAction::new("db-2", &config())
            .execute(&coord)
            .await
            .unwrap();

        assert_eq!(outcome, SyncOutcome::NotConverged { pending: 2, rounds: 1 });
        assert_eq!(coord.reported.load(Ordering::SeqCst), 0);
        assert_eq!(coord.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stuck_template_is_not_copied() {
        let tables = vec![table("users")];
        let template = seeded_template(&tables).await;
        let mut coord = Recorder::new(template, InMemoryMember::new("db-2"), tables);
        coord.template_backlog = 3;

        let outcome = SynchronizationAction::new("db-2", &config())
            .execute(&coord)
            .await
            .unwrap();

        assert_eq!(outcome, SyncOutcome::NotConverged { pending: 3, rounds: 5 });
        assert!(coord.enqueued.lock().await.is_empty());
        assert_eq!(coord.reported.load(Ordering::SeqCst), 0);
        assert_eq!(coord.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lock_released_when_target_unknown() {
        let tables = vec![table("users")];
        let template = seeded_template(&tables).await;
        let coord = Recorder::new(template, InMemoryMember::new("db-2"), tables);

        let result = SynchronizationAction::new("db-9", &config()).execute(&coord).await;
        assert!(matches!(result, Err(Error::MemberNotFound(_))));
        assert_eq!(coord.releases.load(Ordering::SeqCst), 1);
        assert!(coord.lock.try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_synchronizations_serialize() {
        let tables = vec![table("users")];
        let template = seeded_template(&tables).await;
        let coord = Arc::new(Recorder::new(template, InMemoryMember::new("db-2"), tables));

        let lease = coord.acquire_template().await.unwrap();
        let blocked = {
            let coord = coord.clone();
            tokio::spawn(async move {
                SynchronizationAction::new("db-2", &config()).execute(coord.as_ref()).await
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!blocked.is_finished());
        assert!(coord.enqueued.lock().await.is_empty());

        coord.release_template(lease).await;
        let outcome = blocked.await.unwrap().unwrap();
        assert!(outcome.is_success());
    }
}
