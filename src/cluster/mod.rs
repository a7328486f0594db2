//! Cluster Coordination
//!
//! The [`Coordinator`] trait is everything a synchronization needs from the
//! cluster: the template and its exclusive lease, the tracked tables, and a
//! path into each member's queue. [`ClusterCoordinator`] is the in-process
//! implementation that also owns member status and the event loop.

mod coordinator;

pub use coordinator::{ClusterCoordinator, ClusterSummary, MemberSummary};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedMutexGuard, OwnedRwLockWriteGuard};

use crate::action::{Action, TableDescriptor};
use crate::error::Result;
use crate::member::Member;

/// Replication status of a member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    /// Registered and being bootstrapped from the template
    Synchronizing,
    /// Up to date and receiving writes
    Active,
    /// An action failed; excluded from writes until recovered
    Quarantined,
    /// Left the cluster
    Removed,
}

impl std::fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberStatus::Synchronizing => write!(f, "SYNCHRONIZING"),
            MemberStatus::Active => write!(f, "ACTIVE"),
            MemberStatus::Quarantined => write!(f, "QUARANTINED"),
            MemberStatus::Removed => write!(f, "REMOVED"),
        }
    }
}

/// Exclusive hold on the template member.
///
/// Only one lease exists at a time. Dropping the lease releases it, so the
/// template is freed on every exit path of its holder.
pub struct TemplateLease {
    member: Arc<dyn Member>,
    _exclusive: OwnedMutexGuard<()>,
    _writes: Option<OwnedRwLockWriteGuard<()>>,
}

impl TemplateLease {
    pub fn new(member: Arc<dyn Member>, exclusive: OwnedMutexGuard<()>) -> Self {
        Self {
            member,
            _exclusive: exclusive,
            _writes: None,
        }
    }

    /// Also hold off replicated writes for as long as the lease lives
    pub fn holding_writes(mut self, writes: OwnedRwLockWriteGuard<()>) -> Self {
        self._writes = Some(writes);
        self
    }

    pub fn member(&self) -> &Arc<dyn Member> {
        &self.member
    }

    pub fn label(&self) -> &str {
        self.member.label()
    }
}

impl std::fmt::Debug for TemplateLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateLease")
            .field("template", &self.label())
            .field("holding_writes", &self._writes.is_some())
            .finish()
    }
}

/// Cluster services used by a synchronization
#[async_trait]
pub trait Coordinator: Send + Sync {
    fn cluster_label(&self) -> &str;

    async fn member_count(&self) -> usize;

    async fn member(&self, label: &str) -> Option<Arc<dyn Member>>;

    /// Wait for exclusive use of the template
    async fn acquire_template(&self) -> Result<TemplateLease>;

    async fn release_template(&self, lease: TemplateLease);

    /// Tables copied when bootstrapping a member, in a stable order
    async fn tracked_tables(&self) -> Vec<TableDescriptor>;

    /// Append actions to one member's queue, in order
    async fn enqueue_to_member(&self, member: &str, actions: Vec<Action>);

    /// Wait up to `timeout` for a member's queue to drain. Returns true if
    /// nothing is pending.
    async fn wait_until_synchronized(&self, member: &str, timeout: Duration) -> bool;

    /// Actions queued or being applied on a member
    async fn pending_actions(&self, member: &str) -> usize;

    async fn report_synchronized(&self, template: &str, target: &str);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::InMemoryMember;
    use tokio::sync::{Mutex, RwLock};

    #[tokio::test]
    async fn test_dropping_lease_releases_locks() {
        let lock = Arc::new(Mutex::new(()));
        let gate = Arc::new(RwLock::new(()));
        let member: Arc<dyn Member> = Arc::new(InMemoryMember::new("db-1"));

        let lease = TemplateLease::new(member, Arc::clone(&lock).lock_owned().await)
            .holding_writes(Arc::clone(&gate).write_owned().await);
        assert_eq!(lease.label(), "db-1");
        assert!(lock.try_lock().is_err());
        assert!(gate.try_read().is_err());

        drop(lease);
        assert!(lock.try_lock().is_ok());
        assert!(gate.try_read().is_ok());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(MemberStatus::Quarantined.to_string(), "QUARANTINED");
        assert_eq!(MemberStatus::Active.to_string(), "ACTIVE");
    }
}
