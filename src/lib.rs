//! WolfSync - Action Replication for Database Clusters
//!
//! Keeps a set of database members in step by replaying every mutating
//! action through a bounded per-member queue, and bootstraps new or
//! recovered members by copying tracked tables from a template member.
//!
//! # Architecture
//!
//! Each member owns one [`queue::MemberQueue`] drained by exactly one
//! [`queue::MemberWorker`], so actions reach a member in the order they were
//! enqueued. The [`registry::QueueRegistry`] maps members to their queues and
//! the [`cluster::ClusterCoordinator`] decides who receives writes, who
//! serves as template and who is quarantined.
//!
//! # Features
//!
//! - Per-member FIFO queues with backpressure
//! - Quarantine of members whose actions fail
//! - Template-based bootstrap with convergence polling
//! - MariaDB members over sqlx, plus an in-memory member
//! - HTTP API for writes, status and member administration

pub mod config;
pub mod error;
pub mod action;
pub mod member;
pub mod queue;
pub mod registry;
pub mod sync;
pub mod cluster;
pub mod api;

pub use config::WolfSyncConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfSyncConfig;
    pub use crate::error::{Error, Result};
    pub use crate::action::{Action, Operation, TableDescriptor, Value};
    pub use crate::member::{Member, MemberSettings};
    pub use crate::queue::{MemberEvent, MemberQueue, MemberWorker};
    pub use crate::registry::QueueRegistry;
    pub use crate::sync::{SyncOutcome, SynchronizationAction};
    pub use crate::cluster::{ClusterCoordinator, Coordinator, MemberStatus};
}
