//! Cluster Members
//!
//! The narrow capability the replication core needs from a database
//! backend: apply one action, and the handful of table operations used to
//! bootstrap a new member from the template.

mod mariadb;
mod memory;

pub use mariadb::{ColumnInfo, MariaDbMember};
pub use memory::InMemoryMember;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::action::{Action, Row, TableDescriptor};
use crate::error::Result;

/// Connection settings used to decide whether two members are the same
/// physical database. Credentials and pool sizing are deliberately absent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub database: String,
}

impl MemberSettings {
    /// Whether both settings point at the same database
    pub fn same_connection(&self, other: &MemberSettings) -> bool {
        self.host.eq_ignore_ascii_case(&other.host)
            && self.port == other.port
            && self.database == other.database
    }
}

impl std::fmt::Display for MemberSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}/{}", self.user, self.host, self.port, self.database)
    }
}

/// One database participating in replication
#[async_trait]
pub trait Member: Send + Sync {
    /// Unique label of this member within the cluster
    fn label(&self) -> &str;

    /// Connection settings, for identity comparison
    fn settings(&self) -> &MemberSettings;

    /// Apply one action. Fails with a storage error, or with
    /// `Error::MemberUnavailable` when the database cannot be reached.
    async fn execute_action(&self, action: &Action) -> Result<()>;

    async fn table_exists(&self, table: &TableDescriptor) -> Result<bool>;

    async fn create_table(&self, table: &TableDescriptor, if_not_exists: bool) -> Result<()>;

    async fn drop_table_if_exists(&self, table: &TableDescriptor) -> Result<()>;

    async fn count_rows(&self, table: &TableDescriptor) -> Result<u64>;

    /// All rows of a table, ordered like the descriptor's columns
    async fn fetch_all_rows(&self, table: &TableDescriptor) -> Result<Vec<Row>>;

    async fn bulk_insert(&self, table: &TableDescriptor, rows: &[Row]) -> Result<()>;

    /// Check if the member answers at all
    async fn health_check(&self) -> Result<bool>;
}
