//! In-memory member
//!
//! A process-local member that interprets operations structurally. Used for
//! tests and dry runs; supports failure injection and records the order in
//! which actions were applied.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Member, MemberSettings};
use crate::action::{Action, Operation, Row, TableDescriptor, Value};
use crate::error::{Error, Result};

struct MemTable {
    descriptor: TableDescriptor,
    rows: Vec<Row>,
}

#[derive(Default)]
struct Faults {
    failing_tables: HashSet<String>,
    failing_counts: HashSet<String>,
    failing_fetches: HashSet<String>,
}

/// In-memory cluster member
pub struct InMemoryMember {
    label: String,
    settings: MemberSettings,
    tables: Mutex<HashMap<String, MemTable>>,
    faults: Mutex<Faults>,
    available: AtomicBool,
    apply_delay: Duration,
    applied: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    table_ops: AtomicUsize,
}

impl InMemoryMember {
    /// Create an empty member whose identity is its label
    pub fn new(label: impl Into<String>) -> Self {
        let label = label.into();
        let settings = MemberSettings {
            host: "memory".to_string(),
            port: 0,
            user: String::new(),
            database: label.clone(),
        };
        Self::with_settings(label, settings)
    }

    /// Create an empty member with explicit connection settings
    pub fn with_settings(label: impl Into<String>, settings: MemberSettings) -> Self {
        Self {
            label: label.into(),
            settings,
            tables: Mutex::new(HashMap::new()),
            faults: Mutex::new(Faults::default()),
            available: AtomicBool::new(true),
            apply_delay: Duration::ZERO,
            applied: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            table_ops: AtomicUsize::new(0),
        }
    }

    /// Hold every action for `delay` while applying it
    pub fn with_apply_delay(mut self, delay: Duration) -> Self {
        self.apply_delay = delay;
        self
    }

    /// Make every action touching `table` fail with a storage error
    pub async fn fail_on_table(&self, table: &str) {
        self.faults.lock().await.failing_tables.insert(table.to_string());
    }

    /// Stop failing actions on `table`
    pub async fn heal_table(&self, table: &str) {
        self.faults.lock().await.failing_tables.remove(table);
    }

    /// Make `count_rows` fail for `table`
    pub async fn fail_count_for(&self, table: &str) {
        self.faults.lock().await.failing_counts.insert(table.to_string());
    }

    /// Make `fetch_all_rows` fail for `table`
    pub async fn fail_fetch_for(&self, table: &str) {
        self.faults.lock().await.failing_fetches.insert(table.to_string());
    }

    /// Simulate the database going away (or coming back)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Labels of successfully applied actions, in application order
    pub async fn applied(&self) -> Vec<String> {
        self.applied.lock().await.clone()
    }

    /// Highest number of actions that were ever applied concurrently
    pub fn max_concurrent_applies(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Actions being applied right now
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Number of direct table operations (existence, count, fetch, DDL, bulk copy) served
    pub fn table_operations(&self) -> usize {
        self.table_ops.load(Ordering::SeqCst)
    }

    /// Scan a table, rows in insertion order
    pub async fn scan(&self, table: &str) -> Option<Vec<Row>> {
        self.tables.lock().await.get(table).map(|t| t.rows.clone())
    }

    /// Names of all tables
    pub async fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::MemberUnavailable(self.label.clone()))
        }
    }

    async fn check_table_fault(&self, table: Option<&str>) -> Result<()> {
        if let Some(table) = table {
            if self.faults.lock().await.failing_tables.contains(table) {
                return Err(Error::storage(&self.label, format!("injected failure on {}", table)));
            }
        }
        Ok(())
    }

    async fn apply(&self, op: &Operation) -> Result<()> {
        match op {
            Operation::CreateTable {
                table,
                if_not_exists,
            } => self.create(table, *if_not_exists).await,
            Operation::DropTable { table } => self.drop_table(&table.name).await,
            Operation::BulkInsert { table, rows } => self.insert_rows(&table.name, rows).await,
            Operation::Insert {
                table,
                columns,
                values,
            } => {
                let mut tables = self.tables.lock().await;
                let t = self.table_mut(&mut tables, table)?;
                let mut row = vec![Value::Null; t.descriptor.columns.len()];
                for (column, value) in columns.iter().zip(values.iter()) {
                    let idx = self.column(t, column)?;
                    row[idx] = value.clone();
                }
                t.rows.push(row);
                Ok(())
            }
            Operation::Update {
                table,
                set_columns,
                set_values,
                key_columns,
                key_values,
            } => {
                let mut tables = self.tables.lock().await;
                let t = self.table_mut(&mut tables, table)?;
                let keys = self.key_positions(t, key_columns)?;
                let sets = set_columns
                    .iter()
                    .map(|c| self.column(t, c))
                    .collect::<Result<Vec<usize>>>()?;
                for row in t.rows.iter_mut() {
                    if matches_key(row, &keys, key_values) {
                        for (idx, value) in sets.iter().zip(set_values.iter()) {
                            row[*idx] = value.clone();
                        }
                    }
                }
                Ok(())
            }
            Operation::Delete {
                table,
                key_columns,
                key_values,
            } => {
                let mut tables = self.tables.lock().await;
                let t = self.table_mut(&mut tables, table)?;
                let keys = self.key_positions(t, key_columns)?;
                t.rows.retain(|row| !matches_key(row, &keys, key_values));
                Ok(())
            }
            Operation::RawSql { .. } => Err(Error::UnsupportedOperation {
                member: self.label.clone(),
                operation: op.kind().to_string(),
            }),
        }
    }

    async fn create(&self, table: &TableDescriptor, if_not_exists: bool) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if tables.contains_key(&table.name) {
            if if_not_exists {
                return Ok(());
            }
            return Err(Error::storage(
                &self.label,
                format!("table {} already exists", table.name),
            ));
        }
        tables.insert(
            table.name.clone(),
            MemTable {
                descriptor: table.clone(),
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        self.tables.lock().await.remove(table);
        Ok(())
    }

    async fn insert_rows(&self, table: &str, rows: &[Row]) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let t = self.table_mut(&mut tables, table)?;
        let width = t.descriptor.columns.len();
        if let Some(bad) = rows.iter().find(|r| r.len() != width) {
            return Err(Error::storage(
                &self.label,
                format!("row has {} values, {} expects {}", bad.len(), table, width),
            ));
        }
        t.rows.extend(rows.iter().cloned());
        Ok(())
    }

    fn table_mut<'a>(
        &self,
        tables: &'a mut HashMap<String, MemTable>,
        table: &str,
    ) -> Result<&'a mut MemTable> {
        tables
            .get_mut(table)
            .ok_or_else(|| Error::TableNotFound(format!("{}.{}", self.label, table)))
    }

    fn column(&self, table: &MemTable, column: &str) -> Result<usize> {
        table.descriptor.column_index(column).ok_or_else(|| {
            Error::storage(
                &self.label,
                format!("unknown column {}.{}", table.descriptor.name, column),
            )
        })
    }

    fn key_positions(&self, table: &MemTable, key_columns: &[String]) -> Result<Vec<usize>> {
        key_columns.iter().map(|c| self.column(table, c)).collect()
    }
}

fn matches_key(row: &Row, keys: &[usize], key_values: &[Value]) -> bool {
    keys.iter()
        .zip(key_values.iter())
        .all(|(idx, value)| row.get(*idx) == Some(value))
}

#[async_trait]
impl Member for InMemoryMember {
    fn label(&self) -> &str {
        &self.label
    }

    fn settings(&self) -> &MemberSettings {
        &self.settings
    }

    async fn execute_action(&self, action: &Action) -> Result<()> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let result = async {
            self.ensure_available()?;
            self.check_table_fault(action.operation().table_name()).await?;
            if !self.apply_delay.is_zero() {
                tokio::time::sleep(self.apply_delay).await;
            }
            self.apply(action.operation()).await
        }
        .await;

        if result.is_ok() {
            self.applied.lock().await.push(action.label().to_string());
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn table_exists(&self, table: &TableDescriptor) -> Result<bool> {
        self.ensure_available()?;
        self.table_ops.fetch_add(1, Ordering::SeqCst);
        Ok(self.tables.lock().await.contains_key(&table.name))
    }

    async fn create_table(&self, table: &TableDescriptor, if_not_exists: bool) -> Result<()> {
        self.ensure_available()?;
        self.table_ops.fetch_add(1, Ordering::SeqCst);
        self.create(table, if_not_exists).await
    }

    async fn drop_table_if_exists(&self, table: &TableDescriptor) -> Result<()> {
        self.ensure_available()?;
        self.table_ops.fetch_add(1, Ordering::SeqCst);
        self.drop_table(&table.name).await
    }

    async fn count_rows(&self, table: &TableDescriptor) -> Result<u64> {
        self.ensure_available()?;
        self.table_ops.fetch_add(1, Ordering::SeqCst);
        if self.faults.lock().await.failing_counts.contains(&table.name) {
            return Err(Error::storage(&self.label, format!("cannot count {}", table.name)));
        }
        let tables = self.tables.lock().await;
        tables
            .get(&table.name)
            .map(|t| t.rows.len() as u64)
            .ok_or_else(|| Error::TableNotFound(table.name.clone()))
    }

    async fn fetch_all_rows(&self, table: &TableDescriptor) -> Result<Vec<Row>> {
        self.ensure_available()?;
        self.table_ops.fetch_add(1, Ordering::SeqCst);
        if self.faults.lock().await.failing_fetches.contains(&table.name) {
            return Err(Error::storage(&self.label, format!("cannot read {}", table.name)));
        }
        self.scan(&table.name)
            .await
            .ok_or_else(|| Error::TableNotFound(table.name.clone()))
    }

    async fn bulk_insert(&self, table: &TableDescriptor, rows: &[Row]) -> Result<()> {
        self.ensure_available()?;
        self.table_ops.fetch_add(1, Ordering::SeqCst);
        self.insert_rows(&table.name, rows).await
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.available.load(Ordering::SeqCst))
    }
}
