//! MariaDB Member
//!
//! Applies actions to a MariaDB database and exposes the table operations
//! used when bootstrapping another member from it.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySqlPool, Row as _};

use super::{Member, MemberSettings};
use crate::action::{Action, ColumnDef, Operation, Row, TableDescriptor, Value};
use crate::config::MemberConfig;
use crate::error::{Error, Result};

/// Rows per INSERT statement when copying a table
const BULK_INSERT_CHUNK: usize = 500;

/// MariaDB-backed cluster member
pub struct MariaDbMember {
    label: String,
    settings: MemberSettings,
    pool: MySqlPool,
}

impl MariaDbMember {
    /// Connect to the database described by the member configuration
    pub async fn connect(config: &MemberConfig) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url())
            .await
            .map_err(|e| Error::MemberUnavailable(format!("{}: {}", config.label, e)))?;

        tracing::info!("Connected to member {} ({})", config.label, config.settings());

        Ok(Self {
            label: config.label.clone(),
            settings: config.settings(),
            pool,
        })
    }

    fn map_err(&self, e: sqlx::Error) -> Error {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Error::MemberUnavailable(format!("{}: {}", self.label, e))
            }
            other => Error::storage(&self.label, other),
        }
    }

    async fn execute_sql(&self, sql: &str) -> Result<u64> {
        tracing::debug!("{}: executing {}", self.label, preview(sql));
        let result = sqlx::query(sql)
            .execute(&self.pool)
            .await
            .map_err(|e| self.map_err(e))?;
        Ok(result.rows_affected())
    }

    /// Get table structure (columns and types)
    pub async fn describe_table(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let rows = sqlx::query(&format!("DESCRIBE `{}`", table))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| self.map_err(e))?;

        let columns: Vec<ColumnInfo> = rows
            .iter()
            .filter_map(|row| {
                Some(ColumnInfo {
                    name: row.try_get("Field").ok()?,
                    data_type: row.try_get("Type").ok()?,
                    nullable: row.try_get::<String, _>("Null").ok()? == "YES",
                    key: row.try_get("Key").ok().unwrap_or_default(),
                })
            })
            .collect();

        Ok(columns)
    }

    /// Build a table descriptor from the live table definition
    pub async fn table_descriptor(&self, table: &str) -> Result<TableDescriptor> {
        let columns = self.describe_table(table).await?;
        if columns.is_empty() {
            return Err(Error::TableNotFound(table.to_string()));
        }

        Ok(TableDescriptor::new(
            table,
            columns
                .into_iter()
                .map(|c| ColumnDef {
                    primary_key: c.key == "PRI",
                    name: c.name,
                    data_type: c.data_type,
                    nullable: c.nullable,
                })
                .collect(),
        ))
    }
}

#[async_trait]
impl Member for MariaDbMember {
    fn label(&self) -> &str {
        &self.label
    }

    fn settings(&self) -> &MemberSettings {
        &self.settings
    }

    async fn execute_action(&self, action: &Action) -> Result<()> {
        // A table copy can exceed max_allowed_packet as one statement
        if let Operation::BulkInsert { table, rows } = action.operation() {
            return self.bulk_insert(table, rows).await;
        }

        for sql in action.operation().to_sql() {
            // sqlx doesn't support multi-statement queries
            for stmt in split_sql_statements(&sql) {
                self.execute_sql(stmt).await?;
            }
        }
        Ok(())
    }

    async fn table_exists(&self, table: &TableDescriptor) -> Result<bool> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM information_schema.tables \
             WHERE table_schema = DATABASE() AND table_name = ?",
        )
        .bind(&table.name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| self.map_err(e))?;

        Ok(row.0 > 0)
    }

    async fn create_table(&self, table: &TableDescriptor, if_not_exists: bool) -> Result<()> {
        self.execute_sql(&table.create_sql(if_not_exists)).await?;
        Ok(())
    }

    async fn drop_table_if_exists(&self, table: &TableDescriptor) -> Result<()> {
        self.execute_sql(&format!("DROP TABLE IF EXISTS `{}`", table.name)).await?;
        Ok(())
    }

    async fn count_rows(&self, table: &TableDescriptor) -> Result<u64> {
        let row: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM `{}`", table.name))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| self.map_err(e))?;

        Ok(row.0 as u64)
    }

    /// Values travel in their textual form (binary columns as hex) and
    /// MariaDB converts them back to the column type on insert.
    async fn fetch_all_rows(&self, table: &TableDescriptor) -> Result<Vec<Row>> {
        let projection: Vec<String> = table
            .columns
            .iter()
            .map(|c| {
                if is_binary(&c.data_type) {
                    format!("HEX(`{}`)", c.name)
                } else {
                    format!("CAST(`{}` AS CHAR)", c.name)
                }
            })
            .collect();

        let rows = sqlx::query(&format!(
            "SELECT {} FROM `{}`",
            projection.join(", "),
            table.name
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| self.map_err(e))?;

        rows.iter()
            .map(|row| {
                table
                    .columns
                    .iter()
                    .enumerate()
                    .map(|(i, column)| {
                        let text: Option<String> =
                            row.try_get(i).map_err(|e| self.map_err(e))?;
                        Ok(match text {
                            None => Value::Null,
                            Some(hex) if is_binary(&column.data_type) => {
                                Value::Bytes(decode_hex(&hex).ok_or_else(|| {
                                    Error::storage(&self.label, format!("bad hex in {}", column.name))
                                })?)
                            }
                            Some(s) => Value::String(s),
                        })
                    })
                    .collect::<Result<Row>>()
            })
            .collect()
    }

    async fn bulk_insert(&self, table: &TableDescriptor, rows: &[Row]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| self.map_err(e))?;

        for sql in chunked_inserts(table, rows) {
            sqlx::query(&sql)
                .execute(&mut *tx)
                .await
                .map_err(|e| self.map_err(e))?;
        }

        tx.commit().await.map_err(|e| self.map_err(e))?;
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        let result: (i32,) = sqlx::query_as("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| self.map_err(e))?;

        Ok(result.0 == 1)
    }
}

/// Column information
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub key: String,
}

fn is_binary(data_type: &str) -> bool {
    let lower = data_type.to_ascii_lowercase();
    lower.contains("blob") || lower.contains("binary")
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

/// One INSERT statement per `BULK_INSERT_CHUNK` rows
fn chunked_inserts(table: &TableDescriptor, rows: &[Row]) -> Vec<String> {
    rows.chunks(BULK_INSERT_CHUNK)
        .flat_map(|chunk| {
            Operation::BulkInsert {
                table: table.clone(),
                rows: chunk.to_vec(),
            }
            .to_sql()
        })
        .collect()
}

fn preview(sql: &str) -> &str {
    match sql.char_indices().nth(100) {
        Some((idx, _)) => &sql[..idx],
        None => sql,
    }
}

/// Split SQL string on semicolons, respecting string literals
/// This handles cases like: "USE db; CREATE TABLE foo (name VARCHAR(50));"
fn split_sql_statements(sql: &str) -> Vec<&str> {
    let mut statements = Vec::new();
    let mut start = 0;
    let mut in_string = false;
    let mut string_char = '"';
    let mut chars = sql.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if in_string {
            if c == string_char {
                // Doubled quote is an escaped quote
                if chars.peek().map(|(_, nc)| *nc == string_char).unwrap_or(false) {
                    chars.next();
                } else {
                    in_string = false;
                }
            }
        } else {
            match c {
                '\'' | '"' => {
                    in_string = true;
                    string_char = c;
                }
                ';' => {
                    let stmt = sql[start..i].trim();
                    if !stmt.is_empty() {
                        statements.push(stmt);
                    }
                    start = i + 1;
                }
                _ => {}
            }
        }
    }

    let remaining = sql[start..].trim();
    if !remaining.is_empty() {
        statements.push(remaining);
    }

    statements
}
