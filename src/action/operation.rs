//! Replayable operations and the table descriptors they refer to

use serde::{Deserialize, Serialize};

use super::value::{Row, Value};

/// Column definition of a tracked table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    /// SQL type as reported by the backend (e.g. `int(11)`, `varchar(64)`)
    pub data_type: String,
    pub nullable: bool,
    pub primary_key: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            primary_key: false,
        }
    }

    /// Mark the column as (part of) the primary key
    pub fn primary(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Descriptor of a table subject to replication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

impl TableDescriptor {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    /// Column names in declaration order
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Position of a column, if the table has it
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Render the CREATE TABLE statement for this descriptor
    pub fn create_sql(&self, if_not_exists: bool) -> String {
        let mut defs: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                format!(
                    "`{}` {}{}",
                    c.name,
                    c.data_type,
                    if c.nullable { "" } else { " NOT NULL" }
                )
            })
            .collect();

        let pk: Vec<String> = self
            .columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| format!("`{}`", c.name))
            .collect();
        if !pk.is_empty() {
            defs.push(format!("PRIMARY KEY ({})", pk.join(", ")));
        }

        format!(
            "CREATE TABLE {}`{}` ({})",
            if if_not_exists { "IF NOT EXISTS " } else { "" },
            self.name,
            defs.join(", ")
        )
    }
}

/// A single mutating operation that can be replayed against any member
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Operation {
    /// CREATE TABLE
    CreateTable {
        table: TableDescriptor,
        if_not_exists: bool,
    },

    /// DROP TABLE IF EXISTS
    DropTable {
        table: TableDescriptor,
    },

    /// Insert a single row
    Insert {
        table: String,
        columns: Vec<String>,
        values: Vec<Value>,
    },

    /// Update rows matching a key
    Update {
        table: String,
        set_columns: Vec<String>,
        set_values: Vec<Value>,
        key_columns: Vec<String>,
        key_values: Vec<Value>,
    },

    /// Delete rows matching a key
    Delete {
        table: String,
        key_columns: Vec<String>,
        key_values: Vec<Value>,
    },

    /// Bulk insert full rows, ordered like the descriptor's columns
    BulkInsert {
        table: TableDescriptor,
        rows: Vec<Row>,
    },

    /// Raw SQL (for statements that don't fit other categories)
    RawSql {
        sql: String,
        affects_table: Option<String>,
    },
}

impl Operation {
    /// Get the table name affected by this operation (if known)
    pub fn table_name(&self) -> Option<&str> {
        match self {
            Operation::CreateTable { table, .. }
            | Operation::DropTable { table }
            | Operation::BulkInsert { table, .. } => Some(&table.name),
            Operation::Insert { table, .. }
            | Operation::Update { table, .. }
            | Operation::Delete { table, .. } => Some(table),
            Operation::RawSql { affects_table, .. } => affects_table.as_deref(),
        }
    }

    /// Check if this is a DDL (schema change) operation
    pub fn is_ddl(&self) -> bool {
        matches!(
            self,
            Operation::CreateTable { .. } | Operation::DropTable { .. }
        )
    }

    /// Short name of the operation kind, for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::CreateTable { .. } => "create-table",
            Operation::DropTable { .. } => "drop-table",
            Operation::Insert { .. } => "insert",
            Operation::Update { .. } => "update",
            Operation::Delete { .. } => "delete",
            Operation::BulkInsert { .. } => "bulk-insert",
            Operation::RawSql { .. } => "raw-sql",
        }
    }

    /// Convert to SQL statement(s)
    pub fn to_sql(&self) -> Vec<String> {
        match self {
            Operation::CreateTable {
                table,
                if_not_exists,
            } => vec![table.create_sql(*if_not_exists)],

            Operation::DropTable { table } => {
                vec![format!("DROP TABLE IF EXISTS `{}`", table.name)]
            }

            Operation::Insert {
                table,
                columns,
                values,
            } => vec![format!(
                "INSERT INTO `{}` ({}) VALUES ({})",
                table,
                quote_columns(columns),
                join_values(values)
            )],

            Operation::Update {
                table,
                set_columns,
                set_values,
                key_columns,
                key_values,
            } => {
                let sets: Vec<String> = set_columns
                    .iter()
                    .zip(set_values.iter())
                    .map(|(col, val)| format!("`{}` = {}", col, val.to_sql()))
                    .collect();
                vec![format!(
                    "UPDATE `{}` SET {} WHERE {}",
                    table,
                    sets.join(", "),
                    where_clause(key_columns, key_values)
                )]
            }

            Operation::Delete {
                table,
                key_columns,
                key_values,
            } => vec![format!(
                "DELETE FROM `{}` WHERE {}",
                table,
                where_clause(key_columns, key_values)
            )],

            Operation::BulkInsert { table, rows } => {
                if rows.is_empty() {
                    return vec![];
                }
                let row_values: Vec<String> = rows
                    .iter()
                    .map(|row| format!("({})", join_values(row)))
                    .collect();
                vec![format!(
                    "INSERT INTO `{}` ({}) VALUES {}",
                    table.name,
                    quote_columns(&table.column_names()),
                    row_values.join(", ")
                )]
            }

            Operation::RawSql { sql, .. } => vec![sql.clone()],
        }
    }
}

fn quote_columns(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| format!("`{}`", c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn join_values(values: &[Value]) -> String {
    values
        .iter()
        .map(|v| v.to_sql())
        .collect::<Vec<_>>()
        .join(", ")
}

fn where_clause(key_columns: &[String], key_values: &[Value]) -> String {
    key_columns
        .iter()
        .zip(key_values.iter())
        .map(|(col, val)| match val {
            Value::Null => format!("`{}` IS NULL", col),
            _ => format!("`{}` = {}", col, val.to_sql()),
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}
