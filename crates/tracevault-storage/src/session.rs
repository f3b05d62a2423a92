use std::ops::Bound;

use thiserror::Error;

/// Errors raised by the database session itself. The engine wraps these into
/// its own [`StorageError`](tracevault_core::error::StorageError) taxonomy.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to open session: {0}")]
    Open(String),
    #[error("unconfigured table {0}")]
    UnconfiguredTable(String),
    #[error("statement not allowed in a batch: {0}")]
    InvalidBatch(String),
    #[error("storage I/O error: {0}")]
    Io(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

pub type KeyRange = (Bound<Vec<u8>>, Bound<Vec<u8>>);

/// The closed set of statements a session understands.
///
/// Keys are ordered byte strings, so a table behaves like a wide-column
/// partition: a shared prefix selects a partition and the remaining bytes are
/// clustering columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// Create the table if absent. Never touches existing rows. Tables with
    /// `large_values` keep values out of the key index.
    CreateTable {
        table: &'static str,
        large_values: bool,
    },
    /// Drop the table and all its rows if present.
    DropTable { table: &'static str },
    /// One empty row if the table exists, none otherwise.
    TableExists { table: &'static str },
    /// Insert or overwrite.
    Upsert {
        table: &'static str,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Get { table: &'static str, key: Vec<u8> },
    Select {
        table: &'static str,
        range: KeyRange,
        order: Order,
        limit: Option<usize>,
    },
}

impl Statement {
    pub fn upsert(table: &'static str, key: Vec<u8>, value: Vec<u8>) -> Self {
        Self::Upsert { table, key, value }
    }

    pub fn select(table: &'static str, range: KeyRange, order: Order) -> Self {
        Self::Select {
            table,
            range,
            order,
            limit: None,
        }
    }

    pub fn select_limit(
        table: &'static str,
        range: KeyRange,
        order: Order,
        limit: usize,
    ) -> Self {
        Self::Select {
            table,
            range,
            order,
            limit: Some(limit),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// A process-wide connection to the backing database.
///
/// Opened once at startup and shared by every component. Connection pooling
/// and wire-level retries, if any, belong to the implementation.
pub trait Session: Send + Sync {
    fn execute(&self, keyspace: &str, statement: Statement) -> Result<Vec<Row>, SessionError>;

    /// Apply several upserts as one write. Other statement kinds are rejected.
    fn execute_batch(&self, keyspace: &str, statements: Vec<Statement>)
    -> Result<(), SessionError>;

    /// Block until every acknowledged write is durable.
    fn persist(&self) -> Result<(), SessionError>;
}
