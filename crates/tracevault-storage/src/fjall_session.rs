use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use crate::session::{Order, Row, Session, SessionError, Statement};

/// [`Session`] over an embedded fjall database.
///
/// Each `keyspace.table` pair is one fjall partition named
/// `{keyspace}__{table}`. Statements against a partition that was never
/// created fail instead of creating it.
pub struct FjallSession {
    db: Keyspace,
}

impl FjallSession {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, SessionError> {
        let db = Config::new(path)
            .open()
            .map_err(|e| SessionError::Open(e.to_string()))?;
        Ok(Self { db })
    }

    fn partition_name(keyspace: &str, table: &str) -> String {
        format!("{keyspace}__{table}")
    }

    fn existing(&self, keyspace: &str, table: &str) -> Result<PartitionHandle, SessionError> {
        let name = Self::partition_name(keyspace, table);
        if !self.db.partition_exists(&name) {
            return Err(SessionError::UnconfiguredTable(format!("{keyspace}.{table}")));
        }
        self.db
            .open_partition(&name, PartitionCreateOptions::default())
            .map_err(|e| SessionError::Io(e.to_string()))
    }
}

fn io(e: fjall::Error) -> SessionError {
    SessionError::Io(e.to_string())
}

fn collect_rows<I, K, V>(iter: I, limit: usize) -> Result<Vec<Row>, SessionError>
where
    I: Iterator<Item = fjall::Result<(K, V)>>,
    K: std::ops::Deref<Target = [u8]>,
    V: std::ops::Deref<Target = [u8]>,
{
    let mut rows = Vec::new();
    for entry in iter.take(limit) {
        let (key, value) = entry.map_err(io)?;
        rows.push(Row {
            key: key.to_vec(),
            value: value.to_vec(),
        });
    }
    Ok(rows)
}

impl Session for FjallSession {
    fn execute(&self, keyspace: &str, statement: Statement) -> Result<Vec<Row>, SessionError> {
        match statement {
            Statement::CreateTable {
                table,
                large_values,
            } => {
                let opts = if large_values {
                    PartitionCreateOptions::default()
                        .with_kv_separation(fjall::KvSeparationOptions::default())
                } else {
                    PartitionCreateOptions::default()
                };
                self.db
                    .open_partition(&Self::partition_name(keyspace, table), opts)
                    .map_err(io)?;
                Ok(Vec::new())
            }
            Statement::DropTable { table } => {
                if self
                    .db
                    .partition_exists(&Self::partition_name(keyspace, table))
                {
                    let handle = self.existing(keyspace, table)?;
                    self.db.delete_partition(handle).map_err(io)?;
                }
                Ok(Vec::new())
            }
            Statement::TableExists { table } => {
                if self
                    .db
                    .partition_exists(&Self::partition_name(keyspace, table))
                {
                    Ok(vec![Row {
                        key: table.as_bytes().to_vec(),
                        value: Vec::new(),
                    }])
                } else {
                    Ok(Vec::new())
                }
            }
            Statement::Upsert { table, key, value } => {
                self.existing(keyspace, table)?
                    .insert(key, value)
                    .map_err(io)?;
                Ok(Vec::new())
            }
            Statement::Get { table, key } => {
                let Some(value) = self.existing(keyspace, table)?.get(&key).map_err(io)? else {
                    return Ok(Vec::new());
                };
                Ok(vec![Row {
                    key,
                    value: value.to_vec(),
                }])
            }
            Statement::Select {
                table,
                range,
                order,
                limit,
            } => {
                let partition = self.existing(keyspace, table)?;
                let iter = partition.range(range);
                let limit = limit.unwrap_or(usize::MAX);
                match order {
                    Order::Asc => collect_rows(iter, limit),
                    Order::Desc => collect_rows(iter.rev(), limit),
                }
            }
        }
    }

    fn execute_batch(
        &self,
        keyspace: &str,
        statements: Vec<Statement>,
    ) -> Result<(), SessionError> {
        let mut batch = self.db.batch();
        for statement in statements {
            match statement {
                Statement::Upsert { table, key, value } => {
                    let partition = self.existing(keyspace, table)?;
                    batch.insert(&partition, key, value);
                }
                other => return Err(SessionError::InvalidBatch(format!("{other:?}"))),
            }
        }
        batch.commit().map_err(io)
    }

    fn persist(&self) -> Result<(), SessionError> {
        self.db.persist(PersistMode::SyncAll).map_err(io)
    }
}
