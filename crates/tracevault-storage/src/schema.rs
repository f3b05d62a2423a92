use tracevault_core::error::StorageError;
use tracing::info;

use crate::session::{Session, Statement};

pub const SCHEMA_METADATA: &str = "schema_metadata";
pub const TRACES: &str = "traces";
pub const SERVICE_NAMES: &str = "service_names";
pub const SPAN_NAMES: &str = "span_names";
pub const SERVICE_NAME_INDEX: &str = "service_name_index";
pub const SERVICE_SPAN_NAME_INDEX: &str = "service_span_name_index";
pub const ANNOTATIONS_INDEX: &str = "annotations_index";
pub const DEPENDENCIES: &str = "dependencies";
pub const AUTOCOMPLETE_TAGS: &str = "autocomplete_tags";

const VERSION_KEY: &[u8] = b"version";

/// Recorded in `schema_metadata` under the `version` key.
pub const CURRENT_VERSION: u32 = 2;

struct Migration {
    version: u32,
    tables: &'static [&'static str],
}

/// Forward-only. Migrations only create tables, so applying one twice never
/// touches existing rows.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        tables: &[
            TRACES,
            SERVICE_NAMES,
            SPAN_NAMES,
            SERVICE_NAME_INDEX,
            SERVICE_SPAN_NAME_INDEX,
            ANNOTATIONS_INDEX,
            DEPENDENCIES,
        ],
    },
    Migration {
        version: 2,
        tables: &[AUTOCOMPLETE_TAGS],
    },
];

fn schema_err(context: &str, e: impl std::fmt::Display) -> StorageError {
    StorageError::Schema(format!("{context}: {e}"))
}

/// Version recorded in the keyspace, `None` when no schema was ever applied.
pub fn read_version(session: &dyn Session, keyspace: &str) -> Result<Option<u32>, StorageError> {
    let exists = session
        .execute(
            keyspace,
            Statement::TableExists {
                table: SCHEMA_METADATA,
            },
        )
        .map_err(|e| schema_err("failed to inspect keyspace", e))?;
    if exists.is_empty() {
        return Ok(None);
    }
    let rows = session
        .execute(
            keyspace,
            Statement::Get {
                table: SCHEMA_METADATA,
                key: VERSION_KEY.to_vec(),
            },
        )
        .map_err(|e| schema_err("failed to read schema version", e))?;
    let Some(row) = rows.first() else {
        return Ok(None);
    };
    let bytes: [u8; 4] = row
        .value
        .as_slice()
        .try_into()
        .map_err(|_| StorageError::Schema("corrupt schema version".into()))?;
    Ok(Some(u32::from_be_bytes(bytes)))
}

/// Create or upgrade the schema of `keyspace` to [`CURRENT_VERSION`].
///
/// Safe to call on every start. Fails without recording progress as soon as
/// one statement fails, and refuses keyspaces written by a newer version.
pub fn ensure_schema(session: &dyn Session, keyspace: &str) -> Result<u32, StorageError> {
    let current = read_version(session, keyspace)?.unwrap_or(0);
    if current > CURRENT_VERSION {
        return Err(StorageError::Schema(format!(
            "keyspace {keyspace} is at schema version {current}, newer than supported version {CURRENT_VERSION}"
        )));
    }
    if current == CURRENT_VERSION {
        return Ok(current);
    }

    session
        .execute(
            keyspace,
            Statement::CreateTable {
                table: SCHEMA_METADATA,
                large_values: false,
            },
        )
        .map_err(|e| schema_err("failed to create schema_metadata", e))?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        for &table in migration.tables {
            session
                .execute(
                    keyspace,
                    Statement::CreateTable {
                        table,
                        large_values: table == TRACES,
                    },
                )
                .map_err(|e| {
                    schema_err(
                        &format!("migration {} failed creating {table}", migration.version),
                        e,
                    )
                })?;
        }
        session
            .execute(
                keyspace,
                Statement::upsert(
                    SCHEMA_METADATA,
                    VERSION_KEY.to_vec(),
                    migration.version.to_be_bytes().to_vec(),
                ),
            )
            .map_err(|e| schema_err("failed to record schema version", e))?;
        info!(
            "Applied schema migration {} to keyspace {keyspace}",
            migration.version
        );
    }
    Ok(CURRENT_VERSION)
}

/// Verify, without changing anything, that `keyspace` is at [`CURRENT_VERSION`].
pub fn check_schema(session: &dyn Session, keyspace: &str) -> Result<(), StorageError> {
    match read_version(session, keyspace)? {
        Some(CURRENT_VERSION) => Ok(()),
        Some(v) => Err(StorageError::Schema(format!(
            "keyspace {keyspace} is at schema version {v}, expected {CURRENT_VERSION}"
        ))),
        None => Err(StorageError::Schema(format!(
            "keyspace {keyspace} has no schema"
        ))),
    }
}

/// Remove every table of `keyspace`, data included.
pub fn drop_keyspace(session: &dyn Session, keyspace: &str) -> Result<(), StorageError> {
    let tables = MIGRATIONS
        .iter()
        .flat_map(|m| m.tables.iter().copied())
        .chain(std::iter::once(SCHEMA_METADATA));
    for table in tables {
        session
            .execute(keyspace, Statement::DropTable { table })
            .map_err(|e| schema_err(&format!("failed to drop {table}"), e))?;
    }
    info!("Dropped keyspace {keyspace}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fjall_session::FjallSession;
    use crate::key::full_range;
    use crate::session::Order;

    const KS: &str = "schema_test";

    fn session() -> (tempfile::TempDir, FjallSession) {
        let dir = tempfile::tempdir().unwrap();
        let session = FjallSession::open(dir.path()).unwrap();
        (dir, session)
    }

    #[test]
    fn test_ensure_schema_creates_all_tables() {
        let (_dir, session) = session();
        assert_eq!(read_version(&session, KS).unwrap(), None);

        assert_eq!(ensure_schema(&session, KS).unwrap(), CURRENT_VERSION);
        assert_eq!(read_version(&session, KS).unwrap(), Some(CURRENT_VERSION));
        for table in [TRACES, SERVICE_NAME_INDEX, DEPENDENCIES, AUTOCOMPLETE_TAGS] {
            let rows = session
                .execute(KS, Statement::TableExists { table })
                .unwrap();
            assert_eq!(rows.len(), 1, "missing {table}");
        }
        check_schema(&session, KS).unwrap();
    }

    #[test]
    fn test_ensure_schema_twice_keeps_rows() {
        let (_dir, session) = session();
        ensure_schema(&session, KS).unwrap();
        session
            .execute(KS, Statement::upsert(TRACES, b"k".to_vec(), b"v".to_vec()))
            .unwrap();

        ensure_schema(&session, KS).unwrap();

        let rows = session
            .execute(KS, Statement::select(TRACES, full_range(), Order::Asc))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, b"v");
    }

    #[test]
    fn test_upgrades_version_one_keyspace() {
        let (_dir, session) = session();
        ensure_schema(&session, KS).unwrap();
        session
            .execute(KS, Statement::DropTable {
                table: AUTOCOMPLETE_TAGS,
            })
            .unwrap();
        session
            .execute(
                KS,
                Statement::upsert(SCHEMA_METADATA, VERSION_KEY.to_vec(), 1u32.to_be_bytes().to_vec()),
            )
            .unwrap();
        assert!(check_schema(&session, KS).is_err());

        ensure_schema(&session, KS).unwrap();
        let rows = session
            .execute(KS, Statement::TableExists {
                table: AUTOCOMPLETE_TAGS,
            })
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_refuses_newer_schema() {
        let (_dir, session) = session();
        ensure_schema(&session, KS).unwrap();
        session
            .execute(
                KS,
                Statement::upsert(SCHEMA_METADATA, VERSION_KEY.to_vec(), 9u32.to_be_bytes().to_vec()),
            )
            .unwrap();
        assert!(matches!(
            ensure_schema(&session, KS),
            Err(StorageError::Schema(_))
        ));
    }

    #[test]
    fn test_check_schema_fails_on_empty_keyspace() {
        let (_dir, session) = session();
        assert!(matches!(
            check_schema(&session, KS),
            Err(StorageError::Schema(_))
        ));
    }

    #[test]
    fn test_drop_keyspace_removes_tables() {
        let (_dir, session) = session();
        ensure_schema(&session, KS).unwrap();
        drop_keyspace(&session, KS).unwrap();
        assert_eq!(read_version(&session, KS).unwrap(), None);
    }
}
