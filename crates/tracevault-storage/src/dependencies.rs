use std::collections::BTreeMap;
use std::sync::Arc;

use tracevault_core::config::StorageConfig;
use tracevault_core::error::StorageError;
use tracevault_core::storage::DependencyStore;
use tracevault_core::trace::DependencyLink;

use crate::index::day_bucket;
use crate::key::{KeyBuilder, u64_range};
use crate::schema::DEPENDENCIES;
use crate::session::{Order, Session, Statement};

/// Day-bucketed storage of links computed elsewhere. Links are only stored and
/// read back; nothing here derives them from spans.
pub struct StoredDependencies {
    session: Arc<dyn Session>,
    config: Arc<StorageConfig>,
}

impl StoredDependencies {
    pub fn new(session: Arc<dyn Session>, config: Arc<StorageConfig>) -> Self {
        Self { session, config }
    }
}

/// Sum links sharing a parent and child, as one day's links would look if the
/// whole window had been aggregated at once.
fn merge(links: impl IntoIterator<Item = DependencyLink>) -> Vec<DependencyLink> {
    let mut merged: BTreeMap<(String, String), (u64, u64)> = BTreeMap::new();
    for link in links {
        let entry = merged.entry((link.parent, link.child)).or_default();
        entry.0 += link.call_count;
        entry.1 += link.error_count;
    }
    merged
        .into_iter()
        .map(|((parent, child), (call_count, error_count))| DependencyLink {
            parent,
            child,
            call_count,
            error_count,
        })
        .collect()
}

impl DependencyStore for StoredDependencies {
    fn get_dependencies(
        &self,
        end_ts: u64,
        lookback: u64,
    ) -> Result<Vec<DependencyLink>, StorageError> {
        let first_day = day_bucket(end_ts.saturating_sub(lookback));
        let last_day = day_bucket(end_ts);
        let rows = self
            .session
            .execute(
                &self.config.keyspace,
                Statement::select(DEPENDENCIES, u64_range(&[], first_day, last_day), Order::Asc),
            )
            .map_err(|e| StorageError::Query(e.to_string()))?;

        let mut links = Vec::new();
        for row in rows {
            let day: Vec<DependencyLink> = serde_json::from_slice(&row.value)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            links.extend(day);
        }
        Ok(merge(links))
    }

    fn write_dependency_links(
        &self,
        links: &[DependencyLink],
        day_ts: u64,
    ) -> Result<(), StorageError> {
        let value =
            serde_json::to_vec(links).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let key = KeyBuilder::new().u64(day_bucket(day_ts)).build();
        self.session
            .execute(
                &self.config.keyspace,
                Statement::upsert(DEPENDENCIES, key, value),
            )
            .map_err(|e| StorageError::Write {
                failed: 1,
                total: 1,
                cause: e.to_string(),
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fjall_session::FjallSession;
    use crate::schema;
    use tracevault_core::query::DAY_MILLIS;

    const TODAY: u64 = 1_700_006_400_000;

    fn store() -> (tempfile::TempDir, StoredDependencies) {
        let dir = tempfile::tempdir().unwrap();
        let session: Arc<dyn Session> = Arc::new(FjallSession::open(dir.path()).unwrap());
        let config = StorageConfig::default();
        schema::ensure_schema(session.as_ref(), &config.keyspace).unwrap();
        (dir, StoredDependencies::new(session, Arc::new(config)))
    }

    fn link(parent: &str, child: &str, calls: u64, errors: u64) -> DependencyLink {
        DependencyLink {
            parent: parent.into(),
            child: child.into(),
            call_count: calls,
            error_count: errors,
        }
    }

    #[test]
    fn test_write_then_read_one_day() {
        let (_dir, store) = store();
        let links = vec![link("frontend", "backend", 3, 1), link("backend", "db", 5, 0)];
        store.write_dependency_links(&links, TODAY + 1234).unwrap();

        let read = store.get_dependencies(TODAY + DAY_MILLIS - 1, DAY_MILLIS).unwrap();
        assert_eq!(
            read,
            vec![link("backend", "db", 5, 0), link("frontend", "backend", 3, 1)]
        );
    }

    #[test]
    fn test_rewriting_a_day_replaces_links() {
        let (_dir, store) = store();
        store
            .write_dependency_links(&[link("a", "b", 1, 0)], TODAY)
            .unwrap();
        store
            .write_dependency_links(&[link("a", "b", 7, 2)], TODAY)
            .unwrap();
        assert_eq!(
            store.get_dependencies(TODAY, DAY_MILLIS).unwrap(),
            vec![link("a", "b", 7, 2)]
        );
    }

    #[test]
    fn test_window_merges_days_and_excludes_outside() {
        let (_dir, store) = store();
        store
            .write_dependency_links(&[link("a", "b", 1, 0)], TODAY - DAY_MILLIS)
            .unwrap();
        store
            .write_dependency_links(&[link("a", "b", 2, 1)], TODAY)
            .unwrap();
        store
            .write_dependency_links(&[link("a", "c", 9, 0)], TODAY - 5 * DAY_MILLIS)
            .unwrap();

        let read = store.get_dependencies(TODAY, DAY_MILLIS).unwrap();
        assert_eq!(read, vec![link("a", "b", 3, 1)]);
    }
}
