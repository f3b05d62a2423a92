use std::sync::Arc;

use tracevault_core::config::StorageConfig;
use tracevault_core::error::StorageError;
use tracevault_core::storage::AutocompleteTags;

use crate::key::{KeyBuilder, KeyReader, prefix_range};
use crate::schema::AUTOCOMPLETE_TAGS;
use crate::session::{Order, Session, Statement};

/// Values written by the span consumer for whitelisted tag keys.
pub struct StoredAutocompleteTags {
    session: Arc<dyn Session>,
    config: Arc<StorageConfig>,
}

impl StoredAutocompleteTags {
    pub fn new(session: Arc<dyn Session>, config: Arc<StorageConfig>) -> Self {
        Self { session, config }
    }
}

impl AutocompleteTags for StoredAutocompleteTags {
    fn get_keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.config.autocomplete_keys.iter().cloned().collect())
    }

    fn get_values(&self, key: &str) -> Result<Vec<String>, StorageError> {
        if !self.config.is_autocomplete_key(key) {
            return Ok(Vec::new());
        }
        let prefix = KeyBuilder::new().text(key).build();
        self.session
            .execute(
                &self.config.keyspace,
                Statement::select(AUTOCOMPLETE_TAGS, prefix_range(prefix), Order::Asc),
            )
            .map_err(|e| StorageError::Query(e.to_string()))?
            .iter()
            .map(|row| {
                let mut reader = KeyReader::new(&row.key);
                reader
                    .text()
                    .and_then(|_| reader.text())
                    .map(str::to_string)
                    .ok_or_else(|| StorageError::Serialization("corrupt autocomplete row".into()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::IndexingSpanConsumer;
    use crate::fjall_session::FjallSession;
    use crate::schema;
    use tracevault_core::storage::SpanConsumer;
    use tracevault_core::trace::{Span, SpanId, TraceId};

    fn open() -> (tempfile::TempDir, IndexingSpanConsumer, StoredAutocompleteTags) {
        let dir = tempfile::tempdir().unwrap();
        let session: Arc<dyn Session> = Arc::new(FjallSession::open(dir.path()).unwrap());
        let config = Arc::new(StorageConfig {
            autocomplete_keys: ["http.host".to_string()].into(),
            ..StorageConfig::default()
        });
        schema::ensure_schema(session.as_ref(), &config.keyspace).unwrap();
        (
            dir,
            IndexingSpanConsumer::new(session.clone(), config.clone()),
            StoredAutocompleteTags::new(session, config),
        )
    }

    fn tagged(id: u64, tags: &[(&str, &str)]) -> Span {
        let mut span = Span::new(TraceId::from_u64(id), SpanId::from_u64(id));
        for (k, v) in tags {
            span.tags.insert(k.to_string(), v.to_string());
        }
        span
    }

    #[test]
    fn test_whitelisted_values_are_recorded_once() {
        let (_dir, consumer, tags) = open();
        for id in 1..=2 {
            consumer
                .accept(&[tagged(id, &[("http.method", "GET"), ("http.host", "host1")])])
                .unwrap();
        }
        assert_eq!(tags.get_keys().unwrap(), vec!["http.host".to_string()]);
        assert_eq!(tags.get_values("http.host").unwrap(), vec!["host1".to_string()]);
    }

    #[test]
    fn test_keys_outside_whitelist_have_no_values() {
        let (_dir, consumer, tags) = open();
        consumer
            .accept(&[tagged(1, &[("http.method", "GET")])])
            .unwrap();
        assert!(!tags.get_keys().unwrap().contains(&"http.method".to_string()));
        assert!(tags.get_values("http.method").unwrap().is_empty());
    }
}
