pub mod autocomplete;
pub mod codec;
pub mod consumer;
pub mod dependencies;
mod fjall_session;
pub mod index;
pub mod key;
pub mod query;
pub mod schema;
pub mod session;

use std::sync::Arc;

use tracevault_core::config::StorageConfig;
use tracevault_core::error::StorageError;
use tracing::info;

pub use autocomplete::StoredAutocompleteTags;
pub use consumer::IndexingSpanConsumer;
pub use dependencies::StoredDependencies;
pub use fjall_session::FjallSession;
pub use query::IndexedSpanStore;
pub use session::{Session, SessionError};

/// Every storage component over one shared session.
///
/// Opening verifies (or, with `ensure_schema`, creates and upgrades) the
/// schema first; nothing is returned against a stale layout.
pub struct TraceStorage {
    session: Arc<dyn Session>,
    config: Arc<StorageConfig>,
    consumer: IndexingSpanConsumer,
    spans: IndexedSpanStore,
    dependencies: StoredDependencies,
    autocomplete: StoredAutocompleteTags,
}

impl TraceStorage {
    /// Open an embedded fjall database at `path`.
    pub fn open(
        path: impl AsRef<std::path::Path>,
        config: StorageConfig,
    ) -> Result<Self, StorageError> {
        let session =
            FjallSession::open(path).map_err(|e| StorageError::Open(e.to_string()))?;
        Self::with_session(Arc::new(session), config)
    }

    pub fn with_session(
        session: Arc<dyn Session>,
        config: StorageConfig,
    ) -> Result<Self, StorageError> {
        config.validate()?;
        if config.ensure_schema {
            schema::ensure_schema(session.as_ref(), &config.keyspace)?;
        } else {
            schema::check_schema(session.as_ref(), &config.keyspace)?;
        }
        info!(
            "Opened keyspace {} (search_enabled={}, strict_trace_id={})",
            config.keyspace, config.search_enabled, config.strict_trace_id
        );

        let config = Arc::new(config);
        Ok(Self {
            consumer: IndexingSpanConsumer::new(session.clone(), config.clone()),
            spans: IndexedSpanStore::new(session.clone(), config.clone()),
            dependencies: StoredDependencies::new(session.clone(), config.clone()),
            autocomplete: StoredAutocompleteTags::new(session.clone(), config.clone()),
            session,
            config,
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    pub fn span_consumer(&self) -> &IndexingSpanConsumer {
        &self.consumer
    }

    pub fn span_store(&self) -> &IndexedSpanStore {
        &self.spans
    }

    pub fn dependencies(&self) -> &StoredDependencies {
        &self.dependencies
    }

    pub fn autocomplete_tags(&self) -> &StoredAutocompleteTags {
        &self.autocomplete
    }

    /// Wait until every accepted batch is written and durable, so that
    /// following reads observe it.
    pub fn block_while_in_flight(&self) -> Result<(), StorageError> {
        self.consumer.block_while_in_flight()
    }

    /// Drop every table of the configured keyspace.
    pub fn drop_keyspace(&self) -> Result<(), StorageError> {
        schema::drop_keyspace(self.session.as_ref(), &self.config.keyspace)
    }
}
