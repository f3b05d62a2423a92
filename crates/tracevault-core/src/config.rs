use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Engine configuration, resolved once at construction and read as plain data
/// by every operation afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Logical namespace every table lives in.
    pub keyspace: String,
    /// Create or upgrade the schema on open. When off, the stored schema must
    /// already be at the current version.
    pub ensure_schema: bool,
    /// Gates index writes and index-backed queries.
    pub search_enabled: bool,
    /// When off, 64-bit and 128-bit identifiers sharing their lower 64 bits
    /// are the same trace.
    pub strict_trace_id: bool,
    /// Tag keys whose values are recorded for autocompletion.
    pub autocomplete_keys: BTreeSet<String>,
    /// Unique candidate trace ids fetched per requested trace.
    pub index_fetch_multiplier: u32,
    /// Spans written per session batch.
    pub write_chunk_size: usize,
    /// Default deadline for a single query.
    pub query_timeout_ms: Option<u64>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            keyspace: "tracevault".to_string(),
            ensure_schema: true,
            search_enabled: true,
            strict_trace_id: true,
            autocomplete_keys: BTreeSet::new(),
            index_fetch_multiplier: 3,
            write_chunk_size: 100,
            query_timeout_ms: None,
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.keyspace.is_empty()
            || !self
                .keyspace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(StorageError::Config(format!(
                "keyspace {:?} must be non-empty and contain only [A-Za-z0-9_]",
                self.keyspace
            )));
        }
        if self.index_fetch_multiplier == 0 {
            return Err(StorageError::Config(
                "index_fetch_multiplier must be at least 1".into(),
            ));
        }
        if self.write_chunk_size == 0 {
            return Err(StorageError::Config(
                "write_chunk_size must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout_ms.map(Duration::from_millis)
    }

    pub fn is_autocomplete_key(&self, key: &str) -> bool {
        self.autocomplete_keys.contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StorageConfig::default();
        config.validate().unwrap();
        assert!(config.search_enabled);
        assert!(config.strict_trace_id);
        assert_eq!(config.index_fetch_multiplier, 3);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: StorageConfig = serde_json::from_str(
            r#"{"keyspace": "traces_v2", "autocomplete_keys": ["http.host"], "strict_trace_id": false}"#,
        )
        .unwrap();
        assert_eq!(config.keyspace, "traces_v2");
        assert!(!config.strict_trace_id);
        assert!(config.is_autocomplete_key("http.host"));
        assert!(!config.is_autocomplete_key("http.method"));
        assert_eq!(config.write_chunk_size, 100);
    }

    #[test]
    fn test_validate_rejects_zero_multiplier_and_bad_keyspace() {
        let config = StorageConfig {
            index_fetch_multiplier: 0,
            ..StorageConfig::default()
        };
        assert!(matches!(config.validate(), Err(StorageError::Config(_))));

        let config = StorageConfig {
            keyspace: "bad.name".into(),
            ..StorageConfig::default()
        };
        assert!(matches!(config.validate(), Err(StorageError::Config(_))));
    }
}
