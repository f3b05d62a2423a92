use crate::cancel::Cancellation;
use crate::error::StorageError;
use crate::query::QueryRequest;
use crate::trace::{DependencyLink, Span, Trace, TraceId};

/// Write path: durably stores and indexes incoming spans.
pub trait SpanConsumer: Send + Sync {
    /// Store a batch of spans. Either every span is written or an error is
    /// returned; on error the whole batch may be submitted again.
    fn accept(&self, spans: &[Span]) -> Result<(), StorageError>;
}

/// Read path over stored spans.
pub trait SpanStore: Send + Sync {
    /// Traces matching `request`, newest first, at most `request.limit`.
    fn get_traces(
        &self,
        request: &QueryRequest,
        cancel: &Cancellation,
    ) -> Result<Vec<Trace>, StorageError>;

    /// All spans stored under a trace ID. Empty when the trace is unknown.
    fn get_trace(&self, trace_id: &TraceId) -> Result<Vec<Span>, StorageError>;

    /// Traces for several IDs at once, skipping unknown IDs.
    fn get_traces_by_ids(&self, trace_ids: &[TraceId]) -> Result<Vec<Trace>, StorageError>;

    fn get_service_names(&self) -> Result<Vec<String>, StorageError>;

    fn get_span_names(&self, service_name: &str) -> Result<Vec<String>, StorageError>;
}

/// Pre-aggregated service links, bucketed by day.
pub trait DependencyStore: Send + Sync {
    /// Links for every day bucket in `[end_ts - lookback, end_ts]` (epoch ms).
    fn get_dependencies(
        &self,
        end_ts: u64,
        lookback: u64,
    ) -> Result<Vec<DependencyLink>, StorageError>;

    /// Replace the links stored for the day containing `day_ts` (epoch ms).
    fn write_dependency_links(
        &self,
        links: &[DependencyLink],
        day_ts: u64,
    ) -> Result<(), StorageError>;
}

/// Tag keys and values offered for autocompletion.
pub trait AutocompleteTags: Send + Sync {
    /// The configured whitelist, not every key ever observed.
    fn get_keys(&self) -> Result<Vec<String>, StorageError>;

    /// Observed values of `key`. Empty for keys outside the whitelist.
    fn get_values(&self, key: &str) -> Result<Vec<String>, StorageError>;
}
