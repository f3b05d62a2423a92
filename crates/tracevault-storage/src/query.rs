use std::collections::{BTreeSet, HashSet};
use std::ops::Bound;
use std::sync::Arc;

use tracevault_core::cancel::Cancellation;
use tracevault_core::config::StorageConfig;
use tracevault_core::error::StorageError;
use tracevault_core::query::{DAY_MILLIS, IndexSelection, QueryRequest};
use tracevault_core::storage::SpanStore;
use tracevault_core::trace::{Span, Trace, TraceId};
use tracing::debug;

use crate::codec;
use crate::index;
use crate::key::{KeyBuilder, KeyReader, full_range, prefix_range, u64_range};
use crate::schema::{
    ANNOTATIONS_INDEX, SERVICE_NAME_INDEX, SERVICE_NAMES, SERVICE_SPAN_NAME_INDEX, SPAN_NAMES,
    TRACES,
};
use crate::session::{Order, Row, Session, Statement};

/// Index rows read per round trip while streaming candidates.
const INDEX_PAGE_SIZE: usize = 1000;

/// Read path over the index tables and `traces`.
///
/// A search reads candidate trace IDs from one index, hydrates each candidate
/// and tests it against the whole request. Index rows are one per span, not
/// per trace, so candidates are deduplicated while streaming and only unique
/// IDs count against the budget of `limit * index_fetch_multiplier`.
///
/// The budget bounds fan-out, not correctness. When more than
/// `1 - 1/multiplier` of the unique candidates fail the in-memory test, a
/// search can return fewer than `limit` traces even though more matches exist
/// further back in the window.
pub struct IndexedSpanStore {
    session: Arc<dyn Session>,
    config: Arc<StorageConfig>,
}

fn query_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::Query(e.to_string())
}

impl IndexedSpanStore {
    pub fn new(session: Arc<dyn Session>, config: Arc<StorageConfig>) -> Self {
        Self { session, config }
    }

    fn execute(&self, statement: Statement) -> Result<Vec<Row>, StorageError> {
        self.session
            .execute(&self.config.keyspace, statement)
            .map_err(query_err)
    }

    /// The identity two IDs must share to be the same trace.
    fn dedupe_key(&self, trace_id: &TraceId) -> TraceId {
        if self.config.strict_trace_id {
            *trace_id
        } else {
            trace_id.to_64_bit()
        }
    }

    /// Spans stored under `trace_id`, in key order.
    fn read_spans(&self, trace_id: &TraceId) -> Result<Vec<Span>, StorageError> {
        let prefix = codec::trace_prefix(trace_id, self.config.strict_trace_id);
        self.execute(Statement::select(TRACES, prefix_range(prefix), Order::Asc))?
            .iter()
            .map(|row| codec::decode(&row.value))
            .collect()
    }

    /// `(table, dimension)` pairs to scan for a request.
    fn partitions(
        &self,
        selection: IndexSelection<'_>,
    ) -> Result<Vec<(&'static str, Vec<u8>)>, StorageError> {
        Ok(match selection {
            IndexSelection::AllServices => self
                .get_service_names()?
                .iter()
                .map(|service| (SERVICE_NAME_INDEX, index::service_dimension(service)))
                .collect(),
            IndexSelection::ByService { service } => {
                vec![(SERVICE_NAME_INDEX, index::service_dimension(service))]
            }
            IndexSelection::ByServiceAndSpan { service, span_name } => vec![(
                SERVICE_SPAN_NAME_INDEX,
                index::service_span_dimension(service, span_name),
            )],
            IndexSelection::ByTag { service, term } => vec![(
                ANNOTATIONS_INDEX,
                index::annotation_dimension(service, term),
            )],
        })
    }

    /// Newest-first unique trace IDs of one index dimension inside the
    /// request window, stopping after `budget` unique IDs.
    fn scan_dimension(
        &self,
        table: &'static str,
        dimension: &[u8],
        request: &QueryRequest,
        budget: usize,
        cancel: &Cancellation,
    ) -> Result<Vec<(u64, TraceId)>, StorageError> {
        let start_us = request.start_ts().saturating_mul(1000);
        let end_us = request.end_ts.saturating_mul(1000);
        let first_bucket = index::day_bucket(request.start_ts());
        let mut bucket = index::day_bucket(request.end_ts);

        let mut seen = HashSet::new();
        let mut found = Vec::new();
        loop {
            cancel.check()?;
            let prefix = index::bucket_prefix(dimension, bucket);
            let (lower, mut upper) = u64_range(&prefix, start_us, end_us);
            loop {
                let rows = self.execute(Statement::select_limit(
                    table,
                    (lower.clone(), upper),
                    Order::Desc,
                    INDEX_PAGE_SIZE,
                ))?;
                for row in &rows {
                    let (ts, trace_id) = index::decode_index_key(&row.key).ok_or_else(|| {
                        StorageError::Serialization(format!("corrupt key in {table}"))
                    })?;
                    if seen.insert(self.dedupe_key(&trace_id)) {
                        found.push((ts, trace_id));
                        if found.len() >= budget {
                            return Ok(found);
                        }
                    }
                }
                match rows.last() {
                    Some(last) if rows.len() == INDEX_PAGE_SIZE => {
                        cancel.check()?;
                        upper = Bound::Excluded(last.key.clone());
                    }
                    _ => break,
                }
            }
            if bucket <= first_bucket {
                return Ok(found);
            }
            bucket -= DAY_MILLIS;
        }
    }

    /// Unique candidate IDs across every scanned partition, newest first.
    fn candidates(
        &self,
        request: &QueryRequest,
        budget: usize,
        cancel: &Cancellation,
    ) -> Result<Vec<TraceId>, StorageError> {
        let selection = request.index_selection();
        let partitions = self.partitions(selection)?;
        debug!(
            "Searching {} partition(s) for {selection:?} with budget {budget}",
            partitions.len()
        );

        let mut merged = Vec::new();
        for (table, dimension) in &partitions {
            merged.extend(self.scan_dimension(*table, dimension, request, budget, cancel)?);
        }
        if partitions.len() > 1 {
            merged.sort_by(|a, b| b.0.cmp(&a.0));
        }

        let mut seen = HashSet::new();
        Ok(merged
            .into_iter()
            .map(|(_, trace_id)| trace_id)
            .filter(|trace_id| seen.insert(self.dedupe_key(trace_id)))
            .take(budget)
            .collect())
    }
}

impl SpanStore for IndexedSpanStore {
    fn get_traces(
        &self,
        request: &QueryRequest,
        cancel: &Cancellation,
    ) -> Result<Vec<Trace>, StorageError> {
        if !self.config.search_enabled {
            return Err(StorageError::Unsupported(
                "search is disabled; only trace id lookups are available".into(),
            ));
        }
        let cancel = cancel.clone().or_timeout(self.config.query_timeout());
        cancel.check()?;

        let budget = request
            .limit
            .saturating_mul(self.config.index_fetch_multiplier as usize);
        let candidates = self.candidates(request, budget, &cancel)?;

        let mut traces = Vec::with_capacity(request.limit);
        for trace_id in &candidates {
            cancel.check()?;
            let spans = self.read_spans(trace_id)?;
            if spans.is_empty() {
                // Indexed but not yet readable.
                continue;
            }
            let trace = Trace {
                trace_id: *trace_id,
                spans,
            };
            if request.test(&trace) {
                traces.push(trace);
                if traces.len() >= request.limit {
                    break;
                }
            }
        }
        debug!(
            "Matched {} of {} candidate traces",
            traces.len(),
            candidates.len()
        );

        traces.sort_by(|a, b| b.timestamp().cmp(&a.timestamp()));
        Ok(traces)
    }

    fn get_trace(&self, trace_id: &TraceId) -> Result<Vec<Span>, StorageError> {
        self.read_spans(trace_id)
    }

    fn get_traces_by_ids(&self, trace_ids: &[TraceId]) -> Result<Vec<Trace>, StorageError> {
        let mut seen = HashSet::new();
        let mut traces = Vec::new();
        for trace_id in trace_ids {
            if !seen.insert(self.dedupe_key(trace_id)) {
                continue;
            }
            let spans = self.read_spans(trace_id)?;
            if !spans.is_empty() {
                traces.push(Trace {
                    trace_id: *trace_id,
                    spans,
                });
            }
        }
        Ok(traces)
    }

    fn get_service_names(&self) -> Result<Vec<String>, StorageError> {
        if !self.config.search_enabled {
            return Ok(Vec::new());
        }
        self.execute(Statement::select(SERVICE_NAMES, full_range(), Order::Asc))?
            .iter()
            .map(|row| {
                KeyReader::new(&row.key)
                    .text()
                    .map(str::to_string)
                    .ok_or_else(|| StorageError::Serialization("corrupt service name".into()))
            })
            .collect()
    }

    fn get_span_names(&self, service_name: &str) -> Result<Vec<String>, StorageError> {
        let service_name = service_name.trim().to_lowercase();
        if !self.config.search_enabled || service_name.is_empty() {
            return Ok(Vec::new());
        }
        let prefix = KeyBuilder::new().text(&service_name).build();
        let mut names = BTreeSet::new();
        for row in self.execute(Statement::select(SPAN_NAMES, prefix_range(prefix), Order::Asc))? {
            let mut reader = KeyReader::new(&row.key);
            let name = reader
                .text()
                .and_then(|_| reader.text())
                .ok_or_else(|| StorageError::Serialization("corrupt span name".into()))?;
            names.insert(name.to_string());
        }
        Ok(names.into_iter().collect())
    }
}
