use std::sync::{Arc, Condvar, Mutex, PoisonError};

use tracevault_core::config::StorageConfig;
use tracevault_core::error::StorageError;
use tracevault_core::storage::SpanConsumer;
use tracevault_core::trace::Span;
use tracing::{debug, warn};

use crate::codec;
use crate::index;
use crate::key::KeyBuilder;
use crate::schema::{AUTOCOMPLETE_TAGS, TRACES};
use crate::session::{Session, SessionError, Statement};

/// Session batches written concurrently by one `accept` call.
pub const WRITE_WORKERS: usize = 4;

/// Counts write batches that have started but not finished.
#[derive(Debug, Default)]
pub struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

pub struct InFlightGuard<'a>(&'a InFlight);

impl InFlight {
    pub fn enter(&self) -> InFlightGuard<'_> {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        InFlightGuard(self)
    }

    pub fn current(&self) -> usize {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until no batch is in flight.
    pub fn wait_idle(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count > 0 {
            count = self
                .idle
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut count = self.0.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count -= 1;
        if *count == 0 {
            self.0.idle.notify_all();
        }
    }
}

/// Write path: primary span rows, index rows and autocomplete values.
///
/// A batch is split into chunks, each written as one session batch by a pool
/// of at most [`WRITE_WORKERS`] threads. Index rows are not transactional with the span rows, so a
/// failure can leave a span stored but unindexed; every write is an upsert and
/// resubmitting the batch repairs it.
pub struct IndexingSpanConsumer {
    session: Arc<dyn Session>,
    config: Arc<StorageConfig>,
    in_flight: Arc<InFlight>,
}

impl IndexingSpanConsumer {
    pub fn new(session: Arc<dyn Session>, config: Arc<StorageConfig>) -> Self {
        Self {
            session,
            config,
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// Wait for every accepted batch to finish, then make its writes durable.
    pub fn block_while_in_flight(&self) -> Result<(), StorageError> {
        self.in_flight.wait_idle();
        self.session.persist().map_err(|e| StorageError::Write {
            failed: 1,
            total: 1,
            cause: e.to_string(),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.current()
    }

    fn validate(spans: &[Span]) -> Result<(), StorageError> {
        for span in spans {
            if span.trace_id.is_zero() {
                return Err(StorageError::Validation(format!(
                    "span {} has no trace id",
                    span.id
                )));
            }
        }
        Ok(())
    }

    /// Every statement for one span. Encoding happens here so a bad span
    /// fails the call before anything is written.
    fn statements_for(&self, span: &Span) -> Result<Vec<Statement>, StorageError> {
        let span = codec::normalize(span);
        let mut statements = vec![Statement::upsert(
            TRACES,
            codec::span_key(&span),
            codec::encode(&span)?,
        )];
        if !self.config.search_enabled {
            return Ok(statements);
        }
        for (table, key) in index::index_rows(&span) {
            statements.push(Statement::upsert(table, key, Vec::new()));
        }
        for (key, value) in &span.tags {
            if self.config.is_autocomplete_key(key) {
                let row = KeyBuilder::new().text(key).text(value).build();
                statements.push(Statement::upsert(AUTOCOMPLETE_TAGS, row, Vec::new()));
            }
        }
        Ok(statements)
    }

    /// Writes every chunk as one session batch on at most
    /// [`WRITE_WORKERS`] threads, returning the failures.
    fn write_chunks(&self, chunks: Vec<Vec<Statement>>) -> Vec<SessionError> {
        let keyspace = self.config.keyspace.as_str();
        let workers = chunks.len().min(WRITE_WORKERS);
        if workers <= 1 {
            return chunks
                .into_iter()
                .filter_map(|chunk| self.session.execute_batch(keyspace, chunk).err())
                .collect();
        }

        let queue = Mutex::new(chunks.into_iter());
        let queue = &queue;
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    scope.spawn(move || {
                        let mut failures = Vec::new();
                        loop {
                            let next = queue.lock().unwrap_or_else(PoisonError::into_inner).next();
                            let Some(chunk) = next else { break };
                            if let Err(e) = self.session.execute_batch(keyspace, chunk) {
                                failures.push(e);
                            }
                        }
                        failures
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|handle| match handle.join() {
                    Ok(failures) => failures,
                    Err(_) => vec![SessionError::Io("write thread panicked".into())],
                })
                .collect()
        })
    }
}

impl SpanConsumer for IndexingSpanConsumer {
    fn accept(&self, spans: &[Span]) -> Result<(), StorageError> {
        if spans.is_empty() {
            return Ok(());
        }
        Self::validate(spans)?;

        let chunks = spans
            .chunks(self.config.write_chunk_size)
            .map(|chunk| {
                chunk
                    .iter()
                    .map(|span| self.statements_for(span))
                    .collect::<Result<Vec<_>, _>>()
                    .map(|per_span| per_span.into_iter().flatten().collect::<Vec<_>>())
            })
            .collect::<Result<Vec<_>, _>>()?;
        let total = chunks.len();

        let _guard = self.in_flight.enter();
        let failures = self.write_chunks(chunks);
        if let Some(first) = failures.first() {
            warn!(
                "Failed to write {} of {total} span chunks: {first}",
                failures.len()
            );
            return Err(StorageError::Write {
                failed: failures.len(),
                total,
                cause: first.to_string(),
            });
        }
        debug!("Stored {} spans in {total} chunks", spans.len());
        Ok(())
    }
}
