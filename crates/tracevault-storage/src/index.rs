use std::collections::BTreeSet;

use tracevault_core::query::{AnnotationTerm, DAY_MILLIS};
use tracevault_core::trace::{Span, TraceId};

use crate::key::KeyBuilder;
use crate::schema::{
    ANNOTATIONS_INDEX, SERVICE_NAME_INDEX, SERVICE_NAMES, SERVICE_SPAN_NAME_INDEX, SPAN_NAMES,
};

/// Longer annotation values and tag values are stored but not indexed.
pub const MAX_INDEXED_VALUE_LEN: usize = 256;

/// Start of the UTC day containing `epoch_millis`.
pub fn day_bucket(epoch_millis: u64) -> u64 {
    epoch_millis - epoch_millis % DAY_MILLIS
}

pub fn service_dimension(service: &str) -> Vec<u8> {
    KeyBuilder::new().text(service).build()
}

pub fn service_span_dimension(service: &str, span_name: &str) -> Vec<u8> {
    KeyBuilder::new().text(service).text(span_name).build()
}

pub fn annotation_dimension(service: &str, term: &AnnotationTerm) -> Vec<u8> {
    let builder = KeyBuilder::new().text(service);
    match term {
        AnnotationTerm::Key(key) => builder.text(key).byte(0),
        AnnotationTerm::KeyValue(key, value) => builder.text(key).byte(1).text(value),
    }
    .build()
}

/// `{dimension}{day bucket}` partition prefix for one index.
pub fn bucket_prefix(dimension: &[u8], bucket: u64) -> Vec<u8> {
    KeyBuilder::new().bytes(dimension).u64(bucket).build()
}

fn index_key(dimension: &[u8], ts_micros: u64, trace_id: &TraceId) -> Vec<u8> {
    KeyBuilder::new()
        .bytes(&bucket_prefix(dimension, day_bucket(ts_micros / 1000)))
        .u64(ts_micros)
        .bytes(trace_id.as_bytes())
        .build()
}

/// Recover `(timestamp µs, trace id)` from the tail of an index key.
pub fn decode_index_key(key: &[u8]) -> Option<(u64, TraceId)> {
    let tail = key.len().checked_sub(24)?;
    let ts = u64::from_be_bytes(key[tail..tail + 8].try_into().ok()?);
    let trace_id = TraceId(key[tail + 8..].try_into().ok()?);
    Some((ts, trace_id))
}

/// Terms a span can be found by in `annotations_index`.
pub fn annotation_terms(span: &Span) -> BTreeSet<AnnotationTerm> {
    let mut terms = BTreeSet::new();
    for annotation in &span.annotations {
        if !annotation.value.is_empty() && annotation.value.len() <= MAX_INDEXED_VALUE_LEN {
            terms.insert(AnnotationTerm::Key(annotation.value.clone()));
        }
    }
    for (key, value) in &span.tags {
        if key.is_empty() || key.len() > MAX_INDEXED_VALUE_LEN {
            continue;
        }
        terms.insert(AnnotationTerm::Key(key.clone()));
        if value.len() <= MAX_INDEXED_VALUE_LEN {
            terms.insert(AnnotationTerm::KeyValue(key.clone(), value.clone()));
        }
    }
    terms
}

/// Every `(table, key)` index row derived from a normalized span.
///
/// A trace with many spans appears many times in each index; rows are never
/// deduplicated here, the query engine does that while reading.
///
/// Spans without a local service name produce no rows. Spans without any
/// timestamp only feed the name listings and stay out of the time indexes.
pub fn index_rows(span: &Span) -> Vec<(&'static str, Vec<u8>)> {
    let Some(service) = span.local_service_name() else {
        return Vec::new();
    };
    let mut rows = vec![(SERVICE_NAMES, service_dimension(service))];
    if let Some(name) = span.name() {
        rows.push((SPAN_NAMES, service_span_dimension(service, name)));
    }

    let Some(ts) = span.index_timestamp() else {
        return rows;
    };
    rows.push((
        SERVICE_NAME_INDEX,
        index_key(&service_dimension(service), ts, &span.trace_id),
    ));
    if let Some(name) = span.name() {
        rows.push((
            SERVICE_SPAN_NAME_INDEX,
            index_key(&service_span_dimension(service, name), ts, &span.trace_id),
        ));
    }
    for term in annotation_terms(span) {
        rows.push((
            ANNOTATIONS_INDEX,
            index_key(&annotation_dimension(service, &term), ts, &span.trace_id),
        ));
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracevault_core::trace::{Annotation, Endpoint, SpanId};

    const TS: u64 = 1_700_000_000_000_000;

    fn span() -> Span {
        let mut span = Span::new(TraceId::from_u64(0xabc), SpanId::from_u64(1));
        span.name = Some("get".into());
        span.timestamp = Some(TS);
        span.local_endpoint = Some(Endpoint::service("frontend"));
        span
    }

    fn count(rows: &[(&str, Vec<u8>)], table: &str) -> usize {
        rows.iter().filter(|(t, _)| *t == table).count()
    }

    #[test]
    fn test_day_bucket_truncates_to_midnight() {
        assert_eq!(day_bucket(DAY_MILLIS * 3 + 5), DAY_MILLIS * 3);
        assert_eq!(day_bucket(DAY_MILLIS * 3), DAY_MILLIS * 3);
    }

    #[test]
    fn test_rows_for_each_dimension() {
        let mut span = span();
        span.tags.insert("http.method".into(), "GET".into());
        span.annotations.push(Annotation {
            timestamp: TS + 1,
            value: "ws".into(),
        });
        let rows = index_rows(&span);
        assert_eq!(count(&rows, SERVICE_NAMES), 1);
        assert_eq!(count(&rows, SPAN_NAMES), 1);
        assert_eq!(count(&rows, SERVICE_NAME_INDEX), 1);
        assert_eq!(count(&rows, SERVICE_SPAN_NAME_INDEX), 1);
        // "ws", "http.method" and "http.method=GET"
        assert_eq!(count(&rows, ANNOTATIONS_INDEX), 3);
    }

    #[test]
    fn test_index_key_tail_decodes() {
        let rows = index_rows(&span());
        let (_, key) = rows
            .iter()
            .find(|(t, _)| *t == SERVICE_NAME_INDEX)
            .unwrap();
        let (ts, trace_id) = decode_index_key(key).unwrap();
        assert_eq!(ts, TS);
        assert_eq!(trace_id, TraceId::from_u64(0xabc));
        let prefix = bucket_prefix(&service_dimension("frontend"), day_bucket(TS / 1000));
        assert!(key.starts_with(&prefix));
    }

    #[test]
    fn test_no_service_means_no_rows() {
        let mut span = span();
        span.local_endpoint = Some(Endpoint::service(""));
        assert!(index_rows(&span).is_empty());
    }

    #[test]
    fn test_no_timestamp_keeps_name_rows_only() {
        let mut span = span();
        span.timestamp = None;
        let rows = index_rows(&span);
        assert_eq!(rows.len(), 2);
        assert_eq!(count(&rows, SERVICE_NAME_INDEX), 0);
    }

    #[test]
    fn test_long_values_are_not_indexed() {
        let mut span = span();
        span.tags.insert("sql".into(), "x".repeat(MAX_INDEXED_VALUE_LEN + 1));
        let terms = annotation_terms(&span);
        assert_eq!(terms.len(), 1);
        assert!(terms.contains(&AnnotationTerm::Key("sql".into())));
    }
}
