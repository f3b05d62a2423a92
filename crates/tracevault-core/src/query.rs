use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::StorageError;
use crate::trace::{Span, Trace};

pub const DAY_MILLIS: u64 = 24 * 60 * 60 * 1000;

/// One term of an annotation query: either a bare key (matches an annotation
/// value or the presence of a tag key) or a tag equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AnnotationTerm {
    Key(String),
    KeyValue(String, String),
}

impl AnnotationTerm {
    pub fn matches(&self, span: &Span) -> bool {
        match self {
            Self::Key(key) => {
                span.tags.contains_key(key) || span.annotations.iter().any(|a| &a.value == key)
            }
            Self::KeyValue(key, value) => span.tags.get(key) == Some(value),
        }
    }
}

impl fmt::Display for AnnotationTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(key) => f.write_str(key),
            Self::KeyValue(key, value) => write!(f, "{key}={value}"),
        }
    }
}

/// Parses `"error and http.method=GET"` into its terms. Empty terms are dropped.
pub fn parse_annotation_query(query: &str) -> Vec<AnnotationTerm> {
    query
        .split(" and ")
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .map(|term| match term.split_once('=') {
            Some((key, value)) => AnnotationTerm::KeyValue(key.to_string(), value.to_string()),
            None => AnnotationTerm::Key(term.to_string()),
        })
        .collect()
}

/// The single index a request is answered from.
///
/// Combining dimensions server-side is not possible, so exactly one index
/// table is read and every other qualifier is applied to hydrated traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexSelection<'a> {
    /// Time window only: every known service is scanned.
    AllServices,
    ByService {
        service: &'a str,
    },
    ByServiceAndSpan {
        service: &'a str,
        span_name: &'a str,
    },
    ByTag {
        service: &'a str,
        term: &'a AnnotationTerm,
    },
}

/// A trace search. Build with [`QueryRequest::builder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub service_name: Option<String>,
    pub span_name: Option<String>,
    pub annotation_query: Vec<AnnotationTerm>,
    /// Microseconds, inclusive.
    pub min_duration: Option<u64>,
    /// Microseconds, inclusive.
    pub max_duration: Option<u64>,
    /// Epoch milliseconds.
    pub end_ts: u64,
    /// Milliseconds before `end_ts` to search.
    pub lookback: u64,
    pub limit: usize,
}

impl QueryRequest {
    pub fn builder() -> QueryRequestBuilder {
        QueryRequestBuilder::default()
    }

    /// Start of the window in epoch milliseconds.
    pub fn start_ts(&self) -> u64 {
        self.end_ts.saturating_sub(self.lookback)
    }

    /// Most selective index available: tag, then span name, then service.
    pub fn index_selection(&self) -> IndexSelection<'_> {
        let Some(service) = self.service_name.as_deref() else {
            return IndexSelection::AllServices;
        };
        let tag = self
            .annotation_query
            .iter()
            .find(|t| matches!(t, AnnotationTerm::KeyValue(..)))
            .or_else(|| self.annotation_query.first());
        if let Some(term) = tag {
            return IndexSelection::ByTag { service, term };
        }
        if let Some(span_name) = self.span_name.as_deref() {
            return IndexSelection::ByServiceAndSpan { service, span_name };
        }
        IndexSelection::ByService { service }
    }

    /// Whether a hydrated trace satisfies every qualifier of this request.
    pub fn test(&self, trace: &Trace) -> bool {
        let start_us = self.start_ts().saturating_mul(1000);
        let end_us = self.end_ts.saturating_mul(1000);
        let in_window = trace
            .spans
            .iter()
            .filter_map(Span::index_timestamp)
            .any(|ts| ts >= start_us && ts <= end_us);
        if !in_window {
            return false;
        }

        let scoped: Vec<&Span> = match self.service_name.as_deref() {
            Some(service) => trace.spans_for_service(service).collect(),
            None => trace.spans.iter().collect(),
        };
        if scoped.is_empty() {
            return false;
        }

        if let Some(name) = self.span_name.as_deref()
            && !scoped.iter().any(|s| s.name() == Some(name))
        {
            return false;
        }

        if !self
            .annotation_query
            .iter()
            .all(|term| scoped.iter().any(|s| term.matches(s)))
        {
            return false;
        }

        if self.min_duration.is_some() || self.max_duration.is_some() {
            let min = self.min_duration.unwrap_or(0);
            let max = self.max_duration.unwrap_or(u64::MAX);
            let span_name = self.span_name.as_deref();
            return scoped
                .iter()
                .filter(|s| span_name.is_none() || s.name() == span_name)
                .filter_map(|s| s.duration)
                .any(|d| d >= min && d <= max);
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct QueryRequestBuilder {
    service_name: Option<String>,
    span_name: Option<String>,
    annotation_query: Vec<AnnotationTerm>,
    min_duration: Option<u64>,
    max_duration: Option<u64>,
    end_ts: Option<u64>,
    lookback: u64,
    limit: usize,
}

impl Default for QueryRequestBuilder {
    fn default() -> Self {
        Self {
            service_name: None,
            span_name: None,
            annotation_query: Vec::new(),
            min_duration: None,
            max_duration: None,
            end_ts: None,
            lookback: DAY_MILLIS,
            limit: 10,
        }
    }
}

/// `"all"` and the empty string both mean unset.
fn normalize_name(name: String) -> Option<String> {
    let name = name.trim().to_lowercase();
    if name.is_empty() || name == "all" {
        None
    } else {
        Some(name)
    }
}

impl QueryRequestBuilder {
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = normalize_name(name.into());
        self
    }

    pub fn span_name(mut self, name: impl Into<String>) -> Self {
        self.span_name = normalize_name(name.into());
        self
    }

    pub fn annotation_query(mut self, query: &str) -> Self {
        self.annotation_query = parse_annotation_query(query);
        self
    }

    pub fn add_annotation(mut self, term: AnnotationTerm) -> Self {
        self.annotation_query.push(term);
        self
    }

    pub fn min_duration(mut self, micros: u64) -> Self {
        self.min_duration = Some(micros);
        self
    }

    pub fn max_duration(mut self, micros: u64) -> Self {
        self.max_duration = Some(micros);
        self
    }

    pub fn end_ts(mut self, epoch_millis: u64) -> Self {
        self.end_ts = Some(epoch_millis);
        self
    }

    pub fn lookback(mut self, millis: u64) -> Self {
        self.lookback = millis;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn build(self) -> Result<QueryRequest, StorageError> {
        if self.limit == 0 {
            return Err(StorageError::Validation("limit must be positive".into()));
        }
        if self.lookback == 0 {
            return Err(StorageError::Validation("lookback must be positive".into()));
        }
        match (self.min_duration, self.max_duration) {
            (None, Some(_)) => {
                return Err(StorageError::Validation(
                    "max_duration is only valid with min_duration".into(),
                ));
            }
            (Some(min), Some(max)) if max < min => {
                return Err(StorageError::Validation(
                    "max_duration must be greater than or equal to min_duration".into(),
                ));
            }
            _ => {}
        }
        if self.service_name.is_none()
            && (self.span_name.is_some() || !self.annotation_query.is_empty())
        {
            return Err(StorageError::Unsupported(
                "span name and annotation queries require a service name".into(),
            ));
        }
        let end_ts = match self.end_ts {
            Some(ts) => ts,
            None => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        };
        Ok(QueryRequest {
            service_name: self.service_name,
            span_name: self.span_name,
            annotation_query: self.annotation_query,
            min_duration: self.min_duration,
            max_duration: self.max_duration,
            end_ts,
            lookback: self.lookback.min(end_ts),
            limit: self.limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{Endpoint, SpanId, TraceId};

    const TODAY: u64 = 1_700_000_000_000;

    fn span(service: &str, name: &str, ts_ms: u64, duration: u64) -> Span {
        let mut span = Span::new(TraceId::from_u64(1), SpanId::from_u64(ts_ms));
        span.name = Some(name.into());
        span.timestamp = Some(ts_ms * 1000);
        span.duration = Some(duration);
        span.local_endpoint = Some(Endpoint::service(service));
        span
    }

    fn trace(spans: Vec<Span>) -> Trace {
        Trace {
            trace_id: TraceId::from_u64(1),
            spans,
        }
    }

    #[test]
    fn test_parse_annotation_query() {
        let terms = parse_annotation_query("error and http.method=GET and  ");
        assert_eq!(
            terms,
            vec![
                AnnotationTerm::Key("error".into()),
                AnnotationTerm::KeyValue("http.method".into(), "GET".into()),
            ]
        );
    }

    #[test]
    fn test_index_selection_prefers_tag_then_span_then_service() {
        let base = QueryRequest::builder().end_ts(TODAY).service_name("Frontend");
        let by_service = base.clone().build().unwrap();
        assert_eq!(
            by_service.index_selection(),
            IndexSelection::ByService { service: "frontend" }
        );

        let by_span = base.clone().span_name("get").build().unwrap();
        assert_eq!(
            by_span.index_selection(),
            IndexSelection::ByServiceAndSpan {
                service: "frontend",
                span_name: "get"
            }
        );

        let by_tag = base
            .span_name("get")
            .annotation_query("error and host.name=host1")
            .build()
            .unwrap();
        match by_tag.index_selection() {
            IndexSelection::ByTag { term, .. } => {
                assert_eq!(term.to_string(), "host.name=host1")
            }
            other => panic!("unexpected selection {other:?}"),
        }

        let all = QueryRequest::builder().end_ts(TODAY).build().unwrap();
        assert_eq!(all.index_selection(), IndexSelection::AllServices);
    }

    #[test]
    fn test_builder_validation() {
        assert!(matches!(
            QueryRequest::builder().limit(0).build(),
            Err(StorageError::Validation(_))
        ));
        assert!(matches!(
            QueryRequest::builder().max_duration(10).build(),
            Err(StorageError::Validation(_))
        ));
        assert!(matches!(
            QueryRequest::builder().min_duration(10).max_duration(5).build(),
            Err(StorageError::Validation(_))
        ));
        assert!(matches!(
            QueryRequest::builder().span_name("get").build(),
            Err(StorageError::Unsupported(_))
        ));
    }

    #[test]
    fn test_all_means_unset() {
        let request = QueryRequest::builder()
            .service_name("all")
            .span_name("all")
            .build()
            .unwrap();
        assert_eq!(request.service_name, None);
        assert_eq!(request.span_name, None);
    }

    #[test]
    fn test_matches_duration_and_window() {
        let t = trace(vec![
            span("frontend", "get", TODAY - 10, 150),
            span("backend", "query", TODAY - 5, 900),
        ]);
        let request = QueryRequest::builder()
            .end_ts(TODAY)
            .service_name("frontend")
            .min_duration(100)
            .max_duration(200)
            .build()
            .unwrap();
        assert!(request.test(&t));

        let too_slow = QueryRequest::builder()
            .end_ts(TODAY)
            .service_name("frontend")
            .min_duration(500)
            .build()
            .unwrap();
        assert!(!too_slow.test(&t));

        let outside = QueryRequest::builder()
            .end_ts(TODAY - 1000)
            .lookback(100)
            .service_name("frontend")
            .build()
            .unwrap();
        assert!(!outside.test(&t));
    }

    #[test]
    fn test_annotation_terms_are_scoped_to_service() {
        let mut backend = span("backend", "query", TODAY - 5, 900);
        backend.tags.insert("host.name".into(), "host1".into());
        let t = trace(vec![span("frontend", "get", TODAY - 10, 150), backend]);

        let on_backend = QueryRequest::builder()
            .end_ts(TODAY)
            .service_name("backend")
            .annotation_query("host.name=host1")
            .build()
            .unwrap();
        assert!(on_backend.test(&t));

        let on_frontend = QueryRequest::builder()
            .end_ts(TODAY)
            .service_name("frontend")
            .annotation_query("host.name=host1")
            .build()
            .unwrap();
        assert!(!on_frontend.test(&t));
    }
}
