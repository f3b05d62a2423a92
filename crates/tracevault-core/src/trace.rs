use std::collections::BTreeMap;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Decode 1..=`2 * N` lower or upper case hex digits into a right-aligned
/// big-endian byte array.
fn decode_hex<const N: usize>(s: &str) -> Result<[u8; N], StorageError> {
    if s.is_empty() || s.len() > N * 2 {
        return Err(StorageError::Validation(format!(
            "expected 1 to {} hex characters, got {:?}",
            N * 2,
            s
        )));
    }
    let mut out = [0u8; N];
    let padded = format!("{s:0>width$}", width = N * 2);
    for (i, chunk) in padded.as_bytes().chunks(2).enumerate() {
        let pair = std::str::from_utf8(chunk)
            .map_err(|_| StorageError::Validation(format!("invalid hex {s:?}")))?;
        out[i] = u8::from_str_radix(pair, 16)
            .map_err(|_| StorageError::Validation(format!("invalid hex {s:?}")))?;
    }
    Ok(out)
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for byte in bytes {
        write!(f, "{byte:02x}")?;
    }
    Ok(())
}

/// Trace identifier, 128-bit. A 64-bit identifier keeps its upper half zeroed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TraceId(pub [u8; 16]);

impl TraceId {
    pub fn from_u64(low: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[8..].copy_from_slice(&low.to_be_bytes());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn high(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out.copy_from_slice(&self.0[..8]);
        out
    }

    pub fn low(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out.copy_from_slice(&self.0[8..]);
        out
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 16]
    }

    pub fn is_64_bit(&self) -> bool {
        self.high() == [0u8; 8]
    }

    /// Drops the upper 64 bits.
    pub fn to_64_bit(&self) -> Self {
        let mut bytes = [0u8; 16];
        bytes[8..].copy_from_slice(&self.0[8..]);
        Self(bytes)
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_64_bit() {
            write_hex(f, &self.0[8..])
        } else {
            write_hex(f, &self.0)
        }
    }
}

impl FromStr for TraceId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_hex::<16>(s).map(Self)
    }
}

impl TryFrom<String> for TraceId {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TraceId> for String {
    fn from(id: TraceId) -> Self {
        id.to_string()
    }
}

/// Unique identifier for a span within a trace (64-bit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SpanId(pub [u8; 8]);

impl SpanId {
    pub fn from_u64(id: u64) -> Self {
        Self(id.to_be_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

impl FromStr for SpanId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_hex::<8>(s).map(Self)
    }
}

impl TryFrom<String> for SpanId {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SpanId> for String {
    fn from(id: SpanId) -> Self {
        id.to_string()
    }
}

/// Role of the span in an RPC or messaging exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Kind {
    Client,
    Server,
    Producer,
    Consumer,
}

impl Kind {
    /// Stable single-byte code used in storage keys. Zero is reserved for "no kind".
    pub fn code(kind: Option<Kind>) -> u8 {
        match kind {
            None => 0,
            Some(Self::Client) => 1,
            Some(Self::Server) => 2,
            Some(Self::Producer) => 3,
            Some(Self::Consumer) => 4,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Client => "CLIENT",
            Self::Server => "SERVER",
            Self::Producer => "PRODUCER",
            Self::Consumer => "CONSUMER",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<Ipv6Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl Endpoint {
    pub fn service(name: &str) -> Self {
        Self {
            service_name: Some(name.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    /// Microseconds since epoch.
    pub timestamp: u64,
    pub value: String,
}

/// One timed operation within a trace, in the v2 JSON model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Span {
    pub trace_id: TraceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<SpanId>,
    pub id: SpanId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<Kind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Microseconds since epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    /// Microseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_endpoint: Option<Endpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_endpoint: Option<Endpoint>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<Annotation>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared: Option<bool>,
}

impl Span {
    pub fn new(trace_id: TraceId, id: SpanId) -> Self {
        Self {
            trace_id,
            parent_id: None,
            id,
            kind: None,
            name: None,
            timestamp: None,
            duration: None,
            local_endpoint: None,
            remote_endpoint: None,
            annotations: Vec::new(),
            tags: BTreeMap::new(),
            debug: None,
            shared: None,
        }
    }

    /// Local service name, `None` when absent or empty.
    pub fn local_service_name(&self) -> Option<&str> {
        self.local_endpoint
            .as_ref()
            .and_then(|e| e.service_name.as_deref())
            .filter(|name| !name.is_empty())
    }

    pub fn remote_service_name(&self) -> Option<&str> {
        self.remote_endpoint
            .as_ref()
            .and_then(|e| e.service_name.as_deref())
            .filter(|name| !name.is_empty())
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref().filter(|name| !name.is_empty())
    }

    /// Timestamp used to place the span in time-bucketed indexes: the span's own
    /// timestamp, else its earliest annotation.
    pub fn index_timestamp(&self) -> Option<u64> {
        self.timestamp
            .filter(|ts| *ts != 0)
            .or_else(|| self.annotations.iter().map(|a| a.timestamp).min())
    }
}

/// Spans sharing a trace identifier, reconstructed at read time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    pub trace_id: TraceId,
    pub spans: Vec<Span>,
}

impl Trace {
    /// Earliest span timestamp, in microseconds.
    pub fn timestamp(&self) -> Option<u64> {
        self.spans.iter().filter_map(Span::index_timestamp).min()
    }

    pub fn spans_for_service<'a>(&'a self, service: &'a str) -> impl Iterator<Item = &'a Span> {
        self.spans
            .iter()
            .filter(move |s| s.local_service_name() == Some(service))
    }
}

/// Aggregated parent to child call statistics for one day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyLink {
    pub parent: String,
    pub child: String,
    pub call_count: u64,
    #[serde(default)]
    pub error_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_id_parse_pads_short_ids() {
        let id: TraceId = "a".parse().unwrap();
        assert!(id.is_64_bit());
        assert_eq!(id.to_string(), "000000000000000a");
        assert_eq!(id, TraceId::from_u64(10));
    }

    #[test]
    fn test_trace_id_128_bit_display_keeps_high_bits() {
        let hex = "463ac35c9f6413ad48485a3953bb6124";
        let id: TraceId = hex.parse().unwrap();
        assert!(!id.is_64_bit());
        assert_eq!(id.to_string(), hex);
        assert_eq!(id.to_64_bit().to_string(), "48485a3953bb6124");
    }

    #[test]
    fn test_trace_id_rejects_bad_input() {
        assert!("".parse::<TraceId>().is_err());
        assert!("xyz".parse::<TraceId>().is_err());
        assert!("1".repeat(33).parse::<TraceId>().is_err());
    }

    #[test]
    fn test_span_json_uses_v2_field_names() {
        let json = r#"{
            "traceId": "86154a4ba6e91385",
            "parentId": "86154a4ba6e91385",
            "id": "4d1e00c0db9010db",
            "kind": "CLIENT",
            "name": "get",
            "timestamp": 1472470996199000,
            "duration": 207000,
            "localEndpoint": {"serviceName": "frontend", "ipv4": "127.0.0.1"},
            "remoteEndpoint": {"serviceName": "backend", "port": 9000},
            "annotations": [{"timestamp": 1472470996238000, "value": "ws"}],
            "tags": {"http.path": "/api"}
        }"#;
        let span: Span = serde_json::from_str(json).unwrap();
        assert_eq!(span.kind, Some(Kind::Client));
        assert_eq!(span.local_service_name(), Some("frontend"));
        assert_eq!(span.remote_service_name(), Some("backend"));
        assert_eq!(span.tags.get("http.path").map(String::as_str), Some("/api"));

        let back = serde_json::to_value(&span).unwrap();
        assert_eq!(back["traceId"], "86154a4ba6e91385");
        assert_eq!(back["localEndpoint"]["serviceName"], "frontend");
        assert!(back.get("debug").is_none());
    }

    #[test]
    fn test_span_without_trace_id_fails_to_decode() {
        let json = r#"{"id": "4d1e00c0db9010db", "name": "get"}"#;
        assert!(serde_json::from_str::<Span>(json).is_err());
    }

    #[test]
    fn test_index_timestamp_falls_back_to_annotations() {
        let mut span = Span::new(TraceId::from_u64(1), SpanId::from_u64(2));
        assert_eq!(span.index_timestamp(), None);
        span.annotations.push(Annotation {
            timestamp: 20,
            value: "b".into(),
        });
        span.annotations.push(Annotation {
            timestamp: 10,
            value: "a".into(),
        });
        assert_eq!(span.index_timestamp(), Some(10));
        span.timestamp = Some(5);
        assert_eq!(span.index_timestamp(), Some(5));
    }

    #[test]
    fn test_empty_service_name_is_absent() {
        let mut span = Span::new(TraceId::from_u64(1), SpanId::from_u64(2));
        span.local_endpoint = Some(Endpoint::service(""));
        assert_eq!(span.local_service_name(), None);
    }
}
