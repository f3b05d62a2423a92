use tracevault_core::error::StorageError;
use tracevault_core::trace::{Kind, Span, TraceId};

use crate::key::KeyBuilder;

/// Lower-cases names so lookups are case-insensitive.
pub fn normalize(span: &Span) -> Span {
    let mut span = span.clone();
    span.name = span.name.map(|n| n.to_lowercase());
    for endpoint in [&mut span.local_endpoint, &mut span.remote_endpoint]
        .into_iter()
        .flatten()
    {
        endpoint.service_name = endpoint.service_name.take().map(|n| n.to_lowercase());
    }
    span
}

/// Partition prefix of a trace in the `traces` table.
///
/// Rows start with the lower 64 bits so that, when identifiers are not strict,
/// a 64-bit id finds the spans of its 128-bit counterpart.
pub fn trace_prefix(trace_id: &TraceId, strict_trace_id: bool) -> Vec<u8> {
    let builder = KeyBuilder::new().bytes(&trace_id.low());
    if strict_trace_id {
        builder.bytes(&trace_id.high()).build()
    } else {
        builder.build()
    }
}

/// Build the `traces` key: `{low (8B)}{high (8B)}{span_id (8B)}{kind (1B)}`.
pub fn span_key(span: &Span) -> Vec<u8> {
    KeyBuilder::new()
        .bytes(&span.trace_id.low())
        .bytes(&span.trace_id.high())
        .bytes(span.id.as_bytes())
        .byte(Kind::code(span.kind))
        .build()
}

pub fn encode(span: &Span) -> Result<Vec<u8>, StorageError> {
    serde_json::to_vec(span).map_err(|e| StorageError::Serialization(e.to_string()))
}

pub fn decode(value: &[u8]) -> Result<Span, StorageError> {
    serde_json::from_slice(value).map_err(|e| StorageError::Serialization(e.to_string()))
}
