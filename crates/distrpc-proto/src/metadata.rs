//! Call metadata: the envelope of identity carried on every request.

use tonic::metadata::{Ascii, Binary, MetadataKey, MetadataMap, MetadataValue};

use crate::identity::DistributedInvocationId;

/// Binary key carrying a 16-byte trace id.
pub const TRACE_ID_KEY: &str = "traceid-bin";
/// String key carrying the related-activity-id component of the invocation id.
pub const RELATED_ACTIVITY_ID_KEY: &str = "relatedactivityid";
/// String key carrying the environment component of the invocation id.
pub const ENVIRONMENT_KEY: &str = "environment";
/// String key carrying the engine-version component of the invocation id.
pub const ENGINE_VERSION_KEY: &str = "engineversion";
/// String key carrying the sending machine's name.
pub const SENDER_KEY: &str = "sender";
/// String key carrying the bearer token, when authentication is enabled.
pub const AUTHORIZATION_KEY: &str = "authorization";

/// A 16-byte trace id, carried binary on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TraceId([u8; 16]);

impl TraceId {
    /// Wrap a raw 16-byte trace id.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        TraceId(bytes)
    }

    /// Generate a fresh trace id.
    pub fn generate() -> Self {
        TraceId(*uuid::Uuid::new_v4().as_bytes())
    }

    /// The raw bytes of this trace id.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl Default for TraceId {
    fn default() -> Self {
        TraceId([0u8; 16])
    }
}

/// The identity fields recovered from an inbound call's metadata.
///
/// Fields a peer omitted come back as empty strings (or an all-zero trace
/// id); the reconstructed [`DistributedInvocationId`] then simply fails to
/// match the server's local id, which is the behavior the rejection path
/// relies on.
#[derive(Debug, Clone, Default)]
pub struct ParsedHeaders {
    /// The machine name the caller reported, or empty if absent.
    pub sender: String,
    /// The invocation id reconstructed from whatever subset of fields was present.
    pub invocation_id: DistributedInvocationId,
    /// The trace id, or the all-zero id if absent.
    pub trace_id: TraceId,
    /// The bearer token, or empty if absent.
    pub token: String,
}

/// Build the ordered metadata carried on every outbound call.
pub fn build_headers(
    invocation_id: &DistributedInvocationId,
    trace_id: TraceId,
    sender: &str,
    token: Option<&str>,
) -> MetadataMap {
    let mut map = MetadataMap::new();

    insert_binary(&mut map, TRACE_ID_KEY, trace_id.as_bytes());
    insert_ascii(&mut map, RELATED_ACTIVITY_ID_KEY, invocation_id.related_activity_id());
    insert_ascii(&mut map, ENVIRONMENT_KEY, invocation_id.environment());
    insert_ascii(&mut map, ENGINE_VERSION_KEY, invocation_id.engine_version());
    insert_ascii(&mut map, SENDER_KEY, sender);
    if let Some(token) = token {
        insert_ascii(&mut map, AUTHORIZATION_KEY, token);
    }

    map
}

/// Recover the identity fields from inbound metadata.
///
/// Unrecognized keys are ignored; missing recognized keys yield empty values
/// rather than an error, per the wire contract (a mismatched/absent identity
/// is a rejection decided by the caller of this function, not a parse error).
pub fn parse_headers(metadata: &MetadataMap) -> ParsedHeaders {
    let trace_id = metadata
        .get_bin(TRACE_ID_KEY)
        .and_then(|v| v.to_bytes().ok())
        .and_then(|bytes| <[u8; 16]>::try_from(bytes.as_ref()).ok())
        .map(TraceId::from_bytes)
        .unwrap_or_default();

    let related_activity_id = ascii_value(metadata, RELATED_ACTIVITY_ID_KEY);
    let environment = ascii_value(metadata, ENVIRONMENT_KEY);
    let engine_version = ascii_value(metadata, ENGINE_VERSION_KEY);
    let sender = ascii_value(metadata, SENDER_KEY);
    let token = ascii_value(metadata, AUTHORIZATION_KEY);

    ParsedHeaders {
        sender,
        invocation_id: DistributedInvocationId::new(related_activity_id, environment, engine_version),
        trace_id,
        token,
    }
}

fn ascii_value(metadata: &MetadataMap, key: &str) -> String {
    metadata
        .get(key)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn insert_ascii(map: &mut MetadataMap, key: &str, value: &str) {
    if let (Ok(key), Ok(value)) = (
        key.parse::<MetadataKey<Ascii>>(),
        MetadataValue::<Ascii>::try_from(value),
    ) {
        map.insert(key, value);
    }
}

fn insert_binary(map: &mut MetadataMap, key: &str, value: &[u8]) {
    if let Ok(key) = key.parse::<MetadataKey<Binary>>() {
        map.insert_bin(key, MetadataValue::<Binary>::from_bytes(value));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips_identity_fields() {
        let invocation_id = DistributedInvocationId::new("act-1", "prod", "1.4.0");
        let trace_id = TraceId::generate();
        let headers = build_headers(&invocation_id, trace_id, "build-agent-07", Some("s3cr3t"));

        let parsed = parse_headers(&headers);
        assert_eq!(parsed.sender, "build-agent-07");
        assert_eq!(parsed.invocation_id, invocation_id);
        assert_eq!(parsed.trace_id, trace_id);
        assert_eq!(parsed.token, "s3cr3t");
    }

    #[test]
    fn missing_fields_parse_as_empty() {
        let metadata = MetadataMap::new();
        let parsed = parse_headers(&metadata);
        assert!(parsed.sender.is_empty());
        assert!(parsed.invocation_id.is_empty());
        assert!(parsed.token.is_empty());
        assert_eq!(parsed.trace_id, TraceId::default());
    }

    #[test]
    fn no_token_omits_authorization_key() {
        let invocation_id = DistributedInvocationId::new("act", "dev", "0.1.0");
        let headers = build_headers(&invocation_id, TraceId::generate(), "host", None);
        assert!(headers.get(AUTHORIZATION_KEY).is_none());
    }
}
