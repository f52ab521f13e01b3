//! Server trailers returned on error responses.
//!
//! Trailers are read as a plain map lookup, never by parsing strings beyond
//! the boolean `"1"`/`"0"` convention below.

use tonic::metadata::MetadataMap;

/// Trailer set by the server when a call cannot be retried and the caller
/// should tear its side down.
pub const IS_UNRECOVERABLE_ERROR_KEY: &str = "isunrecoverableerror";
/// Trailer set by the server when the caller's invocation id did not match;
/// this call must not be retried, but the channel may still serve others.
pub const INVOCATION_ID_MISMATCH_KEY: &str = "invocationidmismatch";

const TRUE: &str = "1";

/// Set a boolean trailer to `"1"`.
pub fn set_flag(trailers: &mut MetadataMap, key: &str) {
    if let Ok(value) = TRUE.parse() {
        if let Ok(key) = key.parse() {
            trailers.insert(key, value);
        }
    }
}

/// Read a boolean trailer, treating anything other than `"1"` (including
/// absence) as false.
pub fn flag_is_set(trailers: &MetadataMap, key: &str) -> bool {
    trailers.get(key).and_then(|v| v.to_str().ok()) == Some(TRUE)
}

/// True if the server marked this failure unrecoverable.
pub fn is_unrecoverable_error(trailers: &MetadataMap) -> bool {
    flag_is_set(trailers, IS_UNRECOVERABLE_ERROR_KEY)
}

/// True if the server rejected the call for an invocation id mismatch.
pub fn is_invocation_id_mismatch(trailers: &MetadataMap) -> bool {
    flag_is_set(trailers, INVOCATION_ID_MISMATCH_KEY)
}

/// Build the trailer set for an invocation-id-mismatch rejection.
pub fn invocation_id_mismatch_trailers() -> MetadataMap {
    let mut trailers = MetadataMap::new();
    set_flag(&mut trailers, INVOCATION_ID_MISMATCH_KEY);
    set_flag(&mut trailers, IS_UNRECOVERABLE_ERROR_KEY);
    trailers
}

/// Build the trailer set for an unrecoverable-failure rejection (auth
/// failure, unhandled handler exception, peer-reported unrecoverable error).
pub fn unrecoverable_trailers() -> MetadataMap {
    let mut trailers = MetadataMap::new();
    set_flag(&mut trailers, IS_UNRECOVERABLE_ERROR_KEY);
    trailers
}
