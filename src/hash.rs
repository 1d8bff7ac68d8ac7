//! Commit fingerprints and the hash chain used for optimistic
//! concurrency.
//!
//! Every successful commit advances a per-document chain of SHA-256
//! fingerprints: the new fingerprint covers the previous one plus a
//! canonical encoding of the committed event batch. Comparing the chain
//! head against the value recorded alongside the stream data detects
//! concurrent writers without coordination.
//!
//! The canonical encoding is frozen: per event, the decimal version,
//! event type, compact JSON payload (object keys sorted), RFC 3339
//! timestamp with microsecond precision in UTC, and `key=value`
//! metadata pairs in ascending key order joined by `;`, one line each,
//! with events terminated by a `--` line. An absent previous
//! fingerprint hashes as the empty string. Changing any of this breaks
//! the chain for existing data.

use chrono::SecondsFormat;
use sha2::{Digest, Sha256};

use crate::event::Event;

/// The wildcard sentinel. A stored or expected fingerprint equal to
/// this value disables the chain comparison for that commit, which
/// supports bootstrap, migration and external imports.
pub const WILDCARD: &str = "*";

/// Whether the given fingerprint slot holds the wildcard sentinel.
#[must_use]
pub fn is_wildcard(fingerprint: Option<&str>) -> bool {
    fingerprint == Some(WILDCARD)
}

/// Compares the fingerprint recorded in the stream data against the
/// one the writer expects the document to carry. The wildcard sentinel
/// on either side short-circuits the comparison to success.
#[must_use]
pub fn chain_matches(stored: Option<&str>, expected: Option<&str>) -> bool {
    if is_wildcard(stored) || is_wildcard(expected) {
        return true;
    }
    stored == expected
}

/// Computes the fingerprint of a commit: the SHA-256 of the previous
/// fingerprint followed by the canonical encoding of the event batch,
/// as a lowercase hex string.
#[must_use]
pub fn commit_fingerprint(previous: Option<&str>, events: &[Event]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(previous.unwrap_or_default().as_bytes());
    hasher.update(canonical_bytes(events));
    hex::encode(hasher.finalize())
}

/// The frozen canonical encoding of an event batch. See the module
/// documentation for the exact layout.
pub(crate) fn canonical_bytes(events: &[Event]) -> Vec<u8> {
    let mut buffer = Vec::new();

    for event in events {
        buffer.extend_from_slice(event.event_version.to_string().as_bytes());
        buffer.push(b'\n');
        buffer.extend_from_slice(event.event_type.as_bytes());
        buffer.push(b'\n');

        // serde_json::Map is ordered, so payload bytes are deterministic.
        let payload =
            serde_json::to_vec(&event.payload).expect("json payload serialization cannot fail");
        buffer.extend_from_slice(&payload);
        buffer.push(b'\n');

        let timestamp = event
            .timestamp
            .to_rfc3339_opts(SecondsFormat::Micros, true);
        buffer.extend_from_slice(timestamp.as_bytes());
        buffer.push(b'\n');

        if let Some(metadata) = &event.metadata {
            let joined = metadata
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect::<Vec<_>>()
                .join(";");
            buffer.extend_from_slice(joined.as_bytes());
        }
        buffer.push(b'\n');
        buffer.extend_from_slice(b"--\n");
    }

    buffer
}

/// This error is returned by a commit when the fingerprint recorded in
/// the stream data does not match the one the writer expected, or when
/// the backend rejected a precondition-guarded write.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "expected fingerprint {expected:?}, found {actual:?} \
     (precondition failure: {precondition})"
)]
pub struct ConflictError {
    /// The fingerprint the writer expected to find.
    pub expected: Option<String>,
    /// The fingerprint (or precondition token) actually found.
    pub actual: Option<String>,
    /// Whether the conflict was detected by the backend precondition
    /// rather than the hash-chain comparison.
    pub precondition: bool,
}

impl ConflictError {
    pub(crate) fn chain(expected: Option<&str>, actual: Option<&str>) -> Self {
        Self {
            expected: expected.map(str::to_owned),
            actual: actual.map(str::to_owned),
            precondition: false,
        }
    }

    pub(crate) fn precondition() -> Self {
        Self {
            expected: None,
            actual: None,
            precondition: true,
        }
    }

    /// Whether the conflict came from a backend precondition failure.
    #[must_use]
    pub fn is_precondition(&self) -> bool {
        self.precondition
    }
}

#[cfg(test)]
mod test {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn fixed_event(version: i64) -> Event {
        let mut event = Event::new("User.Created", json!({"name": "A", "age": 7}))
            .with_metadata("b", "2")
            .with_metadata("a", "1");
        event.event_version = version;
        event.timestamp = chrono::Utc
            .with_ymd_and_hms(2024, 5, 17, 12, 30, 45)
            .single()
            .expect("valid timestamp");
        event
    }

    #[test]
    fn wildcard_disables_the_comparison_on_either_side() {
        assert!(chain_matches(Some(WILDCARD), Some("abc")));
        assert!(chain_matches(Some("abc"), Some(WILDCARD)));
        assert!(chain_matches(Some(WILDCARD), None));
        assert!(chain_matches(None, Some(WILDCARD)));
    }

    #[test]
    fn matching_and_mismatching_fingerprints() {
        assert!(chain_matches(Some("abc"), Some("abc")));
        assert!(chain_matches(None, None));
        assert!(!chain_matches(Some("abc"), Some("def")));
        assert!(!chain_matches(Some("abc"), None));
        assert!(!chain_matches(None, Some("abc")));
    }

    #[test]
    fn fingerprints_are_deterministic() {
        let events = vec![fixed_event(0), fixed_event(1)];
        let first = commit_fingerprint(None, &events);
        let second = commit_fingerprint(None, &events);

        assert_eq!(first, second);
        assert_eq!(64, first.len());
    }

    #[test]
    fn fingerprint_covers_the_previous_link() {
        let events = vec![fixed_event(0)];
        let genesis = commit_fingerprint(None, &events);
        let chained = commit_fingerprint(Some(&genesis), &events);

        assert_ne!(genesis, chained);
    }

    #[test]
    fn fingerprint_is_sensitive_to_every_covered_field() {
        let base = vec![fixed_event(0)];
        let reference = commit_fingerprint(None, &base);

        let mut versioned = base.clone();
        versioned[0].event_version = 1;
        assert_ne!(reference, commit_fingerprint(None, &versioned));

        let mut retyped = base.clone();
        retyped[0].event_type = "User.Renamed".to_owned();
        assert_ne!(reference, commit_fingerprint(None, &retyped));

        let mut repayloaded = base.clone();
        repayloaded[0].payload = json!({"name": "B"});
        assert_ne!(reference, commit_fingerprint(None, &repayloaded));

        let mut remetadatad = base;
        remetadatad[0] = remetadatad[0].clone().with_metadata("c", "3");
        assert_ne!(reference, commit_fingerprint(None, &remetadatad));
    }

    #[test]
    fn metadata_order_does_not_affect_the_fingerprint() {
        let mut forward = fixed_event(0);
        forward.metadata = None;
        let forward = forward.with_metadata("a", "1").with_metadata("b", "2");

        let mut reverse = fixed_event(0);
        reverse.metadata = None;
        let reverse = reverse.with_metadata("b", "2").with_metadata("a", "1");

        assert_eq!(
            commit_fingerprint(None, &[forward]),
            commit_fingerprint(None, &[reverse]),
        );
    }
}
