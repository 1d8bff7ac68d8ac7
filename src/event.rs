//! Types for working with the unit of change of the engine: the Event.
//!
//! Events are opaque to the engine apart from their version, type name,
//! timestamp and metadata. Payloads are carried as JSON values and
//! serialized with stable key ordering, which the commit fingerprints
//! of [`crate::hash`] rely on.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved event type terminating a stream.
///
/// A stream whose last event carries this type accepts no further
/// appends; continuing the aggregate requires an admin continuation
/// that starts a successor stream.
pub const CLOSED_STREAM_EVENT_TYPE: &str = "EventStream.Closed";

/// Optional contextual entries attached to an [`Event`].
///
/// Keys are kept sorted so that serialized form and commit fingerprints
/// are deterministic.
pub type Metadata = BTreeMap<String, String>;

/// A single change recorded on an event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// 0-based, contiguous position of the event within its stream.
    ///
    /// Assigned by the session on append; user-constructed events start
    /// at version 0 and are re-versioned when buffered.
    pub event_version: i64,

    /// The domain name of the event, e.g. `"User.Created"`.
    pub event_type: String,

    /// The serialized domain payload. Opaque to the engine.
    pub payload: serde_json::Value,

    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,

    /// Optional contextual metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl Event {
    /// Creates a new event of the given type carrying the given payload.
    #[must_use]
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_version: 0,
            event_type: event_type.into(),
            payload,
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    /// Creates the reserved event that terminates a stream.
    #[must_use]
    pub fn close_stream() -> Self {
        Self::new(CLOSED_STREAM_EVENT_TYPE, serde_json::Value::Null)
    }

    /// Adds a new entry to the event's [`Metadata`].
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata
            .get_or_insert_with(Metadata::new)
            .insert(key.into(), value.into());
        self
    }

    /// Whether this event is the reserved stream-closing event.
    #[must_use]
    pub fn is_stream_closure(&self) -> bool {
        self.event_type == CLOSED_STREAM_EVENT_TYPE
    }
}

/// Derives an event name from an unannotated type name by splitting the
/// simple name on its internal capitalization: `UserCreated` becomes
/// `User.Created`. Names without an internal capital, or names that
/// already contain a `.`, pass through unchanged.
#[must_use]
pub fn derive_event_name(type_name: &str) -> String {
    let simple = type_name.rsplit("::").next().unwrap_or(type_name);
    if simple.contains('.') {
        return simple.to_owned();
    }

    let chars: Vec<char> = simple.chars().collect();
    for i in 1..chars.len() {
        if chars[i].is_uppercase() && chars[i - 1].is_lowercase() {
            let (prefix, rest): (String, String) =
                (chars[..i].iter().collect(), chars[i..].iter().collect());
            return format!("{prefix}.{rest}");
        }
    }

    simple.to_owned()
}
