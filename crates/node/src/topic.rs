//! Topic derivation for the hub binding.
//!
//! Every topic follows the grammar
//! `"<prefix>/<component>/<node_id>/<object_id>[/<suffix>]"` where the
//! suffix selects the channel (`config`, `available`, `stat`, `cmd`).
//! Derivation is a pure function of the device identity: no I/O, and the
//! length budget is checked before each segment is appended, so the result
//! is either a complete topic within [`MAX_TOPIC_LEN`] or `TooLong`.

use std::fmt;

use crate::device::DeviceIdentity;
use crate::error::TopicError;

/// Hard upper bound on a derived topic, in bytes.
pub const MAX_TOPIC_LEN: usize = 150;

/// First segment of every topic; the hub watches this subtree for
/// discovery announcements.
pub const DISCOVERY_PREFIX: &str = "homeassistant";

// ---------------------------------------------------------------------------
// Topic kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    /// `<prefix>/<component>/<node_id>/<object_id>` with no suffix.
    Base,
    /// Retained JSON discovery document.
    Config,
    /// Retained `"online"` / `"offline"` marker.
    Availability,
    /// Retained sensor/actuator value as text.
    State,
    /// Inbound commands; only derived for commandable identities.
    Command,
}

impl TopicKind {
    fn suffix(self) -> &'static str {
        match self {
            TopicKind::Base => "",
            TopicKind::Config => "config",
            TopicKind::Availability => "available",
            TopicKind::State => "stat",
            TopicKind::Command => "cmd",
        }
    }
}

// ---------------------------------------------------------------------------
// Topic
// ---------------------------------------------------------------------------

/// A fully derived topic, guaranteed to fit [`MAX_TOPIC_LEN`]. Only
/// constructible through [`derive_topic`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic(String);

impl Topic {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Bounded builder
// ---------------------------------------------------------------------------

/// Accumulates topic segments against the length budget. All topic
/// construction funnels through `push` so the bound is enforced in exactly
/// one place.
struct TopicBuilder {
    buf: String,
}

impl TopicBuilder {
    fn new() -> Self {
        Self { buf: String::new() }
    }

    /// Append `segment` only if the result still fits the budget; on
    /// overflow nothing is appended.
    fn push(&mut self, segment: &str) -> Result<(), TopicError> {
        let would_be = self.buf.len() + segment.len();
        if would_be > MAX_TOPIC_LEN {
            return Err(TopicError::TooLong { would_be });
        }
        self.buf.push_str(segment);
        Ok(())
    }

    fn finish(self) -> Topic {
        Topic(self.buf)
    }
}

/// Derive the topic of the given kind for `identity`.
pub fn derive_topic(identity: &DeviceIdentity, kind: TopicKind) -> Result<Topic, TopicError> {
    let mut builder = TopicBuilder::new();
    builder.push(DISCOVERY_PREFIX)?;
    builder.push("/")?;
    builder.push(&identity.component)?;
    builder.push("/")?;
    builder.push(&identity.node_id)?;
    builder.push("/")?;
    builder.push(&identity.object_id)?;
    let suffix = kind.suffix();
    if !suffix.is_empty() {
        builder.push("/")?;
        builder.push(suffix)?;
    }
    Ok(builder.finish())
}

// ===========================================================================
// Tests
// ===========================================================================
