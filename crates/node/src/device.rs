//! Device identity and the discovery document announced to the hub.

use anyhow::{bail, Result};
use serde::Serialize;

use crate::error::TopicError;
use crate::topic::{derive_topic, Topic, TopicKind};

/// Maximum length of a single identity field, in bytes.
pub const MAX_FIELD_LEN: usize = 50;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Immutable description of one logical device. Built once from config
/// before the first connect; never mutated afterwards.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    /// Component category the hub files this device under, e.g. "sensor"
    /// or "switch".
    pub component: String,
    /// Identifies the physical node; used to structure topics, not shown
    /// in the hub UI.
    pub node_id: String,
    /// Identifies this device on the node; gives each device its own
    /// topic subtree.
    pub object_id: String,
    /// Display name shown by the hub.
    pub name: Option<String>,
    /// Icon reference, e.g. "mdi:water-percent".
    pub icon: Option<String>,
    pub unit_of_measurement: Option<String>,
    /// Whether the device accepts remote commands. Commandable devices
    /// get a command topic; others must not.
    pub commandable: bool,
}

impl DeviceIdentity {
    /// Derive one of this device's topics.
    pub fn topic(&self, kind: TopicKind) -> Result<Topic, TopicError> {
        derive_topic(self, kind)
    }

    /// Client identifier submitted when opening the broker session.
    pub fn client_id(&self) -> String {
        format!("{}/{}", self.node_id, self.object_id)
    }

    /// Check field bounds, reporting every violation at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();
        self.collect_violations("device", &mut errors);
        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "identity validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    pub(crate) fn collect_violations(&self, label: &str, errors: &mut Vec<String>) {
        for (field, value) in [
            ("component", &self.component),
            ("node_id", &self.node_id),
            ("object_id", &self.object_id),
        ] {
            if value.trim().is_empty() {
                errors.push(format!("{label}: {field} is empty"));
            }
            if value.contains(['/', '+', '#']) {
                errors.push(format!(
                    "{label}: {field} '{value}' contains a topic separator or wildcard"
                ));
            }
        }

        for (field, value) in [
            ("component", Some(&self.component)),
            ("node_id", Some(&self.node_id)),
            ("object_id", Some(&self.object_id)),
            ("name", self.name.as_ref()),
            ("icon", self.icon.as_ref()),
            ("unit_of_measurement", self.unit_of_measurement.as_ref()),
        ] {
            if let Some(value) = value {
                if value.len() > MAX_FIELD_LEN {
                    errors.push(format!(
                        "{label}: {field} is {} chars (max {MAX_FIELD_LEN})",
                        value.len()
                    ));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Discovery document
// ---------------------------------------------------------------------------

/// The JSON document published retained on the config topic. Field names
/// are the hub's short keys; optional fields are omitted entirely when
/// unset and `cmd_t` is present exactly when the device is commandable.
#[derive(Debug, Serialize)]
pub struct DiscoveryConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,
    pub avty_t: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd_t: Option<String>,
    pub stat_t: String,
}

impl DiscoveryConfig {
    /// Derive all referenced topics and assemble the document. Fails on
    /// the first oversize topic, before anything is published.
    pub fn new(identity: &DeviceIdentity) -> Result<Self, TopicError> {
        let availability = identity.topic(TopicKind::Availability)?;
        let state = identity.topic(TopicKind::State)?;
        let command = if identity.commandable {
            Some(identity.topic(TopicKind::Command)?.into_string())
        } else {
            None
        };
        Ok(Self {
            name: identity.name.clone(),
            icon: identity.icon.clone(),
            unit_of_measurement: identity.unit_of_measurement.clone(),
            avty_t: availability.into_string(),
            cmd_t: command,
            stat_t: state.into_string(),
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
