//! Device-side binding protocol: discovery announcement, availability
//! markers, retained state publishes, and the command channel.
//!
//! One [`DeviceBinding`] per logical device (the moisture sensor and the
//! pump relay each get their own), all sharing the connection manager.
//! Every hub-facing value is published retained, so a missed update heals
//! itself once connectivity returns.

use tracing::{debug, info, warn};

use crate::device::{DeviceIdentity, DiscoveryConfig};
use crate::error::{BindingError, PublishError};
use crate::topic::{Topic, TopicKind};
use crate::transport::{ConnectionManager, InboundMessage, Transport};

/// Longest command payload handed to a handler; longer payloads are
/// truncated at a character boundary.
pub const MAX_COMMAND_LEN: usize = 64;

/// Last availability marker this process believes it published. Never
/// read back from the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityState {
    Unknown,
    Online,
    Offline,
}

pub type CommandHandler = Box<dyn FnMut(&str)>;

pub struct DeviceBinding {
    identity: DeviceIdentity,
    availability: AvailabilityState,
    announced: bool,
    handler: Option<CommandHandler>,
    /// Cached once `subscribe_commands` succeeds; dispatch matches against
    /// this exact string.
    command_topic: Option<Topic>,
}

impl DeviceBinding {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            availability: AvailabilityState::Unknown,
            announced: false,
            handler: None,
            command_topic: None,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn availability(&self) -> AvailabilityState {
        self.availability
    }

    pub fn announced(&self) -> bool {
        self.announced
    }

    // -----------------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------------

    /// Register this device with the hub: ensure a session, derive every
    /// referenced topic (failing fast if any is oversize), then publish the
    /// discovery document retained. A derivation failure aborts before any
    /// publish, so partial announcements never go out.
    pub fn announce<T: Transport>(
        &mut self,
        conn: &mut ConnectionManager<T>,
    ) -> Result<(), BindingError> {
        if !conn.reconnect() {
            return Err(BindingError::Unreachable);
        }
        let config = DiscoveryConfig::new(&self.identity)?;
        let config_topic = self.identity.topic(TopicKind::Config)?;
        let payload = serde_json::to_vec(&config)
            .map_err(|e| PublishError::Rejected(e.to_string()))?;
        conn.publish(config_topic.as_str(), &payload, true)?;
        self.announced = true;
        info!(topic = %config_topic, object_id = %self.identity.object_id, "announced discovery config");
        Ok(())
    }

    /// Clear the retained discovery document so the hub forgets this
    /// device.
    pub fn remove<T: Transport>(
        &mut self,
        conn: &mut ConnectionManager<T>,
    ) -> Result<(), BindingError> {
        let config_topic = self.identity.topic(TopicKind::Config)?;
        conn.publish(config_topic.as_str(), b"", true)?;
        self.announced = false;
        info!(topic = %config_topic, "removed discovery config");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Availability
    // -----------------------------------------------------------------------

    /// Publish the retained `"online"` marker. Idempotent; failures are
    /// logged and the device keeps running with degraded visibility.
    pub fn make_available<T: Transport>(&mut self, conn: &mut ConnectionManager<T>) {
        self.set_availability(conn, AvailabilityState::Online, b"online");
    }

    /// Publish the retained `"offline"` marker. Idempotent, non-fatal.
    pub fn make_unavailable<T: Transport>(&mut self, conn: &mut ConnectionManager<T>) {
        self.set_availability(conn, AvailabilityState::Offline, b"offline");
    }

    fn set_availability<T: Transport>(
        &mut self,
        conn: &mut ConnectionManager<T>,
        state: AvailabilityState,
        payload: &[u8],
    ) {
        let topic = match self.identity.topic(TopicKind::Availability) {
            Ok(t) => t,
            Err(e) => {
                warn!(object_id = %self.identity.object_id, "availability topic invalid: {e}");
                return;
            }
        };
        match conn.publish(topic.as_str(), payload, true) {
            Ok(()) => {
                self.availability = state;
                debug!(topic = %topic, ?state, "availability updated");
            }
            Err(e) => {
                warn!(topic = %topic, "availability publish failed, continuing degraded: {e}");
            }
        }
    }

    // -----------------------------------------------------------------------
    // State channel
    // -----------------------------------------------------------------------

    /// Publish `value` retained on the state topic. A failure here is
    /// non-fatal: the next sampling cycle publishes again and the retained
    /// value catches subscribers up.
    pub fn publish_state<T: Transport>(
        &mut self,
        conn: &mut ConnectionManager<T>,
        value: &str,
    ) -> Result<(), BindingError> {
        if !conn.reconnect() {
            return Err(BindingError::Unreachable);
        }
        let topic = self.identity.topic(TopicKind::State)?;
        conn.publish(topic.as_str(), value.as_bytes(), true)?;
        debug!(topic = %topic, value, "state published");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Command channel
    // -----------------------------------------------------------------------

    /// Subscribe the command topic and register `handler` for inbound
    /// commands. Only valid on commandable identities.
    pub fn subscribe_commands<T: Transport>(
        &mut self,
        conn: &mut ConnectionManager<T>,
        handler: CommandHandler,
    ) -> Result<(), BindingError> {
        if !self.identity.commandable {
            return Err(BindingError::NotCommandable);
        }
        let topic = self.identity.topic(TopicKind::Command)?;
        conn.subscribe(topic.as_str())?;
        info!(topic = %topic, "subscribed command topic");
        self.command_topic = Some(topic);
        self.handler = Some(handler);
        Ok(())
    }

    /// Route one inbound message. Only messages whose topic equals the
    /// subscribed command topic exactly are handled; everything else is
    /// silently ignored, since other channels may own those topics.
    pub fn dispatch(&mut self, msg: &InboundMessage) {
        let Some(command_topic) = &self.command_topic else {
            return;
        };
        if msg.topic != command_topic.as_str() {
            return;
        }
        let command = bounded_command(&msg.payload);
        match &mut self.handler {
            Some(handler) => {
                debug!(topic = %msg.topic, command = %command, "dispatching command");
                handler(&command);
            }
            None => warn!(topic = %msg.topic, "command dropped: no handler registered"),
        }
    }
}

/// Convert a raw payload into a bounded command string. Invalid UTF-8 is
/// replaced rather than rejected; the relay treats anything that is not
/// exactly `"ON"` as off anyway.
fn bounded_command(payload: &[u8]) -> String {
    let text = String::from_utf8_lossy(payload);
    if text.len() <= MAX_COMMAND_LEN {
        text.into_owned()
    } else {
        text.chars().take(MAX_COMMAND_LEN).collect()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    use super::*;
    use crate::transport::testing::MockTransport;

    fn sensor_identity() -> DeviceIdentity {
        DeviceIdentity {
            component: "sensor".to_string(),
            node_id: "esp1".to_string(),
            object_id: "moisture1".to_string(),
            name: Some("Soil moisture".to_string()),
            icon: None,
            unit_of_measurement: Some("V".to_string()),
            commandable: false,
        }
    }

    fn relay_identity() -> DeviceIdentity {
        DeviceIdentity {
            component: "switch".to_string(),
            node_id: "esp1".to_string(),
            object_id: "relay1".to_string(),
            name: Some("Pump switch".to_string()),
            icon: None,
            unit_of_measurement: None,
            commandable: true,
        }
    }

    fn connected() -> ConnectionManager<MockTransport> {
        ConnectionManager::new(MockTransport::connected(), "esp1/moisture1")
            .with_retry(2, Duration::ZERO)
    }

    fn unreachable() -> ConnectionManager<MockTransport> {
        ConnectionManager::new(MockTransport::unreachable(), "esp1/moisture1")
            .with_retry(2, Duration::ZERO)
    }

    // -- announce -----------------------------------------------------------

    #[test]
    fn announce_publishes_one_retained_config() {
        let mut conn = connected();
        let mut binding = DeviceBinding::new(relay_identity());
        binding.announce(&mut conn).unwrap();

        let published = conn.transport().published_strings();
        assert_eq!(published.len(), 1);
        let (topic, payload, retain) = &published[0];
        assert_eq!(topic, "homeassistant/switch/esp1/relay1/config");
        assert!(retain);

        let doc: serde_json::Value = serde_json::from_str(payload).unwrap();
        assert_eq!(doc["avty_t"], "homeassistant/switch/esp1/relay1/available");
        assert_eq!(doc["stat_t"], "homeassistant/switch/esp1/relay1/stat");
        assert_eq!(doc["cmd_t"], "homeassistant/switch/esp1/relay1/cmd");
        assert!(binding.announced());
    }

    #[test]
    fn announce_omits_command_topic_for_sensor() {
        let mut conn = connected();
        let mut binding = DeviceBinding::new(sensor_identity());
        binding.announce(&mut conn).unwrap();

        let (_, payload, _) = &conn.transport().published_strings()[0];
        let doc: serde_json::Value = serde_json::from_str(payload).unwrap();
        assert!(doc.get("cmd_t").is_none());
    }

    #[test]
    fn announce_aborts_on_oversize_topic_without_publishing() {
        let mut identity = sensor_identity();
        identity.object_id = "a".repeat(200);
        let mut conn = connected();
        let mut binding = DeviceBinding::new(identity);

        let err = binding.announce(&mut conn).unwrap_err();
        assert!(matches!(err, BindingError::Topic(_)));
        assert!(conn.transport().published.is_empty());
        assert!(!binding.announced());
    }

    #[test]
    fn announce_fails_when_broker_unreachable() {
        let mut conn = unreachable();
        let mut binding = DeviceBinding::new(sensor_identity());
        assert_eq!(
            binding.announce(&mut conn),
            Err(BindingError::Unreachable)
        );
        assert!(conn.transport().published.is_empty());
    }

    #[test]
    fn remove_clears_retained_config() {
        let mut conn = connected();
        let mut binding = DeviceBinding::new(relay_identity());
        binding.announce(&mut conn).unwrap();
        binding.remove(&mut conn).unwrap();

        let published = conn.transport().published_strings();
        assert_eq!(published.len(), 2);
        assert_eq!(published[1].0, "homeassistant/switch/esp1/relay1/config");
        assert_eq!(published[1].1, "");
        assert!(!binding.announced());
    }

    // -- availability -------------------------------------------------------

    #[test]
    fn make_available_publishes_retained_online() {
        let mut conn = connected();
        let mut binding = DeviceBinding::new(sensor_identity());
        binding.make_available(&mut conn);

        assert_eq!(binding.availability(), AvailabilityState::Online);
        assert_eq!(
            conn.transport().published_strings(),
            vec![(
                "homeassistant/sensor/esp1/moisture1/available".to_string(),
                "online".to_string(),
                true
            )]
        );
    }

    #[test]
    fn make_unavailable_publishes_retained_offline() {
        let mut conn = connected();
        let mut binding = DeviceBinding::new(sensor_identity());
        binding.make_unavailable(&mut conn);

        assert_eq!(binding.availability(), AvailabilityState::Offline);
        assert_eq!(conn.transport().published_strings()[0].1, "offline");
    }

    #[test]
    fn availability_is_idempotent() {
        let mut conn = connected();
        let mut binding = DeviceBinding::new(sensor_identity());
        binding.make_available(&mut conn);
        binding.make_available(&mut conn);
        assert_eq!(binding.availability(), AvailabilityState::Online);
        assert_eq!(conn.transport().published.len(), 2);
    }

    #[test]
    fn availability_failure_is_nonfatal() {
        let mut conn = connected();
        conn.transport_mut().fail_publish = true;
        let mut binding = DeviceBinding::new(sensor_identity());
        binding.make_available(&mut conn);
        // Marker state is only updated on a successful publish.
        assert_eq!(binding.availability(), AvailabilityState::Unknown);
    }

    // -- state channel ------------------------------------------------------

    #[test]
    fn publish_state_scenario() {
        let mut conn = connected();
        let mut binding = DeviceBinding::new(relay_identity());
        binding.publish_state(&mut conn, "22.50").unwrap();

        assert_eq!(
            conn.transport().published_strings(),
            vec![(
                "homeassistant/switch/esp1/relay1/stat".to_string(),
                "22.50".to_string(),
                true
            )]
        );
    }

    #[test]
    fn publish_state_fails_when_unreachable() {
        let mut conn = unreachable();
        let mut binding = DeviceBinding::new(sensor_identity());
        assert_eq!(
            binding.publish_state(&mut conn, "1.23"),
            Err(BindingError::Unreachable)
        );
    }

    // -- command channel ----------------------------------------------------

    #[test]
    fn subscribe_commands_rejects_non_commandable() {
        let mut conn = connected();
        let mut binding = DeviceBinding::new(sensor_identity());
        let err = binding
            .subscribe_commands(&mut conn, Box::new(|_| {}))
            .unwrap_err();
        assert_eq!(err, BindingError::NotCommandable);
        assert!(conn.transport().subscribed.is_empty());
    }

    #[test]
    fn subscribe_commands_subscribes_exact_topic() {
        let mut conn = connected();
        let mut binding = DeviceBinding::new(relay_identity());
        binding
            .subscribe_commands(&mut conn, Box::new(|_| {}))
            .unwrap();
        assert_eq!(
            conn.transport().subscribed,
            vec!["homeassistant/switch/esp1/relay1/cmd".to_string()]
        );
    }

    #[test]
    fn dispatch_invokes_handler_on_exact_match_only() {
        let mut conn = connected();
        let mut binding = DeviceBinding::new(relay_identity());
        let seen: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        binding
            .subscribe_commands(&mut conn, Box::new(move |cmd| sink.borrow_mut().push(cmd.to_string())))
            .unwrap();

        binding.dispatch(&InboundMessage {
            topic: "homeassistant/switch/esp1/relay1/cmd".to_string(),
            payload: b"ON".to_vec(),
        });
        binding.dispatch(&InboundMessage {
            topic: "homeassistant/switch/esp1/relay1/stat".to_string(),
            payload: b"OFF".to_vec(),
        });
        binding.dispatch(&InboundMessage {
            topic: "homeassistant/switch/esp1/other/cmd".to_string(),
            payload: b"OFF".to_vec(),
        });

        assert_eq!(*seen.borrow(), vec!["ON".to_string()]);
    }

    #[test]
    fn dispatch_without_subscription_ignores_everything() {
        let mut binding = DeviceBinding::new(relay_identity());
        // No subscription, so nothing can match; must not panic.
        binding.dispatch(&InboundMessage {
            topic: "homeassistant/switch/esp1/relay1/cmd".to_string(),
            payload: b"ON".to_vec(),
        });
    }

    // -- bounded_command ----------------------------------------------------

    #[test]
    fn bounded_command_passes_short_payloads() {
        assert_eq!(bounded_command(b"ON"), "ON");
    }

    #[test]
    fn bounded_command_truncates_long_payloads() {
        let long = "x".repeat(MAX_COMMAND_LEN + 40);
        assert_eq!(bounded_command(long.as_bytes()).len(), MAX_COMMAND_LEN);
    }

    #[test]
    fn bounded_command_replaces_invalid_utf8() {
        assert_eq!(bounded_command(&[0xff, 0xfe]), "\u{fffd}\u{fffd}");
    }
}
