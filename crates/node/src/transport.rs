//! Broker session plumbing: the transport seam, the rumqttc-backed
//! session, and the bounded-retry connection manager.
//!
//! Everything here is synchronous. The session is pumped from the duty
//! cycle's transport task; the only blocking call is
//! [`ConnectionManager::reconnect`], which belongs to the bootstrap path
//! and to callers that can tolerate the full retry budget.

use std::thread;
use std::time::{Duration, Instant};

use rumqttc::{
    Client, ConnectReturnCode, Connection, Event, MqttOptions, Packet, QoS, RecvTimeoutError,
    TryRecvError,
};
use tracing::{debug, info, warn};

use crate::error::{ConnectError, PublishError};

/// Upper bound on connection attempts per [`ConnectionManager::reconnect`].
pub const MAX_RECONNECT_TRIES: usize = 5;

/// Pause between connection attempts.
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

/// How long one attempt waits for the broker's session acknowledgement.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// One message delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Synchronous publish/subscribe transport. Production uses
/// [`MqttSession`]; tests substitute a scripted implementation.
pub trait Transport {
    fn is_connected(&self) -> bool;

    /// One connection attempt, blocking at most the transport's own
    /// per-attempt timeout. Retry policy lives in [`ConnectionManager`].
    fn connect_once(&mut self) -> Result<(), ConnectError>;

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), PublishError>;

    fn subscribe(&mut self, topic: &str) -> Result<(), PublishError>;

    /// Drain every event the broker has ready without blocking, returning
    /// inbound messages in arrival order.
    fn poll(&mut self) -> Vec<InboundMessage>;
}

// ---------------------------------------------------------------------------
// rumqttc session
// ---------------------------------------------------------------------------

pub struct MqttSession {
    client: Client,
    connection: Connection,
    connected: bool,
}

impl MqttSession {
    pub fn new(
        host: &str,
        port: u16,
        client_id: &str,
        credentials: Option<(String, String)>,
    ) -> Self {
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        if let Some((username, password)) = credentials {
            options.set_credentials(username, password);
        }
        let (client, connection) = Client::new(options, 32);
        Self {
            client,
            connection,
            connected: false,
        }
    }

    fn note_event(&mut self, event: &Event) -> Option<InboundMessage> {
        match event {
            Event::Incoming(Packet::Publish(publish)) => {
                return Some(InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                });
            }
            Event::Incoming(Packet::ConnAck(ack)) => {
                if ack.code == ConnectReturnCode::Success {
                    self.connected = true;
                    info!("broker session established");
                }
            }
            Event::Incoming(Packet::Disconnect) => {
                self.connected = false;
                warn!("broker closed the session");
            }
            _ => {}
        }
        None
    }
}

impl Transport for MqttSession {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn connect_once(&mut self) -> Result<(), ConnectError> {
        let deadline = Instant::now() + CONNECT_TIMEOUT;
        while Instant::now() < deadline {
            match self.connection.recv_timeout(Duration::from_millis(250)) {
                Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                    return match ack.code {
                        ConnectReturnCode::Success => {
                            self.connected = true;
                            Ok(())
                        }
                        ConnectReturnCode::BadUserNamePassword
                        | ConnectReturnCode::NotAuthorized => Err(ConnectError::AuthFailed),
                        other => Err(ConnectError::BrokerUnreachable(format!("{other:?}"))),
                    };
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(ConnectError::BrokerUnreachable(e.to_string())),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Err(ConnectError::LinkUnavailable),
            }
        }
        Err(ConnectError::BrokerUnreachable(
            "timed out waiting for session acknowledgement".to_string(),
        ))
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), PublishError> {
        if !self.connected {
            return Err(PublishError::NotConnected);
        }
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload.to_vec())
            .map_err(|e| PublishError::Rejected(e.to_string()))
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), PublishError> {
        if !self.connected {
            return Err(PublishError::NotConnected);
        }
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .map_err(|e| PublishError::Rejected(e.to_string()))
    }

    fn poll(&mut self) -> Vec<InboundMessage> {
        let mut inbound = Vec::new();
        loop {
            match self.connection.try_recv() {
                Ok(Ok(event)) => {
                    if let Some(msg) = self.note_event(&event) {
                        inbound.push(msg);
                    }
                }
                Ok(Err(e)) => {
                    self.connected = false;
                    debug!("transport error while pumping: {e}");
                    break;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        inbound
    }
}

// ---------------------------------------------------------------------------
// Connection manager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Sole owner of the transport session. All binding traffic goes through
/// here; `reconnect` is the one place session state transitions happen.
pub struct ConnectionManager<T: Transport> {
    transport: T,
    client_id: String,
    state: ConnectionState,
    max_tries: usize,
    retry_delay: Duration,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: T, client_id: impl Into<String>) -> Self {
        Self {
            transport,
            client_id: client_id.into(),
            state: ConnectionState::Disconnected,
            max_tries: MAX_RECONNECT_TRIES,
            retry_delay: RETRY_DELAY,
        }
    }

    /// Override the retry budget (tests use a zero delay).
    pub fn with_retry(mut self, max_tries: usize, retry_delay: Duration) -> Self {
        self.max_tries = max_tries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Ensure a live session. No-op success when already connected;
    /// otherwise up to `max_tries` attempts separated by `retry_delay`.
    /// May block for the full budget, so steady-state tasks must already
    /// hold a connection or accept the pause.
    pub fn reconnect(&mut self) -> bool {
        if self.transport.is_connected() {
            self.state = ConnectionState::Connected;
            return true;
        }
        self.state = ConnectionState::Connecting;
        for attempt in 1..=self.max_tries {
            match self.transport.connect_once() {
                Ok(()) => {
                    info!(client_id = %self.client_id, attempt, "connected to broker");
                    self.state = ConnectionState::Connected;
                    return true;
                }
                Err(e) => {
                    warn!(
                        client_id = %self.client_id,
                        attempt,
                        max = self.max_tries,
                        "connect failed: {e}"
                    );
                    if attempt < self.max_tries {
                        thread::sleep(self.retry_delay);
                    }
                }
            }
        }
        self.state = ConnectionState::Disconnected;
        false
    }

    pub fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<(), PublishError> {
        self.transport.publish(topic, payload, retain)
    }

    pub fn subscribe(&mut self, topic: &str) -> Result<(), PublishError> {
        self.transport.subscribe(topic)
    }

    /// Pump the session and hand back inbound messages. Non-blocking.
    pub fn poll(&mut self) -> Vec<InboundMessage> {
        let inbound = self.transport.poll();
        self.state = if self.transport.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        inbound
    }

    #[cfg(test)]
    pub(crate) fn transport(&self) -> &T {
        &self.transport
    }

    #[cfg(test)]
    pub(crate) fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

// ===========================================================================
// Test support
// ===========================================================================


// ===========================================================================
// Tests
// ===========================================================================
