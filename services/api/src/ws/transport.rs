//! Transport seams between the session bridge and the outside world.
//!
//! Each external connection is split into a read half and a write half so the
//! bridge can drive them from independent tasks. Adapters normalize their wire
//! formats into `AudioFrame`s and `ControlEvent`s before anything reaches the
//! bridge.

use async_trait::async_trait;
use restaurant_core::{AudioFrame, ControlEvent};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("malformed message: {0}")]
    Protocol(String),
    #[error("connection closed")]
    Closed,
}

/// Something the telephony leg produced.
#[derive(Debug, Clone, PartialEq)]
pub enum TelephonyEvent {
    Audio(AudioFrame),
    Control(ControlEvent),
}

/// Something the agent leg produced.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Audio(AudioFrame),
    Control(ControlEvent),
}

/// Read half of the telephony media stream.
///
/// `recv` must be cancel-safe: the bridge wraps it in timeouts and `select!`.
#[async_trait]
pub trait TelephonySource: Send {
    /// Next event from the caller's leg, or `Ok(None)` once the call hung up.
    async fn recv(&mut self) -> Result<Option<TelephonyEvent>, TransportError>;
}

/// Write half of the telephony media stream.
#[async_trait]
pub trait TelephonySink: Send {
    async fn send_audio(&mut self, frame: AudioFrame) -> Result<(), TransportError>;
    /// Delivers a control event; adapters ignore events they have no wire form for.
    async fn send_event(&mut self, event: ControlEvent) -> Result<(), TransportError>;
    async fn close(&mut self);
}

/// Read half of the voice-agent connection. Must be cancel-safe.
#[async_trait]
pub trait AgentSource: Send {
    async fn recv(&mut self) -> Result<Option<AgentEvent>, TransportError>;
}

/// Write half of the voice-agent connection.
#[async_trait]
pub trait AgentSink: Send {
    async fn send_audio(&mut self, frame: AudioFrame) -> Result<(), TransportError>;
    async fn send_event(&mut self, event: ControlEvent) -> Result<(), TransportError>;
    /// Keeps an idle connection open. The default does nothing.
    async fn keep_alive(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
    async fn close(&mut self);
}

/// Both halves of the telephony leg, as accepted from the media stream.
pub struct TelephonyStream {
    pub source: Box<dyn TelephonySource>,
    pub sink: Box<dyn TelephonySink>,
}

/// Both halves of the agent leg.
pub struct AgentStream {
    pub source: Box<dyn AgentSource>,
    pub sink: Box<dyn AgentSink>,
}
