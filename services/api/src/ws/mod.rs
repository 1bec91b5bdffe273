//! Call handling over WebSockets.
//!
//! - `protocol`: Twilio Media Streams message format.
//! - `transport`: read/write traits the bridge drives, one pair per call leg.
//! - `telephony`: the Twilio adapter.
//! - `provider`: voice-agent adapters (Deepgram).
//! - `bridge`: the per-call session bridge and its lifecycle.
//! - `session`: accepts a Twilio socket, connects the agent, runs the bridge.

pub mod bridge;
pub mod protocol;
pub mod provider;
pub mod session;
pub mod telephony;
pub mod transport;

pub use session::ws_handler;
