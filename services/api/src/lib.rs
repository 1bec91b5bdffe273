//! Restaurant Voice Agent API Library Crate
//!
//! This library contains all the service logic for the restaurant phone agent,
//! including the application state, database access, API handlers, the Twilio
//! and Deepgram stream adapters, the call-session bridge, and routing. The
//! `api` binary is a thin wrapper around this library.

pub mod audio_utils;
pub mod config;
pub mod db;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
pub mod ws;
