//! Twilio Media Streams adapter.
//!
//! Inbound JSON events become `TelephonyEvent`s; caller audio is regrouped
//! into larger chunks and run through a local energy detector so barge-in
//! does not have to wait for the agent's own speech detection.

use super::{
    protocol::{ErrorBody, OutboundMedia, TwilioInbound, TwilioOutbound, parse_numeric},
    transport::{TelephonyEvent, TelephonySink, TelephonySource, TransportError},
};
use crate::audio_utils::{self, ActivityChange, CallerActivity, FrameChunker};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{
    Sink, SinkExt, Stream, StreamExt,
    stream::{SplitSink, SplitStream},
};
use restaurant_core::{AudioFrame, ControlEvent, Direction};
use std::{
    collections::VecDeque,
    fmt::Display,
    sync::{Arc, OnceLock},
};
use tracing::{debug, info, warn};

/// Consecutive malformed messages tolerated unless configured otherwise.
const DEFAULT_MAX_MALFORMED: u32 = 5;

/// Splits an upgraded Twilio socket into the bridge's two halves.
pub fn split(
    socket: WebSocket,
    chunk_bytes: usize,
    vad_threshold: u16,
    max_malformed: u32,
) -> (
    TwilioSource<SplitStream<WebSocket>>,
    TwilioSink<SplitSink<WebSocket, Message>>,
) {
    let (sink, stream) = socket.split();
    let stream_sid = Arc::new(OnceLock::new());
    (
        TwilioSource::new(stream, stream_sid.clone(), chunk_bytes, vad_threshold)
            .with_malformed_limit(max_malformed),
        TwilioSink::new(sink, stream_sid),
    )
}

pub struct TwilioSource<S> {
    stream: S,
    stream_sid: Arc<OnceLock<String>>,
    chunker: FrameChunker,
    activity: CallerActivity,
    pending: VecDeque<TelephonyEvent>,
    last_sequence: u64,
    malformed: u32,
    max_malformed: u32,
    finished: bool,
}

impl<S> TwilioSource<S> {
    pub fn new(
        stream: S,
        stream_sid: Arc<OnceLock<String>>,
        chunk_bytes: usize,
        vad_threshold: u16,
    ) -> Self {
        Self {
            stream,
            stream_sid,
            chunker: FrameChunker::new(chunk_bytes),
            activity: CallerActivity::new(vad_threshold),
            pending: VecDeque::new(),
            last_sequence: 0,
            malformed: 0,
            max_malformed: DEFAULT_MAX_MALFORMED,
            finished: false,
        }
    }

    /// How many malformed messages in a row are dropped before the stream fails.
    pub fn with_malformed_limit(mut self, max_malformed: u32) -> Self {
        self.max_malformed = max_malformed;
        self
    }

    /// Counts a dropped message; errors once the run of them passes the limit.
    fn malformed(&mut self, reason: &str, error: impl Display) -> Result<(), TransportError> {
        self.malformed += 1;
        if self.malformed > self.max_malformed {
            return Err(TransportError::Protocol(format!(
                "{} malformed messages in a row, last: {reason}: {error}",
                self.malformed
            )));
        }
        warn!(malformed = self.malformed, %error, reason, "Dropping malformed Twilio message");
        Ok(())
    }

    fn handle_text(&mut self, text: &str) -> Result<(), TransportError> {
        let message = match serde_json::from_str::<TwilioInbound>(text) {
            Ok(message) => message,
            Err(e) => return self.malformed("unparseable message", e),
        };

        match message {
            TwilioInbound::Connected { protocol } => debug!(?protocol, "Twilio stream connected"),
            TwilioInbound::Start { start, .. } => {
                tracing::Span::current().record("stream_sid", start.stream_sid.as_str());
                info!(
                    stream_sid = %start.stream_sid,
                    call_sid = ?start.call_sid,
                    tracks = ?start.tracks,
                    "Twilio stream started"
                );
                if self.stream_sid.set(start.stream_sid).is_err() {
                    warn!("Duplicate start event, keeping the first streamSid");
                }
                self.pending.push_back(TelephonyEvent::Control(ControlEvent::SessionStarted));
            }
            TwilioInbound::Media {
                sequence_number,
                media,
            } => {
                if media.track != "inbound" {
                    return Ok(());
                }
                let packet = match audio_utils::decode_payload(&media.payload) {
                    Ok(packet) => packet,
                    Err(e) => return self.malformed("bad media payload", e),
                };
                self.malformed = 0;
                let sequence = parse_numeric(sequence_number.as_deref())
                    .unwrap_or(self.last_sequence + 1);
                self.last_sequence = sequence;
                let timestamp_ms = parse_numeric(media.timestamp.as_deref()).unwrap_or_default();

                match self.activity.observe(&packet) {
                    Some(ActivityChange::Started) => self
                        .pending
                        .push_back(TelephonyEvent::Control(ControlEvent::CallerSpeechStarted)),
                    Some(ActivityChange::Stopped) => self
                        .pending
                        .push_back(TelephonyEvent::Control(ControlEvent::CallerSpeechStopped)),
                    None => {}
                }
                for chunk in self.chunker.push(&packet) {
                    self.pending.push_back(TelephonyEvent::Audio(AudioFrame::new(
                        Direction::CallerToAgent,
                        sequence,
                        timestamp_ms,
                        chunk,
                    )));
                }
            }
            TwilioInbound::Stop { .. } => {
                info!(
                    dropped_bytes = self.chunker.buffered(),
                    "Twilio stream stopped"
                );
                self.chunker.flush();
                self.pending.push_back(TelephonyEvent::Control(ControlEvent::SessionEnded));
                self.finished = true;
            }
            TwilioInbound::Mark { mark } => debug!(?mark, "Mark played"),
            TwilioInbound::Dtmf { dtmf } => debug!(?dtmf, "Ignoring DTMF"),
        }
        Ok(())
    }
}

#[async_trait]
impl<S> TelephonySource for TwilioSource<S>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Option<TelephonyEvent>, TransportError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            if self.finished {
                return Ok(None);
            }
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => self.handle_text(text.as_str())?,
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Twilio sent a close frame");
                    self.finished = true;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(TransportError::Connection(e.to_string())),
                None => self.finished = true,
            }
        }
    }
}

pub struct TwilioSink<S> {
    sink: S,
    stream_sid: Arc<OnceLock<String>>,
}

impl<S> TwilioSink<S>
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
{
    pub fn new(sink: S, stream_sid: Arc<OnceLock<String>>) -> Self {
        Self { sink, stream_sid }
    }

    async fn send_json(&mut self, message: &TwilioOutbound) -> Result<(), TransportError> {
        let text = serde_json::to_string(message)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.sink
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))
    }

    /// Reports a failure to Twilio before the socket is closed.
    pub async fn send_error(&mut self, code: &str, message: &str) -> Result<(), TransportError> {
        self.send_json(&TwilioOutbound::Error {
            error: ErrorBody {
                code: code.to_string(),
                message: message.to_string(),
            },
        })
        .await
    }
}

#[async_trait]
impl<S> TelephonySink for TwilioSink<S>
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
{
    async fn send_audio(&mut self, frame: AudioFrame) -> Result<(), TransportError> {
        let Some(stream_sid) = self.stream_sid.get().cloned() else {
            debug!("No streamSid yet, dropping agent audio");
            return Ok(());
        };
        self.send_json(&TwilioOutbound::Media {
            stream_sid,
            media: OutboundMedia {
                payload: audio_utils::encode_payload(&frame.payload),
            },
        })
        .await
    }

    async fn send_event(&mut self, event: ControlEvent) -> Result<(), TransportError> {
        match event {
            ControlEvent::BargeInCancel => {
                let Some(stream_sid) = self.stream_sid.get().cloned() else {
                    return Ok(());
                };
                debug!("Clearing buffered agent audio");
                self.send_json(&TwilioOutbound::Clear { stream_sid }).await
            }
            other => {
                debug!(event = other.kind(), "No Twilio message for event");
                Ok(())
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.sink.close().await {
            debug!(error = %e, "Twilio socket already closed");
        }
    }
}
