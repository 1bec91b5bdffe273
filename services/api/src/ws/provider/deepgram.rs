//! Deepgram Voice Agent connection.
//!
//! The agent speaks JSON text frames tagged by `type` plus raw binary audio.
//! We send the settings document once after connecting, then caller audio as
//! binary frames and function results as `FunctionCallResponse` messages.

use crate::ws::transport::{AgentEvent, AgentSink, AgentSource, AgentStream, TransportError};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use restaurant_core::{
    AudioFrame, ControlEvent, Direction, FunctionDispatcher, dispatcher::FunctionDefinition,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::VecDeque, fmt::Display, path::Path, time::Instant};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, client::IntoClientRequest, protocol::Message as WsMessage},
};
use tracing::{debug, error, info, warn};

pub const DEFAULT_AGENT_URL: &str = "wss://agent.deepgram.com/v1/agent/converse";
const PROJECTS_URL: &str = "https://api.deepgram.com/v1/projects";

// --- Deepgram wire types ---

/// Messages received from the voice agent.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(tag = "type")]
enum ServerMessage {
    Welcome {
        #[serde(default)]
        request_id: Option<String>,
    },
    SettingsApplied,
    ConversationText {
        role: String,
        content: String,
    },
    UserStartedSpeaking,
    AgentThinking {
        #[serde(default)]
        content: Option<String>,
    },
    FunctionCallRequest {
        functions: Vec<FunctionCall>,
    },
    /// Older agent API versions use a snake-case tag for function calls.
    #[serde(rename = "function_call_request")]
    LegacyFunctionCallRequest {
        functions: Vec<FunctionCall>,
    },
    AgentStartedSpeaking,
    AgentAudioDone,
    Error {
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        code: Option<String>,
    },
    Warning {
        #[serde(default)]
        description: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug, PartialEq)]
struct FunctionCall {
    id: String,
    name: String,
    /// Usually a JSON-encoded string, occasionally an inline object.
    #[serde(default)]
    arguments: Value,
    #[serde(default = "client_side_default")]
    client_side: bool,
}

fn client_side_default() -> bool {
    true
}

/// Messages sent to the voice agent.
#[derive(Serialize, Debug)]
#[serde(tag = "type")]
enum ClientMessage {
    FunctionCallResponse {
        id: String,
        name: String,
        content: String,
    },
    KeepAlive,
}

impl FunctionCall {
    fn into_event(self) -> ControlEvent {
        let arguments = match self.arguments {
            Value::String(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(call_id = %self.id, error = %e, "Function arguments are not valid JSON");
                Value::String(raw)
            }),
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        ControlEvent::FunctionCallRequested {
            call_id: self.id,
            name: self.name,
            arguments,
        }
    }
}

// --- Settings ---

/// Reads the agent settings document from disk.
pub fn load_settings(path: impl AsRef<Path>) -> Result<Value> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read agent settings from {}", path.display()))?;
    serde_json::from_str(&raw).context("Agent settings are not valid JSON")
}

/// Fills in `agent.think.functions` from `functions` unless the document already lists some.
pub fn with_functions(mut settings: Value, functions: &[FunctionDefinition]) -> Result<Value> {
    if settings.pointer("/agent/think/functions").is_some() {
        return Ok(settings);
    }
    let Some(think) = settings
        .pointer_mut("/agent/think")
        .and_then(Value::as_object_mut)
    else {
        bail!("Agent settings have no `agent.think` section");
    };
    think.insert("functions".to_string(), serde_json::to_value(functions)?);
    Ok(settings)
}

/// Checks the API key against the Deepgram projects endpoint.
pub async fn validate_api_key(client: &reqwest::Client, api_key: &str) -> Result<()> {
    let response = client
        .get(PROJECTS_URL)
        .header("Authorization", format!("Token {api_key}"))
        .send()
        .await
        .context("Failed to reach Deepgram")?;
    if !response.status().is_success() {
        bail!("Deepgram rejected the API key (status {})", response.status());
    }
    info!("Deepgram API key validated");
    Ok(())
}

// --- Connection ---

/// Opens the agent connection and applies `settings`.
pub async fn connect(url: &str, api_key: &str, settings: &Value) -> Result<AgentStream> {
    let mut request = url.into_client_request()?;
    request
        .headers_mut()
        .insert("Authorization", format!("Token {api_key}").parse()?);

    let (ws_stream, _) = connect_async(request)
        .await
        .context("Failed to connect to the Deepgram agent")?;
    let (mut tx, rx) = ws_stream.split();
    info!("Connected to Deepgram agent");

    tx.send(WsMessage::Text(serde_json::to_string(settings)?.into()))
        .await
        .context("Failed to send agent settings")?;
    debug!("Agent settings sent");

    Ok(AgentStream {
        source: Box::new(DeepgramSource::new(rx)),
        sink: Box::new(DeepgramSink::new(tx)),
    })
}

pub struct DeepgramSource<S> {
    stream: S,
    pending: VecDeque<AgentEvent>,
    sequence: u64,
    started: Instant,
    finished: bool,
}

impl<S> DeepgramSource<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            pending: VecDeque::new(),
            sequence: 0,
            started: Instant::now(),
            finished: false,
        }
    }

    fn handle_text(&mut self, text: &str) {
        let message = match serde_json::from_str::<ServerMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Ignoring unparseable agent message");
                return;
            }
        };

        let event = match message {
            ServerMessage::UserStartedSpeaking => ControlEvent::CallerSpeechStarted,
            ServerMessage::AgentStartedSpeaking => ControlEvent::AgentSpeechStarted,
            ServerMessage::AgentAudioDone => ControlEvent::AgentSpeechStopped,
            ServerMessage::FunctionCallRequest { functions }
            | ServerMessage::LegacyFunctionCallRequest { functions } => {
                for call in functions {
                    if !call.client_side {
                        debug!(function = %call.name, "Function runs on the agent side");
                        continue;
                    }
                    info!(call_id = %call.id, function = %call.name, "Agent requested a function call");
                    self.pending.push_back(AgentEvent::Control(call.into_event()));
                }
                return;
            }
            ServerMessage::ConversationText { role, content } => {
                info!(%role, %content, "Conversation");
                return;
            }
            ServerMessage::Error { description, code } => {
                error!(?code, ?description, "Agent reported an error");
                return;
            }
            ServerMessage::Warning { description } => {
                warn!(?description, "Agent warning");
                return;
            }
            ServerMessage::Welcome { request_id } => {
                info!(?request_id, "Agent session started");
                return;
            }
            other => {
                debug!(message = ?other, "Agent message");
                return;
            }
        };
        self.pending.push_back(AgentEvent::Control(event));
    }
}

#[async_trait]
impl<S> AgentSource for DeepgramSource<S>
where
    S: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Option<AgentEvent>, TransportError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            if self.finished {
                return Ok(None);
            }
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => self.handle_text(text.as_str()),
                Some(Ok(WsMessage::Binary(audio))) => {
                    self.sequence += 1;
                    let elapsed = self.started.elapsed().as_millis() as u64;
                    return Ok(Some(AgentEvent::Audio(AudioFrame::new(
                        Direction::AgentToCaller,
                        self.sequence,
                        elapsed,
                        audio,
                    ))));
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    info!(?frame, "Agent closed the connection");
                    self.finished = true;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(TransportError::Connection(e.to_string())),
                None => self.finished = true,
            }
        }
    }
}

pub struct DeepgramSink<S> {
    sink: S,
}

impl<S> DeepgramSink<S>
where
    S: Sink<WsMessage> + Unpin + Send,
    S::Error: Display,
{
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    async fn send_message(&mut self, message: WsMessage) -> Result<(), TransportError> {
        self.sink
            .send(message)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))
    }

    async fn send_json(&mut self, message: &ClientMessage) -> Result<(), TransportError> {
        let text =
            serde_json::to_string(message).map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.send_message(WsMessage::Text(text.into())).await
    }
}

#[async_trait]
impl<S> AgentSink for DeepgramSink<S>
where
    S: Sink<WsMessage> + Unpin + Send,
    S::Error: Display,
{
    async fn send_audio(&mut self, frame: AudioFrame) -> Result<(), TransportError> {
        self.send_message(WsMessage::Binary(frame.payload)).await
    }

    async fn send_event(&mut self, event: ControlEvent) -> Result<(), TransportError> {
        match event {
            ControlEvent::FunctionCallResult {
                call_id,
                name,
                result,
            } => {
                let content = ControlEvent::result_payload(&result).to_string();
                debug!(%call_id, function = %name, "Sending function result");
                self.send_json(&ClientMessage::FunctionCallResponse {
                    id: call_id,
                    name,
                    content,
                })
                .await
            }
            // No client message exists for this. The bridge mutes the caller
            // leg until the agent starts its next response.
            ControlEvent::BargeInCancel => {
                debug!("Barge-in handled locally, nothing to send to the agent");
                Ok(())
            }
            other => {
                debug!(event = other.kind(), "No agent message for event");
                Ok(())
            }
        }
    }

    async fn keep_alive(&mut self) -> Result<(), TransportError> {
        self.send_json(&ClientMessage::KeepAlive).await
    }

    async fn close(&mut self) {
        let _ = self.sink.send(WsMessage::Close(None)).await;
        if let Err(e) = self.sink.close().await {
            debug!(error = %e, "Agent socket already closed");
        }
    }
}

/// Settings with this dispatcher's functions filled in.
pub fn agent_settings(settings: Value) -> Result<Value> {
    with_functions(settings, &FunctionDispatcher::definitions())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::stream;
    use restaurant_core::DispatchError;
    use serde_json::json;

    type Incoming = Result<WsMessage, tungstenite::Error>;

    fn text(value: Value) -> Incoming {
        Ok(WsMessage::Text(value.to_string().into()))
    }

    async fn events(messages: Vec<Incoming>) -> Vec<AgentEvent> {
        let mut source = DeepgramSource::new(stream::iter(messages));
        let mut out = Vec::new();
        while let Some(event) = source.recv().await.unwrap() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_speech_events_are_mapped() {
        let out = events(vec![
            text(json!({"type": "Welcome", "request_id": "r1"})),
            text(json!({"type": "SettingsApplied"})),
            text(json!({"type": "AgentStartedSpeaking", "total_latency": 0.5})),
            text(json!({"type": "UserStartedSpeaking"})),
            text(json!({"type": "AgentAudioDone"})),
            text(json!({"type": "History", "role": "user"})),
        ])
        .await;
        assert_eq!(
            out,
            vec![
                AgentEvent::Control(ControlEvent::AgentSpeechStarted),
                AgentEvent::Control(ControlEvent::CallerSpeechStarted),
                AgentEvent::Control(ControlEvent::AgentSpeechStopped),
            ]
        );
    }

    #[tokio::test]
    async fn test_function_call_request_parses_arguments() {
        let out = events(vec![
            text(json!({
                "type": "FunctionCallRequest",
                "functions": [
                    {"id": "fc1", "name": "lookup_menu_item", "arguments": "{\"query\":\"pizza\"}", "client_side": true},
                    {"id": "fc2", "name": "server_tool", "arguments": "{}", "client_side": false},
                    {"id": "fc3", "name": "check_order_status", "arguments": {"order_id": 4}}
                ]
            })),
            text(json!({
                "type": "function_call_request",
                "functions": [{"id": "fc4", "name": "place_order", "arguments": "not json"}]
            })),
        ])
        .await;

        assert_eq!(
            out,
            vec![
                AgentEvent::Control(ControlEvent::FunctionCallRequested {
                    call_id: "fc1".into(),
                    name: "lookup_menu_item".into(),
                    arguments: json!({"query": "pizza"}),
                }),
                AgentEvent::Control(ControlEvent::FunctionCallRequested {
                    call_id: "fc3".into(),
                    name: "check_order_status".into(),
                    arguments: json!({"order_id": 4}),
                }),
                AgentEvent::Control(ControlEvent::FunctionCallRequested {
                    call_id: "fc4".into(),
                    name: "place_order".into(),
                    arguments: json!("not json"),
                }),
            ]
        );
    }

    #[tokio::test]
    async fn test_binary_audio_gets_increasing_sequence() {
        let out = events(vec![
            Ok(WsMessage::Binary(Bytes::from_static(&[1, 2]))),
            Ok(WsMessage::Ping(Bytes::new())),
            Ok(WsMessage::Binary(Bytes::from_static(&[3]))),
            Ok(WsMessage::Close(None)),
            Ok(WsMessage::Binary(Bytes::from_static(&[4]))),
        ])
        .await;
        let frames: Vec<(u64, Bytes)> = out
            .into_iter()
            .map(|e| match e {
                AgentEvent::Audio(frame) => {
                    assert_eq!(frame.direction, Direction::AgentToCaller);
                    (frame.sequence, frame.payload)
                }
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(
            frames,
            vec![(1, Bytes::from_static(&[1, 2])), (2, Bytes::from_static(&[3]))]
        );
    }

    fn sent_json(sink: &DeepgramSink<Vec<WsMessage>>) -> Vec<Value> {
        sink.sink
            .iter()
            .filter_map(|m| match m {
                WsMessage::Text(t) => Some(serde_json::from_str(t.as_str()).unwrap()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_function_results_are_encoded_as_responses() {
        let mut sink = DeepgramSink::new(Vec::new());
        sink.send_event(ControlEvent::FunctionCallResult {
            call_id: "fc1".into(),
            name: "check_order_status".into(),
            result: Ok(json!({"order_id": 1, "status": "pending"})),
        })
        .await
        .unwrap();
        sink.send_event(ControlEvent::FunctionCallResult {
            call_id: "fc2".into(),
            name: "check_order_status".into(),
            result: Err(DispatchError::NotFound("order 9 not found".into())),
        })
        .await
        .unwrap();
        sink.send_event(ControlEvent::BargeInCancel).await.unwrap();
        sink.keep_alive().await.unwrap();

        let sent = sent_json(&sink);
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0]["type"], "FunctionCallResponse");
        assert_eq!(sent[0]["id"], "fc1");
        assert_eq!(sent[0]["name"], "check_order_status");
        let content: Value = serde_json::from_str(sent[0]["content"].as_str().unwrap()).unwrap();
        assert_eq!(content, json!({"order_id": 1, "status": "pending"}));

        let content: Value = serde_json::from_str(sent[1]["content"].as_str().unwrap()).unwrap();
        assert_eq!(content["error"]["kind"], "not_found");
        assert_eq!(sent[2], json!({"type": "KeepAlive"}));
    }

    #[tokio::test]
    async fn test_audio_is_sent_as_binary_and_close_sends_close_frame() {
        let mut sink = DeepgramSink::new(Vec::new());
        let frame = AudioFrame::new(Direction::CallerToAgent, 1, 0, Bytes::from_static(&[9, 9]));
        sink.send_audio(frame).await.unwrap();
        sink.close().await;

        assert_eq!(sink.sink.len(), 2);
        assert_eq!(sink.sink[0], WsMessage::Binary(Bytes::from_static(&[9, 9])));
        assert!(matches!(sink.sink[1], WsMessage::Close(None)));
    }

    #[test]
    fn test_functions_injected_into_settings() {
        let settings = json!({"type": "Settings", "agent": {"think": {"prompt": "hi"}}});
        let prepared = agent_settings(settings).unwrap();
        let names: Vec<&str> = prepared["agent"]["think"]["functions"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["lookup_menu_item", "place_order", "check_order_status"]);
        assert_eq!(prepared["agent"]["think"]["prompt"], "hi");
    }

    #[test]
    fn test_existing_functions_are_kept() {
        let settings = json!({"agent": {"think": {"functions": []}}});
        let prepared = with_functions(settings.clone(), &FunctionDispatcher::definitions()).unwrap();
        assert_eq!(prepared, settings);

        assert!(with_functions(json!({"agent": {}}), &[]).is_err());
    }
}
