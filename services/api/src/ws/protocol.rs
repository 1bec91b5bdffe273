//! Twilio Media Streams message protocol.
//!
//! Twilio speaks JSON text frames tagged by `event`. Numeric fields such as
//! `sequenceNumber` and `timestamp` arrive as strings.

use serde::{Deserialize, Serialize};

/// Messages Twilio sends to us over the media stream.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TwilioInbound {
    /// First message on a new stream.
    Connected {
        #[serde(default)]
        protocol: Option<String>,
    },
    Start {
        #[serde(rename = "sequenceNumber", default)]
        sequence_number: Option<String>,
        start: StreamStart,
    },
    Media {
        #[serde(rename = "sequenceNumber", default)]
        sequence_number: Option<String>,
        media: MediaPayload,
    },
    Stop {
        #[serde(rename = "sequenceNumber", default)]
        sequence_number: Option<String>,
    },
    /// Playback of a mark we sent has completed.
    Mark {
        #[serde(default)]
        mark: Option<MarkPayload>,
    },
    Dtmf {
        #[serde(default)]
        dtmf: Option<DtmfPayload>,
    },
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamStart {
    pub stream_sid: String,
    #[serde(default)]
    pub call_sid: Option<String>,
    #[serde(default)]
    pub account_sid: Option<String>,
    #[serde(default)]
    pub tracks: Vec<String>,
    #[serde(default)]
    pub media_format: Option<MediaFormat>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MediaFormat {
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u16,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct MediaPayload {
    /// `inbound` for caller audio, `outbound` for audio we played.
    #[serde(default = "inbound_track")]
    pub track: String,
    #[serde(default)]
    pub chunk: Option<String>,
    /// Milliseconds since the stream started.
    #[serde(default)]
    pub timestamp: Option<String>,
    /// Base64 mu-law audio.
    pub payload: String,
}

fn inbound_track() -> String {
    "inbound".to_string()
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct MarkPayload {
    pub name: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct DtmfPayload {
    #[serde(default)]
    pub track: Option<String>,
    pub digit: String,
}

/// Messages we send back to Twilio.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TwilioOutbound {
    /// Audio to play to the caller.
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: OutboundMedia,
    },
    /// Drops any audio Twilio has buffered but not yet played.
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
    /// Sent before closing when the call cannot be bridged.
    Error { error: ErrorBody },
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct OutboundMedia {
    pub payload: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Parses a Twilio numeric string field, if present and well-formed.
pub fn parse_numeric(value: Option<&str>) -> Option<u64> {
    value.and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_start_event() {
        let raw = json!({
            "event": "start",
            "sequenceNumber": "1",
            "start": {
                "accountSid": "AC123",
                "streamSid": "MZ123",
                "callSid": "CA123",
                "tracks": ["inbound"],
                "customParameters": {},
                "mediaFormat": { "encoding": "audio/x-mulaw", "sampleRate": 8000, "channels": 1 }
            },
            "streamSid": "MZ123"
        });
        let msg: TwilioInbound = serde_json::from_value(raw).unwrap();
        match msg {
            TwilioInbound::Start { sequence_number, start } => {
                assert_eq!(sequence_number.as_deref(), Some("1"));
                assert_eq!(start.stream_sid, "MZ123");
                assert_eq!(start.call_sid.as_deref(), Some("CA123"));
                assert_eq!(start.media_format.unwrap().sample_rate, 8000);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_parse_media_event() {
        let raw = r#"{"event":"media","sequenceNumber":"3","media":{"track":"inbound","chunk":"1","timestamp":"5","payload":"//8="},"streamSid":"MZ123"}"#;
        let msg: TwilioInbound = serde_json::from_str(raw).unwrap();
        let TwilioInbound::Media { sequence_number, media } = msg else {
            panic!("expected media");
        };
        assert_eq!(parse_numeric(sequence_number.as_deref()), Some(3));
        assert_eq!(parse_numeric(media.timestamp.as_deref()), Some(5));
        assert_eq!(media.track, "inbound");
        assert_eq!(media.payload, "//8=");
    }

    #[test]
    fn test_parse_stop_and_ignored_events() {
        let stop: TwilioInbound =
            serde_json::from_str(r#"{"event":"stop","sequenceNumber":"9","streamSid":"MZ1","stop":{"callSid":"CA1"}}"#)
                .unwrap();
        assert!(matches!(stop, TwilioInbound::Stop { .. }));

        let connected: TwilioInbound =
            serde_json::from_str(r#"{"event":"connected","protocol":"Call","version":"1.0.0"}"#).unwrap();
        assert!(matches!(connected, TwilioInbound::Connected { .. }));

        let dtmf: TwilioInbound =
            serde_json::from_str(r#"{"event":"dtmf","dtmf":{"track":"inbound_track","digit":"1"}}"#).unwrap();
        assert!(matches!(dtmf, TwilioInbound::Dtmf { dtmf: Some(d) } if d.digit == "1"));
    }

    #[test]
    fn test_serialize_outbound_messages() {
        let media = TwilioOutbound::Media {
            stream_sid: "MZ1".into(),
            media: OutboundMedia {
                payload: "AAA=".into(),
            },
        };
        assert_eq!(
            serde_json::to_value(&media).unwrap(),
            json!({"event": "media", "streamSid": "MZ1", "media": {"payload": "AAA="}})
        );

        let clear = TwilioOutbound::Clear {
            stream_sid: "MZ1".into(),
        };
        assert_eq!(
            serde_json::to_value(&clear).unwrap(),
            json!({"event": "clear", "streamSid": "MZ1"})
        );

        let error = TwilioOutbound::Error {
            error: ErrorBody {
                code: "WEBSOCKET_ERROR".into(),
                message: "agent unavailable".into(),
            },
        };
        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            json!({"event": "error", "error": {"code": "WEBSOCKET_ERROR", "message": "agent unavailable"}})
        );
    }

    #[test]
    fn test_parse_numeric_rejects_garbage() {
        assert_eq!(parse_numeric(None), None);
        assert_eq!(parse_numeric(Some("abc")), None);
        assert_eq!(parse_numeric(Some("42")), Some(42));
    }
}
