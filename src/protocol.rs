//! Control-channel wire contract.
//!
//! JSON text frames, one message per frame, classified by an upper-case
//! `type` tag. The worker drops frames it cannot parse; we do the same in
//! [`decode_inbound`], so a protocol hiccup never crashes the dispatcher.

use serde::{Deserialize, Serialize};

/// Why a session started; tagged onto `START` so the worker can decide
/// whether to run its own silence monitor (it does for wake and tap).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartReason {
    Hotkey,
    Tap,
    Wake,
}

impl StartReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StartReason::Hotkey => "hotkey",
            StartReason::Tap => "tap",
            StartReason::Wake => "wake",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoStopReason {
    Silence,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    #[serde(rename = "START")]
    Start {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<StartReason>,
    },
    #[serde(rename = "STOP")]
    Stop { language: String },
    #[serde(rename = "QUIT")]
    Quit,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ResultMeta {
    #[serde(default)]
    pub avg_logprob: f64,
    #[serde(default)]
    pub duration_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum InboundMessage {
    #[serde(rename = "READY")]
    Ready,
    #[serde(rename = "WAKE")]
    Wake {
        #[serde(default)]
        wake_word: Option<String>,
        #[serde(default)]
        heard: Option<String>,
    },
    #[serde(rename = "AUTO_STOP")]
    AutoStop { reason: AutoStopReason },
    #[serde(rename = "RESULT")]
    Result {
        text: String,
        #[serde(default)]
        meta: ResultMeta,
    },
    #[serde(rename = "ERROR")]
    Error { code: String, message: String },
}

pub fn encode_outbound(msg: &OutboundMessage) -> serde_json::Result<String> {
    serde_json::to_string(msg)
}

/// Unknown kinds and malformed frames yield `None`; callers drop them.
pub fn decode_inbound(raw: &str) -> Option<InboundMessage> {
    serde_json::from_str(raw.trim()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_without_reason_omits_the_field() {
        let s = encode_outbound(&OutboundMessage::Start { reason: None }).expect("encode");
        assert_eq!(s, r#"{"type":"START"}"#);
    }

    #[test]
    fn start_with_reason_tags_it() {
        let s = encode_outbound(&OutboundMessage::Start {
            reason: Some(StartReason::Wake),
        })
        .expect("encode");
        assert_eq!(s, r#"{"type":"START","reason":"wake"}"#);
    }

    #[test]
    fn stop_carries_language() {
        let s = encode_outbound(&OutboundMessage::Stop {
            language: "en".to_string(),
        })
        .expect("encode");
        assert_eq!(s, r#"{"type":"STOP","language":"en"}"#);
    }

    #[test]
    fn decodes_every_inbound_kind() {
        assert_eq!(
            decode_inbound(r#"{"type":"READY"}"#),
            Some(InboundMessage::Ready)
        );
        assert_eq!(
            decode_inbound(r#"{"type":"WAKE","wake_word":"hey vox","heard":"hey vox"}"#),
            Some(InboundMessage::Wake {
                wake_word: Some("hey vox".to_string()),
                heard: Some("hey vox".to_string()),
            })
        );
        assert_eq!(
            decode_inbound(r#"{"type":"AUTO_STOP","reason":"silence"}"#),
            Some(InboundMessage::AutoStop {
                reason: AutoStopReason::Silence
            })
        );
        assert_eq!(
            decode_inbound(
                r#"{"type":"RESULT","text":"hello","meta":{"avg_logprob":-0.2,"duration_ms":310}}"#
            ),
            Some(InboundMessage::Result {
                text: "hello".to_string(),
                meta: ResultMeta {
                    avg_logprob: -0.2,
                    duration_ms: 310
                },
            })
        );
        assert_eq!(
            decode_inbound(r#"{"type":"ERROR","code":"TRANSCRIPTION_FAILED","message":"boom"}"#),
            Some(InboundMessage::Error {
                code: "TRANSCRIPTION_FAILED".to_string(),
                message: "boom".to_string(),
            })
        );
    }

    #[test]
    fn result_meta_defaults_when_missing() {
        let msg = decode_inbound(r#"{"type":"RESULT","text":"hi"}"#).expect("decode");
        assert_eq!(
            msg,
            InboundMessage::Result {
                text: "hi".to_string(),
                meta: ResultMeta::default(),
            }
        );
    }

    #[test]
    fn unknown_and_malformed_frames_are_dropped() {
        assert_eq!(decode_inbound(r#"{"type":"NOPE"}"#), None);
        assert_eq!(decode_inbound("not json"), None);
        assert_eq!(decode_inbound(""), None);
        assert_eq!(decode_inbound(r#"{"type":"AUTO_STOP","reason":"eclipse"}"#), None);
    }
}
