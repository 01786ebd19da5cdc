//! BidiGenerateContent JSON messages.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::{LiveError, LiveEvent, LiveSetup, Modality, AUDIO_MIME_TYPE};

/// Messages the client sends. Serialized externally tagged, e.g.
/// `{"setup": {...}}`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
enum ClientMessage<'a> {
    Setup(Setup<'a>),
    ClientContent(ClientContent<'a>),
    RealtimeInput(RealtimeInput<'a>),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup<'a> {
    model: String,
    generation_config: GenerationConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig<'a> {
    response_modalities: &'a [Modality],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientContent<'a> {
    turns: Vec<Turn<'a>>,
    turn_complete: bool,
}

#[derive(Debug, Serialize)]
struct Turn<'a> {
    role: &'a str,
    parts: Vec<TextPart<'a>>,
}

#[derive(Debug, Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput<'a> {
    media_chunks: Vec<OutgoingBlob<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutgoingBlob<'a> {
    mime_type: &'a str,
    data: String,
}

fn encode(message: &ClientMessage<'_>) -> Result<String, LiveError> {
    serde_json::to_string(message).map_err(|e| LiveError::Protocol(e.to_string()))
}

/// First message on a new session.
pub(crate) fn setup_message(setup: &LiveSetup) -> Result<String, LiveError> {
    encode(&ClientMessage::Setup(Setup {
        model: setup.model_resource(),
        generation_config: GenerationConfig {
            response_modalities: &setup.response_modalities,
        },
    }))
}

/// A single user text turn.
pub(crate) fn text_message(text: &str, end_of_turn: bool) -> Result<String, LiveError> {
    encode(&ClientMessage::ClientContent(ClientContent {
        turns: vec![Turn {
            role: "user",
            parts: vec![TextPart { text }],
        }],
        turn_complete: end_of_turn,
    }))
}

/// One realtime audio chunk. Realtime input never completes a turn.
pub(crate) fn audio_message(frame: &[u8]) -> Result<String, LiveError> {
    encode(&ClientMessage::RealtimeInput(RealtimeInput {
        media_chunks: vec![OutgoingBlob {
            mime_type: AUDIO_MIME_TYPE,
            data: STANDARD.encode(frame),
        }],
    }))
}

/// A message from the server. Unknown fields are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    go_away: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ServerContent {
    model_turn: Option<Content>,
    output_transcription: Option<Transcription>,
    turn_complete: bool,
    interrupted: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Part {
    text: Option<String>,
    inline_data: Option<IncomingBlob>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct IncomingBlob {
    mime_type: String,
    data: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Transcription {
    text: Option<String>,
}

impl ServerMessage {
    pub(crate) fn parse(raw: &[u8]) -> Result<Self, LiveError> {
        serde_json::from_slice(raw)
            .map_err(|e| LiveError::Protocol(format!("invalid server message: {e}")))
    }

    pub(crate) fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    pub(crate) fn is_go_away(&self) -> bool {
        self.go_away.is_some()
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.server_content.as_ref().is_some_and(|c| c.interrupted)
    }

    /// Flatten into events, preserving part order.
    pub(crate) fn into_events(self) -> Result<Vec<LiveEvent>, LiveError> {
        let Some(content) = self.server_content else {
            return Ok(Vec::new());
        };

        let mut events = Vec::new();
        for part in content.model_turn.map(|t| t.parts).unwrap_or_default() {
            if let Some(blob) = part.inline_data {
                let data = STANDARD.decode(blob.data.as_bytes()).map_err(|e| {
                    LiveError::Protocol(format!("bad inline data ({}): {e}", blob.mime_type))
                })?;
                if !data.is_empty() {
                    events.push(LiveEvent::Audio(data));
                }
            }
            if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                events.push(LiveEvent::Text(text));
            }
        }

        if let Some(text) = content
            .output_transcription
            .and_then(|t| t.text)
            .filter(|t| !t.is_empty())
        {
            events.push(LiveEvent::Text(text));
        }

        if content.turn_complete {
            events.push(LiveEvent::TurnComplete);
        }

        Ok(events)
    }
}
