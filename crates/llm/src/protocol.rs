//! Wire protocol converters.
//!
//! Each [`WireFormat`] implements the four hooks of [`ProtocolHooks`]: client request to UIF,
//! UIF to provider request, provider response to UIF, UIF to client response. The streaming
//! path uses stateful [`StreamDecoder`] and [`StreamEncoder`] implementations of the same
//! formats.

pub(crate) mod anthropic;
pub(crate) mod completions;
pub(crate) mod gemini;
pub(crate) mod openai;
pub(crate) mod responses;

use std::collections::HashMap;

use config::{ProviderKind, VertexConfig, VertexPublisher};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{
    error::LlmError,
    sse::parser::SseEvent,
    uif::{self, ContentBlock, Message, Role, StreamEvent},
};

/// The wire protocols the gateway speaks, on either side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WireFormat {
    #[serde(rename = "openai_chat")]
    OpenAiChat,
    /// Legacy `/v1/completions`, client side only.
    #[serde(rename = "openai_completions")]
    OpenAiCompletions,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "gemini")]
    Gemini,
    #[serde(rename = "responses")]
    Responses,
}

impl WireFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            WireFormat::OpenAiChat => "openai_chat",
            WireFormat::OpenAiCompletions => "openai_completions",
            WireFormat::Anthropic => "anthropic",
            WireFormat::Gemini => "gemini",
            WireFormat::Responses => "responses",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        [
            WireFormat::OpenAiChat,
            WireFormat::OpenAiCompletions,
            WireFormat::Anthropic,
            WireFormat::Gemini,
            WireFormat::Responses,
        ]
        .into_iter()
        .find(|format| format.as_str() == name)
    }

    /// The format a provider of this kind speaks.
    pub fn for_provider(kind: ProviderKind, vertex: Option<&VertexConfig>) -> Self {
        match kind {
            ProviderKind::Openai | ProviderKind::Custom => WireFormat::OpenAiChat,
            ProviderKind::Anthropic => WireFormat::Anthropic,
            ProviderKind::Gemini => WireFormat::Gemini,
            ProviderKind::Responses => WireFormat::Responses,
            ProviderKind::Vertex => match vertex.map(|vertex| vertex.publisher) {
                Some(VertexPublisher::Anthropic) => WireFormat::Anthropic,
                _ => WireFormat::Gemini,
            },
        }
    }

    /// Whether client stream events of this format carry an SSE `event:` name.
    pub fn named_events(self) -> bool {
        matches!(self, WireFormat::Anthropic | WireFormat::Responses)
    }

    pub(crate) fn hooks(self) -> &'static dyn ProtocolHooks {
        match self {
            WireFormat::OpenAiChat => &openai::OpenAiChat,
            WireFormat::OpenAiCompletions => &completions::Completions,
            WireFormat::Anthropic => &anthropic::Anthropic,
            WireFormat::Gemini => &gemini::Gemini,
            WireFormat::Responses => &responses::Responses,
        }
    }
}

/// The four conversion hooks of one wire protocol, plus its streaming codecs.
///
/// `decode_request` failures are the client's fault and surface as invalid requests; every
/// other hook fails with a transform error.
pub(crate) trait ProtocolHooks: Send + Sync {
    /// Client wire request to UIF.
    fn decode_request(&self, body: Value) -> crate::Result<uif::Request>;

    /// UIF to provider wire request.
    fn encode_request(&self, request: &uif::Request) -> crate::Result<Value>;

    /// Provider wire response to UIF.
    fn decode_response(&self, body: Value) -> crate::Result<uif::Response>;

    /// UIF to client wire response.
    fn encode_response(&self, response: &uif::Response) -> crate::Result<Value>;

    /// Incremental provider stream to UIF events.
    fn stream_decoder(&self) -> Box<dyn StreamDecoder>;

    /// Incremental UIF events to client stream events.
    fn stream_encoder(&self) -> Box<dyn StreamEncoder>;
}

pub(crate) trait StreamDecoder: Send {
    /// Decodes one upstream SSE event.
    fn decode(&mut self, event: &SseEvent) -> crate::Result<Vec<StreamEvent>>;

    /// Called when the upstream body ends. Fails if the provider never signalled completion.
    fn finish(&mut self) -> crate::Result<Vec<StreamEvent>>;
}

pub(crate) trait StreamEncoder: Send {
    fn encode(&mut self, event: &StreamEvent) -> Vec<ClientEvent>;

    /// Trailing events after a completed stream, e.g. `[DONE]`.
    fn finish(&mut self) -> Vec<ClientEvent> {
        Vec::new()
    }
}

/// An SSE event ready for the client.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ClientEvent {
    pub event: Option<String>,
    pub data: String,
}

impl ClientEvent {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn json<T: Serialize>(value: &T) -> Self {
        Self::data(to_json_string(value))
    }

    pub fn named<T: Serialize>(event: &str, value: &T) -> Self {
        Self {
            event: Some(event.to_string()),
            data: to_json_string(value),
        }
    }
}

fn to_json_string<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| {
        log::error!("Failed to serialize stream event: {e}");
        r#"{"error":"serialization failed"}"#.to_string()
    })
}

/// Deserializes a client payload.
pub(crate) fn from_client<T: DeserializeOwned>(body: Value) -> crate::Result<T> {
    serde_json::from_value(body).map_err(|e| LlmError::InvalidRequest(e.to_string()))
}

/// Deserializes a provider payload.
pub(crate) fn from_provider<T: DeserializeOwned>(body: Value, what: &str) -> crate::Result<T> {
    serde_json::from_value(body).map_err(|e| LlmError::Transform(format!("unexpected {what}: {e}")))
}

/// Parses an SSE data payload from a provider.
pub(crate) fn parse_chunk<T: DeserializeOwned>(data: &str, what: &str) -> crate::Result<T> {
    sonic_rs::from_str(data).map_err(|e| LlmError::Stream(format!("malformed {what}: {e}")))
}

pub(crate) fn to_value<T: Serialize>(value: &T) -> crate::Result<Value> {
    serde_json::to_value(value).map_err(|e| LlmError::Transform(e.to_string()))
}

/// Merges adjacent messages of the same role by concatenating their content in order.
pub(crate) fn coalesce(messages: impl IntoIterator<Item = Message>) -> Vec<Message> {
    let mut merged: Vec<Message> = Vec::new();

    for message in messages {
        match merged.last_mut() {
            Some(last) if last.role == message.role => last.content.extend(message.content),
            _ => merged.push(message),
        }
    }

    merged
}

/// Tool results travel in user turns for protocols without a tool role.
pub(crate) fn tool_role_as_user(message: Message) -> Message {
    match message.role {
        Role::Tool => Message::new(Role::User, message.content),
        _ => message,
    }
}

/// Index from tool_use id to the called function's name, built once per request over the whole
/// history so tool results can be paired without rescanning.
#[derive(Debug, Default)]
pub(crate) struct ToolIndex<'a> {
    names: HashMap<&'a str, &'a str>,
}

impl<'a> ToolIndex<'a> {
    pub fn build(messages: &'a [Message]) -> Self {
        let names = messages
            .iter()
            .flat_map(|message| &message.content)
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, .. } => Some((id.as_str(), name.as_str())),
                _ => None,
            })
            .collect();

        Self { names }
    }

    pub fn name_of(&self, tool_use_id: &str) -> Option<&'a str> {
        self.names.get(tool_use_id).copied()
    }
}

pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

pub(crate) fn generated_id(prefix: &str) -> String {
    format!("{prefix}{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::uif::ContentBlock;

    #[test]
    fn coalesce_merges_adjacent_same_role() {
        let merged = coalesce(vec![
            Message::text(Role::User, "a"),
            Message::text(Role::User, "b"),
            Message::text(Role::Assistant, "c"),
            Message::text(Role::User, "d"),
        ]);

        let shape: Vec<_> = merged
            .iter()
            .map(|message| (message.role, uif::joined_text(&message.content)))
            .collect();

        assert_eq!(
            shape,
            vec![
                (Role::User, "ab".to_string()),
                (Role::Assistant, "c".to_string()),
                (Role::User, "d".to_string())
            ]
        );
    }

    #[test]
    fn tool_index_spans_history() {
        let messages = vec![
            Message::new(
                Role::Assistant,
                vec![ContentBlock::ToolUse {
                    id: "call_a".into(),
                    name: "search".into(),
                    input: json!({}),
                }],
            ),
            Message::text(Role::User, "thanks"),
            Message::new(
                Role::Assistant,
                vec![ContentBlock::ToolUse {
                    id: "call_b".into(),
                    name: "fetch".into(),
                    input: json!({}),
                }],
            ),
        ];

        let index = ToolIndex::build(&messages);

        assert_eq!(index.name_of("call_a"), Some("search"));
        assert_eq!(index.name_of("call_b"), Some("fetch"));
        assert_eq!(index.name_of("call_c"), None);
    }

    #[test]
    fn wire_format_names() {
        for format in [
            WireFormat::OpenAiChat,
            WireFormat::OpenAiCompletions,
            WireFormat::Anthropic,
            WireFormat::Gemini,
            WireFormat::Responses,
        ] {
            assert_eq!(WireFormat::from_name(format.as_str()), Some(format));
            assert_eq!(serde_json::to_value(format).unwrap(), json!(format.as_str()));
        }
    }
}
