//! Unified intermediate format.
//!
//! Every wire protocol converts to and from these types. Nothing here knows about any
//! particular provider.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::ErrorCategory, protocol::WireFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    /// Model reasoning. `signature` is an opaque continuity token some providers require back.
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Vec<ContentBlock>,
        #[serde(default)]
        is_error: bool,
    },
    Image {
        source: ImageSource,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    /// A thinking block that carries only a signature, produced when a provider attached the
    /// token to another part.
    pub fn signature(signature: impl Into<String>) -> Self {
        ContentBlock::Thinking {
            thinking: String::new(),
            signature: Some(signature.into()),
        }
    }

    pub fn signature_only(&self) -> Option<&str> {
        match self {
            ContentBlock::Thinking {
                thinking,
                signature: Some(signature),
            } if thinking.is_empty() => Some(signature),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageSource {
    Base64 {
        media_type: String,
        data: String,
    },
    Url {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
    },
}

impl ImageSource {
    /// Parses `data:<media>;base64,<data>` URLs into inline images, anything else stays a URL.
    pub fn from_url(url: &str) -> Self {
        if let Some(rest) = url.strip_prefix("data:")
            && let Some((media_type, data)) = rest.split_once(";base64,")
        {
            return ImageSource::Base64 {
                media_type: media_type.to_string(),
                data: data.to_string(),
            };
        }

        ImageSource::Url {
            url: url.to_string(),
            media_type: None,
        }
    }

    pub fn to_url(&self) -> String {
        match self {
            ImageSource::Base64 { media_type, data } => format!("data:{media_type};base64,{data}"),
            ImageSource::Url { url, .. } => url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn new(role: Role, content: Vec<ContentBlock>) -> Self {
        Self { role, content }
    }

    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self::new(role, vec![ContentBlock::text(text)])
    }
}

/// Concatenated text of all text blocks.
pub fn joined_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    /// The model must call some tool.
    Any,
    None,
    Tool {
        name: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    pub client_protocol: WireFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    EndTurn,
    MaxTokens,
    ToolUse,
    StopSequence,
    ContentFilter,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::EndTurn => "end_turn",
            StopReason::MaxTokens => "max_tokens",
            StopReason::ToolUse => "tool_use",
            StopReason::StopSequence => "stop_sequence",
            StopReason::ContentFilter => "content_filter",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
    #[serde(default)]
    pub cache_read_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub model: String,
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub stop_reason: StopReason,
    #[serde(default)]
    pub usage: Usage,
}

/// A tool call view over a response's content.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToolCall<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub input: &'a Value,
}

impl Response {
    pub fn tool_calls(&self) -> impl Iterator<Item = ToolCall<'_>> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => Some(ToolCall { id, name, input }),
            _ => None,
        })
    }
}

/// One incremental step of a streamed response.
///
/// Tool indices count tool calls within the response, starting at zero, whatever index
/// scheme the wire protocol uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart { id: String, model: String },
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    ThinkingSignature { signature: String },
    ToolUseStart { index: u32, id: String, name: String },
    ToolUseDelta { index: u32, partial_json: String },
    Usage(Usage),
    MessageStop { stop_reason: StopReason },
    Error { category: ErrorCategory, message: String },
}

impl StreamEvent {
    /// Whether this event carries generated text, which is what time-to-first-token measures.
    pub fn is_content(&self) -> bool {
        match self {
            StreamEvent::TextDelta { text } => !text.is_empty(),
            StreamEvent::ThinkingDelta { thinking } => !thinking.is_empty(),
            _ => false,
        }
    }
}

/// Parses tool call arguments, keeping unparseable input as a JSON string.
pub fn parse_arguments(arguments: &str) -> Value {
    if arguments.trim().is_empty() {
        return Value::Object(Default::default());
    }

    serde_json::from_str(arguments).unwrap_or_else(|_| Value::String(arguments.to_string()))
}

/// Serializes tool input back into an arguments string.
pub fn format_arguments(input: &Value) -> String {
    match input {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_json_snapshot;
    use serde_json::json;

    use super::*;

    #[test]
    fn content_blocks_serialize_tagged() {
        let message = Message::new(
            Role::Assistant,
            vec![
                ContentBlock::Thinking {
                    thinking: "the user wants weather".into(),
                    signature: Some("sig-1".into()),
                },
                ContentBlock::ToolUse {
                    id: "call_1".into(),
                    name: "get_weather".into(),
                    input: json!({"city": "Oslo"}),
                },
            ],
        );

        assert_json_snapshot!(message, @r#"
        {
          "content": [
            {
              "signature": "sig-1",
              "thinking": "the user wants weather",
              "type": "thinking"
            },
            {
              "id": "call_1",
              "input": {
                "city": "Oslo"
              },
              "name": "get_weather",
              "type": "tool_use"
            }
          ],
          "role": "assistant"
        }
        "#);
    }

    #[test]
    fn data_urls_become_inline_images() {
        assert_eq!(
            ImageSource::from_url("data:image/png;base64,iVBORw0KGgo="),
            ImageSource::Base64 {
                media_type: "image/png".into(),
                data: "iVBORw0KGgo=".into()
            }
        );

        let remote = ImageSource::from_url("https://example.com/cat.jpg");
        assert_eq!(remote.to_url(), "https://example.com/cat.jpg");
    }

    #[test]
    fn arguments_round_trip() {
        assert_eq!(parse_arguments(r#"{"a":1}"#), json!({"a": 1}));
        assert_eq!(parse_arguments(""), json!({}));
        assert_eq!(parse_arguments("{not json"), json!("{not json"));
        assert_eq!(format_arguments(&json!("{not json")), "{not json");
        assert_eq!(format_arguments(&json!({"a": 1})), r#"{"a":1}"#);
    }

    #[test]
    fn content_detection() {
        assert!(StreamEvent::TextDelta { text: "hi".into() }.is_content());
        assert!(!StreamEvent::TextDelta { text: String::new() }.is_content());
        assert!(
            !StreamEvent::ThinkingSignature {
                signature: "s".into()
            }
            .is_content()
        );
    }
}
