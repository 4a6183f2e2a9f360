//! Anthropic Messages API.

mod stream;
mod wire;

use serde_json::Value;

use self::wire::{
    AnthropicBlock, AnthropicContent, AnthropicImageSource, AnthropicMessage, AnthropicRole, AnthropicTool,
    AnthropicToolChoice, AnthropicUsage, MessagesRequest, MessagesResponse, SystemPrompt,
};
use super::{
    ProtocolHooks, StreamDecoder, StreamEncoder, WireFormat, coalesce, from_client, from_provider, generated_id,
    to_value, tool_role_as_user,
};
use crate::uif::{
    self, ContentBlock, ImageSource, Message, Parameters, Role, StopReason, Tool, ToolChoice, Usage, joined_text,
};

/// `max_tokens` is mandatory on this API.
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub(crate) struct Anthropic;

impl ProtocolHooks for Anthropic {
    fn decode_request(&self, body: Value) -> crate::Result<uif::Request> {
        let request: MessagesRequest = from_client(body)?;
        Ok(request_to_uif(request))
    }

    fn encode_request(&self, request: &uif::Request) -> crate::Result<Value> {
        to_value(&request_from_uif(request))
    }

    fn decode_response(&self, body: Value) -> crate::Result<uif::Response> {
        let response: MessagesResponse = from_provider(body, "message")?;
        Ok(response_to_uif(response))
    }

    fn encode_response(&self, response: &uif::Response) -> crate::Result<Value> {
        to_value(&response_from_uif(response))
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(stream::EventDecoder::default())
    }

    fn stream_encoder(&self) -> Box<dyn StreamEncoder> {
        Box::new(stream::EventEncoder::default())
    }
}

fn stop_reason_from_wire(reason: &str) -> StopReason {
    match reason {
        "max_tokens" => StopReason::MaxTokens,
        "tool_use" => StopReason::ToolUse,
        "stop_sequence" => StopReason::StopSequence,
        "refusal" => StopReason::ContentFilter,
        _ => StopReason::EndTurn,
    }
}

fn stop_reason_to_wire(reason: StopReason) -> &'static str {
    match reason {
        StopReason::EndTurn => "end_turn",
        StopReason::MaxTokens => "max_tokens",
        StopReason::ToolUse => "tool_use",
        StopReason::StopSequence => "stop_sequence",
        StopReason::ContentFilter => "refusal",
    }
}

fn usage_from_wire(usage: &AnthropicUsage) -> Usage {
    Usage {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cache_read_tokens: usage.cache_read_input_tokens.unwrap_or_default(),
    }
}

fn usage_to_wire(usage: &Usage) -> AnthropicUsage {
    AnthropicUsage {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cache_read_input_tokens: (usage.cache_read_tokens > 0).then_some(usage.cache_read_tokens),
    }
}

fn block_to_uif(block: AnthropicBlock) -> Option<ContentBlock> {
    let block = match block {
        AnthropicBlock::Text { text } => ContentBlock::Text { text },
        AnthropicBlock::Thinking { thinking, signature } => ContentBlock::Thinking { thinking, signature },
        AnthropicBlock::ToolUse { id, name, input } => ContentBlock::ToolUse { id, name, input },
        AnthropicBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => ContentBlock::ToolResult {
            tool_use_id,
            content: content
                .map(AnthropicContent::into_blocks)
                .unwrap_or_default()
                .into_iter()
                .filter_map(block_to_uif)
                .collect(),
            is_error,
        },
        AnthropicBlock::Image { source } => ContentBlock::Image {
            source: match source {
                AnthropicImageSource::Base64 { media_type, data } => ImageSource::Base64 { media_type, data },
                AnthropicImageSource::Url { url } => ImageSource::Url { url, media_type: None },
            },
        },
        AnthropicBlock::Unsupported => return None,
    };

    Some(block)
}

fn block_from_uif(block: &ContentBlock) -> AnthropicBlock {
    match block {
        ContentBlock::Text { text } => AnthropicBlock::Text { text: text.clone() },
        ContentBlock::Thinking { thinking, signature } => AnthropicBlock::Thinking {
            thinking: thinking.clone(),
            signature: signature.clone(),
        },
        ContentBlock::ToolUse { id, name, input } => AnthropicBlock::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: input.clone(),
        },
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => AnthropicBlock::ToolResult {
            tool_use_id: tool_use_id.clone(),
            content: Some(AnthropicContent::Blocks(content.iter().map(block_from_uif).collect())),
            is_error: *is_error,
        },
        ContentBlock::Image { source } => AnthropicBlock::Image {
            source: match source {
                ImageSource::Base64 { media_type, data } => AnthropicImageSource::Base64 {
                    media_type: media_type.clone(),
                    data: data.clone(),
                },
                ImageSource::Url { url, .. } => AnthropicImageSource::Url { url: url.clone() },
            },
        },
    }
}

fn request_to_uif(request: MessagesRequest) -> uif::Request {
    let system = request.system.map(|system| match system {
        SystemPrompt::Text(text) => text,
        SystemPrompt::Blocks(blocks) => joined_text(&blocks.into_iter().filter_map(block_to_uif).collect::<Vec<_>>()),
    });

    let messages = request
        .messages
        .into_iter()
        .map(|message| {
            let content: Vec<_> = message.content.into_blocks().into_iter().filter_map(block_to_uif).collect();

            let only_results =
                !content.is_empty() && content.iter().all(|block| matches!(block, ContentBlock::ToolResult { .. }));

            let role = match message.role {
                AnthropicRole::Assistant => Role::Assistant,
                AnthropicRole::User if only_results => Role::Tool,
                AnthropicRole::User => Role::User,
            };

            Message::new(role, content)
        })
        .collect();

    let tool_choice = request.tool_choice.map(|choice| match choice {
        AnthropicToolChoice::Auto | AnthropicToolChoice::Unknown => ToolChoice::Auto,
        AnthropicToolChoice::Any => ToolChoice::Any,
        AnthropicToolChoice::None => ToolChoice::None,
        AnthropicToolChoice::Tool { name } => ToolChoice::Tool { name },
    });

    uif::Request {
        model: request.model,
        system,
        messages,
        parameters: Parameters {
            temperature: request.temperature,
            max_tokens: Some(request.max_tokens),
            top_p: request.top_p,
            top_k: request.top_k,
            stop_sequences: request.stop_sequences,
            stream: request.stream.unwrap_or(false),
        },
        tools: request
            .tools
            .into_iter()
            .map(|tool| Tool {
                name: tool.name,
                description: tool.description,
                input_schema: tool.input_schema,
            })
            .collect(),
        tool_choice,
        client_protocol: WireFormat::Anthropic,
    }
}

fn request_from_uif(request: &uif::Request) -> MessagesRequest {
    let mut system: Vec<String> = request.system.iter().cloned().collect();

    let turns = request.messages.iter().filter_map(|message| {
        if message.role == Role::System {
            system.push(joined_text(&message.content));
            return None;
        }

        // Thinking without a signature cannot be replayed to this API.
        let content = message
            .content
            .iter()
            .filter(|block| !matches!(block, ContentBlock::Thinking { signature: None, .. }))
            .cloned()
            .collect();

        Some(tool_role_as_user(Message::new(message.role, content)))
    });

    let messages = coalesce(turns.collect::<Vec<_>>())
        .into_iter()
        .filter(|message| !message.content.is_empty())
        .map(|message| AnthropicMessage {
            role: match message.role {
                Role::Assistant => AnthropicRole::Assistant,
                _ => AnthropicRole::User,
            },
            content: AnthropicContent::Blocks(message.content.iter().map(block_from_uif).collect()),
        })
        .collect();

    let tool_choice = request.tool_choice.as_ref().map(|choice| match choice {
        ToolChoice::Auto => AnthropicToolChoice::Auto,
        ToolChoice::Any => AnthropicToolChoice::Any,
        ToolChoice::None => AnthropicToolChoice::None,
        ToolChoice::Tool { name } => AnthropicToolChoice::Tool { name: name.clone() },
    });

    let parameters = &request.parameters;

    MessagesRequest {
        model: request.model.clone(),
        max_tokens: parameters.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        system: (!system.is_empty()).then(|| SystemPrompt::Text(system.join("\n\n"))),
        messages,
        temperature: parameters.temperature,
        top_p: parameters.top_p,
        top_k: parameters.top_k,
        stop_sequences: parameters.stop_sequences.clone(),
        stream: parameters.stream.then_some(true),
        tools: request
            .tools
            .iter()
            .map(|tool| AnthropicTool {
                name: tool.name.clone(),
                description: tool.description.clone(),
                input_schema: tool.input_schema.clone(),
            })
            .collect(),
        tool_choice,
    }
}

fn response_to_uif(response: MessagesResponse) -> uif::Response {
    uif::Response {
        id: response.id,
        model: response.model,
        content: response.content.into_iter().filter_map(block_to_uif).collect(),
        stop_reason: response.stop_reason.as_deref().map(stop_reason_from_wire).unwrap_or_default(),
        usage: usage_from_wire(&response.usage),
    }
}

fn response_from_uif(response: &uif::Response) -> MessagesResponse {
    MessagesResponse {
        id: if response.id.is_empty() {
            generated_id("msg_")
        } else {
            response.id.clone()
        },
        kind: "message".into(),
        role: "assistant".into(),
        model: response.model.clone(),
        content: response.content.iter().map(block_from_uif).collect(),
        stop_reason: Some(stop_reason_to_wire(response.stop_reason).into()),
        stop_sequence: None,
        usage: usage_to_wire(&response.usage),
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_json_snapshot;
    use serde_json::json;

    use super::Anthropic;
    use crate::{
        protocol::{ProtocolHooks, WireFormat},
        uif::{self, ContentBlock, Message, Parameters, Role, StopReason},
    };

    fn tool_history() -> uif::Request {
        uif::Request {
            model: "claude-sonnet-4".into(),
            system: Some("You are terse.".into()),
            messages: vec![
                Message::text(Role::User, "Weather in Oslo?"),
                Message::new(
                    Role::Assistant,
                    vec![
                        ContentBlock::Thinking {
                            thinking: "Need the tool.".into(),
                            signature: Some("sig-abc".into()),
                        },
                        ContentBlock::ToolUse {
                            id: "toolu_1".into(),
                            name: "get_weather".into(),
                            input: json!({"city": "Oslo"}),
                        },
                    ],
                ),
                Message::new(
                    Role::Tool,
                    vec![ContentBlock::ToolResult {
                        tool_use_id: "toolu_1".into(),
                        content: vec![ContentBlock::text("-3C")],
                        is_error: false,
                    }],
                ),
            ],
            parameters: Parameters {
                max_tokens: Some(256),
                ..Default::default()
            },
            tools: Vec::new(),
            tool_choice: None,
            client_protocol: WireFormat::Anthropic,
        }
    }

    #[test]
    fn tool_round_trip_preserves_correlation_and_signature() {
        let request = tool_history();

        let wire = Anthropic.encode_request(&request).unwrap();
        let decoded = Anthropic.decode_request(wire).unwrap();

        assert_eq!(decoded, request);
    }

    #[test]
    fn tool_results_merge_into_following_user_turn() {
        let mut request = tool_history();
        request.messages.push(Message::text(Role::User, "And tomorrow?"));

        let wire = Anthropic.encode_request(&request).unwrap();

        assert_json_snapshot!(wire["messages"][2], @r#"
        {
          "content": [
            {
              "content": [
                {
                  "text": "-3C",
                  "type": "text"
                }
              ],
              "tool_use_id": "toolu_1",
              "type": "tool_result"
            },
            {
              "text": "And tomorrow?",
              "type": "text"
            }
          ],
          "role": "user"
        }
        "#);
    }

    #[test]
    fn unsigned_thinking_is_not_replayed() {
        let mut request = tool_history();
        request.messages[1].content[0] = ContentBlock::Thinking {
            thinking: "from another provider".into(),
            signature: None,
        };

        let wire = Anthropic.encode_request(&request).unwrap();

        assert_eq!(wire["messages"][1]["content"].as_array().map(Vec::len), Some(1));
        assert_eq!(wire["max_tokens"], 256);
    }

    #[test]
    fn decodes_string_content_and_block_system() {
        let request = Anthropic
            .decode_request(json!({
                "model": "claude-sonnet-4",
                "max_tokens": 100,
                "system": [{"type": "text", "text": "Be kind."}],
                "messages": [{"role": "user", "content": "Hi"}],
                "tool_choice": {"type": "tool", "name": "lookup"},
                "metadata": {"user_id": "u-1"}
            }))
            .unwrap();

        assert_eq!(request.system.as_deref(), Some("Be kind."));
        assert_eq!(request.messages, vec![Message::text(Role::User, "Hi")]);
        assert_eq!(
            request.tool_choice,
            Some(uif::ToolChoice::Tool { name: "lookup".into() })
        );
    }

    #[test]
    fn decodes_response_with_unknown_blocks_and_refusal() {
        let response = Anthropic
            .decode_response(json!({
                "id": "msg_1",
                "type": "message",
                "role": "assistant",
                "model": "claude-sonnet-4",
                "content": [
                    {"type": "redacted_thinking", "data": "opaque"},
                    {"type": "text", "text": "I can't help with that."}
                ],
                "stop_reason": "refusal",
                "usage": {"input_tokens": 12, "output_tokens": 6, "cache_read_input_tokens": 4}
            }))
            .unwrap();

        assert_eq!(response.content, vec![ContentBlock::text("I can't help with that.")]);
        assert_eq!(response.stop_reason, StopReason::ContentFilter);
        assert_eq!(response.usage.cache_read_tokens, 4);
    }

    #[test]
    fn encodes_response() {
        let response = uif::Response {
            id: "msg_2".into(),
            model: "claude-sonnet-4".into(),
            content: vec![ContentBlock::text("Hello")],
            stop_reason: StopReason::EndTurn,
            usage: uif::Usage {
                input_tokens: 3,
                output_tokens: 1,
                cache_read_tokens: 0,
            },
        };

        assert_json_snapshot!(Anthropic.encode_response(&response).unwrap(), @r#"
        {
          "content": [
            {
              "text": "Hello",
              "type": "text"
            }
          ],
          "id": "msg_2",
          "model": "claude-sonnet-4",
          "role": "assistant",
          "stop_reason": "end_turn",
          "stop_sequence": null,
          "type": "message",
          "usage": {
            "input_tokens": 3,
            "output_tokens": 1
          }
        }
        "#);
    }

    #[test]
    fn tool_choice_types_decode_with_auto_fallback() {
        let cases = [
            (json!({"type": "auto"}), uif::ToolChoice::Auto),
            (json!({"type": "any"}), uif::ToolChoice::Any),
            (json!({"type": "none"}), uif::ToolChoice::None),
            (json!({"type": "tool", "name": "lookup"}), uif::ToolChoice::Tool { name: "lookup".into() }),
            (json!({"type": "mcp_auto", "server": "docs"}), uif::ToolChoice::Auto),
        ];

        for (choice, expected) in cases {
            let request = Anthropic
                .decode_request(json!({
                    "model": "claude-sonnet-4",
                    "max_tokens": 16,
                    "messages": [{"role": "user", "content": "Hi"}],
                    "tool_choice": choice.clone()
                }))
                .unwrap();

            assert_eq!(request.tool_choice, Some(expected), "{choice}");
        }
    }

    #[test]
    fn stop_reasons_decode_with_end_turn_fallback() {
        let cases = [
            ("end_turn", StopReason::EndTurn),
            ("max_tokens", StopReason::MaxTokens),
            ("tool_use", StopReason::ToolUse),
            ("stop_sequence", StopReason::StopSequence),
            ("refusal", StopReason::ContentFilter),
            ("pause_turn", StopReason::EndTurn),
            ("", StopReason::EndTurn),
        ];

        for (reason, expected) in cases {
            assert_eq!(super::stop_reason_from_wire(reason), expected, "{reason}");
        }
    }
}
