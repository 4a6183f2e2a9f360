//! OpenAI chat completions.

mod stream;
mod wire;

use serde_json::Value;

pub(crate) use self::wire::{ChatUsage, StopField, ToolCall as ChatToolCall};
use self::wire::{
    ChatChoice, ChatContent, ChatMessage, ChatPart, ChatRequest, ChatResponse, ChatRole, ChatTool, ChatToolChoice,
    FunctionCall, FunctionDefinition, ImageUrl, NamedFunction, ResponseMessage, StreamOptions,
};
use super::{
    ProtocolHooks, StreamDecoder, StreamEncoder, WireFormat, from_client, from_provider, generated_id, to_value,
    unix_now,
};
use crate::uif::{
    self, ContentBlock, ImageSource, Message, Parameters, Role, StopReason, Tool, ToolChoice, Usage, joined_text,
};

pub(crate) struct OpenAiChat;

impl ProtocolHooks for OpenAiChat {
    fn decode_request(&self, body: Value) -> crate::Result<uif::Request> {
        let request: ChatRequest = from_client(body)?;
        Ok(request_to_uif(request, WireFormat::OpenAiChat))
    }

    fn encode_request(&self, request: &uif::Request) -> crate::Result<Value> {
        to_value(&request_from_uif(request))
    }

    fn decode_response(&self, body: Value) -> crate::Result<uif::Response> {
        let response: ChatResponse = from_provider(body, "chat completion")?;
        Ok(response_to_uif(response))
    }

    fn encode_response(&self, response: &uif::Response) -> crate::Result<Value> {
        to_value(&response_from_uif(response))
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(stream::ChunkDecoder::default())
    }

    fn stream_encoder(&self) -> Box<dyn StreamEncoder> {
        Box::new(stream::ChunkEncoder::default())
    }
}

pub(crate) fn stop_reason_from_wire(reason: &str) -> StopReason {
    match reason {
        "length" => StopReason::MaxTokens,
        "tool_calls" | "function_call" => StopReason::ToolUse,
        "content_filter" => StopReason::ContentFilter,
        _ => StopReason::EndTurn,
    }
}

pub(crate) fn stop_reason_to_wire(reason: StopReason) -> &'static str {
    match reason {
        StopReason::EndTurn | StopReason::StopSequence => "stop",
        StopReason::MaxTokens => "length",
        StopReason::ToolUse => "tool_calls",
        StopReason::ContentFilter => "content_filter",
    }
}

fn tool_choice_from_wire(choice: ChatToolChoice) -> ToolChoice {
    match choice {
        ChatToolChoice::Named { kind, function } if kind == "function" => ToolChoice::Tool { name: function.name },
        ChatToolChoice::Mode(mode) => match mode.as_str() {
            "none" => ToolChoice::None,
            "required" => ToolChoice::Any,
            _ => ToolChoice::Auto,
        },
        ChatToolChoice::Named { .. } | ChatToolChoice::Other(_) => ToolChoice::Auto,
    }
}

fn tool_choice_to_wire(choice: &ToolChoice) -> ChatToolChoice {
    match choice {
        ToolChoice::Auto => ChatToolChoice::Mode("auto".into()),
        ToolChoice::Any => ChatToolChoice::Mode("required".into()),
        ToolChoice::None => ChatToolChoice::Mode("none".into()),
        ToolChoice::Tool { name } => ChatToolChoice::Named {
            kind: "function".into(),
            function: NamedFunction { name: name.clone() },
        },
    }
}

pub(crate) fn usage_from_wire(usage: &ChatUsage) -> Usage {
    Usage {
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        cache_read_tokens: usage
            .prompt_tokens_details
            .as_ref()
            .map(|details| details.cached_tokens)
            .unwrap_or_default(),
    }
}

pub(crate) fn usage_to_wire(usage: &Usage) -> ChatUsage {
    ChatUsage {
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
        total_tokens: usage.input_tokens + usage.output_tokens,
        prompt_tokens_details: None,
    }
}

fn content_to_blocks(content: Option<ChatContent>) -> Vec<ContentBlock> {
    match content {
        None => Vec::new(),
        Some(ChatContent::Text(text)) if text.is_empty() => Vec::new(),
        Some(ChatContent::Text(text)) => vec![ContentBlock::text(text)],
        Some(ChatContent::Parts(parts)) => parts
            .into_iter()
            .map(|part| match part {
                ChatPart::Text { text } => ContentBlock::text(text),
                ChatPart::ImageUrl { image_url } => ContentBlock::Image {
                    source: ImageSource::from_url(&image_url.url),
                },
            })
            .collect(),
    }
}

fn blocks_to_content(blocks: &[ContentBlock]) -> Option<ChatContent> {
    let only_text = blocks.iter().all(|block| matches!(block, ContentBlock::Text { .. }));

    if only_text {
        let text = joined_text(blocks);
        return (!text.is_empty()).then_some(ChatContent::Text(text));
    }

    let parts = blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(ChatPart::Text { text: text.clone() }),
            ContentBlock::Image { source } => Some(ChatPart::ImageUrl {
                image_url: ImageUrl {
                    url: source.to_url(),
                    detail: None,
                },
            }),
            _ => None,
        })
        .collect();

    Some(ChatContent::Parts(parts))
}

pub(crate) fn request_to_uif(request: ChatRequest, client_protocol: WireFormat) -> uif::Request {
    let mut system = Vec::new();
    let mut messages = Vec::with_capacity(request.messages.len());

    for message in request.messages {
        match message.role {
            ChatRole::System | ChatRole::Developer => {
                system.push(joined_text(&content_to_blocks(message.content)));
            }
            ChatRole::User => messages.push(Message::new(Role::User, content_to_blocks(message.content))),
            ChatRole::Assistant => {
                let mut content = Vec::new();

                if let Some(reasoning) = message.reasoning_content.filter(|r| !r.is_empty()) {
                    content.push(ContentBlock::Thinking {
                        thinking: reasoning,
                        signature: None,
                    });
                }

                content.extend(content_to_blocks(message.content));

                for call in message.tool_calls.unwrap_or_default() {
                    content.push(ContentBlock::ToolUse {
                        id: call.id,
                        name: call.function.name,
                        input: uif::parse_arguments(&call.function.arguments),
                    });
                }

                messages.push(Message::new(Role::Assistant, content));
            }
            ChatRole::Tool => messages.push(Message::new(
                Role::Tool,
                vec![ContentBlock::ToolResult {
                    tool_use_id: message.tool_call_id.unwrap_or_default(),
                    content: content_to_blocks(message.content),
                    is_error: false,
                }],
            )),
        }
    }

    let tools = request
        .tools
        .unwrap_or_default()
        .into_iter()
        .map(|tool| Tool {
            name: tool.function.name,
            description: tool.function.description,
            input_schema: tool.function.parameters.unwrap_or_else(|| serde_json::json!({"type": "object"})),
        })
        .collect();

    uif::Request {
        model: request.model,
        system: (!system.is_empty()).then(|| system.join("\n\n")),
        messages,
        parameters: Parameters {
            temperature: request.temperature,
            max_tokens: request.max_completion_tokens.or(request.max_tokens),
            top_p: request.top_p,
            top_k: None,
            stop_sequences: request.stop.map(StopField::into_vec).unwrap_or_default(),
            stream: request.stream.unwrap_or(false),
        },
        tools,
        tool_choice: request.tool_choice.map(tool_choice_from_wire),
        client_protocol,
    }
}

fn request_from_uif(request: &uif::Request) -> ChatRequest {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);

    if let Some(system) = &request.system {
        messages.push(ChatMessage::new(ChatRole::System, Some(ChatContent::Text(system.clone()))));
    }

    for message in &request.messages {
        match message.role {
            Role::System => {
                messages.push(ChatMessage::new(ChatRole::System, blocks_to_content(&message.content)));
            }
            Role::Assistant => {
                let tool_calls: Vec<_> = message
                    .content
                    .iter()
                    .filter_map(|block| match block {
                        ContentBlock::ToolUse { id, name, input } => Some(ChatToolCall {
                            id: id.clone(),
                            kind: "function".into(),
                            function: FunctionCall {
                                name: name.clone(),
                                arguments: uif::format_arguments(input),
                            },
                        }),
                        _ => None,
                    })
                    .collect();

                let text = joined_text(&message.content);
                let mut chat = ChatMessage::new(ChatRole::Assistant, (!text.is_empty()).then_some(ChatContent::Text(text)));
                chat.tool_calls = (!tool_calls.is_empty()).then_some(tool_calls);

                messages.push(chat);
            }
            Role::User | Role::Tool => {
                // Tool results become tool messages, ahead of any remaining user content.
                let mut rest = Vec::new();

                for block in &message.content {
                    match block {
                        ContentBlock::ToolResult {
                            tool_use_id, content, ..
                        } => {
                            let mut tool = ChatMessage::new(ChatRole::Tool, Some(ChatContent::Text(joined_text(content))));
                            tool.tool_call_id = Some(tool_use_id.clone());
                            messages.push(tool);
                        }
                        ContentBlock::Thinking { .. } | ContentBlock::ToolUse { .. } => (),
                        other => rest.push(other.clone()),
                    }
                }

                if !rest.is_empty() {
                    messages.push(ChatMessage::new(ChatRole::User, blocks_to_content(&rest)));
                }
            }
        }
    }

    let tools: Vec<_> = request
        .tools
        .iter()
        .map(|tool| ChatTool {
            kind: "function".into(),
            function: FunctionDefinition {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: Some(tool.input_schema.clone()),
            },
        })
        .collect();

    let parameters = &request.parameters;

    ChatRequest {
        model: request.model.clone(),
        messages,
        temperature: parameters.temperature,
        max_tokens: parameters.max_tokens,
        max_completion_tokens: None,
        top_p: parameters.top_p,
        stop: (!parameters.stop_sequences.is_empty()).then(|| StopField::Many(parameters.stop_sequences.clone())),
        stream: parameters.stream.then_some(true),
        stream_options: parameters.stream.then_some(StreamOptions { include_usage: true }),
        tools: (!tools.is_empty()).then_some(tools),
        tool_choice: request.tool_choice.as_ref().map(tool_choice_to_wire),
    }
}

fn response_to_uif(response: ChatResponse) -> uif::Response {
    let ChatResponse {
        id,
        model,
        choices,
        usage,
        ..
    } = response;

    let mut content = Vec::new();
    let mut stop_reason = StopReason::EndTurn;

    if let Some(choice) = choices.into_iter().next() {
        let message = choice.message;

        if let Some(reasoning) = message.reasoning_content.filter(|r| !r.is_empty()) {
            content.push(ContentBlock::Thinking {
                thinking: reasoning,
                signature: None,
            });
        }

        if let Some(text) = message.content.filter(|t| !t.is_empty()) {
            content.push(ContentBlock::text(text));
        }

        for call in message.tool_calls.unwrap_or_default() {
            content.push(ContentBlock::ToolUse {
                id: call.id,
                name: call.function.name,
                input: uif::parse_arguments(&call.function.arguments),
            });
        }

        stop_reason = choice
            .finish_reason
            .as_deref()
            .map(stop_reason_from_wire)
            .unwrap_or_default();
    }

    uif::Response {
        id,
        model,
        content,
        stop_reason,
        usage: usage.as_ref().map(usage_from_wire).unwrap_or_default(),
    }
}

fn response_from_uif(response: &uif::Response) -> ChatResponse {
    let text = joined_text(&response.content);

    let reasoning: String = response
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Thinking { thinking, .. } => Some(thinking.as_str()),
            _ => None,
        })
        .collect();

    let tool_calls: Vec<_> = response
        .tool_calls()
        .map(|call| ChatToolCall {
            id: call.id.to_string(),
            kind: "function".into(),
            function: FunctionCall {
                name: call.name.to_string(),
                arguments: uif::format_arguments(call.input),
            },
        })
        .collect();

    let id = if response.id.is_empty() {
        generated_id("chatcmpl-")
    } else {
        response.id.clone()
    };

    ChatResponse {
        id,
        object: "chat.completion".into(),
        created: unix_now(),
        model: response.model.clone(),
        choices: vec![ChatChoice {
            index: 0,
            message: ResponseMessage {
                role: "assistant".into(),
                content: (!text.is_empty() || tool_calls.is_empty()).then_some(text),
                reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            },
            finish_reason: Some(stop_reason_to_wire(response.stop_reason).into()),
        }],
        usage: Some(usage_to_wire(&response.usage)),
    }
}
