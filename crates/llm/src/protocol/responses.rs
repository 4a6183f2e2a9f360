//! OpenAI Responses API.

mod stream;
mod wire;

use serde_json::{Value, json};

use self::wire::{
    ContentPart, FunctionTool, IncompleteDetails, Input, InputItem, InputTokensDetails, MessageContent, OutputItem,
    ResponseObject, ResponsesRequest, ResponsesToolChoice, ResponsesUsage, SummaryText,
};
use super::{
    ProtocolHooks, StreamDecoder, StreamEncoder, WireFormat, coalesce, from_client, from_provider, generated_id,
    to_value, unix_now,
};
use crate::uif::{
    self, ContentBlock, ImageSource, Message, Parameters, Role, StopReason, Tool, ToolChoice, Usage, joined_text,
};

pub(crate) struct Responses;

impl ProtocolHooks for Responses {
    fn decode_request(&self, body: Value) -> crate::Result<uif::Request> {
        let request: ResponsesRequest = from_client(body)?;
        Ok(request_to_uif(request))
    }

    fn encode_request(&self, request: &uif::Request) -> crate::Result<Value> {
        to_value(&request_from_uif(request))
    }

    fn decode_response(&self, body: Value) -> crate::Result<uif::Response> {
        let response: ResponseObject = from_provider(body, "response")?;
        Ok(response_to_uif(response))
    }

    fn encode_response(&self, response: &uif::Response) -> crate::Result<Value> {
        let id = if response.id.is_empty() {
            generated_id("resp_")
        } else {
            response.id.clone()
        };

        let output = output_items(&response.content);
        let object = response_object(id, &response.model, unix_now(), response.stop_reason, output, Some(&response.usage));

        to_value(&object)
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(stream::EventDecoder::default())
    }

    fn stream_encoder(&self) -> Box<dyn StreamEncoder> {
        Box::new(stream::EventEncoder::default())
    }
}

fn usage_from_wire(usage: &ResponsesUsage) -> Usage {
    Usage {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cache_read_tokens: usage
            .input_tokens_details
            .map(|details| details.cached_tokens)
            .unwrap_or_default(),
    }
}

fn usage_to_wire(usage: &Usage) -> ResponsesUsage {
    ResponsesUsage {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        total_tokens: usage.input_tokens + usage.output_tokens,
        input_tokens_details: Some(InputTokensDetails {
            cached_tokens: usage.cache_read_tokens,
        }),
    }
}

/// Status and stop reason are split on this API: `incomplete` carries the reason, `completed`
/// with function calls means the model wants tools.
fn stop_reason_from_wire(response: &ResponseObject) -> StopReason {
    let has_calls = response
        .output
        .iter()
        .any(|item| matches!(item, OutputItem::FunctionCall { .. }));

    let refused = response.output.iter().any(|item| match item {
        OutputItem::Message { content, .. } => content.iter().any(|part| matches!(part, ContentPart::Refusal { .. })),
        _ => false,
    });

    match (response.status.as_str(), response.incomplete_details.as_ref()) {
        ("incomplete", Some(details)) if details.reason == "max_output_tokens" => StopReason::MaxTokens,
        ("incomplete", Some(details)) if details.reason == "content_filter" => StopReason::ContentFilter,
        _ if refused => StopReason::ContentFilter,
        _ if has_calls => StopReason::ToolUse,
        _ => StopReason::EndTurn,
    }
}

fn status_for(stop_reason: StopReason) -> (&'static str, Option<IncompleteDetails>) {
    let reason = match stop_reason {
        StopReason::MaxTokens => "max_output_tokens",
        StopReason::ContentFilter => "content_filter",
        _ => return ("completed", None),
    };

    (
        "incomplete",
        Some(IncompleteDetails {
            reason: reason.to_string(),
        }),
    )
}

pub(crate) fn response_object(
    id: String,
    model: &str,
    created_at: u64,
    stop_reason: StopReason,
    output: Vec<OutputItem>,
    usage: Option<&Usage>,
) -> ResponseObject {
    let (status, incomplete_details) = status_for(stop_reason);

    ResponseObject {
        id,
        object: "response".into(),
        created_at,
        model: model.to_string(),
        status: status.into(),
        incomplete_details,
        output,
        usage: usage.map(usage_to_wire),
        error: None,
    }
}

fn parts_to_blocks(content: MessageContent) -> Vec<ContentBlock> {
    let parts = match content {
        MessageContent::Text(text) => return vec![ContentBlock::text(text)],
        MessageContent::Parts(parts) => parts,
    };

    parts
        .into_iter()
        .filter_map(|part| match part {
            ContentPart::InputText { text } | ContentPart::OutputText { text, .. } => Some(ContentBlock::text(text)),
            ContentPart::Refusal { refusal } => Some(ContentBlock::text(refusal)),
            ContentPart::InputImage { image_url } => image_url.map(|url| ContentBlock::Image {
                source: ImageSource::from_url(&url),
            }),
            ContentPart::Unsupported => None,
        })
        .collect()
}

fn output_text(text: String) -> ContentPart {
    ContentPart::OutputText {
        text,
        annotations: Vec::new(),
    }
}

fn summary_text(summary: &[SummaryText]) -> String {
    summary.iter().map(|part| part.text.as_str()).collect::<Vec<_>>().join("\n")
}

fn request_to_uif(request: ResponsesRequest) -> uif::Request {
    let mut system: Vec<String> = request.instructions.into_iter().collect();
    let mut messages = Vec::new();

    let items = match request.input {
        Input::Text(text) => vec![InputItem {
            role: Some("user".into()),
            content: Some(MessageContent::Text(text)),
            ..Default::default()
        }],
        Input::Items(items) => items,
    };

    for item in items {
        match item.kind.as_deref().unwrap_or("message") {
            "message" => {
                let content = item.content.map(parts_to_blocks).unwrap_or_default();

                match item.role.as_deref() {
                    Some("system" | "developer") => system.push(joined_text(&content)),
                    Some("assistant") => messages.push(Message::new(Role::Assistant, content)),
                    _ => messages.push(Message::new(Role::User, content)),
                }
            }
            "function_call" => messages.push(Message::new(
                Role::Assistant,
                vec![ContentBlock::ToolUse {
                    id: item.call_id.unwrap_or_default(),
                    name: item.name.unwrap_or_default(),
                    input: uif::parse_arguments(item.arguments.as_deref().unwrap_or_default()),
                }],
            )),
            "function_call_output" => {
                let output = match item.output {
                    Some(Value::String(output)) => output,
                    Some(other) => other.to_string(),
                    None => String::new(),
                };

                messages.push(Message::new(
                    Role::Tool,
                    vec![ContentBlock::ToolResult {
                        tool_use_id: item.call_id.unwrap_or_default(),
                        content: vec![ContentBlock::text(output)],
                        is_error: false,
                    }],
                ));
            }
            "reasoning" => messages.push(Message::new(
                Role::Assistant,
                vec![ContentBlock::Thinking {
                    thinking: summary_text(item.summary.as_deref().unwrap_or_default()),
                    signature: item.encrypted_content,
                }],
            )),
            other => log::debug!("Ignoring unsupported input item type {other}"),
        }
    }

    let tool_choice = request.tool_choice.map(|choice| match choice {
        ResponsesToolChoice::Function { kind, name } if kind == "function" => ToolChoice::Tool { name },
        ResponsesToolChoice::Mode(mode) => match mode.as_str() {
            "none" => ToolChoice::None,
            "required" => ToolChoice::Any,
            _ => ToolChoice::Auto,
        },
        ResponsesToolChoice::Function { .. } | ResponsesToolChoice::Other(_) => ToolChoice::Auto,
    });

    uif::Request {
        model: request.model,
        system: (!system.is_empty()).then(|| system.join("\n\n")),
        messages: coalesce(messages),
        parameters: Parameters {
            temperature: request.temperature,
            max_tokens: request.max_output_tokens,
            top_p: request.top_p,
            top_k: None,
            stop_sequences: Vec::new(),
            stream: request.stream.unwrap_or(false),
        },
        tools: request
            .tools
            .into_iter()
            .filter(|tool| tool.kind == "function")
            .map(|tool| Tool {
                name: tool.name,
                description: tool.description,
                input_schema: tool.parameters.unwrap_or_else(|| json!({"type": "object"})),
            })
            .collect(),
        tool_choice,
        client_protocol: WireFormat::Responses,
    }
}

fn request_from_uif(request: &uif::Request) -> ResponsesRequest {
    let mut system: Vec<String> = request.system.iter().cloned().collect();
    let mut input = Vec::new();

    for message in &request.messages {
        let role = match message.role {
            Role::System => {
                system.push(joined_text(&message.content));
                continue;
            }
            Role::Assistant => "assistant",
            Role::User | Role::Tool => "user",
        };

        // Consecutive text and image blocks share one message item.
        let mut parts = Vec::new();

        for block in &message.content {
            match block {
                ContentBlock::Text { text } if role == "assistant" => parts.push(output_text(text.clone())),
                ContentBlock::Text { text } => parts.push(ContentPart::InputText { text: text.clone() }),
                ContentBlock::Image { source } => parts.push(ContentPart::InputImage {
                    image_url: Some(source.to_url()),
                }),
                other => {
                    if !parts.is_empty() {
                        input.push(InputItem::message(role, std::mem::take(&mut parts)));
                    }

                    match other {
                        ContentBlock::ToolUse { id, name, input: arguments } => {
                            input.push(InputItem::function_call(id, name, uif::format_arguments(arguments)));
                        }
                        ContentBlock::ToolResult {
                            tool_use_id, content, ..
                        } => input.push(InputItem::function_call_output(tool_use_id, joined_text(content))),
                        ContentBlock::Thinking {
                            thinking,
                            signature: Some(signature),
                        } => input.push(InputItem::reasoning(thinking.clone(), signature.clone())),
                        _ => (),
                    }
                }
            }
        }

        if !parts.is_empty() {
            input.push(InputItem::message(role, parts));
        }
    }

    let tool_choice = request.tool_choice.as_ref().map(|choice| match choice {
        ToolChoice::Auto => ResponsesToolChoice::Mode("auto".into()),
        ToolChoice::Any => ResponsesToolChoice::Mode("required".into()),
        ToolChoice::None => ResponsesToolChoice::Mode("none".into()),
        ToolChoice::Tool { name } => ResponsesToolChoice::Function {
            kind: "function".into(),
            name: name.clone(),
        },
    });

    let parameters = &request.parameters;

    ResponsesRequest {
        model: request.model.clone(),
        input: Input::Items(input),
        instructions: (!system.is_empty()).then(|| system.join("\n\n")),
        max_output_tokens: parameters.max_tokens,
        temperature: parameters.temperature,
        top_p: parameters.top_p,
        stream: parameters.stream.then_some(true),
        tools: request
            .tools
            .iter()
            .map(|tool| FunctionTool {
                kind: "function".into(),
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: Some(tool.input_schema.clone()),
            })
            .collect(),
        tool_choice,
    }
}

fn response_to_uif(response: ResponseObject) -> uif::Response {
    let stop_reason = stop_reason_from_wire(&response);
    let mut content = Vec::new();

    for item in response.output {
        match item {
            OutputItem::Message { content: parts, .. } => {
                content.extend(parts_to_blocks(MessageContent::Parts(parts)));
            }
            OutputItem::FunctionCall {
                call_id,
                name,
                arguments,
                ..
            } => content.push(ContentBlock::ToolUse {
                id: call_id,
                name,
                input: uif::parse_arguments(&arguments),
            }),
            OutputItem::Reasoning {
                summary,
                encrypted_content,
                ..
            } => content.push(ContentBlock::Thinking {
                thinking: summary_text(&summary),
                signature: encrypted_content,
            }),
            OutputItem::Unsupported => (),
        }
    }

    uif::Response {
        id: response.id,
        model: response.model,
        content,
        stop_reason,
        usage: response.usage.as_ref().map(usage_from_wire).unwrap_or_default(),
    }
}

/// Output items for a complete response, merging adjacent text into one message item.
fn output_items(content: &[ContentBlock]) -> Vec<OutputItem> {
    let mut items = Vec::new();
    let mut text = Vec::new();

    let flush = |text: &mut Vec<ContentPart>, items: &mut Vec<OutputItem>| {
        if !text.is_empty() {
            items.push(OutputItem::Message {
                id: generated_id("msg_"),
                status: Some("completed".into()),
                role: "assistant".into(),
                content: std::mem::take(text),
            });
        }
    };

    for block in content {
        match block {
            ContentBlock::Text { text: chunk } => text.push(output_text(chunk.clone())),
            ContentBlock::ToolUse { id, name, input } => {
                flush(&mut text, &mut items);

                items.push(OutputItem::FunctionCall {
                    id: generated_id("fc_"),
                    call_id: id.clone(),
                    name: name.clone(),
                    arguments: uif::format_arguments(input),
                    status: Some("completed".into()),
                });
            }
            ContentBlock::Thinking { thinking, signature } => {
                flush(&mut text, &mut items);

                items.push(OutputItem::Reasoning {
                    id: generated_id("rs_"),
                    summary: if thinking.is_empty() {
                        Vec::new()
                    } else {
                        vec![SummaryText::new(thinking.clone())]
                    },
                    encrypted_content: signature.clone(),
                });
            }
            ContentBlock::ToolResult { .. } | ContentBlock::Image { .. } => (),
        }
    }

    flush(&mut text, &mut items);

    items
}
