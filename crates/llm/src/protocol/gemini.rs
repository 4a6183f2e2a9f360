//! Gemini `generateContent`, also spoken by Vertex AI for Google models.
//!
//! Gemini has no tool call ids of its own. Calls without one get a generated `call_<uuid>` id,
//! and outbound function responses recover the function name through a [`ToolIndex`].

mod stream;
mod wire;

use std::collections::{HashMap, VecDeque};

use serde_json::{Value, json};

use self::wire::{
    Blob, Candidate, Content, FileData, FunctionCall, FunctionCallingConfig, FunctionDeclaration, FunctionResponse,
    GeminiTool, GenerateContentRequest, GenerateContentResponse, GenerationConfig, Part, ToolConfig, UsageMetadata,
};
use super::{
    ProtocolHooks, StreamDecoder, StreamEncoder, ToolIndex, WireFormat, coalesce, from_client, from_provider,
    generated_id, to_value, tool_role_as_user,
};
use crate::{
    error::LlmError,
    uif::{
        self, ContentBlock, ImageSource, Message, Parameters, Role, StopReason, Tool, ToolChoice, Usage, joined_text,
    },
};

pub(crate) struct Gemini;

impl ProtocolHooks for Gemini {
    fn decode_request(&self, body: Value) -> crate::Result<uif::Request> {
        let request: GenerateContentRequest = from_client(body)?;
        Ok(request_to_uif(request))
    }

    fn encode_request(&self, request: &uif::Request) -> crate::Result<Value> {
        to_value(&request_from_uif(request)?)
    }

    fn decode_response(&self, body: Value) -> crate::Result<uif::Response> {
        let response: GenerateContentResponse = from_provider(body, "generateContent response")?;
        Ok(response_to_uif(response))
    }

    fn encode_response(&self, response: &uif::Response) -> crate::Result<Value> {
        to_value(&response_from_uif(response)?)
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(stream::ChunkDecoder::default())
    }

    fn stream_encoder(&self) -> Box<dyn StreamEncoder> {
        Box::new(stream::ChunkEncoder::default())
    }
}

pub(crate) fn tool_call_id() -> String {
    generated_id("call_")
}

fn stop_reason_from_wire(reason: &str, has_tool_calls: bool) -> StopReason {
    match reason {
        "STOP" if has_tool_calls => StopReason::ToolUse,
        "MAX_TOKENS" => StopReason::MaxTokens,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" | "IMAGE_SAFETY" => {
            StopReason::ContentFilter
        }
        _ => StopReason::EndTurn,
    }
}

fn stop_reason_to_wire(reason: StopReason) -> &'static str {
    match reason {
        StopReason::EndTurn | StopReason::ToolUse | StopReason::StopSequence => "STOP",
        StopReason::MaxTokens => "MAX_TOKENS",
        StopReason::ContentFilter => "SAFETY",
    }
}

fn usage_from_wire(usage: &UsageMetadata) -> Usage {
    Usage {
        input_tokens: usage.prompt_token_count,
        output_tokens: usage.candidates_token_count + usage.thoughts_token_count.unwrap_or_default(),
        cache_read_tokens: usage.cached_content_token_count.unwrap_or_default(),
    }
}

fn usage_to_wire(usage: &Usage) -> UsageMetadata {
    UsageMetadata {
        prompt_token_count: usage.input_tokens,
        candidates_token_count: usage.output_tokens,
        total_token_count: usage.input_tokens + usage.output_tokens,
        cached_content_token_count: (usage.cache_read_tokens > 0).then_some(usage.cache_read_tokens),
        thoughts_token_count: None,
    }
}

/// Ids of calls still waiting for a function response, per function name, so responses
/// without an id pair with the oldest open call of the same name.
#[derive(Debug, Default)]
struct OpenCalls {
    by_name: HashMap<String, VecDeque<String>>,
}

impl OpenCalls {
    fn call(&mut self, call: FunctionCall) -> ContentBlock {
        let id = call.id.unwrap_or_else(tool_call_id);

        self.by_name.entry(call.name.clone()).or_default().push_back(id.clone());

        ContentBlock::ToolUse {
            id,
            name: call.name,
            input: call.args,
        }
    }

    fn response(&mut self, response: FunctionResponse) -> ContentBlock {
        let queued = self.by_name.get_mut(&response.name).and_then(VecDeque::pop_front);

        let tool_use_id = match response.id {
            Some(id) => id,
            None => queued.unwrap_or_else(tool_call_id),
        };

        let (payload, is_error) = match response.response.get("error") {
            Some(error) => (error, true),
            None => (response.response.get("result").unwrap_or(&response.response), false),
        };

        let text = match payload {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };

        ContentBlock::ToolResult {
            tool_use_id,
            content: vec![ContentBlock::text(text)],
            is_error,
        }
    }
}

/// Converts one part, splitting an attached `thoughtSignature` into a signature-only
/// thinking block right after it.
fn part_to_blocks(part: Part, calls: &mut OpenCalls, out: &mut Vec<ContentBlock>) {
    let thought = part.is_thought();

    let Part {
        text,
        thought_signature,
        function_call,
        function_response,
        inline_data,
        file_data,
        ..
    } = part;

    if let Some(text) = text {
        if thought {
            out.push(ContentBlock::Thinking {
                thinking: text,
                signature: None,
            });
        } else if !text.is_empty() {
            out.push(ContentBlock::text(text));
        }
    }

    if let Some(call) = function_call {
        out.push(calls.call(call));
    }

    if let Some(response) = function_response {
        out.push(calls.response(response));
    }

    if let Some(blob) = inline_data {
        out.push(ContentBlock::Image {
            source: ImageSource::Base64 {
                media_type: blob.mime_type,
                data: blob.data,
            },
        });
    }

    if let Some(file) = file_data {
        out.push(ContentBlock::Image {
            source: ImageSource::Url {
                url: file.file_uri,
                media_type: file.mime_type,
            },
        });
    }

    if let Some(signature) = thought_signature {
        out.push(ContentBlock::signature(signature));
    }
}

fn parts_to_blocks(parts: Vec<Part>, calls: &mut OpenCalls) -> Vec<ContentBlock> {
    let mut blocks = Vec::with_capacity(parts.len());

    for part in parts {
        part_to_blocks(part, calls, &mut blocks);
    }

    blocks
}

/// Converts blocks to parts. A signature-only thinking block is attached to the part before it.
/// Function responses are keyed by name, so a tool result without its call is rejected.
fn blocks_to_parts(blocks: &[ContentBlock], index: &ToolIndex<'_>) -> crate::Result<Vec<Part>> {
    let mut parts: Vec<Part> = Vec::with_capacity(blocks.len());

    for block in blocks {
        if let Some(signature) = block.signature_only() {
            match parts.last_mut() {
                Some(previous) => previous.thought_signature = Some(signature.to_string()),
                None => log::debug!("Dropping thought signature with no preceding part"),
            }

            continue;
        }

        let part = match block {
            ContentBlock::Text { text } => Part::text(text.clone()),
            ContentBlock::Thinking { thinking, signature } => Part {
                text: Some(thinking.clone()),
                thought: Some(true),
                thought_signature: signature.clone(),
                ..Default::default()
            },
            ContentBlock::ToolUse { id, name, input } => Part {
                function_call: Some(FunctionCall {
                    id: Some(id.clone()),
                    name: name.clone(),
                    args: input.clone(),
                }),
                ..Default::default()
            },
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let Some(name) = index.name_of(tool_use_id) else {
                    return Err(LlmError::InvalidRequest(format!(
                        "tool result {tool_use_id} has no matching tool call in the conversation"
                    )));
                };

                let key = if *is_error { "error" } else { "result" };

                Part {
                    function_response: Some(FunctionResponse {
                        id: Some(tool_use_id.clone()),
                        name: name.to_string(),
                        response: json!({ key: joined_text(content) }),
                    }),
                    ..Default::default()
                }
            }
            ContentBlock::Image { source } => match source {
                ImageSource::Base64 { media_type, data } => Part {
                    inline_data: Some(Blob {
                        mime_type: media_type.clone(),
                        data: data.clone(),
                    }),
                    ..Default::default()
                },
                ImageSource::Url { url, media_type } => Part {
                    file_data: Some(FileData {
                        mime_type: media_type.clone(),
                        file_uri: url.clone(),
                    }),
                    ..Default::default()
                },
            },
        };

        parts.push(part);
    }

    Ok(parts)
}

/// Removes JSON Schema keywords the Gemini function declaration schema rejects.
fn sanitize_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !matches!(key.as_str(), "$schema" | "additionalProperties"))
                .map(|(key, value)| (key.clone(), sanitize_schema(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_schema).collect()),
        other => other.clone(),
    }
}

fn request_to_uif(request: GenerateContentRequest) -> uif::Request {
    let mut calls = OpenCalls::default();

    let system = request
        .system_instruction
        .map(|content| joined_text(&parts_to_blocks(content.parts, &mut calls)))
        .filter(|system| !system.is_empty());

    let messages = request
        .contents
        .into_iter()
        .map(|content| {
            let blocks = parts_to_blocks(content.parts, &mut calls);

            let only_results =
                !blocks.is_empty() && blocks.iter().all(|block| matches!(block, ContentBlock::ToolResult { .. }));

            let role = match content.role.as_deref() {
                Some("model") => Role::Assistant,
                _ if only_results => Role::Tool,
                _ => Role::User,
            };

            Message::new(role, blocks)
        })
        .collect();

    let tools = request
        .tools
        .into_iter()
        .flat_map(|tool| tool.function_declarations)
        .map(|declaration| Tool {
            name: declaration.name,
            description: declaration.description,
            input_schema: declaration.parameters.unwrap_or_else(|| json!({"type": "object"})),
        })
        .collect();

    let tool_choice = request.tool_config.map(|config| {
        let FunctionCallingConfig {
            mode,
            mut allowed_function_names,
        } = config.function_calling_config;

        match mode.as_deref() {
            Some("ANY") if allowed_function_names.len() == 1 => ToolChoice::Tool {
                name: allowed_function_names.remove(0),
            },
            Some("ANY") => ToolChoice::Any,
            Some("NONE") => ToolChoice::None,
            _ => ToolChoice::Auto,
        }
    });

    let generation = request.generation_config.unwrap_or_default();

    uif::Request {
        model: request.model.unwrap_or_default(),
        system,
        messages,
        parameters: Parameters {
            temperature: generation.temperature,
            max_tokens: generation.max_output_tokens,
            top_p: generation.top_p,
            top_k: generation.top_k,
            stop_sequences: generation.stop_sequences,
            stream: false,
        },
        tools,
        tool_choice,
        client_protocol: WireFormat::Gemini,
    }
}

fn request_from_uif(request: &uif::Request) -> crate::Result<GenerateContentRequest> {
    let index = ToolIndex::build(&request.messages);
    let mut system: Vec<String> = request.system.iter().cloned().collect();

    let turns: Vec<Message> = request
        .messages
        .iter()
        .filter(|message| {
            if message.role == Role::System {
                system.push(joined_text(&message.content));
                false
            } else {
                true
            }
        })
        .cloned()
        .map(tool_role_as_user)
        .collect();

    let mut contents = Vec::new();

    for message in coalesce(turns) {
        let parts = blocks_to_parts(&message.content, &index)?;

        if parts.is_empty() {
            continue;
        }

        contents.push(Content {
            role: Some(match message.role {
                Role::Assistant => "model".to_string(),
                _ => "user".to_string(),
            }),
            parts,
        });
    }

    let declarations: Vec<_> = request
        .tools
        .iter()
        .map(|tool| FunctionDeclaration {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: Some(sanitize_schema(&tool.input_schema)),
        })
        .collect();

    let tool_config = request.tool_choice.as_ref().map(|choice| {
        let (mode, allowed_function_names) = match choice {
            ToolChoice::Auto => ("AUTO", Vec::new()),
            ToolChoice::Any => ("ANY", Vec::new()),
            ToolChoice::None => ("NONE", Vec::new()),
            ToolChoice::Tool { name } => ("ANY", vec![name.clone()]),
        };

        ToolConfig {
            function_calling_config: FunctionCallingConfig {
                mode: Some(mode.to_string()),
                allowed_function_names,
            },
        }
    });

    let parameters = &request.parameters;

    let generation_config = GenerationConfig {
        temperature: parameters.temperature,
        top_p: parameters.top_p,
        top_k: parameters.top_k,
        max_output_tokens: parameters.max_tokens,
        stop_sequences: parameters.stop_sequences.clone(),
    };

    let has_generation_config = parameters.temperature.is_some()
        || parameters.top_p.is_some()
        || parameters.top_k.is_some()
        || parameters.max_tokens.is_some()
        || !parameters.stop_sequences.is_empty();

    Ok(GenerateContentRequest {
        model: None,
        contents,
        system_instruction: (!system.is_empty()).then(|| Content {
            role: None,
            parts: vec![Part::text(system.join("\n\n"))],
        }),
        tools: if declarations.is_empty() {
            Vec::new()
        } else {
            vec![GeminiTool {
                function_declarations: declarations,
            }]
        },
        tool_config,
        generation_config: has_generation_config.then_some(generation_config),
    })
}

fn response_to_uif(response: GenerateContentResponse) -> uif::Response {
    let mut calls = OpenCalls::default();

    let candidate = response.candidates.into_iter().next().unwrap_or_default();
    let content = candidate
        .content
        .map(|content| parts_to_blocks(content.parts, &mut calls))
        .unwrap_or_default();

    let has_tool_calls = content.iter().any(|block| matches!(block, ContentBlock::ToolUse { .. }));

    uif::Response {
        id: response.response_id.unwrap_or_default(),
        model: response.model_version.unwrap_or_default(),
        content,
        stop_reason: candidate
            .finish_reason
            .as_deref()
            .map(|reason| stop_reason_from_wire(reason, has_tool_calls))
            .unwrap_or_default(),
        usage: response.usage_metadata.as_ref().map(usage_from_wire).unwrap_or_default(),
    }
}

fn response_from_uif(response: &uif::Response) -> crate::Result<GenerateContentResponse> {
    let index = ToolIndex::default();

    Ok(GenerateContentResponse {
        candidates: vec![Candidate {
            content: Some(Content {
                role: Some("model".into()),
                parts: blocks_to_parts(&response.content, &index)?,
            }),
            finish_reason: Some(stop_reason_to_wire(response.stop_reason).into()),
            index: 0,
        }],
        usage_metadata: Some(usage_to_wire(&response.usage)),
        model_version: Some(response.model.clone()),
        response_id: (!response.id.is_empty()).then(|| response.id.clone()),
        error: None,
    })
}
