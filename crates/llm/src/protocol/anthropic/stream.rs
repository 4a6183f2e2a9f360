use std::collections::HashMap;

use serde_json::json;

use super::{
    stop_reason_from_wire, stop_reason_to_wire,
    wire::{AnthropicBlock, AnthropicStreamEvent, AnthropicUsage, BlockDelta, ErrorDetail, MessageDelta, MessagesResponse},
};
use crate::{
    error::{ErrorCategory, LlmError},
    protocol::{ClientEvent, StreamDecoder, StreamEncoder, generated_id, parse_chunk},
    sse::parser::SseEvent,
    uif::{StopReason, StreamEvent, Usage},
};

/// Decodes Messages stream events.
#[derive(Debug, Default)]
pub(crate) struct EventDecoder {
    /// Content block index to response-wide tool index.
    tools: HashMap<u32, u32>,
    usage: Usage,
    stop_reason: Option<StopReason>,
    done: bool,
}

impl EventDecoder {
    fn terminate(&mut self) -> Vec<StreamEvent> {
        self.done = true;

        vec![
            StreamEvent::Usage(self.usage),
            StreamEvent::MessageStop {
                stop_reason: self.stop_reason.unwrap_or_default(),
            },
        ]
    }

    fn merge_usage(&mut self, usage: &AnthropicUsage) {
        if usage.input_tokens > 0 {
            self.usage.input_tokens = usage.input_tokens;
        }

        if usage.output_tokens > 0 {
            self.usage.output_tokens = usage.output_tokens;
        }

        if let Some(cached) = usage.cache_read_input_tokens {
            self.usage.cache_read_tokens = cached;
        }
    }
}

impl StreamDecoder for EventDecoder {
    fn decode(&mut self, event: &SseEvent) -> crate::Result<Vec<StreamEvent>> {
        if self.done || event.data.trim().is_empty() {
            return Ok(Vec::new());
        }

        let event: AnthropicStreamEvent = parse_chunk(&event.data, "message stream event")?;

        let events = match event {
            AnthropicStreamEvent::MessageStart { message } => {
                self.merge_usage(&message.usage);

                vec![StreamEvent::MessageStart {
                    id: message.id,
                    model: message.model,
                }]
            }
            AnthropicStreamEvent::ContentBlockStart { index, content_block } => match content_block {
                AnthropicBlock::ToolUse { id, name, .. } => {
                    let tool = self.tools.len() as u32;
                    self.tools.insert(index, tool);

                    vec![StreamEvent::ToolUseStart { index: tool, id, name }]
                }
                AnthropicBlock::Text { text } if !text.is_empty() => vec![StreamEvent::TextDelta { text }],
                AnthropicBlock::Thinking { thinking, .. } if !thinking.is_empty() => {
                    vec![StreamEvent::ThinkingDelta { thinking }]
                }
                _ => Vec::new(),
            },
            AnthropicStreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => vec![StreamEvent::TextDelta { text }],
                BlockDelta::ThinkingDelta { thinking } => vec![StreamEvent::ThinkingDelta { thinking }],
                BlockDelta::SignatureDelta { signature } => vec![StreamEvent::ThinkingSignature { signature }],
                BlockDelta::InputJsonDelta { partial_json } => match self.tools.get(&index) {
                    Some(&tool) => vec![StreamEvent::ToolUseDelta {
                        index: tool,
                        partial_json,
                    }],
                    None => {
                        log::debug!("Dropping input delta for non-tool block {index}");
                        Vec::new()
                    }
                },
                BlockDelta::Unsupported => Vec::new(),
            },
            AnthropicStreamEvent::MessageDelta { delta, usage } => {
                if let Some(reason) = delta.stop_reason {
                    self.stop_reason = Some(stop_reason_from_wire(&reason));
                }

                if let Some(usage) = usage {
                    self.merge_usage(&usage);
                }

                Vec::new()
            }
            AnthropicStreamEvent::MessageStop => self.terminate(),
            AnthropicStreamEvent::ContentBlockStop { .. } | AnthropicStreamEvent::Ping => Vec::new(),
            AnthropicStreamEvent::Error { error } => {
                return Err(LlmError::Stream(format!("{}: {}", error.kind, error.message)));
            }
        };

        Ok(events)
    }

    fn finish(&mut self) -> crate::Result<Vec<StreamEvent>> {
        if self.done {
            return Ok(Vec::new());
        }

        match self.stop_reason {
            Some(_) => Ok(self.terminate()),
            None => Err(LlmError::Stream("stream ended before message_stop".into())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    Text,
    Thinking,
    Tool(u32),
}

/// Encodes UIF events as Messages stream events, opening and closing content blocks as the
/// kind of content changes.
#[derive(Debug, Default)]
pub(crate) struct EventEncoder {
    started: bool,
    open: Option<(OpenBlock, u32)>,
    next_block: u32,
    usage: Usage,
}

impl EventEncoder {
    fn emit(event: AnthropicStreamEvent) -> ClientEvent {
        ClientEvent::named(event.name(), &event)
    }

    fn start(&mut self, id: Option<&str>, model: &str, out: &mut Vec<ClientEvent>) {
        if self.started {
            return;
        }

        self.started = true;

        let message = MessagesResponse {
            id: id.filter(|id| !id.is_empty()).map(str::to_string).unwrap_or_else(|| generated_id("msg_")),
            kind: "message".into(),
            role: "assistant".into(),
            model: model.to_string(),
            content: Vec::new(),
            stop_reason: None,
            stop_sequence: None,
            usage: AnthropicUsage::default(),
        };

        out.push(Self::emit(AnthropicStreamEvent::MessageStart { message }));
    }

    fn close(&mut self, out: &mut Vec<ClientEvent>) {
        if let Some((_, index)) = self.open.take() {
            out.push(Self::emit(AnthropicStreamEvent::ContentBlockStop { index }));
        }
    }

    /// Returns the index of an open block of `kind`, opening one if needed.
    fn ensure(&mut self, kind: OpenBlock, content_block: impl FnOnce() -> AnthropicBlock, out: &mut Vec<ClientEvent>) -> u32 {
        if let Some((open, index)) = self.open
            && open == kind
        {
            return index;
        }

        self.close(out);

        let index = self.next_block;
        self.next_block += 1;
        self.open = Some((kind, index));

        out.push(Self::emit(AnthropicStreamEvent::ContentBlockStart {
            index,
            content_block: content_block(),
        }));

        index
    }
}

impl StreamEncoder for EventEncoder {
    fn encode(&mut self, event: &StreamEvent) -> Vec<ClientEvent> {
        let mut out = Vec::new();

        if !matches!(event, StreamEvent::Error { .. } | StreamEvent::MessageStart { .. }) {
            self.start(None, "", &mut out);
        }

        match event {
            StreamEvent::MessageStart { id, model } => self.start(Some(id.as_str()), model, &mut out),
            StreamEvent::TextDelta { text } => {
                let index = self.ensure(OpenBlock::Text, || AnthropicBlock::Text { text: String::new() }, &mut out);

                out.push(Self::emit(AnthropicStreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::TextDelta { text: text.clone() },
                }));
            }
            StreamEvent::ThinkingDelta { thinking } => {
                let index = self.ensure(OpenBlock::Thinking, thinking_block, &mut out);

                out.push(Self::emit(AnthropicStreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::ThinkingDelta {
                        thinking: thinking.clone(),
                    },
                }));
            }
            StreamEvent::ThinkingSignature { signature } => {
                let index = self.ensure(OpenBlock::Thinking, thinking_block, &mut out);

                out.push(Self::emit(AnthropicStreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::SignatureDelta {
                        signature: signature.clone(),
                    },
                }));
            }
            StreamEvent::ToolUseStart { index, id, name } => {
                self.close(&mut out);

                self.ensure(
                    OpenBlock::Tool(*index),
                    || AnthropicBlock::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input: json!({}),
                    },
                    &mut out,
                );
            }
            StreamEvent::ToolUseDelta { index, partial_json } => match self.open {
                Some((OpenBlock::Tool(tool), block)) if tool == *index => {
                    out.push(Self::emit(AnthropicStreamEvent::ContentBlockDelta {
                        index: block,
                        delta: BlockDelta::InputJsonDelta {
                            partial_json: partial_json.clone(),
                        },
                    }));
                }
                _ => log::debug!("Dropping arguments for tool call {index}, its block is closed"),
            },
            StreamEvent::Usage(usage) => self.usage = *usage,
            StreamEvent::MessageStop { stop_reason } => {
                self.close(&mut out);

                out.push(Self::emit(AnthropicStreamEvent::MessageDelta {
                    delta: MessageDelta {
                        stop_reason: Some(stop_reason_to_wire(*stop_reason).into()),
                        stop_sequence: None,
                    },
                    usage: Some(AnthropicUsage {
                        input_tokens: self.usage.input_tokens,
                        output_tokens: self.usage.output_tokens,
                        cache_read_input_tokens: None,
                    }),
                }));

                out.push(Self::emit(AnthropicStreamEvent::MessageStop));
            }
            StreamEvent::Error { category, message } => {
                out.push(Self::emit(AnthropicStreamEvent::Error {
                    error: ErrorDetail {
                        kind: error_type(*category).into(),
                        message: message.clone(),
                    },
                }));
            }
        }

        out
    }
}

fn thinking_block() -> AnthropicBlock {
    AnthropicBlock::Thinking {
        thinking: String::new(),
        signature: None,
    }
}

fn error_type(category: ErrorCategory) -> &'static str {
    match category {
        ErrorCategory::Provider4xx => "invalid_request_error",
        ErrorCategory::Timeout => "timeout_error",
        ErrorCategory::InternalError => "internal_error",
        _ => "api_error",
    }
}
