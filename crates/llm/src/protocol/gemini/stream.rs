use serde_json::json;

use super::{
    stop_reason_from_wire, stop_reason_to_wire, tool_call_id, usage_from_wire, usage_to_wire,
    wire::{Candidate, Content, FunctionCall, GenerateContentResponse, Part},
};
use crate::{
    error::LlmError,
    protocol::{ClientEvent, StreamDecoder, StreamEncoder, generated_id, parse_chunk},
    sse::parser::SseEvent,
    uif::{self, StopReason, StreamEvent, Usage},
};

/// Decodes `streamGenerateContent?alt=sse` chunks.
///
/// The stream has no explicit end event; the terminal events are produced in
/// [`StreamDecoder::finish`] once a finish reason has been seen.
#[derive(Debug, Default)]
pub(crate) struct ChunkDecoder {
    started: bool,
    tools: u32,
    usage: Option<Usage>,
    finish_reason: Option<String>,
}

impl StreamDecoder for ChunkDecoder {
    fn decode(&mut self, event: &SseEvent) -> crate::Result<Vec<StreamEvent>> {
        if event.data.trim().is_empty() {
            return Ok(Vec::new());
        }

        let chunk: GenerateContentResponse = parse_chunk(&event.data, "generateContent chunk")?;

        if let Some(error) = chunk.error {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());

            return Err(LlmError::Stream(message));
        }

        let mut events = Vec::new();

        if !self.started {
            self.started = true;
            events.push(StreamEvent::MessageStart {
                id: chunk.response_id.clone().unwrap_or_else(|| generated_id("resp-")),
                model: chunk.model_version.clone().unwrap_or_default(),
            });
        }

        for candidate in chunk.candidates {
            for part in candidate.content.map(|content| content.parts).unwrap_or_default() {
                let thought = part.is_thought();

                if let Some(text) = part.text.filter(|text| !text.is_empty()) {
                    events.push(if thought {
                        StreamEvent::ThinkingDelta { thinking: text }
                    } else {
                        StreamEvent::TextDelta { text }
                    });
                }

                if let Some(call) = part.function_call {
                    let index = self.tools;
                    self.tools += 1;

                    events.push(StreamEvent::ToolUseStart {
                        index,
                        id: call.id.unwrap_or_else(tool_call_id),
                        name: call.name,
                    });

                    events.push(StreamEvent::ToolUseDelta {
                        index,
                        partial_json: uif::format_arguments(&call.args),
                    });
                }

                if let Some(signature) = part.thought_signature {
                    events.push(StreamEvent::ThinkingSignature { signature });
                }
            }

            if let Some(reason) = candidate.finish_reason {
                self.finish_reason = Some(reason);
            }
        }

        if let Some(usage) = chunk.usage_metadata.as_ref() {
            self.usage = Some(usage_from_wire(usage));
        }

        Ok(events)
    }

    fn finish(&mut self) -> crate::Result<Vec<StreamEvent>> {
        let Some(reason) = self.finish_reason.take() else {
            return Err(LlmError::Stream("stream ended before a finish reason".into()));
        };

        let mut events: Vec<_> = self.usage.take().map(StreamEvent::Usage).into_iter().collect();

        events.push(StreamEvent::MessageStop {
            stop_reason: stop_reason_from_wire(&reason, self.tools > 0),
        });

        Ok(events)
    }
}

#[derive(Debug)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

/// Encodes UIF events as Gemini chunks.
///
/// Function calls are whole in this protocol, so tool argument deltas are buffered and the
/// call is emitted once the next non-tool event arrives.
#[derive(Debug, Default)]
pub(crate) struct ChunkEncoder {
    id: Option<String>,
    model: Option<String>,
    pending: Option<PendingCall>,
    usage: Option<Usage>,
}

impl ChunkEncoder {
    fn chunk(&self, parts: Vec<Part>, finish_reason: Option<StopReason>, usage: Option<Usage>) -> ClientEvent {
        let response = GenerateContentResponse {
            candidates: vec![Candidate {
                content: Some(Content {
                    role: Some("model".into()),
                    parts,
                }),
                finish_reason: finish_reason.map(|reason| stop_reason_to_wire(reason).to_string()),
                index: 0,
            }],
            usage_metadata: usage.as_ref().map(usage_to_wire),
            model_version: self.model.clone(),
            response_id: self.id.clone(),
            error: None,
        };

        ClientEvent::json(&response)
    }

    fn flush_call(&mut self, out: &mut Vec<ClientEvent>) {
        let Some(call) = self.pending.take() else {
            return;
        };

        let part = Part {
            function_call: Some(FunctionCall {
                id: Some(call.id),
                name: call.name,
                args: uif::parse_arguments(&call.arguments),
            }),
            ..Default::default()
        };

        out.push(self.chunk(vec![part], None, None));
    }
}

impl StreamEncoder for ChunkEncoder {
    fn encode(&mut self, event: &StreamEvent) -> Vec<ClientEvent> {
        let mut out = Vec::new();

        if !matches!(event, StreamEvent::ToolUseDelta { .. }) {
            self.flush_call(&mut out);
        }

        match event {
            StreamEvent::MessageStart { id, model } => {
                self.id = Some(id.clone());
                self.model = Some(model.clone());
            }
            StreamEvent::TextDelta { text } => out.push(self.chunk(vec![Part::text(text.clone())], None, None)),
            StreamEvent::ThinkingDelta { thinking } => {
                let part = Part {
                    text: Some(thinking.clone()),
                    thought: Some(true),
                    ..Default::default()
                };

                out.push(self.chunk(vec![part], None, None));
            }
            StreamEvent::ThinkingSignature { signature } => {
                let part = Part {
                    text: Some(String::new()),
                    thought_signature: Some(signature.clone()),
                    ..Default::default()
                };

                out.push(self.chunk(vec![part], None, None));
            }
            StreamEvent::ToolUseStart { id, name, .. } => {
                self.pending = Some(PendingCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: String::new(),
                });
            }
            StreamEvent::ToolUseDelta { partial_json, .. } => {
                if let Some(call) = self.pending.as_mut() {
                    call.arguments.push_str(partial_json);
                }
            }
            StreamEvent::Usage(usage) => self.usage = Some(*usage),
            StreamEvent::MessageStop { stop_reason } => {
                let usage = self.usage.take();
                out.push(self.chunk(Vec::new(), Some(*stop_reason), usage));
            }
            StreamEvent::Error { category, message } => {
                let status = match category {
                    crate::error::ErrorCategory::Timeout => "DEADLINE_EXCEEDED",
                    crate::error::ErrorCategory::Provider4xx => "INVALID_ARGUMENT",
                    _ => "UNAVAILABLE",
                };

                out.push(ClientEvent::json(&json!({
                    "error": {
                        "message": message,
                        "status": status,
                    }
                })));
            }
        }

        out
    }
}
