use std::collections::HashMap;

use serde_json::json;

use super::{
    stop_reason_from_wire, stop_reason_to_wire, usage_from_wire, usage_to_wire,
    wire::{ChatChunk, ChunkChoice, ChunkDelta, FunctionDelta, ToolCallDelta},
};
use crate::{
    error::LlmError,
    protocol::{ClientEvent, StreamDecoder, StreamEncoder, generated_id, parse_chunk, unix_now},
    sse::parser::SseEvent,
    uif::{StopReason, StreamEvent, Usage},
};

/// Decodes `chat.completion.chunk` events.
#[derive(Debug, Default)]
pub(crate) struct ChunkDecoder {
    started: bool,
    /// Wire tool index to response-wide tool index.
    tools: HashMap<u32, u32>,
    usage: Option<Usage>,
    stop_reason: Option<StopReason>,
    done: bool,
}

impl ChunkDecoder {
    fn terminate(&mut self, stop_reason: StopReason) -> Vec<StreamEvent> {
        self.done = true;

        let mut events = Vec::with_capacity(2);

        if let Some(usage) = self.usage.take() {
            events.push(StreamEvent::Usage(usage));
        }

        events.push(StreamEvent::MessageStop { stop_reason });
        events
    }

    fn decode_choice(&mut self, choice: ChunkChoice, events: &mut Vec<StreamEvent>) {
        let ChunkDelta {
            content,
            reasoning_content,
            tool_calls,
            ..
        } = choice.delta;

        if let Some(thinking) = reasoning_content.filter(|t| !t.is_empty()) {
            events.push(StreamEvent::ThinkingDelta { thinking });
        }

        if let Some(text) = content.filter(|t| !t.is_empty()) {
            events.push(StreamEvent::TextDelta { text });
        }

        for call in tool_calls.unwrap_or_default() {
            let function = call.function.unwrap_or_default();

            if let Some(id) = call.id {
                let index = self.tools.len() as u32;
                self.tools.insert(call.index, index);

                events.push(StreamEvent::ToolUseStart {
                    index,
                    id,
                    name: function.name.unwrap_or_default(),
                });
            }

            let Some(&index) = self.tools.get(&call.index) else {
                log::debug!("Dropping arguments for unknown tool call index {}", call.index);
                continue;
            };

            if let Some(partial_json) = function.arguments.filter(|a| !a.is_empty()) {
                events.push(StreamEvent::ToolUseDelta { index, partial_json });
            }
        }

        if let Some(reason) = choice.finish_reason {
            self.stop_reason = Some(stop_reason_from_wire(&reason));
        }
    }
}

impl StreamDecoder for ChunkDecoder {
    fn decode(&mut self, event: &SseEvent) -> crate::Result<Vec<StreamEvent>> {
        if self.done || event.data.trim().is_empty() {
            return Ok(Vec::new());
        }

        if event.is_done() {
            let stop_reason = self.stop_reason.unwrap_or_default();
            return Ok(self.terminate(stop_reason));
        }

        let chunk: ChatChunk = parse_chunk(&event.data, "chat completion chunk")?;

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
                id: chunk.id.clone(),
                model: chunk.model.clone(),
            });
        }

        for choice in chunk.choices {
            self.decode_choice(choice, &mut events);
        }

        if let Some(usage) = chunk.usage.as_ref() {
            self.usage = Some(usage_from_wire(usage));
        }

        Ok(events)
    }

    fn finish(&mut self) -> crate::Result<Vec<StreamEvent>> {
        if self.done {
            return Ok(Vec::new());
        }

        match self.stop_reason {
            Some(stop_reason) => Ok(self.terminate(stop_reason)),
            None => Err(LlmError::Stream("stream ended before a finish reason".into())),
        }
    }
}

/// Encodes UIF events as `chat.completion.chunk` events.
#[derive(Debug, Default)]
pub(crate) struct ChunkEncoder {
    id: String,
    model: String,
    created: u64,
    started: bool,
    usage: Option<Usage>,
    failed: bool,
}

impl ChunkEncoder {
    fn chunk(&self, delta: ChunkDelta, finish_reason: Option<String>, usage: Option<Usage>) -> ClientEvent {
        let chunk = ChatChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".into(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage: usage.as_ref().map(usage_to_wire),
            error: None,
        };

        ClientEvent::json(&chunk)
    }

    fn start(&mut self, id: Option<&str>, model: Option<&str>, out: &mut Vec<ClientEvent>) {
        if self.started {
            return;
        }

        self.started = true;
        self.created = unix_now();
        self.id = id.filter(|id| !id.is_empty()).map(str::to_string).unwrap_or_else(|| generated_id("chatcmpl-"));

        if let Some(model) = model {
            self.model = model.to_string();
        }

        let delta = ChunkDelta {
            role: Some("assistant".into()),
            content: Some(String::new()),
            ..Default::default()
        };

        out.push(self.chunk(delta, None, None));
    }
}

impl StreamEncoder for ChunkEncoder {
    fn encode(&mut self, event: &StreamEvent) -> Vec<ClientEvent> {
        let mut out = Vec::new();

        match event {
            StreamEvent::MessageStart { id, model } => self.start(Some(id.as_str()), Some(model.as_str()), &mut out),
            StreamEvent::TextDelta { text } => {
                self.start(None, None, &mut out);

                let delta = ChunkDelta {
                    content: Some(text.clone()),
                    ..Default::default()
                };

                out.push(self.chunk(delta, None, None));
            }
            StreamEvent::ThinkingDelta { thinking } => {
                self.start(None, None, &mut out);

                let delta = ChunkDelta {
                    reasoning_content: Some(thinking.clone()),
                    ..Default::default()
                };

                out.push(self.chunk(delta, None, None));
            }
            StreamEvent::ThinkingSignature { .. } => (),
            StreamEvent::ToolUseStart { index, id, name } => {
                self.start(None, None, &mut out);

                let delta = ChunkDelta {
                    tool_calls: Some(vec![ToolCallDelta {
                        index: *index,
                        id: Some(id.clone()),
                        kind: Some("function".into()),
                        function: Some(FunctionDelta {
                            name: Some(name.clone()),
                            arguments: Some(String::new()),
                        }),
                    }]),
                    ..Default::default()
                };

                out.push(self.chunk(delta, None, None));
            }
            StreamEvent::ToolUseDelta { index, partial_json } => {
                let delta = ChunkDelta {
                    tool_calls: Some(vec![ToolCallDelta {
                        index: *index,
                        function: Some(FunctionDelta {
                            name: None,
                            arguments: Some(partial_json.clone()),
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                };

                out.push(self.chunk(delta, None, None));
            }
            StreamEvent::Usage(usage) => self.usage = Some(*usage),
            StreamEvent::MessageStop { stop_reason } => {
                self.start(None, None, &mut out);

                let finish_reason = Some(stop_reason_to_wire(*stop_reason).to_string());
                out.push(self.chunk(ChunkDelta::default(), finish_reason, self.usage.take()));
            }
            StreamEvent::Error { category, message } => {
                self.failed = true;

                out.push(ClientEvent::json(&json!({
                    "error": {
                        "message": message,
                        "type": category.as_str(),
                    }
                })));
            }
        }

        out
    }

    fn finish(&mut self) -> Vec<ClientEvent> {
        if self.failed {
            Vec::new()
        } else {
            vec![ClientEvent::data("[DONE]")]
        }
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_json_snapshot;

    use super::*;
    use crate::error::ErrorCategory;

    fn decode_all(chunks: &[&str]) -> crate::Result<Vec<StreamEvent>> {
        let mut decoder = ChunkDecoder::default();
        let mut events = Vec::new();

        for chunk in chunks {
            events.extend(decoder.decode(&SseEvent::data(*chunk))?);
        }

        events.extend(decoder.finish()?);
        Ok(events)
    }

    #[test]
    fn decodes_text_tool_calls_and_usage() {
        let events = decode_all(&[
            r#"{"id":"c1","model":"gpt-4o","choices":[{"index":0,"delta":{"role":"assistant","content":"Hi"},"finish_reason":null}]}"#,
            r#"{"id":"c1","model":"gpt-4o","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"lookup","arguments":""}}]},"finish_reason":null}]}"#,
            r#"{"id":"c1","model":"gpt-4o","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"q\":1}"}}]},"finish_reason":null}]}"#,
            r#"{"id":"c1","model":"gpt-4o","choices":[{"index":0,"delta":{},"finish_reason":"tool_calls"}]}"#,
            r#"{"id":"c1","model":"gpt-4o","choices":[],"usage":{"prompt_tokens":7,"completion_tokens":3,"total_tokens":10}}"#,
            "[DONE]",
        ])
        .unwrap();

        assert_json_snapshot!(serde_json::to_value(&events).unwrap(), @r#"
        [
          {
            "id": "c1",
            "model": "gpt-4o",
            "type": "message_start"
          },
          {
            "text": "Hi",
            "type": "text_delta"
          },
          {
            "id": "call_1",
            "index": 0,
            "name": "lookup",
            "type": "tool_use_start"
          },
          {
            "index": 0,
            "partial_json": "{\"q\":1}",
            "type": "tool_use_delta"
          },
          {
            "cache_read_tokens": 0,
            "input_tokens": 7,
            "output_tokens": 3,
            "type": "usage"
          },
          {
            "stop_reason": "tool_use",
            "type": "message_stop"
          }
        ]
        "#);
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let error = decode_all(&[r#"{"id":"c1","model":"m","choices":[{"index":0,"delta":{"content":"par"}}]}"#]).unwrap_err();

        assert!(matches!(error, LlmError::Stream(_)));
    }

    #[test]
    fn stream_without_done_but_with_finish_reason_completes() {
        let events = decode_all(&[
            r#"{"id":"c1","model":"m","choices":[{"index":0,"delta":{"content":"ok"},"finish_reason":"stop"}]}"#,
        ])
        .unwrap();

        assert_eq!(
            events.last(),
            Some(&StreamEvent::MessageStop {
                stop_reason: StopReason::EndTurn
            })
        );
    }

    #[test]
    fn in_stream_error_chunk_fails() {
        let error = decode_all(&[r#"{"error":{"message":"overloaded","type":"server_error"}}"#]).unwrap_err();

        insta::assert_snapshot!(error, @"Stream error: overloaded");
    }

    #[test]
    fn encoder_emits_role_chunk_finish_and_done() {
        let mut encoder = ChunkEncoder::default();
        let mut out = Vec::new();

        for event in [
            StreamEvent::MessageStart {
                id: "chatcmpl-1".into(),
                model: "gpt-4o".into(),
            },
            StreamEvent::TextDelta { text: "Hello".into() },
            StreamEvent::Usage(Usage {
                input_tokens: 2,
                output_tokens: 1,
                cache_read_tokens: 0,
            }),
            StreamEvent::MessageStop {
                stop_reason: StopReason::EndTurn,
            },
        ] {
            out.extend(encoder.encode(&event));
        }

        out.extend(encoder.finish());

        let data: Vec<serde_json::Value> = out
            .iter()
            .map(|event| {
                let mut value: serde_json::Value = serde_json::from_str(&event.data).unwrap_or(serde_json::Value::Null);
                if let Some(object) = value.as_object_mut() {
                    object.remove("created");
                }
                value
            })
            .collect();

        assert_eq!(out.last().map(|event| event.data.as_str()), Some("[DONE]"));

        assert_json_snapshot!(data, @r#"
        [
          {
            "choices": [
              {
                "delta": {
                  "content": "",
                  "role": "assistant"
                },
                "finish_reason": null,
                "index": 0
              }
            ],
            "id": "chatcmpl-1",
            "model": "gpt-4o",
            "object": "chat.completion.chunk"
          },
          {
            "choices": [
              {
                "delta": {
                  "content": "Hello"
                },
                "finish_reason": null,
                "index": 0
              }
            ],
            "id": "chatcmpl-1",
            "model": "gpt-4o",
            "object": "chat.completion.chunk"
          },
          {
            "choices": [
              {
                "delta": {},
                "finish_reason": "stop",
                "index": 0
              }
            ],
            "id": "chatcmpl-1",
            "model": "gpt-4o",
            "object": "chat.completion.chunk",
            "usage": {
              "completion_tokens": 1,
              "prompt_tokens": 2,
              "total_tokens": 3
            }
          },
          null
        ]
        "#);
    }

    #[test]
    fn encoder_error_suppresses_done() {
        let mut encoder = ChunkEncoder::default();

        let out = encoder.encode(&StreamEvent::Error {
            category: ErrorCategory::Timeout,
            message: "Upstream time-to-first-token timeout exceeded".into(),
        });

        assert_eq!(
            out[0].data,
            r#"{"error":{"message":"Upstream time-to-first-token timeout exceeded","type":"timeout"}}"#
        );
        assert!(encoder.finish().is_empty());
    }
}
