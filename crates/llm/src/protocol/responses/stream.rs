use std::collections::HashMap;

use serde_json::{Value, json};

use super::{
    output_text, response_object, stop_reason_from_wire, usage_from_wire,
    wire::{OutputItem, ResponsesStreamEvent, SummaryText},
};
use crate::{
    error::{ErrorCategory, LlmError},
    protocol::{ClientEvent, StreamDecoder, StreamEncoder, generated_id, parse_chunk, unix_now},
    sse::parser::SseEvent,
    uif::{StopReason, StreamEvent, Usage},
};

/// Decodes Responses API stream events.
#[derive(Debug, Default)]
pub(crate) struct EventDecoder {
    started: bool,
    /// Output index to response-wide tool index.
    tools: HashMap<u32, u32>,
    done: bool,
}

impl StreamDecoder for EventDecoder {
    fn decode(&mut self, event: &SseEvent) -> crate::Result<Vec<StreamEvent>> {
        if self.done || event.data.trim().is_empty() {
            return Ok(Vec::new());
        }

        let event: ResponsesStreamEvent = parse_chunk(&event.data, "response stream event")?;

        let events = match event {
            ResponsesStreamEvent::Created { response } => {
                self.started = true;

                vec![StreamEvent::MessageStart {
                    id: response.id,
                    model: response.model,
                }]
            }
            ResponsesStreamEvent::OutputItemAdded {
                output_index,
                item: OutputItem::FunctionCall {
                    call_id, name, arguments, ..
                },
            } => {
                let index = self.tools.len() as u32;
                self.tools.insert(output_index, index);

                let mut events = vec![StreamEvent::ToolUseStart {
                    index,
                    id: call_id,
                    name,
                }];

                if !arguments.is_empty() {
                    events.push(StreamEvent::ToolUseDelta {
                        index,
                        partial_json: arguments,
                    });
                }

                events
            }
            ResponsesStreamEvent::OutputItemDone {
                item:
                    OutputItem::Reasoning {
                        encrypted_content: Some(signature),
                        ..
                    },
                ..
            } => vec![StreamEvent::ThinkingSignature { signature }],
            ResponsesStreamEvent::OutputTextDelta { delta } | ResponsesStreamEvent::RefusalDelta { delta } => {
                vec![StreamEvent::TextDelta { text: delta }]
            }
            ResponsesStreamEvent::ReasoningSummaryTextDelta { delta } => {
                vec![StreamEvent::ThinkingDelta { thinking: delta }]
            }
            ResponsesStreamEvent::FunctionCallArgumentsDelta { output_index, delta } => {
                match self.tools.get(&output_index) {
                    Some(&index) => vec![StreamEvent::ToolUseDelta {
                        index,
                        partial_json: delta,
                    }],
                    None => Vec::new(),
                }
            }
            ResponsesStreamEvent::Completed { response } | ResponsesStreamEvent::Incomplete { response } => {
                self.done = true;

                let mut stop_reason = stop_reason_from_wire(&response);

                // The final object may omit output items that were streamed.
                if stop_reason == StopReason::EndTurn && !self.tools.is_empty() {
                    stop_reason = StopReason::ToolUse;
                }

                let mut events: Vec<_> = response
                    .usage
                    .as_ref()
                    .map(|usage| StreamEvent::Usage(usage_from_wire(usage)))
                    .into_iter()
                    .collect();

                events.push(StreamEvent::MessageStop { stop_reason });
                events
            }
            ResponsesStreamEvent::Failed { response } => {
                let message = response
                    .error
                    .map(|error| error.message)
                    .unwrap_or_else(|| "response failed".to_string());

                return Err(LlmError::Stream(message));
            }
            ResponsesStreamEvent::Error { code, message } => {
                let message = match code {
                    Some(code) => format!("{code}: {message}"),
                    None => message,
                };

                return Err(LlmError::Stream(message));
            }
            _ => Vec::new(),
        };

        Ok(events)
    }

    fn finish(&mut self) -> crate::Result<Vec<StreamEvent>> {
        if self.done {
            Ok(Vec::new())
        } else {
            Err(LlmError::Stream("stream ended before response.completed".into()))
        }
    }
}

#[derive(Debug)]
enum OpenItem {
    Message { text: String },
    Reasoning { summary: String, signature: Option<String> },
    Function { tool: u32, call_id: String, name: String, arguments: String },
}

/// Encodes UIF events as Responses API stream events, tracking output items so the final
/// `response.completed` carries the whole output.
#[derive(Debug, Default)]
pub(crate) struct EventEncoder {
    id: String,
    model: String,
    created_at: u64,
    started: bool,
    sequence: u64,
    open: Option<(OpenItem, String, u32)>,
    output: Vec<OutputItem>,
    usage: Option<Usage>,
}

impl EventEncoder {
    fn emit(&mut self, name: &str, mut payload: Value) -> ClientEvent {
        if let Some(object) = payload.as_object_mut() {
            object.insert("type".into(), Value::String(name.to_string()));
            object.insert("sequence_number".into(), json!(self.sequence));
        }

        self.sequence += 1;

        ClientEvent::named(name, &payload)
    }

    fn start(&mut self, id: Option<&str>, model: Option<&str>, out: &mut Vec<ClientEvent>) {
        if self.started {
            return;
        }

        self.started = true;
        self.created_at = unix_now();
        self.id = id.filter(|id| !id.is_empty()).map(str::to_string).unwrap_or_else(|| generated_id("resp_"));

        if let Some(model) = model {
            self.model = model.to_string();
        }

        let response = json!({
            "id": self.id,
            "object": "response",
            "created_at": self.created_at,
            "model": self.model,
            "status": "in_progress",
            "output": [],
        });

        let created = self.emit("response.created", json!({ "response": response }));
        out.push(created);
    }

    fn next_index(&self) -> u32 {
        self.output.len() as u32
    }

    fn open(&mut self, item: OpenItem, out: &mut Vec<ClientEvent>) {
        self.close(out);

        let output_index = self.next_index();

        let (item_id, added) = match &item {
            OpenItem::Message { .. } => {
                let id = generated_id("msg_");
                let added = json!({"id": id, "type": "message", "status": "in_progress", "role": "assistant", "content": []});
                (id, added)
            }
            OpenItem::Reasoning { .. } => {
                let id = generated_id("rs_");
                (id.clone(), json!({"id": id, "type": "reasoning", "summary": []}))
            }
            OpenItem::Function { call_id, name, .. } => {
                let id = generated_id("fc_");
                let added = json!({
                    "id": id,
                    "type": "function_call",
                    "status": "in_progress",
                    "call_id": call_id,
                    "name": name,
                    "arguments": "",
                });
                (id, added)
            }
        };

        let event = self.emit(
            "response.output_item.added",
            json!({"output_index": output_index, "item": added}),
        );
        out.push(event);

        match item {
            OpenItem::Message { .. } => {
                let event = self.emit(
                    "response.content_part.added",
                    json!({
                        "item_id": item_id,
                        "output_index": output_index,
                        "content_index": 0,
                        "part": {"type": "output_text", "text": "", "annotations": []},
                    }),
                );
                out.push(event);
            }
            OpenItem::Reasoning { .. } => {
                let event = self.emit(
                    "response.reasoning_summary_part.added",
                    json!({
                        "item_id": item_id,
                        "output_index": output_index,
                        "summary_index": 0,
                        "part": {"type": "summary_text", "text": ""},
                    }),
                );
                out.push(event);
            }
            OpenItem::Function { .. } => (),
        }

        self.open = Some((item, item_id, output_index));
    }

    fn close(&mut self, out: &mut Vec<ClientEvent>) {
        let Some((item, item_id, output_index)) = self.open.take() else {
            return;
        };

        let done = match item {
            OpenItem::Message { text } => {
                let events = [
                    (
                        "response.output_text.done",
                        json!({"item_id": item_id, "output_index": output_index, "content_index": 0, "text": text}),
                    ),
                    (
                        "response.content_part.done",
                        json!({
                            "item_id": item_id,
                            "output_index": output_index,
                            "content_index": 0,
                            "part": {"type": "output_text", "text": text, "annotations": []},
                        }),
                    ),
                ];

                for (name, payload) in events {
                    let event = self.emit(name, payload);
                    out.push(event);
                }

                OutputItem::Message {
                    id: item_id,
                    status: Some("completed".into()),
                    role: "assistant".into(),
                    content: vec![output_text(text)],
                }
            }
            OpenItem::Reasoning { summary, signature } => {
                if !summary.is_empty() {
                    let event = self.emit(
                        "response.reasoning_summary_text.done",
                        json!({"item_id": item_id, "output_index": output_index, "summary_index": 0, "text": summary}),
                    );
                    out.push(event);
                }

                OutputItem::Reasoning {
                    id: item_id,
                    summary: if summary.is_empty() {
                        Vec::new()
                    } else {
                        vec![SummaryText::new(summary)]
                    },
                    encrypted_content: signature,
                }
            }
            OpenItem::Function {
                call_id,
                name,
                arguments,
                ..
            } => {
                let event = self.emit(
                    "response.function_call_arguments.done",
                    json!({"item_id": item_id, "output_index": output_index, "arguments": arguments}),
                );
                out.push(event);

                OutputItem::FunctionCall {
                    id: item_id,
                    call_id,
                    name,
                    arguments,
                    status: Some("completed".into()),
                }
            }
        };

        let event = self.emit(
            "response.output_item.done",
            json!({"output_index": output_index, "item": done}),
        );
        out.push(event);

        self.output.push(done);
    }
}

impl StreamEncoder for EventEncoder {
    fn encode(&mut self, event: &StreamEvent) -> Vec<ClientEvent> {
        let mut out = Vec::new();

        match event {
            StreamEvent::MessageStart { id, model } => self.start(Some(id.as_str()), Some(model.as_str()), &mut out),
            StreamEvent::TextDelta { text } => {
                self.start(None, None, &mut out);

                if !matches!(self.open, Some((OpenItem::Message { .. }, ..))) {
                    self.open(OpenItem::Message { text: String::new() }, &mut out);
                }

                if let Some((OpenItem::Message { text: buffer }, item_id, output_index)) = self.open.as_mut() {
                    buffer.push_str(text);

                    let payload = json!({
                        "item_id": item_id,
                        "output_index": output_index,
                        "content_index": 0,
                        "delta": text,
                    });

                    let event = self.emit("response.output_text.delta", payload);
                    out.push(event);
                }
            }
            StreamEvent::ThinkingDelta { thinking } => {
                self.start(None, None, &mut out);

                if !matches!(self.open, Some((OpenItem::Reasoning { .. }, ..))) {
                    self.open(
                        OpenItem::Reasoning {
                            summary: String::new(),
                            signature: None,
                        },
                        &mut out,
                    );
                }

                if let Some((OpenItem::Reasoning { summary, .. }, item_id, output_index)) = self.open.as_mut() {
                    summary.push_str(thinking);

                    let payload = json!({
                        "item_id": item_id,
                        "output_index": output_index,
                        "summary_index": 0,
                        "delta": thinking,
                    });

                    let event = self.emit("response.reasoning_summary_text.delta", payload);
                    out.push(event);
                }
            }
            StreamEvent::ThinkingSignature { signature } => {
                self.start(None, None, &mut out);

                if !matches!(self.open, Some((OpenItem::Reasoning { .. }, ..))) {
                    self.open(
                        OpenItem::Reasoning {
                            summary: String::new(),
                            signature: None,
                        },
                        &mut out,
                    );
                }

                if let Some((OpenItem::Reasoning { signature: slot, .. }, ..)) = self.open.as_mut() {
                    *slot = Some(signature.clone());
                }
            }
            StreamEvent::ToolUseStart { index, id, name } => {
                self.start(None, None, &mut out);
                self.open(
                    OpenItem::Function {
                        tool: *index,
                        call_id: id.clone(),
                        name: name.clone(),
                        arguments: String::new(),
                    },
                    &mut out,
                );
            }
            StreamEvent::ToolUseDelta { index, partial_json } => {
                if let Some((OpenItem::Function { tool, arguments, .. }, item_id, output_index)) = self.open.as_mut()
                    && *tool == *index
                {
                    arguments.push_str(partial_json);

                    let payload = json!({
                        "item_id": item_id,
                        "output_index": output_index,
                        "delta": partial_json,
                    });

                    let event = self.emit("response.function_call_arguments.delta", payload);
                    out.push(event);
                }
            }
            StreamEvent::Usage(usage) => self.usage = Some(*usage),
            StreamEvent::MessageStop { stop_reason } => {
                self.start(None, None, &mut out);
                self.close(&mut out);

                let response = response_object(
                    self.id.clone(),
                    &self.model,
                    self.created_at,
                    *stop_reason,
                    std::mem::take(&mut self.output),
                    self.usage.as_ref(),
                );

                let name = if response.status == "completed" {
                    "response.completed"
                } else {
                    "response.incomplete"
                };

                let event = self.emit(name, json!({ "response": response }));
                out.push(event);
            }
            StreamEvent::Error { category, message } => {
                let code = match category {
                    ErrorCategory::Timeout => "timeout",
                    ErrorCategory::Provider4xx => "invalid_request",
                    _ => "server_error",
                };

                let event = self.emit("error", json!({"code": code, "message": message, "param": null}));
                out.push(event);
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_json_snapshot;

    use super::*;

    fn decode_all(events: &[&str]) -> crate::Result<Vec<StreamEvent>> {
        let mut decoder = EventDecoder::default();
        let mut out = Vec::new();

        for data in events {
            out.extend(decoder.decode(&SseEvent::data(*data))?);
        }

        out.extend(decoder.finish()?);
        Ok(out)
    }

    #[test]
    fn decodes_function_call_stream() {
        let events = decode_all(&[
            r#"{"type":"response.created","sequence_number":0,"response":{"id":"resp_1","object":"response","created_at":1,"model":"gpt-5","status":"in_progress","output":[]}}"#,
            r#"{"type":"response.output_item.added","sequence_number":1,"output_index":0,"item":{"type":"reasoning","id":"rs_1","summary":[]}}"#,
            r#"{"type":"response.reasoning_summary_text.delta","sequence_number":2,"item_id":"rs_1","output_index":0,"summary_index":0,"delta":"Plan"}"#,
            r#"{"type":"response.output_item.done","sequence_number":3,"output_index":0,"item":{"type":"reasoning","id":"rs_1","summary":[],"encrypted_content":"enc"}}"#,
            r#"{"type":"response.output_item.added","sequence_number":4,"output_index":1,"item":{"type":"function_call","id":"fc_1","call_id":"call_1","name":"lookup","arguments":""}}"#,
            r#"{"type":"response.function_call_arguments.delta","sequence_number":5,"item_id":"fc_1","output_index":1,"delta":"{}"}"#,
            r#"{"type":"response.completed","sequence_number":6,"response":{"id":"resp_1","object":"response","created_at":1,"model":"gpt-5","status":"completed","output":[],"usage":{"input_tokens":3,"output_tokens":9,"total_tokens":12}}}"#,
        ])
        .unwrap();

        assert_json_snapshot!(serde_json::to_value(&events).unwrap(), @r#"
        [
          {
            "id": "resp_1",
            "model": "gpt-5",
            "type": "message_start"
          },
          {
            "thinking": "Plan",
            "type": "thinking_delta"
          },
          {
            "signature": "enc",
            "type": "thinking_signature"
          },
          {
            "id": "call_1",
            "index": 0,
            "name": "lookup",
            "type": "tool_use_start"
          },
          {
            "index": 0,
            "partial_json": "{}",
            "type": "tool_use_delta"
          },
          {
            "cache_read_tokens": 0,
            "input_tokens": 3,
            "output_tokens": 9,
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
    fn failed_response_is_a_stream_error() {
        let error = decode_all(&[
            r#"{"type":"response.failed","response":{"id":"resp_1","status":"failed","output":[],"error":{"code":"server_error","message":"boom"}}}"#,
        ])
        .unwrap_err();

        insta::assert_snapshot!(error, @"Stream error: boom");
    }

    #[test]
    fn encoder_emits_item_lifecycle_and_completed_output() {
        let mut encoder = EventEncoder::default();
        let mut out = Vec::new();

        for event in [
            StreamEvent::MessageStart {
                id: "resp_7".into(),
                model: "gpt-5".into(),
            },
            StreamEvent::TextDelta { text: "Hel".into() },
            StreamEvent::TextDelta { text: "lo".into() },
            StreamEvent::Usage(Usage {
                input_tokens: 1,
                output_tokens: 2,
                cache_read_tokens: 0,
            }),
            StreamEvent::MessageStop {
                stop_reason: StopReason::EndTurn,
            },
        ] {
            out.extend(encoder.encode(&event));
        }

        let names: Vec<_> = out.iter().filter_map(|event| event.event.as_deref()).collect();

        assert_eq!(
            names,
            [
                "response.created",
                "response.output_item.added",
                "response.content_part.added",
                "response.output_text.delta",
                "response.output_text.delta",
                "response.output_text.done",
                "response.content_part.done",
                "response.output_item.done",
                "response.completed",
            ]
        );

        let completed: Value = serde_json::from_str(&out[8].data).unwrap();
        let message = &completed["response"]["output"][0];

        assert_eq!(message["content"][0]["text"], "Hello");
        assert_eq!(completed["response"]["status"], "completed");
        assert_eq!(completed["response"]["usage"]["total_tokens"], 3);
        assert_eq!(completed["sequence_number"], 8);
        assert!(encoder.finish().is_empty());
    }
}
