//! Legacy OpenAI text completions (`/v1/completions`).

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{
    ClientEvent, ProtocolHooks, StreamDecoder, StreamEncoder, WireFormat, from_client, from_provider, generated_id,
    parse_chunk, to_value, unix_now,
    openai::{ChatUsage, StopField, stop_reason_from_wire, stop_reason_to_wire, usage_from_wire, usage_to_wire},
};
use crate::{
    error::LlmError,
    sse::parser::SseEvent,
    uif::{self, ContentBlock, Message, Parameters, Role, StopReason, StreamEvent, Usage, joined_text},
};

pub(crate) struct Completions;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum Prompt {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CompletionRequest {
    model: String,
    prompt: Prompt,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stop: Option<StopField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    text: String,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    object: String,
    #[serde(default)]
    created: u64,
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    usage: Option<ChatUsage>,
}

impl ProtocolHooks for Completions {
    fn decode_request(&self, body: Value) -> crate::Result<uif::Request> {
        let request: CompletionRequest = from_client(body)?;

        let prompt = match request.prompt {
            Prompt::One(prompt) => prompt,
            Prompt::Many(prompts) => prompts.join("\n"),
        };

        Ok(uif::Request {
            model: request.model,
            system: None,
            messages: vec![Message::text(Role::User, prompt)],
            parameters: Parameters {
                temperature: request.temperature,
                max_tokens: request.max_tokens,
                top_p: request.top_p,
                top_k: None,
                stop_sequences: request.stop.map(StopField::into_vec).unwrap_or_default(),
                stream: request.stream.unwrap_or(false),
            },
            tools: Vec::new(),
            tool_choice: None,
            client_protocol: WireFormat::OpenAiCompletions,
        })
    }

    fn encode_request(&self, request: &uif::Request) -> crate::Result<Value> {
        let mut prompt = request.system.clone().map(|system| format!("{system}\n\n")).unwrap_or_default();

        prompt.push_str(
            &request
                .messages
                .iter()
                .map(|message| joined_text(&message.content))
                .collect::<Vec<_>>()
                .join("\n"),
        );

        let parameters = &request.parameters;

        to_value(&CompletionRequest {
            model: request.model.clone(),
            prompt: Prompt::One(prompt),
            max_tokens: parameters.max_tokens,
            temperature: parameters.temperature,
            top_p: parameters.top_p,
            stop: (!parameters.stop_sequences.is_empty()).then(|| StopField::Many(parameters.stop_sequences.clone())),
            stream: parameters.stream.then_some(true),
        })
    }

    fn decode_response(&self, body: Value) -> crate::Result<uif::Response> {
        let response: CompletionResponse = from_provider(body, "text completion")?;
        let choice = response.choices.into_iter().next().unwrap_or_default();

        Ok(uif::Response {
            id: response.id,
            model: response.model,
            content: (!choice.text.is_empty())
                .then(|| vec![ContentBlock::text(choice.text)])
                .unwrap_or_default(),
            stop_reason: choice.finish_reason.as_deref().map(stop_reason_from_wire).unwrap_or_default(),
            usage: response.usage.as_ref().map(usage_from_wire).unwrap_or_default(),
        })
    }

    fn encode_response(&self, response: &uif::Response) -> crate::Result<Value> {
        to_value(&CompletionResponse {
            id: if response.id.is_empty() {
                generated_id("cmpl-")
            } else {
                response.id.clone()
            },
            object: "text_completion".into(),
            created: unix_now(),
            model: response.model.clone(),
            choices: vec![CompletionChoice {
                index: 0,
                text: joined_text(&response.content),
                finish_reason: Some(stop_reason_to_wire(response.stop_reason).into()),
            }],
            usage: Some(usage_to_wire(&response.usage)),
        })
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(TextDecoder::default())
    }

    fn stream_encoder(&self) -> Box<dyn StreamEncoder> {
        Box::new(TextEncoder::default())
    }
}

#[derive(Debug, Default)]
struct TextDecoder {
    started: bool,
    usage: Option<Usage>,
    stop_reason: Option<StopReason>,
    done: bool,
}

impl TextDecoder {
    fn terminate(&mut self, stop_reason: StopReason) -> Vec<StreamEvent> {
        self.done = true;

        let mut events: Vec<_> = self.usage.take().map(StreamEvent::Usage).into_iter().collect();
        events.push(StreamEvent::MessageStop { stop_reason });
        events
    }
}

impl StreamDecoder for TextDecoder {
    fn decode(&mut self, event: &SseEvent) -> crate::Result<Vec<StreamEvent>> {
        if self.done || event.data.trim().is_empty() {
            return Ok(Vec::new());
        }

        if event.is_done() {
            let stop_reason = self.stop_reason.unwrap_or_default();
            return Ok(self.terminate(stop_reason));
        }

        let chunk: CompletionResponse = parse_chunk(&event.data, "text completion chunk")?;
        let mut events = Vec::new();

        if !self.started {
            self.started = true;
            events.push(StreamEvent::MessageStart {
                id: chunk.id.clone(),
                model: chunk.model.clone(),
            });
        }

        for choice in chunk.choices {
            if !choice.text.is_empty() {
                events.push(StreamEvent::TextDelta { text: choice.text });
            }

            if let Some(reason) = choice.finish_reason {
                self.stop_reason = Some(stop_reason_from_wire(&reason));
            }
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

/// Text deltas become `choices[0].text` chunks; other content has no legacy representation.
#[derive(Debug, Default)]
struct TextEncoder {
    id: String,
    model: String,
    created: u64,
    usage: Option<Usage>,
    failed: bool,
}

impl TextEncoder {
    fn chunk(&self, text: String, finish_reason: Option<String>, usage: Option<Usage>) -> ClientEvent {
        ClientEvent::json(&CompletionResponse {
            id: self.id.clone(),
            object: "text_completion".into(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![CompletionChoice {
                index: 0,
                text,
                finish_reason,
            }],
            usage: usage.as_ref().map(usage_to_wire),
        })
    }
}

impl StreamEncoder for TextEncoder {
    fn encode(&mut self, event: &StreamEvent) -> Vec<ClientEvent> {
        match event {
            StreamEvent::MessageStart { id, model } => {
                self.id = if id.is_empty() { generated_id("cmpl-") } else { id.clone() };
                self.model = model.clone();
                self.created = unix_now();

                Vec::new()
            }
            StreamEvent::TextDelta { text } => vec![self.chunk(text.clone(), None, None)],
            StreamEvent::Usage(usage) => {
                self.usage = Some(*usage);
                Vec::new()
            }
            StreamEvent::MessageStop { stop_reason } => {
                let finish_reason = Some(stop_reason_to_wire(*stop_reason).to_string());
                vec![self.chunk(String::new(), finish_reason, self.usage.take())]
            }
            StreamEvent::Error { category, message } => {
                self.failed = true;

                vec![ClientEvent::json(&json!({
                    "error": {
                        "message": message,
                        "type": category.as_str(),
                    }
                }))]
            }
            _ => Vec::new(),
        }
    }

    fn finish(&mut self) -> Vec<ClientEvent> {
        if self.failed {
            Vec::new()
        } else {
            vec![ClientEvent::data("[DONE]")]
        }
    }
}
