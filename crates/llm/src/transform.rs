//! Per-request conversion between client, UIF and provider payloads.
//!
//! Every hook first offers the payload to the provider's script, if any, and falls back to the
//! built-in converter of the relevant wire format when the script declines.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{
    error::LlmError,
    protocol::{ClientEvent, StreamDecoder, StreamEncoder, WireFormat},
    script::{Hook, HookContext, TransformScript},
    sse::parser::SseEvent,
    uif::{self, StreamEvent},
};

/// The conversions of one request, bound to its client and provider formats.
pub(crate) struct Transformer {
    script: Option<Arc<dyn TransformScript>>,
    ctx: HookContext,
}

impl Transformer {
    pub fn new(
        client: WireFormat,
        provider: WireFormat,
        script: Option<Arc<dyn TransformScript>>,
        provider_id: &str,
        model: &str,
        stream: bool,
    ) -> Self {
        Self {
            script,
            ctx: HookContext {
                client_protocol: client,
                provider_protocol: provider,
                provider: provider_id.to_string(),
                model: model.to_string(),
                stream,
                event: None,
            },
        }
    }

    pub fn client(&self) -> WireFormat {
        self.ctx.client_protocol
    }

    pub fn provider(&self) -> WireFormat {
        self.ctx.provider_protocol
    }

    fn run(&self, hook: Hook, data: &Value, ctx: &HookContext) -> crate::Result<Option<Value>> {
        match &self.script {
            Some(script) => Ok(script.run(hook, data, ctx)?),
            None => Ok(None),
        }
    }

    /// Client payload to UIF.
    pub fn decode_request(&self, body: Value) -> crate::Result<uif::Request> {
        match self.run(Hook::RequestIn, &body, &self.ctx)? {
            Some(mut value) => {
                if let Value::Object(map) = &mut value {
                    map.entry("client_protocol")
                        .or_insert_with(|| Value::from(self.client().as_str()));
                }

                script_output(Hook::RequestIn, value)
            }
            None => self.client().hooks().decode_request(body),
        }
    }

    /// UIF to provider payload.
    pub fn encode_request(&self, request: &uif::Request) -> crate::Result<Value> {
        if self.script.is_some() {
            let data = crate::protocol::to_value(request)?;

            if let Some(value) = self.run(Hook::RequestOut, &data, &self.ctx)? {
                return Ok(value);
            }
        }

        self.provider().hooks().encode_request(request)
    }

    /// Provider payload to UIF.
    pub fn decode_response(&self, body: Value) -> crate::Result<uif::Response> {
        match self.run(Hook::ResponseIn, &body, &self.ctx)? {
            Some(value) => script_output(Hook::ResponseIn, value),
            None => self.provider().hooks().decode_response(body),
        }
    }

    /// UIF to client payload.
    pub fn encode_response(&self, response: &uif::Response) -> crate::Result<Value> {
        if self.script.is_some() {
            let data = crate::protocol::to_value(response)?;

            if let Some(value) = self.run(Hook::ResponseOut, &data, &self.ctx)? {
                return Ok(value);
            }
        }

        self.client().hooks().encode_response(response)
    }

    /// The streaming counterpart of the response hooks.
    pub fn stream(&self) -> StreamTransform {
        StreamTransform {
            decoder: self.provider().hooks().stream_decoder(),
            encoder: self.client().hooks().stream_encoder(),
            script: self.script.clone(),
            ctx: self.ctx.clone(),
            script_stopped: false,
        }
    }
}

/// Stateful provider-event to client-event conversion for one stream.
pub(crate) struct StreamTransform {
    decoder: Box<dyn StreamDecoder>,
    encoder: Box<dyn StreamEncoder>,
    script: Option<Arc<dyn TransformScript>>,
    ctx: HookContext,
    /// The script emitted the terminal event itself, so the built-in decoder may not have seen one.
    script_stopped: bool,
}

impl StreamTransform {
    /// One upstream SSE event to UIF events.
    pub fn decode(&mut self, event: &SseEvent) -> crate::Result<Vec<StreamEvent>> {
        if let Some(script) = &self.script {
            let data = serde_json::from_str(&event.data).unwrap_or_else(|_| Value::String(event.data.clone()));

            let ctx = HookContext {
                event: Some(event.event_name().to_string()),
                ..self.ctx.clone()
            };

            if let Some(value) = script.run(Hook::ResponseIn, &data, &ctx)? {
                let events: Vec<StreamEvent> = one_or_many(Hook::ResponseIn, value)?;

                if events.iter().any(|event| matches!(event, StreamEvent::MessageStop { .. })) {
                    self.script_stopped = true;
                }

                return Ok(events);
            }
        }

        self.decoder.decode(event)
    }

    /// Called once the upstream body ended.
    pub fn finish_decode(&mut self) -> crate::Result<Vec<StreamEvent>> {
        if self.script_stopped {
            return Ok(Vec::new());
        }

        self.decoder.finish()
    }

    /// One UIF event to client events.
    pub fn encode(&mut self, event: &StreamEvent) -> crate::Result<Vec<ClientEvent>> {
        if let Some(script) = &self.script {
            let data = crate::protocol::to_value(event)?;

            if let Some(value) = script.run(Hook::ResponseOut, &data, &self.ctx)? {
                let values = match value {
                    Value::Array(values) => values,
                    value => vec![value],
                };

                let named = self.ctx.client_protocol.named_events();

                return values
                    .into_iter()
                    .map(|value| match value {
                        Value::String(raw) => ClientEvent::data(raw),
                        value => match value.get("type").and_then(Value::as_str) {
                            Some(name) if named => ClientEvent::named(name, &value),
                            _ => ClientEvent::json(&value),
                        },
                    })
                    .map(checked_event)
                    .collect();
            }
        }

        Ok(self.encoder.encode(event))
    }

    /// Trailing client events after the last UIF event.
    pub fn finish_encode(&mut self) -> Vec<ClientEvent> {
        self.encoder.finish()
    }
}

/// SSE fields are line-delimited: names cannot hold line breaks and data cannot hold a carriage
/// return. Serialized JSON never does, so only script-provided text is checked.
fn checked_event(event: ClientEvent) -> crate::Result<ClientEvent> {
    if let Some(name) = &event.event
        && name.contains(['\r', '\n'])
    {
        return Err(LlmError::Transform(format!(
            "transform hook {} produced an event name with a line break: {name:?}",
            Hook::ResponseOut
        )));
    }

    if event.data.contains('\r') {
        return Err(LlmError::Transform(format!(
            "transform hook {} produced event data with a carriage return",
            Hook::ResponseOut
        )));
    }

    Ok(event)
}

fn script_output<T: DeserializeOwned>(hook: Hook, value: Value) -> crate::Result<T> {
    serde_json::from_value(value)
        .map_err(|e| LlmError::Transform(format!("transform hook {hook} produced an unexpected shape: {e}")))
}

fn one_or_many<T: DeserializeOwned>(hook: Hook, value: Value) -> crate::Result<Vec<T>> {
    match value {
        Value::Array(values) => values.into_iter().map(|value| script_output(hook, value)).collect(),
        value => Ok(vec![script_output(hook, value)?]),
    }
}
