use std::pin::Pin;

use futures::{Stream, StreamExt, stream};

use crate::error::LlmError;

/// A parsed SSE event from an upstream stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct SseEvent {
    /// The event type, if specified.
    pub event: Option<String>,
    /// Data lines joined with `\n`.
    pub data: String,
    pub id: Option<String>,
    /// Reconnection hint in milliseconds.
    pub retry: Option<u64>,
}

impl SseEvent {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    pub fn named(event: &str, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.to_string()),
            data: data.into(),
            ..Default::default()
        }
    }

    /// The `[DONE]` terminator used by OpenAI-style streams.
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }

    pub fn event_name(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }
}

/// Incremental SSE parser.
///
/// Bytes are buffered until a full line is available, so multi-byte characters split across
/// network chunks decode correctly.
#[derive(Debug, Default)]
pub(crate) struct SseParser {
    buffer: Vec<u8>,
    current: Option<SseEvent>,
    has_data: bool,
}

impl SseParser {
    /// Feeds a chunk of bytes, returning every event it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> crate::Result<Vec<SseEvent>> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=newline).collect();

            let line = std::str::from_utf8(&raw)
                .map_err(|e| LlmError::Stream(format!("Invalid UTF-8 in stream: {e}")))?
                .trim_end_matches(['\r', '\n']);

            if line.is_empty() {
                events.extend(self.dispatch());
            } else {
                self.parse_field(line);
            }
        }

        Ok(events)
    }

    /// Flushes an event left unterminated when the stream closed.
    pub fn finish(&mut self) -> crate::Result<Vec<SseEvent>> {
        let mut events = Vec::new();

        if !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);

            let line = std::str::from_utf8(&raw)
                .map_err(|e| LlmError::Stream(format!("Invalid UTF-8 in stream: {e}")))?
                .trim_end_matches('\r')
                .to_string();

            if !line.is_empty() {
                self.parse_field(&line);
            }
        }

        events.extend(self.dispatch());

        Ok(events)
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.current.take()?;
        let has_data = std::mem::take(&mut self.has_data);

        (has_data || event.event.is_some()).then_some(event)
    }

    fn parse_field(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        let event = self.current.get_or_insert_with(SseEvent::default);

        match field {
            "data" => {
                if self.has_data {
                    event.data.push('\n');
                }

                event.data.push_str(value);
                self.has_data = true;
            }
            "event" => event.event = Some(value.to_string()),
            "id" => event.id = Some(value.to_string()),
            "retry" => event.retry = value.parse().ok(),
            _ => log::debug!("Ignoring unknown SSE field: {field}"),
        }
    }
}

pub(crate) type SseEventStream = Pin<Box<dyn Stream<Item = crate::Result<SseEvent>> + Send>>;

/// Parses a byte stream into SSE events.
pub(crate) fn parse_sse_stream<S, B>(stream: S) -> SseEventStream
where
    S: Stream<Item = crate::Result<B>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send,
{
    let parsed = stream::unfold(Some((stream, SseParser::default())), |state| async move {
        let (mut stream, mut parser) = state?;

        match stream.next().await {
            Some(Ok(chunk)) => {
                let events = match parser.feed(chunk.as_ref()) {
                    Ok(events) => events.into_iter().map(Ok).collect(),
                    Err(e) => return Some((vec![Err(e)], None)),
                };

                Some((events, Some((stream, parser))))
            }
            Some(Err(e)) => {
                log::error!("Stream read error: {e}");
                Some((vec![Err(e)], None))
            }
            None => {
                let events = match parser.finish() {
                    Ok(events) => events.into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(e)],
                };

                Some((events, None))
            }
        }
    });

    Box::pin(parsed.flat_map(stream::iter))
}
