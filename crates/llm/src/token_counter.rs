//! Token estimates for `count_tokens` and for streams that report no usage.

use std::sync::OnceLock;

use tiktoken_rs::{CoreBPE, cl100k_base};

use crate::uif::{self, ContentBlock};

/// Global tokenizer instance using cl100k_base encoding.
static TOKENIZER: OnceLock<Option<CoreBPE>> = OnceLock::new();

fn tokenizer() -> Option<&'static CoreBPE> {
    TOKENIZER
        .get_or_init(|| match cl100k_base() {
            Ok(tokenizer) => Some(tokenizer),
            Err(e) => {
                log::error!("Failed to initialize cl100k_base tokenizer, falling back to estimates: {e}");
                None
            }
        })
        .as_ref()
}

/// Tokens in a piece of text.
///
/// cl100k_base is not every provider's tokenizer, so this is an approximation.
pub(crate) fn count_text(text: &str) -> usize {
    match tokenizer() {
        Some(tokenizer) => tokenizer.encode_ordinary(text).len(),
        None => text.chars().count().div_ceil(4),
    }
}

/// Estimated input tokens of a request.
///
/// Every message carries about 3 tokens of formatting overhead and the reply is primed with
/// 3 more.
pub(crate) fn count_request(request: &uif::Request) -> usize {
    let mut total = 3;

    if let Some(system) = &request.system {
        total += count_text(system) + 3;
    }

    for message in &request.messages {
        total += 3 + count_blocks(&message.content);
    }

    for tool in &request.tools {
        total += count_text(&tool.name);
        total += tool.description.as_deref().map(count_text).unwrap_or_default();
        total += count_text(&tool.input_schema.to_string());
    }

    total
}

fn count_blocks(blocks: &[ContentBlock]) -> usize {
    blocks
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text } => count_text(text),
            ContentBlock::Thinking { thinking, .. } => count_text(thinking),
            ContentBlock::ToolUse { name, input, .. } => count_text(name) + count_text(&input.to_string()),
            ContentBlock::ToolResult { content, .. } => count_blocks(content),
            ContentBlock::Image { .. } => 0,
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        protocol::WireFormat,
        uif::{Message, Role},
    };

    #[test]
    fn counts_plain_text() {
        assert_eq!(count_text("Hello, world!"), 4);
        assert_eq!(count_text(""), 0);
    }

    #[test]
    fn request_includes_overhead() {
        let request = uif::Request {
            model: "gpt-4o".into(),
            system: Some("Be brief.".into()),
            messages: vec![Message::text(Role::User, "Hello, world!")],
            parameters: Default::default(),
            tools: Vec::new(),
            tool_choice: None,
            client_protocol: WireFormat::Anthropic,
        };

        // 3 priming + (3 + 3) system + (3 + 4) message
        assert_eq!(count_request(&request), 16);
    }
}
