use crate::models::{ChatMessage, MessageRole};

use super::provider::{PromptMessage, PromptRole};

pub const DOCUMENT_ANALYSIS_SYSTEM_PROMPT: &str = "You are an assistant for document analysis and conversational question answering.

Capabilities:
- Analyze the supplied document and extract key insights
- Answer questions about the document content
- Keep track of the conversation and refer back to earlier exchanges
- Give clear, well-structured answers

Guidelines:
- Treat the supplied document as the primary source of information
- Refer to earlier turns when they are relevant
- Say so plainly when the document does not contain the answer
- Stay conversational and accurate
- Use bullet points or numbered lists where they help

Base answers on the document content first while keeping the conversation flowing.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptLimits {
    /// Characters of document content included in the prompt.
    pub document_context_chars: usize,
    /// Most recent history messages included in the prompt.
    pub history_turns: usize,
}

/// Builds the message list for one query: the analysis system prompt, an
/// optional document block, the tail of the history and finally the query.
pub fn assemble_prompt(
    query: &str,
    document: Option<&str>,
    history: &[ChatMessage],
    limits: PromptLimits,
) -> Vec<PromptMessage> {
    let mut messages = vec![PromptMessage::new(
        PromptRole::System,
        DOCUMENT_ANALYSIS_SYSTEM_PROMPT,
    )];

    if let Some(document) = document.filter(|content| !content.is_empty()) {
        messages.push(PromptMessage::new(
            PromptRole::System,
            document_block(truncate_chars(document, limits.document_context_chars)),
        ));
    }

    let skip = history.len().saturating_sub(limits.history_turns);
    messages.extend(history[skip..].iter().map(|message| {
        let role = match message.role {
            MessageRole::User => PromptRole::User,
            MessageRole::Assistant => PromptRole::Assistant,
        };
        PromptMessage::new(role, message.content.clone())
    }));

    messages.push(PromptMessage::new(PromptRole::User, query));
    messages
}

fn document_block(content: &str) -> String {
    format!(
        "Document content:\n```\n{content}\n```\n\nPlease use this document to answer questions."
    )
}

/// Prefix of at most `max_chars` characters, cut on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => &text[..byte_index],
        None => text,
    }
}

/// Rough token estimate: one token per four characters.
pub fn estimate_tokens(text: &str) -> u32 {
    u32::try_from(text.chars().count() / 4).unwrap_or(u32::MAX)
}
