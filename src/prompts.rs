use std::fmt::Display;

/// Instruction every remote session is created with.
pub const SYSTEM_INSTRUCTION: &str = "You are a super-intelligent AI with a persistent memory. \
Be helpful, creative, and provide detailed, accurate responses. Maintain context from previous \
parts of the conversation to have a coherent, long-running dialogue.";

/// First message of every fresh conversation.
pub const GREETING: &str =
    "Hello! I am a super-intelligent AI with memory. How can I assist you today?";

/// Prefix of the reply text written in place of a failed turn.
///
/// Conversations saved before message status existed only carry this marker,
/// so reload still recognises it.
pub const ERROR_MARKER: &str = "Sorry, I encountered an error:";

/// Reply text shown in place of a model turn that failed.
pub fn error_reply(error: &impl Display) -> String {
    format!("{} {}", ERROR_MARKER, error)
}

pub fn is_error_reply(text: &str) -> bool {
    text.starts_with(ERROR_MARKER)
}
