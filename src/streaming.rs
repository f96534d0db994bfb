use crate::message::{self, Message, MessageStatus, Role};
use crate::prompts;
use chrono::{DateTime, Utc};
use std::fmt::Display;

/// Folds streamed fragments into the text of the in-progress reply.
///
/// Every fragment yields a complete replacement for the tail message rather
/// than an edit of it, so what is displayed always equals the buffer exactly.
#[derive(Debug, Clone)]
pub struct StreamAccumulator {
    /// Accumulated text buffer
    buffer: String,
    /// Fragments applied so far, empty ones included
    fragments: usize,
    /// When the reply started; kept across every replacement
    started_at: DateTime<Utc>,
}

impl StreamAccumulator {
    pub fn start() -> Self {
        Self::started_at(message::now())
    }

    pub fn started_at(started_at: DateTime<Utc>) -> Self {
        Self {
            buffer: String::new(),
            fragments: 0,
            started_at,
        }
    }

    /// Empty reply that marks the turn as in progress
    pub fn placeholder(&self) -> Message {
        self.message(String::new(), MessageStatus::Streaming)
    }

    /// Apply one fragment and return the replacement tail message
    pub fn push(&mut self, fragment: &str) -> Message {
        self.buffer.push_str(fragment);
        self.fragments += 1;
        self.snapshot()
    }

    /// Current state as an in-progress message
    pub fn snapshot(&self) -> Message {
        self.message(self.buffer.clone(), MessageStatus::Streaming)
    }

    pub fn text(&self) -> &str {
        &self.buffer
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments
    }

    /// The finished reply
    pub fn finish(&self) -> Message {
        self.message(self.buffer.clone(), MessageStatus::Complete)
    }

    /// Error-marked message that replaces the reply when the stream fails
    pub fn fail(&self, error: &impl Display) -> Message {
        self.message(prompts::error_reply(error), MessageStatus::Failed)
    }

    fn message(&self, text: String, status: MessageStatus) -> Message {
        Message::model(text)
            .with_timestamp(self.started_at)
            .with_status(status)
    }
}

/// Fold a whole fragment sequence at once
pub fn fold<I, S>(fragments: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut accumulator = StreamAccumulator::start();
    for fragment in fragments {
        accumulator.push(fragment.as_ref());
    }
    accumulator.text().to_string()
}

/// True for the in-progress tail produced by an accumulator
pub fn is_in_progress(message: &Message) -> bool {
    message.role == Role::Model && message.is_streaming()
}
