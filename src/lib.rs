//! Chat client core for the Gemini API: a persisted conversation, streamed
//! replies folded into it fragment by fragment, and search over the history.

pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod llm;
pub mod logging;
pub mod message;
pub mod prompts;
pub mod search;
pub mod session;
pub mod storage;
pub mod streaming;

pub use config::Config;
pub use error::{ChatError, Result};
pub use events::ChatEvent;
pub use llm::{FragmentStream, GeminiClient, HistoryEntry, RemoteChat, SessionHandle};
pub use message::{Conversation, InlineData, Message, MessagePart, MessageStatus, Role};
pub use session::{BackendFactory, ChatSession, SendOutcome};
pub use storage::{ConversationStore, FileStore, MemoryStore};
