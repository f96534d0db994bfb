/// Notifications from a chat session to whatever is presenting it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// A reply started streaming into a fresh placeholder
    StreamStarted,

    /// One fragment was applied to the in-progress reply
    Fragment(String),

    /// The reply finished normally
    StreamFinished { text: String },

    /// The reply failed; `partial` is what had arrived before the failure
    StreamFailed { error: String, partial: String },

    /// Standalone error notification, independent of any conversation change
    Notice(String),

    /// Conversation was reset to the greeting
    ConversationReset,
}
