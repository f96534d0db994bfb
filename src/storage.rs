use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::error::{ChatError, Result};
use crate::message::{Conversation, Message};

/// File name of the persisted conversation inside the data directory
pub const SESSION_FILE: &str = "chat-session.json";

/// Whole-value persistence of one conversation.
pub trait ConversationStore: Send {
    /// `Ok(None)` when nothing has been saved yet.
    fn load(&self) -> Result<Option<Conversation>>;
    fn save(&self, conversation: &Conversation) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// A pristine conversation is never written, so a placeholder greeting
/// cannot overwrite a real saved session.
pub fn should_persist(conversation: &Conversation) -> bool {
    !conversation.is_pristine()
}

pub fn encode(conversation: &Conversation) -> Result<String> {
    serde_json::to_string(conversation)
        .map_err(|e| ChatError::Deserialization(format!("failed to serialize conversation: {}", e)))
}

/// Parse a stored payload. Blank payloads and empty arrays count as "nothing saved".
pub fn decode(payload: &str) -> Result<Option<Conversation>> {
    if payload.trim().is_empty() {
        return Ok(None);
    }

    let messages: Vec<Message> =
        serde_json::from_str(payload).map_err(|e| ChatError::Deserialization(e.to_string()))?;
    if messages.is_empty() {
        return Ok(None);
    }

    let mut conversation = Conversation::from_messages(messages);
    conversation.settle_interrupted();
    Ok(Some(conversation))
}

/// Conversation stored as one JSON file, replaced wholesale on every save.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `<dir>/chat-session.json`
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(SESSION_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| SESSION_FILE.into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl ConversationStore for FileStore {
    fn load(&self) -> Result<Option<Conversation>> {
        let payload = match fs::read_to_string(&self.path) {
            Ok(payload) => payload,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) if e.kind() == ErrorKind::InvalidData => {
                return Err(ChatError::Deserialization(e.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        decode(&payload)
    }

    fn save(&self, conversation: &Conversation) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let payload = encode(conversation)?;

        let tmp = self.temp_path();
        fs::write(&tmp, payload)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store holding the serialized payload, for tests and throwaway sessions.
#[derive(Default)]
pub struct MemoryStore {
    payload: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_payload(payload: impl Into<String>) -> Self {
        Self {
            payload: Mutex::new(Some(payload.into())),
        }
    }

    /// Raw payload as last written
    pub fn payload(&self) -> Option<String> {
        self.payload.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl ConversationStore for MemoryStore {
    fn load(&self) -> Result<Option<Conversation>> {
        match self.payload() {
            Some(payload) => decode(&payload),
            None => Ok(None),
        }
    }

    fn save(&self, conversation: &Conversation) -> Result<()> {
        let payload = encode(conversation)?;
        *self.payload.lock().unwrap_or_else(PoisonError::into_inner) = Some(payload);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.payload.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessagePart, MessageStatus, Role};
    use tempfile::TempDir;

    fn sample() -> Conversation {
        Conversation::from_messages(vec![
            Message::model("Hi"),
            Message::user("Draw a cat"),
            Message::with_parts(
                Role::Model,
                vec![MessagePart::text("Here:"), MessagePart::image("image/png", "aGVsbG8=")],
            ),
            Message::model("Sorry, I encountered an error: timeout").with_status(MessageStatus::Failed),
        ])
    }

    #[test]
    fn file_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::in_dir(dir.path());
        let conversation = sample();

        store.save(&conversation).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, conversation);
        assert!(!store.temp_path().exists());
    }

    #[test]
    fn missing_file_loads_as_none() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::in_dir(&dir.path().join("not-created-yet"));
        assert!(store.load().unwrap().is_none());
        store.clear().unwrap();
    }

    #[test]
    fn clear_removes_saved_conversation() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::in_dir(dir.path());
        store.save(&sample()).unwrap();
        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn corrupt_payload_is_deserialization_error() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::in_dir(dir.path());
        fs::write(store.path(), "{\"not\": \"an array\"").unwrap();
        assert!(matches!(store.load(), Err(ChatError::Deserialization(_))));

        let bad_time = r#"[{"role":"user","parts":[{"text":"x"}],"timestamp":"yesterday"}]"#;
        assert!(matches!(decode(bad_time), Err(ChatError::Deserialization(_))));
    }

    #[test]
    fn invalid_utf8_is_deserialization_error() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::in_dir(dir.path());
        fs::write(store.path(), [b'[', 0xff, 0xfe, b']']).unwrap();
        assert!(matches!(store.load(), Err(ChatError::Deserialization(_))));
    }

    #[test]
    fn reads_payload_without_status_field() {
        let payload = r#"[
            {"role":"model","parts":[{"text":"Hi"}],"timestamp":"2024-05-01T10:00:00.000Z"},
            {"role":"user","parts":[{"text":"X"}],"timestamp":"2024-05-01T10:00:05.123Z"},
            {"role":"model","parts":[{"text":"Sorry, I encountered an error: timeout"}],"timestamp":"2024-05-01T10:00:06.000Z"}
        ]"#;
        let conversation = decode(payload).unwrap().unwrap();
        assert_eq!(conversation.len(), 3);
        assert_eq!(conversation.messages()[1].timestamp.timestamp_subsec_millis(), 123);
        assert!(conversation.last().unwrap().is_failed_turn());
    }

    #[test]
    fn blank_and_empty_payloads_are_nothing_saved() {
        assert!(decode("").unwrap().is_none());
        assert!(decode("  \n").unwrap().is_none());
        assert!(decode("[]").unwrap().is_none());
    }

    #[test]
    fn interrupted_stream_is_settled_on_load() {
        let store = MemoryStore::new();
        let mut conversation = sample();
        conversation.push(Message::user("again"));
        conversation.push(Message::model("Let me").with_status(MessageStatus::Streaming));
        store.save(&conversation).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.last().unwrap().status, MessageStatus::Failed);
    }

    #[test]
    fn greeting_only_is_not_persisted() {
        assert!(!should_persist(&Conversation::new()));
        assert!(!should_persist(&Conversation::with_greeting("Hi")));
        assert!(should_persist(&sample()));
    }

    #[test]
    fn wire_format_matches_browser_layout() {
        let store = MemoryStore::new();
        store.save(&sample()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&store.payload().unwrap()).unwrap();

        assert_eq!(value[0]["role"], "model");
        assert_eq!(value[2]["parts"][1]["inlineData"]["mimeType"], "image/png");
        let stamp = value[0]["timestamp"].as_str().unwrap();
        assert!(stamp.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());
    }
}
