use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{ChatError, Result};
use crate::events::ChatEvent;
use crate::llm::{HistoryEntry, RemoteChat, SessionHandle};
use crate::message::{Conversation, Message, Role};
use crate::search;
use crate::storage::{self, ConversationStore};
use crate::streaming::StreamAccumulator;

/// Builds the remote client on first use
pub type BackendFactory = Box<dyn Fn() -> Result<Arc<dyn RemoteChat>> + Send + Sync>;

/// What became of a [`ChatSession::send`] call
#[derive(Debug)]
pub enum SendOutcome {
    /// Blank input, or a reply was already streaming; nothing changed
    Ignored,
    Completed { text: String },
    /// The turn failed; `partial` is the text that arrived before the failure
    Failed { error: ChatError, partial: String },
}

impl SendOutcome {
    pub fn is_ignored(&self) -> bool {
        matches!(self, SendOutcome::Ignored)
    }
}

/// One conversation with the model: the messages, where they are saved,
/// and the remote session that carries their context.
pub struct ChatSession<S: ConversationStore> {
    greeting: String,
    conversation: Conversation,
    store: S,
    factory: BackendFactory,
    backend: Option<Arc<dyn RemoteChat>>,
    remote: Option<SessionHandle>,
    is_streaming: bool,
    error: Option<String>,
    events: Option<mpsc::UnboundedSender<ChatEvent>>,
}

impl<S: ConversationStore> ChatSession<S> {
    /// Restore the saved conversation (or start from the greeting) and
    /// create the remote session.
    ///
    /// Nothing here fails: an unreadable store or missing credentials leave a
    /// usable session with the problem recorded in [`ChatSession::error`].
    pub fn open(greeting: impl Into<String>, store: S, factory: BackendFactory) -> Self {
        let greeting = greeting.into();
        let mut session = Self {
            conversation: Conversation::with_greeting(&greeting),
            greeting,
            store,
            factory,
            backend: None,
            remote: None,
            is_streaming: false,
            error: None,
            events: None,
        };

        match session.store.load() {
            Ok(Some(conversation)) => {
                info!(messages = conversation.len(), "Restored saved conversation");
                session.conversation = conversation;
            }
            Ok(None) => debug!("No saved conversation, starting fresh"),
            Err(e) => {
                warn!(error = %e, "Discarding unreadable saved conversation");
                session.report(format!("Initialization failed: {}", e));
            }
        }

        if let Err(e) = session.ensure_remote() {
            warn!(error = %e, "Chat session could not be initialized");
            session.report(format!(
                "Initialization failed: {}. Please check your API key.",
                e
            ));
        }
        session
    }

    /// Receive [`ChatEvent`]s from now on. Replaces any earlier subscriber.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ChatEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn messages(&self) -> &[Message] {
        self.conversation.messages()
    }

    pub fn is_streaming(&self) -> bool {
        self.is_streaming
    }

    /// Remote session state, if one is initialized
    pub fn remote(&self) -> Option<&SessionHandle> {
        self.remote.as_ref()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Current error banner
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn dismiss_error(&mut self) {
        self.error = None;
    }

    /// Messages matching `query`
    pub fn search(&self, query: &str) -> Vec<&Message> {
        search::filter(self.conversation.messages(), query)
    }

    /// Send `text` and stream the reply into the conversation.
    ///
    /// Appends exactly two messages unless the call is ignored: the user
    /// message and the reply, which on failure carries the error text.
    pub async fn send(&mut self, text: &str) -> SendOutcome {
        if text.trim().is_empty() || self.is_streaming {
            debug!(streaming = self.is_streaming, "Ignoring send");
            return SendOutcome::Ignored;
        }

        self.is_streaming = true;
        self.error = None;

        let ready = self.ensure_remote();
        // the reply is stamped after the message it answers
        let request = Message::user(text);
        let mut accumulator = StreamAccumulator::start();
        self.append(request);
        self.append(accumulator.placeholder());
        self.emit(ChatEvent::StreamStarted);

        let result = match ready {
            Ok(()) => self.consume_reply(text, &mut accumulator).await,
            Err(e) => Err(e),
        };

        let outcome = match result {
            Ok(()) => {
                let reply = accumulator.finish();
                if let Some(remote) = self.remote.as_mut() {
                    remote.record_exchange(HistoryEntry::user_text(text), HistoryEntry::from(&reply));
                }
                self.replace_tail(reply);

                let text = accumulator.text().to_string();
                info!(chars = text.len(), fragments = accumulator.fragment_count(), "Reply complete");
                self.emit(ChatEvent::StreamFinished { text: text.clone() });
                SendOutcome::Completed { text }
            }
            Err(error) => {
                warn!(error = %error, "Reply failed");
                self.replace_tail(accumulator.fail(&error));

                let partial = accumulator.text().to_string();
                self.emit(ChatEvent::StreamFailed {
                    error: error.to_string(),
                    partial: partial.clone(),
                });
                self.report(error.to_string());
                SendOutcome::Failed { error, partial }
            }
        };

        self.is_streaming = false;
        outcome
    }

    async fn consume_reply(&mut self, text: &str, accumulator: &mut StreamAccumulator) -> Result<()> {
        let backend = self.backend()?;
        let remote = self
            .remote
            .as_ref()
            .ok_or_else(|| ChatError::Initialization("Chat session is not initialized.".to_string()))?;

        let mut stream = backend.stream_reply(remote, text).await?;
        while let Some(fragment) = stream.next().await {
            let fragment = fragment?;
            debug!(len = fragment.len(), "Applying fragment");
            let snapshot = accumulator.push(&fragment);
            self.replace_tail(snapshot);
            self.emit(ChatEvent::Fragment(fragment));
        }
        Ok(())
    }

    /// Reset to the greeting, forget the saved conversation and start a new
    /// remote session.
    pub fn new_chat(&mut self) -> Result<()> {
        if self.is_streaming {
            return Err(ChatError::Initialization(
                "Cannot start a new chat while a reply is streaming.".to_string(),
            ));
        }

        let cleared = self.store.clear();
        self.conversation = Conversation::with_greeting(&self.greeting);
        self.reset_backend();
        self.error = None;
        self.emit(ChatEvent::ConversationReset);
        info!("Started new chat");

        let result = cleared.and_then(|()| self.ensure_remote());
        if let Err(e) = &result {
            self.report(format!("Failed to start new chat: {}", e));
        }
        result
    }

    /// Generate an image for `prompt` and append the exchange.
    ///
    /// Failure is returned to the caller only; the conversation is untouched.
    pub async fn generate_image(&mut self, prompt: &str) -> Result<&Message> {
        if prompt.trim().is_empty() {
            return Err(ChatError::Generation("prompt is empty".to_string()));
        }
        if self.is_streaming {
            return Err(ChatError::Generation("a reply is still streaming".to_string()));
        }

        let backend = self.backend()?;
        let parts = backend.generate_image(prompt).await?;
        let request = Message::user(prompt);
        let reply = Message::with_parts(Role::Model, parts);
        info!(images = reply.images().count(), "Image generated");

        if let Some(remote) = self.remote.as_mut() {
            remote.record_exchange(HistoryEntry::from(&request), HistoryEntry::from(&reply));
        }
        self.append(request);
        self.append(reply);
        self.conversation
            .last()
            .ok_or_else(|| ChatError::Generation("conversation is empty".to_string()))
    }

    /// Drop the remote client so the next use builds a fresh one
    fn reset_backend(&mut self) {
        self.backend = None;
        self.remote = None;
    }

    fn backend(&mut self) -> Result<Arc<dyn RemoteChat>> {
        if let Some(backend) = &self.backend {
            return Ok(Arc::clone(backend));
        }
        let backend = (self.factory)()?;
        self.backend = Some(Arc::clone(&backend));
        Ok(backend)
    }

    /// Create the remote session from the current conversation unless one exists
    fn ensure_remote(&mut self) -> Result<()> {
        if self.remote.is_some() {
            return Ok(());
        }
        let history: Vec<HistoryEntry> = self
            .conversation
            .history()
            .iter()
            .map(HistoryEntry::from)
            .collect();
        let backend = self.backend()?;
        self.remote = Some(backend.initialize_session(history)?);
        Ok(())
    }

    fn append(&mut self, message: Message) {
        self.conversation.push(message);
        self.persist();
    }

    fn replace_tail(&mut self, message: Message) {
        self.conversation.replace_last(message);
        self.persist();
    }

    fn persist(&self) {
        if !storage::should_persist(&self.conversation) {
            return;
        }
        if let Err(e) = self.store.save(&self.conversation) {
            warn!(error = %e, "Failed to save conversation");
        }
    }

    fn report(&mut self, message: String) {
        self.emit(ChatEvent::Notice(message.clone()));
        self.error = Some(message);
    }

    fn emit(&self, event: ChatEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

