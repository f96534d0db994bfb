use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::message::{Message, MessagePart, Role};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use once_cell::sync::{Lazy, OnceCell};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, info, warn};

/// Incremental reply text. Ordered, finite, consumed once.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// One turn of the history a remote session is seeded with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub parts: Vec<MessagePart>,
}

impl HistoryEntry {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![MessagePart::text(text)],
        }
    }
}

impl From<&Message> for HistoryEntry {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role,
            parts: message.parts.clone(),
        }
    }
}

/// Remote conversation state: model, instruction and the turns so far.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    model: String,
    system_instruction: String,
    history: Vec<HistoryEntry>,
}

impl SessionHandle {
    pub fn new(
        model: impl Into<String>,
        system_instruction: impl Into<String>,
        history: Vec<HistoryEntry>,
    ) -> Self {
        Self {
            model: model.into(),
            system_instruction: system_instruction.into(),
            history,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn system_instruction(&self) -> &str {
        &self.system_instruction
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// Record a finished exchange. Failed turns are never recorded.
    pub fn record_exchange(&mut self, request: HistoryEntry, reply: HistoryEntry) {
        self.history.push(request);
        self.history.push(reply);
    }
}

/// The hosted model, as far as the chat core is concerned.
#[async_trait]
pub trait RemoteChat: Send + Sync {
    /// Fails with [`ChatError::Initialization`] when credentials are missing.
    fn initialize_session(&self, history: Vec<HistoryEntry>) -> Result<SessionHandle>;

    /// Send `message` on top of the session history and stream the reply.
    async fn stream_reply(&self, session: &SessionHandle, message: &str) -> Result<FragmentStream>;

    /// One-shot generation returning a mix of text and image parts.
    async fn generate_image(&self, prompt: &str) -> Result<Vec<MessagePart>>;
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

static HTTP: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Finish reasons that mean the reply was cut off rather than completed
const ABORT_REASONS: &[&str] = &[
    "SAFETY",
    "RECITATION",
    "BLOCKLIST",
    "PROHIBITED_CONTENT",
    "SPII",
    "MALFORMED_FUNCTION_CALL",
];

/// Gemini REST client
#[derive(Clone)]
pub struct GeminiClient {
    config: Config,
    client: reqwest::Client,
    api_key: OnceCell<String>,
}

impl GeminiClient {
    pub fn new(config: Config) -> Self {
        let client = if config.connect_timeout_secs == CONNECT_TIMEOUT.as_secs() {
            HTTP.clone()
        } else {
            reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
                .build()
                .unwrap_or_else(|_| HTTP.clone())
        };

        Self {
            config,
            client,
            api_key: OnceCell::new(),
        }
    }

    /// Resolved on first use and kept for the life of the client
    fn api_key(&self) -> Result<&str> {
        self.api_key
            .get_or_try_init(|| self.config.require_api_key())
            .map(String::as_str)
    }

    fn endpoint(&self, model: &str, method: &str) -> String {
        format!(
            "{}/models/{}:{}",
            self.config.base_url.trim_end_matches('/'),
            model,
            method
        )
    }

    async fn post(&self, url: &str, payload: &Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", self.api_key()?)
            .header("Content-Type", "application/json")
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Transport(format!(
                "Gemini API error ({}): {}",
                status.as_u16(),
                api_error_message(&body).unwrap_or(body)
            )));
        }

        Ok(response)
    }
}

#[async_trait]
impl RemoteChat for GeminiClient {
    fn initialize_session(&self, history: Vec<HistoryEntry>) -> Result<SessionHandle> {
        self.api_key()?;
        info!(model = %self.config.model, turns = history.len(), "Initialized chat session");
        Ok(SessionHandle::new(
            self.config.model.clone(),
            self.config.system_instruction.clone(),
            history,
        ))
    }

    async fn stream_reply(&self, session: &SessionHandle, message: &str) -> Result<FragmentStream> {
        let url = format!("{}?alt=sse", self.endpoint(session.model(), "streamGenerateContent"));

        let mut contents = session.history().to_vec();
        contents.push(HistoryEntry::user_text(message));

        let mut payload = serde_json::json!({ "contents": contents });
        if !session.system_instruction().is_empty() {
            payload["systemInstruction"] = serde_json::json!({
                "parts": [{ "text": session.system_instruction() }]
            });
        }

        debug!(turns = contents.len(), "Sending streamed request");
        let response = self.post(&url, &payload).await?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            if let Err(e) = process_sse_stream(response, &tx).await {
                warn!(error = %e, "Reply stream failed");
                let _ = tx.send(Err(e)).await;
            }
        });

        Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }

    async fn generate_image(&self, prompt: &str) -> Result<Vec<MessagePart>> {
        let url = self.endpoint(&self.config.image_model, "generateContent");
        let payload = serde_json::json!({
            "contents": [HistoryEntry::user_text(prompt)],
            "generationConfig": { "responseModalities": ["TEXT", "IMAGE"] }
        });

        let response = self
            .post(&url, &payload)
            .await
            .map_err(|e| ChatError::Generation(e.to_string()))?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| ChatError::Generation(format!("unreadable response: {}", e)))?;

        let parts = generated_parts(&body);
        if parts.is_empty() {
            let reason = block_reason(&body).unwrap_or_else(|| "no content returned".to_string());
            return Err(ChatError::Generation(reason));
        }
        info!(parts = parts.len(), "Generated image response");
        Ok(parts)
    }
}

/// Forward every text fragment of an SSE response into `tx`
async fn process_sse_stream(
    response: reqwest::Response,
    tx: &mpsc::Sender<Result<String>>,
) -> Result<()> {
    let mut stream = response.bytes_stream();
    let mut decoder = SseDecoder::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        for data in decoder.push(&chunk) {
            if let Some(text) = parse_stream_chunk(&data)? {
                if tx.send(Ok(text)).await.is_err() {
                    // receiver dropped, nobody is listening
                    return Ok(());
                }
            }
        }
    }

    if let Some(data) = decoder.finish() {
        if let Some(text) = parse_stream_chunk(&data)? {
            let _ = tx.send(Ok(text)).await;
        }
    }
    Ok(())
}

/// Splits a byte stream into SSE `data:` payloads.
///
/// Lines are only decoded once complete, so a multi-byte character split
/// across network chunks survives intact.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut payloads = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            if let Some(data) = data_field(&line) {
                payloads.push(data);
            }
        }
        payloads
    }

    /// Whatever is left once the body ends without a trailing newline
    pub fn finish(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.buffer);
        data_field(&line)
    }
}

fn data_field(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    let data = line.trim().strip_prefix("data:")?.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    Some(data.to_string())
}

/// Text carried by one streamed `GenerateContentResponse`, if any.
pub fn parse_stream_chunk(data: &str) -> Result<Option<String>> {
    let chunk: Value = serde_json::from_str(data)
        .map_err(|e| ChatError::Model(format!("malformed stream chunk: {}", e)))?;

    if let Some(message) = chunk.get("error").and_then(error_message) {
        return Err(ChatError::Model(message));
    }
    if let Some(reason) = block_reason(&chunk) {
        return Err(ChatError::Model(reason));
    }

    let text: String = candidate_parts(&chunk)
        .filter(|part| !part.get("thought").and_then(Value::as_bool).unwrap_or(false))
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();

    if text.is_empty() {
        if let Some(reason) = chunk
            .pointer("/candidates/0/finishReason")
            .and_then(Value::as_str)
            .filter(|reason| ABORT_REASONS.contains(reason))
        {
            return Err(ChatError::Model(format!("Response stopped: {}", reason)));
        }
        return Ok(None);
    }
    Ok(Some(text))
}

/// Text and image parts of a non-streamed response
pub fn generated_parts(body: &Value) -> Vec<MessagePart> {
    candidate_parts(body)
        .filter_map(|part| {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                return (!text.is_empty()).then(|| MessagePart::text(text));
            }
            let inline = part.get("inlineData")?;
            let mime_type = inline.get("mimeType").and_then(Value::as_str)?;
            let data = inline.get("data").and_then(Value::as_str)?;
            Some(MessagePart::image(mime_type, data))
        })
        .collect()
}

fn candidate_parts(body: &Value) -> impl Iterator<Item = &Value> {
    body.pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn block_reason(body: &Value) -> Option<String> {
    body.pointer("/promptFeedback/blockReason")
        .and_then(Value::as_str)
        .map(|reason| format!("Request blocked: {}", reason))
}

fn error_message(error: &Value) -> Option<String> {
    error
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Pull `error.message` out of an API error body
fn api_error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value.get("error").and_then(error_message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decoder_handles_split_lines() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"a\":").is_empty());
        let payloads = decoder.push(b"1}\n\ndata: {\"b\":2}\n");
        assert_eq!(payloads, vec!["{\"a\":1}", "{\"b\":2}"]);
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn decoder_keeps_multibyte_characters_across_chunks() {
        let mut decoder = SseDecoder::default();
        let line = "data: {\"text\":\"héllo\"}\n".as_bytes();
        let split = line.iter().position(|b| *b == 0xC3).unwrap() + 1;
        assert!(decoder.push(&line[..split]).is_empty());
        assert_eq!(decoder.push(&line[split..]), vec!["{\"text\":\"héllo\"}"]);
    }

    #[test]
    fn decoder_flushes_unterminated_tail() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b": keep-alive\ndata: [DONE]\ndata: {\"x\":1}").is_empty());
        assert_eq!(decoder.finish().as_deref(), Some("{\"x\":1}"));
    }

    #[test]
    fn chunk_text_joins_parts_and_skips_thoughts() {
        let data = json!({
            "candidates": [{ "content": { "role": "model", "parts": [
                { "text": "thinking...", "thought": true },
                { "text": "Hello" },
                { "text": ", world" }
            ]}}]
        })
        .to_string();
        assert_eq!(parse_stream_chunk(&data).unwrap().as_deref(), Some("Hello, world"));
    }

    #[test]
    fn chunk_without_text_is_skipped() {
        let data = json!({ "candidates": [{ "finishReason": "STOP" }], "usageMetadata": {} }).to_string();
        assert!(parse_stream_chunk(&data).unwrap().is_none());
    }

    #[test]
    fn chunk_errors_become_model_errors() {
        let error = json!({ "error": { "code": 429, "message": "quota exceeded" } }).to_string();
        assert!(matches!(parse_stream_chunk(&error), Err(ChatError::Model(m)) if m == "quota exceeded"));

        let blocked = json!({ "promptFeedback": { "blockReason": "SAFETY" } }).to_string();
        assert!(matches!(parse_stream_chunk(&blocked), Err(ChatError::Model(m)) if m.contains("SAFETY")));

        let stopped = json!({ "candidates": [{ "finishReason": "RECITATION" }] }).to_string();
        assert!(matches!(parse_stream_chunk(&stopped), Err(ChatError::Model(_))));

        assert!(matches!(parse_stream_chunk("not json"), Err(ChatError::Model(_))));
    }

    #[test]
    fn generated_parts_mix_text_and_images() {
        let body = json!({
            "candidates": [{ "content": { "parts": [
                { "text": "A cat:" },
                { "inlineData": { "mimeType": "image/png", "data": "aGVsbG8=" } },
                { "text": "" }
            ]}}]
        });
        let parts = generated_parts(&body);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], MessagePart::text("A cat:"));
        assert_eq!(parts[1], MessagePart::image("image/png", "aGVsbG8="));

        assert!(generated_parts(&json!({ "candidates": [] })).is_empty());
    }

    #[test]
    fn api_error_body_is_unwrapped() {
        let body = r#"{"error":{"code":400,"message":"API key not valid","status":"INVALID_ARGUMENT"}}"#;
        assert_eq!(api_error_message(body).as_deref(), Some("API key not valid"));
        assert!(api_error_message("<html>").is_none());
    }

    #[test]
    fn history_entries_serialize_as_contents() {
        let entry = HistoryEntry::from(&Message::model("Hi"));
        assert_eq!(
            serde_json::to_value(&entry).unwrap(),
            json!({ "role": "model", "parts": [{ "text": "Hi" }] })
        );
    }

    #[test]
    fn missing_key_fails_initialization() {
        let config = Config {
            api_key: None,
            api_key_env: "MEMCHAT_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            ..Config::default()
        };
        let client = GeminiClient::new(config);
        assert!(matches!(
            client.initialize_session(Vec::new()),
            Err(ChatError::Initialization(_))
        ));
    }

    #[test]
    fn session_records_exchanges() {
        let config = Config {
            api_key: Some("test-key".to_string()),
            ..Config::default()
        };
        let client = GeminiClient::new(config);
        let mut session = client
            .initialize_session(vec![HistoryEntry::from(&Message::model("Hi"))])
            .unwrap();
        session.record_exchange(
            HistoryEntry::user_text("2+2?"),
            HistoryEntry::from(&Message::model("4.")),
        );
        assert_eq!(session.history().len(), 3);
        assert_eq!(session.history()[2].role, Role::Model);
    }
}
