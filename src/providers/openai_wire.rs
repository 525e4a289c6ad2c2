//! Wire types and SSE parsing for OpenAI-compatible chat endpoints
//! (Groq and NVIDIA NIM both speak this dialect).

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::providers::backend::{
    ChatMessage, PreparedRequest, Role, StreamChunk, TokenUsage,
};

#[derive(Debug, Serialize)]
pub struct WireRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct WireMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct WireResponse {
    pub model: Option<String>,
    pub choices: Vec<WireChoice>,
    pub usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
pub struct WireChoice {
    pub message: WireResponseMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WireResponseMessage {
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WireUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl From<&WireUsage> for TokenUsage {
    fn from(usage: &WireUsage) -> Self {
        TokenUsage::new(usage.prompt_tokens, usage.completion_tokens)
    }
}

#[derive(Debug, Deserialize)]
struct WireStreamResponse {
    choices: Vec<WireStreamChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireStreamChoice {
    delta: WireStreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireStreamDelta {
    content: Option<String>,
}

/// Translate internal roles to the provider's dialect; the gateway's
/// `agent` role is `assistant` on the wire.
pub fn wire_role(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Agent => "assistant",
    }
}

pub fn wire_messages(messages: &[ChatMessage]) -> Vec<WireMessage> {
    messages
        .iter()
        .map(|msg| WireMessage {
            role: wire_role(msg.role).to_string(),
            content: msg.content.clone(),
        })
        .collect()
}

pub fn build_request(request: &PreparedRequest, stream: bool) -> WireRequest {
    WireRequest {
        model: request.model_id.clone(),
        messages: wire_messages(&request.messages),
        temperature: request.temperature,
        max_tokens: request.max_tokens,
        top_p: request.top_p,
        stream: stream.then_some(true),
    }
}

pub fn auth_headers(api_key: &str) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    let auth = HeaderValue::from_str(&format!("Bearer {}", api_key))
        .map_err(|_| Error::bad_request("API key contains invalid header characters"))?;
    headers.insert(AUTHORIZATION, auth);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(headers)
}

/// Accumulates raw body bytes and yields complete lines. HTTP chunk
/// boundaries fall anywhere, including inside a multi-byte character, so
/// decoding happens against the accumulated buffer rather than per chunk.
struct Utf8LineBuffer {
    text: String,
    partial: Vec<u8>,
}

impl Utf8LineBuffer {
    fn new() -> Self {
        Self {
            text: String::new(),
            partial: Vec::new(),
        }
    }

    fn push_bytes(&mut self, chunk: &[u8]) -> Result<()> {
        self.partial.extend_from_slice(chunk);
        match std::str::from_utf8(&self.partial) {
            Ok(text) => {
                self.text.push_str(text);
                self.partial.clear();
            }
            // An incomplete trailing sequence waits for the next chunk.
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                self.text.push_str(&String::from_utf8_lossy(&self.partial[..valid]));
                self.partial.drain(..valid);
            }
            Err(_) => {
                return Err(Error::internal("Invalid UTF-8 in provider stream"));
            }
        }
        Ok(())
    }

    fn next_line(&mut self) -> Option<String> {
        let newline = self.text.find('\n')?;
        let line = self.text[..newline].to_string();
        self.text.drain(..=newline);
        Some(line)
    }

    /// Called once the body is exhausted: a held-back partial sequence can
    /// no longer complete, and any unterminated text is the last line.
    fn finish(&mut self) -> Result<Option<String>> {
        if !self.partial.is_empty() {
            return Err(Error::internal(
                "Truncated UTF-8 sequence at end of provider stream",
            ));
        }
        if self.text.is_empty() {
            Ok(None)
        } else {
            Ok(Some(std::mem::take(&mut self.text)))
        }
    }
}

/// Line-buffered reader over a chunked SSE body.
struct SseLineReader {
    response: reqwest::Response,
    lines: Utf8LineBuffer,
    finished: bool,
}

impl SseLineReader {
    fn new(response: reqwest::Response) -> Self {
        Self {
            response,
            lines: Utf8LineBuffer::new(),
            finished: false,
        }
    }

    async fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(line) = self.lines.next_line() {
                return Ok(Some(line));
            }
            if self.finished {
                return self.lines.finish();
            }
            match self.response.chunk().await {
                Ok(Some(chunk)) => self.lines.push_bytes(&chunk)?,
                Ok(None) => self.finished = true,
                Err(e) => {
                    return Err(Error::internal(format!("Stream read error: {}", e)));
                }
            }
        }
    }
}

/// Drive an accepted (2xx) streaming response, forwarding text deltas into
/// the channel in generation order. The task ends when the provider sends
/// `[DONE]`, the body ends, or the receiver goes away (caller cancelled).
pub fn spawn_sse_forwarder(
    provider: &str,
    response: reqwest::Response,
    tx: mpsc::Sender<Result<StreamChunk>>,
) {
    let provider = provider.to_string();
    tokio::spawn(async move {
        let mut reader = SseLineReader::new(response);
        loop {
            let line = match reader.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    // Best effort: the dispatcher still finalizes usage for
                    // chunks already delivered.
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };

            let line = line.trim();
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            if data == "[DONE]" {
                break;
            }

            match serde_json::from_str::<WireStreamResponse>(data) {
                Ok(frame) => {
                    let usage = frame.usage.as_ref().map(TokenUsage::from);
                    let (delta, finish_reason) = frame
                        .choices
                        .first()
                        .map(|c| {
                            (
                                c.delta.content.clone().unwrap_or_default(),
                                c.finish_reason.clone(),
                            )
                        })
                        .unwrap_or_default();

                    if delta.is_empty() && finish_reason.is_none() && usage.is_none() {
                        continue;
                    }
                    let chunk = StreamChunk {
                        delta,
                        finish_reason,
                        usage,
                    };
                    if tx.send(Ok(chunk)).await.is_err() {
                        debug!("{} stream receiver dropped, aborting provider read", provider);
                        return;
                    }
                }
                Err(e) => {
                    warn!("{} sent an unparseable stream frame: {}", provider, e);
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_role_translated_to_assistant() {
        let messages = vec![
            ChatMessage::system("be brief"),
            ChatMessage::user("hi"),
            ChatMessage::agent("hello"),
        ];
        let wire = wire_messages(&messages);
        assert_eq!(wire[0].role, "system");
        assert_eq!(wire[1].role, "user");
        assert_eq!(wire[2].role, "assistant");
    }

    #[test]
    fn test_build_request_omits_unset_params() {
        let request = PreparedRequest {
            request_id: "r1".into(),
            model_id: "llama-3.1-8b".into(),
            messages: vec![ChatMessage::user("hi")],
            inputs: vec![],
            max_tokens: Some(100),
            temperature: None,
            top_p: None,
            api_key: "k".into(),
            price_in_per_1k: Default::default(),
            price_out_per_1k: Default::default(),
        };
        let body = serde_json::to_value(build_request(&request, false)).unwrap();
        assert_eq!(body["max_tokens"], 100);
        assert!(body.get("temperature").is_none());
        assert!(body.get("stream").is_none());

        let body = serde_json::to_value(build_request(&request, true)).unwrap();
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn test_line_buffer_reassembles_split_multibyte_char() {
        let mut buf = Utf8LineBuffer::new();
        // "héllo\n" with the two bytes of é (C3 A9) arriving separately.
        buf.push_bytes(&[b'h', 0xC3]).unwrap();
        assert!(buf.next_line().is_none());
        buf.push_bytes(&[0xA9, b'l', b'l', b'o', b'\n']).unwrap();
        assert_eq!(buf.next_line().as_deref(), Some("héllo"));
        assert!(buf.finish().unwrap().is_none());
    }

    #[test]
    fn test_line_buffer_rejects_invalid_bytes() {
        let mut buf = Utf8LineBuffer::new();
        assert!(buf.push_bytes(&[0xFF, 0xFE]).is_err());
    }

    #[test]
    fn test_line_buffer_truncated_tail_errors_at_end() {
        let mut buf = Utf8LineBuffer::new();
        buf.push_bytes(b"data: x\n").unwrap();
        // First byte of a three-byte sequence, never completed.
        buf.push_bytes(&[0xE2, 0x82]).unwrap();
        assert_eq!(buf.next_line().as_deref(), Some("data: x"));
        assert!(buf.finish().is_err());
    }

    #[test]
    fn test_line_buffer_unterminated_last_line() {
        let mut buf = Utf8LineBuffer::new();
        buf.push_bytes(b"data: [DONE]").unwrap();
        assert!(buf.next_line().is_none());
        assert_eq!(buf.finish().unwrap().as_deref(), Some("data: [DONE]"));
    }

    #[test]
    fn test_stream_frame_parsing() {
        let frame: WireStreamResponse = serde_json::from_str(
            r#"{"choices":[{"delta":{"content":"hel"},"finish_reason":null}]}"#,
        )
        .unwrap();
        assert_eq!(frame.choices[0].delta.content.as_deref(), Some("hel"));

        let frame: WireStreamResponse = serde_json::from_str(
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}],"usage":{"prompt_tokens":5,"completion_tokens":9}}"#,
        )
        .unwrap();
        assert_eq!(frame.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(frame.usage.unwrap().completion_tokens, 9);
    }
}
