//! Streaming LLM client (Amazon Bedrock Converse API).
//!
//! Maintains conversation history and issues streaming chat completions,
//! partitioning the reply into fragments at sentence boundaries for low
//! first-audio latency when piped into TTS.
//!
//! Grounded in `agent/llm.rs`'s `OpenRouterClient` (`reqwest::Client` +
//! `bytes_stream()` shape) for the Rust idiom, and
//! `original_source/voice_caller/src/llm_handler.py` for the exact Bedrock
//! wire shape, meta-prompts, and chunking policy.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use regex::bytes::Regex;
use serde_json::json;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::BedrockConfig;

/// Fallback system prompt used when the greeting bootstrap fails, or when no
/// call purpose/override was supplied.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly AI assistant making a phone call. Keep your responses brief and conversational, as this is a voice conversation.";

const GENERATE_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);
const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(15);

/// One turn in the conversation history.
#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

fn text_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#""text":"((?:[^"\\]|\\.)*)""#).expect("valid regex"))
}

/// Unescape the JSON string-literal content captured by `text_pattern`.
fn unescape_json_fragment(raw: &[u8]) -> Option<String> {
    let raw = std::str::from_utf8(raw).ok()?;
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => break,
        }
    }
    Some(out)
}

/// Incremental scanner over the raw Bedrock `converse-stream` byte stream
/// (§4.3 step 3–4). Buffers bytes across reads and only advances its cursor
/// past a *complete* `"text":"…"` match, so a fragment straddling two network
/// reads is still found once the rest arrives, instead of being silently
/// dropped.
#[derive(Default)]
struct StreamScanner {
    buffer: Vec<u8>,
    processed: usize,
    full_response: String,
    text_buffer: String,
    fragments: Vec<String>,
}

impl StreamScanner {
    /// Feed the next chunk of raw bytes, extracting any fragments that
    /// completed as a result and applying the sentence-boundary chunking
    /// policy (§4.3 step 4).
    fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);

        let window_start = self.processed;
        for captures in text_pattern().captures_iter(&self.buffer[window_start..]) {
            let whole = captures.get(0).expect("capture group 0 always matches");
            self.processed = window_start + whole.end();

            let Some(group) = captures.get(1) else { continue };
            let Some(text) = unescape_json_fragment(group.as_bytes()) else {
                continue;
            };
            if text.is_empty() {
                continue;
            }

            self.full_response.push_str(&text);
            self.text_buffer.push_str(&text);

            let trimmed_end = self.text_buffer.trim_end();
            if trimmed_end.ends_with(['.', '!', '?']) {
                self.fragments.push(std::mem::take(&mut self.text_buffer));
            } else if self.text_buffer.len() > 40 && text.ends_with(' ') {
                self.fragments.push(std::mem::take(&mut self.text_buffer));
            }
        }
    }

    /// Consume the scanner, yielding the full decoded response and the
    /// chunked fragment sequence (with any residue flushed as a final
    /// fragment, per §4.3 step 4's "at end of stream, yield any residue").
    fn finish(mut self) -> (String, Vec<String>) {
        if !self.text_buffer.is_empty() {
            self.fragments.push(self.text_buffer);
        }
        (self.full_response, self.fragments)
    }
}

/// Streaming chat-completion client over a single call's conversation
/// history. Stateless per request: one request is active at a time.
pub struct LlmClient {
    http: reqwest::Client,
    config: BedrockConfig,
    base_url: String,
    system_prompt: String,
    messages: Vec<Message>,
    /// Set once by the greeting bootstrap; consumed by the first
    /// `generate_stream` call, per §4.3's "you just said" augmentation.
    pending_greeting: Option<String>,
}

impl LlmClient {
    pub fn new(config: BedrockConfig, system_prompt: Option<String>) -> Self {
        let base_url = format!(
            "https://bedrock-runtime.{}.amazonaws.com/model/{}",
            config.region, config.model_id
        );
        LlmClient {
            http: reqwest::Client::new(),
            config,
            base_url,
            system_prompt: system_prompt.unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            messages: Vec::new(),
            pending_greeting: None,
        }
    }

    /// Record the bootstrap greeting so the first `generate_stream` call can
    /// augment its system prompt with it, without inserting a prior assistant
    /// turn into history (the backend requires the first message be a user
    /// message).
    pub fn set_pending_greeting(&mut self, greeting: String) {
        self.pending_greeting = Some(greeting);
    }

    pub fn history(&self) -> &[Message] {
        &self.messages
    }

    fn converse_payload(messages: &[Message], system_text: &str, max_tokens: u32, temperature: f32) -> serde_json::Value {
        let messages: Vec<_> = messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": [{"text": m.content}]}))
            .collect();
        json!({
            "messages": messages,
            "inferenceConfig": {"maxTokens": max_tokens, "temperature": temperature},
            "system": [{"text": system_text}],
        })
    }

    /// Generate a streaming response to `user_text`, yielding fragments
    /// partitioned at sentence boundaries (§4.3 step 4). On success, appends
    /// both the user turn and the completed assistant turn to history. On
    /// failure, yields a single apology fragment and still appends it as the
    /// assistant turn (§7).
    pub async fn generate_stream(&mut self, user_text: &str) -> Vec<String> {
        let system_prompt = match self.pending_greeting.take() {
            Some(greeting) => format!(
                "{}\n\nYou just said: \u{ab}{}\u{bb}. Now respond to their reply.",
                self.system_prompt, greeting
            ),
            None => self.system_prompt.clone(),
        };

        self.messages.push(Message {
            role: Role::User,
            content: user_text.to_string(),
        });

        let payload = Self::converse_payload(
            &self.messages,
            &system_prompt,
            self.config.max_tokens,
            self.config.temperature,
        );
        let url = format!("{}/converse-stream", self.base_url);

        let response = match self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .timeout(GENERATE_RESPONSE_TIMEOUT)
            .send()
            .await
        {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                let status = r.status();
                error!("LLM streaming request failed: {}", status);
                return self.apologize("I'm sorry, I'm having trouble connecting.");
            }
            Err(e) => {
                error!("LLM streaming request error: {}", e);
                return self.apologize("I'm sorry, I'm having trouble connecting.");
            }
        };

        let mut byte_stream = response.bytes_stream();
        let mut scanner = StreamScanner::default();

        loop {
            let chunk = match byte_stream.next().await {
                Some(Ok(c)) => c,
                Some(Err(e)) => {
                    error!("LLM stream read error: {}", e);
                    break;
                }
                None => break,
            };
            scanner.feed(&chunk);
        }
        let (full_response, fragments) = scanner.finish();

        if full_response.is_empty() {
            warn!("LLM produced an empty completion");
            return self.apologize("I'm sorry, could you repeat that?");
        }

        self.messages.push(Message {
            role: Role::Assistant,
            content: full_response,
        });
        fragments
    }

    /// Yield a single apology fragment and record it as the assistant turn,
    /// per §7 ("still counts as a completed assistant turn in history").
    fn apologize(&mut self, text: &str) -> Vec<String> {
        self.messages.push(Message {
            role: Role::Assistant,
            content: text.to_string(),
        });
        vec![text.to_string()]
    }

    /// Non-streaming `converse` call used by the greeting bootstrap.
    async fn converse_once(
        &self,
        user_text: &str,
        max_tokens: u32,
        temperature: f32,
        timeout: Duration,
    ) -> Option<String> {
        let payload = json!({
            "messages": [{"role": "user", "content": [{"text": user_text}]}],
            "inferenceConfig": {"maxTokens": max_tokens, "temperature": temperature},
        });
        let url = format!("{}/converse", self.base_url);

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .timeout(timeout)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let body: serde_json::Value = response.json().await.ok()?;
        body.get("output")
            .and_then(|o| o.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("text"))
            .and_then(|t| t.as_str())
            .map(|s| s.to_string())
    }
}

/// Result of the one-time greeting bootstrap (§4.3).
pub struct Bootstrap {
    pub system_prompt: String,
    pub greeting: String,
}

/// Generate a tailored system prompt and opening greeting for `purpose`,
/// computed in parallel; each falls back independently on failure.
pub async fn bootstrap_call(config: &BedrockConfig, purpose: &str) -> Bootstrap {
    let client = LlmClient::new(config.clone(), None);

    let system_prompt_meta = format!(
        "You are creating a system prompt for a voice AI agent that will make a phone call.\n\nThe purpose of this call is: {purpose}\n\nGenerate a concise system prompt (about 200 words) that:\n1. Defines the agent's role and goal for THIS specific call\n2. Sets appropriate guardrails for professional conduct\n3. Instructs the agent to be conversational and natural\n4. Reminds the agent to keep responses short (suitable for voice)\n5. Includes any relevant context for the call purpose\n\nOutput ONLY the system prompt text, nothing else. Do not include any meta-commentary."
    );
    let greeting_meta = format!(
        "Generate a natural, friendly opening line (20 words or fewer) for a phone call.\n\nThe purpose of this call is: {purpose}\n\nRequirements:\n- Be friendly and professional\n- Introduce yourself as an AI assistant\n- Naturally lead into the call purpose\n- Do NOT ask \"how can I help you\" - you know why you're calling\n\nOutput ONLY the greeting text, nothing else."
    );

    let (system_prompt_result, greeting_result) = tokio::join!(
        client.converse_once(&system_prompt_meta, 500, 0.7, BOOTSTRAP_TIMEOUT),
        client.converse_once(&greeting_meta, 50, 0.8, BOOTSTRAP_TIMEOUT),
    );

    let system_prompt = system_prompt_result.unwrap_or_else(|| {
        warn!("system prompt bootstrap failed, falling back to default");
        format!("{}\n\nCall purpose: {}", DEFAULT_SYSTEM_PROMPT, purpose)
    });
    let greeting = greeting_result
        .map(|g| g.trim().trim_matches(|c| c == '"' || c == '\'').to_string())
        .unwrap_or_else(|| {
            warn!("greeting bootstrap failed, falling back to canned greeting");
            format!("Hello, this is an AI assistant calling about {}.", purpose)
        });

    info!("bootstrap complete: greeting = {:?}", greeting);
    Bootstrap {
        system_prompt,
        greeting,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_pattern_extracts_escaped_fragment() {
        let raw = br#"event {"text":"Hello, \"world\"!\n"} more"#;
        let caps = text_pattern().captures(raw).unwrap();
        let decoded = unescape_json_fragment(caps.get(1).unwrap().as_bytes()).unwrap();
        assert_eq!(decoded, "Hello, \"world\"!\n");
    }

    #[test]
    fn text_pattern_skips_malformed_window_without_aborting() {
        let raw = br#"garbage "text":"ok" more garbage {"text":"second"}"#;
        let matches: Vec<_> = text_pattern()
            .find_iter(raw)
            .map(|m| {
                let caps = text_pattern().captures(&raw[m.start()..m.end()]).unwrap();
                unescape_json_fragment(caps.get(1).unwrap().as_bytes()).unwrap()
            })
            .collect();
        assert_eq!(matches, vec!["ok", "second"]);
    }

    #[test]
    fn default_system_prompt_is_non_empty() {
        assert!(!DEFAULT_SYSTEM_PROMPT.is_empty());
    }

    #[test]
    fn scanner_finds_a_text_field_straddling_two_chunks() {
        let event = br#"{"text":"It is sunny."}"#;
        let split_at = event.len() - 6;

        let mut scanner = StreamScanner::default();
        scanner.feed(&event[..split_at]);
        scanner.feed(&event[split_at..]);
        let (full_response, _) = scanner.finish();

        assert_eq!(full_response, "It is sunny.");
    }

    #[test]
    fn scanner_yields_one_fragment_per_chunk_when_delivered_whole() {
        let mut scanner = StreamScanner::default();
        scanner.feed(br#"{"text":"It is sunny."}"#);
        scanner.feed(br#"{"text":" Anything else?"}"#);
        let (full_response, fragments) = scanner.finish();

        assert_eq!(full_response, "It is sunny. Anything else?");
        assert_eq!(fragments, vec!["It is sunny.", " Anything else?"]);
    }

    #[test]
    fn scanner_chunks_long_runs_without_terminal_punctuation_at_a_trailing_space() {
        let mut scanner = StreamScanner::default();
        scanner.feed(br#"{"text":"This is a longer sentence without any punctuation at all "}"#);
        scanner.feed(br#"{"text":"and it keeps going."}"#);
        let (_, fragments) = scanner.finish();

        assert_eq!(fragments.len(), 2);
        assert!(fragments[0].len() > 40);
        assert!(fragments[0].ends_with(' '));
    }

    #[test]
    fn scanner_flushes_residue_with_no_terminal_punctuation_at_end_of_stream() {
        let mut scanner = StreamScanner::default();
        scanner.feed(br#"{"text":"short"}"#);
        let (full_response, fragments) = scanner.finish();

        assert_eq!(full_response, "short");
        assert_eq!(fragments, vec!["short"]);
    }
}
