//! Language-model service boundary.
//!
//! The pipeline consumes two operations, [`score`](LanguageModel::score) and
//! [`shorten`](LanguageModel::shorten), through the [`LanguageModel`] trait.
//! Both must be callable concurrently and fail independently per call.
//!
//! - **[`OpenAiModel`]** calls an OpenAI-compatible `chat/completions`
//!   endpoint with retry and backoff.
//! - **[`DisabledModel`]** fails every call; with it a run rates every chunk
//!   at the default score and ends `Exhausted` without changing the text.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ModelsConfig;

/// Reply that marks a chunk as unsafe to shorten.
pub const NOT_REDUCIBLE: &str = "NOT_REDUCIBLE";

/// Characters of chunk text sent with a scoring request.
const SCORE_INPUT_CHARS: usize = 12_000;

/// A failed model call. Always recoverable at the pipeline level.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("model service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed model response: {0}")]
    Malformed(String),

    #[error("language model provider is disabled")]
    Disabled,
}

/// Result of a shortening request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShortenOutcome {
    Shortened(String),
    /// The model declined: the chunk cannot lose anything safely.
    NotReducible,
}

/// The two model operations the pipeline needs.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Model used for relevance scoring. Part of every rating fingerprint.
    fn rating_model(&self) -> &str;

    /// Model used for shortening. Part of every shrink fingerprint.
    fn compression_model(&self) -> &str;

    /// Raw relevance of `text` to `intent`. Out-of-range values are returned
    /// as-is; clamping is the caller's job.
    async fn score(&self, text: &str, intent: &str) -> std::result::Result<f64, CallError>;

    /// Ask for a version of `text` of at most roughly `budget` tokens.
    async fn shorten(
        &self,
        text: &str,
        budget: usize,
        intent: &str,
    ) -> std::result::Result<ShortenOutcome, CallError>;
}

// ============ Prompts ============

pub fn rating_system_prompt(intent: &str) -> String {
    let mut prompt = String::from(
        "Rate how critical this chunk is to preserve author intent. \
         Return only a number 0-10 (float allowed). Higher = more critical.",
    );
    if !intent.trim().is_empty() {
        prompt.push_str(&format!(" Author intent: {}", intent.trim()));
    }
    prompt
}

pub fn shorten_system_prompt(budget: usize, intent: &str) -> String {
    let mut prompt = format!(
        "Shorten the Markdown chunk conservatively. Preserve meaning. \
         KEEP code fences and tables unchanged; do not alter code. \
         Keep every heading and every list item at its indentation. \
         Aim for <= {} tokens. Return only the chunk. \
         If it cannot be shortened without losing code, tables or meaning, reply exactly {}.",
        budget, NOT_REDUCIBLE
    );
    if !intent.trim().is_empty() {
        prompt.push_str(&format!(" Author intent: {}", intent.trim()));
    }
    prompt
}

/// Wrap chunk text the way both prompts expect it.
pub fn user_message(text: &str) -> String {
    format!("```md\n{}\n```", text)
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ============ Response parsing ============

/// First decimal number in a scoring reply, e.g. `"Score: 7.5/10"` → 7.5.
pub fn parse_score(reply: &str) -> Option<f64> {
    let bytes = reply.as_bytes();
    let start = bytes.iter().position(|b| b.is_ascii_digit())?;
    let negative = start > 0 && bytes[start - 1] == b'-';

    let mut end = start;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end + 1 < bytes.len() && bytes[end] == b'.' && bytes[end + 1].is_ascii_digit() {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
    }

    let value: f64 = reply[start..end].parse().ok()?;
    Some(if negative { -value } else { value })
}

/// Interpret a shortening reply: detect the sentinel and drop a wrapping
/// ```` ```md ```` fence echoed back from the request.
pub fn parse_shorten_reply(reply: &str) -> std::result::Result<ShortenOutcome, CallError> {
    let trimmed = reply.trim();
    if trimmed.is_empty() {
        return Err(CallError::Malformed("empty shorten reply".to_string()));
    }
    if trimmed.trim_matches('`').trim() == NOT_REDUCIBLE {
        return Ok(ShortenOutcome::NotReducible);
    }
    Ok(ShortenOutcome::Shortened(strip_wrapping_fence(trimmed).to_string()))
}

fn strip_wrapping_fence(text: &str) -> &str {
    for opener in ["```md\n", "```markdown\n"] {
        if let Some(inner) = text.strip_prefix(opener) {
            if let Some(body) = inner.strip_suffix("```") {
                return body.strip_suffix('\n').unwrap_or(body);
            }
        }
    }
    text
}

// ============ Disabled Provider ============

/// Fails every call with [`CallError::Disabled`].
pub struct DisabledModel;

#[async_trait]
impl LanguageModel for DisabledModel {
    fn rating_model(&self) -> &str {
        "disabled"
    }

    fn compression_model(&self) -> &str {
        "disabled"
    }

    async fn score(&self, _text: &str, _intent: &str) -> std::result::Result<f64, CallError> {
        Err(CallError::Disabled)
    }

    async fn shorten(
        &self,
        _text: &str,
        _budget: usize,
        _intent: &str,
    ) -> std::result::Result<ShortenOutcome, CallError> {
        Err(CallError::Disabled)
    }
}

// ============ OpenAI Provider ============

/// Chat-completions client for OpenAI and compatible services.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAiModel {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    rating_model: String,
    compression_model: String,
    max_retries: u32,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

impl OpenAiModel {
    /// # Errors
    ///
    /// Returns an error if `OPENAI_API_KEY` is not in the environment or the
    /// HTTP client cannot be built.
    pub fn new(config: &ModelsConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            rating_model: config.rating_model.clone(),
            compression_model: config.compression_model.clone(),
            max_retries: config.max_retries,
        })
    }

    /// One chat completion with retry/backoff. Returns the first choice's
    /// content.
    async fn chat(
        &self,
        model: &str,
        system: String,
        user: String,
        max_tokens: u32,
    ) -> std::result::Result<String, CallError> {
        let body = ChatRequest {
            model,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system,
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user,
                },
            ],
            max_tokens,
            temperature: 0.0,
        };
        let url = format!("{}/chat/completions", self.base_url);

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tracing::debug!(model, attempt, delay_secs = delay.as_secs(), "retrying model call");
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let parsed: ChatResponse = response
                            .json()
                            .await
                            .map_err(|e| CallError::Malformed(e.to_string()))?;
                        return parsed
                            .choices
                            .into_iter()
                            .next()
                            .map(|c| c.message.content)
                            .ok_or_else(|| CallError::Malformed("no choices in response".into()));
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let err = CallError::Status {
                        status: status.as_u16(),
                        body: body_text,
                    };

                    // Rate limited or server error, retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(err);
                        continue;
                    }

                    // Client error (not 429), do not retry
                    return Err(err);
                }
                Err(e) => {
                    last_err = Some(CallError::Transport(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| CallError::Transport("model call failed after retries".into())))
    }
}

#[async_trait]
impl LanguageModel for OpenAiModel {
    fn rating_model(&self) -> &str {
        &self.rating_model
    }

    fn compression_model(&self) -> &str {
        &self.compression_model
    }

    async fn score(&self, text: &str, intent: &str) -> std::result::Result<f64, CallError> {
        let reply = self
            .chat(
                &self.rating_model,
                rating_system_prompt(intent),
                user_message(truncate_chars(text, SCORE_INPUT_CHARS)),
                16,
            )
            .await?;
        parse_score(&reply).ok_or_else(|| CallError::Malformed(format!("no score in '{}'", reply.trim())))
    }

    async fn shorten(
        &self,
        text: &str,
        budget: usize,
        intent: &str,
    ) -> std::result::Result<ShortenOutcome, CallError> {
        let max_tokens = (budget.saturating_mul(2)).clamp(256, 8192) as u32;
        let reply = self
            .chat(
                &self.compression_model,
                shorten_system_prompt(budget, intent),
                user_message(text),
                max_tokens,
            )
            .await?;
        parse_shorten_reply(&reply)
    }
}

/// Create the [`LanguageModel`] named by `config.provider`.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledModel`] |
/// | `"openai"` | [`OpenAiModel`] |
pub fn create_model(config: &ModelsConfig) -> Result<Arc<dyn LanguageModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledModel)),
        "openai" => Ok(Arc::new(OpenAiModel::new(config)?)),
        other => bail!("Unknown model provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_is_first_number() {
        assert_eq!(parse_score("7"), Some(7.0));
        assert_eq!(parse_score("Score: 7.5/10"), Some(7.5));
        assert_eq!(parse_score("  3.25 because..."), Some(3.25));
        assert_eq!(parse_score("12"), Some(12.0));
        assert_eq!(parse_score("-2"), Some(-2.0));
        assert_eq!(parse_score("8."), Some(8.0));
        assert_eq!(parse_score("no idea"), None);
        assert_eq!(parse_score(""), None);
    }

    #[test]
    fn sentinel_is_recognized() {
        assert_eq!(
            parse_shorten_reply("NOT_REDUCIBLE").unwrap(),
            ShortenOutcome::NotReducible
        );
        assert_eq!(
            parse_shorten_reply("`NOT_REDUCIBLE`\n").unwrap(),
            ShortenOutcome::NotReducible
        );
    }

    #[test]
    fn echoed_wrapper_fence_is_removed() {
        assert_eq!(
            parse_shorten_reply("```md\n# Title\n\nShort.\n```").unwrap(),
            ShortenOutcome::Shortened("# Title\n\nShort.".to_string())
        );
        // A chunk that is itself a code block is left alone.
        assert_eq!(
            parse_shorten_reply("```rust\nfn f() {}\n```").unwrap(),
            ShortenOutcome::Shortened("```rust\nfn f() {}\n```".to_string())
        );
    }

    #[test]
    fn empty_reply_is_malformed() {
        assert!(matches!(
            parse_shorten_reply("  \n"),
            Err(CallError::Malformed(_))
        ));
    }

    #[test]
    fn prompts_carry_intent_and_budget() {
        let p = shorten_system_prompt(120, "keep the API contract");
        assert!(p.contains("<= 120 tokens"));
        assert!(p.contains(NOT_REDUCIBLE));
        assert!(p.ends_with("Author intent: keep the API contract"));
        assert!(!rating_system_prompt("  ").contains("Author intent"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[tokio::test]
    async fn disabled_model_always_fails() {
        let model = DisabledModel;
        assert!(matches!(model.score("x", "").await, Err(CallError::Disabled)));
        assert!(matches!(
            model.shorten("x", 1, "").await,
            Err(CallError::Disabled)
        ));
    }

    #[test]
    fn create_model_rejects_unknown_provider() {
        let config = ModelsConfig {
            provider: "local".to_string(),
            ..ModelsConfig::default()
        };
        assert!(create_model(&config).is_err());
        let config = ModelsConfig {
            provider: "disabled".to_string(),
            ..ModelsConfig::default()
        };
        assert_eq!(create_model(&config).unwrap().rating_model(), "disabled");
    }
}
