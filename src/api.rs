use crate::config::{GenerationConfig, SafetySettings};
use crate::error::{ChatError, ChatResult};
use crate::history;
use crate::models::{ApiRole, TranscriptEntry};
use anyhow::{Context, Result};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

// Alias for the stream type we'll return
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

pub const GEMINI_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

// Trait defining the interface for generation API providers
#[async_trait]
pub trait GenerationApi: Send + Sync {
    /// Opens a chat session seeded with `history` and sends `prompt` as its
    /// triggering message. Returns a stream of text deltas.
    async fn send_chat_stream_request(
        &self,
        config: &GenerationConfig,
        api_key: &str,
        history: &[TranscriptEntry],
        prompt: &str,
    ) -> Result<DeltaStream>;
}

/// Validates the transcript, applies the history cap and collects the model's
/// full reply. `transcript` still ends with the pending user message; it is
/// stripped before the session opens because `prompt` is sent separately.
pub async fn generate_reply(
    api: &dyn GenerationApi,
    api_key: Option<&str>,
    config: &GenerationConfig,
    transcript: Vec<TranscriptEntry>,
    prompt: &str,
    seed_count: usize,
) -> ChatResult<String> {
    let api_key = api_key
        .filter(|k| !k.trim().is_empty())
        .ok_or(ChatError::MissingCredential)?;

    let mut valid: Vec<TranscriptEntry> = transcript
        .into_iter()
        .filter(|entry| !entry.text.is_empty())
        .collect();

    match valid.last() {
        None => return Err(ChatError::InvalidHistory("no messages to send".to_string())),
        Some(last) if last.role != ApiRole::User => {
            return Err(ChatError::InvalidHistory(
                "must end with a user message".to_string(),
            ))
        }
        Some(_) => {}
    }

    valid = history::apply_history_cap(valid, config.max_history_length, seed_count);
    valid.pop();

    log::info!(
        "Requesting reply from {} with {} history entries",
        config.model,
        valid.len()
    );
    let mut delta_stream = api
        .send_chat_stream_request(config, api_key, &valid, prompt)
        .await
        .map_err(ChatError::generation)?;

    let mut full_content = String::new();
    while let Some(delta_result) = delta_stream.next().await {
        let delta = delta_result.map_err(|e| {
            log::error!("Error receiving stream delta: {:?}", e);
            ChatError::generation(e)
        })?;
        full_content.push_str(&delta);
    }

    let reply = full_content.trim().to_string();
    log::info!("Stream finished, reply has {} chars", reply.len());
    Ok(reply)
}

// --- Gemini Provider Implementation ---

#[derive(Serialize, Debug)]
struct GeminiPart<'a> {
    text: &'a str,
}

#[derive(Serialize, Debug)]
struct GeminiContent<'a> {
    role: ApiRole,
    parts: Vec<GeminiPart<'a>>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    max_output_tokens: u32,
    temperature: f32,
}

#[derive(Serialize, Debug, PartialEq)]
struct GeminiSafetySetting {
    category: &'static str,
    threshold: &'static str,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GeminiRequestBody<'a> {
    contents: Vec<GeminiContent<'a>>,
    generation_config: GeminiGenerationConfig,
    safety_settings: Vec<GeminiSafetySetting>,
}

// Response structure for STREAMING chunks
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct GeminiStreamChunk {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    prompt_feedback: Option<GeminiPromptFeedback>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiCandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct GeminiCandidateContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Deserialize, Debug)]
struct GeminiResponsePart {
    text: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    block_reason: Option<String>,
}

fn safety_settings(safety: &SafetySettings) -> Vec<GeminiSafetySetting> {
    vec![
        GeminiSafetySetting {
            category: "HARM_CATEGORY_HARASSMENT",
            threshold: safety.harassment.api_name(),
        },
        GeminiSafetySetting {
            category: "HARM_CATEGORY_HATE_SPEECH",
            threshold: safety.hate_speech.api_name(),
        },
        GeminiSafetySetting {
            category: "HARM_CATEGORY_SEXUALLY_EXPLICIT",
            threshold: safety.sexual.api_name(),
        },
        GeminiSafetySetting {
            category: "HARM_CATEGORY_DANGEROUS_CONTENT",
            threshold: safety.dangerous.api_name(),
        },
    ]
}

fn build_request_body<'a>(
    config: &GenerationConfig,
    history: &'a [TranscriptEntry],
    prompt: &'a str,
) -> GeminiRequestBody<'a> {
    let mut contents: Vec<GeminiContent<'a>> = history
        .iter()
        .map(|entry| GeminiContent {
            role: entry.role,
            parts: vec![GeminiPart { text: &entry.text }],
        })
        .collect();
    contents.push(GeminiContent {
        role: ApiRole::User,
        parts: vec![GeminiPart { text: prompt }],
    });

    GeminiRequestBody {
        contents,
        generation_config: GeminiGenerationConfig {
            max_output_tokens: config.max_output_tokens,
            temperature: config.temperature,
        },
        safety_settings: safety_settings(&config.safety),
    }
}

/// Extracts the text carried by one SSE data payload. `Ok(None)` means the
/// event had nothing to contribute.
fn parse_stream_event(event_data: &str) -> Result<Option<String>> {
    let event_data = event_data.trim();
    if event_data.is_empty() {
        return Ok(None);
    }

    let chunk: GeminiStreamChunk = serde_json::from_str(event_data)
        .with_context(|| format!("Failed to parse stream chunk as JSON: {}", event_data))?;

    if let Some(reason) = chunk.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(anyhow::anyhow!("blocked: {}", reason));
    }

    let Some(candidate) = chunk.candidates.into_iter().next() else {
        return Ok(None);
    };

    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    let finish_reason = candidate.finish_reason.unwrap_or_default();

    if !text.is_empty() {
        return Ok(Some(text));
    }
    match finish_reason.as_str() {
        "SAFETY" | "BLOCKLIST" | "PROHIBITED_CONTENT" => {
            Err(anyhow::anyhow!("blocked: {}", finish_reason))
        }
        _ => Ok(None),
    }
}

pub struct GeminiProvider {
    client: Client,
    base_url: String,
}

impl GeminiProvider {
    pub fn new() -> Self {
        Self::with_base_url(GEMINI_API_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }
}

impl Default for GeminiProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GenerationApi for GeminiProvider {
    async fn send_chat_stream_request(
        &self,
        config: &GenerationConfig,
        api_key: &str,
        history: &[TranscriptEntry],
        prompt: &str,
    ) -> Result<DeltaStream> {
        log::info!(
            "Sending STREAM request to Gemini API: {} using model: {}",
            self.base_url,
            config.model
        );

        let request_body = build_request_body(config, history, prompt);
        let request_url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url.trim_end_matches('/'),
            config.model
        );

        let response = self
            .client
            .post(&request_url)
            .header("x-goog-api-key", api_key)
            .json(&request_body)
            .send()
            .await
            .context("Failed to send stream request to Gemini API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "<Failed to read error body>".to_string());
            log::error!("Gemini stream request failed with status {}: {}", status, error_body);
            return Err(anyhow::anyhow!(
                "API stream request failed with status {}: {}",
                status,
                error_body
            ));
        }

        let delta_stream = response
            .bytes_stream()
            .eventsource()
            .map(|event_result| -> Result<Option<String>> {
                let event = event_result.context("Error reading stream event")?;
                parse_stream_event(&event.data)
            })
            .filter_map(|result| async move {
                match result {
                    Ok(Some(content)) => Some(Ok(content)),
                    Ok(None) => None,
                    Err(e) => {
                        log::error!("Error processing stream chunk: {:?}", e);
                        Some(Err(e))
                    }
                }
            });

        Ok(Box::pin(delta_stream))
    }
}
