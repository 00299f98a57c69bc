//! Text-generation backend used by workers for `!ask`.

use std::{future::Future, time::Duration};

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::config::CREDENTIAL_ENV;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";
pub const BASE_URL_ENV: &str = "GEMINI_BASE_URL";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const TEMPERATURE: f32 = 0.7;
const MAX_OUTPUT_TOKENS: u32 = 250;
const HARM_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("no API credential configured")]
    MissingCredential,
    #[error("prompt is empty")]
    EmptyPrompt,
    #[error("HTTP client setup failed: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("backend returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("response carried no text")]
    Malformed,
}

pub trait AiBackend: Send + Sync {
    fn generate(
        &self,
        persona: &str,
        prompt: &str,
        credential: &str,
    ) -> impl Future<Output = Result<String, BackendError>> + Send;
}

/// Read the credential from the environment. Unset and empty both mean AI is
/// disabled.
pub fn credential_from_env() -> Option<String> {
    std::env::var(CREDENTIAL_ENV)
        .ok()
        .filter(|value| !value.is_empty())
}

#[derive(Debug, Clone)]
pub struct GeminiClient {
    client: Client,
    base_url: String,
    model: String,
}

impl GeminiClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(BackendError::Client)?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        })
    }

    /// Production endpoint, overridable through `GEMINI_BASE_URL`.
    pub fn from_env() -> Result<Self, BackendError> {
        let base_url = std::env::var(BASE_URL_ENV)
            .ok()
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self::new(base_url, DEFAULT_MODEL)
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        )
    }
}

impl AiBackend for GeminiClient {
    async fn generate(
        &self,
        persona: &str,
        prompt: &str,
        credential: &str,
    ) -> Result<String, BackendError> {
        if credential.is_empty() {
            return Err(BackendError::MissingCredential);
        }
        if prompt.trim().is_empty() {
            return Err(BackendError::EmptyPrompt);
        }

        let request = GenerateRequest::new(persona, prompt);
        tracing::debug!(model = %self.model, prompt_len = prompt.len(), "sending generation request");
        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", credential)
            .json(&request)
            .send()
            .await
            .map_err(|error| BackendError::Transport(error.without_url()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status { status, body });
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|error| BackendError::Transport(error.without_url()))?;
        parsed.into_text().ok_or(BackendError::Malformed)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: [Content<'a>; 2],
    safety_settings: Vec<SafetySetting>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: [Part<'a>; 1],
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct SafetySetting {
    category: &'static str,
    threshold: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

impl<'a> GenerateRequest<'a> {
    fn new(persona: &'a str, prompt: &'a str) -> Self {
        let user = |text| Content {
            role: "user",
            parts: [Part { text }],
        };
        Self {
            contents: [user(persona), user(prompt)],
            safety_settings: HARM_CATEGORIES
                .into_iter()
                .map(|category| SafetySetting {
                    category,
                    threshold: "BLOCK_NONE",
                })
                .collect(),
            generation_config: GenerationConfig {
                temperature: TEMPERATURE,
                max_output_tokens: MAX_OUTPUT_TOKENS,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

impl GenerateResponse {
    fn into_text(self) -> Option<String> {
        self.candidates
            .into_iter()
            .next()?
            .content?
            .parts
            .into_iter()
            .next()?
            .text
    }
}
