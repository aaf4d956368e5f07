//! Vision model client and the per-image analysis call.
//!
//! The external capability is reached through [`VisionCapability`]; the
//! production implementation speaks the OpenAI-compatible chat completions
//! protocol with the image inlined as a base64 data URL. [`AnalysisInvoker`]
//! wraps any capability with locale-based prompt selection, a per-call
//! timeout and metrics.

use crate::config::VisionConfig;
use crate::prompts::Locale;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Failure of one analysis call
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Vision request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Vision API returned status {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Vision request failed: {0}")]
    Transport(String),

    #[error("Malformed vision response: {0}")]
    Malformed(String),

    #[error("Invalid image: {0}")]
    InvalidImage(String),
}

/// External vision capability: image plus instructions in, free-form text out
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VisionCapability: Send + Sync {
    /// Describe an image following `prompt`
    async fn describe(
        &self,
        image: &[u8],
        mime_type: &str,
        prompt: &str,
    ) -> Result<String, AnalysisError>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: Vec<ContentPart<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// OpenAI-compatible vision client
pub struct OpenAiVision {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl OpenAiVision {
    /// Create a client; `timeout` bounds each HTTP request
    pub fn new(config: &VisionConfig, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", config.api_base.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        })
    }

    fn build_request<'a>(&'a self, image: &[u8], mime_type: &str, prompt: &'a str) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: vec![
                    ContentPart::Text { text: prompt },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: data_url(image, mime_type),
                        },
                    },
                ],
            }],
            max_tokens: self.max_tokens,
        }
    }
}

#[async_trait]
impl VisionCapability for OpenAiVision {
    async fn describe(
        &self,
        image: &[u8],
        mime_type: &str,
        prompt: &str,
    ) -> Result<String, AnalysisError> {
        let request = self.build_request(image, mime_type, prompt);

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AnalysisError::Upstream {
                status: status.as_u16(),
                body: truncate(&body, 512),
            });
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| AnalysisError::Malformed(e.to_string()))?;

        extract_text(body)
    }
}

fn transport_error(e: reqwest::Error) -> AnalysisError {
    if e.is_timeout() {
        AnalysisError::Timeout(Duration::ZERO)
    } else {
        AnalysisError::Transport(e.to_string())
    }
}

fn extract_text(response: ChatResponse) -> Result<String, AnalysisError> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .filter(|text| !text.trim().is_empty())
        .ok_or_else(|| AnalysisError::Malformed("response carries no text".to_string()))
}

fn data_url(image: &[u8], mime_type: &str) -> String {
    format!("data:{};base64,{}", mime_type, STANDARD.encode(image))
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Runs one image through the vision capability with the locale's prompt
pub struct AnalysisInvoker {
    vision: Arc<dyn VisionCapability>,
    timeout: Duration,
}

impl AnalysisInvoker {
    pub fn new(vision: Arc<dyn VisionCapability>, timeout: Duration) -> Self {
        Self { vision, timeout }
    }

    /// Assess one image. Failures come back as values; nothing here panics.
    #[instrument(skip(self, image), fields(size_bytes = image.len(), locale = %locale))]
    pub async fn analyze(
        &self,
        image: &[u8],
        mime_type: &str,
        locale: Locale,
    ) -> Result<String, AnalysisError> {
        if image.is_empty() {
            return Err(AnalysisError::InvalidImage("image is empty".to_string()));
        }

        let started = Instant::now();
        let result = match tokio::time::timeout(
            self.timeout,
            self.vision.describe(image, mime_type, locale.prompt()),
        )
        .await
        {
            Ok(Err(AnalysisError::Timeout(_))) | Err(_) => Err(AnalysisError::Timeout(self.timeout)),
            Ok(result) => result,
        };

        metrics::histogram!("analysis.vision.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(text) if text.trim().is_empty() => {
                Err(AnalysisError::Malformed("empty assessment".to_string()))
            }
            Ok(text) => {
                debug!(chars = text.len(), "Vision assessment received");
                Ok(text.trim().to_string())
            }
            Err(e) => {
                warn!(error = %e, "Vision assessment failed");
                Err(e)
            }
        }
    }
}
