/// Vision client — the single point of entry for calls to the Gemini
/// `generateContent` API.
///
/// No other module talks to the vision API directly. Requests are built once
/// per analysis, sent through a `Transport`, retried under a `RetryPolicy`,
/// and the returned text is parsed with the configured `ResultFormat`.
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::analysis::ingest::IngestedImage;
use crate::analysis::parse::{AnalysisResult, ResultFormat};
use crate::config::Config;

pub mod prompts;
pub mod retry;
pub mod transport;

use self::retry::{RetryError, RetryPolicy};
use self::transport::{ReqwestTransport, Transport};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum VisionError {
    /// Bad or missing local input. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Network failure, 429 or 5xx. Retried, then escalated to `Permanent`.
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Analysis failed: {0}")]
    Permanent(String),
}

impl VisionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, VisionError::Transient(_))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Wire types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
    system_instruction: SystemInstruction<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'a str,
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
struct SystemInstruction<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Part<'a> {
    Text {
        text: &'a str,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData<'a>,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData<'a> {
    mime_type: &'a str,
    data: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_mime_type: &'static str,
    response_schema: Value,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
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
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

impl GenerateContentResponse {
    /// Concatenated text parts of the first candidate, if any are non-blank.
    fn text(&self) -> Option<String> {
        let parts = &self.candidates.first()?.content.as_ref()?.parts;
        let text: String = parts.iter().filter_map(|p| p.text.as_deref()).collect();
        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

// ────────────────────────────────────────────────────────────────────────────
// Client
// ────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct VisionClient {
    transport: Arc<dyn Transport>,
    endpoint: String,
    format: ResultFormat,
    retry: RetryPolicy<VisionError>,
}

impl VisionClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        endpoint: String,
        format: ResultFormat,
        retry: RetryPolicy<VisionError>,
    ) -> Self {
        Self {
            transport,
            endpoint,
            format,
            retry,
        }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self::new(
            Arc::new(ReqwestTransport::new()?),
            config.generate_content_url()?,
            config.result_format,
            default_retry_policy(
                config.analysis_max_attempts,
                Duration::from_millis(config.analysis_base_delay_ms),
            ),
        ))
    }

    pub fn format(&self) -> ResultFormat {
        self.format
    }

    /// Serializes the request body. Called once per analysis; every attempt
    /// re-sends the same bytes.
    fn build_request(&self, image: &IngestedImage) -> Result<Bytes, VisionError> {
        let system = prompts::system_instruction(self.format);
        let generation_config = match self.format {
            ResultFormat::Freeform => None,
            ResultFormat::Structured => Some(GenerationConfig {
                response_mime_type: "application/json",
                response_schema: prompts::response_schema(),
            }),
        };

        let request = GenerateContentRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![
                    Part::Text {
                        text: prompts::ANALYSIS_USER_PROMPT,
                    },
                    Part::InlineData {
                        inline_data: InlineData {
                            mime_type: &image.mime_type,
                            data: &image.data_base64,
                        },
                    },
                ],
            }],
            system_instruction: SystemInstruction {
                parts: vec![Part::Text { text: &system }],
            },
            generation_config,
        };

        serde_json::to_vec(&request)
            .map(Bytes::from)
            .map_err(|e| VisionError::Permanent(format!("could not encode request: {e}")))
    }

    /// Sends the image for analysis and parses the model's answer.
    /// Transient failures are retried with backoff; once the budget is spent
    /// the last cause comes back as `Permanent`.
    pub async fn analyze(&self, image: &IngestedImage) -> Result<AnalysisResult, VisionError> {
        if image.data_base64.is_empty() || image.mime_type.is_empty() {
            return Err(VisionError::Validation(
                "No image is loaded for analysis".to_string(),
            ));
        }
        if self.endpoint.is_empty() {
            return Err(VisionError::Validation(
                "Vision endpoint is not configured".to_string(),
            ));
        }

        let body = self.build_request(image)?;

        let text = self
            .retry
            .run(|attempt| self.send_once(attempt, body.clone()))
            .await
            .map_err(|e| match e {
                RetryError::Exhausted { attempts, last } => {
                    VisionError::Permanent(format!("gave up after {attempts} attempts: {last}"))
                }
                RetryError::Aborted(err) => err,
            })?;

        self.format
            .parse(&text)
            .map_err(|e| VisionError::Permanent(e.to_string()))
    }

    async fn send_once(&self, attempt: u32, body: Bytes) -> Result<String, VisionError> {
        debug!("Vision request attempt {}", attempt + 1);

        let response = self
            .transport
            .post_json(&self.endpoint, body)
            .await
            .map_err(|e| VisionError::Transient(e.to_string()))?;

        let status = response.status;
        if status == 429 || status >= 500 {
            return Err(VisionError::Transient(format!(
                "API returned {status}: {}",
                snippet(&response.body)
            )));
        }

        if !(200..300).contains(&status) {
            let message = serde_json::from_str::<ApiError>(&response.body)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| snippet(&response.body).to_string());
            return Err(VisionError::Permanent(format!(
                "API error (status {status}): {message}"
            )));
        }

        let envelope: GenerateContentResponse = serde_json::from_str(&response.body)
            .map_err(|e| VisionError::Permanent(format!("malformed response envelope: {e}")))?;

        let text = envelope
            .text()
            .ok_or_else(|| VisionError::Permanent("empty response".to_string()))?;

        debug!("Vision request succeeded with {} chars of text", text.len());
        Ok(text)
    }
}

pub fn default_retry_policy(max_attempts: u32, base_delay: Duration) -> RetryPolicy<VisionError> {
    RetryPolicy::new(max_attempts, base_delay, VisionError::is_transient)
}

fn snippet(body: &str) -> &str {
    match body.char_indices().nth(200) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
