//! External analysis engine.
//!
//! The [`AnalysisEngine`] trait is the boundary to the model that judges a
//! piece of evidence against one requirement. [`OllamaEngine`] implements it
//! over the Ollama chat API.

use crate::models::{AnalysisContext, AnalysisResponse, ComplianceStatus, Control, TokenUsage};
use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Errors raised by an analysis engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AnalysisError {
    /// The engine asked us to slow down.
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("engine returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("failed to parse engine response: {0}")]
    Parse(String),
}

/// Boundary to the external text/image analysis model.
#[async_trait]
pub trait AnalysisEngine: Send + Sync {
    /// Judge text evidence against a control's requirement.
    async fn analyze_text(
        &self,
        text: &str,
        control: &Control,
        context: &AnalysisContext,
    ) -> Result<AnalysisResponse, AnalysisError>;

    /// Judge image evidence against a control's requirement.
    async fn analyze_image(
        &self,
        data: &[u8],
        media_type: &str,
        control: &Control,
        context: &AnalysisContext,
    ) -> Result<AnalysisResponse, AnalysisError>;
}

/// Configuration for the Ollama engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub ollama_url: String,
    pub model_name: String,
    pub temperature: f32,
    pub timeout_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ollama_url: "http://localhost:11434".to_string(),
            model_name: "llama3.2:latest".to_string(),
            temperature: 0.1,
            timeout_seconds: 300,
        }
    }
}

/// Message in an Ollama chat request.
#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
}

/// Ollama chat API request.
#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    format: String,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

/// Ollama chat API response.
#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: ResponseMessage,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

/// Analysis engine backed by a local or remote Ollama server.
pub struct OllamaEngine {
    config: EngineConfig,
    http_client: reqwest::Client,
}

impl OllamaEngine {
    pub fn new(config: EngineConfig) -> Result<Self, AnalysisError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| AnalysisError::Request(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            config,
            http_client,
        })
    }

    async fn chat(
        &self,
        prompt: String,
        images: Vec<String>,
    ) -> Result<AnalysisResponse, AnalysisError> {
        let url = format!("{}/api/chat", self.config.ollama_url);

        let request = OllamaChatRequest {
            model: self.config.model_name.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                    images: Vec::new(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt,
                    images,
                },
            ],
            stream: false,
            format: "json".to_string(),
            options: OllamaOptions {
                temperature: self.config.temperature,
            },
        };

        let response = self
            .http_client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AnalysisError::Request(format!(
                        "request timed out after {}s",
                        self.config.timeout_seconds
                    ))
                } else if e.is_connect() {
                    AnalysisError::Request(format!(
                        "cannot connect to Ollama at {}",
                        self.config.ollama_url
                    ))
                } else {
                    AnalysisError::Request(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let body = response.text().await.unwrap_or_default();
            return Err(AnalysisError::RateLimited(if body.is_empty() {
                status.to_string()
            } else {
                body
            }));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AnalysisError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let chat_response: OllamaChatResponse = response
            .json()
            .await
            .map_err(|e| AnalysisError::Parse(e.to_string()))?;

        let usage = TokenUsage {
            prompt_tokens: chat_response.prompt_eval_count,
            completion_tokens: chat_response.eval_count,
        };
        debug!("Model used {} tokens", usage.total());

        parse_verdict(&chat_response.message.content, usage)
    }
}

#[async_trait]
impl AnalysisEngine for OllamaEngine {
    async fn analyze_text(
        &self,
        text: &str,
        control: &Control,
        context: &AnalysisContext,
    ) -> Result<AnalysisResponse, AnalysisError> {
        let mut prompt = requirement_section(control, context);
        prompt.push_str("=== EVIDENCE ===\n");
        prompt.push_str(text);
        prompt.push_str("\n=== END OF EVIDENCE ===\n\n");
        prompt.push_str(RESPONSE_INSTRUCTIONS);

        self.chat(prompt, Vec::new()).await
    }

    async fn analyze_image(
        &self,
        data: &[u8],
        media_type: &str,
        control: &Control,
        context: &AnalysisContext,
    ) -> Result<AnalysisResponse, AnalysisError> {
        let mut prompt = requirement_section(control, context);
        prompt.push_str(&format!("The evidence is the attached image ({}).\n\n", media_type));
        prompt.push_str(RESPONSE_INSTRUCTIONS);

        let encoded = base64::engine::general_purpose::STANDARD.encode(data);
        self.chat(prompt, vec![encoded]).await
    }
}

fn requirement_section(control: &Control, context: &AnalysisContext) -> String {
    let mut section = String::new();
    section.push_str(&format!("Control {}: {}\n", control.number, control.title));
    if let Some(ref group) = context.group_title {
        section.push_str(&format!("Control group: {}\n", group));
    }
    if !control.requirement.is_empty() {
        section.push_str(&format!("Requirement: {}\n", control.requirement));
    }
    section.push_str(&format!("Evidence document: {}\n\n", context.evidence_name));
    section
}

/// Parse the model's JSON verdict.
///
/// Scores are clamped to 0-100; a missing status falls back to `partial`.
pub fn parse_verdict(content: &str, usage: TokenUsage) -> Result<AnalysisResponse, AnalysisError> {
    let json: Value = serde_json::from_str(content.trim())
        .or_else(|_| extract_json_object(content))
        .map_err(|e| AnalysisError::Parse(e.to_string()))?;

    let score = |key: &str| -> f64 {
        json[key]
            .as_f64()
            .or_else(|| json[key].as_str().and_then(|s| s.trim().parse().ok()))
            .unwrap_or(0.0)
            .clamp(0.0, 100.0)
    };

    let status = json["status"]
        .as_str()
        .map(ComplianceStatus::from_label)
        .unwrap_or(ComplianceStatus::Partial);

    Ok(AnalysisResponse {
        status,
        compliance_score: score("compliance_score"),
        confidence_score: score("confidence_score"),
        summary: json["summary"].as_str().unwrap_or("").to_string(),
        usage,
    })
}

/// Fallback for answers that wrap the JSON object in prose.
fn extract_json_object(content: &str) -> Result<Value, serde_json::Error> {
    let start = content.find('{').unwrap_or(0);
    let end = content.rfind('}').map(|i| i + 1).unwrap_or(content.len());
    serde_json::from_str(content.get(start..end).unwrap_or(""))
}

/// System prompt for compliance analysis
const SYSTEM_PROMPT: &str = r#"You are an experienced compliance auditor.
You judge whether a piece of evidence demonstrates that a control requirement is implemented.
Only output valid JSON, no explanations or markdown."#;

const RESPONSE_INSTRUCTIONS: &str = r#"Respond with a single JSON object in this exact format:
{"status": "compliant|partial|non_compliant", "compliance_score": 0-100, "confidence_score": 0-100, "summary": "One paragraph explaining the verdict"}"#;
