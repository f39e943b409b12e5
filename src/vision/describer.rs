// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Multimodal image description via an OpenAI-compatible VLM endpoint

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use super::image_utils::to_data_url;

/// Verdict returned by the description service for one image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDescription {
    pub description: String,
    /// Image is topically related to the harvest theme
    #[serde(default)]
    pub is_related: bool,
    /// Image is junk (ad, watermark wall, UI chrome) and must be discarded
    #[serde(default)]
    pub is_deleted: bool,
}

/// Image in, description out
#[async_trait]
pub trait ImageDescriber: Send + Sync {
    async fn describe(&self, image_url: &str, bytes: &[u8], theme: &str) -> Result<ImageDescription>;
}

#[derive(Debug, Error)]
pub enum DescribeError {
    #[error("VLM returned HTTP {0}")]
    HttpStatus(u16),

    #[error("VLM returned no choices")]
    EmptyResponse,

    #[error("VLM answer is not a description object: {0}")]
    Unparseable(String),
}

impl DescribeError {
    pub fn error_code(&self) -> &'static str {
        match self {
            DescribeError::HttpStatus(_) => "DESCRIBE_HTTP_STATUS",
            DescribeError::EmptyResponse => "DESCRIBE_EMPTY_RESPONSE",
            DescribeError::Unparseable(_) => "DESCRIBE_UNPARSEABLE",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VlmConfig {
    /// Base URL; `/v1/chat/completions` is appended
    pub endpoint: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl Default for VlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8081".to_string(),
            model: "qwen2-vl".to_string(),
            max_tokens: 300,
            timeout_secs: 120,
        }
    }
}

impl VlmConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            endpoint: env::var("VLM_ENDPOINT").unwrap_or(defaults.endpoint),
            model: env::var("VLM_MODEL").unwrap_or(defaults.model),
            ..defaults
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.endpoint.trim().is_empty() {
            return Err("VLM endpoint must be set".to_string());
        }
        if self.model.trim().is_empty() {
            return Err("VLM model must be set".to_string());
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: serde_json::Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

const DESCRIBE_PROMPT: &str = "You are screening images for an article about the theme below. \
Describe the image in one or two sentences. Answer with a JSON object only: \
{\"description\": string, \"is_related\": bool, \"is_deleted\": bool}. \
Set is_related when the image illustrates the theme. Set is_deleted when the image is an \
advertisement, a logo, a QR code, a screenshot of page chrome, or mostly text.";

/// [`ImageDescriber`] backed by a VLM sidecar
pub struct VlmDescriber {
    client: Client,
    endpoint: String,
    config: VlmConfig,
}

impl VlmDescriber {
    pub fn new(config: VlmConfig) -> Result<Self> {
        config.validate().map_err(anyhow::Error::msg)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let endpoint = config.endpoint.trim_end_matches('/').to_string();
        info!("VLM describer configured: endpoint={}, model={}", endpoint, config.model);

        Ok(Self {
            client,
            endpoint,
            config,
        })
    }

    pub fn model_name(&self) -> &str {
        &self.config.model
    }
}

#[async_trait]
impl ImageDescriber for VlmDescriber {
    async fn describe(&self, image_url: &str, bytes: &[u8], theme: &str) -> Result<ImageDescription> {
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: serde_json::json!([
                    {"type": "text", "text": format!("{}\n\nTheme: {}", DESCRIBE_PROMPT, theme)},
                    {"type": "image_url", "image_url": {"url": to_data_url(bytes)}}
                ]),
            }],
            max_tokens: self.config.max_tokens,
            temperature: 0.2,
        };

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.endpoint))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DescribeError::HttpStatus(status.as_u16()).into());
        }

        let chat: ChatResponse = response.json().await?;
        let answer = chat
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or(DescribeError::EmptyResponse)?;

        let parsed = parse_description(&answer)?;
        debug!(
            "Described {}: related={}, deleted={}",
            image_url, parsed.is_related, parsed.is_deleted
        );
        Ok(parsed)
    }
}

/// Pull the JSON object out of a model answer that may wrap it in prose or
/// a code fence
pub fn parse_description(answer: &str) -> Result<ImageDescription, DescribeError> {
    let start = answer.find('{');
    let end = answer.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &answer[s..=e],
        _ => return Err(DescribeError::Unparseable(truncate(answer))),
    };

    let mut description: ImageDescription =
        serde_json::from_str(json).map_err(|_| DescribeError::Unparseable(truncate(answer)))?;
    description.description = description.description.trim().to_string();
    if description.description.is_empty() {
        return Err(DescribeError::Unparseable(truncate(answer)));
    }
    Ok(description)
}

fn truncate(s: &str) -> String {
    s.chars().take(120).collect()
}
