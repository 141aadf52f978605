//! HTTP client for the vision analysis collaborator.
//!
//! Submits JPEG stills to the configured endpoint and returns the caption
//! text. Two wire formats are supported; which one is in effect is purely
//! configuration, the rest of the pipeline never sees the difference.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::{AnalysisConfig, AnalysisWireFormat};
use crate::error::{Error, Result};

const USER_AGENT: &str = concat!("camgate/", env!("CARGO_PKG_VERSION"));

/// Chat-completions request with one text part and one inline image part
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
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

/// Client for one analysis endpoint
pub struct AnalysisClient {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    prompt: String,
    format: AnalysisWireFormat,
}

impl AnalysisClient {
    pub fn new(config: &AnalysisConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Analysis(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            prompt: config.prompt.clone(),
            format: config.format,
        })
    }

    /// Submit one JPEG still and return the caption text.
    ///
    /// One shot, no retries. The worker that calls this treats any error
    /// as a logged miss; the next frame is a fresh attempt anyway.
    pub async fn submit(&self, jpeg: &[u8]) -> Result<String> {
        match self.format {
            AnalysisWireFormat::ChatCompletions => self.submit_chat(jpeg).await,
            AnalysisWireFormat::RawJpeg => self.submit_raw(jpeg).await,
        }
    }

    /// JSON chat-completions shape: the still rides inline as a base64
    /// data URI image part next to the prompt text.
    async fn submit_chat(&self, jpeg: &[u8]) -> Result<String> {
        let image_url = format!("data:image/jpeg;base64,{}", BASE64.encode(jpeg));
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: vec![
                    ContentPart::Text { text: &self.prompt },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl { url: image_url },
                    },
                ],
            }],
            max_tokens: 300,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header("User-Agent", USER_AGENT)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Analysis(format!("Analysis request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Analysis(format!("Failed to read analysis response: {}", e)))?;

        if !status.is_success() {
            return Err(Error::Analysis(format!(
                "Analysis endpoint returned {}: {}",
                status,
                truncate(&body, 200)
            )));
        }

        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| Error::Analysis(format!("Malformed analysis response: {}", e)))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::Analysis("Analysis response contained no choices".to_string()))
    }

    /// Raw binary shape: the JPEG is the request body, the prompt travels
    /// in a header, and the response body is the caption verbatim.
    async fn submit_raw(&self, jpeg: &[u8]) -> Result<String> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header("User-Agent", USER_AGENT)
            .header("Content-Type", "image/jpeg")
            .header("X-Analysis-Prompt", &self.prompt)
            .body(jpeg.to_vec())
            .send()
            .await
            .map_err(|e| Error::Analysis(format!("Analysis request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Analysis(format!("Failed to read analysis response: {}", e)))?;

        if !status.is_success() {
            return Err(Error::Analysis(format!(
                "Analysis endpoint returned {}: {}",
                status,
                truncate(&body, 200)
            )));
        }

        Ok(body.trim().to_string())
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
