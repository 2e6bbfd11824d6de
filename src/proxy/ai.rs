//! AI reply proxy.
//!
//! The engine talks to the assistant through the `AiResponder` trait so
//! tests can substitute a canned responder. The HTTP implementation calls
//! a generative-language endpoint and cleans the reply down to plain,
//! readable text before it is persisted as a chat message.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by the AI proxy.
#[derive(Error, Debug)]
pub enum AiError {
    #[error("AI service is not configured")]
    NotConfigured,

    #[error("AI request failed: {0}")]
    Request(String),

    #[error("unexpected AI response shape: {0}")]
    BadResponse(String),
}

impl From<reqwest::Error> for AiError {
    fn from(err: reqwest::Error) -> Self {
        AiError::Request(err.to_string())
    }
}

/// Something that can answer a chat prompt.
#[async_trait]
pub trait AiResponder: Send + Sync {
    async fn reply(&self, prompt: &str) -> Result<String, AiError>;
}

/// Configuration for the HTTP AI client.
#[derive(Debug, Clone)]
pub struct AiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

impl AiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: "gemini-1.5-flash".to_string(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
        }
    }

    /// Read configuration from `AI_API_KEY`, `AI_MODEL`, `AI_API_URL`.
    pub fn from_env() -> Result<Self, AiError> {
        let api_key = std::env::var("AI_API_KEY").map_err(|_| AiError::NotConfigured)?;
        let mut config = Self::new(api_key);
        if let Ok(model) = std::env::var("AI_MODEL") {
            config.model = model;
        }
        if let Ok(url) = std::env::var("AI_API_URL") {
            config.base_url = url;
        }
        Ok(config)
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

/// HTTP implementation of `AiResponder`.
pub struct HttpAiClient {
    http: reqwest::Client,
    config: Option<AiConfig>,
}

impl HttpAiClient {
    pub fn new(config: AiConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config: Some(config),
        }
    }

    /// A client that fails fast with `NotConfigured` on every call.
    pub fn unconfigured() -> Self {
        Self {
            http: reqwest::Client::new(),
            config: None,
        }
    }

    /// Build from environment, falling back to unconfigured.
    pub fn from_env() -> Self {
        match AiConfig::from_env() {
            Ok(config) => Self::new(config),
            Err(_) => Self::unconfigured(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_some()
    }
}

#[async_trait]
impl AiResponder for HttpAiClient {
    async fn reply(&self, prompt: &str) -> Result<String, AiError> {
        let config = self.config.as_ref().ok_or(AiError::NotConfigured)?;

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            config.base_url, config.model, config.api_key
        );

        let body = json!({
            "contents": [{
                "parts": [{
                    "text": format!(
                        "Respond to this prompt clearly, with proper spacing, \
                         readable text, and well-formatted code if needed:\n\n{}",
                        prompt
                    )
                }]
            }]
        });

        let response = self.http.post(&url).json(&body).send().await?;

        if !response.status().is_success() {
            return Err(AiError::Request(format!(
                "upstream returned {}",
                response.status()
            )));
        }

        let parsed: GenerateResponse = response.json().await?;
        let candidate = parsed
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| AiError::BadResponse("no candidates".to_string()))?;

        let raw: String = candidate
            .content
            .parts
            .into_iter()
            .map(|p| p.text)
            .collect::<Vec<_>>()
            .join("");

        if raw.is_empty() {
            return Err(AiError::BadResponse("empty reply".to_string()));
        }

        Ok(clean_reply(&raw))
    }
}

/// Strip markdown decoration from a model reply: fenced-code markers,
/// bold markers, and runs of blank lines.
pub fn clean_reply(raw: &str) -> String {
    let mut text = String::with_capacity(raw.len());
    for line in raw.lines() {
        if line.trim_start().starts_with("```") {
            continue;
        }
        text.push_str(line);
        text.push('\n');
    }

    let mut text = text.replace("**", "");
    while text.contains("\n\n\n") {
        text = text.replace("\n\n\n", "\n\n");
    }
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_reply_strips_fences_and_bold() {
        let raw = "Here is **the answer**:\n```js\nconsole.log(1)\n```\ndone";
        assert_eq!(clean_reply(raw), "Here is the answer:\nconsole.log(1)\ndone");
    }

    #[test]
    fn test_clean_reply_collapses_blank_runs() {
        let raw = "a\n\n\n\n\nb";
        assert_eq!(clean_reply(raw), "a\n\nb");
    }

    #[test]
    fn test_clean_reply_trims() {
        assert_eq!(clean_reply("\n\n  hi  \n\n"), "hi");
    }

    #[tokio::test]
    async fn test_unconfigured_client_fails_fast() {
        let client = HttpAiClient::unconfigured();
        assert!(!client.is_configured());
        assert!(matches!(
            client.reply("hello").await,
            Err(AiError::NotConfigured)
        ));
    }

    #[test]
    fn test_config_defaults() {
        let config = AiConfig::new("key");
        assert_eq!(config.model, "gemini-1.5-flash");
        assert!(config.base_url.starts_with("https://"));
    }
}
