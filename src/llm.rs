//! Chat-completion client shared by prompt enhancement and quality
//! evaluation. Targets any OpenAI-compatible endpoint (base URL + bearer
//! key + model name).

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f64,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: String,
}

impl ChatClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(Error::Config(
                "llm.api_key is empty — set it or disable enhancement and evaluation".into(),
            ));
        }
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    /// Run one system+user completion and return the raw reply text.
    pub async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Llm(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Llm(format!("HTTP {status}: {text}")));
        }

        let reply: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::Llm(format!("malformed response: {e}")))?;
        reply
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::Llm("empty choices in response".into()))
    }
}

/// Strip a markdown code fence the model may have wrapped its JSON in.
pub fn strip_code_fences(text: &str) -> &str {
    text.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// Parse a model reply as JSON, tolerating markdown fences.
pub fn parse_json_reply<T: DeserializeOwned>(text: &str) -> Result<T> {
    serde_json::from_str(strip_code_fences(text))
        .map_err(|e| Error::Llm(format!("unparseable JSON reply: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fences_are_stripped() {
        assert_eq!(strip_code_fences("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_code_fences("```\n{}\n```"), "{}");
        assert_eq!(strip_code_fences("  {\"a\": 1} "), "{\"a\": 1}");
    }

    #[test]
    fn fenced_reply_parses() {
        #[derive(Deserialize)]
        struct Reply {
            score: f64,
        }
        let reply: Reply = parse_json_reply("```json\n{\"score\": 8.5}\n```").unwrap();
        assert_eq!(reply.score, 8.5);
    }

    #[test]
    fn empty_api_key_is_a_config_error() {
        let config = LlmConfig::default();
        assert!(matches!(ChatClient::new(&config), Err(Error::Config(_))));
    }
}
