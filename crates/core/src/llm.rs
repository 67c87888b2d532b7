use crate::config::LlmConfig;
use crate::traits::CompletionModel;
use crate::SearchError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Client for any OpenAI-compatible `/chat/completions` endpoint.
pub struct ChatCompletionClient {
    endpoint: Url,
    model: String,
    api_key: Option<String>,
    client: Client,
}

impl ChatCompletionClient {
    pub fn new(endpoint: &str, model: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self, SearchError> {
        let base = Url::parse(endpoint)?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(SearchError::LlmUnavailable(format!(
                "unsupported endpoint scheme `{}`",
                base.scheme()
            )));
        }
        let endpoint = if base.path().trim_end_matches('/').ends_with("/chat/completions") {
            base
        } else {
            let path = format!("{}/chat/completions", base.path().trim_end_matches('/'));
            let mut joined = base;
            joined.set_path(&path);
            joined
        };
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint,
            model: model.into(),
            api_key,
            client,
        })
    }

    /// Reads the API key from the environment variable named in the config, if any.
    pub fn from_config(config: &LlmConfig) -> Result<Self, SearchError> {
        let api_key = match &config.api_key_env {
            Some(variable) => Some(std::env::var(variable).map_err(|_| {
                SearchError::LlmUnavailable(format!("environment variable {variable} is not set"))
            })?),
            None => None,
        };
        Self::new(
            &config.endpoint,
            config.model.clone(),
            api_key,
            Duration::from_secs(config.timeout_s),
        )
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl CompletionModel for ChatCompletionClient {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, system: &str, prompt: &str) -> Result<String, SearchError> {
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": prompt },
            ],
            "temperature": 0.7,
        });

        let mut request = self.client.post(self.endpoint.clone()).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(SearchError::BackendResponse {
                backend: self.model.clone(),
                details: response.status().to_string(),
            });
        }

        let payload: Value = response.json().await?;
        let content = extract_content(&payload).ok_or_else(|| SearchError::BackendResponse {
            backend: self.model.clone(),
            details: "response has no choices[0].message.content".to_string(),
        })?;
        debug!(model = %self.model, chars = content.chars().count(), "completion received");
        Ok(content)
    }
}

fn extract_content(payload: &Value) -> Option<String> {
    payload
        .get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_gains_completions_path_once() -> Result<(), SearchError> {
        let timeout = Duration::from_secs(5);
        let client = ChatCompletionClient::new("http://localhost:8000/v1", "m", None, timeout)?;
        assert_eq!(client.endpoint().as_str(), "http://localhost:8000/v1/chat/completions");

        let client = ChatCompletionClient::new("http://localhost:8000/v1/chat/completions", "m", None, timeout)?;
        assert_eq!(client.endpoint().as_str(), "http://localhost:8000/v1/chat/completions");
        Ok(())
    }

    #[test]
    fn non_http_endpoints_are_rejected() {
        let result = ChatCompletionClient::new("ftp://example.com", "m", None, Duration::from_secs(1));
        assert!(matches!(result, Err(SearchError::LlmUnavailable(_))));
        assert!(ChatCompletionClient::new("not a url", "m", None, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn content_is_read_from_first_choice() {
        let payload = json!({ "choices": [ { "message": { "role": "assistant", "content": "hi" } } ] });
        assert_eq!(extract_content(&payload).as_deref(), Some("hi"));
        assert_eq!(extract_content(&json!({ "choices": [] })), None);
    }
}
