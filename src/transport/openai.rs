use crate::providers::types::{ProviderError, ProviderRequest, ProviderResponse};
use crate::transport::ExecutionTransport;
use reqwest::blocking::Client;
use serde_json::{json, Value};
use std::time::Duration;

/// Chat-completions client. JSON-only responses; no retries.
pub struct OpenAiTransport {
    client: Client,
    base_url: String,
}

impl OpenAiTransport {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                ProviderError::upstream(format!("Could not initialize HTTP client: {e}"))
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn require_key(api_key: Option<&str>) -> Result<&str, ProviderError> {
        api_key
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ProviderError::missing_credential("OpenAI API key not configured"))
    }

    fn request_body(request: &ProviderRequest) -> Value {
        json!({
            "model": request.model,
            "messages": [
                {"role": "system", "content": request.system_prompt},
                {"role": "user", "content": request.user_prompt}
            ],
            "response_format": {"type": "json_object"},
            "temperature": request.temperature,
            "max_tokens": request.max_output_tokens
        })
    }
}

impl ExecutionTransport for OpenAiTransport {
    fn dispatch(
        &self,
        request: &ProviderRequest,
        api_key: Option<&str>,
    ) -> Result<ProviderResponse, ProviderError> {
        let key = Self::require_key(api_key)?;

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(key)
            .json(&Self::request_body(request))
            .send()
            .map_err(|e| ProviderError::upstream(format!("OpenAI API request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().unwrap_or_default();
            return Err(ProviderError::upstream(format!(
                "OpenAI API error: {} {}",
                status.as_u16(),
                error_text
            )));
        }

        let json = response
            .json::<Value>()
            .map_err(|_| ProviderError::invalid_response("Invalid response from OpenAI API"))?;

        let text = json
            .get("choices")
            .and_then(|v| v.get(0))
            .and_then(|v| v.get("message"))
            .and_then(|v| v.get("content"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProviderError::invalid_response("Invalid response from OpenAI API"))?
            .to_string();

        Ok(ProviderResponse {
            model: request.model.clone(),
            text,
            usage: json.get("usage").cloned().unwrap_or_else(|| json!({})),
        })
    }

    fn requires_api_key(&self) -> bool {
        true
    }
}
