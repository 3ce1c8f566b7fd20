use crate::config::{InferenceConfig, InferenceMode};
use crate::providers::types::{ProviderError, ProviderRequest, ProviderResponse};
use crate::transport::{ExecutionTransport, MockTransport, OpenAiTransport};
use std::sync::Arc;

/// Inference entry point handed to the analysis stage at construction time.
pub struct ProviderRuntime {
    transport: Arc<dyn ExecutionTransport>,
    api_key: Option<String>,
    model: String,
}

impl ProviderRuntime {
    pub fn new(
        transport: Arc<dyn ExecutionTransport>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            model: model.into(),
        }
    }

    pub fn from_config(config: &InferenceConfig) -> Result<Self, ProviderError> {
        let transport: Arc<dyn ExecutionTransport> = match config.mode {
            InferenceMode::OpenAi => Arc::new(OpenAiTransport::new(
                config.base_url.clone(),
                config.timeout,
            )?),
            InferenceMode::Mock => Arc::new(MockTransport::new()),
        };
        Ok(Self::new(transport, config.api_key.clone(), config.model.clone()))
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dispatch(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let key = match self.transport.requires_api_key() {
            true => self.api_key.as_deref(),
            false => None,
        };
        self.transport.dispatch(request, key)
    }
}

#[cfg(test)]
mod tests {
    use super::ProviderRuntime;
    use crate::providers::types::{ProviderErrorKind, ProviderRequest};
    use crate::transport::{MockTransport, OpenAiTransport};
    use std::sync::Arc;
    use std::time::Duration;

    fn request() -> ProviderRequest {
        ProviderRequest {
            model: "gpt-4o-mini".to_string(),
            system_prompt: "system".to_string(),
            user_prompt: "user".to_string(),
            temperature: 0.2,
            max_output_tokens: 100,
            correlation_id: None,
        }
    }

    #[test]
    fn blank_key_counts_as_missing() {
        let transport = OpenAiTransport::new("http://127.0.0.1:9".to_string(), Duration::from_secs(1))
            .expect("transport");
        let runtime = ProviderRuntime::new(Arc::new(transport), Some("   ".to_string()), "gpt-4o-mini");
        let err = runtime.dispatch(&request()).expect_err("missing key");
        assert_eq!(err.kind, ProviderErrorKind::MissingCredential);
        assert_eq!(err.message, "OpenAI API key not configured");
    }

    #[test]
    fn mock_transport_needs_no_key() {
        let runtime = ProviderRuntime::new(Arc::new(MockTransport::new()), None, "mock-model");
        let response = runtime.dispatch(&request()).expect("mock reply");
        assert!(response.text.contains("cost_breakdown"));
        assert_eq!(runtime.model(), "mock-model");
    }
}
