use super::{generate_report, process_analysis, StageContext, StageError, StageOutcome};
use crate::config::StageTransportConfig;
use reqwest::blocking::Client;
use serde_json::{json, Value};
use std::sync::Arc;

pub const ANALYSIS_FUNCTION: &str = "process-openai-analysis";
pub const REPORT_FUNCTION: &str = "generate-pdf-report";

#[derive(Debug, Clone, PartialEq)]
pub enum StageReply {
    Completed(Value),
    Cancelled,
}

/// How the orchestrator reaches the Analysis and Report stages.
pub trait StageInvoker: Send + Sync {
    fn invoke_analysis(&self, run_id: &str) -> Result<StageReply, StageError>;
    fn invoke_report(&self, run_id: &str) -> Result<StageReply, StageError>;
}

pub fn from_config(config: &StageTransportConfig, ctx: Arc<StageContext>) -> Result<Arc<dyn StageInvoker>, StageError> {
    match config {
        StageTransportConfig::InProcess => Ok(Arc::new(InProcessStages::new(ctx))),
        StageTransportConfig::Http {
            base_url,
            service_key,
        } => Ok(Arc::new(HttpStages::new(base_url.clone(), service_key.clone())?)),
    }
}

pub struct InProcessStages {
    ctx: Arc<StageContext>,
}

impl InProcessStages {
    pub fn new(ctx: Arc<StageContext>) -> Self {
        Self { ctx }
    }
}

fn to_reply(outcome: StageOutcome<crate::runs::AnalysisRun>) -> Result<StageReply, StageError> {
    match outcome {
        StageOutcome::Completed(run) => Ok(StageReply::Completed(
            serde_json::to_value(run).map_err(|e| StageError::Store(e.to_string()))?,
        )),
        StageOutcome::Cancelled => Ok(StageReply::Cancelled),
    }
}

impl StageInvoker for InProcessStages {
    fn invoke_analysis(&self, run_id: &str) -> Result<StageReply, StageError> {
        to_reply(process_analysis(&self.ctx, run_id)?)
    }

    fn invoke_report(&self, run_id: &str) -> Result<StageReply, StageError> {
        to_reply(generate_report(&self.ctx, run_id)?)
    }
}

/// Calls stages hosted behind `/functions/<name>`. No timeout beyond the
/// client default and no retries.
pub struct HttpStages {
    client: Client,
    base_url: String,
    service_key: Option<String>,
}

impl HttpStages {
    pub fn new(base_url: String, service_key: Option<String>) -> Result<Self, StageError> {
        let client = Client::builder()
            .build()
            .map_err(|e| StageError::Configuration(format!("Could not initialize HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
        })
    }

    fn call(&self, name: &str, run_id: &str) -> Result<StageReply, StageError> {
        let mut request = self
            .client
            .post(format!("{}/functions/{}", self.base_url, name))
            .json(&json!({ "runId": run_id }));
        if let Some(key) = self.service_key.as_deref() {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .map_err(|e| StageError::Upstream(format!("{name} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().unwrap_or_default();
            return Err(StageError::Upstream(format!(
                "{name} failed: {} {error_text}",
                status.as_u16()
            )));
        }

        let body = response
            .json::<Value>()
            .map_err(|e| StageError::Contract(format!("{name} returned an unreadable reply: {e}")))?;
        let success = body.get("success").and_then(Value::as_bool).unwrap_or(false);
        let cancelled = body.get("cancelled").and_then(Value::as_bool).unwrap_or(false);
        match (success, cancelled) {
            (true, _) => Ok(StageReply::Completed(body)),
            (false, true) => Ok(StageReply::Cancelled),
            (false, false) => Err(StageError::Upstream(
                body.get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown stage error")
                    .to_string(),
            )),
        }
    }
}

impl StageInvoker for HttpStages {
    fn invoke_analysis(&self, run_id: &str) -> Result<StageReply, StageError> {
        self.call(ANALYSIS_FUNCTION, run_id)
    }

    fn invoke_report(&self, run_id: &str) -> Result<StageReply, StageError> {
        self.call(REPORT_FUNCTION, run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::{HttpStages, StageInvoker, StageReply};
    use crate::stages::StageError;
    use crate::test_support::spawn_http_server;
    use serde_json::Value;

    #[test]
    fn posts_run_id_with_service_key() {
        let (base_url, requests, server) =
            spawn_http_server(vec![(200, "{\"success\":true,\"data\":{}}".to_string())]);
        let stages = HttpStages::new(base_url, Some("svc".to_string())).expect("stages");

        let reply = stages.invoke_analysis("run_42").expect("analysis");
        server.join().expect("server thread");
        assert!(matches!(reply, StageReply::Completed(_)));

        let captured = requests.recv().expect("captured");
        assert_eq!(captured.path, "/functions/process-openai-analysis");
        assert_eq!(captured.header("authorization").as_deref(), Some("Bearer svc"));
        let body: Value = serde_json::from_str(&captured.body).expect("json");
        assert_eq!(body["runId"], "run_42");
    }

    #[test]
    fn cancelled_reply_is_not_an_error() {
        let (base_url, _requests, server) =
            spawn_http_server(vec![(200, "{\"success\":false,\"cancelled\":true}".to_string())]);
        let stages = HttpStages::new(base_url, None).expect("stages");
        let reply = stages.invoke_report("run_42").expect("report");
        server.join().expect("server thread");
        assert_eq!(reply, StageReply::Cancelled);
    }

    #[test]
    fn server_error_carries_function_name_status_and_body() {
        let (base_url, _requests, server) = spawn_http_server(vec![(
            500,
            "{\"success\":false,\"error\":\"boom\"}".to_string(),
        )]);
        let stages = HttpStages::new(base_url, None).expect("stages");
        let err = stages.invoke_report("run_42").expect_err("500");
        server.join().expect("server thread");
        let StageError::Upstream(message) = err else {
            panic!("expected upstream error");
        };
        assert_eq!(
            message,
            "generate-pdf-report failed: 500 {\"success\":false,\"error\":\"boom\"}"
        );
    }
}
