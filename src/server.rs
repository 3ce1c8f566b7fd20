use crate::artifacts::{self, ArtifactError};
use crate::config::{AppConfig, ConfigError};
use crate::db::open_connection;
use crate::providers::{ProviderError, ProviderRuntime};
use crate::redact::sanitize_log_message;
use crate::render::render_html;
use crate::runner::{PipelineOutcome, RunnerEngine};
use crate::runs::{RunStore, StoreError};
use crate::schema::RoofAnalysis;
use crate::stages::invoker::{self, ANALYSIS_FUNCTION, REPORT_FUNCTION};
use crate::stages::{
    fetch_imagery, generate_report, process_analysis, StageContext, StageError, StageOutcome,
};
use serde_json::{json, Value};
use std::io::Read;
use std::sync::Arc;
use std::thread;
use thiserror::Error;
use tiny_http::{Header, Request, Response, Server, StatusCode};
use url::Url;

const MAX_BODY_BYTES: u64 = 1024 * 1024;
const IMAGERY_FUNCTION: &str = "fetch-satellite-imagery";
const PIPELINE_FUNCTION: &str = "run-full-pipeline";

const CORS_HEADERS: [(&str, &str); 3] = [
    ("Access-Control-Allow-Origin", "*"),
    (
        "Access-Control-Allow-Headers",
        "authorization, x-client-info, apikey, content-type",
    ),
    ("Access-Control-Allow-Methods", "GET, POST, OPTIONS"),
];

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("provider setup failed: {0}")]
    Provider(#[from] ProviderError),
    #[error("artifact store setup failed: {0}")]
    Artifacts(#[from] ArtifactError),
    #[error("run store setup failed: {0}")]
    Store(#[from] StoreError),
    #[error("stage setup failed: {0}")]
    Stage(#[from] StageError),
    #[error("could not bind {addr}: {message}")]
    Bind { addr: String, message: String },
}

pub struct AppState {
    engine: RunnerEngine,
    history_limit: usize,
    service_key: Option<String>,
}

impl AppState {
    pub fn new(engine: RunnerEngine, history_limit: usize) -> Self {
        Self {
            engine,
            history_limit,
            service_key: None,
        }
    }

    /// Requires `Authorization: Bearer <key>` on the stage endpoints.
    pub fn with_service_key(mut self, service_key: Option<String>) -> Self {
        self.service_key = service_key;
        self
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, ServerError> {
        // Creates the database file and schema before the first request.
        open_connection(&config.db_path)?;
        let providers = ProviderRuntime::from_config(&config.inference)?;
        let artifacts = artifacts::from_config(&config.artifacts)?;
        let ctx = Arc::new(StageContext::new(config.db_path.clone(), providers, artifacts));
        let invoker = invoker::from_config(&config.stages, ctx.clone())?;
        Ok(Self::new(RunnerEngine::new(ctx, invoker), config.history_limit)
            .with_service_key(config.service_key.clone()))
    }

    fn ctx(&self) -> &StageContext {
        self.engine.context()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpReply {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl HttpReply {
    fn json(status: u16, value: Value) -> Self {
        Self {
            status,
            content_type: "application/json".to_string(),
            body: value.to_string().into_bytes(),
        }
    }

    fn ok(value: Value) -> Self {
        Self::json(200, value)
    }

    fn error(status: u16, message: impl Into<String>) -> Self {
        Self::json(
            status,
            json!({ "success": false, "error": sanitize_log_message(&message.into()) }),
        )
    }

    fn empty() -> Self {
        Self {
            status: 200,
            content_type: "text/plain".to_string(),
            body: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn json_body(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

/// Serves until the listener fails. Each request gets its own thread.
pub fn serve(state: Arc<AppState>, bind_addr: &str) -> Result<(), ServerError> {
    let server = Server::http(bind_addr).map_err(|e| ServerError::Bind {
        addr: bind_addr.to_string(),
        message: e.to_string(),
    })?;
    tracing::info!(addr = bind_addr, "listening");

    for request in server.incoming_requests() {
        let state = state.clone();
        let spawned = thread::Builder::new()
            .name("http-request".to_string())
            .spawn(move || handle(&state, request));
        if let Err(e) = spawned {
            tracing::error!(error = %e, "could not spawn request thread");
        }
    }
    Ok(())
}

fn handle(state: &AppState, mut request: Request) {
    let method = request.method().to_string();
    let url = request.url().to_string();
    let authorization = request
        .headers()
        .iter()
        .find(|h| h.field.equiv("Authorization"))
        .map(|h| h.value.as_str().to_string());
    let mut body = Vec::new();
    let reply = match request
        .as_reader()
        .take(MAX_BODY_BYTES)
        .read_to_end(&mut body)
    {
        Ok(_) => route(state, &method, &url, &body, authorization.as_deref()),
        Err(e) => HttpReply::error(400, format!("Could not read request body: {e}")),
    };
    tracing::debug!(method = %method, url = %url, status = reply.status, "request handled");

    let mut response = Response::from_data(reply.body).with_status_code(StatusCode(reply.status));
    let headers = CORS_HEADERS
        .iter()
        .map(|(k, v)| (*k, *v))
        .chain(std::iter::once(("Content-Type", reply.content_type.as_str())));
    for (name, value) in headers {
        if let Ok(header) = Header::from_bytes(name.as_bytes(), value.as_bytes()) {
            response.add_header(header);
        }
    }
    if let Err(e) = request.respond(response) {
        tracing::warn!(error = %e, "failed to write response");
    }
}

/// Dispatches one request. Pure over the store, so tests call it directly.
pub fn route(
    state: &AppState,
    method: &str,
    raw_url: &str,
    body: &[u8],
    authorization: Option<&str>,
) -> HttpReply {
    if method == "OPTIONS" {
        return HttpReply::empty();
    }
    let Ok(url) = Url::parse(&format!("http://localhost{raw_url}")) else {
        return HttpReply::error(400, "Malformed request URL");
    };
    let segments: Vec<&str> = url
        .path()
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    match (method, segments.as_slice()) {
        ("GET", ["health"]) => HttpReply::ok(json!({ "status": "ok" })),
        ("POST", ["functions", name]) => {
            if !bearer_matches(state.service_key.as_deref(), authorization) {
                return HttpReply::error(401, "Unauthorized");
            }
            function_call(state, name, body)
        }
        ("POST", ["runs"]) => create_run(state, body),
        ("GET", ["runs"]) => list_runs(state, &url),
        ("GET", ["runs", id]) => get_run(state, id),
        ("POST", ["runs", id, "cancel"]) => cancel_run(state, id),
        ("POST", ["runs", id, "retry"]) => retry_run(state, id),
        ("GET", ["runs", id, "events"]) => run_events(state, id),
        ("GET", ["runs", id, "report.html"]) => run_report_html(state, id),
        ("GET", ["reports", name]) => stored_report(state, name),
        _ => HttpReply::error(404, "Not found"),
    }
}

/// Open when no service key is configured.
fn bearer_matches(service_key: Option<&str>, authorization: Option<&str>) -> bool {
    match service_key {
        None => true,
        Some(key) => authorization
            .and_then(|value| value.strip_prefix("Bearer "))
            .is_some_and(|token| token.trim() == key),
    }
}

fn parse_body(body: &[u8]) -> Result<Value, HttpReply> {
    serde_json::from_slice::<Value>(body)
        .ok()
        .filter(Value::is_object)
        .ok_or_else(|| HttpReply::error(400, "Request body must be a JSON object"))
}

fn required_str(body: &Value, field: &str) -> Result<String, HttpReply> {
    body.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| HttpReply::error(400, format!("Missing required field: {field}")))
}

/// Stage hosts, behind the bearer check in `route`. Any failure is a 500;
/// cancellation is a 200 with `cancelled`.
fn function_call(state: &AppState, name: &str, body: &[u8]) -> HttpReply {
    let parsed = match parse_body(body).and_then(|b| required_str(&b, "runId").map(|id| (b, id))) {
        Ok(parsed) => parsed,
        Err(reply) => return reply,
    };
    let (body, run_id) = parsed;
    let ctx = state.ctx();

    let result: Result<Value, StageError> = match name {
        IMAGERY_FUNCTION => match required_str(&body, "address") {
            Ok(address) => fetch_imagery(ctx, &run_id, &address).map(|run| {
                json!({ "success": true, "data": run.imagery })
            }),
            Err(reply) => return reply,
        },
        ANALYSIS_FUNCTION => process_analysis(ctx, &run_id).map(|outcome| match outcome {
            StageOutcome::Completed(run) => json!({
                "success": true,
                "data": {
                    "analysis": run.analysis,
                    "metadata": {
                        "token_usage": run.metadata.as_ref().and_then(|m| m.get("token_usage")).cloned().unwrap_or_else(|| json!({}))
                    }
                }
            }),
            StageOutcome::Cancelled => json!({ "success": false, "cancelled": true }),
        }),
        REPORT_FUNCTION => generate_report(ctx, &run_id).map(|outcome| match outcome {
            StageOutcome::Completed(run) => json!({
                "success": true,
                "url": run.pdf_url,
                "fileName": crate::stages::report::text_artifact_name(&run_id),
            }),
            StageOutcome::Cancelled => json!({ "success": false, "cancelled": true }),
        }),
        PIPELINE_FUNCTION => state
            .engine
            .run_full_pipeline(&run_id)
            .map(|outcome| match outcome {
                PipelineOutcome::Completed { pdf_url } => json!({
                    "success": true,
                    "runId": run_id,
                    "pdfUrl": pdf_url,
                }),
                PipelineOutcome::Cancelled => json!({ "success": false, "cancelled": true }),
            }),
        _ => return HttpReply::error(404, format!("Unknown function: {name}")),
    };

    match result {
        Ok(value) => HttpReply::ok(value),
        Err(error) => HttpReply::error(500, error.to_string()),
    }
}

fn stage_error_reply(error: StageError) -> HttpReply {
    let status = match &error {
        StageError::RunNotFound(_) => 404,
        StageError::InvalidInput(_) => 400,
        _ => 500,
    };
    HttpReply::error(status, error.to_string())
}

fn store_error_reply(error: StoreError) -> HttpReply {
    let status = match &error {
        StoreError::RunNotFound(_) => 404,
        StoreError::Terminal { .. } => 409,
        StoreError::InvalidInput(_) => 400,
        _ => 500,
    };
    HttpReply::error(status, error.to_string())
}

fn create_run(state: &AppState, body: &[u8]) -> HttpReply {
    let address = match parse_body(body).and_then(|b| required_str(&b, "address")) {
        Ok(address) => address,
        Err(reply) => return reply,
    };
    match state.engine.start(&address) {
        Ok(run) => HttpReply::ok(json!({ "success": true, "run": run })),
        Err(error) => stage_error_reply(error),
    }
}

fn list_runs(state: &AppState, url: &Url) -> HttpReply {
    let limit = match url.query_pairs().find(|(k, _)| k == "limit") {
        Some((_, raw)) => match raw.parse::<usize>() {
            Ok(limit) => limit,
            Err(_) => return HttpReply::error(400, "limit must be a positive integer"),
        },
        None => state.history_limit,
    };
    let listed = state
        .ctx()
        .connection()
        .map_err(stage_error_reply)
        .and_then(|conn| RunStore::list(&conn, Some(limit)).map_err(store_error_reply));
    match listed {
        Ok(runs) => HttpReply::ok(json!({ "success": true, "runs": runs })),
        Err(reply) => reply,
    }
}

fn get_run(state: &AppState, id: &str) -> HttpReply {
    let found = state
        .ctx()
        .connection()
        .map_err(stage_error_reply)
        .and_then(|conn| RunStore::get(&conn, id).map_err(store_error_reply));
    match found {
        Ok(run) => HttpReply::ok(json!({ "success": true, "run": run })),
        Err(reply) => reply,
    }
}

fn cancel_run(state: &AppState, id: &str) -> HttpReply {
    match state.engine.request_cancel(id) {
        Ok(run) => {
            tracing::info!(run_id = id, "cancellation requested");
            HttpReply::ok(json!({ "success": true, "run": run }))
        }
        Err(error) => store_error_reply(error),
    }
}

fn retry_run(state: &AppState, id: &str) -> HttpReply {
    match state.engine.retry(id) {
        Ok(run) => HttpReply::ok(json!({ "success": true, "run": run })),
        Err(StageError::InvalidInput(message)) => HttpReply::error(409, message),
        Err(error) => stage_error_reply(error),
    }
}

fn run_events(state: &AppState, id: &str) -> HttpReply {
    let events = state
        .ctx()
        .connection()
        .map_err(stage_error_reply)
        .and_then(|conn| {
            if !RunStore::exists(&conn, id).map_err(store_error_reply)? {
                return Err(HttpReply::error(404, format!("Run not found: {id}")));
            }
            RunStore::events(&conn, id).map_err(store_error_reply)
        });
    match events {
        Ok(events) => HttpReply::ok(json!({ "success": true, "events": events })),
        Err(reply) => reply,
    }
}

fn run_report_html(state: &AppState, id: &str) -> HttpReply {
    let run = match state
        .ctx()
        .connection()
        .map_err(stage_error_reply)
        .and_then(|conn| RunStore::get(&conn, id).map_err(store_error_reply))
    {
        Ok(run) => run,
        Err(reply) => return reply,
    };
    let Some(analysis) = run.analysis.as_ref() else {
        return HttpReply::error(404, "No analysis data found for this run");
    };
    match RoofAnalysis::from_value(analysis) {
        Ok(typed) => HttpReply {
            status: 200,
            content_type: "text/html; charset=utf-8".to_string(),
            body: render_html(&typed, &run.address).into_bytes(),
        },
        Err(error) => HttpReply::error(500, error.to_string()),
    }
}

fn stored_report(state: &AppState, name: &str) -> HttpReply {
    match state.ctx().artifacts().get(name) {
        Ok(Some(stored)) => HttpReply {
            status: 200,
            content_type: stored.content_type,
            body: stored.bytes,
        },
        Ok(None) => HttpReply::error(404, format!("Report not found: {name}")),
        Err(ArtifactError::InvalidName(_)) => HttpReply::error(400, "Invalid report name"),
        Err(error) => HttpReply::error(500, error.to_string()),
    }
}
