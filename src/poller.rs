use crate::db::open_connection;
use crate::redact::sanitize_log_message;
use crate::runs::{AnalysisRun, CurrentStep, RunStore, StoreError};
use reqwest::blocking::Client;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_BUDGET: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum PollError {
    #[error("Run not found: {0}")]
    NotFound(String),
    #[error("run source error: {0}")]
    Source(String),
}

impl From<StoreError> for PollError {
    fn from(value: StoreError) -> Self {
        Self::Source(value.to_string())
    }
}

/// Progress bucket shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiPhase {
    Imagery,
    Analysis,
    Calculate,
    Report,
}

impl UiPhase {
    /// Terminal failure steps map to no phase; the display keeps its last phase.
    pub fn from_step(step: CurrentStep) -> Option<Self> {
        match step {
            CurrentStep::Initializing | CurrentStep::Imagery | CurrentStep::ImageryComplete => {
                Some(Self::Imagery)
            }
            CurrentStep::AiAnalysis => Some(Self::Analysis),
            CurrentStep::AnalysisComplete => Some(Self::Calculate),
            CurrentStep::GeneratingPdf | CurrentStep::PdfComplete | CurrentStep::Completed => {
                Some(Self::Report)
            }
            CurrentStep::Cancelled | CurrentStep::Failed => None,
        }
    }

    pub fn progress(&self) -> u8 {
        match self {
            Self::Imagery => 25,
            Self::Analysis => 50,
            Self::Calculate => 75,
            Self::Report => 100,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Imagery => "imagery",
            Self::Analysis => "analysis",
            Self::Calculate => "calculate",
            Self::Report => "report",
        }
    }
}

pub trait RunSource {
    fn fetch(&self, run_id: &str) -> Result<Option<AnalysisRun>, PollError>;
}

/// Reads runs straight from the SQLite file the server writes to.
pub struct SqliteRunSource {
    db_path: PathBuf,
}

impl SqliteRunSource {
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }
}

impl RunSource for SqliteRunSource {
    fn fetch(&self, run_id: &str) -> Result<Option<AnalysisRun>, PollError> {
        let connection = open_connection(&self.db_path)?;
        Ok(RunStore::find(&connection, run_id)?)
    }
}

/// Reads runs through the dashboard API.
pub struct HttpRunSource {
    client: Client,
    server_url: String,
}

impl HttpRunSource {
    pub fn new(server_url: &str) -> Result<Self, PollError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| PollError::Source(format!("Could not initialize HTTP client: {e}")))?;
        Ok(Self {
            client,
            server_url: server_url.trim_end_matches('/').to_string(),
        })
    }

    /// Creates a run via `POST /runs` and returns it as the server saw it.
    pub fn submit(&self, address: &str) -> Result<AnalysisRun, PollError> {
        let response = self
            .client
            .post(format!("{}/runs", self.server_url))
            .json(&json!({ "address": address }))
            .send()
            .map_err(|e| PollError::Source(e.to_string()))?;
        let status = response.status();
        let body: Value = response
            .json()
            .map_err(|e| PollError::Source(format!("Unreadable reply: {e}")))?;
        if !status.is_success() {
            return Err(PollError::Source(format!(
                "Failed to create analysis run: {}",
                body.get("error").and_then(Value::as_str).unwrap_or("unknown error")
            )));
        }
        parse_run(&body)
    }
}

fn parse_run(body: &Value) -> Result<AnalysisRun, PollError> {
    let run = body
        .get("run")
        .cloned()
        .ok_or_else(|| PollError::Source("Reply is missing the run".to_string()))?;
    serde_json::from_value(run).map_err(|e| PollError::Source(format!("Malformed run: {e}")))
}

impl RunSource for HttpRunSource {
    fn fetch(&self, run_id: &str) -> Result<Option<AnalysisRun>, PollError> {
        let response = self
            .client
            .get(format!("{}/runs/{}", self.server_url, run_id))
            .send()
            .map_err(|e| PollError::Source(e.to_string()))?;
        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(PollError::Source(format!(
                "Failed to fetch analysis run: {} {}",
                status.as_u16(),
                response.text().unwrap_or_default()
            )));
        }
        let body: Value = response
            .json()
            .map_err(|e| PollError::Source(format!("Unreadable reply: {e}")))?;
        parse_run(&body).map(Some)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    pub interval: Duration,
    pub budget: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            budget: DEFAULT_BUDGET,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Finished(AnalysisRun),
    /// The budget ran out before a terminal status. The run itself is untouched.
    TimedOut { last_seen: Option<AnalysisRun> },
}

/// Client-side observer. It never writes to the run.
pub struct RunPoller<S: RunSource> {
    source: S,
    config: PollerConfig,
}

impl<S: RunSource> RunPoller<S> {
    pub fn new(source: S, config: PollerConfig) -> Self {
        Self { source, config }
    }

    /// Polls until the run is terminal or the budget is spent. `on_phase` fires
    /// once per phase change.
    pub fn watch(
        &self,
        run_id: &str,
        mut on_phase: impl FnMut(&AnalysisRun, UiPhase),
    ) -> Result<PollOutcome, PollError> {
        let started = Instant::now();
        let mut phase: Option<UiPhase> = None;
        let mut last_seen: Option<AnalysisRun> = None;

        loop {
            match self.source.fetch(run_id) {
                Ok(Some(run)) => {
                    if let Some(next) = UiPhase::from_step(run.current_step) {
                        if phase != Some(next) {
                            phase = Some(next);
                            on_phase(&run, next);
                        }
                    }
                    if run.status.is_terminal() {
                        return Ok(PollOutcome::Finished(run));
                    }
                    last_seen = Some(run);
                }
                Ok(None) => return Err(PollError::NotFound(run_id.to_string())),
                Err(e) => {
                    tracing::warn!(run_id, error = %sanitize_log_message(&e.to_string()), "poll failed; will retry");
                }
            }

            if started.elapsed() + self.config.interval > self.config.budget {
                tracing::info!(run_id, "poll budget exhausted before a terminal status");
                return Ok(PollOutcome::TimedOut { last_seen });
            }
            thread::sleep(self.config.interval);
        }
    }
}
