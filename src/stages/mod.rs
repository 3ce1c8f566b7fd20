pub mod analysis;
pub mod imagery;
pub mod invoker;
pub mod report;

use crate::artifacts::{ArtifactError, ArtifactStore};
use crate::db::open_connection;
use crate::providers::{ProviderError, ProviderErrorKind, ProviderRuntime};
use crate::redact::sanitize_log_message;
use crate::runs::{RunPatch, RunStatus, RunStore, StoreError};
use crate::schema::SchemaError;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub use analysis::process_analysis;
pub use imagery::fetch_imagery;
pub use report::generate_report;

/// Everything a stage needs, injected once at construction.
pub struct StageContext {
    db_path: PathBuf,
    providers: ProviderRuntime,
    artifacts: Arc<dyn ArtifactStore>,
}

impl StageContext {
    pub fn new(db_path: PathBuf, providers: ProviderRuntime, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self {
            db_path,
            providers,
            artifacts,
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn connection(&self) -> Result<Connection, StageError> {
        Ok(open_connection(&self.db_path)?)
    }

    pub fn providers(&self) -> &ProviderRuntime {
        &self.providers
    }

    pub fn artifacts(&self) -> &dyn ArtifactStore {
        self.artifacts.as_ref()
    }
}

/// Cancellation is an outcome, never an error.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome<T> {
    Completed(T),
    Cancelled,
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("{0}")]
    Configuration(String),
    #[error("{0}")]
    Upstream(String),
    #[error("{0}")]
    Contract(String),
    #[error("{0}")]
    Precondition(String),
    #[error("{0}")]
    InvalidInput(String),
    #[error("Run not found: {0}")]
    RunNotFound(String),
    #[error("{0}")]
    Store(String),
}

impl StageError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Upstream(_) => "upstream",
            Self::Contract(_) => "contract",
            Self::Precondition(_) => "precondition",
            Self::InvalidInput(_) => "invalid_input",
            Self::RunNotFound(_) => "not_found",
            Self::Store(_) => "store",
        }
    }
}

impl From<StoreError> for StageError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::RunNotFound(id) => Self::RunNotFound(id),
            StoreError::InvalidInput(message) => Self::InvalidInput(message),
            other => Self::Store(other.to_string()),
        }
    }
}

impl From<ProviderError> for StageError {
    fn from(value: ProviderError) -> Self {
        match value.kind {
            ProviderErrorKind::MissingCredential => Self::Configuration(value.message),
            ProviderErrorKind::Upstream => Self::Upstream(value.message),
            ProviderErrorKind::InvalidResponse => Self::Contract(value.message),
        }
    }
}

impl From<ArtifactError> for StageError {
    fn from(value: ArtifactError) -> Self {
        match value {
            ArtifactError::InvalidName(_) => Self::Precondition(value.to_string()),
            other => Self::Upstream(other.to_string()),
        }
    }
}

impl From<SchemaError> for StageError {
    fn from(value: SchemaError) -> Self {
        Self::Contract(value.to_string())
    }
}

/// Reads the flag and, when raised, moves the run to `cancelled`.
///
/// Returns true only when the run is (or just became) `cancelled`. A run that
/// finished another way keeps its outcome even if the flag was raised late.
pub(crate) fn observe_cancellation(connection: &mut Connection, run_id: &str) -> Result<bool, StageError> {
    let run = RunStore::get(connection, run_id)?;
    if run.status.is_terminal() {
        return Ok(run.status == RunStatus::Cancelled);
    }
    if !run.cancel_requested {
        return Ok(false);
    }
    match RunStore::update(connection, run_id, RunPatch::cancelled()) {
        Ok(_) => {
            tracing::info!(run_id, "run cancelled at checkpoint");
            Ok(true)
        }
        Err(StoreError::Terminal { status, .. }) => Ok(status == RunStatus::Cancelled),
        Err(e) => Err(e.into()),
    }
}

/// Writes the failure onto the run. Runs that are already terminal keep
/// their first outcome.
pub(crate) fn record_failure(ctx: &StageContext, run_id: &str, stage: &str, error: &StageError) {
    let message = error.to_string();
    tracing::warn!(run_id, stage, kind = error.kind(), error = %sanitize_log_message(&message), "stage failed");

    if matches!(error, StageError::RunNotFound(_)) {
        return;
    }
    let mut connection = match ctx.connection() {
        Ok(connection) => connection,
        Err(e) => {
            tracing::error!(run_id, error = %sanitize_log_message(&e.to_string()), "could not open store to record failure");
            return;
        }
    };
    match RunStore::update(&mut connection, run_id, RunPatch::failed(message)) {
        Ok(_) | Err(StoreError::Terminal { .. }) | Err(StoreError::RunNotFound(_)) => {}
        Err(e) => {
            tracing::error!(run_id, error = %sanitize_log_message(&e.to_string()), "failed to record stage failure");
        }
    }
}
