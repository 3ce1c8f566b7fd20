use crate::runs::{AnalysisRun, RunPatch, RunStatus, RunStore, StoreError};
use crate::stages::invoker::{StageInvoker, StageReply};
use crate::stages::{fetch_imagery, observe_cancellation, record_failure, StageContext, StageError};
use serde::Serialize;
use std::sync::Arc;
use std::thread;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PipelineOutcome {
    Completed { pdf_url: Option<String> },
    Cancelled,
}

/// Drives one run through Analysis and Report.
///
/// Cancellation is read at two checkpoints only: before Analysis and before
/// Report. A cancel request that arrives while a stage is in flight is seen
/// at the next checkpoint, or not at all once Report has started.
#[derive(Clone)]
pub struct RunnerEngine {
    ctx: Arc<StageContext>,
    invoker: Arc<dyn StageInvoker>,
}

impl RunnerEngine {
    pub fn new(ctx: Arc<StageContext>, invoker: Arc<dyn StageInvoker>) -> Self {
        Self { ctx, invoker }
    }

    pub fn context(&self) -> &Arc<StageContext> {
        &self.ctx
    }

    pub fn run_full_pipeline(&self, run_id: &str) -> Result<PipelineOutcome, StageError> {
        tracing::info!(run_id, "pipeline started");
        let result = self.drive(run_id);
        match &result {
            Ok(PipelineOutcome::Completed { .. }) => tracing::info!(run_id, "pipeline completed"),
            Ok(PipelineOutcome::Cancelled) => tracing::info!(run_id, "pipeline cancelled"),
            Err(error) => record_failure(&self.ctx, run_id, "run-full-pipeline", error),
        }
        result
    }

    fn drive(&self, run_id: &str) -> Result<PipelineOutcome, StageError> {
        let mut connection = self.ctx.connection()?;
        let run = RunStore::get(&connection, run_id)?;
        match run.status {
            RunStatus::Cancelled => return Ok(PipelineOutcome::Cancelled),
            RunStatus::Completed => {
                return Ok(PipelineOutcome::Completed {
                    pdf_url: run.pdf_url,
                })
            }
            RunStatus::Failed => {
                return Err(StageError::Precondition(format!(
                    "Run {run_id} already failed; submit a new run to retry"
                )))
            }
            RunStatus::Queued | RunStatus::Processing => {}
        }

        if observe_cancellation(&mut connection, run_id)? {
            return Ok(PipelineOutcome::Cancelled);
        }
        if self.invoker.invoke_analysis(run_id)? == StageReply::Cancelled {
            return Ok(PipelineOutcome::Cancelled);
        }

        if observe_cancellation(&mut connection, run_id)? {
            return Ok(PipelineOutcome::Cancelled);
        }
        if self.invoker.invoke_report(run_id)? == StageReply::Cancelled {
            return Ok(PipelineOutcome::Cancelled);
        }

        let run = RunStore::update(&mut connection, run_id, RunPatch::completed())?;
        Ok(PipelineOutcome::Completed {
            pdf_url: run.pdf_url,
        })
    }

    /// Creates the run and runs Imagery synchronously.
    pub fn submit(&self, address: &str) -> Result<AnalysisRun, StageError> {
        let mut connection = self.ctx.connection()?;
        let run = RunStore::create(&mut connection, address)?;
        tracing::info!(run_id = %run.id, "run created");
        fetch_imagery(&self.ctx, &run.id, &run.address)
    }

    /// Submits the run and hands the rest of the pipeline to a background thread.
    pub fn start(&self, address: &str) -> Result<AnalysisRun, StageError> {
        let run = self.submit(address)?;
        let engine = self.clone();
        let run_id = run.id.clone();
        let spawned = thread::Builder::new()
            .name(format!("pipeline-{}", run.id))
            .spawn(move || {
                // Outcome and failures are already on the run record.
                let _ = engine.run_full_pipeline(&run_id);
            });
        if let Err(e) = spawned {
            let error = StageError::Store(format!("Could not start pipeline: {e}"));
            record_failure(&self.ctx, &run.id, "run-full-pipeline", &error);
            return Err(error);
        }
        Ok(run)
    }

    /// Retrying is a fresh submission of the same address; the old run is untouched.
    pub fn retry(&self, run_id: &str) -> Result<AnalysisRun, StageError> {
        let connection = self.ctx.connection()?;
        let previous = RunStore::get(&connection, run_id)?;
        if !previous.status.is_terminal() {
            return Err(StageError::InvalidInput(format!(
                "Run {run_id} is still {}; cancel it before retrying",
                previous.status
            )));
        }
        tracing::info!(run_id, "retrying as a new run");
        self.start(&previous.address)
    }

    pub fn request_cancel(&self, run_id: &str) -> Result<AnalysisRun, StoreError> {
        let mut connection = crate::db::open_connection(self.ctx.db_path())?;
        RunStore::request_cancel(&mut connection, run_id)
    }
}
