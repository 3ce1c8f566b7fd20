use super::{record_failure, StageContext, StageError};
use crate::runs::{now_timestamp, AnalysisRun, CurrentStep, RunPatch, RunStore};
use crate::schema::ImageryRecord;

/// Attaches placeholder imagery to the run and advances it to `imagery_complete`.
pub fn fetch_imagery(ctx: &StageContext, run_id: &str, address: &str) -> Result<AnalysisRun, StageError> {
    tracing::info!(run_id, "imagery stage started");
    let result = write_imagery(ctx, run_id, address);
    match &result {
        Ok(_) => tracing::info!(run_id, "imagery stage completed"),
        Err(error) => record_failure(ctx, run_id, "fetch-satellite-imagery", error),
    }
    result
}

fn write_imagery(ctx: &StageContext, run_id: &str, address: &str) -> Result<AnalysisRun, StageError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(StageError::InvalidInput("Address is required".to_string()));
    }
    let mut connection = ctx.connection()?;
    RunStore::update(&mut connection, run_id, RunPatch::processing(CurrentStep::Imagery))?;

    let record = ImageryRecord::placeholder(address, &now_timestamp());
    let imagery = serde_json::to_value(&record).map_err(|e| StageError::Store(e.to_string()))?;
    let run = RunStore::update(
        &mut connection,
        run_id,
        RunPatch {
            imagery: Some(imagery),
            ..RunPatch::step(CurrentStep::ImageryComplete)
        },
    )?;
    Ok(run)
}
