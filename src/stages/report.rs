use super::{observe_cancellation, record_failure, StageContext, StageError, StageOutcome};
use crate::render::{render_html, render_text};
use crate::runs::{AnalysisRun, CurrentStep, RunPatch, RunStore};
use crate::schema::RoofAnalysis;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

pub fn text_artifact_name(run_id: &str) -> String {
    format!("roof-report-{run_id}.txt")
}

pub fn html_artifact_name(run_id: &str) -> String {
    format!("roof-report-{run_id}.html")
}

/// Renders the stored analysis, persists both renderings and records the
/// plain-text URL as the run's report reference.
pub fn generate_report(ctx: &StageContext, run_id: &str) -> Result<StageOutcome<AnalysisRun>, StageError> {
    tracing::info!(run_id, "report stage started");
    let result = build_report(ctx, run_id);
    match &result {
        Ok(StageOutcome::Completed(run)) => {
            tracing::info!(run_id, pdf_url = run.pdf_url.as_deref().unwrap_or_default(), "report stage completed")
        }
        Ok(StageOutcome::Cancelled) => tracing::info!(run_id, "report stage skipped, run cancelled"),
        Err(error) => record_failure(ctx, run_id, "generate-pdf-report", error),
    }
    result
}

fn build_report(ctx: &StageContext, run_id: &str) -> Result<StageOutcome<AnalysisRun>, StageError> {
    let mut connection = ctx.connection()?;
    let run = RunStore::get(&connection, run_id)?;
    if observe_cancellation(&mut connection, run_id)? {
        return Ok(StageOutcome::Cancelled);
    }

    let analysis_value = run
        .analysis
        .as_ref()
        .ok_or_else(|| StageError::Precondition("No analysis data found for PDF generation".to_string()))?;
    let analysis = RoofAnalysis::from_value(analysis_value)?;

    RunStore::update(&mut connection, run_id, RunPatch::step(CurrentStep::GeneratingPdf))?;

    let text = render_text(&analysis, &run.address);
    let html = render_html(&analysis, &run.address);
    let artifacts = ctx.artifacts();
    let text_url = artifacts.put(&text_artifact_name(run_id), text.as_bytes(), "text/plain")?;
    let html_url = artifacts.put(&html_artifact_name(run_id), html.as_bytes(), "text/html")?;

    let digest = Sha256::digest(text.as_bytes());
    let sha256 = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
    let metadata = merge_metadata(
        run.metadata,
        "report",
        json!({
            "text_url": text_url,
            "html_url": html_url,
            "sha256": sha256,
            "bytes": text.len(),
        }),
    );

    let run = RunStore::update(
        &mut connection,
        run_id,
        RunPatch {
            pdf_url: Some(text_url),
            metadata: Some(metadata),
            ..RunPatch::step(CurrentStep::PdfComplete)
        },
    )?;
    Ok(StageOutcome::Completed(run))
}

fn merge_metadata(existing: Option<Value>, key: &str, value: Value) -> Value {
    let mut map = match existing {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    map.insert(key.to_string(), value);
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::{generate_report, html_artifact_name, text_artifact_name};
    use crate::runs::{CurrentStep, RunPatch, RunStatus, RunStore};
    use crate::stages::{test_context, StageError, StageOutcome};
    use crate::transport::MockTransport;
    use serde_json::json;

    #[test]
    fn persists_text_report_and_records_url() {
        let fixture = test_context::mock();
        let mut conn = fixture.ctx.connection().expect("conn");
        let run = RunStore::create(&mut conn, "77 Birch Ln").expect("create");
        RunStore::update(
            &mut conn,
            &run.id,
            RunPatch {
                analysis: Some(MockTransport::sample_analysis()),
                metadata: Some(json!({"model_used": "gpt-4o-mini"})),
                ..RunPatch::processing(CurrentStep::AnalysisComplete)
            },
        )
        .expect("seed analysis");

        let outcome = generate_report(&fixture.ctx, &run.id).expect("report");
        let StageOutcome::Completed(updated) = outcome else {
            panic!("expected completion");
        };
        let expected_url = format!("http://localhost:8787/reports/{}", text_artifact_name(&run.id));
        assert_eq!(updated.pdf_url.as_deref(), Some(expected_url.as_str()));
        assert_eq!(updated.current_step, CurrentStep::PdfComplete);

        let metadata = updated.metadata.expect("metadata");
        assert_eq!(metadata["model_used"], "gpt-4o-mini");
        assert_eq!(metadata["report"]["sha256"].as_str().map(str::len), Some(64));

        let stored = fixture
            .ctx
            .artifacts()
            .get(&text_artifact_name(&run.id))
            .expect("read")
            .expect("present");
        let text = String::from_utf8(stored.bytes).expect("utf8");
        assert!(text.contains("TOTAL ESTIMATED COST: $14,850"));
        assert!(text.contains("77 Birch Ln"));
        assert!(fixture
            .ctx
            .artifacts()
            .get(&html_artifact_name(&run.id))
            .expect("read")
            .is_some());
    }

    #[test]
    fn missing_analysis_is_a_precondition_failure() {
        let fixture = test_context::mock();
        let mut conn = fixture.ctx.connection().expect("conn");
        let run = RunStore::create(&mut conn, "77 Birch Ln").expect("create");
        RunStore::update(&mut conn, &run.id, RunPatch::processing(CurrentStep::ImageryComplete))
            .expect("advance");

        let err = generate_report(&fixture.ctx, &run.id).expect_err("no analysis");
        assert!(matches!(err, StageError::Precondition(_)));
        let stored = RunStore::get(&conn, &run.id).expect("get");
        assert_eq!(stored.pdf_url, None);
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(
            stored.error_message.as_deref(),
            Some("No analysis data found for PDF generation")
        );
    }

    #[test]
    fn second_report_for_same_run_is_refused_by_storage() {
        let fixture = test_context::mock();
        let mut conn = fixture.ctx.connection().expect("conn");
        let run = RunStore::create(&mut conn, "77 Birch Ln").expect("create");
        fixture
            .ctx
            .artifacts()
            .put(&text_artifact_name(&run.id), b"stale", "text/plain")
            .expect("pre-existing object");
        RunStore::update(
            &mut conn,
            &run.id,
            RunPatch {
                analysis: Some(MockTransport::sample_analysis()),
                ..RunPatch::processing(CurrentStep::AnalysisComplete)
            },
        )
        .expect("seed analysis");

        let err = generate_report(&fixture.ctx, &run.id).expect_err("exists");
        assert!(matches!(err, StageError::Upstream(_)));
        let stored = RunStore::get(&conn, &run.id).expect("get");
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.pdf_url, None);
    }
}
