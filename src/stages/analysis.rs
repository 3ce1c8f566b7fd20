use super::{observe_cancellation, record_failure, StageContext, StageError, StageOutcome};
use crate::providers::ProviderRequest;
use crate::runs::{AnalysisRun, CurrentStep, RunPatch, RunStore};
use crate::schema::RoofAnalysis;
use serde_json::json;

const TEMPERATURE: f32 = 0.2;
const MAX_OUTPUT_TOKENS: u32 = 4000;

pub const SYSTEM_PROMPT: &str = "You are Roof Dynamics, a professional roof inspection assistant. \
Analyze the provided address and generate a comprehensive roof inspection report. \
Return ONLY valid JSON matching the exact schema provided. No additional text or formatting.";

/// User prompt with the address embedded as a JSON string literal.
pub fn build_user_prompt(address: &str) -> String {
    let quoted = serde_json::Value::String(address.to_string()).to_string();
    format!(
        r#"Analyze this property address for a comprehensive roof inspection report: {quoted}

Based on typical construction patterns and regional building practices, provide a detailed analysis in the following JSON format:

{{
  "summary": {{
    "address": {quoted},
    "overall_risk": "low|medium|high",
    "notes": "Professional assessment summary"
  }},
  "measurements": {{
    "total_area_sqft": 0,
    "avg_pitch": "6/12",
    "ridge_length_ft": 0,
    "valley_length_ft": 0,
    "eaves_length_ft": 0
  }},
  "planes": [
    {{
      "id": "plane_1",
      "area_sqft": 0,
      "pitch": "6/12",
      "orientation_deg": 180,
      "polygon": [[0,0], [100,0], [100,50], [0,50]]
    }}
  ],
  "materials": {{
    "shingles_bundles": 0,
    "underlayment_sq": 0,
    "drip_edge_ft": 0,
    "flashing_ft": 0,
    "vents_count": 0
  }},
  "risks": ["List of identified risks"],
  "maintenance": ["Recommended maintenance items"],
  "cost_breakdown": {{
    "labor_usd": 0,
    "materials_usd": 0,
    "disposal_usd": 0,
    "contingency_usd": 0,
    "total_usd": 0
  }},
  "permits": {{
    "required": false,
    "notes": "Permit requirements analysis"
  }}
}}

Provide realistic estimates based on standard residential construction practices."#
    )
}

pub fn process_analysis(ctx: &StageContext, run_id: &str) -> Result<StageOutcome<AnalysisRun>, StageError> {
    tracing::info!(run_id, "analysis stage started");
    let result = analyze(ctx, run_id);
    match &result {
        Ok(StageOutcome::Completed(_)) => tracing::info!(run_id, "analysis stage completed"),
        Ok(StageOutcome::Cancelled) => tracing::info!(run_id, "analysis stage skipped, run cancelled"),
        Err(error) => record_failure(ctx, run_id, "process-openai-analysis", error),
    }
    result
}

fn analyze(ctx: &StageContext, run_id: &str) -> Result<StageOutcome<AnalysisRun>, StageError> {
    let mut connection = ctx.connection()?;
    let run = RunStore::get(&connection, run_id)?;
    if observe_cancellation(&mut connection, run_id)? {
        return Ok(StageOutcome::Cancelled);
    }

    RunStore::update(&mut connection, run_id, RunPatch::processing(CurrentStep::AiAnalysis))?;

    let providers = ctx.providers();
    let request = ProviderRequest {
        model: providers.model().to_string(),
        system_prompt: SYSTEM_PROMPT.to_string(),
        user_prompt: build_user_prompt(&run.address),
        temperature: TEMPERATURE,
        max_output_tokens: MAX_OUTPUT_TOKENS,
        correlation_id: Some(run_id.to_string()),
    };
    // The connection stays idle across the provider call; no transaction is open.
    let response = providers.dispatch(&request)?;
    let (analysis, _) = RoofAnalysis::parse_text(&response.text)?;

    let run = RunStore::update(
        &mut connection,
        run_id,
        RunPatch {
            analysis: Some(analysis),
            metadata: Some(json!({
                "token_usage": response.usage,
                "model_used": response.model,
            })),
            ..RunPatch::step(CurrentStep::AnalysisComplete)
        },
    )?;
    Ok(StageOutcome::Completed(run))
}

#[cfg(test)]
mod tests {
    use super::{build_user_prompt, process_analysis};
    use crate::providers::ProviderError;
    use crate::runs::{CurrentStep, RunPatch, RunStatus, RunStore};
    use crate::stages::{test_context, StageError, StageOutcome};
    use crate::transport::{MockTransport, OpenAiTransport};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn stores_inference_output_verbatim_with_usage_metadata() {
        let payload = json!({
            "summary": {"address": "9 Oak Ave", "overall_risk": "low", "notes": "Fine"},
            "cost_breakdown": {"total_usd": 9100},
            "vendor_extension": {"confidence": 0.87}
        });
        let transport = Arc::new(MockTransport::replying(payload.to_string()));
        let fixture = test_context::with_transport(transport.clone(), None);
        let mut conn = fixture.ctx.connection().expect("conn");
        let run = RunStore::create(&mut conn, "9 Oak Ave").expect("create");

        let outcome = process_analysis(&fixture.ctx, &run.id).expect("analysis");
        let StageOutcome::Completed(updated) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(updated.analysis, Some(payload));
        assert_eq!(updated.current_step, CurrentStep::AnalysisComplete);
        assert_eq!(updated.status, RunStatus::Processing);
        let metadata = updated.metadata.expect("metadata");
        assert_eq!(metadata["model_used"], "gpt-4o-mini");
        assert!(metadata["token_usage"].is_object());

        let sent = transport.requests();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].user_prompt.contains("\"9 Oak Ave\""));
        assert_eq!(sent[0].max_output_tokens, 4000);
    }

    #[test]
    fn cancelled_run_is_not_sent_to_the_provider() {
        let transport = Arc::new(MockTransport::new());
        let fixture = test_context::with_transport(transport.clone(), None);
        let mut conn = fixture.ctx.connection().expect("conn");
        let run = RunStore::create(&mut conn, "9 Oak Ave").expect("create");
        RunStore::request_cancel(&mut conn, &run.id).expect("cancel");

        let outcome = process_analysis(&fixture.ctx, &run.id).expect("analysis");
        assert_eq!(outcome, StageOutcome::Cancelled);
        assert!(transport.requests().is_empty());
        let stored = RunStore::get(&conn, &run.id).expect("get");
        assert_eq!(stored.status, RunStatus::Cancelled);
        assert_eq!(stored.analysis, None);
    }

    #[test]
    fn invalid_json_fails_the_run() {
        let transport = Arc::new(MockTransport::replying("Here is your roof report!"));
        let fixture = test_context::with_transport(transport, None);
        let mut conn = fixture.ctx.connection().expect("conn");
        let run = RunStore::create(&mut conn, "9 Oak Ave").expect("create");

        let err = process_analysis(&fixture.ctx, &run.id).expect_err("invalid json");
        assert!(matches!(err, StageError::Contract(_)));
        let stored = RunStore::get(&conn, &run.id).expect("get");
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.current_step, CurrentStep::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("OpenAI returned invalid JSON"));
        assert_eq!(stored.analysis, None);
    }

    #[test]
    fn upstream_error_message_is_copied_to_the_run() {
        let upstream = r#"OpenAI API error: 401 {"error":{"message":"Incorrect API key provided: Bearer sk-proj-abcdefghijklmnop","type":"invalid_request_error","code":"invalid_api_key"}}"#;
        let transport = Arc::new(MockTransport::scripted(vec![Err(ProviderError::upstream(upstream))]));
        let fixture = test_context::with_transport(transport, None);
        let mut conn = fixture.ctx.connection().expect("conn");
        let run = RunStore::create(&mut conn, "9 Oak Ave").expect("create");

        let err = process_analysis(&fixture.ctx, &run.id).expect_err("upstream");
        assert!(matches!(err, StageError::Upstream(_)));
        let stored = RunStore::get(&conn, &run.id).expect("get");
        assert_eq!(stored.error_message.as_deref(), Some(upstream));
    }

    #[test]
    fn late_cancel_flag_on_completed_run_is_not_reported_as_cancelled() {
        let fixture = test_context::mock();
        let mut conn = fixture.ctx.connection().expect("conn");
        let run = RunStore::create(&mut conn, "9 Oak Ave").expect("create");
        RunStore::update(&mut conn, &run.id, RunPatch::processing(CurrentStep::PdfComplete)).expect("advance");
        RunStore::request_cancel(&mut conn, &run.id).expect("cancel");
        RunStore::update(&mut conn, &run.id, RunPatch::completed()).expect("complete");

        let result = process_analysis(&fixture.ctx, &run.id);
        assert!(!matches!(result, Ok(StageOutcome::Cancelled)));
        assert_eq!(
            RunStore::get(&conn, &run.id).expect("get").status,
            RunStatus::Completed
        );
    }

    #[test]
    fn missing_api_key_is_a_configuration_failure() {
        let transport = OpenAiTransport::new("http://127.0.0.1:9".to_string(), Duration::from_secs(1))
            .expect("transport");
        let fixture = test_context::with_transport(Arc::new(transport), None);
        let mut conn = fixture.ctx.connection().expect("conn");
        let run = RunStore::create(&mut conn, "9 Oak Ave").expect("create");

        let err = process_analysis(&fixture.ctx, &run.id).expect_err("no key");
        assert!(matches!(err, StageError::Configuration(_)));
        let stored = RunStore::get(&conn, &run.id).expect("get");
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("OpenAI API key not configured"));
    }

    #[test]
    fn prompt_escapes_quotes_in_address() {
        let prompt = build_user_prompt("5 \"Quoted\" Rd");
        assert!(prompt.contains(r#""5 \"Quoted\" Rd""#));
        let start = prompt.find('{').expect("template start");
        let end = prompt.rfind('}').expect("template end");
        let template: Value = serde_json::from_str(&prompt[start..=end]).expect("template is json");
        assert_eq!(template["summary"]["address"], "5 \"Quoted\" Rd");
    }
}
