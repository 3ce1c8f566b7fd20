use crate::providers::types::{ProviderError, ProviderRequest, ProviderResponse};
use crate::transport::ExecutionTransport;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Offline transport. Replays scripted replies in order, then falls back to a
/// canned analysis so the pipeline can run end to end without a provider.
pub struct MockTransport {
    scripted: Mutex<VecDeque<Result<String, ProviderError>>>,
    seen: Mutex<Vec<ProviderRequest>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::scripted(Vec::new())
    }

    pub fn scripted(replies: Vec<Result<String, ProviderError>>) -> Self {
        Self {
            scripted: Mutex::new(replies.into()),
            seen: Mutex::new(Vec::new()),
        }
    }

    #[cfg(test)]
    pub fn replying(text: impl Into<String>) -> Self {
        Self::scripted(vec![Ok(text.into())])
    }

    #[cfg(test)]
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.seen.lock().map(|seen| seen.clone()).unwrap_or_default()
    }

    pub fn sample_analysis() -> serde_json::Value {
        json!({
            "summary": {
                "address": "",
                "overall_risk": "medium",
                "notes": "Well-maintained asphalt shingle roof with minor wear indicators typical for age."
            },
            "measurements": {
                "total_area_sqft": 2847,
                "avg_pitch": "6/12",
                "ridge_length_ft": 184,
                "valley_length_ft": 67,
                "eaves_length_ft": 312
            },
            "planes": [
                {"id": "plane_1", "area_sqft": 1423, "pitch": "6/12", "orientation_deg": 180,
                 "polygon": [[0, 0], [60, 0], [60, 24], [0, 24]]}
            ],
            "materials": {
                "shingles_bundles": 96,
                "underlayment_sq": 29,
                "drip_edge_ft": 312,
                "flashing_ft": 251,
                "vents_count": 8
            },
            "risks": [
                "Minor granule loss on south-facing slopes",
                "Flashing around chimney requires inspection"
            ],
            "maintenance": ["Clean gutters twice a year"],
            "cost_breakdown": {
                "labor_usd": 8500,
                "materials_usd": 4200,
                "disposal_usd": 800,
                "contingency_usd": 1350,
                "total_usd": 14850
            },
            "permits": {
                "required": false,
                "notes": "Simple maintenance and repairs do not require permits in this jurisdiction"
            }
        })
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionTransport for MockTransport {
    fn dispatch(
        &self,
        request: &ProviderRequest,
        _api_key: Option<&str>,
    ) -> Result<ProviderResponse, ProviderError> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(request.clone());
        }

        let next = self
            .scripted
            .lock()
            .map_err(|_| ProviderError::upstream("Mock transport state is unavailable."))?
            .pop_front();

        let text = match next {
            Some(reply) => reply?,
            None => Self::sample_analysis().to_string(),
        };

        Ok(ProviderResponse {
            model: request.model.clone(),
            text,
            usage: json!({"prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0}),
        })
    }
}
