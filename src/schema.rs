use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Typed view over the inference output.
///
/// The run stores the model's JSON verbatim; this view exists to reject
/// payloads of the wrong shape and to feed the report renderer. Every section
/// is optional, but a section that is present must carry the right types.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoofAnalysis {
    pub summary: Option<AnalysisSummary>,
    pub measurements: Option<Measurements>,
    pub planes: Option<Vec<RoofPlane>>,
    pub materials: Option<Materials>,
    pub risks: Option<Vec<String>>,
    pub maintenance: Option<Vec<String>>,
    pub cost_breakdown: Option<CostBreakdown>,
    pub permits: Option<Permits>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub address: Option<String>,
    pub overall_risk: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Measurements {
    pub total_area_sqft: Option<f64>,
    pub avg_pitch: Option<String>,
    pub ridge_length_ft: Option<f64>,
    pub valley_length_ft: Option<f64>,
    pub eaves_length_ft: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoofPlane {
    pub id: Option<String>,
    pub area_sqft: Option<f64>,
    pub pitch: Option<String>,
    pub orientation_deg: Option<f64>,
    pub polygon: Option<Vec<Vec<f64>>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Materials {
    pub shingles_bundles: Option<f64>,
    pub underlayment_sq: Option<f64>,
    pub drip_edge_ft: Option<f64>,
    pub flashing_ft: Option<f64>,
    pub vents_count: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub labor_usd: Option<f64>,
    pub materials_usd: Option<f64>,
    pub disposal_usd: Option<f64>,
    pub contingency_usd: Option<f64>,
    pub total_usd: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Permits {
    pub required: Option<bool>,
    pub notes: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("OpenAI returned invalid JSON")]
    NotJson,
    #[error("Analysis must be a JSON object")]
    NotAnObject,
    #[error("Analysis does not match the expected schema: {0}")]
    Shape(String),
}

impl RoofAnalysis {
    /// Parses raw model output, returning the untouched JSON alongside the typed view.
    pub fn parse_text(text: &str) -> Result<(Value, Self), SchemaError> {
        let value: Value = serde_json::from_str(text.trim()).map_err(|_| SchemaError::NotJson)?;
        let typed = Self::from_value(&value)?;
        Ok((value, typed))
    }

    pub fn from_value(value: &Value) -> Result<Self, SchemaError> {
        if !value.is_object() {
            return Err(SchemaError::NotAnObject);
        }
        Self::deserialize(value).map_err(|e| SchemaError::Shape(e.to_string()))
    }
}

/// Placeholder imagery written by the imagery stage. No real provider is called.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageryRecord {
    pub address: String,
    pub coordinates: Coordinates,
    pub satellite_url: String,
    pub resolution: String,
    pub date_captured: String,
    pub metadata: ImageryMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageryMetadata {
    pub zoom_level: u8,
    pub image_format: String,
    pub source: String,
}

const PLACEHOLDER_IMAGE_URL: &str =
    "https://via.placeholder.com/800x600/4a5568/ffffff?text=Satellite+Image";

impl ImageryRecord {
    pub fn placeholder(address: &str, captured_at: &str) -> Self {
        Self {
            address: address.to_string(),
            coordinates: Coordinates {
                lat: 40.7128,
                lng: -74.0060,
            },
            satellite_url: PLACEHOLDER_IMAGE_URL.to_string(),
            resolution: "high".to_string(),
            date_captured: captured_at.to_string(),
            metadata: ImageryMetadata {
                zoom_level: 18,
                image_format: "jpeg".to_string(),
                source: "mock".to_string(),
            },
        }
    }
}
