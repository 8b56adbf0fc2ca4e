//! Request and response types for the HTTP API

use crate::db::{AnalysisResult, Field, Spot};
use crate::geometry::{Coordinate, FieldMetrics};
use crate::inference::{AnalysisPredictions, Prediction};
use crate::quality::QualityAssessment;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Schema version reported by the analysis endpoints
pub const MODEL_SCHEMA_VERSION: &str = "1.0";

/// GET /api/health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub device: String,
    pub available_models: Vec<String>,
    pub loaded_models: Vec<String>,
}

/// One entry of GET /api/models
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    pub path: String,
    pub available: bool,
    pub num_classes: usize,
    pub class_names: Vec<String>,
}

/// GET /api/models
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub models: Vec<ModelEntry>,
    pub total_models: usize,
}

/// POST /api/predict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictResponse {
    #[serde(flatten)]
    pub prediction: Prediction,
    pub model_used: String,
    pub num_classes: usize,
}

/// Location metadata echoed back by POST /api/analyze
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpatialContext {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub field_id: Option<String>,
}

/// Quality flags and notes in analysis responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageQualityReport {
    pub is_blurry: bool,
    pub is_underexposed: bool,
    pub is_overexposed: bool,
    pub notes: String,
}

impl From<&QualityAssessment> for ImageQualityReport {
    fn from(assessment: &QualityAssessment) -> Self {
        Self {
            is_blurry: assessment.is_blurry,
            is_underexposed: assessment.is_underexposed,
            is_overexposed: assessment.is_overexposed,
            notes: assessment.notes.clone(),
        }
    }
}

/// POST /api/analyze
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeResponse {
    pub model_version: String,
    pub status: String,
    pub predictions: AnalysisPredictions,
    pub spatial_context: SpatialContext,
    pub image_quality: ImageQualityReport,
    pub processing_time_ms: i64,
}

/// POST /api/fields
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateFieldRequest {
    pub name: String,
    pub crop_type: Option<String>,
    pub polygon_coordinates: Vec<Coordinate>,
}

/// GET /api/fields
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldsResponse {
    pub fields: Vec<Field>,
}

/// GET /api/fields/{id}: the field plus its spots and derived metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDetailResponse {
    #[serde(flatten)]
    pub field: Field,
    pub spots: Vec<Spot>,
    pub metrics: FieldMetrics,
}

/// GET /api/fields/{id}/metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMetricsResponse {
    #[serde(flatten)]
    pub metrics: FieldMetrics,
    pub field_id: i64,
    pub field_name: String,
}

/// POST /api/fields/{id}/spots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpotCreatedResponse {
    pub spot: Spot,
    pub analysis: AnalysisResult,
}

/// One point of the per-field disease heatmap
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeatmapPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub severity: f32,
    pub health_label: String,
}

/// GET /api/fields/{id}/analysis-summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisSummaryResponse {
    pub field_id: i64,
    pub total_spots: usize,
    pub health_distribution: HashMap<String, usize>,
    pub disease_heatmap: Vec<HeatmapPoint>,
}

/// Simple acknowledgement body for deletions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predict_response_flattens_prediction() {
        let response = PredictResponse {
            prediction: Prediction {
                predicted_class: "Healthy".to_string(),
                confidence: 0.9,
                all_probabilities: HashMap::new(),
                top_predictions: Vec::new(),
            },
            model_used: "CustomCNN1".to_string(),
            num_classes: 5,
        };

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["predicted_class"], "Healthy");
        assert_eq!(json["model_used"], "CustomCNN1");
        assert_eq!(json["num_classes"], 5);
    }

    #[test]
    fn test_spatial_context_serializes_nulls() {
        let json = serde_json::to_value(SpatialContext::default()).unwrap();
        assert!(json["latitude"].is_null());
        assert!(json["field_id"].is_null());
    }
}
