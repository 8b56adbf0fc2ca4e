//! HTTP request handlers
//!
//! Handlers stay thin: they parse the request, delegate to the zoo, the
//! records layer and the geometry module, and shape the response. Model
//! loading and forward passes are synchronous and non-cancellable, so they
//! run on the blocking pool; a client that gives up mid-request does not
//! abort the load, and later requests observe the populated cache.

use super::types::*;
use super::AppState;
use crate::db::{self, ImageQualityFlags, NewAnalysis, NewSpot};
use crate::error::{Result, ServiceError};
use crate::geometry;
use crate::inference::{self, AnalysisPredictions, Prediction};
use crate::quality;
use crate::utils::ensure_directory;
use crate::zoo::ModelZoo;
use actix_multipart::Multipart;
use actix_web::{web, HttpResponse};
use chrono::Utc;
use futures_util::StreamExt as _;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// An uploaded image part of a multipart request
struct UploadedImage {
    filename: String,
    bytes: Vec<u8>,
}

/// Parsed multipart form: at most one image part plus text values
#[derive(Default)]
struct UploadForm {
    image: Option<UploadedImage>,
    values: HashMap<String, String>,
}

impl UploadForm {
    /// Text value for a key, treating empty and literal "null" as absent
    fn value(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty() && *v != "null")
    }

    fn require_image(self) -> Result<(UploadedImage, HashMap<String, String>)> {
        match self.image {
            Some(image) => Ok((image, self.values)),
            None => Err(ServiceError::invalid_request("No image file provided")),
        }
    }
}

async fn parse_upload(mut payload: Multipart) -> Result<UploadForm> {
    let mut form = UploadForm::default();

    while let Some(item) = payload.next().await {
        let mut field = item.map_err(|e| {
            ServiceError::invalid_request(format!("Invalid multipart payload: {e}"))
        })?;
        let name = field.name().unwrap_or_default().to_string();
        let filename = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .map(str::to_string);

        let mut bytes = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk.map_err(|e| {
                ServiceError::invalid_request(format!("Failed to read upload: {e}"))
            })?;
            bytes.extend_from_slice(&chunk);
        }

        if name == "image" {
            let filename = filename.unwrap_or_default();
            if filename.is_empty() {
                return Err(ServiceError::invalid_request("No image file selected"));
            }
            form.image = Some(UploadedImage { filename, bytes });
        } else if !name.is_empty() {
            form.values
                .insert(name, String::from_utf8_lossy(&bytes).into_owned());
        }
    }

    Ok(form)
}

/// Load the model (through the cache) and run one forward pass on the
/// blocking pool.
async fn predict_blocking(
    zoo: Arc<ModelZoo>,
    model_name: String,
    image_bytes: Vec<u8>,
) -> Result<Prediction> {
    web::block(move || {
        let model = zoo.get_or_load(&model_name)?;
        let descriptor = zoo.describe(&model_name)?;
        let input = inference::preprocess_image(&image_bytes, zoo.device())?;
        inference::predict(&model, &descriptor, &input)
    })
    .await
    .map_err(|e| ServiceError::internal(format!("Prediction task failed: {e}")))?
}

/// GET /api/health
pub async fn health_check(data: web::Data<AppState>) -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(HealthResponse {
        status: "healthy".to_string(),
        device: data.config.models.device.clone(),
        available_models: data.zoo.available(),
        loaded_models: data.zoo.loaded_names(),
    }))
}

/// GET /api/models
pub async fn list_models(data: web::Data<AppState>) -> Result<HttpResponse> {
    let mut models = Vec::new();
    for name in data.zoo.available() {
        let descriptor = data.zoo.describe(&name)?;
        models.push(ModelEntry {
            name,
            available: descriptor.artifact_path.exists(),
            path: descriptor.artifact_path.to_string_lossy().into_owned(),
            num_classes: descriptor.num_classes,
            class_names: descriptor.class_names,
        });
    }

    Ok(HttpResponse::Ok().json(ModelsResponse {
        total_models: models.len(),
        models,
    }))
}

/// POST /api/predict
pub async fn predict(data: web::Data<AppState>, payload: Multipart) -> Result<HttpResponse> {
    let form = parse_upload(payload).await?;
    let requested = form.value("model").map(str::to_string);
    let (image, _) = form.require_image()?;

    let available = data.zoo.available();
    let model_name = match requested {
        Some(name) => {
            if !available.iter().any(|m| *m == name) {
                return Err(ServiceError::model_not_found(name));
            }
            name
        }
        None => available
            .into_iter()
            .next()
            .ok_or_else(|| ServiceError::model_not_found("no models have been discovered"))?,
    };

    let prediction =
        predict_blocking(Arc::clone(&data.zoo), model_name.clone(), image.bytes).await?;
    let descriptor = data.zoo.describe(&model_name)?;

    Ok(HttpResponse::Ok().json(PredictResponse {
        prediction,
        model_used: model_name,
        num_classes: descriptor.num_classes,
    }))
}

/// POST /api/analyze
pub async fn analyze(data: web::Data<AppState>, payload: Multipart) -> Result<HttpResponse> {
    let start = Instant::now();
    let form = parse_upload(payload).await?;

    let spatial_context = SpatialContext {
        latitude: form.value("latitude").and_then(|v| v.parse().ok()),
        longitude: form.value("longitude").and_then(|v| v.parse().ok()),
        field_id: form.value("field_id").map(str::to_string),
    };
    let crop_type = form.value("crop_type").unwrap_or("").to_string();
    let requested = form.value("model").map(str::to_string);

    let (image, _) = form.require_image()?;

    let assessment = quality::assess(&image.bytes);
    if assessment.is_unusable() {
        info!("Rejecting unusable image: {}", assessment.notes);
        return Ok(HttpResponse::Ok().json(AnalyzeResponse {
            model_version: MODEL_SCHEMA_VERSION.to_string(),
            status: "unusable_image".to_string(),
            predictions: AnalysisPredictions::unusable(),
            spatial_context,
            image_quality: (&assessment).into(),
            processing_time_ms: start.elapsed().as_millis() as i64,
        }));
    }

    let model_name = data
        .zoo
        .choose_for_analysis(requested.as_deref())
        .ok_or_else(|| ServiceError::model_not_found("no models available for analysis"))?;

    let prediction =
        predict_blocking(Arc::clone(&data.zoo), model_name, image.bytes).await?;
    let predictions = inference::map_to_schema(&prediction, &crop_type);

    Ok(HttpResponse::Ok().json(AnalyzeResponse {
        model_version: MODEL_SCHEMA_VERSION.to_string(),
        status: "ok".to_string(),
        predictions,
        spatial_context,
        image_quality: (&assessment).into(),
        processing_time_ms: start.elapsed().as_millis() as i64,
    }))
}

/// POST /api/fields
pub async fn create_field(
    data: web::Data<AppState>,
    body: web::Json<CreateFieldRequest>,
) -> Result<HttpResponse> {
    let request = body.into_inner();
    if request.name.trim().is_empty() {
        return Err(ServiceError::invalid_request(
            "Name and polygon_coordinates required",
        ));
    }
    geometry::validate_polygon(&request.polygon_coordinates)?;

    let crop_type = request.crop_type.as_deref().unwrap_or("coffee");
    let field = db::create_field(
        &data.pool,
        &request.name,
        Some(crop_type),
        &request.polygon_coordinates,
    )
    .await?;

    info!("Created field {} ({})", field.id, field.name);
    Ok(HttpResponse::Created().json(field))
}

/// GET /api/fields
pub async fn list_fields(data: web::Data<AppState>) -> Result<HttpResponse> {
    let fields = db::list_fields(&data.pool).await?;
    Ok(HttpResponse::Ok().json(FieldsResponse { fields }))
}

/// GET /api/fields/{id}
pub async fn get_field(
    data: web::Data<AppState>,
    path: web::Path<i64>,
) -> Result<HttpResponse> {
    let field_id = path.into_inner();
    let field = db::get_field(&data.pool, field_id).await?;
    let spots = db::list_spots_for_field(&data.pool, field_id).await?;
    let metrics = geometry::field_metrics(&field.polygon_coordinates);

    Ok(HttpResponse::Ok().json(FieldDetailResponse {
        field,
        spots,
        metrics,
    }))
}

/// GET /api/fields/{id}/metrics
pub async fn get_field_metrics(
    data: web::Data<AppState>,
    path: web::Path<i64>,
) -> Result<HttpResponse> {
    let field_id = path.into_inner();
    let field = db::get_field(&data.pool, field_id).await?;

    if field.polygon_coordinates.is_empty() {
        return Err(ServiceError::invalid_request(
            "Field has no polygon coordinates",
        ));
    }

    Ok(HttpResponse::Ok().json(FieldMetricsResponse {
        metrics: geometry::field_metrics(&field.polygon_coordinates),
        field_id,
        field_name: field.name,
    }))
}

/// DELETE /api/fields/{id}
pub async fn delete_field(
    data: web::Data<AppState>,
    path: web::Path<i64>,
) -> Result<HttpResponse> {
    db::delete_field(&data.pool, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(MessageResponse {
        message: "Field deleted successfully".to_string(),
    }))
}

/// POST /api/fields/{id}/spots
pub async fn create_spot(
    data: web::Data<AppState>,
    path: web::Path<i64>,
    payload: Multipart,
) -> Result<HttpResponse> {
    let start = Instant::now();
    let field_id = path.into_inner();
    let field = db::get_field(&data.pool, field_id).await?;

    let form = parse_upload(payload).await?;
    let latitude: f64 = form
        .value("latitude")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| ServiceError::invalid_request("Invalid coordinates"))?;
    let longitude: f64 = form
        .value("longitude")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| ServiceError::invalid_request("Invalid coordinates"))?;

    if !geometry::point_in_polygon(latitude, longitude, &field.polygon_coordinates) {
        return Err(ServiceError::invalid_request(
            "Spot must be inside field polygon",
        ));
    }

    let requested = form.value("model").map(str::to_string);
    let device = form.value("device").map(str::to_string);
    let notes = form.value("notes").map(str::to_string);
    let (image, _) = form.require_image()?;

    let upload_dir = data
        .config
        .analysis
        .uploads_dir
        .join(format!("field_{field_id}"));
    ensure_directory(&upload_dir)?;
    let stored_name = format!("spot_{}_{}", Utc::now().timestamp(), image.filename);
    let stored_path = upload_dir.join(&stored_name);
    std::fs::write(&stored_path, &image.bytes)?;

    let spot = db::create_spot(
        &data.pool,
        &NewSpot {
            field_id,
            latitude,
            longitude,
            image_path: Some(stored_path.to_string_lossy().into_owned()),
            image_filename: Some(image.filename.clone()),
            device,
            notes,
        },
    )
    .await?;

    let assessment = quality::assess(&image.bytes);
    let crop_type = field.crop_type.clone().unwrap_or_default();

    let (status, predictions, model_used) = if assessment.is_unusable() {
        (
            "unusable_image".to_string(),
            AnalysisPredictions::unusable(),
            "none".to_string(),
        )
    } else {
        let model_name = data
            .zoo
            .choose_for_analysis(requested.as_deref())
            .ok_or_else(|| ServiceError::model_not_found("no models available for analysis"))?;
        let prediction =
            predict_blocking(Arc::clone(&data.zoo), model_name.clone(), image.bytes).await?;
        (
            "ok".to_string(),
            inference::map_to_schema(&prediction, &crop_type),
            model_name,
        )
    };

    let analysis = db::insert_analysis(
        &data.pool,
        spot.id,
        &NewAnalysis {
            model_version: model_used,
            status,
            health_label: predictions.health_assessment.label.clone(),
            confidence: predictions.health_assessment.confidence,
            findings: predictions.detailed_findings.clone(),
            quality: ImageQualityFlags {
                is_blurry: assessment.is_blurry,
                is_underexposed: assessment.is_underexposed,
                is_overexposed: assessment.is_overexposed,
            },
            processing_time_ms: start.elapsed().as_millis() as i64,
        },
    )
    .await?;

    let spot = db::get_spot(&data.pool, spot.id).await?;
    Ok(HttpResponse::Created().json(SpotCreatedResponse { spot, analysis }))
}

/// GET /api/spots/{id}
pub async fn get_spot(data: web::Data<AppState>, path: web::Path<i64>) -> Result<HttpResponse> {
    let spot = db::get_spot(&data.pool, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(spot))
}

/// DELETE /api/spots/{id}
pub async fn delete_spot(
    data: web::Data<AppState>,
    path: web::Path<i64>,
) -> Result<HttpResponse> {
    db::delete_spot(&data.pool, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(MessageResponse {
        message: "Spot deleted successfully".to_string(),
    }))
}

/// GET /api/fields/{id}/analysis-summary
pub async fn analysis_summary(
    data: web::Data<AppState>,
    path: web::Path<i64>,
) -> Result<HttpResponse> {
    let field_id = path.into_inner();
    db::get_field(&data.pool, field_id).await?;
    let spots = db::list_spots_for_field(&data.pool, field_id).await?;

    let total_spots = spots.len();
    let mut health_distribution: HashMap<String, usize> = HashMap::new();
    let mut disease_heatmap = Vec::new();

    for spot in spots {
        if let Some(analysis) = spot.analysis {
            let label = analysis.health_assessment.label;
            *health_distribution.entry(label.clone()).or_insert(0) += 1;

            let confidence = analysis.health_assessment.confidence;
            disease_heatmap.push(HeatmapPoint {
                latitude: spot.latitude,
                longitude: spot.longitude,
                severity: if confidence > 0.0 { confidence } else { 0.5 },
                health_label: label,
            });
        }
    }

    Ok(HttpResponse::Ok().json(AnalysisSummaryResponse {
        field_id,
        total_spots,
        health_distribution,
        disease_heatmap,
    }))
}

/// Fallback for unmatched routes
pub async fn not_found() -> Result<HttpResponse> {
    Err(ServiceError::not_found(
        "The requested endpoint does not exist",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::ArchitectureRegistry;
    use crate::config::{known_models, Config};
    use actix_web::{test, App};
    use candle_core::Device;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_state() -> AppState {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        db::init_schema(&pool).await.unwrap();

        AppState {
            zoo: Arc::new(ModelZoo::new(
                Device::Cpu,
                ArchitectureRegistry::with_defaults(),
                known_models(),
            )),
            pool,
            config: Config::default(),
        }
    }

    macro_rules! test_app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new($state))
                    .configure(crate::api::routes::configure),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn test_health_endpoint() {
        let app = test_app!(test_state().await);

        let req = test::TestRequest::get().uri("/api/health").to_request();
        let body: HealthResponse = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body.status, "healthy");
        assert!(body.available_models.is_empty());
        assert!(body.loaded_models.is_empty());
    }

    #[actix_web::test]
    async fn test_unknown_route_is_404() {
        let app = test_app!(test_state().await);

        let req = test::TestRequest::get().uri("/api/nothing").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 404);
    }

    #[actix_web::test]
    async fn test_create_field_rejects_invalid_polygon() {
        let app = test_app!(test_state().await);

        let req = test::TestRequest::post()
            .uri("/api/fields")
            .set_json(serde_json::json!({
                "name": "broken",
                "polygon_coordinates": [[0.0, 0.0], [1.0, 1.0]]
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400);
    }

    #[actix_web::test]
    async fn test_field_lifecycle() {
        let app = test_app!(test_state().await);

        let req = test::TestRequest::post()
            .uri("/api/fields")
            .set_json(serde_json::json!({
                "name": "North slope",
                "crop_type": "coffee",
                "polygon_coordinates": [[0.0, 0.0], [0.0, 0.001], [0.001, 0.001], [0.001, 0.0]]
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 201);
        let field: db::Field = test::read_body_json(resp).await;
        assert_eq!(field.name, "North slope");

        let req = test::TestRequest::get()
            .uri(&format!("/api/fields/{}/metrics", field.id))
            .to_request();
        let metrics: FieldMetricsResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(metrics.field_name, "North slope");
        assert!(metrics.metrics.area_sqm > 0.0);

        let req = test::TestRequest::delete()
            .uri(&format!("/api/fields/{}", field.id))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200);

        let req = test::TestRequest::get()
            .uri(&format!("/api/fields/{}", field.id))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 404);
    }

    #[actix_web::test]
    async fn test_summary_of_empty_field() {
        let app = test_app!(test_state().await);

        let req = test::TestRequest::post()
            .uri("/api/fields")
            .set_json(serde_json::json!({
                "name": "empty",
                "polygon_coordinates": [[0.0, 0.0], [0.0, 0.001], [0.001, 0.001]]
            }))
            .to_request();
        let field: db::Field = test::call_and_read_body_json(&app, req).await;

        let req = test::TestRequest::get()
            .uri(&format!("/api/fields/{}/analysis-summary", field.id))
            .to_request();
        let summary: AnalysisSummaryResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(summary.total_spots, 0);
        assert!(summary.health_distribution.is_empty());
        assert!(summary.disease_heatmap.is_empty());
    }

    #[actix_web::test]
    async fn test_models_endpoint_with_nothing_discovered() {
        let app = test_app!(test_state().await);

        let req = test::TestRequest::get().uri("/api/models").to_request();
        let body: ModelsResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body.total_models, 0);
    }
}
