//! Persistence layer for fields, spots and analysis results
//!
//! SQLite via sqlx. Polygons and finding lists are stored as JSON text
//! columns; timestamps as RFC 3339 strings. Each spot has at most one
//! analysis row, and deleting a field cascades through its spots.

use crate::error::{Result, ServiceError};
use crate::geometry::Coordinate;
use crate::inference::{DetailedFindings, HealthAssessment};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use tracing::info;

/// Open (creating if necessary) the database file and prepare the schema
pub async fn connect(path: &Path, max_connections: u32) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    init_schema(&pool).await?;
    info!("Database ready at {}", path.display());
    Ok(pool)
}

/// Create the tables if they do not exist
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS fields (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            crop_type TEXT,
            polygon_coordinates TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS spots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            field_id INTEGER NOT NULL REFERENCES fields(id) ON DELETE CASCADE,
            latitude REAL NOT NULL,
            longitude REAL NOT NULL,
            image_path TEXT,
            image_filename TEXT,
            timestamp TEXT NOT NULL,
            device TEXT,
            notes TEXT
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS analysis_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            spot_id INTEGER NOT NULL UNIQUE REFERENCES spots(id) ON DELETE CASCADE,
            model_version TEXT,
            status TEXT NOT NULL,
            health_label TEXT,
            confidence REAL,
            diseases_detected TEXT,
            pests_detected TEXT,
            nutrient_deficiencies_detected TEXT,
            stress_signs TEXT,
            image_quality_is_blurry INTEGER,
            image_quality_is_underexposed INTEGER,
            image_quality_is_overexposed INTEGER,
            processing_time_ms INTEGER,
            analyzed_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// A registered field and its polygon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Field {
    pub id: i64,
    pub name: String,
    pub crop_type: Option<String>,
    pub polygon_coordinates: Vec<Coordinate>,
    pub spot_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A geolocated observation inside a field
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spot {
    pub id: i64,
    pub field_id: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    pub device: Option<String>,
    pub notes: Option<String>,
    pub image_filename: Option<String>,
    #[serde(skip)]
    pub image_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisResult>,
}

/// Quality flags persisted with an analysis
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageQualityFlags {
    pub is_blurry: bool,
    pub is_underexposed: bool,
    pub is_overexposed: bool,
}

/// One stored model analysis of a spot image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub model_version: Option<String>,
    pub status: String,
    pub health_assessment: HealthAssessment,
    pub detailed_findings: DetailedFindings,
    pub image_quality: ImageQualityFlags,
    pub processing_time_ms: Option<i64>,
    pub analyzed_at: DateTime<Utc>,
}

/// Input for a new spot row
#[derive(Debug, Clone)]
pub struct NewSpot {
    pub field_id: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub image_path: Option<String>,
    pub image_filename: Option<String>,
    pub device: Option<String>,
    pub notes: Option<String>,
}

/// Input for a new analysis row
#[derive(Debug, Clone)]
pub struct NewAnalysis {
    pub model_version: String,
    pub status: String,
    pub health_label: String,
    pub confidence: f32,
    pub findings: DetailedFindings,
    pub quality: ImageQualityFlags,
    pub processing_time_ms: i64,
}

pub async fn create_field(
    pool: &SqlitePool,
    name: &str,
    crop_type: Option<&str>,
    polygon: &[Coordinate],
) -> Result<Field> {
    let now = Utc::now();
    let polygon_json = serde_json::to_string(polygon)?;

    let result = sqlx::query(
        "INSERT INTO fields (name, crop_type, polygon_coordinates, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(name)
    .bind(crop_type)
    .bind(&polygon_json)
    .bind(now.to_rfc3339())
    .bind(now.to_rfc3339())
    .execute(pool)
    .await?;

    get_field(pool, result.last_insert_rowid()).await
}

pub async fn list_fields(pool: &SqlitePool) -> Result<Vec<Field>> {
    let rows = sqlx::query(
        "SELECT f.*, (SELECT COUNT(*) FROM spots s WHERE s.field_id = f.id) AS spot_count
         FROM fields f ORDER BY f.id",
    )
    .fetch_all(pool)
    .await?;

    rows.iter().map(field_from_row).collect()
}

pub async fn get_field(pool: &SqlitePool, id: i64) -> Result<Field> {
    let row = sqlx::query(
        "SELECT f.*, (SELECT COUNT(*) FROM spots s WHERE s.field_id = f.id) AS spot_count
         FROM fields f WHERE f.id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ServiceError::not_found(format!("Field {id} does not exist")))?;

    field_from_row(&row)
}

/// Delete a field; its spots and their analyses go with it
pub async fn delete_field(pool: &SqlitePool, id: i64) -> Result<()> {
    let result = sqlx::query("DELETE FROM fields WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(ServiceError::not_found(format!("Field {id} does not exist")));
    }
    Ok(())
}

pub async fn create_spot(pool: &SqlitePool, spot: &NewSpot) -> Result<Spot> {
    let now = Utc::now();

    let result = sqlx::query(
        "INSERT INTO spots
            (field_id, latitude, longitude, image_path, image_filename, timestamp, device, notes)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(spot.field_id)
    .bind(spot.latitude)
    .bind(spot.longitude)
    .bind(&spot.image_path)
    .bind(&spot.image_filename)
    .bind(now.to_rfc3339())
    .bind(&spot.device)
    .bind(&spot.notes)
    .execute(pool)
    .await?;

    get_spot(pool, result.last_insert_rowid()).await
}

pub async fn get_spot(pool: &SqlitePool, id: i64) -> Result<Spot> {
    let row = sqlx::query("SELECT * FROM spots WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ServiceError::not_found(format!("Spot {id} does not exist")))?;

    let mut spot = spot_from_row(&row)?;
    spot.analysis = get_analysis_for_spot(pool, id).await?;
    Ok(spot)
}

/// Spots of one field, each with its analysis when present
pub async fn list_spots_for_field(pool: &SqlitePool, field_id: i64) -> Result<Vec<Spot>> {
    let rows = sqlx::query("SELECT * FROM spots WHERE field_id = ? ORDER BY id")
        .bind(field_id)
        .fetch_all(pool)
        .await?;

    let mut spots = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut spot = spot_from_row(row)?;
        spot.analysis = get_analysis_for_spot(pool, spot.id).await?;
        spots.push(spot);
    }
    Ok(spots)
}

pub async fn delete_spot(pool: &SqlitePool, id: i64) -> Result<()> {
    let result = sqlx::query("DELETE FROM spots WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(ServiceError::not_found(format!("Spot {id} does not exist")));
    }
    Ok(())
}

pub async fn insert_analysis(
    pool: &SqlitePool,
    spot_id: i64,
    analysis: &NewAnalysis,
) -> Result<AnalysisResult> {
    let now = Utc::now();

    sqlx::query(
        "INSERT INTO analysis_results
            (spot_id, model_version, status, health_label, confidence,
             diseases_detected, pests_detected, nutrient_deficiencies_detected, stress_signs,
             image_quality_is_blurry, image_quality_is_underexposed, image_quality_is_overexposed,
             processing_time_ms, analyzed_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(spot_id)
    .bind(&analysis.model_version)
    .bind(&analysis.status)
    .bind(&analysis.health_label)
    .bind(analysis.confidence)
    .bind(serde_json::to_string(&analysis.findings.diseases_detected)?)
    .bind(serde_json::to_string(&analysis.findings.pests_detected)?)
    .bind(serde_json::to_string(
        &analysis.findings.nutrient_deficiencies_detected,
    )?)
    .bind(serde_json::to_string(&analysis.findings.stress_signs)?)
    .bind(analysis.quality.is_blurry)
    .bind(analysis.quality.is_underexposed)
    .bind(analysis.quality.is_overexposed)
    .bind(analysis.processing_time_ms)
    .bind(now.to_rfc3339())
    .execute(pool)
    .await?;

    get_analysis_for_spot(pool, spot_id)
        .await?
        .ok_or_else(|| ServiceError::internal("Analysis row vanished after insert"))
}

pub async fn get_analysis_for_spot(
    pool: &SqlitePool,
    spot_id: i64,
) -> Result<Option<AnalysisResult>> {
    let row = sqlx::query("SELECT * FROM analysis_results WHERE spot_id = ?")
        .bind(spot_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(analysis_from_row).transpose()
}

fn field_from_row(row: &SqliteRow) -> Result<Field> {
    let polygon_json: String = row.try_get("polygon_coordinates")?;
    Ok(Field {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        crop_type: row.try_get("crop_type")?,
        polygon_coordinates: serde_json::from_str(&polygon_json)?,
        spot_count: row.try_get("spot_count")?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_timestamp(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn spot_from_row(row: &SqliteRow) -> Result<Spot> {
    Ok(Spot {
        id: row.try_get("id")?,
        field_id: row.try_get("field_id")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        timestamp: parse_timestamp(&row.try_get::<String, _>("timestamp")?)?,
        device: row.try_get("device")?,
        notes: row.try_get("notes")?,
        image_filename: row.try_get("image_filename")?,
        image_path: row.try_get("image_path")?,
        analysis: None,
    })
}

fn analysis_from_row(row: &SqliteRow) -> Result<AnalysisResult> {
    Ok(AnalysisResult {
        model_version: row.try_get("model_version")?,
        status: row.try_get("status")?,
        health_assessment: HealthAssessment {
            label: row
                .try_get::<Option<String>, _>("health_label")?
                .unwrap_or_else(|| "unknown".to_string()),
            confidence: row.try_get::<Option<f32>, _>("confidence")?.unwrap_or(0.0),
        },
        detailed_findings: DetailedFindings {
            diseases_detected: json_list(row, "diseases_detected")?,
            pests_detected: json_list(row, "pests_detected")?,
            nutrient_deficiencies_detected: json_list(row, "nutrient_deficiencies_detected")?,
            stress_signs: json_list(row, "stress_signs")?,
        },
        image_quality: ImageQualityFlags {
            is_blurry: row
                .try_get::<Option<bool>, _>("image_quality_is_blurry")?
                .unwrap_or(false),
            is_underexposed: row
                .try_get::<Option<bool>, _>("image_quality_is_underexposed")?
                .unwrap_or(false),
            is_overexposed: row
                .try_get::<Option<bool>, _>("image_quality_is_overexposed")?
                .unwrap_or(false),
        },
        processing_time_ms: row.try_get("processing_time_ms")?,
        analyzed_at: parse_timestamp(&row.try_get::<String, _>("analyzed_at")?)?,
    })
}

fn json_list(row: &SqliteRow, column: &str) -> Result<Vec<String>> {
    match row.try_get::<Option<String>, _>(column)? {
        Some(json) => Ok(serde_json::from_str(&json)?),
        None => Ok(Vec::new()),
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ServiceError::internal(format!("Invalid timestamp in database: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_pool() -> SqlitePool {
        // One connection keeps every query on the same in-memory database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&pool)
            .await
            .unwrap();
        init_schema(&pool).await.unwrap();
        pool
    }

    fn square() -> Vec<Coordinate> {
        vec![[0.0, 0.0], [0.0, 0.001], [0.001, 0.001], [0.001, 0.0]]
    }

    fn sample_analysis() -> NewAnalysis {
        NewAnalysis {
            model_version: "CustomCNN1".to_string(),
            status: "ok".to_string(),
            health_label: "diseased".to_string(),
            confidence: 0.87,
            findings: DetailedFindings {
                diseases_detected: vec!["Leaf rust (coffee)".to_string()],
                pests_detected: Vec::new(),
                nutrient_deficiencies_detected: Vec::new(),
                stress_signs: Vec::new(),
            },
            quality: ImageQualityFlags {
                is_blurry: false,
                is_underexposed: false,
                is_overexposed: false,
            },
            processing_time_ms: 42,
        }
    }

    #[tokio::test]
    async fn test_field_roundtrip() {
        let pool = memory_pool().await;

        let field = create_field(&pool, "North slope", Some("coffee"), &square())
            .await
            .unwrap();
        assert_eq!(field.name, "North slope");
        assert_eq!(field.polygon_coordinates, square());
        assert_eq!(field.spot_count, 0);

        let all = list_fields(&pool).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, field.id);
    }

    #[tokio::test]
    async fn test_get_missing_field() {
        let pool = memory_pool().await;
        let err = get_field(&pool, 99).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_spot_with_analysis() {
        let pool = memory_pool().await;
        let field = create_field(&pool, "f", None, &square()).await.unwrap();

        let spot = create_spot(
            &pool,
            &NewSpot {
                field_id: field.id,
                latitude: 0.0005,
                longitude: 0.0005,
                image_path: Some("uploads/field_1/spot_1.jpg".to_string()),
                image_filename: Some("leaf.jpg".to_string()),
                device: Some("phone".to_string()),
                notes: None,
            },
        )
        .await
        .unwrap();
        assert!(spot.analysis.is_none());

        insert_analysis(&pool, spot.id, &sample_analysis()).await.unwrap();

        let fetched = get_spot(&pool, spot.id).await.unwrap();
        let analysis = fetched.analysis.unwrap();
        assert_eq!(analysis.status, "ok");
        assert_eq!(analysis.health_assessment.label, "diseased");
        assert_eq!(
            analysis.detailed_findings.diseases_detected,
            vec!["Leaf rust (coffee)"]
        );
        assert_eq!(analysis.processing_time_ms, Some(42));

        let field = get_field(&pool, field.id).await.unwrap();
        assert_eq!(field.spot_count, 1);
    }

    #[tokio::test]
    async fn test_delete_field_cascades() {
        let pool = memory_pool().await;
        let field = create_field(&pool, "f", None, &square()).await.unwrap();
        let spot = create_spot(
            &pool,
            &NewSpot {
                field_id: field.id,
                latitude: 0.0005,
                longitude: 0.0005,
                image_path: None,
                image_filename: None,
                device: None,
                notes: None,
            },
        )
        .await
        .unwrap();
        insert_analysis(&pool, spot.id, &sample_analysis()).await.unwrap();

        delete_field(&pool, field.id).await.unwrap();

        assert!(matches!(
            get_spot(&pool, spot.id).await.unwrap_err(),
            ServiceError::NotFound { .. }
        ));
        assert!(get_analysis_for_spot(&pool, spot.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_missing_spot() {
        let pool = memory_pool().await;
        assert!(matches!(
            delete_spot(&pool, 1).await.unwrap_err(),
            ServiceError::NotFound { .. }
        ));
    }
}
