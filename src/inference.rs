//! Image preprocessing, prediction and agronomic schema mapping

use crate::error::{Result, ServiceError};
use crate::zoo::{LoadedModel, ModelDescriptor};
use candle_core::{Device, Tensor, D};
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Square side length the models were trained on
pub const IMG_SIZE: usize = 224;

/// ImageNet channel statistics used during training
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Probability above which a secondary class contributes to the findings
const FINDING_THRESHOLD: f32 = 0.2;
/// Binary "Not Healthy" confidence above which general stress is flagged
const STRESS_CONFIDENCE_THRESHOLD: f32 = 0.7;

/// Decode an uploaded image into a normalized `[1, 3, 224, 224]` tensor
pub fn preprocess_image(image_bytes: &[u8], device: &Device) -> Result<Tensor> {
    let img = image::load_from_memory(image_bytes)
        .map_err(|e| ServiceError::invalid_request(format!("Error processing image: {e}")))?;
    let rgb = img
        .resize_exact(IMG_SIZE as u32, IMG_SIZE as u32, FilterType::Triangle)
        .to_rgb8();

    let mut data = vec![0f32; 3 * IMG_SIZE * IMG_SIZE];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            data[c * IMG_SIZE * IMG_SIZE + y * IMG_SIZE + x] =
                (pixel[c] as f32 / 255.0 - MEAN[c]) / STD[c];
        }
    }

    Ok(Tensor::from_vec(data, (1, 3, IMG_SIZE, IMG_SIZE), device)?)
}

/// One entry of the ranked prediction list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedClass {
    pub class: String,
    pub probability: f32,
}

/// Softmaxed output of one forward pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub predicted_class: String,
    pub confidence: f32,
    pub all_probabilities: HashMap<String, f32>,
    pub top_predictions: Vec<RankedClass>,
}

/// Run a preprocessed image through a loaded model
pub fn predict(
    model: &LoadedModel,
    descriptor: &ModelDescriptor,
    input: &Tensor,
) -> Result<Prediction> {
    let logits = model.forward(input)?;
    let probabilities = candle_nn::ops::softmax(&logits, D::Minus1)?
        .squeeze(0)?
        .to_vec1::<f32>()?;

    if probabilities.len() != descriptor.class_names.len() {
        return Err(ServiceError::inference(format!(
            "Model {} produced {} outputs for {} classes",
            descriptor.name,
            probabilities.len(),
            descriptor.class_names.len()
        )));
    }

    let mut ranked: Vec<RankedClass> = descriptor
        .class_names
        .iter()
        .zip(&probabilities)
        .map(|(class, probability)| RankedClass {
            class: class.clone(),
            probability: *probability,
        })
        .collect();
    ranked.sort_by(|a, b| b.probability.total_cmp(&a.probability));

    let best = ranked
        .first()
        .ok_or_else(|| ServiceError::inference("Model produced no outputs"))?;

    Ok(Prediction {
        predicted_class: best.class.clone(),
        confidence: best.probability,
        all_probabilities: ranked
            .iter()
            .map(|r| (r.class.clone(), r.probability))
            .collect(),
        top_predictions: ranked,
    })
}

/// Health label and detailed findings in the agronomic response schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisPredictions {
    pub health_assessment: HealthAssessment,
    pub detailed_findings: DetailedFindings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthAssessment {
    pub label: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailedFindings {
    pub diseases_detected: Vec<String>,
    pub pests_detected: Vec<String>,
    pub nutrient_deficiencies_detected: Vec<String>,
    pub stress_signs: Vec<String>,
}

impl AnalysisPredictions {
    /// Placeholder predictions for an image that failed the quality gate
    pub fn unusable() -> Self {
        Self {
            health_assessment: HealthAssessment {
                label: "unknown".to_string(),
                confidence: 0.0,
            },
            detailed_findings: DetailedFindings {
                diseases_detected: Vec::new(),
                pests_detected: Vec::new(),
                nutrient_deficiencies_detected: Vec::new(),
                stress_signs: Vec::new(),
            },
        }
    }
}

const DISEASE_CLASSES: [&str; 3] = ["Cerscospora", "Leaf rust", "Phoma"];
const PEST_CLASSES: [&str; 1] = ["Miner"];

fn health_label(class: &str) -> &'static str {
    match class {
        "Healthy" => "healthy",
        "Not Healthy" => "mildly_stressed",
        "Cerscospora" | "Leaf rust" | "Phoma" => "diseased",
        "Miner" => "pest_damage",
        _ => "unknown",
    }
}

/// Map a raw model prediction to the agronomic response schema.
///
/// Secondary classes above the probability threshold contribute findings;
/// the binary families can only ever signal general stress.
pub fn map_to_schema(prediction: &Prediction, crop_type: &str) -> AnalysisPredictions {
    let label = health_label(&prediction.predicted_class).to_string();

    let mut diseases_detected = Vec::new();
    let mut pests_detected = Vec::new();
    let mut stress_signs = Vec::new();

    for ranked in &prediction.top_predictions {
        if ranked.probability < FINDING_THRESHOLD {
            continue;
        }
        let qualified = if crop_type.is_empty() {
            ranked.class.clone()
        } else {
            format!("{} ({})", ranked.class, crop_type)
        };
        if DISEASE_CLASSES.contains(&ranked.class.as_str()) {
            if !diseases_detected.contains(&qualified) {
                diseases_detected.push(qualified);
            }
        } else if PEST_CLASSES.contains(&ranked.class.as_str()) {
            if !pests_detected.contains(&qualified) {
                pests_detected.push(qualified);
            }
        } else if ranked.class == "Not Healthy" {
            stress_signs.push("General plant stress detected".to_string());
        }
    }

    if prediction.predicted_class == "Not Healthy"
        && prediction.confidence >= STRESS_CONFIDENCE_THRESHOLD
    {
        stress_signs.push("Plant health issues detected".to_string());
    }

    AnalysisPredictions {
        health_assessment: HealthAssessment {
            label,
            confidence: prediction.confidence,
        },
        detailed_findings: DetailedFindings {
            diseases_detected,
            pests_detected,
            nutrient_deficiencies_detected: Vec::new(),
            stress_signs,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn sample_image() -> Vec<u8> {
        let img = RgbImage::from_pixel(100, 80, Rgb([120, 180, 90]));
        let mut bytes = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut bytes, ImageFormat::Png)
            .unwrap();
        bytes.into_inner()
    }

    fn prediction(class: &str, confidence: f32, rest: &[(&str, f32)]) -> Prediction {
        let mut ranked = vec![RankedClass {
            class: class.to_string(),
            probability: confidence,
        }];
        ranked.extend(rest.iter().map(|(c, p)| RankedClass {
            class: c.to_string(),
            probability: *p,
        }));
        Prediction {
            predicted_class: class.to_string(),
            confidence,
            all_probabilities: ranked
                .iter()
                .map(|r| (r.class.clone(), r.probability))
                .collect(),
            top_predictions: ranked,
        }
    }

    #[test]
    fn test_preprocess_shape_and_normalization() {
        let tensor = preprocess_image(&sample_image(), &Device::Cpu).unwrap();
        assert_eq!(tensor.dims(), &[1, 3, IMG_SIZE, IMG_SIZE]);

        // A mid-gray green channel lands near (180/255 - 0.456) / 0.224
        let values = tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let green = values[IMG_SIZE * IMG_SIZE];
        assert!((green - ((180.0 / 255.0 - 0.456) / 0.224)).abs() < 1e-4);
    }

    #[test]
    fn test_preprocess_rejects_garbage() {
        let err = preprocess_image(b"nope", &Device::Cpu).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRequest { .. }));
    }

    #[test]
    fn test_schema_mapping_disease() {
        let pred = prediction("Leaf rust", 0.8, &[("Healthy", 0.15), ("Phoma", 0.25)]);
        let schema = map_to_schema(&pred, "coffee");

        assert_eq!(schema.health_assessment.label, "diseased");
        assert_eq!(
            schema.detailed_findings.diseases_detected,
            vec!["Leaf rust (coffee)", "Phoma (coffee)"]
        );
        assert!(schema.detailed_findings.pests_detected.is_empty());
    }

    #[test]
    fn test_schema_mapping_pest_without_crop_type() {
        let pred = prediction("Miner", 0.9, &[("Healthy", 0.1)]);
        let schema = map_to_schema(&pred, "");

        assert_eq!(schema.health_assessment.label, "pest_damage");
        assert_eq!(schema.detailed_findings.pests_detected, vec!["Miner"]);
    }

    #[test]
    fn test_schema_mapping_binary_stress() {
        let pred = prediction("Not Healthy", 0.85, &[("Healthy", 0.15)]);
        let schema = map_to_schema(&pred, "");

        assert_eq!(schema.health_assessment.label, "mildly_stressed");
        assert_eq!(schema.detailed_findings.stress_signs.len(), 2);
    }

    #[test]
    fn test_schema_mapping_healthy_below_thresholds() {
        let pred = prediction("Healthy", 0.95, &[("Leaf rust", 0.05)]);
        let schema = map_to_schema(&pred, "coffee");

        assert_eq!(schema.health_assessment.label, "healthy");
        assert!(schema.detailed_findings.diseases_detected.is_empty());
        assert!(schema.detailed_findings.stress_signs.is_empty());
    }
}
