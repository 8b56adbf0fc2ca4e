//! Checkpoint artifact normalization and structure inference
//!
//! Checkpoints arrive with unknown internal shape: some are a bare parameter
//! map, others wrap it under a container key (`model_state_dict`,
//! `state_dict`, `model`, or a home-grown variant), and the classifier head
//! they were trained with does not always match the architecture we would
//! build by default. This module turns a raw deserialized artifact into a
//! normalized `StateDict` and infers, purely from parameter shapes and
//! naming conventions, the output-class count and the structural variant of
//! the network that produced it.

use crate::error::{Result, ServiceError};
use candle_core::{Device, Tensor};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

/// Normalized parameter map: unique keys, deterministic iteration order.
pub type StateDict = BTreeMap<String, Tensor>;

/// Container keys probed, in priority order, when unwrapping an artifact
const WRAPPER_KEYS: [&str; 3] = ["model_state_dict", "state_dict", "model"];

/// Final classification layers are narrow; anything wider is assumed to be
/// an internal hidden layer.
const MIN_CLASS_COUNT: usize = 2;
const MAX_CLASS_COUNT: usize = 100;

static LAYER_INDEX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.(\d+)\.").unwrap());

/// Read a checkpoint artifact from disk into a raw parameter map.
///
/// PyTorch pickles and safetensors files are both accepted; nested
/// containers inside a pickle surface as dotted key prefixes. Any
/// deserialization failure is terminal for the load attempt.
pub fn read_artifact(path: &Path, device: &Device) -> Result<StateDict> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    let tensors: Vec<(String, Tensor)> = match ext.as_str() {
        "safetensors" => candle_core::safetensors::load(path, device)
            .map_err(|e| {
                ServiceError::artifact_read(format!("{}: {}", path.display(), e))
            })?
            .into_iter()
            .collect(),
        _ => candle_core::pickle::read_all(path).map_err(|e| {
            ServiceError::artifact_read(format!("{}: {}", path.display(), e))
        })?,
    };

    Ok(tensors.into_iter().collect())
}

/// Unwrap a raw artifact into its parameter map.
///
/// If a known container key wraps the parameters, only the wrapped entries
/// survive (siblings such as optimizer state are dropped). Failing the
/// priority list, top-level segments are scanned case-insensitively for
/// `state_dict` or `model`. An artifact that is already a bare parameter map
/// passes through unchanged; this function always returns a map.
pub fn normalize(raw: StateDict) -> StateDict {
    for wrapper in WRAPPER_KEYS {
        let prefix = format!("{wrapper}.");
        if raw.keys().any(|k| k.starts_with(&prefix)) {
            debug!("Unwrapping checkpoint container '{}'", wrapper);
            return strip_prefix(raw, &prefix);
        }
    }

    for segment in top_level_segments(&raw) {
        let lower = segment.to_lowercase();
        if lower.contains("state_dict") || lower.contains("model") {
            debug!("Unwrapping checkpoint container '{}' (scanned)", segment);
            return strip_prefix(raw, &format!("{segment}."));
        }
    }

    raw
}

fn strip_prefix(raw: StateDict, prefix: &str) -> StateDict {
    raw.into_iter()
        .filter_map(|(key, tensor)| {
            key.strip_prefix(prefix)
                .map(|stripped| (stripped.to_string(), tensor))
        })
        .collect()
}

/// Distinct first dotted segments that actually prefix nested keys
fn top_level_segments(raw: &StateDict) -> Vec<String> {
    let mut segments = Vec::new();
    for key in raw.keys() {
        if let Some((head, _)) = key.split_once('.') {
            if !segments.iter().any(|s| s == head) {
                segments.push(head.to_string());
            }
        }
    }
    segments
}

/// A parameter that looks like part of a classifier head
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifierCandidate {
    pub key: String,
    pub output_dim: usize,
    pub input_dim: usize,
    pub layer_index: usize,
}

/// Result of class-count inference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassCountGuess {
    pub num_classes: usize,
    /// False when no candidate fell inside the plausible class-count range
    /// and the widest-indexed layer was used as a best effort.
    pub confident: bool,
}

/// Numeric index embedded in a layer key, e.g. `classifier.4.weight` -> 4
fn extract_layer_index(key: &str) -> usize {
    LAYER_INDEX_RE
        .captures(key)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

/// Collect two-dimensional weight parameters whose key follows a
/// classifier/head/fully-connected naming convention.
pub fn classifier_candidates(state: &StateDict) -> Vec<ClassifierCandidate> {
    let mut candidates = Vec::new();

    for (key, tensor) in state {
        if !key.contains("weight") || tensor.dims().len() != 2 {
            continue;
        }
        let lower = key.to_lowercase();
        if ["classifier", "fc", "head"].iter().any(|t| lower.contains(t)) {
            let dims = tensor.dims();
            candidates.push(ClassifierCandidate {
                key: key.clone(),
                output_dim: dims[0],
                input_dim: dims[1],
                layer_index: extract_layer_index(key),
            });
        }
    }

    candidates
}

/// Infer the output-class count of the network that produced a state dict.
///
/// Candidates are walked from the highest layer index down (later layers in
/// a network carry higher indices in their key); the first whose output
/// width lies in the plausible class-count range wins. When none does, the
/// highest-indexed candidate's width is used and the guess is flagged as
/// not confident. Returns `None` when no classifier-like parameter exists.
pub fn infer_class_count(state: &StateDict) -> Option<ClassCountGuess> {
    let mut candidates = classifier_candidates(state);
    if candidates.is_empty() {
        return None;
    }

    // Stable sort keeps encounter order among equal indices
    candidates.sort_by(|a, b| b.layer_index.cmp(&a.layer_index));

    for candidate in &candidates {
        if (MIN_CLASS_COUNT..=MAX_CLASS_COUNT).contains(&candidate.output_dim) {
            debug!(
                "Detected {} classes from checkpoint key {} (shape [{}, {}], index {})",
                candidate.output_dim,
                candidate.key,
                candidate.output_dim,
                candidate.input_dim,
                candidate.layer_index
            );
            return Some(ClassCountGuess {
                num_classes: candidate.output_dim,
                confident: true,
            });
        }
    }

    let fallback = &candidates[0];
    warn!(
        "No classifier layer within [{}, {}] classes; using highest-index layer {} with width {}",
        MIN_CLASS_COUNT, MAX_CLASS_COUNT, fallback.key, fallback.output_dim
    );
    Some(ClassCountGuess {
        num_classes: fallback.output_dim,
        confident: false,
    })
}

/// Classifier-head variants a family may be built with
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// The family's current head layout
    Default,
    /// A shallower head kept for compatibility with older checkpoints
    Simple,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Default => "default",
            Variant::Simple => "simple",
        }
    }
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Choose the structural variant matching a checkpoint's classifier head.
///
/// Only meaningful for families that declare more than one head layout; the
/// caller gates on that. The shallow head ends at `classifier.4` with a
/// 128-wide input, so a weight of shape `[num_classes, 128]` at that
/// position identifies it.
pub fn select_variant(state: &StateDict, num_classes: usize) -> Variant {
    for (key, tensor) in state {
        if key.contains("classifier.4.weight") && tensor.dims().len() == 2 {
            let dims = tensor.dims();
            if dims[0] == num_classes && dims[1] == 128 {
                debug!("Detected simple classifier-head variant from {}", key);
                return Variant::Simple;
            }
        }
    }
    Variant::Default
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn tensor(dims: &[usize]) -> Tensor {
        Tensor::zeros(dims, DType::F32, &Device::Cpu).unwrap()
    }

    fn state(entries: &[(&str, &[usize])]) -> StateDict {
        entries
            .iter()
            .map(|(k, dims)| (k.to_string(), tensor(dims)))
            .collect()
    }

    #[test]
    fn test_normalize_unwraps_priority_container() {
        let raw = state(&[
            ("state_dict.classifier.4.weight", &[5, 128]),
            ("state_dict.features.0.weight", &[32, 3, 3, 3]),
            ("epoch_marker.value", &[1]),
        ]);

        let normalized = normalize(raw);
        assert_eq!(normalized.len(), 2);
        assert!(normalized.contains_key("classifier.4.weight"));
        assert!(normalized.contains_key("features.0.weight"));
    }

    #[test]
    fn test_normalize_prefers_model_state_dict() {
        let raw = state(&[
            ("model_state_dict.fc.weight", &[5, 64]),
            ("state_dict.fc.weight", &[7, 64]),
        ]);

        let normalized = normalize(raw);
        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized["fc.weight"].dims(), &[5, 64]);
    }

    #[test]
    fn test_normalize_scans_for_unconventional_wrapper() {
        let raw = state(&[("best_model_weights.classifier.1.weight", &[2, 256])]);

        let normalized = normalize(raw);
        assert!(normalized.contains_key("classifier.1.weight"));
    }

    #[test]
    fn test_normalize_is_identity_on_bare_map() {
        let raw = state(&[
            ("classifier.4.weight", &[5, 128]),
            ("features.0.weight", &[32, 3, 3, 3]),
        ]);

        let normalized = normalize(raw.clone());
        assert_eq!(normalized.len(), raw.len());
        assert!(normalized.contains_key("classifier.4.weight"));
    }

    #[test]
    fn test_extract_layer_index() {
        assert_eq!(extract_layer_index("classifier.4.weight"), 4);
        assert_eq!(extract_layer_index("head.6.weight"), 6);
        assert_eq!(extract_layer_index("fc.weight"), 0);
    }

    #[test]
    fn test_candidates_filter_shape_and_name() {
        let sd = state(&[
            ("classifier.1.weight", &[128, 256]),
            ("classifier.1.bias", &[128]),
            ("features.0.weight", &[32, 3, 3, 3]),
            ("head.6.weight", &[5, 1280]),
        ]);

        let candidates = classifier_candidates(&sd);
        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().all(|c| c.key.contains("weight")));
    }

    #[test]
    fn test_class_count_prefers_highest_index_in_range() {
        // A narrow and a wide candidate at the same index, plus a wide one
        // higher up: the highest-indexed in-range candidate must win.
        let sd = state(&[
            ("classifier.1.weight", &[5, 256]),
            ("classifier.1.extra.weight", &[512, 256]),
            ("classifier.7.weight", &[512, 128]),
            ("classifier.4.weight", &[5, 128]),
        ]);

        let guess = infer_class_count(&sd).unwrap();
        assert_eq!(guess.num_classes, 5);
        assert!(guess.confident);
    }

    #[test]
    fn test_class_count_fallback_is_flagged() {
        let sd = state(&[
            ("classifier.1.weight", &[256, 512]),
            ("classifier.4.weight", &[128, 256]),
        ]);

        let guess = infer_class_count(&sd).unwrap();
        assert_eq!(guess.num_classes, 128);
        assert!(!guess.confident);
    }

    #[test]
    fn test_class_count_undetermined_without_candidates() {
        let sd = state(&[("features.0.weight", &[32, 3, 3, 3])]);
        assert!(infer_class_count(&sd).is_none());
    }

    #[test]
    fn test_variant_selection() {
        let simple = state(&[("classifier.4.weight", &[2, 128])]);
        assert_eq!(select_variant(&simple, 2), Variant::Simple);

        let deep = state(&[
            ("classifier.4.weight", &[128, 256]),
            ("classifier.7.weight", &[2, 128]),
        ]);
        assert_eq!(select_variant(&deep, 2), Variant::Default);

        let empty = StateDict::new();
        assert_eq!(select_variant(&empty, 2), Variant::Default);
    }

    #[test]
    fn test_read_artifact_rejects_garbage() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("broken.pth");
        std::fs::write(&path, b"definitely not a checkpoint").unwrap();

        let err = read_artifact(&path, &Device::Cpu).unwrap_err();
        assert!(matches!(err, ServiceError::ArtifactRead { .. }));
    }

    #[test]
    fn test_read_artifact_safetensors_roundtrip() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("weights.safetensors");

        let mut tensors = std::collections::HashMap::new();
        tensors.insert("fc.weight".to_string(), tensor(&[5, 64]));
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let loaded = read_artifact(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["fc.weight"].dims(), &[5, 64]);
    }
}
