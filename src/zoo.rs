//! Model zoo: discovery, lazy loading and caching of classifier networks
//!
//! The zoo owns all process-scoped model state: the artifact path table
//! built once at startup by the discovery scan, the per-model descriptors,
//! the cache of loaded networks and the report of each model's last load.
//! Loading is lazy and guarded per model name, so concurrent first requests
//! for the same model perform exactly one load; everything after the first
//! call is a side-effect-free read. Loaded models are never evicted.

use crate::arch::{ArchitectureRegistry, ClassifierNetwork};
use crate::checkpoint::{self, StateDict, Variant};
use crate::config::{class_names_for, KnownModel};
use crate::error::{Result, ServiceError};
use crate::loader::{bind_state_dict, LoadReport};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Checkpoint file extensions picked up by the discovery scan
const ARTIFACT_EXTENSIONS: [&str; 2] = ["pth", "safetensors"];

/// Suffix tokens stripped from artifact file stems before name matching
const STEM_SUFFIX_TOKENS: [&str; 2] = ["_best", "_checkpoint"];

/// Everything known about one model family instance
#[derive(Debug, Clone, Serialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub num_classes: usize,
    pub class_names: Vec<String>,
    pub variant: Variant,
    pub artifact_path: PathBuf,
}

/// A weight-bound, inference-ready network
#[derive(Debug)]
pub struct LoadedModel {
    pub name: String,
    network: Box<dyn ClassifierNetwork>,
}

impl LoadedModel {
    /// Forward a batch of preprocessed images, returning raw logits
    pub fn forward(&self, images: &Tensor) -> Result<Tensor> {
        self.network.forward(images)
    }
}

/// Process-scoped model state
pub struct ModelZoo {
    device: Device,
    registry: ArchitectureRegistry,
    known: Vec<KnownModel>,
    paths: RwLock<HashMap<String, PathBuf>>,
    descriptors: RwLock<HashMap<String, ModelDescriptor>>,
    loaded: RwLock<HashMap<String, Arc<LoadedModel>>>,
    reports: RwLock<HashMap<String, LoadReport>>,
    load_gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ModelZoo {
    pub fn new(device: Device, registry: ArchitectureRegistry, known: Vec<KnownModel>) -> Self {
        Self {
            device,
            registry,
            known,
            paths: RwLock::new(HashMap::new()),
            descriptors: RwLock::new(HashMap::new()),
            loaded: RwLock::new(HashMap::new()),
            reports: RwLock::new(HashMap::new()),
            load_gates: Mutex::new(HashMap::new()),
        }
    }

    /// Scan a directory for checkpoint artifacts and populate the path table.
    ///
    /// File stems are matched against the known-model table after stripping
    /// common suffix tokens; a name already bound to a path is never rebound.
    /// Unmatched files are logged and skipped. Returns the number of models
    /// bound to a path after the scan.
    pub fn scan_directory(&self, dir: &Path) -> Result<usize> {
        info!("Scanning for model artifacts in {}", dir.display());

        if !dir.is_dir() {
            warn!("Models directory not found: {}", dir.display());
            return Ok(0);
        }

        let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| ARTIFACT_EXTENSIONS.contains(&e.to_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        entries.sort();

        for path in entries {
            let stem = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem,
                None => continue,
            };
            let mut candidate = stem.to_string();
            for token in STEM_SUFFIX_TOKENS {
                candidate = candidate.replace(token, "");
            }

            let matched = self.known.iter().find(|known| {
                names_match(known.name, &candidate) && !self.paths.read().contains_key(known.name)
            });

            match matched {
                Some(known) => {
                    info!("Matched {} to model {}", path.display(), known.name);
                    self.paths
                        .write()
                        .insert(known.name.to_string(), path.clone());
                    self.descriptors.write().insert(
                        known.name.to_string(),
                        ModelDescriptor {
                            name: known.name.to_string(),
                            num_classes: known.num_classes,
                            class_names: known
                                .class_names
                                .iter()
                                .map(|s| s.to_string())
                                .collect(),
                            variant: Variant::Default,
                            artifact_path: path,
                        },
                    );
                }
                None => {
                    warn!(
                        "Could not match {} to any known model configuration",
                        path.display()
                    );
                }
            }
        }

        let count = self.paths.read().len();
        info!("Discovery finished: {} model(s) available", count);
        Ok(count)
    }

    /// Names of all discovered models
    pub fn available(&self) -> Vec<String> {
        let mut names: Vec<String> = self.paths.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of models currently resident in the cache
    pub fn loaded_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.loaded.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Descriptor for a discovered model
    pub fn describe(&self, name: &str) -> Result<ModelDescriptor> {
        self.descriptors
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ServiceError::model_not_found(name))
    }

    /// Report of the model's most recent load, if it has been loaded
    pub fn last_load_report(&self, name: &str) -> Option<LoadReport> {
        self.reports.read().get(name).cloned()
    }

    /// Inference device
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Pick a model for an analysis request: an explicitly requested model
    /// wins if discovered, then the multi-class families in preference
    /// order, then anything available.
    pub fn choose_for_analysis(&self, requested: Option<&str>) -> Option<String> {
        const PREFERRED: [&str; 3] = ["CustomCNN1", "CustomCNN2", "CustomCNN3"];

        let paths = self.paths.read();
        if let Some(name) = requested {
            if paths.contains_key(name) {
                return Some(name.to_string());
            }
        }
        for preferred in PREFERRED {
            if paths.contains_key(preferred) {
                return Some(preferred.to_string());
            }
        }
        drop(paths);
        self.available().into_iter().next()
    }

    /// Return the cached model, loading it first if necessary.
    ///
    /// At most one load per name runs at a time: a per-name gate spans the
    /// miss check through the cache write, and concurrent callers block on
    /// it until the winner has populated the cache. A failed load leaves
    /// nothing cached, so the next call retries from scratch.
    pub fn get_or_load(&self, name: &str) -> Result<Arc<LoadedModel>> {
        if let Some(model) = self.loaded.read().get(name) {
            return Ok(Arc::clone(model));
        }

        let gate = Arc::clone(
            self.load_gates
                .lock()
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        );
        let _guard = gate.lock();

        // A concurrent caller may have finished the load while we waited
        if let Some(model) = self.loaded.read().get(name) {
            return Ok(Arc::clone(model));
        }

        let path = self
            .paths
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ServiceError::model_not_found(name))?;

        let start = std::time::Instant::now();
        let (model, descriptor, report) = self.load_from_disk(name, &path)?;
        info!(
            "Loaded {} in {} ({} parameters bound)",
            name,
            crate::utils::format_duration(start.elapsed()),
            report.bound
        );

        let model = Arc::new(model);
        self.descriptors
            .write()
            .insert(name.to_string(), descriptor);
        self.reports.write().insert(name.to_string(), report);
        self.loaded
            .write()
            .insert(name.to_string(), Arc::clone(&model));
        Ok(model)
    }

    /// Full load pipeline for one artifact
    fn load_from_disk(
        &self,
        name: &str,
        path: &Path,
    ) -> Result<(LoadedModel, ModelDescriptor, LoadReport)> {
        info!("Loading {} from {}", name, path.display());

        let raw = checkpoint::read_artifact(path, &Device::Cpu)?;
        let state = checkpoint::normalize(raw);

        let (num_classes, class_names, confident) = self.resolve_classes(name, &state);
        debug!("Using {} classes for {}: {:?}", num_classes, name, class_names);

        let variant = if self.registry.has_head_variants(name) {
            checkpoint::select_variant(&state, num_classes)
        } else {
            Variant::Default
        };
        if variant != Variant::Default {
            info!("Selected {} head variant for {}", variant, name);
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &self.device);
        let network = self.registry.build(name, num_classes, variant, vb)?;

        let mut report = bind_state_dict(&varmap, &state)?;
        report.low_confidence_classes = !confident;
        log_report(name, &report);

        let descriptor = ModelDescriptor {
            name: name.to_string(),
            num_classes,
            class_names,
            variant,
            artifact_path: path.to_path_buf(),
        };
        let model = LoadedModel {
            name: name.to_string(),
            network,
        };
        Ok((model, descriptor, report))
    }

    /// Class count and names for a load: inferred from the checkpoint when
    /// possible, otherwise the configured defaults.
    fn resolve_classes(&self, name: &str, state: &StateDict) -> (usize, Vec<String>, bool) {
        let defaults = self.known.iter().find(|k| k.name == name);
        let default_classes = defaults.map(|k| k.num_classes).unwrap_or(5);
        let default_names: Vec<String> = defaults
            .map(|k| k.class_names.iter().map(|s| s.to_string()).collect())
            .unwrap_or_default();

        match checkpoint::infer_class_count(state) {
            Some(guess) => {
                debug!(
                    "Detected {} classes for {} (confident: {})",
                    guess.num_classes, name, guess.confident
                );
                (
                    guess.num_classes,
                    class_names_for(guess.num_classes),
                    guess.confident,
                )
            }
            None => {
                warn!(
                    "Could not detect class count for {}; using default of {}",
                    name, default_classes
                );
                (default_classes, default_names, true)
            }
        }
    }
}

fn log_report(name: &str, report: &LoadReport) {
    if !report.missing_keys.is_empty() {
        warn!(
            "{}: {} parameter(s) missing from checkpoint",
            name,
            report.missing_keys.len()
        );
    }
    if !report.unexpected_keys.is_empty() {
        warn!(
            "{}: {} unexpected parameter(s) in checkpoint",
            name,
            report.unexpected_keys.len()
        );
    }
    for mismatch in &report.incompatible {
        warn!(
            "{}: skipped {} over shape conflict (checkpoint {:?} vs model {:?})",
            name, mismatch.key, mismatch.checkpoint, mismatch.target
        );
    }
    if report.low_confidence_classes {
        warn!("{}: class count came from a low-confidence fallback", name);
    }
}

/// Case-insensitive containment match between a registered name and a file
/// stem, in either direction, with a normalized form that drops separators
/// and the family token.
fn names_match(known: &str, candidate: &str) -> bool {
    let known_lower = known.to_lowercase();
    let candidate_lower = candidate.to_lowercase();

    if candidate_lower.contains(&known_lower) || known_lower.contains(&candidate_lower) {
        return true;
    }

    let known_norm = known_lower.replace("cnn", "").replace('_', "");
    let candidate_norm = candidate_lower.replace('_', "");
    !known_norm.is_empty() && candidate_norm.contains(&known_norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::known_models;
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tiny_known() -> Vec<KnownModel> {
        vec![KnownModel {
            name: "CustomCNN1",
            num_classes: 5,
            class_names: &crate::config::MULTI_CLASS_NAMES,
        }]
    }

    /// Registry whose CustomCNN1 is a minimal stand-in with a conv stem and
    /// a linear head, so tests exercise the pipeline without building the
    /// full network.
    fn tiny_registry(counter: Arc<AtomicUsize>) -> ArchitectureRegistry {
        use candle_nn::{conv2d_no_bias, linear, Conv2dConfig, Linear, Module};

        #[derive(Debug)]
        struct TinyNet {
            fc: Linear,
        }
        impl ClassifierNetwork for TinyNet {
            fn forward(&self, images: &Tensor) -> Result<Tensor> {
                let features = Tensor::zeros(
                    (images.dims()[0], 128),
                    DType::F32,
                    images.device(),
                )?;
                Ok(self.fc.forward(&features)?)
            }
        }

        let mut registry = ArchitectureRegistry::new();
        registry.register("CustomCNN1", false, move |num_classes, _, vb| {
            counter.fetch_add(1, Ordering::SeqCst);
            conv2d_no_bias(3, 32, 3, Conv2dConfig::default(), vb.pp("features").pp("0"))?;
            let fc = linear(128, num_classes, vb.pp("classifier").pp("4"))?;
            Ok(Box::new(TinyNet { fc }) as Box<dyn ClassifierNetwork>)
        });
        registry
    }

    fn write_artifact(dir: &Path, file: &str, entries: &[(&str, &[usize])]) -> PathBuf {
        let path = dir.join(file);
        let mut tensors = StdHashMap::new();
        for (key, dims) in entries {
            tensors.insert(
                key.to_string(),
                Tensor::zeros(*dims, DType::F32, &Device::Cpu).unwrap(),
            );
        }
        candle_core::safetensors::save(&tensors, &path).unwrap();
        path
    }

    #[test]
    fn test_discovery_matches_and_skips() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::write(temp.path().join("BinaryCNN_Light_best.pth"), b"").unwrap();
        std::fs::write(temp.path().join("unknown_model_v3.pth"), b"").unwrap();
        std::fs::write(temp.path().join("notes.txt"), b"").unwrap();

        let zoo = ModelZoo::new(
            Device::Cpu,
            ArchitectureRegistry::with_defaults(),
            known_models(),
        );
        let count = zoo.scan_directory(temp.path()).unwrap();

        assert_eq!(count, 1);
        assert_eq!(zoo.available(), vec!["BinaryCNN_Light".to_string()]);
        let descriptor = zoo.describe("BinaryCNN_Light").unwrap();
        assert_eq!(descriptor.num_classes, 2);
    }

    #[test]
    fn test_discovery_never_rebinds() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::write(temp.path().join("CustomCNN1_best.pth"), b"").unwrap();
        std::fs::write(temp.path().join("CustomCNN1_checkpoint.pth"), b"").unwrap();

        let zoo = ModelZoo::new(
            Device::Cpu,
            ArchitectureRegistry::with_defaults(),
            known_models(),
        );
        zoo.scan_directory(temp.path()).unwrap();

        let descriptor = zoo.describe("CustomCNN1").unwrap();
        // Entries are scanned in sorted order and the first match sticks
        assert!(descriptor
            .artifact_path
            .to_string_lossy()
            .ends_with("CustomCNN1_best.pth"));
    }

    #[test]
    fn test_get_or_load_unknown_name() {
        let zoo = ModelZoo::new(
            Device::Cpu,
            ArchitectureRegistry::with_defaults(),
            known_models(),
        );
        let err = zoo.get_or_load("CustomCNN1").unwrap_err();
        assert!(matches!(err, ServiceError::ModelNotFound { .. }));
    }

    #[test]
    fn test_failed_load_is_not_cached() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::write(temp.path().join("CustomCNN1_best.pth"), b"garbage").unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let zoo = ModelZoo::new(Device::Cpu, tiny_registry(counter), tiny_known());
        zoo.scan_directory(temp.path()).unwrap();

        assert!(matches!(
            zoo.get_or_load("CustomCNN1").unwrap_err(),
            ServiceError::ArtifactRead { .. }
        ));
        assert!(zoo.loaded_names().is_empty());
        // A later attempt starts over instead of observing a poisoned cache
        assert!(zoo.get_or_load("CustomCNN1").is_err());
    }

    #[test]
    fn test_single_flight_under_concurrent_first_requests() {
        let temp = tempfile::TempDir::new().unwrap();
        write_artifact(
            temp.path(),
            "CustomCNN1_best.safetensors",
            &[
                ("classifier.4.weight", &[5, 128]),
                ("classifier.4.bias", &[5]),
                ("features.0.weight", &[32, 3, 3, 3]),
            ],
        );

        let counter = Arc::new(AtomicUsize::new(0));
        let zoo = Arc::new(ModelZoo::new(
            Device::Cpu,
            tiny_registry(Arc::clone(&counter)),
            tiny_known(),
        ));
        zoo.scan_directory(temp.path()).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let zoo = Arc::clone(&zoo);
                std::thread::spawn(move || zoo.get_or_load("CustomCNN1").unwrap())
            })
            .collect();
        let models: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        // Exactly one construction ran and everyone shares the instance
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        for model in &models[1..] {
            assert!(Arc::ptr_eq(&models[0], model));
        }
    }

    #[test]
    fn test_load_updates_descriptor_and_report() {
        let temp = tempfile::TempDir::new().unwrap();
        write_artifact(
            temp.path(),
            "CustomCNN1_best.safetensors",
            &[
                ("state_dict.classifier.4.weight", &[5, 128]),
                ("state_dict.classifier.4.bias", &[5]),
                ("state_dict.features.0.weight", &[32, 3, 3, 3]),
            ],
        );

        let counter = Arc::new(AtomicUsize::new(0));
        let zoo = ModelZoo::new(Device::Cpu, tiny_registry(counter), tiny_known());
        zoo.scan_directory(temp.path()).unwrap();

        zoo.get_or_load("CustomCNN1").unwrap();

        let descriptor = zoo.describe("CustomCNN1").unwrap();
        assert_eq!(descriptor.num_classes, 5);
        assert_eq!(descriptor.class_names.len(), 5);

        let report = zoo.last_load_report("CustomCNN1").unwrap();
        assert!(report.is_clean());
        assert_eq!(report.bound, 3);
    }

    #[test]
    fn test_choose_for_analysis_preference() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::write(temp.path().join("BinaryCNN_Light_best.pth"), b"").unwrap();
        std::fs::write(temp.path().join("CustomCNN2_best.pth"), b"").unwrap();

        let zoo = ModelZoo::new(
            Device::Cpu,
            ArchitectureRegistry::with_defaults(),
            known_models(),
        );
        zoo.scan_directory(temp.path()).unwrap();

        assert_eq!(zoo.choose_for_analysis(None).unwrap(), "CustomCNN2");
        assert_eq!(
            zoo.choose_for_analysis(Some("BinaryCNN_Light")).unwrap(),
            "BinaryCNN_Light"
        );
        assert_eq!(
            zoo.choose_for_analysis(Some("NotDiscovered")).unwrap(),
            "CustomCNN2"
        );
    }

    #[test]
    fn test_names_match() {
        assert!(names_match("BinaryCNN_Light", "BinaryCNN_Light"));
        assert!(names_match("BinaryCNN_Light", "binarycnn_light"));
        assert!(names_match("CustomCNN1", "custom1"));
        assert!(!names_match("CustomCNN2", "unknown_model_v3"));
    }
}
