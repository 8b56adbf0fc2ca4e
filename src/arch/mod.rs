//! Network architectures for leaf disease classification
//!
//! Every family here reproduces the parameter naming of the checkpoints it
//! is loaded from (`features.0.weight`, `classifier.4.weight`,
//! `layer1.0.conv1.weight`, ...), so that weight binding can match keys
//! directly. Constructors are pure: given a class count, a head variant and
//! a `VarBuilder` they produce a freshly initialized network and never touch
//! disk.

mod binary;
mod blocks;
mod custom;

pub use binary::{BinaryCnnDeep, BinaryCnnEfficient, BinaryCnnLight};
pub use custom::{CustomCnn1, CustomCnn2, CustomCnn3};

use crate::checkpoint::Variant;
use crate::error::{Result, ServiceError};
use candle_core::Tensor;
use candle_nn::VarBuilder;
use std::collections::HashMap;
use std::sync::Arc;

/// An instantiated image classification network
pub trait ClassifierNetwork: Send + Sync + std::fmt::Debug {
    /// Forward a batch of preprocessed images, returning raw logits
    fn forward(&self, images: &Tensor) -> Result<Tensor>;
}

/// Constructor signature shared by all registered families
pub type Constructor = Arc<
    dyn for<'a> Fn(usize, Variant, VarBuilder<'a>) -> Result<Box<dyn ClassifierNetwork>>
        + Send
        + Sync,
>;

struct Entry {
    constructor: Constructor,
    /// Whether the family declares more than one classifier-head layout
    multi_head: bool,
}

/// Table mapping a symbolic family name to its constructor
pub struct ArchitectureRegistry {
    table: HashMap<String, Entry>,
}

impl ArchitectureRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    /// Registry preloaded with the built-in families
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("CustomCNN1", false, |n, _, vb| {
            Ok(Box::new(CustomCnn1::new(n, vb)?) as Box<dyn ClassifierNetwork>)
        });
        registry.register("CustomCNN2", false, |n, _, vb| {
            Ok(Box::new(CustomCnn2::new(n, vb)?) as Box<dyn ClassifierNetwork>)
        });
        registry.register("CustomCNN3", false, |n, _, vb| {
            Ok(Box::new(CustomCnn3::new(n, vb)?) as Box<dyn ClassifierNetwork>)
        });
        registry.register("BinaryCNN_Light", false, |n, _, vb| {
            Ok(Box::new(BinaryCnnLight::new(n, vb)?) as Box<dyn ClassifierNetwork>)
        });
        registry.register("BinaryCNN_Deep", true, |n, variant, vb| {
            Ok(Box::new(BinaryCnnDeep::new(n, variant, vb)?) as Box<dyn ClassifierNetwork>)
        });
        registry.register("BinaryCNN_Efficient", false, |n, _, vb| {
            Ok(Box::new(BinaryCnnEfficient::new(n, vb)?) as Box<dyn ClassifierNetwork>)
        });
        registry
    }

    /// Register a constructor for a symbolic name
    pub fn register<F>(&mut self, name: &str, multi_head: bool, constructor: F)
    where
        F: for<'a> Fn(usize, Variant, VarBuilder<'a>) -> Result<Box<dyn ClassifierNetwork>>
            + Send
            + Sync
            + 'static,
    {
        self.table.insert(
            name.to_string(),
            Entry {
                constructor: Arc::new(constructor),
                multi_head,
            },
        );
    }

    /// Build an uninitialized instance of a registered family
    pub fn build(
        &self,
        name: &str,
        num_classes: usize,
        variant: Variant,
        vb: VarBuilder,
    ) -> Result<Box<dyn ClassifierNetwork>> {
        let entry = self
            .table
            .get(name)
            .ok_or_else(|| ServiceError::unknown_architecture(name))?;
        (entry.constructor)(num_classes, variant, vb)
    }

    /// Whether the family declares more than one classifier-head layout
    pub fn has_head_variants(&self, name: &str) -> bool {
        self.table.get(name).map(|e| e.multi_head).unwrap_or(false)
    }

    /// Whether a constructor is registered for the name
    pub fn contains(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }
}

impl Default for ArchitectureRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn builder(varmap: &VarMap) -> VarBuilder<'_> {
        VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu)
    }

    #[test]
    fn test_registry_defaults() {
        let registry = ArchitectureRegistry::with_defaults();
        assert!(registry.contains("CustomCNN1"));
        assert!(registry.contains("BinaryCNN_Efficient"));
        assert!(!registry.contains("ShuffleNet"));

        assert!(registry.has_head_variants("BinaryCNN_Deep"));
        assert!(!registry.has_head_variants("BinaryCNN_Light"));
    }

    #[test]
    fn test_unknown_architecture() {
        let registry = ArchitectureRegistry::with_defaults();
        let varmap = VarMap::new();

        let err = registry
            .build("ResNet50", 5, Variant::Default, builder(&varmap))
            .unwrap_err();
        assert!(matches!(err, ServiceError::UnknownArchitecture { .. }));
    }

    #[test]
    fn test_parameter_naming_matches_checkpoint_layout() {
        let registry = ArchitectureRegistry::with_defaults();
        let varmap = VarMap::new();
        registry
            .build("CustomCNN1", 5, Variant::Default, builder(&varmap))
            .unwrap();

        let vars = varmap.data().lock().unwrap();
        assert!(vars.contains_key("features.0.weight"));
        assert!(vars.contains_key("features.1.running_mean"));
        assert!(vars.contains_key("classifier.1.weight"));
        assert_eq!(vars["classifier.4.weight"].dims(), &[5, 128]);
    }

    #[test]
    fn test_deep_variant_head_shapes() {
        let registry = ArchitectureRegistry::with_defaults();

        let varmap = VarMap::new();
        registry
            .build("BinaryCNN_Deep", 2, Variant::Simple, builder(&varmap))
            .unwrap();
        {
            let vars = varmap.data().lock().unwrap();
            assert_eq!(vars["classifier.1.weight"].dims(), &[128, 512]);
            assert_eq!(vars["classifier.4.weight"].dims(), &[2, 128]);
            assert!(!vars.contains_key("classifier.7.weight"));
        }

        let varmap = VarMap::new();
        registry
            .build("BinaryCNN_Deep", 2, Variant::Default, builder(&varmap))
            .unwrap();
        let vars = varmap.data().lock().unwrap();
        assert_eq!(vars["classifier.1.weight"].dims(), &[256, 512]);
        assert_eq!(vars["classifier.7.weight"].dims(), &[2, 128]);
    }

    #[test]
    fn test_forward_shapes() {
        let registry = ArchitectureRegistry::with_defaults();
        let input = Tensor::zeros((1, 3, 224, 224), DType::F32, &Device::Cpu).unwrap();

        for (name, classes) in [("CustomCNN1", 5), ("BinaryCNN_Light", 2)] {
            let varmap = VarMap::new();
            let net = registry
                .build(name, classes, Variant::Default, builder(&varmap))
                .unwrap();
            let logits = net.forward(&input).unwrap();
            assert_eq!(logits.dims(), &[1, classes]);
        }
    }
}
