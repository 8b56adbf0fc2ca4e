//! Strict-relaxed weight binding
//!
//! Binding assigns every checkpoint parameter whose key and shape match a
//! variable of the freshly built network. Mismatches of any kind are
//! recoverable: keys the network owns but the checkpoint lacks keep their
//! constructor initialization, keys the checkpoint carries but the network
//! lacks are ignored, and same-key shape conflicts are skipped. All three
//! conditions are reported as data so callers can log drift between an
//! architecture and the artifact it was trained from.

use crate::checkpoint::StateDict;
use crate::error::Result;
use candle_nn::VarMap;
use serde::Serialize;
use std::collections::BTreeSet;

/// A same-key parameter whose checkpoint and network shapes disagree
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShapeMismatch {
    pub key: String,
    pub checkpoint: Vec<usize>,
    pub target: Vec<usize>,
}

/// Outcome of one binding pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    /// Network parameters absent from the checkpoint
    pub missing_keys: BTreeSet<String>,
    /// Checkpoint parameters absent from the network
    pub unexpected_keys: BTreeSet<String>,
    /// Same-key parameters skipped over a shape conflict
    pub incompatible: Vec<ShapeMismatch>,
    /// Set when the class count came from the out-of-range fallback
    pub low_confidence_classes: bool,
    /// Parameters actually assigned
    pub bound: usize,
}

impl LoadReport {
    /// True when every network parameter was bound from the checkpoint
    pub fn is_clean(&self) -> bool {
        self.missing_keys.is_empty()
            && self.unexpected_keys.is_empty()
            && self.incompatible.is_empty()
    }
}

/// Bind a normalized state dict onto the variables of an instantiated
/// network. Never fails over key or shape mismatches; only tensor transport
/// errors (device or dtype conversion) propagate.
pub fn bind_state_dict(varmap: &VarMap, state: &StateDict) -> Result<LoadReport> {
    let mut report = LoadReport::default();

    let vars = varmap.data().lock().unwrap();
    for (name, var) in vars.iter() {
        match state.get(name) {
            None => {
                report.missing_keys.insert(name.clone());
            }
            Some(tensor) if tensor.dims() != var.dims() => {
                report.incompatible.push(ShapeMismatch {
                    key: name.clone(),
                    checkpoint: tensor.dims().to_vec(),
                    target: var.dims().to_vec(),
                });
            }
            Some(tensor) => {
                let value = tensor.to_device(var.device())?.to_dtype(var.dtype())?;
                var.set(&value)?;
                report.bound += 1;
            }
        }
    }

    for key in state.keys() {
        if !vars.contains_key(key) {
            report.unexpected_keys.insert(key.clone());
        }
    }

    report.incompatible.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(report)
}
