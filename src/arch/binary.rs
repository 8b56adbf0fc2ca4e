//! The binary health-screening families

use super::blocks::{
    conv_cfg, global_avg_pool, make_layer, max_pool_3x3_s2_p1, BasicBlock, MbConvTrunk, BN_EPS,
};
use super::ClassifierNetwork;
use crate::checkpoint::Variant;
use crate::error::Result;
use candle_core::Tensor;
use candle_nn::{batch_norm, conv2d, linear, BatchNorm, Conv2d, Linear, Module, ModuleT, VarBuilder};

/// Lightweight binary screen: four single-convolution blocks
#[derive(Debug)]
pub struct BinaryCnnLight {
    blocks: Vec<SingleConvBlock>,
    fc1: Linear,
    fc2: Linear,
}

#[derive(Debug)]
struct SingleConvBlock {
    conv: Conv2d,
    bn: BatchNorm,
}

impl BinaryCnnLight {
    pub fn new(num_classes: usize, vb: VarBuilder) -> Result<Self> {
        let features = vb.pp("features");
        let channels = [(3usize, 32usize), (32, 64), (64, 128), (128, 256)];

        let mut blocks = Vec::with_capacity(channels.len());
        for (i, (inc, outc)) in channels.iter().enumerate() {
            // Sequential layout per block: conv, bn, relu, pool
            let base = i * 4;
            blocks.push(SingleConvBlock {
                conv: conv2d(*inc, *outc, 3, conv_cfg(1, 1), features.pp(base.to_string()))?,
                bn: batch_norm(*outc, BN_EPS, features.pp((base + 1).to_string()))?,
            });
        }

        let classifier = vb.pp("classifier");
        let fc1 = linear(256, 128, classifier.pp("1"))?;
        let fc2 = linear(128, num_classes, classifier.pp("4"))?;

        Ok(Self { blocks, fc1, fc2 })
    }
}

impl ClassifierNetwork for BinaryCnnLight {
    fn forward(&self, images: &Tensor) -> Result<Tensor> {
        let mut x = images.clone();
        for block in &self.blocks {
            x = block.bn.forward_t(&block.conv.forward(&x)?, false)?.relu()?;
            x = x.max_pool2d(2)?;
        }
        let x = global_avg_pool(&x)?;
        let x = self.fc1.forward(&x)?.relu()?;
        Ok(self.fc2.forward(&x)?)
    }
}

/// Classifier head of the deep binary family.
///
/// The default layout is three linear layers; older checkpoints were trained
/// against a two-layer head, kept as the simple variant.
#[derive(Debug)]
enum DeepHead {
    Default { fc1: Linear, fc2: Linear, fc3: Linear },
    Simple { fc1: Linear, fc2: Linear },
}

/// Deep residual binary screen with a variant-selectable head
#[derive(Debug)]
pub struct BinaryCnnDeep {
    conv1: Conv2d,
    bn1: BatchNorm,
    layer1: Vec<BasicBlock>,
    layer2: Vec<BasicBlock>,
    layer3: Vec<BasicBlock>,
    layer4: Vec<BasicBlock>,
    head: DeepHead,
}

impl BinaryCnnDeep {
    pub fn new(num_classes: usize, variant: Variant, vb: VarBuilder) -> Result<Self> {
        let conv1 = conv2d(3, 64, 7, conv_cfg(2, 3), vb.pp("conv1"))?;
        let bn1 = batch_norm(64, BN_EPS, vb.pp("bn1"))?;

        let layer1 = make_layer(64, 64, 2, 1, vb.pp("layer1"))?;
        let layer2 = make_layer(64, 128, 2, 2, vb.pp("layer2"))?;
        let layer3 = make_layer(128, 256, 2, 2, vb.pp("layer3"))?;
        let layer4 = make_layer(256, 512, 2, 2, vb.pp("layer4"))?;

        let classifier = vb.pp("classifier");
        let head = match variant {
            Variant::Simple => DeepHead::Simple {
                fc1: linear(512, 128, classifier.pp("1"))?,
                fc2: linear(128, num_classes, classifier.pp("4"))?,
            },
            Variant::Default => DeepHead::Default {
                fc1: linear(512, 256, classifier.pp("1"))?,
                fc2: linear(256, 128, classifier.pp("4"))?,
                fc3: linear(128, num_classes, classifier.pp("7"))?,
            },
        };

        Ok(Self {
            conv1,
            bn1,
            layer1,
            layer2,
            layer3,
            layer4,
            head,
        })
    }
}

impl ClassifierNetwork for BinaryCnnDeep {
    fn forward(&self, images: &Tensor) -> Result<Tensor> {
        let x = self.bn1.forward_t(&self.conv1.forward(images)?, false)?.relu()?;
        let mut x = max_pool_3x3_s2_p1(&x)?;

        for layer in [&self.layer1, &self.layer2, &self.layer3, &self.layer4] {
            for block in layer {
                x = block.forward(&x)?;
            }
        }

        let x = global_avg_pool(&x)?;
        let logits = match &self.head {
            DeepHead::Simple { fc1, fc2 } => {
                let x = fc1.forward(&x)?.relu()?;
                fc2.forward(&x)?
            }
            DeepHead::Default { fc1, fc2, fc3 } => {
                let x = fc1.forward(&x)?.relu()?;
                let x = fc2.forward(&x)?.relu()?;
                fc3.forward(&x)?
            }
        };
        Ok(logits)
    }
}

/// EfficientNet-style binary screen: shares the MBConv trunk
#[derive(Debug)]
pub struct BinaryCnnEfficient {
    trunk: MbConvTrunk,
    fc: Linear,
}

impl BinaryCnnEfficient {
    pub fn new(num_classes: usize, vb: VarBuilder) -> Result<Self> {
        let trunk = MbConvTrunk::new(vb.clone())?;
        let fc = linear(1280, num_classes, vb.pp("head").pp("6"))?;
        Ok(Self { trunk, fc })
    }
}

impl ClassifierNetwork for BinaryCnnEfficient {
    fn forward(&self, images: &Tensor) -> Result<Tensor> {
        let x = self.trunk.forward(images)?;
        Ok(self.fc.forward(&x)?)
    }
}
