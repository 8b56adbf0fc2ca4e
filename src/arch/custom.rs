//! The five-class leaf disease families

use super::blocks::{
    conv_cfg, global_avg_pool, make_layer, max_pool_3x3_s2_p1, BasicBlock, MbConvTrunk, BN_EPS,
};
use super::ClassifierNetwork;
use crate::error::Result;
use candle_core::Tensor;
use candle_nn::{batch_norm, conv2d, linear, BatchNorm, Conv2d, Linear, Module, ModuleT, VarBuilder};

/// Lightweight double-convolution network.
///
/// Four blocks of two 3x3 convolutions each, global average pooling and a
/// two-layer classifier head ending at `classifier.4`.
#[derive(Debug)]
pub struct CustomCnn1 {
    blocks: Vec<DoubleConvBlock>,
    fc1: Linear,
    fc2: Linear,
}

#[derive(Debug)]
struct DoubleConvBlock {
    conv1: Conv2d,
    bn1: BatchNorm,
    conv2: Conv2d,
    bn2: BatchNorm,
}

impl CustomCnn1 {
    pub fn new(num_classes: usize, vb: VarBuilder) -> Result<Self> {
        let features = vb.pp("features");
        let channels = [(3usize, 32usize), (32, 64), (64, 128), (128, 256)];

        let mut blocks = Vec::with_capacity(channels.len());
        for (i, (inc, outc)) in channels.iter().enumerate() {
            // Sequential layout per block: conv, bn, relu, conv, bn, relu, pool
            let base = i * 7;
            blocks.push(DoubleConvBlock {
                conv1: conv2d(*inc, *outc, 3, conv_cfg(1, 1), features.pp(base.to_string()))?,
                bn1: batch_norm(*outc, BN_EPS, features.pp((base + 1).to_string()))?,
                conv2: conv2d(*outc, *outc, 3, conv_cfg(1, 1), features.pp((base + 3).to_string()))?,
                bn2: batch_norm(*outc, BN_EPS, features.pp((base + 4).to_string()))?,
            });
        }

        let classifier = vb.pp("classifier");
        let fc1 = linear(256, 128, classifier.pp("1"))?;
        let fc2 = linear(128, num_classes, classifier.pp("4"))?;

        Ok(Self { blocks, fc1, fc2 })
    }
}

impl ClassifierNetwork for CustomCnn1 {
    fn forward(&self, images: &Tensor) -> Result<Tensor> {
        let mut x = images.clone();
        for block in &self.blocks {
            x = block.bn1.forward_t(&block.conv1.forward(&x)?, false)?.relu()?;
            x = block.bn2.forward_t(&block.conv2.forward(&x)?, false)?.relu()?;
            x = x.max_pool2d(2)?;
        }
        let x = global_avg_pool(&x)?;
        let x = self.fc1.forward(&x)?.relu()?;
        Ok(self.fc2.forward(&x)?)
    }
}

/// Deeper residual network with a three-layer classifier head ending at
/// `classifier.7`.
#[derive(Debug)]
pub struct CustomCnn2 {
    conv1: Conv2d,
    bn1: BatchNorm,
    layer1: Vec<BasicBlock>,
    layer2: Vec<BasicBlock>,
    layer3: Vec<BasicBlock>,
    layer4: Vec<BasicBlock>,
    fc1: Linear,
    fc2: Linear,
    fc3: Linear,
}

impl CustomCnn2 {
    pub fn new(num_classes: usize, vb: VarBuilder) -> Result<Self> {
        let conv1 = conv2d(3, 64, 7, conv_cfg(2, 3), vb.pp("conv1"))?;
        let bn1 = batch_norm(64, BN_EPS, vb.pp("bn1"))?;

        let layer1 = make_layer(64, 64, 2, 1, vb.pp("layer1"))?;
        let layer2 = make_layer(64, 128, 2, 2, vb.pp("layer2"))?;
        let layer3 = make_layer(128, 256, 2, 2, vb.pp("layer3"))?;
        let layer4 = make_layer(256, 512, 2, 2, vb.pp("layer4"))?;

        let classifier = vb.pp("classifier");
        let fc1 = linear(512, 256, classifier.pp("1"))?;
        let fc2 = linear(256, 128, classifier.pp("4"))?;
        let fc3 = linear(128, num_classes, classifier.pp("7"))?;

        Ok(Self {
            conv1,
            bn1,
            layer1,
            layer2,
            layer3,
            layer4,
            fc1,
            fc2,
            fc3,
        })
    }
}

impl ClassifierNetwork for CustomCnn2 {
    fn forward(&self, images: &Tensor) -> Result<Tensor> {
        let x = self.bn1.forward_t(&self.conv1.forward(images)?, false)?.relu()?;
        let mut x = max_pool_3x3_s2_p1(&x)?;

        for layer in [&self.layer1, &self.layer2, &self.layer3, &self.layer4] {
            for block in layer {
                x = block.forward(&x)?;
            }
        }

        let x = global_avg_pool(&x)?;
        let x = self.fc1.forward(&x)?.relu()?;
        let x = self.fc2.forward(&x)?.relu()?;
        Ok(self.fc3.forward(&x)?)
    }
}

/// EfficientNet-style network: MBConv trunk and a single linear at `head.6`
#[derive(Debug)]
pub struct CustomCnn3 {
    trunk: MbConvTrunk,
    fc: Linear,
}

impl CustomCnn3 {
    pub fn new(num_classes: usize, vb: VarBuilder) -> Result<Self> {
        let trunk = MbConvTrunk::new(vb.clone())?;
        let fc = linear(1280, num_classes, vb.pp("head").pp("6"))?;
        Ok(Self { trunk, fc })
    }
}

impl ClassifierNetwork for CustomCnn3 {
    fn forward(&self, images: &Tensor) -> Result<Tensor> {
        let x = self.trunk.forward(images)?;
        Ok(self.fc.forward(&x)?)
    }
}
