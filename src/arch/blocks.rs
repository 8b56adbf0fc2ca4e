//! Building blocks shared between architecture families

use candle_core::{Result, Tensor, D};
use candle_nn::{
    batch_norm, conv2d, conv2d_no_bias, BatchNorm, Conv2d, Conv2dConfig, Module, ModuleT,
    VarBuilder,
};

pub(crate) const BN_EPS: f64 = 1e-5;

/// 3x3 convolution config with the given stride and padding
pub(crate) fn conv_cfg(stride: usize, padding: usize) -> Conv2dConfig {
    Conv2dConfig {
        padding,
        stride,
        ..Default::default()
    }
}

/// Global average pooling to a `(batch, channels)` tensor
pub(crate) fn global_avg_pool(x: &Tensor) -> Result<Tensor> {
    x.mean(D::Minus1)?.mean(D::Minus1)
}

/// 3x3/stride-2 max pooling with one pixel of padding.
///
/// Inputs are post-ReLU and therefore non-negative, so zero padding does not
/// disturb boundary maxima.
pub(crate) fn max_pool_3x3_s2_p1(x: &Tensor) -> Result<Tensor> {
    x.pad_with_zeros(2, 1, 1)?
        .pad_with_zeros(3, 1, 1)?
        .max_pool2d_with_stride(3, 2)
}

/// Basic residual block: two 3x3 convolutions with a projection shortcut
/// when the spatial size or channel count changes.
#[derive(Debug)]
pub(crate) struct BasicBlock {
    conv1: Conv2d,
    bn1: BatchNorm,
    conv2: Conv2d,
    bn2: BatchNorm,
    shortcut: Option<(Conv2d, BatchNorm)>,
}

impl BasicBlock {
    pub(crate) fn new(
        inplanes: usize,
        planes: usize,
        stride: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let conv1 = conv2d_no_bias(inplanes, planes, 3, conv_cfg(stride, 1), vb.pp("conv1"))?;
        let bn1 = batch_norm(planes, BN_EPS, vb.pp("bn1"))?;
        let conv2 = conv2d_no_bias(planes, planes, 3, conv_cfg(1, 1), vb.pp("conv2"))?;
        let bn2 = batch_norm(planes, BN_EPS, vb.pp("bn2"))?;

        let shortcut = if stride != 1 || inplanes != planes {
            let vb = vb.pp("shortcut");
            let conv = conv2d_no_bias(inplanes, planes, 1, conv_cfg(stride, 0), vb.pp("0"))?;
            let bn = batch_norm(planes, BN_EPS, vb.pp("1"))?;
            Some((conv, bn))
        } else {
            None
        };

        Ok(Self {
            conv1,
            bn1,
            conv2,
            bn2,
            shortcut,
        })
    }

    pub(crate) fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let out = self.bn1.forward_t(&self.conv1.forward(x)?, false)?.relu()?;
        let out = self.bn2.forward_t(&self.conv2.forward(&out)?, false)?;

        let residual = match &self.shortcut {
            Some((conv, bn)) => bn.forward_t(&conv.forward(x)?, false)?,
            None => x.clone(),
        };

        (out + residual)?.relu()
    }
}

/// A stack of residual blocks; the first carries the stride
pub(crate) fn make_layer(
    inplanes: usize,
    planes: usize,
    blocks: usize,
    stride: usize,
    vb: VarBuilder,
) -> Result<Vec<BasicBlock>> {
    let mut layers = Vec::with_capacity(blocks);
    layers.push(BasicBlock::new(inplanes, planes, stride, vb.pp("0"))?);
    for i in 1..blocks {
        layers.push(BasicBlock::new(planes, planes, 1, vb.pp(i.to_string()))?);
    }
    Ok(layers)
}

/// Mobile inverted bottleneck convolution
#[derive(Debug)]
pub(crate) struct MbConv {
    expand: Conv2d,
    expand_bn: BatchNorm,
    depthwise: Conv2d,
    depthwise_bn: BatchNorm,
    project: Conv2d,
    project_bn: BatchNorm,
    use_residual: bool,
}

impl MbConv {
    pub(crate) fn new(
        in_channels: usize,
        out_channels: usize,
        expansion_factor: usize,
        stride: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let expanded = in_channels * expansion_factor;

        let expand = conv2d_no_bias(in_channels, expanded, 1, conv_cfg(1, 0), vb.pp("expand"))?;
        let expand_bn = batch_norm(expanded, BN_EPS, vb.pp("expand_bn"))?;

        let depthwise_cfg = Conv2dConfig {
            padding: 1,
            stride,
            groups: expanded,
            ..Default::default()
        };
        let depthwise = conv2d_no_bias(expanded, expanded, 3, depthwise_cfg, vb.pp("depthwise"))?;
        let depthwise_bn = batch_norm(expanded, BN_EPS, vb.pp("depthwise_bn"))?;

        let project = conv2d_no_bias(expanded, out_channels, 1, conv_cfg(1, 0), vb.pp("project"))?;
        let project_bn = batch_norm(out_channels, BN_EPS, vb.pp("project_bn"))?;

        Ok(Self {
            expand,
            expand_bn,
            depthwise,
            depthwise_bn,
            project,
            project_bn,
            use_residual: stride == 1 && in_channels == out_channels,
        })
    }

    pub(crate) fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let out = self
            .expand_bn
            .forward_t(&self.expand.forward(x)?, false)?
            .relu()?;
        let out = self
            .depthwise_bn
            .forward_t(&self.depthwise.forward(&out)?, false)?
            .relu()?;
        let out = self.project_bn.forward_t(&self.project.forward(&out)?, false)?;

        if self.use_residual {
            out + x
        } else {
            Ok(out)
        }
    }
}

/// Channel progression of the MBConv trunk shared by the EfficientNet-style
/// families: (in, out, expansion, stride)
pub(crate) const MBCONV_STAGES: [(usize, usize, usize, usize); 7] = [
    (32, 16, 1, 1),
    (16, 24, 6, 2),
    (24, 40, 6, 2),
    (40, 80, 6, 2),
    (80, 112, 6, 1),
    (112, 192, 6, 2),
    (192, 320, 6, 1),
];

/// Stem plus MBConv trunk plus 1x1 head convolution, used by both
/// EfficientNet-style families.
#[derive(Debug)]
pub(crate) struct MbConvTrunk {
    stem_conv: Conv2d,
    stem_bn: BatchNorm,
    blocks: Vec<MbConv>,
    head_conv: Conv2d,
    head_bn: BatchNorm,
}

impl MbConvTrunk {
    pub(crate) fn new(vb: VarBuilder) -> Result<Self> {
        let stem = vb.pp("stem");
        let stem_conv = conv2d(3, 32, 3, conv_cfg(2, 1), stem.pp("0"))?;
        let stem_bn = batch_norm(32, BN_EPS, stem.pp("1"))?;

        let blocks_vb = vb.pp("blocks");
        let mut blocks = Vec::with_capacity(MBCONV_STAGES.len());
        for (i, (inc, outc, expansion, stride)) in MBCONV_STAGES.iter().enumerate() {
            blocks.push(MbConv::new(
                *inc,
                *outc,
                *expansion,
                *stride,
                blocks_vb.pp(i.to_string()),
            )?);
        }

        let head = vb.pp("head");
        let head_conv = conv2d(320, 1280, 1, conv_cfg(1, 0), head.pp("0"))?;
        let head_bn = batch_norm(1280, BN_EPS, head.pp("1"))?;

        Ok(Self {
            stem_conv,
            stem_bn,
            blocks,
            head_conv,
            head_bn,
        })
    }

    /// Produce the pooled 1280-wide feature vector
    pub(crate) fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut out = self
            .stem_bn
            .forward_t(&self.stem_conv.forward(x)?, false)?
            .relu()?;
        for block in &self.blocks {
            out = block.forward(&out)?;
        }
        let out = self
            .head_bn
            .forward_t(&self.head_conv.forward(&out)?, false)?
            .relu()?;
        global_avg_pool(&out)
    }
}
