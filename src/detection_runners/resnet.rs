//! Bottleneck ResNet parameter layout and evaluation.
//!
//! A network is a chain with `conv1` (7x7, stride 2, with bias), `bn1` and the
//! residual stages `res2..res5`. Each stage is a chain with a projection block
//! `a` followed by identity blocks `b1`, `b2`, ... Projection blocks hold
//! `conv1..conv4`/`bn1..bn4` (`conv4` is the shortcut), identity blocks
//! `conv1..conv3`/`bn1..bn3`. Convolutions inside blocks carry no bias.

use ndarray::{Array1, Array2, Array4, ArrayD, ArrayView4, Axis, Ix1, Ix2, Ix4, IxDyn};
use rand::rngs::StdRng;

use crate::common::{BackboneSpec, Composite, DetectorError, DetectorResult, Stage};
use crate::detection_runners::backend::Backend;
use crate::detection_runners::initializer::Initializer;

pub const BN_EPS: f32 = 2e-5;
/// Output width of the classification layer of an ImageNet network.
pub const IMAGENET_CLASSES: usize = 1000;

pub fn conv_link(
    out_ch: usize,
    in_ch: usize,
    ksize: usize,
    bias: bool,
    init: Initializer,
    rng: &mut StdRng,
) -> Composite {
    let link = Composite::link().with_param("W", init.generate(&[out_ch, in_ch, ksize, ksize], rng));
    if bias {
        link.with_param("b", ArrayD::zeros(IxDyn(&[out_ch])))
    } else {
        link
    }
}

pub fn bn_link(channels: usize) -> Composite {
    Composite::link()
        .with_param("gamma", ArrayD::ones(IxDyn(&[channels])))
        .with_param("beta", ArrayD::zeros(IxDyn(&[channels])))
        .with_persistent("avg_mean", ArrayD::zeros(IxDyn(&[channels])))
        .with_persistent("avg_var", ArrayD::ones(IxDyn(&[channels])))
        .with_scalar("N", 0)
}

pub fn linear_link(out_features: usize, in_features: usize, init: Initializer, rng: &mut StdRng) -> Composite {
    Composite::link()
        .with_param("W", init.generate(&[out_features, in_features], rng))
        .with_param("b", ArrayD::zeros(IxDyn(&[out_features])))
}

fn bottleneck_a(in_ch: usize, mid: usize, out_ch: usize, init: Initializer, rng: &mut StdRng) -> Composite {
    Composite::chain()
        .with_child("conv1", conv_link(mid, in_ch, 1, false, init, rng))
        .with_child("bn1", bn_link(mid))
        .with_child("conv2", conv_link(mid, mid, 3, false, init, rng))
        .with_child("bn2", bn_link(mid))
        .with_child("conv3", conv_link(out_ch, mid, 1, false, init, rng))
        .with_child("bn3", bn_link(out_ch))
        .with_child("conv4", conv_link(out_ch, in_ch, 1, false, init, rng))
        .with_child("bn4", bn_link(out_ch))
}

fn bottleneck_b(channels: usize, mid: usize, init: Initializer, rng: &mut StdRng) -> Composite {
    Composite::chain()
        .with_child("conv1", conv_link(mid, channels, 1, false, init, rng))
        .with_child("bn1", bn_link(mid))
        .with_child("conv2", conv_link(mid, mid, 3, false, init, rng))
        .with_child("bn2", bn_link(mid))
        .with_child("conv3", conv_link(channels, mid, 1, false, init, rng))
        .with_child("bn3", bn_link(channels))
}

pub fn building_block(spec: &BackboneSpec, stage: Stage, init: Initializer, rng: &mut StdRng) -> Composite {
    let (in_ch, mid, out_ch) = spec.stage_channels(stage);
    let mut block = Composite::chain().with_child("a", bottleneck_a(in_ch, mid, out_ch, init, rng));
    for i in 1..spec.stage_blocks(stage) {
        block = block.with_child(&format!("b{i}"), bottleneck_b(out_ch, mid, init, rng));
    }
    block
}

/// `conv1`, `bn1` and `res2..res4`: everything up to the detector's feature map.
pub fn build_extractor(spec: &BackboneSpec, init: Initializer, rng: &mut StdRng) -> Composite {
    let mut tree = Composite::chain()
        .with_child("conv1", conv_link(spec.conv1_channels(), 3, 7, true, init, rng))
        .with_child("bn1", bn_link(spec.conv1_channels()));
    for stage in [Stage::Res2, Stage::Res3, Stage::Res4] {
        tree = tree.with_child(stage.name(), building_block(spec, stage, init, rng));
    }
    tree
}

/// A complete classification network: the extractor, `res5` and `fc6`.
pub fn build_classifier(spec: &BackboneSpec, rng: &mut StdRng) -> Composite {
    build_extractor(spec, Initializer::HeNormal, rng)
        .with_child(Stage::Res5.name(), building_block(spec, Stage::Res5, Initializer::HeNormal, rng))
        .with_child(
            "fc6",
            linear_link(IMAGENET_CLASSES, spec.head_channels(), Initializer::HeNormal, rng),
        )
}

fn leaf<'a>(node: &'a Composite, name: &str) -> DetectorResult<&'a ArrayD<f32>> {
    node.array(name)
        .ok_or_else(|| DetectorError::mismatch(name, "missing parameter"))
}

fn sub<'a>(node: &'a Composite, name: &str) -> DetectorResult<&'a Composite> {
    node.child(name)
        .ok_or_else(|| DetectorError::mismatch(name, "missing sub-module"))
}

/// Applies a convolution link. Padding keeps odd kernels centered.
pub fn conv(backend: &dyn Backend, link: &Composite, x: ArrayView4<f32>, stride: usize) -> DetectorResult<Array4<f32>> {
    let w = leaf(link, "W")?.view().into_dimensionality::<Ix4>()?;
    let b = match link.array("b") {
        Some(b) => Some(b.view().into_dimensionality::<Ix1>()?),
        None => None,
    };
    let pad = w.dim().2 / 2;
    backend.conv2d(x, w, b, stride, pad)
}

/// Applies a linear link to `(batch, features)` rows.
pub fn linear(backend: &dyn Backend, link: &Composite, x: &Array2<f32>) -> DetectorResult<Array2<f32>> {
    let w = leaf(link, "W")?.view().into_dimensionality::<Ix2>()?;
    let b = leaf(link, "b")?.view().into_dimensionality::<Ix1>()?;
    backend.linear(x.view(), w, Some(b))
}

/// Batch normalization; `training` normalizes with the statistics of `x`
/// instead of the stored running averages.
fn bn(backend: &dyn Backend, link: &Composite, x: &Array4<f32>, training: bool) -> DetectorResult<Array4<f32>> {
    let gamma = leaf(link, "gamma")?.view().into_dimensionality::<Ix1>()?;
    let beta = leaf(link, "beta")?.view().into_dimensionality::<Ix1>()?;
    if training {
        let channels = x.dim().1;
        let mean = Array1::from_iter(
            (0..channels).map(|c| x.index_axis(Axis(1), c).mean().unwrap_or(0.)),
        );
        let var = Array1::from_iter((0..channels).map(|c| {
            let m = mean[c];
            x.index_axis(Axis(1), c).mapv(|v| (v - m) * (v - m)).mean().unwrap_or(0.)
        }));
        backend.batch_norm(x.view(), gamma, beta, mean.view(), var.view(), BN_EPS)
    } else {
        let mean = leaf(link, "avg_mean")?.view().into_dimensionality::<Ix1>()?;
        let var = leaf(link, "avg_var")?.view().into_dimensionality::<Ix1>()?;
        backend.batch_norm(x.view(), gamma, beta, mean, var, BN_EPS)
    }
}

fn conv_bn(
    backend: &dyn Backend,
    block: &Composite,
    index: usize,
    x: ArrayView4<f32>,
    stride: usize,
    training: bool,
) -> DetectorResult<Array4<f32>> {
    let h = conv(backend, sub(block, &format!("conv{index}"))?, x, stride)?;
    bn(backend, sub(block, &format!("bn{index}"))?, &h, training)
}

fn bottleneck(
    backend: &dyn Backend,
    block: &Composite,
    x: ArrayView4<f32>,
    stride: usize,
    training: bool,
) -> DetectorResult<Array4<f32>> {
    let h = backend.relu(conv_bn(backend, block, 1, x, stride, training)?);
    let h = backend.relu(conv_bn(backend, block, 2, h.view(), 1, training)?);
    let mut h = conv_bn(backend, block, 3, h.view(), 1, training)?;
    if block.contains("conv4") {
        h += &conv_bn(backend, block, 4, x, stride, training)?;
    } else {
        h += &x;
    }
    Ok(backend.relu(h))
}

/// Runs one residual stage; only the projection block is strided.
pub fn run_block(
    backend: &dyn Backend,
    stage: &Composite,
    x: ArrayView4<f32>,
    stride: usize,
    training: bool,
) -> DetectorResult<Array4<f32>> {
    let mut h = bottleneck(backend, sub(stage, "a")?, x, stride, training)?;
    for i in 1.. {
        match stage.child(&format!("b{i}")) {
            Some(block) => h = bottleneck(backend, block, h.view(), 1, training)?,
            None => break,
        }
    }
    Ok(h)
}

fn stage_stride(stage: Stage) -> usize {
    match stage {
        Stage::Conv1 | Stage::Res3 | Stage::Res4 | Stage::Res5 => 2,
        Stage::Res2 => 1,
    }
}

/// Evaluates `network` on a `(batch, 3, H, W)` input and returns the activation
/// after `output_stage`. The detector calls this with `training = false`.
pub fn invoke(
    backend: &dyn Backend,
    network: &Composite,
    x: ArrayView4<f32>,
    output_stage: Stage,
    training: bool,
) -> DetectorResult<Array4<f32>> {
    let h = conv(backend, sub(network, "conv1")?, x, stage_stride(Stage::Conv1))?;
    let h = backend.relu(bn(backend, sub(network, "bn1")?, &h, training)?);
    let mut h = backend.max_pool2d(h.view(), 3, 2, 0);
    for stage in Stage::residual().into_iter().take_while(|s| *s <= output_stage) {
        h = run_block(backend, sub(network, stage.name())?, h.view(), stage_stride(stage), training)?;
    }
    Ok(h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection_runners::backend::NdArrayBackend;
    use rand::SeedableRng;

    fn tiny() -> BackboneSpec {
        BackboneSpec::new("tiny", [1, 2, 1, 1], 4)
    }

    #[test]
    fn extractor_layout() {
        let tree = build_extractor(&tiny(), Initializer::HeNormal, &mut StdRng::seed_from_u64(0));
        assert_eq!(tree.child_names(), vec!["bn1", "conv1", "res2", "res3", "res4"]);
        let res3 = tree.child("res3").unwrap();
        assert_eq!(res3.child_names(), vec!["a", "b1"]);
        assert_eq!(res3.at("a/conv4/W").map(|n| n.kind_name()), Some("array"));
        assert!(res3.at("b1/conv4").is_none());
        assert!(tree.at("conv1/b").is_some());
    }

    #[test]
    fn res4_features_have_stride_sixteen() {
        let spec = tiny();
        let tree = build_extractor(&spec, Initializer::HeNormal, &mut StdRng::seed_from_u64(0));
        let x = Array4::<f32>::ones((1, 3, 64, 48));
        let h = invoke(&NdArrayBackend::default(), &tree, x.view(), Stage::Res4, false).unwrap();
        assert_eq!(h.dim(), (1, spec.feature_channels(), 4, 3));
    }

    #[test]
    fn missing_stage_is_a_structural_error() {
        let mut tree = build_extractor(&tiny(), Initializer::HeNormal, &mut StdRng::seed_from_u64(0));
        tree.remove("res3");
        let x = Array4::<f32>::ones((1, 3, 32, 32));
        let err = invoke(&NdArrayBackend::default(), &tree, x.view(), Stage::Res4, false).unwrap_err();
        assert!(matches!(err, DetectorError::StructuralMismatch { .. }));
    }
}
