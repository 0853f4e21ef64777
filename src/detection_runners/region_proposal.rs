//! Region-proposal stage.
//!
//! The detector owns the stage's three convolutions (`conv1`, `score`, `loc`)
//! and evaluates them; turning their outputs into proposals is delegated to a
//! [`RegionProposer`]. `AnchorProposer` is the usual anchor/decode/NMS pipeline,
//! `FixedProposer` replays caller-supplied boxes.

use ndarray::{s, Array2, Array4, ArrayView4};
use rand::rngs::StdRng;

use crate::common::{BBox, Composite, DetectorError, DetectorResult, Proposal};
use crate::data::ProposalParams;
use crate::detection_runners::backend::Backend;
use crate::detection_runners::initializer::Initializer;
use crate::detection_runners::nms::{nms, Nms};
use crate::detection_runners::resnet::{conv, conv_link};

/// Everything a proposer may look at for one forward pass.
#[derive(Debug)]
pub struct ProposalContext<'a> {
    /// `(N, A * 4, H, W)` box offsets per anchor.
    pub rpn_locs: ArrayView4<'a, f32>,
    /// `(N, A * 2, H, W)` background/foreground logits per anchor.
    pub rpn_scores: ArrayView4<'a, f32>,
    /// `(height, width)` of the prepared input.
    pub image_size: (usize, usize),
    pub scale: f32,
    pub ratios: &'a [f32],
    pub anchor_scales: &'a [f32],
    pub feat_stride: usize,
    pub params: &'a ProposalParams,
    pub training: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ProposalSet {
    pub proposals: Vec<Proposal>,
    /// `(H * W * A, 4)` anchors, when the proposer produces them.
    pub anchors: Option<Array2<f32>>,
}

pub trait RegionProposer: std::fmt::Debug + Send {
    fn propose(&mut self, ctx: &ProposalContext) -> DetectorResult<ProposalSet>;
}

/// Raw outputs of the proposal stage together with its proposals.
#[derive(Debug, Clone)]
pub struct RpnOutput {
    pub rpn_locs: Array4<f32>,
    pub rpn_scores: Array4<f32>,
    pub proposals: Vec<Proposal>,
    pub anchors: Option<Array2<f32>>,
}

/// Parameters of the stage: a 3x3 convolution followed by two 1x1 projections.
pub fn build_rpn(in_ch: usize, mid_ch: usize, n_anchor: usize, rng: &mut StdRng) -> Composite {
    let init = Initializer::Normal(0.01);
    Composite::chain()
        .with_child("conv1", conv_link(mid_ch, in_ch, 3, true, init, rng))
        .with_child("score", conv_link(n_anchor * 2, mid_ch, 1, true, init, rng))
        .with_child("loc", conv_link(n_anchor * 4, mid_ch, 1, true, init, rng))
}

/// Returns `(rpn_locs, rpn_scores)` for a feature map.
pub fn rpn_heads(
    backend: &dyn Backend,
    rpn: &Composite,
    features: ArrayView4<f32>,
) -> DetectorResult<(Array4<f32>, Array4<f32>)> {
    let link = |name: &str| {
        rpn.child(name)
            .ok_or_else(|| DetectorError::mismatch(format!("rpn/{name}"), "missing sub-module"))
    };
    let h = backend.relu(conv(backend, link("conv1")?, features, 1)?);
    let locs = conv(backend, link("loc")?, h.view(), 1)?;
    let scores = conv(backend, link("score")?, h.view(), 1)?;
    Ok((locs, scores))
}

/// Reference anchors centered on a `base_size` cell, ratio-major.
pub fn anchor_base(base_size: f32, ratios: &[f32], anchor_scales: &[f32]) -> Vec<BBox> {
    let (py, px) = (base_size / 2., base_size / 2.);
    let mut anchors = Vec::with_capacity(ratios.len() * anchor_scales.len());
    for ratio in ratios {
        for scale in anchor_scales {
            let h = base_size * scale * ratio.sqrt();
            let w = base_size * scale * (1. / ratio).sqrt();
            anchors.push(BBox::new(py - h / 2., px - w / 2., py + h / 2., px + w / 2.));
        }
    }
    anchors
}

/// Anchors for every cell of an `(height, width)` feature map, ordered by
/// row, column and then anchor, matching the layout of the stage's outputs.
pub fn shifted_anchors(base: &[BBox], feat_stride: usize, size: (usize, usize)) -> Vec<BBox> {
    let mut anchors = Vec::with_capacity(size.0 * size.1 * base.len());
    for y in 0..size.0 {
        for x in 0..size.1 {
            let (dy, dx) = ((y * feat_stride) as f32, (x * feat_stride) as f32);
            anchors.extend(
                base.iter()
                    .map(|a| BBox::new(a.y_min + dy, a.x_min + dx, a.y_max + dy, a.x_max + dx)),
            );
        }
    }
    anchors
}

struct Scored {
    bbox: BBox,
    score: f32,
}

impl Nms for Scored {
    fn iou(&self, other: &Self) -> f32 {
        self.bbox.iou(&other.bbox)
    }

    fn confidence(&self) -> f32 {
        self.score
    }
}

/// Decodes every anchor, drops boxes smaller than `min_size * scale`, keeps the
/// best `pre_nms` by foreground probability, applies NMS and keeps `post_nms`.
#[derive(Debug, Clone, Default)]
pub struct AnchorProposer;

impl RegionProposer for AnchorProposer {
    fn propose(&mut self, ctx: &ProposalContext) -> DetectorResult<ProposalSet> {
        let (n, loc_ch, h, w) = ctx.rpn_locs.dim();
        let n_anchor = ctx.ratios.len() * ctx.anchor_scales.len();
        if loc_ch != n_anchor * 4 || ctx.rpn_scores.dim() != (n, n_anchor * 2, h, w) {
            return Err(DetectorError::mismatch(
                "rpn",
                format!("outputs do not match {n_anchor} anchors per cell"),
            ));
        }
        let base = anchor_base(ctx.feat_stride as f32, ctx.ratios, ctx.anchor_scales);
        let anchors = shifted_anchors(&base, ctx.feat_stride, (h, w));
        let (pre_nms, post_nms) = if ctx.training {
            (ctx.params.n_train_pre_nms, ctx.params.n_train_post_nms)
        } else {
            (ctx.params.n_test_pre_nms, ctx.params.n_test_post_nms)
        };
        let min_size = ctx.params.min_size as f32 * ctx.scale;

        let mut proposals = Vec::new();
        for image in 0..n {
            let locs = ctx.rpn_locs.slice(s![image, .., .., ..]);
            let scores = ctx.rpn_scores.slice(s![image, .., .., ..]);
            let mut candidates = Vec::with_capacity(anchors.len());
            for (i, anchor) in anchors.iter().enumerate() {
                let (cell, a) = (i / n_anchor, i % n_anchor);
                let (y, x) = (cell / w, cell % w);
                let loc = [
                    locs[[a * 4, y, x]],
                    locs[[a * 4 + 1, y, x]],
                    locs[[a * 4 + 2, y, x]],
                    locs[[a * 4 + 3, y, x]],
                ];
                let bbox = anchor.decode(loc).clip(ctx.image_size);
                if bbox.height() < min_size || bbox.width() < min_size {
                    continue;
                }
                let (bg, fg) = (scores[[a * 2, y, x]], scores[[a * 2 + 1, y, x]]);
                let score = 1. / (1. + (bg - fg).exp());
                candidates.push(Scored { bbox, score });
            }
            candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
            candidates.truncate(pre_nms);
            nms(&mut candidates, ctx.params.nms_thresh);
            candidates.truncate(post_nms);
            proposals.extend(candidates.into_iter().map(|c| Proposal::new(c.bbox, image)));
        }

        let mut table = Array2::zeros((anchors.len(), 4));
        for (mut row, a) in table.outer_iter_mut().zip(anchors.iter()) {
            row.assign(&ndarray::arr1(&a.to_array()));
        }
        Ok(ProposalSet { proposals, anchors: Some(table) })
    }
}

/// Returns the same boxes for every image of every call.
#[derive(Debug, Clone, Default)]
pub struct FixedProposer {
    pub boxes: Vec<BBox>,
}

impl FixedProposer {
    pub fn new(boxes: Vec<BBox>) -> Self {
        Self { boxes }
    }
}

impl RegionProposer for FixedProposer {
    fn propose(&mut self, ctx: &ProposalContext) -> DetectorResult<ProposalSet> {
        let n = ctx.rpn_locs.dim().0;
        let boxes = &self.boxes;
        let proposals = (0..n)
            .flat_map(|image| boxes.iter().map(move |b| Proposal::new(*b, image)))
            .collect();
        Ok(ProposalSet { proposals, anchors: None })
    }
}
