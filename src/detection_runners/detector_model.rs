//! Two-stage detector: ResNet feature extractor, region-proposal stage and a
//! RoI head built on the last residual stage.
//!
//! Parameters live in one chain with the children `extractor` (`conv1`, `bn1`,
//! `res2..res4`), `rpn` (`conv1`, `score`, `loc`) and `head` (`res5`,
//! `cls_loc`, `score`). The architecture is fixed at `build`; afterwards only
//! values change.

use std::path::Path;
use std::sync::Arc;

use ndarray::{s, Array2, Array3, Array4, ArrayView3, ArrayView4, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::common::{
    BBox, BackboneRegistry, BackboneSpec, Composite, Detection, DetectorError, DetectorResult,
    PretrainedEntry, PretrainedRegistry, PretrainedSource, Stage,
};
use crate::data::{DetectorConfig, RoiPooling, Snapshot};
use crate::detection_runners::backend::{Backend, NdArrayBackend};
use crate::detection_runners::image_ops::prepare_image;
use crate::detection_runners::inference_process::InferenceProcess;
use crate::detection_runners::initializer::Initializer;
use crate::detection_runners::nms::nms;
use crate::detection_runners::region_proposal::{
    build_rpn, rpn_heads, AnchorProposer, ProposalContext, RegionProposer, RpnOutput,
};
use crate::detection_runners::resnet::{build_extractor, building_block, invoke, linear, linear_link, run_block};
use crate::detection_runners::roi_bridge::{pool, to_batch};
use crate::detection_runners::weight_transplant::{reverse_input_channels, transplant_child};

/// Normalization of the head's box offsets.
const LOC_STD: [f32; 4] = [0.1, 0.1, 0.2, 0.2];
/// Extractor stages taken from a classification network, in order.
const EXTRACTOR_STAGES: [&str; 5] = ["conv1", "bn1", "res2", "res3", "res4"];

/// Per-proposal outputs of one forward pass.
#[derive(Debug, Clone)]
pub struct DetectorOutput {
    /// `(R, n_class * 4)` box offsets per class.
    pub roi_cls_locs: Array2<f32>,
    /// `(R, n_class)` class logits, background first.
    pub roi_scores: Array2<f32>,
    /// `(R, 4)` proposals in `(y_min, x_min, y_max, x_max)` of the prepared image.
    pub rois: Array2<f32>,
    pub roi_indices: Vec<usize>,
    pub rpn: RpnOutput,
}

#[derive(Debug)]
pub struct DetectorModel {
    config: DetectorConfig,
    backbone: BackboneSpec,
    n_class: usize,
    params: Composite,
    backend: Arc<dyn Backend>,
    proposer: Box<dyn RegionProposer>,
}

fn validate(config: &DetectorConfig) -> DetectorResult<()> {
    if config.ratios.is_empty() || config.anchor_scales.is_empty() {
        return Err(DetectorError::configuration("anchor ratios and scales must not be empty"));
    }
    if config.feat_stride == 0 || config.roi_size == 0 || config.res5_stride == 0 {
        return Err(DetectorError::configuration(
            "feature stride, RoI size and res5 stride must be positive",
        ));
    }
    if config.min_size == 0 || config.min_size > config.max_size {
        return Err(DetectorError::configuration(format!(
            "invalid resize bounds {}..{}",
            config.min_size, config.max_size
        )));
    }
    Ok(())
}

fn softmax_rows(x: &Array2<f32>) -> Array2<f32> {
    let mut out = x.clone();
    for mut row in out.outer_iter_mut() {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row /= sum;
    }
    out
}

impl DetectorModel {
    /// Builds with the default registries, the ndarray backend and the anchor proposer.
    pub fn new(config: DetectorConfig, source: PretrainedSource) -> DetectorResult<Self> {
        let backend = Arc::new(NdArrayBackend::new(config.device));
        Self::build(
            config,
            source,
            &BackboneRegistry::default(),
            &PretrainedRegistry::default(),
            backend,
            Box::new(AnchorProposer),
        )
    }

    pub fn build(
        config: DetectorConfig,
        source: PretrainedSource,
        backbones: &BackboneRegistry,
        pretrained: &PretrainedRegistry,
        backend: Arc<dyn Backend>,
        proposer: Box<dyn RegionProposer>,
    ) -> DetectorResult<Self> {
        validate(&config)?;
        let backbone = backbones.lookup(&config.backbone)?.clone();
        let entry = match &source {
            PretrainedSource::Named(name) => Some(pretrained.lookup(name)?),
            _ => None,
        };
        let n_fg_class = config
            .n_fg_class
            .or_else(|| pretrained.default_n_fg_class(&source))
            .ok_or_else(|| DetectorError::configuration("the number of foreground classes must be specified"))?;
        if let Some(names) = &config.label_names {
            if names.len() != n_fg_class {
                log::warn!("{} label names for {n_fg_class} foreground classes", names.len());
            }
        }
        if config.device != backend.device() {
            log::warn!("Requested {} but the backend runs on {}", config.device, backend.device());
        }

        let n_class = n_fg_class + 1;
        let mut rng = StdRng::seed_from_u64(config.seed);
        // residual weights are overwritten whenever a pretrained source is given
        let res_init = match source {
            PretrainedSource::None => Initializer::HeNormal,
            _ => Initializer::Zero,
        };
        let extractor = build_extractor(&backbone, res_init, &mut rng);
        let rpn = build_rpn(
            backbone.feature_channels(),
            backbone.rpn_mid_channels(),
            config.n_anchor(),
            &mut rng,
        );
        let head = Composite::chain()
            .with_child(Stage::Res5.name(), building_block(&backbone, Stage::Res5, res_init, &mut rng))
            .with_child(
                "cls_loc",
                linear_link(n_class * 4, backbone.head_channels(), Initializer::Normal(0.001), &mut rng),
            )
            .with_child(
                "score",
                linear_link(n_class, backbone.head_channels(), Initializer::Normal(0.01), &mut rng),
            );
        let params = Composite::chain()
            .with_child("extractor", extractor)
            .with_child("rpn", rpn)
            .with_child("head", head);

        let mut model = Self {
            config,
            backbone,
            n_class,
            params,
            backend,
            proposer,
        };
        match (&source, entry) {
            (PretrainedSource::Path(path), _) => model.load_snapshot(path)?,
            (_, Some(PretrainedEntry::Detector { path, .. })) => model.load_snapshot(path)?,
            (_, Some(PretrainedEntry::Classification(classifier))) => {
                let classifier = classifier.load(&model.backbone)?;
                model.transplant_classifier(&classifier)?;
            }
            _ => {}
        }

        log::info!(
            "Built {} detector with {} classes on {} ({} parameters)",
            model.backbone.name,
            model.n_class,
            model.backend.device(),
            model.params.param_count()
        );
        Ok(model)
    }

    /// Copies `conv1`, `bn1` and `res2..res4` of a classification network into
    /// the extractor and its `res5` into the head. Stages the source lacks keep
    /// their initial values.
    pub fn transplant_classifier(&mut self, classifier: &Composite) -> DetectorResult<()> {
        let extractor = self.part_mut("extractor")?;
        for stage in EXTRACTOR_STAGES {
            let copied = transplant_child(extractor, classifier, stage)?;
            if copied && stage == "conv1" {
                let conv1 = extractor
                    .child_mut("conv1")
                    .ok_or_else(|| DetectorError::mismatch("extractor/conv1", "missing sub-module"))?;
                reverse_input_channels(conv1)?;
            }
        }
        transplant_child(self.part_mut("head")?, classifier, Stage::Res5.name())?;
        Ok(())
    }

    fn part(&self, name: &str) -> DetectorResult<&Composite> {
        self.params
            .child(name)
            .ok_or_else(|| DetectorError::mismatch(name, "missing sub-module"))
    }

    fn part_mut(&mut self, name: &str) -> DetectorResult<&mut Composite> {
        self.params
            .child_mut(name)
            .ok_or_else(|| DetectorError::mismatch(name, "missing sub-module"))
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn backbone(&self) -> &BackboneSpec {
        &self.backbone
    }

    /// Number of classes including the background.
    pub fn n_class(&self) -> usize {
        self.n_class
    }

    pub fn params(&self) -> &Composite {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut Composite {
        &mut self.params
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn save_snapshot<P: AsRef<Path>>(&self, path: P) -> DetectorResult<()> {
        Snapshot::from_tree(&self.params).save(path)
    }

    /// Replaces every parameter with the snapshot's values. Nothing is written
    /// unless names and shapes match the model exactly.
    pub fn load_snapshot<P: AsRef<Path>>(&mut self, path: P) -> DetectorResult<()> {
        let path = path.as_ref();
        log::info!("Loading detector weights from {}", path.display());
        Snapshot::load(path)?.apply_to(&mut self.params, path)
    }

    /// Resizes a `(3, H, W)` RGB image within the configured bounds and
    /// subtracts the mean. Returns the prepared image and the resize factor.
    pub fn prepare(&self, image: ArrayView3<f32>) -> DetectorResult<(Array3<f32>, f32)> {
        prepare_image(image, self.config.min_size, self.config.max_size, &self.config.mean)
    }

    /// Feature map of the extractor, always in inference mode.
    pub fn extract_features(&self, x: ArrayView4<f32>) -> DetectorResult<Array4<f32>> {
        invoke(self.backend.as_ref(), self.part("extractor")?, x, Stage::Res4, false)
    }

    /// `res5`, global average pooling and the two projections on pooled RoI features.
    pub fn head_forward(&self, pooled: ArrayView4<f32>) -> DetectorResult<(Array2<f32>, Array2<f32>)> {
        let backend = self.backend.as_ref();
        let head = self.part("head")?;
        let link = |name: &str| {
            head.child(name)
                .ok_or_else(|| DetectorError::mismatch(format!("head/{name}"), "missing sub-module"))
        };
        let h = run_block(backend, link(Stage::Res5.name())?, pooled, self.config.res5_stride, false)?;
        let pool5 = backend.global_average_pool(h.view());
        let roi_cls_locs = linear(backend, link("cls_loc")?, &pool5)?;
        let roi_scores = linear(backend, link("score")?, &pool5)?;
        Ok((roi_cls_locs, roi_scores))
    }

    /// Runs a prepared `(N, 3, H, W)` batch through every stage. `scale` is the
    /// factor `prepare` applied; it only affects the proposal size filter.
    pub fn forward(&mut self, x: ArrayView4<f32>, scale: f32, training: bool) -> DetectorResult<DetectorOutput> {
        let (_, _, h, w) = x.dim();
        let features = self.extract_features(x)?;
        let (rpn_locs, rpn_scores) = rpn_heads(self.backend.as_ref(), self.part("rpn")?, features.view())?;
        let ctx = ProposalContext {
            rpn_locs: rpn_locs.view(),
            rpn_scores: rpn_scores.view(),
            image_size: (h, w),
            scale,
            ratios: &self.config.ratios,
            anchor_scales: &self.config.anchor_scales,
            feat_stride: self.config.feat_stride,
            params: &self.config.proposal_params,
            training,
        };
        let set = self.proposer.propose(&ctx)?;

        let (table, roi_indices) = to_batch(&set.proposals);
        let pooled = pool(
            self.backend.as_ref(),
            features.view(),
            table.view(),
            self.config.roi_size,
            self.config.roi_size,
            self.config.spatial_scale(),
            self.config.roi_pooling == RoiPooling::Align,
        )?;
        let (roi_cls_locs, roi_scores) = self.head_forward(pooled.view())?;

        Ok(DetectorOutput {
            roi_cls_locs,
            roi_scores,
            rois: table.slice(s![.., 1..]).to_owned(),
            roi_indices,
            rpn: RpnOutput {
                rpn_locs,
                rpn_scores,
                proposals: set.proposals,
                anchors: set.anchors,
            },
        })
    }

    fn labelled(&self, detection: Detection) -> Detection {
        match self.config.label_names.as_ref().and_then(|n| n.get(detection.class_id)) {
            Some(name) => detection.with_label(name),
            None => detection,
        }
    }

    /// Turns one image's raw outputs into detections in original image
    /// coordinates: decode, clip, softmax, then per-class threshold and NMS.
    pub fn decode(&self, raw: &DetectorOutput, scale: f32, size: (usize, usize)) -> Vec<Detection> {
        let (nms_thresh, score_thresh) = self.config.preset.thresholds();
        let probs = softmax_rows(&raw.roi_scores);
        let mut detections = Vec::new();
        for class in 1..self.n_class {
            let mut found: Vec<Detection> = raw
                .rois
                .outer_iter()
                .enumerate()
                .filter(|(r, _)| probs[[*r, class]] > score_thresh)
                .map(|(r, roi)| {
                    let roi = BBox::new(roi[0], roi[1], roi[2], roi[3]).scale(1. / scale);
                    let loc = [0, 1, 2, 3].map(|k| raw.roi_cls_locs[[r, class * 4 + k]] * LOC_STD[k]);
                    let bbox = roi.decode(loc).clip(size);
                    self.labelled(Detection::new(class - 1, bbox, probs[[r, class]]))
                })
                .collect();
            nms(&mut found, nms_thresh);
            detections.extend(found);
        }
        detections
    }

    /// Detects objects in `(3, H, W)` RGB images with values in `[0, 255]`.
    pub fn predict(&mut self, images: &[Array3<f32>]) -> DetectorResult<Vec<Vec<Detection>>> {
        self.run(images)
    }
}

impl InferenceProcess for DetectorModel {
    type Input = Array3<f32>;
    type Prepared = (Array3<f32>, f32);
    type Raw = (DetectorOutput, f32);
    type Output = Vec<Detection>;

    fn preprocess(&self, xs: &[Self::Input]) -> DetectorResult<Vec<Self::Prepared>> {
        xs.iter().map(|x| self.prepare(x.view())).collect()
    }

    fn inference(&mut self, xs: Vec<Self::Prepared>) -> DetectorResult<Vec<Self::Raw>> {
        xs.into_iter()
            .map(|(x, scale)| {
                let batch = x.insert_axis(Axis(0));
                Ok((self.forward(batch.view(), scale, false)?, scale))
            })
            .collect()
    }

    fn postprocess(&self, ys: Vec<Self::Raw>, xs0: &[Self::Input]) -> DetectorResult<Vec<Self::Output>> {
        Ok(ys
            .iter()
            .zip(xs0.iter())
            .map(|((raw, scale), x0)| {
                let (_, h, w) = x0.dim();
                self.decode(raw, *scale, (h, w))
            })
            .collect())
    }
}
