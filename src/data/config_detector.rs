//! Options for assembling a detector.

use std::path::Path;

use crate::common::{DetectorError, DetectorResult, InferenceDevice};
use crate::utils::file_to_vec;

/// How the head extracts a fixed-size feature for each region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RoiPooling {
    /// Max pooling over quantized bins.
    #[default] Pool,
    /// Bilinear sampling without quantization.
    Align,
}

/// Parameters forwarded to the region-proposal stage's proposal creator.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposalParams {
    pub nms_thresh: f32,
    pub n_train_pre_nms: usize,
    pub n_train_post_nms: usize,
    pub n_test_pre_nms: usize,
    pub n_test_post_nms: usize,
    pub min_size: usize,
}

impl Default for ProposalParams {
    fn default() -> Self {
        Self {
            nms_thresh: 0.7,
            n_train_pre_nms: 12000,
            n_train_post_nms: 2000,
            n_test_pre_nms: 6000,
            n_test_post_nms: 300,
            min_size: 16,
        }
    }
}

/// Score and NMS thresholds used by `predict`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum Preset {
    /// Few, confident boxes for display.
    #[default] Visualize,
    /// Many low-confidence boxes, as detection benchmarks expect.
    Evaluate,
}

impl Preset {
    pub fn from_str(preset: &str) -> Option<Self> {
        match preset.to_lowercase().as_str() {
            "visualize" => Some(Preset::Visualize),
            "evaluate" => Some(Preset::Evaluate),
            _ => None,
        }
    }

    /// `(nms_thresh, score_thresh)`
    pub fn thresholds(&self) -> (f32, f32) {
        match self {
            Preset::Visualize => (0.3, 0.7),
            Preset::Evaluate => (0.3, 0.05),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub backbone: String,
    /// Foreground classes, background excluded.
    pub n_fg_class: Option<usize>,
    pub ratios: Vec<f32>,
    pub anchor_scales: Vec<f32>,
    pub feat_stride: usize,
    pub roi_size: usize,
    pub roi_pooling: RoiPooling,
    pub res5_stride: usize,
    pub min_size: usize,
    pub max_size: usize,
    /// Per-channel RGB mean subtracted by `prepare`.
    pub mean: [f32; 3],
    pub proposal_params: ProposalParams,
    pub device: InferenceDevice,
    pub preset: Preset,
    pub label_names: Option<Vec<String>>,
    /// Seed of the random initializers.
    pub seed: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            backbone: "resnet50".to_string(),
            n_fg_class: None,
            ratios: vec![0.5, 1., 2.],
            anchor_scales: vec![8., 16., 32.],
            feat_stride: 16,
            roi_size: 7,
            roi_pooling: RoiPooling::Pool,
            res5_stride: 2,
            min_size: 600,
            max_size: 1000,
            mean: [123.152, 115.903, 103.063],
            proposal_params: ProposalParams::default(),
            device: InferenceDevice::CPU,
            preset: Preset::Visualize,
            label_names: None,
            seed: 0,
        }
    }
}

impl DetectorConfig {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_backbone(mut self, name: &str) -> Self {
        self.backbone = name.to_string();
        self
    }

    pub fn with_n_fg_class(mut self, n: usize) -> Self {
        self.n_fg_class = Some(n);
        self
    }

    pub fn with_ratios(mut self, x: &[f32]) -> Self {
        self.ratios = x.to_vec();
        self
    }

    pub fn with_anchor_scales(mut self, x: &[f32]) -> Self {
        self.anchor_scales = x.to_vec();
        self
    }

    pub fn with_feat_stride(mut self, n: usize) -> Self {
        self.feat_stride = n;
        self
    }

    pub fn with_roi_size(mut self, n: usize) -> Self {
        self.roi_size = n;
        self
    }

    pub fn with_roi_pooling(mut self, x: RoiPooling) -> Self {
        self.roi_pooling = x;
        self
    }

    pub fn with_res5_stride(mut self, n: usize) -> Self {
        self.res5_stride = n;
        self
    }

    pub fn with_size_bounds(mut self, min_size: usize, max_size: usize) -> Self {
        self.min_size = min_size;
        self.max_size = max_size;
        self
    }

    pub fn with_mean(mut self, mean: [f32; 3]) -> Self {
        self.mean = mean;
        self
    }

    pub fn with_proposal_params(mut self, x: ProposalParams) -> Self {
        self.proposal_params = x;
        self
    }

    pub fn with_device(mut self, device: InferenceDevice) -> Self {
        self.device = device;
        self
    }

    pub fn with_preset(mut self, preset: Preset) -> Self {
        self.preset = preset;
        self
    }

    pub fn with_names(mut self, names: &[&str]) -> Self {
        self.label_names = Some(names.iter().map(|x| x.to_string()).collect::<Vec<String>>());
        self
    }

    /// Reads one class name per line.
    pub fn with_names_file<P: AsRef<Path>>(mut self, path: P) -> DetectorResult<Self> {
        let path = path.as_ref();
        let names = file_to_vec(path).map_err(|source| DetectorError::Io { path: path.to_path_buf(), source })?;
        self.label_names = Some(names);
        Ok(self)
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn n_anchor(&self) -> usize {
        self.ratios.len() * self.anchor_scales.len()
    }

    pub fn spatial_scale(&self) -> f32 {
        1. / self.feat_stride as f32
    }

    pub fn to_string(&self) -> String {
        format!("Backbone: {}\n\
        Foreground Classes: {:?}\n\
        Anchor Ratios: {:?}\n\
        Anchor Scales: {:?}\n\
        Feature Stride: {}\n\
        RoI: {}x{} ({:?})\n\
        Resize Bounds: {}..{}\n\
        Device: {}",
                self.backbone, self.n_fg_class, self.ratios, self.anchor_scales,
                self.feat_stride, self.roi_size, self.roi_size, self.roi_pooling,
                self.min_size, self.max_size, self.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_nine_anchors_at_stride_sixteen() {
        let config = DetectorConfig::default();
        assert_eq!(config.n_anchor(), 9);
        assert_eq!(config.spatial_scale(), 0.0625);
        assert_eq!(config.n_fg_class, None);
    }

    #[test]
    fn presets_by_name() {
        assert_eq!(Preset::from_str("Evaluate").map(|p| p.thresholds()), Some((0.3, 0.05)));
        assert_eq!(Preset::from_str("fast"), None);
    }

    #[test]
    fn missing_names_file_is_an_io_error() {
        let err = DetectorConfig::new().with_names_file("/nonexistent/names.txt").unwrap_err();
        assert!(matches!(err, DetectorError::Io { .. }));
    }
}
