mod utils;
pub mod common;
pub mod data;
pub mod detection_runners;
pub mod training;

use std::time::Instant;

use anyhow::Context;
use image::DynamicImage;

use crate::common::{Detection, PretrainedSource};
use crate::data::DetectorConfig;
use crate::detection_runners::image_ops::chw_from_dynamic;
use crate::detection_runners::inference_process::InferenceProcess;
use crate::detection_runners::DetectorModel;

pub use crate::common::{DetectorError, DetectorResult};

/// Builds a detector and pushes one blank image through it so the first real
/// call does not pay for lazy allocations.
pub fn init_detector(config: DetectorConfig, source: PretrainedSource) -> anyhow::Result<DetectorModel> {
    log::info!("Initializing detector on ({}) device", config.device);
    let mut model = DetectorModel::new(config, source).context("Failed to build the detector")?;
    let warmup = chw_from_dynamic(&DynamicImage::new_rgb8(64, 64));
    model.predict(&[warmup]).context("Detector warm-up failed")?;
    Ok(model)
}

pub fn run_detection(model: &mut DetectorModel, image: &DynamicImage, profile: bool) -> anyhow::Result<Vec<Detection>> {
    let now = Instant::now();
    let mut detections = model.run_profiled(&[chw_from_dynamic(image)], profile)?;
    log::info!("Processing time: {:?}", now.elapsed());
    Ok(detections.pop().unwrap_or_default())
}
