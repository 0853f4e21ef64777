#![allow(dead_code)]

use std::sync::Arc;

use rcnn_detect::common::{BBox, BackboneRegistry, BackboneSpec, PretrainedRegistry, PretrainedSource};
use rcnn_detect::data::DetectorConfig;
use rcnn_detect::detection_runners::{DetectorModel, FixedProposer, NdArrayBackend};
use rcnn_detect::DetectorResult;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn tiny_spec(name: &str) -> BackboneSpec {
    BackboneSpec::new(name, [1, 1, 1, 1], 2)
}

pub fn tiny_registry() -> BackboneRegistry {
    BackboneRegistry::empty().with_backbone(tiny_spec("tiny"))
}

pub fn tiny_config() -> DetectorConfig {
    DetectorConfig::new()
        .with_backbone("tiny")
        .with_n_fg_class(3)
        .with_roi_size(2)
        .with_size_bounds(32, 64)
}

pub fn fixed_boxes() -> Vec<BBox> {
    vec![BBox::new(0., 0., 16., 16.), BBox::new(8., 4., 30., 28.), BBox::new(2., 2., 10., 31.)]
}

pub fn build_tiny(
    config: DetectorConfig,
    source: PretrainedSource,
    pretrained: &PretrainedRegistry,
) -> DetectorResult<DetectorModel> {
    DetectorModel::build(
        config,
        source,
        &tiny_registry(),
        pretrained,
        Arc::new(NdArrayBackend::default()),
        Box::new(FixedProposer::new(fixed_boxes())),
    )
}
