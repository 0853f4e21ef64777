use serde::{Deserialize, Serialize};
use crate::common::BBox;

/// A candidate region produced by the proposal stage for one image of a batch.
#[derive(Default, Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub bbox: BBox,
    pub image_index: usize,
}

impl Proposal {
    pub fn new(bbox: BBox, image_index: usize) -> Self {
        Self { bbox, image_index }
    }
}
