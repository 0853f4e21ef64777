use serde::{Deserialize, Serialize};
use crate::common::BBox;
use crate::detection_runners::nms::Nms;

/// One detected object, in the coordinates of the original (un-prepared) image.
#[derive(Default, Debug, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: usize,
    pub bbox: BBox,
    pub label: Option<String>,
    pub confidence: f32,
}

impl Nms for Detection {
    fn iou(&self, other: &Self) -> f32 {
        self.bbox.iou(&other.bbox)
    }

    fn confidence(&self) -> f32 {
        self.confidence
    }
}

impl Detection {
    pub fn new(class_id: usize, bbox: BBox, confidence: f32) -> Self {
        Self {
            class_id,
            bbox,
            label: None,
            confidence,
        }
    }

    /// Sets the optional name of the detected class.
    ///
    /// # Arguments
    ///
    /// * `label` - The name to be set.
    ///
    /// # Returns
    ///
    /// A `Detection` instance with updated name.
    pub fn with_label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }
}
