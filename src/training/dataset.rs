use std::sync::Arc;

use ndarray::Array3;

use crate::common::{BBox, DetectorError, DetectorResult};

/// One annotated image: `(3, H, W)` RGB values in `[0, 255]`, its boxes and
/// the foreground class of each box.
#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    pub image: Array3<f32>,
    pub bboxes: Vec<BBox>,
    pub labels: Vec<i32>,
}

/// An example after the training transform, with the factor its image was
/// resized by.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainExample {
    pub image: Array3<f32>,
    pub bboxes: Vec<BBox>,
    pub labels: Vec<i32>,
    pub scale: f32,
}

/// Random-access source of examples shared by the loader's workers.
pub trait DetectionDataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fails with `IndexOutOfRange` at or beyond `len()`.
    fn get_example(&self, index: usize) -> DetectorResult<Example>;
}

/// Examples held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataset {
    examples: Vec<Example>,
}

impl InMemoryDataset {
    pub fn new(examples: Vec<Example>) -> Self {
        Self { examples }
    }
}

impl DetectionDataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.examples.len()
    }

    fn get_example(&self, index: usize) -> DetectorResult<Example> {
        self.examples.get(index).cloned().ok_or(DetectorError::IndexOutOfRange {
            index: index as isize,
            len: self.examples.len(),
        })
    }
}

/// Several datasets read back to back.
#[derive(Clone, Default)]
pub struct ConcatenatedDataset {
    datasets: Vec<Arc<dyn DetectionDataset>>,
}

impl ConcatenatedDataset {
    pub fn new(datasets: Vec<Arc<dyn DetectionDataset>>) -> Self {
        Self { datasets }
    }

    /// Signed lookup; negative indices are out of range.
    pub fn get(&self, index: isize) -> DetectorResult<Example> {
        if index < 0 {
            return Err(DetectorError::IndexOutOfRange { index, len: self.len() });
        }
        self.get_example(index as usize)
    }
}

impl DetectionDataset for ConcatenatedDataset {
    fn len(&self) -> usize {
        self.datasets.iter().map(|d| d.len()).sum()
    }

    fn get_example(&self, index: usize) -> DetectorResult<Example> {
        let mut i = index;
        for dataset in self.datasets.iter() {
            if i < dataset.len() {
                return dataset.get_example(i);
            }
            i -= dataset.len();
        }
        Err(DetectorError::IndexOutOfRange {
            index: index as isize,
            len: self.len(),
        })
    }
}
