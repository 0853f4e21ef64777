use rand::rngs::StdRng;
use rand::Rng;

use crate::common::DetectorResult;
use crate::data::DetectorConfig;
use crate::detection_runners::image_ops::{flip_chw, prepare_image};
use crate::training::dataset::{Example, TrainExample};

/// Per-example training transform: prepare the image as the detector would,
/// resize the boxes with it and flip both horizontally half of the time.
#[derive(Debug, Clone)]
pub struct Transform {
    min_size: usize,
    max_size: usize,
    mean: [f32; 3],
}

impl Transform {
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            min_size: config.min_size,
            max_size: config.max_size,
            mean: config.mean,
        }
    }

    pub fn apply(&self, example: Example, rng: &mut StdRng) -> DetectorResult<TrainExample> {
        let x_flip = rng.gen::<bool>();
        self.apply_with_flip(example, x_flip)
    }

    pub fn apply_with_flip(&self, example: Example, x_flip: bool) -> DetectorResult<TrainExample> {
        let (_, h, w) = example.image.dim();
        let (image, _) = prepare_image(example.image.view(), self.min_size, self.max_size, &self.mean)?;
        let (_, o_h, o_w) = image.dim();
        // preparation keeps the aspect ratio, so the height ratio stands for both axes
        let scale = o_h as f32 / h as f32;

        let mut bboxes: Vec<_> = example.bboxes.iter().map(|b| b.resize((h, w), (o_h, o_w))).collect();
        let image = if x_flip {
            bboxes = bboxes.iter().map(|b| b.flip((o_h, o_w), false, true)).collect();
            flip_chw(image.view())
        } else {
            image
        };

        Ok(TrainExample {
            image,
            bboxes,
            labels: example.labels,
            scale,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::BBox;
    use ndarray::Array3;

    fn example() -> Example {
        Example {
            image: Array3::from_shape_fn((3, 50, 100), |(_, _, x)| x as f32),
            bboxes: vec![BBox::new(10., 20., 30., 40.)],
            labels: vec![7],
        }
    }

    fn transform() -> Transform {
        Transform::new(&DetectorConfig::new().with_size_bounds(50, 200).with_mean([0.; 3]))
    }

    #[test]
    fn unflipped_keeps_geometry_at_unit_scale() {
        let out = transform().apply_with_flip(example(), false).unwrap();
        assert_eq!(out.scale, 1.);
        assert_eq!(out.bboxes, vec![BBox::new(10., 20., 30., 40.)]);
        assert_eq!(out.labels, vec![7]);
    }

    #[test]
    fn flip_mirrors_image_and_boxes_together() {
        let out = transform().apply_with_flip(example(), true).unwrap();
        assert_eq!(out.bboxes, vec![BBox::new(10., 60., 30., 80.)]);
        assert_eq!(out.image[[0, 0, 0]], 99.);
    }

    #[test]
    fn scale_follows_the_resize() {
        let t = Transform::new(&DetectorConfig::new().with_size_bounds(100, 400));
        let out = t.apply_with_flip(example(), false).unwrap();
        assert_eq!(out.scale, 2.);
        assert_eq!(out.image.dim(), (3, 100, 200));
        assert_eq!(out.bboxes[0], BBox::new(20., 40., 60., 80.));
    }
}
