use serde::{Deserialize, Serialize};

/// Axis-aligned box in `(y_min, x_min, y_max, x_max)` order, pixel coordinates.
#[derive(Default, Debug, Clone, Copy, PartialEq, Serialize, Deserialize, PartialOrd)]
pub struct BBox {
    pub y_min: f32,
    pub x_min: f32,
    pub y_max: f32,
    pub x_max: f32,
}

impl BBox {
    pub fn new(y_min: f32, x_min: f32, y_max: f32, x_max: f32) -> Self {
        Self {
            y_min,
            x_min,
            y_max,
            x_max,
        }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.y_min, self.x_min, self.y_max, self.x_max]
    }

    /// Returns the height of the bounding box.
    pub fn height(&self) -> f32 {
        self.y_max - self.y_min
    }

    /// Returns the width of the bounding box.
    pub fn width(&self) -> f32 {
        self.x_max - self.x_min
    }

    /// Returns the center as `(cy, cx)`.
    pub fn center(&self) -> (f32, f32) {
        (
            self.y_min + self.height() / 2.,
            self.x_min + self.width() / 2.,
        )
    }

    /// Computes the area of the bounding box.
    pub fn area(&self) -> f32 {
        self.height().max(0.) * self.width().max(0.)
    }

    /// Computes the intersection area between this bounding box and another.
    pub fn intersect(&self, other: &BBox) -> f32 {
        let top = self.y_min.max(other.y_min);
        let bottom = self.y_max.min(other.y_max);
        let left = self.x_min.max(other.x_min);
        let right = self.x_max.min(other.x_max);
        (bottom - top).max(0.) * (right - left).max(0.)
    }

    /// Computes the union area between this bounding box and another.
    pub fn union(&self, other: &BBox) -> f32 {
        self.area() + other.area() - self.intersect(other)
    }

    pub fn iou(&self, other: &BBox) -> f32 {
        let union = self.union(other);
        if union <= 0. {
            0.
        } else {
            self.intersect(other) / union
        }
    }

    /// Rescales the box from an `in_size` image to an `out_size` image, both `(height, width)`.
    pub fn resize(&self, in_size: (usize, usize), out_size: (usize, usize)) -> Self {
        let y_scale = out_size.0 as f32 / in_size.0 as f32;
        let x_scale = out_size.1 as f32 / in_size.1 as f32;
        Self::new(
            self.y_min * y_scale,
            self.x_min * x_scale,
            self.y_max * y_scale,
            self.x_max * x_scale,
        )
    }

    /// Uniform rescale of every coordinate.
    pub fn scale(&self, factor: f32) -> Self {
        Self::new(
            self.y_min * factor,
            self.x_min * factor,
            self.y_max * factor,
            self.x_max * factor,
        )
    }

    /// Mirrors the box inside an image of `(height, width)`.
    pub fn flip(&self, size: (usize, usize), y_flip: bool, x_flip: bool) -> Self {
        let (h, w) = (size.0 as f32, size.1 as f32);
        let mut out = *self;
        if y_flip {
            out.y_min = h - self.y_max;
            out.y_max = h - self.y_min;
        }
        if x_flip {
            out.x_min = w - self.x_max;
            out.x_max = w - self.x_min;
        }
        out
    }

    /// Clamps the box to `[0, height] x [0, width]`.
    pub fn clip(&self, size: (usize, usize)) -> Self {
        let (h, w) = (size.0 as f32, size.1 as f32);
        Self::new(
            self.y_min.clamp(0., h),
            self.x_min.clamp(0., w),
            self.y_max.clamp(0., h),
            self.x_max.clamp(0., w),
        )
    }

    /// Applies `(dy, dx, dh, dw)` regression offsets: centers shift by a
    /// fraction of the size, sizes scale by `exp`.
    pub fn decode(&self, loc: [f32; 4]) -> Self {
        let (h, w) = (self.height(), self.width());
        let (cy, cx) = self.center();
        let [dy, dx, dh, dw] = loc;
        let (cy, cx) = (dy * h + cy, dx * w + cx);
        let (h, w) = (dh.exp() * h, dw.exp() * w);
        Self::new(cy - 0.5 * h, cx - 0.5 * w, cy + 0.5 * h, cx + 0.5 * w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn horizontal_flip_mirrors_x() {
        let b = BBox::new(10., 20., 30., 40.);
        let flipped = b.flip((50, 100), false, true);
        assert_eq!(flipped, BBox::new(10., 60., 30., 80.));
        assert_eq!(flipped.flip((50, 100), false, true), b);
    }

    #[test]
    fn resize_uses_per_axis_ratio() {
        let b = BBox::new(10., 10., 20., 40.);
        let r = b.resize((100, 200), (50, 400));
        assert_eq!(r, BBox::new(5., 20., 10., 80.));
    }

    #[test]
    fn zero_offsets_decode_to_the_same_box() {
        let b = BBox::new(10., 20., 30., 60.);
        assert_eq!(b.decode([0., 0., 0., 0.]), b);
        assert_eq!(b.decode([0.5, 0., 0., 0.]), BBox::new(20., 20., 40., 60.));
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BBox::new(0., 0., 10., 10.);
        let b = BBox::new(20., 20., 30., 30.);
        assert_eq!(a.iou(&b), 0.);
        assert!((a.iou(&a) - 1.).abs() < 1e-6);
    }
}
