//! Image conversions used by `prepare` and the training transform.
//!
//! Images travel as `(3, H, W)` `f32` arrays in RGB order with values in
//! `[0, 255]`.

use fast_image_resize::{
    images::Image as FirImage, pixels::PixelType, FilterType, ResizeAlg, ResizeOptions, Resizer,
};
use image::{DynamicImage, RgbImage};
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis, Slice};
use rayon::prelude::*;

use crate::common::{DetectorError, DetectorResult};

pub fn chw_from_rgb(image: &RgbImage) -> Array3<f32> {
    let (width, height) = image.dimensions();
    Array3::from_shape_fn((3, height as usize, width as usize), |(c, y, x)| {
        image.get_pixel(x as u32, y as u32)[c] as f32
    })
}

pub fn chw_from_dynamic(image: &DynamicImage) -> Array3<f32> {
    chw_from_rgb(&image.to_rgb8())
}

/// Output size and factor for a resize whose shorter side becomes `min_size`,
/// unless that pushes the longer side past `max_size`.
pub fn prepare_size(height: usize, width: usize, min_size: usize, max_size: usize) -> (f32, usize, usize) {
    let (short, long) = (height.min(width) as f32, height.max(width) as f32);
    let mut scale = min_size as f32 / short;
    if scale * long > max_size as f32 {
        scale = max_size as f32 / long;
    }
    let out_h = ((height as f32 * scale) as usize).max(1);
    let out_w = ((width as f32 * scale) as usize).max(1);
    (scale, out_h, out_w)
}

fn resize_plane(plane: ArrayView2<f32>, out_h: usize, out_w: usize) -> DetectorResult<Array2<f32>> {
    let (h, w) = plane.dim();
    let bytes: Vec<u8> = plane.iter().flat_map(|v| v.to_ne_bytes()).collect();
    let src = FirImage::from_vec_u8(w as u32, h as u32, bytes, PixelType::F32)
        .map_err(|e| DetectorError::Resize(e.to_string()))?;
    let mut dst = FirImage::new(out_w as u32, out_h as u32, PixelType::F32);
    let options = ResizeOptions::new().resize_alg(ResizeAlg::Convolution(FilterType::Bilinear));
    Resizer::new()
        .resize(&src, &mut dst, &options)
        .map_err(|e| DetectorError::Resize(e.to_string()))?;
    let values: Vec<f32> = dst
        .buffer()
        .chunks_exact(4)
        .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok(Array2::from_shape_vec((out_h, out_w), values)?)
}

/// Bilinear resize of every channel.
pub fn resize_chw(x: ArrayView3<f32>, out_h: usize, out_w: usize) -> DetectorResult<Array3<f32>> {
    let (c, h, w) = x.dim();
    if (h, w) == (out_h, out_w) {
        return Ok(x.to_owned());
    }
    let planes = x
        .axis_iter(Axis(0))
        .into_par_iter()
        .map(|plane| resize_plane(plane, out_h, out_w))
        .collect::<DetectorResult<Vec<_>>>()?;
    let mut out = Array3::zeros((c, out_h, out_w));
    for (mut dst, plane) in out.outer_iter_mut().zip(planes.iter()) {
        dst.assign(plane);
    }
    Ok(out)
}

/// Resizes within `[min_size, max_size]` and subtracts the per-channel mean.
/// Returns the prepared image and the resize factor.
pub fn prepare_image(
    image: ArrayView3<f32>,
    min_size: usize,
    max_size: usize,
    mean: &[f32; 3],
) -> DetectorResult<(Array3<f32>, f32)> {
    let (_, h, w) = image.dim();
    let (scale, out_h, out_w) = prepare_size(h, w, min_size, max_size);
    let mut x = resize_chw(image, out_h, out_w)?;
    for (mut plane, m) in x.outer_iter_mut().zip(mean.iter()) {
        plane -= *m;
    }
    Ok((x, scale))
}

/// Mirrors the image left to right.
pub fn flip_chw(x: ArrayView3<f32>) -> Array3<f32> {
    x.slice_axis(Axis(2), Slice::new(0, None, -1))
        .as_standard_layout()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    #[test]
    fn short_side_goes_to_min_size() {
        assert_eq!(prepare_size(300, 400, 600, 1000), (2., 600, 800));
    }

    #[test]
    fn long_side_is_capped() {
        let (scale, h, w) = prepare_size(100, 500, 600, 1000);
        assert_eq!(scale, 2.);
        assert_eq!((h, w), (200, 1000));
    }

    #[test]
    fn resizing_a_constant_image_keeps_its_value() {
        let x = Array3::from_elem((3, 10, 20), 42.);
        let y = resize_chw(x.view(), 15, 30).unwrap();
        assert_eq!(y.dim(), (3, 15, 30));
        assert!(y.iter().all(|v| (v - 42.).abs() < 1e-3));
    }

    #[test]
    fn prepare_subtracts_the_mean() {
        let x = Array3::from_elem((3, 4, 8), 100.);
        let (y, scale) = prepare_image(x.view(), 8, 32, &[10., 20., 30.]).unwrap();
        assert_eq!(scale, 2.);
        assert_eq!(y.dim(), (3, 8, 16));
        assert!((y[[2, 3, 3]] - 70.).abs() < 1e-3);
    }

    #[test]
    fn flip_reverses_columns() {
        let x = Array::from_shape_fn((1, 1, 3), |(_, _, x)| x as f32);
        assert_eq!(flip_chw(x.view()).iter().copied().collect::<Vec<_>>(), vec![2., 1., 0.]);
    }

    #[test]
    fn rgb_buffers_become_channel_first() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(1, 0, image::Rgb([1, 2, 3]));
        let x = chw_from_rgb(&img);
        assert_eq!(x.dim(), (3, 1, 2));
        assert_eq!((x[[0, 0, 1]], x[[2, 0, 1]]), (1., 3.));
    }
}
