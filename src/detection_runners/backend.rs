//! Numerical kernels the detector is composed from.
//!
//! `Backend` is the seam to the array runtime; `NdArrayBackend` is the host
//! implementation on top of `ndarray` with `rayon` data parallelism. RoI tables
//! passed to the pooling kernels are in `(index, x_min, y_min, x_max, y_max)`
//! order.

use ndarray::{s, Array2, Array3, Array4, ArrayView1, ArrayView2, ArrayView4, Axis};
use rayon::prelude::*;

use crate::common::{DetectorError, DetectorResult, InferenceDevice};
use crate::data::CROSS_MARK;

pub trait Backend: std::fmt::Debug + Send + Sync {
    fn device(&self) -> InferenceDevice;

    fn conv2d(
        &self,
        x: ArrayView4<f32>,
        w: ArrayView4<f32>,
        b: Option<ArrayView1<f32>>,
        stride: usize,
        pad: usize,
    ) -> DetectorResult<Array4<f32>>;

    /// Per-channel affine normalization with the given statistics.
    fn batch_norm(
        &self,
        x: ArrayView4<f32>,
        gamma: ArrayView1<f32>,
        beta: ArrayView1<f32>,
        mean: ArrayView1<f32>,
        var: ArrayView1<f32>,
        eps: f32,
    ) -> DetectorResult<Array4<f32>>;

    fn relu(&self, x: Array4<f32>) -> Array4<f32>;

    /// Max pooling that covers every input pixel (the last window may be partial).
    fn max_pool2d(&self, x: ArrayView4<f32>, ksize: usize, stride: usize, pad: usize) -> Array4<f32>;

    fn global_average_pool(&self, x: ArrayView4<f32>) -> Array2<f32>;

    /// `x · wᵀ + b` with `w` shaped `(out, in)`.
    fn linear(
        &self,
        x: ArrayView2<f32>,
        w: ArrayView2<f32>,
        b: Option<ArrayView1<f32>>,
    ) -> DetectorResult<Array2<f32>>;

    fn roi_pooling_2d(
        &self,
        x: ArrayView4<f32>,
        rois: ArrayView2<f32>,
        out_h: usize,
        out_w: usize,
        spatial_scale: f32,
    ) -> DetectorResult<Array4<f32>>;

    fn roi_align_2d(
        &self,
        x: ArrayView4<f32>,
        rois: ArrayView2<f32>,
        out_h: usize,
        out_w: usize,
        spatial_scale: f32,
    ) -> DetectorResult<Array4<f32>>;
}

#[derive(Debug, Clone, Default)]
pub struct NdArrayBackend {
    device: InferenceDevice,
}

impl NdArrayBackend {
    pub fn new(device: InferenceDevice) -> Self {
        let device = if device.is_host() {
            device
        } else {
            log::warn!("{CROSS_MARK} {device} is not available to the ndarray backend, Using cpu");
            InferenceDevice::CPU
        };
        Self { device }
    }
}

fn out_size(len: usize, ksize: usize, stride: usize, pad: usize, cover_all: bool) -> usize {
    let span = (len + 2 * pad).saturating_sub(ksize);
    if cover_all {
        span.div_ceil(stride) + 1
    } else {
        span / stride + 1
    }
}

fn check_rois(rois: &ArrayView2<f32>, batch: usize) -> DetectorResult<()> {
    if rois.ncols() != 5 {
        return Err(DetectorError::mismatch(
            "rois",
            format!("expected 5 columns, got {}", rois.ncols()),
        ));
    }
    for row in rois.outer_iter() {
        let index = row[0];
        if index < 0. || index as usize >= batch {
            return Err(DetectorError::IndexOutOfRange { index: index as isize, len: batch });
        }
    }
    Ok(())
}

fn assemble(pooled: Vec<Array3<f32>>, channels: usize, out_h: usize, out_w: usize) -> Array4<f32> {
    let mut out = Array4::zeros((pooled.len(), channels, out_h, out_w));
    for (mut dst, src) in out.outer_iter_mut().zip(pooled.iter()) {
        dst.assign(src);
    }
    out
}

fn bilinear(plane: ArrayView2<f32>, y: f32, x: f32) -> f32 {
    let (h, w) = plane.dim();
    if y < -1. || y > h as f32 || x < -1. || x > w as f32 {
        return 0.;
    }
    let (y, x) = (y.max(0.), x.max(0.));
    let (mut y_low, mut x_low) = (y as usize, x as usize);
    let (y_high, x_high);
    let (mut y, mut x) = (y, x);
    if y_low >= h - 1 {
        y_low = h - 1;
        y_high = h - 1;
        y = y_low as f32;
    } else {
        y_high = y_low + 1;
    }
    if x_low >= w - 1 {
        x_low = w - 1;
        x_high = w - 1;
        x = x_low as f32;
    } else {
        x_high = x_low + 1;
    }
    let (ly, lx) = (y - y_low as f32, x - x_low as f32);
    let (hy, hx) = (1. - ly, 1. - lx);
    hy * hx * plane[[y_low, x_low]]
        + hy * lx * plane[[y_low, x_high]]
        + ly * hx * plane[[y_high, x_low]]
        + ly * lx * plane[[y_high, x_high]]
}

impl Backend for NdArrayBackend {
    fn device(&self) -> InferenceDevice {
        self.device
    }

    fn conv2d(
        &self,
        x: ArrayView4<f32>,
        w: ArrayView4<f32>,
        b: Option<ArrayView1<f32>>,
        stride: usize,
        pad: usize,
    ) -> DetectorResult<Array4<f32>> {
        let (n, c, h, wd) = x.dim();
        let (oc, ic, kh, kw) = w.dim();
        if c != ic {
            return Err(DetectorError::mismatch(
                "conv2d",
                format!("input has {c} channels, weight expects {ic}"),
            ));
        }
        let (oh, ow) = (out_size(h, kh, stride, pad, false), out_size(wd, kw, stride, pad, false));
        let weight = w.to_shape((oc, ic * kh * kw))?;
        let mut out = Array4::zeros((n, oc, oh, ow));

        for (image, mut dst) in x.outer_iter().zip(out.outer_iter_mut()) {
            // im2col: one row per (channel, ky, kx), one column per output pixel
            let mut cols = Array2::<f32>::zeros((ic * kh * kw, oh * ow));
            cols.axis_iter_mut(Axis(0))
                .into_par_iter()
                .enumerate()
                .for_each(|(row, mut col)| {
                    let ch = row / (kh * kw);
                    let ky = (row / kw) % kh;
                    let kx = row % kw;
                    for oy in 0..oh {
                        let iy = (oy * stride + ky) as isize - pad as isize;
                        if iy < 0 || iy >= h as isize {
                            continue;
                        }
                        for ox in 0..ow {
                            let ix = (ox * stride + kx) as isize - pad as isize;
                            if ix >= 0 && ix < wd as isize {
                                col[oy * ow + ox] = image[[ch, iy as usize, ix as usize]];
                            }
                        }
                    }
                });
            let mut y = weight.dot(&cols);
            if let Some(bias) = &b {
                for (mut row, v) in y.outer_iter_mut().zip(bias.iter()) {
                    row += *v;
                }
            }
            dst.assign(&y.to_shape((oc, oh, ow))?);
        }
        Ok(out)
    }

    fn batch_norm(
        &self,
        x: ArrayView4<f32>,
        gamma: ArrayView1<f32>,
        beta: ArrayView1<f32>,
        mean: ArrayView1<f32>,
        var: ArrayView1<f32>,
        eps: f32,
    ) -> DetectorResult<Array4<f32>> {
        let c = x.dim().1;
        if [gamma.len(), beta.len(), mean.len(), var.len()].iter().any(|&l| l != c) {
            return Err(DetectorError::mismatch(
                "batch_norm",
                format!("input has {c} channels but statistics do not"),
            ));
        }
        let mut out = x.to_owned();
        out.axis_iter_mut(Axis(1))
            .into_par_iter()
            .enumerate()
            .for_each(|(ch, mut plane)| {
                let scale = gamma[ch] / (var[ch] + eps).sqrt();
                let shift = beta[ch] - mean[ch] * scale;
                plane.mapv_inplace(|v| v * scale + shift);
            });
        Ok(out)
    }

    fn relu(&self, mut x: Array4<f32>) -> Array4<f32> {
        x.par_mapv_inplace(|v| v.max(0.));
        x
    }

    fn max_pool2d(&self, x: ArrayView4<f32>, ksize: usize, stride: usize, pad: usize) -> Array4<f32> {
        let (n, c, h, w) = x.dim();
        let (oh, ow) = (out_size(h, ksize, stride, pad, true), out_size(w, ksize, stride, pad, true));
        let mut out = Array4::from_elem((n, c, oh, ow), f32::NEG_INFINITY);
        for b in 0..n {
            for ch in 0..c {
                let plane = x.slice(s![b, ch, .., ..]);
                let mut dst = out.slice_mut(s![b, ch, .., ..]);
                for oy in 0..oh {
                    let y0 = (oy * stride) as isize - pad as isize;
                    for ox in 0..ow {
                        let x0 = (ox * stride) as isize - pad as isize;
                        let mut best = f32::NEG_INFINITY;
                        for iy in y0.max(0)..(y0 + ksize as isize).min(h as isize) {
                            for ix in x0.max(0)..(x0 + ksize as isize).min(w as isize) {
                                best = best.max(plane[[iy as usize, ix as usize]]);
                            }
                        }
                        dst[[oy, ox]] = best;
                    }
                }
            }
        }
        out
    }

    fn global_average_pool(&self, x: ArrayView4<f32>) -> Array2<f32> {
        let (n, c, h, w) = x.dim();
        let area = (h * w).max(1) as f32;
        let mut out = Array2::zeros((n, c));
        for ((b, ch), v) in out.indexed_iter_mut() {
            *v = x.slice(s![b, ch, .., ..]).sum() / area;
        }
        out
    }

    fn linear(
        &self,
        x: ArrayView2<f32>,
        w: ArrayView2<f32>,
        b: Option<ArrayView1<f32>>,
    ) -> DetectorResult<Array2<f32>> {
        if x.ncols() != w.ncols() {
            return Err(DetectorError::mismatch(
                "linear",
                format!("input has {} features, weight expects {}", x.ncols(), w.ncols()),
            ));
        }
        let mut y = x.dot(&w.t());
        if let Some(bias) = b {
            y += &bias;
        }
        Ok(y)
    }

    fn roi_pooling_2d(
        &self,
        x: ArrayView4<f32>,
        rois: ArrayView2<f32>,
        out_h: usize,
        out_w: usize,
        spatial_scale: f32,
    ) -> DetectorResult<Array4<f32>> {
        let (n, c, h, w) = x.dim();
        check_rois(&rois, n)?;
        let pooled: Vec<Array3<f32>> = rois
            .outer_iter()
            .into_par_iter()
            .map(|roi| {
                let features = x.index_axis(Axis(0), roi[0] as usize);
                let start_w = (roi[1] * spatial_scale).round() as isize;
                let start_h = (roi[2] * spatial_scale).round() as isize;
                let end_w = (roi[3] * spatial_scale).round() as isize;
                let end_h = (roi[4] * spatial_scale).round() as isize;
                let roi_w = (end_w - start_w + 1).max(1) as f32;
                let roi_h = (end_h - start_h + 1).max(1) as f32;
                let (bin_h, bin_w) = (roi_h / out_h as f32, roi_w / out_w as f32);

                let mut out = Array3::zeros((c, out_h, out_w));
                for ph in 0..out_h {
                    let hstart = ((ph as f32 * bin_h).floor() as isize + start_h).clamp(0, h as isize);
                    let hend = (((ph + 1) as f32 * bin_h).ceil() as isize + start_h).clamp(0, h as isize);
                    for pw in 0..out_w {
                        let wstart = ((pw as f32 * bin_w).floor() as isize + start_w).clamp(0, w as isize);
                        let wend = (((pw + 1) as f32 * bin_w).ceil() as isize + start_w).clamp(0, w as isize);
                        if hend <= hstart || wend <= wstart {
                            continue;
                        }
                        for ch in 0..c {
                            let window = features.slice(s![
                                ch,
                                hstart as usize..hend as usize,
                                wstart as usize..wend as usize
                            ]);
                            out[[ch, ph, pw]] = window.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
                        }
                    }
                }
                out
            })
            .collect();
        Ok(assemble(pooled, c, out_h, out_w))
    }

    fn roi_align_2d(
        &self,
        x: ArrayView4<f32>,
        rois: ArrayView2<f32>,
        out_h: usize,
        out_w: usize,
        spatial_scale: f32,
    ) -> DetectorResult<Array4<f32>> {
        let (n, c, _, _) = x.dim();
        check_rois(&rois, n)?;
        let pooled: Vec<Array3<f32>> = rois
            .outer_iter()
            .into_par_iter()
            .map(|roi| {
                let features = x.index_axis(Axis(0), roi[0] as usize);
                let start_w = roi[1] * spatial_scale;
                let start_h = roi[2] * spatial_scale;
                let roi_w = (roi[3] * spatial_scale - start_w).max(1.);
                let roi_h = (roi[4] * spatial_scale - start_h).max(1.);
                let (bin_h, bin_w) = (roi_h / out_h as f32, roi_w / out_w as f32);
                let grid_h = (roi_h / out_h as f32).ceil().max(1.) as usize;
                let grid_w = (roi_w / out_w as f32).ceil().max(1.) as usize;
                let count = (grid_h * grid_w) as f32;

                let mut out = Array3::zeros((c, out_h, out_w));
                for ch in 0..c {
                    let plane = features.index_axis(Axis(0), ch);
                    for ph in 0..out_h {
                        for pw in 0..out_w {
                            let mut sum = 0.;
                            for iy in 0..grid_h {
                                let y = start_h + ph as f32 * bin_h + (iy as f32 + 0.5) * bin_h / grid_h as f32;
                                for ix in 0..grid_w {
                                    let xx = start_w + pw as f32 * bin_w + (ix as f32 + 0.5) * bin_w / grid_w as f32;
                                    sum += bilinear(plane, y, xx);
                                }
                            }
                            out[[ch, ph, pw]] = sum / count;
                        }
                    }
                }
                out
            })
            .collect();
        Ok(assemble(pooled, c, out_h, out_w))
    }
}
