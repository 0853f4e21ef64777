use ndarray::{Array2, Array4, ArrayView2, ArrayView4};

use crate::common::{DetectorResult, Proposal};
use crate::detection_runners::backend::Backend;

/// Column permutation between `(index, y_min, x_min, y_max, x_max)` and
/// `(index, x_min, y_min, x_max, y_max)`.
const XY_ORDER: [usize; 5] = [0, 2, 1, 4, 3];

/// Flattens proposals into one `(R, 5)` table, row `i` being
/// `[image_index, y_min, x_min, y_max, x_max]` of proposal `i`.
pub fn to_batch(proposals: &[Proposal]) -> (Array2<f32>, Vec<usize>) {
    let mut table = Array2::zeros((proposals.len(), 5));
    for (mut row, p) in table.outer_iter_mut().zip(proposals.iter()) {
        let [y_min, x_min, y_max, x_max] = p.bbox.to_array();
        row.assign(&ndarray::arr1(&[p.image_index as f32, y_min, x_min, y_max, x_max]));
    }
    let indices = proposals.iter().map(|p| p.image_index).collect();
    (table, indices)
}

/// Swaps the y and x columns. Applying it twice gives back the input.
pub fn reorder_axes(table: ArrayView2<f32>) -> Array2<f32> {
    table.select(ndarray::Axis(1), &XY_ORDER)
}

/// Pools one fixed-size feature per row of `table` from `features`.
pub fn pool(
    backend: &dyn Backend,
    features: ArrayView4<f32>,
    table: ArrayView2<f32>,
    out_h: usize,
    out_w: usize,
    spatial_scale: f32,
    use_alignment: bool,
) -> DetectorResult<Array4<f32>> {
    let xy = reorder_axes(table);
    if use_alignment {
        backend.roi_align_2d(features, xy.view(), out_h, out_w, spatial_scale)
    } else {
        backend.roi_pooling_2d(features, xy.view(), out_h, out_w, spatial_scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::BBox;
    use crate::detection_runners::backend::NdArrayBackend;
    use ndarray::{arr2, Array};

    #[test]
    fn rows_follow_input_order() {
        let proposals = vec![
            Proposal::new(BBox::new(1., 2., 3., 4.), 1),
            Proposal::new(BBox::new(5., 6., 7., 8.), 0),
            Proposal::new(BBox::new(9., 10., 11., 12.), 1),
        ];
        let (table, indices) = to_batch(&proposals);
        assert_eq!(table.dim(), (3, 5));
        assert_eq!(table, arr2(&[[1., 1., 2., 3., 4.], [0., 5., 6., 7., 8.], [1., 9., 10., 11., 12.]]));
        assert_eq!(indices, vec![1, 0, 1]);
    }

    #[test]
    fn empty_batch_has_no_rows() {
        let (table, indices) = to_batch(&[]);
        assert_eq!(table.dim(), (0, 5));
        assert!(indices.is_empty());
    }

    #[test]
    fn reorder_is_an_involution() {
        let table = Array::from_shape_fn((7, 5), |(r, c)| (r * 5 + c) as f32 * 0.5);
        let once = reorder_axes(table.view());
        assert_eq!(once.row(0).to_vec(), vec![0., 1., 0.5, 2., 1.5]);
        assert_eq!(reorder_axes(once.view()), table);
    }

    #[test]
    fn dispatch_selects_the_kernel() {
        let backend = NdArrayBackend::default();
        let features = Array::from_shape_fn((1, 1, 4, 4), |(_, _, y, x)| (y * 4 + x) as f32);
        // y range 0..1, x range 2..3 in (y, x) order
        let table = arr2(&[[0., 0., 2., 1., 3.]]);
        let pooled = pool(&backend, features.view(), table.view(), 1, 1, 1., false).unwrap();
        assert_eq!(pooled[[0, 0, 0, 0]], 7.);
        let aligned = pool(&backend, features.view(), table.view(), 1, 1, 1., true).unwrap();
        assert_eq!(aligned.dim(), (1, 1, 1, 1));
        assert!(aligned[[0, 0, 0, 0]] < 7.);
    }
}
