use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

/// Value distribution for a freshly created parameter array.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Initializer {
    /// Zero-mean normal with the given standard deviation.
    Normal(f32),
    /// Zero-mean normal scaled by `sqrt(2 / fan_in)`.
    HeNormal,
    Zero,
    Constant(f32),
}

impl Initializer {
    pub fn generate(&self, shape: &[usize], rng: &mut StdRng) -> ArrayD<f32> {
        let std = match *self {
            Initializer::Zero => return ArrayD::zeros(IxDyn(shape)),
            Initializer::Constant(v) => return ArrayD::from_elem(IxDyn(shape), v),
            Initializer::Normal(std) => std,
            Initializer::HeNormal => {
                let fan_in: usize = shape.iter().skip(1).product();
                (2. / fan_in.max(1) as f32).sqrt()
            }
        };
        match Normal::new(0., std) {
            Ok(dist) => ArrayD::from_shape_simple_fn(IxDyn(shape), || dist.sample(rng)),
            // only a non-finite deviation gets here
            Err(_) => ArrayD::zeros(IxDyn(shape)),
        }
    }
}
