use std::collections::BTreeMap;

use ndarray::ArrayD;

use crate::common::{Composite, DetectorError, DetectorResult, LeafRole, Node};

/// Gradients keyed by the hierarchical name of the trainable array they belong to.
pub type Gradients = BTreeMap<String, ArrayD<f32>>;

/// Momentum SGD with an L2 weight-decay hook applied to the gradients first.
#[derive(Debug, Clone)]
pub struct MomentumSgd {
    pub lr: f32,
    pub momentum: f32,
    pub weight_decay: f32,
    velocity: BTreeMap<String, ArrayD<f32>>,
}

impl MomentumSgd {
    pub fn new(lr: f32, momentum: f32, weight_decay: f32) -> Self {
        Self {
            lr,
            momentum,
            weight_decay,
            velocity: BTreeMap::new(),
        }
    }

    /// Multiplies the learning rate by `rate`.
    pub fn shift_lr(&mut self, rate: f32) {
        self.lr *= rate;
    }

    /// Updates every parameter that has a gradient; the rest are left alone.
    /// Nothing changes if a gradient names an unknown parameter or has the wrong shape.
    pub fn update(&mut self, params: &mut Composite, grads: &Gradients) -> DetectorResult<()> {
        {
            let leaves = params.named_leaves();
            let trainable: BTreeMap<&str, &ArrayD<f32>> = leaves
                .iter()
                .filter_map(|(name, node)| match node {
                    Node::Array(leaf) if leaf.role == LeafRole::Trainable => Some((name.as_str(), &leaf.data)),
                    _ => None,
                })
                .collect();
            for (name, grad) in grads.iter() {
                let param = trainable
                    .get(name.as_str())
                    .ok_or_else(|| DetectorError::mismatch(name.clone(), "gradient for an unknown parameter"))?;
                if param.shape() != grad.shape() {
                    return Err(DetectorError::mismatch(
                        name.clone(),
                        format!("gradient shape {:?} for parameter {:?}", grad.shape(), param.shape()),
                    ));
                }
            }
        }

        let (lr, momentum, weight_decay) = (self.lr, self.momentum, self.weight_decay);
        let velocity = &mut self.velocity;
        params.visit_params_mut("", &mut |name: &str, w: &mut ArrayD<f32>| {
            let Some(grad) = grads.get(name) else {
                return;
            };
            let g = grad + &(&*w * weight_decay);
            let v = velocity
                .entry(name.to_string())
                .or_insert_with(|| ArrayD::zeros(w.raw_dim()));
            *v *= momentum;
            v.scaled_add(-lr, &g);
            *w += &*v;
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    fn params() -> Composite {
        Composite::chain().with_child(
            "fc",
            Composite::link()
                .with_param("W", ArrayD::from_elem(IxDyn(&[2]), 1.))
                .with_persistent("avg", ArrayD::from_elem(IxDyn(&[2]), 1.)),
        )
    }

    #[test]
    fn applies_momentum_and_decay() {
        let mut p = params();
        let mut opt = MomentumSgd::new(0.1, 0.9, 0.5);
        let grads: Gradients = [("fc/W".to_string(), ArrayD::from_elem(IxDyn(&[2]), 1.))].into();
        opt.update(&mut p, &grads).unwrap();
        // g = 1 + 0.5 * 1, v = -0.15
        let w = p.child("fc").unwrap().array("W").unwrap()[[0]];
        assert!((w - 0.85).abs() < 1e-6);
        opt.update(&mut p, &grads).unwrap();
        // g = 1 + 0.425, v = 0.9 * -0.15 - 0.1425
        let w = p.child("fc").unwrap().array("W").unwrap()[[0]];
        assert!((w - (0.85 - 0.135 - 0.1425)).abs() < 1e-6);
        assert_eq!(p.child("fc").unwrap().array("avg").unwrap()[[0]], 1.);
    }

    #[test]
    fn unknown_gradient_leaves_params_untouched() {
        let mut p = params();
        let grads: Gradients = [
            ("fc/W".to_string(), ArrayD::from_elem(IxDyn(&[2]), 1.)),
            ("fc/avg".to_string(), ArrayD::from_elem(IxDyn(&[2]), 1.)),
        ]
        .into();
        let err = MomentumSgd::new(0.1, 0.9, 0.).update(&mut p, &grads).unwrap_err();
        assert!(matches!(err, DetectorError::StructuralMismatch { .. }));
        assert_eq!(p, params());
    }

    #[test]
    fn lr_shift_is_multiplicative() {
        let mut opt = MomentumSgd::new(1e-3, 0.9, 5e-4);
        opt.shift_lr(0.1);
        assert!((opt.lr - 1e-4).abs() < 1e-9);
    }
}
