use nalgebra::{DMatrix, DVector};
use rand::Rng;

/// Fully connected layer `y = W x + b` with `W` stored `out x in`.
#[derive(Debug, Clone, PartialEq)]
pub struct Dense {
    pub weight: DMatrix<f64>,
    pub bias: DVector<f64>,
}

impl Dense {
    /// Xavier-uniform weights, zero bias.
    pub fn new<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        let limit = (6.0 / (in_features + out_features) as f64).sqrt();
        Self {
            weight: DMatrix::from_fn(out_features, in_features, |_, _| rng.gen_range(-limit..limit)),
            bias: DVector::zeros(out_features),
        }
    }

    pub fn zeros(in_features: usize, out_features: usize) -> Self {
        Self {
            weight: DMatrix::zeros(out_features, in_features),
            bias: DVector::zeros(out_features),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    pub fn forward(&self, x: &DVector<f64>) -> DVector<f64> {
        &self.weight * x + &self.bias
    }

    /// Accumulates parameter gradients into `grads` and returns `dL/dx`.
    pub fn backward(&self, x: &DVector<f64>, grad_out: &DVector<f64>, grads: &mut Dense) -> DVector<f64> {
        grads.weight.ger(1.0, grad_out, x, 1.0);
        grads.bias += grad_out;
        self.weight.tr_mul(grad_out)
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;

    #[test]
    fn xavier_bounds_hold() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let layer = Dense::new(10, 6, &mut rng);
        let limit = (6.0f64 / 16.0).sqrt();
        assert!(layer.weight.iter().all(|w| w.abs() <= limit));
        assert_eq!(layer.weight.shape(), (6, 10));
        assert!(layer.bias.iter().all(|b| *b == 0.0));
    }

    #[test]
    fn backward_matches_finite_difference() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let layer = Dense::new(3, 2, &mut rng);
        let x = DVector::from_vec(vec![0.3, -1.2, 0.8]);
        // L = sum(y)
        let grad_out = DVector::from_element(2, 1.0);
        let mut grads = Dense::zeros(3, 2);
        let dx = layer.backward(&x, &grad_out, &mut grads);

        let eps = 1e-6;
        for j in 0..3 {
            let mut xp = x.clone();
            xp[j] += eps;
            let mut xm = x.clone();
            xm[j] -= eps;
            let numeric = (layer.forward(&xp).sum() - layer.forward(&xm).sum()) / (2.0 * eps);
            assert!((numeric - dx[j]).abs() < 1e-6);
        }
        assert_eq!(grads.weight[(1, 2)], x[2]);
        assert_eq!(grads.bias[0], 1.0);
    }
}
