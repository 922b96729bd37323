//! Single LSTM layer with explicit backpropagation through time.
//!
//! Gate rows are stacked `[input, forget, cell, output]` in both weight
//! matrices and the shared bias, so `W_ih` is `4H x in` and `W_hh` is `4H x H`.

use nalgebra::{DMatrix, DVector};
use rand::Rng;

#[derive(Debug, Clone, PartialEq)]
pub struct LstmLayer {
    pub w_ih: DMatrix<f64>,
    pub w_hh: DMatrix<f64>,
    pub bias: DVector<f64>,
}

/// Intermediates of one forward step kept for the backward pass.
#[derive(Debug, Clone)]
pub struct StepCache {
    x: DVector<f64>,
    h_prev: DVector<f64>,
    c_prev: DVector<f64>,
    i: DVector<f64>,
    f: DVector<f64>,
    g: DVector<f64>,
    o: DVector<f64>,
    tanh_c: DVector<f64>,
}

fn sigmoid(v: f64) -> f64 {
    1.0 / (1.0 + (-v).exp())
}

impl LstmLayer {
    /// Uniform `(-1/sqrt(H), 1/sqrt(H))` initialization for every tensor.
    pub fn new<R: Rng + ?Sized>(input_size: usize, hidden_size: usize, rng: &mut R) -> Self {
        let k = 1.0 / (hidden_size as f64).sqrt();
        let mut draw = |_: usize, _: usize| rng.gen_range(-k..k);
        let w_ih = DMatrix::from_fn(4 * hidden_size, input_size, &mut draw);
        let w_hh = DMatrix::from_fn(4 * hidden_size, hidden_size, &mut draw);
        let bias = DVector::from_fn(4 * hidden_size, &mut draw);
        Self { w_ih, w_hh, bias }
    }

    pub fn zeros(input_size: usize, hidden_size: usize) -> Self {
        Self {
            w_ih: DMatrix::zeros(4 * hidden_size, input_size),
            w_hh: DMatrix::zeros(4 * hidden_size, hidden_size),
            bias: DVector::zeros(4 * hidden_size),
        }
    }

    pub fn input_size(&self) -> usize {
        self.w_ih.ncols()
    }

    pub fn hidden_size(&self) -> usize {
        self.w_hh.ncols()
    }

    fn step(&self, x: &DVector<f64>, h_prev: &DVector<f64>, c_prev: &DVector<f64>) -> (DVector<f64>, DVector<f64>, StepCache) {
        let h = self.hidden_size();
        let z = &self.w_ih * x + &self.w_hh * h_prev + &self.bias;

        let i = z.rows(0, h).map(sigmoid);
        let f = z.rows(h, h).map(sigmoid);
        let g = z.rows(2 * h, h).map(f64::tanh);
        let o = z.rows(3 * h, h).map(sigmoid);

        let c = f.component_mul(c_prev) + i.component_mul(&g);
        let tanh_c = c.map(f64::tanh);
        let h_next = o.component_mul(&tanh_c);

        let cache = StepCache {
            x: x.clone(),
            h_prev: h_prev.clone(),
            c_prev: c_prev.clone(),
            i,
            f,
            g,
            o,
            tanh_c,
        };
        (h_next, c, cache)
    }

    /// Runs a whole sequence from a zero state.
    pub fn forward(&self, inputs: &[DVector<f64>]) -> (Vec<DVector<f64>>, Vec<StepCache>) {
        let mut h = DVector::zeros(self.hidden_size());
        let mut c = DVector::zeros(self.hidden_size());
        let mut outputs = Vec::with_capacity(inputs.len());
        let mut caches = Vec::with_capacity(inputs.len());

        for x in inputs {
            let (h_next, c_next, cache) = self.step(x, &h, &c);
            outputs.push(h_next.clone());
            caches.push(cache);
            h = h_next;
            c = c_next;
        }
        (outputs, caches)
    }

    /// Backpropagates `dL/dh_t` for every step; returns `dL/dx_t`.
    pub fn backward(&self, caches: &[StepCache], dh_out: &[DVector<f64>], grads: &mut LstmLayer) -> Vec<DVector<f64>> {
        let h = self.hidden_size();
        let mut dh_next = DVector::zeros(h);
        let mut dc_next = DVector::zeros(h);
        let mut dx = vec![DVector::zeros(self.input_size()); caches.len()];

        for t in (0..caches.len()).rev() {
            let cache = &caches[t];
            let dh = &dh_out[t] + &dh_next;

            let d_o = dh.component_mul(&cache.tanh_c);
            let dc = &dc_next
                + dh.component_mul(&cache.o)
                    .component_mul(&cache.tanh_c.map(|v| 1.0 - v * v));
            let d_i = dc.component_mul(&cache.g);
            let d_g = dc.component_mul(&cache.i);
            let d_f = dc.component_mul(&cache.c_prev);
            dc_next = dc.component_mul(&cache.f);

            let mut dz = DVector::zeros(4 * h);
            dz.rows_mut(0, h)
                .copy_from(&d_i.zip_map(&cache.i, |d, s| d * s * (1.0 - s)));
            dz.rows_mut(h, h)
                .copy_from(&d_f.zip_map(&cache.f, |d, s| d * s * (1.0 - s)));
            dz.rows_mut(2 * h, h)
                .copy_from(&d_g.zip_map(&cache.g, |d, s| d * (1.0 - s * s)));
            dz.rows_mut(3 * h, h)
                .copy_from(&d_o.zip_map(&cache.o, |d, s| d * s * (1.0 - s)));

            grads.w_ih.ger(1.0, &dz, &cache.x, 1.0);
            grads.w_hh.ger(1.0, &dz, &cache.h_prev, 1.0);
            grads.bias += &dz;

            dx[t] = self.w_ih.tr_mul(&dz);
            dh_next = self.w_hh.tr_mul(&dz);
        }
        dx
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;

    fn sequence() -> Vec<DVector<f64>> {
        vec![
            DVector::from_vec(vec![0.5, -0.2]),
            DVector::from_vec(vec![0.1, 0.4]),
            DVector::from_vec(vec![-0.3, 0.9]),
        ]
    }

    // L = sum over steps of sum(h_t)
    fn loss(layer: &LstmLayer, inputs: &[DVector<f64>]) -> f64 {
        layer.forward(inputs).0.iter().map(|h| h.sum()).sum()
    }

    #[test]
    fn output_shapes() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let layer = LstmLayer::new(2, 4, &mut rng);
        let (outputs, caches) = layer.forward(&sequence());
        assert_eq!(outputs.len(), 3);
        assert_eq!(caches.len(), 3);
        assert!(outputs.iter().all(|h| h.len() == 4 && h.iter().all(|v| v.abs() < 1.0)));
    }

    #[test]
    fn weight_gradients_match_finite_difference() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let layer = LstmLayer::new(2, 3, &mut rng);
        let inputs = sequence();

        let (_, caches) = layer.forward(&inputs);
        let ones = vec![DVector::from_element(3, 1.0); inputs.len()];
        let mut grads = LstmLayer::zeros(2, 3);
        let dx = layer.backward(&caches, &ones, &mut grads);

        let eps = 1e-6;
        for (r, c) in [(0, 0), (4, 1), (7, 0), (11, 1)] {
            let mut plus = layer.clone();
            plus.w_ih[(r, c)] += eps;
            let mut minus = layer.clone();
            minus.w_ih[(r, c)] -= eps;
            let numeric = (loss(&plus, &inputs) - loss(&minus, &inputs)) / (2.0 * eps);
            assert!((numeric - grads.w_ih[(r, c)]).abs() < 1e-5, "w_ih[{r},{c}]");
        }

        for (r, c) in [(1, 2), (6, 0), (10, 1)] {
            let mut plus = layer.clone();
            plus.w_hh[(r, c)] += eps;
            let mut minus = layer.clone();
            minus.w_hh[(r, c)] -= eps;
            let numeric = (loss(&plus, &inputs) - loss(&minus, &inputs)) / (2.0 * eps);
            assert!((numeric - grads.w_hh[(r, c)]).abs() < 1e-5, "w_hh[{r},{c}]");
        }

        let mut shifted = inputs.clone();
        shifted[0][1] += eps;
        let mut back = inputs.clone();
        back[0][1] -= eps;
        let numeric = (loss(&layer, &shifted) - loss(&layer, &back)) / (2.0 * eps);
        assert!((numeric - dx[0][1]).abs() < 1e-5);
    }
}
