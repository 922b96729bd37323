/// Adam optimizer over flat parameter slices.
///
/// Moment buffers are allocated on the first step and matched to the
/// parameter slices by position, so every step must pass the same slices in
/// the same order.
#[derive(Debug, Clone)]
pub struct Adam {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    t: i32,
    m: Vec<Vec<f64>>,
    v: Vec<Vec<f64>>,
}

impl Adam {
    pub fn new(lr: f64) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    pub fn steps_taken(&self) -> i32 {
        self.t
    }

    pub fn step(&mut self, params: Vec<&mut [f64]>, grads: Vec<&[f64]>) {
        if self.m.is_empty() {
            self.m = grads.iter().map(|g| vec![0.0; g.len()]).collect();
            self.v = grads.iter().map(|g| vec![0.0; g.len()]).collect();
        }

        self.t += 1;
        let bias1 = 1.0 - self.beta1.powi(self.t);
        let bias2 = 1.0 - self.beta2.powi(self.t);

        for (idx, (param, grad)) in params.into_iter().zip(grads).enumerate() {
            let m = &mut self.m[idx];
            let v = &mut self.v[idx];
            for j in 0..param.len() {
                let g = grad[j];
                m[j] = self.beta1 * m[j] + (1.0 - self.beta1) * g;
                v[j] = self.beta2 * v[j] + (1.0 - self.beta2) * g * g;
                let m_hat = m[j] / bias1;
                let v_hat = v[j] / bias2;
                param[j] -= self.lr * m_hat / (v_hat.sqrt() + self.eps);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_step_moves_by_learning_rate() {
        let mut adam = Adam::new(0.1);
        let mut w = vec![1.0, -2.0];
        adam.step(vec![w.as_mut_slice()], vec![&[4.0, -0.5][..]]);
        assert!((w[0] - 0.9).abs() < 1e-6);
        assert!((w[1] + 1.9).abs() < 1e-6);
        assert_eq!(adam.steps_taken(), 1);
    }

    #[test]
    fn minimizes_a_quadratic() {
        let mut adam = Adam::new(0.05);
        let mut x = vec![3.0];
        for _ in 0..2000 {
            let grad = [2.0 * (x[0] - 1.0)];
            adam.step(vec![x.as_mut_slice()], vec![&grad[..]]);
        }
        assert!((x[0] - 1.0).abs() < 1e-2);
    }
}
