//! Gaussian negative log-likelihood for the mixture-density head.
//!
//! The head emits a raw scale `s` per species and `sigma = exp(s)`, so the
//! variance is positive for every finite output.
//!
//! Per element: `0.5 * (log(sigma^2) + (y - mu)^2 / sigma^2)`.

use nalgebra::DVector;

/// Summed NLL over the elements of one time step.
pub fn gaussian_nll(mu: &DVector<f64>, log_sigma: &DVector<f64>, target: &DVector<f64>) -> f64 {
    mu.iter()
        .zip(log_sigma.iter())
        .zip(target.iter())
        .map(|((m, s), y)| {
            let var = (2.0 * s).exp();
            0.5 * (2.0 * s + (y - m).powi(2) / var)
        })
        .sum()
}

/// Gradients of the summed NLL with respect to `mu` and the raw scale `s`.
pub fn gaussian_nll_grad(
    mu: &DVector<f64>,
    log_sigma: &DVector<f64>,
    target: &DVector<f64>,
) -> (DVector<f64>, DVector<f64>) {
    let n = mu.len();
    let mut d_mu = DVector::zeros(n);
    let mut d_s = DVector::zeros(n);
    for k in 0..n {
        let var = (2.0 * log_sigma[k]).exp();
        let resid = target[k] - mu[k];
        d_mu[k] = -resid / var;
        d_s[k] = 1.0 - resid * resid / var;
    }
    (d_mu, d_s)
}
