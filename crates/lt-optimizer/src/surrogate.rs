//! Gaussian-process surrogate and expected-improvement acquisition.
//!
//! Inputs are expected in the unit cube (see [`SearchSpace::normalize`]).
//! Targets are standardized before fitting, and the kernel is an isotropic
//! RBF with unit signal variance. Length scale and noise are picked from
//! small fixed grids by log marginal likelihood; observation counts in an HPO
//! run stay in the tens, so the O(n^3) factorization is not a concern.
//!
//! [`SearchSpace::normalize`]: crate::SearchSpace::normalize

use lt_types::{internal_error, LtResult, OptimizationError};

const LENGTH_SCALES: [f64; 6] = [0.05, 0.1, 0.2, 0.35, 0.6, 1.0];
const NOISE_LEVELS: [f64; 3] = [1e-6, 1e-4, 1e-2];
const JITTER: [f64; 4] = [0.0, 1e-10, 1e-8, 1e-6];

/// Below this predictive std the improvement is treated as deterministic.
const MIN_STD: f64 = 1e-9;

/// Log-EI switches to its asymptotic form below this z.
const LOG_EI_TAIL: f64 = -6.0;

/// Fitted Gaussian-process regression model.
#[derive(Debug, Clone)]
pub struct GaussianProcess {
    inputs: Vec<Vec<f64>>,
    /// Lower Cholesky factor of K + noise*I.
    chol: Vec<Vec<f64>>,
    /// (K + noise*I)^-1 y on standardized targets.
    alpha: Vec<f64>,
    y_mean: f64,
    y_scale: f64,
    length_scale: f64,
    noise: f64,
    log_marginal_likelihood: f64,
}

impl GaussianProcess {
    /// Fit the model, selecting length scale and noise by marginal likelihood.
    pub fn fit(inputs: &[Vec<f64>], targets: &[f64]) -> LtResult<Self> {
        let (y_mean, y_scale, standardized) = standardize(inputs, targets)?;

        let mut best: Option<Self> = None;
        for &length_scale in &LENGTH_SCALES {
            for &noise in &NOISE_LEVELS {
                let Some(model) =
                    Self::fit_standardized(inputs, &standardized, y_mean, y_scale, length_scale, noise)
                else {
                    continue;
                };
                if best
                    .as_ref()
                    .map_or(true, |b| model.log_marginal_likelihood > b.log_marginal_likelihood)
                {
                    best = Some(model);
                }
            }
        }

        best.ok_or_else(|| OptimizationError::NotPositiveDefinite.into())
    }

    /// Fit with fixed kernel hyperparameters.
    pub fn with_params(
        inputs: &[Vec<f64>],
        targets: &[f64],
        length_scale: f64,
        noise: f64,
    ) -> LtResult<Self> {
        let (y_mean, y_scale, standardized) = standardize(inputs, targets)?;
        Self::fit_standardized(inputs, &standardized, y_mean, y_scale, length_scale, noise)
            .ok_or_else(|| OptimizationError::NotPositiveDefinite.into())
    }

    fn fit_standardized(
        inputs: &[Vec<f64>],
        ys: &[f64],
        y_mean: f64,
        y_scale: f64,
        length_scale: f64,
        noise: f64,
    ) -> Option<Self> {
        let n = inputs.len();
        let kernel: Vec<Vec<f64>> = inputs
            .iter()
            .map(|a| inputs.iter().map(|b| rbf(a, b, length_scale)).collect())
            .collect();

        for jitter in JITTER {
            let mut k = kernel.clone();
            for (i, row) in k.iter_mut().enumerate() {
                row[i] += noise + jitter;
            }
            let Some(chol) = cholesky(&k) else {
                continue;
            };

            let alpha = solve_upper_transposed(&chol, &solve_lower(&chol, ys));
            let data_fit: f64 = ys.iter().zip(&alpha).map(|(y, a)| y * a).sum();
            let log_det: f64 = (0..n).map(|i| chol[i][i].ln()).sum();
            let log_marginal_likelihood = -0.5 * data_fit
                - log_det
                - 0.5 * n as f64 * (2.0 * std::f64::consts::PI).ln();

            return Some(Self {
                inputs: inputs.to_vec(),
                chol,
                alpha,
                y_mean,
                y_scale,
                length_scale,
                noise,
                log_marginal_likelihood,
            });
        }
        None
    }

    /// Predictive mean and standard deviation at `x`, in target units.
    pub fn predict(&self, x: &[f64]) -> (f64, f64) {
        let k_star: Vec<f64> = self
            .inputs
            .iter()
            .map(|xi| rbf(x, xi, self.length_scale))
            .collect();

        let mean: f64 = k_star.iter().zip(&self.alpha).map(|(k, a)| k * a).sum();
        let v = solve_lower(&self.chol, &k_star);
        let variance = (1.0 - v.iter().map(|vi| vi * vi).sum::<f64>()).max(0.0);

        (
            self.y_mean + self.y_scale * mean,
            self.y_scale * variance.sqrt(),
        )
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn length_scale(&self) -> f64 {
        self.length_scale
    }

    pub fn noise(&self) -> f64 {
        self.noise
    }

    pub fn log_marginal_likelihood(&self) -> f64 {
        self.log_marginal_likelihood
    }
}

fn standardize(inputs: &[Vec<f64>], targets: &[f64]) -> LtResult<(f64, f64, Vec<f64>)> {
    if inputs.is_empty() {
        return Err(OptimizationError::NoObservations.into());
    }
    if inputs.len() != targets.len() {
        return Err(internal_error!(
            "{} inputs but {} targets",
            inputs.len(),
            targets.len()
        ));
    }

    let n = targets.len() as f64;
    let mean = targets.iter().sum::<f64>() / n;
    let var = targets.iter().map(|y| (y - mean).powi(2)).sum::<f64>() / n;
    let scale = if var.sqrt() > 1e-12 { var.sqrt() } else { 1.0 };
    let standardized = targets.iter().map(|y| (y - mean) / scale).collect();
    Ok((mean, scale, standardized))
}

fn rbf(a: &[f64], b: &[f64], length_scale: f64) -> f64 {
    let dist_sq: f64 = a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum();
    (-0.5 * dist_sq / (length_scale * length_scale)).exp()
}

/// Lower Cholesky factor, or `None` if `a` is not positive definite.
fn cholesky(a: &[Vec<f64>]) -> Option<Vec<Vec<f64>>> {
    let n = a.len();
    let mut l = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..=i {
            let sum: f64 = (0..j).map(|k| l[i][k] * l[j][k]).sum();
            if i == j {
                let d = a[i][i] - sum;
                if d <= 0.0 || !d.is_finite() {
                    return None;
                }
                l[i][j] = d.sqrt();
            } else {
                l[i][j] = (a[i][j] - sum) / l[j][j];
            }
        }
    }
    Some(l)
}

/// Solve L x = b by forward substitution.
fn solve_lower(l: &[Vec<f64>], b: &[f64]) -> Vec<f64> {
    let n = b.len();
    let mut x = vec![0.0; n];
    for i in 0..n {
        let sum: f64 = (0..i).map(|k| l[i][k] * x[k]).sum();
        x[i] = (b[i] - sum) / l[i][i];
    }
    x
}

/// Solve L^T x = b by back substitution.
fn solve_upper_transposed(l: &[Vec<f64>], b: &[f64]) -> Vec<f64> {
    let n = b.len();
    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let sum: f64 = (i + 1..n).map(|k| l[k][i] * x[k]).sum();
        x[i] = (b[i] - sum) / l[i][i];
    }
    x
}

// ---------------------------------------------------------------------------
// Acquisition
// ---------------------------------------------------------------------------

/// Expected improvement over `best` for a Gaussian prediction.
pub fn expected_improvement(mean: f64, std: f64, best: f64) -> f64 {
    if std < MIN_STD {
        return (mean - best).max(0.0);
    }
    let z = (mean - best) / std;
    (std * (normal_pdf(z) + z * normal_cdf(z))).max(0.0)
}

/// Natural log of expected improvement, stable far below the incumbent.
///
/// Returns `-inf` only when the prediction is certain and not an improvement.
pub fn log_expected_improvement(mean: f64, std: f64, best: f64) -> f64 {
    if std < MIN_STD {
        let improvement = mean - best;
        return if improvement > 0.0 {
            improvement.ln()
        } else {
            f64::NEG_INFINITY
        };
    }

    let z = (mean - best) / std;
    if z > LOG_EI_TAIL {
        let h = normal_pdf(z) + z * normal_cdf(z);
        if h > 0.0 {
            return std.ln() + h.ln();
        }
    }
    // phi(z) + z*Phi(z) ~ phi(z) / z^2 as z -> -inf
    std.ln() + log_normal_pdf(z) - 2.0 * z.abs().max(1.0).ln()
}

fn normal_pdf(z: f64) -> f64 {
    log_normal_pdf(z).exp()
}

fn log_normal_pdf(z: f64) -> f64 {
    -0.5 * z * z - 0.5 * (2.0 * std::f64::consts::PI).ln()
}

fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2))
}

/// Abramowitz and Stegun 7.1.26.
fn erf(x: f64) -> f64 {
    const A1: f64 = 0.254_829_592;
    const A2: f64 = -0.284_496_736;
    const A3: f64 = 1.421_413_741;
    const A4: f64 = -1.453_152_027;
    const A5: f64 = 1.061_405_429;
    const P: f64 = 0.327_591_1;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - (((((A5 * t + A4) * t) + A3) * t + A2) * t + A1) * t * (-x * x).exp();
    sign * y
}
