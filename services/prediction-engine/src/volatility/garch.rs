//! GARCH(1,1) conditional volatility estimation
//!
//! Fits `h_t = omega + alpha * e_{t-1}^2 + beta * h_{t-1}` with Gaussian
//! log-likelihood by projected gradient ascent, then forecasts forward
//! volatility from the last fitted variance.
//!
//! Gradients follow the variance recursion through time. Each step is
//! normalized per parameter by running moment estimates and taken in
//! coordinates scaled by the sample variance, so omega and mu move at the
//! same relative pace as alpha and beta.

use crate::error::{PredictionError, PredictionResult};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::f64::consts::PI;
use tracing::debug;

/// Lower bound for any conditional variance
pub const VARIANCE_FLOOR: f64 = 1e-8;
/// Lower bound for omega
pub const OMEGA_FLOOR: f64 = 1e-8;
/// Upper bound for alpha
pub const ALPHA_MAX: f64 = 0.5;
/// Upper bound for beta
pub const BETA_MAX: f64 = 0.95;
/// Target persistence when `alpha + beta` reaches 1
pub const PERSISTENCE_RESCALE: f64 = 0.99;

const INITIAL_OMEGA: f64 = 1e-4;
const INITIAL_ALPHA: f64 = 0.1;
const INITIAL_BETA: f64 = 0.85;
/// Free parameters: omega, alpha, beta, mu
const FREE_PARAMETERS: f64 = 4.0;

const FIRST_MOMENT_DECAY: f64 = 0.9;
const SECOND_MOMENT_DECAY: f64 = 0.999;
const MOMENT_EPSILON: f64 = 1e-8;

/// GARCH estimator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GarchConfig {
    /// Iteration cap for the fit
    pub max_iterations: usize,
    /// Stop once the best log-likelihood improves by less than this
    pub tolerance: f64,
    /// Base step in scaled coordinates, decayed as `rate / (1 + 0.1 * iteration)`
    pub learning_rate: f64,
    /// Minimum number of returns required to fit
    pub min_returns: usize,
}

impl Default for GarchConfig {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            tolerance: 1e-6,
            learning_rate: 0.02,
            min_returns: 50,
        }
    }
}

/// Fitted GARCH(1,1) parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GarchParameters {
    /// Constant variance term
    pub omega: f64,
    /// Weight of the previous squared shock
    pub alpha: f64,
    /// Weight of the previous variance
    pub beta: f64,
    /// Asymmetric (leverage) term, unused by the symmetric model
    pub gamma: Option<f64>,
    /// Mean return
    pub mu: f64,
    /// Gaussian log-likelihood at these parameters
    pub log_likelihood: f64,
    /// Akaike information criterion
    pub aic: f64,
    /// Bayesian information criterion
    pub bic: f64,
}

impl GarchParameters {
    /// `alpha + beta`
    pub fn persistence(&self) -> f64 {
        self.alpha + self.beta
    }

    /// Long-run variance `omega / (1 - alpha - beta)`
    pub fn unconditional_variance(&self) -> f64 {
        self.omega / (1.0 - self.persistence())
    }
}

/// Parameters and likelihood observed at one fit iteration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationState {
    /// Zero-based iteration number
    pub iteration: usize,
    /// Log-likelihood evaluated at the start of this iteration
    pub log_likelihood: f64,
    /// Step size used this iteration
    pub learning_rate: f64,
    /// Omega carried into the next iteration
    pub omega: f64,
    /// Alpha carried into the next iteration
    pub alpha: f64,
    /// Beta carried into the next iteration
    pub beta: f64,
    /// Mu carried into the next iteration
    pub mu: f64,
}

#[derive(Debug, Clone, Copy)]
struct Params {
    omega: f64,
    alpha: f64,
    beta: f64,
    mu: f64,
}

impl Params {
    fn to_array(self) -> [f64; 4] {
        [self.omega, self.alpha, self.beta, self.mu]
    }

    fn from_array([omega, alpha, beta, mu]: [f64; 4]) -> Self {
        Self {
            omega,
            alpha,
            beta,
            mu,
        }
    }

    fn constrain(&mut self) {
        self.omega = if self.omega.is_finite() {
            self.omega.max(OMEGA_FLOOR)
        } else {
            INITIAL_OMEGA
        };
        self.alpha = clamp_finite(self.alpha, 0.0, ALPHA_MAX);
        self.beta = clamp_finite(self.beta, 0.0, BETA_MAX);
        if !self.mu.is_finite() {
            self.mu = 0.0;
        }

        let persistence = self.alpha + self.beta;
        if persistence >= 1.0 {
            let scale = PERSISTENCE_RESCALE / persistence;
            self.alpha *= scale;
            self.beta *= scale;
        }
    }
}

fn clamp_finite(value: f64, min: f64, max: f64) -> f64 {
    if value.is_finite() { value.clamp(min, max) } else { min }
}

/// Bias-corrected running moments of the scaled gradient
#[derive(Debug, Default)]
struct StepNormalizer {
    first: [f64; 4],
    second: [f64; 4],
    steps: i32,
}

impl StepNormalizer {
    /// Per-coordinate step direction with magnitude near one
    fn direction(&mut self, gradient: [f64; 4]) -> [f64; 4] {
        self.steps += 1;
        let first_correction = 1.0 - FIRST_MOMENT_DECAY.powi(self.steps);
        let second_correction = 1.0 - SECOND_MOMENT_DECAY.powi(self.steps);

        let mut direction = [0.0; 4];
        for k in 0..4 {
            let g = if gradient[k].is_finite() { gradient[k] } else { 0.0 };
            self.first[k] = FIRST_MOMENT_DECAY * self.first[k] + (1.0 - FIRST_MOMENT_DECAY) * g;
            self.second[k] =
                SECOND_MOMENT_DECAY * self.second[k] + (1.0 - SECOND_MOMENT_DECAY) * g * g;
            let first = self.first[k] / first_correction;
            let second = self.second[k] / second_correction;
            direction[k] = first / (second.sqrt() + MOMENT_EPSILON);
        }
        direction
    }
}

/// Result of a GARCH fit
#[derive(Debug, Clone)]
pub struct GarchFit {
    /// Best parameters found
    pub parameters: GarchParameters,
    /// Returns the model was fitted to
    pub returns: Vec<f64>,
    /// Conditional variance path at the best parameters
    pub conditional_variances: Vec<f64>,
    /// Iterations run
    pub iterations: usize,
    /// Whether the tolerance was reached before the iteration cap
    pub converged: bool,
}

impl GarchFit {
    /// Volatility forecast for `horizon` steps past the last observation
    pub fn forecast(&self, horizon: usize) -> Vec<f64> {
        let p = &self.parameters;
        let mut variance = self
            .conditional_variances
            .last()
            .copied()
            .unwrap_or(VARIANCE_FLOOR);

        (0..horizon)
            .map(|_| {
                variance = (p.omega + (p.alpha + p.beta) * variance).max(0.0);
                variance.sqrt()
            })
            .collect()
    }

    /// Fitted variances against squared mean-centred returns: `(ss_res, ss_tot)`
    fn sums_of_squares(&self) -> (f64, f64) {
        let mu = self.parameters.mu;
        let squared: Vec<f64> = self.returns.iter().map(|r| (r - mu).powi(2)).collect();
        let mean = squared.iter().mean();

        let ss_tot = squared.iter().map(|s| (s - mean).powi(2)).sum::<f64>();
        let ss_res = squared
            .iter()
            .zip(&self.conditional_variances)
            .map(|(s, h)| (s - h).powi(2))
            .sum::<f64>();
        (ss_res, ss_tot)
    }

    /// Coefficient of determination of the variance fit, at least 0
    pub fn r2(&self) -> f64 {
        let (ss_res, ss_tot) = self.sums_of_squares();
        if ss_tot <= 0.0 || !ss_tot.is_finite() {
            return 0.0;
        }
        (1.0 - ss_res / ss_tot).max(0.0)
    }

    /// Mean squared error of the variance fit
    pub fn mse(&self) -> f64 {
        if self.returns.is_empty() {
            return 0.0;
        }
        self.sums_of_squares().0 / self.returns.len() as f64
    }

    /// `r2` clamped to `[0, 1]`
    pub fn confidence(&self) -> f64 {
        self.r2().clamp(0.0, 1.0)
    }
}

/// Log returns of consecutive closes, skipping steps with a non-positive prior close
pub fn log_returns(prices: &[f64]) -> Vec<f64> {
    prices
        .windows(2)
        .filter(|w| w[0] > 0.0 && w[1] > 0.0 && w[0].is_finite() && w[1].is_finite())
        .map(|w| (w[1] / w[0]).ln())
        .collect()
}

/// GARCH(1,1) maximum-likelihood estimator
#[derive(Debug, Clone, Default)]
pub struct GarchEstimator {
    config: GarchConfig,
}

impl GarchEstimator {
    /// Estimator with `config`
    pub fn new(config: GarchConfig) -> Self {
        Self { config }
    }

    /// Estimator configuration
    pub fn config(&self) -> &GarchConfig {
        &self.config
    }

    /// Fit to the log returns of `prices`
    pub fn fit_prices(&self, prices: &[f64]) -> PredictionResult<GarchFit> {
        self.fit(&log_returns(prices))
    }

    /// Fit to `returns`
    pub fn fit(&self, returns: &[f64]) -> PredictionResult<GarchFit> {
        self.fit_with_monitor(returns, |_| {})
    }

    /// Fit to `returns`, reporting every iteration to `monitor`
    pub fn fit_with_monitor<F>(&self, returns: &[f64], mut monitor: F) -> PredictionResult<GarchFit>
    where
        F: FnMut(&IterationState),
    {
        let n = returns.len();
        if n < self.config.min_returns.max(2) {
            return Err(PredictionError::InsufficientData {
                required: self.config.min_returns.max(2),
                actual: n,
            });
        }

        let sample_variance = returns.iter().population_variance();
        let initial_variance = sample_variance.max(VARIANCE_FLOOR);
        // omega lives on the variance scale, mu on the volatility scale
        let scales = [initial_variance, 1.0, 1.0, initial_variance.sqrt()];

        let mut params = Params {
            omega: INITIAL_OMEGA,
            alpha: INITIAL_ALPHA,
            beta: INITIAL_BETA,
            mu: returns.iter().mean(),
        };
        params.constrain();

        let mut best = params;
        let mut best_ll = f64::NEG_INFINITY;
        let mut iterations = 0;
        let mut converged = false;
        let mut variances = vec![initial_variance; n];
        let mut normalizer = StepNormalizer::default();

        for iteration in 0..self.config.max_iterations {
            iterations = iteration + 1;
            variance_path(returns, &params, initial_variance, &mut variances);
            let ll = log_likelihood(returns, &variances, params.mu);
            let learning_rate = self.config.learning_rate / (1.0 + 0.1 * iteration as f64);

            if ll.is_finite() && ll > best_ll {
                let improvement = ll - best_ll;
                best_ll = ll;
                best = params;
                if improvement < self.config.tolerance {
                    converged = true;
                    monitor(&state(iteration, ll, learning_rate, &params));
                    break;
                }
            }

            let mut scaled = gradient(returns, &variances, &params).to_array();
            for (g, scale) in scaled.iter_mut().zip(scales) {
                *g *= scale;
            }
            let direction = normalizer.direction(scaled);
            let mut next = params.to_array();
            for k in 0..4 {
                next[k] += learning_rate * scales[k] * direction[k];
            }
            params = Params::from_array(next);
            params.constrain();

            monitor(&state(iteration, ll, learning_rate, &params));
        }

        variance_path(returns, &best, initial_variance, &mut variances);
        let log_likelihood = log_likelihood(returns, &variances, best.mu);
        let n_obs = n as f64;

        let parameters = GarchParameters {
            omega: best.omega,
            alpha: best.alpha,
            beta: best.beta,
            gamma: None,
            mu: best.mu,
            log_likelihood,
            aic: 2.0 * FREE_PARAMETERS - 2.0 * log_likelihood,
            bic: FREE_PARAMETERS * n_obs.ln() - 2.0 * log_likelihood,
        };

        debug!(
            "GARCH fit: omega={:.3e} alpha={:.4} beta={:.4} ll={:.4} after {} iterations (converged: {})",
            parameters.omega, parameters.alpha, parameters.beta, log_likelihood, iterations, converged
        );

        Ok(GarchFit {
            parameters,
            returns: returns.to_vec(),
            conditional_variances: variances,
            iterations,
            converged,
        })
    }
}

fn state(iteration: usize, log_likelihood: f64, learning_rate: f64, p: &Params) -> IterationState {
    IterationState {
        iteration,
        log_likelihood,
        learning_rate,
        omega: p.omega,
        alpha: p.alpha,
        beta: p.beta,
        mu: p.mu,
    }
}

fn variance_path(returns: &[f64], p: &Params, initial_variance: f64, out: &mut [f64]) {
    out[0] = initial_variance;
    for t in 1..returns.len() {
        let shock = returns[t - 1] - p.mu;
        out[t] = (p.omega + p.alpha * shock * shock + p.beta * out[t - 1]).max(VARIANCE_FLOOR);
    }
}

fn log_likelihood(returns: &[f64], variances: &[f64], mu: f64) -> f64 {
    returns
        .iter()
        .zip(variances)
        .map(|(r, h)| -0.5 * ((2.0 * PI * h).ln() + (r - mu).powi(2) / h))
        .sum()
}

/// Mean per-observation partials of the log density
///
/// Carries `dh_t/dtheta = dh_t/dtheta(direct) + beta * dh_{t-1}/dtheta`,
/// restarting from zero wherever the variance sits on its floor.
fn gradient(returns: &[f64], variances: &[f64], p: &Params) -> Params {
    let mut g = [0.0, 0.0, 0.0, (returns[0] - p.mu) / variances[0]];
    let mut dh = [0.0; 4];

    for t in 1..returns.len() {
        let prev_h = variances[t - 1];
        let prev_e = returns[t - 1] - p.mu;
        let raw = p.omega + p.alpha * prev_e * prev_e + p.beta * prev_h;
        dh = if raw > VARIANCE_FLOOR {
            [
                1.0 + p.beta * dh[0],
                prev_e * prev_e + p.beta * dh[1],
                prev_h + p.beta * dh[2],
                -2.0 * p.alpha * prev_e + p.beta * dh[3],
            ]
        } else {
            [0.0; 4]
        };

        let h = variances[t];
        let e = returns[t] - p.mu;
        let dl_dh = 0.5 * (e * e / h - 1.0) / h;
        for k in 0..4 {
            g[k] += dl_dh * dh[k];
        }
        g[3] += e / h;
    }

    let n = returns.len() as f64;
    Params::from_array(g.map(|v| v / n))
}
