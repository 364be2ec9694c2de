// stance_core/src/optimize/cma.rs

//! Covariance matrix adaptation evolution strategy, `(mu/mu_w, lambda)` flavour.

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;
use std::fmt;
use tracing::debug;

use super::{MinimizeOptions, MinimizeResult};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CmaOptions {
    /// Stop when the recent best values and the current generation span less than this.
    pub tolfun: f64,
    /// Stop when every coordinate's search width is below this.
    pub tolx: f64,
    pub max_evaluations: Option<usize>,
    pub max_generations: Option<usize>,
    /// `None` uses `4 + floor(3 ln n)`.
    pub population_size: Option<usize>,
    pub seed: u64,
}

impl Default for CmaOptions {
    fn default() -> Self {
        Self {
            tolfun: 1e-11,
            tolx: 1e-11,
            max_evaluations: None,
            max_generations: None,
            population_size: None,
            seed: 0,
        }
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmaStop {
    TolFun,
    TolX,
    MaxFevals,
    MaxIterations,
    /// The best value did not improve for a full history window.
    Stall,
}

impl CmaStop {
    /// Whether the stop reflects convergence rather than an exhausted budget.
    pub fn is_converged(self) -> bool {
        matches!(self, CmaStop::TolFun | CmaStop::TolX)
    }
}

impl fmt::Display for CmaStop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            CmaStop::TolFun => "tolfun: function value spread below tolerance",
            CmaStop::TolX => "tolx: search distribution collapsed below tolerance",
            CmaStop::MaxFevals => "maxfevals: evaluation budget exhausted",
            CmaStop::MaxIterations => "maxiter: generation budget exhausted",
            CmaStop::Stall => "stall: no improvement over the history window",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Clone)]
pub struct CmaEs {
    dim: usize,
    lambda: usize,
    weights: DVector<f64>,
    mueff: f64,
    cc: f64,
    cs: f64,
    c1: f64,
    cmu: f64,
    damps: f64,
    chi_n: f64,

    mean: DVector<f64>,
    sigma: f64,
    pc: DVector<f64>,
    ps: DVector<f64>,
    covariance: DMatrix<f64>,
    basis: DMatrix<f64>,
    scales: DVector<f64>,
    invsqrt_covariance: DMatrix<f64>,
    eigen_evaluations: usize,

    evaluations: usize,
    generation: usize,
    rng: ChaCha8Rng,
    options: CmaOptions,

    best: Option<(DVector<f64>, f64)>,
    generations_since_best: usize,
    history: Vec<f64>,
    last_values: Vec<f64>,
}

impl CmaEs {
    pub fn new(x0: DVector<f64>, sigma0: f64, options: CmaOptions) -> Self {
        let dim = x0.len();
        let n = dim as f64;
        let lambda = options
            .population_size
            .unwrap_or(4 + (3.0 * n.ln()).floor() as usize)
            .max(2);
        let mu = lambda / 2;

        // --- Recombination weights ---
        let raw = DVector::from_fn(mu, |i, _| ((mu as f64) + 0.5).ln() - ((i + 1) as f64).ln());
        let weights = &raw / raw.sum();
        let mueff = 1.0 / weights.norm_squared();

        // --- Adaptation constants ---
        let cc = (4.0 + mueff / n) / (n + 4.0 + 2.0 * mueff / n);
        let cs = (mueff + 2.0) / (n + mueff + 5.0);
        let c1 = 2.0 / ((n + 1.3).powi(2) + mueff);
        let cmu = (1.0 - c1).min(2.0 * (mueff - 2.0 + 1.0 / mueff) / ((n + 2.0).powi(2) + mueff));
        let damps = 1.0 + 2.0 * (((mueff - 1.0) / (n + 1.0)).sqrt() - 1.0).max(0.0) + cs;
        let chi_n = n.sqrt() * (1.0 - 1.0 / (4.0 * n) + 1.0 / (21.0 * n * n));

        Self {
            dim,
            lambda,
            weights,
            mueff,
            cc,
            cs,
            c1,
            cmu,
            damps,
            chi_n,
            mean: x0,
            sigma: sigma0,
            pc: DVector::zeros(dim),
            ps: DVector::zeros(dim),
            covariance: DMatrix::identity(dim, dim),
            basis: DMatrix::identity(dim, dim),
            scales: DVector::from_element(dim, 1.0),
            invsqrt_covariance: DMatrix::identity(dim, dim),
            eigen_evaluations: 0,
            evaluations: 0,
            generation: 0,
            rng: ChaCha8Rng::seed_from_u64(options.seed),
            options,
            best: None,
            generations_since_best: 0,
            history: Vec::new(),
            last_values: Vec::new(),
        }
    }

    pub fn population_size(&self) -> usize {
        self.lambda
    }

    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    pub fn generation(&self) -> usize {
        self.generation
    }

    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    /// Best candidate told so far.
    pub fn best(&self) -> Option<(&DVector<f64>, f64)> {
        self.best.as_ref().map(|(x, f)| (x, *f))
    }

    fn history_window(&self) -> usize {
        10 + (30.0 * self.dim as f64 / self.lambda as f64).ceil() as usize
    }

    /// Samples one generation.
    pub fn ask(&mut self) -> Vec<DVector<f64>> {
        let lag = self.evaluations - self.eigen_evaluations;
        if lag as f64 > self.lambda as f64 / (self.c1 + self.cmu) / self.dim as f64 / 10.0 {
            self.update_eigensystem();
        }
        (0..self.lambda)
            .map(|_| {
                let z = DVector::from_fn(self.dim, |_, _| StandardNormal.sample(&mut self.rng));
                let y = &self.basis * z.component_mul(&self.scales);
                &self.mean + y * self.sigma
            })
            .collect()
    }

    /// Updates the distribution from evaluated candidates. NaN counts as worst.
    pub fn tell(&mut self, candidates: &[DVector<f64>], values: &[f64]) {
        let values: Vec<f64> = values
            .iter()
            .map(|v| if v.is_nan() { f64::INFINITY } else { *v })
            .collect();
        let mut order: Vec<usize> = (0..candidates.len().min(values.len())).collect();
        order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
        let Some(&first) = order.first() else {
            return;
        };
        self.evaluations += order.len();
        self.generation += 1;

        // --- Bookkeeping for the stopping rules ---
        let generation_best = values[first];
        let improved = self
            .best
            .as_ref()
            .map_or(true, |(_, best)| generation_best < *best);
        if improved {
            self.best = Some((candidates[first].clone(), generation_best));
            self.generations_since_best = 0;
        } else {
            self.generations_since_best += 1;
        }
        self.history.push(generation_best);
        let window = self.history_window();
        if self.history.len() > window {
            self.history.remove(0);
        }
        self.last_values = order.iter().map(|&i| values[i]).collect();

        // --- Mean and evolution paths ---
        let old_mean = self.mean.clone();
        let selected: Vec<DVector<f64>> = order
            .iter()
            .take(self.weights.len())
            .map(|&i| (&candidates[i] - &old_mean) / self.sigma)
            .collect();
        let mut step = DVector::zeros(self.dim);
        for (w, y) in self.weights.iter().zip(&selected) {
            step += y * *w;
        }
        self.mean = &old_mean + &step * self.sigma;

        self.ps = &self.ps * (1.0 - self.cs)
            + &self.invsqrt_covariance * &step * (self.cs * (2.0 - self.cs) * self.mueff).sqrt();
        let decay = 1.0 - (1.0 - self.cs).powf(2.0 * self.evaluations as f64 / self.lambda as f64);
        let hsig = self.ps.norm() / decay.sqrt() / self.chi_n < 1.4 + 2.0 / (self.dim as f64 + 1.0);
        let hsig_weight = if hsig { 1.0 } else { 0.0 };
        self.pc = &self.pc * (1.0 - self.cc)
            + &step * (hsig_weight * (self.cc * (2.0 - self.cc) * self.mueff).sqrt());

        // --- Covariance: rank-one plus rank-mu ---
        let mut rank_mu = DMatrix::zeros(self.dim, self.dim);
        for (w, y) in self.weights.iter().zip(&selected) {
            rank_mu += y * y.transpose() * *w;
        }
        let correction = (1.0 - hsig_weight) * self.cc * (2.0 - self.cc);
        self.covariance = &self.covariance * (1.0 - self.c1 - self.cmu)
            + (&self.pc * self.pc.transpose() + &self.covariance * correction) * self.c1
            + rank_mu * self.cmu;

        // --- Step size ---
        self.sigma *= ((self.cs / self.damps) * (self.ps.norm() / self.chi_n - 1.0)).exp();
    }

    fn update_eigensystem(&mut self) {
        self.eigen_evaluations = self.evaluations;
        let symmetric = (&self.covariance + self.covariance.transpose()) * 0.5;
        self.covariance = symmetric.clone();
        let eigen = SymmetricEigen::new(symmetric);
        self.scales = eigen.eigenvalues.map(|v| v.max(1e-20).sqrt());
        self.basis = eigen.eigenvectors;
        let inverse_scales = DMatrix::from_diagonal(&self.scales.map(|d| 1.0 / d));
        self.invsqrt_covariance = &self.basis * inverse_scales * self.basis.transpose();
    }

    pub fn stop(&self) -> Option<CmaStop> {
        if self
            .options
            .max_evaluations
            .is_some_and(|cap| self.evaluations >= cap)
        {
            return Some(CmaStop::MaxFevals);
        }
        if self
            .options
            .max_generations
            .is_some_and(|cap| self.generation >= cap)
        {
            return Some(CmaStop::MaxIterations);
        }
        if self.generation > 1 {
            let (lo, hi) = self
                .history
                .iter()
                .chain(&self.last_values)
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
            if hi - lo < self.options.tolfun {
                return Some(CmaStop::TolFun);
            }
        }
        let width = self
            .pc
            .amax()
            .max(self.covariance.diagonal().amax().sqrt());
        if self.sigma * width < self.options.tolx {
            return Some(CmaStop::TolX);
        }
        if self.generations_since_best > self.history_window() {
            return Some(CmaStop::Stall);
        }
        None
    }
}

/// Runs CMA-ES from `x0` with step `options.initial_step`, evaluating each generation in parallel.
pub fn minimize<F, E>(
    f: F,
    x0: &DVector<f64>,
    tolfun: f64,
    options: &MinimizeOptions,
) -> Result<MinimizeResult, E>
where
    F: Fn(&DVector<f64>) -> Result<f64, E> + Sync,
    E: Send,
{
    let mut es = CmaEs::new(
        x0.clone(),
        options.initial_step,
        CmaOptions {
            tolfun,
            max_evaluations: options.max_evaluations,
            max_generations: options.max_iterations,
            seed: options.seed,
            ..CmaOptions::default()
        },
    );

    let reason = loop {
        if let Some(reason) = es.stop() {
            break reason;
        }
        let candidates = es.ask();
        let values = candidates
            .par_iter()
            .map(|x| f(x))
            .collect::<Result<Vec<f64>, E>>()?;
        es.tell(&candidates, &values);
        debug!(
            generation = es.generation(),
            evaluations = es.evaluations(),
            best = values.iter().copied().fold(f64::INFINITY, f64::min),
            sigma = es.sigma(),
            "cma generation"
        );
    };

    let (x, fun) = match es.best() {
        Some((x, fun)) => (x.clone(), fun),
        None => (x0.clone(), f64::INFINITY),
    };
    Ok(MinimizeResult {
        x,
        fun,
        success: reason.is_converged(),
        message: reason.to_string(),
        nit: es.generation(),
        nfev: es.evaluations(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimize::test_functions::bowl;
    use approx::assert_abs_diff_eq;

    #[test]
    fn default_population_follows_the_dimension() {
        assert_eq!(CmaEs::new(DVector::zeros(8), 0.125, CmaOptions::default()).population_size(), 10);
        assert_eq!(CmaEs::new(DVector::zeros(2), 0.125, CmaOptions::default()).population_size(), 6);
    }

    #[test]
    fn ask_tell_descends_a_quadratic_bowl() {
        let mut es = CmaEs::new(DVector::zeros(8), 0.125, CmaOptions { tolfun: 1e-12, ..CmaOptions::default() });
        while es.stop().is_none() {
            let candidates = es.ask();
            let values: Vec<f64> = candidates.iter().map(|x| bowl(x).unwrap()).collect();
            es.tell(&candidates, &values);
        }
        let (best, value) = es.best().unwrap();
        let target = DVector::from_fn(8, |i, _| (i + 1) as f64 / 10.0);
        assert!(value < 1e-8, "stopped at {value} after {:?}", es.stop());
        assert_abs_diff_eq!(*best, target, epsilon = 1e-3);
    }

    #[test]
    fn runs_are_reproducible_for_a_seed() {
        let options = MinimizeOptions {
            max_iterations: Some(15),
            seed: 42,
            ..MinimizeOptions::default()
        };
        let a = minimize(bowl, &DVector::zeros(3), 1e-12, &options).unwrap();
        let b = minimize(bowl, &DVector::zeros(3), 1e-12, &options).unwrap();
        assert_eq!(a, b);
        assert!(!a.success);
        assert_eq!(a.nit, 15);
        assert_eq!(a.message, CmaStop::MaxIterations.to_string());
    }

    #[test]
    fn evaluation_budget_is_respected() {
        let options = MinimizeOptions {
            max_evaluations: Some(60),
            ..MinimizeOptions::default()
        };
        let result = minimize(bowl, &DVector::zeros(4), 1e-12, &options).unwrap();
        assert_eq!(result.message, CmaStop::MaxFevals.to_string());
        assert!(result.nfev >= 60 && result.nfev < 60 + 8);
    }
}
