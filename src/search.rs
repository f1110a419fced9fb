//! Sequential integer black-box minimisation with a Gaussian-process surrogate.
//!
//! The first `n_initial_points` evaluations are seeded uniform samples. After
//! that every proposal maximises expected improvement under an RBF-kernel GP
//! fitted to all evaluations so far, over random candidates plus the unit
//! neighbours of the incumbent.

use crate::error::{DefectEvalError, Result};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace};

/// Inclusive integer range of one search dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegerDimension {
    pub low: i64,
    pub high: i64,
}

impl IntegerDimension {
    pub fn new(low: i64, high: i64) -> Result<Self> {
        if low > high {
            return Err(DefectEvalError::InvalidHyperParameter(format!(
                "dimension low {low} is above high {high}"
            )));
        }
        Ok(Self { low, high })
    }

    #[allow(clippy::cast_precision_loss)]
    fn normalise(&self, value: i64) -> f64 {
        if self.high == self.low {
            return 0.0;
        }
        (value - self.low) as f64 / (self.high - self.low) as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchConfig {
    /// Total number of evaluations, initial samples included.
    pub n_calls: usize,
    pub n_initial_points: usize,
    pub seed: u64,
    /// Random candidates scored per surrogate-guided step.
    pub n_candidates: usize,
    /// RBF length scale on the unit cube.
    pub length_scale: f64,
    /// Diagonal jitter of the kernel matrix.
    pub noise: f64,
    /// Exploration margin of the expected improvement.
    pub xi: f64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            n_calls: 50,
            n_initial_points: 10,
            seed: 42,
            n_candidates: 512,
            length_scale: 0.25,
            noise: 1e-6,
            xi: 0.01,
        }
    }
}

/// Every evaluated point in call order, and the best one.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub best_point: Vec<i64>,
    pub best_value: f64,
    pub history: Vec<(Vec<i64>, f64)>,
}

#[derive(Debug)]
pub struct BayesianSearch {
    dimensions: Vec<IntegerDimension>,
    config: SearchConfig,
    rng: StdRng,
}

impl BayesianSearch {
    pub fn new(dimensions: Vec<IntegerDimension>, config: SearchConfig) -> Result<Self> {
        if dimensions.is_empty() {
            return Err(DefectEvalError::InvalidHyperParameter(
                "search space has no dimensions".to_string(),
            ));
        }
        if config.n_calls == 0 {
            return Err(DefectEvalError::InvalidHyperParameter(
                "n_calls must be at least 1".to_string(),
            ));
        }
        if config.length_scale.is_nan() || config.length_scale <= 0.0 {
            return Err(DefectEvalError::InvalidHyperParameter(format!(
                "length_scale must be positive, got {}",
                config.length_scale
            )));
        }
        let rng = StdRng::seed_from_u64(config.seed);
        Ok(Self {
            dimensions,
            config,
            rng,
        })
    }

    /// Minimise `objective` over the integer box.
    ///
    /// Points already evaluated are answered from a cache, so `objective` runs
    /// at most `n_calls` times. Errors from `objective` abort the search.
    pub fn minimize<F>(&mut self, mut objective: F) -> Result<SearchResult>
    where
        F: FnMut(&[i64]) -> Result<f64>,
    {
        let mut history: Vec<(Vec<i64>, f64)> = Vec::with_capacity(self.config.n_calls);
        let mut cache: HashMap<Vec<i64>, f64> = HashMap::new();

        for call in 0..self.config.n_calls {
            let point = if call < self.config.n_initial_points {
                self.random_point()
            } else {
                self.propose(&history, &cache)
            };
            let value = match cache.get(&point) {
                Some(&value) => value,
                None => {
                    let value = objective(&point)?;
                    cache.insert(point.clone(), value);
                    value
                }
            };
            debug!(call, ?point, value, "search evaluation");
            history.push((point, value));
        }

        let (best_point, best_value) = history
            .iter()
            .fold(None::<&(Vec<i64>, f64)>, |best, entry| match best {
                Some(b) if b.1 <= entry.1 => Some(b),
                _ => Some(entry),
            })
            .cloned()
            .ok_or_else(|| DefectEvalError::EmptyDataset("search produced no evaluations".to_string()))?;

        Ok(SearchResult {
            best_point,
            best_value,
            history,
        })
    }

    fn random_point(&mut self) -> Vec<i64> {
        let rng = &mut self.rng;
        self.dimensions
            .iter()
            .map(|d| rng.random_range(d.low..=d.high))
            .collect()
    }

    fn normalise(&self, point: &[i64]) -> Vec<f64> {
        self.dimensions.iter().zip(point).map(|(d, &v)| d.normalise(v)).collect()
    }

    fn kernel(&self, a: &[f64], b: &[f64]) -> f64 {
        let squared: f64 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
        (-squared / (2.0 * self.config.length_scale * self.config.length_scale)).exp()
    }

    fn neighbours(&self, point: &[i64]) -> Vec<Vec<i64>> {
        let mut result = Vec::with_capacity(point.len() * 2);
        for (i, dim) in self.dimensions.iter().enumerate() {
            for step in [-1, 1] {
                let value = point[i] + step;
                if value < dim.low || value > dim.high {
                    continue;
                }
                let mut neighbour = point.to_vec();
                neighbour[i] = value;
                result.push(neighbour);
            }
        }
        result
    }

    fn propose(&mut self, history: &[(Vec<i64>, f64)], cache: &HashMap<Vec<i64>, f64>) -> Vec<i64> {
        // Repeated points would make the kernel matrix singular.
        let mut seen = HashSet::new();
        let mut unique: Vec<&(Vec<i64>, f64)> = Vec::with_capacity(history.len());
        for entry in history {
            if seen.insert(&entry.0) {
                unique.push(entry);
            }
        }
        let history = unique;
        if history.is_empty() {
            return self.random_point();
        }
        let n = history.len();
        let xs: Vec<Vec<f64>> = history.iter().map(|(p, _)| self.normalise(p)).collect();

        #[allow(clippy::cast_precision_loss)]
        let mean = history.iter().map(|(_, v)| v).sum::<f64>() / n as f64;
        #[allow(clippy::cast_precision_loss)]
        let variance = history.iter().map(|(_, v)| (v - mean) * (v - mean)).sum::<f64>() / n as f64;
        let scale = if variance.sqrt() > 1e-12 { variance.sqrt() } else { 1.0 };
        let ys = DVector::from_iterator(n, history.iter().map(|(_, v)| (v - mean) / scale));

        let gram = DMatrix::from_fn(n, n, |i, j| {
            self.kernel(&xs[i], &xs[j]) + if i == j { self.config.noise } else { 0.0 }
        });
        let Some(cholesky) = gram.cholesky() else {
            trace!("kernel matrix not positive definite, sampling at random");
            return self.random_point();
        };
        let alpha = cholesky.solve(&ys);
        let lower = cholesky.l();
        let best_y = ys.min();

        let incumbent = history
            .iter()
            .copied()
            .fold(history[0], |best, entry| if entry.1 < best.1 { entry } else { best });
        let mut candidates = self.neighbours(&incumbent.0);
        for _ in 0..self.config.n_candidates {
            candidates.push(self.random_point());
        }

        let mut best: Option<(f64, Vec<i64>)> = None;
        for candidate in candidates {
            if cache.contains_key(&candidate) {
                continue;
            }
            let x = self.normalise(&candidate);
            let k = DVector::from_iterator(n, xs.iter().map(|xi| self.kernel(xi, &x)));
            let mu = k.dot(&alpha);
            let explained = lower.solve_lower_triangular(&k).map_or(0.0, |v| v.dot(&v));
            let sigma = (1.0 + self.config.noise - explained).max(1e-12).sqrt();
            let ei = expected_improvement(mu, sigma, best_y, self.config.xi);
            if best.as_ref().map_or(true, |(b, _)| ei > *b) {
                best = Some((ei, candidate));
            }
        }

        match best {
            Some((_, point)) => point,
            None => self.random_point(),
        }
    }
}

/// Expected improvement below `best` of a normal prediction.
pub fn expected_improvement(mu: f64, sigma: f64, best: f64, xi: f64) -> f64 {
    let improvement = best - mu - xi;
    if sigma <= 0.0 {
        return improvement.max(0.0);
    }
    let z = improvement / sigma;
    improvement * normal_cdf(z) + sigma * normal_pdf(z)
}

fn normal_pdf(z: f64) -> f64 {
    (-0.5 * z * z).exp() / (2.0 * std::f64::consts::PI).sqrt()
}

fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2))
}

// Abramowitz and Stegun 7.1.26, absolute error below 1.5e-7.
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    sign * (1.0 - poly * (-x * x).exp())
}
