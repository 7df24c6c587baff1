//! Search space definitions and search strategies.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use lt_types::{HyperparameterSchema, LtResult, OptimizationError};

use crate::partition::PartitionSearch;
use crate::surrogate::{log_expected_improvement, GaussianProcess};
use crate::trial::OptimizationConfig;

/// A raw point in the search box, one coordinate per schema entry.
pub type Point = Vec<f64>;

pub(crate) fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}

/// The bounds box spanned by a validated hyperparameter schema.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchSpace {
    schema: HyperparameterSchema,
    lower: Vec<f64>,
    upper: Vec<f64>,
}

impl SearchSpace {
    pub fn new(schema: HyperparameterSchema) -> LtResult<Self> {
        schema.validate()?;
        Ok(Self {
            lower: schema.lower_bounds(),
            upper: schema.upper_bounds(),
            schema,
        })
    }

    pub fn schema(&self) -> &HyperparameterSchema {
        &self.schema
    }

    pub fn dim(&self) -> usize {
        self.lower.len()
    }

    pub fn lower(&self) -> &[f64] {
        &self.lower
    }

    pub fn upper(&self) -> &[f64] {
        &self.upper
    }

    /// Center of the box.
    pub fn midpoint(&self) -> Point {
        self.lower
            .iter()
            .zip(&self.upper)
            .map(|(lo, hi)| (lo + hi) / 2.0)
            .collect()
    }

    /// Uniform sample inside the box.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Point {
        self.lower
            .iter()
            .zip(&self.upper)
            .map(|(&lo, &hi)| rng.random_range(lo..=hi))
            .collect()
    }

    pub fn clamp(&self, point: &[f64]) -> Point {
        point
            .iter()
            .zip(self.lower.iter().zip(&self.upper))
            .map(|(x, (&lo, &hi))| x.clamp(lo, hi))
            .collect()
    }

    pub fn contains(&self, point: &[f64]) -> bool {
        point.len() == self.dim()
            && point
                .iter()
                .zip(self.lower.iter().zip(&self.upper))
                .all(|(x, (lo, hi))| x >= lo && x <= hi)
    }

    /// Map a raw point into the unit cube. Zero-width dimensions map to 0.5.
    pub fn normalize(&self, point: &[f64]) -> Point {
        point
            .iter()
            .zip(self.lower.iter().zip(&self.upper))
            .map(|(x, (lo, hi))| {
                let width = hi - lo;
                if width > 0.0 {
                    (x - lo) / width
                } else {
                    0.5
                }
            })
            .collect()
    }

    /// Map a unit-cube point back into the box.
    pub fn denormalize(&self, unit: &[f64]) -> Point {
        unit.iter()
            .zip(self.lower.iter().zip(&self.upper))
            .map(|(u, (lo, hi))| lo + u.clamp(0.0, 1.0) * (hi - lo))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Search strategies
// ---------------------------------------------------------------------------

/// Common trait for all search strategies.
///
/// Objectives passed to `report` are oriented so that larger is better.
pub trait SearchStrategy: Send {
    /// Generate up to `count` points to evaluate. Fewer (or none) means the
    /// strategy has nothing left to propose.
    fn suggest(&mut self, count: usize) -> Vec<Point>;

    /// Report a completed evaluation so adaptive strategies can learn.
    fn report(&mut self, point: &[f64], objective: f64);

    /// Every (point, objective) pair reported so far.
    fn observations(&self) -> &[(Point, f64)];

    /// Human-readable strategy name.
    fn name(&self) -> &str;

    /// Best reported observation.
    fn best(&self) -> Option<&(Point, f64)> {
        self.observations()
            .iter()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
    }
}

/// Which strategy a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Random,
    #[default]
    Bayesian,
    Partition,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Random => write!(f, "random"),
            Self::Bayesian => write!(f, "bayesian"),
            Self::Partition => write!(f, "partition"),
        }
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = OptimizationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "random" => Ok(Self::Random),
            "bayesian" | "bo" | "gp" => Ok(Self::Bayesian),
            "partition" | "soo" | "direct" => Ok(Self::Partition),
            _ => Err(OptimizationError::UnknownStrategy {
                name: s.to_string(),
            }),
        }
    }
}

/// Build the strategy selected by `config`.
pub fn build_strategy(space: SearchSpace, config: &OptimizationConfig) -> Box<dyn SearchStrategy> {
    match config.strategy {
        StrategyKind::Random => Box::new(RandomSearch::new(space).with_seed(config.seed)),
        StrategyKind::Bayesian => Box::new(
            BayesianSearch::new(space, config.exploration_weight)
                .with_initial(config.init_budget)
                .with_acquisition_samples(config.raw_samples, config.num_restarts)
                .with_seed(config.seed),
        ),
        StrategyKind::Partition => Box::new(PartitionSearch::new(space, config.max_depth)),
    }
}

// ---- Random search ----

/// Independent uniform sampling across the search box.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    space: SearchSpace,
    rng: StdRng,
    observations: Vec<(Point, f64)>,
}

impl RandomSearch {
    pub fn new(space: SearchSpace) -> Self {
        Self {
            space,
            rng: seeded_rng(None),
            observations: Vec::new(),
        }
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.rng = seeded_rng(seed);
        self
    }
}

impl SearchStrategy for RandomSearch {
    fn suggest(&mut self, count: usize) -> Vec<Point> {
        (0..count).map(|_| self.space.sample(&mut self.rng)).collect()
    }

    fn report(&mut self, point: &[f64], objective: f64) {
        self.observations.push((point.to_vec(), objective));
    }

    fn observations(&self) -> &[(Point, f64)] {
        &self.observations
    }

    fn name(&self) -> &str {
        "random"
    }
}

// ---- Bayesian search ----

/// Bayesian optimization over a Gaussian-process surrogate.
///
/// The first point is the box midpoint, followed by uniform samples until
/// `n_initial` observations exist. From then on each suggestion maximizes log
/// expected improvement: `raw_samples` uniform candidates are scored in
/// parallel and the best `num_restarts` are refined by shrinking local
/// perturbation. With probability `exploration_weight` a uniform sample is
/// returned instead.
#[derive(Debug, Clone)]
pub struct BayesianSearch {
    space: SearchSpace,
    observations: Vec<(Point, f64)>,
    exploration_weight: f64,
    n_initial: usize,
    raw_samples: usize,
    num_restarts: usize,
    refine_steps: usize,
    midpoint_issued: bool,
    rng: StdRng,
}

impl BayesianSearch {
    pub fn new(space: SearchSpace, exploration_weight: f64) -> Self {
        Self {
            space,
            observations: Vec::new(),
            exploration_weight: exploration_weight.clamp(0.0, 1.0),
            n_initial: 1,
            raw_samples: 20,
            num_restarts: 5,
            refine_steps: 25,
            midpoint_issued: false,
            rng: seeded_rng(None),
        }
    }

    /// Number of observations gathered before the surrogate is used.
    pub fn with_initial(mut self, n_initial: usize) -> Self {
        self.n_initial = n_initial.max(1);
        self
    }

    pub fn with_acquisition_samples(mut self, raw_samples: usize, num_restarts: usize) -> Self {
        self.raw_samples = raw_samples.max(1);
        self.num_restarts = num_restarts.max(1);
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.rng = seeded_rng(seed);
        self
    }

    /// Pure exploration sample.
    fn explore(&mut self) -> Point {
        self.space.sample(&mut self.rng)
    }

    /// Fit the surrogate and maximize the acquisition function.
    fn propose(&mut self) -> LtResult<Point> {
        let inputs: Vec<Point> = self
            .observations
            .iter()
            .map(|(p, _)| self.space.normalize(p))
            .collect();
        let targets: Vec<f64> = self.observations.iter().map(|(_, y)| *y).collect();
        let gp = GaussianProcess::fit(&inputs, &targets)?;
        let incumbent = targets.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let dim = self.space.dim();
        let candidates: Vec<Point> = (0..self.raw_samples)
            .map(|_| (0..dim).map(|_| self.rng.random::<f64>()).collect())
            .collect();
        let scores: Vec<f64> = candidates
            .par_iter()
            .map(|c| acquisition(&gp, c, incumbent))
            .collect();

        let mut ranked: Vec<(Point, f64)> = candidates.into_iter().zip(scores).collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(self.num_restarts);

        let mut best: Option<(Point, f64)> = None;
        for (start, score) in ranked {
            let refined = self.refine(&gp, start, score, incumbent);
            if best.as_ref().map_or(true, |b| refined.1 > b.1) {
                best = Some(refined);
            }
        }

        let (unit, score) = best.ok_or_else(|| lt_types::internal_error!("no acquisition candidates"))?;
        debug!(log_ei = score, "acquisition maximized");
        Ok(self.space.denormalize(&unit))
    }

    /// Random-perturbation hill climb on the acquisition surface.
    fn refine(
        &mut self,
        gp: &GaussianProcess,
        start: Point,
        start_score: f64,
        incumbent: f64,
    ) -> (Point, f64) {
        let mut current = start;
        let mut score = start_score;
        let mut step = 0.1;

        for _ in 0..self.refine_steps {
            let candidate: Point = current
                .iter()
                .map(|x| (x + self.rng.random_range(-step..=step)).clamp(0.0, 1.0))
                .collect();
            let candidate_score = acquisition(gp, &candidate, incumbent);
            if candidate_score > score {
                current = candidate;
                score = candidate_score;
            } else {
                step *= 0.7;
            }
        }

        (current, score)
    }
}

fn acquisition(gp: &GaussianProcess, unit: &[f64], incumbent: f64) -> f64 {
    let (mean, std) = gp.predict(unit);
    log_expected_improvement(mean, std, incumbent)
}

impl SearchStrategy for BayesianSearch {
    fn suggest(&mut self, count: usize) -> Vec<Point> {
        (0..count)
            .map(|_| {
                if self.observations.is_empty() && !self.midpoint_issued {
                    self.midpoint_issued = true;
                    return self.space.midpoint();
                }
                if self.observations.len() < self.n_initial
                    || self.rng.random::<f64>() < self.exploration_weight
                {
                    return self.explore();
                }
                match self.propose() {
                    Ok(point) => point,
                    Err(e) => {
                        warn!("Surrogate proposal failed, sampling uniformly: {}", e);
                        self.explore()
                    }
                }
            })
            .collect()
    }

    fn report(&mut self, point: &[f64], objective: f64) {
        if !objective.is_finite() {
            warn!("Ignoring non-finite objective {} for {:?}", objective, point);
            return;
        }
        self.observations.push((point.to_vec(), objective));
    }

    fn observations(&self) -> &[(Point, f64)] {
        &self.observations
    }

    fn name(&self) -> &str {
        "bayesian"
    }
}
