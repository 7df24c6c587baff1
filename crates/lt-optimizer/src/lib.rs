//! # lt-optimizer
//!
//! Search spaces and search strategies for LoraTune.
//!
//! Strategies propose raw points inside the schema's bounds box and learn from
//! reported objectives (ask/tell). Provides uniform random search, Bayesian
//! optimization over a Gaussian-process surrogate, and a partitioning
//! (SOO-style) search, plus trial and run tracking.

mod partition;
mod search;
mod surrogate;
mod trial;

pub use partition::PartitionSearch;
pub use search::{
    build_strategy, BayesianSearch, Point, RandomSearch, SearchSpace, SearchStrategy,
    StrategyKind,
};
pub use surrogate::{expected_improvement, log_expected_improvement, GaussianProcess};
pub use trial::{
    ObjectiveDirection, OptimizationConfig, OptimizationId, OptimizationState,
    OptimizationStatus, Trial, TrialResult, TrialStatus,
};
