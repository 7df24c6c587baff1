//! Trial tracking and optimization run management.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use lt_types::Hyperparameters;

use crate::search::{Point, StrategyKind};

/// Unique optimization run identifier.
pub type OptimizationId = Uuid;

/// Whether we are maximizing or minimizing the objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectiveDirection {
    #[default]
    Maximize,
    Minimize,
}

impl ObjectiveDirection {
    /// Map a raw score onto the larger-is-better scale strategies expect.
    pub fn oriented(self, score: f64) -> f64 {
        match self {
            Self::Maximize => score,
            Self::Minimize => -score,
        }
    }

    /// Whether `candidate` beats `incumbent`.
    pub fn is_better(self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Self::Maximize => candidate > incumbent,
            Self::Minimize => candidate < incumbent,
        }
    }
}

/// Top-level configuration for an optimization run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationConfig {
    pub id: OptimizationId,
    pub name: String,
    pub description: String,

    pub strategy: StrategyKind,

    /// Number of objective calls in this run.
    pub budget: usize,

    /// Observations gathered before the surrogate is trusted.
    pub init_budget: usize,

    /// Benchmark task whose score is optimized (e.g. "mmlu").
    pub objective_task: String,

    pub direction: ObjectiveDirection,

    /// Probability of a uniform sample in place of a surrogate proposal.
    pub exploration_weight: f64,

    /// Uniform candidates scored per acquisition maximization.
    pub raw_samples: usize,

    /// Candidates refined locally per acquisition maximization.
    pub num_restarts: usize,

    /// Deepest partition level for the partition strategy.
    pub max_depth: usize,

    pub seed: Option<u64>,

    pub created_at: DateTime<Utc>,
}

impl OptimizationConfig {
    pub fn new(name: String, strategy: StrategyKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            description: String::new(),
            strategy,
            budget: 50,
            init_budget: 10,
            objective_task: "mmlu".to_string(),
            direction: ObjectiveDirection::Maximize,
            exploration_weight: 0.0,
            raw_samples: 20,
            num_restarts: 5,
            max_depth: 30,
            seed: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_budget(mut self, budget: usize) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_init_budget(mut self, init_budget: usize) -> Self {
        self.init_budget = init_budget;
        self
    }

    pub fn with_objective(mut self, task: &str, direction: ObjectiveDirection) -> Self {
        self.objective_task = task.to_string();
        self.direction = direction;
        self
    }

    pub fn with_exploration_weight(mut self, weight: f64) -> Self {
        self.exploration_weight = weight;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self::new("loratune".to_string(), StrategyKind::default())
    }
}

/// Lifecycle state for an optimization run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizationState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for OptimizationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Aggregate status of an optimization run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationStatus {
    pub id: OptimizationId,
    pub config: OptimizationConfig,
    pub state: OptimizationState,
    pub trials_completed: usize,
    pub trials_failed: usize,
    /// Completed trials loaded from an earlier log.
    pub trials_resumed: usize,
    pub best_trial: Option<TrialResult>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl OptimizationStatus {
    pub fn new(config: OptimizationConfig) -> Self {
        Self {
            id: config.id,
            config,
            state: OptimizationState::Pending,
            trials_completed: 0,
            trials_failed: 0,
            trials_resumed: 0,
            best_trial: None,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.state,
            OptimizationState::Completed | OptimizationState::Failed | OptimizationState::Cancelled
        )
    }

    pub fn mark_running(&mut self) {
        self.state = OptimizationState::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self) {
        self.state = OptimizationState::Completed;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: String) {
        self.state = OptimizationState::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
    }

    /// Count a completed trial and keep it if it is the new best.
    pub fn record_completed(&mut self, result: &TrialResult) {
        self.trials_completed += 1;
        self.update_best(result);
    }

    pub fn record_failed(&mut self) {
        self.trials_failed += 1;
    }

    /// Update the best trial if `result` improves on the current best.
    pub fn update_best(&mut self, result: &TrialResult) {
        let dominated = match &self.best_trial {
            None => true,
            Some(current_best) => self
                .config
                .direction
                .is_better(result.objective, current_best.objective),
        };
        if dominated {
            self.best_trial = Some(result.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Individual trial
// ---------------------------------------------------------------------------

/// A single trial (one point trained and evaluated).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: Uuid,
    pub optimization_id: OptimizationId,
    pub trial_number: usize,
    pub point: Point,
    pub hyperparameters: Hyperparameters,
    pub status: TrialStatus,
    pub result: Option<TrialResult>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Trial {
    pub fn new(
        optimization_id: OptimizationId,
        trial_number: usize,
        point: Point,
        hyperparameters: Hyperparameters,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            optimization_id,
            trial_number,
            point,
            hyperparameters,
            status: TrialStatus::Pending,
            result: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = TrialStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self, result: TrialResult) {
        self.status = TrialStatus::Completed;
        self.finished_at = Some(Utc::now());
        self.result = Some(result);
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = TrialStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
    }

    /// Whole seconds between start and finish, when both are known.
    pub fn duration_seconds(&self) -> Option<u64> {
        let started = self.started_at?;
        let finished = self.finished_at.unwrap_or_else(Utc::now);
        u64::try_from((finished - started).num_seconds()).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrialStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Result of a single trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub trial_id: Uuid,
    pub trial_number: usize,
    pub point: Point,
    pub hyperparameters: Hyperparameters,
    /// Score per benchmark task.
    pub scores: BTreeMap<String, f64>,
    /// Score of the objective task, unoriented.
    pub objective: f64,
    pub duration_seconds: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use lt_types::HyperparameterValue;

    fn sample_config() -> OptimizationConfig {
        OptimizationConfig::new("test_opt".into(), StrategyKind::Random)
            .with_budget(50)
            .with_objective("mmlu", ObjectiveDirection::Maximize)
    }

    fn result(objective: f64) -> TrialResult {
        TrialResult {
            trial_id: Uuid::new_v4(),
            trial_number: 0,
            point: vec![],
            hyperparameters: Hyperparameters::new(),
            scores: BTreeMap::new(),
            objective,
            duration_seconds: None,
        }
    }

    #[test]
    fn direction_orientation() {
        assert_eq!(ObjectiveDirection::Maximize.oriented(0.4), 0.4);
        assert_eq!(ObjectiveDirection::Minimize.oriented(0.4), -0.4);
        assert!(ObjectiveDirection::Minimize.is_better(0.1, 0.2));
        assert!(!ObjectiveDirection::Maximize.is_better(0.1, 0.2));
    }

    #[test]
    fn optimization_status_lifecycle() {
        let mut status = OptimizationStatus::new(sample_config());

        assert_eq!(status.state, OptimizationState::Pending);
        assert!(status.started_at.is_none());

        status.mark_running();
        assert_eq!(status.state, OptimizationState::Running);
        assert!(status.started_at.is_some());
        assert!(!status.is_finished());

        status.mark_completed();
        assert_eq!(status.state, OptimizationState::Completed);
        assert!(status.finished_at.is_some());
        assert!(status.is_finished());
    }

    #[test]
    fn best_trial_tracking_maximize() {
        let mut status = OptimizationStatus::new(sample_config());

        status.record_completed(&result(0.25));
        assert_eq!(status.best_trial.as_ref().unwrap().objective, 0.25);

        status.record_completed(&result(0.41));
        assert_eq!(status.best_trial.as_ref().unwrap().objective, 0.41);

        // Worse result should not replace
        status.record_completed(&result(0.30));
        assert_eq!(status.best_trial.as_ref().unwrap().objective, 0.41);
        assert_eq!(status.trials_completed, 3);
    }

    #[test]
    fn best_trial_tracking_minimize() {
        let config = OptimizationConfig::new("min_test".into(), StrategyKind::Partition)
            .with_objective("val_loss", ObjectiveDirection::Minimize);
        let mut status = OptimizationStatus::new(config);

        status.update_best(&result(1.9));
        status.update_best(&result(1.2));
        status.update_best(&result(1.5));
        assert_eq!(status.best_trial.as_ref().unwrap().objective, 1.2);
    }

    #[test]
    fn trial_lifecycle() {
        let opt_id = Uuid::new_v4();
        let mut hp = Hyperparameters::new();
        hp.insert("lora_rank".into(), HyperparameterValue::Int(8));

        let mut trial = Trial::new(opt_id, 1, vec![8.0], hp.clone());
        assert_eq!(trial.status, TrialStatus::Pending);
        assert!(trial.duration_seconds().is_none());

        trial.mark_running();
        assert_eq!(trial.status, TrialStatus::Running);

        let mut res = result(0.38);
        res.trial_id = trial.id;
        res.hyperparameters = hp;
        trial.mark_completed(res);
        assert_eq!(trial.status, TrialStatus::Completed);
        assert!(trial.finished_at.is_some());
        assert_eq!(trial.result.as_ref().unwrap().objective, 0.38);
        assert_eq!(trial.duration_seconds(), Some(0));
    }

    #[test]
    fn trial_failure() {
        let mut trial = Trial::new(Uuid::new_v4(), 0, vec![], Hyperparameters::new());
        trial.mark_running();
        trial.mark_failed("trainer exited with status 1".into());
        assert_eq!(trial.status, TrialStatus::Failed);
        assert_eq!(trial.error.as_deref(), Some("trainer exited with status 1"));
    }

    #[test]
    fn config_json_defaults() {
        let config: OptimizationConfig =
            serde_json::from_str(r#"{"strategy": "partition", "budget": 12, "direction": "minimize"}"#)
                .unwrap();
        assert_eq!(config.strategy, StrategyKind::Partition);
        assert_eq!(config.budget, 12);
        assert_eq!(config.direction, ObjectiveDirection::Minimize);
        assert_eq!(config.objective_task, "mmlu");
        assert_eq!(config.raw_samples, 20);
    }
}
