// Study loop: suggest a point, decode it, train and evaluate, log, report

use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use lt_data::{TrialLog, TrialRecord};
use lt_optimizer::{
    build_strategy, OptimizationConfig, OptimizationStatus, Point, SearchSpace, SearchStrategy,
    Trial, TrialResult,
};
use lt_types::{
    validation_error, EvaluationError, Experiment, HyperparameterSchema, LtResult,
    OptimizationError, SchemaError,
};

use crate::evaluator::{Evaluator, TrialContext};

/// Outcome of a finished study.
#[derive(Debug, Clone, Serialize)]
pub struct StudySummary {
    pub best: Option<TrialResult>,
    /// Trials run by this study, in order. Warm-start records are not included.
    pub trials: Vec<TrialResult>,
    pub status: OptimizationStatus,
}

/// One hyperparameter search over a trial budget.
pub struct Study {
    config: OptimizationConfig,
    experiment: Experiment,
    space: SearchSpace,
    strategy: Box<dyn SearchStrategy>,
    evaluator: Box<dyn Evaluator>,
    log: TrialLog,
    status: OptimizationStatus,
    results: Vec<TrialResult>,
    next_trial: usize,
}

impl Study {
    pub fn new(
        config: OptimizationConfig,
        mut experiment: Experiment,
        schema: HyperparameterSchema,
        evaluator: Box<dyn Evaluator>,
        log: TrialLog,
    ) -> LtResult<Self> {
        let space = SearchSpace::new(schema)?;
        let strategy = build_strategy(space.clone(), &config);
        experiment.resolve_model_name();

        Ok(Self {
            status: OptimizationStatus::new(config.clone()),
            config,
            experiment,
            space,
            strategy,
            evaluator,
            log,
            results: Vec::new(),
            next_trial: 0,
        })
    }

    /// Replace the strategy built from the config.
    pub fn with_strategy(mut self, strategy: Box<dyn SearchStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn status(&self) -> &OptimizationStatus {
        &self.status
    }

    pub fn strategy(&self) -> &dyn SearchStrategy {
        self.strategy.as_ref()
    }

    pub fn log(&self) -> &TrialLog {
        &self.log
    }

    pub fn results(&self) -> &[TrialResult] {
        &self.results
    }

    /// Seed the strategy with the completed trials already in the log.
    ///
    /// Returns how many observations were loaded. Trial numbering continues
    /// after the last logged record.
    pub fn warm_start(&mut self) -> LtResult<usize> {
        let task = self.config.objective_task.clone();
        let logged = self.log.read_all()?.len();
        let observations = self.log.observations(self.space.schema(), &task)?;

        let mut loaded = 0;
        for (index, obs) in observations.into_iter().enumerate() {
            if !self.space.contains(&obs.point) {
                warn!("Logged point {:?} is outside the search space; skipping", obs.point);
                continue;
            }
            self.strategy
                .report(&obs.point, self.config.direction.oriented(obs.score));

            let result = TrialResult {
                trial_id: obs.record.trial_id.unwrap_or_else(Uuid::new_v4),
                trial_number: obs.record.trial_number.unwrap_or(index),
                point: obs.point,
                hyperparameters: obs.record.hyperparameters,
                scores: obs.record.results.unwrap_or_default(),
                objective: obs.score,
                duration_seconds: None,
            };
            self.status.update_best(&result);
            loaded += 1;
        }

        self.status.trials_resumed = loaded;
        self.next_trial = self.next_trial.max(logged);
        info!(
            "Warm start loaded {} of {} logged trials from {}",
            loaded,
            logged,
            self.log.path().display()
        );
        Ok(loaded)
    }

    /// Run the study until the budget is spent or the strategy runs dry.
    pub fn run(&mut self) -> LtResult<StudySummary> {
        if self.status.is_finished() {
            return Err(OptimizationError::AlreadyFinished {
                state: self.status.state.to_string(),
            }
            .into());
        }

        self.status.mark_running();
        info!(
            "Starting study {} ({} strategy, budget {}, objective {} {:?})",
            self.config.name,
            self.strategy.name(),
            self.config.budget,
            self.config.objective_task,
            self.config.direction
        );

        for call in 0..self.config.budget {
            let Some(point) = self.strategy.suggest(1).pop() else {
                info!(
                    "{} strategy has nothing left to propose after {} calls",
                    self.strategy.name(),
                    call
                );
                break;
            };

            if let Err(e) = self.run_trial(point) {
                error!("Study {} failed: {}", self.config.name, e);
                self.status.mark_failed(e.to_string());
                return Err(e);
            }
        }

        self.status.mark_completed();
        if let Some(best) = &self.status.best_trial {
            info!(
                "Study {} finished: best {} = {} at trial {}",
                self.config.name, self.config.objective_task, best.objective, best.trial_number
            );
        }
        Ok(self.summary())
    }

    /// Evaluate one given point outside the search loop.
    ///
    /// Numbering continues after the records already in the log.
    pub fn run_single(&mut self, point: Point) -> LtResult<TrialResult> {
        if point.len() != self.space.dim() {
            return Err(SchemaError::DimensionMismatch {
                expected: self.space.dim(),
                actual: point.len(),
            }
            .into());
        }
        if !self.space.contains(&point) {
            return Err(validation_error!("Point {:?} is outside the search space", point));
        }

        self.next_trial = self.next_trial.max(self.log.read_all()?.len());
        self.status.mark_running();
        match self.run_trial(point) {
            Ok(result) => {
                self.status.mark_completed();
                Ok(result)
            }
            Err(e) => {
                self.status.mark_failed(e.to_string());
                Err(e)
            }
        }
    }

    /// Evaluate a single point and record the outcome.
    ///
    /// Failed evaluations are logged with null results before the error is
    /// returned.
    pub fn run_trial(&mut self, point: Point) -> LtResult<TrialResult> {
        let hyperparameters = self.space.schema().decode(&point)?;
        let mut trial = Trial::new(
            self.status.id,
            self.next_trial,
            point.clone(),
            hyperparameters.clone(),
        );
        self.next_trial += 1;
        trial.mark_running();
        info!("Trial {}: {:?}", trial.trial_number, hyperparameters);

        let ctx = TrialContext {
            optimization_id: self.status.id,
            trial_id: trial.id,
            trial_number: trial.trial_number,
            point: point.clone(),
            experiment: self.experiment.clone(),
        };

        let task = &self.config.objective_task;
        let outcome = self
            .evaluator
            .evaluate(&hyperparameters, &ctx)
            .and_then(|scores| match scores.get(task).copied() {
                Some(objective) if objective.is_finite() => Ok((objective, scores)),
                Some(objective) => Err(EvaluationError::InvalidScore {
                    task: task.clone(),
                    value: objective,
                }
                .into()),
                None => Err(EvaluationError::MissingTask { task: task.clone() }.into()),
            });

        let (objective, scores) = match outcome {
            Ok(scored) => scored,
            Err(e) => {
                trial.mark_failed(e.to_string());
                self.status.record_failed();
                self.log
                    .append(&TrialRecord::failed(&trial, &self.experiment, e.to_string()))?;
                return Err(e);
            }
        };

        let result = TrialResult {
            trial_id: trial.id,
            trial_number: trial.trial_number,
            point,
            hyperparameters,
            scores,
            objective,
            duration_seconds: trial.duration_seconds(),
        };
        trial.mark_completed(result.clone());

        self.log
            .append(&TrialRecord::completed(self.status.id, &result, &self.experiment))?;
        self.strategy
            .report(&result.point, self.config.direction.oriented(objective));
        self.status.record_completed(&result);
        info!(
            "Trial {} scored {} = {}",
            result.trial_number, self.config.objective_task, objective
        );

        self.results.push(result.clone());
        Ok(result)
    }

    pub fn summary(&self) -> StudySummary {
        StudySummary {
            best: self.status.best_trial.clone(),
            trials: self.results.clone(),
            status: self.status.clone(),
        }
    }
}
