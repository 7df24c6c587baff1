// Study configuration loaded from JSON

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use lt_data::TrialLog;
use lt_optimizer::{ObjectiveDirection, OptimizationConfig, StrategyKind};
use lt_types::{config_error, validation_error, Experiment, HyperparameterSchema, LtResult};

use crate::evaluator::{BenchmarkEvaluator, BenchmarkFunction, CommandEvaluator, Evaluator};
use crate::study::Study;

/// How trials are scored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EvaluatorConfig {
    /// External training and evaluation commands.
    Command {
        train: Vec<String>,
        #[serde(default)]
        evaluate: Option<Vec<String>>,
        #[serde(default = "default_workdir")]
        workdir: PathBuf,
        #[serde(default = "default_metric_key")]
        metric_key: String,
    },
    /// Closed-form benchmark function. `task` defaults to the objective task.
    Benchmark {
        function: BenchmarkFunction,
        #[serde(default)]
        task: Option<String>,
    },
}

fn default_workdir() -> PathBuf {
    PathBuf::from("runs")
}

fn default_metric_key() -> String {
    "acc,none".to_string()
}

fn default_name() -> String {
    "loratune".to_string()
}

fn default_log_file() -> PathBuf {
    PathBuf::from("optimization/export.json")
}

/// Smoke runs keep their benchmark trials out of the real trial log.
const SMOKE_LOG_FILE: &str = "optimization/smoke.json";

/// Everything needed to build and run a [`Study`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub experiment: Experiment,
    #[serde(default)]
    pub schema: HyperparameterSchema,
    #[serde(default)]
    pub optimization: OptimizationConfig,
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
    pub evaluator: EvaluatorConfig,
}

impl StudyConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> LtResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| config_error!("Cannot read {}: {}", path.display(), e))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| config_error!("Invalid study config {}: {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> LtResult<()> {
        self.schema.validate()?;

        if self.optimization.budget == 0 {
            return Err(validation_error!("Budget must be greater than 0"));
        }

        let task = &self.optimization.objective_task;
        if !self.experiment.tasks.iter().any(|t| t == task) {
            return Err(validation_error!(
                "Objective task {} is not among the experiment tasks {:?}",
                task,
                self.experiment.tasks
            ));
        }

        match &self.evaluator {
            EvaluatorConfig::Command { train, evaluate, .. } => {
                if train.is_empty() {
                    return Err(config_error!("Train command is empty"));
                }
                if evaluate.as_ref().is_some_and(|cmd| cmd.is_empty()) {
                    return Err(config_error!("Evaluate command is empty"));
                }
            }
            EvaluatorConfig::Benchmark { function, task: Some(bench_task) } if bench_task != task => {
                return Err(validation_error!(
                    "Benchmark {} reports {} but the objective is {}",
                    function.name(),
                    bench_task,
                    task
                ));
            }
            EvaluatorConfig::Benchmark { .. } => {}
        }

        Ok(())
    }

    pub fn build_evaluator(&self) -> Box<dyn Evaluator> {
        match &self.evaluator {
            EvaluatorConfig::Command {
                train,
                evaluate,
                workdir,
                metric_key,
            } => Box::new(
                CommandEvaluator::new(train.clone())
                    .with_evaluate(evaluate.clone())
                    .with_workdir(workdir)
                    .with_metric_key(metric_key.clone()),
            ),
            EvaluatorConfig::Benchmark { function, task } => Box::new(
                BenchmarkEvaluator::new(*function, self.schema.clone()).with_task(
                    task.clone()
                        .unwrap_or_else(|| self.optimization.objective_task.clone()),
                ),
            ),
        }
    }

    /// Validate the config and wire up the log, strategy and evaluator.
    pub fn build_study(&self) -> LtResult<Study> {
        self.validate()?;

        let log = TrialLog::open(&self.log_file)?;
        let mut experiment = self.experiment.clone();
        experiment.calls = self.optimization.budget;

        let mut optimization = self.optimization.clone();
        if optimization.name.is_empty() {
            optimization.name = self.name.clone();
        }

        info!(
            "Building study {} with {} evaluator, logging to {}",
            self.name,
            match self.evaluator {
                EvaluatorConfig::Command { .. } => "command",
                EvaluatorConfig::Benchmark { .. } => "benchmark",
            },
            self.log_file.display()
        );

        Study::new(
            optimization,
            experiment,
            self.schema.clone(),
            self.build_evaluator(),
            log,
        )
    }
}

impl Default for StudyConfig {
    /// Himmelblau smoke run over two float parameters.
    fn default() -> Self {
        let task = "himmelblau";
        Self {
            name: "himmelblau-smoke".to_string(),
            experiment: Experiment::default()
                .with_fast_run(true)
                .with_calls(30)
                .with_tasks(vec![task.to_string()]),
            schema: HyperparameterSchema::new()
                .add_float("x", -5.0, 5.0)
                .add_float("y", -5.0, 5.0),
            optimization: OptimizationConfig::new("himmelblau-smoke".to_string(), StrategyKind::Bayesian)
                .with_budget(30)
                .with_init_budget(5)
                .with_objective(task, ObjectiveDirection::Minimize)
                .with_seed(0),
            log_file: PathBuf::from(SMOKE_LOG_FILE),
            evaluator: EvaluatorConfig::Benchmark {
                function: BenchmarkFunction::Himmelblau,
                task: None,
            },
        }
    }
}
