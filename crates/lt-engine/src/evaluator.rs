// Trial objectives: the external LoRA train/eval pipeline and closed-form benchmarks

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

use lt_optimizer::{OptimizationId, Point};
use lt_types::{
    validation_error, EvaluationError, Experiment, HyperparameterSchema, Hyperparameters,
    LtResult, SchemaError,
};

use crate::training::TrainingPlan;

/// Score per benchmark task.
pub type TaskScores = BTreeMap<String, f64>;

pub const PLAN_ENV: &str = "LORATUNE_PLAN";
pub const TRIAL_DIR_ENV: &str = "LORATUNE_TRIAL_DIR";
pub const RESULTS_ENV: &str = "LORATUNE_RESULTS";

/// Identity of the trial being evaluated.
#[derive(Debug, Clone)]
pub struct TrialContext {
    pub optimization_id: OptimizationId,
    pub trial_id: Uuid,
    pub trial_number: usize,
    /// Raw point the hyperparameters were decoded from.
    pub point: Point,
    pub experiment: Experiment,
}

/// Blocking trial objective.
pub trait Evaluator: Send {
    /// Train and evaluate one configuration.
    fn evaluate(&mut self, hyperparameters: &Hyperparameters, ctx: &TrialContext) -> LtResult<TaskScores>;

    fn name(&self) -> &str;
}

/// Check that every task in `tasks` has a finite score.
pub fn require_tasks(scores: &TaskScores, tasks: &[String]) -> LtResult<()> {
    for task in tasks {
        match scores.get(task) {
            None => return Err(EvaluationError::MissingTask { task: task.clone() }.into()),
            Some(value) if !value.is_finite() => {
                return Err(EvaluationError::InvalidScore {
                    task: task.clone(),
                    value: *value,
                }
                .into())
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Extract task scores from an evaluation results document.
///
/// Accepts the lm-eval-harness layout `{"results": {task: {metric: score}}}`
/// as well as a bare `{task: score}` or `{task: {metric: score}}` map.
/// Entries without `metric_key` are ignored.
pub fn parse_scores(document: &Value, metric_key: &str) -> LtResult<TaskScores> {
    let root = document
        .as_object()
        .ok_or_else(|| validation_error!("Results document must be a JSON object"))?;
    let table = match root.get("results") {
        Some(Value::Object(results)) => results,
        _ => root,
    };

    let mut scores = TaskScores::new();
    for (task, entry) in table {
        let score = match entry {
            Value::Number(n) => n.as_f64(),
            Value::Object(metrics) => metrics.get(metric_key).and_then(Value::as_f64),
            _ => None,
        };
        match score {
            Some(score) => {
                scores.insert(task.clone(), score);
            }
            None => debug!("No {} score for {}", metric_key, task),
        }
    }
    Ok(scores)
}

/// Runs an external training command, then an optional evaluation command,
/// and reads the scores they leave behind.
///
/// Each trial gets `<workdir>/trial-NNNN/` holding `plan.json` and
/// `results.json`. Both commands see the paths through the `LORATUNE_*`
/// environment variables, and `{plan}`, `{trial_dir}` and `{results}` in
/// their arguments are replaced by the same paths. An argument that is
/// exactly `{args}` expands to the plan's `--key=value` flags.
#[derive(Debug, Clone)]
pub struct CommandEvaluator {
    train: Vec<String>,
    evaluate: Option<Vec<String>>,
    workdir: PathBuf,
    metric_key: String,
}

struct TrialPaths {
    dir: PathBuf,
    plan: PathBuf,
    results: PathBuf,
}

impl CommandEvaluator {
    pub fn new(train: Vec<String>) -> Self {
        Self {
            train,
            evaluate: None,
            workdir: PathBuf::from("runs"),
            metric_key: "acc,none".to_string(),
        }
    }

    pub fn with_evaluate(mut self, evaluate: Option<Vec<String>>) -> Self {
        self.evaluate = evaluate;
        self
    }

    pub fn with_workdir<P: AsRef<Path>>(mut self, workdir: P) -> Self {
        self.workdir = workdir.as_ref().to_path_buf();
        self
    }

    pub fn with_metric_key(mut self, metric_key: impl Into<String>) -> Self {
        self.metric_key = metric_key.into();
        self
    }

    pub fn trial_dir(&self, trial_number: usize) -> PathBuf {
        self.workdir.join(format!("trial-{trial_number:04}"))
    }

    fn run_stage(&self, stage: &str, command: &[String], paths: &TrialPaths, plan: &TrainingPlan) -> LtResult<()> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| EvaluationError::EmptyCommand {
                stage: stage.to_string(),
            })?;

        let mut expanded = Vec::with_capacity(args.len());
        for arg in args {
            if arg == "{args}" {
                expanded.extend(plan.to_cli_args());
            } else {
                expanded.push(substitute(arg, paths));
            }
        }

        info!("Running {} command: {}", stage, program);
        debug!("{} arguments: {:?}", stage, expanded);

        let status = Command::new(substitute(program, paths))
            .args(&expanded)
            .env(PLAN_ENV, &paths.plan)
            .env(TRIAL_DIR_ENV, &paths.dir)
            .env(RESULTS_ENV, &paths.results)
            .status()
            .map_err(|e| EvaluationError::LaunchFailed {
                stage: stage.to_string(),
                program: program.clone(),
                message: e.to_string(),
            })?;

        if !status.success() {
            return Err(EvaluationError::CommandFailed {
                stage: stage.to_string(),
                status: status.to_string(),
            }
            .into());
        }
        Ok(())
    }
}

fn substitute(arg: &str, paths: &TrialPaths) -> String {
    arg.replace("{plan}", &paths.plan.to_string_lossy())
        .replace("{trial_dir}", &paths.dir.to_string_lossy())
        .replace("{results}", &paths.results.to_string_lossy())
}

impl Evaluator for CommandEvaluator {
    fn evaluate(&mut self, hyperparameters: &Hyperparameters, ctx: &TrialContext) -> LtResult<TaskScores> {
        let dir = self.trial_dir(ctx.trial_number);
        std::fs::create_dir_all(&dir)?;
        let paths = TrialPaths {
            plan: dir.join("plan.json"),
            results: dir.join("results.json"),
            dir,
        };

        let plan = TrainingPlan::from_hyperparameters(hyperparameters, &ctx.experiment);
        std::fs::write(&paths.plan, serde_json::to_string_pretty(&plan)?)?;
        if paths.results.exists() {
            std::fs::remove_file(&paths.results)?;
        }

        self.run_stage("train", &self.train, &paths, &plan)?;
        if let Some(evaluate) = &self.evaluate {
            self.run_stage("evaluate", evaluate, &paths, &plan)?;
        }

        if !paths.results.is_file() {
            return Err(EvaluationError::MissingResults {
                path: paths.results.display().to_string(),
            }
            .into());
        }
        let document: Value = serde_json::from_str(&std::fs::read_to_string(&paths.results)?)?;
        let scores = parse_scores(&document, &self.metric_key)?;
        require_tasks(&scores, &ctx.experiment.tasks)?;
        Ok(scores)
    }

    fn name(&self) -> &str {
        "command"
    }
}

/// Closed-form test functions for smoke runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BenchmarkFunction {
    /// Four global minima of 0, one at (3, 2). Uses the first two values.
    Himmelblau,
    /// Sum of squares.
    Sphere,
}

impl BenchmarkFunction {
    pub fn name(self) -> &'static str {
        match self {
            Self::Himmelblau => "himmelblau",
            Self::Sphere => "sphere",
        }
    }

    pub fn evaluate(self, x: &[f64]) -> LtResult<f64> {
        match self {
            Self::Himmelblau => {
                let [a, b, ..] = x else {
                    return Err(EvaluationError::TooFewDimensions {
                        function: self.name().to_string(),
                        required: 2,
                        actual: x.len(),
                    }
                    .into());
                };
                Ok((a * a + b - 11.0).powi(2) + (a + b * b - 7.0).powi(2))
            }
            Self::Sphere => Ok(x.iter().map(|v| v * v).sum()),
        }
    }
}

impl FromStr for BenchmarkFunction {
    type Err = lt_types::LtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "himmelblau" => Ok(Self::Himmelblau),
            "sphere" => Ok(Self::Sphere),
            other => Err(validation_error!("Unknown benchmark function: {}", other)),
        }
    }
}

/// Scores a benchmark function on the decoded hyperparameters, taken in
/// schema order, and reports it under a single task name.
#[derive(Debug, Clone)]
pub struct BenchmarkEvaluator {
    function: BenchmarkFunction,
    schema: HyperparameterSchema,
    task: String,
}

impl BenchmarkEvaluator {
    pub fn new(function: BenchmarkFunction, schema: HyperparameterSchema) -> Self {
        Self {
            function,
            schema,
            task: function.name().to_string(),
        }
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = task.into();
        self
    }

    pub fn task(&self) -> &str {
        &self.task
    }
}

impl Evaluator for BenchmarkEvaluator {
    fn evaluate(&mut self, hyperparameters: &Hyperparameters, _ctx: &TrialContext) -> LtResult<TaskScores> {
        let values = self
            .schema
            .names()
            .into_iter()
            .map(|name| -> LtResult<f64> {
                hyperparameters
                    .get(name)
                    .map(|v| v.as_f64())
                    .ok_or_else(|| SchemaError::MissingParameter { name: name.to_string() }.into())
            })
            .collect::<LtResult<Vec<f64>>>()?;

        let score = self.function.evaluate(&values)?;
        debug!("{}({:?}) = {}", self.function.name(), values, score);
        Ok(TaskScores::from([(self.task.clone(), score)]))
    }

    fn name(&self) -> &str {
        self.function.name()
    }
}
