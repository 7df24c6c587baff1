use std::path::Path;

use lt_data::TrialLog;
use lt_engine::{
    BenchmarkFunction, Evaluator, EvaluatorConfig, Study, StudyConfig, TaskScores, TrialContext,
};
use lt_optimizer::{ObjectiveDirection, OptimizationConfig, OptimizationState, StrategyKind};
use lt_types::{
    EvaluationError, Experiment, HyperparameterSchema, Hyperparameters, LtError, LtResult,
    OptimizationError, SchemaError,
};
use tempfile::tempdir;

fn smoke_config(log: &Path, strategy: StrategyKind, budget: usize) -> StudyConfig {
    let mut config = StudyConfig::default();
    config.log_file = log.to_path_buf();
    config.optimization.strategy = strategy;
    config.optimization.budget = budget;
    config
}

/// Scores `x` until `fail_on` calls have been made, then errors.
struct FlakyEvaluator {
    calls: usize,
    fail_on: usize,
    task: String,
}

impl Evaluator for FlakyEvaluator {
    fn evaluate(&mut self, hp: &Hyperparameters, _ctx: &TrialContext) -> LtResult<TaskScores> {
        self.calls += 1;
        if self.calls == self.fail_on {
            return Err(EvaluationError::CommandFailed {
                stage: "train".to_string(),
                status: "exit status: 1".to_string(),
            }
            .into());
        }
        Ok(TaskScores::from([(self.task.clone(), hp["x"].as_f64())]))
    }

    fn name(&self) -> &str {
        "flaky"
    }
}

fn flaky_study(log: &Path, fail_on: usize, task: &str) -> Study {
    let schema = HyperparameterSchema::new().add_float("x", 0.0, 1.0);
    let config = OptimizationConfig::new("flaky".to_string(), StrategyKind::Random)
        .with_budget(10)
        .with_objective("mmlu", ObjectiveDirection::Maximize)
        .with_seed(3);
    let evaluator = FlakyEvaluator {
        calls: 0,
        fail_on,
        task: task.to_string(),
    };
    Study::new(
        config,
        Experiment::default(),
        schema,
        Box::new(evaluator),
        TrialLog::open(log).unwrap(),
    )
    .unwrap()
}

#[test]
fn study_spends_the_budget_and_logs_every_trial() {
    let dir = tempdir().unwrap();
    let log_path = dir.path().join("export.json");
    let mut study = smoke_config(&log_path, StrategyKind::Random, 15)
        .build_study()
        .unwrap();

    let summary = study.run().unwrap();
    assert_eq!(summary.trials.len(), 15);
    assert_eq!(summary.status.state, OptimizationState::Completed);
    assert_eq!(summary.status.trials_completed, 15);

    let records = TrialLog::open(&log_path).unwrap().read_all().unwrap();
    assert_eq!(records.len(), 15);
    assert!(records.iter().all(|r| r.score("himmelblau").is_some()));
    assert!(records.iter().all(|r| r.experiment.calls == 15));

    // Himmelblau is minimized.
    let lowest = summary
        .trials
        .iter()
        .map(|t| t.objective)
        .fold(f64::INFINITY, f64::min);
    assert_eq!(summary.best.unwrap().objective, lowest);
}

#[test]
fn maximizing_tracks_the_largest_score() {
    let dir = tempdir().unwrap();
    let mut config = smoke_config(&dir.path().join("log.json"), StrategyKind::Random, 10);
    config.optimization.direction = ObjectiveDirection::Maximize;
    config.optimization.objective_task = "sphere".to_string();
    config.experiment.tasks = vec!["sphere".to_string()];
    config.evaluator = EvaluatorConfig::Benchmark {
        function: BenchmarkFunction::Sphere,
        task: None,
    };

    let summary = config.build_study().unwrap().run().unwrap();
    let highest = summary
        .trials
        .iter()
        .map(|t| t.objective)
        .fold(f64::NEG_INFINITY, f64::max);
    assert_eq!(summary.best.unwrap().objective, highest);
}

#[test]
fn bayesian_study_improves_on_its_first_point() {
    let dir = tempdir().unwrap();
    let mut study = smoke_config(&dir.path().join("log.json"), StrategyKind::Bayesian, 25)
        .build_study()
        .unwrap();

    let summary = study.run().unwrap();
    // The first suggestion is the midpoint (0, 0), where Himmelblau is 170.
    assert_eq!(summary.trials[0].objective, 170.0);
    assert!(summary.best.unwrap().objective < 170.0);
}

#[test]
fn partition_study_stops_when_the_tree_is_exhausted() {
    let dir = tempdir().unwrap();
    let mut config = smoke_config(&dir.path().join("log.json"), StrategyKind::Partition, 50);
    config.schema = HyperparameterSchema::new().add_float("x", -5.0, 5.0);
    config.optimization.max_depth = 2;
    config.optimization.objective_task = "sphere".to_string();
    config.experiment.tasks = vec!["sphere".to_string()];
    config.evaluator = EvaluatorConfig::Benchmark {
        function: BenchmarkFunction::Sphere,
        task: None,
    };

    let summary = config.build_study().unwrap().run().unwrap();
    assert_eq!(summary.trials.len(), 9);
    assert_eq!(summary.status.state, OptimizationState::Completed);
}

#[test]
fn warm_start_resumes_from_the_log() {
    let dir = tempdir().unwrap();
    let log_path = dir.path().join("export.json");

    let first = smoke_config(&log_path, StrategyKind::Random, 5)
        .build_study()
        .unwrap()
        .run()
        .unwrap();
    let first_best = first.best.unwrap().objective;

    let mut second = smoke_config(&log_path, StrategyKind::Bayesian, 3)
        .build_study()
        .unwrap();
    assert_eq!(second.warm_start().unwrap(), 5);
    assert_eq!(second.status().trials_resumed, 5);
    assert_eq!(second.strategy().observations().len(), 5);
    assert_eq!(second.status().best_trial.as_ref().unwrap().objective, first_best);

    let summary = second.run().unwrap();
    assert_eq!(summary.trials.len(), 3);
    assert_eq!(summary.trials[0].trial_number, 5);
    assert!(summary.best.unwrap().objective <= first_best);

    assert_eq!(TrialLog::open(&log_path).unwrap().read_all().unwrap().len(), 8);
}

#[test]
fn failures_are_logged_and_propagated() {
    let dir = tempdir().unwrap();
    let log_path = dir.path().join("export.json");
    let mut study = flaky_study(&log_path, 3, "mmlu");

    let err = study.run().unwrap_err();
    assert!(matches!(err, LtError::Evaluation(EvaluationError::CommandFailed { .. })));
    assert_eq!(study.status().state, OptimizationState::Failed);
    assert_eq!(study.status().trials_completed, 2);
    assert_eq!(study.status().trials_failed, 1);

    let records = TrialLog::open(&log_path).unwrap().read_all().unwrap();
    assert_eq!(records.len(), 3);
    assert!(records[2].results.is_none());
    assert!(records[2].error.as_deref().unwrap().contains("exit status"));

    // A failed study cannot be resumed in place.
    assert!(matches!(
        study.run().unwrap_err(),
        LtError::Optimization(OptimizationError::AlreadyFinished { .. })
    ));

    // Warm start only picks up the completed trials.
    let mut resumed = flaky_study(&log_path, usize::MAX, "mmlu");
    assert_eq!(resumed.warm_start().unwrap(), 2);
}

#[test]
fn missing_objective_score_fails_the_trial() {
    let dir = tempdir().unwrap();
    let log_path = dir.path().join("export.json");
    let mut study = flaky_study(&log_path, usize::MAX, "gsm8k");

    let err = study.run().unwrap_err();
    assert!(matches!(err, LtError::Evaluation(EvaluationError::MissingTask { .. })));

    let records = TrialLog::open(&log_path).unwrap().read_all().unwrap();
    assert_eq!(records.len(), 1);
    assert!(!records[0].is_completed());
}

#[test]
fn single_trials_continue_the_log_numbering() {
    let dir = tempdir().unwrap();
    let log_path = dir.path().join("export.json");
    smoke_config(&log_path, StrategyKind::Random, 4)
        .build_study()
        .unwrap()
        .run()
        .unwrap();

    let mut study = smoke_config(&log_path, StrategyKind::Random, 4)
        .build_study()
        .unwrap();
    let result = study.run_single(vec![3.0, 2.0]).unwrap();
    assert_eq!(result.trial_number, 4);
    assert_eq!(result.objective, 0.0);
    assert_eq!(study.status().state, OptimizationState::Completed);
    assert_eq!(study.results().len(), 1);

    let second = study.run_single(vec![0.0, 0.0]).unwrap();
    assert_eq!(second.trial_number, 5);

    assert!(matches!(
        study.run_single(vec![6.0, 0.0]),
        Err(LtError::Validation(_))
    ));
    assert!(matches!(
        study.run_single(vec![1.0]),
        Err(LtError::Schema(SchemaError::DimensionMismatch { .. }))
    ));

    let records = TrialLog::open(&log_path).unwrap().read_all().unwrap();
    assert_eq!(records.len(), 6);
    assert_eq!(records[4].trial_number, Some(4));
}
