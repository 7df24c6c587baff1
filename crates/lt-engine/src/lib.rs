// LoraTune study engine
// Runs LoRA fine-tuning trials and drives the search loop around them

pub mod config;
pub mod evaluator;
pub mod study;
pub mod training;

pub use config::{EvaluatorConfig, StudyConfig};
pub use evaluator::{
    parse_scores, BenchmarkEvaluator, BenchmarkFunction, CommandEvaluator, Evaluator,
    TaskScores, TrialContext,
};
pub use study::{Study, StudySummary};
pub use training::{DataSettings, LoraSettings, OptimizerSettings, TrainingPlan};
