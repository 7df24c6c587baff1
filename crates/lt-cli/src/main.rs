//! loratune: hyperparameter search for LoRA fine-tuning.

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use lt_data::TrialLog;
use lt_engine::{StudyConfig, StudySummary};
use lt_optimizer::{ObjectiveDirection, StrategyKind};
use lt_types::{HyperparameterSchema, TrialLogError};

#[derive(Parser)]
#[command(name = "loratune")]
#[command(about = "Hyperparameter optimization for LoRA fine-tuning")]
#[command(version)]
struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a study; without --config, runs the built-in Himmelblau smoke study
    Run {
        /// Study configuration (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of objective calls (overrides the config)
        #[arg(short, long)]
        budget: Option<usize>,

        /// Search strategy: random, bayesian or partition
        #[arg(short, long)]
        strategy: Option<String>,

        /// Random seed for reproducibility
        #[arg(long)]
        seed: Option<u64>,

        /// Trial log path (overrides the config)
        #[arg(long)]
        log: Option<PathBuf>,

        /// Ignore trials already in the log
        #[arg(long)]
        fresh: bool,
    },

    /// Evaluate one raw vector and append it to the trial log
    Trial {
        /// Study configuration (JSON); defaults to the Himmelblau smoke study
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Trial log path (overrides the config)
        #[arg(long)]
        log: Option<PathBuf>,

        /// Raw values, one per schema dimension
        #[arg(required = true, allow_negative_numbers = true)]
        values: Vec<f64>,
    },

    /// Decode a raw vector into named hyperparameters
    Decode {
        /// Schema file (JSON); defaults to the LoRA schema
        #[arg(long)]
        schema: Option<PathBuf>,

        /// Raw values, one per schema dimension
        #[arg(required = true, allow_negative_numbers = true)]
        values: Vec<f64>,
    },

    /// Print the default LoRA hyperparameter schema
    Schema,

    /// Summarize an existing trial log
    Summary {
        /// Trial log file
        #[arg(short, long, default_value = "optimization/export.json")]
        log: PathBuf,

        /// Task to rank trials by
        #[arg(short, long, default_value = "mmlu")]
        task: String,

        /// Lower scores are better
        #[arg(long)]
        minimize: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            config,
            budget,
            strategy,
            seed,
            log,
            fresh,
        } => cmd_run(config.as_deref(), budget, strategy.as_deref(), seed, log, fresh),
        Commands::Trial {
            config,
            log,
            values,
        } => cmd_trial(config.as_deref(), log, &values),
        Commands::Decode { schema, values } => cmd_decode(schema.as_deref(), &values),
        Commands::Schema => cmd_schema(),
        Commands::Summary {
            log,
            task,
            minimize,
        } => cmd_summary(&log, &task, minimize),
    }
}

fn cmd_run(
    config_path: Option<&Path>,
    budget: Option<usize>,
    strategy: Option<&str>,
    seed: Option<u64>,
    log: Option<PathBuf>,
    fresh: bool,
) -> Result<()> {
    let mut config = match config_path {
        Some(path) => StudyConfig::from_file(path)
            .with_context(|| format!("loading study config {}", path.display()))?,
        None => {
            info!("No config given; running the Himmelblau smoke study");
            StudyConfig::default()
        }
    };

    if let Some(budget) = budget {
        config.optimization.budget = budget;
    }
    if let Some(strategy) = strategy {
        config.optimization.strategy = strategy.parse::<StrategyKind>()?;
    }
    if seed.is_some() {
        config.optimization.seed = seed;
    }
    if let Some(log) = log {
        config.log_file = log;
    }

    let mut study = config.build_study()?;
    if !fresh {
        study.warm_start()?;
    }
    let summary = study.run()?;

    print_summary(&config, &summary);
    Ok(())
}

fn print_summary(config: &StudyConfig, summary: &StudySummary) {
    let task = &config.optimization.objective_task;

    println!();
    println!("Study {}", config.name);
    println!("==========={}", "=".repeat(config.name.len()));
    println!("Strategy:     {}", config.optimization.strategy);
    println!("Trials:       {}", summary.trials.len());
    println!("Resumed:      {}", summary.status.trials_resumed);
    println!("Log:          {}", config.log_file.display());
    println!();

    match &summary.best {
        Some(best) => {
            println!("Best point:   {}", format_hyperparameters(&best.hyperparameters));
            println!("Best {task}: {}", best.objective);
        }
        None => println!("No completed trials"),
    }

    if !summary.trials.is_empty() {
        println!();
        println!("Solutions:");
        for trial in &summary.trials {
            println!(
                "  #{:<4} {:>12.6}  {}",
                trial.trial_number,
                trial.objective,
                format_hyperparameters(&trial.hyperparameters)
            );
        }
    }
}

fn format_hyperparameters(hp: &lt_types::Hyperparameters) -> String {
    hp.iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn cmd_trial(config_path: Option<&Path>, log: Option<PathBuf>, values: &[f64]) -> Result<()> {
    let mut config = match config_path {
        Some(path) => StudyConfig::from_file(path)
            .with_context(|| format!("loading study config {}", path.display()))?,
        None => StudyConfig::default(),
    };
    if let Some(log) = log {
        config.log_file = log;
    }

    let mut study = config.build_study()?;
    let result = study.run_single(values.to_vec())?;

    println!("Trial #{}", result.trial_number);
    println!("Hyperparameters: {}", format_hyperparameters(&result.hyperparameters));
    for (task, score) in &result.scores {
        println!("  {task}: {score}");
    }
    println!("Logged to {}", config.log_file.display());
    Ok(())
}

fn cmd_decode(schema_path: Option<&Path>, values: &[f64]) -> Result<()> {
    let schema = match schema_path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading schema {}", path.display()))?;
            let schema: HyperparameterSchema = serde_json::from_str(&text)
                .with_context(|| format!("parsing schema {}", path.display()))?;
            schema.validate()?;
            schema
        }
        None => HyperparameterSchema::lora_default(),
    };

    let decoded = schema.decode(values)?;
    println!("{}", serde_json::to_string_pretty(&decoded)?);
    Ok(())
}

fn cmd_schema() -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(&HyperparameterSchema::lora_default())?
    );
    Ok(())
}

fn cmd_summary(path: &Path, task: &str, minimize: bool) -> Result<()> {
    if !path.is_file() {
        return Err(TrialLogError::NotFound {
            path: path.display().to_string(),
        }
        .into());
    }
    let log = TrialLog::open(path)?;

    let direction = if minimize {
        ObjectiveDirection::Minimize
    } else {
        ObjectiveDirection::Maximize
    };
    let summary = log.summary(task, direction)?;

    println!("Log:          {}", summary.path.display());
    println!("Records:      {}", summary.total);
    println!("Completed:    {}", summary.completed);
    println!("Failed:       {}", summary.failed);
    match summary.best {
        Some(best) => {
            println!("Best {task}: {}", best.score(task).unwrap_or(f64::NAN));
            println!("{}", serde_json::to_string_pretty(&best)?);
        }
        None => println!("No completed trial reports {task}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::tempdir;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn decode_accepts_negative_values() {
        let cli = Cli::try_parse_from(["loratune", "decode", "-6.9", "8", "4", "32", "0.1", "0.01"]).unwrap();
        match cli.command {
            Commands::Decode { schema, values } => {
                assert!(schema.is_none());
                assert_eq!(values, vec![-6.9, 8.0, 4.0, 32.0, 0.1, 0.01]);
            }
            _ => panic!("expected decode"),
        }
    }

    #[test]
    fn run_overrides_parse() {
        let cli = Cli::try_parse_from([
            "loratune", "-v", "run", "--budget", "5", "--strategy", "partition", "--seed", "7",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Commands::Run {
                config,
                budget,
                strategy,
                seed,
                fresh,
                ..
            } => {
                assert!(config.is_none());
                assert_eq!(budget, Some(5));
                assert_eq!(strategy.as_deref(), Some("partition"));
                assert_eq!(seed, Some(7));
                assert!(!fresh);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn trial_takes_config_and_raw_values() {
        let cli = Cli::try_parse_from([
            "loratune", "trial", "--config", "study.json", "--log", "out.json", "-5", "8",
        ])
        .unwrap();
        match cli.command {
            Commands::Trial {
                config,
                log,
                values,
            } => {
                assert_eq!(config, Some(PathBuf::from("study.json")));
                assert_eq!(log, Some(PathBuf::from("out.json")));
                assert_eq!(values, vec![-5.0, 8.0]);
            }
            _ => panic!("expected trial"),
        }

        assert!(Cli::try_parse_from(["loratune", "trial"]).is_err());
    }

    #[test]
    fn smoke_trial_is_scored_and_logged() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("smoke.json");

        // (3, 2) is a Himmelblau minimum.
        cmd_trial(None, Some(log_path.clone()), &[3.0, 2.0]).unwrap();
        cmd_trial(None, Some(log_path.clone()), &[0.0, 0.0]).unwrap();

        let records = TrialLog::open(&log_path).unwrap().read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.is_completed()));
        assert_eq!(records[0].score("himmelblau"), Some(0.0));
        assert_eq!(records[1].score("himmelblau"), Some(170.0));
        assert_eq!(records[1].trial_number, Some(1));

        assert!(cmd_trial(None, Some(log_path.clone()), &[3.0]).is_err());
        assert!(cmd_trial(None, Some(log_path), &[9.0, 0.0]).is_err());
    }

    #[test]
    fn hyperparameters_print_in_schema_order() {
        let hp = HyperparameterSchema::lora_default()
            .decode(&[-5.0, 8.0, 4.0, 32.0, 0.1, 0.25])
            .unwrap();
        let printed = format_hyperparameters(&hp);
        let names: Vec<&str> = printed
            .split(' ')
            .filter_map(|pair| pair.split('=').next())
            .collect();
        assert_eq!(
            names,
            ["learning_rate", "lora_rank", "grad_batches", "lora_alpha", "lora_dropout", "weight_decay"]
        );
    }
}
