// LoRA training job description handed to the external trainer

use serde::{Deserialize, Serialize};

use lt_types::{Experiment, HyperparameterValue, Hyperparameters};

const DEFAULT_LEARNING_RATE: f64 = 0.002;
const DEFAULT_LORA_RANK: i64 = 4;
const DEFAULT_LORA_ALPHA: i64 = 16;
const DEFAULT_LORA_DROPOUT: f64 = 0.05;
const DEFAULT_WEIGHT_DECAY: f64 = 0.01;
const DEFAULT_GRAD_BATCHES: i64 = 16;
const FAST_RUN_STEPS: u32 = 20;

/// Instruction-tuning dataset and loader settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSettings {
    /// Hugging Face dataset repository.
    pub dataset: String,
    pub file_name: String,
    pub download_dir: String,
    pub prompt_style: String,
    pub val_split_fraction: f64,
    pub max_seq_length: u32,
    pub batch_size: u32,
    /// Seed of the train/validation split.
    pub seed: u64,
    pub num_workers: u32,
    pub mask_prompt: bool,
    /// Label id excluded from the loss.
    pub ignore_index: i64,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            dataset: "mhenrichsen/alpaca_2k_test".to_string(),
            file_name: "alpaca2k_data_cleaned_archive.json".to_string(),
            download_dir: "./data/alpaca2k".to_string(),
            prompt_style: "alpaca".to_string(),
            val_split_fraction: 0.2,
            max_seq_length: 512,
            batch_size: 1,
            seed: 42,
            num_workers: 4,
            mask_prompt: false,
            ignore_index: -100,
        }
    }
}

/// Low-rank adapter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraSettings {
    pub rank: u32,
    pub alpha: u32,
    pub dropout: f64,
    /// Which attention projections receive an adapter.
    pub query: bool,
    pub key: bool,
    pub value: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSettings {
    pub name: String,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub betas: (f64, f64),
    /// Linear warmup length of the learning-rate schedule.
    pub warmup_steps: u32,
}

/// Everything the trainer needs to run one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingPlan {
    pub model_id: String,
    pub model_name: String,
    pub lora: LoraSettings,
    pub optimizer: OptimizerSettings,
    pub data: DataSettings,
    pub accumulate_grad_batches: u32,
    pub devices: u32,
    pub device: String,
    pub epochs: u32,
    pub max_steps: Option<u32>,
    pub precision: String,
    pub checkpoint_dir: String,
    pub eval_tasks: Vec<String>,
    pub eval_limit: Option<u32>,
}

impl TrainingPlan {
    /// Build a plan from decoded hyperparameters, filling in defaults for
    /// anything the schema does not search over.
    pub fn from_hyperparameters(hp: &Hyperparameters, experiment: &Experiment) -> Self {
        let float = |name: &str, default: f64| hp.get(name).map_or(default, HyperparameterValue::as_f64);
        let int = |name: &str, default: i64| hp.get(name).map_or(default, HyperparameterValue::as_i64);
        let count = |name: &str, default: i64| u32::try_from(int(name, default).max(1)).unwrap_or(u32::MAX);

        let mut experiment = experiment.clone();
        experiment.resolve_model_name();

        Self {
            checkpoint_dir: format!("checkpoints/{}", experiment.model_id),
            model_id: experiment.model_id,
            model_name: experiment.model_name,
            lora: LoraSettings {
                rank: count("lora_rank", DEFAULT_LORA_RANK),
                alpha: count("lora_alpha", DEFAULT_LORA_ALPHA),
                dropout: float("lora_dropout", DEFAULT_LORA_DROPOUT),
                query: true,
                key: false,
                value: true,
            },
            optimizer: OptimizerSettings {
                name: "AdamW".to_string(),
                learning_rate: float("learning_rate", DEFAULT_LEARNING_RATE),
                weight_decay: float("weight_decay", DEFAULT_WEIGHT_DECAY),
                betas: (0.9, 0.95),
                warmup_steps: 10,
            },
            data: DataSettings::default(),
            accumulate_grad_batches: count("grad_batches", DEFAULT_GRAD_BATCHES),
            devices: experiment.nb_device.max(1),
            device: experiment.device,
            epochs: experiment.epochs.max(1),
            max_steps: experiment.fast_run.then_some(FAST_RUN_STEPS),
            precision: "32-true".to_string(),
            eval_tasks: experiment.tasks,
            eval_limit: experiment.eval_limit,
        }
    }

    /// Render the plan as `--key=value` trainer flags.
    pub fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("--model_id={}", self.model_id),
            format!("--model_name={}", self.model_name),
            format!("--lora_r={}", self.lora.rank),
            format!("--lora_alpha={}", self.lora.alpha),
            format!("--lora_dropout={}", self.lora.dropout),
            format!("--lora_query={}", self.lora.query),
            format!("--lora_key={}", self.lora.key),
            format!("--lora_value={}", self.lora.value),
            format!("--learning_rate={}", self.optimizer.learning_rate),
            format!("--weight_decay={}", self.optimizer.weight_decay),
            format!("--beta1={}", self.optimizer.betas.0),
            format!("--beta2={}", self.optimizer.betas.1),
            format!("--warmup_steps={}", self.optimizer.warmup_steps),
            format!("--dataset={}", self.data.dataset),
            format!("--data_file={}", self.data.file_name),
            format!("--download_dir={}", self.data.download_dir),
            format!("--prompt_style={}", self.data.prompt_style),
            format!("--val_split_fraction={}", self.data.val_split_fraction),
            format!("--max_seq_length={}", self.data.max_seq_length),
            format!("--batch_size={}", self.data.batch_size),
            format!("--seed={}", self.data.seed),
            format!("--num_workers={}", self.data.num_workers),
            format!("--mask_prompt={}", self.data.mask_prompt),
            format!("--ignore_index={}", self.data.ignore_index),
            format!("--accumulate_grad_batches={}", self.accumulate_grad_batches),
            format!("--devices={}", self.devices),
            format!("--accelerator={}", self.device),
            format!("--max_epochs={}", self.epochs),
            format!("--precision={}", self.precision),
            format!("--checkpoint_dir={}", self.checkpoint_dir),
        ];
        if let Some(steps) = self.max_steps {
            args.push(format!("--max_steps={steps}"));
        }
        if !self.eval_tasks.is_empty() {
            args.push(format!("--tasks={}", self.eval_tasks.join(",")));
        }
        if let Some(limit) = self.eval_limit {
            args.push(format!("--limit={limit}"));
        }
        args
    }
}
