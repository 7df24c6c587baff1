use serde::{Deserialize, Serialize};

/// Checkpoint names for models we fine-tune regularly.
const KNOWN_MODELS: &[(&str, &str)] = &[
    ("TinyLlama/TinyLlama-1.1B-Chat-v1.0", "tiny-llama-1.1b"),
    ("meta-llama/Meta-Llama-3.1-8B", "Llama-3.1-8B"),
    ("meta-llama/Llama-3.2-3B", "Llama-3.2-3B"),
];

/// Resolve the training framework's model name for a hub model id.
///
/// Unknown ids fall back to the lowercased last path segment.
pub fn model_name_for(model_id: &str) -> String {
    KNOWN_MODELS
        .iter()
        .find(|(id, _)| *id == model_id)
        .map(|(_, name)| name.to_string())
        .unwrap_or_else(|| {
            model_id
                .rsplit('/')
                .next()
                .unwrap_or(model_id)
                .to_lowercase()
        })
}

/// Experiment metadata logged alongside every trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Experiment {
    pub model_id: String,
    /// Left empty when omitted from a config; see [`resolve_model_name`](Self::resolve_model_name).
    #[serde(default)]
    pub model_name: String,
    /// Number of accelerator devices used for training.
    pub nb_device: u32,
    pub epochs: u32,
    pub device: String,
    /// Shortened training for smoke runs.
    pub fast_run: bool,
    /// Maximum number of benchmark samples per task (`None` = full task).
    pub eval_limit: Option<u32>,
    /// Objective call budget the experiment was launched with.
    pub calls: usize,
    /// Benchmark tasks reported in each trial's results.
    pub tasks: Vec<String>,
}

impl Experiment {
    pub fn new(model_id: impl Into<String>) -> Self {
        let model_id = model_id.into();
        Self {
            model_name: model_name_for(&model_id),
            model_id,
            nb_device: 2,
            epochs: 1,
            device: "cuda".to_string(),
            fast_run: false,
            eval_limit: Some(100),
            calls: 50,
            tasks: vec!["mmlu".to_string()],
        }
    }

    pub fn with_devices(mut self, nb_device: u32) -> Self {
        self.nb_device = nb_device;
        self
    }

    pub fn with_epochs(mut self, epochs: u32) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_calls(mut self, calls: usize) -> Self {
        self.calls = calls;
        self
    }

    pub fn with_tasks(mut self, tasks: Vec<String>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn with_fast_run(mut self, fast_run: bool) -> Self {
        self.fast_run = fast_run;
        self
    }

    /// Fill in `model_name` when a config only gave the model id.
    pub fn resolve_model_name(&mut self) {
        if self.model_name.is_empty() {
            self.model_name = model_name_for(&self.model_id);
        }
    }
}

impl Default for Experiment {
    fn default() -> Self {
        Self::new("TinyLlama/TinyLlama-1.1B-Chat-v1.0")
    }
}
