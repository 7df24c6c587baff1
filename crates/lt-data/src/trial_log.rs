//! Append-only JSON-lines trial log.
//!
//! One JSON object per line: the trial's hyperparameters, the experiment
//! metadata and the per-task results (`null` for failed trials). Lines are
//! never rewritten; a continuation run re-reads the file to seed its strategy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use lt_optimizer::{ObjectiveDirection, OptimizationId, Point, Trial, TrialResult};
use lt_types::{Experiment, HyperparameterSchema, Hyperparameters, LtResult, TrialLogError};

/// One line of the trial log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub hyperparameters: Hyperparameters,
    pub experiment: Experiment,
    /// Score per task; `None` when the trial failed.
    #[serde(default)]
    pub results: Option<BTreeMap<String, f64>>,
    /// The raw point the hyperparameters were decoded from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Point>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimization_id: Option<OptimizationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial_number: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TrialRecord {
    pub fn completed(
        optimization_id: OptimizationId,
        result: &TrialResult,
        experiment: &Experiment,
    ) -> Self {
        Self {
            hyperparameters: result.hyperparameters.clone(),
            experiment: experiment.clone(),
            results: Some(result.scores.clone()),
            raw: Some(result.point.clone()),
            trial_id: Some(result.trial_id),
            optimization_id: Some(optimization_id),
            trial_number: Some(result.trial_number),
            recorded_at: Some(Utc::now()),
            error: None,
        }
    }

    pub fn failed(trial: &Trial, experiment: &Experiment, error: impl Into<String>) -> Self {
        Self {
            hyperparameters: trial.hyperparameters.clone(),
            experiment: experiment.clone(),
            results: None,
            raw: Some(trial.point.clone()),
            trial_id: Some(trial.id),
            optimization_id: Some(trial.optimization_id),
            trial_number: Some(trial.trial_number),
            recorded_at: Some(Utc::now()),
            error: Some(error.into()),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.results.is_some()
    }

    /// Score of `task`, if the trial completed and reported it.
    pub fn score(&self, task: &str) -> Option<f64> {
        self.results.as_ref()?.get(task).copied()
    }
}

/// A logged trial mapped back into the search space.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub point: Point,
    /// Unoriented objective score.
    pub score: f64,
    pub record: TrialRecord,
}

/// Counts and best record of a trial log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogSummary {
    pub path: PathBuf,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub best: Option<TrialRecord>,
}

/// Handle on a JSON-lines trial log file.
#[derive(Debug, Clone)]
pub struct TrialLog {
    path: PathBuf,
}

impl TrialLog {
    /// Open (without creating) a log, creating its parent directory.
    pub fn open<P: AsRef<Path>>(path: P) -> LtResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Append one record as a single line.
    pub fn append(&self, record: &TrialRecord) -> LtResult<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;

        debug!(
            "Appended trial {:?} to {}",
            record.trial_number,
            self.path.display()
        );
        Ok(())
    }

    /// Read every record in append order. A missing file reads as empty.
    pub fn read_all(&self) -> LtResult<Vec<TrialRecord>> {
        if !self.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(&self.path)?);
        let mut records = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: TrialRecord = serde_json::from_str(&line).map_err(|e| TrialLogError::MalformedRecord {
                path: self.path.display().to_string(),
                line: index + 1,
                message: e.to_string(),
            })?;
            records.push(record);
        }
        Ok(records)
    }

    /// Records with non-null results.
    pub fn completed(&self) -> LtResult<Vec<TrialRecord>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(TrialRecord::is_completed)
            .collect())
    }

    /// Completed trials that scored `task`, mapped into `schema`'s raw space.
    ///
    /// The logged raw point is used when it matches the schema's dimension;
    /// otherwise the hyperparameters are encoded. Records that fit neither
    /// way are skipped.
    pub fn observations(
        &self,
        schema: &HyperparameterSchema,
        task: &str,
    ) -> LtResult<Vec<Observation>> {
        let mut observations = Vec::new();
        for record in self.completed()? {
            let Some(score) = record.score(task) else {
                debug!("Skipping record without a {} score", task);
                continue;
            };
            let point = match &record.raw {
                Some(raw) if raw.len() == schema.len() => raw.clone(),
                _ => match schema.encode(&record.hyperparameters) {
                    Ok(point) => point,
                    Err(e) => {
                        warn!("Skipping logged trial that does not fit the schema: {}", e);
                        continue;
                    }
                },
            };
            observations.push(Observation {
                point,
                score,
                record,
            });
        }
        Ok(observations)
    }

    /// Best completed record for `task`.
    pub fn best(&self, task: &str, direction: ObjectiveDirection) -> LtResult<Option<TrialRecord>> {
        Ok(best_of(self.completed()?, task, direction))
    }

    pub fn summary(&self, task: &str, direction: ObjectiveDirection) -> LtResult<LogSummary> {
        let records = self.read_all()?;
        let total = records.len();
        let completed = records.iter().filter(|r| r.is_completed()).count();
        Ok(LogSummary {
            path: self.path.clone(),
            total,
            completed,
            failed: total - completed,
            best: best_of(records, task, direction),
        })
    }
}

fn best_of(
    records: Vec<TrialRecord>,
    task: &str,
    direction: ObjectiveDirection,
) -> Option<TrialRecord> {
    let mut best: Option<(f64, TrialRecord)> = None;
    for record in records {
        let Some(score) = record.score(task) else {
            continue;
        };
        if best
            .as_ref()
            .map_or(true, |(incumbent, _)| direction.is_better(score, *incumbent))
        {
            best = Some((score, record));
        }
    }
    best.map(|(_, record)| record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lt_types::{HyperparameterValue, LtError};
    use tempfile::tempdir;

    fn record(rank: i64, lr: f64, mmlu: Option<f64>) -> TrialRecord {
        let mut hp = Hyperparameters::new();
        hp.insert("learning_rate".into(), HyperparameterValue::Float(lr));
        hp.insert("lora_rank".into(), HyperparameterValue::Int(rank));
        TrialRecord {
            hyperparameters: hp,
            experiment: Experiment::default(),
            results: mmlu.map(|s| BTreeMap::from([("mmlu".to_string(), s)])),
            raw: None,
            trial_id: Some(Uuid::new_v4()),
            optimization_id: None,
            trial_number: None,
            recorded_at: None,
            error: None,
        }
    }

    fn two_param_schema() -> HyperparameterSchema {
        HyperparameterSchema::new()
            .add_exponential("learning_rate", -10.0, -1.0)
            .add_int("lora_rank", 2.0, 32.0)
    }

    #[test]
    fn append_then_read_preserves_order() {
        let dir = tempdir().unwrap();
        let log = TrialLog::open(dir.path().join("export.json")).unwrap();
        assert!(log.read_all().unwrap().is_empty());

        log.append(&record(4, 0.01, Some(0.31))).unwrap();
        log.append(&record(8, 0.001, None)).unwrap();
        log.append(&record(16, 0.002, Some(0.35))).unwrap();

        let records = log.read_all().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(
            records[1].hyperparameters["lora_rank"],
            HyperparameterValue::Int(8)
        );
        assert_eq!(log.completed().unwrap().len(), 2);

        let raw = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(raw.lines().count(), 3);
        assert!(raw.lines().nth(1).unwrap().contains(r#""results":null"#));
    }

    #[test]
    fn open_creates_parent_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("optimization").join("export.json");
        let log = TrialLog::open(&path).unwrap();
        log.append(&record(2, 0.1, Some(0.2))).unwrap();
        assert!(path.is_file());
    }

    #[test]
    fn reads_minimal_legacy_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("legacy.json");
        std::fs::write(
            &path,
            concat!(
                r#"{"hyperparameters": {"learning_rate": 0.0001, "lora_rank": 8}, "experiment": {"model_id": "TinyLlama/TinyLlama-1.1B-Chat-v1.0", "calls": 100}}"#,
                "\n\n",
                r#"{"hyperparameters": {"learning_rate": 0.001, "lora_rank": 4}, "experiment": {}, "results": {"mmlu": 0.27}}"#,
                "\n"
            ),
        )
        .unwrap();

        let log = TrialLog::open(&path).unwrap();
        let records = log.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert!(!records[0].is_completed());
        assert_eq!(records[0].experiment.calls, 100);
        assert_eq!(records[1].score("mmlu"), Some(0.27));
    }

    #[test]
    fn malformed_line_reports_line_number() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        let good = serde_json::to_string(&record(4, 0.01, Some(0.3))).unwrap();
        std::fs::write(&path, format!("{good}\n{{not json\n")).unwrap();

        let err = TrialLog::open(&path).unwrap().read_all().unwrap_err();
        match err {
            LtError::TrialLog(TrialLogError::MalformedRecord { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn observations_encode_and_skip() {
        let dir = tempdir().unwrap();
        let log = TrialLog::open(dir.path().join("log.json")).unwrap();

        log.append(&record(8, (-4.0f64).exp(), Some(0.3))).unwrap();
        log.append(&record(4, 0.01, None)).unwrap();

        let mut with_raw = record(16, (-2.5f64).exp(), Some(0.4));
        with_raw.raw = Some(vec![-2.5, 16.7]);
        log.append(&with_raw).unwrap();

        // Exponential parameter logged as zero cannot be encoded.
        log.append(&record(4, 0.0, Some(0.1))).unwrap();

        let obs = log.observations(&two_param_schema(), "mmlu").unwrap();
        assert_eq!(obs.len(), 2);
        assert!((obs[0].point[0] + 4.0).abs() < 1e-12);
        assert_eq!(obs[0].point[1], 8.0);
        assert_eq!(obs[1].point, vec![-2.5, 16.7]);
        assert_eq!(obs[1].score, 0.4);

        assert!(log.observations(&two_param_schema(), "gsm8k").unwrap().is_empty());
    }

    #[test]
    fn best_and_summary_respect_direction() {
        let dir = tempdir().unwrap();
        let log = TrialLog::open(dir.path().join("log.json")).unwrap();
        for (rank, score) in [(2, Some(0.30)), (4, None), (8, Some(0.42)), (16, Some(0.25))] {
            log.append(&record(rank, 0.01, score)).unwrap();
        }

        let best = log.best("mmlu", ObjectiveDirection::Maximize).unwrap().unwrap();
        assert_eq!(best.score("mmlu"), Some(0.42));
        let worst = log.best("mmlu", ObjectiveDirection::Minimize).unwrap().unwrap();
        assert_eq!(worst.score("mmlu"), Some(0.25));

        let summary = log.summary("mmlu", ObjectiveDirection::Maximize).unwrap();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.completed, 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.best.unwrap().score("mmlu"), Some(0.42));
    }

    #[test]
    fn failed_record_from_trial() {
        let mut hp = Hyperparameters::new();
        hp.insert("lora_rank".into(), HyperparameterValue::Int(4));
        let trial = Trial::new(Uuid::new_v4(), 3, vec![4.2], hp);
        let rec = TrialRecord::failed(&trial, &Experiment::default(), "trainer exited with status 1");

        assert!(!rec.is_completed());
        assert_eq!(rec.trial_number, Some(3));
        assert_eq!(rec.raw, Some(vec![4.2]));
        let json = serde_json::to_value(&rec).unwrap();
        assert!(json["results"].is_null());
        assert_eq!(json["error"], "trainer exited with status 1");
    }

    #[test]
    fn logged_hyperparameters_keep_schema_order() {
        let dir = tempdir().unwrap();
        let log = TrialLog::open(dir.path().join("export.json")).unwrap();
        let schema = HyperparameterSchema::lora_default();
        let hp = schema.decode(&[-5.0, 8.0, 4.0, 32.0, 0.1, 0.2]).unwrap();

        let trial = Trial::new(Uuid::new_v4(), 0, vec![-5.0, 8.0, 4.0, 32.0, 0.1, 0.2], hp);
        log.append(&TrialRecord::failed(&trial, &Experiment::default(), "interrupted"))
            .unwrap();

        let line = std::fs::read_to_string(log.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        let object = value["hyperparameters"].as_object().unwrap();
        // Key order of the object as written on disk.
        let mut keys: Vec<(usize, &String)> = object
            .keys()
            .map(|k| (line.find(&format!("\"{k}\":")).unwrap(), k))
            .collect();
        keys.sort();
        let written: Vec<&str> = keys.iter().map(|(_, k)| k.as_str()).collect();
        assert_eq!(written, schema.names());

        let records = log.read_all().unwrap();
        assert_eq!(records[0].hyperparameters.names().collect::<Vec<_>>(), schema.names());
    }
}
