//! Hyperparameter schema and the raw-vector decoder.
//!
//! Search strategies work on plain `f64` vectors bounded by the schema. The
//! schema turns such a vector into named, typed hyperparameters (and back, for
//! seeding a run from an earlier trial log).

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;

use crate::errors::{LtResult, SchemaError};

/// How a raw search coordinate is turned into a hyperparameter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    /// Truncated toward zero.
    Int,
    /// Used as-is.
    Float,
    /// `e^x`; the bounds are given in log space.
    #[serde(rename = "exp", alias = "exponential")]
    Exponential,
}

impl std::fmt::Display for ParamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int => write!(f, "int"),
            Self::Float => write!(f, "float"),
            Self::Exponential => write!(f, "exp"),
        }
    }
}

/// A single dimension of the schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    pub name: String,
    /// Lower bound of the raw coordinate.
    pub min: f64,
    /// Upper bound of the raw coordinate.
    pub max: f64,
    #[serde(rename = "type")]
    pub kind: ParamType,
}

impl ParameterDef {
    pub fn new(name: impl Into<String>, min: f64, max: f64, kind: ParamType) -> Self {
        Self {
            name: name.into(),
            min,
            max,
            kind,
        }
    }

    /// Apply this dimension's transform to a raw coordinate.
    pub fn decode(&self, raw: f64) -> LtResult<HyperparameterValue> {
        if !raw.is_finite() {
            return Err(SchemaError::NonFinite {
                name: self.name.clone(),
                value: raw,
            }
            .into());
        }
        match self.kind {
            ParamType::Int => Ok(HyperparameterValue::Int(raw.trunc() as i64)),
            ParamType::Float => Ok(HyperparameterValue::Float(raw)),
            ParamType::Exponential => {
                let value = raw.exp();
                if !value.is_finite() {
                    return Err(SchemaError::NonFinite {
                        name: self.name.clone(),
                        value,
                    }
                    .into());
                }
                if value <= 0.0 {
                    return Err(SchemaError::NonPositiveExponential {
                        name: self.name.clone(),
                        value,
                    }
                    .into());
                }
                Ok(HyperparameterValue::Float(value))
            }
        }
    }

    /// Map a decoded value back to its raw coordinate.
    pub fn encode(&self, value: &HyperparameterValue) -> LtResult<f64> {
        let v = value.as_f64();
        match self.kind {
            ParamType::Int | ParamType::Float => Ok(v),
            ParamType::Exponential if v > 0.0 => Ok(v.ln()),
            ParamType::Exponential => Err(SchemaError::NonPositiveExponential {
                name: self.name.clone(),
                value: v,
            }
            .into()),
        }
    }
}

/// A decoded hyperparameter value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HyperparameterValue {
    Int(i64),
    Float(f64),
}

impl HyperparameterValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            Self::Int(v) => *v as f64,
            Self::Float(v) => *v,
        }
    }

    pub fn as_i64(&self) -> i64 {
        match self {
            Self::Int(v) => *v,
            Self::Float(v) => v.trunc() as i64,
        }
    }
}

impl std::fmt::Display for HyperparameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
        }
    }
}

/// Named hyperparameters for one trial.
///
/// Entries keep insertion order, which for decoded values is schema order,
/// and serialize as a JSON object in that order. Consumers of the trial log
/// read the object's columns positionally against the schema bounds.
#[derive(Debug, Clone, Default)]
pub struct Hyperparameters {
    entries: Vec<(String, HyperparameterValue)>,
}

impl Hyperparameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&HyperparameterValue> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Insert or replace a value. A replaced entry keeps its position.
    pub fn insert(&mut self, name: String, value: HyperparameterValue) -> Option<HyperparameterValue> {
        match self.entries.iter_mut().find(|(key, _)| *key == name) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((name, value));
                None
            }
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HyperparameterValue)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }
}

/// Map equality: order does not matter.
impl PartialEq for Hyperparameters {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .all(|(name, value)| other.get(name) == Some(value))
    }
}

impl std::ops::Index<&str> for Hyperparameters {
    type Output = HyperparameterValue;

    fn index(&self, name: &str) -> &Self::Output {
        match self.get(name) {
            Some(value) => value,
            None => panic!("no hyperparameter named {name}"),
        }
    }
}

impl FromIterator<(String, HyperparameterValue)> for Hyperparameters {
    fn from_iter<I: IntoIterator<Item = (String, HyperparameterValue)>>(iter: I) -> Self {
        let mut hp = Self::new();
        for (name, value) in iter {
            hp.insert(name, value);
        }
        hp
    }
}

impl<const N: usize> From<[(String, HyperparameterValue); N]> for Hyperparameters {
    fn from(entries: [(String, HyperparameterValue); N]) -> Self {
        entries.into_iter().collect()
    }
}

impl Serialize for Hyperparameters {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Hyperparameters {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor;

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = Hyperparameters;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a map of hyperparameter names to numbers")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut hp = Hyperparameters::new();
                while let Some((name, value)) = access.next_entry::<String, HyperparameterValue>()? {
                    hp.insert(name, value);
                }
                Ok(hp)
            }
        }

        deserializer.deserialize_map(OrderedVisitor)
    }
}

/// Ordered hyperparameter schema. Position `i` of a raw vector belongs to
/// `parameters[i]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HyperparameterSchema {
    pub parameters: Vec<ParameterDef>,
}

impl HyperparameterSchema {
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
        }
    }

    pub fn add_int(mut self, name: impl Into<String>, min: f64, max: f64) -> Self {
        self.parameters
            .push(ParameterDef::new(name, min, max, ParamType::Int));
        self
    }

    pub fn add_float(mut self, name: impl Into<String>, min: f64, max: f64) -> Self {
        self.parameters
            .push(ParameterDef::new(name, min, max, ParamType::Float));
        self
    }

    pub fn add_exponential(mut self, name: impl Into<String>, min: f64, max: f64) -> Self {
        self.parameters
            .push(ParameterDef::new(name, min, max, ParamType::Exponential));
        self
    }

    /// LoRA fine-tuning schema: learning rate searched in log space, adapter
    /// rank/alpha/dropout, gradient accumulation and weight decay.
    pub fn lora_default() -> Self {
        Self::new()
            .add_exponential("learning_rate", -10.0, -1.0)
            .add_int("lora_rank", 2.0, 32.0)
            .add_int("grad_batches", 0.0, 16.0)
            .add_int("lora_alpha", 16.0, 64.0)
            .add_float("lora_dropout", 0.0, 0.5)
            .add_float("weight_decay", 0.0, 0.5)
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.parameters.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&ParameterDef> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn lower_bounds(&self) -> Vec<f64> {
        self.parameters.iter().map(|p| p.min).collect()
    }

    pub fn upper_bounds(&self) -> Vec<f64> {
        self.parameters.iter().map(|p| p.max).collect()
    }

    pub fn validate(&self) -> LtResult<()> {
        if self.parameters.is_empty() {
            return Err(SchemaError::Empty.into());
        }
        let mut seen = HashSet::new();
        for param in &self.parameters {
            if !seen.insert(param.name.as_str()) {
                return Err(SchemaError::DuplicateParameter {
                    name: param.name.clone(),
                }
                .into());
            }
            let exp_out_of_range = param.kind == ParamType::Exponential
                && (!param.max.exp().is_finite() || param.min.exp() <= 0.0);
            if !param.min.is_finite()
                || !param.max.is_finite()
                || param.min > param.max
                || exp_out_of_range
            {
                return Err(SchemaError::InvalidBounds {
                    name: param.name.clone(),
                    min: param.min,
                    max: param.max,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Decode the raw coordinate at `index`.
    pub fn decode_value(&self, index: usize, raw: f64) -> LtResult<HyperparameterValue> {
        self.parameters
            .get(index)
            .ok_or(SchemaError::UnknownIndex { index })?
            .decode(raw)
    }

    /// Decode a full raw vector. Values are not clamped to the bounds.
    pub fn decode(&self, raw: &[f64]) -> LtResult<Hyperparameters> {
        if raw.len() != self.parameters.len() {
            return Err(SchemaError::DimensionMismatch {
                expected: self.parameters.len(),
                actual: raw.len(),
            }
            .into());
        }
        self.parameters
            .iter()
            .zip(raw)
            .map(|(param, &x)| -> LtResult<(String, HyperparameterValue)> {
                Ok((param.name.clone(), param.decode(x)?))
            })
            .collect()
    }

    /// Inverse of [`decode`](Self::decode) up to integer truncation.
    pub fn encode(&self, hyperparameters: &Hyperparameters) -> LtResult<Vec<f64>> {
        self.parameters
            .iter()
            .map(|param| -> LtResult<f64> {
                let value = hyperparameters.get(&param.name).ok_or_else(|| {
                    SchemaError::MissingParameter {
                        name: param.name.clone(),
                    }
                })?;
                param.encode(value)
            })
            .collect()
    }
}

impl Default for HyperparameterSchema {
    fn default() -> Self {
        Self::lora_default()
    }
}
