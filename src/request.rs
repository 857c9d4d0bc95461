//! Generation request: a workflow name plus named scalar parameters.
//!
//! Parameters are sent to the backend as form fields; the backend substitutes
//! them into `{{placeholder}}` slots of the named workflow.
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

pub const DEFAULT_WIDTH: i64 = 1080;
pub const DEFAULT_HEIGHT: i64 = 1080;

/// Seed value understood by the backend as "pick one at random".
pub const RANDOM_SEED: i64 = -1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Integer(i) => write!(f, "{}", i),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Integer(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seed {
    Random,
    Fixed(i64),
}

impl Seed {
    pub fn value(self) -> i64 {
        match self {
            Seed::Random => RANDOM_SEED,
            Seed::Fixed(v) => v,
        }
    }
}

impl From<i64> for Seed {
    fn from(v: i64) -> Self {
        if v == RANDOM_SEED { Seed::Random } else { Seed::Fixed(v) }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    workflow_id: String,
    params: BTreeMap<String, ParamValue>,
}

impl GenerationRequest {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        GenerationRequest { workflow_id: workflow_id.into(), params: BTreeMap::new() }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn params(&self) -> &BTreeMap<String, ParamValue> {
        &self.params
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.params.get(key)
    }

    /// Set an arbitrary named parameter.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn prompt(self, text: impl Into<String>) -> Self {
        self.param("prompt", text.into())
    }

    pub fn negative_prompt(self, text: impl Into<String>) -> Self {
        self.param("negative_prompt", text.into())
    }

    pub fn steps(self, steps: i64) -> Self {
        self.param("steps", steps)
    }

    pub fn cfg_scale(self, cfg: f64) -> Self {
        self.param("cfg_scale", cfg)
    }

    pub fn seed(self, seed: Seed) -> Self {
        self.param("seed", seed.value())
    }

    pub fn sampler(self, name: impl Into<String>) -> Self {
        self.param("sampler_name", name.into())
    }

    pub fn scheduler(self, name: impl Into<String>) -> Self {
        self.param("scheduler", name.into())
    }

    pub fn denoise(self, denoise: f64) -> Self {
        self.param("denoise", denoise)
    }

    pub fn size(self, width: i64, height: i64) -> Self {
        self.param("width", width).param("height", height)
    }

    /// Reference to an image previously uploaded via `/upload/image`.
    pub fn input_image(self, comfy_path: impl Into<String>) -> Self {
        self.param("input_image", comfy_path.into())
    }

    /// Clip duration in seconds, for video-capable workflows.
    pub fn duration(self, seconds: i64) -> Self {
        self.param("duration", seconds)
    }

    pub fn ratio(self, ratio: impl Into<String>) -> Self {
        self.param("ratio", ratio.into())
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.workflow_id.trim().is_empty() {
            return Err(AppError::InvalidRequest("workflow id must not be empty".to_string()));
        }
        Ok(())
    }

    /// Form fields sent with the submission, with width/height defaulted.
    pub fn form_fields(&self) -> Vec<(String, String)> {
        let mut fields: BTreeMap<&str, String> =
            self.params.iter().map(|(k, v)| (k.as_str(), v.to_string())).collect();
        fields.entry("width").or_insert_with(|| DEFAULT_WIDTH.to_string());
        fields.entry("height").or_insert_with(|| DEFAULT_HEIGHT.to_string());
        fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }
}
