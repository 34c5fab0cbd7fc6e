use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use crate::ml::{ConversionSpec, LeastSquaresModel, ManagerOptions, Model, Objective, SgdModel};
use crate::reshape::RowRange;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub manager: ManagerConfig,
    pub training: TrainingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelChoice {
    LeastSquares,
    LinearSgd,
    LogisticSgd,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub description: String,
    pub model: ModelChoice,
    pub learning_rate: f64,
    pub conversion: ConversionSpec,
    pub split_seed: Option<u64>,
    /// Seeds SGD weight initialisation and batch shuffling.
    pub model_seed: Option<u64>,
    pub tags: BTreeMap<String, String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            description: crate::ml::DEFAULT_DESCRIPTION.to_string(),
            model: ModelChoice::LeastSquares,
            learning_rate: 0.01,
            conversion: ConversionSpec::AllButLast,
            split_seed: None,
            model_seed: None,
            tags: BTreeMap::new(),
        }
    }
}

impl ManagerConfig {
    pub fn build_model(&self) -> Box<dyn Model> {
        match self.model {
            ModelChoice::LeastSquares => Box::new(LeastSquaresModel::new()),
            ModelChoice::LinearSgd => Box::new(self.sgd(Objective::Linear)),
            ModelChoice::LogisticSgd => Box::new(self.sgd(Objective::Logistic)),
        }
    }

    fn sgd(&self, objective: Objective) -> SgdModel {
        let model = SgdModel::new(objective, self.learning_rate);
        match self.model_seed {
            Some(seed) => model.with_seed(seed),
            None => model,
        }
    }

    pub fn options(&self) -> ManagerOptions {
        ManagerOptions {
            split_seed: self.split_seed,
            tags: self.tags.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrainingConfig {
    pub input: PathBuf,
    pub tree: String,
    /// Instruction applied to the tree before training; the raw tree is used when absent.
    #[serde(default)]
    pub instruction: Option<PathBuf>,
    #[serde(default)]
    pub range: Option<RowRange>,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub validation_split: Option<f64>,
    pub output: PathBuf,
}

fn default_epochs() -> usize {
    10
}

fn default_batch_size() -> usize {
    32
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }
}
