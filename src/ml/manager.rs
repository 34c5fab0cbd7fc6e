use chrono::{DateTime, Utc};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::data::Table;
use crate::error::ManagerError;
use super::conversion::{AllButLast, ConversionSpec, InputConversion};
use super::models::{FitParams, History, Model};
use super::registry::Registry;

pub const DEFAULT_DESCRIPTION: &str = "No description provided";

/// Version of the manifest layout written by [`ModelManager::save`].
pub const FORMAT_VERSION: u32 = 1;

/// Every option a manager recognises.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerOptions {
    /// Seed for validation splits made by `train`. Unset means a fresh random split per call.
    /// Model randomness is seeded on the model itself.
    #[serde(default)]
    pub split_seed: Option<u64>,
    /// Free-form annotations kept alongside the model.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub history: History,
    pub train_data: Table,
    /// Present only when training was asked to hold out a validation split.
    pub val_data: Option<Table>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    format_version: u32,
    description: String,
    conversion: ConversionSpec,
    options: ManagerOptions,
    model: Option<ModelEntry>,
    saved_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ModelEntry {
    kind: String,
    file: String,
}

/// Pairs a model with the strategy that turns tables into its inputs.
pub struct ModelManager {
    model: Option<Box<dyn Model>>,
    conversion: Box<dyn InputConversion>,
    description: String,
    options: ManagerOptions,
}

impl Default for ModelManager {
    fn default() -> Self {
        Self {
            model: None,
            conversion: Box::new(AllButLast),
            description: DEFAULT_DESCRIPTION.to_string(),
            options: ManagerOptions::default(),
        }
    }
}

impl ModelManager {
    pub fn new(
        model: Option<Box<dyn Model>>,
        conversion: Box<dyn InputConversion>,
        description: impl Into<String>,
        options: ManagerOptions,
    ) -> Self {
        Self {
            model,
            conversion,
            description: description.into(),
            options,
        }
    }

    pub fn with_model(model: Box<dyn Model>) -> Self {
        Self {
            model: Some(model),
            ..Self::default()
        }
    }

    pub fn model(&self) -> Option<&dyn Model> {
        self.model.as_deref()
    }

    pub fn set_model(&mut self, model: Box<dyn Model>) {
        self.model = Some(model);
    }

    pub fn conversion(&self) -> &dyn InputConversion {
        self.conversion.as_ref()
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    /// Shuffle the rows of `table` and split off `ceil(fraction * rows)` of them.
    ///
    /// Returns `(major, minor)`. Both parts are non-empty and together hold every row once.
    pub fn split(table: &Table, fraction: f64, seed: Option<u64>) -> Result<(Table, Table), ManagerError> {
        if !(fraction > 0.0 && fraction < 1.0) {
            return Err(ManagerError::InvalidSplit(fraction));
        }

        let rows = table.nrows();
        // Tolerance keeps e.g. 0.1 * 30 from rounding up to 4.
        let minor_len = (fraction * rows as f64 - 1e-9).ceil() as usize;
        if minor_len == 0 || minor_len >= rows {
            return Err(ManagerError::EmptySplit { rows, fraction });
        }

        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut indices: Vec<usize> = (0..rows).collect();
        indices.shuffle(&mut rng);

        let (minor, major) = indices.split_at(minor_len);
        debug!("Split {} rows into {} / {}", rows, major.len(), minor.len());
        Ok((table.take(major), table.take(minor)))
    }

    pub fn convert_input(&self, table: &Table) -> Result<(DMatrix<f64>, DVector<f64>), ManagerError> {
        Ok(self.conversion.convert(table)?)
    }

    pub fn train(
        &mut self,
        table: &Table,
        epochs: usize,
        batch_size: usize,
        validation_split: Option<f64>,
    ) -> Result<TrainOutcome, ManagerError> {
        if self.model.is_none() {
            return Err(ManagerError::NoModel);
        }

        let (train_data, val_data) = match validation_split {
            Some(fraction) => {
                let (train, val) = Self::split(table, fraction, self.options.split_seed)?;
                (train, Some(val))
            }
            None => (table.clone(), None),
        };

        let (x, y) = self.conversion.convert(&train_data)?;
        let validation = val_data
            .as_ref()
            .map(|val| self.conversion.convert(val))
            .transpose()?;

        info!(
            "Training {} on {} rows ({} held out) for {} epochs",
            self.description,
            train_data.nrows(),
            val_data.as_ref().map_or(0, Table::nrows),
            epochs
        );

        let params = FitParams {
            epochs,
            batch_size,
            validation: validation.as_ref().map(|(vx, vy)| (vx, vy)),
        };
        let model = self.model.as_mut().ok_or(ManagerError::NoModel)?;
        let history = model.fit(&x, &y, &params)?;

        Ok(TrainOutcome {
            history,
            train_data,
            val_data,
        })
    }

    pub fn test(&self, table: &Table, batch_size: usize) -> Result<Vec<f64>, ManagerError> {
        let model = self.model.as_ref().ok_or(ManagerError::NoModel)?;
        let (x, y) = self.conversion.convert(table)?;
        let scores = model.evaluate(&x, &y, batch_size)?;
        info!("Evaluated {} on {} rows: {:?}", self.description, table.nrows(), scores);
        Ok(scores)
    }

    /// Write a JSON manifest to `path` and the model's native bytes next to it (`<path>.model`).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ManagerError> {
        let path = path.as_ref();
        let model = match &self.model {
            Some(model) => {
                let model_path = model_path(path);
                fs::write(&model_path, model.to_native()?)?;
                Some(ModelEntry {
                    kind: model.kind().to_string(),
                    file: model_path
                        .file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                })
            }
            None => None,
        };

        let manifest = Manifest {
            format_version: FORMAT_VERSION,
            description: self.description.clone(),
            conversion: self.conversion.spec(),
            options: self.options.clone(),
            model,
            saved_at: Utc::now(),
        };
        fs::write(path, serde_json::to_string_pretty(&manifest)?)?;

        info!("Saved manager '{}' to {}", self.description, path.display());
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>, registry: &Registry) -> Result<Self, ManagerError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;

        let raw: serde_json::Value = serde_json::from_str(&content)?;
        let found = raw
            .get("format_version")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0) as u32;
        if found != FORMAT_VERSION {
            return Err(ManagerError::IncompatibleVersion {
                found,
                expected: FORMAT_VERSION,
            });
        }
        let manifest: Manifest = serde_json::from_value(raw)?;

        let conversion = registry.conversion(&manifest.conversion)?;
        let model = match &manifest.model {
            Some(entry) => {
                if Path::new(&entry.file).file_name().and_then(OsStr::to_str) != Some(entry.file.as_str()) {
                    return Err(ManagerError::InvalidModelFile(entry.file.clone()));
                }
                let model_file = path
                    .parent()
                    .map(|dir| dir.join(&entry.file))
                    .unwrap_or_else(|| PathBuf::from(&entry.file));
                let bytes = fs::read(model_file)?;
                Some(registry.load_model(&entry.kind, &bytes)?)
            }
            None => None,
        };

        info!(
            "Loaded manager '{}' (saved {}) from {}",
            manifest.description,
            manifest.saved_at,
            path.display()
        );
        Ok(Self {
            model,
            conversion,
            description: manifest.description,
            options: manifest.options,
        })
    }
}

fn model_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".model");
    PathBuf::from(name)
}

impl fmt::Display for ModelManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

impl fmt::Debug for ModelManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Column;
    use crate::ml::{LeastSquaresModel, SelectColumns};
    use tempfile::tempdir;

    fn table(rows: usize) -> Table {
        let x: Vec<f64> = (0..rows).map(|i| i as f64).collect();
        let z: Vec<f64> = (0..rows).map(|i| ((i * 7) % 5) as f64).collect();
        let y: Vec<f64> = x.iter().zip(&z).map(|(x, z)| 2.0 * x - z + 1.0).collect();
        Table::new()
            .with_column("x", Column::Scalar(x))
            .and_then(|t| t.with_column("z", Column::Scalar(z)))
            .and_then(|t| t.with_column("y", Column::Scalar(y)))
            .unwrap()
    }

    #[test]
    fn split_partitions_rows() {
        let data = table(10);
        let (major, minor) = ModelManager::split(&data, 0.3, Some(3)).unwrap();
        assert_eq!(minor.nrows(), 3);
        assert_eq!(major.nrows(), 7);

        let mut seen: Vec<f64> = major
            .scalar_column("x")
            .unwrap()
            .iter()
            .chain(minor.scalar_column("x").unwrap())
            .copied()
            .collect();
        seen.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(seen, data.scalar_column("x").unwrap());
    }

    #[test]
    fn split_is_reproducible_with_seed() {
        let data = table(50);
        let first = ModelManager::split(&data, 0.2, Some(11)).unwrap();
        let second = ModelManager::split(&data, 0.2, Some(11)).unwrap();
        assert_eq!(first.1, second.1);
    }

    #[test]
    fn split_rejects_bad_fractions() {
        let data = table(4);
        assert!(matches!(ModelManager::split(&data, 0.0, None), Err(ManagerError::InvalidSplit(_))));
        assert!(matches!(ModelManager::split(&data, 1.0, None), Err(ManagerError::InvalidSplit(_))));
        assert!(matches!(
            ModelManager::split(&Table::new(), 0.5, None),
            Err(ManagerError::EmptySplit { rows: 0, .. })
        ));
    }

    #[test]
    fn train_without_model_fails() {
        let mut manager = ModelManager::default();
        assert!(matches!(manager.train(&table(5), 1, 1, None), Err(ManagerError::NoModel)));
        assert!(matches!(manager.test(&table(5), 1), Err(ManagerError::NoModel)));
    }

    #[test]
    fn train_outcome_shape() {
        let data = table(20);
        let mut manager = ModelManager::with_model(Box::new(LeastSquaresModel::new()));

        let plain = manager.train(&data, 1, 4, None).unwrap();
        assert_eq!(plain.train_data, data);
        assert!(plain.val_data.is_none());

        let held_out = manager.train(&data, 1, 4, Some(0.25)).unwrap();
        let val = held_out.val_data.unwrap();
        assert_eq!(val.nrows(), 5);
        assert_eq!(held_out.train_data.nrows(), 15);
        assert!(held_out.history.last().unwrap().val_loss.is_some());

        let scores = manager.test(&data, 8).unwrap();
        assert!(scores[0] < 1e-9);
    }

    #[test]
    fn display_and_debug_print_description() {
        let manager = ModelManager::new(None, Box::new(AllButLast), "tau id v2", ManagerOptions::default());
        assert_eq!(manager.to_string(), "tau id v2");
        assert_eq!(format!("{:?}", manager), "tau id v2");
        assert_eq!(ModelManager::default().to_string(), DEFAULT_DESCRIPTION);
    }

    #[test]
    fn save_and_load_round_trip() {
        let data = table(12);
        let mut options = ManagerOptions::default();
        options.split_seed = Some(5);
        options.tags.insert("dataset".to_string(), "toy".to_string());
        let mut manager = ModelManager::new(
            Some(Box::new(LeastSquaresModel::new())),
            Box::new(SelectColumns::new(vec!["x".to_string(), "z".to_string()], "y")),
            "linear toy",
            options.clone(),
        );
        manager.train(&data, 1, 4, None).unwrap();

        let dir = tempdir().unwrap();
        let path = dir.path().join("manager.json");
        manager.save(&path).unwrap();
        let loaded = ModelManager::load(&path, &Registry::default()).unwrap();

        assert_eq!(loaded.description(), "linear toy");
        assert_eq!(loaded.options(), &options);
        assert_eq!(loaded.conversion().spec(), manager.conversion().spec());
        assert_eq!(loaded.model().unwrap().kind(), LeastSquaresModel::KIND);
        let before = manager.test(&data, 4).unwrap();
        let after = loaded.test(&data, 4).unwrap();
        assert!((before[0] - after[0]).abs() < 1e-9);
        assert!(model_path(&path).exists());
    }

    #[test]
    fn load_reports_version_and_missing_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manager.json");
        assert!(matches!(
            ModelManager::load(&path, &Registry::default()),
            Err(ManagerError::Io(_))
        ));

        fs::write(&path, r#"{"format_version": 99}"#).unwrap();
        assert!(matches!(
            ModelManager::load(&path, &Registry::default()),
            Err(ManagerError::IncompatibleVersion { found: 99, .. })
        ));

        fs::write(&path, "not json").unwrap();
        assert!(matches!(
            ModelManager::load(&path, &Registry::default()),
            Err(ManagerError::Json(_))
        ));
    }

    #[test]
    fn load_rejects_model_files_outside_the_manifest_dir() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manager.json");
        ModelManager::with_model(Box::new(LeastSquaresModel::new())).save(&path).unwrap();

        let manifest = fs::read_to_string(&path).unwrap();
        let file_name = model_path(&path).file_name().unwrap().to_string_lossy().into_owned();
        for crafted in ["../manager.json.model", "/etc/passwd", ".."] {
            fs::write(&path, manifest.replace(&file_name, crafted)).unwrap();
            assert!(matches!(
                ModelManager::load(&path, &Registry::default()),
                Err(ManagerError::InvalidModelFile(name)) if name == crafted
            ));
        }
    }
}
