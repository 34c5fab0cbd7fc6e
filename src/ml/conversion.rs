use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::data::Table;
use crate::error::TableError;

/// Persisted identifier of an input-conversion strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ConversionSpec {
    AllButLast,
    Columns { features: Vec<String>, label: String },
    /// A user strategy, resolved through [`crate::ml::Registry`] on load.
    Custom { name: String },
}

impl Default for ConversionSpec {
    fn default() -> Self {
        ConversionSpec::AllButLast
    }
}

impl ConversionSpec {
    /// Instantiate a built-in strategy; `Custom` specs return `None`.
    pub fn builtin(&self) -> Option<Box<dyn InputConversion>> {
        match self {
            ConversionSpec::AllButLast => Some(Box::new(AllButLast)),
            ConversionSpec::Columns { features, label } => {
                Some(Box::new(SelectColumns::new(features.clone(), label.clone())))
            }
            ConversionSpec::Custom { .. } => None,
        }
    }
}

/// Turns a table into model inputs: a feature matrix and a label vector.
pub trait InputConversion {
    fn name(&self) -> &str;

    fn spec(&self) -> ConversionSpec;

    fn convert(&self, table: &Table) -> Result<(DMatrix<f64>, DVector<f64>), TableError>;
}

/// Every column but the last is a feature; the last column is the label.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllButLast;

impl InputConversion for AllButLast {
    fn name(&self) -> &str {
        "all_but_last"
    }

    fn spec(&self) -> ConversionSpec {
        ConversionSpec::AllButLast
    }

    fn convert(&self, table: &Table) -> Result<(DMatrix<f64>, DVector<f64>), TableError> {
        let names = table.column_names();
        let (label, features) = names.split_last().ok_or(TableError::TooFewColumns {
            required: 2,
            found: 0,
        })?;
        if features.is_empty() {
            return Err(TableError::TooFewColumns {
                required: 2,
                found: names.len(),
            });
        }
        Ok((table.scalar_matrix(features)?, table.scalar_vector(label)?))
    }
}

/// Explicitly named feature columns and label column.
#[derive(Debug, Clone)]
pub struct SelectColumns {
    features: Vec<String>,
    label: String,
}

impl SelectColumns {
    pub fn new(features: Vec<String>, label: impl Into<String>) -> Self {
        Self {
            features,
            label: label.into(),
        }
    }
}

impl InputConversion for SelectColumns {
    fn name(&self) -> &str {
        "columns"
    }

    fn spec(&self) -> ConversionSpec {
        ConversionSpec::Columns {
            features: self.features.clone(),
            label: self.label.clone(),
        }
    }

    fn convert(&self, table: &Table) -> Result<(DMatrix<f64>, DVector<f64>), TableError> {
        Ok((
            table.scalar_matrix(&self.features)?,
            table.scalar_vector(&self.label)?,
        ))
    }
}
