use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::TableError;

/// A single column. Vector columns hold one array per row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "values", rename_all = "snake_case")]
pub enum Column {
    Scalar(Vec<f64>),
    Vector(Vec<Vec<f64>>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Scalar(values) => values.len(),
            Column::Vector(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_vector(&self) -> bool {
        matches!(self, Column::Vector(_))
    }

    pub fn as_scalar(&self) -> Option<&[f64]> {
        match self {
            Column::Scalar(values) => Some(values),
            Column::Vector(_) => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[Vec<f64>]> {
        match self {
            Column::Vector(values) => Some(values),
            Column::Scalar(_) => None,
        }
    }

    fn take(&self, indices: &[usize]) -> Column {
        match self {
            Column::Scalar(values) => Column::Scalar(indices.iter().map(|&i| values[i]).collect()),
            Column::Vector(values) => {
                Column::Vector(indices.iter().map(|&i| values[i].clone()).collect())
            }
        }
    }
}

/// Ordered set of equally long, uniquely named columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTable")]
pub struct Table {
    columns: Vec<(String, Column)>,
}

/// Unchecked column list as read from disk.
#[derive(Deserialize)]
struct RawTable {
    columns: Vec<(String, Column)>,
}

impl TryFrom<RawTable> for Table {
    type Error = TableError;

    fn try_from(raw: RawTable) -> Result<Self, Self::Error> {
        raw.columns
            .into_iter()
            .try_fold(Table::new(), |table, (name, column)| table.with_column(name, column))
    }
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Table::push_column`].
    pub fn with_column(mut self, name: impl Into<String>, column: Column) -> Result<Self, TableError> {
        self.push_column(name, column)?;
        Ok(self)
    }

    pub fn push_column(&mut self, name: impl Into<String>, column: Column) -> Result<(), TableError> {
        let name = name.into();
        if self.column(&name).is_some() {
            return Err(TableError::DuplicateColumn(name));
        }
        if let Some((_, first)) = self.columns.first() {
            if first.len() != column.len() {
                return Err(TableError::LengthMismatch {
                    name,
                    expected: first.len(),
                    actual: column.len(),
                });
            }
        }
        self.columns.push((name, column));
        Ok(())
    }

    pub fn nrows(&self) -> usize {
        self.columns.first().map(|(_, c)| c.len()).unwrap_or(0)
    }

    pub fn ncols(&self) -> usize {
        self.columns.len()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Column)> {
        self.columns.iter().map(|(name, column)| (name.as_str(), column))
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, column)| column)
    }

    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Table, TableError> {
        let mut selected = Table::new();
        for name in names {
            let name = name.as_ref();
            let column = self
                .column(name)
                .ok_or_else(|| TableError::MissingColumn(name.to_string()))?;
            selected.push_column(name, column.clone())?;
        }
        Ok(selected)
    }

    /// Rows at `indices`, in that order. Panics on out-of-range indices.
    pub fn take(&self, indices: &[usize]) -> Table {
        Table {
            columns: self
                .columns
                .iter()
                .map(|(name, column)| (name.clone(), column.take(indices)))
                .collect(),
        }
    }

    /// Rows `begin..end` stepping by `stride`; an `end` of 0 means "to the last row".
    pub fn slice(&self, begin: usize, end: usize, stride: usize) -> Result<Table, TableError> {
        let indices = row_window(self.nrows(), begin, end, stride)?;
        Ok(self.take(&indices))
    }

    pub fn scalar_column(&self, name: &str) -> Result<&[f64], TableError> {
        self.column(name)
            .ok_or_else(|| TableError::MissingColumn(name.to_string()))?
            .as_scalar()
            .ok_or_else(|| TableError::NotScalar(name.to_string()))
    }

    /// Row-major feature matrix built from scalar columns.
    pub fn scalar_matrix<S: AsRef<str>>(&self, names: &[S]) -> Result<DMatrix<f64>, TableError> {
        let columns = names
            .iter()
            .map(|name| self.scalar_column(name.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(DMatrix::from_fn(self.nrows(), columns.len(), |row, col| {
            columns[col][row]
        }))
    }

    pub fn scalar_vector(&self, name: &str) -> Result<DVector<f64>, TableError> {
        Ok(DVector::from_column_slice(self.scalar_column(name)?))
    }
}

/// Row indices selected by a `(begin, end, stride)` window over `nrows` rows.
pub fn row_window(nrows: usize, begin: usize, end: usize, stride: usize) -> Result<Vec<usize>, TableError> {
    if stride == 0 {
        return Err(TableError::InvalidRange("stride must be at least 1".to_string()));
    }
    let end = if end == 0 { nrows } else { end.min(nrows) };
    if begin > end {
        return Err(TableError::InvalidRange(format!(
            "begin {} is past end {}",
            begin, end
        )));
    }
    Ok((begin..end).step_by(stride).collect())
}
