use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info};

use crate::data::{row_window, write_tree, Column, Table};
use crate::error::{ExprError, ReshapeError, TableError};
use super::expr::{Env, Expr, Value};

/// Implicit column holding the index of the source row.
pub const ENTRY_COLUMN: &str = "rdfentry_";

/// Lazy view over a table: derived-column definitions plus an optional row window.
/// Nothing is evaluated until [`Frame::evaluate`] or [`Frame::snapshot`].
#[derive(Debug, Clone)]
pub struct Frame<'a> {
    source: &'a Table,
    defines: Vec<(String, Expr)>,
    range: Option<(usize, usize, usize)>,
}

impl<'a> Frame<'a> {
    pub fn new(source: &'a Table) -> Self {
        Self {
            source,
            defines: Vec::new(),
            range: None,
        }
    }

    pub fn has_column(&self, name: &str) -> bool {
        name == ENTRY_COLUMN
            || self.source.column(name).is_some()
            || self.defines.iter().any(|(n, _)| n == name)
    }

    /// Add a derived column. The expression may only read source columns and
    /// columns defined before it.
    pub fn define(mut self, name: &str, expression: &str) -> Result<Self, ReshapeError> {
        if self.has_column(name) {
            return Err(ReshapeError::AlreadyDefined(name.to_string()));
        }

        let expr = Expr::parse(expression).map_err(|source| ReshapeError::Expression {
            column: name.to_string(),
            source,
        })?;
        if let Some(unknown) = expr.columns().into_iter().find(|c| !self.has_column(c)) {
            return Err(ReshapeError::Expression {
                column: name.to_string(),
                source: ExprError::UnknownColumn(unknown),
            });
        }

        debug!("Defined column {} = {}", name, expression);
        self.defines.push((name.to_string(), expr));
        Ok(self)
    }

    /// Restrict evaluation to rows `begin..end` every `stride` rows; `end` 0 means no upper bound.
    pub fn range(mut self, begin: usize, end: usize, stride: usize) -> Result<Self, ReshapeError> {
        if stride == 0 {
            return Err(TableError::InvalidRange("stride must be at least 1".to_string()).into());
        }
        if end != 0 && begin > end {
            return Err(TableError::InvalidRange(format!("begin {} is past end {}", begin, end)).into());
        }
        self.range = Some((begin, end, stride));
        Ok(self)
    }

    /// Materialize `columns` in the given order.
    ///
    /// With `vectorize`, a column whose first value is a vector is stored as
    /// array cells, scalar rows being wrapped into single-element arrays.
    /// Otherwise every column must be homogeneous.
    pub fn evaluate<S: AsRef<str>>(&self, columns: &[S], vectorize: bool) -> Result<Table, ReshapeError> {
        for name in columns {
            if !self.has_column(name.as_ref()) {
                return Err(TableError::MissingColumn(name.as_ref().to_string()).into());
            }
        }

        let needed = self.needed_defines(columns);
        let rows = match self.range {
            Some((begin, end, stride)) => row_window(self.source.nrows(), begin, end, stride)?,
            None => (0..self.source.nrows()).collect(),
        };

        let mut values: Vec<Vec<Value>> = vec![Vec::with_capacity(rows.len()); columns.len()];
        for &row in &rows {
            let mut env = RowEnv {
                source: self.source,
                row,
                derived: Vec::with_capacity(needed.len()),
            };
            for (index, (name, expr)) in self.defines.iter().enumerate() {
                if !needed.contains(&index) {
                    continue;
                }
                let value = expr.eval(&env).map_err(|source| ReshapeError::Expression {
                    column: name.clone(),
                    source,
                })?;
                env.derived.push((name.as_str(), value));
            }
            for (slot, name) in values.iter_mut().zip(columns) {
                let value = env
                    .lookup(name.as_ref())
                    .ok_or_else(|| TableError::MissingColumn(name.as_ref().to_string()))?;
                slot.push(value);
            }
        }

        let mut table = Table::new();
        for (name, column_values) in columns.iter().zip(values) {
            let column = build_column(name.as_ref(), column_values, vectorize)?;
            table.push_column(name.as_ref(), column)?;
        }
        Ok(table)
    }

    /// Evaluate `columns` and write them as tree `tree_name` into `path`.
    pub fn snapshot<S: AsRef<str>>(
        &self,
        tree_name: &str,
        path: impl AsRef<Path>,
        columns: &[S],
    ) -> Result<Table, ReshapeError> {
        let table = self.evaluate(columns, true)?;
        write_tree(path.as_ref(), tree_name, &table)?;
        info!(
            "Snapshot of {} columns written as {} to {}",
            table.ncols(),
            tree_name,
            path.as_ref().display()
        );
        Ok(table)
    }

    /// Indices of the definitions required, directly or transitively, by `columns`.
    fn needed_defines<S: AsRef<str>>(&self, columns: &[S]) -> BTreeSet<usize> {
        let mut wanted: BTreeSet<String> = columns.iter().map(|c| c.as_ref().to_string()).collect();
        let mut needed = BTreeSet::new();
        for (index, (name, expr)) in self.defines.iter().enumerate().rev() {
            if wanted.contains(name) {
                needed.insert(index);
                wanted.extend(expr.columns());
            }
        }
        needed
    }
}

struct RowEnv<'a> {
    source: &'a Table,
    row: usize,
    derived: Vec<(&'a str, Value)>,
}

impl Env for RowEnv<'_> {
    fn lookup(&self, name: &str) -> Option<Value> {
        if let Some((_, value)) = self.derived.iter().find(|(n, _)| *n == name) {
            return Some(value.clone());
        }
        if name == ENTRY_COLUMN {
            return Some(Value::Scalar(self.row as f64));
        }
        self.source.column(name).map(|column| match column {
            Column::Scalar(values) => Value::Scalar(values[self.row]),
            Column::Vector(values) => Value::Vector(values[self.row].clone()),
        })
    }
}

fn build_column(name: &str, values: Vec<Value>, vectorize: bool) -> Result<Column, ReshapeError> {
    let first_is_vector = values.first().map_or(false, Value::is_vector);

    if vectorize && first_is_vector {
        return Ok(Column::Vector(
            values
                .into_iter()
                .map(|value| match value {
                    Value::Scalar(x) => vec![x],
                    Value::Vector(v) => v,
                })
                .collect(),
        ));
    }

    if first_is_vector {
        values
            .into_iter()
            .map(|value| match value {
                Value::Vector(v) => Ok(v),
                Value::Scalar(_) => Err(ReshapeError::MixedColumn(name.to_string())),
            })
            .collect::<Result<_, _>>()
            .map(Column::Vector)
    } else {
        values
            .into_iter()
            .map(|value| match value {
                Value::Scalar(x) => Ok(x),
                Value::Vector(_) => Err(ReshapeError::MixedColumn(name.to_string())),
            })
            .collect::<Result<_, _>>()
            .map(Column::Scalar)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> Table {
        Table::new()
            .with_column("x", Column::Scalar(vec![1.0, 2.0, 3.0, 4.0, 5.0]))
            .and_then(|t| {
                t.with_column(
                    "hits",
                    Column::Vector(vec![vec![1.0, 2.0], vec![], vec![3.0], vec![4.0, 5.0, 6.0], vec![7.0]]),
                )
            })
            .unwrap()
    }

    #[test]
    fn definitions_validate_names_and_references() {
        let source = tree();
        assert!(matches!(
            Frame::new(&source).define("x", "1"),
            Err(ReshapeError::AlreadyDefined(_))
        ));
        assert!(matches!(
            Frame::new(&source).define("y", "z + 1"),
            Err(ReshapeError::Expression { source: ExprError::UnknownColumn(_), .. })
        ));
        assert!(matches!(
            Frame::new(&source).define("y", "x +"),
            Err(ReshapeError::Expression { source: ExprError::Syntax { .. }, .. })
        ));
    }

    #[test]
    fn range_and_entry_index() {
        let source = tree();
        let frame = Frame::new(&source)
            .define("entry", "rdfentry_")
            .unwrap()
            .range(1, 5, 2)
            .unwrap();
        let table = frame.evaluate(&["entry", "x"], true).unwrap();
        assert_eq!(table.scalar_column("entry").unwrap(), &[1.0, 3.0]);
        assert_eq!(table.scalar_column("x").unwrap(), &[2.0, 4.0]);
    }

    #[test]
    fn vectorize_wraps_scalars_after_vector_first_row() {
        let source = tree();
        let frame = Frame::new(&source)
            .define("lead", "x == 1 ? hits : Sum(hits)")
            .unwrap();

        let table = frame.evaluate(&["lead"], true).unwrap();
        assert_eq!(
            table.column("lead").unwrap().as_vector().unwrap(),
            &[vec![1.0, 2.0], vec![0.0], vec![3.0], vec![15.0], vec![7.0]]
        );

        assert!(matches!(
            frame.evaluate(&["lead"], false),
            Err(ReshapeError::MixedColumn(_))
        ));
    }

    #[test]
    fn unrequested_definitions_are_not_evaluated() {
        let source = tree();
        let frame = Frame::new(&source)
            .define("bad", "hits[1]")
            .unwrap()
            .define("twice", "2 * x")
            .unwrap();
        let table = frame.evaluate(&["twice"], true).unwrap();
        assert_eq!(table.scalar_column("twice").unwrap(), &[2.0, 4.0, 6.0, 8.0, 10.0]);
        assert!(matches!(
            frame.evaluate(&["bad"], true),
            Err(ReshapeError::Expression { source: ExprError::IndexOutOfBounds { .. }, .. })
        ));
    }
}
