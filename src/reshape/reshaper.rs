use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

use crate::data::Table;
use crate::error::{ReshapeError, TableError};
use super::frame::Frame;
use super::instruction::Instruction;

/// Tree name used for the optional intermediate snapshot.
pub const SNAPSHOT_TREE_NAME: &str = "reshaped_tree";

/// Row window `begin..end` every `stride` rows. An `end` of 0 means "to the last row".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRange {
    pub begin: usize,
    pub end: usize,
    #[serde(default = "default_stride")]
    pub stride: usize,
}

fn default_stride() -> usize {
    1
}

impl RowRange {
    pub fn new(begin: usize, end: usize) -> Self {
        Self { begin, end, stride: 1 }
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }
}

impl FromStr for RowRange {
    type Err = TableError;

    /// Parses `begin:end` or `begin:end:stride`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s
            .split(':')
            .map(|part| {
                part.trim()
                    .parse::<usize>()
                    .map_err(|_| TableError::InvalidRange(format!("'{}' is not a row number", part)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        match parts.as_slice() {
            [begin, end] => Ok(RowRange::new(*begin, *end)),
            [begin, end, stride] => Ok(RowRange::new(*begin, *end).with_stride(*stride)),
            _ => Err(TableError::InvalidRange(format!(
                "expected begin:end[:stride], got '{}'",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReshapeOptions {
    pub range: Option<RowRange>,
    /// When set, the defined (and ranged) columns are also written there as tree `reshaped_tree`.
    pub intermediate_save_path: Option<PathBuf>,
    pub vectorize: bool,
}

impl Default for ReshapeOptions {
    fn default() -> Self {
        Self {
            range: None,
            intermediate_save_path: None,
            vectorize: true,
        }
    }
}

fn define_all<'a>(tree: &'a Table, instruction: &Instruction) -> Result<Frame<'a>, ReshapeError> {
    instruction
        .iter()
        .try_fold(Frame::new(tree), |frame, (name, expression)| frame.define(name, expression))
}

/// Apply `instruction` to `tree` and return one column per instruction entry.
pub fn reshape_to_table(
    tree: &Table,
    instruction: &Instruction,
    options: &ReshapeOptions,
) -> Result<Table, ReshapeError> {
    let mut frame = define_all(tree, instruction)?;
    if let Some(range) = options.range {
        frame = frame.range(range.begin, range.end, range.stride)?;
    }

    let columns = instruction.names();
    let table = match &options.intermediate_save_path {
        // Snapshots are always vectorized, so their table is the result when vectorizing.
        Some(path) => {
            let snapshot = frame.snapshot(SNAPSHOT_TREE_NAME, path, &columns)?;
            if options.vectorize {
                snapshot
            } else {
                frame.evaluate(&columns, false)?
            }
        }
        None => frame.evaluate(&columns, options.vectorize)?,
    };
    info!(
        "Reshaped {} source rows into {} rows x {} columns",
        tree.nrows(),
        table.nrows(),
        table.ncols()
    );
    Ok(table)
}

/// Apply `instruction` to `tree` and persist the derived columns as tree `new_tree_name`.
pub fn reshape_to_tree(
    tree: &Table,
    instruction: &Instruction,
    save_path: impl AsRef<Path>,
    new_tree_name: &str,
) -> Result<(), ReshapeError> {
    let frame = define_all(tree, instruction)?;
    frame.snapshot(new_tree_name, save_path, &instruction.names())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{read_tree, Column};
    use tempfile::tempdir;

    fn hits() -> Table {
        Table::new()
            .with_column("x", Column::Scalar(vec![1.0, 3.0, 5.0]))
            .and_then(|t| {
                t.with_column(
                    "hits",
                    Column::Vector(vec![vec![1.0, 2.0], vec![3.0, 0.5], vec![4.0, 5.0]]),
                )
            })
            .unwrap()
    }

    #[test]
    fn logical_selection_over_vectors_stays_vector() {
        let instruction = Instruction::from_pairs([("sel", "x > 2 && hits > 1"), ("any", "x < 2 || hits > 1")]).unwrap();
        let options = ReshapeOptions {
            vectorize: false,
            ..ReshapeOptions::default()
        };

        let table = reshape_to_table(&hits(), &instruction, &options).unwrap();
        assert_eq!(
            table.column("sel"),
            Some(&Column::Vector(vec![vec![0.0, 0.0], vec![1.0, 0.0], vec![1.0, 1.0]]))
        );
        assert_eq!(
            table.column("any"),
            Some(&Column::Vector(vec![vec![1.0, 1.0], vec![1.0, 0.0], vec![1.0, 1.0]]))
        );
    }

    #[test]
    fn snapshot_is_vectorized_even_when_result_is_not() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        let instruction = Instruction::from_pairs([("picked", "x > 2 ? 1 : hits")]).unwrap();

        let vectorized = reshape_to_table(
            &hits(),
            &instruction,
            &ReshapeOptions {
                intermediate_save_path: Some(path.clone()),
                ..ReshapeOptions::default()
            },
        )
        .unwrap();
        assert_eq!(
            vectorized.column("picked"),
            Some(&Column::Vector(vec![vec![1.0, 2.0], vec![1.0], vec![1.0]]))
        );
        assert_eq!(read_tree(&path, SNAPSHOT_TREE_NAME).unwrap(), vectorized);

        let strict = reshape_to_table(
            &hits(),
            &instruction,
            &ReshapeOptions {
                intermediate_save_path: Some(path.clone()),
                vectorize: false,
                ..ReshapeOptions::default()
            },
        );
        assert!(matches!(strict, Err(ReshapeError::MixedColumn(name)) if name == "picked"));
        assert_eq!(read_tree(&path, SNAPSHOT_TREE_NAME).unwrap(), vectorized);
    }

    #[test]
    fn parses_row_ranges() {
        assert_eq!("0:10".parse::<RowRange>().unwrap(), RowRange::new(0, 10));
        assert_eq!(
            "5:0:3".parse::<RowRange>().unwrap(),
            RowRange::new(5, 0).with_stride(3)
        );
        assert!("1".parse::<RowRange>().is_err());
        assert!("a:b".parse::<RowRange>().is_err());
    }
}
