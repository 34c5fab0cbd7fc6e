use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use crate::error::TableError;
use super::table::Table;

/// On-disk container of named trees, stored as JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TreeFile {
    pub trees: BTreeMap<String, Table>,
}

impl TreeFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TableError> {
        let content = fs::read_to_string(path.as_ref())?;
        let file: TreeFile = serde_json::from_str(&content)?;
        debug!("Opened {} with {} trees", path.as_ref().display(), file.trees.len());
        Ok(file)
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), TableError> {
        let content = serde_json::to_string(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn tree(&self, name: &str) -> Result<&Table, TableError> {
        self.trees
            .get(name)
            .ok_or_else(|| TableError::MissingTree(name.to_string()))
    }
}

pub fn read_tree(path: impl AsRef<Path>, name: &str) -> Result<Table, TableError> {
    TreeFile::open(path)?.tree(name).cloned()
}

/// Store `table` as tree `name`, keeping any other trees already in the file.
pub fn write_tree(path: impl AsRef<Path>, name: &str, table: &Table) -> Result<(), TableError> {
    let path = path.as_ref();
    let mut file = if path.exists() {
        TreeFile::open(path)?
    } else {
        TreeFile::default()
    };

    file.trees.insert(name.to_string(), table.clone());
    file.write(path)?;

    info!(
        "Wrote tree {} ({} rows, {} columns) to {}",
        name,
        table.nrows(),
        table.ncols(),
        path.display()
    );
    Ok(())
}
