//! Model manager and tree reshaper.
//!
//! [`ml::ModelManager`] pairs a trainable model with a named input-conversion
//! strategy and persists both as a schema. [`reshape`] applies ordered
//! column-definition instructions to columnar trees.

pub mod config;
pub mod data;
pub mod error;
pub mod ml;
pub mod reshape;

pub use data::{Column, Table};
pub use error::{ExprError, InstructionError, ManagerError, ModelError, ReshapeError, TableError};
pub use ml::{ModelManager, Registry};
pub use reshape::{reshape_to_table, reshape_to_tree, Instruction, ReshapeOptions};
