pub mod expr;
pub mod frame;
pub mod instruction;
pub mod reshaper;

pub use expr::{Expr, Value};
pub use frame::{Frame, ENTRY_COLUMN};
pub use instruction::{load_instruction, save_instruction, Instruction};
pub use reshaper::{reshape_to_table, reshape_to_tree, ReshapeOptions, RowRange, SNAPSHOT_TREE_NAME};
