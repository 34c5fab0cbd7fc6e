pub mod table;
pub mod tree_file;

pub use table::{row_window, Column, Table};
pub use tree_file::{read_tree, write_tree, TreeFile};
