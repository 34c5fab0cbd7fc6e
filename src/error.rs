use thiserror::Error;

#[derive(Error, Debug)]
pub enum TableError {
    #[error("Column not found: {0}")]
    MissingColumn(String),

    #[error("Duplicate column: {0}")]
    DuplicateColumn(String),

    #[error("Column {name} has {actual} rows, expected {expected}")]
    LengthMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("Column {0} holds vector values where scalars are required")]
    NotScalar(String),

    #[error("Table needs at least {required} columns, found {found}")]
    TooFewColumns {
        required: usize,
        found: usize,
    },

    #[error("Invalid row range: {0}")]
    InvalidRange(String),

    #[error("Tree not found: {0}")]
    MissingTree(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed tree file: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ExprError {
    #[error("Syntax error at offset {pos}: {message}")]
    Syntax {
        pos: usize,
        message: String,
    },

    #[error("Unknown column: {0}")]
    UnknownColumn(String),

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Function {name} expects {expected} arguments, got {actual}")]
    Arity {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("Type error: {0}")]
    Type(String),

    #[error("Index {index} out of bounds for vector of length {len}")]
    IndexOutOfBounds {
        index: i64,
        len: usize,
    },
}

#[derive(Error, Debug)]
pub enum InstructionError {
    #[error("Instruction file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed instruction row at line {line}: expected 2 fields, found {fields}")]
    Malformed {
        line: usize,
        fields: usize,
    },

    #[error("Unterminated quoted field starting at line {0}")]
    UnterminatedQuote(usize),

    #[error("Duplicate instruction name: {0}")]
    DuplicateName(String),
}

#[derive(Error, Debug)]
pub enum ReshapeError {
    #[error("Expression for {column} failed: {source}")]
    Expression {
        column: String,
        #[source]
        source: ExprError,
    },

    #[error("Column {0} is already defined")]
    AlreadyDefined(String),

    #[error("Column {0} mixes scalar and vector values")]
    MixedColumn(String),

    #[error(transparent)]
    Table(#[from] TableError),
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Matrix is not invertible")]
    NotInvertible,

    #[error("No rows to fit or evaluate")]
    EmptyData,

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Model serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Manager holds no model")]
    NoModel,

    #[error("Invalid split fraction {0}: must lie in (0, 1)")]
    InvalidSplit(f64),

    #[error("Split of {rows} rows at {fraction} leaves an empty part")]
    EmptySplit {
        rows: usize,
        fraction: f64,
    },

    #[error("Unknown model kind: {0}")]
    UnknownModelKind(String),

    #[error("Unknown conversion strategy: {0}")]
    UnknownConversion(String),

    #[error("Model file must be a bare file name next to the manifest, got {0}")]
    InvalidModelFile(String),

    #[error("Manager file format {found} is not supported (expected {expected})")]
    IncompatibleVersion {
        found: u32,
        expected: u32,
    },

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Table(#[from] TableError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed manager file: {0}")]
    Json(#[from] serde_json::Error),
}
