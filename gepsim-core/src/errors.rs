use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Can't read file: {0}")]
    FileReadError(String),

    #[error("Error parsing {path} at line {line}: {message}")]
    ParseError {
        path: String,
        line: usize,
        message: String,
    },

    #[error("Duplicate identifier found: {0}")]
    DuplicateId(String),

    #[error("Empty table. 0 rows found in: {0}")]
    EmptyTable(String),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Identifier not found: {0}")]
    UnknownId(String),

    #[error("Cell type not present in the single-cell pool: {0}")]
    UnknownCellType(String),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DataError>;
