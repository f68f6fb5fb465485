use gepsim_core::DataError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimulationError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Missing reference: {0}")]
    MissingReference(String),

    #[error("Partial output is inconsistent: {0}")]
    CorruptState(String),

    #[error(
        "Low yield: {accepted} of {target} samples accepted and the filter threshold {threshold} cannot be relaxed further"
    )]
    LowYield {
        accepted: usize,
        target: usize,
        threshold: f64,
    },

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub type Result<T> = std::result::Result<T, SimulationError>;
