// Error types shared by the trainer modules
use crate::trainers::buffer::BufferKey;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrainerError {
    /// Unsupported settings combination, raised while constructing a trainer.
    #[error("configuration conflict: {0}")]
    ConfigConflict(String),

    /// A loss became NaN or infinite in the middle of an update.
    #[error("numerical divergence: {loss} is {value}")]
    NumericalDivergence { loss: &'static str, value: f64 },

    #[error("mini-batch is missing column {0:?}")]
    MissingColumn(BufferKey),

    #[error("column {key:?} has inconsistent row width (expected {expected}, found {found})")]
    ColumnShape {
        key: BufferKey,
        expected: usize,
        found: usize,
    },

    #[error(transparent)]
    Torch(#[from] tch::TchError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Regex(#[from] regex::Error),
}

pub type Result<T> = std::result::Result<T, TrainerError>;
