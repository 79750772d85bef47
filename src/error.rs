//! Error types for Glyco Flux

use thiserror::Error;

/// Errors that can occur during computation
#[derive(Debug, Error)]
pub enum ComputeError {
    /// A required column is absent from the input, or a row cannot be read
    #[error("Data format error: {0}")]
    DataFormat(String),

    /// An invalid pipeline parameter, detected before any data is processed
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A stage produced an empty table where the next stage needs rows
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl ComputeError {
    /// Stable machine-readable code, used in batch reports and CLI output
    pub fn kind(&self) -> &'static str {
        match self {
            ComputeError::DataFormat(_) => "DATA_FORMAT_ERROR",
            ComputeError::Configuration(_) => "CONFIGURATION_ERROR",
            ComputeError::InsufficientData(_) => "INSUFFICIENT_DATA_ERROR",
            ComputeError::Io(_) => "IO_ERROR",
            ComputeError::Csv(_) => "CSV_ERROR",
            ComputeError::Json(_) => "JSON_ERROR",
        }
    }
}
