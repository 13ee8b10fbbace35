//! Error types for the chest X-ray experiment harness.

use thiserror::Error;

/// Main error type for the harness.
///
/// Dataset and configuration errors abort a run before any training happens,
/// metric errors are surfaced with the class and partition that caused them,
/// and sink errors are recovered by the caller.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata CSV could not be parsed
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Image decoding or processing error
    #[error("Image processing error: {0}")]
    Image(String),

    /// Metadata file or image root is absent
    #[error("Missing input: {0}")]
    ConfigurationMissing(String),

    /// Zero records survived filtering against the image index
    #[error("Empty dataset: {0}")]
    EmptyDataset(String),

    /// A partition is empty after splitting or resampling
    #[error("Empty split: {0}")]
    EmptySplit(String),

    /// A metric cannot be computed for the observed label distribution
    #[error("Metric undefined: {0}")]
    MetricUndefined(String),

    /// No checkpoint was ever written during the run
    #[error("No checkpoint found: {0}")]
    NoCheckpointFound(String),

    /// Metric sink cannot be reached
    #[error("Metric sink unavailable: {0}")]
    SinkUnavailable(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Model record could not be saved or loaded
    #[error("Record error: {0}")]
    Record(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Training error
    #[error("Training error: {0}")]
    Training(String),

    /// Invalid argument error
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::Image(err.to_string())
    }
}

impl From<burn::record::RecorderError> for Error {
    fn from(err: burn::record::RecorderError) -> Self {
        Error::Record(format!("{err:?}"))
    }
}

impl Error {
    /// Whether the error must abort the run before training starts.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Error::ConfigurationMissing(_)
                | Error::EmptyDataset(_)
                | Error::EmptySplit(_)
                | Error::Csv(_)
                | Error::Config(_)
        )
    }
}

/// Specialized Result type for harness operations.
pub type Result<T> = std::result::Result<T, Error>;
