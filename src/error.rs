use crate::board::BoardError;
use crate::camera::IntrinsicsError;

/// Fatal pipeline errors.
///
/// Per-image and per-pair problems (too few detected corners, too little
/// overlap) are not errors; they are reported as [`crate::accumulator::PairOutcome`]
/// values and only shrink the dataset.
#[derive(thiserror::Error, Debug)]
pub enum CalibrationError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    #[error("Not enough valid image pairs for calibration: {found} valid pairs found, {required} required")]
    InsufficientData { found: usize, required: usize },
    #[error("Stereo calibration failed: {0}")]
    CalibrationFailed(String),
    #[error("Missing resource: {0}")]
    MissingResource(String),
    #[error("Number of images in both cameras do not match: {left} vs {right}")]
    InputMismatch { left: usize, right: usize },
    #[error("IO Error: {0}")]
    Io(String),
    #[error("Failed to parse YAML: {0}")]
    Yaml(String),
}

impl From<BoardError> for CalibrationError {
    fn from(err: BoardError) -> Self {
        CalibrationError::Configuration(err.to_string())
    }
}

impl From<IntrinsicsError> for CalibrationError {
    fn from(err: IntrinsicsError) -> Self {
        CalibrationError::Configuration(err.to_string())
    }
}

impl From<std::io::Error> for CalibrationError {
    fn from(err: std::io::Error) -> Self {
        CalibrationError::Io(err.to_string())
    }
}

impl From<serde_yaml::Error> for CalibrationError {
    fn from(err: serde_yaml::Error) -> Self {
        CalibrationError::Yaml(err.to_string())
    }
}

impl From<yaml_rust::ScanError> for CalibrationError {
    fn from(err: yaml_rust::ScanError) -> Self {
        CalibrationError::Yaml(err.to_string())
    }
}

impl From<serde_json::Error> for CalibrationError {
    fn from(err: serde_json::Error) -> Self {
        CalibrationError::Io(err.to_string())
    }
}

impl From<csv::Error> for CalibrationError {
    fn from(err: csv::Error) -> Self {
        CalibrationError::Io(err.to_string())
    }
}
