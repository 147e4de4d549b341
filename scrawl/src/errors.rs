use std::error::Error;

use thiserror::Error;

use crate::image_input::ImageInputError;

/// The error type returned when running a machine learning model fails.
#[derive(Debug, Error)]
pub enum ModelRunError {
    /// Model execution failed.
    #[error("model run failed: {0}")]
    RunFailed(Box<dyn Error + Send + Sync>),

    /// The model output had a different data type or shape than expected.
    #[error("model output had unexpected type or shape: {0}")]
    WrongOutput(String),
}

/// Errors returned by the `predict_*` methods of [HtrEngine](crate::HtrEngine).
#[derive(Debug, Error)]
pub enum PredictError {
    /// The caller supplied an image that could not be read.
    #[error(transparent)]
    Input(#[from] ImageInputError),

    /// Preprocessing, inference or decoding failed.
    #[error(transparent)]
    Recognition(#[from] anyhow::Error),
}

impl PredictError {
    /// Return true if the error was caused by the request payload rather than
    /// the engine.
    pub fn is_client_error(&self) -> bool {
        match self {
            PredictError::Input(err) => err.is_client_error(),
            PredictError::Recognition(_) => false,
        }
    }
}
