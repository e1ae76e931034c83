//! The pipeline's error type.

use std::{fmt, io};

use crate::gpu::AllocError;

/// Pipeline stage that runs a neural network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Palm,
    Landmark,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Palm => "palm detection",
            Stage::Landmark => "landmark detection",
        })
    }
}

/// Errors returned by the pipeline.
#[derive(Debug)]
pub enum Error {
    /// A buffer could not be allocated. Fatal during construction.
    Allocation(AllocError),
    /// The inference backend of a stage failed. The pipeline state is left as it was.
    Inference {
        stage: Stage,
        source: anyhow::Error,
    },
    /// The configuration is invalid or does not match the models.
    Config(String),
    /// No usable GPU adapter or device.
    Device(String),
    /// An inference worker thread could not be started.
    Worker(io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Allocation(e) => write!(f, "{e}"),
            Error::Inference { stage, .. } => write!(f, "{stage} inference failed"),
            Error::Config(msg) => write!(f, "invalid configuration: {msg}"),
            Error::Device(msg) => write!(f, "GPU device error: {msg}"),
            Error::Worker(_) => f.write_str("failed to spawn inference worker"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Allocation(e) => Some(e),
            Error::Inference { source, .. } => Some(&**source),
            Error::Worker(e) => Some(e),
            Error::Config(_) | Error::Device(_) => None,
        }
    }
}

impl From<AllocError> for Error {
    fn from(e: AllocError) -> Self {
        Self::Allocation(e)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn inference_error_keeps_source() {
        let err = Error::Inference {
            stage: Stage::Landmark,
            source: anyhow::anyhow!("backend exploded"),
        };
        assert_eq!(err.to_string(), "landmark detection inference failed");
        assert_eq!(err.source().unwrap().to_string(), "backend exploded");
    }
}
