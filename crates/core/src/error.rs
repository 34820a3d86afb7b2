use thiserror::Error;

/// Errors reported by the dispatch core.
///
/// Shape and routing problems are detected before any kernel is launched.
/// Backend failures are passed through as [`DispatchError::Backend`] and are
/// never retried.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("routing inconsistency: {0}")]
    RoutingInconsistency(String),

    #[error("corrupt tuning data: {0}")]
    CorruptTuningData(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend error: {0}")]
    Backend(#[from] candle_core::Error),

    #[error("invalid tuning parameters: {0}")]
    Config(#[from] crate::tuning::SeqParseError),
}

impl DispatchError {
    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        Self::ShapeMismatch(msg.into())
    }

    pub(crate) fn routing(msg: impl Into<String>) -> Self {
        Self::RoutingInconsistency(msg.into())
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Self::CorruptTuningData(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
