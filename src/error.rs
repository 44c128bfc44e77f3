//! Hadron Flow error abstractions.

use thiserror::Error;

/// Application error variants.
#[derive(Debug, Error)]
pub enum AppError {
    /// The given configuration is invalid and the component can not be constructed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The named plugin has not been registered.
    #[error("no plugin registered under the name `{0}`")]
    UnknownPlugin(String),
    /// The named pipeline is not known to the engine.
    #[error("no pipeline named `{0}` is known to this engine")]
    UnknownPipeline(String),
    /// The task pool has been shut down and no longer accepts work.
    #[error("the {0} task pool has been shut down")]
    PoolClosed(&'static str),
}

/// The error type used to indicate that a pipeline must be shut down.
///
/// Processor and sink failures are wrapped in this type as they propagate out of a worker.
#[derive(Debug, Error)]
#[error("fatal pipeline error in `{pipeline}`: {source}")]
pub struct ShutdownError {
    /// The name of the failed pipeline.
    pub pipeline: String,
    /// The underlying failure.
    #[source]
    pub source: anyhow::Error,
}

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;
