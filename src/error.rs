use std::error::Error as StdError;
use thiserror::Error;

/// Benchmark errors.
///
/// Construction errors ([`UnsupportedArchitecture`](BenchError::UnsupportedArchitecture),
/// [`InvalidDepth`](BenchError::InvalidDepth),
/// [`DeviceUnavailable`](BenchError::DeviceUnavailable)) are returned before any training step
/// runs.
#[derive(Debug, Error)]
pub enum BenchError {
    /// The architecture name is not one of the supported networks.
    #[error("{0} network is not supported")]
    UnsupportedArchitecture(String),
    /// The residual network depth does not satisfy `(depth - 2) % 6 == 0`.
    #[error("resnet depth {depth} is invalid, (depth - 2) must be divisible by 6")]
    InvalidDepth {
        /// The requested depth.
        depth: usize,
    },
    /// No execution backend for the requested device.
    #[error("{0} is not available, only the host backend is compiled in")]
    DeviceUnavailable(String),
    /// An executor reported its input drained while the loop feeds it batches.
    ///
    /// Carried as the source of an [`ExecutionFailure`](BenchError::ExecutionFailure). For a
    /// self driving source the same condition ends the epoch instead.
    #[error("resource exhausted")]
    ResourceExhausted,
    /// An optimization step failed.
    #[error("execution failed at pass {pass}, iteration {iteration} ({samples} samples timed)")]
    ExecutionFailure {
        /// Completed epochs.
        pass: usize,
        /// Executed steps.
        iteration: usize,
        /// Samples in the timing window.
        samples: usize,
        /// The step or data source error.
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },
    /// Throughput is undefined for a zero length timing window.
    #[error("throughput is undefined for an elapsed time of {elapsed_secs} seconds")]
    DivisionUndefined {
        /// The measured elapsed time.
        elapsed_secs: f64,
    },
}

/// Errors returned by an [`Executor`](crate::bench::Executor) step.
#[derive(Debug, Error)]
pub enum StepError {
    /// The engine's internal reader is drained.
    #[error("resource exhausted")]
    ResourceExhausted,
    /// Any other failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
