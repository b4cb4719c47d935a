use crate::error::BenchError;
use serde::Serialize;
use std::fmt::{self, Display};

/// Throughput of a timed run.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ThroughputSummary {
    /// The number of timed iterations.
    pub iterations: usize,
    /// The number of examples processed in the timing window.
    pub samples: usize,
    /// Wall clock seconds of the timing window.
    pub elapsed_secs: f64,
    /// `samples / elapsed_secs`.
    pub examples_per_sec: f64,
}

impl ThroughputSummary {
    /// Sets the number of timed iterations.
    pub fn with_iterations(self, iterations: usize) -> Self {
        Self { iterations, ..self }
    }
}

impl Display for ThroughputSummary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "{} iterations takes {} seconds wall clock time",
            self.iterations, self.elapsed_secs
        )?;
        write!(
            f,
            "Total examples: {}; Throughput: {:.5} examples per sec",
            self.samples, self.examples_per_sec
        )
    }
}

/// Computes the throughput of `samples` examples in `elapsed_secs`.
///
/// **Errors**
///
/// [`BenchError::DivisionUndefined`] if `elapsed_secs` is not positive and finite.
pub fn report(samples: usize, elapsed_secs: f64) -> Result<ThroughputSummary, BenchError> {
    if !(elapsed_secs.is_finite() && elapsed_secs > 0.) {
        return Err(BenchError::DivisionUndefined { elapsed_secs });
    }
    Ok(ThroughputSummary {
        iterations: 0,
        samples,
        elapsed_secs,
        examples_per_sec: samples as f64 / elapsed_secs,
    })
}
