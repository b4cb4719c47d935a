/*!
# convbench
Convolutional network training throughput benchmarks.

A [`Benchmark`](bench::setup::Benchmark) builds a VGG or residual network for CIFAR-10 sized
images and trains it with Adam for a fixed iteration budget, reporting examples per second over
the steps after a warm up.

Batches are either fed to each step from CIFAR-10 in memory ([`PullFeeder`](feed::PullFeeder)), or
read by the engine itself from a record file on a background thread
([`StreamingSource`](feed::StreamingSource)).

```no_run
# fn main() -> anyhow::Result<()> {
use convbench::{bench::setup::Benchmark, config::BenchConfig};

let config = BenchConfig {
    architecture: "resnet32".into(),
    ..BenchConfig::default()
};
let report = Benchmark::new(&config)?.run()?;
println!("{}", report.throughput()?);
# Ok(())
# }
```
*/
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Result type.
pub mod result {
    pub use anyhow::{Error, Result};
}

/// The benchmark loop.
pub mod bench;
/// Configuration.
pub mod config;
/// Datasets.
pub mod dataset;
/// Devices.
pub mod device;
/// The training engine.
pub mod engine;
/// Errors.
pub mod error;
/// Data sources.
pub mod feed;
/// Machine learning.
pub mod learn;
/// Throughput metrics.
pub mod metrics;
