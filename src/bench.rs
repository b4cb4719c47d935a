/*!
The benchmark loop.

[`BenchLoop`] is a state machine over [`Phase`]:

```text
Init -> Running -> (EpochBoundary <-> Running) -> Done(termination)
                  \-> Failed on a step or data source error
```

Each call to [`BenchLoop::transition()`] performs one transition. In `Running` that is one
optimization step: the loop asks the [`DataSource`] for the next feed, checks the iteration
budget, starts the [`TimingWindow`] when the iteration reaches the warm up, and executes the step.
*/
use crate::{
    dataset::Batch,
    error::{BenchError, StepError},
    feed::{DataSource, Feed},
    learn::neural_network::StepOutput,
    metrics::{self, ThroughputSummary},
};
use anyhow::anyhow;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::{
    error::Error as StdError,
    time::{Duration, Instant},
};

/// Benchmark setup.
pub mod setup;

/// Executes optimization steps.
pub trait Executor {
    /// Executes one step on `batch`, or on the executor's own input when `batch` is `None`.
    ///
    /// **Errors**
    /// - [`StepError::ResourceExhausted`] if the executor's own input is drained.
    /// - [`StepError::Other`] for any other failure.
    fn step(&mut self, batch: Option<Batch>) -> Result<StepOutput, StepError>;
}

/// How a run ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Termination {
    /// The iteration budget was reached.
    BudgetReached,
    /// The maximum number of epochs was reached.
    EpochsExhausted,
}

/// Phase of a [`BenchLoop`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    /// Not started.
    Init,
    /// Executing steps.
    Running,
    /// Between epochs.
    EpochBoundary,
    /// Finished.
    Done(Termination),
    /// Stopped by a step or data source failure.
    Failed,
}

/// Outcome of one step in the running phase.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Signal {
    /// The step was executed.
    Continue,
    /// The epoch has no more data.
    EpochExhausted,
    /// The iteration budget was reached before the step.
    BudgetReached,
}

/// Loop bounds.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Samples per step, counted for self driving sources.
    pub batch_size: usize,
    /// The maximum number of epochs.
    pub max_epochs: usize,
    /// The maximum number of iterations.
    pub budget: usize,
    /// The iteration the timing window starts at.
    pub warmup: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            batch_size: 128,
            max_epochs: 50,
            budget: 1050,
            warmup: 50,
        }
    }
}

/// The window over which throughput is measured.
///
/// Starts at most once, resetting the sample count.
#[derive(Clone, Copy, Debug, Default)]
pub struct TimingWindow {
    start: Option<Instant>,
    end: Option<Instant>,
    samples: usize,
}

impl TimingWindow {
    /// Starts the window at `now`. Ignored if already started.
    pub fn start(&mut self, now: Instant) {
        if self.start.is_none() {
            self.start.replace(now);
            self.samples = 0;
        }
    }
    /// Ends the window at `now`. Ignored if not started or already ended.
    pub fn end(&mut self, now: Instant) {
        if self.start.is_some() && self.end.is_none() {
            self.end.replace(now);
        }
    }
    /// Adds `samples`.
    pub fn add_samples(&mut self, samples: usize) {
        self.samples += samples;
    }
    /// Whether the window started.
    pub fn is_started(&self) -> bool {
        self.start.is_some()
    }
    /// The number of samples since the window started.
    pub fn samples(&self) -> usize {
        self.samples
    }
    /// The elapsed time.
    ///
    /// Zero if the window never started, the time until now if it has not ended.
    pub fn elapsed(&self) -> Duration {
        match (self.start, self.end) {
            (Some(start), Some(end)) => end.saturating_duration_since(start),
            (Some(start), None) => start.elapsed(),
            (None, _) => Duration::ZERO,
        }
    }
}

/// Counters of a run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Counters {
    /// Completed epochs.
    pub passes: usize,
    /// Executed steps.
    pub iterations: usize,
    /// Executed steps inside the timing window.
    pub timed_iterations: usize,
}

/// The result of a run.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct RunReport {
    /// How the run ended.
    pub termination: Termination,
    /// Completed epochs.
    pub passes: usize,
    /// Executed steps.
    pub iterations: usize,
    /// Executed steps inside the timing window.
    pub timed_iterations: usize,
    /// Samples counted by the timing window.
    pub samples: usize,
    /// Duration of the timing window.
    pub elapsed: Duration,
}

impl RunReport {
    /// Computes the throughput.
    ///
    /// **Errors**
    ///
    /// [`BenchError::DivisionUndefined`] if the timing window is empty.
    pub fn throughput(&self) -> Result<ThroughputSummary, BenchError> {
        metrics::report(self.samples, self.elapsed.as_secs_f64())
            .map(|summary| summary.with_iterations(self.timed_iterations))
    }
}

/// The benchmark loop.
pub struct BenchLoop<E, S> {
    executor: E,
    source: S,
    config: LoopConfig,
    phase: Phase,
    counters: Counters,
    window: TimingWindow,
}

impl<E: Executor, S: DataSource> BenchLoop<E, S> {
    /// Creates a loop in [`Phase::Init`].
    pub fn new(executor: E, source: S, config: LoopConfig) -> Self {
        Self {
            executor,
            source,
            config,
            phase: Phase::Init,
            counters: Counters::default(),
            window: TimingWindow::default(),
        }
    }
    /// The phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }
    /// The counters.
    pub fn counters(&self) -> Counters {
        self.counters
    }
    /// The timing window.
    pub fn window(&self) -> &TimingWindow {
        &self.window
    }
    /// The config.
    pub fn config(&self) -> &LoopConfig {
        &self.config
    }
    /// The executor.
    pub fn executor(&self) -> &E {
        &self.executor
    }
    /// The data source.
    pub fn source(&self) -> &S {
        &self.source
    }
    fn failure(&self, source: Box<dyn StdError + Send + Sync + 'static>) -> BenchError {
        BenchError::ExecutionFailure {
            pass: self.counters.passes,
            iteration: self.counters.iterations,
            samples: self.window.samples(),
            source,
        }
    }
    fn begin_epoch(&mut self) -> Result<(), BenchError> {
        debug!("begin pass {}", self.counters.passes);
        self.source
            .begin_epoch()
            .map_err(|e| self.failure(e.into()))
    }
    /// Runs one step of the running phase.
    fn run_step(&mut self) -> Result<Signal, BenchError> {
        let feed = match self.source.next_feed() {
            Ok(Some(feed)) => feed,
            Ok(None) => return Ok(Signal::EpochExhausted),
            Err(e) => return Err(self.failure(e.into())),
        };
        if self.counters.iterations == self.config.budget {
            return Ok(Signal::BudgetReached);
        }
        if self.counters.iterations == self.config.warmup {
            debug!("warm up done after {} iterations", self.counters.iterations);
            self.window.start(Instant::now());
        }
        let (batch, samples) = match feed {
            Feed::Batch(batch) => {
                let samples = batch.len();
                (Some(batch), samples)
            }
            Feed::Implicit => (None, self.config.batch_size),
        };
        match self.executor.step(batch) {
            Ok(_) => (),
            Err(StepError::ResourceExhausted) if self.source.is_self_driving() => {
                debug!(
                    "resource exhausted at pass {}, iteration {}",
                    self.counters.passes, self.counters.iterations
                );
                return Ok(Signal::EpochExhausted);
            }
            Err(StepError::ResourceExhausted) => {
                return Err(self.failure(Box::new(BenchError::ResourceExhausted)));
            }
            Err(e) => return Err(self.failure(e.into())),
        }
        self.counters.iterations += 1;
        if self.window.is_started() {
            self.counters.timed_iterations += 1;
        }
        self.window.add_samples(samples);
        info!(
            "Pass: {}, Iter: {}",
            self.counters.passes, self.counters.iterations
        );
        Ok(Signal::Continue)
    }
    /// Performs one transition, returning the new phase.
    ///
    /// Calling this in [`Phase::Done`] or [`Phase::Failed`] does nothing.
    ///
    /// **Errors**
    ///
    /// [`BenchError::ExecutionFailure`] if a step or the data source failed. The loop enters
    /// [`Phase::Failed`] and the timing window ends.
    pub fn transition(&mut self) -> Result<Phase, BenchError> {
        if matches!(self.phase, Phase::Done(_) | Phase::Failed) {
            return Ok(self.phase);
        }
        let next = match self.next_phase() {
            Ok(next) => next,
            Err(e) => {
                self.window.end(Instant::now());
                self.phase = Phase::Failed;
                debug!("failed after {:?}", self.counters);
                return Err(e);
            }
        };
        if let Phase::Done(termination) = next {
            self.window.end(Instant::now());
            debug!("done: {termination:?} after {:?}", self.counters);
        }
        self.phase = next;
        Ok(next)
    }
    fn next_phase(&mut self) -> Result<Phase, BenchError> {
        let next = match self.phase {
            Phase::Init => {
                self.counters = Counters::default();
                self.window = TimingWindow::default();
                self.begin_epoch()?;
                Phase::Running
            }
            Phase::Running => match self.run_step()? {
                Signal::Continue => Phase::Running,
                Signal::EpochExhausted => Phase::EpochBoundary,
                Signal::BudgetReached => Phase::Done(Termination::BudgetReached),
            },
            Phase::EpochBoundary => {
                self.counters.passes += 1;
                if self.counters.passes >= self.config.max_epochs {
                    Phase::Done(Termination::EpochsExhausted)
                } else if self.counters.iterations >= self.config.budget {
                    Phase::Done(Termination::BudgetReached)
                } else {
                    self.begin_epoch()?;
                    Phase::Running
                }
            }
            Phase::Done(_) | Phase::Failed => self.phase,
        };
        Ok(next)
    }
    /// Runs until [`Phase::Done`].
    ///
    /// **Errors**
    ///
    /// [`BenchError::ExecutionFailure`] if a step or the data source failed, or if the loop
    /// already failed. No further steps are executed after a failure.
    pub fn run(&mut self) -> Result<RunReport, BenchError> {
        loop {
            match self.transition()? {
                Phase::Done(termination) => return Ok(self.report(termination)),
                Phase::Failed => {
                    return Err(self.failure(anyhow!("The benchmark loop already failed!").into()))
                }
                _ => (),
            }
        }
    }
    fn report(&self, termination: Termination) -> RunReport {
        RunReport {
            termination,
            passes: self.counters.passes,
            iterations: self.counters.iterations,
            timed_iterations: self.counters.timed_iterations,
            samples: self.window.samples(),
            elapsed: self.window.elapsed(),
        }
    }
}
