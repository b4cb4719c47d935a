use anyhow::{anyhow, Result};
use convbench::{
    bench::{BenchLoop, Executor, LoopConfig, Phase, Termination},
    dataset::{recordio::write_records, Batch},
    device::Device,
    engine::{Engine, Input},
    error::{BenchError, StepError},
    feed::{ArrayBatches, PullFeeder, StreamingFeed, StreamingSource},
    learn::neural_network::{architecture::Architecture, optimizer::Adam, Classifier, StepOutput},
};
use ndarray::{Array1, Array4};
use rand::{rngs::StdRng, SeedableRng};

/// Counts steps, failing or exhausting at an iteration.
#[derive(Default)]
struct Counter {
    steps: usize,
    fail_at: Option<usize>,
    exhaust_at: Option<usize>,
}

impl Executor for Counter {
    fn step(&mut self, batch: Option<Batch>) -> Result<StepOutput, StepError> {
        if self.fail_at == Some(self.steps) {
            return Err(anyhow!("device lost").into());
        }
        if self.exhaust_at == Some(self.steps) {
            return Err(StepError::ResourceExhausted);
        }
        self.steps += 1;
        Ok(StepOutput {
            batch_size: batch.map_or(0, |x| x.len()),
            loss: 0.,
            accuracy: 0.,
        })
    }
}

fn batches(n: usize, batch_size: usize) -> Result<PullFeeder<ArrayBatches>> {
    let images = Array4::<u8>::zeros([n, 3, 4, 4]).into_shared();
    let classes = Array1::<u8>::zeros(n).into_shared();
    Ok(PullFeeder::new(ArrayBatches::new(images, classes, batch_size)?))
}

#[test]
fn one_epoch_of_two_batches() -> Result<()> {
    let config = LoopConfig {
        batch_size: 128,
        max_epochs: 1,
        budget: 2,
        warmup: 1,
    };
    let mut bench = BenchLoop::new(Counter::default(), batches(256, 128)?, config);
    let report = bench.run()?;
    assert_eq!(report.termination, Termination::EpochsExhausted);
    assert_eq!(report.iterations, 2);
    assert_eq!(report.samples, 128);
    assert_eq!(bench.phase(), Phase::Done(Termination::EpochsExhausted));
    let summary = report.throughput()?;
    assert_eq!(summary.iterations, 1);
    assert_eq!(summary.samples, 128);
    assert!(summary.examples_per_sec > 0.);
    Ok(())
}

#[test]
fn exhausted_stream_ends_the_epoch() -> Result<()> {
    let executor = Counter {
        exhaust_at: Some(10),
        ..Counter::default()
    };
    let config = LoopConfig {
        batch_size: 64,
        max_epochs: 2,
        budget: 1000,
        warmup: 0,
    };
    let mut bench = BenchLoop::new(executor, StreamingFeed::new(64), config);
    let report = bench.run()?;
    assert_eq!(report.termination, Termination::EpochsExhausted);
    assert_eq!(report.passes, 2);
    assert_eq!(report.iterations, 10);
    assert_eq!(report.samples, 10 * 64);
    Ok(())
}

#[test]
fn step_failure_is_fatal() -> Result<()> {
    let executor = Counter {
        fail_at: Some(3),
        ..Counter::default()
    };
    let config = LoopConfig {
        batch_size: 2,
        max_epochs: 5,
        budget: 100,
        warmup: 1,
    };
    let mut bench = BenchLoop::new(executor, batches(4, 2)?, config);
    match bench.run() {
        Err(BenchError::ExecutionFailure {
            pass,
            iteration,
            samples,
            source,
        }) => {
            assert_eq!((pass, iteration, samples), (1, 3, 4));
            assert_eq!(source.to_string(), "device lost");
        }
        result => panic!("{:?}", result.map(|x| x.termination)),
    }
    assert_eq!(bench.phase(), Phase::Failed);
    assert!(bench.run().is_err());
    assert_eq!(bench.executor().steps, 3);
    assert_eq!(bench.counters().passes, 1);
    Ok(())
}

#[test]
fn engine_reads_record_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("train.recordio");
    let images = Array4::<u8>::from_shape_fn([6, 3, 32, 32], |(n, c, h, w)| {
        (n * 31 + c * 7 + h * 3 + w) as u8
    });
    let classes = Array1::from(vec![0, 1, 2, 3, 4, 5]);
    write_records(&path, images.view(), classes.view())?;
    let mut rng = StdRng::seed_from_u64(7);
    let features = Architecture::Resnet { depth: 8 }.build([3, 32, 32], &mut rng)?;
    let classifier = Classifier::new(features, 10, &mut rng)?;
    let reader = StreamingSource::spawn(&path, 2, 1)?;
    assert_eq!(reader.header().count, 6);
    let engine = Engine::new(
        classifier,
        Adam::default(),
        0.001,
        Input::Reader(reader),
        Device::host(),
    )?;
    let config = LoopConfig {
        batch_size: 2,
        max_epochs: 2,
        budget: 100,
        warmup: 1,
    };
    let mut bench = BenchLoop::new(engine, StreamingFeed::new(2), config);
    let report = bench.run()?;
    assert_eq!(report.termination, Termination::EpochsExhausted);
    assert_eq!(report.passes, 2);
    assert_eq!(report.iterations, 3);
    assert_eq!(report.timed_iterations, 2);
    assert_eq!(report.samples, 4);
    Ok(())
}
