use super::{BenchLoop, RunReport};
use crate::{
    config::BenchConfig,
    dataset::cifar10::{self, Cifar10},
    device::Device,
    engine::{Engine, Input},
    error::BenchError,
    feed::{ArrayBatches, DataSource, Feed, PullFeeder, StreamingFeed, StreamingSource},
    learn::neural_network::{architecture::Architecture, optimizer::Adam, Classifier},
    result::Result,
};
use anyhow::ensure;
use log::{debug, info};
use num_format::{Locale, ToFormattedString};
use rand::{rngs::StdRng, Rng, SeedableRng};

/// The data source of a [`Benchmark`].
pub enum Source {
    /// CIFAR-10 batches fed to each step.
    Pull(PullFeeder<ArrayBatches>),
    /// Batches read by the engine.
    Streaming(StreamingFeed),
}

impl DataSource for Source {
    fn begin_epoch(&mut self) -> Result<()> {
        match self {
            Self::Pull(source) => source.begin_epoch(),
            Self::Streaming(source) => source.begin_epoch(),
        }
    }
    fn next_feed(&mut self) -> Result<Option<Feed>> {
        match self {
            Self::Pull(source) => source.next_feed(),
            Self::Streaming(source) => source.next_feed(),
        }
    }
    fn is_self_driving(&self) -> bool {
        match self {
            Self::Pull(source) => source.is_self_driving(),
            Self::Streaming(source) => source.is_self_driving(),
        }
    }
    fn batch_size(&self) -> usize {
        match self {
            Self::Pull(source) => source.batch_size(),
            Self::Streaming(source) => source.batch_size(),
        }
    }
}

/// A constructed benchmark, ready to run.
pub struct Benchmark {
    architecture: Architecture,
    bench: BenchLoop<Engine, Source>,
}

impl Benchmark {
    /// Constructs the network, engine and data source for `config`.
    ///
    /// **Errors**
    /// - [`BenchError::UnsupportedArchitecture`] for an unknown architecture name.
    /// - The config is invalid.
    /// - [`BenchError::DeviceUnavailable`] when an accelerator is requested.
    /// - [`BenchError::InvalidDepth`] for an invalid residual depth.
    /// - The dataset or record file could not be loaded, or its image shape does not match.
    pub fn new(config: &BenchConfig) -> Result<Self> {
        let architecture: Architecture = config.architecture.parse()?;
        config.validate()?;
        let device = Device::select(config.use_accelerator);
        device.ensure_available()?;
        architecture.validate()?;
        let seed = config.seed.unwrap_or_else(|| rand::thread_rng().gen());
        debug!("seed = {seed}");
        let mut rng = StdRng::seed_from_u64(seed);
        info!("Batch size is {}", config.batch_size);
        let (input, source) = if config.use_reader {
            info!("use reader op from {}", config.record_path.display());
            let reader =
                StreamingSource::spawn(&config.record_path, config.batch_size, config.pass_num)?;
            ensure!(
                reader.header().image_shape == config.input_shape,
                "Record file images {:?} do not match input_shape {:?}!",
                reader.header().image_shape,
                config.input_shape
            );
            (
                Input::Reader(reader),
                Source::Streaming(StreamingFeed::new(config.batch_size)),
            )
        } else {
            ensure!(
                config.input_shape == cifar10::IMAGE_SHAPE,
                "CIFAR-10 images are {:?}, found input_shape {:?}!",
                cifar10::IMAGE_SHAPE,
                config.input_shape
            );
            let dataset = match config.dataset_dir.as_deref() {
                Some(path) => Cifar10::builder().path(path).build()?,
                None => Cifar10::builder().build()?,
            };
            info!(
                "loaded {} training images from {}",
                dataset
                    .train_classes()
                    .len()
                    .to_formatted_string(&Locale::en),
                dataset.path().display()
            );
            let mut batches = dataset.train_batches(config.batch_size)?;
            if config.shuffle {
                batches = batches.shuffled(rng.gen());
            }
            (Input::Feed, Source::Pull(PullFeeder::new(batches)))
        };
        info!("train {architecture} net");
        let features = architecture.build(config.input_shape, &mut rng)?;
        let classifier = Classifier::new(features, config.num_classes, &mut rng)?;
        let engine = Engine::new(
            classifier,
            Adam::default(),
            config.learning_rate,
            input,
            device,
        )?;
        info!("start");
        Ok(Self {
            architecture,
            bench: BenchLoop::new(engine, source, config.loop_config()),
        })
    }
    /// The architecture.
    pub fn architecture(&self) -> Architecture {
        self.architecture
    }
    /// The loop.
    pub fn bench_loop(&self) -> &BenchLoop<Engine, Source> {
        &self.bench
    }
    /// Runs the loop to completion.
    ///
    /// **Errors**
    ///
    /// [`BenchError::ExecutionFailure`] if a step failed.
    pub fn run(&mut self) -> Result<RunReport, BenchError> {
        self.bench.run()
    }
}
