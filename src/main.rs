use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use convbench::{
    bench::setup::Benchmark,
    config::BenchConfig,
    dataset::{cifar10::Cifar10, recordio::write_records},
    error::BenchError,
};
use log::{error, info, warn};
use num_format::{Locale, ToFormattedString};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Convolutional network training throughput benchmarks.")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Trains a network and reports throughput.
    Run(RunArgs),
    /// Writes the CIFAR-10 train split to a record file.
    Convert(ConvertArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Json config file, flags override its fields.
    #[arg(long)]
    config: Option<PathBuf>,
    /// "vgg", "resnet" or "resnet<depth>".
    #[arg(long)]
    architecture: Option<String>,
    #[arg(long)]
    use_accelerator: bool,
    /// Stream batches from the record file.
    #[arg(long)]
    use_reader: bool,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    max_epochs: Option<usize>,
    /// Iteration budget.
    #[arg(long)]
    iterations: Option<usize>,
    /// Iterations excluded from timing.
    #[arg(long)]
    warmup: Option<usize>,
    /// Passes over the record file.
    #[arg(long)]
    pass_num: Option<usize>,
    #[arg(long)]
    record_path: Option<PathBuf>,
    #[arg(long)]
    dataset_dir: Option<PathBuf>,
    /// Feed CIFAR-10 in order.
    #[arg(long)]
    no_shuffle: bool,
    #[arg(long)]
    learning_rate: Option<f32>,
    #[arg(long)]
    seed: Option<u64>,
    /// Print the summary as json.
    #[arg(long)]
    json: bool,
}

impl RunArgs {
    fn config(&self) -> Result<BenchConfig> {
        let mut config = if let Some(path) = self.config.as_ref() {
            BenchConfig::from_path(path)?
        } else {
            BenchConfig::default()
        };
        if let Some(architecture) = self.architecture.clone() {
            config.architecture = architecture;
        }
        config.use_accelerator |= self.use_accelerator;
        config.use_reader |= self.use_reader;
        if self.no_shuffle {
            config.shuffle = false;
        }
        macro_rules! set {
            ($($field:ident),*) => {
                $(
                    if let Some(value) = self.$field.clone() {
                        config.$field = value;
                    }
                )*
            };
        }
        set!(
            batch_size,
            max_epochs,
            iterations,
            warmup,
            pass_num,
            record_path,
            learning_rate
        );
        if self.dataset_dir.is_some() {
            config.dataset_dir = self.dataset_dir.clone();
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        Ok(config)
    }
}

#[derive(Args, Debug)]
struct ConvertArgs {
    /// The CIFAR-10 directory.
    #[arg(long)]
    dataset_dir: Option<PathBuf>,
    /// The record file to write.
    #[arg(long, default_value = "/tmp/cifar10_train.recordio")]
    output: PathBuf,
}

fn run(args: &RunArgs) -> Result<()> {
    let config = args.config()?;
    let mut benchmark = Benchmark::new(&config)?;
    let report = benchmark.run()?;
    info!(
        "{:?} after {} passes, {} iterations",
        report.termination, report.passes, report.iterations
    );
    match report.throughput() {
        Ok(summary) => {
            if args.json {
                println!("{}", serde_json::to_string(&summary)?);
            } else {
                println!("{summary}");
            }
        }
        Err(BenchError::DivisionUndefined { elapsed_secs }) => {
            warn!("timing window is empty, elapsed = {elapsed_secs}s");
            println!(
                "Throughput is undefined: no iterations after the {} warm up iterations",
                config.warmup
            );
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn convert(args: &ConvertArgs) -> Result<()> {
    let dataset = match args.dataset_dir.as_deref() {
        Some(path) => Cifar10::builder().path(path).build()?,
        None => Cifar10::builder().build()?,
    };
    let header = write_records(
        &args.output,
        dataset.train_images().view(),
        dataset.train_classes().view(),
    )?;
    info!(
        "wrote {} records of {:?} to {}",
        header.count.to_formatted_string(&Locale::en),
        header.image_shape,
        args.output.display()
    );
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let result = match &cli.command {
        Command::Run(args) => run(args),
        Command::Convert(args) => convert(args),
    };
    if let Err(e) = result.as_ref() {
        error!("{e:#}");
    }
    result
}
