use crate::{bench::LoopConfig, result::Result};
use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Benchmark parameters.
///
/// Missing fields take their defaults when deserialized.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BenchConfig {
    /// `"vgg"`, `"resnet"` or `"resnet<depth>"`.
    pub architecture: String,
    /// Run on an accelerator.
    pub use_accelerator: bool,
    /// Stream batches from `record_path` instead of feeding CIFAR-10.
    pub use_reader: bool,
    /// Examples per step.
    pub batch_size: usize,
    /// Image shape, \[channels, height, width\].
    pub input_shape: [usize; 3],
    /// The number of classes.
    pub num_classes: usize,
    /// The maximum number of epochs.
    pub max_epochs: usize,
    /// The iteration budget.
    pub iterations: usize,
    /// Iterations excluded from timing.
    pub warmup: usize,
    /// Passes over the record file.
    pub pass_num: usize,
    /// The record file read when `use_reader` is set.
    pub record_path: PathBuf,
    /// The CIFAR-10 directory, defaults to "cifar10" in the downloads directory.
    pub dataset_dir: Option<PathBuf>,
    /// Shuffle the CIFAR-10 train split each epoch.
    pub shuffle: bool,
    /// Adam learning rate.
    pub learning_rate: f32,
    /// Seed for initialization, shuffling and dropout. Random if not set.
    pub seed: Option<u64>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            architecture: "vgg".into(),
            use_accelerator: false,
            use_reader: false,
            batch_size: 128,
            input_shape: [3, 32, 32],
            num_classes: 10,
            max_epochs: 50,
            iterations: 1050,
            warmup: 50,
            pass_num: 50,
            record_path: PathBuf::from("/tmp/cifar10_train.recordio"),
            dataset_dir: None,
            shuffle: true,
            learning_rate: 0.001,
            seed: None,
        }
    }
}

impl BenchConfig {
    /// Loads a config from a json file.
    ///
    /// **Errors**
    /// - The file could not be read.
    /// - The json is invalid or has unknown fields.
    pub fn from_path(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path).with_context(|| format!("Failed to read {path:?}!"))?;
        serde_json::from_str(&json).with_context(|| format!("Invalid config {path:?}!"))
    }
    /// Checks the numeric parameters.
    ///
    /// **Errors**
    ///
    /// A size, count or the learning rate is not positive.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.batch_size > 0, "batch_size must be positive!");
        ensure!(self.max_epochs > 0, "max_epochs must be positive!");
        ensure!(
            self.input_shape.iter().all(|x| *x > 0),
            "input_shape {:?} must be positive!",
            self.input_shape
        );
        ensure!(
            (1..=256).contains(&self.num_classes),
            "num_classes must be in 1..=256, found {}!",
            self.num_classes
        );
        ensure!(
            self.learning_rate.is_finite() && self.learning_rate > 0.,
            "learning_rate must be positive, found {}!",
            self.learning_rate
        );
        if self.use_reader {
            ensure!(self.pass_num > 0, "pass_num must be positive!");
        }
        Ok(())
    }
    /// The loop bounds.
    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            batch_size: self.batch_size,
            max_epochs: self.max_epochs,
            budget: self.iterations,
            warmup: self.warmup,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = BenchConfig::default();
        config.validate().unwrap();
        assert_eq!(
            config.loop_config(),
            LoopConfig {
                batch_size: 128,
                max_epochs: 50,
                budget: 1050,
                warmup: 50,
            }
        );
        assert_eq!(config.record_path, Path::new("/tmp/cifar10_train.recordio"));
    }

    #[test]
    fn validate() {
        let invalid = [
            BenchConfig {
                batch_size: 0,
                ..BenchConfig::default()
            },
            BenchConfig {
                max_epochs: 0,
                ..BenchConfig::default()
            },
            BenchConfig {
                learning_rate: 0.,
                ..BenchConfig::default()
            },
            BenchConfig {
                learning_rate: f32::NAN,
                ..BenchConfig::default()
            },
            BenchConfig {
                use_reader: true,
                pass_num: 0,
                ..BenchConfig::default()
            },
        ];
        for config in invalid {
            assert!(config.validate().is_err(), "{config:?}");
        }
    }

    #[test]
    fn from_json() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{ "architecture": "resnet20", "use_reader": true, "iterations": 10, "seed": 3 }"#,
        )?;
        let config = BenchConfig::from_path(&path)?;
        assert_eq!(config.architecture, "resnet20");
        assert!(config.use_reader);
        assert_eq!(config.iterations, 10);
        assert_eq!(config.seed, Some(3));
        assert_eq!(config.batch_size, 128);
        fs::write(&path, r#"{ "batch": 3 }"#)?;
        assert!(BenchConfig::from_path(&path).is_err());
        Ok(())
    }
}
