use crate::{
    bench::Executor,
    dataset::Batch,
    device::Device,
    error::StepError,
    feed::StreamingSource,
    learn::neural_network::{optimizer::Adam, Classifier, StepOutput},
    result::Result,
};
use anyhow::{anyhow, ensure};
use log::debug;
use num_format::{Locale, ToFormattedString};

/// Where the engine gets its batches.
pub enum Input {
    /// Batches are passed to [`Executor::step()`].
    Feed,
    /// Batches are read from a [`StreamingSource`] owned by the engine.
    Reader(StreamingSource),
}

impl Input {
    /// Whether the engine reads its own batches.
    pub fn is_reader(&self) -> bool {
        matches!(self, Self::Reader(_))
    }
}

/// Host training engine.
///
/// Each step trains the classifier on one batch with Adam.
pub struct Engine {
    classifier: Classifier,
    optimizer: Adam,
    learning_rate: f32,
    input: Input,
    device: Device,
}

impl Engine {
    /// Creates an engine.
    ///
    /// **Errors**
    /// - `learning_rate` is not positive and finite.
    /// - The device is not the host.
    pub fn new(
        classifier: Classifier,
        optimizer: Adam,
        learning_rate: f32,
        input: Input,
        device: Device,
    ) -> Result<Self> {
        ensure!(
            learning_rate.is_finite() && learning_rate > 0.,
            "learning_rate must be positive, found {learning_rate}!"
        );
        device.ensure_available()?;
        debug!(
            "engine on {device}: {} parameters, reader = {}",
            classifier.parameter_count().to_formatted_string(&Locale::en),
            input.is_reader()
        );
        Ok(Self {
            classifier,
            optimizer,
            learning_rate,
            input,
            device,
        })
    }
    /// The classifier.
    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }
    /// The device.
    pub fn device(&self) -> Device {
        self.device
    }
    /// The input.
    pub fn input(&self) -> &Input {
        &self.input
    }
}

impl Executor for Engine {
    fn step(&mut self, batch: Option<Batch>) -> Result<StepOutput, StepError> {
        let batch = match (&mut self.input, batch) {
            (Input::Feed, Some(batch)) => batch,
            (Input::Reader(reader), None) => {
                reader.next_batch()?.ok_or(StepError::ResourceExhausted)?
            }
            (Input::Feed, None) => {
                return Err(anyhow!("Expected a batch to be fed!").into());
            }
            (Input::Reader(_), Some(_)) => {
                return Err(anyhow!("Unexpected batch fed to an engine with a reader!").into());
            }
        };
        let Batch { images, classes } = batch;
        let output = self.classifier.train_step(
            images,
            classes.view(),
            &self.optimizer,
            self.learning_rate,
        )?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dataset::recordio::write_records, learn::neural_network::architecture::Architecture,
    };
    use ndarray::{Array1, Array4};
    use rand::{rngs::StdRng, SeedableRng};

    fn classifier() -> Classifier {
        let mut rng = StdRng::seed_from_u64(0);
        let features = Architecture::Resnet { depth: 8 }
            .build([3, 32, 32], &mut rng)
            .unwrap();
        Classifier::new(features, 10, &mut rng).unwrap()
    }

    fn batch(n: usize) -> Batch {
        Batch::new(Array4::zeros([n, 3, 32, 32]), Array1::zeros(n)).unwrap()
    }

    #[test]
    fn feed_step() {
        let mut engine =
            Engine::new(classifier(), Adam::default(), 0.001, Input::Feed, Device::host()).unwrap();
        let output = engine.step(Some(batch(2))).unwrap();
        assert_eq!(output.batch_size, 2);
        assert!(output.loss.is_finite());
        assert!(matches!(engine.step(None), Err(StepError::Other(_))));
    }

    #[test]
    fn reader_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.recordio");
        let images = Array4::<u8>::zeros([3, 3, 32, 32]);
        write_records(&path, images.view(), Array1::zeros(3).view()).unwrap();
        let reader = StreamingSource::spawn(&path, 2, 1).unwrap();
        let mut engine = Engine::new(
            classifier(),
            Adam::default(),
            0.001,
            Input::Reader(reader),
            Device::host(),
        )
        .unwrap();
        assert!(matches!(engine.step(Some(batch(2))), Err(StepError::Other(_))));
        assert_eq!(engine.step(None).unwrap().batch_size, 2);
        assert!(matches!(engine.step(None), Err(StepError::ResourceExhausted)));
        assert!(matches!(engine.step(None), Err(StepError::ResourceExhausted)));
    }

    #[test]
    fn rejects_accelerator() {
        let result = Engine::new(
            classifier(),
            Adam::default(),
            0.001,
            Input::Feed,
            Device::accelerator(0),
        );
        assert!(result.is_err());
    }
}
