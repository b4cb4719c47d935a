/*!
Data sources for the benchmark loop.

A [`DataSource`] hands the loop one [`Feed`] per step. There are two strategies:

- [`PullFeeder`] draws finite epochs of [`Batch`]'s from a restartable [`BatchProducer`] and
  signals the end of an epoch with `None`.
- [`StreamingSource`] reads a record file on a background thread and prefetches batches through
  a bounded channel. It is owned by the execution engine, which pulls from it inside the step. The
  loop side adapter [`StreamingFeed`] always yields [`Feed::Implicit`], and exhaustion surfaces as
  [`StepError::ResourceExhausted`](crate::error::StepError::ResourceExhausted).
*/
use crate::{
    dataset::{
        recordio::{Header, RecordReader},
        scale_pixel, Batch,
    },
    result::Result,
};
use anyhow::{anyhow, ensure};
use crossbeam_channel::{Receiver, Sender};
use log::{debug, warn};
use ndarray::{ArcArray, ArcArray1, Array, Axis, Ix4};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use std::{
    path::{Path, PathBuf},
    thread::JoinHandle,
};

/// Capacity of the prefetch channel.
pub const PREFETCH_CAPACITY: usize = 2;

/// The input for one step.
#[derive(Debug)]
pub enum Feed {
    /// A batch passed to the step.
    Batch(Batch),
    /// The step reads its own input.
    Implicit,
}

/// A source of feeds for the benchmark loop.
pub trait DataSource {
    /// Starts a pass over the data.
    fn begin_epoch(&mut self) -> Result<()>;
    /// The next feed, or `None` when the epoch is exhausted.
    fn next_feed(&mut self) -> Result<Option<Feed>>;
    /// Whether the executor consumes the data itself.
    ///
    /// Self driving sources yield [`Feed::Implicit`] and signal exhaustion through the step.
    fn is_self_driving(&self) -> bool;
    /// The configured batch size.
    fn batch_size(&self) -> usize;
}

/// A restartable producer of batches.
pub trait BatchProducer {
    /// Iterator over the batches of one epoch.
    type Epoch: Iterator<Item = Result<Batch>>;
    /// Returns a fresh iterator over one epoch.
    fn epoch(&mut self) -> Self::Epoch;
    /// The maximum batch size.
    fn batch_size(&self) -> usize;
}

/// Batches of in memory `u8` images.
///
/// Each epoch visits every example once, optionally in a shuffled order. The last batch of an
/// epoch may be shorter than the batch size.
#[derive(Clone)]
pub struct ArrayBatches {
    images: ArcArray<u8, Ix4>,
    classes: ArcArray1<u8>,
    batch_size: usize,
    rng: Option<StdRng>,
}

impl ArrayBatches {
    /// Creates batches of `images` and `classes`.
    ///
    /// **Errors**
    /// - `batch_size` is 0.
    /// - The number of images and classes differ.
    pub fn new(
        images: ArcArray<u8, Ix4>,
        classes: ArcArray1<u8>,
        batch_size: usize,
    ) -> Result<Self> {
        ensure!(batch_size > 0, "batch_size must be positive!");
        ensure!(
            images.shape()[0] == classes.len(),
            "Expected {} classes, found {}!",
            images.shape()[0],
            classes.len()
        );
        Ok(Self {
            images,
            classes,
            batch_size,
            rng: None,
        })
    }
    /// Shuffles each epoch with an rng seeded by `seed`.
    pub fn shuffled(self, seed: u64) -> Self {
        Self {
            rng: Some(StdRng::seed_from_u64(seed)),
            ..self
        }
    }
    /// The number of examples.
    pub fn len(&self) -> usize {
        self.classes.len()
    }
    /// Whether there are no examples.
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

impl BatchProducer for ArrayBatches {
    type Epoch = ArrayBatchesEpoch;
    fn epoch(&mut self) -> Self::Epoch {
        let mut indices: Vec<usize> = (0..self.len()).collect();
        if let Some(rng) = self.rng.as_mut() {
            indices.shuffle(rng);
        }
        ArrayBatchesEpoch {
            images: self.images.clone(),
            classes: self.classes.clone(),
            indices,
            batch_size: self.batch_size,
            offset: 0,
        }
    }
    fn batch_size(&self) -> usize {
        self.batch_size
    }
}

/// One epoch of [`ArrayBatches`].
pub struct ArrayBatchesEpoch {
    images: ArcArray<u8, Ix4>,
    classes: ArcArray1<u8>,
    indices: Vec<usize>,
    batch_size: usize,
    offset: usize,
}

impl Iterator for ArrayBatchesEpoch {
    type Item = Result<Batch>;
    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.indices.len() {
            return None;
        }
        let end = (self.offset + self.batch_size).min(self.indices.len());
        let indices = &self.indices[self.offset..end];
        self.offset = end;
        let images = self.images.select(Axis(0), indices).mapv(scale_pixel);
        let classes = self.classes.select(Axis(0), indices);
        Some(Batch::new(images, classes))
    }
    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.indices.len() - self.offset;
        let batches = (remaining + self.batch_size - 1) / self.batch_size;
        (batches, Some(batches))
    }
}

/// Pull based [`DataSource`].
pub struct PullFeeder<P: BatchProducer> {
    producer: P,
    epoch: Option<P::Epoch>,
}

impl<P: BatchProducer> PullFeeder<P> {
    /// Creates a feeder over `producer`.
    pub fn new(producer: P) -> Self {
        Self {
            producer,
            epoch: None,
        }
    }
    /// The producer.
    pub fn producer(&self) -> &P {
        &self.producer
    }
}

impl<P: BatchProducer> DataSource for PullFeeder<P> {
    fn begin_epoch(&mut self) -> Result<()> {
        self.epoch.replace(self.producer.epoch());
        Ok(())
    }
    fn next_feed(&mut self) -> Result<Option<Feed>> {
        let epoch = self
            .epoch
            .as_mut()
            .ok_or_else(|| anyhow!("PullFeeder.next_feed() called before begin_epoch()!"))?;
        match epoch.next() {
            Some(batch) => Ok(Some(Feed::Batch(batch?))),
            None => {
                self.epoch = None;
                Ok(None)
            }
        }
    }
    fn is_self_driving(&self) -> bool {
        false
    }
    fn batch_size(&self) -> usize {
        self.producer.batch_size()
    }
}

/// Loop side adapter for a [`StreamingSource`] owned by the executor.
#[derive(Clone, Copy, Debug)]
pub struct StreamingFeed {
    batch_size: usize,
}

impl StreamingFeed {
    /// Creates a feed for batches of `batch_size`.
    pub fn new(batch_size: usize) -> Self {
        Self { batch_size }
    }
}

impl DataSource for StreamingFeed {
    fn begin_epoch(&mut self) -> Result<()> {
        Ok(())
    }
    fn next_feed(&mut self) -> Result<Option<Feed>> {
        Ok(Some(Feed::Implicit))
    }
    fn is_self_driving(&self) -> bool {
        true
    }
    fn batch_size(&self) -> usize {
        self.batch_size
    }
}

/// Prefetching reader of a record file.
///
/// A background thread reads the file `passes` times and sends batches of exactly `batch_size`
/// records over a bounded channel, in file order. Batches span pass boundaries and only the
/// final partial batch of the stream is dropped. Read errors are sent in order and end the stream.
pub struct StreamingSource {
    path: PathBuf,
    header: Header,
    batch_size: usize,
    passes: usize,
    receiver: Receiver<Result<Batch>>,
    handle: Option<JoinHandle<()>>,
}

impl StreamingSource {
    /// Opens the record file at `path` and starts the reader thread.
    ///
    /// **Errors**
    /// - `batch_size` is 0.
    /// - The file could not be opened or has an invalid header.
    /// - The thread could not be spawned.
    pub fn spawn(path: &Path, batch_size: usize, passes: usize) -> Result<Self> {
        ensure!(batch_size > 0, "batch_size must be positive!");
        let reader = RecordReader::open(path)?;
        let header = *reader.header();
        if header.count.saturating_mul(passes as u64) < batch_size as u64 {
            warn!(
                "{path:?} has {} records, less than a batch of {batch_size} in {passes} passes",
                header.count
            );
        }
        let (sender, receiver) = crossbeam_channel::bounded(PREFETCH_CAPACITY);
        let producer = RecordProducer {
            reader,
            batch_size,
            passes,
            sender,
        };
        let handle = std::thread::Builder::new()
            .name("convbench::record-reader".into())
            .spawn(move || producer.run())?;
        debug!("streaming {path:?}: {header:?}, batch_size {batch_size}, {passes} passes");
        Ok(Self {
            path: path.to_owned(),
            header,
            batch_size,
            passes,
            receiver,
            handle: Some(handle),
        })
    }
    /// The path of the record file.
    pub fn path(&self) -> &Path {
        &self.path
    }
    /// The header of the record file.
    pub fn header(&self) -> &Header {
        &self.header
    }
    /// The batch size.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
    /// The number of passes over the file.
    pub fn passes(&self) -> usize {
        self.passes
    }
    /// Waits for the next batch.
    ///
    /// Returns `None` once the stream is drained, and on every call after.
    ///
    /// **Errors**
    ///
    /// Reading the file failed.
    pub fn next_batch(&mut self) -> Result<Option<Batch>> {
        match self.receiver.recv() {
            Ok(batch) => batch.map(Some),
            Err(_) => Ok(None),
        }
    }
}

impl Drop for StreamingSource {
    fn drop(&mut self) {
        // disconnect so a blocked send returns
        let receiver = std::mem::replace(&mut self.receiver, crossbeam_channel::never());
        drop(receiver);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("record reader thread panicked");
            }
        }
    }
}

struct RecordProducer {
    reader: RecordReader,
    batch_size: usize,
    passes: usize,
    sender: Sender<Result<Batch>>,
}

impl RecordProducer {
    fn run(mut self) {
        if let Err(e) = self.produce() {
            // the receiver may be gone
            let _ = self.sender.send(Err(e));
        }
    }
    /// Returns Ok when done or when the receiver disconnected.
    fn produce(&mut self) -> Result<()> {
        let header = *self.reader.header();
        let [c, h, w] = header.image_shape;
        let pixels = header.pixels();
        let mut images = Vec::with_capacity(self.batch_size * pixels);
        let mut classes = Vec::with_capacity(self.batch_size);
        let mut buffer = vec![0; pixels];
        for pass in 0..self.passes {
            if pass > 0 {
                self.reader = RecordReader::open(self.reader.path())?;
                ensure!(
                    *self.reader.header() == header,
                    "{:?} changed between passes!",
                    self.reader.path()
                );
            }
            while let Some(class) = self.reader.read_record(&mut buffer)? {
                classes.push(class);
                images.extend(buffer.iter().copied().map(scale_pixel));
                if classes.len() == self.batch_size {
                    let n = classes.len();
                    let batch_images = Array::from_shape_vec([n, c, h, w], images.split_off(0))?;
                    let batch_classes = Array::from(classes.split_off(0));
                    let batch = Batch::new(batch_images, batch_classes)?;
                    if self.sender.send(Ok(batch)).is_err() {
                        return Ok(());
                    }
                }
            }
        }
        if !classes.is_empty() {
            debug!("dropped a partial batch of {} records", classes.len());
        }
        Ok(())
    }
}
