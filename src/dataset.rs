use crate::result::Result;
use anyhow::ensure;
use ndarray::{Array1, Array4, ArrayView1, ArrayView4};

/// The CIFAR-10 dataset.
pub mod cifar10;
/// Record files for the streaming source.
pub mod recordio;

/// A batch of images and classes.
///
/// Images are scaled to \[0, 1\], shape = \[n, c, h, w\]. Classes have shape = \[n\].
#[derive(Clone, Debug)]
pub struct Batch {
    /// The images.
    pub images: Array4<f32>,
    /// The classes.
    pub classes: Array1<u8>,
}

impl Batch {
    /// Creates a batch.
    ///
    /// **Errors**
    ///
    /// The number of images and classes differ.
    pub fn new(images: Array4<f32>, classes: Array1<u8>) -> Result<Self> {
        ensure!(
            images.shape()[0] == classes.len(),
            "Batch has {} images but {} classes!",
            images.shape()[0],
            classes.len()
        );
        Ok(Self { images, classes })
    }
    /// Scales `u8` images into a batch.
    pub fn from_u8(images: ArrayView4<u8>, classes: ArrayView1<u8>) -> Result<Self> {
        Self::new(images.mapv(scale_pixel), classes.to_owned())
    }
    /// The number of examples.
    pub fn len(&self) -> usize {
        self.classes.len()
    }
    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

pub(crate) fn scale_pixel(x: u8) -> f32 {
    x as f32 / 255.
}

/// Splits fixed size records of 1 label byte followed by `pixels` bytes.
///
/// Returns the classes and the concatenated pixels.
pub(crate) fn split_records(data: &[u8], pixels: usize) -> Result<(Vec<u8>, Vec<u8>)> {
    let record_len = pixels + 1;
    ensure!(
        data.len() % record_len == 0,
        "Expected a multiple of {record_len} bytes, found {}!",
        data.len()
    );
    let n = data.len() / record_len;
    let mut classes = Vec::with_capacity(n);
    let mut images = Vec::with_capacity(n * pixels);
    for record in data.chunks_exact(record_len) {
        classes.push(record[0]);
        images.extend_from_slice(&record[1..]);
    }
    Ok((classes, images))
}
