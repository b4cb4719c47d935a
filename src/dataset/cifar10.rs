use super::split_records;
use crate::{feed::ArrayBatches, result::Result};
use anyhow::{bail, ensure, Context};
use log::debug;
use ndarray::{ArcArray, ArcArray1, Ix4};
use num_format::{Locale, ToFormattedString};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Channels, height, width.
pub const IMAGE_SHAPE: [usize; 3] = [3, 32, 32];
/// The number of classes.
pub const NUM_CLASSES: usize = 10;
const PIXELS: usize = 3 * 32 * 32;
const BATCHES_DIR: &str = "cifar-10-batches-bin";
const TRAIN_FILES: [&str; 5] = [
    "data_batch_1.bin",
    "data_batch_2.bin",
    "data_batch_3.bin",
    "data_batch_4.bin",
    "data_batch_5.bin",
];
const TEST_FILE: &str = "test_batch.bin";

/// Cifar10 builder.
pub mod builders {
    use super::{Cifar10, Result};
    use std::path::Path;

    /// Cifar10 builder.
    #[derive(Debug, Default)]
    pub struct Cifar10Builder<'a> {
        pub(super) path: Option<&'a Path>,
    }

    impl Cifar10Builder<'_> {
        /// The path to load the dataset from.
        ///
        /// This is the folder containing `cifar-10-batches-bin`. If not specified, uses
        /// "cifar10" in the OS specific "Downloads" directory or the "Temp" directory.
        pub fn path<'b>(self, path: &'b Path) -> Cifar10Builder<'b> {
            Cifar10Builder { path: Some(path) }
        }
        /// Builds the dataset.
        ///
        /// **Errors**
        /// - The files were not found.
        /// - A file is empty or not a whole number of records.
        pub fn build(&self) -> Result<Cifar10> {
            Cifar10::build(self)
        }
    }
}
use builders::Cifar10Builder;

/// The [CIFAR-10](<https://www.cs.toronto.edu/~kriz/cifar.html>) dataset, binary version.
///
/// Records are 1 label byte followed by 3072 pixel bytes, channel major.
#[derive(Clone)]
pub struct Cifar10 {
    path: PathBuf,
    train_images: ArcArray<u8, Ix4>,
    train_classes: ArcArray1<u8>,
    test_images: ArcArray<u8, Ix4>,
    test_classes: ArcArray1<u8>,
}

impl Cifar10 {
    /// Returns a [`Cifar10Builder`] used to specify options.
    pub fn builder() -> Cifar10Builder<'static> {
        Cifar10Builder::default()
    }
    /// The default dataset directory.
    pub fn default_path() -> PathBuf {
        dirs::download_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("cifar10")
    }
    fn build(builder: &Cifar10Builder) -> Result<Self> {
        let path = builder
            .path
            .map(Path::to_owned)
            .unwrap_or_else(Self::default_path);
        let batches_path = path.join(BATCHES_DIR);
        let (train_images, train_classes) = load(&batches_path, &TRAIN_FILES)?;
        let (test_images, test_classes) = load(&batches_path, &[TEST_FILE])?;
        debug!(
            "loaded cifar10 from {path:?}: {} train, {} test",
            train_classes.len().to_formatted_string(&Locale::en),
            test_classes.len().to_formatted_string(&Locale::en)
        );
        Ok(Self {
            path,
            train_images,
            train_classes,
            test_images,
            test_classes,
        })
    }
    /// The directory the dataset was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }
    /// The training images.
    ///
    /// Shape = \[n, 3, 32, 32\], 50_000 for the full dataset.
    pub fn train_images(&self) -> &ArcArray<u8, Ix4> {
        &self.train_images
    }
    /// The training classes.
    ///
    /// The classes range from 0 to 9 inclusive.
    pub fn train_classes(&self) -> &ArcArray1<u8> {
        &self.train_classes
    }
    /// The test images.
    ///
    /// Shape = \[n, 3, 32, 32\], 10_000 for the full dataset.
    pub fn test_images(&self) -> &ArcArray<u8, Ix4> {
        &self.test_images
    }
    /// The test classes.
    pub fn test_classes(&self) -> &ArcArray1<u8> {
        &self.test_classes
    }
    /// Batches of the training split.
    ///
    /// See [`ArrayBatches`].
    pub fn train_batches(&self, batch_size: usize) -> Result<ArrayBatches> {
        ArrayBatches::new(
            self.train_images.clone(),
            self.train_classes.clone(),
            batch_size,
        )
    }
}

fn load(dir: &Path, names: &[&str]) -> Result<(ArcArray<u8, Ix4>, ArcArray1<u8>)> {
    let mut images = Vec::new();
    let mut classes = Vec::new();
    for name in names {
        let file = dir.join(name);
        let data = fs::read(&file).with_context(|| format!("Failed to read {file:?}!"))?;
        ensure!(!data.is_empty(), "{file:?} is empty!");
        let (file_classes, file_images) =
            split_records(&data, PIXELS).with_context(|| format!("Invalid records in {file:?}!"))?;
        if let Some(class) = file_classes.iter().find(|x| **x as usize >= NUM_CLASSES) {
            bail!("Invalid class {class} in {file:?}!");
        }
        classes.extend(file_classes);
        images.extend(file_images);
    }
    let [c, h, w] = IMAGE_SHAPE;
    let n = classes.len();
    let images = ArcArray::from_shape_vec([n, c, h, w], images)?;
    let classes = ArcArray::from_shape_vec(n, classes)?;
    Ok((images, classes))
}

/// Writes CIFAR-10 binary files, for tests.
#[cfg(test)]
pub(crate) fn write_fake(dir: &Path, train_per_file: usize, test: usize) -> Result<()> {
    let batches_path = dir.join(BATCHES_DIR);
    fs::create_dir_all(&batches_path)?;
    let record = |i: usize| {
        let mut record = vec![(i % NUM_CLASSES) as u8];
        record.extend((0..PIXELS).map(|p| ((i + p) % 256) as u8));
        record
    };
    for (f, name) in TRAIN_FILES.iter().enumerate() {
        let data: Vec<u8> = (0..train_per_file)
            .flat_map(|i| record(f * train_per_file + i))
            .collect();
        fs::write(batches_path.join(name), data)?;
    }
    let data: Vec<u8> = (0..test).flat_map(record).collect();
    fs::write(batches_path.join(TEST_FILE), data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fake() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_fake(dir.path(), 3, 2)?;
        let cifar10 = Cifar10::builder().path(dir.path()).build()?;
        assert_eq!(cifar10.train_images().shape(), &[15, 3, 32, 32]);
        assert_eq!(cifar10.train_classes().len(), 15);
        assert_eq!(cifar10.test_images().shape(), &[2, 3, 32, 32]);
        assert_eq!(cifar10.train_classes()[7], 7);
        assert_eq!(cifar10.train_images()[[7, 0, 0, 1]], 8);
        assert_eq!(cifar10.path(), dir.path());
        Ok(())
    }

    #[test]
    fn truncated_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_fake(dir.path(), 2, 1)?;
        let file = dir.path().join(BATCHES_DIR).join(TRAIN_FILES[2]);
        let mut data = fs::read(&file)?;
        data.pop();
        fs::write(&file, data)?;
        assert!(Cifar10::builder().path(dir.path()).build().is_err());
        Ok(())
    }

    #[test]
    fn empty_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_fake(dir.path(), 2, 1)?;
        fs::write(dir.path().join(BATCHES_DIR).join(TEST_FILE), Vec::<u8>::new())?;
        assert!(Cifar10::builder().path(dir.path()).build().is_err());
        Ok(())
    }

    #[test]
    fn missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Cifar10::builder().path(dir.path()).build().is_err());
    }
}
