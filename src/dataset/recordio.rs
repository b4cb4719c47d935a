/*!
Record files.

A record file is a little endian header followed by fixed size records of 1 label byte and
`channels * height * width` pixel bytes.

| field    | type     |
|----------|----------|
| magic    | `b"CFRB"`|
| version  | u32      |
| channels | u32      |
| height   | u32      |
| width    | u32      |
| count    | u64      |
*/
use crate::result::Result;
use anyhow::{bail, ensure, Context};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ndarray::{ArrayView1, ArrayView4, Axis};
use std::{
    fs::File,
    io::{self, BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

/// Leading bytes of a record file.
pub const MAGIC: [u8; 4] = *b"CFRB";
/// The supported format version.
pub const VERSION: u32 = 1;

/// Record file header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Header {
    /// Image shape, \[channels, height, width\].
    pub image_shape: [usize; 3],
    /// The number of records.
    pub count: u64,
}

impl Header {
    /// The number of pixel bytes per record.
    pub fn pixels(&self) -> usize {
        self.image_shape.iter().product()
    }
    /// The number of bytes per record.
    pub fn record_len(&self) -> usize {
        self.pixels() + 1
    }
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&MAGIC)?;
        writer.write_u32::<LittleEndian>(VERSION)?;
        for dim in self.image_shape {
            writer.write_u32::<LittleEndian>(dim as u32)?;
        }
        writer.write_u64::<LittleEndian>(self.count)
    }
    fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let mut magic = [0; 4];
        reader.read_exact(&mut magic)?;
        ensure!(magic == MAGIC, "Expected magic {MAGIC:?}, found {magic:?}!");
        let version = reader.read_u32::<LittleEndian>()?;
        ensure!(
            version == VERSION,
            "Unsupported record file version {version}!"
        );
        let mut image_shape = [0; 3];
        for dim in image_shape.iter_mut() {
            *dim = reader.read_u32::<LittleEndian>()? as usize;
        }
        ensure!(
            image_shape.iter().all(|x| *x > 0),
            "Invalid image shape {image_shape:?}!"
        );
        let count = reader.read_u64::<LittleEndian>()?;
        Ok(Self { image_shape, count })
    }
}

/// Writes `images` and `classes` to a record file at `path`.
///
/// **Errors**
/// - The number of images and classes differ.
/// - The file could not be written.
pub fn write_records(
    path: &Path,
    images: ArrayView4<u8>,
    classes: ArrayView1<u8>,
) -> Result<Header> {
    let (n, c, h, w) = images.dim();
    ensure!(
        n == classes.len(),
        "Expected {n} classes, found {}!",
        classes.len()
    );
    let header = Header {
        image_shape: [c, h, w],
        count: n as u64,
    };
    let file = File::create(path).with_context(|| format!("Failed to create {path:?}!"))?;
    let mut writer = BufWriter::new(file);
    header.write(&mut writer)?;
    for (image, class) in images.axis_iter(Axis(0)).zip(classes.iter().copied()) {
        writer.write_u8(class)?;
        if let Some(pixels) = image.as_slice() {
            writer.write_all(pixels)?;
        } else {
            let pixels: Vec<u8> = image.iter().copied().collect();
            writer.write_all(&pixels)?;
        }
    }
    writer.flush()?;
    Ok(header)
}

/// Sequential reader of a record file.
pub struct RecordReader {
    path: PathBuf,
    reader: BufReader<File>,
    header: Header,
    position: u64,
}

impl RecordReader {
    /// Opens the file at `path` and reads the header.
    ///
    /// **Errors**
    /// - The file could not be opened.
    /// - The header is invalid.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open {path:?}!"))?;
        let mut reader = BufReader::new(file);
        let header =
            Header::read(&mut reader).with_context(|| format!("Invalid header in {path:?}!"))?;
        Ok(Self {
            path: path.to_owned(),
            reader,
            header,
            position: 0,
        })
    }
    /// The path.
    pub fn path(&self) -> &Path {
        &self.path
    }
    /// The header.
    pub fn header(&self) -> &Header {
        &self.header
    }
    /// Reads the next record into `pixels`, returning the class.
    ///
    /// Returns `None` after the last record.
    ///
    /// **Errors**
    /// - `pixels` is not [`Header::pixels()`] long.
    /// - The file ends before the header count.
    pub fn read_record(&mut self, pixels: &mut [u8]) -> Result<Option<u8>> {
        ensure!(
            pixels.len() == self.header.pixels(),
            "Expected a buffer of {} bytes, found {}!",
            self.header.pixels(),
            pixels.len()
        );
        if self.position == self.header.count {
            return Ok(None);
        }
        let class = match self.reader.read_u8() {
            Ok(class) => class,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => bail!(
                "{:?} ended after {} of {} records!",
                self.path,
                self.position,
                self.header.count
            ),
            Err(e) => return Err(e.into()),
        };
        self.reader.read_exact(pixels).with_context(|| {
            format!(
                "{:?} ended in record {} of {}!",
                self.path, self.position, self.header.count
            )
        })?;
        self.position += 1;
        Ok(Some(class))
    }
}
