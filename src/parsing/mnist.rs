use super::{DataFormat, RawSplit, Split};
use crate::error::{Error, Result};
use log::{debug, info};
use ndarray::{Array1, Array3};
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

pub const WIDTH: usize = 28;
pub const HEIGHT: usize = 28;

const LINE_SIZE: usize = WIDTH * HEIGHT + 1;
const IMAGE_MAGIC: u32 = 0x0000_0803;
const LABEL_MAGIC: u32 = 0x0000_0801;

const TRAIN_IMAGES: &str = "train-images-idx3-ubyte";
const TRAIN_LABELS: &str = "train-labels-idx1-ubyte";
const TEST_IMAGES: &str = "t10k-images-idx3-ubyte";
const TEST_LABELS: &str = "t10k-labels-idx1-ubyte";
const TRAIN_CSV: &str = "mnist_train.csv";
const TEST_CSV: &str = "mnist_test.csv";

/// Load one partition of the digit dataset stored under `dir`
pub fn load(dir: &Path, split: Split, format: DataFormat) -> Result<RawSplit> {
    let dataset = match format {
        DataFormat::Idx => {
            let (images_file, labels_file) = match split {
                Split::Train => (TRAIN_IMAGES, TRAIN_LABELS),
                Split::Test => (TEST_IMAGES, TEST_LABELS),
            };
            let images_path = dir.join(images_file);
            let labels_path = dir.join(labels_file);
            let images = parse_images(&read_file(&images_path)?, &images_path)?;
            let labels = parse_labels(&read_file(&labels_path)?, &labels_path)?;

            if images.len_of(ndarray::Axis(0)) != labels.len() {
                return Err(Error::CountMismatch {
                    images: images.len_of(ndarray::Axis(0)),
                    labels: labels.len(),
                });
            }

            RawSplit { images, labels }
        }
        DataFormat::Csv => {
            let path = dir.join(match split {
                Split::Train => TRAIN_CSV,
                Split::Test => TEST_CSV,
            });
            let file = File::open(&path).map_err(|source| Error::Io { path, source })?;
            read_csv(file)?
        }
    };

    info!(
        "loaded {} {} samples from {}",
        dataset.len(),
        split,
        dir.display()
    );

    Ok(dataset)
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Check the magic number of an IDX header and return the dimension fields that follow it
fn read_header(bytes: &[u8], path: &Path, magic: u32, dims: usize) -> Result<Vec<usize>> {
    let header_len = 4 * (dims + 1);

    if bytes.len() < header_len {
        return Err(Error::Truncated {
            path: path.to_path_buf(),
            expected: header_len,
            found: bytes.len(),
        });
    }

    let words: Vec<u32> = bytes[..header_len]
        .chunks_exact(4)
        .map(|word| u32::from_be_bytes([word[0], word[1], word[2], word[3]]))
        .collect();

    if words[0] != magic {
        return Err(Error::BadMagic {
            path: path.to_path_buf(),
            expected: magic,
            found: words[0],
        });
    }

    Ok(words[1..].iter().map(|&w| w as usize).collect())
}

/// End of the payload after a header of `offset` bytes declaring `dims`
fn payload_end(path: &Path, offset: usize, dims: &[usize]) -> Result<usize> {
    dims.iter()
        .try_fold(1usize, |size, &dim| size.checked_mul(dim))
        .and_then(|size| size.checked_add(offset))
        .ok_or_else(|| Error::Corrupt {
            path: path.to_path_buf(),
            reason: format!("dimensions {:?} overflow the address space", dims),
        })
}

/// Parse an IDX3 image file into a (count, rows, cols) array of raw pixels
pub fn parse_images(bytes: &[u8], path: &Path) -> Result<Array3<u8>> {
    let dims = read_header(bytes, path, IMAGE_MAGIC, 3)?;
    let (count, rows, cols) = (dims[0], dims[1], dims[2]);
    let expected = payload_end(path, 16, &dims)?;

    if bytes.len() < expected {
        return Err(Error::Truncated {
            path: path.to_path_buf(),
            expected,
            found: bytes.len(),
        });
    }

    debug!("{}: {} images of {}x{}", path.display(), count, rows, cols);

    Ok(Array3::from_shape_vec(
        (count, rows, cols),
        bytes[16..expected].to_vec(),
    )?)
}

/// Parse an IDX1 label file
pub fn parse_labels(bytes: &[u8], path: &Path) -> Result<Array1<u8>> {
    let dims = read_header(bytes, path, LABEL_MAGIC, 1)?;
    let expected = payload_end(path, 8, &dims)?;

    if bytes.len() < expected {
        return Err(Error::Truncated {
            path: path.to_path_buf(),
            expected,
            found: bytes.len(),
        });
    }

    Ok(Array1::from(bytes[8..expected].to_vec()))
}

/// Read a CSV dump where every record is stored as <label>,<pixel0x0>,<pixel0x1>,...
/// The first line is a header and is skipped.
pub fn read_csv<R: Read>(reader: R) -> Result<RawSplit> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);
    let mut pixels = Vec::new();
    let mut labels = Vec::new();

    for record in reader.records() {
        let record = record?;

        if record.len() != LINE_SIZE {
            return Err(Error::MalformedRecord {
                line: record.position().map_or(0, |pos| pos.line()),
                expected: LINE_SIZE,
                found: record.len(),
            });
        }

        let row: Vec<u8> = record.deserialize(None)?;
        labels.push(row[0]);
        pixels.extend_from_slice(&row[1..]);
    }

    let count = labels.len();

    Ok(RawSplit {
        images: Array3::from_shape_vec((count, HEIGHT, WIDTH), pixels)?,
        labels: Array1::from(labels),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idx_images(count: u32, rows: u32, cols: u32, fill: u8) -> Vec<u8> {
        let mut bytes = Vec::new();
        for word in [IMAGE_MAGIC, count, rows, cols] {
            bytes.extend_from_slice(&word.to_be_bytes());
        }
        bytes.extend(std::iter::repeat(fill).take((count * rows * cols) as usize));
        bytes
    }

    fn idx_labels(labels: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&LABEL_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&(labels.len() as u32).to_be_bytes());
        bytes.extend_from_slice(labels);
        bytes
    }

    fn csv_line(label: u8, pixel: u8) -> String {
        let mut fields = vec![label.to_string()];
        fields.extend(std::iter::repeat(pixel.to_string()).take(WIDTH * HEIGHT));
        fields.join(",")
    }

    #[test]
    fn parses_idx_images() {
        let bytes = idx_images(3, 28, 28, 7);
        let images = parse_images(&bytes, Path::new("images")).unwrap();

        assert_eq!(images.shape(), &[3, 28, 28]);
        assert!(images.iter().all(|&p| p == 7));
    }

    #[test]
    fn parses_idx_labels() {
        let bytes = idx_labels(&[5, 0, 4, 1, 9]);
        let labels = parse_labels(&bytes, Path::new("labels")).unwrap();

        assert_eq!(labels.to_vec(), vec![5, 0, 4, 1, 9]);
    }

    #[test]
    fn rejects_label_file_as_images() {
        let bytes = idx_labels(&[1, 2, 3]);
        let err = parse_images(&bytes, Path::new("labels")).unwrap_err();

        assert!(matches!(
            err,
            Error::BadMagic { .. } | Error::Truncated { .. }
        ));
    }

    #[test]
    fn rejects_wrong_magic() {
        let mut bytes = idx_images(1, 28, 28, 0);
        bytes[3] = 0x01;
        let err = parse_images(&bytes, Path::new("images")).unwrap_err();

        assert!(matches!(err, Error::BadMagic { found: 0x0801, .. }));
    }

    #[test]
    fn rejects_truncated_payload() {
        let mut bytes = idx_images(2, 28, 28, 0);
        bytes.truncate(bytes.len() - 10);
        let err = parse_images(&bytes, Path::new("images")).unwrap_err();

        assert!(matches!(err, Error::Truncated { expected, .. } if expected == 16 + 2 * 784));
    }

    #[test]
    fn rejects_overflowing_header() {
        let mut bytes = Vec::new();
        for word in [IMAGE_MAGIC, u32::MAX, u32::MAX, u32::MAX] {
            bytes.extend_from_slice(&word.to_be_bytes());
        }
        let err = parse_images(&bytes, Path::new("images")).unwrap_err();

        assert!(matches!(err, Error::Corrupt { .. }));
    }

    #[test]
    fn load_reports_missing_files() {
        let dir = Path::new("definitely/not/a/dataset/dir");
        let err = load(dir, Split::Train, DataFormat::Idx).unwrap_err();

        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn reads_csv_records() {
        let header = (0..LINE_SIZE)
            .map(|i| format!("c{}", i))
            .collect::<Vec<_>>()
            .join(",");
        let contents = format!("{}\n{}\n{}\n", header, csv_line(3, 255), csv_line(8, 0));
        let dataset = read_csv(contents.as_bytes()).unwrap();

        assert_eq!(dataset.images.shape(), &[2, 28, 28]);
        assert_eq!(dataset.labels.to_vec(), vec![3, 8]);
        assert!(dataset.images.index_axis(ndarray::Axis(0), 0).iter().all(|&p| p == 255));
        assert!(dataset.images.index_axis(ndarray::Axis(0), 1).iter().all(|&p| p == 0));
    }

    #[test]
    fn rejects_short_csv_record() {
        let contents = format!("label,pixel\n{}\n1,2,3\n", csv_line(1, 1));
        let err = read_csv(contents.as_bytes()).unwrap_err();

        assert!(matches!(
            err,
            Error::MalformedRecord { line: 3, found: 3, .. }
        ));
    }
}
