use std::fmt;

use ndarray::{Array1, Array3};

pub mod mnist;
pub mod preprocess;

/// Images and labels of one dataset partition, exactly as stored on disk
#[derive(Debug)]
pub struct RawSplit {
    pub images: Array3<u8>,
    pub labels: Array1<u8>,
}

impl RawSplit {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Split::Train => write!(f, "train"),
            Split::Test => write!(f, "test"),
        }
    }
}

/// On-disk layout of the dataset
#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataFormat {
    /// The original big-endian IDX files
    Idx,
    /// CSV dumps with a header line and `label,p0,...,p783` records
    Csv,
}
