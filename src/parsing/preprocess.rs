use super::mnist::{HEIGHT, WIDTH};
use crate::error::{Error, Result};
use ndarray::{Array1, Array2, Array3, Array4, ArrayView2, ArrayView4, Axis};

pub const NUM_CLASSES: usize = 10;
const GREYSCALE_SIZE: f32 = 255.0;

/// Normalized images laid out as (sample, channel, row, column), every value in [0, 1].
///
/// The only way to obtain one is [`normalize`], which consumes the unscaled tensor,
/// so a tensor can never be scaled twice.
#[derive(Clone, Debug)]
pub struct ImageTensor(Array4<f32>);

impl ImageTensor {
    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.0.view()
    }

    pub fn shape(&self) -> &[usize] {
        self.0.shape()
    }

    pub fn len(&self) -> usize {
        self.0.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One-hot encoded labels laid out as (sample, class)
#[derive(Clone, Debug)]
pub struct LabelTensor(Array2<f32>);

impl LabelTensor {
    pub fn view(&self) -> ArrayView2<'_, f32> {
        self.0.view()
    }

    pub fn len(&self) -> usize {
        self.0.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Turn (N, 28, 28) raw pixels into a (N, 1, 28, 28) float tensor. Values are cast, not scaled.
pub fn reshape_images(raw: &Array3<u8>) -> Result<Array4<f32>> {
    let (count, rows, cols) = raw.dim();

    if rows != HEIGHT || cols != WIDTH {
        return Err(Error::ShapeMismatch {
            expected: vec![count, HEIGHT, WIDTH],
            got: vec![count, rows, cols],
        });
    }

    Ok(raw.mapv(f32::from).insert_axis(Axis(1)))
}

/// Scale pixel intensities from [0, 255] to [0, 1]
pub fn normalize(images: Array4<f32>) -> ImageTensor {
    ImageTensor(images / GREYSCALE_SIZE)
}

/// Construct the one-hot encoding of every label
pub fn one_hot(labels: &Array1<u8>, classes: usize) -> Result<LabelTensor> {
    let mut encoded = Array2::zeros((labels.len(), classes));

    for (index, (&label, mut row)) in labels.iter().zip(encoded.rows_mut()).enumerate() {
        if label as usize >= classes {
            return Err(Error::LabelOutOfRange {
                index,
                label,
                classes,
            });
        }
        row[label as usize] = 1.0;
    }

    Ok(LabelTensor(encoded))
}

/// Render a shape the way a tuple prints, e.g. `(60000, 1, 28, 28)`
pub fn format_shape(shape: &[usize]) -> String {
    let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
    format!("({})", dims.join(", "))
}
