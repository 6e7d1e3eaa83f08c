use log::debug;
use ndarray::{s, Array, Array1, Array2, Array4, ArrayView4, ArrayViewD, ArrayViewMutD, Axis, Dimension, Ix2, Ix4, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::activation::Activation;
use super::initializer::Initializer;
use super::Tensor;
use crate::error::{Error, Result};

/// Whether a forward pass is part of training (dropout active, activations cached for backprop)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Train,
    Infer,
}

/// Spatial padding policy of convolution and pooling windows
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Padding {
    /// Pad so the output has `ceil(input / stride)` positions
    Same,
    /// No padding, windows must fit inside the input
    Valid,
}

/// Declarative description of one layer. Turned into a live [`Layer`] when the model is compiled.
#[derive(Clone, Debug, PartialEq)]
pub enum LayerSpec {
    Conv2d {
        filters: usize,
        kernel_size: usize,
        padding: Padding,
        activation: Activation,
        initializer: Initializer,
    },
    MaxPool2d {
        pool_size: usize,
        padding: Padding,
    },
    Dropout {
        rate: f64,
    },
    Flatten,
    Dense {
        units: usize,
        activation: Activation,
        initializer: Initializer,
    },
}

/// A learnable parameter together with the gradient of the last backward pass
pub struct Param<D: Dimension> {
    pub value: Array<f32, D>,
    pub grad: Array<f32, D>,
}

impl<D: Dimension> Param<D> {
    fn new(value: Array<f32, D>) -> Self {
        let grad = Array::zeros(value.raw_dim());
        Param { value, grad }
    }

    fn as_mut(&mut self) -> ParamMut<'_> {
        ParamMut {
            value: self.value.view_mut().into_dyn(),
            grad: self.grad.view().into_dyn(),
        }
    }
}

/// Mutable access to a parameter for the optimizer
pub struct ParamMut<'a> {
    pub value: ArrayViewMutD<'a, f32>,
    pub grad: ArrayViewD<'a, f32>,
}

/// A layer of the network. Tensors carry the batch on axis 0.
pub trait Layer {
    fn name(&self) -> &'static str;

    /// Shape of one output sample
    fn output_shape(&self) -> &[usize];

    fn forward(&mut self, input: Tensor, phase: Phase) -> Result<Tensor>;

    /// Take the gradient WRT this layer's output, store parameter gradients,
    /// and return the gradient WRT its input
    fn backward(&mut self, grad: Tensor) -> Result<Tensor>;

    /// Activation applied to the layer's output
    fn activation(&self) -> Activation {
        Activation::Linear
    }

    /// Like [`Layer::backward`], but `grad` is already WRT the pre-activation output
    fn backward_linear(&mut self, grad: Tensor) -> Result<Tensor> {
        self.backward(grad)
    }

    fn params(&self) -> Vec<ArrayViewD<'_, f32>> {
        Vec::new()
    }

    fn params_mut(&mut self) -> Vec<ParamMut<'_>> {
        Vec::new()
    }
}

impl LayerSpec {
    /// Instantiate the layer for inputs whose per-sample shape is `input_shape`
    pub fn build(&self, input_shape: &[usize], rng: &mut StdRng) -> Result<Box<dyn Layer>> {
        let layer: Box<dyn Layer> = match *self {
            LayerSpec::Conv2d {
                filters,
                kernel_size,
                padding,
                activation,
                initializer,
            } => Box::new(Conv2d::new(
                input_shape,
                filters,
                kernel_size,
                padding,
                activation,
                initializer,
                rng,
            )?),
            LayerSpec::MaxPool2d { pool_size, padding } => {
                Box::new(MaxPool2d::new(input_shape, pool_size, padding)?)
            }
            LayerSpec::Dropout { rate } => Box::new(Dropout::new(input_shape, rate, rng.gen())?),
            LayerSpec::Flatten => Box::new(Flatten::new(input_shape)?),
            LayerSpec::Dense {
                units,
                activation,
                initializer,
            } => Box::new(Dense::new(input_shape, units, activation, initializer, rng)?),
        };

        debug!(
            "built {} layer {:?} -> {:?}",
            layer.name(),
            input_shape,
            layer.output_shape()
        );

        Ok(layer)
    }
}

fn image_shape(layer: &str, input_shape: &[usize]) -> Result<(usize, usize, usize)> {
    match *input_shape {
        [c, h, w] if c > 0 && h > 0 && w > 0 => Ok((c, h, w)),
        _ => Err(Error::InvalidLayer(format!(
            "{} expects a (channels, height, width) input, got {:?}",
            layer, input_shape
        ))),
    }
}

/// Output extent and the leading pad of a window sliding over `size` positions
fn window_geometry(size: usize, window: usize, stride: usize, padding: Padding) -> Option<(usize, usize)> {
    match padding {
        Padding::Same => {
            let out = (size + stride - 1) / stride;
            let pad_total = ((out - 1) * stride + window).saturating_sub(size);
            Some((out, pad_total / 2))
        }
        Padding::Valid if size >= window => Some(((size - window) / stride + 1, 0)),
        Padding::Valid => None,
    }
}

fn check_sample_shape(layer: &str, expected: &[usize], got: &[usize]) -> Result<()> {
    if got.len() != expected.len() + 1 || &got[1..] != expected {
        let mut full = vec![got.first().copied().unwrap_or(0)];
        full.extend_from_slice(expected);
        debug!("{} rejected input {:?}", layer, got);
        return Err(Error::ShapeMismatch {
            expected: full,
            got: got.to_vec(),
        });
    }
    Ok(())
}

fn missing_cache(layer: &str) -> Error {
    Error::InvalidLayer(format!(
        "{} backward called without a preceding training forward pass",
        layer
    ))
}

/// 2D convolution with stride 1 over (batch, channel, row, column) inputs
pub struct Conv2d {
    kernel: Param<Ix2>, // (filters, channels * k * k)
    bias: Param<ndarray::Ix1>,
    kernel_size: usize,
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
    pad: (usize, usize),
    activation: Activation,
    cols: Option<Array2<f32>>,
    output: Option<Tensor>,
}

impl Conv2d {
    fn new(
        input_shape: &[usize],
        filters: usize,
        kernel_size: usize,
        padding: Padding,
        activation: Activation,
        initializer: Initializer,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let (channels, height, width) = image_shape("conv2d", input_shape)?;

        if filters == 0 || kernel_size == 0 {
            return Err(Error::InvalidLayer(
                "conv2d needs at least one filter and a non-empty kernel".to_string(),
            ));
        }

        let rows = window_geometry(height, kernel_size, 1, padding);
        let cols = window_geometry(width, kernel_size, 1, padding);
        let ((out_h, pad_top), (out_w, pad_left)) = match (rows, cols) {
            (Some(r), Some(c)) => (r, c),
            _ => {
                return Err(Error::InvalidLayer(format!(
                    "conv2d kernel {0}x{0} does not fit a {1}x{2} input",
                    kernel_size, height, width
                )))
            }
        };

        let receptive = kernel_size * kernel_size;
        let weights = initializer.init(
            (filters, channels * receptive),
            channels * receptive,
            filters * receptive,
            rng,
        )?;

        Ok(Conv2d {
            kernel: Param::new(weights),
            bias: Param::new(Array1::zeros(filters)),
            kernel_size,
            input_shape: input_shape.to_vec(),
            output_shape: vec![filters, out_h, out_w],
            pad: (pad_top, pad_left),
            activation,
            cols: None,
            output: None,
        })
    }

    /// Lay every receptive field out as a column: (channels * k * k, batch * out_h * out_w)
    fn im2col(&self, x: ArrayView4<f32>) -> Array2<f32> {
        let (n, c, h, w) = x.dim();
        let (out_h, out_w) = (self.output_shape[1], self.output_shape[2]);
        let k = self.kernel_size;
        let (pad_top, pad_left) = self.pad;

        let mut padded = Array4::zeros((n, c, out_h + k - 1, out_w + k - 1));
        padded
            .slice_mut(s![.., .., pad_top..pad_top + h, pad_left..pad_left + w])
            .assign(&x);

        let mut cols = Array2::zeros((c * k * k, n * out_h * out_w));
        for ci in 0..c {
            for ky in 0..k {
                for kx in 0..k {
                    let window = padded.slice(s![.., ci, ky..ky + out_h, kx..kx + out_w]);
                    let mut row = cols.row_mut((ci * k + ky) * k + kx);
                    for (dst, &src) in row.iter_mut().zip(window.iter()) {
                        *dst = src;
                    }
                }
            }
        }

        cols
    }

    /// Scatter-add columns back onto the (unpadded) input grid
    fn col2im(&self, dcols: &Array2<f32>, n: usize) -> Array4<f32> {
        let (c, h, w) = (self.input_shape[0], self.input_shape[1], self.input_shape[2]);
        let (out_h, out_w) = (self.output_shape[1], self.output_shape[2]);
        let k = self.kernel_size;
        let (pad_top, pad_left) = self.pad;

        let mut padded = Array4::<f32>::zeros((n, c, out_h + k - 1, out_w + k - 1));
        for ci in 0..c {
            for ky in 0..k {
                for kx in 0..k {
                    let row = dcols.row((ci * k + ky) * k + kx);
                    let mut window = padded.slice_mut(s![.., ci, ky..ky + out_h, kx..kx + out_w]);
                    for (dst, &src) in window.iter_mut().zip(row.iter()) {
                        *dst += src;
                    }
                }
            }
        }

        padded
            .slice(s![.., .., pad_top..pad_top + h, pad_left..pad_left + w])
            .to_owned()
    }
}

impl Layer for Conv2d {
    fn name(&self) -> &'static str {
        "conv2d"
    }

    fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    fn forward(&mut self, input: Tensor, phase: Phase) -> Result<Tensor> {
        check_sample_shape("conv2d", &self.input_shape, input.shape())?;
        let x = input.into_dimensionality::<Ix4>()?;
        let n = x.len_of(Axis(0));
        let filters = self.output_shape[0];
        let (out_h, out_w) = (self.output_shape[1], self.output_shape[2]);

        let cols = self.im2col(x.view());
        let z = self.kernel.value.dot(&cols) + &self.bias.value.view().insert_axis(Axis(1));
        let z = z
            .into_shape((filters, n, out_h, out_w))?
            .permuted_axes([1, 0, 2, 3])
            .as_standard_layout()
            .into_owned();
        let output = self.activation.forward(z.into_dyn());

        if phase == Phase::Train {
            self.cols = Some(cols);
            self.output = Some(output.clone());
        } else {
            self.cols = None;
            self.output = None;
        }

        Ok(output)
    }

    fn backward(&mut self, grad: Tensor) -> Result<Tensor> {
        let dz = match &self.output {
            Some(output) => self.activation.backward(output, grad),
            None => return Err(missing_cache("conv2d")),
        };

        self.backward_linear(dz)
    }

    fn activation(&self) -> Activation {
        self.activation
    }

    fn backward_linear(&mut self, grad: Tensor) -> Result<Tensor> {
        let cols = self.cols.as_ref().ok_or_else(|| missing_cache("conv2d"))?;

        let dz = grad.into_dimensionality::<Ix4>()?;
        let (n, filters, out_h, out_w) = dz.dim();
        let dz = dz
            .permuted_axes([1, 0, 2, 3])
            .as_standard_layout()
            .into_owned()
            .into_shape((filters, n * out_h * out_w))?;

        self.kernel.grad = dz.dot(&cols.t());
        self.bias.grad = dz.sum_axis(Axis(1));

        let dcols = self.kernel.value.t().dot(&dz);
        Ok(self.col2im(&dcols, n).into_dyn())
    }

    fn params(&self) -> Vec<ArrayViewD<'_, f32>> {
        vec![
            self.kernel.value.view().into_dyn(),
            self.bias.value.view().into_dyn(),
        ]
    }

    fn params_mut(&mut self) -> Vec<ParamMut<'_>> {
        vec![self.kernel.as_mut(), self.bias.as_mut()]
    }
}

/// Max pooling over non-overlapping square windows
pub struct MaxPool2d {
    pool_size: usize,
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
    pad: (usize, usize),
    // flat input index of the max of every output element
    switches: Option<Vec<usize>>,
}

impl MaxPool2d {
    fn new(input_shape: &[usize], pool_size: usize, padding: Padding) -> Result<Self> {
        let (channels, height, width) = image_shape("max_pool2d", input_shape)?;

        if pool_size == 0 {
            return Err(Error::InvalidLayer("max_pool2d window must be non-empty".to_string()));
        }

        let rows = window_geometry(height, pool_size, pool_size, padding);
        let cols = window_geometry(width, pool_size, pool_size, padding);
        let ((out_h, pad_top), (out_w, pad_left)) = match (rows, cols) {
            (Some(r), Some(c)) => (r, c),
            _ => {
                return Err(Error::InvalidLayer(format!(
                    "max_pool2d window {0}x{0} does not fit a {1}x{2} input",
                    pool_size, height, width
                )))
            }
        };

        Ok(MaxPool2d {
            pool_size,
            input_shape: input_shape.to_vec(),
            output_shape: vec![channels, out_h, out_w],
            pad: (pad_top, pad_left),
            switches: None,
        })
    }

    /// Clip the window starting at `out_index * pool - pad` to `0..size`
    fn window(&self, out_index: usize, pad: usize, size: usize) -> (usize, usize) {
        let start = (out_index * self.pool_size).saturating_sub(pad);
        let end = (out_index * self.pool_size + self.pool_size - pad).min(size);
        (start, end)
    }
}

impl Layer for MaxPool2d {
    fn name(&self) -> &'static str {
        "max_pool2d"
    }

    fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    fn forward(&mut self, input: Tensor, phase: Phase) -> Result<Tensor> {
        check_sample_shape("max_pool2d", &self.input_shape, input.shape())?;
        let x = input.into_dimensionality::<Ix4>()?;
        let (n, c, h, w) = x.dim();
        let (out_h, out_w) = (self.output_shape[1], self.output_shape[2]);
        let (pad_top, pad_left) = self.pad;

        let mut output = Array4::<f32>::zeros((n, c, out_h, out_w));
        let mut switches = Vec::with_capacity(output.len());

        for b in 0..n {
            for ch in 0..c {
                for oy in 0..out_h {
                    let (y0, y1) = self.window(oy, pad_top, h);
                    for ox in 0..out_w {
                        let (x0, x1) = self.window(ox, pad_left, w);
                        let mut best = f32::NEG_INFINITY;
                        let mut best_at = (y0, x0);
                        for y in y0..y1 {
                            for xx in x0..x1 {
                                let v = x[[b, ch, y, xx]];
                                if v > best {
                                    best = v;
                                    best_at = (y, xx);
                                }
                            }
                        }
                        output[[b, ch, oy, ox]] = best;
                        switches.push(((b * c + ch) * h + best_at.0) * w + best_at.1);
                    }
                }
            }
        }

        self.switches = match phase {
            Phase::Train => Some(switches),
            Phase::Infer => None,
        };

        Ok(output.into_dyn())
    }

    fn backward(&mut self, grad: Tensor) -> Result<Tensor> {
        let switches = self.switches.as_ref().ok_or_else(|| missing_cache("max_pool2d"))?;
        let n = grad.len_of(Axis(0));
        let mut dx = vec![0f32; n * self.input_shape.iter().product::<usize>()];

        // grad.iter() walks (batch, channel, row, column), the same order switches were recorded in
        for (&g, &at) in grad.iter().zip(switches.iter()) {
            dx[at] += g;
        }

        let mut shape = vec![n];
        shape.extend_from_slice(&self.input_shape);
        Ok(Tensor::from_shape_vec(IxDyn(&shape), dx)?)
    }
}

/// Inverted dropout: zeroes activations with probability `rate` while training and
/// rescales the survivors by `1 / (1 - rate)`. Identity at inference.
pub struct Dropout {
    rate: f64,
    shape: Vec<usize>,
    rng: StdRng,
    mask: Option<Tensor>,
}

impl Dropout {
    fn new(input_shape: &[usize], rate: f64, seed: u64) -> Result<Self> {
        if !(0.0..1.0).contains(&rate) {
            return Err(Error::InvalidLayer(format!(
                "dropout rate must lie in [0, 1), got {}",
                rate
            )));
        }

        Ok(Dropout {
            rate,
            shape: input_shape.to_vec(),
            rng: StdRng::seed_from_u64(seed),
            mask: None,
        })
    }
}

impl Layer for Dropout {
    fn name(&self) -> &'static str {
        "dropout"
    }

    fn output_shape(&self) -> &[usize] {
        &self.shape
    }

    fn forward(&mut self, input: Tensor, phase: Phase) -> Result<Tensor> {
        if phase == Phase::Infer || self.rate == 0.0 {
            self.mask = None;
            return Ok(input);
        }

        let scale = (1.0 / (1.0 - self.rate)) as f32;
        let rate = self.rate;
        let rng = &mut self.rng;
        let mask = Tensor::from_shape_simple_fn(input.raw_dim(), || {
            if rng.gen_bool(rate) {
                0.0
            } else {
                scale
            }
        });
        let output = input * &mask;
        self.mask = Some(mask);

        Ok(output)
    }

    fn backward(&mut self, grad: Tensor) -> Result<Tensor> {
        match &self.mask {
            Some(mask) => Ok(grad * mask),
            None => Ok(grad),
        }
    }
}

/// Collapse every sample into a vector, keeping the batch axis
pub struct Flatten {
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
}

impl Flatten {
    fn new(input_shape: &[usize]) -> Result<Self> {
        if input_shape.is_empty() {
            return Err(Error::InvalidLayer("flatten needs a non-scalar input".to_string()));
        }

        Ok(Flatten {
            input_shape: input_shape.to_vec(),
            output_shape: vec![input_shape.iter().product()],
        })
    }
}

fn standard(tensor: Tensor) -> Tensor {
    if tensor.is_standard_layout() {
        tensor
    } else {
        tensor.as_standard_layout().into_owned()
    }
}

impl Layer for Flatten {
    fn name(&self) -> &'static str {
        "flatten"
    }

    fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    fn forward(&mut self, input: Tensor, _phase: Phase) -> Result<Tensor> {
        check_sample_shape("flatten", &self.input_shape, input.shape())?;
        let n = input.len_of(Axis(0));

        Ok(standard(input).into_shape(IxDyn(&[n, self.output_shape[0]]))?)
    }

    fn backward(&mut self, grad: Tensor) -> Result<Tensor> {
        let mut shape = vec![grad.len_of(Axis(0))];
        shape.extend_from_slice(&self.input_shape);

        Ok(standard(grad).into_shape(IxDyn(&shape))?)
    }
}

/// Fully connected layer: y = activation(x W + b)
pub struct Dense {
    kernel: Param<Ix2>, // (inputs, units)
    bias: Param<ndarray::Ix1>,
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
    activation: Activation,
    input: Option<Array2<f32>>,
    output: Option<Tensor>,
}

impl Dense {
    fn new(
        input_shape: &[usize],
        units: usize,
        activation: Activation,
        initializer: Initializer,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let inputs = match *input_shape {
            [inputs] if inputs > 0 => inputs,
            _ => {
                return Err(Error::InvalidLayer(format!(
                    "dense expects a flat input, got {:?}",
                    input_shape
                )))
            }
        };

        if units == 0 {
            return Err(Error::InvalidLayer("dense needs at least one unit".to_string()));
        }

        Ok(Dense {
            kernel: Param::new(initializer.init((inputs, units), inputs, units, rng)?),
            bias: Param::new(Array1::zeros(units)),
            input_shape: input_shape.to_vec(),
            output_shape: vec![units],
            activation,
            input: None,
            output: None,
        })
    }
}

impl Layer for Dense {
    fn name(&self) -> &'static str {
        "dense"
    }

    fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    fn forward(&mut self, input: Tensor, phase: Phase) -> Result<Tensor> {
        check_sample_shape("dense", &self.input_shape, input.shape())?;
        let x = input.into_dimensionality::<Ix2>()?;
        let z = x.dot(&self.kernel.value) + &self.bias.value;
        let output = self.activation.forward(z.into_dyn());

        if phase == Phase::Train {
            self.input = Some(x);
            self.output = Some(output.clone());
        } else {
            self.input = None;
            self.output = None;
        }

        Ok(output)
    }

    fn backward(&mut self, grad: Tensor) -> Result<Tensor> {
        let dz = match &self.output {
            Some(output) => self.activation.backward(output, grad),
            None => return Err(missing_cache("dense")),
        };

        self.backward_linear(dz)
    }

    fn activation(&self) -> Activation {
        self.activation
    }

    fn backward_linear(&mut self, grad: Tensor) -> Result<Tensor> {
        let x = self.input.as_ref().ok_or_else(|| missing_cache("dense"))?;

        let dz = grad.into_dimensionality::<Ix2>()?;
        self.kernel.grad = x.t().dot(&dz);
        self.bias.grad = dz.sum_axis(Axis(0));

        Ok(dz.dot(&self.kernel.value.t()).into_dyn())
    }

    fn params(&self) -> Vec<ArrayViewD<'_, f32>> {
        vec![
            self.kernel.value.view().into_dyn(),
            self.bias.value.view().into_dyn(),
        ]
    }

    fn params_mut(&mut self) -> Vec<ParamMut<'_>> {
        vec![self.kernel.as_mut(), self.bias.as_mut()]
    }
}
