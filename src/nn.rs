use crate::conv::ConvGeometry;
use crate::Tensor;
use rand::distributions::{Distribution, Uniform};
use rand::Rng;

/// Trait for any differentiable network component.
pub trait Module {
    fn forward(&self, input: &Tensor) -> Tensor;
    fn parameters(&self) -> Vec<Tensor>;
}

fn he_uniform<R: Rng + ?Sized>(rng: &mut R, fan_in: usize, shape: &[usize]) -> Tensor {
    // Xavier/He-style initialization
    let scale = (2.0 / fan_in as f32).sqrt();
    let dist = Uniform::new_inclusive(-scale, scale);
    let size: usize = shape.iter().product();
    let data: Vec<f32> = (0..size).map(|_| dist.sample(&mut *rng)).collect();
    Tensor::new(data, shape).requires_grad()
}

/// Linear (fully connected) layer: `y = xWᵀ + b`
#[derive(Debug)]
pub struct Linear {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
}

impl Linear {
    pub fn new(in_features: usize, out_features: usize, with_bias: bool) -> Self {
        Self::new_with(&mut rand::thread_rng(), in_features, out_features, with_bias)
    }

    pub fn new_with<R: Rng + ?Sized>(rng: &mut R, in_features: usize, out_features: usize, with_bias: bool) -> Self {
        let weight = he_uniform(rng, in_features, &[out_features, in_features]);
        let bias = with_bias.then(|| Tensor::zeros(&[out_features]).requires_grad());
        Self { weight, bias }
    }

    /// Wrap existing parameters. `weight` is `[out, in]`.
    pub fn from_parts(weight: Tensor, bias: Option<Tensor>) -> Self {
        assert_eq!(weight.shape().len(), 2, "linear weight must be [out, in]");
        if let Some(b) = &bias {
            assert_eq!(b.shape(), &[weight.shape()[0]], "linear bias must be [out]");
        }
        Self { weight, bias }
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape()[0]
    }
}

impl Module for Linear {
    fn forward(&self, input: &Tensor) -> Tensor {
        input.linear(&self.weight, self.bias.as_ref())
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut p = vec![self.weight.clone()];
        if let Some(b) = &self.bias {
            p.push(b.clone());
        }
        p
    }
}

/// 2D convolution over NCHW input.
#[derive(Debug)]
pub struct Conv2d {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
    pub geometry: ConvGeometry,
}

impl Conv2d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: (usize, usize),
        geometry: ConvGeometry,
        with_bias: bool,
    ) -> Self {
        Self::new_with(
            &mut rand::thread_rng(),
            in_channels,
            out_channels,
            kernel_size,
            geometry,
            with_bias,
        )
    }

    pub fn new_with<R: Rng + ?Sized>(
        rng: &mut R,
        in_channels: usize,
        out_channels: usize,
        kernel_size: (usize, usize),
        geometry: ConvGeometry,
        with_bias: bool,
    ) -> Self {
        let cin_per_group = in_channels / geometry.groups;
        let fan_in = cin_per_group * kernel_size.0 * kernel_size.1;
        let weight = he_uniform(
            rng,
            fan_in,
            &[out_channels, cin_per_group, kernel_size.0, kernel_size.1],
        );
        let bias = with_bias.then(|| Tensor::zeros(&[out_channels]).requires_grad());
        Self { weight, bias, geometry }
    }

    /// Wrap existing parameters. `weight` is `[C_out, C_in / groups, kH, kW]`.
    pub fn from_parts(weight: Tensor, bias: Option<Tensor>, geometry: ConvGeometry) -> Self {
        assert_eq!(weight.shape().len(), 4, "conv weight must be 4D");
        if let Some(b) = &bias {
            assert_eq!(b.shape(), &[weight.shape()[0]], "conv bias must be [C_out]");
        }
        Self { weight, bias, geometry }
    }

    pub fn out_channels(&self) -> usize {
        self.weight.shape()[0]
    }
}

impl Module for Conv2d {
    fn forward(&self, input: &Tensor) -> Tensor {
        input.conv2d(&self.weight, self.bias.as_ref(), self.geometry)
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut p = vec![self.weight.clone()];
        if let Some(b) = &self.bias {
            p.push(b.clone());
        }
        p
    }
}

/// Batch normalization over the channel dim of NCHW input.
///
/// Running statistics follow `running = (1 - momentum) * running + momentum * batch`,
/// with the unbiased batch variance.
#[derive(Debug)]
pub struct BatchNorm2d {
    pub weight: Option<Tensor>,
    pub bias: Option<Tensor>,
    pub running_mean: Tensor,
    pub running_var: Tensor,
    pub eps: f32,
    pub momentum: f32,
    training: bool,
}

impl BatchNorm2d {
    pub fn new(num_features: usize) -> Self {
        Self {
            weight: Some(Tensor::full(&[num_features], 1.0).requires_grad()),
            bias: Some(Tensor::zeros(&[num_features]).requires_grad()),
            running_mean: Tensor::zeros(&[num_features]),
            running_var: Tensor::full(&[num_features], 1.0),
            eps: 1e-5,
            momentum: 0.1,
            training: true,
        }
    }

    /// Drop (or restore) the learnable `gamma`/`beta`.
    pub fn with_affine(mut self, affine: bool) -> Self {
        let c = self.num_features();
        if affine {
            self.weight.get_or_insert_with(|| Tensor::full(&[c], 1.0).requires_grad());
            self.bias.get_or_insert_with(|| Tensor::zeros(&[c]).requires_grad());
        } else {
            self.weight = None;
            self.bias = None;
        }
        self
    }

    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn with_eps(mut self, eps: f32) -> Self {
        self.eps = eps;
        self
    }

    pub fn num_features(&self) -> usize {
        self.running_mean.numel()
    }

    pub fn is_affine(&self) -> bool {
        self.weight.is_some()
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn train(&mut self) {
        self.training = true;
    }

    pub fn eval(&mut self) {
        self.training = false;
    }

    pub fn update_running_stats(&self, mean: &[f32], var: &[f32]) {
        let m = self.momentum;
        for (r, &b) in self.running_mean.data_mut().iter_mut().zip(mean) {
            *r = (1.0 - m) * *r + m * b;
        }
        for (r, &b) in self.running_var.data_mut().iter_mut().zip(var) {
            *r = (1.0 - m) * *r + m * b;
        }
    }

    /// `sqrt(var + eps)` per channel.
    pub fn std_of(&self, var: &[f32]) -> Vec<f32> {
        var.iter().map(|&v| (v + self.eps).sqrt()).collect()
    }

    /// Normalize with explicit statistics.
    pub fn normalize(&self, input: &Tensor, mean: &[f32], std: &[f32]) -> Tensor {
        let c = self.num_features();
        let inv_std = Tensor::new(std.iter().map(|s| 1.0 / s).collect(), &[c]);
        let mean = Tensor::new(mean.to_vec(), &[c]);
        let scale = match &self.weight {
            Some(gamma) => gamma * &inv_std,
            None => inv_std,
        };
        let shifted = &mean * &scale;
        let shift = match &self.bias {
            Some(beta) => beta - &shifted,
            None => shifted.mul_scalar(-1.0),
        };
        input.channel_affine(&scale, &shift)
    }
}

impl Module for BatchNorm2d {
    fn forward(&self, input: &Tensor) -> Tensor {
        if self.training {
            let (mean, var) = input.channel_mean_var();
            self.update_running_stats(&mean, &var);
            // normalization itself uses the biased estimate
            let count = (input.numel() / self.num_features()) as f32;
            let biased: Vec<f32> = var.iter().map(|v| v * (count - 1.0).max(0.0) / count).collect();
            self.normalize(input, &mean, &self.std_of(&biased))
        } else {
            let mean = self.running_mean.to_vec();
            let std = self.std_of(&self.running_var.data());
            self.normalize(input, &mean, &std)
        }
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.weight.iter().chain(self.bias.iter()).cloned().collect()
    }
}

/// ReLU activation as a module
pub struct ReLU;

impl Module for ReLU {
    fn forward(&self, input: &Tensor) -> Tensor {
        input.relu()
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MaxPool2d {
    pub kernel_size: (usize, usize),
    pub stride: (usize, usize),
    pub padding: (usize, usize),
}

impl MaxPool2d {
    pub fn new(kernel_size: usize, stride: usize, padding: usize) -> Self {
        Self {
            kernel_size: (kernel_size, kernel_size),
            stride: (stride, stride),
            padding: (padding, padding),
        }
    }
}

impl Module for MaxPool2d {
    fn forward(&self, input: &Tensor) -> Tensor {
        input.max_pool2d(self.kernel_size, self.stride, self.padding)
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }
}

/// `[N, ...] -> [N, prod(...)]`
pub struct Flatten;

impl Module for Flatten {
    fn forward(&self, input: &Tensor) -> Tensor {
        let n = input.shape()[0];
        input.reshape(&[n, input.numel() / n.max(1)])
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }
}

/// A stack of layers applied in sequence.
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
}

impl Sequential {
    pub fn new(layers: Vec<Box<dyn Module>>) -> Self {
        Self { layers }
    }
}

impl Module for Sequential {
    fn forward(&self, input: &Tensor) -> Tensor {
        self.layers.iter().fold(input.clone(), |x, l| l.forward(&x))
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }
}
