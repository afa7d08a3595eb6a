use crate::{ops, tape::Tape};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal, Uniform};
use smallvec::SmallVec;
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::rc::Rc;

#[derive(Clone)]
pub struct Tensor {
    data: Rc<RefCell<Vec<f32>>>,
    pub(crate) shape: SmallVec<[usize; 4]>,
    // In-place gradient accumulation buffer (allocated on demand)
    pub grad: Rc<RefCell<Option<Vec<f32>>>>,
    pub requires_grad: bool,
    pub tape_node: Cell<Option<usize>>,
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("data", &self.data.borrow().as_slice())
            .field("shape", &self.shape)
            .field("requires_grad", &self.requires_grad)
            .field("has_grad", &self.grad.borrow().is_some())
            .finish()
    }
}

impl Tensor {
    pub fn new(data: Vec<f32>, shape: &[usize]) -> Self {
        assert_eq!(
            data.len(),
            shape.iter().product::<usize>(),
            "data length {} does not match shape {:?}",
            data.len(),
            shape
        );
        Tensor {
            data: Rc::new(RefCell::new(data)),
            shape: shape.iter().cloned().collect(),
            grad: Rc::new(RefCell::new(None)),
            requires_grad: false,
            tape_node: Cell::new(None),
        }
    }

    pub fn scalar(value: f32) -> Self {
        Tensor::new(vec![value], &[1])
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Tensor::full(shape, 0.0)
    }

    pub fn full(shape: &[usize], value: f32) -> Self {
        Tensor::new(vec![value; shape.iter().product()], shape)
    }

    /// Standard-normal tensor from the thread rng.
    pub fn randn(shape: &[usize]) -> Tensor {
        Tensor::randn_with(&mut rand::thread_rng(), shape)
    }

    /// Standard-normal tensor from a caller-provided rng (seeded in tests).
    pub fn randn_with<R: Rng + ?Sized>(rng: &mut R, shape: &[usize]) -> Tensor {
        let size: usize = shape.iter().product();
        let data: Vec<f32> = (0..size).map(|_| StandardNormal.sample(&mut *rng)).collect();
        Tensor::new(data, shape)
    }

    /// Uniform tensor in `[low, high)`.
    pub fn uniform_with<R: Rng + ?Sized>(rng: &mut R, shape: &[usize], low: f32, high: f32) -> Tensor {
        let dist = Uniform::new(low, high);
        let size: usize = shape.iter().product();
        let data: Vec<f32> = (0..size).map(|_| dist.sample(&mut *rng)).collect();
        Tensor::new(data, shape)
    }

    pub fn requires_grad(mut self) -> Self {
        self.requires_grad = true;
        self
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn data(&self) -> Ref<'_, Vec<f32>> {
        self.data.borrow()
    }

    pub fn data_mut(&self) -> RefMut<'_, Vec<f32>> {
        self.data.borrow_mut()
    }

    /// Copy of the data, handy for assertions.
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.borrow().clone()
    }

    /// Zero-copy view of gradient buffer, if present.
    pub fn grad_ref(&self) -> Option<Ref<'_, Vec<f32>>> {
        Ref::filter_map(self.grad.borrow(), |g| g.as_ref()).ok()
    }

    /// Materializes a tensor from the grad buffer (allocates).
    pub fn grad(&self) -> Option<Tensor> {
        self.grad
            .borrow()
            .as_ref()
            .map(|g| Tensor::new(g.clone(), &self.shape))
    }

    pub fn backward(&self) {
        // Seed dL/dself = 1
        *self.grad.borrow_mut() = Some(vec![1.0; self.numel()]);

        if let Some(node_id) = self.tape_node.get() {
            crate::tape::backward(node_id);
        }
    }

    pub fn zero_grad(&self) {
        *self.grad.borrow_mut() = None;
    }

    /// New tensor with copied data, cut off from the tape.
    pub fn detach(&self) -> Tensor {
        Tensor::new(self.to_vec(), &self.shape)
    }

    /// Smallest finite element, `None` when there is none.
    pub fn min(&self) -> Option<f32> {
        self.data()
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .fold(None, |acc, v| Some(acc.map_or(v, |m: f32| m.min(v))))
    }

    /// Largest finite element, `None` when there is none.
    pub fn max(&self) -> Option<f32> {
        self.data()
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .fold(None, |acc, v| Some(acc.map_or(v, |m: f32| m.max(v))))
    }

    /// Elementwise map. Not recorded on the tape.
    pub fn map<F: Fn(f32) -> f32>(&self, f: F) -> Tensor {
        let data: Vec<f32> = self.data().iter().map(|&x| f(x)).collect();
        Tensor::new(data, &self.shape)
    }

    pub fn clamp(&self, lo: f32, hi: f32) -> Tensor {
        self.map(|x| x.clamp(lo, hi))
    }

    /// Round half to even.
    pub fn round(&self) -> Tensor {
        self.map(f32::round_ties_even)
    }

    pub fn add_scalar(&self, s: f32) -> Tensor {
        self.map(|x| x + s)
    }

    pub fn mul_scalar(&self, s: f32) -> Tensor {
        self.map(|x| x * s)
    }

    /// Same data viewed with a new shape; gradient passes straight through.
    pub fn reshape(&self, shape: &[usize]) -> Tensor {
        assert_eq!(
            self.numel(),
            shape.iter().product::<usize>(),
            "cannot reshape {:?} into {:?}",
            self.shape,
            shape
        );
        let mut output = Tensor::new(self.to_vec(), shape);

        if self.requires_grad {
            output.requires_grad = true;
            let input = self.clone();
            let out = output.clone();
            Tape::push_unary_op(self, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    ops::accumulate_grad(&input, gout);
                }
            });
        }

        output
    }

    /// Transpose a 2D tensor
    pub fn transpose(&self) -> Tensor {
        assert_eq!(self.shape.len(), 2, "Can only transpose 2D tensors");

        let rows = self.shape[0];
        let cols = self.shape[1];
        let data = self.data();

        let mut result = vec![0.0; data.len()];
        for i in 0..rows {
            for j in 0..cols {
                result[j * rows + i] = data[i * cols + j];
            }
        }

        let mut output = Tensor::new(result, &[cols, rows]);

        if self.requires_grad {
            output.requires_grad = true;

            let input = self.clone();
            let out = output.clone();

            Tape::push_unary_op(self, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    // gout is [cols, rows], input grad is [rows, cols]
                    let mut g = vec![0.0; rows * cols];
                    for i in 0..rows {
                        for j in 0..cols {
                            g[i * cols + j] = gout[j * rows + i];
                        }
                    }
                    ops::accumulate_grad(&input, &g);
                }
            });
        }

        output
    }

    /// Supports adding [batch, features] + [features] -> [batch, features]
    pub fn add_broadcast(&self, other: &Tensor) -> Tensor {
        if self.shape == other.shape {
            return self + other;
        }

        assert!(
            self.shape.len() == 2 && other.shape.len() == 1 && self.shape[1] == other.shape[0],
            "Unsupported broadcasting shapes: {:?} and {:?}",
            self.shape,
            other.shape
        );

        let batch_size = self.shape[0];
        let features = self.shape[1];
        let result: Vec<f32> = {
            let self_data = self.data();
            let other_data = other.data();
            self_data
                .iter()
                .enumerate()
                .map(|(idx, &x)| x + other_data[idx % features])
                .collect()
        };

        let mut output = Tensor::new(result, &self.shape);

        if self.requires_grad || other.requires_grad {
            output.requires_grad = true;

            let a = self.clone();
            let b = other.clone();
            let out = output.clone();

            Tape::push_binary_op(self, other, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    if a.requires_grad {
                        ops::accumulate_grad(&a, gout);
                    }
                    // dL/dB[f] = sum_b dL/dY[b,f]
                    if b.requires_grad {
                        let mut bias_grad = vec![0.0; features];
                        for batch in 0..batch_size {
                            for f in 0..features {
                                bias_grad[f] += gout[batch * features + f];
                            }
                        }
                        ops::accumulate_grad(&b, &bias_grad);
                    }
                }
            });
        }

        output
    }

    /// Mean of all elements
    pub fn mean(&self) -> Tensor {
        let n = self.numel() as f32;
        let mut output = Tensor::scalar(self.data().iter().sum::<f32>() / n);

        if self.requires_grad {
            output.requires_grad = true;

            let input = self.clone();
            let out = output.clone();

            Tape::push_unary_op(self, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    let grad_vec = vec![gout[0] / n; input.numel()];
                    ops::accumulate_grad(&input, &grad_vec);
                }
            });
        }

        output
    }

    /// Sum of all elements
    pub fn sum(&self) -> Tensor {
        let mut output = Tensor::scalar(self.data().iter().sum::<f32>());

        if self.requires_grad {
            output.requires_grad = true;

            let input = self.clone();
            let out = output.clone();

            Tape::push_unary_op(self, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    let grad_vec = vec![gout[0]; input.numel()];
                    ops::accumulate_grad(&input, &grad_vec);
                }
            });
        }

        output
    }
}
