use crate::{tape::Tape, Tensor};
use std::ops::{Add, Mul, Sub};

fn zip_with(a: &Tensor, b: &Tensor, f: impl Fn(f32, f32) -> f32) -> Tensor {
    assert_eq!(
        a.shape(),
        b.shape(),
        "Tensor dimensions must match"
    );
    let out: Vec<f32> = a
        .data()
        .iter()
        .zip(b.data().iter())
        .map(|(&x, &y)| f(x, y))
        .collect();
    Tensor::new(out, a.shape())
}

impl Add for &Tensor {
    type Output = Tensor;
    fn add(self, other: &Tensor) -> Tensor {
        let mut out = zip_with(self, other, |x, y| x + y);

        if self.requires_grad || other.requires_grad {
            out.requires_grad = true;
            let a = self.clone();
            let b = other.clone();
            let o = out.clone();

            Tape::push_binary_op(self, other, &out, move || {
                if let Some(gout) = o.grad.borrow().as_ref() {
                    if a.requires_grad {
                        accumulate_grad(&a, gout);
                    }
                    if b.requires_grad {
                        accumulate_grad(&b, gout);
                    }
                }
            });
        }
        out
    }
}

impl Sub for &Tensor {
    type Output = Tensor;
    fn sub(self, other: &Tensor) -> Tensor {
        let mut out = zip_with(self, other, |x, y| x - y);

        if self.requires_grad || other.requires_grad {
            out.requires_grad = true;
            let a = self.clone();
            let b = other.clone();
            let o = out.clone();

            Tape::push_binary_op(self, other, &out, move || {
                if let Some(gout) = o.grad.borrow().as_ref() {
                    if a.requires_grad {
                        accumulate_grad(&a, gout);
                    }
                    if b.requires_grad {
                        accumulate_grad_scaled(&b, gout, -1.0);
                    }
                }
            });
        }
        out
    }
}

impl Mul for &Tensor {
    type Output = Tensor;
    fn mul(self, other: &Tensor) -> Tensor {
        let mut out = zip_with(self, other, |x, y| x * y);

        if self.requires_grad || other.requires_grad {
            out.requires_grad = true;
            let a = self.clone();
            let b = other.clone();
            let o = out.clone();

            Tape::push_binary_op(self, other, &out, move || {
                if let Some(gout) = o.grad.borrow().as_ref() {
                    if a.requires_grad {
                        let ga: Vec<f32> = gout.iter().zip(b.data().iter()).map(|(g, y)| g * y).collect();
                        accumulate_grad(&a, &ga);
                    }
                    if b.requires_grad {
                        let gb: Vec<f32> = gout.iter().zip(a.data().iter()).map(|(g, x)| g * x).collect();
                        accumulate_grad(&b, &gb);
                    }
                }
            });
        }
        out
    }
}

#[inline]
pub fn accumulate_grad(t: &Tensor, src: &[f32]) {
    accumulate_grad_scaled(t, src, 1.0);
}

#[inline]
pub fn accumulate_grad_scaled(t: &Tensor, src: &[f32], scale: f32) {
    let mut slot = t.grad.borrow_mut();
    let g = slot.get_or_insert_with(|| vec![0.0; src.len()]);
    debug_assert_eq!(g.len(), src.len(), "gradient length mismatch");
    for (gi, &s) in g.iter_mut().zip(src) {
        *gi += scale * s;
    }
}

// Implement other trait combinations
macro_rules! forward_owned_binop {
    ($trait:ident, $method:ident) => {
        impl $trait<&Tensor> for Tensor {
            type Output = Tensor;
            fn $method(self, other: &Tensor) -> Tensor {
                (&self).$method(other)
            }
        }

        impl $trait<Tensor> for &Tensor {
            type Output = Tensor;
            fn $method(self, other: Tensor) -> Tensor {
                self.$method(&other)
            }
        }

        impl $trait for Tensor {
            type Output = Tensor;
            fn $method(self, other: Tensor) -> Tensor {
                (&self).$method(&other)
            }
        }
    };
}

forward_owned_binop!(Add, add);
forward_owned_binop!(Sub, sub);
forward_owned_binop!(Mul, mul);

impl Tensor {
    /// Matrix multiplication `[m, k] @ [k, n] -> [m, n]`.
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        assert_eq!(self.shape.len(), 2, "First tensor must be 2D");
        assert_eq!(other.shape.len(), 2, "Second tensor must be 2D");

        let m = self.shape[0];
        let k = self.shape[1];
        let n = other.shape[1];

        assert_eq!(
            k, other.shape[0],
            "Inner dimensions must match: {}x{} @ {}x{}",
            m, k, other.shape[0], n
        );

        let mut result = vec![0.0f32; m * n];
        {
            let a_data = self.data();
            let b_data = other.data();
            // i-k-j order keeps the inner loop contiguous in both b and result
            for i in 0..m {
                let row = &mut result[i * n..(i + 1) * n];
                for kk in 0..k {
                    let aik = a_data[i * k + kk];
                    if aik == 0.0 {
                        continue;
                    }
                    let b_row = &b_data[kk * n..(kk + 1) * n];
                    for (r, &bv) in row.iter_mut().zip(b_row) {
                        *r += aik * bv;
                    }
                }
            }
        }

        let mut output = Tensor::new(result, &[m, n]);

        if self.requires_grad || other.requires_grad {
            output.requires_grad = true;

            let a = self.clone();
            let b = other.clone();
            let out = output.clone();

            Tape::push_binary_op(self, other, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    if a.requires_grad {
                        // dL/dA = dL/dC @ B^T
                        let bdat = b.data();
                        let mut ga = vec![0.0; m * k];
                        for i in 0..m {
                            for j in 0..k {
                                let mut acc = 0.0;
                                for t in 0..n {
                                    acc += gout[i * n + t] * bdat[j * n + t];
                                }
                                ga[i * k + j] = acc;
                            }
                        }
                        accumulate_grad(&a, &ga);
                    }
                    if b.requires_grad {
                        // dL/dB = A^T @ dL/dC
                        let adat = a.data();
                        let mut gb = vec![0.0; k * n];
                        for i in 0..k {
                            for j in 0..n {
                                let mut acc = 0.0;
                                for t in 0..m {
                                    acc += adat[t * k + i] * gout[t * n + j];
                                }
                                gb[i * n + j] = acc;
                            }
                        }
                        accumulate_grad(&b, &gb);
                    }
                }
            });
        }

        output
    }

    /// `y = x Wᵀ + b` with `W: [out, in]`.
    pub fn linear(&self, weight: &Tensor, bias: Option<&Tensor>) -> Tensor {
        let out = self.matmul(&weight.transpose());
        match bias {
            Some(b) => out.add_broadcast(b),
            None => out,
        }
    }

    pub fn relu(&self) -> Tensor {
        let mut output = self.map(|x| x.max(0.0));

        if self.requires_grad {
            output.requires_grad = true;
            let input = self.clone();
            let out = output.clone();

            Tape::push_unary_op(self, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    let gin: Vec<f32> = gout
                        .iter()
                        .zip(input.data().iter())
                        .map(|(&g, &v)| if v > 0.0 { g } else { 0.0 })
                        .collect();
                    accumulate_grad(&input, &gin);
                }
            });
        }

        output
    }

    /// Multiply every slice along dim 0 by the matching entry of `factors`.
    ///
    /// Used to fold per-output-channel scales into a weight tensor
    /// (`[out, ...] * [out]`).
    pub fn scale_rows(&self, factors: &Tensor) -> Tensor {
        let rows = self.shape[0];
        assert_eq!(
            factors.shape(),
            &[rows],
            "scale_rows: factors {:?} do not match leading dim of {:?}",
            factors.shape(),
            self.shape
        );
        let inner = self.numel() / rows.max(1);

        let result: Vec<f32> = {
            let x = self.data();
            let f = factors.data();
            x.iter()
                .enumerate()
                .map(|(i, &v)| v * f[i / inner])
                .collect()
        };
        let mut output = Tensor::new(result, &self.shape);

        if self.requires_grad || factors.requires_grad {
            output.requires_grad = true;
            let x = self.clone();
            let f = factors.clone();
            let out = output.clone();

            Tape::push_binary_op(self, factors, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    if x.requires_grad {
                        let fd = f.data();
                        let gx: Vec<f32> = gout
                            .iter()
                            .enumerate()
                            .map(|(i, &g)| g * fd[i / inner])
                            .collect();
                        accumulate_grad(&x, &gx);
                    }
                    if f.requires_grad {
                        let xd = x.data();
                        let mut gf = vec![0.0; rows];
                        for (i, &g) in gout.iter().enumerate() {
                            gf[i / inner] += g * xd[i];
                        }
                        accumulate_grad(&f, &gf);
                    }
                }
            });
        }

        output
    }

    /// Per-channel affine `y[n,c,..] = x[n,c,..] * scale[c] + shift[c]` over
    /// NCHW data.
    pub fn channel_affine(&self, scale: &Tensor, shift: &Tensor) -> Tensor {
        assert!(self.shape.len() >= 2, "channel_affine expects [N, C, ...] input");
        let (batch, channels) = (self.shape[0], self.shape[1]);
        assert_eq!(scale.shape(), &[channels], "scale must be [C]");
        assert_eq!(shift.shape(), &[channels], "shift must be [C]");
        let plane = self.numel() / (batch * channels).max(1);
        let channel_of = move |i: usize| (i / plane) % channels;

        let result: Vec<f32> = {
            let x = self.data();
            let a = scale.data();
            let b = shift.data();
            x.iter()
                .enumerate()
                .map(|(i, &v)| {
                    let c = channel_of(i);
                    v * a[c] + b[c]
                })
                .collect()
        };
        let mut output = Tensor::new(result, &self.shape);

        let inputs = [self, scale, shift];
        if inputs.iter().any(|t| t.requires_grad) {
            output.requires_grad = true;
            let x = self.clone();
            let a = scale.clone();
            let b = shift.clone();
            let out = output.clone();

            Tape::push_op(&inputs, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    if x.requires_grad {
                        let ad = a.data();
                        let gx: Vec<f32> = gout
                            .iter()
                            .enumerate()
                            .map(|(i, &g)| g * ad[channel_of(i)])
                            .collect();
                        accumulate_grad(&x, &gx);
                    }
                    if a.requires_grad {
                        let xd = x.data();
                        let mut ga = vec![0.0; channels];
                        for (i, &g) in gout.iter().enumerate() {
                            ga[channel_of(i)] += g * xd[i];
                        }
                        accumulate_grad(&a, &ga);
                    }
                    if b.requires_grad {
                        let mut gb = vec![0.0; channels];
                        for (i, &g) in gout.iter().enumerate() {
                            gb[channel_of(i)] += g;
                        }
                        accumulate_grad(&b, &gb);
                    }
                }
            });
        }

        output
    }

    /// Per-channel mean and unbiased variance of NCHW data. Not recorded on
    /// the tape.
    pub fn channel_mean_var(&self) -> (Vec<f32>, Vec<f32>) {
        assert!(self.shape.len() >= 2, "channel_mean_var expects [N, C, ...] input");
        let (batch, channels) = (self.shape[0], self.shape[1]);
        let plane = self.numel() / (batch * channels).max(1);
        let count = batch * plane;
        let guard = self.data();
        let data: &[f32] = &guard;

        let mut mean = vec![0.0f32; channels];
        let mut var = vec![0.0f32; channels];
        for c in 0..channels {
            let values = (0..batch).flat_map(move |n| {
                let start = (n * channels + c) * plane;
                data[start..start + plane].iter().copied()
            });
            let sum: f64 = values.clone().map(f64::from).sum();
            let m = sum / count as f64;
            let sq: f64 = values.map(|v| (f64::from(v) - m).powi(2)).sum();
            mean[c] = m as f32;
            var[c] = if count > 1 { (sq / (count - 1) as f64) as f32 } else { 0.0 };
        }
        (mean, var)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Tape;
    use approx::assert_abs_diff_eq;

    #[test]
    fn sub_grads() {
        Tape::reset();
        let a = Tensor::new(vec![1.0, 2.0], &[2]).requires_grad();
        let b = Tensor::new(vec![3.0, 5.0], &[2]).requires_grad();
        let c = (&a - &b).sum();
        c.backward();
        assert_eq!(a.grad().unwrap().to_vec(), vec![1.0, 1.0]);
        assert_eq!(b.grad().unwrap().to_vec(), vec![-1.0, -1.0]);
    }

    #[test]
    fn linear_matches_manual() {
        let x = Tensor::new(vec![1.0, 2.0, 3.0], &[1, 3]);
        let w = Tensor::new(vec![1.0, 0.0, -1.0, 0.5, 0.5, 0.5], &[2, 3]);
        let b = Tensor::new(vec![0.25, -0.25], &[2]);
        let y = x.linear(&w, Some(&b));
        assert_eq!(y.shape(), &[1, 2]);
        assert_abs_diff_eq!(y.data()[0], -2.0 + 0.25, epsilon = 1e-6);
        assert_abs_diff_eq!(y.data()[1], 3.0 - 0.25, epsilon = 1e-6);
    }

    #[test]
    fn scale_rows_grads() {
        Tape::reset();
        let w = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).requires_grad();
        let f = Tensor::new(vec![2.0, -1.0], &[2]).requires_grad();
        let y = w.scale_rows(&f);
        assert_eq!(y.to_vec(), vec![2.0, 4.0, -3.0, -4.0]);
        y.sum().backward();
        assert_eq!(w.grad().unwrap().to_vec(), vec![2.0, 2.0, -1.0, -1.0]);
        assert_eq!(f.grad().unwrap().to_vec(), vec![3.0, 7.0]);
    }

    #[test]
    fn channel_affine_and_stats() {
        // N=2, C=2, 1x2 planes
        let x = Tensor::new(vec![1.0, 3.0, 10.0, 10.0, 5.0, 7.0, 20.0, 20.0], &[2, 2, 1, 2]);
        let (mean, var) = x.channel_mean_var();
        assert_abs_diff_eq!(mean[0], 4.0, epsilon = 1e-6);
        assert_abs_diff_eq!(mean[1], 15.0, epsilon = 1e-6);
        // channel 0 values 1,3,5,7: unbiased var = 20/3
        assert_abs_diff_eq!(var[0], 20.0 / 3.0, epsilon = 1e-5);

        let scale = Tensor::new(vec![2.0, 0.0], &[2]);
        let shift = Tensor::new(vec![0.0, 1.0], &[2]);
        let y = x.channel_affine(&scale, &shift);
        assert_eq!(y.to_vec(), vec![2.0, 6.0, 1.0, 1.0, 10.0, 14.0, 1.0, 1.0]);
    }
}
