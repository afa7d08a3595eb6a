//! 2D convolution and max pooling over NCHW tensors.
//!
//! Both kernels work on plain `f32` storage, so the same code path serves the
//! floating-point observe pass and the integer-valued frozen pass.

use crate::ops::accumulate_grad;
use crate::{tape::Tape, Tensor};
use rayon::prelude::*;

/// Stride/padding/dilation/groups of a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub stride: (usize, usize),
    pub padding: (usize, usize),
    pub dilation: (usize, usize),
    pub groups: usize,
}

impl Default for ConvGeometry {
    fn default() -> Self {
        Self {
            stride: (1, 1),
            padding: (0, 0),
            dilation: (1, 1),
            groups: 1,
        }
    }
}

impl ConvGeometry {
    pub fn with_stride(mut self, stride: (usize, usize)) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_padding(mut self, padding: (usize, usize)) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_dilation(mut self, dilation: (usize, usize)) -> Self {
        self.dilation = dilation;
        self
    }

    pub fn with_groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    fn output_dim(&self, input: usize, kernel: usize, axis: usize) -> usize {
        let (stride, padding, dilation) = match axis {
            0 => (self.stride.0, self.padding.0, self.dilation.0),
            _ => (self.stride.1, self.padding.1, self.dilation.1),
        };
        let span = dilation * (kernel - 1) + 1;
        assert!(
            input + 2 * padding >= span,
            "kernel span {} exceeds padded input {}",
            span,
            input + 2 * padding
        );
        (input + 2 * padding - span) / stride + 1
    }
}

#[derive(Clone, Copy)]
struct ConvDims {
    n: usize,
    c_in: usize,
    h: usize,
    w: usize,
    c_out: usize,
    kh: usize,
    kw: usize,
    oh: usize,
    ow: usize,
    cin_per_group: usize,
    cout_per_group: usize,
}

impl ConvDims {
    /// Input coordinate hit by output `(oy, ox)` and kernel tap `(ky, kx)`,
    /// `None` when it falls into padding.
    #[inline]
    fn input_pos(&self, g: &ConvGeometry, oy: usize, ox: usize, ky: usize, kx: usize) -> Option<(usize, usize)> {
        let iy = (oy * g.stride.0 + ky * g.dilation.0) as isize - g.padding.0 as isize;
        let ix = (ox * g.stride.1 + kx * g.dilation.1) as isize - g.padding.1 as isize;
        if iy < 0 || ix < 0 || iy >= self.h as isize || ix >= self.w as isize {
            None
        } else {
            Some((iy as usize, ix as usize))
        }
    }
}

impl Tensor {
    /// Cross-correlation of `[N, C_in, H, W]` with `[C_out, C_in / groups, kH, kW]`.
    pub fn conv2d(&self, weight: &Tensor, bias: Option<&Tensor>, geometry: ConvGeometry) -> Tensor {
        assert_eq!(self.shape.len(), 4, "conv2d input must be [N, C, H, W]");
        assert_eq!(weight.shape.len(), 4, "conv2d weight must be [C_out, C_in/groups, kH, kW]");
        let groups = geometry.groups;
        let (n, c_in, h, w) = (self.shape[0], self.shape[1], self.shape[2], self.shape[3]);
        let (c_out, cin_per_group, kh, kw) = (weight.shape[0], weight.shape[1], weight.shape[2], weight.shape[3]);
        assert!(groups > 0 && c_in % groups == 0 && c_out % groups == 0, "channels not divisible by groups");
        assert_eq!(cin_per_group * groups, c_in, "weight in-channels do not match input");
        if let Some(b) = bias {
            assert_eq!(b.shape(), &[c_out], "bias must be [C_out]");
        }

        let dims = ConvDims {
            n,
            c_in,
            h,
            w,
            c_out,
            kh,
            kw,
            oh: geometry.output_dim(h, kh, 0),
            ow: geometry.output_dim(w, kw, 1),
            cin_per_group,
            cout_per_group: c_out / groups,
        };
        let plane = dims.oh * dims.ow;

        let mut result = vec![0.0f32; n * c_out * plane];
        {
            let x_guard = self.data();
            let w_guard = weight.data();
            let b_guard = bias.map(|b| b.data());
            let x: &[f32] = &x_guard;
            let wt: &[f32] = &w_guard;
            let b: Option<&[f32]> = b_guard.as_deref().map(|v| v.as_slice());

            result
                .par_chunks_mut(plane.max(1))
                .enumerate()
                .for_each(|(idx, out)| {
                    let (batch, oc) = (idx / c_out, idx % c_out);
                    let group = oc / dims.cout_per_group;
                    let base = b.map_or(0.0, |b| b[oc]);
                    for oy in 0..dims.oh {
                        for ox in 0..dims.ow {
                            let mut acc = base;
                            for icg in 0..dims.cin_per_group {
                                let ic = group * dims.cin_per_group + icg;
                                let x_plane = &x[(batch * dims.c_in + ic) * dims.h * dims.w..];
                                let w_plane = &wt[(oc * dims.cin_per_group + icg) * dims.kh * dims.kw..];
                                for ky in 0..dims.kh {
                                    for kx in 0..dims.kw {
                                        if let Some((iy, ix)) = dims.input_pos(&geometry, oy, ox, ky, kx) {
                                            acc += x_plane[iy * dims.w + ix] * w_plane[ky * dims.kw + kx];
                                        }
                                    }
                                }
                            }
                            out[oy * dims.ow + ox] = acc;
                        }
                    }
                });
        }

        let mut output = Tensor::new(result, &[n, c_out, dims.oh, dims.ow]);

        let bias_requires = bias.is_some_and(|b| b.requires_grad);
        if self.requires_grad || weight.requires_grad || bias_requires {
            output.requires_grad = true;
            let input = self.clone();
            let wgt = weight.clone();
            let bs = bias.cloned();
            let out = output.clone();

            let mut inputs = vec![self, weight];
            if let Some(b) = bias {
                inputs.push(b);
            }
            Tape::push_op(&inputs, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    conv2d_backward(&input, &wgt, bs.as_ref(), gout, &geometry, dims);
                }
            });
        }

        output
    }

    /// Max pooling with a `(kH, kW)` window; padded cells never win.
    pub fn max_pool2d(&self, kernel: (usize, usize), stride: (usize, usize), padding: (usize, usize)) -> Tensor {
        assert_eq!(self.shape.len(), 4, "max_pool2d input must be [N, C, H, W]");
        assert!(
            padding.0 * 2 <= kernel.0 && padding.1 * 2 <= kernel.1,
            "pad should be at most half of kernel size"
        );
        let (n, c, h, w) = (self.shape[0], self.shape[1], self.shape[2], self.shape[3]);
        assert!(h + 2 * padding.0 >= kernel.0 && w + 2 * padding.1 >= kernel.1, "pool window larger than input");
        let oh = (h + 2 * padding.0 - kernel.0) / stride.0 + 1;
        let ow = (w + 2 * padding.1 - kernel.1) / stride.1 + 1;

        let mut result = vec![0.0f32; n * c * oh * ow];
        let mut argmax = vec![0usize; result.len()];
        {
            let x = self.data();
            for nc in 0..n * c {
                let in_base = nc * h * w;
                for oy in 0..oh {
                    for ox in 0..ow {
                        let mut best = f32::NEG_INFINITY;
                        let mut best_idx = usize::MAX;
                        for ky in 0..kernel.0 {
                            for kx in 0..kernel.1 {
                                let iy = (oy * stride.0 + ky) as isize - padding.0 as isize;
                                let ix = (ox * stride.1 + kx) as isize - padding.1 as isize;
                                if iy < 0 || ix < 0 || iy >= h as isize || ix >= w as isize {
                                    continue;
                                }
                                let i = in_base + iy as usize * w + ix as usize;
                                if best_idx == usize::MAX || x[i] > best {
                                    best = x[i];
                                    best_idx = i;
                                }
                            }
                        }
                        let o = (nc * oh + oy) * ow + ox;
                        result[o] = best;
                        argmax[o] = best_idx;
                    }
                }
            }
        }

        let mut output = Tensor::new(result, &[n, c, oh, ow]);

        if self.requires_grad {
            output.requires_grad = true;
            let input = self.clone();
            let out = output.clone();
            Tape::push_unary_op(self, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    let mut gin = vec![0.0; input.numel()];
                    for (&g, &src) in gout.iter().zip(argmax.iter()) {
                        gin[src] += g;
                    }
                    accumulate_grad(&input, &gin);
                }
            });
        }

        output
    }
}

fn conv2d_backward(
    input: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    gout: &[f32],
    geometry: &ConvGeometry,
    d: ConvDims,
) {
    let x = input.data();
    let wt = weight.data();
    let mut gx = input.requires_grad.then(|| vec![0.0f32; x.len()]);
    let mut gw = weight.requires_grad.then(|| vec![0.0f32; wt.len()]);

    for batch in 0..d.n {
        for oc in 0..d.c_out {
            let group = oc / d.cout_per_group;
            let g_plane = &gout[(batch * d.c_out + oc) * d.oh * d.ow..];
            for icg in 0..d.cin_per_group {
                let ic = group * d.cin_per_group + icg;
                let x_base = (batch * d.c_in + ic) * d.h * d.w;
                let w_base = (oc * d.cin_per_group + icg) * d.kh * d.kw;
                for oy in 0..d.oh {
                    for ox in 0..d.ow {
                        let g = g_plane[oy * d.ow + ox];
                        if g == 0.0 {
                            continue;
                        }
                        for ky in 0..d.kh {
                            for kx in 0..d.kw {
                                if let Some((iy, ix)) = d.input_pos(geometry, oy, ox, ky, kx) {
                                    let xi = x_base + iy * d.w + ix;
                                    let wi = w_base + ky * d.kw + kx;
                                    if let Some(gx) = gx.as_mut() {
                                        gx[xi] += g * wt[wi];
                                    }
                                    if let Some(gw) = gw.as_mut() {
                                        gw[wi] += g * x[xi];
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    drop((x, wt));

    if let Some(gx) = gx {
        accumulate_grad(input, &gx);
    }
    if let Some(gw) = gw {
        accumulate_grad(weight, &gw);
    }
    if let Some(b) = bias.filter(|b| b.requires_grad) {
        let plane = d.oh * d.ow;
        let mut gb = vec![0.0f32; d.c_out];
        for (i, chunk) in gout.chunks(plane.max(1)).enumerate() {
            gb[i % d.c_out] += chunk.iter().sum::<f32>();
        }
        accumulate_grad(b, &gb);
    }
}
