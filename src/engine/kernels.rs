// 该文件是 Kanmao （看猫） 项目的一部分。
// src/engine/kernels.rs - 算子实现
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::ops::Range;

use super::{Activation, Operator, Padding, TensorSpec, TensorType};

/// arena 中的一个张量
pub(super) struct Slot<'g> {
  spec: &'g TensorSpec,
  offset: usize,
}

impl<'g> Slot<'g> {
  pub(super) fn new(spec: &'g TensorSpec, range: &Range<usize>) -> Self {
    Self {
      spec,
      offset: range.start,
    }
  }

  fn load(&self, arena: &[u8], i: usize) -> f32 {
    let spec = self.spec;
    match spec.dtype {
      TensorType::UInt8 => {
        (arena[self.offset + i] as i32 - spec.zero_point) as f32 * spec.scale
      }
      TensorType::Int8 => {
        (arena[self.offset + i] as i8 as i32 - spec.zero_point) as f32 * spec.scale
      }
      TensorType::Float32 => {
        let at = self.offset + i * 4;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&arena[at..at + 4]);
        f32::from_le_bytes(raw)
      }
    }
  }

  fn store(&self, arena: &mut [u8], i: usize, v: f32) {
    let spec = self.spec;
    match spec.dtype {
      TensorType::UInt8 => {
        let q = (v / spec.scale).round() as i32 + spec.zero_point;
        arena[self.offset + i] = q.clamp(0, 255) as u8;
      }
      TensorType::Int8 => {
        let q = (v / spec.scale).round() as i32 + spec.zero_point;
        arena[self.offset + i] = q.clamp(-128, 127) as i8 as u8;
      }
      TensorType::Float32 => {
        let at = self.offset + i * 4;
        arena[at..at + 4].copy_from_slice(&v.to_le_bytes());
      }
    }
  }

  fn dims(&self) -> (usize, usize, usize) {
    let s = &self.spec.shape;
    (s[1], s[2], s[3])
  }
}

/// 计算卷积输出尺寸和前侧填充
pub(super) fn conv_out_dim(
  input: usize,
  kernel: usize,
  stride: usize,
  padding: Padding,
) -> Option<(usize, usize)> {
  if kernel == 0 || stride == 0 {
    return None;
  }
  match padding {
    Padding::Same => {
      let out = input.div_ceil(stride);
      let total = ((out - 1) * stride + kernel).saturating_sub(input);
      Some((out, total / 2))
    }
    Padding::Valid => {
      if input < kernel {
        return None;
      }
      Some(((input - kernel) / stride + 1, 0))
    }
  }
}

struct ConvParams<'a> {
  kernel: [usize; 2],
  stride: [usize; 2],
  padding: Padding,
  filter: &'a [f32],
  bias: &'a [f32],
  activation: Activation,
}

/// 执行单个算子，形状在构建解释器时已经校验
pub(super) fn eval(op: &Operator, input: &Slot, output: &Slot, arena: &mut [u8]) {
  match op {
    Operator::Conv2d {
      kernel,
      stride,
      padding,
      filter,
      bias,
      activation,
      ..
    } => conv_2d(
      input,
      output,
      arena,
      &ConvParams {
        kernel: *kernel,
        stride: *stride,
        padding: *padding,
        filter,
        bias,
        activation: *activation,
      },
    ),
    Operator::DepthwiseConv2d {
      kernel,
      stride,
      padding,
      filter,
      bias,
      activation,
      ..
    } => depthwise_conv_2d(
      input,
      output,
      arena,
      &ConvParams {
        kernel: *kernel,
        stride: *stride,
        padding: *padding,
        filter,
        bias,
        activation: *activation,
      },
    ),
    Operator::Quantize { .. } | Operator::Reshape { .. } => copy(input, output, arena),
    Operator::Softmax { beta, .. } => softmax(input, output, arena, *beta),
    Operator::Mean { .. } => mean(input, output, arena),
    Operator::FullyConnected {
      weights,
      bias,
      activation,
      ..
    } => fully_connected(input, output, arena, weights, bias, *activation),
  }
}

fn conv_2d(input: &Slot, output: &Slot, arena: &mut [u8], p: &ConvParams) {
  let (h, w, cin) = input.dims();
  let (oh, ow, cout) = output.dims();
  let [kh, kw] = p.kernel;
  let [sh, sw] = p.stride;
  let pad_t = conv_out_dim(h, kh, sh, p.padding).map_or(0, |d| d.1);
  let pad_l = conv_out_dim(w, kw, sw, p.padding).map_or(0, |d| d.1);

  for oy in 0..oh {
    for ox in 0..ow {
      for oc in 0..cout {
        let mut acc = p.bias.get(oc).copied().unwrap_or(0.0);
        for ky in 0..kh {
          let Some(iy) = (oy * sh + ky).checked_sub(pad_t).filter(|&y| y < h) else {
            continue;
          };
          for kx in 0..kw {
            let Some(ix) = (ox * sw + kx).checked_sub(pad_l).filter(|&x| x < w) else {
              continue;
            };
            let base = (iy * w + ix) * cin;
            let fbase = ((oc * kh + ky) * kw + kx) * cin;
            for ic in 0..cin {
              acc += input.load(arena, base + ic) * p.filter[fbase + ic];
            }
          }
        }
        output.store(arena, (oy * ow + ox) * cout + oc, p.activation.apply(acc));
      }
    }
  }
}

fn depthwise_conv_2d(input: &Slot, output: &Slot, arena: &mut [u8], p: &ConvParams) {
  let (h, w, c) = input.dims();
  let (oh, ow, _) = output.dims();
  let [kh, kw] = p.kernel;
  let [sh, sw] = p.stride;
  let pad_t = conv_out_dim(h, kh, sh, p.padding).map_or(0, |d| d.1);
  let pad_l = conv_out_dim(w, kw, sw, p.padding).map_or(0, |d| d.1);

  for oy in 0..oh {
    for ox in 0..ow {
      for ch in 0..c {
        let mut acc = p.bias.get(ch).copied().unwrap_or(0.0);
        for ky in 0..kh {
          let Some(iy) = (oy * sh + ky).checked_sub(pad_t).filter(|&y| y < h) else {
            continue;
          };
          for kx in 0..kw {
            let Some(ix) = (ox * sw + kx).checked_sub(pad_l).filter(|&x| x < w) else {
              continue;
            };
            acc += input.load(arena, (iy * w + ix) * c + ch) * p.filter[(ky * kw + kx) * c + ch];
          }
        }
        output.store(arena, (oy * ow + ox) * c + ch, p.activation.apply(acc));
      }
    }
  }
}

fn copy(input: &Slot, output: &Slot, arena: &mut [u8]) {
  for i in 0..output.spec.elements() {
    let v = input.load(arena, i);
    output.store(arena, i, v);
  }
}

fn softmax(input: &Slot, output: &Slot, arena: &mut [u8], beta: f32) {
  let depth = input.spec.last_dim();
  let rows = input.spec.elements() / depth;
  for row in 0..rows {
    let base = row * depth;
    let max = (0..depth)
      .map(|i| input.load(arena, base + i))
      .fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = (0..depth)
      .map(|i| ((input.load(arena, base + i) - max) * beta).exp())
      .sum();
    for i in 0..depth {
      let v = ((input.load(arena, base + i) - max) * beta).exp() / sum;
      output.store(arena, base + i, v);
    }
  }
}

/// 对 NHWC 的空间维度求平均
fn mean(input: &Slot, output: &Slot, arena: &mut [u8]) {
  let (h, w, c) = input.dims();
  let pixels = (h * w) as f32;
  for ch in 0..c {
    let sum: f32 = (0..h * w).map(|p| input.load(arena, p * c + ch)).sum();
    output.store(arena, ch, sum / pixels);
  }
}

fn fully_connected(
  input: &Slot,
  output: &Slot,
  arena: &mut [u8],
  weights: &[f32],
  bias: &[f32],
  activation: Activation,
) {
  let n_in = input.spec.elements();
  let n_out = output.spec.elements();
  for o in 0..n_out {
    let row = &weights[o * n_in..(o + 1) * n_in];
    let acc = bias.get(o).copied().unwrap_or(0.0)
      + row
        .iter()
        .enumerate()
        .map(|(i, wt)| input.load(arena, i) * wt)
        .sum::<f32>();
    output.store(arena, o, activation.apply(acc));
  }
}
