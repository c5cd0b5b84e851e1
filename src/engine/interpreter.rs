// 该文件是 Kanmao （看猫） 项目的一部分。
// src/engine/interpreter.rs - 解释器
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

use tracing::{debug, info};

use super::kernels::{self, Slot};
use super::{Arena, EngineError, Graph, Model, OpResolver, Operator, TensorSpec, TensorType};

const TENSOR_ALIGNMENT: usize = 16;

/// 绑定了模型与算子注册表的解释器
///
/// 构建时完成全部校验，`allocate_tensors` 只做 arena 内的偏移规划，
/// 之后每次 `invoke` 都不会再分配内存。
#[derive(Debug)]
pub struct Interpreter {
  graph: Graph,
  plan: Option<Vec<Range<usize>>>,
  used: usize,
}

fn invalid(msg: impl Into<String>) -> EngineError {
  EngineError::InvalidGraph(msg.into())
}

fn check_nhwc(t: &TensorSpec) -> Result<(), EngineError> {
  if t.shape.len() != 4 || t.shape[0] != 1 {
    return Err(invalid(format!(
      "张量 {} 需要 [1, H, W, C] 形状, 实际 {:?}",
      t.name, t.shape
    )));
  }
  Ok(())
}

fn check_spatial(
  input: &TensorSpec,
  output: &TensorSpec,
  kernel: [usize; 2],
  stride: [usize; 2],
  padding: super::Padding,
) -> Result<(), EngineError> {
  for axis in 0..2 {
    let expected = kernels::conv_out_dim(input.shape[axis + 1], kernel[axis], stride[axis], padding)
      .map(|d| d.0)
      .ok_or_else(|| invalid(format!("张量 {} 的卷积参数无效", input.name)))?;
    if output.shape[axis + 1] != expected {
      return Err(invalid(format!(
        "张量 {} 第 {} 维应为 {}, 实际 {}",
        output.name,
        axis + 1,
        expected,
        output.shape[axis + 1]
      )));
    }
  }
  Ok(())
}

fn check_bias(bias: &[f32], n: usize) -> Result<(), EngineError> {
  if !bias.is_empty() && bias.len() != n {
    return Err(invalid(format!("偏置长度 {} 与输出通道 {} 不一致", bias.len(), n)));
  }
  Ok(())
}

fn validate_operator(op: &Operator, tensors: &[TensorSpec]) -> Result<(), EngineError> {
  let (i, o) = op.io();
  if i >= tensors.len() || o >= tensors.len() {
    return Err(invalid(format!("算子 {:?} 引用了不存在的张量", op.opcode())));
  }
  if i == o {
    return Err(invalid(format!("算子 {:?} 的输入输出是同一张量", op.opcode())));
  }
  let (input, output) = (&tensors[i], &tensors[o]);

  match op {
    Operator::Conv2d {
      kernel,
      stride,
      padding,
      filter,
      bias,
      ..
    } => {
      check_nhwc(input)?;
      check_nhwc(output)?;
      check_spatial(input, output, *kernel, *stride, *padding)?;
      let (cin, cout) = (input.shape[3], output.shape[3]);
      if filter.len() != cout * kernel[0] * kernel[1] * cin {
        return Err(invalid(format!("conv_2d 卷积核长度 {} 不正确", filter.len())));
      }
      check_bias(bias, cout)
    }
    Operator::DepthwiseConv2d {
      kernel,
      stride,
      padding,
      filter,
      bias,
      ..
    } => {
      check_nhwc(input)?;
      check_nhwc(output)?;
      check_spatial(input, output, *kernel, *stride, *padding)?;
      let c = input.shape[3];
      if output.shape[3] != c {
        return Err(invalid("depthwise_conv_2d 输入输出通道数不一致"));
      }
      if filter.len() != kernel[0] * kernel[1] * c {
        return Err(invalid(format!(
          "depthwise_conv_2d 卷积核长度 {} 不正确",
          filter.len()
        )));
      }
      check_bias(bias, c)
    }
    Operator::Quantize { .. } | Operator::Reshape { .. } => {
      if input.elements() != output.elements() {
        return Err(invalid(format!(
          "{} 与 {} 元素数不一致",
          input.name, output.name
        )));
      }
      Ok(())
    }
    Operator::Softmax { .. } => {
      if input.elements() != output.elements() || input.last_dim() == 0 {
        return Err(invalid("softmax 输入输出形状不一致"));
      }
      Ok(())
    }
    Operator::Mean { .. } => {
      check_nhwc(input)?;
      if output.elements() != input.shape[3] {
        return Err(invalid(format!(
          "mean 输出应有 {} 个元素, 实际 {}",
          input.shape[3],
          output.elements()
        )));
      }
      Ok(())
    }
    Operator::FullyConnected { weights, bias, .. } => {
      let (n_in, n_out) = (input.elements(), output.elements());
      if weights.len() != n_in * n_out {
        return Err(invalid(format!(
          "fully_connected 权重长度 {} 不等于 {} x {}",
          weights.len(),
          n_out,
          n_in
        )));
      }
      check_bias(bias, n_out)
    }
  }
}

fn align_up(n: usize) -> usize {
  n.div_ceil(TENSOR_ALIGNMENT) * TENSOR_ALIGNMENT
}

impl Interpreter {
  pub fn new<const N: usize>(model: &Model, resolver: &OpResolver<N>) -> Result<Self, EngineError> {
    let graph = model.graph().clone();

    for op in &graph.operators {
      if !resolver.contains(op.opcode()) {
        return Err(EngineError::UnsupportedOperator(op.opcode()));
      }
    }

    if graph.input >= graph.tensors.len() || graph.output >= graph.tensors.len() {
      return Err(invalid("输入或输出张量下标越界"));
    }
    for t in &graph.tensors {
      if t.elements() == 0 {
        return Err(invalid(format!("张量 {} 为空", t.name)));
      }
      if t.dtype != TensorType::Float32 && !(t.scale.is_finite() && t.scale > 0.0) {
        return Err(invalid(format!("张量 {} 的量化 scale 无效", t.name)));
      }
    }
    for op in &graph.operators {
      validate_operator(op, &graph.tensors)?;
    }

    debug!(
      "解释器就绪: {} 个张量, {} 个算子",
      graph.tensors.len(),
      graph.operators.len()
    );
    Ok(Self {
      graph,
      plan: None,
      used: 0,
    })
  }

  /// 在 arena 中为每个张量规划一段对齐的区间
  pub fn allocate_tensors(&mut self, arena: &Arena) -> Result<(), EngineError> {
    let mut offset = 0;
    let mut plan = Vec::with_capacity(self.graph.tensors.len());
    for t in &self.graph.tensors {
      let start = align_up(offset);
      let end = start + t.bytes();
      plan.push(start..end);
      offset = end;
    }

    if offset > arena.len() {
      return Err(EngineError::OutOfMemory {
        required: offset,
        available: arena.len(),
      });
    }

    info!("张量分配完成: 使用 {} / {} 字节", offset, arena.len());
    self.plan = Some(plan);
    self.used = offset;
    Ok(())
  }

  pub fn arena_used_bytes(&self) -> usize {
    self.used
  }

  pub fn input(&self) -> &TensorSpec {
    &self.graph.tensors[self.graph.input]
  }

  pub fn output(&self) -> &TensorSpec {
    &self.graph.tensors[self.graph.output]
  }

  fn range(&self, index: usize, arena: &Arena) -> Result<Range<usize>, EngineError> {
    let plan = self.plan.as_ref().ok_or(EngineError::NotAllocated)?;
    if arena.len() < self.used {
      return Err(EngineError::NotAllocated);
    }
    Ok(plan[index].clone())
  }

  /// 输入张量在 arena 中的原始字节
  pub fn input_buffer<'a>(&self, arena: &'a mut Arena) -> Result<&'a mut [u8], EngineError> {
    let range = self.range(self.graph.input, arena)?;
    Ok(&mut arena.bytes_mut()[range])
  }

  pub fn output_buffer<'a>(&self, arena: &'a Arena) -> Result<&'a [u8], EngineError> {
    let range = self.range(self.graph.output, arena)?;
    Ok(&arena.bytes()[range])
  }

  pub fn invoke(&self, arena: &mut Arena) -> Result<(), EngineError> {
    let plan = self.plan.as_ref().ok_or(EngineError::NotAllocated)?;
    if arena.len() < self.used {
      return Err(EngineError::NotAllocated);
    }

    let bytes = arena.bytes_mut();
    for op in &self.graph.operators {
      let (i, o) = op.io();
      let input = Slot::new(&self.graph.tensors[i], &plan[i]);
      let output = Slot::new(&self.graph.tensors[o], &plan[o]);
      kernels::eval(op, &input, &output, bytes);
    }
    Ok(())
  }
}
