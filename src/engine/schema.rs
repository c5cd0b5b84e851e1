// 该文件是 Kanmao （看猫） 项目的一部分。
// src/engine/schema.rs - 模型格式
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

use serde::{Deserialize, Serialize};

use super::{EngineError, OpCode};

/// 模型文件魔数
pub const MODEL_MAGIC: &[u8; 4] = b"KMDL";
/// 引擎支持的 schema 版本
pub const SCHEMA_VERSION: u32 = 3;

const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorType {
  UInt8,
  Int8,
  Float32,
}

impl TensorType {
  /// 单个元素的字节数
  pub fn size(self) -> usize {
    match self {
      TensorType::UInt8 | TensorType::Int8 => 1,
      TensorType::Float32 => 4,
    }
  }
}

fn default_scale() -> f32 {
  1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorSpec {
  pub name: String,
  pub dtype: TensorType,
  pub shape: Vec<usize>,
  /// 量化参数：real = (q - zero_point) * scale，float32 张量忽略
  #[serde(default = "default_scale")]
  pub scale: f32,
  #[serde(default)]
  pub zero_point: i32,
}

impl TensorSpec {
  pub fn elements(&self) -> usize {
    self.shape.iter().product()
  }

  pub fn bytes(&self) -> usize {
    self.elements() * self.dtype.size()
  }

  /// 最后一维，标量时为 1
  pub fn last_dim(&self) -> usize {
    self.shape.last().copied().unwrap_or(1)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Padding {
  Same,
  #[default]
  Valid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
  #[default]
  None,
  Relu,
  Relu6,
}

impl Activation {
  pub fn apply(self, v: f32) -> f32 {
    match self {
      Activation::None => v,
      Activation::Relu => v.max(0.0),
      Activation::Relu6 => v.clamp(0.0, 6.0),
    }
  }
}

fn unit_stride() -> [usize; 2] {
  [1, 1]
}

fn unit_beta() -> f32 {
  1.0
}

/// 计算图中的一个算子，张量以下标引用
///
/// 卷积核布局：`conv_2d` 为 `[out, kh, kw, in]`，`depthwise_conv_2d` 为
/// `[kh, kw, channels]`；`fully_connected` 的权重为 `[out, in]`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operator {
  #[serde(rename = "conv_2d")]
  Conv2d {
    input: usize,
    output: usize,
    kernel: [usize; 2],
    #[serde(default = "unit_stride")]
    stride: [usize; 2],
    #[serde(default)]
    padding: Padding,
    filter: Vec<f32>,
    #[serde(default)]
    bias: Vec<f32>,
    #[serde(default)]
    activation: Activation,
  },
  #[serde(rename = "depthwise_conv_2d")]
  DepthwiseConv2d {
    input: usize,
    output: usize,
    kernel: [usize; 2],
    #[serde(default = "unit_stride")]
    stride: [usize; 2],
    #[serde(default)]
    padding: Padding,
    filter: Vec<f32>,
    #[serde(default)]
    bias: Vec<f32>,
    #[serde(default)]
    activation: Activation,
  },
  Quantize {
    input: usize,
    output: usize,
  },
  Reshape {
    input: usize,
    output: usize,
  },
  Softmax {
    input: usize,
    output: usize,
    #[serde(default = "unit_beta")]
    beta: f32,
  },
  Mean {
    input: usize,
    output: usize,
  },
  FullyConnected {
    input: usize,
    output: usize,
    weights: Vec<f32>,
    #[serde(default)]
    bias: Vec<f32>,
    #[serde(default)]
    activation: Activation,
  },
}

impl Operator {
  pub fn opcode(&self) -> OpCode {
    match self {
      Operator::Conv2d { .. } => OpCode::Conv2d,
      Operator::DepthwiseConv2d { .. } => OpCode::DepthwiseConv2d,
      Operator::Quantize { .. } => OpCode::Quantize,
      Operator::Reshape { .. } => OpCode::Reshape,
      Operator::Softmax { .. } => OpCode::Softmax,
      Operator::Mean { .. } => OpCode::Mean,
      Operator::FullyConnected { .. } => OpCode::FullyConnected,
    }
  }

  pub fn io(&self) -> (usize, usize) {
    match *self {
      Operator::Conv2d { input, output, .. }
      | Operator::DepthwiseConv2d { input, output, .. }
      | Operator::Quantize { input, output }
      | Operator::Reshape { input, output }
      | Operator::Softmax { input, output, .. }
      | Operator::Mean { input, output }
      | Operator::FullyConnected { input, output, .. } => (input, output),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
  pub tensors: Vec<TensorSpec>,
  pub input: usize,
  pub output: usize,
  pub operators: Vec<Operator>,
}

/// 已校验 schema 版本的模型
#[derive(Debug, Clone)]
pub struct Model {
  version: u32,
  graph: Graph,
}

impl Model {
  /// 解析模型二进制：`KMDL` + 小端 u32 版本号 + JSON 计算图
  pub fn from_bytes(data: &[u8]) -> Result<Self, EngineError> {
    if data.len() < HEADER_LEN {
      return Err(EngineError::InvalidModel(format!(
        "模型数据只有 {} 字节",
        data.len()
      )));
    }
    if &data[..4] != MODEL_MAGIC {
      return Err(EngineError::InvalidModel("模型魔数不匹配".to_string()));
    }

    let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    if version != SCHEMA_VERSION {
      return Err(EngineError::SchemaVersionMismatch {
        found: version,
        supported: SCHEMA_VERSION,
      });
    }

    let graph = serde_json::from_slice(&data[HEADER_LEN..])
      .map_err(|e| EngineError::InvalidModel(e.to_string()))?;
    Ok(Self { version, graph })
  }

  /// 序列化为模型二进制
  pub fn encode(version: u32, graph: &Graph) -> Result<Vec<u8>, EngineError> {
    let body = serde_json::to_vec(graph).map_err(|e| EngineError::InvalidModel(e.to_string()))?;
    let mut data = Vec::with_capacity(HEADER_LEN + body.len());
    data.extend_from_slice(MODEL_MAGIC);
    data.extend_from_slice(&version.to_le_bytes());
    data.extend_from_slice(&body);
    Ok(data)
  }

  pub fn version(&self) -> u32 {
    self.version
  }

  pub fn graph(&self) -> &Graph {
    &self.graph
  }
}
