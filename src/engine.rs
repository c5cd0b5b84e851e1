// 该文件是 Kanmao （看猫） 项目的一部分。
// src/engine.rs - 量化推理引擎
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

//! # 微型推理引擎
//!
//! 面向单片机的小型量化模型解释器：
//!
//! - 模型是一段内嵌在固件中的二进制（[`Model`]），头部带 schema 版本；
//! - 所有张量存放在一次性分配的 [`Arena`] 中，`allocate_tensors` 之后不再分配；
//! - 算子必须先在 [`OpResolver`] 中注册，图中出现未注册的算子会在构建时失败；
//! - 张量支持 `uint8`/`int8`（仿射量化）与 `float32`，算子内部以 f32 计算。

use thiserror::Error;

use crate::ErrorKind;

mod arena;
mod interpreter;
mod kernels;
mod resolver;
mod schema;

pub use self::arena::{Arena, MemoryRegion};
pub use self::interpreter::Interpreter;
pub use self::resolver::{OpCode, OpResolver, classifier_op_resolver};
pub use self::schema::{
  Activation, Graph, MODEL_MAGIC, Model, Operator, Padding, SCHEMA_VERSION, TensorSpec, TensorType,
};

#[derive(Error, Debug)]
pub enum EngineError {
  #[error("模型格式无效: {0}")]
  InvalidModel(String),
  #[error("模型 schema 版本 {found} 与支持的版本 {supported} 不一致")]
  SchemaVersionMismatch { found: u32, supported: u32 },
  #[error("算子 {0:?} 未在注册表中")]
  UnsupportedOperator(OpCode),
  #[error("算子注册表已满, 容量 {0}")]
  ResolverFull(usize),
  #[error("无法从 {region:?} 分配 {size} 字节的张量 arena")]
  AllocationFailure { size: usize, region: MemoryRegion },
  #[error("张量 arena 空间不足: 需要 {required} 字节, 仅有 {available} 字节")]
  OutOfMemory { required: usize, available: usize },
  #[error("张量尚未分配")]
  NotAllocated,
  #[error("计算图无效: {0}")]
  InvalidGraph(String),
}

impl EngineError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      EngineError::ResolverFull(_)
      | EngineError::AllocationFailure { .. }
      | EngineError::OutOfMemory { .. } => ErrorKind::ResourceExhaustion,
      EngineError::InvalidModel(_)
      | EngineError::SchemaVersionMismatch { .. }
      | EngineError::UnsupportedOperator(_)
      | EngineError::InvalidGraph(_) => ErrorKind::FormatMismatch,
      EngineError::NotAllocated => ErrorKind::InvokeFailure,
    }
  }
}
