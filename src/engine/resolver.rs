// 该文件是 Kanmao （看猫） 项目的一部分。
// src/engine/resolver.rs - 算子注册表
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

use tracing::debug;

use super::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
  Conv2d,
  DepthwiseConv2d,
  Quantize,
  Reshape,
  Softmax,
  Mean,
  FullyConnected,
}

/// 容量为 `N` 的算子注册表
#[derive(Debug, Clone, Default)]
pub struct OpResolver<const N: usize> {
  ops: Vec<OpCode>,
}

impl<const N: usize> OpResolver<N> {
  pub fn new() -> Self {
    Self {
      ops: Vec::with_capacity(N),
    }
  }

  /// 注册算子，重复注册是无操作
  pub fn add(&mut self, op: OpCode) -> Result<(), EngineError> {
    if self.ops.contains(&op) {
      return Ok(());
    }
    if self.ops.len() >= N {
      return Err(EngineError::ResolverFull(N));
    }
    self.ops.push(op);
    Ok(())
  }

  pub fn contains(&self, op: OpCode) -> bool {
    self.ops.contains(&op)
  }

  pub fn len(&self) -> usize {
    self.ops.len()
  }

  pub fn is_empty(&self) -> bool {
    self.ops.is_empty()
  }
}

/// 分类模型所需的最小算子集合
pub fn classifier_op_resolver() -> Result<OpResolver<7>, EngineError> {
  let mut resolver = OpResolver::new();
  resolver.add(OpCode::Conv2d)?;
  resolver.add(OpCode::DepthwiseConv2d)?;
  resolver.add(OpCode::Quantize)?;
  resolver.add(OpCode::Reshape)?;
  resolver.add(OpCode::Softmax)?;
  resolver.add(OpCode::Mean)?;
  resolver.add(OpCode::FullyConnected)?;
  debug!("注册 {} 个算子", resolver.len());
  Ok(resolver)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn classifier_set_fills_capacity() {
    let resolver = classifier_op_resolver().unwrap();
    assert_eq!(resolver.len(), 7);
    assert!(resolver.contains(OpCode::Mean));
    assert!(resolver.contains(OpCode::FullyConnected));
  }

  #[test]
  fn capacity_is_enforced() {
    let mut resolver = OpResolver::<1>::new();
    resolver.add(OpCode::Softmax).unwrap();
    resolver.add(OpCode::Softmax).unwrap();
    assert!(matches!(
      resolver.add(OpCode::Reshape),
      Err(EngineError::ResolverFull(1))
    ));
  }
}
