// 该文件是 Kanmao （看猫） 项目的一部分。
// src/engine/arena.rs - 张量 arena
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

use serde::Serialize;
use tracing::{debug, info};

use super::EngineError;

/// arena 所在的内存区域
///
/// 模型较大且对延迟不敏感，优先放在容量大、速度慢的外部 PSRAM。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryRegion {
  /// 外部 PSRAM (`MALLOC_CAP_SPIRAM | MALLOC_CAP_8BIT`)
  External,
  /// 片内 SRAM
  Internal,
}

/// 一次性分配、固定大小的张量存储
pub struct Arena {
  data: Box<[u8]>,
  region: MemoryRegion,
}

impl Arena {
  pub fn allocate(size: usize, region: MemoryRegion) -> Result<Self, EngineError> {
    if size == 0 {
      return Err(EngineError::AllocationFailure { size, region });
    }

    let mut data = Vec::new();
    data
      .try_reserve_exact(size)
      .map_err(|_| EngineError::AllocationFailure { size, region })?;
    data.resize(size, 0u8);

    info!("从 {:?} 分配张量 arena: {} KiB", region, size / 1024);
    Ok(Self {
      data: data.into_boxed_slice(),
      region,
    })
  }

  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }

  pub fn region(&self) -> MemoryRegion {
    self.region
  }

  pub(crate) fn bytes(&self) -> &[u8] {
    &self.data
  }

  pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
    &mut self.data
  }
}

impl Drop for Arena {
  fn drop(&mut self) {
    debug!("释放张量 arena ({:?}, {} 字节)", self.region, self.data.len());
  }
}
