// 该文件是 Kanmao （看猫） 项目的一部分。
// src/frame.rs - 帧缓冲与帧缓冲池
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

//! # 帧缓冲
//!
//! 摄像头驱动持有固定数量的帧缓冲（相当于 `fb_count`）。每次采集从池中
//! 取出一个缓冲并交给调用者独占；[`Frame`] 被释放（显式调用
//! [`Frame::release`] 或离开作用域）时，缓冲回到池中，且只会回收一次。

use std::{
  fmt,
  sync::{
    Arc, Condvar, Mutex, PoisonError,
    atomic::{AtomicU64, Ordering},
  },
  time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, trace};

use crate::input::CaptureError;

/// 像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
  /// JPEG 压缩数据
  Jpeg,
  /// 每像素 3 字节的 RGB
  Rgb888,
  /// 每像素 1 字节的灰度
  Gray8,
}

impl PixelFormat {
  /// 非压缩格式的每像素字节数
  pub fn bytes_per_pixel(self) -> Option<usize> {
    match self {
      PixelFormat::Jpeg => None,
      PixelFormat::Rgb888 => Some(3),
      PixelFormat::Gray8 => Some(1),
    }
  }

  pub fn from_channels(channels: usize) -> Option<Self> {
    match channels {
      3 => Some(PixelFormat::Rgb888),
      1 => Some(PixelFormat::Gray8),
      _ => None,
    }
  }
}

struct PoolShared {
  free: Mutex<Vec<Vec<u8>>>,
  available: Condvar,
  capacity: usize,
  captured: AtomicU64,
  released: AtomicU64,
}

impl PoolShared {
  fn give_back(&self, mut buffer: Vec<u8>) {
    buffer.clear();
    let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
    free.push(buffer);
    self.released.fetch_add(1, Ordering::AcqRel);
    self.available.notify_one();
  }
}

/// 固定容量的帧缓冲池
#[derive(Clone)]
pub struct FramePool {
  shared: Arc<PoolShared>,
}

/// 帧缓冲池的状态快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
  pub capacity: usize,
  pub free: usize,
  pub captured: u64,
  pub released: u64,
}

impl PoolSnapshot {
  /// 当前被池外持有的帧数
  pub fn outstanding(&self) -> usize {
    self.capacity - self.free
  }
}

impl FramePool {
  pub fn new(capacity: usize, buffer_hint: usize) -> Self {
    let free = (0..capacity)
      .map(|_| Vec::with_capacity(buffer_hint))
      .collect::<Vec<_>>();
    debug!("创建帧缓冲池: {} 个缓冲, 每个预留 {} 字节", capacity, buffer_hint);
    Self {
      shared: Arc::new(PoolShared {
        free: Mutex::new(free),
        available: Condvar::new(),
        capacity,
        captured: AtomicU64::new(0),
        released: AtomicU64::new(0),
      }),
    }
  }

  pub fn capacity(&self) -> usize {
    self.shared.capacity
  }

  pub fn snapshot(&self) -> PoolSnapshot {
    let free = self
      .shared
      .free
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .len();
    PoolSnapshot {
      capacity: self.shared.capacity,
      free,
      captured: self.shared.captured.load(Ordering::Acquire),
      released: self.shared.released.load(Ordering::Acquire),
    }
  }

  /// 取出一个空闲缓冲并由 `fill` 写入数据
  ///
  /// 没有空闲缓冲时最多等待 `wait`，仍然没有则返回
  /// [`CaptureError::NoFreeBuffer`]。`fill` 失败时缓冲立即回到池中。
  pub fn fill<F>(
    &self,
    info: FrameInfo,
    wait: Duration,
    fill: F,
  ) -> Result<Frame, CaptureError>
  where
    F: FnOnce(&mut Vec<u8>) -> Result<(), CaptureError>,
  {
    let mut buffer = {
      let free = self
        .shared
        .free
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
      let (mut free, _) = self
        .shared
        .available
        .wait_timeout_while(free, wait, |free| free.is_empty())
        .unwrap_or_else(PoisonError::into_inner);
      free.pop().ok_or(CaptureError::NoFreeBuffer)?
    };

    if let Err(e) = fill(&mut buffer) {
      buffer.clear();
      let mut free = self
        .shared
        .free
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
      free.push(buffer);
      self.shared.available.notify_one();
      return Err(e);
    }

    let index = self.shared.captured.fetch_add(1, Ordering::AcqRel);
    trace!("采集第 {} 帧, {} 字节", index, buffer.len());
    Ok(Frame {
      data: buffer,
      info,
      index,
      timestamp: Utc::now(),
      pool: Some(self.shared.clone()),
    })
  }
}

/// 帧的附加信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
  pub format: PixelFormat,
  pub width: Option<u32>,
  pub height: Option<u32>,
}

impl FrameInfo {
  pub fn jpeg(width: Option<u32>, height: Option<u32>) -> Self {
    Self {
      format: PixelFormat::Jpeg,
      width,
      height,
    }
  }
}

/// 一个独占的帧缓冲
///
/// 任一时刻只属于帧缓冲池、推流处理器或推理任务之一。`Frame` 不可克隆，
/// 所有权只能被移动；缓冲在 `Drop` 时归还，因此重复释放在类型层面不可能发生。
pub struct Frame {
  data: Vec<u8>,
  info: FrameInfo,
  index: u64,
  timestamp: DateTime<Utc>,
  pool: Option<Arc<PoolShared>>,
}

impl Frame {
  pub fn data(&self) -> &[u8] {
    &self.data
  }

  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }

  pub fn format(&self) -> PixelFormat {
    self.info.format
  }

  pub fn width(&self) -> Option<u32> {
    self.info.width
  }

  pub fn height(&self) -> Option<u32> {
    self.info.height
  }

  /// 采集序号，从 0 开始
  pub fn index(&self) -> u64 {
    self.index
  }

  pub fn timestamp(&self) -> DateTime<Utc> {
    self.timestamp
  }

  /// 将缓冲归还帧缓冲池
  pub fn release(self) {
    trace!("释放第 {} 帧", self.index);
    drop(self);
  }
}

impl Drop for Frame {
  fn drop(&mut self) {
    if let Some(pool) = self.pool.take() {
      pool.give_back(std::mem::take(&mut self.data));
    }
  }
}

impl fmt::Debug for Frame {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Frame")
      .field("index", &self.index)
      .field("len", &self.data.len())
      .field("format", &self.info.format)
      .field("width", &self.info.width)
      .field("height", &self.info.height)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn jpeg_info() -> FrameInfo {
    FrameInfo::jpeg(Some(4), Some(4))
  }

  #[test]
  fn release_returns_buffer_exactly_once() {
    let pool = FramePool::new(2, 16);
    let frame = pool
      .fill(jpeg_info(), Duration::ZERO, |buf| {
        buf.extend_from_slice(&[1, 2, 3]);
        Ok(())
      })
      .unwrap();
    assert_eq!(frame.data(), &[1, 2, 3]);
    assert_eq!(pool.snapshot().outstanding(), 1);

    frame.release();
    let snapshot = pool.snapshot();
    assert_eq!(snapshot.outstanding(), 0);
    assert_eq!(snapshot.captured, 1);
    assert_eq!(snapshot.released, 1);
  }

  #[test]
  fn exhausted_pool_reports_no_free_buffer() {
    let pool = FramePool::new(1, 0);
    let held = pool
      .fill(jpeg_info(), Duration::ZERO, |_| Ok(()))
      .unwrap();
    let err = pool
      .fill(jpeg_info(), Duration::from_millis(5), |_| Ok(()))
      .unwrap_err();
    assert!(matches!(err, CaptureError::NoFreeBuffer));
    drop(held);
    assert!(pool.fill(jpeg_info(), Duration::ZERO, |_| Ok(())).is_ok());
  }

  #[test]
  fn failed_fill_puts_buffer_back() {
    let pool = FramePool::new(1, 0);
    let err = pool
      .fill(jpeg_info(), Duration::ZERO, |buf| {
        buf.push(9);
        Err(CaptureError::Driver("传感器超时".into()))
      })
      .unwrap_err();
    assert!(matches!(err, CaptureError::Driver(_)));
    let snapshot = pool.snapshot();
    assert_eq!(snapshot.free, 1);
    assert_eq!(snapshot.captured, 0);
    assert_eq!(snapshot.released, 0);
  }

  #[test]
  fn buffers_are_reused_cleared() {
    let pool = FramePool::new(1, 0);
    pool
      .fill(jpeg_info(), Duration::ZERO, |buf| {
        buf.extend_from_slice(b"first");
        Ok(())
      })
      .unwrap()
      .release();
    let frame = pool
      .fill(jpeg_info(), Duration::ZERO, |buf| {
        buf.extend_from_slice(b"2nd");
        Ok(())
      })
      .unwrap();
    assert_eq!(frame.data(), b"2nd");
    assert_eq!(frame.index(), 1);
  }
}
