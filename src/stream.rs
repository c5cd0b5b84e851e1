// 该文件是 Kanmao （看猫） 项目的一部分。
// src/stream.rs - MJPEG 推流
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

use std::io::{self, Write};
use std::sync::{
  Arc,
  atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
  handoff::{HandoffSender, Offer},
  input::FrameSource,
};

pub const PART_BOUNDARY: &str = "123456789000000000000987654321";
pub const STREAM_CONTENT_TYPE: &str =
  "multipart/x-mixed-replace;boundary=123456789000000000000987654321";
const STREAM_BOUNDARY: &[u8] = b"\r\n--123456789000000000000987654321\r\n";

/// 启用推理时帧缓冲的下限：推理线程占一块，推流至少还要一块
pub const MIN_POOL_WITH_INFERENCE: usize = 2;

/// 把 JPEG 帧写成 multipart 的各个分段
pub struct MjpegWriter<W: Write> {
  inner: W,
  parts: u64,
}

impl<W: Write> MjpegWriter<W> {
  pub fn new(inner: W) -> Self {
    Self { inner, parts: 0 }
  }

  /// 写入一帧：分隔符、分段头、`len` 字节的图像数据
  pub fn write_part(&mut self, jpeg: &[u8]) -> io::Result<()> {
    self.inner.write_all(STREAM_BOUNDARY)?;
    write!(
      self.inner,
      "Content-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
      jpeg.len()
    )?;
    self.inner.write_all(jpeg)?;
    self.inner.flush()?;
    self.parts += 1;
    Ok(())
  }

  pub fn parts(&self) -> u64 {
    self.parts
  }

  pub fn into_inner(self) -> W {
    self.inner
  }
}

#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
  /// 推理超过该时间仍未完成时告警
  pub stall_timeout: Duration,
  /// 连续采集失败次数达到该值时结束推流
  pub max_consecutive_capture_failures: u32,
  /// 最多发送的帧数，`None` 表示直到客户端断开
  pub frame_limit: Option<u64>,
}

impl Default for StreamOptions {
  fn default() -> Self {
    Self {
      stall_timeout: Duration::from_secs(5),
      max_consecutive_capture_failures: 10,
      frame_limit: None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEnd {
  ClientGone,
  CaptureFailed,
  Stopped,
  FrameLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamReport {
  pub frames_sent: u64,
  pub handed_off: u64,
  pub dropped_busy: u64,
  pub capture_failures: u64,
  pub end: StreamEnd,
}

/// 推流循环，同时是交接的生产者一侧
///
/// 每一帧先写给客户端，再尝试交给推理线程；交不出去的帧立即归还。
pub struct StreamHandler<'a, S: FrameSource> {
  source: &'a mut S,
  handoff: Option<&'a HandoffSender>,
  options: StreamOptions,
  stop: Option<Arc<AtomicBool>>,
}

impl<'a, S: FrameSource> StreamHandler<'a, S> {
  pub fn new(source: &'a mut S) -> Self {
    Self {
      source,
      handoff: None,
      options: StreamOptions::default(),
      stop: None,
    }
  }

  pub fn with_handoff(mut self, handoff: &'a HandoffSender) -> Self {
    self.handoff = Some(handoff);
    self
  }

  pub fn with_options(mut self, options: StreamOptions) -> Self {
    self.options = options;
    self
  }

  pub fn with_stop(mut self, stop: Arc<AtomicBool>) -> Self {
    self.stop = Some(stop);
    self
  }

  fn stopped(&self) -> bool {
    self
      .stop
      .as_ref()
      .is_some_and(|s| s.load(Ordering::Relaxed))
  }

  pub fn run<W: Write>(self, out: W) -> StreamReport {
    let mut writer = MjpegWriter::new(out);
    let mut report = StreamReport {
      frames_sent: 0,
      handed_off: 0,
      dropped_busy: 0,
      capture_failures: 0,
      end: StreamEnd::Stopped,
    };
    let mut consecutive_failures = 0u32;
    let mut stall_reported = false;

    // 只有一块缓冲时交出去就再也采集不到帧，此时不交接
    let handoff = self.handoff.filter(|_| {
      let capacity = self.source.pool().capacity();
      if capacity < MIN_POOL_WITH_INFERENCE {
        warn!(
          "帧缓冲只有 {} 块, 少于 {} 块时不交给推理",
          capacity, MIN_POOL_WITH_INFERENCE
        );
        return false;
      }
      true
    });

    info!("开始推流");
    report.end = loop {
      if self.stopped() {
        break StreamEnd::Stopped;
      }
      if self
        .options
        .frame_limit
        .is_some_and(|limit| report.frames_sent >= limit)
      {
        break StreamEnd::FrameLimit;
      }

      let frame = match self.source.capture() {
        Ok(frame) => {
          consecutive_failures = 0;
          frame
        }
        Err(e) => {
          report.capture_failures += 1;
          consecutive_failures += 1;
          warn!("采集失败 ({} 次连续): {}", consecutive_failures, e);
          if consecutive_failures >= self.options.max_consecutive_capture_failures {
            error!("连续采集失败, 结束推流");
            break StreamEnd::CaptureFailed;
          }
          continue;
        }
      };

      if let Err(e) = writer.write_part(frame.data()) {
        debug!("写入客户端失败: {}", e);
        self.source.release(frame);
        break StreamEnd::ClientGone;
      }
      report.frames_sent += 1;

      match handoff {
        Some(handoff) => {
          match handoff.offer(frame) {
            Offer::HandedOff => report.handed_off += 1,
            Offer::Dropped => report.dropped_busy += 1,
            Offer::Closed => {}
          }
          match handoff.stalled(self.options.stall_timeout) {
            Some(elapsed) if !stall_reported => {
              warn!("推理已持续 {:?} 未完成, 新帧将全部丢弃", elapsed);
              stall_reported = true;
            }
            None => stall_reported = false,
            _ => {}
          }
        }
        None => self.source.release(frame),
      }
    };

    info!(
      "推流结束 ({:?}): 发送 {} 帧, 交给推理 {} 帧, 丢弃 {} 帧",
      report.end, report.frames_sent, report.handed_off, report.dropped_busy
    );
    report
  }
}
