// 该文件是 Kanmao （看猫） 项目的一部分。
// src/input.rs - 帧源（摄像头）定义
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

use std::time::{Duration, Instant};

use thiserror::Error;
use url::Url;

use crate::{
  ErrorKind, FromUrl,
  frame::{Frame, FramePool},
};

/// 帧源：拥有摄像头驱动，按需产生独占的帧缓冲
///
/// 每个采集到的帧必须恰好释放一次。[`Frame`] 在释放时自行归还缓冲池，
/// 因此持有者可以直接调用 [`Frame::release`]，不需要回到帧源。
pub trait FrameSource: Send {
  /// 采集一帧，阻塞时间不超过一个帧间隔
  fn capture(&mut self) -> Result<Frame, CaptureError>;

  fn release(&mut self, frame: Frame) {
    frame.release();
  }

  fn pool(&self) -> &FramePool;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
  fn capture(&mut self) -> Result<Frame, CaptureError> {
    (**self).capture()
  }

  fn release(&mut self, frame: Frame) {
    (**self).release(frame)
  }

  fn pool(&self) -> &FramePool {
    (**self).pool()
  }
}

#[derive(Error, Debug)]
pub enum CaptureError {
  #[error("没有空闲的帧缓冲")]
  NoFreeBuffer,
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("图像编码错误: {0}")]
  Encode(#[from] image::ImageError),
  #[error("摄像头驱动错误: {0}")]
  Driver(String),
  #[error("输入源已经没有更多帧")]
  Exhausted,
}

impl CaptureError {
  pub fn kind(&self) -> ErrorKind {
    ErrorKind::CaptureFailure
  }
}

/// 帧源的公共参数，来自 URL 查询串
///
/// - `pool`: 帧缓冲数量，默认 2
/// - `fps`: 帧率，0 表示不限速，默认 10
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceOptions {
  pub pool_size: usize,
  pub fps: u32,
}

impl Default for SourceOptions {
  fn default() -> Self {
    Self {
      pool_size: 2,
      fps: 10,
    }
  }
}

impl SourceOptions {
  pub fn from_url(url: &Url) -> Self {
    let mut options = Self::default();
    for (k, v) in url.query_pairs() {
      match k.as_ref() {
        "pool" => {
          if let Ok(n) = v.parse::<usize>() {
            options.pool_size = n.max(1);
          }
        }
        "fps" => {
          if let Ok(n) = v.parse() {
            options.fps = n;
          }
        }
        _ => {}
      }
    }
    options
  }

  pub fn frame_interval(&self) -> Option<Duration> {
    (self.fps > 0).then(|| Duration::from_secs(1) / self.fps)
  }

  /// 等待空闲缓冲的上限：一个帧间隔，不限速时为 100ms
  pub fn buffer_wait(&self) -> Duration {
    self
      .frame_interval()
      .unwrap_or(Duration::from_millis(100))
  }
}

/// 按固定帧间隔节流
#[derive(Debug)]
pub struct FramePacer {
  interval: Option<Duration>,
  next: Option<Instant>,
}

impl FramePacer {
  pub fn new(interval: Option<Duration>) -> Self {
    Self {
      interval,
      next: None,
    }
  }

  pub fn wait(&mut self) {
    let Some(interval) = self.interval else {
      return;
    };
    let now = Instant::now();
    if let Some(next) = self.next {
      if next > now {
        std::thread::sleep(next - now);
      }
    }
    self.next = Some(Instant::now() + interval);
  }
}

mod test_pattern;
pub use self::test_pattern::{Scene, TestPatternError, TestPatternSource, encode_solid_jpeg};

#[cfg(feature = "read_image_file")]
mod read_image_file;
#[cfg(feature = "read_image_file")]
pub use self::read_image_file::{ImageFileInputError, ImageFileSource};

#[cfg(feature = "v4l_input")]
mod v4l_input;
#[cfg(feature = "v4l_input")]
pub use self::v4l_input::{V4lInputError, V4lSource};

#[derive(Error, Debug)]
pub enum InputError {
  #[error("Test pattern input error: {0}")]
  TestPatternError(#[from] TestPatternError),
  #[cfg(feature = "read_image_file")]
  #[error("Image file input error: {0}")]
  ImageFileInputError(#[from] ImageFileInputError),
  #[cfg(feature = "v4l_input")]
  #[error("V4L input error: {0}")]
  V4lInputError(#[from] V4lInputError),
  #[error("URI scheme mismatch: {0}")]
  SchemeMismatch(String),
}

pub enum InputWrapper {
  TestPattern(TestPatternSource),
  #[cfg(feature = "read_image_file")]
  ImageFile(ImageFileSource),
  #[cfg(feature = "v4l_input")]
  V4l(V4lSource),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    use crate::FromUrlWithScheme;

    if url.scheme() == TestPatternSource::SCHEME {
      return Ok(InputWrapper::TestPattern(TestPatternSource::from_url(url)?));
    }
    #[cfg(feature = "read_image_file")]
    {
      if url.scheme() == ImageFileSource::SCHEME {
        return Ok(InputWrapper::ImageFile(ImageFileSource::from_url(url)?));
      }
    }
    #[cfg(feature = "v4l_input")]
    {
      if url.scheme() == V4lSource::SCHEME {
        return Ok(InputWrapper::V4l(V4lSource::from_url(url)?));
      }
    }
    Err(InputError::SchemeMismatch(url.scheme().to_string()))
  }
}

impl FrameSource for InputWrapper {
  fn capture(&mut self) -> Result<Frame, CaptureError> {
    match self {
      InputWrapper::TestPattern(source) => source.capture(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ImageFile(source) => source.capture(),
      #[cfg(feature = "v4l_input")]
      InputWrapper::V4l(source) => source.capture(),
    }
  }

  fn pool(&self) -> &FramePool {
    match self {
      InputWrapper::TestPattern(source) => source.pool(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ImageFile(source) => source.pool(),
      #[cfg(feature = "v4l_input")]
      InputWrapper::V4l(source) => source.pool(),
    }
  }
}
