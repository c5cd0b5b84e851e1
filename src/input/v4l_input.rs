// 该文件是 Kanmao （看猫） 项目的一部分。
// src/input/v4l_input.rs - V4L2 MJPEG 摄像头输入
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

use thiserror::Error;
use tracing::{error, info};
use url::Url;
use v4l::{
  Device, FourCC,
  buffer::Type,
  io::{mmap::Stream, traits::CaptureStream},
  video::Capture,
};

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{Frame, FrameInfo, FramePool},
  input::{CaptureError, FrameSource, SourceOptions},
};

#[derive(Error, Debug)]
pub enum V4lInputError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Device does not support MJPEG, negotiated {0}")]
  UnsupportedPixelFormat(String),
}

const V4L_MMAP_BUFFERS: u32 = 4;

/// V4L2 摄像头，以 MJPEG 格式采集
///
/// URL 格式: `v4l:///dev/video0?width=640&height=480&pool=2`
pub struct V4lSource {
  pool: FramePool,
  options: SourceOptions,
  stream: Stream<'static>,
  width: u32,
  height: u32,
  // stream 先于 device 释放
  _device: Device,
}

impl FromUrlWithScheme for V4lSource {
  const SCHEME: &'static str = "v4l";
}

impl FromUrl for V4lSource {
  type Error = V4lInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(V4lInputError::SchemaMismatch);
    }

    let device_path = if url.path().is_empty() {
      "/dev/video0".to_string()
    } else {
      url.path().to_string()
    };

    let mut width = None;
    let mut height = None;
    for (k, v) in url.query_pairs() {
      match k.as_ref() {
        "width" => width = v.parse().ok(),
        "height" => height = v.parse().ok(),
        _ => {}
      }
    }

    let device = Device::with_path(&device_path)?;
    let mut format = device.format()?;
    format.fourcc = FourCC::new(b"MJPG");
    if let Some(w) = width {
      format.width = w;
    }
    if let Some(h) = height {
      format.height = h;
    }
    let format = device.set_format(&format)?;
    if format.fourcc != FourCC::new(b"MJPG") {
      return Err(V4lInputError::UnsupportedPixelFormat(format.fourcc.to_string()));
    }
    info!(
      "打开 V4L2 设备 {}: {}x{} MJPEG",
      device_path, format.width, format.height
    );

    let stream = Stream::with_buffers(&device, Type::VideoCapture, V4L_MMAP_BUFFERS)?;
    let options = SourceOptions::from_url(url);

    Ok(V4lSource {
      pool: FramePool::new(
        options.pool_size,
        (format.width as usize).saturating_mul(format.height as usize) / 4,
      ),
      options,
      stream,
      width: format.width,
      height: format.height,
      _device: device,
    })
  }
}

impl FrameSource for V4lSource {
  fn capture(&mut self) -> Result<Frame, CaptureError> {
    let (data, _meta) = self.stream.next()?;
    self.pool.fill(
      FrameInfo::jpeg(Some(self.width), Some(self.height)),
      self.options.buffer_wait(),
      |buf| {
        buf.extend_from_slice(data);
        Ok(())
      },
    )
  }

  fn pool(&self) -> &FramePool {
    &self.pool
  }
}
