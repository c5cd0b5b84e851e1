// 该文件是 Kanmao （看猫） 项目的一部分。
// src/input/test_pattern.rs - 测试图案摄像头
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

//! 在没有真实摄像头时，按帧率生成纯色 JPEG 帧。
//!
//! URL 格式: `test://?width=96&height=96&scene=cycle&hold=10&quality=80&fps=10&pool=2`
//!
//! `scene` 可以是 `cycle`、`empty`、`nachi`、`ngao`；`cycle` 每 `hold` 帧切换一次场景。

use image::{
  ExtendedColorType, ImageEncoder,
  codecs::jpeg::JpegEncoder,
  error::{ImageError, LimitError, LimitErrorKind},
};
use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{Frame, FrameInfo, FramePool},
  input::{CaptureError, FramePacer, FrameSource, SourceOptions},
};

#[derive(Error, Debug)]
pub enum TestPatternError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("Invalid parameter {0}: {1}")]
  InvalidParameter(&'static str, String),
}

/// 测试图案的最大边长
pub const MAX_SIDE: u32 = 4096;

const EMPTY_COLOR: [u8; 3] = [14, 14, 16];
const NACHI_COLOR: [u8; 3] = [226, 122, 44];
const NGAO_COLOR: [u8; 3] = [58, 92, 218];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scene {
  Cycle,
  Empty,
  Nachi,
  Ngao,
}

impl Scene {
  fn parse(name: &str) -> Option<Self> {
    match name {
      "cycle" => Some(Scene::Cycle),
      "empty" => Some(Scene::Empty),
      "nachi" => Some(Scene::Nachi),
      "ngao" => Some(Scene::Ngao),
      _ => None,
    }
  }

  /// 第 `tick` 帧的颜色
  pub fn color_at(self, tick: u64, hold: u64) -> [u8; 3] {
    match self {
      Scene::Empty => EMPTY_COLOR,
      Scene::Nachi => NACHI_COLOR,
      Scene::Ngao => NGAO_COLOR,
      Scene::Cycle => match (tick / hold.max(1)) % 3 {
        0 => EMPTY_COLOR,
        1 => NACHI_COLOR,
        _ => NGAO_COLOR,
      },
    }
  }
}

/// 编码一张纯色 JPEG
pub fn encode_solid_jpeg(
  width: u32,
  height: u32,
  color: [u8; 3],
  quality: u8,
) -> Result<Vec<u8>, ImageError> {
  if width == 0 || height == 0 || width > MAX_SIDE || height > MAX_SIDE {
    return Err(ImageError::Limits(LimitError::from_kind(
      LimitErrorKind::DimensionError,
    )));
  }
  let canvas = solid_canvas(width, height, color);
  let mut out = Vec::new();
  JpegEncoder::new_with_quality(&mut out, quality).write_image(
    &canvas,
    width,
    height,
    ExtendedColorType::Rgb8,
  )?;
  Ok(out)
}

fn solid_canvas(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
  color
    .iter()
    .copied()
    .cycle()
    .take((width as usize).saturating_mul(height as usize).saturating_mul(3))
    .collect()
}

pub struct TestPatternSource {
  pool: FramePool,
  options: SourceOptions,
  pacer: FramePacer,
  width: u32,
  height: u32,
  scene: Scene,
  hold: u64,
  quality: u8,
  tick: u64,
}

impl FromUrlWithScheme for TestPatternSource {
  const SCHEME: &'static str = "test";
}

fn parse_param<T: std::str::FromStr>(
  name: &'static str,
  value: &str,
) -> Result<T, TestPatternError> {
  value
    .parse()
    .map_err(|_| TestPatternError::InvalidParameter(name, value.to_string()))
}

impl FromUrl for TestPatternSource {
  type Error = TestPatternError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(TestPatternError::SchemaMismatch);
    }

    let mut width = 96;
    let mut height = 96;
    let mut scene = Scene::Cycle;
    let mut hold = 10;
    let mut quality = 80;
    for (k, v) in url.query_pairs() {
      match k.as_ref() {
        "width" => width = parse_param("width", &v)?,
        "height" => height = parse_param("height", &v)?,
        "hold" => hold = parse_param("hold", &v)?,
        "quality" => quality = parse_param("quality", &v)?,
        "scene" => {
          scene = Scene::parse(&v)
            .ok_or_else(|| TestPatternError::InvalidParameter("scene", v.to_string()))?
        }
        _ => {}
      }
    }
    if width == 0 || height == 0 || width > MAX_SIDE || height > MAX_SIDE {
      return Err(TestPatternError::InvalidParameter(
        "width/height",
        format!("{}x{}", width, height),
      ));
    }

    Ok(Self::new(width, height, scene, SourceOptions::from_url(url))
      .with_hold(hold)
      .with_quality(quality))
  }
}

impl TestPatternSource {
  pub fn new(width: u32, height: u32, scene: Scene, options: SourceOptions) -> Self {
    debug!(
      "测试图案输入: {}x{} {:?}, {} 个帧缓冲, {} fps",
      width, height, scene, options.pool_size, options.fps
    );
    Self {
      pool: FramePool::new(
        options.pool_size,
        (width as usize).saturating_mul(height as usize),
      ),
      pacer: FramePacer::new(options.frame_interval()),
      options,
      width,
      height,
      scene,
      hold: 10,
      quality: 80,
      tick: 0,
    }
  }

  pub fn with_hold(mut self, hold: u64) -> Self {
    self.hold = hold.max(1);
    self
  }

  pub fn with_quality(mut self, quality: u8) -> Self {
    self.quality = quality.clamp(1, 100);
    self
  }
}

impl FrameSource for TestPatternSource {
  fn capture(&mut self) -> Result<Frame, CaptureError> {
    self.pacer.wait();
    let color = self.scene.color_at(self.tick, self.hold);
    self.tick += 1;

    let canvas = solid_canvas(self.width, self.height, color);
    let (width, height, quality) = (self.width, self.height, self.quality);
    self.pool.fill(
      FrameInfo::jpeg(Some(width), Some(height)),
      self.options.buffer_wait(),
      |buf| {
        JpegEncoder::new_with_quality(buf, quality).write_image(
          &canvas,
          width,
          height,
          ExtendedColorType::Rgb8,
        )?;
        Ok(())
      },
    )
  }

  fn pool(&self) -> &FramePool {
    &self.pool
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cycle_scene_switches_every_hold_frames() {
    assert_eq!(Scene::Cycle.color_at(0, 2), EMPTY_COLOR);
    assert_eq!(Scene::Cycle.color_at(1, 2), EMPTY_COLOR);
    assert_eq!(Scene::Cycle.color_at(2, 2), NACHI_COLOR);
    assert_eq!(Scene::Cycle.color_at(4, 2), NGAO_COLOR);
    assert_eq!(Scene::Cycle.color_at(6, 2), EMPTY_COLOR);
  }

  #[test]
  fn from_url_reads_parameters() {
    let url = Url::parse("test://?width=32&height=24&scene=ngao&quality=90&fps=0").unwrap();
    let mut source = TestPatternSource::from_url(&url).unwrap();
    let frame = source.capture().unwrap();
    assert_eq!(frame.width(), Some(32));
    assert_eq!(frame.height(), Some(24));
    assert!(frame.data().starts_with(&[0xFF, 0xD8]));
  }

  #[test]
  fn bad_scene_is_rejected() {
    let url = Url::parse("test://?scene=dog").unwrap();
    assert!(matches!(
      TestPatternSource::from_url(&url),
      Err(TestPatternError::InvalidParameter("scene", _))
    ));
  }

  #[test]
  fn oversized_pattern_is_rejected() {
    let url = Url::parse("test://?width=70000&height=70000&fps=0").unwrap();
    assert!(matches!(
      TestPatternSource::from_url(&url),
      Err(TestPatternError::InvalidParameter("width/height", _))
    ));
    let url = Url::parse("test://?width=4097&height=1").unwrap();
    assert!(TestPatternSource::from_url(&url).is_err());
    assert!(encode_solid_jpeg(70000, 70000, NACHI_COLOR, 80).is_err());
  }

  #[test]
  fn solid_jpeg_has_markers() {
    let jpeg = encode_solid_jpeg(8, 8, NACHI_COLOR, 80).unwrap();
    assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
  }
}
