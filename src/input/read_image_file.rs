// 该文件是 Kanmao （看猫） 项目的一部分。
// src/input/read_image_file.rs - JPEG 文件回放输入
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

use std::{
  fs::File,
  io::Read,
  path::{Path, PathBuf},
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
pub enum ImageFileInputError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("No JPEG file found in {0}")]
  NoImages(PathBuf),
}

/// 按顺序回放 JPEG 文件的帧源
///
/// URL 格式: `image:///path/to/file.jpg` 或 `image:///path/to/dir?loop=false&fps=5`
pub struct ImageFileSource {
  pool: FramePool,
  options: SourceOptions,
  pacer: FramePacer,
  files: Vec<PathBuf>,
  cursor: usize,
  repeat: bool,
}

impl FromUrlWithScheme for ImageFileSource {
  const SCHEME: &'static str = "image";
}

fn is_jpeg(path: &Path) -> bool {
  path
    .extension()
    .and_then(|ext| ext.to_str())
    .map(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
    .unwrap_or(false)
}

impl FromUrl for ImageFileSource {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemaMismatch);
    }

    let repeat = !url.query_pairs().any(|(k, v)| k == "loop" && v == "false");
    Self::open(url.path(), SourceOptions::from_url(url), repeat)
  }
}

impl ImageFileSource {
  pub fn open(
    path: impl AsRef<Path>,
    options: SourceOptions,
    repeat: bool,
  ) -> Result<Self, ImageFileInputError> {
    let path = path.as_ref();
    let mut files = if path.is_dir() {
      std::fs::read_dir(path)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && is_jpeg(p))
        .collect::<Vec<_>>()
    } else {
      // 单个文件时不检查扩展名，打开失败直接报 I/O 错误
      File::open(path)?;
      vec![path.to_path_buf()]
    };
    files.sort();

    if files.is_empty() {
      return Err(ImageFileInputError::NoImages(path.to_path_buf()));
    }
    debug!("图像回放输入: {} 个文件, 循环: {}", files.len(), repeat);

    Ok(Self {
      pool: FramePool::new(options.pool_size, 0),
      pacer: FramePacer::new(options.frame_interval()),
      options,
      files,
      cursor: 0,
      repeat,
    })
  }
}

impl FrameSource for ImageFileSource {
  fn capture(&mut self) -> Result<Frame, CaptureError> {
    if self.cursor >= self.files.len() {
      if !self.repeat {
        return Err(CaptureError::Exhausted);
      }
      self.cursor = 0;
    }
    self.pacer.wait();

    let path = &self.files[self.cursor];
    self.cursor += 1;
    self.pool.fill(
      FrameInfo::jpeg(None, None),
      self.options.buffer_wait(),
      |buf| {
        File::open(path)?.read_to_end(buf)?;
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

  fn fast() -> SourceOptions {
    SourceOptions {
      pool_size: 2,
      fps: 0,
    }
  }

  #[test]
  fn replays_directory_in_order() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("b.jpg"), b"second").unwrap();
    std::fs::write(dir.path().join("a.JPEG"), b"first").unwrap();
    std::fs::write(dir.path().join("notes.txt"), b"skip").unwrap();

    let mut source = ImageFileSource::open(dir.path(), fast(), true).unwrap();
    let a = source.capture().unwrap();
    assert_eq!(a.data(), b"first");
    a.release();
    let b = source.capture().unwrap();
    assert_eq!(b.data(), b"second");
    b.release();
    let again = source.capture().unwrap();
    assert_eq!(again.data(), b"first");
  }

  #[test]
  fn without_loop_source_is_exhausted() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("only.jpg");
    std::fs::write(&file, b"jpeg").unwrap();

    let mut source = ImageFileSource::open(&file, fast(), false).unwrap();
    source.capture().unwrap().release();
    assert!(matches!(source.capture(), Err(CaptureError::Exhausted)));
  }

  #[test]
  fn empty_directory_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
      ImageFileSource::open(dir.path(), fast(), true),
      Err(ImageFileInputError::NoImages(_))
    ));
  }
}
