// 该文件是 Kanmao （看猫） 项目的一部分。
// src/codec.rs - 图像解码与量化修正
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

use std::io::Cursor;

use image::{ColorType, ImageDecoder, codecs::jpeg::JpegDecoder};
use thiserror::Error;
use tracing::trace;

use crate::{ErrorKind, frame::PixelFormat};

#[derive(Error, Debug)]
pub enum CodecError {
  #[error("JPEG 解码失败: {0}")]
  Malformed(#[from] image::ImageError),
  #[error("解码尺寸不匹配: 输出缓冲 {expected} 字节, 图像 {width}x{height} 需要 {actual} 字节")]
  SizeMismatch {
    expected: usize,
    actual: usize,
    width: u32,
    height: u32,
  },
  #[error("不支持的颜色格式转换: {from:?} -> {to:?}")]
  UnsupportedColor { from: ColorType, to: PixelFormat },
}

impl CodecError {
  pub fn kind(&self) -> ErrorKind {
    ErrorKind::DecodeFailure
  }
}

/// 将压缩帧解码到调用者提供的缓冲中
///
/// 输出缓冲一般就是分类器输入张量的存储，大小必须与解码结果完全一致，
/// 不会截断也不会补齐。
pub trait ImageCodec: Send {
  fn decode(
    &self,
    compressed: &[u8],
    target: PixelFormat,
    output: &mut [u8],
  ) -> Result<(u32, u32), CodecError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JpegCodec;

impl ImageCodec for JpegCodec {
  fn decode(
    &self,
    compressed: &[u8],
    target: PixelFormat,
    output: &mut [u8],
  ) -> Result<(u32, u32), CodecError> {
    let decoder = JpegDecoder::new(Cursor::new(compressed))?;
    let (width, height) = decoder.dimensions();
    let color = decoder.color_type();

    let matches = matches!(
      (color, target),
      (ColorType::Rgb8, PixelFormat::Rgb888) | (ColorType::L8, PixelFormat::Gray8)
    );
    if !matches {
      return Err(CodecError::UnsupportedColor {
        from: color,
        to: target,
      });
    }

    let actual = decoder.total_bytes() as usize;
    if actual != output.len() {
      return Err(CodecError::SizeMismatch {
        expected: output.len(),
        actual,
        width,
        height,
      });
    }

    decoder.read_image(output)?;
    trace!("JPEG 解码完成: {}x{} {:?}", width, height, target);
    Ok((width, height))
  }
}

/// 把 [0,255] 的无符号字节原地映射到 [-128,127] 的有符号表示
///
/// 异或 0x80 等价于减 128 并保持顺序：0x00 -> -128，0xFF -> 127。
/// 该变换是自逆的。
pub fn to_signed_in_place(data: &mut [u8]) {
  for b in data.iter_mut() {
    *b ^= 0x80;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::input::encode_solid_jpeg;

  #[test]
  fn signed_fixup_maps_range_ends() {
    let mut data = [0u8, 128, 255];
    to_signed_in_place(&mut data);
    assert_eq!(data.map(|b| b as i8), [-128, 0, 127]);
  }

  #[test]
  fn signed_fixup_is_self_inverse() {
    let original: Vec<u8> = (0..=255).collect();
    let mut data = original.clone();
    to_signed_in_place(&mut data);
    to_signed_in_place(&mut data);
    assert_eq!(data, original);
  }

  #[test]
  fn signed_fixup_preserves_order() {
    let mut data: Vec<u8> = (0..=255).collect();
    to_signed_in_place(&mut data);
    let signed: Vec<i8> = data.iter().map(|&b| b as i8).collect();
    assert!(signed.windows(2).all(|w| w[0] < w[1]));
  }

  #[test]
  fn decodes_directly_into_buffer() {
    let jpeg = encode_solid_jpeg(8, 6, [200, 40, 40], 95).unwrap();
    let mut out = vec![0u8; 8 * 6 * 3];
    let (w, h) = JpegCodec
      .decode(&jpeg, PixelFormat::Rgb888, &mut out)
      .unwrap();
    assert_eq!((w, h), (8, 6));
    let red = out.iter().step_by(3).map(|&r| r as u32).sum::<u32>() / (8 * 6);
    assert!((190..=210).contains(&red), "red channel mean {}", red);
  }

  #[test]
  fn size_mismatch_is_an_error_not_truncation() {
    let jpeg = encode_solid_jpeg(8, 8, [10, 10, 10], 80).unwrap();
    let mut out = vec![0xAAu8; 4 * 4 * 3];
    let err = JpegCodec
      .decode(&jpeg, PixelFormat::Rgb888, &mut out)
      .unwrap_err();
    assert!(matches!(
      err,
      CodecError::SizeMismatch {
        expected: 48,
        actual: 192,
        ..
      }
    ));
    assert!(out.iter().all(|&b| b == 0xAA));
  }

  #[test]
  fn malformed_input_is_decode_failure() {
    let mut out = vec![0u8; 12];
    let err = JpegCodec
      .decode(b"not a jpeg", PixelFormat::Rgb888, &mut out)
      .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DecodeFailure);
  }

  #[test]
  fn color_mismatch_is_rejected() {
    let jpeg = encode_solid_jpeg(4, 4, [10, 10, 10], 80).unwrap();
    let mut out = vec![0u8; 16];
    assert!(matches!(
      JpegCodec.decode(&jpeg, PixelFormat::Gray8, &mut out),
      Err(CodecError::UnsupportedColor { .. })
    ));
  }
}
