// 该文件是 Kanmao （看猫） 项目的一部分。
// src/lib.rs - 库主文件
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

pub mod codec;
pub mod engine;
pub mod frame;
pub mod handoff;
pub mod input;
pub mod model;
pub mod server;
pub mod stream;
pub mod task;
pub mod worker;

pub trait FromUrl {
  type Error;
  fn from_url(url: &url::Url) -> Result<Self, Self::Error>
  where
    Self: Sized;
}

pub trait FromUrlWithScheme: FromUrl {
  const SCHEME: &'static str;
}

/// 错误分类，用于决定错误是否致命
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  /// 内存/arena 分配失败
  ResourceExhaustion,
  /// 模型版本、张量类型等格式不符
  FormatMismatch,
  /// 压缩图像无法解码
  DecodeFailure,
  /// 摄像头采集失败
  CaptureFailure,
  /// 推理引擎执行失败
  InvokeFailure,
}

impl ErrorKind {
  /// 初始化阶段的错误对分类器实例是致命的
  pub fn is_fatal_at_setup(self) -> bool {
    matches!(
      self,
      ErrorKind::ResourceExhaustion | ErrorKind::FormatMismatch
    )
  }
}
