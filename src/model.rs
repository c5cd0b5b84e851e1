// 该文件是 Kanmao （看猫） 项目的一部分。
// src/model.rs - 分类模型
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

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::{ErrorKind, codec::CodecError, engine::EngineError, engine::TensorType};

/// 分类标签，顺序与模型输出一致
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CatLabel {
  Empty,
  Nachi,
  Ngao,
}

pub const NUM_CLASSES: usize = 3;

impl CatLabel {
  pub const ALL: [CatLabel; NUM_CLASSES] = [CatLabel::Empty, CatLabel::Nachi, CatLabel::Ngao];

  pub fn as_str(self) -> &'static str {
    match self {
      CatLabel::Empty => "empty",
      CatLabel::Nachi => "nachi",
      CatLabel::Ngao => "ngao",
    }
  }

  pub fn from_index(index: usize) -> Option<Self> {
    Self::ALL.get(index).copied()
  }
}

impl fmt::Display for CatLabel {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Error, Debug)]
pub enum ClassifierError {
  #[error("分类器尚未初始化")]
  NotReady,
  #[error("模型加载错误: {0}")]
  ModelLoad(#[from] std::io::Error),
  #[error("推理引擎错误: {0}")]
  Engine(#[from] EngineError),
  #[error("图像解码错误: {0}")]
  Decode(#[from] CodecError),
  #[error("不支持的输入张量: {0}")]
  UnsupportedInput(String),
  #[error("不支持的输出张量类型: {0}")]
  UnsupportedOutput(String),
  #[error("输出张量只有 {actual} 个元素, 需要 {expected} 个")]
  OutputTooSmall { expected: usize, actual: usize },
  #[error("推理执行失败: {0}")]
  Invoke(String),
  #[error("该后端需要指定模型文件")]
  MissingModel,
  #[error("后端 {0} 未编译, 请启用对应的 feature")]
  BackendUnavailable(&'static str),
  #[cfg(feature = "detect_onnx")]
  #[error("ONNX Runtime 错误: {0}")]
  Onnx(String),
}

impl ClassifierError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      ClassifierError::NotReady | ClassifierError::Invoke(_) => ErrorKind::InvokeFailure,
      ClassifierError::ModelLoad(_)
      | ClassifierError::MissingModel
      | ClassifierError::BackendUnavailable(_) => ErrorKind::FormatMismatch,
      ClassifierError::Engine(e) => e.kind(),
      ClassifierError::Decode(e) => e.kind(),
      ClassifierError::UnsupportedInput(_)
      | ClassifierError::UnsupportedOutput(_)
      | ClassifierError::OutputTooSmall { .. } => ErrorKind::FormatMismatch,
      #[cfg(feature = "detect_onnx")]
      ClassifierError::Onnx(_) => ErrorKind::InvokeFailure,
    }
  }
}

/// 将输出张量的前三个元素转换为 0..=255 的分数
///
/// `uint8` 原样使用，`int8` 加 128 平移到无符号区间，其它类型不支持。
pub fn decode_scores(dtype: TensorType, raw: &[u8]) -> Result<[u8; NUM_CLASSES], ClassifierError> {
  if raw.len() < NUM_CLASSES * dtype.size() {
    return Err(ClassifierError::OutputTooSmall {
      expected: NUM_CLASSES,
      actual: raw.len() / dtype.size(),
    });
  }

  let mut scores = [0u8; NUM_CLASSES];
  match dtype {
    TensorType::UInt8 => scores.copy_from_slice(&raw[..NUM_CLASSES]),
    TensorType::Int8 => {
      for (s, &r) in scores.iter_mut().zip(raw) {
        *s = (r as i8 as i16 + 128) as u8;
      }
    }
    other => {
      return Err(ClassifierError::UnsupportedOutput(format!("{:?}", other)));
    }
  }
  Ok(scores)
}

/// 最大分数的下标，分数相同时取较小的下标
pub fn argmax(scores: &[u8; NUM_CLASSES]) -> usize {
  let mut best = 0;
  for (i, &s) in scores.iter().enumerate().skip(1) {
    if s > scores[best] {
      best = i;
    }
  }
  best
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PredictionStatus {
  Ok,
  Failed { kind: ErrorKind, message: String },
}

/// 一次分类的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PredictionResult {
  pub label: Option<CatLabel>,
  pub scores: [u8; NUM_CLASSES],
  #[serde(flatten)]
  pub status: PredictionStatus,
}

impl PredictionResult {
  pub fn from_scores(scores: [u8; NUM_CLASSES]) -> Self {
    Self {
      label: CatLabel::from_index(argmax(&scores)),
      scores,
      status: PredictionStatus::Ok,
    }
  }

  /// 失败时不携带预测标签
  pub fn failed(err: &ClassifierError) -> Self {
    Self {
      label: None,
      scores: [0; NUM_CLASSES],
      status: PredictionStatus::Failed {
        kind: err.kind(),
        message: err.to_string(),
      },
    }
  }

  pub fn predicted_class(&self) -> Option<CatLabel> {
    self.label
  }

  pub fn is_ok(&self) -> bool {
    self.status == PredictionStatus::Ok
  }
}

/// 分类器的生命周期：`setup` 一次，`classify` 多次，`teardown` 一次
///
/// `setup` 失败后实例不可用，`classify` 会返回失败状态而不会 panic。
/// `teardown` 可以重复调用。
pub trait Classifier: Send {
  fn name(&self) -> &'static str;

  /// 模型期望的输入图像尺寸，未初始化时为 `None`
  fn input_size(&self) -> Option<(u32, u32)>;

  fn setup(&mut self, arena_size: usize) -> Result<(), ClassifierError>;

  fn classify(&mut self, jpeg: &[u8]) -> PredictionResult;

  fn teardown(&mut self);
}

impl<C: Classifier + ?Sized> Classifier for Box<C> {
  fn name(&self) -> &'static str {
    (**self).name()
  }

  fn input_size(&self) -> Option<(u32, u32)> {
    (**self).input_size()
  }

  fn setup(&mut self, arena_size: usize) -> Result<(), ClassifierError> {
    (**self).setup(arena_size)
  }

  fn classify(&mut self, jpeg: &[u8]) -> PredictionResult {
    (**self).classify(jpeg)
  }

  fn teardown(&mut self) {
    (**self).teardown()
  }
}

/// 推理后端，编译期可选
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
  /// 只推流，不做分类
  None,
  /// 内置的微型量化解释器
  #[default]
  Micro,
  /// ONNX Runtime，需要 `detect_onnx` feature
  Onnx,
}

impl FromStr for Backend {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "none" => Ok(Backend::None),
      "micro" => Ok(Backend::Micro),
      "onnx" => Ok(Backend::Onnx),
      other => Err(format!("未知的推理后端: {}", other)),
    }
  }
}

impl fmt::Display for Backend {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Backend::None => "none",
      Backend::Micro => "micro",
      Backend::Onnx => "onnx",
    })
  }
}

pub mod micro;
pub use self::micro::MicroClassifier;

#[cfg(feature = "detect_onnx")]
pub mod onnx;
#[cfg(feature = "detect_onnx")]
pub use self::onnx::OnnxClassifier;

/// 按后端构建分类器，`Backend::None` 返回 `None`
pub fn create_classifier(
  backend: Backend,
  model_path: Option<PathBuf>,
) -> Result<Option<Box<dyn Classifier>>, ClassifierError> {
  info!("推理后端: {}", backend);
  match backend {
    Backend::None => Ok(None),
    Backend::Micro => {
      let classifier = match model_path {
        Some(path) => MicroClassifier::from_file(path)?,
        None => MicroClassifier::embedded(),
      };
      Ok(Some(Box::new(classifier)))
    }
    #[cfg(feature = "detect_onnx")]
    Backend::Onnx => {
      let path = model_path.ok_or(ClassifierError::MissingModel)?;
      Ok(Some(Box::new(OnnxClassifier::from_file(path)?)))
    }
    #[cfg(not(feature = "detect_onnx"))]
    Backend::Onnx => Err(ClassifierError::BackendUnavailable("onnx")),
  }
}
