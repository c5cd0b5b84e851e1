// 该文件是 Kanmao （看猫） 项目的一部分。
// src/model/micro.rs - 微型解释器分类器
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

use std::borrow::Cow;
use std::path::Path;

use tracing::{debug, error, info, trace};

use crate::{
  codec::{ImageCodec, JpegCodec, to_signed_in_place},
  engine::{
    Arena, Interpreter, MemoryRegion, Model, OpResolver, TensorType, classifier_op_resolver,
  },
  frame::PixelFormat,
  model::{Classifier, ClassifierError, PredictionResult, decode_scores},
};

/// 固件内嵌的分类模型
pub static EMBEDDED_MODEL: &[u8] = include_bytes!("../../assets/cat_classifier.kmdl");

pub struct MicroClassifier<C: ImageCodec = JpegCodec> {
  model_data: Cow<'static, [u8]>,
  codec: C,
  // 释放顺序：解释器、注册表、arena
  interpreter: Option<Interpreter>,
  resolver: Option<OpResolver<7>>,
  arena: Option<Arena>,
}

impl MicroClassifier<JpegCodec> {
  pub fn embedded() -> Self {
    Self::with_codec(Cow::Borrowed(EMBEDDED_MODEL), JpegCodec)
  }

  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ClassifierError> {
    let path = path.as_ref();
    info!("加载模型文件: {}", path.display());
    let data = std::fs::read(path)?;
    debug!("模型文件大小: {:.2} KB", data.len() as f64 / 1024.0);
    Ok(Self::with_codec(Cow::Owned(data), JpegCodec))
  }

  pub fn from_bytes(data: Vec<u8>) -> Self {
    Self::with_codec(Cow::Owned(data), JpegCodec)
  }
}

impl<C: ImageCodec> MicroClassifier<C> {
  pub fn with_codec(model_data: Cow<'static, [u8]>, codec: C) -> Self {
    Self {
      model_data,
      codec,
      interpreter: None,
      resolver: None,
      arena: None,
    }
  }

  pub fn is_ready(&self) -> bool {
    self.interpreter.is_some() && self.arena.is_some()
  }

  fn run(&mut self, jpeg: &[u8]) -> Result<[u8; 3], ClassifierError> {
    let (Some(interpreter), Some(arena)) = (self.interpreter.as_ref(), self.arena.as_mut()) else {
      return Err(ClassifierError::NotReady);
    };

    let input = interpreter.input();
    let dtype = input.dtype;
    let format = PixelFormat::from_channels(input.last_dim()).ok_or_else(|| {
      ClassifierError::UnsupportedInput(format!("{} 的通道数 {}", input.name, input.last_dim()))
    })?;

    let buffer = interpreter.input_buffer(arena)?;
    let (w, h) = self.codec.decode(jpeg, format, buffer)?;
    trace!("解码 {}x{} 到输入张量", w, h);
    if dtype == TensorType::Int8 {
      to_signed_in_place(buffer);
    }

    interpreter
      .invoke(arena)
      .map_err(|e| ClassifierError::Invoke(e.to_string()))?;

    let output = interpreter.output();
    decode_scores(output.dtype, interpreter.output_buffer(arena)?)
  }
}

impl<C: ImageCodec> Classifier for MicroClassifier<C> {
  fn name(&self) -> &'static str {
    "micro"
  }

  fn input_size(&self) -> Option<(u32, u32)> {
    let input = self.interpreter.as_ref()?.input();
    match input.shape.as_slice() {
      [_, h, w, _] => Some((*w as u32, *h as u32)),
      _ => None,
    }
  }

  /// 依次：校验模型版本、分配 arena、注册算子、构建解释器并分配张量
  fn setup(&mut self, arena_size: usize) -> Result<(), ClassifierError> {
    self.teardown();

    let model = Model::from_bytes(&self.model_data).inspect_err(|e| {
      error!("模型校验失败: {}", e);
    })?;
    info!("模型 schema 版本 {}", model.version());

    let arena = Arena::allocate(arena_size, MemoryRegion::External)?;
    let resolver = classifier_op_resolver()?;
    let mut interpreter = Interpreter::new(&model, &resolver)?;
    interpreter.allocate_tensors(&arena).inspect_err(|e| {
      error!("张量分配失败: {}", e);
    })?;

    let input = interpreter.input();
    let channels_ok = PixelFormat::from_channels(input.last_dim()).is_some();
    if input.dtype == TensorType::Float32 || !channels_ok {
      error!("输入张量 {} {:?} {:?} 不受支持", input.name, input.dtype, input.shape);
      return Err(ClassifierError::UnsupportedInput(format!(
        "{} {:?} {:?}",
        input.name, input.dtype, input.shape
      )));
    }
    info!(
      "分类器就绪: 输入 {:?} {:?}, arena 使用 {} / {} 字节",
      input.dtype,
      input.shape,
      interpreter.arena_used_bytes(),
      arena.len()
    );

    self.arena = Some(arena);
    self.resolver = Some(resolver);
    self.interpreter = Some(interpreter);
    Ok(())
  }

  fn classify(&mut self, jpeg: &[u8]) -> PredictionResult {
    match self.run(jpeg) {
      Ok(scores) => PredictionResult::from_scores(scores),
      Err(e) => {
        error!("分类失败: {}", e);
        PredictionResult::failed(&e)
      }
    }
  }

  fn teardown(&mut self) {
    if self.interpreter.take().is_some() {
      debug!("释放解释器");
    }
    if self.resolver.take().is_some() {
      debug!("释放算子注册表");
    }
    if self.arena.take().is_some() {
      debug!("释放 arena");
    }
  }
}

impl<C: ImageCodec> Drop for MicroClassifier<C> {
  fn drop(&mut self) {
    self.teardown();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    ErrorKind,
    engine::{EngineError, Graph, Operator, SCHEMA_VERSION, TensorSpec},
    input::encode_solid_jpeg,
    model::CatLabel,
  };

  const ARENA: usize = 128 * 1024;

  fn ready() -> MicroClassifier {
    let mut c = MicroClassifier::embedded();
    c.setup(ARENA).unwrap();
    c
  }

  fn classify_color(c: &mut MicroClassifier, color: [u8; 3]) -> PredictionResult {
    let (w, h) = c.input_size().unwrap();
    let jpeg = encode_solid_jpeg(w, h, color, 95).unwrap();
    c.classify(&jpeg)
  }

  #[test]
  fn embedded_model_reports_input_size() {
    let c = ready();
    assert_eq!(c.input_size(), Some((96, 96)));
  }

  #[test]
  fn classifies_scene_colors() {
    let mut c = ready();
    let r = classify_color(&mut c, [14, 14, 16]);
    assert_eq!(r.predicted_class(), Some(CatLabel::Empty));
    let r = classify_color(&mut c, [226, 122, 44]);
    assert_eq!(r.predicted_class(), Some(CatLabel::Nachi));
    let r = classify_color(&mut c, [58, 92, 218]);
    assert_eq!(r.predicted_class(), Some(CatLabel::Ngao));
    assert!(r.is_ok());
  }

  #[test]
  fn classify_before_setup_fails_without_panic() {
    let mut c = MicroClassifier::embedded();
    let r = c.classify(&[0xff, 0xd8]);
    assert!(!r.is_ok());
    assert_eq!(r.predicted_class(), None);
  }

  #[test]
  fn wrong_schema_version_fails_setup() {
    let model = Model::from_bytes(EMBEDDED_MODEL).unwrap();
    let graph: Graph = model.graph().clone();
    let data = Model::encode(SCHEMA_VERSION + 1, &graph).unwrap();
    let mut c = MicroClassifier::from_bytes(data);
    let err = c.setup(ARENA).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FormatMismatch);
    assert!(!c.is_ready());
  }

  #[test]
  fn tiny_arena_fails_setup() {
    let mut c = MicroClassifier::embedded();
    let err = c.setup(1024).unwrap_err();
    assert!(matches!(
      err,
      ClassifierError::Engine(EngineError::OutOfMemory { .. })
    ));
    assert_eq!(err.kind(), ErrorKind::ResourceExhaustion);
    assert!(!c.is_ready());
  }

  #[test]
  fn wrong_frame_size_is_a_decode_failure() {
    let mut c = ready();
    let jpeg = encode_solid_jpeg(32, 32, [0, 0, 0], 90).unwrap();
    let r = c.classify(&jpeg);
    assert!(!r.is_ok());
    match r.status {
      crate::model::PredictionStatus::Failed { kind, .. } => {
        assert_eq!(kind, ErrorKind::DecodeFailure)
      }
      _ => unreachable!(),
    }
  }

  #[test]
  fn garbage_is_a_decode_failure_and_instance_survives() {
    let mut c = ready();
    assert!(!c.classify(b"not a jpeg").is_ok());
    let r = classify_color(&mut c, [226, 122, 44]);
    assert_eq!(r.predicted_class(), Some(CatLabel::Nachi));
  }

  fn tensor(name: &str, dtype: TensorType, shape: &[usize]) -> TensorSpec {
    TensorSpec {
      name: name.into(),
      dtype,
      shape: shape.to_vec(),
      scale: 1.0,
      zero_point: 0,
    }
  }

  /// uint8 输入，各通道均值原样量化为分数
  fn uint8_passthrough_model() -> Vec<u8> {
    let graph = Graph {
      tensors: vec![
        tensor("image", TensorType::UInt8, &[1, 8, 8, 3]),
        tensor("mean", TensorType::Float32, &[1, 3]),
        tensor("scores", TensorType::UInt8, &[1, 3]),
      ],
      input: 0,
      output: 2,
      operators: vec![
        Operator::Mean {
          input: 0,
          output: 1,
        },
        Operator::Quantize {
          input: 1,
          output: 2,
        },
      ],
    };
    Model::encode(SCHEMA_VERSION, &graph).unwrap()
  }

  #[test]
  fn float_input_fails_setup() {
    let model = Model::from_bytes(&uint8_passthrough_model()).unwrap();
    let mut graph = model.graph().clone();
    graph.tensors[0].dtype = TensorType::Float32;
    let mut c = MicroClassifier::from_bytes(Model::encode(SCHEMA_VERSION, &graph).unwrap());
    let err = c.setup(ARENA).unwrap_err();
    assert!(matches!(err, ClassifierError::UnsupportedInput(_)));
    assert_eq!(err.kind(), ErrorKind::FormatMismatch);
    assert!(!c.is_ready());
  }

  #[test]
  fn uint8_input_is_not_flipped() {
    let mut c = MicroClassifier::from_bytes(uint8_passthrough_model());
    c.setup(ARENA).unwrap();
    let color = [200, 40, 120];
    let r = classify_color(&mut c, color);
    assert!(r.is_ok());
    // 若做了 XOR 0x80，分数会变成 72/168/248
    for (score, expected) in r.scores.iter().zip(color) {
      assert!(score.abs_diff(expected) <= 4, "{:?} vs {:?}", r.scores, color);
    }
    assert_eq!(r.predicted_class(), Some(CatLabel::Empty));
  }

  #[test]
  fn teardown_is_idempotent() {
    let mut c = ready();
    c.teardown();
    c.teardown();
    assert!(!c.is_ready());
    assert_eq!(c.input_size(), None);
  }
}
