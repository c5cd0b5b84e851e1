// 该文件是 Kanmao （看猫） 项目的一部分。
// src/model/onnx.rs - ONNX Runtime 分类器
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

use std::path::Path;

use ort::{
  session::{Session, builder::GraphOptimizationLevel},
  tensor::TensorElementType,
  value::{Tensor, ValueType},
};
use tracing::{debug, error, info};

use crate::{
  codec::{ImageCodec, JpegCodec, to_signed_in_place},
  engine::TensorType,
  frame::PixelFormat,
  model::{Classifier, ClassifierError, PredictionResult, decode_scores},
};

/// 模型默认输入尺寸 (NHWC, RGB)
const DEFAULT_INPUT: (u32, u32) = (96, 96);

fn onnx_err(e: impl std::fmt::Display) -> ClassifierError {
  ClassifierError::Onnx(e.to_string())
}

fn element_type(ty: &ValueType) -> Option<TensorType> {
  match ty {
    ValueType::Tensor { ty, .. } => match ty {
      TensorElementType::Uint8 => Some(TensorType::UInt8),
      TensorElementType::Int8 => Some(TensorType::Int8),
      TensorElementType::Float32 => Some(TensorType::Float32),
      _ => None,
    },
    _ => None,
  }
}

struct Ready {
  session: Session,
  input: TensorType,
  output: TensorType,
  output_name: String,
  // 解码缓冲，setup 时一次性分配
  scratch: Vec<u8>,
}

pub struct OnnxClassifier {
  model_data: Vec<u8>,
  input_size: (u32, u32),
  codec: JpegCodec,
  ready: Option<Ready>,
}

impl OnnxClassifier {
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ClassifierError> {
    let path = path.as_ref();
    info!("加载 ONNX 模型: {}", path.display());
    let model_data = std::fs::read(path)?;
    debug!(
      "模型文件大小: {:.2} MB",
      model_data.len() as f64 / (1024.0 * 1024.0)
    );
    Ok(Self {
      model_data,
      input_size: DEFAULT_INPUT,
      codec: JpegCodec,
      ready: None,
    })
  }

  pub fn with_input_size(mut self, width: u32, height: u32) -> Self {
    self.input_size = (width, height);
    self
  }

  fn run(&mut self, jpeg: &[u8]) -> Result<[u8; 3], ClassifierError> {
    let ready = self.ready.as_mut().ok_or(ClassifierError::NotReady)?;
    let (w, h) = self.input_size;

    self
      .codec
      .decode(jpeg, PixelFormat::Rgb888, &mut ready.scratch)?;
    if ready.input == TensorType::Int8 {
      to_signed_in_place(&mut ready.scratch);
    }

    let shape = [1usize, h as usize, w as usize, 3];
    let input = match ready.input {
      TensorType::Int8 => {
        let data = ready.scratch.iter().map(|&b| b as i8).collect::<Vec<_>>();
        Tensor::from_array((shape, data)).map_err(onnx_err)?.into_dyn()
      }
      _ => Tensor::from_array((shape, ready.scratch.clone()))
        .map_err(onnx_err)?
        .into_dyn(),
    };

    let outputs = ready
      .session
      .run(ort::inputs![input])
      .map_err(|e| ClassifierError::Invoke(e.to_string()))?;
    let output = outputs
      .get(&ready.output_name)
      .ok_or_else(|| ClassifierError::Invoke("模型没有输出".to_string()))?;

    match ready.output {
      TensorType::UInt8 => {
        let tensor = output.try_extract_tensor::<u8>().map_err(onnx_err)?;
        decode_scores(TensorType::UInt8, tensor.1)
      }
      TensorType::Int8 => {
        let tensor = output.try_extract_tensor::<i8>().map_err(onnx_err)?;
        let raw = tensor.1.iter().map(|&v| v as u8).collect::<Vec<_>>();
        decode_scores(TensorType::Int8, &raw)
      }
      other => Err(ClassifierError::UnsupportedOutput(format!("{:?}", other))),
    }
  }
}

impl Classifier for OnnxClassifier {
  fn name(&self) -> &'static str {
    "onnx"
  }

  fn input_size(&self) -> Option<(u32, u32)> {
    self.ready.as_ref().map(|_| self.input_size)
  }

  fn setup(&mut self, arena_size: usize) -> Result<(), ClassifierError> {
    self.teardown();

    let (w, h) = self.input_size;
    let needed = w as usize * h as usize * 3;
    if needed > arena_size {
      return Err(ClassifierError::Engine(
        crate::engine::EngineError::OutOfMemory {
          required: needed,
          available: arena_size,
        },
      ));
    }

    let session = Session::builder()
      .map_err(onnx_err)?
      .with_optimization_level(GraphOptimizationLevel::Level3)
      .map_err(onnx_err)?
      .with_intra_threads(1)
      .map_err(onnx_err)?
      .commit_from_memory(&self.model_data)
      .map_err(onnx_err)?;

    let input = session
      .inputs
      .first()
      .and_then(|i| element_type(&i.input_type))
      .filter(|t| *t != TensorType::Float32)
      .ok_or_else(|| ClassifierError::UnsupportedInput("输入张量必须是 uint8/int8".into()))?;
    let (output_name, output) = session
      .outputs
      .first()
      .and_then(|o| Some((o.name.clone(), element_type(&o.output_type)?)))
      .ok_or_else(|| ClassifierError::UnsupportedOutput("未知的输出张量类型".into()))?;
    if output == TensorType::Float32 {
      error!("输出张量类型 {:?} 不受支持", output);
      return Err(ClassifierError::UnsupportedOutput(format!("{:?}", output)));
    }

    info!("ONNX 分类器就绪: 输入 {:?} {}x{}, 输出 {:?}", input, w, h, output);
    self.ready = Some(Ready {
      session,
      input,
      output,
      output_name,
      scratch: vec![0u8; needed],
    });
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
    if self.ready.take().is_some() {
      debug!("释放 ONNX 会话");
    }
  }
}
