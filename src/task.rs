// 该文件是 Kanmao （看猫） 项目的一部分。
// src/task.rs - 任务编排
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

use std::io::Write;
use std::net::TcpListener;
use std::sync::{Arc, atomic::AtomicBool};
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::{
  handoff::handoff,
  input::{FrameSource, Scene, encode_solid_jpeg},
  model::{Backend, CatLabel, Classifier, PredictionResult},
  server::Server,
  stream::{MIN_POOL_WITH_INFERENCE, StreamOptions},
  worker::{InferenceWorker, StatusBoard},
};

/// 默认 arena 大小 1 MiB
pub const DEFAULT_ARENA_SIZE: usize = 1024 * 1024;

pub trait Task<I, M, O>: Sized {
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<(), Self::Error>;
}

#[derive(Debug, Serialize)]
struct ShotRecord<'a> {
  frame: u64,
  captured_at: DateTime<Utc>,
  elapsed_ms: f64,
  #[serde(flatten)]
  result: &'a PredictionResult,
}

/// 采集若干帧并逐帧分类，每帧输出一行 JSON
#[derive(Debug)]
pub struct OneShotTask {
  arena_size: usize,
  count: usize,
}

impl Default for OneShotTask {
  fn default() -> Self {
    Self {
      arena_size: DEFAULT_ARENA_SIZE,
      count: 1,
    }
  }
}

impl OneShotTask {
  pub fn with_arena_size(mut self, arena_size: usize) -> Self {
    self.arena_size = arena_size;
    self
  }

  pub fn with_count(mut self, count: usize) -> Self {
    self.count = count.max(1);
    self
  }
}

impl<I: FrameSource, M: Classifier, O: Write> Task<I, M, O> for OneShotTask {
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, mut model: M, mut output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    model
      .setup(self.arena_size)
      .context("分类器初始化失败")?;

    let mut times = Vec::with_capacity(self.count);
    for _ in 0..self.count {
      let frame = input.capture().context("采集失败")?;
      let now = Instant::now();
      let result = model.classify(frame.data());
      let elapsed = now.elapsed();
      info!("第 {} 帧推理完成，耗时: {:.2?}", frame.index(), elapsed);

      let record = ShotRecord {
        frame: frame.index(),
        captured_at: frame.timestamp(),
        elapsed_ms: elapsed.as_secs_f64() * 1000.0,
        result: &result,
      };
      input.release(frame);
      serde_json::to_writer(&mut output, &record)?;
      writeln!(output)?;
      times.push(elapsed);
    }

    if times.len() > 1 {
      info!(
        "平均推理时间: {:.2?}",
        times.iter().sum::<Duration>() / times.len() as u32
      );
    }
    model.teardown();
    Ok(())
  }
}

/// 启动前用内置的纯色图自检一次分类器
fn self_test<C: Classifier>(classifier: &mut C) -> anyhow::Result<()> {
  let Some((width, height)) = classifier.input_size() else {
    bail!("分类器未就绪, 无法自检");
  };
  let jpeg = encode_solid_jpeg(width, height, Scene::Nachi.color_at(0, 1), 90)?;

  let now = Instant::now();
  let result = classifier.classify(&jpeg);
  if !result.is_ok() {
    bail!("自检推理失败: {:?}", result.status);
  }
  match result.predicted_class() {
    Some(CatLabel::Nachi) => info!(
      "自检通过: {:?}, 耗时 {:.2?}",
      result.scores,
      now.elapsed()
    ),
    other => warn!("自检结果为 {:?} {:?}, 与预期的 nachi 不符", other, result.scores),
  }
  Ok(())
}

/// 推流服务与推理线程的编排
///
/// 分类器初始化失败时直接返回错误，不会启动推理线程；
/// 没有分类器时只提供推流。
#[derive(Debug)]
pub struct ServeTask {
  backend: Backend,
  arena_size: usize,
  stream: StreamOptions,
  self_test: bool,
  stop: Arc<AtomicBool>,
}

impl Default for ServeTask {
  fn default() -> Self {
    Self {
      backend: Backend::default(),
      arena_size: DEFAULT_ARENA_SIZE,
      stream: StreamOptions::default(),
      self_test: false,
      stop: Arc::new(AtomicBool::new(false)),
    }
  }
}

impl ServeTask {
  pub fn with_backend(mut self, backend: Backend) -> Self {
    self.backend = backend;
    self
  }

  pub fn with_arena_size(mut self, arena_size: usize) -> Self {
    self.arena_size = arena_size;
    self
  }

  pub fn with_stream_options(mut self, options: StreamOptions) -> Self {
    self.stream = options;
    self
  }

  pub fn with_self_test(mut self, self_test: bool) -> Self {
    self.self_test = self_test;
    self
  }

  pub fn with_stop(mut self, stop: Arc<AtomicBool>) -> Self {
    self.stop = stop;
    self
  }
}

impl<I, C> Task<I, Option<C>, TcpListener> for ServeTask
where
  I: FrameSource,
  C: Classifier + 'static,
{
  type Error = anyhow::Error;

  fn run_task(self, input: I, model: Option<C>, output: TcpListener) -> Result<(), Self::Error> {
    info!("开始任务...");
    let capacity = input.pool().capacity();
    if model.is_some() && capacity < MIN_POOL_WITH_INFERENCE {
      bail!(
        "帧缓冲只有 {} 块, 启用推理至少需要 {} 块",
        capacity,
        MIN_POOL_WITH_INFERENCE
      );
    }

    let server = Server::new(output, input)
      .with_options(self.stream)
      .with_stop(self.stop.clone());

    let Some(mut classifier) = model else {
      info!("未启用推理, 只提供推流");
      server.serve()?;
      return Ok(());
    };

    if let Err(e) = classifier.setup(self.arena_size) {
      error!("分类器初始化失败 ({:?}): {}", e.kind(), e);
      return Err(e).context("分类器初始化失败, 不启动推理线程");
    }
    if self.self_test {
      self_test(&mut classifier)?;
    }

    let board = Arc::new(StatusBoard::default());
    let (tx, rx) = handoff();
    let worker = InferenceWorker::new(classifier, rx, board.clone())
      .spawn()
      .context("无法启动推理线程")?;

    // serve 返回时交接发送端随 server 释放，推理线程随之退出
    let served = server.with_inference(tx, board.clone(), self.backend).serve();

    match worker.join() {
      Ok(_) => info!("推理线程已结束, 共推理 {} 帧", board.inferences()),
      Err(_) => error!("推理线程异常退出"),
    }
    served?;

    info!("任务完成，退出");
    Ok(())
  }
}
