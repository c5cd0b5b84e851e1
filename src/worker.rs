// 该文件是 Kanmao （看猫） 项目的一部分。
// src/worker.rs - 推理线程
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

use std::sync::{
  Arc, Mutex, PoisonError,
  atomic::{AtomicU64, Ordering},
};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::{
  handoff::HandoffReceiver,
  model::{Classifier, PredictionResult},
};

/// 最近一次分类结果，供状态接口读取
#[derive(Debug, Default)]
pub struct StatusBoard {
  latest: Mutex<Option<PredictionResult>>,
  inferences: AtomicU64,
  failures: AtomicU64,
}

impl StatusBoard {
  pub fn publish(&self, result: PredictionResult) {
    self.inferences.fetch_add(1, Ordering::Relaxed);
    if !result.is_ok() {
      self.failures.fetch_add(1, Ordering::Relaxed);
    }
    *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
  }

  pub fn latest(&self) -> Option<PredictionResult> {
    self
      .latest
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub fn inferences(&self) -> u64 {
    self.inferences.load(Ordering::Relaxed)
  }

  pub fn failures(&self) -> u64 {
    self.failures.load(Ordering::Relaxed)
  }
}

/// 从交接槽取帧、分类、发布结果的循环
///
/// 单帧失败只记录日志，循环继续等待下一帧；推流端全部退出后循环结束，
/// 并释放分类器。
pub struct InferenceWorker<C: Classifier> {
  classifier: C,
  receiver: HandoffReceiver,
  board: Arc<StatusBoard>,
}

impl<C: Classifier> InferenceWorker<C> {
  pub fn new(classifier: C, receiver: HandoffReceiver, board: Arc<StatusBoard>) -> Self {
    Self {
      classifier,
      receiver,
      board,
    }
  }

  pub fn run(mut self) -> C {
    info!("推理线程启动 ({})", self.classifier.name());
    while let Some(job) = self.receiver.wait() {
      let index = job.frame().index();
      let start = Instant::now();
      let result = self.classifier.classify(job.frame().data());
      job.complete();

      match result.predicted_class() {
        Some(label) if result.is_ok() => {
          info!(
            "第 {} 帧: {} {:?} ({:.1} ms)",
            index,
            label,
            result.scores,
            start.elapsed().as_secs_f64() * 1000.0
          );
        }
        _ => warn!("第 {} 帧推理失败: {:?}", index, result.status),
      }
      self.board.publish(result);
    }

    debug!("交接通道关闭");
    self.classifier.teardown();
    info!("推理线程退出");
    self.classifier
  }
}

impl<C: Classifier + 'static> InferenceWorker<C> {
  pub fn spawn(self) -> std::io::Result<JoinHandle<C>> {
    thread::Builder::new()
      .name("inference".into())
      .spawn(move || self.run())
  }
}
