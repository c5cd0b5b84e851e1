// 该文件是 Kanmao （看猫） 项目的一部分。
// tests/handoff_pipeline.rs - 推流到推理的完整流程
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

use std::net::TcpListener;
use std::sync::{
  Arc, Mutex,
  atomic::{AtomicBool, AtomicUsize, Ordering},
};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded};

use kanmao::{
  codec::{ImageCodec, JpegCodec},
  engine::{EngineError, SCHEMA_VERSION},
  frame::{FrameInfo, FramePool, PixelFormat},
  handoff::{Offer, handoff},
  input::{FrameSource, Scene, SourceOptions, TestPatternSource},
  model::{CatLabel, Classifier, ClassifierError, PredictionResult},
  stream::{StreamHandler, StreamOptions},
  task::{ServeTask, Task},
  worker::{InferenceWorker, StatusBoard},
};

const SIDE: u32 = 16;

/// 按脚本返回分数的分类器，会真正解码输入帧
#[derive(Clone, Default)]
struct Script {
  setup_error: Option<u32>,
  gate: Option<Receiver<()>>,
  started: Option<Sender<()>>,
}

struct ScriptedClassifier {
  script: Script,
  ready: bool,
  calls: Arc<AtomicUsize>,
  active: Arc<AtomicUsize>,
  overlap: Arc<AtomicBool>,
  seen: Arc<Mutex<Vec<u8>>>,
}

impl ScriptedClassifier {
  fn new(script: Script) -> Self {
    Self {
      script,
      ready: false,
      calls: Arc::default(),
      active: Arc::default(),
      overlap: Arc::default(),
      seen: Arc::default(),
    }
  }
}

impl Classifier for ScriptedClassifier {
  fn name(&self) -> &'static str {
    "scripted"
  }

  fn input_size(&self) -> Option<(u32, u32)> {
    self.ready.then_some((SIDE, SIDE))
  }

  fn setup(&mut self, _arena_size: usize) -> Result<(), ClassifierError> {
    if let Some(found) = self.script.setup_error {
      return Err(ClassifierError::Engine(EngineError::SchemaVersionMismatch {
        found,
        supported: SCHEMA_VERSION,
      }));
    }
    self.ready = true;
    Ok(())
  }

  fn classify(&mut self, jpeg: &[u8]) -> PredictionResult {
    self.calls.fetch_add(1, Ordering::SeqCst);
    if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
      self.overlap.store(true, Ordering::SeqCst);
    }
    if let Some(started) = &self.script.started {
      let _ = started.send(());
    }
    if let Some(gate) = &self.script.gate {
      let _ = gate.recv();
    }

    let mut pixels = vec![0u8; (SIDE * SIDE * 3) as usize];
    let result = match JpegCodec.decode(jpeg, PixelFormat::Rgb888, &mut pixels) {
      Ok(_) => {
        self.seen.lock().unwrap().push(pixels[0]);
        PredictionResult::from_scores([5, 250, 10])
      }
      Err(e) => PredictionResult::failed(&ClassifierError::Decode(e)),
    };
    self.active.fetch_sub(1, Ordering::SeqCst);
    result
  }

  fn teardown(&mut self) {
    self.ready = false;
  }
}

fn source(fps: u32) -> TestPatternSource {
  TestPatternSource::new(
    SIDE,
    SIDE,
    Scene::Nachi,
    SourceOptions { pool_size: 2, fps },
  )
}

#[test]
fn decodable_frame_is_classified_as_nachi() {
  let classifier = ScriptedClassifier::new(Script::default());
  let calls = classifier.calls.clone();
  let board = Arc::new(StatusBoard::default());
  let (tx, rx) = handoff();
  let worker = InferenceWorker::new(classifier, rx, board.clone())
    .spawn()
    .unwrap();

  let mut src = source(50);
  let report = StreamHandler::new(&mut src)
    .with_handoff(&tx)
    .with_options(StreamOptions {
      frame_limit: Some(10),
      ..Default::default()
    })
    .run(Vec::new());
  drop(tx);
  worker.join().unwrap();

  assert_eq!(report.frames_sent, 10);
  assert!(report.handed_off >= 1);
  assert_eq!(calls.load(Ordering::SeqCst) as u64, report.handed_off);

  let latest = board.latest().unwrap();
  assert!(latest.is_ok());
  assert_eq!(latest.predicted_class(), Some(CatLabel::Nachi));
  assert_eq!(latest.scores, [5, 250, 10]);
  assert_eq!(src.pool().snapshot().outstanding(), 0);
}

#[test]
fn stream_and_worker_never_share_a_frame() {
  let classifier = ScriptedClassifier::new(Script::default());
  let overlap = classifier.overlap.clone();
  let board = Arc::new(StatusBoard::default());
  let (tx, rx) = handoff();
  let worker = InferenceWorker::new(classifier, rx, board.clone())
    .spawn()
    .unwrap();

  let mut src = source(0);
  let report = StreamHandler::new(&mut src)
    .with_handoff(&tx)
    .with_options(StreamOptions {
      frame_limit: Some(300),
      ..Default::default()
    })
    .run(Vec::new());
  drop(tx);
  worker.join().unwrap();

  // classify 从不并发执行，所有帧都恰好归还一次
  assert!(!overlap.load(Ordering::SeqCst));
  assert_eq!(report.frames_sent, 300);
  assert_eq!(report.handed_off + report.dropped_busy, 300);
  assert_eq!(report.capture_failures, 0);
  assert_eq!(board.inferences(), report.handed_off);
  let pool = src.pool().snapshot();
  assert_eq!(pool.outstanding(), 0);
  assert_eq!(pool.captured, pool.released);
}

#[test]
fn stuck_inference_drops_everything_and_is_flagged() {
  let (gate_tx, gate_rx) = bounded(0);
  let (started_tx, started_rx) = bounded(1);
  let classifier = ScriptedClassifier::new(Script {
    gate: Some(gate_rx),
    started: Some(started_tx),
    ..Default::default()
  });
  let board = Arc::new(StatusBoard::default());
  let (tx, rx) = handoff();
  let worker = InferenceWorker::new(classifier, rx, board.clone())
    .spawn()
    .unwrap();

  let mut src = source(0);
  let first = StreamHandler::new(&mut src)
    .with_handoff(&tx)
    .with_options(StreamOptions {
      frame_limit: Some(1),
      ..Default::default()
    })
    .run(Vec::new());
  assert_eq!(first.handed_off, 1);
  started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
  thread::sleep(Duration::from_millis(30));

  let rest = StreamHandler::new(&mut src)
    .with_handoff(&tx)
    .with_options(StreamOptions {
      stall_timeout: Duration::from_millis(10),
      frame_limit: Some(20),
      ..Default::default()
    })
    .run(Vec::new());

  // 推理卡住期间推流不受影响，但所有新帧都被丢弃
  assert_eq!(rest.frames_sent, 20);
  assert_eq!(rest.handed_off, 0);
  assert_eq!(rest.dropped_busy, 20);
  assert!(tx.stalled(Duration::from_millis(10)).is_some());
  assert!(tx.snapshot().busy);

  gate_tx.send(()).unwrap();
  drop(tx);
  worker.join().unwrap();
  assert_eq!(board.inferences(), 1);
  assert_eq!(src.pool().snapshot().outstanding(), 0);
}

#[test]
fn setup_failure_never_starts_inference() {
  let classifier = ScriptedClassifier::new(Script {
    setup_error: Some(SCHEMA_VERSION + 1),
    ..Default::default()
  });
  let calls = classifier.calls.clone();
  let listener = TcpListener::bind("127.0.0.1:0").unwrap();

  let err = ServeTask::default()
    .run_task(source(0), Some(classifier), listener)
    .unwrap_err();

  let cause = err.downcast_ref::<ClassifierError>().unwrap();
  assert!(matches!(
    cause,
    ClassifierError::Engine(EngineError::SchemaVersionMismatch { .. })
  ));
  assert!(cause.kind().is_fatal_at_setup());
  assert_eq!(calls.load(Ordering::SeqCst), 0);
}

/// 轮询直到条件成立，最多等待 5 秒
fn wait_until(cond: impl Fn() -> bool) -> bool {
  for _ in 0..500 {
    if cond() {
      return true;
    }
    thread::sleep(Duration::from_millis(10));
  }
  false
}

#[test]
fn worker_survives_undecodable_frames() {
  let board = Arc::new(StatusBoard::default());
  let (tx, rx) = handoff();
  let classifier = ScriptedClassifier::new(Script::default());
  let worker = InferenceWorker::new(classifier, rx, board.clone())
    .spawn()
    .unwrap();

  let garbage_pool = FramePool::new(1, 0);
  let garbage = garbage_pool
    .fill(FrameInfo::jpeg(None, None), Duration::ZERO, |buf| {
      buf.extend_from_slice(b"definitely not jpeg");
      Ok(())
    })
    .unwrap();
  assert_eq!(tx.offer(garbage), Offer::HandedOff);
  assert!(wait_until(|| board.inferences() == 1 && !tx.is_busy()));

  // 坏帧记为失败并归还，推理线程继续等待下一帧
  assert_eq!(board.failures(), 1);
  assert_eq!(board.latest().unwrap().predicted_class(), None);
  assert_eq!(garbage_pool.snapshot().outstanding(), 0);

  let mut src = source(0);
  let good = src.capture().unwrap();
  assert_eq!(tx.offer(good), Offer::HandedOff);
  assert!(wait_until(|| board.inferences() == 2 && !tx.is_busy()));

  drop(tx);
  worker.join().unwrap();
  assert_eq!(board.failures(), 1);
  assert_eq!(
    board.latest().unwrap().predicted_class(),
    Some(CatLabel::Nachi)
  );
  assert_eq!(src.pool().snapshot().outstanding(), 0);
  assert_eq!(garbage_pool.snapshot().outstanding(), 0);
}
