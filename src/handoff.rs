// 该文件是 Kanmao （看猫） 项目的一部分。
// src/handoff.rs - 推流与推理之间的单槽交接
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

//! # 帧交接
//!
//! 推流端每发出一帧就尝试把它交给推理线程：
//!
//! - 推理线程空闲时帧进入唯一的槽位，并唤醒推理线程；
//! - 推理线程忙时帧直接丢弃（归还帧缓冲），推流端从不等待；
//! - 同一时刻最多只有一帧在推理中。
//!
//! 忙碌标记在推理完成、帧已归还之后才清除，推流端看到空闲时，
//! 上一帧的缓冲一定已经回到池中。

use std::sync::{
  Arc,
  atomic::{AtomicBool, AtomicU64, Ordering},
};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use crossbeam_utils::atomic::AtomicCell;
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::frame::Frame;

struct Shared {
  busy: AtomicBool,
  slot: AtomicCell<Option<Frame>>,
  epoch: Instant,
  // 推理开始时刻，相对 epoch 的毫秒数加一，0 表示空闲
  since: AtomicU64,
  offered: AtomicU64,
  handed_off: AtomicU64,
  dropped_busy: AtomicU64,
  completed: AtomicU64,
}

impl Shared {
  fn mark_started(&self) {
    let now = self.epoch.elapsed().as_millis() as u64 + 1;
    self.since.store(now, Ordering::Release);
  }

  fn in_flight_for(&self) -> Option<Duration> {
    let since = self.since.load(Ordering::Acquire);
    if since == 0 {
      return None;
    }
    let now = self.epoch.elapsed().as_millis() as u64 + 1;
    Some(Duration::from_millis(now.saturating_sub(since)))
  }

  fn finish(&self) {
    self.since.store(0, Ordering::Release);
    self.busy.store(false, Ordering::Release);
  }
}

/// `offer` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
  /// 帧已交给推理线程
  HandedOff,
  /// 推理线程忙，帧已丢弃
  Dropped,
  /// 推理线程已退出，帧已丢弃
  Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HandoffSnapshot {
  pub busy: bool,
  pub offered: u64,
  pub handed_off: u64,
  pub dropped_busy: u64,
  pub completed: u64,
  /// 当前推理已持续的毫秒数
  pub in_flight_ms: Option<u64>,
}

/// 推流端持有的一侧
pub struct HandoffSender {
  shared: Arc<Shared>,
  signal: Sender<()>,
}

/// 推理线程持有的一侧
pub struct HandoffReceiver {
  shared: Arc<Shared>,
  signal: Receiver<()>,
}

pub fn handoff() -> (HandoffSender, HandoffReceiver) {
  let shared = Arc::new(Shared {
    busy: AtomicBool::new(false),
    slot: AtomicCell::new(None),
    epoch: Instant::now(),
    since: AtomicU64::new(0),
    offered: AtomicU64::new(0),
    handed_off: AtomicU64::new(0),
    dropped_busy: AtomicU64::new(0),
    completed: AtomicU64::new(0),
  });
  let (tx, rx) = bounded(1);
  (
    HandoffSender {
      shared: shared.clone(),
      signal: tx,
    },
    HandoffReceiver { shared, signal: rx },
  )
}

impl HandoffSender {
  /// 非阻塞地尝试交出一帧
  pub fn offer(&self, frame: Frame) -> Offer {
    let shared = &self.shared;
    shared.offered.fetch_add(1, Ordering::Relaxed);

    if shared
      .busy
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      shared.dropped_busy.fetch_add(1, Ordering::Relaxed);
      trace!("推理忙, 丢弃第 {} 帧", frame.index());
      frame.release();
      return Offer::Dropped;
    }

    let index = frame.index();
    shared.mark_started();
    shared.slot.store(Some(frame));
    match self.signal.try_send(()) {
      Ok(()) | Err(TrySendError::Full(())) => {
        shared.handed_off.fetch_add(1, Ordering::Relaxed);
        trace!("第 {} 帧交给推理线程", index);
        Offer::HandedOff
      }
      Err(TrySendError::Disconnected(())) => {
        if let Some(frame) = shared.slot.take() {
          frame.release();
        }
        shared.finish();
        debug!("推理线程已退出, 丢弃第 {} 帧", index);
        Offer::Closed
      }
    }
  }

  pub fn is_busy(&self) -> bool {
    self.shared.busy.load(Ordering::Acquire)
  }

  /// 当前推理已经超过 `timeout` 时返回已持续的时间
  pub fn stalled(&self, timeout: Duration) -> Option<Duration> {
    self
      .shared
      .in_flight_for()
      .filter(|elapsed| *elapsed >= timeout)
  }

  pub fn snapshot(&self) -> HandoffSnapshot {
    let shared = &self.shared;
    HandoffSnapshot {
      busy: shared.busy.load(Ordering::Acquire),
      offered: shared.offered.load(Ordering::Relaxed),
      handed_off: shared.handed_off.load(Ordering::Relaxed),
      dropped_busy: shared.dropped_busy.load(Ordering::Relaxed),
      completed: shared.completed.load(Ordering::Relaxed),
      in_flight_ms: shared.in_flight_for().map(|d| d.as_millis() as u64),
    }
  }
}

impl HandoffReceiver {
  /// 阻塞等待下一帧，推流端全部退出后返回 `None`
  pub fn wait(&self) -> Option<InFlight<'_>> {
    loop {
      if self.signal.recv().is_err() {
        return None;
      }
      match self.shared.slot.take() {
        Some(frame) => {
          return Some(InFlight {
            shared: &self.shared,
            frame: Some(frame),
          });
        }
        None => warn!("收到唤醒信号但槽位为空"),
      }
    }
  }
}

/// 正在推理的一帧，drop 时归还帧缓冲并清除忙碌标记
pub struct InFlight<'a> {
  shared: &'a Shared,
  frame: Option<Frame>,
}

impl InFlight<'_> {
  pub fn frame(&self) -> &Frame {
    // frame 只在 drop 时取走
    match &self.frame {
      Some(frame) => frame,
      None => unreachable!(),
    }
  }

  pub fn complete(self) {}
}

impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    if let Some(frame) = self.frame.take() {
      frame.release();
    }
    self.shared.completed.fetch_add(1, Ordering::Relaxed);
    self.shared.finish();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::{FrameInfo, FramePool};
  use std::thread;

  fn frame(pool: &FramePool, tag: u8) -> Frame {
    pool
      .fill(FrameInfo::jpeg(None, None), Duration::ZERO, |buf| {
        buf.push(tag);
        Ok(())
      })
      .unwrap()
  }

  #[test]
  fn second_offer_is_dropped_while_busy() {
    let pool = FramePool::new(3, 8);
    let (tx, rx) = handoff();

    assert_eq!(tx.offer(frame(&pool, 1)), Offer::HandedOff);
    assert!(tx.is_busy());
    assert_eq!(tx.offer(frame(&pool, 2)), Offer::Dropped);
    // 被丢弃的帧立即归还
    assert_eq!(pool.snapshot().outstanding(), 1);

    let job = rx.wait().unwrap();
    assert_eq!(job.frame().data(), &[1]);
    assert_eq!(tx.offer(frame(&pool, 3)), Offer::Dropped);
    job.complete();

    assert!(!tx.is_busy());
    assert_eq!(pool.snapshot().outstanding(), 0);
    assert_eq!(tx.offer(frame(&pool, 4)), Offer::HandedOff);

    let snap = tx.snapshot();
    assert_eq!(snap.offered, 4);
    assert_eq!(snap.handed_off, 2);
    assert_eq!(snap.dropped_busy, 2);
    assert_eq!(snap.completed, 1);
  }

  #[test]
  fn closed_receiver_returns_frame() {
    let pool = FramePool::new(1, 8);
    let (tx, rx) = handoff();
    drop(rx);
    assert_eq!(tx.offer(frame(&pool, 1)), Offer::Closed);
    assert!(!tx.is_busy());
    assert_eq!(pool.snapshot().outstanding(), 0);
  }

  #[test]
  fn wait_ends_when_sender_is_gone() {
    let (tx, rx) = handoff();
    drop(tx);
    assert!(rx.wait().is_none());
  }

  #[test]
  fn long_inference_is_reported_as_stalled() {
    let pool = FramePool::new(1, 8);
    let (tx, rx) = handoff();
    assert!(tx.stalled(Duration::ZERO).is_none());

    tx.offer(frame(&pool, 1));
    let job = rx.wait().unwrap();
    thread::sleep(Duration::from_millis(30));
    assert!(tx.stalled(Duration::from_millis(10)).is_some());
    assert!(tx.stalled(Duration::from_secs(60)).is_none());
    assert!(tx.snapshot().in_flight_ms.is_some());

    drop(job);
    assert!(tx.stalled(Duration::ZERO).is_none());
  }

  #[test]
  fn at_most_one_frame_in_flight_across_threads() {
    let pool = FramePool::new(2, 8);
    let (tx, rx) = handoff();
    let active = Arc::new(AtomicU64::new(0));
    let peak = Arc::new(AtomicU64::new(0));

    let worker = {
      let active = active.clone();
      let peak = peak.clone();
      thread::spawn(move || {
        let mut seen = 0;
        while let Some(job) = rx.wait() {
          let now = active.fetch_add(1, Ordering::SeqCst) + 1;
          peak.fetch_max(now, Ordering::SeqCst);
          thread::sleep(Duration::from_millis(2));
          active.fetch_sub(1, Ordering::SeqCst);
          job.complete();
          seen += 1;
        }
        seen
      })
    };

    for i in 0..200u32 {
      let f = pool
        .fill(FrameInfo::jpeg(None, None), Duration::from_secs(1), |buf| {
          buf.push(i as u8);
          Ok(())
        })
        .unwrap();
      tx.offer(f);
    }
    let snap = tx.snapshot();
    drop(tx);
    let seen = worker.join().unwrap();

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(snap.handed_off + snap.dropped_busy, 200);
    assert!(snap.dropped_busy > 0);
    assert!(seen >= 1);
    assert_eq!(pool.snapshot().outstanding(), 0);
  }
}
