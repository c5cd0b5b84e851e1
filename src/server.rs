// 该文件是 Kanmao （看猫） 项目的一部分。
// src/server.rs - HTTP 服务
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

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{
  Arc,
  atomic::{AtomicBool, Ordering},
};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  frame::PoolSnapshot,
  handoff::{HandoffSender, HandoffSnapshot},
  input::FrameSource,
  model::{Backend, PredictionResult},
  stream::{STREAM_CONTENT_TYPE, StreamHandler, StreamOptions},
  worker::StatusBoard,
};

const IO_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_POLL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum ServerError {
  #[error("网络错误: {0}")]
  Io(#[from] io::Error),
}

/// `/status` 的返回内容
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
  pub backend: Backend,
  pub started_at: DateTime<Utc>,
  pub pool: PoolSnapshot,
  pub handoff: Option<HandoffSnapshot>,
  pub stalled: bool,
  pub inferences: u64,
  pub failures: u64,
  pub latest: Option<PredictionResult>,
}

struct Response {
  status: u16,
  body: Vec<u8>,
  content_type: &'static str,
}

impl Response {
  fn json<T: Serialize>(value: &T) -> Self {
    match serde_json::to_vec(value) {
      Ok(body) => Self {
        status: 200,
        body,
        content_type: "application/json",
      },
      Err(_) => Self::error(500, r#"{"error":"serialization failed"}"#),
    }
  }

  fn jpeg(body: Vec<u8>) -> Self {
    Self {
      status: 200,
      body,
      content_type: "image/jpeg",
    }
  }

  fn error(status: u16, message: &str) -> Self {
    Self {
      status,
      body: message.as_bytes().to_vec(),
      content_type: "application/json",
    }
  }
}

struct HttpRequest<'a> {
  method: &'a str,
  path: &'a str,
}

impl<'a> HttpRequest<'a> {
  fn parse(data: &'a [u8]) -> Option<Self> {
    let text = std::str::from_utf8(data).ok()?;
    let mut parts = text.lines().next()?.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    let path = target.split('?').next().unwrap_or(target);
    Some(HttpRequest { method, path })
  }
}

fn write_response(stream: &mut TcpStream, response: &Response) -> io::Result<()> {
  let status_text = match response.status {
    200 => "OK",
    400 => "Bad Request",
    404 => "Not Found",
    405 => "Method Not Allowed",
    500 => "Internal Server Error",
    503 => "Service Unavailable",
    _ => "Unknown",
  };
  let header = format!(
    "HTTP/1.1 {} {}\r\n\
     Content-Type: {}\r\n\
     Content-Length: {}\r\n\
     Access-Control-Allow-Origin: *\r\n\
     Connection: close\r\n\
     \r\n",
    response.status,
    status_text,
    response.content_type,
    response.body.len()
  );
  stream.write_all(header.as_bytes())?;
  stream.write_all(&response.body)?;
  stream.flush()
}

/// 单线程 HTTP 服务，一次只处理一个连接
///
/// - `GET /stream`: MJPEG 推流，同时把帧交给推理线程
/// - `GET /capture`: 单张 JPEG
/// - `GET /status`: JSON 状态
pub struct Server<S: FrameSource> {
  listener: TcpListener,
  source: S,
  handoff: Option<HandoffSender>,
  board: Arc<StatusBoard>,
  backend: Backend,
  options: StreamOptions,
  stop: Arc<AtomicBool>,
  started_at: DateTime<Utc>,
}

impl<S: FrameSource> Server<S> {
  pub fn new(listener: TcpListener, source: S) -> Self {
    Self {
      listener,
      source,
      handoff: None,
      board: Arc::new(StatusBoard::default()),
      backend: Backend::None,
      options: StreamOptions::default(),
      stop: Arc::new(AtomicBool::new(false)),
      started_at: Utc::now(),
    }
  }

  pub fn with_inference(
    mut self,
    handoff: HandoffSender,
    board: Arc<StatusBoard>,
    backend: Backend,
  ) -> Self {
    self.handoff = Some(handoff);
    self.board = board;
    self.backend = backend;
    self
  }

  pub fn with_options(mut self, options: StreamOptions) -> Self {
    self.options = options;
    self
  }

  pub fn with_stop(mut self, stop: Arc<AtomicBool>) -> Self {
    self.stop = stop;
    self
  }

  pub fn local_addr(&self) -> io::Result<SocketAddr> {
    self.listener.local_addr()
  }

  /// 接受连接直到停止标记被设置，返回时交接发送端随之释放
  pub fn serve(mut self) -> Result<(), ServerError> {
    self.listener.set_nonblocking(true)?;
    info!("HTTP 服务监听 {}", self.listener.local_addr()?);

    while !self.stop.load(Ordering::Relaxed) {
      match self.listener.accept() {
        Ok((stream, peer)) => {
          if let Err(e) = self.handle_client(stream, peer) {
            error!("处理客户端 {} 出错: {}", peer, e);
          }
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
        Err(e) => {
          error!("接受连接失败: {}", e);
          thread::sleep(ACCEPT_POLL);
        }
      }
    }

    info!("HTTP 服务停止");
    Ok(())
  }

  fn handle_client(&mut self, mut stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;

    let mut buffer = [0u8; 2048];
    let n = stream.read(&mut buffer)?;
    if n == 0 {
      return Ok(());
    }

    let Some(request) = HttpRequest::parse(&buffer[..n]) else {
      return write_response(&mut stream, &Response::error(400, r#"{"error":"bad request"}"#));
    };
    debug!("{} 请求: {} {}", peer, request.method, request.path);

    match (request.method, request.path) {
      ("GET", "/stream") => self.handle_stream(stream),
      ("GET", "/capture") => {
        let response = self.handle_capture();
        write_response(&mut stream, &response)
      }
      ("GET", "/status") => {
        let response = Response::json(&self.status());
        write_response(&mut stream, &response)
      }
      (_, "/stream" | "/capture" | "/status") => write_response(
        &mut stream,
        &Response::error(405, r#"{"error":"method not allowed"}"#),
      ),
      _ => write_response(&mut stream, &Response::error(404, r#"{"error":"not found"}"#)),
    }
  }

  fn handle_stream(&mut self, mut stream: TcpStream) -> io::Result<()> {
    let header = format!(
      "HTTP/1.1 200 OK\r\n\
       Content-Type: {}\r\n\
       Access-Control-Allow-Origin: *\r\n\
       Cache-Control: no-cache\r\n\
       \r\n",
      STREAM_CONTENT_TYPE
    );
    stream.write_all(header.as_bytes())?;

    let mut handler = StreamHandler::new(&mut self.source)
      .with_options(self.options)
      .with_stop(self.stop.clone());
    if let Some(handoff) = &self.handoff {
      handler = handler.with_handoff(handoff);
    }
    handler.run(&mut stream);
    Ok(())
  }

  fn handle_capture(&mut self) -> Response {
    match self.source.capture() {
      Ok(frame) => {
        let body = frame.data().to_vec();
        self.source.release(frame);
        Response::jpeg(body)
      }
      Err(e) => {
        warn!("单帧采集失败: {}", e);
        Response::error(503, r#"{"error":"capture failed"}"#)
      }
    }
  }

  pub fn status(&self) -> StatusResponse {
    StatusResponse {
      backend: self.backend,
      started_at: self.started_at,
      pool: self.source.pool().snapshot(),
      handoff: self.handoff.as_ref().map(HandoffSender::snapshot),
      stalled: self
        .handoff
        .as_ref()
        .is_some_and(|h| h.stalled(self.options.stall_timeout).is_some()),
      inferences: self.board.inferences(),
      failures: self.board.failures(),
      latest: self.board.latest(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::input::{Scene, SourceOptions, TestPatternSource};

  fn start(options: StreamOptions) -> (SocketAddr, Arc<AtomicBool>, thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let source = TestPatternSource::new(
      16,
      16,
      Scene::Ngao,
      SourceOptions {
        pool_size: 2,
        fps: 0,
      },
    );
    let stop = Arc::new(AtomicBool::new(false));
    let server = Server::new(listener, source)
      .with_options(options)
      .with_stop(stop.clone());
    let addr = server.local_addr().unwrap();
    let handle = thread::spawn(move || server.serve().unwrap());
    (addr, stop, handle)
  }

  fn get(addr: SocketAddr, path: &str) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    write!(stream, "GET {} HTTP/1.1\r\nHost: test\r\n\r\n", path).unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).unwrap();
    out
  }

  #[test]
  fn serves_status_capture_and_stream() {
    let (addr, stop, handle) = start(StreamOptions {
      frame_limit: Some(3),
      ..Default::default()
    });

    let status = String::from_utf8(get(addr, "/status")).unwrap();
    assert!(status.starts_with("HTTP/1.1 200 OK"));
    let body = status.split("\r\n\r\n").nth(1).unwrap();
    let json: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(json["backend"], "none");
    assert_eq!(json["pool"]["capacity"], 2);
    assert!(json["handoff"].is_null());

    let capture = get(addr, "/capture");
    assert!(capture.starts_with(b"HTTP/1.1 200 OK"));
    assert!(
      capture
        .windows(2)
        .any(|w| w == [0xff, 0xd8])
    );

    let stream = get(addr, "/stream?fps=1");
    let text = String::from_utf8_lossy(&stream);
    assert!(text.contains(STREAM_CONTENT_TYPE));
    assert_eq!(text.matches("Content-Type: image/jpeg").count(), 3);

    let missing = String::from_utf8(get(addr, "/nope")).unwrap();
    assert!(missing.starts_with("HTTP/1.1 404"));

    stop.store(true, Ordering::Relaxed);
    handle.join().unwrap();
  }
}
