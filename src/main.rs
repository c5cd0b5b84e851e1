// 该文件是 Kanmao （看猫） 项目的一部分。
// src/main.rs - 项目主程序
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

mod args;

use std::net::TcpListener;
use std::sync::{
  Arc,
  atomic::{AtomicBool, Ordering},
};
use std::{thread, time::Duration};

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kanmao::{
  FromUrl,
  input::InputWrapper,
  model::create_classifier,
  stream::StreamOptions,
  task::{ServeTask, Task},
};

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = args::Args::parse();
  let input_url = args.input_url();

  info!("输入来源: {}", input_url);
  info!("监听地址: {}", args.listen);
  info!("推理后端: {}", args.detect);
  if let Some(model) = &args.model {
    info!("模型文件路径: {}", model.display());
  }

  let stop = Arc::new(AtomicBool::new(false));
  {
    let stop = stop.clone();
    ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      stop.store(true, Ordering::Relaxed);
      thread::spawn(|| {
        thread::sleep(Duration::from_secs(30));
        warn!("强制退出程序");
        std::process::exit(1);
      });
    })?;
  }

  let input = InputWrapper::from_url(&input_url)?;
  let classifier = create_classifier(args.detect, args.model.clone())?;
  let listener = TcpListener::bind(args.listen)?;

  ServeTask::default()
    .with_backend(args.detect)
    .with_arena_size(args.arena_size)
    .with_stream_options(StreamOptions {
      stall_timeout: args.stall_timeout(),
      ..Default::default()
    })
    .with_self_test(args.self_test)
    .with_stop(stop)
    .run_task(input, classifier, listener)?;

  Ok(())
}
