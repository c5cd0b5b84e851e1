// 该文件是 Kanmao （看猫） 项目的一部分。
// src/bin/oneshot.rs - 单帧分类
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

use std::path::PathBuf;

use anyhow::{Result, anyhow};
use clap::Parser;
use url::Url;

use kanmao::{
  FromUrl,
  input::InputWrapper,
  model::{Backend, create_classifier},
  task::{DEFAULT_ARENA_SIZE, OneShotTask, Task},
};
use tracing::info;

/// 从输入采集若干帧并输出分类结果（JSON 行）
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 输入来源
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 推理后端: micro, onnx
  #[arg(long, value_name = "BACKEND", default_value = "micro")]
  pub detect: Backend,
  /// 模型文件路径
  #[arg(long, value_name = "MODEL")]
  pub model: Option<PathBuf>,
  /// 张量 arena 大小（字节）
  #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_ARENA_SIZE)]
  pub arena_size: usize,
  /// 分类的帧数
  #[arg(long, value_name = "COUNT", default_value_t = 1)]
  pub count: usize,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_writer(std::io::stderr)
    .init();

  let args = Args::parse();

  info!("输入来源: {}", args.input);
  info!("推理后端: {}", args.detect);

  let input = InputWrapper::from_url(&args.input)?;
  let classifier = create_classifier(args.detect, args.model)?
    .ok_or_else(|| anyhow!("单帧分类需要推理后端"))?;

  OneShotTask::default()
    .with_arena_size(args.arena_size)
    .with_count(args.count)
    .run_task(input, classifier, std::io::stdout().lock())?;

  Ok(())
}
