// 该文件是 Kanmao （看猫） 项目的一部分。
// src/args.rs - 项目参数配置
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

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use url::Url;

use kanmao::model::Backend;
use kanmao::task::DEFAULT_ARENA_SIZE;

/// Kanmao 项目参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 输入来源
  /// 支持格式:
  /// - 测试图案: test://?width=96&height=96&scene=cycle
  /// - 图片: image:///path/to/frames（文件或目录）
  /// - V4L2: v4l:///dev/video0（需要 v4l_input feature）
  #[arg(long, value_name = "SOURCE", default_value = "test://?width=96&height=96")]
  pub input: Url,

  /// HTTP 监听地址
  #[arg(long, value_name = "ADDR", default_value = "0.0.0.0:8080")]
  pub listen: SocketAddr,

  /// 推理后端: none, micro, onnx
  #[arg(long, value_name = "BACKEND", default_value = "micro")]
  pub detect: Backend,

  /// 模型文件路径，micro 后端缺省时使用内置模型
  #[arg(long, value_name = "MODEL")]
  pub model: Option<PathBuf>,

  /// 张量 arena 大小（字节）
  #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_ARENA_SIZE)]
  pub arena_size: usize,

  /// 帧缓冲数量，URL 中的 pool 参数优先
  #[arg(long, value_name = "N", default_value_t = 2)]
  pub pool_size: usize,

  /// 推理超过该时间未完成时告警（毫秒）
  #[arg(long, value_name = "MS", default_value_t = 5000)]
  pub stall_timeout_ms: u64,

  /// 启动前用内置图片自检分类器
  #[arg(long)]
  pub self_test: bool,
}

impl Args {
  pub fn stall_timeout(&self) -> Duration {
    Duration::from_millis(self.stall_timeout_ms)
  }

  /// 把 `--pool-size` 补进输入 URL
  pub fn input_url(&self) -> Url {
    let mut url = self.input.clone();
    if !url.query_pairs().any(|(k, _)| k == "pool") {
      url
        .query_pairs_mut()
        .append_pair("pool", &self.pool_size.to_string());
    }
    url
  }
}
