//! 可观测性：tracing 订阅器初始化
//!
//! 默认级别 info，RUST_LOG 覆盖（如 `RUST_LOG=hive=debug` 查看缓存命中与批处理日志）。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    init_with_default("info");
}

/// 未设置 RUST_LOG 时使用 default_directive；重复初始化会被忽略
pub fn init_with_default(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init();
}
