#![allow(dead_code)]

pub mod cluster;
pub mod sim;

use tracing_subscriber::EnvFilter;

/// 初始化日志（RUST_LOG 控制级别，重复调用无副作用）
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
