// src/telemetry.rs
use std::io::IsTerminal;
use std::sync::OnceLock;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

static INITIALISED: OnceLock<()> = OnceLock::new();

/// 安装全局 tracing subscriber（RUST_LOG 覆盖默认的 info 级别）。
/// 重复调用是空操作。
pub fn init_tracing() {
    if INITIALISED.set(()).is_err() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr);

    // 测试或嵌入场景下可能已有 subscriber
    let _ = Registry::default().with(filter).with(fmt_layer).try_init();
}
