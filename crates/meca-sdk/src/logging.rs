//! 日志初始化

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// 安装全局 tracing 订阅者
///
/// 默认级别 `info`，可用 `RUST_LOG` 覆盖；`log` crate 的记录经 `tracing-log` 转发。
/// 重复调用无副作用；宿主程序已安装订阅者时保留宿主的。
pub fn init_logger() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
        let _ = tracing_log::LogTracer::init();
    });
}
