//! 日志初始化
//!
//! 调用核心本身只通过 `tracing` 宏输出日志，是否安装订阅者由使用方决定。
//! Hook 链事件使用 `flare_rpc_caller::handler` target 的 DEBUG 级别，默认关闭，
//! 需要排查调用时可以通过 `RUST_LOG=flare_rpc_caller::handler=debug` 单独打开。

use tracing_subscriber::{EnvFilter, fmt};

use crate::config::LoggingConfig;

/// 从配置初始化日志系统
///
/// 优先使用环境变量 `RUST_LOG`，否则使用配置中的级别；重复初始化时返回 `false`。
///
/// # 示例
/// ```rust,no_run
/// use flare_rpc_caller::config::LoggingConfig;
/// use flare_rpc_caller::logging::init_tracing_from_config;
///
/// init_tracing_from_config(None);
///
/// let config = LoggingConfig {
///     level: "flare_rpc_caller::handler=debug".to_string(),
///     ..LoggingConfig::default()
/// };
/// init_tracing_from_config(Some(&config));
/// ```
pub fn init_tracing_from_config(logging_config: Option<&LoggingConfig>) -> bool {
    let default_config = LoggingConfig::default();
    let config = logging_config.unwrap_or(&default_config);

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new(config.level.as_str()),
    };

    fmt::Subscriber::builder()
        .with_target(config.with_target)
        .with_thread_ids(config.with_thread_ids)
        .with_file(config.with_file)
        .with_line_number(config.with_line_number)
        .with_env_filter(env_filter)
        .try_init()
        .is_ok()
}
