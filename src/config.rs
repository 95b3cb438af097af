//! Flare RPC Caller 配置模块
//!
//! 负责加载调用器的默认调用选项与日志配置，格式为 TOML：
//!
//! ```toml
//! [call]
//! timeout_ms = 3000
//! wait_for_ready = true
//!
//! [call.metadata]
//! x-client = "flare-sdk"
//!
//! [logging]
//! level = "info"
//! ```

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::error::{CallerError, Result};
use crate::options::CallOptions;

/// 指向配置文件的环境变量
pub const CONFIG_PATH_ENV: &str = "FLARE_RPC_CONFIG";

/// 调用器配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CallerConfig {
    /// 默认调用选项
    #[serde(default)]
    pub call: CallOptionsConfig,
    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 默认调用选项配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CallOptionsConfig {
    /// 单次调用超时（毫秒），不配置表示交给传输层默认值
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// 连接未就绪时是否等待
    #[serde(default)]
    pub wait_for_ready: bool,
    /// 覆盖通道 authority
    #[serde(default)]
    pub authority_override: Option<String>,
    /// 压缩算法
    #[serde(default)]
    pub compression: Option<String>,
    /// 附加元数据
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// 日志配置
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别，`RUST_LOG` 优先
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_true")]
    pub with_target: bool,
    #[serde(default)]
    pub with_thread_ids: bool,
    #[serde(default)]
    pub with_file: bool,
    #[serde(default)]
    pub with_line_number: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            with_target: true,
            with_thread_ids: false,
            with_file: false,
            with_line_number: false,
        }
    }
}

impl CallerConfig {
    /// 解析 TOML 文本
    ///
    /// # Errors
    ///
    /// 格式错误或校验失败时返回错误。
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: CallerConfig = toml::from_str(content)
            .map_err(|err| CallerError::Config(format!("invalid caller config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// 校验配置取值
    pub fn validate(&self) -> Result<()> {
        if self.call.timeout_ms == Some(0) {
            return Err(CallerError::Config(
                "call.timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// 转换为默认调用选项
    pub fn call_options(&self) -> Result<CallOptions> {
        self.validate()?;
        let call = &self.call;
        let mut options = CallOptions::new().with_wait_for_ready(call.wait_for_ready);
        if let Some(timeout_ms) = call.timeout_ms {
            options = options.with_deadline(Duration::from_millis(timeout_ms));
        }
        if let Some(authority) = &call.authority_override {
            options = options.with_authority(authority.clone());
        }
        if let Some(compression) = &call.compression {
            options = options.with_compression(compression.clone());
        }
        for (key, value) in &call.metadata {
            options = options.with_metadata(key, value)?;
        }
        Ok(options)
    }
}

/// 从指定路径加载配置
///
/// # Errors
///
/// 文件不可读或内容非法时返回错误。
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<CallerConfig> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("无法读取配置文件: {}", path.display()))?;
    CallerConfig::from_toml_str(&content)
}

/// 从 `FLARE_RPC_CONFIG` 指向的文件加载配置，未设置时使用默认配置
pub fn load_config_from_env() -> Result<CallerConfig> {
    match env::var(CONFIG_PATH_ENV) {
        Ok(path) if !path.trim().is_empty() => load_config(path.trim()),
        _ => Ok(CallerConfig::default()),
    }
}
