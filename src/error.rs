//! Flare RPC Caller 错误类型模块
//!
//! - 调用方在正常路径上看不到这些错误：传输失败与 Hook 失败都会被转成生命周期事件
//! - 这里的类型服务于配置加载、重试策略回调（`on_throw`）以及与 `tonic::Status` 的互转

use thiserror::Error;
use tonic::{Code, Status};

/// 重试策略放弃重试时抛给 `on_throw` 的终止性错误
#[derive(Debug, Clone, Error)]
#[error("retry exhausted for {method} after {attempts} attempts{}", last_status_suffix(.last_status))]
pub struct ExhaustedRetryError {
    /// 目标方法的全名
    pub method: String,
    /// 已经尝试的次数（含首次调用）
    pub attempts: u32,
    /// 最后一次失败对应的传输状态
    pub last_status: Option<Status>,
}

fn last_status_suffix(status: &Option<Status>) -> String {
    match status {
        Some(status) => format!(": {:?} {}", status.code(), status.message()),
        None => String::new(),
    }
}

impl ExhaustedRetryError {
    pub fn new<T: Into<String>>(method: T, attempts: u32) -> Self {
        Self {
            method: method.into(),
            attempts,
            last_status: None,
        }
    }

    pub fn with_last_status(mut self, status: Status) -> Self {
        self.last_status = Some(status);
        self
    }
}

/// RPC 调用核心错误类型
#[derive(Debug, Error)]
pub enum CallerError {
    /// 未配置可用的连接
    #[error("no channel configured")]
    NoChannel,

    /// 传输层返回的失败状态
    #[error("transport failure: {}", .0.message())]
    Transport(Status),

    /// 外部重试策略耗尽
    #[error(transparent)]
    ExhaustedRetry(#[from] ExhaustedRetryError),

    /// 配置非法
    #[error("invalid configuration: {0}")]
    Config(String),

    /// 其他错误
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// 调用核心结果类型
pub type Result<T> = std::result::Result<T, CallerError>;

impl From<Status> for CallerError {
    fn from(status: Status) -> Self {
        CallerError::Transport(status)
    }
}

impl From<CallerError> for Status {
    fn from(err: CallerError) -> Self {
        match err {
            CallerError::NoChannel => Status::unavailable(err.to_string()),
            CallerError::Transport(status) => status,
            CallerError::ExhaustedRetry(inner) => match inner.last_status {
                Some(ref status) => Status::new(status.code(), inner.to_string()),
                None => Status::new(Code::Aborted, inner.to_string()),
            },
            CallerError::Config(_) => Status::failed_precondition(err.to_string()),
            CallerError::Other(e) => Status::internal(format!("Internal error: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_retry_message() {
        let err = ExhaustedRetryError::new("store.StoreService/KvGet", 3)
            .with_last_status(Status::unavailable("UNAVAILABLE"));
        assert_eq!(
            err.to_string(),
            "retry exhausted for store.StoreService/KvGet after 3 attempts: Unavailable UNAVAILABLE"
        );

        let bare = ExhaustedRetryError::new("store.StoreService/KvGet", 1);
        assert_eq!(
            bare.to_string(),
            "retry exhausted for store.StoreService/KvGet after 1 attempts"
        );
    }

    #[test]
    fn test_caller_error_to_status() {
        let status: Status = CallerError::NoChannel.into();
        assert_eq!(status.code(), Code::Unavailable);

        let status: Status = CallerError::Transport(Status::not_found("region")).into();
        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(status.message(), "region");

        let exhausted = ExhaustedRetryError::new("m", 5)
            .with_last_status(Status::resource_exhausted("busy"));
        let status: Status = CallerError::from(exhausted).into();
        assert_eq!(status.code(), Code::ResourceExhausted);

        let status: Status = CallerError::from(ExhaustedRetryError::new("m", 5)).into();
        assert_eq!(status.code(), Code::Aborted);

        let status: Status = CallerError::Config("timeout_ms".to_string()).into();
        assert_eq!(status.code(), Code::FailedPrecondition);
    }
}
