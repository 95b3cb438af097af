//! 单次调用的配置包
//!
//! 本层不解释其中任何字段，原样交给传输层；超时与取消语义由传输层负责。

use std::time::Duration;

use tonic::metadata::{AsciiMetadataValue, MetadataMap};

use crate::error::{CallerError, Result};

/// 调用选项
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// 相对超时
    pub deadline: Option<Duration>,
    /// 连接未就绪时是否排队等待
    pub wait_for_ready: bool,
    /// 覆盖通道默认的 authority
    pub authority: Option<String>,
    /// 压缩算法名
    pub compression: Option<String>,
    /// 附加到请求头的元数据
    pub metadata: MetadataMap,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_wait_for_ready(mut self, wait_for_ready: bool) -> Self {
        self.wait_for_ready = wait_for_ready;
        self
    }

    pub fn with_authority<T: Into<String>>(mut self, authority: T) -> Self {
        self.authority = Some(authority.into());
        self
    }

    pub fn with_compression<T: Into<String>>(mut self, compression: T) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// 追加一条 ASCII 元数据
    ///
    /// # Errors
    ///
    /// 键或值不是合法的 gRPC ASCII 元数据时返回 `CallerError::Config`。
    pub fn with_metadata(mut self, key: &str, value: &str) -> Result<Self> {
        let value: AsciiMetadataValue = value
            .parse()
            .map_err(|_| CallerError::Config(format!("invalid metadata value for {key}")))?;
        let key = key
            .parse::<tonic::metadata::AsciiMetadataKey>()
            .map_err(|_| CallerError::Config(format!("invalid metadata key {key}")))?;
        self.metadata.insert(key, value);
        Ok(self)
    }
}
