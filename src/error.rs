//! 通用错误类型

use std::time::Duration;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PoolError {
    #[error("传输错误: {0}")]
    Transport(String),

    #[error("请求超时({0:?})")]
    Timeout(Duration),

    #[error("非2xx状态码: {0}")]
    Status(u16),

    #[error("响应不是合法JSON: {0}")]
    InvalidJson(String),

    #[error("响应被钩子拒绝: {0}")]
    Rejected(String),

    #[error("重试次数耗尽({attempts}次), 最后错误: {last}")]
    RetriesExhausted { attempts: u32, last: Box<PoolError> },

    #[error("调用已取消")]
    Cancelled,

    #[error("请求组为空")]
    EmptyGroup,

    #[error("没有可用的上游节点")]
    NoEndpoints,

    #[error("配置错误: {0}")]
    Config(String),

    #[error("工作池已关闭")]
    ShutDown,
}

impl PoolError {
    /// 是否可以通过重试/重定向恢复
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PoolError::Transport(_)
                | PoolError::Timeout(_)
                | PoolError::Status(_)
                | PoolError::InvalidJson(_)
                | PoolError::Rejected(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;
