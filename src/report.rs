use crate::endpoint::Endpoint;
use crate::error::PoolError;
use crate::request::Request;

/// 带外异常上报
///
/// 单个请求的错误数每跨过一个 `report_every` 倍数调用一次,
/// 持续失败可见但不会刷屏。
pub trait ErrorReporter: Send + Sync {
    fn report(&self, endpoint: &Endpoint, request: &Request, error: &PoolError);
}

/// 默认实现: 写入 error 日志
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, endpoint: &Endpoint, request: &Request, error: &PoolError) {
        log::error!(
            "request {} (group {}) failed {} times, last on {}: {}",
            request.id,
            request.group(),
            request.error_count(),
            endpoint.url,
            error
        );
    }
}

pub(crate) fn should_report(error_count: u32, every: u32) -> bool {
    every > 0 && error_count > 0 && error_count % every == 0
}
