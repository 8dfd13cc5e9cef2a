//! 请求与响应数据模型

use std::collections::HashMap;

use serde_json::Value;
use uuid::Uuid;

use crate::error::PoolError;

/// 组内唯一的请求标识
pub type RequestId = String;

/// 同一次提交的请求共享的组标识
pub type GroupId = Uuid;

/// 重试预算
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryBudget {
    /// 提交时解析为 `节点数 × max_retry_attempts`
    #[default]
    Default,
    Limited(u32),
    Unlimited,
}

impl RetryBudget {
    pub(crate) fn resolve(self, endpoint_count: usize, max_retry_attempts: u32) -> Self {
        match self {
            RetryBudget::Default => {
                let n = (endpoint_count as u32).saturating_mul(max_retry_attempts);
                RetryBudget::Limited(n.max(1))
            }
            RetryBudget::Limited(n) => RetryBudget::Limited(n.max(1)),
            RetryBudget::Unlimited => RetryBudget::Unlimited,
        }
    }

    pub(crate) fn allows(self, attempts: u32) -> bool {
        match self {
            RetryBudget::Limited(n) => attempts < n,
            RetryBudget::Default | RetryBudget::Unlimited => true,
        }
    }
}

/// 成功的响应
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Value,
}

/// 一个工作单元
///
/// 同一时刻只被一个 worker 持有, 通过队列交接所有权。
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub body: Value,
    pub query: Vec<(String, String)>,
    pub headers: HashMap<String, String>,
    pub retry_budget: RetryBudget,
    pub(crate) group: GroupId,
    pub(crate) attempts: u32,
    pub(crate) error_count: u32,
    pub(crate) last_error: Option<PoolError>,
    /// point 下标 -> 在该节点上最后一次看到的错误
    pub(crate) tried: HashMap<usize, PoolError>,
    pub(crate) redirects: u32,
    pub(crate) escape_on_reject: bool,
    pub(crate) outcome: Option<Result<Response, PoolError>>,
}

impl Request {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, body: Value) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            body,
            query: Vec::new(),
            headers: HashMap::new(),
            retry_budget: RetryBudget::Default,
            group: Uuid::nil(),
            attempts: 0,
            error_count: 0,
            last_error: None,
            tried: HashMap::new(),
            redirects: 0,
            escape_on_reject: false,
            outcome: None,
        }
    }

    /// JSON-RPC 2.0 风格的 POST 请求
    pub fn rpc(id: impl Into<RequestId>, method: &str, params: Value) -> Self {
        let id = id.into();
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id.clone(),
            "method": method,
            "params": params,
        });
        Self::new(id, "POST", body)
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_retry_budget(mut self, budget: RetryBudget) -> Self {
        self.retry_budget = budget;
        self
    }

    /// 被响应钩子拒绝时直接结束, 交由提交方换一条分发路径
    pub fn escape_on_reject(mut self) -> Self {
        self.escape_on_reject = true;
        self
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn last_error(&self) -> Option<&PoolError> {
        self.last_error.as_ref()
    }

    pub fn response(&self) -> Option<&Response> {
        self.outcome.as_ref().and_then(|o| o.as_ref().ok())
    }

    /// 终态错误
    pub fn error(&self) -> Option<&PoolError> {
        self.outcome.as_ref().and_then(|o| o.as_ref().err())
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn into_result(self) -> crate::Result<Response> {
        match self.outcome {
            Some(outcome) => outcome,
            None => Err(self.last_error.unwrap_or(PoolError::Cancelled)),
        }
    }

    /// 重新提交前清空上一轮的分发状态
    pub(crate) fn reset_dispatch_state(&mut self) {
        self.attempts = 0;
        self.error_count = 0;
        self.last_error = None;
        self.tried.clear();
        self.redirects = 0;
        self.outcome = None;
    }

    pub(crate) fn record_failure(&mut self, point: usize, err: PoolError) {
        self.error_count += 1;
        self.tried.insert(point, err.clone());
        self.last_error = Some(err);
    }

    pub(crate) fn budget_left(&self) -> bool {
        self.retry_budget.allows(self.attempts)
    }

    /// 首次写入有效, 之后忽略
    pub(crate) fn finish(&mut self, outcome: Result<Response, PoolError>) {
        if self.outcome.is_none() {
            self.outcome = Some(outcome);
        }
    }

    /// 以最后一次错误结束
    pub(crate) fn exhaust(&mut self) {
        let last = self
            .last_error
            .clone()
            .unwrap_or_else(|| PoolError::Transport("no attempt made".into()));
        self.finish(Err(PoolError::RetriesExhausted {
            attempts: self.attempts,
            last: Box::new(last),
        }));
    }
}
