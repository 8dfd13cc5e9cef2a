//! HTTP 执行原语
//!
//! 工作池只依赖 [`HttpExecutor`] trait, 生产环境使用基于 reqwest 的
//! [`ReqwestExecutor`], 测试中可以替换为脚本化实现。

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::{PoolError, Result};

/// 一次出站调用
#[derive(Debug, Clone)]
pub struct HttpCall {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub query: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub timeout: Duration,
}

/// 未经校验的原始响应
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }
}

pub trait HttpExecutor: Send + Sync + 'static {
    fn execute(&self, call: HttpCall) -> BoxFuture<'static, Result<RawResponse>>;
}

/// 基于 reqwest 的实现, 内部 Client 共享连接池
#[derive(Debug, Clone)]
pub struct ReqwestExecutor {
    client: reqwest::Client,
}

impl ReqwestExecutor {
    pub fn new() -> Result<Self> {
        let client = reqwest::ClientBuilder::new()
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PoolError::Transport(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl HttpExecutor for ReqwestExecutor {
    fn execute(&self, call: HttpCall) -> BoxFuture<'static, Result<RawResponse>> {
        let client = self.client.clone();
        async move {
            let method = reqwest::Method::from_bytes(call.method.as_bytes())
                .map_err(|e| PoolError::Transport(e.to_string()))?;
            let mut builder = client
                .request(method, &call.url)
                .timeout(call.timeout)
                .query(&call.query);
            for (name, value) in &call.headers {
                builder = builder.header(name, value);
            }
            if let Some(body) = call.body {
                builder = builder.header("Content-Type", "application/json").body(body);
            }

            let resp = builder.send().await.map_err(|e| {
                if e.is_timeout() {
                    PoolError::Timeout(call.timeout)
                } else {
                    PoolError::Transport(e.to_string())
                }
            })?;

            let status = resp.status().as_u16();
            let headers = resp
                .headers()
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
                .collect();
            let body = resp
                .bytes()
                .await
                .map_err(|e| PoolError::Transport(e.to_string()))?;

            Ok(RawResponse { status, headers, body })
        }
        .boxed()
    }
}
