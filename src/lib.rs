//! dispatch_pool 核心库入口
//!
//! 把 RPC 风格的 HTTP 调用分发到一组固定的上游节点(Point)上,
//! 按成功/失败情况动态伸缩每个节点的并发, 失败请求自动重定向到更健康的节点,
//! 并支持把多个单条请求合并成一次 JSON 数组批量调用。

pub mod config;
pub mod error;
pub mod endpoint;
pub mod request;
pub mod transport;
pub mod check;
pub mod report;
pub mod point;
mod worker;
mod group;
pub mod pool;
pub mod batch;

pub use batch::BatchPool;
pub use check::{check_response, json_path, BatchSupportHook, ErrorFieldHook, ResponseHook};
pub use config::{BatchConfig, PoolConfig};
pub use endpoint::Endpoint;
pub use error::{PoolError, Result};
pub use point::PointSnapshot;
pub use group::GroupResult;
pub use pool::{Pool, PoolBuilder};
pub use report::{ErrorReporter, LogReporter};
pub use request::{GroupId, Request, RequestId, Response, RetryBudget};
pub use transport::{HttpCall, HttpExecutor, RawResponse, ReqwestExecutor};
