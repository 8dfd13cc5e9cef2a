//! 工作池配置
//!
//! 所有时长字段在 JSON 中以毫秒整数表示, 缺省字段使用默认值。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PoolError, Result};

/// Pool 与 Point 的调参
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// 每个 Point 启动时的 worker 数
    pub default_concurrency: usize,
    /// 每个 Point 的 worker 上限
    pub max_concurrency: usize,
    /// 连续成功多少次后扩容
    pub success_threshold: u32,
    /// 连续失败多少次后缩容
    pub failure_threshold: u32,
    /// 两次伸缩决策之间的最小间隔
    #[serde(with = "duration_ms")]
    pub cooldown_period: Duration,
    /// 累计失败多少次后进入退避窗口
    pub max_failure_count: u32,
    /// 退避窗口长度
    #[serde(with = "duration_ms")]
    pub cooldown_duration: Duration,
    /// 未指定重试预算时, 每个节点允许的尝试次数
    pub max_retry_attempts: u32,
    pub point_queue_capacity: usize,
    pub shared_queue_capacity: usize,
    /// 健康排名重算与快照输出的周期
    #[serde(with = "duration_ms")]
    pub health_interval: Duration,
    /// 动态超时 = 平均延迟 + margin
    #[serde(with = "duration_ms")]
    pub timeout_margin: Duration,
    /// 没有延迟历史时的超时
    #[serde(with = "duration_ms")]
    pub default_timeout: Duration,
    /// 单个请求错误数每达到该值的倍数就上报一次
    pub report_every: u32,
    /// 重定向全部失败后兜底入队前的退避(指数增长)
    #[serde(with = "duration_ms")]
    pub redirect_backoff_base: Duration,
    #[serde(with = "duration_ms")]
    pub redirect_backoff_max: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            default_concurrency: 4,
            max_concurrency: 32,
            success_threshold: 10,
            failure_threshold: 3,
            cooldown_period: Duration::from_secs(1),
            max_failure_count: 5,
            cooldown_duration: Duration::from_secs(5),
            max_retry_attempts: 3,
            point_queue_capacity: 100,
            shared_queue_capacity: 1000,
            health_interval: Duration::from_secs(3),
            timeout_margin: Duration::from_secs(2),
            default_timeout: Duration::from_secs(10),
            report_every: 100,
            redirect_backoff_base: Duration::from_millis(10),
            redirect_backoff_max: Duration::from_secs(1),
        }
    }
}

impl PoolConfig {
    /// 从 JSON 文本加载, 缺省字段取默认值
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s).map_err(|e| PoolError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_concurrency == 0 {
            return Err(PoolError::Config("default_concurrency 必须大于0".into()));
        }
        if self.max_concurrency < self.default_concurrency {
            return Err(PoolError::Config(
                "max_concurrency 不能小于 default_concurrency".into(),
            ));
        }
        if self.point_queue_capacity == 0 || self.shared_queue_capacity == 0 {
            return Err(PoolError::Config("队列容量必须大于0".into()));
        }
        if self.success_threshold == 0 || self.failure_threshold == 0 || self.max_failure_count == 0 {
            return Err(PoolError::Config("阈值必须大于0".into()));
        }
        if self.max_retry_attempts == 0 || self.report_every == 0 {
            return Err(PoolError::Config("max_retry_attempts/report_every 必须大于0".into()));
        }
        Ok(())
    }

    /// 第 n 次兜底重定向前的等待时间
    pub(crate) fn redirect_backoff(&self, redirects: u32) -> Duration {
        let factor = 1u32.checked_shl(redirects.min(16)).unwrap_or(u32::MAX);
        self.redirect_backoff_base
            .saturating_mul(factor)
            .min(self.redirect_backoff_max)
    }
}

/// BatchPool 的调参
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// 每次合并的最大条数
    pub batch_num: usize,
    /// 单条回退路径的 worker 数
    pub fallback_workers: usize,
    /// 缓冲区为空时的轮询间隔
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// 批量请求使用的 HTTP 方法
    pub method: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_num: 50,
            fallback_workers: num_cpus::get().max(1),
            poll_interval: Duration::from_millis(10),
            method: "POST".to_string(),
        }
    }
}

impl BatchConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s).map_err(|e| PoolError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_num == 0 {
            return Err(PoolError::Config("batch_num 必须大于0".into()));
        }
        if self.fallback_workers == 0 {
            return Err(PoolError::Config("fallback_workers 必须大于0".into()));
        }
        if self.method.is_empty() {
            return Err(PoolError::Config("method 不能为空".into()));
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
