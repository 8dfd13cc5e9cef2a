//! Point: 一个上游节点 + 它的请求队列、worker 集合与健康统计
//!
//! 统计与 worker 集合放在同一把锁下, 扩缩容决策因此天然串行,
//! 不会出现并发的扩容/缩容互相覆盖。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::endpoint::Endpoint;
use crate::request::Request;

pub(crate) struct Point {
    pub(crate) index: usize,
    pub(crate) endpoint: Endpoint,
    pub(crate) tx: mpsc::Sender<Request>,
    pub(crate) rx: Arc<AsyncMutex<mpsc::Receiver<Request>>>,
    pub(crate) state: Mutex<PointState>,
}

impl Point {
    pub(crate) fn new(index: usize, endpoint: Endpoint, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            index,
            endpoint,
            tx,
            rx: Arc::new(AsyncMutex::new(rx)),
            state: Mutex::new(PointState::default()),
        }
    }

    pub(crate) fn in_backoff(&self) -> bool {
        self.state.lock().stats.in_backoff(Instant::now())
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.state.lock().workers.len()
    }

    pub(crate) fn snapshot(&self) -> PointSnapshot {
        let state = self.state.lock();
        let stats = &state.stats;
        PointSnapshot {
            url: self.endpoint.url.clone(),
            workers: state.workers.len(),
            total_requests: stats.total_requests,
            successes: stats.successes,
            errors: stats.errors,
            avg_latency_ms: stats
                .avg_latency
                .map(|d| d.as_secs_f64() * 1000.0)
                .unwrap_or(0.0),
            success_streak: stats.success_streak,
            failure_streak: stats.failure_streak,
            backing_off: stats.in_backoff(Instant::now()),
            taken_at: Utc::now(),
        }
    }
}

/// 健康统计
#[derive(Debug, Default, Clone)]
pub(crate) struct PointStats {
    pub(crate) total_requests: u64,
    pub(crate) successes: u64,
    pub(crate) errors: u64,
    pub(crate) total_time: Duration,
    pub(crate) avg_latency: Option<Duration>,
    pub(crate) success_streak: u32,
    pub(crate) failure_streak: u32,
    pub(crate) last_adjust: Option<Instant>,
    pub(crate) failure_count: u32,
    pub(crate) backoff_until: Option<Instant>,
}

impl PointStats {
    pub(crate) fn in_backoff(&self, now: Instant) -> bool {
        self.backoff_until.is_some_and(|until| now < until)
    }

    /// 平均延迟 + margin, 没有历史时用默认值
    pub(crate) fn call_timeout(&self, config: &PoolConfig) -> Duration {
        match self.avg_latency {
            Some(avg) => avg + config.timeout_margin,
            None => config.default_timeout,
        }
    }

    fn can_adjust(&self, now: Instant, config: &PoolConfig) -> bool {
        match self.last_adjust {
            Some(last) => now.saturating_duration_since(last) >= config.cooldown_period,
            None => true,
        }
    }
}

/// 扩缩容决策
#[derive(Debug)]
pub(crate) enum Scale {
    Hold,
    /// 已登记的新 worker, 调用方负责启动
    Grow { id: Uuid, stop: oneshot::Receiver<()> },
    /// 当前 worker 已从集合中移除, 应当退出
    Shrink,
}

#[derive(Debug, Default)]
pub(crate) struct PointState {
    pub(crate) stats: PointStats,
    /// worker id -> 私有停止信号, 丢弃 Sender 即通知该 worker 退出
    pub(crate) workers: HashMap<Uuid, oneshot::Sender<()>>,
}

impl PointState {
    /// 登记一个新 worker, 返回它的停止信号接收端
    pub(crate) fn add_worker(&mut self) -> (Uuid, oneshot::Receiver<()>) {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.workers.insert(id, tx);
        (id, rx)
    }

    /// 记录一次结果并给出扩缩容决策
    pub(crate) fn record(
        &mut self,
        worker: Uuid,
        success: bool,
        elapsed: Duration,
        now: Instant,
        config: &PoolConfig,
    ) -> Scale {
        let stats = &mut self.stats;
        stats.total_requests += 1;
        stats.total_time += elapsed;

        if success {
            stats.successes += 1;
            stats.success_streak += 1;
            stats.failure_streak = 0;
            let nanos = stats.total_time.as_nanos() / u128::from(stats.total_requests.max(1));
            stats.avg_latency = Some(Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX)));
        } else {
            stats.errors += 1;
            stats.failure_streak += 1;
            stats.success_streak = 0;
            stats.failure_count += 1;
            if stats.failure_count >= config.max_failure_count {
                stats.backoff_until = Some(now + config.cooldown_duration);
                stats.failure_count = 0;
            }
        }

        if !stats.can_adjust(now, config) {
            return Scale::Hold;
        }

        if success {
            if stats.success_streak >= config.success_threshold
                && self.workers.len() < config.max_concurrency
            {
                stats.success_streak = 0;
                stats.last_adjust = Some(now);
                let (id, stop) = self.add_worker();
                return Scale::Grow { id, stop };
            }
        } else if stats.failure_streak >= config.failure_threshold
            && self.workers.len() > 1
            && self.workers.contains_key(&worker)
        {
            stats.failure_streak = 0;
            stats.last_adjust = Some(now);
            self.workers.remove(&worker);
            return Scale::Shrink;
        }

        Scale::Hold
    }
}

/// 对外的健康快照
#[derive(Debug, Clone, Serialize)]
pub struct PointSnapshot {
    pub url: String,
    pub workers: usize,
    pub total_requests: u64,
    pub successes: u64,
    pub errors: u64,
    pub avg_latency_ms: f64,
    pub success_streak: u32,
    pub failure_streak: u32,
    pub backing_off: bool,
    pub taken_at: DateTime<Utc>,
}
