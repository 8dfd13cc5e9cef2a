//! Pool: 持有全部 Point、共享溢出队列、健康排名与分组状态
//!
//! 请求先进入共享队列, 由任意 Point 的 worker 领取; 失败的请求按
//! [`redirect`] 的顺序重新投递。排名只在后台健康任务里重算,
//! worker 读取的是一份不可变快照。

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};

use crate::check::ResponseHook;
use crate::config::PoolConfig;
use crate::endpoint::Endpoint;
use crate::error::{PoolError, Result};
use crate::group::{await_group, GroupGuard, GroupResult, GroupTable};
use crate::point::{Point, PointSnapshot};
use crate::report::{ErrorReporter, LogReporter};
use crate::request::{Request, RequestId};
use crate::transport::HttpExecutor;
use crate::worker;

pub(crate) struct Shared {
    pub(crate) config: PoolConfig,
    pub(crate) points: Vec<Arc<Point>>,
    pub(crate) shared_tx: mpsc::Sender<Request>,
    pub(crate) shared_rx: Arc<AsyncMutex<mpsc::Receiver<Request>>>,
    ranking: RwLock<Arc<Vec<usize>>>,
    pub(crate) groups: GroupTable,
    pub(crate) executor: Arc<dyn HttpExecutor>,
    pub(crate) hooks: Vec<Arc<dyn ResponseHook>>,
    pub(crate) reporter: Arc<dyn ErrorReporter>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 当前排名快照, 读取方不会阻塞重算
    pub(crate) fn ranking(&self) -> Arc<Vec<usize>> {
        self.ranking.read().clone()
    }

    /// 按 worker 数降序重排, 相同时按下标
    fn refresh_ranking(&self) {
        let mut ranked: Vec<(usize, usize)> = self
            .points
            .iter()
            .map(|p| (p.index, p.worker_count()))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let ranked = Arc::new(ranked.into_iter().map(|(i, _)| i).collect());
        *self.ranking.write() = ranked;
    }
}

pub struct PoolBuilder {
    endpoints: Vec<Endpoint>,
    executor: Arc<dyn HttpExecutor>,
    config: PoolConfig,
    hooks: Vec<Arc<dyn ResponseHook>>,
    reporter: Arc<dyn ErrorReporter>,
}

impl PoolBuilder {
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    pub fn hook(mut self, hook: impl ResponseHook + 'static) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    pub fn reporter(mut self, reporter: impl ErrorReporter + 'static) -> Self {
        self.reporter = Arc::new(reporter);
        self
    }

    /// 启动全部 worker 与健康任务, 必须在 tokio 运行时内调用
    pub fn build(self) -> Result<Pool> {
        self.config.validate()?;
        if self.endpoints.is_empty() {
            return Err(PoolError::NoEndpoints);
        }

        let points: Vec<Arc<Point>> = self
            .endpoints
            .into_iter()
            .enumerate()
            .map(|(i, ep)| Arc::new(Point::new(i, ep, self.config.point_queue_capacity)))
            .collect();
        let (shared_tx, shared_rx) = mpsc::channel(self.config.shared_queue_capacity);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let ranking = Arc::new((0..points.len()).collect());

        let shared = Arc::new(Shared {
            config: self.config,
            points,
            shared_tx,
            shared_rx: Arc::new(AsyncMutex::new(shared_rx)),
            ranking: RwLock::new(ranking),
            groups: GroupTable::default(),
            executor: self.executor,
            hooks: self.hooks,
            reporter: self.reporter,
            closed: AtomicBool::new(false),
            shutdown,
        });

        for point in &shared.points {
            for _ in 0..shared.config.default_concurrency {
                let (id, stop) = point.state.lock().add_worker();
                worker::spawn(shared.clone(), point.clone(), id, stop);
            }
            log::info!(
                "point {} started with {} workers",
                point.endpoint.url,
                shared.config.default_concurrency
            );
        }
        shared.refresh_ranking();
        tokio::spawn(health_loop(shared.clone(), shutdown_rx));

        Ok(Pool { shared })
    }
}

/// 分发池句柄, clone 之后共享同一组 Point
#[derive(Clone)]
pub struct Pool {
    pub(crate) shared: Arc<Shared>,
}

impl Pool {
    pub fn builder(endpoints: Vec<Endpoint>, executor: impl HttpExecutor) -> PoolBuilder {
        PoolBuilder {
            endpoints,
            executor: Arc::new(executor),
            config: PoolConfig::default(),
            hooks: Vec::new(),
            reporter: Arc::new(LogReporter),
        }
    }

    pub fn new(
        endpoints: Vec<Endpoint>,
        executor: impl HttpExecutor,
        config: PoolConfig,
    ) -> Result<Self> {
        Self::builder(endpoints, executor).config(config).build()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn endpoint_count(&self) -> usize {
        self.shared.points.len()
    }

    /// 提交单个请求, 返回带有结果的请求
    pub async fn submit(&self, request: Request) -> Result<Request> {
        let id = request.id.clone();
        let mut group = HashMap::with_capacity(1);
        group.insert(id.clone(), request);
        let mut results = self.submit_group(group).await?.into_requests();
        results.remove(&id).ok_or(PoolError::ShutDown)
    }

    pub async fn submit_group(&self, requests: HashMap<RequestId, Request>) -> Result<GroupResult> {
        self.submit_group_with_cancel(requests, std::future::pending::<()>())
            .await
    }

    /// 提交一组请求, 全部出结果或 `cancel` 完成时返回
    ///
    /// 取消只释放调用方, 不会打断进行中的 HTTP 调用; 之后到达的结果被丢弃。
    pub async fn submit_group_with_cancel<C: Future>(
        &self,
        requests: HashMap<RequestId, Request>,
        cancel: C,
    ) -> Result<GroupResult> {
        if self.shared.is_closed() {
            return Err(PoolError::ShutDown);
        }
        if requests.is_empty() {
            return Err(PoolError::EmptyGroup);
        }

        let shared = &self.shared;
        let (group, rx) = shared.groups.open(requests.len());
        let _guard = GroupGuard::new(&shared.groups, group);
        log::debug!("submitting group {} with {} requests", group, requests.len());

        let budget_base = (shared.points.len(), shared.config.max_retry_attempts);
        let submit = async move {
            for (id, mut req) in requests {
                req.reset_dispatch_state();
                req.id = id;
                req.group = group;
                req.retry_budget = req.retry_budget.resolve(budget_base.0, budget_base.1);
                shared
                    .shared_tx
                    .send(req)
                    .await
                    .map_err(|_| PoolError::ShutDown)?;
            }
            Ok::<(), PoolError>(())
        };

        await_group(rx, submit, cancel).await
    }

    /// 当前健康排名(Point 下标), 由健康任务周期性更新
    pub fn ranking(&self) -> Vec<usize> {
        self.shared.ranking().as_ref().clone()
    }

    pub fn snapshot(&self) -> Vec<PointSnapshot> {
        self.shared.points.iter().map(|p| p.snapshot()).collect()
    }

    /// 正在等待完成的组数
    pub fn pending_groups(&self) -> usize {
        self.shared.groups.len()
    }

    /// 关闭所有 worker 的停止信号并结束健康任务
    pub fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shared.shutdown.send(true);
        for point in &self.shared.points {
            point.state.lock().workers.clear();
        }
        self.shared.groups.clear();
        log::info!("pool shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.is_closed()
    }
}

/// 失败请求的重新投递
///
/// 1. 按健康排名非阻塞投递, 跳过来源节点、已失败节点和退避中的节点
/// 2. 扫描尚未失败过的节点
/// 3. 失败历史视为过期, 清空后对全部节点再试一次
/// 4. 退避一段时间后阻塞地投回来源节点, 保证请求不会丢失
pub(crate) fn redirect(shared: &Arc<Shared>, origin: usize, mut req: Request) {
    let ranking = shared.ranking();
    for &i in ranking.iter() {
        if i == origin || req.tried.contains_key(&i) {
            continue;
        }
        let point = &shared.points[i];
        if point.in_backoff() {
            continue;
        }
        req = match try_push(point, req) {
            Ok(()) => return,
            Err(req) => req,
        };
    }

    for point in &shared.points {
        if point.index == origin || req.tried.contains_key(&point.index) {
            continue;
        }
        req = match try_push(point, req) {
            Ok(()) => return,
            Err(req) => req,
        };
    }

    if !req.tried.is_empty() {
        log::debug!("request {} exhausted untried points, clearing history", req.id);
        req.tried.clear();
    }
    for point in &shared.points {
        req = match try_push(point, req) {
            Ok(()) => return,
            Err(req) => req,
        };
    }

    // 加一点抖动, 避免同一批请求同时回灌
    let jitter = Duration::from_millis(rand::random_range(0..=5));
    let delay = shared.config.redirect_backoff(req.redirects) + jitter;
    req.redirects += 1;
    let point = &shared.points[origin];
    log::warn!(
        "all queues full, request {} falls back to {} after {:?}",
        req.id,
        point.endpoint.url,
        delay
    );
    let tx = point.tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Err(e) = tx.send(req).await {
            log::error!("failed to requeue request {}", e.0.id);
        }
    });
}

fn try_push(point: &Point, req: Request) -> std::result::Result<(), Request> {
    match point.tx.try_send(req) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(req)) | Err(TrySendError::Closed(req)) => Err(req),
    }
}

async fn health_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(shared.config.health_interval);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        shared.refresh_ranking();
        for point in &shared.points {
            let snap = point.snapshot();
            publish(&snap);
            log::info!(
                "point {} workers={} requests={} ok={} err={} avg={:.1}ms backoff={}",
                snap.url,
                snap.workers,
                snap.total_requests,
                snap.successes,
                snap.errors,
                snap.avg_latency_ms,
                snap.backing_off
            );
        }
    }
    log::debug!("health loop stopped");
}

fn publish(snap: &PointSnapshot) {
    let url = snap.url.clone();
    metrics::gauge!("dispatch_pool_point_workers", "url" => url.clone()).set(snap.workers as f64);
    metrics::gauge!("dispatch_pool_point_avg_latency_ms", "url" => url.clone())
        .set(snap.avg_latency_ms);
    metrics::gauge!("dispatch_pool_point_requests", "url" => url).set(snap.total_requests as f64);
}
