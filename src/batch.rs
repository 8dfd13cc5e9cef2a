//! BatchPool: 把单条请求合并成 JSON 数组批量调用
//!
//! 聚合任务轮询缓冲区, 每次最多取 `batch_num` 条合并提交给底层 Pool;
//! 响应数组按位置拆回各个调用方。数组元素带 `error` 字段(哪怕是 null)且没有 `result`,
//! 或者整个响应不是数组(节点忽略了批量), 对应条目都转入单条回退队列,
//! 由一组单条 worker 逐个重新提交。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use uuid::Uuid;

use crate::config::BatchConfig;
use crate::error::{PoolError, Result};
use crate::group::{await_group, GroupGuard, GroupResult, GroupTable};
use crate::pool::Pool;
use crate::request::{GroupId, Request, RequestId, Response, RetryBudget};

/// 待分发的条目, `group` 是 BatchPool 自己的组标识
struct Item {
    group: GroupId,
    request: Request,
}

struct BatchShared {
    pool: Pool,
    config: BatchConfig,
    pending_tx: mpsc::UnboundedSender<Item>,
    single_tx: mpsc::UnboundedSender<Item>,
    groups: GroupTable,
    shutdown: watch::Sender<bool>,
}

impl BatchShared {
    fn fallback(&self, item: Item) {
        if let Err(e) = self.single_tx.send(item) {
            let Item { group, mut request } = e.0;
            request.finish(Err(PoolError::ShutDown));
            self.groups.complete(group, request);
        }
    }

    fn fail(&self, item: Item, err: PoolError) {
        let Item { group, mut request } = item;
        request.finish(Err(err));
        self.groups.complete(group, request);
    }
}

#[derive(Clone)]
pub struct BatchPool {
    shared: Arc<BatchShared>,
}

impl BatchPool {
    /// 启动聚合任务和单条回退 worker, 必须在 tokio 运行时内调用
    pub fn new(pool: Pool, config: BatchConfig) -> Result<Self> {
        config.validate()?;
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        let (single_tx, single_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let shared = Arc::new(BatchShared {
            pool,
            config,
            pending_tx,
            single_tx,
            groups: GroupTable::default(),
            shutdown,
        });

        tokio::spawn(aggregate(shared.clone(), pending_rx, shared.shutdown.subscribe()));
        let single_rx = Arc::new(AsyncMutex::new(single_rx));
        for _ in 0..shared.config.fallback_workers {
            tokio::spawn(single_worker(
                shared.clone(),
                single_rx.clone(),
                shared.shutdown.subscribe(),
            ));
        }
        log::info!(
            "batch pool started: batch_num={} fallback_workers={}",
            shared.config.batch_num,
            shared.config.fallback_workers
        );

        Ok(Self { shared })
    }

    pub fn pool(&self) -> &Pool {
        &self.shared.pool
    }

    pub async fn submit_group(&self, requests: HashMap<RequestId, Request>) -> Result<GroupResult> {
        self.submit_group_with_cancel(requests, std::future::pending::<()>())
            .await
    }

    /// 合并成批量调用
    pub async fn submit_group_with_cancel<C: Future>(
        &self,
        requests: HashMap<RequestId, Request>,
        cancel: C,
    ) -> Result<GroupResult> {
        self.enqueue(requests, &self.shared.pending_tx, cancel).await
    }

    pub async fn submit_unbatched_group(
        &self,
        requests: HashMap<RequestId, Request>,
    ) -> Result<GroupResult> {
        self.submit_unbatched_group_with_cancel(requests, std::future::pending::<()>())
            .await
    }

    /// 跳过合并, 直接走单条路径
    pub async fn submit_unbatched_group_with_cancel<C: Future>(
        &self,
        requests: HashMap<RequestId, Request>,
        cancel: C,
    ) -> Result<GroupResult> {
        self.enqueue(requests, &self.shared.single_tx, cancel).await
    }

    async fn enqueue<C: Future>(
        &self,
        requests: HashMap<RequestId, Request>,
        queue: &mpsc::UnboundedSender<Item>,
        cancel: C,
    ) -> Result<GroupResult> {
        if *self.shared.shutdown.borrow() || self.shared.pool.is_shut_down() {
            return Err(PoolError::ShutDown);
        }
        if requests.is_empty() {
            return Err(PoolError::EmptyGroup);
        }

        let groups = &self.shared.groups;
        let (group, rx) = groups.open(requests.len());
        let _guard = GroupGuard::new(groups, group);

        for (id, mut request) in requests {
            request.id = id;
            queue
                .send(Item { group, request })
                .map_err(|_| PoolError::ShutDown)?;
        }

        await_group(rx, async { Ok::<(), PoolError>(()) }, cancel).await
    }

    pub fn pending_groups(&self) -> usize {
        self.shared.groups.len()
    }

    /// 停止聚合与回退任务, 底层 Pool 由调用方自行关闭
    pub fn shutdown(&self) {
        let _ = self.shared.shutdown.send(true);
        self.shared.groups.clear();
    }
}

async fn aggregate(
    shared: Arc<BatchShared>,
    mut pending: mpsc::UnboundedReceiver<Item>,
    mut shutdown: watch::Receiver<bool>,
) {
    let batch_num = shared.config.batch_num;
    loop {
        if *shutdown.borrow() {
            break;
        }
        let mut items = Vec::with_capacity(batch_num);
        while items.len() < batch_num {
            match pending.try_recv() {
                Ok(item) => items.push(item),
                Err(_) => break,
            }
        }

        if items.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep(shared.config.poll_interval) => {}
                _ = shutdown.changed() => break,
            }
            continue;
        }

        tokio::spawn(dispatch_batch(shared.clone(), items));
    }
    log::debug!("batch aggregator stopped");
}

async fn dispatch_batch(shared: Arc<BatchShared>, items: Vec<Item>) {
    let body = Value::Array(items.iter().map(|i| i.request.body.clone()).collect());
    let batch = Request::new(format!("batch-{}", Uuid::new_v4()), shared.config.method.clone(), body)
        .with_retry_budget(RetryBudget::Unlimited)
        .escape_on_reject();
    log::debug!("dispatching batch {} with {} items", batch.id, items.len());

    let response = match shared.pool.submit(batch).await {
        Ok(done) => done.into_result(),
        Err(err) => Err(err),
    };

    match response {
        Ok(resp) => {
            let outcomes = demultiplex(items.len(), &resp.body);
            for (item, outcome) in items.into_iter().zip(outcomes) {
                match outcome {
                    ItemOutcome::Success(body) => {
                        let Item { group, mut request } = item;
                        request.finish(Ok(Response {
                            status: resp.status,
                            headers: resp.headers.clone(),
                            body,
                        }));
                        shared.groups.complete(group, request);
                    }
                    ItemOutcome::Fallback => shared.fallback(item),
                }
            }
        }
        Err(PoolError::ShutDown) => {
            for item in items {
                shared.fail(item, PoolError::ShutDown);
            }
        }
        Err(err) => {
            log::debug!("batch not accepted ({}), resubmitting {} items singly", err, items.len());
            for item in items {
                shared.fallback(item);
            }
        }
    }
}

async fn single_worker(
    shared: Arc<BatchShared>,
    queue: Arc<AsyncMutex<mpsc::UnboundedReceiver<Item>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let next = tokio::select! {
            item = async { queue.lock().await.recv().await } => item,
            _ = shutdown.changed() => None,
        };
        let Some(Item { group, request }) = next else { break };

        let done = match shared.pool.submit(request.clone()).await {
            Ok(done) => done,
            Err(err) => {
                let mut request = request;
                request.finish(Err(err));
                request
            }
        };
        shared.groups.complete(group, done);
    }
    log::debug!("single-item worker stopped");
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ItemOutcome {
    Success(Value),
    /// 需要走单条路径重试
    Fallback,
}

/// 把批量响应按位置拆回 `count` 个条目
pub(crate) fn demultiplex(count: usize, body: &Value) -> Vec<ItemOutcome> {
    let Some(elements) = body.as_array() else {
        return vec![ItemOutcome::Fallback; count];
    };
    (0..count)
        .map(|i| match elements.get(i) {
            Some(element) if is_item_error(element) => ItemOutcome::Fallback,
            Some(element) => ItemOutcome::Success(element.clone()),
            None => ItemOutcome::Fallback,
        })
        .collect()
}

fn is_item_error(element: &Value) -> bool {
    element.get("error").is_some() && element.get("result").is_none()
}
