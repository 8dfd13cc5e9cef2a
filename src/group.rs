//! 分组完成同步
//!
//! 每个组在结果表里有一条记录, 记录持有一个一次性的完成信号。
//! 最后一个成员写入时在同一把锁下移除整条记录并发送结果,
//! 所以信号恰好触发一次; 组被取消后迟到的写入找不到记录, 直接丢弃。

use std::collections::HashMap;
use std::future::Future;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{PoolError, Result};
use crate::request::{GroupId, Request, RequestId, Response};

type Results = HashMap<RequestId, Request>;

struct GroupState {
    size: usize,
    results: Results,
    done: Option<oneshot::Sender<Results>>,
}

#[derive(Default)]
pub(crate) struct GroupTable {
    groups: Mutex<HashMap<GroupId, GroupState>>,
}

impl GroupTable {
    pub(crate) fn open(&self, size: usize) -> (GroupId, oneshot::Receiver<Results>) {
        let group = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.groups.lock().insert(
            group,
            GroupState {
                size,
                results: HashMap::with_capacity(size),
                done: Some(tx),
            },
        );
        (group, rx)
    }

    /// 写入一个成员的结果, 组已不存在时返回 false
    pub(crate) fn complete(&self, group: GroupId, request: Request) -> bool {
        let mut groups = self.groups.lock();
        let Some(state) = groups.get_mut(&group) else {
            log::debug!("discarding late result {} for closed group {}", request.id, group);
            return false;
        };
        state.results.insert(request.id.clone(), request);
        if state.results.len() >= state.size {
            if let Some(mut state) = groups.remove(&group) {
                if let Some(done) = state.done.take() {
                    let _ = done.send(state.results);
                }
            }
        }
        true
    }

    /// 幂等
    pub(crate) fn close(&self, group: GroupId) {
        self.groups.lock().remove(&group);
    }

    pub(crate) fn clear(&self) {
        self.groups.lock().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.groups.lock().len()
    }
}

/// 离开作用域时清理组记录(正常完成、取消或 future 被丢弃)
pub(crate) struct GroupGuard<'a> {
    table: &'a GroupTable,
    group: GroupId,
}

impl<'a> GroupGuard<'a> {
    pub(crate) fn new(table: &'a GroupTable, group: GroupId) -> Self {
        Self { table, group }
    }
}

impl Drop for GroupGuard<'_> {
    fn drop(&mut self) {
        self.table.close(self.group);
    }
}

/// 先执行入队, 再等待完成信号; 任一阶段都可以被 cancel 打断
pub(crate) async fn await_group<S, C>(
    rx: oneshot::Receiver<Results>,
    submit: S,
    cancel: C,
) -> Result<GroupResult>
where
    S: Future<Output = Result<()>>,
    C: Future,
{
    let wait = async move {
        submit.await?;
        rx.await.map_err(|_| PoolError::ShutDown)
    };
    tokio::select! {
        res = wait => res.map(GroupResult::new),
        _ = cancel => Err(PoolError::Cancelled),
    }
}

/// 一个组的全部结果, 下标是 request id
#[derive(Debug, Clone)]
pub struct GroupResult {
    requests: Results,
}

impl GroupResult {
    pub(crate) fn new(requests: Results) -> Self {
        Self { requests }
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Request> {
        self.requests.get(id)
    }

    pub fn requests(&self) -> &HashMap<RequestId, Request> {
        &self.requests
    }

    /// 第一个终态错误(按 request id 排序, 结果稳定)
    pub fn error(&self) -> Option<&PoolError> {
        let mut failed: Vec<_> = self
            .requests
            .values()
            .filter_map(|r| r.error().map(|e| (&r.id, e)))
            .collect();
        failed.sort_by(|a, b| a.0.cmp(b.0));
        failed.into_iter().next().map(|(_, e)| e)
    }

    pub fn into_requests(self) -> HashMap<RequestId, Request> {
        self.requests
    }

    /// 全部成功时返回响应表, 否则返回第一个错误
    pub fn into_responses(self) -> Result<HashMap<RequestId, Response>> {
        if let Some(err) = self.error() {
            return Err(err.clone());
        }
        self.requests
            .into_iter()
            .map(|(id, req)| req.into_result().map(|resp| (id, resp)))
            .collect()
    }
}
