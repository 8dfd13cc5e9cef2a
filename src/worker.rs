//! Worker: 绑定到某个 Point 的轻量任务
//!
//! 同时从 Point 自己的队列和 Pool 的共享队列取请求, 执行后更新统计、
//! 做扩缩容决策, 再决定是完成、重定向还是以最后的错误结束。

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::time::Instant;
use uuid::Uuid;

use crate::check::check_response;
use crate::error::{PoolError, Result};
use crate::point::{Point, Scale};
use crate::pool::{redirect, Shared};
use crate::report::should_report;
use crate::request::{Request, Response};
use crate::transport::{HttpCall, RawResponse};

/// 退避窗口内的轮询间隔
const BACKOFF_POLL: Duration = Duration::from_millis(50);

enum Flow {
    Continue,
    /// 请求已转走, 等退避窗口结束再接新活
    Backoff,
    /// 本 worker 已被缩容
    Exit,
}

pub(crate) fn spawn(shared: Arc<Shared>, point: Arc<Point>, id: Uuid, stop: oneshot::Receiver<()>) {
    tokio::spawn(run(shared, point, id, stop));
}

async fn run(shared: Arc<Shared>, point: Arc<Point>, id: Uuid, mut stop: oneshot::Receiver<()>) {
    log::debug!("worker {} started on {}", id, point.endpoint.url);
    loop {
        let next = tokio::select! {
            _ = &mut stop => None,
            req = recv(&point.rx) => req,
            req = recv(&shared.shared_rx) => req,
        };
        let Some(req) = next else { break };

        match handle(&shared, &point, id, req).await {
            Flow::Continue => {}
            Flow::Exit => break,
            Flow::Backoff => {
                if !wait_out_backoff(&point, &mut stop).await {
                    break;
                }
            }
        }
    }
    log::debug!("worker {} on {} stopped", id, point.endpoint.url);
}

async fn recv(rx: &AsyncMutex<mpsc::Receiver<Request>>) -> Option<Request> {
    rx.lock().await.recv().await
}

/// 轮询直到退避结束, 期间收到停止信号返回 false
async fn wait_out_backoff(point: &Point, stop: &mut oneshot::Receiver<()>) -> bool {
    loop {
        let remaining = point
            .state
            .lock()
            .stats
            .backoff_until
            .map(|until| until.saturating_duration_since(Instant::now()));
        match remaining {
            Some(left) if !left.is_zero() => {
                tokio::select! {
                    _ = &mut *stop => return false,
                    _ = tokio::time::sleep(left.min(BACKOFF_POLL)) => {}
                }
            }
            _ => return true,
        }
    }
}

async fn handle(shared: &Arc<Shared>, point: &Arc<Point>, worker: Uuid, mut req: Request) -> Flow {
    if point.in_backoff() {
        log::debug!("{} is backing off, redirecting {}", point.endpoint.url, req.id);
        redirect(shared, point.index, req);
        return Flow::Backoff;
    }

    let config = &shared.config;
    let timeout = point.state.lock().stats.call_timeout(config);
    let call = match build_call(point, &req, timeout) {
        Ok(call) => call,
        Err(err) => {
            req.finish(Err(err));
            let group = req.group;
            shared.groups.complete(group, req);
            return Flow::Continue;
        }
    };

    req.attempts += 1;
    let started = Instant::now();
    let result = match tokio::time::timeout(timeout, shared.executor.execute(call)).await {
        Ok(result) => result,
        Err(_) => Err(PoolError::Timeout(timeout)),
    };
    let elapsed = started.elapsed();
    let verdict = result.and_then(|raw| inspect(shared, point, &req, raw));

    // 钩子拒绝且请求要求换路径时, 节点本身是健康的
    let escaped = req.escape_on_reject && matches!(verdict, Err(PoolError::Rejected(_)));
    let healthy = verdict.is_ok() || escaped;
    let scale = point
        .state
        .lock()
        .record(worker, healthy, elapsed, Instant::now(), config);
    metrics::counter!(
        "dispatch_pool_requests_total",
        "outcome" => if healthy { "success" } else { "failure" }
    )
    .increment(1);
    let flow = apply_scale(shared, point, scale);

    match verdict {
        Ok(resp) => {
            log::debug!("request {} ok on {} in {:?}", req.id, point.endpoint.url, elapsed);
            req.finish(Ok(resp));
            let group = req.group;
            shared.groups.complete(group, req);
        }
        Err(err) => {
            req.record_failure(point.index, err.clone());
            if should_report(req.error_count, config.report_every) {
                shared.reporter.report(&point.endpoint, &req, &err);
            }
            if escaped {
                req.finish(Err(err));
                let group = req.group;
                shared.groups.complete(group, req);
            } else if req.budget_left() {
                log::debug!(
                    "request {} failed on {} (attempt {}): {}",
                    req.id,
                    point.endpoint.url,
                    req.attempts,
                    err
                );
                redirect(shared, point.index, req);
            } else {
                log::warn!("request {} gave up after {} attempts: {}", req.id, req.attempts, err);
                req.exhaust();
                let group = req.group;
                shared.groups.complete(group, req);
            }
        }
    }

    flow
}

fn apply_scale(shared: &Arc<Shared>, point: &Arc<Point>, scale: Scale) -> Flow {
    match scale {
        Scale::Hold => Flow::Continue,
        Scale::Grow { id, stop } => {
            if shared.is_closed() {
                point.state.lock().workers.remove(&id);
                return Flow::Continue;
            }
            log::info!(
                "{} scaled up to {} workers",
                point.endpoint.url,
                point.worker_count()
            );
            spawn(shared.clone(), point.clone(), id, stop);
            Flow::Continue
        }
        Scale::Shrink => {
            log::info!(
                "{} scaled down to {} workers",
                point.endpoint.url,
                point.worker_count()
            );
            Flow::Exit
        }
    }
}

fn build_call(point: &Point, req: &Request, timeout: Duration) -> Result<HttpCall> {
    let body = if req.body.is_null() {
        None
    } else {
        let bytes = serde_json::to_vec(&req.body).map_err(|e| PoolError::InvalidJson(e.to_string()))?;
        Some(Bytes::from(bytes))
    };
    let mut headers = point.endpoint.headers.clone();
    headers.extend(req.headers.iter().map(|(k, v)| (k.clone(), v.clone())));

    Ok(HttpCall {
        method: req.method.clone(),
        url: point.endpoint.url.clone(),
        headers,
        query: req.query.clone(),
        body,
        timeout,
    })
}

fn inspect(shared: &Shared, point: &Point, req: &Request, raw: RawResponse) -> Result<Response> {
    let parsed = check_response(&raw)?;
    for hook in &shared.hooks {
        hook.check(&point.endpoint, req, &raw, &parsed)
            .map_err(PoolError::Rejected)?;
    }
    Ok(Response {
        status: raw.status,
        headers: raw.headers,
        body: parsed,
    })
}
