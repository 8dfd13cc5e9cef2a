//! Pool 集成测试
//!
//! 覆盖: 故障节点重定向、重试预算、取消、退避窗口、扩缩容与健康排名、
//! 异常上报、响应钩子以及关闭。

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dispatch_pool::{
    Endpoint, ErrorFieldHook, ErrorReporter, Pool, PoolError, Request, RetryBudget,
};
use serde_json::json;

use test_utils::{body_of, fast_config, init_logger, json_reply, ScriptedExecutor};

const GOOD: &str = "http://good.local/rpc";
const BAD: &str = "http://bad.local/rpc";
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn group_of(n: usize) -> HashMap<String, Request> {
    (0..n)
        .map(|i| {
            let id = format!("req-{}", i);
            (id.clone(), Request::rpc(id, "eth_blockNumber", json!([])))
        })
        .collect()
}

fn good_and_bad() -> ScriptedExecutor {
    ScriptedExecutor::new()
        .route(GOOD, Duration::from_millis(1), |_| json_reply(200, json!({"result": 1})))
        .route(BAD, Duration::from_millis(1), |_| {
            Err(PoolError::Transport("connection refused".into()))
        })
}

#[tokio::test]
async fn failing_point_is_routed_around() {
    init_logger();
    let executor = good_and_bad();
    let pool = Pool::new(
        vec![Endpoint::new(GOOD), Endpoint::new(BAD)],
        executor.clone(),
        fast_config(),
    )
    .unwrap();

    let result = tokio::time::timeout(TEST_TIMEOUT, pool.submit_group(group_of(10)))
        .await
        .expect("group timed out")
        .unwrap();

    assert_eq!(result.len(), 10);
    assert!(result.error().is_none());
    for req in result.requests().values() {
        assert_eq!(req.response().unwrap().body, json!({"result": 1}));
    }
    let responses = result.into_responses().unwrap();
    assert_eq!(responses.len(), 10);
    assert_eq!(pool.pending_groups(), 0);
    pool.shutdown();
}

#[tokio::test]
async fn retry_budget_bounds_attempts() {
    init_logger();
    for budget in 1..=4u32 {
        let executor = ScriptedExecutor::new().route(BAD, Duration::ZERO, |_| json_reply(503, json!({})));
        let pool = Pool::new(vec![Endpoint::new(BAD)], executor.clone(), fast_config()).unwrap();

        let req = Request::new("only", "POST", json!({"method": "x"}))
            .with_retry_budget(RetryBudget::Limited(budget));
        let done = tokio::time::timeout(TEST_TIMEOUT, pool.submit(req))
            .await
            .expect("submit timed out")
            .unwrap();

        match done.error() {
            Some(PoolError::RetriesExhausted { attempts, last }) => {
                assert_eq!(*attempts, budget);
                assert_eq!(**last, PoolError::Status(503));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(executor.calls_to(BAD), budget as usize);
        pool.shutdown();
    }
}

#[tokio::test]
async fn default_budget_is_points_times_attempts() {
    let executor = ScriptedExecutor::new()
        .route(BAD, Duration::ZERO, |_| json_reply(500, json!({})))
        .route("http://bad2.local", Duration::ZERO, |_| json_reply(500, json!({})));
    let config = dispatch_pool::PoolConfig {
        max_retry_attempts: 2,
        max_failure_count: 100,
        ..fast_config()
    };
    let pool = Pool::new(
        vec![Endpoint::new(BAD), Endpoint::new("http://bad2.local")],
        executor.clone(),
        config,
    )
    .unwrap();

    let done = pool.submit(Request::new("a", "POST", json!({}))).await.unwrap();
    assert_eq!(done.attempts(), 4);
    assert_eq!(executor.calls().len(), 4);
    let result = done.into_result();
    assert!(matches!(result, Err(PoolError::RetriesExhausted { attempts: 4, .. })));
    pool.shutdown();
}

#[tokio::test]
async fn cancellation_releases_caller_before_slow_call() {
    init_logger();
    let executor = ScriptedExecutor::new().route(GOOD, Duration::from_secs(5), |_| {
        json_reply(200, json!({"result": 1}))
    });
    let pool = Pool::new(vec![Endpoint::new(GOOD)], executor, fast_config()).unwrap();

    let started = Instant::now();
    let res = pool
        .submit_group_with_cancel(group_of(3), tokio::time::sleep(Duration::from_millis(10)))
        .await;

    assert_eq!(res.unwrap_err(), PoolError::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(pool.pending_groups(), 0);
    pool.shutdown();
}

#[tokio::test]
async fn dropped_submission_cleans_up_group() {
    let executor = ScriptedExecutor::new().route(GOOD, Duration::from_secs(5), |_| {
        json_reply(200, json!({"result": 1}))
    });
    let pool = Pool::new(vec![Endpoint::new(GOOD)], executor, fast_config()).unwrap();

    let res = tokio::time::timeout(Duration::from_millis(20), pool.submit_group(group_of(2))).await;
    assert!(res.is_err());
    assert_eq!(pool.pending_groups(), 0);
    pool.shutdown();
}

#[tokio::test]
async fn backing_off_point_handles_no_new_requests() {
    init_logger();
    let executor = good_and_bad();
    let config = dispatch_pool::PoolConfig {
        max_failure_count: 2,
        cooldown_duration: Duration::from_secs(3),
        ..fast_config()
    };
    let pool = Pool::new(
        vec![Endpoint::new(BAD), Endpoint::new(GOOD)],
        executor.clone(),
        config,
    )
    .unwrap();

    let mut backing_off = false;
    for _ in 0..20 {
        let result = pool.submit_group(group_of(10)).await.unwrap();
        assert!(result.error().is_none());
        if pool.snapshot()[0].backing_off {
            backing_off = true;
            break;
        }
    }
    assert!(backing_off, "bad point never entered backoff");

    let bad_calls = executor.calls_to(BAD);
    let result = tokio::time::timeout(TEST_TIMEOUT, pool.submit_group(group_of(20)))
        .await
        .expect("group timed out")
        .unwrap();
    assert!(result.error().is_none());
    assert_eq!(result.len(), 20);
    assert_eq!(executor.calls_to(BAD), bad_calls);
    pool.shutdown();
}

#[tokio::test]
async fn saturated_queues_still_complete_every_request() {
    init_logger();
    let executor = good_and_bad();
    let config = dispatch_pool::PoolConfig {
        default_concurrency: 1,
        point_queue_capacity: 1,
        shared_queue_capacity: 1,
        ..fast_config()
    };
    let pool = Pool::new(
        vec![Endpoint::new(BAD), Endpoint::new(GOOD)],
        executor.clone(),
        config,
    )
    .unwrap();

    let requests: HashMap<_, _> = group_of(60)
        .into_iter()
        .map(|(id, req)| (id, req.with_retry_budget(RetryBudget::Unlimited)))
        .collect();
    let result = tokio::time::timeout(TEST_TIMEOUT, pool.submit_group(requests))
        .await
        .expect("group timed out")
        .unwrap();

    assert_eq!(result.len(), 60);
    assert!(result.error().is_none());
    assert_eq!(executor.calls_to(GOOD), 60);
    assert!(executor.calls_to(BAD) > 0);
    assert_eq!(pool.pending_groups(), 0);
    pool.shutdown();
}

#[tokio::test]
async fn workers_scale_within_bounds_and_ranking_follows() {
    init_logger();
    let executor = good_and_bad();
    let config = dispatch_pool::PoolConfig {
        default_concurrency: 2,
        max_concurrency: 4,
        success_threshold: 2,
        failure_threshold: 1,
        cooldown_period: Duration::ZERO,
        max_failure_count: 1000,
        ..fast_config()
    };
    let pool = Pool::new(
        vec![Endpoint::new(BAD), Endpoint::new(GOOD)],
        executor,
        config,
    )
    .unwrap();
    assert_eq!(pool.ranking(), vec![0, 1]);

    for _ in 0..5 {
        let result = pool.submit_group(group_of(20)).await.unwrap();
        assert!(result.error().is_none());
    }

    let snaps = pool.snapshot();
    assert_eq!(snaps[0].workers, 1);
    assert!(snaps[1].workers > 2 && snaps[1].workers <= 4);
    assert!(snaps[0].errors > 0);
    assert_eq!(snaps[1].errors, 0);
    approx::assert_relative_eq!(
        snaps[1].successes as f64,
        snaps[1].total_requests as f64
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(pool.ranking()[0], 1);
    pool.shutdown();
}

#[derive(Clone, Default)]
struct CountingReporter {
    reports: Arc<AtomicUsize>,
}

impl ErrorReporter for CountingReporter {
    fn report(&self, _endpoint: &Endpoint, request: &Request, _error: &PoolError) {
        assert_eq!(request.error_count() % 2, 0);
        self.reports.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn reporter_fires_on_escalating_error_counts() {
    let executor = ScriptedExecutor::new().route(BAD, Duration::ZERO, |_| json_reply(500, json!({})));
    let reporter = CountingReporter::default();
    let config = dispatch_pool::PoolConfig {
        report_every: 2,
        max_failure_count: 100,
        ..fast_config()
    };
    let pool = Pool::builder(vec![Endpoint::new(BAD)], executor)
        .config(config)
        .reporter(reporter.clone())
        .build()
        .unwrap();

    let req = Request::new("a", "POST", json!({})).with_retry_budget(RetryBudget::Limited(5));
    let done = pool.submit(req).await.unwrap();
    assert_eq!(done.error_count(), 5);
    assert_eq!(reporter.reports.load(Ordering::SeqCst), 2);
    pool.shutdown();
}

#[tokio::test]
async fn hook_rejection_redirects_to_another_point() {
    let executor = ScriptedExecutor::new()
        .route(BAD, Duration::ZERO, |_| {
            json_reply(200, json!({"error": {"code": -32005, "message": "limit"}}))
        })
        .route(GOOD, Duration::ZERO, |call| {
            json_reply(200, json!({"result": body_of(call)["id"].clone()}))
        });
    let pool = Pool::builder(vec![Endpoint::new(BAD), Endpoint::new(GOOD)], executor)
        .config(fast_config())
        .hook(ErrorFieldHook::new("error.code"))
        .build()
        .unwrap();

    let result = pool.submit_group(group_of(8)).await.unwrap();
    for (id, req) in result.requests() {
        assert_eq!(req.response().unwrap().body, json!({"result": id}));
    }
    pool.shutdown();
}

#[tokio::test]
async fn empty_group_and_shutdown() {
    let executor = ScriptedExecutor::new().route(GOOD, Duration::from_secs(5), |_| {
        json_reply(200, json!({"result": 1}))
    });
    let pool = Pool::new(vec![Endpoint::new(GOOD)], executor, fast_config()).unwrap();
    assert_eq!(
        pool.submit_group(HashMap::new()).await.unwrap_err(),
        PoolError::EmptyGroup
    );

    let waiting = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.submit_group(group_of(1)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    pool.shutdown();

    let res = tokio::time::timeout(TEST_TIMEOUT, waiting).await.unwrap().unwrap();
    assert_eq!(res.unwrap_err(), PoolError::ShutDown);
    assert_eq!(
        pool.submit(Request::new("late", "POST", json!({}))).await.unwrap_err(),
        PoolError::ShutDown
    );
    assert!(pool.is_shut_down());
}

#[tokio::test]
async fn endpoint_and_request_headers_are_merged() {
    let executor = ScriptedExecutor::new().route(GOOD, Duration::ZERO, |_| json_reply(200, json!({"result": 1})));
    let pool = Pool::new(
        vec![Endpoint::new(GOOD).with_header("x-api-key", "k")],
        executor.clone(),
        fast_config(),
    )
    .unwrap();

    let req = Request::new("a", "GET", serde_json::Value::Null)
        .with_header("x-trace", "t")
        .with_query("block", "latest");
    pool.submit(req).await.unwrap().into_result().unwrap();

    let call = &executor.calls()[0];
    assert_eq!(call.method, "GET");
    assert!(call.body.is_none());
    assert_eq!(call.headers.get("x-api-key").map(String::as_str), Some("k"));
    assert_eq!(call.headers.get("x-trace").map(String::as_str), Some("t"));
    assert_eq!(call.query, vec![("block".to_string(), "latest".to_string())]);
    assert_eq!(call.timeout, fast_config().default_timeout);
    pool.shutdown();
}

#[test]
fn pool_requires_endpoints_and_valid_config() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let executor = ScriptedExecutor::new();
        assert_eq!(
            Pool::new(vec![], executor.clone(), fast_config()).err(),
            Some(PoolError::NoEndpoints)
        );
        let bad = dispatch_pool::PoolConfig {
            default_concurrency: 0,
            ..fast_config()
        };
        assert!(matches!(
            Pool::new(vec![Endpoint::new(GOOD)], executor, bad).err(),
            Some(PoolError::Config(_))
        ));
    });
}
