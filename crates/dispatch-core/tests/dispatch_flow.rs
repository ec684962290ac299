//! Publisher → Fetcher → Worker → AsyncResult を in-memory キューで通しで動かす

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use dispatch_core::app::{App, AppBuilder, FetcherState, ResultState, RunnerOptions};
use dispatch_core::config::DispatchConfig;
use dispatch_core::domain::{DispatchError, Invocation, Kwargs, TaskError};
use dispatch_core::impls::InMemoryQueueService;
use dispatch_core::ports::QueueService;
use dispatch_core::typed::{Handler, RegistryBuilder, Task, TaskModule};

const TEST_MODULE: &str = "tests.tasks.test_tasks";

struct Square;

impl Task for Square {
    const NAME: &'static str = "tests.tasks.test_tasks.square";
    type Args = (i64,);
    type Output = i64;
}

struct Cube;

impl Task for Cube {
    const NAME: &'static str = "tests.tasks.test_tasks.cube";
    type Args = (i64,);
    type Output = i64;
}

struct Math;

#[async_trait]
impl Handler<Square> for Math {
    async fn handle(&self, (x,): (i64,), _inv: &Invocation) -> Result<i64, TaskError> {
        Ok(x * x)
    }
}

#[async_trait]
impl Handler<Cube> for Math {
    async fn handle(&self, (x,): (i64,), _inv: &Invocation) -> Result<i64, TaskError> {
        Ok(x * x * x)
    }
}

/// square / cube に加えて、1回目は Retry を返す `flaky` と、
/// 結果を返さない `record` を持つ module
#[derive(Default)]
struct TestTasks {
    flaky_calls: Arc<AtomicU32>,
    recorded: Arc<AtomicU32>,
}

impl TaskModule for TestTasks {
    fn name(&self) -> &str {
        TEST_MODULE
    }

    fn register(&self, registry: &mut RegistryBuilder) -> Result<(), DispatchError> {
        registry
            .register::<Square, _>(Math)?
            .register::<Cube, _>(Math)?;

        let calls = Arc::clone(&self.flaky_calls);
        registry.register_fn("tests.tasks.test_tasks.flaky", true, move |inv| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(TaskError::retry("first attempt"));
            }
            inv.arg::<Value>(0)
        })?;

        let recorded = Arc::clone(&self.recorded);
        registry.register_fn("tests.tasks.test_tasks.record", false, move |_| {
            recorded.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        })?;
        Ok(())
    }
}

struct Harness {
    service: Arc<InMemoryQueueService>,
    app: App,
}

fn harness(extra: &str) -> Harness {
    harness_with(extra, TestTasks::default())
}

fn harness_with(extra: &str, tasks: TestTasks) -> Harness {
    let config = DispatchConfig::from_json_str(&format!(
        r#"{{
            "queue": {{"endpoint": "memory://test", "poll_time": 5}},
            "tasks": ["{TEST_MODULE}"],
            "routes": {{
                "tests.tasks.test_tasks": "test_tasks",
                "tests.tasks.test_tasks::cube": "cube_tasks"
            }},
            "default_route": "default_tasks"
            {extra}
        }}"#
    ))
    .unwrap();
    let service = Arc::new(InMemoryQueueService::with_visibility_timeout(Duration::from_millis(300)));
    let app = AppBuilder::new(config, service.clone())
        .module(tasks)
        .build()
        .unwrap();
    Harness { service, app }
}

impl Harness {
    fn fast_options(&self) -> RunnerOptions {
        let mut options = self.app.worker_options();
        options.workers = 2;
        options.fetcher.wait_time = Duration::from_millis(50);
        options
    }
}

#[tokio::test]
async fn cube_round_trip_through_function_route() {
    let h = harness("");
    let runner = h.app.start_worker(h.fast_options()).await.unwrap();
    let publisher = h.app.publisher();

    let mut result = publisher
        .task::<Cube>()
        .dispatch_args([json!(3)])
        .await
        .unwrap()
        .unwrap();
    let reply_queue = result.reply_queue().unwrap().to_string();
    assert!(reply_queue.starts_with("cube-"), "{reply_queue}");
    assert_eq!(reply_queue.len(), "cube-".len() + 8);

    assert_eq!(result.get_as::<i64>(Some(Duration::from_secs(5))).await.unwrap(), 27);
    assert_eq!(result.state(), &ResultState::Fulfilled(json!(27)));
    // 2回目はキャッシュから
    assert_eq!(result.get(Some(Duration::ZERO)).await.unwrap(), json!(27));

    publisher.shutdown().await.unwrap();
    assert!(!h.service.queue_exists(&reply_queue).await);

    let stats = runner.drain().await;
    assert_eq!(stats.succeeded, 1);
    assert_eq!(h.service.depth("cube_tasks").await.unwrap(), Default::default());
}

#[tokio::test]
async fn unknown_task_on_default_route_fails_remotely() {
    let h = harness("");
    let runner = h.app.start_worker(h.fast_options()).await.unwrap();
    let publisher = h.app.publisher();

    let mut result = publisher
        .invocation("galileo.app.ghost.ghost_task")
        .dispatch(vec![json!(1)], Kwargs::new())
        .await
        .unwrap()
        .unwrap();

    let err = result.get(Some(Duration::from_secs(5))).await.unwrap_err();
    assert!(err.is_remote("UnknownTaskError"), "{err}");
    assert!(matches!(result.state(), ResultState::Failed(detail) if detail.kind == "UnknownTaskError"));

    publisher.shutdown().await.unwrap();
    let stats = runner.drain().await;
    assert_eq!(stats.unknown, 1);
    assert_eq!(h.service.depth("default_tasks").await.unwrap(), Default::default());
}

#[tokio::test]
async fn timed_out_result_does_not_block_others_and_collects_late_reply() {
    let h = harness("");
    h.service.create_queue("cube_tasks").await.unwrap();
    let publisher = h.app.publisher();

    let mut slow = publisher.task::<Cube>().dispatch_args([json!(3)]).await.unwrap().unwrap();
    let mut fast = publisher.task::<Cube>().dispatch_args([json!(4)]).await.unwrap().unwrap();

    // worker がいないので期限切れ
    let err = slow.get(Some(Duration::from_millis(200))).await.unwrap_err();
    assert!(matches!(err, DispatchError::ResultTimeout { .. }), "{err}");
    assert_eq!(slow.state(), &ResultState::TimedOut);

    let runner = h.app.start_worker(h.fast_options()).await.unwrap();
    assert_eq!(fast.get(Some(Duration::from_secs(5))).await.unwrap(), json!(64));
    assert_eq!(slow.get(Some(Duration::from_secs(5))).await.unwrap(), json!(27));

    publisher.shutdown().await.unwrap();
    runner.drain().await;
}

#[tokio::test]
async fn concurrent_results_share_one_reply_queue() {
    let h = harness("");
    let runner = h.app.start_worker(h.fast_options()).await.unwrap();
    let publisher = h.app.publisher();

    let mut results = Vec::new();
    for x in 1..=6 {
        results.push(publisher.task::<Square>().dispatch_args([json!(x)]).await.unwrap().unwrap());
    }
    assert_eq!(publisher.reply_queue_names().await.len(), 1);

    // 後ろから待っても、それぞれ自分の返信を受け取る
    let mut values = Vec::new();
    for result in results.iter_mut().rev() {
        values.push(result.get_as::<i64>(Some(Duration::from_secs(5))).await.unwrap());
    }
    assert_eq!(values, vec![36, 25, 16, 9, 4, 1]);

    publisher.shutdown().await.unwrap();
    let stats = runner.drain().await;
    assert_eq!(stats.succeeded, 6);
}

#[tokio::test]
async fn retried_message_is_redelivered_after_visibility_timeout() {
    let tasks = TestTasks::default();
    let calls = Arc::clone(&tasks.flaky_calls);
    // visibility timeout はキューサービス側のデフォルト (300ms)
    let h = harness_with("", tasks);
    let runner = h.app.start_worker(h.fast_options()).await.unwrap();
    let publisher = h.app.publisher();

    let mut result = publisher
        .invocation("tests.tasks.test_tasks.flaky")
        .dispatch_args([json!("payload")])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.get(Some(Duration::from_secs(5))).await.unwrap(), json!("payload"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    publisher.shutdown().await.unwrap();
    let stats = runner.drain().await;
    assert_eq!(stats.retried, 1);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.received, 2);
}

#[tokio::test]
async fn fire_and_forget_needs_no_reply_queue() {
    let tasks = TestTasks::default();
    let recorded = Arc::clone(&tasks.recorded);
    let h = harness_with("", tasks);
    let runner = h.app.start_worker(h.fast_options()).await.unwrap();
    let publisher = h.app.publisher();

    for _ in 0..3 {
        let handle = publisher
            .invocation("tests.tasks.test_tasks.record")
            .with_result(false)
            .with_header("request_id", "1234")
            .dispatch(Vec::new(), Kwargs::new())
            .await
            .unwrap();
        assert!(handle.is_none());
    }
    assert!(publisher.reply_queue_names().await.is_empty());

    tokio::time::timeout(Duration::from_secs(5), async {
        while runner.stats().finished() < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(
        runner
            .fetcher_states()
            .iter()
            .all(|(_, state)| *state == FetcherState::Running)
    );

    let stats = runner.drain().await;
    assert_eq!(stats.succeeded, 3);
    assert_eq!(recorded.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn loop_count_stops_every_fetcher() {
    let h = harness("");
    let mut options = h.fast_options();
    options.fetcher.loop_count = Some(2);
    let runner = h.app.start_worker(options).await.unwrap();

    let queues: Vec<String> = runner.fetcher_states().into_iter().map(|(q, _)| q).collect();
    assert_eq!(queues, vec!["cube_tasks", "default_tasks", "test_tasks"]);
    for queue in &queues {
        assert!(h.service.queue_exists(queue).await);
    }

    tokio::time::timeout(Duration::from_secs(5), runner.stopped())
        .await
        .unwrap();
    let stats = runner.wait().await;
    assert_eq!(stats.received, 0);
}

#[tokio::test]
async fn synchronous_mode_skips_the_queue() {
    let h = harness(r#", "synchronous": true"#);
    let publisher = h.app.publisher();

    let mut result = publisher.task::<Cube>().dispatch_args([json!(3)]).await.unwrap().unwrap();
    assert_eq!(result.reply_queue(), None);
    assert_eq!(result.get(None).await.unwrap(), json!(27));
    assert!(publisher.reply_queue_names().await.is_empty());
    assert!(!h.service.queue_exists("cube_tasks").await);

    // 呼び出しごとに非同期へ戻せる
    let err = publisher
        .invocation("galileo.app.ghost.ghost_task")
        .dispatch(Vec::new(), Kwargs::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::UnknownTask(_)), "{err}");

    h.service.create_queue("cube_tasks").await.unwrap();
    let queued = publisher
        .task::<Cube>()
        .with_synchronous(false)
        .with_result(false)
        .dispatch_args([json!(2)])
        .await
        .unwrap();
    assert!(queued.is_none());
    assert_eq!(h.service.depth("cube_tasks").await.unwrap().visible, 1);
}
