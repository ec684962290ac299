//! Consumer - 1メッセージ分の処理
//!
//! # フロー
//! 1. RequestMessage に decode（失敗・期限切れは削除してログ）
//! 2. registry で task を引く（無ければ failure を返信して削除）
//! 3. handler を実行（panic は捕まえて `TaskError::Panicked` にする）
//! 4. 結果に応じて返信・削除
//!
//! | 結果 | 返信 | source message |
//! |------|------|----------------|
//! | Ok | success | 返信後に削除 |
//! | Retry / TimedOut | なし | 残す（visibility timeout で再配送） |
//! | Ignore | なし | 削除 |
//! | その他のエラー | failure | policy に従う |
//!
//! 削除しなかったメッセージは visibility timeout 後に再配送される。
//! これがこのシステムの唯一の再試行の仕組み。

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::HandlerErrorPolicy;
use crate::domain::{DispatchError, ErrorDetail, Invocation, RequestMessage, ResponseMessage, TaskError};
use crate::observability::{Outcome, WorkerStats};
use crate::ports::{Clock, IdGenerator, MessageAttributes, QueueService, ReceivedMessage};
use crate::typed::codec::{KIND_ATTRIBUTE, RESPONSE_KIND};
use crate::typed::{PayloadCodec, TaskRegistry};

/// fetcher が worker に渡す単位
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub queue: String,
    pub body: String,
    pub receipt: String,
    pub receive_count: u32,
}

impl From<ReceivedMessage> for WorkItem {
    fn from(message: ReceivedMessage) -> Self {
        Self {
            queue: message.queue,
            body: message.body,
            receipt: message.receipt,
            receive_count: message.receive_count,
        }
    }
}

pub struct Consumer {
    service: Arc<dyn QueueService>,
    registry: Arc<TaskRegistry>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    codec: PayloadCodec,
    handler_error: HandlerErrorPolicy,
    task_timeout: Option<Duration>,
    stats: Arc<WorkerStats>,
}

impl Consumer {
    pub fn new(
        service: Arc<dyn QueueService>,
        registry: Arc<TaskRegistry>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            service,
            registry,
            ids,
            clock,
            codec: PayloadCodec::new(),
            handler_error: HandlerErrorPolicy::default(),
            task_timeout: None,
            stats: Arc::new(WorkerStats::new()),
        }
    }

    pub fn with_handler_error(mut self, policy: HandlerErrorPolicy) -> Self {
        self.handler_error = policy;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    pub async fn handle(&self, item: WorkItem) -> Outcome {
        self.stats.record_received();
        let outcome = self.process(&item).await;
        self.stats.record(outcome);
        outcome
    }

    async fn process(&self, item: &WorkItem) -> Outcome {
        let message = match self
            .codec
            .decode_request(&item.body)
            .and_then(|m| m.validate(self.clock.now_nanos()).map(|()| m))
        {
            Ok(message) => message,
            Err(e) => {
                error!(queue = %item.queue, error = %e, body = %item.body, "received invalid message");
                self.delete(item).await;
                return Outcome::Invalid;
            }
        };
        info!(
            queue = %item.queue,
            task = %message.task_name,
            message_id = %message.id,
            receive_count = item.receive_count,
            "received message"
        );

        let task = match self.registry.lookup(message.task_name.as_str()) {
            Ok(task) => task,
            Err(e) => {
                error!(task = %message.task_name, message_id = %message.id, "unknown task");
                self.reply(&message, Err(ErrorDetail::from(&e))).await;
                self.delete(item).await;
                return Outcome::UnknownTask;
            }
        };

        let invocation = Invocation::from_request(&message, Some(item.receipt.clone()));
        match self.execute(task.handler(), invocation).await {
            Ok(value) => {
                if self.reply(&message, Ok(value)).await {
                    self.delete(item).await;
                    Outcome::Succeeded
                } else {
                    // 返信できなかったので再配送に任せる
                    Outcome::Retried
                }
            }
            Err(e @ (TaskError::Retry(_) | TaskError::TimedOut(_))) => {
                info!(task = %message.task_name, message_id = %message.id, reason = %e, "leaving message for redelivery");
                Outcome::Retried
            }
            Err(TaskError::Ignore) => {
                info!(task = %message.task_name, message_id = %message.id, "ignoring task");
                self.delete(item).await;
                Outcome::Ignored
            }
            Err(e) => {
                error!(task = %message.task_name, message_id = %message.id, error = %e, "task failed");
                self.reply(&message, Err(ErrorDetail::new(e.type_name(), e.to_string())))
                    .await;
                match self.handler_error {
                    HandlerErrorPolicy::Delete => self.delete(item).await,
                    HandlerErrorPolicy::Redeliver => {
                        debug!(message_id = %message.id, "keeping failed message for redelivery");
                    }
                }
                Outcome::Failed
            }
        }
    }

    /// handler は別 task で動かす。panic してもこの worker は止まらない
    async fn execute(
        &self,
        handler: Arc<dyn crate::typed::DynHandler>,
        invocation: Invocation,
    ) -> Result<Value, TaskError> {
        let mut join = tokio::spawn(async move { handler.call(invocation).await });
        let joined = match self.task_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut join).await {
                Ok(joined) => joined,
                Err(_) => {
                    join.abort();
                    return Err(TaskError::TimedOut(limit));
                }
            },
            None => join.await,
        };
        joined.unwrap_or_else(|e| {
            let reason = if e.is_panic() {
                panic_message(e.into_panic())
            } else {
                "task was cancelled".to_string()
            };
            Err(TaskError::Panicked(reason))
        })
    }

    /// reply_to があれば返信する。返信不要なら true、送信に失敗したら false
    async fn reply(&self, request: &RequestMessage, outcome: Result<Value, ErrorDetail>) -> bool {
        let Some(reply_to) = request.reply_to.as_deref() else {
            return true;
        };
        let id = self.ids.response_id();
        let now = self.clock.now_nanos();
        let response = match outcome {
            Ok(value) => ResponseMessage::success(id, now, request, value),
            Err(detail) => ResponseMessage::failure(id, now, request, detail),
        };
        let payload = match self.codec.encode_response(&response) {
            Ok(payload) => payload,
            Err(e) => {
                error!(message_id = %request.id, error = %e, "failed to encode response");
                return false;
            }
        };
        let attributes = MessageAttributes::from([(KIND_ATTRIBUTE.to_string(), RESPONSE_KIND.to_string())]);

        info!(reply_to = %reply_to, message_id = %request.id, status = ?response.status(), "send response");
        match self.service.send(reply_to, &payload, &attributes).await {
            Ok(_) => true,
            Err(DispatchError::QueueNotFound(queue)) => {
                error!(reply_to = %queue, message_id = %request.id, "reply_to queue not found");
                false
            }
            Err(e) => {
                error!(reply_to = %reply_to, message_id = %request.id, error = %e, "failed to send response");
                false
            }
        }
    }

    async fn delete(&self, item: &WorkItem) {
        debug!(queue = %item.queue, receipt = %item.receipt, "delete message");
        if let Err(e) = self.service.delete(&item.queue, &item.receipt).await {
            warn!(queue = %item.queue, error = %e, "failed to delete message");
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Kwargs, MessageId, ResponseStatus, TaskName};
    use crate::impls::InMemoryQueueService;
    use crate::ports::{ReceiveOptions, SystemClock, UlidGenerator};
    use crate::routing::Router;
    use crate::typed::{RegistryBuilder, Task};
    use crate::typed::task::fixtures::{Cube, CubeHandler, TEST_MODULE};
    use serde_json::json;

    const SOURCE: &str = "cube_tasks";
    const REPLY: &str = "cube-0000abcd";

    struct Fixture {
        service: Arc<InMemoryQueueService>,
        consumer: Consumer,
    }

    async fn fixture() -> Fixture {
        fixture_with(|c| c).await
    }

    async fn fixture_with(configure: impl FnOnce(Consumer) -> Consumer) -> Fixture {
        let service = Arc::new(InMemoryQueueService::with_visibility_timeout(Duration::from_secs(5)));
        service.create_queue(SOURCE).await.unwrap();
        service.create_queue(REPLY).await.unwrap();

        let router = Router::new(vec![(TEST_MODULE, SOURCE), ("app", SOURCE)], None).unwrap();
        let mut builder = RegistryBuilder::new();
        builder.register::<Cube, _>(CubeHandler).unwrap();
        builder
            .register_fn("app.tasks.flaky", true, |_| Err(TaskError::retry("not yet")))
            .unwrap();
        builder
            .register_fn("app.tasks.broken", true, |_| Err(TaskError::failed("boom")))
            .unwrap();
        builder
            .register_fn("app.tasks.skip", true, |_| Err(TaskError::Ignore))
            .unwrap();
        builder
            .register_fn("app.tasks.explode", true, |_| panic!("kaboom"))
            .unwrap();
        let registry = Arc::new(builder.build(&router).unwrap());

        let consumer = Consumer::new(
            service.clone(),
            registry,
            Arc::new(UlidGenerator::new(SystemClock)),
            Arc::new(SystemClock),
        );
        Fixture {
            service,
            consumer: configure(consumer),
        }
    }

    impl Fixture {
        /// source queue に積んで受け取った状態の WorkItem を返す
        async fn deliver(&self, task: &str, args: Vec<Value>, reply: bool) -> (RequestMessage, WorkItem) {
            let mut msg = RequestMessage::new(
                MessageId::from_ulid(ulid::Ulid::new()),
                SystemClock.now_nanos(),
                TaskName::new(task).unwrap(),
                args,
                Kwargs::new(),
            );
            if reply {
                msg = msg.with_reply_to(REPLY);
            }
            let body = PayloadCodec::new().encode_request(&msg).unwrap();
            self.deliver_raw(&body).await;
            let item = self.take().await;
            (msg, item)
        }

        async fn deliver_raw(&self, body: &str) {
            self.service.send(SOURCE, body, &MessageAttributes::new()).await.unwrap();
        }

        async fn take(&self) -> WorkItem {
            let mut received = self
                .service
                .receive(SOURCE, ReceiveOptions::new(1, Duration::ZERO))
                .await
                .unwrap();
            WorkItem::from(received.remove(0))
        }

        async fn replies(&self) -> Vec<ResponseMessage> {
            self.service
                .receive(REPLY, ReceiveOptions::new(10, Duration::ZERO))
                .await
                .unwrap()
                .iter()
                .map(|m| PayloadCodec::new().decode_response(&m.body).unwrap())
                .collect()
        }

        async fn source_depth(&self) -> (usize, usize) {
            let depth = self.service.depth(SOURCE).await.unwrap();
            (depth.visible, depth.in_flight)
        }
    }

    #[tokio::test]
    async fn success_replies_then_deletes() {
        let fx = fixture().await;
        let (msg, item) = fx.deliver(Cube::NAME, vec![json!(3)], true).await;

        assert_eq!(fx.consumer.handle(item).await, Outcome::Succeeded);
        assert_eq!(fx.source_depth().await, (0, 0));

        let replies = fx.replies().await;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].correlation_id(), msg.id);
        assert_eq!(replies[0].clone().into_result().unwrap(), json!(27));
    }

    #[tokio::test]
    async fn unknown_task_replies_failure() {
        let fx = fixture().await;
        let (_msg, item) = fx.deliver("app.tasks.ghost_task", vec![], true).await;

        assert_eq!(fx.consumer.handle(item).await, Outcome::UnknownTask);
        assert_eq!(fx.source_depth().await, (0, 0));
        let replies = fx.replies().await;
        assert_eq!(replies[0].status(), ResponseStatus::Failure);
        assert!(replies[0].clone().into_result().unwrap_err().is_remote("UnknownTaskError"));
    }

    #[tokio::test]
    async fn unknown_task_without_reply_is_dropped() {
        let fx = fixture().await;
        let (_msg, item) = fx.deliver("app.tasks.ghost_task", vec![], false).await;
        assert_eq!(fx.consumer.handle(item).await, Outcome::UnknownTask);
        assert_eq!(fx.source_depth().await, (0, 0));
        assert!(fx.replies().await.is_empty());
    }

    #[tokio::test]
    async fn retry_leaves_message_in_flight() {
        let fx = fixture().await;
        let (_msg, item) = fx.deliver("app.tasks.flaky", vec![], true).await;

        assert_eq!(fx.consumer.handle(item).await, Outcome::Retried);
        assert_eq!(fx.source_depth().await, (0, 1));
        assert!(fx.replies().await.is_empty());
    }

    #[tokio::test]
    async fn ignore_deletes_without_reply() {
        let fx = fixture().await;
        let (_msg, item) = fx.deliver("app.tasks.skip", vec![], true).await;

        assert_eq!(fx.consumer.handle(item).await, Outcome::Ignored);
        assert_eq!(fx.source_depth().await, (0, 0));
        assert!(fx.replies().await.is_empty());
    }

    #[tokio::test]
    async fn failure_replies_and_follows_policy() {
        let fx = fixture().await;
        let (_msg, item) = fx.deliver("app.tasks.broken", vec![], true).await;
        assert_eq!(fx.consumer.handle(item).await, Outcome::Failed);
        assert_eq!(fx.source_depth().await, (0, 0));
        assert!(fx.replies().await[0].clone().into_result().unwrap_err().is_remote("TaskError"));

        let fx = fixture_with(|c| c.with_handler_error(HandlerErrorPolicy::Redeliver)).await;
        let (_msg, item) = fx.deliver("app.tasks.broken", vec![], true).await;
        assert_eq!(fx.consumer.handle(item).await, Outcome::Failed);
        assert_eq!(fx.source_depth().await, (0, 1));
    }

    #[tokio::test]
    async fn panicking_handler_becomes_failure() {
        let fx = fixture().await;
        let (_msg, item) = fx.deliver("app.tasks.explode", vec![], true).await;

        assert_eq!(fx.consumer.handle(item).await, Outcome::Failed);
        let err = fx.replies().await[0].clone().into_result().unwrap_err();
        assert!(matches!(err, DispatchError::TaskFailed { kind, message } if kind == "Panicked" && message.contains("kaboom")));
    }

    #[tokio::test]
    async fn bad_arguments_fail_the_task() {
        let fx = fixture().await;
        let (_msg, item) = fx.deliver(Cube::NAME, vec![json!("three")], true).await;
        assert_eq!(fx.consumer.handle(item).await, Outcome::Failed);
        assert!(fx.replies().await[0].clone().into_result().unwrap_err().is_remote("InvalidArguments"));
    }

    #[tokio::test]
    async fn invalid_and_expired_messages_are_deleted() {
        let fx = fixture().await;
        fx.deliver_raw("{not json").await;
        let item = fx.take().await;
        assert_eq!(fx.consumer.handle(item).await, Outcome::Invalid);

        let expired = RequestMessage::new(
            MessageId::from_ulid(ulid::Ulid::new()),
            1,
            TaskName::new(Cube::NAME).unwrap(),
            vec![json!(3)],
            Kwargs::new(),
        )
        .with_expiration(1);
        fx.deliver_raw(&PayloadCodec::new().encode_request(&expired).unwrap()).await;
        let item = fx.take().await;
        assert_eq!(fx.consumer.handle(item).await, Outcome::Invalid);

        assert_eq!(fx.source_depth().await, (0, 0));
        assert_eq!(fx.consumer.stats().snapshot().invalid, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_times_out_when_limited() {
        struct Sleepy;

        #[async_trait::async_trait]
        impl crate::typed::DynHandler for Sleepy {
            async fn call(&self, _invocation: Invocation) -> Result<Value, TaskError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Value::Null)
            }
        }

        let fx = fixture_with(|c| c.with_task_timeout(Some(Duration::from_secs(1)))).await;
        let (msg, _) = fx.deliver(Cube::NAME, vec![json!(2)], false).await;
        let outcome = fx
            .consumer
            .execute(Arc::new(Sleepy), Invocation::from_request(&msg, None))
            .await;
        assert!(matches!(outcome, Err(TaskError::TimedOut(d)) if d == Duration::from_secs(1)));
    }
}
