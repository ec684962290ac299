//! Publisher - task 呼び出しを RequestMessage にしてキューへ送る
//!
//! # 学習ポイント
//! - 所有権でリソースの寿命を表す（返信キューは Publisher が作って Publisher が消す）
//! - `shutdown()` を明示的に呼ぶのが基本。呼ばれずに drop された場合も削除を試みる
//! - Builder 風の `AsyncInvocation` で呼び出しごとの設定を積む

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::async_result::AsyncResult;
use super::reply_queue::ReplyQueue;
use crate::domain::{
    Args, DispatchError, ErrorDetail, Headers, Invocation, Kwargs, RequestMessage, TaskName,
};
use crate::ports::{Clock, IdGenerator, MessageAttributes, QueueService, SystemClock, UlidGenerator};
use crate::routing::Router;
use crate::typed::codec::{KIND_ATTRIBUTE, REQUEST_KIND};
use crate::typed::{PayloadCodec, Task, TaskRegistry};

#[derive(Debug, Clone)]
pub struct PublisherOptions {
    /// `AsyncResult::get(None)` の待ち時間
    pub poll_time: Duration,
    /// true なら queue を経由せずその場で handler を実行する
    pub synchronous: bool,
}

impl Default for PublisherOptions {
    fn default() -> Self {
        Self {
            poll_time: Duration::from_secs(20),
            synchronous: false,
        }
    }
}

pub struct Publisher {
    service: Arc<dyn QueueService>,
    router: Arc<Router>,
    registry: Option<Arc<TaskRegistry>>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    codec: PayloadCodec,
    options: PublisherOptions,
    /// task 名 → 返信キュー
    reply_queues: Mutex<HashMap<TaskName, Arc<ReplyQueue>>>,
}

impl Publisher {
    pub fn new(service: Arc<dyn QueueService>, router: Arc<Router>) -> Self {
        Self {
            service,
            router,
            registry: None,
            ids: Arc::new(UlidGenerator::new(SystemClock)),
            clock: Arc::new(SystemClock),
            codec: PayloadCodec::new(),
            options: PublisherOptions::default(),
            reply_queues: Mutex::new(HashMap::new()),
        }
    }

    /// synchronous モードで handler を引くための registry
    pub fn with_registry(mut self, registry: Arc<TaskRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_options(mut self, options: PublisherOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn options(&self) -> &PublisherOptions {
        &self.options
    }

    /// 呼び出しごとの設定を積むための builder
    pub fn invocation(&self, task: &str) -> AsyncInvocation<'_> {
        AsyncInvocation {
            publisher: self,
            task: task.to_string(),
            headers: Headers::new(),
            synchronous: None,
            want_result: true,
            expiration: None,
        }
    }

    /// 型付き task の呼び出し。結果を待つかどうかは `T::RETURNS_RESULT`
    pub fn task<T: Task>(&self) -> AsyncInvocation<'_> {
        self.invocation(T::NAME).with_result(T::RETURNS_RESULT)
    }

    /// `want_result` が false なら `None` を返す
    pub async fn dispatch(
        &self,
        task: &str,
        args: Args,
        kwargs: Kwargs,
        want_result: bool,
    ) -> Result<Option<AsyncResult>, DispatchError> {
        self.invocation(task)
            .with_result(want_result)
            .dispatch(args, kwargs)
            .await
    }

    /// Names of the reply queues created so far.
    pub async fn reply_queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .reply_queues
            .lock()
            .await
            .values()
            .map(|q| q.name().to_string())
            .collect();
        names.sort();
        names
    }

    /// 作った返信キューを全部消す。失敗はログに残し、最初のエラーを返す
    pub async fn shutdown(&self) -> Result<(), DispatchError> {
        let queues: Vec<Arc<ReplyQueue>> = self
            .reply_queues
            .lock()
            .await
            .drain()
            .map(|(_, q)| q)
            .collect();

        let mut first_error = None;
        for queue in queues {
            queue.close();
            match self.service.delete_queue(queue.name()).await {
                Ok(()) => info!(queue = queue.name(), "deleted reply queue"),
                Err(e) => {
                    error!(queue = queue.name(), error = %e, "failed to delete reply queue");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn reply_queue(&self, task: &TaskName) -> Result<Arc<ReplyQueue>, DispatchError> {
        let mut queues = self.reply_queues.lock().await;
        if let Some(queue) = queues.get(task) {
            return Ok(Arc::clone(queue));
        }
        let queue = Arc::new(ReplyQueue::new(ReplyQueue::name_for(task)));
        self.service.create_queue(queue.name()).await?;
        info!(task = %task, queue = queue.name(), "created reply queue");
        queues.insert(task.clone(), Arc::clone(&queue));
        Ok(queue)
    }

    async fn publish(&self, invocation: AsyncInvocation<'_>, args: Args, kwargs: Kwargs) -> Result<Option<AsyncResult>, DispatchError> {
        let task = TaskName::new(invocation.task)?;
        let id = self.ids.message_id();
        let now = self.clock.now_nanos();
        let mut message = RequestMessage::new(id, now, task.clone(), args, kwargs)
            .with_headers(invocation.headers);
        if let Some(expiration) = invocation.expiration {
            message = message.with_expiration(i64::try_from(expiration.as_nanos()).unwrap_or(i64::MAX));
        }

        if invocation.synchronous.unwrap_or(self.options.synchronous) {
            return self.run_synchronously(message, invocation.want_result).await;
        }

        let queue = self.router.resolve(&task)?.to_string();
        let pending = if invocation.want_result {
            let reply = self.reply_queue(&task).await?;
            message = message.with_reply_to(reply.name());
            let rx = reply.register(id);
            Some((reply, rx))
        } else {
            None
        };

        let sent = self.send(&queue, &message).await;
        if let Err(e) = sent {
            if let Some((reply, _)) = &pending {
                reply.forget(&id);
            }
            return Err(e);
        }
        info!(task = %task, queue = %queue, message_id = %id, reply_to = ?message.reply_to, "dispatched task");

        Ok(pending.map(|(reply, rx)| {
            AsyncResult::pending(
                id,
                task,
                reply,
                rx,
                Arc::clone(&self.service),
                self.options.poll_time,
            )
        }))
    }

    async fn send(&self, queue: &str, message: &RequestMessage) -> Result<(), DispatchError> {
        let payload = self.codec.encode_request(message)?;
        let mut attributes: MessageAttributes = message.headers.clone();
        attributes.insert(KIND_ATTRIBUTE.to_string(), REQUEST_KIND.to_string());

        debug!(queue = %queue, payload = %payload, "send message");
        self.service
            .send(queue, &payload, &attributes)
            .await
            .map(|_| ())
            .map_err(|e| DispatchError::Publish {
                queue: queue.to_string(),
                message: e.to_string(),
            })
    }

    async fn run_synchronously(
        &self,
        message: RequestMessage,
        want_result: bool,
    ) -> Result<Option<AsyncResult>, DispatchError> {
        let registry = self.registry.as_ref().ok_or_else(|| {
            DispatchError::Configuration("synchronous dispatch needs a task registry".to_string())
        })?;
        let task = registry.lookup(message.task_name.as_str())?;
        warn!(task = %message.task_name, "running synchronously");

        let outcome = task
            .handler()
            .call(Invocation::from_request(&message, None))
            .await
            .map_err(|e| ErrorDetail::new(e.type_name(), e.to_string()));
        if let Err(detail) = &outcome {
            error!(task = %message.task_name, error = %detail.message, "synchronous task failed");
        }
        Ok(want_result.then(|| AsyncResult::ready(message.id, message.task_name, outcome)))
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        let queues: Vec<String> = self
            .reply_queues
            .get_mut()
            .drain()
            .map(|(_, q)| {
                q.close();
                q.name().to_string()
            })
            .collect();
        if queues.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(queues = ?queues, "publisher dropped without shutdown; deleting reply queues");
                let service = Arc::clone(&self.service);
                handle.spawn(async move {
                    for queue in queues {
                        if let Err(e) = service.delete_queue(&queue).await {
                            error!(queue = %queue, error = %e, "failed to delete reply queue");
                        }
                    }
                });
            }
            Err(_) => {
                error!(queues = ?queues, "publisher dropped outside a runtime; reply queues were not deleted");
            }
        }
    }
}

/// 1回分の呼び出し設定
///
/// ```ignore
/// publisher
///     .invocation("app.mail.send_email")
///     .with_header("request_id", "1234")
///     .with_result(false)
///     .dispatch(vec![json!("example@email.com")], Kwargs::new())
///     .await?;
/// ```
#[must_use]
pub struct AsyncInvocation<'a> {
    publisher: &'a Publisher,
    task: String,
    headers: Headers,
    synchronous: Option<bool>,
    want_result: bool,
    expiration: Option<Duration>,
}

impl<'a> AsyncInvocation<'a> {
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// 設定の `synchronous` をこの呼び出しだけ上書きする
    pub fn with_synchronous(mut self, synchronous: bool) -> Self {
        self.synchronous = Some(synchronous);
        self
    }

    pub fn with_result(mut self, want_result: bool) -> Self {
        self.want_result = want_result;
        self
    }

    /// Message is dropped by workers once this much time has passed since dispatch.
    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub async fn dispatch(self, args: Args, kwargs: Kwargs) -> Result<Option<AsyncResult>, DispatchError> {
        let publisher = self.publisher;
        publisher.publish(self, args, kwargs).await
    }

    /// 位置引数だけの呼び出し
    pub async fn dispatch_args(self, args: impl IntoIterator<Item = Value>) -> Result<Option<AsyncResult>, DispatchError> {
        self.dispatch(args.into_iter().collect(), Kwargs::new()).await
    }
}

impl std::fmt::Debug for AsyncInvocation<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncInvocation")
            .field("task", &self.task)
            .field("headers", &self.headers)
            .field("synchronous", &self.synchronous)
            .field("want_result", &self.want_result)
            .finish()
    }
}
