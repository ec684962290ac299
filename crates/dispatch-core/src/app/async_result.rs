//! AsyncResult - dispatch した task の結果を待つハンドル
//!
//! # 状態遷移
//! ```text
//! Pending ──(返信 success)──▶ Fulfilled
//!    │  ───(返信 failure)──▶ Failed
//!    └──(期限切れ)──▶ TimedOut ──(再度 get)──▶ Pending
//! ```
//!
//! 返信キューは task 名ごとに共有される。`get` 中の AsyncResult は
//! 自分で返信キューを long poll しつつ、他の AsyncResult が受け取った
//! 自分宛ての返信も oneshot で受け取る。自分宛てでない返信は
//! 待ち手に転送し、待ち手がいなければ捨てる。

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::reply_queue::ReplyQueue;
use crate::domain::{DispatchError, ErrorDetail, MessageId, ResponseMessage, TaskName};
use crate::ports::{QueueService, ReceiveOptions};
use crate::typed::PayloadCodec;

/// SQS の long poll 上限
const MAX_POLL_WAIT: Duration = Duration::from_secs(20);
const REPLY_BATCH_SIZE: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub enum ResultState {
    Pending,
    Fulfilled(Value),
    Failed(ErrorDetail),
    TimedOut,
}

struct ReplyChannel {
    queue: Arc<ReplyQueue>,
    service: Arc<dyn QueueService>,
    codec: PayloadCodec,
    rx: oneshot::Receiver<ResponseMessage>,
}

pub struct AsyncResult {
    id: MessageId,
    task: TaskName,
    state: ResultState,
    default_timeout: Duration,
    channel: Option<ReplyChannel>,
}

impl AsyncResult {
    pub(crate) fn pending(
        id: MessageId,
        task: TaskName,
        queue: Arc<ReplyQueue>,
        rx: oneshot::Receiver<ResponseMessage>,
        service: Arc<dyn QueueService>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            id,
            task,
            state: ResultState::Pending,
            default_timeout,
            channel: Some(ReplyChannel {
                queue,
                service,
                codec: PayloadCodec::new(),
                rx,
            }),
        }
    }

    /// synchronous モード用: 最初から結果が入っている
    pub(crate) fn ready(id: MessageId, task: TaskName, outcome: Result<Value, ErrorDetail>) -> Self {
        let state = match outcome {
            Ok(value) => ResultState::Fulfilled(value),
            Err(detail) => ResultState::Failed(detail),
        };
        Self {
            id,
            task,
            state,
            default_timeout: Duration::ZERO,
            channel: None,
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn task(&self) -> &TaskName {
        &self.task
    }

    pub fn state(&self) -> &ResultState {
        &self.state
    }

    pub fn reply_queue(&self) -> Option<&str> {
        self.channel.as_ref().map(|c| c.queue.name())
    }

    /// 結果を待つ。`timeout` が `None` なら publisher の poll_time
    ///
    /// 結果が確定した後の呼び出しは同じ結果を返す。
    pub async fn get(&mut self, timeout: Option<Duration>) -> Result<Value, DispatchError> {
        match &self.state {
            ResultState::Fulfilled(value) => return Ok(value.clone()),
            ResultState::Failed(detail) => return Err(detail.clone().into()),
            ResultState::Pending | ResultState::TimedOut => {}
        }
        let timeout = timeout.unwrap_or(self.default_timeout);
        let Some(channel) = self.channel.as_mut() else {
            return Err(self.timeout_error(timeout));
        };

        self.state = ResultState::Pending;
        let deadline = Instant::now() + timeout;
        info!(task = %self.task, message_id = %self.id, queue = channel.queue.name(), "waiting for result");

        let response = match tokio::time::timeout_at(deadline, channel.wait(deadline)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e @ DispatchError::QueueNotFound(_))) => {
                // 返信キューが閉じられた。以後は待てない
                channel.queue.forget(&self.id);
                self.channel = None;
                return Err(e);
            }
            Ok(Err(e)) => return Err(e),
            // 期限切れの直前に振り分けられた返信は oneshot に残っている
            Err(_) => match channel.rx.try_recv() {
                Ok(response) => response,
                Err(TryRecvError::Closed) => {
                    let queue = channel.queue.name().to_string();
                    self.channel = None;
                    self.state = ResultState::TimedOut;
                    return Err(DispatchError::QueueNotFound(queue));
                }
                Err(TryRecvError::Empty) => {
                    self.state = ResultState::TimedOut;
                    return Err(self.timeout_error(timeout));
                }
            },
        };

        channel.queue.forget(&self.id);
        match response.into_result() {
            Ok(value) => {
                self.state = ResultState::Fulfilled(value.clone());
                Ok(value)
            }
            Err(DispatchError::TaskFailed { kind, message }) => {
                self.state = ResultState::Failed(ErrorDetail::new(kind.clone(), message.clone()));
                Err(DispatchError::TaskFailed { kind, message })
            }
            Err(other) => Err(other),
        }
    }

    /// `get` して `O` にデコードする
    pub async fn get_as<O: DeserializeOwned>(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<O, DispatchError> {
        let value = self.get(timeout).await?;
        Ok(serde_json::from_value(value)?)
    }

    fn timeout_error(&self, timeout: Duration) -> DispatchError {
        DispatchError::ResultTimeout {
            message_id: self.id.to_string(),
            timeout,
        }
    }
}

impl ReplyChannel {
    /// 自分宛ての返信は必ず oneshot 経由で受け取る（自分で poll したものも含む）
    async fn wait(&mut self, deadline: Instant) -> Result<ResponseMessage, DispatchError> {
        let ReplyChannel {
            queue,
            service,
            codec,
            rx,
        } = self;
        loop {
            tokio::select! {
                biased;
                forwarded = &mut *rx => {
                    return forwarded.map_err(|_| DispatchError::QueueNotFound(queue.name().to_string()));
                }
                polled = poll_once(queue, service, codec, deadline) => polled?,
            }
        }
    }
}

/// 1回 receive して、届いた返信を全部待ち手に振り分けてから削除する
///
/// receive が返った後は振り分けまで await しない。途中で drop されても
/// 受け取った返信は待ち手の oneshot に入っている。
async fn poll_once(
    queue: &ReplyQueue,
    service: &Arc<dyn QueueService>,
    codec: &PayloadCodec,
    deadline: Instant,
) -> Result<(), DispatchError> {
    let wait = deadline.saturating_duration_since(Instant::now()).min(MAX_POLL_WAIT);
    let messages = service
        .receive(queue.name(), ReceiveOptions::new(REPLY_BATCH_SIZE, wait))
        .await?;

    let mut receipts = Vec::with_capacity(messages.len());
    for message in messages {
        receipts.push(message.receipt);
        let response = match codec.decode_response(&message.body) {
            Ok(response) => response,
            Err(e) => {
                warn!(queue = queue.name(), error = %e, "discarding undecodable reply");
                continue;
            }
        };
        debug!(queue = queue.name(), original = %response.correlation_id(), "received reply");
        if let Err(stale) = queue.deliver(response) {
            warn!(
                queue = queue.name(),
                original = %stale.correlation_id(),
                task = %stale.original.task,
                "discarding reply with no waiting result"
            );
        }
    }

    // ここで中断されても、残りは visibility timeout 後に届き直して捨てられるだけ
    for receipt in receipts {
        if let Err(e) = service.delete(queue.name(), &receipt).await {
            error!(queue = queue.name(), error = %e, "failed to delete reply message");
        }
    }
    Ok(())
}

impl Drop for AsyncResult {
    fn drop(&mut self) {
        if let Some(channel) = &self.channel {
            channel.queue.forget(&self.id);
        }
    }
}

impl std::fmt::Debug for AsyncResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncResult")
            .field("id", &self.id)
            .field("task", &self.task)
            .field("state", &self.state)
            .field("reply_queue", &self.reply_queue())
            .finish()
    }
}
