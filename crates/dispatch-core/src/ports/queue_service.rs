//! QueueService port - マネージドキューサービス（SQS 互換）の抽象化
//!
//! 接続・セッション管理、一時的な通信エラーのリトライ/バックオフは実装側の責務。
//! core はこの trait 越しにしか外部キューと話さない。
//!
//! # 契約
//! - `create_queue` は冪等（既存なら何もしない）
//! - `receive` で受け取ったメッセージは visibility timeout の間だけ他の consumer から隠れる
//! - timeout までに `delete` されなければ再び可視になり、再配送される（at-least-once）
//! - `delete` は receipt handle で行う。期限切れの receipt での delete は実装依存

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::DispatchError;

/// Message attributes sent alongside the payload (headers).
pub type MessageAttributes = BTreeMap<String, String>;

/// A message handed out by `receive`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub queue: String,
    pub body: String,
    pub receipt: String,
    pub attributes: MessageAttributes,
    /// How many times this message has been received, including this one.
    pub receive_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveOptions {
    /// Upper bound on messages returned by one call.
    pub max_messages: usize,
    /// Long-poll duration; the call returns early once messages are available.
    pub wait_time: Duration,
    /// Overrides the queue's default visibility timeout.
    pub visibility_timeout: Option<Duration>,
}

impl ReceiveOptions {
    pub fn new(max_messages: usize, wait_time: Duration) -> Self {
        Self {
            max_messages,
            wait_time,
            visibility_timeout: None,
        }
    }

    pub fn with_visibility_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.visibility_timeout = timeout;
        self
    }
}

#[async_trait]
pub trait QueueService: Send + Sync {
    async fn create_queue(&self, name: &str) -> Result<(), DispatchError>;

    async fn delete_queue(&self, name: &str) -> Result<(), DispatchError>;

    /// Returns the service-assigned message id.
    async fn send(
        &self,
        queue: &str,
        payload: &str,
        attributes: &MessageAttributes,
    ) -> Result<String, DispatchError>;

    async fn receive(
        &self,
        queue: &str,
        options: ReceiveOptions,
    ) -> Result<Vec<ReceivedMessage>, DispatchError>;

    async fn delete(&self, queue: &str, receipt: &str) -> Result<(), DispatchError>;
}
