//! InMemoryQueueService - 開発・テスト用のキューサービス
//!
//! SQS と同じ契約を in-process で再現します。
//! - 受信したメッセージは visibility timeout の間 in-flight になり、他の受信者から見えない
//! - timeout までに receipt で delete されなければ visible に戻り、receive_count が増える
//! - receive は wait_time まで long poll する（send / 期限切れで起こされる）
//!
//! 時刻は `tokio::time::Instant` なので、`tokio::time::pause()` したテストでも動きます。

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;
use ulid::Ulid;

use crate::domain::DispatchError;
use crate::ports::{MessageAttributes, QueueService, ReceiveOptions, ReceivedMessage};

/// SQS default.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    body: String,
    attributes: MessageAttributes,
    receive_count: u32,
}

#[derive(Debug)]
struct InFlight {
    message: StoredMessage,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    visible: VecDeque<StoredMessage>,
    /// receipt -> in-flight message
    in_flight: HashMap<String, InFlight>,
}

impl QueueState {
    /// 期限切れの in-flight を visible に戻す（元の順序は保証しない）
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.visible_at <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some(flight) = self.in_flight.remove(&receipt) {
                debug!(message_id = %flight.message.message_id, "visibility timeout expired; message visible again");
                self.visible.push_front(flight.message);
            }
        }
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.in_flight.values().map(|f| f.visible_at).min()
    }
}

/// Approximate counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub visible: usize,
    pub in_flight: usize,
}

struct ServiceState {
    queues: BTreeMap<String, QueueState>,
    default_visibility_timeout: Duration,
}

/// In-memory implementation of [`QueueService`].
#[derive(Clone)]
pub struct InMemoryQueueService {
    state: Arc<Mutex<ServiceState>>,
    notify: Arc<Notify>,
}

impl InMemoryQueueService {
    pub fn new() -> Self {
        Self::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility_timeout(default_visibility_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(ServiceState {
                queues: BTreeMap::new(),
                default_visibility_timeout,
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    pub async fn queue_exists(&self, name: &str) -> bool {
        self.state.lock().await.queues.contains_key(name)
    }

    pub async fn queue_names(&self) -> Vec<String> {
        self.state.lock().await.queues.keys().cloned().collect()
    }

    pub async fn depth(&self, name: &str) -> Option<QueueDepth> {
        let mut state = self.state.lock().await;
        let queue = state.queues.get_mut(name)?;
        queue.reclaim_expired(Instant::now());
        Some(QueueDepth {
            visible: queue.visible.len(),
            in_flight: queue.in_flight.len(),
        })
    }

    pub async fn purge(&self, name: &str) -> Result<(), DispatchError> {
        let mut state = self.state.lock().await;
        let queue = state
            .queues
            .get_mut(name)
            .ok_or_else(|| DispatchError::QueueNotFound(name.to_string()))?;
        queue.visible.clear();
        queue.in_flight.clear();
        Ok(())
    }

    /// 受信を1回試みる。何も取れなければ次に起きるべき時刻を返す
    async fn try_receive(
        &self,
        queue: &str,
        options: &ReceiveOptions,
    ) -> Result<Result<Vec<ReceivedMessage>, Option<Instant>>, DispatchError> {
        let mut state = self.state.lock().await;
        let visibility = options
            .visibility_timeout
            .unwrap_or(state.default_visibility_timeout);
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| DispatchError::QueueNotFound(queue.to_string()))?;

        let now = Instant::now();
        q.reclaim_expired(now);

        let mut received = Vec::new();
        while received.len() < options.max_messages.max(1) {
            let Some(mut message) = q.visible.pop_front() else {
                break;
            };
            message.receive_count += 1;
            let receipt = Ulid::new().to_string();
            received.push(ReceivedMessage {
                queue: queue.to_string(),
                body: message.body.clone(),
                receipt: receipt.clone(),
                attributes: message.attributes.clone(),
                receive_count: message.receive_count,
            });
            q.in_flight.insert(
                receipt,
                InFlight {
                    message,
                    visible_at: now + visibility,
                },
            );
        }

        if received.is_empty() {
            Ok(Err(q.next_expiry()))
        } else {
            Ok(Ok(received))
        }
    }
}

impl Default for InMemoryQueueService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueService for InMemoryQueueService {
    async fn create_queue(&self, name: &str) -> Result<(), DispatchError> {
        let mut state = self.state.lock().await;
        if !state.queues.contains_key(name) {
            debug!(queue = name, "create queue");
            state.queues.insert(name.to_string(), QueueState::default());
        }
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<(), DispatchError> {
        let removed = self.state.lock().await.queues.remove(name);
        if removed.is_none() {
            return Err(DispatchError::QueueNotFound(name.to_string()));
        }
        debug!(queue = name, "delete queue");
        // receive 中の呼び出しに QueueNotFound を返させる
        self.notify.notify_waiters();
        Ok(())
    }

    async fn send(
        &self,
        queue: &str,
        payload: &str,
        attributes: &MessageAttributes,
    ) -> Result<String, DispatchError> {
        let message_id = Ulid::new().to_string();
        {
            let mut state = self.state.lock().await;
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| DispatchError::QueueNotFound(queue.to_string()))?;
            q.visible.push_back(StoredMessage {
                message_id: message_id.clone(),
                body: payload.to_string(),
                attributes: attributes.clone(),
                receive_count: 0,
            });
        }
        self.notify.notify_waiters();
        Ok(message_id)
    }

    async fn receive(
        &self,
        queue: &str,
        options: ReceiveOptions,
    ) -> Result<Vec<ReceivedMessage>, DispatchError> {
        let deadline = Instant::now() + options.wait_time;
        loop {
            // 状態を見る前に登録しておき、その間の send を取りこぼさない
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_expiry = match self.try_receive(queue, &options).await? {
                Ok(messages) => return Ok(messages),
                Err(next_expiry) => next_expiry,
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let wake_at = next_expiry.map_or(deadline, |at| at.min(deadline));

            tokio::select! {
                _ = &mut notified => {},
                _ = tokio::time::sleep_until(wake_at) => {},
            }
        }
    }

    async fn delete(&self, queue: &str, receipt: &str) -> Result<(), DispatchError> {
        let mut state = self.state.lock().await;
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| DispatchError::QueueNotFound(queue.to_string()))?;
        if q.in_flight.remove(receipt).is_none() {
            // 期限切れで再配送済みの receipt。SQS 同様に no-op
            debug!(queue, receipt, "delete with stale receipt ignored");
        }
        Ok(())
    }
}
