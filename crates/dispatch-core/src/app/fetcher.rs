//! Fetcher - 1つのキューから受信して work queue に積む
//!
//! fetcher は task を実行しない。受け取ったメッセージを bounded な
//! work queue (`mpsc`) に送るだけ。work queue が満杯なら `send().await` で
//! 止まるので、その間は受信もしない（メッセージは捨てない）。
//!
//! # 状態
//! `Running → Draining → Stopped`
//! - drain 要求で受信をやめる。手元のバッチは work queue に流し切ってから止まる
//! - `loop_count` を使い切った場合も同じように止まる

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::consumer::WorkItem;
use crate::domain::DispatchError;
use crate::ports::{QueueService, ReceiveOptions};

/// 受信エラー後の待ち時間
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetcherState {
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct FetcherOptions {
    pub batch_size: usize,
    pub wait_time: Duration,
    pub visibility_timeout: Option<Duration>,
    /// 受信ループの回数上限。`None` なら drain まで回り続ける
    pub loop_count: Option<usize>,
}

impl Default for FetcherOptions {
    fn default() -> Self {
        Self {
            batch_size: 5,
            wait_time: Duration::from_secs(2),
            visibility_timeout: None,
            loop_count: None,
        }
    }
}

pub struct Fetcher {
    queue: String,
    service: Arc<dyn QueueService>,
    options: FetcherOptions,
    work_tx: mpsc::Sender<WorkItem>,
}

impl Fetcher {
    pub fn new(
        queue: impl Into<String>,
        service: Arc<dyn QueueService>,
        options: FetcherOptions,
        work_tx: mpsc::Sender<WorkItem>,
    ) -> Self {
        Self {
            queue: queue.into(),
            service,
            options,
            work_tx,
        }
    }

    /// キューを作って（既にあれば何もしない）受信ループを起動する
    pub async fn start(self) -> Result<FetcherHandle, DispatchError> {
        self.service.create_queue(&self.queue).await?;
        let (drain_tx, drain_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(FetcherState::Running);
        let queue = self.queue.clone();
        info!(queue = %queue, loop_count = ?self.options.loop_count, "fetcher started");
        let join = tokio::spawn(self.run(drain_rx, state_tx));
        Ok(FetcherHandle {
            queue,
            drain_tx,
            state_rx,
            join,
        })
    }

    async fn run(self, mut drain_rx: watch::Receiver<bool>, state_tx: watch::Sender<FetcherState>) {
        let options = ReceiveOptions::new(self.options.batch_size, self.options.wait_time)
            .with_visibility_timeout(self.options.visibility_timeout);
        let mut count = 0usize;

        loop {
            if *drain_rx.borrow() {
                break;
            }
            if self.options.loop_count.is_some_and(|limit| count >= limit) {
                info!(queue = %self.queue, "done fetching");
                break;
            }
            count += 1;

            let received = tokio::select! {
                biased;
                _ = drain_rx.changed() => break,
                received = self.service.receive(&self.queue, options) => received,
            };

            match received {
                Ok(messages) => {
                    if !messages.is_empty() {
                        debug!(queue = %self.queue, count = messages.len(), "fetched messages");
                    }
                    for message in messages {
                        // 満杯ならここで待つ
                        if self.work_tx.send(WorkItem::from(message)).await.is_err() {
                            warn!(queue = %self.queue, "work queue closed; fetcher stopping");
                            let _ = state_tx.send(FetcherState::Stopped);
                            return;
                        }
                    }
                }
                Err(e) => {
                    error!(queue = %self.queue, error = %e, "receive failed");
                    tokio::select! {
                        _ = drain_rx.changed() => break,
                        _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        let _ = state_tx.send(FetcherState::Draining);
        // work_tx を手放した時点で worker 側から見て入力が1本減る
        drop(self.work_tx);
        let _ = state_tx.send(FetcherState::Stopped);
        info!(queue = %self.queue, "fetcher stopped");
    }
}

pub struct FetcherHandle {
    queue: String,
    drain_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<FetcherState>,
    join: JoinHandle<()>,
}

impl FetcherHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn state(&self) -> FetcherState {
        let state = *self.state_rx.borrow();
        if state == FetcherState::Running && *self.drain_tx.borrow() {
            FetcherState::Draining
        } else {
            state
        }
    }

    /// 受信をやめるよう伝える。止まるのを待つには `join`
    pub fn drain(&self) {
        self.drain_tx.send_replace(true);
    }

    /// 受信ループが止まるまで待つ（handle は手放さない）
    pub async fn stopped(&self) {
        let mut state_rx = self.state_rx.clone();
        // 送信側が消えた場合も止まったものとみなす
        let _ = state_rx.wait_for(|s| *s == FetcherState::Stopped).await;
    }

    pub async fn join(self) {
        if let Err(e) = self.join.await {
            error!(queue = %self.queue, error = %e, "fetcher task failed");
        }
    }
}
