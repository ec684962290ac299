//! WorkerRunner - fetcher 群と worker pool をまとめて起動・停止する
//!
//! ```text
//! queue A ─ Fetcher ─┐
//! queue B ─ Fetcher ─┼─▶ work queue (bounded mpsc) ─▶ Worker × N
//! queue C ─ Fetcher ─┘
//! ```
//!
//! 停止は `drain()`: fetcher に受信をやめさせ、全 fetcher が work queue を
//! 手放すと worker は残りを処理してから終わる。

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use super::consumer::Consumer;
use super::fetcher::{Fetcher, FetcherHandle, FetcherOptions, FetcherState};
use super::worker_pool::WorkerPool;
use crate::domain::DispatchError;
use crate::observability::{StatsSnapshot, WorkerStats};
use crate::ports::QueueService;

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub workers: usize,
    pub work_queue_capacity: usize,
    pub fetcher: FetcherOptions,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            work_queue_capacity: 100,
            fetcher: FetcherOptions::default(),
        }
    }
}

pub struct WorkerRunner {
    fetchers: Vec<FetcherHandle>,
    pool: WorkerPool,
    stats: Arc<WorkerStats>,
}

impl WorkerRunner {
    /// `queues` ごとに fetcher を1つ起動する。全キューの作成が済んでから返る
    pub async fn start(
        service: Arc<dyn QueueService>,
        queues: BTreeSet<String>,
        consumer: Consumer,
        options: RunnerOptions,
    ) -> Result<Self, DispatchError> {
        let (work_tx, work_rx) = mpsc::channel(options.work_queue_capacity.max(1));
        let stats = consumer.stats();

        let mut fetchers = Vec::with_capacity(queues.len());
        for queue in queues {
            let fetcher = Fetcher::new(
                queue,
                Arc::clone(&service),
                options.fetcher.clone(),
                work_tx.clone(),
            );
            match fetcher.start().await {
                Ok(handle) => fetchers.push(handle),
                Err(e) => {
                    for handle in &fetchers {
                        handle.drain();
                    }
                    return Err(e);
                }
            }
        }
        // 自分の送信側は持たない。fetcher が全部止まれば work queue が閉じる
        drop(work_tx);

        let pool = WorkerPool::spawn(options.workers.max(1), work_rx, Arc::new(consumer));
        info!(
            fetchers = fetchers.len(),
            workers = pool.size(),
            capacity = options.work_queue_capacity,
            "worker runner started"
        );
        Ok(Self {
            fetchers,
            pool,
            stats,
        })
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn fetcher_states(&self) -> Vec<(String, FetcherState)> {
        self.fetchers
            .iter()
            .map(|f| (f.queue().to_string(), f.state()))
            .collect()
    }

    /// 全 fetcher が止まるまで待つ。worker はまだ動いているかもしれない
    pub async fn stopped(&self) {
        for fetcher in &self.fetchers {
            fetcher.stopped().await;
        }
    }

    /// 受信をやめ、取得済みのメッセージを処理し切ってから戻る
    pub async fn drain(self) -> StatsSnapshot {
        info!("draining worker runner");
        for fetcher in &self.fetchers {
            fetcher.drain();
        }
        self.wait().await
    }

    /// fetcher が自然に止まる（`loop_count` を使い切る）のを待つ
    pub async fn wait(self) -> StatsSnapshot {
        for fetcher in self.fetchers {
            fetcher.join().await;
        }
        self.pool.join().await;
        let stats = self.stats.snapshot();
        info!(?stats, "worker runner stopped");
        stats
    }
}
