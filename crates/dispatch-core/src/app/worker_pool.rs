use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span};

use super::consumer::{Consumer, WorkItem};

/// Worker pool handle.
/// - 全 worker が1本の work queue を共有する
/// - work queue の送信側（fetcher）が全部いなくなると、残りを処理し切ってから止まる
/// - `join()` で全 worker の終了を待てる
pub struct WorkerPool {
    joins: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `n` workers.
    pub fn spawn(n: usize, work_rx: mpsc::Receiver<WorkItem>, consumer: Arc<Consumer>) -> Self {
        let work_rx = Arc::new(Mutex::new(work_rx));

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let rx = Arc::clone(&work_rx);
            let consumer = Arc::clone(&consumer);

            let join = tokio::spawn(
                worker_loop(worker_id, rx, consumer).instrument(info_span!("worker", worker_id)),
            );
            joins.push(join);
        }
        info!(workers = n, "worker pool started");

        Self { joins }
    }

    pub fn size(&self) -> usize {
        self.joins.len()
    }

    /// Wait until the work queue is closed and drained.
    pub async fn join(self) {
        for j in self.joins {
            if let Err(e) = j.await {
                tracing::error!(error = %e, "worker task failed");
            }
        }
    }

    /// 処理中の handler ごと止める
    pub fn abort(&self) {
        for j in &self.joins {
            j.abort();
        }
    }
}

async fn worker_loop(worker_id: usize, work_rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>, consumer: Arc<Consumer>) {
    loop {
        // 待っている間ロックを握るのは1 worker だけ。取れたらすぐ離す
        let item = work_rx.lock().await.recv().await;

        let Some(item) = item else {
            debug!(worker_id, "work queue closed; worker exiting");
            return;
        };

        // handler 実行中はロックを持たない
        let outcome = consumer.handle(item).await;
        debug!(worker_id, ?outcome, "message handled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Kwargs, MessageId, RequestMessage, TaskName};
    use crate::impls::InMemoryQueueService;
    use crate::ports::{Clock, MessageAttributes, QueueService, ReceiveOptions, SystemClock, UlidGenerator};
    use crate::routing::Router;
    use crate::typed::task::fixtures::{Square, SquareHandler, TEST_MODULE};
    use crate::typed::{PayloadCodec, RegistryBuilder, Task};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn workers_drain_queue_after_senders_close() {
        let service = Arc::new(InMemoryQueueService::new());
        service.create_queue("math").await.unwrap();

        let router = Router::new(vec![(TEST_MODULE, "math")], None).unwrap();
        let mut builder = RegistryBuilder::new();
        builder.register::<Square, _>(SquareHandler).unwrap();
        let consumer = Arc::new(Consumer::new(
            service.clone(),
            Arc::new(builder.build(&router).unwrap()),
            Arc::new(UlidGenerator::new(SystemClock)),
            Arc::new(SystemClock),
        ));

        let codec = PayloadCodec::new();
        for i in 0..6 {
            let msg = RequestMessage::new(
                MessageId::from_ulid(ulid::Ulid::new()),
                SystemClock.now_nanos(),
                TaskName::new(Square::NAME).unwrap(),
                vec![json!(i)],
                Kwargs::new(),
            );
            service
                .send("math", &codec.encode_request(&msg).unwrap(), &MessageAttributes::new())
                .await
                .unwrap();
        }

        let (tx, rx) = mpsc::channel(2);
        let pool = WorkerPool::spawn(3, rx, Arc::clone(&consumer));
        assert_eq!(pool.size(), 3);

        let received = service
            .receive("math", ReceiveOptions::new(10, Duration::ZERO))
            .await
            .unwrap();
        for message in received {
            tx.send(WorkItem::from(message)).await.unwrap();
        }
        drop(tx);
        pool.join().await;

        let stats = consumer.stats().snapshot();
        assert_eq!(stats.received, 6);
        assert_eq!(stats.succeeded, 6);
        assert_eq!(service.depth("math").await.unwrap(), Default::default());
    }
}
