//! ReplyQueue - publisher が所有する返信用キュー
//!
//! task 名ごとに1つ作って使い回す（`{関数名}-{8桁hex}`）。
//! 同じキューを複数の AsyncResult が共有するので、届いた返信は
//! correlation id で待ち手に振り分ける。

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::domain::{MessageId, ResponseMessage, TaskName};

pub(crate) struct ReplyQueue {
    name: String,
    /// correlation id → 待っている AsyncResult
    pending: Mutex<HashMap<MessageId, oneshot::Sender<ResponseMessage>>>,
}

impl ReplyQueue {
    pub(crate) fn new(name: String) -> Self {
        Self {
            name,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// `cube-1a2b3c4d`
    pub(crate) fn name_for(task: &TaskName) -> String {
        format!("{}-{:08x}", task.function(), rand::random::<u32>())
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<MessageId, oneshot::Sender<ResponseMessage>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 送信より前に呼ぶこと（速い worker の返信を取りこぼさないため）
    pub(crate) fn register(&self, id: MessageId) -> oneshot::Receiver<ResponseMessage> {
        let (tx, rx) = oneshot::channel();
        self.pending().insert(id, tx);
        rx
    }

    pub(crate) fn forget(&self, id: &MessageId) {
        self.pending().remove(id);
    }

    /// 返信を待ち手に渡す。待ち手がいなければ返信を返す
    pub(crate) fn deliver(&self, response: ResponseMessage) -> Result<(), ResponseMessage> {
        let waiter = self.pending().remove(&response.correlation_id());
        match waiter {
            Some(tx) => tx.send(response),
            None => Err(response),
        }
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// 待ち手を全部外す。待っている側の受信は閉じられる
    pub(crate) fn close(&self) {
        self.pending().clear();
    }
}

impl std::fmt::Debug for ReplyQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyQueue")
            .field("name", &self.name)
            .field("pending", &self.pending_count())
            .finish()
    }
}
