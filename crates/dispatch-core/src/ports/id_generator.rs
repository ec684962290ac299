//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（本番用）

use crate::domain::ids::{MessageId, ResponseId};
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator は分散環境で衝突しない ID を生成
///
/// publisher と worker が別プロセスでも調整なしに生成できること。
pub trait IdGenerator: Send + Sync {
    fn message_id(&self) -> MessageId;

    fn response_id(&self) -> ResponseId;
}

/// UlidGenerator は Clock の時刻 + 乱数で ULID を生成
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn message_id(&self) -> MessageId {
        MessageId::from(self.next())
    }

    fn response_id(&self) -> ResponseId {
        ResponseId::from(self.next())
    }
}
