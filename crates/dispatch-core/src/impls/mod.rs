//! Impls - ports の実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryQueueService**: visibility timeout 付きの in-process キューサービス
//!
//! SQS などの本番用クライアントは別クレートで `QueueService` を実装します。

pub mod memory_queue;

pub use self::memory_queue::{InMemoryQueueService, QueueDepth};
