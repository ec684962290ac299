//! Ports - 抽象化レイヤー
//!
//! 外部協調者（キューサービス）と、テストで差し替えたい副作用（時刻、ID 生成）の
//! インターフェースを定義します。

pub mod clock;
pub mod id_generator;
pub mod queue_service;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::queue_service::{MessageAttributes, QueueService, ReceiveOptions, ReceivedMessage};
