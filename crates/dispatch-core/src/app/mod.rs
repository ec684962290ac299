//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: 設定・task module・ルーティングの構築とワイヤリング
//! - **Publisher**: task 呼び出しをリクエストにしてキューへ送る
//! - **AsyncResult**: reply queue から結果を待つ
//! - **Fetcher**: キュー1本を受信して work queue に積む
//! - **Consumer**: リクエスト1件を実行して応答する
//! - **WorkerPool / WorkerRunner**: fetcher と worker 群の起動・停止

pub mod async_result;
pub mod builder;
pub mod consumer;
pub mod fetcher;
pub mod publisher;
pub(crate) mod reply_queue;
pub mod runner;
pub mod worker_pool;

// 主要な型を再エクスポート
pub use self::async_result::{AsyncResult, ResultState};
pub use self::builder::{App, AppBuilder};
pub use self::consumer::{Consumer, WorkItem};
pub use self::fetcher::{Fetcher, FetcherHandle, FetcherOptions, FetcherState};
pub use self::publisher::{AsyncInvocation, Publisher, PublisherOptions};
pub use self::runner::{RunnerOptions, WorkerRunner};
pub use self::worker_pool::WorkerPool;
