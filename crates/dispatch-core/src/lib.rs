//! dispatch-core
//!
//! Core building blocks for distributed task dispatch over a message queue service.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task_name, message, invocation, errors）
//! - **ports**: 抽象化レイヤー（QueueService, Clock, IdGenerator）
//! - **routing**: task 名 → 送信先キューの解決
//! - **typed**: 型付き Task API（Task trait, Handler trait, TaskRegistry, PayloadCodec）
//! - **app**: アプリケーションロジック（builder, publisher, async_result, fetcher, consumer, runner）
//! - **config**: 設定ファイル + 環境変数の読み込みと検証
//! - **observability**: tracing の初期化と worker の統計
//! - **impls**: 実装（InMemoryQueueService など開発用）

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod routing;
pub mod typed;
