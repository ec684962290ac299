//! Typed - 型付き Task API
//!
//! task 名の typo を型で排除し、引数/戻り値の型と handler の対応付けを
//! 静的に保証します。
//!
//! # 二層構造
//! - **表層（Typed）**: `Task` trait, `Handler<T>` trait - 型安全
//! - **内部（Dyn）**: `DynHandler` trait - object-safe, type erasure
//!
//! registry は内部層だけを見るので、型を持たない関数 (`FnHandler`) も同じ表に並ぶ。

pub mod codec;
pub mod handler;
pub mod registry;
pub mod task;

pub use self::codec::PayloadCodec;
pub use self::handler::{DynHandler, FnHandler, Handler, TypedHandler};
pub use self::registry::{RegisteredTask, RegistryBuilder, TaskModule, TaskRegistry};
pub use self::task::Task;
