//! Handler trait - Task を実行する Handler の定義
//!
//! # 学習ポイント
//! - ジェネリック trait (Handler<T>)
//! - Object-safe trait (DynHandler)
//! - Type erasure パターン (TypedHandler<T, H> → DynHandler)

use std::marker::PhantomData;

use async_trait::async_trait;
use serde_json::Value;

use super::task::Task;
use crate::domain::{Invocation, TaskError};

/// Handler は Task を実行して `T::Output` を返す
///
/// # 使用例
/// ```ignore
/// struct CubeHandler;
///
/// #[async_trait]
/// impl Handler<Cube> for CubeHandler {
///     async fn handle(&self, (x,): (i64,), _inv: &Invocation) -> Result<i64, TaskError> {
///         Ok(x * x * x)
///     }
/// }
/// ```
///
/// 同じメッセージが2回以上届くことがある（at-least-once）ので、handler は
/// 再実行されても壊れないように書くこと。
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, args: T::Args, invocation: &Invocation) -> Result<T::Output, TaskError>;
}

/// DynHandler は object-safe な Handler の抽象化
///
/// registry は `HashMap<TaskName, Arc<dyn DynHandler>>` として保持する。
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn call(&self, invocation: Invocation) -> Result<Value, TaskError>;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn call(&self, invocation: Invocation) -> Result<Value, TaskError> {
        let args: T::Args = invocation.decode()?;
        let output = self.handler.handle(args, &invocation).await?;
        serde_json::to_value(output).map_err(|e| TaskError::failed(format!("result encode: {e}")))
    }
}

/// 型を持たない task 用: `Invocation` を直接受け取る関数
///
/// ```ignore
/// registry.register_fn("app.tasks.echo", true, FnHandler::new(|inv| Ok(inv.args[0].clone())))?;
/// ```
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&Invocation) -> Result<Value, TaskError> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> DynHandler for FnHandler<F>
where
    F: Fn(&Invocation) -> Result<Value, TaskError> + Send + Sync + 'static,
{
    async fn call(&self, invocation: Invocation) -> Result<Value, TaskError> {
        (self.f)(&invocation)
    }
}
