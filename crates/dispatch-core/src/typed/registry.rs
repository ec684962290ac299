//! TaskRegistry - task の登録と検索
//!
//! # ライフサイクル
//! 1. 起動時: `RegistryBuilder` に各 task module が自分の task を登録する（可変）
//! 2. `build(&router)` で全 task の送信先キューを解決し、凍結する
//! 3. 実行時: `TaskRegistry` は読み取り専用。`Arc` で publisher / worker に共有する
//!
//! グローバルな可変状態は持たない。

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use super::handler::{DynHandler, FnHandler, Handler, TypedHandler};
use super::task::Task;
use crate::domain::{DispatchError, Invocation, TaskError, TaskName};
use crate::routing::Router;

/// 登録済みの task。登録後は不変
#[derive(Clone)]
pub struct RegisteredTask {
    name: TaskName,
    handler: Arc<dyn DynHandler>,
    returns_result: bool,
    queue: String,
}

impl RegisteredTask {
    pub fn name(&self) -> &TaskName {
        &self.name
    }

    pub fn handler(&self) -> Arc<dyn DynHandler> {
        Arc::clone(&self.handler)
    }

    pub fn returns_result(&self) -> bool {
        self.returns_result
    }

    /// Destination queue resolved at startup.
    pub fn queue(&self) -> &str {
        &self.queue
    }
}

impl std::fmt::Debug for RegisteredTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTask")
            .field("name", &self.name)
            .field("returns_result", &self.returns_result)
            .field("queue", &self.queue)
            .finish()
    }
}

struct PendingTask {
    handler: Arc<dyn DynHandler>,
    returns_result: bool,
}

/// 設定の `tasks` に列挙される単位。起動時に自分の task を登録する
///
/// ```ignore
/// struct MathTasks;
///
/// impl TaskModule for MathTasks {
///     fn name(&self) -> &str { "tests.tasks.test_tasks" }
///     fn register(&self, registry: &mut RegistryBuilder) -> Result<(), DispatchError> {
///         registry.register::<Cube, _>(CubeHandler)?;
///         Ok(())
///     }
/// }
/// ```
pub trait TaskModule: Send + Sync {
    fn name(&self) -> &str;

    fn register(&self, registry: &mut RegistryBuilder) -> Result<(), DispatchError>;
}

#[derive(Default)]
pub struct RegistryBuilder {
    tasks: HashMap<TaskName, PendingTask>,
}

impl std::fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.tasks.keys().map(TaskName::as_str).collect();
        names.sort_unstable();
        f.debug_struct("RegistryBuilder").field("tasks", &names).finish()
    }
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Task, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<&mut Self, DispatchError> {
        let name = TaskName::new(T::NAME)?;
        self.insert(name, Arc::new(TypedHandler::<T, H>::new(handler)), T::RETURNS_RESULT)
    }

    pub fn register_fn<F>(
        &mut self,
        name: &str,
        returns_result: bool,
        f: F,
    ) -> Result<&mut Self, DispatchError>
    where
        F: Fn(&Invocation) -> Result<Value, TaskError> + Send + Sync + 'static,
    {
        let name = TaskName::new(name)?;
        self.insert(name, Arc::new(FnHandler::new(f)), returns_result)
    }

    pub fn register_dyn(
        &mut self,
        name: TaskName,
        handler: Arc<dyn DynHandler>,
        returns_result: bool,
    ) -> Result<&mut Self, DispatchError> {
        self.insert(name, handler, returns_result)
    }

    fn insert(
        &mut self,
        name: TaskName,
        handler: Arc<dyn DynHandler>,
        returns_result: bool,
    ) -> Result<&mut Self, DispatchError> {
        if self.tasks.contains_key(&name) {
            return Err(DispatchError::DuplicateTask(name.into()));
        }
        debug!(task = %name, "register task");
        self.tasks.insert(
            name,
            PendingTask {
                handler,
                returns_result,
            },
        );
        Ok(self)
    }

    /// `names` に挙がった module を順に登録する。知らない module 名は設定エラー
    pub fn load_modules(
        &mut self,
        names: &[String],
        available: &[Arc<dyn TaskModule>],
    ) -> Result<&mut Self, DispatchError> {
        for name in names {
            let module = available
                .iter()
                .find(|m| m.name() == name)
                .ok_or_else(|| {
                    DispatchError::Configuration(format!("task module '{name}' is not available"))
                })?;
            debug!(module = %name, "load task module");
            module.register(self)?;
        }
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// 全 task の送信先キューを解決して凍結する。1つでも解決できなければ失敗
    pub fn build(self, router: &Router) -> Result<TaskRegistry, DispatchError> {
        let mut tasks = HashMap::with_capacity(self.tasks.len());
        let mut unrouted = Vec::new();
        for (name, pending) in self.tasks {
            match router.resolve(&name) {
                Ok(queue) => {
                    let queue = queue.to_string();
                    tasks.insert(
                        name.clone(),
                        RegisteredTask {
                            name,
                            handler: pending.handler,
                            returns_result: pending.returns_result,
                            queue,
                        },
                    );
                }
                Err(_) => unrouted.push(name.to_string()),
            }
        }
        if !unrouted.is_empty() {
            unrouted.sort();
            return Err(DispatchError::Routing {
                task: unrouted.join(", "),
            });
        }
        Ok(TaskRegistry { tasks })
    }
}

/// Immutable lookup table: task name → registered task.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<TaskName, RegisteredTask>,
}

impl TaskRegistry {
    pub fn lookup(&self, name: &str) -> Result<&RegisteredTask, DispatchError> {
        self.tasks
            .get(name)
            .ok_or_else(|| DispatchError::UnknownTask(name.to_string()))
    }

    pub fn get(&self, name: &TaskName) -> Option<&RegisteredTask> {
        self.tasks.get(name)
    }

    pub fn names(&self) -> Vec<&TaskName> {
        let mut names: Vec<_> = self.tasks.keys().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
