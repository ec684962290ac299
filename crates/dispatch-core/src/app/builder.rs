//! AppBuilder - 設定からアプリケーションを組み立てる
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 開発体験の改善（明確なエラーメッセージ）

use std::sync::Arc;

use crate::config::DispatchConfig;
use crate::domain::DispatchError;
use crate::ports::{Clock, IdGenerator, QueueService, SystemClock, UlidGenerator};
use crate::routing::Router;
use crate::typed::{Handler, RegistryBuilder, Task, TaskModule, TaskRegistry};

use super::consumer::Consumer;
use super::fetcher::FetcherOptions;
use super::publisher::{Publisher, PublisherOptions};
use super::runner::{RunnerOptions, WorkerRunner};

/// AppBuilder はアプリケーションを構築
///
/// # 使用例
/// ```ignore
/// let app = AppBuilder::new(config, Arc::new(InMemoryQueueService::new()))
///     .module(MathTasks)
///     .build()?;
/// let publisher = app.publisher();
/// let runner = app.start_worker(app.worker_options()).await?;
/// ```
///
/// # Fail-fast 設計
/// build() の時点で次を検査し、1つでも駄目なら起動しない
/// - 設定の必須項目
/// - route key の形式
/// - `config.tasks` に挙がった module が全部 `module()` で渡されているか
/// - 登録された全 task に送信先キューがあるか
pub struct AppBuilder {
    config: DispatchConfig,
    service: Arc<dyn QueueService>,
    modules: Vec<Arc<dyn TaskModule>>,
    registry: RegistryBuilder,
    clock: Arc<dyn Clock>,
    ids: Option<Arc<dyn IdGenerator>>,
}

impl AppBuilder {
    pub fn new(config: DispatchConfig, service: Arc<dyn QueueService>) -> Self {
        Self {
            config,
            service,
            modules: Vec::new(),
            registry: RegistryBuilder::new(),
            clock: Arc::new(SystemClock),
            ids: None,
        }
    }

    /// 読み込み可能な task module を追加する。実際に読むのは `config.tasks` に挙がったものだけ
    pub fn module(mut self, module: impl TaskModule + 'static) -> Self {
        self.modules.push(Arc::new(module));
        self
    }

    /// module を経由せずに直接登録する
    pub fn register<T: Task, H: Handler<T> + 'static>(mut self, handler: H) -> Result<Self, DispatchError> {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn build(mut self) -> Result<App, DispatchError> {
        self.config.validate()?;
        let router = Router::new(&self.config.routes, self.config.default_route.clone())?;
        self.registry.load_modules(&self.config.tasks, &self.modules)?;
        let registry = self.registry.build(&router)?;

        let ids = match self.ids {
            Some(ids) => ids,
            None => Arc::new(UlidGenerator::new(Arc::clone(&self.clock))),
        };
        tracing::info!(
            tasks = registry.len(),
            routes = router.entries().len(),
            synchronous = self.config.synchronous,
            "app built"
        );
        Ok(App {
            config: self.config,
            service: self.service,
            router: Arc::new(router),
            registry: Arc::new(registry),
            clock: self.clock,
            ids,
        })
    }
}

/// App は起動済みの設定・ルーティング・registry を束ねる
///
/// publisher と worker はここから作る。どちらも同じ registry を共有する。
pub struct App {
    config: DispatchConfig,
    service: Arc<dyn QueueService>,
    router: Arc<Router>,
    registry: Arc<TaskRegistry>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl App {
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn publisher(&self) -> Publisher {
        Publisher::new(Arc::clone(&self.service), Arc::clone(&self.router))
            .with_registry(Arc::clone(&self.registry))
            .with_clock(Arc::clone(&self.clock))
            .with_id_generator(Arc::clone(&self.ids))
            .with_options(PublisherOptions {
                poll_time: self.config.queue.poll_time(),
                synchronous: self.config.synchronous,
            })
    }

    pub fn consumer(&self) -> Consumer {
        Consumer::new(
            Arc::clone(&self.service),
            Arc::clone(&self.registry),
            Arc::clone(&self.ids),
            Arc::clone(&self.clock),
        )
        .with_handler_error(self.config.worker.handler_error)
        .with_task_timeout(self.config.worker.task_timeout())
    }

    /// 設定から作った worker のデフォルト
    pub fn worker_options(&self) -> RunnerOptions {
        RunnerOptions {
            workers: self.config.worker.workers,
            work_queue_capacity: self.config.worker.work_queue_capacity,
            fetcher: FetcherOptions {
                batch_size: self.config.queue.batch_size(),
                wait_time: self.config.queue.poll_time(),
                visibility_timeout: self.config.queue.visibility_timeout(),
                loop_count: None,
            },
        }
    }

    /// routing table の全キュー（default 含む）に fetcher を立てて worker を起動する
    pub async fn start_worker(&self, options: RunnerOptions) -> Result<WorkerRunner, DispatchError> {
        WorkerRunner::start(
            Arc::clone(&self.service),
            self.router.queues(),
            self.consumer(),
            options,
        )
        .await
    }
}
