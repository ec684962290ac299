//! 設定 - DispatchConfig
//!
//! 読み込みの優先順位（後勝ち）:
//! 1. 既定値
//! 2. `SETTINGS_MODULE` が指すファイル（yaml / json / toml）
//! 3. `DISPATCH__` で始まる環境変数。`__` が階層の区切り（`DISPATCH__QUEUE__POLL_TIME=5`）
//!
//! ```yaml
//! queue:
//!   endpoint: "http://localhost:4566"
//!   poll_time: 20.0
//! tasks:
//!   - galileo.app.app1.tasks
//! routes:
//!   galileo.app.app1.tasks: all_app1_tasks_queue
//!   galileo.app.app2.tasks::other_task: other_task_queue
//! ```
//!
//! 読み込み後に `validate()` で必須項目を検査する。

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::domain::DispatchError;

pub const ENV_PREFIX: &str = "DISPATCH";
pub const ENV_SEPARATOR: &str = "__";
pub const SETTINGS_MODULE_VAR: &str = "SETTINGS_MODULE";

/// SQS の1回の受信上限
pub const MAX_BATCH_SIZE: usize = 10;

fn default_connect_timeout() -> f64 {
    2.0
}

fn default_poll_time() -> f64 {
    20.0
}

fn default_batch_size() -> usize {
    5
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_work_queue_capacity() -> usize {
    100
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: f64,
    /// Long-poll wait per receive call, seconds.
    #[serde(default = "default_poll_time")]
    pub poll_time: f64,
    #[serde(default)]
    pub visibility_timeout: Option<f64>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            connect_timeout: default_connect_timeout(),
            poll_time: default_poll_time(),
            visibility_timeout: None,
            batch_size: default_batch_size(),
        }
    }
}

impl QueueConfig {
    pub fn connect_timeout(&self) -> Duration {
        seconds(self.connect_timeout)
    }

    pub fn poll_time(&self) -> Duration {
        seconds(self.poll_time)
    }

    pub fn visibility_timeout(&self) -> Option<Duration> {
        self.visibility_timeout.map(seconds)
    }

    /// 1..=10 に丸める
    pub fn batch_size(&self) -> usize {
        self.batch_size.clamp(1, MAX_BATCH_SIZE)
    }
}

/// handler が `TaskError::Failed` を返したときの source message の扱い
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerErrorPolicy {
    /// failure response を返して削除する
    #[default]
    Delete,
    /// 削除せず visibility timeout 後に再配送させる
    Redeliver,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_work_queue_capacity")]
    pub work_queue_capacity: usize,
    #[serde(default)]
    pub handler_error: HandlerErrorPolicy,
    /// Per-invocation limit, seconds. Off unless set.
    #[serde(default)]
    pub task_timeout: Option<f64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            work_queue_capacity: default_work_queue_capacity(),
            handler_error: HandlerErrorPolicy::default(),
            task_timeout: None,
        }
    }
}

impl WorkerConfig {
    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout.map(seconds)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    /// Task modules to load at startup.
    #[serde(default)]
    pub tasks: Vec<String>,
    /// match key → queue
    #[serde(default)]
    pub routes: BTreeMap<String, String>,
    #[serde(default)]
    pub default_route: Option<String>,
    /// 利用する DB 名。task module にそのまま渡すだけで、接続は扱わない
    #[serde(default)]
    pub dbs: Vec<String>,
    #[serde(default)]
    pub synchronous: bool,
    #[serde(default)]
    pub worker: WorkerConfig,
}

impl DispatchConfig {
    /// `SETTINGS_MODULE` と `DISPATCH__*` 環境変数から読み込んで検証する
    pub fn load() -> Result<Self, DispatchError> {
        let settings = std::env::var(SETTINGS_MODULE_VAR).ok();
        Self::load_from(settings.as_deref().map(Path::new), default_environment())
    }

    /// ファイルと環境変数ソースを指定して読み込む（テストでは `Environment::source` を使う）
    pub fn load_from(
        settings: Option<&Path>,
        environment: Environment,
    ) -> Result<Self, DispatchError> {
        let mut builder = Config::builder();
        if let Some(path) = settings {
            builder = builder.add_source(File::from(path).required(true));
        }
        let cfg: DispatchConfig = builder
            .add_source(environment)
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| DispatchError::Configuration(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json_str(json: &str) -> Result<Self, DispatchError> {
        let cfg: DispatchConfig = Config::builder()
            .add_source(File::from_str(json, FileFormat::Json))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| DispatchError::Configuration(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// 必須項目をまとめて検査する。欠けているものは全部列挙する
    pub fn validate(&self) -> Result<(), DispatchError> {
        let mut missing = Vec::new();
        if self.queue.endpoint.as_deref().is_none_or(|e| e.trim().is_empty()) {
            missing.push("queue.endpoint");
        }
        if self.tasks.is_empty() {
            missing.push("tasks");
        }
        if self.routes.is_empty() {
            missing.push("routes");
        }
        if !missing.is_empty() {
            return Err(DispatchError::Configuration(format!(
                "Required field(s) missing: {}",
                missing.join(", ")
            )));
        }

        let durations = [
            ("queue.connect_timeout", Some(self.queue.connect_timeout)),
            ("queue.poll_time", Some(self.queue.poll_time)),
            ("queue.visibility_timeout", self.queue.visibility_timeout),
            ("worker.task_timeout", self.worker.task_timeout),
        ];
        for (field, value) in durations {
            if let Some(v) = value
                && !(v.is_finite() && v >= 0.0)
            {
                return Err(DispatchError::Configuration(format!(
                    "{field} must be a non-negative number of seconds, got {v}"
                )));
            }
        }
        if self.worker.workers == 0 {
            return Err(DispatchError::Configuration(
                "worker.workers must be at least 1".to_string(),
            ));
        }
        if self.worker.work_queue_capacity == 0 {
            return Err(DispatchError::Configuration(
                "worker.work_queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// `DISPATCH__QUEUE__POLL_TIME=5`, `DISPATCH__TASKS=a.tasks,b.tasks`
pub fn default_environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_SEPARATOR)
        .separator(ENV_SEPARATOR)
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("tasks")
        .with_list_parse_key("dbs")
}
