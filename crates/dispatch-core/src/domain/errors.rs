//! Errors - エラー型と分類
//!
//! - `DispatchError`: publish / consume / 結果待ちで発生するエラー
//! - `ErrorKind`: 運用上の分類（worker が再配送するかどうかの判断に使う）
//! - `TaskError`: task handler が返すエラー

use std::time::Duration;

use thiserror::Error;

/// ErrorKind は実行エラーの分類
///
/// - Transient: 一時的なエラー（再配送で回復しうる）
/// - Permanent: 恒久的なエラー（再配送しても無意味）
/// - Infrastructure: キューサービスなど外部協調者の障害
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

/// DispatchError はこのクレートの公開エラー
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no route for task '{task}'")]
    Routing { task: String },

    #[error("task named '{0}' is already registered")]
    DuplicateTask(String),

    #[error("unknown task '{0}'")]
    UnknownTask(String),

    #[error("failed to publish to queue '{queue}': {message}")]
    Publish { queue: String, message: String },

    #[error("queue service call '{operation}' failed for '{queue}': {message}")]
    Transport {
        queue: String,
        operation: &'static str,
        message: String,
    },

    #[error("queue does not exist: {0}")]
    QueueNotFound(String),

    #[error("no result for message {message_id} within {timeout:?}")]
    ResultTimeout {
        message_id: String,
        timeout: Duration,
    },

    /// Failure reported by the remote worker through a ResponseMessage.
    #[error("task failed remotely ({kind}): {message}")]
    TaskFailed { kind: String, message: String },

    #[error("invalid message: {0}")]
    Validation(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::Publish { .. }
            | DispatchError::Transport { .. }
            | DispatchError::QueueNotFound(_) => ErrorKind::Infrastructure,
            DispatchError::ResultTimeout { .. } => ErrorKind::Transient,
            DispatchError::Routing { .. }
            | DispatchError::DuplicateTask(_)
            | DispatchError::UnknownTask(_)
            | DispatchError::TaskFailed { .. }
            | DispatchError::Validation(_)
            | DispatchError::Codec(_)
            | DispatchError::Configuration(_) => ErrorKind::Permanent,
        }
    }

    /// Short type tag written into failure responses (`error.kind`).
    pub fn type_name(&self) -> &'static str {
        match self {
            DispatchError::Routing { .. } => "RoutingError",
            DispatchError::DuplicateTask(_) => "DuplicateTaskError",
            DispatchError::UnknownTask(_) => "UnknownTaskError",
            DispatchError::Publish { .. } => "PublishError",
            DispatchError::Transport { .. } => "TransportError",
            DispatchError::QueueNotFound(_) => "QueueNotFound",
            DispatchError::ResultTimeout { .. } => "ResultTimeoutError",
            DispatchError::TaskFailed { .. } => "TaskFailed",
            DispatchError::Validation(_) => "ValidationError",
            DispatchError::Codec(_) => "CodecError",
            DispatchError::Configuration(_) => "ConfigurationError",
        }
    }

    /// `TaskFailed` かつ `kind` が一致するか
    pub fn is_remote(&self, expected_kind: &str) -> bool {
        matches!(self, DispatchError::TaskFailed { kind, .. } if kind == expected_kind)
    }
}

/// TaskError は handler の実行結果としてのエラー
///
/// - `Failed`: 通常の失敗。failure response を返し、source message は policy に従う
/// - `Retry`: source message を削除せず visibility timeout 経由で再配送させる
/// - `Ignore`: 何も返さずに ack する
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),

    #[error("retry requested: {0}")]
    Retry(String),

    #[error("ignored")]
    Ignore,

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("handler exceeded {0:?}")]
    TimedOut(Duration),
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        TaskError::Failed(message.into())
    }

    pub fn retry(message: impl Into<String>) -> Self {
        TaskError::Retry(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::Retry(_) | TaskError::TimedOut(_) => ErrorKind::Transient,
            TaskError::Failed(_)
            | TaskError::Ignore
            | TaskError::InvalidArguments(_)
            | TaskError::Panicked(_) => ErrorKind::Permanent,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            TaskError::Failed(_) => "TaskError",
            TaskError::Retry(_) => "RetryError",
            TaskError::Ignore => "Ignored",
            TaskError::InvalidArguments(_) => "InvalidArguments",
            TaskError::Panicked(_) => "Panicked",
            TaskError::TimedOut(_) => "TaskTimeout",
        }
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(e: serde_json::Error) -> Self {
        TaskError::InvalidArguments(e.to_string())
    }
}
