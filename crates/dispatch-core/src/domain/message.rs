//! Wire messages: RequestMessage / ResponseMessage.
//!
//! Request の形:
//! ```json
//! {
//!   "id": "01HZX...",
//!   "metadata": { "timestamp": 1589084716206902000, "version": "1.0" },
//!   "headers": { "request_id": "1234" },
//!   "task": "tests.tasks.test_tasks.cube",
//!   "args": [3],
//!   "kwargs": {},
//!   "expiration": null,
//!   "reply_to": "cube-1a2b3c4d"
//! }
//! ```
//!
//! Response の形:
//! ```json
//! {
//!   "id": "01HZY...",
//!   "metadata": { "timestamp": 1589081345789123450, "version": "1.0" },
//!   "original": { "id": "01HZX...", "task": "tests.tasks.test_tasks.cube" },
//!   "status": "success",
//!   "result": 27
//! }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::errors::DispatchError;
use super::ids::{MessageId, ResponseId};
use super::task_name::TaskName;

pub const CURRENT_VERSION: &str = "1.0";
pub const SUPPORTED_VERSIONS: &[&str] = &["1.0"];

pub type Args = Vec<Value>;
pub type Kwargs = Map<String, Value>;
pub type Headers = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Nanoseconds since the Unix epoch.
    pub timestamp: i64,
    pub version: String,
}

impl Metadata {
    pub fn new(timestamp: i64) -> Self {
        Self {
            timestamp,
            version: CURRENT_VERSION.to_string(),
        }
    }
}

/// A task invocation as it travels through the queue service.
///
/// All fields are immutable once built; the publisher creates one per dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub id: MessageId,
    pub metadata: Metadata,
    #[serde(default)]
    pub headers: Headers,
    #[serde(rename = "task")]
    pub task_name: TaskName,
    #[serde(default)]
    pub args: Args,
    #[serde(default)]
    pub kwargs: Kwargs,
    /// Lifetime in nanoseconds counted from `metadata.timestamp`.
    #[serde(default)]
    pub expiration: Option<i64>,
    #[serde(default)]
    pub reply_to: Option<String>,
}

impl RequestMessage {
    pub fn new(id: MessageId, timestamp: i64, task_name: TaskName, args: Args, kwargs: Kwargs) -> Self {
        Self {
            id,
            metadata: Metadata::new(timestamp),
            headers: Headers::new(),
            task_name,
            args,
            kwargs,
            expiration: None,
            reply_to: None,
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_expiration(mut self, expiration_ns: i64) -> Self {
        self.expiration = Some(expiration_ns);
        self
    }

    /// Check version and expiration against `now` (ns since epoch).
    pub fn validate(&self, now: i64) -> Result<(), DispatchError> {
        if !SUPPORTED_VERSIONS.contains(&self.metadata.version.as_str()) {
            return Err(DispatchError::Validation(format!(
                "unsupported version: {}",
                self.metadata.version
            )));
        }
        if let Some(expiration) = self.expiration
            && expiration > 0
            && now > self.metadata.timestamp.saturating_add(expiration)
        {
            return Err(DispatchError::Validation(format!(
                "expired message: timestamp={} expiration={expiration}",
                self.metadata.timestamp
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Failure,
}

/// Error detail carried by a failure response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Error type tag, e.g. `UnknownTaskError`.
    pub kind: String,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<&DispatchError> for ErrorDetail {
    fn from(err: &DispatchError) -> Self {
        Self::new(err.type_name(), err.to_string())
    }
}

impl From<ErrorDetail> for DispatchError {
    fn from(detail: ErrorDetail) -> Self {
        DispatchError::TaskFailed {
            kind: detail.kind,
            message: detail.message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ResponseBody {
    Success { result: Value },
    Failure { error: ErrorDetail },
}

/// Reference back to the request a response answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginalRef {
    pub id: MessageId,
    pub task: TaskName,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub id: ResponseId,
    pub metadata: Metadata,
    pub original: OriginalRef,
    #[serde(flatten)]
    pub body: ResponseBody,
}

impl ResponseMessage {
    pub fn success(id: ResponseId, timestamp: i64, request: &RequestMessage, result: Value) -> Self {
        Self::new(id, timestamp, request, ResponseBody::Success { result })
    }

    pub fn failure(id: ResponseId, timestamp: i64, request: &RequestMessage, error: ErrorDetail) -> Self {
        Self::new(id, timestamp, request, ResponseBody::Failure { error })
    }

    fn new(id: ResponseId, timestamp: i64, request: &RequestMessage, body: ResponseBody) -> Self {
        Self {
            id,
            metadata: Metadata::new(timestamp),
            original: OriginalRef {
                id: request.id,
                task: request.task_name.clone(),
            },
            body,
        }
    }

    /// Correlation key: the id of the request this answers.
    pub fn correlation_id(&self) -> MessageId {
        self.original.id
    }

    pub fn status(&self) -> ResponseStatus {
        match self.body {
            ResponseBody::Success { .. } => ResponseStatus::Success,
            ResponseBody::Failure { .. } => ResponseStatus::Failure,
        }
    }

    /// 成功なら result、失敗なら `DispatchError::TaskFailed`
    pub fn into_result(self) -> Result<Value, DispatchError> {
        match self.body {
            ResponseBody::Success { result } => Ok(result),
            ResponseBody::Failure { error } => Err(error.into()),
        }
    }
}
