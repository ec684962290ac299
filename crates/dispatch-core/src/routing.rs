//! Router - task 名から送信先キューを決める
//!
//! route key は2種類:
//! - module key: `galileo.app.app1.tasks`（その module 以下の全 task）
//! - function key: `galileo.app.app2.tasks::other_task`（その関数だけ）
//!
//! 解決は「最長一致」。同じ長さなら function key が勝つ。
//! 結果はテーブルの挿入順に依存しない。I/O はしない。

use std::cmp::Reverse;
use std::collections::BTreeSet;

use crate::domain::{DispatchError, TaskName};

const FUNCTION_SEPARATOR: &str = "::";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RouteKey {
    Module(String),
    Function { module: String, function: String },
}

impl RouteKey {
    pub fn parse(raw: &str) -> Result<Self, DispatchError> {
        let invalid = |reason: &str| DispatchError::Configuration(format!("invalid route key '{raw}': {reason}"));

        let raw = raw.trim();
        if raw.is_empty() {
            return Err(invalid("empty"));
        }
        match raw.split_once(FUNCTION_SEPARATOR) {
            None => Ok(RouteKey::Module(raw.to_string())),
            Some((module, function)) => {
                if module.is_empty() || function.is_empty() {
                    return Err(invalid("module and function must both be present"));
                }
                if function.contains(FUNCTION_SEPARATOR) || function.contains('.') {
                    return Err(invalid("function part must be a single name"));
                }
                Ok(RouteKey::Function {
                    module: module.to_string(),
                    function: function.to_string(),
                })
            }
        }
    }

    /// Dotted path this key stands for (`module.function` for function keys).
    pub fn path(&self) -> String {
        match self {
            RouteKey::Module(module) => module.clone(),
            RouteKey::Function { module, function } => format!("{module}.{function}"),
        }
    }

    pub fn is_function(&self) -> bool {
        matches!(self, RouteKey::Function { .. })
    }

    pub fn matches(&self, task: &str) -> bool {
        match self {
            RouteKey::Module(module) => {
                task == module
                    || (task.len() > module.len()
                        && task.starts_with(module.as_str())
                        && task.as_bytes()[module.len()] == b'.')
            }
            RouteKey::Function { .. } => task == self.path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub key: RouteKey,
    pub queue: String,
}

impl RouteEntry {
    fn specificity(&self) -> (usize, bool) {
        (self.key.path().len(), self.key.is_function())
    }
}

/// Static routing table.
#[derive(Debug, Clone)]
pub struct Router {
    /// Most specific first.
    entries: Vec<RouteEntry>,
    default_queue: Option<String>,
}

impl Router {
    pub fn new<I, K, Q>(routes: I, default_queue: Option<String>) -> Result<Self, DispatchError>
    where
        I: IntoIterator<Item = (K, Q)>,
        K: AsRef<str>,
        Q: Into<String>,
    {
        let mut entries = Vec::new();
        for (key, queue) in routes {
            let queue = queue.into();
            if queue.trim().is_empty() {
                return Err(DispatchError::Configuration(format!(
                    "route '{}' has an empty queue name",
                    key.as_ref()
                )));
            }
            entries.push(RouteEntry {
                key: RouteKey::parse(key.as_ref())?,
                queue,
            });
        }
        // 長い順、同じ長さなら function key が先。最後に key 自体で安定化
        entries.sort_by(|a, b| {
            Reverse(a.specificity())
                .cmp(&Reverse(b.specificity()))
                .then_with(|| a.key.cmp(&b.key))
        });
        Ok(Self {
            entries,
            default_queue,
        })
    }

    pub fn resolve(&self, task: &TaskName) -> Result<&str, DispatchError> {
        self.resolve_str(task.as_str())
    }

    pub fn resolve_str(&self, task: &str) -> Result<&str, DispatchError> {
        self.entries
            .iter()
            .find(|entry| entry.key.matches(task))
            .map(|entry| entry.queue.as_str())
            .or(self.default_queue.as_deref())
            .ok_or_else(|| DispatchError::Routing {
                task: task.to_string(),
            })
    }

    /// Every distinct destination queue, default included.
    pub fn queues(&self) -> BTreeSet<String> {
        self.entries
            .iter()
            .map(|e| e.queue.clone())
            .chain(self.default_queue.clone())
            .collect()
    }

    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }

    pub fn default_queue(&self) -> Option<&str> {
        self.default_queue.as_deref()
    }
}
