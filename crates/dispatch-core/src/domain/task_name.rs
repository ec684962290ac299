//! TaskName - task の正規名
//!
//! # 命名規約
//! - `{module path}.{function}`（例: `tests.tasks.test_tasks.cube`）
//! - module を持たない単独名（例: `ghost_task`）も許す
//! - route key の `module::function` 表記は正規名では使わない（`.` で書く）

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

use super::errors::DispatchError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskName(String);

impl TaskName {
    pub fn new(name: impl Into<String>) -> Result<Self, DispatchError> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    /// Canonical name for `function` defined in `module`.
    pub fn qualified(module: &str, function: &str) -> Result<Self, DispatchError> {
        if module.is_empty() {
            return Self::new(function);
        }
        Self::new(format!("{module}.{function}"))
    }

    fn validate(name: &str) -> Result<(), DispatchError> {
        if name.is_empty() {
            return Err(DispatchError::Validation("task name is empty".to_string()));
        }
        if name.contains("::") {
            return Err(DispatchError::Validation(format!(
                "task name '{name}' uses route syntax; write it as module.function"
            )));
        }
        if name.starts_with('.') || name.ends_with('.') || name.contains("..") {
            return Err(DispatchError::Validation(format!(
                "task name '{name}' has an empty path segment"
            )));
        }
        if name.chars().any(char::is_whitespace) {
            return Err(DispatchError::Validation(format!(
                "task name '{name}' contains whitespace"
            )));
        }
        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Module path (`None` for a bare name).
    pub fn module(&self) -> Option<&str> {
        self.0.rsplit_once('.').map(|(module, _)| module)
    }

    /// Last path segment.
    pub fn function(&self) -> &str {
        self.0.rsplit_once('.').map_or(&self.0, |(_, f)| f)
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// registry を `&str` で引けるように
impl Borrow<str> for TaskName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TaskName {
    type Error = DispatchError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for TaskName {
    type Error = DispatchError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TaskName> for String {
    fn from(value: TaskName) -> Self {
        value.0
    }
}

impl AsRef<str> for TaskName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_module_and_function() {
        let name = TaskName::new("tests.tasks.test_tasks.cube").unwrap();
        assert_eq!(name.module(), Some("tests.tasks.test_tasks"));
        assert_eq!(name.function(), "cube");

        let bare = TaskName::new("ghost_task").unwrap();
        assert_eq!(bare.module(), None);
        assert_eq!(bare.function(), "ghost_task");
    }

    #[test]
    fn qualified_joins_with_dot() {
        let name = TaskName::qualified("app.tasks", "send_email").unwrap();
        assert_eq!(name.as_str(), "app.tasks.send_email");
        assert_eq!(TaskName::qualified("", "solo").unwrap().as_str(), "solo");
    }

    #[test]
    fn rejects_malformed_names() {
        assert!(TaskName::new("").is_err());
        assert!(TaskName::new("app.tasks::cube").is_err());
        assert!(TaskName::new("app..cube").is_err());
        assert!(TaskName::new(".cube").is_err());
        assert!(TaskName::new("app cube").is_err());
    }

    #[test]
    fn deserialization_validates() {
        let ok: TaskName = serde_json::from_str("\"a.b\"").unwrap();
        assert_eq!(ok.as_str(), "a.b");
        assert!(serde_json::from_str::<TaskName>("\"a::b\"").is_err());
    }
}
