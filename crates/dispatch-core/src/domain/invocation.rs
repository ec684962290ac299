//! Invocation - handler に渡す実行コンテキスト

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::errors::TaskError;
use super::ids::MessageId;
use super::message::{Args, Headers, Kwargs, RequestMessage};
use super::task_name::TaskName;

/// Metadata visible to the handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvocationMetadata {
    pub id: MessageId,
    pub timestamp: i64,
    pub version: String,
    /// Receipt handle of the source message (`None` when run synchronously).
    pub receipt: Option<String>,
}

/// One execution of a task: decoded arguments plus context.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub task: TaskName,
    pub args: Args,
    pub kwargs: Kwargs,
    pub headers: Headers,
    pub metadata: InvocationMetadata,
}

impl Invocation {
    pub fn from_request(message: &RequestMessage, receipt: Option<String>) -> Self {
        Self {
            task: message.task_name.clone(),
            args: message.args.clone(),
            kwargs: message.kwargs.clone(),
            headers: message.headers.clone(),
            metadata: InvocationMetadata {
                id: message.id,
                timestamp: message.metadata.timestamp,
                version: message.metadata.version.clone(),
                receipt,
            },
        }
    }

    /// Decode positional argument `index`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, TaskError> {
        let value = self.args.get(index).ok_or_else(|| {
            TaskError::InvalidArguments(format!(
                "{} expects argument {index}, got {}",
                self.task,
                self.args.len()
            ))
        })?;
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Decode keyword argument `name`, `None` if absent.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, TaskError> {
        match self.kwargs.get(name) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// 型付き task 用: args / kwargs のどちらか一方から `T` を組み立てる
    ///
    /// - kwargs が空: args 配列から（tuple や Vec として）
    /// - args が空: kwargs オブジェクトから（struct として）
    /// - 両方ある: エラー
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, TaskError> {
        let value = match (self.args.is_empty(), self.kwargs.is_empty()) {
            (_, true) => Value::Array(self.args.clone()),
            (true, false) => Value::Object(self.kwargs.clone()),
            (false, false) => {
                return Err(TaskError::InvalidArguments(format!(
                    "{} takes either positional or keyword arguments, not both",
                    self.task
                )));
            }
        };
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use ulid::Ulid;

    fn invocation(args: Args, kwargs: Kwargs) -> Invocation {
        let msg = RequestMessage::new(
            MessageId::from_ulid(Ulid::new()),
            7,
            TaskName::new("app.tasks.send_email").unwrap(),
            args,
            kwargs,
        );
        Invocation::from_request(&msg, Some("receipt-1".to_string()))
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Email {
        to: String,
        subject: String,
    }

    #[test]
    fn positional_args_decode_as_tuple() {
        let inv = invocation(vec![json!(3), json!("x")], Kwargs::new());
        let (n, s): (i64, String) = inv.decode().unwrap();
        assert_eq!((n, s.as_str()), (3, "x"));
        assert_eq!(inv.arg::<i64>(0).unwrap(), 3);
        assert!(inv.arg::<i64>(5).is_err());
        assert_eq!(inv.metadata.receipt.as_deref(), Some("receipt-1"));
    }

    #[test]
    fn keyword_args_decode_as_struct() {
        let mut kwargs = Kwargs::new();
        kwargs.insert("to".to_string(), json!("a@example.com"));
        kwargs.insert("subject".to_string(), json!("hi"));
        let inv = invocation(Vec::new(), kwargs);
        let email: Email = inv.decode().unwrap();
        assert_eq!(email.to, "a@example.com");
        assert_eq!(inv.kwarg::<String>("subject").unwrap().as_deref(), Some("hi"));
        assert_eq!(inv.kwarg::<String>("cc").unwrap(), None);
    }

    #[test]
    fn mixed_args_are_rejected_by_decode() {
        let mut kwargs = Kwargs::new();
        kwargs.insert("k".to_string(), json!(1));
        let inv = invocation(vec![json!(1)], kwargs);
        assert!(matches!(
            inv.decode::<(i64,)>(),
            Err(TaskError::InvalidArguments(_))
        ));
    }
}
