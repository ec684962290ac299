//! Domain model: ids, task names, wire messages, invocation context, errors.

pub mod errors;
pub mod ids;
pub mod invocation;
pub mod message;
pub mod task_name;

pub use self::errors::{DispatchError, ErrorKind, TaskError};
pub use self::ids::{MessageId, ResponseId};
pub use self::invocation::{Invocation, InvocationMetadata};
pub use self::message::{
    Args, ErrorDetail, Headers, Kwargs, Metadata, OriginalRef, RequestMessage, ResponseBody,
    ResponseMessage, ResponseStatus,
};
pub use self::task_name::TaskName;
