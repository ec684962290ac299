//! Task trait - 型付き Task の定義
//!
//! # 学習ポイント
//! - Associated Constants (`const NAME`)
//! - Associated Types で引数と戻り値の型を task に結びつける

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Task は task 名と引数/戻り値の型を対応付ける
///
/// # 使用例
/// ```ignore
/// struct Cube;
///
/// impl Task for Cube {
///     const NAME: &'static str = "tests.tasks.test_tasks.cube";
///     type Args = (i64,);
///     type Output = i64;
/// }
/// ```
///
/// `Args` は positional 引数なら tuple、keyword 引数なら struct で受ける
/// （`Invocation::decode` を参照）。
pub trait Task: Send + Sync + 'static {
    /// 正規名（`module.function`）
    const NAME: &'static str;

    /// 呼び出し側が結果を受け取るか（reply queue を用意するか）のデフォルト
    const RETURNS_RESULT: bool = true;

    type Args: DeserializeOwned + Send + 'static;

    type Output: Serialize + Send + 'static;
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! テスト用の Task 型

    use super::Task;
    use crate::domain::{Invocation, TaskError};
    use crate::typed::Handler;
    use async_trait::async_trait;
    use serde::Deserialize;

    pub const TEST_MODULE: &str = "tests.tasks.test_tasks";

    pub struct Square;

    impl Task for Square {
        const NAME: &'static str = "tests.tasks.test_tasks.square";
        type Args = (i64,);
        type Output = i64;
    }

    pub struct Cube;

    impl Task for Cube {
        const NAME: &'static str = "tests.tasks.test_tasks.cube";
        type Args = (i64,);
        type Output = i64;
    }

    pub struct SquareHandler;

    #[async_trait]
    impl Handler<Square> for SquareHandler {
        async fn handle(&self, (x,): (i64,), _inv: &Invocation) -> Result<i64, TaskError> {
            Ok(x * x)
        }
    }

    pub struct CubeHandler;

    #[async_trait]
    impl Handler<Cube> for CubeHandler {
        async fn handle(&self, (x,): (i64,), _inv: &Invocation) -> Result<i64, TaskError> {
            Ok(x * x * x)
        }
    }

    #[derive(Debug, Deserialize)]
    pub struct EmailArgs {
        pub to: String,
        #[serde(default)]
        pub subject: Option<String>,
    }

    /// 戻り値を返さない task
    pub struct SendEmail;

    impl Task for SendEmail {
        const NAME: &'static str = "app.mail.send_email";
        const RETURNS_RESULT: bool = false;
        type Args = EmailArgs;
        type Output = ();
    }

    pub struct SendEmailHandler;

    #[async_trait]
    impl Handler<SendEmail> for SendEmailHandler {
        async fn handle(&self, args: EmailArgs, _inv: &Invocation) -> Result<(), TaskError> {
            if args.to.is_empty() {
                return Err(TaskError::failed("recipient is empty"));
            }
            Ok(())
        }
    }
}
