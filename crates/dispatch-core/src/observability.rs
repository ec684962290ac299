//! Observability - ログ初期化と worker の統計
//!
//! - `init_tracing()`: `LOG_LEVEL` / `RUST_LOG` を見て tracing-subscriber を設定する
//! - `WorkerStats`: worker が処理結果ごとに数えるカウンタ

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, fmt};

pub const LOG_LEVEL_VAR: &str = "LOG_LEVEL";
pub const LOG_FORMAT_VAR: &str = "LOG_FORMAT";

/// tracing を初期化する。2回目以降の呼び出しは何もしない
///
/// フィルタは `RUST_LOG` が優先、なければ `LOG_LEVEL`、どちらもなければ `info`。
/// `LOG_FORMAT=json` で JSON 出力になる。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var(LOG_LEVEL_VAR).unwrap_or_else(|_| "info".to_string());
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
    });

    let json = std::env::var(LOG_FORMAT_VAR).is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let layer = if json {
        fmt::layer().with_target(true).json().boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    if tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .is_err()
    {
        tracing::debug!("global tracing subscriber already set");
    }
}

/// How a consumed message ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed,
    Retried,
    Ignored,
    UnknownTask,
    Invalid,
}

/// 全 worker で共有するカウンタ（lock-free）
#[derive(Debug, Default)]
pub struct WorkerStats {
    received: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    ignored: AtomicU64,
    unknown: AtomicU64,
    invalid: AtomicU64,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Succeeded => &self.succeeded,
            Outcome::Failed => &self.failed,
            Outcome::Retried => &self.retried,
            Outcome::Ignored => &self.ignored,
            Outcome::UnknownTask => &self.unknown,
            Outcome::Invalid => &self.invalid,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            unknown: self.unknown.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub ignored: u64,
    pub unknown: u64,
    pub invalid: u64,
}

impl StatsSnapshot {
    /// Messages that reached a terminal outcome.
    pub fn finished(&self) -> u64 {
        self.succeeded + self.failed + self.retried + self.ignored + self.unknown + self.invalid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_each_outcome() {
        let stats = WorkerStats::new();
        stats.record_received();
        stats.record_received();
        stats.record(Outcome::Succeeded);
        stats.record(Outcome::Retried);

        let snap = stats.snapshot();
        assert_eq!(snap.received, 2);
        assert_eq!(snap.succeeded, 1);
        assert_eq!(snap.retried, 1);
        assert_eq!(snap.failed, 0);
        assert_eq!(snap.finished(), 2);
    }

    #[test]
    fn init_tracing_is_idempotent() {
        init_tracing();
        init_tracing();
    }
}
