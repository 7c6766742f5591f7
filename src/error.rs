use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by constructors and builders.
///
/// Hot paths (`take_from_pool`, `get`, `borrow`, bag operations) never fail;
/// only configuration and thread startup do.
///
/// 构造函数和构建器报告的错误。
/// 热路径从不失败，只有配置和线程启动会失败。
#[derive(Debug, Error)]
pub enum ReclaimError {
    #[error("partition count must be positive")]
    InvalidPartitionCount,

    #[error("{name} must be positive, got {value:?}")]
    NonPositiveDuration { name: &'static str, value: Duration },

    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("expiry service has been shut down")]
    ShutDown,
}

pub type Result<T> = std::result::Result<T, ReclaimError>;

/// Validates a configured duration, rejecting zero.
pub(crate) fn positive(name: &'static str, value: Duration) -> Result<Duration> {
    if value.is_zero() {
        Err(ReclaimError::NonPositiveDuration { name, value })
    } else {
        Ok(value)
    }
}

/// Outcome of a blocking wait on a `ReferenceQueue` that produced no reference.
///
/// `ReferenceQueue` 上的阻塞等待未产生引用时的结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("timed out waiting for a cleared reference")]
    Timeout,

    #[error("wait on the reference queue was interrupted")]
    Interrupted,
}
