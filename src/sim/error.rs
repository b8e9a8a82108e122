//! 错误类型
//!
//! `Failure` 是一次调用的失败结果，可沿 continuation 传回挂起的调用点；
//! `SimError` 是整个运行层面的错误，会终止 `Controller::run`。

use super::entity::Ordinal;
use super::time::SimTime;
use thiserror::Error;

/// 单次调用（EventRecord 执行）的失败。
///
/// 可比较相等，调用方在恢复点看到的就是被调用方产生的同一个值。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Failure {
    /// 实体行为自身抛出的失败。
    #[error("{0}")]
    Raised(String),

    /// 目标实体没有这个 ordinal。
    #[error("entity `{entity}` has no behavior #{ordinal}")]
    UnknownOrdinal { entity: String, ordinal: Ordinal },

    /// 参数个数与目标行为不符。
    #[error("`{signature}` expects {expected} argument(s), got {actual}")]
    ArityMismatch {
        signature: String,
        expected: usize,
        actual: usize,
    },

    /// 行为在内核 future 之外挂起，调度器无法再唤醒它。
    #[error("`{signature}` suspended outside of a continuing call or sleep")]
    ForeignSuspension { signature: String },

    /// 同一次 poll 中登记了第二个挂起点（例如 join 两个 continuing call）。
    #[error("a behavior may await only one continuing call or sleep at a time")]
    ConcurrentSuspension,

    /// 在没有正在执行的 record 时发起了 continuing call。
    #[error("continuing calls can only be made from inside a running behavior")]
    NoCallerRecord,
}

impl Failure {
    pub fn raised(msg: impl Into<String>) -> Self {
        Failure::Raised(msg.into())
    }
}

/// 运行级错误。
#[derive(Debug, Error)]
pub enum SimError {
    /// 弹出的 record 早于当前时钟：队列或调度器缺陷，不可恢复。
    #[error("ordering violation: record scheduled at {at} popped when clock is {now}")]
    OrderingViolation { at: SimTime, now: SimTime },

    /// 无人等待的失败，且策略为 `FailurePolicy::Abort`。
    #[error("uncaught failure at {at}: {failure}\n{trace}")]
    Uncaught {
        at: SimTime,
        failure: Failure,
        trace: String,
    },

    /// 在行为内部再次调用 `run`。
    #[error("controller is already running")]
    Reentrant,

    /// 控制器已被丢弃，外部投递无处可去。
    #[error("controller has been dropped")]
    Disconnected,

    #[error("invalid controller config: {0}")]
    Config(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type SimResult<T> = Result<T, SimError>;
