//! 线程安全的提交边界
//!
//! 调度循环本身是单线程的；其他线程通过 `Submitter` 把 record 放进通道，
//! 由循环在每次分派前取走。停止请求走 `StopHandle`。

use super::entity::{EntityId, Ordinal};
use super::error::{SimError, SimResult};
use super::time::SimTime;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;

#[derive(Debug)]
pub(crate) struct Submission {
    pub(crate) at: SimTime,
    pub(crate) target: EntityId,
    pub(crate) ordinal: Ordinal,
    pub(crate) arguments: Vec<Value>,
    pub(crate) label: Option<String>,
}

/// 外部投递句柄，可克隆并发送到其他线程。
#[derive(Debug, Clone)]
pub struct Submitter {
    tx: Sender<Submission>,
}

impl Submitter {
    pub(crate) fn new(tx: Sender<Submission>) -> Self {
        Self { tx }
    }

    /// 在绝对时刻 `at` 投递一个不等待结果的调用。
    ///
    /// 早于控制器当前时钟的投递会在取出时被拒绝并计入 `RunSummary::rejected`。
    pub fn post_event_at(
        &self,
        at: SimTime,
        target: EntityId,
        ordinal: Ordinal,
        arguments: Vec<Value>,
    ) -> SimResult<()> {
        self.send(Submission {
            at,
            target,
            ordinal,
            arguments,
            label: None,
        })
    }

    pub fn post_labeled_event_at(
        &self,
        label: impl Into<String>,
        at: SimTime,
        target: EntityId,
        ordinal: Ordinal,
        arguments: Vec<Value>,
    ) -> SimResult<()> {
        self.send(Submission {
            at,
            target,
            ordinal,
            arguments,
            label: Some(label.into()),
        })
    }

    fn send(&self, submission: Submission) -> SimResult<()> {
        self.tx
            .send(submission)
            .map_err(|_| SimError::Disconnected)
    }
}

/// 请求运行中的控制器在下一次分派前停下。
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    requested: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// 取走停止请求。
    pub(crate) fn take(&self) -> bool {
        self.requested.swap(false, Ordering::SeqCst)
    }
}
