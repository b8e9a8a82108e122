//! Continuation 与阻塞调用协议
//!
//! 发起 continuing call 的行为在 `.await` 处挂起，其执行体连同 continuation 一起挂在
//! 调用方 record 上；被调用方完成后，调度器把结果写回 continuation 并重新入队调用方，
//! 再次 poll 时 `.await` 得到返回值或失败。

use super::controller::Controller;
use super::entity::{Behavior, EntityRef, Ordinal, Outcome};
use super::error::Failure;
use super::record::RecordId;
use super::time::SimTime;
use futures_util::future::FusedFuture;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

/// 挂起中的调用点及其最终结果。
pub struct Continuation {
    awaiting: Option<RecordId>,
    outcome: Option<Outcome>,
    call_site: Behavior,
}

impl Continuation {
    /// 等待 `callee` 完成。
    pub(crate) fn awaiting(callee: RecordId, call_site: Behavior) -> Self {
        Self {
            awaiting: Some(callee),
            outcome: None,
            call_site,
        }
    }

    /// 阻塞睡眠：到点即以空值恢复。
    pub(crate) fn sleeping(call_site: Behavior) -> Self {
        Self {
            awaiting: None,
            outcome: Some(Ok(Value::Null)),
            call_site,
        }
    }

    /// 被等待的 record；睡眠时为 `None`。
    pub fn awaiting_record(&self) -> Option<RecordId> {
        self.awaiting
    }

    pub fn is_resolved(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn result(&self) -> Option<&Value> {
        self.outcome.as_ref().and_then(|o| o.as_ref().ok())
    }

    pub fn error(&self) -> Option<&Failure> {
        self.outcome.as_ref().and_then(|o| o.as_ref().err())
    }

    pub(crate) fn set_return_state(&mut self, outcome: Outcome) {
        self.outcome = Some(outcome);
    }

    pub(crate) fn into_parts(self) -> (Behavior, Option<Outcome>) {
        (self.call_site, self.outcome)
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("awaiting", &self.awaiting)
            .field("outcome", &self.outcome)
            .finish_non_exhaustive()
    }
}

pub(crate) struct CallRequest {
    pub(crate) target: EntityRef,
    pub(crate) ordinal: Ordinal,
    pub(crate) arguments: Vec<Value>,
    pub(crate) label: Option<Rc<str>>,
}

enum CallState {
    Unposted(CallRequest),
    Posted,
    Done,
}

/// `Controller::post_continuing_event` 返回的 future。
///
/// 第一次 poll 时才真正发出调用，因此必须在行为内部 `.await`。
/// 完成后再次 poll 始终返回 `Pending`（见 `FusedFuture::is_terminated`）。
#[must_use = "a continuing call does nothing unless awaited"]
pub struct ContinuingCall {
    ctl: Controller,
    state: CallState,
}

impl ContinuingCall {
    pub(crate) fn new(ctl: Controller, request: CallRequest) -> Self {
        Self {
            ctl,
            state: CallState::Unposted(request),
        }
    }
}

impl Future for ContinuingCall {
    type Output = Outcome;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Outcome> {
        let this = self.get_mut();
        match std::mem::replace(&mut this.state, CallState::Done) {
            CallState::Unposted(request) => match this.ctl.begin_call(request) {
                Ok(()) => {
                    this.state = CallState::Posted;
                    Poll::Pending
                }
                Err(failure) => Poll::Ready(Err(failure)),
            },
            CallState::Posted => match this.ctl.take_delivery() {
                Some(outcome) => Poll::Ready(outcome),
                None => {
                    this.state = CallState::Posted;
                    Poll::Pending
                }
            },
            CallState::Done => Poll::Pending,
        }
    }
}

impl FusedFuture for ContinuingCall {
    fn is_terminated(&self) -> bool {
        matches!(self.state, CallState::Done)
    }
}

/// `Controller::sleep` 返回的 future。
#[must_use = "sleep does nothing unless awaited"]
pub struct Sleep {
    ctl: Controller,
    until: Option<SimTime>,
    delay: SimTime,
}

impl Sleep {
    pub(crate) fn new(ctl: Controller, delay: SimTime) -> Self {
        Self {
            ctl,
            until: None,
            delay,
        }
    }
}

impl Future for Sleep {
    type Output = Result<(), Failure>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.until.is_none() {
            return match this.ctl.begin_sleep(this.delay) {
                Ok(until) => {
                    this.until = Some(until);
                    Poll::Pending
                }
                Err(failure) => Poll::Ready(Err(failure)),
            };
        }
        match this.ctl.take_delivery() {
            Some(outcome) => Poll::Ready(outcome.map(|_| ())),
            None => Poll::Pending,
        }
    }
}
