//! 事件记录
//!
//! 一条 `EventRecord` 描述一次被调度的调用：目标、ordinal、参数、时间、因果来源，
//! 以及挂起时持有的 continuation。

use super::continuation::Continuation;
use super::controller::Controller;
use super::entity::{Behavior, EntityRef, Ordinal, Outcome};
use super::error::Failure;
use super::time::SimTime;
use super::trace::{CausalLog, TraceSink};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::io;
use std::rc::Rc;

/// record 在因果日志中的编号。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId(pub(crate) u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 一次被调度的调用。
pub struct EventRecord {
    id: RecordId,
    time: SimTime,
    target: EntityRef,
    ordinal: Ordinal,
    arguments: Rc<[Value]>,
    source: Option<RecordId>,
    continuation: Option<Continuation>,
    debug_label: Option<Rc<str>>,
}

impl EventRecord {
    pub(crate) fn new(
        id: RecordId,
        time: SimTime,
        source: Option<RecordId>,
        target: EntityRef,
        ordinal: Ordinal,
        arguments: Vec<Value>,
        debug_label: Option<Rc<str>>,
    ) -> Self {
        Self {
            id,
            time,
            target,
            ordinal,
            arguments: arguments.into(),
            source,
            continuation: None,
            debug_label,
        }
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    pub fn time(&self) -> SimTime {
        self.time
    }

    pub fn target(&self) -> &EntityRef {
        &self.target
    }

    pub fn ordinal(&self) -> Ordinal {
        self.ordinal
    }

    pub fn arguments(&self) -> &[Value] {
        &self.arguments
    }

    pub fn source(&self) -> Option<RecordId> {
        self.source
    }

    pub fn continuation(&self) -> Option<&Continuation> {
        self.continuation.as_ref()
    }

    pub fn debug_label(&self) -> Option<&str> {
        self.debug_label.as_deref()
    }

    pub fn signature(&self) -> String {
        signature_of(&self.target, self.ordinal)
    }

    /// 只按时间比较；同一时刻的先后由队列的插入序决定。
    pub fn compare(&self, other: &EventRecord) -> Ordering {
        // 不能用 a - b 判断符号，极值处会溢出
        if self.time == other.time {
            Ordering::Equal
        } else if self.time < other.time {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    }

    /// 在 `time` 重新调度的副本：共享目标、参数与来源，continuation 为空。
    ///
    /// 副本保留同一个 `RecordId`，它代表的是同一个逻辑事件。原 record 不受影响。
    pub fn clone_at(&self, time: SimTime) -> EventRecord {
        EventRecord {
            id: self.id,
            time,
            target: Rc::clone(&self.target),
            ordinal: self.ordinal,
            arguments: Rc::clone(&self.arguments),
            source: self.source,
            continuation: None,
            debug_label: self.debug_label.clone(),
        }
    }

    /// 启动目标行为。实体代码只在这里开始执行。
    pub fn invoke(&self, ctl: Controller) -> Behavior {
        Rc::clone(&self.target).invoke(self.ordinal, self.arguments.to_vec(), ctl)
    }

    /// 检查 ordinal 与参数个数是否与目标的分派表一致。
    pub(crate) fn check_capability(&self) -> Result<(), Failure> {
        match self.target.arity(self.ordinal) {
            None => Err(Failure::UnknownOrdinal {
                entity: self.target.name().to_string(),
                ordinal: self.ordinal,
            }),
            Some(expected) if expected != self.arguments.len() => Err(Failure::ArityMismatch {
                signature: self.signature(),
                expected,
                actual: self.arguments.len(),
            }),
            Some(_) => Ok(()),
        }
    }

    /// 写出本 record 及其全部因果祖先，每行一个。
    pub fn trace(&self, log: &CausalLog, sink: &TraceSink) -> io::Result<()> {
        sink.write_with(|w| {
            writeln!(w, "{self}")?;
            log.write_chain(self.source, w)
        })
    }

    pub(crate) fn suspend(&mut self, continuation: Continuation) {
        self.continuation = Some(continuation);
    }

    pub(crate) fn take_continuation(&mut self) -> Option<Continuation> {
        self.continuation.take()
    }

    /// 被等待的调用已完成：记下结果，并把时间推进到恢复时刻。
    pub(crate) fn resume(mut self, now: SimTime, outcome: Outcome) -> EventRecord {
        debug_assert!(now >= self.time, "resume must not move a record backwards");
        self.time = now;
        if let Some(c) = self.continuation.as_mut() {
            c.set_return_state(outcome);
        }
        self
    }
}

impl fmt::Display for EventRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_frame(
            f,
            self.time,
            &self.target,
            self.ordinal,
            self.debug_label.as_deref(),
        )
    }
}

impl fmt::Debug for EventRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRecord")
            .field("id", &self.id)
            .field("time", &self.time)
            .field("signature", &self.signature())
            .field("arguments", &self.arguments)
            .field("source", &self.source)
            .field("suspended", &self.continuation.is_some())
            .field("debug_label", &self.debug_label)
            .finish()
    }
}

pub(crate) fn signature_of(target: &EntityRef, ordinal: Ordinal) -> String {
    target
        .signature_for(ordinal)
        .unwrap_or_else(|| format!("{}#{}", target.name(), ordinal))
}

/// `<time> : <signature>`，有标签时追加 ` @ <label>`。
pub(crate) fn write_frame(
    f: &mut impl fmt::Write,
    time: SimTime,
    target: &EntityRef,
    ordinal: Ordinal,
    label: Option<&str>,
) -> fmt::Result {
    write!(f, "{} : {}", time, signature_of(target, ordinal))?;
    if let Some(label) = label {
        write!(f, " @ {label}")?;
    }
    Ok(())
}
