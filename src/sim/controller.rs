//! 控制器
//!
//! 拥有时钟与事件队列，向实体代码提供投递接口，驱动分派循环并实现挂起/恢复。
//!
//! `Controller` 是一个可克隆的单线程句柄：分派循环、实体行为与投递都在同一线程上，
//! 循环在 poll 行为期间不持有内部借用，行为因此可以随时回调控制器。
//!
//! 交给行为的句柄不是所有者。挂起的行为留在队列里并持有控制器，最后一个所有者句柄
//! 被丢弃时，队列、等待表、实体表与追踪帧会被清空，提交通道随之关闭。

use super::config::{ControllerConfig, FailurePolicy};
use super::continuation::{CallRequest, Continuation, ContinuingCall, Sleep};
use super::entity::{Behavior, EntityId, EntityRef, Ordinal, Outcome};
use super::error::{Failure, SimError, SimResult};
use super::queue::EventQueue;
use super::record::{EventRecord, RecordId, signature_of};
use super::submit::{StopHandle, Submission, Submitter};
use super::time::SimTime;
use super::trace::{CausalLog, TraceSink};
use futures_util::task::noop_waker_ref;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::rc::{Rc, Weak};
use std::sync::mpsc::{self, Receiver};
use std::task::{Context, Poll};
use tracing::{debug, error, info, trace, warn};

/// 控制器生命周期：`Idle → Running → (Halted | Drained)`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Running,
    /// 因停止请求、时间上限或未捕获失败而停下，队列里可能还有 record。
    Halted,
    /// 队列已空，仿真完成。
    Drained,
}

/// 投递的种类。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostKind {
    Event,
    Continuing,
}

/// 每次投递时被通知，拿到目标行为的签名。
pub trait PostObserver {
    fn on_post(&self, kind: PostKind, signature: &str);
}

impl<F: Fn(PostKind, &str)> PostObserver for F {
    fn on_post(&self, kind: PostKind, signature: &str) {
        self(kind, signature)
    }
}

/// 一次 `run` / `run_until` 的统计。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub dispatched: u64,
    pub final_time: SimTime,
    pub state: ControllerState,
    /// 无人等待的失败个数（仅 `FailurePolicy::Continue` 下可能大于 0）。
    pub uncaught: u64,
    /// 运行结束时仍在等待被调用方的调用方个数。
    pub stalled: usize,
    /// 被拒绝的外部投递个数。
    pub rejected: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Drained,
    Stopped,
    Horizon,
}

enum Wait {
    Call(RecordId),
    Sleep(SimTime),
}

enum Step {
    Done(Outcome),
    Suspended(Behavior),
}

#[derive(Default)]
struct RunStats {
    dispatched: u64,
    uncaught: u64,
    rejected: u64,
}

struct Inner {
    now: SimTime,
    state: ControllerState,
    config: ControllerConfig,
    queue: EventQueue,
    log: CausalLog,
    entities: Vec<EntityRef>,
    /// 被调用方 -> 等待它的调用方。
    suspended: HashMap<RecordId, EventRecord>,
    /// 调用方 -> 它在恢复时收到的失败及其最初产生者。
    failure_origins: HashMap<RecordId, (Failure, RecordId)>,
    current: Option<RecordId>,
    wait: Option<Wait>,
    delivery: Option<Outcome>,
    sink: TraceSink,
    observer: Option<Rc<dyn PostObserver>>,
    intake: Receiver<Submission>,
    submitter: Submitter,
    stop: StopHandle,
    stats: RunStats,
}

impl Inner {
    fn open_record(
        &mut self,
        time: SimTime,
        source: Option<RecordId>,
        target: EntityRef,
        ordinal: Ordinal,
        arguments: Vec<Value>,
        label: Option<Rc<str>>,
    ) -> EventRecord {
        let id = self
            .log
            .open(time, Rc::clone(&target), ordinal, label.clone(), source);
        EventRecord::new(id, time, source, target, ordinal, arguments, label)
    }

    /// 丢弃 `caller` 未取走的失败来源。
    fn forget_failure(&mut self, caller: RecordId) {
        if let Some((_, origin)) = self.failure_origins.remove(&caller) {
            self.log.release(origin);
        }
    }

    /// 清空所有可能持有行为或控制器句柄的状态，交给调用方在借用之外丢弃。
    fn teardown(&mut self) -> Teardown {
        // 换掉接收端后，外部 `Submitter` 的投递返回 `Disconnected`
        let (_, closed) = mpsc::channel();
        self.intake = closed;
        self.failure_origins.clear();
        self.delivery = None;
        Teardown {
            queue: std::mem::take(&mut self.queue),
            suspended: std::mem::take(&mut self.suspended),
            entities: std::mem::take(&mut self.entities),
            log: std::mem::take(&mut self.log),
            observer: self.observer.take(),
        }
    }

    fn schedule(&mut self, record: EventRecord) {
        trace!(now = ?self.now, at = ?record.time(), id = %record.id(), "调度事件");
        self.log.set_time(record.id(), record.time());
        self.queue.push(record);
        debug!(queue_size = self.queue.len(), "事件已加入队列");
    }

    fn observed(
        &self,
        target: &EntityRef,
        ordinal: Ordinal,
    ) -> Option<(Rc<dyn PostObserver>, String)> {
        self.observer
            .as_ref()
            .map(|o| (Rc::clone(o), signature_of(target, ordinal)))
    }

    fn drain_submissions(&mut self) {
        while let Ok(sub) = self.intake.try_recv() {
            let Some(target) = self.entities.get(sub.target.0).cloned() else {
                warn!(target = %sub.target, "拒绝外部投递：实体未注册");
                self.stats.rejected += 1;
                continue;
            };
            if sub.at < self.now {
                warn!(at = ?sub.at, now = ?self.now, "拒绝外部投递：时间早于当前时钟");
                self.stats.rejected += 1;
                continue;
            }
            let label = sub.label.map(Rc::from);
            let record = self.open_record(sub.at, None, target, sub.ordinal, sub.arguments, label);
            self.schedule(record);
        }
    }
}

struct Teardown {
    queue: EventQueue,
    suspended: HashMap<RecordId, EventRecord>,
    entities: Vec<EntityRef>,
    log: CausalLog,
    observer: Option<Rc<dyn PostObserver>>,
}

/// 所有者句柄共享的标记，最后一个被丢弃时拆掉 `Inner`。
struct Owner {
    inner: Weak<RefCell<Inner>>,
}

impl Drop for Owner {
    fn drop(&mut self) {
        let Some(shared) = self.inner.upgrade() else {
            return;
        };
        let parked = match shared.try_borrow_mut() {
            Ok(mut inner) => inner.teardown(),
            Err(_) => return,
        };
        debug!(
            pending = parked.queue.len(),
            suspended = parked.suspended.len(),
            entities = parked.entities.len(),
            frames = parked.log.len(),
            observer = parked.observer.is_some(),
            "控制器已丢弃，清理剩余状态"
        );
        drop(parked);
    }
}

/// 事件驱动控制器：维护当前时间与事件队列。
///
/// `new` / `with_config` 及其克隆是所有者句柄；行为收到的句柄不是。
/// 实体若保存了所有者句柄，控制器就不会被拆除。
#[derive(Clone)]
pub struct Controller {
    inner: Rc<RefCell<Inner>>,
    owner: Option<Rc<Owner>>,
}

impl Controller {
    pub fn new() -> Self {
        Self::with_config(ControllerConfig::default())
    }

    pub fn with_config(config: ControllerConfig) -> Self {
        let (tx, rx) = mpsc::channel();
        let inner = Inner {
            now: SimTime::ZERO,
            state: ControllerState::Idle,
            config,
            queue: EventQueue::new(),
            log: CausalLog::default(),
            entities: Vec::new(),
            suspended: HashMap::new(),
            failure_origins: HashMap::new(),
            current: None,
            wait: None,
            delivery: None,
            sink: TraceSink::stderr(),
            observer: None,
            intake: rx,
            submitter: Submitter::new(tx),
            stop: StopHandle::default(),
            stats: RunStats::default(),
        };
        let inner = Rc::new(RefCell::new(inner));
        let owner = Owner {
            inner: Rc::downgrade(&inner),
        };
        Self {
            inner,
            owner: Some(Rc::new(owner)),
        }
    }

    /// 交给行为与内核 future 的非所有者句柄。
    fn handle(&self) -> Controller {
        Controller {
            inner: Rc::clone(&self.inner),
            owner: None,
        }
    }

    /// 替换未捕获失败的追踪输出（默认 stderr）。
    pub fn with_trace_sink(self, sink: TraceSink) -> Self {
        self.inner.borrow_mut().sink = sink;
        self
    }

    pub fn set_observer(&self, observer: impl PostObserver + 'static) {
        self.inner.borrow_mut().observer = Some(Rc::new(observer));
    }

    pub fn config(&self) -> ControllerConfig {
        self.inner.borrow().config.clone()
    }

    /// 获取当前仿真时间
    pub fn now(&self) -> SimTime {
        self.inner.borrow().now
    }

    pub fn state(&self) -> ControllerState {
        self.inner.borrow().state
    }

    /// 队列中待分派的 record 数。
    pub fn pending(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    /// 仍被持有的因果追踪帧数：排队或挂起的 record 及其祖先。
    pub fn causal_frames(&self) -> usize {
        self.inner.borrow().log.len()
    }

    /// 正在等待被调用方的调用方数。
    pub fn suspended(&self) -> usize {
        self.inner.borrow().suspended.len()
    }

    /// 注册实体，返回可跨线程使用的编号。
    pub fn register(&self, entity: EntityRef) -> EntityId {
        let mut inner = self.inner.borrow_mut();
        inner.entities.push(entity);
        EntityId(inner.entities.len() - 1)
    }

    pub fn entity(&self, id: EntityId) -> Option<EntityRef> {
        self.inner.borrow().entities.get(id.0).cloned()
    }

    pub fn submitter(&self) -> Submitter {
        self.inner.borrow().submitter.clone()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.inner.borrow().stop.clone()
    }

    /// 在下一次分派前停下。
    pub fn stop(&self) {
        self.inner.borrow().stop.stop();
    }

    /// 正在执行的 record。
    pub fn current_event(&self) -> Option<RecordId> {
        self.inner.borrow().current
    }

    /// `id` 及其因果祖先的追踪文本。
    pub fn causal_trace(&self, id: RecordId) -> Option<String> {
        let inner = self.inner.borrow();
        inner.log.line(id)?;
        Some(inner.log.render(id))
    }

    /// 把当前 record 的因果追踪写到 `sink`。
    pub fn trace_current(&self, sink: &TraceSink) -> io::Result<()> {
        let inner = self.inner.borrow();
        let current = inner.current;
        sink.write_with(|w| inner.log.write_chain(current, w))
    }

    /// 在当前时刻投递一个不等待结果的调用。
    pub fn post_event(
        &self,
        target: EntityRef,
        ordinal: Ordinal,
        arguments: Vec<Value>,
    ) -> RecordId {
        self.post(None, SimTime::ZERO, target, ordinal, arguments)
    }

    /// 在 `now + delay` 投递一个不等待结果的调用。
    pub fn post_event_after(
        &self,
        delay: SimTime,
        target: EntityRef,
        ordinal: Ordinal,
        arguments: Vec<Value>,
    ) -> RecordId {
        self.post(None, delay, target, ordinal, arguments)
    }

    pub fn post_labeled_event(
        &self,
        label: impl Into<String>,
        delay: SimTime,
        target: EntityRef,
        ordinal: Ordinal,
        arguments: Vec<Value>,
    ) -> RecordId {
        let label: Rc<str> = Rc::from(label.into());
        self.post(Some(label), delay, target, ordinal, arguments)
    }

    /// 阻塞调用：`.await` 挂起当前行为，直到目标行为完成，得到其返回值或失败。
    pub fn post_continuing_event(
        &self,
        target: EntityRef,
        ordinal: Ordinal,
        arguments: Vec<Value>,
    ) -> ContinuingCall {
        self.continuing(None, target, ordinal, arguments)
    }

    pub fn post_labeled_continuing_event(
        &self,
        label: impl Into<String>,
        target: EntityRef,
        ordinal: Ordinal,
        arguments: Vec<Value>,
    ) -> ContinuingCall {
        let label: Rc<str> = Rc::from(label.into());
        self.continuing(Some(label), target, ordinal, arguments)
    }

    /// 阻塞睡眠：当前行为在 `now + delay` 恢复。
    pub fn sleep(&self, delay: SimTime) -> Sleep {
        Sleep::new(self.handle(), delay)
    }

    /// 运行直到队列为空、收到停止请求或出现需要终止的失败。
    #[tracing::instrument(skip(self))]
    pub fn run(&self) -> SimResult<RunSummary> {
        self.run_inner(None)
    }

    /// 运行到 `until`（含），之后把时钟推进到 `until`。
    #[tracing::instrument(skip(self))]
    pub fn run_until(&self, until: SimTime) -> SimResult<RunSummary> {
        self.run_inner(Some(until))
    }

    #[tracing::instrument(skip(self, target, arguments))]
    fn post(
        &self,
        label: Option<Rc<str>>,
        delay: SimTime,
        target: EntityRef,
        ordinal: Ordinal,
        arguments: Vec<Value>,
    ) -> RecordId {
        let (id, observed) = {
            let mut inner = self.inner.borrow_mut();
            let observed = inner.observed(&target, ordinal);
            let at = inner.now.after(delay);
            let source = inner.current;
            let record = inner.open_record(at, source, target, ordinal, arguments, label);
            let id = record.id();
            inner.schedule(record);
            (id, observed)
        };
        if let Some((observer, signature)) = observed {
            observer.on_post(PostKind::Event, &signature);
        }
        id
    }

    fn continuing(
        &self,
        label: Option<Rc<str>>,
        target: EntityRef,
        ordinal: Ordinal,
        arguments: Vec<Value>,
    ) -> ContinuingCall {
        ContinuingCall::new(
            self.handle(),
            CallRequest {
                target,
                ordinal,
                arguments,
                label,
            },
        )
    }

    /// continuing call 第一次被 poll：投递目标 record 并登记等待。
    pub(crate) fn begin_call(&self, request: CallRequest) -> Result<(), Failure> {
        let CallRequest {
            target,
            ordinal,
            arguments,
            label,
        } = request;
        let observed = {
            let mut inner = self.inner.borrow_mut();
            let Some(caller) = inner.current else {
                return Err(Failure::NoCallerRecord);
            };
            if inner.wait.is_some() {
                return Err(Failure::ConcurrentSuspension);
            }
            let observed = inner.observed(&target, ordinal);
            let at = inner.now;
            let record = inner.open_record(at, Some(caller), target, ordinal, arguments, label);
            trace!(caller = %caller, callee = %record.id(), "发起 continuing call");
            inner.wait = Some(Wait::Call(record.id()));
            inner.schedule(record);
            observed
        };
        if let Some((observer, signature)) = observed {
            observer.on_post(PostKind::Continuing, &signature);
        }
        Ok(())
    }

    pub(crate) fn begin_sleep(&self, delay: SimTime) -> Result<SimTime, Failure> {
        let mut inner = self.inner.borrow_mut();
        if inner.current.is_none() {
            return Err(Failure::NoCallerRecord);
        }
        if inner.wait.is_some() {
            return Err(Failure::ConcurrentSuspension);
        }
        let until = inner.now.after(delay);
        inner.wait = Some(Wait::Sleep(until));
        Ok(until)
    }

    pub(crate) fn take_delivery(&self) -> Option<Outcome> {
        self.inner.borrow_mut().delivery.take()
    }

    fn run_inner(&self, until: Option<SimTime>) -> SimResult<RunSummary> {
        {
            let mut inner = self
                .inner
                .try_borrow_mut()
                .map_err(|_| SimError::Reentrant)?;
            if inner.state == ControllerState::Running {
                return Err(SimError::Reentrant);
            }
            inner.state = ControllerState::Running;
            inner.stats = RunStats::default();
            info!("▶️  开始运行仿真");
            debug!(now = ?inner.now, queue_size = inner.queue.len(), "初始状态");
        }

        let exit = match self.dispatch_loop(until) {
            Ok(exit) => exit,
            Err(e) => {
                self.inner.borrow_mut().state = ControllerState::Halted;
                return Err(e);
            }
        };

        let mut inner = self.inner.borrow_mut();
        if let Some(until) = until.filter(|_| exit != Exit::Stopped) {
            let horizon = inner.config.end_time.map_or(until, |end| end.min(until));
            inner.now = inner.now.max(horizon);
        }
        inner.state = match exit {
            Exit::Drained => ControllerState::Drained,
            Exit::Stopped | Exit::Horizon => ControllerState::Halted,
        };

        let summary = RunSummary {
            dispatched: inner.stats.dispatched,
            final_time: inner.now,
            state: inner.state,
            uncaught: inner.stats.uncaught,
            stalled: inner.suspended.len(),
            rejected: inner.stats.rejected,
        };
        if exit == Exit::Drained && summary.stalled > 0 {
            warn!(stalled = summary.stalled, "队列已空，但仍有调用方在等待");
        }
        info!(
            total_events = summary.dispatched,
            final_time = ?summary.final_time,
            state = ?summary.state,
            "✅ 仿真完成"
        );
        Ok(summary)
    }

    fn dispatch_loop(&self, until: Option<SimTime>) -> SimResult<Exit> {
        loop {
            let record = {
                let mut inner = self.inner.borrow_mut();
                inner.drain_submissions();
                if inner.stop.take() {
                    info!(now = ?inner.now, "收到停止请求");
                    return Ok(Exit::Stopped);
                }
                let Some(at) = inner.queue.peek_time() else {
                    return Ok(Exit::Drained);
                };
                let end = inner.config.end_time;
                if until.is_some_and(|u| at > u) || end.is_some_and(|e| at > e) {
                    return Ok(Exit::Horizon);
                }
                let Some(record) = inner.queue.pop() else {
                    return Ok(Exit::Drained);
                };
                if record.time() < inner.now {
                    error!(at = ?record.time(), now = ?inner.now, id = %record.id(), "时间倒退");
                    return Err(SimError::OrderingViolation {
                        at: record.time(),
                        now: inner.now,
                    });
                }
                inner.now = record.time();
                inner.stats.dispatched += 1;
                debug!(
                    event_num = inner.stats.dispatched,
                    now = ?inner.now,
                    id = %record.id(),
                    remaining_queue = inner.queue.len(),
                    "执行事件"
                );
                record
            };
            self.dispatch(record)?;
        }
    }

    fn dispatch(&self, mut record: EventRecord) -> SimResult<()> {
        let id = record.id();
        let resumed = record.take_continuation();
        {
            let mut inner = self.inner.borrow_mut();
            inner.current = Some(id);
            inner.wait = None;
            inner.delivery = None;
        }

        let behavior = match resumed {
            Some(continuation) => {
                let (call_site, outcome) = continuation.into_parts();
                self.inner.borrow_mut().delivery = outcome;
                Ok(call_site)
            }
            None => record
                .check_capability()
                .map(|()| record.invoke(self.handle())),
        };

        let step = match behavior {
            Ok(mut call_site) => {
                let mut cx = Context::from_waker(noop_waker_ref());
                match call_site.as_mut().poll(&mut cx) {
                    Poll::Ready(outcome) => Step::Done(outcome),
                    Poll::Pending => Step::Suspended(call_site),
                }
            }
            Err(failure) => Step::Done(Err(failure)),
        };

        let wait = {
            let mut inner = self.inner.borrow_mut();
            inner.current = None;
            inner.delivery = None;
            inner.wait.take()
        };

        match step {
            Step::Done(outcome) => self.complete(record, outcome),
            Step::Suspended(call_site) => match wait {
                Some(Wait::Call(callee)) => {
                    record.suspend(Continuation::awaiting(callee, call_site));
                    trace!(caller = %id, callee = %callee, "调用方挂起");
                    let mut inner = self.inner.borrow_mut();
                    inner.forget_failure(id);
                    inner.suspended.insert(callee, record);
                    Ok(())
                }
                Some(Wait::Sleep(until)) => {
                    let mut wake = record.clone_at(until);
                    wake.suspend(Continuation::sleeping(call_site));
                    trace!(id = %id, until = ?until, "阻塞睡眠");
                    let mut inner = self.inner.borrow_mut();
                    inner.forget_failure(id);
                    inner.schedule(wake);
                    Ok(())
                }
                None => {
                    drop(call_site);
                    let signature = record.signature();
                    self.complete(record, Err(Failure::ForeignSuspension { signature }))
                }
            },
        }
    }

    /// record 的行为结束：唤醒等待它的调用方，或按策略报告未捕获的失败。
    fn complete(&self, record: EventRecord, outcome: Outcome) -> SimResult<()> {
        let id = record.id();
        drop(record);

        let mut inner = self.inner.borrow_mut();
        let now = inner.now;
        // 原样向上传递的失败沿用最初产生它的 record 作为追踪起点
        let delivered = inner.failure_origins.remove(&id);
        let origin = match (&outcome, &delivered) {
            (Err(failure), Some((seen, origin))) if seen == failure => *origin,
            _ => id,
        };
        let finish = |inner: &mut Inner| {
            if let Some((_, origin)) = &delivered {
                inner.log.release(*origin);
            }
            inner.log.release(id);
        };

        if let Some(caller) = inner.suspended.remove(&id) {
            if let Err(failure) = &outcome {
                inner.log.retain(origin);
                inner
                    .failure_origins
                    .insert(caller.id(), (failure.clone(), origin));
            }
            debug!(callee = %id, caller = %caller.id(), ok = outcome.is_ok(), "恢复等待中的调用方");
            let resumed = caller.resume(now, outcome);
            inner.schedule(resumed);
            finish(&mut *inner);
            return Ok(());
        }

        let failure = match outcome {
            Ok(_) => {
                trace!(id = %id, "事件完成");
                finish(&mut *inner);
                return Ok(());
            }
            Err(failure) => failure,
        };

        let trace = inner.log.render(origin);
        finish(&mut *inner);
        inner.stats.uncaught += 1;
        error!(at = ?now, id = %id, %failure, "未捕获的失败\n{trace}");
        let sink = inner.config.trace_uncaught.then(|| inner.sink.clone());
        let policy = inner.config.failure_policy;
        drop(inner);

        if let Some(Err(e)) = sink.map(|sink| sink.write_str(&trace)) {
            warn!(error = %e, "写出未捕获失败的追踪失败");
        }
        match policy {
            FailurePolicy::Abort => Err(SimError::Uncaught {
                at: now,
                failure,
                trace,
            }),
            FailurePolicy::Continue => Ok(()),
        }
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_borrow() {
            Ok(inner) => f
                .debug_struct("Controller")
                .field("now", &inner.now)
                .field("state", &inner.state)
                .field("pending", &inner.queue.len())
                .field("suspended", &inner.suspended.len())
                .finish(),
            Err(_) => f.write_str("Controller { .. }"),
        }
    }
}
