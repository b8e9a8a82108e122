//! 因果追踪
//!
//! 挂起与恢复之间真实调用栈已经丢失，这里用 record 的 `source` 链重建一条
//! 跨仿真时间的“调用栈”。`CausalLog` 以 `RecordId` 为键保存帧；帧按引用计数回收：
//! record 本身和每个以它为 `source` 的子帧各持有一次，全部释放后帧随之删除。

use super::entity::{EntityRef, Ordinal};
use super::record::{RecordId, write_frame};
use super::time::SimTime;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::io::{self, Write};
use std::rc::Rc;
use std::sync::{Arc, Mutex, PoisonError};

struct Frame {
    time: SimTime,
    target: EntityRef,
    ordinal: Ordinal,
    label: Option<Rc<str>>,
    source: Option<RecordId>,
    holds: usize,
}

/// 仍可能出现在追踪里的 record 的帧。
#[derive(Default)]
pub struct CausalLog {
    frames: HashMap<RecordId, Frame>,
    next_id: u64,
}

impl CausalLog {
    pub(crate) fn open(
        &mut self,
        time: SimTime,
        target: EntityRef,
        ordinal: Ordinal,
        label: Option<Rc<str>>,
        source: Option<RecordId>,
    ) -> RecordId {
        let id = RecordId(self.next_id);
        self.next_id += 1;
        if let Some(parent) = source {
            self.retain(parent);
        }
        self.frames.insert(
            id,
            Frame {
                time,
                target,
                ordinal,
                label,
                source,
                holds: 1,
            },
        );
        id
    }

    pub(crate) fn retain(&mut self, id: RecordId) {
        if let Some(frame) = self.frames.get_mut(&id) {
            frame.holds += 1;
        }
    }

    /// 释放一次持有；归零的帧被删除，并继续释放它对 `source` 的持有。
    pub(crate) fn release(&mut self, id: RecordId) {
        let mut cursor = Some(id);
        while let Some(id) = cursor {
            let Entry::Occupied(mut entry) = self.frames.entry(id) else {
                return;
            };
            let frame = entry.get_mut();
            frame.holds = frame.holds.saturating_sub(1);
            if frame.holds > 0 {
                return;
            }
            cursor = entry.remove().source;
        }
    }

    /// record 被重新调度后，帧里的时间跟着前移。
    pub(crate) fn set_time(&mut self, id: RecordId, time: SimTime) {
        if let Some(frame) = self.frame_mut(id) {
            frame.time = frame.time.max(time);
        }
    }

    /// 仍被持有的帧数。
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn source_of(&self, id: RecordId) -> Option<RecordId> {
        self.frame(id).and_then(|f| f.source)
    }

    /// 单行描述，格式与 `EventRecord` 的 `Display` 相同。
    pub fn line(&self, id: RecordId) -> Option<String> {
        let frame = self.frame(id)?;
        let mut s = String::new();
        write_frame(
            &mut s,
            frame.time,
            &frame.target,
            frame.ordinal,
            frame.label.as_deref(),
        )
        .ok()?;
        Some(s)
    }

    /// 从 `from` 开始沿 `source` 一直写到根。
    pub fn write_chain(&self, from: Option<RecordId>, w: &mut dyn Write) -> io::Result<()> {
        let mut cursor = from;
        while let Some(id) = cursor {
            let Some(line) = self.line(id) else {
                break;
            };
            writeln!(w, "{line}")?;
            cursor = self.source_of(id);
        }
        Ok(())
    }

    /// `id` 及其祖先的完整追踪文本。
    pub fn render(&self, id: RecordId) -> String {
        let mut buf = Vec::new();
        // 写入 Vec 不会失败
        let _ = self.write_chain(Some(id), &mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    }

    fn frame(&self, id: RecordId) -> Option<&Frame> {
        self.frames.get(&id)
    }

    fn frame_mut(&mut self, id: RecordId) -> Option<&mut Frame> {
        self.frames.get_mut(&id)
    }
}

impl fmt::Debug for CausalLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CausalLog")
            .field("frames", &self.frames.len())
            .field("opened", &self.next_id)
            .finish()
    }
}

/// 追踪输出目标，可被多个线程共享；一次追踪期间持有锁，行不会交错。
#[derive(Clone)]
pub struct TraceSink {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl TraceSink {
    pub fn new(w: impl Write + Send + 'static) -> Self {
        let w: Box<dyn Write + Send> = Box::new(w);
        Self {
            inner: Arc::new(Mutex::new(w)),
        }
    }

    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }

    /// 在持锁状态下执行一次完整写入并 flush。
    pub fn write_with<F>(&self, f: F) -> io::Result<()>
    where
        F: FnOnce(&mut dyn Write) -> io::Result<()>,
    {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut **guard)?;
        guard.flush()
    }

    pub fn write_str(&self, text: &str) -> io::Result<()> {
        self.write_with(|w| w.write_all(text.as_bytes()))
    }
}

impl Default for TraceSink {
    fn default() -> Self {
        Self::stderr()
    }
}

impl fmt::Debug for TraceSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TraceSink")
    }
}
