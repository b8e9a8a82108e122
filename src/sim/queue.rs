//! 事件队列
//!
//! 按时间排序、同一时刻按插入序（FIFO）稳定的优先队列。

use super::record::EventRecord;
use super::time::SimTime;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// 队列中的条目：record 加上插入序号。
struct Scheduled {
    seq: u64,
    record: EventRecord,
}

// BinaryHeap 是 max-heap；我们需要最小时间优先，因此反向比较。
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.record.compare(&other.record) {
            Ordering::Equal => self.seq.cmp(&other.seq),
            ord => ord,
        }
        .reverse()
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.record.time() == other.record.time() && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

/// 待分派 record 的队列。
#[derive(Default)]
pub struct EventQueue {
    next_seq: u64,
    q: BinaryHeap<Scheduled>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: EventRecord) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.q.push(Scheduled { seq, record });
    }

    /// 取出时间最早者；同一时刻先入先出。
    pub fn pop(&mut self) -> Option<EventRecord> {
        self.q.pop().map(|s| s.record)
    }

    pub fn peek_time(&self) -> Option<SimTime> {
        self.q.peek().map(|s| s.record.time())
    }

    pub fn len(&self) -> usize {
        self.q.len()
    }

    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }
}
