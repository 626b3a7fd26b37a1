use std::cmp::Ordering;

use bytes::Bytes;
use tokio::time::Instant;

use super::states::JobState;

/// Jobs with a priority below this are counted as urgent.
pub const URGENT_THRESHOLD: u32 = 1024;

/// The unit of work held by the server.
///
/// A job is owned by exactly one collection at a time: the ready heap, the
/// delay heap, one connection's reservation set, or the graveyard. Moving a
/// job between states moves the value. The body is immutable once created,
/// so replies share the `Bytes` handle instead of copying.
#[derive(Debug)]
pub struct Job {
    pub id: u64,
    pub pri: u32,
    pub delay: u32,
    pub ttr: u32,
    pub body: Bytes,
    pub state: JobState,
    /// For `Delayed`: when the job becomes ready. For `Reserved`: when the
    /// reservation expires. Meaningless in other states.
    pub deadline: Instant,
    pub creation: Instant,
    pub timeout_ct: u64,
    pub release_ct: u64,
    pub bury_ct: u64,
    pub kick_ct: u64,
}

impl Job {
    pub fn new(id: u64, pri: u32, delay: u32, ttr: u32, body: Bytes, now: Instant) -> Self {
        Self {
            id,
            pri,
            delay,
            ttr,
            body,
            state: JobState::Invalid,
            deadline: now,
            creation: now,
            timeout_ct: 0,
            release_ct: 0,
            bury_ct: 0,
            kick_ct: 0,
        }
    }

    pub fn is_urgent(&self) -> bool {
        self.pri < URGENT_THRESHOLD
    }
}

/// Orders ready jobs by `(pri, id)` ascending.
///
/// The id tie-break keeps equal-priority jobs FIFO, because ids are assigned
/// monotonically. Fields are compared, never subtracted: ids span the full
/// u64 range.
pub fn pri_cmp(a: &Job, b: &Job) -> Ordering {
    match a.pri.cmp(&b.pri) {
        Ordering::Equal => a.id.cmp(&b.id),
        ord => ord,
    }
}

/// Orders delayed jobs by `(deadline, id)` ascending.
pub fn delay_cmp(a: &Job, b: &Job) -> Ordering {
    match a.deadline.cmp(&b.deadline) {
        Ordering::Equal => a.id.cmp(&b.id),
        ord => ord,
    }
}
