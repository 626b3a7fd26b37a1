//! A bounded binary min-heap of jobs.

use std::cmp::Ordering;

use crate::types::job::Job;

/// Comparator ordering the heap. Must break ties on job id for FIFO
/// behaviour among equal keys.
pub type JobCmp = fn(&Job, &Job) -> Ordering;

/// The ready and delay queues are both instances of this heap, differing
/// only in comparator. `find` is a linear scan, which backs the rare
/// `peek <id>` path; the hot operations are all O(log n).
#[derive(Debug)]
pub struct JobHeap {
    slots: Vec<Job>,
    cap: usize,
    cmp: JobCmp,
}

impl JobHeap {
    pub fn new(cap: usize, cmp: JobCmp) -> Self {
        Self {
            slots: Vec::new(),
            cap,
            cmp,
        }
    }

    /// Inserts a job, or hands it back when the heap is at capacity.
    pub fn give(&mut self, j: Job) -> Result<(), Job> {
        if self.slots.len() >= self.cap {
            return Err(j);
        }

        self.slots.push(j);
        self.sift_up(self.slots.len() - 1);

        Ok(())
    }

    /// Removes and returns the minimum job.
    pub fn take(&mut self) -> Option<Job> {
        if self.slots.is_empty() {
            return None;
        }

        let last = self.slots.len() - 1;
        self.slots.swap(0, last);
        let j = self.slots.pop();

        if !self.slots.is_empty() {
            self.sift_down(0);
        }

        j
    }

    /// Returns the minimum job without removing it.
    pub fn peek(&self) -> Option<&Job> {
        self.slots.first()
    }

    /// Linear scan for a job by id.
    pub fn find(&self, id: u64) -> Option<&Job> {
        self.slots.iter().find(|j| j.id == id)
    }

    pub fn used(&self) -> usize {
        self.slots.len()
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.cap
    }

    fn less(&self, a: usize, b: usize) -> bool {
        (self.cmp)(&self.slots[a], &self.slots[b]) == Ordering::Less
    }

    fn sift_up(&mut self, mut at: usize) {
        while at > 0 {
            let parent = (at - 1) / 2;
            if !self.less(at, parent) {
                break;
            }
            self.slots.swap(at, parent);
            at = parent;
        }
    }

    fn sift_down(&mut self, mut at: usize) {
        loop {
            let left = 2 * at + 1;
            let right = left + 1;

            let mut smallest = at;
            if left < self.slots.len() && self.less(left, smallest) {
                smallest = left;
            }
            if right < self.slots.len() && self.less(right, smallest) {
                smallest = right;
            }

            if smallest == at {
                return;
            }
            self.slots.swap(at, smallest);
            at = smallest;
        }
    }
}
