//! Bounded pool of concurrency slots with a FIFO wait queue.
//!
//! A task holds a slot for the duration of its executor call. When the pool
//! is full, callers enqueue instead of being rejected; releasing a slot
//! hands it directly to the head of the queue so a queued task can never be
//! overtaken by a newcomer.

use std::collections::{HashSet, VecDeque};

use crate::core::task::TaskId;

/// Concurrency slots keyed by task id, carrying a payload per queued entry.
#[derive(Debug)]
pub struct SlotPool<T> {
    /// Maximum number of simultaneously held slots.
    max: usize,
    /// Tasks currently holding a slot.
    active: HashSet<TaskId>,
    /// Tasks waiting for a slot, oldest first.
    queue: VecDeque<(TaskId, T)>,
    /// Highest number of slots ever held at once.
    peak: usize,
}

impl<T> SlotPool<T> {
    pub fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            active: HashSet::new(),
            queue: VecDeque::new(),
            peak: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.max
    }

    pub fn has_capacity(&self) -> bool {
        self.active.len() < self.max
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    pub fn peak(&self) -> usize {
        self.peak
    }

    pub fn is_active(&self, id: &TaskId) -> bool {
        self.active.contains(id)
    }

    /// 1-based queue position.
    pub fn position(&self, id: &TaskId) -> Option<usize> {
        self.queue
            .iter()
            .position(|(queued, _)| queued == id)
            .map(|index| index + 1)
    }

    /// Take a slot for `id`. Fails when the pool is full or `id` already
    /// holds one. Queued tasks take precedence: nothing is acquired while
    /// the queue is non-empty.
    pub fn try_acquire(&mut self, id: TaskId) -> bool {
        if !self.has_capacity() || !self.queue.is_empty() || self.active.contains(&id) {
            return false;
        }
        self.active.insert(id);
        self.peak = self.peak.max(self.active.len());
        true
    }

    /// Queue `id` for the next free slot; returns its position. A task
    /// already in the queue keeps its place.
    pub fn enqueue(&mut self, id: TaskId, payload: T) -> usize {
        if let Some(position) = self.position(&id) {
            return position;
        }
        self.queue.push_back((id, payload));
        self.queue.len()
    }

    /// Release the slot held by `id`.
    ///
    /// If a task is waiting, the freed slot is reserved for it and the
    /// entry is returned; the caller must run it (or release it again).
    pub fn release(&mut self, id: &TaskId) -> Option<(TaskId, T)> {
        if !self.active.remove(id) {
            return None;
        }
        self.reserve_next()
    }

    /// Move the head of the queue into a free slot, if both exist.
    pub fn reserve_next(&mut self) -> Option<(TaskId, T)> {
        if !self.has_capacity() {
            return None;
        }
        let (next, payload) = self.queue.pop_front()?;
        self.active.insert(next);
        self.peak = self.peak.max(self.active.len());
        Some((next, payload))
    }

    /// Drop a queued entry (task evicted while waiting).
    pub fn remove_queued(&mut self, id: &TaskId) -> Option<T> {
        let index = self.queue.iter().position(|(queued, _)| queued == id)?;
        self.queue.remove(index).map(|(_, payload)| payload)
    }
}
