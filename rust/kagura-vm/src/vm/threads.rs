//! Cooperative thread bookkeeping: the ready queue and the waiting set.

use super::frames::FrameId;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

/// Identifier of a script thread, unique for the machine's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ThreadId(pub u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

#[derive(Debug)]
pub(crate) struct Thread {
    /// Frame the thread was spawned with; leaving it ends the thread.
    pub(crate) root: FrameId,
    /// Innermost executing frame.
    pub(crate) current: FrameId,
    /// Frames entered above `root`.
    pub(crate) depth: usize,
}

#[derive(Debug, Default)]
pub(crate) struct ThreadSet {
    threads: BTreeMap<ThreadId, Thread>,
    ready: VecDeque<ThreadId>,
    waiting: BTreeMap<ThreadId, u32>,
    next_id: u64,
}

impl ThreadSet {
    /// Register a thread rooted at `root` and queue it at the back.
    pub(crate) fn spawn(&mut self, root: FrameId) -> ThreadId {
        let id = ThreadId(self.next_id);
        self.next_id += 1;
        self.threads.insert(
            id,
            Thread {
                root,
                current: root,
                depth: 0,
            },
        );
        self.ready.push_back(id);
        id
    }

    pub(crate) fn get(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        self.threads.get_mut(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.threads.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.threads.keys().copied()
    }

    /// Next runnable thread; entries of removed threads are skipped.
    pub(crate) fn next_ready(&mut self) -> Option<ThreadId> {
        while let Some(id) = self.ready.pop_front() {
            if self.threads.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }

    pub(crate) fn requeue(&mut self, id: ThreadId) {
        self.ready.push_back(id);
    }

    pub(crate) fn park(&mut self, id: ThreadId, ticks: u32) {
        self.waiting.insert(id, ticks);
    }

    pub(crate) fn waiting_ticks(&self, id: ThreadId) -> Option<u32> {
        self.waiting.get(&id).copied()
    }

    /// Count one tick off every waiter and queue the ones that are due, in
    /// thread-id order. Returns how many woke.
    pub(crate) fn wake_elapsed(&mut self) -> usize {
        let mut due = Vec::new();
        for (id, ticks) in self.waiting.iter_mut() {
            *ticks = ticks.saturating_sub(1);
            if *ticks == 0 {
                due.push(*id);
            }
        }
        for id in &due {
            self.waiting.remove(id);
            self.ready.push_back(*id);
        }
        due.len()
    }

    pub(crate) fn remove(&mut self, id: ThreadId) -> Option<Thread> {
        self.waiting.remove(&id);
        self.threads.remove(&id)
    }
}
