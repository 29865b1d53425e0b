//! Shared MPMC job queue with priority lanes and per-submitter caps.
//!
//! Two FIFO lanes, interactive and batch. A worker takes the oldest job of
//! the highest lane whose submitter is below `max_in_flight_per_submitter`;
//! a capped submitter's jobs stay queued (and keep their place) while other
//! submitters' jobs go ahead. The queue holds at most `max_depth` waiting
//! jobs; beyond that, submissions are refused.
//!
//! The lock covers enqueue/dequeue bookkeeping only. Workers park on a
//! condvar while nothing is eligible.

use crate::error::SubmitError;
use crate::types::Priority;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// A dequeued job handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub id: JobId,
    pub submitter: String,
}

#[derive(Default)]
struct QueueState {
    lanes: [VecDeque<Ticket>; 2],
    in_flight: HashMap<String, usize>,
    closed: bool,
}

impl QueueState {
    fn depth(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    fn take_eligible(&mut self, cap: usize) -> Option<Ticket> {
        for lane in &mut self.lanes {
            let in_flight = &self.in_flight;
            let pos = lane
                .iter()
                .position(|t| in_flight.get(&t.submitter).copied().unwrap_or(0) < cap);
            if let Some(ticket) = pos.and_then(|p| lane.remove(p)) {
                *self.in_flight.entry(ticket.submitter.clone()).or_default() += 1;
                return Some(ticket);
            }
        }
        None
    }
}

pub struct JobQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
    max_depth: usize,
    per_submitter: usize,
}

impl JobQueue {
    pub fn new(max_depth: usize, per_submitter: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            ready: Condvar::new(),
            max_depth,
            per_submitter: per_submitter.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, id: JobId, submitter: &str, priority: Priority) -> Result<(), SubmitError> {
        let mut state = self.lock();
        if state.closed {
            return Err(SubmitError::ShutDown);
        }
        let depth = state.depth();
        if depth >= self.max_depth {
            return Err(SubmitError::Overloaded { depth });
        }
        state.lanes[priority.lane()].push_back(Ticket {
            id,
            submitter: submitter.to_string(),
        });
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    /// Block until a job is eligible. `None` once the queue is closed.
    pub fn next_job(&self) -> Option<Ticket> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(ticket) = state.take_eligible(self.per_submitter) {
                return Some(ticket);
            }
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Release the submitter slot taken by [`next_job`](Self::next_job).
    pub fn finish(&self, submitter: &str) {
        let mut state = self.lock();
        if let Some(n) = state.in_flight.get_mut(submitter) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                state.in_flight.remove(submitter);
            }
        }
        drop(state);
        // A capped submitter's job may be eligible now.
        self.ready.notify_all();
    }

    /// Drop a job that hasn't been dequeued yet.
    pub fn remove_queued(&self, id: JobId) -> bool {
        let mut state = self.lock();
        for lane in &mut state.lanes {
            if let Some(pos) = lane.iter().position(|t| t.id == id) {
                lane.remove(pos);
                return true;
            }
        }
        false
    }

    /// Refuse new work, wake every worker, and return what was still waiting.
    pub fn close(&self) -> Vec<JobId> {
        let mut state = self.lock();
        state.closed = true;
        let drained = state
            .lanes
            .iter_mut()
            .flat_map(|lane| lane.drain(..))
            .map(|t| t.id)
            .collect();
        drop(state);
        self.ready.notify_all();
        drained
    }

    pub fn depth(&self) -> usize {
        self.lock().depth()
    }
}
