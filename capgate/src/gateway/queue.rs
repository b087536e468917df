//! Four-level priority queue with bounded concurrency
//!
//! Work enqueued while the concurrency budget is exhausted parks in its
//! priority level; each completion dequeues the highest non-empty level.
//! Strict fairness is not a goal — a saturated higher level may starve
//! lower ones.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Request priority, highest first
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Dispatched before everything else
    Critical,
    /// Above normal traffic
    High,
    /// Default level
    #[default]
    Normal,
    /// Background work
    Low,
}

impl Priority {
    const LEVELS: usize = 4;

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Normal => write!(f, "normal"),
            Self::Low => write!(f, "low"),
        }
    }
}

type Job = BoxFuture<'static, ()>;

struct State {
    levels: [VecDeque<Job>; Priority::LEVELS],
    active: usize,
    concurrency: usize,
}

impl State {
    fn pop_highest(&mut self) -> Option<Job> {
        self.levels.iter_mut().find_map(VecDeque::pop_front)
    }

    fn depth(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }
}

/// Shared scheduler for queued gateway requests
#[derive(Clone)]
pub struct RequestQueue {
    state: Arc<Mutex<State>>,
}

impl RequestQueue {
    /// Create a queue with the given concurrency bound
    pub fn new(concurrency: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                levels: Default::default(),
                active: 0,
                concurrency: concurrency.max(1),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Change the concurrency bound; queued work drains under the new bound
    pub fn configure(&self, concurrency: usize) {
        let mut state = self.lock();
        state.concurrency = concurrency.max(1);
    }

    /// Submit work at a priority level
    ///
    /// The job runs immediately when a concurrency slot is free, otherwise
    /// it parks until completions drain down to it. Completion is reported
    /// through whatever channel the job itself carries.
    pub fn enqueue(&self, priority: Priority, job: impl std::future::Future<Output = ()> + Send + 'static) {
        let run_now = {
            let mut state = self.lock();
            if state.active < state.concurrency {
                state.active += 1;
                true
            } else {
                state.levels[priority.index()].push_back(Box::pin(job));
                return;
            }
        };
        if run_now {
            self.spawn(Box::pin(job));
        }
    }

    fn spawn(&self, job: Job) {
        let queue = self.clone();
        tokio::spawn(async move {
            let mut job = job;
            loop {
                job.await;
                let next = {
                    let mut state = queue.lock();
                    if state.active > state.concurrency {
                        // Concurrency was lowered mid-flight; retire the slot.
                        state.active -= 1;
                        None
                    } else {
                        match state.pop_highest() {
                            Some(next) => Some(next),
                            None => {
                                state.active -= 1;
                                None
                            }
                        }
                    }
                };
                match next {
                    Some(next) => job = next,
                    None => break,
                }
            }
        });
    }

    /// Parked jobs across all levels
    pub fn depth(&self) -> usize {
        self.lock().depth()
    }

    /// Jobs currently running
    pub fn active(&self) -> usize {
        self.lock().active
    }
}
