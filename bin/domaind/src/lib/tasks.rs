// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The slice of the task facility the engine consumes: subtask
//! annotation, progress reporting, and cooperative cancellation.
//!
//! The persistent task table and its RPC surface live in the orchestrator;
//! the engine only ever sees a [`Task`] handle threaded through long
//! operations. Cancellation is cooperative: loops consult
//! [`Task::check_cancel`] at each progress checkpoint and unwind through
//! the ordinary error path, so cleanup runs exactly as it would for any
//! other failure.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use domaind_api_types::Error;
use uuid::Uuid;

#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

struct TaskInner {
    id: Uuid,
    subtask: Mutex<Option<String>>,
    progress: AtomicU8,
    cancelled: AtomicBool,
}

impl Task {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TaskInner {
                id: Uuid::new_v4(),
                subtask: Mutex::new(None),
                progress: AtomicU8::new(0),
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Names the phase the operation is in, e.g. "waiting for guest".
    pub fn set_subtask(&self, name: &str) {
        *self.inner.subtask.lock().unwrap() = Some(name.to_owned());
    }

    pub fn subtask(&self) -> Option<String> {
        self.inner.subtask.lock().unwrap().clone()
    }

    /// Records progress in percent, clamped to [0, 100].
    pub fn set_progress(&self, percent: u8) {
        self.inner.progress.store(percent.min(100), Ordering::Relaxed);
    }

    pub fn progress(&self) -> u8 {
        self.inner.progress.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Relaxed);
    }

    /// Cancellation checkpoint. Every suspend/build/copy loop calls this
    /// once per iteration.
    pub fn check_cancel(&self) -> Result<(), Error> {
        if self.inner.cancelled.load(Ordering::Relaxed) {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for Task {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn progress_clamps_to_one_hundred() {
        let t = Task::new();
        t.set_progress(250);
        assert_eq!(t.progress(), 100);
        t.set_progress(42);
        assert_eq!(t.progress(), 42);
    }

    #[test]
    fn cancel_trips_the_checkpoint() {
        let t = Task::new();
        assert!(t.check_cancel().is_ok());
        t.cancel();
        assert!(matches!(t.check_cancel(), Err(Error::Cancelled)));

        // Clones observe the same flag.
        let t2 = t.clone();
        assert!(matches!(t2.check_cancel(), Err(Error::Cancelled)));
    }
}
