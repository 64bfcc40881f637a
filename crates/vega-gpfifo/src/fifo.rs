use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::entry::GpEntry;

/// Blocking queue of pending GPFIFO entries between guest submission and the
/// channel thread draining them.
pub struct PushbufferFifo {
    state: Mutex<FifoState>,
    cond: Condvar,
}

#[derive(Default)]
struct FifoState {
    entries: VecDeque<GpEntry>,
    shutdown: bool,
}

impl PushbufferFifo {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FifoState::default()),
            cond: Condvar::new(),
        }
    }

    /// Appends submitted entries; never blocks the submitter.
    pub fn push(&self, entries: &[GpEntry]) {
        let mut state = self.state.lock().unwrap();
        state.entries.extend(entries.iter().copied());
        self.cond.notify_all();
    }

    /// Drains entries into `process` until [`PushbufferFifo::shutdown`] is
    /// called and the queue is empty, or `process` fails.
    pub fn run<E>(&self, mut process: impl FnMut(GpEntry) -> Result<(), E>) -> Result<(), E> {
        loop {
            let entry = {
                let mut state = self.state.lock().unwrap();
                loop {
                    if let Some(entry) = state.entries.pop_front() {
                        break entry;
                    }
                    if state.shutdown {
                        return Ok(());
                    }
                    state = self.cond.wait(state).unwrap();
                }
            };

            process(entry)?;
        }
    }

    /// Makes `run` return once the remaining entries are drained.
    pub fn shutdown(&self) {
        self.state.lock().unwrap().shutdown = true;
        self.cond.notify_all();
    }
}

impl Default for PushbufferFifo {
    fn default() -> Self {
        Self::new()
    }
}
