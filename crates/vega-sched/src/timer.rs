use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use crate::thread::ThreadHandle;
use crate::YieldSignal;

/// Replacement for the kernel interval timer used for preemption: a single
/// worker thread tracks the armed deadlines of all preempted-priority threads
/// and delivers a yield signal when one expires.
pub(crate) struct PreemptionTimer {
    shared: Arc<TimerShared>,
    worker: Option<JoinHandle<()>>,
}

struct TimerShared {
    state: Mutex<TimerState>,
    cond: Condvar,
    signal: Arc<dyn YieldSignal>,
}

#[derive(Default)]
struct TimerState {
    armed: Vec<(Instant, Arc<ThreadHandle>)>,
    shutdown: bool,
}

impl PreemptionTimer {
    pub(crate) fn new(signal: Arc<dyn YieldSignal>) -> Self {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState::default()),
            cond: Condvar::new(),
            signal,
        });

        let worker = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("preemption-timer".into())
                .spawn(move || shared.run())
                .expect("failed to spawn preemption timer thread")
        };

        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Arms a deadline for the thread, replacing any previous one.
    pub(crate) fn arm(&self, thread: &Arc<ThreadHandle>, deadline: Instant) {
        let mut state = self.shared.state.lock().unwrap();
        state.armed.retain(|(_, armed)| !Arc::ptr_eq(armed, thread));
        state.armed.push((deadline, Arc::clone(thread)));
        thread.preemption_armed.store(true, Ordering::Release);
        self.shared.cond.notify_all();
    }

    /// Disarms the thread's deadline, if any.
    pub(crate) fn disarm(&self, thread: &Arc<ThreadHandle>) {
        let mut state = self.shared.state.lock().unwrap();
        state.armed.retain(|(_, armed)| !Arc::ptr_eq(armed, thread));
        thread.preemption_armed.store(false, Ordering::Release);
        self.shared.cond.notify_all();
    }
}

impl Drop for PreemptionTimer {
    fn drop(&mut self) {
        self.shared.state.lock().unwrap().shutdown = true;
        self.shared.cond.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl TimerShared {
    fn run(&self) {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.shutdown {
                return;
            }

            let now = Instant::now();
            let next = state
                .armed
                .iter()
                .map(|(deadline, _)| *deadline)
                .min();

            match next {
                Some(deadline) if deadline <= now => {
                    // Fire every expired deadline before sleeping again.
                    let mut expired = Vec::new();
                    state.armed.retain(|(deadline, thread)| {
                        if *deadline <= now {
                            expired.push(Arc::clone(thread));
                            false
                        } else {
                            true
                        }
                    });

                    drop(state);
                    for thread in expired {
                        thread.preemption_armed.store(false, Ordering::Release);
                        // Mirror the insert-thread path: suppress the signal if
                        // a yield is already on its way.
                        if !thread.pending_yield.swap(true, Ordering::AcqRel) {
                            self.signal.send_yield(&thread);
                        }
                    }
                    state = self.state.lock().unwrap();
                }
                Some(deadline) => {
                    let timeout = deadline.duration_since(now);
                    state = self.cond.wait_timeout(state, timeout).unwrap().0;
                }
                None => {
                    state = self.cond.wait(state).unwrap();
                }
            }
        }
    }
}
