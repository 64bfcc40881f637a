//! Priority-preemptive scheduling of guest threads onto host cores.
//!
//! Each guest thread is backed by a real host thread; per-core run queues
//! decide which of them gets to execute guest code at any moment. Only the
//! thread at the head of its core's queue runs; everyone else blocks in
//! [`Scheduler::wait_schedule`]. Preemption is reconstructed without OS
//! signals: a yield request is delivered through the embedder's
//! [`YieldSignal`] (which must interrupt whatever blocking operation the guest
//! thread is in), and the interrupted thread then re-enters the scheduler
//! cooperatively via [`Scheduler::rotate`].

mod scheduler;
mod thread;
mod timer;

pub use scheduler::{CoreContext, Scheduler, CORE_COUNT, PREEMPTIVE_TIMESLICE};
pub use thread::{ThreadHandle, PARKED_CORE_ID};

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Instant;

/// Delivery of asynchronous yield requests to a running guest thread.
///
/// Fire-and-forget: the only contract is that the thread's host-side handler
/// will eventually run (and call [`Scheduler::rotate`]) or the thread is dead.
///
/// `send_yield` may be invoked while scheduler locks are held, so
/// implementations must not call back into the scheduler synchronously; they
/// should only interrupt the target thread's blocking operation.
pub trait YieldSignal: Send + Sync {
    fn send_yield(&self, thread: &Arc<ThreadHandle>);
}

/// Monotonic nanosecond tick count from a process-wide epoch.
///
/// Timeslice accounting only ever compares differences of these values, so the
/// epoch itself is arbitrary.
pub fn ticks_ns() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}
