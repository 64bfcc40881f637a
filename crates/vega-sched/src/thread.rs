use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::thread::ThreadId;

/// Sentinel core id for a thread sitting in the parked queue.
pub const PARKED_CORE_ID: u8 = u8::MAX;

/// Scheduling state for one guest thread.
///
/// Priorities are "numerically higher is more urgent"; run queues are kept
/// sorted by descending priority with ties in insertion order.
#[derive(Debug)]
pub struct ThreadHandle {
    id: u64,
    priority: AtomicU8,
    ideal_core: u8,
    affinity_mask: AtomicU64,
    core_id: AtomicU8,

    /// Tick at which the current timeslice started; 0 when not running.
    pub(crate) timeslice_start: AtomicU64,
    /// Exponentially weighted average timeslice duration in ticks.
    pub(crate) average_timeslice: AtomicU64,

    /// Whether the preemption timer is armed for this thread.
    pub(crate) preemption_armed: AtomicBool,
    /// A yield has already been requested; suppresses redundant signals.
    pub(crate) pending_yield: AtomicBool,
    /// The thread was displaced from the queue head without its cooperation;
    /// permits the next `rotate` even though it is no longer at the head.
    pub(crate) force_yield: AtomicBool,

    /// Serializes core-assignment decisions for this thread.
    pub(crate) migration_lock: Mutex<()>,

    /// Identity of the host thread currently executing this guest thread.
    pub(crate) host_thread: Mutex<Option<ThreadId>>,
}

impl ThreadHandle {
    pub fn new(id: u64, priority: u8, ideal_core: u8, affinity_mask: u64) -> Self {
        Self {
            id,
            priority: AtomicU8::new(priority),
            ideal_core,
            affinity_mask: AtomicU64::new(affinity_mask),
            core_id: AtomicU8::new(ideal_core),
            timeslice_start: AtomicU64::new(0),
            average_timeslice: AtomicU64::new(0),
            preemption_armed: AtomicBool::new(false),
            pending_yield: AtomicBool::new(false),
            force_yield: AtomicBool::new(false),
            migration_lock: Mutex::new(()),
            host_thread: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn priority(&self) -> u8 {
        self.priority.load(Ordering::Acquire)
    }

    pub(crate) fn set_priority(&self, priority: u8) {
        self.priority.store(priority, Ordering::Release);
    }

    pub fn ideal_core(&self) -> u8 {
        self.ideal_core
    }

    pub fn affinity_mask(&self) -> u64 {
        self.affinity_mask.load(Ordering::Acquire)
    }

    pub fn set_affinity_mask(&self, mask: u64) {
        self.affinity_mask.store(mask, Ordering::Release);
    }

    pub fn core_id(&self) -> u8 {
        self.core_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_core_id(&self, core_id: u8) {
        self.core_id.store(core_id, Ordering::Release);
    }

    pub fn average_timeslice(&self) -> u64 {
        self.average_timeslice.load(Ordering::Acquire)
    }

    /// Whether a yield request is pending for this thread.
    pub fn yield_pending(&self) -> bool {
        self.pending_yield.load(Ordering::Acquire)
    }

    /// Whether this thread is currently running under the preemption timer.
    pub fn preemption_armed(&self) -> bool {
        self.preemption_armed.load(Ordering::Acquire)
    }

    /// Binds this guest thread to the calling host thread.
    ///
    /// Must be called by the host thread driving the guest thread before it
    /// enters the scheduler; the scheduler uses the binding to avoid sending a
    /// thread a signal it would have to handle while holding the very lock the
    /// handler needs.
    pub fn attach_host_thread(&self) {
        *self.host_thread.lock().unwrap() = Some(std::thread::current().id());
    }

    pub(crate) fn is_current_host_thread(&self) -> bool {
        *self.host_thread.lock().unwrap() == Some(std::thread::current().id())
    }

    /// Updates the average timeslice with the duration since `timeslice_start`
    /// and clears the running state.
    ///
    /// Weighting is the standard EWMA `avg = avg/4 + 3*elapsed/4`.
    pub(crate) fn fold_timeslice(&self, now: u64) {
        let start = self.timeslice_start.swap(0, Ordering::AcqRel);
        if start == 0 {
            return;
        }
        let elapsed = now.saturating_sub(start);
        let average = self.average_timeslice.load(Ordering::Acquire);
        self.average_timeslice
            .store(average / 4 + 3 * elapsed / 4, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;

    #[test]
    fn timeslice_average_is_weighted_towards_recent_slices() {
        let thread = ThreadHandle::new(0, 5, 0, 0b1);

        thread.timeslice_start.store(1_000, Ordering::Release);
        thread.fold_timeslice(5_000);
        assert_eq!(thread.average_timeslice(), 3_000);
        assert_eq!(thread.timeslice_start.load(Ordering::Acquire), 0);

        thread.timeslice_start.store(10_000, Ordering::Release);
        thread.fold_timeslice(18_000);
        assert_eq!(thread.average_timeslice(), 3_000 / 4 + 3 * 8_000 / 4);
    }

    #[test]
    fn fold_without_a_running_timeslice_is_a_no_op() {
        let thread = ThreadHandle::new(0, 5, 0, 0b1);
        thread.fold_timeslice(5_000);
        assert_eq!(thread.average_timeslice(), 0);
    }
}
