use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::thread::{ThreadHandle, PARKED_CORE_ID};
use crate::timer::PreemptionTimer;
use crate::{ticks_ns, YieldSignal};

/// Number of guest cores threads can be scheduled onto.
pub const CORE_COUNT: usize = 4;

/// Duration a thread at a core's preemption priority may run before it is
/// forcibly rotated out.
pub const PREEMPTIVE_TIMESLICE: Duration = Duration::from_millis(10);

type Queue = VecDeque<Arc<ThreadHandle>>;

/// Run queue and preemption configuration for one guest core.
pub struct CoreContext {
    pub id: u8,
    /// Threads at exactly this priority run under the preemption timer.
    preemption_priority: Option<u8>,
    queue: Mutex<Queue>,
    /// Signalled whenever the queue head may have changed.
    front_condition: Condvar,
}

impl CoreContext {
    fn new(id: u8, preemption_priority: Option<u8>) -> Self {
        Self {
            id,
            preemption_priority,
            queue: Mutex::new(Queue::new()),
            front_condition: Condvar::new(),
        }
    }
}

/// Priority-preemptive scheduler multiplexing guest threads onto per-core run
/// queues.
///
/// Only the thread at the head of a core's queue executes guest code; the
/// ordering invariant (descending priority, insertion order within a priority)
/// is maintained by every mutation. All waiting is done on per-core condition
/// variables; yield requests towards running threads go through the embedder's
/// [`YieldSignal`].
pub struct Scheduler {
    cores: Vec<CoreContext>,
    parked: Mutex<Queue>,
    parked_condition: Condvar,
    signal: Arc<dyn YieldSignal>,
    timer: PreemptionTimer,
}

impl Scheduler {
    /// A scheduler with [`CORE_COUNT`] cores and no preemption thresholds.
    pub fn new(signal: Arc<dyn YieldSignal>) -> Self {
        Self::with_cores(vec![None; CORE_COUNT], signal)
    }

    /// A scheduler with one core per entry; each entry optionally names the
    /// priority at which that core preempts.
    pub fn with_cores(preemption: Vec<Option<u8>>, signal: Arc<dyn YieldSignal>) -> Self {
        assert!(!preemption.is_empty(), "at least one core is required");
        let cores = preemption
            .into_iter()
            .enumerate()
            .map(|(id, priority)| CoreContext::new(id as u8, priority))
            .collect();
        Self {
            cores,
            parked: Mutex::new(Queue::new()),
            parked_condition: Condvar::new(),
            signal: Arc::clone(&signal),
            timer: PreemptionTimer::new(signal),
        }
    }

    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    fn core(&self, id: u8) -> &CoreContext {
        &self.cores[id as usize]
    }

    /// Insertion point keeping the queue sorted by descending priority with
    /// ties behind existing entries of the same priority.
    fn insertion_index(queue: &Queue, priority: u8) -> usize {
        queue.partition_point(|thread| thread.priority() >= priority)
    }

    /// Requests that `thread` yields, suppressing redundant signals and
    /// avoiding a self-signal when the displaced thread is the caller (the
    /// handler would deadlock on the lock the caller is holding).
    fn request_yield(&self, thread: &Arc<ThreadHandle>) {
        if thread.is_current_host_thread() {
            thread.pending_yield.store(true, Ordering::Release);
        } else if !thread.pending_yield.swap(true, Ordering::AcqRel) {
            self.signal.send_yield(thread);
        }
    }

    /// Inserts the thread into its current core's queue at its priority
    /// position.
    ///
    /// If the insertion displaces the queue head, the displaced thread is
    /// re-inserted behind threads of equal or higher priority, marked
    /// force-yielded and asked to yield.
    pub fn insert_thread(&self, thread: &Arc<ThreadHandle>) {
        let core = self.core(thread.core_id());
        let mut queue = core.queue.lock().unwrap();

        let index = Self::insertion_index(&queue, thread.priority());
        if index == 0 && !queue.is_empty() {
            let front = queue.pop_front().unwrap();
            front.force_yield.store(true, Ordering::Release);
            let behind = Self::insertion_index(&queue, front.priority());
            queue.insert(behind, Arc::clone(&front));
            queue.push_front(Arc::clone(thread));

            trace!(
                thread = thread.id(),
                displaced = front.id(),
                core = core.id,
                "insertion displaced the queue head"
            );
            self.request_yield(&front);
        } else {
            queue.insert(index, Arc::clone(thread));
        }

        core.front_condition.notify_all();
    }

    /// Arms the preemption timer when the thread's priority is the core's
    /// preemption priority, and stamps the timeslice start.
    fn begin_timeslice(&self, core: &CoreContext, thread: &Arc<ThreadHandle>) {
        if core.preemption_priority == Some(thread.priority()) {
            self.timer.arm(thread, Instant::now() + PREEMPTIVE_TIMESLICE);
        }
        thread.timeslice_start.store(ticks_ns(), Ordering::Release);
    }

    /// Blocks until the thread reaches the head of its core's queue.
    ///
    /// A thread with multi-core affinity retries with a doubling timeout: on
    /// each expiry it load balances and, if that migrated it, re-inserts
    /// itself on the new core before waiting again.
    pub fn wait_schedule(&self, thread: &Arc<ThreadHandle>) {
        let mut core = self.core(thread.core_id());
        let not_head =
            |queue: &mut Queue| !queue.front().is_some_and(|front| Arc::ptr_eq(front, thread));

        let mut queue = core.queue.lock().unwrap();
        if thread.affinity_mask().count_ones() > 1 {
            let mut threshold = PREEMPTIVE_TIMESLICE * 2;
            loop {
                let (guard, result) = core
                    .front_condition
                    .wait_timeout_while(queue, threshold, not_head)
                    .unwrap();
                queue = guard;
                if !result.timed_out() {
                    break;
                }

                drop(queue);
                self.load_balance(thread);
                if thread.core_id() != core.id {
                    self.insert_thread(thread);
                    core = self.core(thread.core_id());
                }
                queue = core.queue.lock().unwrap();
                if !not_head(&mut *queue) {
                    break;
                }

                // Doubling the threshold keeps a thread that never wins the
                // balance from spending all its time re-balancing.
                threshold *= 2;
            }
        } else {
            queue = core
                .front_condition
                .wait_while(queue, not_head)
                .unwrap();
        }

        self.begin_timeslice(core, thread);
        drop(queue);
    }

    /// [`Scheduler::wait_schedule`] with an overall timeout; returns whether
    /// the thread reached the head.
    pub fn timed_wait_schedule(&self, thread: &Arc<ThreadHandle>, timeout: Duration) -> bool {
        let core = self.core(thread.core_id());
        let not_head =
            |queue: &mut Queue| !queue.front().is_some_and(|front| Arc::ptr_eq(front, thread));

        let queue = core.queue.lock().unwrap();
        let (mut queue, _) = core
            .front_condition
            .wait_timeout_while(queue, timeout, not_head)
            .unwrap();

        if not_head(&mut *queue) {
            false
        } else {
            self.begin_timeslice(core, thread);
            true
        }
    }

    /// Moves the thread to the affinity-permitted core where its estimated
    /// wait until reaching the head is smallest; ties prefer the current core
    /// since migration is not free.
    ///
    /// The estimate sums the running thread's remaining time and the average
    /// timeslice of every queued thread of equal or higher priority.
    pub fn load_balance(&self, thread: &Arc<ThreadHandle>) {
        let current_core_id = thread.core_id();
        if current_core_id == PARKED_CORE_ID {
            return;
        }
        let affinity = thread.affinity_mask();
        if affinity.count_ones() <= 1 {
            return;
        }

        let _migration = thread.migration_lock.lock().unwrap();

        let priority = thread.priority();
        let mut optimal: Option<(u8, u64)> = None;
        for core in &self.cores {
            if affinity & (1u64 << core.id) == 0 {
                continue;
            }

            let mut wait = 0u64;
            {
                let queue = core.queue.lock().unwrap();
                let mut residents = queue.iter();
                if let Some(running) = residents.next() {
                    let average = running.average_timeslice();
                    let start = running.timeslice_start.load(Ordering::Acquire);
                    let elapsed = ticks_ns().saturating_sub(start);
                    wait += if average != 0 {
                        average.saturating_sub(elapsed).max(1)
                    } else if start != 0 {
                        elapsed.max(1)
                    } else {
                        1
                    };

                    for resident in residents {
                        if resident.priority() >= priority {
                            wait += resident.average_timeslice().max(1);
                        }
                    }
                }
            }

            let better = match optimal {
                None => true,
                Some((_, best)) => wait < best || (wait == best && core.id == current_core_id),
            };
            if better {
                optimal = Some((core.id, wait));
            }
        }

        let Some((target, _)) = optimal else { return };
        if target == current_core_id {
            trace!(thread = thread.id(), core = current_core_id, "load balance kept core");
            return;
        }

        {
            let old = self.core(current_core_id);
            let mut queue = old.queue.lock().unwrap();
            if let Some(position) = queue.iter().position(|t| Arc::ptr_eq(t, thread)) {
                queue.remove(position);
                old.front_condition.notify_all();
            }
        }
        thread.set_core_id(target);
        debug!(
            thread = thread.id(),
            from = current_core_id,
            to = target,
            "load balanced"
        );
    }

    /// Ends the calling thread's timeslice, splicing it behind queued threads
    /// of equal or higher priority.
    ///
    /// `cooperative` indicates a voluntary yield; a cooperative yield of a
    /// thread under the preemption timer disarms the timer.
    ///
    /// # Panics
    ///
    /// Panics if the thread is neither at the head of its core's queue nor
    /// force-yielded; that means the run queues have desynchronized from the
    /// guest and continuing would corrupt scheduling state.
    pub fn rotate(&self, thread: &Arc<ThreadHandle>, cooperative: bool) {
        let core = self.core(thread.core_id());
        {
            let mut queue = core.queue.lock().unwrap();
            if queue.front().is_some_and(|front| Arc::ptr_eq(front, thread)) {
                thread.fold_timeslice(ticks_ns());
                queue.pop_front();
                let index = Self::insertion_index(&queue, thread.priority());
                queue.insert(index, Arc::clone(thread));
            } else if !thread.force_yield.load(Ordering::Acquire) {
                panic!(
                    "T{} rotated while neither at the head of C{}'s queue nor force-yielded",
                    thread.id(),
                    core.id
                );
            }

            thread.force_yield.store(false, Ordering::Release);
            thread.pending_yield.store(false, Ordering::Release);
            core.front_condition.notify_all();
        }

        if cooperative && thread.preemption_armed.load(Ordering::Acquire) {
            self.timer.disarm(thread);
        }
    }

    /// Re-splices the thread at a new priority, signalling whichever thread
    /// lost the queue head as a result and keeping the preemption timer
    /// consistent with the new priority.
    pub fn update_priority(&self, thread: &Arc<ThreadHandle>, priority: u8) {
        let _migration = thread.migration_lock.lock().unwrap();
        if thread.priority() == priority {
            return;
        }
        thread.set_priority(priority);

        let core_id = thread.core_id();
        if core_id == PARKED_CORE_ID {
            let mut parked = self.parked.lock().unwrap();
            if let Some(position) = parked.iter().position(|t| Arc::ptr_eq(t, thread)) {
                parked.remove(position);
                let index = Self::insertion_index(&parked, priority);
                parked.insert(index, Arc::clone(thread));
            }
            return;
        }

        let core = self.core(core_id);
        let mut queue = core.queue.lock().unwrap();
        let Some(position) = queue.iter().position(|t| Arc::ptr_eq(t, thread)) else {
            // Not queued; the new priority takes effect on the next insertion.
            return;
        };

        let was_head = position == 0;
        queue.remove(position);
        let index = Self::insertion_index(&queue, priority);
        queue.insert(index, Arc::clone(thread));
        let is_head = index == 0;

        if is_head && !was_head {
            // The previous head sits right behind the promoted thread now.
            let displaced = Arc::clone(&queue[1]);
            displaced.force_yield.store(true, Ordering::Release);
            self.request_yield(&displaced);
        } else if was_head && !is_head {
            // Demoted below another thread while running.
            thread.force_yield.store(true, Ordering::Release);
            self.request_yield(thread);
        }

        // Keep the preemption timer consistent for a thread that stays
        // running at its new priority.
        if was_head && is_head {
            let preempting = core.preemption_priority == Some(priority);
            if preempting && !thread.preemption_armed.load(Ordering::Acquire) {
                self.timer.arm(thread, Instant::now() + PREEMPTIVE_TIMESLICE);
            } else if !preempting && thread.preemption_armed.load(Ordering::Acquire) {
                self.timer.disarm(thread);
            }
        }

        core.front_condition.notify_all();
    }

    /// Removes the thread from its run queue and blocks it on the global
    /// parked queue until another thread wakes it onto a real core.
    ///
    /// On return the thread is queued on no core; the caller is expected to
    /// follow up with [`Scheduler::insert_thread`] and
    /// [`Scheduler::wait_schedule`].
    pub fn park_thread(&self, thread: &Arc<ThreadHandle>) {
        {
            let _migration = thread.migration_lock.lock().unwrap();
            self.remove_thread(thread);
            let mut parked = self.parked.lock().unwrap();
            let index = Self::insertion_index(&parked, thread.priority());
            parked.insert(index, Arc::clone(thread));
            thread.set_core_id(PARKED_CORE_ID);
        }

        let mut parked = self.parked.lock().unwrap();
        while thread.core_id() == PARKED_CORE_ID {
            parked = self.parked_condition.wait(parked).unwrap();
        }
    }

    /// Wakes the most urgent parked thread onto the running thread's core if
    /// it would have equal-or-higher scheduling urgency there.
    pub fn wake_parked_thread(&self, running: &Arc<ThreadHandle>) {
        let mut parked = self.parked.lock().unwrap();

        let core = self.core(running.core_id());
        let next_priority = {
            let queue = core.queue.lock().unwrap();
            queue
                .get(1)
                .map(|next| next.priority())
                .filter(|&priority| priority == running.priority())
        };

        let eligible = parked.front().is_some_and(|front| {
            front.affinity_mask() & (1u64 << running.core_id()) != 0
                && front.priority() >= running.priority()
                && next_priority.map_or(true, |next| front.priority() > next)
        });

        if eligible {
            let woken = parked.pop_front().unwrap();
            woken.set_core_id(running.core_id());
            debug!(thread = woken.id(), core = running.core_id(), "woke parked thread");
            self.parked_condition.notify_all();
        }
    }

    /// Removes the thread from whichever queue holds it, folding its final
    /// timeslice into the average and waking the new head if it was running.
    pub fn remove_thread(&self, thread: &Arc<ThreadHandle>) {
        let core_id = thread.core_id();
        if core_id == PARKED_CORE_ID {
            let mut parked = self.parked.lock().unwrap();
            if let Some(position) = parked.iter().position(|t| Arc::ptr_eq(t, thread)) {
                parked.remove(position);
            }
        } else {
            let core = self.core(core_id);
            let mut queue = core.queue.lock().unwrap();
            if let Some(position) = queue.iter().position(|t| Arc::ptr_eq(t, thread)) {
                queue.remove(position);
                if position == 0 {
                    thread.fold_timeslice(ticks_ns());
                    core.front_condition.notify_all();
                }
            }
        }

        if thread.preemption_armed.load(Ordering::Acquire) {
            self.timer.disarm(thread);
        }
        thread.pending_yield.store(false, Ordering::Release);
        thread.force_yield.store(false, Ordering::Release);
    }

    /// Snapshot of a core's queue, head first. Intended for diagnostics and
    /// tests; the queue may change the moment the lock is released.
    pub fn queue_snapshot(&self, core_id: u8) -> Vec<Arc<ThreadHandle>> {
        self.core(core_id)
            .queue
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .collect()
    }
}
