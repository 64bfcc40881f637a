use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use vega_sched::{Scheduler, ThreadHandle, YieldSignal, PREEMPTIVE_TIMESLICE};

/// Records which threads were asked to yield instead of interrupting anyone.
#[derive(Default)]
struct RecordingSignal {
    yields: Mutex<Vec<u64>>,
}

impl YieldSignal for RecordingSignal {
    fn send_yield(&self, thread: &Arc<ThreadHandle>) {
        self.yields.lock().unwrap().push(thread.id());
    }
}

fn scheduler() -> (Arc<Scheduler>, Arc<RecordingSignal>) {
    let signal = Arc::new(RecordingSignal::default());
    (
        Arc::new(Scheduler::with_cores(vec![None, None], signal.clone())),
        signal,
    )
}

fn ids(queue: &[Arc<ThreadHandle>]) -> Vec<u64> {
    queue.iter().map(|thread| thread.id()).collect()
}

#[test]
fn higher_priority_insertion_displaces_and_signals_the_head() {
    let (scheduler, signal) = scheduler();

    let low = Arc::new(ThreadHandle::new(3, 3, 0, 0b1));
    let high = Arc::new(ThreadHandle::new(5, 5, 0, 0b1));

    scheduler.insert_thread(&low);
    scheduler.insert_thread(&high);

    assert_eq!(ids(&scheduler.queue_snapshot(0)), vec![5, 3]);
    assert_eq!(*signal.yields.lock().unwrap(), vec![3]);
    assert!(low.yield_pending());
}

#[test]
fn redundant_yield_signals_are_suppressed() {
    let (scheduler, signal) = scheduler();

    let low = Arc::new(ThreadHandle::new(1, 3, 0, 0b1));
    scheduler.insert_thread(&low);

    let first_high = Arc::new(ThreadHandle::new(2, 5, 0, 0b1));
    scheduler.insert_thread(&first_high);
    assert_eq!(*signal.yields.lock().unwrap(), vec![1]);

    // The low thread has not processed its yield yet when the head changes
    // again; it must not be signalled a second time.
    scheduler.remove_thread(&first_high);
    let second_high = Arc::new(ThreadHandle::new(3, 5, 0, 0b1));
    scheduler.insert_thread(&second_high);

    assert!(low.yield_pending());
    assert_eq!(*signal.yields.lock().unwrap(), vec![1]);
}

#[test]
fn equal_priorities_keep_insertion_order() {
    let (scheduler, _) = scheduler();

    for id in 0..3 {
        let thread = Arc::new(ThreadHandle::new(id, 5, 0, 0b1));
        scheduler.insert_thread(&thread);
    }
    let low = Arc::new(ThreadHandle::new(9, 3, 0, 0b1));
    scheduler.insert_thread(&low);

    assert_eq!(ids(&scheduler.queue_snapshot(0)), vec![0, 1, 2, 9]);
}

#[test]
fn rotate_splices_the_head_behind_its_priority_class() {
    let (scheduler, _) = scheduler();

    let threads: Vec<_> = (0..3)
        .map(|id| Arc::new(ThreadHandle::new(id, 5, 0, 0b1)))
        .collect();
    for thread in &threads {
        scheduler.insert_thread(thread);
    }

    scheduler.rotate(&threads[0], true);
    assert_eq!(ids(&scheduler.queue_snapshot(0)), vec![1, 2, 0]);
}

#[test]
#[should_panic(expected = "rotated while neither")]
fn rotate_of_an_unqueued_thread_is_fatal() {
    let (scheduler, _) = scheduler();
    let stray = Arc::new(ThreadHandle::new(7, 5, 0, 0b1));
    scheduler.rotate(&stray, true);
}

#[test]
fn priority_update_resplices_and_signals_the_old_head() {
    let (scheduler, signal) = scheduler();

    let a = Arc::new(ThreadHandle::new(1, 5, 0, 0b1));
    let b = Arc::new(ThreadHandle::new(2, 3, 0, 0b1));
    scheduler.insert_thread(&a);
    scheduler.insert_thread(&b);
    assert_eq!(ids(&scheduler.queue_snapshot(0)), vec![1, 2]);

    scheduler.update_priority(&b, 7);

    assert_eq!(ids(&scheduler.queue_snapshot(0)), vec![2, 1]);
    assert_eq!(b.priority(), 7);
    assert_eq!(*signal.yields.lock().unwrap(), vec![1]);
}

#[test]
fn load_balance_respects_the_affinity_mask() {
    let (scheduler, _) = scheduler();

    // Core 0 is busy with a long-lived resident.
    let resident = Arc::new(ThreadHandle::new(1, 5, 0, 0b01));
    scheduler.insert_thread(&resident);

    // A single-affinity thread never migrates, however busy its core is.
    let pinned = Arc::new(ThreadHandle::new(2, 5, 0, 0b01));
    scheduler.insert_thread(&pinned);
    scheduler.load_balance(&pinned);
    assert_eq!(pinned.core_id(), 0);

    // A multi-affinity thread moves to the idle core.
    let roaming = Arc::new(ThreadHandle::new(3, 5, 0, 0b11));
    scheduler.insert_thread(&roaming);
    scheduler.load_balance(&roaming);
    assert_eq!(roaming.core_id(), 1);
    assert!(!scheduler
        .queue_snapshot(0)
        .iter()
        .any(|thread| thread.id() == 3));
}

#[test]
fn load_balance_ties_stay_on_the_current_core() {
    let (scheduler, _) = scheduler();

    // Each core carries one head with no timeslice history, so both wait
    // estimates come out identical.
    let resident = Arc::new(ThreadHandle::new(1, 5, 0, 0b01));
    scheduler.insert_thread(&resident);

    let thread = Arc::new(ThreadHandle::new(2, 5, 1, 0b11));
    scheduler.insert_thread(&thread);

    scheduler.load_balance(&thread);

    // Core 0 is scanned first; the tie must still keep the thread on core 1.
    assert_eq!(thread.core_id(), 1);
    assert_eq!(ids(&scheduler.queue_snapshot(1)), vec![2]);
}

#[test]
fn priority_updates_arm_and_disarm_the_preemption_timer() {
    let signal = Arc::new(RecordingSignal::default());
    // Core 0 preempts at priority 5; the thread starts below that.
    let scheduler = Arc::new(Scheduler::with_cores(vec![Some(5)], signal.clone()));

    let thread = Arc::new(ThreadHandle::new(1, 3, 0, 0b1));
    scheduler.insert_thread(&thread);
    assert!(scheduler.timed_wait_schedule(&thread, Duration::from_millis(100)));
    assert!(!thread.preemption_armed());

    // Promoting the running head onto the preemption priority arms the timer.
    scheduler.update_priority(&thread, 5);
    assert!(thread.preemption_armed());

    // Demoting it again disarms before the timeslice can expire.
    scheduler.update_priority(&thread, 3);
    assert!(!thread.preemption_armed());

    std::thread::sleep(PREEMPTIVE_TIMESLICE * 2);
    assert!(signal.yields.lock().unwrap().is_empty());
    assert!(!thread.yield_pending());

    scheduler.remove_thread(&thread);
}

#[test]
fn only_the_queue_head_gets_scheduled() {
    let (scheduler, _) = scheduler();

    let first = Arc::new(ThreadHandle::new(1, 5, 0, 0b1));
    let second = Arc::new(ThreadHandle::new(2, 5, 0, 0b1));
    scheduler.insert_thread(&first);
    scheduler.insert_thread(&second);

    let order = Arc::new(Mutex::new(Vec::new()));

    let waiter = {
        let scheduler = Arc::clone(&scheduler);
        let second = Arc::clone(&second);
        let order = Arc::clone(&order);
        std::thread::spawn(move || {
            second.attach_host_thread();
            scheduler.wait_schedule(&second);
            order.lock().unwrap().push(2u64);
            scheduler.remove_thread(&second);
        })
    };

    let runner = {
        let scheduler = Arc::clone(&scheduler);
        let first = Arc::clone(&first);
        let order = Arc::clone(&order);
        std::thread::spawn(move || {
            first.attach_host_thread();
            scheduler.wait_schedule(&first);
            // Give the other thread a chance to race us if the head invariant
            // were broken.
            std::thread::sleep(Duration::from_millis(20));
            order.lock().unwrap().push(1u64);
            scheduler.remove_thread(&first);
        })
    };

    runner.join().unwrap();
    waiter.join().unwrap();
    assert_eq!(*order.lock().unwrap(), vec![1, 2]);
}

#[test]
fn timed_wait_schedule_times_out_behind_the_head() {
    let (scheduler, _) = scheduler();

    let head = Arc::new(ThreadHandle::new(1, 5, 0, 0b1));
    let behind = Arc::new(ThreadHandle::new(2, 5, 0, 0b1));
    scheduler.insert_thread(&head);
    scheduler.insert_thread(&behind);

    assert!(!scheduler.timed_wait_schedule(&behind, Duration::from_millis(10)));
    assert!(scheduler.timed_wait_schedule(&head, Duration::from_millis(10)));
}

#[test]
fn parked_thread_is_woken_by_an_equal_or_lower_urgency_runner() {
    let (scheduler, _) = scheduler();

    let running = Arc::new(ThreadHandle::new(1, 5, 0, 0b1));
    scheduler.insert_thread(&running);

    let parked = Arc::new(ThreadHandle::new(2, 6, 0, 0b1));
    scheduler.insert_thread(&parked);
    // `parked` displaced the head; pull it back out and park it instead.
    let woken = Arc::new(AtomicBool::new(false));

    let parker = {
        let scheduler = Arc::clone(&scheduler);
        let parked = Arc::clone(&parked);
        let woken = Arc::clone(&woken);
        std::thread::spawn(move || {
            parked.attach_host_thread();
            scheduler.park_thread(&parked);
            woken.store(true, Ordering::Release);
        })
    };

    let deadline = Instant::now() + Duration::from_secs(5);
    while !woken.load(Ordering::Acquire) {
        assert!(Instant::now() < deadline, "parked thread was never woken");
        scheduler.wake_parked_thread(&running);
        std::thread::sleep(Duration::from_millis(1));
    }
    parker.join().unwrap();

    assert_eq!(parked.core_id(), running.core_id());
}

#[test]
fn preemption_timer_requests_a_yield() {
    let signal = Arc::new(RecordingSignal::default());
    // Core 0 preempts at priority 5.
    let scheduler = Arc::new(Scheduler::with_cores(vec![Some(5)], signal.clone()));

    let thread = Arc::new(ThreadHandle::new(1, 5, 0, 0b1));
    scheduler.insert_thread(&thread);
    assert!(scheduler.timed_wait_schedule(&thread, Duration::from_millis(100)));

    let deadline = Instant::now() + Duration::from_secs(5);
    while signal.yields.lock().unwrap().is_empty() {
        assert!(Instant::now() < deadline, "preemption never fired");
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(*signal.yields.lock().unwrap(), vec![1]);
    assert!(thread.yield_pending());

    scheduler.remove_thread(&thread);
}
