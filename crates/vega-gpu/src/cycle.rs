//! Completion tracking for one GPU submission.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::backend::HostFence;

/// One reset-to-signal cycle of a host fence, carrying the lifetimes of every
/// object the submission depends on.
///
/// Dependencies attached before the fence signals are held alive until the
/// cycle is observed signalled (or cancelled after a failed submission); this
/// is the guarantee that no resource referenced by in-flight GPU work is
/// dropped early. All waits on the underlying fence must go through the same
/// cycle, the signalled flag is never unset.
pub struct FenceCycle {
    signalled: AtomicBool,
    fence: Arc<dyn HostFence>,
    dependencies: Mutex<Vec<Arc<dyn Any + Send + Sync>>>,
}

impl FenceCycle {
    /// Starts a fresh cycle on the fence, resetting it.
    pub fn new(fence: Arc<dyn HostFence>) -> Arc<Self> {
        fence.reset();
        Arc::new(Self {
            signalled: AtomicBool::new(false),
            fence,
            dependencies: Mutex::new(Vec::new()),
        })
    }

    pub fn is_signalled(&self) -> bool {
        self.signalled.load(Ordering::Acquire)
    }

    /// Blocks until the host GPU signals the fence, then releases the
    /// attached dependencies.
    pub fn wait(&self) {
        if self.is_signalled() {
            return;
        }
        self.fence.wait();
        self.mark_signalled();
    }

    /// Returns whether the fence signalled within the timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_signalled() {
            return true;
        }
        if self.fence.wait_timeout(timeout) {
            self.mark_signalled();
            true
        } else {
            false
        }
    }

    /// Non-blocking check of the fence.
    pub fn poll(&self) -> bool {
        if self.is_signalled() {
            return true;
        }
        if self.fence.poll() {
            self.mark_signalled();
            true
        } else {
            false
        }
    }

    /// Abandons the cycle after a failed submission, releasing dependencies
    /// without waiting for the GPU.
    pub fn cancel(&self) {
        debug!("cancelling fence cycle");
        self.mark_signalled();
    }

    /// Attaches an object whose destruction must wait for this cycle; a no-op
    /// once the cycle has signalled.
    pub fn attach(&self, dependency: Arc<dyn Any + Send + Sync>) {
        let mut dependencies = self.dependencies.lock().unwrap();
        // Checked under the lock so a concurrent signal cannot strand the
        // dependency in a completed cycle.
        if !self.is_signalled() {
            dependencies.push(dependency);
        }
    }

    fn mark_signalled(&self) {
        if !self.signalled.swap(true, Ordering::AcqRel) {
            self.dependencies.lock().unwrap().clear();
        }
    }
}

impl Drop for FenceCycle {
    fn drop(&mut self) {
        // Dropping the last reference with work still in flight must not free
        // the dependencies early.
        self.wait();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::FenceCycle;
    use crate::backend::HostFence;

    #[derive(Default)]
    struct ManualFence {
        signalled: AtomicBool,
    }

    impl ManualFence {
        fn signal(&self) {
            self.signalled.store(true, Ordering::Release);
        }
    }

    impl HostFence for ManualFence {
        fn wait(&self) {
            assert!(self.poll(), "wait on a fence that never signals");
        }

        fn wait_timeout(&self, _timeout: Duration) -> bool {
            self.poll()
        }

        fn poll(&self) -> bool {
            self.signalled.load(Ordering::Acquire)
        }

        fn reset(&self) {
            self.signalled.store(false, Ordering::Release);
        }
    }

    #[test]
    fn dependencies_outlive_an_unsignalled_cycle() {
        let fence = Arc::new(ManualFence::default());
        let cycle = FenceCycle::new(fence.clone());

        let dependency = Arc::new(42u32);
        cycle.attach(dependency.clone());
        assert_eq!(Arc::strong_count(&dependency), 2);

        fence.signal();
        assert!(cycle.poll());
        assert_eq!(Arc::strong_count(&dependency), 1);
    }

    #[test]
    fn cancel_releases_dependencies_without_waiting() {
        let fence = Arc::new(ManualFence::default());
        let cycle = FenceCycle::new(fence.clone());

        let dependency = Arc::new("texture backing");
        cycle.attach(dependency.clone());

        cycle.cancel();
        assert_eq!(Arc::strong_count(&dependency), 1);
        assert!(cycle.is_signalled());
    }

    #[test]
    fn attach_after_signal_is_dropped_immediately() {
        let fence = Arc::new(ManualFence::default());
        let cycle = FenceCycle::new(fence.clone());
        fence.signal();
        assert!(cycle.poll());

        let dependency = Arc::new(7u64);
        cycle.attach(dependency.clone());
        assert_eq!(Arc::strong_count(&dependency), 1);
    }
}
