use std::sync::atomic::{AtomicBool, Ordering};

/// Collapses bursts of notifications into as few handler runs as possible.
///
/// `notify` marks work pending and runs the handler unless another thread
/// already is; that thread picks the pending mark up before it returns. The
/// handler therefore never runs concurrently with itself, and must read the
/// current state rather than rely on how many notifications arrived.
#[derive(Debug, Default)]
pub struct CoalescingSignal {
    pending: AtomicBool,
    running: AtomicBool,
}

impl CoalescingSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify<F>(&self, mut handler: F)
    where
        F: FnMut(),
    {
        self.pending.store(true, Ordering::SeqCst);
        loop {
            if self
                .running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }
            while self.pending.swap(false, Ordering::SeqCst) {
                handler();
            }
            self.running.store(false, Ordering::SeqCst);
            // A notification may have landed between the last swap and the
            // release of `running`.
            if !self.pending.load(Ordering::SeqCst) {
                return;
            }
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }
}
