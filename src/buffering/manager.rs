use super::policy::{BufferingPolicy, DefaultBufferingPolicy};
use super::signal::CoalescingSignal;
use crate::config::BufferingConfig;
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Timestamps may step backwards this far (B-frame reordering, interleaved
/// PTS/DTS) before a queue's range is reset.
const REORDER_TOLERANCE: Duration = Duration::from_secs(2);

/// Receives read pause/resume decisions. Calls strictly alternate.
pub trait QueueThrottle: Send + Sync {
    fn pause(&self);
    fn resume(&self);
}

/// Handle of one queue registered with a [`BufferingManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(usize);

/// Snapshot of one queue as seen by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub packets: usize,
    pub bytes: usize,
    /// Span between the oldest and newest timestamps; `None` when empty.
    pub duration: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferingState {
    /// Holding the consumer back while data accumulates.
    Buffering,
    Streaming,
}

#[derive(Debug, Default, Clone)]
struct QueueState {
    oldest: Option<Duration>,
    newest: Option<Duration>,
    packets: usize,
    bytes: usize,
    exhausted: bool,
    done: bool,
    released: bool,
}

impl QueueState {
    /// `None` for a queue with nothing buffered.
    fn duration(&self) -> Option<Duration> {
        if self.packets == 0 {
            return None;
        }
        match (self.oldest, self.newest) {
            (Some(oldest), Some(newest)) => Some(newest.saturating_sub(oldest)),
            _ => None,
        }
    }

    fn enqueue(&mut self, timestamp: Option<Duration>, bytes: usize) {
        self.packets += 1;
        self.bytes += bytes;
        self.exhausted = false;

        let Some(ts) = timestamp else {
            return;
        };
        match self.oldest {
            None => self.oldest = Some(ts),
            Some(oldest) if ts + REORDER_TOLERANCE < oldest => {
                warn!("queue timestamp jumped back from {:?} to {:?}", oldest, ts);
                self.oldest = Some(ts);
                self.newest = Some(ts);
            }
            Some(_) => {}
        }
        match self.newest {
            Some(newest) if newest >= ts => {}
            _ => self.newest = Some(ts),
        }
    }

    /// `head` is the timestamp of the oldest packet still queued.
    fn dequeue(&mut self, head: Option<Duration>, bytes: usize) {
        self.packets = self.packets.saturating_sub(1);
        self.bytes = self.bytes.saturating_sub(bytes);
        if self.packets == 0 {
            self.oldest = None;
            self.newest = None;
            return;
        }

        let Some(ts) = head else {
            return;
        };
        self.oldest = Some(ts);
        if let Some(newest) = self.newest {
            if newest + REORDER_TOLERANCE < ts {
                warn!("dequeued timestamp {:?} is past newest {:?}", ts, newest);
                self.newest = Some(ts);
            }
        }
    }

    fn reset(&mut self) {
        *self = QueueState {
            released: self.released,
            ..QueueState::default()
        };
    }
}

struct ManagerState {
    queues: Vec<QueueState>,
    state: BufferingState,
    is_starting: bool,
    blocked: bool,
    bytes_at_buffering_start: usize,
    progress: f64,
    progress_at: Option<Instant>,
}

impl ManagerState {
    fn new() -> Self {
        Self {
            queues: Vec::new(),
            state: BufferingState::Buffering,
            is_starting: true,
            blocked: false,
            bytes_at_buffering_start: 0,
            progress: 0.0,
            progress_at: None,
        }
    }

    fn enter_buffering(&mut self, bytes: usize) {
        self.state = BufferingState::Buffering;
        self.bytes_at_buffering_start = bytes;
        self.progress = 0.0;
        self.progress_at = None;
    }
}

/// Aggregates summary across queues, taken under the manager lock.
struct Totals {
    min_duration: Duration,
    bytes: usize,
    any_exhausted: bool,
    all_exhausted: bool,
    all_done: bool,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum QueueEvent {
    Enqueue { timestamp: Option<Duration>, bytes: usize },
    Dequeue { head: Option<Duration>, bytes: usize },
    Exhausted,
    Flush,
    Done,
}

/// Cross-stream buffering arbiter.
///
/// Every elementary stream buffer reports to one manager. Under a single
/// lock the manager keeps per-queue counters, decides between buffering
/// and streaming, and asks the policy whether upstream reads should pause.
/// The weakest queue governs: an empty queue counts as zero buffered
/// duration. Pause and resume reach the [`QueueThrottle`] outside the lock,
/// once per change of decision.
pub struct BufferingManager {
    policy: Box<dyn BufferingPolicy>,
    throttle: Arc<dyn QueueThrottle>,
    progress_interval: Duration,
    state: Mutex<ManagerState>,
    signal: CoalescingSignal,
    reported_blocked: AtomicBool,
}

impl BufferingManager {
    pub fn new(config: BufferingConfig, throttle: Arc<dyn QueueThrottle>) -> Self {
        let progress_interval = config.progress_interval;
        Self::with_policy(Box::new(DefaultBufferingPolicy::new(config)), progress_interval, throttle)
    }

    pub fn with_policy(
        policy: Box<dyn BufferingPolicy>,
        progress_interval: Duration,
        throttle: Arc<dyn QueueThrottle>,
    ) -> Self {
        Self {
            policy,
            throttle,
            progress_interval,
            state: Mutex::new(ManagerState::new()),
            signal: CoalescingSignal::new(),
            reported_blocked: AtomicBool::new(false),
        }
    }

    pub fn create_queue(&self) -> QueueId {
        let mut state = self.state.lock();
        state.queues.push(QueueState::default());
        QueueId(state.queues.len() - 1)
    }

    /// Stops counting a queue whose buffer went away.
    pub fn release_queue(&self, id: QueueId) {
        self.update(id, |q| {
            q.reset();
            q.released = true;
        });
    }

    pub fn report_enqueue(&self, id: QueueId, timestamp: Option<Duration>, bytes: usize) {
        self.report(id, QueueEvent::Enqueue { timestamp, bytes });
    }

    /// A packet of `bytes` left the queue. `head` is the timestamp of the
    /// oldest packet still queued, if any carries one.
    pub fn report_dequeue(&self, id: QueueId, head: Option<Duration>, bytes: usize) {
        self.report(id, QueueEvent::Dequeue { head, bytes });
    }

    /// The queue's consumer found it empty.
    pub fn report_exhaustion(&self, id: QueueId) {
        self.report(id, QueueEvent::Exhausted);
    }

    pub fn report_flush(&self, id: QueueId) {
        self.report(id, QueueEvent::Flush);
    }

    /// The queue's stream ended; it no longer holds the others back.
    pub fn report_done(&self, id: QueueId) {
        self.report(id, QueueEvent::Done);
    }

    fn report(&self, id: QueueId, event: QueueEvent) {
        if self.record(id, event) {
            self.notify();
        }
    }

    /// Applies `event` without reaching the throttle. Returns true when the
    /// blocking decision changed and [`BufferingManager::notify`] is due.
    ///
    /// Lets a queue owner update the counters while still holding its own
    /// lock, so counters and queue contents never disagree.
    pub(crate) fn record(&self, id: QueueId, event: QueueEvent) -> bool {
        self.apply(id, |q| match event {
            QueueEvent::Enqueue { timestamp, bytes } => q.enqueue(timestamp, bytes),
            QueueEvent::Dequeue { head, bytes } => q.dequeue(head, bytes),
            QueueEvent::Exhausted => q.exhausted = true,
            QueueEvent::Flush => q.reset(),
            QueueEvent::Done => q.done = true,
        })
    }

    fn update<F>(&self, id: QueueId, apply: F)
    where
        F: FnOnce(&mut QueueState),
    {
        if self.apply(id, apply) {
            self.notify();
        }
    }

    fn apply<F>(&self, id: QueueId, apply: F) -> bool
    where
        F: FnOnce(&mut QueueState),
    {
        let mut state = self.state.lock();
        let Some(queue) = state.queues.get_mut(id.0) else {
            return false;
        };
        apply(queue);
        self.recompute(&mut state)
    }

    /// Resets every queue and restarts in startup buffering (seek, close).
    pub fn flush(&self) {
        let changed = {
            let mut state = self.state.lock();
            for queue in state.queues.iter_mut() {
                queue.reset();
            }
            state.is_starting = true;
            state.enter_buffering(0);
            let was_blocked = state.blocked;
            state.blocked = false;
            debug!("buffering manager flushed");
            was_blocked
        };
        if changed {
            self.notify();
        }
    }

    /// Dispatches a pending pause/resume change to the throttle.
    pub fn notify(&self) {
        self.signal.notify(|| {
            let blocked = self.state.lock().blocked;
            if self.reported_blocked.swap(blocked, Ordering::SeqCst) != blocked {
                if blocked {
                    debug!("pausing reads");
                    self.throttle.pause();
                } else {
                    debug!("resuming reads");
                    self.throttle.resume();
                }
            }
        });
    }

    fn totals(queues: &[QueueState]) -> Totals {
        let live = || queues.iter().filter(|q| !q.released);
        let pending = || live().filter(|q| !q.done);
        Totals {
            min_duration: pending()
                .map(|q| q.duration().unwrap_or(Duration::ZERO))
                .min()
                .unwrap_or(Duration::ZERO),
            bytes: live().map(|q| q.bytes).sum(),
            any_exhausted: pending().any(|q| q.exhausted),
            all_exhausted: pending().all(|q| q.exhausted),
            all_done: live().count() > 0 && pending().count() == 0,
        }
    }

    /// Re-evaluates state and read blocking. Returns true when the blocking
    /// decision changed.
    fn recompute(&self, state: &mut ManagerState) -> bool {
        let totals = Self::totals(&state.queues);

        match state.state {
            BufferingState::Buffering => {
                if totals.all_done
                    || self.policy.is_done_buffering(
                        totals.min_duration,
                        totals.bytes,
                        state.bytes_at_buffering_start,
                        state.is_starting,
                    )
                {
                    debug!(
                        "buffering done ({} start): {:?} buffered, {} bytes",
                        if state.is_starting { "initial" } else { "re" },
                        totals.min_duration,
                        totals.bytes
                    );
                    state.state = BufferingState::Streaming;
                    state.is_starting = false;
                } else {
                    let now = Instant::now();
                    let due = state
                        .progress_at
                        .map_or(true, |at| now.duration_since(at) >= self.progress_interval);
                    if due {
                        state.progress_at = Some(now);
                        state.progress = self.policy.progress(
                            totals.min_duration,
                            totals.bytes,
                            state.bytes_at_buffering_start,
                            state.is_starting,
                        );
                    }
                }
            }
            BufferingState::Streaming => {
                if totals.any_exhausted && !totals.all_done {
                    debug!("queue exhausted, rebuffering with {} bytes held", totals.bytes);
                    state.enter_buffering(totals.bytes);
                }
            }
        }

        let blocked = self.policy.should_block_reads(
            state.blocked,
            totals.min_duration,
            totals.bytes,
            totals.any_exhausted,
            totals.all_exhausted,
        );
        let changed = blocked != state.blocked;
        state.blocked = blocked;
        changed
    }

    pub fn state(&self) -> BufferingState {
        self.state.lock().state
    }

    pub fn is_buffering(&self) -> bool {
        self.state() == BufferingState::Buffering
    }

    /// Progress in `[0, 1]` while buffering, `None` while streaming.
    pub fn buffering_progress(&self) -> Option<f64> {
        let state = self.state.lock();
        match state.state {
            BufferingState::Buffering => Some(state.progress),
            BufferingState::Streaming => None,
        }
    }

    /// The current read-blocking decision.
    pub fn is_blocked(&self) -> bool {
        self.state.lock().blocked
    }

    /// Counters the manager holds for one queue.
    pub fn queue_stats(&self, id: QueueId) -> Option<QueueStats> {
        let state = self.state.lock();
        state.queues.get(id.0).map(|q| QueueStats {
            packets: q.packets,
            bytes: q.bytes,
            duration: q.duration(),
        })
    }
}

impl std::fmt::Debug for BufferingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BufferingManager")
            .field("state", &state.state)
            .field("queues", &state.queues.len())
            .field("blocked", &state.blocked)
            .finish()
    }
}
