use crate::batch::{Batch, BatchBuffer, RequeueLimits};
use crate::record::LogRecord;
use crate::sink::{FlushOutcome, LogSink, SinkError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What to do with a batch the sink did not accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log the failure and drop the batch.
    Discard,
    /// Put retryable failures back at the front of the buffer so they go
    /// out first with the next flush. Rejected payloads are still dropped.
    Requeue(RequeueLimits),
}

impl Default for FailurePolicy {
    fn default() -> Self {
        FailurePolicy::Requeue(RequeueLimits {
            max_attempts: 3,
            max_buffered: 10_000,
        })
    }
}

/// First delay before a failed batch is resent.
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Event that asked for a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The buffer reached the batch size.
    Size,
    /// The flush interval elapsed.
    Interval,
    /// Requested explicitly by the embedding code.
    Manual,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Size => "size",
            Trigger::Interval => "interval",
            Trigger::Manual => "manual",
        }
    }
}

/// Result of asking the shipper to flush.
#[derive(Debug)]
pub enum FlushAttempt {
    /// Nothing was buffered; the sink was not called.
    Empty,
    /// Another flush was in flight. The request was recorded and the
    /// in-flight flusher runs one more round for it once its sink call
    /// returns.
    Deferred,
    /// Shutdown has started; triggers are no longer honored.
    Closed,
    /// A requeued batch is waiting out its retry delay. The records stay
    /// buffered for the first trigger after the delay.
    BackingOff,
    /// One sink call per detached batch, in send order.
    Sent(Vec<FlushOutcome>),
}

impl FlushAttempt {
    pub fn outcomes(&self) -> &[FlushOutcome] {
        match self {
            FlushAttempt::Sent(outcomes) => outcomes,
            _ => &[],
        }
    }
}

/// Running totals kept by the shipper.
#[derive(Debug, Default)]
pub struct ShipperStats {
    /// Records handed to [`Shipper::ingest`].
    pub received: AtomicU64,
    /// Records in batches the sink accepted.
    pub delivered: AtomicU64,
    /// Sink calls that returned [`FlushOutcome::Failed`].
    pub failed_batches: AtomicU64,
    /// Records given up on after a failed flush.
    pub dropped: AtomicU64,
    /// Records put back into the buffer after a failed flush.
    pub requeued: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub delivered: u64,
    pub failed_batches: u64,
    pub dropped: u64,
    pub requeued: u64,
}

impl ShipperStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
        }
    }

    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Retry delay after retryable failures, doubling up to [`MAX_BACKOFF`].
#[derive(Debug)]
struct Backoff {
    delay: Duration,
    retry_after: Option<Instant>,
}

impl Backoff {
    fn new() -> Self {
        Backoff {
            delay: INITIAL_BACKOFF,
            retry_after: None,
        }
    }

    fn failed(&mut self, now: Instant) -> Duration {
        let delay = self.delay;
        self.retry_after = Some(now + delay);
        self.delay = (delay * 2).min(MAX_BACKOFF);
        delay
    }

    fn holds(&self, now: Instant) -> bool {
        matches!(self.retry_after, Some(at) if now < at)
    }
}

/// Owns the batch buffer and decides when its contents go to the sink.
///
/// Both flush triggers (the size check after every [`ingest`] and the
/// periodic timer from [`spawn_timer`]) go through [`flush`], which allows
/// at most one sink call at a time. A trigger that arrives while a flush is
/// in flight is not dropped: it sets a pending flag and the in-flight
/// flusher runs one more round before releasing the slot, so a burst that
/// overflowed the batch size goes out as soon as the sink answers instead
/// of waiting for the next trigger.
///
/// After a retryable failure under [`FailurePolicy::Requeue`], size and
/// interval triggers hold off for a retry delay starting at 100ms and
/// doubling up to 10s per consecutive failure. A delivered batch resets it.
///
/// [`ingest`]: Shipper::ingest
/// [`spawn_timer`]: Shipper::spawn_timer
/// [`flush`]: Shipper::flush
pub struct Shipper {
    buffer: BatchBuffer,
    sink: Arc<dyn LogSink>,
    policy: FailurePolicy,
    /// Held for the whole detach + send of a flush.
    flush_slot: Mutex<()>,
    pending: AtomicBool,
    closed: AtomicBool,
    backoff: StdMutex<Backoff>,
    stats: ShipperStats,
}

impl Shipper {
    /// Create a shipper flushing to `sink` whenever `batch_size` records
    /// are buffered. A zero batch size is raised to 1.
    pub fn new(sink: Arc<dyn LogSink>, batch_size: usize, policy: FailurePolicy) -> Self {
        Shipper {
            buffer: BatchBuffer::new(batch_size),
            sink,
            policy,
            flush_slot: Mutex::new(()),
            pending: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            backoff: StdMutex::new(Backoff::new()),
            stats: ShipperStats::default(),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.buffer.threshold()
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Number of records waiting for the next flush.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> &ShipperStats {
        &self.stats
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Buffer a record. When this fills the batch, the size-triggered
    /// flush runs before returning, so the caller does not pull the next
    /// record until the sink has answered or the flush was deferred.
    ///
    /// Once shutdown has started the record is refused and
    /// `Some(FlushAttempt::Closed)` is returned.
    pub async fn ingest(&self, record: LogRecord) -> Option<FlushAttempt> {
        if self.is_closed() {
            debug!("shutting down, refusing record");
            return Some(FlushAttempt::Closed);
        }
        ShipperStats::add(&self.stats.received, 1);
        if self.buffer.append(record) {
            Some(self.flush(Trigger::Size).await)
        } else {
            None
        }
    }

    /// Detach whatever is buffered and send it.
    ///
    /// Size and interval triggers return [`FlushAttempt::BackingOff`]
    /// while a retry delay is running; manual flushes ignore it.
    pub async fn flush(&self, trigger: Trigger) -> FlushAttempt {
        if self.is_closed() {
            debug!(trigger = trigger.as_str(), "shutting down, ignoring flush trigger");
            return FlushAttempt::Closed;
        }

        let mut outcomes = Vec::new();
        loop {
            let Some(slot) = self.claim_slot() else {
                if outcomes.is_empty() {
                    debug!(trigger = trigger.as_str(), "flush in flight, deferring trigger");
                    return FlushAttempt::Deferred;
                }
                // whoever holds the slot now sees the pending flag
                break;
            };

            self.pending.store(false, Ordering::Release);
            if trigger != Trigger::Manual && self.backing_off() {
                drop(slot);
                if outcomes.is_empty() {
                    debug!(trigger = trigger.as_str(), "retry delay running, leaving records buffered");
                    return FlushAttempt::BackingOff;
                }
                break;
            }
            if let Some(batch) = self.buffer.detach() {
                outcomes.push(self.deliver(batch, trigger).await);
            }
            drop(slot);

            if !self.pending.load(Ordering::Acquire) || self.is_closed() {
                break;
            }
            debug!(trigger = trigger.as_str(), "honoring trigger deferred during flush");
        }

        if outcomes.is_empty() {
            FlushAttempt::Empty
        } else {
            FlushAttempt::Sent(outcomes)
        }
    }

    /// Take the flush slot, or record a pending request if it is busy.
    ///
    /// The second `try_lock` covers a holder that released the slot after
    /// our first attempt but before it could observe the flag.
    fn claim_slot(&self) -> Option<MutexGuard<'_, ()>> {
        if let Ok(slot) = self.flush_slot.try_lock() {
            return Some(slot);
        }
        self.pending.store(true, Ordering::Release);
        self.flush_slot.try_lock().ok()
    }

    fn backing_off(&self) -> bool {
        self.lock_backoff().holds(Instant::now())
    }

    fn lock_backoff(&self) -> std::sync::MutexGuard<'_, Backoff> {
        self.backoff.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn deliver(&self, batch: Batch, trigger: Trigger) -> FlushOutcome {
        let records = batch.len();
        debug!(trigger = trigger.as_str(), records, "flushing batch");

        let outcome = self.sink.send(&batch).await;
        match &outcome {
            FlushOutcome::Delivered => {
                ShipperStats::add(&self.stats.delivered, records);
                *self.lock_backoff() = Backoff::new();
                info!(trigger = trigger.as_str(), records, "batch delivered");
            }
            FlushOutcome::Failed(e) => {
                ShipperStats::add(&self.stats.failed_batches, 1);
                self.handle_failure(batch, e);
            }
        }
        outcome
    }

    fn handle_failure(&self, batch: Batch, error: &SinkError) {
        let records = batch.len();
        match self.policy {
            FailurePolicy::Requeue(limits) if error.is_retryable() => {
                let report = self.buffer.requeue_front(batch, limits);
                ShipperStats::add(&self.stats.requeued, report.requeued);
                ShipperStats::add(&self.stats.dropped, report.dropped());
                let retry_in = self.lock_backoff().failed(Instant::now());
                warn!(
                    error = %error,
                    requeued = report.requeued,
                    dropped = report.dropped(),
                    retry_in_ms = retry_in.as_millis() as u64,
                    "flush failed, records kept for the next flush"
                );
            }
            _ => {
                ShipperStats::add(&self.stats.dropped, records);
                error!(error = %error, dropped = records, "flush failed, batch discarded");
            }
        }
    }

    /// Spawn the periodic flush trigger.
    ///
    /// The first tick fires one `period` after the call. Ticks that find the
    /// buffer empty are skipped without touching the sink; ticks missed
    /// while a flush was running are not replayed.
    pub fn spawn_timer(self: &Arc<Self>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let shipper = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if shipper.buffer.is_empty() {
                            continue;
                        }
                        shipper.flush(Trigger::Interval).await;
                    }
                }
            }
            debug!("flush timer stopped");
        })
    }

    /// Stop honoring triggers and send what is left, once.
    ///
    /// Waits for an in-flight flush to finish first. Returns `None` when
    /// the buffer was empty and the sink was not called. A failure here is
    /// logged and the records are discarded.
    pub async fn shutdown(&self) -> Option<FlushOutcome> {
        self.closed.store(true, Ordering::Release);
        let _slot = self.flush_slot.lock().await;

        let Some(batch) = self.buffer.detach() else {
            info!("buffer empty at shutdown, nothing to flush");
            return None;
        };

        let records = batch.len();
        info!(records, "flushing remaining records before shutdown");
        let outcome = self.sink.send(&batch).await;
        match &outcome {
            FlushOutcome::Delivered => {
                ShipperStats::add(&self.stats.delivered, records);
                info!(records, "final batch delivered");
            }
            FlushOutcome::Failed(e) => {
                ShipperStats::add(&self.stats.failed_batches, 1);
                ShipperStats::add(&self.stats.dropped, records);
                error!(error = %e, dropped = records, "final flush failed, records lost");
            }
        }
        Some(outcome)
    }
}
