use crate::record::LogRecord;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A record waiting in the buffer, with the number of failed sends it has
/// been part of.
#[derive(Debug, Clone)]
struct Entry {
    record: LogRecord,
    attempts: u32,
}

/// An ordered group of records detached from the buffer for one flush.
///
/// Batches produced by [`BatchBuffer::detach`] are never empty and are
/// owned exclusively by the flusher; the live buffer keeps no reference to
/// them.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    entries: Vec<Entry>,
}

impl Batch {
    /// Build a batch from records that have never been sent.
    pub fn from_records(records: impl IntoIterator<Item = LogRecord>) -> Self {
        Batch {
            entries: records
                .into_iter()
                .map(|record| Entry { record, attempts: 0 })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records in arrival order.
    pub fn records(&self) -> impl Iterator<Item = &LogRecord> + '_ {
        self.entries.iter().map(|e| &e.record)
    }

    pub fn into_records(self) -> Vec<LogRecord> {
        self.entries.into_iter().map(|e| e.record).collect()
    }

    /// Highest number of failed sends any record in this batch has seen.
    pub fn max_attempts(&self) -> u32 {
        self.entries.iter().map(|e| e.attempts).max().unwrap_or(0)
    }
}

/// Bounds applied when a failed batch is merged back into the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequeueLimits {
    /// Sends a record may take part in before it is given up on.
    pub max_attempts: u32,
    /// Upper bound on buffered records after the merge.
    pub max_buffered: usize,
}

/// What happened to a failed batch passed to [`BatchBuffer::requeue_front`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Requeued {
    pub requeued: usize,
    pub exhausted: usize,
    pub overflowed: usize,
}

impl Requeued {
    pub fn dropped(&self) -> usize {
        self.exhausted + self.overflowed
    }
}

/// Append-only accumulator shared by the record source and the timer.
///
/// `append` and `detach` are serialized by a mutex that is only ever held
/// for in-memory work; nothing in here performs I/O.
#[derive(Debug)]
pub struct BatchBuffer {
    pending: Mutex<Vec<Entry>>,
    threshold: usize,
}

impl BatchBuffer {
    pub fn new(threshold: usize) -> Self {
        let threshold = threshold.max(1);
        BatchBuffer {
            pending: Mutex::new(Vec::with_capacity(threshold)),
            threshold,
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Add a record and report whether the buffer has reached the flush
    /// threshold.
    pub fn append(&self, record: LogRecord) -> bool {
        let mut pending = self.lock();
        pending.push(Entry { record, attempts: 0 });
        pending.len() >= self.threshold
    }

    /// Take everything buffered so far, leaving a fresh empty buffer.
    ///
    /// Returns `None` when there is nothing to flush.
    pub fn detach(&self) -> Option<Batch> {
        let mut pending = self.lock();
        if pending.is_empty() {
            return None;
        }
        let entries = std::mem::replace(&mut *pending, Vec::with_capacity(self.threshold));
        Some(Batch { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Merge a batch that failed to send back in front of whatever was
    /// appended since it was detached.
    ///
    /// Records that have now failed `max_attempts` times are dropped. If
    /// the merged buffer exceeds `max_buffered`, the oldest requeued records
    /// are dropped; records appended after the detach are always kept.
    pub fn requeue_front(&self, batch: Batch, limits: RequeueLimits) -> Requeued {
        let mut report = Requeued::default();
        let mut retry: Vec<Entry> = Vec::with_capacity(batch.entries.len());
        for mut entry in batch.entries {
            entry.attempts += 1;
            if entry.attempts >= limits.max_attempts {
                report.exhausted += 1;
            } else {
                retry.push(entry);
            }
        }

        let mut pending = self.lock();
        let total = retry.len() + pending.len();
        if total > limits.max_buffered {
            let excess = (total - limits.max_buffered).min(retry.len());
            retry.drain(..excess);
            report.overflowed = excess;
        }
        report.requeued = retry.len();

        if !retry.is_empty() {
            retry.append(&mut pending);
            *pending = retry;
        }
        report
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::Map;
    use std::sync::Arc;

    fn record(seq: u64) -> LogRecord {
        LogRecord::new(Utc::now(), Map::new()).with_field("seq", seq)
    }

    fn seqs(batch: &Batch) -> Vec<u64> {
        batch
            .records()
            .map(|r| r.get("seq").and_then(|v| v.as_u64()).unwrap())
            .collect()
    }

    #[test]
    fn append_reports_threshold() {
        let buffer = BatchBuffer::new(3);
        assert!(!buffer.append(record(0)));
        assert!(!buffer.append(record(1)));
        assert!(buffer.append(record(2)));
        // stays true while the buffer is over the threshold
        assert!(buffer.append(record(3)));
        assert_eq!(buffer.len(), 4);
    }

    #[test]
    fn detach_empty_buffer_returns_none() {
        let buffer = BatchBuffer::new(10);
        assert!(buffer.is_empty());
        assert!(buffer.detach().is_none());
    }

    #[test]
    fn ten_records_flush_as_one_batch_and_reset_count() {
        let buffer = BatchBuffer::new(10);
        let mut reached = Vec::new();
        for i in 0..10 {
            reached.push(buffer.append(record(i)));
        }
        assert_eq!(reached.iter().filter(|r| **r).count(), 1);
        assert!(reached[9]);

        let batch = buffer.detach().unwrap();
        assert_eq!(seqs(&batch), (0..10).collect::<Vec<_>>());
        assert_eq!(buffer.len(), 0);
        assert!(buffer.detach().is_none());
    }

    #[test]
    fn concurrent_appends_and_detaches_lose_nothing() {
        let buffer = Arc::new(BatchBuffer::new(7));
        let producer = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || {
                for i in 0..5_000 {
                    buffer.append(record(i));
                }
            })
        };

        let mut seen = Vec::new();
        while !producer.is_finished() {
            if let Some(batch) = buffer.detach() {
                seen.extend(seqs(&batch));
            }
        }
        producer.join().unwrap();
        if let Some(batch) = buffer.detach() {
            seen.extend(seqs(&batch));
        }

        assert_eq!(seen, (0..5_000).collect::<Vec<_>>());
    }

    #[test]
    fn requeue_puts_failed_records_first() {
        let buffer = BatchBuffer::new(10);
        buffer.append(record(0));
        buffer.append(record(1));
        let failed = buffer.detach().unwrap();
        buffer.append(record(2));

        let limits = RequeueLimits { max_attempts: 3, max_buffered: 100 };
        let report = buffer.requeue_front(failed, limits);
        assert_eq!(report, Requeued { requeued: 2, exhausted: 0, overflowed: 0 });

        let next = buffer.detach().unwrap();
        assert_eq!(seqs(&next), vec![0, 1, 2]);
        assert_eq!(next.max_attempts(), 1);
    }

    #[test]
    fn requeue_drops_exhausted_records() {
        let buffer = BatchBuffer::new(10);
        let limits = RequeueLimits { max_attempts: 2, max_buffered: 100 };
        buffer.append(record(0));

        let first = buffer.detach().unwrap();
        assert_eq!(buffer.requeue_front(first, limits).requeued, 1);

        let second = buffer.detach().unwrap();
        let report = buffer.requeue_front(second, limits);
        assert_eq!(report.exhausted, 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn requeue_overflow_drops_oldest_failed_records_only() {
        let buffer = BatchBuffer::new(10);
        for i in 0..4 {
            buffer.append(record(i));
        }
        let failed = buffer.detach().unwrap();
        for i in 4..7 {
            buffer.append(record(i));
        }

        let limits = RequeueLimits { max_attempts: 5, max_buffered: 5 };
        let report = buffer.requeue_front(failed, limits);
        assert_eq!(report.overflowed, 2);
        assert_eq!(report.requeued, 2);

        let next = buffer.detach().unwrap();
        assert_eq!(seqs(&next), vec![2, 3, 4, 5, 6]);
    }
}
