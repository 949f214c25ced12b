//! Outbox: FIFO store-and-forward queue
//!
//! The producer appends records; the flush scheduler peeks a batch, delivers
//! it without holding the lock, then acknowledges the number of leading
//! records that were accepted. Acknowledgment is by count only: enqueues
//! arriving between a peek and its ack land behind the peeked prefix, so the
//! count still names exactly the delivered records.
//!
//! With a journal path the queue is durable. Every mutation is appended to a
//! JSON-lines journal (and synced) before it is applied in memory, and
//! [`Outbox::open`] replays the journal to rebuild the same queue after a
//! restart.

use crate::config::OverflowPolicy;
use crate::error::OutboxError;
use crate::types::{DedupKey, UpdateRecord};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Stale journal entries tolerated before the journal is rewritten
const DEFAULT_COMPACT_AFTER: usize = 256;

/// Outbox tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboxOptions {
    /// Maximum pending records; unbounded when `None`
    pub capacity: Option<usize>,
    /// What to do when `capacity` is reached
    pub overflow: OverflowPolicy,
    /// `sync_data` after every journal append
    pub sync: bool,
    /// Rewrite the journal once this many acknowledged entries accumulate
    pub compact_after: usize,
}

impl OutboxOptions {
    /// Unbounded, synced
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With a capacity bound
    #[inline]
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize, overflow: OverflowPolicy) -> Self {
        self.capacity = Some(capacity.max(1));
        self.overflow = overflow;
        self
    }

    /// With compaction threshold
    #[inline]
    #[must_use]
    pub fn with_compact_after(mut self, entries: usize) -> Self {
        self.compact_after = entries.max(1);
        self
    }
}

impl Default for OutboxOptions {
    fn default() -> Self {
        Self {
            capacity: None,
            overflow: OverflowPolicy::Reject,
            sync: true,
            compact_after: DEFAULT_COMPACT_AFTER,
        }
    }
}

/// Counters exposed for logging and reports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxStats {
    /// Records currently queued
    pub pending: usize,
    /// Records ever enqueued
    pub enqueued: u64,
    /// Records acknowledged by the collector
    pub delivered: u64,
    /// Records dropped by the evict-oldest policy
    pub evicted: u64,
    /// Records refused by the reject policy
    pub rejected: u64,
}

/// One journal line
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum JournalEntry {
    /// Counter baseline written at the head of a compacted journal
    Counters {
        enqueued: u64,
        delivered: u64,
        evicted: u64,
        rejected: u64,
    },
    /// `evict` oldest records are dropped in the same step, so an overflow
    /// never loses the old records without keeping the new one
    Enqueue {
        record: UpdateRecord,
        #[serde(default, skip_serializing_if = "is_zero")]
        evict: usize,
    },
    Ack {
        count: usize,
    },
    Reject,
}

#[derive(Debug)]
struct Journal {
    path: PathBuf,
    file: File,
    sync: bool,
    stale: usize,
}

impl Journal {
    fn append(&mut self, entry: &JournalEntry) -> Result<(), OutboxError> {
        let mut line = serde_json::to_vec(entry).map_err(OutboxError::Encode)?;
        line.push(b'\n');
        self.file
            .write_all(&line)
            .map_err(|e| OutboxError::io(&self.path, e))?;
        if self.sync {
            self.file
                .sync_data()
                .map_err(|e| OutboxError::io(&self.path, e))?;
        }
        Ok(())
    }

    /// Atomically replace the journal with a baseline plus pending records
    fn rewrite(&mut self, state: &QueueState) -> Result<(), OutboxError> {
        let tmp = tmp_path(&self.path);
        {
            let file = File::create(&tmp).map_err(|e| OutboxError::io(&tmp, e))?;
            let mut writer = BufWriter::new(file);
            // replaying the pending entries below adds them back
            let baseline = JournalEntry::Counters {
                enqueued: state.enqueued.saturating_sub(state.queue.len() as u64),
                delivered: state.delivered,
                evicted: state.evicted,
                rejected: state.rejected,
            };
            write_entry(&mut writer, &baseline, &tmp)?;
            for record in &state.queue {
                write_entry(
                    &mut writer,
                    &JournalEntry::Enqueue {
                        record: record.clone(),
                        evict: 0,
                    },
                    &tmp,
                )?;
            }
            let file = writer
                .into_inner()
                .map_err(|e| OutboxError::io(&tmp, e.into_error()))?;
            file.sync_all().map_err(|e| OutboxError::io(&tmp, e))?;
        }
        std::fs::rename(&tmp, &self.path).map_err(|e| OutboxError::io(&self.path, e))?;
        self.file = open_append(&self.path)?;
        self.stale = 0;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<UpdateRecord>,
    enqueued: u64,
    delivered: u64,
    evicted: u64,
    rejected: u64,
}

impl QueueState {
    fn apply(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::Counters {
                enqueued,
                delivered,
                evicted,
                rejected,
            } => {
                self.enqueued = enqueued;
                self.delivered = delivered;
                self.evicted = evicted;
                self.rejected = rejected;
            }
            JournalEntry::Enqueue { record, evict } => {
                let n = evict.min(self.queue.len());
                self.queue.drain(..n);
                self.evicted += n as u64;
                self.queue.push_back(record);
                self.enqueued += 1;
            }
            JournalEntry::Ack { count } => {
                let n = count.min(self.queue.len());
                self.queue.drain(..n);
                self.delivered += n as u64;
            }
            JournalEntry::Reject => self.rejected += 1,
        }
    }

    fn stats(&self) -> OutboxStats {
        OutboxStats {
            pending: self.queue.len(),
            enqueued: self.enqueued,
            delivered: self.delivered,
            evicted: self.evicted,
            rejected: self.rejected,
        }
    }
}

#[derive(Debug)]
struct OutboxInner {
    state: QueueState,
    journal: Option<Journal>,
}

impl OutboxInner {
    fn log(&mut self, entry: &JournalEntry) -> Result<(), OutboxError> {
        match self.journal.as_mut() {
            Some(journal) => journal.append(entry),
            None => Ok(()),
        }
    }

    fn maybe_compact(&mut self, threshold: usize) {
        let Some(journal) = self.journal.as_mut() else {
            return;
        };
        if journal.stale < threshold {
            return;
        }
        match journal.rewrite(&self.state) {
            Ok(()) => tracing::debug!(
                "outbox journal compacted, {} pending",
                self.state.queue.len()
            ),
            Err(e) => tracing::warn!("outbox journal compaction failed: {e}"),
        }
    }
}

/// Shared FIFO of records awaiting acknowledgment
#[derive(Debug)]
pub struct Outbox {
    inner: Mutex<OutboxInner>,
    options: OutboxOptions,
}

impl Outbox {
    /// In-memory, unbounded outbox
    #[inline]
    #[must_use]
    pub fn in_memory() -> Self {
        Self::with_options(OutboxOptions::default())
    }

    /// In-memory outbox with the given options
    #[must_use]
    pub fn with_options(options: OutboxOptions) -> Self {
        Self {
            inner: Mutex::new(OutboxInner {
                state: QueueState::default(),
                journal: None,
            }),
            options,
        }
    }

    /// Open (or create) a journal-backed outbox, replaying existing entries
    ///
    /// # Errors
    /// - `OutboxError::Io` if the journal cannot be read, repaired or opened
    /// - `OutboxError::Corrupt` if an entry before the last line is unreadable
    pub fn open(path: impl AsRef<Path>, options: OutboxOptions) -> Result<Self, OutboxError> {
        let path = path.as_ref().to_path_buf();
        let (state, stale) = replay(&path)?;
        let file = open_append(&path)?;

        tracing::info!(
            "outbox journal {} recovered: {} pending, {} delivered",
            path.display(),
            state.queue.len(),
            state.delivered
        );

        let outbox = Self {
            inner: Mutex::new(OutboxInner {
                state,
                journal: Some(Journal {
                    path,
                    file,
                    sync: options.sync,
                    stale,
                }),
            }),
            options,
        };
        outbox.inner.lock().maybe_compact(options.compact_after);
        Ok(outbox)
    }

    /// Append a record to the tail
    ///
    /// # Errors
    /// - `OutboxError::Full` when bounded with the reject policy and full
    /// - `OutboxError::Io` / `Encode` if the journal append fails; the record
    ///   is then not queued
    pub fn enqueue(&self, record: UpdateRecord) -> Result<(), OutboxError> {
        let mut inner = self.inner.lock();

        let mut evict = 0;
        if let Some(capacity) = self.options.capacity {
            if inner.state.queue.len() >= capacity {
                match self.options.overflow {
                    OverflowPolicy::Reject => {
                        inner.log(&JournalEntry::Reject)?;
                        inner.state.rejected += 1;
                        tracing::error!(
                            "[reject] outbox full ({capacity}), refusing {}",
                            record.label()
                        );
                        return Err(OutboxError::Full { capacity });
                    }
                    OverflowPolicy::EvictOldest => {
                        evict = inner.state.queue.len() + 1 - capacity;
                    }
                }
            }
        }

        let entry = JournalEntry::Enqueue { record, evict };
        inner.log(&entry)?;
        inner.state.apply(entry);
        if evict > 0 {
            if let Some(journal) = inner.journal.as_mut() {
                journal.stale += evict;
            }
            tracing::warn!("[evict] outbox full, dropped {evict} oldest");
        }
        Ok(())
    }

    /// Oldest `max_count` records, in order, without removing them
    #[must_use]
    pub fn peek_batch(&self, max_count: usize) -> Vec<UpdateRecord> {
        let inner = self.inner.lock();
        inner.state.queue.iter().take(max_count).cloned().collect()
    }

    /// Remove the first `n` records (clamped) after confirmed delivery
    ///
    /// Returns the number actually removed.
    ///
    /// # Errors
    /// `OutboxError::Io` / `Encode` if the journal append fails; nothing is
    /// removed and the records will be delivered again.
    pub fn acknowledge_prefix(&self, n: usize) -> Result<usize, OutboxError> {
        let mut inner = self.inner.lock();
        let count = n.min(inner.state.queue.len());
        if count == 0 {
            return Ok(0);
        }

        let entry = JournalEntry::Ack { count };
        inner.log(&entry)?;
        inner.state.apply(entry);
        if let Some(journal) = inner.journal.as_mut() {
            journal.stale += count;
        }
        inner.maybe_compact(self.options.compact_after);
        Ok(count)
    }

    /// Pending record count
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().state.queue.len()
    }

    /// Whether nothing is pending
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Monotonic delivered counter
    #[inline]
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.inner.lock().state.delivered
    }

    /// Counter snapshot
    #[must_use]
    pub fn stats(&self) -> OutboxStats {
        self.inner.lock().state.stats()
    }

    /// Every pending record, oldest first
    #[must_use]
    pub fn pending(&self) -> Vec<UpdateRecord> {
        self.inner.lock().state.queue.iter().cloned().collect()
    }

    /// Whether a record with `key` is still pending
    #[must_use]
    pub fn contains(&self, key: &DedupKey) -> bool {
        self.inner
            .lock()
            .state
            .queue
            .iter()
            .any(|record| &record.dedup_key == key)
    }

    /// Journal path, if durable
    #[must_use]
    pub fn journal_path(&self) -> Option<PathBuf> {
        self.inner.lock().journal.as_ref().map(|j| j.path.clone())
    }
}

impl Default for Outbox {
    fn default() -> Self {
        Self::in_memory()
    }
}

/// Rebuild queue state; also returns how many journaled records are stale
fn replay(path: &Path) -> Result<(QueueState, usize), OutboxError> {
    let mut state = QueueState::default();
    let mut stale = 0usize;
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((state, 0)),
        Err(e) => return Err(OutboxError::io(path, e)),
    };

    let mut offset = 0usize;
    let mut line_no = 0usize;
    while offset < raw.len() {
        line_no += 1;
        let rest = &raw[offset..];
        let (line, consumed, terminated) = match rest.iter().position(|b| *b == b'\n') {
            Some(end) => (&rest[..end], end + 1, true),
            None => (rest, rest.len(), false),
        };

        if line.iter().all(u8::is_ascii_whitespace) {
            offset += consumed;
            continue;
        }

        match serde_json::from_slice::<JournalEntry>(line) {
            Ok(entry) => {
                let baseline = matches!(entry, JournalEntry::Counters { .. });
                let removed_before = state.delivered + state.evicted;
                state.apply(entry);
                if !baseline {
                    let removed = state.delivered + state.evicted - removed_before;
                    stale += usize::try_from(removed).unwrap_or(usize::MAX);
                }
                if !terminated {
                    // the next append must start on a fresh line
                    tracing::warn!(
                        "outbox journal {}: terminating complete entry at line {line_no}",
                        path.display()
                    );
                    terminate(path)?;
                }
            }
            Err(source) if !terminated => {
                tracing::warn!(
                    "outbox journal {}: discarding torn entry at line {line_no}: {source}",
                    path.display()
                );
                truncate(path, offset)?;
                break;
            }
            Err(source) => {
                return Err(OutboxError::Corrupt {
                    line: line_no,
                    source,
                })
            }
        }
        offset += consumed;
    }

    Ok((state, stale))
}

fn truncate(path: &Path, len: usize) -> Result<(), OutboxError> {
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| OutboxError::io(path, e))?;
    file.set_len(len as u64)
        .map_err(|e| OutboxError::io(path, e))?;
    file.sync_all().map_err(|e| OutboxError::io(path, e))
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(value: &usize) -> bool {
    *value == 0
}

fn terminate(path: &Path) -> Result<(), OutboxError> {
    let mut file = open_append(path)?;
    file.write_all(b"\n")
        .map_err(|e| OutboxError::io(path, e))?;
    file.sync_data().map_err(|e| OutboxError::io(path, e))
}

fn open_append(path: &Path) -> Result<File, OutboxError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| OutboxError::io(path, e))
}

fn write_entry<W: Write>(writer: &mut W, entry: &JournalEntry, path: &Path) -> Result<(), OutboxError> {
    serde_json::to_writer(&mut *writer, entry).map_err(OutboxError::Encode)?;
    writer
        .write_all(b"\n")
        .map_err(|e| OutboxError::io(path, e))
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}
