//! Cold-storage KV backend behind the in-memory live set.
//!
//! Live entries are evictable once persisted; reads below the persisted
//! watermark that miss the live set are redirected here. Implementations
//! are expected to do their I/O off the FSM lock (the storage node drives
//! persistence from a background task).

use async_trait::async_trait;
use dashmap::DashMap;

use phylog_core::LogEntry;

/// Keyed by full seqnum. Backend failures surface to readers as failed
/// `ReadAt`s, never as process aborts.
#[async_trait]
pub trait LogBackend: Send + Sync + 'static {
    /// Durably stores a batch of sequenced entries.
    async fn put_entries(&self, entries: &[std::sync::Arc<LogEntry>]) -> anyhow::Result<()>;

    /// Point lookup by seqnum.
    async fn get_entry(&self, seqnum: u64) -> anyhow::Result<Option<LogEntry>>;
}

/// In-memory backend used by tests and single-process deployments.
#[derive(Default)]
pub struct MemoryBackend {
    entries: DashMap<u64, LogEntry>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl LogBackend for MemoryBackend {
    async fn put_entries(&self, entries: &[std::sync::Arc<LogEntry>]) -> anyhow::Result<()> {
        for entry in entries {
            self.entries
                .insert(entry.metadata.seqnum, LogEntry::clone(entry));
        }
        Ok(())
    }

    async fn get_entry(&self, seqnum: u64) -> anyhow::Result<Option<LogEntry>> {
        Ok(self.entries.get(&seqnum).map(|e| e.value().clone()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
