//! Engine-local record cache for read-your-writes and hot reads.
//!
//! A byte-capped LRU keyed by seqnum, holding payload, tags, and auxiliary
//! data. Aux writes land here first (`SET_AUXDATA` acks do not wait for
//! storage propagation).

use std::collections::HashMap;

use parking_lot::Mutex;

use phylog_core::{LogEntry, LogMetaData};

/// One cached record.
#[derive(Debug, Clone)]
struct CacheSlot {
    metadata: LogMetaData,
    user_tags: Vec<u64>,
    data: Vec<u8>,
    aux_data: Vec<u8>,
    /// LRU tick of the last touch.
    last_used: u64,
}

impl CacheSlot {
    fn cost(&self) -> usize {
        self.data.len() + self.aux_data.len() + self.user_tags.len() * 8
    }
}

struct CacheInner {
    slots: HashMap<u64, CacheSlot>,
    current_bytes: usize,
    tick: u64,
}

/// Byte-capped LRU cache of log records, keyed by seqnum.
pub struct LogCache {
    capacity_bytes: usize,
    inner: Mutex<CacheInner>,
}

impl LogCache {
    #[must_use]
    pub fn new(capacity_mb: usize) -> Self {
        Self {
            capacity_bytes: capacity_mb * 1024 * 1024,
            inner: Mutex::new(CacheInner {
                slots: HashMap::new(),
                current_bytes: 0,
                tick: 0,
            }),
        }
    }

    /// Inserts a record; existing entries keep their aux data.
    pub fn put(&self, metadata: LogMetaData, user_tags: Vec<u64>, data: Vec<u8>) {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        let aux_data = inner
            .slots
            .get(&metadata.seqnum)
            .map(|slot| slot.aux_data.clone())
            .unwrap_or_default();
        let slot = CacheSlot {
            metadata,
            user_tags,
            data,
            aux_data,
            last_used: tick,
        };
        let cost = slot.cost();
        if let Some(old) = inner.slots.insert(metadata.seqnum, slot) {
            inner.current_bytes -= old.cost();
        }
        inner.current_bytes += cost;
        Self::evict_if_needed(&mut inner, self.capacity_bytes);
    }

    /// Point lookup; touches the LRU clock.
    #[must_use]
    pub fn get(&self, seqnum: u64) -> Option<LogEntry> {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        let slot = inner.slots.get_mut(&seqnum)?;
        slot.last_used = tick;
        Some(LogEntry {
            metadata: slot.metadata,
            user_tags: slot.user_tags.clone(),
            data: slot.data.clone(),
            aux_data: slot.aux_data.clone(),
        })
    }

    /// Attaches aux data to a cached record; a bare aux slot is created if
    /// the record itself is not cached (last writer wins).
    pub fn put_aux_data(&self, seqnum: u64, aux_data: Vec<u8>) {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        match inner.slots.get_mut(&seqnum) {
            Some(slot) => {
                let old = slot.aux_data.len();
                slot.aux_data = aux_data;
                slot.last_used = tick;
                let new = slot.aux_data.len();
                inner.current_bytes = inner.current_bytes - old + new;
            }
            None => {
                let slot = CacheSlot {
                    metadata: LogMetaData {
                        user_logspace: 0,
                        seqnum,
                        localid: 0,
                        num_tags: 0,
                        data_size: 0,
                    },
                    user_tags: Vec::new(),
                    data: Vec::new(),
                    aux_data,
                    last_used: tick,
                };
                inner.current_bytes += slot.cost();
                inner.slots.insert(seqnum, slot);
            }
        }
        Self::evict_if_needed(&mut inner, self.capacity_bytes);
    }

    #[must_use]
    pub fn get_aux_data(&self, seqnum: u64) -> Option<Vec<u8>> {
        let inner = self.inner.lock();
        inner
            .slots
            .get(&seqnum)
            .filter(|slot| !slot.aux_data.is_empty())
            .map(|slot| slot.aux_data.clone())
    }

    fn evict_if_needed(inner: &mut CacheInner, capacity_bytes: usize) {
        while inner.current_bytes > capacity_bytes && inner.slots.len() > 1 {
            let Some((&victim, _)) = inner
                .slots
                .iter()
                .min_by_key(|(_, slot)| slot.last_used)
            else {
                return;
            };
            let slot = inner.slots.remove(&victim).unwrap();
            inner.current_bytes -= slot.cost();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
