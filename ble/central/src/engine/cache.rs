//! Last-read value cache for the read path.

use crate::interfaces::peripheral::CharacteristicKey;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Whether a cached value may answer a read without a native call.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Always read from the peripheral.
    #[default]
    Never,
    /// Answer from the cache whenever a value is stored, however old.
    Always,
    /// Answer from the cache when the stored value is at most `max_age` old.
    TimeSensitive { max_age: Duration },
}

/// A value together with the instant it was captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRecord {
    pub value: Vec<u8>,
    pub captured_at: Instant,
}

#[derive(Debug, Default)]
pub(crate) struct ReadCache {
    records: HashMap<CharacteristicKey, CacheRecord>,
}

impl ReadCache {
    /// Value that satisfies `policy` at `now`, if any.
    pub(crate) fn lookup(
        &self,
        key: &CharacteristicKey,
        policy: CachePolicy,
        now: Instant,
    ) -> Option<&[u8]> {
        let record = self.records.get(key)?;
        let fresh = match policy {
            CachePolicy::Never => false,
            CachePolicy::Always => true,
            CachePolicy::TimeSensitive { max_age } => {
                now.saturating_duration_since(record.captured_at) <= max_age
            }
        };
        fresh.then_some(record.value.as_slice())
    }

    pub(crate) fn store(&mut self, key: CharacteristicKey, value: Vec<u8>, now: Instant) {
        self.records.insert(
            key,
            CacheRecord {
                value,
                captured_at: now,
            },
        );
    }

    pub(crate) fn record(&self, key: &CharacteristicKey) -> Option<&CacheRecord> {
        self.records.get(key)
    }
}
