//! Cross-scrape counter state.
//!
//! Hardware counters are fixed-width registers that saturate and get
//! cleared (by us, by an operator, by a reboot). Prometheus counters must
//! never go backwards. The store bridges the two: for every series it keeps
//! the last raw reading and a running cumulative total, and turns each new
//! raw reading into the next cumulative value.
//!
//! Any decrease of the raw value is treated as a reset of the hardware
//! counter, never as a wraparound: the new raw value is added on top of the
//! cumulative total. Resets issued by the exporter itself go through
//! [`CounterStore::complete_reset`], which rebases the series to zero
//! without adding anything.
//!
//! All state sits behind one mutex. [`CounterStore::observe_batch`] applies
//! a whole scrape under a single lock acquisition, so concurrent scrapes
//! are serialized.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use crate::model::{CounterSample, PortId};

/// Identity of a counter series, stable across scrapes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    pub port: PortId,
    pub counter: String,
}

impl SeriesKey {
    pub fn new(port: PortId, counter: impl Into<String>) -> Self {
        Self {
            port,
            counter: counter.into(),
        }
    }
}

impl From<&CounterSample> for SeriesKey {
    fn from(sample: &CounterSample) -> Self {
        Self::new(sample.port.clone(), sample.counter.clone())
    }
}

/// Accumulated state of one series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesState {
    pub last_raw: u64,
    /// Value exported to Prometheus; never decreases.
    pub cumulative: u64,
    pub bit_width: u32,
    pub last_seen: DateTime<Utc>,
}

/// Increase between two raw readings, assuming a reset on any decrease.
pub fn counter_delta(curr: u64, prev: u64) -> u64 {
    if curr >= prev { curr - prev } else { curr }
}

#[derive(Debug, Default)]
struct StoreInner {
    series: HashMap<SeriesKey, SeriesState>,
    resets_in_flight: HashSet<PortId>,
}

impl StoreInner {
    fn observe(&mut self, key: &SeriesKey, raw: u64, bit_width: u32, now: DateTime<Utc>) -> u64 {
        let Some(state) = self.series.get_mut(key) else {
            self.series.insert(
                key.clone(),
                SeriesState {
                    last_raw: raw,
                    cumulative: raw,
                    bit_width,
                    last_seen: now,
                },
            );
            return raw;
        };

        if raw < state.last_raw {
            tracing::debug!(
                port = %key.port,
                counter = %key.counter,
                previous = state.last_raw,
                current = raw,
                "counter decreased, assuming external reset"
            );
        }

        state.cumulative = state
            .cumulative
            .saturating_add(counter_delta(raw, state.last_raw));
        state.last_raw = raw;
        state.bit_width = bit_width;
        state.last_seen = now;
        state.cumulative
    }
}

/// Process-wide counter state shared by all scrapes.
#[derive(Debug, Default)]
pub struct CounterStore {
    inner: Mutex<StoreInner>,
}

impl CounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Feeds one raw reading and returns the exported cumulative value.
    pub fn observe(&self, key: &SeriesKey, raw: u64, bit_width: u32, now: DateTime<Utc>) -> u64 {
        self.lock().observe(key, raw, bit_width, now)
    }

    /// Feeds every sample of one scrape atomically.
    ///
    /// Returns the exported value for each sample, in input order.
    pub fn observe_batch(&self, samples: &[CounterSample], now: DateTime<Utc>) -> Vec<u64> {
        let mut inner = self.lock();
        samples
            .iter()
            .map(|s| inner.observe(&SeriesKey::from(s), s.raw, s.bit_width, now))
            .collect()
    }

    /// Snapshot of one series' state.
    pub fn get(&self, key: &SeriesKey) -> Option<SeriesState> {
        self.lock().series.get(key).cloned()
    }

    /// Number of tracked series.
    pub fn len(&self) -> usize {
        self.lock().series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().series.is_empty()
    }

    /// Claims the right to reset `port`.
    ///
    /// Returns `false` if a reset for this port is already outstanding; the
    /// caller must not issue another one.
    pub fn begin_reset(&self, port: &PortId) -> bool {
        self.lock().resets_in_flight.insert(port.clone())
    }

    /// Records an acknowledged hardware reset of `port`.
    ///
    /// Every series of the port is rebased to a raw value of zero; the
    /// cumulative totals are left as they are. Returns the number of series
    /// rebased.
    pub fn complete_reset(&self, port: &PortId, now: DateTime<Utc>) -> usize {
        let mut inner = self.lock();
        inner.resets_in_flight.remove(port);
        let mut rebased = 0;
        for (key, state) in inner.series.iter_mut() {
            if &key.port == port {
                state.last_raw = 0;
                state.last_seen = now;
                rebased += 1;
            }
        }
        rebased
    }

    /// Releases the claim on `port` after a failed reset; state is untouched.
    pub fn abort_reset(&self, port: &PortId) {
        self.lock().resets_in_flight.remove(port);
    }
}
