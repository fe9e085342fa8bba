//! Proactive reset of counters approaching saturation.
//!
//! InfiniBand port counters do not wrap: they stick at their maximum value.
//! When a counter crosses the high-water mark for its bit width, the whole
//! port is cleared with `perfquery -R` so the next readings start near zero
//! again. The store is told about the reset so the drop is not mistaken for
//! new traffic.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::command::CommandRunner;
use crate::model::{PortId, PortRecord};
use crate::store::CounterStore;

/// Default fraction of the register range at which a reset is requested.
pub const DEFAULT_HIGH_WATER_RATIO: f64 = 0.5;

/// When resets are requested.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResetPolicy {
    pub enabled: bool,
    /// Fraction of `2^bit_width`, in `(0, 1]`.
    pub high_water_ratio: f64,
}

impl Default for ResetPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            high_water_ratio: DEFAULT_HIGH_WATER_RATIO,
        }
    }
}

impl ResetPolicy {
    /// Raw value at or above which a counter of `bit_width` bits is reset.
    ///
    /// With the default ratio this is `2^(bit_width - 1)`.
    pub fn high_water_mark(&self, bit_width: u32) -> u64 {
        let range = 2f64.powi(bit_width.min(64) as i32);
        let mark = (range * self.high_water_ratio).floor();
        if mark >= u64::MAX as f64 {
            u64::MAX
        } else {
            mark as u64
        }
    }
}

/// A port that needs clearing, with the counters that triggered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetRequest {
    pub port: PortId,
    pub local_name: String,
    pub reasons: Vec<String>,
}

/// What happened to the requests of one scrape.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResetSummary {
    pub succeeded: usize,
    pub failed: usize,
    /// Skipped because a reset of the same port was still outstanding.
    pub in_flight: usize,
}

/// Decides and issues counter resets.
#[derive(Debug, Clone)]
pub struct ResetController {
    policy: ResetPolicy,
    perfquery: String,
    ca_name: Option<String>,
    timeout: Duration,
}

impl ResetController {
    pub fn new(policy: ResetPolicy, perfquery: impl Into<String>, timeout: Duration) -> Self {
        Self {
            policy,
            perfquery: perfquery.into(),
            ca_name: None,
            timeout,
        }
    }

    /// Issues resets through a specific local adapter (`perfquery -C`).
    pub fn with_ca_name(mut self, ca_name: Option<String>) -> Self {
        self.ca_name = ca_name;
        self
    }

    /// Collects ports with at least one counter at or above its high-water
    /// mark.
    ///
    /// With resets disabled nothing is requested; a warning is logged for
    /// each maxed-out counter instead.
    pub fn plan(&self, records: &[PortRecord]) -> Vec<ResetRequest> {
        let mut by_port: BTreeMap<PortId, ResetRequest> = BTreeMap::new();

        for record in records {
            for sample in &record.samples {
                if sample.raw < self.policy.high_water_mark(sample.bit_width) {
                    continue;
                }
                if !self.policy.enabled {
                    warn!(
                        node = %record.port.local_name,
                        port = sample.port.port,
                        counter = %sample.counter,
                        raw = sample.raw,
                        "counters on {} port {} are maxed out on {}",
                        record.port.local_name,
                        sample.port.port,
                        sample.counter
                    );
                    continue;
                }
                by_port
                    .entry(sample.port.clone())
                    .or_insert_with(|| ResetRequest {
                        port: sample.port.clone(),
                        local_name: record.port.local_name.clone(),
                        reasons: Vec::new(),
                    })
                    .reasons
                    .push(sample.counter.clone());
            }
        }

        by_port.into_values().collect()
    }

    /// Arguments for `perfquery` resetting every counter of `port`.
    pub fn reset_args(&self, port: &PortId) -> Vec<String> {
        let mut args = Vec::with_capacity(6);
        if let Some(ca) = &self.ca_name {
            args.push("-C".to_string());
            args.push(ca.clone());
        }
        args.push("-R".to_string());
        args.push("-G".to_string());
        args.push(port.guid.clone());
        args.push(port.port.to_string());
        args
    }

    /// Runs the requested resets one port at a time.
    ///
    /// A failed reset leaves the store untouched; the still-high counter is
    /// picked up again on the next scrape.
    pub async fn execute<R: CommandRunner + ?Sized>(
        &self,
        runner: &R,
        store: &CounterStore,
        requests: &[ResetRequest],
    ) -> ResetSummary {
        let mut summary = ResetSummary::default();

        for request in requests {
            if !store.begin_reset(&request.port) {
                summary.in_flight += 1;
                continue;
            }

            info!(
                node = %request.local_name,
                guid = %request.port.guid,
                port = request.port.port,
                reason = %request.reasons.join(","),
                "resetting counters"
            );

            let args = self.reset_args(&request.port);
            match runner.run(&self.perfquery, &args, self.timeout).await {
                Ok(_) => {
                    store.complete_reset(&request.port, Utc::now());
                    summary.succeeded += 1;
                }
                Err(e) => {
                    store.abort_reset(&request.port);
                    warn!(
                        node = %request.local_name,
                        port = request.port.port,
                        error = %e,
                        "counter reset failed"
                    );
                    summary.failed += 1;
                }
            }
        }

        summary
    }
}
