//! ibexporter-core — InfiniBand fabric counters for Prometheus.
//!
//! Provides:
//! - `parser` — turns an `ibqueryerrors` report into typed port records
//! - `model` — ports, links, counter samples
//! - `catalog` — known hardware counters and their bit widths
//! - `names` — operator-supplied node name map
//! - `store` — cross-scrape counter state (monotonic exported values)
//! - `reset` — proactive reset of counters approaching saturation
//! - `classifier` — typed classification of the diagnostic error stream
//! - `command` — external command capability (real + mock)
//! - `config` — exporter settings and startup validation
//! - `scrape` — one full scrape cycle
//! - `exposition` — Prometheus text rendering of a scrape

pub mod catalog;
pub mod classifier;
pub mod command;
pub mod config;
pub mod exposition;
pub mod model;
pub mod names;
pub mod parser;
pub mod reset;
pub mod scrape;
pub mod store;

pub use config::{ConfigError, ExporterConfig};
pub use scrape::{ScrapeOutcome, Scraper};

/// Crate version, shared by the daemon's `--version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
