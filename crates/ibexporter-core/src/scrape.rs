//! One full scrape cycle.
//!
//! ```text
//! acquire text ──► parse ──► observe (store) ──► plan/execute resets
//!      │                                              │
//!      └── stderr ──► classify ──► tally ─────────────┴──► ScrapeOutcome
//! ```
//!
//! A scrape that cannot obtain the report at all stops right after
//! acquisition: the store is left untouched and the outcome carries
//! `ok = false` with no port series.
//!
//! Cycles run one at a time. A report read while another cycle's reset is
//! still reaching the hardware would otherwise be observed against the
//! rebased state and counted twice.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::catalog::{self, Severity};
use crate::classifier::{ClassifiedError, ErrorTally, classify_stream};
use crate::command::{CommandError, CommandRunner};
use crate::config::ExporterConfig;
use crate::model::{CounterSample, Port, PortRecord, derive_links};
use crate::names::NodeNameMap;
use crate::parser::ReportParser;
use crate::reset::{ResetController, ResetSummary};
use crate::store::{CounterStore, SeriesKey};

/// Why no report text could be obtained.
#[derive(Debug)]
pub enum SourceError {
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
    Command(CommandError),
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::ReadFile { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
            SourceError::Command(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SourceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SourceError::ReadFile { source, .. } => Some(source),
            SourceError::Command(e) => Some(e),
        }
    }
}

impl From<CommandError> for SourceError {
    fn from(e: CommandError) -> Self {
        SourceError::Command(e)
    }
}

/// Raw text of one scrape.
#[derive(Debug, Clone, Default)]
pub struct RawReport {
    pub stdout: String,
    pub stderr: String,
    /// Set when the text came from running the diagnostic command.
    pub command_duration: Option<Duration>,
}

/// A port and its exported counter values.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportedPort {
    pub port: Port,
    /// `(counter name, cumulative value)`, in report order.
    pub counters: Vec<(String, u64)>,
}

/// Everything the exposition layer renders for one scrape.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeOutcome {
    pub ok: bool,
    pub duration: Duration,
    pub command_duration: Option<Duration>,
    pub ports: Vec<ExportedPort>,
    /// Cumulative error totals as of the end of this scrape.
    pub errors: ErrorTally,
    pub resets: ResetSummary,
}

/// Runs scrapes against one fabric, owning all cross-scrape state.
pub struct Scraper<R> {
    config: ExporterConfig,
    runner: R,
    names: Option<NodeNameMap>,
    store: CounterStore,
    tally: Mutex<ErrorTally>,
    resets: ResetController,
    cycle: tokio::sync::Mutex<()>,
}

impl<R: CommandRunner> Scraper<R> {
    pub fn new(config: ExporterConfig, runner: R, names: Option<NodeNameMap>) -> Self {
        let resets = ResetController::new(
            config.reset_policy(),
            config.perfquery_path.clone(),
            config.command_timeout,
        )
        .with_ca_name(config.ca_name.clone());
        Self {
            config,
            runner,
            names,
            store: CounterStore::new(),
            tally: Mutex::new(ErrorTally::new()),
            resets,
            cycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn store(&self) -> &CounterStore {
        &self.store
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Snapshot of the cumulative error totals.
    pub fn error_tally(&self) -> ErrorTally {
        self.lock_tally().clone()
    }

    fn lock_tally(&self) -> MutexGuard<'_, ErrorTally> {
        self.tally.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Obtains the report from the input file or the diagnostic command.
    pub async fn acquire(&self) -> Result<RawReport, SourceError> {
        if let Some(path) = &self.config.input_file {
            let stdout = tokio::fs::read_to_string(path)
                .await
                .map_err(|source| SourceError::ReadFile {
                    path: path.clone(),
                    source,
                })?;
            return Ok(RawReport {
                stdout,
                ..RawReport::default()
            });
        }

        let args = self.config.ibqueryerrors_args();
        let start = Instant::now();
        let output = self
            .runner
            .run(&self.config.ibqueryerrors_path, &args, self.config.command_timeout)
            .await?;
        Ok(RawReport {
            stdout: output.stdout,
            stderr: output.stderr,
            command_duration: Some(start.elapsed()),
        })
    }

    /// Runs one complete scrape. Never fails: problems are reported
    /// through the outcome.
    pub async fn scrape(&self) -> ScrapeOutcome {
        let start = Instant::now();
        let _cycle = self.cycle.lock().await;

        let raw = match self.acquire().await {
            Ok(raw) => raw,
            Err(e) => {
                error!(error = %e, "scrape failed");
                return ScrapeOutcome {
                    ok: false,
                    duration: start.elapsed(),
                    command_duration: None,
                    ports: Vec::new(),
                    errors: self.error_tally(),
                    resets: ResetSummary::default(),
                };
            }
        };

        let parsed = ReportParser::new(self.names.as_ref()).parse(&raw.stdout);
        let mut degraded = false;
        let mut skipped = 0u64;
        for line in parsed.skipped() {
            error!(line_no = line.line_no, reason = line.reason, line = %line.line, "skipped report line");
            skipped += 1;
        }
        degraded |= skipped > 0;

        let records = parsed.into_records();
        for record in &records {
            for (counter, raw) in &record.unknown_counters {
                error!(
                    node = %record.port.local_name,
                    port = record.port.id.port,
                    counter = %counter,
                    value = raw,
                    "unknown counter"
                );
                degraded = true;
            }
        }

        let ports = self.observe(&records);

        let topology = derive_links(&records);
        debug!(
            ports = records.len(),
            links = topology.links.len(),
            dangling = topology.dangling.len(),
            one_sided = topology.one_sided.len(),
            "fabric topology"
        );

        let plan = self.resets.plan(&records);
        let resets = if plan.is_empty() {
            ResetSummary::default()
        } else {
            self.resets.execute(&self.runner, &self.store, &plan).await
        };

        let classified = classify_stream(&raw.stderr);
        let errors = {
            let mut tally = self.lock_tally();
            for e in &classified {
                if let ClassifiedError::Unparsed(line) = e {
                    error!(line = %line, "unparsed stderr line");
                    degraded = true;
                }
                tally.record(e);
            }
            tally.skipped_report_lines += skipped;
            tally.clone()
        };

        let error_ports = records
            .iter()
            .filter(|r| {
                r.samples.iter().any(|s| {
                    s.raw > 0
                        && catalog::lookup(&s.counter).is_some_and(|i| i.severity == Severity::Error)
                })
            })
            .count();

        let duration = start.elapsed();
        debug!(
            ok = !degraded,
            ports = ports.len(),
            error_ports,
            stderr_lines = classified.len(),
            duration_ms = duration.as_millis() as u64,
            "scrape complete"
        );

        ScrapeOutcome {
            ok: !degraded,
            duration,
            command_duration: raw.command_duration,
            ports,
            errors,
            resets,
        }
    }

    /// Feeds every sample of the scrape to the store in one batch.
    ///
    /// A series listed more than once is observed once, with its last
    /// reading.
    fn observe(&self, records: &[PortRecord]) -> Vec<ExportedPort> {
        let mut index: HashMap<SeriesKey, usize> = HashMap::new();
        let mut samples: Vec<CounterSample> = Vec::new();
        for sample in records.iter().flat_map(|r| &r.samples) {
            match index.entry(SeriesKey::from(sample)) {
                Entry::Occupied(e) => samples[*e.get()] = sample.clone(),
                Entry::Vacant(e) => {
                    e.insert(samples.len());
                    samples.push(sample.clone());
                }
            }
        }
        let values = self.store.observe_batch(&samples, Utc::now());

        records
            .iter()
            .map(|record| ExportedPort {
                port: record.port.clone(),
                counters: record
                    .samples
                    .iter()
                    .map(|s| {
                        let value = index.get(&SeriesKey::from(s)).map_or(0, |&i| values[i]);
                        (s.counter.clone(), value)
                    })
                    .collect(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::classifier::ErrorKind;
    use crate::command::scenarios::{self, link_downed_report};
    use crate::command::{CommandOutput, MockResponse, MockRunner};
    use crate::model::PortId;
    use crate::store::SeriesKey;

    fn counter(outcome: &ScrapeOutcome, guid: &str, port: u32, name: &str) -> Option<u64> {
        outcome
            .ports
            .iter()
            .find(|p| p.port.id == PortId::new(guid, port))?
            .counters
            .iter()
            .find(|(c, _)| c == name)
            .map(|(_, v)| *v)
    }

    fn resetting() -> ExporterConfig {
        ExporterConfig {
            can_reset_counter: true,
            ..ExporterConfig::default()
        }
    }

    #[tokio::test]
    async fn test_healthy_scrape() {
        let scraper = Scraper::new(ExporterConfig::default(), MockRunner::healthy_fabric(), None);
        let outcome = scraper.scrape().await;

        assert!(outcome.ok);
        assert_eq!(outcome.ports.len(), 4);
        assert!(outcome.command_duration.is_some());
        assert_eq!(
            counter(&outcome, "0x506b4b0300e5e461", 1, "PortXmitData"),
            Some(123456789)
        );
        assert_eq!(
            counter(&outcome, "0x506b4b03005d3100", 3, "SymbolErrorCounter"),
            Some(3)
        );

        let calls = scraper.runner().calls_to("ibqueryerrors");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].args, ExporterConfig::default().ibqueryerrors_args());
        assert!(scraper.runner().calls_to("perfquery").is_empty());
    }

    #[tokio::test]
    async fn test_query_failed_does_not_affect_ok() {
        let stderr = "ibwarn: [4242] query_and_dump: PortXmitWait query failed on node07 HCA-1, Lid 42 port 1\n";
        let runner = MockRunner::new().with_response(
            "ibqueryerrors",
            MockResponse::output(scenarios::SINGLE_SWITCH_PORT, stderr),
        );
        let scraper = Scraper::new(ExporterConfig::default(), runner, None);
        let outcome = scraper.scrape().await;

        assert!(outcome.ok);
        assert_eq!(
            outcome
                .errors
                .count(ErrorKind::QueryFailed, &["PortXmitWait", "node07 HCA-1", "42", "1"]),
            1
        );
        for kind in ErrorKind::ALL {
            if kind != ErrorKind::QueryFailed {
                assert_eq!(outcome.errors.series(kind).count(), 0);
            }
        }
    }

    #[tokio::test]
    async fn test_unparsed_stderr_degrades_scrape() {
        let scraper = Scraper::new(ExporterConfig::default(), MockRunner::noisy_fabric(), None);
        let outcome = scraper.scrape().await;
        assert!(!outcome.ok);
        assert_eq!(outcome.ports.len(), 4);
        assert_eq!(outcome.errors.unparsed_lines, 1);
    }

    #[tokio::test]
    async fn test_error_tally_is_cumulative() {
        let scraper = Scraper::new(ExporterConfig::default(), MockRunner::noisy_fabric(), None);
        scraper.scrape().await;
        let outcome = scraper.scrape().await;
        assert_eq!(outcome.errors.unparsed_lines, 2);
        assert_eq!(
            outcome
                .errors
                .count(ErrorKind::MadRpcFailed, &["Lid 42"]),
            2
        );
    }

    #[tokio::test]
    async fn test_command_failure_leaves_store_untouched() {
        let runner = MockRunner::new().with_response("ibqueryerrors", MockResponse::fail(255, "no such CA"));
        let scraper = Scraper::new(ExporterConfig::default(), runner, None);
        let outcome = scraper.scrape().await;

        assert!(!outcome.ok);
        assert!(outcome.ports.is_empty());
        assert!(outcome.command_duration.is_none());
        assert!(scraper.store().is_empty());
    }

    #[tokio::test]
    async fn test_failure_keeps_previous_values() {
        let runner = MockRunner::new();
        runner.push("ibqueryerrors", MockResponse::output(link_downed_report(7), ""));
        runner.push("ibqueryerrors", MockResponse::fail(1, "boom"));
        runner.push("ibqueryerrors", MockResponse::output(link_downed_report(9), ""));
        let scraper = Scraper::new(ExporterConfig::default(), runner, None);

        assert_eq!(
            counter(&scraper.scrape().await, "0x506b4b03005d3101", 2, "LinkDownedCounter"),
            Some(7)
        );
        assert!(!scraper.scrape().await.ok);
        let key = SeriesKey::new(PortId::new("0x506b4b03005d3101", 2), "LinkDownedCounter");
        assert_eq!(scraper.store().get(&key).unwrap().cumulative, 7);
        assert_eq!(
            counter(&scraper.scrape().await, "0x506b4b03005d3101", 2, "LinkDownedCounter"),
            Some(9)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_scrape() {
        let runner = MockRunner::new().with_response("ibqueryerrors", MockResponse::Hang);
        let config = ExporterConfig {
            command_timeout: Duration::from_secs(3),
            ..ExporterConfig::default()
        };
        let scraper = Scraper::new(config, runner, None);
        let outcome = scraper.scrape().await;
        assert!(!outcome.ok);
        assert!(outcome.duration >= Duration::from_secs(3));
        assert!(scraper.store().is_empty());
    }

    #[tokio::test]
    async fn test_external_reset_accumulates() {
        let runner = MockRunner::new();
        runner.push("ibqueryerrors", MockResponse::output(link_downed_report(100), ""));
        runner.push("ibqueryerrors", MockResponse::output(link_downed_report(3), ""));
        let scraper = Scraper::new(ExporterConfig::default(), runner, None);

        scraper.scrape().await;
        let outcome = scraper.scrape().await;
        assert_eq!(
            counter(&outcome, "0x506b4b03005d3101", 2, "LinkDownedCounter"),
            Some(103)
        );
    }

    #[tokio::test]
    async fn test_controlled_reset_cycle() {
        let runner = MockRunner::new().with_response("perfquery", MockResponse::output("", ""));
        runner.push("ibqueryerrors", MockResponse::output(link_downed_report(200), ""));
        runner.push("ibqueryerrors", MockResponse::output(link_downed_report(0), ""));
        runner.push("ibqueryerrors", MockResponse::output(link_downed_report(5), ""));
        let scraper = Scraper::new(resetting(), runner, None);

        let first = scraper.scrape().await;
        assert_eq!(first.resets.succeeded, 1);
        assert_eq!(
            counter(&first, "0x506b4b03005d3101", 2, "LinkDownedCounter"),
            Some(200)
        );
        let resets = scraper.runner().calls_to("perfquery");
        assert_eq!(resets.len(), 1);
        assert_eq!(resets[0].args, vec!["-R", "-G", "0x506b4b03005d3101", "2"]);

        let second = scraper.scrape().await;
        assert_eq!(
            counter(&second, "0x506b4b03005d3101", 2, "LinkDownedCounter"),
            Some(200)
        );
        let third = scraper.scrape().await;
        assert_eq!(
            counter(&third, "0x506b4b03005d3101", 2, "LinkDownedCounter"),
            Some(205)
        );
        assert_eq!(scraper.runner().calls_to("perfquery").len(), 1);
    }

    #[tokio::test]
    async fn test_no_reset_below_mark_or_disabled() {
        let runner = MockRunner::healthy_fabric();
        runner.push("ibqueryerrors", MockResponse::output(link_downed_report(127), ""));
        let scraper = Scraper::new(resetting(), runner, None);
        scraper.scrape().await;
        assert!(scraper.runner().calls_to("perfquery").is_empty());

        let runner = MockRunner::healthy_fabric();
        runner.push("ibqueryerrors", MockResponse::output(link_downed_report(255), ""));
        let scraper = Scraper::new(ExporterConfig::default(), runner, None);
        scraper.scrape().await;
        assert!(scraper.runner().calls_to("perfquery").is_empty());
    }

    #[tokio::test]
    async fn test_unknown_counter_not_exported() {
        let report = "\
Errors for \"node03 HCA-1\"
   GUID 0x0002c90300005555 port 1: [PortRcvErrors == 4] [PortFancyNewCounter == 12]
   Link info:      9    1[  ] ==( 4X 25.78125 Gbps Active/  LinkUp)==>  0x0002c90300006666   10    4[  ] \"leaf03\" ( )
";
        let runner = MockRunner::new().with_response("ibqueryerrors", MockResponse::output(report, ""));
        let scraper = Scraper::new(ExporterConfig::default(), runner, None);
        let outcome = scraper.scrape().await;

        assert!(!outcome.ok);
        assert_eq!(outcome.ports[0].counters, vec![("PortRcvErrors".to_string(), 4)]);
    }

    #[tokio::test]
    async fn test_skipped_lines_counted() {
        let report = format!("{}garbage in the middle\n", scenarios::SINGLE_SWITCH_PORT);
        let runner = MockRunner::new().with_response("ibqueryerrors", MockResponse::output(report, ""));
        let scraper = Scraper::new(ExporterConfig::default(), runner, None);
        let outcome = scraper.scrape().await;
        assert!(!outcome.ok);
        assert_eq!(outcome.ports.len(), 1);
        assert_eq!(outcome.errors.skipped_report_lines, 1);
    }

    #[tokio::test]
    async fn test_scrape_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(scenarios::SMALL_FABRIC.as_bytes()).unwrap();
        let config = ExporterConfig {
            input_file: Some(file.path().to_path_buf()),
            ..ExporterConfig::default()
        };
        let scraper = Scraper::new(config, MockRunner::new(), None);
        let outcome = scraper.scrape().await;

        assert!(outcome.ok);
        assert_eq!(outcome.ports.len(), 4);
        assert!(outcome.command_duration.is_none());
        assert!(scraper.runner().calls().is_empty());
    }

    #[tokio::test]
    async fn test_node_name_map_applied() {
        let mut names = NodeNameMap::new();
        names.insert("0x506b4b03005d3101", "spine-a");
        names.insert("0x506b4b0300e5e461", "gpu17");
        let runner = MockRunner::new().with_response(
            "ibqueryerrors",
            MockResponse::output(scenarios::SINGLE_SWITCH_PORT, ""),
        );
        let scraper = Scraper::new(ExporterConfig::default(), runner, Some(names));
        let outcome = scraper.scrape().await;

        let port = &outcome.ports[0].port;
        assert_eq!(port.local_name, "spine-a");
        assert_eq!(port.remote.as_ref().unwrap().name, "gpu17");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_scrapes_serializable() {
        for _ in 0..20 {
            let runner = MockRunner::new();
            runner.push("ibqueryerrors", MockResponse::output(link_downed_report(10), ""));
            runner.push("ibqueryerrors", MockResponse::output(link_downed_report(50), ""));
            runner.push("ibqueryerrors", MockResponse::output(link_downed_report(20), ""));
            let scraper = Arc::new(Scraper::new(ExporterConfig::default(), runner, None));
            scraper.scrape().await;

            let a = tokio::spawn({
                let s = Arc::clone(&scraper);
                async move { s.scrape().await }
            });
            let b = tokio::spawn({
                let s = Arc::clone(&scraper);
                async move { s.scrape().await }
            });
            a.await.unwrap();
            b.await.unwrap();

            // 10 -> 50 -> 20 gives 70, 10 -> 20 -> 50 gives 50.
            let key = SeriesKey::new(PortId::new("0x506b4b03005d3101", 2), "LinkDownedCounter");
            let total = scraper.store().get(&key).unwrap().cumulative;
            assert!(total == 70 || total == 50, "unexpected total {}", total);
        }
    }

    /// One port whose `LinkDownedCounter` reads the live value and is
    /// cleared by `perfquery -R`. Only the first read is instant.
    struct LiveFabric {
        value: Mutex<u64>,
        reads: AtomicUsize,
        resets: AtomicUsize,
    }

    impl LiveFabric {
        fn new(value: u64) -> Self {
            Self {
                value: Mutex::new(value),
                reads: AtomicUsize::new(0),
                resets: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CommandRunner for LiveFabric {
        async fn run(
            &self,
            program: &str,
            _args: &[String],
            _timeout: Duration,
        ) -> Result<CommandOutput, CommandError> {
            match program {
                "ibqueryerrors" => {
                    let value = *self.value.lock().unwrap();
                    if self.reads.fetch_add(1, Ordering::SeqCst) > 0 {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                    Ok(CommandOutput {
                        stdout: link_downed_report(value),
                        stderr: String::new(),
                    })
                }
                "perfquery" => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    *self.value.lock().unwrap() = 0;
                    self.resets.fetch_add(1, Ordering::SeqCst);
                    Ok(CommandOutput::default())
                }
                other => Err(CommandError::Spawn {
                    program: other.to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "unknown program"),
                }),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_scrapes_with_reset_count_once() {
        let scraper = Scraper::new(resetting(), LiveFabric::new(200), None);
        let (a, b) = tokio::join!(scraper.scrape(), scraper.scrape());
        assert!(a.ok && b.ok);

        let key = SeriesKey::new(PortId::new("0x506b4b03005d3101", 2), "LinkDownedCounter");
        assert_eq!(scraper.store().get(&key).unwrap().cumulative, 200);
        assert_eq!(scraper.runner().resets.load(Ordering::SeqCst), 1);
        assert_eq!(a.resets.succeeded + b.resets.succeeded, 1);
    }

    #[tokio::test]
    async fn test_duplicate_port_does_not_accumulate() {
        let report = "\
Errors for \"node04 HCA-1\"
   GUID 0x0002c90300008888 port 1: [PortRcvErrors == 5]
   Link info:      9    1[  ] ==( 4X 25.78125 Gbps Active/  LinkUp)==>  0x0002c90300009999   10    4[  ] \"leaf04\" ( )
   GUID 0x0002c90300008888 port 1: [PortRcvErrors == 3]
   Link info:      9    1[  ] ==( 4X 25.78125 Gbps Active/  LinkUp)==>  0x0002c90300009999   10    4[  ] \"leaf04\" ( )
";
        let runner = MockRunner::new().with_response("ibqueryerrors", MockResponse::output(report, ""));
        let scraper = Scraper::new(ExporterConfig::default(), runner, None);

        for _ in 0..3 {
            let outcome = scraper.scrape().await;
            assert_eq!(outcome.ports.len(), 2);
            for port in &outcome.ports {
                assert_eq!(port.counters, vec![("PortRcvErrors".to_string(), 3)]);
            }
        }
        let key = SeriesKey::new(PortId::new("0x0002c90300008888", 1), "PortRcvErrors");
        assert_eq!(scraper.store().get(&key).unwrap().cumulative, 3);
    }
}
