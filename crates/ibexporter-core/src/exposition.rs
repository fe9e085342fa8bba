//! Prometheus text rendering of a scrape.
//!
//! A fresh [`Registry`] is built per scrape: series of ports that vanished
//! from the fabric disappear from the output instead of lingering.

use prometheus::{Encoder, Gauge, GaugeVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::catalog::{self, METRIC_PREFIX};
use crate::classifier::ErrorKind;
use crate::model::Port;
use crate::scrape::ScrapeOutcome;

/// Content type of [`render`]'s output.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

const PORT_LABELS: &[&str] = &[
    "component",
    "local_name",
    "local_guid",
    "local_port",
    "remote_guid",
    "remote_port",
    "remote_name",
];

fn port_label_values(port: &Port) -> [String; 7] {
    let (remote_guid, remote_port, remote_name) = match &port.remote {
        Some(r) => (r.guid.clone(), r.port.to_string(), r.name.clone()),
        None => (String::new(), String::new(), String::new()),
    };
    [
        port.kind.as_str().to_string(),
        port.local_name.clone(),
        port.id.guid.clone(),
        port.id.port.to_string(),
        remote_guid,
        remote_port,
        remote_name,
    ]
}

fn metric_name(suffix: &str) -> String {
    format!("{}_{}", METRIC_PREFIX, suffix)
}

/// Builds the registry holding every series of `outcome`.
pub fn build_registry(outcome: &ScrapeOutcome) -> Result<Registry, prometheus::Error> {
    let registry = Registry::new();

    // Port counters, one family per catalog entry seen in this scrape.
    let mut families: Vec<(&'static str, IntCounterVec)> = Vec::new();
    for exported in &outcome.ports {
        let labels = port_label_values(&exported.port);
        let labels: Vec<&str> = labels.iter().map(String::as_str).collect();

        for (name, value) in &exported.counters {
            let Some(info) = catalog::lookup(name) else {
                continue;
            };
            let family = match families.iter().find(|(n, _)| *n == info.name) {
                Some((_, vec)) => vec.clone(),
                None => {
                    let vec = IntCounterVec::new(
                        Opts::new(catalog::counter_metric_name(info.name), info.help),
                        PORT_LABELS,
                    )?;
                    registry.register(Box::new(vec.clone()))?;
                    families.push((info.name, vec.clone()));
                    vec
                }
            };
            let counter = family.get_metric_with_label_values(&labels)?;
            // A port listed twice keeps its last value.
            counter.reset();
            counter.inc_by(*value);
        }
    }

    // Link gauges.
    let speed = GaugeVec::new(
        Opts::new(catalog::gauge_metric_name(&catalog::SPEED), catalog::SPEED.help),
        PORT_LABELS,
    )?;
    let width = GaugeVec::new(
        Opts::new(catalog::gauge_metric_name(&catalog::WIDTH), catalog::WIDTH.help),
        PORT_LABELS,
    )?;
    registry.register(Box::new(speed.clone()))?;
    registry.register(Box::new(width.clone()))?;
    for exported in &outcome.ports {
        let labels = port_label_values(&exported.port);
        let labels: Vec<&str> = labels.iter().map(String::as_str).collect();
        if let Some(gbps) = exported.port.speed_gbps {
            speed.get_metric_with_label_values(&labels)?.set(gbps);
        }
        if let Some(lanes) = exported.port.width {
            width.get_metric_with_label_values(&labels)?.set(lanes as f64);
        }
    }

    // Classified stderr errors.
    for kind in ErrorKind::ALL {
        let vec = IntCounterVec::new(Opts::new(kind.metric_name(), kind.help()), kind.label_names())?;
        registry.register(Box::new(vec.clone()))?;
        for (labels, count) in outcome.errors.series(kind) {
            let labels: Vec<&str> = labels.iter().map(String::as_str).collect();
            vec.get_metric_with_label_values(&labels)?.inc_by(count);
        }
    }

    let unparsed = IntCounter::new(
        metric_name("unparsed_error_lines_total"),
        "Lines from ibqueryerrors STDERR matching no known error pattern.",
    )?;
    unparsed.inc_by(outcome.errors.unparsed_lines);
    registry.register(Box::new(unparsed))?;

    let skipped = IntCounter::new(
        metric_name("skipped_report_lines_total"),
        "Lines of the ibqueryerrors report that could not be parsed.",
    )?;
    skipped.inc_by(outcome.errors.skipped_report_lines);
    registry.register(Box::new(skipped))?;

    let dropped = IntCounter::new(
        metric_name("dropped_error_lines_total"),
        "Classified STDERR lines not exported because the error series limit was reached.",
    )?;
    dropped.inc_by(outcome.errors.dropped_lines);
    registry.register(Box::new(dropped))?;

    // Scrape scalars.
    let ok = Gauge::new(
        metric_name("scrape_ok"),
        "Indicates with a 1 if the scrape was successful and complete, otherwise 0 on any non critical errors detected e.g. ignored lines from ibqueryerrors STDERR or parsing errors.",
    )?;
    ok.set(if outcome.ok { 1.0 } else { 0.0 });
    registry.register(Box::new(ok))?;

    let duration = Gauge::new(
        metric_name("scrape_duration_seconds"),
        "Number of seconds taken to collect and parse the stats.",
    )?;
    duration.set(outcome.duration.as_secs_f64());
    registry.register(Box::new(duration))?;

    if let Some(command) = outcome.command_duration {
        let gauge = Gauge::new(
            metric_name("ibqueryerrors_duration_seconds"),
            "Number of seconds taken to run ibqueryerrors.",
        )?;
        gauge.set(command.as_secs_f64());
        registry.register(Box::new(gauge))?;
    }

    Ok(registry)
}

/// Renders `outcome` in the Prometheus text format.
pub fn render(outcome: &ScrapeOutcome) -> Result<String, prometheus::Error> {
    let registry = build_registry(outcome)?;
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
