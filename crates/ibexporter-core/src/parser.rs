//! Parser for `ibqueryerrors` reports.
//!
//! Expected invocation: `ibqueryerrors --verbose --details --suppress-common
//! --data --report-port --switch --ca`. The report is a sequence of node
//! sections:
//!
//! ```text
//! Errors for 0x506b4b03005d3100 "leaf01"
//!    GUID 0x506b4b03005d3100 port ALL: [LinkDownedCounter == 1]
//!    GUID 0x506b4b03005d3100 port 2: [LinkDownedCounter == 1]
//!    Link info:     12    2[  ] ==( 4X      25.78125 Gbps Active/  LinkUp)==>  0x506b4b0300e5e461     5    1[  ] "node01 HCA-1" ( )
//! ```
//!
//! Every port line must be followed by its `Link info` line. A line that does
//! not fit is reported as a [`SkippedLine`] and parsing carries on; one bad
//! line never discards the rest of the report.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::catalog;
use crate::model::{
    ComponentKind, CounterSample, LinkState, Port, PortId, PortRecord, RemoteEndpoint,
};
use crate::names::NodeNameMap;

static HEADER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^Errors for (?:(0[xX][0-9A-Fa-f]+) )?"(.*)"$"#).expect("invalid regex")
});
static ALL_PORTS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^GUID 0[xX][0-9A-Fa-f]+ port ALL:").expect("invalid regex"));
static PORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^GUID (0[xX][0-9A-Fa-f]+) port (\d+):(.*)$").expect("invalid regex")
});
static COUNTER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(\w+) == (\d+)[^\]]*\]").expect("invalid regex"));
static LINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Link info:\s+(\d+)\s+(\d+)\[").expect("invalid regex"));
static WIDTH_SPEED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)X\s+([\d.]+) Gbps").expect("invalid regex"));
static ACTIVE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Active/\s+LinkUp").expect("invalid regex"));
static REMOTE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"==>\s+(0[xX][0-9A-Fa-f]+)\s+(\d+)\s+(\d+)\[[^\]]*\]\s+"([^"]*)""#)
        .expect("invalid regex")
});

/// A report line that could not be turned into a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedLine {
    /// 1-based line number in the report.
    pub line_no: usize,
    pub line: String,
    pub reason: &'static str,
}

/// One unit of parser output, in report order.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseEvent {
    Port(PortRecord),
    Skipped(SkippedLine),
}

/// Result of parsing a whole report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedReport {
    pub events: Vec<ParseEvent>,
}

impl ParsedReport {
    pub fn records(&self) -> impl Iterator<Item = &PortRecord> {
        self.events.iter().filter_map(|e| match e {
            ParseEvent::Port(r) => Some(r),
            ParseEvent::Skipped(_) => None,
        })
    }

    pub fn skipped(&self) -> impl Iterator<Item = &SkippedLine> {
        self.events.iter().filter_map(|e| match e {
            ParseEvent::Skipped(s) => Some(s),
            ParseEvent::Port(_) => None,
        })
    }

    /// Consumes the report, keeping only the port records.
    pub fn into_records(self) -> Vec<PortRecord> {
        self.events
            .into_iter()
            .filter_map(|e| match e {
                ParseEvent::Port(r) => Some(r),
                ParseEvent::Skipped(_) => None,
            })
            .collect()
    }
}

/// Node section currently being read.
struct Section {
    /// Node GUID from the header. Differs from the port GUIDs on adapters.
    node_guid: Option<String>,
    name: String,
    kind: ComponentKind,
}

/// Port line waiting for its `Link info` line.
struct PendingPort {
    line_no: usize,
    line: String,
    guid: String,
    port: u32,
    counters: Vec<(String, u64)>,
}

/// Report parser with optional node name substitution.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportParser<'a> {
    names: Option<&'a NodeNameMap>,
}

impl<'a> ReportParser<'a> {
    pub fn new(names: Option<&'a NodeNameMap>) -> Self {
        Self { names }
    }

    /// Parses a full report.
    ///
    /// Records are emitted in report order and never deduplicated: a port
    /// listed twice yields two records.
    pub fn parse(&self, text: &str) -> ParsedReport {
        let mut events = Vec::new();
        let mut section: Option<Section> = None;
        let mut pending: Option<PendingPort> = None;

        for (idx, raw_line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.trim();

            if line.is_empty() || line.starts_with("##") {
                continue;
            }

            if let Some(caps) = HEADER_RE.captures(line) {
                flush_unlinked(&mut pending, &mut events);
                section = Some(Section {
                    node_guid: caps.get(1).map(|m| m.as_str().to_ascii_lowercase()),
                    name: caps[2].to_string(),
                    kind: ComponentKind::Ca,
                });
                continue;
            }

            if ALL_PORTS_RE.is_match(line) {
                flush_unlinked(&mut pending, &mut events);
                match section.as_mut() {
                    Some(s) => s.kind = ComponentKind::Switch,
                    None => events.push(skip(line_no, raw_line, "port summary outside a node section")),
                }
                continue;
            }

            if let Some(caps) = PORT_RE.captures(line) {
                flush_unlinked(&mut pending, &mut events);
                if section.is_none() {
                    events.push(skip(line_no, raw_line, "port line outside a node section"));
                    continue;
                }
                let Ok(port) = caps[2].parse::<u32>() else {
                    events.push(skip(line_no, raw_line, "port number out of range"));
                    continue;
                };
                let Some(counters) = parse_counters(&caps[3]) else {
                    events.push(skip(line_no, raw_line, "counter value out of range"));
                    continue;
                };
                pending = Some(PendingPort {
                    line_no,
                    line: raw_line.to_string(),
                    guid: caps[1].to_ascii_lowercase(),
                    port,
                    counters,
                });
                continue;
            }

            if line.starts_with("Link info:") {
                let Some(port_line) = pending.take() else {
                    events.push(skip(line_no, raw_line, "link info without a port line"));
                    continue;
                };
                let Some(section) = section.as_ref() else {
                    events.push(skip(line_no, raw_line, "link info outside a node section"));
                    continue;
                };
                let (port_line_no, port_raw_line) = (port_line.line_no, port_line.line.clone());
                match self.build_record(section, port_line, line) {
                    Ok(Some((record, out_of_range))) => {
                        events.push(ParseEvent::Port(record));
                        if out_of_range {
                            events.push(skip(
                                port_line_no,
                                &port_raw_line,
                                "counter value exceeds register width",
                            ));
                        }
                    }
                    // Port 0 is the switch management port.
                    Ok(None) => {}
                    Err(reason) => events.push(skip(line_no, raw_line, reason)),
                }
                continue;
            }

            flush_unlinked(&mut pending, &mut events);
            events.push(skip(line_no, raw_line, "unrecognized line"));
        }

        flush_unlinked(&mut pending, &mut events);
        ParsedReport { events }
    }

    fn build_record(
        &self,
        section: &Section,
        pending: PendingPort,
        link_line: &str,
    ) -> Result<Option<(PortRecord, bool)>, &'static str> {
        let caps = LINK_RE.captures(link_line).ok_or("malformed link info")?;
        let lid: u32 = caps[1].parse().map_err(|_| "lid out of range")?;
        let link_port: u32 = caps[2].parse().map_err(|_| "port number out of range")?;
        if link_port != pending.port {
            return Err("link info does not match preceding port line");
        }
        if pending.port == 0 {
            return Ok(None);
        }

        let (width, speed_gbps) = match WIDTH_SPEED_RE.captures(link_line) {
            Some(ws) => (ws[1].parse().ok(), ws[2].parse().ok()),
            None => (None, None),
        };

        let state = if ACTIVE_RE.is_match(link_line) {
            LinkState::Active
        } else {
            LinkState::Down
        };

        let remote = match state {
            LinkState::Active => REMOTE_RE.captures(link_line).and_then(|rc| {
                let guid = rc[1].to_ascii_lowercase();
                let name = self.resolve_name(&guid, &rc[4]);
                Some(RemoteEndpoint {
                    lid: rc[2].parse().ok()?,
                    port: rc[3].parse().ok()?,
                    name,
                    guid,
                })
            }),
            LinkState::Down => None,
        };

        let id = PortId::new(pending.guid, pending.port);
        // Name maps are keyed by node GUID.
        let node_guid = section.node_guid.as_deref().unwrap_or(&id.guid);
        let local_name = self.resolve_name(node_guid, &section.name);

        let mut samples = Vec::with_capacity(pending.counters.len());
        let mut unknown_counters = Vec::new();
        let mut out_of_range = false;
        for (counter, raw) in pending.counters {
            let Some(info) = catalog::lookup(&counter) else {
                unknown_counters.push((counter, raw));
                continue;
            };
            let sample = CounterSample {
                port: id.clone(),
                counter,
                raw,
                bit_width: info.bits,
            };
            if sample.raw > sample.max_value() {
                out_of_range = true;
                continue;
            }
            samples.push(sample);
        }

        let record = PortRecord {
            port: Port {
                id,
                lid,
                local_name,
                kind: section.kind,
                remote,
                speed_gbps,
                width,
                state,
            },
            samples,
            unknown_counters,
        };
        Ok(Some((record, out_of_range)))
    }

    fn resolve_name(&self, guid: &str, reported: &str) -> String {
        match self.names {
            Some(names) => names.resolve(guid, reported).to_string(),
            None => reported.to_string(),
        }
    }
}

/// Parses a report without name substitution.
pub fn parse_report(text: &str) -> ParsedReport {
    ReportParser::new(None).parse(text)
}

/// Extracts `[Name == value]` items. `None` if a value overflows u64.
fn parse_counters(s: &str) -> Option<Vec<(String, u64)>> {
    COUNTER_RE
        .captures_iter(s)
        .map(|caps| Some((caps[1].to_string(), caps[2].parse().ok()?)))
        .collect()
}

fn skip(line_no: usize, line: &str, reason: &'static str) -> ParseEvent {
    ParseEvent::Skipped(SkippedLine {
        line_no,
        line: line.to_string(),
        reason,
    })
}

fn flush_unlinked(pending: &mut Option<PendingPort>, events: &mut Vec<ParseEvent>) {
    if let Some(p) = pending.take() {
        events.push(skip(p.line_no, &p.line, "port line without link info"));
    }
}
