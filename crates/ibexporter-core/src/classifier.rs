//! Classification of the `ibqueryerrors` error stream.
//!
//! `ibqueryerrors` reports fabric query problems on stderr as free-form
//! `ibwarn` lines. Each known shape maps to one [`ClassifiedError`] variant
//! carrying exactly the labels of its metric. Lines matching none of them
//! become [`ClassifiedError::Unparsed`] so format drift shows up in the
//! metrics rather than disappearing.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

static BAD_STATUS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^src/query_smp\.c:\d+; (?:mad|umad) \((DR path .*) Attr .*\) bad status (\d+); (.*)$")
        .expect("invalid regex")
});
static QUERY_FAILED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^ibwarn: \[\d+\] query_and_dump: (\w+) query failed on (.*), Lid (\d+) port (\d+)")
        .expect("invalid regex")
});
static RECV_FAILED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^ibwarn: \[\d+\] _do_madrpc: recv failed: [\w\s]+").expect("invalid regex")
});
static MAD_RPC_FAILED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^ibwarn: \[\d+\] mad_rpc: _do_madrpc failed; dport \(([\w;\s]+)\)")
        .expect("invalid regex")
});
static QUERY_CAP_MASK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^ibwarn: \[\d+\] query_cap_mask: (\w+) query failed on (.*), ([\w;\s]+) port (\d+)")
        .expect("invalid regex")
});
static PRINT_ERRORS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^ibwarn: \[\d+\] print_errors: (\w+) query failed on (.*), ([\w;\s]+) port (\d+)")
        .expect("invalid regex")
});

/// Exported error families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorKind {
    BadStatus,
    QueryFailed,
    MadRpcFailed,
    QueryCapMask,
    PrintError,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 5] = [
        ErrorKind::BadStatus,
        ErrorKind::QueryFailed,
        ErrorKind::MadRpcFailed,
        ErrorKind::QueryCapMask,
        ErrorKind::PrintError,
    ];

    pub fn metric_name(&self) -> &'static str {
        match self {
            ErrorKind::BadStatus => "infiniband_bad_status_error",
            ErrorKind::QueryFailed => "infiniband_query_failed_error",
            ErrorKind::MadRpcFailed => "infiniband_mad_rpc_failed_error",
            ErrorKind::QueryCapMask => "infiniband_query_cap_mask_error",
            ErrorKind::PrintError => "infiniband_print_error",
        }
    }

    pub fn help(&self) -> &'static str {
        match self {
            ErrorKind::BadStatus => "Bad status error catched from STDERR by ibqueryerrors.",
            ErrorKind::QueryFailed => "Failed query catched from STDERR by ibqueryerrors.",
            ErrorKind::MadRpcFailed => "ibwarn_mad_rpc error catched from STDERR by ibqueryerrors.",
            ErrorKind::QueryCapMask => {
                "ibwarn_query_cap_mask error catched from STDERR by ibqueryerrors."
            }
            ErrorKind::PrintError => "ibwarn_print_error catched from STDERR by ibqueryerrors.",
        }
    }

    pub fn label_names(&self) -> &'static [&'static str] {
        match self {
            ErrorKind::BadStatus => &["path", "status", "error"],
            ErrorKind::QueryFailed => &["counter_name", "local_name", "lid", "port"],
            ErrorKind::MadRpcFailed => &["portid"],
            ErrorKind::QueryCapMask | ErrorKind::PrintError => {
                &["counter_name", "local_name", "portid", "port"]
            }
        }
    }
}

/// One classified stderr line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifiedError {
    BadStatus {
        path: String,
        status: String,
        error: String,
    },
    QueryFailed {
        counter_name: String,
        local_name: String,
        lid: String,
        port: String,
    },
    MadRpcFailed {
        portid: String,
    },
    QueryCapMask {
        counter_name: String,
        local_name: String,
        portid: String,
        port: String,
    },
    PrintError {
        counter_name: String,
        local_name: String,
        portid: String,
        port: String,
    },
    /// `_do_madrpc: recv failed`, always followed by a `mad_rpc` line that
    /// carries the useful information.
    RecvFailed,
    Unparsed(String),
}

impl ClassifiedError {
    /// Exported family, if this line is exported at all.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ClassifiedError::BadStatus { .. } => Some(ErrorKind::BadStatus),
            ClassifiedError::QueryFailed { .. } => Some(ErrorKind::QueryFailed),
            ClassifiedError::MadRpcFailed { .. } => Some(ErrorKind::MadRpcFailed),
            ClassifiedError::QueryCapMask { .. } => Some(ErrorKind::QueryCapMask),
            ClassifiedError::PrintError { .. } => Some(ErrorKind::PrintError),
            ClassifiedError::RecvFailed | ClassifiedError::Unparsed(_) => None,
        }
    }

    /// Label values, in the order of [`ErrorKind::label_names`].
    pub fn label_values(&self) -> Vec<&str> {
        match self {
            ClassifiedError::BadStatus {
                path,
                status,
                error,
            } => vec![path, status, error],
            ClassifiedError::QueryFailed {
                counter_name,
                local_name,
                lid,
                port,
            } => vec![counter_name, local_name, lid, port],
            ClassifiedError::MadRpcFailed { portid } => vec![portid],
            ClassifiedError::QueryCapMask {
                counter_name,
                local_name,
                portid,
                port,
            }
            | ClassifiedError::PrintError {
                counter_name,
                local_name,
                portid,
                port,
            } => vec![counter_name, local_name, portid, port],
            ClassifiedError::RecvFailed | ClassifiedError::Unparsed(_) => Vec::new(),
        }
    }
}

/// Classifies one stderr line. Patterns are tried in a fixed order.
pub fn classify_line(line: &str) -> ClassifiedError {
    if let Some(c) = BAD_STATUS_RE.captures(line) {
        return ClassifiedError::BadStatus {
            path: c[1].to_string(),
            status: c[2].to_string(),
            error: c[3].to_string(),
        };
    }
    if let Some(c) = QUERY_FAILED_RE.captures(line) {
        return ClassifiedError::QueryFailed {
            counter_name: c[1].to_string(),
            local_name: c[2].to_string(),
            lid: c[3].to_string(),
            port: c[4].to_string(),
        };
    }
    if RECV_FAILED_RE.is_match(line) {
        return ClassifiedError::RecvFailed;
    }
    if let Some(c) = MAD_RPC_FAILED_RE.captures(line) {
        return ClassifiedError::MadRpcFailed {
            portid: c[1].to_string(),
        };
    }
    if let Some(c) = QUERY_CAP_MASK_RE.captures(line) {
        return ClassifiedError::QueryCapMask {
            counter_name: c[1].to_string(),
            local_name: c[2].to_string(),
            portid: c[3].to_string(),
            port: c[4].to_string(),
        };
    }
    if let Some(c) = PRINT_ERRORS_RE.captures(line) {
        return ClassifiedError::PrintError {
            counter_name: c[1].to_string(),
            local_name: c[2].to_string(),
            portid: c[3].to_string(),
            port: c[4].to_string(),
        };
    }
    ClassifiedError::Unparsed(line.to_string())
}

/// Classifies every non-blank line of an error stream.
pub fn classify_stream(stderr: &str) -> Vec<ClassifiedError> {
    stderr
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            tracing::debug!(line, "stderr line");
            classify_line(line)
        })
        .collect()
}

/// Distinct labeled error series kept by default.
pub const DEFAULT_MAX_ERROR_SERIES: usize = 10_000;

/// Running totals of classified errors over the process lifetime.
///
/// Label values carry free text (DR paths, error messages), so the number
/// of series is capped. Lines that would open a series beyond the cap are
/// counted in `dropped_lines` instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorTally {
    counts: BTreeMap<(ErrorKind, Vec<String>), u64>,
    max_series: usize,
    pub unparsed_lines: u64,
    pub skipped_report_lines: u64,
    pub dropped_lines: u64,
}

impl Default for ErrorTally {
    fn default() -> Self {
        Self::with_max_series(DEFAULT_MAX_ERROR_SERIES)
    }
}

impl ErrorTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_series(max_series: usize) -> Self {
        Self {
            counts: BTreeMap::new(),
            max_series,
            unparsed_lines: 0,
            skipped_report_lines: 0,
            dropped_lines: 0,
        }
    }

    /// Adds one classified line.
    pub fn record(&mut self, error: &ClassifiedError) {
        match error {
            ClassifiedError::Unparsed(_) => self.unparsed_lines += 1,
            ClassifiedError::RecvFailed => {}
            other => {
                let Some(kind) = other.kind() else {
                    return;
                };
                let labels = other.label_values().into_iter().map(str::to_string).collect();
                let key = (kind, labels);
                if let Some(count) = self.counts.get_mut(&key) {
                    *count += 1;
                } else if self.counts.len() < self.max_series {
                    self.counts.insert(key, 1);
                } else {
                    if self.dropped_lines == 0 {
                        tracing::warn!(
                            max_series = self.max_series,
                            "error series limit reached, further new series are dropped"
                        );
                    }
                    self.dropped_lines += 1;
                }
            }
        }
    }

    /// Total for one labeled series.
    pub fn count(&self, kind: ErrorKind, labels: &[&str]) -> u64 {
        let key = (kind, labels.iter().map(|s| s.to_string()).collect());
        self.counts.get(&key).copied().unwrap_or(0)
    }

    /// All labeled series of one family.
    pub fn series(&self, kind: ErrorKind) -> impl Iterator<Item = (&[String], u64)> {
        self.counts
            .iter()
            .filter(move |((k, _), _)| *k == kind)
            .map(|((_, labels), count)| (labels.as_slice(), *count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::scenarios::MIXED_STDERR;

    #[test]
    fn test_query_failed() {
        let line = "ibwarn: [12345] query_and_dump: PortXmitWait query failed on node07 HCA-1, Lid 42 port 1";
        assert_eq!(
            classify_line(line),
            ClassifiedError::QueryFailed {
                counter_name: "PortXmitWait".into(),
                local_name: "node07 HCA-1".into(),
                lid: "42".into(),
                port: "1".into(),
            }
        );
    }

    #[test]
    fn test_bad_status() {
        let line = "src/query_smp.c:228; mad (DR path slid 0; dlid 0; 0,1,19 Attr 0x11:0) bad status 110; Operation timed out";
        assert_eq!(
            classify_line(line),
            ClassifiedError::BadStatus {
                path: "DR path slid 0; dlid 0; 0,1,19".into(),
                status: "110".into(),
                error: "Operation timed out".into(),
            }
        );
    }

    #[test]
    fn test_umad_bad_status() {
        let line = "src/query_smp.c:197; umad (DR path slid 0; dlid 0; 0,1 Attr 0x15:1) bad status 7; Invalid attribute";
        assert!(matches!(classify_line(line), ClassifiedError::BadStatus { .. }));
    }

    #[test]
    fn test_mad_rpc_and_recv_failed() {
        assert_eq!(
            classify_line("ibwarn: [99] mad_rpc: _do_madrpc failed; dport (Lid 42)"),
            ClassifiedError::MadRpcFailed {
                portid: "Lid 42".into()
            }
        );
        assert_eq!(
            classify_line("ibwarn: [99] _do_madrpc: recv failed: Connection timed out"),
            ClassifiedError::RecvFailed
        );
    }

    #[test]
    fn test_cap_mask_and_print_errors() {
        let cap = classify_line(
            "ibwarn: [1] query_cap_mask: PortCounters query failed on node08, Lid 43 port 1",
        );
        assert_eq!(cap.kind(), Some(ErrorKind::QueryCapMask));
        assert_eq!(cap.label_values(), vec!["PortCounters", "node08", "Lid 43", "1"]);

        let print = classify_line(
            "ibwarn: [1] print_errors: PortCounters query failed on node09, Lid 44 port 2",
        );
        assert_eq!(print.kind(), Some(ErrorKind::PrintError));
        assert_eq!(print.label_values(), vec!["PortCounters", "node09", "Lid 44", "2"]);
    }

    #[test]
    fn test_unparsed() {
        let e = classify_line("ibwarn: [1] something new in infiniband-diags 60.0");
        assert!(matches!(e, ClassifiedError::Unparsed(_)));
        assert_eq!(e.kind(), None);
    }

    #[test]
    fn test_label_names_match_values() {
        let all = classify_stream(MIXED_STDERR);
        for e in &all {
            if let Some(kind) = e.kind() {
                assert_eq!(kind.label_names().len(), e.label_values().len());
            }
        }
    }

    #[test]
    fn test_classify_stream_covers_every_kind() {
        let all = classify_stream(MIXED_STDERR);
        assert_eq!(all.len(), 7);
        for kind in ErrorKind::ALL {
            assert_eq!(all.iter().filter(|e| e.kind() == Some(kind)).count(), 1);
        }
        assert_eq!(all.iter().filter(|e| **e == ClassifiedError::RecvFailed).count(), 1);
    }

    #[test]
    fn test_tally_accumulates() {
        let mut tally = ErrorTally::new();
        for e in classify_stream(MIXED_STDERR) {
            tally.record(&e);
        }
        for e in classify_stream(MIXED_STDERR) {
            tally.record(&e);
        }
        assert_eq!(
            tally.count(ErrorKind::QueryFailed, &["PortXmitWait", "node07 HCA-1", "42", "1"]),
            2
        );
        assert_eq!(tally.unparsed_lines, 2);
        assert_eq!(tally.series(ErrorKind::MadRpcFailed).count(), 1);
    }

    #[test]
    fn test_tally_series_capped() {
        let mut tally = ErrorTally::with_max_series(2);
        for status in 0..5 {
            let line = format!(
                "src/query_smp.c:228; mad (DR path slid 0; dlid 0; 0,1,{} Attr 0x11:0) bad status 110; Operation timed out",
                status
            );
            tally.record(&classify_line(&line));
        }
        assert_eq!(tally.series(ErrorKind::BadStatus).count(), 2);
        assert_eq!(tally.dropped_lines, 3);

        // Existing series keep counting at the cap.
        tally.record(&classify_line(
            "src/query_smp.c:228; mad (DR path slid 0; dlid 0; 0,1,0 Attr 0x11:0) bad status 110; Operation timed out",
        ));
        assert_eq!(
            tally.count(
                ErrorKind::BadStatus,
                &["DR path slid 0; dlid 0; 0,1,0", "110", "Operation timed out"]
            ),
            2
        );
        assert_eq!(tally.dropped_lines, 3);
    }
}
