//! Operator-supplied GUID → node name aliases.
//!
//! Same file format as the `--node-name-map` option of the infiniband-diags
//! tools: one `0x<guid> "<name>"` pair per line. Lines that do not match
//! (comments, blanks) are ignored.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

static MAP_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^\s*(0[xX][0-9A-Fa-f]+)\s+"(.*)""#).expect("invalid regex"));

/// Error loading a node name map file.
#[derive(Debug)]
pub struct NodeNameMapError {
    pub path: PathBuf,
    pub source: std::io::Error,
}

impl fmt::Display for NodeNameMapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot read node name map {}: {}",
            self.path.display(),
            self.source
        )
    }
}

impl std::error::Error for NodeNameMapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// GUID → human readable name.
#[derive(Debug, Clone, Default)]
pub struct NodeNameMap {
    names: HashMap<String, String>,
}

impl NodeNameMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses map file content.
    pub fn parse(content: &str) -> Self {
        let names = content
            .lines()
            .filter_map(|line| MAP_LINE_RE.captures(line))
            .map(|caps| (caps[1].to_ascii_lowercase(), caps[2].to_string()))
            .collect();
        Self { names }
    }

    /// Reads and parses a map file.
    pub fn load(path: &Path) -> Result<Self, NodeNameMapError> {
        let content = std::fs::read_to_string(path).map_err(|source| NodeNameMapError {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::parse(&content))
    }

    pub fn insert(&mut self, guid: &str, name: impl Into<String>) {
        self.names.insert(guid.to_ascii_lowercase(), name.into());
    }

    /// Alias for `guid`, if one is mapped.
    pub fn get(&self, guid: &str) -> Option<&str> {
        self.names.get(&guid.to_ascii_lowercase()).map(String::as_str)
    }

    /// Alias for `guid`, or `fallback` when none is mapped.
    pub fn resolve<'a>(&'a self, guid: &str, fallback: &'a str) -> &'a str {
        self.get(guid).unwrap_or(fallback)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
