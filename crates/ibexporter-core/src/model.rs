//! Fabric entities produced by one parse of a diagnostic report.
//!
//! Everything here is rebuilt from scratch on every scrape. The only thing
//! that outlives a scrape is the counter state derived from [`CounterSample`]s
//! (see [`crate::store`]).

use std::collections::HashMap;
use std::fmt;

/// Whether a port belongs to a channel adapter or a switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    Ca,
    Switch,
}

impl ComponentKind {
    /// Label value used in exported series.
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Ca => "ca",
            ComponentKind::Switch => "switch",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a physical port: `(local_guid, local_port)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId {
    pub guid: String,
    pub port: u32,
}

impl PortId {
    pub fn new(guid: impl Into<String>, port: u32) -> Self {
        Self {
            guid: guid.into(),
            port,
        }
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} port {}", self.guid, self.port)
    }
}

/// The far end of a cable, as seen from the local port.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEndpoint {
    pub guid: String,
    pub lid: u32,
    pub port: u32,
    pub name: String,
}

impl RemoteEndpoint {
    pub fn port_id(&self) -> PortId {
        PortId::new(self.guid.clone(), self.port)
    }
}

/// Physical/logical state reported on the `Link info` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// `Active/  LinkUp`.
    Active,
    /// Anything else (Down/Polling, Init, Armed...).
    Down,
}

/// One port of a switch or adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct Port {
    pub id: PortId,
    pub lid: u32,
    pub local_name: String,
    pub kind: ComponentKind,
    /// `None` for a dangling cable end or a link that is not up.
    pub remote: Option<RemoteEndpoint>,
    /// Current speed per lane in Gbps.
    pub speed_gbps: Option<f64>,
    /// Lanes per link.
    pub width: Option<u32>,
    pub state: LinkState,
}

/// A single raw hardware counter reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSample {
    pub port: PortId,
    pub counter: String,
    pub raw: u64,
    pub bit_width: u32,
}

impl CounterSample {
    /// Largest value the hardware register can hold.
    pub fn max_value(&self) -> u64 {
        max_value(self.bit_width)
    }
}

/// Largest value representable in `bit_width` bits.
pub fn max_value(bit_width: u32) -> u64 {
    if bit_width >= 64 {
        u64::MAX
    } else {
        (1u64 << bit_width) - 1
    }
}

/// A port together with the counters reported for it in one scrape.
#[derive(Debug, Clone, PartialEq)]
pub struct PortRecord {
    pub port: Port,
    pub samples: Vec<CounterSample>,
    /// Counters present in the report but missing from the catalog.
    pub unknown_counters: Vec<(String, u64)>,
}

/// Two ports whose remote descriptors point at each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Link {
    pub a: PortId,
    pub b: PortId,
}

/// Links inferred from one report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Topology {
    pub links: Vec<Link>,
    /// Ports without any remote endpoint.
    pub dangling: Vec<PortId>,
    /// Ports pointing at a remote that is absent from the report or does
    /// not point back.
    pub one_sided: Vec<PortId>,
}

/// Derives symmetric links from remote back-references.
///
/// Duplicate records for the same port are tolerated; the link is
/// reported once.
pub fn derive_links(records: &[PortRecord]) -> Topology {
    let by_id: HashMap<&PortId, &Port> = records.iter().map(|r| (&r.port.id, &r.port)).collect();

    let mut topology = Topology::default();
    for record in records {
        let port = &record.port;
        let Some(remote) = &port.remote else {
            topology.dangling.push(port.id.clone());
            continue;
        };

        let remote_id = remote.port_id();
        let mirrored = by_id
            .get(&remote_id)
            .and_then(|other| other.remote.as_ref())
            .is_some_and(|back| back.guid == port.id.guid && back.port == port.id.port);

        if !mirrored {
            topology.one_sided.push(port.id.clone());
            continue;
        }

        let (a, b) = if port.id <= remote_id {
            (port.id.clone(), remote_id)
        } else {
            (remote_id, port.id.clone())
        };
        topology.links.push(Link { a, b });
    }

    topology.links.sort();
    topology.links.dedup();
    topology.dangling.sort();
    topology.dangling.dedup();
    topology.one_sided.sort();
    topology.one_sided.dedup();
    topology
}
