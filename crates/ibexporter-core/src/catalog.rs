//! Known InfiniBand port counters.
//!
//! Descriptions follow the IB specification (Release 1.3) and Mellanox's
//! mlx5 counter documentation. `bits` is the width of the hardware register,
//! which bounds the raw value and drives the reset high-water mark.

/// How operators should read a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Informative,
}

/// Static description of a hardware counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterInfo {
    pub name: &'static str,
    pub help: &'static str,
    pub severity: Severity,
    pub bits: u32,
}

/// Static description of a link gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GaugeInfo {
    pub name: &'static str,
    pub help: &'static str,
}

/// Prefix shared by every exported series.
pub const METRIC_PREFIX: &str = "infiniband";

pub const COUNTERS: &[CounterInfo] = &[
    CounterInfo {
        name: "LinkDownedCounter",
        help: "Total number of times the Port Training state machine has failed the link error recovery process and downed the link.",
        severity: Severity::Error,
        bits: 8,
    },
    CounterInfo {
        name: "SymbolErrorCounter",
        help: "Total number of minor link errors detected on one or more physical lanes.",
        severity: Severity::Error,
        bits: 16,
    },
    CounterInfo {
        name: "PortXmitDiscards",
        help: "Total number of outbound packets discarded by the port because the port is down or congested.",
        severity: Severity::Error,
        bits: 16,
    },
    // Head-of-queue timeouts, usually congestion and sometimes credit loops.
    CounterInfo {
        name: "PortSwHOQLifetimeLimitDiscards",
        help: "The number of packets dropped by running in a head-of-Queue timeout often caused by congestions, possibly by credit Loops.",
        severity: Severity::Error,
        bits: 16,
    },
    CounterInfo {
        name: "PortXmitWait",
        help: "The number of ticks during which the port had data to transmit but no data was sent during the entire tick (either because of insufficient credits or because of lack of arbitration).",
        severity: Severity::Informative,
        bits: 32,
    },
    CounterInfo {
        name: "PortXmitData",
        help: "Total number of data octets, divided by 4 (lanes), transmitted on all VLs.",
        severity: Severity::Informative,
        bits: 64,
    },
    CounterInfo {
        name: "PortRcvData",
        help: "Total number of data octets, divided by 4 (lanes), received on all VLs.",
        severity: Severity::Informative,
        bits: 64,
    },
    CounterInfo {
        name: "PortXmitPkts",
        help: "Total number of packets transmitted on all VLs from this port. This may include packets with errors.",
        severity: Severity::Informative,
        bits: 64,
    },
    CounterInfo {
        name: "PortRcvPkts",
        help: "Total number of packets received. This may include packets containing errors.",
        severity: Severity::Informative,
        bits: 64,
    },
    CounterInfo {
        name: "PortRcvErrors",
        help: "Total number of packets containing an error that were received on the port.",
        severity: Severity::Informative,
        bits: 16,
    },
    CounterInfo {
        name: "PortUnicastXmitPkts",
        help: "Total number of unicast packets transmitted on all VLs from the port. This may include unicast packets with errors.",
        severity: Severity::Informative,
        bits: 64,
    },
    CounterInfo {
        name: "PortUnicastRcvPkts",
        help: "Total number of unicast packets, including unicast packets containing errors.",
        severity: Severity::Informative,
        bits: 64,
    },
    CounterInfo {
        name: "PortMulticastXmitPkts",
        help: "Total number of multicast packets transmitted on all VLs from the port. This may include multicast packets with errors.",
        severity: Severity::Informative,
        bits: 64,
    },
    CounterInfo {
        name: "PortMulticastRcvPkts",
        help: "Total number of multicast packets, including multicast packets containing errors.",
        severity: Severity::Informative,
        bits: 64,
    },
    CounterInfo {
        name: "PortBufferOverrunErrors",
        help: "Total number of packets received on the part discarded due to buffer overrrun.",
        severity: Severity::Error,
        bits: 16,
    },
    CounterInfo {
        name: "PortLocalPhysicalErrors",
        help: "Total number of packets received with physical error like CRC error.",
        severity: Severity::Error,
        bits: 16,
    },
    CounterInfo {
        name: "PortRcvRemotePhysicalErrors",
        help: "Total number of packets marked with the EBP delimiter received on the port.",
        severity: Severity::Error,
        bits: 16,
    },
    CounterInfo {
        name: "PortInactiveDiscards",
        help: "Total number of packets discarded due to the port being in the inactive state.",
        severity: Severity::Error,
        bits: 16,
    },
    CounterInfo {
        name: "PortDLIDMappingErrors",
        help: "Total number of packets on the port that could not be forwared by the switch due to DLID mapping errors.",
        severity: Severity::Error,
        bits: 16,
    },
    CounterInfo {
        name: "LinkErrorRecoveryCounter",
        help: "Total number of times the Port Training state machine has successfully completed the link error recovery process.",
        severity: Severity::Error,
        bits: 8,
    },
    CounterInfo {
        name: "LocalLinkIntegrityErrors",
        help: "The number of times that the count of local physical errors exceeded the threshold specified by LocalPhyErrors.",
        severity: Severity::Error,
        bits: 4,
    },
    CounterInfo {
        name: "VL15Dropped",
        help: "The number of incoming VL15 packets dropped due to resource limitations (for example, lack of buffers) in the port.",
        severity: Severity::Error,
        bits: 16,
    },
    CounterInfo {
        name: "PortNeighborMTUDiscards",
        help: "Total outbound packets discarded by the port because packet length exceeded the neighbor MTU.",
        severity: Severity::Error,
        bits: 16,
    },
];

pub const SPEED: GaugeInfo = GaugeInfo {
    name: "Speed",
    help: "Link current speed per lane.",
};

pub const WIDTH: GaugeInfo = GaugeInfo {
    name: "Width",
    help: "Lanes per link.",
};

/// Looks up a counter by the name `ibqueryerrors` prints.
pub fn lookup(name: &str) -> Option<&'static CounterInfo> {
    COUNTERS.iter().find(|c| c.name == name)
}

/// Exported series name for a counter, e.g. `infiniband_linkdownedcounter_total`.
pub fn counter_metric_name(name: &str) -> String {
    format!("{}_{}_total", METRIC_PREFIX, name.to_lowercase())
}

/// Exported series name for a gauge, e.g. `infiniband_speed`.
pub fn gauge_metric_name(gauge: &GaugeInfo) -> String {
    format!("{}_{}", METRIC_PREFIX, gauge.name.to_lowercase())
}
