//! Pre-built `ibqueryerrors` outputs for testing.
//!
//! These mirror what the infiniband-diags tools print on a small fabric:
//! one leaf switch, a couple of adapters, a cable left unplugged and the
//! usual assortment of `ibwarn` noise on stderr.

use super::mock::{MockResponse, MockRunner};

/// One switch port with a single counter (and its `port ALL` summary).
pub const SINGLE_SWITCH_PORT: &str = "\
Errors for 0x506b4b03005d3101 \"leaf01\"
   GUID 0x506b4b03005d3101 port ALL: [LinkDownedCounter == 1]
   GUID 0x506b4b03005d3101 port 2: [LinkDownedCounter == 1]
   Link info:     12    2[  ] ==( 4X      25.78125 Gbps Active/  LinkUp)==>  0x506b4b0300e5e461     5    1[  ] \"node01 HCA-1\" ( )

## Summary: 1 nodes checked, 1 bad nodes found
##      1 ports checked, 1 ports have errors beyond threshold
";

/// A leaf switch with three ports (one cable unplugged) and one adapter.
pub const SMALL_FABRIC: &str = "\
Errors for 0x506b4b03005d3100 \"leaf01\"
   GUID 0x506b4b03005d3100 port ALL: [LinkDownedCounter == 1] [PortXmitWait == 1500] [SymbolErrorCounter == 3]
   GUID 0x506b4b03005d3100 port 1: [PortXmitWait == 1500] [PortXmitData == 987654321 (3.679GB)]
   Link info:     12    1[  ] ==( 4X      25.78125 Gbps Active/  LinkUp)==>  0x506b4b0300e5e461     5    1[  ] \"node01 HCA-1\" ( )
   GUID 0x506b4b03005d3100 port 2: [LinkDownedCounter == 1]
   Link info:     12    2[  ] ==( 4X      25.78125 Gbps Active/  LinkUp)==>  0x506b4b0300e5e471     6    1[  ] \"node02 HCA-1\" ( )
   GUID 0x506b4b03005d3100 port 3: [SymbolErrorCounter == 3]
   Link info:     12    3[  ] ==( 4X       2.5 Gbps   Down/ Polling)==>             [  ] \"\" ( )
Errors for \"node01 HCA-1\"
   GUID 0x506b4b0300e5e461 port 1: [PortXmitData == 123456789 (470.9MB)] [PortRcvData == 223456789 (852.4MB)]
   Link info:      5    1[  ] ==( 4X      25.78125 Gbps Active/  LinkUp)==>  0x506b4b03005d3100    12    1[  ] \"leaf01\" ( )

## Summary: 2 nodes checked, 2 bad nodes found
##      4 ports checked, 4 ports have errors beyond threshold
";

/// One line of every kind the error classifier knows, plus one it does not.
pub const MIXED_STDERR: &str = "\
ibwarn: [12345] query_and_dump: PortXmitWait query failed on node07 HCA-1, Lid 42 port 1
src/query_smp.c:228; mad (DR path slid 0; dlid 0; 0,1,19 Attr 0x11:0) bad status 110; Operation timed out
ibwarn: [12345] _do_madrpc: recv failed: Connection timed out
ibwarn: [12345] mad_rpc: _do_madrpc failed; dport (Lid 42)
ibwarn: [12345] query_cap_mask: PortCounters query failed on node08, Lid 43 port 1
ibwarn: [12345] print_errors: PortCounters query failed on node09, Lid 44 port 2
something completely different
";

/// Builds a single-port report for `LinkDownedCounter` at `value`.
pub fn link_downed_report(value: u64) -> String {
    format!(
        "\
Errors for 0x506b4b03005d3101 \"leaf01\"
   GUID 0x506b4b03005d3101 port ALL: [LinkDownedCounter == {value}]
   GUID 0x506b4b03005d3101 port 2: [LinkDownedCounter == {value}]
   Link info:     12    2[  ] ==( 4X      25.78125 Gbps Active/  LinkUp)==>  0x506b4b0300e5e461     5    1[  ] \"node01 HCA-1\" ( )
"
    )
}

impl MockRunner {
    /// `ibqueryerrors` prints [`SMALL_FABRIC`] with a clean stderr and
    /// `perfquery` resets succeed.
    pub fn healthy_fabric() -> Self {
        Self::new()
            .with_response("ibqueryerrors", MockResponse::output(SMALL_FABRIC, ""))
            .with_response("perfquery", MockResponse::output("", ""))
    }

    /// Like [`MockRunner::healthy_fabric`] but stderr carries [`MIXED_STDERR`].
    pub fn noisy_fabric() -> Self {
        Self::new()
            .with_response(
                "ibqueryerrors",
                MockResponse::output(SMALL_FABRIC, MIXED_STDERR),
            )
            .with_response("perfquery", MockResponse::output("", ""))
    }
}
