//! Top-level error taxonomy: the packet-level vs. resource-level split
//! described in the design notes.

use nested_enum_utils::common_fields;
use snafu::{Backtrace, Snafu};

/// Errors the driver recovers from locally: logged, packet or cycle
/// dropped, daemon keeps running.
#[common_fields({
    backtrace: Option<Backtrace>,
})]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Recoverable {
    #[snafu(display("packet handling"))]
    Packet { source: crate::neighbor::Error },
}

/// Errors that indicate a resource the daemon depends on has gone bad in a
/// way local retries cannot fix; propagated to the caller of [`crate::Service::run`]
/// so an external supervisor can restart the process.
#[common_fields({
    backtrace: Option<Backtrace>,
})]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Fatal {
    #[snafu(display("broadcasting to neighbors"))]
    Broadcast { source: crate::neighbor::Error },
    #[snafu(display("merging neighbor trees"))]
    Merge { source: crate::merge::Error },
    #[snafu(display("control channel closed unexpectedly"))]
    ChannelClosed,
}
