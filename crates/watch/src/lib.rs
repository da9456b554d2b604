//! freightline watch: bridges live event streams into the resource cache.
//!
//! A [`WatchSession`] consumes one stream for one `(scope, kind)` partition,
//! applying every event through the reducer and handing the resolved resource
//! to an optional callback. The [`WatchRegistry`] keeps at most one session per
//! partition.

#![forbid(unsafe_code)]

pub mod registry;
pub mod session;
pub mod source;

pub use registry::{SessionOutcome, WatchRegistry};
pub use session::{OnResource, Resolved, SessionEnd, SessionStats, SessionSummary, WatchError, WatchHandle, WatchSession};
pub use source::{ChannelSource, EventSource, EventStream, ReplaySource, SourceError};
