// Telemetry core for the livecast broadcaster.
//
// Tracks per-stream transcode outcomes in a sliding window, exposes the
// resulting success rate and segment counters/histograms through an embedded
// Prometheus registry, and runs a watchdog that closes the books on segments
// whose transcoded renditions never arrive.

use std::time::Duration;

pub mod averager;
pub mod codes;
pub mod logging;
pub mod monitor;

pub use codes::{SegmentTranscodeError, SegmentUploadError};
pub use monitor::Monitor;

/// Grace interval after which an unresolved segment is declared lost.
pub const TIME_TO_WAIT_FOR_ERROR: Duration = Duration::from_millis(8_500);

/// Period between watchdog sweeps.
pub const WATCHDOG_PAUSE: Duration = Duration::from_secs(15);

/// Number of recent segments the per-stream success rate is computed over.
pub const SUCCESS_WINDOW: usize = 30;
