use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Microseconds since the Unix epoch. Ordering and equality only matter for
/// the framework itself (it stamps `poll` wake-ups and message arrivals);
/// the textual form exists for logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

const MICROS_PER_SECOND: u64 = 1_000_000;

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn from_micros(micros: u64) -> Self {
        Timestamp(micros)
    }

    /// Wall-clock "now", taken immediately after the multiplexer wakes up
    /// (§4.2). Monotonic *enough* for logging/ordering purposes within a
    /// single poll cycle; this core never uses it for scheduling.
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(since_epoch.as_micros() as u64)
    }

    pub fn micros_since_epoch(&self) -> u64 {
        self.0
    }

    pub fn seconds_since_epoch(&self) -> u64 {
        self.0 / MICROS_PER_SECOND
    }

    /// Saturating difference in microseconds; never panics on underflow.
    pub fn elapsed_since(&self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.seconds_since_epoch();
        let micros = self.0 % MICROS_PER_SECOND;
        write!(f, "{secs}.{micros:06}")
    }
}
