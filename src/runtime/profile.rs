//! Execution profiling.

use std::time::Duration;

use crate::config::DeviceKind;

/// Timing of one `execute` call. Immutable once delivered; observers
/// that keep a report clone it.
#[derive(Clone, Debug, PartialEq)]
pub struct ProfileReport {
    pub kernel: String,
    pub device: DeviceKind,
    pub pass_id: i32,
    pub work_items: usize,
    /// Source generation and device build, when this call compiled.
    pub compile: Option<Duration>,
    pub transfer: Duration,
    pub execute: Duration,
    /// True when the preferred device failed and a later one ran.
    pub fell_back: bool,
}

impl ProfileReport {
    pub fn total(&self) -> Duration {
        self.compile.unwrap_or_default() + self.transfer + self.execute
    }
}

pub trait ProfileObserver: Send + Sync {
    fn receive_report(&self, report: &ProfileReport);
}
