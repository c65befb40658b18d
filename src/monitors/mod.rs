//! Problem monitors
//!
//! A monitor observes one signal source on its own threads and emits
//! [`Status`] batches through the channel returned by [`Monitor::start`].

use crate::config::DefaultCondition;
use crate::error::MonitorError;
use crate::types::{Condition, ConditionStatus, Status, Timestamp};
use axum::Router;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::thread;
use std::time::Duration;

/// Log file monitor
pub mod log_monitor;

/// Incremental log file reader
pub mod log_watcher;

/// External check command monitor
pub mod plugin_monitor;

pub use log_monitor::LogMonitor;
pub use plugin_monitor::PluginMonitor;

/// Capability shared by every monitor variant
#[cfg_attr(test, mockall::automock)]
pub trait Monitor: Send {
    /// Name used as the source of emitted statuses
    fn name(&self) -> &str;

    /// Start observing; statuses arrive on the returned channel in emission order
    fn start(&mut self) -> Result<Receiver<Status>, MonitorError>;

    /// Stop observing and release threads and child processes
    fn stop(&mut self) -> Result<(), MonitorError>;

    /// Mount monitor-specific diagnostic endpoints
    fn register_http_handlers(&self, router: Router) -> Router {
        router
    }
}

/// Conditions a monitor reports as `False` when it starts
pub(crate) fn initial_conditions(
    defaults: &[DefaultCondition],
    now: Timestamp,
) -> Vec<Condition> {
    defaults
        .iter()
        .map(|d| {
            Condition::new(
                d.condition_type.clone(),
                ConditionStatus::False,
                d.reason.clone(),
                d.message.clone(),
                now,
            )
        })
        .collect()
}

/// Sleep up to `duration`, returning early once `running` is cleared
pub(crate) fn sleep_while_running(running: &AtomicBool, duration: Duration) {
    let slice = Duration::from_millis(50);
    let mut remaining = duration;
    while remaining > Duration::ZERO && running.load(Ordering::SeqCst) {
        let step = remaining.min(slice);
        thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
}
