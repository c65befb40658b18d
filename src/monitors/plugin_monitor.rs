//! Plugin monitor
//!
//! Runs configured check commands on their own intervals. A scheduler thread
//! hands due plugins to a fixed pool of worker threads; each run is bounded
//! by its timeout and a plugin never overlaps with itself.

use crate::config::{DefaultCondition, PluginConfig, PluginMonitorConfig};
use crate::error::{ConfigError, MonitorError};
use crate::monitors::{initial_conditions, sleep_while_running, Monitor};
use crate::rules::{ExitStatus, RuleEngine, RuleInput};
use crate::types::{Condition, ConditionStatus, Event, Severity, Status, Timestamp};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use wait_timeout::ChildExt;

/// How long to wait for a finished plugin's output pipes to drain
const OUTPUT_COLLECTION_TIMEOUT: Duration = Duration::from_secs(1);

/// Longest the scheduler sleeps before re-checking due plugins
const SCHEDULER_TICK: Duration = Duration::from_millis(50);

/// Reason of the event emitted for a timed-out run no rule classifies
pub const PLUGIN_TIMEOUT_REASON: &str = "PluginTimeout";

/// A configured plugin with its rules compiled
#[derive(Debug)]
struct Plugin {
    config: PluginConfig,
    engine: RuleEngine,
    owned_conditions: Vec<String>,
}

/// Outcome of one plugin run
#[derive(Debug, Clone, PartialEq)]
pub struct PluginResult {
    pub exit_status: ExitStatus,
    pub output: String,
    pub timed_out: bool,
    /// Set when the command could not be spawned or waited for
    pub failure: Option<String>,
}

/// Counters exposed on the diagnostic endpoint
#[derive(Debug, Clone, Default, Serialize)]
pub struct PluginStats {
    pub runs_started: u64,
    pub runs_timed_out: u64,
    pub ticks_skipped: u64,
    pub per_plugin_runs: HashMap<String, u64>,
}

/// Plugins currently executing, keyed by plugin name
///
/// Holding a name here is what keeps a slow plugin from being started again.
#[derive(Debug, Default)]
struct InFlight {
    runs: Mutex<HashMap<String, Option<u32>>>,
}

impl InFlight {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Option<u32>>> {
        self.runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim a plugin for a run; false when it is already running
    fn try_claim(&self, name: &str) -> bool {
        let mut runs = self.lock();
        if runs.contains_key(name) {
            return false;
        }
        runs.insert(name.to_string(), None);
        true
    }

    fn set_pid(&self, name: &str, pid: u32) {
        if let Some(slot) = self.lock().get_mut(name) {
            *slot = Some(pid);
        }
    }

    fn release(&self, name: &str) {
        self.lock().remove(name);
    }

    fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Force-terminate every running plugin
    fn kill_all(&self) {
        for (name, pid) in self.lock().iter() {
            if let Some(pid) = pid {
                warn!("Killing plugin {} (pid {}) after shutdown grace period", name, pid);
                kill_process_group(*pid);
            }
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    // Plugins run in their own process group so helpers they spawn die too
    unsafe {
        libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

/// Consecutive run failures per plugin and the plugins past the threshold
#[derive(Debug, Default)]
struct PluginHealth {
    failures: HashMap<String, u32>,
    degraded: BTreeSet<String>,
}

/// Shared state handed to the scheduler and worker threads
struct Shared {
    source: String,
    plugins: Vec<Plugin>,
    default_conditions: Vec<DefaultCondition>,
    max_output_length: usize,
    health_type: String,
    max_consecutive_failures: u32,
    running: AtomicBool,
    in_flight: InFlight,
    health: Mutex<PluginHealth>,
    stats: Mutex<PluginStats>,
}

impl Shared {
    fn stats(&self) -> MutexGuard<'_, PluginStats> {
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn health_condition(
        &self,
        status: ConditionStatus,
        reason: &str,
        message: String,
        now: Timestamp,
    ) -> Condition {
        Condition::new(self.health_type.clone(), status, reason, message, now)
    }

    /// Track one run's outcome, returning the health condition when it flips
    ///
    /// Detection is degraded while any plugin has failed to run
    /// `max_consecutive_failures` times in a row.
    fn record_run(
        &self,
        plugin: &str,
        failure: Option<&str>,
        now: Timestamp,
    ) -> Option<Condition> {
        let mut health = self.health.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match failure {
            Some(failure) => {
                let count = health.failures.entry(plugin.to_string()).or_insert(0);
                *count += 1;
                let count = *count;
                if count < self.max_consecutive_failures || health.degraded.contains(plugin) {
                    return None;
                }
                error!(
                    "{}: plugin {} failed to run {} times in a row, reporting degraded detection",
                    self.source, plugin, count
                );
                let was_healthy = health.degraded.is_empty();
                health.degraded.insert(plugin.to_string());
                was_healthy.then(|| {
                    self.health_condition(
                        ConditionStatus::Unknown,
                        "PluginUnavailable",
                        format!("cannot run plugin {}: {}", plugin, failure),
                        now,
                    )
                })
            }
            None => {
                health.failures.remove(plugin);
                if !health.degraded.remove(plugin) || !health.degraded.is_empty() {
                    return None;
                }
                info!("{}: plugin {} runs again, detection recovered", self.source, plugin);
                Some(self.health_condition(
                    ConditionStatus::False,
                    "PluginsAvailable",
                    "all plugins can be run".to_string(),
                    now,
                ))
            }
        }
    }
}

/// Runs external check commands and classifies their results
pub struct PluginMonitor {
    config: PluginMonitorConfig,
    shared: Arc<Shared>,
    scheduler_handle: Option<JoinHandle<()>>,
    worker_handles: Vec<JoinHandle<()>>,
}

impl PluginMonitor {
    /// Create a monitor from a validated configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when a value is out of range or a rule does not compile.
    pub fn new(config: PluginMonitorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let plugins = config
            .plugins
            .iter()
            .map(|plugin| {
                let engine = RuleEngine::from_configs(&plugin.rules)?;
                let owned_conditions = engine
                    .permanent_condition_types()
                    .into_iter()
                    .map(str::to_string)
                    .collect();
                Ok(Plugin {
                    config: plugin.clone(),
                    engine,
                    owned_conditions,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        info!(
            "Loaded plugin monitor {} with {} plugins (concurrency {})",
            config.source,
            plugins.len(),
            config.concurrency
        );

        let shared = Arc::new(Shared {
            source: config.source.clone(),
            plugins,
            default_conditions: config.default_conditions.clone(),
            max_output_length: config.max_output_length,
            health_type: config.health_condition_type(),
            max_consecutive_failures: config.max_consecutive_failures,
            running: AtomicBool::new(false),
            in_flight: InFlight::default(),
            health: Mutex::new(PluginHealth::default()),
            stats: Mutex::new(PluginStats::default()),
        });

        Ok(Self {
            config,
            shared,
            scheduler_handle: None,
            worker_handles: Vec::new(),
        })
    }

    /// Check if the monitor is currently running
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Copy of the current run counters
    pub fn stats(&self) -> PluginStats {
        self.shared.stats().clone()
    }

    /// Run a plugin command once, bounded by `timeout`
    pub fn run_command(
        plugin: &PluginConfig,
        max_output_length: usize,
        on_spawn: impl FnOnce(u32),
    ) -> PluginResult {
        let mut command = Command::new(&plugin.path);
        command
            .args(&plugin.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(
                    "Failed to spawn plugin {} ({}): {}",
                    plugin.name,
                    plugin.path.display(),
                    e
                );
                let failure = format!("failed to spawn {}: {}", plugin.path.display(), e);
                return PluginResult {
                    exit_status: ExitStatus::Unknown,
                    output: truncate_output(&failure, max_output_length),
                    timed_out: false,
                    failure: Some(failure),
                };
            }
        };
        on_spawn(child.id());

        let (stdout_rx, stderr_rx) = Self::collect_output(&mut child);
        let timeout = plugin.timeout();
        let mut failure = None;
        let (exit_status, timed_out) = match child.wait_timeout(timeout) {
            Ok(Some(status)) => (ExitStatus::from_code(status.code()), false),
            Ok(None) => {
                warn!("Plugin {} timed out after {:?}", plugin.name, timeout);
                kill_process_group(child.id());
                let _ = child.kill();
                let _ = child.wait();
                (ExitStatus::Unknown, true)
            }
            Err(e) => {
                error!("Failed to wait for plugin {}: {}", plugin.name, e);
                failure = Some(format!("failed to wait for {}: {}", plugin.path.display(), e));
                let _ = child.kill();
                let _ = child.wait();
                (ExitStatus::Unknown, false)
            }
        };

        let stdout = stdout_rx
            .recv_timeout(OUTPUT_COLLECTION_TIMEOUT)
            .unwrap_or_default();
        if let Ok(stderr) = stderr_rx.recv_timeout(OUTPUT_COLLECTION_TIMEOUT) {
            if !stderr.trim().is_empty() {
                debug!("Plugin {} stderr: {}", plugin.name, stderr.trim());
            }
        }

        PluginResult {
            exit_status,
            output: truncate_output(&stdout, max_output_length),
            timed_out,
            failure,
        }
    }

    /// Read stdout and stderr on helper threads so a full pipe never blocks the child
    fn collect_output(child: &mut Child) -> (Receiver<String>, Receiver<String>) {
        fn spawn_reader<R: Read + Send + 'static>(stream: Option<R>) -> Receiver<String> {
            let (tx, rx) = mpsc::channel();
            match stream {
                Some(mut stream) => {
                    thread::spawn(move || {
                        let mut buf = Vec::new();
                        let _ = stream.read_to_end(&mut buf);
                        let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
                    });
                }
                None => {
                    let _ = tx.send(String::new());
                }
            }
            rx
        }

        (
            spawn_reader(child.stdout.take()),
            spawn_reader(child.stderr.take()),
        )
    }

    /// Translate one plugin result into a status
    fn status_for_result(
        shared: &Shared,
        plugin: &Plugin,
        result: &PluginResult,
        now: Timestamp,
    ) -> Option<Status> {
        let mut status = Status::new(&shared.source, now);
        let input = RuleInput::Plugin {
            exit_status: result.exit_status,
            output: &result.output,
        };

        match plugin.engine.evaluate(&input) {
            Some(classification) => match classification.severity {
                Severity::Permanent => {
                    let condition_type = classification.condition_type?;
                    status.conditions.push(Condition::new(
                        condition_type,
                        ConditionStatus::True,
                        classification.reason,
                        classification.message,
                        now,
                    ));
                }
                Severity::Temporary => {
                    status.events.push(Event::warning(
                        &shared.source,
                        classification.reason,
                        classification.message,
                        now,
                    ));
                }
            },
            None if result.exit_status == ExitStatus::Ok => {
                // Checks are level-triggered: a healthy run clears what the plugin owns
                for condition_type in &plugin.owned_conditions {
                    let (reason, message) = shared
                        .default_conditions
                        .iter()
                        .find(|d| &d.condition_type == condition_type)
                        .map(|d| (d.reason.clone(), d.message.clone()))
                        .unwrap_or_else(|| {
                            (
                                "PluginCheckPassed".to_string(),
                                format!("{} returned ok", plugin.config.name),
                            )
                        });
                    status.conditions.push(Condition::new(
                        condition_type.clone(),
                        ConditionStatus::False,
                        reason,
                        message,
                        now,
                    ));
                }
            }
            None if result.timed_out => {
                status.events.push(Event::warning(
                    &shared.source,
                    PLUGIN_TIMEOUT_REASON,
                    format!(
                        "plugin {} timed out after {:?}",
                        plugin.config.name,
                        plugin.config.timeout()
                    ),
                    now,
                ));
            }
            None => {
                debug!(
                    "Plugin {} returned {:?} with no matching rule",
                    plugin.config.name, result.exit_status
                );
            }
        }

        if status.is_empty() {
            None
        } else {
            Some(status)
        }
    }

    fn scheduler_thread(shared: Arc<Shared>, jobs: Sender<usize>) {
        let start = Instant::now();
        let mut next_due: Vec<Instant> = vec![start; shared.plugins.len()];

        while shared.running.load(Ordering::SeqCst) {
            let now = Instant::now();
            for (index, plugin) in shared.plugins.iter().enumerate() {
                if now < next_due[index] {
                    continue;
                }
                next_due[index] = now + plugin.config.interval();

                if !shared.in_flight.try_claim(&plugin.config.name) {
                    debug!(
                        "Plugin {} is still running, skipping this tick",
                        plugin.config.name
                    );
                    shared.stats().ticks_skipped += 1;
                    continue;
                }
                if jobs.send(index).is_err() {
                    shared.in_flight.release(&plugin.config.name);
                    return;
                }
            }

            let wait = next_due
                .iter()
                .min()
                .map(|due| due.saturating_duration_since(Instant::now()))
                .unwrap_or(SCHEDULER_TICK)
                .min(SCHEDULER_TICK);
            sleep_while_running(&shared.running, wait);
        }

        debug!("Plugin scheduler for {} finished", shared.source);
    }

    fn worker_thread(shared: Arc<Shared>, jobs: Arc<Mutex<Receiver<usize>>>, output: Sender<Status>) {
        loop {
            let job = {
                let receiver = jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                receiver.recv()
            };
            let index = match job {
                Ok(index) => index,
                Err(_) => break,
            };
            let plugin = &shared.plugins[index];

            if !shared.running.load(Ordering::SeqCst) {
                shared.in_flight.release(&plugin.config.name);
                continue;
            }

            {
                let mut stats = shared.stats();
                stats.runs_started += 1;
                *stats
                    .per_plugin_runs
                    .entry(plugin.config.name.clone())
                    .or_insert(0) += 1;
            }

            debug!("Running plugin {}", plugin.config.name);
            let result = Self::run_command(&plugin.config, shared.max_output_length, |pid| {
                shared.in_flight.set_pid(&plugin.config.name, pid)
            });
            shared.in_flight.release(&plugin.config.name);
            if result.timed_out {
                shared.stats().runs_timed_out += 1;
            }

            let now = Utc::now();
            let mut status = Self::status_for_result(&shared, plugin, &result, now)
                .unwrap_or_else(|| Status::new(&shared.source, now));
            if let Some(health) =
                shared.record_run(&plugin.config.name, result.failure.as_deref(), now)
            {
                status.conditions.push(health);
            }
            if !status.is_empty() && output.send(status).is_err() {
                debug!("Status channel for {} closed", shared.source);
                break;
            }
        }
    }
}

/// Trim plugin output and cut it to `max_len` bytes on a character boundary
pub fn truncate_output(output: &str, max_len: usize) -> String {
    let trimmed = output.trim();
    if trimmed.len() <= max_len {
        return trimmed.to_string();
    }
    let mut end = max_len;
    while end > 0 && !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    trimmed[..end].to_string()
}

impl Monitor for PluginMonitor {
    fn name(&self) -> &str {
        &self.config.source
    }

    fn start(&mut self) -> Result<Receiver<Status>, MonitorError> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(MonitorError::AlreadyStarted(self.config.source.clone()));
        }

        let (status_tx, status_rx) = mpsc::channel();
        let mut initial = Status::new(&self.config.source, Utc::now());
        initial.conditions = initial_conditions(&self.config.default_conditions, initial.timestamp);
        initial.conditions.push(self.shared.health_condition(
            ConditionStatus::False,
            "PluginsAvailable",
            "all plugins can be run".to_string(),
            initial.timestamp,
        ));
        // The receiver is still held here, so this cannot fail
        let _ = status_tx.send(initial);

        let (job_tx, job_rx) = mpsc::channel();
        let job_rx = Arc::new(Mutex::new(job_rx));

        for worker in 0..self.config.concurrency {
            let shared = Arc::clone(&self.shared);
            let jobs = Arc::clone(&job_rx);
            let output = status_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("plugin-worker-{}-{}", self.config.source, worker))
                .spawn(move || Self::worker_thread(shared, jobs, output))
                .map_err(|e| MonitorError::ThreadSpawn(e.to_string()));
            match handle {
                Ok(handle) => self.worker_handles.push(handle),
                Err(e) => {
                    self.shared.running.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }
        drop(status_tx);

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("plugin-scheduler-{}", self.config.source))
            .spawn(move || Self::scheduler_thread(shared, job_tx))
            .map_err(|e| {
                self.shared.running.store(false, Ordering::SeqCst);
                MonitorError::ThreadSpawn(e.to_string())
            })?;
        self.scheduler_handle = Some(handle);

        info!("Plugin monitor {} started", self.config.source);
        Ok(status_rx)
    }

    fn stop(&mut self) -> Result<(), MonitorError> {
        self.shared.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.scheduler_handle.take() {
            handle.join().map_err(|_| {
                MonitorError::SubprocessTerminated(format!(
                    "failed to join scheduler of {}",
                    self.config.source
                ))
            })?;
        }

        let deadline = Instant::now() + self.config.grace_period();
        while !self.shared.in_flight.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        if !self.shared.in_flight.is_empty() {
            self.shared.in_flight.kill_all();
        }

        for handle in self.worker_handles.drain(..) {
            if handle.join().is_err() {
                error!("Plugin worker of {} panicked", self.config.source);
            }
        }

        info!("Plugin monitor {} stopped", self.config.source);
        Ok(())
    }

    fn register_http_handlers(&self, router: Router) -> Router {
        let shared = Arc::clone(&self.shared);
        let path = format!("/monitors/{}", self.config.source);
        router.route(
            &path,
            get(move || {
                let snapshot = shared.stats().clone();
                async move { Json(snapshot) }
            }),
        )
    }
}

impl Drop for PluginMonitor {
    fn drop(&mut self) {
        if self.is_running() || self.scheduler_handle.is_some() {
            let _ = self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleConfig;
    use std::path::PathBuf;

    fn sh_plugin(name: &str, script: &str, timeout_secs: f64, interval_secs: f64) -> PluginConfig {
        PluginConfig {
            name: name.to_string(),
            path: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            timeout_secs,
            interval_secs,
            rules: Vec::new(),
        }
    }

    fn ntp_rule() -> RuleConfig {
        RuleConfig {
            severity: Severity::Permanent,
            condition: Some("NTPProblem".to_string()),
            reason: "NTPIsDown".to_string(),
            pattern: "NTP service is not running".to_string(),
            message: None,
            exit_status: None,
        }
    }

    fn monitor_config(plugins: Vec<PluginConfig>, concurrency: usize) -> PluginMonitorConfig {
        PluginMonitorConfig {
            source: "custom-plugin-monitor".to_string(),
            concurrency,
            max_output_length: 80,
            grace_period_secs: 0.2,
            max_consecutive_failures: 2,
            health_condition: None,
            default_conditions: vec![DefaultCondition {
                condition_type: "NTPProblem".to_string(),
                reason: "NTPIsUp".to_string(),
                message: "ntp service is up".to_string(),
            }],
            plugins,
        }
    }

    fn result(exit_status: ExitStatus, output: &str, timed_out: bool) -> PluginResult {
        PluginResult {
            exit_status,
            output: output.to_string(),
            timed_out,
            failure: None,
        }
    }

    fn classify(monitor: &PluginMonitor, result: &PluginResult) -> Option<Status> {
        PluginMonitor::status_for_result(
            &monitor.shared,
            &monitor.shared.plugins[0],
            result,
            Utc::now(),
        )
    }

    fn ntp_monitor() -> PluginMonitor {
        let mut plugin = sh_plugin("check_ntp", "exit 0", 1.0, 60.0);
        plugin.rules.push(ntp_rule());
        PluginMonitor::new(monitor_config(vec![plugin], 1)).unwrap()
    }

    #[test]
    fn test_truncate_output() {
        assert_eq!(truncate_output("  short  \n", 80), "short");
        assert_eq!(truncate_output("abcdef", 3), "abc");
        // 'é' is two bytes; never split it
        assert_eq!(truncate_output("aé", 2), "a");
    }

    #[test]
    fn test_non_ok_match_sets_condition() {
        let monitor = ntp_monitor();
        let status = classify(
            &monitor,
            &result(ExitStatus::NonOk, "NTP service is not running", false),
        )
        .unwrap();
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].condition_type, "NTPProblem");
        assert_eq!(status.conditions[0].status, ConditionStatus::True);
    }

    #[test]
    fn test_ok_run_clears_owned_conditions() {
        let monitor = ntp_monitor();
        let status = classify(&monitor, &result(ExitStatus::Ok, "", false)).unwrap();
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].status, ConditionStatus::False);
        assert_eq!(status.conditions[0].reason, "NTPIsUp");
    }

    #[test]
    fn test_timeout_uses_reserved_rule() {
        let monitor = ntp_monitor();
        let status = classify(&monitor, &result(ExitStatus::Unknown, "", true)).unwrap();
        assert!(status.conditions.is_empty());
        assert_eq!(status.events.len(), 1);
        assert_eq!(status.events[0].reason, PLUGIN_TIMEOUT_REASON);
    }

    #[test]
    fn test_user_unknown_rule_overrides_reserved_rule() {
        let mut plugin = sh_plugin("check_ntp", "exit 0", 1.0, 60.0);
        plugin.rules.push(RuleConfig {
            severity: Severity::Permanent,
            condition: Some("NTPProblem".to_string()),
            reason: "NTPCheckHung".to_string(),
            pattern: ".*".to_string(),
            message: Some("ntp check hung".to_string()),
            exit_status: Some(ExitStatus::Unknown),
        });
        let monitor = PluginMonitor::new(monitor_config(vec![plugin], 1)).unwrap();

        let status = classify(&monitor, &result(ExitStatus::Unknown, "", true)).unwrap();
        assert_eq!(status.conditions[0].reason, "NTPCheckHung");
        assert!(status.events.is_empty());
    }

    #[test]
    fn test_unmatched_non_ok_emits_nothing() {
        let monitor = ntp_monitor();
        assert!(classify(&monitor, &result(ExitStatus::NonOk, "disk ok", false)).is_none());
    }

    #[test]
    fn test_in_flight_guard() {
        let in_flight = InFlight::default();
        assert!(in_flight.try_claim("check_ntp"));
        assert!(!in_flight.try_claim("check_ntp"));
        assert!(in_flight.try_claim("check_disk"));
        in_flight.release("check_ntp");
        assert!(in_flight.try_claim("check_ntp"));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_command_exit_codes_and_output() {
        let ok = PluginMonitor::run_command(&sh_plugin("p", "echo healthy", 2.0, 1.0), 80, |_| {});
        assert_eq!(ok.exit_status, ExitStatus::Ok);
        assert_eq!(ok.output, "healthy");
        assert!(!ok.timed_out);

        let non_ok = PluginMonitor::run_command(&sh_plugin("p", "echo bad; exit 1", 2.0, 1.0), 80, |_| {});
        assert_eq!(non_ok.exit_status, ExitStatus::NonOk);
        assert_eq!(non_ok.output, "bad");

        let unknown = PluginMonitor::run_command(&sh_plugin("p", "exit 3", 2.0, 1.0), 80, |_| {});
        assert_eq!(unknown.exit_status, ExitStatus::Unknown);
    }

    #[cfg(unix)]
    #[test]
    fn test_run_command_timeout_kills_child() {
        let started = Instant::now();
        let hung = PluginMonitor::run_command(&sh_plugin("p", "sleep 30", 0.2, 1.0), 80, |_| {});
        assert!(hung.timed_out);
        assert_eq!(hung.exit_status, ExitStatus::Unknown);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_spawn_failure_is_unknown() {
        let mut plugin = sh_plugin("p", "", 1.0, 1.0);
        plugin.path = PathBuf::from("/nonexistent/check_something");
        let result = PluginMonitor::run_command(&plugin, 80, |_| {});
        assert_eq!(result.exit_status, ExitStatus::Unknown);
        assert!(!result.timed_out);
        assert!(result.failure.is_some());
    }

    #[test]
    fn test_health_degrades_after_consecutive_failures_and_recovers() {
        let monitor = ntp_monitor();
        let shared = &monitor.shared;
        let now = Utc::now();

        assert!(shared.record_run("check_ntp", Some("no such file"), now).is_none());
        let degraded = shared.record_run("check_ntp", Some("no such file"), now).unwrap();
        assert_eq!(degraded.condition_type, "custom-plugin-monitorMonitorUnavailable");
        assert_eq!(degraded.status, ConditionStatus::Unknown);
        assert!(shared.record_run("check_ntp", Some("no such file"), now).is_none());

        let recovered = shared.record_run("check_ntp", None, now).unwrap();
        assert_eq!(recovered.status, ConditionStatus::False);
        assert!(shared.record_run("check_ntp", None, now).is_none());
    }

    #[test]
    fn test_health_stays_degraded_while_any_plugin_fails() {
        let monitor = ntp_monitor();
        let shared = &monitor.shared;
        let now = Utc::now();

        for _ in 0..2 {
            shared.record_run("check_ntp", Some("denied"), now);
            shared.record_run("check_disk", Some("denied"), now);
        }
        assert!(shared.record_run("check_ntp", None, now).is_none());
        let recovered = shared.record_run("check_disk", None, now).unwrap();
        assert_eq!(recovered.status, ConditionStatus::False);
    }

    #[test]
    fn test_missing_plugin_binary_reports_degraded_detection() {
        let mut plugin = sh_plugin("check_missing", "", 1.0, 0.05);
        plugin.path = PathBuf::from("/nonexistent/check_missing");
        let mut config = monitor_config(vec![plugin], 1);
        config.default_conditions.clear();
        let mut monitor = PluginMonitor::new(config).unwrap();
        let rx = monitor.start().unwrap();

        let started = Instant::now();
        let mut health = Vec::new();
        while started.elapsed() < Duration::from_secs(5)
            && !health.contains(&ConditionStatus::Unknown)
        {
            if let Ok(status) = rx.recv_timeout(Duration::from_millis(100)) {
                health.extend(
                    status
                        .conditions
                        .iter()
                        .filter(|c| c.condition_type == "custom-plugin-monitorMonitorUnavailable")
                        .map(|c| c.status),
                );
            }
        }
        monitor.stop().unwrap();

        assert_eq!(
            health,
            vec![ConditionStatus::False, ConditionStatus::Unknown]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_hanging_plugin_does_not_block_fast_plugin() {
        let hang = sh_plugin("hang", "sleep 30", 0.5, 60.0);
        let mut fast = sh_plugin("fast", "echo fast check failed; exit 1", 2.0, 0.1);
        fast.rules.push(RuleConfig {
            severity: Severity::Temporary,
            condition: None,
            reason: "FastCheckFailed".to_string(),
            pattern: "fast check failed".to_string(),
            message: None,
            exit_status: None,
        });

        let mut config = monitor_config(vec![hang, fast], 2);
        config.default_conditions.clear();
        let mut monitor = PluginMonitor::new(config).unwrap();
        let rx = monitor.start().unwrap();

        let started = Instant::now();
        let mut fast_events = 0;
        let mut saw_timeout = false;
        while started.elapsed() < Duration::from_secs(5) && !(saw_timeout && fast_events >= 3) {
            if let Ok(status) = rx.recv_timeout(Duration::from_millis(100)) {
                for event in status.events {
                    match event.reason.as_str() {
                        "FastCheckFailed" => fast_events += 1,
                        PLUGIN_TIMEOUT_REASON => saw_timeout = true,
                        _ => {}
                    }
                }
            }
        }
        monitor.stop().unwrap();

        assert!(saw_timeout, "hanging plugin should time out");
        assert!(fast_events >= 3, "fast plugin ran {} times", fast_events);
        assert!(monitor.stats().runs_timed_out >= 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_slow_plugin_skips_ticks_instead_of_overlapping() {
        let slow = sh_plugin("slow", "sleep 0.6", 5.0, 0.1);
        let mut config = monitor_config(vec![slow], 3);
        config.default_conditions.clear();
        let mut monitor = PluginMonitor::new(config).unwrap();
        let _rx = monitor.start().unwrap();

        thread::sleep(Duration::from_millis(1000));
        monitor.stop().unwrap();

        let stats = monitor.stats();
        assert!(stats.ticks_skipped > 0);
        // Serial runs of 0.6s fit at most twice into one second
        assert!(stats.runs_started <= 2, "started {} runs", stats.runs_started);
    }

    #[cfg(unix)]
    #[test]
    fn test_stop_kills_in_flight_runs_after_grace() {
        let hang = sh_plugin("hang", "sleep 30", 60.0, 60.0);
        let mut config = monitor_config(vec![hang], 1);
        config.default_conditions.clear();
        let mut monitor = PluginMonitor::new(config).unwrap();
        let _rx = monitor.start().unwrap();

        thread::sleep(Duration::from_millis(200));
        let started = Instant::now();
        monitor.stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!monitor.is_running());
    }

    #[test]
    fn test_start_emits_default_conditions() {
        let mut monitor = PluginMonitor::new(monitor_config(Vec::new(), 1)).unwrap();
        let rx = monitor.start().unwrap();
        let initial = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(initial.conditions[0].condition_type, "NTPProblem");
        assert_eq!(initial.conditions[0].status, ConditionStatus::False);
        assert_eq!(
            initial.conditions[1].condition_type,
            "custom-plugin-monitorMonitorUnavailable"
        );
        assert_eq!(initial.conditions[1].status, ConditionStatus::False);
        monitor.stop().unwrap();
    }
}
