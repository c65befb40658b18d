use crate::config::LogMonitorConfig;
use crate::error::{ConfigError, MonitorError};
use crate::monitors::log_watcher::FileTailer;
use crate::monitors::{initial_conditions, sleep_while_running, Monitor};
use crate::rules::{RuleEngine, RuleInput};
use crate::types::{Condition, ConditionStatus, Event, Severity, Status, Timestamp};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Lifecycle of a monitored log source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SourceState {
    Initializing,
    Watching,
    Error,
}

/// Counters exposed on the diagnostic endpoint
#[derive(Debug, Clone, Serialize)]
pub struct SourceStats {
    pub state: SourceState,
    pub consecutive_failures: u32,
    pub degraded: bool,
    pub lines_processed: u64,
    pub problems_matched: u64,
}

impl Default for SourceStats {
    fn default() -> Self {
        Self {
            state: SourceState::Initializing,
            consecutive_failures: 0,
            degraded: false,
            lines_processed: 0,
            problems_matched: 0,
        }
    }
}

/// Watches a log file and classifies every new line
///
/// Permanent problems become `True` conditions; temporary problems become
/// events. Source failures are retried with exponential backoff forever and,
/// after enough consecutive failures, reported through a dedicated health
/// condition with status `Unknown`.
pub struct LogMonitor {
    config: LogMonitorConfig,
    engine: Arc<RuleEngine>,
    thread_handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    stats: Arc<Mutex<SourceStats>>,
}

impl LogMonitor {
    /// Create a monitor from a validated configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when a value is out of range or a rule does not compile.
    pub fn new(config: LogMonitorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let engine = RuleEngine::from_configs(&config.rules)?;
        info!(
            "Loaded log monitor {} with {} rules for {}",
            config.source,
            engine.rule_count(),
            config.log_path.display()
        );
        Ok(Self {
            config,
            engine: Arc::new(engine),
            thread_handle: None,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(Mutex::new(SourceStats::default())),
        })
    }

    /// Check if the monitor is currently running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Copy of the current source counters
    pub fn stats(&self) -> SourceStats {
        lock_stats(&self.stats).clone()
    }

    /// Translate one log line into a status, if any rule matches
    pub fn status_for_line(
        engine: &RuleEngine,
        source: &str,
        line: &str,
        now: Timestamp,
    ) -> Option<Status> {
        let classification = engine.evaluate(&RuleInput::Line(line))?;
        let mut status = Status::new(source, now);
        match classification.severity {
            Severity::Permanent => {
                // Rule compilation guarantees permanent rules name a condition
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
                    source,
                    classification.reason,
                    classification.message,
                    now,
                ));
            }
        }
        Some(status)
    }

    fn monitor_thread(
        config: LogMonitorConfig,
        engine: Arc<RuleEngine>,
        channel: Sender<Status>,
        running: Arc<AtomicBool>,
        stats: Arc<Mutex<SourceStats>>,
    ) {
        let source = config.source.clone();
        let health_type = config.health_condition_type();
        let mut tailer = FileTailer::new(
            config.log_path.clone(),
            config.start_at_end,
            config.lookback_lines,
        );
        let mut state = SourceState::Initializing;
        let mut consecutive_failures: u32 = 0;
        let mut degraded = false;
        let mut health_reported = false;
        let mut retry_delay = config.retry_base();

        let mut initial = Status::new(&source, Utc::now());
        initial.conditions = initial_conditions(&config.default_conditions, initial.timestamp);
        if !initial.is_empty() && channel.send(initial).is_err() {
            return;
        }

        while running.load(Ordering::SeqCst) {
            let result = match state {
                SourceState::Initializing | SourceState::Error => tailer.open(),
                SourceState::Watching => tailer.read_lines(),
            };

            let lines = match result {
                Ok(lines) => lines,
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(
                        "{}: {} (failure #{}), retrying in {:?}",
                        source, e, consecutive_failures, retry_delay
                    );
                    state = SourceState::Error;

                    if consecutive_failures >= config.max_consecutive_failures && !degraded {
                        error!(
                            "{}: {} consecutive source failures, reporting degraded detection",
                            source, consecutive_failures
                        );
                        degraded = true;
                        health_reported = true;
                        let status = Self::health_status(
                            &source,
                            &health_type,
                            ConditionStatus::Unknown,
                            "SourceUnavailable",
                            &format!("cannot read {}: {}", tailer.path().display(), e),
                        );
                        if channel.send(status).is_err() {
                            break;
                        }
                    }
                    Self::update_stats(&stats, state, consecutive_failures, degraded, 0, 0);

                    sleep_while_running(&running, retry_delay);
                    retry_delay = (retry_delay * 2).min(config.retry_max());
                    continue;
                }
            };

            if state != SourceState::Watching {
                info!("{}: watching {}", source, tailer.path().display());
                state = SourceState::Watching;
                consecutive_failures = 0;
                retry_delay = config.retry_base();
                if !health_reported || degraded {
                    health_reported = true;
                    degraded = false;
                    let status = Self::health_status(
                        &source,
                        &health_type,
                        ConditionStatus::False,
                        "SourceAvailable",
                        &format!("reading {}", tailer.path().display()),
                    );
                    if channel.send(status).is_err() {
                        break;
                    }
                }
            }

            let line_count = lines.len() as u64;
            let mut matched = 0;
            let mut closed = false;
            for line in &lines {
                if let Some(status) = Self::status_for_line(&engine, &source, line, Utc::now()) {
                    matched += 1;
                    debug!("{}: line matched: {}", source, line);
                    if channel.send(status).is_err() {
                        closed = true;
                        break;
                    }
                }
            }
            if closed {
                debug!("{}: status channel closed", source);
                break;
            }
            Self::update_stats(&stats, state, 0, degraded, line_count, matched);

            if lines.is_empty() {
                sleep_while_running(&running, config.poll_interval());
            }
        }

        running.store(false, Ordering::SeqCst);
        info!("Log monitor {} finished", source);
    }

    fn health_status(
        source: &str,
        health_type: &str,
        status: ConditionStatus,
        reason: &str,
        message: &str,
    ) -> Status {
        let now = Utc::now();
        let mut update = Status::new(source, now);
        update
            .conditions
            .push(Condition::new(health_type, status, reason, message, now));
        update
    }

    fn update_stats(
        stats: &Mutex<SourceStats>,
        state: SourceState,
        consecutive_failures: u32,
        degraded: bool,
        lines: u64,
        matched: u64,
    ) {
        let mut stats = lock_stats(stats);
        stats.state = state;
        stats.consecutive_failures = consecutive_failures;
        stats.degraded = degraded;
        stats.lines_processed += lines;
        stats.problems_matched += matched;
    }
}

fn lock_stats(stats: &Mutex<SourceStats>) -> std::sync::MutexGuard<'_, SourceStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Monitor for LogMonitor {
    fn name(&self) -> &str {
        &self.config.source
    }

    fn start(&mut self) -> Result<Receiver<Status>, MonitorError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(MonitorError::AlreadyStarted(self.config.source.clone()));
        }

        let (tx, rx) = mpsc::channel();
        let config = self.config.clone();
        let engine = Arc::clone(&self.engine);
        let running = Arc::clone(&self.running);
        let stats = Arc::clone(&self.stats);

        let handle = thread::Builder::new()
            .name(format!("log-monitor-{}", self.config.source))
            .spawn(move || Self::monitor_thread(config, engine, tx, running, stats))
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                MonitorError::ThreadSpawn(e.to_string())
            })?;

        self.thread_handle = Some(handle);
        info!("Log monitor {} started", self.config.source);
        Ok(rx)
    }

    fn stop(&mut self) -> Result<(), MonitorError> {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            handle.join().map_err(|_| {
                MonitorError::SubprocessTerminated(format!(
                    "failed to join log monitor {}",
                    self.config.source
                ))
            })?;
        }

        info!("Log monitor {} stopped", self.config.source);
        Ok(())
    }

    fn register_http_handlers(&self, router: Router) -> Router {
        let stats = Arc::clone(&self.stats);
        let path = format!("/monitors/{}", self.config.source);
        router.route(
            &path,
            get(move || {
                let snapshot = lock_stats(&stats).clone();
                async move { Json(snapshot) }
            }),
        )
    }
}

impl Drop for LogMonitor {
    fn drop(&mut self) {
        if self.is_running() || self.thread_handle.is_some() {
            let _ = self.stop();
        }
    }
}
