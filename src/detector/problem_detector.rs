use crate::detector::tracker::{ConditionTracker, ConditionUpdate};
use crate::detector::ProblemSink;
use crate::error::MonitorError;
use crate::monitors::Monitor;
use crate::types::{Condition, Status};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use log::{debug, error, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How often the aggregation loop checks for shutdown while idle
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Stops a running [`ProblemDetector`] from another thread
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    running: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        !self.running.load(Ordering::SeqCst)
    }
}

/// Owns the monitors and turns their statuses into sink calls
///
/// The aggregation loop is the only writer of the condition tracker.
/// Readers get a copy through [`ProblemDetector::conditions`].
pub struct ProblemDetector {
    monitors: Vec<Box<dyn Monitor>>,
    sink: Arc<dyn ProblemSink>,
    tracker: Arc<RwLock<ConditionTracker>>,
    running: Arc<AtomicBool>,
}

impl ProblemDetector {
    pub fn new(monitors: Vec<Box<dyn Monitor>>, sink: Arc<dyn ProblemSink>) -> Self {
        Self {
            monitors,
            sink,
            tracker: Arc::new(RwLock::new(ConditionTracker::new())),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            running: Arc::clone(&self.running),
        }
    }

    /// Copy of every condition seen so far
    pub fn conditions(&self) -> Vec<Condition> {
        read_conditions(&self.tracker)
    }

    /// Mount `/conditions` and every monitor's own endpoints
    pub fn register_http_handlers(&self, router: Router) -> Router {
        let tracker = Arc::clone(&self.tracker);
        let router = router.route(
            "/conditions",
            get(move || {
                let snapshot = read_conditions(&tracker);
                async move { Json(snapshot) }
            }),
        );
        self.monitors
            .iter()
            .fold(router, |router, monitor| monitor.register_http_handlers(router))
    }

    /// Start all monitors and aggregate their output until shutdown
    ///
    /// Returns once shutdown is requested or every monitor channel has
    /// closed. Monitors are stopped before returning.
    ///
    /// # Errors
    ///
    /// Returns the first `MonitorError` raised while starting a monitor.
    /// Monitors started before it are stopped again.
    pub fn run(&mut self) -> Result<(), MonitorError> {
        let (merged_tx, merged_rx) = mpsc::channel();
        let mut forwarders = Vec::with_capacity(self.monitors.len());

        for index in 0..self.monitors.len() {
            let name = self.monitors[index].name().to_string();
            let started = self.monitors[index]
                .start()
                .and_then(|receiver| spawn_forwarder(name.clone(), receiver, merged_tx.clone()));
            match started {
                Ok(handle) => forwarders.push(handle),
                Err(e) => {
                    error!("Failed to start monitor {}: {}", name, e);
                    self.stop_monitors();
                    return Err(e);
                }
            }
        }
        drop(merged_tx);
        info!(
            "Problem detector started with {} monitors",
            self.monitors.len()
        );

        while self.running.load(Ordering::SeqCst) {
            match merged_rx.recv_timeout(SHUTDOWN_POLL_INTERVAL) {
                Ok(status) => self.process(status),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    info!("All monitor channels closed");
                    break;
                }
            }
        }

        self.stop_monitors();
        drop(merged_rx);
        for handle in forwarders {
            if let Err(e) = handle.join() {
                error!("Forwarding thread failed to join: {:?}", e);
            }
        }
        info!("Problem detector stopped");
        Ok(())
    }

    fn process(&self, status: Status) {
        let now = Utc::now();
        let updates: Vec<ConditionUpdate> = {
            let mut tracker = self
                .tracker
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            status
                .conditions
                .into_iter()
                .filter_map(|condition| tracker.apply(&status.source, condition, now))
                .collect()
        };

        for update in updates {
            match &update {
                ConditionUpdate::Changed(c) => info!(
                    "Condition {} changed to {} ({}) from {}",
                    c.condition_type, c.status, c.reason, status.source
                ),
                ConditionUpdate::Refreshed(c) => debug!(
                    "Condition {} refreshed with reason {} from {}",
                    c.condition_type, c.reason, status.source
                ),
            }
            self.sink.update_condition(update.into_condition());
        }

        for event in status.events {
            debug!("Event {} from {}", event.reason, event.source);
            self.sink.report_event(event);
        }
    }

    fn stop_monitors(&mut self) {
        for monitor in self.monitors.iter_mut() {
            if let Err(e) = monitor.stop() {
                error!("Failed to stop monitor {}: {}", monitor.name(), e);
            }
        }
    }
}

fn read_conditions(tracker: &RwLock<ConditionTracker>) -> Vec<Condition> {
    tracker
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .conditions()
}

/// Copy one monitor's statuses into the merged channel until either side closes
fn spawn_forwarder(
    name: String,
    receiver: Receiver<Status>,
    merged: Sender<Status>,
) -> Result<JoinHandle<()>, MonitorError> {
    thread::Builder::new()
        .name(format!("forward-{}", name))
        .spawn(move || {
            debug!("Forwarding thread for {} started", name);
            for status in receiver {
                if merged.send(status).is_err() {
                    break;
                }
            }
            debug!("Forwarding thread for {} stopped", name);
        })
        .map_err(|e| MonitorError::ThreadSpawn(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LogMonitorConfig, PluginMonitorConfig};
    use crate::detector::MockProblemSink;
    use crate::monitors::{LogMonitor, MockMonitor, PluginMonitor};
    use crate::rules::RuleConfig;
    use crate::types::{ConditionStatus, Event, Severity};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::io::Write;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Instant;
    use tempfile::TempDir;
    use tower::ServiceExt;

    /// Monitor backed by a channel the test feeds directly
    struct ChannelMonitor {
        name: String,
        receiver: Option<Receiver<Status>>,
        stopped: Arc<AtomicBool>,
    }

    impl ChannelMonitor {
        fn new(name: &str) -> (Self, Sender<Status>, Arc<AtomicBool>) {
            let (tx, rx) = mpsc::channel();
            let stopped = Arc::new(AtomicBool::new(false));
            let monitor = Self {
                name: name.to_string(),
                receiver: Some(rx),
                stopped: Arc::clone(&stopped),
            };
            (monitor, tx, stopped)
        }
    }

    impl Monitor for ChannelMonitor {
        fn name(&self) -> &str {
            &self.name
        }

        fn start(&mut self) -> Result<Receiver<Status>, MonitorError> {
            self.receiver
                .take()
                .ok_or_else(|| MonitorError::AlreadyStarted(self.name.clone()))
        }

        fn stop(&mut self) -> Result<(), MonitorError> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        conditions: Mutex<Vec<Condition>>,
        events: Mutex<Vec<Event>>,
    }

    impl RecordingSink {
        fn conditions(&self) -> Vec<Condition> {
            self.conditions.lock().unwrap().clone()
        }

        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }
    }

    impl ProblemSink for RecordingSink {
        fn update_condition(&self, condition: Condition) {
            self.conditions.lock().unwrap().push(condition);
        }

        fn report_event(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn status(source: &str, condition_type: &str, status: ConditionStatus, reason: &str) -> Status {
        let mut s = Status::new(source, Utc::now());
        s.conditions.push(Condition::new(
            condition_type,
            status,
            reason,
            "detail",
            Utc::now(),
        ));
        s
    }

    #[test]
    fn test_duplicate_statuses_forwarded_once() {
        let (monitor, tx, stopped) = ChannelMonitor::new("kernel-monitor");
        let sink = Arc::new(RecordingSink::default());
        let mut detector = ProblemDetector::new(vec![Box::new(monitor)], sink.clone());

        for _ in 0..3 {
            tx.send(status("kernel-monitor", "KernelDeadlock", ConditionStatus::True, "DockerHung"))
                .unwrap();
        }
        tx.send(status("kernel-monitor", "KernelDeadlock", ConditionStatus::True, "KubeletHung"))
            .unwrap();
        drop(tx);

        detector.run().unwrap();

        let forwarded = sink.conditions();
        assert_eq!(forwarded.len(), 2);
        assert_eq!(forwarded[0].reason, "DockerHung");
        assert_eq!(forwarded[1].reason, "KubeletHung");
        assert_eq!(forwarded[0].transition_time, forwarded[1].transition_time);
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_disjoint_monitors_each_get_an_entry() {
        let sink = Arc::new(RecordingSink::default());
        let mut monitors: Vec<Box<dyn Monitor>> = Vec::new();
        let mut senders = Vec::new();
        for i in 0..4 {
            let (monitor, tx, _) = ChannelMonitor::new(&format!("monitor-{}", i));
            monitors.push(Box::new(monitor));
            senders.push(tx);
        }
        let mut detector = ProblemDetector::new(monitors, sink.clone());

        for (i, tx) in senders.iter().enumerate() {
            tx.send(status(
                &format!("monitor-{}", i),
                &format!("Problem{}", i),
                ConditionStatus::False,
                "Fine",
            ))
            .unwrap();
        }
        drop(senders);
        detector.run().unwrap();

        let conditions = detector.conditions();
        assert_eq!(conditions.len(), 4);
        assert_eq!(sink.conditions().len(), 4);
    }

    #[test]
    fn test_foreign_condition_type_discarded() {
        let (kernel, kernel_tx, _) = ChannelMonitor::new("kernel-monitor");
        let (docker, docker_tx, _) = ChannelMonitor::new("docker-monitor");
        let sink = Arc::new(RecordingSink::default());
        let mut detector =
            ProblemDetector::new(vec![Box::new(kernel), Box::new(docker)], sink.clone());

        kernel_tx
            .send(status("kernel-monitor", "KernelDeadlock", ConditionStatus::False, "Fine"))
            .unwrap();
        drop(kernel_tx);
        // Give the owner's status a head start through its forwarding thread
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            docker_tx
                .send(status("docker-monitor", "KernelDeadlock", ConditionStatus::True, "Oops"))
                .unwrap();
        });
        detector.run().unwrap();
        handle.join().unwrap();

        let conditions = detector.conditions();
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, ConditionStatus::False);
        assert_eq!(sink.conditions().len(), 1);
    }

    #[test]
    fn test_events_forwarded_without_dedup() {
        let (monitor, tx, _) = ChannelMonitor::new("kernel-monitor");
        let mut sink = MockProblemSink::new();
        sink.expect_report_event().times(2).return_const(());
        sink.expect_update_condition().never();
        let mut detector = ProblemDetector::new(vec![Box::new(monitor)], Arc::new(sink));

        for _ in 0..2 {
            let mut s = Status::new("kernel-monitor", Utc::now());
            s.events.push(Event::warning(
                "kernel-monitor",
                "OOMKilling",
                "Kill process 1234",
                Utc::now(),
            ));
            tx.send(s).unwrap();
        }
        drop(tx);
        detector.run().unwrap();
    }

    #[test]
    fn test_start_failure_stops_started_monitors() {
        let (first, _tx, stopped) = ChannelMonitor::new("kernel-monitor");
        let mut failing = MockMonitor::new();
        failing
            .expect_name()
            .return_const("plugin-monitor".to_string());
        failing
            .expect_start()
            .returning(|| Err(MonitorError::SourceUnavailable("no plugins".to_string())));
        failing.expect_stop().returning(|| Ok(()));

        let sink = Arc::new(RecordingSink::default());
        let mut detector = ProblemDetector::new(vec![Box::new(first), Box::new(failing)], sink);

        assert!(matches!(
            detector.run(),
            Err(MonitorError::SourceUnavailable(_))
        ));
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_shutdown_handle_ends_run() {
        let (monitor, tx, stopped) = ChannelMonitor::new("kernel-monitor");
        let sink = Arc::new(RecordingSink::default());
        let mut detector = ProblemDetector::new(vec![Box::new(monitor)], sink);
        let handle = detector.shutdown_handle();

        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            handle.shutdown();
            // The channel stays open well past the shutdown poll interval
            thread::sleep(Duration::from_millis(500));
            drop(tx);
        });
        let started = Instant::now();
        detector.run().unwrap();
        stopper.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(stopped.load(Ordering::SeqCst));
    }

    fn kernel_monitor_config(path: PathBuf) -> LogMonitorConfig {
        LogMonitorConfig {
            source: "kernel-monitor".to_string(),
            log_path: path,
            start_at_end: true,
            lookback_lines: 0,
            poll_interval_ms: 20,
            max_consecutive_failures: 5,
            retry_base_ms: 50,
            retry_max_ms: 200,
            health_condition: None,
            default_conditions: Vec::new(),
            rules: vec![RuleConfig {
                severity: Severity::Permanent,
                condition: Some("KernelDeadlock".to_string()),
                reason: "KernelOops".to_string(),
                pattern: "KernelOops".to_string(),
                message: None,
                exit_status: None,
            }],
        }
    }

    #[test]
    fn test_kernel_oops_scenario() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kern.log");
        std::fs::write(&path, "").unwrap();

        let config = kernel_monitor_config(path.clone());
        let monitor = LogMonitor::new(config).unwrap();
        let sink = Arc::new(RecordingSink::default());
        let mut detector = ProblemDetector::new(vec![Box::new(monitor)], sink.clone());
        let handle = detector.shutdown_handle();
        let runner = thread::spawn(move || {
            detector.run().unwrap();
            detector
        });

        thread::sleep(Duration::from_millis(300));
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "kernel: KernelOops in module foo").unwrap();
        writeln!(file, "kernel: eth0 link up").unwrap();

        let deadlock_updates = |sink: &RecordingSink| {
            sink.conditions()
                .into_iter()
                .filter(|c| c.condition_type == "KernelDeadlock")
                .collect::<Vec<_>>()
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        while deadlock_updates(&sink).is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        // Leave time for the unmatched line to be read as well
        thread::sleep(Duration::from_millis(300));
        handle.shutdown();
        let detector = runner.join().unwrap();

        let updates = deadlock_updates(&sink);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].status, ConditionStatus::True);
        assert!(sink.events().is_empty());

        let deadlock = detector
            .conditions()
            .into_iter()
            .find(|c| c.condition_type == "KernelDeadlock")
            .unwrap();
        assert_eq!(deadlock.status, ConditionStatus::True);
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_http_handlers_serve_conditions_and_monitor_stats() {
        let dir = TempDir::new().unwrap();
        let log_monitor =
            LogMonitor::new(kernel_monitor_config(dir.path().join("kern.log"))).unwrap();
        let plugin_monitor = PluginMonitor::new(PluginMonitorConfig {
            source: "ntp-monitor".to_string(),
            concurrency: 1,
            max_output_length: 80,
            grace_period_secs: 1.0,
            max_consecutive_failures: 3,
            health_condition: None,
            default_conditions: Vec::new(),
            plugins: Vec::new(),
        })
        .unwrap();
        let sink = Arc::new(RecordingSink::default());
        let detector =
            ProblemDetector::new(vec![Box::new(log_monitor), Box::new(plugin_monitor)], sink);

        detector.process(status(
            "kernel-monitor",
            "KernelDeadlock",
            ConditionStatus::True,
            "KernelOops",
        ));
        detector.process(status(
            "ntp-monitor",
            "NTPProblem",
            ConditionStatus::False,
            "NTPIsUp",
        ));
        let router = detector.register_http_handlers(Router::new());

        let (code, body) = get_json(router.clone(), "/conditions").await;
        assert_eq!(code, StatusCode::OK);
        let served: Vec<Condition> = serde_json::from_value(body).unwrap();
        assert_eq!(served, detector.conditions());
        assert_eq!(served.len(), 2);

        let (code, body) = get_json(router.clone(), "/monitors/kernel-monitor").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["consecutive_failures"], 0);

        let (code, body) = get_json(router.clone(), "/monitors/ntp-monitor").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["runs_started"], 0);

        let (code, _) = get_json(router, "/monitors/unknown").await;
        assert_eq!(code, StatusCode::NOT_FOUND);
    }
}
