//! Asynchronous delivery of conditions and events
//!
//! Condition updates are coalesced per type and retried until they land.
//! Events go through a bounded queue and are dropped after a few attempts.
//! Both paths are rate limited and stop promptly on shutdown.

use crate::client::backoff::Backoff;
use crate::client::problem_client::ProblemClient;
use crate::client::rate_limiter::RateLimiter;
use crate::config::ClientConfig;
use crate::detector::ProblemSink;
use crate::types::{Condition, Event};
use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Delivery counters
#[derive(Debug, Default)]
struct Counters {
    conditions_uploaded: AtomicU64,
    condition_failures: AtomicU64,
    events_sent: AtomicU64,
    events_dropped: AtomicU64,
}

/// Snapshot of the delivery counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReporterStats {
    pub conditions_uploaded: u64,
    pub condition_failures: u64,
    pub events_sent: u64,
    pub events_dropped: u64,
}

/// Conditions waiting to be written, latest value per type
#[derive(Debug, Default)]
struct Backlog {
    pending: Mutex<BTreeMap<String, Condition>>,
    notify: Notify,
}

impl Backlog {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Condition>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, condition: Condition) {
        self.lock()
            .insert(condition.condition_type.clone(), condition);
        self.notify.notify_one();
    }

    fn take(&self) -> BTreeMap<String, Condition> {
        std::mem::take(&mut *self.lock())
    }

    /// Put back a batch that failed, keeping anything newer that arrived meanwhile
    fn restore(&self, batch: BTreeMap<String, Condition>) {
        let mut pending = self.lock();
        for (condition_type, condition) in batch {
            pending.entry(condition_type).or_insert(condition);
        }
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum UploadState {
    Idle,
    Sending,
    BackingOff(Duration),
}

struct ConditionSettings {
    backoff: Backoff,
    heartbeat_period: Duration,
    warn_threshold: usize,
    rate_per_minute: usize,
}

struct EventSettings {
    max_attempts: u32,
    retry_delay: Duration,
    rate_per_minute: usize,
}

/// Sends detector output to the API on background tasks
pub struct Reporter {
    backlog: Arc<Backlog>,
    events: mpsc::Sender<Event>,
    counters: Arc<Counters>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Reporter {
    /// Start the condition and event tasks on the current tokio runtime
    pub fn spawn(client: Arc<ProblemClient>, config: &ClientConfig) -> Self {
        let backlog = Arc::new(Backlog::default());
        let counters = Arc::new(Counters::default());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (events, events_rx) = mpsc::channel(config.event_queue_capacity.max(1));

        let condition_task = tokio::spawn(condition_worker(
            Arc::clone(&client),
            Arc::clone(&backlog),
            Arc::clone(&counters),
            ConditionSettings {
                backoff: Backoff::new(
                    config.backoff_base(),
                    config.backoff_max(),
                    config.backoff_jitter,
                ),
                heartbeat_period: config.heartbeat_period(),
                warn_threshold: config.backlog_warn_threshold,
                rate_per_minute: config.condition_rate_per_minute,
            },
            shutdown_rx.clone(),
        ));
        let event_task = tokio::spawn(event_worker(
            client,
            events_rx,
            Arc::clone(&counters),
            EventSettings {
                max_attempts: config.event_max_attempts.max(1),
                retry_delay: config.event_retry_delay(),
                rate_per_minute: config.event_rate_per_minute,
            },
            shutdown_rx,
        ));

        Self {
            backlog,
            events,
            counters,
            shutdown,
            tasks: Mutex::new(vec![condition_task, event_task]),
        }
    }

    pub fn stats(&self) -> ReporterStats {
        ReporterStats {
            conditions_uploaded: self.counters.conditions_uploaded.load(Ordering::Relaxed),
            condition_failures: self.counters.condition_failures.load(Ordering::Relaxed),
            events_sent: self.counters.events_sent.load(Ordering::Relaxed),
            events_dropped: self.counters.events_dropped.load(Ordering::Relaxed),
        }
    }

    /// Condition types waiting to be written
    pub fn pending_conditions(&self) -> usize {
        self.backlog.len()
    }

    /// Stop both tasks and wait for them to finish
    ///
    /// Pending conditions and queued events are abandoned.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Reporter task ended abnormally: {}", e);
            }
        }
        let pending = self.backlog.len();
        if pending > 0 {
            info!("Reporter stopped with {} condition types unsent", pending);
        }
    }
}

impl ProblemSink for Reporter {
    fn update_condition(&self, condition: Condition) {
        self.backlog.push(condition);
    }

    fn report_event(&self, event: Event) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.counters.events_dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Event queue full, dropping event {}", event.reason);
            }
            Err(TrySendError::Closed(event)) => {
                self.counters.events_dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Reporter stopped, dropping event {}", event.reason);
            }
        }
    }
}

async fn condition_worker(
    client: Arc<ProblemClient>,
    backlog: Arc<Backlog>,
    counters: Arc<Counters>,
    mut settings: ConditionSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut known: BTreeMap<String, Condition> = BTreeMap::new();
    let mut limiter = RateLimiter::new(settings.rate_per_minute);
    let mut next_heartbeat = Instant::now() + settings.heartbeat_period;
    let mut state = UploadState::Idle;

    loop {
        state = match state {
            UploadState::Idle => {
                tokio::select! {
                    _ = backlog.notify.notified() => UploadState::Sending,
                    _ = tokio::time::sleep_until(next_heartbeat) => {
                        next_heartbeat = Instant::now() + settings.heartbeat_period;
                        if known.is_empty() {
                            UploadState::Idle
                        } else {
                            debug!("Refreshing heartbeat for {} conditions", known.len());
                            backlog.restore(known.clone());
                            UploadState::Sending
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
            UploadState::Sending => {
                let batch = backlog.take();
                if batch.is_empty() {
                    UploadState::Idle
                } else if !limiter.try_acquire() {
                    let wait = limiter.time_until_available();
                    debug!("Condition writes rate limited for {:?}", wait);
                    backlog.restore(batch);
                    UploadState::BackingOff(wait)
                } else {
                    if batch.len() > settings.warn_threshold {
                        warn!("Condition backlog holds {} types", batch.len());
                    }
                    let conditions: Vec<Condition> = batch.values().cloned().collect();
                    let result = tokio::select! {
                        result = client.report_conditions(&conditions, Utc::now()) => result,
                        _ = shutdown.changed() => return,
                    };
                    match result {
                        Ok(()) => {
                            counters
                                .conditions_uploaded
                                .fetch_add(conditions.len() as u64, Ordering::Relaxed);
                            known.extend(batch);
                            settings.backoff.reset();
                            next_heartbeat = Instant::now() + settings.heartbeat_period;
                            UploadState::Idle
                        }
                        Err(e) => {
                            counters.condition_failures.fetch_add(1, Ordering::Relaxed);
                            backlog.restore(batch);
                            let delay = settings.backoff.next_delay();
                            warn!(
                                "Failed to write {} conditions (attempt {}): {}, retrying in {:?}",
                                conditions.len(),
                                settings.backoff.attempts(),
                                e,
                                delay
                            );
                            UploadState::BackingOff(delay)
                        }
                    }
                }
            }
            UploadState::BackingOff(delay) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => UploadState::Sending,
                    _ = shutdown.changed() => return,
                }
            }
        };
    }
}

async fn event_worker(
    client: Arc<ProblemClient>,
    mut events: mpsc::Receiver<Event>,
    counters: Arc<Counters>,
    settings: EventSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut limiter = RateLimiter::new(settings.rate_per_minute);

    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => return,
            },
            _ = shutdown.changed() => return,
        };

        if !limiter.try_acquire() {
            counters.events_dropped.fetch_add(1, Ordering::Relaxed);
            warn!("Event rate limit reached, dropping event {}", event.reason);
            continue;
        }

        let mut attempt = 1;
        loop {
            match client.report_event(&event).await {
                Ok(()) => {
                    counters.events_sent.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                Err(e) if attempt < settings.max_attempts && e.is_retryable() => {
                    debug!(
                        "Posting event {} failed (attempt {}): {}",
                        event.reason, attempt, e
                    );
                    attempt += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(settings.retry_delay) => {}
                        _ = shutdown.changed() => return,
                    }
                }
                Err(e) => {
                    counters.events_dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Dropping event {} after {} attempts: {}",
                        event.reason, attempt, e
                    );
                    break;
                }
            }
        }
    }
}

/// Poll the API until the node can be read or `timeout` passes
///
/// Returns whether the API became reachable.
pub async fn wait_for_api(client: &ProblemClient, interval: Duration, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match client.get_node().await {
            Ok(node) => {
                info!("API reachable, node {} found", node.name);
                return true;
            }
            Err(e) => {
                if Instant::now() + interval > deadline {
                    warn!("API still unreachable after {:?}: {}", timeout, e);
                    return false;
                }
                debug!("Waiting for API: {}", e);
                tokio::time::sleep(interval).await;
            }
        }
    }
}
