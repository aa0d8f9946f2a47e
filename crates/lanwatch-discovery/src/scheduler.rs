//! Fixed-interval scan scheduling
//!
//! One periodic task invokes the scan backend and hands the snapshot to the
//! correlator. Scans never overlap: a scan that outlasts the interval is
//! followed immediately by the next one once it completes.

use lanwatch_core::StoreError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::backend::ScanBackend;
use crate::correlator::{Correlator, CycleSummary};

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between scan starts
    pub interval: Duration,
    /// Hard limit on a single backend call
    pub scan_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            scan_timeout: Duration::from_secs(30),
        }
    }
}

/// Scan lifecycle events for observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// Backend invoked
    ScanStarted,
    /// Cycle correlated and persisted
    ScanCompleted {
        found: usize,
        new: usize,
        elapsed: Duration,
    },
    /// Backend error, timeout or store failure; the cycle is dropped
    ScanFailed { error: String },
    /// Scan took longer than the configured interval
    Overrun { elapsed: Duration, interval: Duration },
}

/// Result of one scheduler firing
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub elapsed: Duration,
    pub overrun: bool,
    /// None when the backend or the store failed
    pub summary: Option<CycleSummary>,
}

/// Periodic scan driver
pub struct Scheduler {
    backend: Arc<dyn ScanBackend>,
    correlator: Arc<Correlator>,
    config: SchedulerConfig,
    event_tx: broadcast::Sender<ScanEvent>,
}

impl Scheduler {
    pub fn new(
        backend: Arc<dyn ScanBackend>,
        correlator: Arc<Correlator>,
        config: SchedulerConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            backend,
            correlator,
            config,
            event_tx,
        }
    }

    /// Subscribe to scan events
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.event_tx.subscribe()
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    /// Run a single Idle -> Scanning -> Idle transition
    pub async fn run_cycle(&self) -> CycleOutcome {
        let _ = self.event_tx.send(ScanEvent::ScanStarted);
        debug!(backend = self.backend.name(), "Starting scan");

        let started = Instant::now();
        let scanned = tokio::time::timeout(self.config.scan_timeout, self.backend.scan()).await;
        let elapsed = started.elapsed();

        let detections = match scanned {
            Ok(Ok(detections)) => Some(detections),
            Ok(Err(e)) => {
                warn!(backend = self.backend.name(), error = %e, "Scan failed");
                let _ = self.event_tx.send(ScanEvent::ScanFailed {
                    error: e.to_string(),
                });
                None
            }
            Err(_) => {
                warn!(
                    backend = self.backend.name(),
                    timeout_secs = self.config.scan_timeout.as_secs_f64(),
                    "Scan timed out"
                );
                let _ = self.event_tx.send(ScanEvent::ScanFailed {
                    error: "scan timed out".to_string(),
                });
                None
            }
        };

        let overrun = elapsed > self.config.interval;
        if overrun {
            warn!(
                elapsed_secs = elapsed.as_secs_f64(),
                interval_secs = self.config.interval.as_secs_f64(),
                "Scan took longer than the scan interval; next scan starts immediately"
            );
            let _ = self.event_tx.send(ScanEvent::Overrun {
                elapsed,
                interval: self.config.interval,
            });
        }

        let Some(detections) = detections else {
            return CycleOutcome {
                elapsed,
                overrun,
                summary: None,
            };
        };

        let summary = match self.correlator.process(&detections) {
            Ok(summary) => {
                info!(
                    found = summary.detections,
                    new = summary.new_devices,
                    "Scan complete"
                );
                let _ = self.event_tx.send(ScanEvent::ScanCompleted {
                    found: summary.detections,
                    new: summary.new_devices,
                    elapsed,
                });
                Some(summary)
            }
            Err(e) => {
                error!(error = %e, "Failed to record scan results");
                let _ = self.event_tx.send(ScanEvent::ScanFailed {
                    error: e.to_string(),
                });
                None
            }
        };

        CycleOutcome {
            elapsed,
            overrun,
            summary,
        }
    }

    /// Reconcile the known-device set, then start scanning in the background
    pub fn start(self: Arc<Self>) -> Result<SchedulerHandle, StoreError> {
        self.correlator.reconcile()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));

        Ok(SchedulerHandle {
            shutdown: shutdown_tx,
            task,
        })
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            backend = self.backend.name(),
            interval_secs = self.config.interval.as_secs(),
            "Scan scheduler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
                _ = shutdown.changed() => {
                    break;
                }
            }
        }

        info!("Scan scheduler stopped");
    }
}

/// Handle to the running scan task
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop after the current cycle (if any) finishes
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Scan task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScanError;
    use async_trait::async_trait;
    use lanwatch_core::{Detection, JsonStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Backend that sleeps for a fixed time and records when it ran
    struct SlowBackend {
        delay: Duration,
        active: AtomicUsize,
        max_active: AtomicUsize,
        runs: Mutex<Vec<(Instant, Instant)>>,
    }

    impl SlowBackend {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                runs: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ScanBackend for SlowBackend {
        fn name(&self) -> &str {
            "slow"
        }

        async fn scan(&self) -> Result<Vec<Detection>, ScanError> {
            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now_active, Ordering::SeqCst);
            let start = Instant::now();
            tokio::time::sleep(self.delay).await;
            self.runs.lock().unwrap().push((start, Instant::now()));
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![Detection::new("aa:bb:cc:dd:ee:ff", "10.0.0.2")])
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl ScanBackend for FailingBackend {
        fn name(&self) -> &str {
            "failing"
        }

        async fn scan(&self) -> Result<Vec<Detection>, ScanError> {
            Err(ScanError::Fatal {
                attempts: 3,
                last_error: "connection refused".to_string(),
            })
        }
    }

    fn scheduler(backend: Arc<dyn ScanBackend>, interval_secs: u64) -> Scheduler {
        let correlator = Arc::new(Correlator::new(Arc::new(JsonStore::in_memory())));
        Scheduler::new(
            backend,
            correlator,
            SchedulerConfig {
                interval: Duration::from_secs(interval_secs),
                scan_timeout: Duration::from_secs(60),
            },
        )
    }

    fn drain(rx: &mut broadcast::Receiver<ScanEvent>) -> Vec<ScanEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_scan_emits_one_overrun_warning() {
        let sched = scheduler(Arc::new(SlowBackend::new(Duration::from_secs(15))), 10);
        let mut rx = sched.subscribe();

        let outcome = sched.run_cycle().await;

        assert!(outcome.overrun);
        assert_eq!(outcome.summary.map(|s| s.new_devices), Some(1));
        let overruns = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, ScanEvent::Overrun { .. }))
            .count();
        assert_eq!(overruns, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_scan_has_no_overrun() {
        let sched = scheduler(Arc::new(SlowBackend::new(Duration::from_secs(1))), 10);
        let mut rx = sched.subscribe();

        let outcome = sched.run_cycle().await;

        assert!(!outcome.overrun);
        let events = drain(&mut rx);
        assert_eq!(events.first(), Some(&ScanEvent::ScanStarted));
        assert!(matches!(events.last(), Some(ScanEvent::ScanCompleted { found: 1, new: 1, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_error_yields_empty_cycle() {
        let sched = scheduler(Arc::new(FailingBackend), 10);
        let mut rx = sched.subscribe();

        let outcome = sched.run_cycle().await;

        assert!(outcome.summary.is_none());
        assert!(sched.correlator().view().last_scan().is_none());
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, ScanEvent::ScanFailed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_bounds_a_hung_backend() {
        let correlator = Arc::new(Correlator::new(Arc::new(JsonStore::in_memory())));
        let sched = Scheduler::new(
            Arc::new(SlowBackend::new(Duration::from_secs(3600))),
            correlator,
            SchedulerConfig {
                interval: Duration::from_secs(10),
                scan_timeout: Duration::from_secs(5),
            },
        );

        let outcome = sched.run_cycle().await;

        assert!(outcome.summary.is_none());
        assert!(!outcome.overrun);
        assert_eq!(outcome.elapsed, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_scans_never_overlap() {
        let backend = Arc::new(SlowBackend::new(Duration::from_secs(15)));
        let sched = Arc::new(scheduler(backend.clone(), 10));
        let mut rx = sched.subscribe();

        let handle = sched.clone().start().unwrap();
        tokio::time::sleep(Duration::from_secs(50)).await;
        handle.stop().await;

        assert_eq!(backend.max_active.load(Ordering::SeqCst), 1);

        let runs = backend.runs.lock().unwrap().clone();
        assert!(runs.len() >= 3, "expected back-to-back scans, got {}", runs.len());
        for pair in runs.windows(2) {
            let (_, prev_end) = pair[0];
            let (next_start, _) = pair[1];
            assert!(next_start >= prev_end);
            assert!(next_start - prev_end < Duration::from_secs(1));
        }

        let overruns = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, ScanEvent::Overrun { .. }))
            .count();
        assert_eq!(overruns, runs.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_keeps_running_after_failures() {
        let sched = Arc::new(scheduler(Arc::new(FailingBackend), 10));
        let mut rx = sched.subscribe();

        let handle = sched.clone().start().unwrap();
        tokio::time::sleep(Duration::from_secs(35)).await;
        handle.stop().await;

        let failures = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, ScanEvent::ScanFailed { .. }))
            .count();
        assert!(failures >= 3, "expected repeated attempts, got {}", failures);
    }
}
