//! Memory monitor: evicts runs when the process outgrows its heap budget.
//!
//! The monitor alternates between sampling the [`Runtime`] and sleeping for
//! the configured interval. Besides the timer, the index wakes the monitor
//! after every `max_ingested_runs` successful ingests so that a burst of
//! loads is checked immediately.
//!
//! `start` runs the loop on the calling task and only returns once the
//! monitor is stopped (or if it was already running).

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::MonitorError;
use crate::index::{IndexObserver, ShardedIndex};
use crate::run::TestRun;

/// Source of the current process heap size.
pub trait Runtime: Send + Sync {
    fn heap_bytes(&self) -> u64;
}

/// Notified when a running monitor is stopped.
pub trait MonitorObserver: Send + Sync {
    fn on_stopped(&self) {}
}

/// Tunables for [`IndexMonitor`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorSettings {
    pub interval: Duration,
    pub max_heap_bytes: u64,
    /// Fraction of resident runs evicted per over-budget check.
    pub eviction_fraction: f64,
    /// Successful ingests between forced checks; 0 disables the trigger.
    pub max_ingested_runs: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_heap_bytes: 0,
            eviction_fraction: 0.1,
            max_ingested_runs: 10,
        }
    }
}

fn validate_fraction(fraction: f64) -> Result<f64, MonitorError> {
    if (0.0..=1.0).contains(&fraction) {
        Ok(fraction)
    } else {
        Err(MonitorError::InvalidFraction(fraction))
    }
}

#[derive(Debug)]
struct MonitorState {
    running: bool,
    /// Bumped on every stop; a loop exits once its generation is stale.
    generation: u64,
    /// Wakes the loop of the current generation when it is stopped.
    stop_signal: Option<Arc<Notify>>,
    settings: MonitorSettings,
}

/// Wakes the monitor every `every` ingests.
struct IngestTrigger {
    every: usize,
    ingested: AtomicUsize,
    wake: Arc<Notify>,
}

impl IndexObserver for IngestTrigger {
    fn on_ingested(&self, run: &TestRun) {
        let count = self.ingested.fetch_add(1, Ordering::SeqCst) + 1;
        if count % self.every == 0 {
            tracing::debug!(run_id = %run.id, ingested = count, "Ingest threshold reached; waking monitor");
            self.wake.notify_one();
        }
    }
}

/// Heap-budget monitor over a [`ShardedIndex`].
pub struct IndexMonitor {
    runtime: Arc<dyn Runtime>,
    index: Arc<ShardedIndex>,
    state: Mutex<MonitorState>,
    wake: Arc<Notify>,
    /// Registered on `index`; removed when the monitor is dropped.
    trigger: Option<Arc<dyn IndexObserver>>,
    observers: RwLock<Vec<Arc<dyn MonitorObserver>>>,
}

impl Drop for IndexMonitor {
    fn drop(&mut self) {
        if let Some(trigger) = &self.trigger {
            self.index.remove_observer(trigger);
        }
    }
}

impl std::fmt::Debug for IndexMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexMonitor")
            .field("state", &*self.lock())
            .finish_non_exhaustive()
    }
}

impl IndexMonitor {
    /// Creates a stopped monitor and registers its ingest trigger on `index`.
    pub fn new(
        runtime: Arc<dyn Runtime>,
        index: Arc<ShardedIndex>,
        settings: MonitorSettings,
    ) -> Result<Self, MonitorError> {
        if settings.interval.is_zero() {
            return Err(MonitorError::ZeroInterval);
        }
        validate_fraction(settings.eviction_fraction)?;

        let wake = Arc::new(Notify::new());
        let trigger = (settings.max_ingested_runs > 0).then(|| {
            let trigger: Arc<dyn IndexObserver> = Arc::new(IngestTrigger {
                every: settings.max_ingested_runs,
                ingested: AtomicUsize::new(0),
                wake: Arc::clone(&wake),
            });
            index.add_observer(Arc::clone(&trigger));
            trigger
        });
        Ok(Self {
            runtime,
            index,
            state: Mutex::new(MonitorState {
                running: false,
                generation: 0,
                stop_signal: None,
                settings,
            }),
            wake,
            trigger,
            observers: RwLock::new(Vec::new()),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_observer(&self, observer: Arc<dyn MonitorObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Returns whether `observer` was registered.
    pub fn remove_observer(&self, observer: &Arc<dyn MonitorObserver>) -> bool {
        let mut observers = self
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|existing| !Arc::ptr_eq(existing, observer));
        observers.len() != before
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    #[must_use]
    pub fn settings(&self) -> MonitorSettings {
        self.lock().settings
    }

    /// Runs the monitor loop until [`stop`](Self::stop) is called.
    ///
    /// Returns [`MonitorError::Running`] immediately if the monitor is
    /// already running, and [`MonitorError::Stopped`] once it has been
    /// stopped.
    pub async fn start(&self) -> Result<Infallible, MonitorError> {
        let (generation, stop_signal) = {
            let mut state = self.lock();
            if state.running {
                return Err(MonitorError::Running);
            }
            state.running = true;
            let stop_signal = Arc::new(Notify::new());
            state.stop_signal = Some(Arc::clone(&stop_signal));
            (state.generation, stop_signal)
        };
        tracing::info!(generation, "Memory monitor started");

        loop {
            let interval = {
                let state = self.lock();
                if !state.running || state.generation != generation {
                    return Err(MonitorError::Stopped);
                }
                state.settings.interval
            };

            self.check();

            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                () = self.wake.notified() => {}
                () = stop_signal.notified() => {}
            }
        }
    }

    /// Stops a running monitor. Fails with [`MonitorError::Stopped`] if it
    /// is not running.
    pub fn stop(&self) -> Result<(), MonitorError> {
        let stop_signal = {
            let mut state = self.lock();
            if !state.running {
                return Err(MonitorError::Stopped);
            }
            state.running = false;
            state.generation += 1;
            state.stop_signal.take()
        };
        tracing::info!("Memory monitor stopped");
        if let Some(signal) = stop_signal {
            signal.notify_one();
        }

        let observers = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            observer.on_stopped();
        }
        Ok(())
    }

    /// Samples the heap once and evicts if over budget. Returns the number of
    /// runs evicted.
    pub fn check(&self) -> usize {
        let settings = self.settings();
        let heap_bytes = self.runtime.heap_bytes();
        if heap_bytes <= settings.max_heap_bytes {
            tracing::debug!(heap_bytes, max_heap_bytes = settings.max_heap_bytes, "Monitor: heap usage OK");
            return 0;
        }

        tracing::error!(
            heap_bytes,
            max_heap_bytes = settings.max_heap_bytes,
            "Out of memory; evicting runs"
        );
        match self.index.evict_runs(settings.eviction_fraction) {
            Ok(evicted) => evicted,
            Err(err) => {
                tracing::warn!(error = %err, code = err.code(), "Eviction failed");
                0
            }
        }
    }

    /// Takes effect on the next check.
    pub fn set_interval(&self, interval: Duration) -> Result<(), MonitorError> {
        if interval.is_zero() {
            return Err(MonitorError::ZeroInterval);
        }
        self.lock().settings.interval = interval;
        Ok(())
    }

    pub fn set_max_heap_bytes(&self, max_heap_bytes: u64) {
        self.lock().settings.max_heap_bytes = max_heap_bytes;
    }

    pub fn set_eviction_fraction(&self, fraction: f64) -> Result<(), MonitorError> {
        self.lock().settings.eviction_fraction = validate_fraction(fraction)?;
        Ok(())
    }
}

// =============================================================================
// Process runtime
// =============================================================================

/// Reports the resident set size of the current process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRuntime;

impl Runtime for ProcessRuntime {
    fn heap_bytes(&self) -> u64 {
        read_resident_bytes()
    }
}

#[cfg(target_os = "linux")]
fn read_resident_bytes() -> u64 {
    std::fs::read_to_string("/proc/self/status")
        .map(|status| parse_vm_rss(&status))
        .unwrap_or(0)
}

/// `VmRSS:  123456 kB` line of `/proc/<pid>/status`, in bytes.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_vm_rss(status: &str) -> u64 {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|val| val.trim().trim_end_matches("kB").trim().parse::<u64>().ok())
        .map_or(0, |kb| kb * 1024)
}

/// `ps -o rss=` reports kilobytes.
#[cfg(target_os = "macos")]
fn read_resident_bytes() -> u64 {
    std::process::Command::new("ps")
        .args(["-o", "rss=", "-p", &std::process::id().to_string()])
        .output()
        .ok()
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map_or(0, |kb| kb * 1024)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn read_resident_bytes() -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use super::*;
    use crate::report::{InMemoryReportLoader, TestResult, TestResultsReport};
    use crate::run::RunId;
    use crate::status::TestStatus;

    #[derive(Default)]
    struct FakeRuntime {
        heap: AtomicU64,
        samples: AtomicUsize,
    }

    impl Runtime for FakeRuntime {
        fn heap_bytes(&self) -> u64 {
            self.samples.fetch_add(1, Ordering::SeqCst);
            self.heap.load(Ordering::SeqCst)
        }
    }

    fn settings() -> MonitorSettings {
        MonitorSettings {
            interval: Duration::from_secs(1),
            max_heap_bytes: 100,
            eviction_fraction: 0.5,
            max_ingested_runs: 0,
        }
    }

    async fn index_with_runs(n: i64) -> Arc<ShardedIndex> {
        let loader = InMemoryReportLoader::new();
        for id in 1..=n {
            loader.insert(
                RunId(id),
                TestResultsReport::new(vec![TestResult::new("/a", TestStatus::Pass)]),
            );
        }
        let index = Arc::new(ShardedIndex::new(Arc::new(loader), 2).unwrap());
        for id in 1..=n {
            index.ingest_run(TestRun::new(id, "chrome")).await.unwrap();
        }
        index
    }

    #[test]
    fn rejects_invalid_settings() {
        let index = Arc::new(ShardedIndex::new(Arc::new(InMemoryReportLoader::new()), 1).unwrap());
        let rt = Arc::new(FakeRuntime::default());
        let bad_fraction = MonitorSettings {
            eviction_fraction: 1.5,
            ..settings()
        };
        assert_eq!(
            IndexMonitor::new(rt.clone(), index.clone(), bad_fraction).unwrap_err(),
            MonitorError::InvalidFraction(1.5)
        );
        let zero = MonitorSettings {
            interval: Duration::ZERO,
            ..settings()
        };
        assert_eq!(
            IndexMonitor::new(rt.clone(), index.clone(), zero).unwrap_err(),
            MonitorError::ZeroInterval
        );

        let monitor = IndexMonitor::new(rt, index, settings()).unwrap();
        assert!(monitor.set_eviction_fraction(-0.1).is_err());
        assert!(monitor.set_eviction_fraction(f64::NAN).is_err());
        assert!(monitor.set_eviction_fraction(1.0).is_ok());
        assert_eq!(monitor.set_interval(Duration::ZERO), Err(MonitorError::ZeroInterval));
    }

    #[tokio::test]
    async fn check_evicts_only_over_budget() {
        let index = index_with_runs(4).await;
        let rt = Arc::new(FakeRuntime::default());
        let monitor = IndexMonitor::new(rt.clone(), index.clone(), settings()).unwrap();

        rt.heap.store(100, Ordering::SeqCst);
        assert_eq!(monitor.check(), 0);
        rt.heap.store(101, Ordering::SeqCst);
        assert_eq!(monitor.check(), 2);
        assert_eq!(index.len(), 2);

        monitor.set_max_heap_bytes(1_000);
        assert_eq!(monitor.check(), 0);
    }

    #[tokio::test]
    async fn stop_without_start_is_stopped() {
        let index = index_with_runs(0).await;
        let monitor = IndexMonitor::new(Arc::new(FakeRuntime::default()), index, settings()).unwrap();
        assert_eq!(monitor.stop(), Err(MonitorError::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn double_start_yields_running_then_stopped() {
        let index = index_with_runs(0).await;
        let monitor = Arc::new(
            IndexMonitor::new(Arc::new(FakeRuntime::default()), index, settings()).unwrap(),
        );

        let first = tokio::spawn({
            let monitor = Arc::clone(&monitor);
            async move { monitor.start().await }
        });
        tokio::task::yield_now().await;
        assert!(monitor.is_running());

        let second = monitor.start().await;
        assert_eq!(second.unwrap_err(), MonitorError::Running);

        monitor.stop().unwrap();
        assert_eq!(first.await.unwrap().unwrap_err(), MonitorError::Stopped);
        assert_eq!(monitor.stop(), Err(MonitorError::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_right_after_stop_leaves_one_loop() {
        let index = index_with_runs(0).await;
        let rt = Arc::new(FakeRuntime::default());
        let monitor = Arc::new(IndexMonitor::new(rt.clone(), index, settings()).unwrap());
        let first = tokio::spawn({
            let monitor = Arc::clone(&monitor);
            async move { monitor.start().await }
        });
        tokio::task::yield_now().await;
        assert_eq!(rt.samples.load(Ordering::SeqCst), 1);

        // Restart before the first loop gets a chance to observe the stop.
        monitor.stop().unwrap();
        let mut second = Box::pin({
            let monitor = Arc::clone(&monitor);
            async move { monitor.start().await }
        });
        assert!(
            tokio::time::timeout(Duration::ZERO, &mut second)
                .await
                .is_err()
        );
        assert!(monitor.is_running());
        assert_eq!(rt.samples.load(Ordering::SeqCst), 2);
        let second = tokio::spawn(second);

        assert_eq!(first.await.unwrap().unwrap_err(), MonitorError::Stopped);
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(rt.samples.load(Ordering::SeqCst), 3);

        monitor.stop().unwrap();
        assert_eq!(second.await.unwrap().unwrap_err(), MonitorError::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn samples_on_each_interval() {
        let index = index_with_runs(0).await;
        let rt = Arc::new(FakeRuntime::default());
        let monitor = Arc::new(IndexMonitor::new(rt.clone(), index, settings()).unwrap());
        let task = tokio::spawn({
            let monitor = Arc::clone(&monitor);
            async move { monitor.start().await }
        });

        tokio::task::yield_now().await;
        assert_eq!(rt.samples.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(rt.samples.load(Ordering::SeqCst), 4);

        monitor.stop().unwrap();
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn ingest_threshold_forces_a_check() {
        let loader = InMemoryReportLoader::new();
        for id in 1..=4 {
            loader.insert(RunId(id), TestResultsReport::default());
        }
        let index = Arc::new(ShardedIndex::new(Arc::new(loader), 1).unwrap());
        let rt = Arc::new(FakeRuntime::default());
        let monitor = Arc::new(
            IndexMonitor::new(
                rt.clone(),
                Arc::clone(&index),
                MonitorSettings {
                    interval: Duration::from_secs(3_600),
                    max_ingested_runs: 2,
                    ..settings()
                },
            )
            .unwrap(),
        );
        let task = tokio::spawn({
            let monitor = Arc::clone(&monitor);
            async move { monitor.start().await }
        });
        tokio::task::yield_now().await;
        assert_eq!(rt.samples.load(Ordering::SeqCst), 1);

        index.ingest_run(TestRun::new(1, "chrome")).await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(rt.samples.load(Ordering::SeqCst), 1);

        index.ingest_run(TestRun::new(2, "chrome")).await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(rt.samples.load(Ordering::SeqCst), 2);

        monitor.stop().unwrap();
        let _ = task.await;
    }

    struct StopFlag(AtomicUsize);

    impl MonitorObserver for StopFlag {
        fn on_stopped(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn observers_see_stop() {
        let index = index_with_runs(0).await;
        let monitor = Arc::new(
            IndexMonitor::new(Arc::new(FakeRuntime::default()), index, settings()).unwrap(),
        );
        let flag = Arc::new(StopFlag(AtomicUsize::new(0)));
        monitor.add_observer(flag.clone());

        let task = tokio::spawn({
            let monitor = Arc::clone(&monitor);
            async move { monitor.start().await }
        });
        tokio::task::yield_now().await;
        monitor.stop().unwrap();
        let _ = task.await;
        assert_eq!(flag.0.load(Ordering::SeqCst), 1);

        let observer: Arc<dyn MonitorObserver> = flag.clone();
        assert!(monitor.remove_observer(&observer));
        let task = tokio::spawn({
            let monitor = Arc::clone(&monitor);
            async move { monitor.start().await }
        });
        tokio::task::yield_now().await;
        monitor.stop().unwrap();
        let _ = task.await;
        assert_eq!(flag.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_monitor_unregisters_ingest_trigger() {
        let loader = InMemoryReportLoader::new();
        loader.insert(RunId(1), TestResultsReport::default());
        let index = Arc::new(ShardedIndex::new(Arc::new(loader), 1).unwrap());
        let trigger_settings = MonitorSettings {
            max_ingested_runs: 1,
            ..settings()
        };
        let monitor =
            IndexMonitor::new(Arc::new(FakeRuntime::default()), Arc::clone(&index), trigger_settings)
                .unwrap();
        let trigger = monitor.trigger.clone().unwrap();
        drop(monitor);
        assert!(!index.remove_observer(&trigger));
        index.ingest_run(TestRun::new(1, "chrome")).await.unwrap();
    }

    #[test]
    fn parses_vm_rss() {
        let status = "Name:\tsearchcache\nVmPeak:\t  9000 kB\nVmRSS:\t  2048 kB\nThreads: 4\n";
        assert_eq!(parse_vm_rss(status), 2048 * 1024);
        assert_eq!(parse_vm_rss("Name: x\n"), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn process_runtime_reports_nonzero_on_linux() {
        assert!(ProcessRuntime.heap_bytes() > 0);
    }
}
