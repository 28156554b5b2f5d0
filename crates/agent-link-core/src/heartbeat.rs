//! Heartbeat probe/ack liveness monitoring.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::{
    sync::Notify,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};

/// Channel side of a heartbeat: knows whether it is open and how to probe.
pub trait LivenessProbe: Send + Sync + 'static {
    /// Whether the underlying channel is currently open.
    fn is_open(&self) -> bool;

    /// Send one probe. Returns `false` if the channel refused it.
    fn send_probe(&self) -> bool;
}

/// Probe timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub grace: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(10_000),
            grace: Duration::from_millis(1000),
        }
    }
}

impl HeartbeatConfig {
    /// Time without an ack after which the channel counts as degraded.
    #[must_use]
    pub fn ack_timeout(&self) -> Duration {
        self.interval + self.grace
    }
}

/// Snapshot of heartbeat bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatStats {
    pub probes_sent: u64,
    pub last_probe: Option<Instant>,
    pub last_ack: Option<Instant>,
    pub degraded: bool,
    pub running: bool,
}

#[derive(Default)]
struct Shared {
    stats: Mutex<HeartbeatStats>,
    ack: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn stats(&self) -> std::sync::MutexGuard<'_, HeartbeatStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Periodic liveness probe with ack deadline.
///
/// One monitor per channel. The failure callback fires once per
/// degradation; an ack after a degradation re-arms it.
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    shared: Arc<Shared>,
}

impl HeartbeatMonitor {
    /// A zero interval cannot drive the timer and is replaced by the
    /// default one.
    #[must_use]
    pub fn new(mut config: HeartbeatConfig) -> Self {
        if config.interval.is_zero() {
            let fallback = HeartbeatConfig::default().interval;
            tracing::warn!(?fallback, "zero heartbeat interval, using default");
            config.interval = fallback;
        }
        Self {
            config,
            shared: Arc::new(Shared::default()),
        }
    }

    #[must_use]
    pub const fn config(&self) -> HeartbeatConfig {
        self.config
    }

    /// Start probing. Restarts the loop if it is already running.
    pub fn start<F>(&self, probe: Arc<dyn LivenessProbe>, on_failure: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.stop();
        {
            let mut stats = self.shared.stats();
            *stats = HeartbeatStats {
                running: true,
                ..HeartbeatStats::default()
            };
        }

        let shared = Arc::clone(&self.shared);
        let config = self.config;
        let handle = tokio::spawn(async move {
            run_probe_loop(&shared, config, probe.as_ref(), on_failure).await;
            shared.stats().running = false;
        });
        *self.shared.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Record an ack from the peer and push the deadline out.
    pub fn on_ack(&self) {
        self.shared.stats().last_ack = Some(Instant::now());
        self.shared.ack.notify_one();
    }

    /// Cancel all timers. Safe to call repeatedly and from any state.
    pub fn stop(&self) {
        let task = self
            .shared
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
        self.shared.stats().running = false;
    }

    #[must_use]
    pub fn stats(&self) -> HeartbeatStats {
        self.shared.stats().clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.stats().running
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_probe_loop<F>(
    shared: &Shared,
    config: HeartbeatConfig,
    probe: &dyn LivenessProbe,
    on_failure: F,
) where
    F: Fn(),
{
    let ack_timeout = config.ack_timeout();
    let mut ticker = time::interval_at(Instant::now() + config.interval, config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let deadline = time::sleep(ack_timeout);
    tokio::pin!(deadline);
    let mut degraded = false;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // The channel may have closed since the last tick.
                if !probe.is_open() {
                    tracing::debug!("channel closed, heartbeat stopping");
                    break;
                }
                if !probe.send_probe() {
                    tracing::debug!("probe refused, heartbeat stopping");
                    break;
                }
                let mut stats = shared.stats();
                stats.probes_sent += 1;
                stats.last_probe = Some(Instant::now());
            }
            () = &mut deadline, if !degraded => {
                degraded = true;
                shared.stats().degraded = true;
                tracing::warn!(timeout = ?ack_timeout, "no heartbeat ack, channel degraded");
                on_failure();
            }
            () = shared.ack.notified() => {
                deadline.as_mut().reset(Instant::now() + ack_timeout);
                if degraded {
                    tracing::info!("heartbeat ack received, channel recovered");
                }
                degraded = false;
                shared.stats().degraded = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    struct FakeProbe {
        open: AtomicBool,
        sent: AtomicUsize,
    }

    impl FakeProbe {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                open: AtomicBool::new(true),
                sent: AtomicUsize::new(0),
            })
        }
    }

    impl LivenessProbe for FakeProbe {
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn send_probe(&self) -> bool {
            self.sent.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn monitor(interval_ms: u64, grace_ms: u64) -> HeartbeatMonitor {
        HeartbeatMonitor::new(HeartbeatConfig {
            interval: Duration::from_millis(interval_ms),
            grace: Duration::from_millis(grace_ms),
        })
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let hook = Arc::clone(&count);
        (count, move || {
            hook.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_probes_on_interval() {
        let monitor = monitor(1000, 1000);
        let probe = FakeProbe::new();
        let (_failures, on_failure) = counter();
        monitor.start(probe.clone(), on_failure);

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(1000)).await;
            monitor.on_ack();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(probe.sent.load(Ordering::SeqCst), 3);
        let stats = monitor.stats();
        assert_eq!(stats.probes_sent, 3);
        assert!(stats.last_ack.is_some());
        assert!(!stats.degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_ack_degrades_exactly_once() {
        let monitor = monitor(1000, 1000);
        let (failures, on_failure) = counter();
        monitor.start(FakeProbe::new(), on_failure);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        monitor.on_ack();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(failures.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert!(monitor.stats().degraded);

        tokio::time::sleep(Duration::from_millis(10_000)).await;
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_rearms_after_degradation() {
        let monitor = monitor(1000, 500);
        let (failures, on_failure) = counter();
        monitor.start(FakeProbe::new(), on_failure);

        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert_eq!(failures.load(Ordering::SeqCst), 1);

        monitor.on_ack();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!monitor.stats().degraded);

        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert_eq!(failures.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_itself_when_channel_closed() {
        let monitor = monitor(1000, 1000);
        let probe = FakeProbe::new();
        let (failures, on_failure) = counter();
        probe.open.store(false, Ordering::SeqCst);
        monitor.start(probe.clone(), on_failure);

        tokio::time::sleep(Duration::from_millis(5000)).await;
        assert_eq!(probe.sent.load(Ordering::SeqCst), 0);
        assert_eq!(failures.load(Ordering::SeqCst), 0);
        assert!(!monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let monitor = monitor(1000, 1000);
        monitor.stop();

        let (failures, on_failure) = counter();
        monitor.start(FakeProbe::new(), on_failure);
        assert!(monitor.is_running());
        monitor.stop();
        monitor.stop();

        tokio::time::sleep(Duration::from_millis(10_000)).await;
        assert_eq!(failures.load(Ordering::SeqCst), 0);
        assert!(!monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_uses_default() {
        let monitor = monitor(0, 0);
        assert_eq!(monitor.config().interval, HeartbeatConfig::default().interval);

        let liveness = FakeProbe::new();
        let (failures, on_failure) = counter();
        monitor.start(liveness.clone(), on_failure);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(monitor.is_running());
        assert_eq!(liveness.sent.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(10_000)).await;
        assert!(monitor.is_running());
        assert_eq!(liveness.sent.load(Ordering::SeqCst), 1);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ack_timeout_is_interval_plus_grace() {
        let config = HeartbeatConfig::default();
        assert_eq!(config.ack_timeout(), Duration::from_millis(11_000));
    }
}
