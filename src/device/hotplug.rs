use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::manager::DeviceManager;
use super::models::{DeviceInfo, DeviceSnapshot, SnapshotDiff};
use super::{DeviceError, Result};

/// Everything a change callback needs to react without re-querying the
/// monitor: the new population, the step delta, and the cumulative delta
/// since monitoring began.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceChangeEvent {
    /// Capture time of the snapshot that triggered the event.
    pub timestamp: DateTime<Utc>,
    /// Absolute device list at that time.
    pub current_devices: Vec<DeviceInfo>,
    /// Delta against the previous poll.
    pub changes_from_last: SnapshotDiff,
    /// Delta against the snapshot taken when monitoring started.
    pub changes_from_initial: SnapshotDiff,
    pub initial_snapshot: DeviceSnapshot,
    pub current_snapshot: DeviceSnapshot,
}

type ChangeCallback = Box<dyn Fn(&DeviceChangeEvent) + Send>;

/// Polling hotplug monitor.
///
/// Owns a background thread that re-discovers the device population at
/// a fixed interval, diffs consecutive snapshots, and invokes registered
/// callbacks on any change. Discovery is blocking OS enumeration, so the
/// loop runs on a dedicated thread rather than an async task. Survives
/// stop/start cycles; each `start` captures a fresh initial snapshot.
pub struct HotplugMonitor {
    manager: Arc<dyn DeviceManager>,
    poll_interval: Duration,
    callbacks: Arc<Mutex<Vec<ChangeCallback>>>,
    initial_snapshot: Option<DeviceSnapshot>,
    last_snapshot: Arc<Mutex<Option<DeviceSnapshot>>>,
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
    done_rx: Option<mpsc::Receiver<()>>,
}

impl HotplugMonitor {
    pub fn new(manager: Box<dyn DeviceManager>, poll_interval: Duration) -> Self {
        Self {
            manager: Arc::from(manager),
            poll_interval,
            callbacks: Arc::new(Mutex::new(Vec::new())),
            initial_snapshot: None,
            last_snapshot: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
            done_rx: None,
        }
    }

    /// Register a change callback. May be called before or after `start`.
    pub fn add_callback<F>(&self, callback: F)
    where
        F: Fn(&DeviceChangeEvent) + Send + 'static,
    {
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.push(Box::new(callback));
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Snapshot taken when monitoring last started.
    pub fn initial_snapshot(&self) -> Option<DeviceSnapshot> {
        self.initial_snapshot.clone()
    }

    /// Most recent snapshot taken by the poll loop.
    pub fn last_snapshot(&self) -> Option<DeviceSnapshot> {
        self.last_snapshot.lock().ok().and_then(|s| s.clone())
    }

    /// Take the initial snapshot and launch the poll thread. A no-op when
    /// already running.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            log::warn!("Hotplug monitor already running, start ignored");
            return Ok(());
        }

        let initial = DeviceSnapshot::new(self.manager.discover_devices()?);
        log::info!(
            "Hotplug monitor starting with {} device(s)",
            initial.len()
        );
        self.initial_snapshot = Some(initial.clone());
        if let Ok(mut last) = self.last_snapshot.lock() {
            *last = Some(initial.clone());
        }

        self.running.store(true, Ordering::SeqCst);
        let manager = Arc::clone(&self.manager);
        let running = Arc::clone(&self.running);
        let callbacks = Arc::clone(&self.callbacks);
        let last_snapshot = Arc::clone(&self.last_snapshot);
        let poll_interval = self.poll_interval;
        let (done_tx, done_rx) = mpsc::channel();
        self.done_rx = Some(done_rx);

        let handle = thread::Builder::new()
            .name("hotplug-monitor".to_string())
            .spawn(move || {
                poll_loop(
                    manager,
                    initial,
                    running,
                    callbacks,
                    last_snapshot,
                    poll_interval,
                );
                let _ = done_tx.send(());
            })
            .map_err(DeviceError::IoError)?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Stop the poll thread, waiting at most one poll interval plus a
    /// grace period. A thread stuck in OS enumeration is detached rather
    /// than blocking the caller forever.
    pub fn stop(&mut self) {
        if !self.is_running() && self.handle.is_none() {
            return;
        }
        self.running.store(false, Ordering::SeqCst);

        let deadline = self.poll_interval + Duration::from_secs(1);
        let finished = match self.done_rx.take() {
            Some(rx) => rx.recv_timeout(deadline).is_ok(),
            None => false,
        };

        if let Some(handle) = self.handle.take() {
            if finished {
                let _ = handle.join();
                log::info!("Hotplug monitor stopped");
            } else {
                log::warn!("Hotplug monitor did not stop within {:?}, detaching", deadline);
            }
        }
    }
}

impl Drop for HotplugMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_loop(
    manager: Arc<dyn DeviceManager>,
    initial: DeviceSnapshot,
    running: Arc<AtomicBool>,
    callbacks: Arc<Mutex<Vec<ChangeCallback>>>,
    last_snapshot: Arc<Mutex<Option<DeviceSnapshot>>>,
    poll_interval: Duration,
) {
    let mut previous = initial.clone();

    while running.load(Ordering::SeqCst) {
        thread::sleep(poll_interval);
        if !running.load(Ordering::SeqCst) {
            break;
        }

        let current = match manager.discover_devices() {
            Ok(devices) => DeviceSnapshot::new(devices),
            Err(err) => {
                log::warn!("Hotplug discovery failed: {}", err);
                continue;
            }
        };

        let changes_from_last = previous.diff(&current);
        if changes_from_last.has_changes() {
            log::info!(
                "Device change: {} added, {} removed, {} modified",
                changes_from_last.added.len(),
                changes_from_last.removed.len(),
                changes_from_last.modified.len()
            );
            let event = DeviceChangeEvent {
                timestamp: current.timestamp,
                current_devices: current.devices.clone(),
                changes_from_last,
                changes_from_initial: initial.diff(&current),
                initial_snapshot: initial.clone(),
                current_snapshot: current.clone(),
            };
            notify(&callbacks, &event);
        }

        if let Ok(mut last) = last_snapshot.lock() {
            *last = Some(current.clone());
        }
        previous = current;
    }
}

/// Invoke every callback, isolating the loop from callback panics.
fn notify(callbacks: &Arc<Mutex<Vec<ChangeCallback>>>, event: &DeviceChangeEvent) {
    let guard = match callbacks.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    for callback in guard.iter() {
        if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
            log::error!("Hotplug callback panicked; continuing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::models::DeviceInfo;

    struct SharedManager {
        devices: Arc<Mutex<Vec<DeviceInfo>>>,
    }

    impl DeviceManager for SharedManager {
        fn discover_devices(&self) -> Result<Vec<DeviceInfo>> {
            Ok(self.devices.lock().unwrap().clone())
        }

        fn get_port_chain(&self, _device_id: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    fn monitor_over(
        devices: Arc<Mutex<Vec<DeviceInfo>>>,
        interval: Duration,
    ) -> HotplugMonitor {
        HotplugMonitor::new(Box::new(SharedManager { devices }), interval)
    }

    #[test]
    fn test_reports_added_device() {
        let devices = Arc::new(Mutex::new(vec![DeviceInfo::new("1-1")]));
        let mut monitor = monitor_over(Arc::clone(&devices), Duration::from_millis(20));

        let seen: Arc<Mutex<Vec<DeviceChangeEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        monitor.add_callback(move |event| sink.lock().unwrap().push(event.clone()));

        monitor.start().unwrap();
        assert_eq!(monitor.initial_snapshot().unwrap().len(), 1);

        devices.lock().unwrap().push(DeviceInfo::new("1-2"));
        thread::sleep(Duration::from_millis(200));
        monitor.stop();

        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        let event = &seen[0];
        assert_eq!(event.changes_from_last.added.len(), 1);
        assert_eq!(event.changes_from_last.added[0].port_chain, "1-2");
        assert!(event.changes_from_last.removed.is_empty());
        assert_eq!(event.current_devices.len(), 2);
        assert_eq!(event.initial_snapshot.len(), 1);
        assert_eq!(event.current_snapshot.len(), 2);
        assert_eq!(event.timestamp, event.current_snapshot.timestamp);
    }

    #[test]
    fn test_changes_from_initial_accumulate() {
        let devices = Arc::new(Mutex::new(vec![DeviceInfo::new("1-1")]));
        let mut monitor = monitor_over(Arc::clone(&devices), Duration::from_millis(20));

        let seen: Arc<Mutex<Vec<DeviceChangeEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        monitor.add_callback(move |event| sink.lock().unwrap().push(event.clone()));

        monitor.start().unwrap();
        devices.lock().unwrap().push(DeviceInfo::new("1-2"));
        thread::sleep(Duration::from_millis(200));
        devices.lock().unwrap().remove(0);
        thread::sleep(Duration::from_millis(200));
        monitor.stop();

        let seen = seen.lock().unwrap();
        let last = seen.last().expect("at least one event");
        // The step delta only shows the removal, the cumulative delta
        // shows the whole drift from the initial population.
        assert_eq!(last.changes_from_last.removed.len(), 1);
        assert_eq!(last.changes_from_initial.added.len(), 1);
        assert_eq!(last.changes_from_initial.added[0].port_chain, "1-2");
        assert_eq!(last.changes_from_initial.removed.len(), 1);
        assert_eq!(last.changes_from_initial.removed[0].port_chain, "1-1");
    }

    #[test]
    fn test_callback_panic_does_not_kill_loop() {
        let devices = Arc::new(Mutex::new(Vec::new()));
        let mut monitor = monitor_over(Arc::clone(&devices), Duration::from_millis(20));

        monitor.add_callback(|_| panic!("boom"));
        let seen: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&seen);
        monitor.add_callback(move |_| *sink.lock().unwrap() += 1);

        monitor.start().unwrap();
        devices.lock().unwrap().push(DeviceInfo::new("2-1"));
        thread::sleep(Duration::from_millis(200));
        devices.lock().unwrap().clear();
        thread::sleep(Duration::from_millis(200));
        monitor.stop();

        // Both changes observed despite the panicking neighbor
        assert!(*seen.lock().unwrap() >= 2);
    }

    #[test]
    fn test_stop_is_bounded_and_idempotent() {
        let devices = Arc::new(Mutex::new(Vec::new()));
        let mut monitor = monitor_over(devices, Duration::from_millis(20));
        monitor.start().unwrap();
        assert!(monitor.is_running());

        let begun = std::time::Instant::now();
        monitor.stop();
        assert!(begun.elapsed() < Duration::from_secs(2));
        assert!(!monitor.is_running());
        monitor.stop();
    }

    #[test]
    fn test_restart_after_stop() {
        let devices = Arc::new(Mutex::new(vec![DeviceInfo::new("4-1")]));
        let mut monitor = monitor_over(Arc::clone(&devices), Duration::from_millis(20));

        monitor.start().unwrap();
        monitor.stop();

        // The second run re-baselines against the population at restart.
        devices.lock().unwrap().push(DeviceInfo::new("4-2"));
        monitor.start().unwrap();
        assert!(monitor.is_running());
        assert_eq!(monitor.initial_snapshot().unwrap().len(), 2);

        let seen: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&seen);
        monitor.add_callback(move |event| {
            *sink.lock().unwrap() += event.changes_from_last.removed.len()
        });
        devices.lock().unwrap().clear();
        thread::sleep(Duration::from_millis(200));
        monitor.stop();
        assert_eq!(*seen.lock().unwrap(), 2);
    }

    #[test]
    fn test_start_while_running_is_noop() {
        let devices = Arc::new(Mutex::new(vec![DeviceInfo::new("5-1")]));
        let mut monitor = monitor_over(Arc::clone(&devices), Duration::from_millis(20));

        monitor.start().unwrap();
        let baseline = monitor.initial_snapshot().unwrap().timestamp;
        monitor.start().unwrap();
        assert!(monitor.is_running());
        assert_eq!(monitor.initial_snapshot().unwrap().timestamp, baseline);
        monitor.stop();
    }

    #[test]
    fn test_last_snapshot_tracks_population() {
        let devices = Arc::new(Mutex::new(vec![DeviceInfo::new("3-1")]));
        let mut monitor = monitor_over(Arc::clone(&devices), Duration::from_millis(20));
        monitor.start().unwrap();
        devices.lock().unwrap().push(DeviceInfo::new("3-2"));
        thread::sleep(Duration::from_millis(200));
        monitor.stop();
        assert_eq!(monitor.last_snapshot().unwrap().len(), 2);
    }
}
