//! Periodic status driver
//!
//! A background thread publishes the connection status and runs one
//! status cycle per interval. It stops on request, or by itself once the
//! link is gone; reconnecting is left to the caller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::monitor::SafetyMonitor;

/// Granularity of the stop check while waiting for the next tick
const STOP_CHECK: Duration = Duration::from_millis(20);

/// Handle to the polling thread
pub struct Poller {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Poller {
    /// Start polling `monitor` every `interval`
    pub fn start(monitor: Arc<SafetyMonitor>, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::spawn(move || run(&monitor, interval, &flag));
        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// The thread is still polling
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the thread and wait for it
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("poller thread panicked");
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(monitor: &SafetyMonitor, interval: Duration, stop: &AtomicBool) {
    tracing::debug!(?interval, "poller started");
    loop {
        let next_tick = Instant::now() + interval;
        while Instant::now() < next_tick {
            if stop.load(Ordering::SeqCst) {
                tracing::debug!("poller stopped");
                return;
            }
            thread::sleep(STOP_CHECK.min(next_tick.saturating_duration_since(Instant::now())));
        }
        if stop.load(Ordering::SeqCst) {
            tracing::debug!("poller stopped");
            return;
        }

        monitor.publish_status();
        if !monitor.is_connected() {
            tracing::info!("link closed, poller exiting");
            return;
        }
        if let Err(e) = monitor.update_status() {
            tracing::debug!(error = %e, "status poll failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LinkConfig, PortSelection, TimingConfig};
    use crate::events::Notifier;
    use crate::host::NoHost;
    use crate::protocol::mock::MockBackend;

    #[test]
    fn test_poller_exits_when_disconnected() {
        let config = LinkConfig {
            serial_port: PortSelection::Named("/dev/null0".to_string()),
            timing: TimingConfig::fast(),
            ..LinkConfig::default()
        };
        let monitor = Arc::new(SafetyMonitor::new(
            config,
            Arc::new(MockBackend::new()),
            Arc::new(NoHost),
            Notifier::silent(),
        ));

        let poller = Poller::start(monitor, Duration::from_millis(5));
        let deadline = Instant::now() + Duration::from_secs(2);
        while poller.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!poller.is_running());
    }
}
