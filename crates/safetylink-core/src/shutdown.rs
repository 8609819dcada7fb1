//! Automatic shutdown after a print
//!
//! When armed, a finished print starts a countdown the operator can abort.
//! Unrendered timelapses on the host hold the countdown back. On expiry the
//! printer is switched off through the MCU (`C6 off`) and the host is asked
//! to shut the system down.

use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::ShutdownConfig;
use crate::events::{Notification, Notifier, Severity};
use crate::monitor::SafetyMonitor;

/// Granularity of the abort check while waiting
const STOP_CHECK: Duration = Duration::from_millis(20);

/// How a print job ended, as reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintOutcome {
    Done,
    /// Failed with the printer closed or in error
    Failed,
    /// Stopped by the operator
    Cancelled,
}

#[derive(Debug, Default)]
struct TimerState {
    enabled: bool,
    /// A countdown (or the wait before it) is in progress
    active: bool,
    remaining: Option<u32>,
    /// Bumped on abort so a running countdown notices it is stale
    generation: u64,
}

struct Shared {
    monitor: Arc<SafetyMonitor>,
    config: ShutdownConfig,
    state: Mutex<TimerState>,
}

impl Shared {
    fn notifier(&self) -> &Notifier {
        self.monitor.connection().notifier()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state.lock().generation == generation
    }

    /// Sleep for `period`; false once the countdown was aborted
    fn wait(&self, period: Duration, generation: u64) -> bool {
        let deadline = Instant::now() + period;
        loop {
            if !self.is_current(generation) {
                return false;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return true;
            }
            thread::sleep(STOP_CHECK.min(left));
        }
    }

    fn publish(&self) {
        let notification = {
            let state = self.state.lock();
            Notification::Shutdown {
                enabled: state.enabled,
                remaining: state.remaining,
            }
        };
        self.notifier().emit(notification);
    }

    fn shut_down(&self) {
        if self.config.turn_off_printer && self.monitor.is_connected() {
            self.notifier()
                .log("Turning off the printer.", Severity::Info);
            if let Err(e) = self.monitor.power_off() {
                tracing::warn!(error = %e, "printer power off failed");
            }
        }
        self.notifier()
            .log("Shutting down system.", Severity::Info);
        self.monitor.connection().host().shutdown_system();
    }
}

fn run(shared: &Shared, generation: u64) {
    let host = shared.monitor.connection().host().clone();
    loop {
        let pending = host.pending_renders();
        if pending == 0 {
            break;
        }
        shared.notifier().log(
            &format!(
                "Waiting for {pending} timelapse(s) to finish rendering before starting shutdown timer..."
            ),
            Severity::Info,
        );
        if !shared.wait(shared.config.render_poll(), generation) {
            return;
        }
    }

    {
        let mut state = shared.state.lock();
        if state.generation != generation {
            return;
        }
        state.remaining = Some(shared.config.countdown_secs);
    }
    shared
        .notifier()
        .log("Starting abort shutdown timer.", Severity::Info);
    shared.publish();

    loop {
        if !shared.wait(shared.config.tick(), generation) {
            return;
        }
        let remaining = {
            let mut state = shared.state.lock();
            if state.generation != generation {
                return;
            }
            let remaining = state.remaining.unwrap_or(0).saturating_sub(1);
            state.remaining = Some(remaining);
            remaining
        };
        shared.publish();
        if remaining == 0 {
            break;
        }
    }

    {
        let mut state = shared.state.lock();
        if state.generation != generation {
            return;
        }
        state.active = false;
    }
    tracing::info!("shutdown countdown expired");
    shared.shut_down();
}

/// Countdown to printer power-off after a print
pub struct ShutdownTimer {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ShutdownTimer {
    pub fn new(monitor: Arc<SafetyMonitor>, config: ShutdownConfig) -> Self {
        let state = TimerState {
            enabled: config.enabled,
            ..TimerState::default()
        };
        Self {
            shared: Arc::new(Shared {
                monitor,
                config,
                state: Mutex::new(state),
            }),
            handle: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.state.lock().enabled
    }

    /// A countdown is running or waiting for timelapses
    pub fn is_active(&self) -> bool {
        self.shared.state.lock().active
    }

    /// Seconds left, once the countdown itself has started
    pub fn remaining(&self) -> Option<u32> {
        self.shared.state.lock().remaining
    }

    /// Arm the timer for the next finished print
    pub fn enable(&self) {
        self.shared.state.lock().enabled = true;
        self.shared.publish();
    }

    /// Disarm the timer. A countdown already running keeps going.
    pub fn disable(&self) {
        self.shared.state.lock().enabled = false;
        self.shared.publish();
    }

    /// Publish the current state, e.g. for a freshly opened UI
    pub fn publish(&self) {
        self.shared.publish();
    }

    /// Stop a pending or running countdown
    pub fn abort(&self) {
        {
            let mut state = self.shared.state.lock();
            state.generation += 1;
            state.active = false;
            state.remaining = None;
        }
        self.shared.publish();
        self.shared
            .notifier()
            .log("Shutdown aborted.", Severity::Info);
    }

    /// Host hook for the end of a print job. Returns whether a countdown
    /// was started.
    pub fn print_finished(&self, outcome: PrintOutcome) -> bool {
        if !self.is_enabled() || outcome == PrintOutcome::Cancelled {
            return false;
        }
        if !self.shared.monitor.connection().host().can_shutdown() {
            self.shared.notifier().log(
                "System shutdown command is not defined. Aborting shutdown...",
                Severity::Warning,
            );
            return false;
        }

        let generation = {
            let mut state = self.shared.state.lock();
            if state.active {
                return false;
            }
            state.active = true;
            state.generation
        };
        tracing::info!(?outcome, "print finished, arming shutdown");

        let mut handle = self.handle.lock();
        if let Some(previous) = handle.take() {
            if previous.join().is_err() {
                tracing::error!("shutdown thread panicked");
            }
        }
        let shared = self.shared.clone();
        *handle = Some(thread::spawn(move || run(&shared, generation)));
        true
    }
}

impl Drop for ShutdownTimer {
    fn drop(&mut self) {
        self.shared.state.lock().generation += 1;
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                tracing::error!("shutdown thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for ShutdownTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("ShutdownTimer")
            .field("enabled", &state.enabled)
            .field("active", &state.active)
            .field("remaining", &state.remaining)
            .finish()
    }
}
