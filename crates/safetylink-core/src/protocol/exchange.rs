//! Command exchange
//!
//! Serializes every request/response cycle on the link. The channel lives
//! behind a single gate; a caller holds the gate from the moment its frame
//! is written until the reply has been read and validated, so cycles never
//! interleave. Callers that cannot get the gate within their timeout get
//! [`ProtocolError::Busy`].

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::stream::LineChannel;
use super::{frame, Command, ProtocolError};
use crate::config::TimingConfig;
use crate::events::{Notifier, Outbox, Severity};

/// Single-flight request/response engine
pub struct CommandExchange {
    /// The exclusion gate; `None` while no port is attached
    gate: Mutex<Option<Box<dyn LineChannel>>>,
    /// Mirrors `gate.is_some()` so it can be read without the gate
    open: AtomicBool,
    /// Set on intentional teardown to stop retry loops
    abort: AtomicBool,
    /// Firmware protocol is incompatible; only bypass commands may run
    reduced: AtomicBool,
    total_messages: AtomicU64,
    bad_messages: AtomicU64,
    timing: TimingConfig,
    notifier: Notifier,
}

impl CommandExchange {
    pub fn new(timing: TimingConfig, notifier: Notifier) -> Self {
        Self {
            gate: Mutex::new(None),
            open: AtomicBool::new(false),
            abort: AtomicBool::new(false),
            reduced: AtomicBool::new(false),
            total_messages: AtomicU64::new(0),
            bad_messages: AtomicU64::new(0),
            timing,
            notifier,
        }
    }

    /// Hand an opened channel to the exchange
    pub fn attach(&self, channel: Box<dyn LineChannel>) {
        let mut gate = self.gate.lock();
        *gate = Some(channel);
        self.open.store(true, Ordering::SeqCst);
    }

    /// Drop the channel, closing the port. Returns whether one was attached.
    pub fn teardown(&self) -> bool {
        let mut gate = self.gate.lock();
        self.open.store(false, Ordering::SeqCst);
        gate.take().is_some()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Stop in-progress retry sequences
    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn clear_abort(&self) {
        self.abort.store(false, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    pub fn set_reduced(&self, reduced: bool) {
        self.reduced.store(reduced, Ordering::SeqCst);
    }

    pub fn is_reduced(&self) -> bool {
        self.reduced.load(Ordering::SeqCst)
    }

    /// `(total, bad)` checksummed replies since the last reset
    pub fn counters(&self) -> (u64, u64) {
        (
            self.total_messages.load(Ordering::SeqCst),
            self.bad_messages.load(Ordering::SeqCst),
        )
    }

    pub fn reset_counters(&self) {
        self.total_messages.store(0, Ordering::SeqCst);
        self.bad_messages.store(0, Ordering::SeqCst);
    }

    pub fn timing(&self) -> &TimingConfig {
        &self.timing
    }

    /// Run one request/response cycle.
    ///
    /// `timeout` bounds both the wait for the gate and the time spent reading
    /// the reply. Log lines produced during the cycle are delivered once the
    /// gate is released, so observers may call back into the link.
    pub fn exchange(&self, command: &Command, timeout: Duration) -> Result<String, ProtocolError> {
        let mut outbox = Outbox::new();
        let result = {
            let mut gate = self.gate.try_lock_for(timeout).ok_or(ProtocolError::Busy)?;
            if self.is_aborted() {
                return Err(ProtocolError::Aborted);
            }
            let channel = gate.as_mut().ok_or(ProtocolError::NotConnected)?;

            let result = self.cycle(channel.as_mut(), command, timeout, &mut outbox);
            if let Err(ProtocolError::IoError(e)) = &result {
                if !self.is_aborted() {
                    outbox.log(
                        format!("Safety Printer communication error: {e}"),
                        Severity::Error,
                    );
                    *gate = None;
                    self.open.store(false, Ordering::SeqCst);
                }
            }
            result
        };
        outbox.deliver(&self.notifier);
        result
    }

    fn cycle(
        &self,
        channel: &mut dyn LineChannel,
        command: &Command,
        timeout: Duration,
        outbox: &mut Outbox,
    ) -> Result<String, ProtocolError> {
        let wire = command.to_wire();
        let poll = self.timing.line_poll();

        channel.clear_input()?;
        outbox.log(wire.as_str(), Severity::Send);
        channel.write_frame(&wire)?;

        let deadline = Instant::now() + timeout;
        let mut lines: Vec<String> = Vec::new();
        loop {
            if !poll.is_zero() {
                std::thread::sleep(poll);
            }
            let line = channel.read_line()?;
            if line.iter().all(u8::is_ascii_whitespace) {
                break;
            }
            let text = String::from_utf8(line)
                .map_err(|e| ProtocolError::MalformedFrame(format!("undecodable reply: {e}")))?;
            lines.push(text);
            if Instant::now() >= deadline {
                tracing::warn!(command = %wire, "reply still streaming at deadline");
                break;
            }
        }

        let data = lines.join("\n");
        let data = data.trim();
        if data.is_empty() {
            outbox.log(format!("[{wire}] Received no data"), Severity::Debug);
            return Err(ProtocolError::NoData);
        }

        let payload = if command.is_checksummed() {
            self.total_messages.fetch_add(1, Ordering::SeqCst);
            match frame::verify(data) {
                Ok(payload) => payload,
                Err(e) => {
                    self.bad_messages.fetch_add(1, Ordering::SeqCst);
                    outbox.log(format!("[{wire}] {e}"), Severity::Debug);
                    return Err(e);
                }
            }
        } else {
            data.to_string()
        };
        outbox.log(payload.as_str(), Severity::Recv);

        let sent = command.id();
        let received = frame::response_id(&payload);
        if !received.eq_ignore_ascii_case(sent) {
            outbox.log(
                format!("Answer ({received}) doesn't contain command ID: {sent}"),
                Severity::Debug,
            );
            return Err(ProtocolError::IdMismatch {
                sent: sent.to_string(),
                received: received.to_string(),
            });
        }

        Ok(payload)
    }

    /// Run `command`, retrying transient failures.
    ///
    /// Attempts are spaced by the configured retry delay. When the attempt
    /// budget runs out the link is torn down. Outside of `bypass_reduced`,
    /// nothing is sent while the firmware protocol is incompatible.
    pub fn exchange_with_retry(
        &self,
        command: &Command,
        timeout: Duration,
        bypass_reduced: bool,
    ) -> Result<String, ProtocolError> {
        let wire = command.to_wire();
        if self.is_reduced() && !bypass_reduced {
            self.notifier.log(
                &format!(
                    "Serial command ({wire}) blocked due to an invalid firmware communication protocol."
                ),
                Severity::Warning,
            );
            return Err(ProtocolError::Blocked { command: wire });
        }

        let max_attempts = self.timing.max_retries.max(1);
        let mut attempt = 0;
        loop {
            if self.is_aborted() {
                return Err(ProtocolError::Aborted);
            }
            attempt += 1;
            match self.exchange(command, timeout) {
                Ok(payload) => return Ok(payload),
                Err(e) if e.is_transient() => {
                    tracing::debug!(command = %wire, attempt, error = %e, "exchange failed");
                    if attempt >= max_attempts {
                        self.notifier.log(
                            &format!("No valid answer to {wire} after {attempt} attempts. Closing connection."),
                            Severity::Error,
                        );
                        self.teardown();
                        return Err(ProtocolError::RetriesExhausted {
                            command: wire,
                            attempts: attempt,
                        });
                    }
                    self.notifier.log(
                        &format!("Serial port is busy or bad answer. Retrying command: {wire} x{attempt}"),
                        Severity::Debug,
                    );
                    std::thread::sleep(self.timing.retry_delay());
                }
                Err(e) => return Err(e),
            }
        }
    }
}
