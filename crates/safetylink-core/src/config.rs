//! Link configuration stored as JSON

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::{
    COMPATIBLE_PROTOCOLS, DEFAULT_BAUD_RATE, DEFAULT_READ_TIMEOUT_MS, HANDSHAKE_ATTEMPTS,
    HANDSHAKE_POLL_MS, HOST_RECONNECT_GRACE_MS, LINE_POLL_MS, MAX_RETRIES, RETRY_DELAY_MS,
};

/// Which serial port to use for the MCU
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PortSelection {
    /// Probe known MCU boards, skipping the printer's own port
    #[default]
    Auto,
    /// Use exactly this device
    Named(String),
}

impl Serialize for PortSelection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PortSelection::Auto => serializer.serialize_str("AUTO"),
            PortSelection::Named(port) => serializer.serialize_str(port),
        }
    }
}

impl<'de> Deserialize<'de> for PortSelection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        if value.is_empty() || value.eq_ignore_ascii_case("auto") {
            Ok(PortSelection::Auto)
        } else {
            Ok(PortSelection::Named(value))
        }
    }
}

/// Timing of the request/response cycle, retries and handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// How long a caller waits for the command gate
    pub exchange_timeout_ms: u64,
    /// Pause between reply line reads
    pub line_poll_ms: u64,
    /// Pause between retried attempts
    pub retry_delay_ms: u64,
    /// Attempts before the connection is torn down
    pub max_retries: u32,
    /// Pause between handshake reads
    pub handshake_poll_ms: u64,
    /// Reads before the handshake gives up
    pub handshake_attempts: u32,
    /// Wait before reconnecting a printer that was reset by our port open
    pub host_reconnect_grace_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            exchange_timeout_ms: 10_000,
            line_poll_ms: LINE_POLL_MS,
            retry_delay_ms: RETRY_DELAY_MS,
            max_retries: MAX_RETRIES,
            handshake_poll_ms: HANDSHAKE_POLL_MS,
            handshake_attempts: HANDSHAKE_ATTEMPTS,
            host_reconnect_grace_ms: HOST_RECONNECT_GRACE_MS,
        }
    }
}

impl TimingConfig {
    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }

    pub fn line_poll(&self) -> Duration {
        Duration::from_millis(self.line_poll_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn handshake_poll(&self) -> Duration {
        Duration::from_millis(self.handshake_poll_ms)
    }

    pub fn host_reconnect_grace(&self) -> Duration {
        Duration::from_millis(self.host_reconnect_grace_ms)
    }

    /// Everything shortened to a few milliseconds, for tests and the demo
    pub fn fast() -> Self {
        Self {
            exchange_timeout_ms: 1_000,
            line_poll_ms: 0,
            retry_delay_ms: 1,
            max_retries: MAX_RETRIES,
            handshake_poll_ms: 0,
            handshake_attempts: HANDSHAKE_ATTEMPTS,
            host_reconnect_grace_ms: 0,
        }
    }
}

/// Interlock debounce after a manual trip reset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    /// Polls to wait before re-announcing an unchanged interlock
    pub threshold: u32,
    /// Counter ceiling; the counter falls back to `threshold` past it
    pub cap: u32,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            cap: 10,
        }
    }
}

/// What gets surfaced to the operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyOptions {
    /// Mirror every log line to the terminal view
    pub show_terminal: bool,
    /// Raise popups and pushes for warnings
    pub notify_warnings: bool,
    /// Report board temperature and supply voltage warnings
    pub notify_voltage_temp: bool,
    /// Prefix push messages with an emoji
    pub use_emoji: bool,
}

impl Default for NotifyOptions {
    fn default() -> Self {
        Self {
            show_terminal: false,
            notify_warnings: true,
            notify_voltage_temp: true,
            use_emoji: true,
        }
    }
}

/// Automatic shutdown after a print
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Arm the countdown when a print finishes
    pub enabled: bool,
    /// Seconds the operator has to abort
    pub countdown_secs: u32,
    /// Switch the printer off through the MCU (`C6 off`) on expiry
    pub turn_off_printer: bool,
    /// Countdown step
    pub tick_ms: u64,
    /// How often to look for unrendered timelapses before counting down
    pub render_poll_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            countdown_secs: 30,
            turn_off_printer: true,
            tick_ms: 1000,
            render_poll_ms: 5000,
        }
    }
}

impl ShutdownConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn render_poll(&self) -> Duration {
        Duration::from_millis(self.render_poll_ms)
    }
}

/// Safety Printer link configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub serial_port: PortSelection,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    /// Status poll period
    pub poll_interval_ms: u64,
    /// Firmware protocol versions this host speaks
    pub compatible_protocols: Vec<String>,
    pub timing: TimingConfig,
    pub debounce: DebounceConfig,
    pub notify: NotifyOptions,
    pub shutdown: ShutdownConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            serial_port: PortSelection::Auto,
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            poll_interval_ms: 1000,
            compatible_protocols: COMPATIBLE_PROTOCOLS.iter().map(|v| v.to_string()).collect(),
            timing: TimingConfig::default(),
            debounce: DebounceConfig::default(),
            notify: NotifyOptions::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

impl LinkConfig {
    /// Default config file location (`<config dir>/safetylink/config.json`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("safetylink").join("config.json"))
    }

    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Load configuration, falling back to defaults when the file is missing
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        match Self::load(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            other => other,
        }
    }

    /// Save configuration as pretty JSON, creating parent directories
    pub fn save<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, content)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
