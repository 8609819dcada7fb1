//! Connection management
//!
//! Handles the connection lifecycle: port discovery, opening, the `<R6>`
//! handshake, firmware protocol negotiation and teardown.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::serial::is_host_printer_port;
use super::stream::{LineChannel, PortBackend, SerialBackend};
use super::{
    parse_firmware_info, Command, CommandExchange, FirmwareInfo, ProtocolError,
    IDENTIFICATION_MARKER,
};
use crate::config::{LinkConfig, PortSelection};
use crate::events::{Notification, Notifier, Severity};
use crate::host::{HostConnection, HostPrinter};

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// No port open
    Disconnected,
    /// Choosing candidate ports
    Discovering,
    /// Trying candidates in order
    OpeningPort,
    /// Waiting for the `<R6>` identification
    AwaitingHandshake,
    /// Querying firmware info
    NegotiatingVersion,
    /// Connected and usable
    Ready,
    /// The last connect attempt failed
    Failed,
}

/// Which commands the firmware may receive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProtocolMode {
    #[default]
    Full,
    /// Incompatible firmware protocol; only diagnostic commands are sent
    Reduced,
}

/// Snapshot of the active session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub link: LinkState,
    pub port: Option<String>,
    pub baud_rate: u32,
    pub is_open: bool,
    pub firmware: Option<FirmwareInfo>,
    pub mode: ProtocolMode,
    pub total_messages: u64,
    pub bad_messages: u64,
    /// Reason of the last failed connect
    pub failure: Option<String>,
}

struct Session {
    link: LinkState,
    port: Option<String>,
    firmware: Option<FirmwareInfo>,
    failure: Option<String>,
    /// Connected flag at the last unconditional publish
    last_connected: bool,
    settings_visible: bool,
    force_renew: bool,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            link: LinkState::Disconnected,
            port: None,
            firmware: None,
            failure: None,
            last_connected: false,
            settings_visible: false,
            force_renew: false,
        }
    }
}

/// Link to the Safety Printer MCU
pub struct Connection {
    config: LinkConfig,
    backend: Arc<dyn PortBackend>,
    host: Arc<dyn HostPrinter>,
    exchange: CommandExchange,
    notifier: Notifier,
    session: Mutex<Session>,
}

impl Connection {
    /// Create a new connection (not yet connected)
    pub fn new(
        config: LinkConfig,
        backend: Arc<dyn PortBackend>,
        host: Arc<dyn HostPrinter>,
        notifier: Notifier,
    ) -> Self {
        let exchange = CommandExchange::new(config.timing.clone(), notifier.clone());
        Self {
            config,
            backend,
            host,
            exchange,
            notifier,
            session: Mutex::new(Session::default()),
        }
    }

    /// Connection over real serial hardware
    pub fn with_serial(config: LinkConfig, host: Arc<dyn HostPrinter>, notifier: Notifier) -> Self {
        Self::new(config, Arc::new(SerialBackend), host, notifier)
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn exchange(&self) -> &CommandExchange {
        &self.exchange
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Get current lifecycle state
    pub fn state(&self) -> LinkState {
        self.session.lock().link
    }

    pub fn is_connected(&self) -> bool {
        self.exchange.is_open()
    }

    /// Firmware info of the connected board
    pub fn firmware(&self) -> Option<FirmwareInfo> {
        self.session.lock().firmware.clone()
    }

    pub fn mode(&self) -> ProtocolMode {
        if self.exchange.is_reduced() {
            ProtocolMode::Reduced
        } else {
            ProtocolMode::Full
        }
    }

    pub fn port(&self) -> Option<String> {
        self.session.lock().port.clone()
    }

    /// Snapshot of the session
    pub fn connection_state(&self) -> ConnectionState {
        let session = self.session.lock();
        let (total_messages, bad_messages) = self.exchange.counters();
        ConnectionState {
            link: session.link,
            port: session.port.clone(),
            baud_rate: self.config.baud_rate,
            is_open: self.exchange.is_open(),
            firmware: session.firmware.clone(),
            mode: self.mode(),
            total_messages,
            bad_messages,
            failure: session.failure.clone(),
        }
    }

    fn set_link(&self, link: LinkState) {
        tracing::debug!(?link, "link state");
        self.session.lock().link = link;
    }

    /// Connect to the MCU.
    ///
    /// Runs discovery, open, handshake and version negotiation. Any failure
    /// closes the port, resets the session and leaves the state `Failed`.
    pub fn connect(&self) -> Result<(), ProtocolError> {
        if self.exchange.is_open() {
            return Ok(());
        }

        self.exchange.clear_abort();
        self.exchange.set_reduced(false);
        {
            let mut session = self.session.lock();
            session.link = LinkState::Disconnected;
            session.port = None;
            session.firmware = None;
            session.failure = None;
        }
        self.notifier.log("Connecting...", Severity::Info);

        match self.establish() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    fn establish(&self) -> Result<(), ProtocolError> {
        self.set_link(LinkState::Discovering);
        let host_link = self.host.current_connection();
        let candidates = self.discover(&host_link)?;

        // Opening an Arduino resets it; on single-board setups this takes
        // the printer down as well
        let reconnect = if self.host.is_operational() {
            self.notifier.log(
                &format!(
                    "Printer is operational: port={:?}, baudrate={:?}, profile={:?}",
                    host_link.port, host_link.baud_rate, host_link.profile
                ),
                Severity::Info,
            );
            Some(host_link.clone())
        } else {
            None
        };

        self.set_link(LinkState::OpeningPort);
        let (port, mut channel) = self.open_first(&candidates, host_link.printer_port())?;

        self.set_link(LinkState::AwaitingHandshake);
        let handshake = self.handshake(channel.as_mut());
        if let Some(prior) = reconnect {
            if !self.host.is_operational() {
                self.reconnect_host(&prior);
            }
        }
        handshake?;

        self.exchange.attach(channel);
        self.session.lock().port = Some(port.clone());
        self.exchange.reset_counters();
        self.notifier
            .log("Safety Printer MCU connected.", Severity::Info);

        self.set_link(LinkState::NegotiatingVersion);
        let mut firmware = self.query_firmware()?;
        if !self.exchange.is_open() {
            return Err(ProtocolError::Aborted);
        }
        let compatible = firmware.check_compatibility(&self.config.compatible_protocols);
        let protocol = firmware.comm_protocol_version.clone();
        {
            let mut session = self.session.lock();
            session.firmware = Some(firmware);
            session.force_renew = true;
            session.link = LinkState::Ready;
        }

        if compatible {
            self.exchange.set_reduced(false);
        } else {
            self.exchange.set_reduced(true);
            self.notifier.log(
                &format!(
                    "Invalid firmware communication protocol version: {protocol}. Communication will be reduced to essentials and no configuration is allowed. It's highly recommended to update the host and/or Safety Printer MCU firmware."
                ),
                Severity::Warning,
            );
        }
        tracing::info!(port = %port, mode = ?self.mode(), "link ready");
        self.publish_status();
        Ok(())
    }

    fn discover(&self, host_link: &HostConnection) -> Result<Vec<String>, ProtocolError> {
        match &self.config.serial_port {
            PortSelection::Named(port) => {
                self.notifier
                    .log(&format!("User selected port: {port}"), Severity::Info);
                Ok(vec![port.clone()])
            }
            PortSelection::Auto => {
                if host_link.printer_port().is_none() {
                    return Err(ProtocolError::PortDiscovery(
                        "Can't connect on AUTO serial port if printer is not connected".to_string(),
                    ));
                }
                let ports = self.backend.discover();
                if ports.is_empty() {
                    return Err(ProtocolError::PortDiscovery(
                        "No serial ports found".to_string(),
                    ));
                }
                self.notifier
                    .log(&format!("Potential ports: {ports:?}"), Severity::Info);
                Ok(ports)
            }
        }
    }

    fn open_first(
        &self,
        candidates: &[String],
        printer_port: Option<&str>,
    ) -> Result<(String, Box<dyn LineChannel>), ProtocolError> {
        let mut last_error = None;
        for port in candidates {
            if is_host_printer_port(port, printer_port, |p| self.backend.resolve(p)) {
                self.notifier
                    .log(&format!("Skipping Printer Port: {port}"), Severity::Info);
                if self.config.serial_port == PortSelection::Named(port.clone()) {
                    self.notifier.log(
                        &format!("Selected port is Printer Port. Please change it in settings: {port}"),
                        Severity::Warning,
                    );
                }
                continue;
            }

            tracing::debug!(port = %port, baud = self.config.baud_rate, "opening port");
            match self
                .backend
                .open(port, self.config.baud_rate, self.config.read_timeout())
            {
                Ok(channel) => {
                    self.notifier
                        .log(&format!("Connected to: {port}"), Severity::Info);
                    return Ok((port.clone(), channel));
                }
                Err(e) => {
                    tracing::warn!(port = %port, error = %e, "open failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ProtocolError::PortDiscovery("Couldn't connect on any port".to_string())
        }))
    }

    /// Write `<R6>` and wait for the identification marker
    fn handshake(&self, channel: &mut dyn LineChannel) -> Result<(), ProtocolError> {
        let timing = &self.config.timing;
        channel.clear_input()?;
        channel.write_frame(&Command::Identify.to_wire())?;

        for attempt in 1..=timing.handshake_attempts {
            if !timing.handshake_poll().is_zero() {
                std::thread::sleep(timing.handshake_poll());
            }
            tracing::debug!(attempt, "waiting for MCU answer");
            let line = channel.read_line()?;
            if line.is_empty() {
                continue;
            }
            let text = String::from_utf8(line)
                .map_err(|e| ProtocolError::HandshakeDecode(e.to_string()))?;
            self.notifier.log(text.trim(), Severity::Info);
            if text.contains(IDENTIFICATION_MARKER) {
                return Ok(());
            }
        }

        Err(ProtocolError::HandshakeTimeout {
            attempts: timing.handshake_attempts,
        })
    }

    fn reconnect_host(&self, prior: &HostConnection) {
        self.notifier.log(
            &format!(
                "Waiting for printer boot ({}s).",
                self.config.timing.host_reconnect_grace().as_secs()
            ),
            Severity::Info,
        );
        std::thread::sleep(self.config.timing.host_reconnect_grace());
        self.notifier.log(
            &format!(
                "Reconnecting to printer: port={:?}, baudrate={:?}, profile={:?}",
                prior.port, prior.baud_rate, prior.profile
            ),
            Severity::Info,
        );
        self.host.connect(
            prior.port.as_deref(),
            prior.baud_rate,
            prior.profile.as_deref(),
        );
    }

    fn query_firmware(&self) -> Result<FirmwareInfo, ProtocolError> {
        let reply = self
            .exchange
            .exchange_with_retry(
                &Command::FirmwareInfo,
                self.config.timing.exchange_timeout(),
                true,
            )
            .and_then(|payload| parse_firmware_info(&payload).map_err(ProtocolError::from));
        reply.map_err(|e| {
            tracing::warn!(error = %e, "firmware info query failed");
            ProtocolError::NoValidResponse
        })
    }

    /// Tear down after a failed connect
    fn fail(&self, error: &ProtocolError) {
        self.exchange.teardown();
        self.exchange.set_reduced(false);
        {
            let mut session = self.session.lock();
            session.link = LinkState::Failed;
            session.port = None;
            session.firmware = None;
            session.failure = Some(error.to_string());
            session.force_renew = true;
        }
        let severity = match error {
            ProtocolError::PortDiscovery(_) => Severity::Warning,
            _ => Severity::Error,
        };
        self.notifier.log(
            &format!("Safety Printer MCU connection error: {error}"),
            severity,
        );
        self.publish_status();
    }

    /// Close the link. Idempotent.
    pub fn close(&self) {
        self.exchange.abort();
        let was_open = self.exchange.teardown();
        let was_failed = {
            let mut session = self.session.lock();
            let was_failed = session.link == LinkState::Failed;
            session.link = LinkState::Disconnected;
            session.port = None;
            session.firmware = None;
            was_failed
        };
        if was_open {
            self.notifier
                .log("Safety Printer MCU connection closed.", Severity::Info);
            self.publish_status();
        } else if !was_failed {
            self.notifier
                .log("Safety Printer MCU not connected.", Severity::Info);
        }
    }

    /// Notice a link torn down underneath us (I/O error, retries exhausted)
    fn check_link(&self) {
        if self.exchange.is_open() {
            return;
        }
        let lost = {
            let mut session = self.session.lock();
            if session.link == LinkState::Ready {
                session.link = LinkState::Disconnected;
                session.port = None;
                session.firmware = None;
                true
            } else {
                false
            }
        };
        if lost {
            self.notifier
                .log("Safety Printer MCU connection closed.", Severity::Info);
            self.publish_status();
        }
    }

    /// One exchange, no retry. Used by the status poll.
    pub fn query(&self, command: &Command) -> Result<String, ProtocolError> {
        let result = self
            .exchange
            .exchange(command, self.config.timing.exchange_timeout());
        if result.is_err() {
            self.check_link();
        }
        result
    }

    /// Exchange with retry; blocked in reduced mode unless the command is a
    /// diagnostic one.
    pub fn send(&self, command: &Command) -> Result<String, ProtocolError> {
        let result = self.exchange.exchange_with_retry(
            command,
            self.config.timing.exchange_timeout(),
            command.bypasses_reduced_mode(),
        );
        if result.is_err() {
            self.check_link();
        }
        result
    }

    /// MCU ports the UI may offer, minus the printer's own port
    pub fn candidate_ports(&self) -> Vec<String> {
        let host_link = self.host.current_connection();
        self.backend
            .discover()
            .into_iter()
            .filter(|port| {
                !is_host_printer_port(port, host_link.printer_port(), |p| self.backend.resolve(p))
            })
            .collect()
    }

    pub fn host(&self) -> &Arc<dyn HostPrinter> {
        &self.host
    }

    pub fn set_settings_visible(&self, visible: bool) {
        self.session.lock().settings_visible = visible;
    }

    /// Republish connection and firmware info on the next publish
    pub fn request_renew(&self) {
        self.session.lock().force_renew = true;
    }

    /// Publish connection status.
    ///
    /// Always sent while the settings view is open or a renew is pending
    /// (firmware info follows on renew); otherwise only when the connected
    /// flag changed since the last publish.
    pub fn publish_status(&self) {
        let connected = self.exchange.is_open();
        let (total_messages, bad_messages) = self.exchange.counters();
        let reduced = self.exchange.is_reduced();

        let mut out = Vec::with_capacity(2);
        {
            let mut session = self.session.lock();
            let update = Notification::ConnectionUpdate {
                connected,
                port: session.port.clone(),
                total_messages,
                bad_messages,
                failure: session.failure.is_some(),
                reduced,
            };
            if session.settings_visible || session.force_renew {
                out.push(update);
                session.last_connected = connected;
                if session.force_renew {
                    session.force_renew = false;
                    out.push(Notification::FirmwareInfo(
                        session.firmware.clone().unwrap_or_default(),
                    ));
                }
            } else if session.last_connected != connected {
                session.last_connected = connected;
                out.push(update);
            }
        }

        for notification in out {
            self.notifier.emit(notification);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("port", &self.port())
            .field("mode", &self.mode())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimingConfig;
    use crate::events::RecordingSink;
    use crate::host::StubHost;
    use crate::protocol::frame::wrap;
    use crate::protocol::mock::{MockBackend, MockChannel};

    fn config(port: &str) -> LinkConfig {
        LinkConfig {
            serial_port: PortSelection::Named(port.to_string()),
            timing: TimingConfig::fast(),
            ..LinkConfig::default()
        }
    }

    fn healthy_mcu() -> MockChannel {
        let mock = MockChannel::new();
        mock.on("<R6>", &[IDENTIFICATION_MARKER]);
        mock.on("<R4>", &[wrap("R4:2.1.0,Mar 02 2023,1024,5,Nano").as_str()]);
        mock
    }

    fn connection(mock: MockChannel, sink: Arc<RecordingSink>) -> Connection {
        let backend = MockBackend::new().with_port("/dev/ttyUSB1", mock);
        Connection::new(
            config("/dev/ttyUSB1"),
            Arc::new(backend),
            Arc::new(StubHost::disconnected()),
            Notifier::new(sink, Default::default()),
        )
    }

    #[test]
    fn test_connect_and_close() {
        let sink = Arc::new(RecordingSink::new());
        let conn = connection(healthy_mcu(), sink.clone());

        conn.connect().unwrap();
        assert_eq!(conn.state(), LinkState::Ready);
        assert_eq!(conn.mode(), ProtocolMode::Full);
        assert_eq!(conn.port().as_deref(), Some("/dev/ttyUSB1"));
        assert!(conn.firmware().unwrap().is_compatible);

        conn.close();
        assert_eq!(conn.state(), LinkState::Disconnected);
        assert!(!conn.is_connected());
        assert_eq!(conn.port(), None);
        assert!(conn.firmware().is_none());
        let state = conn.connection_state();
        assert!(state.port.is_none() && state.firmware.is_none());

        // Second close is a no-op
        sink.clear();
        conn.close();
        assert_eq!(
            sink.count(|n| matches!(n, Notification::ConnectionUpdate { .. })),
            0
        );
    }

    #[test]
    fn test_connect_publishes_connection_and_firmware() {
        let sink = Arc::new(RecordingSink::new());
        let conn = connection(healthy_mcu(), sink.clone());
        conn.connect().unwrap();

        let events = sink.events();
        assert!(events.iter().any(|n| matches!(
            n,
            Notification::ConnectionUpdate { connected: true, reduced: false, .. }
        )));
        assert!(events.iter().any(|n| matches!(
            n,
            Notification::FirmwareInfo(info) if info.version == "2.1.0"
        )));
    }

    #[test]
    fn test_publish_status_only_on_change_when_hidden() {
        let sink = Arc::new(RecordingSink::new());
        let conn = connection(healthy_mcu(), sink.clone());
        conn.connect().unwrap();
        sink.clear();

        conn.publish_status();
        conn.publish_status();
        assert!(sink.events().is_empty());

        conn.set_settings_visible(true);
        conn.publish_status();
        conn.publish_status();
        assert_eq!(
            sink.count(|n| matches!(n, Notification::ConnectionUpdate { .. })),
            2
        );
        assert_eq!(sink.count(|n| matches!(n, Notification::FirmwareInfo(_))), 0);

        conn.request_renew();
        conn.publish_status();
        assert_eq!(sink.count(|n| matches!(n, Notification::FirmwareInfo(_))), 1);
    }

    #[test]
    fn test_firmware_without_answer_fails() {
        let sink = Arc::new(RecordingSink::new());
        let mock = MockChannel::new();
        mock.on("<R6>", &[IDENTIFICATION_MARKER]);
        let conn = connection(mock.clone(), sink);

        assert!(matches!(conn.connect(), Err(ProtocolError::NoValidResponse)));
        assert_eq!(conn.state(), LinkState::Failed);
        assert!(!conn.is_connected());
        assert_eq!(mock.write_count("<R4>"), 10);
    }
}
