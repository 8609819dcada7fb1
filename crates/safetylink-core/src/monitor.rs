//! Safety monitor facade
//!
//! Ties the connection lifecycle to the sensor state model and exposes the
//! operations a host UI or API handler needs: connect, poll, and the MCU
//! control commands.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::config::LinkConfig;
use crate::events::{Notification, Notifier, Outbox, Severity};
use crate::host::HostPrinter;
use crate::protocol::{
    parse_labels, parse_mcu_stats, parse_status, Command, Connection, McuStats, PortBackend,
    ProtocolError, SerialBackend,
};
use crate::sensors::{BoardWarnings, SensorRecord, SensorStateModel, StatusOutcome};

/// The engine behind one Safety Printer MCU
pub struct SafetyMonitor {
    connection: Connection,
    model: Mutex<SensorStateModel>,
}

impl SafetyMonitor {
    pub fn new(
        config: LinkConfig,
        backend: Arc<dyn PortBackend>,
        host: Arc<dyn HostPrinter>,
        notifier: Notifier,
    ) -> Self {
        let model = SensorStateModel::new(config.debounce, config.notify.clone());
        Self {
            connection: Connection::new(config, backend, host, notifier),
            model: Mutex::new(model),
        }
    }

    /// Monitor talking to real serial hardware
    pub fn with_serial(config: LinkConfig, host: Arc<dyn HostPrinter>, notifier: Notifier) -> Self {
        Self::new(config, Arc::new(SerialBackend), host, notifier)
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    fn notifier(&self) -> &Notifier {
        self.connection.notifier()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Connect and cache the sensor labels
    pub fn connect(&self) -> Result<(), ProtocolError> {
        self.model.lock().clear();
        self.connection.connect()?;
        if let Err(e) = self.refresh_labels() {
            tracing::debug!(error = %e, "initial label fetch failed, retrying on next poll");
        }
        Ok(())
    }

    /// Close the link and forget all sensor state
    pub fn disconnect(&self) {
        self.connection.close();
        self.model.lock().clear();
    }

    /// Sensor state is only valid while the link is up
    fn forget_if_lost(&self) {
        if !self.connection.is_connected() {
            self.model.lock().clear();
        }
    }

    fn query(&self, command: &Command) -> Result<String, ProtocolError> {
        self.connection.query(command).map_err(|e| {
            self.forget_if_lost();
            e
        })
    }

    fn send(&self, command: &Command) -> Result<String, ProtocolError> {
        self.connection.send(command).map_err(|e| {
            self.forget_if_lost();
            e
        })
    }

    /// Fetch and cache the sensor labels (`R2`)
    pub fn refresh_labels(&self) -> Result<usize, ProtocolError> {
        let payload = self.query(&Command::Labels)?;
        let labels = parse_labels(&payload)?;
        self.model.lock().apply_labels(&labels);
        Ok(labels.len())
    }

    /// Fetch the status (`R1`) and publish what changed
    pub fn refresh_status(&self) -> Result<StatusOutcome, ProtocolError> {
        let payload = self.query(&Command::Status)?;
        let reply = parse_status(&payload)?;

        let mut outbox = Outbox::new();
        let outcome = self.model.lock().apply_status(&reply, &mut outbox);
        outbox.deliver(self.notifier());
        Ok(outcome)
    }

    /// One poll cycle: labels when none are cached, then status
    pub fn update_status(&self) -> Result<StatusOutcome, ProtocolError> {
        if !self.connection.is_connected() {
            self.forget_if_lost();
            self.connection.publish_status();
            return Err(ProtocolError::NotConnected);
        }
        if self.model.lock().needs_labels() {
            self.refresh_labels()?;
        }
        self.refresh_status()
    }

    /// Fetch board statistics (`R5`) and publish them
    pub fn refresh_mcu_stats(&self) -> Result<McuStats, ProtocolError> {
        let payload = self.send(&Command::McuStats)?;
        let stats = parse_mcu_stats(&payload)?;
        self.notifier().emit(Notification::McuInfo(stats.clone()));
        Ok(stats)
    }

    pub fn publish_status(&self) {
        self.connection.publish_status();
    }

    fn control(&self, command: Command) -> Result<String, ProtocolError> {
        if !self.connection.is_connected() {
            return Err(ProtocolError::NotConnected);
        }
        self.send(&command)
    }

    /// Reset all trips (`C1`) and debounce the interlock while it settles
    pub fn reset_trip(&self) -> Result<String, ProtocolError> {
        if !self.connection.is_connected() {
            return Err(ProtocolError::NotConnected);
        }
        self.model.lock().reset_trip();
        self.send(&Command::ResetTrips)
    }

    /// Virtual emergency button (`C2`)
    pub fn send_trip(&self) -> Result<String, ProtocolError> {
        self.control(Command::ManualTrip)
    }

    pub fn toggle_enabled(&self, index: usize, enabled: bool) -> Result<String, ProtocolError> {
        self.control(Command::SetSensorEnabled { index, enabled })
    }

    pub fn change_setpoint(&self, index: usize, setpoint: &str) -> Result<String, ProtocolError> {
        self.control(Command::ChangeSetpoint {
            index,
            setpoint: setpoint.to_string(),
        })
    }

    pub fn change_timer(&self, index: usize, timer: &str) -> Result<String, ProtocolError> {
        self.control(Command::ChangeTimer {
            index,
            timer: timer.to_string(),
        })
    }

    pub fn restore_defaults(&self, index: usize) -> Result<String, ProtocolError> {
        self.control(Command::RestoreDefaults { index })
    }

    /// Persist the MCU configuration to EEPROM (`C5`)
    pub fn save_config(&self) -> Result<String, ProtocolError> {
        self.control(Command::SaveConfig)
    }

    /// Switch the printer off through the MCU (`C6 off`)
    pub fn power_off(&self) -> Result<String, ProtocolError> {
        self.control(Command::PowerOff)
    }

    /// Send an operator-typed command such as `<C4 1 60>`
    pub fn send_raw(&self, text: &str) -> Result<String, ProtocolError> {
        let command = Command::parse(text).map_err(|e| {
            self.notifier().log(
                &format!("'{}' is not a valid command.", text.trim()),
                Severity::Warning,
            );
            e
        })?;
        self.control(command)
    }

    /// Put the MCU in programming mode and release the port for an
    /// external flashing tool
    pub fn prepare_for_flash(&self) -> Result<(), ProtocolError> {
        if self.connection.host().is_printing() {
            return Err(ProtocolError::FlashTool(
                "printer is busy printing".to_string(),
            ));
        }
        if self.connection.is_connected() {
            self.connection.send(&Command::PrepareReprogram)?;
        }
        self.disconnect();
        Ok(())
    }

    /// Publish one `SerialPort` notification per usable MCU port
    pub fn list_ports(&self) -> Vec<String> {
        let ports = self.connection.candidate_ports();
        for port in &ports {
            self.notifier()
                .emit(Notification::SerialPort { port: port.clone() });
        }
        ports
    }

    /// Resend every sensor, interlock, warning and connection state
    pub fn force_renew(&self) {
        self.model.lock().request_renew();
        self.connection.request_renew();
    }

    pub fn set_settings_visible(&self, visible: bool) {
        self.connection.set_settings_visible(visible);
    }

    pub fn sensors(&self) -> Vec<SensorRecord> {
        self.model.lock().sensors().to_vec()
    }

    pub fn interlock(&self) -> crate::protocol::Flag {
        self.model.lock().interlock()
    }

    pub fn warnings(&self) -> BoardWarnings {
        *self.model.lock().warnings()
    }
}

impl std::fmt::Debug for SafetyMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafetyMonitor")
            .field("connection", &self.connection)
            .field("sensors", &self.model.lock().sensors().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PortSelection, TimingConfig};
    use crate::events::RecordingSink;
    use crate::host::StubHost;
    use crate::protocol::frame::wrap;
    use crate::protocol::mock::{MockBackend, MockChannel};
    use crate::protocol::IDENTIFICATION_MARKER;

    fn monitor(mock: &MockChannel, host: Arc<StubHost>) -> (SafetyMonitor, Arc<RecordingSink>) {
        mock.on("<R6>", &[IDENTIFICATION_MARKER]);
        mock.on("<R4>", &[wrap("R4:2.1.0,Mar 02 2023,1024,5,Nano").as_str()]);
        mock.on("<R2>", &[wrap("R2:#0,Hotend,1,F,0,300,").as_str()]);
        mock.on("<R1>", &[wrap("R1:F,F,F,F,F,#0,T,F,25.0,280,5,F,").as_str()]);

        let sink = Arc::new(RecordingSink::new());
        let config = LinkConfig {
            serial_port: PortSelection::Named("/dev/ttyACM0".to_string()),
            timing: TimingConfig::fast(),
            ..LinkConfig::default()
        };
        let backend = MockBackend::new().with_port("/dev/ttyACM0", mock.clone());
        let monitor = SafetyMonitor::new(
            config,
            Arc::new(backend),
            host,
            Notifier::new(sink.clone(), Default::default()),
        );
        (monitor, sink)
    }

    #[test]
    fn test_connect_caches_labels() {
        let mock = MockChannel::new();
        let (monitor, _) = monitor(&mock, Arc::new(StubHost::disconnected()));
        monitor.connect().unwrap();
        assert_eq!(monitor.sensors().len(), 1);
        assert_eq!(monitor.sensors()[0].label, "Hotend");
    }

    #[test]
    fn test_update_status_publishes_sensor() {
        let mock = MockChannel::new();
        let (monitor, sink) = monitor(&mock, Arc::new(StubHost::disconnected()));
        monitor.connect().unwrap();
        sink.clear();

        let outcome = monitor.update_status().unwrap();
        assert_eq!(outcome, StatusOutcome::Applied { updated: vec![0] });
        assert_eq!(
            sink.count(|n| matches!(n, Notification::StatusUpdate { index: 0, .. })),
            1
        );
    }

    #[test]
    fn test_control_commands_on_the_wire() {
        let mock = MockChannel::new();
        mock.on("<C3 0 off>", &["C3: ok"]);
        mock.on("<C4 0 250>", &["C4: ok"]);
        mock.on("<C7 0 10>", &["C7: ok"]);
        mock.on("<C1>", &["C1: ok"]);
        let (monitor, _) = monitor(&mock, Arc::new(StubHost::disconnected()));
        monitor.connect().unwrap();

        monitor.toggle_enabled(0, false).unwrap();
        monitor.change_setpoint(0, "250").unwrap();
        monitor.change_timer(0, "10").unwrap();
        monitor.reset_trip().unwrap();
        assert_eq!(mock.write_count("<C3 0 off>"), 1);
        assert_eq!(mock.write_count("<C4 0 250>"), 1);
        assert_eq!(mock.write_count("<C7 0 10>"), 1);
        assert_eq!(mock.write_count("<C1>"), 1);
    }

    #[test]
    fn test_send_raw_rejects_bad_shape() {
        let mock = MockChannel::new();
        let (monitor, sink) = monitor(&mock, Arc::new(StubHost::disconnected()));
        monitor.connect().unwrap();
        mock.clear_writes();

        assert!(matches!(
            monitor.send_raw("C5"),
            Err(ProtocolError::InvalidCommand(_))
        ));
        assert!(mock.writes().is_empty());
        assert_eq!(sink.count(|n| matches!(n, Notification::Warning { .. })), 1);
    }

    #[test]
    fn test_commands_require_connection() {
        let mock = MockChannel::new();
        let (monitor, _) = monitor(&mock, Arc::new(StubHost::disconnected()));
        assert!(matches!(
            monitor.save_config(),
            Err(ProtocolError::NotConnected)
        ));
        assert!(matches!(
            monitor.update_status(),
            Err(ProtocolError::NotConnected)
        ));
    }

    #[test]
    fn test_mcu_stats_published() {
        let mock = MockChannel::new();
        mock.on("<R5>", &[wrap("R5:812,41.5,5.02,12,4").as_str()]);
        let (monitor, sink) = monitor(&mock, Arc::new(StubHost::disconnected()));
        monitor.connect().unwrap();

        let stats = monitor.refresh_mcu_stats().unwrap();
        assert_eq!(stats.voltage, "5.02");
        assert_eq!(sink.count(|n| matches!(n, Notification::McuInfo(_))), 1);
    }

    #[test]
    fn test_prepare_for_flash_releases_port() {
        let mock = MockChannel::new();
        mock.on("<C9 0>", &["C9: ready"]);
        let (monitor, _) = monitor(&mock, Arc::new(StubHost::disconnected()));
        monitor.connect().unwrap();

        monitor.prepare_for_flash().unwrap();
        assert_eq!(mock.write_count("<C9 0>"), 1);
        assert!(!monitor.is_connected());
        assert!(monitor.sensors().is_empty());
    }

    #[test]
    fn test_prepare_for_flash_refused_while_printing() {
        let mock = MockChannel::new();
        let host = Arc::new(StubHost::connected("/dev/ttyUSB0", 115200));
        host.set_printing(true);
        let (monitor, _) = monitor(&mock, host);
        assert!(matches!(
            monitor.prepare_for_flash(),
            Err(ProtocolError::FlashTool(_))
        ));
    }
}
