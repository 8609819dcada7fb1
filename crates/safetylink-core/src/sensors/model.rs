//! Delta computation over status replies

use super::record::{BoardWarning, BoardWarnings, SensorRecord};
use crate::config::{DebounceConfig, NotifyOptions};
use crate::events::{Notification, Outbox, Severity};
use crate::protocol::frame::crc16;
use crate::protocol::{Flag, SensorLabel, StatusReply, MAX_SENSORS};

/// What a status reply did to the model
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusOutcome {
    /// The reply was applied; these indices produced an update
    Applied { updated: Vec<usize> },
    /// The sensor count no longer matches the labels; the label cache was
    /// dropped and nothing was applied
    CountChanged { expected: usize, reported: usize },
}

/// Last known sensor and board state
#[derive(Debug, Clone)]
pub struct SensorStateModel {
    sensors: Vec<SensorRecord>,
    /// Sensor count announced by the last labels reply
    expected_count: usize,
    interlock: Flag,
    warnings: BoardWarnings,
    /// A manual trip reset is waiting for the interlock to settle
    reset_pending: bool,
    /// Polls seen since the reset
    trip_count: u32,
    force_renew: bool,
    debounce: DebounceConfig,
    notify: NotifyOptions,
}

impl SensorStateModel {
    pub fn new(debounce: DebounceConfig, notify: NotifyOptions) -> Self {
        Self {
            sensors: Vec::new(),
            expected_count: 0,
            interlock: Flag::Unknown,
            warnings: BoardWarnings::default(),
            reset_pending: false,
            trip_count: 0,
            force_renew: false,
            debounce,
            notify,
        }
    }

    pub fn sensors(&self) -> &[SensorRecord] {
        &self.sensors
    }

    pub fn sensor(&self, index: usize) -> Option<&SensorRecord> {
        self.sensors.get(index)
    }

    /// No labels cached; the next cycle must fetch them first
    pub fn needs_labels(&self) -> bool {
        self.sensors.is_empty()
    }

    pub fn interlock(&self) -> Flag {
        self.interlock
    }

    pub fn warnings(&self) -> &BoardWarnings {
        &self.warnings
    }

    pub fn is_reset_pending(&self) -> bool {
        self.reset_pending
    }

    /// Cache labels. Unknown indices get new records, known ones are
    /// overwritten with their volatile fields reset. Labels whose index lies
    /// outside the reported set are dropped.
    pub fn apply_labels(&mut self, labels: &[SensorLabel]) {
        self.expected_count = labels.len();
        for label in labels {
            if label.index >= labels.len() || label.index >= MAX_SENSORS {
                tracing::warn!(
                    index = label.index,
                    count = labels.len(),
                    "label index out of range"
                );
                continue;
            }
            match self.sensors.get_mut(label.index) {
                Some(record) => record.apply_label(label),
                None => {
                    while self.sensors.len() < label.index {
                        let index = self.sensors.len();
                        self.sensors.push(SensorRecord::empty(index));
                    }
                    self.sensors.push(SensorRecord::from(label));
                }
            }
        }
        tracing::debug!(count = self.expected_count, "sensor labels cached");
    }

    /// Apply a status reply, queueing whatever changed into `outbox`
    pub fn apply_status(&mut self, reply: &StatusReply, outbox: &mut Outbox) -> StatusOutcome {
        let reported = reply.sensors.len();
        if reported != self.expected_count {
            tracing::info!(
                expected = self.expected_count,
                reported,
                "sensor count changed, dropping labels"
            );
            let expected = self.expected_count;
            self.clear_labels();
            return StatusOutcome::CountChanged { expected, reported };
        }

        self.apply_interlock(reply.interlock, outbox);
        self.apply_warning(BoardWarning::Memory, reply.memory_warning, outbox);
        self.apply_warning(BoardWarning::ExecTime, reply.exec_time_warning, outbox);
        self.apply_warning(BoardWarning::Temperature, reply.temperature_warning, outbox);
        self.apply_warning(BoardWarning::Voltage, reply.voltage_warning, outbox);

        let force = self.force_renew;
        let mut updated = Vec::new();
        for (index, status) in &reply.sensors {
            let Some(record) = self.sensors.get_mut(*index) else {
                tracing::debug!(index, "status for unknown sensor");
                continue;
            };

            let before = crc16(record.status.fingerprint().as_bytes());
            record.status = status.clone();
            let after = crc16(record.status.fingerprint().as_bytes());
            if before == after && !force {
                continue;
            }

            updated.push(*index);
            outbox.emit(Notification::StatusUpdate {
                index: *index,
                total_sensors: reported,
                sensor: record.clone(),
            });

            match record.status.active {
                Flag::True if !record.alarm_notified => {
                    record.alarm_notified = true;
                    let enabled = record.status.enabled.is_true();
                    if enabled {
                        outbox.log(
                            format!(
                                "New Alarm detected: {} ({})",
                                record.label, record.status.actual_value
                            ),
                            Severity::Alarm,
                        );
                    } else {
                        outbox.log(
                            format!(
                                "New Alarm detected (disabled sensor): {} ({})",
                                record.label, record.status.actual_value
                            ),
                            Severity::Info,
                        );
                    }
                    outbox.emit(Notification::Alarm {
                        index: *index,
                        label: record.label.clone(),
                        value: record.status.actual_value.clone(),
                        enabled,
                    });
                }
                Flag::False => record.alarm_notified = false,
                _ => {}
            }
        }

        self.force_renew = false;
        StatusOutcome::Applied { updated }
    }

    fn apply_interlock(&mut self, value: Flag, outbox: &mut Outbox) {
        let previous = self.interlock;
        self.interlock = value;

        if self.reset_pending {
            self.trip_count += 1;
        }
        if self.trip_count > self.debounce.cap {
            self.trip_count = self.debounce.threshold;
        }

        if value != previous || self.force_renew || self.trip_count > self.debounce.threshold {
            self.reset_pending = false;
            self.trip_count = 0;
            if value.is_true() {
                outbox.log("New INTERLOCK detected.", Severity::Trip);
            }
            outbox.emit(Notification::InterlockUpdate { status: value });
        }
    }

    fn apply_warning(&mut self, warning: BoardWarning, value: Flag, outbox: &mut Outbox) {
        let previous = self.warnings.get(warning);
        self.warnings.set(warning, value);
        if (value == previous && !self.force_renew) || !value.is_true() {
            return;
        }
        if !warning.is_environmental() || self.notify.notify_voltage_temp {
            outbox.log(warning.message(), Severity::Warning);
        }
        outbox.emit(Notification::BoardWarning { warning });
    }

    /// Arm the interlock debounce after a manual trip reset
    pub fn reset_trip(&mut self) {
        self.reset_pending = true;
        self.trip_count = 0;
    }

    /// Resend every state on the next status reply
    pub fn request_renew(&mut self) {
        self.force_renew = true;
    }

    fn clear_labels(&mut self) {
        self.sensors.clear();
        self.expected_count = 0;
    }

    /// Forget everything, as after a teardown
    pub fn clear(&mut self) {
        self.clear_labels();
        self.interlock = Flag::Unknown;
        self.warnings = BoardWarnings::default();
        self.reset_pending = false;
        self.trip_count = 0;
        self.force_renew = false;
    }
}

impl Default for SensorStateModel {
    fn default() -> Self {
        Self::new(DebounceConfig::default(), NotifyOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Outgoing;
    use crate::protocol::{parse_labels, parse_status};
    use pretty_assertions::assert_eq;

    const LABELS: &str = "R2:#0,Hotend,1,F,0,300,#1,Door,2,F,0,1,";

    fn model() -> SensorStateModel {
        let mut model = SensorStateModel::default();
        model.apply_labels(&parse_labels(LABELS).unwrap());
        model
    }

    fn status(interlock: &str, active: &str, value: &str) -> StatusReply {
        parse_status(&format!(
            "R1:{interlock},F,F,F,F,#0,T,{active},{value},280,5,F,#1,T,F,0,1,0,F,"
        ))
        .unwrap()
    }

    fn apply(model: &mut SensorStateModel, reply: &StatusReply) -> (StatusOutcome, Outbox) {
        let mut outbox = Outbox::new();
        let outcome = model.apply_status(reply, &mut outbox);
        (outcome, outbox)
    }

    fn interlock_updates(outbox: &Outbox) -> usize {
        outbox
            .notifications()
            .filter(|n| matches!(n, Notification::InterlockUpdate { .. }))
            .count()
    }

    #[test]
    fn test_labels_create_records() {
        let model = model();
        assert_eq!(model.sensors().len(), 2);
        assert_eq!(model.sensor(1).unwrap().label, "Door");
        assert_eq!(model.sensor(1).unwrap().status.trigger, Flag::False);
    }

    #[test]
    fn test_first_status_updates_everything() {
        let mut model = model();
        let (outcome, outbox) = apply(&mut model, &status("F", "F", "25"));
        assert_eq!(
            outcome,
            StatusOutcome::Applied {
                updated: vec![0, 1]
            }
        );
        assert_eq!(interlock_updates(&outbox), 1);
        assert_eq!(model.interlock(), Flag::False);
    }

    #[test]
    fn test_identical_status_is_suppressed() {
        let mut model = model();
        apply(&mut model, &status("F", "F", "25"));
        let (outcome, outbox) = apply(&mut model, &status("F", "F", "25"));
        assert_eq!(outcome, StatusOutcome::Applied { updated: vec![] });
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_single_field_change_updates_one_sensor() {
        let mut model = model();
        apply(&mut model, &status("F", "F", "25"));
        let (outcome, outbox) = apply(&mut model, &status("F", "F", "26"));
        assert_eq!(outcome, StatusOutcome::Applied { updated: vec![0] });
        let updates: Vec<_> = outbox
            .notifications()
            .filter_map(|n| match n {
                Notification::StatusUpdate { index, sensor, .. } => {
                    Some((*index, sensor.status.actual_value.clone()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(updates, vec![(0, "26".to_string())]);
    }

    #[test]
    fn test_force_renew_resends_everything_once() {
        let mut model = model();
        apply(&mut model, &status("F", "F", "25"));
        model.request_renew();
        let (outcome, outbox) = apply(&mut model, &status("F", "F", "25"));
        assert_eq!(
            outcome,
            StatusOutcome::Applied {
                updated: vec![0, 1]
            }
        );
        assert_eq!(interlock_updates(&outbox), 1);

        let (outcome, _) = apply(&mut model, &status("F", "F", "25"));
        assert_eq!(outcome, StatusOutcome::Applied { updated: vec![] });
    }

    #[test]
    fn test_alarm_edges() {
        let mut model = model();
        let mut alarms = Vec::new();
        for (poll, active) in ["F", "T", "T", "F", "T"].iter().enumerate() {
            let (_, outbox) = apply(&mut model, &status("F", active, "25"));
            if outbox
                .notifications()
                .any(|n| matches!(n, Notification::Alarm { index: 0, .. }))
            {
                alarms.push(poll + 1);
            }
        }
        assert_eq!(alarms, vec![2, 5]);
    }

    #[test]
    fn test_alarm_on_disabled_sensor_logs_info() {
        let mut model = model();
        let reply = parse_status("R1:F,F,F,F,F,#0,F,T,310,280,5,F,#1,T,F,0,1,0,F,").unwrap();
        let (_, outbox) = apply(&mut model, &reply);
        assert!(outbox.items().iter().any(|item| matches!(
            item,
            Outgoing::Log { severity: Severity::Info, message }
                if message.starts_with("New Alarm detected (disabled sensor)")
        )));
        assert!(outbox.notifications().any(|n| matches!(
            n,
            Notification::Alarm { enabled: false, .. }
        )));
    }

    #[test]
    fn test_interlock_trip_is_logged() {
        let mut model = model();
        apply(&mut model, &status("F", "F", "25"));
        let (_, outbox) = apply(&mut model, &status("T", "F", "25"));
        assert!(outbox.items().contains(&Outgoing::Log {
            message: "New INTERLOCK detected.".to_string(),
            severity: Severity::Trip,
        }));
    }

    #[test]
    fn test_interlock_debounce_after_reset() {
        let mut model = model();
        apply(&mut model, &status("T", "F", "25"));
        model.reset_trip();

        for _ in 0..5 {
            let (_, outbox) = apply(&mut model, &status("T", "F", "25"));
            assert_eq!(interlock_updates(&outbox), 0);
        }
        let (_, outbox) = apply(&mut model, &status("T", "F", "25"));
        assert_eq!(interlock_updates(&outbox), 1);
        assert!(!model.is_reset_pending());

        // Debounce is over; unchanged values stay quiet again
        let (_, outbox) = apply(&mut model, &status("T", "F", "25"));
        assert_eq!(interlock_updates(&outbox), 0);
    }

    #[test]
    fn test_interlock_change_ends_debounce_early() {
        let mut model = model();
        apply(&mut model, &status("T", "F", "25"));
        model.reset_trip();
        let (_, outbox) = apply(&mut model, &status("F", "F", "25"));
        assert_eq!(interlock_updates(&outbox), 1);
        assert!(!model.is_reset_pending());
    }

    #[test]
    fn test_board_warning_edges() {
        let mut model = model();
        let warn = |mem: &str| {
            parse_status(&format!(
                "R1:F,{mem},F,F,F,#0,T,F,25,280,5,F,#1,T,F,0,1,0,F,"
            ))
            .unwrap()
        };
        let count = |outbox: &Outbox| {
            outbox
                .notifications()
                .filter(|n| matches!(n, Notification::BoardWarning { .. }))
                .count()
        };

        let (_, outbox) = apply(&mut model, &warn("T"));
        assert_eq!(count(&outbox), 1);
        let (_, outbox) = apply(&mut model, &warn("T"));
        assert_eq!(count(&outbox), 0);
        let (_, outbox) = apply(&mut model, &warn("F"));
        assert_eq!(count(&outbox), 0);
        let (_, outbox) = apply(&mut model, &warn("T"));
        assert_eq!(count(&outbox), 1);
        assert_eq!(model.warnings().active(), vec![BoardWarning::Memory]);
    }

    #[test]
    fn test_voltage_warning_log_is_gated() {
        let mut model = SensorStateModel::new(
            DebounceConfig::default(),
            NotifyOptions {
                notify_voltage_temp: false,
                ..NotifyOptions::default()
            },
        );
        model.apply_labels(&parse_labels(LABELS).unwrap());
        let reply = parse_status("R1:F,F,F,F,T,#0,T,F,25,280,5,F,#1,T,F,0,1,0,F,").unwrap();
        let (_, outbox) = apply(&mut model, &reply);

        assert!(outbox.notifications().any(|n| matches!(
            n,
            Notification::BoardWarning {
                warning: BoardWarning::Voltage
            }
        )));
        assert!(!outbox.items().iter().any(|item| matches!(
            item,
            Outgoing::Log {
                severity: Severity::Warning,
                ..
            }
        )));
    }

    #[test]
    fn test_sensor_count_change_drops_labels() {
        let mut model = model();
        let reply = parse_status("R1:F,F,F,F,F,#0,T,F,25,280,5,F,").unwrap();
        let (outcome, outbox) = apply(&mut model, &reply);
        assert_eq!(
            outcome,
            StatusOutcome::CountChanged {
                expected: 2,
                reported: 1
            }
        );
        assert!(outbox.is_empty());
        assert!(model.needs_labels());
    }

    fn label(index: usize, name: &str) -> SensorLabel {
        SensorLabel {
            index,
            label: name.to_string(),
            sensor_type: "1".to_string(),
            force_disable: "F".to_string(),
            low_setpoint: "0".to_string(),
            high_setpoint: "1".to_string(),
        }
    }

    #[test]
    fn test_sparse_label_indices() {
        let mut model = SensorStateModel::default();
        model.apply_labels(&[label(1, "Door"), label(1, "Lid")]);
        assert_eq!(model.sensors().len(), 2);
        assert_eq!(model.sensor(0).unwrap().index, 0);
        assert_eq!(model.sensor(1).unwrap().label, "Lid");
    }

    #[test]
    fn test_out_of_range_label_is_dropped() {
        let mut model = SensorStateModel::default();
        model.apply_labels(&[label(0, "Hotend"), label(2_000_000, "Bogus")]);
        assert_eq!(model.sensors().len(), 1);
        assert_eq!(model.sensor(0).unwrap().label, "Hotend");
    }
}
