//! Notifications for the UI layer.
//!
//! The engine never talks to a UI directly. Observers implement
//! [`NotificationSink`] and receive discrete [`Notification`]s; an optional
//! [`PushNotifier`] receives short free-text messages for trips, alarms,
//! warnings and errors.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::config::NotifyOptions;
use crate::protocol::{FirmwareInfo, Flag, McuStats};
use crate::sensors::{BoardWarning, SensorRecord};

/// Severity of an operator-facing log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Debug,
    /// Frame written to the MCU
    Send,
    /// Frame received from the MCU
    Recv,
    Info,
    Warning,
    Error,
    Critical,
    /// Interlock trip
    Trip,
    /// Sensor alarm
    Alarm,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Debug => "DEBUG",
            Severity::Send => "SEND",
            Severity::Recv => "RECV",
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
            Severity::Trip => "TRIP",
            Severity::Alarm => "ALARM",
        };
        f.write_str(name)
    }
}

/// Messages published to the UI layer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Notification {
    /// Connection status and link counters
    #[serde(rename_all = "camelCase")]
    ConnectionUpdate {
        connected: bool,
        port: Option<String>,
        total_messages: u64,
        bad_messages: u64,
        failure: bool,
        reduced: bool,
    },
    /// Firmware identification of the connected board
    FirmwareInfo(FirmwareInfo),
    /// One sensor changed (or a renew was forced)
    #[serde(rename_all = "camelCase")]
    StatusUpdate {
        index: usize,
        total_sensors: usize,
        sensor: SensorRecord,
    },
    /// Interlock state published after a change or once debounce expires
    InterlockUpdate { status: Flag },
    /// A sensor went active
    Alarm {
        index: usize,
        label: String,
        value: String,
        enabled: bool,
    },
    /// A board warning was raised
    BoardWarning { warning: BoardWarning },
    /// Board statistics
    McuInfo(McuStats),
    /// A candidate MCU port for the port picker
    SerialPort { port: String },
    /// Raw log line for the terminal view
    Terminal {
        line: String,
        severity: Severity,
        timestamp: DateTime<Utc>,
    },
    /// Automatic shutdown state; `remaining` is set while counting down
    Shutdown {
        enabled: bool,
        remaining: Option<u32>,
    },
    /// Warning popup
    Warning { message: String },
    /// Error popup
    Error { message: String },
}

/// Observer receiving notifications.
///
/// Implement this in the UI layer.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: &Notification);
}

/// Best-effort mobile push delivery
pub trait PushNotifier: Send + Sync {
    fn push(&self, message: &str);
}

/// Sink that discards everything
pub struct NullSink;

impl NotificationSink for NullSink {
    fn notify(&self, _notification: &Notification) {}
}

/// Sink that keeps every notification, for tests and replay
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Notification> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Number of recorded notifications matching `predicate`
    pub fn count(&self, predicate: impl Fn(&Notification) -> bool) -> usize {
        self.events.lock().iter().filter(|n| predicate(n)).count()
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, notification: &Notification) {
        self.events.lock().push(notification.clone());
    }
}

/// Push notifier that keeps messages, for tests
#[derive(Default)]
pub struct RecordingPush {
    messages: Mutex<Vec<String>>,
}

impl RecordingPush {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }
}

impl PushNotifier for RecordingPush {
    fn push(&self, message: &str) {
        self.messages.lock().push(message.to_string());
    }
}

/// Fan-out point for notifications and log lines
#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
    push: Option<Arc<dyn PushNotifier>>,
    options: NotifyOptions,
}

impl Notifier {
    pub fn new(sink: Arc<dyn NotificationSink>, options: NotifyOptions) -> Self {
        Self {
            sink,
            push: None,
            options,
        }
    }

    /// Notifier that drops everything except `tracing` output
    pub fn silent() -> Self {
        Self::new(Arc::new(NullSink), NotifyOptions::default())
    }

    pub fn with_push(mut self, push: Arc<dyn PushNotifier>) -> Self {
        self.push = Some(push);
        self
    }

    pub fn options(&self) -> &NotifyOptions {
        &self.options
    }

    /// Publish a structured notification
    pub fn emit(&self, notification: Notification) {
        self.sink.notify(&notification);
    }

    /// Log an operator-facing line.
    ///
    /// The line always goes to `tracing`. Depending on severity and options
    /// it is also mirrored to the terminal view, raised as a popup and
    /// pushed to the phone.
    pub fn log(&self, message: &str, severity: Severity) {
        if self.options.show_terminal {
            self.emit(Notification::Terminal {
                line: message.to_string(),
                severity,
                timestamp: Utc::now(),
            });
        }

        match severity {
            Severity::Debug | Severity::Send | Severity::Recv => {
                tracing::debug!(%severity, "{}", message);
            }
            Severity::Info => tracing::info!("{}", message),
            Severity::Trip => {
                tracing::info!("{}", message);
                self.push_message("\u{1F6D1}", &format!("SafetyPrinter {message}"));
            }
            Severity::Alarm => {
                tracing::info!("{}", message);
                self.push_message("\u{1F514}", &format!("SafetyPrinter {message}"));
            }
            Severity::Warning => {
                tracing::warn!("{}", message);
                if self.options.notify_warnings {
                    let popup = format!("WARNING: {message}");
                    self.emit(Notification::Warning {
                        message: popup.clone(),
                    });
                    self.push_message("\u{26A0}", &format!("SafetyPrinter {popup}"));
                }
            }
            Severity::Error => {
                tracing::error!("{}", message);
                let popup = format!("ERROR: {message}");
                self.emit(Notification::Error {
                    message: popup.clone(),
                });
                self.push_message("\u{26A0}", &format!("SafetyPrinter {popup}"));
            }
            Severity::Critical => {
                tracing::error!(critical = true, "{}", message);
                let popup = format!("CRITICAL ERROR: {message}");
                self.emit(Notification::Error {
                    message: popup.clone(),
                });
                self.push_message("\u{26A0}", &popup);
            }
        }
    }

    fn push_message(&self, emoji: &str, text: &str) {
        let Some(push) = &self.push else {
            return;
        };
        if self.options.use_emoji {
            push.push(&format!("{emoji} {text}"));
        } else {
            push.push(text);
        }
    }
}

/// An item queued in an [`Outbox`]
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Notify(Notification),
    Log { message: String, severity: Severity },
}

/// Notifications produced while state is locked, delivered once the lock
/// is released so observers may call back into the engine.
#[derive(Debug, Default)]
pub struct Outbox {
    items: Vec<Outgoing>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, notification: Notification) {
        self.items.push(Outgoing::Notify(notification));
    }

    pub fn log(&mut self, message: impl Into<String>, severity: Severity) {
        self.items.push(Outgoing::Log {
            message: message.into(),
            severity,
        });
    }

    pub fn items(&self) -> &[Outgoing] {
        &self.items
    }

    /// Queued notifications, without log lines
    pub fn notifications(&self) -> impl Iterator<Item = &Notification> {
        self.items.iter().filter_map(|item| match item {
            Outgoing::Notify(n) => Some(n),
            Outgoing::Log { .. } => None,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Hand everything to `notifier`, in order
    pub fn deliver(self, notifier: &Notifier) {
        for item in self.items {
            match item {
                Outgoing::Notify(n) => notifier.emit(n),
                Outgoing::Log { message, severity } => notifier.log(&message, severity),
            }
        }
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("push", &self.push.is_some())
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notifier(options: NotifyOptions) -> (Notifier, Arc<RecordingSink>, Arc<RecordingPush>) {
        let sink = Arc::new(RecordingSink::new());
        let push = Arc::new(RecordingPush::default());
        let notifier = Notifier::new(sink.clone(), options).with_push(push.clone());
        (notifier, sink, push)
    }

    #[test]
    fn test_terminal_mirroring_follows_option() {
        let (quiet, sink, _) = notifier(NotifyOptions::default());
        quiet.log("hello", Severity::Info);
        assert!(sink.events().is_empty());

        let (chatty, sink, _) = notifier(NotifyOptions {
            show_terminal: true,
            ..NotifyOptions::default()
        });
        chatty.log("hello", Severity::Info);
        assert!(matches!(
            &sink.events()[0],
            Notification::Terminal { line, severity: Severity::Info, .. } if line == "hello"
        ));
    }

    #[test]
    fn test_trip_is_pushed_with_emoji() {
        let (n, _, push) = notifier(NotifyOptions::default());
        n.log("New INTERLOCK detected.", Severity::Trip);
        assert_eq!(
            push.messages(),
            vec!["\u{1F6D1} SafetyPrinter New INTERLOCK detected.".to_string()]
        );
    }

    #[test]
    fn test_warnings_respect_notify_option() {
        let (n, sink, push) = notifier(NotifyOptions {
            notify_warnings: false,
            ..NotifyOptions::default()
        });
        n.log("low memory", Severity::Warning);
        assert!(sink.events().is_empty());
        assert!(push.messages().is_empty());

        let (n, sink, push) = notifier(NotifyOptions {
            use_emoji: false,
            ..NotifyOptions::default()
        });
        n.log("low memory", Severity::Warning);
        assert_eq!(
            sink.events(),
            vec![Notification::Warning {
                message: "WARNING: low memory".to_string()
            }]
        );
        assert_eq!(push.messages(), vec!["SafetyPrinter WARNING: low memory"]);
    }

    #[test]
    fn test_missing_push_is_tolerated() {
        let sink = Arc::new(RecordingSink::new());
        let n = Notifier::new(sink.clone(), NotifyOptions::default());
        n.log("boom", Severity::Error);
        assert_eq!(sink.count(|e| matches!(e, Notification::Error { .. })), 1);
    }

    #[test]
    fn test_outbox_delivers_in_order() {
        let (n, sink, push) = notifier(NotifyOptions {
            show_terminal: true,
            ..NotifyOptions::default()
        });
        let mut outbox = Outbox::new();
        outbox.log("New INTERLOCK detected.", Severity::Trip);
        outbox.emit(Notification::InterlockUpdate { status: Flag::True });
        assert_eq!(outbox.notifications().count(), 1);

        outbox.deliver(&n);
        let events = sink.events();
        assert!(matches!(events[0], Notification::Terminal { .. }));
        assert_eq!(events[1], Notification::InterlockUpdate { status: Flag::True });
        assert_eq!(push.messages().len(), 1);
    }

    #[test]
    fn test_notification_serializes_with_type_tag() {
        let json = serde_json::to_value(Notification::ConnectionUpdate {
            connected: true,
            port: Some("/dev/ttyUSB0".to_string()),
            total_messages: 3,
            bad_messages: 1,
            failure: false,
            reduced: false,
        })
        .unwrap();
        assert_eq!(json["type"], "connectionUpdate");
        assert_eq!(json["badMessages"], 1);
    }
}
