//! Host printer collaborator
//!
//! The print server owns its own serial link to the printer. The engine
//! only asks about it (to avoid opening the printer's port and to restore
//! the link after an MCU open resets the board) and never drives it
//! beyond a reconnect request.

use parking_lot::Mutex;

/// The host's printer link as it looks right now
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostConnection {
    /// The link is closed (no port owned by the host)
    pub closed: bool,
    pub port: Option<String>,
    pub baud_rate: Option<u32>,
    pub profile: Option<String>,
}

impl HostConnection {
    /// A closed link
    pub fn closed() -> Self {
        Self {
            closed: true,
            ..Self::default()
        }
    }

    /// An open link on `port`
    pub fn open(port: &str, baud_rate: u32) -> Self {
        Self {
            closed: false,
            port: Some(port.to_string()),
            baud_rate: Some(baud_rate),
            profile: None,
        }
    }

    /// Port the printer currently occupies, if any
    pub fn printer_port(&self) -> Option<&str> {
        if self.closed {
            None
        } else {
            self.port.as_deref()
        }
    }
}

/// Operations the engine needs from the host application
pub trait HostPrinter: Send + Sync {
    /// Current printer link
    fn current_connection(&self) -> HostConnection;

    /// The printer link is up and talking
    fn is_operational(&self) -> bool;

    /// Ask the host to (re)open its printer link. The host may ignore this
    /// when it is already connected.
    fn connect(&self, port: Option<&str>, baud_rate: Option<u32>, profile: Option<&str>);

    /// A print job is running
    fn is_printing(&self) -> bool;

    /// Timelapses still waiting to be rendered
    fn pending_renders(&self) -> usize {
        0
    }

    /// The host knows how to shut the system down
    fn can_shutdown(&self) -> bool {
        false
    }

    /// Run the host's system shutdown command
    fn shutdown_system(&self) {}
}

/// Host without a printer
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHost;

impl HostPrinter for NoHost {
    fn current_connection(&self) -> HostConnection {
        HostConnection::closed()
    }

    fn is_operational(&self) -> bool {
        false
    }

    fn connect(&self, _port: Option<&str>, _baud_rate: Option<u32>, _profile: Option<&str>) {}

    fn is_printing(&self) -> bool {
        false
    }
}

#[derive(Debug, Default)]
struct StubState {
    connection: HostConnection,
    operational: bool,
    printing: bool,
    drop_on_query: bool,
    queries: usize,
    pending_renders: usize,
    can_shutdown: bool,
    shutdowns: usize,
    reconnects: Vec<(Option<String>, Option<u32>, Option<String>)>,
}

/// Scriptable host for tests and the demo
#[derive(Debug, Default)]
pub struct StubHost {
    state: Mutex<StubState>,
}

impl StubHost {
    /// Host whose printer is connected and operational on `port`
    pub fn connected(port: &str, baud_rate: u32) -> Self {
        let host = Self::default();
        {
            let mut state = host.state.lock();
            state.connection = HostConnection::open(port, baud_rate);
            state.operational = true;
        }
        host
    }

    /// Host with no printer link
    pub fn disconnected() -> Self {
        let host = Self::default();
        host.state.lock().connection = HostConnection::closed();
        host
    }

    /// Simulate the printer dropping once `is_operational` has been asked
    /// this many times, as a board reset on port open would cause
    pub fn drop_after_queries(&self, queries: usize) {
        let mut state = self.state.lock();
        state.drop_on_query = true;
        state.queries = queries;
    }

    pub fn set_printing(&self, printing: bool) {
        self.state.lock().printing = printing;
    }

    pub fn set_pending_renders(&self, pending: usize) {
        self.state.lock().pending_renders = pending;
    }

    pub fn set_can_shutdown(&self, can_shutdown: bool) {
        self.state.lock().can_shutdown = can_shutdown;
    }

    /// System shutdowns requested so far
    pub fn shutdowns(&self) -> usize {
        self.state.lock().shutdowns
    }

    /// Reconnect requests received so far
    pub fn reconnects(&self) -> Vec<(Option<String>, Option<u32>, Option<String>)> {
        self.state.lock().reconnects.clone()
    }
}

impl HostPrinter for StubHost {
    fn current_connection(&self) -> HostConnection {
        self.state.lock().connection.clone()
    }

    fn is_operational(&self) -> bool {
        let mut state = self.state.lock();
        if state.drop_on_query {
            if state.queries == 0 {
                state.operational = false;
                state.drop_on_query = false;
            } else {
                state.queries -= 1;
            }
        }
        state.operational
    }

    fn connect(&self, port: Option<&str>, baud_rate: Option<u32>, profile: Option<&str>) {
        let mut state = self.state.lock();
        state.reconnects.push((
            port.map(str::to_string),
            baud_rate,
            profile.map(str::to_string),
        ));
        if let Some(port) = port {
            state.connection = HostConnection {
                closed: false,
                port: Some(port.to_string()),
                baud_rate,
                profile: profile.map(str::to_string),
            };
            state.operational = true;
        }
    }

    fn is_printing(&self) -> bool {
        self.state.lock().printing
    }

    fn pending_renders(&self) -> usize {
        self.state.lock().pending_renders
    }

    fn can_shutdown(&self) -> bool {
        self.state.lock().can_shutdown
    }

    fn shutdown_system(&self) {
        self.state.lock().shutdowns += 1;
    }
}
