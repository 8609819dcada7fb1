//! Demo Mode - Simulated Safety Printer MCU
//!
//! Speaks the MCU wire protocol in memory so the engine and a UI can be
//! exercised without hardware. Four sensors are simulated: two temperature
//! probes with jittering readings and two digital inputs. An enabled sensor
//! that goes active trips the interlock until `<C1>` resets it.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::protocol::frame::{command_id, wrap};
use crate::protocol::{LineChannel, PortBackend, ProtocolError, IDENTIFICATION_MARKER};

/// Port name under which the simulator is discovered
pub const DEMO_PORT: &str = "/dev/safetyprinter-demo";

#[derive(Debug, Clone, Copy, PartialEq)]
enum SensorKind {
    /// Reading in degrees; active above the setpoint
    Temperature { nominal: f64 },
    /// 0/1 input; active when equal to the setpoint
    Digital,
}

#[derive(Debug, Clone)]
struct SimSensor {
    label: &'static str,
    kind: SensorKind,
    enabled: bool,
    force_disable: bool,
    low_setpoint: f64,
    high_setpoint: f64,
    default_setpoint: f64,
    setpoint: f64,
    timer: u32,
    value: f64,
    /// Value forced by the demo driver instead of the jittered reading
    forced: Option<f64>,
    trigger: bool,
}

impl SimSensor {
    fn temperature(label: &'static str, nominal: f64, setpoint: f64, high: f64) -> Self {
        Self {
            label,
            kind: SensorKind::Temperature { nominal },
            enabled: true,
            force_disable: false,
            low_setpoint: 0.0,
            high_setpoint: high,
            default_setpoint: setpoint,
            setpoint,
            timer: 5,
            value: nominal,
            forced: None,
            trigger: false,
        }
    }

    fn digital(label: &'static str) -> Self {
        Self {
            label,
            kind: SensorKind::Digital,
            enabled: true,
            force_disable: false,
            low_setpoint: 0.0,
            high_setpoint: 1.0,
            default_setpoint: 1.0,
            setpoint: 1.0,
            timer: 0,
            value: 0.0,
            forced: None,
            trigger: false,
        }
    }

    fn type_code(&self) -> u8 {
        match self.kind {
            SensorKind::Digital => 0,
            SensorKind::Temperature { .. } => 1,
        }
    }

    fn is_active(&self) -> bool {
        match self.kind {
            SensorKind::Temperature { .. } => self.value > self.setpoint,
            SensorKind::Digital => (self.value - self.setpoint).abs() < f64::EPSILON,
        }
    }

    fn format(&self, v: f64) -> String {
        match self.kind {
            SensorKind::Temperature { .. } => format!("{v:.1}"),
            SensorKind::Digital => format!("{v:.0}"),
        }
    }
}

fn flag(value: bool) -> char {
    if value {
        'T'
    } else {
        'F'
    }
}

struct SimState {
    sensors: Vec<SimSensor>,
    interlock: bool,
    comm_protocol: String,
    pending: VecDeque<Vec<u8>>,
    rng: StdRng,
    frames: Vec<String>,
}

impl SimState {
    fn sample(&mut self) {
        for sensor in &mut self.sensors {
            sensor.value = match (sensor.forced, sensor.kind) {
                (Some(v), _) => v,
                (None, SensorKind::Temperature { nominal }) => {
                    nominal + self.rng.gen_range(-0.5..0.5)
                }
                (None, SensorKind::Digital) => 0.0,
            };
            if sensor.enabled && !sensor.force_disable && sensor.is_active() {
                sensor.trigger = true;
                self.interlock = true;
            }
        }
    }

    fn status(&mut self) -> String {
        self.sample();
        let mut payload = format!("R1:{},F,F,F,F,", flag(self.interlock));
        for (index, s) in self.sensors.iter().enumerate() {
            payload.push_str(&format!(
                "#{index},{},{},{},{},{},{},",
                flag(s.enabled),
                flag(s.is_active()),
                s.format(s.value),
                s.format(s.setpoint),
                s.timer,
                flag(s.trigger)
            ));
        }
        payload
    }

    fn labels(&self) -> String {
        let mut payload = String::from("R2:");
        for (index, s) in self.sensors.iter().enumerate() {
            payload.push_str(&format!(
                "#{index},{},{},{},{},{},",
                s.label,
                s.type_code(),
                flag(s.force_disable),
                s.format(s.low_setpoint),
                s.format(s.high_setpoint)
            ));
        }
        payload
    }

    fn mcu_stats(&mut self) -> String {
        format!(
            "R5:{},{:.1},{:.2},{},{}",
            self.rng.gen_range(700..900),
            self.rng.gen_range(35.0..45.0),
            self.rng.gen_range(4.9..5.1),
            self.rng.gen_range(10..20),
            self.rng.gen_range(3..6)
        )
    }

    fn sensor_arg(&mut self, args: &[&str]) -> Option<&mut SimSensor> {
        let index: usize = args.first()?.parse().ok()?;
        self.sensors.get_mut(index)
    }

    /// Reply lines for one command frame
    fn answer(&mut self, frame: &str) -> Vec<String> {
        let Some(id) = command_id(frame) else {
            return vec!["ERR: invalid frame".to_string()];
        };
        let inner = frame.trim().trim_start_matches('<').trim_end_matches('>');
        let args: Vec<&str> = inner.split_whitespace().skip(1).collect();

        match id.to_ascii_uppercase().as_str() {
            "R1" => vec![wrap(&self.status())],
            "R2" => vec![wrap(&self.labels())],
            "R4" => vec![wrap(&format!(
                "R4:2.1.0,Jan 15 2024,1024,{},Simulated",
                self.comm_protocol
            ))],
            "R5" => vec![wrap(&self.mcu_stats())],
            "R6" => vec![IDENTIFICATION_MARKER.to_string()],
            "C1" => {
                self.interlock = false;
                for s in &mut self.sensors {
                    s.trigger = false;
                }
                vec!["C1: Trips reset".to_string()]
            }
            "C2" => {
                self.interlock = true;
                vec!["C2: Manual trip".to_string()]
            }
            "C3" => {
                let enabled = args.get(1).is_some_and(|a| a.eq_ignore_ascii_case("on"));
                match self.sensor_arg(&args) {
                    Some(s) => {
                        s.enabled = enabled;
                        vec![format!("C3: {} {}", s.label, if enabled { "on" } else { "off" })]
                    }
                    None => vec!["C3: invalid sensor".to_string()],
                }
            }
            "C4" => {
                let value = args.get(1).and_then(|a| a.parse::<f64>().ok());
                match (self.sensor_arg(&args), value) {
                    (Some(s), Some(v)) if v >= s.low_setpoint && v <= s.high_setpoint => {
                        s.setpoint = v;
                        vec![format!("C4: {} setpoint {}", s.label, s.format(v))]
                    }
                    _ => vec!["C4: invalid setpoint".to_string()],
                }
            }
            "C5" => vec!["C5: Configuration saved".to_string()],
            "C6" => vec!["C6: Power off".to_string()],
            "C7" => {
                let timer = args.get(1).and_then(|a| a.parse::<u32>().ok());
                match (self.sensor_arg(&args), timer) {
                    (Some(s), Some(t)) => {
                        s.timer = t;
                        vec![format!("C7: {} timer {t}", s.label)]
                    }
                    _ => vec!["C7: invalid timer".to_string()],
                }
            }
            "C8" => match self.sensor_arg(&args) {
                Some(s) => {
                    s.setpoint = s.default_setpoint;
                    s.enabled = true;
                    vec![format!("C8: {} defaults restored", s.label)]
                }
                None => vec!["C8: invalid sensor".to_string()],
            },
            "C9" => vec!["C9: Ready for programming".to_string()],
            other => vec![format!("ERR: unknown command {other}")],
        }
    }
}

/// In-memory MCU. Clones share state so a driver can keep a handle.
#[derive(Clone)]
pub struct SimulatedMcu {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedMcu {
    /// Create a simulator with a fixed seed
    pub fn new(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    /// Create a simulator with a random seed
    pub fn from_entropy() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    fn with_rng(rng: StdRng) -> Self {
        let sensors = vec![
            SimSensor::temperature("Hotend", 24.0, 280.0, 300.0),
            SimSensor::temperature("Bed", 23.0, 120.0, 150.0),
            SimSensor::digital("Smoke"),
            SimSensor::digital("Door"),
        ];
        Self {
            state: Arc::new(Mutex::new(SimState {
                sensors,
                interlock: false,
                comm_protocol: "5".to_string(),
                pending: VecDeque::new(),
                rng,
                frames: Vec::new(),
            })),
        }
    }

    /// Report a different firmware communication protocol version
    pub fn with_comm_protocol(self, version: &str) -> Self {
        self.state.lock().comm_protocol = version.to_string();
        self
    }

    /// Pin a sensor reading, e.g. to simulate a runaway or an open door
    pub fn force_value(&self, index: usize, value: f64) {
        if let Some(sensor) = self.state.lock().sensors.get_mut(index) {
            sensor.forced = Some(value);
        }
    }

    /// Go back to simulated readings
    pub fn release_value(&self, index: usize) {
        if let Some(sensor) = self.state.lock().sensors.get_mut(index) {
            sensor.forced = None;
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.state.lock().interlock
    }

    pub fn sensor_count(&self) -> usize {
        self.state.lock().sensors.len()
    }

    /// Frames received so far
    pub fn frames(&self) -> Vec<String> {
        self.state.lock().frames.clone()
    }
}

impl LineChannel for SimulatedMcu {
    fn write_frame(&mut self, frame: &str) -> io::Result<()> {
        let mut state = self.state.lock();
        state.frames.push(frame.to_string());
        let lines = state.answer(frame);
        state
            .pending
            .extend(lines.into_iter().map(String::into_bytes));
        Ok(())
    }

    fn read_line(&mut self) -> io::Result<Vec<u8>> {
        Ok(self.state.lock().pending.pop_front().unwrap_or_default())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.state.lock().pending.clear();
        Ok(())
    }
}

/// Backend exposing one simulated MCU as [`DEMO_PORT`]
#[derive(Clone)]
pub struct SimulatedBackend {
    mcu: SimulatedMcu,
}

impl SimulatedBackend {
    pub fn new(mcu: SimulatedMcu) -> Self {
        Self { mcu }
    }

    pub fn mcu(&self) -> &SimulatedMcu {
        &self.mcu
    }
}

impl PortBackend for SimulatedBackend {
    fn discover(&self) -> Vec<String> {
        vec![DEMO_PORT.to_string()]
    }

    fn open(
        &self,
        port: &str,
        _baud_rate: u32,
        _read_timeout: Duration,
    ) -> Result<Box<dyn LineChannel>, ProtocolError> {
        if port != DEMO_PORT {
            return Err(ProtocolError::OpenFailed {
                port: port.to_string(),
                reason: "no such device".to_string(),
            });
        }
        Ok(Box::new(self.mcu.clone()))
    }
}
