//! Sensor State Model
//!
//! Keeps the last known value of every sensor and board attribute and
//! decides which changes are worth telling the UI about.

mod model;
mod record;

pub use model::{SensorStateModel, StatusOutcome};
pub use record::{BoardWarning, BoardWarnings, SensorRecord};
