//! Bluetooth entertainment/telephony endurance testing against phonesimu.
//!
//! The device under test plays A2DP audio streamed by the simulator until a
//! simulated call interrupts it, then goes back to entertainment once the
//! call ends. [`BluetoothServicesSwitcher`] drives that cycle and validates
//! every tone the simulator sends against what it hears back.

pub mod entertainment;
pub mod report;
pub mod simulator;
pub mod switcher;
pub mod telephone;

pub use entertainment::BluetoothEntertainment;
pub use report::{EnduranceReportWriter, LatencyStats, LegStats, SwitchReport};
pub use simulator::{PhoneSimuHandler, SimulatorLink, SimulatorSnapshot};
pub use switcher::BluetoothServicesSwitcher;
pub use telephone::{BluetoothTelephone, CallTransition};

/// Endless round-robin over a fixed list of test frequencies.
#[derive(Debug, Clone, PartialEq)]
pub struct FrequencyCycle {
    values: Vec<f64>,
    next: usize,
}

impl FrequencyCycle {
    /// Cycle starting at the first of `values`.
    pub fn new(values: Vec<f64>) -> Self {
        Self { values, next: 0 }
    }

    /// Next frequency; 0 for an empty cycle.
    pub fn next_value(&mut self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let value = self.values[self.next];
        self.next = (self.next + 1) % self.values.len();
        value
    }
}
