//! Audio and Bluetooth test harness for the phonesimu simulator.
//!
//! The simulator exposes its apps over telnet-style TCP sockets. This crate
//! reads the analysis frames of the audio app, waits for signal, silence and
//! voice conditions, controls recordings and checks them for silence, and
//! runs the Bluetooth entertainment/telephony endurance loop.
//!
//! Device interaction beyond the simulator (UI checks, screenshots) goes
//! through the [`target::Target`] trait.

pub mod analysis;
pub mod bluetooth;
pub mod clock;
pub mod config;
pub mod connector;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod reader;
pub mod target;
pub mod wait;

pub use config::Settings;
pub use error::{AppResult, HarnessError};
pub use wait::WaitOutcome;
