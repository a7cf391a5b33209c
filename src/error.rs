//! Custom error types for the harness.
//!
//! This module defines the primary error type, `HarnessError`, used by every
//! component of the crate. Using the `thiserror` crate, it provides a centralized
//! and consistent way to handle the different kinds of failures that can occur
//! while driving the phonesimu simulator.
//!
//! ## Error Hierarchy
//!
//! - **`Config` / `Configuration`**: loading failures from `figment` and semantic
//!   validation failures of the loaded settings.
//! - **`Io` / `Connection` / `NotConnected`**: socket and file problems. A failed
//!   connection is fatal to the operation that needed it.
//! - **`AmbiguousRecording`**: zero or several recordings matched a prefix. This is
//!   never resolved by picking one of the candidates.
//! - **`SwitchingStalled` / `NoLatencies`**: verdict-level failures of the Bluetooth
//!   switching session.
//! - **`HandlerDead` / `HandlerNotStarted`**: the multi-connection simulator handler
//!   is not running.
//!
//! Timeouts of the wait primitives are *not* errors; they are reported through
//! [`crate::wait::WaitOutcome::TimedOut`].

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the harness error type.
pub type AppResult<T> = std::result::Result<T, HarnessError>;

/// Every failure the harness reports.
///
/// Timeouts of the wait primitives are not errors; see [`crate::wait::WaitOutcome`].
#[derive(Error, Debug)]
pub enum HarnessError {
    /// Configuration could not be extracted
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration values are inconsistent
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem or socket failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Simulator app unreachable after all retries
    #[error("Could not connect to phonesimu at {addr} after {attempts} attempt(s): {source}")]
    Connection {
        /// `host:port` that was tried
        addr: String,
        /// Attempts made
        attempts: u32,
        /// Last connection error
        #[source]
        source: std::io::Error,
    },

    /// Command sent before the link was opened
    #[error("phonesimu control link not connected")]
    NotConnected,

    /// Simulator communication thread has exited
    #[error("phonesimu comm handler is dead. Ending Bluetooth endurance test")]
    HandlerDead,

    /// Simulator handler used before `start`
    #[error("[{0}] called before starting comm handler [start_comm]")]
    HandlerNotStarted(&'static str),

    /// Zero or several recordings match a prefix
    #[error("Expected 1 recording matching '{}*.wav' but found {}: {found:?}", prefix.display(), found.len())]
    AmbiguousRecording {
        /// Recording prefix without the timestamp and extension
        prefix: PathBuf,
        /// Every matching file
        found: Vec<PathBuf>,
    },

    /// WAV decoding or encoding failure
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    /// Plot encoding failure
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Report writing failure
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// No usable USB audio card
    #[error("Audio card discovery failed: {0}")]
    AudioCard(String),

    /// A setup step missed its deadline
    #[error("{what} timed out after {timeout:?}")]
    SetupTimeout {
        /// Step that timed out
        what: &'static str,
        /// Deadline that elapsed
        timeout: Duration,
    },

    /// Neither leg made progress within the switching budget
    #[error(
        "Bluetooth Endurance Test Failed Phone: {phone_active}, Entertainment: {entertainment_active}"
    )]
    SwitchingStalled {
        /// A call was up when the session was aborted
        phone_active: bool,
        /// Entertainment was playing when the session was aborted
        entertainment_active: bool,
    },

    /// A leg never completed a round trip
    #[error("Bluetooth Endurance Test Failed. No {0} round-trip completed, so {0} latencies can't be calculated")]
    NoLatencies(&'static str),

    /// The device does not show the expected media source
    #[error("Media source '{0}' is not playing")]
    MediaSourceNotPlaying(String),
}
