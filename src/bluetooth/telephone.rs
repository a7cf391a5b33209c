//! Bluetooth hands-free leg.
//!
//! Incoming audio: the simulator sends a tone over SCO and the device
//! loudspeaker plays it into the simulator microphone. Outgoing audio: the
//! simulator speaker plays a tone into the device microphone and it comes
//! back over SCO.

use crate::bluetooth::simulator::{SimulatorLink, SimulatorSnapshot};
use crate::bluetooth::FrequencyCycle;
use crate::clock::Clock;
use crate::config::SwitcherSettings;
use crate::error::AppResult;
use crate::protocol::Command;
use crate::target::Target;
use log::{debug, error, info};
use std::sync::Arc;
use std::time::Instant;

const CALL_ACTIVE: &str = "1";

/// What a call indicator update did to the telephone state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTransition {
    /// A call came up
    Began,
    /// The call went down
    Ended,
    /// Repeated indicator for a call already known to be up
    Unchanged,
}

/// HFP side of the switching loop.
///
/// Drives the incoming leg (SCO to microphone) and the outgoing leg (speaker
/// to SCO) with their own frequency cycles.
pub struct BluetoothTelephone {
    phone_cycle: FrequencyCycle,
    speaker_cycle: FrequencyCycle,
    playing_strength: f64,
    not_playing_strength: f64,
    default_phone_frequency: f64,
    default_speaker_frequency: f64,
    clock: Arc<dyn Clock>,
    hfp_client_address: String,
    active: bool,
    phone_frequency: f64,
    phone_requested_at: Instant,
    speaker_frequency: f64,
    speaker_requested_at: Instant,
    latencies: Vec<f64>,
}

impl BluetoothTelephone {
    /// Idle leg using the phone and speaker frequencies of `settings`.
    pub fn new(settings: &SwitcherSettings, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            phone_cycle: FrequencyCycle::new(settings.phone_frequencies.clone()),
            speaker_cycle: FrequencyCycle::new(settings.speaker_frequencies.clone()),
            playing_strength: settings.playing_strength,
            not_playing_strength: settings.not_playing_strength,
            default_phone_frequency: settings.default_phone_frequency,
            default_speaker_frequency: settings.default_speaker_frequency,
            clock,
            hfp_client_address: String::new(),
            active: false,
            phone_frequency: 0.0,
            phone_requested_at: now,
            speaker_frequency: 0.0,
            speaker_requested_at: now,
            latencies: Vec::new(),
        }
    }

    /// `true` while a call is up.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Device address used for SCO connections.
    pub fn hfp_client_address(&self) -> &str {
        &self.hfp_client_address
    }

    /// Stores the device address reported by the HFP app.
    pub fn set_hfp_client_address(&mut self, address: &str) {
        self.hfp_client_address = address.to_string();
    }

    /// Frequency last sent over SCO.
    pub fn phone_frequency(&self) -> f64 {
        self.phone_frequency
    }

    /// Frequency last played on the speaker.
    pub fn speaker_frequency(&self) -> f64 {
        self.speaker_frequency
    }

    /// When the phone frequency was requested.
    pub fn phone_requested_at(&self) -> Instant {
        self.phone_requested_at
    }

    /// When the speaker frequency was requested.
    pub fn speaker_requested_at(&self) -> Instant {
        self.speaker_requested_at
    }

    /// Incoming-leg latencies in seconds.
    pub fn latencies(&self) -> &[f64] {
        &self.latencies
    }

    /// Clears the call flag and the latencies.
    pub fn reset(&mut self) {
        self.active = false;
        self.latencies.clear();
    }

    /// Plays `frequency` over SCO and restarts the incoming timer.
    pub fn set_phone_frequency(&mut self, link: &dyn SimulatorLink, strength: f64, frequency: f64) -> AppResult<()> {
        self.phone_frequency = frequency;
        self.phone_requested_at = self.clock.now();
        link.send_command(&Command::ScoSignal { strength, frequency })
    }

    /// Plays `frequency` on the speaker and restarts the outgoing timer.
    pub fn set_speaker_frequency(&mut self, link: &dyn SimulatorLink, strength: f64, frequency: f64) -> AppResult<()> {
        self.speaker_frequency = frequency;
        self.speaker_requested_at = self.clock.now();
        link.send_command(&Command::SpeakerSignal { strength, frequency })
    }

    /// Next phone frequency of the cycle at playing strength.
    pub fn set_next_phone_frequency(&mut self, link: &dyn SimulatorLink) -> AppResult<()> {
        let frequency = self.phone_cycle.next_value();
        self.set_phone_frequency(link, self.playing_strength, frequency)
    }

    /// Next speaker frequency of the cycle at playing strength.
    pub fn set_next_speaker_frequency(&mut self, link: &dyn SimulatorLink) -> AppResult<()> {
        let frequency = self.speaker_cycle.next_value();
        self.set_speaker_frequency(link, self.playing_strength, frequency)
    }

    /// Plays the idle phone tone at the not-playing strength.
    pub fn set_default_phone_frequency(&mut self, link: &dyn SimulatorLink) -> AppResult<()> {
        self.set_phone_frequency(link, self.not_playing_strength, self.default_phone_frequency)
    }

    /// Dials from the device and opens the SCO link.
    pub fn simulate_outgoing_call(&self, link: &dyn SimulatorLink) -> AppResult<()> {
        link.send_command(&Command::Dial)?;
        link.send_command(&Command::ScoConnect {
            address: self.hfp_client_address.clone(),
        })
    }

    /// Makes the simulator hang up by itself after 30 seconds.
    pub fn set_default_call_duration(&self, link: &dyn SimulatorLink) -> AppResult<()> {
        link.send_command(&Command::DefaultCallDuration)
    }

    /// Logs an error with a screenshot when the call is not shown on the device.
    ///
    /// The UI often lags behind the call state, so this never fails the run.
    pub fn validate_active_call_from_ui(&self, target: &dyn Target, occasion: &str) {
        if target.is_active_call() {
            return;
        }
        let stamp = chrono::Local::now().format("%Y-%h-%d_%H-%M-%S");
        let screenshot = target
            .results_dir()
            .join(format!("No_call_display_{}_{}.png", occasion, stamp));
        if let Err(e) = target.take_screenshot(&screenshot) {
            error!("Screenshot '{}' failed: {}", screenshot.display(), e);
        }
        error!("After dialing, the call is not displayed in {}", screenshot.display());
    }

    /// Applies a call indicator update from `data`.
    pub fn phone_updated(
        &mut self,
        link: &dyn SimulatorLink,
        target: &dyn Target,
        data: &SimulatorSnapshot,
    ) -> AppResult<CallTransition> {
        if data.phone.status == CALL_ACTIVE {
            if self.active {
                debug!("Call indicator repeated for the ongoing call");
                return Ok(CallTransition::Unchanged);
            }
            info!("Phone Call Beginning");
            self.active = true;
            self.set_next_phone_frequency(link)?;
            self.set_next_speaker_frequency(link)?;
            self.validate_active_call_from_ui(target, "during_active_call");
            return Ok(CallTransition::Began);
        }

        info!("Phone Call Ending");
        self.active = false;
        self.set_phone_frequency(link, self.not_playing_strength, self.default_phone_frequency)?;
        self.set_speaker_frequency(link, self.not_playing_strength, self.default_speaker_frequency)?;
        Ok(CallTransition::Ended)
    }

    /// `true` when the incoming leg has something to validate.
    pub fn is_simulating_phone(&self, data: &SimulatorSnapshot) -> bool {
        data.micro.updated || self.phone_frequency == data.phone.frequency
    }

    /// Incoming leg: the microphone hears what was sent over SCO.
    pub fn validate_micro_frequency(&mut self, link: &dyn SimulatorLink, data: &SimulatorSnapshot) -> AppResult<bool> {
        if data.micro.frequency != data.phone.frequency {
            return Ok(false);
        }
        let latency = data.micro.time - data.phone.time;
        debug!("Phone latency {} Incoming", latency);
        self.latencies.push(latency);
        self.set_next_phone_frequency(link)?;
        Ok(true)
    }

    /// `true` when the outgoing leg has something to validate.
    pub fn is_simulating_speaker(&self, data: &SimulatorSnapshot) -> bool {
        data.sco.updated || self.speaker_frequency == data.speaker.frequency
    }

    /// Outgoing leg: SCO carries what the speaker played. Its latency is only logged.
    pub fn validate_speaker_frequency(&mut self, link: &dyn SimulatorLink, data: &SimulatorSnapshot) -> AppResult<bool> {
        if data.sco.frequency != data.speaker.frequency {
            return Ok(false);
        }
        debug!("Phone latency {} Outgoing", data.sco.time - data.speaker.time);
        self.set_next_speaker_frequency(link)?;
        Ok(true)
    }
}
