//! Bluetooth media leg.
//!
//! The simulator streams a tone over A2DP to the device; its microphone
//! should hear the same tone on the device speaker.

use crate::bluetooth::simulator::{SimulatorLink, SimulatorSnapshot};
use crate::bluetooth::FrequencyCycle;
use crate::clock::Clock;
use crate::config::SwitcherSettings;
use crate::error::{AppResult, HarnessError};
use crate::protocol::{Command, PlayMode};
use crate::target::Target;
use log::{debug, info};
use std::sync::Arc;
use std::time::{Duration, Instant};

const PLAYING: &str = "Playing";
const REPLAY_PAUSE: Duration = Duration::from_secs(2);
const INIT_RETRY: Duration = Duration::from_secs(1);

/// A2DP/AVRCP side of the switching loop.
///
/// Requests the cycle's frequencies over A2DP and measures how long the device
/// takes to echo each one back through the microphone.
pub struct BluetoothEntertainment {
    cycle: FrequencyCycle,
    playing_strength: f64,
    stop_frequency: f64,
    init_timeout: Duration,
    clock: Arc<dyn Clock>,
    active: bool,
    requested_frequency: f64,
    requested_at: Instant,
    latencies: Vec<f64>,
}

impl BluetoothEntertainment {
    /// Idle leg using the entertainment frequencies of `settings`.
    pub fn new(settings: &SwitcherSettings, clock: Arc<dyn Clock>) -> Self {
        let requested_at = clock.now();
        Self {
            cycle: FrequencyCycle::new(settings.entertainment_frequencies.clone()),
            playing_strength: settings.playing_strength,
            stop_frequency: settings.entertainment_frequencies.first().copied().unwrap_or_default(),
            init_timeout: settings.init_timeout,
            clock,
            active: false,
            requested_frequency: 0.0,
            requested_at,
            latencies: Vec::new(),
        }
    }

    /// `true` while the device plays the entertainment source.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Marks the leg as playing or not.
    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    /// Frequency last sent over A2DP.
    pub fn requested_frequency(&self) -> f64 {
        self.requested_frequency
    }

    /// When the current frequency was requested.
    pub fn requested_at(&self) -> Instant {
        self.requested_at
    }

    /// Request-to-echo latencies in seconds.
    pub fn latencies(&self) -> &[f64] {
        &self.latencies
    }

    /// Clears the activity flag and the latencies.
    pub fn reset(&mut self) {
        self.active = false;
        self.latencies.clear();
    }

    /// Requests `frequency` at `strength` and restarts the latency timer.
    pub fn set_entertainment_frequency(
        &mut self,
        link: &dyn SimulatorLink,
        strength: f64,
        frequency: f64,
    ) -> AppResult<()> {
        self.requested_frequency = frequency;
        self.requested_at = self.clock.now();
        link.send_command(&Command::A2dpSignal { strength, frequency })
    }

    /// Requests the next frequency of the cycle at playing strength.
    pub fn set_next_playing_frequency(&mut self, link: &dyn SimulatorLink) -> AppResult<()> {
        let frequency = self.cycle.next_value();
        self.set_entertainment_frequency(link, self.playing_strength, frequency)
    }

    /// Sets the next frequency of the cycle with an explicit strength.
    pub fn set_next_frequency_with_strength(&mut self, link: &dyn SimulatorLink, strength: f64) -> AppResult<()> {
        let frequency = self.cycle.next_value();
        self.set_entertainment_frequency(link, strength, frequency)
    }

    /// Silences A2DP, then asks the simulator to resync its state with the device.
    pub fn stop_audio(&self, link: &dyn SimulatorLink) -> AppResult<()> {
        link.send_command(&Command::A2dpSignal {
            strength: 0.0,
            frequency: self.stop_frequency,
        })?;
        link.send_command(&Command::A2dpSignal {
            strength: 0.0,
            frequency: 0.0,
        })
    }

    /// Waits until AVRCP reports the device as playing.
    pub fn init_entertainment(&mut self, link: &dyn SimulatorLink) -> AppResult<()> {
        let deadline = self.clock.now() + self.init_timeout;
        while self.clock.now() < deadline {
            let data = link.get_data(true)?;
            if data.avrcp.updated {
                self.set_next_playing_frequency(link)?;
                if data.avrcp.status == PLAYING {
                    return Ok(());
                }
                self.clock.sleep(REPLAY_PAUSE);
            } else {
                info!("Waiting for phonesimu init");
                link.send_command(&Command::Status)?;
                self.clock.sleep(INIT_RETRY);
            }
        }
        Err(HarnessError::SetupTimeout {
            what: "phonesimu initialisation",
            timeout: self.init_timeout,
        })
    }

    /// Applies the AVRCP status of `data` and returns it.
    pub fn update_status(&mut self, link: &dyn SimulatorLink, data: &SimulatorSnapshot) -> AppResult<String> {
        let status = data.avrcp.status.as_str();
        match status {
            PLAYING if !self.active => {
                info!("Entertainment Started Playing");
                self.active = true;
                self.set_next_playing_frequency(link)?;
            }
            "Paused" | "Stopped" => {
                info!("Entertainment {}", status);
                self.active = false;
                self.set_entertainment_frequency(link, 0.0, 0.0)?;
            }
            _ => {}
        }
        Ok(status.to_string())
    }

    /// Fails when the device UI does not show `media_source` as playing.
    pub fn validate_entertainment_from_ui(&self, target: &dyn Target, media_source: &str) -> AppResult<()> {
        if target.is_playing_source(media_source) {
            return Ok(());
        }
        let stamp = chrono::Local::now().format("%Y-%h-%d_%H-%M-%S");
        let screenshot = target
            .results_dir()
            .join(format!("No_playing_bt_media_{}.png", stamp));
        target.take_screenshot(&screenshot)?;
        Err(HarnessError::MediaSourceNotPlaying(format!(
            "{} (see {})",
            media_source,
            screenshot.display()
        )))
    }

    /// The microphone reported something new, or the simulator plays what was requested.
    pub fn is_simulating_entertainment_frequency(&self, data: &SimulatorSnapshot) -> bool {
        data.micro.updated || self.requested_frequency == data.entertainment.frequency
    }

    /// On a match, records the latency, advances the cycle and returns `true`.
    pub fn validate_entertainment_frequency(
        &mut self,
        link: &dyn SimulatorLink,
        data: &SimulatorSnapshot,
    ) -> AppResult<bool> {
        if data.micro.frequency != data.entertainment.frequency {
            return Ok(false);
        }
        let latency = data.micro.time - data.entertainment.time;
        debug!("Entertainment latency {}", latency);
        self.latencies.push(latency);
        self.set_next_playing_frequency(link)?;
        Ok(true)
    }

    /// Pauses then resumes playback.
    pub fn replay_entertainment(&self, link: &dyn SimulatorLink) -> AppResult<()> {
        link.send_command(&Command::SetMode(PlayMode::Paused))?;
        self.clock.sleep(REPLAY_PAUSE);
        link.send_command(&Command::SetMode(PlayMode::Playing))?;
        self.clock.sleep(REPLAY_PAUSE);
        Ok(())
    }

    /// Stops playback.
    pub fn pause_entertainment(&self, link: &dyn SimulatorLink) -> AppResult<()> {
        link.send_command(&Command::SetMode(PlayMode::Stopped))
    }

    /// Ends the recorders and leaves the simulator streaming.
    pub fn terminate(&mut self, link: &dyn SimulatorLink) -> AppResult<()> {
        link.send_command(&Command::AlsaMicroRecorderExit)?;
        link.send_command(&Command::ScoAudioRecorderExit)?;
        link.send_command(&Command::AlsaMicroExit)?;
        self.set_next_playing_frequency(link)
    }
}
