//! Audio connector: command link, recording control and scoped audio sessions.
//!
//! ```no_run
//! use phonesimu_harness::config::Settings;
//! use phonesimu_harness::connector::ConnectorAudio;
//! use std::sync::Arc;
//!
//! # fn main() -> phonesimu_harness::error::AppResult<()> {
//! let mut connector = ConnectorAudio::new(Arc::new(Settings::new(None)?));
//! connector.start();
//! let session = connector.session("check_silence", true)?;
//! let silent = session.wait_for_silence(10, std::time::Duration::from_secs(30));
//! let artifacts = session.close()?;
//! # Ok(())
//! # }
//! ```

use crate::analysis::plot::{generate_audio_analysis, AnalysisArtifacts};
use crate::config::Settings;
use crate::error::{AppResult, HarnessError};
use crate::protocol::{Command, CommandLink, SignalParameters, VadParameters};
use crate::reader::{LinkState, PhoneSimuReader, VadPoll};
use crate::wait::{self, SignalCriteria, WaitOutcome};
use log::{debug, error, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default deadline of the wait operations.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default consecutive frames for silence detection.
pub const DEFAULT_SILENCE_FRAMES: u32 = 5;

#[allow(clippy::expect_used)]
static USB_AUDIO_CARD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"card (\d+): .*USB Audio").expect("audio card pattern is valid"));

/// Extracts `hw:<n>,0` of the first USB audio card from `aplay -l` output.
pub fn parse_audio_card(aplay_output: &str) -> Option<String> {
    USB_AUDIO_CARD
        .captures(aplay_output)
        .map(|caps| format!("hw:{},0", &caps[1]))
}

/// Runs `aplay -l` and returns the USB audio card device.
pub fn discover_audio_card() -> AppResult<String> {
    let output = std::process::Command::new("aplay")
        .arg("-l")
        .output()
        .map_err(|e| HarnessError::AudioCard(format!("failed to run aplay: {}", e)))?;
    if !output.status.success() {
        return Err(HarnessError::AudioCard(format!("aplay -l exited with {}", output.status)));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let device = parse_audio_card(&stdout)
        .ok_or_else(|| HarnessError::AudioCard("no USB Audio card listed by aplay -l".to_string()))?;
    info!("USB audio card is: {}", device);
    Ok(device)
}

/// Connection to the phonesimu audio app used to control recordings.
pub struct ConnectorAudio {
    settings: Arc<Settings>,
    link: Option<CommandLink>,
    recording: AtomicBool,
}

impl ConnectorAudio {
    /// Creates a connector; nothing is opened until [`ConnectorAudio::start`].
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            link: None,
            recording: AtomicBool::new(false),
        }
    }

    /// Settings the connector was created with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Opens the command link; a failure is logged and reported as `false`.
    pub fn start(&mut self) -> bool {
        if self.link.is_some() {
            return true;
        }
        let phonesimu = &self.settings.phonesimu;
        match CommandLink::connect(phonesimu, phonesimu.audio_port) {
            Ok(link) => {
                self.link = Some(link);
                true
            }
            Err(e) => {
                error!("Failed to start the audio connector: {}", e);
                false
            }
        }
    }

    /// `true` while the command link is running.
    pub fn is_started(&self) -> bool {
        self.link.as_ref().is_some_and(CommandLink::is_running)
    }

    /// Flushes pending commands and closes the command link.
    pub fn stop(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.stop();
        }
    }

    /// Queues `command` on the command link.
    pub fn send(&self, command: &Command) -> AppResult<()> {
        info!("Sending command to audio app: {}", command);
        self.link
            .as_ref()
            .ok_or(HarnessError::NotConnected)?
            .send(command)
    }

    /// Opens a reader session; with `record` a recording named after `context` starts.
    pub fn session(&self, context: &str, record: bool) -> AppResult<AudioSession<'_>> {
        debug!("Audio session '{}' entered", context);
        let reader = PhoneSimuReader::start(&self.settings, context)?;
        if reader.link_state() == LinkState::Disconnected {
            error!("phonesimu reader failure, cannot connect to phonesimu audio app");
        }

        let mut session = AudioSession {
            connector: self,
            reader,
            context: context.to_string(),
            recording_path: None,
            closed: false,
        };
        if record {
            session.start_recording(&format!("{}_recording", context))?;
        }
        Ok(session)
    }
}

impl Drop for ConnectorAudio {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Scoped audio session; close it with [`AudioSession::close`].
///
/// Dropping an open session performs the same teardown and logs any failure.
pub struct AudioSession<'a> {
    connector: &'a ConnectorAudio,
    reader: PhoneSimuReader,
    context: String,
    recording_path: Option<PathBuf>,
    closed: bool,
}

impl AudioSession<'_> {
    /// Name the session was opened with.
    pub fn context(&self) -> &str {
        &self.context
    }

    /// Connection state of the underlying reader.
    pub fn link_state(&self) -> LinkState {
        self.reader.link_state()
    }

    /// Path of the raw frame transcript.
    pub fn transcript_path(&self) -> &Path {
        self.reader.transcript_path()
    }

    /// Prefix of the current recording; the recorder appends a timestamp and `.wav`.
    pub fn recording_path(&self) -> Option<&Path> {
        self.recording_path.as_deref()
    }

    /// Latest signal frame, `None` while disconnected or before the first frame.
    pub fn signal_parameters(&self) -> Option<SignalParameters> {
        match self.reader.link_state() {
            LinkState::Connected => self.reader.bus().latest_signal(),
            LinkState::Disconnected => None,
        }
    }

    /// Pops the next queued VAD frame, waiting up to `timeout`.
    pub fn next_vad_frame(&self, timeout: Duration) -> VadPoll {
        self.reader.bus().next_vad_frame(timeout)
    }

    /// Drops all queued VAD frames and returns how many there were.
    pub fn clear_vad_queue(&self) -> usize {
        self.reader.bus().clear_vad()
    }

    /// Waits for a signal frame satisfying every criterion.
    pub fn wait_for(&self, criteria: &SignalCriteria, timeout: Duration) -> WaitOutcome<SignalParameters> {
        wait::wait_for(
            self.reader.bus(),
            criteria,
            timeout,
            self.connector.settings.analysis.poll_interval,
        )
    }

    /// Waits for `consecutive_matches` silence frames in a row.
    pub fn wait_for_silence(&self, consecutive_matches: u32, timeout: Duration) -> WaitOutcome<()> {
        wait::wait_for_silence(self.reader.bus(), consecutive_matches, timeout)
    }

    /// Waits for `consecutive_matches` voice frames in a row.
    pub fn wait_for_voice(&self, consecutive_matches: u32, timeout: Duration) -> WaitOutcome<VadParameters> {
        wait::wait_for_voice(self.reader.bus(), consecutive_matches, timeout)
    }

    /// Starts recording into `<results>/phonesimu-recordings/<prefix>`.
    ///
    /// Returns `false` if a recording is already running or the command link is down.
    pub fn start_recording(&mut self, prefix: &str) -> AppResult<bool> {
        let settings = &self.connector.settings;
        let recordings = settings.results_dir().join("phonesimu-recordings");
        if !recordings.exists() {
            debug!("Creating recordings directory '{}'", recordings.display());
            fs::create_dir_all(&recordings)?;
        }

        if self.connector.recording.load(Ordering::SeqCst) {
            warn!("There is already an on-going recording, can't start a new one!");
            return Ok(false);
        }

        let device = match &settings.analysis.alsa_device {
            Some(device) => device.clone(),
            None => discover_audio_card()?,
        };
        let path = recordings.join(prefix);
        let commands = [
            Command::NewAlsaMicro {
                device,
                sample_rate: settings.analysis.sample_rate,
            },
            Command::AlsaMicroRecord {
                path: path.display().to_string(),
                interval: settings.analysis.record_interval,
            },
        ];
        for command in &commands {
            if let Err(e) = self.connector.send(command) {
                error!("Recording not started: {}", e);
                return Ok(false);
            }
        }

        self.connector.recording.store(true, Ordering::SeqCst);
        info!(
            "Recording started. path='{}' (the recorder appends a timestamp to the name)",
            path.display()
        );
        self.recording_path = Some(path);
        Ok(true)
    }

    /// Stops the current recording; `false` if none was running.
    pub fn stop_recording(&mut self) -> AppResult<bool> {
        if !self.connector.recording.load(Ordering::SeqCst) {
            warn!("No recording on-going, so nothing to stop");
            return Ok(false);
        }
        self.connector.send(&Command::AlsaMicroRecorderExit)?;
        self.connector.send(&Command::AlsaMicroExit)?;
        self.connector.recording.store(false, Ordering::SeqCst);
        info!("Recording stopped successfully");
        Ok(true)
    }

    /// Stops the reader, ends the recording and renders its analysis.
    ///
    /// Returns the analysis artifacts when this session recorded.
    pub fn close(mut self) -> AppResult<Option<AnalysisArtifacts>> {
        self.teardown()
    }

    fn teardown(&mut self) -> AppResult<Option<AnalysisArtifacts>> {
        self.closed = true;
        self.reader.stop();
        debug!("phonesimu reader for '{}' stopped", self.context);

        if self.recording_path.is_some() {
            self.stop_recording()?;
        }
        let artifacts = match &self.recording_path {
            Some(prefix) => Some(generate_audio_analysis(
                prefix,
                self.connector.settings.analysis.silence_threshold,
            )?),
            None => None,
        };
        debug!("Audio session '{}' left", self.context);
        Ok(artifacts)
    }
}

impl Drop for AudioSession<'_> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.teardown() {
                error!("Audio session '{}' teardown failed: {}", self.context, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_audio_card() {
        let output = "**** List of PLAYBACK Hardware Devices ****\n\
            card 0: PCH [HDA Intel PCH], device 0: ALC3246 Analog [ALC3246 Analog]\n\
            card 2: Device [USB Audio Device], device 0: USB Audio [USB Audio]\n";
        assert_eq!(parse_audio_card(output).as_deref(), Some("hw:2,0"));
        assert_eq!(parse_audio_card("card 0: PCH [HDA Intel PCH]"), None);
    }

    #[test]
    fn test_send_without_link_is_not_connected() {
        let connector = ConnectorAudio::new(Arc::new(Settings::default()));
        assert!(!connector.is_started());
        assert!(matches!(
            connector.send(&Command::AlsaMicroExit),
            Err(HarnessError::NotConnected)
        ));
    }
}
