//! Layered configuration for the harness.
//!
//! Settings are resolved in this order of precedence (highest last):
//! 1. Built-in defaults
//! 2. An optional TOML file
//! 3. Environment variables with the `PHONESIMU_` prefix, `__` separating sections
//!
//! ## Example
//!
//! ```toml
//! [application]
//! log_level = "debug"
//! results_dir = "results"
//!
//! [phonesimu]
//! host = "127.0.0.1"
//! audio_port = 3000
//! read_timeout = "180s"
//!
//! [analysis]
//! silence_threshold = 85
//!
//! [switcher]
//! entertainment_frequencies = [4500.0, 6000.0]
//! max_switch_time = "40s"
//! ```
//!
//! `PHONESIMU_PHONESIMU__HOST=10.0.0.2` overrides the simulator host.

use crate::error::{AppResult, HarnessError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level settings passed explicitly to every component.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Logging and output location
    #[serde(default)]
    pub application: ApplicationSettings,
    /// Simulator connection
    #[serde(default)]
    pub phonesimu: PhoneSimuSettings,
    /// Audio checks
    #[serde(default)]
    pub analysis: AnalysisSettings,
    /// Bluetooth switching loop
    #[serde(default)]
    pub switcher: SwitcherSettings,
}

/// Process-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplicationSettings {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Root for transcripts, recordings and reports
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
}

/// Simulator endpoints and link timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhoneSimuSettings {
    /// Simulator host name or address
    #[serde(default = "default_host")]
    pub host: String,
    /// Audio app port, also the port of the signal-analysis stream
    #[serde(default = "default_audio_port")]
    pub audio_port: u16,
    /// AVRCP app port
    #[serde(default = "default_avrcp_port")]
    pub avrcp_port: u16,
    /// HFP app port
    #[serde(default = "default_hfp_port")]
    pub hfp_port: u16,
    /// Socket open timeout
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Per-read timeout of the line reader
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Connection attempts before giving up
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    /// Pause between connection attempts
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Number of `IAC NOP` probes sent after the socket opens
    #[serde(default = "default_probe_count")]
    pub probe_count: u32,
    /// Pause between probes
    #[serde(default = "default_probe_interval", with = "humantime_serde")]
    pub probe_interval: Duration,
}

/// Audio analysis thresholds and recording parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisSettings {
    /// Peak amplitude (16-bit scale) at or below which a recording is silent
    #[serde(default = "default_silence_threshold")]
    pub silence_threshold: u32,
    /// Polling period of the signal waits
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Consecutive voice frames required by `check_voice_detection`
    #[serde(default = "default_vad_quality_metric")]
    pub vad_quality_metric: u32,
    /// Leading portion of a recording ignored by silence verification
    #[serde(default = "default_trim", with = "humantime_serde")]
    pub trim: Duration,
    /// Recording sample rate in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Recorder file rotation interval passed to `alsa-micro record`
    #[serde(default = "default_record_interval")]
    pub record_interval: f64,
    /// ALSA device for recordings; discovered with `aplay -l` when unset
    #[serde(default)]
    pub alsa_device: Option<String>,
}

/// Bluetooth switching loop parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SwitcherSettings {
    /// Cycle of the incoming phone leg
    #[serde(default = "default_phone_frequencies")]
    pub phone_frequencies: Vec<f64>,
    /// Cycle of the A2DP leg
    #[serde(default = "default_entertainment_frequencies")]
    pub entertainment_frequencies: Vec<f64>,
    /// Cycle of the outgoing phone leg
    #[serde(default = "default_speaker_frequencies")]
    pub speaker_frequencies: Vec<f64>,
    /// Strength of a tone under test
    #[serde(default = "default_playing_strength")]
    pub playing_strength: f64,
    /// Strength of an idle tone
    #[serde(default = "default_not_playing_strength")]
    pub not_playing_strength: f64,
    /// Idle SCO tone
    #[serde(default = "default_phone_frequency")]
    pub default_phone_frequency: f64,
    /// Idle A2DP tone
    #[serde(default = "default_entertainment_frequency")]
    pub default_entertainment_frequency: f64,
    /// Idle speaker tone
    #[serde(default = "default_speaker_frequency")]
    pub default_speaker_frequency: f64,
    /// Entertainment playback time before an outgoing call is started
    #[serde(default = "default_entertainment_duration", with = "humantime_serde")]
    pub entertainment_duration: Duration,
    /// Budget for the simulator to report a requested frequency
    #[serde(default = "default_max_response_time", with = "humantime_serde")]
    pub max_response_time: Duration,
    /// No-progress budget before the session is aborted
    #[serde(default = "default_max_switch_time", with = "humantime_serde")]
    pub max_switch_time: Duration,
    /// Device discovery and playback initialisation budget
    #[serde(default = "default_init_timeout", with = "humantime_serde")]
    pub init_timeout: Duration,
    /// Polling period of the switching loop
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Capture device used for the entertainment recording
    #[serde(default = "default_micro_device")]
    pub micro_device: String,
    /// Run `amixer` to set capture levels when the handler starts
    #[serde(default)]
    pub configure_mixer: bool,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_audio_port() -> u16 {
    3000
}

fn default_avrcp_port() -> u16 {
    3001
}

fn default_hfp_port() -> u16 {
    3002
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(180)
}

fn default_connect_retries() -> u32 {
    5
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_probe_count() -> u32 {
    5
}

fn default_probe_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_silence_threshold() -> u32 {
    85
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_vad_quality_metric() -> u32 {
    5
}

fn default_trim() -> Duration {
    Duration::from_secs(2)
}

fn default_sample_rate() -> u32 {
    48_000
}

fn default_record_interval() -> f64 {
    0.1
}

fn default_phone_frequencies() -> Vec<f64> {
    vec![1500.0, 3000.0]
}

fn default_entertainment_frequencies() -> Vec<f64> {
    vec![4500.0, 6000.0]
}

fn default_speaker_frequencies() -> Vec<f64> {
    vec![1000.0, 750.0]
}

fn default_playing_strength() -> f64 {
    0.5
}

fn default_not_playing_strength() -> f64 {
    1.0
}

fn default_phone_frequency() -> f64 {
    375.0
}

fn default_entertainment_frequency() -> f64 {
    1125.0
}

fn default_speaker_frequency() -> f64 {
    2500.0
}

fn default_entertainment_duration() -> Duration {
    Duration::from_secs(30)
}

fn default_max_response_time() -> Duration {
    Duration::from_secs(5)
}

fn default_max_switch_time() -> Duration {
    Duration::from_secs(40)
}

fn default_init_timeout() -> Duration {
    Duration::from_secs(90)
}

fn default_micro_device() -> String {
    "plughw:CARD=Device,DEV=0".to_string()
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            results_dir: default_results_dir(),
        }
    }
}

impl Default for PhoneSimuSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            audio_port: default_audio_port(),
            avrcp_port: default_avrcp_port(),
            hfp_port: default_hfp_port(),
            connect_timeout: default_connect_timeout(),
            read_timeout: default_read_timeout(),
            connect_retries: default_connect_retries(),
            retry_delay: default_retry_delay(),
            probe_count: default_probe_count(),
            probe_interval: default_probe_interval(),
        }
    }
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            silence_threshold: default_silence_threshold(),
            poll_interval: default_poll_interval(),
            vad_quality_metric: default_vad_quality_metric(),
            trim: default_trim(),
            sample_rate: default_sample_rate(),
            record_interval: default_record_interval(),
            alsa_device: None,
        }
    }
}

impl Default for SwitcherSettings {
    fn default() -> Self {
        Self {
            phone_frequencies: default_phone_frequencies(),
            entertainment_frequencies: default_entertainment_frequencies(),
            speaker_frequencies: default_speaker_frequencies(),
            playing_strength: default_playing_strength(),
            not_playing_strength: default_not_playing_strength(),
            default_phone_frequency: default_phone_frequency(),
            default_entertainment_frequency: default_entertainment_frequency(),
            default_speaker_frequency: default_speaker_frequency(),
            entertainment_duration: default_entertainment_duration(),
            max_response_time: default_max_response_time(),
            max_switch_time: default_max_switch_time(),
            init_timeout: default_init_timeout(),
            poll_interval: default_poll_interval(),
            micro_device: default_micro_device(),
            configure_mixer: false,
        }
    }
}

// ============================================================================
// Loading and Validation
// ============================================================================

impl Settings {
    /// Loads settings from defaults, an optional TOML file and `PHONESIMU_` env vars.
    ///
    /// A missing file is not an error; the defaults and environment still apply.
    ///
    /// # Errors
    ///
    /// Returns `HarnessError::Config` if a layer cannot be parsed and
    /// `HarnessError::Configuration` if the merged result fails validation.
    pub fn new(path: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let settings: Settings = figment
            .merge(Env::prefixed("PHONESIMU_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Checks the semantic constraints that serde cannot express.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(HarnessError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let ports = [
            ("audio_port", self.phonesimu.audio_port),
            ("avrcp_port", self.phonesimu.avrcp_port),
            ("hfp_port", self.phonesimu.hfp_port),
        ];
        for (name, port) in ports {
            if port == 0 {
                return Err(HarnessError::Configuration(format!(
                    "phonesimu.{} must be non-zero",
                    name
                )));
            }
        }

        if self.phonesimu.connect_retries == 0 {
            return Err(HarnessError::Configuration(
                "phonesimu.connect_retries must be at least 1".to_string(),
            ));
        }

        if self.analysis.poll_interval.is_zero() || self.switcher.poll_interval.is_zero() {
            return Err(HarnessError::Configuration(
                "poll_interval must be greater than zero".to_string(),
            ));
        }

        if self.analysis.sample_rate == 0 {
            return Err(HarnessError::Configuration(
                "analysis.sample_rate must be non-zero".to_string(),
            ));
        }

        let cycles = [
            ("phone_frequencies", &self.switcher.phone_frequencies),
            ("entertainment_frequencies", &self.switcher.entertainment_frequencies),
            ("speaker_frequencies", &self.switcher.speaker_frequencies),
        ];
        for (name, cycle) in cycles {
            if cycle.is_empty() {
                return Err(HarnessError::Configuration(format!(
                    "switcher.{} cannot be empty",
                    name
                )));
            }
            if cycle.iter().any(|f| !f.is_finite() || *f <= 0.0) {
                return Err(HarnessError::Configuration(format!(
                    "switcher.{} must only contain positive frequencies",
                    name
                )));
            }
        }

        Ok(())
    }

    /// Results directory for the current run.
    pub fn results_dir(&self) -> &Path {
        &self.application.results_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.analysis.silence_threshold, 85);
        assert_eq!(settings.switcher.entertainment_frequencies, vec![4500.0, 6000.0]);
        assert_eq!(settings.phonesimu.read_timeout, Duration::from_secs(180));
    }

    #[test]
    #[serial]
    fn test_toml_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[phonesimu]
host = "10.1.2.3"
read_timeout = "5s"

[analysis]
silence_threshold = 120
"#
        )
        .unwrap();

        let settings = Settings::new(Some(file.path())).unwrap();
        assert_eq!(settings.phonesimu.host, "10.1.2.3");
        assert_eq!(settings.phonesimu.read_timeout, Duration::from_secs(5));
        assert_eq!(settings.analysis.silence_threshold, 120);
        // untouched sections keep their defaults
        assert_eq!(settings.phonesimu.audio_port, 3000);
        assert_eq!(settings.switcher.max_switch_time, Duration::from_secs(40));
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("harness.toml", "[phonesimu]\nhost = \"10.1.2.3\"\n")?;
            jail.set_env("PHONESIMU_PHONESIMU__HOST", "192.168.0.9");
            let settings = Settings::new(Some(Path::new("harness.toml")))
                .map_err(|e| e.to_string())?;
            assert_eq!(settings.phonesimu.host, "192.168.0.9");
            Ok(())
        });
    }

    #[test]
    fn test_rejects_empty_cycle() {
        let mut settings = Settings::default();
        settings.switcher.speaker_frequencies.clear();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("speaker_frequencies"));
    }

    #[test]
    fn test_rejects_bad_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "verbose".to_string();
        assert!(matches!(
            settings.validate(),
            Err(HarnessError::Configuration(_))
        ));
    }
}
