//! Domain-level audio checks built on [`ConnectorAudio`] sessions.
//!
//! Every check opens a recording session named after its context, so each one
//! leaves a recording, a mono copy and an analysis image behind.

use crate::analysis::compare::{CompareFrequency, CompareMinStrength};
use crate::analysis::wav::{verify_silence_recording, SilenceVerdict};
use crate::config::Settings;
use crate::connector::ConnectorAudio;
use crate::error::{AppResult, HarnessError};
use crate::protocol::{SignalField, SignalParameters, VadParameters};
use crate::wait::{SignalCriteria, WaitOutcome};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Parameters of [`AudioAnalyzer::check_frequency`].
#[derive(Debug, Clone, PartialEq)]
pub struct FrequencyCheck {
    /// Expected main frequency in Hz
    pub frequency: f64,
    /// Allowed deviation, exclusive
    pub deviation: f64,
    /// Deadline of the frequency wait
    pub timeout: Duration,
    /// Extra recording time after the wait returns
    pub post_record: Duration,
    /// Minimum signal strength, inclusive
    pub min_strength: f64,
}

impl FrequencyCheck {
    /// Check of `frequency` with the default tolerances.
    pub fn new(frequency: f64) -> Self {
        Self {
            frequency,
            deviation: 20.0,
            timeout: Duration::from_secs(30),
            post_record: Duration::from_secs(2),
            min_strength: 0.4,
        }
    }

    /// Signal predicates equivalent to this check.
    pub fn criteria(&self) -> SignalCriteria {
        SignalCriteria::new()
            .with(SignalField::Strength, CompareMinStrength::new(self.min_strength))
            .with(
                SignalField::MainFrequency,
                CompareFrequency::new(self.frequency, self.deviation),
            )
    }
}

/// High-level audio checks, each run in its own recorded session.
pub struct AudioAnalyzer {
    connector: ConnectorAudio,
}

impl AudioAnalyzer {
    /// Creates the analyzer and starts its connector.
    pub fn new(settings: Arc<Settings>) -> Self {
        let mut connector = ConnectorAudio::new(settings);
        connector.start();
        Self { connector }
    }

    /// Wraps an existing connector as is.
    pub fn with_connector(connector: ConnectorAudio) -> Self {
        Self { connector }
    }

    /// Underlying audio connector.
    pub fn connector(&self) -> &ConnectorAudio {
        &self.connector
    }

    fn settings(&self) -> &Settings {
        self.connector.settings()
    }

    /// Waits for a tone near `check.frequency` with at least `check.min_strength`.
    pub fn check_frequency(
        &self,
        context: &str,
        check: &FrequencyCheck,
    ) -> AppResult<WaitOutcome<SignalParameters>> {
        let session = self.connector.session(context, true)?;
        let outcome = session.wait_for(&check.criteria(), check.timeout);
        // keep recording in case the signal was detected early
        thread::sleep(check.post_record);
        session.close()?;
        Ok(outcome)
    }

    /// Waits for `consecutive_matches` silence frames (10 and 30s are the usual values).
    pub fn check_silence(
        &self,
        context: &str,
        consecutive_matches: u32,
        timeout: Duration,
    ) -> AppResult<WaitOutcome<()>> {
        let session = self.connector.session(context, true)?;
        let outcome = session.wait_for_silence(consecutive_matches, timeout);
        session.close()?;
        Ok(outcome)
    }

    /// Waits for `consecutive_matches` new voice frames (5 and 60s are the usual values).
    pub fn check_voice_detection(
        &self,
        context: &str,
        consecutive_matches: u32,
        timeout: Duration,
        post_record: Duration,
    ) -> AppResult<WaitOutcome<VadParameters>> {
        let session = self.connector.session(context, true)?;
        let outcome = session.wait_for_voice(consecutive_matches, timeout);
        thread::sleep(post_record);
        session.close()?;
        Ok(outcome)
    }

    /// Records for `duration` and returns the recording prefix.
    pub fn record_audio_sample(&self, context: &str, duration: Duration) -> AppResult<PathBuf> {
        let session = self.connector.session(context, true)?;
        thread::sleep(duration);
        let prefix = session
            .recording_path()
            .map(PathBuf::from)
            .ok_or(HarnessError::NotConnected)?;
        session.close()?;
        Ok(prefix)
    }

    /// Records `duration` of audio and decides whether it only contains silence.
    ///
    /// `threshold` defaults to the configured silence threshold.
    pub fn verify_silence(
        &self,
        context: &str,
        duration: Duration,
        threshold: Option<u32>,
    ) -> AppResult<SilenceVerdict> {
        let prefix = self.record_audio_sample(context, duration)?;
        info!("Recorded audio file prefix: '{}'", prefix.display());
        let threshold = threshold.unwrap_or(self.settings().analysis.silence_threshold);
        verify_silence_recording(&prefix, self.settings().analysis.trim, threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrequencyPair;

    fn frame(strength: f64, frequency: f64) -> SignalParameters {
        let pair = FrequencyPair::new(frequency, strength);
        SignalParameters {
            timestamp: 1,
            strength,
            main_frequency: pair,
            f1: pair,
            f2: pair,
            f3: pair,
            f4: pair,
        }
    }

    #[test]
    fn test_frequency_check_defaults() {
        let check = FrequencyCheck::new(1000.0);
        assert_eq!(check.deviation, 20.0);
        assert_eq!(check.min_strength, 0.4);
        assert_eq!(check.post_record, Duration::from_secs(2));
    }

    #[test]
    fn test_frequency_criteria_need_both_fields() {
        let criteria = FrequencyCheck::new(1000.0).criteria();
        assert!(criteria.matches(&frame(0.4, 1010.0)));
        assert!(!criteria.matches(&frame(0.39, 1010.0)));
        assert!(!criteria.matches(&frame(0.9, 1020.0)));
    }
}
