//! Parsed phonesimu analysis frames.
//!
//! The simulator's `alsa-micro-analysis` component emits two line families:
//!
//! ```text
//! alsa-micro-analysis signal-analysis <timestamp> 513 <strength> <f0>:<s0> <f1>:<s1> <f2>:<s2> <f3>:<s3> <f4>:<s4>
//! alsa-micro-analysis vad-analysis <timestamp> VAD1:<r1> VAD2:<r2> DECISION:<word> Similarity:<int>
//! ```
//!
//! Both are parsed into immutable records. Lines that do not match the grammar
//! exactly (e.g. integer values where decimals are expected) are not frames.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::fmt;
use std::str::FromStr;

#[allow(clippy::expect_used)]
static SIGNAL_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"^alsa-micro-analysis\ssignal-analysis\s(?P<timestamp>\d+)\s513\s",
        r"(?P<strength>\d+\.\d+)\s(?P<main_frequency>\d+\.\d+:\d+\.\d+)\s",
        r"(?P<f1>\d+\.\d+:\d+\.\d+)\s(?P<f2>\d+\.\d+:\d+\.\d+)\s",
        r"(?P<f3>\d+\.\d+:\d+\.\d+)\s(?P<f4>\d+\.\d+:\d+\.\d+)\s*$"
    ))
    .expect("signal-analysis pattern is valid")
});

#[allow(clippy::expect_used)]
static VAD_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"^alsa-micro-analysis\svad-analysis\s(?P<timestamp>\d+)\s",
        r"VAD1:(?P<r1>\d+\.\d+)\sVAD2:(?P<r2>\d+\.\d+)\s",
        r"DECISION:(?P<decision>[a-z]+)\sSimilarity:(?P<simi>\d+)\s*$"
    ))
    .expect("vad-analysis pattern is valid")
});

/// A `<frequency>:<strength>` pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrequencyPair {
    /// Hz
    pub frequency: f64,
    /// Relative strength in `[0, 1]`
    pub strength: f64,
}

impl FrequencyPair {
    /// Pair of `frequency` and `strength`.
    pub fn new(frequency: f64, strength: f64) -> Self {
        Self { frequency, strength }
    }
}

impl FromStr for FrequencyPair {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (freq, strength) = s
            .split_once(':')
            .ok_or_else(|| format!("missing ':' in frequency pair '{}'", s))?;
        let frequency = freq
            .parse::<f64>()
            .map_err(|e| format!("bad frequency '{}': {}", freq, e))?;
        let strength = strength
            .parse::<f64>()
            .map_err(|e| format!("bad strength '{}': {}", strength, e))?;
        Ok(Self { frequency, strength })
    }
}

impl fmt::Display for FrequencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}:{:.6}", self.frequency, self.strength)
    }
}

/// Addressable fields of a [`SignalParameters`] frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalField {
    /// Simulator timestamp in nanoseconds
    Timestamp,
    /// Overall strength
    Strength,
    /// Dominant frequency
    MainFrequency,
    /// First secondary peak
    F1,
    /// Second secondary peak
    F2,
    /// Third secondary peak
    F3,
    /// Fourth secondary peak
    F4,
}

impl fmt::Display for SignalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalField::Timestamp => "timestamp",
            SignalField::Strength => "strength",
            SignalField::MainFrequency => "main_frequency",
            SignalField::F1 => "f1",
            SignalField::F2 => "f2",
            SignalField::F3 => "f3",
            SignalField::F4 => "f4",
        };
        f.write_str(name)
    }
}

/// Value of one signal field as seen by a matcher.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    /// Nanosecond timestamp
    Timestamp(u64),
    /// Overall strength
    Scalar(f64),
    /// One of the frequency peaks
    Pair(FrequencyPair),
}

/// One `signal-analysis` frame.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalParameters {
    /// Simulator timestamp in nanoseconds
    pub timestamp: u64,
    /// Overall signal strength in `[0, 1]`
    pub strength: f64,
    /// Dominant frequency
    pub main_frequency: FrequencyPair,
    /// First secondary peak
    pub f1: FrequencyPair,
    /// Second secondary peak
    pub f2: FrequencyPair,
    /// Third secondary peak
    pub f3: FrequencyPair,
    /// Fourth secondary peak
    pub f4: FrequencyPair,
}

impl SignalParameters {
    /// Parses a full telnet line, returning `None` when it is not a signal frame.
    pub fn parse(line: &str) -> Option<Self> {
        let caps = SIGNAL_LINE.captures(line)?;
        let pair = |caps: &Captures<'_>, name: &str| caps[name].parse::<FrequencyPair>().ok();
        Some(Self {
            timestamp: caps["timestamp"].parse().ok()?,
            strength: caps["strength"].parse().ok()?,
            main_frequency: pair(&caps, "main_frequency")?,
            f1: pair(&caps, "f1")?,
            f2: pair(&caps, "f2")?,
            f3: pair(&caps, "f3")?,
            f4: pair(&caps, "f4")?,
        })
    }

    /// Value of `field` for matching.
    pub fn field(&self, field: SignalField) -> FieldValue {
        match field {
            SignalField::Timestamp => FieldValue::Timestamp(self.timestamp),
            SignalField::Strength => FieldValue::Scalar(self.strength),
            SignalField::MainFrequency => FieldValue::Pair(self.main_frequency),
            SignalField::F1 => FieldValue::Pair(self.f1),
            SignalField::F2 => FieldValue::Pair(self.f2),
            SignalField::F3 => FieldValue::Pair(self.f3),
            SignalField::F4 => FieldValue::Pair(self.f4),
        }
    }
}

impl fmt::Display for SignalParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "alsa-micro-analysis signal-analysis {} 513 {:.6} {} {} {} {} {}",
            self.timestamp, self.strength, self.main_frequency, self.f1, self.f2, self.f3, self.f4
        )
    }
}

/// Voice activity classification of one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VadDecision {
    /// Speech detected
    Voice,
    /// Nothing above the noise floor
    Silence,
    /// Signal that is not speech
    Noise,
    /// A word the simulator sent that is not one of the known decisions
    Other(String),
}

impl From<&str> for VadDecision {
    fn from(word: &str) -> Self {
        match word {
            "voice" => VadDecision::Voice,
            "silence" => VadDecision::Silence,
            "noise" => VadDecision::Noise,
            other => VadDecision::Other(other.to_string()),
        }
    }
}

impl fmt::Display for VadDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VadDecision::Voice => f.write_str("voice"),
            VadDecision::Silence => f.write_str("silence"),
            VadDecision::Noise => f.write_str("noise"),
            VadDecision::Other(word) => f.write_str(word),
        }
    }
}

/// One `vad-analysis` frame.
#[derive(Debug, Clone, PartialEq)]
pub struct VadParameters {
    /// Simulator timestamp in nanoseconds
    pub timestamp: u64,
    /// First VAD ratio
    pub r1: f64,
    /// Second VAD ratio
    pub r2: f64,
    /// Classification of the frame
    pub decision: VadDecision,
    /// Similarity counter against the previous frame; 0 marks a new match
    pub simi: u32,
}

impl VadParameters {
    /// Parses a full telnet line, returning `None` when it is not a VAD frame.
    pub fn parse(line: &str) -> Option<Self> {
        let caps = VAD_LINE.captures(line)?;
        Some(Self {
            timestamp: caps["timestamp"].parse().ok()?,
            r1: caps["r1"].parse().ok()?,
            r2: caps["r2"].parse().ok()?,
            decision: VadDecision::from(&caps["decision"]),
            simi: caps["simi"].parse().ok()?,
        })
    }

    /// `true` for a silence decision.
    pub fn is_silence(&self) -> bool {
        self.decision == VadDecision::Silence
    }

    /// A voice frame that is not a repeat of the previous match.
    pub fn is_new_voice(&self) -> bool {
        self.decision == VadDecision::Voice && self.simi == 0
    }
}

impl fmt::Display for VadParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "alsa-micro-analysis vad-analysis {} VAD1:{:.6} VAD2:{:.6} DECISION:{} Similarity:{}",
            self.timestamp, self.r1, self.r2, self.decision, self.simi
        )
    }
}

/// A line classified by the reader.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// `signal-analysis` line
    Signal(SignalParameters),
    /// `vad-analysis` line
    Vad(VadParameters),
}

impl Frame {
    /// Classifies a line; the two grammars never overlap.
    pub fn classify(line: &str) -> Option<Self> {
        if let Some(signal) = SignalParameters::parse(line) {
            return Some(Frame::Signal(signal));
        }
        VadParameters::parse(line).map(Frame::Vad)
    }
}
