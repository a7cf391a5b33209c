//! Recorded WAV handling: lookup by prefix, mono conversion and silence verdicts.
//!
//! Samples are held interleaved on a 16-bit scale whatever the file's bit depth,
//! so amplitude thresholds mean the same thing for every recording.

use crate::error::{AppResult, HarnessError};
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns the only `<prefix>*.wav` file, failing on zero or several matches.
///
/// The recorder appends a timestamp to the prefix, so the exact name is unknown.
pub fn find_single_recording(prefix: &Path) -> AppResult<PathBuf> {
    let dir = match prefix.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let stem = prefix
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut found = Vec::new();
    if dir.is_dir() {
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let name = match path.file_name() {
                Some(name) => name.to_string_lossy().into_owned(),
                None => continue,
            };
            if path.is_file() && name.starts_with(&stem) && name.ends_with(".wav") {
                found.push(path);
            }
        }
    }
    found.sort();

    if found.len() != 1 {
        return Err(HarnessError::AmbiguousRecording {
            prefix: prefix.to_path_buf(),
            found,
        });
    }
    Ok(found.remove(0))
}

/// Decoded PCM audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    /// Frames per second
    pub sample_rate: u32,
    /// Interleaved channel count
    pub channels: u16,
    /// Interleaved samples on a 16-bit scale
    pub samples: Vec<i32>,
}

impl AudioClip {
    /// Decodes a WAV file, scaling every sample format to 16 bits.
    pub fn read(path: &Path) -> AppResult<Self> {
        let mut reader = hound::WavReader::open(path)?;
        let spec = reader.spec();
        let samples = match spec.sample_format {
            hound::SampleFormat::Int => {
                let bits = u32::from(spec.bits_per_sample);
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| to_16_bit_scale(v, bits)))
                    .collect::<Result<Vec<_>, _>>()?
            }
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .map(|s| s.map(|v| (f64::from(v) * f64::from(i16::MAX)).round() as i32))
                .collect::<Result<Vec<_>, _>>()?,
        };
        debug!(
            "Read {} samples ({} channel(s), {} Hz, {} bit) from '{}'",
            samples.len(),
            spec.channels,
            spec.sample_rate,
            spec.bits_per_sample,
            path.display()
        );
        Ok(Self {
            sample_rate: spec.sample_rate,
            channels: spec.channels.max(1),
            samples,
        })
    }

    /// Writes 16-bit PCM.
    pub fn write(&self, path: &Path) -> AppResult<()> {
        let spec = hound::WavSpec {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec)?;
        for &sample in &self.samples {
            writer.write_sample(sample.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16)?;
        }
        writer.finalize()?;
        Ok(())
    }

    /// Number of frames across all channels.
    pub fn frames(&self) -> usize {
        self.samples.len() / usize::from(self.channels)
    }

    /// Playback length.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / f64::from(self.sample_rate))
    }

    /// Averages all channels into one.
    pub fn to_mono(&self) -> AudioClip {
        if self.channels == 1 {
            return self.clone();
        }
        let channels = usize::from(self.channels);
        let samples = self
            .samples
            .chunks_exact(channels)
            .map(|frame| {
                let sum: i64 = frame.iter().map(|&s| i64::from(s)).sum();
                (sum / channels as i64) as i32
            })
            .collect();
        AudioClip {
            sample_rate: self.sample_rate,
            channels: 1,
            samples,
        }
    }

    /// Drops the leading `duration` of audio.
    pub fn trim_start(&self, duration: Duration) -> AudioClip {
        let frames = (duration.as_secs_f64() * f64::from(self.sample_rate)).round() as usize;
        let skip = (frames * usize::from(self.channels)).min(self.samples.len());
        AudioClip {
            sample_rate: self.sample_rate,
            channels: self.channels,
            samples: self.samples[skip..].to_vec(),
        }
    }

    /// Peak absolute amplitude over all channels; 0 for an empty clip.
    pub fn peak_amplitude(&self) -> u32 {
        self.samples.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0)
    }
}

fn to_16_bit_scale(value: i32, bits: u32) -> i32 {
    match bits.cmp(&16) {
        std::cmp::Ordering::Equal => value,
        std::cmp::Ordering::Less => value << (16 - bits),
        std::cmp::Ordering::Greater => value >> (bits - 16),
    }
}

/// Silence classification of one recording.
#[derive(Debug, Clone, PartialEq)]
pub struct SilenceVerdict {
    /// Recording that was checked
    pub path: PathBuf,
    /// Peak absolute amplitude after the trimmed start
    pub peak: u32,
    /// Maximum amplitude still counted as silence
    pub threshold: u32,
    /// `peak <= threshold`
    pub is_silence: bool,
}

/// Classifies a WAV file as silent when its peak after `trim` is at most `threshold`.
pub fn verify_silence_file(path: &Path, trim: Duration, threshold: u32) -> AppResult<SilenceVerdict> {
    let clip = AudioClip::read(path)?;
    let peak = clip.trim_start(trim).peak_amplitude();
    let is_silence = peak <= threshold;
    info!(
        "Analyzing silence on audio file: '{}' Max amplitude: {}, Found silence: {}",
        path.display(),
        peak,
        is_silence
    );
    Ok(SilenceVerdict {
        path: path.to_path_buf(),
        peak,
        threshold,
        is_silence,
    })
}

/// Locates the single recording for `prefix` and classifies it.
pub fn verify_silence_recording(prefix: &Path, trim: Duration, threshold: u32) -> AppResult<SilenceVerdict> {
    let path = find_single_recording(prefix)?;
    verify_silence_file(&path, trim, threshold)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 8000;

    fn write_clip(path: &Path, loud_secs: u32, quiet_secs: u32, quiet_peak: i16) {
        let mut samples = Vec::new();
        for i in 0..loud_secs * RATE {
            samples.push(if i % 2 == 0 { 12_000 } else { -12_000 });
        }
        for i in 0..quiet_secs * RATE {
            samples.push(match i % 4 {
                0 => i32::from(quiet_peak),
                2 => -i32::from(quiet_peak) + 1,
                _ => 0,
            });
        }
        AudioClip {
            sample_rate: RATE,
            channels: 1,
            samples,
        }
        .write(path)
        .unwrap();
    }

    #[test]
    fn test_peak_exactly_at_threshold_is_silence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("at.wav");
        write_clip(&path, 2, 3, 85);

        let verdict = verify_silence_file(&path, Duration::from_secs(2), 85).unwrap();
        assert_eq!(verdict.peak, 85);
        assert!(verdict.is_silence);
    }

    #[test]
    fn test_peak_one_above_threshold_is_not_silence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("above.wav");
        write_clip(&path, 2, 3, 86);

        let verdict = verify_silence_file(&path, Duration::from_secs(2), 85).unwrap();
        assert_eq!(verdict.peak, 86);
        assert!(!verdict.is_silence);
    }

    #[test]
    fn test_untrimmed_transient_would_fail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transient.wav");
        write_clip(&path, 2, 1, 10);

        let verdict = verify_silence_file(&path, Duration::ZERO, 85).unwrap();
        assert_eq!(verdict.peak, 12_000);
        assert!(!verdict.is_silence);
    }

    #[test]
    fn test_single_recording_is_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctx_recording_2024-01-01.wav");
        write_clip(&path, 0, 1, 0);
        fs::write(dir.path().join("ctx_recording.log"), "not audio").unwrap();
        fs::write(dir.path().join("other_recording.wav"), "not audio").unwrap();

        let prefix = dir.path().join("ctx_recording");
        assert_eq!(find_single_recording(&prefix).unwrap(), path);
        assert!(verify_silence_recording(&prefix, Duration::ZERO, 85).unwrap().is_silence);
    }

    #[test]
    fn test_two_recordings_fail_before_decoding() {
        let dir = tempfile::tempdir().unwrap();
        // not valid WAV data: decoding would fail with a different error
        fs::write(dir.path().join("ctx_recording_1.wav"), "junk").unwrap();
        fs::write(dir.path().join("ctx_recording_2.wav"), "junk").unwrap();

        let err = verify_silence_recording(&dir.path().join("ctx_recording"), Duration::from_secs(2), 85)
            .unwrap_err();
        match err {
            HarnessError::AmbiguousRecording { found, .. } => assert_eq!(found.len(), 2),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_no_recording_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = find_single_recording(&dir.path().join("missing")).unwrap_err();
        assert!(matches!(err, HarnessError::AmbiguousRecording { ref found, .. } if found.is_empty()));
    }

    #[test]
    fn test_to_mono_averages_channels() {
        let stereo = AudioClip {
            sample_rate: RATE,
            channels: 2,
            samples: vec![100, 300, -50, -150, 7, 7],
        };
        let mono = stereo.to_mono();
        assert_eq!(mono.channels, 1);
        assert_eq!(mono.samples, vec![200, -100, 7]);
        assert_eq!(mono.frames(), 3);
    }

    #[test]
    fn test_bit_depth_normalisation() {
        assert_eq!(to_16_bit_scale(85 << 8, 24), 85);
        assert_eq!(to_16_bit_scale(-1, 8), -256);
        assert_eq!(to_16_bit_scale(1234, 16), 1234);
    }
}
