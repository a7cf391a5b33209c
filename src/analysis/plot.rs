//! Diagnostic waveform and spectrogram images of recordings.
//!
//! The image has two panels: the waveform on top, with dashed lines at plus
//! and minus the silence threshold, and a spectrogram below (time on x,
//! frequency increasing upwards).

use crate::analysis::wav::{find_single_recording, AudioClip};
use crate::error::AppResult;
use image::{Rgb, RgbImage};
use log::{debug, info};
use num_complex::Complex;
use rustfft::FftPlanner;
use std::fs;
use std::path::{Path, PathBuf};

const WIDTH: u32 = 1000;
const PANEL_HEIGHT: u32 = 300;
const GAP: u32 = 12;
const DASH: u32 = 8;

/// Spectrogram FFT size and hop.
pub const SPECTROGRAM_WINDOW: usize = 256;
/// Samples between consecutive spectrogram columns.
pub const SPECTROGRAM_HOP: usize = 128;
/// Dynamic range shown in the spectrogram.
const DB_RANGE: f64 = 80.0;

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const WAVE: Rgb<u8> = Rgb([31, 119, 180]);
const AXIS: Rgb<u8> = Rgb([180, 180, 180]);
const THRESHOLD: Rgb<u8> = Rgb([214, 39, 40]);

/// Files written for one recording.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisArtifacts {
    /// Recording as written by the simulator
    pub recording: PathBuf,
    /// Mono copy used for analysis
    pub mono: PathBuf,
    /// Waveform and spectrogram PNG
    pub image: PathBuf,
    /// Peak absolute amplitude of the whole mono recording
    pub peak: u32,
}

/// Magnitude spectra in dB, one column per hop, `window / 2` bins each.
pub fn spectrogram(samples: &[f64], window: usize, hop: usize) -> Vec<Vec<f64>> {
    if window < 2 || hop == 0 || samples.len() < window {
        return Vec::new();
    }

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(window);
    let hann: Vec<f64> = (0..window)
        .map(|i| 0.5 * (1.0 - (2.0 * std::f64::consts::PI * i as f64 / (window - 1) as f64).cos()))
        .collect();

    let mut columns = Vec::with_capacity((samples.len() - window) / hop + 1);
    let mut buffer = vec![Complex::new(0.0, 0.0); window];
    let mut start = 0;
    while start + window <= samples.len() {
        for (slot, (&s, &w)) in buffer.iter_mut().zip(samples[start..start + window].iter().zip(&hann)) {
            *slot = Complex::new(s * w, 0.0);
        }
        fft.process(&mut buffer);
        let column = buffer[..window / 2]
            .iter()
            .map(|c| {
                let magnitude = c.norm() / window as f64;
                if magnitude > 0.0 {
                    20.0 * magnitude.log10()
                } else {
                    -120.0
                }
            })
            .collect();
        columns.push(column);
        start += hop;
    }
    columns
}

fn colormap(t: f64) -> Rgb<u8> {
    // dark blue -> teal -> yellow
    let stops = [(0.0, [68.0, 1.0, 84.0]), (0.5, [33.0, 145.0, 140.0]), (1.0, [253.0, 231.0, 37.0])];
    let t = t.clamp(0.0, 1.0);
    let (lo, hi) = if t <= 0.5 { (stops[0], stops[1]) } else { (stops[1], stops[2]) };
    let f = (t - lo.0) / (hi.0 - lo.0);
    let mix = |i: usize| (lo.1[i] + (hi.1[i] - lo.1[i]) * f).round() as u8;
    Rgb([mix(0), mix(1), mix(2)])
}

fn draw_vertical(img: &mut RgbImage, x: u32, y0: u32, y1: u32, color: Rgb<u8>) {
    let (top, bottom) = if y0 <= y1 { (y0, y1) } else { (y1, y0) };
    for y in top..=bottom.min(img.height() - 1) {
        img.put_pixel(x, y, color);
    }
}

fn draw_waveform(img: &mut RgbImage, samples: &[i32], threshold: u32) {
    let peak = samples.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0);
    // keep the threshold lines inside the panel
    let scale = f64::from(peak.max(threshold.saturating_mul(2)).max(1));
    let half = f64::from(PANEL_HEIGHT - 1) / 2.0;
    let to_y = |v: f64| (half - v / scale * half).round().clamp(0.0, f64::from(PANEL_HEIGHT - 1)) as u32;

    for x in 0..WIDTH {
        img.put_pixel(x, to_y(0.0), AXIS);
    }

    if !samples.is_empty() {
        let per_column = samples.len() as f64 / f64::from(WIDTH);
        for x in 0..WIDTH {
            let start = (f64::from(x) * per_column) as usize;
            let end = ((f64::from(x + 1) * per_column) as usize).clamp(start + 1, samples.len());
            if start >= samples.len() {
                break;
            }
            let chunk = &samples[start..end];
            let lo = chunk.iter().copied().min().unwrap_or(0);
            let hi = chunk.iter().copied().max().unwrap_or(0);
            draw_vertical(img, x, to_y(f64::from(hi)), to_y(f64::from(lo)), WAVE);
        }
    }

    for level in [f64::from(threshold), -f64::from(threshold)] {
        let y = to_y(level);
        for x in (0..WIDTH).filter(|x| (x / DASH) % 2 == 0) {
            img.put_pixel(x, y, THRESHOLD);
        }
    }
}

fn draw_spectrogram(img: &mut RgbImage, samples: &[i32], y_offset: u32) {
    let signal: Vec<f64> = samples.iter().map(|&s| f64::from(s) / f64::from(i16::MAX)).collect();
    let columns = spectrogram(&signal, SPECTROGRAM_WINDOW, SPECTROGRAM_HOP);
    if columns.is_empty() {
        return;
    }

    let ceiling = columns
        .iter()
        .flat_map(|c| c.iter().copied())
        .fold(f64::NEG_INFINITY, f64::max);
    let floor = ceiling - DB_RANGE;
    let bins = columns[0].len();

    for x in 0..WIDTH {
        let column = &columns[(x as usize * columns.len()) / WIDTH as usize];
        for row in 0..PANEL_HEIGHT {
            // row 0 is the top, i.e. the highest frequency
            let bin = ((PANEL_HEIGHT - 1 - row) as usize * bins) / PANEL_HEIGHT as usize;
            let t = (column[bin] - floor) / DB_RANGE;
            img.put_pixel(x, y_offset + row, colormap(t));
        }
    }
}

/// Renders the two-panel analysis image of a mono clip.
pub fn render_analysis(clip: &AudioClip, threshold: u32) -> RgbImage {
    let mono = clip.to_mono();
    let mut img = RgbImage::from_pixel(WIDTH, PANEL_HEIGHT * 2 + GAP, BACKGROUND);
    draw_waveform(&mut img, &mono.samples, threshold);
    draw_spectrogram(&mut img, &mono.samples, PANEL_HEIGHT + GAP);
    img
}

/// Writes the mono copy and analysis image of the recording matching `prefix`.
///
/// Outputs land next to the recording, in `converted_mono/` and `audio_analysis/`.
pub fn generate_audio_analysis(prefix: &Path, threshold: u32) -> AppResult<AnalysisArtifacts> {
    let recording = find_single_recording(prefix)?;
    let parent = recording.parent().map(Path::to_path_buf).unwrap_or_default();
    let stem = recording
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let analysis_dir = parent.join("audio_analysis");
    let mono_dir = parent.join("converted_mono");
    fs::create_dir_all(&analysis_dir)?;
    fs::create_dir_all(&mono_dir)?;

    let mono = AudioClip::read(&recording)?.to_mono();
    let mono_path = mono_dir.join(format!("{}_MONO_test.wav", stem));
    mono.write(&mono_path)?;
    debug!("Mono copy written to '{}'", mono_path.display());

    let image_path = analysis_dir.join(format!("{}.png", stem));
    render_analysis(&mono, threshold).save(&image_path)?;
    info!("Audio analysis of '{}' written to '{}'", recording.display(), image_path.display());

    Ok(AnalysisArtifacts {
        recording,
        mono: mono_path,
        image: image_path,
        peak: mono.peak_amplitude(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(frequency: f64, rate: u32, seconds: f64, amplitude: f64) -> Vec<i32> {
        let n = (f64::from(rate) * seconds) as usize;
        (0..n)
            .map(|i| {
                let t = i as f64 / f64::from(rate);
                (amplitude * (2.0 * std::f64::consts::PI * frequency * t).sin()).round() as i32
            })
            .collect()
    }

    #[test]
    fn test_spectrogram_peaks_at_tone_bin() {
        let rate = 8000;
        let signal: Vec<f64> = sine(1000.0, rate, 0.5, 10_000.0)
            .into_iter()
            .map(|s| f64::from(s) / 32767.0)
            .collect();
        let columns = spectrogram(&signal, 256, 128);
        assert_eq!(columns.len(), (signal.len() - 256) / 128 + 1);

        let column = &columns[columns.len() / 2];
        assert_eq!(column.len(), 128);
        let peak_bin = column
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        // 1000 Hz / (8000 Hz / 256) = bin 32
        assert_eq!(peak_bin, 32);
    }

    #[test]
    fn test_spectrogram_of_short_signal_is_empty() {
        assert!(spectrogram(&[0.0; 100], 256, 128).is_empty());
    }

    #[test]
    fn test_render_marks_threshold_lines() {
        let clip = AudioClip {
            sample_rate: 8000,
            channels: 1,
            samples: vec![0; 8000],
        };
        let img = render_analysis(&clip, 85);
        assert_eq!(img.dimensions(), (WIDTH, PANEL_HEIGHT * 2 + GAP));
        // silent clip: scale is 2 * threshold, so the lines sit at a quarter and three quarters
        let threshold_rows = (0..PANEL_HEIGHT)
            .filter(|&y| *img.get_pixel(0, y) == THRESHOLD)
            .count();
        assert_eq!(threshold_rows, 2);
    }

    #[test]
    fn test_generate_writes_mono_and_image() {
        let dir = tempfile::tempdir().unwrap();
        let stereo: Vec<i32> = sine(440.0, 8000, 1.0, 3000.0)
            .into_iter()
            .flat_map(|s| [s, s / 2])
            .collect();
        let recording = dir.path().join("ctx_recording_20240101.wav");
        AudioClip {
            sample_rate: 8000,
            channels: 2,
            samples: stereo,
        }
        .write(&recording)
        .unwrap();

        let artifacts = generate_audio_analysis(&dir.path().join("ctx_recording"), 85).unwrap();
        assert_eq!(artifacts.recording, recording);
        assert_eq!(
            artifacts.mono,
            dir.path().join("converted_mono").join("ctx_recording_20240101_MONO_test.wav")
        );
        assert_eq!(
            artifacts.image,
            dir.path().join("audio_analysis").join("ctx_recording_20240101.png")
        );

        let mono = AudioClip::read(&artifacts.mono).unwrap();
        assert_eq!(mono.channels, 1);
        assert_eq!(mono.frames(), 8000);
        let png = image::open(&artifacts.image).unwrap();
        assert_eq!(png.width(), WIDTH);
    }
}
