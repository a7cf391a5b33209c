//! phonesimu - audio and Bluetooth checks against the phonesimu simulator.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};
use phonesimu_harness::analysis::{verify_silence_file, AudioAnalyzer, FrequencyCheck};
use phonesimu_harness::bluetooth::BluetoothServicesSwitcher;
use phonesimu_harness::target::HeadlessTarget;
use phonesimu_harness::{logging, Settings, WaitOutcome};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "phonesimu")]
#[command(about = "Audio and Bluetooth checks against the phonesimu simulator")]
#[command(version)]
struct Cli {
    /// TOML configuration file; PHONESIMU_* variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait for a tone near a frequency
    CheckFrequency {
        #[arg(long)]
        frequency: f64,
        #[arg(long, default_value_t = 20.0)]
        deviation: f64,
        #[arg(long, default_value_t = 0.4)]
        min_strength: f64,
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
        #[arg(long, default_value = "check_frequency")]
        context: String,
    },

    /// Wait for consecutive silence frames
    CheckSilence {
        #[arg(long, default_value_t = 10)]
        frames: u32,
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
        #[arg(long, default_value = "check_silence")]
        context: String,
    },

    /// Wait for consecutive new voice frames
    CheckVoice {
        #[arg(long, default_value_t = 5)]
        frames: u32,
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
        #[arg(long, default_value_t = 2)]
        post_record_secs: u64,
        #[arg(long, default_value = "check_voice")]
        context: String,
    },

    /// Record and check for silence, or check an existing WAV file
    VerifySilence {
        /// Existing recording to check instead of recording a new one
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long, default_value_t = 5)]
        duration_secs: u64,
        /// Peak amplitude threshold, defaults to the configured one
        #[arg(long)]
        threshold: Option<u32>,
        #[arg(long, default_value = "verify_silence")]
        context: String,
    },

    /// Bluetooth entertainment/telephony endurance run
    BtEndurance {
        /// Media source name the device UI shows for Bluetooth audio
        #[arg(long)]
        media_source: String,
        #[arg(long, default_value_t = 1)]
        switches: u32,
        /// Log statistics and fail when a leg measured no latency
        #[arg(long)]
        assess: bool,
        /// Append a row for this lifecycle to the endurance reports
        #[arg(long)]
        lifecycle: Option<u32>,
        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },
}

fn verdict<T>(name: &str, outcome: &WaitOutcome<T>) -> ExitCode {
    match outcome {
        WaitOutcome::Matched(_) => {
            info!("{}: matched", name);
            ExitCode::SUCCESS
        }
        WaitOutcome::TimedOut => {
            error!("{}: timed out", name);
            ExitCode::FAILURE
        }
        WaitOutcome::ConnectionLost => {
            error!("{}: connection to phonesimu lost", name);
            ExitCode::FAILURE
        }
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let settings = Settings::new(cli.config.as_deref()).context("Failed to load configuration")?;
    logging::init(&settings.application.log_level)?;
    let settings = Arc::new(settings);

    match cli.command {
        Commands::CheckFrequency {
            frequency,
            deviation,
            min_strength,
            timeout_secs,
            context,
        } => {
            let analyzer = AudioAnalyzer::new(settings);
            let check = FrequencyCheck {
                deviation,
                min_strength,
                timeout: Duration::from_secs(timeout_secs),
                ..FrequencyCheck::new(frequency)
            };
            let outcome = analyzer
                .check_frequency(&context, &check)
                .context("Frequency check failed")?;
            if let WaitOutcome::Matched(frame) = &outcome {
                info!("Matching frame: {}", frame);
            }
            Ok(verdict("check-frequency", &outcome))
        }
        Commands::CheckSilence {
            frames,
            timeout_secs,
            context,
        } => {
            let analyzer = AudioAnalyzer::new(settings);
            let outcome = analyzer
                .check_silence(&context, frames, Duration::from_secs(timeout_secs))
                .context("Silence check failed")?;
            Ok(verdict("check-silence", &outcome))
        }
        Commands::CheckVoice {
            frames,
            timeout_secs,
            post_record_secs,
            context,
        } => {
            let analyzer = AudioAnalyzer::new(settings);
            let outcome = analyzer
                .check_voice_detection(
                    &context,
                    frames,
                    Duration::from_secs(timeout_secs),
                    Duration::from_secs(post_record_secs),
                )
                .context("Voice check failed")?;
            Ok(verdict("check-voice", &outcome))
        }
        Commands::VerifySilence {
            file,
            duration_secs,
            threshold,
            context,
        } => {
            let verdict = match file {
                Some(path) => {
                    let threshold = threshold.unwrap_or(settings.analysis.silence_threshold);
                    verify_silence_file(&path, settings.analysis.trim, threshold)
                        .with_context(|| format!("Failed to analyse '{}'", path.display()))?
                }
                None => AudioAnalyzer::new(settings)
                    .verify_silence(&context, Duration::from_secs(duration_secs), threshold)
                    .context("Silence verification failed")?,
            };
            println!(
                "{}: peak {} threshold {} silence {}",
                verdict.path.display(),
                verdict.peak,
                verdict.threshold,
                verdict.is_silence
            );
            Ok(if verdict.is_silence {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::BtEndurance {
            media_source,
            switches,
            assess,
            lifecycle,
            json,
        } => {
            let target = Arc::new(HeadlessTarget::new(settings.results_dir()));
            let mut switcher = BluetoothServicesSwitcher::connect(&settings, target)
                .context("Failed to connect to the phonesimu apps")?;
            let outcome = switcher.switch_bluetooth_services(&media_source, switches, assess);
            if let Some(lifecycle) = lifecycle {
                switcher
                    .append_report_rows(lifecycle)
                    .context("Failed to write endurance reports")?;
            }
            if let Err(e) = switcher.ensure_teardown_phonesimu() {
                error!("phonesimu teardown failed: {}", e);
            }
            let report = outcome.context("Bluetooth endurance run failed")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(ExitCode::SUCCESS);
            }
            println!(
                "switches {} entertainment {}/{} incoming {}/{} outgoing {}/{}",
                report.switches,
                report.entertainment.passes,
                report.entertainment.total,
                report.incoming.passes,
                report.incoming.total,
                report.outgoing.passes,
                report.outgoing.total
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}
