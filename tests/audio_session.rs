//! Audio sessions against a loopback stand-in for the phonesimu audio app.
//!
//! The fake app accepts any number of connections, records the commands it
//! receives and, once a recording was requested, writes a silent WAV under the
//! requested prefix and starts streaming the lines produced by its feed.

use parking_lot::Mutex;
use phonesimu_harness::analysis::{AudioAnalyzer, AudioClip, FrequencyCheck};
use phonesimu_harness::config::Settings;
use phonesimu_harness::connector::ConnectorAudio;
use phonesimu_harness::protocol::{FrequencyPair, SignalParameters, VadDecision, VadParameters};
use phonesimu_harness::reader::LinkState;
use phonesimu_harness::WaitOutcome;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type Feed = fn(u64) -> Option<String>;

struct FakeAudioApp {
    port: u16,
    stop: Arc<AtomicBool>,
    commands: Arc<Mutex<Vec<String>>>,
    handle: Option<JoinHandle<()>>,
}

impl FakeAudioApp {
    fn start(feed: Feed) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let port = listener.local_addr().unwrap().port();
        let stop = Arc::new(AtomicBool::new(false));
        let commands = Arc::new(Mutex::new(Vec::new()));
        let recording = Arc::new(AtomicBool::new(false));

        let (thread_stop, thread_commands) = (stop.clone(), commands.clone());
        let handle = thread::spawn(move || {
            let mut workers = Vec::new();
            while !thread_stop.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        let (stop, commands, recording) =
                            (thread_stop.clone(), thread_commands.clone(), recording.clone());
                        workers.push(thread::spawn(move || {
                            serve(stream, feed, &stop, &commands, &recording)
                        }));
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(10))
                    }
                    Err(_) => break,
                }
            }
            for worker in workers {
                let _ = worker.join();
            }
        });

        Self {
            port,
            stop,
            commands,
            handle: Some(handle),
        }
    }

    fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    fn wait_for_command(&self, command: &str) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if self.commands().iter().any(|c| c == command) {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }
}

impl Drop for FakeAudioApp {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn write_silent_recording(prefix: &str) {
    let path = PathBuf::from(format!("{}_2024-Jan-01_00-00-00.wav", prefix));
    AudioClip {
        sample_rate: 8000,
        channels: 2,
        samples: vec![0; 16000],
    }
    .write(&path)
    .unwrap();
}

fn serve(
    mut stream: TcpStream,
    feed: Feed,
    stop: &AtomicBool,
    commands: &Mutex<Vec<String>>,
    recording: &AtomicBool,
) {
    stream.set_nonblocking(false).unwrap();
    stream.set_read_timeout(Some(Duration::from_millis(10))).unwrap();
    let mut pending = Vec::new();
    let mut chunk = [0u8; 1024];
    let mut tick = 0;

    while !stop.load(Ordering::SeqCst) {
        match stream.read(&mut chunk) {
            Ok(0) => return,
            // telnet probes are the only non-ASCII bytes the harness sends
            Ok(n) => pending.extend(chunk[..n].iter().copied().filter(u8::is_ascii)),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(_) => return,
        }

        while let Some(end) = pending.windows(2).position(|w| w == b"\r\n") {
            let line = String::from_utf8_lossy(&pending[..end]).trim().to_string();
            pending.drain(..end + 2);
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix("alsa-micro record ") {
                if let Some(prefix) = rest.split_whitespace().next() {
                    write_silent_recording(prefix);
                    recording.store(true, Ordering::SeqCst);
                }
            }
            commands.lock().push(line);
        }

        if recording.load(Ordering::SeqCst) {
            tick += 1;
            if let Some(line) = feed(tick) {
                if stream.write_all(format!("{}\r\n", line).as_bytes()).is_err() {
                    return;
                }
            }
        }
    }
}

fn settings(port: u16, results: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.application.results_dir = results.to_path_buf();
    settings.phonesimu.audio_port = port;
    settings.phonesimu.connect_timeout = Duration::from_secs(1);
    settings.phonesimu.connect_retries = 1;
    settings.phonesimu.retry_delay = Duration::from_millis(10);
    settings.phonesimu.probe_count = 1;
    settings.phonesimu.probe_interval = Duration::from_millis(1);
    settings.phonesimu.read_timeout = Duration::from_secs(5);
    settings.analysis.alsa_device = Some("hw:9,0".to_string());
    settings.analysis.trim = Duration::ZERO;
    settings
}

fn tone_1000(tick: u64) -> Option<String> {
    let pair = FrequencyPair::new(1000.0, 0.8);
    Some(
        SignalParameters {
            timestamp: tick,
            strength: 0.8,
            main_frequency: pair,
            f1: pair,
            f2: FrequencyPair::new(0.0, 0.0),
            f3: FrequencyPair::new(0.0, 0.0),
            f4: FrequencyPair::new(0.0, 0.0),
        }
        .to_string(),
    )
}

fn vad(decision: VadDecision) -> impl Fn(u64) -> String {
    move |tick| {
        VadParameters {
            timestamp: tick,
            r1: 0.1,
            r2: 0.2,
            decision: decision.clone(),
            simi: 0,
        }
        .to_string()
    }
}

fn vad_silence(tick: u64) -> Option<String> {
    Some(vad(VadDecision::Silence)(tick))
}

fn vad_voice(tick: u64) -> Option<String> {
    Some(vad(VadDecision::Voice)(tick))
}

fn nothing(_tick: u64) -> Option<String> {
    None
}

#[test]
fn test_check_frequency_matches_and_writes_analysis() {
    let app = FakeAudioApp::start(tone_1000);
    let results = tempfile::tempdir().unwrap();
    let analyzer = AudioAnalyzer::new(Arc::new(settings(app.port, results.path())));
    assert!(analyzer.connector().is_started());

    let check = FrequencyCheck {
        timeout: Duration::from_secs(5),
        post_record: Duration::ZERO,
        ..FrequencyCheck::new(1000.0)
    };
    let outcome = analyzer.check_frequency("tone", &check).unwrap();
    let frame = outcome.matched().expect("1000 Hz tone should match");
    assert_eq!(frame.main_frequency.frequency, 1000.0);

    assert!(app.wait_for_command("alsa-micro exit"));
    let commands = app.commands();
    assert!(commands.contains(&"alsa-micro new-alsa-micro hw:9,0 48000".to_string()));
    assert!(commands.contains(&"alsa-micro-recorder exit".to_string()));

    let recordings = results.path().join("phonesimu-recordings");
    assert!(recordings
        .join("audio_analysis")
        .join("tone_recording_2024-Jan-01_00-00-00.png")
        .is_file());
    assert!(recordings
        .join("converted_mono")
        .join("tone_recording_2024-Jan-01_00-00-00_MONO_test.wav")
        .is_file());
    assert!(results.path().join("phonesimu-log-files").is_dir());
}

#[test]
fn test_absent_frequency_times_out() {
    let app = FakeAudioApp::start(tone_1000);
    let results = tempfile::tempdir().unwrap();
    let analyzer = AudioAnalyzer::new(Arc::new(settings(app.port, results.path())));

    let check = FrequencyCheck {
        timeout: Duration::from_millis(500),
        post_record: Duration::ZERO,
        ..FrequencyCheck::new(2000.0)
    };
    let start = Instant::now();
    let outcome = analyzer.check_frequency("absent", &check).unwrap();
    assert_eq!(outcome, WaitOutcome::TimedOut);
    assert!(start.elapsed() < Duration::from_secs(3));
}

#[test]
fn test_check_silence_counts_vad_frames() {
    let app = FakeAudioApp::start(vad_silence);
    let results = tempfile::tempdir().unwrap();
    let analyzer = AudioAnalyzer::new(Arc::new(settings(app.port, results.path())));

    let outcome = analyzer
        .check_silence("quiet", 5, Duration::from_secs(5))
        .unwrap();
    assert_eq!(outcome, WaitOutcome::Matched(()));
}

#[test]
fn test_check_voice_detects_new_voice() {
    let app = FakeAudioApp::start(vad_voice);
    let results = tempfile::tempdir().unwrap();
    let analyzer = AudioAnalyzer::new(Arc::new(settings(app.port, results.path())));

    let outcome = analyzer
        .check_voice_detection("talk", 3, Duration::from_secs(5), Duration::ZERO)
        .unwrap();
    let frame = outcome.matched().expect("voice frames should match");
    assert!(frame.is_new_voice());
}

#[test]
fn test_silence_never_seen_in_voice_stream() {
    let app = FakeAudioApp::start(vad_voice);
    let results = tempfile::tempdir().unwrap();
    let analyzer = AudioAnalyzer::new(Arc::new(settings(app.port, results.path())));

    let outcome = analyzer
        .check_silence("noisy", 3, Duration::from_millis(600))
        .unwrap();
    assert_eq!(outcome, WaitOutcome::TimedOut);
}

#[test]
fn test_verify_silence_of_recording() {
    let app = FakeAudioApp::start(nothing);
    let results = tempfile::tempdir().unwrap();
    let analyzer = AudioAnalyzer::new(Arc::new(settings(app.port, results.path())));

    let verdict = analyzer
        .verify_silence("quiet_room", Duration::from_millis(200), None)
        .unwrap();
    assert!(verdict.is_silence);
    assert_eq!(verdict.peak, 0);
    assert_eq!(verdict.threshold, 85);
}

#[test]
fn test_session_without_simulator_reports_connection_lost() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let results = tempfile::tempdir().unwrap();
    let mut connector = ConnectorAudio::new(Arc::new(settings(port, results.path())));
    assert!(!connector.start());

    let session = connector.session("offline", true).unwrap();
    assert_eq!(session.link_state(), LinkState::Disconnected);
    assert!(session.recording_path().is_none());
    assert!(session.signal_parameters().is_none());
    assert_eq!(
        session.wait_for_silence(3, Duration::from_secs(2)),
        WaitOutcome::ConnectionLost
    );
    assert_eq!(session.close().unwrap(), None);
}
