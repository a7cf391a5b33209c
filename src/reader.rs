//! Background reader for the phonesimu audio analysis stream.
//!
//! [`PhoneSimuReader`] owns the telnet session to the audio app and one thread
//! that classifies every line. Results are published on a [`FrameBus`]:
//!
//! - signal frames overwrite a single latest slot (last-write-wins), waking any
//!   waiter blocked on it;
//! - VAD frames are queued FIFO so every frame is observed once, in order.
//!
//! Each non-empty line is also written to a per-session transcript file.

use crate::config::Settings;
use crate::error::AppResult;
use crate::protocol::{Frame, ReadEvent, SignalParameters, TelnetSession, VadParameters};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex, RwLock};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Connection state of the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No telnet link, or the link was lost
    Disconnected,
    /// Frames are being read
    Connected,
}

/// Result of a VAD queue pop.
#[derive(Debug, Clone, PartialEq)]
pub enum VadPoll {
    /// Oldest queued frame
    Frame(VadParameters),
    /// Nothing arrived before the timeout
    Empty,
    /// The queue is empty and the reader is no longer connected
    Closed,
}

#[derive(Debug, Default)]
struct LatestSignal {
    frame: Option<SignalParameters>,
    generation: u64,
}

struct BusInner {
    latest: Mutex<LatestSignal>,
    fresh: Condvar,
    vad_tx: Sender<VadParameters>,
    vad_rx: Receiver<VadParameters>,
    state: RwLock<LinkState>,
}

/// Shared publication point between the reader thread and waiters.
#[derive(Clone)]
pub struct FrameBus {
    inner: Arc<BusInner>,
}

impl Default for FrameBus {
    fn default() -> Self {
        Self::new(LinkState::Disconnected)
    }
}

impl FrameBus {
    /// Empty bus in `state`.
    pub fn new(state: LinkState) -> Self {
        let (vad_tx, vad_rx) = unbounded();
        Self {
            inner: Arc::new(BusInner {
                latest: Mutex::new(LatestSignal::default()),
                fresh: Condvar::new(),
                vad_tx,
                vad_rx,
                state: RwLock::new(state),
            }),
        }
    }

    /// Current link state.
    pub fn link_state(&self) -> LinkState {
        *self.inner.state.read()
    }

    /// Updates the link state; a disconnect wakes every waiter.
    pub fn set_link_state(&self, state: LinkState) {
        *self.inner.state.write() = state;
        if state == LinkState::Disconnected {
            // hold the slot lock so a waiter between its check and its wait is not missed
            let _latest = self.inner.latest.lock();
            self.inner.fresh.notify_all();
        }
    }

    /// Classifies one line and publishes the frame it carries, if any.
    pub fn dispatch_line(&self, line: &str) -> Option<Frame> {
        let frame = Frame::classify(line)?;
        match &frame {
            Frame::Signal(signal) => self.publish_signal(signal.clone()),
            Frame::Vad(vad) => self.push_vad(vad.clone()),
        }
        Some(frame)
    }

    /// Replaces the latest signal frame and wakes waiters.
    pub fn publish_signal(&self, signal: SignalParameters) {
        let mut latest = self.inner.latest.lock();
        latest.frame = Some(signal);
        latest.generation += 1;
        self.inner.fresh.notify_all();
    }

    /// Queues a VAD frame.
    pub fn push_vad(&self, vad: VadParameters) {
        // the bus holds the receiver, so the channel cannot be disconnected
        if let Err(e) = self.inner.vad_tx.send(vad) {
            warn!("VAD frame dropped: {}", e);
        }
    }

    /// Latest signal frame, whatever the link state.
    pub fn latest_signal(&self) -> Option<SignalParameters> {
        self.inner.latest.lock().frame.clone()
    }

    /// Latest frame together with its generation counter.
    pub fn snapshot(&self) -> (Option<SignalParameters>, u64) {
        let latest = self.inner.latest.lock();
        (latest.frame.clone(), latest.generation)
    }

    /// Blocks until a frame newer than `seen` is published or `timeout` elapses.
    ///
    /// Returns early when the link drops.
    pub fn wait_newer(&self, seen: u64, timeout: Duration) -> (Option<SignalParameters>, u64) {
        let deadline = Instant::now() + timeout;
        let mut latest = self.inner.latest.lock();
        while latest.generation == seen && self.link_state() == LinkState::Connected {
            if self.inner.fresh.wait_until(&mut latest, deadline).timed_out() {
                break;
            }
        }
        (latest.frame.clone(), latest.generation)
    }

    /// Pops the next VAD frame, blocking up to `timeout`.
    pub fn next_vad_frame(&self, timeout: Duration) -> VadPoll {
        match self.inner.vad_rx.recv_timeout(timeout) {
            Ok(vad) => VadPoll::Frame(vad),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                if self.link_state() == LinkState::Disconnected && self.inner.vad_rx.is_empty() {
                    VadPoll::Closed
                } else {
                    VadPoll::Empty
                }
            }
        }
    }

    /// Drops pending VAD frames, returning how many were discarded.
    pub fn clear_vad(&self) -> usize {
        self.inner.vad_rx.try_iter().count()
    }

    /// Number of queued VAD frames.
    pub fn pending_vad(&self) -> usize {
        self.inner.vad_rx.len()
    }
}

/// Transcript file of one reader session.
pub struct Transcript {
    path: PathBuf,
    out: BufWriter<File>,
}

impl Transcript {
    /// Creates `<results>/phonesimu-log-files/<context>_phonesimu_reader_<timestamp>.log`.
    pub fn create(results_dir: &Path, context: &str) -> AppResult<Self> {
        let dir = results_dir.join("phonesimu-log-files");
        if !dir.exists() {
            debug!("Creating log directory '{}'", dir.display());
            fs::create_dir_all(&dir)?;
        }
        let stamp = chrono::Local::now().format("%Y%b%d_%H-%M-%S");
        let path = dir.join(format!("{}_phonesimu_reader_{}.log", context, stamp));
        let out = BufWriter::new(File::create(&path)?);
        Ok(Self { path, out })
    }

    /// Location of the transcript.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a timestamped line.
    pub fn record(&mut self, line: &str) -> std::io::Result<()> {
        let stamp = chrono::Local::now().format("%a %b %e %H:%M:%S %Y");
        writeln!(self.out, "{} {}", stamp, line)
    }

    /// Flushes buffered lines to disk.
    pub fn flush(&mut self) -> std::io::Result<()> {
        self.out.flush()
    }
}

/// Telnet line reader with its own thread.
pub struct PhoneSimuReader {
    bus: FrameBus,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    transcript_path: PathBuf,
}

impl PhoneSimuReader {
    /// Connects to the audio app and starts the reader thread.
    ///
    /// A failed connection is logged and leaves the reader `Disconnected`; it is not
    /// an error. Only failing to create the transcript file is.
    pub fn start(settings: &Settings, context: &str) -> AppResult<Self> {
        let transcript = Transcript::create(settings.results_dir(), context)?;
        let transcript_path = transcript.path().to_path_buf();
        let bus = FrameBus::new(LinkState::Disconnected);
        let stop = Arc::new(AtomicBool::new(false));

        let session = match TelnetSession::connect(&settings.phonesimu, settings.phonesimu.audio_port) {
            Ok(session) => session,
            Err(e) => {
                error!("PhoneSimuReader cannot connect to phonesimu audio app: {}", e);
                return Ok(Self {
                    bus,
                    stop,
                    handle: None,
                    transcript_path,
                });
            }
        };

        info!("Telnet connection with phonesimu audio app {} established", session.peer());
        bus.set_link_state(LinkState::Connected);

        let thread_bus = bus.clone();
        let thread_stop = stop.clone();
        let read_timeout = settings.phonesimu.read_timeout;
        let spawned = thread::Builder::new()
            .name("phonesimu-reader".to_string())
            .spawn(move || run(session, transcript, thread_bus, thread_stop, read_timeout));

        let handle = match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                bus.set_link_state(LinkState::Disconnected);
                return Err(e.into());
            }
        };

        Ok(Self {
            bus,
            stop,
            handle,
            transcript_path,
        })
    }

    /// Bus the reader publishes to.
    pub fn bus(&self) -> &FrameBus {
        &self.bus
    }

    /// Current link state.
    pub fn link_state(&self) -> LinkState {
        self.bus.link_state()
    }

    /// Path of the session transcript.
    pub fn transcript_path(&self) -> &Path {
        &self.transcript_path
    }

    /// Raises the stop flag, joins the thread and drains the VAD queue.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            debug!("Joining phonesimu reader thread");
            if handle.join().is_err() {
                error!("phonesimu reader thread panicked");
            }
        }
        self.bus.set_link_state(LinkState::Disconnected);
        let dropped = self.bus.clear_vad();
        if dropped > 0 {
            debug!("Discarded {} pending VAD frames", dropped);
        }
    }
}

impl Drop for PhoneSimuReader {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    mut session: TelnetSession,
    mut transcript: Transcript,
    bus: FrameBus,
    stop: Arc<AtomicBool>,
    read_timeout: Duration,
) {
    while !stop.load(Ordering::SeqCst) {
        match session.read_line(read_timeout, &stop) {
            Ok(ReadEvent::Line(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                if let Err(e) = transcript.record(&line) {
                    warn!("Failed to write transcript {}: {}", transcript.path().display(), e);
                }
                bus.dispatch_line(&line);
            }
            Ok(ReadEvent::TimedOut) => {
                warn!("No data from phonesimu audio app for {:?}", read_timeout);
            }
            Ok(ReadEvent::Stopped) => break,
            Ok(ReadEvent::Closed) => {
                error!("phonesimu audio app closed the connection");
                break;
            }
            Err(e) => {
                error!("Reading from phonesimu audio app failed: {}", e);
                break;
            }
        }
    }

    if let Err(e) = transcript.flush() {
        warn!("Failed to flush transcript {}: {}", transcript.path().display(), e);
    }
    session.shutdown();
    bus.set_link_state(LinkState::Disconnected);
    debug!("Telnet connection with phonesimu audio app closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::VadDecision;

    fn vad(timestamp: u64) -> VadParameters {
        VadParameters {
            timestamp,
            r1: 0.1,
            r2: 0.2,
            decision: VadDecision::Silence,
            simi: 0,
        }
    }

    #[test]
    fn test_dispatch_routes_frames() {
        let bus = FrameBus::new(LinkState::Connected);
        bus.dispatch_line("alsa-micro-analysis signal-analysis 5 513 0.5 1000.0:0.9 1.0:0.1 2.0:0.1 3.0:0.1 4.0:0.1");
        bus.dispatch_line("alsa-micro-analysis vad-analysis 6 VAD1:0.1 VAD2:0.2 DECISION:silence Similarity:0");
        bus.dispatch_line("unrelated chatter");

        assert_eq!(bus.latest_signal().map(|s| s.timestamp), Some(5));
        assert_eq!(bus.pending_vad(), 1);
    }

    #[test]
    fn test_latest_slot_is_last_write_wins() {
        let bus = FrameBus::new(LinkState::Connected);
        let line = |ts: u64| {
            format!("alsa-micro-analysis signal-analysis {} 513 0.5 1000.0:0.9 1.0:0.1 2.0:0.1 3.0:0.1 4.0:0.1", ts)
        };
        for ts in 1..=3 {
            bus.dispatch_line(&line(ts));
        }
        let (frame, generation) = bus.snapshot();
        assert_eq!(frame.map(|s| s.timestamp), Some(3));
        assert_eq!(generation, 3);
    }

    #[test]
    fn test_vad_queue_is_fifo() {
        let bus = FrameBus::new(LinkState::Connected);
        for ts in [3, 1, 2] {
            bus.push_vad(vad(ts));
        }
        let order: Vec<u64> = (0..3)
            .map(|_| match bus.next_vad_frame(Duration::from_millis(10)) {
                VadPoll::Frame(v) => v.timestamp,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(order, vec![3, 1, 2]);
        assert_eq!(bus.next_vad_frame(Duration::from_millis(10)), VadPoll::Empty);
    }

    #[test]
    fn test_disconnected_bus_reports_closed_after_drain() {
        let bus = FrameBus::new(LinkState::Disconnected);
        bus.push_vad(vad(1));
        assert!(matches!(bus.next_vad_frame(Duration::from_millis(10)), VadPoll::Frame(_)));
        assert_eq!(bus.next_vad_frame(Duration::from_millis(10)), VadPoll::Closed);
    }

    #[test]
    fn test_wait_newer_wakes_on_publish() {
        let bus = FrameBus::new(LinkState::Connected);
        let publisher = bus.clone();
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            publisher.dispatch_line(
                "alsa-micro-analysis signal-analysis 9 513 0.5 1000.0:0.9 1.0:0.1 2.0:0.1 3.0:0.1 4.0:0.1",
            );
        });
        let start = Instant::now();
        let (frame, generation) = bus.wait_newer(0, Duration::from_secs(5));
        worker.join().unwrap();
        assert_eq!(generation, 1);
        assert_eq!(frame.map(|s| s.timestamp), Some(9));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_transcript_lines_are_timestamped() {
        let dir = tempfile::tempdir().unwrap();
        let mut transcript = Transcript::create(dir.path(), "ctx").unwrap();
        transcript.record("hello phonesimu").unwrap();
        transcript.flush().unwrap();

        let name = transcript.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("ctx_phonesimu_reader_"));
        assert!(transcript.path().parent().unwrap().ends_with("phonesimu-log-files"));
        let content = fs::read_to_string(transcript.path()).unwrap();
        assert!(content.trim_end().ends_with(" hello phonesimu"));
    }
}
