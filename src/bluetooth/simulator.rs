//! Multiplexed connection to the phonesimu audio, AVRCP and HFP apps.
//!
//! [`PhoneSimuHandler`] owns one comm thread that reads every connection,
//! folds the messages into a shared [`SimulatorSnapshot`] and writes the
//! queued outbound text. The switching loop only sees the [`SimulatorLink`]
//! trait so it can be driven by a scripted simulator in tests.

use crate::config::Settings;
use crate::error::{AppResult, HarnessError};
use crate::protocol::telnet::connect_with_retries;
use crate::protocol::{Command, Connection, IacFilter, LineBuffer};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const READ_SLICE: Duration = Duration::from_millis(10);
const IDLE_SLEEP: Duration = Duration::from_millis(100);
/// Signal analysis frames below this sample count are not trusted.
const MIN_SAMPLE_COUNT: u32 = 513;
const MIN_SIGNAL_STRENGTH: f64 = 0.01;
const NANOS_PER_SEC: f64 = 1e9;

/// Frequency measured by one of the simulator's analysers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeasuredSignal {
    /// Main frequency in Hz
    pub frequency: f64,
    /// Seconds, from the simulator's nanosecond timestamp
    pub time: f64,
    /// Set on every new measurement
    pub updated: bool,
}

/// Tone the simulator is generating.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayedSignal {
    /// Generated frequency in Hz
    pub frequency: f64,
    /// Seconds at which generation started
    pub time: f64,
}

/// Cellular side of a call as seen by the simulator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhoneState {
    /// Tone played on the call
    pub frequency: f64,
    /// Seconds at which the tone started
    pub time: f64,
    /// Last `+CIEV: 2,<d>` call indicator, `"1"` while a call is up
    pub status: String,
    /// Set on every call indicator
    pub updated: bool,
}

/// Remote-control state of the media player.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AvrcpState {
    /// Playback mode as reported, e.g. `Playing`
    pub status: String,
    /// Bluetooth address of the AVRCP client
    pub addr: String,
    /// Set on every status report
    pub updated: bool,
}

/// Everything the simulator has reported so far.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulatorSnapshot {
    /// Analysis of what the device plays into the simulator microphone
    pub micro: MeasuredSignal,
    /// Analysis of the SCO audio coming from the device
    pub sco: MeasuredSignal,
    /// Call state and tone
    pub phone: PhoneState,
    /// Tone played towards the device speaker path
    pub speaker: PlayedSignal,
    /// Tone streamed over A2DP
    pub entertainment: PlayedSignal,
    /// Media player state
    pub avrcp: AvrcpState,
    /// Bluetooth address of the HFP client
    pub hfp_cli_addr: String,
}

type Callback = fn(&mut SimulatorSnapshot, &Captures<'_>);

const NUM: &str = r"[-+]?[0-9]*\.?[0-9]+";

fn signal_analysis_pattern(source: &str) -> String {
    format!(
        r"{} signal-analysis (\d+) (\d+) ({n}) ({n}):({n})",
        source,
        n = NUM
    )
}

fn signal_parameters_pattern(source: &str) -> String {
    format!(r"{} signal-parameters (\d+) ({n}) ({n})", source, n = NUM)
}

#[allow(clippy::expect_used)]
static CALLBACKS: Lazy<Vec<(Regex, Callback)>> = Lazy::new(|| {
    let table: Vec<(String, Callback)> = vec![
        (signal_analysis_pattern("alsa-micro-analysis"), on_micro_analysis as Callback),
        (signal_analysis_pattern("sco-audio-analysis"), on_sco_analysis as Callback),
        (r"BT: IND: \+CIEV: 2,(\d)".to_string(), on_call_status as Callback),
        (signal_parameters_pattern("sco-audio"), on_phone_parameters as Callback),
        (signal_parameters_pattern("alsa-speaker"), on_speaker_parameters as Callback),
        (signal_parameters_pattern("a2dp-source"), on_entertainment_parameters as Callback),
        (r"PLAY: STATUS: MODE: (\w+)".to_string(), on_playback_mode as Callback),
        (r" playback-status ".to_string(), on_playback_status as Callback),
        (r"TST: HF: Connected to (.*)".to_string(), on_hfp_connected as Callback),
        (r"PLAY: CT: Connected to (.*)".to_string(), on_avrcp_connected as Callback),
    ];
    table
        .into_iter()
        .map(|(pattern, callback)| {
            (
                Regex::new(&pattern).expect("simulator message pattern is valid"),
                callback,
            )
        })
        .collect()
});

fn parse<T: std::str::FromStr + Default>(caps: &Captures<'_>, group: usize) -> T {
    caps.get(group)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or_default()
}

fn measure(signal: &mut MeasuredSignal, caps: &Captures<'_>) {
    let timestamp: u64 = parse(caps, 1);
    let count: u32 = parse(caps, 2);
    let frequency: f64 = parse(caps, 4);
    let strength: f64 = parse(caps, 5);
    if count >= MIN_SAMPLE_COUNT && frequency != signal.frequency && strength > MIN_SIGNAL_STRENGTH {
        signal.time = timestamp as f64 / NANOS_PER_SEC;
        signal.frequency = frequency;
        signal.updated = true;
    }
}

/// Updates `frequency` and `time` only when the frequency changed.
fn played(frequency_slot: &mut f64, time_slot: &mut f64, caps: &Captures<'_>) {
    let timestamp: u64 = parse(caps, 1);
    let frequency: f64 = parse(caps, 3);
    if frequency != *frequency_slot {
        *time_slot = timestamp as f64 / NANOS_PER_SEC;
        *frequency_slot = frequency;
    }
}

fn on_micro_analysis(state: &mut SimulatorSnapshot, caps: &Captures<'_>) {
    measure(&mut state.micro, caps);
}

fn on_sco_analysis(state: &mut SimulatorSnapshot, caps: &Captures<'_>) {
    measure(&mut state.sco, caps);
}

fn on_call_status(state: &mut SimulatorSnapshot, caps: &Captures<'_>) {
    state.phone.status = caps[1].to_string();
    state.phone.updated = true;
}

fn on_phone_parameters(state: &mut SimulatorSnapshot, caps: &Captures<'_>) {
    played(&mut state.phone.frequency, &mut state.phone.time, caps);
}

fn on_speaker_parameters(state: &mut SimulatorSnapshot, caps: &Captures<'_>) {
    played(&mut state.speaker.frequency, &mut state.speaker.time, caps);
}

fn on_entertainment_parameters(state: &mut SimulatorSnapshot, caps: &Captures<'_>) {
    played(&mut state.entertainment.frequency, &mut state.entertainment.time, caps);
}

fn on_playback_mode(state: &mut SimulatorSnapshot, caps: &Captures<'_>) {
    state.avrcp.status = caps[1].to_string();
    state.avrcp.updated = true;
}

fn on_playback_status(_state: &mut SimulatorSnapshot, caps: &Captures<'_>) {
    debug!("Playback status: {}", &caps[0]);
}

fn on_hfp_connected(state: &mut SimulatorSnapshot, caps: &Captures<'_>) {
    state.hfp_cli_addr = caps[1].trim().to_string();
}

fn on_avrcp_connected(state: &mut SimulatorSnapshot, caps: &Captures<'_>) {
    state.avrcp.addr = caps[1].trim().to_string();
}

impl SimulatorSnapshot {
    /// Applies the first callback whose pattern matches `message`.
    ///
    /// Returns `false` when no pattern matched.
    pub fn apply_message(&mut self, message: &str) -> bool {
        for (pattern, callback) in CALLBACKS.iter() {
            if let Some(caps) = pattern.captures(message) {
                callback(self, &caps);
                return true;
            }
        }
        false
    }

    /// Lowers every `updated` flag.
    pub fn clear_updated(&mut self) {
        self.micro.updated = false;
        self.sco.updated = false;
        self.phone.updated = false;
        self.avrcp.updated = false;
    }
}

/// Access to the Bluetooth side of the simulator.
pub trait SimulatorLink: Send {
    /// Starts the communication thread.
    fn start(&mut self) -> AppResult<()>;

    /// `true` once started and until stopped.
    fn is_started(&self) -> bool;

    /// Copy of the simulator state; with `refresh` the `updated` flags are
    /// cleared after the copy is taken.
    fn get_data(&self, refresh: bool) -> AppResult<SimulatorSnapshot>;

    /// Queues a raw line for one of the apps.
    fn send_data(&self, connection: Connection, text: &str) -> AppResult<()>;

    /// Queues `command` for the app it belongs to.
    fn send_command(&self, command: &Command) -> AppResult<()> {
        self.send_data(command.connection(), &command.wire())
    }

    /// Stops the communication thread and flushes the transcript.
    fn stop(&mut self);
}

/// Connects to one simulator app, retrying on failure.
pub fn connect_to_app(settings: &Settings, connection: Connection) -> AppResult<TcpStream> {
    let phonesimu = &settings.phonesimu;
    let stream = connect_with_retries(
        &phonesimu.host,
        connection.port(phonesimu),
        phonesimu.connect_timeout,
        phonesimu.connect_retries,
        phonesimu.retry_delay,
    )?;
    info!("Connected to the phonesimu {} app", connection);
    Ok(stream)
}

/// Applies the ALSA mixer levels the audio box needs for the endurance test.
pub fn set_alsa_mixer_config() {
    let settings: [&[&str]; 3] = [
        &["-D", "default", "set", "Mic", "80%"],
        &["-D", "default", "set", "PCM", "80%"],
        &["-D", "default", "set", "AUto Gain Control", "Disabled"],
    ];
    for args in settings {
        match std::process::Command::new("amixer").args(args).output() {
            Ok(output) if output.status.success() => debug!("amixer {} applied", args.join(" ")),
            Ok(output) => warn!("amixer {} exited with {}", args.join(" "), output.status),
            Err(e) => warn!("Failed to run amixer: {}", e),
        }
    }
}

struct ChannelIo {
    connection: Connection,
    stream: TcpStream,
    filter: IacFilter,
    lines: LineBuffer,
    outbound: Receiver<String>,
    open: bool,
}

/// [`SimulatorLink`] over the three simulator telnet apps.
pub struct PhoneSimuHandler {
    pending: Option<Vec<ChannelIo>>,
    queues: HashMap<Connection, Sender<String>>,
    state: Arc<Mutex<SimulatorSnapshot>>,
    transcript: Option<BufWriter<File>>,
    log_path: PathBuf,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PhoneSimuHandler {
    /// Connects to the audio, AVRCP and HFP apps.
    ///
    /// Audio app traffic is logged to `<results>/audio_telnet_<timestamp>.log`.
    pub fn connect(settings: &Settings) -> AppResult<Self> {
        if settings.switcher.configure_mixer {
            set_alsa_mixer_config();
        }
        let mut streams = Vec::with_capacity(Connection::ALL.len());
        for connection in Connection::ALL {
            streams.push((connection, connect_to_app(settings, connection)?));
        }
        let stamp = chrono::Local::now().format("%Y-%h-%d_%H-%M-%S");
        let log_path = settings.results_dir().join(format!("audio_telnet_{}.log", stamp));
        Self::from_streams(streams, &log_path)
    }

    /// Handler over already connected app streams, logging to `log_path`.
    pub fn from_streams(streams: Vec<(Connection, TcpStream)>, log_path: &Path) -> AppResult<Self> {
        if let Some(dir) = log_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let transcript = BufWriter::new(File::create(log_path)?);

        let mut queues = HashMap::new();
        let mut channels = Vec::with_capacity(streams.len());
        for (connection, stream) in streams {
            stream.set_read_timeout(Some(READ_SLICE))?;
            let (sender, receiver) = unbounded();
            queues.insert(connection, sender);
            channels.push(ChannelIo {
                connection,
                stream,
                filter: IacFilter::new(),
                lines: LineBuffer::new(),
                outbound: receiver,
                open: true,
            });
        }

        Ok(Self {
            pending: Some(channels),
            queues,
            state: Arc::new(Mutex::new(SimulatorSnapshot::default())),
            transcript: Some(transcript),
            log_path: log_path.to_path_buf(),
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
        })
    }

    /// Path of the telnet transcript.
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    fn ensure_running(&self, caller: &'static str) -> AppResult<()> {
        match &self.handle {
            None => Err(HarnessError::HandlerNotStarted(caller)),
            Some(handle) if handle.is_finished() => Err(HarnessError::HandlerDead),
            Some(_) => Ok(()),
        }
    }
}

impl SimulatorLink for PhoneSimuHandler {
    fn start(&mut self) -> AppResult<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        // the comm thread owns the sockets, so a stopped handler cannot restart
        let channels = self.pending.take().ok_or(HarnessError::HandlerDead)?;
        let transcript = self.transcript.take();
        let state = self.state.clone();
        let stop = self.stop.clone();
        let handle = thread::Builder::new()
            .name("phonesimu-comm".to_string())
            .spawn(move || comm_loop(channels, transcript, state, stop))?;
        self.handle = Some(handle);
        info!("phonesimu comm handler started");
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn get_data(&self, refresh: bool) -> AppResult<SimulatorSnapshot> {
        self.ensure_running("get_data")?;
        let mut state = self.state.lock();
        let snapshot = state.clone();
        if refresh {
            state.clear_updated();
        }
        Ok(snapshot)
    }

    fn send_data(&self, connection: Connection, text: &str) -> AppResult<()> {
        self.ensure_running("send_data")?;
        let queue = self.queues.get(&connection).ok_or(HarnessError::NotConnected)?;
        queue
            .send(text.to_string())
            .map_err(|_| HarnessError::HandlerDead)
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("phonesimu comm thread panicked");
            }
            info!("phonesimu comm handler stopped");
        }
    }
}

impl Drop for PhoneSimuHandler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn comm_loop(
    mut channels: Vec<ChannelIo>,
    mut transcript: Option<BufWriter<File>>,
    state: Arc<Mutex<SimulatorSnapshot>>,
    stop: Arc<AtomicBool>,
) {
    let mut chunk = [0u8; 4096];
    let mut clean = Vec::with_capacity(4096);

    while !stop.load(Ordering::SeqCst) {
        for channel in channels.iter_mut().filter(|c| c.open) {
            match channel.stream.read(&mut chunk) {
                Ok(0) => {
                    error!("Application {} has closed connection unexpectedly", channel.connection);
                    channel.open = false;
                }
                Ok(n) => {
                    clean.clear();
                    channel.filter.feed(&chunk[..n], &mut clean);
                    channel.lines.push(&clean);
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    error!("Read from the {} app failed: {}", channel.connection, e);
                    channel.open = false;
                }
            }

            while let Some(line) = channel.lines.next_line() {
                let message = line.trim_start_matches('>').trim();
                if message.is_empty() {
                    continue;
                }
                if channel.connection == Connection::Audio {
                    if let Some(out) = transcript.as_mut() {
                        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S,%3f");
                        if let Err(e) = writeln!(out, "{} {}", stamp, message) {
                            warn!("Audio transcript write failed: {}", e);
                        }
                    }
                }
                state.lock().apply_message(message);
            }

            while let Ok(text) = channel.outbound.try_recv() {
                info!("Sending to {}: {}", channel.connection, text.trim_end());
                if let Err(e) = channel.stream.write_all(text.as_bytes()) {
                    error!("Write to the {} app failed: {}", channel.connection, e);
                    channel.open = false;
                    break;
                }
            }
        }

        if channels.iter().all(|c| !c.open) {
            thread::sleep(IDLE_SLEEP);
        }
    }

    if let Some(mut out) = transcript {
        if let Err(e) = out.flush() {
            warn!("Audio transcript flush failed: {}", e);
        }
    }
    for channel in &channels {
        if let Err(e) = channel.stream.shutdown(std::net::Shutdown::Both) {
            debug!("Shutdown of the {} app connection failed: {}", channel.connection, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Instant;

    #[test]
    fn test_micro_analysis_updates_on_new_frequency() {
        let mut state = SimulatorSnapshot::default();
        let line = "alsa-micro-analysis signal-analysis 2000000000 513 0.500000 4500.000000:0.480000 \
                    4500.000000:0.480000 0.000000:0.000000 0.000000:0.000000 0.000000:0.000000";
        assert!(state.apply_message(line));
        assert_eq!(state.micro.frequency, 4500.0);
        assert_eq!(state.micro.time, 2.0);
        assert!(state.micro.updated);

        // same frequency again: no new time stamp
        state.clear_updated();
        let later = line.replace("2000000000", "3000000000");
        assert!(state.apply_message(&later));
        assert_eq!(state.micro.time, 2.0);
        assert!(!state.micro.updated);
    }

    #[test]
    fn test_weak_or_short_analysis_is_ignored() {
        let mut state = SimulatorSnapshot::default();
        assert!(state.apply_message(
            "sco-audio-analysis signal-analysis 10 513 0.0 1500.0:0.005 1500.0:0.005"
        ));
        assert_eq!(state.sco, MeasuredSignal::default());
        assert!(state.apply_message("sco-audio-analysis signal-analysis 10 256 0.5 1500.0:0.5"));
        assert_eq!(state.sco, MeasuredSignal::default());
        assert!(state.apply_message("sco-audio-analysis signal-analysis 10 513 0.5 1500.0:0.5"));
        assert_eq!(state.sco.frequency, 1500.0);
    }

    #[test]
    fn test_status_and_address_messages() {
        let mut state = SimulatorSnapshot::default();
        assert!(state.apply_message("BT: IND: +CIEV: 2,1"));
        assert_eq!(state.phone.status, "1");
        assert!(state.phone.updated);

        assert!(state.apply_message("PLAY: STATUS: MODE: Playing"));
        assert_eq!(state.avrcp.status, "Playing");
        assert!(state.avrcp.updated);

        assert!(state.apply_message("TST: HF: Connected to 00:11:22:33:44:55"));
        assert!(state.apply_message("PLAY: CT: Connected to 66:77:88:99:AA:BB "));
        assert_eq!(state.hfp_cli_addr, "00:11:22:33:44:55");
        assert_eq!(state.avrcp.addr, "66:77:88:99:AA:BB");

        state.clear_updated();
        assert!(!state.phone.updated);
        assert!(!state.avrcp.updated);
    }

    #[test]
    fn test_signal_parameters_route_by_source() {
        let mut state = SimulatorSnapshot::default();
        assert!(state.apply_message("sco-audio signal-parameters 1000000000 0.5 1500"));
        assert!(state.apply_message("alsa-speaker signal-parameters 2000000000 0.5 1000"));
        assert!(state.apply_message("a2dp-source signal-parameters 3000000000 0.5 4500"));
        assert_eq!((state.phone.frequency, state.phone.time), (1500.0, 1.0));
        assert_eq!((state.speaker.frequency, state.speaker.time), (1000.0, 2.0));
        assert_eq!(
            (state.entertainment.frequency, state.entertainment.time),
            (4500.0, 3.0)
        );
        assert!(!state.apply_message("unrelated chatter"));
    }

    fn accept_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_handler_requires_start() {
        let dir = tempfile::tempdir().unwrap();
        let (client, _server) = accept_pair();
        let mut handler =
            PhoneSimuHandler::from_streams(vec![(Connection::Audio, client)], &dir.path().join("t.log"))
                .unwrap();
        assert!(matches!(
            handler.get_data(false),
            Err(HarnessError::HandlerNotStarted("get_data"))
        ));
        handler.start().unwrap();
        assert!(handler.get_data(false).is_ok());
        handler.stop();
        assert!(!handler.is_started());
    }

    #[test]
    fn test_handler_reads_and_writes() {
        let dir = tempfile::tempdir().unwrap();
        let (audio, mut audio_server) = accept_pair();
        let (avrcp, mut avrcp_server) = accept_pair();
        let log_path = dir.path().join("audio_telnet.log");
        let mut handler = PhoneSimuHandler::from_streams(
            vec![(Connection::Audio, audio), (Connection::Avrcp, avrcp)],
            &log_path,
        )
        .unwrap();
        handler.start().unwrap();

        audio_server
            .write_all(b">a2dp-source signal-parameters 5000000000 0.5 4500\r\n")
            .unwrap();
        avrcp_server.write_all(b"PLAY: STATUS: MODE: Playing\r\n").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let data = handler.get_data(false).unwrap();
            if data.avrcp.updated && data.entertainment.frequency == 4500.0 {
                break;
            }
            assert!(Instant::now() < deadline, "simulator messages not applied");
            thread::sleep(Duration::from_millis(20));
        }
        assert!(handler.get_data(true).unwrap().avrcp.updated);
        assert!(!handler.get_data(false).unwrap().avrcp.updated);

        handler.send_command(&Command::Status).unwrap();
        let mut buf = [0u8; 9];
        avrcp_server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"status:\r\n");

        handler.stop();
        let transcript = std::fs::read_to_string(&log_path).unwrap();
        assert!(transcript.contains("a2dp-source signal-parameters 5000000000 0.5 4500"));
        assert!(!transcript.contains("PLAY: STATUS"));
    }

    #[test]
    fn test_stop_after_app_closed_connection() {
        let dir = tempfile::tempdir().unwrap();
        let (audio, mut audio_server) = accept_pair();
        let log_path = dir.path().join("audio_telnet.log");
        let mut handler =
            PhoneSimuHandler::from_streams(vec![(Connection::Audio, audio)], &log_path).unwrap();
        handler.start().unwrap();

        audio_server
            .write_all(b"a2dp-source signal-parameters 1000000000 0.5 6000\r\n")
            .unwrap();
        drop(audio_server);

        let deadline = Instant::now() + Duration::from_secs(5);
        while handler.get_data(false).unwrap().entertainment.frequency != 6000.0 {
            assert!(Instant::now() < deadline, "simulator message not applied");
            thread::sleep(Duration::from_millis(20));
        }
        // let the comm thread observe the closed socket
        thread::sleep(Duration::from_millis(300));

        handler.stop();
        assert!(!handler.is_started());
        let transcript = std::fs::read_to_string(&log_path).unwrap();
        assert!(transcript.contains("a2dp-source signal-parameters 1000000000 0.5 6000"));
    }
}
