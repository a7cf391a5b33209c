//! Outbound phonesimu commands and the queued command writer.

use crate::config::PhoneSimuSettings;
use crate::error::{AppResult, HarnessError};
use crate::protocol::telnet::connect_with_retries;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// The phonesimu app a command is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Connection {
    /// A2DP, SCO and the ALSA micro/speaker workers
    Audio,
    /// Audio/video remote control
    Avrcp,
    /// Hands-free profile, telephony
    Hfp,
}

impl Connection {
    /// Every app, in connection order.
    pub const ALL: [Connection; 3] = [Connection::Audio, Connection::Avrcp, Connection::Hfp];

    /// Configured port of this app.
    pub fn port(self, settings: &PhoneSimuSettings) -> u16 {
        match self {
            Connection::Audio => settings.audio_port,
            Connection::Avrcp => settings.avrcp_port,
            Connection::Hfp => settings.hfp_port,
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Connection::Audio => f.write_str("audio"),
            Connection::Avrcp => f.write_str("avrcp"),
            Connection::Hfp => f.write_str("hfp"),
        }
    }
}

/// AVRCP playback mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayMode {
    /// Resume or start playback
    Playing,
    /// Pause at the current position
    Paused,
    /// Stop playback
    Stopped,
}

impl fmt::Display for PlayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlayMode::Playing => f.write_str("playing"),
            PlayMode::Paused => f.write_str("paused"),
            PlayMode::Stopped => f.write_str("stopped"),
        }
    }
}

/// A phonesimu text command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Opens the ALSA capture worker
    NewAlsaMicro {
        /// ALSA device, e.g. `hw:2,0`
        device: String,
        /// Capture rate in Hz
        sample_rate: u32,
    },
    /// Records the ALSA capture into timestamped files
    AlsaMicroRecord {
        /// File prefix
        path: String,
        /// File rotation interval in seconds
        interval: f64,
    },
    /// Stops the ALSA recorder
    AlsaMicroRecorderExit,
    /// Closes the ALSA capture worker
    AlsaMicroExit,
    /// Records the SCO audio into timestamped files
    ScoAudioRecord {
        /// File prefix
        path: String,
        /// File rotation interval in seconds
        interval: f64,
    },
    /// Stops the SCO recorder
    ScoAudioRecorderExit,
    /// Entertainment tone sent to the device over A2DP
    A2dpSignal {
        /// Amplitude, 0 to 1
        strength: f64,
        /// Tone in Hz
        frequency: f64,
    },
    /// Phone tone sent to the device over SCO
    ScoSignal {
        /// Amplitude, 0 to 1
        strength: f64,
        /// Tone in Hz
        frequency: f64,
    },
    /// Tone played into the device microphone
    SpeakerSignal {
        /// Amplitude, 0 to 1
        strength: f64,
        /// Tone in Hz
        frequency: f64,
    },
    /// Opens the SCO link to the device
    ScoConnect {
        /// Bluetooth address of the HFP client
        address: String,
    },
    /// Changes the AVRCP playback mode
    SetMode(PlayMode),
    /// Asks the AVRCP app for the playback status
    Status,
    /// Asks the AVRCP app for the controller address
    CtStatus,
    /// Asks the HFP app for the hands-free address
    HfStatus,
    /// Outgoing call to the last number
    Dial,
    /// Call timings that make the simulator hang up on its own after 30s
    DefaultCallDuration,
}

impl Command {
    /// App the command is sent to.
    pub fn connection(&self) -> Connection {
        match self {
            Command::SetMode(_) | Command::Status | Command::CtStatus => Connection::Avrcp,
            Command::HfStatus | Command::Dial | Command::DefaultCallDuration => Connection::Hfp,
            _ => Connection::Audio,
        }
    }

    /// Bytes written to the socket, including the terminator.
    pub fn wire(&self) -> String {
        match self {
            Command::Dial => format!("\r\n{}\r\n", self),
            _ => format!("{}\r\n", self),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::NewAlsaMicro { device, sample_rate } => {
                write!(f, "alsa-micro new-alsa-micro {} {}", device, sample_rate)
            }
            Command::AlsaMicroRecord { path, interval } => {
                write!(f, "alsa-micro record {} {}", path, interval)
            }
            Command::AlsaMicroRecorderExit => f.write_str("alsa-micro-recorder exit"),
            Command::AlsaMicroExit => f.write_str("alsa-micro exit"),
            Command::ScoAudioRecord { path, interval } => {
                write!(f, "sco-audio record {} {}", path, interval)
            }
            Command::ScoAudioRecorderExit => f.write_str("sco-audio-recorder exit"),
            Command::A2dpSignal { strength, frequency } => {
                write!(f, "a2dp-source set-signal-parameters {} {}", strength, frequency)
            }
            Command::ScoSignal { strength, frequency } => {
                write!(f, "sco-audio set-signal-parameters {} {}", strength, frequency)
            }
            Command::SpeakerSignal { strength, frequency } => {
                write!(f, "alsa-speaker set-signal-parameters {} {}", strength, frequency)
            }
            Command::ScoConnect { address } => write!(f, "sco-audio connect {}", address),
            Command::SetMode(mode) => write!(f, "set-mode:{}", mode),
            Command::Status => f.write_str("status:"),
            Command::CtStatus => f.write_str("ct-status:"),
            Command::HfStatus => f.write_str("HF-STATUS:"),
            Command::Dial => f.write_str("AT: ATD>1;"),
            Command::DefaultCallDuration => f.write_str("DEFAULT: 30, 30, 5, 1, 30, 30"),
        }
    }
}

const QUEUE_POLL: Duration = Duration::from_millis(100);

/// Control socket with a dedicated writer thread.
///
/// Any number of producers enqueue commands; the writer drains them in order.
/// Data the simulator sends back on this socket is discarded.
pub struct CommandLink {
    sender: Option<Sender<String>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    peer: String,
}

impl CommandLink {
    /// Connects to `port` and starts the writer thread.
    pub fn connect(settings: &PhoneSimuSettings, port: u16) -> AppResult<Self> {
        let stream = connect_with_retries(
            &settings.host,
            port,
            settings.connect_timeout,
            settings.connect_retries,
            settings.retry_delay,
        )?;
        Self::spawn(stream, format!("{}:{}", settings.host, port))
    }

    /// Starts the writer thread over an open stream.
    pub fn spawn(stream: TcpStream, peer: String) -> AppResult<Self> {
        let (sender, receiver) = unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        stream.set_read_timeout(Some(Duration::from_millis(1)))?;

        let thread_stop = stop.clone();
        let thread_peer = peer.clone();
        let handle = thread::Builder::new()
            .name("phonesimu-writer".to_string())
            .spawn(move || writer_loop(stream, receiver, thread_stop, thread_peer))?;

        info!("Command link to {} started", peer);
        Ok(Self {
            sender: Some(sender),
            stop,
            handle: Some(handle),
            peer,
        })
    }

    /// Queues a command; fails once the writer has stopped.
    pub fn send(&self, command: &Command) -> AppResult<()> {
        self.send_raw(command.wire())
    }

    /// Queues a preformatted line.
    pub fn send_raw(&self, text: String) -> AppResult<()> {
        let sender = self.sender.as_ref().ok_or(HarnessError::NotConnected)?;
        sender.send(text).map_err(|_| HarnessError::NotConnected)
    }

    /// `true` while the writer thread is alive.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Flushes the queue and joins the writer.
    pub fn stop(&mut self) {
        // dropping the sender lets the writer drain and exit
        self.sender = None;
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Command writer for {} panicked", self.peer);
            }
        }
        self.stop.store(true, Ordering::SeqCst);
    }
}

impl Drop for CommandLink {
    fn drop(&mut self) {
        self.stop();
    }
}

fn writer_loop(mut stream: TcpStream, queue: Receiver<String>, stop: Arc<AtomicBool>, peer: String) {
    let mut scratch = [0_u8; 1024];
    let mut peer_open = true;

    while !stop.load(Ordering::SeqCst) {
        match queue.recv_timeout(QUEUE_POLL) {
            Ok(text) => {
                debug!("Sending to {}: {}", peer, text.trim());
                if let Err(e) = stream.write_all(text.as_bytes()).and_then(|_| stream.flush()) {
                    error!("Write to {} failed: {}", peer, e);
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if peer_open {
            match stream.read(&mut scratch) {
                Ok(0) => {
                    warn!("{} has hung up", peer);
                    peer_open = false;
                }
                Ok(_) => {}
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) => {
                    warn!("Read from {} failed: {}", peer, e);
                    peer_open = false;
                }
            }
        }
    }

    if let Err(e) = stream.shutdown(std::net::Shutdown::Both) {
        debug!("Shutdown of {} failed: {}", peer, e);
    }
    debug!("Command writer for {} exited", peer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;
    use std::net::TcpListener;

    #[test]
    fn test_command_wire_format() {
        let cases = [
            (
                Command::A2dpSignal { strength: 0.5, frequency: 4500.0 },
                "a2dp-source set-signal-parameters 0.5 4500\r\n",
            ),
            (
                Command::ScoSignal { strength: 1.0, frequency: 375.0 },
                "sco-audio set-signal-parameters 1 375\r\n",
            ),
            (
                Command::AlsaMicroRecord { path: "results/rec".to_string(), interval: 0.1 },
                "alsa-micro record results/rec 0.1\r\n",
            ),
            (
                Command::NewAlsaMicro { device: "hw:1,0".to_string(), sample_rate: 48000 },
                "alsa-micro new-alsa-micro hw:1,0 48000\r\n",
            ),
            (Command::SetMode(PlayMode::Stopped), "set-mode:stopped\r\n"),
            (Command::Dial, "\r\nAT: ATD>1;\r\n"),
            (Command::DefaultCallDuration, "DEFAULT: 30, 30, 5, 1, 30, 30\r\n"),
        ];
        for (command, wire) in cases {
            assert_eq!(command.wire(), wire);
        }
    }

    #[test]
    fn test_command_routing() {
        assert_eq!(Command::Status.connection(), Connection::Avrcp);
        assert_eq!(Command::HfStatus.connection(), Connection::Hfp);
        assert_eq!(Command::Dial.connection(), Connection::Hfp);
        assert_eq!(
            Command::ScoConnect { address: "AA:BB".to_string() }.connection(),
            Connection::Audio
        );
    }

    #[test]
    fn test_link_delivers_commands_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            let reader = std::io::BufReader::new(conn);
            reader.lines().map(|l| l.unwrap()).collect::<Vec<_>>()
        });

        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let mut link = CommandLink::spawn(stream, format!("127.0.0.1:{}", port)).unwrap();
        link.send(&Command::AlsaMicroRecorderExit).unwrap();
        link.send(&Command::AlsaMicroExit).unwrap();
        link.stop();
        assert!(matches!(
            link.send(&Command::Status),
            Err(HarnessError::NotConnected)
        ));

        let lines = server.join().unwrap();
        assert_eq!(lines, vec!["alsa-micro-recorder exit\r", "alsa-micro exit\r"]);
    }
}
