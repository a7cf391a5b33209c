//! Minimal telnet transport for the phonesimu line protocol.
//!
//! The simulator speaks plain CRLF-terminated text over telnet. No options are
//! negotiated; any `IAC` sequences that appear in the stream are stripped by
//! [`IacFilter`] before line splitting.

use crate::config::PhoneSimuSettings;
use crate::error::{AppResult, HarnessError};
use log::{debug, warn};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Interpret As Command
pub const IAC: u8 = 255;
/// No operation, used to probe a fresh link
pub const NOP: u8 = 241;
const SE: u8 = 240;
const SB: u8 = 250;
const WILL: u8 = 251;
const DONT: u8 = 254;

/// Granularity at which blocking reads re-check the stop flag.
const READ_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum IacState {
    #[default]
    Data,
    Command,
    Option,
    Subnegotiation,
    SubnegotiationIac,
}

/// Byte-level state machine removing telnet commands from a data stream.
///
/// State survives across calls so sequences split over two reads are handled.
#[derive(Debug, Default)]
pub struct IacFilter {
    state: IacState,
}

impl IacFilter {
    /// Creates a filter in the data state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the data bytes of `input` to `out`.
    pub fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) {
        for &byte in input {
            self.state = match (self.state, byte) {
                (IacState::Data, IAC) => IacState::Command,
                (IacState::Data, b) => {
                    out.push(b);
                    IacState::Data
                }
                // escaped 0xFF data byte
                (IacState::Command, IAC) => {
                    out.push(IAC);
                    IacState::Data
                }
                (IacState::Command, SB) => IacState::Subnegotiation,
                (IacState::Command, WILL..=DONT) => IacState::Option,
                (IacState::Command, _) => IacState::Data,
                (IacState::Option, _) => IacState::Data,
                (IacState::Subnegotiation, IAC) => IacState::SubnegotiationIac,
                (IacState::Subnegotiation, _) => IacState::Subnegotiation,
                (IacState::SubnegotiationIac, SE) => IacState::Data,
                (IacState::SubnegotiationIac, _) => IacState::Subnegotiation,
            };
        }
    }
}

/// Reassembles newline-terminated lines from arbitrary chunks.
///
/// A trailing `\r` is removed, so both `\r\n` and `\n` terminate a line.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Pops the next complete line, without its terminator.
    pub fn next_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=end).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// `true` when no partial line is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Result of one [`TelnetSession::read_line`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEvent {
    /// A complete line without its terminator
    Line(String),
    /// No complete line arrived within the read timeout
    TimedOut,
    /// The stop flag was raised while waiting
    Stopped,
    /// The peer closed the connection
    Closed,
}

/// One telnet connection to a phonesimu app.
#[derive(Debug)]
pub struct TelnetSession {
    stream: TcpStream,
    peer: String,
    filter: IacFilter,
    lines: LineBuffer,
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(ErrorKind::NotFound, format!("no address for {}:{}", host, port)))
}

/// Opens a TCP connection, retrying with a fixed delay.
pub fn connect_with_retries(
    host: &str,
    port: u16,
    timeout: Duration,
    retries: u32,
    delay: Duration,
) -> AppResult<TcpStream> {
    let addr = format!("{}:{}", host, port);
    let attempts = retries.max(1);
    let mut last_error = io::Error::new(ErrorKind::Other, "no connection attempt made");

    for attempt in 1..=attempts {
        match resolve(host, port).and_then(|sock| TcpStream::connect_timeout(&sock, timeout)) {
            Ok(stream) => {
                debug!("Connected to {} on attempt {}", addr, attempt);
                return Ok(stream);
            }
            Err(e) => {
                warn!("Connection attempt {}/{} to {} failed: {}", attempt, attempts, addr, e);
                last_error = e;
                if attempt < attempts {
                    thread::sleep(delay);
                }
            }
        }
    }

    Err(HarnessError::Connection {
        addr,
        attempts,
        source: last_error,
    })
}

impl TelnetSession {
    /// Connects to `port` on the configured host and validates the link with `IAC NOP` probes.
    pub fn connect(settings: &PhoneSimuSettings, port: u16) -> AppResult<Self> {
        let stream = connect_with_retries(
            &settings.host,
            port,
            settings.connect_timeout,
            settings.connect_retries,
            settings.retry_delay,
        )?;
        let peer = format!("{}:{}", settings.host, port);
        let mut session = Self::from_stream(stream, peer);
        session
            .probe(settings.probe_count, settings.probe_interval)
            .map_err(|source| HarnessError::Connection {
                addr: session.peer.clone(),
                attempts: settings.connect_retries,
                source,
            })?;
        Ok(session)
    }

    /// Wraps an already connected stream.
    pub fn from_stream(stream: TcpStream, peer: String) -> Self {
        Self {
            stream,
            peer,
            filter: IacFilter::new(),
            lines: LineBuffer::new(),
        }
    }

    /// `host:port` of the remote app.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Sends `count` `IAC NOP` probes `interval` apart.
    pub fn probe(&mut self, count: u32, interval: Duration) -> io::Result<()> {
        for i in 0..count {
            self.stream.write_all(&[IAC, NOP])?;
            if i + 1 < count {
                thread::sleep(interval);
            }
        }
        self.stream.flush()
    }

    /// Writes `text` followed by CRLF.
    pub fn write_line(&mut self, text: &str) -> io::Result<()> {
        self.stream.write_all(text.as_bytes())?;
        self.stream.write_all(b"\r\n")?;
        self.stream.flush()
    }

    /// Reads the next line, giving up after `timeout` or when `stop` is raised.
    pub fn read_line(&mut self, timeout: Duration, stop: &AtomicBool) -> io::Result<ReadEvent> {
        let deadline = Instant::now() + timeout;
        let mut chunk = [0_u8; 4096];
        let mut data = Vec::with_capacity(chunk.len());

        loop {
            if let Some(line) = self.lines.next_line() {
                return Ok(ReadEvent::Line(line));
            }
            if stop.load(Ordering::SeqCst) {
                return Ok(ReadEvent::Stopped);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(ReadEvent::TimedOut);
            }

            let slice = READ_SLICE.min(deadline - now).max(Duration::from_millis(1));
            self.stream.set_read_timeout(Some(slice))?;
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(ReadEvent::Closed),
                Ok(n) => {
                    data.clear();
                    self.filter.feed(&chunk[..n], &mut data);
                    self.lines.push(&data);
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Closes both directions, logging a failure.
    pub fn shutdown(&self) {
        if let Err(e) = self.stream.shutdown(std::net::Shutdown::Both) {
            debug!("Shutdown of {} failed: {}", self.peer, e);
        }
    }
}
