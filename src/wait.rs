//! Blocking wait-for-condition primitives over a [`FrameBus`].
//!
//! A wait either finds what it is looking for, runs out of time, or finds the
//! reader gone. None of these is an error; they are the three arms of
//! [`WaitOutcome`].

use crate::protocol::{FieldValue, SignalField, SignalParameters, VadParameters};
use crate::reader::{FrameBus, LinkState, VadPoll};
use log::{debug, info, warn};
use std::fmt;
use std::time::{Duration, Instant};

/// Longest single blocking pop on the VAD queue.
const VAD_POP: Duration = Duration::from_secs(1);

/// Outcome of a wait.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome<T> {
    /// The condition held; carries the satisfying value
    Matched(T),
    /// The deadline passed first
    TimedOut,
    /// The reader lost its link before the condition held
    ConnectionLost,
}

impl<T> WaitOutcome<T> {
    /// `true` for [`WaitOutcome::Matched`].
    pub fn is_matched(&self) -> bool {
        matches!(self, WaitOutcome::Matched(_))
    }

    /// The matched value, if any.
    pub fn matched(self) -> Option<T> {
        match self {
            WaitOutcome::Matched(value) => Some(value),
            _ => None,
        }
    }

    /// Maps the matched value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> WaitOutcome<U> {
        match self {
            WaitOutcome::Matched(value) => WaitOutcome::Matched(f(value)),
            WaitOutcome::TimedOut => WaitOutcome::TimedOut,
            WaitOutcome::ConnectionLost => WaitOutcome::ConnectionLost,
        }
    }
}

/// Predicate over one field of a signal frame.
pub trait Matcher: Send + Sync + fmt::Display {
    /// `true` when `value` satisfies the predicate.
    fn matches(&self, value: &FieldValue) -> bool;
}

/// Field/predicate pairs that must all hold on the same frame.
#[derive(Default)]
pub struct SignalCriteria {
    checks: Vec<(SignalField, Box<dyn Matcher>)>,
}

impl SignalCriteria {
    /// No criteria; matches every frame.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a predicate on `field`.
    pub fn with(mut self, field: SignalField, matcher: impl Matcher + 'static) -> Self {
        self.checks.push((field, Box::new(matcher)));
        self
    }

    /// `true` without predicates.
    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// `true` when every predicate holds on `frame`.
    pub fn matches(&self, frame: &SignalParameters) -> bool {
        self.checks
            .iter()
            .all(|(field, matcher)| matcher.matches(&frame.field(*field)))
    }
}

impl fmt::Display for SignalCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (field, matcher)) in self.checks.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", field, matcher)?;
        }
        f.write_str("}")
    }
}

/// Waits until every predicate in `criteria` holds on the latest signal frame.
///
/// Wakes on each new frame and re-checks at least every `poll`.
pub fn wait_for(
    bus: &FrameBus,
    criteria: &SignalCriteria,
    timeout: Duration,
    poll: Duration,
) -> WaitOutcome<SignalParameters> {
    info!("Waiting {:?} for signal {}", timeout, criteria);
    let start = Instant::now();
    let deadline = start + timeout;
    let (mut frame, mut seen) = bus.snapshot();

    loop {
        if let Some(current) = frame.as_ref() {
            if criteria.matches(current) {
                info!("Signal detected after {:.3}s", start.elapsed().as_secs_f64());
                return WaitOutcome::Matched(current.clone());
            }
        }
        if bus.link_state() == LinkState::Disconnected {
            warn!("Stopped waiting for signal: phonesimu reader is disconnected");
            return WaitOutcome::ConnectionLost;
        }
        let now = Instant::now();
        if now >= deadline {
            info!("No signal matching {} within {:?}", criteria, timeout);
            return WaitOutcome::TimedOut;
        }
        let (next, generation) = bus.wait_newer(seen, poll.min(deadline - now));
        frame = next;
        seen = generation;
    }
}

/// What one observed frame did to a [`ConsecutiveCounter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountStep {
    /// Qualifying frame; carries the new count
    Counted(u32),
    /// Same timestamp as the previously counted frame; ignored
    Duplicate,
    /// Disqualifying frame; the count is back to zero
    Reset,
    /// The required count was reached
    Reached,
}

/// Counts consecutive qualifying frames, skipping re-emitted ones.
#[derive(Debug, Clone)]
pub struct ConsecutiveCounter {
    required: u32,
    count: u32,
    prev_timestamp: Option<u64>,
}

impl ConsecutiveCounter {
    /// Counter that reaches its goal after `required` frames.
    pub fn new(required: u32) -> Self {
        Self {
            required,
            count: 0,
            prev_timestamp: None,
        }
    }

    /// Current run length.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Feeds one frame.
    pub fn observe(&mut self, timestamp: u64, qualifies: bool) -> CountStep {
        let step = if !qualifies {
            self.count = 0;
            CountStep::Reset
        } else if self.prev_timestamp == Some(timestamp) {
            CountStep::Duplicate
        } else {
            self.count += 1;
            self.prev_timestamp = Some(timestamp);
            CountStep::Counted(self.count)
        };

        if self.count >= self.required {
            CountStep::Reached
        } else {
            step
        }
    }
}

fn wait_for_vad(
    bus: &FrameBus,
    consecutive_matches: u32,
    timeout: Duration,
    label: &str,
    qualifies: impl Fn(&VadParameters) -> bool,
) -> WaitOutcome<VadParameters> {
    info!("Waiting {:?} for {}", timeout, label);
    let start = Instant::now();
    let deadline = start + timeout;
    let mut counter = ConsecutiveCounter::new(consecutive_matches);

    loop {
        let now = Instant::now();
        if now >= deadline {
            info!("No {} within {:?}, last count {}", label, timeout, counter.count());
            return WaitOutcome::TimedOut;
        }
        match bus.next_vad_frame(VAD_POP.min(deadline - now)) {
            VadPoll::Frame(vad) => match counter.observe(vad.timestamp, qualifies(&vad)) {
                CountStep::Reached => {
                    info!(
                        "{} detected in {} consecutive frames, after {:.3}s",
                        label,
                        consecutive_matches,
                        start.elapsed().as_secs_f64()
                    );
                    return WaitOutcome::Matched(vad);
                }
                CountStep::Duplicate => warn!("Matched same VAD line again (timestamp {})", vad.timestamp),
                CountStep::Reset => debug!("Detected '{}' (similarity {}), match count reset", vad.decision, vad.simi),
                CountStep::Counted(n) => debug!("{} frame {}/{}", label, n, consecutive_matches),
            },
            VadPoll::Empty => debug!("VAD match not found in the queue"),
            VadPoll::Closed => {
                warn!("Stopped waiting for {}: phonesimu reader is disconnected", label);
                return WaitOutcome::ConnectionLost;
            }
        }
    }
}

/// Waits for `consecutive_matches` distinct silence frames in a row.
pub fn wait_for_silence(bus: &FrameBus, consecutive_matches: u32, timeout: Duration) -> WaitOutcome<()> {
    wait_for_vad(bus, consecutive_matches, timeout, "silence", VadParameters::is_silence).map(|_| ())
}

/// Waits for `consecutive_matches` distinct new-voice frames in a row.
///
/// Returns the last qualifying frame.
pub fn wait_for_voice(
    bus: &FrameBus,
    consecutive_matches: u32,
    timeout: Duration,
) -> WaitOutcome<VadParameters> {
    wait_for_vad(bus, consecutive_matches, timeout, "voice", VadParameters::is_new_voice)
}
