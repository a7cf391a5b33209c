//! phonesimu wire protocol: telnet transport, analysis frames and commands.

pub mod command;
pub mod frame;
pub mod telnet;

pub use command::{Command, CommandLink, Connection, PlayMode};
pub use frame::{
    FieldValue, Frame, FrequencyPair, SignalField, SignalParameters, VadDecision, VadParameters,
};
pub use telnet::{IacFilter, LineBuffer, ReadEvent, TelnetSession};
