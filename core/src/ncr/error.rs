use thiserror::Error;

use super::command::ScsiCommand;
use super::scripts::program::ScriptError;
use crate::bus::MemoryError;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("unsupported chip: device {device:04X} revision {revision:02X}")]
    UnsupportedChip { device: u16, revision: u8 },
    #[error("{0} has no table indirect selection, the SCRIPTS program cannot run on it")]
    LegacyChip(&'static str),
    #[error("out of DMA memory allocating {0}")]
    ResourceExhausted(&'static str),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("SCRIPTS image: {0}")]
    Script(#[from] ScriptError),
    #[error("invalid option: {0}")]
    InvalidOption(String),
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("self test {test} failed: {reason}")]
    SelfTest { test: u8, reason: String },
    #[error("adapter is probe-only or disabled")]
    Disabled,
    #[error("no free command descriptor")]
    OutOfDescriptors,
}

/// Why a command was not accepted. The command is handed back to the caller.
#[derive(Error, Debug)]
pub enum SubmitError {
    /// Transient, retry the command later
    #[error("queue full")]
    QueueFull(Box<ScsiCommand>),
    #[error("command rejected: {1}")]
    Rejected(Box<ScsiCommand>, DriverError),
}

impl SubmitError {
    pub fn into_command(self) -> ScsiCommand {
        match self {
            Self::QueueFull(cmd) | Self::Rejected(cmd, _) => *cmd,
        }
    }
}
