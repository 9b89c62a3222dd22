//! Generic commands as handed over by the SCSI mid-layer

use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};

use super::error::DriverError;
use crate::types::BusAddr;

/// Bytes of sense data fetched by the automatic REQUEST SENSE
pub const SENSE_BUFFER_SIZE: usize = 16;
/// Longest CDB the descriptor has room for
pub const MAX_CDB_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SgSegment {
    pub addr: BusAddr,
    pub len: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScsiCommand {
    /// Unique per command, used to find it again for aborts
    pub serial: u64,
    pub target: u8,
    pub lun: u8,
    pub cdb: ArrayVec<u8, MAX_CDB_LEN>,
    pub sg: Vec<SgSegment>,
}

impl ScsiCommand {
    /// Fails for CDBs longer than [`MAX_CDB_LEN`]
    pub fn new(
        serial: u64,
        target: u8,
        lun: u8,
        cdb: &[u8],
        sg: Vec<SgSegment>,
    ) -> Result<Self, DriverError> {
        let cdb = ArrayVec::try_from(cdb)
            .map_err(|_| DriverError::InvalidCommand(format!("CDB of {} bytes", cdb.len())))?;
        Ok(Self {
            serial,
            target,
            lun,
            cdb,
            sg,
        })
    }

    pub fn opcode(&self) -> u8 {
        self.cdb.first().copied().unwrap_or(0)
    }

    pub fn transfer_len(&self) -> u64 {
        self.sg.iter().map(|s| u64::from(s.len)).sum()
    }
}

/// Host status class of a completed command
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::IntoStaticStr,
)]
pub enum HostStatus {
    Ok,
    Timeout,
    Error,
    Reset,
    Parity,
    Aborted,
    BadTarget,
}

impl HostStatus {
    /// Code in the third byte of the composite result word
    pub const fn code(self) -> u8 {
        match self {
            Self::Ok => 0x00,
            Self::Timeout => 0x03,
            Self::BadTarget => 0x04,
            Self::Aborted => 0x05,
            Self::Parity => 0x06,
            Self::Error => 0x07,
            Self::Reset => 0x08,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub host: HostStatus,
    /// SCSI status byte
    pub status: u8,
    /// Last message byte
    pub message: u8,
    /// Sense data fetched after CHECK CONDITION
    pub sense: Option<[u8; SENSE_BUFFER_SIZE]>,
}

impl CommandResult {
    pub const fn host(host: HostStatus) -> Self {
        Self {
            host,
            status: 0,
            message: 0,
            sense: None,
        }
    }

    /// Composite result word: host status, message, status
    pub const fn word(&self) -> u32 {
        (self.host.code() as u32) << 16 | (self.message as u32) << 8 | self.status as u32
    }
}

/// Outcome of an abort request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortOutcome {
    Success,
    /// The chip owns the command, no in-flight abort is attempted
    Busy,
    NotFound,
}

/// Completion callback, invoked exactly once per accepted command
pub type CompletionFn = Box<dyn FnMut(ScsiCommand, CommandResult) + Send>;

/// Which data phases a command may use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    None,
    In,
    Out,
    /// Opcode not known, both streams get generated
    Both,
}

impl DataDirection {
    pub const fn data_in(self) -> bool {
        matches!(self, Self::In | Self::Both)
    }

    pub const fn data_out(self) -> bool {
        matches!(self, Self::Out | Self::Both)
    }

    pub fn classify(cmd: &ScsiCommand) -> Self {
        if cmd.sg.is_empty() {
            return Self::None;
        }
        match cmd.opcode() {
            // READ 6/10/12, REQUEST SENSE, INQUIRY, MODE SENSE 6/10,
            // READ CAPACITY, READ BUFFER, READ TOC, READ DEFECT DATA
            0x08 | 0x28 | 0xA8 | 0x03 | 0x12 | 0x1A | 0x5A | 0x25 | 0x3C | 0x43 | 0x37 => {
                Self::In
            }
            // WRITE 6/10/12, MODE SELECT 6/10, WRITE BUFFER, WRITE AND VERIFY
            0x0A | 0x2A | 0xAA | 0x15 | 0x55 | 0x3B | 0x2E => Self::Out,
            // TEST UNIT READY, REZERO, SEEK, START STOP, PREVENT ALLOW,
            // RESERVE, RELEASE, SYNCHRONIZE CACHE
            0x00 | 0x01 | 0x0B | 0x2B | 0x1B | 0x1E | 0x16 | 0x17 | 0x35 => Self::None,
            _ => Self::Both,
        }
    }
}
