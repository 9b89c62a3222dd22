//! 53c8xx operating register file

use num_derive::{FromPrimitive, ToPrimitive};
use proc_bitfield::bitfield;
use serde::{Deserialize, Serialize};

/// Size of the register window in either address space
pub const REGISTER_WINDOW: usize = 0x80;

#[derive(Debug, PartialEq, Eq, Clone, Copy, FromPrimitive, ToPrimitive, strum::IntoStaticStr)]
#[repr(u8)]
pub enum Reg {
    /// SCSI Control 0
    Scntl0 = 0x00,
    Scntl1 = 0x01,
    Scntl2 = 0x02,
    Scntl3 = 0x03,
    /// Chip SCSI ID
    Scid = 0x04,
    /// SCSI transfer (synchronous period/offset)
    Sxfer = 0x05,
    /// Destination ID for selection
    Sdid = 0x06,
    Gpreg = 0x07,
    /// SCSI first byte received
    Sfbr = 0x08,
    Socl = 0x09,
    /// Selector ID, valid after reselection
    Ssid = 0x0A,
    /// SCSI bus control lines
    Sbcl = 0x0B,
    /// DMA status
    Dstat = 0x0C,
    Sstat0 = 0x0D,
    Sstat1 = 0x0E,
    Sstat2 = 0x0F,
    /// Data structure address, base for table indirect operands
    Dsa = 0x10,
    /// Interrupt status, the one register readable while SCRIPTS run
    Istat = 0x14,
    Ctest0 = 0x18,
    Ctest1 = 0x19,
    Ctest2 = 0x1A,
    Ctest3 = 0x1B,
    /// Return address for CALL/RETURN
    Temp = 0x1C,
    Dfifo = 0x20,
    Ctest4 = 0x21,
    Ctest5 = 0x22,
    Ctest6 = 0x23,
    /// DMA byte counter, 24 bits, DCMD in the top byte
    Dbc = 0x24,
    Dcmd = 0x27,
    /// DMA next address
    Dnad = 0x28,
    /// SCRIPTS pointer
    Dsp = 0x2C,
    /// SCRIPTS pointer save, holds the interrupt code after INT
    Dsps = 0x30,
    ScratchA = 0x34,
    Dmode = 0x38,
    Dien = 0x39,
    Dwt = 0x3A,
    Dcntl = 0x3B,
    Adder = 0x3C,
    Sien0 = 0x40,
    Sien1 = 0x41,
    Sist0 = 0x42,
    Sist1 = 0x43,
    Slpar = 0x44,
    Macntl = 0x46,
    Gpcntl = 0x47,
    Stime0 = 0x48,
    Stime1 = 0x49,
    Respid = 0x4A,
    Stest0 = 0x4C,
    Stest1 = 0x4D,
    Stest2 = 0x4E,
    Stest3 = 0x4F,
    Sidl = 0x50,
    Sodl = 0x54,
    Sbdl = 0x58,
    ScratchB = 0x5C,
}

impl Reg {
    pub const fn offset(self) -> u8 {
        self as u8
    }
}

/// SCSI information transfer phase, as encoded in SBCL and in the phase
/// field of SCRIPTS instructions (MSG/CD/IO).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    FromPrimitive,
    ToPrimitive,
    Serialize,
    Deserialize,
    strum::IntoStaticStr,
)]
pub enum Phase {
    DataOut = 0,
    DataIn = 1,
    Command = 2,
    Status = 3,
    Reserved4 = 4,
    Reserved5 = 5,
    MsgOut = 6,
    MsgIn = 7,
}

impl Phase {
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Target to initiator direction
    pub const fn is_input(self) -> bool {
        (self as u8) & 1 != 0
    }

    pub fn from_code(code: u8) -> Self {
        <Self as num_traits::FromPrimitive>::from_u8(code & 7).unwrap_or(Self::DataOut)
    }
}

bitfield! {
    /// Interrupt status
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct Istat(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// DMA interrupt pending
        pub dip: bool @ 0,
        /// SCSI interrupt pending
        pub sip: bool @ 1,
        /// Interrupt on the fly
        pub intf: bool @ 2,
        /// Connected to the SCSI bus
        pub con: bool @ 3,
        pub sem: bool @ 4,
        /// Signal process, wakes a WAIT RESELECT
        pub sigp: bool @ 5,
        /// Software reset
        pub srst: bool @ 6,
        /// Abort SCRIPTS execution
        pub abrt: bool @ 7,
    }
}

bitfield! {
    /// DMA status
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct Dstat(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// Illegal instruction detected
        pub iid: bool @ 0,
        pub wtd: bool @ 1,
        /// SCRIPTS interrupt instruction received
        pub sir: bool @ 2,
        /// Single step interrupt
        pub ssi: bool @ 3,
        /// Aborted
        pub abrt: bool @ 4,
        /// Bus fault
        pub bf: bool @ 5,
        /// Master data parity error
        pub mdpe: bool @ 6,
        /// DMA FIFO empty
        pub dfe: bool @ 7,
    }
}

bitfield! {
    /// SCSI interrupt status 0
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct Sist0(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// Parity error
        pub par: bool @ 0,
        /// SCSI RST received
        pub rst: bool @ 1,
        /// Unexpected disconnect
        pub udc: bool @ 2,
        /// SCSI gross error
        pub sge: bool @ 3,
        pub rsl: bool @ 4,
        pub sel: bool @ 5,
        pub cmp: bool @ 6,
        /// Phase mismatch
        pub ma: bool @ 7,
    }
}

bitfield! {
    /// SCSI interrupt status 1
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct Sist1(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// Handshake to handshake timer expired
        pub hth: bool @ 0,
        /// General purpose timer expired
        pub gen_timer: bool @ 1,
        /// Selection timeout
        pub sto: bool @ 2,
    }
}

bitfield! {
    /// SCSI bus control lines
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct Sbcl(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub phase: u8 @ 0..=2,
        pub io: bool @ 0,
        pub cd: bool @ 1,
        pub msg: bool @ 2,
        pub atn: bool @ 3,
        pub sel: bool @ 4,
        pub bsy: bool @ 5,
        pub ack: bool @ 6,
        pub req: bool @ 7,
    }
}

bitfield! {
    /// DMA mode
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct Dmode(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub man: bool @ 0,
        pub bof: bool @ 1,
        pub ermp: bool @ 2,
        pub erl: bool @ 3,
        /// Destination of memory moves is in I/O space
        pub diom: bool @ 4,
        /// Source of memory moves is in I/O space
        pub siom: bool @ 5,
        /// Burst length
        pub bl: u8 @ 6..=7,
    }
}

bitfield! {
    /// SCSI control 1
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct Scntl1(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub sst: bool @ 0,
        pub iarb: bool @ 1,
        pub aesp: bool @ 2,
        /// Assert SCSI RST
        pub rst: bool @ 3,
        pub con: bool @ 4,
        pub dhp: bool @ 5,
        pub adb: bool @ 6,
        pub exc: bool @ 7,
    }
}

bitfield! {
    /// SCSI control 3
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct Scntl3(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// Clock conversion factor, asynchronous
        pub ccf: u8 @ 0..=2,
        pub ews: bool @ 3,
        /// Synchronous clock conversion factor
        pub scf: u8 @ 4..=6,
        pub ultra: bool @ 7,
    }
}

bitfield! {
    /// SCSI transfer
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct Sxfer(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// Synchronous offset, 0 means asynchronous
        pub offset: u8 @ 0..=3,
        /// Transfer period, in SCSI clocks minus four
        pub tp: u8 @ 5..=7,
    }
}

pub const ISTAT_ABRT: u8 = 0x80;
pub const ISTAT_SRST: u8 = 0x40;
/// ISTAT: signal process, wakes a WAIT RESELECT
pub const ISTAT_SIGP: u8 = 0x20;
pub const ISTAT_INTF: u8 = 0x04;
pub const SCNTL1_RST: u8 = 0x08;

pub const SCNTL0_ARB_FULL: u8 = 0xC0;
pub const SCNTL0_EPC: u8 = 0x08;
pub const SCNTL2_SDU: u8 = 0x80;
/// SCID: respond to reselection
pub const SCID_RRE: u8 = 0x40;
pub const CTEST2_SIGP: u8 = 0x40;
/// CTEST3: clear DMA FIFO
pub const CTEST3_CLF: u8 = 0x04;
/// STEST3: clear SCSI FIFO
pub const STEST3_CSF: u8 = 0x02;
/// DCNTL: 53c700 compatibility, disables the legacy interrupt behaviour
pub const DCNTL_COM: u8 = 0x01;

/// Interrupt enables for every condition the handler services
pub const SIEN0_ENABLE: u8 = 0x8F;
pub const SIEN1_ENABLE: u8 = 0x04;
pub const DIEN_ENABLE: u8 = 0x7D;

/// SCSI status codes
pub const STATUS_GOOD: u8 = 0x00;
pub const STATUS_CHECK_CONDITION: u8 = 0x02;
pub const STATUS_BUSY: u8 = 0x08;

/// SCSI message bytes
pub const MSG_COMMAND_COMPLETE: u8 = 0x00;
pub const MSG_EXTENDED: u8 = 0x01;
pub const MSG_SAVE_DATA_POINTERS: u8 = 0x02;
pub const MSG_RESTORE_POINTERS: u8 = 0x03;
pub const MSG_DISCONNECT: u8 = 0x04;
pub const MSG_ABORT: u8 = 0x06;
pub const MSG_REJECT: u8 = 0x07;
pub const MSG_NOP: u8 = 0x08;
pub const MSG_BUS_DEVICE_RESET: u8 = 0x0C;
pub const MSG_IDENTIFY: u8 = 0x80;
pub const MSG_IDENTIFY_DISCONNECT: u8 = 0x40;
pub const EXTENDED_SDTR: u8 = 0x01;
pub const EXTENDED_WDTR: u8 = 0x03;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sbcl_phase() {
        let s = Sbcl(0x80 | 0x07);
        assert!(s.req());
        assert_eq!(Phase::from_code(s.phase()), Phase::MsgIn);
        assert!(s.msg() && s.cd() && s.io());
    }

    #[test]
    fn phase_direction() {
        assert!(Phase::DataIn.is_input());
        assert!(Phase::Status.is_input());
        assert!(Phase::MsgIn.is_input());
        assert!(!Phase::DataOut.is_input());
        assert!(!Phase::MsgOut.is_input());
        assert!(!Phase::Command.is_input());
    }
}
