//! The SCRIPTS program run by the chip and its symbol tables

pub mod insn;
pub mod program;

use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use strum::{EnumCount, EnumIter};

/// Named locations in the SCRIPTS program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumCount, EnumIter, strum::IntoStaticStr)]
pub enum Label {
    Schedule,
    Issue,
    JumpDsa,
    WaitReselect,
    ReselectAlt,
    Reselected,
    ReselectWalk,
    ReselectWalkGo,
    JumpReselectDsa,
    Select,
    SelectEnd,
    ReselectedDuringSelect,
    MsgIn,
    MsgExtended,
    MsgExt2,
    MsgExt3,
    MsgDisconnect,
    RejectMessage,
    AcceptMessage,
    RespondMessage,
    CommandComplete,
    CommandCompleteInt,
    OtherTransfer,
    InitiatorAbort,
    IaDataOut,
    IaCommand,
    IaStatus,
    IaMsgIn,
    IaDrained,
    IaMsgOut,
    TargetAbort,
    Test1,
    Test2,
    JumpTest2,
    Test3,
    DsaCodeTemplate,
    DsaJumpResume,
    DsaDispatch,
    DsaDataInJump,
    DsaDataOutJump,
    DsaSendCmd,
    DsaReselectCheck,
    DsaCheckLun,
    DsaNoMatch,
    DsaMatched,
    DsaCodeTemplateEnd,
}

/// Constants owned by the host that the program refers to by address
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumCount, EnumIter, strum::IntoStaticStr)]
pub enum Extern {
    /// A zero dword
    Zero,
    AbortMsg,
    RejectMsg,
    NopMsg,
    /// Scratch destination for discarded bytes
    Sink,
}

/// Host cells the program reads and writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumCount, EnumIter, strum::IntoStaticStr)]
pub enum AbsSymbol {
    IssueDsaHead,
    ReconnectDsaHead,
    ReconnectCursor,
    MsgBuf,
    ReselectedIdentify,
    ReselectedTag,
    TestSrc,
    TestDst,
}

/// Memory move direction, decides which DMODE value a register write
/// instruction loads before a move touching chip registers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DmodeKind {
    MemoryToMemory,
    MemoryToNcr,
    NcrToMemory,
    NcrToNcr,
}

/// What a patch site in the program holds before fixup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    /// Program-relative address
    Label,
    Extern(Extern),
    /// Offset from a host cell
    Abs(AbsSymbol),
    /// Register offset, becomes the chip-visible register address
    Register,
    /// Data byte of a register write that loads DMODE
    Dmode(DmodeKind),
    /// Completion interrupt, turned into INTFLY when enabled
    IntflyCompletion,
    /// Offset into a command descriptor, resolved per descriptor
    DsaRelative,
    /// Compare data of the reselection target check, per descriptor
    TargetImmediate,
    /// Compare data of the reselection LUN check, per descriptor
    LunImmediate,
}

impl PatchKind {
    /// Sites only the descriptor builder resolves
    pub const fn per_descriptor(self) -> bool {
        matches!(
            self,
            Self::DsaRelative | Self::TargetImmediate | Self::LunImmediate
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchSite {
    /// Word index into the program
    pub word: usize,
    pub kind: PatchKind,
}

/// Interrupt codes raised by the program through DSPS
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, strum::IntoStaticStr)]
#[repr(u32)]
pub enum IntCode {
    NormCommandComplete = 0x0001_0000,
    NormDisconnected = 0x0001_0001,
    NormReselectComplete = 0x0001_0002,
    NormSelectLost = 0x0001_0003,
    NormAborted = 0x0001_0004,
    Msg1 = 0x0002_0000,
    MsgSdtr = 0x0002_0001,
    MsgWdtr = 0x0002_0002,
    ErrSelected = 0x0003_0000,
    ErrUnexpectedReselect = 0x0003_0001,
    ErrUnexpectedPhase = 0x0003_0002,
    ErrCheckCondition = 0x0003_0003,
    Test1 = 0x0004_0001,
    Test3 = 0x0004_0003,
    DebugBreak = 0x0005_0000,
}
