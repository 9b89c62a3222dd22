//! SCRIPTS instruction encoding and decoding

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use proc_bitfield::bitfield;

use crate::ncr::regs::Phase;

/// Largest byte count a single block or memory move can carry
pub const MAX_MOVE_COUNT: u32 = 0x00FF_FFFF;

/// SET/CLEAR operand bits
pub const ATN: u32 = 1 << 3;
pub const ACK: u32 = 1 << 6;
pub const TARGET: u32 = 1 << 9;
pub const CARRY: u32 = 1 << 10;

bitfield! {
    /// First word of a SCRIPTS instruction. Field names are per instruction
    /// type; only the ones matching `itype` are meaningful.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Insn(pub u32): Debug, FromStorage, IntoStorage, DerefStorage {
        pub itype: u8 @ 30..=31,
        pub dcmd: u8 @ 24..=31,

        // Block move
        pub bm_indirect: bool @ 29,
        pub bm_table: bool @ 28,
        pub bm_opcode: bool @ 27,
        pub phase: u8 @ 24..=26,
        pub count: u32 @ 0..=23,

        // I/O, register and transfer control
        pub opcode: u8 @ 27..=29,
        pub io_relative: bool @ 26,
        pub io_table: bool @ 25,
        pub io_atn: bool @ 24,
        pub io_table_offset: u32 @ 0..=23,
        pub io_bits: u16 @ 0..=15,
        pub rw_operator: u8 @ 24..=26,
        pub rw_register: u8 @ 16..=22,
        pub rw_data: u8 @ 8..=15,
        pub tc_relative: bool @ 23,
        pub tc_carry: bool @ 21,
        pub tc_intfly: bool @ 20,
        pub tc_jump_if_true: bool @ 19,
        pub tc_cmp_data: bool @ 18,
        pub tc_cmp_phase: bool @ 17,
        pub tc_wait: bool @ 16,
        pub tc_mask: u8 @ 8..=15,
        pub tc_data: u8 @ 0..=7,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum InsnType {
    BlockMove = 0,
    Io = 1,
    TransferControl = 2,
    MemoryMove = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum IoOp {
    Select = 0,
    WaitDisconnect = 1,
    WaitReselect = 2,
    Set = 3,
    Clear = 4,
    /// MOVE SFBR <op> data TO register
    FromSfbr = 5,
    /// MOVE register <op> data TO SFBR
    ToSfbr = 6,
    /// MOVE register <op> data TO register
    ReadModifyWrite = 7,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum TcOp {
    Jump = 0,
    Call = 1,
    Return = 2,
    Int = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum AluOp {
    Move = 0,
    Shl = 1,
    Or = 2,
    Xor = 3,
    And = 4,
    Shr = 5,
    Add = 6,
    AddCarry = 7,
}

impl Insn {
    pub fn kind(self) -> InsnType {
        InsnType::from_u8(self.itype()).unwrap_or(InsnType::BlockMove)
    }

    pub fn io_op(self) -> IoOp {
        IoOp::from_u8(self.opcode()).unwrap_or(IoOp::Select)
    }

    /// None for the reserved opcodes 4..=7
    pub fn tc_op(self) -> Option<TcOp> {
        TcOp::from_u8(self.opcode())
    }

    pub fn alu_op(self) -> AluOp {
        AluOp::from_u8(self.rw_operator()).unwrap_or(AluOp::Move)
    }

    /// Length of the instruction in bytes
    pub fn size(self) -> u32 {
        if self.kind() == InsnType::MemoryMove { 12 } else { 8 }
    }
}

/// Transfer control condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cond(u32);

impl Cond {
    const JUMP_IF_TRUE: u32 = 1 << 19;
    const CMP_DATA: u32 = 1 << 18;
    const CMP_PHASE: u32 = 1 << 17;
    const WAIT: u32 = 1 << 16;

    pub const ALWAYS: Self = Self(Self::JUMP_IF_TRUE);

    /// Waits for REQ, then compares the phase
    pub const fn when(phase: Phase) -> Self {
        Self(Self::JUMP_IF_TRUE | Self::CMP_PHASE | Self::WAIT | (phase.code() as u32) << 24)
    }

    pub const fn if_phase(phase: Phase) -> Self {
        Self(Self::JUMP_IF_TRUE | Self::CMP_PHASE | (phase.code() as u32) << 24)
    }

    pub const fn if_data(data: u8) -> Self {
        Self(Self::JUMP_IF_TRUE | Self::CMP_DATA | data as u32)
    }

    /// Bits set in the mask are excluded from the data compare
    pub const fn mask(self, mask: u8) -> Self {
        Self(self.0 | (mask as u32) << 8)
    }

    pub const fn not(self) -> Self {
        Self(self.0 & !Self::JUMP_IF_TRUE)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }
}

pub const fn move_direct(phase: Phase, count: u32) -> u32 {
    0x0800_0000 | (phase.code() as u32) << 24 | (count & MAX_MOVE_COUNT)
}

pub const fn move_table(phase: Phase) -> u32 {
    0x1800_0000 | (phase.code() as u32) << 24
}

pub const fn select_table(atn: bool, table_offset: u32) -> u32 {
    0x4200_0000 | (atn as u32) << 24 | (table_offset & MAX_MOVE_COUNT)
}

pub const fn wait_disconnect() -> u32 {
    0x4800_0000
}

pub const fn wait_reselect() -> u32 {
    0x5000_0000
}

pub const fn set(bits: u32) -> u32 {
    0x5800_0000 | bits
}

pub const fn clear(bits: u32) -> u32 {
    0x6000_0000 | bits
}

pub const fn reg_op(op: IoOp, alu: AluOp, reg: u8, data: u8) -> u32 {
    0x4000_0000 | (op as u32) << 27 | (alu as u32) << 24 | ((reg & 0x7F) as u32) << 16 | (data as u32) << 8
}

pub const fn transfer(op: TcOp, cond: Cond) -> u32 {
    0x8000_0000 | (op as u32) << 27 | cond.bits()
}

pub const fn relative(word0: u32) -> u32 {
    word0 | 1 << 23
}

pub const fn memory_move(count: u32) -> u32 {
    0xC000_0000 | (count & MAX_MOVE_COUNT)
}

/// Sign-extends a 24-bit offset
pub const fn sext24(v: u32) -> i32 {
    ((v << 8) as i32) >> 8
}

/// Human readable form of an instruction, for tracing
pub fn describe(w0: u32, w1: u32) -> String {
    let insn = Insn(w0);
    match insn.kind() {
        InsnType::BlockMove => {
            let phase: &str = Phase::from_code(insn.phase()).into();
            if insn.bm_table() {
                format!("MOVE FROM dsa{:+}, WHEN {}", sext24(w1), phase)
            } else {
                format!("MOVE {}, {:08X}, WHEN {}", insn.count(), w1, phase)
            }
        }
        InsnType::Io => match insn.io_op() {
            IoOp::Select => format!(
                "SELECT{} FROM dsa{:+}, {:08X}",
                if insn.io_atn() { " ATN" } else { "" },
                sext24(insn.io_table_offset()),
                w1
            ),
            IoOp::WaitDisconnect => "WAIT DISCONNECT".to_string(),
            IoOp::WaitReselect => format!("WAIT RESELECT {:08X}", w1),
            IoOp::Set => format!("SET {:03X}", insn.io_bits()),
            IoOp::Clear => format!("CLEAR {:03X}", insn.io_bits()),
            op => format!(
                "MOVE {:?} {:?} reg {:02X} data {:02X}",
                op,
                insn.alu_op(),
                insn.rw_register(),
                insn.rw_data()
            ),
        },
        InsnType::TransferControl => {
            let mut s = match insn.tc_op() {
                Some(TcOp::Jump) => format!("JUMP {:08X}", w1),
                Some(TcOp::Call) => format!("CALL {:08X}", w1),
                Some(TcOp::Return) => "RETURN".to_string(),
                Some(TcOp::Int) if insn.tc_intfly() => "INTFLY".to_string(),
                Some(TcOp::Int) => format!("INT {:08X}", w1),
                None => return format!("ILLEGAL {:08X}", w0),
            };
            if insn.tc_relative() {
                s.push_str(" REL");
            }
            if insn.tc_cmp_phase() || insn.tc_cmp_data() {
                s.push_str(if insn.tc_wait() { ", WHEN" } else { ", IF" });
                if !insn.tc_jump_if_true() {
                    s.push_str(" NOT");
                }
                if insn.tc_cmp_phase() {
                    let phase: &str = Phase::from_code(insn.phase()).into();
                    s.push(' ');
                    s.push_str(phase);
                }
                if insn.tc_cmp_data() {
                    s.push_str(&format!(" {:02X}", insn.tc_data()));
                    if insn.tc_mask() != 0 {
                        s.push_str(&format!(" AND MASK {:02X}", insn.tc_mask()));
                    }
                }
            }
            s
        }
        InsnType::MemoryMove => format!("MOVE MEMORY {}, {:08X}, ...", insn.count(), w1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_block_move() {
        let i = Insn(move_direct(Phase::DataIn, 512));
        assert_eq!(i.kind(), InsnType::BlockMove);
        assert_eq!(Phase::from_code(i.phase()), Phase::DataIn);
        assert_eq!(i.count(), 512);
        assert!(!i.bm_table());
        assert_eq!(i.dcmd(), 0x09);
        assert_eq!(i.size(), 8);

        let t = Insn(move_table(Phase::MsgOut));
        assert!(t.bm_table());
        assert_eq!(t.dcmd(), 0x1E);
    }

    #[test]
    fn decode_transfer() {
        let i = Insn(transfer(TcOp::Jump, Cond::when(Phase::Status)));
        assert_eq!(i.kind(), InsnType::TransferControl);
        assert_eq!(i.tc_op(), Some(TcOp::Jump));
        assert!(i.tc_wait() && i.tc_cmp_phase() && i.tc_jump_if_true());
        assert_eq!(Phase::from_code(i.phase()), Phase::Status);

        let i = Insn(transfer(TcOp::Int, Cond::if_data(0x02).mask(0xC1).not()));
        assert_eq!(i.tc_op(), Some(TcOp::Int));
        assert!(!i.tc_jump_if_true());
        assert_eq!(i.tc_data(), 0x02);
        assert_eq!(i.tc_mask(), 0xC1);
        assert_eq!(transfer(TcOp::Jump, Cond::ALWAYS), 0x8008_0000);
        assert_eq!(transfer(TcOp::Return, Cond::ALWAYS), 0x9008_0000);
    }

    #[test]
    fn decode_register_ops() {
        let i = Insn(reg_op(IoOp::ReadModifyWrite, AluOp::Move, 0x5C, 0x01));
        assert_eq!(i.kind(), InsnType::Io);
        assert_eq!(i.io_op(), IoOp::ReadModifyWrite);
        assert_eq!(i.rw_register(), 0x5C);
        assert_eq!(i.rw_data(), 0x01);
        assert_eq!(i.dcmd(), 0x78);

        let i = Insn(reg_op(IoOp::ToSfbr, AluOp::Move, 0x34, 0));
        assert_eq!(i.dcmd(), 0x70);
        assert_eq!(Insn(clear(ACK)).io_op(), IoOp::Clear);
        assert_eq!(Insn(select_table(true, 8)).io_table_offset(), 8);
        assert!(Insn(select_table(true, 8)).io_atn());
    }

    #[test]
    fn memory_move_len() {
        let i = Insn(memory_move(4));
        assert_eq!(i.kind(), InsnType::MemoryMove);
        assert_eq!(i.size(), 12);
        assert_eq!(i.count(), 4);
    }

    #[test]
    fn sign_extend() {
        assert_eq!(sext24(0x00FF_FFF8), -8);
        assert_eq!(sext24(0x10), 16);
    }

    #[test]
    fn describe_text() {
        assert_eq!(
            describe(transfer(TcOp::Jump, Cond::when(Phase::MsgIn)), 0x100),
            "JUMP 00000100, WHEN MsgIn"
        );
        assert_eq!(describe(wait_disconnect(), 0), "WAIT DISCONNECT");
    }
}
