//! Per-target synchronous transfer state

use log::*;
use serde::Serialize;

use super::chip::ChipInfo;
use super::fixup::HostCells;
use super::regs::{EXTENDED_SDTR, MSG_EXTENDED, Reg, Scntl3, Sxfer};
use super::scripts::insn::{self, AluOp, Cond, IoOp, TcOp};
use crate::bus::{DmaMemory, MemoryResult};

/// Three instructions: load SCNTL3, load SXFER, return
pub const SYNC_FRAGMENT_SIZE: u32 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::IntoStaticStr)]
pub enum Negotiation {
    /// Next command to the target carries an SDTR
    Needed,
    InProgress,
    Done,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TargetSync {
    /// Agreed SDTR period factor, 0 when asynchronous
    pub period_factor: u8,
    pub offset: u8,
    pub sxfer: u8,
    pub scntl3: u8,
    pub negotiation: Negotiation,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncTable {
    targets: [TargetSync; 8],
    async_scntl3: u8,
    enabled: bool,
    clock_mhz: u8,
}

impl SyncTable {
    pub fn new(enabled: bool, async_scntl3: Scntl3, clock_mhz: u8) -> Self {
        let negotiation = if enabled {
            Negotiation::Needed
        } else {
            Negotiation::Disabled
        };
        Self {
            targets: [TargetSync {
                period_factor: 0,
                offset: 0,
                sxfer: 0,
                scntl3: async_scntl3.0,
                negotiation,
            }; 8],
            async_scntl3: async_scntl3.0,
            enabled,
            clock_mhz,
        }
    }

    pub fn get(&self, target: u8) -> &TargetSync {
        &self.targets[usize::from(target & 7)]
    }

    pub fn set_async(&mut self, target: u8) {
        let t = &mut self.targets[usize::from(target & 7)];
        t.period_factor = 0;
        t.offset = 0;
        t.sxfer = 0;
        t.scntl3 = self.async_scntl3;
    }

    /// Records a negotiated agreement, clamped to what the chip can do.
    /// Returns the values actually programmed.
    pub fn set_negotiated(&mut self, target: u8, period: u8, offset: u8, chip: &ChipInfo) -> (u8, u8) {
        let offset = offset.min(chip.max_sync_offset);
        if offset == 0 || period == 0 {
            self.set_async(target);
            self.targets[usize::from(target & 7)].negotiation = Negotiation::Done;
            return (0, 0);
        }
        let period = period.max(chip.min_period_factor);

        // One SCSI clock per synchronous clock, TP counts extra clocks over 4
        let clock_ns = 1000 / u32::from(self.clock_mhz.max(1));
        let clocks = (u32::from(period) * 4).div_ceil(clock_ns);
        let mut sxfer = Sxfer(0);
        sxfer.set_tp(clocks.saturating_sub(4).min(7) as u8);
        sxfer.set_offset(offset);
        let mut scntl3 = Scntl3(self.async_scntl3);
        scntl3.set_scf(1);

        let t = &mut self.targets[usize::from(target & 7)];
        t.period_factor = period;
        t.offset = offset;
        t.sxfer = sxfer.0;
        t.scntl3 = scntl3.0;
        t.negotiation = Negotiation::Done;
        (period, offset)
    }

    pub fn set_negotiation(&mut self, target: u8, n: Negotiation) {
        self.targets[usize::from(target & 7)].negotiation = n;
    }

    /// Forgets all agreements, after a bus reset targets are asynchronous
    pub fn renegotiate_all(&mut self) {
        for t in 0..8 {
            self.set_async(t);
            self.targets[usize::from(t)].negotiation = if self.enabled {
                Negotiation::Needed
            } else {
                Negotiation::Disabled
            };
        }
    }

    /// Table indirect SELECT operand: SCNTL3, target id, SXFER
    pub fn select_word(&self, target: u8) -> u32 {
        let t = self.get(target);
        u32::from(t.scntl3) << 24 | u32::from(target & 7) << 16 | u32::from(t.sxfer) << 8
    }

    /// Rewrites the chip-resident fragment that reprograms the transfer
    /// registers after a reselection
    pub fn write_fragment<M: DmaMemory>(&self, mem: &mut M, cells: &HostCells, target: u8) -> MemoryResult<()> {
        let t = self.get(target);
        let words = [
            insn::reg_op(IoOp::ReadModifyWrite, AluOp::Move, Reg::Scntl3.offset(), t.scntl3),
            0,
            insn::reg_op(IoOp::ReadModifyWrite, AluOp::Move, Reg::Sxfer.offset(), t.sxfer),
            0,
            insn::transfer(TcOp::Return, Cond::ALWAYS),
            0,
        ];
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        trace!(
            "sync fragment target {}: scntl3 {:02X} sxfer {:02X}",
            target, t.scntl3, t.sxfer
        );
        mem.write_bytes(cells.sync_fragment(target), &bytes)
    }
}

pub fn sdtr_message(period: u8, offset: u8) -> [u8; 5] {
    [MSG_EXTENDED, 0x03, EXTENDED_SDTR, period, offset]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::arena::DmaArena;
    use crate::ncr::chip::lookup;
    use crate::ncr::scripts::insn::Insn;

    #[test]
    fn negotiate_clamps() {
        let chip = lookup(0x0001, 0).unwrap();
        let mut s = SyncTable::new(true, Scntl3(0x03), 40);
        assert_eq!(s.get(2).negotiation, Negotiation::Needed);
        assert_eq!(s.set_negotiated(2, 12, 15, chip), (25, 8));
        let t = s.get(2);
        assert_eq!(t.negotiation, Negotiation::Done);
        // 100ns at 25ns per clock is the minimum of four clocks
        assert_eq!(Sxfer(t.sxfer).tp(), 0);
        assert_eq!(Sxfer(t.sxfer).offset(), 8);
        assert_eq!(Scntl3(t.scntl3).scf(), 1);
        assert_eq!(Scntl3(t.scntl3).ccf(), 3);

        s.set_negotiated(3, 50, 4, chip);
        assert_eq!(Sxfer(s.get(3).sxfer).tp(), 4);
    }

    #[test]
    fn zero_offset_is_async() {
        let chip = lookup(0x0001, 0).unwrap();
        let mut s = SyncTable::new(true, Scntl3(0x03), 40);
        assert_eq!(s.set_negotiated(1, 25, 0, chip), (0, 0));
        assert_eq!(s.get(1).sxfer, 0);
        assert_eq!(s.get(1).negotiation, Negotiation::Done);
    }

    #[test]
    fn select_word_layout() {
        let chip = lookup(0x0001, 0).unwrap();
        let mut s = SyncTable::new(true, Scntl3(0x03), 40);
        assert_eq!(s.select_word(5), 0x0305_0000);
        s.set_negotiated(5, 25, 8, chip);
        assert_eq!(s.select_word(5), 0x1305_0800);
        s.renegotiate_all();
        assert_eq!(s.select_word(5), 0x0305_0000);
        assert_eq!(s.get(5).negotiation, Negotiation::Needed);
    }

    #[test]
    fn fragment_encoding() {
        let mut mem = DmaArena::new(0, 0x1000);
        let cells = HostCells { base: 0x100 };
        let s = SyncTable::new(false, Scntl3(0x03), 40);
        s.write_fragment(&mut mem, &cells, 4).unwrap();
        let at = cells.sync_fragment(4);
        let i = Insn(mem.read_u32(at).unwrap());
        assert_eq!(i.rw_register(), Reg::Scntl3.offset());
        assert_eq!(i.rw_data(), 0x03);
        let r = Insn(mem.read_u32(at + 16).unwrap());
        assert_eq!(r.tc_op(), Some(TcOp::Return));
    }
}
