//! Register file and SCRIPTS processor of a simulated 53c8xx

use anyhow::Result;
use log::*;
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};

use super::bus::ScsiBus;
use crate::bus::{DmaMemory, MemoryError};
use crate::ncr::regs::{
    CTEST2_SIGP, CTEST3_CLF, Dmode, Dstat, ISTAT_ABRT, ISTAT_INTF, ISTAT_SIGP, ISTAT_SRST, Istat,
    Phase, REGISTER_WINDOW, Reg, STEST3_CSF, Scntl1, Sist0, Sist1,
};
use crate::ncr::scripts::insn::{
    self, AluOp, Insn, InsnType, IoOp, MAX_MOVE_COUNT, TcOp, describe, sext24,
};
use crate::types::{BusAddr, Width};

const SCRIPTS_TRACE: bool = false;

const fn idx(reg: Reg) -> usize {
    reg.offset() as usize
}

/// Selection timeout in clocks for an STIME0 code, None when disabled
const fn selection_ticks(stime0: u8) -> Option<u64> {
    match stime0 & 0x0F {
        0 => None,
        code => Some(1 << code),
    }
}

/// Timing registers as the firmware leaves them at power on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmwareRegs {
    pub dmode: u8,
    pub dcntl: u8,
    pub ctest4: u8,
    pub scntl3: u8,
}

impl Default for FirmwareRegs {
    fn default() -> Self {
        Self {
            dmode: 0x80,
            dcntl: 0x00,
            ctest4: 0x00,
            scntl3: 0x03,
        }
    }
}

/// Host bus errors that can be injected into the next fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DmaFault {
    Parity,
    BusFault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Halted,
    Running,
    /// WAIT RESELECT, with the alternate address taken on SIGP
    WaitReselect(BusAddr),
    /// Selecting an ID nobody answers for
    Selecting { remaining: u64, at: BusAddr },
    WaitDisconnect,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChipStats {
    pub instructions: u64,
    pub halts: u64,
    pub intfly: u64,
    pub selections: u64,
    pub selection_timeouts: u64,
    pub reselections: u64,
    pub phase_mismatches: u64,
    pub soft_resets: u64,
    pub bus_resets: u64,
    pub dma_fifo_clears: u64,
    pub scsi_fifo_clears: u64,
}

pub struct SimChip {
    regs: [u8; REGISTER_WINDOW],
    mmio_base: BusAddr,
    io_base: u16,
    state: RunState,
    istat: Istat,
    dstat: Dstat,
    sist0: Sist0,
    sist1: Sist1,
    carry: bool,
    fault: Option<DmaFault>,
    /// Report an illegal instruction along with selection timeouts, the
    /// way some parts do while prefetching past SELECT
    sto_iid_race: bool,
    stats: ChipStats,
}

impl SimChip {
    pub fn new(mmio_base: BusAddr, io_base: u16, firmware: FirmwareRegs, sto_iid_race: bool) -> Self {
        let mut chip = Self {
            regs: [0; REGISTER_WINDOW],
            mmio_base,
            io_base,
            state: RunState::Halted,
            istat: Istat(0),
            dstat: Dstat(0),
            sist0: Sist0(0),
            sist1: Sist1(0),
            carry: false,
            fault: None,
            sto_iid_race,
            stats: ChipStats::default(),
        };
        chip.regs[idx(Reg::Dmode)] = firmware.dmode;
        chip.regs[idx(Reg::Dcntl)] = firmware.dcntl;
        chip.regs[idx(Reg::Ctest4)] = firmware.ctest4;
        chip.regs[idx(Reg::Scntl3)] = firmware.scntl3;
        chip
    }

    pub fn stats(&self) -> &ChipStats {
        &self.stats
    }

    /// Register offset for a memory space address
    pub fn mmio_offset(&self, addr: BusAddr) -> Option<usize> {
        if self.mmio_base == 0 {
            return None;
        }
        let off = addr.checked_sub(self.mmio_base)? as usize;
        (off < REGISTER_WINDOW).then_some(off)
    }

    /// Register offset for an I/O port
    pub fn io_offset(&self, port: u16) -> Option<usize> {
        let off = usize::from(port.checked_sub(self.io_base)?);
        (off < REGISTER_WINDOW).then_some(off)
    }

    /// Interrupt line
    pub fn irq(&self) -> bool {
        let dma = self.istat.dip() && self.dstat.0 & self.regs[idx(Reg::Dien)] != 0;
        let scsi = self.istat.sip()
            && (self.sist0.0 & self.regs[idx(Reg::Sien0)] != 0
                || self.sist1.0 & self.regs[idx(Reg::Sien1)] != 0);
        self.istat.intf() || dma || scsi
    }

    pub fn is_halted(&self) -> bool {
        self.state == RunState::Halted
    }

    /// Stopped, or idling in WAIT RESELECT with nothing to wake it
    pub fn is_idle(&self) -> bool {
        match self.state {
            RunState::Halted => true,
            RunState::WaitReselect(_) => !self.istat.sigp(),
            _ => false,
        }
    }

    /// Next instruction
    pub fn dsp(&self) -> BusAddr {
        self.reg32(Reg::Dsp)
    }

    pub fn inject_fault(&mut self, fault: DmaFault) {
        self.fault = Some(fault);
    }

    /// Another device reset the SCSI bus
    pub fn scsi_reset_detected(&mut self) {
        self.raise_scsi(Sist0(0).with_rst(true), Sist1(0));
    }

    fn reg32(&self, reg: Reg) -> u32 {
        let o = idx(reg);
        u32::from_le_bytes([self.regs[o], self.regs[o + 1], self.regs[o + 2], self.regs[o + 3]])
    }

    fn set_reg32(&mut self, reg: Reg, val: u32) {
        let o = idx(reg);
        self.regs[o..o + 4].copy_from_slice(&val.to_le_bytes());
    }

    fn dsa(&self) -> BusAddr {
        self.reg32(Reg::Dsa)
    }

    fn set_dsp(&mut self, addr: BusAddr) {
        self.set_reg32(Reg::Dsp, addr);
    }

    fn halt(&mut self) {
        if self.state != RunState::Halted {
            self.stats.halts += 1;
        }
        self.state = RunState::Halted;
    }

    fn raise_dma(&mut self, bits: Dstat) {
        self.dstat.0 |= bits.0;
        self.istat.set_dip(true);
        self.halt();
    }

    fn raise_scsi(&mut self, sist0: Sist0, sist1: Sist1) {
        self.sist0.0 |= sist0.0;
        self.sist1.0 |= sist1.0;
        self.istat.set_sip(true);
        self.halt();
    }

    fn illegal(&mut self) {
        self.raise_dma(Dstat(0).with_iid(true));
    }

    fn bus_fault(&mut self, e: MemoryError) {
        warn!("SCRIPTS bus fault: {}", e);
        self.raise_dma(Dstat(0).with_bf(true));
    }

    fn soft_reset(&mut self, bus: &mut ScsiBus) {
        self.regs = [0; REGISTER_WINDOW];
        self.state = RunState::Halted;
        self.istat = Istat(0);
        self.dstat = Dstat(0);
        self.sist0 = Sist0(0);
        self.sist1 = Sist1(0);
        self.carry = false;
        self.fault = None;
        self.stats.soft_resets += 1;
        bus.drop_initiator();
    }

    /// Register read, with the side effects of the interrupt status
    /// registers
    fn read_reg(&mut self, off: usize, bus: &ScsiBus) -> u8 {
        if off >= REGISTER_WINDOW {
            return 0xFF;
        }
        match Reg::from_u8(off as u8) {
            Some(Reg::Istat) => {
                let mut istat = self.istat;
                istat.set_con(bus.connected());
                istat.0
            }
            Some(Reg::Dstat) => {
                let v = self.dstat.with_dfe(true).0;
                self.dstat = Dstat(0);
                self.istat.set_dip(false);
                v
            }
            Some(Reg::Sist0) => {
                let v = self.sist0.0;
                self.sist0 = Sist0(0);
                if self.sist1.0 == 0 {
                    self.istat.set_sip(false);
                }
                v
            }
            Some(Reg::Sist1) => {
                let v = self.sist1.0;
                self.sist1 = Sist1(0);
                if self.sist0.0 == 0 {
                    self.istat.set_sip(false);
                }
                v
            }
            Some(Reg::Ctest2) => {
                let sigp = self.istat.sigp();
                self.istat.set_sigp(false);
                (self.regs[off] & !CTEST2_SIGP) | if sigp { CTEST2_SIGP } else { 0 }
            }
            Some(Reg::Sbcl) => bus.sbcl().0,
            _ => self.regs[off],
        }
    }

    fn write_reg(&mut self, off: usize, val: u8, bus: &mut ScsiBus) {
        if off >= REGISTER_WINDOW {
            return;
        }
        match Reg::from_u8(off as u8) {
            Some(Reg::Istat) => {
                if val & ISTAT_SRST != 0 {
                    self.soft_reset(bus);
                    self.istat.set_srst(true);
                    return;
                }
                if val & ISTAT_INTF != 0 {
                    self.istat.set_intf(false);
                }
                if val & ISTAT_SIGP != 0 {
                    self.istat.set_sigp(true);
                }
                if val & ISTAT_ABRT != 0 && self.state != RunState::Halted {
                    self.raise_dma(Dstat(0).with_abrt(true));
                }
            }
            Some(Reg::Dstat | Reg::Sist0 | Reg::Sist1 | Reg::Sbcl) => (),
            Some(Reg::Scntl1) => {
                let was = Scntl1(self.regs[off]);
                self.regs[off] = val;
                if Scntl1(val).rst() && !was.rst() {
                    self.stats.bus_resets += 1;
                    bus.reset();
                    self.raise_scsi(Sist0(0).with_rst(true), Sist1(0));
                }
            }
            Some(Reg::Ctest3) => {
                if val & CTEST3_CLF != 0 {
                    self.stats.dma_fifo_clears += 1;
                }
                self.regs[off] = val & !CTEST3_CLF;
            }
            Some(Reg::Stest3) => {
                if val & STEST3_CSF != 0 {
                    self.stats.scsi_fifo_clears += 1;
                }
                self.regs[off] = val & !STEST3_CSF;
            }
            _ => self.regs[off] = val,
        }
    }

    /// Register read from the host, little-endian for wider accesses
    pub fn host_read(&mut self, off: usize, width: Width, bus: &ScsiBus) -> u32 {
        (0..width.bytes()).fold(0, |v, i| v | u32::from(self.read_reg(off + i, bus)) << (8 * i))
    }

    /// Register write from the host. Writing the last byte of DSP starts
    /// SCRIPTS.
    pub fn host_write(&mut self, off: usize, width: Width, val: u32, bus: &mut ScsiBus) {
        let bytes = width.bytes();
        for i in 0..bytes {
            self.write_reg(off + i, (val >> (8 * i)) as u8, bus);
        }
        let dsp_last = idx(Reg::Dsp) + 3;
        if (off..off + bytes).contains(&dsp_last) {
            if SCRIPTS_TRACE {
                trace!("SCRIPTS started at {:08X}", self.dsp());
            }
            self.state = RunState::Running;
        }
    }

    /// Advances the chip by one clock: one instruction, or one round of
    /// whatever it is waiting for
    pub fn step<M: DmaMemory>(&mut self, mem: &mut M, bus: &mut ScsiBus) -> Result<()> {
        if self.istat.srst() {
            self.istat.set_srst(false);
            return Ok(());
        }
        match self.state {
            RunState::Halted => (),
            RunState::Running => self.execute(mem, bus)?,
            RunState::WaitReselect(alt) => self.wait_reselect(bus, alt),
            RunState::Selecting { remaining, at } => {
                if remaining <= 1 {
                    self.selection_timeout(at);
                } else {
                    self.state = RunState::Selecting {
                        remaining: remaining - 1,
                        at,
                    };
                }
            }
            RunState::WaitDisconnect => {
                if !bus.connected() {
                    self.state = RunState::Running;
                }
            }
        }
        if bus.take_unexpected_free() {
            self.raise_scsi(Sist0(0).with_udc(true), Sist1(0));
        }
        Ok(())
    }

    fn reselected(&mut self, target: u8) {
        self.stats.reselections += 1;
        self.regs[idx(Reg::Ssid)] = 0x80 | target;
    }

    fn wait_reselect(&mut self, bus: &mut ScsiBus, alt: BusAddr) {
        if let Some((target, _)) = bus.take_reselection() {
            self.reselected(target);
            self.state = RunState::Running;
        } else if self.istat.sigp() {
            self.set_dsp(alt);
            self.state = RunState::Running;
        }
    }

    fn selection_timeout(&mut self, at: BusAddr) {
        self.stats.selection_timeouts += 1;
        self.state = RunState::Running;
        if self.sto_iid_race {
            // Prefetch of the instruction after SELECT went wrong too
            self.set_dsp(at.wrapping_add(16));
            self.raise_dma(Dstat(0).with_iid(true));
        }
        self.raise_scsi(Sist0(0), Sist1(0).with_sto(true));
    }

    fn execute<M: DmaMemory>(&mut self, mem: &mut M, bus: &mut ScsiBus) -> Result<()> {
        let at = self.dsp();
        if let Some(fault) = self.fault.take() {
            warn!("Injected {:?} at {:08X}", fault, at);
            let dstat = match fault {
                DmaFault::Parity => Dstat(0).with_mdpe(true),
                DmaFault::BusFault => Dstat(0).with_bf(true),
            };
            self.raise_dma(dstat);
            return Ok(());
        }
        let (w0, w1) = match (mem.read_u32(at), mem.read_u32(at.wrapping_add(4))) {
            (Ok(w0), Ok(w1)) => (w0, w1),
            (Err(e), _) | (_, Err(e)) => {
                self.bus_fault(e);
                return Ok(());
            }
        };
        let insn = Insn(w0);
        let w2 = if insn.kind() == InsnType::MemoryMove {
            match mem.read_u32(at.wrapping_add(8)) {
                Ok(w) => w,
                Err(e) => {
                    self.bus_fault(e);
                    return Ok(());
                }
            }
        } else {
            0
        };
        let next = at.wrapping_add(insn.size());
        self.set_reg32(Reg::Dbc, w0);
        self.set_reg32(Reg::Dnad, w1);
        self.set_dsp(next);
        self.stats.instructions += 1;
        if SCRIPTS_TRACE {
            trace!("{:08X}: {}", at, describe(w0, w1));
        }

        match insn.kind() {
            InsnType::BlockMove => self.block_move(mem, bus, insn, w1)?,
            InsnType::Io => self.io(mem, bus, insn, w1, next),
            InsnType::TransferControl => self.transfer_control(bus, insn, w1, next),
            InsnType::MemoryMove => self.memory_move(mem, bus, insn.count(), w1, w2),
        }
        Ok(())
    }

    fn mismatch(&mut self, remaining: u32, next_addr: BusAddr) {
        let dcmd = u32::from(self.regs[idx(Reg::Dcmd)]);
        self.set_reg32(Reg::Dbc, dcmd << 24 | remaining);
        self.set_reg32(Reg::Dnad, next_addr);
        self.stats.phase_mismatches += 1;
        self.raise_scsi(Sist0(0).with_ma(true), Sist1(0));
    }

    fn block_move<M: DmaMemory>(
        &mut self,
        mem: &mut M,
        bus: &mut ScsiBus,
        insn: Insn,
        w1: u32,
    ) -> Result<()> {
        if insn.bm_indirect() {
            self.illegal();
            return Ok(());
        }
        let phase = Phase::from_code(insn.phase());
        let (count, addr) = if insn.bm_table() {
            let table = self.dsa().wrapping_add(sext24(w1) as u32);
            match (mem.read_u32(table), mem.read_u32(table.wrapping_add(4))) {
                (Ok(count), Ok(addr)) => (count & MAX_MOVE_COUNT, addr),
                (Err(e), _) | (_, Err(e)) => {
                    self.bus_fault(e);
                    return Ok(());
                }
            }
        } else {
            (insn.count(), w1)
        };
        self.set_reg32(Reg::Dnad, addr);

        let Some(actual) = bus.request() else {
            self.raise_scsi(Sist0(0).with_udc(true), Sist1(0));
            return Ok(());
        };
        if actual != phase {
            self.mismatch(count, addr);
            return Ok(());
        }

        let sxfer = self.regs[idx(Reg::Sxfer)];
        let mut buf = vec![0; count as usize];
        let t = if phase.is_input() {
            let t = bus.receive(phase, &mut buf, sxfer)?;
            if let Err(e) = mem.write_bytes(addr, &buf[..t.moved]) {
                self.bus_fault(e);
                return Ok(());
            }
            if t.moved > 0 {
                self.regs[idx(Reg::Sfbr)] = buf[0];
            }
            t
        } else {
            if let Err(e) = mem.read_bytes(addr, &mut buf) {
                self.bus_fault(e);
                return Ok(());
            }
            let t = bus.send(phase, &buf, sxfer)?;
            if phase == Phase::MsgOut && t.moved == buf.len() {
                bus.end_message_out()?;
            }
            t
        };

        let remaining = count - t.moved as u32;
        let next_addr = addr.wrapping_add(t.moved as u32);
        if t.parity_error {
            let dcmd = u32::from(self.regs[idx(Reg::Dcmd)]);
            self.set_reg32(Reg::Dbc, dcmd << 24 | remaining);
            self.set_reg32(Reg::Dnad, next_addr);
            self.raise_scsi(Sist0(0).with_par(true), Sist1(0));
        } else if remaining > 0 && bus.connected() {
            self.mismatch(remaining, next_addr);
        }
        Ok(())
    }

    fn io<M: DmaMemory>(&mut self, mem: &mut M, bus: &mut ScsiBus, insn: Insn, w1: u32, next: BusAddr) {
        let alt = if insn.io_relative() {
            next.wrapping_add(sext24(w1) as u32)
        } else {
            w1
        };
        match insn.io_op() {
            IoOp::Select => self.select(mem, bus, insn, alt),
            IoOp::WaitDisconnect => {
                if bus.connected() {
                    self.state = RunState::WaitDisconnect;
                }
            }
            IoOp::WaitReselect => {
                if bus.connected() {
                    self.illegal();
                } else {
                    self.state = RunState::WaitReselect(alt);
                    self.wait_reselect(bus, alt);
                }
            }
            op @ (IoOp::Set | IoOp::Clear) => {
                let on = op == IoOp::Set;
                let bits = u32::from(insn.io_bits());
                if bits & insn::CARRY != 0 {
                    self.carry = on;
                }
                if bits & insn::ATN != 0 {
                    bus.set_atn(on);
                }
                if bits & insn::ACK != 0 && !on {
                    bus.release_ack();
                }
            }
            op => self.register_op(bus, insn, op),
        }
    }

    fn select<M: DmaMemory>(&mut self, mem: &mut M, bus: &mut ScsiBus, insn: Insn, alt: BusAddr) {
        if !insn.io_table() {
            self.illegal();
            return;
        }
        let table = self.dsa().wrapping_add(sext24(insn.io_table_offset()) as u32);
        let word = match mem.read_u32(table) {
            Ok(w) => w,
            Err(e) => {
                self.bus_fault(e);
                return;
            }
        };
        let target = ((word >> 16) & 0x0F) as u8;
        self.regs[idx(Reg::Scntl3)] = (word >> 24) as u8;
        self.regs[idx(Reg::Sdid)] = target;
        self.regs[idx(Reg::Sxfer)] = (word >> 8) as u8;
        self.stats.selections += 1;

        if bus.connected() {
            self.raise_scsi(Sist0(0).with_sge(true), Sist1(0));
            return;
        }
        // Lost arbitration to a reselecting target
        if let Some((id, _)) = bus.take_reselection() {
            self.reselected(id);
            self.set_dsp(alt);
            return;
        }
        if bus.select(target, insn.io_atn()) {
            return;
        }
        let at = self.dsp().wrapping_sub(8);
        let remaining = selection_ticks(self.regs[idx(Reg::Stime0)]).unwrap_or(u64::MAX);
        self.state = RunState::Selecting { remaining, at };
    }

    fn alu(&mut self, op: AluOp, src: u8, data: u8) -> u8 {
        match op {
            AluOp::Move => src,
            AluOp::Shl => {
                let v = src << 1 | u8::from(self.carry);
                self.carry = src & 0x80 != 0;
                v
            }
            AluOp::Or => src | data,
            AluOp::Xor => src ^ data,
            AluOp::And => src & data,
            AluOp::Shr => {
                let v = src >> 1 | u8::from(self.carry) << 7;
                self.carry = src & 1 != 0;
                v
            }
            AluOp::Add => {
                let (v, c) = src.overflowing_add(data);
                self.carry = c;
                v
            }
            AluOp::AddCarry => {
                let sum = u16::from(src) + u16::from(data) + u16::from(self.carry);
                self.carry = sum > 0xFF;
                sum as u8
            }
        }
    }

    fn register_op(&mut self, bus: &mut ScsiBus, insn: Insn, op: IoOp) {
        let reg = usize::from(insn.rw_register());
        let data = insn.rw_data();
        let alu = insn.alu_op();
        match op {
            IoOp::FromSfbr => {
                let sfbr = self.regs[idx(Reg::Sfbr)];
                let v = self.alu(alu, sfbr, data);
                self.write_reg(reg, v, bus);
            }
            IoOp::ToSfbr => {
                let r = self.read_reg(reg, bus);
                self.regs[idx(Reg::Sfbr)] = self.alu(alu, r, data);
            }
            _ => {
                let v = if alu == AluOp::Move {
                    data
                } else {
                    let r = self.read_reg(reg, bus);
                    self.alu(alu, r, data)
                };
                self.write_reg(reg, v, bus);
            }
        }
    }

    fn condition(&mut self, bus: &mut ScsiBus, insn: Insn) -> bool {
        let mut matched = true;
        if insn.tc_cmp_phase() {
            let phase = if insn.tc_wait() {
                bus.request()
            } else {
                bus.phase()
            };
            match phase {
                Some(p) => matched &= p.code() == insn.phase(),
                None => {
                    if insn.tc_wait() {
                        self.raise_scsi(Sist0(0).with_udc(true), Sist1(0));
                    }
                    matched = false;
                }
            }
        }
        if insn.tc_cmp_data() {
            let sfbr = self.regs[idx(Reg::Sfbr)];
            matched &= (sfbr ^ insn.tc_data()) & !insn.tc_mask() == 0;
        }
        if insn.tc_carry() {
            matched &= self.carry;
        }
        matched == insn.tc_jump_if_true()
    }

    fn transfer_control(&mut self, bus: &mut ScsiBus, insn: Insn, w1: u32, next: BusAddr) {
        let Some(op) = insn.tc_op() else {
            self.illegal();
            return;
        };
        if !self.condition(bus, insn) {
            return;
        }
        let target = if insn.tc_relative() {
            next.wrapping_add(sext24(w1) as u32)
        } else {
            w1
        };
        match op {
            TcOp::Jump => self.set_dsp(target),
            TcOp::Call => {
                self.set_reg32(Reg::Temp, next);
                self.set_dsp(target);
            }
            TcOp::Return => {
                let temp = self.reg32(Reg::Temp);
                self.set_dsp(temp);
            }
            TcOp::Int if insn.tc_intfly() => {
                self.stats.intfly += 1;
                self.istat.set_intf(true);
            }
            TcOp::Int => {
                self.set_reg32(Reg::Dsps, w1);
                self.raise_dma(Dstat(0).with_sir(true));
            }
        }
    }

    /// Register offset a memory move operand resolves to. Err when the
    /// operand is flagged as I/O space but lies outside the window.
    fn move_operand(&self, addr: BusAddr, io: bool) -> Result<Option<usize>, MemoryError> {
        if io {
            let off = addr.checked_sub(BusAddr::from(self.io_base));
            return match off {
                Some(off) if (off as usize) < REGISTER_WINDOW => Ok(Some(off as usize)),
                _ => Err(MemoryError::OutOfRange { addr, len: 1 }),
            };
        }
        Ok(self.mmio_offset(addr))
    }

    fn memory_move<M: DmaMemory>(&mut self, mem: &mut M, bus: &mut ScsiBus, count: u32, src: BusAddr, dst: BusAddr) {
        let dmode = Dmode(self.regs[idx(Reg::Dmode)]);
        let mut buf = vec![0; count as usize];

        match self.move_operand(src, dmode.siom()) {
            Ok(Some(off)) => {
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = self.read_reg(off + i, bus);
                }
            }
            Ok(None) => {
                if let Err(e) = mem.read_bytes(src, &mut buf) {
                    self.bus_fault(e);
                    return;
                }
            }
            Err(e) => {
                self.bus_fault(e);
                return;
            }
        }
        match self.move_operand(dst, dmode.diom()) {
            Ok(Some(off)) => {
                for (i, &b) in buf.iter().enumerate() {
                    self.write_reg(off + i, b, bus);
                }
            }
            Ok(None) => {
                if let Err(e) = mem.write_bytes(dst, &buf) {
                    self.bus_fault(e);
                }
            }
            Err(e) => self.bus_fault(e),
        }
    }
}
