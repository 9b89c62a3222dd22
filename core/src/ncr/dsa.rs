//! Command descriptors (DSA blocks): layout, pool and builder
//!
//! A descriptor is a copy of the per-command SCRIPTS fragment followed by
//! the table indirect fields the chip addresses through DSA, and the
//! generated data transfer streams:
//!
//! ```text
//!  base                      code fragment (entry point, resume slot, dispatch)
//!  base + DSA_FIELDS_START   fields, DSA register points here
//!  fields + DATA_STREAMS     data-in stream, data-out stream
//! ```

use log::*;
use serde::Serialize;

use super::command::{
    DataDirection, HostStatus, MAX_CDB_LEN, SENSE_BUFFER_SIZE, ScsiCommand, SgSegment,
};
use super::error::DriverError;
use super::fixup::{FixedScript, HostCells};
use super::regs::Phase;
use super::scripts::insn::{self, Cond, Insn, MAX_MOVE_COUNT, TcOp};
use super::scripts::{Extern, Label, PatchKind};
use crate::bus::{DmaMemory, MemoryResult};
use crate::types::BusAddr;

/// Length of the code fragment, where the fields start
pub const DSA_FIELDS_START: u32 = 268;
pub const DSA_JUMP_RESUME: u32 = 64;
pub const DSA_DISPATCH: u32 = 72;
pub const DSA_DATA_IN_JUMP: u32 = 72;
pub const DSA_DATA_OUT_JUMP: u32 = 80;

pub const FIELD_NEXT: u32 = 0;
pub const FIELD_SELF: u32 = 4;
pub const FIELD_SELECT: u32 = 8;
pub const FIELD_MSGOUT: u32 = 12;
pub const FIELD_CMDOUT: u32 = 20;
pub const FIELD_STATUS: u32 = 28;
pub const FIELD_MSGIN: u32 = 36;
pub const FIELD_MSGOUT_OTHER: u32 = 44;
/// Status byte, message byte
pub const FIELD_RESULT: u32 = 52;
pub const FIELD_MSGOUT_BUF: u32 = 56;
pub const FIELD_MSGOUT_OTHER_BUF: u32 = 64;
pub const FIELD_CDB: u32 = 72;
pub const FIELD_SENSE_CDB: u32 = 88;
pub const FIELD_SENSE: u32 = 96;
pub const FIELD_DATA_STREAMS: u32 = 112;

/// RESULT before the chip stored status and message
pub const RESULT_INCOMPLETE: u32 = 0xFFFF_FFFF;

const _: () = assert!(FIELD_SENSE + SENSE_BUFFER_SIZE as u32 <= FIELD_DATA_STREAMS);

/// Instructions reserved per data phase: MOVE and CALL per segment, the
/// closing JUMP and slack for the sense rewrite
pub const fn stream_budget(segments: usize) -> usize {
    2 * segments + 3
}

pub const fn descriptor_size(segments: usize) -> usize {
    (DSA_FIELDS_START + FIELD_DATA_STREAMS) as usize + 2 * stream_budget(segments) * 8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DsaId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::IntoStaticStr)]
pub enum DsaState {
    Free,
    /// Waiting in the host-only software queue
    SoftQueued,
    /// Handed to the chip: in the issue queue or connected
    Issued,
    /// In the reconnect queue
    Disconnected,
}

#[derive(Debug)]
pub struct Descriptor {
    pub base: BusAddr,
    pub state: DsaState,
    pub cmd: Option<ScsiCommand>,
    pub target: u8,
    pub lun: u8,
    /// Running the automatic REQUEST SENSE
    pub sensing: bool,
    /// Status of the original command when sensing
    pub original_status: u8,
    /// Outcome to report once the abort sequence finishes
    pub pending: Option<HostStatus>,
    /// Carried an SDTR in its message out
    pub sdtr_sent: bool,
    pub bootstrap: bool,
    budget: usize,
}

impl Descriptor {
    /// Value of the DSA register while this descriptor runs
    pub fn fields(&self) -> BusAddr {
        self.base + DSA_FIELDS_START
    }

    pub fn field(&self, f: u32) -> BusAddr {
        self.fields() + f
    }

    pub fn next_link(&self) -> BusAddr {
        self.field(FIELD_NEXT)
    }

    pub fn resume_slot(&self) -> BusAddr {
        self.base + DSA_JUMP_RESUME
    }

    pub fn dispatch(&self) -> BusAddr {
        self.base + DSA_DISPATCH
    }

    pub fn data_in_stream(&self) -> BusAddr {
        self.field(FIELD_DATA_STREAMS)
    }

    pub fn data_out_stream(&self) -> BusAddr {
        self.data_in_stream() + (self.budget * 8) as BusAddr
    }

    /// Both generated streams
    pub fn streams(&self) -> std::ops::Range<BusAddr> {
        self.data_in_stream()..(self.data_out_stream() + (self.budget * 8) as BusAddr)
    }

    pub fn is_active(&self) -> bool {
        self.state != DsaState::Free
    }

    /// Status and message bytes, None until the chip stored both
    pub fn read_result<M: DmaMemory>(&self, mem: &M) -> MemoryResult<Option<(u8, u8)>> {
        let r = mem.read_u32(self.field(FIELD_RESULT))?;
        let (status, msg) = (r as u8, (r >> 8) as u8);
        Ok(if status == 0xFF || msg == 0xFF {
            None
        } else {
            Some((status, msg))
        })
    }

    pub fn read_status<M: DmaMemory>(&self, mem: &M) -> MemoryResult<Option<u8>> {
        let status = mem.read_u8(self.field(FIELD_RESULT))?;
        Ok((status != 0xFF).then_some(status))
    }
}

/// Descriptors, recycled through a free list and grown from DMA memory up
/// to the configured cap
pub struct DsaPool {
    slots: Vec<Descriptor>,
    free: Vec<DsaId>,
    cap: usize,
    allocated: usize,
    budget: usize,
}

impl DsaPool {
    pub fn new(cap: usize, sg_tablesize: usize) -> Self {
        Self {
            slots: vec![],
            free: vec![],
            cap,
            allocated: 0,
            budget: stream_budget(sg_tablesize),
        }
    }

    pub fn descriptor_size(&self) -> usize {
        (DSA_FIELDS_START + FIELD_DATA_STREAMS) as usize + 2 * self.budget * 8
    }

    /// Largest scatter-gather list a descriptor can carry
    pub fn max_segments(&self) -> usize {
        (self.budget - 3) / 2
    }

    fn push(&mut self, base: BusAddr, bootstrap: bool) -> DsaId {
        let id = DsaId(self.slots.len());
        self.slots.push(Descriptor {
            base,
            state: DsaState::Free,
            cmd: None,
            target: 0,
            lun: 0,
            sensing: false,
            original_status: 0,
            pending: None,
            sdtr_sent: false,
            bootstrap,
            budget: self.budget,
        });
        id
    }

    /// The descriptor living in the image buffer, only used by self tests
    pub fn add_bootstrap(&mut self, base: BusAddr) -> DsaId {
        self.push(base, true)
    }

    /// Takes a descriptor from the free list, else from the backing
    /// allocator. None means the caller must retry later.
    pub fn alloc<M: DmaMemory>(&mut self, mem: &mut M) -> Option<DsaId> {
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                if self.allocated >= self.cap {
                    return None;
                }
                let base = mem.alloc(self.descriptor_size(), 8)?;
                self.allocated += 1;
                self.push(base, false)
            }
        };
        let d = &mut self.slots[id.0];
        d.cmd = None;
        d.sensing = false;
        d.original_status = 0;
        d.pending = None;
        d.sdtr_sent = false;
        Some(id)
    }

    pub fn release(&mut self, id: DsaId) {
        let d = &mut self.slots[id.0];
        d.state = DsaState::Free;
        d.cmd = None;
        if !d.bootstrap && !self.free.contains(&id) {
            self.free.push(id);
        }
    }

    pub fn get(&self, id: DsaId) -> &Descriptor {
        &self.slots[id.0]
    }

    pub fn get_mut(&mut self, id: DsaId) -> &mut Descriptor {
        &mut self.slots[id.0]
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Active descriptor whose fields live at `dsa`, as read from the DSA
    /// register
    pub fn find_by_dsa(&self, dsa: BusAddr) -> Option<DsaId> {
        self.slots
            .iter()
            .position(|d| d.is_active() && d.fields() == dsa)
            .map(DsaId)
    }

    pub fn find_serial(&self, serial: u64) -> Option<DsaId> {
        self.slots
            .iter()
            .position(|d| d.is_active() && d.cmd.as_ref().is_some_and(|c| c.serial == serial))
            .map(DsaId)
    }

    /// Active descriptors carrying a command, bootstrap excluded
    pub fn active(&self) -> Vec<DsaId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, d)| d.is_active() && !d.bootstrap)
            .map(|(i, _)| DsaId(i))
            .collect()
    }

    /// Returns all pool memory to the allocator
    pub fn release_memory<M: DmaMemory>(&mut self, mem: &mut M) {
        for d in self.slots.drain(..).filter(|d| !d.bootstrap) {
            mem.free(d.base);
        }
        self.free.clear();
        self.allocated = 0;
    }
}

/// Bounded writer for a generated instruction stream
struct StreamWriter {
    at: BusAddr,
    end: BusAddr,
}

impl StreamWriter {
    fn new(start: BusAddr, budget: usize) -> Self {
        Self {
            at: start,
            end: start + (budget * 8) as BusAddr,
        }
    }

    fn push<M: DmaMemory>(&mut self, mem: &mut M, w0: u32, w1: u32) -> Result<(), DriverError> {
        if self.at + 8 > self.end {
            return Err(DriverError::InvalidCommand(
                "data stream exceeds its reservation".to_string(),
            ));
        }
        mem.write_u32(self.at, w0)?;
        mem.write_u32(self.at + 4, w1)?;
        self.at += 8;
        Ok(())
    }
}

/// Writes one MOVE/CALL pair per segment and the closing JUMP
fn write_stream<M: DmaMemory>(
    mem: &mut M,
    d: &Descriptor,
    start: BusAddr,
    phase: Phase,
    sg: &[SgSegment],
    script: &FixedScript,
) -> Result<(), DriverError> {
    let mut w = StreamWriter::new(start, d.budget);
    for seg in sg {
        w.push(mem, insn::move_direct(phase, seg.len), seg.addr)?;
        w.push(
            mem,
            insn::transfer(TcOp::Call, Cond::when(Phase::MsgIn)),
            script.addr(Label::MsgIn),
        )?;
    }
    w.push(
        mem,
        insn::transfer(TcOp::Jump, Cond::ALWAYS),
        script.addr(Label::OtherTransfer),
    )
}

/// Checks a command fits a descriptor
pub fn validate(cmd: &ScsiCommand, max_segments: usize, host_id: u8) -> Result<(), DriverError> {
    if cmd.target > 7 || cmd.target == host_id {
        return Err(DriverError::InvalidCommand(format!(
            "target {} not addressable",
            cmd.target
        )));
    }
    if cmd.lun > 7 {
        return Err(DriverError::InvalidCommand(format!("lun {}", cmd.lun)));
    }
    if cmd.cdb.len() < 6 {
        return Err(DriverError::InvalidCommand(format!(
            "CDB of {} bytes",
            cmd.cdb.len()
        )));
    }
    if cmd.sg.len() > max_segments {
        return Err(DriverError::InvalidCommand(format!(
            "{} segments, limit {}",
            cmd.sg.len(),
            max_segments
        )));
    }
    if let Some(seg) = cmd.sg.iter().find(|s| s.len == 0 || s.len > MAX_MOVE_COUNT) {
        return Err(DriverError::InvalidCommand(format!(
            "segment of {} bytes at {:08X}",
            seg.len, seg.addr
        )));
    }
    Ok(())
}

pub struct BuildContext<'a> {
    pub script: &'a FixedScript,
    pub cells: &'a HostCells,
    pub select_word: u32,
    pub disconnect: bool,
    pub sdtr: Option<[u8; 5]>,
}

fn write_pair<M: DmaMemory>(mem: &mut M, at: BusAddr, len: u32, addr: BusAddr) -> MemoryResult<()> {
    mem.write_u32(at, len)?;
    mem.write_u32(at + 4, addr)
}

/// Writes the identify (and optionally SDTR) message out buffer and the
/// select word
pub fn write_selection<M: DmaMemory>(
    mem: &mut M,
    d: &Descriptor,
    select_word: u32,
    disconnect: bool,
    sdtr: Option<[u8; 5]>,
) -> MemoryResult<()> {
    use super::regs::{MSG_IDENTIFY, MSG_IDENTIFY_DISCONNECT};

    let mut msg = [0u8; 8];
    msg[0] = MSG_IDENTIFY | (d.lun & 7);
    if disconnect {
        msg[0] |= MSG_IDENTIFY_DISCONNECT;
    }
    let len = match sdtr {
        Some(m) => {
            msg[1..6].copy_from_slice(&m);
            6
        }
        None => 1,
    };
    mem.write_bytes(d.field(FIELD_MSGOUT_BUF), &msg)?;
    write_pair(mem, d.field(FIELD_MSGOUT), len, d.field(FIELD_MSGOUT_BUF))?;
    mem.write_u32(d.field(FIELD_SELECT), select_word)
}

/// Copies the code fragment into the descriptor and resolves its
/// per-descriptor sites
fn instantiate<M: DmaMemory>(mem: &mut M, d: &Descriptor, script: &FixedScript) -> MemoryResult<()> {
    let len = script.dsa_template_len() as usize;
    let mut code = vec![0; len];
    mem.read_bytes(script.addr(Label::DsaCodeTemplate), &mut code)?;
    for p in &script.dsa_patches {
        let at = p.word * 4;
        let word = u32::from_le_bytes([code[at], code[at + 1], code[at + 2], code[at + 3]]);
        let patched = match p.kind {
            PatchKind::DsaRelative => word + d.base,
            PatchKind::TargetImmediate => {
                let mut i = Insn(word);
                i.set_tc_data(0x80 | (d.target & 7));
                i.0
            }
            PatchKind::LunImmediate => {
                let mut i = Insn(word);
                i.set_tc_data(d.lun & 7);
                i.0
            }
            _ => word,
        };
        code[at..at + 4].copy_from_slice(&patched.to_le_bytes());
    }
    mem.write_bytes(d.base, &code)
}

/// Fills a descriptor for `cmd`. The descriptor's target and LUN must
/// already be set.
pub fn build<M: DmaMemory>(
    mem: &mut M,
    d: &Descriptor,
    cmd: &ScsiCommand,
    ctx: &BuildContext,
) -> Result<(), DriverError> {
    instantiate(mem, d, ctx.script)?;

    mem.write_u32(d.field(FIELD_NEXT), 0)?;
    mem.write_u32(d.field(FIELD_SELF), d.fields())?;
    write_selection(mem, d, ctx.select_word, ctx.disconnect, ctx.sdtr)?;

    let mut cdb = [0u8; MAX_CDB_LEN];
    cdb[..cmd.cdb.len()].copy_from_slice(&cmd.cdb);
    mem.write_bytes(d.field(FIELD_CDB), &cdb)?;
    write_pair(mem, d.field(FIELD_CMDOUT), cmd.cdb.len() as u32, d.field(FIELD_CDB))?;
    write_pair(mem, d.field(FIELD_STATUS), 1, d.field(FIELD_RESULT))?;
    write_pair(mem, d.field(FIELD_MSGIN), 1, d.field(FIELD_RESULT) + 1)?;
    write_pair(
        mem,
        d.field(FIELD_MSGOUT_OTHER),
        1,
        ctx.cells.extern_addr(Extern::NopMsg),
    )?;
    mem.write_u32(d.field(FIELD_RESULT), RESULT_INCOMPLETE)?;

    let dir = DataDirection::classify(cmd);
    let other = ctx.script.addr(Label::OtherTransfer);
    let data_in = if dir.data_in() {
        write_stream(mem, d, d.data_in_stream(), Phase::DataIn, &cmd.sg, ctx.script)?;
        d.data_in_stream()
    } else {
        other
    };
    let data_out = if dir.data_out() {
        write_stream(mem, d, d.data_out_stream(), Phase::DataOut, &cmd.sg, ctx.script)?;
        d.data_out_stream()
    } else {
        other
    };
    mem.write_u32(d.base + DSA_DATA_IN_JUMP + 4, data_in)?;
    mem.write_u32(d.base + DSA_DATA_OUT_JUMP + 4, data_out)?;

    trace!(
        "descriptor {:08X} built for {}:{} opcode {:02X} {:?}, {} segments",
        d.base,
        d.target,
        d.lun,
        cmd.opcode(),
        dir,
        cmd.sg.len()
    );
    Ok(())
}

/// Rewrites a descriptor that got CHECK CONDITION into a REQUEST SENSE
/// into its own sense buffer
pub fn rewrite_for_sense<M: DmaMemory>(
    mem: &mut M,
    d: &Descriptor,
    orig_cdb1: u8,
    select_word: u32,
    disconnect: bool,
    script: &FixedScript,
) -> Result<(), DriverError> {
    let sense_cdb = [0x03, orig_cdb1 & 0xE0, 0, 0, SENSE_BUFFER_SIZE as u8, 0, 0, 0];
    mem.write_bytes(d.field(FIELD_SENSE_CDB), &sense_cdb)?;
    write_pair(mem, d.field(FIELD_CMDOUT), 6, d.field(FIELD_SENSE_CDB))?;
    mem.fill(d.field(FIELD_SENSE), SENSE_BUFFER_SIZE, 0)?;

    let other = script.addr(Label::OtherTransfer);
    let mut w = StreamWriter::new(d.data_in_stream(), d.budget);
    w.push(
        mem,
        insn::move_direct(Phase::DataIn, SENSE_BUFFER_SIZE as u32),
        d.field(FIELD_SENSE),
    )?;
    w.push(mem, insn::transfer(TcOp::Jump, Cond::ALWAYS), other)?;
    mem.write_u32(d.base + DSA_DATA_IN_JUMP + 4, d.data_in_stream())?;
    mem.write_u32(d.base + DSA_DATA_OUT_JUMP + 4, other)?;

    write_selection(mem, d, select_word, disconnect, None)?;
    mem.write_u32(d.field(FIELD_RESULT), RESULT_INCOMPLETE)?;
    mem.write_u32(d.resume_slot() + 4, d.dispatch())?;
    mem.write_u32(d.field(FIELD_NEXT), 0)?;
    Ok(())
}

pub fn read_sense<M: DmaMemory>(mem: &M, d: &Descriptor) -> MemoryResult<[u8; SENSE_BUFFER_SIZE]> {
    let mut s = [0; SENSE_BUFFER_SIZE];
    mem.read_bytes(d.field(FIELD_SENSE), &mut s)?;
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::arena::DmaArena;
    use crate::bus::{MappingMode, RegisterWindow};
    use crate::ncr::fixup::{FixupContext, load_and_fixup};
    use crate::ncr::regs::Dmode;
    use crate::ncr::scripts::insn::InsnType;

    struct Fixture {
        mem: DmaArena,
        script: FixedScript,
        cells: HostCells,
        pool: DsaPool,
    }

    fn fixture(cap: usize, sg: usize) -> Fixture {
        let mut mem = DmaArena::new(0x10_0000, 0x2_0000);
        let cells = HostCells {
            base: mem.alloc(HostCells::SIZE, 8).unwrap(),
        };
        cells.init(&mut mem).unwrap();
        let base = mem.alloc(0x1000, 8).unwrap();
        let regs = RegisterWindow {
            mode: MappingMode::Memory,
            mmio_base: 0xF000_0000,
            io_base: 0,
        };
        let script = load_and_fixup(
            &mut mem,
            &FixupContext {
                base,
                cells: &cells,
                regs: &regs,
                saved_dmode: Dmode(0x80),
                intfly: false,
            },
        )
        .unwrap();
        Fixture {
            mem,
            script,
            cells,
            pool: DsaPool::new(cap, sg),
        }
    }

    fn read_cmd(lun: u8, segs: usize) -> ScsiCommand {
        ScsiCommand::new(
            9,
            2,
            lun,
            &[0x28, lun << 5, 0, 0, 0, 0, 0, 0, 1, 0],
            (0..segs)
                .map(|i| SgSegment {
                    addr: 0x4000 + 0x200 * i as u32,
                    len: 0x200,
                })
                .collect(),
        )
        .unwrap()
    }

    fn build_one(f: &mut Fixture, cmd: &ScsiCommand) -> DsaId {
        let id = f.pool.alloc(&mut f.mem).unwrap();
        {
            let d = f.pool.get_mut(id);
            d.target = cmd.target;
            d.lun = cmd.lun;
        }
        let ctx = BuildContext {
            script: &f.script,
            cells: &f.cells,
            select_word: 0x0302_0000,
            disconnect: true,
            sdtr: None,
        };
        build(&mut f.mem, f.pool.get(id), cmd, &ctx).unwrap();
        id
    }

    #[test]
    fn pool_exhaustion_and_reuse() {
        let mut f = fixture(2, 4);
        let a = f.pool.alloc(&mut f.mem).unwrap();
        let b = f.pool.alloc(&mut f.mem).unwrap();
        assert_ne!(a, b);
        assert!(f.pool.alloc(&mut f.mem).is_none());
        f.pool.release(a);
        assert_eq!(f.pool.alloc(&mut f.mem), Some(a));
        assert_eq!(f.pool.allocated(), 2);
    }

    #[test]
    fn fields_and_patches() {
        let mut f = fixture(4, 4);
        let cmd = read_cmd(3, 2);
        let id = build_one(&mut f, &cmd);
        f.pool.get_mut(id).state = DsaState::Issued;
        let d = f.pool.get(id);
        let d_base = d.base;
        let m = &f.mem;

        assert_eq!(m.read_u32(d.field(FIELD_SELF)).unwrap(), d.fields());
        assert_eq!(m.read_u32(d.field(FIELD_NEXT)).unwrap(), 0);
        assert_eq!(m.read_u32(d.field(FIELD_SELECT)).unwrap(), 0x0302_0000);
        assert_eq!(m.read_u32(d.field(FIELD_MSGOUT)).unwrap(), 1);
        assert_eq!(m.read_u8(d.field(FIELD_MSGOUT_BUF)).unwrap(), 0xC3);
        assert_eq!(m.read_u32(d.field(FIELD_CMDOUT)).unwrap(), 10);
        assert_eq!(m.read_u32(d.field(FIELD_STATUS) + 4).unwrap(), d.field(FIELD_RESULT));
        assert_eq!(m.read_u32(d.field(FIELD_MSGIN) + 4).unwrap(), d.field(FIELD_RESULT) + 1);
        assert_eq!(
            m.read_u32(d.field(FIELD_MSGOUT_OTHER) + 4).unwrap(),
            f.cells.extern_addr(Extern::NopMsg)
        );
        assert_eq!(d.read_result(m).unwrap(), None);

        // Resume slot points at our own dispatch
        assert_eq!(m.read_u32(d.resume_slot() + 4).unwrap(), d_base + DSA_DISPATCH);
        // Data in goes to the stream, data out to other_transfer
        assert_eq!(m.read_u32(d_base + DSA_DATA_IN_JUMP + 4).unwrap(), d.data_in_stream());
        assert_eq!(
            m.read_u32(d_base + DSA_DATA_OUT_JUMP + 4).unwrap(),
            f.script.addr(Label::OtherTransfer)
        );

        // Target and LUN immediates
        let mut target_imm = None;
        let mut lun_imm = None;
        for p in &f.script.dsa_patches {
            let w = Insn(m.read_u32(d_base + p.word as u32 * 4).unwrap());
            match p.kind {
                PatchKind::TargetImmediate => target_imm = Some(w.tc_data()),
                PatchKind::LunImmediate => lun_imm = Some(w.tc_data()),
                _ => (),
            }
        }
        assert_eq!(target_imm, Some(0x82));
        assert_eq!(lun_imm, Some(3));
        assert_eq!(f.pool.find_by_dsa(d.fields()), Some(id));
    }

    #[test]
    fn stream_per_segment() {
        let mut f = fixture(4, 4);
        let cmd = read_cmd(0, 3);
        let id = build_one(&mut f, &cmd);
        let d = f.pool.get(id);
        let s = d.data_in_stream();
        for i in 0..3u32 {
            let mv = Insn(f.mem.read_u32(s + i * 16).unwrap());
            assert_eq!(mv.kind(), InsnType::BlockMove);
            assert_eq!(mv.count(), 0x200);
            assert_eq!(Phase::from_code(mv.phase()), Phase::DataIn);
            assert_eq!(f.mem.read_u32(s + i * 16 + 4).unwrap(), 0x4000 + 0x200 * i);
            let call = Insn(f.mem.read_u32(s + i * 16 + 8).unwrap());
            assert_eq!(call.tc_op(), Some(TcOp::Call));
            assert!(call.tc_wait());
            assert_eq!(
                f.mem.read_u32(s + i * 16 + 12).unwrap(),
                f.script.addr(Label::MsgIn)
            );
        }
        let jump = Insn(f.mem.read_u32(s + 48).unwrap());
        assert_eq!(jump.tc_op(), Some(TcOp::Jump));
        assert_eq!(
            f.mem.read_u32(s + 52).unwrap(),
            f.script.addr(Label::OtherTransfer)
        );
    }

    #[test]
    fn unknown_opcode_gets_both_streams() {
        let mut f = fixture(4, 4);
        let cmd = ScsiCommand::new(
            1,
            1,
            0,
            &[0xC1, 0, 0, 0, 0, 0],
            vec![SgSegment {
                addr: 0x4000,
                len: 64,
            }],
        )
        .unwrap();
        let id = build_one(&mut f, &cmd);
        let d = f.pool.get(id);
        assert_eq!(
            f.mem.read_u32(d.base + DSA_DATA_OUT_JUMP + 4).unwrap(),
            d.data_out_stream()
        );
        let mv = Insn(f.mem.read_u32(d.data_out_stream()).unwrap());
        assert_eq!(Phase::from_code(mv.phase()), Phase::DataOut);
    }

    #[test]
    fn sense_rewrite() {
        let mut f = fixture(4, 4);
        let cmd = read_cmd(5, 4);
        let id = build_one(&mut f, &cmd);
        let d = f.pool.get(id);
        f.mem.write_u32(d.field(FIELD_RESULT), 0x0000_0002).unwrap();
        f.mem.write_u32(d.resume_slot() + 4, 0xDEAD_0000).unwrap();
        rewrite_for_sense(&mut f.mem, d, cmd.cdb[1], 0x0302_0000, true, &f.script).unwrap();

        let mut cdb = [0; 6];
        f.mem.read_bytes(d.field(FIELD_SENSE_CDB), &mut cdb).unwrap();
        assert_eq!(cdb, [0x03, 5 << 5, 0, 0, SENSE_BUFFER_SIZE as u8, 0]);
        assert_eq!(f.mem.read_u32(d.field(FIELD_CMDOUT)).unwrap(), 6);
        assert_eq!(
            f.mem.read_u32(d.field(FIELD_CMDOUT) + 4).unwrap(),
            d.field(FIELD_SENSE_CDB)
        );
        // Data out disabled, data in into the sense buffer then other_transfer
        let other = f.script.addr(Label::OtherTransfer);
        assert_eq!(f.mem.read_u32(d.base + DSA_DATA_OUT_JUMP + 4).unwrap(), other);
        let s = d.data_in_stream();
        let mv = Insn(f.mem.read_u32(s).unwrap());
        assert_eq!(mv.count(), SENSE_BUFFER_SIZE as u32);
        assert_eq!(f.mem.read_u32(s + 4).unwrap(), d.field(FIELD_SENSE));
        assert_eq!(f.mem.read_u32(s + 12).unwrap(), other);
        // Not complete, resume slot back at dispatch, identify only
        assert_eq!(d.read_result(&f.mem).unwrap(), None);
        assert_eq!(f.mem.read_u32(d.resume_slot() + 4).unwrap(), d.dispatch());
        assert_eq!(f.mem.read_u32(d.field(FIELD_MSGOUT)).unwrap(), 1);
    }

    #[test]
    fn validation() {
        let mut cmd = read_cmd(0, 2);
        assert!(validate(&cmd, 4, 7).is_ok());
        assert!(validate(&cmd, 1, 7).is_err());
        cmd.sg[0].len = MAX_MOVE_COUNT + 1;
        assert!(validate(&cmd, 4, 7).is_err());
        let mut cmd = read_cmd(0, 1);
        cmd.target = 7;
        assert!(validate(&cmd, 4, 7).is_err());
    }

    #[test]
    fn sdtr_in_message_out() {
        let mut f = fixture(4, 4);
        let cmd = read_cmd(0, 1);
        let id = build_one(&mut f, &cmd);
        let d = f.pool.get(id);
        write_selection(&mut f.mem, d, 0, false, Some([1, 3, 1, 25, 8])).unwrap();
        let mut msg = [0; 6];
        f.mem.read_bytes(d.field(FIELD_MSGOUT_BUF), &mut msg).unwrap();
        assert_eq!(msg, [0x80, 1, 3, 1, 25, 8]);
        assert_eq!(f.mem.read_u32(d.field(FIELD_MSGOUT)).unwrap(), 6);
    }
}
