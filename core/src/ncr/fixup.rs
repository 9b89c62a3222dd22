//! SCRIPTS image loading and relocation

use log::*;
use strum::{EnumCount, IntoEnumIterator};

use super::error::DriverError;
use super::regs::{Dmode, MSG_ABORT, MSG_NOP, MSG_REJECT};
use super::scripts::insn::Insn;
use super::scripts::program::{self, ScriptTemplate};
use super::scripts::{AbsSymbol, DmodeKind, Extern, Label, PatchKind, PatchSite};
use super::sync::SYNC_FRAGMENT_SIZE;
use crate::bus::{DmaMemory, MappingMode, MemoryResult, RegisterWindow};
use crate::types::BusAddr;

/// Driver-owned scalars and cells the program refers to, laid out in a
/// single DMA block
#[derive(Debug, Clone, Copy)]
pub struct HostCells {
    pub base: BusAddr,
}

impl HostCells {
    const ZERO: u32 = 0;
    const ABORT_MSG: u32 = 4;
    const REJECT_MSG: u32 = 5;
    const NOP_MSG: u32 = 6;
    const SINK: u32 = 8;
    const ISSUE_HEAD: u32 = 12;
    const RECONNECT_HEAD: u32 = 16;
    const RECONNECT_CURSOR: u32 = 20;
    const MSG_BUF: u32 = 24;
    const RESELECTED_IDENTIFY: u32 = 32;
    const RESELECTED_TAG: u32 = 36;
    const TEST_SRC: u32 = 40;
    const TEST_DST: u32 = 44;
    const SYNC_FRAGMENTS: u32 = 48;

    pub const SIZE: usize = Self::SYNC_FRAGMENTS as usize + 8 * SYNC_FRAGMENT_SIZE as usize;

    pub fn extern_addr(&self, e: Extern) -> BusAddr {
        self.base
            + match e {
                Extern::Zero => Self::ZERO,
                Extern::AbortMsg => Self::ABORT_MSG,
                Extern::RejectMsg => Self::REJECT_MSG,
                Extern::NopMsg => Self::NOP_MSG,
                Extern::Sink => Self::SINK,
            }
    }

    pub fn abs_addr(&self, s: AbsSymbol) -> BusAddr {
        self.base
            + match s {
                AbsSymbol::IssueDsaHead => Self::ISSUE_HEAD,
                AbsSymbol::ReconnectDsaHead => Self::RECONNECT_HEAD,
                AbsSymbol::ReconnectCursor => Self::RECONNECT_CURSOR,
                AbsSymbol::MsgBuf => Self::MSG_BUF,
                AbsSymbol::ReselectedIdentify => Self::RESELECTED_IDENTIFY,
                AbsSymbol::ReselectedTag => Self::RESELECTED_TAG,
                AbsSymbol::TestSrc => Self::TEST_SRC,
                AbsSymbol::TestDst => Self::TEST_DST,
            }
    }

    pub fn sync_fragment(&self, target: u8) -> BusAddr {
        self.base + Self::SYNC_FRAGMENTS + u32::from(target) * SYNC_FRAGMENT_SIZE
    }

    /// Writes the constant bytes, clears everything else
    pub fn init<M: DmaMemory>(&self, mem: &mut M) -> MemoryResult<()> {
        mem.fill(self.base, Self::SIZE, 0)?;
        mem.write_u8(self.extern_addr(Extern::AbortMsg), MSG_ABORT)?;
        mem.write_u8(self.extern_addr(Extern::RejectMsg), MSG_REJECT)?;
        mem.write_u8(self.extern_addr(Extern::NopMsg), MSG_NOP)
    }
}

/// DMODE value for a memory move direction. SIOM/DIOM only matter when
/// the registers live in I/O space.
pub fn dmode_value(kind: DmodeKind, saved: Dmode, mode: MappingMode) -> u8 {
    let mut d = saved;
    d.set_siom(false);
    d.set_diom(false);
    if mode == MappingMode::Port {
        match kind {
            DmodeKind::MemoryToMemory => (),
            DmodeKind::MemoryToNcr => d.set_diom(true),
            DmodeKind::NcrToMemory => d.set_siom(true),
            DmodeKind::NcrToNcr => {
                d.set_siom(true);
                d.set_diom(true);
            }
        }
    }
    d.0
}

pub struct FixupContext<'a> {
    pub base: BusAddr,
    pub cells: &'a HostCells,
    pub regs: &'a RegisterWindow,
    pub saved_dmode: Dmode,
    pub intfly: bool,
}

/// The program as loaded at its final address
#[derive(Debug, Clone)]
pub struct FixedScript {
    pub base: BusAddr,
    pub size: u32,
    entries: [BusAddr; Label::COUNT],
    /// Per-descriptor sites of the command fragment, word offsets from its
    /// start
    pub dsa_patches: Vec<PatchSite>,
}

impl FixedScript {
    pub fn addr(&self, label: Label) -> BusAddr {
        self.entries[label as usize]
    }

    /// Whether `addr` lies in [from, to)
    pub fn within(&self, from: Label, to: Label, addr: BusAddr) -> bool {
        addr >= self.addr(from) && addr < self.addr(to)
    }

    pub fn dsa_template_len(&self) -> u32 {
        self.addr(Label::DsaCodeTemplateEnd) - self.addr(Label::DsaCodeTemplate)
    }
}

fn apply(word: u32, kind: PatchKind, ctx: &FixupContext) -> u32 {
    match kind {
        PatchKind::Label => word + ctx.base,
        PatchKind::Extern(e) => ctx.cells.extern_addr(e),
        PatchKind::Abs(s) => word + ctx.cells.abs_addr(s),
        PatchKind::Register => ctx.regs.chip_visible(word as u8),
        PatchKind::Dmode(kind) => {
            let v = dmode_value(kind, ctx.saved_dmode, ctx.regs.mode);
            (word & !0xFF00) | u32::from(v) << 8
        }
        PatchKind::IntflyCompletion => {
            let mut insn = Insn(word);
            if ctx.intfly {
                insn.set_tc_intfly(true);
            }
            insn.0
        }
        PatchKind::DsaRelative | PatchKind::TargetImmediate | PatchKind::LunImmediate => word,
    }
}

/// Relocates a template without touching memory
pub fn relocate(template: &ScriptTemplate, ctx: &FixupContext) -> Vec<u32> {
    let mut words = template.words.clone();
    for p in &template.patches {
        words[p.word] = apply(words[p.word], p.kind, ctx);
    }
    words
}

/// Assembles the program, relocates it to `ctx.base` and writes it into the
/// image buffer. Never touches the chip.
pub fn load_and_fixup<M: DmaMemory>(
    mem: &mut M,
    ctx: &FixupContext,
) -> Result<FixedScript, DriverError> {
    let template = program::assemble()?;
    let words = relocate(&template, ctx);

    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    mem.write_bytes(ctx.base, &bytes)?;

    let mut entries = [0; Label::COUNT];
    for l in Label::iter() {
        entries[l as usize] = ctx.base + template.offset(l);
    }
    debug!(
        "SCRIPTS loaded at {:08X}, {} bytes, {} patch sites",
        ctx.base,
        template.size(),
        template.patches.len()
    );

    Ok(FixedScript {
        base: ctx.base,
        size: template.size(),
        entries,
        dsa_patches: template.dsa_patches().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::arena::DmaArena;
    use crate::ncr::scripts::insn::{Insn, InsnType};

    fn window(mode: MappingMode) -> RegisterWindow {
        RegisterWindow {
            mode,
            mmio_base: 0xF000_0000,
            io_base: 0xC000,
        }
    }

    #[test]
    fn dmode_values() {
        let saved = Dmode(0x80 | 0x30);
        assert_eq!(
            dmode_value(DmodeKind::MemoryToNcr, saved, MappingMode::Memory),
            0x80
        );
        assert_eq!(
            dmode_value(DmodeKind::MemoryToNcr, saved, MappingMode::Port),
            0x90
        );
        assert_eq!(
            dmode_value(DmodeKind::NcrToMemory, saved, MappingMode::Port),
            0xA0
        );
        assert_eq!(
            dmode_value(DmodeKind::NcrToNcr, saved, MappingMode::Port),
            0xB0
        );
    }

    #[test]
    fn relocation() {
        let mut mem = DmaArena::new(0x10_0000, 0x10000);
        let cells = HostCells { base: 0x10_8000 };
        let regs = window(MappingMode::Port);
        let ctx = FixupContext {
            base: 0x10_0000,
            cells: &cells,
            regs: &regs,
            saved_dmode: Dmode(0x80),
            intfly: true,
        };
        let script = load_and_fixup(&mut mem, &ctx).unwrap();
        assert_eq!(script.addr(Label::Schedule), 0x10_0000);

        // The issue jump-through-memory slot is rewritten by the program
        // itself, the memory move feeding it must point at its operand
        let issue = script.addr(Label::Issue);
        let w0 = Insn(mem.read_u32(issue).unwrap());
        assert_eq!(w0.kind(), InsnType::MemoryMove);
        assert_eq!(
            mem.read_u32(issue + 4).unwrap(),
            cells.abs_addr(AbsSymbol::IssueDsaHead)
        );
        assert_eq!(
            mem.read_u32(issue + 8).unwrap(),
            script.addr(Label::JumpDsa) + 4
        );

        // Completion INT became INTFLY
        let cc = Insn(mem.read_u32(script.addr(Label::CommandCompleteInt)).unwrap());
        assert!(cc.tc_intfly());

        // First instruction of the scheduler's queue check loads DMODE for
        // a move into chip registers (second instruction)
        let dm = Insn(mem.read_u32(script.addr(Label::Schedule) + 8).unwrap());
        assert_eq!(dm.rw_data(), 0x90);
        let mm = script.addr(Label::Schedule) + 16;
        assert_eq!(mem.read_u32(mm + 8).unwrap(), 0xC000 + 0x34);
    }

    #[test]
    fn per_descriptor_sites_untouched() {
        let mut mem = DmaArena::new(0, 0x10000);
        let cells = HostCells { base: 0x8000 };
        let regs = window(MappingMode::Memory);
        let ctx = FixupContext {
            base: 0x1000,
            cells: &cells,
            regs: &regs,
            saved_dmode: Dmode(0),
            intfly: false,
        };
        let script = load_and_fixup(&mut mem, &ctx).unwrap();
        let start = script.addr(Label::DsaCodeTemplate);
        for p in &script.dsa_patches {
            if p.kind == PatchKind::DsaRelative {
                let v = mem.read_u32(start + p.word as u32 * 4).unwrap();
                assert!(v < 0x1000, "site {} holds {:08X}", p.word, v);
            }
        }
        let cc = Insn(mem.read_u32(script.addr(Label::CommandCompleteInt)).unwrap());
        assert!(!cc.tc_intfly());
    }

    #[test]
    fn cells_layout() {
        let mut mem = DmaArena::new(0, 0x1000);
        let cells = HostCells { base: 0x100 };
        cells.init(&mut mem).unwrap();
        assert_eq!(mem.read_u8(cells.extern_addr(Extern::AbortMsg)).unwrap(), MSG_ABORT);
        assert_eq!(mem.read_u8(cells.extern_addr(Extern::RejectMsg)).unwrap(), MSG_REJECT);
        assert_eq!(mem.read_u32(cells.abs_addr(AbsSymbol::IssueDsaHead)).unwrap(), 0);
        assert!(cells.sync_fragment(7) + SYNC_FRAGMENT_SIZE <= 0x100 + HostCells::SIZE as u32);
    }
}
