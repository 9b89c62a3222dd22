//! Program builder and the canonical SCRIPTS program
//!
//! The program is assembled once per adapter into an unresolved template:
//! operand words hold offsets and every site needing a load-time value is
//! listed in the patch table. The per-command code fragment lives between
//! `DsaCodeTemplate` and `DsaCodeTemplateEnd` and is never executed in
//! place; the descriptor builder copies it into each command descriptor.

use strum::{EnumCount, IntoEnumIterator};
use thiserror::Error;

use super::insn::{self, AluOp, Cond, IoOp, TcOp};
use super::{AbsSymbol, DmodeKind, Extern, IntCode, Label, PatchKind, PatchSite};
use crate::ncr::dsa::{
    DSA_FIELDS_START, FIELD_CMDOUT, FIELD_MSGIN, FIELD_MSGOUT, FIELD_MSGOUT_OTHER, FIELD_NEXT,
    FIELD_SELECT, FIELD_SELF, FIELD_STATUS,
};
use crate::ncr::regs::{
    CTEST2_SIGP, MSG_DISCONNECT, MSG_EXTENDED, EXTENDED_SDTR, EXTENDED_WDTR, Phase, Reg,
    SCNTL2_SDU, STATUS_CHECK_CONDITION,
};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptError {
    #[error("label {0:?} referenced but never placed")]
    UndefinedLabel(Label),
    #[error("label {0:?} placed twice")]
    DuplicateLabel(Label),
    #[error("descriptor fields start at {actual}, expected {expected}")]
    FieldsMisaligned { expected: u32, actual: u32 },
}

/// Instruction operand before fixup
#[derive(Debug, Clone, Copy)]
pub enum Operand {
    Imm(u32),
    Label(Label),
    LabelPlus(Label, u32),
    /// Relative to the end of the referencing instruction
    Rel(Label),
    Extern(Extern),
    Abs(AbsSymbol, u32),
    /// Chip register, by offset
    Reg(u8),
    /// Offset from the start of a command descriptor
    Dsa(u32),
}

/// Assembled, unresolved program
#[derive(Debug, Clone)]
pub struct ScriptTemplate {
    pub words: Vec<u32>,
    labels: [u32; Label::COUNT],
    pub patches: Vec<PatchSite>,
}

impl ScriptTemplate {
    /// Byte offset of a label from the start of the program
    pub fn offset(&self, label: Label) -> u32 {
        self.labels[label as usize]
    }

    pub fn size(&self) -> u32 {
        (self.words.len() * 4) as u32
    }

    /// Byte range of the per-command code fragment
    pub fn dsa_template(&self) -> std::ops::Range<u32> {
        self.offset(Label::DsaCodeTemplate)..self.offset(Label::DsaCodeTemplateEnd)
    }

    /// Patch sites inside the per-command fragment, as word offsets
    /// relative to the fragment start
    pub fn dsa_patches(&self) -> impl Iterator<Item = PatchSite> + '_ {
        let range = self.dsa_template();
        let (start, end) = ((range.start / 4) as usize, (range.end / 4) as usize);
        self.patches
            .iter()
            .filter(move |p| p.word >= start && p.word < end)
            .map(move |p| PatchSite {
                word: p.word - start,
                kind: p.kind,
            })
    }
}

struct Reference {
    word: usize,
    insn_start: u32,
    operand: Operand,
}

pub struct ScriptBuilder {
    words: Vec<u32>,
    labels: [Option<u32>; Label::COUNT],
    refs: Vec<Reference>,
    patches: Vec<PatchSite>,
    duplicate: Option<Label>,
}

impl Default for ScriptBuilder {
    fn default() -> Self {
        Self {
            words: Vec::new(),
            labels: [None; Label::COUNT],
            refs: Vec::new(),
            patches: Vec::new(),
            duplicate: None,
        }
    }
}

impl ScriptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn here(&self) -> u32 {
        (self.words.len() * 4) as u32
    }

    pub fn label(&mut self, label: Label) -> &mut Self {
        if self.labels[label as usize].is_some() {
            self.duplicate.get_or_insert(label);
        }
        self.labels[label as usize] = Some(self.here());
        self
    }

    fn emit(&mut self, word0: u32, operands: &[Operand]) -> &mut Self {
        let insn_start = self.here();
        self.words.push(word0);
        for &operand in operands {
            self.refs.push(Reference {
                word: self.words.len(),
                insn_start,
                operand,
            });
            self.words.push(0);
        }
        self
    }

    fn patch_last(&mut self, kind: PatchKind) -> &mut Self {
        let word = self.words.len() - 2;
        self.patches.push(PatchSite { word, kind });
        self
    }

    pub fn block_move(&mut self, phase: Phase, count: u32, addr: Operand) -> &mut Self {
        self.emit(insn::move_direct(phase, count), &[addr])
    }

    /// Table indirect move, `offset` relative to DSA
    pub fn move_table(&mut self, phase: Phase, offset: u32) -> &mut Self {
        self.emit(insn::move_table(phase), &[Operand::Imm(offset)])
    }

    pub fn select_table(&mut self, atn: bool, offset: u32, alt: Operand) -> &mut Self {
        self.emit(insn::select_table(atn, offset), &[alt])
    }

    pub fn wait_disconnect(&mut self) -> &mut Self {
        self.emit(insn::wait_disconnect(), &[Operand::Imm(0)])
    }

    pub fn wait_reselect(&mut self, alt: Operand) -> &mut Self {
        self.emit(insn::wait_reselect(), &[alt])
    }

    pub fn set(&mut self, bits: u32) -> &mut Self {
        self.emit(insn::set(bits), &[Operand::Imm(0)])
    }

    pub fn clear(&mut self, bits: u32) -> &mut Self {
        self.emit(insn::clear(bits), &[Operand::Imm(0)])
    }

    /// MOVE data TO reg
    pub fn load_reg(&mut self, reg: u8, data: u8) -> &mut Self {
        self.emit(
            insn::reg_op(IoOp::ReadModifyWrite, AluOp::Move, reg, data),
            &[Operand::Imm(0)],
        )
    }

    /// MOVE reg & data TO reg
    pub fn and_reg(&mut self, reg: u8, data: u8) -> &mut Self {
        self.emit(
            insn::reg_op(IoOp::ReadModifyWrite, AluOp::And, reg, data),
            &[Operand::Imm(0)],
        )
    }

    /// MOVE reg TO SFBR
    pub fn reg_to_sfbr(&mut self, reg: u8) -> &mut Self {
        self.emit(
            insn::reg_op(IoOp::ToSfbr, AluOp::Move, reg, 0),
            &[Operand::Imm(0)],
        )
    }

    /// MOVE SFBR TO reg
    pub fn sfbr_to_reg(&mut self, reg: u8) -> &mut Self {
        self.emit(
            insn::reg_op(IoOp::FromSfbr, AluOp::Move, reg, 0),
            &[Operand::Imm(0)],
        )
    }

    /// Loads DMODE with the value for the given move direction
    pub fn dmode(&mut self, kind: DmodeKind) -> &mut Self {
        self.load_reg(Reg::Dmode.offset(), 0)
            .patch_last(PatchKind::Dmode(kind))
    }

    pub fn memory_move(&mut self, count: u32, src: Operand, dst: Operand) -> &mut Self {
        self.emit(insn::memory_move(count), &[src, dst])
    }

    pub fn jump(&mut self, target: Operand, cond: Cond) -> &mut Self {
        let mut w0 = insn::transfer(TcOp::Jump, cond);
        if matches!(target, Operand::Rel(_)) {
            w0 = insn::relative(w0);
        }
        self.emit(w0, &[target])
    }

    pub fn call(&mut self, target: Operand, cond: Cond) -> &mut Self {
        self.emit(insn::transfer(TcOp::Call, cond), &[target])
    }

    pub fn ret(&mut self, cond: Cond) -> &mut Self {
        self.emit(insn::transfer(TcOp::Return, cond), &[Operand::Imm(0)])
    }

    pub fn int(&mut self, code: IntCode, cond: Cond) -> &mut Self {
        self.emit(insn::transfer(TcOp::Int, cond), &[Operand::Imm(code as u32)])
    }

    fn resolve(&self, label: Label) -> Result<u32, ScriptError> {
        self.labels[label as usize].ok_or(ScriptError::UndefinedLabel(label))
    }

    pub fn finish(mut self) -> Result<ScriptTemplate, ScriptError> {
        if let Some(l) = self.duplicate {
            return Err(ScriptError::DuplicateLabel(l));
        }
        let refs = std::mem::take(&mut self.refs);
        for r in refs {
            let (value, kind) = match r.operand {
                Operand::Imm(v) => (v, None),
                Operand::Label(l) => (self.resolve(l)?, Some(PatchKind::Label)),
                Operand::LabelPlus(l, add) => (self.resolve(l)? + add, Some(PatchKind::Label)),
                Operand::Rel(l) => {
                    let target = self.resolve(l)? as i64;
                    let next = i64::from(r.insn_start) + 8;
                    (((target - next) as u32) & insn::MAX_MOVE_COUNT, None)
                }
                Operand::Extern(e) => (0, Some(PatchKind::Extern(e))),
                Operand::Abs(s, add) => (add, Some(PatchKind::Abs(s))),
                Operand::Reg(off) => (off.into(), Some(PatchKind::Register)),
                Operand::Dsa(off) => (off, Some(PatchKind::DsaRelative)),
            };
            self.words[r.word] = value;
            if let Some(kind) = kind {
                self.patches.push(PatchSite { word: r.word, kind });
            }
        }
        self.patches.sort_by_key(|p| p.word);

        let mut labels = [0; Label::COUNT];
        for l in Label::iter() {
            labels[l as usize] = self.resolve(l)?;
        }
        Ok(ScriptTemplate {
            words: self.words,
            labels,
            patches: self.patches,
        })
    }
}

/// Loads a 32-bit cell into SCRATCHA and jumps if any byte is non-zero
fn branch_if_nonzero(b: &mut ScriptBuilder, cell: Operand, target: Label) {
    let scratcha = Reg::ScratchA.offset();
    b.dmode(DmodeKind::MemoryToNcr)
        .memory_move(4, cell, Operand::Reg(scratcha))
        .dmode(DmodeKind::MemoryToMemory);
    for i in 0..4 {
        b.reg_to_sfbr(scratcha + i)
            .jump(Operand::Label(target), Cond::if_data(0).not());
    }
}

fn scheduler(b: &mut ScriptBuilder) {
    let scratchb = Reg::ScratchB.offset();

    // Issue path: pick up the head of the issue queue, if any
    b.label(Label::Schedule).load_reg(scratchb, 0);
    branch_if_nonzero(b, Operand::Abs(AbsSymbol::IssueDsaHead, 0), Label::Issue);
    b.jump(Operand::Label(Label::WaitReselect), Cond::ALWAYS);

    b.label(Label::Issue).memory_move(
        4,
        Operand::Abs(AbsSymbol::IssueDsaHead, 0),
        Operand::LabelPlus(Label::JumpDsa, 4),
    );
    b.label(Label::JumpDsa).jump(Operand::Imm(0), Cond::ALWAYS);

    // Idle: wait for a reselection or for the host to signal new work
    b.label(Label::WaitReselect)
        .wait_reselect(Operand::Label(Label::ReselectAlt))
        .jump(Operand::Label(Label::Reselected), Cond::ALWAYS);
    b.label(Label::ReselectAlt)
        .reg_to_sfbr(Reg::Ctest2.offset())
        .jump(
            Operand::Label(Label::Schedule),
            Cond::if_data(CTEST2_SIGP).mask(!CTEST2_SIGP),
        )
        .int(IntCode::ErrSelected, Cond::ALWAYS);

    // Reselected: fetch IDENTIFY and walk the reconnect queue. Every
    // descriptor's code checks the target and LUN itself and either takes
    // over or advances the cursor.
    b.label(Label::Reselected)
        .load_reg(scratchb, 1)
        .block_move(
            Phase::MsgIn,
            1,
            Operand::Abs(AbsSymbol::ReselectedIdentify, 0),
        )
        .memory_move(
            4,
            Operand::Abs(AbsSymbol::ReconnectDsaHead, 0),
            Operand::Abs(AbsSymbol::ReconnectCursor, 0),
        );
    b.label(Label::ReselectWalk);
    branch_if_nonzero(
        b,
        Operand::Abs(AbsSymbol::ReconnectCursor, 0),
        Label::ReselectWalkGo,
    );
    b.int(IntCode::ErrUnexpectedReselect, Cond::ALWAYS);
    b.label(Label::ReselectWalkGo).memory_move(
        4,
        Operand::Abs(AbsSymbol::ReconnectCursor, 0),
        Operand::LabelPlus(Label::JumpReselectDsa, 4),
    );
    b.label(Label::JumpReselectDsa)
        .jump(Operand::Imm(0), Cond::ALWAYS);
}

fn selection(b: &mut ScriptBuilder) {
    b.label(Label::Select)
        .select_table(
            true,
            FIELD_SELECT,
            Operand::Label(Label::ReselectedDuringSelect),
        )
        .move_table(Phase::MsgOut, FIELD_MSGOUT)
        .ret(Cond::ALWAYS);
    b.label(Label::SelectEnd);
    b.label(Label::ReselectedDuringSelect)
        .int(IntCode::NormSelectLost, Cond::ALWAYS);
}

fn messages(b: &mut ScriptBuilder) {
    let msg = |add| Operand::Abs(AbsSymbol::MsgBuf, add);
    let scntl2 = Reg::Scntl2.offset();

    b.label(Label::MsgIn)
        .block_move(Phase::MsgIn, 1, msg(0))
        .jump(Operand::Label(Label::MsgExtended), Cond::if_data(MSG_EXTENDED))
        .jump(
            Operand::Label(Label::MsgDisconnect),
            Cond::if_data(MSG_DISCONNECT),
        )
        .int(IntCode::Msg1, Cond::ALWAYS);

    b.label(Label::MsgExtended)
        .clear(insn::ACK)
        .block_move(Phase::MsgIn, 1, msg(1))
        .jump(Operand::Label(Label::MsgExt2), Cond::if_data(2))
        .jump(Operand::Label(Label::MsgExt3), Cond::if_data(3))
        .jump(Operand::Label(Label::RejectMessage), Cond::ALWAYS);
    b.label(Label::MsgExt2)
        .clear(insn::ACK)
        .block_move(Phase::MsgIn, 2, msg(2))
        .int(IntCode::MsgWdtr, Cond::if_data(EXTENDED_WDTR))
        .jump(Operand::Label(Label::RejectMessage), Cond::ALWAYS);
    b.label(Label::MsgExt3)
        .clear(insn::ACK)
        .block_move(Phase::MsgIn, 3, msg(2))
        .int(IntCode::MsgSdtr, Cond::if_data(EXTENDED_SDTR))
        .jump(Operand::Label(Label::RejectMessage), Cond::ALWAYS);

    b.label(Label::MsgDisconnect)
        .and_reg(scntl2, !SCNTL2_SDU)
        .clear(insn::ACK)
        .wait_disconnect()
        .int(IntCode::NormDisconnected, Cond::ALWAYS);

    b.label(Label::RejectMessage)
        .set(insn::ATN)
        .clear(insn::ACK)
        .block_move(Phase::MsgOut, 1, Operand::Extern(Extern::RejectMsg))
        .ret(Cond::ALWAYS);
    b.label(Label::AcceptMessage)
        .clear(insn::ACK)
        .ret(Cond::ALWAYS);
    b.label(Label::RespondMessage)
        .set(insn::ATN)
        .clear(insn::ACK)
        .move_table(Phase::MsgOut, FIELD_MSGOUT_OTHER)
        .ret(Cond::ALWAYS);
}

fn completion(b: &mut ScriptBuilder) {
    let scratcha = Reg::ScratchA.offset();

    b.label(Label::CommandComplete)
        .move_table(Phase::Status, FIELD_STATUS)
        .sfbr_to_reg(scratcha)
        .move_table(Phase::MsgIn, FIELD_MSGIN)
        .and_reg(Reg::Scntl2.offset(), !SCNTL2_SDU)
        .clear(insn::ACK)
        .wait_disconnect()
        .reg_to_sfbr(scratcha)
        .int(
            IntCode::ErrCheckCondition,
            Cond::if_data(STATUS_CHECK_CONDITION).mask(0xC1),
        );
    b.label(Label::CommandCompleteInt)
        .int(IntCode::NormCommandComplete, Cond::ALWAYS)
        .patch_last(PatchKind::IntflyCompletion)
        .jump(Operand::Label(Label::Schedule), Cond::ALWAYS);

    b.label(Label::OtherTransfer)
        .jump(
            Operand::Label(Label::CommandComplete),
            Cond::when(Phase::Status),
        )
        .int(
            IntCode::ErrUnexpectedPhase,
            Cond::if_phase(Phase::MsgIn).not(),
        )
        .call(Operand::Label(Label::MsgIn), Cond::ALWAYS)
        .jump(Operand::Label(Label::OtherTransfer), Cond::ALWAYS);
}

fn aborts(b: &mut ScriptBuilder) {
    let sink = Operand::Extern(Extern::Sink);

    // Assert ATN and drain a byte in whatever phase the target is in until
    // it goes to MESSAGE OUT
    b.label(Label::InitiatorAbort)
        .set(insn::ATN)
        .jump(Operand::Label(Label::IaMsgOut), Cond::when(Phase::MsgOut))
        .jump(Operand::Label(Label::IaDataOut), Cond::if_phase(Phase::DataOut))
        .jump(Operand::Label(Label::IaCommand), Cond::if_phase(Phase::Command))
        .jump(Operand::Label(Label::IaStatus), Cond::if_phase(Phase::Status))
        .jump(Operand::Label(Label::IaMsgIn), Cond::if_phase(Phase::MsgIn))
        .block_move(Phase::DataIn, 1, sink)
        .jump(Operand::Label(Label::IaDrained), Cond::ALWAYS);
    b.label(Label::IaDataOut)
        .block_move(Phase::DataOut, 1, sink)
        .jump(Operand::Label(Label::IaDrained), Cond::ALWAYS);
    b.label(Label::IaCommand)
        .block_move(Phase::Command, 1, sink)
        .jump(Operand::Label(Label::IaDrained), Cond::ALWAYS);
    b.label(Label::IaStatus)
        .block_move(Phase::Status, 1, sink)
        .jump(Operand::Label(Label::IaDrained), Cond::ALWAYS);
    b.label(Label::IaMsgIn)
        .block_move(Phase::MsgIn, 1, sink)
        .clear(insn::ACK);
    b.label(Label::IaDrained)
        .jump(Operand::Label(Label::IaMsgOut), Cond::when(Phase::MsgOut))
        .jump(Operand::Label(Label::InitiatorAbort), Cond::ALWAYS);
    b.label(Label::IaMsgOut)
        .block_move(Phase::MsgOut, 1, Operand::Extern(Extern::AbortMsg))
        .wait_disconnect()
        .int(IntCode::NormAborted, Cond::ALWAYS);

    // Reselected by a target nobody waits for
    b.label(Label::TargetAbort)
        .set(insn::ATN)
        .clear(insn::ACK)
        .block_move(Phase::MsgOut, 1, Operand::Extern(Extern::AbortMsg))
        .wait_disconnect()
        .jump(Operand::Label(Label::Schedule), Cond::ALWAYS);
}

fn self_tests(b: &mut ScriptBuilder) {
    let scratcha = Operand::Reg(Reg::ScratchA.offset());
    let scratchb = Operand::Reg(Reg::ScratchB.offset());

    b.label(Label::Test1)
        .memory_move(
            4,
            Operand::Abs(AbsSymbol::TestSrc, 0),
            Operand::Abs(AbsSymbol::TestDst, 0),
        )
        .int(IntCode::Test1, Cond::ALWAYS);

    // Runs a single descriptor whose address is in TestSrc
    b.label(Label::Test2)
        .memory_move(
            4,
            Operand::Abs(AbsSymbol::TestSrc, 0),
            Operand::LabelPlus(Label::JumpTest2, 4),
        )
        .load_reg(Reg::ScratchB.offset(), 0);
    b.label(Label::JumpTest2).jump(Operand::Imm(0), Cond::ALWAYS);

    b.label(Label::Test3)
        .dmode(DmodeKind::MemoryToNcr)
        .memory_move(4, Operand::Abs(AbsSymbol::TestSrc, 0), scratcha)
        .dmode(DmodeKind::NcrToNcr)
        .memory_move(4, scratcha, scratchb)
        .dmode(DmodeKind::NcrToMemory)
        .memory_move(4, scratchb, Operand::Abs(AbsSymbol::TestDst, 0))
        .dmode(DmodeKind::MemoryToMemory)
        .int(IntCode::Test3, Cond::ALWAYS);
}

/// Per-command fragment. Offsets of `Dsa` operands are relative to the
/// descriptor start, which is where this fragment gets copied to.
fn dsa_template(b: &mut ScriptBuilder) {
    let start = b.here();
    let field = |f: u32| Operand::Dsa(DSA_FIELDS_START + f);
    let dsa = Operand::Reg(Reg::Dsa.offset());

    b.label(Label::DsaCodeTemplate)
        .reg_to_sfbr(Reg::ScratchB.offset())
        .jump(Operand::Rel(Label::DsaReselectCheck), Cond::if_data(1));

    // Issue entry: dequeue ourselves, load DSA and select
    b.memory_move(4, field(FIELD_NEXT), Operand::Abs(AbsSymbol::IssueDsaHead, 0))
        .dmode(DmodeKind::MemoryToNcr)
        .memory_move(4, field(FIELD_SELF), dsa)
        .dmode(DmodeKind::MemoryToMemory)
        .call(Operand::Label(Label::Select), Cond::ALWAYS);

    // Resume slot, rewritten on SAVE DATA POINTERS
    b.label(Label::DsaJumpResume);
    let dispatch = b.here() + 8 - start;
    b.jump(Operand::Dsa(dispatch), Cond::ALWAYS);
    b.label(Label::DsaDispatch);
    b.label(Label::DsaDataInJump)
        .jump(Operand::Imm(0), Cond::when(Phase::DataIn));
    b.label(Label::DsaDataOutJump)
        .jump(Operand::Imm(0), Cond::if_phase(Phase::DataOut))
        .jump(Operand::Rel(Label::DsaSendCmd), Cond::if_phase(Phase::Command))
        .jump(
            Operand::Label(Label::CommandComplete),
            Cond::if_phase(Phase::Status),
        )
        .int(
            IntCode::ErrUnexpectedPhase,
            Cond::if_phase(Phase::MsgIn).not(),
        )
        .call(Operand::Label(Label::MsgIn), Cond::ALWAYS)
        .jump(Operand::Rel(Label::DsaDispatch), Cond::ALWAYS);
    b.label(Label::DsaSendCmd)
        .move_table(Phase::Command, FIELD_CMDOUT)
        .jump(Operand::Rel(Label::DsaDispatch), Cond::ALWAYS);

    // Reselect entry: compare the reselecting target and LUN with ours
    b.label(Label::DsaReselectCheck)
        .reg_to_sfbr(Reg::Ssid.offset())
        .jump(Operand::Rel(Label::DsaCheckLun), Cond::if_data(0).mask(0x70))
        .patch_last(PatchKind::TargetImmediate)
        .jump(Operand::Rel(Label::DsaNoMatch), Cond::ALWAYS);
    b.label(Label::DsaCheckLun)
        .dmode(DmodeKind::MemoryToNcr)
        .memory_move(
            1,
            Operand::Abs(AbsSymbol::ReselectedIdentify, 0),
            Operand::Reg(Reg::Sfbr.offset()),
        )
        .dmode(DmodeKind::MemoryToMemory)
        .jump(Operand::Rel(Label::DsaMatched), Cond::if_data(0).mask(0xF8))
        .patch_last(PatchKind::LunImmediate);
    b.label(Label::DsaNoMatch)
        .memory_move(
            4,
            field(FIELD_NEXT),
            Operand::Abs(AbsSymbol::ReconnectCursor, 0),
        )
        .jump(Operand::Label(Label::ReselectWalk), Cond::ALWAYS);
    b.label(Label::DsaMatched)
        .dmode(DmodeKind::MemoryToNcr)
        .memory_move(4, field(FIELD_SELF), dsa)
        .dmode(DmodeKind::MemoryToMemory)
        .clear(insn::ACK)
        .int(IntCode::NormReselectComplete, Cond::ALWAYS);
    b.label(Label::DsaCodeTemplateEnd);
}

/// Assembles the canonical program
pub fn assemble() -> Result<ScriptTemplate, ScriptError> {
    let mut b = ScriptBuilder::new();
    scheduler(&mut b);
    selection(&mut b);
    messages(&mut b);
    completion(&mut b);
    aborts(&mut b);
    self_tests(&mut b);
    dsa_template(&mut b);
    let t = b.finish()?;

    let range = t.dsa_template();
    if range.end - range.start != DSA_FIELDS_START {
        return Err(ScriptError::FieldsMisaligned {
            expected: DSA_FIELDS_START,
            actual: range.end - range.start,
        });
    }
    Ok(t)
}
