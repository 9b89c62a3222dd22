//! Interrupt dispatcher and phase state machine
//!
//! SCSI and DMA conditions stop the SCRIPTS processor. The handler
//! classifies what happened, completes commands and decides where SCRIPTS
//! resume, then restarts the chip by writing DSP. Completions signalled on
//! the fly (INTFLY) do not stop the chip and are found by scanning the
//! issued descriptors.

use log::*;
use num_traits::FromPrimitive;

use super::command::{CommandResult, HostStatus};
use super::dsa::{
    DsaId, DsaState, FIELD_MSGOUT_OTHER, FIELD_MSGOUT_OTHER_BUF, FIELD_RESULT, rewrite_for_sense,
};
use super::host::{HostAdapter, HostState};
use super::regs::{
    CTEST3_CLF, Dstat, EXTENDED_WDTR, ISTAT_INTF, Istat, MSG_COMMAND_COMPLETE, MSG_EXTENDED,
    MSG_NOP, MSG_REJECT, MSG_RESTORE_POINTERS, MSG_SAVE_DATA_POINTERS, Phase, Reg,
    STATUS_CHECK_CONDITION, STEST3_CSF, Sbcl, Sist0, Sist1,
};
use super::scripts::insn::{Insn, InsnType};
use super::scripts::{AbsSymbol, IntCode, Label};
use super::sync::{Negotiation, sdtr_message};
use crate::bus::{DmaMemory, MemoryResult, Platform};
use crate::types::BusAddr;

/// Interrupt status re-reads per call, bounds a stuck interrupt line
const MAX_INTERRUPT_LOOPS: usize = 16;

/// What to do after a phase mismatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MismatchAction {
    /// Target went to STATUS in the middle of the data: collect status
    CommandComplete,
    /// Target wants to send a message mid transfer: rewrite the faulting
    /// move to cover what is left and handle the message
    ResumeAfterMessage,
    /// Anything else: get the target off the bus
    InitiatorAbort,
}

/// Classifies a phase mismatch from the faulting instruction, whether it
/// lies in the current command's data streams, and the phase the target
/// actually asserts.
pub fn classify_phase_mismatch(faulting: Insn, in_stream: bool, real: Phase) -> MismatchAction {
    if !in_stream {
        return MismatchAction::InitiatorAbort;
    }
    match real {
        Phase::Status => MismatchAction::CommandComplete,
        Phase::MsgIn
            if faulting.kind() == InsnType::BlockMove
                && !faulting.bm_indirect()
                && !faulting.bm_table()
                && matches!(
                    Phase::from_code(faulting.phase()),
                    Phase::DataIn | Phase::DataOut
                ) =>
        {
            MismatchAction::ResumeAfterMessage
        }
        _ => MismatchAction::InitiatorAbort,
    }
}

/// Status bytes the completion code treats as CHECK CONDITION
const fn is_check_condition(status: u8) -> bool {
    status & 0x3E == STATUS_CHECK_CONDITION
}

impl<P: Platform> HostAdapter<P> {
    /// Services whatever the chip signals. Returns false when there was
    /// nothing pending, for shared interrupt lines.
    pub fn interrupt(&mut self) -> bool {
        let mut handled = false;
        for _ in 0..MAX_INTERRUPT_LOOPS {
            let istat = Istat(self.regs.read8(&mut self.platform, Reg::Istat));
            if !(istat.sip() || istat.dip() || istat.intf()) {
                break;
            }
            handled = true;
            self.stats.interrupts += 1;
            if istat.intf() {
                self.regs.write8(&mut self.platform, Reg::Istat, ISTAT_INTF);
                self.intfly_scan();
            }
            if istat.sip() || istat.dip() {
                self.service_halted(istat);
            }
        }
        handled
    }

    /// Services a pending interrupt, if any
    pub fn poll(&mut self) -> bool {
        let istat = Istat(self.regs.read8(&mut self.platform, Reg::Istat));
        if !(istat.sip() || istat.dip() || istat.intf()) {
            return false;
        }
        self.interrupt()
    }

    /// Descriptor the DSA register points at
    pub(super) fn current(&mut self) -> Option<DsaId> {
        let dsa = self.regs.read32(&mut self.platform, Reg::Dsa);
        let id = self.pool.find_by_dsa(dsa);
        if id.is_none() {
            debug!("{}: DSA {:08X} is no active descriptor", self.name(), dsa);
        }
        id
    }

    fn redirect(&mut self, label: Label) {
        self.dsp = self.script.addr(label);
        self.dsp_changed = true;
    }

    fn redirect_to(&mut self, addr: BusAddr) {
        self.dsp = addr;
        self.dsp_changed = true;
    }

    fn intfly_scan(&mut self) {
        self.stats.intfly += 1;
        let mut issued = self.pool.active();
        if self.pool.get(self.bootstrap).state == DsaState::Issued {
            issued.push(self.bootstrap);
        }
        for id in issued {
            let d = self.pool.get(id);
            if d.state != DsaState::Issued {
                continue;
            }
            match d.read_result(self.platform.memory()) {
                Ok(Some((status, msg)))
                    if msg == MSG_COMMAND_COMPLETE && !is_check_condition(status) =>
                {
                    trace!("{}: on the fly completion of {:08X}", self.name(), d.base);
                    let result = self.result_of(id, status, msg);
                    self.complete(id, result);
                }
                Ok(_) => (),
                Err(e) => error!("{}: reading result: {}", self.name(), e),
            }
        }
    }

    /// Reinitializes after a condition the chip cannot recover from.
    /// Commands the chip could see fail with reset, software queued ones
    /// are issued again afterwards.
    pub(super) fn fatal_reinit(&mut self) {
        self.stats.fatal += 1;
        let snapshot = self.snapshot();
        error!("{}: fatal condition, reinitializing: {:?}", self.name(), snapshot);
        self.state = HostState::Halted;
        self.fail_all(HostStatus::Reset, false);
        self.recover(true);
        self.reinitialized = true;
        self.run_soft_queue();
    }

    fn service_halted(&mut self, istat: Istat) {
        let p = &mut self.platform;
        let dstat = if istat.dip() {
            Dstat(self.regs.read8(p, Reg::Dstat))
        } else {
            Dstat(0)
        };
        let (sist0, sist1) = if istat.sip() {
            (
                Sist0(self.regs.read8(p, Reg::Sist0)),
                Sist1(self.regs.read8(p, Reg::Sist1)),
            )
        } else {
            (Sist0(0), Sist1(0))
        };
        self.dsp = self.regs.read32(p, Reg::Dsp);
        let dsps = self.regs.read32(p, Reg::Dsps);
        self.dstat = Some(dstat);
        self.state = HostState::Halted;
        self.dsp_changed = false;
        self.hold = false;
        self.reinitialized = false;
        trace!(
            "{}: halted at {:08X} dstat {:02X} sist {:02X}/{:02X} dsps {:08X}",
            self.name(),
            self.dsp,
            dstat.0,
            sist0.0,
            sist1.0,
            dsps
        );

        if dstat.mdpe() || dstat.bf() || sist0.rst() {
            error!(
                "{}: {}{}{}at {:08X}",
                self.name(),
                if dstat.mdpe() { "data parity error " } else { "" },
                if dstat.bf() { "bus fault " } else { "" },
                if sist0.rst() { "SCSI bus reset " } else { "" },
                self.dsp
            );
            self.fatal_reinit();
            return;
        }
        if dstat.iid() {
            let fault = self.dsp.wrapping_sub(8);
            if self.script.within(Label::Select, Label::SelectEnd, fault) {
                // Selection timing out while the next instruction is fetched
                debug!(
                    "{}: illegal instruction at {:08X} during selection, ignored",
                    self.name(),
                    fault
                );
            } else {
                let word = self.platform.memory().read_u32(fault).unwrap_or(0);
                error!(
                    "{}: illegal instruction {:08X} at {:08X}",
                    self.name(),
                    word,
                    fault
                );
                self.fatal_reinit();
                return;
            }
        }

        if sist1.sto() {
            self.selection_timeout();
        }
        if sist0.udc() {
            self.unexpected_disconnect();
        }
        if sist0.par() {
            self.abort_current(HostStatus::Parity, "parity error");
        }
        if sist0.sge() {
            self.abort_current(HostStatus::Error, "gross error");
        }
        if sist0.ma() {
            self.phase_mismatch();
        }
        if dstat.sir() {
            self.user_interrupt(dsps);
            if self.reinitialized {
                return;
            }
        }
        if dstat.ssi() {
            debug!("{}: single step at {:08X}", self.name(), self.dsp);
        }
        if dstat.abrt() {
            warn!("{}: SCRIPTS aborted at {:08X}", self.name(), self.dsp);
        }

        self.flush_fifos();
        self.resume();
    }

    fn flush_fifos(&mut self) {
        let p = &mut self.platform;
        let ctest3 = self.regs.read8(p, Reg::Ctest3);
        self.regs.write8(p, Reg::Ctest3, ctest3 | CTEST3_CLF);
        let stest3 = self.regs.read8(p, Reg::Stest3);
        self.regs.write8(p, Reg::Stest3, stest3 | STEST3_CSF);
    }

    fn resume(&mut self) {
        if self.hold {
            self.state = HostState::Idle;
            return;
        }
        if self.dsp_changed {
            trace!("{}: resuming at {:08X}", self.name(), self.dsp);
        }
        self.state = HostState::Running;
        self.regs.write32(&mut self.platform, Reg::Dsp, self.dsp);
    }

    fn selection_timeout(&mut self) {
        if let Some(id) = self.current() {
            let d = self.pool.get(id);
            debug!(
                "{}: selection timeout on {}:{}",
                self.name(),
                d.target,
                d.lun
            );
            if d.bootstrap {
                self.hold = true;
            }
            self.complete(id, CommandResult::host(HostStatus::BadTarget));
        }
        self.redirect(Label::Schedule);
    }

    fn unexpected_disconnect(&mut self) {
        match self.current() {
            Some(id) if self.pool.get(id).state == DsaState::Issued => {
                let d = self.pool.get(id);
                warn!(
                    "{}: {}:{} disconnected unexpectedly at {:08X}",
                    self.name(),
                    d.target,
                    d.lun,
                    self.dsp
                );
                self.complete(id, CommandResult::host(HostStatus::Error));
            }
            _ => warn!("{}: unexpected disconnect at {:08X}", self.name(), self.dsp),
        }
        self.redirect(Label::Schedule);
    }

    /// Marks the connected command failed and aborts it on the bus
    fn abort_current(&mut self, host: HostStatus, what: &str) {
        warn!("{}: {} at {:08X}", self.name(), what, self.dsp);
        if let Some(id) = self.current() {
            self.pool.get_mut(id).pending = Some(host);
        }
        self.redirect(Label::InitiatorAbort);
    }

    fn phase_mismatch(&mut self) {
        self.stats.phase_mismatches += 1;
        let fault = self.dsp.wrapping_sub(8);
        let p = &mut self.platform;
        let remaining = self.regs.read32(p, Reg::Dbc) & 0x00FF_FFFF;
        let next_addr = self.regs.read32(p, Reg::Dnad);
        let real = Phase::from_code(Sbcl(self.regs.read8(p, Reg::Sbcl)).phase());
        let faulting = Insn(self.platform.memory().read_u32(fault).unwrap_or(0));

        let current = self.current();
        let in_stream = current.is_some_and(|id| self.pool.get(id).streams().contains(&fault));
        let action = classify_phase_mismatch(faulting, in_stream, real);
        debug!(
            "{}: phase mismatch at {:08X}, {} bytes left, now {:?}: {:?}",
            self.name(),
            fault,
            remaining,
            real,
            action
        );

        match action {
            MismatchAction::CommandComplete => self.redirect(Label::CommandComplete),
            MismatchAction::ResumeAfterMessage => {
                let mut rewritten = faulting;
                rewritten.set_count(remaining);
                let mem = self.platform.memory_mut();
                let written = mem
                    .write_u32(fault, rewritten.0)
                    .and_then(|_| mem.write_u32(fault + 4, next_addr));
                if let Err(e) = written {
                    error!("{}: rewriting data move: {}", self.name(), e);
                }
                self.regs.write32(&mut self.platform, Reg::Temp, fault);
                self.redirect(Label::MsgIn);
            }
            MismatchAction::InitiatorAbort => {
                if let Some(id) = current {
                    let d = self.pool.get_mut(id);
                    d.pending.get_or_insert(HostStatus::Error);
                }
                self.redirect(Label::InitiatorAbort);
            }
        }
    }

    fn read_msg(&self, n: usize) -> MemoryResult<[u8; 5]> {
        let mut m = [0; 5];
        self.platform
            .memory()
            .read_bytes(self.cells.abs_addr(AbsSymbol::MsgBuf), &mut m[..n])?;
        Ok(m)
    }

    /// Points MSGOUT_OTHER of the connected command at a reply
    fn set_reply(&mut self, id: DsaId, msg: &[u8]) -> MemoryResult<()> {
        let d = self.pool.get(id);
        let buf = d.field(FIELD_MSGOUT_OTHER_BUF);
        let table = d.field(FIELD_MSGOUT_OTHER);
        let mem = self.platform.memory_mut();
        mem.write_bytes(buf, msg)?;
        mem.write_u32(table, msg.len() as u32)?;
        mem.write_u32(table + 4, buf)
    }

    /// Loads the transfer registers for a target right away
    fn program_sync(&mut self, target: u8) {
        let t = *self.sync.get(target);
        let p = &mut self.platform;
        self.regs.write8(p, Reg::Scntl3, t.scntl3);
        self.regs.write8(p, Reg::Sxfer, t.sxfer);
        if let Err(e) = self.sync.write_fragment(p.memory_mut(), &self.cells, target) {
            error!("{}: sync fragment: {}", self.name(), e);
        }
    }

    fn user_interrupt(&mut self, dsps: u32) {
        let Some(code) = IntCode::from_u32(dsps) else {
            error!(
                "{}: unknown interrupt code {:08X} at {:08X}",
                self.name(),
                dsps,
                self.dsp
            );
            self.fatal_reinit();
            return;
        };
        trace!("{}: {:?}", self.name(), code);

        match code {
            IntCode::NormCommandComplete => self.command_complete(),
            IntCode::NormDisconnected => self.disconnected(),
            IntCode::NormReselectComplete => self.reselect_complete(),
            IntCode::NormSelectLost => self.select_lost(),
            IntCode::NormAborted => {
                if let Some(id) = self.current() {
                    let host = self.pool.get(id).pending.unwrap_or(HostStatus::Aborted);
                    info!("{}: abort sequence finished, {}", self.name(), host);
                    self.complete(id, CommandResult::host(host));
                }
                self.redirect(Label::Schedule);
            }
            IntCode::Msg1 => self.message(),
            IntCode::MsgSdtr => self.sdtr(),
            IntCode::MsgWdtr => {
                // 8 bit transfers only
                match self.current() {
                    Some(id) => {
                        if let Err(e) = self.set_reply(id, &[MSG_EXTENDED, 2, EXTENDED_WDTR, 0]) {
                            error!("{}: {}", self.name(), e);
                        }
                        self.redirect(Label::RespondMessage);
                    }
                    None => self.redirect(Label::RejectMessage),
                }
            }
            IntCode::ErrSelected => {
                warn!("{}: selected as a target, ignored", self.name());
                self.redirect(Label::Schedule);
            }
            IntCode::ErrUnexpectedReselect => {
                let p = &mut self.platform;
                let ssid = self.regs.read8(p, Reg::Ssid);
                let identify = p
                    .memory()
                    .read_u8(self.cells.abs_addr(AbsSymbol::ReselectedIdentify))
                    .unwrap_or(0);
                warn!(
                    "{}: reselected by target {} lun {} without a disconnected command",
                    self.name(),
                    ssid & 7,
                    identify & 7
                );
                self.redirect(Label::TargetAbort);
            }
            IntCode::ErrUnexpectedPhase => {
                let p = &mut self.platform;
                let phase = Phase::from_code(Sbcl(self.regs.read8(p, Reg::Sbcl)).phase());
                warn!(
                    "{}: unexpected phase {:?} at {:08X}",
                    self.name(),
                    phase,
                    self.dsp
                );
                if let Some(id) = self.current() {
                    self.pool.get_mut(id).pending = Some(HostStatus::Error);
                }
                self.redirect(Label::InitiatorAbort);
            }
            IntCode::ErrCheckCondition => self.check_condition(),
            IntCode::Test1 | IntCode::Test3 => {
                self.test.code = Some(code);
                self.test.finished = true;
                self.hold = true;
            }
            IntCode::DebugBreak => info!("{}: breakpoint at {:08X}", self.name(), self.dsp),
        }
    }

    fn command_complete(&mut self) {
        let Some(id) = self.current() else {
            warn!("{}: completion without a command", self.name());
            return;
        };
        let d = self.pool.get(id);
        let bootstrap = d.bootstrap;
        match d.read_result(self.platform.memory()) {
            Ok(Some((status, msg))) => {
                let result = self.result_of(id, status, msg);
                self.complete(id, result);
            }
            Ok(None) => {
                error!("{}: completion of {:08X} without status", self.name(), d.base);
                self.complete(id, CommandResult::host(HostStatus::Error));
            }
            Err(e) => {
                error!("{}: reading result: {}", self.name(), e);
                self.complete(id, CommandResult::host(HostStatus::Error));
            }
        }
        if bootstrap {
            self.hold = true;
        }
    }

    fn disconnected(&mut self) {
        self.redirect(Label::Schedule);
        let Some(id) = self.current() else {
            warn!("{}: disconnect without a command", self.name());
            return;
        };
        self.stats.disconnects += 1;
        let d = self.pool.get_mut(id);
        d.state = DsaState::Disconnected;
        let base = d.base;
        trace!("{}: {:08X} disconnected", self.name(), base);
        if let Err(e) = self.queues.push_reconnect(self.platform.memory_mut(), base) {
            error!("{}: reconnect queue: {}", self.name(), e);
        }
    }

    fn reselect_complete(&mut self) {
        let Some(id) = self.current() else {
            error!("{}: reselection matched no descriptor", self.name());
            self.redirect(Label::TargetAbort);
            return;
        };
        self.stats.reselects += 1;
        let d = self.pool.get_mut(id);
        d.state = DsaState::Issued;
        let (base, target, resume) = (d.base, d.target, d.resume_slot());
        let head = self.queues.reconnect_head;
        if let Err(e) = self.queues.unlink(self.platform.memory_mut(), head, base) {
            error!("{}: reconnect queue: {}", self.name(), e);
        }
        trace!("{}: {:08X} reselected by target {}", self.name(), base, target);
        // The sync fragment returns into the resume slot
        self.regs.write32(&mut self.platform, Reg::Temp, resume);
        let fragment = self.cells.sync_fragment(target);
        self.redirect_to(fragment);
    }

    fn select_lost(&mut self) {
        self.stats.select_lost += 1;
        if let Some(id) = self.current() {
            let base = self.pool.get(id).base;
            debug!("{}: selection of {:08X} lost to a reselection", self.name(), base);
            if let Err(e) = self
                .queues
                .push_front_issue(self.platform.memory_mut(), base)
            {
                error!("{}: issue queue: {}", self.name(), e);
            }
        }
        self.redirect(Label::Reselected);
    }

    fn message(&mut self) {
        let msg = match self.read_msg(1) {
            Ok(m) => m[0],
            Err(e) => {
                error!("{}: message buffer: {}", self.name(), e);
                self.redirect(Label::RejectMessage);
                return;
            }
        };
        let current = self.current();
        match msg {
            MSG_SAVE_DATA_POINTERS => {
                if let Some(id) = current {
                    let temp = self.regs.read32(&mut self.platform, Reg::Temp);
                    let slot = self.pool.get(id).resume_slot();
                    if let Err(e) = self.platform.memory_mut().write_u32(slot + 4, temp) {
                        error!("{}: saving pointers: {}", self.name(), e);
                    }
                }
                self.redirect(Label::AcceptMessage);
            }
            MSG_RESTORE_POINTERS => {
                if let Some(id) = current {
                    let slot = self.pool.get(id).resume_slot();
                    match self.platform.memory().read_u32(slot + 4) {
                        Ok(saved) => self.regs.write32(&mut self.platform, Reg::Temp, saved),
                        Err(e) => error!("{}: restoring pointers: {}", self.name(), e),
                    }
                }
                self.redirect(Label::AcceptMessage);
            }
            MSG_REJECT => {
                if let Some(id) = current {
                    let target = self.pool.get(id).target;
                    if self.sync.get(target).negotiation == Negotiation::InProgress {
                        info!(
                            "{}: target {} rejected SDTR, asynchronous transfers",
                            self.name(),
                            target
                        );
                        self.sync.set_async(target);
                        self.sync.set_negotiation(target, Negotiation::Done);
                        self.program_sync(target);
                    } else {
                        warn!("{}: target {} rejected a message", self.name(), target);
                    }
                }
                self.redirect(Label::AcceptMessage);
            }
            MSG_NOP => self.redirect(Label::AcceptMessage),
            _ => {
                warn!("{}: rejecting message {:02X}", self.name(), msg);
                self.redirect(Label::RejectMessage);
            }
        }
    }

    fn sdtr(&mut self) {
        let Some(id) = self.current() else {
            self.redirect(Label::RejectMessage);
            return;
        };
        let msg = match self.read_msg(5) {
            Ok(m) => m,
            Err(e) => {
                error!("{}: message buffer: {}", self.name(), e);
                self.redirect(Label::RejectMessage);
                return;
            }
        };
        let (period, offset) = (msg[3], msg[4]);
        let target = self.pool.get(id).target;
        let chip = self.chip();

        if self.sync.get(target).negotiation == Negotiation::InProgress {
            // Reply to ours
            if offset > chip.max_sync_offset || (offset != 0 && period < chip.min_period_factor) {
                warn!(
                    "{}: target {} answered SDTR period {} offset {}, out of range",
                    self.name(),
                    target,
                    period,
                    offset
                );
                self.sync.set_async(target);
                self.sync.set_negotiation(target, Negotiation::Done);
                self.program_sync(target);
                self.redirect(Label::RejectMessage);
                return;
            }
            let (period, offset) = self.sync.set_negotiated(target, period, offset, chip);
            info!(
                "{}: target {} period factor {} offset {}",
                self.name(),
                target,
                period,
                offset
            );
            self.program_sync(target);
            self.redirect(Label::AcceptMessage);
            return;
        }

        // Target initiated: answer with what we can do
        let wanted_period = period.max(self.config.sync_period_factor);
        let wanted_offset = if self.config.sync_negotiation {
            offset.min(self.config.sync_offset)
        } else {
            0
        };
        let (period, offset) = self
            .sync
            .set_negotiated(target, wanted_period, wanted_offset, chip);
        info!(
            "{}: target {} initiated SDTR, answering period factor {} offset {}",
            self.name(),
            target,
            period,
            offset
        );
        if let Err(e) = self.set_reply(id, &sdtr_message(period, offset)) {
            error!("{}: {}", self.name(), e);
        }
        self.program_sync(target);
        self.redirect(Label::RespondMessage);
    }

    /// Contingent allegiance: turn the descriptor into a REQUEST SENSE and
    /// select the target again
    fn check_condition(&mut self) {
        let Some(id) = self.current() else {
            warn!("{}: CHECK CONDITION without a command", self.name());
            self.redirect(Label::Schedule);
            return;
        };
        let d = self.pool.get(id);
        let mem = self.platform.memory();
        let status = d.read_status(mem).ok().flatten().unwrap_or(STATUS_CHECK_CONDITION);
        let message = mem.read_u8(d.field(FIELD_RESULT) + 1).unwrap_or(0);

        if d.sensing {
            warn!(
                "{}: REQUEST SENSE to {}:{} failed with status {:02X}",
                self.name(),
                d.target,
                d.lun,
                status
            );
            let result = CommandResult {
                host: d.pending.unwrap_or(HostStatus::Ok),
                status: d.original_status,
                message,
                sense: None,
            };
            self.complete(id, result);
            self.redirect(Label::Schedule);
            return;
        }
        if d.bootstrap {
            let result = self.result_of(id, status, message);
            self.complete(id, result);
            self.hold = true;
            return;
        }

        let target = d.target;
        let cdb1 = d.cmd.as_ref().and_then(|c| c.cdb.get(1).copied()).unwrap_or(0);
        debug!(
            "{}: CHECK CONDITION from {}:{}, fetching sense",
            self.name(),
            target,
            d.lun
        );
        self.stats.sense += 1;

        // Sense is always fetched asynchronously
        self.sync.set_async(target);
        if self.sync.get(target).negotiation == Negotiation::Done {
            self.sync.set_negotiation(target, Negotiation::Needed);
        }
        self.program_sync(target);

        let d = self.pool.get_mut(id);
        d.sensing = true;
        d.original_status = status;
        let resume = d.resume_slot();
        let d = self.pool.get(id);
        let rewritten = rewrite_for_sense(
            self.platform.memory_mut(),
            d,
            cdb1,
            self.sync.select_word(target),
            self.config.disconnect,
            &self.script,
        );
        if let Err(e) = rewritten {
            error!("{}: sense rewrite: {}", self.name(), e);
            let result = CommandResult {
                host: HostStatus::Error,
                status,
                message,
                sense: None,
            };
            self.complete(id, result);
            self.redirect(Label::Schedule);
            return;
        }
        // Selection returns into the resume slot, which dispatches
        self.regs.write32(&mut self.platform, Reg::Temp, resume);
        self.redirect(Label::Select);
    }
}
