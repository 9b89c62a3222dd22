//! Host adapter: attach, command submission and completion, abort, reset

use std::collections::VecDeque;
use std::fmt;

use itertools::Itertools;
use log::*;
use serde::{Deserialize, Serialize};

use super::chip::{self, ChipInfo};
use super::command::{AbortOutcome, CommandResult, CompletionFn, HostStatus, ScsiCommand};
use super::config::HostConfig;
use super::dsa::{self, BuildContext, DsaId, DsaPool, DsaState};
use super::error::{DriverError, SubmitError};
use super::fixup::{self, FixedScript, FixupContext, HostCells};
use super::queue::{ChipQueues, LunBusy};
use super::regs::{
    DCNTL_COM, DIEN_ENABLE, Dmode, Dstat, ISTAT_SRST, Istat, Reg, SCID_RRE, SCNTL0_ARB_FULL,
    SCNTL0_EPC, SCNTL1_RST, SIEN0_ENABLE, SIEN1_ENABLE, Scntl3,
};
use super::scripts::program;
use super::scripts::{AbsSymbol, Label};
use super::selftest::{InquiryReport, TestProgress};
use super::sync::{Negotiation, SyncTable, sdtr_message};
use crate::bus::{DmaMemory, MappingMode, Platform, RegisterWindow};
use crate::types::BusAddr;

/// ISTAT polls waiting for a soft reset to self-clear
const SRST_POLLS: usize = 100;
/// SCSI RST hold time in microseconds, comfortably above the 25us minimum
const RESET_HOLD_US: u32 = 50;

/// What bus enumeration found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeInfo {
    pub device: u16,
    pub revision: u8,
    pub irq: u32,
    /// Zero when the chip has no memory BAR
    pub mmio_base: BusAddr,
    pub io_base: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::IntoStaticStr)]
pub enum HostState {
    /// SCRIPTS stopped, the host owns the chip
    Idle,
    Running,
    /// Stopped on an interrupt being serviced
    Halted,
}

/// Timing registers as left by the firmware, read before the first reset
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SavedTiming {
    pub dmode: u8,
    pub dcntl: u8,
    pub ctest4: u8,
    pub scntl3: u8,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct HostStats {
    pub queued: u64,
    pub soft_queued: u64,
    pub completed: u64,
    pub interrupts: u64,
    pub intfly: u64,
    pub resets: u64,
    pub fatal: u64,
    pub phase_mismatches: u64,
    pub enqueue_retries: u64,
    pub sense: u64,
    pub disconnects: u64,
    pub reselects: u64,
    pub select_lost: u64,
    pub aborts: u64,
    pub lost_interrupts: u64,
}

/// Register dump for log messages. Only registers without read side
/// effects are read; DSTAT comes from the value cached by the interrupt
/// handler.
#[derive(Debug, Clone, Serialize)]
pub struct ChipSnapshot {
    pub istat: u8,
    pub dstat: Option<u8>,
    pub dsp: u32,
    pub dsps: u32,
    pub dsa: u32,
    pub dbc: u32,
    pub dnad: u32,
    pub temp: u32,
    pub sbcl: u8,
    pub sfbr: u8,
    pub scratcha: u32,
    pub scratchb: u32,
    pub scntl3: u8,
    pub sxfer: u8,
}

/// Attach failure. Carries the platform back so the caller can retry with
/// different options.
pub struct AttachError<P> {
    pub error: DriverError,
    pub platform: P,
}

impl<P> fmt::Debug for AttachError<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AttachError({:?})", self.error)
    }
}

impl<P> fmt::Display for AttachError<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "attach failed: {}", self.error)
    }
}

/// Clock conversion factor for a SCSI core clock, used when the firmware
/// left SCNTL3 unprogrammed
const fn ccf_for_clock(mhz: u8) -> u8 {
    match mhz {
        0..=25 => 1,
        26..=37 => 2,
        38..=50 => 3,
        _ => 4,
    }
}

/// One 53c8xx and everything the driver keeps for it
pub struct HostAdapter<P: Platform> {
    name: String,
    pub(super) platform: P,
    chip: &'static ChipInfo,
    revision: u8,
    irq: u32,
    pub(super) config: HostConfig,
    pub(super) regs: RegisterWindow,
    saved: SavedTiming,
    pub(super) state: HostState,
    disabled: bool,

    /// Where SCRIPTS resume once the current interrupt is serviced
    pub(super) dsp: BusAddr,
    pub(super) dsp_changed: bool,
    /// DSTAT as read by the last interrupt, reading it again clears it
    pub(super) dstat: Option<Dstat>,
    /// Leave the chip stopped after servicing
    pub(super) hold: bool,
    /// The adapter was reinitialized while servicing an interrupt
    pub(super) reinitialized: bool,

    pub(super) cells: HostCells,
    image: BusAddr,
    pub(super) script: FixedScript,
    fixups: u32,
    pub(super) sync: SyncTable,
    pub(super) pool: DsaPool,
    pub(super) bootstrap: DsaId,
    pub(super) queues: ChipQueues,
    soft_queue: VecDeque<DsaId>,
    busy: LunBusy,
    done: CompletionFn,

    pub(super) test: TestProgress,
    pub(super) inquiry: Vec<InquiryReport>,
    pub(super) stats: HostStats,
}

impl<P: Platform> HostAdapter<P> {
    /// Brings up an adapter: picks the chip variant, loads and fixes up the
    /// SCRIPTS image, runs the configured self tests and starts the
    /// scheduler. Nothing stays allocated on failure.
    pub fn attach(
        name: impl Into<String>,
        mut platform: P,
        probe: ProbeInfo,
        config: HostConfig,
        done: CompletionFn,
    ) -> Result<Self, AttachError<P>> {
        let chip = match config
            .validate()
            .and_then(|_| chip::select(probe.device, probe.revision))
        {
            Ok(c) => c,
            Err(error) => return Err(AttachError { error, platform }),
        };
        let name = name.into();

        let mode = if config.io_mapped || probe.mmio_base == 0 {
            MappingMode::Port
        } else {
            MappingMode::Memory
        };
        let regs = RegisterWindow {
            mode,
            mmio_base: probe.mmio_base,
            io_base: probe.io_base,
        };

        let saved = Self::save_timing(&mut platform, &regs, chip);
        let mut pool = DsaPool::new(config.can_queue, config.sg_tablesize);
        let image_len = match program::assemble() {
            Ok(t) => (t.size() as usize).next_multiple_of(8) + pool.descriptor_size(),
            Err(e) => {
                return Err(AttachError {
                    error: e.into(),
                    platform,
                });
            }
        };

        let Some(cells_base) = platform.memory_mut().alloc(HostCells::SIZE, 8) else {
            return Err(AttachError {
                error: DriverError::ResourceExhausted("host cells"),
                platform,
            });
        };
        let Some(image) = platform.memory_mut().alloc(image_len, 8) else {
            platform.memory_mut().free(cells_base);
            return Err(AttachError {
                error: DriverError::ResourceExhausted("SCRIPTS image"),
                platform,
            });
        };
        let cells = HostCells { base: cells_base };

        let mut fixups = 0;
        let loaded = cells.init(platform.memory_mut()).map_err(DriverError::from).and_then(|_| {
            fixups += 1;
            fixup::load_and_fixup(
                platform.memory_mut(),
                &FixupContext {
                    base: image,
                    cells: &cells,
                    regs: &regs,
                    saved_dmode: Dmode(saved.dmode),
                    intfly: config.intfly && chip.intfly,
                },
            )
        });
        let script = match loaded {
            Ok(s) => s,
            Err(error) => {
                platform.memory_mut().free(image);
                platform.memory_mut().free(cells_base);
                return Err(AttachError { error, platform });
            }
        };

        let bootstrap = pool.add_bootstrap(image + script.size.next_multiple_of(8));
        let queues = ChipQueues::new(
            cells.abs_addr(AbsSymbol::IssueDsaHead),
            cells.abs_addr(AbsSymbol::ReconnectDsaHead),
            config.can_queue + 1,
        );
        let sync = SyncTable::new(config.sync_negotiation, Scntl3(saved.scntl3), chip.clock_mhz);

        info!(
            "{}: NCR {} rev {:02X} irq {}, {} mapped at {:08X}, SCRIPTS at {:08X}",
            name,
            chip.name,
            probe.revision,
            probe.irq,
            mode,
            match mode {
                MappingMode::Memory => probe.mmio_base,
                MappingMode::Port => BusAddr::from(probe.io_base),
            },
            image
        );

        let mut adapter = Self {
            name,
            platform,
            chip,
            revision: probe.revision,
            irq: probe.irq,
            disabled: config.probe_only,
            config,
            regs,
            saved,
            state: HostState::Idle,
            dsp: 0,
            dsp_changed: false,
            dstat: None,
            hold: false,
            reinitialized: false,
            cells,
            image,
            script,
            fixups,
            sync,
            pool,
            bootstrap,
            queues,
            soft_queue: VecDeque::new(),
            busy: LunBusy::default(),
            done,
            test: TestProgress::default(),
            inquiry: vec![],
            stats: HostStats::default(),
        };

        if adapter.disabled {
            info!("{}: probe only, adapter left disabled", adapter.name);
            return Ok(adapter);
        }

        adapter.reset_chip(false);
        adapter.program_chip();
        let started = adapter
            .run_selftests()
            .and_then(|_| adapter.adapter_init(false));
        if let Err(error) = started {
            error!("{}: {}", adapter.name, error);
            adapter.reset_chip(false);
            adapter.release_memory();
            return Err(AttachError {
                error,
                platform: adapter.platform,
            });
        }
        Ok(adapter)
    }

    fn save_timing(p: &mut P, regs: &RegisterWindow, chip: &ChipInfo) -> SavedTiming {
        let mut dmode = Dmode(regs.read8(p, Reg::Dmode));
        if dmode.bl() == 0 {
            // 8 transfer bursts
            dmode.set_bl(2);
        }
        let mut scntl3 = Scntl3(regs.read8(p, Reg::Scntl3));
        if scntl3.ccf() == 0 {
            scntl3.set_ccf(ccf_for_clock(chip.clock_mhz));
        }
        // Synchronous settings are per target, keep the async part only
        scntl3.set_scf(0);
        scntl3.set_ultra(false);
        SavedTiming {
            dmode: dmode.0,
            dcntl: regs.read8(p, Reg::Dcntl),
            ctest4: regs.read8(p, Reg::Ctest4),
            scntl3: scntl3.0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn chip(&self) -> &'static ChipInfo {
        self.chip
    }

    pub fn revision(&self) -> u8 {
        self.revision
    }

    pub fn irq(&self) -> u32 {
        self.irq
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn mapping(&self) -> MappingMode {
        self.regs.mode
    }

    pub fn saved_timing(&self) -> SavedTiming {
        self.saved
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn stats(&self) -> &HostStats {
        &self.stats
    }

    pub fn script(&self) -> &FixedScript {
        &self.script
    }

    pub fn sync(&self) -> &SyncTable {
        &self.sync
    }

    /// Times the SCRIPTS image was loaded and relocated. Resets reuse it.
    pub fn fixups(&self) -> u32 {
        self.fixups
    }

    pub fn inquiry(&self) -> &[InquiryReport] {
        &self.inquiry
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    /// Commands accepted and not completed yet
    pub fn outstanding(&self) -> usize {
        self.pool.active().len()
    }

    pub fn soft_queued(&self) -> usize {
        self.soft_queue.len()
    }

    /// Descriptors in the chip's issue queue, in order
    pub fn issue_queue(&self) -> Vec<BusAddr> {
        self.queues
            .walk(self.platform.memory(), self.queues.issue_head)
            .unwrap_or_default()
    }

    /// Descriptors waiting for reselection
    pub fn reconnect_queue(&self) -> Vec<BusAddr> {
        self.queues
            .walk(self.platform.memory(), self.queues.reconnect_head)
            .unwrap_or_default()
    }

    pub fn snapshot(&mut self) -> ChipSnapshot {
        let p = &mut self.platform;
        let r = &self.regs;
        ChipSnapshot {
            istat: r.read8(p, Reg::Istat),
            dstat: self.dstat.map(|d| d.0),
            dsp: r.read32(p, Reg::Dsp),
            dsps: r.read32(p, Reg::Dsps),
            dsa: r.read32(p, Reg::Dsa),
            dbc: r.read32(p, Reg::Dbc),
            dnad: r.read32(p, Reg::Dnad),
            temp: r.read32(p, Reg::Temp),
            sbcl: r.read8(p, Reg::Sbcl),
            sfbr: r.read8(p, Reg::Sfbr),
            scratcha: r.read32(p, Reg::ScratchA),
            scratchb: r.read32(p, Reg::ScratchB),
            scntl3: r.read8(p, Reg::Scntl3),
            sxfer: r.read8(p, Reg::Sxfer),
        }
    }

    /// Soft resets the chip and waits, bounded, for the reset to finish
    pub(super) fn reset_chip(&mut self, from_interrupt: bool) {
        if self.chip.transceiver {
            trace!("{}: stopping transceiver polling", self.name);
        }
        let p = &mut self.platform;
        self.regs.write8(p, Reg::Istat, ISTAT_SRST);
        let mut cleared = false;
        for _ in 0..SRST_POLLS {
            p.udelay(1);
            if self.regs.read8(p, Reg::Istat) & ISTAT_SRST == 0 {
                cleared = true;
                break;
            }
        }
        if !cleared {
            warn!(
                "{}: soft reset did not clear after {} polls{}",
                self.name,
                SRST_POLLS,
                if from_interrupt { " (interrupt)" } else { "" }
            );
            self.regs.write8(p, Reg::Istat, 0);
        }
        self.state = HostState::Idle;
        self.dstat = None;
    }

    /// Programs the chip from the saved configuration after a reset
    pub(super) fn program_chip(&mut self) {
        let p = &mut self.platform;
        let r = &self.regs;
        let id = self.config.host_id;
        r.write8(p, Reg::Scntl0, SCNTL0_ARB_FULL | SCNTL0_EPC);
        r.write8(p, Reg::Scntl1, 0);
        r.write8(p, Reg::Scid, SCID_RRE | id);
        r.write8(p, Reg::Respid, 1 << id);
        r.write8(p, Reg::Stime0, self.config.selection_timeout & 0x0F);
        r.write8(p, Reg::Dmode, self.saved.dmode);
        r.write8(p, Reg::Dcntl, self.saved.dcntl | DCNTL_COM);
        r.write8(p, Reg::Ctest4, self.saved.ctest4);
        r.write8(p, Reg::Scntl3, self.saved.scntl3);
        r.write8(p, Reg::Sxfer, 0);
        r.write8(p, Reg::Sien0, SIEN0_ENABLE);
        r.write8(p, Reg::Sien1, SIEN1_ENABLE);
        r.write8(p, Reg::Dien, DIEN_ENABLE);
        for t in 0..8 {
            if let Err(e) = self.sync.write_fragment(p.memory_mut(), &self.cells, t) {
                error!("{}: sync fragment for target {}: {}", self.name, t, e);
            }
        }
    }

    /// Starts SCRIPTS at `label`
    pub(super) fn start_at(&mut self, label: Label) {
        self.dsp = self.script.addr(label);
        self.state = HostState::Running;
        self.regs.write32(&mut self.platform, Reg::Dsp, self.dsp);
    }

    /// Resets and reprograms the chip with empty queues and restarts the
    /// scheduler. Commands the chip could see are lost, callers fail them
    /// first.
    pub fn adapter_init(&mut self, from_interrupt: bool) -> Result<(), DriverError> {
        debug_assert_eq!(self.fixups, 1);
        debug!("{}: initializing adapter", self.name);
        self.reset_chip(from_interrupt);
        self.queues.reset(self.platform.memory_mut())?;
        self.program_chip();
        self.start_at(Label::Schedule);
        Ok(())
    }

    /// Reinitializes from a recovery path. An adapter that cannot be
    /// brought back is disabled.
    pub(super) fn recover(&mut self, from_interrupt: bool) {
        if let Err(e) = self.adapter_init(from_interrupt) {
            error!("{}: reinitialization failed, disabling: {}", self.name, e);
            self.state = HostState::Idle;
            self.disabled = true;
            self.fail_all(HostStatus::Reset, true);
        }
    }

    /// Accepts a command. The completion callback runs exactly once for
    /// every accepted command.
    pub fn submit(&mut self, cmd: ScsiCommand) -> Result<(), SubmitError> {
        if self.disabled {
            return Err(SubmitError::Rejected(Box::new(cmd), DriverError::Disabled));
        }
        if let Err(e) = dsa::validate(&cmd, self.pool.max_segments(), self.config.host_id) {
            return Err(SubmitError::Rejected(Box::new(cmd), e));
        }
        let Some(id) = self.pool.alloc(self.platform.memory_mut()) else {
            debug!(
                "{}: no free descriptor, {} allocated",
                self.name,
                self.pool.allocated()
            );
            return Err(SubmitError::QueueFull(Box::new(cmd)));
        };

        let (target, lun) = (cmd.target, cmd.lun);
        trace!(
            "{}: submit #{} to {}:{} cdb {}",
            self.name,
            cmd.serial,
            target,
            lun,
            hex::encode(&cmd.cdb)
        );
        let d = self.pool.get_mut(id);
        d.target = target;
        d.lun = lun;
        d.cmd = Some(cmd);
        self.stats.queued += 1;

        if self.busy.is_busy(target, lun) {
            d.state = DsaState::SoftQueued;
            self.soft_queue.push_back(id);
            self.stats.soft_queued += 1;
            return Ok(());
        }
        self.busy.set(target, lun);
        self.issue(id);
        Ok(())
    }

    /// SDTR to send with the next command to `target`, if one is due
    fn sdtr_for(&mut self, target: u8) -> Option<[u8; 5]> {
        if self.sync.get(target).negotiation != Negotiation::Needed {
            return None;
        }
        self.sync.set_negotiation(target, Negotiation::InProgress);
        Some(sdtr_message(
            self.config.sync_period_factor.max(self.chip.min_period_factor),
            self.config.sync_offset.min(self.chip.max_sync_offset),
        ))
    }

    fn issue(&mut self, id: DsaId) {
        if let Err(e) = self.try_issue(id) {
            error!("{}: cannot issue command: {}", self.name, e);
            self.complete(id, CommandResult::host(HostStatus::Error));
        }
    }

    fn try_issue(&mut self, id: DsaId) -> Result<(), DriverError> {
        let target = self.pool.get(id).target;
        let sdtr = self.sdtr_for(target);
        let ctx = BuildContext {
            script: &self.script,
            cells: &self.cells,
            select_word: self.sync.select_word(target),
            disconnect: self.config.disconnect,
            sdtr,
        };
        let d = self.pool.get(id);
        let cmd = d
            .cmd
            .as_ref()
            .ok_or_else(|| DriverError::InvalidCommand("descriptor without command".to_string()))?;
        dsa::build(self.platform.memory_mut(), d, cmd, &ctx)?;

        let d = self.pool.get_mut(id);
        d.state = DsaState::Issued;
        d.sdtr_sent = sdtr.is_some();
        let base = d.base;
        let retries = self
            .queues
            .enqueue_issue(&mut self.platform, &self.regs, base)?;
        self.stats.enqueue_retries += u64::from(retries);
        Ok(())
    }

    /// Composite result from what the chip stored in the descriptor
    pub(super) fn result_of(&self, id: DsaId, status: u8, message: u8) -> CommandResult {
        let d = self.pool.get(id);
        let host = d.pending.unwrap_or(HostStatus::Ok);
        if d.sensing {
            let sense = dsa::read_sense(self.platform.memory(), d)
                .map_err(|e| error!("{}: reading sense: {}", self.name, e))
                .ok();
            return CommandResult {
                host,
                status: d.original_status,
                message,
                sense,
            };
        }
        CommandResult {
            host,
            status,
            message,
            sense: None,
        }
    }

    /// Returns a command to the mid-layer without restarting the software
    /// queue
    pub(super) fn finish(&mut self, id: DsaId, result: CommandResult) {
        let d = self.pool.get_mut(id);
        let Some(cmd) = d.cmd.take() else {
            warn!("{}: descriptor {:08X} completed twice", self.name, d.base);
            return;
        };
        let (target, lun, base, state) = (d.target, d.lun, d.base, d.state);
        let (bootstrap, sdtr_sent) = (d.bootstrap, d.sdtr_sent);

        if self.state != HostState::Running {
            if let Err(e) = self.queues.unlink_any(self.platform.memory_mut(), base) {
                error!("{}: unlinking {:08X}: {}", self.name, base, e);
            }
        }
        self.queues.forget(base);
        if sdtr_sent && self.sync.get(target).negotiation == Negotiation::InProgress {
            self.sync.set_negotiation(target, Negotiation::Needed);
        }
        if state == DsaState::SoftQueued {
            self.soft_queue.retain(|&s| s != id);
        }
        self.pool.release(id);

        if bootstrap {
            self.test_command_done(result);
            return;
        }
        if state != DsaState::SoftQueued {
            self.busy.clear(target, lun);
        }
        self.stats.completed += 1;
        debug!(
            "{}: #{} {}:{} done, {} status {:02X}{}",
            self.name,
            cmd.serial,
            target,
            lun,
            result.host,
            result.status,
            result
                .sense
                .map(|s| format!(", sense {}", hex::encode(s)))
                .unwrap_or_default()
        );
        (self.done)(cmd, result);
    }

    pub(super) fn complete(&mut self, id: DsaId, result: CommandResult) {
        self.finish(id, result);
        self.run_soft_queue();
    }

    /// Issues software-queued commands whose LUN became free
    pub(super) fn run_soft_queue(&mut self) {
        if self.disabled {
            return;
        }
        let mut i = 0;
        while i < self.soft_queue.len() {
            let id = self.soft_queue[i];
            let d = self.pool.get(id);
            let (target, lun) = (d.target, d.lun);
            if self.busy.is_busy(target, lun) {
                i += 1;
                continue;
            }
            self.soft_queue.remove(i);
            self.busy.set(target, lun);
            self.issue(id);
        }
    }

    /// Fails every command the chip could see, and the software queue too
    /// when `soft` is set
    pub(super) fn fail_all(&mut self, host: HostStatus, soft: bool) {
        let victims = self
            .pool
            .active()
            .into_iter()
            .filter(|&id| soft || self.pool.get(id).state != DsaState::SoftQueued)
            .collect_vec();
        if !victims.is_empty() {
            warn!(
                "{}: failing {} with {}",
                self.name,
                victims
                    .iter()
                    .filter_map(|&id| self.pool.get(id).cmd.as_ref())
                    .map(|c| format!("#{}", c.serial))
                    .join(", "),
                host
            );
        }
        for id in victims {
            self.finish(id, CommandResult::host(host));
        }
        if self.pool.get(self.bootstrap).is_active() {
            self.finish(self.bootstrap, CommandResult::host(host));
        }
    }

    /// Aborts the command with the given serial. Commands the chip owns are
    /// not aborted in flight.
    pub fn abort(&mut self, serial: u64) -> AbortOutcome {
        let Some(id) = self.pool.find_serial(serial) else {
            return AbortOutcome::NotFound;
        };
        let d = self.pool.get(id);
        match d.state {
            DsaState::Free => AbortOutcome::NotFound,
            DsaState::SoftQueued => {
                info!("{}: aborting queued command #{}", self.name, serial);
                self.stats.aborts += 1;
                self.complete(id, CommandResult::host(HostStatus::Aborted));
                AbortOutcome::Success
            }
            DsaState::Issued | DsaState::Disconnected => {
                let mem = self.platform.memory();
                let queued = [self.queues.issue_head, self.queues.reconnect_head]
                    .iter()
                    .any(|&h| self.queues.contains(mem, h, d.base).unwrap_or(true));
                let base = d.base;
                if queued || self.chip_holds(base) {
                    return AbortOutcome::Busy;
                }
                let d = self.pool.get(id);
                match d.read_result(self.platform.memory()) {
                    Ok(Some((status, message))) => {
                        // Finished without telling us
                        warn!(
                            "{}: command #{} to {}:{} completed without interrupt, reclaiming",
                            self.name, serial, d.target, d.lun
                        );
                        self.stats.lost_interrupts += 1;
                        let result = self.result_of(id, status, message);
                        self.complete(id, result);
                        AbortOutcome::Success
                    }
                    _ => AbortOutcome::Busy,
                }
            }
        }
    }

    /// Whether SCRIPTS still works on the descriptor at `base`: connected
    /// on its behalf, or anywhere but idle in WAIT RESELECT with DSA
    /// pointing at it. An interrupt stopped there resolves the command
    /// through DSA.
    fn chip_holds(&mut self, base: BusAddr) -> bool {
        if self.state == HostState::Idle {
            return false;
        }
        let p = &mut self.platform;
        if self.regs.read32(p, Reg::Dsa) != base {
            return false;
        }
        if Istat(self.regs.read8(p, Reg::Istat)).con() {
            return true;
        }
        // DSP is past the WAIT RESELECT while it waits
        self.regs.read32(p, Reg::Dsp) != self.script.addr(Label::WaitReselect) + 8
    }

    /// Resets the SCSI bus and the chip, failing every outstanding command
    pub fn bus_reset(&mut self) {
        warn!("{}: resetting SCSI bus", self.name);
        self.stats.resets += 1;
        let p = &mut self.platform;
        self.regs.write8(p, Reg::Scntl1, SCNTL1_RST);
        p.udelay(RESET_HOLD_US);
        self.regs.write8(p, Reg::Scntl1, 0);

        self.state = HostState::Idle;
        self.fail_all(HostStatus::Reset, true);
        self.sync.renegotiate_all();
        self.recover(false);
    }

    /// Mid-layer reset entry point
    pub fn reset(&mut self) -> bool {
        if self.disabled {
            return false;
        }
        self.bus_reset();
        true
    }

    fn release_memory(&mut self) {
        let mem = self.platform.memory_mut();
        self.pool.release_memory(mem);
        mem.free(self.image);
        mem.free(self.cells.base);
    }

    /// Stops the chip, fails what is left and hands the platform back
    pub fn detach(mut self) -> P {
        info!("{}: detaching", self.name);
        if !self.disabled {
            self.reset_chip(false);
        }
        self.fail_all(HostStatus::Reset, true);
        self.release_memory();
        self.platform
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_conversion() {
        assert_eq!(ccf_for_clock(20), 1);
        assert_eq!(ccf_for_clock(33), 2);
        assert_eq!(ccf_for_clock(40), 3);
        assert_eq!(ccf_for_clock(66), 4);
    }
}
