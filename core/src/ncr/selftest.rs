//! Attach-time self tests: memory move loopback, register round trip and
//! an INQUIRY to every target through the bootstrap descriptor

use log::*;
use serde::Serialize;

use super::command::{CommandResult, HostStatus, ScsiCommand, SgSegment};
use super::dsa::{self, BuildContext, DsaState};
use super::error::DriverError;
use super::host::{HostAdapter, HostState};
use super::regs::{Reg, STATUS_GOOD};
use super::scripts::{AbsSymbol, IntCode, Label};
use crate::bus::{DmaMemory, Platform};

/// Polls of the interrupt status before a test counts as hung
const SELFTEST_POLLS: usize = 5000;
const POLL_DELAY_US: u32 = 10;
const INQUIRY_LEN: usize = 36;

const MEMORY_PATTERN: u32 = 0x5AA5_C33C;
const REGISTER_PATTERN: u32 = 0x1234_5678;

#[derive(Debug, Default)]
pub struct TestProgress {
    pub finished: bool,
    /// Test marker interrupt seen
    pub code: Option<IntCode>,
    /// Result of the bootstrap descriptor's command
    pub result: Option<CommandResult>,
}

/// A target that answered INQUIRY
#[derive(Debug, Clone, Serialize)]
pub struct InquiryReport {
    pub target: u8,
    pub peripheral_type: u8,
    pub vendor: String,
    pub product: String,
    pub revision: String,
}

impl InquiryReport {
    fn parse(target: u8, data: &[u8; INQUIRY_LEN]) -> Self {
        let text = |r: std::ops::Range<usize>| String::from_utf8_lossy(&data[r]).trim_end().to_string();
        Self {
            target,
            peripheral_type: data[0] & 0x1F,
            vendor: text(8..16),
            product: text(16..32),
            revision: text(32..36),
        }
    }
}

impl<P: Platform> HostAdapter<P> {
    /// Bootstrap descriptor finished, or was failed
    pub(super) fn test_command_done(&mut self, result: CommandResult) {
        self.test.result = Some(result);
        self.test.finished = true;
    }

    fn run_test(&mut self, entry: Label) -> Result<(), String> {
        self.test = TestProgress::default();
        self.start_at(entry);
        for _ in 0..SELFTEST_POLLS {
            self.platform.udelay(POLL_DELAY_US);
            self.poll();
            if self.test.finished {
                if self.state == HostState::Running {
                    // Completed on the fly, SCRIPTS went on to the scheduler
                    self.reset_chip(false);
                    self.program_chip();
                }
                return Ok(());
            }
        }
        let snapshot = self.snapshot();
        error!("{}: self test hung: {:?}", self.name(), snapshot);
        self.reset_chip(false);
        self.program_chip();
        Err("no interrupt".to_string())
    }

    fn fail(test: u8, reason: impl Into<String>) -> DriverError {
        DriverError::SelfTest {
            test,
            reason: reason.into(),
        }
    }

    /// Memory to memory move between two driver cells
    fn memory_test(&mut self) -> Result<(), DriverError> {
        let src = self.cells.abs_addr(AbsSymbol::TestSrc);
        let dst = self.cells.abs_addr(AbsSymbol::TestDst);
        let mem = self.platform.memory_mut();
        mem.write_u32(src, MEMORY_PATTERN)?;
        mem.write_u32(dst, 0)?;

        self.run_test(Label::Test1).map_err(|e| Self::fail(1, e))?;
        if self.test.code != Some(IntCode::Test1) {
            return Err(Self::fail(1, format!("interrupt {:?}", self.test.code)));
        }
        // Memory move, then INT
        let expected_dsp = self.script.addr(Label::Test1) + 12 + 8;
        if self.dsp != expected_dsp {
            return Err(Self::fail(
                1,
                format!("stopped at {:08X}, expected {:08X}", self.dsp, expected_dsp),
            ));
        }
        let got = self.platform.memory().read_u32(dst)?;
        if got != MEMORY_PATTERN {
            return Err(Self::fail(1, format!("copied {:08X}", got)));
        }
        debug!("{}: memory move test passed", self.name());
        Ok(())
    }

    /// Moves through SCRATCHA and SCRATCHB and back to memory, checks the
    /// DMODE fixups for every direction
    fn register_test(&mut self) -> Result<(), DriverError> {
        let src = self.cells.abs_addr(AbsSymbol::TestSrc);
        let dst = self.cells.abs_addr(AbsSymbol::TestDst);
        let mem = self.platform.memory_mut();
        mem.write_u32(src, REGISTER_PATTERN)?;
        mem.write_u32(dst, 0)?;

        self.run_test(Label::Test3).map_err(|e| Self::fail(3, e))?;
        if self.test.code != Some(IntCode::Test3) {
            return Err(Self::fail(3, format!("interrupt {:?}", self.test.code)));
        }
        let got = self.platform.memory().read_u32(dst)?;
        let scratchb = self.regs.read32(&mut self.platform, Reg::ScratchB);
        if got != REGISTER_PATTERN || scratchb != REGISTER_PATTERN {
            return Err(Self::fail(
                3,
                format!("memory {:08X}, SCRATCHB {:08X}", got, scratchb),
            ));
        }
        debug!("{}: register move test passed", self.name());
        Ok(())
    }

    /// INQUIRY to one target through the bootstrap descriptor
    fn inquiry_target(&mut self, target: u8) -> Result<Option<InquiryReport>, DriverError> {
        let mut cmd =
            ScsiCommand::new(0, target, 0, &[0x12, 0, 0, 0, INQUIRY_LEN as u8, 0], vec![])?;
        let Some(buf) = self.platform.memory_mut().alloc(INQUIRY_LEN, 8) else {
            return Err(DriverError::ResourceExhausted("INQUIRY buffer"));
        };
        cmd.sg.push(SgSegment {
            addr: buf,
            len: INQUIRY_LEN as u32,
        });
        let result = self.run_inquiry(cmd);
        let mut data = [0; INQUIRY_LEN];
        let read = self.platform.memory().read_bytes(buf, &mut data);
        self.platform.memory_mut().free(buf);
        let result = result?;
        read?;

        match result {
            Some(r) if r.host == HostStatus::Ok && r.status == STATUS_GOOD => {
                Ok(Some(InquiryReport::parse(target, &data)))
            }
            Some(r) if r.host == HostStatus::BadTarget => Ok(None),
            Some(r) => {
                warn!(
                    "{}: INQUIRY to target {}: {} status {:02X}",
                    self.name(),
                    target,
                    r.host,
                    r.status
                );
                Ok(None)
            }
            None => Err(Self::fail(2, format!("target {} gave no result", target))),
        }
    }

    fn run_inquiry(&mut self, cmd: ScsiCommand) -> Result<Option<CommandResult>, DriverError> {
        let target = cmd.target;
        let id = self.bootstrap;
        let ctx = BuildContext {
            script: &self.script,
            cells: &self.cells,
            select_word: self.sync.select_word(target),
            disconnect: false,
            sdtr: None,
        };
        {
            let d = self.pool.get_mut(id);
            d.target = target;
            d.lun = cmd.lun;
            d.sensing = false;
            d.pending = None;
            d.sdtr_sent = false;
        }
        let d = self.pool.get(id);
        dsa::build(self.platform.memory_mut(), d, &cmd, &ctx)?;
        let base = d.base;
        self.platform
            .memory_mut()
            .write_u32(self.cells.abs_addr(AbsSymbol::TestSrc), base)?;
        let d = self.pool.get_mut(id);
        d.cmd = Some(cmd);
        d.state = DsaState::Issued;

        if let Err(e) = self.run_test(Label::Test2) {
            self.fail_all(HostStatus::Timeout, false);
            return Err(Self::fail(2, e));
        }
        Ok(self.test.result.take())
    }

    /// Runs the configured tests with the scheduler stopped. The chip is
    /// left halted.
    pub(super) fn run_selftests(&mut self) -> Result<(), DriverError> {
        if self.config.selftest_memory {
            self.memory_test()?;
            self.register_test()?;
        }
        if self.config.selftest_inquiry {
            let mut found = vec![];
            let host_id = self.config.host_id;
            for target in (0..8).filter(|&t| t != host_id) {
                if let Some(report) = self.inquiry_target(target)? {
                    info!(
                        "{}: target {}: {} {} {}, type {:02X}",
                        self.name(),
                        target,
                        report.vendor,
                        report.product,
                        report.revision,
                        report.peripheral_type
                    );
                    found.push(report);
                }
            }
            self.inquiry = found;
        }
        self.state = HostState::Idle;
        Ok(())
    }
}
