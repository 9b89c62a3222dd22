//! Scenario runner: attaches the driver to a simulated machine, runs a
//! command workload against it and checks the outcome

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use log::*;
use serde::{Deserialize, Serialize};

use ncr_core::bus::{DmaMemory, Platform};
use ncr_core::ncr::command::{CommandResult, HostStatus, ScsiCommand, SgSegment};
use ncr_core::ncr::config::HostConfig;
use ncr_core::ncr::error::SubmitError;
use ncr_core::ncr::host::{HostAdapter, HostStats};
use ncr_core::ncr::selftest::InquiryReport;
use ncr_core::sim::chip::ChipStats;
use ncr_core::sim::disk::DISK_BLOCKSIZE;
use ncr_core::sim::{MachineConfig, SimMachine, Tickable, Ticks};
use ncr_core::types::BusAddr;

/// Chip clocks between interrupt line checks
const STEP: Ticks = 64;

#[derive(Serialize, Deserialize, Debug)]
pub enum TestResult {
    Pass,
    Failed(TestFailure),
}

#[derive(Serialize, Deserialize, Debug)]
pub enum TestFailure {
    ExitCode(i32),
    /// Killed without an exit code
    Signal,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct TestReportTest {
    pub name: String,
    pub scenario: String,
    pub result: TestResult,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct TestReport {
    pub tests: Vec<TestReportTest>,
}

const fn one() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    TestUnitReady {
        target: u8,
    },
    Inquiry {
        target: u8,
    },
    ReadCapacity {
        target: u8,
    },
    /// Writes a pattern derived from `seed`
    Write {
        target: u8,
        lba: u32,
        blocks: u16,
        #[serde(default = "one")]
        segments: usize,
        #[serde(default)]
        seed: u8,
    },
    /// Reads and compares against everything written before
    Read {
        target: u8,
        lba: u32,
        blocks: u16,
        #[serde(default = "one")]
        segments: usize,
    },
}

impl Op {
    pub const fn target(&self) -> u8 {
        match *self {
            Self::TestUnitReady { target }
            | Self::Inquiry { target }
            | Self::ReadCapacity { target }
            | Self::Write { target, .. }
            | Self::Read { target, .. } => target,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct Expect {
    pub host: HostStatus,
    pub status: u8,
}

impl Default for Expect {
    fn default() -> Self {
        Self {
            host: HostStatus::Ok,
            status: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    #[serde(flatten)]
    pub op: Op,
    #[serde(default)]
    pub expect: Expect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub machine: MachineConfig,
    /// Driver option string, see [`HostConfig`]
    #[serde(default)]
    pub options: String,
    pub steps: Vec<Step>,
    /// Chip clocks the whole workload may take
    #[serde(default = "Scenario::default_budget")]
    pub budget: Ticks,
}

impl Scenario {
    const fn default_budget() -> Ticks {
        50_000_000
    }
}

#[derive(Debug, Serialize)]
pub struct CommandReport {
    pub serial: u64,
    pub target: u8,
    pub opcode: u8,
    pub result: CommandResult,
}

#[derive(Debug, Serialize)]
pub struct ScenarioReport {
    pub adapter: String,
    pub chip: &'static str,
    pub ticks: Ticks,
    pub commands: Vec<CommandReport>,
    pub failures: Vec<String>,
    pub host_stats: HostStats,
    pub chip_stats: ChipStats,
    pub inquiry: Vec<InquiryReport>,
}

impl ScenarioReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A command ready for submission with what it should produce
struct Prepared {
    cmd: ScsiCommand,
    expect: Expect,
    /// Data a read must return
    data: Option<Vec<u8>>,
}

type Completions = Arc<Mutex<Vec<(ScsiCommand, CommandResult)>>>;

fn cdb10(opcode: u8, lba: u32, blocks: u16) -> [u8; 10] {
    let l = lba.to_be_bytes();
    let b = blocks.to_be_bytes();
    [opcode, 0, l[0], l[1], l[2], l[3], 0, b[0], b[1], 0]
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed) ^ (i >> 8) as u8)
        .collect()
}

/// Splits `data` over `segments` separately allocated buffers
fn scatter(host: &mut HostAdapter<SimMachine>, data: &[u8], segments: usize) -> Result<Vec<SgSegment>> {
    let segments = segments.clamp(1, data.len().max(1));
    let chunk = data.len().div_ceil(segments);
    let mem = host.platform_mut().memory_mut();
    data.chunks(chunk)
        .map(|c| -> Result<SgSegment> {
            let addr = mem
                .alloc(c.len(), 8)
                .ok_or_else(|| anyhow!("out of DMA memory for a {} byte buffer", c.len()))?;
            mem.write_bytes(addr, c)?;
            Ok(SgSegment {
                addr,
                len: c.len() as u32,
            })
        })
        .collect()
}

fn gather(host: &HostAdapter<SimMachine>, sg: &[SgSegment]) -> Result<Vec<u8>> {
    let mut out = vec![];
    for s in sg {
        let mut buf = vec![0; s.len as usize];
        host.platform().memory().read_bytes(s.addr, &mut buf)?;
        out.extend(buf);
    }
    Ok(out)
}

/// Shadow copies of the simulated disks, tracking what reads should see
struct Shadow {
    disks: BTreeMap<u8, Vec<u8>>,
}

impl Shadow {
    fn new(machine: &MachineConfig) -> Self {
        Self {
            disks: machine
                .targets
                .iter()
                .map(|t| (t.id as u8, vec![0; t.blocks * DISK_BLOCKSIZE]))
                .collect(),
        }
    }

    fn range(&mut self, target: u8, lba: u32, blocks: u16) -> Option<&mut [u8]> {
        let start = lba as usize * DISK_BLOCKSIZE;
        let end = start + usize::from(blocks) * DISK_BLOCKSIZE;
        self.disks.get_mut(&target)?.get_mut(start..end)
    }
}

fn prepare(
    host: &mut HostAdapter<SimMachine>,
    shadow: &mut Shadow,
    serial: u64,
    step: &Step,
) -> Result<Prepared> {
    let good = step.expect.host == HostStatus::Ok && step.expect.status == 0;
    let (cdb, sg, data) = match step.op {
        Op::TestUnitReady { .. } => (vec![0x00, 0, 0, 0, 0, 0], vec![], None),
        Op::Inquiry { .. } => (
            vec![0x12, 0, 0, 0, 36, 0],
            scatter(host, &[0; 36], 1)?,
            None,
        ),
        Op::ReadCapacity { .. } => (
            cdb10(0x25, 0, 0).to_vec(),
            scatter(host, &[0; 8], 1)?,
            None,
        ),
        Op::Write {
            target,
            lba,
            blocks,
            segments,
            seed,
        } => {
            let data = pattern(usize::from(blocks) * DISK_BLOCKSIZE, seed);
            if good {
                let r = shadow
                    .range(target, lba, blocks)
                    .with_context(|| format!("write to {}:{} beyond the disk", target, lba))?;
                r.copy_from_slice(&data);
            }
            let sg = scatter(host, &data, segments)?;
            (cdb10(0x2A, lba, blocks).to_vec(), sg, None)
        }
        Op::Read {
            target,
            lba,
            blocks,
            segments,
        } => {
            let len = usize::from(blocks) * DISK_BLOCKSIZE;
            let expected = if good {
                Some(
                    shadow
                        .range(target, lba, blocks)
                        .with_context(|| format!("read from {}:{} beyond the disk", target, lba))?
                        .to_vec(),
                )
            } else {
                None
            };
            let sg = scatter(host, &vec![0; len], segments)?;
            (cdb10(0x28, lba, blocks).to_vec(), sg, expected)
        }
    };
    Ok(Prepared {
        cmd: ScsiCommand::new(serial, step.op.target(), 0, &cdb, sg)?,
        expect: step.expect,
        data,
    })
}

/// Runs a scenario to completion
pub fn run_scenario(scenario: &Scenario, options: Option<&str>) -> Result<ScenarioReport> {
    let config: HostConfig = options
        .unwrap_or(&scenario.options)
        .parse()
        .context("Invalid driver options")?;
    let sim = SimMachine::new(&scenario.machine)?;
    let probe = sim.probe();

    let done = Completions::default();
    let sink = Arc::clone(&done);
    let mut host = HostAdapter::attach(
        "scsi0",
        sim,
        probe,
        config,
        Box::new(move |cmd: ScsiCommand, result: CommandResult| {
            if let Ok(mut d) = sink.lock() {
                d.push((cmd, result));
            }
        }),
    )
    .map_err(|e| anyhow!("Attach failed: {}", e.error))?;
    info!(
        "{}: {} attached, running {} steps",
        host.name(),
        host.chip().name,
        scenario.steps.len()
    );

    let mut shadow = Shadow::new(&scenario.machine);
    let mut queue = VecDeque::new();
    for (i, step) in scenario.steps.iter().enumerate() {
        queue.push_back(prepare(&mut host, &mut shadow, i as u64 + 1, step)?);
    }

    let mut failures = vec![];
    let mut inflight = BTreeMap::new();
    let start = host.platform().ticks();
    loop {
        while let Some(p) = queue.pop_front() {
            let Prepared { cmd, expect, data } = p;
            let serial = cmd.serial;
            match host.submit(cmd) {
                Ok(()) => {
                    inflight.insert(serial, (expect, data));
                }
                Err(SubmitError::QueueFull(cmd)) => {
                    trace!("Queue full, holding #{}", serial);
                    queue.push_front(Prepared {
                        cmd: *cmd,
                        expect,
                        data,
                    });
                    break;
                }
                Err(e @ SubmitError::Rejected(..)) => {
                    failures.push(format!("#{}: {}", serial, e));
                }
            }
        }

        if queue.is_empty() && host.outstanding() == 0 && host.platform().is_idle() {
            break;
        }
        if host.platform().ticks() - start > scenario.budget {
            failures.push(format!(
                "Gave up after {} clocks with {} commands outstanding and {} not submitted",
                scenario.budget,
                host.outstanding(),
                queue.len()
            ));
            break;
        }
        host.platform_mut().tick(STEP)?;
        if host.platform().irq_pending() {
            host.interrupt();
        }
    }
    let ticks = host.platform().ticks() - start;

    let completed = std::mem::take(&mut *done.lock().map_err(|_| anyhow!("Completion lock poisoned"))?);
    let mut commands = vec![];
    for (cmd, result) in completed {
        let Some((expect, data)) = inflight.remove(&cmd.serial) else {
            failures.push(format!("#{} completed but was never accepted", cmd.serial));
            continue;
        };
        if result.host != expect.host || result.status != expect.status {
            failures.push(format!(
                "#{} to target {}: expected {} status {:02X}, got {} status {:02X}",
                cmd.serial, cmd.target, expect.host, expect.status, result.host, result.status
            ));
        } else if let Some(want) = data {
            if gather(&host, &cmd.sg)? != want {
                failures.push(format!("#{}: read data mismatch", cmd.serial));
            }
        }
        for s in &cmd.sg {
            host.platform_mut().memory_mut().free(s.addr);
        }
        commands.push(CommandReport {
            serial: cmd.serial,
            target: cmd.target,
            opcode: cmd.opcode(),
            result,
        });
    }
    for serial in inflight.keys() {
        failures.push(format!("#{} never completed", serial));
    }
    Ok(ScenarioReport {
        adapter: host.name().to_string(),
        chip: host.chip().name,
        ticks,
        commands,
        failures,
        host_stats: host.stats().clone(),
        chip_stats: host.platform().chip().stats().clone(),
        inquiry: host.inquiry().to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario(json: &str) -> Scenario {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn write_read_workload_passes() {
        let s = scenario(
            r#"{
                "machine": { "targets": [ { "id": 0, "blocks": 32 }, { "id": 2, "blocks": 32 } ] },
                "steps": [
                    { "op": "write", "target": 0, "lba": 1, "blocks": 2, "segments": 3, "seed": 9 },
                    { "op": "write", "target": 2, "lba": 0, "blocks": 1, "seed": 4 },
                    { "op": "read", "target": 0, "lba": 1, "blocks": 2 },
                    { "op": "read", "target": 2, "lba": 0, "blocks": 1, "segments": 2 },
                    { "op": "test_unit_ready", "target": 0 }
                ]
            }"#,
        );
        let report = run_scenario(&s, None).unwrap();
        assert!(report.passed(), "{:?}", report.failures);
        assert_eq!(report.commands.len(), 5);
        assert_eq!(report.host_stats.completed, 5);
    }

    #[test]
    fn expected_failures_pass() {
        let s = scenario(
            r#"{
                "machine": { "targets": [ { "id": 0, "blocks": 8 } ] },
                "steps": [
                    { "op": "test_unit_ready", "target": 4, "expect": { "host": "BadTarget" } },
                    { "op": "read", "target": 0, "lba": 100, "blocks": 1, "expect": { "status": 2 } }
                ]
            }"#,
        );
        let report = run_scenario(&s, Some("nosync")).unwrap();
        assert!(report.passed(), "{:?}", report.failures);
    }

    #[test]
    fn wrong_expectation_reported() {
        let s = scenario(
            r#"{
                "steps": [ { "op": "test_unit_ready", "target": 1 } ]
            }"#,
        );
        let report = run_scenario(&s, None).unwrap();
        assert!(!report.passed());
        assert_eq!(report.commands[0].result.host, HostStatus::BadTarget);
    }

    #[test]
    fn queue_full_is_retried() {
        let s = scenario(
            r#"{
                "machine": { "targets": [ { "id": 0, "blocks": 8 }, { "id": 1, "blocks": 8 }, { "id": 3, "blocks": 8 } ] },
                "options": "can_queue=1",
                "steps": [
                    { "op": "test_unit_ready", "target": 0 },
                    { "op": "test_unit_ready", "target": 1 },
                    { "op": "test_unit_ready", "target": 3 }
                ]
            }"#,
        );
        let report = run_scenario(&s, None).unwrap();
        assert!(report.passed(), "{:?}", report.failures);
        assert_eq!(report.commands.len(), 3);
    }

    #[test]
    fn bad_options_rejected() {
        let s = scenario(r#"{ "steps": [] }"#);
        assert!(run_scenario(&s, Some("bogus")).is_err());
    }
}
