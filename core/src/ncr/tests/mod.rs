//! Driver scenarios against the simulated machine

mod io;
mod recovery;
mod registry;

use std::sync::{Arc, Mutex};

use super::command::{CommandResult, CompletionFn, ScsiCommand, SgSegment};
use super::config::HostConfig;
use super::error::SubmitError;
use super::host::{AttachError, HostAdapter};
use crate::bus::{DmaMemory, Platform};
use crate::sim::bus::TargetBehaviour;
use crate::sim::target::ScsiTarget;
use crate::sim::{MachineConfig, SimMachine, TargetConfig, Tickable, Ticks};
use crate::types::BusAddr;

/// Chip clocks per harness step
const STEP: Ticks = 64;
/// Upper bound for any scenario to settle
const BUDGET: Ticks = 400_000;

pub const BLOCK: usize = 512;

pub type Done = Arc<Mutex<Vec<(ScsiCommand, CommandResult)>>>;

pub fn recorder() -> (Done, CompletionFn) {
    let done = Done::default();
    let sink = Arc::clone(&done);
    (
        done,
        Box::new(move |cmd: ScsiCommand, result: CommandResult| {
            sink.lock().unwrap().push((cmd, result));
        }),
    )
}

pub fn disk(id: usize) -> TargetConfig {
    TargetConfig {
        id,
        blocks: 64,
        behaviour: TargetBehaviour::default(),
    }
}

pub fn disk_with(id: usize, behaviour: TargetBehaviour) -> TargetConfig {
    TargetConfig {
        behaviour,
        ..disk(id)
    }
}

pub fn machine(targets: Vec<TargetConfig>) -> MachineConfig {
    MachineConfig {
        targets,
        ..Default::default()
    }
}

pub fn test_unit_ready() -> [u8; 6] {
    [0x00, 0, 0, 0, 0, 0]
}

pub fn read10(lba: u32, blocks: u16) -> [u8; 10] {
    let l = lba.to_be_bytes();
    let b = blocks.to_be_bytes();
    [0x28, 0, l[0], l[1], l[2], l[3], 0, b[0], b[1], 0]
}

pub fn write10(lba: u32, blocks: u16) -> [u8; 10] {
    let mut cdb = read10(lba, blocks);
    cdb[0] = 0x2A;
    cdb
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

pub struct Rig {
    pub host: HostAdapter<SimMachine>,
    pub done: Done,
    serial: u64,
}

impl Rig {
    pub fn try_new(machine: MachineConfig, config: HostConfig) -> Result<Self, AttachError<SimMachine>> {
        let sim = SimMachine::new(&machine).unwrap();
        let probe = sim.probe();
        let (done, callback) = recorder();
        let host = HostAdapter::attach("scsi0", sim, probe, config, callback)?;
        Ok(Self {
            host,
            done,
            serial: 0,
        })
    }

    pub fn new(machine: MachineConfig, config: HostConfig) -> Self {
        Self::try_new(machine, config).unwrap()
    }

    pub fn with_targets(targets: Vec<TargetConfig>) -> Self {
        Self::new(machine(targets), HostConfig::default())
    }

    /// DMA buffer holding `data`
    pub fn buffer(&mut self, data: &[u8]) -> BusAddr {
        let mem = self.host.platform_mut().memory_mut();
        let addr = mem.alloc(data.len(), 8).unwrap();
        mem.write_bytes(addr, data).unwrap();
        addr
    }

    pub fn read(&self, addr: BusAddr, len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        self.host.platform().memory().read_bytes(addr, &mut buf).unwrap();
        buf
    }

    pub fn command(&mut self, target: u8, cdb: &[u8], sg: Vec<SgSegment>) -> ScsiCommand {
        self.serial += 1;
        ScsiCommand::new(self.serial, target, 0, cdb, sg).unwrap()
    }

    pub fn try_submit(&mut self, target: u8, cdb: &[u8], sg: Vec<SgSegment>) -> Result<u64, SubmitError> {
        let cmd = self.command(target, cdb, sg);
        let serial = cmd.serial;
        self.host.submit(cmd)?;
        Ok(serial)
    }

    pub fn submit(&mut self, target: u8, cdb: &[u8], sg: Vec<SgSegment>) -> u64 {
        self.try_submit(target, cdb, sg).unwrap()
    }

    /// Advances the machine without servicing interrupts
    pub fn tick(&mut self, ticks: Ticks) {
        self.host.platform_mut().tick(ticks).unwrap();
    }

    /// Advances the machine and services a raised interrupt line
    pub fn step(&mut self) {
        self.tick(STEP);
        if self.host.platform().irq_pending() {
            self.host.interrupt();
        }
    }

    pub fn run_until(&mut self, what: &str, cond: impl Fn(&Self) -> bool) {
        let start = self.host.platform().ticks();
        while !cond(self) {
            assert!(
                self.host.platform().ticks() - start < BUDGET,
                "gave up waiting for {}",
                what
            );
            self.step();
        }
    }

    /// Advances one clock at a time, without servicing interrupts
    pub fn tick_until(&mut self, what: &str, cond: impl Fn(&Self) -> bool) {
        let start = self.host.platform().ticks();
        while !cond(self) {
            assert!(
                self.host.platform().ticks() - start < BUDGET,
                "gave up waiting for {}",
                what
            );
            self.tick(1);
        }
    }

    /// Runs until every accepted command completed and the machine is quiet
    pub fn settle(&mut self) {
        self.run_until("commands to complete", |r| {
            r.host.outstanding() == 0 && r.host.platform().is_idle()
        });
    }

    pub fn completions(&self, serial: u64) -> usize {
        self.done
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c.serial == serial)
            .count()
    }

    /// Result of a command that completed exactly once
    pub fn result(&self, serial: u64) -> CommandResult {
        let done = self.done.lock().unwrap();
        let mut found = done.iter().filter(|(c, _)| c.serial == serial);
        let (_, result) = found
            .next()
            .unwrap_or_else(|| panic!("#{} never completed", serial));
        assert!(found.next().is_none(), "#{} completed twice", serial);
        result.clone()
    }

    /// Serials in completion order
    pub fn order(&self) -> Vec<u64> {
        self.done.lock().unwrap().iter().map(|(c, _)| c.serial).collect()
    }

    /// Writes blocks straight into a simulated disk
    pub fn preload(&mut self, target: usize, lba: usize, data: &[u8]) {
        self.host
            .platform_mut()
            .scsi_bus_mut()
            .device_mut(target)
            .unwrap()
            .write(lba, data);
    }

    pub fn disk_contents(&self, target: usize, lba: usize, blocks: usize) -> Vec<u8> {
        self.host
            .platform()
            .scsi_bus()
            .device(target)
            .unwrap()
            .read(lba, blocks)
    }
}
