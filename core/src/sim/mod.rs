//! Simulated PCI machine: DMA memory, a 53c8xx and a SCSI bus with targets
//!
//! Stands in for real hardware behind the driver's [`Platform`] seam. Time
//! advances in chip clocks; every register access the driver makes goes
//! through the simulated register file with its side effects.

pub mod bus;
pub mod chip;
pub mod disk;
pub mod target;

use anyhow::{Context, Result};
use log::*;
use serde::{Deserialize, Serialize};

use self::bus::{ScsiBus, TargetBehaviour};
use self::chip::{DmaFault, FirmwareRegs, SimChip};
use self::disk::ScsiTargetDisk;
use crate::bus::Platform;
use crate::bus::arena::DmaArena;
use crate::ncr::host::ProbeInfo;
use crate::types::{BusAddr, Width};

/// Representation of X amount of ticks (chip clocks)
pub type Ticks = u64;

/// Chip clocks per microsecond of busy-waiting
pub const TICKS_PER_US: Ticks = 1;

pub trait Tickable {
    fn tick(&mut self, ticks: Ticks) -> Result<Ticks>;
}

/// A disk on the simulated bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub id: usize,
    /// Size in 512 byte blocks
    pub blocks: usize,
    #[serde(default)]
    pub behaviour: TargetBehaviour,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Bus address and size of DMA-capable memory
    pub memory_base: BusAddr,
    pub memory_size: usize,
    pub probe: ProbeInfo,
    pub firmware: FirmwareRegs,
    pub targets: Vec<TargetConfig>,
    /// Raise an illegal instruction along with selection timeouts
    pub sto_iid_race: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            memory_base: 0x0010_0000,
            memory_size: 1024 * 1024,
            probe: ProbeInfo {
                device: 0x0001,
                revision: 0x11,
                irq: 11,
                mmio_base: 0xFEBF_0000,
                io_base: 0xE800,
            },
            firmware: FirmwareRegs::default(),
            targets: vec![],
            sto_iid_race: false,
        }
    }
}

pub struct SimMachine {
    mem: DmaArena,
    chip: SimChip,
    bus: ScsiBus,
    probe: ProbeInfo,
    ticks: Ticks,
}

impl SimMachine {
    pub fn new(config: &MachineConfig) -> Result<Self> {
        let mut bus = ScsiBus::new();
        for t in &config.targets {
            bus.attach_target(t.id, Box::new(ScsiTargetDisk::new(t.blocks)), t.behaviour.clone())
                .with_context(|| format!("Cannot attach target {}", t.id))?;
        }
        Ok(Self {
            mem: DmaArena::new(config.memory_base, config.memory_size),
            chip: SimChip::new(
                config.probe.mmio_base,
                config.probe.io_base,
                config.firmware,
                config.sto_iid_race,
            ),
            bus,
            probe: config.probe,
            ticks: 0,
        })
    }

    /// What bus enumeration reports for the chip
    pub fn probe(&self) -> ProbeInfo {
        self.probe
    }

    pub fn chip(&self) -> &SimChip {
        &self.chip
    }

    pub fn scsi_bus(&self) -> &ScsiBus {
        &self.bus
    }

    pub fn scsi_bus_mut(&mut self) -> &mut ScsiBus {
        &mut self.bus
    }

    pub fn ticks(&self) -> Ticks {
        self.ticks
    }

    pub fn irq_pending(&self) -> bool {
        self.chip.irq()
    }

    /// Nothing left to happen without the host doing something
    pub fn is_idle(&self) -> bool {
        !self.chip.irq() && self.chip.is_idle() && !self.bus.is_busy()
    }

    /// One chip clock
    pub fn step(&mut self) -> Result<()> {
        self.chip.step(&mut self.mem, &mut self.bus)?;
        self.bus.tick();
        self.ticks += 1;
        Ok(())
    }

    /// Another initiator resets the SCSI bus
    pub fn inject_bus_reset(&mut self) {
        info!("Injecting SCSI bus reset");
        self.bus.reset();
        self.chip.scsi_reset_detected();
    }

    /// Fails the next SCRIPTS fetch with a host bus error
    pub fn inject_dma_fault(&mut self, fault: DmaFault) {
        self.chip.inject_fault(fault);
    }
}

impl Tickable for SimMachine {
    fn tick(&mut self, ticks: Ticks) -> Result<Ticks> {
        for _ in 0..ticks {
            self.step()?;
        }
        Ok(ticks)
    }
}

impl Platform for SimMachine {
    type Memory = DmaArena;

    fn memory(&self) -> &DmaArena {
        &self.mem
    }

    fn memory_mut(&mut self) -> &mut DmaArena {
        &mut self.mem
    }

    fn mmio_read(&mut self, addr: BusAddr, width: Width) -> u32 {
        match self.chip.mmio_offset(addr) {
            Some(off) => self.chip.host_read(off, width, &self.bus),
            None => {
                warn!("Unmapped {} read at {:08X}", width, addr);
                u32::MAX
            }
        }
    }

    fn mmio_write(&mut self, addr: BusAddr, width: Width, val: u32) {
        match self.chip.mmio_offset(addr) {
            Some(off) => self.chip.host_write(off, width, val, &mut self.bus),
            None => warn!("Unmapped {} write at {:08X}: {:08X}", width, addr, val),
        }
    }

    fn port_read(&mut self, port: u16, width: Width) -> u32 {
        match self.chip.io_offset(port) {
            Some(off) => self.chip.host_read(off, width, &self.bus),
            None => {
                warn!("Unmapped {} read at port {:04X}", width, port);
                u32::MAX
            }
        }
    }

    fn port_write(&mut self, port: u16, width: Width, val: u32) {
        match self.chip.io_offset(port) {
            Some(off) => self.chip.host_write(off, width, val, &mut self.bus),
            None => warn!("Unmapped {} write at port {:04X}: {:08X}", width, port, val),
        }
    }

    fn udelay(&mut self, usecs: u32) {
        if let Err(e) = self.tick(Ticks::from(usecs) * TICKS_PER_US) {
            error!("Simulation error: {:?}", e);
        }
    }
}
