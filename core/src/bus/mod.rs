//! Host-side access to the chip: register window and DMA-visible memory

pub mod arena;
pub mod testbus;

use std::sync::atomic::{Ordering, fence};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ncr::regs::Reg;
use crate::types::{BusAddr, Width};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    #[error("DMA access out of range: {len} bytes at {addr:08X}")]
    OutOfRange { addr: BusAddr, len: usize },
}

pub type MemoryResult<T> = Result<T, MemoryError>;

/// Memory shared between the host and the SCRIPTS processor.
///
/// Everything the chip fetches or transfers lives here: the SCRIPTS image,
/// command descriptors and the data buffers of the commands themselves.
/// Multi-byte values are little-endian, as on the PCI bus.
pub trait DmaMemory {
    fn read_bytes(&self, addr: BusAddr, buf: &mut [u8]) -> MemoryResult<()>;
    fn write_bytes(&mut self, addr: BusAddr, data: &[u8]) -> MemoryResult<()>;

    /// Allocates a DMA-safe block, returns None when exhausted
    fn alloc(&mut self, len: usize, align: usize) -> Option<BusAddr>;
    fn free(&mut self, addr: BusAddr);

    fn read_u8(&self, addr: BusAddr) -> MemoryResult<u8> {
        let mut b = [0; 1];
        self.read_bytes(addr, &mut b)?;
        Ok(b[0])
    }

    fn read_u32(&self, addr: BusAddr) -> MemoryResult<u32> {
        let mut b = [0; 4];
        self.read_bytes(addr, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    fn write_u8(&mut self, addr: BusAddr, val: u8) -> MemoryResult<()> {
        self.write_bytes(addr, &[val])
    }

    fn write_u32(&mut self, addr: BusAddr, val: u32) -> MemoryResult<()> {
        self.write_bytes(addr, &val.to_le_bytes())
    }

    fn fill(&mut self, addr: BusAddr, len: usize, val: u8) -> MemoryResult<()> {
        self.write_bytes(addr, &vec![val; len])
    }
}

/// Everything the driver needs from the machine it runs on.
pub trait Platform {
    type Memory: DmaMemory;

    fn memory(&self) -> &Self::Memory;
    fn memory_mut(&mut self) -> &mut Self::Memory;

    fn mmio_read(&mut self, addr: BusAddr, width: Width) -> u32;
    fn mmio_write(&mut self, addr: BusAddr, width: Width, val: u32);
    fn port_read(&mut self, port: u16, width: Width) -> u32;
    fn port_write(&mut self, port: u16, width: Width, val: u32);

    /// Busy-waits for the given amount of microseconds
    fn udelay(&mut self, usecs: u32);

    /// Orders DMA memory stores and register accesses on either side
    fn barrier(&mut self) {
        fence(Ordering::SeqCst);
    }
}

/// How the host reaches the chip's register file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum MappingMode {
    Memory,
    Port,
}

/// The chip's register file as mapped into the host, in either memory or
/// port space. Every write sits between two full barriers: memory the chip
/// reads after a doorbell is stored before it, and writes are observed in
/// program order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RegisterWindow {
    pub mode: MappingMode,
    pub mmio_base: BusAddr,
    pub io_base: u16,
}

impl RegisterWindow {
    pub fn read<P: Platform>(&self, p: &mut P, reg: Reg, width: Width) -> u32 {
        let off = reg.offset();
        match self.mode {
            MappingMode::Memory => p.mmio_read(self.mmio_base + BusAddr::from(off), width),
            MappingMode::Port => p.port_read(self.io_base + u16::from(off), width),
        }
    }

    pub fn write<P: Platform>(&self, p: &mut P, reg: Reg, width: Width, val: u32) {
        let off = reg.offset();
        p.barrier();
        match self.mode {
            MappingMode::Memory => p.mmio_write(self.mmio_base + BusAddr::from(off), width, val),
            MappingMode::Port => p.port_write(self.io_base + u16::from(off), width, val),
        }
        p.barrier();
    }

    pub fn read8<P: Platform>(&self, p: &mut P, reg: Reg) -> u8 {
        self.read(p, reg, Width::Byte) as u8
    }

    pub fn read16<P: Platform>(&self, p: &mut P, reg: Reg) -> u16 {
        self.read(p, reg, Width::Word) as u16
    }

    pub fn read32<P: Platform>(&self, p: &mut P, reg: Reg) -> u32 {
        self.read(p, reg, Width::Long)
    }

    pub fn write8<P: Platform>(&self, p: &mut P, reg: Reg, val: u8) {
        self.write(p, reg, Width::Byte, val.into());
    }

    pub fn write16<P: Platform>(&self, p: &mut P, reg: Reg, val: u16) {
        self.write(p, reg, Width::Word, val.into());
    }

    pub fn write32<P: Platform>(&self, p: &mut P, reg: Reg, val: u32) {
        self.write(p, reg, Width::Long, val);
    }

    /// Address of a chip register as the SCRIPTS processor itself sees it
    /// when it is the target of a memory-to-memory move.
    pub fn chip_visible(&self, offset: u8) -> BusAddr {
        match self.mode {
            MappingMode::Memory => self.mmio_base + BusAddr::from(offset),
            MappingMode::Port => BusAddr::from(self.io_base) + BusAddr::from(offset),
        }
    }
}
