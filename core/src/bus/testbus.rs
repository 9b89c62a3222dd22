//! Platform for unit tests: plain register store with an access trace

use std::collections::HashMap;
use std::sync::atomic::{Ordering, fence};

use super::Platform;
use super::arena::DmaArena;
use crate::types::{BusAddr, Width};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Access {
    Read,
    Write,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Space {
    Memory,
    Port,
}

#[derive(Copy, Clone, Debug)]
pub struct TraceEntry {
    pub space: Space,
    pub addr: u32,
    pub access: Access,
    pub width: Width,
    pub val: u32,
}

pub struct Testbus {
    pub mem: DmaArena,
    pub regs: HashMap<(Space, u32), u32>,
    trace: Vec<TraceEntry>,
    /// Trace length at every barrier
    barriers: Vec<usize>,
    pub delayed: u64,
}

impl Testbus {
    pub fn new(base: BusAddr, size: usize) -> Self {
        Self {
            mem: DmaArena::new(base, size),
            regs: HashMap::new(),
            trace: vec![],
            barriers: vec![],
            delayed: 0,
        }
    }

    pub fn get_trace(&self) -> &[TraceEntry] {
        &self.trace
    }

    pub fn get_barriers(&self) -> &[usize] {
        &self.barriers
    }

    fn access(&mut self, space: Space, addr: u32, access: Access, width: Width, val: u32) -> u32 {
        let val = match access {
            Access::Read => *self.regs.get(&(space, addr)).unwrap_or(&0),
            Access::Write => {
                self.regs.insert((space, addr), val);
                val
            }
        };
        self.trace.push(TraceEntry {
            space,
            addr,
            access,
            width,
            val,
        });
        val
    }
}

impl Platform for Testbus {
    type Memory = DmaArena;

    fn memory(&self) -> &DmaArena {
        &self.mem
    }

    fn memory_mut(&mut self) -> &mut DmaArena {
        &mut self.mem
    }

    fn mmio_read(&mut self, addr: BusAddr, width: Width) -> u32 {
        self.access(Space::Memory, addr, Access::Read, width, 0)
    }

    fn mmio_write(&mut self, addr: BusAddr, width: Width, val: u32) {
        self.access(Space::Memory, addr, Access::Write, width, val);
    }

    fn port_read(&mut self, port: u16, width: Width) -> u32 {
        self.access(Space::Port, port.into(), Access::Read, width, 0)
    }

    fn port_write(&mut self, port: u16, width: Width, val: u32) {
        self.access(Space::Port, port.into(), Access::Write, width, val);
    }

    fn udelay(&mut self, usecs: u32) {
        self.delayed += u64::from(usecs);
    }

    fn barrier(&mut self) {
        fence(Ordering::SeqCst);
        self.barriers.push(self.trace.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MappingMode, RegisterWindow};
    use crate::ncr::regs::Reg;

    #[test]
    fn window_memory_mapped() {
        let mut bus = Testbus::new(0, 0x100);
        let w = RegisterWindow {
            mode: MappingMode::Memory,
            mmio_base: 0xF000_0000,
            io_base: 0x1000,
        };
        w.write32(&mut bus, Reg::Dsp, 0x1234);
        assert_eq!(w.read32(&mut bus, Reg::Dsp), 0x1234);
        let t = bus.get_trace();
        assert_eq!(t.len(), 2);
        assert_eq!(t[0].space, Space::Memory);
        assert_eq!(t[0].addr, 0xF000_002C);
        assert_eq!(t[0].width, Width::Long);
        assert_eq!(w.chip_visible(0x34), 0xF000_0034);
    }

    #[test]
    fn window_port_mapped() {
        let mut bus = Testbus::new(0, 0x100);
        let w = RegisterWindow {
            mode: MappingMode::Port,
            mmio_base: 0xF000_0000,
            io_base: 0x1000,
        };
        w.write8(&mut bus, Reg::Istat, 0x20);
        assert_eq!(w.read8(&mut bus, Reg::Istat), 0x20);
        let t = bus.get_trace();
        assert_eq!(t[0].space, Space::Port);
        assert_eq!(t[0].addr, 0x1014);
        assert_eq!(t[1].access, Access::Read);
        assert_eq!(w.chip_visible(0x10), 0x1010);
    }

    #[test]
    fn writes_fenced_on_both_sides() {
        let mut bus = Testbus::new(0, 0x100);
        let w = RegisterWindow {
            mode: MappingMode::Memory,
            mmio_base: 0xF000_0000,
            io_base: 0x1000,
        };
        w.read8(&mut bus, Reg::Istat);
        w.write8(&mut bus, Reg::Istat, 0x20);
        w.write32(&mut bus, Reg::Dsp, 0x1234);
        assert_eq!(bus.get_barriers(), [1, 2, 2, 3]);
    }
}
