//! Flat DMA arena backing the simulated machine's memory

use std::collections::BTreeMap;

use log::*;

use super::{DmaMemory, MemoryError, MemoryResult};
use crate::types::BusAddr;

/// Callback fired after a write touching a watched address
pub type WriteHook = Box<dyn FnMut(&mut DmaArena, BusAddr) + Send>;

struct Watch {
    addr: BusAddr,
    once: bool,
    hook: WriteHook,
}

/// A contiguous block of bus-addressable memory with a first-fit allocator.
pub struct DmaArena {
    base: BusAddr,
    mem: Vec<u8>,
    allocs: BTreeMap<BusAddr, usize>,
    watches: Vec<Watch>,
    in_hook: bool,
}

const fn align_up(v: BusAddr, align: BusAddr) -> BusAddr {
    (v + align - 1) & !(align - 1)
}

impl DmaArena {
    pub fn new(base: BusAddr, size: usize) -> Self {
        Self {
            base,
            mem: vec![0; size],
            allocs: BTreeMap::new(),
            watches: vec![],
            in_hook: false,
        }
    }

    pub fn base(&self) -> BusAddr {
        self.base
    }

    pub fn size(&self) -> usize {
        self.mem.len()
    }

    pub fn contains(&self, addr: BusAddr, len: usize) -> bool {
        addr >= self.base && (addr - self.base) as usize + len <= self.mem.len()
    }

    /// Bytes currently handed out by the allocator
    pub fn allocated(&self) -> usize {
        self.allocs.values().sum()
    }

    pub fn allocations(&self) -> usize {
        self.allocs.len()
    }

    /// Registers a hook that runs right after any write covering `addr`.
    /// Writes done from inside a hook do not fire hooks.
    pub fn watch(&mut self, addr: BusAddr, once: bool, hook: WriteHook) {
        self.watches.push(Watch { addr, once, hook });
    }

    fn range(&self, addr: BusAddr, len: usize) -> MemoryResult<std::ops::Range<usize>> {
        if !self.contains(addr, len) {
            return Err(MemoryError::OutOfRange { addr, len });
        }
        let start = (addr - self.base) as usize;
        Ok(start..(start + len))
    }

    fn fire_watches(&mut self, addr: BusAddr, len: usize) {
        if self.in_hook || self.watches.is_empty() {
            return;
        }
        let end = addr + len as BusAddr;
        let mut watches = std::mem::take(&mut self.watches);
        self.in_hook = true;
        watches.retain_mut(|w| {
            if w.addr >= addr && w.addr < end {
                (w.hook)(self, w.addr);
                !w.once
            } else {
                true
            }
        });
        self.in_hook = false;
        // Hooks may have registered new watches
        watches.append(&mut self.watches);
        self.watches = watches;
    }
}

impl DmaMemory for DmaArena {
    fn read_bytes(&self, addr: BusAddr, buf: &mut [u8]) -> MemoryResult<()> {
        let r = self.range(addr, buf.len())?;
        buf.copy_from_slice(&self.mem[r]);
        Ok(())
    }

    fn write_bytes(&mut self, addr: BusAddr, data: &[u8]) -> MemoryResult<()> {
        let r = self.range(addr, data.len())?;
        self.mem[r].copy_from_slice(data);
        self.fire_watches(addr, data.len());
        Ok(())
    }

    fn alloc(&mut self, len: usize, align: usize) -> Option<BusAddr> {
        let align = align.max(1).next_power_of_two() as BusAddr;
        let end = self.base as u64 + self.mem.len() as u64;
        let mut cursor = align_up(self.base, align);
        for (&a, &l) in &self.allocs {
            if u64::from(cursor) + len as u64 <= u64::from(a) {
                break;
            }
            cursor = cursor.max(align_up(a + l as BusAddr, align));
        }
        if u64::from(cursor) + len as u64 > end {
            warn!("DMA arena exhausted allocating {} bytes", len);
            return None;
        }
        self.allocs.insert(cursor, len);
        let r = (cursor - self.base) as usize..(cursor - self.base) as usize + len;
        self.mem[r].fill(0);
        Some(cursor)
    }

    fn free(&mut self, addr: BusAddr) {
        if self.allocs.remove(&addr).is_none() {
            warn!("Freeing unallocated DMA block {:08X}", addr);
        }
    }
}
