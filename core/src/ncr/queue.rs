//! Host/chip shared queues
//!
//! The issue queue is consumed by the SCRIPTS scheduler while the host
//! appends to it, without any lock the chip could honour. Links are
//! descriptor base addresses; each descriptor's `next` field sits at
//! `base + DSA_FIELDS_START`. The chip pops the head by copying the head's
//! `next` into the head cell, so an append can race with the chip
//! consuming the current tail. The append re-checks the head after linking
//! and starts over when the chip emptied the queue underneath it.
//!
//! The reconnect queue is only mutated by the host while the chip is
//! halted, and only walked by the chip.

use log::*;

use super::dsa::{DSA_FIELDS_START, FIELD_NEXT};
use super::regs::{ISTAT_SIGP, Reg};
use crate::bus::{DmaMemory, MemoryResult, Platform, RegisterWindow};
use crate::types::BusAddr;

/// Attempts before an append gives up on a chip that keeps draining the
/// queue underneath it
pub const ENQUEUE_RETRIES: u32 = 16;

fn next_of(base: BusAddr) -> BusAddr {
    base + DSA_FIELDS_START + FIELD_NEXT
}

#[derive(Debug)]
pub struct ChipQueues {
    /// Cell holding the issue queue head
    pub issue_head: BusAddr,
    /// Cell holding the reconnect queue head
    pub reconnect_head: BusAddr,
    /// Last descriptor appended to the issue queue. May already have been
    /// consumed by the chip.
    tail: Option<BusAddr>,
    /// Upper bound on any queue length, guards walks over corrupt links
    limit: usize,
}

impl ChipQueues {
    pub fn new(issue_head: BusAddr, reconnect_head: BusAddr, limit: usize) -> Self {
        Self {
            issue_head,
            reconnect_head,
            tail: None,
            limit,
        }
    }

    /// Empties both queues
    pub fn reset<M: DmaMemory>(&mut self, mem: &mut M) -> MemoryResult<()> {
        mem.write_u32(self.issue_head, 0)?;
        mem.write_u32(self.reconnect_head, 0)?;
        self.tail = None;
        Ok(())
    }

    pub fn tail(&self) -> Option<BusAddr> {
        self.tail
    }

    /// Appends a descriptor to the issue queue while the chip may be
    /// running. The descriptor's `next` must already be zero. Returns the
    /// number of lost appends that had to be retried.
    pub fn enqueue_issue<P: Platform>(
        &mut self,
        p: &mut P,
        regs: &RegisterWindow,
        base: BusAddr,
    ) -> MemoryResult<u32> {
        let mut retries = 0;
        loop {
            let head = p.memory().read_u32(self.issue_head)?;
            if head == 0 {
                // Queue empty, or the chip already took everything: start
                // a new one and wake the scheduler if it waits for
                // reselection.
                p.memory_mut().write_u32(self.issue_head, base)?;
                self.tail = Some(base);
                regs.write8(p, Reg::Istat, ISTAT_SIGP);
                return Ok(retries);
            }

            let tail = self.tail.unwrap_or(head);
            p.memory_mut().write_u32(next_of(tail), base)?;
            self.tail = Some(base);
            if p.memory().read_u32(self.issue_head)? != 0 {
                return Ok(retries);
            }

            // The chip consumed the old tail before it saw our link
            retries += 1;
            debug!(
                "issue append of {:08X} after {:08X} lost to the scheduler, retry {}",
                base, tail, retries
            );
            if retries >= ENQUEUE_RETRIES {
                warn!("issue queue append of {:08X} keeps racing the chip", base);
                p.memory_mut().write_u32(self.issue_head, base)?;
                regs.write8(p, Reg::Istat, ISTAT_SIGP);
                return Ok(retries);
            }
        }
    }

    /// Puts a descriptor back at the front of the issue queue. Chip must be
    /// halted.
    pub fn push_front_issue<M: DmaMemory>(&mut self, mem: &mut M, base: BusAddr) -> MemoryResult<()> {
        let head = mem.read_u32(self.issue_head)?;
        mem.write_u32(next_of(base), head)?;
        mem.write_u32(self.issue_head, base)?;
        if head == 0 {
            self.tail = Some(base);
        }
        Ok(())
    }

    /// Pushes a disconnected descriptor on the reconnect queue. Chip must be
    /// halted.
    pub fn push_reconnect<M: DmaMemory>(&mut self, mem: &mut M, base: BusAddr) -> MemoryResult<()> {
        let head = mem.read_u32(self.reconnect_head)?;
        mem.write_u32(next_of(base), head)?;
        mem.write_u32(self.reconnect_head, base)
    }

    /// Descriptors linked from `head_cell`, in order
    pub fn walk<M: DmaMemory>(&self, mem: &M, head_cell: BusAddr) -> MemoryResult<Vec<BusAddr>> {
        let mut out = vec![];
        let mut cur = mem.read_u32(head_cell)?;
        while cur != 0 {
            if out.len() > self.limit || out.contains(&cur) {
                error!("queue at {:08X} is corrupt after {:08X?}", head_cell, out);
                break;
            }
            out.push(cur);
            cur = mem.read_u32(next_of(cur))?;
        }
        Ok(out)
    }

    pub fn contains<M: DmaMemory>(&self, mem: &M, head_cell: BusAddr, base: BusAddr) -> MemoryResult<bool> {
        Ok(self.walk(mem, head_cell)?.contains(&base))
    }

    /// Unlinks a descriptor from the queue at `head_cell`. The chip must not
    /// be traversing that queue.
    pub fn unlink<M: DmaMemory>(&mut self, mem: &mut M, head_cell: BusAddr, base: BusAddr) -> MemoryResult<bool> {
        let list = self.walk(mem, head_cell)?;
        let Some(pos) = list.iter().position(|&d| d == base) else {
            return Ok(false);
        };
        let next = mem.read_u32(next_of(base))?;
        let prev = pos.checked_sub(1).map(|i| list[i]);
        match prev {
            None => mem.write_u32(head_cell, next)?,
            Some(prev) => mem.write_u32(next_of(prev), next)?,
        }
        mem.write_u32(next_of(base), 0)?;
        if head_cell == self.issue_head && self.tail == Some(base) {
            self.tail = prev;
        }
        Ok(true)
    }

    /// Unlinks a descriptor from whichever queue holds it
    pub fn unlink_any<M: DmaMemory>(&mut self, mem: &mut M, base: BusAddr) -> MemoryResult<bool> {
        if self.unlink(mem, self.issue_head, base)? {
            return Ok(true);
        }
        self.unlink(mem, self.reconnect_head, base)
    }

    /// Forgets a descriptor that left the chip's hands some other way
    pub fn forget(&mut self, base: BusAddr) {
        if self.tail == Some(base) {
            self.tail = None;
        }
    }
}

/// One outstanding command per target and LUN
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LunBusy([u8; 8]);

impl LunBusy {
    pub fn is_busy(&self, target: u8, lun: u8) -> bool {
        self.0[usize::from(target & 7)] & (1 << (lun & 7)) != 0
    }

    pub fn set(&mut self, target: u8, lun: u8) {
        self.0[usize::from(target & 7)] |= 1 << (lun & 7);
    }

    pub fn clear(&mut self, target: u8, lun: u8) {
        self.0[usize::from(target & 7)] &= !(1 << (lun & 7));
    }

    pub fn clear_all(&mut self) {
        self.0 = [0; 8];
    }

    pub fn count(&self) -> u32 {
        self.0.iter().map(|b| b.count_ones()).sum()
    }
}
