//! In-memory direct access target

use anyhow::{Result, bail};

use super::target::{
    ASC_INVALID_OPCODE, SENSE_ILLEGAL_REQUEST, SENSE_NONE, ScsiCmdResult, ScsiTarget,
};
use crate::ncr::regs::STATUS_GOOD;

pub const DISK_BLOCKSIZE: usize = 512;

pub struct ScsiTargetDisk {
    /// Disk contents
    disk: Vec<u8>,

    /// Check condition code
    cc_code: u8,

    /// Check condition ASC
    cc_asc: u16,
}

impl ScsiTargetDisk {
    /// Blank disk of the given amount of blocks
    pub fn new(blocks: usize) -> Self {
        Self {
            disk: vec![0; blocks * DISK_BLOCKSIZE],
            cc_code: 0,
            cc_asc: 0,
        }
    }

    pub fn from_image(disk: Vec<u8>) -> Result<Self> {
        if disk.len() % DISK_BLOCKSIZE != 0 {
            bail!(
                "Image size {} is not a multiple of {} bytes",
                disk.len(),
                DISK_BLOCKSIZE
            );
        }
        Ok(Self {
            disk,
            cc_code: 0,
            cc_asc: 0,
        })
    }

    pub fn image(&self) -> &[u8] {
        &self.disk
    }
}

impl ScsiTarget for ScsiTargetDisk {
    fn unit_ready(&mut self) -> Result<ScsiCmdResult> {
        Ok(ScsiCmdResult::Status(STATUS_GOOD))
    }

    fn inquiry(&mut self, cmd: &[u8]) -> Result<ScsiCmdResult> {
        let mut result = vec![0; 36];

        // 0 Peripheral qualifier, direct access device
        result[0] = 0;
        // 2 ANSI version, SCSI-2
        result[2] = 2;
        // 3 Response data format
        result[3] = 2;
        // 4 Additional length
        result[4] = result.len() as u8 - 5;
        // 7 Sync transfers supported
        result[7] = 0x10;
        // 8-15 Vendor identification
        result[8..16].copy_from_slice(b"NCRSIM  ");
        // 16-31 Product identification
        result[16..32].copy_from_slice(b"RAMDISK         ");
        // 32-35 Product revision level
        result[32..36].copy_from_slice(b"1.0 ");

        result.truncate(usize::from(cmd[4]));
        Ok(ScsiCmdResult::DataIn(result))
    }

    fn mode_sense(&mut self, page: u8) -> Option<Vec<u8>> {
        match page {
            0x01 => {
                // Read/write recovery page
                Some(vec![0x01, 0x0A, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0])
            }
            0x03 => {
                // Format device page
                let mut page = vec![0; 24];
                page[0] = 0x03;
                page[1] = 0x16;
                // Sectors per track
                page[10..12].copy_from_slice(&64u16.to_be_bytes());
                // Data bytes per physical sector
                page[12..14].copy_from_slice(&(DISK_BLOCKSIZE as u16).to_be_bytes());
                Some(page)
            }
            0x04 => {
                // Rigid disk drive geometry page
                let cylinders = self.blocks().unwrap_or(0).div_ceil(64 * 4) as u32;
                let mut page = vec![0; 24];
                page[0] = 0x04;
                page[1] = 0x16;
                page[2..5].copy_from_slice(&cylinders.to_be_bytes()[1..]);
                // Heads
                page[5] = 4;
                Some(page)
            }
            _ => None,
        }
    }

    fn req_sense(&mut self) -> (u8, u16) {
        let cc = (self.cc_code, self.cc_asc);
        (self.cc_code, self.cc_asc) = (SENSE_NONE, 0);
        cc
    }

    fn set_cc(&mut self, code: u8, asc: u16) {
        self.cc_code = code;
        self.cc_asc = asc;
    }

    fn blocksize(&self) -> Option<usize> {
        Some(DISK_BLOCKSIZE)
    }

    fn blocks(&self) -> Option<usize> {
        Some(self.disk.len() / DISK_BLOCKSIZE)
    }

    fn read(&self, block_offset: usize, block_count: usize) -> Vec<u8> {
        let start = block_offset * DISK_BLOCKSIZE;
        self.disk[start..(start + block_count * DISK_BLOCKSIZE)].to_vec()
    }

    fn write(&mut self, block_offset: usize, data: &[u8]) {
        let start = block_offset * DISK_BLOCKSIZE;
        self.disk[start..(start + data.len())].copy_from_slice(data);
    }

    fn specific_cmd(&mut self, cmd: &[u8], _outdata: Option<&[u8]>) -> Result<ScsiCmdResult> {
        match cmd[0] {
            0x04 => {
                // FORMAT UNIT(6)
                self.disk.fill(0);
                Ok(ScsiCmdResult::Status(STATUS_GOOD))
            }
            0x15 | 0x1B | 0x1E => {
                // MODE SELECT(6), START STOP UNIT, PREVENT ALLOW MEDIUM REMOVAL
                Ok(ScsiCmdResult::Status(STATUS_GOOD))
            }
            _ => {
                log::warn!("Unknown command {:02X}", cmd[0]);
                self.check_condition(SENSE_ILLEGAL_REQUEST, ASC_INVALID_OPCODE)
            }
        }
    }
}
