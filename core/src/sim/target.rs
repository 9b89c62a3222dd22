//! SCSI target generic/shared code

use anyhow::Result;

use crate::ncr::regs::{STATUS_CHECK_CONDITION, STATUS_GOOD};

/// Sense keys
pub const SENSE_NONE: u8 = 0x00;
pub const SENSE_ILLEGAL_REQUEST: u8 = 0x05;

/// Additional sense codes (ASC, ASCQ)
pub const ASC_INVALID_OPCODE: u16 = 0x2000;
pub const ASC_LBA_OUT_OF_RANGE: u16 = 0x2100;
pub const ASC_INVALID_FIELD: u16 = 0x2400;
pub const ASC_LUN_NOT_SUPPORTED: u16 = 0x2500;

/// CDB length by command group
pub const fn scsi_cmd_len(opcode: u8) -> usize {
    match opcode >> 5 {
        // 6 byte commands
        0 => 6,
        // 10 byte commands
        1 | 2 => 10,
        // 16 byte commands
        4 => 16,
        // 12 byte commands
        5 => 12,
        // Reserved and vendor specific groups, treated as 6 byte
        _ => 6,
    }
}

/// Result of a command
#[derive(Debug, PartialEq, Eq)]
pub enum ScsiCmdResult {
    /// Immediately turn to the Status phase
    Status(u8),
    /// Returns data to the initiator
    DataIn(Vec<u8>),
    /// Expects data written to target
    DataOut(usize),
}

/// An abstraction of a generic SCSI target
pub trait ScsiTarget: Send {
    fn unit_ready(&mut self) -> Result<ScsiCmdResult>;
    fn inquiry(&mut self, cmd: &[u8]) -> Result<ScsiCmdResult>;
    fn mode_sense(&mut self, page: u8) -> Option<Vec<u8>>;

    /// Request sense result (key, asc/ascq), clears the pending condition
    fn req_sense(&mut self) -> (u8, u16);
    /// Records a check condition for the next REQUEST SENSE
    fn set_cc(&mut self, key: u8, asc: u16);

    // For block devices
    fn blocksize(&self) -> Option<usize>;
    fn blocks(&self) -> Option<usize>;
    fn read(&self, block_offset: usize, block_count: usize) -> Vec<u8>;
    fn write(&mut self, block_offset: usize, data: &[u8]);

    /// Device-specific commands
    fn specific_cmd(&mut self, cmd: &[u8], outdata: Option<&[u8]>) -> Result<ScsiCmdResult>;

    /// Returns the drives total capacity in bytes
    fn capacity(&self) -> Option<usize> {
        Some(self.blocksize()? * self.blocks()?)
    }

    fn check_condition(&mut self, key: u8, asc: u16) -> Result<ScsiCmdResult> {
        self.set_cc(key, asc);
        Ok(ScsiCmdResult::Status(STATUS_CHECK_CONDITION))
    }

    /// Checks a block range, raising ILLEGAL REQUEST when it does not fit
    fn check_range(&mut self, blocknum: usize, blockcnt: usize) -> Option<ScsiCmdResult> {
        let blocks = self.blocks().unwrap_or(0);
        if blocknum + blockcnt > blocks {
            log::warn!(
                "Access to blocks {}..{} beyond disk of {} blocks",
                blocknum,
                blocknum + blockcnt,
                blocks
            );
            self.set_cc(SENSE_ILLEGAL_REQUEST, ASC_LBA_OUT_OF_RANGE);
            return Some(ScsiCmdResult::Status(STATUS_CHECK_CONDITION));
        }
        None
    }

    fn cmd(&mut self, cmd: &[u8], outdata: Option<&[u8]>) -> Result<ScsiCmdResult> {
        match cmd[0] {
            0x00 => {
                // TEST UNIT READY
                self.unit_ready()
            }
            0x03 => {
                // REQUEST SENSE, extended format
                let (key, asc) = self.req_sense();
                let mut result = vec![0; 18];
                result[0] = 0x70;
                result[2] = key & 0x0F;
                // Additional sense length
                result[7] = 10;
                result[12..14].copy_from_slice(&asc.to_be_bytes());
                result.truncate(usize::from(cmd[4]));
                Ok(ScsiCmdResult::DataIn(result))
            }
            0x08 => {
                // READ(6)
                if self.blocks().is_none() {
                    log::warn!("READ(6) command to non-block device");
                    return self.check_condition(SENSE_ILLEGAL_REQUEST, ASC_INVALID_OPCODE);
                }
                let blocknum = (u32::from_be_bytes(cmd[0..4].try_into()?) & 0x1F_FFFF) as usize;
                let blockcnt = if cmd[4] == 0 { 256 } else { cmd[4] as usize };

                if let Some(cc) = self.check_range(blocknum, blockcnt) {
                    return Ok(cc);
                }
                Ok(ScsiCmdResult::DataIn(self.read(blocknum, blockcnt)))
            }
            0x0A => {
                // WRITE(6)
                let Some(blocksize) = self.blocksize() else {
                    log::warn!("WRITE(6) command to non-block device");
                    return self.check_condition(SENSE_ILLEGAL_REQUEST, ASC_INVALID_OPCODE);
                };
                let blocknum = (u32::from_be_bytes(cmd[0..4].try_into()?) & 0x1F_FFFF) as usize;
                let blockcnt = if cmd[4] == 0 { 256 } else { cmd[4] as usize };

                if let Some(cc) = self.check_range(blocknum, blockcnt) {
                    return Ok(cc);
                }
                match outdata {
                    Some(data) => {
                        self.write(blocknum, data);
                        Ok(ScsiCmdResult::Status(STATUS_GOOD))
                    }
                    None => Ok(ScsiCmdResult::DataOut(blockcnt * blocksize)),
                }
            }
            0x12 => {
                // INQUIRY
                self.inquiry(cmd)
            }
            0x1A => {
                // MODE SENSE(6)
                let Some(page) = self.mode_sense(cmd[2] & 0x3F) else {
                    return self.check_condition(SENSE_ILLEGAL_REQUEST, ASC_INVALID_FIELD);
                };
                // Mode parameter header, no block descriptors
                let mut result = vec![0; 4];
                result.extend_from_slice(&page);
                result[0] = (result.len() - 1) as u8;
                result.truncate(usize::from(cmd[4]));
                Ok(ScsiCmdResult::DataIn(result))
            }
            0x25 => {
                // READ CAPACITY(10)
                let (Some(blocksize), Some(blocks)) = (self.blocksize(), self.blocks()) else {
                    log::warn!("READ CAPACITY(10) command to non-block device");
                    return self.check_condition(SENSE_ILLEGAL_REQUEST, ASC_INVALID_OPCODE);
                };
                let mut result = vec![0; 8];
                result[0..4].copy_from_slice(&((blocks as u32).saturating_sub(1)).to_be_bytes());
                result[4..8].copy_from_slice(&(blocksize as u32).to_be_bytes());
                Ok(ScsiCmdResult::DataIn(result))
            }
            0x28 => {
                // READ(10)
                if self.blocks().is_none() {
                    log::warn!("READ(10) command to non-block device");
                    return self.check_condition(SENSE_ILLEGAL_REQUEST, ASC_INVALID_OPCODE);
                }
                let blocknum = (u32::from_be_bytes(cmd[2..6].try_into()?)) as usize;
                let blockcnt = (u16::from_be_bytes(cmd[7..9].try_into()?)) as usize;

                if let Some(cc) = self.check_range(blocknum, blockcnt) {
                    return Ok(cc);
                }
                Ok(ScsiCmdResult::DataIn(self.read(blocknum, blockcnt)))
            }
            0x2A => {
                // WRITE(10)
                let Some(blocksize) = self.blocksize() else {
                    log::warn!("WRITE(10) command to non-block device");
                    return self.check_condition(SENSE_ILLEGAL_REQUEST, ASC_INVALID_OPCODE);
                };
                let blocknum = (u32::from_be_bytes(cmd[2..6].try_into()?)) as usize;
                let blockcnt = (u16::from_be_bytes(cmd[7..9].try_into()?)) as usize;

                if let Some(cc) = self.check_range(blocknum, blockcnt) {
                    return Ok(cc);
                }
                match outdata {
                    Some(data) => {
                        self.write(blocknum, data);
                        Ok(ScsiCmdResult::Status(STATUS_GOOD))
                    }
                    None => Ok(ScsiCmdResult::DataOut(blockcnt * blocksize)),
                }
            }
            0x2F => {
                // VERIFY(10)
                let blocknum = (u32::from_be_bytes(cmd[2..6].try_into()?)) as usize;
                let blockcnt = (u16::from_be_bytes(cmd[7..9].try_into()?)) as usize;
                if let Some(cc) = self.check_range(blocknum, blockcnt) {
                    return Ok(cc);
                }
                Ok(ScsiCmdResult::Status(STATUS_GOOD))
            }
            _ => self.specific_cmd(cmd, outdata),
        }
    }
}
