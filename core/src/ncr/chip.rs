//! Chip variants and their capabilities

use serde::Serialize;

use super::error::DriverError;

/// PCI vendor id of NCR/Symbios parts
pub const PCI_VENDOR_NCR: u16 = 0x1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
pub enum RegisterLayout {
    /// 53c700 family, different register offsets and no table indirect
    Ncr700,
    Ncr8xx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChipInfo {
    pub name: &'static str,
    pub device: u16,
    /// Lowest revision this entry applies to
    pub min_revision: u8,
    pub layout: RegisterLayout,
    pub table_indirect: bool,
    /// Interrupt on the fly (INTFLY)
    pub intfly: bool,
    /// Has a differential transceiver that needs polling stopped on reset
    pub transceiver: bool,
    pub max_sync_offset: u8,
    /// Fastest supported SDTR period factor
    pub min_period_factor: u8,
    /// SCSI core clock in MHz
    pub clock_mhz: u8,
}

const fn legacy(name: &'static str, device: u16) -> ChipInfo {
    ChipInfo {
        name,
        device,
        min_revision: 0,
        layout: RegisterLayout::Ncr700,
        table_indirect: false,
        intfly: false,
        transceiver: false,
        max_sync_offset: 8,
        min_period_factor: 50,
        clock_mhz: 50,
    }
}

const fn ncr8xx(name: &'static str, device: u16, min_revision: u8, intfly: bool) -> ChipInfo {
    ChipInfo {
        name,
        device,
        min_revision,
        layout: RegisterLayout::Ncr8xx,
        table_indirect: true,
        intfly,
        transceiver: false,
        max_sync_offset: 8,
        min_period_factor: 25,
        clock_mhz: 40,
    }
}

/// Most specific entries first
pub static CHIPS: &[ChipInfo] = &[
    ncr8xx("53c810A", 0x0001, 0x10, true),
    ncr8xx("53c810", 0x0001, 0x00, false),
    ncr8xx("53c820", 0x0002, 0x00, false),
    ChipInfo {
        transceiver: true,
        ..ncr8xx("53c825A", 0x0003, 0x10, true)
    },
    ChipInfo {
        transceiver: true,
        ..ncr8xx("53c825", 0x0003, 0x00, false)
    },
    ncr8xx("53c815", 0x0004, 0x00, false),
    ncr8xx("53c860", 0x0006, 0x00, true),
    // Not PCI parts, ids are local to this table
    legacy("53c700", 0x0700),
    legacy("53c700-66", 0x0766),
    legacy("53c710", 0x0710),
    legacy("53c720", 0x0720),
];

pub fn lookup(device: u16, revision: u8) -> Option<&'static ChipInfo> {
    CHIPS
        .iter()
        .find(|c| c.device == device && revision >= c.min_revision)
}

/// Picks the capability descriptor for a probed chip and checks the driver
/// can run on it
pub fn select(device: u16, revision: u8) -> Result<&'static ChipInfo, DriverError> {
    let chip = lookup(device, revision).ok_or(DriverError::UnsupportedChip { device, revision })?;
    if chip.layout != RegisterLayout::Ncr8xx || !chip.table_indirect {
        return Err(DriverError::LegacyChip(chip.name));
    }
    Ok(chip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revision_picks_variant() {
        assert_eq!(lookup(0x0001, 0x02).unwrap().name, "53c810");
        assert_eq!(lookup(0x0001, 0x11).unwrap().name, "53c810A");
        assert!(lookup(0x0001, 0x11).unwrap().intfly);
        assert!(!lookup(0x0001, 0x01).unwrap().intfly);
        assert!(lookup(0x0003, 0x00).unwrap().transceiver);
    }

    #[test]
    fn legacy_rejected() {
        assert!(matches!(
            select(0x0710, 0),
            Err(DriverError::LegacyChip("53c710"))
        ));
        assert!(matches!(
            select(0x0BAD, 0),
            Err(DriverError::UnsupportedChip { device: 0x0BAD, .. })
        ));
        assert!(select(0x0006, 0).is_ok());
    }
}
