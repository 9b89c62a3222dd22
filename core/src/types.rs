use serde::{Deserialize, Serialize};

/// Address as seen from the PCI bus, which is what the SCRIPTS processor
/// uses for every fetch and data transfer.
pub type BusAddr = u32;

/// Access width of a register or memory operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum Width {
    Byte,
    Word,
    Long,
}

impl Width {
    pub const fn bytes(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Word => 2,
            Self::Long => 4,
        }
    }
}
