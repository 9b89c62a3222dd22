//! Driver for NCR/Symbios 53c8xx SCSI host adapters

pub mod chip;
pub mod command;
pub mod config;
pub mod dsa;
pub mod error;
pub mod fixup;
pub mod host;
pub mod intr;
pub mod queue;
pub mod registry;
pub mod regs;
pub mod scripts;
pub mod selftest;
pub mod sync;

#[cfg(test)]
mod tests;
