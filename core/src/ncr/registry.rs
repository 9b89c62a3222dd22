//! Adapters by interrupt line

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use log::*;

use super::command::CompletionFn;
use super::config::HostConfig;
use super::host::{AttachError, HostAdapter, ProbeInfo};
use crate::bus::Platform;

pub type SharedAdapter<P> = Arc<Mutex<HostAdapter<P>>>;

/// Registered adapters. Several adapters may share one interrupt line, all
/// of them are asked to service it.
pub struct AdapterRegistry<P: Platform> {
    lines: BTreeMap<u32, Vec<SharedAdapter<P>>>,
    /// Adapters attached through [`AdapterRegistry::attach`], numbers names
    attached: usize,
}

impl<P: Platform> Default for AdapterRegistry<P> {
    fn default() -> Self {
        Self {
            lines: BTreeMap::new(),
            attached: 0,
        }
    }
}

impl<P: Platform> AdapterRegistry<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches the next `scsiN` adapter and registers it. A failed attach
    /// registers nothing and leaves the number for the next adapter.
    pub fn attach(
        &mut self,
        platform: P,
        probe: ProbeInfo,
        config: HostConfig,
        done: CompletionFn,
    ) -> Result<SharedAdapter<P>, AttachError<P>> {
        let name = format!("scsi{}", self.attached);
        let adapter = HostAdapter::attach(name, platform, probe, config, done)?;
        self.attached += 1;
        Ok(self.register(adapter))
    }

    pub fn register(&mut self, adapter: HostAdapter<P>) -> SharedAdapter<P> {
        let irq = adapter.irq();
        debug!("{}: registered on irq {}", adapter.name(), irq);
        let shared = Arc::new(Mutex::new(adapter));
        self.lines.entry(irq).or_default().push(Arc::clone(&shared));
        shared
    }

    /// Services an interrupt line. Returns whether any adapter had
    /// something pending.
    pub fn handle_irq(&self, irq: u32) -> bool {
        let Some(adapters) = self.lines.get(&irq) else {
            warn!("interrupt on unregistered line {}", irq);
            return false;
        };
        let mut handled = false;
        for a in adapters {
            match a.lock() {
                Ok(mut host) => handled |= host.interrupt(),
                Err(_) => error!("adapter lock on irq {} poisoned", irq),
            }
        }
        handled
    }

    pub fn adapters(&self) -> impl Iterator<Item = &SharedAdapter<P>> {
        self.lines.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.lines.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Removes an adapter and detaches it. Fails, handing the adapter
    /// back, while other references to it are alive.
    pub fn unregister(&mut self, adapter: SharedAdapter<P>) -> Result<P, SharedAdapter<P>> {
        let irq = match adapter.lock() {
            Ok(host) => host.irq(),
            Err(poisoned) => poisoned.into_inner().irq(),
        };
        if let Some(list) = self.lines.get_mut(&irq) {
            list.retain(|a| !Arc::ptr_eq(a, &adapter));
            if list.is_empty() {
                self.lines.remove(&irq);
            }
        }
        match Arc::try_unwrap(adapter) {
            Ok(m) => {
                let host = m.into_inner().unwrap_or_else(|p| p.into_inner());
                Ok(host.detach())
            }
            Err(shared) => {
                self.lines.entry(irq).or_default().push(Arc::clone(&shared));
                Err(shared)
            }
        }
    }
}
