//! Simulated SCSI bus and the target side of its protocol

use std::collections::VecDeque;

use anyhow::{Result, bail};
use log::*;
use serde::{Deserialize, Serialize};

use super::target::{ASC_LUN_NOT_SUPPORTED, SENSE_ILLEGAL_REQUEST, ScsiCmdResult, ScsiTarget, scsi_cmd_len};
use crate::ncr::regs::{
    EXTENDED_SDTR, EXTENDED_WDTR, MSG_ABORT, MSG_BUS_DEVICE_RESET, MSG_COMMAND_COMPLETE,
    MSG_DISCONNECT, MSG_EXTENDED, MSG_IDENTIFY, MSG_IDENTIFY_DISCONNECT, MSG_NOP, MSG_REJECT,
    MSG_SAVE_DATA_POINTERS, Phase, STATUS_GOOD, Sbcl,
};

const BUS_TRACE: bool = false;

/// Number of SCSI IDs on a narrow bus
pub const BUS_IDS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCapability {
    /// Fastest period factor the target accepts
    pub min_period: u8,
    pub max_offset: u8,
}

/// How a simulated target deviates from a plain in-order execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetBehaviour {
    /// Disconnect between the command and the data phase
    pub disconnect_after_command: bool,
    /// Save data pointers and disconnect after this many data bytes
    pub disconnect_after_bytes: Option<usize>,
    /// Bus clocks a disconnected command waits before reselecting
    pub reselect_delay: u64,
    /// Flag a parity error on this data byte, once per target
    pub parity_error_after_bytes: Option<usize>,
    /// Release BSY after the command bytes without any message
    pub drop_after_command: bool,
    /// Answers SDTR within these limits, rejects it when None
    pub sync: Option<SyncCapability>,
    /// Starts SDTR after the first selection
    pub initiate_sdtr: bool,
    /// Starts WDTR after the first selection
    pub initiate_wdtr: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TargetStats {
    pub selections: u64,
    pub commands: u64,
    pub disconnects: u64,
    pub reselections: u64,
    pub aborts: u64,
    /// Messages the initiator rejected
    pub rejected: u64,
    /// Period factor and offset agreed on, None while asynchronous
    pub agreement: Option<(u8, u8)>,
    /// Width exponent agreed on through WDTR
    pub width: u8,
    /// SXFER the initiator used for the last data byte
    pub data_sxfer: u8,
}

struct TargetSlot {
    dev: Box<dyn ScsiTarget>,
    behaviour: TargetBehaviour,
    parity_injected: bool,
    /// Target initiated negotiation happened
    initiated: bool,
    stats: TargetStats,
}

/// Where a nexus goes once its pending messages are acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Command,
    Phase(Phase),
    /// Done, release the bus
    Free,
    /// Release the bus and reselect later
    Disconnect,
}

/// Outcome of one block move against the bus
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub moved: usize,
    pub parity_error: bool,
}

/// An I_T_L nexus
struct Nexus {
    target: u8,
    lun: u8,
    phase: Phase,
    next: Next,
    /// Phase to continue with after reselection
    resume: Phase,
    identified: bool,
    may_disconnect: bool,
    /// Already disconnected in the middle of the data
    split: bool,
    /// Extended message the target sent and waits an answer for
    awaiting: Option<u8>,

    msg_out: Vec<u8>,
    msg_in: VecDeque<u8>,
    cdb: Vec<u8>,
    data_in: VecDeque<u8>,
    data_out: Vec<u8>,
    data_out_len: usize,
    /// Data bytes moved for the command so far
    moved: usize,
    status: u8,
}

impl Nexus {
    fn new(target: u8, atn: bool) -> Self {
        Self {
            target,
            lun: 0,
            phase: if atn { Phase::MsgOut } else { Phase::Command },
            next: Next::Command,
            resume: Phase::Status,
            identified: false,
            may_disconnect: false,
            split: false,
            awaiting: None,
            msg_out: vec![],
            msg_in: VecDeque::new(),
            cdb: vec![],
            data_in: VecDeque::new(),
            data_out: vec![],
            data_out_len: 0,
            moved: 0,
            status: STATUS_GOOD,
        }
    }

    fn send_messages(&mut self, msgs: &[u8], next: Next) {
        self.msg_in.extend(msgs);
        self.next = next;
        self.phase = Phase::MsgIn;
    }

    /// Saves pointers and disconnects at the configured data position
    fn disconnect_point(&mut self, behaviour: &TargetBehaviour, resume: Phase) {
        if self.split || !self.may_disconnect || behaviour.disconnect_after_bytes != Some(self.moved) {
            return;
        }
        self.split = true;
        self.resume = resume;
        self.send_messages(&[MSG_SAVE_DATA_POINTERS, MSG_DISCONNECT], Next::Disconnect);
    }

    /// Extended message from the initiator
    fn extended(&mut self, slot: &mut TargetSlot, body: &[u8]) {
        match *body {
            [EXTENDED_SDTR, period, offset] => {
                if self.awaiting == Some(EXTENDED_SDTR) {
                    self.awaiting = None;
                    slot.stats.agreement = (offset > 0).then_some((period, offset));
                } else if let Some(cap) = slot.behaviour.sync {
                    let period = period.max(cap.min_period);
                    let offset = offset.min(cap.max_offset);
                    slot.stats.agreement = (offset > 0).then_some((period, offset));
                    self.msg_in
                        .extend([MSG_EXTENDED, 3, EXTENDED_SDTR, period, offset]);
                } else {
                    self.msg_in.push_back(MSG_REJECT);
                }
            }
            [EXTENDED_WDTR, width] => {
                if self.awaiting == Some(EXTENDED_WDTR) {
                    self.awaiting = None;
                    slot.stats.width = width;
                } else {
                    slot.stats.width = 0;
                    self.msg_in.extend([MSG_EXTENDED, 2, EXTENDED_WDTR, 0]);
                }
            }
            _ => self.msg_in.push_back(MSG_REJECT),
        }
    }
}

struct Parked {
    nexus: Nexus,
    delay: u64,
}

/// A narrow SCSI bus with the chip as the only initiator
pub struct ScsiBus {
    targets: [Option<TargetSlot>; BUS_IDS],
    nexus: Option<Nexus>,
    /// Disconnected commands waiting to reselect
    parked: Vec<Parked>,
    atn: bool,
    ack: bool,
    unexpected_free: bool,
}

impl Default for ScsiBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ScsiBus {
    pub fn new() -> Self {
        Self {
            targets: std::array::from_fn(|_| None),
            nexus: None,
            parked: vec![],
            atn: false,
            ack: false,
            unexpected_free: false,
        }
    }

    pub fn attach_target(
        &mut self,
        id: usize,
        dev: Box<dyn ScsiTarget>,
        behaviour: TargetBehaviour,
    ) -> Result<()> {
        if id >= BUS_IDS {
            bail!("SCSI ID {} out of range", id);
        }
        if self.targets[id].is_some() {
            bail!("SCSI ID {} already in use", id);
        }
        self.targets[id] = Some(TargetSlot {
            dev,
            behaviour,
            parity_injected: false,
            initiated: false,
            stats: TargetStats::default(),
        });
        Ok(())
    }

    pub fn device(&self, id: usize) -> Option<&dyn ScsiTarget> {
        Some(&*self.targets.get(id)?.as_ref()?.dev)
    }

    pub fn device_mut(&mut self, id: usize) -> Option<&mut (dyn ScsiTarget + 'static)> {
        Some(&mut *self.targets.get_mut(id)?.as_mut()?.dev)
    }

    pub fn target_stats(&self, id: usize) -> Option<&TargetStats> {
        Some(&self.targets.get(id)?.as_ref()?.stats)
    }

    pub fn connected(&self) -> bool {
        self.nexus.is_some()
    }

    pub fn phase(&self) -> Option<Phase> {
        self.nexus.as_ref().map(|n| n.phase)
    }

    /// Disconnected commands, connected or not
    pub fn parked(&self) -> usize {
        self.parked.len()
    }

    /// Anything still in progress on the bus
    pub fn is_busy(&self) -> bool {
        self.nexus.is_some() || !self.parked.is_empty()
    }

    /// Current state of the control lines
    pub fn sbcl(&self) -> Sbcl {
        let mut s = Sbcl(0);
        if let Some(n) = &self.nexus {
            s.set_phase(n.phase.code());
            s.set_bsy(true);
            s.set_req(!self.ack);
            s.set_ack(self.ack);
        }
        s.set_atn(self.atn);
        s
    }

    /// Waits for REQ on behalf of the initiator. A held ACK is released
    /// first. Returns the phase, None when the bus is free.
    pub fn request(&mut self) -> Option<Phase> {
        if self.ack {
            self.release_ack();
        }
        self.phase()
    }

    /// Set once the target released BSY without being told to
    pub fn take_unexpected_free(&mut self) -> bool {
        std::mem::take(&mut self.unexpected_free)
    }

    /// Arbitration and selection. False when nobody answers.
    pub fn select(&mut self, target: u8, atn: bool) -> bool {
        if self.nexus.is_some() {
            return false;
        }
        let Some(slot) = self.targets.get_mut(usize::from(target)).and_then(Option::as_mut) else {
            return false;
        };
        slot.stats.selections += 1;
        if BUS_TRACE {
            trace!("Target {} selected, ATN {}", target, atn);
        }
        self.atn = atn;
        self.ack = false;
        self.nexus = Some(Nexus::new(target, atn));
        true
    }

    /// A disconnected target is ready and arbitrating
    pub fn reselection_pending(&self) -> bool {
        self.nexus.is_none() && self.parked.iter().any(|p| p.delay == 0)
    }

    /// Lets the first ready target reselect. Returns its ID and LUN; the
    /// IDENTIFY message is waiting in MESSAGE IN.
    pub fn take_reselection(&mut self) -> Option<(u8, u8)> {
        if self.nexus.is_some() {
            return None;
        }
        let idx = self.parked.iter().position(|p| p.delay == 0)?;
        let Parked { mut nexus, .. } = self.parked.remove(idx);
        if let Some(slot) = self.targets[usize::from(nexus.target)].as_mut() {
            slot.stats.reselections += 1;
        }
        let resume = nexus.resume;
        nexus.msg_in.clear();
        nexus.send_messages(&[MSG_IDENTIFY | nexus.lun], Next::Phase(resume));
        let id = (nexus.target, nexus.lun);
        if BUS_TRACE {
            trace!("Target {} lun {} reselects", id.0, id.1);
        }
        self.atn = false;
        self.ack = false;
        self.nexus = Some(nexus);
        Some(id)
    }

    pub fn set_atn(&mut self, on: bool) {
        self.atn = on;
        if !on || self.ack {
            return;
        }
        // Honored at the next byte boundary
        if let Some(n) = self.nexus.as_mut() {
            if n.phase != Phase::MsgOut {
                if n.phase != Phase::MsgIn {
                    n.next = Next::Phase(n.phase);
                }
                n.phase = Phase::MsgOut;
            }
        }
    }

    /// Initiator releases ACK after a MESSAGE IN byte
    pub fn release_ack(&mut self) {
        if !std::mem::take(&mut self.ack) {
            return;
        }
        let Some(n) = self.nexus.as_mut() else {
            return;
        };
        if n.phase != Phase::MsgIn {
            return;
        }
        if self.atn {
            n.phase = Phase::MsgOut;
            return;
        }
        if !n.msg_in.is_empty() {
            return;
        }
        let next = n.next;
        self.go(next);
    }

    fn go(&mut self, next: Next) {
        match next {
            Next::Command => {
                if let Some(n) = self.nexus.as_mut() {
                    n.phase = Phase::Command;
                }
            }
            Next::Phase(p) => {
                if let Some(n) = self.nexus.as_mut() {
                    n.phase = p;
                }
            }
            Next::Free => {
                if let Some(n) = self.nexus.take() {
                    if BUS_TRACE {
                        trace!("Target {} releases the bus", n.target);
                    }
                }
            }
            Next::Disconnect => {
                if let Some(nexus) = self.nexus.take() {
                    let delay = match self.targets[usize::from(nexus.target)].as_mut() {
                        Some(slot) => {
                            slot.stats.disconnects += 1;
                            slot.behaviour.reselect_delay
                        }
                        None => 0,
                    };
                    if BUS_TRACE {
                        trace!("Target {} disconnects for {} clocks", nexus.target, delay);
                    }
                    self.parked.push(Parked { nexus, delay });
                }
            }
        }
    }

    /// Target to initiator transfer of up to `buf.len()` bytes in `phase`
    pub fn receive(&mut self, phase: Phase, buf: &mut [u8], sxfer: u8) -> Result<Transfer> {
        let mut t = Transfer::default();
        while t.moved < buf.len() {
            let Some(n) = self.nexus.as_mut() else {
                break;
            };
            if n.phase != phase {
                break;
            }
            let last = t.moved + 1 == buf.len();
            match phase {
                Phase::MsgIn => {
                    let Some(b) = n.msg_in.pop_front() else {
                        bail!("Target {} in MESSAGE IN without a message", n.target);
                    };
                    buf[t.moved] = b;
                    t.moved += 1;
                    // ACK stays asserted on the last byte of the move
                    self.ack = true;
                    if !last {
                        self.release_ack();
                    }
                }
                Phase::Status => {
                    buf[t.moved] = n.status;
                    t.moved += 1;
                    n.send_messages(&[MSG_COMMAND_COMPLETE], Next::Free);
                }
                Phase::DataIn => {
                    let Some(b) = n.data_in.pop_front() else {
                        n.phase = Phase::Status;
                        break;
                    };
                    buf[t.moved] = b;
                    t.moved += 1;
                    n.moved += 1;
                    let Some(slot) = self.targets[usize::from(n.target)].as_mut() else {
                        bail!("Nexus without target {}", n.target);
                    };
                    slot.stats.data_sxfer = sxfer;
                    if !slot.parity_injected && slot.behaviour.parity_error_after_bytes == Some(n.moved) {
                        slot.parity_injected = true;
                        t.parity_error = true;
                    }
                    if n.data_in.is_empty() {
                        n.phase = Phase::Status;
                    } else {
                        n.disconnect_point(&slot.behaviour, Phase::DataIn);
                    }
                    if t.parity_error {
                        break;
                    }
                }
                _ => break,
            }
        }
        Ok(t)
    }

    /// Initiator to target transfer in `phase`
    pub fn send(&mut self, phase: Phase, data: &[u8], sxfer: u8) -> Result<Transfer> {
        let mut t = Transfer::default();
        for &b in data {
            let Some(n) = self.nexus.as_mut() else {
                break;
            };
            if n.phase != phase {
                break;
            }
            match phase {
                Phase::MsgOut => n.msg_out.push(b),
                Phase::Command => {
                    n.cdb.push(b);
                    if n.cdb.len() == scsi_cmd_len(n.cdb[0]) {
                        t.moved += 1;
                        self.execute()?;
                        continue;
                    }
                }
                Phase::DataOut => {
                    n.data_out.push(b);
                    n.moved += 1;
                    let Some(slot) = self.targets[usize::from(n.target)].as_mut() else {
                        bail!("Nexus without target {}", n.target);
                    };
                    slot.stats.data_sxfer = sxfer;
                    if n.data_out.len() == n.data_out_len {
                        t.moved += 1;
                        self.finish_data_out()?;
                        continue;
                    }
                    n.disconnect_point(&slot.behaviour, Phase::DataOut);
                }
                _ => break,
            }
            t.moved += 1;
        }
        Ok(t)
    }

    /// The initiator dropped ATN with the last message byte. The target
    /// acts on everything it received in MESSAGE OUT.
    pub fn end_message_out(&mut self) -> Result<()> {
        self.atn = false;
        let Some(n) = self.nexus.as_mut() else {
            return Ok(());
        };
        if n.phase != Phase::MsgOut {
            return Ok(());
        }
        let Some(slot) = self.targets[usize::from(n.target)].as_mut() else {
            bail!("Nexus without target {}", n.target);
        };
        let bytes = std::mem::take(&mut n.msg_out);
        if BUS_TRACE {
            trace!("Target {} message out {:02X?}", n.target, bytes);
        }

        let first = !n.identified;
        let mut sdtr_seen = false;
        let mut i = 0;
        while i < bytes.len() {
            let b = bytes[i];
            if b & MSG_IDENTIFY != 0 {
                n.lun = b & 7;
                n.may_disconnect = b & MSG_IDENTIFY_DISCONNECT != 0;
                n.identified = true;
                i += 1;
                continue;
            }
            match b {
                MSG_EXTENDED => {
                    let len = usize::from(bytes.get(i + 1).copied().unwrap_or(0));
                    let body = bytes.get(i + 2..i + 2 + len).unwrap_or(&[]);
                    sdtr_seen |= body.first() == Some(&EXTENDED_SDTR);
                    n.extended(slot, body);
                    i += 2 + len;
                }
                MSG_ABORT | MSG_BUS_DEVICE_RESET => {
                    debug!("Target {} lun {} aborted by the initiator", n.target, n.lun);
                    slot.stats.aborts += 1;
                    self.nexus = None;
                    return Ok(());
                }
                MSG_REJECT => {
                    slot.stats.rejected += 1;
                    if n.awaiting.take() == Some(EXTENDED_SDTR) {
                        slot.stats.agreement = None;
                    }
                    i += 1;
                }
                MSG_NOP => i += 1,
                _ => {
                    warn!("Target {} rejects message {:02X}", n.target, b);
                    n.msg_in.push_back(MSG_REJECT);
                    i += 1;
                }
            }
        }

        if first && n.identified && !slot.initiated {
            if slot.behaviour.initiate_sdtr && !sdtr_seen {
                let (period, offset) = match slot.behaviour.sync {
                    Some(cap) => (cap.min_period, cap.max_offset),
                    None => (25, 8),
                };
                slot.initiated = true;
                n.awaiting = Some(EXTENDED_SDTR);
                n.msg_in
                    .extend([MSG_EXTENDED, 3, EXTENDED_SDTR, period, offset]);
            } else if slot.behaviour.initiate_wdtr {
                slot.initiated = true;
                n.awaiting = Some(EXTENDED_WDTR);
                n.msg_in.extend([MSG_EXTENDED, 2, EXTENDED_WDTR, 1]);
            }
        }

        if n.msg_in.is_empty() {
            let next = n.next;
            self.go(next);
        } else {
            n.phase = Phase::MsgIn;
        }
        Ok(())
    }

    /// The whole CDB is in, run it
    fn execute(&mut self) -> Result<()> {
        let Some(n) = self.nexus.as_mut() else {
            return Ok(());
        };
        let Some(slot) = self.targets[usize::from(n.target)].as_mut() else {
            bail!("Nexus without target {}", n.target);
        };
        slot.stats.commands += 1;
        if BUS_TRACE {
            trace!("Target {} lun {} command {:02X?}", n.target, n.lun, n.cdb);
        }
        if slot.behaviour.drop_after_command {
            warn!("Target {} drops off the bus", n.target);
            self.nexus = None;
            self.unexpected_free = true;
            return Ok(());
        }

        let result = match n.cdb[0] {
            // INQUIRY and REQUEST SENSE answer for any LUN
            0x12 => {
                let mut r = slot.dev.cmd(&n.cdb, None)?;
                if let (ScsiCmdResult::DataIn(data), true) = (&mut r, n.lun != 0) {
                    if let Some(b) = data.first_mut() {
                        // Peripheral qualifier: no device at this LUN
                        *b = 0x7F;
                    }
                }
                r
            }
            0x03 => slot.dev.cmd(&n.cdb, None)?,
            _ if n.lun != 0 => slot.dev.check_condition(SENSE_ILLEGAL_REQUEST, ASC_LUN_NOT_SUPPORTED)?,
            _ => slot.dev.cmd(&n.cdb, None)?,
        };
        let phase = match result {
            ScsiCmdResult::Status(s) => {
                n.status = s;
                Phase::Status
            }
            ScsiCmdResult::DataIn(data) => {
                n.status = STATUS_GOOD;
                n.data_in = data.into();
                if n.data_in.is_empty() { Phase::Status } else { Phase::DataIn }
            }
            ScsiCmdResult::DataOut(len) => {
                n.status = STATUS_GOOD;
                n.data_out.clear();
                n.data_out_len = len;
                if len == 0 { Phase::Status } else { Phase::DataOut }
            }
        };
        if slot.behaviour.disconnect_after_command && n.may_disconnect && phase != Phase::Status {
            n.resume = phase;
            n.send_messages(&[MSG_DISCONNECT], Next::Disconnect);
        } else {
            n.phase = phase;
        }
        Ok(())
    }

    fn finish_data_out(&mut self) -> Result<()> {
        let Some(n) = self.nexus.as_mut() else {
            return Ok(());
        };
        let Some(slot) = self.targets[usize::from(n.target)].as_mut() else {
            bail!("Nexus without target {}", n.target);
        };
        let data = std::mem::take(&mut n.data_out);
        n.status = match slot.dev.cmd(&n.cdb, Some(&data))? {
            ScsiCmdResult::Status(s) => s,
            r => bail!("Target {} answered data out with {:?}", n.target, r),
        };
        n.phase = Phase::Status;
        Ok(())
    }

    /// SCSI bus reset: every target drops what it was doing and forgets
    /// its transfer agreements
    pub fn reset(&mut self) {
        debug!(
            "SCSI bus reset, {} connected, {} disconnected",
            self.nexus.is_some() as usize,
            self.parked.len()
        );
        self.nexus = None;
        self.parked.clear();
        self.atn = false;
        self.ack = false;
        self.unexpected_free = false;
        for slot in self.targets.iter_mut().flatten() {
            slot.stats.agreement = None;
            slot.stats.width = 0;
            slot.initiated = false;
        }
    }

    /// The initiator went away mid-connection, the connected target gives
    /// up on its command
    pub fn drop_initiator(&mut self) {
        if let Some(n) = self.nexus.take() {
            debug!("Target {} lun {} lost its initiator", n.target, n.lun);
        }
        self.atn = false;
        self.ack = false;
    }

    pub fn tick(&mut self) {
        for p in &mut self.parked {
            p.delay = p.delay.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::disk::ScsiTargetDisk;

    fn bus(behaviour: TargetBehaviour) -> ScsiBus {
        let mut bus = ScsiBus::new();
        bus.attach_target(2, Box::new(ScsiTargetDisk::new(16)), behaviour)
            .unwrap();
        bus
    }

    fn identify_and_command(bus: &mut ScsiBus, cdb: &[u8]) {
        assert!(bus.select(2, true));
        let t = bus.send(Phase::MsgOut, &[MSG_IDENTIFY | MSG_IDENTIFY_DISCONNECT], 0).unwrap();
        assert_eq!(t.moved, 1);
        bus.end_message_out().unwrap();
        assert_eq!(bus.phase(), Some(Phase::Command));
        assert_eq!(bus.send(Phase::Command, cdb, 0).unwrap().moved, cdb.len());
    }

    #[test]
    fn absent_target_does_not_answer() {
        let mut bus = bus(TargetBehaviour::default());
        assert!(!bus.select(3, true));
        assert!(!bus.connected());
    }

    #[test]
    fn inquiry_sequence() {
        let mut bus = bus(TargetBehaviour::default());
        identify_and_command(&mut bus, &[0x12, 0, 0, 0, 36, 0]);
        assert_eq!(bus.phase(), Some(Phase::DataIn));

        let mut data = [0; 36];
        assert_eq!(bus.receive(Phase::DataIn, &mut data, 0).unwrap().moved, 36);
        assert_eq!(&data[8..14], b"NCRSIM");
        assert_eq!(bus.phase(), Some(Phase::Status));

        let mut status = [0xFF];
        bus.receive(Phase::Status, &mut status, 0).unwrap();
        assert_eq!(status[0], STATUS_GOOD);
        let mut msg = [0xFF];
        bus.receive(Phase::MsgIn, &mut msg, 0).unwrap();
        assert_eq!(msg[0], MSG_COMMAND_COMPLETE);

        // Bus free only once ACK drops
        assert!(bus.connected());
        bus.release_ack();
        assert!(!bus.connected());
        assert!(!bus.take_unexpected_free());
    }

    #[test]
    fn short_read_stops_at_phase_change() {
        let mut bus = bus(TargetBehaviour::default());
        identify_and_command(&mut bus, &[0x12, 0, 0, 0, 8, 0]);
        let mut data = [0; 36];
        let t = bus.receive(Phase::DataIn, &mut data, 0).unwrap();
        assert_eq!(t.moved, 8);
        assert_eq!(bus.phase(), Some(Phase::Status));
    }

    #[test]
    fn disconnect_mid_data_and_reselect() {
        let mut bus = bus(TargetBehaviour {
            disconnect_after_bytes: Some(512),
            reselect_delay: 3,
            ..Default::default()
        });
        identify_and_command(&mut bus, &[0x28, 0, 0, 0, 0, 0, 0, 0, 2, 0]);
        let mut data = vec![0; 1024];
        let t = bus.receive(Phase::DataIn, &mut data, 0).unwrap();
        assert_eq!(t.moved, 512);
        assert_eq!(bus.phase(), Some(Phase::MsgIn));

        let mut msg = [0; 1];
        bus.receive(Phase::MsgIn, &mut msg, 0).unwrap();
        assert_eq!(msg[0], MSG_SAVE_DATA_POINTERS);
        bus.release_ack();
        bus.receive(Phase::MsgIn, &mut msg, 0).unwrap();
        assert_eq!(msg[0], MSG_DISCONNECT);
        bus.release_ack();
        assert!(!bus.connected());
        assert!(bus.is_busy());

        assert!(!bus.reselection_pending());
        for _ in 0..3 {
            bus.tick();
        }
        assert_eq!(bus.take_reselection(), Some((2, 0)));
        bus.receive(Phase::MsgIn, &mut msg, 0).unwrap();
        assert_eq!(msg[0], MSG_IDENTIFY);
        bus.release_ack();
        assert_eq!(bus.phase(), Some(Phase::DataIn));
        let t = bus.receive(Phase::DataIn, &mut data[512..], 0).unwrap();
        assert_eq!(t.moved, 512);
        assert_eq!(bus.target_stats(2).unwrap().reselections, 1);
    }

    #[test]
    fn sdtr_answered_within_limits() {
        let mut bus = bus(TargetBehaviour {
            sync: Some(SyncCapability {
                min_period: 50,
                max_offset: 4,
            }),
            ..Default::default()
        });
        assert!(bus.select(2, true));
        bus.send(
            Phase::MsgOut,
            &[MSG_IDENTIFY, MSG_EXTENDED, 3, EXTENDED_SDTR, 25, 8],
            0,
        )
        .unwrap();
        bus.end_message_out().unwrap();
        let mut msg = [0; 5];
        assert_eq!(bus.receive(Phase::MsgIn, &mut msg, 0).unwrap().moved, 5);
        assert_eq!(msg, [MSG_EXTENDED, 3, EXTENDED_SDTR, 50, 4]);
        bus.release_ack();
        assert_eq!(bus.phase(), Some(Phase::Command));
        assert_eq!(bus.target_stats(2).unwrap().agreement, Some((50, 4)));
    }

    #[test]
    fn atn_leads_to_abort() {
        let mut bus = bus(TargetBehaviour::default());
        identify_and_command(&mut bus, &[0x08, 0, 0, 0, 1, 0]);
        bus.set_atn(true);
        assert_eq!(bus.phase(), Some(Phase::MsgOut));
        bus.send(Phase::MsgOut, &[MSG_ABORT], 0).unwrap();
        bus.end_message_out().unwrap();
        assert!(!bus.connected());
        assert!(!bus.take_unexpected_free());
        assert_eq!(bus.target_stats(2).unwrap().aborts, 1);
    }

    #[test]
    fn dropping_target_is_unexpected() {
        let mut bus = bus(TargetBehaviour {
            drop_after_command: true,
            ..Default::default()
        });
        identify_and_command(&mut bus, &[0x00, 0, 0, 0, 0, 0]);
        assert!(!bus.connected());
        assert!(bus.take_unexpected_free());
    }

    #[test]
    fn parity_error_reported_once() {
        let mut bus = bus(TargetBehaviour {
            parity_error_after_bytes: Some(10),
            ..Default::default()
        });
        identify_and_command(&mut bus, &[0x08, 0, 0, 0, 1, 0]);
        let mut data = vec![0; 512];
        let t = bus.receive(Phase::DataIn, &mut data, 0).unwrap();
        assert_eq!(t, Transfer { moved: 10, parity_error: true });
        let t = bus.receive(Phase::DataIn, &mut data[10..], 0).unwrap();
        assert_eq!(t, Transfer { moved: 502, parity_error: false });
    }
}
