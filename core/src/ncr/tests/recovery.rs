use super::*;
use crate::ncr::command::{AbortOutcome, HostStatus};
use crate::ncr::host::HostState;
use crate::ncr::regs::STATUS_GOOD;
use crate::sim::chip::DmaFault;

fn seg(addr: BusAddr, len: usize) -> SgSegment {
    SgSegment {
        addr,
        len: len as u32,
    }
}

fn parked(delay: u64) -> TargetBehaviour {
    TargetBehaviour {
        disconnect_after_command: true,
        reselect_delay: delay,
        ..Default::default()
    }
}

#[test]
fn missing_target_times_out() {
    let mut rig = Rig::with_targets(vec![disk(0)]);
    let serial = rig.submit(3, &test_unit_ready(), vec![]);
    rig.settle();
    assert_eq!(rig.result(serial).host, HostStatus::BadTarget);
    assert_eq!(rig.host.platform().chip().stats().selection_timeouts, 1);

    // The scheduler carries on
    let next = rig.submit(0, &test_unit_ready(), vec![]);
    rig.settle();
    assert_eq!(rig.result(next).host, HostStatus::Ok);
}

#[test]
fn illegal_instruction_during_selection_ignored() {
    let mut m = machine(vec![disk(0)]);
    m.sto_iid_race = true;
    let mut rig = Rig::new(m, HostConfig::default());
    let serial = rig.submit(5, &test_unit_ready(), vec![]);
    let next = rig.submit(0, &test_unit_ready(), vec![]);
    rig.settle();
    assert_eq!(rig.result(serial).host, HostStatus::BadTarget);
    assert_eq!(rig.result(next).host, HostStatus::Ok);
    assert_eq!(rig.host.stats().fatal, 0);
}

#[test]
fn bus_reset_fails_everything_once() {
    let mut rig = Rig::with_targets(vec![disk_with(0, parked(1_000_000)), disk(1)]);
    let buf = rig.buffer(&[0; BLOCK]);
    let disconnected = rig.submit(0, &read10(0, 1), vec![seg(buf, BLOCK)]);
    let queued = rig.submit(0, &test_unit_ready(), vec![]);
    rig.run_until("disconnect", |r| r.host.stats().disconnects == 1);
    assert_eq!(rig.host.soft_queued(), 1);

    rig.host.bus_reset();
    assert_eq!(rig.result(disconnected).host, HostStatus::Reset);
    assert_eq!(rig.result(queued).host, HostStatus::Reset);
    assert_eq!(rig.host.outstanding(), 0);
    assert_eq!(rig.host.stats().resets, 1);
    assert!(!rig.host.platform().scsi_bus().is_busy());

    // Nothing completes twice once the chip runs again
    let after = rig.submit(1, &test_unit_ready(), vec![]);
    rig.settle();
    assert_eq!(rig.result(after).host, HostStatus::Ok);
    assert_eq!(rig.completions(disconnected), 1);
    assert_eq!(rig.completions(queued), 1);
}

#[test]
fn reset_entry_point() {
    let mut rig = Rig::with_targets(vec![disk(0)]);
    assert!(rig.host.reset());
    assert_eq!(rig.host.stats().resets, 1);
    let serial = rig.submit(0, &test_unit_ready(), vec![]);
    rig.settle();
    assert_eq!(rig.result(serial).host, HostStatus::Ok);
}

#[test]
fn abort_soft_queued() {
    let mut rig = Rig::with_targets(vec![disk(0)]);
    let first = rig.submit(0, &test_unit_ready(), vec![]);
    let second = rig.submit(0, &test_unit_ready(), vec![]);
    assert_eq!(rig.host.abort(second), AbortOutcome::Success);
    assert_eq!(rig.result(second).host, HostStatus::Aborted);
    assert_eq!(rig.host.soft_queued(), 0);
    assert_eq!(rig.host.abort(second), AbortOutcome::NotFound);

    rig.settle();
    assert_eq!(rig.result(first).host, HostStatus::Ok);
    assert_eq!(rig.host.stats().aborts, 1);
}

#[test]
fn abort_unknown_serial() {
    let mut rig = Rig::with_targets(vec![disk(0)]);
    assert_eq!(rig.host.abort(42), AbortOutcome::NotFound);
}

#[test]
fn abort_refused_while_the_chip_owns_it() {
    let mut rig = Rig::with_targets(vec![disk_with(0, parked(2_000)), disk(1)]);
    let buf = rig.buffer(&[0; BLOCK]);
    let waiting = rig.submit(0, &read10(0, 1), vec![seg(buf, BLOCK)]);
    let issued = rig.submit(1, &test_unit_ready(), vec![]);
    // Still on the issue queue
    assert_eq!(rig.host.abort(issued), AbortOutcome::Busy);

    rig.run_until("disconnect", |r| r.host.stats().disconnects == 1);
    // On the reconnect queue
    assert_eq!(rig.host.abort(waiting), AbortOutcome::Busy);

    rig.settle();
    assert_eq!(rig.result(waiting).host, HostStatus::Ok);
    assert_eq!(rig.result(issued).host, HostStatus::Ok);
    assert_eq!(rig.host.stats().aborts, 0);
}

#[test]
fn abort_reclaims_lost_completion() {
    // No negotiation, so nothing stops the chip along the way
    let config = HostConfig {
        sync_negotiation: false,
        ..Default::default()
    };
    let mut rig = Rig::new(machine(vec![disk(0)]), config);
    let serial = rig.submit(0, &test_unit_ready(), vec![]);

    // Let the command finish without ever servicing the interrupt line
    rig.tick_until("completion on the fly", |r| {
        let m = r.host.platform();
        m.irq_pending() && m.chip().is_idle() && !m.scsi_bus().is_busy()
    });
    assert_eq!(rig.completions(serial), 0);

    assert_eq!(rig.host.abort(serial), AbortOutcome::Success);
    let result = rig.result(serial);
    assert_eq!(result.host, HostStatus::Ok);
    assert_eq!(result.status, STATUS_GOOD);
    assert_eq!(rig.host.stats().lost_interrupts, 1);

    // The late interrupt finds nothing left to complete
    rig.settle();
    assert_eq!(rig.completions(serial), 1);
}

#[test]
fn abort_refused_between_status_and_completion_interrupt() {
    let config = HostConfig {
        sync_negotiation: false,
        intfly: false,
        ..Default::default()
    };
    let mut rig = Rig::new(machine(vec![disk(0), disk(1)]), config);
    let serial = rig.submit(0, &test_unit_ready(), vec![]);
    let id = rig.host.pool.find_serial(serial).unwrap();
    let stored = |r: &Rig| {
        let result = r.host.pool.get(id).read_result(r.host.platform().memory());
        result.unwrap().is_some()
    };

    // Status and message are in, the target still holds the bus
    rig.tick_until("status stored", |r| stored(r));
    assert!(rig.host.platform().scsi_bus().connected());
    assert_eq!(rig.host.abort(serial), AbortOutcome::Busy);

    // Stopped on the completion interrupt, nobody serviced it yet
    rig.tick_until("completion interrupt", |r| r.host.platform().chip().is_halted());
    assert!(!rig.host.platform().scsi_bus().connected());
    assert_eq!(rig.host.abort(serial), AbortOutcome::Busy);

    // The descriptor is not handed out again while the chip points at it
    let next = rig.submit(1, &test_unit_ready(), vec![]);
    assert_ne!(rig.host.pool.find_serial(next), Some(id));
    rig.settle();
    assert_eq!(rig.result(serial).host, HostStatus::Ok);
    assert_eq!(rig.result(next).host, HostStatus::Ok);
    assert_eq!(rig.host.stats().lost_interrupts, 0);
}

#[test]
fn host_parity_error_reinitializes() {
    let mut rig = Rig::with_targets(vec![disk(0)]);
    let buf = rig.buffer(&[0; BLOCK]);
    let inflight = rig.submit(0, &read10(0, 1), vec![seg(buf, BLOCK)]);
    let queued = rig.submit(0, &test_unit_ready(), vec![]);
    rig.tick_until("selection", |r| r.host.platform().scsi_bus().connected());
    rig.host.platform_mut().inject_dma_fault(DmaFault::Parity);
    rig.settle();

    assert_eq!(rig.result(inflight).host, HostStatus::Reset);
    // Software queued commands survive the reinitialization
    assert_eq!(rig.result(queued).host, HostStatus::Ok);
    assert_eq!(rig.host.stats().fatal, 1);

    let after = rig.submit(0, &read10(0, 1), vec![seg(buf, BLOCK)]);
    rig.settle();
    assert_eq!(rig.result(after).status, STATUS_GOOD);
}

#[test]
fn host_bus_fault_reinitializes() {
    let mut rig = Rig::with_targets(vec![disk(0)]);
    let serial = rig.submit(0, &test_unit_ready(), vec![]);
    rig.host.platform_mut().inject_dma_fault(DmaFault::BusFault);
    rig.run_until("fatal interrupt", |r| r.host.stats().fatal == 1);

    // Running again from clean queues
    assert_eq!(rig.host.state(), HostState::Running);
    assert!(rig.host.issue_queue().is_empty());
    assert!(rig.host.reconnect_queue().is_empty());
    assert_eq!(rig.host.outstanding(), 0);
    assert_eq!(rig.result(serial).host, HostStatus::Reset);

    let next = rig.submit(0, &test_unit_ready(), vec![]);
    rig.settle();
    assert_eq!(rig.result(next).host, HostStatus::Ok);
    assert_eq!(rig.host.stats().fatal, 1);
}

#[test]
fn external_bus_reset_fails_commands() {
    let mut rig = Rig::with_targets(vec![disk_with(0, parked(1_000_000))]);
    let buf = rig.buffer(&[0; BLOCK]);
    let serial = rig.submit(0, &read10(0, 1), vec![seg(buf, BLOCK)]);
    rig.run_until("disconnect", |r| r.host.stats().disconnects == 1);
    rig.host.platform_mut().inject_bus_reset();
    rig.settle();
    assert_eq!(rig.result(serial).host, HostStatus::Reset);
    assert!(rig.host.stats().fatal >= 1);
}

#[test]
fn unexpected_disconnect_fails_command() {
    let dropper = TargetBehaviour {
        drop_after_command: true,
        ..Default::default()
    };
    let mut rig = Rig::with_targets(vec![disk_with(0, dropper), disk(1)]);
    let serial = rig.submit(0, &test_unit_ready(), vec![]);
    let next = rig.submit(1, &test_unit_ready(), vec![]);
    rig.settle();
    assert_eq!(rig.result(serial).host, HostStatus::Error);
    assert_eq!(rig.result(next).host, HostStatus::Ok);
}

#[test]
fn scsi_parity_error_aborts_command() {
    let noisy = TargetBehaviour {
        parity_error_after_bytes: Some(10),
        ..Default::default()
    };
    let mut rig = Rig::with_targets(vec![disk_with(0, noisy)]);
    let buf = rig.buffer(&[0; BLOCK]);
    let serial = rig.submit(0, &read10(0, 1), vec![seg(buf, BLOCK)]);
    rig.settle();
    assert_eq!(rig.result(serial).host, HostStatus::Parity);
    assert_eq!(rig.host.platform().scsi_bus().target_stats(0).unwrap().aborts, 1);

    // Only the first transfer is corrupted
    let again = rig.submit(0, &read10(0, 1), vec![seg(buf, BLOCK)]);
    rig.settle();
    assert_eq!(rig.result(again).host, HostStatus::Ok);
}
