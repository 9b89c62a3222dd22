use super::*;
use crate::bus::arena::DmaArena;
use crate::ncr::command::HostStatus;
use crate::ncr::error::DriverError;
use crate::ncr::regs::{STATUS_CHECK_CONDITION, STATUS_GOOD};
use crate::sim::target::{ASC_LBA_OUT_OF_RANGE, SENSE_ILLEGAL_REQUEST};

fn seg(addr: BusAddr, len: usize) -> SgSegment {
    SgSegment {
        addr,
        len: len as u32,
    }
}

#[test]
fn write_then_read_back() {
    let mut rig = Rig::with_targets(vec![disk(0)]);
    let data = pattern(2 * BLOCK, 7);
    let a = rig.buffer(&data[..BLOCK]);
    let b = rig.buffer(&data[BLOCK..]);
    let write = rig.submit(0, &write10(4, 2), vec![seg(a, BLOCK), seg(b, BLOCK)]);
    rig.settle();
    let result = rig.result(write);
    assert_eq!(result.host, HostStatus::Ok);
    assert_eq!(result.status, STATUS_GOOD);
    assert_eq!(rig.disk_contents(0, 4, 2), data);

    // Read back through segments that do not follow block boundaries
    let c = rig.buffer(&[0; 100]);
    let d = rig.buffer(&vec![0; 2 * BLOCK - 100]);
    let read = rig.submit(0, &read10(4, 2), vec![seg(c, 100), seg(d, 2 * BLOCK - 100)]);
    rig.settle();
    assert_eq!(rig.result(read).status, STATUS_GOOD);
    let mut back = rig.read(c, 100);
    back.extend(rig.read(d, 2 * BLOCK - 100));
    assert_eq!(back, data);

    let stats = rig.host.stats();
    assert_eq!(stats.queued, 2);
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.phase_mismatches, 0);
}

#[test]
fn short_data_phase_completes() {
    let mut rig = Rig::with_targets(vec![disk(0)]);
    // INQUIRY returns fewer bytes than the buffer holds
    let buf = rig.buffer(&[0xEE; 96]);
    let serial = rig.submit(0, &[0x12, 0, 0, 0, 36, 0], vec![seg(buf, 96)]);
    rig.settle();
    assert_eq!(rig.result(serial).status, STATUS_GOOD);
    let data = rig.read(buf, 96);
    assert_eq!(&data[8..14], b"NCRSIM");
    assert_eq!(data[36], 0xEE);
}

#[test]
fn check_condition_fetches_sense() {
    let mut rig = Rig::with_targets(vec![disk(0)]);
    let buf = rig.buffer(&[0; BLOCK]);
    let serial = rig.submit(0, &read10(1000, 1), vec![seg(buf, BLOCK)]);
    rig.settle();

    let result = rig.result(serial);
    assert_eq!(result.host, HostStatus::Ok);
    assert_eq!(result.status, STATUS_CHECK_CONDITION);
    let sense = result.sense.expect("sense data");
    assert_eq!(sense[0] & 0x7F, 0x70);
    assert_eq!(sense[2] & 0x0F, SENSE_ILLEGAL_REQUEST);
    assert_eq!(u16::from_be_bytes([sense[12], sense[13]]), ASC_LBA_OUT_OF_RANGE);
    assert_eq!(rig.host.stats().sense, 1);

    // The unit works normally afterwards
    let next = rig.submit(0, &read10(0, 1), vec![seg(buf, BLOCK)]);
    rig.settle();
    let result = rig.result(next);
    assert_eq!(result.status, STATUS_GOOD);
    assert!(result.sense.is_none());
}

#[test]
fn same_lun_is_soft_queued() {
    let mut rig = Rig::with_targets(vec![disk(0)]);
    let serials: Vec<u64> = (0..3)
        .map(|_| rig.submit(0, &test_unit_ready(), vec![]))
        .collect();
    assert_eq!(rig.host.soft_queued(), 2);
    assert_eq!(rig.host.issue_queue().len(), 1);
    rig.settle();

    assert_eq!(rig.order(), serials);
    for s in serials {
        assert_eq!(rig.result(s).host, HostStatus::Ok);
    }
    assert_eq!(rig.host.stats().soft_queued, 2);
    assert_eq!(rig.host.soft_queued(), 0);
}

#[test]
fn different_targets_queue_on_chip() {
    let mut rig = Rig::with_targets(vec![disk(0), disk(1), disk(2)]);
    let serials: Vec<u64> = (0..3)
        .map(|t| rig.submit(t, &test_unit_ready(), vec![]))
        .collect();
    assert_eq!(rig.host.soft_queued(), 0);
    assert_eq!(rig.host.issue_queue().len(), 3);
    rig.settle();
    for s in serials {
        assert_eq!(rig.result(s).host, HostStatus::Ok);
    }
    assert!(rig.host.issue_queue().is_empty());
}

#[test]
fn queue_full_hands_command_back() {
    let config = HostConfig {
        can_queue: 2,
        ..Default::default()
    };
    let mut rig = Rig::new(machine(vec![disk(0), disk(1), disk(2)]), config);
    rig.submit(0, &test_unit_ready(), vec![]);
    rig.submit(1, &test_unit_ready(), vec![]);
    let Err(SubmitError::QueueFull(cmd)) = rig.try_submit(2, &test_unit_ready(), vec![]) else {
        panic!("third command accepted");
    };
    assert_eq!(cmd.target, 2);
    rig.settle();

    // Retried once descriptors are free again
    let retry = rig.host.submit(*cmd);
    assert!(retry.is_ok());
    rig.settle();
    assert_eq!(rig.done.lock().unwrap().len(), 3);
}

#[test]
fn malformed_commands_rejected() {
    let mut rig = Rig::with_targets(vec![disk(0)]);
    let buf = rig.buffer(&[0; 16]);
    let cases = [
        rig.command(7, &test_unit_ready(), vec![]),
        rig.command(0, &[0x00, 0, 0], vec![]),
        rig.command(0, &read10(0, 1), vec![seg(buf, 0)]),
        rig.command(0, &read10(0, 1), vec![seg(buf, 16); 17]),
    ];
    for cmd in cases {
        let serial = cmd.serial;
        match rig.host.submit(cmd) {
            Err(SubmitError::Rejected(cmd, DriverError::InvalidCommand(_))) => {
                assert_eq!(cmd.serial, serial)
            }
            other => panic!("#{} not rejected: {:?}", serial, other),
        }
    }
    assert_eq!(rig.host.outstanding(), 0);
    assert_eq!(rig.host.stats().queued, 0);
}

#[test]
fn disconnect_and_reselect() {
    let behaviour = TargetBehaviour {
        disconnect_after_command: true,
        reselect_delay: 300,
        ..Default::default()
    };
    let mut rig = Rig::with_targets(vec![disk_with(0, behaviour)]);
    let data = pattern(BLOCK, 11);
    rig.preload(0, 2, &data);
    let buf = rig.buffer(&[0; BLOCK]);
    let serial = rig.submit(0, &read10(2, 1), vec![seg(buf, BLOCK)]);

    rig.run_until("disconnect", |r| r.host.stats().disconnects == 1);
    assert_eq!(rig.host.reconnect_queue().len(), 1);
    assert_eq!(rig.completions(serial), 0);

    rig.settle();
    assert_eq!(rig.result(serial).status, STATUS_GOOD);
    assert_eq!(rig.read(buf, BLOCK), data);
    assert_eq!(rig.host.stats().reselects, 1);
    assert!(rig.host.reconnect_queue().is_empty());
    let target = rig.host.platform().scsi_bus().target_stats(0).unwrap();
    assert_eq!(target.disconnects, 1);
    assert_eq!(target.reselections, 1);
}

#[test]
fn disconnect_disabled_by_config() {
    let behaviour = TargetBehaviour {
        disconnect_after_command: true,
        reselect_delay: 300,
        ..Default::default()
    };
    let config = HostConfig {
        disconnect: false,
        ..Default::default()
    };
    let mut rig = Rig::new(machine(vec![disk_with(0, behaviour)]), config);
    let buf = rig.buffer(&[0; BLOCK]);
    let serial = rig.submit(0, &read10(0, 1), vec![seg(buf, BLOCK)]);
    rig.settle();
    assert_eq!(rig.result(serial).status, STATUS_GOOD);
    assert_eq!(rig.host.stats().disconnects, 0);
    let target = rig.host.platform().scsi_bus().target_stats(0).unwrap();
    assert_eq!(target.disconnects, 0);
}

#[test]
fn save_data_pointers_mid_transfer() {
    let behaviour = TargetBehaviour {
        disconnect_after_bytes: Some(BLOCK + 100),
        reselect_delay: 200,
        ..Default::default()
    };
    let mut rig = Rig::with_targets(vec![disk_with(0, behaviour)]);
    let data = pattern(4 * BLOCK, 5);
    rig.preload(0, 8, &data);
    let buf = rig.buffer(&vec![0; 4 * BLOCK]);
    let serial = rig.submit(0, &read10(8, 4), vec![seg(buf, 4 * BLOCK)]);
    rig.settle();

    assert_eq!(rig.result(serial).status, STATUS_GOOD);
    assert_eq!(rig.read(buf, 4 * BLOCK), data);
    let stats = rig.host.stats();
    assert!(stats.phase_mismatches >= 1);
    assert!(stats.disconnects >= 1);
    assert_eq!(stats.disconnects, stats.reselects);
}

#[test]
fn write_survives_disconnect() {
    let behaviour = TargetBehaviour {
        disconnect_after_bytes: Some(300),
        reselect_delay: 150,
        ..Default::default()
    };
    let mut rig = Rig::with_targets(vec![disk_with(0, behaviour)]);
    let data = pattern(2 * BLOCK, 9);
    let a = rig.buffer(&data[..BLOCK]);
    let b = rig.buffer(&data[BLOCK..]);
    let serial = rig.submit(0, &write10(1, 2), vec![seg(a, BLOCK), seg(b, BLOCK)]);
    rig.settle();
    assert_eq!(rig.result(serial).status, STATUS_GOOD);
    assert_eq!(rig.disk_contents(0, 1, 2), data);
}

#[test]
fn other_target_runs_while_one_is_disconnected() {
    let slow = TargetBehaviour {
        disconnect_after_command: true,
        reselect_delay: 20_000,
        ..Default::default()
    };
    let mut rig = Rig::with_targets(vec![disk_with(0, slow), disk(1)]);
    let buf = rig.buffer(&[0; BLOCK]);
    let first = rig.submit(0, &read10(0, 1), vec![seg(buf, BLOCK)]);
    let second = rig.submit(1, &test_unit_ready(), vec![]);
    rig.settle();
    assert_eq!(rig.order(), vec![second, first]);
    assert_eq!(rig.result(first).status, STATUS_GOOD);
    assert_eq!(rig.result(second).status, STATUS_GOOD);
}

#[test]
fn append_racing_the_scheduler_is_retried() {
    let mut rig = Rig::with_targets(vec![disk(0), disk(1)]);
    let first = rig.submit(0, &test_unit_ready(), vec![]);
    let id = rig.host.pool.find_serial(first).unwrap();
    let (base, link) = {
        let d = rig.host.pool.get(id);
        (d.base, d.next_link())
    };

    // Stop right before the chip dequeues the descriptor
    rig.tick_until("dequeue", |r| r.host.platform().chip().dsp() == base + 16);

    // Make the chip appear to consume the old tail while the host links
    // the next descriptor behind it
    let head = rig.host.queues.issue_head;
    rig.host.platform_mut().memory_mut().watch(
        link,
        true,
        Box::new(move |mem: &mut DmaArena, _: BusAddr| mem.write_u32(head, 0).unwrap()),
    );
    let second = rig.submit(1, &test_unit_ready(), vec![]);
    assert_eq!(rig.host.stats().enqueue_retries, 1);

    rig.settle();
    assert_eq!(rig.result(first).host, HostStatus::Ok);
    assert_eq!(rig.result(second).host, HostStatus::Ok);
    let bus = rig.host.platform().scsi_bus();
    assert_eq!(bus.target_stats(0).unwrap().commands, 1);
    assert_eq!(bus.target_stats(1).unwrap().commands, 1);
}

#[test]
fn completions_on_the_fly() {
    let mut rig = Rig::with_targets(vec![disk(0)]);
    let serial = rig.submit(0, &test_unit_ready(), vec![]);
    rig.settle();
    assert_eq!(rig.result(serial).host, HostStatus::Ok);
    assert!(rig.host.stats().intfly >= 1);
}

#[test]
fn completions_by_interrupt_without_intfly() {
    let config = HostConfig {
        intfly: false,
        ..Default::default()
    };
    let mut rig = Rig::new(machine(vec![disk(0)]), config);
    let serials: Vec<u64> = (0..2)
        .map(|_| rig.submit(0, &test_unit_ready(), vec![]))
        .collect();
    rig.settle();
    for s in serials {
        assert_eq!(rig.result(s).host, HostStatus::Ok);
    }
    assert_eq!(rig.host.stats().intfly, 0);
    assert_eq!(rig.host.platform().chip().stats().intfly, 0);
}
