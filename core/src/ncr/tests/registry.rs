use super::*;
use crate::ncr::command::HostStatus;
use crate::ncr::error::DriverError;
use crate::ncr::registry::{AdapterRegistry, SharedAdapter};

fn adapter(targets: Vec<TargetConfig>) -> (HostAdapter<SimMachine>, Done) {
    let Rig { host, done, .. } = Rig::with_targets(targets);
    (host, done)
}

#[test]
fn shared_line_services_every_adapter() {
    let mut registry = AdapterRegistry::new();
    let (a, done_a) = adapter(vec![disk(0)]);
    let (b, done_b) = adapter(vec![disk(0)]);
    assert_eq!(a.irq(), b.irq());
    let irq = a.irq();
    let a = registry.register(a);
    let b = registry.register(b);
    assert_eq!(registry.len(), 2);

    b.lock()
        .unwrap()
        .submit(ScsiCommand::new(1, 0, 0, &test_unit_ready(), vec![]).unwrap())
        .unwrap();
    for _ in 0..5000 {
        let mut pending = false;
        for host in [&a, &b] {
            let mut host = host.lock().unwrap();
            host.platform_mut().tick(64).unwrap();
            pending |= host.platform().irq_pending();
        }
        if pending {
            assert!(registry.handle_irq(irq));
        }
        if !done_b.lock().unwrap().is_empty() {
            break;
        }
    }

    let done = done_b.lock().unwrap();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].1.host, HostStatus::Ok);
    assert!(done_a.lock().unwrap().is_empty());
    assert!(!registry.handle_irq(irq));
    assert!(!registry.handle_irq(irq + 1));
}

#[test]
fn unregister_waits_for_last_reference() {
    let mut registry = AdapterRegistry::new();
    let (host, _) = adapter(vec![]);
    let shared = registry.register(host);
    let extra = Arc::clone(&shared);

    let Err(shared) = registry.unregister(shared) else {
        panic!("unregistered while still referenced");
    };
    assert_eq!(registry.len(), 1);

    drop(extra);
    let Ok(sim) = registry.unregister(shared) else {
        panic!("adapter still referenced");
    };
    assert!(registry.is_empty());
    assert_eq!(sim.memory().allocations(), 0);
}

fn attach_to(
    registry: &mut AdapterRegistry<SimMachine>,
    config: HostConfig,
) -> Result<SharedAdapter<SimMachine>, AttachError<SimMachine>> {
    let sim = SimMachine::new(&machine(vec![disk(0)])).unwrap();
    let probe = sim.probe();
    let (_, done) = recorder();
    registry.attach(sim, probe, config, done)
}

#[test]
fn registry_names_adapters() {
    let mut registry = AdapterRegistry::new();
    let first = attach_to(&mut registry, HostConfig::default()).unwrap();

    let broken = HostConfig {
        can_queue: 0,
        ..Default::default()
    };
    match attach_to(&mut registry, broken) {
        Err(e) => assert!(matches!(e.error, DriverError::InvalidOption(_))),
        Ok(_) => panic!("attach succeeded"),
    }
    assert_eq!(registry.len(), 1);

    let second = attach_to(&mut registry, HostConfig::default()).unwrap();
    assert_eq!(first.lock().unwrap().name(), "scsi0");
    assert_eq!(second.lock().unwrap().name(), "scsi1");
    assert_eq!(registry.len(), 2);
}
