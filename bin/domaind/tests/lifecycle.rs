// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end lifecycle tests: the engine running against the
//! simulated hypervisor, control tree, broker and storage daemon, with
//! a shell script standing in for the builder helper.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use domaind::broker::{BrokerHandle, SimBroker};
use domaind::config::{Config, Timeouts};
use domaind::devices::dm::DeviceModel;
use domaind::devices::DeviceSupervisor;
use domaind::hyperctl::sim::SimHypervisor;
use domaind::storage::SimStorage;
use domaind::store::memory::MemoryTree;
use domaind::store::{ControlTree, TX_NONE};
use domaind::updates::UpdateBus;
use domaind::vm::extra::{ExtraStore, VmExtra};
use domaind::vm::{Deps, Engine};

use domaind_api_types::{
    BootConfig, CreateInfo, DirectBoot, Error, HvmBoot, MemoryConfig,
    ShutdownReason, Update, VmConfig, VmId,
};

const MIB: u64 = 1 << 20;

/// A stand-in builder helper covering all three modes.
const FAKE_HELPER: &str = r#"#!/bin/sh
mode=""
while [ $# -gt 0 ]; do
  case "$1" in
    -mode) mode="$2"; shift 2 ;;
    *) shift ;;
  esac
done
case "$mode" in
  build|hvm_build)
    echo "progress 50" >&2
    echo "result 1234 5678 x86_64-abi"
    ;;
  save|hvm_save)
    echo "suspend"
    read _ack
    echo "result saved"
    ;;
  restore|hvm_restore)
    echo "result 4321 8765"
    ;;
esac
"#;

struct Harness {
    engine: Arc<Engine>,
    tree: MemoryTree,
    hyper: SimHypervisor,
    broker: SimBroker,
    #[allow(dead_code)]
    storage: SimStorage,
    _dir: tempfile::TempDir,
}

fn test_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let helper = dir.path().join("fake-helper");
    std::fs::write(&helper, FAKE_HELPER).unwrap();
    std::fs::set_permissions(
        &helper,
        std::fs::Permissions::from_mode(0o755),
    )
    .unwrap();

    let config = Arc::new(Config {
        state_root: dir.path().join("state"),
        helper_path: helper,
        device_model_path: "/bin/true".into(),
        pv_console_path: "/bin/true".into(),
        bootloaders: BTreeMap::new(),
        store_socket: "/nonexistent".into(),
        broker_socket: "/nonexistent".into(),
        storage_socket: "/nonexistent".into(),
        strict_keys: false,
        timeouts: Timeouts {
            destroy_budget_ms: 200,
            destroy_poll_interval_ms: 50,
            suspend_wait_ms: 5_000,
            suspend_ack_ms: 2_000,
            backend_shutdown_ms: 500,
            event_poll_interval_ms: 50,
            dm_stop_grace_ms: 100,
        },
    });

    let log = test_logger();
    let tree = MemoryTree::new();
    let hyper = SimHypervisor::new();
    let broker = SimBroker::new(8 << 30);
    let storage = SimStorage::new();

    let dm = DeviceModel::new(
        config.device_model_path.clone(),
        config.pv_console_path.clone(),
        config.timeouts.dm_stop_grace(),
        log.clone(),
    );
    let devices = Arc::new(DeviceSupervisor::new(
        Arc::new(tree.clone()),
        Arc::new(hyper.clone()),
        dm,
        config.timeouts.clone(),
        config.strict_keys,
        log.clone(),
    ));
    let broker_handle = Arc::new(
        BrokerHandle::new(Arc::new(broker.clone()), log.clone()).with_retry(
            Duration::from_millis(5),
            Duration::from_millis(50),
        ),
    );

    let engine = Engine::new(Deps {
        tree: Arc::new(tree.clone()),
        hyper: Arc::new(hyper.clone()),
        broker: broker_handle,
        storage: Arc::new(storage.clone()),
        devices,
        extras: Arc::new(
            ExtraStore::new(config.state_root.clone()).unwrap(),
        ),
        updates: Arc::new(UpdateBus::new()),
        config,
        log,
    });

    Harness { engine, tree, hyper, broker, storage, _dir: dir }
}

fn pv_config(id: &VmId) -> VmConfig {
    VmConfig {
        id: id.clone(),
        create: CreateInfo {
            hvm: false,
            ssidref: 0,
            name: "pv-guest".into(),
            xenstore_data: BTreeMap::new(),
            platform: BTreeMap::new(),
        },
        memory: MemoryConfig {
            static_max: 268_435_456,
            dynamic_min: 268_435_456,
            dynamic_max: 268_435_456,
        },
        vcpus: 1,
        shadow_multiplier: 1.0,
        boot: BootConfig::Direct(DirectBoot {
            kernel: "/tmp/k".into(),
            cmdline: "root=/dev/xvda1".into(),
            ramdisk: None,
        }),
    }
}

fn hvm_config(id: &VmId, shadow_multiplier: f64) -> VmConfig {
    VmConfig {
        id: id.clone(),
        create: CreateInfo {
            hvm: true,
            ssidref: 0,
            name: "hvm-guest".into(),
            xenstore_data: BTreeMap::new(),
            platform: BTreeMap::new(),
        },
        memory: MemoryConfig {
            static_max: 256 * MIB,
            dynamic_min: 256 * MIB,
            dynamic_max: 256 * MIB,
        },
        vcpus: 1,
        shadow_multiplier,
        boot: BootConfig::Hvm(HvmBoot {
            pae: true,
            apic: true,
            acpi: true,
            nx: false,
            viridian: false,
            timeoffset: 0,
            boot_order: "cd".into(),
            video_mib: 8,
        }),
    }
}

/// Plays the guest's side of the shutdown handshake: acknowledges the
/// `control/shutdown` write and tells the simulated hypervisor the
/// domain followed through.
fn spawn_guest_acker(
    tree: MemoryTree,
    hyper: SimHypervisor,
    domid: u32,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let node = format!("/local/domain/{domid}/control/shutdown");
        let mut watch = tree.watch(&node).await.unwrap();
        while watch.recv().await.is_some() {
            let Some(token) = tree.get(&node) else { continue };
            let reason = match token.as_str() {
                "poweroff" => ShutdownReason::PowerOff,
                "reboot" => ShutdownReason::Reboot,
                "suspend" => ShutdownReason::Suspend,
                "halt" => ShutdownReason::Halt,
                _ => continue,
            };
            tree.write(TX_NONE, &node, "").await.unwrap();
            hyper.inject_guest_shutdown(domid, reason);
            break;
        }
    })
}

fn load_record(h: &Harness, vm: &VmId) -> Option<VmExtra> {
    let store =
        ExtraStore::new(h._dir.path().join("state")).unwrap();
    store.load(vm).unwrap()
}

#[tokio::test]
async fn create_pv_direct_publishes_memory_and_rings() {
    let h = harness();
    let vm = VmId("11111111-1111-1111-1111-111111111111".into());
    let cfg = pv_config(&vm);

    let domid = h
        .engine
        .run_on(&vm, move |ctx| async move { ctx.create(cfg).await })
        .await
        .unwrap();
    h.engine
        .run_on(&vm, |ctx| async move { ctx.build().await })
        .await
        .unwrap();

    let dom_path = format!("/local/domain/{domid}");
    assert_eq!(
        h.tree.get(&format!("{dom_path}/memory/static-max")),
        Some("262144".to_string())
    );
    assert_eq!(
        h.tree.get(&format!("{dom_path}/memory/target")),
        Some("262144".to_string())
    );
    assert_eq!(
        h.tree.get(&format!("{dom_path}/store/ring-ref")),
        Some("1234".to_string())
    );
    assert_eq!(
        h.tree.get(&format!("{dom_path}/console/ring-ref")),
        Some("5678".to_string())
    );
    let store_port: u32 = h
        .tree
        .get(&format!("{dom_path}/store/port"))
        .unwrap()
        .parse()
        .unwrap();
    let console_port: u32 = h
        .tree
        .get(&format!("{dom_path}/console/port"))
        .unwrap()
        .parse()
        .unwrap();
    assert!(store_port > 0 && console_port > 0);
    assert_ne!(store_port, console_port);

    // The reservation was handed to the domain, not leaked.
    assert_eq!(h.broker.outstanding_reservations(), 0);
}

#[tokio::test]
async fn hvm_build_reverts_a_silently_reduced_shadow_allocation() {
    let h = harness();
    let vm = VmId("22222222-2222-2222-2222-222222222222".into());
    let cfg = hvm_config(&vm, 4.0);

    let domid = h
        .engine
        .run_on(&vm, move |ctx| async move { ctx.create(cfg).await })
        .await
        .unwrap();

    // 256 MiB, 1 vCPU, multiplier 4: the builder wants 12 MiB of
    // shadow. Arrange for it to be halved mid-build.
    h.hyper.shrink_shadow_during_build(domid, 6);
    h.engine
        .run_on(&vm, |ctx| async move { ctx.build().await })
        .await
        .unwrap();

    assert_eq!(h.hyper.domain(domid).unwrap().shadow_mib, 12);
}

#[tokio::test]
async fn suspend_then_restore_reuses_the_measured_footprint() {
    let h = harness();
    let vm = VmId("33333333-3333-3333-3333-333333333333".into());
    let cfg = pv_config(&vm);

    let domid = h
        .engine
        .run_on(&vm, {
            let cfg = cfg.clone();
            move |ctx| async move { ctx.create(cfg).await }
        })
        .await
        .unwrap();
    h.engine
        .run_on(&vm, |ctx| async move { ctx.build().await })
        .await
        .unwrap();

    // The guest occupies 65536 pages when it suspends.
    h.hyper.set_total_pages(domid, 65536);
    let acker = spawn_guest_acker(h.tree.clone(), h.hyper.clone(), domid);
    h.engine
        .run_on(&vm, |ctx| async move { ctx.suspend().await })
        .await
        .unwrap();
    acker.await.unwrap();

    let expected = 65536 * 4096;
    assert_eq!(
        load_record(&h, &vm).unwrap().suspend_memory_bytes,
        expected
    );

    // Collect the shut-down domain; the suspend record must survive.
    h.engine
        .run_on(&vm, |ctx| async move { ctx.destroy(false).await })
        .await
        .unwrap();
    assert!(h.hyper.domain(domid).is_none());
    let record = load_record(&h, &vm).unwrap();
    assert_eq!(record.suspend_memory_bytes, expected);

    // Resume: create must reserve exactly the measured footprint, and
    // restore consumes the image.
    let free_before = h.broker.free_bytes();
    let new_domid = h
        .engine
        .run_on(&vm, {
            let cfg = cfg.clone();
            move |ctx| async move { ctx.create(cfg).await }
        })
        .await
        .unwrap();
    assert_ne!(new_domid, domid);
    assert_eq!(h.broker.free_bytes(), free_before - expected);

    h.engine
        .run_on(&vm, |ctx| async move { ctx.restore().await })
        .await
        .unwrap();
    let record = load_record(&h, &vm).unwrap();
    assert_eq!(record.suspend_memory_bytes, 0);
    let dom_path = format!("/local/domain/{new_domid}");
    assert_eq!(
        h.tree.get(&format!("{dom_path}/store/ring-ref")),
        Some("4321".to_string())
    );
}

#[tokio::test]
async fn destroy_stamps_the_sentinel_on_a_stuck_domain() {
    let h = harness();
    let vm = VmId("44444444-4444-4444-4444-444444444444".into());
    let cfg = pv_config(&vm);

    let domid = h
        .engine
        .run_on(&vm, move |ctx| async move { ctx.create(cfg).await })
        .await
        .unwrap();
    h.hyper.pin_dying(domid);

    let err = h
        .engine
        .run_on(&vm, |ctx| async move { ctx.destroy(false).await })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::StuckInDyingState(d) if d == domid));
    assert!(h
        .hyper
        .domain(domid)
        .unwrap()
        .uuid
        .starts_with("deadbeef-dead-beef-dead-beef0000"));
}

#[tokio::test]
async fn broker_failure_mid_create_leaks_nothing() {
    let h = harness();
    let vm = VmId("55555555-5555-5555-5555-555555555555".into());
    let cfg = pv_config(&vm);

    let free_before = h.broker.free_bytes();
    h.broker.fail_transfers();
    let err = h
        .engine
        .run_on(&vm, move |ctx| async move { ctx.create(cfg).await })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BallooningError { .. }));

    // No reservation, no residual domain, no stale record.
    assert_eq!(h.broker.outstanding_reservations(), 0);
    assert_eq!(h.broker.free_bytes(), free_before);
    assert_eq!(h.hyper.domain_count(), 0);
    assert!(load_record(&h, &vm).is_none());
}

#[tokio::test]
async fn updates_flow_in_order_across_vms() {
    let h = harness();
    let vm_a = VmId("66666666-6666-6666-6666-666666666666".into());
    let vm_b = VmId("77777777-7777-7777-7777-777777777777".into());

    for vm in [&vm_a, &vm_b] {
        let cfg = pv_config(vm);
        h.engine
            .run_on(vm, move |ctx| async move { ctx.create(cfg).await })
            .await
            .unwrap();
    }

    let batch = h
        .engine
        .deps()
        .updates
        .get(0, Duration::from_secs(1))
        .await;
    let vms: Vec<_> = batch
        .updates
        .iter()
        .filter_map(|u| match u {
            Update::Vm { vm } => Some(vm.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(vms, vec![vm_a, vm_b]);

    // Nothing newer after the cursor.
    let empty = h
        .engine
        .deps()
        .updates
        .get(batch.next_id - 1, Duration::from_millis(20))
        .await;
    assert!(empty.updates.is_empty());
    assert_eq!(empty.next_id, batch.next_id);
}

#[tokio::test]
async fn operations_on_one_vm_are_serialized() {
    let h = harness();
    let vm = VmId("88888888-8888-8888-8888-888888888888".into());

    let in_flight = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = h.engine.clone();
        let vm = vm.clone();
        let in_flight = in_flight.clone();
        handles.push(tokio::spawn(async move {
            engine
                .run_on(&vm, move |_ctx| async move {
                    let now = in_flight
                        .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    assert_eq!(now, 0, "two ops ran concurrently");
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    in_flight
                        .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                    Ok::<_, Error>(())
                })
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn guest_poweroff_tears_the_vm_down() {
    let h = harness();
    let vm = VmId("99999999-9999-9999-9999-999999999999".into());
    let cfg = pv_config(&vm);

    let domid = h
        .engine
        .run_on(&vm, move |ctx| async move { ctx.create(cfg).await })
        .await
        .unwrap();
    h.engine
        .run_on(&vm, |ctx| async move { ctx.build().await })
        .await
        .unwrap();

    domaind::events::spawn(h.engine.clone());
    h.hyper.inject_guest_shutdown(domid, ShutdownReason::PowerOff);

    // The watcher observes the shutdown and runs the teardown on the
    // VM's worker.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if h.hyper.domain(domid).is_none() && load_record(&h, &vm).is_none()
        {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "guest poweroff was never collected"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
