// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The host-scoped event watcher: one task that mirrors the domain
//! list, subscribes to the interesting control-tree paths, and
//! translates everything into idempotent per-VM updates on the bus.
//!
//! Guest-initiated shutdowns are also detected here; the reaction
//! (reboot re-entry, teardown) is dispatched onto the VM's own worker
//! so this task never blocks on engine work.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use domaind_api_types::{DomId, Update, VmId};
use slog::{debug, info, o, warn, Logger};
use tokio::sync::mpsc;

use crate::hyperctl::{reason_of_code, Hypervisor};
use crate::store::ControlTree;
use crate::vm::devnum::DiskInterface;
use crate::vm::Engine;

/// Domain-path keys whose changes are surfaced as a VM-level update.
const VM_LEVEL_KEYS: &[&str] = &[
    "data/updated",
    "memory/target",
    "memory/uncooperative",
    "console/vnc-port",
    "console/tc-port",
    "control/shutdown",
];

/// Backend keys that matter for device readiness; any other backend
/// traffic is noise.
const BACKEND_KEYS: &[&str] =
    &["kthread-pid", "tapdisk-pid", "shutdown-done", "params", "state"];

/// Translates a fired control-tree path into an update, given the
/// current domid → uuid mapping.
pub(crate) fn update_for_path(
    path: &str,
    uuid_of: &HashMap<DomId, String>,
) -> Option<Update> {
    if let Some(rest) = path.strip_prefix("/local/domain/") {
        let (domid, tail) = match rest.split_once('/') {
            Some((d, t)) => (d, t),
            None => (rest, ""),
        };
        let domid: DomId = domid.parse().ok()?;

        if let Some(backend) = tail.strip_prefix("backend/") {
            // backend/<kind>/<frontend domid>/<devid>/<key>
            let mut parts = backend.splitn(4, '/');
            let kind = parts.next()?;
            let fe_domid: DomId = parts.next()?.parse().ok()?;
            let devid: u32 = parts.next()?.parse().ok()?;
            let key = parts.next().unwrap_or("");
            if !key.is_empty() && !BACKEND_KEYS.contains(&key) {
                return None;
            }
            let vm = VmId(uuid_of.get(&fe_domid)?.clone());
            return device_update(vm, kind, devid);
        }

        let vm = VmId(uuid_of.get(&domid)?.clone());
        if let Some(dev) = tail.strip_prefix("device/") {
            let mut parts = dev.splitn(3, '/');
            let kind = parts.next()?;
            let devid: u32 = parts.next()?.parse().ok()?;
            return device_update(vm, kind, devid);
        }
        if VM_LEVEL_KEYS.contains(&tail) {
            return Some(Update::Vm { vm });
        }
        return None;
    }

    if let Some(rest) = path.strip_prefix("/vm/") {
        if let Some(uuid) = rest.strip_suffix("/rtc/timeoffset") {
            return Some(Update::Vm { vm: VmId(uuid.to_owned()) });
        }
    }
    None
}

fn device_update(vm: VmId, kind: &str, devid: u32) -> Option<Update> {
    match kind {
        "vbd" => DiskInterface::from_device_key(devid).ok().map(|iface| {
            Update::Vbd { vm, device: iface.linux_device() }
        }),
        "vif" => Some(Update::Vif { vm, position: devid }),
        "pci" => Some(Update::Pci { vm, slot: devid }),
        _ => None,
    }
}

/// Spawns the watcher. It runs for the life of the daemon.
pub fn spawn(engine: Arc<Engine>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run(engine))
}

async fn run(engine: Arc<Engine>) {
    let deps = engine.deps().clone();
    let log = deps.log.new(o!("component" => "event-watcher"));
    info!(log, "event watcher starting");

    // All watch traffic funnels through one channel so the main loop
    // stays a plain select between "tree said something" and the
    // domain-list poll tick.
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<String>();
    for target in ["/local/domain", "/vm", "@introduceDomain", "@releaseDomain"]
    {
        match deps.tree.watch(target).await {
            Ok(mut watch) => {
                let tx = evt_tx.clone();
                tokio::spawn(async move {
                    while let Some(path) = watch.recv().await {
                        if tx.send(path).is_err() {
                            break;
                        }
                    }
                });
            }
            Err(e) => {
                warn!(log, "cannot watch tree path";
                      "path" => target, "error" => %e);
            }
        }
    }
    drop(evt_tx);

    let mut interval =
        tokio::time::interval(deps.config.timeouts.event_poll_interval());
    interval
        .set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut mirror: HashMap<DomId, crate::hyperctl::DomInfo> = HashMap::new();
    let mut reacted: HashSet<(DomId, u32)> = HashSet::new();
    let mut watches_live = true;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                scan_domains(&engine, &log, &mut mirror, &mut reacted);
            }
            fired = evt_rx.recv(), if watches_live => {
                match fired {
                    Some(path) => {
                        if path.starts_with('@') {
                            scan_domains(
                                &engine, &log, &mut mirror, &mut reacted,
                            );
                            continue;
                        }
                        let uuid_of: HashMap<DomId, String> = mirror
                            .iter()
                            .map(|(d, i)| (*d, i.uuid.clone()))
                            .collect();
                        if let Some(update) =
                            update_for_path(&path, &uuid_of)
                        {
                            debug!(log, "tree change";
                                   "path" => &path, "update" => ?update);
                            deps.updates.inject(update);
                        }
                    }
                    None => {
                        warn!(log, "all tree watches gone, polling only");
                        watches_live = false;
                    }
                }
            }
        }
    }
}

/// Diffs the live domain list against the mirror, surfacing changes as
/// VM updates and dispatching guest-shutdown reactions.
fn scan_domains(
    engine: &Arc<Engine>,
    log: &Logger,
    mirror: &mut HashMap<DomId, crate::hyperctl::DomInfo>,
    reacted: &mut HashSet<(DomId, u32)>,
) {
    let deps = engine.deps().clone();
    let list = match deps.hyper.domain_getinfolist(0) {
        Ok(list) => list,
        Err(e) => {
            warn!(log, "cannot list domains"; "error" => %e);
            return;
        }
    };

    let mut current: HashMap<DomId, crate::hyperctl::DomInfo> =
        HashMap::new();
    for info in list {
        current.insert(info.domid, info);
    }

    // Appearances and state changes.
    for (domid, info) in &current {
        let changed = match mirror.get(domid) {
            None => true,
            Some(old) => {
                old.shutdown != info.shutdown
                    || old.shutdown_code != info.shutdown_code
                    || old.dying != info.dying
                    || old.paused != info.paused
            }
        };
        if changed {
            deps.updates
                .inject(Update::Vm { vm: VmId(info.uuid.clone()) });
        }

        if info.shutdown {
            if let Some(code) = info.shutdown_code {
                if reacted.insert((*domid, code)) {
                    if let Some(reason) = reason_of_code(code) {
                        let vm = VmId(info.uuid.clone());
                        let engine = engine.clone();
                        let log = log.clone();
                        info!(log, "observed guest shutdown";
                              "vm" => %vm, "domid" => domid,
                              "reason" => ?reason);
                        tokio::spawn(async move {
                            if let Err(e) = engine
                                .run_on(&vm, move |ctx| async move {
                                    ctx.react_to_guest_shutdown(reason).await
                                })
                                .await
                            {
                                warn!(log, "shutdown reaction failed";
                                      "vm" => %vm, "error" => %e);
                            }
                        });
                    }
                }
            }
        }
    }

    // Disappearances.
    for (domid, info) in mirror.iter() {
        if !current.contains_key(domid) {
            deps.updates
                .inject(Update::Vm { vm: VmId(info.uuid.clone()) });
            reacted.retain(|(d, _)| d != domid);
        }
    }

    *mirror = current;
}

#[cfg(test)]
mod test {
    use super::*;

    fn uuid_map() -> HashMap<DomId, String> {
        HashMap::from([
            (3, "aaaa-bbbb".to_string()),
            (0, "control".to_string()),
        ])
    }

    #[test]
    fn frontend_device_paths_become_device_updates() {
        let map = uuid_map();
        let key = (202 << 8) | (1 << 4); // xvdb
        assert_eq!(
            update_for_path(
                &format!("/local/domain/3/device/vbd/{key}/state"),
                &map
            ),
            Some(Update::Vbd {
                vm: VmId("aaaa-bbbb".into()),
                device: "xvdb".into()
            })
        );
        assert_eq!(
            update_for_path("/local/domain/3/device/vif/2", &map),
            Some(Update::Vif { vm: VmId("aaaa-bbbb".into()), position: 2 })
        );
    }

    #[test]
    fn backend_paths_attribute_to_the_frontend_domain() {
        let map = uuid_map();
        let key = 202 << 8;
        assert_eq!(
            update_for_path(
                &format!("/local/domain/0/backend/vbd/3/{key}/shutdown-done"),
                &map
            ),
            Some(Update::Vbd {
                vm: VmId("aaaa-bbbb".into()),
                device: "xvda".into()
            })
        );
        // Uninteresting backend chatter is dropped.
        assert_eq!(
            update_for_path(
                &format!("/local/domain/0/backend/vbd/3/{key}/hotplug-status"),
                &map
            ),
            None
        );
    }

    #[test]
    fn vm_level_keys_become_vm_updates() {
        let map = uuid_map();
        for key in ["data/updated", "memory/target", "control/shutdown"] {
            assert_eq!(
                update_for_path(&format!("/local/domain/3/{key}"), &map),
                Some(Update::Vm { vm: VmId("aaaa-bbbb".into()) }),
                "{key}"
            );
        }
        assert_eq!(
            update_for_path("/local/domain/3/unrelated", &map),
            None
        );
        // Unknown domains cannot be attributed.
        assert_eq!(
            update_for_path("/local/domain/9/memory/target", &map),
            None
        );
    }

    #[test]
    fn rtc_offset_writes_map_to_the_vm() {
        let map = uuid_map();
        assert_eq!(
            update_for_path("/vm/aaaa-bbbb/rtc/timeoffset", &map),
            Some(Update::Vm { vm: VmId("aaaa-bbbb".into()) })
        );
        assert_eq!(update_for_path("/vm/aaaa-bbbb/name", &map), None);
    }
}
