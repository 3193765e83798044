// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Virtual block device plumbing: frontend/backend records, removable
//! media, and the two shutdown flavors.

use domaind_api_types::{DiskMode, DomId, Error, VbdSpec, VmId};
use slog::{info, warn};

use crate::store::{
    read_opt, transaction, wait_path, ControlTree, Perms, TX_NONE,
};
use crate::vm::devnum::DiskInterface;

use super::{bus_state, paths, DeviceSupervisor};

impl DeviceSupervisor {
    /// Plugs a block device. `params` is the backend parameter string
    /// (an attached VDI's token or a local path for CDROMs). Returns the
    /// devid and the interface naming chosen for the guest.
    pub async fn add_vbd(
        &self,
        vm: &VmId,
        domid: DomId,
        backend_domid: DomId,
        spec: &VbdSpec,
        params: &str,
        hvm: bool,
    ) -> Result<(u32, DiskInterface), Error> {
        let disk_number = match spec.device_number {
            Some(n) => n,
            None => self.next_disk_number(vm).await?,
        };
        let iface = DiskInterface::for_disk_number(hvm, disk_number, 0)?;
        let devid = iface.device_key()?;
        let extras = self.vet_extra_keys(&spec.extra_backend_keys)?;

        let frontend = paths::frontend(domid, "vbd", devid);
        let backend = paths::backend(backend_domid, "vbd", domid, devid);
        let private = paths::private(vm, "vbd", devid);
        let mode = match spec.mode {
            DiskMode::ReadOnly => "r",
            DiskMode::ReadWrite => "w",
        };
        let device_type = if spec.cdrom { "cdrom" } else { "disk" };

        transaction(self.tree.as_ref(), |tx| {
            let t = self.tree.clone();
            let frontend = frontend.clone();
            let backend = backend.clone();
            let private = private.clone();
            let extras = extras.clone();
            async move {
                t.writev(
                    tx,
                    &frontend,
                    &[
                        ("backend".into(), backend.clone()),
                        ("backend-id".into(), backend_domid.to_string()),
                        (
                            "state".into(),
                            bus_state::INITIALISING.to_string(),
                        ),
                        ("virtual-device".into(), devid.to_string()),
                        ("device-type".into(), device_type.into()),
                    ],
                )
                .await?;
                t.writev(
                    tx,
                    &backend,
                    &[
                        ("frontend".into(), frontend.clone()),
                        ("frontend-id".into(), domid.to_string()),
                        ("online".into(), "1".into()),
                        (
                            "state".into(),
                            bus_state::INITIALISING.to_string(),
                        ),
                        ("mode".into(), mode.into()),
                        ("params".into(), params.into()),
                        ("device-type".into(), device_type.into()),
                        (
                            "removable".into(),
                            if spec.cdrom { "1" } else { "0" }.into(),
                        ),
                        ("media-present".into(), "1".into()),
                    ],
                )
                .await?;
                t.writev(tx, &backend, &extras).await?;
                t.writev(
                    tx,
                    &private,
                    &[
                        ("vbd-id".into(), spec.id.clone()),
                        ("backend-domid".into(), backend_domid.to_string()),
                        ("disk-number".into(), disk_number.to_string()),
                        ("params".into(), params.into()),
                    ],
                )
                .await?;
                Ok(())
            }
        })
        .await?;

        // The guest owns its frontend; the backend stays read-only to it.
        self.tree
            .setperms(TX_NONE, &frontend, &Perms::rw(domid))
            .await?;
        self.tree
            .setperms(TX_NONE, &backend, &Perms::ro(backend_domid))
            .await?;

        info!(self.log, "plugged vbd";
              "vm" => %vm, "devid" => devid,
              "device" => iface.linux_device());
        Ok((devid, iface))
    }

    /// The lowest unused disk number for the VM.
    async fn next_disk_number(&self, vm: &VmId) -> Result<u32, Error> {
        let mut used = Vec::new();
        for devid in self.plugged_devids(vm, "vbd").await? {
            let path =
                format!("{}/disk-number", paths::private(vm, "vbd", devid));
            if let Some(n) =
                read_opt(self.tree.as_ref(), TX_NONE, &path).await?
            {
                if let Ok(n) = n.parse::<u32>() {
                    used.push(n);
                }
            }
        }
        used.sort_unstable();
        let mut next = 0;
        for n in used {
            if n == next {
                next += 1;
            }
        }
        Ok(next)
    }

    /// Changes a removable device's media.
    pub async fn vbd_media_insert(
        &self,
        vm: &VmId,
        domid: DomId,
        devid: u32,
        params: &str,
    ) -> Result<(), Error> {
        let backend = self.vbd_backend_path(vm, domid, devid).await?;
        self.tree.write(TX_NONE, &format!("{backend}/params"), params).await?;
        self.tree
            .write(TX_NONE, &format!("{backend}/media-present"), "1")
            .await?;
        Ok(())
    }

    pub async fn vbd_media_eject(
        &self,
        vm: &VmId,
        domid: DomId,
        devid: u32,
    ) -> Result<(), Error> {
        let backend = self.vbd_backend_path(vm, domid, devid).await?;
        self.tree.write(TX_NONE, &format!("{backend}/params"), "").await?;
        self.tree
            .write(TX_NONE, &format!("{backend}/media-present"), "0")
            .await?;
        Ok(())
    }

    pub async fn vbd_media_is_ejected(
        &self,
        vm: &VmId,
        domid: DomId,
        devid: u32,
    ) -> Result<bool, Error> {
        let backend = self.vbd_backend_path(vm, domid, devid).await?;
        let present = read_opt(
            self.tree.as_ref(),
            TX_NONE,
            &format!("{backend}/media-present"),
        )
        .await?;
        Ok(present.as_deref() == Some("0"))
    }

    /// Asks the backend to close cleanly and waits for the frontend to
    /// acknowledge. A guest that actively refuses surfaces as
    /// [`Error::DeviceDetachRejected`]; silence is a
    /// [`Error::BackendTimeout`].
    pub async fn vbd_clean_shutdown(
        &self,
        vm: &VmId,
        domid: DomId,
        devid: u32,
    ) -> Result<(), Error> {
        let backend = self.vbd_backend_path(vm, domid, devid).await?;
        let frontend = paths::frontend(domid, "vbd", devid);
        self.tree.write(TX_NONE, &format!("{backend}/online"), "0").await?;
        self.tree
            .write(
                TX_NONE,
                &format!("{backend}/state"),
                &bus_state::CLOSING.to_string(),
            )
            .await?;

        let closed_state = bus_state::CLOSED.to_string();
        let closed = wait_path(
            self.tree.as_ref(),
            &format!("{frontend}/state"),
            self.timeouts.backend_shutdown(),
            |v| v.is_none() || v == Some(closed_state.as_str()),
        )
        .await?;
        if closed {
            return Ok(());
        }
        let rejected = read_opt(
            self.tree.as_ref(),
            TX_NONE,
            &format!("{frontend}/error"),
        )
        .await?
        .is_some();
        if rejected {
            Err(Error::DeviceDetachRejected)
        } else {
            Err(Error::BackendTimeout)
        }
    }

    /// Forces the backend to flush and close without the guest's
    /// cooperation, waiting on its completion watch.
    pub async fn vbd_hard_shutdown(
        &self,
        vm: &VmId,
        domid: DomId,
        devid: u32,
    ) -> Result<(), Error> {
        let backend = self.vbd_backend_path(vm, domid, devid).await?;
        self.tree
            .write(TX_NONE, &format!("{backend}/shutdown-request"), "force")
            .await?;
        let done = wait_path(
            self.tree.as_ref(),
            &format!("{backend}/shutdown-done"),
            self.timeouts.backend_shutdown(),
            |v| v.is_some(),
        )
        .await?;
        if done {
            Ok(())
        } else {
            Err(Error::BackendTimeout)
        }
    }

    /// Hard-shuts every plugged VBD in parallel. Individual failures are
    /// logged; any timeout surfaces as [`Error::BackendTimeout`] once
    /// every device has been given its chance.
    pub async fn hard_shutdown_all_vbds(
        &self,
        vm: &VmId,
        domid: DomId,
    ) -> Result<(), Error> {
        let devids = self.plugged_devids(vm, "vbd").await?;
        let shutdowns = devids.iter().map(|devid| {
            let devid = *devid;
            async move {
                (devid, self.vbd_hard_shutdown(vm, domid, devid).await)
            }
        });
        let mut timed_out = false;
        for (devid, result) in futures::future::join_all(shutdowns).await {
            match result {
                Ok(()) => {}
                Err(Error::BackendTimeout) => {
                    warn!(self.log, "vbd backend did not complete shutdown";
                          "devid" => devid);
                    timed_out = true;
                }
                Err(e) => {
                    warn!(self.log, "vbd hard shutdown failed";
                          "devid" => devid, "error" => %e);
                }
            }
        }
        if timed_out {
            Err(Error::BackendTimeout)
        } else {
            Ok(())
        }
    }

    async fn vbd_backend_path(
        &self,
        vm: &VmId,
        domid: DomId,
        devid: u32,
    ) -> Result<String, Error> {
        let private = paths::private(vm, "vbd", devid);
        let backend_domid: DomId = read_opt(
            self.tree.as_ref(),
            TX_NONE,
            &format!("{private}/backend-domid"),
        )
        .await?
        .ok_or(Error::DeviceNotConnected)?
        .parse()
        .map_err(|_| {
            Error::InternalError("corrupt backend-domid record".into())
        })?;
        Ok(paths::backend(backend_domid, "vbd", domid, devid))
    }
}

#[cfg(test)]
mod test {
    use super::super::test::supervisor_with;
    use super::*;
    use crate::hyperctl::sim::SimHypervisor;
    use crate::store::memory::MemoryTree;
    use crate::store::ControlTree;
    use domaind_api_types::DiskBackend;
    use std::collections::BTreeMap;

    fn vbd_spec(id: &str, device_number: Option<u32>) -> VbdSpec {
        VbdSpec {
            id: id.into(),
            backend: DiskBackend::Local { path: "/dev/zvol/test".into() },
            mode: DiskMode::ReadWrite,
            device_number,
            cdrom: false,
            extra_backend_keys: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn plugging_tags_the_private_path_for_reverse_lookup() {
        let tree = MemoryTree::new();
        let hyper = SimHypervisor::new();
        let sup = supervisor_with(&tree, &hyper, false);
        let vm = VmId("vm-1".into());

        let (devid, iface) = sup
            .add_vbd(&vm, 7, 0, &vbd_spec("disk0", Some(0)), "/dev/loop0", false)
            .await
            .unwrap();
        assert_eq!(iface.linux_device(), "xvda");
        assert_eq!(
            tree.get(&format!(
                "/domaind/private/vm-1/device/vbd/{devid}/vbd-id"
            )),
            Some("disk0".to_string())
        );
        assert_eq!(
            sup.by_logical_id(&vm, "vbd", "disk0").await.unwrap(),
            Some(devid)
        );
        assert_eq!(sup.by_logical_id(&vm, "vbd", "nope").await.unwrap(), None);

        // Frontend and backend halves both exist and point at each other.
        let fe = paths::frontend(7, "vbd", devid);
        let be = paths::backend(0, "vbd", 7, devid);
        assert_eq!(tree.get(&format!("{fe}/backend")), Some(be.clone()));
        assert_eq!(tree.get(&format!("{be}/frontend")), Some(fe));
        assert_eq!(tree.get(&format!("{be}/params")), Some("/dev/loop0".into()));
    }

    #[tokio::test]
    async fn disk_numbers_fill_the_lowest_gap() {
        let tree = MemoryTree::new();
        let hyper = SimHypervisor::new();
        let sup = supervisor_with(&tree, &hyper, false);
        let vm = VmId("vm-1".into());

        sup.add_vbd(&vm, 7, 0, &vbd_spec("a", Some(0)), "p", false)
            .await
            .unwrap();
        sup.add_vbd(&vm, 7, 0, &vbd_spec("b", Some(2)), "p", false)
            .await
            .unwrap();
        let (_, iface) = sup
            .add_vbd(&vm, 7, 0, &vbd_spec("c", None), "p", false)
            .await
            .unwrap();
        assert_eq!(iface.disk_number(), 1);
    }

    #[tokio::test]
    async fn media_eject_round_trips() {
        let tree = MemoryTree::new();
        let hyper = SimHypervisor::new();
        let sup = supervisor_with(&tree, &hyper, false);
        let vm = VmId("vm-1".into());
        let mut spec = vbd_spec("cd", Some(3));
        spec.cdrom = true;
        let (devid, _) =
            sup.add_vbd(&vm, 7, 0, &spec, "/isos/a.iso", true).await.unwrap();

        assert!(!sup.vbd_media_is_ejected(&vm, 7, devid).await.unwrap());
        sup.vbd_media_eject(&vm, 7, devid).await.unwrap();
        assert!(sup.vbd_media_is_ejected(&vm, 7, devid).await.unwrap());
        sup.vbd_media_insert(&vm, 7, devid, "/isos/b.iso").await.unwrap();
        assert!(!sup.vbd_media_is_ejected(&vm, 7, devid).await.unwrap());
    }

    #[tokio::test]
    async fn clean_shutdown_succeeds_when_the_frontend_closes() {
        let tree = MemoryTree::new();
        let hyper = SimHypervisor::new();
        let sup = supervisor_with(&tree, &hyper, false);
        let vm = VmId("vm-1".into());
        let (devid, _) = sup
            .add_vbd(&vm, 7, 0, &vbd_spec("d", Some(0)), "p", false)
            .await
            .unwrap();

        // Play the guest: close the frontend when the backend asks.
        let guest_tree = tree.clone();
        let fe_state = format!("{}/state", paths::frontend(7, "vbd", devid));
        let be_state = format!("{}/state", paths::backend(0, "vbd", 7, devid));
        let guest = tokio::spawn(async move {
            let mut w = guest_tree.watch(&be_state).await.unwrap();
            while w.recv().await.is_some() {
                if guest_tree.get(&be_state).as_deref() == Some("5") {
                    guest_tree
                        .write(TX_NONE, &fe_state, "6")
                        .await
                        .unwrap();
                    break;
                }
            }
        });

        sup.vbd_clean_shutdown(&vm, 7, devid).await.unwrap();
        guest.await.unwrap();
    }

    #[tokio::test]
    async fn unresponsive_backends_time_out() {
        let tree = MemoryTree::new();
        let hyper = SimHypervisor::new();
        let sup = supervisor_with(&tree, &hyper, false);
        let vm = VmId("vm-1".into());
        let (devid, _) = sup
            .add_vbd(&vm, 7, 0, &vbd_spec("d", Some(0)), "p", false)
            .await
            .unwrap();

        let err = sup.vbd_hard_shutdown(&vm, 7, devid).await.unwrap_err();
        assert!(matches!(err, Error::BackendTimeout));
    }

    #[tokio::test]
    async fn hard_shutdown_all_waits_for_every_backend() {
        let tree = MemoryTree::new();
        let hyper = SimHypervisor::new();
        let sup = supervisor_with(&tree, &hyper, false);
        let vm = VmId("vm-1".into());
        let (d0, _) = sup
            .add_vbd(&vm, 7, 0, &vbd_spec("a", Some(0)), "p", false)
            .await
            .unwrap();
        let (d1, _) = sup
            .add_vbd(&vm, 7, 0, &vbd_spec("b", Some(1)), "p", false)
            .await
            .unwrap();

        // Backends complete their flush immediately.
        for devid in [d0, d1] {
            let done = format!(
                "{}/shutdown-done",
                paths::backend(0, "vbd", 7, devid)
            );
            tree.write(TX_NONE, &done, "1").await.unwrap();
        }
        sup.hard_shutdown_all_vbds(&vm, 7).await.unwrap();
    }
}
