// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-VM transition implementations: create, build, device plug,
//! start, shutdown handshake, suspend, restore, destroy, and the
//! reactions to guest-initiated state changes.
//!
//! Every function here runs on the VM's serial worker (see
//! [`super::Engine`]), so no two transitions for the same VM ever
//! overlap. Failure paths release what they acquired before
//! returning: reservations through the broker scope, storage
//! attachments explicitly, half-created domains by destruction.

use std::collections::BTreeMap;
use std::time::Duration;

use domaind_api_types::{
    BootConfig, DeviceStateResponse, DiskBackend, DomId, Error, NetworkKind,
    PciSpec, PowerState, ShutdownReason, Update, VbdSpec, VifSpec, VmConfig,
    VmStateResponse,
};
use slog::{info, warn};

use crate::broker::ReservationDisposition;
use crate::builder::{
    self, HelperEvent, HelperInvocation, HelperMode, HelperSession,
};
use crate::devices::dm::{self, DmConfig, VncDisplay};
use crate::devices::paths;
use crate::hyperctl::{
    self, shutdown_code, CpuidLeafPolicy, CpuidReg, Hypervisor, RegTemplate,
};
use crate::storage::{
    with_disk, Datapath, StorageRepo, StorageService, VirtualDisk,
};
use crate::store::{
    read_opt, transaction, wait_path, ControlTree, Perms, TX_NONE,
};

use super::request_queue::{ExternalRequest, LifecycleEvent};
use super::{extra, memory, VmCtx};
use extra::{BuildInfo, BuilderKind, VmExtra};
use super::devnum::DiskInterface;

/// Poll cadence while waiting for a suspending guest to finish shutting
/// down.
const SUSPEND_POLL: Duration = Duration::from_millis(100);

/// Ack window granted to the guest during the suspend handshake.
const REBOOT_ACK: Duration = Duration::from_secs(60);

/// An extracted PV kernel, deleted once the build is over.
struct ExtractedBoot {
    kernel: String,
    ramdisk: Option<String>,
    cmdline: String,
    /// Files to delete when the build finishes, success or not.
    delete: Vec<String>,
}

impl VmCtx {
    fn uuid(&self) -> &str {
        &self.vm.0
    }

    fn load_extra(&self) -> Result<VmExtra, Error> {
        self.deps.extras.load(&self.vm)?.ok_or(Error::DoesNotExist)
    }

    /// The live domain carrying this VM's uuid, if any.
    fn live_domain(&self) -> Result<Option<hyperctl::DomInfo>, Error> {
        let list = self.deps.hyper.domain_getinfolist(0)?;
        Ok(list.into_iter().find(|i| i.uuid == self.uuid()))
    }

    fn push_update(&self, update: Update) {
        self.deps.updates.inject(update);
    }

    fn push_vm_update(&self) {
        self.push_update(Update::Vm { vm: self.vm.clone() });
    }

    fn notify_lifecycle(&self, event: LifecycleEvent) {
        self.queue.lock().unwrap().notify_lifecycle_event(event);
    }

    // ------------------------------------------------------------------
    // create

    /// Reserves memory, creates the empty domain, and hands the
    /// reservation over to it. On failure nothing is left behind: the
    /// reservation is released by its scope and a half-created domain
    /// is destroyed.
    pub async fn create(&self, cfg: VmConfig) -> Result<DomId, Error> {
        let d = &self.deps;
        if self.live_domain()?.is_some() {
            return Err(Error::AlreadyExists);
        }

        let mut extra = match d.extras.load(&self.vm)? {
            Some(mut e) => {
                e.create_info = cfg.create.clone();
                e.boot = cfg.boot.clone();
                e.memory = cfg.memory;
                e.vcpus = cfg.vcpus;
                e.shadow_multiplier = cfg.shadow_multiplier;
                e
            }
            None => VmExtra::new(
                cfg.create.clone(),
                cfg.boot.clone(),
                cfg.memory,
                cfg.vcpus,
                cfg.shadow_multiplier,
            ),
        };

        let hvm = cfg.create.hvm;
        let overhead = memory::overhead_bytes(
            hvm,
            cfg.memory.static_max,
            cfg.vcpus,
            cfg.shadow_multiplier,
        );
        // A resumable guest must land on exactly its measured
        // footprint; everyone else gets the dynamic range plus
        // overhead.
        let (min, max) = if extra.suspend_memory_bytes != 0 {
            (extra.suspend_memory_bytes, extra.suspend_memory_bytes)
        } else {
            (
                cfg.memory.dynamic_min + overhead,
                cfg.memory.dynamic_max + overhead,
            )
        };

        info!(self.log, "creating domain";
              "hvm" => hvm, "reserve_min" => min, "reserve_max" => max);

        let extra_ref = &mut extra;
        let reserve_outcome = d
            .broker
            .with_reservation(min, max, |r| async move {
                let domid = d
                    .hyper
                    .domain_create(cfg.create.ssidref, hvm, self.uuid())
                    .map_err(Error::from)?;
                extra_ref.domid = domid;
                extra_ref.last_create_time = extra::now_secs();
                if let Err(e) = d.extras.save(&self.vm, extra_ref) {
                    let _ = d.hyper.domain_destroy(domid);
                    return Err(e);
                }
                match d.broker.transfer(&r, domid).await {
                    Ok(()) => Ok((
                        (domid, r.amount),
                        ReservationDisposition::Transferred,
                    )),
                    Err(e) => {
                        let _ = d.hyper.domain_destroy(domid);
                        Err(e)
                    }
                }
            })
            .await;
        let (domid, reserved) = match reserve_outcome {
            Ok(v) => v,
            Err(e) => {
                // The domain (if any) is gone and the reservation was
                // released by its scope; a record with nothing behind it
                // must not survive.
                if extra.suspend_memory_bytes == 0 {
                    let _ = d.extras.remove(&self.vm);
                }
                return Err(e);
            }
        };

        if let Err(e) =
            self.finish_create(&mut extra, domid, reserved, overhead).await
        {
            warn!(self.log, "create failed after domain creation";
                  "domid" => domid, "error" => %e);
            let _ = d.hyper.domain_destroy(domid);
            if extra.suspend_memory_bytes == 0 {
                let _ = d.extras.remove(&self.vm);
            }
            return Err(e);
        }

        self.push_vm_update();
        Ok(domid)
    }

    async fn finish_create(
        &self,
        extra: &mut VmExtra,
        domid: DomId,
        reserved: u64,
        overhead: u64,
    ) -> Result<(), Error> {
        let d = &self.deps;
        let cfg_mem = extra.memory;
        let initial_target =
            cfg_mem.dynamic_max.min(reserved.saturating_sub(overhead));

        d.hyper.setmaxmem(domid, cfg_mem.static_max)?;
        d.hyper.set_memmap_limit(
            domid,
            memory::bytes_to_kib(cfg_mem.static_max + overhead),
        )?;
        d.hyper.max_vcpus(domid, extra.vcpus)?;

        let platform = extra.create_info.platform.clone();
        if let Some(mask) = platform
            .get("vcpu-affinity")
            .and_then(|m| u64::from_str_radix(m.trim_start_matches("0x"), 16).ok())
        {
            for vcpu in 0..extra.vcpus {
                d.hyper.vcpu_affinity_set(domid, vcpu, mask)?;
            }
        }
        if platform.get("suppress-spurious-page-faults").map(String::as_str)
            == Some("1")
        {
            d.hyper.suppress_spurious_page_faults(domid)?;
        }
        if let Some(bits) =
            platform.get("machine-address-size").and_then(|b| b.parse().ok())
        {
            d.hyper.set_machine_address_size(domid, bits)?;
        }

        let dom_path = paths::domain(domid);
        let vm_path = paths::vm(&self.vm);
        let name = extra.create_info.name.clone();
        let xenstore_data = extra.create_info.xenstore_data.clone();
        let uuid = self.uuid().to_owned();
        transaction(d.tree.as_ref(), |tx| {
            let t = d.tree.clone();
            let dom_path = dom_path.clone();
            let vm_path = vm_path.clone();
            let name = name.clone();
            let platform = platform.clone();
            let xenstore_data = xenstore_data.clone();
            let uuid = uuid.clone();
            async move {
                t.writev(
                    tx,
                    &vm_path,
                    &[("uuid".into(), uuid), ("name".into(), name.clone())],
                )
                .await?;
                t.writev(
                    tx,
                    &dom_path,
                    &[
                        ("vm".into(), vm_path.clone()),
                        ("name".into(), name),
                        ("domid".into(), domid.to_string()),
                        (
                            "memory/static-max".into(),
                            memory::bytes_to_kib(cfg_mem.static_max)
                                .to_string(),
                        ),
                        (
                            "memory/dynamic-min".into(),
                            memory::bytes_to_kib(cfg_mem.dynamic_min)
                                .to_string(),
                        ),
                        (
                            "memory/target".into(),
                            memory::bytes_to_kib(initial_target).to_string(),
                        ),
                        (
                            "memory/initial-target".into(),
                            memory::bytes_to_kib(initial_target).to_string(),
                        ),
                        (
                            "control/platform-feature-multiprocessor-suspend"
                                .into(),
                            "1".into(),
                        ),
                        ("control/shutdown".into(), "".into()),
                        ("vss".into(), "".into()),
                    ],
                )
                .await?;
                for sub in
                    ["device", "error", "drivers", "attr", "data", "messages"]
                {
                    t.mkdir(tx, &format!("{dom_path}/{sub}")).await?;
                }
                for (k, v) in &platform {
                    t.write(tx, &format!("{dom_path}/platform/{k}"), v)
                        .await?;
                }
                for (k, v) in &xenstore_data {
                    t.write(tx, &format!("{dom_path}/{k}"), v).await?;
                }
                Ok(())
            }
        })
        .await?;

        // VCPU availability nodes.
        for vcpu in 0..extra.vcpus {
            d.tree
                .write(
                    TX_NONE,
                    &format!("{dom_path}/cpu/{vcpu}/availability"),
                    "online",
                )
                .await?;
        }

        // Guests read their resource limits but only write through the
        // channels given to them.
        for ro in ["cpu", "memory", "vm", "vss"] {
            let _ = d
                .tree
                .setperms(
                    TX_NONE,
                    &format!("{dom_path}/{ro}"),
                    &Perms::ro(domid),
                )
                .await;
        }
        for rw in ["device", "error", "drivers", "control", "attr", "data", "messages"]
        {
            let _ = d
                .tree
                .setperms(
                    TX_NONE,
                    &format!("{dom_path}/{rw}"),
                    &Perms::rw(domid),
                )
                .await;
        }

        d.extras.save(&self.vm, extra)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // build

    /// Builds the created domain: boot material, builder helper, ring
    /// publication, shadow verification, CPUID policy.
    pub async fn build(&self) -> Result<(), Error> {
        let d = &self.deps;
        let mut extra = self.load_extra()?;
        let domid = extra.domid;
        if domid == 0 {
            return Err(Error::DoesNotExist);
        }
        let hvm = extra.create_info.hvm;

        // Validate the CPUID policy before anything touches the
        // hypervisor.
        let policy =
            cpuid_policy_from_platform(&extra.create_info.platform)?;

        let dom_path = paths::domain(domid);
        let target_kib = read_opt(
            d.tree.as_ref(),
            TX_NONE,
            &format!("{dom_path}/memory/initial-target"),
        )
        .await?
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| {
            Error::InternalError("domain has no initial target".into())
        })?;
        let static_max_kib = memory::bytes_to_kib(extra.memory.static_max);

        let mut args: Vec<(String, String)> = vec![
            ("mem_max_kib".into(), static_max_kib.to_string()),
            ("mem_start_kib".into(), target_kib.to_string()),
            ("vcpus".into(), extra.vcpus.to_string()),
        ];
        let shadow_mib = memory::hvm_shadow_mib(
            memory::bytes_to_mib_ceil(extra.memory.static_max),
            extra.vcpus,
            extra.shadow_multiplier,
        );

        let (mode, ty, extracted, kernel) = match extra.boot.clone() {
            BootConfig::Hvm(h) => {
                d.hyper.shadow_allocation_set(domid, shadow_mib)?;
                args.extend([
                    ("image".into(), "hvmloader".to_string()),
                    ("pae".into(), flag(h.pae)),
                    ("apic".into(), flag(h.apic)),
                    ("acpi".into(), flag(h.acpi)),
                    ("nx".into(), flag(h.nx)),
                    ("viridian".into(), flag(h.viridian)),
                    ("timeoffset".into(), h.timeoffset.to_string()),
                    ("shadow_mib".into(), shadow_mib.to_string()),
                ]);
                (HelperMode::HvmBuild, BuilderKind::Hvm, None, None)
            }
            BootConfig::Direct(direct) => {
                args.push(("kernel".into(), direct.kernel.clone()));
                args.push(("cmdline".into(), direct.cmdline.clone()));
                if let Some(ramdisk) = &direct.ramdisk {
                    args.push(("ramdisk".into(), ramdisk.clone()));
                }
                (
                    HelperMode::Build,
                    BuilderKind::PvDirect,
                    None,
                    Some(direct.kernel),
                )
            }
            BootConfig::Indirect(indirect) => {
                let boot =
                    self.extract_boot_material(&indirect, &extra.vbds).await?;
                args.push(("kernel".into(), boot.kernel.clone()));
                args.push(("cmdline".into(), boot.cmdline.clone()));
                if let Some(ramdisk) = &boot.ramdisk {
                    args.push(("ramdisk".into(), ramdisk.clone()));
                }
                let kernel = boot.kernel.clone();
                (
                    HelperMode::Build,
                    BuilderKind::PvIndirect,
                    Some(boot),
                    Some(kernel),
                )
            }
        };

        let build_result = self.run_build_helper(mode, domid, args).await;

        // Bootloader-extracted files are deleted on every exit.
        if let Some(boot) = extracted {
            for path in &boot.delete {
                if let Err(e) = std::fs::remove_file(path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(self.log, "cannot delete extracted boot file";
                              "path" => path.as_str(), "error" => %e);
                    }
                }
            }
        }
        let out = build_result?;

        let store_port = d.hyper.evtchn_alloc_unbound(domid, 0)?;
        let console_port = d.hyper.evtchn_alloc_unbound(domid, 0)?;
        self.publish_rings(
            domid,
            out.store_mfn,
            store_port,
            out.console_mfn,
            console_port,
        )
        .await?;
        if let BootConfig::Hvm(h) = &extra.boot {
            d.tree
                .write(
                    TX_NONE,
                    &format!("{}/rtc/timeoffset", paths::vm(&self.vm)),
                    &h.timeoffset.to_string(),
                )
                .await?;
        }

        // The helper is allowed to consume shadow; it is not allowed to
        // silently shrink what was configured.
        if hvm {
            let got = d.hyper.shadow_allocation_get(domid)?;
            if got < shadow_mib {
                warn!(self.log,
                      "builder reduced shadow allocation, restoring";
                      "wanted_mib" => shadow_mib, "got_mib" => got);
                d.hyper.shadow_allocation_set(domid, shadow_mib)?;
                let after = d.hyper.shadow_allocation_get(domid)?;
                if after < shadow_mib {
                    warn!(self.log, "shadow allocation still short";
                          "wanted_mib" => shadow_mib, "got_mib" => after);
                }
            }
        }

        extra.build_info = Some(BuildInfo {
            memory_max_kib: static_max_kib,
            memory_target_kib: target_kib,
            kernel,
            vcpus: extra.vcpus,
            params: extra.boot.clone(),
        });
        extra.ty = Some(ty);
        d.extras.save(&self.vm, &extra)?;

        for leaf in &policy {
            d.hyper.domain_cpuid_set(domid, leaf)?;
        }
        if !policy.is_empty() {
            d.hyper.domain_cpuid_apply(domid)?;
        }

        info!(self.log, "domain built";
              "domid" => domid, "protocol" => &out.protocol);
        self.push_vm_update();
        Ok(())
    }

    async fn run_build_helper(
        &self,
        mode: HelperMode,
        domid: DomId,
        args: Vec<(String, String)>,
    ) -> Result<builder::BuildOutput, Error> {
        let mut session = HelperSession::spawn(
            HelperInvocation {
                helper_path: self.deps.config.helper_path.clone(),
                mode,
                domid,
                args,
                image: None,
            },
            self.task.clone(),
            self.log.clone(),
        )?;
        let words = loop {
            match session.next_event().await {
                Ok(HelperEvent::Done(words)) => break words,
                Ok(HelperEvent::Suspend) => {
                    return Err(Error::HelperProtocol(
                        "unexpected suspend frame during build".into(),
                    ));
                }
                Err(Error::HelperReported(text)) => {
                    return Err(Error::BuildFailed(text));
                }
                Err(e) => return Err(e),
            }
        };
        session.finish().await?;
        builder::parse_build_result(&words)
    }

    /// Runs the pluggable bootloader against the first bootable disk
    /// and yields the extracted kernel/ramdisk.
    async fn extract_boot_material(
        &self,
        indirect: &domaind_api_types::IndirectBoot,
        vbds: &[VbdSpec],
    ) -> Result<ExtractedBoot, Error> {
        let d = &self.deps;
        let boot_vbd = vbds
            .iter()
            .min_by_key(|v| v.device_number.unwrap_or(u32::MAX))
            .ok_or(Error::NoBootableDevice)?;
        let bootloader_path = d
            .config
            .bootloaders
            .get(&indirect.bootloader)
            .cloned()
            .ok_or_else(|| Error::BootloaderError {
                kind: indirect.bootloader.clone(),
                detail: "no such bootloader configured".into(),
            })?;
        let kind = indirect.bootloader.clone();
        let extra_args = indirect.extra_args.clone();
        let log = self.log.clone();

        with_disk(&d.storage, &boot_vbd.backend, false, &self.log, |path| {
            async move {
                let mut cmd = tokio::process::Command::new(&bootloader_path);
                cmd.arg("--output-format=simple").arg(&path);
                if let Some(extra) = &extra_args {
                    cmd.arg("--args").arg(extra);
                }
                info!(log, "running bootloader";
                      "bootloader" => &kind, "disk" => path.as_str());
                let output = cmd.output().await.map_err(|e| {
                    Error::BootloaderError {
                        kind: kind.clone(),
                        detail: format!("cannot spawn: {e}"),
                    }
                })?;
                if !output.status.success() {
                    return Err(Error::BootloaderError {
                        kind: kind.clone(),
                        detail: String::from_utf8_lossy(&output.stderr)
                            .into_owned(),
                    });
                }
                parse_bootloader_output(
                    &kind,
                    &String::from_utf8_lossy(&output.stdout),
                )
            }
        })
        .await
    }

    async fn publish_rings(
        &self,
        domid: DomId,
        store_mfn: u64,
        store_port: u32,
        console_mfn: u64,
        console_port: u32,
    ) -> Result<(), Error> {
        let d = &self.deps;
        let dom_path = paths::domain(domid);
        transaction(d.tree.as_ref(), |tx| {
            let t = d.tree.clone();
            let dom_path = dom_path.clone();
            async move {
                t.writev(
                    tx,
                    &dom_path,
                    &[
                        ("store/ring-ref".into(), store_mfn.to_string()),
                        ("store/port".into(), store_port.to_string()),
                        ("console/ring-ref".into(), console_mfn.to_string()),
                        ("console/port".into(), console_port.to_string()),
                    ],
                )
                .await
            }
        })
        .await
    }

    // ------------------------------------------------------------------
    // start / pause

    /// Starts a built domain: device model first when the guest needs
    /// one, then the unpause.
    pub async fn unpause(&self) -> Result<(), Error> {
        let d = &self.deps;
        let extra = self.load_extra()?;
        if extra.build_info.is_none() {
            return Err(Error::DomainNotBuilt);
        }
        self.start_device_model(&extra).await?;
        d.hyper.domain_unpause(extra.domid)?;
        self.notify_lifecycle(LifecycleEvent::StartedRunning);
        self.push_vm_update();
        Ok(())
    }

    pub async fn pause(&self) -> Result<(), Error> {
        let extra = self.load_extra()?;
        if extra.build_info.is_none() {
            return Err(Error::DomainNotBuilt);
        }
        self.deps.hyper.domain_pause(extra.domid)?;
        self.push_vm_update();
        Ok(())
    }

    /// Starts (or resumes) whatever display/emulation process the guest
    /// style requires, and publishes the VNC port.
    async fn start_device_model(&self, extra: &VmExtra) -> Result<(), Error> {
        let d = &self.deps;
        let domid = extra.domid;
        let platform = &extra.create_info.platform;
        let dm_state = d.extras.dm_state_path(&self.vm);

        if extra.create_info.hvm {
            let cfg = self.dm_config(extra).await?;
            if d.devices.device_model().is_running(domid).await {
                d.devices.device_model().resume(domid).await?;
            } else if dm_state.exists() {
                d.devices
                    .device_model()
                    .restore(domid, &cfg, &dm_state)
                    .await?;
            } else {
                d.devices.device_model().start(domid, &cfg).await?;
            }
        } else if platform.get("vnc").map(String::as_str) == Some("1") {
            let display = VncDisplay {
                listen_ip: platform
                    .get("vnclisten")
                    .cloned()
                    .unwrap_or_else(|| "127.0.0.1".to_string()),
                keymap: platform.get("keymap").cloned(),
            };
            d.devices.device_model().start_pv_console(domid, &display).await?;
        } else {
            return Ok(());
        }

        d.tree
            .write(
                TX_NONE,
                &format!("{}/console/vnc-port", paths::domain(domid)),
                &dm::vnc_port(domid).to_string(),
            )
            .await?;
        Ok(())
    }

    /// Assembles the device-model configuration from the persistent
    /// record.
    async fn dm_config(&self, extra: &VmExtra) -> Result<DmConfig, Error> {
        let hvm_boot = match &extra.boot {
            BootConfig::Hvm(h) => h.clone(),
            _ => {
                return Err(Error::InternalError(
                    "device model requested for a PV guest".into(),
                ));
            }
        };
        let platform = &extra.create_info.platform;

        let mut disks = Vec::new();
        for vbd in &extra.vbds {
            let devid = self
                .deps
                .devices
                .by_logical_id(&self.vm, "vbd", &vbd.id)
                .await?;
            let Some(devid) = devid else { continue };
            let private = paths::private(&self.vm, "vbd", devid);
            let params = read_opt(
                self.deps.tree.as_ref(),
                TX_NONE,
                &format!("{private}/params"),
            )
            .await?
            .unwrap_or_default();
            let device = DiskInterface::from_device_key(devid)?;
            disks.push((params, device.linux_device(), vbd.cdrom));
        }

        let nics = extra
            .vifs
            .iter()
            .map(|vif| {
                let bridge = match &vif.network {
                    NetworkKind::Bridge { bridge } => bridge.clone(),
                    NetworkKind::VSwitch { switch } => switch.clone(),
                    NetworkKind::Netback { .. } => String::new(),
                };
                (vif.mac.clone(), bridge, vif.position)
            })
            .collect();

        let display = if platform.get("vnc").map(String::as_str)
            != Some("0")
        {
            Some(VncDisplay {
                listen_ip: platform
                    .get("vnclisten")
                    .cloned()
                    .unwrap_or_else(|| "127.0.0.1".to_string()),
                keymap: platform.get("keymap").cloned(),
            })
        } else {
            None
        };

        Ok(DmConfig {
            memory_mib: memory::bytes_to_mib_ceil(extra.memory.static_max),
            boot_order: hvm_boot.boot_order.clone(),
            serial: platform.get("serial").cloned(),
            vcpus: extra.vcpus,
            nics,
            disks,
            pci_emulations: platform
                .get("pci-emulations")
                .map(|s| s.split(',').map(str::to_owned).collect())
                .unwrap_or_default(),
            pci_passthrough: !extra.pcis.is_empty(),
            usb: platform
                .get("usb")
                .map(|s| s.split(',').map(str::to_owned).collect())
                .unwrap_or_default(),
            acpi: hvm_boot.acpi,
            display,
            hvm: true,
            video_mib: hvm_boot.video_mib,
            extras: Vec::new(),
        })
    }

    // ------------------------------------------------------------------
    // shutdown handshake

    /// Writes the shutdown reason to `control/shutdown` and waits for
    /// the guest to acknowledge by clearing it. An HVM guest without PV
    /// drivers cannot see the node, so the hypervisor is told directly.
    /// Returns whether the request was acknowledged; the guest may
    /// still be alive either way.
    pub async fn request_shutdown(
        &self,
        reason: ShutdownReason,
        ack_delay: Duration,
    ) -> Result<bool, Error> {
        let d = &self.deps;
        let extra = self.load_extra()?;
        let domid = extra.domid;
        let token = reason.control_node_token().ok_or_else(|| {
            Error::InternalError(format!(
                "{reason:?} cannot be requested of a guest"
            ))
        })?;

        let dom_path = paths::domain(domid);
        let has_pv_drivers = read_opt(
            d.tree.as_ref(),
            TX_NONE,
            &format!("{dom_path}/data/updated"),
        )
        .await?
        .is_some();
        if extra.create_info.hvm && !has_pv_drivers {
            d.hyper.domain_shutdown(domid, reason)?;
            return Ok(true);
        }

        let node = format!("{dom_path}/control/shutdown");
        d.tree.write(TX_NONE, &node, token).await?;
        info!(self.log, "requested guest shutdown";
              "reason" => token,
              "ack_delay_ms" => ack_delay.as_millis() as u64);

        // Acknowledgement is the guest clearing (or deleting) the node.
        let acked = wait_path(d.tree.as_ref(), &node, ack_delay, |v| {
            matches!(v, None | Some(""))
        })
        .await?;
        Ok(acked)
    }

    // ------------------------------------------------------------------
    // suspend

    /// Drives the full suspend protocol and leaves a resumable image
    /// behind. The domain itself remains (shut down) for `destroy` to
    /// collect.
    pub async fn suspend(&self) -> Result<(), Error> {
        let d = &self.deps;
        let mut extra = self.load_extra()?;
        if extra.build_info.is_none() {
            return Err(Error::DomainNotBuilt);
        }
        let domid = extra.domid;
        let hvm = extra.create_info.hvm;

        let image_path = d.extras.suspend_image_path(&self.vm);
        let image = std::fs::File::create(&image_path)?;
        // The helper shares our file description, so its writes land
        // after the signature and our later appends land after its
        // payload.
        let helper_image = image.try_clone()?;
        let mut image = tokio::fs::File::from_std(image);
        builder::write_save_signature(&mut image).await?;

        let mode = if hvm { HelperMode::HvmSave } else { HelperMode::Save };
        let mut session = HelperSession::spawn(
            HelperInvocation {
                helper_path: d.config.helper_path.clone(),
                mode,
                domid,
                args: vec![(
                    "mem_max_kib".into(),
                    memory::bytes_to_kib(extra.memory.static_max).to_string(),
                )],
                image: Some(helper_image),
            },
            self.task.clone(),
            self.log.clone(),
        )?;

        let result = loop {
            if let Err(e) = self.task.check_cancel() {
                break Err(e);
            }
            match session.next_event().await {
                Ok(HelperEvent::Suspend) => {
                    self.task.set_subtask("waiting for guest to suspend");
                    let acked = match self
                        .request_shutdown(
                            ShutdownReason::Suspend,
                            d.config.timeouts.suspend_ack(),
                        )
                        .await
                    {
                        Ok(acked) => acked,
                        Err(e) => break Err(e),
                    };
                    if !acked {
                        break Err(Error::InternalError(
                            "guest did not acknowledge suspend".into(),
                        ));
                    }
                    let gone = match self
                        .wait_domain_shutdown(
                            domid,
                            d.config.timeouts.suspend_wait(),
                        )
                        .await
                    {
                        Ok(gone) => gone,
                        Err(e) => break Err(e),
                    };
                    if !gone {
                        break Err(Error::InternalError(
                            "guest did not finish suspending".into(),
                        ));
                    }
                    if let Err(e) = session.send_done().await {
                        break Err(e);
                    }
                }
                Ok(HelperEvent::Done(_)) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        if let Err(e) = result {
            // A failed save leaves no resumable image behind.
            drop(session);
            let _ = std::fs::remove_file(&image_path);
            return Err(e);
        }
        session.finish().await?;

        if hvm {
            let dm_state = d.extras.dm_state_path(&self.vm);
            d.devices.device_model().suspend(domid, &dm_state).await?;
            let blob = tokio::fs::read(&dm_state).await.map_err(|_| {
                Error::InternalError(
                    "device model produced no state blob".into(),
                )
            })?;
            builder::write_dm_record(&mut image, &blob).await?;
        }
        use tokio::io::AsyncWriteExt;
        image.flush().await?;
        image.sync_all().await?;

        // The measured footprint becomes the exact resume reservation.
        let final_info = d.hyper.domain_getinfo(domid)?;
        extra.suspend_memory_bytes =
            memory::pages_to_bytes(final_info.total_memory_pages);
        d.extras.save(&self.vm, &extra)?;

        // Flush and quiesce every block device, then let go of the
        // disks.
        d.devices.hard_shutdown_all_vbds(&self.vm, domid).await?;
        self.deactivate_plugged_disks().await;

        info!(self.log, "suspend complete";
              "domid" => domid,
              "suspend_memory_bytes" => extra.suspend_memory_bytes);
        self.notify_lifecycle(LifecycleEvent::Suspended);
        self.push_vm_update();
        Ok(())
    }

    async fn wait_domain_shutdown(
        &self,
        domid: DomId,
        timeout: Duration,
    ) -> Result<bool, Error> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.task.check_cancel()?;
            match self.deps.hyper.domain_getinfo(domid) {
                Ok(info) if info.shutdown => return Ok(true),
                // A vanished domain counts as shut down.
                Err(_) => return Ok(true),
                Ok(_) => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(SUSPEND_POLL).await;
        }
    }

    /// Deactivates every VDI backing a plugged VBD, best-effort.
    async fn deactivate_plugged_disks(&self) {
        let d = &self.deps;
        let devids = match d.devices.plugged_devids(&self.vm, "vbd").await {
            Ok(devids) => devids,
            Err(e) => {
                warn!(self.log, "cannot enumerate vbds for deactivation";
                      "error" => %e);
                return;
            }
        };
        for devid in devids {
            if let Err(e) = self.deactivate_vbd_disk(devid, false).await {
                warn!(self.log, "vdi deactivation failed";
                      "devid" => devid, "error" => %e);
            }
        }
    }

    /// Deactivates (and with `detach` also detaches) the storage behind
    /// one VBD, using the references recorded at plug time.
    async fn deactivate_vbd_disk(
        &self,
        devid: u32,
        detach: bool,
    ) -> Result<(), Error> {
        let d = &self.deps;
        let private = paths::private(&self.vm, "vbd", devid);
        let sr_path = format!("{private}/sr");
        let vdi_path = format!("{private}/vdi");
        let dp_path = format!("{private}/dp");
        let refs = futures::try_join!(
            read_opt(d.tree.as_ref(), TX_NONE, &sr_path),
            read_opt(d.tree.as_ref(), TX_NONE, &vdi_path),
            read_opt(d.tree.as_ref(), TX_NONE, &dp_path),
        )?;
        let (Some(sr), Some(vdi), Some(dp)) = refs else {
            // A local (CDROM-style) backend never touched the storage
            // daemon.
            return Ok(());
        };
        let sr = StorageRepo(sr);
        let vdi = VirtualDisk(vdi);
        let dp = Datapath(dp);
        d.storage.vdi_deactivate(&dp, &sr, &vdi).await?;
        if detach {
            d.storage.vdi_detach(&dp, &sr, &vdi).await?;
            d.storage.dp_destroy(&dp, false).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // restore

    /// Rebuilds a suspended guest from its image into the (re)created
    /// domain.
    pub async fn restore(&self) -> Result<(), Error> {
        let d = &self.deps;
        let mut extra = self.load_extra()?;
        if extra.suspend_memory_bytes == 0 {
            return Err(Error::InternalError(
                "no resumable suspend image exists".into(),
            ));
        }
        let domid = extra.domid;
        let hvm = extra.create_info.hvm;

        let image_path = d.extras.suspend_image_path(&self.vm);
        let image = std::fs::File::open(&image_path)
            .map_err(|_| Error::BadSignature)?;
        let helper_image = image.try_clone()?;
        let mut image = tokio::fs::File::from_std(image);
        builder::check_save_signature(&mut image).await?;

        let mode =
            if hvm { HelperMode::HvmRestore } else { HelperMode::Restore };
        let mut session = HelperSession::spawn(
            HelperInvocation {
                helper_path: d.config.helper_path.clone(),
                mode,
                domid,
                args: vec![(
                    "mem_max_kib".into(),
                    memory::bytes_to_kib(extra.memory.static_max).to_string(),
                )],
                image: Some(helper_image),
            },
            self.task.clone(),
            self.log.clone(),
        )?;
        let words = loop {
            match session.next_event().await? {
                HelperEvent::Done(words) => break words,
                HelperEvent::Suspend => {
                    return Err(Error::HelperProtocol(
                        "unexpected suspend frame during restore".into(),
                    ));
                }
            }
        };
        session.finish().await?;
        let (store_mfn, console_mfn) = builder::parse_restore_result(&words)?;

        // The helper advanced the shared offset to the end of its
        // payload; for HVM the device-model record follows.
        if hvm {
            let blob = builder::read_dm_record(&mut image).await?;
            tokio::fs::write(d.extras.dm_state_path(&self.vm), &blob).await?;
        }

        let store_port = d.hyper.evtchn_alloc_unbound(domid, 0)?;
        let console_port = d.hyper.evtchn_alloc_unbound(domid, 0)?;
        self.publish_rings(
            domid, store_mfn, store_port, console_mfn, console_port,
        )
        .await?;

        extra.suspend_memory_bytes = 0;
        d.extras.save(&self.vm, &extra)?;

        info!(self.log, "domain restored"; "domid" => domid);
        self.push_vm_update();
        Ok(())
    }

    // ------------------------------------------------------------------
    // destroy

    /// Tears everything down. The persistent record survives only when
    /// the domain went down for a suspend.
    pub async fn destroy(
        &self,
        preserve_vm_node: bool,
    ) -> Result<(), Error> {
        let d = &self.deps;
        let Some(extra) = d.extras.load(&self.vm)? else {
            return Ok(());
        };
        let domid = extra.domid;
        let info = d.hyper.domain_getinfo(domid).ok();
        let info = info.filter(|i| i.uuid == self.uuid());
        let suspended = info
            .as_ref()
            .and_then(|i| i.shutdown_code)
            .map(|c| c == shutdown_code::SUSPEND)
            .unwrap_or(extra.suspend_memory_bytes != 0);

        info!(self.log, "destroying domain";
              "domid" => domid, "suspended" => suspended);

        d.devices.device_model().stop(domid).await;

        if let Err(e) =
            d.devices.hard_shutdown_all_vbds(&self.vm, domid).await
        {
            warn!(self.log, "vbd teardown incomplete"; "error" => %e);
        }
        let devids = d
            .devices
            .plugged_devids(&self.vm, "vbd")
            .await
            .unwrap_or_default();
        for devid in devids {
            if let Err(e) = self.deactivate_vbd_disk(devid, true).await {
                warn!(self.log, "storage release failed";
                      "devid" => devid, "error" => %e);
            }
        }
        let release_failures = d.devices.release_all(&self.vm, domid).await;
        if release_failures > 0 {
            warn!(self.log, "hotplug release recorded failures";
                  "count" => release_failures);
        }

        if info.is_some() {
            if let Err(e) = d.hyper.domain_destroy(domid) {
                warn!(self.log, "hypervisor destroy failed"; "error" => %e);
            }
        }

        d.tree.rm(TX_NONE, &paths::domain(domid)).await?;
        if !preserve_vm_node {
            d.tree.rm(TX_NONE, &paths::vm(&self.vm)).await?;
        }

        if info.is_some() {
            self.wait_domain_gone(domid).await?;
        }

        if suspended {
            d.extras.save(&self.vm, &extra)?;
        } else {
            d.extras.remove(&self.vm)?;
        }

        self.notify_lifecycle(LifecycleEvent::Stopped);
        self.push_vm_update();
        Ok(())
    }

    /// Polls the domain list until the dying domain disappears. Past
    /// the wall budget the domain gets the sentinel handle stamped on
    /// it so operators can find it, and the caller gets
    /// [`Error::StuckInDyingState`].
    async fn wait_domain_gone(&self, domid: DomId) -> Result<(), Error> {
        let d = &self.deps;
        let budget = d.config.timeouts.destroy_budget();
        let interval = d.config.timeouts.destroy_poll_interval();
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            let present = d
                .hyper
                .domain_getinfolist(domid)?
                .iter()
                .any(|i| i.domid == domid);
            if !present {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                let sentinel = format!(
                    "deadbeef-dead-beef-dead-beef0000{domid:04x}"
                );
                warn!(self.log, "domain stuck in dying state";
                      "domid" => domid, "sentinel" => &sentinel);
                let _ = d.hyper.domain_sethandle(domid, &sentinel);
                return Err(Error::StuckInDyingState(domid));
            }
            tokio::time::sleep(interval.min(deadline.saturating_duration_since(
                tokio::time::Instant::now(),
            )))
            .await;
        }
    }

    // ------------------------------------------------------------------
    // lifecycle dispatch & guest reactions

    pub(crate) async fn handle_lifecycle_request(
        &self,
        request: ExternalRequest,
    ) -> Result<(), Error> {
        match request {
            ExternalRequest::Start => self.unpause().await,
            ExternalRequest::Reboot => {
                let acked = self
                    .request_shutdown(ShutdownReason::Reboot, REBOOT_ACK)
                    .await?;
                if !acked {
                    let extra = self.load_extra()?;
                    self.deps
                        .hyper
                        .domain_shutdown(extra.domid, ShutdownReason::Reboot)?;
                }
                Ok(())
            }
            ExternalRequest::Suspend => self.suspend().await,
            ExternalRequest::Stop { reason, ack_delay } => {
                let acked = self.request_shutdown(reason, ack_delay).await?;
                if !acked {
                    let extra = self.load_extra()?;
                    self.deps.hyper.domain_shutdown(extra.domid, reason)?;
                }
                Ok(())
            }
        }
    }

    /// Reacts to an observed guest shutdown (pushed by the event
    /// subsystem). Reboots re-enter the create/build path with the
    /// preserved record; everything else tears down.
    pub(crate) async fn react_to_guest_shutdown(
        &self,
        reason: ShutdownReason,
    ) -> Result<(), Error> {
        match reason {
            ShutdownReason::Reboot => {
                let extra = self.load_extra()?;
                let cfg = config_from_extra(&self.vm, &extra);
                self.destroy(true).await?;
                // destroy() erased the record; the rebuilt domain
                // starts from the preserved configuration.
                self.create(cfg).await?;
                self.build().await?;
                self.replug_devices(&extra).await?;
                self.unpause().await?;
                self.notify_lifecycle(LifecycleEvent::Rebooted);
                Ok(())
            }
            ShutdownReason::Suspend => Ok(()),
            ShutdownReason::PowerOff
            | ShutdownReason::Halt
            | ShutdownReason::Crash => self.destroy(false).await,
        }
    }

    async fn replug_devices(&self, old: &VmExtra) -> Result<(), Error> {
        for vbd in &old.vbds {
            self.vbd_plug(vbd.clone()).await?;
        }
        for vif in &old.vifs {
            self.vif_plug(vif.clone()).await?;
        }
        for pci in &old.pcis {
            self.pci_plug(pci.clone()).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // state queries

    pub async fn get_state(&self) -> Result<VmStateResponse, Error> {
        let d = &self.deps;
        let extra = d.extras.load(&self.vm)?;
        let info = self.live_domain()?;
        let Some(extra) = extra else {
            return Ok(VmStateResponse {
                id: self.vm.clone(),
                power_state: PowerState::Absent,
                domid: info.as_ref().map(|i| i.domid),
                suspend_memory_bytes: 0,
                vnc_port: None,
            });
        };

        let power_state = match &info {
            None => {
                if extra.suspend_memory_bytes != 0 {
                    PowerState::Suspended
                } else {
                    PowerState::Halted
                }
            }
            Some(i) if i.dying => PowerState::ShuttingDown,
            Some(i) if i.shutdown => match i.shutdown_code {
                Some(shutdown_code::REBOOT) => PowerState::Rebooting,
                Some(shutdown_code::CRASH) => PowerState::Crashed,
                _ => PowerState::Halted,
            },
            Some(i) if i.paused => {
                if extra.build_info.is_none() {
                    PowerState::Created
                } else {
                    PowerState::Paused
                }
            }
            Some(_) => PowerState::Running,
        };

        let vnc_port = read_opt(
            d.tree.as_ref(),
            TX_NONE,
            &format!("{}/console/vnc-port", paths::domain(extra.domid)),
        )
        .await?
        .and_then(|p| p.parse().ok());

        Ok(VmStateResponse {
            id: self.vm.clone(),
            power_state,
            domid: info.map(|i| i.domid),
            suspend_memory_bytes: extra.suspend_memory_bytes,
            vnc_port,
        })
    }

    /// The action the guest last asked for (observed from the
    /// hypervisor), if any.
    pub async fn domain_action_request(
        &self,
    ) -> Result<Option<ShutdownReason>, Error> {
        Ok(self
            .live_domain()?
            .and_then(|i| i.shutdown_code)
            .and_then(hyperctl::reason_of_code))
    }

    pub async fn get_internal_state(&self) -> Result<String, Error> {
        let extra = self.load_extra()?;
        Ok(serde_json::to_string(&extra)?)
    }

    pub async fn set_internal_state(
        &self,
        payload: &str,
    ) -> Result<(), Error> {
        let extra: VmExtra = serde_json::from_str(payload).map_err(|e| {
            Error::InternalError(format!("unparseable internal state: {e}"))
        })?;
        self.deps.extras.save(&self.vm, &extra)?;
        Ok(())
    }

    /// Lands an incoming suspend image in the state directory (the
    /// streaming half of a migration; runs on the slow lane).
    pub async fn receive_memory(&self, body: Vec<u8>) -> Result<(), Error> {
        let path = self.deps.extras.suspend_image_path(&self.vm);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("incoming");
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        info!(self.log, "received suspend image";
              "bytes" => body.len());
        Ok(())
    }

    // ------------------------------------------------------------------
    // device operations

    pub async fn vbd_plug(&self, spec: VbdSpec) -> Result<(), Error> {
        let d = &self.deps;
        let mut extra = self.load_extra()?;
        let domid = extra.domid;
        let hvm = extra.create_info.hvm;

        let (params, backend_domid, storage_refs) = match &spec.backend {
            DiskBackend::Local { path } => (path.clone(), 0, None),
            DiskBackend::Vdi { name } => {
                let (sr, vdi) = d.storage.get_by_name(name).await?;
                let dp = d
                    .storage
                    .dp_create(&format!("vm/{}/{}", self.vm, spec.id))
                    .await?;
                let read_write =
                    matches!(spec.mode, domaind_api_types::DiskMode::ReadWrite);
                let attach = async {
                    let info = d
                        .storage
                        .vdi_attach(&dp, &sr, &vdi, read_write)
                        .await?;
                    d.storage.vdi_activate(&dp, &sr, &vdi).await?;
                    Ok::<_, Error>(info)
                }
                .await;
                let info = match attach {
                    Ok(info) => info,
                    Err(e) => {
                        let _ = d.storage.vdi_detach(&dp, &sr, &vdi).await;
                        let _ = d.storage.dp_destroy(&dp, false).await;
                        return Err(e);
                    }
                };
                let backend_domid =
                    self.resolve_backend_domid(&info.backend_vm_uuid)?;
                (info.params, backend_domid, Some((sr, vdi, dp)))
            }
        };

        let plugged = d
            .devices
            .add_vbd(&self.vm, domid, backend_domid, &spec, &params, hvm)
            .await;
        let (devid, iface) = match plugged {
            Ok(v) => v,
            Err(e) => {
                if let Some((sr, vdi, dp)) = &storage_refs {
                    let _ = d.storage.vdi_deactivate(dp, sr, vdi).await;
                    let _ = d.storage.vdi_detach(dp, sr, vdi).await;
                    let _ = d.storage.dp_destroy(dp, false).await;
                }
                return Err(e);
            }
        };

        if let Some((sr, vdi, dp)) = storage_refs {
            let private = paths::private(&self.vm, "vbd", devid);
            d.tree
                .writev(
                    TX_NONE,
                    &private,
                    &[
                        ("sr".into(), sr.0),
                        ("vdi".into(), vdi.0),
                        ("dp".into(), dp.0),
                    ],
                )
                .await?;
        }

        extra.vbds.retain(|v| v.id != spec.id);
        extra.vbds.push(spec);
        d.extras.save(&self.vm, &extra)?;
        self.push_update(Update::Vbd {
            vm: self.vm.clone(),
            device: iface.linux_device(),
        });
        Ok(())
    }

    pub async fn vbd_unplug(
        &self,
        id: &str,
        force: bool,
    ) -> Result<(), Error> {
        let d = &self.deps;
        let mut extra = self.load_extra()?;
        let domid = extra.domid;
        let devid = d
            .devices
            .by_logical_id(&self.vm, "vbd", id)
            .await?
            .ok_or(Error::DoesNotExist)?;

        if force {
            d.devices.vbd_hard_shutdown(&self.vm, domid, devid).await?;
        } else {
            d.devices.vbd_clean_shutdown(&self.vm, domid, devid).await?;
        }
        if let Err(e) = self.deactivate_vbd_disk(devid, true).await {
            warn!(self.log, "storage release failed on unplug";
                  "devid" => devid, "error" => %e);
        }
        let iface = DiskInterface::from_device_key(devid)?;
        d.devices.release_device(&self.vm, domid, "vbd", devid).await?;

        extra.vbds.retain(|v| v.id != id);
        d.extras.save(&self.vm, &extra)?;
        self.push_update(Update::Vbd {
            vm: self.vm.clone(),
            device: iface.linux_device(),
        });
        Ok(())
    }

    pub async fn vbd_insert(
        &self,
        id: &str,
        backend: DiskBackend,
    ) -> Result<(), Error> {
        let d = &self.deps;
        let extra = self.load_extra()?;
        let devid = d
            .devices
            .by_logical_id(&self.vm, "vbd", id)
            .await?
            .ok_or(Error::DoesNotExist)?;
        let params = match &backend {
            DiskBackend::Local { path } => path.clone(),
            DiskBackend::Vdi { .. } => {
                return Err(Error::NotSupported);
            }
        };
        d.devices
            .vbd_media_insert(&self.vm, extra.domid, devid, &params)
            .await
    }

    pub async fn vbd_eject(&self, id: &str) -> Result<(), Error> {
        let d = &self.deps;
        let extra = self.load_extra()?;
        let devid = d
            .devices
            .by_logical_id(&self.vm, "vbd", id)
            .await?
            .ok_or(Error::DoesNotExist)?;
        d.devices.vbd_media_eject(&self.vm, extra.domid, devid).await
    }

    pub async fn vbd_state(
        &self,
        id: &str,
    ) -> Result<DeviceStateResponse, Error> {
        let d = &self.deps;
        let extra = self.load_extra()?;
        let devid = d.devices.by_logical_id(&self.vm, "vbd", id).await?;
        let Some(devid) = devid else {
            return Ok(DeviceStateResponse {
                plugged: false,
                media_ejected: None,
            });
        };
        let spec = extra.vbds.iter().find(|v| v.id == id);
        let media_ejected = if spec.map(|s| s.cdrom).unwrap_or(false) {
            Some(
                d.devices
                    .vbd_media_is_ejected(&self.vm, extra.domid, devid)
                    .await?,
            )
        } else {
            None
        };
        Ok(DeviceStateResponse { plugged: true, media_ejected })
    }

    /// Whether the guest asked for this device's media to be ejected.
    pub async fn vbd_action_request(
        &self,
        id: &str,
    ) -> Result<Option<String>, Error> {
        let d = &self.deps;
        let extra = self.load_extra()?;
        let devid = d
            .devices
            .by_logical_id(&self.vm, "vbd", id)
            .await?
            .ok_or(Error::DoesNotExist)?;
        let frontend = paths::frontend(extra.domid, "vbd", devid);
        Ok(read_opt(
            d.tree.as_ref(),
            TX_NONE,
            &format!("{frontend}/eject-request"),
        )
        .await?
        .map(|_| "eject".to_string()))
    }

    pub async fn vif_plug(&self, spec: VifSpec) -> Result<(), Error> {
        let d = &self.deps;
        let mut extra = self.load_extra()?;
        let backend_domid = match &spec.network {
            NetworkKind::Netback { vm, .. } => {
                let list = d.hyper.domain_getinfolist(0)?;
                list.into_iter()
                    .find(|i| i.uuid == vm.0)
                    .map(|i| i.domid)
                    .ok_or(Error::DoesNotExist)?
            }
            _ => 0,
        };
        let position = d
            .devices
            .add_vif(&self.vm, extra.domid, backend_domid, &spec)
            .await?;

        extra.vifs.retain(|v| v.position != spec.position);
        extra.vifs.push(spec);
        d.extras.save(&self.vm, &extra)?;
        self.push_update(Update::Vif { vm: self.vm.clone(), position });
        Ok(())
    }

    pub async fn vif_unplug(&self, position: u32) -> Result<(), Error> {
        let d = &self.deps;
        let mut extra = self.load_extra()?;
        let devid = d
            .devices
            .by_logical_id(&self.vm, "vif", &position.to_string())
            .await?
            .ok_or(Error::DoesNotExist)?;
        d.devices
            .release_device(&self.vm, extra.domid, "vif", devid)
            .await?;
        extra.vifs.retain(|v| v.position != position);
        d.extras.save(&self.vm, &extra)?;
        self.push_update(Update::Vif { vm: self.vm.clone(), position });
        Ok(())
    }

    pub async fn vif_state(
        &self,
        position: u32,
    ) -> Result<DeviceStateResponse, Error> {
        let plugged = self
            .deps
            .devices
            .by_logical_id(&self.vm, "vif", &position.to_string())
            .await?
            .is_some();
        Ok(DeviceStateResponse { plugged, media_ejected: None })
    }

    pub async fn pci_plug(&self, spec: PciSpec) -> Result<(), Error> {
        let d = &self.deps;
        let mut extra = self.load_extra()?;
        let hvm = extra.create_info.hvm;
        d.devices.add_pci(&self.vm, extra.domid, &spec, hvm).await?;
        let slot = spec.slot;
        extra.pcis.retain(|p| p.slot != slot);
        extra.pcis.push(spec);
        d.extras.save(&self.vm, &extra)?;
        self.push_update(Update::Pci { vm: self.vm.clone(), slot });
        Ok(())
    }

    pub async fn pci_unplug(&self, slot: u32) -> Result<(), Error> {
        let d = &self.deps;
        let mut extra = self.load_extra()?;
        let hvm = extra.create_info.hvm;
        d.devices.remove_pci(&self.vm, extra.domid, slot, hvm).await?;
        extra.pcis.retain(|p| p.slot != slot);
        d.extras.save(&self.vm, &extra)?;
        self.push_update(Update::Pci { vm: self.vm.clone(), slot });
        Ok(())
    }

    pub async fn pci_state(
        &self,
        slot: u32,
    ) -> Result<DeviceStateResponse, Error> {
        let plugged = self
            .deps
            .devices
            .by_logical_id(&self.vm, "pci", &slot.to_string())
            .await?
            .is_some();
        Ok(DeviceStateResponse { plugged, media_ejected: None })
    }

    /// Maps an attach-info backend VM uuid to its domain. Falls back to
    /// the control domain when the uuid is absent or carries no live
    /// domain (same-host passthrough).
    fn resolve_backend_domid(
        &self,
        backend_vm_uuid: &Option<String>,
    ) -> Result<DomId, Error> {
        let Some(uuid) = backend_vm_uuid else { return Ok(0) };
        let list = self.deps.hyper.domain_getinfolist(0)?;
        Ok(list
            .into_iter()
            .find(|i| &i.uuid == uuid)
            .map(|i| i.domid)
            .unwrap_or(0))
    }
}

fn flag(b: bool) -> String {
    if b { "1" } else { "0" }.to_string()
}

/// Rebuilds the caller-shaped configuration from the persistent record
/// (used by the reboot re-entry path).
pub(crate) fn config_from_extra(
    vm: &domaind_api_types::VmId,
    extra: &VmExtra,
) -> VmConfig {
    VmConfig {
        id: vm.clone(),
        create: extra.create_info.clone(),
        memory: extra.memory,
        vcpus: extra.vcpus,
        shadow_multiplier: extra.shadow_multiplier,
        boot: extra.boot.clone(),
    }
}

/// Extracts the CPUID policy from platform data: keys of the form
/// `cpuid/<leaf>/<reg>` (leaf decimal or 0x-hex), values 32-character
/// mask templates. Everything is validated here, before any hypervisor
/// call.
pub(crate) fn cpuid_policy_from_platform(
    platform: &BTreeMap<String, String>,
) -> Result<Vec<CpuidLeafPolicy>, Error> {
    let mut policy = Vec::new();
    for (key, value) in platform {
        let Some(rest) = key.strip_prefix("cpuid/") else { continue };
        let Some((leaf, reg)) = rest.split_once('/') else {
            return Err(Error::BadCpuidTemplate);
        };
        let (leaf, subleaf) = match leaf.split_once(':') {
            Some((l, s)) => {
                (l, Some(parse_leaf(s).ok_or(Error::BadCpuidTemplate)?))
            }
            None => (leaf, None),
        };
        let leaf = parse_leaf(leaf).ok_or(Error::BadCpuidTemplate)?;
        let reg = CpuidReg::parse(reg).ok_or(Error::BadCpuidTemplate)?;
        policy.push(CpuidLeafPolicy {
            leaf,
            subleaf,
            reg,
            template: RegTemplate::parse(value)?,
        });
    }
    Ok(policy)
}

fn parse_leaf(s: &str) -> Option<u32> {
    if let Some(hex) = s.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

/// Parses the bootloader's `--output-format=simple` report: one
/// `kernel`, optionally one `ramdisk`, and one `args` line. The
/// extracted files are temporaries and are scheduled for deletion.
fn parse_bootloader_output(
    kind: &str,
    stdout: &str,
) -> Result<ExtractedBoot, Error> {
    let mut kernel = None;
    let mut ramdisk = None;
    let mut cmdline = String::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = line.split_once(' ').unwrap_or((line, ""));
        match key {
            "kernel" => kernel = Some(value.trim().to_owned()),
            "ramdisk" => ramdisk = Some(value.trim().to_owned()),
            "args" => cmdline = value.trim().to_owned(),
            // Bootloaders chatter; only the structured lines matter.
            _ => {}
        }
    }
    let kernel = kernel.ok_or_else(|| Error::BootloaderError {
        kind: kind.to_owned(),
        detail: "no kernel in bootloader output".into(),
    })?;
    let mut delete = vec![kernel.clone()];
    if let Some(ramdisk) = &ramdisk {
        delete.push(ramdisk.clone());
    }
    Ok(ExtractedBoot { kernel, ramdisk, cmdline, delete })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cpuid_platform_keys_parse_and_validate() {
        let mut platform = BTreeMap::new();
        platform.insert(
            "cpuid/1/ecx".to_string(),
            format!("0{}", "k".repeat(31)),
        );
        platform.insert(
            "cpuid/0x80000001/edx".to_string(),
            "x".repeat(32),
        );
        platform.insert("viridian".to_string(), "1".to_string());

        let policy = cpuid_policy_from_platform(&platform).unwrap();
        assert_eq!(policy.len(), 2);
        assert!(policy.iter().any(|p| p.leaf == 1));
        assert!(policy.iter().any(|p| p.leaf == 0x8000_0001));

        platform
            .insert("cpuid/1/eax".to_string(), "bad-template".to_string());
        assert!(matches!(
            cpuid_policy_from_platform(&platform),
            Err(Error::BadCpuidTemplate)
        ));
    }

    #[test]
    fn bootloader_output_parses_and_schedules_cleanup() {
        let out = "\
            pygrub: booting guest\n\
            kernel /var/run/bl/kernel.1234\n\
            ramdisk /var/run/bl/ramdisk.1234\n\
            args root=/dev/xvda1 ro quiet\n";
        let boot = parse_bootloader_output("pygrub", out).unwrap();
        assert_eq!(boot.kernel, "/var/run/bl/kernel.1234");
        assert_eq!(boot.ramdisk.as_deref(), Some("/var/run/bl/ramdisk.1234"));
        assert_eq!(boot.cmdline, "root=/dev/xvda1 ro quiet");
        assert_eq!(boot.delete.len(), 2);

        assert!(matches!(
            parse_bootloader_output("pygrub", "args only\n"),
            Err(Error::BootloaderError { .. })
        ));
    }

    #[test]
    fn sentinel_uuid_embeds_the_domid() {
        let domid: DomId = 0x2a;
        let sentinel =
            format!("deadbeef-dead-beef-dead-beef0000{domid:04x}");
        assert_eq!(sentinel, "deadbeef-dead-beef-dead-beef0000002a");
        assert!(sentinel.starts_with("deadbeef-dead-beef-dead-beef0000"));
        assert_eq!(sentinel.len(), 36);
    }
}
