// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Supervision of the user-space device model that backs an HVM guest
//! (and of the lighter PV console/VNC process for a PV guest with a
//! framebuffer).
//!
//! The model is driven over its stdin: `save <path>`, `cont`, and
//! `pci-insert`/`pci-remove` lines. Termination is SIGTERM with a grace
//! period, then SIGKILL.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use domaind_api_types::{DomId, Error};
use slog::{info, warn, Logger};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;

/// The VNC display configuration of an emulated framebuffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VncDisplay {
    pub listen_ip: String,
    pub keymap: Option<String>,
}

/// Everything the device model needs to know about its guest.
#[derive(Clone, Debug, PartialEq)]
pub struct DmConfig {
    pub memory_mib: u64,
    pub boot_order: String,
    pub serial: Option<String>,
    pub vcpus: u32,
    /// (mac, bridge, position)
    pub nics: Vec<(String, String, u32)>,
    /// (params, guest device, is cdrom)
    pub disks: Vec<(String, String, bool)>,
    pub pci_emulations: Vec<String>,
    pub pci_passthrough: bool,
    pub usb: Vec<String>,
    pub acpi: bool,
    pub display: Option<VncDisplay>,
    pub hvm: bool,
    pub video_mib: u64,
    /// Raw extra flags, passed through after validation at the RPC
    /// boundary.
    pub extras: Vec<(String, Option<String>)>,
}

struct DmProcess {
    child: Child,
    stdin: Option<ChildStdin>,
}

pub struct DeviceModel {
    binary: PathBuf,
    pv_binary: PathBuf,
    stop_grace: Duration,
    children: Mutex<HashMap<DomId, DmProcess>>,
    log: Logger,
}

/// The VNC port for a domain's display: the conventional base plus the
/// domain id.
pub fn vnc_port(domid: DomId) -> u16 {
    5900u16.wrapping_add(domid as u16)
}

impl DeviceModel {
    pub fn new(
        binary: PathBuf,
        pv_binary: PathBuf,
        stop_grace: Duration,
        log: Logger,
    ) -> Self {
        Self {
            binary,
            pv_binary,
            stop_grace,
            children: Mutex::new(HashMap::new()),
            log,
        }
    }

    /// Builds the device model argument vector. Pure; unit-tested
    /// directly.
    pub fn argv(domid: DomId, cfg: &DmConfig) -> Vec<String> {
        let mut args = vec![
            "-d".to_string(),
            domid.to_string(),
            "-m".to_string(),
            cfg.memory_mib.to_string(),
            "-vcpus".to_string(),
            cfg.vcpus.to_string(),
            "-boot".to_string(),
            cfg.boot_order.clone(),
        ];
        if let Some(serial) = &cfg.serial {
            args.push("-serial".to_string());
            args.push(serial.clone());
        }
        if cfg.acpi {
            args.push("-acpi".to_string());
        }
        if cfg.pci_passthrough {
            args.push("-priv".to_string());
        }
        for (mac, bridge, position) in &cfg.nics {
            args.push("-net".to_string());
            args.push(format!(
                "nic,vlan={position},macaddr={mac},model=rtl8139"
            ));
            args.push("-net".to_string());
            args.push(format!("tap,vlan={position},bridge={bridge}"));
        }
        for (params, device, cdrom) in &cfg.disks {
            let media = if *cdrom { "cdrom" } else { "disk" };
            args.push("-drive".to_string());
            args.push(format!("file={params},if={device},media={media}"));
        }
        for emulation in &cfg.pci_emulations {
            args.push("-pciemulation".to_string());
            args.push(emulation.clone());
        }
        for usb in &cfg.usb {
            args.push("-usbdevice".to_string());
            args.push(usb.clone());
        }
        args.push("-videoram".to_string());
        args.push(cfg.video_mib.to_string());
        match &cfg.display {
            Some(display) => {
                args.push("-vnc".to_string());
                args.push(format!(
                    "{}:{}",
                    display.listen_ip,
                    domid
                ));
                if let Some(keymap) = &display.keymap {
                    args.push("-k".to_string());
                    args.push(keymap.clone());
                }
            }
            None => args.push("-nographic".to_string()),
        }
        for (flag, value) in &cfg.extras {
            args.push(format!("-{flag}"));
            if let Some(value) = value {
                args.push(value.clone());
            }
        }
        args
    }

    async fn spawn(
        &self,
        binary: &std::path::Path,
        domid: DomId,
        args: Vec<String>,
    ) -> Result<(), Error> {
        let mut cmd = Command::new(binary);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let mut child = cmd.spawn().map_err(|e| {
            Error::InternalError(format!(
                "cannot spawn device model {}: {e}",
                binary.display()
            ))
        })?;
        let stdin = child.stdin.take();
        info!(self.log, "started device model";
              "domid" => domid, "binary" => %binary.display());
        self.children
            .lock()
            .await
            .insert(domid, DmProcess { child, stdin });
        Ok(())
    }

    /// Starts the model for a fresh HVM domain.
    pub async fn start(
        &self,
        domid: DomId,
        cfg: &DmConfig,
    ) -> Result<(), Error> {
        self.spawn(&self.binary, domid, Self::argv(domid, cfg)).await
    }

    /// Starts the model restoring from a saved state blob.
    pub async fn restore(
        &self,
        domid: DomId,
        cfg: &DmConfig,
        state_path: &std::path::Path,
    ) -> Result<(), Error> {
        let mut args = Self::argv(domid, cfg);
        args.push("-loadvm".to_string());
        args.push(state_path.display().to_string());
        self.spawn(&self.binary, domid, args).await
    }

    /// Starts the PV console/VNC process for a PV guest with a
    /// framebuffer.
    pub async fn start_pv_console(
        &self,
        domid: DomId,
        display: &VncDisplay,
    ) -> Result<(), Error> {
        let args = vec![
            "-d".to_string(),
            domid.to_string(),
            "-vnc".to_string(),
            format!("{}:{}", display.listen_ip, domid),
        ];
        self.spawn(&self.pv_binary, domid, args).await
    }

    pub async fn is_running(&self, domid: DomId) -> bool {
        self.children.lock().await.contains_key(&domid)
    }

    async fn command(&self, domid: DomId, line: &str) -> Result<(), Error> {
        let mut children = self.children.lock().await;
        let proc = children
            .get_mut(&domid)
            .ok_or(Error::DeviceNotConnected)?;
        let stdin = proc.stdin.as_mut().ok_or_else(|| {
            Error::InternalError("device model stdin closed".into())
        })?;
        stdin.write_all(format!("{line}\n").as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Tells the model to dump its state to `state_path` and pause.
    pub async fn suspend(
        &self,
        domid: DomId,
        state_path: &std::path::Path,
    ) -> Result<(), Error> {
        self.command(domid, &format!("save {}", state_path.display())).await
    }

    /// Resumes a model paused by suspend or started by restore.
    pub async fn resume(&self, domid: DomId) -> Result<(), Error> {
        self.command(domid, "cont").await
    }

    pub async fn plug_pci(
        &self,
        domid: DomId,
        host_address: &str,
    ) -> Result<(), Error> {
        self.command(domid, &format!("pci-insert {host_address}")).await
    }

    pub async fn unplug_pci(
        &self,
        domid: DomId,
        host_address: &str,
    ) -> Result<(), Error> {
        self.command(domid, &format!("pci-remove {host_address}")).await
    }

    /// Stops the model: SIGTERM, a grace period, then SIGKILL. Absent
    /// models are fine (PV guests without framebuffers never had one).
    pub async fn stop(&self, domid: DomId) {
        let Some(mut proc) = self.children.lock().await.remove(&domid)
        else {
            return;
        };
        drop(proc.stdin.take());
        if let Some(pid) = proc.child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        match tokio::time::timeout(self.stop_grace, proc.child.wait()).await {
            Ok(Ok(status)) => {
                info!(self.log, "device model exited";
                      "domid" => domid, "status" => %status);
            }
            Ok(Err(e)) => {
                warn!(self.log, "cannot reap device model";
                      "domid" => domid, "error" => %e);
            }
            Err(_) => {
                warn!(self.log, "device model ignored SIGTERM, killing";
                      "domid" => domid);
                let _ = proc.child.kill().await;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_cfg() -> DmConfig {
        DmConfig {
            memory_mib: 2048,
            boot_order: "cd".into(),
            serial: Some("pty".into()),
            vcpus: 2,
            nics: vec![("0a:00:00:00:00:01".into(), "xenbr0".into(), 0)],
            disks: vec![
                ("/dev/loop0".into(), "hda".into(), false),
                ("/isos/a.iso".into(), "hdc".into(), true),
            ],
            pci_emulations: vec![],
            pci_passthrough: false,
            usb: vec!["tablet".into()],
            acpi: true,
            display: Some(VncDisplay {
                listen_ip: "127.0.0.1".into(),
                keymap: Some("en-us".into()),
            }),
            hvm: true,
            video_mib: 8,
            extras: vec![("monitor".into(), Some("null".into()))],
        }
    }

    #[test]
    fn argv_reflects_the_configuration() {
        let args = DeviceModel::argv(4, &sample_cfg());
        let joined = args.join(" ");
        assert!(joined.contains("-d 4"));
        assert!(joined.contains("-m 2048"));
        assert!(joined.contains("-vcpus 2"));
        assert!(joined.contains("-boot cd"));
        assert!(joined.contains("-acpi"));
        assert!(joined.contains("macaddr=0a:00:00:00:00:01"));
        assert!(joined.contains("file=/isos/a.iso,if=hdc,media=cdrom"));
        assert!(joined.contains("-usbdevice tablet"));
        assert!(joined.contains("-vnc 127.0.0.1:4"));
        assert!(joined.contains("-k en-us"));
        assert!(joined.contains("-monitor null"));
    }

    #[test]
    fn headless_models_get_nographic() {
        let mut cfg = sample_cfg();
        cfg.display = None;
        let args = DeviceModel::argv(4, &cfg);
        assert!(args.contains(&"-nographic".to_string()));
        assert!(!args.join(" ").contains("-vnc"));
    }

    #[test]
    fn vnc_ports_follow_the_domain_id() {
        assert_eq!(vnc_port(0), 5900);
        assert_eq!(vnc_port(12), 5912);
    }
}
