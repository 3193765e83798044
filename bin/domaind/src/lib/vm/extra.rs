// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The persistent per-VM record and its on-disk store.
//!
//! A [`VmExtra`] exists exactly as long as some host-side resource
//! (reservation, device frontend, suspend image, device-model process)
//! survives for the VM. Records are single JSON files written with a
//! temp-file + rename so a crash mid-write leaves the previous record
//! intact.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use domaind_api_types::{
    BootConfig, CreateInfo, DomId, Error, MemoryConfig, PciSpec, VbdSpec,
    VifSpec, VmId,
};
use serde::{Deserialize, Serialize};

/// The builder flavor a domain was built with; restore must use the
/// same one.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum BuilderKind {
    Hvm,
    PvDirect,
    PvIndirect,
}

/// What the builder helper was actually given, preserved so that resume
/// can rebuild an identical domain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub memory_max_kib: u64,
    pub memory_target_kib: u64,
    /// The kernel handed to the helper. For an indirect build this was a
    /// bootloader-extracted temporary and is gone; the bootloader runs
    /// again on resume.
    pub kernel: Option<String>,
    pub vcpus: u32,
    pub params: BootConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VmExtra {
    pub domid: DomId,
    pub create_info: CreateInfo,
    /// The caller's boot description, consumed by `build` (and again on
    /// resume).
    pub boot: BootConfig,
    pub build_info: Option<BuildInfo>,
    pub vcpus: u32,
    pub shadow_multiplier: f64,
    pub memory: MemoryConfig,
    /// Nonzero exactly when a resumable suspend image exists; the value
    /// is the measured final footprint (pages × page size).
    pub suspend_memory_bytes: u64,
    pub ty: Option<BuilderKind>,
    /// Snapshot of the plugged frontends, needed to regenerate the
    /// device-model disk model and to flush devices on suspend.
    pub vbds: Vec<VbdSpec>,
    pub vifs: Vec<VifSpec>,
    pub pcis: Vec<PciSpec>,
    pub last_create_time: u64,
}

impl VmExtra {
    pub fn new(
        create_info: CreateInfo,
        boot: BootConfig,
        memory: MemoryConfig,
        vcpus: u32,
        shadow_multiplier: f64,
    ) -> Self {
        Self {
            domid: 0,
            create_info,
            boot,
            build_info: None,
            vcpus,
            shadow_multiplier,
            memory,
            suspend_memory_bytes: 0,
            ty: None,
            vbds: Vec::new(),
            vifs: Vec::new(),
            pcis: Vec::new(),
            last_create_time: now_secs(),
        }
    }
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// The on-disk store: one subtree per VM under the state root.
pub struct ExtraStore {
    root: PathBuf,
}

impl ExtraStore {
    pub fn new(root: PathBuf) -> Result<Self, Error> {
        std::fs::create_dir_all(root.join("vm"))?;
        Ok(Self { root })
    }

    /// The VM's state directory (also holds its suspend image and
    /// device-model record).
    pub fn vm_dir(&self, vm: &VmId) -> PathBuf {
        self.root.join("vm").join(&vm.0)
    }

    fn record_path(&self, vm: &VmId) -> PathBuf {
        self.vm_dir(vm).join("extra.json")
    }

    /// Where a suspend image for this VM lives.
    pub fn suspend_image_path(&self, vm: &VmId) -> PathBuf {
        self.vm_dir(vm).join("suspend-image")
    }

    /// Where the device-model state blob for this VM lives while the
    /// guest is suspended.
    pub fn dm_state_path(&self, vm: &VmId) -> PathBuf {
        self.vm_dir(vm).join("dm-state")
    }

    pub fn save(&self, vm: &VmId, extra: &VmExtra) -> Result<(), Error> {
        let dir = self.vm_dir(vm);
        std::fs::create_dir_all(&dir)?;
        let tmp = dir.join(".extra.json.tmp");
        let encoded = serde_json::to_vec_pretty(extra)?;
        {
            use std::io::Write;
            let mut f = std::fs::File::create(&tmp)?;
            f.write_all(&encoded)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, self.record_path(vm))?;
        Ok(())
    }

    pub fn load(&self, vm: &VmId) -> Result<Option<VmExtra>, Error> {
        let raw = match std::fs::read(self.record_path(vm)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let extra = serde_json::from_slice(&raw).map_err(|e| {
            Error::InternalError(format!(
                "corrupt record for {}: {e}",
                vm.0
            ))
        })?;
        Ok(Some(extra))
    }

    /// Removes the VM's whole subtree (record, suspend image, DM state).
    pub fn remove(&self, vm: &VmId) -> Result<(), Error> {
        match std::fs::remove_dir_all(self.vm_dir(vm)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list(&self) -> Result<Vec<VmId>, Error> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(self.root.join("vm"))? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                out.push(VmId(entry.file_name().to_string_lossy().into_owned()));
            }
        }
        out.sort();
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::BTreeMap;

    fn sample_extra() -> VmExtra {
        VmExtra::new(
            CreateInfo {
                hvm: false,
                ssidref: 0,
                name: "guest".into(),
                xenstore_data: BTreeMap::new(),
                platform: BTreeMap::new(),
            },
            BootConfig::Direct(domaind_api_types::DirectBoot {
                kernel: "/boot/guest".into(),
                cmdline: "root=/dev/xvda1".into(),
                ramdisk: None,
            }),
            MemoryConfig {
                static_max: 256 << 20,
                dynamic_min: 128 << 20,
                dynamic_max: 256 << 20,
            },
            2,
            1.0,
        )
    }

    #[test]
    fn records_survive_a_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ExtraStore::new(dir.path().to_path_buf()).unwrap();
        let vm = VmId("11111111-1111-1111-1111-111111111111".into());

        assert!(store.load(&vm).unwrap().is_none());

        let mut extra = sample_extra();
        extra.domid = 12;
        extra.suspend_memory_bytes = 4096 * 1000;
        store.save(&vm, &extra).unwrap();

        let loaded = store.load(&vm).unwrap().unwrap();
        assert_eq!(loaded, extra);
        assert_eq!(store.list().unwrap(), vec![vm.clone()]);

        // No temp file is left behind after a save.
        let leftovers: Vec<_> = std::fs::read_dir(store.vm_dir(&vm))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with('.'))
            .collect();
        assert!(leftovers.is_empty(), "stray temp files: {leftovers:?}");
    }

    #[test]
    fn saves_overwrite_atomically_and_remove_is_recursive() {
        let dir = tempfile::tempdir().unwrap();
        let store = ExtraStore::new(dir.path().to_path_buf()).unwrap();
        let vm = VmId("22222222-2222-2222-2222-222222222222".into());

        let mut extra = sample_extra();
        store.save(&vm, &extra).unwrap();
        extra.domid = 99;
        store.save(&vm, &extra).unwrap();
        assert_eq!(store.load(&vm).unwrap().unwrap().domid, 99);

        // A suspend image sits alongside the record and is removed with
        // it.
        std::fs::write(store.suspend_image_path(&vm), b"image").unwrap();
        store.remove(&vm).unwrap();
        assert!(store.load(&vm).unwrap().is_none());
        assert!(!store.suspend_image_path(&vm).exists());

        // Removing an absent record is fine.
        store.remove(&vm).unwrap();
    }

    #[test]
    fn corrupt_records_fail_loudly() {
        let dir = tempfile::tempdir().unwrap();
        let store = ExtraStore::new(dir.path().to_path_buf()).unwrap();
        let vm = VmId("33333333-3333-3333-3333-333333333333".into());
        std::fs::create_dir_all(store.vm_dir(&vm)).unwrap();
        std::fs::write(store.vm_dir(&vm).join("extra.json"), b"{nope")
            .unwrap();
        assert!(matches!(
            store.load(&vm),
            Err(Error::InternalError(_))
        ));
    }
}
