// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client for the external storage daemon: resolving disk names to
//! (repository, disk) pairs and driving the attach / activate /
//! deactivate / detach lifecycle of a virtual disk image.
//!
//! The scoped [`with_disk`] helper is how the engine touches disk
//! contents (bootloader runs, mostly): it guarantees deactivate + detach
//! on every exit path, including the body's failure.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use domaind_api_types::{DiskBackend, Error};
use slog::{warn, Logger};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

/// A storage repository, identified by uuid.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StorageRepo(pub String);

/// A virtual disk image within a repository, identified by uuid.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VirtualDisk(pub String);

/// A datapath: the storage daemon's name for one consumer's use of a
/// disk.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Datapath(pub String);

/// What an attach yields: the backend parameter string (a local device
/// path or a backend-specific token) and, when the backend runs inside a
/// guest, that guest's uuid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttachInfo {
    pub params: String,
    pub backend_vm_uuid: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StorageService: Send + Sync {
    async fn get_by_name(
        &self,
        name: &str,
    ) -> Result<(StorageRepo, VirtualDisk), Error>;

    async fn dp_create(&self, id: &str) -> Result<Datapath, Error>;
    async fn dp_destroy(
        &self,
        dp: &Datapath,
        allow_leak: bool,
    ) -> Result<(), Error>;

    async fn vdi_attach(
        &self,
        dp: &Datapath,
        sr: &StorageRepo,
        vdi: &VirtualDisk,
        read_write: bool,
    ) -> Result<AttachInfo, Error>;
    async fn vdi_activate(
        &self,
        dp: &Datapath,
        sr: &StorageRepo,
        vdi: &VirtualDisk,
    ) -> Result<(), Error>;
    async fn vdi_deactivate(
        &self,
        dp: &Datapath,
        sr: &StorageRepo,
        vdi: &VirtualDisk,
    ) -> Result<(), Error>;
    async fn vdi_detach(
        &self,
        dp: &Datapath,
        sr: &StorageRepo,
        vdi: &VirtualDisk,
    ) -> Result<(), Error>;

    async fn vdi_set_content_id(
        &self,
        sr: &StorageRepo,
        vdi: &VirtualDisk,
        content_id: &str,
    ) -> Result<(), Error>;
    async fn vdi_similar_content(
        &self,
        sr: &StorageRepo,
        vdi: &VirtualDisk,
    ) -> Result<Vec<VirtualDisk>, Error>;
    async fn vdi_clone(
        &self,
        sr: &StorageRepo,
        vdi: &VirtualDisk,
    ) -> Result<VirtualDisk, Error>;
    #[cfg_attr(test, mockall::concretize)]
    async fn vdi_snapshot(
        &self,
        sr: &StorageRepo,
        vdi: &VirtualDisk,
        mirror_url: Option<&str>,
    ) -> Result<VirtualDisk, Error>;
    async fn vdi_compose(
        &self,
        sr: &StorageRepo,
        parent: &VirtualDisk,
        child: &VirtualDisk,
    ) -> Result<(), Error>;
}

/// Attaches and activates `disk`, hands `f` a usable local device path,
/// and tears everything down afterwards no matter how `f` exits. A
/// host-local path skips the storage daemon entirely.
pub async fn with_disk<T, F, Fut>(
    storage: &Arc<dyn StorageService>,
    disk: &DiskBackend,
    read_write: bool,
    log: &Logger,
    f: F,
) -> Result<T, Error>
where
    F: FnOnce(String) -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
{
    let name = match disk {
        DiskBackend::Local { path } => return f(path.clone()).await,
        DiskBackend::Vdi { name } => name,
    };

    let (sr, vdi) = storage.get_by_name(name).await?;
    let dp = storage.dp_create(&format!("domaind/{name}")).await?;

    let attached = async {
        let info = storage.vdi_attach(&dp, &sr, &vdi, read_write).await?;
        storage.vdi_activate(&dp, &sr, &vdi).await?;
        Ok::<_, Error>(info)
    }
    .await;

    let info = match attached {
        Ok(info) => info,
        Err(e) => {
            // The attach may or may not have happened; let the daemon
            // clean up whatever did.
            best_effort(log, "detach after failed attach", async {
                storage.vdi_detach(&dp, &sr, &vdi).await
            })
            .await;
            best_effort(log, "destroy datapath after failed attach", async {
                storage.dp_destroy(&dp, false).await
            })
            .await;
            return Err(e);
        }
    };

    let result = f(info.params.clone()).await;

    best_effort(log, "deactivate disk", async {
        storage.vdi_deactivate(&dp, &sr, &vdi).await
    })
    .await;
    best_effort(log, "detach disk", async {
        storage.vdi_detach(&dp, &sr, &vdi).await
    })
    .await;
    best_effort(log, "destroy datapath", async {
        storage.dp_destroy(&dp, false).await
    })
    .await;

    result
}

async fn best_effort<F>(log: &Logger, what: &str, fut: F)
where
    F: std::future::Future<Output = Result<(), Error>>,
{
    if let Err(e) = fut.await {
        warn!(log, "best-effort cleanup failed"; "op" => what, "error" => %e);
    }
}

/// The production client: one newline-delimited JSON exchange per call
/// over the storage daemon's unix socket.
pub struct SocketStorage {
    socket: PathBuf,
}

impl SocketStorage {
    pub fn new(socket: PathBuf) -> Self {
        Self { socket }
    }

    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, Error> {
        let stream = UnixStream::connect(&self.socket).await.map_err(|e| {
            Error::IoError(format!("storage daemon unreachable: {e}"))
        })?;
        let (rd, mut wr) = stream.into_split();
        let mut line = serde_json::to_vec(
            &serde_json::json!({ "method": method, "params": params }),
        )?;
        line.push(b'\n');
        wr.write_all(&line).await?;

        let mut resp_line = String::new();
        BufReader::new(rd).read_line(&mut resp_line).await?;
        let resp: serde_json::Value = serde_json::from_str(&resp_line)?;
        if let Some(err) = resp.get("error") {
            if err.get("kind").and_then(|k| k.as_str()) == Some("not_found") {
                return Err(Error::DoesNotExist);
            }
            return Err(Error::IoError(format!("storage daemon: {err}")));
        }
        Ok(resp.get("result").cloned().unwrap_or(serde_json::Value::Null))
    }

    fn str_field(v: &serde_json::Value, key: &str) -> Result<String, Error> {
        v.get(key)
            .and_then(|s| s.as_str())
            .map(str::to_owned)
            .ok_or_else(|| {
                Error::InternalError(format!(
                    "storage reply missing field {key}"
                ))
            })
    }
}

#[async_trait]
impl StorageService for SocketStorage {
    async fn get_by_name(
        &self,
        name: &str,
    ) -> Result<(StorageRepo, VirtualDisk), Error> {
        let v = self
            .call("VDI.get_by_name", serde_json::json!({ "name": name }))
            .await?;
        Ok((
            StorageRepo(Self::str_field(&v, "sr")?),
            VirtualDisk(Self::str_field(&v, "vdi")?),
        ))
    }

    async fn dp_create(&self, id: &str) -> Result<Datapath, Error> {
        let v =
            self.call("DP.create", serde_json::json!({ "id": id })).await?;
        Ok(Datapath(Self::str_field(&v, "dp")?))
    }

    async fn dp_destroy(
        &self,
        dp: &Datapath,
        allow_leak: bool,
    ) -> Result<(), Error> {
        self.call(
            "DP.destroy",
            serde_json::json!({ "dp": dp.0, "allow_leak": allow_leak }),
        )
        .await
        .map(|_| ())
    }

    async fn vdi_attach(
        &self,
        dp: &Datapath,
        sr: &StorageRepo,
        vdi: &VirtualDisk,
        read_write: bool,
    ) -> Result<AttachInfo, Error> {
        let v = self
            .call(
                "VDI.attach",
                serde_json::json!({
                    "dp": dp.0, "sr": sr.0, "vdi": vdi.0, "rw": read_write,
                }),
            )
            .await?;
        Ok(AttachInfo {
            params: Self::str_field(&v, "params")?,
            backend_vm_uuid: v
                .get("backend_vm")
                .and_then(|s| s.as_str())
                .map(str::to_owned),
        })
    }

    async fn vdi_activate(
        &self,
        dp: &Datapath,
        sr: &StorageRepo,
        vdi: &VirtualDisk,
    ) -> Result<(), Error> {
        self.call(
            "VDI.activate",
            serde_json::json!({ "dp": dp.0, "sr": sr.0, "vdi": vdi.0 }),
        )
        .await
        .map(|_| ())
    }

    async fn vdi_deactivate(
        &self,
        dp: &Datapath,
        sr: &StorageRepo,
        vdi: &VirtualDisk,
    ) -> Result<(), Error> {
        self.call(
            "VDI.deactivate",
            serde_json::json!({ "dp": dp.0, "sr": sr.0, "vdi": vdi.0 }),
        )
        .await
        .map(|_| ())
    }

    async fn vdi_detach(
        &self,
        dp: &Datapath,
        sr: &StorageRepo,
        vdi: &VirtualDisk,
    ) -> Result<(), Error> {
        self.call(
            "VDI.detach",
            serde_json::json!({ "dp": dp.0, "sr": sr.0, "vdi": vdi.0 }),
        )
        .await
        .map(|_| ())
    }

    async fn vdi_set_content_id(
        &self,
        sr: &StorageRepo,
        vdi: &VirtualDisk,
        content_id: &str,
    ) -> Result<(), Error> {
        self.call(
            "VDI.set_content_id",
            serde_json::json!({
                "sr": sr.0, "vdi": vdi.0, "content_id": content_id,
            }),
        )
        .await
        .map(|_| ())
    }

    async fn vdi_similar_content(
        &self,
        sr: &StorageRepo,
        vdi: &VirtualDisk,
    ) -> Result<Vec<VirtualDisk>, Error> {
        let v = self
            .call(
                "VDI.similar_content",
                serde_json::json!({ "sr": sr.0, "vdi": vdi.0 }),
            )
            .await?;
        Ok(v.as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|e| e.as_str())
                    .map(|s| VirtualDisk(s.to_owned()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn vdi_clone(
        &self,
        sr: &StorageRepo,
        vdi: &VirtualDisk,
    ) -> Result<VirtualDisk, Error> {
        let v = self
            .call(
                "VDI.clone",
                serde_json::json!({ "sr": sr.0, "vdi": vdi.0 }),
            )
            .await?;
        Ok(VirtualDisk(Self::str_field(&v, "vdi")?))
    }

    async fn vdi_snapshot(
        &self,
        sr: &StorageRepo,
        vdi: &VirtualDisk,
        mirror_url: Option<&str>,
    ) -> Result<VirtualDisk, Error> {
        let v = self
            .call(
                "VDI.snapshot",
                serde_json::json!({
                    "sr": sr.0, "vdi": vdi.0, "mirror_url": mirror_url,
                }),
            )
            .await?;
        Ok(VirtualDisk(Self::str_field(&v, "vdi")?))
    }

    async fn vdi_compose(
        &self,
        sr: &StorageRepo,
        parent: &VirtualDisk,
        child: &VirtualDisk,
    ) -> Result<(), Error> {
        self.call(
            "VDI.compose",
            serde_json::json!({
                "sr": sr.0, "parent": parent.0, "child": child.0,
            }),
        )
        .await
        .map(|_| ())
    }
}

/// A simulated storage daemon with attachment accounting for the tests.
#[derive(Default)]
struct SimStorageInner {
    /// name -> (sr uuid, vdi uuid, device path, backend vm uuid)
    disks: HashMap<String, (String, String, String, Option<String>)>,
    /// (dp, vdi) -> activated
    attachments: HashMap<(String, String), bool>,
    fail_activate: bool,
}

#[derive(Clone, Default)]
pub struct SimStorage {
    inner: Arc<StdMutex<SimStorageInner>>,
}

impl SimStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a named disk backed by `device_path`.
    pub fn add_disk(
        &self,
        name: &str,
        sr: &str,
        vdi: &str,
        device_path: &str,
        backend_vm: Option<&str>,
    ) {
        self.inner.lock().unwrap().disks.insert(
            name.to_owned(),
            (
                sr.to_owned(),
                vdi.to_owned(),
                device_path.to_owned(),
                backend_vm.map(str::to_owned),
            ),
        );
    }

    pub fn fail_activate(&self) {
        self.inner.lock().unwrap().fail_activate = true;
    }

    /// Attachments still live (attached or activated).
    pub fn live_attachments(&self) -> usize {
        self.inner.lock().unwrap().attachments.len()
    }
}

#[async_trait]
impl StorageService for SimStorage {
    async fn get_by_name(
        &self,
        name: &str,
    ) -> Result<(StorageRepo, VirtualDisk), Error> {
        let inner = self.inner.lock().unwrap();
        let (sr, vdi, _, _) =
            inner.disks.get(name).ok_or(Error::DoesNotExist)?;
        Ok((StorageRepo(sr.clone()), VirtualDisk(vdi.clone())))
    }

    async fn dp_create(&self, id: &str) -> Result<Datapath, Error> {
        Ok(Datapath(id.to_owned()))
    }

    async fn dp_destroy(
        &self,
        dp: &Datapath,
        _allow_leak: bool,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.attachments.retain(|(d, _), _| d != &dp.0);
        Ok(())
    }

    async fn vdi_attach(
        &self,
        dp: &Datapath,
        _sr: &StorageRepo,
        vdi: &VirtualDisk,
        _read_write: bool,
    ) -> Result<AttachInfo, Error> {
        let mut inner = self.inner.lock().unwrap();
        let disk = inner
            .disks
            .values()
            .find(|(_, v, _, _)| v == &vdi.0)
            .ok_or(Error::DoesNotExist)?;
        let info = AttachInfo {
            params: disk.2.clone(),
            backend_vm_uuid: disk.3.clone(),
        };
        inner.attachments.insert((dp.0.clone(), vdi.0.clone()), false);
        Ok(info)
    }

    async fn vdi_activate(
        &self,
        dp: &Datapath,
        _sr: &StorageRepo,
        vdi: &VirtualDisk,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_activate {
            return Err(Error::IoError("injected activate failure".into()));
        }
        match inner.attachments.get_mut(&(dp.0.clone(), vdi.0.clone())) {
            Some(activated) => {
                *activated = true;
                Ok(())
            }
            None => Err(Error::DeviceNotConnected),
        }
    }

    async fn vdi_deactivate(
        &self,
        dp: &Datapath,
        _sr: &StorageRepo,
        vdi: &VirtualDisk,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        match inner.attachments.get_mut(&(dp.0.clone(), vdi.0.clone())) {
            Some(activated) => {
                *activated = false;
                Ok(())
            }
            None => Err(Error::DeviceNotConnected),
        }
    }

    async fn vdi_detach(
        &self,
        dp: &Datapath,
        _sr: &StorageRepo,
        vdi: &VirtualDisk,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.attachments.remove(&(dp.0.clone(), vdi.0.clone()));
        Ok(())
    }

    async fn vdi_set_content_id(
        &self,
        _sr: &StorageRepo,
        _vdi: &VirtualDisk,
        _content_id: &str,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn vdi_similar_content(
        &self,
        _sr: &StorageRepo,
        vdi: &VirtualDisk,
    ) -> Result<Vec<VirtualDisk>, Error> {
        Ok(vec![vdi.clone()])
    }

    async fn vdi_clone(
        &self,
        _sr: &StorageRepo,
        vdi: &VirtualDisk,
    ) -> Result<VirtualDisk, Error> {
        Ok(VirtualDisk(format!("{}-clone", vdi.0)))
    }

    async fn vdi_snapshot(
        &self,
        _sr: &StorageRepo,
        vdi: &VirtualDisk,
        _mirror_url: Option<&str>,
    ) -> Result<VirtualDisk, Error> {
        Ok(VirtualDisk(format!("{}-snap", vdi.0)))
    }

    async fn vdi_compose(
        &self,
        _sr: &StorageRepo,
        _parent: &VirtualDisk,
        _child: &VirtualDisk,
    ) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use slog::o;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn arc(sim: &SimStorage) -> Arc<dyn StorageService> {
        Arc::new(sim.clone())
    }

    #[tokio::test]
    async fn with_disk_hands_out_the_device_path_and_cleans_up() {
        let sim = SimStorage::new();
        sim.add_disk("root", "sr-1", "vdi-1", "/dev/mapper/root", None);
        let storage = arc(&sim);
        let log = test_logger();

        let seen = with_disk(
            &storage,
            &DiskBackend::Vdi { name: "root".into() },
            false,
            &log,
            |path| async move { Ok(path) },
        )
        .await
        .unwrap();
        assert_eq!(seen, "/dev/mapper/root");
        assert_eq!(sim.live_attachments(), 0);
    }

    #[tokio::test]
    async fn with_disk_cleans_up_when_the_body_fails() {
        let sim = SimStorage::new();
        sim.add_disk("root", "sr-1", "vdi-1", "/dev/mapper/root", None);
        let storage = arc(&sim);
        let log = test_logger();

        let res: Result<(), Error> = with_disk(
            &storage,
            &DiskBackend::Vdi { name: "root".into() },
            true,
            &log,
            |_| async { Err(Error::NoBootableDevice) },
        )
        .await;
        assert!(matches!(res, Err(Error::NoBootableDevice)));
        assert_eq!(sim.live_attachments(), 0);
    }

    #[tokio::test]
    async fn with_disk_cleans_up_when_activate_fails() {
        let sim = SimStorage::new();
        sim.add_disk("root", "sr-1", "vdi-1", "/dev/mapper/root", None);
        sim.fail_activate();
        let storage = arc(&sim);
        let log = test_logger();

        let res: Result<(), Error> = with_disk(
            &storage,
            &DiskBackend::Vdi { name: "root".into() },
            true,
            &log,
            |_| async { panic!("body must not run") },
        )
        .await;
        assert!(res.is_err());
        assert_eq!(sim.live_attachments(), 0);
    }

    #[tokio::test]
    async fn local_disks_bypass_the_storage_daemon() {
        let sim = SimStorage::new();
        let storage = arc(&sim);
        let log = test_logger();
        let seen = with_disk(
            &storage,
            &DiskBackend::Local { path: "/isos/install.iso".into() },
            false,
            &log,
            |path| async move { Ok(path) },
        )
        .await
        .unwrap();
        assert_eq!(seen, "/isos/install.iso");
        assert_eq!(sim.live_attachments(), 0);
    }

    #[tokio::test]
    async fn unknown_names_are_not_found() {
        let sim = SimStorage::new();
        assert!(matches!(
            arc(&sim).get_by_name("nope").await,
            Err(Error::DoesNotExist)
        ));
    }
}
