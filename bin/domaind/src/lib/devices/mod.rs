// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The device supervisor: wiring guest device frontends to their
//! backends through the control tree, and driving orderly teardown.
//!
//! Every plug writes the caller's logical device id under the frontend's
//! private path (key `<kind>-id`), so any device can later be found by
//! `(vm, kind, logical id)` regardless of what the guest did to its own
//! half of the tree.

use std::collections::BTreeMap;
use std::sync::Arc;

use domaind_api_types::{DomId, Error, VmId};
use slog::{info, warn, Logger};

use crate::config::Timeouts;
use crate::hyperctl::Hypervisor;
use crate::store::{read_opt, ControlTree, TX_NONE};

pub mod dm;
pub mod pci;
pub mod vbd;
pub mod vif;

/// Bus states of a frontend or backend, as published in the tree.
pub mod bus_state {
    pub const INITIALISING: u32 = 1;
    pub const INIT_WAIT: u32 = 2;
    pub const INITIALISED: u32 = 3;
    pub const CONNECTED: u32 = 4;
    pub const CLOSING: u32 = 5;
    pub const CLOSED: u32 = 6;
}

pub(crate) mod paths {
    use domaind_api_types::{DomId, VmId};

    pub fn domain(domid: DomId) -> String {
        format!("/local/domain/{domid}")
    }

    pub fn vm(vm: &VmId) -> String {
        format!("/vm/{}", vm.0)
    }

    pub fn frontend(domid: DomId, kind: &str, devid: u32) -> String {
        format!("/local/domain/{domid}/device/{kind}/{devid}")
    }

    pub fn backend(
        backend_domid: DomId,
        kind: &str,
        domid: DomId,
        devid: u32,
    ) -> String {
        format!("/local/domain/{backend_domid}/backend/{kind}/{domid}/{devid}")
    }

    /// The daemon-private bookkeeping path for one frontend. Guests
    /// cannot reach it, so the `<kind>-id` tag written here survives
    /// anything the guest does.
    pub fn private(vm: &VmId, kind: &str, devid: u32) -> String {
        format!("/domaind/private/{}/device/{kind}/{devid}", vm.0)
    }

    pub fn private_root(vm: &VmId) -> String {
        format!("/domaind/private/{}", vm.0)
    }
}

/// Backend keys the daemon accepts from callers. Anything else is logged
/// and, in strict mode, rejected.
const RECOGNIZED_BACKEND_KEYS: &[&str] = &[
    "discard-enable",
    "cache-mode",
    "polling-duration",
    "polling-idle-threshold",
    "queues",
];

pub struct DeviceSupervisor {
    pub(crate) tree: Arc<dyn ControlTree>,
    pub(crate) hyper: Arc<dyn Hypervisor>,
    pub(crate) dm: dm::DeviceModel,
    pub(crate) timeouts: Timeouts,
    pub(crate) strict_keys: bool,
    pub(crate) log: Logger,
}

impl DeviceSupervisor {
    pub fn new(
        tree: Arc<dyn ControlTree>,
        hyper: Arc<dyn Hypervisor>,
        dm: dm::DeviceModel,
        timeouts: Timeouts,
        strict_keys: bool,
        log: Logger,
    ) -> Self {
        Self { tree, hyper, dm, timeouts, strict_keys, log }
    }

    pub fn device_model(&self) -> &dm::DeviceModel {
        &self.dm
    }

    /// Filters caller-supplied backend keys against the recognized list.
    pub(crate) fn vet_extra_keys(
        &self,
        keys: &BTreeMap<String, String>,
    ) -> Result<Vec<(String, String)>, Error> {
        let mut out = Vec::new();
        for (k, v) in keys {
            if RECOGNIZED_BACKEND_KEYS.contains(&k.as_str()) {
                out.push((k.clone(), v.clone()));
            } else if self.strict_keys {
                return Err(Error::InternalError(format!(
                    "unrecognized backend key {k:?}"
                )));
            } else {
                warn!(self.log, "ignoring unrecognized backend key";
                      "key" => k);
            }
        }
        Ok(out)
    }

    /// Finds a device by its logical id. The reverse of the `<kind>-id`
    /// tag written at plug time.
    pub async fn by_logical_id(
        &self,
        vm: &VmId,
        kind: &str,
        logical_id: &str,
    ) -> Result<Option<u32>, Error> {
        let root = format!("{}/device/{kind}", paths::private_root(vm));
        let devids = match self.tree.directory(TX_NONE, &root).await {
            Ok(d) => d,
            Err(Error::DoesNotExist) => return Ok(None),
            Err(e) => return Err(e),
        };
        for devid in devids {
            let tag = format!("{root}/{devid}/{kind}-id");
            if read_opt(self.tree.as_ref(), TX_NONE, &tag).await?.as_deref()
                == Some(logical_id)
            {
                let devid = devid.parse().map_err(|_| {
                    Error::InternalError(format!(
                        "non-numeric devid {devid:?} under {root}"
                    ))
                })?;
                return Ok(Some(devid));
            }
        }
        Ok(None)
    }

    /// The devids of every plugged device of a kind, from the private
    /// tree (the guest's view is not trusted).
    pub async fn plugged_devids(
        &self,
        vm: &VmId,
        kind: &str,
    ) -> Result<Vec<u32>, Error> {
        let root = format!("{}/device/{kind}", paths::private_root(vm));
        match self.tree.directory(TX_NONE, &root).await {
            Ok(d) => Ok(d.iter().filter_map(|s| s.parse().ok()).collect()),
            Err(Error::DoesNotExist) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Removes every tree record of every device of a domain,
    /// best-effort, one failure does not stop the rest. Returns the
    /// number of failures.
    pub async fn release_all(&self, vm: &VmId, domid: DomId) -> usize {
        let mut failures = 0;
        for kind in ["vbd", "vif", "pci"] {
            let devids = match self.plugged_devids(vm, kind).await {
                Ok(d) => d,
                Err(e) => {
                    warn!(self.log, "cannot enumerate devices for release";
                          "kind" => kind, "error" => %e);
                    failures += 1;
                    continue;
                }
            };
            for devid in devids {
                if let Err(e) = self.release_device(vm, domid, kind, devid).await
                {
                    warn!(self.log, "device release failed";
                          "kind" => kind, "devid" => devid, "error" => %e);
                    failures += 1;
                }
            }
        }
        if let Err(e) =
            self.tree.rm(TX_NONE, &paths::private_root(vm)).await
        {
            warn!(self.log, "cannot remove private subtree"; "error" => %e);
            failures += 1;
        }
        failures
    }

    /// Removes one device's frontend, backend and private records.
    pub async fn release_device(
        &self,
        vm: &VmId,
        domid: DomId,
        kind: &str,
        devid: u32,
    ) -> Result<(), Error> {
        let private = paths::private(vm, kind, devid);
        let backend_domid = read_opt(
            self.tree.as_ref(),
            TX_NONE,
            &format!("{private}/backend-domid"),
        )
        .await?
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

        info!(self.log, "releasing device";
              "kind" => kind, "devid" => devid, "domid" => domid);
        self.tree
            .rm(TX_NONE, &paths::frontend(domid, kind, devid))
            .await?;
        self.tree
            .rm(TX_NONE, &paths::backend(backend_domid, kind, domid, devid))
            .await?;
        self.tree.rm(TX_NONE, &private).await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hyperctl::sim::SimHypervisor;
    use crate::store::memory::MemoryTree;
    use slog::o;

    pub(crate) fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    pub(crate) fn supervisor_with(
        tree: &MemoryTree,
        hyper: &SimHypervisor,
        strict: bool,
    ) -> DeviceSupervisor {
        let log = test_logger();
        DeviceSupervisor::new(
            Arc::new(tree.clone()),
            Arc::new(hyper.clone()),
            dm::DeviceModel::new(
                "/bin/false".into(),
                "/bin/false".into(),
                std::time::Duration::from_millis(100),
                log.clone(),
            ),
            Timeouts { backend_shutdown_ms: 300, ..Default::default() },
            strict,
            log,
        )
    }

    #[test]
    fn unrecognized_keys_fail_only_in_strict_mode() {
        let tree = MemoryTree::new();
        let hyper = SimHypervisor::new();
        let mut keys = BTreeMap::new();
        keys.insert("discard-enable".to_string(), "1".to_string());
        keys.insert("evil-key".to_string(), "x".to_string());

        let lax = supervisor_with(&tree, &hyper, false);
        let vetted = lax.vet_extra_keys(&keys).unwrap();
        assert_eq!(vetted, vec![("discard-enable".into(), "1".into())]);

        let strict = supervisor_with(&tree, &hyper, true);
        assert!(strict.vet_extra_keys(&keys).is_err());
    }
}
