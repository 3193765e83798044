// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Virtual network interface plumbing.

use domaind_api_types::{DomId, Error, NetworkKind, VifSpec, VmId};
use slog::info;

use crate::store::{transaction, ControlTree, Perms, TX_NONE};

use super::{bus_state, paths, DeviceSupervisor};

impl DeviceSupervisor {
    /// Plugs a network interface. The devid is the guest-visible
    /// position (eth<position>). `backend_domid` is 0 except for
    /// netback-in-guest configurations, where the engine resolves the
    /// serving VM's domain first.
    pub async fn add_vif(
        &self,
        vm: &VmId,
        domid: DomId,
        backend_domid: DomId,
        spec: &VifSpec,
    ) -> Result<u32, Error> {
        let devid = spec.position;
        let frontend = paths::frontend(domid, "vif", devid);
        let backend = paths::backend(backend_domid, "vif", domid, devid);
        let private = paths::private(vm, "vif", devid);

        let bridge_key = match &spec.network {
            NetworkKind::Bridge { bridge } => {
                Some(("bridge".to_string(), bridge.clone()))
            }
            NetworkKind::VSwitch { switch } => {
                Some(("switch".to_string(), switch.clone()))
            }
            NetworkKind::Netback { .. } => None,
        };
        let rate = spec
            .rate
            .map(|(kbytes, timeslice)| format!("{kbytes},{timeslice}"));

        transaction(self.tree.as_ref(), |tx| {
            let t = self.tree.clone();
            let frontend = frontend.clone();
            let backend = backend.clone();
            let private = private.clone();
            let bridge_key = bridge_key.clone();
            let rate = rate.clone();
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
                        ("handle".into(), devid.to_string()),
                        ("mac".into(), spec.mac.clone()),
                        ("mtu".into(), spec.mtu.to_string()),
                    ],
                )
                .await?;
                let mut backend_keys = vec![
                    ("frontend".to_string(), frontend.clone()),
                    ("frontend-id".to_string(), domid.to_string()),
                    ("online".to_string(), "1".to_string()),
                    (
                        "state".to_string(),
                        bus_state::INITIALISING.to_string(),
                    ),
                    ("mac".to_string(), spec.mac.clone()),
                    ("mtu".to_string(), spec.mtu.to_string()),
                    (
                        "disconnect".to_string(),
                        if spec.carrier { "0" } else { "1" }.to_string(),
                    ),
                ];
                if let Some(kv) = bridge_key {
                    backend_keys.push(kv);
                }
                if let Some(rate) = rate {
                    backend_keys.push(("rate".to_string(), rate));
                }
                t.writev(tx, &backend, &backend_keys).await?;

                let mut private_keys = vec![
                    ("vif-id".to_string(), devid.to_string()),
                    (
                        "backend-domid".to_string(),
                        backend_domid.to_string(),
                    ),
                ];
                for (k, v) in &spec.other_config {
                    private_keys
                        .push((format!("other-config/{k}"), v.clone()));
                }
                t.writev(tx, &private, &private_keys).await?;
                Ok(())
            }
        })
        .await?;

        self.tree
            .setperms(TX_NONE, &frontend, &Perms::rw(domid))
            .await?;
        self.tree
            .setperms(TX_NONE, &backend, &Perms::ro(backend_domid))
            .await?;

        info!(self.log, "plugged vif";
              "vm" => %vm, "position" => devid, "mac" => &spec.mac);
        Ok(devid)
    }
}

#[cfg(test)]
mod test {
    use super::super::test::supervisor_with;
    use super::*;
    use crate::hyperctl::sim::SimHypervisor;
    use crate::store::memory::MemoryTree;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn vif_records_carry_mac_bridge_and_rate() {
        let tree = MemoryTree::new();
        let hyper = SimHypervisor::new();
        let sup = supervisor_with(&tree, &hyper, false);
        let vm = VmId("vm-1".into());

        let spec = VifSpec {
            position: 0,
            mac: "0a:12:34:56:78:9a".into(),
            mtu: 1500,
            rate: Some((10_000, 50_000)),
            network: NetworkKind::Bridge { bridge: "xenbr0".into() },
            carrier: true,
            other_config: BTreeMap::from([(
                "promiscuous".to_string(),
                "off".to_string(),
            )]),
        };
        let devid = sup.add_vif(&vm, 5, 0, &spec).await.unwrap();
        assert_eq!(devid, 0);

        let be = paths::backend(0, "vif", 5, 0);
        assert_eq!(
            tree.get(&format!("{be}/mac")),
            Some("0a:12:34:56:78:9a".into())
        );
        assert_eq!(tree.get(&format!("{be}/bridge")), Some("xenbr0".into()));
        assert_eq!(
            tree.get(&format!("{be}/rate")),
            Some("10000,50000".into())
        );
        assert_eq!(tree.get(&format!("{be}/disconnect")), Some("0".into()));
        assert_eq!(
            tree.get(
                "/domaind/private/vm-1/device/vif/0/other-config/promiscuous"
            ),
            Some("off".into())
        );
        assert_eq!(
            sup.by_logical_id(&vm, "vif", "0").await.unwrap(),
            Some(0)
        );
    }
}
