// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PCI passthrough: hypervisor-level assignment for PV guests,
//! device-model hotplug for HVM guests.

use domaind_api_types::{DomId, Error, PciSpec, VmId};
use slog::info;

use crate::hyperctl::Hypervisor;
use crate::store::{transaction, ControlTree, TX_NONE};

use super::{paths, DeviceSupervisor};

/// Parses `domain:bus:dev.fn` into the machine SBDF word the hypervisor
/// wants.
pub fn parse_sbdf(addr: &str) -> Result<u32, Error> {
    let bad = || Error::InternalError(format!("bad PCI address {addr:?}"));
    let (rest, func) = addr.rsplit_once('.').ok_or_else(bad)?;
    let mut parts = rest.split(':');
    let (seg, bus, dev) = match (parts.next(), parts.next(), parts.next()) {
        (Some(seg), Some(bus), Some(dev)) => (seg, bus, dev),
        _ => return Err(bad()),
    };
    if parts.next().is_some() {
        return Err(bad());
    }
    let seg = u32::from_str_radix(seg, 16).map_err(|_| bad())?;
    let bus = u32::from_str_radix(bus, 16).map_err(|_| bad())?;
    let dev = u32::from_str_radix(dev, 16).map_err(|_| bad())?;
    let func = u32::from_str_radix(func, 16).map_err(|_| bad())?;
    if seg > 0xffff || bus > 0xff || dev > 0x1f || func > 0x7 {
        return Err(bad());
    }
    Ok((seg << 16) | (bus << 8) | (dev << 3) | func)
}

impl DeviceSupervisor {
    /// Binds a host PCI device to a guest. PV guests get the hypervisor
    /// assignment and a pcifront record; HVM guests are hotplugged
    /// through the device model.
    pub async fn add_pci(
        &self,
        vm: &VmId,
        domid: DomId,
        spec: &PciSpec,
        hvm: bool,
    ) -> Result<(), Error> {
        let sbdf = parse_sbdf(&spec.host_address)?;
        if hvm {
            self.dm.plug_pci(domid, &spec.host_address).await?;
        } else {
            self.hyper.assign_device(domid, sbdf)?;
        }

        let devid = spec.slot;
        let frontend = paths::frontend(domid, "pci", devid);
        let private = paths::private(vm, "pci", devid);
        transaction(self.tree.as_ref(), |tx| {
            let t = self.tree.clone();
            let frontend = frontend.clone();
            let private = private.clone();
            let host_address = spec.host_address.clone();
            async move {
                t.writev(
                    tx,
                    &frontend,
                    &[
                        ("dev-0".into(), host_address.clone()),
                        ("num_devs".into(), "1".into()),
                        (
                            "msitranslate".into(),
                            if spec.msitranslate { "1" } else { "0" }.into(),
                        ),
                        (
                            "pci_power_mgmt".into(),
                            if spec.pci_power_mgmt { "1" } else { "0" }
                                .into(),
                        ),
                    ],
                )
                .await?;
                t.writev(
                    tx,
                    &private,
                    &[
                        ("pci-id".into(), spec.slot.to_string()),
                        ("host-address".into(), host_address),
                        ("backend-domid".into(), "0".into()),
                    ],
                )
                .await?;
                Ok(())
            }
        })
        .await?;

        info!(self.log, "plugged pci device";
              "vm" => %vm, "slot" => spec.slot,
              "host" => &spec.host_address);
        Ok(())
    }

    /// Unbinds a passed-through device.
    pub async fn remove_pci(
        &self,
        vm: &VmId,
        domid: DomId,
        slot: u32,
        hvm: bool,
    ) -> Result<(), Error> {
        let private = paths::private(vm, "pci", slot);
        let host = crate::store::read_opt(
            self.tree.as_ref(),
            TX_NONE,
            &format!("{private}/host-address"),
        )
        .await?
        .ok_or(Error::DeviceNotConnected)?;
        if hvm {
            self.dm.unplug_pci(domid, &host).await?;
        } else {
            self.hyper.deassign_device(domid, parse_sbdf(&host)?)?;
        }
        self.release_device(vm, domid, "pci", slot).await
    }
}

#[cfg(test)]
mod test {
    use super::super::test::supervisor_with;
    use super::*;
    use crate::hyperctl::sim::SimHypervisor;
    use crate::hyperctl::Hypervisor;
    use crate::store::memory::MemoryTree;

    #[test]
    fn sbdf_parsing_accepts_canonical_addresses() {
        assert_eq!(parse_sbdf("0000:00:00.0").unwrap(), 0);
        assert_eq!(
            parse_sbdf("0000:03:1c.7").unwrap(),
            (0x03 << 8) | (0x1c << 3) | 7
        );
        assert_eq!(parse_sbdf("0001:00:00.0").unwrap(), 1 << 16);
        for bad in ["03:1c.7x", "0000:03:1c", "0000:03:20.0", "garbage"] {
            assert!(parse_sbdf(bad).is_err(), "{bad} should not parse");
        }
    }

    #[tokio::test]
    async fn pv_passthrough_goes_through_the_hypervisor() {
        let tree = MemoryTree::new();
        let hyper = SimHypervisor::new();
        let domid = hyper.domain_create(0, false, "uuid").unwrap();
        let sup = supervisor_with(&tree, &hyper, false);
        let vm = VmId("vm-1".into());

        let spec = PciSpec {
            slot: 0,
            host_address: "0000:03:00.0".into(),
            msitranslate: true,
            pci_power_mgmt: false,
        };
        sup.add_pci(&vm, domid, &spec, false).await.unwrap();
        assert_eq!(
            hyper.domain(domid).unwrap().assigned_devices,
            vec![parse_sbdf("0000:03:00.0").unwrap()]
        );
        assert_eq!(
            tree.get(&format!(
                "/local/domain/{domid}/device/pci/0/msitranslate"
            )),
            Some("1".into())
        );

        sup.remove_pci(&vm, domid, 0, false).await.unwrap();
        assert!(hyper.domain(domid).unwrap().assigned_devices.is_empty());
        assert_eq!(
            sup.by_logical_id(&vm, "pci", "0").await.unwrap(),
            None
        );
    }
}
