// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A simulated hypervisor: an in-memory domain table honoring the whole
//! [`Hypervisor`] surface. Backs the test suite and the daemon's
//! simulated mode, and exposes a few extra knobs (guest-initiated
//! shutdowns, domains that stick in the dying state) that tests use to
//! provoke the engine's failure paths.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use domaind_api_types::{DomId, ShutdownReason};

use super::{
    code_of_reason, CpuidLeafPolicy, DomInfo, HvResult, Hypervisor,
    HypervisorError,
};

#[derive(Clone, Debug)]
pub struct SimDomain {
    pub uuid: String,
    pub ssidref: u32,
    pub hvm: bool,
    pub paused: bool,
    pub dying: bool,
    pub shutdown_code: Option<u32>,
    pub total_pages: u64,
    pub max_bytes: u64,
    pub memmap_limit_kib: u64,
    pub shadow_mib: u64,
    pub max_vcpus: u32,
    pub affinity: BTreeMap<u32, u64>,
    pub store_ports: u32,
    pub cpuid_policy: Vec<CpuidLeafPolicy>,
    pub cpuid_applied: bool,
    pub assigned_devices: Vec<u32>,
    pub spf_suppressed: bool,
    pub address_bits: Option<u32>,
    /// True when destroy was requested but the domain is pinned in the
    /// dying state.
    pub stuck_dying: bool,
}

#[derive(Default)]
struct Inner {
    next_domid: DomId,
    domains: BTreeMap<DomId, SimDomain>,
    /// One-shot: shrink a domain's shadow allocation at its next
    /// event-channel allocation, the way a greedy builder would.
    shadow_shrink: Option<(DomId, u64)>,
}

#[derive(Clone, Default)]
pub struct SimHypervisor {
    inner: Arc<Mutex<Inner>>,
}

impl SimHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_domain<T>(
        &self,
        domid: DomId,
        f: impl FnOnce(&mut SimDomain) -> T,
    ) -> HvResult<T> {
        let mut inner = self.inner.lock().unwrap();
        let dom = inner
            .domains
            .get_mut(&domid)
            .ok_or_else(|| HypervisorError(format!("no domain {domid}")))?;
        Ok(f(dom))
    }

    fn info_of(domid: DomId, d: &SimDomain) -> DomInfo {
        DomInfo {
            domid,
            uuid: d.uuid.clone(),
            hvm: d.hvm,
            dying: d.dying,
            paused: d.paused,
            shutdown: d.shutdown_code.is_some(),
            shutdown_code: d.shutdown_code,
            total_memory_pages: d.total_pages,
        }
    }

    // --- test controls ---

    /// Simulates the guest shutting itself down (or crashing).
    pub fn inject_guest_shutdown(&self, domid: DomId, reason: ShutdownReason) {
        let _ = self.with_domain(domid, |d| {
            d.shutdown_code = Some(code_of_reason(reason));
        });
    }

    /// Pins a domain so that destroy leaves it visible in the dying
    /// state until [`Self::release_dying`].
    pub fn pin_dying(&self, domid: DomId) {
        let _ = self.with_domain(domid, |d| d.stuck_dying = true);
    }

    pub fn release_dying(&self, domid: DomId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(d) = inner.domains.get(&domid) {
            if d.dying {
                inner.domains.remove(&domid);
            }
        }
    }

    /// Simulates the guest ballooning to a given footprint.
    pub fn set_total_pages(&self, domid: DomId, pages: u64) {
        let _ = self.with_domain(domid, |d| d.total_pages = pages);
    }

    /// Arms a one-shot shadow shrink, applied during the domain's next
    /// event-channel allocation. Simulates a builder that quietly eats
    /// into the shadow allocation.
    pub fn shrink_shadow_during_build(&self, domid: DomId, to_mib: u64) {
        self.inner.lock().unwrap().shadow_shrink = Some((domid, to_mib));
    }

    pub fn domain(&self, domid: DomId) -> Option<SimDomain> {
        self.inner.lock().unwrap().domains.get(&domid).cloned()
    }

    pub fn domain_count(&self) -> usize {
        self.inner.lock().unwrap().domains.len()
    }
}

impl Hypervisor for SimHypervisor {
    fn domain_create(
        &self,
        ssidref: u32,
        hvm: bool,
        uuid: &str,
    ) -> HvResult<DomId> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_domid += 1;
        let domid = inner.next_domid;
        inner.domains.insert(
            domid,
            SimDomain {
                uuid: uuid.to_owned(),
                ssidref,
                hvm,
                paused: true,
                dying: false,
                shutdown_code: None,
                total_pages: 0,
                max_bytes: 0,
                memmap_limit_kib: 0,
                shadow_mib: 0,
                max_vcpus: 1,
                affinity: BTreeMap::new(),
                store_ports: 0,
                cpuid_policy: Vec::new(),
                cpuid_applied: false,
                assigned_devices: Vec::new(),
                spf_suppressed: false,
                address_bits: None,
                stuck_dying: false,
            },
        );
        Ok(domid)
    }

    fn domain_destroy(&self, domid: DomId) -> HvResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let dom = inner
            .domains
            .get_mut(&domid)
            .ok_or_else(|| HypervisorError(format!("no domain {domid}")))?;
        if dom.stuck_dying {
            dom.dying = true;
        } else {
            inner.domains.remove(&domid);
        }
        Ok(())
    }

    fn domain_pause(&self, domid: DomId) -> HvResult<()> {
        self.with_domain(domid, |d| d.paused = true)
    }

    fn domain_unpause(&self, domid: DomId) -> HvResult<()> {
        self.with_domain(domid, |d| d.paused = false)
    }

    fn domain_shutdown(
        &self,
        domid: DomId,
        reason: ShutdownReason,
    ) -> HvResult<()> {
        self.with_domain(domid, |d| {
            d.shutdown_code = Some(code_of_reason(reason));
        })
    }

    fn domain_getinfo(&self, domid: DomId) -> HvResult<DomInfo> {
        self.with_domain(domid, |d| Self::info_of(domid, d))
    }

    fn domain_getinfolist(&self, start: DomId) -> HvResult<Vec<DomInfo>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .domains
            .range(start..)
            .map(|(id, d)| Self::info_of(*id, d))
            .collect())
    }

    fn domain_sethandle(&self, domid: DomId, uuid: &str) -> HvResult<()> {
        self.with_domain(domid, |d| d.uuid = uuid.to_owned())
    }

    fn evtchn_alloc_unbound(
        &self,
        domid: DomId,
        _remote: DomId,
    ) -> HvResult<u32> {
        let shrink = {
            let mut inner = self.inner.lock().unwrap();
            match inner.shadow_shrink {
                Some((d, to)) if d == domid => {
                    inner.shadow_shrink = None;
                    Some(to)
                }
                _ => None,
            }
        };
        self.with_domain(domid, |d| {
            if let Some(to_mib) = shrink {
                d.shadow_mib = to_mib;
            }
            d.store_ports += 1;
            d.store_ports
        })
    }

    fn shadow_allocation_get(&self, domid: DomId) -> HvResult<u64> {
        self.with_domain(domid, |d| d.shadow_mib)
    }

    fn shadow_allocation_set(&self, domid: DomId, mib: u64) -> HvResult<()> {
        self.with_domain(domid, |d| d.shadow_mib = mib)
    }

    fn setmaxmem(&self, domid: DomId, bytes: u64) -> HvResult<()> {
        self.with_domain(domid, |d| d.max_bytes = bytes)
    }

    fn set_memmap_limit(&self, domid: DomId, kib: u64) -> HvResult<()> {
        self.with_domain(domid, |d| d.memmap_limit_kib = kib)
    }

    fn max_vcpus(&self, domid: DomId, count: u32) -> HvResult<()> {
        self.with_domain(domid, |d| d.max_vcpus = count)
    }

    fn vcpu_affinity_set(
        &self,
        domid: DomId,
        vcpu: u32,
        mask: u64,
    ) -> HvResult<()> {
        self.with_domain(domid, |d| {
            d.affinity.insert(vcpu, mask);
        })
    }

    fn vcpu_affinity_get(&self, domid: DomId, vcpu: u32) -> HvResult<u64> {
        self.with_domain(domid, |d| {
            d.affinity.get(&vcpu).copied().unwrap_or(u64::MAX)
        })
    }

    fn ioport_permission(
        &self,
        domid: DomId,
        _first_port: u32,
        _count: u32,
        _allow: bool,
    ) -> HvResult<()> {
        self.with_domain(domid, |_| ())
    }

    fn iomem_permission(
        &self,
        domid: DomId,
        _first_pfn: u64,
        _count: u64,
        _allow: bool,
    ) -> HvResult<()> {
        self.with_domain(domid, |_| ())
    }

    fn irq_permission(
        &self,
        domid: DomId,
        _irq: u32,
        _allow: bool,
    ) -> HvResult<()> {
        self.with_domain(domid, |_| ())
    }

    fn domain_cpuid_set(
        &self,
        domid: DomId,
        policy: &CpuidLeafPolicy,
    ) -> HvResult<()> {
        let policy = policy.clone();
        self.with_domain(domid, move |d| d.cpuid_policy.push(policy))
    }

    fn domain_cpuid_apply(&self, domid: DomId) -> HvResult<()> {
        self.with_domain(domid, |d| d.cpuid_applied = true)
    }

    fn cpuid_check(&self, _policy: &CpuidLeafPolicy) -> HvResult<bool> {
        Ok(true)
    }

    fn suppress_spurious_page_faults(&self, domid: DomId) -> HvResult<()> {
        self.with_domain(domid, |d| d.spf_suppressed = true)
    }

    fn set_machine_address_size(
        &self,
        domid: DomId,
        bits: u32,
    ) -> HvResult<()> {
        self.with_domain(domid, |d| d.address_bits = Some(bits))
    }

    fn assign_device(&self, domid: DomId, machine_sbdf: u32) -> HvResult<()> {
        self.with_domain(domid, |d| d.assigned_devices.push(machine_sbdf))
    }

    fn deassign_device(
        &self,
        domid: DomId,
        machine_sbdf: u32,
    ) -> HvResult<()> {
        self.with_domain(domid, |d| {
            d.assigned_devices.retain(|s| *s != machine_sbdf)
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn domids_are_not_reused_within_a_run() {
        let hv = SimHypervisor::new();
        let a = hv.domain_create(0, false, "uuid-a").unwrap();
        hv.domain_destroy(a).unwrap();
        let b = hv.domain_create(0, false, "uuid-b").unwrap();
        assert!(b > a);
    }

    #[test]
    fn pinned_domains_stay_visible_as_dying() {
        let hv = SimHypervisor::new();
        let d = hv.domain_create(0, true, "uuid").unwrap();
        hv.pin_dying(d);
        hv.domain_destroy(d).unwrap();
        let info = hv.domain_getinfo(d).unwrap();
        assert!(info.dying);
        hv.release_dying(d);
        assert!(hv.domain_getinfo(d).is_err());
    }

    #[test]
    fn guest_shutdown_shows_up_in_the_info_list() {
        let hv = SimHypervisor::new();
        let d = hv.domain_create(0, false, "uuid").unwrap();
        hv.inject_guest_shutdown(d, ShutdownReason::Reboot);
        let infos = hv.domain_getinfolist(0).unwrap();
        assert_eq!(infos.len(), 1);
        assert!(infos[0].shutdown);
        assert_eq!(infos[0].shutdown_code, Some(super::super::shutdown_code::REBOOT));
    }
}
