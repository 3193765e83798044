// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Thin, typed surface over the hypervisor's control interface.
//!
//! Nothing in here contains policy: every method is one hypervisor
//! primitive, synchronous, and fails with the raw [`HypervisorError`]
//! text. The engine decides what each failure means.

use domaind_api_types::{DomId, Error, ShutdownReason};

pub mod privcmd;
pub mod sim;

#[derive(Clone, Debug, thiserror::Error)]
#[error("hypervisor: {0}")]
pub struct HypervisorError(pub String);

impl From<HypervisorError> for Error {
    fn from(e: HypervisorError) -> Self {
        Error::InternalError(e.0)
    }
}

pub type HvResult<T> = Result<T, HypervisorError>;

/// Shutdown codes as reported in domain info.
pub mod shutdown_code {
    pub const POWEROFF: u32 = 0;
    pub const REBOOT: u32 = 1;
    pub const SUSPEND: u32 = 2;
    pub const CRASH: u32 = 3;
    pub const HALT: u32 = 4;
}

pub fn reason_of_code(code: u32) -> Option<ShutdownReason> {
    match code {
        shutdown_code::POWEROFF => Some(ShutdownReason::PowerOff),
        shutdown_code::REBOOT => Some(ShutdownReason::Reboot),
        shutdown_code::SUSPEND => Some(ShutdownReason::Suspend),
        shutdown_code::CRASH => Some(ShutdownReason::Crash),
        shutdown_code::HALT => Some(ShutdownReason::Halt),
        _ => None,
    }
}

pub fn code_of_reason(reason: ShutdownReason) -> u32 {
    match reason {
        ShutdownReason::PowerOff => shutdown_code::POWEROFF,
        ShutdownReason::Reboot => shutdown_code::REBOOT,
        ShutdownReason::Suspend => shutdown_code::SUSPEND,
        ShutdownReason::Crash => shutdown_code::CRASH,
        ShutdownReason::Halt => shutdown_code::HALT,
    }
}

/// A snapshot of one domain's hypervisor-side state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DomInfo {
    pub domid: DomId,
    /// The caller-assigned handle (a UUID) stamped on the domain.
    pub uuid: String,
    pub hvm: bool,
    pub dying: bool,
    pub paused: bool,
    pub shutdown: bool,
    pub shutdown_code: Option<u32>,
    pub total_memory_pages: u64,
}

/// The CPUID registers a mask template can address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuidReg {
    Eax,
    Ebx,
    Ecx,
    Edx,
}

impl CpuidReg {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "eax" => Some(CpuidReg::Eax),
            "ebx" => Some(CpuidReg::Ebx),
            "ecx" => Some(CpuidReg::Ecx),
            "edx" => Some(CpuidReg::Edx),
            _ => None,
        }
    }
}

/// One register's 32-bit mask template. The leftmost character governs
/// bit 31. Vocabulary: `0` clear, `1` set, `x` hypervisor default, `s`
/// same as host, `k` keep the incoming value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegTemplate {
    text: String,
}

impl RegTemplate {
    pub fn parse(s: &str) -> Result<Self, Error> {
        if s.len() != 32
            || !s.chars().all(|c| matches!(c, '0' | '1' | 'x' | 's' | 'k'))
        {
            return Err(Error::BadCpuidTemplate);
        }
        Ok(Self { text: s.to_owned() })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Resolves the template against the hypervisor default, the host
    /// value, and the incoming (guest-visible) value.
    pub fn resolve(&self, default: u32, host: u32, incoming: u32) -> u32 {
        let mut out = 0u32;
        for (i, c) in self.text.chars().enumerate() {
            let bit = 31 - i as u32;
            let mask = 1u32 << bit;
            let v = match c {
                '0' => 0,
                '1' => mask,
                'x' => default & mask,
                's' => host & mask,
                'k' => incoming & mask,
                _ => unreachable!("validated by parse"),
            };
            out |= v;
        }
        out
    }
}

/// Masks for one CPUID leaf.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CpuidLeafPolicy {
    pub leaf: u32,
    pub subleaf: Option<u32>,
    pub reg: CpuidReg,
    pub template: RegTemplate,
}

pub type CpuidPolicy = Vec<CpuidLeafPolicy>;

#[cfg_attr(test, mockall::automock)]
pub trait Hypervisor: Send + Sync {
    fn domain_create(
        &self,
        ssidref: u32,
        hvm: bool,
        uuid: &str,
    ) -> HvResult<DomId>;
    fn domain_destroy(&self, domid: DomId) -> HvResult<()>;
    fn domain_pause(&self, domid: DomId) -> HvResult<()>;
    fn domain_unpause(&self, domid: DomId) -> HvResult<()>;
    fn domain_shutdown(
        &self,
        domid: DomId,
        reason: ShutdownReason,
    ) -> HvResult<()>;
    fn domain_getinfo(&self, domid: DomId) -> HvResult<DomInfo>;
    fn domain_getinfolist(&self, start: DomId) -> HvResult<Vec<DomInfo>>;

    /// Stamps a new handle (UUID) on a domain.
    fn domain_sethandle(&self, domid: DomId, uuid: &str) -> HvResult<()>;

    fn evtchn_alloc_unbound(
        &self,
        domid: DomId,
        remote: DomId,
    ) -> HvResult<u32>;

    /// Shadow page-table allocation, in MiB.
    fn shadow_allocation_get(&self, domid: DomId) -> HvResult<u64>;
    fn shadow_allocation_set(&self, domid: DomId, mib: u64) -> HvResult<()>;

    fn setmaxmem(&self, domid: DomId, bytes: u64) -> HvResult<()>;
    fn set_memmap_limit(&self, domid: DomId, kib: u64) -> HvResult<()>;
    fn max_vcpus(&self, domid: DomId, count: u32) -> HvResult<()>;
    fn vcpu_affinity_set(
        &self,
        domid: DomId,
        vcpu: u32,
        mask: u64,
    ) -> HvResult<()>;
    fn vcpu_affinity_get(&self, domid: DomId, vcpu: u32) -> HvResult<u64>;

    fn ioport_permission(
        &self,
        domid: DomId,
        first_port: u32,
        count: u32,
        allow: bool,
    ) -> HvResult<()>;
    fn iomem_permission(
        &self,
        domid: DomId,
        first_pfn: u64,
        count: u64,
        allow: bool,
    ) -> HvResult<()>;
    fn irq_permission(
        &self,
        domid: DomId,
        irq: u32,
        allow: bool,
    ) -> HvResult<()>;

    /// Installs one leaf's resolved mask. Resolution of the template
    /// against host/default values happens hypervisor-side; the template
    /// text is passed through verbatim.
    fn domain_cpuid_set(
        &self,
        domid: DomId,
        policy: &CpuidLeafPolicy,
    ) -> HvResult<()>;

    /// Applies the installed policy to the domain's vCPUs.
    fn domain_cpuid_apply(&self, domid: DomId) -> HvResult<()>;

    /// Asks the hypervisor whether a mask is enforceable on this host.
    fn cpuid_check(&self, policy: &CpuidLeafPolicy) -> HvResult<bool>;

    fn suppress_spurious_page_faults(&self, domid: DomId) -> HvResult<()>;
    fn set_machine_address_size(
        &self,
        domid: DomId,
        bits: u32,
    ) -> HvResult<()>;

    /// Binds a host PCI device (`domain:bus:dev.fn` encoded as a machine
    /// SBDF) to a domain. Used for PV passthrough.
    fn assign_device(&self, domid: DomId, machine_sbdf: u32) -> HvResult<()>;
    fn deassign_device(
        &self,
        domid: DomId,
        machine_sbdf: u32,
    ) -> HvResult<()>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn templates_outside_the_vocabulary_fail() {
        assert!(RegTemplate::parse(&"x".repeat(32)).is_ok());
        assert!(matches!(
            RegTemplate::parse(&"x".repeat(31)),
            Err(Error::BadCpuidTemplate)
        ));
        assert!(matches!(
            RegTemplate::parse(&"x".repeat(33)),
            Err(Error::BadCpuidTemplate)
        ));
        let mut bad = "x".repeat(31);
        bad.push('q');
        assert!(matches!(
            RegTemplate::parse(&bad),
            Err(Error::BadCpuidTemplate)
        ));
    }

    #[test]
    fn template_resolution_honors_each_symbol() {
        // Bit 31: clear. Bit 30: set. Bit 29: default. Bit 28: host.
        // Bit 27: keep. The rest: clear.
        let t = RegTemplate::parse(&format!("01xsk{}", "0".repeat(27)))
            .unwrap();
        let default = 0xffff_ffff;
        let host = 0x0000_0000;
        let incoming = 0xffff_ffff;
        let v = t.resolve(default, host, incoming);
        assert_eq!(v & (1 << 31), 0);
        assert_ne!(v & (1 << 30), 0);
        assert_ne!(v & (1 << 29), 0); // default had it set
        assert_eq!(v & (1 << 28), 0); // host had it clear
        assert_ne!(v & (1 << 27), 0); // incoming had it set
        assert_eq!(v & 0x07ff_ffff, 0);
    }

    #[test]
    fn shutdown_codes_round_trip() {
        for reason in [
            ShutdownReason::PowerOff,
            ShutdownReason::Reboot,
            ShutdownReason::Suspend,
            ShutdownReason::Crash,
            ShutdownReason::Halt,
        ] {
            assert_eq!(reason_of_code(code_of_reason(reason)), Some(reason));
        }
        assert_eq!(reason_of_code(99), None);
    }
}
