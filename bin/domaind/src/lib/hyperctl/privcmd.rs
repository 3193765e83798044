// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The production [`Hypervisor`] implementation: domain-control calls
//! marshalled through the privileged control device.
//!
//! Each call packs its arguments into a fixed control buffer, issues one
//! ioctl, and unpacks the result. No retries, no policy; errno text is
//! surfaced verbatim in [`HypervisorError`].

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::Path;

use domaind_api_types::{DomId, ShutdownReason};
use uuid::Uuid;

use super::{
    code_of_reason, CpuidLeafPolicy, DomInfo, HvResult, Hypervisor,
    HypervisorError,
};

/// Domain-control command numbers, mirroring the control interface
/// header.
mod cmd {
    pub const CREATEDOMAIN: u32 = 1;
    pub const DESTROYDOMAIN: u32 = 2;
    pub const PAUSEDOMAIN: u32 = 3;
    pub const UNPAUSEDOMAIN: u32 = 4;
    pub const GETDOMAININFO: u32 = 5;
    pub const GETDOMAININFOLIST: u32 = 6;
    pub const SHUTDOWNDOMAIN: u32 = 7;
    pub const SETDOMAINHANDLE: u32 = 8;
    pub const EVTCHN_ALLOC_UNBOUND: u32 = 9;
    pub const SHADOW_OP_GET: u32 = 10;
    pub const SHADOW_OP_SET: u32 = 11;
    pub const MAX_MEM: u32 = 12;
    pub const SET_MEMMAP_LIMIT: u32 = 13;
    pub const MAX_VCPUS: u32 = 14;
    pub const SETVCPUAFFINITY: u32 = 15;
    pub const GETVCPUAFFINITY: u32 = 16;
    pub const IOPORT_PERMISSION: u32 = 17;
    pub const IOMEM_PERMISSION: u32 = 18;
    pub const IRQ_PERMISSION: u32 = 19;
    pub const SET_CPUID: u32 = 20;
    pub const APPLY_CPUID: u32 = 21;
    pub const CHECK_CPUID: u32 = 22;
    pub const SUPPRESS_SPURIOUS_PAGE_FAULTS: u32 = 23;
    pub const SET_MACHINE_ADDRESS_SIZE: u32 = 24;
    pub const ASSIGN_DEVICE: u32 = 25;
    pub const DEASSIGN_DEVICE: u32 = 26;
}

const INTERFACE_VERSION: u32 = 0x0000_000b;

/// Flag bits for `CREATEDOMAIN`.
const CREATE_HVM: u64 = 1 << 0;

/// Flag bits reported by `GETDOMAININFO`.
const INFO_DYING: u64 = 1 << 0;
const INFO_HVM: u64 = 1 << 1;
const INFO_PAUSED: u64 = 1 << 3;
const INFO_SHUTDOWN: u64 = 1 << 4;
const INFO_SHUTDOWN_CODE_SHIFT: u64 = 16;
const INFO_SHUTDOWN_CODE_MASK: u64 = 0xff;

/// One control-buffer word layout shared by every command: the kernel
/// interprets `args` per `cmd`.
#[repr(C)]
#[derive(Clone, Copy)]
struct CtlBuf {
    cmd: u32,
    interface_version: u32,
    domain: u32,
    _pad: u32,
    args: [u64; 14],
}

impl CtlBuf {
    fn new(cmd: u32, domain: DomId) -> Self {
        Self {
            cmd,
            interface_version: INTERFACE_VERSION,
            domain,
            _pad: 0,
            args: [0; 14],
        }
    }
}

const IOCTL_DOMCTL: libc::c_ulong = 0xc078_7801;

pub const DEFAULT_PRIVCMD_PATH: &str = "/dev/hypervisor/privcmd";

pub struct PrivcmdHypervisor {
    fd: File,
}

impl PrivcmdHypervisor {
    pub fn open<P: AsRef<Path>>(path: P) -> HvResult<Self> {
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map_err(|e| {
                HypervisorError(format!(
                    "cannot open control device {}: {}",
                    path.as_ref().display(),
                    e
                ))
            })?;
        Ok(Self { fd })
    }

    fn domctl(&self, buf: &mut CtlBuf) -> HvResult<()> {
        // Safety: `buf` is a live, correctly-sized control buffer and the
        // kernel side copies in/out at most its length.
        let rv = unsafe {
            libc::ioctl(
                self.fd.as_raw_fd(),
                IOCTL_DOMCTL,
                buf as *mut CtlBuf as *mut libc::c_void,
            )
        };
        if rv < 0 {
            let errno = std::io::Error::last_os_error();
            Err(HypervisorError(format!("domctl cmd {}: {}", buf.cmd, errno)))
        } else {
            Ok(())
        }
    }

    fn pack_uuid(args: &mut [u64; 14], at: usize, uuid: &str) -> HvResult<()> {
        let parsed = Uuid::parse_str(uuid)
            .map_err(|e| HypervisorError(format!("bad domain handle: {e}")))?;
        let bytes = parsed.as_bytes();
        args[at] = u64::from_be_bytes(bytes[0..8].try_into().unwrap());
        args[at + 1] = u64::from_be_bytes(bytes[8..16].try_into().unwrap());
        Ok(())
    }

    fn unpack_uuid(args: &[u64; 14], at: usize) -> String {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&args[at].to_be_bytes());
        bytes[8..16].copy_from_slice(&args[at + 1].to_be_bytes());
        Uuid::from_bytes(bytes).hyphenated().to_string()
    }

    fn info_from_args(domid: DomId, args: &[u64; 14]) -> DomInfo {
        let flags = args[0];
        let shutdown = flags & INFO_SHUTDOWN != 0;
        DomInfo {
            domid,
            uuid: Self::unpack_uuid(args, 2),
            hvm: flags & INFO_HVM != 0,
            dying: flags & INFO_DYING != 0,
            paused: flags & INFO_PAUSED != 0,
            shutdown,
            shutdown_code: shutdown.then(|| {
                ((flags >> INFO_SHUTDOWN_CODE_SHIFT)
                    & INFO_SHUTDOWN_CODE_MASK) as u32
            }),
            total_memory_pages: args[1],
        }
    }
}

impl Hypervisor for PrivcmdHypervisor {
    fn domain_create(
        &self,
        ssidref: u32,
        hvm: bool,
        uuid: &str,
    ) -> HvResult<DomId> {
        let mut buf = CtlBuf::new(cmd::CREATEDOMAIN, 0);
        buf.args[0] = ssidref as u64;
        buf.args[1] = if hvm { CREATE_HVM } else { 0 };
        Self::pack_uuid(&mut buf.args, 2, uuid)?;
        self.domctl(&mut buf)?;
        Ok(buf.domain)
    }

    fn domain_destroy(&self, domid: DomId) -> HvResult<()> {
        self.domctl(&mut CtlBuf::new(cmd::DESTROYDOMAIN, domid))
    }

    fn domain_pause(&self, domid: DomId) -> HvResult<()> {
        self.domctl(&mut CtlBuf::new(cmd::PAUSEDOMAIN, domid))
    }

    fn domain_unpause(&self, domid: DomId) -> HvResult<()> {
        self.domctl(&mut CtlBuf::new(cmd::UNPAUSEDOMAIN, domid))
    }

    fn domain_shutdown(
        &self,
        domid: DomId,
        reason: ShutdownReason,
    ) -> HvResult<()> {
        let mut buf = CtlBuf::new(cmd::SHUTDOWNDOMAIN, domid);
        buf.args[0] = code_of_reason(reason) as u64;
        self.domctl(&mut buf)
    }

    fn domain_getinfo(&self, domid: DomId) -> HvResult<DomInfo> {
        let mut buf = CtlBuf::new(cmd::GETDOMAININFO, domid);
        self.domctl(&mut buf)?;
        Ok(Self::info_from_args(buf.domain, &buf.args))
    }

    fn domain_getinfolist(&self, start: DomId) -> HvResult<Vec<DomInfo>> {
        // The list call walks the domain table one entry at a time; the
        // kernel returns the next populated slot at or after `domain`.
        let mut out = Vec::new();
        let mut next = start;
        loop {
            let mut buf = CtlBuf::new(cmd::GETDOMAININFOLIST, next);
            match self.domctl(&mut buf) {
                Ok(()) => {
                    let info = Self::info_from_args(buf.domain, &buf.args);
                    next = info.domid + 1;
                    out.push(info);
                }
                Err(_) => break,
            }
        }
        Ok(out)
    }

    fn domain_sethandle(&self, domid: DomId, uuid: &str) -> HvResult<()> {
        let mut buf = CtlBuf::new(cmd::SETDOMAINHANDLE, domid);
        Self::pack_uuid(&mut buf.args, 0, uuid)?;
        self.domctl(&mut buf)
    }

    fn evtchn_alloc_unbound(
        &self,
        domid: DomId,
        remote: DomId,
    ) -> HvResult<u32> {
        let mut buf = CtlBuf::new(cmd::EVTCHN_ALLOC_UNBOUND, domid);
        buf.args[0] = remote as u64;
        self.domctl(&mut buf)?;
        Ok(buf.args[1] as u32)
    }

    fn shadow_allocation_get(&self, domid: DomId) -> HvResult<u64> {
        let mut buf = CtlBuf::new(cmd::SHADOW_OP_GET, domid);
        self.domctl(&mut buf)?;
        Ok(buf.args[0])
    }

    fn shadow_allocation_set(&self, domid: DomId, mib: u64) -> HvResult<()> {
        let mut buf = CtlBuf::new(cmd::SHADOW_OP_SET, domid);
        buf.args[0] = mib;
        self.domctl(&mut buf)
    }

    fn setmaxmem(&self, domid: DomId, bytes: u64) -> HvResult<()> {
        let mut buf = CtlBuf::new(cmd::MAX_MEM, domid);
        buf.args[0] = bytes;
        self.domctl(&mut buf)
    }

    fn set_memmap_limit(&self, domid: DomId, kib: u64) -> HvResult<()> {
        let mut buf = CtlBuf::new(cmd::SET_MEMMAP_LIMIT, domid);
        buf.args[0] = kib;
        self.domctl(&mut buf)
    }

    fn max_vcpus(&self, domid: DomId, count: u32) -> HvResult<()> {
        let mut buf = CtlBuf::new(cmd::MAX_VCPUS, domid);
        buf.args[0] = count as u64;
        self.domctl(&mut buf)
    }

    fn vcpu_affinity_set(
        &self,
        domid: DomId,
        vcpu: u32,
        mask: u64,
    ) -> HvResult<()> {
        let mut buf = CtlBuf::new(cmd::SETVCPUAFFINITY, domid);
        buf.args[0] = vcpu as u64;
        buf.args[1] = mask;
        self.domctl(&mut buf)
    }

    fn vcpu_affinity_get(&self, domid: DomId, vcpu: u32) -> HvResult<u64> {
        let mut buf = CtlBuf::new(cmd::GETVCPUAFFINITY, domid);
        buf.args[0] = vcpu as u64;
        self.domctl(&mut buf)?;
        Ok(buf.args[1])
    }

    fn ioport_permission(
        &self,
        domid: DomId,
        first_port: u32,
        count: u32,
        allow: bool,
    ) -> HvResult<()> {
        let mut buf = CtlBuf::new(cmd::IOPORT_PERMISSION, domid);
        buf.args[0] = first_port as u64;
        buf.args[1] = count as u64;
        buf.args[2] = allow as u64;
        self.domctl(&mut buf)
    }

    fn iomem_permission(
        &self,
        domid: DomId,
        first_pfn: u64,
        count: u64,
        allow: bool,
    ) -> HvResult<()> {
        let mut buf = CtlBuf::new(cmd::IOMEM_PERMISSION, domid);
        buf.args[0] = first_pfn;
        buf.args[1] = count;
        buf.args[2] = allow as u64;
        self.domctl(&mut buf)
    }

    fn irq_permission(
        &self,
        domid: DomId,
        irq: u32,
        allow: bool,
    ) -> HvResult<()> {
        let mut buf = CtlBuf::new(cmd::IRQ_PERMISSION, domid);
        buf.args[0] = irq as u64;
        buf.args[1] = allow as u64;
        self.domctl(&mut buf)
    }

    fn domain_cpuid_set(
        &self,
        domid: DomId,
        policy: &CpuidLeafPolicy,
    ) -> HvResult<()> {
        let mut buf = CtlBuf::new(cmd::SET_CPUID, domid);
        buf.args[0] = policy.leaf as u64;
        buf.args[1] =
            policy.subleaf.map(|s| s as u64 | 1u64 << 32).unwrap_or(0);
        buf.args[2] = policy.reg as u64;
        // Template text is exactly 32 bytes by construction.
        let text = policy.template.as_str().as_bytes();
        for (i, chunk) in text.chunks(8).enumerate() {
            buf.args[3 + i] =
                u64::from_be_bytes(chunk.try_into().expect("32-byte template"));
        }
        self.domctl(&mut buf)
    }

    fn domain_cpuid_apply(&self, domid: DomId) -> HvResult<()> {
        self.domctl(&mut CtlBuf::new(cmd::APPLY_CPUID, domid))
    }

    fn cpuid_check(&self, policy: &CpuidLeafPolicy) -> HvResult<bool> {
        let mut buf = CtlBuf::new(cmd::CHECK_CPUID, 0);
        buf.args[0] = policy.leaf as u64;
        let text = policy.template.as_str().as_bytes();
        for (i, chunk) in text.chunks(8).enumerate() {
            buf.args[3 + i] =
                u64::from_be_bytes(chunk.try_into().expect("32-byte template"));
        }
        self.domctl(&mut buf)?;
        Ok(buf.args[1] != 0)
    }

    fn suppress_spurious_page_faults(&self, domid: DomId) -> HvResult<()> {
        self.domctl(&mut CtlBuf::new(
            cmd::SUPPRESS_SPURIOUS_PAGE_FAULTS,
            domid,
        ))
    }

    fn set_machine_address_size(
        &self,
        domid: DomId,
        bits: u32,
    ) -> HvResult<()> {
        let mut buf = CtlBuf::new(cmd::SET_MACHINE_ADDRESS_SIZE, domid);
        buf.args[0] = bits as u64;
        self.domctl(&mut buf)
    }

    fn assign_device(&self, domid: DomId, machine_sbdf: u32) -> HvResult<()> {
        let mut buf = CtlBuf::new(cmd::ASSIGN_DEVICE, domid);
        buf.args[0] = machine_sbdf as u64;
        self.domctl(&mut buf)
    }

    fn deassign_device(
        &self,
        domid: DomId,
        machine_sbdf: u32,
    ) -> HvResult<()> {
        let mut buf = CtlBuf::new(cmd::DEASSIGN_DEVICE, domid);
        buf.args[0] = machine_sbdf as u64;
        self.domctl(&mut buf)
    }
}
