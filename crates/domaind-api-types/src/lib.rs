// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Definitions for types exposed by the domaind API.
//!
//! Everything here crosses the RPC boundary: requests and responses for the
//! `VM.*`, `VBD.*`, `VIF.*`, `PCI.*`, `UPDATES.*` and `DEBUG.*` method
//! groups, plus the closed error taxonomy the daemon reports. The engine's
//! internal records (domain build state, device frontends) are deliberately
//! not exposed except through [`VmInternalState`], which exists so an
//! orchestrator can extract and re-install the per-VM record when moving a
//! suspended guest between hosts.

use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A hypervisor-assigned domain identifier. Unique within a host at any
/// instant, but reused after destruction; never use one as a stable key.
pub type DomId = u32;

/// The caller-assigned stable identity of a VM. At most one live domain
/// exists per `VmId` at a time.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(transparent)]
pub struct VmId(pub String);

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for VmId {
    fn from(s: &str) -> Self {
        VmId(s.to_owned())
    }
}

/// Externally-visible lifecycle states of a VM.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    /// No domain and no reserved resources exist for this VM.
    Absent,
    /// Memory has been reserved but no domain exists yet.
    Reserved,
    /// An empty domain exists and holds the reservation.
    Created,
    /// The domain has a built kernel image and published rings.
    Built,
    Paused,
    Running,
    /// A resumable suspend image exists; the domain is gone.
    Suspended,
    ShuttingDown,
    Rebooting,
    Halted,
    Crashed,
}

/// The reasons a guest can be asked to shut down, or be observed to have
/// shut down. Only the first four are ever written to the guest's
/// `control/shutdown` node; `Crash` is observed from the hypervisor.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownReason {
    PowerOff,
    Reboot,
    Suspend,
    Halt,
    Crash,
}

impl ShutdownReason {
    /// The token written to (and acknowledged through) `control/shutdown`.
    /// `None` for reasons that cannot be requested of a guest.
    pub fn control_node_token(&self) -> Option<&'static str> {
        match self {
            ShutdownReason::PowerOff => Some("poweroff"),
            ShutdownReason::Reboot => Some("reboot"),
            ShutdownReason::Suspend => Some("suspend"),
            ShutdownReason::Halt => Some("halt"),
            ShutdownReason::Crash => None,
        }
    }
}

/// How a domain is created: flags and data applied before any building
/// happens.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CreateInfo {
    pub hvm: bool,
    /// Security identifier passed through to the hypervisor.
    pub ssidref: u32,
    pub name: String,
    /// Initial key/value data seeded into the domain's control-tree
    /// subtree.
    #[serde(default)]
    pub xenstore_data: BTreeMap<String, String>,
    /// Platform keys (`platform/*`), validated against the recognized-key
    /// list at the boundary.
    #[serde(default)]
    pub platform: BTreeMap<String, String>,
}

/// Memory bounds for a VM, in bytes. `static_max` is fixed for the life of
/// the domain; the dynamic range is negotiated with the ballooning broker.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub struct MemoryConfig {
    pub static_max: u64,
    pub dynamic_min: u64,
    pub dynamic_max: u64,
}

/// Parameters for the `hvmloader` build path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct HvmBoot {
    pub pae: bool,
    pub apic: bool,
    pub acpi: bool,
    pub nx: bool,
    pub viridian: bool,
    /// Guest RTC offset from UTC, in seconds.
    pub timeoffset: i64,
    pub boot_order: String,
    pub video_mib: u64,
}

/// Parameters for a PV guest whose kernel lives on the host filesystem.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DirectBoot {
    pub kernel: String,
    pub cmdline: String,
    pub ramdisk: Option<String>,
}

/// Parameters for a PV guest whose kernel must be extracted from its first
/// bootable disk by a pluggable bootloader.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct IndirectBoot {
    /// Bootloader name, e.g. `pygrub`.
    pub bootloader: String,
    pub extra_args: Option<String>,
}

/// The three builder flavors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BootConfig {
    Hvm(HvmBoot),
    Direct(DirectBoot),
    Indirect(IndirectBoot),
}

/// The full caller-supplied description of a VM.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct VmConfig {
    pub id: VmId,
    pub create: CreateInfo,
    pub memory: MemoryConfig,
    pub vcpus: u32,
    /// Multiplier applied to the baseline shadow page-table allocation for
    /// HVM guests.
    pub shadow_multiplier: f64,
    pub boot: BootConfig,
}

/// Where the bytes of a virtual disk come from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiskBackend {
    /// A host-local file or block device (CDROM images, mostly).
    Local { path: String },
    /// A named virtual disk image managed by the storage daemon.
    Vdi { name: String },
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum DiskMode {
    ReadOnly,
    ReadWrite,
}

/// A virtual block device to plug into a VM.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct VbdSpec {
    /// Logical device id, stable across replug and reboot.
    pub id: String,
    pub backend: DiskBackend,
    pub mode: DiskMode,
    /// Requested user-facing disk number; the engine picks the bus naming.
    pub device_number: Option<u32>,
    #[serde(default)]
    pub cdrom: bool,
    /// Extra backend keys, validated against the recognized-key list.
    #[serde(default)]
    pub extra_backend_keys: BTreeMap<String, String>,
}

/// The kind of network a VIF attaches to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NetworkKind {
    Bridge { bridge: String },
    VSwitch { switch: String },
    /// Backend served by another guest's netback.
    Netback { vm: VmId, devid: u32 },
}

/// A virtual network interface to plug into a VM.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct VifSpec {
    /// Position of the interface within the guest (eth<position>).
    pub position: u32,
    pub mac: String,
    pub mtu: u32,
    /// (kbytes/s, timeslice µs) rate limit.
    pub rate: Option<(u64, u64)>,
    pub network: NetworkKind,
    #[serde(default = "default_true")]
    pub carrier: bool,
    #[serde(default)]
    pub other_config: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

/// A host PCI device to pass through to a VM.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PciSpec {
    /// Guest-visible virtual slot.
    pub slot: u32,
    /// Host address, `domain:bus:dev.fn`.
    pub host_address: String,
    #[serde(default)]
    pub msitranslate: bool,
    #[serde(default)]
    pub pci_power_mgmt: bool,
}

/// Result of `VM.create`: the hypervisor domain backing the VM.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct VmCreateResponse {
    pub domid: DomId,
}

/// Externally-visible state of a VM.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct VmStateResponse {
    pub id: VmId,
    pub power_state: PowerState,
    pub domid: Option<DomId>,
    /// Nonzero exactly when a resumable suspend image exists.
    pub suspend_memory_bytes: u64,
    pub vnc_port: Option<u16>,
}

/// Externally-visible state of a plugged device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DeviceStateResponse {
    pub plugged: bool,
    /// For removable media: true when the guest has ejected it.
    pub media_ejected: Option<bool>,
}

/// The opaque (to callers) per-VM record, shipped between hosts when a
/// suspended guest moves. The payload is the daemon's own JSON encoding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct VmInternalState {
    pub payload: String,
}

/// One item on the update bus.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Update {
    Vm { vm: VmId },
    Vbd { vm: VmId, device: String },
    Vif { vm: VmId, position: u32 },
    Pci { vm: VmId, slot: u32 },
}

/// A batch of updates with the cursor to pass to the next poll.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct UpdateBatch {
    pub updates: Vec<Update>,
    pub next_id: u64,
}

/// Parameters for `VM.shutdown`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ShutdownRequest {
    pub reason: ShutdownReason,
    /// How long to wait for the guest to acknowledge the request, in
    /// milliseconds.
    pub ack_delay_ms: u64,
}

/// Parameters for `DEBUG.trigger`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DebugTriggerRequest {
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// The closed error taxonomy reported over the API. Every failure the
/// daemon surfaces is one of these; the RPC layer wraps anything else as
/// `InternalError`.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Serialize,
    Deserialize,
    JsonSchema,
    thiserror::Error,
)]
#[serde(tag = "error", content = "detail", rename_all = "snake_case")]
pub enum Error {
    #[error("object does not exist")]
    DoesNotExist,
    #[error("object already exists")]
    AlreadyExists,
    #[error("device is not connected")]
    DeviceNotConnected,
    #[error("device refused to detach")]
    DeviceDetachRejected,
    #[error("domain has not been built")]
    DomainNotBuilt,
    #[error("bad CPUID template")]
    BadCpuidTemplate,
    #[error("bad interface name: {0}")]
    BadInterfaceName(String),
    #[error("bad signature on suspend image")]
    BadSignature,
    #[error("truncated device-model state record")]
    TruncatedDmState,
    #[error("domain build failed: {0}")]
    BuildFailed(String),
    #[error("builder helper protocol violation: {0}")]
    HelperProtocol(String),
    #[error("builder helper reported: {0}")]
    HelperReported(String),
    #[error("bootloader {kind} failed: {detail}")]
    BootloaderError { kind: String, detail: String },
    #[error("no bootable device")]
    NoBootableDevice,
    #[error("ballooning error {code}: {message}")]
    BallooningError { code: i32, message: String },
    #[error("ballooning service is absent")]
    BallooningServiceAbsent,
    #[error("timed out waiting for a device backend")]
    BackendTimeout,
    #[error("domain {0} is stuck in the dying state")]
    StuckInDyingState(DomId),
    #[error("operation was cancelled")]
    Cancelled,
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("internal error: {0}")]
    InternalError(String),
    #[error("operation not supported")]
    NotSupported,
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IoError(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InternalError(format!("serialization: {e}"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shutdown_tokens_match_control_node_vocabulary() {
        assert_eq!(
            ShutdownReason::PowerOff.control_node_token(),
            Some("poweroff")
        );
        assert_eq!(ShutdownReason::Reboot.control_node_token(), Some("reboot"));
        assert_eq!(
            ShutdownReason::Suspend.control_node_token(),
            Some("suspend")
        );
        assert_eq!(ShutdownReason::Halt.control_node_token(), Some("halt"));
        assert_eq!(ShutdownReason::Crash.control_node_token(), None);
    }

    #[test]
    fn errors_round_trip_through_the_wire_encoding() {
        let errors = vec![
            Error::StuckInDyingState(12),
            Error::BootloaderError {
                kind: "pygrub".to_string(),
                detail: "no menu.lst".to_string(),
            },
            Error::BallooningError { code: 3, message: "too little".into() },
            Error::DoesNotExist,
        ];
        for e in errors {
            let s = serde_json::to_string(&e).unwrap();
            let back: Error = serde_json::from_str(&s).unwrap();
            assert_eq!(e, back);
        }
    }
}
