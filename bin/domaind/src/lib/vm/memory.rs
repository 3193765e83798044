// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Page and kilobyte arithmetic plus the per-guest-flavor memory
//! overhead formulas used by the create-time ballooning pre-flight.

pub const PAGE_SIZE: u64 = 4096;
pub const KIB: u64 = 1 << 10;
pub const MIB: u64 = 1 << 20;

/// Fixed HVM overhead beyond the shadow allocation: the emulated
/// framebuffer plus the device model's mapped scratch space.
const HVM_FRAMEBUFFER_MIB: u64 = 4;
const HVM_EXTRA_MIB: u64 = 2;

/// PV guests carry only the start-info/console/store pages and some
/// slack.
const PV_EXTRA_MIB: u64 = 1;

pub fn bytes_to_kib(bytes: u64) -> u64 {
    bytes / KIB
}

pub fn bytes_to_mib_ceil(bytes: u64) -> u64 {
    bytes.div_ceil(MIB)
}

pub fn pages_to_bytes(pages: u64) -> u64 {
    pages * PAGE_SIZE
}

pub fn bytes_to_pages_ceil(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}

/// The shadow page-table allocation for an HVM guest, in MiB: 256
/// pages per vCPU plus 2 pages per MiB of static maximum, scaled by the
/// configured multiplier, never less than 1 MiB.
pub fn hvm_shadow_mib(
    static_max_mib: u64,
    vcpus: u32,
    multiplier: f64,
) -> u64 {
    let pages =
        (vcpus as f64 * 256.0 + static_max_mib as f64 * 2.0) * multiplier;
    let mib = (pages * PAGE_SIZE as f64 / MIB as f64).ceil() as u64;
    mib.max(1)
}

/// Host memory consumed by a guest beyond its own RAM. This is the `O`
/// added to both ends of the ballooning request.
pub fn overhead_bytes(
    hvm: bool,
    static_max_bytes: u64,
    vcpus: u32,
    shadow_multiplier: f64,
) -> u64 {
    let static_max_mib = bytes_to_mib_ceil(static_max_bytes);
    let mib = if hvm {
        hvm_shadow_mib(static_max_mib, vcpus, shadow_multiplier)
            + HVM_FRAMEBUFFER_MIB
            + HVM_EXTRA_MIB
    } else {
        let _ = vcpus;
        PV_EXTRA_MIB
    };
    mib * MIB
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shadow_scales_with_the_multiplier() {
        // 256 MiB, 1 vCPU: 256 + 512 pages = 3 MiB at multiplier 1.
        assert_eq!(hvm_shadow_mib(256, 1, 1.0), 3);
        assert_eq!(hvm_shadow_mib(256, 1, 4.0), 12);
        // Never below 1 MiB, even for a tiny guest.
        assert_eq!(hvm_shadow_mib(1, 1, 0.1), 1);
    }

    #[test]
    fn pv_overhead_is_flat_and_hvm_overhead_includes_shadow() {
        let pv = overhead_bytes(false, 256 * MIB, 4, 1.0);
        assert_eq!(pv, PV_EXTRA_MIB * MIB);

        let hvm = overhead_bytes(true, 256 * MIB, 1, 1.0);
        assert_eq!(hvm, (3 + HVM_FRAMEBUFFER_MIB + HVM_EXTRA_MIB) * MIB);
    }

    #[test]
    fn page_arithmetic_rounds_up() {
        assert_eq!(bytes_to_pages_ceil(1), 1);
        assert_eq!(bytes_to_pages_ceil(PAGE_SIZE), 1);
        assert_eq!(bytes_to_pages_ceil(PAGE_SIZE + 1), 2);
        assert_eq!(pages_to_bytes(65536), 256 * MIB);
        assert_eq!(bytes_to_kib(256 * MIB), 262144);
    }
}
