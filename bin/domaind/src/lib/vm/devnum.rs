// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Disk interface naming: the three bus namings and the conversions
//! between a user-facing disk number, a linux device string ("xvda1",
//! "hdb", ...) and the integer device key used in the control tree.
//!
//! HVM guests map disks 0–3 onto the emulated IDE buses and everything
//! else onto the paravirtual bus; PV guests use the paravirtual bus
//! only. Where several namings could represent a request, the first
//! representable scheme wins.

use domaind_api_types::Error;

/// IDE fan-out: two buses with two devices each.
const IDE_DISKS: u32 = 4;
const IDE_PARTS: u32 = 64;
const SCSI_DISKS: u32 = 16;
const SCSI_PARTS: u32 = 16;
const XEN_SHORT_DISKS: u32 = 16;
const XEN_SHORT_PARTS: u32 = 16;
const XEN_EXT_DISKS: u32 = 1 << 20;
const XEN_EXT_PARTS: u32 = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiskInterface {
    Xen { disk: u32, partition: u32 },
    Scsi { disk: u32, partition: u32 },
    Ide { disk: u32, partition: u32 },
}

fn bad(name: impl std::fmt::Display) -> Error {
    Error::BadInterfaceName(name.to_string())
}

/// Lowercase letter run for a disk index: 0 -> "a", 25 -> "z",
/// 26 -> "aa".
fn disk_letters(mut n: u32) -> String {
    let mut out = Vec::new();
    loop {
        out.push(b'a' + (n % 26) as u8);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    out.reverse();
    String::from_utf8(out).expect("ascii letters")
}

fn letters_to_disk(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_lowercase()) {
        return None;
    }
    let mut n: u32 = 0;
    for b in s.bytes() {
        n = n.checked_mul(26)?.checked_add((b - b'a') as u32 + 1)?;
    }
    Some(n - 1)
}

impl DiskInterface {
    /// Picks the naming for a requested disk number.
    pub fn for_disk_number(
        hvm: bool,
        disk: u32,
        partition: u32,
    ) -> Result<Self, Error> {
        if hvm && disk < IDE_DISKS && partition < IDE_PARTS {
            return Ok(DiskInterface::Ide { disk, partition });
        }
        if disk < XEN_EXT_DISKS && partition < XEN_EXT_PARTS {
            return Ok(DiskInterface::Xen { disk, partition });
        }
        Err(bad(format!("disk {disk} partition {partition}")))
    }

    pub fn disk_number(&self) -> u32 {
        match *self {
            DiskInterface::Xen { disk, .. }
            | DiskInterface::Scsi { disk, .. }
            | DiskInterface::Ide { disk, .. } => disk,
        }
    }

    pub fn partition(&self) -> u32 {
        match *self {
            DiskInterface::Xen { partition, .. }
            | DiskInterface::Scsi { partition, .. }
            | DiskInterface::Ide { partition, .. } => partition,
        }
    }

    /// The integer device key published in the control tree.
    pub fn device_key(&self) -> Result<u32, Error> {
        match *self {
            DiskInterface::Xen { disk, partition } => {
                if disk < XEN_SHORT_DISKS && partition < XEN_SHORT_PARTS {
                    Ok((202 << 8) | (disk << 4) | partition)
                } else if disk < XEN_EXT_DISKS && partition < XEN_EXT_PARTS {
                    Ok((1 << 28) | (disk << 8) | partition)
                } else {
                    Err(bad(self.linux_device()))
                }
            }
            DiskInterface::Scsi { disk, partition } => {
                if disk < SCSI_DISKS && partition < SCSI_PARTS {
                    Ok((8 << 8) | (disk << 4) | partition)
                } else {
                    Err(bad(self.linux_device()))
                }
            }
            DiskInterface::Ide { disk, partition } => {
                if disk >= IDE_DISKS || partition >= IDE_PARTS {
                    return Err(bad(self.linux_device()));
                }
                let base = if disk < 2 { 3 << 8 } else { 22 << 8 };
                Ok(base | ((disk & 1) << 6) | partition)
            }
        }
    }

    /// The guest-visible linux device string.
    pub fn linux_device(&self) -> String {
        let (prefix, disk, partition) = match *self {
            DiskInterface::Xen { disk, partition } => {
                ("xvd", disk, partition)
            }
            DiskInterface::Scsi { disk, partition } => ("sd", disk, partition),
            DiskInterface::Ide { disk, partition } => ("hd", disk, partition),
        };
        if partition == 0 {
            format!("{prefix}{}", disk_letters(disk))
        } else {
            format!("{prefix}{}{partition}", disk_letters(disk))
        }
    }

    /// Parses a linux device string ("xvda1", "sdb", "hdc2") or the
    /// numeric paravirtual form ("d5p1").
    pub fn parse(name: &str) -> Result<Self, Error> {
        let (kind, rest) = if let Some(r) = name.strip_prefix("xvd") {
            ("xvd", r)
        } else if let Some(r) = name.strip_prefix("sd") {
            ("sd", r)
        } else if let Some(r) = name.strip_prefix("hd") {
            ("hd", r)
        } else if let Some(r) = name.strip_prefix('d') {
            // d<disk>p<partition>
            let (d, p) = r.split_once('p').unwrap_or((r, "0"));
            let disk = d.parse().map_err(|_| bad(name))?;
            let partition = p.parse().map_err(|_| bad(name))?;
            return Ok(DiskInterface::Xen { disk, partition });
        } else {
            return Err(bad(name));
        };

        let letters_end = rest
            .bytes()
            .position(|b| !b.is_ascii_lowercase())
            .unwrap_or(rest.len());
        let (letters, digits) = rest.split_at(letters_end);
        let disk = letters_to_disk(letters).ok_or_else(|| bad(name))?;
        let partition = if digits.is_empty() {
            0
        } else {
            digits.parse().map_err(|_| bad(name))?
        };
        let iface = match kind {
            "xvd" => DiskInterface::Xen { disk, partition },
            "sd" => DiskInterface::Scsi { disk, partition },
            "hd" => DiskInterface::Ide { disk, partition },
            _ => unreachable!(),
        };
        // Reject names that cannot be expressed as a device key.
        iface.device_key()?;
        Ok(iface)
    }

    /// Decodes a control-tree device key.
    pub fn from_device_key(key: u32) -> Result<Self, Error> {
        if key >> 28 == 1 {
            return Ok(DiskInterface::Xen {
                disk: (key >> 8) & 0xf_ffff,
                partition: key & 0xff,
            });
        }
        match key >> 8 {
            202 => Ok(DiskInterface::Xen {
                disk: (key >> 4) & 0xf,
                partition: key & 0xf,
            }),
            8 => Ok(DiskInterface::Scsi {
                disk: (key >> 4) & 0xf,
                partition: key & 0xf,
            }),
            3 => Ok(DiskInterface::Ide {
                disk: (key >> 6) & 0x1,
                partition: key & 0x3f,
            }),
            22 => Ok(DiskInterface::Ide {
                disk: 2 + ((key >> 6) & 0x1),
                partition: key & 0x3f,
            }),
            _ => Err(bad(format!("device key {key}"))),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hvm_low_disks_are_ide_then_xen() {
        assert_eq!(
            DiskInterface::for_disk_number(true, 0, 0).unwrap(),
            DiskInterface::Ide { disk: 0, partition: 0 }
        );
        assert_eq!(
            DiskInterface::for_disk_number(true, 3, 2).unwrap(),
            DiskInterface::Ide { disk: 3, partition: 2 }
        );
        assert_eq!(
            DiskInterface::for_disk_number(true, 4, 0).unwrap(),
            DiskInterface::Xen { disk: 4, partition: 0 }
        );
    }

    #[test]
    fn pv_disks_are_always_xen() {
        assert_eq!(
            DiskInterface::for_disk_number(false, 0, 0).unwrap(),
            DiskInterface::Xen { disk: 0, partition: 0 }
        );
    }

    #[test]
    fn device_keys_use_the_classic_encodings() {
        // xvda
        assert_eq!(
            DiskInterface::Xen { disk: 0, partition: 0 }
                .device_key()
                .unwrap(),
            202 << 8
        );
        // sda1
        assert_eq!(
            DiskInterface::Scsi { disk: 0, partition: 1 }
                .device_key()
                .unwrap(),
            (8 << 8) | 1
        );
        // hda and hdd2 span the two IDE controllers
        assert_eq!(
            DiskInterface::Ide { disk: 0, partition: 0 }
                .device_key()
                .unwrap(),
            3 << 8
        );
        assert_eq!(
            DiskInterface::Ide { disk: 3, partition: 2 }
                .device_key()
                .unwrap(),
            (22 << 8) | (1 << 6) | 2
        );
        // Large paravirtual disks use the extended scheme.
        assert_eq!(
            DiskInterface::Xen { disk: 26, partition: 1 }
                .device_key()
                .unwrap(),
            (1 << 28) | (26 << 8) | 1
        );
    }

    #[test]
    fn device_keys_round_trip() {
        for iface in [
            DiskInterface::Xen { disk: 0, partition: 0 },
            DiskInterface::Xen { disk: 15, partition: 15 },
            DiskInterface::Xen { disk: 100, partition: 3 },
            DiskInterface::Scsi { disk: 2, partition: 1 },
            DiskInterface::Ide { disk: 1, partition: 63 },
            DiskInterface::Ide { disk: 2, partition: 0 },
        ] {
            let key = iface.device_key().unwrap();
            assert_eq!(DiskInterface::from_device_key(key).unwrap(), iface);
        }
    }

    #[test]
    fn linux_names_round_trip() {
        let cases = [
            (DiskInterface::Xen { disk: 0, partition: 0 }, "xvda"),
            (DiskInterface::Xen { disk: 0, partition: 1 }, "xvda1"),
            (DiskInterface::Xen { disk: 26, partition: 0 }, "xvdaa"),
            (DiskInterface::Scsi { disk: 1, partition: 2 }, "sdb2"),
            (DiskInterface::Ide { disk: 3, partition: 0 }, "hdd"),
        ];
        for (iface, name) in cases {
            assert_eq!(iface.linux_device(), name);
            assert_eq!(DiskInterface::parse(name).unwrap(), iface);
        }
    }

    #[test]
    fn numeric_paravirtual_names_parse() {
        assert_eq!(
            DiskInterface::parse("d5p1").unwrap(),
            DiskInterface::Xen { disk: 5, partition: 1 }
        );
        assert_eq!(
            DiskInterface::parse("d7").unwrap(),
            DiskInterface::Xen { disk: 7, partition: 0 }
        );
    }

    #[test]
    fn nonsense_names_fail() {
        for name in ["", "xvd", "fd0", "hde9999", "sd0", "xvdA"] {
            assert!(
                matches!(
                    DiskInterface::parse(name),
                    Err(Error::BadInterfaceName(_))
                ),
                "{name} should not parse"
            );
        }
    }
}
