// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Describes the daemon config which may be parsed from a TOML file.
//!
//! Nothing in here is a hard-coded host path: helper binaries, the control
//! tree socket, and the collaborator daemons' sockets all come from the
//! file so a test harness can point them anywhere.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Timeouts and cadences for the engine's bounded waits. All fields have
/// defaults matching the documented behavior; a config file only needs to
/// name the ones it changes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Wall budget for a dying domain to leave the hypervisor's list
    /// during destroy.
    pub destroy_budget_ms: u64,

    /// Poll period for the dying-domain check. The effective upper bound
    /// on destroy is `destroy_budget_ms` plus one interval.
    pub destroy_poll_interval_ms: u64,

    /// How long a suspending guest gets to finish shutting down after it
    /// acknowledges the suspend request.
    pub suspend_wait_ms: u64,

    /// Ack window given to the guest during the suspend handshake.
    pub suspend_ack_ms: u64,

    /// Bound on the parallel hard-shutdown of a VM's block devices.
    pub backend_shutdown_ms: u64,

    /// Cadence of the event watcher's domain-list poll.
    pub event_poll_interval_ms: u64,

    /// Grace period before a device-model process is killed outright.
    pub dm_stop_grace_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            destroy_budget_ms: 30_000,
            destroy_poll_interval_ms: 5_000,
            suspend_wait_ms: 20 * 60 * 1_000,
            suspend_ack_ms: 30_000,
            backend_shutdown_ms: 60_000,
            event_poll_interval_ms: 1_000,
            dm_stop_grace_ms: 5_000,
        }
    }
}

impl Timeouts {
    pub fn destroy_budget(&self) -> Duration {
        Duration::from_millis(self.destroy_budget_ms)
    }
    pub fn destroy_poll_interval(&self) -> Duration {
        Duration::from_millis(self.destroy_poll_interval_ms)
    }
    pub fn suspend_wait(&self) -> Duration {
        Duration::from_millis(self.suspend_wait_ms)
    }
    pub fn suspend_ack(&self) -> Duration {
        Duration::from_millis(self.suspend_ack_ms)
    }
    pub fn backend_shutdown(&self) -> Duration {
        Duration::from_millis(self.backend_shutdown_ms)
    }
    pub fn event_poll_interval(&self) -> Duration {
        Duration::from_millis(self.event_poll_interval_ms)
    }
    pub fn dm_stop_grace(&self) -> Duration {
        Duration::from_millis(self.dm_stop_grace_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Root of the persistent state layout (one subtree per entity).
    pub state_root: PathBuf,

    /// The build/save/restore helper binary.
    pub helper_path: PathBuf,

    /// The device-model binary for HVM guests.
    pub device_model_path: PathBuf,

    /// The PV console/VNC binary for PV guests with a framebuffer.
    pub pv_console_path: PathBuf,

    /// Bootloader name → binary path, for the indirect-PV build path.
    #[serde(default)]
    pub bootloaders: BTreeMap<String, PathBuf>,

    /// Unix socket of the host configuration tree daemon.
    pub store_socket: PathBuf,

    /// Unix socket of the ballooning broker.
    pub broker_socket: PathBuf,

    /// Unix socket of the storage daemon.
    pub storage_socket: PathBuf,

    /// Reject unknown platform/backend keys instead of just logging them.
    #[serde(default)]
    pub strict_keys: bool,

    #[serde(default)]
    pub timeouts: Timeouts,
}

pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let cfg = toml::from_str::<Config>(&contents)?;
    Ok(cfg)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn minimal_config_parses_with_default_timeouts() {
        let raw = r#"
            state_root = "/var/lib/domaind"
            helper_path = "/usr/libexec/domain-helper"
            device_model_path = "/usr/libexec/device-model"
            pv_console_path = "/usr/libexec/pv-console"
            store_socket = "/run/store.sock"
            broker_socket = "/run/broker.sock"
            storage_socket = "/run/storage.sock"

            [bootloaders]
            pygrub = "/usr/libexec/pygrub"
        "#;
        let cfg: Config = toml::from_str(raw).unwrap();
        assert_eq!(cfg.timeouts.destroy_budget_ms, 30_000);
        assert_eq!(cfg.timeouts.destroy_poll_interval_ms, 5_000);
        assert!(!cfg.strict_keys);
        assert_eq!(
            cfg.bootloaders.get("pygrub").unwrap(),
            &PathBuf::from("/usr/libexec/pygrub")
        );
    }

    #[test]
    fn timeout_overrides_apply() {
        let raw = r#"
            state_root = "/tmp/s"
            helper_path = "/tmp/h"
            device_model_path = "/tmp/dm"
            pv_console_path = "/tmp/pvc"
            store_socket = "/tmp/store"
            broker_socket = "/tmp/broker"
            storage_socket = "/tmp/storage"

            [timeouts]
            destroy_poll_interval_ms = 500
        "#;
        let cfg: Config = toml::from_str(raw).unwrap();
        assert_eq!(cfg.timeouts.destroy_poll_interval_ms, 500);
        assert_eq!(cfg.timeouts.destroy_budget_ms, 30_000);
    }
}
