// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The domaind library: the per-VM lifecycle engine and its collaborators.
//!
//! The binary in `main.rs` stands up the HTTP server in [`server`]; the
//! engine itself lives in [`vm`] and drives guests through
//! create → build → device plug → run → (shutdown | suspend | reboot |
//! crash) → cleanup against the host services wrapped by [`store`],
//! [`hyperctl`], [`broker`], [`storage`] and [`devices`].

pub mod broker;
pub mod builder;
pub mod config;
pub mod devices;
pub mod events;
pub mod hyperctl;
pub mod server;
pub mod storage;
pub mod store;
pub mod tasks;
pub mod updates;
pub mod vm;
