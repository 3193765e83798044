// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client interface to the host configuration tree: the hierarchical
//! key/value namespace shared between the control plane and its guests.
//!
//! Two implementations exist: [`wire::SocketTree`] speaks the tree
//! daemon's packet protocol over a unix socket, and [`memory::MemoryTree`]
//! is an in-process tree with the same semantics used by the test suite
//! and the simulated server mode.
//!
//! Reads of an absent path fail with [`Error::DoesNotExist`]; callers that
//! treat absence as data use [`read_opt`]. Watches are coalesced by path
//! and fire once immediately on registration, so consumers must be
//! idempotent.

use std::future::Future;

use async_trait::async_trait;
use domaind_api_types::{DomId, Error};
use tokio::sync::mpsc;

pub mod memory;
pub mod wire;

/// A transaction identifier. `TX_NONE` addresses the live tree.
pub type TxId = u32;
pub const TX_NONE: TxId = 0;

/// Access granted to domains other than the owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PermLevel {
    None,
    Read,
    Write,
    ReadWrite,
}

impl PermLevel {
    pub fn wire_char(&self) -> char {
        match self {
            PermLevel::None => 'n',
            PermLevel::Read => 'r',
            PermLevel::Write => 'w',
            PermLevel::ReadWrite => 'b',
        }
    }
}

/// Node permissions: an owning domain plus the access granted to everyone
/// else.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Perms {
    pub owner: DomId,
    pub others: PermLevel,
}

impl Perms {
    pub fn ro(owner: DomId) -> Self {
        Self { owner, others: PermLevel::Read }
    }

    pub fn rw(owner: DomId) -> Self {
        Self { owner, others: PermLevel::ReadWrite }
    }

    pub fn wire_string(&self) -> String {
        format!("{}{}", self.others.wire_char(), self.owner)
    }
}

/// A stream of fired watch paths. The payload is the path that changed
/// (which may be below the registered path).
pub type WatchStream = mpsc::UnboundedReceiver<String>;

#[async_trait]
pub trait ControlTree: Send + Sync {
    async fn read(&self, tx: TxId, path: &str) -> Result<String, Error>;
    async fn write(
        &self,
        tx: TxId,
        path: &str,
        value: &str,
    ) -> Result<(), Error>;
    async fn mkdir(&self, tx: TxId, path: &str) -> Result<(), Error>;

    /// Removes a node and its entire subtree. Removing an absent path is
    /// not an error.
    async fn rm(&self, tx: TxId, path: &str) -> Result<(), Error>;

    /// Lists the immediate children of a node.
    async fn directory(
        &self,
        tx: TxId,
        path: &str,
    ) -> Result<Vec<String>, Error>;

    async fn setperms(
        &self,
        tx: TxId,
        path: &str,
        perms: &Perms,
    ) -> Result<(), Error>;

    async fn watch(&self, path: &str) -> Result<WatchStream, Error>;
    async fn unwatch(&self, path: &str) -> Result<(), Error>;

    async fn tx_start(&self) -> Result<TxId, Error>;

    /// Ends a transaction. On commit, `Ok(false)` means the tree saw a
    /// conflicting concurrent commit and the whole transaction body must
    /// be re-run.
    async fn tx_end(&self, tx: TxId, commit: bool) -> Result<bool, Error>;

    /// Reads `keys` relative to `base`, failing on the first absence.
    async fn readv(
        &self,
        tx: TxId,
        base: &str,
        keys: &[&str],
    ) -> Result<Vec<String>, Error> {
        let mut out = Vec::with_capacity(keys.len());
        for k in keys {
            out.push(self.read(tx, &format!("{base}/{k}")).await?);
        }
        Ok(out)
    }

    /// Writes `(key, value)` pairs relative to `base`.
    async fn writev(
        &self,
        tx: TxId,
        base: &str,
        pairs: &[(String, String)],
    ) -> Result<(), Error> {
        for (k, v) in pairs {
            self.write(tx, &format!("{base}/{k}"), v).await?;
        }
        Ok(())
    }
}

/// Reads a path, mapping absence to `None` and keeping every other error.
pub async fn read_opt(
    tree: &dyn ControlTree,
    tx: TxId,
    path: &str,
) -> Result<Option<String>, Error> {
    match tree.read(tx, path).await {
        Ok(v) => Ok(Some(v)),
        Err(Error::DoesNotExist) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Watches `path` until `pred` accepts its current value (absent paths
/// are passed as `None`) or the timeout expires. Returns whether the
/// predicate was satisfied. The watch's immediate registration fire
/// guarantees at least one evaluation even if nothing ever changes.
pub async fn wait_path<F>(
    tree: &dyn ControlTree,
    path: &str,
    timeout: std::time::Duration,
    mut pred: F,
) -> Result<bool, Error>
where
    F: FnMut(Option<&str>) -> bool,
{
    let mut watch = tree.watch(path).await?;
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, watch.recv()).await {
            Err(_) => {
                let _ = tree.unwatch(path).await;
                return Ok(false);
            }
            Ok(None) => {
                return Err(Error::IoError("watch stream closed".into()));
            }
            Ok(Some(_)) => {
                let value = read_opt(tree, TX_NONE, path).await?;
                if pred(value.as_deref()) {
                    let _ = tree.unwatch(path).await;
                    return Ok(true);
                }
            }
        }
    }
}

/// Runs `f` inside a transaction, retrying the whole body until the tree
/// accepts the commit. The body receives the transaction id and must
/// address its operations to the same tree; it must be idempotent up to
/// those operations, since a conflicting commit re-runs it from scratch.
pub async fn transaction<T, F, Fut>(
    tree: &dyn ControlTree,
    f: F,
) -> Result<T, Error>
where
    F: Fn(TxId) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    loop {
        let tx = tree.tx_start().await?;
        match f(tx).await {
            Ok(v) => {
                if tree.tx_end(tx, true).await? {
                    return Ok(v);
                }
                // Conflicting commit; run the body again.
            }
            Err(e) => {
                let _ = tree.tx_end(tx, false).await;
                return Err(e);
            }
        }
    }
}
