// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-process implementation of the host configuration tree with the
//! full semantics the engine relies on: implicit parent creation,
//! recursive removal, snapshot transactions with conflict-driven retry,
//! and path-prefix watches that fire once on registration.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use domaind_api_types::Error;
use tokio::sync::mpsc;

use super::{ControlTree, Perms, TxId, WatchStream, TX_NONE};

#[derive(Clone, Debug)]
struct Node {
    value: String,
    perms: Option<Perms>,
}

struct TxState {
    snapshot: BTreeMap<String, Node>,
    base_generation: u64,
    writes: Vec<String>,
}

struct WatchEntry {
    path: String,
    tx: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
struct Inner {
    nodes: BTreeMap<String, Node>,
    generation: u64,
    next_tx: TxId,
    txs: HashMap<TxId, TxState>,
    watches: Vec<WatchEntry>,
}

#[derive(Clone, Default)]
pub struct MemoryTree {
    inner: Arc<Mutex<Inner>>,
}

fn normalize(path: &str) -> String {
    let p = path.trim_end_matches('/');
    if p.is_empty() {
        "/".to_owned()
    } else {
        p.to_owned()
    }
}

/// True when a change to `changed` is visible to a watch on `watched`.
fn watch_covers(watched: &str, changed: &str) -> bool {
    changed == watched || changed.starts_with(&format!("{watched}/"))
}

fn insert_with_parents(nodes: &mut BTreeMap<String, Node>, path: &str) {
    let mut at = String::new();
    for component in path.split('/').filter(|c| !c.is_empty()) {
        at.push('/');
        at.push_str(component);
        nodes.entry(at.clone()).or_insert_with(|| Node {
            value: String::new(),
            perms: None,
        });
    }
}

impl Inner {
    fn target(&mut self, tx: TxId) -> &mut BTreeMap<String, Node> {
        if tx == TX_NONE {
            &mut self.nodes
        } else {
            // An unknown transaction id is a caller bug; the live tree
            // must never be silently substituted for it.
            &mut self.txs.get_mut(&tx).expect("live transaction").snapshot
        }
    }

    fn record_write(&mut self, tx: TxId, path: &str) {
        if tx == TX_NONE {
            self.generation += 1;
            self.fire(path);
        } else if let Some(t) = self.txs.get_mut(&tx) {
            t.writes.push(path.to_owned());
        }
    }

    fn fire(&mut self, changed: &str) {
        self.watches.retain(|w| {
            if watch_covers(&w.path, changed) {
                w.tx.send(changed.to_owned()).is_ok()
            } else {
                !w.tx.is_closed()
            }
        });
    }
}

impl MemoryTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires watchers registered on a special token (e.g.
    /// `@introduceDomain`), which never names a real node.
    pub fn fire_token(&self, token: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.watches.retain(|w| {
            if w.path == token {
                w.tx.send(token.to_owned()).is_ok()
            } else {
                !w.tx.is_closed()
            }
        });
    }

    /// Test accessor: the current value of a node, if present.
    pub fn get(&self, path: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.nodes.get(&normalize(path)).map(|n| n.value.clone())
    }

    /// Test accessor: the recorded permissions of a node.
    pub fn perms_of(&self, path: &str) -> Option<Perms> {
        let inner = self.inner.lock().unwrap();
        inner.nodes.get(&normalize(path)).and_then(|n| n.perms)
    }
}

#[async_trait]
impl ControlTree for MemoryTree {
    async fn read(&self, tx: TxId, path: &str) -> Result<String, Error> {
        let path = normalize(path);
        let mut inner = self.inner.lock().unwrap();
        inner
            .target(tx)
            .get(&path)
            .map(|n| n.value.clone())
            .ok_or(Error::DoesNotExist)
    }

    async fn write(
        &self,
        tx: TxId,
        path: &str,
        value: &str,
    ) -> Result<(), Error> {
        let path = normalize(path);
        let mut inner = self.inner.lock().unwrap();
        let target = inner.target(tx);
        insert_with_parents(target, &path);
        target.get_mut(&path).expect("just inserted").value =
            value.to_owned();
        inner.record_write(tx, &path);
        Ok(())
    }

    async fn mkdir(&self, tx: TxId, path: &str) -> Result<(), Error> {
        let path = normalize(path);
        let mut inner = self.inner.lock().unwrap();
        insert_with_parents(inner.target(tx), &path);
        inner.record_write(tx, &path);
        Ok(())
    }

    async fn rm(&self, tx: TxId, path: &str) -> Result<(), Error> {
        let path = normalize(path);
        let prefix = format!("{path}/");
        let mut inner = self.inner.lock().unwrap();
        let target = inner.target(tx);
        let doomed: Vec<String> = target
            .keys()
            .filter(|k| *k == &path || k.starts_with(&prefix))
            .cloned()
            .collect();
        for k in &doomed {
            target.remove(k);
        }
        if !doomed.is_empty() {
            inner.record_write(tx, &path);
        }
        Ok(())
    }

    async fn directory(
        &self,
        tx: TxId,
        path: &str,
    ) -> Result<Vec<String>, Error> {
        let path = normalize(path);
        let prefix =
            if path == "/" { "/".to_owned() } else { format!("{path}/") };
        let mut inner = self.inner.lock().unwrap();
        let target = inner.target(tx);
        if path != "/" && !target.contains_key(&path) {
            return Err(Error::DoesNotExist);
        }
        let mut children = Vec::new();
        for k in target.keys() {
            if let Some(rest) = k.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') {
                    children.push(rest.to_owned());
                }
            }
        }
        Ok(children)
    }

    async fn setperms(
        &self,
        tx: TxId,
        path: &str,
        perms: &Perms,
    ) -> Result<(), Error> {
        let path = normalize(path);
        let mut inner = self.inner.lock().unwrap();
        let target = inner.target(tx);
        let node = target.get_mut(&path).ok_or(Error::DoesNotExist)?;
        node.perms = Some(*perms);
        Ok(())
    }

    async fn watch(&self, path: &str) -> Result<WatchStream, Error> {
        let (tx, rx) = mpsc::unbounded_channel();
        // The registration fires once immediately, matching the tree
        // daemon's behavior; consumers are required to be idempotent.
        let _ = tx.send(path.to_owned());
        let mut inner = self.inner.lock().unwrap();
        inner.watches.push(WatchEntry { path: path.to_owned(), tx });
        Ok(rx)
    }

    async fn unwatch(&self, path: &str) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.watches.retain(|w| w.path != path);
        Ok(())
    }

    async fn tx_start(&self) -> Result<TxId, Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_tx += 1;
        let id = inner.next_tx;
        let state = TxState {
            snapshot: inner.nodes.clone(),
            base_generation: inner.generation,
            writes: Vec::new(),
        };
        inner.txs.insert(id, state);
        Ok(id)
    }

    async fn tx_end(&self, tx: TxId, commit: bool) -> Result<bool, Error> {
        let mut inner = self.inner.lock().unwrap();
        let state = inner.txs.remove(&tx).ok_or(Error::DoesNotExist)?;
        if !commit {
            return Ok(true);
        }
        if state.base_generation != inner.generation {
            // A concurrent commit landed; the caller must retry.
            return Ok(false);
        }
        inner.nodes = state.snapshot;
        inner.generation += 1;
        for path in state.writes {
            inner.fire(&path);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::{read_opt, transaction};

    #[tokio::test]
    async fn read_of_absent_path_is_does_not_exist() {
        let t = MemoryTree::new();
        assert!(matches!(
            t.read(TX_NONE, "/local/domain/1/name").await,
            Err(Error::DoesNotExist)
        ));
        assert_eq!(read_opt(&t, TX_NONE, "/nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn write_creates_parents_and_directory_lists_children() {
        let t = MemoryTree::new();
        t.write(TX_NONE, "/local/domain/3/memory/target", "1024")
            .await
            .unwrap();
        t.write(TX_NONE, "/local/domain/3/memory/static-max", "2048")
            .await
            .unwrap();
        let mut kids = t.directory(TX_NONE, "/local/domain/3/memory").await.unwrap();
        kids.sort();
        assert_eq!(kids, vec!["static-max", "target"]);
        assert_eq!(
            t.directory(TX_NONE, "/local/domain").await.unwrap(),
            vec!["3"]
        );
    }

    #[tokio::test]
    async fn rm_removes_the_whole_subtree() {
        let t = MemoryTree::new();
        t.write(TX_NONE, "/a/b/c", "1").await.unwrap();
        t.write(TX_NONE, "/a/b2", "2").await.unwrap();
        t.rm(TX_NONE, "/a/b").await.unwrap();
        assert!(t.read(TX_NONE, "/a/b/c").await.is_err());
        assert_eq!(t.read(TX_NONE, "/a/b2").await.unwrap(), "2");
    }

    #[tokio::test]
    async fn watch_fires_on_registration_and_below_the_path() {
        let t = MemoryTree::new();
        let mut w = t.watch("/local/domain/5").await.unwrap();
        assert_eq!(w.recv().await.unwrap(), "/local/domain/5");

        t.write(TX_NONE, "/local/domain/5/control/shutdown", "poweroff")
            .await
            .unwrap();
        assert_eq!(
            w.recv().await.unwrap(),
            "/local/domain/5/control/shutdown"
        );

        // Unrelated writes stay silent.
        t.write(TX_NONE, "/local/domain/6/name", "x").await.unwrap();
        assert!(w.try_recv().is_err());
    }

    #[tokio::test]
    async fn conflicting_transaction_retries_and_commits() {
        let t = MemoryTree::new();
        let tree: Arc<dyn ControlTree> = Arc::new(t.clone());

        // First attempt conflicts: someone writes between start and end.
        let tx = tree.tx_start().await.unwrap();
        tree.write(tx, "/x", "in-tx").await.unwrap();
        t.write(TX_NONE, "/y", "interloper").await.unwrap();
        assert!(!tree.tx_end(tx, true).await.unwrap());
        assert!(t.get("/x").is_none());

        // The transaction helper retries until the commit lands.
        transaction(tree.as_ref(), |tx| {
            let tr = tree.clone();
            async move {
                let prior = read_opt(tr.as_ref(), tx, "/counter").await?;
                let n: u64 =
                    prior.map(|v| v.parse().unwrap_or(0)).unwrap_or(0);
                tr.write(tx, "/counter", &(n + 1).to_string()).await
            }
        })
        .await
        .unwrap();
        assert_eq!(t.get("/counter").unwrap(), "1");
    }

    #[tokio::test]
    async fn transaction_writes_fire_watches_only_on_commit() {
        let t = MemoryTree::new();
        let mut w = t.watch("/a").await.unwrap();
        let _ = w.recv().await; // registration fire

        let tx = t.tx_start().await.unwrap();
        t.write(tx, "/a/b", "v").await.unwrap();
        assert!(w.try_recv().is_err());
        assert!(t.tx_end(tx, true).await.unwrap());
        assert_eq!(w.recv().await.unwrap(), "/a/b");
    }
}
