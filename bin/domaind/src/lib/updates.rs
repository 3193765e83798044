// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The in-memory update bus: an append-only stream of [`Update`] items
//! with monotonically increasing ids, polled by the orchestrator through
//! `UPDATES.get`.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use domaind_api_types::{Update, UpdateBatch};

/// Retained history. Consumers further behind than this simply see a
/// gap; the protocol is level-triggered (each update names an object to
/// re-query), so gaps are harmless.
const RETAIN: usize = 4096;

struct BusInner {
    items: VecDeque<(u64, Update)>,
    next_id: u64,
}

pub struct UpdateBus {
    inner: Mutex<BusInner>,
    notify: tokio::sync::watch::Sender<u64>,
    watcher: tokio::sync::watch::Receiver<u64>,
}

impl Default for UpdateBus {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateBus {
    pub fn new() -> Self {
        let (notify, watcher) = tokio::sync::watch::channel(0);
        Self {
            inner: Mutex::new(BusInner {
                items: VecDeque::new(),
                next_id: 1,
            }),
            notify,
            watcher,
        }
    }

    /// Appends an update and wakes every blocked `get`.
    pub fn inject(&self, update: Update) -> u64 {
        let id = {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.items.push_back((id, update));
            while inner.items.len() > RETAIN {
                inner.items.pop_front();
            }
            id
        };
        let _ = self.notify.send(id);
        id
    }

    /// Returns every update newer than `last`, blocking until one
    /// arrives or the timeout expires. The returned cursor is one past
    /// the newest id ever assigned.
    pub async fn get(&self, last: u64, timeout: Duration) -> UpdateBatch {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut watcher = self.watcher.clone();
        loop {
            {
                let inner = self.inner.lock().unwrap();
                let updates: Vec<Update> = inner
                    .items
                    .iter()
                    .filter(|(id, _)| *id > last)
                    .map(|(_, u)| u.clone())
                    .collect();
                if !updates.is_empty() {
                    return UpdateBatch { updates, next_id: inner.next_id };
                }
            }
            match tokio::time::timeout_at(deadline, watcher.changed()).await {
                Ok(Ok(())) => continue,
                // Sender gone or timeout: report the current cursor.
                Ok(Err(_)) | Err(_) => {
                    let inner = self.inner.lock().unwrap();
                    return UpdateBatch {
                        updates: Vec::new(),
                        next_id: inner.next_id,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use domaind_api_types::VmId;

    fn vm_update(s: &str) -> Update {
        Update::Vm { vm: VmId(s.into()) }
    }

    #[tokio::test]
    async fn updates_arrive_in_order_with_increasing_ids() {
        let bus = UpdateBus::new();
        let a = bus.inject(vm_update("vm-a"));
        let b = bus.inject(vm_update("vm-b"));
        assert!(a < b);

        let batch = bus.get(0, Duration::from_secs(1)).await;
        assert_eq!(
            batch.updates,
            vec![vm_update("vm-a"), vm_update("vm-b")]
        );
        assert_eq!(batch.next_id, b + 1);

        // Nothing newer: an empty batch after the timeout.
        let empty = bus.get(b, Duration::from_millis(10)).await;
        assert!(empty.updates.is_empty());
        assert_eq!(empty.next_id, b + 1);
    }

    #[tokio::test]
    async fn get_blocks_until_an_update_arrives() {
        let bus = std::sync::Arc::new(UpdateBus::new());
        let bus2 = bus.clone();
        let getter = tokio::spawn(async move {
            bus2.get(0, Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.inject(vm_update("vm-late"));
        let batch = getter.await.unwrap();
        assert_eq!(batch.updates, vec![vm_update("vm-late")]);
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let bus = UpdateBus::new();
        for i in 0..(RETAIN + 100) {
            bus.inject(vm_update(&format!("vm-{i}")));
        }
        let batch = bus.get(0, Duration::from_millis(1)).await;
        assert_eq!(batch.updates.len(), RETAIN);
        assert_eq!(batch.next_id, (RETAIN + 100) as u64 + 1);
    }
}
