// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The VM lifecycle engine.
//!
//! One [`Engine`] per daemon. Each VM gets a worker task draining a
//! bounded queue of jobs, so operations on a single VM are strictly
//! serialized while different VMs proceed in parallel. A second,
//! per-VM "slow" lane exists for streaming jobs (receiving a suspend
//! image, mirror traffic) so they cannot starve ordinary lifecycle
//! operations. The transition implementations live in
//! [`state_driver`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use domaind_api_types::{Error, VmId};
use futures::future::BoxFuture;
use slog::{info, o, Logger};
use tokio::sync::{mpsc, oneshot};

use crate::broker::BrokerHandle;
use crate::config::Config;
use crate::devices::DeviceSupervisor;
use crate::hyperctl::Hypervisor;
use crate::storage::StorageService;
use crate::store::ControlTree;
use crate::tasks::Task;
use crate::updates::UpdateBus;

pub mod devnum;
pub mod extra;
pub mod memory;
pub mod request_queue;
pub mod state_driver;

use extra::ExtraStore;
use request_queue::ExternalRequestQueue;

/// Depth of each per-VM job queue. Backpressure, not correctness: a
/// full queue rejects new work instead of buffering without bound.
const QUEUE_DEPTH: usize = 32;

/// Everything the engine's operations need to reach.
pub struct Deps {
    pub tree: Arc<dyn ControlTree>,
    pub hyper: Arc<dyn Hypervisor>,
    pub broker: Arc<BrokerHandle>,
    pub storage: Arc<dyn StorageService>,
    pub devices: Arc<DeviceSupervisor>,
    pub extras: Arc<ExtraStore>,
    pub updates: Arc<UpdateBus>,
    pub config: Arc<Config>,
    pub log: Logger,
}

/// The context handed to every per-VM operation: identity, shared
/// dependencies, the VM's admission queue, and the task handle for
/// progress/cancellation.
#[derive(Clone)]
pub struct VmCtx {
    pub vm: VmId,
    pub deps: Arc<Deps>,
    pub queue: Arc<StdMutex<ExternalRequestQueue>>,
    pub task: Task,
    pub log: Logger,
}

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct Worker {
    tx: mpsc::Sender<Job>,
}

pub struct Engine {
    deps: Arc<Deps>,
    workers: StdMutex<HashMap<VmId, Worker>>,
    slow_workers: StdMutex<HashMap<VmId, Worker>>,
    queues: StdMutex<HashMap<VmId, Arc<StdMutex<ExternalRequestQueue>>>>,
}

impl Engine {
    pub fn new(deps: Deps) -> Arc<Self> {
        Arc::new(Self {
            deps: Arc::new(deps),
            workers: StdMutex::new(HashMap::new()),
            slow_workers: StdMutex::new(HashMap::new()),
            queues: StdMutex::new(HashMap::new()),
        })
    }

    pub fn deps(&self) -> &Arc<Deps> {
        &self.deps
    }

    /// The VM's admission queue, created on first touch.
    pub fn lifecycle_queue(
        &self,
        vm: &VmId,
    ) -> Arc<StdMutex<ExternalRequestQueue>> {
        let mut queues = self.queues.lock().unwrap();
        queues
            .entry(vm.clone())
            .or_insert_with(|| {
                Arc::new(StdMutex::new(ExternalRequestQueue::new(
                    self.deps.log.new(o!("vm" => vm.to_string())),
                )))
            })
            .clone()
    }

    fn ctx(&self, vm: &VmId) -> VmCtx {
        VmCtx {
            vm: vm.clone(),
            deps: self.deps.clone(),
            queue: self.lifecycle_queue(vm),
            task: Task::new(),
            log: self.deps.log.new(o!("vm" => vm.to_string())),
        }
    }

    fn sender(
        map: &StdMutex<HashMap<VmId, Worker>>,
        vm: &VmId,
        log: &Logger,
        lane: &'static str,
    ) -> mpsc::Sender<Job> {
        let mut workers = map.lock().unwrap();
        if let Some(w) = workers.get(vm) {
            if !w.tx.is_closed() {
                return w.tx.clone();
            }
        }
        let (tx, mut rx) = mpsc::channel::<Job>(QUEUE_DEPTH);
        let worker_log = log.new(o!("vm" => vm.to_string(), "lane" => lane));
        tokio::spawn(async move {
            info!(worker_log, "vm worker started");
            while let Some(job) = rx.recv().await {
                job().await;
            }
            info!(worker_log, "vm worker exiting");
        });
        workers.insert(vm.clone(), Worker { tx: tx.clone() });
        tx
    }

    async fn dispatch<T, F, Fut>(
        &self,
        map: &StdMutex<HashMap<VmId, Worker>>,
        vm: &VmId,
        lane: &'static str,
        f: F,
    ) -> Result<T, Error>
    where
        F: FnOnce(VmCtx) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<T, Error>> + Send + 'static,
        T: Send + 'static,
    {
        let ctx = self.ctx(vm);
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            Box::pin(async move {
                let _ = reply_tx.send(f(ctx).await);
            })
        });
        let sender = Self::sender(map, vm, &self.deps.log, lane);
        sender.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::InternalError(
                format!("work queue for {vm} is full"),
            ),
            mpsc::error::TrySendError::Closed(_) => {
                Error::InternalError(format!("work queue for {vm} is gone"))
            }
        })?;
        reply_rx
            .await
            .map_err(|_| Error::InternalError("vm worker died".into()))?
    }

    /// Runs an operation on the VM's serial worker. Everything the RPC
    /// surface does to a VM goes through here, which is what makes
    /// operations on one VM totally ordered.
    pub async fn run_on<T, F, Fut>(
        self: &Arc<Self>,
        vm: &VmId,
        f: F,
    ) -> Result<T, Error>
    where
        F: FnOnce(VmCtx) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<T, Error>> + Send + 'static,
        T: Send + 'static,
    {
        self.dispatch(&self.workers, vm, "fast", f).await
    }

    /// Runs a long-running/streaming job on the VM's slow lane, which
    /// does not block ordinary lifecycle operations. Ordering against
    /// the fast lane is NOT guaranteed.
    pub async fn run_slow<T, F, Fut>(
        self: &Arc<Self>,
        vm: &VmId,
        f: F,
    ) -> Result<T, Error>
    where
        F: FnOnce(VmCtx) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<T, Error>> + Send + 'static,
        T: Send + 'static,
    {
        self.dispatch(&self.slow_workers, vm, "slow", f).await
    }

    /// Admits a lifecycle request through the VM's disposition queue,
    /// then drains the queue on the VM's worker. Denied requests fail
    /// here; ignored (idempotent) requests succeed without queuing.
    pub async fn submit_lifecycle(
        self: &Arc<Self>,
        vm: &VmId,
        request: request_queue::ExternalRequest,
    ) -> Result<(), Error> {
        {
            let queue = self.lifecycle_queue(vm);
            let mut queue = queue.lock().unwrap();
            queue.try_queue(request).map_err(Error::from)?;
        }
        self.run_on(vm, |ctx| async move {
            loop {
                let next = { ctx.queue.lock().unwrap().pop_front() };
                let Some(request) = next else { break };
                ctx.handle_lifecycle_request(request).await?;
            }
            Ok(())
        })
        .await
    }
}
