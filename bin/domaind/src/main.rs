// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use dropshot::{
    ConfigDropshot, ConfigLogging, ConfigLoggingLevel, HttpServerStarter,
};
use slog::{info, o};

use domaind::broker::{BrokerHandle, SimBroker, SocketBroker};
use domaind::config;
use domaind::devices::dm::DeviceModel;
use domaind::devices::DeviceSupervisor;
use domaind::events;
use domaind::hyperctl::privcmd::{PrivcmdHypervisor, DEFAULT_PRIVCMD_PATH};
use domaind::hyperctl::sim::SimHypervisor;
use domaind::hyperctl::Hypervisor;
use domaind::server::{self, ApiContext};
use domaind::storage::{SimStorage, SocketStorage, StorageService};
use domaind::store::memory::MemoryTree;
use domaind::store::wire::SocketTree;
use domaind::store::ControlTree;
use domaind::updates::UpdateBus;
use domaind::vm::extra::ExtraStore;
use domaind::vm::{Deps, Engine};

#[derive(Debug, Parser)]
#[clap(about, version)]
/// The control-plane daemon for guest domains
enum Args {
    /// Generates the OpenAPI specification.
    Openapi,
    /// Runs the daemon.
    Run {
        #[clap(action)]
        cfg: PathBuf,

        #[clap(name = "IP:PORT", action)]
        listen_addr: SocketAddr,

        /// Run against in-memory simulations of the host services
        /// instead of the real hypervisor and daemons.
        #[clap(short, long)]
        sim: bool,
    },
}

pub fn run_openapi() -> Result<(), String> {
    server::api()
        .openapi("Domain Control-Plane API", "0.1.0")
        .description("API for driving guest domains on this host.")
        .write(&mut std::io::stdout())
        .map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args {
        Args::Openapi => run_openapi()
            .map_err(|e| anyhow!("cannot generate OpenAPI spec: {}", e)),
        Args::Run { cfg, listen_addr, sim } => {
            let config = Arc::new(config::parse(&cfg)?);

            let config_dropshot = ConfigDropshot {
                bind_address: listen_addr,
                // Suspend images arrive through VM.receive_memory.
                request_body_max_bytes: 1024 * 1024 * 1024,
                ..Default::default()
            };
            let config_logging = ConfigLogging::StderrTerminal {
                level: ConfigLoggingLevel::Info,
            };
            let log = config_logging
                .to_logger("domaind")
                .map_err(|e| anyhow!("failed to create logger: {}", e))?;

            let tree: Arc<dyn ControlTree> = if sim {
                Arc::new(MemoryTree::new())
            } else {
                Arc::new(
                    SocketTree::connect(
                        &config.store_socket,
                        log.new(o!("component" => "store")),
                    )
                    .await
                    .context("connecting to the control tree daemon")?,
                )
            };
            let hyper: Arc<dyn Hypervisor> = if sim {
                Arc::new(SimHypervisor::new())
            } else {
                Arc::new(
                    PrivcmdHypervisor::open(DEFAULT_PRIVCMD_PATH)
                        .context("opening the hypervisor control device")?,
                )
            };
            let broker_impl: Arc<dyn domaind::broker::MemoryBroker> = if sim
            {
                // 8 GiB of pretend host memory.
                Arc::new(SimBroker::new(8 << 30))
            } else {
                Arc::new(SocketBroker::new(config.broker_socket.clone()))
            };
            let broker = Arc::new(BrokerHandle::new(
                broker_impl,
                log.new(o!("component" => "broker")),
            ));
            let storage: Arc<dyn StorageService> = if sim {
                Arc::new(SimStorage::new())
            } else {
                Arc::new(SocketStorage::new(config.storage_socket.clone()))
            };

            let dm = DeviceModel::new(
                config.device_model_path.clone(),
                config.pv_console_path.clone(),
                config.timeouts.dm_stop_grace(),
                log.new(o!("component" => "device-model")),
            );
            let devices = Arc::new(DeviceSupervisor::new(
                tree.clone(),
                hyper.clone(),
                dm,
                config.timeouts.clone(),
                config.strict_keys,
                log.new(o!("component" => "devices")),
            ));
            let extras = Arc::new(ExtraStore::new(config.state_root.clone())?);

            let engine = Engine::new(Deps {
                tree,
                hyper,
                broker,
                storage,
                devices,
                extras,
                updates: Arc::new(UpdateBus::new()),
                config: config.clone(),
                log: log.new(o!("component" => "engine")),
            });

            events::spawn(engine.clone());

            let context = ApiContext {
                engine,
                log: log.new(o!("component" => "server")),
            };

            info!(log, "starting server"; "addr" => %listen_addr, "sim" => sim);
            let server = HttpServerStarter::new(
                &config_dropshot,
                server::api(),
                Arc::new(context),
                &log,
            )
            .map_err(|error| anyhow!("failed to start server: {}", error))?
            .start();

            server
                .await
                .map_err(|e| anyhow!("server exited with an error: {}", e))
        }
    }
}
