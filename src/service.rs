//! Wires the scheduler core to its production collaborators and runs the
//! worker tasks until shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum_server::Handle;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;

use crate::config::SchedulerConfig;
use crate::coordination::{CoordinationStore, FileStore};
use crate::driver::mesos::{self, MesosDriver};
use crate::etcd::EtcdClient;
use crate::launcher::SerialLauncher;
use crate::reconcile::HttpMasterStateSource;
use crate::routes::{create_routes, RouteState};
use crate::scheduler::{EtcdScheduler, LaunchSignals, ShutdownFn};

pub struct Service {
    config: SchedulerConfig,
    scheduler: Arc<EtcdScheduler>,
    driver: Arc<MesosDriver>,
    signals: Option<LaunchSignals>,
    shutdown_tx: watch::Sender<()>,
    shutdown_rx: watch::Receiver<()>,
}

impl Service {
    pub async fn new(config: SchedulerConfig) -> Result<Self> {
        config.validate()?;

        let coordination: Option<Arc<dyn CoordinationStore>> =
            config.coordination_path.as_ref().map(|root| {
                Arc::new(FileStore::new(root, &config.cluster_name)) as Arc<dyn CoordinationStore>
            });
        let previous_framework_id = match &coordination {
            Some(store) => store
                .load_framework_id()
                .await
                .context("loading persisted framework id")?,
            None => None,
        };
        if let Some(id) = &previous_framework_id {
            info!(framework_id = id.get(), "resuming persisted framework identity");
        }

        let driver = Arc::new(MesosDriver::new(&config, previous_framework_id)?);
        let etcd = Arc::new(EtcdClient::new()?);
        let master_state = Arc::new(HttpMasterStateSource::new()?);
        let shutdown: ShutdownFn = Arc::new(|| std::process::exit(1));

        let (scheduler, signals) = EtcdScheduler::new(
            &config,
            driver.clone(),
            etcd,
            master_state,
            coordination,
            shutdown,
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(());

        Ok(Self {
            config,
            scheduler,
            driver,
            signals: Some(signals),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Run until a shutdown signal arrives. Admin-server death and driver
    /// abort are fatal and surface as errors so the process exits non-zero.
    pub async fn start(&mut self) -> Result<()> {
        let signals = self.signals.take().context("service already started")?;

        let launcher = SerialLauncher::new(self.scheduler.clone(), signals);
        tokio::spawn(launcher.run(self.shutdown_rx.clone()));
        tokio::spawn(
            self.scheduler
                .clone()
                .periodic_launch_requestor(self.shutdown_rx.clone()),
        );

        let handle = Handle::new();
        {
            let handle = handle.clone();
            let shutdown_tx = self.shutdown_tx.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                info!("shutdown signal received, stopping workers");
                handle.shutdown();
                let _ = shutdown_tx.send(());
            });
        }

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!(listen_addr = self.config.listen_addr, "admin http listening");
        let routes = create_routes(RouteState {
            scheduler: self.scheduler.clone(),
        });
        let admin = async {
            axum_server::bind(addr)
                .handle(handle)
                .serve(routes.into_make_service())
                .await
                .context("admin http server died")
        };

        let events = mesos::run_event_loop(
            self.driver.clone(),
            self.scheduler.clone(),
            self.shutdown_rx.clone(),
        );

        tokio::try_join!(admin, events)?;
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
