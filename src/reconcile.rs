//! Task reconciliation after (re)registration.
//!
//! The scheduler stays immutable until its view of running tasks matches the
//! master's, so placements never race against status updates that are still
//! in flight from a previous incarnation.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::driver::MasterInfo;
use crate::retry::Backoff;
use crate::scheduler::{EtcdScheduler, SchedulerState};

const SYNC_ROUNDS: u32 = 5;
const SYNC_POLLS_PER_ROUND: u32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: String,
    pub name: String,
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameworkSummary {
    pub name: String,
    #[serde(default)]
    pub tasks: Vec<TaskSummary>,
}

/// The slice of the master's state endpoint the reconciler consumes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MasterState {
    #[serde(default)]
    pub frameworks: Vec<FrameworkSummary>,
}

/// Task ids of this cluster's running members, per the master's view.
pub fn peers_for_cluster(state: &MasterState, framework_name: &str) -> Vec<String> {
    state
        .frameworks
        .iter()
        .filter(|f| f.name == framework_name)
        .flat_map(|f| f.tasks.iter())
        .filter(|t| t.state == "TASK_RUNNING")
        .map(|t| t.id.clone())
        .collect()
}

#[async_trait]
pub trait MasterStateSource: Send + Sync {
    async fn fetch(&self, master: &MasterInfo) -> Result<MasterState>;
}

pub struct HttpMasterStateSource {
    http: reqwest::Client,
}

impl HttpMasterStateSource {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl MasterStateSource for HttpMasterStateSource {
    async fn fetch(&self, master: &MasterInfo) -> Result<MasterState> {
        let url = format!("http://{}:{}/master/state", master.hostname, master.port);
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("GET {} returned {}", url, resp.status());
        }
        Ok(resp.json().await?)
    }
}

impl EtcdScheduler {
    /// Drive reconciliation until the model matches the master, then open
    /// the scheduler for placements. Runs once per (re)registration;
    /// exhausting every round is fatal.
    pub(crate) async fn attempt_master_sync(self: Arc<Self>) {
        let backoff = Backoff::standard();
        let mut delay = backoff.initial;
        for _ in 0..SYNC_ROUNDS {
            match self.driver.reconcile_tasks(vec![]).await {
                Err(err) => error!(error = %err, "reconcile call failed"),
                Ok(()) => match self.wait_for_master_sync().await {
                    Ok(()) => {
                        info!("scheduler transitioning to mutable state");
                        self.set_state(SchedulerState::Mutable).await;
                        return;
                    }
                    Err(err) => error!(error = %err, "master sync round failed"),
                },
            }
            tokio::time::sleep(delay).await;
            delay = backoff.next(delay);
        }
        error!("failed to synchronize with the master, it is dangerous to continue; dying");
        (self.shutdown)();
    }

    /// Give reconciled status updates some time to arrive, polling the
    /// master's state endpoint until the peer count matches the model.
    async fn wait_for_master_sync(&self) -> Result<()> {
        let master = self
            .model
            .read()
            .await
            .master_info
            .clone()
            .ok_or_else(|| anyhow!("no master info"))?;

        let backoff = Backoff::standard();
        let mut delay = backoff.initial;
        for _ in 0..SYNC_POLLS_PER_ROUND {
            info!("trying to sync with the master");
            match self.master_state.fetch(&master).await {
                Err(err) => error!(error = %err, "unable to fetch master state"),
                Ok(state) => {
                    if self.is_in_sync(&state).await {
                        info!("scheduler synchronized with the master");
                        return Ok(());
                    }
                    warn!("scheduler not yet in sync with the master");
                }
            }
            tokio::time::sleep(delay).await;
            delay = backoff.next(delay);
        }
        Err(anyhow!("unable to sync with the master"))
    }

    async fn is_in_sync(&self, state: &MasterState) -> bool {
        let peers = peers_for_cluster(state, &self.framework_name);
        let model = self.model.read().await;
        peers.len() == model.running.len()
    }
}
