//! Shared test harness: a scheduler wired to mock collaborators.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Result;
use async_trait::async_trait;

use crate::config::SchedulerConfig;
use crate::coordination::{CoordinationStore, FileStore};
use crate::data_model::{ClusterKind, Member};
use crate::driver::{
    MasterInfo,
    Offer,
    OfferFilters,
    OfferId,
    PortRange,
    Resource,
    SchedulerDriver,
    TaskId,
    TaskInfo,
    TaskState,
    TaskStatus,
    WorkerId,
};
use crate::etcd::{quorum, EtcdApi, ReseedCandidate};
use crate::launcher::SerialLauncher;
use crate::reconcile::{FrameworkSummary, MasterState, MasterStateSource, TaskSummary};
use crate::scheduler::{EtcdScheduler, LaunchSignals, SchedulerState, ShutdownFn};

#[derive(Default)]
pub struct MockDriver {
    declines: StdMutex<Vec<(OfferId, f64)>>,
    launches: StdMutex<Vec<(Vec<OfferId>, Vec<TaskInfo>)>>,
    kills: StdMutex<Vec<TaskId>>,
    reconcile_calls: AtomicUsize,
    aborted: AtomicBool,
}

impl MockDriver {
    pub fn declines(&self) -> Vec<(OfferId, f64)> {
        self.declines.lock().unwrap().clone()
    }

    pub fn launches(&self) -> Vec<(Vec<OfferId>, Vec<TaskInfo>)> {
        self.launches.lock().unwrap().clone()
    }

    pub fn kills(&self) -> Vec<TaskId> {
        self.kills.lock().unwrap().clone()
    }

    pub fn reconcile_count(&self) -> usize {
        self.reconcile_calls.load(Ordering::SeqCst)
    }

    pub fn aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SchedulerDriver for MockDriver {
    async fn decline_offer(&self, offer_id: &OfferId, filters: OfferFilters) -> Result<()> {
        self.declines
            .lock()
            .unwrap()
            .push((offer_id.clone(), filters.refuse_seconds));
        Ok(())
    }

    async fn launch_tasks(
        &self,
        offer_ids: Vec<OfferId>,
        tasks: Vec<TaskInfo>,
        _filters: OfferFilters,
    ) -> Result<()> {
        self.launches.lock().unwrap().push((offer_ids, tasks));
        Ok(())
    }

    async fn kill_task(&self, task_id: &TaskId) -> Result<()> {
        self.kills.lock().unwrap().push(task_id.clone());
        Ok(())
    }

    async fn reconcile_tasks(&self, _statuses: Vec<TaskStatus>) -> Result<()> {
        self.reconcile_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn abort(&self) -> Result<()> {
        self.aborted.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory stand-in for a running ensemble's admin surface.
#[derive(Default)]
pub struct MockEtcd {
    /// etcd's own view of its configuration: member name → member id.
    members: StdMutex<HashMap<String, String>>,
    healthy: StdMutex<HashSet<String>>,
    heal_on_reseed: StdMutex<HashMap<String, bool>>,
    reseed_triggers: StdMutex<Vec<String>>,
    removed: StdMutex<Vec<String>>,
    candidates: StdMutex<Vec<ReseedCandidate>>,
}

impl MockEtcd {
    pub fn set_members(&self, names: &[&str]) {
        let mut members = self.members.lock().unwrap();
        members.clear();
        for name in names {
            members.insert(name.to_string(), format!("id-{}", name));
        }
    }

    /// Register a member in etcd's own view and mark it healthy, as a
    /// freshly started member would be.
    pub fn add_configured(&self, name: &str) {
        self.members
            .lock()
            .unwrap()
            .insert(name.to_string(), format!("id-{}", name));
        self.healthy.lock().unwrap().insert(name.to_string());
    }

    pub fn set_member_health(&self, name: &str, healthy: bool) {
        let mut set = self.healthy.lock().unwrap();
        if healthy {
            set.insert(name.to_string());
        } else {
            set.remove(name);
        }
    }

    pub fn set_heal_on_reseed(&self, name: &str, heals: bool) {
        self.heal_on_reseed
            .lock()
            .unwrap()
            .insert(name.to_string(), heals);
    }

    pub fn set_candidates(&self, candidates: Vec<ReseedCandidate>) {
        *self.candidates.lock().unwrap() = candidates;
    }

    pub fn reseed_triggers(&self) -> Vec<String> {
        self.reseed_triggers.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl EtcdApi for MockEtcd {
    async fn member_list(
        &self,
        running: &HashMap<String, Member>,
    ) -> Result<HashMap<String, String>> {
        if running.is_empty() {
            return Ok(HashMap::new());
        }
        Ok(self.members.lock().unwrap().clone())
    }

    async fn add_member(
        &self,
        _running: &HashMap<String, Member>,
        _new_member: &Member,
    ) -> Result<()> {
        Ok(())
    }

    async fn remove_member(&self, _running: &HashMap<String, Member>, name: &str) -> Result<()> {
        self.removed.lock().unwrap().push(name.to_string());
        self.members.lock().unwrap().remove(name);
        Ok(())
    }

    async fn health_check(&self, running: &HashMap<String, Member>) -> Result<()> {
        if running.is_empty() {
            return Ok(());
        }
        let healthy = self.healthy.lock().unwrap();
        let responding = running.keys().filter(|name| healthy.contains(*name)).count();
        let needed = quorum(running.len());
        if responding < needed {
            anyhow::bail!(
                "{} of {} members healthy, quorum needs {}",
                responding,
                running.len(),
                needed
            );
        }
        Ok(())
    }

    async fn trigger_reseed(&self, member: &Member) -> Result<()> {
        self.reseed_triggers
            .lock()
            .unwrap()
            .push(member.name.clone());
        let heals = self
            .heal_on_reseed
            .lock()
            .unwrap()
            .get(&member.name)
            .copied()
            .unwrap_or(true);
        if heals {
            self.healthy.lock().unwrap().insert(member.name.clone());
        }
        Ok(())
    }

    async fn rank_reseed_candidates(
        &self,
        _running: &HashMap<String, Member>,
    ) -> Vec<ReseedCandidate> {
        self.candidates.lock().unwrap().clone()
    }
}

#[derive(Default)]
pub struct MockMasterState {
    peers: StdMutex<Vec<String>>,
}

impl MockMasterState {
    pub fn set_peers(&self, task_ids: &[&str]) {
        *self.peers.lock().unwrap() = task_ids.iter().map(|s| s.to_string()).collect();
    }
}

#[async_trait]
impl MasterStateSource for MockMasterState {
    async fn fetch(&self, _master: &MasterInfo) -> Result<MasterState> {
        let tasks = self
            .peers
            .lock()
            .unwrap()
            .iter()
            .map(|id| TaskSummary {
                id: id.clone(),
                name: "etcd-server".to_string(),
                state: "TASK_RUNNING".to_string(),
            })
            .collect();
        Ok(MasterState {
            frameworks: vec![FrameworkSummary {
                name: "etcd-test".to_string(),
                tasks,
            }],
        })
    }
}

pub struct TestCluster {
    pub scheduler: Arc<EtcdScheduler>,
    pub driver: Arc<MockDriver>,
    pub etcd: Arc<MockEtcd>,
    pub master: Arc<MockMasterState>,
    pub coordination: Arc<FileStore>,
    signals: Option<LaunchSignals>,
    shutdown_flag: Arc<AtomicBool>,
    _store_dir: tempfile::TempDir,
}

pub fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        cluster_name: "test".to_string(),
        desired_instance_count: 3,
        ..Default::default()
    }
}

impl TestCluster {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: SchedulerConfig) -> Self {
        let driver = Arc::new(MockDriver::default());
        let etcd = Arc::new(MockEtcd::default());
        let master = Arc::new(MockMasterState::default());
        let store_dir = tempfile::tempdir().unwrap();
        let coordination = Arc::new(FileStore::new(store_dir.path(), &config.cluster_name));

        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let flag = shutdown_flag.clone();
        let shutdown: ShutdownFn = Arc::new(move || flag.store(true, Ordering::SeqCst));

        let (scheduler, signals) = EtcdScheduler::new(
            &config,
            driver.clone(),
            etcd.clone(),
            master.clone(),
            Some(coordination.clone() as Arc<dyn CoordinationStore>),
            shutdown,
        );
        // Deterministic member names for assertions.
        scheduler.model.write().await.highest_instance_id = 0;

        Self {
            scheduler,
            driver,
            etcd,
            master,
            coordination,
            signals: Some(signals),
            shutdown_flag,
            _store_dir: store_dir,
        }
    }

    pub async fn make_mutable(&self) {
        self.scheduler.set_state(SchedulerState::Mutable).await;
    }

    /// Install a member as already running: model, task map, and etcd's own
    /// view all agree, and the member reports healthy.
    pub async fn add_running(&self, name: &str, worker: &str) -> Member {
        let member = test_member(name, worker);
        {
            let mut model = self.scheduler.model.write().await;
            model
                .tasks
                .insert(name.to_string(), TaskId::new(member.to_task_id()));
            model.running.insert(name.to_string(), member.clone());
            if let Some(id) = member.instance_id() {
                if id >= model.highest_instance_id {
                    model.highest_instance_id = id + 1;
                }
            }
        }
        self.etcd.add_configured(name);
        member
    }

    /// Install a member as launched but not yet reported on.
    pub async fn pending_member(&self, name: &str, worker: &str) -> Member {
        let member = test_member(name, worker);
        self.scheduler
            .model
            .write()
            .await
            .pending
            .insert(name.to_string(), member.clone());
        member
    }

    pub fn launcher(&mut self) -> SerialLauncher {
        SerialLauncher::new(self.scheduler.clone(), self.signals.take().unwrap())
    }

    pub fn try_recv_pause(&mut self) -> Result<(), tokio::sync::mpsc::error::TryRecvError> {
        self.signals.as_mut().unwrap().pause_rx.try_recv()
    }

    pub fn try_recv_launch(&mut self) -> Result<(), tokio::sync::mpsc::error::TryRecvError> {
        self.signals.as_mut().unwrap().launch_rx.try_recv()
    }

    pub fn was_shut_down(&self) -> bool {
        self.shutdown_flag.load(Ordering::SeqCst)
    }
}

pub fn test_member(name: &str, worker: &str) -> Member {
    Member {
        name: name.to_string(),
        host: format!("{}.example", worker),
        peer_port: 31000,
        client_port: 31001,
        reseed_port: 31002,
        kind: ClusterKind::Existing,
        worker_id: worker.to_string(),
    }
}

/// An offer that satisfies the default per-task requirements exactly once.
pub fn adequate_offer(id: &str, worker: &str) -> Offer {
    offer_with(
        id,
        worker,
        1.0,
        256.0,
        1024.0,
        vec![PortRange {
            begin: 31000,
            end: 31010,
        }],
    )
}

pub fn offer_with(
    id: &str,
    worker: &str,
    cpus: f64,
    mem: f64,
    disk: f64,
    ports: Vec<PortRange>,
) -> Offer {
    Offer {
        id: OfferId::new(id),
        worker_id: WorkerId::new(worker),
        hostname: format!("{}.example", worker),
        resources: vec![
            Resource::Cpus(cpus),
            Resource::Mem(mem),
            Resource::Disk(disk),
            Resource::Ports(ports),
        ],
    }
}

pub fn running_status(member: &Member) -> TaskStatus {
    TaskStatus {
        task_id: TaskId::new(member.to_task_id()),
        state: TaskState::Running,
        worker_id: WorkerId::new(member.worker_id.clone()),
        message: None,
    }
}

pub fn terminal_status(member: &Member, state: TaskState) -> TaskStatus {
    TaskStatus {
        task_id: TaskId::new(member.to_task_id()),
        state,
        worker_id: WorkerId::new(member.worker_id.clone()),
        message: None,
    }
}
