//! The scheduler core: cluster model, driver event handling, and the
//! admission gate consulted by the serial launcher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::coordination::{CoordinationStore, PersistOutcome};
use crate::data_model::Member;
use crate::driver::{
    parse_offer,
    FrameworkHandler,
    FrameworkId,
    MasterInfo,
    Offer,
    OfferFilters,
    OfferId,
    SchedulerDriver,
    TaskId,
    TaskState,
    TaskStatus,
    WorkerId,
};
use crate::etcd::EtcdApi;
use crate::metrics::Stats;
use crate::offer_cache::OfferCache;
use crate::reconcile::MasterStateSource;

/// Peer, client, and reseed ports for every member.
pub const PORTS_PER_TASK: u64 = 3;

const SIGNAL_CAPACITY: usize = 2048;

const COMPLETED_FRAMEWORK_ERROR: &str = "Completed framework attempted to re-register";

/// Whether the scheduler may place new members.
///
/// Immutable while waiting for state to settle after (re)registration,
/// while disconnected from the master, and during a reseed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Mutable,
    Immutable,
}

/// Everything guarded by the model lock. `pending` and `running` are
/// disjoint; every running member has a task id recorded for an eventual
/// kill.
pub(crate) struct ClusterModel {
    pub state: SchedulerState,
    pub framework_id: Option<FrameworkId>,
    pub master_info: Option<MasterInfo>,
    pub pending: HashMap<String, Member>,
    pub running: HashMap<String, Member>,
    pub tasks: HashMap<String, TaskId>,
    pub highest_instance_id: i64,
}

/// Hook invoked on fatal conditions; production wiring exits the process.
pub type ShutdownFn = Arc<dyn Fn() + Send + Sync>;

/// Receiving halves of the launch and pause signal channels, consumed by the
/// serial launcher.
pub struct LaunchSignals {
    pub launch_rx: mpsc::Receiver<()>,
    pub pause_rx: mpsc::Receiver<()>,
}

pub struct EtcdScheduler {
    pub stats: Stats,
    pub(crate) model: RwLock<ClusterModel>,
    pub(crate) reseeding: AtomicBool,
    pub(crate) livelock_window: StdMutex<Option<Instant>>,
    pub(crate) offer_cache: Arc<OfferCache>,
    launch_tx: mpsc::Sender<()>,
    pause_tx: mpsc::Sender<()>,
    pub(crate) driver: Arc<dyn SchedulerDriver>,
    pub(crate) etcd: Arc<dyn EtcdApi>,
    pub(crate) master_state: Arc<dyn MasterStateSource>,
    pub(crate) coordination: Option<Arc<dyn CoordinationStore>>,
    pub(crate) shutdown: ShutdownFn,
    weak_self: Weak<EtcdScheduler>,

    pub(crate) desired_instance_count: usize,
    pub(crate) chill: Duration,
    pub(crate) reseed_timeout: Duration,
    auto_reseed: bool,
    pub(crate) single_instance_per_worker: bool,
    pub(crate) cpus_per_task: f64,
    pub(crate) mem_per_task: f64,
    pub(crate) disk_per_task: f64,
    pub(crate) framework_name: String,
    pub(crate) executor_command: String,
    pub(crate) executor_uris: Vec<String>,
}

impl EtcdScheduler {
    pub fn new(
        config: &SchedulerConfig,
        driver: Arc<dyn SchedulerDriver>,
        etcd: Arc<dyn EtcdApi>,
        master_state: Arc<dyn MasterStateSource>,
        coordination: Option<Arc<dyn CoordinationStore>>,
        shutdown: ShutdownFn,
    ) -> (Arc<Self>, LaunchSignals) {
        let (launch_tx, launch_rx) = mpsc::channel(SIGNAL_CAPACITY);
        let (pause_tx, pause_rx) = mpsc::channel(SIGNAL_CAPACITY);
        // Seeding the instance counter with wall-clock seconds keeps names
        // unique across scheduler restarts without any coordination.
        let highest_instance_id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        let scheduler = Arc::new_cyclic(|weak| EtcdScheduler {
            stats: Stats::new(),
            model: RwLock::new(ClusterModel {
                state: SchedulerState::Immutable,
                framework_id: None,
                master_info: None,
                pending: HashMap::new(),
                running: HashMap::new(),
                tasks: HashMap::new(),
                highest_instance_id,
            }),
            reseeding: AtomicBool::new(false),
            livelock_window: StdMutex::new(None),
            offer_cache: Arc::new(OfferCache::new(
                config.desired_instance_count,
                config.single_instance_per_worker,
            )),
            launch_tx,
            pause_tx,
            driver,
            etcd,
            master_state,
            coordination,
            shutdown,
            weak_self: weak.clone(),
            desired_instance_count: config.desired_instance_count,
            chill: config.chill(),
            reseed_timeout: config.reseed_timeout(),
            auto_reseed: config.auto_reseed,
            single_instance_per_worker: config.single_instance_per_worker,
            cpus_per_task: config.cpus_per_task,
            mem_per_task: config.mem_per_task,
            disk_per_task: config.disk_per_task,
            framework_name: config.framework_name(),
            executor_command: config.executor_command.clone(),
            executor_uris: config.executor_uris.clone(),
        });
        (scheduler, LaunchSignals { launch_rx, pause_rx })
    }

    pub async fn state(&self) -> SchedulerState {
        self.model.read().await.state
    }

    pub(crate) async fn set_state(&self, state: SchedulerState) {
        self.model.write().await.state = state;
    }

    /// Copy of the running map so callers release the model lock promptly.
    pub async fn running_copy(&self) -> HashMap<String, Member> {
        self.model.read().await.running.clone()
    }

    /// Ask the serial launcher to attempt a placement. Never blocks.
    pub fn queue_launch_attempt(&self) {
        match self.launch_tx.try_send(()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(())) => warn!("launch signal channel is full"),
            Err(mpsc::error::TrySendError::Closed(())) => debug!("launch signal channel closed"),
        }
    }

    /// Ask the serial launcher to back off for a settling interval. Emitted
    /// before a lost member is dropped so etcd can be deconfigured before
    /// the next placement.
    pub fn pump_the_brakes(&self) {
        match self.pause_tx.try_send(()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(())) => warn!("pause signal channel is full"),
            Err(mpsc::error::TrySendError::Closed(())) => debug!("pause signal channel closed"),
        }
    }

    pub(crate) fn refuse_seconds(&self) -> f64 {
        (self.chill * 5).as_secs_f64()
    }

    pub(crate) async fn decline(&self, offer_id: &OfferId) {
        debug!(offer_id = offer_id.get(), "declining offer");
        let filters = OfferFilters {
            refuse_seconds: self.refuse_seconds(),
        };
        if let Err(err) = self.driver.decline_offer(offer_id, filters).await {
            warn!(offer_id = offer_id.get(), error = %err, "failed to decline offer");
        }
    }

    /// Reset per-registration state and kick off reconciliation with the
    /// master.
    async fn initialize(&self, master: MasterInfo) {
        {
            let mut model = self.model.write().await;
            model.running.clear();
            model.master_info = Some(master);
        }
        if let Some(me) = self.weak_self.upgrade() {
            tokio::spawn(me.attempt_master_sync());
        }
    }

    async fn handle_offer(&self, offer: Offer) {
        let resources = parse_offer(&offer);
        debug!(
            offer_id = offer.id.get(),
            worker_id = offer.worker_id.get(),
            cpus = resources.cpus,
            mem = resources.mem,
            disk = resources.disk,
            ports = resources.total_ports(),
            "received offer"
        );

        if self.state().await != SchedulerState::Mutable {
            debug!("scheduler is immutable, declining offer");
            self.decline(&offer.id).await;
            return;
        }

        let already_using_worker = self
            .running_copy()
            .await
            .values()
            .any(|m| m.worker_id == offer.worker_id.get());
        if already_using_worker && self.single_instance_per_worker {
            debug!(
                worker_id = offer.worker_id.get(),
                "worker already hosts a member, declining offer"
            );
            self.decline(&offer.id).await;
            return;
        }

        if resources.cpus < self.cpus_per_task {
            info!(offer_id = offer.id.get(), "offer cpus are insufficient");
        }
        if resources.mem < self.mem_per_task {
            info!(offer_id = offer.id.get(), "offer memory is insufficient");
        }
        if resources.disk < self.disk_per_task {
            info!(offer_id = offer.id.get(), "offer disk is insufficient");
        }
        if resources.lowest_contiguous(PORTS_PER_TASK).is_none() {
            info!(
                offer_id = offer.id.get(),
                "offer has no contiguous port range wide enough"
            );
        }

        let adequate = resources.cpus >= self.cpus_per_task
            && resources.mem >= self.mem_per_task
            && resources.disk >= self.disk_per_task
            && resources.lowest_contiguous(PORTS_PER_TASK).is_some();

        if adequate && self.offer_cache.push(offer.clone()) {
            debug!(offer_id = offer.id.get(), "offer cached");
            self.schedule_offer_expiration(offer.id.clone());
            self.queue_launch_attempt();
        } else {
            self.decline(&offer.id).await;
        }
    }

    /// Cached offers go stale quickly; decline any offer still cached after
    /// half a chill interval. Rescind-then-decline keeps this race-free
    /// against a concurrent pop by the launcher.
    fn schedule_offer_expiration(&self, offer_id: OfferId) {
        let cache = self.offer_cache.clone();
        let driver = self.driver.clone();
        let refuse_seconds = self.refuse_seconds();
        let delay = self.chill / 2;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if cache.rescind(&offer_id) {
                debug!(offer_id = offer_id.get(), "expiring unused cached offer");
                let filters = OfferFilters { refuse_seconds };
                if let Err(err) = driver.decline_offer(&offer_id, filters).await {
                    warn!(offer_id = offer_id.get(), error = %err, "failed to decline expired offer");
                }
            }
        });
    }

    async fn handle_status_update(&self, status: TaskStatus) {
        info!(
            task_id = status.task_id.get(),
            state = ?status.state,
            "status update"
        );

        let mut member = match Member::parse(status.task_id.get()) {
            Ok(member) => member,
            Err(err) => {
                error!(
                    task_id = status.task_id.get(),
                    error = %err,
                    "failed to decode member from task id"
                );
                return;
            }
        };
        member.worker_id = status.worker_id.get().to_string();

        let mut model = self.model.write().await;

        // Whatever the new state is, the task is no longer pending.
        model.pending.remove(&member.name);

        match status.state {
            state if state.is_terminal() => {
                self.stats.incr_failed_servers();
                // Pump the brakes so the lost member is deconfigured before
                // the next placement; adding first risks split brain.
                self.pump_the_brakes();
                model.running.remove(&member.name);
                model.tasks.remove(&member.name);
                self.queue_launch_attempt();
            }
            TaskState::Running => {
                if !model.running.contains_key(&member.name) {
                    model.tasks.insert(member.name.clone(), status.task_id.clone());
                    model.running.insert(member.name.clone(), member.clone());
                }
                // Reconciliation can surface instance ids ahead of ours.
                match member.instance_id() {
                    Some(observed) => {
                        if observed > model.highest_instance_id {
                            model.highest_instance_id = observed + 1;
                        }
                    }
                    None => warn!(
                        member = member.name,
                        "member name does not follow etcd-<index>"
                    ),
                }
            }
            other => {
                warn!(state = ?other, "received unhandled task state");
            }
        }

        if model.running.is_empty() {
            error!(
                "TOTAL CLUSTER LOSS! locking scheduler; \
                 the ensemble will not be reconstructed from zero without operator intervention"
            );
            model.state = SchedulerState::Immutable;
        }
    }

    /// Gate for a new placement. All of these must hold: scheduler mutable,
    /// no reseed underway, no pending member, under the desired count, etcd
    /// not already configured for the desired count, and the ensemble
    /// healthy. A sustained health failure ages the livelock window and
    /// eventually fires the reseed controller.
    pub(crate) async fn should_launch(&self) -> bool {
        let (state, pending_len, running) = {
            let model = self.model.read().await;
            (model.state, model.pending.len(), model.running.clone())
        };

        if state != SchedulerState::Mutable {
            info!("scheduler is not mutable, not launching");
            return false;
        }
        if self.reseeding.load(Ordering::SeqCst) {
            info!("reseed underway, not launching");
            return false;
        }
        if pending_len != 0 {
            info!("waiting on a pending member to report status, not launching");
            return false;
        }
        if running.len() >= self.desired_instance_count {
            debug!("already running enough members");
            return false;
        }

        let members = match self.etcd.member_list(&running).await {
            Ok(members) => members,
            Err(err) => {
                error!(error = %err, "failed to retrieve the etcd member list, rescheduling launch");
                return false;
            }
        };
        if members.len() == self.desired_instance_count {
            error!(
                "etcd is already configured for the desired member count; \
                 dead members must be deconfigured first or we risk livelock"
            );
            return false;
        }

        if let Err(err) = self.etcd.health_check(&running).await {
            self.stats.set_healthy(false);
            self.stats.incr_cluster_livelocks();

            let livelocked_for = {
                let mut window = self.livelock_window.lock().unwrap();
                match *window {
                    Some(since) => Some(since.elapsed()),
                    None => {
                        *window = Some(Instant::now());
                        None
                    }
                }
            };
            if let Some(age) = livelocked_for {
                if age > self.reseed_timeout {
                    error!(
                        livelocked_secs = age.as_secs(),
                        "ensemble has been livelocked past the reseed timeout"
                    );
                    if self.auto_reseed {
                        warn!("initiating reseed");
                        if let Some(me) = self.weak_self.upgrade() {
                            tokio::spawn(me.reseed_cluster());
                        }
                    } else {
                        warn!("automatic reseed disabled, doing nothing");
                    }
                    return false;
                }
            }

            error!(error = %err, "failed health check, rescheduling launch");
            return false;
        }

        self.stats.set_healthy(true);
        *self.livelock_window.lock().unwrap() = None;
        true
    }

    /// Deconfigure any etcd member the scheduler does not know about, so the
    /// ensemble is never overconfigured before a new member is added. At
    /// most one member is removed per pass; the next pass picks up the rest.
    pub(crate) async fn prune(&self) -> Result<()> {
        let (state, running) = {
            let model = self.model.read().await;
            (model.state, model.running.clone())
        };
        if state != SchedulerState::Mutable {
            info!("prune skipped while immutable");
            return Ok(());
        }

        let configured = self
            .etcd
            .member_list(&running)
            .await
            .context("prune could not retrieve the current member list")?;
        for name in configured.keys() {
            if !running.contains_key(name) {
                warn!(
                    member = name,
                    "deconfiguring etcd member unknown to the scheduler"
                );
                match self.etcd.remove_member(&running, name).await {
                    Ok(()) => return Ok(()),
                    Err(err) => {
                        error!(member = name, error = %err, "failed to remove member");
                    }
                }
            }
        }
        Ok(())
    }

    /// Wakes every five chill intervals to refresh the running-count stat
    /// and nudge the launcher when under-provisioned.
    pub async fn periodic_launch_requestor(self: Arc<Self>, mut shutdown_rx: watch::Receiver<()>) {
        loop {
            let (running_len, state) = {
                let model = self.model.read().await;
                (model.running.len(), model.state)
            };
            info!(
                running = running_len,
                desired = self.desired_instance_count,
                offers = self.offer_cache.len(),
                "placement heartbeat"
            );
            self.stats.set_running_servers(running_len as u64);

            if running_len < self.desired_instance_count && state == SchedulerState::Mutable {
                self.queue_launch_attempt();
            } else if state == SchedulerState::Immutable {
                info!("placement heartbeat skipping launch request while immutable");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.chill * 5) => {}
                _ = shutdown_rx.changed() => break,
            }
        }
    }
}

#[async_trait]
impl FrameworkHandler for EtcdScheduler {
    async fn registered(&self, framework_id: FrameworkId, master: MasterInfo) {
        info!(
            framework_id = framework_id.get(),
            master = master.hostname,
            "framework registered with master"
        );
        self.model.write().await.framework_id = Some(framework_id.clone());

        if let Some(store) = &self.coordination {
            match store.persist_framework_id(&framework_id).await {
                Ok(PersistOutcome::Created) => {}
                Ok(PersistOutcome::AlreadyPresent) => {
                    warn!("framework id is already persisted for this cluster");
                }
                Err(err) => {
                    error!(error = %err, "failed to persist framework id");
                    (self.shutdown)();
                    return;
                }
            }
        }

        self.initialize(master).await;
    }

    async fn reregistered(&self, master: MasterInfo) {
        info!(master = master.hostname, "framework reregistered with master");
        self.initialize(master).await;
    }

    async fn disconnected(&self) {
        error!("master disconnected");
        self.set_state(SchedulerState::Immutable).await;
    }

    async fn resource_offers(&self, offers: Vec<Offer>) {
        for offer in offers {
            self.handle_offer(offer).await;
        }
    }

    async fn offer_rescinded(&self, offer_id: OfferId) {
        info!(offer_id = offer_id.get(), "offer rescinded by master");
        self.offer_cache.rescind(&offer_id);
    }

    async fn status_update(&self, status: TaskStatus) {
        self.handle_status_update(status).await;
    }

    async fn framework_message(&self, executor_id: String, worker_id: WorkerId, message: String) {
        info!(executor_id, worker_id = worker_id.get(), message, "framework message");
    }

    async fn worker_lost(&self, worker_id: WorkerId) {
        info!(worker_id = worker_id.get(), "worker lost");
    }

    async fn executor_lost(&self, executor_id: String, worker_id: WorkerId, status: i32) {
        info!(
            executor_id,
            worker_id = worker_id.get(),
            status,
            "executor lost"
        );
    }

    async fn error(&self, message: String) {
        info!(message, "scheduler received error from master");
        if message == COMPLETED_FRAMEWORK_ERROR {
            if let Some(store) = &self.coordination {
                if let Err(err) = store.clear_framework_id().await {
                    error!(error = %err, "failed to clear persisted framework id");
                }
            }
            error!("removing reference to completed framework and dying");
            (self.shutdown)();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{adequate_offer, offer_with, running_status, terminal_status, TestCluster};
    use crate::driver::{PortRange, Resource};

    #[tokio::test]
    async fn offers_are_declined_while_immutable() {
        let cluster = TestCluster::new().await;
        assert_eq!(cluster.scheduler.state().await, SchedulerState::Immutable);

        cluster
            .scheduler
            .resource_offers(vec![adequate_offer("o1", "w1")])
            .await;

        let declines = cluster.driver.declines();
        assert_eq!(declines.len(), 1);
        assert_eq!(declines[0].0.get(), "o1");
        // Refuse window is five chill intervals.
        assert_eq!(declines[0].1, cluster.scheduler.refuse_seconds());
        assert_eq!(cluster.scheduler.offer_cache.len(), 0);
    }

    #[tokio::test]
    async fn adequate_offer_is_cached_when_mutable() {
        let cluster = TestCluster::new().await;
        cluster.make_mutable().await;

        cluster
            .scheduler
            .resource_offers(vec![adequate_offer("o1", "w1")])
            .await;

        assert!(cluster.driver.declines().is_empty());
        assert_eq!(cluster.scheduler.offer_cache.len(), 1);
    }

    #[tokio::test]
    async fn threshold_offer_is_accepted_and_one_below_is_declined() {
        let cluster = TestCluster::new().await;
        cluster.make_mutable().await;
        let s = &cluster.scheduler;

        let exact = offer_with(
            "exact",
            "w1",
            s.cpus_per_task,
            s.mem_per_task,
            s.disk_per_task,
            vec![PortRange {
                begin: 31000,
                end: 31002,
            }],
        );
        s.resource_offers(vec![exact]).await;
        assert_eq!(s.offer_cache.len(), 1);
        assert!(cluster.driver.declines().is_empty());

        for (id, cpus, mem, disk) in [
            ("low-cpu", s.cpus_per_task - 0.1, s.mem_per_task, s.disk_per_task),
            ("low-mem", s.cpus_per_task, s.mem_per_task - 1.0, s.disk_per_task),
            ("low-disk", s.cpus_per_task, s.mem_per_task, s.disk_per_task - 1.0),
        ] {
            let offer = offer_with(
                id,
                "w2",
                cpus,
                mem,
                disk,
                vec![PortRange {
                    begin: 31000,
                    end: 31002,
                }],
            );
            s.resource_offers(vec![offer]).await;
        }
        assert_eq!(cluster.driver.declines().len(), 3);
        assert_eq!(s.offer_cache.len(), 1);
    }

    #[tokio::test]
    async fn offer_without_three_contiguous_ports_is_declined() {
        let cluster = TestCluster::new().await;
        cluster.make_mutable().await;
        let s = &cluster.scheduler;

        // Plenty of total ports, but no single range holds three.
        let offer = offer_with(
            "narrow",
            "w1",
            s.cpus_per_task,
            s.mem_per_task,
            s.disk_per_task,
            vec![
                PortRange {
                    begin: 31000,
                    end: 31001,
                },
                PortRange {
                    begin: 32000,
                    end: 32001,
                },
            ],
        );
        s.resource_offers(vec![offer]).await;
        assert_eq!(cluster.driver.declines().len(), 1);
        assert_eq!(s.offer_cache.len(), 0);
    }

    #[tokio::test]
    async fn offer_from_an_occupied_worker_is_declined_in_single_instance_mode() {
        let cluster = TestCluster::new().await;
        cluster.make_mutable().await;
        cluster.add_running("etcd-1", "w1").await;

        cluster
            .scheduler
            .resource_offers(vec![adequate_offer("o1", "w1")])
            .await;
        assert_eq!(cluster.driver.declines().len(), 1);

        cluster
            .scheduler
            .resource_offers(vec![adequate_offer("o2", "w2")])
            .await;
        assert_eq!(cluster.driver.declines().len(), 1);
        assert_eq!(cluster.scheduler.offer_cache.len(), 1);
    }

    #[tokio::test]
    async fn rescinded_offers_leave_the_cache() {
        let cluster = TestCluster::new().await;
        cluster.make_mutable().await;
        cluster
            .scheduler
            .resource_offers(vec![adequate_offer("o1", "w1")])
            .await;
        assert_eq!(cluster.scheduler.offer_cache.len(), 1);

        cluster.scheduler.offer_rescinded(OfferId::new("o1")).await;
        assert_eq!(cluster.scheduler.offer_cache.len(), 0);
    }

    #[tokio::test]
    async fn running_status_promotes_a_pending_member() {
        let mut cluster = TestCluster::new().await;
        cluster.make_mutable().await;
        let member = cluster.pending_member("etcd-100", "w1").await;

        cluster
            .scheduler
            .status_update(running_status(&member))
            .await;

        let model = cluster.scheduler.model.read().await;
        assert!(model.pending.is_empty());
        assert!(model.running.contains_key("etcd-100"));
        assert!(model.tasks.contains_key("etcd-100"));
        // Observed id advances the counter past itself.
        assert_eq!(model.highest_instance_id, 101);
        drop(model);

        // The promotion consumed no signals.
        assert!(cluster.try_recv_pause().is_err());
    }

    #[tokio::test]
    async fn duplicate_running_status_is_idempotent() {
        let mut cluster = TestCluster::new().await;
        cluster.make_mutable().await;
        let member = cluster.pending_member("etcd-5", "w1").await;

        cluster
            .scheduler
            .status_update(running_status(&member))
            .await;
        let before = {
            let model = cluster.scheduler.model.read().await;
            (
                model.running.clone(),
                model.tasks.clone(),
                model.highest_instance_id,
            )
        };

        cluster
            .scheduler
            .status_update(running_status(&member))
            .await;
        let model = cluster.scheduler.model.read().await;
        assert_eq!(model.running, before.0);
        assert_eq!(model.tasks, before.1);
        assert_eq!(model.highest_instance_id, before.2);
    }

    #[tokio::test]
    async fn terminal_status_pauses_then_removes_and_requests_a_launch() {
        let mut cluster = TestCluster::new().await;
        cluster.make_mutable().await;
        cluster.add_running("etcd-1", "w1").await;
        cluster.add_running("etcd-2", "w2").await;
        cluster.add_running("etcd-3", "w3").await;
        let lost = cluster.scheduler.running_copy().await["etcd-2"].clone();

        cluster
            .scheduler
            .status_update(terminal_status(&lost, TaskState::Failed))
            .await;

        assert!(cluster.try_recv_pause().is_ok());
        assert!(cluster.try_recv_launch().is_ok());
        let model = cluster.scheduler.model.read().await;
        assert!(!model.running.contains_key("etcd-2"));
        assert!(!model.tasks.contains_key("etcd-2"));
        assert_eq!(model.state, SchedulerState::Mutable);
        assert_eq!(cluster.scheduler.stats.snapshot().failed_servers, 1);
    }

    #[tokio::test]
    async fn losing_the_last_member_locks_the_scheduler() {
        let cluster = TestCluster::new().await;
        cluster.make_mutable().await;
        cluster.add_running("etcd-1", "w1").await;
        let last = cluster.scheduler.running_copy().await["etcd-1"].clone();

        cluster
            .scheduler
            .status_update(terminal_status(&last, TaskState::Lost))
            .await;

        assert_eq!(cluster.scheduler.state().await, SchedulerState::Immutable);
    }

    #[tokio::test]
    async fn malformed_task_ids_are_ignored() {
        let cluster = TestCluster::new().await;
        cluster.make_mutable().await;
        cluster.add_running("etcd-1", "w1").await;

        cluster
            .scheduler
            .status_update(TaskStatus {
                task_id: TaskId::new("not-a-member"),
                state: TaskState::Failed,
                worker_id: WorkerId::new("w9"),
                message: None,
            })
            .await;

        // Nothing changed, nothing locked.
        assert_eq!(cluster.scheduler.running_copy().await.len(), 1);
        assert_eq!(cluster.scheduler.state().await, SchedulerState::Mutable);
    }

    #[tokio::test]
    async fn disconnect_locks_the_scheduler() {
        let cluster = TestCluster::new().await;
        cluster.make_mutable().await;
        cluster.scheduler.disconnected().await;
        assert_eq!(cluster.scheduler.state().await, SchedulerState::Immutable);
    }

    #[tokio::test]
    async fn completed_framework_error_clears_state_and_dies() {
        let cluster = TestCluster::new().await;
        cluster
            .coordination
            .persist_framework_id(&FrameworkId::new("framework-1"))
            .await
            .unwrap();

        cluster
            .scheduler
            .error(COMPLETED_FRAMEWORK_ERROR.to_string())
            .await;

        assert!(cluster.was_shut_down());
        assert_eq!(
            cluster.coordination.load_framework_id().await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn other_errors_are_benign() {
        let cluster = TestCluster::new().await;
        cluster.scheduler.error("transient thing".to_string()).await;
        assert!(!cluster.was_shut_down());
    }

    #[tokio::test]
    async fn registered_persists_the_framework_id() {
        let cluster = TestCluster::new().await;
        cluster
            .scheduler
            .registered(
                FrameworkId::new("framework-9"),
                MasterInfo {
                    hostname: "master".to_string(),
                    port: 5050,
                },
            )
            .await;
        assert_eq!(
            cluster.coordination.load_framework_id().await.unwrap(),
            Some(FrameworkId::new("framework-9"))
        );
        assert!(!cluster.was_shut_down());
    }

    #[tokio::test]
    async fn should_launch_requires_an_empty_pending_set() {
        let mut cluster = TestCluster::new().await;
        cluster.make_mutable().await;
        cluster.pending_member("etcd-50", "w5").await;
        assert!(!cluster.scheduler.should_launch().await);
    }

    #[tokio::test]
    async fn should_launch_refuses_a_fully_configured_ensemble() {
        let cluster = TestCluster::new().await;
        cluster.make_mutable().await;
        cluster.add_running("etcd-1", "w1").await;
        // etcd still believes in three members even though only one runs.
        cluster.etcd.set_members(&["etcd-1", "etcd-2", "etcd-3"]);
        assert!(!cluster.scheduler.should_launch().await);
    }

    #[tokio::test]
    async fn should_launch_allows_bootstrap_from_zero() {
        let cluster = TestCluster::new().await;
        cluster.make_mutable().await;
        assert!(cluster.scheduler.should_launch().await);
    }

    #[tokio::test]
    async fn unhealthy_ensemble_arms_the_livelock_window() {
        let cluster = TestCluster::new().await;
        cluster.make_mutable().await;
        cluster.add_running("etcd-1", "w1").await;
        cluster.etcd.set_member_health("etcd-1", false);

        assert!(!cluster.scheduler.should_launch().await);
        assert!(cluster.scheduler.livelock_window.lock().unwrap().is_some());
        assert_eq!(cluster.scheduler.stats.snapshot().healthy, 0);
        assert_eq!(cluster.scheduler.stats.snapshot().cluster_livelocks, 1);

        // Recovery clears the window.
        cluster.etcd.set_member_health("etcd-1", true);
        assert!(cluster.scheduler.should_launch().await);
        assert!(cluster.scheduler.livelock_window.lock().unwrap().is_none());
        assert_eq!(cluster.scheduler.stats.snapshot().healthy, 1);
    }

    #[tokio::test]
    async fn prune_removes_only_unknown_members_one_per_pass() {
        let cluster = TestCluster::new().await;
        cluster.make_mutable().await;
        cluster.add_running("etcd-1", "w1").await;
        cluster.etcd.set_members(&["etcd-1", "etcd-2"]);

        cluster.scheduler.prune().await.unwrap();
        assert_eq!(cluster.etcd.removed(), vec!["etcd-2".to_string()]);

        // A second pass with nothing unknown does no work.
        cluster.scheduler.prune().await.unwrap();
        assert_eq!(cluster.etcd.removed().len(), 1);
    }

    #[tokio::test]
    async fn prune_is_a_no_op_while_immutable() {
        let cluster = TestCluster::new().await;
        cluster.add_running("etcd-1", "w1").await;
        cluster.etcd.set_members(&["etcd-1", "etcd-2"]);
        cluster.scheduler.set_state(SchedulerState::Immutable).await;

        cluster.scheduler.prune().await.unwrap();
        assert!(cluster.etcd.removed().is_empty());
    }

    #[tokio::test]
    async fn offer_resources_ignore_unrelated_entries() {
        let cluster = TestCluster::new().await;
        cluster.make_mutable().await;
        // An offer whose scalars arrive split across entries still adds up.
        let offer = Offer {
            id: OfferId::new("split"),
            worker_id: WorkerId::new("w1"),
            hostname: "host".to_string(),
            resources: vec![
                Resource::Cpus(0.5),
                Resource::Cpus(0.5),
                Resource::Mem(128.0),
                Resource::Mem(128.0),
                Resource::Disk(4096.0),
                Resource::Ports(vec![PortRange {
                    begin: 31000,
                    end: 31005,
                }]),
            ],
        };
        cluster.scheduler.resource_offers(vec![offer]).await;
        assert_eq!(cluster.scheduler.offer_cache.len(), 1);
    }
}
