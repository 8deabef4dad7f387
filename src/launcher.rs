//! Single-flight placement worker.
//!
//! All launches funnel through one task so that growth happens one member at
//! a time with a settling delay in between; this is what keeps concurrent
//! membership changes against etcd impossible.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::data_model::{ClusterKind, Member};
use crate::driver::{
    parse_offer,
    ExecutorSpec,
    Offer,
    OfferFilters,
    TaskId,
    TaskInfo,
    TaskResources,
};
use crate::scheduler::{EtcdScheduler, LaunchSignals, PORTS_PER_TASK};

/// Resources reserved for the executor process itself, on top of the
/// per-task etcd resources.
const EXECUTOR_CPUS: f64 = 0.1;
const EXECUTOR_MEM: f64 = 32.0;

pub struct SerialLauncher {
    scheduler: Arc<EtcdScheduler>,
    signals: LaunchSignals,
}

impl SerialLauncher {
    pub fn new(scheduler: Arc<EtcdScheduler>, signals: LaunchSignals) -> Self {
        Self { scheduler, signals }
    }

    /// Consume launch and pause signals until shutdown. Pause has strict
    /// priority over launch, and every signal is followed by a chill-interval
    /// sleep so cluster state can settle between placements.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<()>) {
        let chill = self.scheduler.chill;
        loop {
            // Drain queued pause signals before considering a launch.
            while self.signals.pause_rx.try_recv().is_ok() {
                debug!(
                    chill_secs = chill.as_secs(),
                    "settling after pause signal"
                );
                tokio::time::sleep(chill).await;
            }

            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    info!("serial launcher shutting down");
                    return;
                }
                pause = self.signals.pause_rx.recv() => {
                    if pause.is_none() {
                        return;
                    }
                    debug!(
                        chill_secs = chill.as_secs(),
                        "settling after pause signal"
                    );
                    tokio::time::sleep(chill).await;
                }
                launch = self.signals.launch_rx.recv() => {
                    if launch.is_none() {
                        return;
                    }
                    self.launch_one().await;
                    debug!(
                        chill_secs = chill.as_secs(),
                        "settling after launch attempt"
                    );
                    tokio::time::sleep(chill).await;
                }
            }
        }
    }

    /// One placement attempt: prune, admit, select an offer, compose the
    /// member, and hand the task to the driver.
    pub(crate) async fn launch_one(&self) {
        let scheduler = &self.scheduler;

        // Deconfigure dead or unmanaged members before growing, otherwise a
        // failed launch can leave the ensemble overconfigured and stuck.
        if let Err(err) = scheduler.prune().await {
            error!(error = %err, "failed to remove stale members before launching");
            return;
        }

        if !scheduler.should_launch().await {
            info!("skipping launch attempt for now");
            return;
        }

        // Pop until we get an offer that is still usable; cached offers can
        // go stale while they wait.
        let offer = loop {
            let offer = scheduler.offer_cache.blocking_pop().await;
            if self.offer_still_valid(&offer).await {
                break offer;
            }
            scheduler.decline(&offer.id).await;
        };

        // The pop may have taken a long time; re-check admission.
        if !scheduler.should_launch().await {
            info!("skipping launch attempt for now");
            scheduler.decline(&offer.id).await;
            return;
        }

        let resources = parse_offer(&offer);
        let Some(port_begin) = resources.lowest_contiguous(PORTS_PER_TASK) else {
            warn!(
                offer_id = offer.id.get(),
                "offer has no contiguous port range wide enough, declining"
            );
            scheduler.decline(&offer.id).await;
            return;
        };
        let Ok(reseed_port) = u16::try_from(port_begin + 2) else {
            warn!(
                offer_id = offer.id.get(),
                port_begin, "offer ports are out of range, declining"
            );
            scheduler.decline(&offer.id).await;
            return;
        };
        let peer_port = port_begin as u16;
        let client_port = peer_port + 1;

        let task = {
            let mut model = scheduler.model.write().await;

            let kind = if model.running.is_empty() {
                ClusterKind::New
            } else {
                ClusterKind::Existing
            };

            model.highest_instance_id += 1;
            let member = Member {
                name: Member::name_for(model.highest_instance_id),
                host: offer.hostname.clone(),
                peer_port,
                client_port,
                reseed_port,
                kind,
                worker_id: offer.worker_id.get().to_string(),
            };

            // The task payload is the full proposed member list; the
            // executor derives its initial-cluster flags from it.
            let mut proposed: Vec<&Member> = vec![&member];
            proposed.extend(model.running.values());
            let data = match serde_json::to_vec(&proposed) {
                Ok(data) => data,
                Err(err) => {
                    error!(error = %err, "could not serialize the proposed member list");
                    drop(model);
                    scheduler.decline(&offer.id).await;
                    return;
                }
            };
            info!(
                member = member.name,
                payload = %String::from_utf8_lossy(&data),
                "prepared member for launch"
            );

            let task = TaskInfo {
                name: "etcd-server".to_string(),
                task_id: TaskId::new(member.to_task_id()),
                worker_id: offer.worker_id.clone(),
                data,
                resources: TaskResources {
                    cpus: scheduler.cpus_per_task,
                    mem: scheduler.mem_per_task,
                    disk: scheduler.disk_per_task,
                    port_begin,
                    port_end: port_begin + 2,
                },
                executor: ExecutorSpec {
                    id: member.name.clone(),
                    command: scheduler.executor_command.clone(),
                    uris: scheduler.executor_uris.clone(),
                    cpus: EXECUTOR_CPUS,
                    mem: EXECUTOR_MEM,
                },
            };

            model.pending.insert(member.name.clone(), member);
            task
        };
        // The driver call happens outside the model lock: the driver may
        // deliver the first status update synchronously.

        scheduler.stats.incr_launched_servers();
        info!(
            task_id = task.task_id.get(),
            offer_id = offer.id.get(),
            "launching etcd member"
        );
        if let Err(err) = scheduler
            .driver
            .launch_tasks(
                vec![offer.id.clone()],
                vec![task],
                OfferFilters {
                    refuse_seconds: 1.0,
                },
            )
            .await
        {
            error!(error = %err, "launch call failed");
        }
    }

    /// An offer can become undesirable while cached, e.g. when a member was
    /// placed on its worker in the meantime.
    async fn offer_still_valid(&self, offer: &Offer) -> bool {
        let running = self.scheduler.running_copy().await;
        for member in running.values() {
            if member.worker_id == offer.worker_id.get()
                && self.scheduler.single_instance_per_worker
            {
                info!(
                    offer_id = offer.id.get(),
                    worker_id = offer.worker_id.get(),
                    "skipping offer, worker already hosts a member"
                );
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::watch;

    use super::*;
    use crate::driver::{FrameworkHandler, TaskState};
    use crate::scheduler::SchedulerState;
    use crate::testing::{adequate_offer, running_status, terminal_status, TestCluster};

    #[tokio::test]
    async fn bootstrap_grows_one_member_at_a_time() {
        let mut cluster = TestCluster::new().await;
        cluster.make_mutable().await;
        let launcher = cluster.launcher();

        let mut names = vec![];
        for (offer_id, worker) in [("o1", "w1"), ("o2", "w2"), ("o3", "w3")] {
            cluster
                .scheduler
                .resource_offers(vec![adequate_offer(offer_id, worker)])
                .await;
            launcher.launch_one().await;

            let launches = cluster.driver.launches();
            let (offer_ids, tasks) = launches.last().unwrap().clone();
            assert_eq!(offer_ids[0].get(), offer_id);
            assert_eq!(tasks.len(), 1);

            let member = Member::parse(tasks[0].task_id.get()).unwrap();
            names.push(member.name.clone());

            // The member comes up: etcd registers it and the driver reports
            // RUNNING, which gates the next launch.
            cluster.etcd.add_configured(&member.name);
            cluster
                .scheduler
                .status_update(running_status(&member))
                .await;
        }

        assert_eq!(names, vec!["etcd-1", "etcd-2", "etcd-3"]);
        assert_eq!(cluster.driver.launches().len(), 3);
        assert_eq!(cluster.scheduler.running_copy().await.len(), 3);

        // First member bootstraps a new cluster, the rest join it.
        let launches = cluster.driver.launches();
        let kinds: Vec<ClusterKind> = launches
            .iter()
            .map(|(_, tasks)| Member::parse(tasks[0].task_id.get()).unwrap().kind)
            .collect();
        assert_eq!(
            kinds,
            vec![ClusterKind::New, ClusterKind::Existing, ClusterKind::Existing]
        );

        // The payload of the last launch proposes all three members.
        let proposed: Vec<Member> = serde_json::from_slice(&launches[2].1[0].data).unwrap();
        assert_eq!(proposed.len(), 3);
        assert_eq!(proposed[0].name, "etcd-3");
    }

    #[tokio::test]
    async fn launch_is_gated_on_the_pending_member() {
        let mut cluster = TestCluster::new().await;
        cluster.make_mutable().await;
        let launcher = cluster.launcher();

        cluster
            .scheduler
            .resource_offers(vec![adequate_offer("o1", "w1"), adequate_offer("o2", "w2")])
            .await;

        launcher.launch_one().await;
        assert_eq!(cluster.driver.launches().len(), 1);

        // No status update arrived, so the member is still pending and the
        // second attempt bails out in admission.
        launcher.launch_one().await;
        assert_eq!(cluster.driver.launches().len(), 1);
    }

    #[tokio::test]
    async fn launched_tasks_carry_the_reserved_port_range() {
        let mut cluster = TestCluster::new().await;
        cluster.make_mutable().await;
        let launcher = cluster.launcher();

        cluster
            .scheduler
            .resource_offers(vec![adequate_offer("o1", "w1")])
            .await;
        launcher.launch_one().await;

        let launches = cluster.driver.launches();
        let task = &launches[0].1[0];
        let member = Member::parse(task.task_id.get()).unwrap();
        assert_eq!(u64::from(member.peer_port), task.resources.port_begin);
        assert_eq!(u64::from(member.reseed_port), task.resources.port_end);
        assert_eq!(member.client_port, member.peer_port + 1);
        assert_eq!(task.resources.port_end - task.resources.port_begin + 1, 3);
        assert_eq!(task.name, "etcd-server");
        assert_eq!(task.executor.id, member.name);
    }

    #[tokio::test]
    async fn stale_offers_from_occupied_workers_are_declined_at_pop() {
        let mut cluster = TestCluster::new().await;
        cluster.make_mutable().await;
        let launcher = cluster.launcher();

        // Both offers were cached before the member on w1 existed.
        assert!(cluster.scheduler.offer_cache.push(adequate_offer("o1", "w1")));
        assert!(cluster.scheduler.offer_cache.push(adequate_offer("o2", "w2")));
        cluster.add_running("etcd-1", "w1").await;

        launcher.launch_one().await;

        let declines = cluster.driver.declines();
        assert_eq!(declines.len(), 1);
        assert_eq!(declines[0].0.get(), "o1");
        let launches = cluster.driver.launches();
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].0[0].get(), "o2");
    }

    #[tokio::test]
    async fn member_loss_is_pruned_before_the_replacement_launch() {
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
        assert_eq!(cluster.scheduler.running_copy().await.len(), 2);
        let launcher = cluster.launcher();

        cluster
            .scheduler
            .resource_offers(vec![adequate_offer("o4", "w4")])
            .await;
        launcher.launch_one().await;

        // etcd was deconfigured before the replacement was placed.
        assert_eq!(cluster.etcd.removed(), vec!["etcd-2".to_string()]);
        let launches = cluster.driver.launches();
        assert_eq!(launches.len(), 1);
        let replacement = Member::parse(launches[0].1[0].task_id.get()).unwrap();
        assert_eq!(replacement.kind, ClusterKind::Existing);
        assert_eq!(replacement.name, "etcd-5");
        assert_eq!(replacement.worker_id, "w4");
    }

    #[tokio::test]
    async fn no_launch_happens_while_immutable() {
        let mut cluster = TestCluster::new().await;
        let launcher = cluster.launcher();
        assert_eq!(cluster.scheduler.state().await, SchedulerState::Immutable);

        cluster.scheduler.offer_cache.push(adequate_offer("o1", "w1"));
        launcher.launch_one().await;

        assert!(cluster.driver.launches().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_serializes_launches_behind_pauses() {
        let mut cluster = TestCluster::new().await;
        cluster.make_mutable().await;
        cluster.scheduler.offer_cache.push(adequate_offer("o1", "w1"));

        // A pause is queued ahead of the launch; the launcher must settle
        // for a full chill interval before placing anything.
        cluster.scheduler.pump_the_brakes();
        cluster.scheduler.queue_launch_attempt();

        let started = tokio::time::Instant::now();
        let launcher = cluster.launcher();
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let worker = tokio::spawn(launcher.run(shutdown_rx));

        loop {
            if cluster.driver.launches().len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(started.elapsed() >= cluster.scheduler.chill);

        shutdown_tx.send(()).unwrap();
        worker.await.unwrap();
    }
}
