//! Last-resort recovery from sustained livelock.
//!
//! The most-advanced surviving member is restarted with force-new-cluster
//! and becomes the seed of a fresh ensemble; every other survivor is killed.
//! Writes beyond the seed's Raft index are intentionally sacrificed.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::data_model::Member;
use crate::retry::{poll_until_deadline, Backoff};
use crate::scheduler::{EtcdScheduler, SchedulerState};

impl EtcdScheduler {
    /// Rebuild the ensemble from the best surviving member.
    ///
    /// The compare-and-set on the reseeding flag makes this single-shot: it
    /// both prevents concurrent reseeds and tells the admission gate to bail
    /// out while one is underway. The scheduler additionally goes immutable
    /// so no launch can race against the kills below and re-add a zombie.
    pub async fn reseed_cluster(self: Arc<Self>) {
        if self
            .reseeding
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("reseed already underway, ignoring trigger");
            return;
        }
        self.stats.incr_cluster_reseeds();

        let running = self.running_copy().await;
        let candidates = self.etcd.rank_reseed_candidates(&running).await;
        if candidates.is_empty() {
            error!("no reseed candidates reachable, no recovery possible");
            if let Err(err) = self.driver.abort().await {
                error!(error = %err, "failed to abort the driver");
            }
            self.reseeding.store(false, Ordering::SeqCst);
            return;
        }

        self.set_state(SchedulerState::Immutable).await;
        info!(?candidates, "candidates for reseed");

        let mut killable: Vec<String> = vec![];
        let mut new_seed: Option<String> = None;
        for candidate in &candidates {
            if new_seed.is_some() {
                warn!(
                    member = candidate.name,
                    "marking survivor from the previous cluster as inferior"
                );
                killable.push(candidate.name.clone());
                continue;
            }
            warn!(
                member = candidate.name,
                raft_index = candidate.raft_index,
                "attempting to reseed the cluster from this candidate"
            );
            if self.reseed_member(&running, &candidate.name).await {
                new_seed = Some(candidate.name.clone());
            } else {
                error!(
                    member = candidate.name,
                    "reseed attempt failed, trying the next-best candidate"
                );
                killable.push(candidate.name.clone());
            }
        }

        if let Some(seed) = &new_seed {
            warn!(seed, "ensemble reseeded, killing the remaining survivors");
            let tasks = self.model.read().await.tasks.clone();
            for name in &killable {
                match tasks.get(name) {
                    Some(task_id) => {
                        if let Err(err) = self.driver.kill_task(task_id).await {
                            error!(member = name, error = %err, "failed to kill stale member");
                        }
                    }
                    None => warn!(member = name, "no task recorded for stale member"),
                }
            }
        }

        self.reseeding.store(false, Ordering::SeqCst);
        self.set_state(SchedulerState::Mutable).await;
    }

    /// Restart one member with force-new-cluster and wait for it to come
    /// back healthy, up to the reseed timeout.
    async fn reseed_member(&self, running: &HashMap<String, Member>, name: &str) -> bool {
        let Some(member) = running.get(name) else {
            warn!(member = name, "reseed candidate is no longer running");
            return false;
        };
        if let Err(err) = self.etcd.trigger_reseed(member).await {
            error!(member = name, error = %err, "reseed trigger failed");
        }

        let alone: HashMap<String, Member> = [(name.to_string(), member.clone())].into();
        let healthy = poll_until_deadline(
            self.reseed_timeout,
            Backoff::standard(),
            "reseeded member health",
            || async { self.etcd.health_check(&alone).await },
        )
        .await;
        match healthy {
            Ok(()) => {
                warn!(member = name, "picked as the new seed");
                true
            }
            Err(err) => {
                warn!(member = name, error = %err, "candidate did not become healthy in time");
                false
            }
        }
    }
}
