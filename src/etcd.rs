//! Client for the etcd admin HTTP API (v2 members surface) plus the
//! executor-side reseed trigger.
//!
//! Every operation is bounded to 5 seconds per request and retried with the
//! standard 1s → 8s backoff, 5 attempts total, rotating across the members it
//! was given.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::data_model::Member;
use crate::retry::{retry_with_backoff, Backoff};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const RPC_ATTEMPTS: u32 = 5;

/// A surviving member ranked for reseed, highest Raft index first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReseedCandidate {
    pub name: String,
    pub raft_index: u64,
}

/// Admin surface of a running ensemble, mockable for tests.
#[async_trait]
pub trait EtcdApi: Send + Sync {
    /// Member name → etcd-assigned member id, per the ensemble's own view.
    async fn member_list(&self, running: &HashMap<String, Member>)
        -> Result<HashMap<String, String>>;

    /// Reconfigure the ensemble to accept `new_member`. Requires the running
    /// members to pass a health check first; fails without mutation
    /// otherwise.
    async fn add_member(
        &self,
        running: &HashMap<String, Member>,
        new_member: &Member,
    ) -> Result<()>;

    /// Remove `name` from the ensemble configuration, asking any member
    /// other than the target.
    async fn remove_member(&self, running: &HashMap<String, Member>, name: &str) -> Result<()>;

    /// Ok iff a majority of the given members report healthy. Trivially
    /// healthy when `running` is empty.
    async fn health_check(&self, running: &HashMap<String, Member>) -> Result<()>;

    /// Ask the member's co-located executor to restart etcd with
    /// `--force-new-cluster`.
    async fn trigger_reseed(&self, member: &Member) -> Result<()>;

    /// Reachable members ordered by Raft index descending, ties broken by
    /// name.
    async fn rank_reseed_candidates(&self, running: &HashMap<String, Member>)
        -> Vec<ReseedCandidate>;
}

#[derive(Debug, Deserialize)]
struct MemberListResponse {
    members: Vec<EtcdMember>,
}

#[derive(Debug, Deserialize)]
struct EtcdMember {
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    health: String,
}

#[derive(Debug, Deserialize)]
struct RemoveResponse {
    #[serde(default)]
    message: String,
}

pub struct EtcdClient {
    http: reqwest::Client,
}

impl EtcdClient {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("building etcd http client")?;
        Ok(Self { http })
    }

    async fn member_list_once(
        &self,
        running: &HashMap<String, Member>,
    ) -> Result<HashMap<String, String>> {
        let mut last_err = anyhow!("no members queried");
        for member in running.values() {
            let url = format!("{}/v2/members", member.client_url());
            let list: MemberListResponse = match self.get_json(&url).await {
                Ok(list) => list,
                Err(err) => {
                    debug!(member = member.name, error = %err, "member list query failed");
                    last_err = err;
                    continue;
                }
            };
            if list.members.is_empty() {
                last_err = anyhow!("{} returned an empty member list", member.name);
                continue;
            }
            return Ok(list
                .members
                .into_iter()
                .map(|m| (m.name, m.id))
                .collect());
        }
        Err(last_err)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let resp = self.http.get(url).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("GET {} returned {}", url, resp.status());
        }
        Ok(resp.json().await?)
    }

    async fn raft_index(&self, member: &Member) -> Result<u64> {
        let url = format!("{}/v2/keys/", member.client_url());
        let resp = self.http.get(&url).send().await?;
        let index = resp
            .headers()
            .get("X-Raft-Index")
            .ok_or_else(|| anyhow!("{} did not report a raft index", member.name))?
            .to_str()?
            .parse::<u64>()
            .with_context(|| format!("unparseable raft index from {}", member.name))?;
        Ok(index)
    }
}

/// Members needed for a majority of `total`.
pub(crate) fn quorum(total: usize) -> usize {
    total / 2 + 1
}

/// Sort candidates by Raft index descending; ties break by name so the order
/// is deterministic.
pub(crate) fn order_candidates(mut candidates: Vec<ReseedCandidate>) -> Vec<ReseedCandidate> {
    candidates.sort_by(|a, b| {
        b.raft_index
            .cmp(&a.raft_index)
            .then_with(|| a.name.cmp(&b.name))
    });
    candidates
}

#[async_trait]
impl EtcdApi for EtcdClient {
    async fn member_list(
        &self,
        running: &HashMap<String, Member>,
    ) -> Result<HashMap<String, String>> {
        if running.is_empty() {
            debug!("no running members, skipping member list query");
            return Ok(HashMap::new());
        }
        retry_with_backoff(RPC_ATTEMPTS, Backoff::standard(), "etcd member list", || {
            self.member_list_once(running)
        })
        .await
    }

    async fn add_member(
        &self,
        running: &HashMap<String, Member>,
        new_member: &Member,
    ) -> Result<()> {
        if running.is_empty() {
            info!("no running members to reconfigure, skipping add");
            return Ok(());
        }
        self.health_check(running)
            .await
            .context("refusing to add a member to an unhealthy ensemble")?;

        let body = serde_json::json!({ "peerURLs": [new_member.peer_url()] });
        retry_with_backoff(RPC_ATTEMPTS, Backoff::standard(), "etcd add member", || {
            let body = body.clone();
            async move {
                let mut last_err = anyhow!("no members queried");
                for member in running.values() {
                    let url = format!("{}/v2/members", member.client_url());
                    match self.http.post(&url).json(&body).send().await {
                        Ok(resp) if resp.status().is_success() => {
                            info!(
                                member = new_member.name,
                                peer_url = new_member.peer_url(),
                                "added member to ensemble configuration"
                            );
                            return Ok(());
                        }
                        Ok(resp) => {
                            last_err = anyhow!("POST {} returned {}", url, resp.status());
                        }
                        Err(err) => last_err = err.into(),
                    }
                }
                Err(last_err)
            }
        })
        .await
    }

    async fn remove_member(&self, running: &HashMap<String, Member>, name: &str) -> Result<()> {
        info!(member = name, "removing member from ensemble configuration");
        let ids = self.member_list(running).await?;
        let id = ids
            .get(name)
            .ok_or_else(|| anyhow!("{} is not in the etcd member list", name))?
            .clone();

        retry_with_backoff(RPC_ATTEMPTS, Backoff::standard(), "etcd remove member", || {
            let id = id.clone();
            async move {
                let mut last_err = anyhow!("no members queried");
                for member in running.values() {
                    if member.name == name {
                        continue;
                    }
                    let url = format!("{}/v2/members/{}", member.client_url(), id);
                    let resp = match self.http.delete(&url).send().await {
                        Ok(resp) => resp,
                        Err(err) => {
                            last_err = err.into();
                            continue;
                        }
                    };
                    let body = resp.text().await.unwrap_or_default();
                    let parsed: RemoveResponse =
                        serde_json::from_str(&body).unwrap_or(RemoveResponse {
                            message: body.clone(),
                        });
                    if parsed.message.starts_with("Member permanently removed") {
                        info!(member = name, "member removed");
                        return Ok(());
                    }
                    last_err = anyhow!("unexpected removal response: {}", body);
                }
                Err(last_err)
            }
        })
        .await
    }

    async fn health_check(&self, running: &HashMap<String, Member>) -> Result<()> {
        if running.is_empty() {
            return Ok(());
        }
        let mut healthy = 0usize;
        for member in running.values() {
            let url = format!("{}/health", member.client_url());
            match self.get_json::<HealthResponse>(&url).await {
                Ok(h) if h.health == "true" => healthy += 1,
                Ok(h) => debug!(member = member.name, health = h.health, "member unhealthy"),
                Err(err) => debug!(member = member.name, error = %err, "health probe failed"),
            }
        }
        let needed = quorum(running.len());
        if healthy < needed {
            anyhow::bail!(
                "{} of {} members healthy, quorum needs {}",
                healthy,
                running.len(),
                needed
            );
        }
        Ok(())
    }

    async fn trigger_reseed(&self, member: &Member) -> Result<()> {
        let url = format!("http://{}:{}/reseed", member.host, member.reseed_port);
        warn!(member = member.name, url, "triggering force-new-cluster restart");
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("reseed trigger on {} returned {}", member.name, resp.status());
        }
        Ok(())
    }

    async fn rank_reseed_candidates(
        &self,
        running: &HashMap<String, Member>,
    ) -> Vec<ReseedCandidate> {
        let mut candidates = Vec::with_capacity(running.len());
        for member in running.values() {
            match self.raft_index(member).await {
                Ok(raft_index) => candidates.push(ReseedCandidate {
                    name: member.name.clone(),
                    raft_index,
                }),
                Err(err) => {
                    warn!(member = member.name, error = %err, "excluding unreachable reseed candidate");
                }
            }
        }
        order_candidates(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_model::ClusterKind;

    fn unreachable_member(name: &str) -> Member {
        Member {
            name: name.to_string(),
            host: "127.0.0.1".to_string(),
            // Nothing listens here, so every probe fails fast.
            peer_port: 1,
            client_port: 1,
            reseed_port: 1,
            kind: ClusterKind::Existing,
            worker_id: "w1".to_string(),
        }
    }

    #[tokio::test]
    async fn member_list_is_empty_without_running_members() {
        let client = EtcdClient::new().unwrap();
        let members = client.member_list(&HashMap::new()).await.unwrap();
        assert!(members.is_empty());
    }

    #[tokio::test]
    async fn add_member_skips_an_empty_ensemble() {
        let client = EtcdClient::new().unwrap();
        client
            .add_member(&HashMap::new(), &unreachable_member("etcd-9"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn add_member_refuses_an_unhealthy_ensemble() {
        let client = EtcdClient::new().unwrap();
        let running =
            HashMap::from([("etcd-1".to_string(), unreachable_member("etcd-1"))]);
        let err = client
            .add_member(&running, &unreachable_member("etcd-9"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unhealthy"));
    }

    #[tokio::test]
    async fn health_check_rejects_a_majority_unreachable_ensemble() {
        let client = EtcdClient::new().unwrap();
        let running =
            HashMap::from([("etcd-1".to_string(), unreachable_member("etcd-1"))]);
        assert!(client.health_check(&running).await.is_err());
        // An empty ensemble is trivially healthy.
        assert!(client.health_check(&HashMap::new()).await.is_ok());
    }

    #[tokio::test]
    async fn unreachable_candidates_are_excluded_from_ranking() {
        let client = EtcdClient::new().unwrap();
        let running =
            HashMap::from([("etcd-1".to_string(), unreachable_member("etcd-1"))]);
        assert!(client.rank_reseed_candidates(&running).await.is_empty());
    }

    #[test]
    fn quorum_is_a_strict_majority() {
        assert_eq!(quorum(1), 1);
        assert_eq!(quorum(2), 2);
        assert_eq!(quorum(3), 2);
        assert_eq!(quorum(4), 3);
        assert_eq!(quorum(5), 3);
    }

    #[test]
    fn candidates_order_by_raft_index_then_name() {
        let ordered = order_candidates(vec![
            ReseedCandidate {
                name: "etcd-3".to_string(),
                raft_index: 10,
            },
            ReseedCandidate {
                name: "etcd-1".to_string(),
                raft_index: 42,
            },
            ReseedCandidate {
                name: "etcd-5".to_string(),
                raft_index: 42,
            },
        ]);
        let names: Vec<&str> = ordered.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["etcd-1", "etcd-5", "etcd-3"]);
    }
}
