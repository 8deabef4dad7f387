use std::fmt::{self, Display};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

/// How a member joins the ensemble: the very first member bootstraps a new
/// cluster, every later one joins the existing configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClusterKind {
    New,
    Existing,
}

impl Display for ClusterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterKind::New => write!(f, "new"),
            ClusterKind::Existing => write!(f, "existing"),
        }
    }
}

impl ClusterKind {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "new" => Ok(ClusterKind::New),
            "existing" => Ok(ClusterKind::Existing),
            other => Err(anyhow!("unknown cluster kind: {}", other)),
        }
    }
}

/// One etcd process in the ensemble, placed or pending.
///
/// The member's task id is its full serialization, so a task id observed
/// during reconciliation is enough to rebuild the member without any other
/// state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Member {
    pub name: String,
    pub host: String,
    pub peer_port: u16,
    pub client_port: u16,
    pub reseed_port: u16,
    pub kind: ClusterKind,
    pub worker_id: String,
}

impl Member {
    /// The member name for a given instance id.
    pub fn name_for(instance_id: i64) -> String {
        format!("etcd-{}", instance_id)
    }

    /// Numeric suffix of the member name, e.g. 42 for `etcd-42`.
    pub fn instance_id(&self) -> Option<i64> {
        self.name.strip_prefix("etcd-")?.parse().ok()
    }

    /// Serialize into the opaque task id handed to the resource manager.
    pub fn to_task_id(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.name,
            self.host,
            self.peer_port,
            self.client_port,
            self.reseed_port,
            self.kind,
            self.worker_id,
        )
    }

    /// Rebuild a member from a task id produced by [`Member::to_task_id`].
    pub fn parse(task_id: &str) -> Result<Member> {
        let fields: Vec<&str> = task_id.split('|').collect();
        if fields.len() != 7 {
            return Err(anyhow!(
                "task id does not have 7 '|'-separated fields: {}",
                task_id
            ));
        }
        Ok(Member {
            name: fields[0].to_string(),
            host: fields[1].to_string(),
            peer_port: fields[2]
                .parse()
                .with_context(|| format!("bad peer port in task id {}", task_id))?,
            client_port: fields[3]
                .parse()
                .with_context(|| format!("bad client port in task id {}", task_id))?,
            reseed_port: fields[4]
                .parse()
                .with_context(|| format!("bad reseed port in task id {}", task_id))?,
            kind: ClusterKind::parse(fields[5])?,
            worker_id: fields[6].to_string(),
        })
    }

    /// Base URL of the member's etcd client port.
    pub fn client_url(&self) -> String {
        format!("http://{}:{}", self.host, self.client_port)
    }

    /// URL a peer uses to reach this member's Raft transport.
    pub fn peer_url(&self) -> String {
        format!("http://{}:{}", self.host, self.peer_port)
    }
}

impl Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_task_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member() -> Member {
        Member {
            name: "etcd-17".to_string(),
            host: "10.4.0.9".to_string(),
            peer_port: 31000,
            client_port: 31001,
            reseed_port: 31002,
            kind: ClusterKind::Existing,
            worker_id: "worker-3".to_string(),
        }
    }

    #[test]
    fn task_id_round_trips() {
        let m = member();
        let parsed = Member::parse(&m.to_task_id()).unwrap();
        assert_eq!(parsed, m);
    }

    #[test]
    fn first_member_round_trips() {
        let m = Member {
            name: "etcd-1".to_string(),
            kind: ClusterKind::New,
            ..member()
        };
        assert_eq!(Member::parse(&m.to_task_id()).unwrap(), m);
    }

    #[test]
    fn malformed_task_ids_are_rejected() {
        assert!(Member::parse("etcd-1|host|31000").is_err());
        assert!(Member::parse("etcd-1|host|x|31001|31002|new|w1").is_err());
        assert!(Member::parse("etcd-1|host|31000|31001|31002|banana|w1").is_err());
        assert!(Member::parse("").is_err());
    }

    #[test]
    fn instance_id_is_the_numeric_suffix() {
        assert_eq!(member().instance_id(), Some(17));
        let odd = Member {
            name: "not-etcd".to_string(),
            ..member()
        };
        assert_eq!(odd.instance_id(), None);
    }

    #[test]
    fn payload_serialization_is_stable() {
        let json = serde_json::to_string(&member()).unwrap();
        let back: Member = serde_json::from_str(&json).unwrap();
        assert_eq!(back, member());
        assert!(json.contains("\"kind\":\"existing\""));
    }
}
