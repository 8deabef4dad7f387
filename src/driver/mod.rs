//! Abstract contract between the scheduler core and the resource manager.
//!
//! The core consumes a [`SchedulerDriver`] for outbound calls and exposes a
//! [`FrameworkHandler`] for the inbound event stream. The production binding
//! for both lives in [`mesos`].

pub mod mesos;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct OfferId(String);

impl OfferId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FrameworkId(String);

impl FrameworkId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterInfo {
    pub hostname: String,
    pub port: u16,
}

/// Task states reported by the resource manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Staging,
    Starting,
    Running,
    Finished,
    Failed,
    Killed,
    Lost,
    Error,
}

impl TaskState {
    /// Terminal states free the task's resources; the member is gone.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Lost
                | TaskState::Finished
                | TaskState::Killed
                | TaskState::Error
                | TaskState::Failed
        )
    }

    pub fn parse(s: &str) -> Option<TaskState> {
        match s {
            "TASK_STAGING" => Some(TaskState::Staging),
            "TASK_STARTING" => Some(TaskState::Starting),
            "TASK_RUNNING" => Some(TaskState::Running),
            "TASK_FINISHED" => Some(TaskState::Finished),
            "TASK_FAILED" => Some(TaskState::Failed),
            "TASK_KILLED" => Some(TaskState::Killed),
            "TASK_LOST" => Some(TaskState::Lost),
            "TASK_ERROR" => Some(TaskState::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub state: TaskState,
    pub worker_id: WorkerId,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortRange {
    pub begin: u64,
    pub end: u64,
}

impl PortRange {
    pub fn span(&self) -> u64 {
        self.end.saturating_sub(self.begin) + 1
    }
}

/// One typed resource inside an offer.
#[derive(Debug, Clone)]
pub enum Resource {
    Cpus(f64),
    Mem(f64),
    Disk(f64),
    Ports(Vec<PortRange>),
}

/// A time-limited promise of resources on one worker.
#[derive(Debug, Clone)]
pub struct Offer {
    pub id: OfferId,
    pub worker_id: WorkerId,
    pub hostname: String,
    pub resources: Vec<Resource>,
}

/// Totals folded out of an offer's resource list.
#[derive(Debug, Clone, Default)]
pub struct OfferResources {
    pub cpus: f64,
    pub mem: f64,
    pub disk: f64,
    pub ports: Vec<PortRange>,
}

impl OfferResources {
    pub fn total_ports(&self) -> u64 {
        self.ports.iter().map(|r| r.span()).sum()
    }

    /// Lowest begin among port ranges wide enough to hold `span` consecutive
    /// ports, or `None` when no single range is wide enough.
    pub fn lowest_contiguous(&self, span: u64) -> Option<u64> {
        self.ports
            .iter()
            .filter(|r| r.span() >= span)
            .map(|r| r.begin)
            .min()
    }
}

pub fn parse_offer(offer: &Offer) -> OfferResources {
    let mut parsed = OfferResources::default();
    for resource in &offer.resources {
        match resource {
            Resource::Cpus(v) => parsed.cpus += v,
            Resource::Mem(v) => parsed.mem += v,
            Resource::Disk(v) => parsed.disk += v,
            Resource::Ports(ranges) => parsed.ports.extend(ranges.iter().copied()),
        }
    }
    parsed
}

/// Filters attached to declines and launches.
#[derive(Debug, Clone, Copy)]
pub struct OfferFilters {
    pub refuse_seconds: f64,
}

/// Scalar resources plus the port range reserved for one task.
#[derive(Debug, Clone)]
pub struct TaskResources {
    pub cpus: f64,
    pub mem: f64,
    pub disk: f64,
    pub port_begin: u64,
    pub port_end: u64,
}

/// The executor process launched alongside each task.
#[derive(Debug, Clone)]
pub struct ExecutorSpec {
    pub id: String,
    pub command: String,
    pub uris: Vec<String>,
    pub cpus: f64,
    pub mem: f64,
}

/// Everything the resource manager needs to start one etcd member.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub name: String,
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    /// JSON array of the proposed full member list; the executor reads this
    /// to derive `--initial-cluster` and `--initial-cluster-state`.
    pub data: Vec<u8>,
    pub resources: TaskResources,
    pub executor: ExecutorSpec,
}

/// Outbound calls the core issues against the resource manager.
#[async_trait]
pub trait SchedulerDriver: Send + Sync {
    async fn decline_offer(&self, offer_id: &OfferId, filters: OfferFilters) -> Result<()>;

    async fn launch_tasks(
        &self,
        offer_ids: Vec<OfferId>,
        tasks: Vec<TaskInfo>,
        filters: OfferFilters,
    ) -> Result<()>;

    async fn kill_task(&self, task_id: &TaskId) -> Result<()>;

    async fn reconcile_tasks(&self, statuses: Vec<TaskStatus>) -> Result<()>;

    /// Stop driving the framework without tearing it down. Irrecoverable.
    async fn abort(&self) -> Result<()>;
}

/// Inbound callback surface; the driver event loop invokes these and must
/// never be blocked by them.
#[async_trait]
pub trait FrameworkHandler: Send + Sync {
    async fn registered(&self, framework_id: FrameworkId, master: MasterInfo);
    async fn reregistered(&self, master: MasterInfo);
    async fn disconnected(&self);
    async fn resource_offers(&self, offers: Vec<Offer>);
    async fn offer_rescinded(&self, offer_id: OfferId);
    async fn status_update(&self, status: TaskStatus);
    async fn framework_message(&self, executor_id: String, worker_id: WorkerId, message: String);
    async fn worker_lost(&self, worker_id: WorkerId);
    async fn executor_lost(&self, executor_id: String, worker_id: WorkerId, status: i32);
    async fn error(&self, message: String);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer_with_ports(ranges: Vec<PortRange>) -> Offer {
        Offer {
            id: OfferId::new("o1"),
            worker_id: WorkerId::new("w1"),
            hostname: "host-a".to_string(),
            resources: vec![
                Resource::Cpus(2.0),
                Resource::Cpus(0.5),
                Resource::Mem(1024.0),
                Resource::Disk(4096.0),
                Resource::Ports(ranges),
            ],
        }
    }

    #[test]
    fn parse_offer_sums_scalars_and_collects_ranges() {
        let offer = offer_with_ports(vec![
            PortRange {
                begin: 31000,
                end: 31001,
            },
            PortRange {
                begin: 32000,
                end: 32009,
            },
        ]);
        let parsed = parse_offer(&offer);
        assert_eq!(parsed.cpus, 2.5);
        assert_eq!(parsed.mem, 1024.0);
        assert_eq!(parsed.disk, 4096.0);
        assert_eq!(parsed.total_ports(), 12);
    }

    #[test]
    fn lowest_contiguous_skips_narrow_ranges() {
        let parsed = parse_offer(&offer_with_ports(vec![
            PortRange {
                begin: 31000,
                end: 31001,
            },
            PortRange {
                begin: 32000,
                end: 32009,
            },
        ]));
        // The 31000 range only holds two ports, so the wider range wins.
        assert_eq!(parsed.lowest_contiguous(3), Some(32000));
    }

    #[test]
    fn lowest_contiguous_prefers_the_lowest_wide_range() {
        let parsed = parse_offer(&offer_with_ports(vec![
            PortRange {
                begin: 40000,
                end: 40010,
            },
            PortRange {
                begin: 31000,
                end: 31002,
            },
        ]));
        assert_eq!(parsed.lowest_contiguous(3), Some(31000));
    }

    #[test]
    fn no_range_wide_enough() {
        let parsed = parse_offer(&offer_with_ports(vec![PortRange {
            begin: 31000,
            end: 31001,
        }]));
        assert_eq!(parsed.lowest_contiguous(3), None);
    }

    #[test]
    fn terminal_states() {
        for s in [
            TaskState::Lost,
            TaskState::Finished,
            TaskState::Killed,
            TaskState::Error,
            TaskState::Failed,
        ] {
            assert!(s.is_terminal());
        }
        assert!(!TaskState::Running.is_terminal());
        assert!(!TaskState::Staging.is_terminal());
    }
}
