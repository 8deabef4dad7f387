use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use figment::{
    providers::{Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Resource manager master, e.g. `http://master.mesos:5050`.
    pub master: String,
    /// Distinguishes this ensemble's framework from other etcd frameworks on
    /// the same master.
    pub cluster_name: String,
    /// Admin HTTP listen address.
    pub listen_addr: String,
    pub desired_instance_count: usize,
    /// Settling delay between placements, in seconds.
    pub chill_seconds: u64,
    /// How long the ensemble may stay unhealthy before a reseed, in seconds.
    pub reseed_timeout_seconds: u64,
    pub auto_reseed: bool,
    pub single_instance_per_worker: bool,
    pub cpus_per_task: f64,
    pub mem_per_task: f64,
    pub disk_per_task: f64,
    /// Command the executor runs on the worker.
    pub executor_command: String,
    /// Artifact URIs fetched into the task sandbox.
    pub executor_uris: Vec<String>,
    /// Root of the coordination store used to persist the framework id.
    /// Persistence is disabled when unset.
    pub coordination_path: Option<PathBuf>,
    /// How long the master keeps the framework alive across scheduler
    /// restarts, in seconds.
    pub failover_timeout_seconds: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            master: "http://127.0.0.1:5050".to_string(),
            cluster_name: "default".to_string(),
            listen_addr: "0.0.0.0:8181".to_string(),
            desired_instance_count: 5,
            chill_seconds: 10,
            reseed_timeout_seconds: 240,
            auto_reseed: true,
            single_instance_per_worker: true,
            cpus_per_task: 1.0,
            mem_per_task: 256.0,
            disk_per_task: 1024.0,
            executor_command: "./etcd-executor -log_dir=./".to_string(),
            executor_uris: vec![],
            coordination_path: None,
            failover_timeout_seconds: 604800.0,
        }
    }
}

impl SchedulerConfig {
    pub fn from_path(path: &str) -> Result<SchedulerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        let config: SchedulerConfig =
            Figment::from(Serialized::defaults(SchedulerConfig::default()))
                .merge(Yaml::string(&config_str))
                .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            anyhow::bail!("invalid listen address: {}", self.listen_addr);
        }
        if self.master.is_empty() {
            anyhow::bail!("master address must be set");
        }
        if self.desired_instance_count == 0 {
            anyhow::bail!("desired_instance_count must be at least 1");
        }
        if self.chill_seconds == 0 {
            anyhow::bail!("chill_seconds must be at least 1");
        }
        Ok(())
    }

    pub fn chill(&self) -> Duration {
        Duration::from_secs(self.chill_seconds)
    }

    pub fn reseed_timeout(&self) -> Duration {
        Duration::from_secs(self.reseed_timeout_seconds)
    }

    /// Framework name registered with the master; also how the reconciler
    /// finds this cluster's tasks in the master state.
    pub fn framework_name(&self) -> String {
        format!("etcd-{}", self.cluster_name)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_validate() {
        SchedulerConfig::default().validate().unwrap();
    }

    #[test]
    fn yaml_overrides_merge_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "cluster_name: prod\ndesired_instance_count: 3\nauto_reseed: false"
        )
        .unwrap();
        let config = SchedulerConfig::from_path(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.cluster_name, "prod");
        assert_eq!(config.desired_instance_count, 3);
        assert!(!config.auto_reseed);
        // Untouched fields keep their defaults.
        assert_eq!(config.chill_seconds, 10);
        assert_eq!(config.framework_name(), "etcd-prod");
    }

    #[test]
    fn bad_listen_addr_is_rejected() {
        let config = SchedulerConfig {
            listen_addr: "not-an-addr".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_desired_instances_is_rejected() {
        let config = SchedulerConfig {
            desired_instance_count: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
