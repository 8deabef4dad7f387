//! Mesos v1 scheduler HTTP API binding.
//!
//! A single `POST /api/v1/scheduler` SUBSCRIBE call yields a long-lived
//! RecordIO stream of events; every other interaction is a fire-and-forget
//! call correlated through the `Mesos-Stream-Id` header. The event loop
//! translates wire events into [`FrameworkHandler`] callbacks and
//! acknowledges status updates implicitly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::driver::{
    FrameworkHandler,
    FrameworkId,
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
use crate::retry::Backoff;

const SCHEDULER_PATH: &str = "/api/v1/scheduler";
const CALL_TIMEOUT: Duration = Duration::from_secs(5);

struct DriverState {
    framework_id: Option<FrameworkId>,
    stream_id: Option<String>,
}

pub struct MesosDriver {
    http: reqwest::Client,
    endpoint: String,
    master_info: MasterInfo,
    framework_name: String,
    failover_timeout: f64,
    state: RwLock<DriverState>,
    aborted: AtomicBool,
}

impl MesosDriver {
    /// `previous_framework_id` is the identity loaded from the coordination
    /// store, if any; subscribing with it resumes the framework instead of
    /// registering a new one.
    pub fn new(config: &SchedulerConfig, previous_framework_id: Option<FrameworkId>) -> Result<Self> {
        // No client-wide timeout: the subscribe stream is long-lived. Calls
        // set their own per-request timeout.
        let http = reqwest::Client::builder()
            .build()
            .context("building mesos http client")?;
        let master = config.master.trim_end_matches('/');
        Ok(Self {
            http,
            endpoint: format!("{}{}", master, SCHEDULER_PATH),
            master_info: master_info_from_url(master)?,
            framework_name: config.framework_name(),
            failover_timeout: config.failover_timeout_seconds,
            state: RwLock::new(DriverState {
                framework_id: previous_framework_id,
                stream_id: None,
            }),
            aborted: AtomicBool::new(false),
        })
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    async fn call(&self, kind: &str, mut body: serde_json::Value) -> Result<()> {
        if self.is_aborted() {
            anyhow::bail!("driver is aborted");
        }
        let (framework_id, stream_id) = {
            let state = self.state.read().await;
            (state.framework_id.clone(), state.stream_id.clone())
        };
        let framework_id = framework_id.ok_or_else(|| anyhow!("not subscribed yet"))?;
        body["type"] = json!(kind);
        body["framework_id"] = json!({ "value": framework_id.get() });

        let mut request = self
            .http
            .post(&self.endpoint)
            .timeout(CALL_TIMEOUT)
            .json(&body);
        if let Some(stream_id) = stream_id {
            request = request.header("Mesos-Stream-Id", stream_id);
        }
        let resp = request.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("{} call failed: {} {}", kind, status, text);
        }
        Ok(())
    }

    /// Subscribe and pump events until the stream ends or the driver is
    /// aborted. Returns Ok when the master closed the stream (the caller
    /// resubscribes) and Err on fatal conditions.
    async fn subscribe_and_pump(&self, handler: &Arc<dyn FrameworkHandler>) -> Result<()> {
        let known_framework_id = self.state.read().await.framework_id.clone();

        let mut framework_info = json!({
            "user": "root",
            "name": self.framework_name,
            "failover_timeout": self.failover_timeout,
            "checkpoint": true,
        });
        let mut subscribe = json!({ "type": "SUBSCRIBE" });
        if let Some(id) = &known_framework_id {
            framework_info["id"] = json!({ "value": id.get() });
            subscribe["framework_id"] = json!({ "value": id.get() });
        }
        subscribe["subscribe"] = json!({ "framework_info": framework_info });

        info!(endpoint = self.endpoint, "subscribing to the master event stream");
        let resp = self
            .http
            .post(&self.endpoint)
            .json(&subscribe)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("subscribe failed: {} {}", status, text);
        }
        let stream_id = resp
            .headers()
            .get("Mesos-Stream-Id")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        self.state.write().await.stream_id = stream_id;

        let mut stream = resp.bytes_stream();
        let mut buf = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            if self.is_aborted() {
                anyhow::bail!("driver is aborted");
            }
            buf.extend_from_slice(&chunk.context("event stream read failed")?);
            while let Some(record) = split_record(&mut buf)? {
                self.dispatch_event(&record, handler, &known_framework_id)
                    .await?;
            }
        }
        Ok(())
    }

    async fn dispatch_event(
        &self,
        record: &[u8],
        handler: &Arc<dyn FrameworkHandler>,
        known_framework_id: &Option<FrameworkId>,
    ) -> Result<()> {
        let event: WireEvent =
            serde_json::from_slice(record).context("undecodable event record")?;
        debug!(kind = event.kind, "event received");
        match event.kind.as_str() {
            "SUBSCRIBED" => {
                let subscribed = event
                    .subscribed
                    .ok_or_else(|| anyhow!("SUBSCRIBED event without a body"))?;
                let framework_id = FrameworkId::new(subscribed.framework_id.value);
                let resumed = known_framework_id.as_ref() == Some(&framework_id);
                self.state.write().await.framework_id = Some(framework_id.clone());
                if resumed {
                    handler.reregistered(self.master_info.clone()).await;
                } else {
                    handler
                        .registered(framework_id, self.master_info.clone())
                        .await;
                }
            }
            "OFFERS" => {
                let offers = event
                    .offers
                    .map(|o| o.offers.into_iter().map(Offer::from).collect())
                    .unwrap_or_default();
                handler.resource_offers(offers).await;
            }
            "RESCIND" => {
                if let Some(rescind) = event.rescind {
                    handler
                        .offer_rescinded(OfferId::new(rescind.offer_id.value))
                        .await;
                }
            }
            "UPDATE" => {
                let status = event
                    .update
                    .ok_or_else(|| anyhow!("UPDATE event without a body"))?
                    .status;
                self.acknowledge(&status).await;
                match TaskState::parse(&status.state) {
                    Some(state) => {
                        handler
                            .status_update(TaskStatus {
                                task_id: TaskId::new(status.task_id.value),
                                state,
                                worker_id: WorkerId::new(
                                    status.agent_id.map(|a| a.value).unwrap_or_default(),
                                ),
                                message: status.message,
                            })
                            .await;
                    }
                    None => warn!(state = status.state, "unknown task state in update"),
                }
            }
            "MESSAGE" => {
                if let Some(message) = event.message {
                    let data = BASE64
                        .decode(&message.data)
                        .map(|d| String::from_utf8_lossy(&d).into_owned())
                        .unwrap_or(message.data);
                    handler
                        .framework_message(
                            message.executor_id.value,
                            WorkerId::new(message.agent_id.value),
                            data,
                        )
                        .await;
                }
            }
            "FAILURE" => {
                if let Some(failure) = event.failure {
                    let worker_id =
                        WorkerId::new(failure.agent_id.map(|a| a.value).unwrap_or_default());
                    match failure.executor_id {
                        Some(executor_id) => {
                            handler
                                .executor_lost(
                                    executor_id.value,
                                    worker_id,
                                    failure.status.unwrap_or_default(),
                                )
                                .await;
                        }
                        None => handler.worker_lost(worker_id).await,
                    }
                }
            }
            "ERROR" => {
                let message = event.error.map(|e| e.message).unwrap_or_default();
                handler.error(message.clone()).await;
                anyhow::bail!("master reported an error: {}", message);
            }
            "HEARTBEAT" => {}
            other => debug!(kind = other, "ignoring unhandled event kind"),
        }
        Ok(())
    }

    /// Explicitly acknowledge a status update that carries a uuid; the
    /// master keeps retrying unacknowledged updates.
    async fn acknowledge(&self, status: &WireStatus) {
        let (Some(uuid), Some(agent_id)) = (&status.uuid, &status.agent_id) else {
            return;
        };
        let body = json!({
            "acknowledge": {
                "agent_id": { "value": agent_id.value },
                "task_id": { "value": status.task_id.value },
                "uuid": uuid,
            }
        });
        if let Err(err) = self.call("ACKNOWLEDGE", body).await {
            warn!(task_id = status.task_id.value, error = %err, "failed to acknowledge status");
        }
    }
}

#[async_trait]
impl SchedulerDriver for MesosDriver {
    async fn decline_offer(&self, offer_id: &OfferId, filters: OfferFilters) -> Result<()> {
        self.call(
            "DECLINE",
            json!({
                "decline": {
                    "offer_ids": [{ "value": offer_id.get() }],
                    "filters": { "refuse_seconds": filters.refuse_seconds },
                }
            }),
        )
        .await
    }

    async fn launch_tasks(
        &self,
        offer_ids: Vec<OfferId>,
        tasks: Vec<TaskInfo>,
        filters: OfferFilters,
    ) -> Result<()> {
        let framework_id = self
            .state
            .read()
            .await
            .framework_id
            .clone()
            .ok_or_else(|| anyhow!("not subscribed yet"))?;
        let wire_offer_ids: Vec<_> = offer_ids
            .iter()
            .map(|id| json!({ "value": id.get() }))
            .collect();
        let task_infos: Vec<_> = tasks
            .iter()
            .map(|t| task_info_wire(t, &framework_id))
            .collect();
        self.call(
            "ACCEPT",
            json!({
                "accept": {
                    "offer_ids": wire_offer_ids,
                    "operations": [{
                        "type": "LAUNCH",
                        "launch": { "task_infos": task_infos },
                    }],
                    "filters": { "refuse_seconds": filters.refuse_seconds },
                }
            }),
        )
        .await
    }

    async fn kill_task(&self, task_id: &TaskId) -> Result<()> {
        self.call(
            "KILL",
            json!({ "kill": { "task_id": { "value": task_id.get() } } }),
        )
        .await
    }

    async fn reconcile_tasks(&self, statuses: Vec<TaskStatus>) -> Result<()> {
        let tasks: Vec<_> = statuses
            .iter()
            .map(|s| json!({ "task_id": { "value": s.task_id.get() } }))
            .collect();
        self.call("RECONCILE", json!({ "reconcile": { "tasks": tasks } }))
            .await
    }

    async fn abort(&self) -> Result<()> {
        error!("aborting the scheduler driver");
        self.aborted.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Subscribe, pump events, and resubscribe with backoff whenever the stream
/// drops. Returns Ok on shutdown and Err once the driver is aborted.
pub async fn run_event_loop(
    driver: Arc<MesosDriver>,
    handler: Arc<dyn FrameworkHandler>,
    mut shutdown_rx: watch::Receiver<()>,
) -> Result<()> {
    let backoff = Backoff::standard();
    let mut delay = backoff.initial;
    loop {
        if driver.is_aborted() {
            anyhow::bail!("driver aborted");
        }
        tokio::select! {
            _ = shutdown_rx.changed() => {
                info!("driver event loop shutting down");
                return Ok(());
            }
            result = driver.subscribe_and_pump(&handler) => {
                if driver.is_aborted() {
                    anyhow::bail!("driver aborted");
                }
                match result {
                    Ok(()) => warn!("master closed the event stream"),
                    Err(err) => error!(error = %err, "event stream failed"),
                }
                handler.disconnected().await;
                warn!(delay_secs = delay.as_secs(), "resubscribing after backoff");
                tokio::time::sleep(delay).await;
                delay = backoff.next(delay);
            }
        }
    }
}

/// Pull one RecordIO record (`<length>\n<record>`) off the front of `buf`.
fn split_record(buf: &mut BytesMut) -> Result<Option<Bytes>> {
    let Some(newline) = buf.iter().position(|b| *b == b'\n') else {
        return Ok(None);
    };
    let len: usize = std::str::from_utf8(&buf[..newline])
        .map_err(|_| anyhow!("non-utf8 record length"))?
        .trim()
        .parse()
        .context("unparseable record length")?;
    if buf.len() < newline + 1 + len {
        return Ok(None);
    }
    let mut record = buf.split_to(newline + 1 + len);
    let record = record.split_off(newline + 1);
    Ok(Some(record.freeze()))
}

fn master_info_from_url(master: &str) -> Result<MasterInfo> {
    let stripped = master
        .strip_prefix("http://")
        .or_else(|| master.strip_prefix("https://"))
        .unwrap_or(master);
    let host_port = stripped.split('/').next().unwrap_or(stripped);
    match host_port.rsplit_once(':') {
        Some((host, port)) => Ok(MasterInfo {
            hostname: host.to_string(),
            port: port
                .parse()
                .with_context(|| format!("bad master port in {}", master))?,
        }),
        None => Ok(MasterInfo {
            hostname: host_port.to_string(),
            port: 5050,
        }),
    }
}

fn scalar(name: &str, value: f64) -> serde_json::Value {
    json!({ "name": name, "type": "SCALAR", "scalar": { "value": value } })
}

fn task_info_wire(task: &TaskInfo, framework_id: &FrameworkId) -> serde_json::Value {
    let uris: Vec<_> = task
        .executor
        .uris
        .iter()
        .map(|u| json!({ "value": u }))
        .collect();
    json!({
        "name": task.name,
        "task_id": { "value": task.task_id.get() },
        "agent_id": { "value": task.worker_id.get() },
        "resources": [
            scalar("cpus", task.resources.cpus),
            scalar("mem", task.resources.mem),
            scalar("disk", task.resources.disk),
            {
                "name": "ports",
                "type": "RANGES",
                "ranges": { "range": [{
                    "begin": task.resources.port_begin,
                    "end": task.resources.port_end,
                }]},
            },
        ],
        "executor": {
            "type": "CUSTOM",
            "executor_id": { "value": task.executor.id },
            "framework_id": { "value": framework_id.get() },
            "command": { "value": task.executor.command, "uris": uris },
            "resources": [
                scalar("cpus", task.executor.cpus),
                scalar("mem", task.executor.mem),
            ],
        },
        "data": BASE64.encode(&task.data),
    })
}

// ---- wire types ----

#[derive(Debug, Deserialize)]
struct WireId {
    value: String,
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(rename = "type")]
    kind: String,
    subscribed: Option<WireSubscribed>,
    offers: Option<WireOffers>,
    rescind: Option<WireRescind>,
    update: Option<WireUpdate>,
    message: Option<WireMessage>,
    failure: Option<WireFailure>,
    error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
struct WireSubscribed {
    framework_id: WireId,
}

#[derive(Debug, Deserialize)]
struct WireOffers {
    #[serde(default)]
    offers: Vec<WireOffer>,
}

#[derive(Debug, Deserialize)]
struct WireOffer {
    id: WireId,
    agent_id: WireId,
    hostname: String,
    #[serde(default)]
    resources: Vec<WireResource>,
}

#[derive(Debug, Deserialize)]
struct WireResource {
    name: String,
    scalar: Option<WireScalar>,
    ranges: Option<WireRanges>,
}

#[derive(Debug, Deserialize)]
struct WireScalar {
    value: f64,
}

#[derive(Debug, Deserialize)]
struct WireRanges {
    #[serde(default)]
    range: Vec<WirePortRange>,
}

#[derive(Debug, Deserialize)]
struct WirePortRange {
    begin: u64,
    end: u64,
}

#[derive(Debug, Deserialize)]
struct WireRescind {
    offer_id: WireId,
}

#[derive(Debug, Deserialize)]
struct WireUpdate {
    status: WireStatus,
}

#[derive(Debug, Deserialize)]
struct WireStatus {
    task_id: WireId,
    state: String,
    agent_id: Option<WireId>,
    uuid: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    agent_id: WireId,
    executor_id: WireId,
    data: String,
}

#[derive(Debug, Deserialize)]
struct WireFailure {
    agent_id: Option<WireId>,
    executor_id: Option<WireId>,
    status: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    message: String,
}

impl From<WireOffer> for Offer {
    fn from(wire: WireOffer) -> Self {
        let resources = wire
            .resources
            .into_iter()
            .filter_map(|r| match (r.name.as_str(), r.scalar, r.ranges) {
                ("cpus", Some(s), _) => Some(Resource::Cpus(s.value)),
                ("mem", Some(s), _) => Some(Resource::Mem(s.value)),
                ("disk", Some(s), _) => Some(Resource::Disk(s.value)),
                ("ports", _, Some(ranges)) => Some(Resource::Ports(
                    ranges
                        .range
                        .into_iter()
                        .map(|r| PortRange {
                            begin: r.begin,
                            end: r.end,
                        })
                        .collect(),
                )),
                _ => None,
            })
            .collect();
        Offer {
            id: OfferId::new(wire.id.value),
            worker_id: WorkerId::new(wire.agent_id.value),
            hostname: wire.hostname,
            resources,
        }
    }
}
