// SPDX-License-Identifier: Apache-2.0

//! ZooKeeper-backed coordination client.
//!
//! Runs on its own OS thread so session handling and znode traffic never
//! touch the tail-engine loop. The thread blocks on a task channel with the
//! refresh interval as timeout, which gives the periodic refresh floor;
//! watch callbacks and `publish_state` enqueue tasks without blocking.
//!
//! ZooKeeper watches are one-shot: each refresh re-reads the value through
//! a `_w` call, which re-arms the watch that scheduled the refresh.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};
use zookeeper::{Acl, CreateMode, WatchedEvent, ZkError, ZkState, ZooKeeper};

use crate::bounded_channel::{bounded, BoundedReceiver, BoundedSender};
use crate::coordination::Coordination;
use crate::tail::manager::EngineEvent;

pub const BROKER_IDS_PATH: &str = "/brokers/ids";
pub const CONFIG_PATH_PREFIX: &str = "/logkafka/config/";
pub const CLIENT_PATH_PREFIX: &str = "/logkafka/client/";

const SESSION_TIMEOUT: Duration = Duration::from_secs(30);
const TASK_QUEUE_SIZE: usize = 64;

#[derive(Debug)]
pub enum CoordError {
    NotConnected,
    Zk(ZkError),
    BrokerJson(String),
}

impl std::fmt::Display for CoordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordError::NotConnected => write!(f, "no zookeeper session"),
            CoordError::Zk(e) => write!(f, "zookeeper error: {:?}", e),
            CoordError::BrokerJson(e) => write!(f, "invalid broker document: {}", e),
        }
    }
}

impl From<ZkError> for CoordError {
    fn from(e: ZkError) -> Self {
        CoordError::Zk(e)
    }
}

type Result<T> = std::result::Result<T, CoordError>;

#[derive(Debug, Clone)]
pub struct ZkClientConfig {
    /// Comma-separated coordination servers.
    pub zk_urls: String,
    /// Refresh floor for watches, broker urls, and the config document.
    pub refresh_interval: Duration,
    /// This host's name; selects the config and client znodes.
    pub hostname: String,
}

enum ZkTask {
    Refresh,
    RefreshConfig,
    RefreshBrokers,
    Publish(Vec<u8>),
    Shutdown,
}

/// Handle held by the daemon; reads are served from caches, everything else
/// is forwarded to the worker thread.
pub struct ZkCoordinator {
    tasks: BoundedSender<ZkTask>,
    log_config: Arc<RwLock<String>>,
    broker_urls: Arc<RwLock<String>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ZkCoordinator {
    /// Spawn the worker thread and schedule the first refresh. Connection
    /// problems are not fatal here: caches start empty and fill once the
    /// session comes up.
    pub fn start(config: ZkClientConfig, engine_tx: BoundedSender<EngineEvent>) -> Self {
        let (tasks_tx, tasks_rx) = bounded::<ZkTask>(TASK_QUEUE_SIZE);
        let log_config = Arc::new(RwLock::new("{}".to_string()));
        let broker_urls = Arc::new(RwLock::new(String::new()));

        let worker = ZkWorker {
            config,
            log_config: log_config.clone(),
            broker_urls: broker_urls.clone(),
            tasks_tx: tasks_tx.clone(),
            engine_tx,
            zk: None,
            session_lost: Arc::new(AtomicBool::new(false)),
        };

        let handle = std::thread::Builder::new()
            .name("zk-coordinator".to_string())
            .spawn(move || worker.run(tasks_rx))
            .expect("failed to spawn coordination thread");

        Self {
            tasks: tasks_tx,
            log_config,
            broker_urls,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Close the session; the ephemeral liveness node disappears with it.
    pub fn close(&self) {
        let _ = self.tasks.send_blocking(ZkTask::Shutdown);
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Coordination for ZkCoordinator {
    fn broker_urls(&self) -> String {
        self.broker_urls
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn log_config(&self) -> String {
        self.log_config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish_state(&self, payload: Vec<u8>) {
        if let Err(e) = self.tasks.try_send(ZkTask::Publish(payload)) {
            warn!(error = %e, "dropping progress upload");
        }
    }
}

struct ZkWorker {
    config: ZkClientConfig,
    log_config: Arc<RwLock<String>>,
    broker_urls: Arc<RwLock<String>>,
    tasks_tx: BoundedSender<ZkTask>,
    engine_tx: BoundedSender<EngineEvent>,
    zk: Option<ZooKeeper>,
    /// Set by the session listener; the next task reconnects.
    session_lost: Arc<AtomicBool>,
}

impl ZkWorker {
    fn config_path(&self) -> String {
        format!("{}{}", CONFIG_PATH_PREFIX, self.config.hostname)
    }

    fn client_path(&self) -> String {
        format!("{}{}", CLIENT_PATH_PREFIX, self.config.hostname)
    }

    fn run(mut self, tasks: BoundedReceiver<ZkTask>) {
        self.refresh();

        loop {
            match tasks.recv_timeout(self.config.refresh_interval) {
                Some(ZkTask::Refresh) => self.refresh(),
                Some(ZkTask::RefreshConfig) => {
                    if self.ensure_session() {
                        if let Err(e) = self.refresh_log_config() {
                            warn!(error = %e, "failed to refresh log config");
                        }
                    }
                }
                Some(ZkTask::RefreshBrokers) => {
                    if self.ensure_session() {
                        if let Err(e) = self.refresh_broker_urls() {
                            warn!(error = %e, "failed to refresh broker urls");
                        }
                    }
                }
                Some(ZkTask::Publish(payload)) => {
                    if self.ensure_session() {
                        if let Err(e) = self.publish(payload) {
                            warn!(error = %e, "failed to publish progress");
                        }
                    }
                }
                Some(ZkTask::Shutdown) => break,
                None => {
                    if tasks.is_disconnected() {
                        break;
                    }
                    self.refresh();
                }
            }
        }

        if let Some(zk) = self.zk.take() {
            let _ = zk.close();
        }
        info!("coordination client stopped");
    }

    /// Full refresh: session, liveness node, watches, both caches. Partial
    /// failures are logged; caches keep their last known good values.
    fn refresh(&mut self) {
        if !self.ensure_session() {
            return;
        }

        if let Err(e) = self.refresh_liveness() {
            warn!(error = %e, "failed to refresh liveness node");
        }
        if let Err(e) = self.refresh_broker_urls() {
            warn!(error = %e, "failed to refresh broker urls");
        }
        if let Err(e) = self.refresh_log_config() {
            warn!(error = %e, "failed to refresh log config");
        }
    }

    fn ensure_session(&mut self) -> bool {
        if self.session_lost.swap(false, Ordering::SeqCst) {
            info!("closing lost zookeeper session");
            if let Some(zk) = self.zk.take() {
                let _ = zk.close();
            }
        }

        if self.zk.is_some() {
            return true;
        }

        match ZooKeeper::connect(&self.config.zk_urls, SESSION_TIMEOUT, |_: WatchedEvent| {}) {
            Ok(zk) => {
                let lost = self.session_lost.clone();
                let tasks = self.tasks_tx.clone();
                zk.add_listener(move |state: ZkState| {
                    debug!(?state, "zookeeper session state");
                    if matches!(state, ZkState::Closed | ZkState::AuthFailed) {
                        lost.store(true, Ordering::SeqCst);
                        let _ = tasks.try_send(ZkTask::Refresh);
                    }
                });

                info!(urls = %self.config.zk_urls, "connected to zookeeper");
                self.zk = Some(zk);
                true
            }
            Err(e) => {
                warn!(urls = %self.config.zk_urls, error = ?e, "failed to connect to zookeeper");
                false
            }
        }
    }

    /// Recreate the ephemeral per-host node. A reconnect may leave a stale
    /// one from the previous session, so delete first.
    fn refresh_liveness(&self) -> Result<()> {
        let zk = self.zk.as_ref().ok_or(CoordError::NotConnected)?;
        let path = self.client_path();

        ensure_path_exists(zk, &path)?;
        let _ = zk.delete(&path, None);
        match zk.create(
            &path,
            Vec::new(),
            Acl::open_unsafe().clone(),
            CreateMode::Ephemeral,
        ) {
            Ok(_) | Err(ZkError::NodeExists) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Re-read the desired-state document, re-arming the data watch. The
    /// engine is notified when the document changed.
    fn refresh_log_config(&self) -> Result<()> {
        let zk = self.zk.as_ref().ok_or(CoordError::NotConnected)?;
        let path = self.config_path();

        ensure_path_exists(zk, &path)?;

        let tasks = self.tasks_tx.clone();
        let (data, _stat) = zk.get_data_w(&path, move |_: WatchedEvent| {
            let _ = tasks.try_send(ZkTask::RefreshConfig);
        })?;

        let document = if data.is_empty() {
            "{}".to_string()
        } else {
            String::from_utf8_lossy(&data).to_string()
        };

        let changed = {
            let mut cache = self
                .log_config
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if *cache != document {
                *cache = document;
                true
            } else {
                false
            }
        };

        if changed {
            info!("log config changed");
            let _ = self.engine_tx.try_send(EngineEvent::ConfigChanged);
        }

        Ok(())
    }

    /// Rebuild the broker list from `/brokers/ids`, re-arming the children
    /// watch. Any partially fetchable list aborts the refresh so the cache
    /// keeps the previous complete value.
    fn refresh_broker_urls(&self) -> Result<()> {
        let zk = self.zk.as_ref().ok_or(CoordError::NotConnected)?;

        ensure_path_exists(zk, BROKER_IDS_PATH)?;

        let tasks = self.tasks_tx.clone();
        let ids = zk.get_children_w(BROKER_IDS_PATH, move |_: WatchedEvent| {
            let _ = tasks.try_send(ZkTask::RefreshBrokers);
        })?;

        let mut brokers = Vec::with_capacity(ids.len());
        for id in &ids {
            let path = format!("{}/{}", BROKER_IDS_PATH, id);
            let (data, _stat) = zk.get_data(&path, false)?;
            brokers.push(parse_broker_url(&data)?);
        }

        let urls = brokers.join(",");
        let mut cache = self
            .broker_urls
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if *cache != urls {
            info!(brokers = %urls, "broker list changed");
            *cache = urls;
        }

        Ok(())
    }

    fn publish(&self, payload: Vec<u8>) -> Result<()> {
        let zk = self.zk.as_ref().ok_or(CoordError::NotConnected)?;
        let path = self.client_path();

        match zk.set_data(&path, payload.clone(), None) {
            Ok(_) => Ok(()),
            Err(ZkError::NoNode) => {
                ensure_path_exists(zk, &path)?;
                let _ = zk.delete(&path, None);
                zk.create(
                    &path,
                    payload,
                    Acl::open_unsafe().clone(),
                    CreateMode::Ephemeral,
                )?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Create the parents of `path` (and `path` itself, persistent) if absent.
/// Callers that need an ephemeral leaf delete and recreate it afterwards.
fn ensure_path_exists(zk: &ZooKeeper, path: &str) -> Result<()> {
    if zk.exists(path, false)?.is_some() {
        return Ok(());
    }

    let mut partial = String::with_capacity(path.len());
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        partial.push('/');
        partial.push_str(segment);
        match zk.create(
            &partial,
            Vec::new(),
            Acl::open_unsafe().clone(),
            CreateMode::Persistent,
        ) {
            Ok(_) | Err(ZkError::NodeExists) => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

#[derive(Debug, Deserialize)]
struct BrokerInfo {
    host: String,
    port: u16,
}

/// Parse one broker znode document into `host:port`.
fn parse_broker_url(data: &[u8]) -> Result<String> {
    let info: BrokerInfo =
        serde_json::from_slice(data).map_err(|e| CoordError::BrokerJson(e.to_string()))?;
    Ok(format!("{}:{}", info.host, info.port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_document_parses() {
        let data = br#"{"jmx_port":-1,"timestamp":"1428512949385","host":"kafka-1.internal","version":1,"port":9092}"#;
        assert_eq!(parse_broker_url(data).unwrap(), "kafka-1.internal:9092");
    }

    #[test]
    fn broker_document_missing_fields_rejected() {
        assert!(parse_broker_url(br#"{"host": "only-host"}"#).is_err());
        assert!(parse_broker_url(b"not json").is_err());
    }

    #[test]
    fn per_host_paths() {
        let config = ZkClientConfig {
            zk_urls: "127.0.0.1:2181".to_string(),
            refresh_interval: Duration::from_secs(30),
            hostname: "web-7".to_string(),
        };
        let worker = ZkWorker {
            config,
            log_config: Arc::new(RwLock::new(String::new())),
            broker_urls: Arc::new(RwLock::new(String::new())),
            tasks_tx: bounded(1).0,
            engine_tx: bounded(1).0,
            zk: None,
            session_lost: Arc::new(AtomicBool::new(false)),
        };

        assert_eq!(worker.config_path(), "/logkafka/config/web-7");
        assert_eq!(worker.client_path(), "/logkafka/client/web-7");
    }
}
