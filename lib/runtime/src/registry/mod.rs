// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Lease-backed registration of named entries in etcd.
//!
//! Every peer owns one [`Registry`]. `start` acquires a lease and begins
//! heartbeating it; every key the peer registers afterwards is attached to
//! that lease, so a dead peer's entries disappear within one lease duration.
//! `watch` streams changes under a key prefix with per-key ordering.

mod keepalive;

use std::sync::Arc;
use std::time::Duration;

use etcd_client::{
    Compare, CompareOp, EventType as EtcdEventType, GetOptions, PutOptions, Txn, TxnOp,
    WatchOptions,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::RuntimeConfig;
use crate::utils;

pub use keepalive::KeepAliveStats;

/// Sentinel lease id of a registry that has not started.
pub const NO_LEASE: i64 = -1;

/// A (key → address) binding in the coordination store, tied to a lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Registry")]
    pub registry: String,
}

/// Kind of change a watch observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Create,
    Modify,
    Delete,
    Error,
}

/// A change notification from [`Registry::watch`]. Ordered per key; between
/// keys only the store's global ordering applies.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub key: String,
    pub event_type: EventType,
    /// The new registration, when applicable.
    pub reg: Option<Registration>,
    /// Diagnostic for `Error` events. The channel closes after one of these.
    pub error: Option<String>,
}

impl std::fmt::Display for WatchEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.event_type {
            EventType::Create => write!(f, "create: key: {}", self.key),
            EventType::Modify => write!(f, "modify: key: {}", self.key),
            EventType::Delete => write!(f, "delete: key: {}", self.key),
            EventType::Error => write!(
                f,
                "error: key: {}: {}",
                self.key,
                self.error.as_deref().unwrap_or("unknown")
            ),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry not started")]
    NotStarted,

    #[error("already registered")]
    AlreadyRegistered,

    #[error("not owner of registration")]
    NotOwner,

    #[error("registration not found")]
    NotFound,

    #[error("registry lease lost")]
    LostLease,

    #[error(transparent)]
    Etcd(#[from] etcd_client::Error),

    #[error("registration encoding: {0}")]
    Codec(#[from] serde_json::Error),
}

/// The name → address seam the transport consumes. The lease-backed
/// [`Registry`] is the cluster implementation; a [`StaticDirectory`] serves
/// fixed fleets and tests that run without a coordination store.
#[async_trait::async_trait]
pub trait Directory: Send + Sync {
    async fn register(&self, key: &str) -> Result<(), RegistryError>;
    async fn deregister(&self, key: &str) -> Result<(), RegistryError>;
    async fn lookup(&self, key: &str) -> Result<Registration, RegistryError>;
}

#[async_trait::async_trait]
impl Directory for Registry {
    async fn register(&self, key: &str) -> Result<(), RegistryError> {
        Registry::register(self, key).await
    }

    async fn deregister(&self, key: &str) -> Result<(), RegistryError> {
        Registry::deregister(self, key).await
    }

    async fn lookup(&self, key: &str) -> Result<Registration, RegistryError> {
        self.find_registration(key).await
    }
}

/// An in-process directory with one fixed advertised address. Peers that are
/// known at startup need no coordination store.
pub struct StaticDirectory {
    address: String,
    entries: Mutex<std::collections::HashMap<String, Registration>>,
}

impl StaticDirectory {
    pub fn new(address: impl Into<String>) -> StaticDirectory {
        StaticDirectory {
            address: address.into(),
            entries: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Insert a remote entry by hand.
    pub fn insert(&self, key: impl Into<String>, address: impl Into<String>) {
        let key = key.into();
        let reg = Registration {
            key: key.clone(),
            address: address.into(),
            registry: "static".to_string(),
        };
        self.entries.lock().insert(key, reg);
    }
}

#[async_trait::async_trait]
impl Directory for StaticDirectory {
    async fn register(&self, key: &str) -> Result<(), RegistryError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(key) {
            return Err(RegistryError::AlreadyRegistered);
        }
        entries.insert(
            key.to_string(),
            Registration {
                key: key.to_string(),
                address: self.address.clone(),
                registry: "static".to_string(),
            },
        );
        Ok(())
    }

    async fn deregister(&self, key: &str) -> Result<(), RegistryError> {
        match self.entries.lock().remove(key) {
            Some(_) => Ok(()),
            None => Err(RegistryError::NotFound),
        }
    }

    async fn lookup(&self, key: &str) -> Result<Registration, RegistryError> {
        self.entries
            .lock()
            .get(key)
            .cloned()
            .ok_or(RegistryError::NotFound)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotStarted,
    Started,
    /// Keepalive hit a terminal failure; registrations are gone or going.
    Failed,
    Stopped,
}

#[derive(Debug)]
struct State {
    phase: Phase,
    lease_id: i64,
    address: String,
    stats: KeepAliveStats,
}

pub(crate) struct Shared {
    state: Mutex<State>,
}

impl Shared {
    pub(crate) fn record_success(&self) {
        self.state.lock().stats.success += 1;
    }

    pub(crate) fn record_failure(&self) {
        self.state.lock().stats.failure += 1;
    }

    pub(crate) fn mark_failed(&self) {
        let mut state = self.state.lock();
        if state.phase == Phase::Started {
            state.phase = Phase::Failed;
        }
    }
}

/// Lease-backed registry of named entries.
pub struct Registry {
    client: etcd_client::Client,
    /// Settable before `start`; clamped at `MIN_LEASE_DURATION` on start.
    pub lease_duration: Duration,
    registry_name: String,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl Registry {
    pub fn new(client: etcd_client::Client) -> Registry {
        Self::with_config(client, &RuntimeConfig::default())
    }

    pub fn with_config(client: etcd_client::Client, config: &RuntimeConfig) -> Registry {
        Registry {
            client,
            lease_duration: config.lease_duration,
            registry_name: utils::registry_name(),
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    phase: Phase::NotStarted,
                    lease_id: NO_LEASE,
                    address: String::new(),
                    stats: KeepAliveStats::default(),
                }),
            }),
            cancel: CancellationToken::new(),
        }
    }

    /// Identity of this registry instance, `hostname-pid`.
    pub fn registry(&self) -> &str {
        &self.registry_name
    }

    /// Address advertised in registrations. Empty before `start`.
    pub fn address(&self) -> String {
        self.shared.state.lock().address.clone()
    }

    /// Current lease id, [`NO_LEASE`] before `start`.
    pub fn lease_id(&self) -> i64 {
        self.shared.state.lock().lease_id
    }

    /// Heartbeat counters, exported for tests and observability.
    pub fn keep_alive_stats(&self) -> KeepAliveStats {
        self.shared.state.lock().stats
    }

    /// Acquire the lease, record the advertised address, and launch the
    /// keepalive task. Idempotent within a process: a second call returns the
    /// existing lease id.
    pub async fn start(&self, addr: impl Into<String>) -> Result<i64, RegistryError> {
        {
            let state = self.shared.state.lock();
            match state.phase {
                Phase::Started => return Ok(state.lease_id),
                Phase::Failed => return Err(RegistryError::LostLease),
                Phase::Stopped => return Err(RegistryError::NotStarted),
                Phase::NotStarted => {}
            }
        }

        let lease_duration = self.lease_duration.max(crate::config::MIN_LEASE_DURATION);

        let mut client = self.client.clone();
        let granted = client
            .lease_grant(lease_duration.as_secs() as i64, None)
            .await?;
        let lease_id = granted.id();

        let addr = addr.into();
        {
            let mut state = self.shared.state.lock();
            state.phase = Phase::Started;
            state.lease_id = lease_id;
            state.address = addr.clone();
        }

        tracing::info!(
            lease_id,
            address = %addr,
            ttl_secs = lease_duration.as_secs(),
            "registry started"
        );

        tokio::spawn(keepalive::run(
            self.client.clone(),
            lease_id,
            lease_duration,
            self.shared.clone(),
            self.cancel.child_token(),
        ));

        Ok(lease_id)
    }

    /// Revoke the lease (deleting every key it owns atomically) and stop the
    /// keepalive task and any watches.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let lease_id = {
            let mut state = self.shared.state.lock();
            let id = state.lease_id;
            state.phase = Phase::Stopped;
            id
        };

        if lease_id != NO_LEASE {
            let mut client = self.client.clone();
            if let Err(e) = client.lease_revoke(lease_id).await {
                tracing::warn!(lease_id, error = %e, "lease revoke failed during stop");
            }
        }
    }

    fn started_lease(&self) -> Result<i64, RegistryError> {
        let state = self.shared.state.lock();
        match state.phase {
            Phase::Started => Ok(state.lease_id),
            Phase::Failed => Err(RegistryError::LostLease),
            _ => Err(RegistryError::NotStarted),
        }
    }

    /// Register `key`, bound to this peer's advertised address, under the
    /// registry's lease. The write is conditional: it succeeds only if the
    /// key does not already exist under any lease.
    pub async fn register(&self, key: impl Into<String>) -> Result<(), RegistryError> {
        let lease_id = self.started_lease()?;
        let key = key.into();

        let reg = Registration {
            key: key.clone(),
            address: self.address(),
            registry: self.registry_name.clone(),
        };
        let value = serde_json::to_vec(&reg)?;

        let txn = Txn::new()
            .when(vec![Compare::create_revision(
                key.as_str(),
                CompareOp::Equal,
                0,
            )])
            .and_then(vec![TxnOp::put(
                key.as_str(),
                value,
                Some(PutOptions::new().with_lease(lease_id)),
            )]);

        let mut client = self.client.clone();
        let resp = client.txn(txn).await?;
        if !resp.succeeded() {
            return Err(RegistryError::AlreadyRegistered);
        }

        tracing::debug!(key = %key, "registered");
        Ok(())
    }

    /// Delete `key` if it is owned by this registry's lease.
    pub async fn deregister(&self, key: impl Into<String>) -> Result<(), RegistryError> {
        let lease_id = self.started_lease()?;
        let key = key.into();

        let txn = Txn::new()
            .when(vec![Compare::lease(
                key.as_str(),
                CompareOp::Equal,
                lease_id,
            )])
            .and_then(vec![TxnOp::delete(key.as_str(), None)])
            .or_else(vec![TxnOp::get(key.as_str(), None)]);

        let mut client = self.client.clone();
        let resp = client.txn(txn).await?;
        if resp.succeeded() {
            tracing::debug!(key = %key, "deregistered");
            return Ok(());
        }

        // The lease compare failed: either the key is gone or someone else
        // owns it.
        for op in resp.op_responses() {
            if let etcd_client::TxnOpResponse::Get(get) = op {
                if get.count() == 0 {
                    return Err(RegistryError::NotFound);
                }
            }
        }
        Err(RegistryError::NotOwner)
    }

    /// Look up a single registration by exact key.
    pub async fn find_registration(&self, key: &str) -> Result<Registration, RegistryError> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await?;
        match resp.kvs().first() {
            Some(kv) => Ok(serde_json::from_slice(kv.value())?),
            None => Err(RegistryError::NotFound),
        }
    }

    /// Look up every registration under a key prefix.
    pub async fn find_registrations(
        &self,
        prefix: &str,
    ) -> Result<Vec<Registration>, RegistryError> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;
        let mut regs = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            match serde_json::from_slice(kv.value()) {
                Ok(reg) => regs.push(reg),
                Err(e) => {
                    tracing::warn!(key = ?kv.key_str(), error = %e, "skipping unparsable registration")
                }
            }
        }
        Ok(regs)
    }

    /// Read the entries under `prefix` at a snapshot revision, then stream
    /// changes from the next revision on. The receiver closes when the
    /// registry stops or on an unrecoverable store error, after a terminal
    /// `Error` event. Missed events are never reconstructed; on a compaction
    /// error the caller must restart the watch.
    pub async fn watch(
        &self,
        prefix: impl Into<String>,
    ) -> Result<(Vec<Registration>, mpsc::Receiver<WatchEvent>), RegistryError> {
        let prefix = prefix.into();

        let mut client = self.client.clone();
        let resp = client
            .get(prefix.as_str(), Some(GetOptions::new().with_prefix()))
            .await?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or(0);

        let mut initial = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            match serde_json::from_slice(kv.value()) {
                Ok(reg) => initial.push(reg),
                Err(e) => {
                    tracing::warn!(key = ?kv.key_str(), error = %e, "skipping unparsable registration")
                }
            }
        }

        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(revision + 1)
            .with_prev_key();
        let (watcher, stream) = client.watch(prefix.as_str(), Some(options)).await?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(stream_events(
            prefix,
            watcher,
            stream,
            tx,
            self.cancel.child_token(),
        ));

        Ok((initial, rx))
    }
}

async fn stream_events(
    prefix: String,
    mut watcher: etcd_client::Watcher,
    mut stream: etcd_client::WatchStream,
    tx: mpsc::Sender<WatchEvent>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = stream.message() => message,
        };

        let resp = match message {
            Ok(Some(resp)) => resp,
            Ok(None) => break,
            Err(e) => {
                let _ = tx
                    .send(WatchEvent {
                        key: prefix.clone(),
                        event_type: EventType::Error,
                        reg: None,
                        error: Some(e.to_string()),
                    })
                    .await;
                break;
            }
        };

        if resp.canceled() || resp.compact_revision() > 0 {
            let _ = tx
                .send(WatchEvent {
                    key: prefix.clone(),
                    event_type: EventType::Error,
                    reg: None,
                    error: Some(format!(
                        "watch cancelled by store, compact revision {}",
                        resp.compact_revision()
                    )),
                })
                .await;
            break;
        }

        for event in resp.events() {
            let Some(kv) = event.kv() else { continue };
            let key = match kv.key_str() {
                Ok(k) => k.to_string(),
                Err(_) => continue,
            };

            let watch_event = match event.event_type() {
                EtcdEventType::Put => {
                    let reg = serde_json::from_slice(kv.value()).ok();
                    let event_type = if kv.version() == 1 {
                        EventType::Create
                    } else {
                        EventType::Modify
                    };
                    WatchEvent {
                        key,
                        event_type,
                        reg,
                        error: None,
                    }
                }
                EtcdEventType::Delete => {
                    let reg = event
                        .prev_kv()
                        .and_then(|prev| serde_json::from_slice(prev.value()).ok());
                    WatchEvent {
                        key,
                        event_type: EventType::Delete,
                        reg,
                        error: None,
                    }
                }
            };

            if tx.send(watch_event).await.is_err() {
                // Receiver gone; tear the watch down.
                let _ = watcher.cancel().await;
                return;
            }
        }
    }

    let _ = watcher.cancel().await;
}
