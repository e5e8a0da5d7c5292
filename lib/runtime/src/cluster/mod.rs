// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cluster membership, leadership, and schedule distribution.
//!
//! Every peer self-registers under `<grid>/peers/<peer-name>` and watches
//! that prefix. Peers elect a leader through a KV lease; the leader computes
//! actor placement whenever membership changes and publishes the resulting
//! [`PeerState`] at `<grid>/state`. Followers accept only monotonically
//! newer states and converge their local actor runtime on their slice of
//! the schedule.
//!
//! Failure detection is bounded by `heart_timeout`: registry leases are
//! clamped to it, so a dead peer's presence key (and the `Timeout` health
//! transition it triggers) is observed within one heart timeout, and the
//! leader key lives under its own lease with that TTL, so a replacement
//! leader is elected within the same window.

mod election;
mod sched;

pub use election::{Election, LeaderRecord};
pub use sched::{peer_sched, ActorSpec, Instance, PeerSched, SETTING_PARTS, SETTING_SLOT};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use etcd_client::WatchOptions;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::actor::{ActorContext, ActorError, ActorRuntime};
use crate::config::RuntimeConfig;
use crate::registry::{EventType, Registry};
use crate::runtime::Runtime;
use crate::transport::{MailboxClient, MailboxServer};
use crate::utils;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rank {
    Leader,
    Follower,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Health {
    Active,
    Timeout,
}

/// A member of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Rank")]
    pub rank: Rank,
    #[serde(rename = "Health")]
    pub health: Health,
    #[serde(rename = "LastSeen")]
    pub last_seen_unix: i64,
}

impl Peer {
    fn new(name: impl Into<String>) -> Peer {
        Peer {
            name: name.into(),
            rank: Rank::Follower,
            health: Health::Active,
            last_seen_unix: utils::unix_nanos(),
        }
    }
}

/// The leader's snapshot of the cluster. `version` strictly increases with
/// each emission; `term` advances on election.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerState {
    #[serde(rename = "Term")]
    pub term: u64,
    #[serde(rename = "Version")]
    pub version: u64,
    #[serde(rename = "Sched", default)]
    pub sched: PeerSched,
    #[serde(rename = "Peers", default)]
    pub peers: BTreeMap<String, Peer>,
}

/// Whether a follower at `current` accepts `new`. States go backwards in
/// neither version nor term; a version tie is resolved by a newer term.
pub fn accept_state(current: &PeerState, new: &PeerState) -> bool {
    if new.version > current.version {
        return new.term >= current.term;
    }
    if new.version == current.version {
        return new.term > current.term;
    }
    false
}

/// One peer's stake in the cluster: registry, mailbox server and client,
/// actor runtime, and the membership/leadership/schedule loop.
pub struct Manager {
    grid: String,
    peer_name: String,
    config: RuntimeConfig,
    runtime: Runtime,
    client: etcd_client::Client,
    registry: Arc<Registry>,
    server: MailboxServer,
    mailbox_client: Arc<MailboxClient>,
    actors: Arc<ActorRuntime>,
    specs: Mutex<Vec<ActorSpec>>,
    parts: Mutex<HashMap<String, Vec<i32>>>,
    /// Actor ids this manager started from a schedule.
    managed: Mutex<HashSet<String>>,
    cancel: CancellationToken,
}

impl Manager {
    /// Wire up one peer: bind the mailbox server, start the registry lease,
    /// and build the actor runtime. `slot` distinguishes multiple peers in
    /// one process.
    pub async fn new(
        grid: impl Into<String>,
        slot: u32,
        etcd: etcd_client::Client,
        bind_addr: &str,
        config: RuntimeConfig,
    ) -> Result<Manager> {
        let grid = grid.into();
        let config = config.clamped();
        let peer_name = utils::build_peer_name(slot);

        let runtime = Runtime::new();
        let server = MailboxServer::bind(bind_addr).await?;

        let registry = Arc::new(Registry::with_config(etcd.clone(), &config));
        registry.start(server.local_addr().to_string()).await?;

        let mailbox_client = Arc::new(MailboxClient::new(registry.clone(), config.clone()));

        let ctx = ActorContext::new(
            grid.clone(),
            peer_name.clone(),
            config.clone(),
            runtime.child_token(),
            registry.clone(),
            server.clone(),
            mailbox_client.clone(),
            etcd.clone(),
        );
        let actors = Arc::new(ActorRuntime::new(ctx, config.clone()));

        Ok(Manager {
            grid,
            peer_name,
            config,
            runtime,
            client: etcd,
            registry,
            server,
            mailbox_client,
            actors,
            specs: Mutex::new(Vec::new()),
            parts: Mutex::new(HashMap::new()),
            managed: Mutex::new(HashSet::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn grid(&self) -> &str {
        &self.grid
    }

    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn actors(&self) -> &Arc<ActorRuntime> {
        &self.actors
    }

    pub fn client(&self) -> &Arc<MailboxClient> {
        &self.mailbox_client
    }

    pub fn server(&self) -> &MailboxServer {
        &self.server
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Add a scheduling unit. Takes effect on the next emission.
    pub fn add_spec(&self, spec: ActorSpec) {
        self.specs.lock().push(spec);
    }

    /// Set the topic → partitions map the scheduler slices over.
    pub fn set_partitions(&self, parts: HashMap<String, Vec<i32>>) {
        *self.parts.lock() = parts;
    }

    fn peers_prefix(&self) -> String {
        format!("{}/peers/", self.grid)
    }

    fn state_key(&self) -> String {
        format!("{}/state", self.grid)
    }

    /// Join the cluster and run the membership/leadership/schedule loop
    /// until [`Manager::shutdown`] is called.
    pub async fn run(&self) -> Result<()> {
        let peers_prefix = self.peers_prefix();
        self.registry
            .register(format!("{}{}", peers_prefix, self.peer_name))
            .await?;

        let (initial, mut peer_events) = self.registry.watch(peers_prefix.clone()).await?;
        let mut peers: BTreeMap<String, Peer> = initial
            .into_iter()
            .filter_map(|reg| {
                let name = reg.key.strip_prefix(&peers_prefix)?.to_string();
                Some((name.clone(), Peer::new(name)))
            })
            .collect();

        let election = Election::new(
            self.client.clone(),
            &self.grid,
            &self.peer_name,
            self.config.heart_timeout,
            self.cancel.child_token(),
        );
        let mut rank_rx = election.start();

        // Adopt whatever state the previous leader left behind.
        let mut local = PeerState::default();
        let mut client = self.client.clone();
        let state_resp = client.get(self.state_key().as_str(), None).await?;
        let state_revision = state_resp.header().map(|h| h.revision()).unwrap_or(0);
        if let Some(kv) = state_resp.kvs().first() {
            if let Ok(state) = serde_json::from_slice::<PeerState>(kv.value()) {
                self.converge(&state);
                local = state;
            }
        }

        let options = WatchOptions::new().with_start_revision(state_revision + 1);
        let (mut state_watcher, mut state_stream) = client
            .watch(self.state_key().as_str(), Some(options))
            .await?;

        let mut dirty = true;
        loop {
            let is_leader = rank_rx
                .borrow()
                .as_ref()
                .map(|record| record.leader == self.peer_name)
                .unwrap_or(false);
            let term = rank_rx.borrow().as_ref().map(|r| r.term).unwrap_or(0);

            if is_leader && dirty {
                match self.emit(&mut peers, &mut local, term).await {
                    Ok(()) => dirty = false,
                    Err(e) => tracing::warn!(error = %e, "state emission failed"),
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,

                event = peer_events.recv() => {
                    let Some(event) = event else {
                        tracing::warn!("peer watch closed");
                        break;
                    };
                    let Some(name) = event.key.strip_prefix(&peers_prefix).map(str::to_string) else {
                        continue;
                    };
                    match event.event_type {
                        EventType::Create | EventType::Modify => {
                            tracing::info!(peer = %name, "peer joined");
                            peers.insert(name.clone(), Peer::new(name));
                            dirty = true;
                        }
                        EventType::Delete => {
                            tracing::info!(peer = %name, "peer lost");
                            if let Some(peer) = peers.get_mut(&name) {
                                peer.health = Health::Timeout;
                            }
                            dirty = true;
                        }
                        EventType::Error => {
                            tracing::error!(error = ?event.error, "peer watch error");
                            break;
                        }
                    }
                }

                changed = rank_rx.changed() => {
                    if changed.is_err() {
                        tracing::warn!("election ended");
                        break;
                    }
                    // A new leader re-emits even without membership change
                    // so its term lands in the published state.
                    dirty = true;
                }

                message = state_stream.message() => {
                    let resp = match message {
                        Ok(Some(resp)) => resp,
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(error = %e, "state watch error");
                            break;
                        }
                    };
                    for event in resp.events() {
                        if event.event_type() != etcd_client::EventType::Put {
                            continue;
                        }
                        let Some(kv) = event.kv() else { continue };
                        let state: PeerState = match serde_json::from_slice(kv.value()) {
                            Ok(state) => state,
                            Err(e) => {
                                tracing::warn!(error = %e, "unparsable peer state");
                                continue;
                            }
                        };
                        if !accept_state(&local, &state) {
                            tracing::debug!(
                                version = state.version,
                                term = state.term,
                                "rejecting stale peer state"
                            );
                            continue;
                        }
                        self.converge(&state);
                        local = state;
                    }
                }
            }
        }

        let _ = state_watcher.cancel().await;
        Ok(())
    }

    /// Leader only: recompute placement, bump the version, publish, and
    /// apply locally.
    async fn emit(
        &self,
        peers: &mut BTreeMap<String, Peer>,
        local: &mut PeerState,
        term: u64,
    ) -> Result<()> {
        let specs = self.specs.lock().clone();
        let parts = self.parts.lock().clone();

        let sched = peer_sched(peers, &specs, &parts, Some(&local.sched));

        // Timed-out peers were excluded from the schedule; drop them now.
        peers.retain(|_, p| p.health == Health::Active);
        for (name, peer) in peers.iter_mut() {
            peer.rank = if *name == self.peer_name {
                Rank::Leader
            } else {
                Rank::Follower
            };
        }

        let next = PeerState {
            term,
            version: local.version + 1,
            sched,
            peers: peers.clone(),
        };

        let value = serde_json::to_vec(&next).map_err(crate::Error::from)?;
        let mut client = self.client.clone();
        client.put(self.state_key().as_str(), value, None).await?;

        tracing::info!(
            term = next.term,
            version = next.version,
            peers = peers.len(),
            "emitted peer state"
        );

        // The leader applies its own emission immediately; the watch echo is
        // rejected as a duplicate.
        self.converge(&next);
        *local = next;
        Ok(())
    }

    /// Start whatever the schedule newly assigns to this peer and signal
    /// exit on whatever it removed.
    fn converge(&self, state: &PeerState) {
        let want: HashMap<String, &Instance> = state
            .sched
            .get(&self.peer_name)
            .map(|instances| {
                instances
                    .iter()
                    .map(|inst| (inst.def.id(), inst))
                    .collect()
            })
            .unwrap_or_default();

        let mut managed = self.managed.lock();

        let removed: Vec<String> = managed
            .iter()
            .filter(|id| !want.contains_key(*id))
            .cloned()
            .collect();
        for id in removed {
            tracing::info!(actor = %id, "unassigned, stopping");
            self.actors.stop_actor(&id);
            managed.remove(&id);
        }

        for (id, inst) in want {
            if managed.contains(&id) && self.actors.is_running(&id) {
                continue;
            }
            match self.actors.start_actor(&inst.def) {
                Ok(()) | Err(ActorError::AlreadyRunning(_)) => {
                    managed.insert(id);
                }
                Err(e) => {
                    tracing::error!(actor = %id, error = %e, "failed to start assigned actor");
                }
            }
        }
    }

    /// Leave the cluster: drain actors within the grace period, close the
    /// transport, and revoke the registry lease.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.actors.shutdown().await;
        self.mailbox_client.shutdown();
        self.server.shutdown();
        self.registry.stop().await;
        self.runtime.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(term: u64, version: u64) -> PeerState {
        PeerState {
            term,
            version,
            ..Default::default()
        }
    }

    #[test]
    fn test_accept_state_is_monotonic() {
        let current = state(2, 5);

        // Strictly newer version, same or newer term: accepted.
        assert!(accept_state(&current, &state(2, 6)));
        assert!(accept_state(&current, &state(3, 6)));

        // Version tie resolved by newer term.
        assert!(accept_state(&current, &state(3, 5)));
        assert!(!accept_state(&current, &state(2, 5)));

        // Anything older is rejected.
        assert!(!accept_state(&current, &state(2, 4)));
        assert!(!accept_state(&current, &state(1, 6)));
        assert!(!accept_state(&current, &state(1, 5)));
    }

    #[test]
    fn test_accepted_sequence_never_regresses() {
        let mut current = state(1, 1);
        let offered = [
            state(1, 2),
            state(1, 2), // duplicate, rejected
            state(2, 3),
            state(1, 4), // old term, rejected
            state(2, 4),
        ];
        for new in offered {
            if accept_state(&current, &new) {
                assert!(new.version >= current.version);
                assert!(new.term >= current.term);
                current = new;
            }
        }
        assert_eq!((current.term, current.version), (2, 4));
    }

    #[test]
    fn test_peer_state_json_round_trip() {
        let mut peers = BTreeMap::new();
        peers.insert("host-1-0".to_string(), Peer::new("host-1-0"));
        let state = PeerState {
            term: 3,
            version: 9,
            sched: PeerSched::new(),
            peers,
        };

        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"Term\""));
        assert!(json.contains("\"Version\""));

        let back: PeerState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
