// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Actor definition, startup, and local supervision.
//!
//! An [`Actor`]'s `act` runs on a dedicated task and returns whether it wants
//! to be restarted. Panics are caught and treated as restarts, with
//! exponential backoff. The runtime guarantees at most one instance of a
//! given [`ActorDef::id`] per peer; cross-peer uniqueness comes from the
//! manager's scheduling plus the registry's unique-name constraint on the
//! actor's mailbox.
//!
//! Applications typically layer a small state machine over `act`: states like
//! Starting/Running/Finishing driven by cohort conditions, with the `exit`
//! token wired to the Exit letter and unrecoverable errors to Failure. A
//! terminal "do not restart" state maps to returning `false`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::conditions::{CountWatch, Join, NameWatch, State};
use crate::config::RuntimeConfig;
use crate::mailbox::Mailbox;
use crate::registry::Registry;
use crate::transport::{MailboxClient, MailboxServer, TransportError};

/// A deployable actor specification. `id()` is the scheduling identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorDef {
    #[serde(rename = "Type")]
    pub actor_type: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Settings", default)]
    pub settings: HashMap<String, String>,
}

impl ActorDef {
    pub fn new(actor_type: impl Into<String>, name: impl Into<String>) -> ActorDef {
        ActorDef {
            actor_type: actor_type.into(),
            name: name.into(),
            settings: HashMap::new(),
        }
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> ActorDef {
        self.settings.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> String {
        format!("{}/{}", self.actor_type, self.name)
    }
}

/// A long-lived unit of computation.
#[async_trait]
pub trait Actor: Send {
    /// Run until done or told to exit. Return `true` to be restarted.
    async fn act(&mut self, ctx: ActorContext, exit: CancellationToken) -> bool;
}

/// Builds a fresh actor instance for each (re)start.
pub type ActorFactory = Arc<dyn Fn(&ActorDef) -> anyhow::Result<Box<dyn Actor>> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum ActorError {
    #[error("unknown actor type: {0}")]
    UnknownType(String),

    #[error("actor type already registered: {0}")]
    DuplicateType(String),

    #[error("actor already running: {0}")]
    AlreadyRunning(String),
}

/// The capability bag handed to an actor: mailbox construction, the
/// registry, the conditions library, and the process-wide context. Actors
/// never own these; closure is driven by the runtime.
#[derive(Clone)]
pub struct ActorContext {
    grid: String,
    peer_name: String,
    config: RuntimeConfig,
    cancel: CancellationToken,
    registry: Option<Arc<Registry>>,
    server: Option<MailboxServer>,
    client: Option<Arc<MailboxClient>>,
    etcd: Option<etcd_client::Client>,
}

impl ActorContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        grid: impl Into<String>,
        peer_name: impl Into<String>,
        config: RuntimeConfig,
        cancel: CancellationToken,
        registry: Arc<Registry>,
        server: MailboxServer,
        client: Arc<MailboxClient>,
        etcd: etcd_client::Client,
    ) -> ActorContext {
        ActorContext {
            grid: grid.into(),
            peer_name: peer_name.into(),
            config,
            cancel,
            registry: Some(registry),
            server: Some(server),
            client: Some(client),
            etcd: Some(etcd),
        }
    }

    /// A context without cluster capabilities, for actors that only compute
    /// locally. Mailbox, registry, and condition accessors fail on it.
    pub fn standalone(
        grid: impl Into<String>,
        peer_name: impl Into<String>,
        config: RuntimeConfig,
    ) -> ActorContext {
        ActorContext {
            grid: grid.into(),
            peer_name: peer_name.into(),
            config,
            cancel: CancellationToken::new(),
            registry: None,
            server: None,
            client: None,
            etcd: None,
        }
    }

    pub fn grid(&self) -> &str {
        &self.grid
    }

    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Child token tied to the process-wide shutdown.
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    pub fn registry(&self) -> anyhow::Result<Arc<Registry>> {
        self.registry
            .clone()
            .ok_or_else(|| crate::error!("no registry on standalone actor context"))
    }

    pub fn client(&self) -> anyhow::Result<Arc<MailboxClient>> {
        self.client
            .clone()
            .ok_or_else(|| crate::error!("no transport client on standalone actor context"))
    }

    fn etcd(&self) -> anyhow::Result<etcd_client::Client> {
        self.etcd
            .clone()
            .ok_or_else(|| crate::error!("no kv client on standalone actor context"))
    }

    /// Create a named mailbox on this peer.
    pub async fn mailbox(
        &self,
        name: impl Into<String>,
        capacity: usize,
    ) -> Result<Mailbox, TransportError> {
        let (Some(registry), Some(server)) = (self.registry.clone(), self.server.as_ref()) else {
            return Err(TransportError::Remote(
                "no mailbox server on standalone actor context".to_string(),
            ));
        };
        Mailbox::new(registry, server, name, capacity).await
    }

    pub fn join(&self, ttl: Duration, parts: &[&str]) -> anyhow::Result<Join> {
        Ok(Join::new(self.etcd()?, ttl, parts))
    }

    pub fn count_watch(&self, parts: &[&str]) -> anyhow::Result<CountWatch> {
        Ok(CountWatch::new(self.etcd()?, parts))
    }

    pub fn name_watch(&self, parts: &[&str]) -> anyhow::Result<NameWatch> {
        Ok(NameWatch::new(self.etcd()?, parts))
    }

    pub fn state(&self, ttl: Duration, parts: &[&str]) -> anyhow::Result<State> {
        Ok(State::new(self.etcd()?, ttl, parts))
    }
}

struct ActorHandle {
    exit: CancellationToken,
    join: tokio::task::JoinHandle<()>,
}

/// Starts actors from registered factories and supervises them.
pub struct ActorRuntime {
    ctx: ActorContext,
    config: RuntimeConfig,
    factories: RwLock<HashMap<String, ActorFactory>>,
    running: Arc<DashMap<String, ActorHandle>>,
}

impl ActorRuntime {
    pub fn new(ctx: ActorContext, config: RuntimeConfig) -> ActorRuntime {
        ActorRuntime {
            ctx,
            config,
            factories: RwLock::new(HashMap::new()),
            running: Arc::new(DashMap::new()),
        }
    }

    /// Register the factory for an actor type. Write-once per type.
    pub fn register_actor(
        &self,
        actor_type: impl Into<String>,
        factory: ActorFactory,
    ) -> Result<(), ActorError> {
        let actor_type = actor_type.into();
        let mut factories = self.factories.write();
        if factories.contains_key(&actor_type) {
            return Err(ActorError::DuplicateType(actor_type));
        }
        factories.insert(actor_type, factory);
        Ok(())
    }

    /// Start an actor from its definition on a dedicated task.
    pub fn start_actor(&self, def: &ActorDef) -> Result<(), ActorError> {
        let factory = self
            .factories
            .read()
            .get(&def.actor_type)
            .cloned()
            .ok_or_else(|| ActorError::UnknownType(def.actor_type.clone()))?;

        let id = def.id();

        use dashmap::mapref::entry::Entry;
        let entry = match self.running.entry(id.clone()) {
            Entry::Occupied(_) => return Err(ActorError::AlreadyRunning(id)),
            Entry::Vacant(entry) => entry,
        };

        let exit = CancellationToken::new();
        let join = tokio::spawn(supervise(
            def.clone(),
            factory,
            self.ctx.clone(),
            self.config.clone(),
            exit.clone(),
            self.running.clone(),
        ));

        entry.insert(ActorHandle { exit, join });
        tracing::info!(actor = %id, "actor started");
        Ok(())
    }

    /// Signal an actor's exit token. Returns false if it was not running.
    pub fn stop_actor(&self, id: &str) -> bool {
        match self.running.get(id) {
            Some(handle) => {
                handle.exit.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.running.contains_key(id)
    }

    pub fn running_ids(&self) -> Vec<String> {
        self.running.iter().map(|e| e.key().clone()).collect()
    }

    /// Signal every actor's exit token, wait up to the grace period, then
    /// forcibly cancel what remains.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.running_ids();
        let mut handles = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, handle)) = self.running.remove(&id) {
                handle.exit.cancel();
                handles.push(handle.join);
            }
        }

        let drained = tokio::time::timeout(
            self.config.shutdown_grace,
            futures::future::join_all(handles.iter_mut()),
        )
        .await;

        if drained.is_err() {
            tracing::warn!("grace period elapsed, aborting remaining actors");
            for handle in &handles {
                handle.abort();
            }
        }
    }
}

async fn supervise(
    def: ActorDef,
    factory: ActorFactory,
    ctx: ActorContext,
    config: RuntimeConfig,
    exit: CancellationToken,
    running: Arc<DashMap<String, ActorHandle>>,
) {
    let id = def.id();
    let mut backoff = config.restart_backoff_initial;

    loop {
        let mut actor = match factory(&def) {
            Ok(actor) => actor,
            Err(e) => {
                tracing::error!(actor = %id, error = %e, "actor factory failed");
                break;
            }
        };

        let started = Instant::now();
        let act_ctx = ctx.clone();
        let act_exit = exit.clone();
        let task = tokio::spawn(async move { actor.act(act_ctx, act_exit).await });

        let restart = match task.await {
            Ok(restart) => restart,
            Err(e) if e.is_panic() => {
                tracing::error!(actor = %id, "actor panicked, treating as restart");
                true
            }
            Err(_) => false,
        };

        if !restart || exit.is_cancelled() {
            break;
        }

        // A run that outlived the backoff cap counts as healthy.
        if started.elapsed() > config.restart_backoff_max {
            backoff = config.restart_backoff_initial;
        }
        tracing::info!(actor = %id, backoff = ?backoff, "restarting actor");

        tokio::select! {
            _ = exit.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(config.restart_backoff_max);
    }

    running.remove(&id);
    tracing::info!(actor = %id, "actor finished");
}
