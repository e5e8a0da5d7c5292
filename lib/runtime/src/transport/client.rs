// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Client side of the mailbox transport.
//!
//! Targets are resolved by name through the registry, with a lookup cache
//! whose TTL is bounded by one lease duration. One connection is kept per
//! target address; requests are correlated to responses by id through a
//! pending table completed by the connection's reader task.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use super::{
    FrameCodec, FrameType, RequestEnvelope, ResponseEnvelope, ResponseStatus, TransportError, ACK,
};
use crate::config::RuntimeConfig;
use crate::mailbox::codec;
use crate::registry::{Directory, Registration};
use crate::utils;

/// Capacity of each connection's outbound write queue.
const WRITE_QUEUE_CAPACITY: usize = 256;

/// Successful completion of a request.
pub enum Reply {
    /// The handler acked: success with no response body.
    Ack,
    /// A typed response.
    Msg {
        type_name: String,
        msg: Box<dyn Any + Send + Sync>,
    },
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reply::Ack => f.debug_struct("Ack").finish(),
            Reply::Msg { type_name, .. } => {
                f.debug_struct("Msg").field("type_name", type_name).finish()
            }
        }
    }
}

impl Reply {
    pub fn is_ack(&self) -> bool {
        matches!(self, Reply::Ack)
    }

    pub fn msg_as<T: 'static>(&self) -> Option<&T> {
        match self {
            Reply::Ack => None,
            Reply::Msg { msg, .. } => msg.downcast_ref::<T>(),
        }
    }
}

type PendingTable = Arc<DashMap<u64, oneshot::Sender<Result<Reply, TransportError>>>>;

#[derive(Clone)]
pub(crate) struct ConnectionHandle {
    pub(crate) writer: mpsc::Sender<Bytes>,
    pending: PendingTable,
}

struct CachedLookup {
    reg: Registration,
    at: Instant,
}

/// Sends requests to named mailboxes anywhere in the cluster.
pub struct MailboxClient {
    directory: Arc<dyn Directory>,
    config: RuntimeConfig,
    connections: DashMap<String, ConnectionHandle>,
    cache: DashMap<String, CachedLookup>,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

impl MailboxClient {
    pub fn new(directory: Arc<dyn Directory>, config: RuntimeConfig) -> MailboxClient {
        MailboxClient {
            directory,
            config,
            connections: DashMap::new(),
            cache: DashMap::new(),
            next_id: AtomicU64::new(1),
            cancel: CancellationToken::new(),
        }
    }

    /// Send `msg` to the mailbox named `target` and wait for its completion,
    /// using the configured default timeout.
    pub async fn request<T: serde::Serialize + 'static>(
        &self,
        target: &str,
        msg: &T,
    ) -> Result<Reply, TransportError> {
        self.request_timeout(target, msg, self.config.request_timeout)
            .await
    }

    /// Send `msg` to `target` with an explicit deadline. The deadline rides
    /// the wire so the responder can drop late replies; locally it unblocks
    /// this caller the moment it fires.
    pub async fn request_timeout<T: serde::Serialize + 'static>(
        &self,
        target: &str,
        msg: &T,
        timeout: std::time::Duration,
    ) -> Result<Reply, TransportError> {
        // Serialize in the caller's context so codec errors surface here.
        let (type_name, payload) = codec::encode_message(msg)?;

        let reg = self.resolve(target).await?;
        let conn = self.connection(&reg.address).await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = RequestEnvelope {
            id,
            receiver: target.to_string(),
            type_name,
            deadline_unix_nanos: Some(utils::unix_nanos() + timeout.as_nanos() as i64),
        };
        let header = serde_json::to_vec(&envelope)?;
        let mut buf = BytesMut::new();
        FrameCodec::encode_frame(&mut buf, FrameType::Request, &header, &payload)?;

        let (tx, rx) = oneshot::channel();
        conn.pending.insert(id, tx);

        if conn.writer.send(buf.freeze()).await.is_err() {
            conn.pending.remove(&id);
            self.drop_target(target, &reg.address);
            return Err(TransportError::Disconnected);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => {
                if matches!(outcome, Err(TransportError::Disconnected)) {
                    self.drop_target(target, &reg.address);
                }
                outcome
            }
            Ok(Err(_)) => {
                self.drop_target(target, &reg.address);
                Err(TransportError::Disconnected)
            }
            Err(_) => {
                // Late responses find no pending entry and are dropped.
                conn.pending.remove(&id);
                Err(TransportError::Timeout)
            }
        }
    }

    /// Resolve a mailbox name to its registration, consulting the cache
    /// first. Cache entries older than one lease duration trigger a fresh
    /// lookup.
    async fn resolve(&self, target: &str) -> Result<Registration, TransportError> {
        if let Some(cached) = self.cache.get(target) {
            if cached.at.elapsed() < self.config.lease_duration {
                return Ok(cached.reg.clone());
            }
        }

        let reg = self.directory.lookup(target).await?;
        self.cache.insert(
            target.to_string(),
            CachedLookup {
                reg: reg.clone(),
                at: Instant::now(),
            },
        );
        Ok(reg)
    }

    /// Forget a target whose connection failed; the next request does a
    /// fresh registry lookup.
    fn drop_target(&self, target: &str, address: &str) {
        self.cache.remove(target);
        self.connections.remove(address);
    }

    pub(crate) async fn connection(
        &self,
        address: &str,
    ) -> Result<ConnectionHandle, TransportError> {
        if let Some(conn) = self.connections.get(address) {
            return Ok(conn.clone());
        }

        let stream = TcpStream::connect(address).await?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let (writer_tx, mut writer_rx) = mpsc::channel::<Bytes>(WRITE_QUEUE_CAPACITY);
        let pending: PendingTable = Arc::new(DashMap::new());

        let handle = ConnectionHandle {
            writer: writer_tx,
            pending: pending.clone(),
        };
        self.connections.insert(address.to_string(), handle.clone());

        tokio::spawn(async move {
            let mut write_half = write_half;
            while let Some(bytes) = writer_rx.recv().await {
                if let Err(e) = write_half.write_all(&bytes).await {
                    tracing::debug!(error = %e, "connection write failed");
                    return;
                }
            }
            let _ = write_half.shutdown().await;
        });

        let cancel = self.cancel.child_token();
        let address_owned = address.to_string();
        tokio::spawn(read_loop(read_half, pending, address_owned, cancel));

        tracing::debug!(%address, "connected");
        Ok(handle)
    }

    /// Tear down every connection; in-flight requests fail with
    /// `Disconnected`.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.connections.clear();
        self.cache.clear();
    }

    pub(crate) fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub(crate) fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) async fn resolve_address(&self, target: &str) -> Result<String, TransportError> {
        Ok(self.resolve(target).await?.address)
    }
}

async fn read_loop(
    read_half: tokio::net::tcp::OwnedReadHalf,
    pending: PendingTable,
    address: String,
    cancel: CancellationToken,
) {
    let mut frames = FramedRead::new(read_half, FrameCodec::new());

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = frames.next() => next,
        };

        match next {
            Some(Ok((FrameType::Response, header, payload))) => {
                complete_response(&pending, header, payload);
            }
            Some(Ok((FrameType::Request, _, _))) => {
                tracing::warn!(%address, "client received request frame, dropping");
            }
            Some(Err(e)) => {
                tracing::debug!(%address, error = %e, "connection framing error");
                break;
            }
            None => break,
        }
    }

    // Fail whatever is still in flight on this connection.
    let ids: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        if let Some((_, tx)) = pending.remove(&id) {
            let _ = tx.send(Err(TransportError::Disconnected));
        }
    }
}

fn complete_response(pending: &PendingTable, header: Bytes, payload: Bytes) {
    let envelope: ResponseEnvelope = match serde_json::from_slice(&header) {
        Ok(env) => env,
        Err(e) => {
            tracing::warn!(error = %e, "dropping response with unparsable envelope");
            return;
        }
    };

    let Some((_, tx)) = pending.remove(&envelope.id) else {
        // Timed out, cancelled, or a fire-and-forget send; drop it.
        tracing::debug!(id = envelope.id, "no pending request for response");
        return;
    };

    let outcome = match envelope.status {
        ResponseStatus::Ack => Ok(Reply::Ack),
        ResponseStatus::Ok => match envelope.type_name {
            Some(name) if name == ACK => Ok(Reply::Ack),
            Some(name) => codec::decode_message(&name, &payload).map(|msg| Reply::Msg {
                type_name: name,
                msg,
            }),
            None => Err(TransportError::Remote("response without type name".into())),
        },
        ResponseStatus::Busy => Err(TransportError::Busy),
        ResponseStatus::MailboxClosed => Err(TransportError::MailboxClosed),
        ResponseStatus::UnknownMailbox => Err(TransportError::UnknownMailbox(
            envelope.error.unwrap_or_default(),
        )),
        ResponseStatus::UnregisteredMsgType => Err(TransportError::UnregisteredMsgType(
            envelope.error.unwrap_or_default(),
        )),
        ResponseStatus::Error => Err(TransportError::Remote(
            envelope.error.unwrap_or_else(|| "unknown".to_string()),
        )),
    };

    let _ = tx.send(outcome);
}
