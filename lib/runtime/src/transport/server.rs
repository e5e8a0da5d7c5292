// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The per-peer mailbox server.
//!
//! Accepts connections, decodes frames, and routes each request to the named
//! mailbox's bounded queue. A full queue is answered immediately with `Busy`;
//! the server never stalls on a slow consumer. Responses travel back over
//! the connection the request arrived on.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use super::{
    FrameCodec, FrameType, RequestEnvelope, ResponseEnvelope, ResponseStatus, TransportError,
};
use crate::mailbox::{codec, Request};
use crate::registry::RegistryError;
use crate::utils;

/// Capacity of each connection's outbound write queue.
const WRITE_QUEUE_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct MailboxServer {
    shared: Arc<ServerShared>,
}

struct ServerShared {
    local_addr: SocketAddr,
    mailboxes: DashMap<String, mpsc::Sender<Request>>,
    cancel: CancellationToken,
}

impl MailboxServer {
    /// Bind the listener and start accepting connections.
    pub async fn bind(addr: impl tokio::net::ToSocketAddrs) -> Result<MailboxServer, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(ServerShared {
            local_addr,
            mailboxes: DashMap::new(),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(accept_loop(listener, shared.clone()));

        tracing::info!(%local_addr, "mailbox server started");
        Ok(MailboxServer { shared })
    }

    /// The address peers should be told about.
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub(crate) fn bind_mailbox(
        &self,
        name: &str,
        tx: mpsc::Sender<Request>,
    ) -> Result<(), TransportError> {
        use dashmap::mapref::entry::Entry;
        match self.shared.mailboxes.entry(name.to_string()) {
            Entry::Occupied(_) => Err(TransportError::Registry(RegistryError::AlreadyRegistered)),
            Entry::Vacant(entry) => {
                entry.insert(tx);
                Ok(())
            }
        }
    }

    pub(crate) fn unbind_mailbox(&self, name: &str) {
        self.shared.mailboxes.remove(name);
    }

    /// Stop accepting connections and tear down connection tasks.
    pub fn shutdown(&self) {
        self.shared.cancel.cancel();
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<ServerShared>) {
    loop {
        let accepted = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "accepted connection");
                tokio::spawn(serve_connection(stream, shared.clone()));
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
            }
        }
    }
}

async fn serve_connection(stream: TcpStream, shared: Arc<ServerShared>) {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();

    let (writer_tx, writer_rx) = mpsc::channel::<Bytes>(WRITE_QUEUE_CAPACITY);
    let writer_task = tokio::spawn(write_loop(write_half, writer_rx));

    let mut frames = FramedRead::new(read_half, FrameCodec::new());
    loop {
        let next = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            next = frames.next() => next,
        };

        match next {
            Some(Ok((FrameType::Request, header, payload))) => {
                handle_request(&shared, &writer_tx, header, payload);
            }
            Some(Ok((FrameType::Response, _, _))) => {
                tracing::warn!("server received response frame, dropping");
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "connection framing error");
                break;
            }
            None => break,
        }
    }

    drop(writer_tx);
    let _ = writer_task.await;
}

async fn write_loop(mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = write_half.write_all(&bytes).await {
            tracing::debug!(error = %e, "connection write failed");
            return;
        }
    }
    let _ = write_half.shutdown().await;
}

fn handle_request(
    shared: &Arc<ServerShared>,
    writer_tx: &mpsc::Sender<Bytes>,
    header: Bytes,
    payload: Bytes,
) {
    let envelope: RequestEnvelope = match serde_json::from_slice(&header) {
        Ok(env) => env,
        Err(e) => {
            tracing::warn!(error = %e, "dropping request with unparsable envelope");
            return;
        }
    };

    let Some(binding) = shared.mailboxes.get(&envelope.receiver) else {
        reject(writer_tx, envelope.id, ResponseStatus::UnknownMailbox, None);
        return;
    };

    if !codec::is_registered(&envelope.type_name) {
        reject(
            writer_tx,
            envelope.id,
            ResponseStatus::UnregisteredMsgType,
            Some(envelope.type_name.clone()),
        );
        return;
    }

    let msg = match codec::decode_message(&envelope.type_name, &payload) {
        Ok(msg) => msg,
        Err(e) => {
            reject(
                writer_tx,
                envelope.id,
                ResponseStatus::Error,
                Some(e.to_string()),
            );
            return;
        }
    };

    let deadline = envelope.deadline_unix_nanos.map(|nanos| {
        let now = utils::unix_nanos();
        if nanos > now {
            Instant::now() + Duration::from_nanos((nanos - now) as u64)
        } else {
            Instant::now()
        }
    });

    let request = Request::new(
        msg,
        envelope.type_name,
        deadline,
        crate::mailbox::ReplyHandle {
            id: envelope.id,
            writer: writer_tx.clone(),
        },
    );

    match binding.try_send(request) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            reject(writer_tx, envelope.id, ResponseStatus::Busy, None);
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            reject(writer_tx, envelope.id, ResponseStatus::MailboxClosed, None);
        }
    }
}

/// Write an error-ish response without blocking the read loop. If the write
/// queue itself is full the caller will hit its deadline instead.
fn reject(
    writer_tx: &mpsc::Sender<Bytes>,
    id: u64,
    status: ResponseStatus,
    error: Option<String>,
) {
    let envelope = ResponseEnvelope {
        id,
        status,
        type_name: None,
        error,
    };
    let header = match serde_json::to_vec(&envelope) {
        Ok(h) => h,
        Err(_) => return,
    };
    let mut buf = BytesMut::new();
    if FrameCodec::encode_frame(&mut buf, FrameType::Response, &header, &[]).is_err() {
        return;
    }
    if writer_tx.try_send(buf.freeze()).is_err() {
        tracing::debug!(id, ?status, "dropping rejection, write queue full");
    }
}
