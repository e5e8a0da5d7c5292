// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Named receive endpoints.
//!
//! A [`Mailbox`] is a name registered in the registry, bound to this peer's
//! mailbox server, with a bounded inbound queue drained by exactly one
//! consumer. Each inbound [`Request`] must be completed exactly once with
//! `respond`, `ack`, or `fail`.
//!
//! Closing a mailbox deregisters its name. That holds for the implicit path
//! too: dropping a mailbox without calling [`Mailbox::close`] unbinds it
//! from the server immediately and deregisters the name on a background
//! task, so an actor that exits or restarts never leaves its name behind.

pub mod codec;

use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::registry::{Directory, RegistryError};
use crate::transport::{
    FrameCodec, FrameType, MailboxServer, ResponseEnvelope, ResponseStatus, TransportError, ACK,
};

pub use codec::register_message;

/// A unit of work delivered to a mailbox. Carries the decoded message, the
/// caller's deadline, and a one-shot reply slot.
pub struct Request {
    msg: Box<dyn Any + Send + Sync>,
    type_name: String,
    deadline: Option<Instant>,
    reply: Mutex<Option<ReplyHandle>>,
}

pub(crate) struct ReplyHandle {
    pub(crate) id: u64,
    pub(crate) writer: mpsc::Sender<Bytes>,
}

impl Request {
    pub(crate) fn new(
        msg: Box<dyn Any + Send + Sync>,
        type_name: String,
        deadline: Option<Instant>,
        reply: ReplyHandle,
    ) -> Request {
        Request {
            msg,
            type_name,
            deadline,
            reply: Mutex::new(Some(reply)),
        }
    }

    /// The decoded message. Branch on [`Request::type_name`] or downcast.
    pub fn msg(&self) -> &(dyn Any + Send + Sync) {
        self.msg.as_ref()
    }

    /// Downcast the message to a concrete registered type.
    pub fn msg_as<T: 'static>(&self) -> Option<&T> {
        self.msg.downcast_ref::<T>()
    }

    /// Wire name of the message type.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The caller's deadline, if it sent one.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Complete with a typed response. The first completion wins; later
    /// calls return `AlreadyResponded`. Serialization happens here, in the
    /// responder's context, so codec errors surface synchronously.
    pub async fn respond<T: serde::Serialize + 'static>(
        &self,
        msg: &T,
    ) -> Result<(), TransportError> {
        let handle = self.take_reply()?;
        let (type_name, payload) = codec::encode_message(msg)?;
        self.send_response(
            handle,
            ResponseEnvelope {
                id: 0, // overwritten below
                status: ResponseStatus::Ok,
                type_name: Some(type_name),
                error: None,
            },
            &payload,
        )
        .await
    }

    /// Complete with an ack: success, no response body.
    pub async fn ack(&self) -> Result<(), TransportError> {
        let handle = self.take_reply()?;
        self.send_response(
            handle,
            ResponseEnvelope {
                id: 0,
                status: ResponseStatus::Ack,
                type_name: Some(ACK.to_string()),
                error: None,
            },
            &[],
        )
        .await
    }

    /// Complete with a remote failure delivered to the caller as an error,
    /// not a payload.
    pub async fn fail(&self, msg: impl Into<String>) -> Result<(), TransportError> {
        let handle = self.take_reply()?;
        self.send_response(
            handle,
            ResponseEnvelope {
                id: 0,
                status: ResponseStatus::Error,
                type_name: None,
                error: Some(msg.into()),
            },
            &[],
        )
        .await
    }

    fn take_reply(&self) -> Result<ReplyHandle, TransportError> {
        self.reply
            .lock()
            .take()
            .ok_or(TransportError::AlreadyResponded)
    }

    async fn send_response(
        &self,
        handle: ReplyHandle,
        mut envelope: ResponseEnvelope,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        // A response after the caller's deadline is dropped; the caller has
        // already unblocked.
        if let Some(deadline) = self.deadline {
            if Instant::now() > deadline {
                tracing::debug!(id = handle.id, "dropping response past deadline");
                return Ok(());
            }
        }

        envelope.id = handle.id;
        let header = serde_json::to_vec(&envelope)?;
        let mut buf = BytesMut::new();
        FrameCodec::encode_frame(&mut buf, FrameType::Response, &header, payload)?;

        handle
            .writer
            .send(buf.freeze())
            .await
            .map_err(|_| TransportError::Disconnected)
    }
}

/// A named receive endpoint on this peer.
pub struct Mailbox {
    name: String,
    capacity: usize,
    rx: mpsc::Receiver<Request>,
    directory: Arc<dyn Directory>,
    server: MailboxServer,
    closed: bool,
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Mailbox {
    /// Register `name` cluster-wide and bind it to this peer's server.
    /// Duplicate names fail with `AlreadyRegistered`.
    pub async fn new(
        directory: Arc<dyn Directory>,
        server: &MailboxServer,
        name: impl Into<String>,
        capacity: usize,
    ) -> Result<Mailbox, TransportError> {
        let name = name.into();

        directory.register(name.as_str()).await?;

        let (tx, rx) = mpsc::channel(capacity);
        if let Err(e) = server.bind_mailbox(&name, tx) {
            // Roll the registration back so the name is not orphaned.
            let _ = directory.deregister(name.as_str()).await;
            return Err(e);
        }

        Ok(Mailbox {
            name,
            capacity,
            rx,
            directory,
            server: server.clone(),
            closed: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Receive the next request. Returns `None` once the mailbox is closed
    /// and drained.
    pub async fn recv(&mut self) -> Option<Request> {
        self.rx.recv().await
    }

    /// Number of requests currently queued.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Deregister the name and stop accepting requests. In-flight senders
    /// see `MailboxClosed`.
    pub async fn close(mut self) -> Result<(), TransportError> {
        self.closed = true;
        self.server.unbind_mailbox(&self.name);
        match self.directory.deregister(self.name.as_str()).await {
            Ok(()) | Err(RegistryError::NotFound) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        if self.closed {
            return;
        }

        // An actor that panics, finishes, or is descheduled drops its
        // mailbox without calling close(). Stop the server routing to the
        // name immediately and deregister it in the background rather than
        // leaving the entry routable until the lease expires.
        self.server.unbind_mailbox(&self.name);

        let directory = self.directory.clone();
        let name = std::mem::take(&mut self.name);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match directory.deregister(&name).await {
                        Ok(()) | Err(RegistryError::NotFound) => {}
                        Err(e) => {
                            tracing::warn!(mailbox = %name, error = %e, "drop deregister failed")
                        }
                    }
                });
            }
            Err(_) => {
                // No runtime to run the deregistration on; lease expiry
                // reclaims the name.
                tracing::warn!(mailbox = %name, "dropped outside a runtime, name expires with lease");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_request(writer: mpsc::Sender<Bytes>) -> Request {
        Request::new(
            Box::new(42u64),
            "TestU64".to_string(),
            None,
            ReplyHandle { id: 1, writer },
        )
    }

    #[tokio::test]
    async fn test_ack_then_respond_is_already_responded() {
        let (tx, mut rx) = mpsc::channel(4);
        let req = test_request(tx);

        req.ack().await.unwrap();
        let err = req.ack().await.unwrap_err();
        assert!(matches!(err, TransportError::AlreadyResponded));

        // Exactly one frame went out.
        let frame = rx.recv().await.unwrap();
        assert!(!frame.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fail_wins_only_once() {
        let (tx, _rx) = mpsc::channel(4);
        let req = test_request(tx);

        req.fail("boom").await.unwrap();
        let err = req.fail("boom again").await.unwrap_err();
        assert!(matches!(err, TransportError::AlreadyResponded));
    }

    #[tokio::test]
    async fn test_respond_past_deadline_silently_drops() {
        let (tx, mut rx) = mpsc::channel(4);
        let req = Request::new(
            Box::new(1u64),
            "TestU64".to_string(),
            Some(Instant::now() - std::time::Duration::from_secs(1)),
            ReplyHandle { id: 9, writer: tx },
        );

        req.ack().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_msg_downcast() {
        let (tx, _rx) = mpsc::channel(1);
        let req = test_request(tx);
        assert_eq!(req.msg_as::<u64>(), Some(&42));
        assert_eq!(req.type_name(), "TestU64");
        assert!(req.msg_as::<String>().is_none());
    }
}
