// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Batched fire-and-forget sends.
//!
//! Small messages bound for one target are coalesced into a single write,
//! flushed when the buffer crosses a soft byte threshold, when it has aged
//! past a soft time threshold, or on an explicit [`BufferedSender::flush`].
//! Frames are self-delimiting, so batching is pure write coalescing and
//! per-target FIFO order is preserved.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::client::MailboxClient;
use super::{FrameCodec, FrameType, RequestEnvelope, TransportError};
use crate::mailbox::codec;

pub struct BufferedSender {
    target: String,
    address: String,
    client: Arc<MailboxClient>,
    buf: Arc<Mutex<BytesMut>>,
    batch_bytes: usize,
    cancel: CancellationToken,
}

impl BufferedSender {
    /// Resolve `target` and start the background flusher.
    pub async fn new(
        client: Arc<MailboxClient>,
        target: impl Into<String>,
    ) -> Result<BufferedSender, TransportError> {
        let target = target.into();
        let address = client.resolve_address(&target).await?;

        let batch_bytes = client.config().batch_bytes;
        let batch_delay = client.config().batch_delay;

        let buf = Arc::new(Mutex::new(BytesMut::new()));
        let cancel = CancellationToken::new();

        // Time-threshold flusher.
        {
            let buf = buf.clone();
            let client = client.clone();
            let address = address.clone();
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(batch_delay);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    if let Err(e) = flush_buffer(&client, &address, &buf).await {
                        tracing::debug!(error = %e, "buffered flush failed");
                    }
                }
            });
        }

        Ok(BufferedSender {
            target,
            address,
            client,
            buf,
            batch_bytes,
            cancel,
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Queue `msg` for the target. No completion is awaited; a remote ack,
    /// if any, is dropped on arrival.
    pub async fn send<T: serde::Serialize + 'static>(&self, msg: &T) -> Result<(), TransportError> {
        let (type_name, payload) = codec::encode_message(msg)?;
        let envelope = RequestEnvelope {
            id: self.client.next_request_id(),
            receiver: self.target.clone(),
            type_name,
            deadline_unix_nanos: None,
        };
        let header = serde_json::to_vec(&envelope)?;

        let should_flush = {
            let mut buf = self.buf.lock().await;
            FrameCodec::encode_frame(&mut buf, FrameType::Request, &header, &payload)?;
            buf.len() >= self.batch_bytes
        };

        if should_flush {
            self.flush().await?;
        }
        Ok(())
    }

    /// Force emission of everything queued.
    pub async fn flush(&self) -> Result<(), TransportError> {
        flush_buffer(&self.client, &self.address, &self.buf).await
    }

    /// Flush and stop the background flusher.
    pub async fn close(self) -> Result<(), TransportError> {
        self.cancel.cancel();
        self.flush().await
    }
}

impl Drop for BufferedSender {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn flush_buffer(
    client: &MailboxClient,
    address: &str,
    buf: &Mutex<BytesMut>,
) -> Result<(), TransportError> {
    // Hold the lock across the write handoff so concurrent flushes cannot
    // reorder batches.
    let mut buf = buf.lock().await;
    if buf.is_empty() {
        return Ok(());
    }
    let bytes = buf.split().freeze();
    let conn = client.connection(address).await?;
    conn.writer
        .send(bytes)
        .await
        .map_err(|_| TransportError::Disconnected)
}
