// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end mailbox transport tests over loopback TCP, using a static
//! directory so no coordination store is needed.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use lattice_runtime::config::RuntimeConfig;
use lattice_runtime::mailbox::{register_message, Mailbox};
use lattice_runtime::registry::{Directory, RegistryError, StaticDirectory};
use lattice_runtime::transport::{
    BufferedSender, MailboxClient, MailboxServer, TransportError,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct EchoMsg {
    seq: u64,
    body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct EchoReply {
    seq: u64,
}

static REGISTER: std::sync::Once = std::sync::Once::new();

fn register_codecs() {
    REGISTER.call_once(|| {
        register_message::<EchoMsg>("EchoMsg").unwrap();
        register_message::<EchoReply>("EchoReply").unwrap();
    });
}

async fn setup() -> (MailboxServer, Arc<StaticDirectory>, Arc<MailboxClient>) {
    register_codecs();
    let server = MailboxServer::bind("127.0.0.1:0").await.unwrap();
    let directory = Arc::new(StaticDirectory::new(server.local_addr().to_string()));
    let client = Arc::new(MailboxClient::new(
        directory.clone(),
        RuntimeConfig::default(),
    ));
    (server, directory, client)
}

fn echo(seq: u64) -> EchoMsg {
    EchoMsg {
        seq,
        body: "hello".to_string(),
    }
}

#[tokio::test]
async fn test_request_response_round_trip() {
    let (server, directory, client) = setup().await;

    let mut mailbox = Mailbox::new(directory, &server, "echo", 16).await.unwrap();
    tokio::spawn(async move {
        while let Some(req) = mailbox.recv().await {
            let seq = req.msg_as::<EchoMsg>().unwrap().seq;
            req.respond(&EchoReply { seq }).await.unwrap();
        }
    });

    let reply = client.request("echo", &echo(7)).await.unwrap();
    assert!(!reply.is_ack());
    assert_eq!(reply.msg_as::<EchoReply>().unwrap().seq, 7);
}

#[tokio::test]
async fn test_ack_and_second_completion_rejected() {
    let (server, directory, client) = setup().await;

    let mut mailbox = Mailbox::new(directory, &server, "acker", 16).await.unwrap();
    let (verdict_tx, verdict_rx) = oneshot::channel();
    tokio::spawn(async move {
        let req = mailbox.recv().await.unwrap();
        req.ack().await.unwrap();
        // Second completion must lose.
        let second = req.respond(&EchoReply { seq: 0 }).await;
        let _ = verdict_tx.send(matches!(
            second,
            Err(TransportError::AlreadyResponded)
        ));
    });

    let reply = client.request("acker", &echo(1)).await.unwrap();
    assert!(reply.is_ack());
    assert!(verdict_rx.await.unwrap());
}

#[tokio::test]
async fn test_full_queue_returns_busy() {
    let (server, directory, client) = setup().await;

    // Capacity one and nobody draining: the first request parks in the
    // queue, the second is rejected immediately.
    let _mailbox = Mailbox::new(directory, &server, "jammed", 1).await.unwrap();

    let first_client = client.clone();
    let first = tokio::spawn(async move {
        first_client
            .request_timeout("jammed", &echo(1), Duration::from_millis(300))
            .await
    });

    // Let the first request land.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = client.request("jammed", &echo(2)).await.unwrap_err();
    assert!(matches!(err, TransportError::Busy));

    let first_outcome = first.await.unwrap();
    assert!(matches!(first_outcome, Err(TransportError::Timeout)));
}

#[tokio::test]
async fn test_unknown_mailbox() {
    let (server, directory, client) = setup().await;

    // The directory knows the name but no mailbox is bound to it.
    directory.insert("ghost", server.local_addr().to_string());

    let err = client.request("ghost", &echo(1)).await.unwrap_err();
    assert!(matches!(err, TransportError::UnknownMailbox(_)));
}

#[tokio::test]
async fn test_closed_mailbox_is_deregistered() {
    let (server, directory, client) = setup().await;

    let mailbox = Mailbox::new(directory, &server, "closing", 4).await.unwrap();
    mailbox.close().await.unwrap();

    let err = client.request("closing", &echo(1)).await.unwrap_err();
    assert!(matches!(
        err,
        TransportError::Registry(RegistryError::NotFound)
    ));
}

#[tokio::test]
async fn test_dropped_mailbox_is_deregistered() {
    let (server, directory, client) = setup().await;

    {
        let _mailbox = Mailbox::new(directory.clone(), &server, "dropped", 4)
            .await
            .unwrap();
        // Dropped without close(), as a panicking or descheduled actor
        // would.
    }

    // Drop deregisters on a background task; poll until the name is gone.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    loop {
        if directory.lookup("dropped").await.is_err() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "dropped mailbox never deregistered"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let err = client.request("dropped", &echo(1)).await.unwrap_err();
    assert!(matches!(
        err,
        TransportError::Registry(RegistryError::NotFound)
    ));
}

#[tokio::test]
async fn test_silent_handler_times_out() {
    let (server, directory, client) = setup().await;

    let mut mailbox = Mailbox::new(directory, &server, "silent", 4).await.unwrap();
    tokio::spawn(async move {
        while let Some(req) = mailbox.recv().await {
            // Dropping the request without completing it sends nothing.
            drop(req);
        }
    });

    let err = client
        .request_timeout("silent", &echo(1), Duration::from_millis(150))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Timeout));
}

#[tokio::test]
async fn test_duplicate_name_rejected() {
    let (server, directory, client) = setup().await;
    drop(client);

    let _first = Mailbox::new(directory.clone(), &server, "dup", 4)
        .await
        .unwrap();
    let err = Mailbox::new(directory, &server, "dup", 4).await.unwrap_err();
    assert!(matches!(
        err,
        TransportError::Registry(RegistryError::AlreadyRegistered)
    ));
}

#[tokio::test]
async fn test_buffered_send_flush_preserves_order() {
    let (server, directory, client) = setup().await;

    let mut mailbox = Mailbox::new(directory, &server, "sink", 100).await.unwrap();
    let (seen_tx, mut seen_rx) = mpsc::channel(100);
    tokio::spawn(async move {
        while let Some(req) = mailbox.recv().await {
            let seq = req.msg_as::<EchoMsg>().unwrap().seq;
            let _ = seen_tx.send(seq).await;
            let _ = req.ack().await;
        }
    });

    let buffered = BufferedSender::new(client, "sink").await.unwrap();
    buffered.send(&echo(1)).await.unwrap();
    buffered.send(&echo(2)).await.unwrap();
    buffered.send(&echo(3)).await.unwrap();
    buffered.flush().await.unwrap();

    for want in 1..=3u64 {
        let got = tokio::time::timeout(Duration::from_secs(1), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, want);
    }
}

#[tokio::test]
async fn test_buffered_send_flushes_on_byte_threshold() {
    let (server, directory, client) = setup().await;

    let mut mailbox = Mailbox::new(directory, &server, "bulk", 100).await.unwrap();
    let (seen_tx, mut seen_rx) = mpsc::channel(10);
    tokio::spawn(async move {
        while let Some(req) = mailbox.recv().await {
            let seq = req.msg_as::<EchoMsg>().unwrap().seq;
            let _ = seen_tx.send(seq).await;
        }
    });

    let buffered = BufferedSender::new(client, "bulk").await.unwrap();
    // One message larger than the byte threshold flushes on its own, with
    // no explicit flush call.
    let big = EchoMsg {
        seq: 9,
        body: "x".repeat(4096),
    };
    buffered.send(&big).await.unwrap();

    let got = tokio::time::timeout(Duration::from_secs(1), seen_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, 9);
}

#[tokio::test]
async fn test_buffered_send_flushes_on_time_threshold() {
    let (server, directory, client) = setup().await;

    let mut mailbox = Mailbox::new(directory, &server, "drip", 100).await.unwrap();
    let (seen_tx, mut seen_rx) = mpsc::channel(10);
    tokio::spawn(async move {
        while let Some(req) = mailbox.recv().await {
            let seq = req.msg_as::<EchoMsg>().unwrap().seq;
            let _ = seen_tx.send(seq).await;
        }
    });

    let buffered = BufferedSender::new(client, "drip").await.unwrap();
    // Small message, no flush: the 50ms timer must emit it.
    buffered.send(&echo(5)).await.unwrap();

    let got = tokio::time::timeout(Duration::from_secs(1), seen_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, 5);
}
