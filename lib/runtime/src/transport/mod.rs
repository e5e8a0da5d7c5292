// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Directory-driven request/response transport.
//!
//! Frames travel over plain TCP between peers. A frame's header is a small
//! JSON envelope; its payload is opaque codec-owned bytes. The
//! [`MailboxServer`] accepts frames addressed to named mailboxes on this
//! peer; the [`MailboxClient`] resolves names through the registry and keeps
//! one connection per target address.

mod buffered;
mod client;
mod frame;
mod server;

pub use buffered::BufferedSender;
pub use client::{MailboxClient, Reply};
pub use frame::FrameCodec;
pub use server::MailboxServer;

use serde::{Deserialize, Serialize};

/// Reserved type-name distinguishing an ack from a typed payload on the wire.
pub const ACK: &str = "__ACK__";

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("already responded")]
    AlreadyResponded,

    #[error("unregistered message type: {0}")]
    UnregisteredMsgType(String),

    #[error("message type already registered: {0}")]
    DuplicateMsgType(String),

    /// The target mailbox's inbound queue was full; retriable.
    #[error("mailbox busy")]
    Busy,

    #[error("mailbox closed")]
    MailboxClosed,

    #[error("unknown mailbox: {0}")]
    UnknownMailbox(String),

    #[error("request timeout")]
    Timeout,

    #[error("connection closed")]
    Disconnected,

    #[error("remote failure: {0}")]
    Remote(String),

    #[error("registry: {0}")]
    Registry(#[from] crate::registry::RegistryError),

    #[error("envelope encoding: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Frame discriminator for routing on the receive side.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Request = 0,
    Response = 1,
}

impl FrameType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(FrameType::Request),
            1 => Some(FrameType::Response),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Envelope of a request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    /// Name of the destination mailbox on the receiving peer.
    pub receiver: String,
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_unix_nanos: Option<i64>,
}

/// Completion status carried by a response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Ok,
    Ack,
    Busy,
    UnknownMailbox,
    MailboxClosed,
    UnregisteredMsgType,
    Error,
}

/// Envelope of a response frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: u64,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_round_trip() {
        for t in [FrameType::Request, FrameType::Response] {
            assert_eq!(FrameType::from_u8(t.as_u8()), Some(t));
        }
        assert_eq!(FrameType::from_u8(255), None);
    }

    #[test]
    fn test_envelope_json_shape() {
        let env = RequestEnvelope {
            id: 7,
            receiver: "consumer-0".to_string(),
            type_name: "DataMsg".to_string(),
            deadline_unix_nanos: None,
        };
        let json = serde_json::to_string(&env).unwrap();
        // Absent deadline is omitted entirely.
        assert!(!json.contains("deadline_unix_nanos"));

        let resp = ResponseEnvelope {
            id: 7,
            status: ResponseStatus::Ack,
            type_name: None,
            error: None,
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"ack\""));
    }
}
