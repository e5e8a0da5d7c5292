// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Zero-copy framing codec for the mailbox transport.
//!
//! Wire format (11 bytes overhead):
//! ```text
//! [u16 BE: schema_version][u8: frame_type][u32 BE: header_len][u32 BE: payload_len][header bytes][payload bytes]
//! ```
//!
//! The decoder keeps state across calls to support partial frames and yields
//! `(FrameType, header: Bytes, payload: Bytes)` where header and payload are
//! zero-copy slices of the receive buffer. Frames are self-delimiting, so any
//! number of them can be coalesced into a single write.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::Decoder;

use super::FrameType;

/// Current schema version
const SCHEMA_VERSION_V1: u16 = 1;

/// Maximum frame size (16 MB)
const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Preamble size (version + type + 2 lengths)
const PREAMBLE_SIZE: usize = 2 + 1 + 4 + 4;

#[derive(Debug, Clone)]
pub struct FrameCodec {
    state: DecodeState,
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    AwaitingPreamble,
    AwaitingData {
        frame_type: FrameType,
        header_len: u32,
        payload_len: u32,
    },
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            state: DecodeState::AwaitingPreamble,
        }
    }

    /// Append one encoded frame to `dst`.
    pub fn encode_frame(
        dst: &mut BytesMut,
        frame_type: FrameType,
        header: &[u8],
        payload: &[u8],
    ) -> io::Result<()> {
        Self::validate_lengths(header.len() as u32, payload.len() as u32)?;

        dst.reserve(PREAMBLE_SIZE + header.len() + payload.len());
        dst.put_u16(SCHEMA_VERSION_V1);
        dst.put_u8(frame_type.as_u8());
        dst.put_u32(header.len() as u32);
        dst.put_u32(payload.len() as u32);
        dst.put_slice(header);
        dst.put_slice(payload);
        Ok(())
    }

    fn validate_lengths(header_len: u32, payload_len: u32) -> io::Result<()> {
        let total_len = header_len
            .checked_add(payload_len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "frame size overflow"))?;

        if total_len > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame size {} exceeds maximum {}", total_len, MAX_FRAME_SIZE),
            ));
        }

        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = (FrameType, Bytes, Bytes);
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                DecodeState::AwaitingPreamble => {
                    if src.len() < PREAMBLE_SIZE {
                        return Ok(None);
                    }

                    let schema_version = u16::from_be_bytes([src[0], src[1]]);
                    let frame_type_byte = src[2];
                    let header_len = u32::from_be_bytes([src[3], src[4], src[5], src[6]]);
                    let payload_len = u32::from_be_bytes([src[7], src[8], src[9], src[10]]);

                    if schema_version != SCHEMA_VERSION_V1 {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!(
                                "unsupported schema version: {} (expected {})",
                                schema_version, SCHEMA_VERSION_V1
                            ),
                        ));
                    }

                    let frame_type = FrameType::from_u8(frame_type_byte).ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("invalid frame type: {}", frame_type_byte),
                        )
                    })?;

                    Self::validate_lengths(header_len, payload_len)?;

                    src.advance(PREAMBLE_SIZE);

                    self.state = DecodeState::AwaitingData {
                        frame_type,
                        header_len,
                        payload_len,
                    };
                }

                DecodeState::AwaitingData {
                    frame_type,
                    header_len,
                    payload_len,
                } => {
                    let total_data_len = (header_len + payload_len) as usize;

                    if src.len() < total_data_len {
                        return Ok(None);
                    }

                    let header = src.split_to(header_len as usize).freeze();
                    let payload = src.split_to(payload_len as usize).freeze();

                    self.state = DecodeState::AwaitingPreamble;

                    return Ok(Some((frame_type, header, payload)));
                }
            }
        }
    }
}
