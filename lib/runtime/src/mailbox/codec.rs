// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide codec registry.
//!
//! Maps a registered type name to the functions that move a typed message to
//! and from the wire, JSON-encoded. Registration is write-once per name;
//! sending or receiving an unknown name fails with `UnregisteredMsgType`.
//! After registration, readers take a shared lock only; registration itself
//! is guarded.

use std::any::{Any, TypeId};
use std::collections::HashMap;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::transport::TransportError;

type DecodeFn = Box<dyn Fn(&[u8]) -> Result<Box<dyn Any + Send + Sync>, serde_json::Error> + Send + Sync>;

#[derive(Default)]
struct CodecRegistry {
    decoders: HashMap<String, DecodeFn>,
    names: HashMap<TypeId, String>,
}

static REGISTRY: Lazy<RwLock<CodecRegistry>> = Lazy::new(|| RwLock::new(CodecRegistry::default()));

/// Register `T` under `name`. Write-once: a second registration of the same
/// name fails with [`TransportError::DuplicateMsgType`].
pub fn register_message<T>(name: &str) -> Result<(), TransportError>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let mut registry = REGISTRY.write();
    if registry.decoders.contains_key(name) {
        return Err(TransportError::DuplicateMsgType(name.to_string()));
    }
    registry.decoders.insert(
        name.to_string(),
        Box::new(|bytes| {
            let msg: T = serde_json::from_slice(bytes)?;
            Ok(Box::new(msg) as Box<dyn Any + Send + Sync>)
        }),
    );
    registry.names.insert(TypeId::of::<T>(), name.to_string());
    Ok(())
}

/// Serialize `msg`, returning its registered name and payload bytes.
pub(crate) fn encode_message<T>(msg: &T) -> Result<(String, Vec<u8>), TransportError>
where
    T: Serialize + 'static,
{
    let name = REGISTRY
        .read()
        .names
        .get(&TypeId::of::<T>())
        .cloned()
        .ok_or_else(|| TransportError::UnregisteredMsgType(std::any::type_name::<T>().to_string()))?;
    let bytes = serde_json::to_vec(msg)?;
    Ok((name, bytes))
}

/// Deserialize a payload by its wire name.
pub(crate) fn decode_message(
    name: &str,
    bytes: &[u8],
) -> Result<Box<dyn Any + Send + Sync>, TransportError> {
    let registry = REGISTRY.read();
    let decode = registry
        .decoders
        .get(name)
        .ok_or_else(|| TransportError::UnregisteredMsgType(name.to_string()))?;
    Ok(decode(bytes)?)
}

/// Whether `name` is registered. The receive side uses this to reject frames
/// before decoding.
pub(crate) fn is_registered(name: &str) -> bool {
    REGISTRY.read().decoders.contains_key(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct CodecTestMsg {
        seq: u64,
        body: String,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct CodecDupMsg;

    #[test]
    fn test_register_encode_decode_round_trip() {
        // Names are global; keep them unique per test.
        register_message::<CodecTestMsg>("CodecTestMsg").unwrap();

        let msg = CodecTestMsg {
            seq: 42,
            body: "hello".to_string(),
        };
        let (name, bytes) = encode_message(&msg).unwrap();
        assert_eq!(name, "CodecTestMsg");

        let decoded = decode_message(&name, &bytes).unwrap();
        let back = decoded.downcast_ref::<CodecTestMsg>().unwrap();
        assert_eq!(back, &msg);
    }

    #[test]
    fn test_register_is_write_once() {
        register_message::<CodecDupMsg>("CodecDupMsg").unwrap();
        let err = register_message::<CodecDupMsg>("CodecDupMsg").unwrap_err();
        assert!(matches!(err, TransportError::DuplicateMsgType(_)));
    }

    #[test]
    fn test_unregistered_type_fails() {
        #[derive(Serialize)]
        struct Unregistered;

        let err = encode_message(&Unregistered).unwrap_err();
        assert!(matches!(err, TransportError::UnregisteredMsgType(_)));

        let err = decode_message("NoSuchName", b"{}").unwrap_err();
        assert!(matches!(err, TransportError::UnregisteredMsgType(_)));
        assert!(!is_registered("NoSuchName"));
    }
}
