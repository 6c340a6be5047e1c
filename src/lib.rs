#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

mod common;
mod dht;
mod error;

// Public modules
#[cfg(feature = "async")]
pub mod async_dht;
pub mod rpc;

pub use crate::common::{
    compare_by_distance, distance, messages, BucketRange, Id, Node, NodeState, RoutingTable,
    Value, ValueError, ValuePayload, MAX_VALUE_SIZE, TEXT_PLAIN,
};
pub use bytes::Bytes;
pub use dht::{Dht, DhtBuilder, GetStream, Testnet};
pub use error::Error;
pub use rpc::{Info, NodeStatus};

pub use ed25519_dalek::SigningKey;
