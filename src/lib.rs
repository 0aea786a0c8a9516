#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

// Public modules
mod common;

#[cfg(feature = "async")]
pub mod async_dht;
mod dht;
mod error;
pub mod rpc;

pub use crate::common::{
    messages, BucketEntry, Contact, Id, KBucket, Liveness, Node, RoutingTable, MAX_BUCKET_SIZE_K,
};
pub use dht::{Dht, DhtBuilder, DhtTraversalError, DhtWasShutdown, Lookup, LookupResponse};
pub use rpc::{AnnounceResult, Config, Info, TraversalError};

pub use error::Error;

/// Alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
