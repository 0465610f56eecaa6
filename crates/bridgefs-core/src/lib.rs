// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! BridgeFS Core: create-request handling for a user-mode file system bridge
//!
//! A [`Volume`] accepts create requests, resolves them against a cache of
//! per-path control blocks, arbitrates sharing and oplocks, and queues an
//! envelope for the out-of-process worker. Worker replies come back through
//! [`Volume::complete_create`].

pub mod completion;
pub mod config;
pub mod control_block;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod open_instance;
pub mod oplock;
pub mod path;
pub mod pending;
pub mod request;
pub mod security;
pub mod share;
pub mod types;

#[cfg(test)]
mod testing;

#[cfg(test)]
mod test_cache_lifecycle;
#[cfg(test)]
mod test_create_flow;

// Re-export key types
pub use config::{BridgeConfig, CacheLimits, CollectionPolicy, ConfigError, ReservedNames};
pub use control_block::{ControlBlock, ControlBlockCache, FileMetadata, StreamContext};
pub use dispatch::{DispatchStatus, Volume, VolumeBuilder};
pub use error::{BridgeError, BridgeResult};
pub use open_instance::OpenInstance;
pub use oplock::{AtomicOplock, BreakStatus, NoOplocks, OplockCheck, OplockContinuation, OplockEngine};
pub use pending::QueuedEnvelope;
pub use request::{
    AccessState, CompletionReceiver, CreateIrp, CreateOutcome, CreateRequest, FileContext,
    FileObject,
};
pub use security::{AssignedDescriptor, NoSecurity, PassThroughSecurity, SecuritySubsystem};
pub use types::*;
