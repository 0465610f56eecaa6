// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Call contract for the external opportunistic-lock engine
//!
//! The engine owns one opaque state object per control block. Calls that can
//! wait for a break take an [`OplockContinuation`]; when such a call returns a
//! pending status the engine fires the continuation exactly once, later, from
//! any thread. `Ok(())` means the create may be replayed, an error means it
//! must fail.

use crate::error::{BridgeError, BridgeResult};
use crate::request::CreateRequest;
use crate::types::OplockId;
use std::sync::atomic::{AtomicU64, Ordering};

pub type OplockContinuation = Box<dyn FnOnce(BridgeResult<()>) + Send + 'static>;

/// Result of asking the engine to break handle oplocks
#[derive(Debug)]
pub enum BreakStatus {
    /// Nothing to break; the caller may re-check sharing
    NoBreakNeeded,
    /// A break is under way and the continuation will fire
    Pending,
    Failed(BridgeError),
}

#[derive(Debug)]
pub enum OplockCheck {
    Granted,
    Pending,
    Denied(BridgeError),
}

/// Result of an atomic create-with-oplock request
#[derive(Debug)]
pub enum AtomicOplock {
    Granted,
    /// Not a failure; the open proceeds without the oplock
    BreakInProgress,
    Failed(BridgeError),
}

#[cfg_attr(test, mockall::automock)]
pub trait OplockEngine: Send + Sync {
    fn initialize(&self) -> OplockId;

    fn uninitialize(&self, oplock: OplockId);

    fn break_handle(
        &self,
        oplock: OplockId,
        request: &CreateRequest,
        resume: OplockContinuation,
    ) -> BreakStatus;

    fn check_oplock(
        &self,
        oplock: OplockId,
        request: &CreateRequest,
        resume: OplockContinuation,
    ) -> OplockCheck;

    /// Validate the caller's oplock key without blocking
    fn check_oplock_key(&self, oplock: OplockId, request: &CreateRequest) -> BridgeResult<()>;

    fn request_atomic_oplock(
        &self,
        oplock: OplockId,
        request: &CreateRequest,
        open_count: u32,
    ) -> AtomicOplock;

    fn back_out_atomic_oplock(&self, oplock: OplockId, request: &CreateRequest);
}

/// Engine for volumes without oplock support
#[derive(Debug, Default)]
pub struct NoOplocks {
    next_id: AtomicU64,
}

impl OplockEngine for NoOplocks {
    fn initialize(&self) -> OplockId {
        OplockId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn uninitialize(&self, _oplock: OplockId) {}

    fn break_handle(
        &self,
        _oplock: OplockId,
        _request: &CreateRequest,
        _resume: OplockContinuation,
    ) -> BreakStatus {
        BreakStatus::NoBreakNeeded
    }

    fn check_oplock(
        &self,
        _oplock: OplockId,
        _request: &CreateRequest,
        _resume: OplockContinuation,
    ) -> OplockCheck {
        OplockCheck::Granted
    }

    fn check_oplock_key(&self, _oplock: OplockId, _request: &CreateRequest) -> BridgeResult<()> {
        Ok(())
    }

    fn request_atomic_oplock(
        &self,
        _oplock: OplockId,
        _request: &CreateRequest,
        _open_count: u32,
    ) -> AtomicOplock {
        AtomicOplock::Failed(BridgeError::OplockNotGranted)
    }

    fn back_out_atomic_oplock(&self, _oplock: OplockId, _request: &CreateRequest) {}
}
