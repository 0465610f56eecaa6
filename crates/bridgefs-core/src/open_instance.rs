// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Open instances: one per successful (or in-flight) create on a file object

use crate::control_block::{ControlBlock, ControlBlockState};
use crate::error::{BridgeError, BridgeResult};
use crate::share::ShareGrant;
use crate::types::{InstanceFlags, InstanceId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, trace};

pub const OPEN_INSTANCE_TAG: u32 = 0x4246_4F49; // "BFOI"
pub const FREED_OPEN_INSTANCE_TAG: u32 = 0x4246_4F58; // "BFOX"

#[derive(Debug, Default)]
struct InstanceState {
    flags: InstanceFlags,
    atomic_oplock_pending: bool,
    search_pattern: Option<String>,
    user_context: u64,
    share_grant: Option<ShareGrant>,
}

pub struct OpenInstance {
    id: InstanceId,
    tag: AtomicU32,
    control_block: Arc<ControlBlock>,
    session_id: u64,
    process_id: u32,
    /// Name the worker sees for this open
    envelope_path: String,
    state: Mutex<InstanceState>,
}

impl std::fmt::Debug for OpenInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenInstance")
            .field("id", &self.id)
            .field("control_block", &self.control_block.id())
            .field("envelope_path", &self.envelope_path)
            .finish()
    }
}

impl OpenInstance {
    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn control_block(&self) -> &Arc<ControlBlock> {
        &self.control_block
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    pub fn envelope_path(&self) -> &str {
        &self.envelope_path
    }

    pub fn is_live(&self) -> bool {
        self.tag.load(Ordering::Acquire) == OPEN_INSTANCE_TAG
    }

    #[track_caller]
    pub fn check_identity(&self) -> BridgeResult<()> {
        let tag = self.tag.load(Ordering::Acquire);
        if tag == OPEN_INSTANCE_TAG {
            return Ok(());
        }
        let err = BridgeError::invalid_state(format!(
            "open instance {} has identity tag {:#010x}",
            self.id.0, tag
        ));
        if let BridgeError::InvalidState { location, .. } = &err {
            error!(id = self.id.0, tag, %location, "open instance identity check failed");
        }
        Err(err)
    }

    pub fn flags(&self) -> InstanceFlags {
        self.state.lock().flags
    }

    pub fn insert_flags(&self, flags: InstanceFlags) {
        self.state.lock().flags.insert(flags);
    }

    pub fn remove_flags(&self, flags: InstanceFlags) {
        self.state.lock().flags.remove(flags);
    }

    /// Clear the retry flag, returning whether it was set
    pub(crate) fn take_retry(&self) -> bool {
        let mut state = self.state.lock();
        let set = state.flags.contains(InstanceFlags::RETRY_CREATE);
        state.flags.remove(InstanceFlags::RETRY_CREATE);
        set
    }

    pub fn atomic_oplock_pending(&self) -> bool {
        self.state.lock().atomic_oplock_pending
    }

    pub(crate) fn set_atomic_oplock_pending(&self, pending: bool) {
        self.state.lock().atomic_oplock_pending = pending;
    }

    pub fn user_context(&self) -> u64 {
        self.state.lock().user_context
    }

    pub(crate) fn set_user_context(&self, context: u64) {
        self.state.lock().user_context = context;
    }

    pub fn search_pattern(&self) -> Option<String> {
        self.state.lock().search_pattern.clone()
    }

    /// Remember the pattern of a directory enumeration on this open
    pub fn set_search_pattern(&self, pattern: Option<String>) {
        self.state.lock().search_pattern = pattern;
    }

    pub fn share_grant(&self) -> Option<ShareGrant> {
        self.state.lock().share_grant
    }

    pub(crate) fn set_share_grant(&self, grant: ShareGrant) {
        self.state.lock().share_grant = Some(grant);
    }

    pub(crate) fn take_share_grant(&self) -> Option<ShareGrant> {
        self.state.lock().share_grant.take()
    }
}

/// Allocates and frees open instances for one volume
#[derive(Debug)]
pub struct InstanceRegistry {
    session_id: u64,
    next_id: AtomicU64,
    allocated: AtomicU64,
    freed: AtomicU64,
}

impl InstanceRegistry {
    pub fn new(session_id: u64) -> Self {
        Self {
            session_id,
            next_id: AtomicU64::new(1),
            allocated: AtomicU64::new(0),
            freed: AtomicU64::new(0),
        }
    }

    /// Create an instance and link it into its control block
    ///
    /// `state` must be the control block's write guard.
    pub fn allocate(
        &self,
        control_block: &Arc<ControlBlock>,
        state: &mut ControlBlockState,
        process_id: u32,
        envelope_path: String,
    ) -> BridgeResult<Arc<OpenInstance>> {
        control_block.check_identity()?;
        let oi = Arc::new(OpenInstance {
            id: InstanceId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            tag: AtomicU32::new(OPEN_INSTANCE_TAG),
            control_block: control_block.clone(),
            session_id: self.session_id,
            process_id,
            envelope_path,
            state: Mutex::new(InstanceState::default()),
        });
        state.link_instance(oi.id);
        self.allocated.fetch_add(1, Ordering::Relaxed);
        trace!(id = oi.id.0, path = %control_block.path(), "open instance allocated");
        Ok(oi)
    }

    /// Unlink an instance from its control block and invalidate it
    pub fn free(&self, oi: &OpenInstance, state: &mut ControlBlockState) -> BridgeResult<()> {
        oi.check_identity()?;
        if !state.unlink_instance(oi.id) {
            return Err(BridgeError::invalid_state(format!(
                "open instance {} is not linked to its control block",
                oi.id.0
            )));
        }
        oi.tag.store(FREED_OPEN_INSTANCE_TAG, Ordering::Release);
        self.freed.fetch_add(1, Ordering::Relaxed);
        trace!(id = oi.id.0, "open instance freed");
        Ok(())
    }

    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn freed(&self) -> u64 {
        self.freed.load(Ordering::Relaxed)
    }
}
