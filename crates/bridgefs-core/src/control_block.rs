// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-path control blocks and the volume's control-block cache
//!
//! Lock order is always cache lock, then a control block's own lock. The
//! open count changes only while the cache lock is held, so a release that
//! reaches zero and a concurrent reacquire can never interleave.

use crate::config::{CollectionPolicy, ReservedNames};
use crate::error::{BridgeError, BridgeResult};
use crate::oplock::OplockEngine;
use crate::path::{fold_key, paths_equal};
use crate::share::ShareAccessRecord;
use crate::types::{ControlBlockFlags, ControlBlockId, InstanceId, OplockId};
use parking_lot::{RwLock, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

pub const CONTROL_BLOCK_TAG: u32 = 0x4246_4342; // "BFCB"
pub const FREED_CONTROL_BLOCK_TAG: u32 = 0x4246_4658; // "BFFX"

const RECYCLE_POOL_LIMIT: usize = 64;

/// Cached size fields for the file behind a control block
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileMetadata {
    pub allocation_size: u64,
    pub file_size: u64,
    pub valid_data_length: u64,
    pub fast_io_possible: bool,
}

/// Context a filter attached to one stream of a file
pub trait StreamContext: Send + Sync {
    fn teardown(self: Box<Self>);
}

/// Mutable control-block fields, guarded by the block's lock
#[derive(Default)]
pub struct ControlBlockState {
    pub flags: ControlBlockFlags,
    pub share_access: ShareAccessRecord,
    pub metadata: FileMetadata,
    /// A user-writable section is mapped over the file
    pub writable_mapping: bool,
    instances: Vec<InstanceId>,
    stream_contexts: Vec<Box<dyn StreamContext>>,
}

impl ControlBlockState {
    pub fn instances(&self) -> &[InstanceId] {
        &self.instances
    }

    pub(crate) fn link_instance(&mut self, id: InstanceId) {
        self.instances.push(id);
    }

    pub(crate) fn unlink_instance(&mut self, id: InstanceId) -> bool {
        match self.instances.iter().position(|i| *i == id) {
            Some(at) => {
                self.instances.remove(at);
                true
            }
            None => false,
        }
    }

    pub fn attach_stream_context(&mut self, ctx: Box<dyn StreamContext>) {
        self.stream_contexts.push(ctx);
    }

    fn reset(&mut self) {
        self.flags = ControlBlockFlags::empty();
        self.share_access = ShareAccessRecord::default();
        self.metadata = FileMetadata::default();
        self.writable_mapping = false;
        self.instances.clear();
        self.stream_contexts.clear();
    }
}

pub struct ControlBlock {
    id: ControlBlockId,
    tag: AtomicU32,
    path: String,
    open_count: AtomicU32,
    oplock: OplockId,
    state: RwLock<ControlBlockState>,
}

impl std::fmt::Debug for ControlBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlBlock")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("open_count", &self.open_count())
            .finish()
    }
}

impl ControlBlock {
    pub fn id(&self) -> ControlBlockId {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn open_count(&self) -> u32 {
        self.open_count.load(Ordering::Acquire)
    }

    pub fn oplock(&self) -> OplockId {
        self.oplock
    }

    pub fn state(&self) -> &RwLock<ControlBlockState> {
        &self.state
    }

    pub fn flags(&self) -> ControlBlockFlags {
        self.state.read().flags
    }

    pub fn is_live(&self) -> bool {
        self.tag.load(Ordering::Acquire) == CONTROL_BLOCK_TAG
    }

    /// Refuse to touch a block whose identity tag is no longer valid
    #[track_caller]
    pub fn check_identity(&self) -> BridgeResult<()> {
        let tag = self.tag.load(Ordering::Acquire);
        if tag == CONTROL_BLOCK_TAG {
            return Ok(());
        }
        let err = BridgeError::invalid_state(format!(
            "control block {} has identity tag {:#010x}",
            self.id.0, tag
        ));
        if let BridgeError::InvalidState { location, .. } = &err {
            error!(id = self.id.0, tag, %location, "control block identity check failed");
        }
        Err(err)
    }

    /// Mark (or clear) a user-writable mapping over the file
    pub fn set_writable_mapping(&self, mapped: bool) {
        self.state.write().writable_mapping = mapped;
    }
}

#[derive(Debug, Default)]
struct CacheMetrics {
    allocated: AtomicU64,
    freed: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub allocated: u64,
    pub freed: u64,
    pub cached: u64,
    pub pending_deletion: u64,
}

struct PendingDeletion {
    control_block: Arc<ControlBlock>,
    deadline: Instant,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, Vec<Arc<ControlBlock>>>,
    pending_deletion: HashMap<ControlBlockId, PendingDeletion>,
    recycled: Vec<ControlBlockState>,
    live: usize,
}

/// Path → control block association for one volume
pub struct ControlBlockCache {
    inner: RwLock<CacheInner>,
    oplocks: Arc<dyn OplockEngine>,
    policy: CollectionPolicy,
    reserved: ReservedNames,
    max_control_blocks: usize,
    next_id: AtomicU64,
    metrics: CacheMetrics,
}

impl ControlBlockCache {
    pub fn new(
        oplocks: Arc<dyn OplockEngine>,
        policy: CollectionPolicy,
        reserved: ReservedNames,
        max_control_blocks: usize,
    ) -> Self {
        Self {
            inner: RwLock::new(CacheInner::default()),
            oplocks,
            policy,
            reserved,
            max_control_blocks,
            next_id: AtomicU64::new(1),
            metrics: CacheMetrics::default(),
        }
    }

    /// Find the cached block for `path` or create one; the caller owns one reference
    pub fn acquire_or_create(
        &self,
        path: &str,
        case_sensitive: bool,
    ) -> BridgeResult<Arc<ControlBlock>> {
        let mut inner = self.inner.write();

        if let Some(found) = Self::lookup(&inner, path, case_sensitive)? {
            if inner.pending_deletion.remove(&found.id).is_some() {
                debug!(path = %found.path, "reusing control block scheduled for collection");
            }
            let count = found.open_count.fetch_add(1, Ordering::AcqRel) + 1;
            trace!(path = %found.path, open_count = count, "control block acquired");
            return Ok(found);
        }

        let cb = match self.allocate(&mut inner, path) {
            Some(cb) => cb,
            None => {
                debug!(path, "control block limit reached, forcing collection");
                self.collect_locked(&mut inner, None);
                self.allocate(&mut inner, path)
                    .ok_or(BridgeError::ResourceExhausted)?
            }
        };
        inner
            .entries
            .entry(fold_key(path))
            .or_default()
            .push(cb.clone());
        debug!(path, id = cb.id.0, "control block created");
        Ok(cb)
    }

    fn lookup(
        inner: &CacheInner,
        path: &str,
        case_sensitive: bool,
    ) -> BridgeResult<Option<Arc<ControlBlock>>> {
        let Some(bucket) = inner.entries.get(&fold_key(path)) else {
            return Ok(None);
        };
        for cb in bucket {
            cb.check_identity()?;
            if paths_equal(&cb.path, path, case_sensitive) {
                return Ok(Some(cb.clone()));
            }
        }
        Ok(None)
    }

    fn allocate(&self, inner: &mut CacheInner, path: &str) -> Option<Arc<ControlBlock>> {
        if self.max_control_blocks != 0 && inner.live >= self.max_control_blocks {
            return None;
        }

        let mut state = inner.recycled.pop().unwrap_or_default();
        if paths_equal(path, &self.reserved.keepalive, false) {
            state
                .flags
                .insert(ControlBlockFlags::KEEPALIVE | ControlBlockFlags::DISPATCH_BLOCKED);
        } else if paths_equal(path, &self.reserved.notification, false) {
            state
                .flags
                .insert(ControlBlockFlags::NOTIFICATION | ControlBlockFlags::DISPATCH_BLOCKED);
        }

        let cb = Arc::new(ControlBlock {
            id: ControlBlockId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            tag: AtomicU32::new(CONTROL_BLOCK_TAG),
            path: path.to_string(),
            open_count: AtomicU32::new(1),
            oplock: self.oplocks.initialize(),
            state: RwLock::new(state),
        });
        inner.live += 1;
        self.metrics.allocated.fetch_add(1, Ordering::Relaxed);
        Some(cb)
    }

    /// Drop one reference; at zero the block is deleted or parked for collection
    pub fn release(&self, cb: &Arc<ControlBlock>) -> BridgeResult<()> {
        cb.check_identity()?;
        let mut inner = self.inner.write();

        let previous = cb.open_count.fetch_sub(1, Ordering::AcqRel);
        if previous == 0 {
            cb.open_count.store(0, Ordering::Release);
            return Err(BridgeError::invalid_state(format!(
                "control block {} released with no references",
                cb.id.0
            )));
        }
        trace!(path = %cb.path, open_count = previous - 1, "control block released");
        if previous > 1 {
            return Ok(());
        }

        if self.policy.enabled {
            let deadline = Instant::now() + Duration::from_millis(self.policy.grace_period_ms);
            inner.pending_deletion.insert(
                cb.id,
                PendingDeletion {
                    control_block: cb.clone(),
                    deadline,
                },
            );
            debug!(path = %cb.path, "control block scheduled for collection");
            Ok(())
        } else {
            self.delete_locked(&mut inner, cb)
        }
    }

    /// Unlink and tear down a block; requires the cache lock
    fn delete_locked(&self, inner: &mut CacheInner, cb: &Arc<ControlBlock>) -> BridgeResult<()> {
        cb.check_identity()?;
        let mut state: RwLockWriteGuard<'_, ControlBlockState> = cb.state.write();

        let key = fold_key(&cb.path);
        if let Some(bucket) = inner.entries.get_mut(&key) {
            bucket.retain(|entry| !Arc::ptr_eq(entry, cb));
            if bucket.is_empty() {
                inner.entries.remove(&key);
            }
        }
        inner.pending_deletion.remove(&cb.id);

        self.oplocks.uninitialize(cb.oplock);
        for ctx in state.stream_contexts.drain(..) {
            ctx.teardown();
        }
        cb.tag.store(FREED_CONTROL_BLOCK_TAG, Ordering::Release);

        let mut recycled = std::mem::take(&mut *state);
        drop(state);
        if inner.recycled.len() < RECYCLE_POOL_LIMIT {
            recycled.reset();
            inner.recycled.push(recycled);
        }

        inner.live -= 1;
        self.metrics.freed.fetch_add(1, Ordering::Relaxed);
        debug!(path = %cb.path, id = cb.id.0, "control block deleted");
        Ok(())
    }

    /// Delete blocks whose grace period ended at or before `now`
    pub fn collect_garbage(&self, now: Instant) -> usize {
        let mut inner = self.inner.write();
        self.collect_locked(&mut inner, Some(now))
    }

    /// Delete every block awaiting collection regardless of its deadline
    pub fn force_collection(&self) -> usize {
        let mut inner = self.inner.write();
        self.collect_locked(&mut inner, None)
    }

    fn collect_locked(&self, inner: &mut CacheInner, now: Option<Instant>) -> usize {
        let expired: Vec<Arc<ControlBlock>> = inner
            .pending_deletion
            .values()
            .filter(|p| now.map_or(true, |now| p.deadline <= now))
            .map(|p| p.control_block.clone())
            .collect();

        let mut deleted = 0;
        for cb in expired {
            if cb.open_count() != 0 {
                inner.pending_deletion.remove(&cb.id);
                continue;
            }
            match self.delete_locked(inner, &cb) {
                Ok(()) => deleted += 1,
                Err(e) => {
                    inner.pending_deletion.remove(&cb.id);
                    error!(path = %cb.path, error = %e, "failed to collect control block");
                }
            }
        }
        if deleted > 0 {
            debug!(deleted, "collected control blocks");
        }
        deleted
    }

    pub fn len(&self) -> usize {
        self.inner.read().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_pending_deletion(&self, cb: &ControlBlock) -> bool {
        self.inner.read().pending_deletion.contains_key(&cb.id)
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.read();
        CacheStats {
            allocated: self.metrics.allocated.load(Ordering::Relaxed),
            freed: self.metrics.freed.load(Ordering::Relaxed),
            cached: inner.live as u64,
            pending_deletion: inner.pending_deletion.len() as u64,
        }
    }
}
