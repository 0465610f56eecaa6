// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Share-access bookkeeping for a control block
//!
//! A [`ShareAccessRecord`] counts how many live opens hold each access kind
//! and how many of them allow others to share it. A new open conflicts when
//! it wants an access some holder does not share, or refuses to share an
//! access some holder already has.

use crate::error::{BridgeError, BridgeResult};
use crate::types::{AccessMask, ShareAccess};

/// Access bits that count as "read" for sharing purposes
const READ_ACCESS: AccessMask = AccessMask::READ_DATA.union(AccessMask::EXECUTE);
const WRITE_ACCESS: AccessMask = AccessMask::WRITE_DATA.union(AccessMask::APPEND_DATA);

/// Access kinds that collide with a user-writable mapping unless write is shared
const MAPPING_SENSITIVE_ACCESS: AccessMask = READ_ACCESS
    .union(WRITE_ACCESS)
    .union(AccessMask::DELETE)
    .union(AccessMask::MAXIMUM_ALLOWED);

/// What one open contributed to its control block's share record
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShareGrant {
    pub read: bool,
    pub write: bool,
    pub delete: bool,
    pub shared_read: bool,
    pub shared_write: bool,
    pub shared_delete: bool,
}

impl ShareGrant {
    pub fn new(access: AccessMask, share: ShareAccess) -> Self {
        Self {
            read: access.intersects(READ_ACCESS),
            write: access.intersects(WRITE_ACCESS),
            delete: access.intersects(AccessMask::DELETE),
            shared_read: share.contains(ShareAccess::READ),
            shared_write: share.contains(ShareAccess::WRITE),
            shared_delete: share.contains(ShareAccess::DELETE),
        }
    }

    /// Opens asking for none of read/write/delete never take part in sharing
    pub fn is_counted(&self) -> bool {
        self.read || self.write || self.delete
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShareAccessRecord {
    pub open_count: u32,
    pub readers: u32,
    pub writers: u32,
    pub deleters: u32,
    pub shared_read: u32,
    pub shared_write: u32,
    pub shared_delete: u32,
}

impl ShareAccessRecord {
    /// Check a new open against existing grants without recording it
    pub fn check(&self, access: AccessMask, share: ShareAccess) -> BridgeResult<ShareGrant> {
        let grant = ShareGrant::new(access, share);
        if !grant.is_counted() {
            return Ok(grant);
        }

        let conflict = (grant.read && self.shared_read < self.open_count)
            || (grant.write && self.shared_write < self.open_count)
            || (grant.delete && self.shared_delete < self.open_count)
            || (self.readers != 0 && !grant.shared_read)
            || (self.writers != 0 && !grant.shared_write)
            || (self.deleters != 0 && !grant.shared_delete);

        if conflict {
            Err(BridgeError::SharingViolation)
        } else {
            Ok(grant)
        }
    }

    /// Record the first open unconditionally, replacing any previous state
    pub fn set(&mut self, access: AccessMask, share: ShareAccess) -> ShareGrant {
        let grant = ShareGrant::new(access, share);
        *self = Self::default();
        self.update(&grant);
        grant
    }

    /// Add a grant previously returned by [`check`](Self::check)
    pub fn update(&mut self, grant: &ShareGrant) {
        if !grant.is_counted() {
            return;
        }
        self.open_count += 1;
        self.readers += grant.read as u32;
        self.writers += grant.write as u32;
        self.deleters += grant.delete as u32;
        self.shared_read += grant.shared_read as u32;
        self.shared_write += grant.shared_write as u32;
        self.shared_delete += grant.shared_delete as u32;
    }

    pub fn remove(&mut self, grant: &ShareGrant) {
        if !grant.is_counted() {
            return;
        }
        self.open_count = self.open_count.saturating_sub(1);
        self.readers = self.readers.saturating_sub(grant.read as u32);
        self.writers = self.writers.saturating_sub(grant.write as u32);
        self.deleters = self.deleters.saturating_sub(grant.delete as u32);
        self.shared_read = self.shared_read.saturating_sub(grant.shared_read as u32);
        self.shared_write = self.shared_write.saturating_sub(grant.shared_write as u32);
        self.shared_delete = self.shared_delete.saturating_sub(grant.shared_delete as u32);
    }
}

/// Full share check for a non-first open
///
/// Adds the delete-pending and writable-mapping rules on top of the
/// counter check.
pub fn check_open(
    record: &ShareAccessRecord,
    delete_pending: bool,
    writable_mapping: bool,
    access: AccessMask,
    share: ShareAccess,
) -> BridgeResult<ShareGrant> {
    if delete_pending && !share.contains(ShareAccess::DELETE) {
        return Err(BridgeError::AccessDenied);
    }
    if writable_mapping
        && !share.contains(ShareAccess::WRITE)
        && access.intersects(MAPPING_SENSITIVE_ACCESS)
    {
        return Err(BridgeError::SharingViolation);
    }
    record.check(access, share)
}
