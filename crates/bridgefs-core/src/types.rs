// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core type definitions for BridgeFS

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Create option bits (the disposition travels separately)
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct CreateOptions: u32 {
        const DIRECTORY_FILE = 0x0000_0001;
        const NON_DIRECTORY_FILE = 0x0000_0040;
        const COMPLETE_IF_OPLOCKED = 0x0000_0100;
        const DELETE_ON_CLOSE = 0x0000_1000;
        const OPEN_FOR_BACKUP_INTENT = 0x0000_4000;
        const OPEN_REQUIRING_OPLOCK = 0x0001_0000;
    }
}

bitflags! {
    /// Per-request flags set by the I/O layer
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct RequestFlags: u32 {
        const FORCE_ACCESS_CHECK = 0x01;
        const OPEN_PAGING_FILE = 0x02;
        const OPEN_TARGET_DIRECTORY = 0x04;
        const CASE_SENSITIVE = 0x80;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct AccessMask: u32 {
        const READ_DATA = 0x0000_0001;
        const WRITE_DATA = 0x0000_0002;
        const APPEND_DATA = 0x0000_0004;
        const EXECUTE = 0x0000_0020;
        const READ_ATTRIBUTES = 0x0000_0080;
        const WRITE_ATTRIBUTES = 0x0000_0100;
        const DELETE = 0x0001_0000;
        const SYNCHRONIZE = 0x0010_0000;
        const MAXIMUM_ALLOWED = 0x0200_0000;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ShareAccess: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const DELETE = 0x4;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct FileAttributes: u32 {
        const READONLY = 0x0001;
        const HIDDEN = 0x0002;
        const DIRECTORY = 0x0010;
        const NORMAL = 0x0080;
        const TEMPORARY = 0x0100;
    }
}

bitflags! {
    /// State bits kept on a control block
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ControlBlockFlags: u32 {
        const DIRECTORY = 0x01;
        const DELETE_ON_CLOSE = 0x02;
        const KEEPALIVE = 0x04;
        const NOTIFICATION = 0x08;
        const DISPATCH_BLOCKED = 0x10;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct InstanceFlags: u32 {
        const OPENED = 0x01;
        const DELETE_ON_CLOSE = 0x02;
        /// Set when a suspended create is replayed after an oplock break
        const RETRY_CREATE = 0x04;
    }
}

/// Requested create/open semantics
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Disposition {
    Supersede,
    Open,
    Create,
    OpenIf,
    Overwrite,
    OverwriteIf,
}

impl Disposition {
    pub fn as_raw(self) -> u32 {
        match self {
            Disposition::Supersede => 0,
            Disposition::Open => 1,
            Disposition::Create => 2,
            Disposition::OpenIf => 3,
            Disposition::Overwrite => 4,
            Disposition::OverwriteIf => 5,
        }
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Disposition::Supersede),
            1 => Some(Disposition::Open),
            2 => Some(Disposition::Create),
            3 => Some(Disposition::OpenIf),
            4 => Some(Disposition::Overwrite),
            5 => Some(Disposition::OverwriteIf),
            _ => None,
        }
    }

    /// Dispositions refused outright on a read-only volume
    pub fn writes(self) -> bool {
        matches!(
            self,
            Disposition::Supersede
                | Disposition::Create
                | Disposition::Overwrite
                | Disposition::OverwriteIf
        )
    }

    /// Pack with option bits the way the worker expects them
    pub fn pack(self, options: CreateOptions) -> u32 {
        (self.as_raw() << 24) | (options.bits() & 0x00FF_FFFF)
    }
}

/// Outcome of a create as reported by the worker
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CreateInformation {
    Superseded,
    Opened,
    Created,
    Overwritten,
    Exists,
    NotFound,
}

impl CreateInformation {
    pub fn as_raw(self) -> u32 {
        use bridgefs_proto::information as wire;
        match self {
            CreateInformation::Superseded => wire::SUPERSEDED,
            CreateInformation::Opened => wire::OPENED,
            CreateInformation::Created => wire::CREATED,
            CreateInformation::Overwritten => wire::OVERWRITTEN,
            CreateInformation::Exists => wire::EXISTS,
            CreateInformation::NotFound => wire::DOES_NOT_EXIST,
        }
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        use bridgefs_proto::information as wire;
        match raw {
            wire::SUPERSEDED => Some(CreateInformation::Superseded),
            wire::OPENED => Some(CreateInformation::Opened),
            wire::CREATED => Some(CreateInformation::Created),
            wire::OVERWRITTEN => Some(CreateInformation::Overwritten),
            wire::EXISTS => Some(CreateInformation::Exists),
            wire::DOES_NOT_EXIST => Some(CreateInformation::NotFound),
            _ => None,
        }
    }
}

/// Cache-unique control block identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ControlBlockId(pub u64);

/// Open-instance identifier, unique per volume
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub u64);

/// Opaque handle into the oplock engine's per-control-block state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OplockId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeFilter {
    FileName,
    DirName,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeAction {
    Added,
}

/// Directory-change notification raised when a create adds a name
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: String,
    pub filter: ChangeFilter,
    pub action: ChangeAction,
}

pub trait ChangeNotifier: Send + Sync {
    fn report(&self, evt: &ChangeEvent);
}

/// Volume statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VolumeStats {
    pub control_blocks_allocated: u64,
    pub control_blocks_freed: u64,
    pub control_blocks_cached: u64,
    pub pending_deletions: u64,
    pub instances_allocated: u64,
    pub instances_freed: u64,
    pub envelopes_queued: u64,
}
