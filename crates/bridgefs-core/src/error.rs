// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the create-request core

use bridgefs_proto::ProtoError;
use std::panic::Location;

pub mod status {
    pub const SUCCESS: u32 = 0x0000_0000;
    pub const UNSUCCESSFUL: u32 = 0xC000_0001;
    pub const INVALID_PARAMETER: u32 = 0xC000_000D;
    pub const NO_SUCH_DEVICE: u32 = 0xC000_000E;
    pub const ACCESS_DENIED: u32 = 0xC000_0022;
    pub const OBJECT_NAME_NOT_FOUND: u32 = 0xC000_0034;
    pub const OBJECT_NAME_COLLISION: u32 = 0xC000_0035;
    pub const SHARING_VIOLATION: u32 = 0xC000_0043;
    pub const INSUFFICIENT_RESOURCES: u32 = 0xC000_009A;
    pub const MEDIA_WRITE_PROTECTED: u32 = 0xC000_00A2;
    pub const OPLOCK_NOT_GRANTED: u32 = 0xC000_00E2;
    pub const NOT_A_DIRECTORY: u32 = 0xC000_0103;
    pub const CANCELLED: u32 = 0xC000_0120;
    pub const INVALID_DEVICE_STATE: u32 = 0xC000_0184;
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum BridgeError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    #[error("insufficient resources")]
    ResourceExhausted,
    #[error("invalid object state: {detail} (at {location})")]
    InvalidState {
        detail: String,
        location: &'static Location<'static>,
    },
    #[error("name collision")]
    NameCollision,
    #[error("sharing violation")]
    SharingViolation,
    #[error("media is write protected")]
    WriteProtected,
    #[error("access denied")]
    AccessDenied,
    #[error("not a directory")]
    NotADirectory,
    #[error("not found")]
    NotFound,
    #[error("no such device")]
    NoSuchDevice,
    #[error("cancelled")]
    Cancelled,
    #[error("oplock not granted")]
    OplockNotGranted,
    #[error("worker reported status {0:#010x}")]
    Worker(u32),
    #[error("protocol error: {0}")]
    Proto(#[from] ProtoError),
}

pub type BridgeResult<T> = Result<T, BridgeError>;

impl BridgeError {
    /// Identity-check failure tagged with the caller's location
    #[track_caller]
    pub fn invalid_state(detail: impl Into<String>) -> Self {
        BridgeError::InvalidState {
            detail: detail.into(),
            location: Location::caller(),
        }
    }

    /// Status code reported on the wire and in completion records
    pub fn status_code(&self) -> u32 {
        match self {
            BridgeError::InvalidParameter(_) => status::INVALID_PARAMETER,
            BridgeError::ResourceExhausted => status::INSUFFICIENT_RESOURCES,
            BridgeError::InvalidState { .. } => status::INVALID_DEVICE_STATE,
            BridgeError::NameCollision => status::OBJECT_NAME_COLLISION,
            BridgeError::SharingViolation => status::SHARING_VIOLATION,
            BridgeError::WriteProtected => status::MEDIA_WRITE_PROTECTED,
            BridgeError::AccessDenied => status::ACCESS_DENIED,
            BridgeError::NotADirectory => status::NOT_A_DIRECTORY,
            BridgeError::NotFound => status::OBJECT_NAME_NOT_FOUND,
            BridgeError::NoSuchDevice => status::NO_SUCH_DEVICE,
            BridgeError::Cancelled => status::CANCELLED,
            BridgeError::OplockNotGranted => status::OPLOCK_NOT_GRANTED,
            BridgeError::Worker(code) => *code,
            BridgeError::Proto(_) => status::UNSUCCESSFUL,
        }
    }

    /// Map a worker status back onto the taxonomy; unknown codes stay opaque
    pub fn from_status(code: u32) -> Self {
        match code {
            status::INVALID_PARAMETER => BridgeError::InvalidParameter("rejected by worker"),
            status::INSUFFICIENT_RESOURCES => BridgeError::ResourceExhausted,
            status::OBJECT_NAME_COLLISION => BridgeError::NameCollision,
            status::SHARING_VIOLATION => BridgeError::SharingViolation,
            status::MEDIA_WRITE_PROTECTED => BridgeError::WriteProtected,
            status::ACCESS_DENIED => BridgeError::AccessDenied,
            status::NOT_A_DIRECTORY => BridgeError::NotADirectory,
            status::OBJECT_NAME_NOT_FOUND => BridgeError::NotFound,
            status::NO_SUCH_DEVICE => BridgeError::NoSuchDevice,
            status::CANCELLED => BridgeError::Cancelled,
            other => BridgeError::Worker(other),
        }
    }
}
