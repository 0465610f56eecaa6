// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Worker reply messages

use crate::error::ProtoError;
use ssz::{Decode, Encode};
use ssz_derive::{Decode, Encode};

pub const STATUS_SUCCESS: u32 = 0;

/// Reply flag: the worker resolved the path to a directory
pub const REPLY_FLAG_DIRECTORY: u32 = 0x1;

/// Create outcome codes carried in [`CreateReply::information`]
pub mod information {
    pub const SUPERSEDED: u32 = 0;
    pub const OPENED: u32 = 1;
    pub const CREATED: u32 = 2;
    pub const OVERWRITTEN: u32 = 3;
    pub const EXISTS: u32 = 4;
    pub const DOES_NOT_EXIST: u32 = 5;
}

/// Worker answer to one create envelope, keyed by the envelope serial
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct CreateReply {
    pub serial: u64,
    pub status: u32,
    pub information: u32,
    /// Opaque per-open token the worker wants back on later requests
    pub context: u64,
    pub flags: u32,
}

impl CreateReply {
    pub fn success(serial: u64, information: u32, context: u64) -> Self {
        Self {
            serial,
            status: STATUS_SUCCESS,
            information,
            context,
            flags: 0,
        }
    }

    pub fn failure(serial: u64, status: u32, information: u32) -> Self {
        Self {
            serial,
            status,
            information,
            context: 0,
            flags: 0,
        }
    }

    pub fn with_directory(mut self) -> Self {
        self.flags |= REPLY_FLAG_DIRECTORY;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }

    pub fn is_directory(&self) -> bool {
        self.flags & REPLY_FLAG_DIRECTORY != 0
    }

    pub fn encode(&self) -> Vec<u8> {
        self.as_ssz_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtoError> {
        Self::from_ssz_bytes(bytes).map_err(|e| ProtoError::SszDecode(format!("{:?}", e)))
    }
}
