// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Schema validation for envelopes and worker replies

use crate::envelope::CreateHeader;
use crate::messages::{information, CreateReply};
use thiserror::Error;

const MAX_DISPOSITION: u32 = 5;

/// Validation error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("schema validation failed: {0}")]
    Schema(String),
}

/// Validate the fixed fields of an envelope header
pub fn validate_header(header: &CreateHeader) -> Result<(), ValidationError> {
    let disposition = header.create_options >> 24;
    if disposition > MAX_DISPOSITION {
        return Err(ValidationError::Schema(format!(
            "disposition {} out of range",
            disposition
        )));
    }
    if header.serial == 0 {
        return Err(ValidationError::Schema("serial must be non-zero".to_string()));
    }
    Ok(())
}

/// Validate a decoded reply against its logical schema
pub fn validate_reply(reply: &CreateReply) -> Result<(), ValidationError> {
    if reply.serial == 0 {
        return Err(ValidationError::Schema("serial must be non-zero".to_string()));
    }
    if reply.is_success() && reply.information > information::DOES_NOT_EXIST {
        return Err(ValidationError::Schema(format!(
            "unknown create outcome {}",
            reply.information
        )));
    }
    Ok(())
}
