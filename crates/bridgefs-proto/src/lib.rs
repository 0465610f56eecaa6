// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! BridgeFS Protocol: wire types exchanged with the out-of-process worker
//!
//! The create envelope is a flat, offset-addressed buffer handed to the
//! worker; the worker answers with an SSZ-encoded [`CreateReply`].

pub mod envelope;
pub mod error;
pub mod messages;
pub mod validation;

// Re-export key types
pub use envelope::{
    build_envelope, AccessStateHeader, AccessStatePayload, CreateHeader, EnvelopeParams,
    EnvelopeReader, NameRecord, ACCESS_STATE_OFFSET, CREATE_HEADER_SIZE, CREATE_PARAMS_OFFSET,
    ENVELOPE_ALIGNMENT, ENVELOPE_VERSION,
};
pub use error::ProtoError;
pub use messages::{information, CreateReply, REPLY_FLAG_DIRECTORY, STATUS_SUCCESS};
pub use validation::{validate_header, validate_reply, ValidationError};
