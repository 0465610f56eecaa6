// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Encoding and decoding errors for worker messages

use crate::validation::ValidationError;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtoError {
    #[error("buffer truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("unsupported envelope version {0}")]
    BadVersion(u32),
    #[error("sub-record at offset {offset} is out of bounds or misaligned")]
    BadOffset { offset: usize },
    #[error("name of {0} bytes does not fit a name record")]
    NameTooLong(usize),
    #[error("name is not valid UTF-16")]
    BadName,
    #[error("SSZ decoding failed: {0}")]
    SszDecode(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}
