// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Security-descriptor assignment seam

/// Descriptor produced for a new object
///
/// Handed back to the subsystem through [`SecuritySubsystem::deassign`]
/// once its bytes have been copied out.
#[derive(Debug, PartialEq, Eq)]
pub struct AssignedDescriptor {
    bytes: Vec<u8>,
}

impl AssignedDescriptor {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait SecuritySubsystem: Send + Sync {
    /// Derive the descriptor for a new object from the creator's descriptor
    fn assign(&self, creator: &[u8], is_directory: bool) -> Option<AssignedDescriptor>;

    fn deassign(&self, descriptor: AssignedDescriptor);
}

/// Assigns nothing; envelopes carry no descriptor
#[derive(Debug, Default)]
pub struct NoSecurity;

impl SecuritySubsystem for NoSecurity {
    fn assign(&self, _creator: &[u8], _is_directory: bool) -> Option<AssignedDescriptor> {
        None
    }

    fn deassign(&self, _descriptor: AssignedDescriptor) {}
}

/// Uses the creator's descriptor unchanged
#[derive(Debug, Default)]
pub struct PassThroughSecurity;

impl SecuritySubsystem for PassThroughSecurity {
    fn assign(&self, creator: &[u8], _is_directory: bool) -> Option<AssignedDescriptor> {
        if creator.is_empty() {
            None
        } else {
            Some(AssignedDescriptor::new(creator.to_vec()))
        }
    }

    fn deassign(&self, _descriptor: AssignedDescriptor) {}
}
