// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Builds the worker-facing envelope for an accepted create

use crate::error::BridgeResult;
use crate::open_instance::OpenInstance;
use crate::request::CreateRequest;
use crate::security::SecuritySubsystem;
use crate::types::{ControlBlockFlags, CreateOptions, Disposition, RequestFlags};
use bridgefs_proto::{
    build_envelope, validate_header, AccessStateHeader, AccessStatePayload, CreateHeader,
    EnvelopeParams, ProtoError,
};
use tracing::trace;

/// Disposition as the worker should see it
///
/// A read-only volume asks the worker to open rather than create, so a
/// missing file comes back as "does not exist" instead of being created.
pub fn effective_disposition(disposition: Disposition, read_only: bool) -> Disposition {
    if read_only && disposition == Disposition::OpenIf {
        Disposition::Open
    } else {
        disposition
    }
}

pub(crate) struct EnvelopeSource<'a> {
    pub serial: u64,
    pub request: &'a CreateRequest,
    pub instance: &'a OpenInstance,
    pub control_flags: ControlBlockFlags,
    pub read_only: bool,
}

pub(crate) fn build_create_envelope(
    source: &EnvelopeSource<'_>,
    security: &dyn SecuritySubsystem,
) -> BridgeResult<Vec<u8>> {
    let request = source.request;
    let disposition = effective_disposition(request.disposition, source.read_only);

    let header = CreateHeader {
        serial: source.serial,
        session_id: source.instance.session_id(),
        process_id: source.instance.process_id(),
        control_flags: source.control_flags.bits(),
        desired_access: request.desired_access.bits(),
        file_attributes: request.file_attributes.bits(),
        create_options: disposition.pack(request.options),
        share_access: request.share_access.bits(),
    };
    validate_header(&header).map_err(ProtoError::from)?;

    let is_directory = request.options.contains(CreateOptions::DIRECTORY_FILE)
        || request.flags.contains(RequestFlags::OPEN_TARGET_DIRECTORY);
    let assigned = request.security.as_ref().and_then(|state| {
        let creator = state.security_descriptor.as_deref().unwrap_or(&[]);
        security.assign(creator, is_directory)
    });

    let built = {
        let access_state = request.security.as_ref().map(|state| AccessStatePayload {
            header: AccessStateHeader {
                security_evaluated: state.security_evaluated,
                generate_audit: state.generate_audit,
                generate_on_close: state.generate_on_close,
                audit_privileges: state.audit_privileges,
                flags: state.flags,
                remaining_desired_access: state.remaining_desired_access.bits(),
                previously_granted_access: state.previously_granted_access.bits(),
                original_desired_access: state.original_desired_access.bits(),
            },
            security_descriptor: assigned.as_ref().map(|sd| sd.as_bytes()),
            object_name: &state.object_name,
            object_type: &state.object_type,
        });
        build_envelope(&EnvelopeParams {
            header,
            access_state,
            file_name: source.instance.envelope_path(),
        })
    };

    // The copy is the only consumer of the assigned descriptor.
    if let Some(descriptor) = assigned {
        security.deassign(descriptor);
    }

    let bytes = built?;
    trace!(serial = source.serial, len = bytes.len(), "envelope built");
    Ok(bytes)
}
