// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Reconciles worker replies with the volume's object state

use crate::dispatch::Volume;
use crate::error::{BridgeError, BridgeResult};
use crate::pending::PendingEntry;
use crate::request::CreateOutcome;
use crate::types::{ControlBlockFlags, CreateInformation, CreateOptions, Disposition, InstanceFlags};
use bridgefs_proto::{validate_reply, CreateReply, ProtoError};
use tracing::debug;

impl Volume {
    /// Apply a worker reply to its pending create
    ///
    /// Returns `Ok(false)` when no create is waiting on the reply's serial,
    /// which is the case after a cancellation won the race.
    pub fn complete_create(&self, reply: &CreateReply) -> BridgeResult<bool> {
        validate_reply(reply).map_err(ProtoError::from)?;
        let Some(entry) = self.pending.take(reply.serial) else {
            debug!(serial = reply.serial, "reply for a create that is no longer pending");
            return Ok(false);
        };
        let irp = entry.irp.clone();
        let outcome = self.reconcile(entry, reply);
        irp.complete(outcome);
        Ok(true)
    }

    /// Decode an SSZ reply from the worker and apply it
    pub fn complete_create_bytes(&self, bytes: &[u8]) -> BridgeResult<bool> {
        let reply = CreateReply::decode(bytes)?;
        self.complete_create(&reply)
    }

    /// Cancel a queued create; false if a reply already finalized it
    pub fn cancel_create(&self, serial: u64) -> bool {
        let Some(entry) = self.pending.take(serial) else {
            return false;
        };
        debug!(serial, "create cancelled");
        self.fail_instance(&entry.irp, &entry.instance);
        entry.irp.complete(Err(BridgeError::Cancelled));
        true
    }

    fn reconcile(&self, entry: PendingEntry, reply: &CreateReply) -> CreateOutcome {
        let PendingEntry { irp, instance, .. } = entry;
        let request = irp.request();
        let cb = instance.control_block().clone();
        cb.check_identity()?;
        instance.check_identity()?;

        instance.set_user_context(reply.context);

        let information = CreateInformation::from_raw(reply.information);
        let mut result = if reply.is_success() {
            information.ok_or(BridgeError::InvalidParameter("unknown create outcome"))
        } else {
            Err(BridgeError::from_status(reply.status))
        };
        if information == Some(CreateInformation::NotFound)
            && self.config.read_only
            && request.disposition == Disposition::OpenIf
        {
            result = Err(BridgeError::WriteProtected);
        }

        let information = match result {
            Ok(information) => information,
            Err(err) => {
                debug!(serial = reply.serial, error = %err, "worker refused create");
                self.fail_instance(&irp, &instance);
                return Err(err);
            }
        };

        let directory = {
            let mut state = cb.state().write();
            if request.options.contains(CreateOptions::DIRECTORY_FILE) || reply.is_directory() {
                state.flags.insert(ControlBlockFlags::DIRECTORY);
            }
            instance.insert_flags(InstanceFlags::OPENED);
            if request.options.contains(CreateOptions::DELETE_ON_CLOSE) {
                state.flags.insert(ControlBlockFlags::DELETE_ON_CLOSE);
                instance.insert_flags(InstanceFlags::DELETE_ON_CLOSE);
            }
            instance.set_atomic_oplock_pending(false);
            state.flags.contains(ControlBlockFlags::DIRECTORY)
        };

        if information == CreateInformation::Created {
            self.notify_created(cb.path(), directory);
        }
        debug!(serial = reply.serial, ?information, path = %cb.path(), "create completed by worker");
        Ok(information)
    }

    #[cfg(feature = "notifications")]
    fn notify_created(&self, path: &str, directory: bool) {
        use crate::types::{ChangeAction, ChangeEvent, ChangeFilter};

        let Some(notifier) = &self.notifier else {
            return;
        };
        let filter = if directory {
            ChangeFilter::DirName
        } else {
            ChangeFilter::FileName
        };
        notifier.report(&ChangeEvent {
            path: path.to_string(),
            filter,
            action: ChangeAction::Added,
        });
    }

    #[cfg(not(feature = "notifications"))]
    fn notify_created(&self, path: &str, _directory: bool) {
        if self.notifier.is_some() {
            tracing::warn!(path, "change notifications are compiled out");
        }
    }
}
