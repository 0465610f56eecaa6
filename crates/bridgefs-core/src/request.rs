// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Inbound create requests, the file objects they target and their
//! completion channel

use crate::error::{BridgeError, BridgeResult};
use crate::open_instance::OpenInstance;
use crate::types::{
    AccessMask, CreateInformation, CreateOptions, Disposition, FileAttributes, RequestFlags,
    ShareAccess,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::warn;

pub type CreateOutcome = BridgeResult<CreateInformation>;

/// Caller's access state as captured by the I/O layer
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessState {
    pub security_evaluated: bool,
    pub generate_audit: bool,
    pub generate_on_close: bool,
    pub audit_privileges: bool,
    pub flags: u32,
    pub remaining_desired_access: AccessMask,
    pub previously_granted_access: AccessMask,
    pub original_desired_access: AccessMask,
    /// Creator-supplied security descriptor, if any
    pub security_descriptor: Option<Vec<u8>>,
    pub object_name: String,
    pub object_type: String,
}

#[derive(Clone, Debug)]
pub struct CreateRequest {
    /// Requested name as supplied, before normalization
    pub path: String,
    /// Already-open object the name is relative to
    pub related: Option<Arc<FileObject>>,
    pub desired_access: AccessMask,
    pub share_access: ShareAccess,
    pub disposition: Disposition,
    pub options: CreateOptions,
    pub flags: RequestFlags,
    pub file_attributes: FileAttributes,
    pub process_id: u32,
    pub security: Option<AccessState>,
}

impl CreateRequest {
    /// Open an existing file for read with full sharing
    pub fn open(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            related: None,
            desired_access: AccessMask::READ_DATA,
            share_access: ShareAccess::READ | ShareAccess::WRITE | ShareAccess::DELETE,
            disposition: Disposition::Open,
            options: CreateOptions::empty(),
            flags: RequestFlags::empty(),
            file_attributes: FileAttributes::empty(),
            process_id: 0,
            security: None,
        }
    }

    pub fn with_disposition(mut self, disposition: Disposition) -> Self {
        self.disposition = disposition;
        self
    }

    pub fn with_access(mut self, access: AccessMask) -> Self {
        self.desired_access = access;
        self
    }

    pub fn with_share(mut self, share: ShareAccess) -> Self {
        self.share_access = share;
        self
    }

    pub fn with_options(mut self, options: CreateOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_flags(mut self, flags: RequestFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_attributes(mut self, attributes: FileAttributes) -> Self {
        self.file_attributes = attributes;
        self
    }

    pub fn with_related(mut self, related: Arc<FileObject>) -> Self {
        self.related = Some(related);
        self
    }

    pub fn with_process_id(mut self, process_id: u32) -> Self {
        self.process_id = process_id;
        self
    }

    pub fn with_security(mut self, security: AccessState) -> Self {
        self.security = Some(security);
        self
    }

    pub fn case_sensitive(&self) -> bool {
        self.flags.contains(RequestFlags::CASE_SENSITIVE)
    }

    pub fn wants_directory(&self) -> bool {
        self.options.contains(CreateOptions::DIRECTORY_FILE)
    }

    pub fn targets_parent(&self) -> bool {
        self.flags.contains(RequestFlags::OPEN_TARGET_DIRECTORY)
    }
}

/// What a file object refers to once a create has attached to it
#[derive(Clone)]
pub enum FileContext {
    /// Whole-volume open; no control block is involved
    Volume,
    Open(Arc<OpenInstance>),
}

/// Handle-level object a create attaches its open instance to
#[derive(Default)]
pub struct FileObject {
    context: Mutex<Option<FileContext>>,
}

impl std::fmt::Debug for FileObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let context = match &*self.context.lock() {
            None => "none".to_string(),
            Some(FileContext::Volume) => "volume".to_string(),
            Some(FileContext::Open(oi)) => format!("instance {}", oi.id().0),
        };
        f.debug_struct("FileObject")
            .field("context", &context)
            .finish()
    }
}

impl FileObject {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn context(&self) -> Option<FileContext> {
        self.context.lock().clone()
    }

    pub fn instance(&self) -> Option<Arc<OpenInstance>> {
        match &*self.context.lock() {
            Some(FileContext::Open(oi)) => Some(oi.clone()),
            _ => None,
        }
    }

    pub fn is_volume_open(&self) -> bool {
        matches!(&*self.context.lock(), Some(FileContext::Volume))
    }

    pub fn set_context(&self, context: FileContext) {
        *self.context.lock() = Some(context);
    }

    pub fn clear_context(&self) -> Option<FileContext> {
        self.context.lock().take()
    }
}

/// Receiving half of a create's completion
pub struct CompletionReceiver {
    rx: oneshot::Receiver<CreateOutcome>,
}

impl CompletionReceiver {
    /// Wait for the create to finish; a dropped request reads as cancelled
    pub async fn wait(self) -> CreateOutcome {
        self.rx.await.unwrap_or(Err(BridgeError::Cancelled))
    }

    /// Non-blocking poll; `None` while the create is still outstanding
    pub fn try_take(&mut self) -> Option<CreateOutcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(BridgeError::Cancelled)),
        }
    }
}

/// One in-flight create: the request, its file object and a
/// complete-exactly-once channel back to the caller
pub struct CreateIrp {
    request: CreateRequest,
    file_object: Arc<FileObject>,
    completion: Mutex<Option<oneshot::Sender<CreateOutcome>>>,
    serial: AtomicU64,
}

impl std::fmt::Debug for CreateIrp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreateIrp")
            .field("path", &self.request.path)
            .field("serial", &self.serial())
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl CreateIrp {
    pub fn new(request: CreateRequest, file_object: Arc<FileObject>) -> (Arc<Self>, CompletionReceiver) {
        let (tx, rx) = oneshot::channel();
        let irp = Arc::new(Self {
            request,
            file_object,
            completion: Mutex::new(Some(tx)),
            serial: AtomicU64::new(0),
        });
        (irp, CompletionReceiver { rx })
    }

    pub fn request(&self) -> &CreateRequest {
        &self.request
    }

    pub fn file_object(&self) -> &Arc<FileObject> {
        &self.file_object
    }

    /// Serial of the envelope last issued for this request; 0 before any
    pub fn serial(&self) -> u64 {
        self.serial.load(Ordering::Acquire)
    }

    pub(crate) fn set_serial(&self, serial: u64) {
        self.serial.store(serial, Ordering::Release);
    }

    pub fn is_completed(&self) -> bool {
        self.completion.lock().is_none()
    }

    /// Deliver the final outcome; returns false if already completed
    pub fn complete(&self, outcome: CreateOutcome) -> bool {
        let Some(tx) = self.completion.lock().take() else {
            warn!(path = %self.request.path, "create completed twice");
            return false;
        };
        // The caller may have stopped waiting; the outcome is still final.
        let _ = tx.send(outcome);
        true
    }
}
