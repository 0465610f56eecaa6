// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-volume state and the create dispatcher
//!
//! A create runs name resolution, control-block acquisition, instance
//! allocation, share and oplock arbitration, then queues an envelope for the
//! worker. Any failure unwinds everything the attempt took. An oplock break
//! may suspend the attempt; its continuation re-queues the request through
//! the volume's deferred channel, and the replay resumes at arbitration with
//! the instance already attached to the file object.

use crate::config::{BridgeConfig, ConfigError};
use crate::control_block::{ControlBlock, ControlBlockCache, ControlBlockState};
use crate::envelope::{build_create_envelope, EnvelopeSource};
use crate::error::{BridgeError, BridgeResult};
use crate::open_instance::{InstanceRegistry, OpenInstance};
use crate::oplock::{
    AtomicOplock, BreakStatus, NoOplocks, OplockCheck, OplockContinuation, OplockEngine,
};
use crate::path::{
    check_stream_name, join_related, normalize, parent_dir, paths_equal, starts_with_ignore_case,
    ROOT,
};
use crate::pending::{Deferred, PendingTable, QueuedEnvelope};
use crate::request::{CreateIrp, CreateRequest, FileContext, FileObject};
use crate::security::{NoSecurity, SecuritySubsystem};
use crate::share::{check_open, ShareGrant};
use crate::types::{
    ChangeNotifier, ControlBlockFlags, CreateInformation, CreateOptions, Disposition,
    FileAttributes, InstanceFlags, InstanceId, RequestFlags, VolumeStats,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, debug_span, error, info, warn};

const SYSTEM_VOLUME_INFORMATION: &str = "\\System Volume Information";

/// What the caller of [`Volume::dispatch_create`] should do next
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchStatus {
    /// The outcome will arrive later on the request's completion channel
    Pending,
    /// The outcome has already been delivered
    Completed,
}

enum Step {
    Done(CreateInformation),
    Suspended,
}

pub struct VolumeBuilder {
    config: BridgeConfig,
    oplocks: Arc<dyn OplockEngine>,
    security: Arc<dyn SecuritySubsystem>,
    notifier: Option<Arc<dyn ChangeNotifier>>,
}

impl VolumeBuilder {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            oplocks: Arc::new(NoOplocks::default()),
            security: Arc::new(NoSecurity),
            notifier: None,
        }
    }

    pub fn oplocks(mut self, oplocks: Arc<dyn OplockEngine>) -> Self {
        self.oplocks = oplocks;
        self
    }

    pub fn security(mut self, security: Arc<dyn SecuritySubsystem>) -> Self {
        self.security = security;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn ChangeNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn build(self) -> Result<Arc<Volume>, ConfigError> {
        self.config.validate()?;
        let (deferred_tx, deferred_rx) = mpsc::unbounded_channel();
        let cache = ControlBlockCache::new(
            self.oplocks.clone(),
            self.config.gc.clone(),
            self.config.reserved_names.clone(),
            self.config.limits.max_control_blocks,
        );
        Ok(Arc::new(Volume {
            instances: InstanceRegistry::new(self.config.session_id),
            config: self.config,
            cache,
            pending: PendingTable::new(),
            suspended: Mutex::new(HashMap::new()),
            oplocks: self.oplocks,
            security: self.security,
            notifier: self.notifier,
            worker_attached: AtomicBool::new(false),
            unmount_pending: AtomicBool::new(false),
            envelopes_queued: AtomicU64::new(0),
            deferred_tx,
            deferred_rx: tokio::sync::Mutex::new(deferred_rx),
            shutdown: Notify::new(),
        }))
    }
}

/// One mounted volume: its caches, pending table and collaborators
pub struct Volume {
    pub(crate) config: BridgeConfig,
    pub(crate) cache: ControlBlockCache,
    pub(crate) instances: InstanceRegistry,
    pub(crate) pending: PendingTable,
    /// Creates parked on an oplock break or check, by open instance
    suspended: Mutex<HashMap<InstanceId, Arc<CreateIrp>>>,
    pub(crate) oplocks: Arc<dyn OplockEngine>,
    security: Arc<dyn SecuritySubsystem>,
    pub(crate) notifier: Option<Arc<dyn ChangeNotifier>>,
    worker_attached: AtomicBool,
    unmount_pending: AtomicBool,
    envelopes_queued: AtomicU64,
    deferred_tx: mpsc::UnboundedSender<Deferred>,
    deferred_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Deferred>>,
    shutdown: Notify,
}

impl Volume {
    pub fn builder(config: BridgeConfig) -> VolumeBuilder {
        VolumeBuilder::new(config)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn control_blocks(&self) -> &ControlBlockCache {
        &self.cache
    }

    pub fn attach_worker(&self) {
        self.worker_attached.store(true, Ordering::Release);
        info!("worker attached");
    }

    pub fn detach_worker(&self) {
        self.worker_attached.store(false, Ordering::Release);
        info!("worker detached");
    }

    pub fn is_worker_attached(&self) -> bool {
        self.worker_attached.load(Ordering::Acquire)
    }

    pub fn is_unmounting(&self) -> bool {
        self.unmount_pending.load(Ordering::Acquire)
    }

    /// Process one create request
    ///
    /// The final outcome is always delivered through the request's
    /// completion channel, either before this returns (`Completed`) or
    /// later (`Pending`).
    pub fn dispatch_create(&self, irp: &Arc<CreateIrp>) -> DispatchStatus {
        let request = irp.request();
        let span = debug_span!(
            "create",
            path = %request.path,
            disposition = ?request.disposition,
            pid = request.process_id,
            serial = tracing::field::Empty
        );
        let _enter = span.enter();

        match self.create(irp) {
            Ok(Step::Suspended) => DispatchStatus::Pending,
            Ok(Step::Done(information)) => {
                debug!(?information, "create completed");
                irp.complete(Ok(information));
                DispatchStatus::Completed
            }
            Err(err) => {
                debug!(error = %err, "create failed");
                irp.complete(Err(err));
                DispatchStatus::Completed
            }
        }
    }

    fn create(&self, irp: &Arc<CreateIrp>) -> BridgeResult<Step> {
        if let Some(oi) = irp.file_object().instance() {
            if oi.take_retry() {
                debug!(instance = oi.id().0, "replaying create after oplock break");
                return self.resume(irp, &oi);
            }
        }

        if self.is_unmounting() {
            return Err(BridgeError::NoSuchDevice);
        }

        let request = irp.request();
        if !self.is_worker_attached() && !self.is_reserved_name(&request.path) {
            if starts_with_ignore_case(&request.path, SYSTEM_VOLUME_INFORMATION) {
                return Err(BridgeError::NotFound);
            }
            debug!("worker not attached, completing without a control block");
            return Ok(Step::Done(CreateInformation::Opened));
        }

        let name = normalize(&request.path);
        let related = self.related_path(request)?;

        if name.is_empty() && related.is_none() {
            if request.options.contains(CreateOptions::DIRECTORY_FILE) {
                return Err(BridgeError::NotADirectory);
            }
            irp.file_object().set_context(FileContext::Volume);
            debug!("volume opened");
            return Ok(Step::Done(CreateInformation::Opened));
        }

        let full = match &related {
            Some(base) => join_related(base, &name)?,
            None => name.clone(),
        };
        check_stream_name(&name, self.config.alternate_streams)?;

        if self.config.read_only
            && (request.disposition.writes()
                || request.options.contains(CreateOptions::DELETE_ON_CLOSE))
        {
            return Err(BridgeError::WriteProtected);
        }

        let lookup = if request.targets_parent() {
            parent_dir(&full)?
        } else {
            full
        };
        let cb = self
            .cache
            .acquire_or_create(&lookup, request.case_sensitive())?;

        let result = self.admit(irp, &cb);
        if result.is_err() {
            self.detach(irp, &cb);
        }
        result
    }

    fn is_reserved_name(&self, path: &str) -> bool {
        let reserved = &self.config.reserved_names;
        paths_equal(path, &reserved.keepalive, false)
            || paths_equal(path, &reserved.notification, false)
    }

    /// Copy the related object's path under its control block's shared lock
    fn related_path(&self, request: &CreateRequest) -> BridgeResult<Option<String>> {
        let Some(related) = &request.related else {
            return Ok(None);
        };
        match related.context() {
            Some(FileContext::Open(roi)) => {
                roi.check_identity()?;
                let rcb = roi.control_block();
                rcb.check_identity()?;
                let _shared = rcb.state().read();
                Ok(Some(rcb.path().to_string()))
            }
            Some(FileContext::Volume) => Ok(Some(ROOT.to_string())),
            None => Err(BridgeError::InvalidParameter("related file object is not open")),
        }
    }

    /// Checks that need the acquired control block, then the locked phase
    fn admit(&self, irp: &Arc<CreateIrp>, cb: &Arc<ControlBlock>) -> BridgeResult<Step> {
        let request = irp.request();

        if cb.open_count() > 1 && request.disposition == Disposition::Create {
            return Err(BridgeError::NameCollision);
        }
        if request.options.contains(CreateOptions::DIRECTORY_FILE)
            && request.file_attributes.contains(FileAttributes::TEMPORARY)
            && matches!(
                request.disposition,
                Disposition::Create | Disposition::OpenIf
            )
        {
            return Err(BridgeError::InvalidParameter(
                "directories cannot be temporary",
            ));
        }

        let mut state = cb.state().write();
        cb.check_identity()?;
        if request.flags.contains(RequestFlags::OPEN_PAGING_FILE) {
            return Err(BridgeError::AccessDenied);
        }

        let oi = self.instances.allocate(
            cb,
            &mut state,
            request.process_id,
            cb.path().to_string(),
        )?;
        irp.file_object().set_context(FileContext::Open(oi.clone()));

        if state.flags.contains(ControlBlockFlags::KEEPALIVE) {
            info!(pid = request.process_id, "keepalive channel opened");
        }
        if state.flags.contains(ControlBlockFlags::DISPATCH_BLOCKED) {
            oi.insert_flags(InstanceFlags::OPENED);
            return Ok(Step::Done(CreateInformation::Opened));
        }

        self.arbitrate_or_unwind(irp, cb, &oi, &mut state)
    }

    /// Replay a suspended create from arbitration
    fn resume(&self, irp: &Arc<CreateIrp>, oi: &Arc<OpenInstance>) -> BridgeResult<Step> {
        let cb = oi.control_block().clone();
        cb.check_identity()?;
        oi.check_identity()?;

        let result = {
            let mut state = cb.state().write();
            if self.is_unmounting() {
                self.unwind_locked(irp.request(), &cb, oi, &mut state);
                Err(BridgeError::NoSuchDevice)
            } else {
                self.arbitrate_or_unwind(irp, &cb, oi, &mut state)
            }
        };
        if result.is_err() {
            self.detach(irp, &cb);
        }
        result
    }

    fn arbitrate_or_unwind(
        &self,
        irp: &Arc<CreateIrp>,
        cb: &Arc<ControlBlock>,
        oi: &Arc<OpenInstance>,
        state: &mut ControlBlockState,
    ) -> BridgeResult<Step> {
        let result = self.arbitrate(irp, cb, oi, state);
        if result.is_err() {
            self.unwind_locked(irp.request(), cb, oi, state);
        }
        result
    }

    /// Share check, oplock checks, then hand the envelope to the worker
    ///
    /// Runs with the control block's write lock held.
    fn arbitrate(
        &self,
        irp: &Arc<CreateIrp>,
        cb: &Arc<ControlBlock>,
        oi: &Arc<OpenInstance>,
        state: &mut ControlBlockState,
    ) -> BridgeResult<Step> {
        let request = irp.request();
        let open_count = cb.open_count();

        // A replay after a suspended oplock check already holds its grant.
        if oi.share_grant().is_none() {
            let grant = if open_count <= 1 {
                state
                    .share_access
                    .set(request.desired_access, request.share_access)
            } else {
                let checked = self.check_share(request, state);
                let grant = match checked {
                    Err(BridgeError::SharingViolation)
                        if !request
                            .options
                            .contains(CreateOptions::COMPLETE_IF_OPLOCKED) =>
                    {
                        self.park(irp, oi);
                        let status =
                            self.oplocks
                                .break_handle(cb.oplock(), request, self.continuation(oi));
                        if !matches!(status, BreakStatus::Pending) {
                            self.unpark(oi);
                        }
                        match status {
                            BreakStatus::Pending => {
                                debug!("sharing violation, waiting for handle oplock break");
                                return Ok(Step::Suspended);
                            }
                            BreakStatus::Failed(err) => return Err(err),
                            BreakStatus::NoBreakNeeded => self.check_share(request, state)?,
                        }
                    }
                    other => other?,
                };
                state.share_access.update(&grant);
                grant
            };
            oi.set_share_grant(grant);
        }

        if open_count > 1 {
            self.park(irp, oi);
            let check = self
                .oplocks
                .check_oplock(cb.oplock(), request, self.continuation(oi));
            if !matches!(check, OplockCheck::Pending) {
                self.unpark(oi);
            }
            match check {
                OplockCheck::Granted => {}
                OplockCheck::Pending => {
                    debug!("waiting for oplock check");
                    return Ok(Step::Suspended);
                }
                OplockCheck::Denied(err) => return Err(err),
            }
        }

        self.oplocks.check_oplock_key(cb.oplock(), request)?;

        if request
            .options
            .contains(CreateOptions::OPEN_REQUIRING_OPLOCK)
            && !oi.atomic_oplock_pending()
        {
            match self
                .oplocks
                .request_atomic_oplock(cb.oplock(), request, open_count)
            {
                AtomicOplock::Granted => oi.set_atomic_oplock_pending(true),
                AtomicOplock::BreakInProgress => {
                    debug!("atomic oplock break in progress, continuing without it")
                }
                AtomicOplock::Failed(err) => return Err(err),
            }
        }

        self.queue_envelope(irp, oi, state)
    }

    fn check_share(
        &self,
        request: &CreateRequest,
        state: &ControlBlockState,
    ) -> BridgeResult<ShareGrant> {
        check_open(
            &state.share_access,
            state.flags.contains(ControlBlockFlags::DELETE_ON_CLOSE),
            state.writable_mapping,
            request.desired_access,
            request.share_access,
        )
    }

    fn queue_envelope(
        &self,
        irp: &Arc<CreateIrp>,
        oi: &Arc<OpenInstance>,
        state: &ControlBlockState,
    ) -> BridgeResult<Step> {
        let serial = self.pending.next_serial();
        let envelope = build_create_envelope(
            &EnvelopeSource {
                serial,
                request: irp.request(),
                instance: oi,
                control_flags: state.flags,
                read_only: self.config.read_only,
            },
            self.security.as_ref(),
        )?;
        self.pending
            .register(serial, irp.clone(), oi.clone(), envelope)?;
        self.envelopes_queued.fetch_add(1, Ordering::Relaxed);
        tracing::Span::current().record("serial", serial);
        debug!(serial, "create queued for worker");
        Ok(Step::Suspended)
    }

    /// Record a create before handing the engine a continuation for it
    ///
    /// The engine may fire the continuation on another thread as soon as it
    /// answers pending, so the entry must already be visible.
    fn park(&self, irp: &Arc<CreateIrp>, oi: &OpenInstance) {
        self.suspended.lock().insert(oi.id(), irp.clone());
    }

    fn unpark(&self, oi: &OpenInstance) {
        self.suspended.lock().remove(&oi.id());
    }

    fn continuation(&self, oi: &OpenInstance) -> OplockContinuation {
        let tx = self.deferred_tx.clone();
        let instance = oi.id();
        Box::new(move |result| {
            let work = match result {
                Ok(()) => Deferred::Retry(instance),
                Err(err) => Deferred::Fail(instance, err),
            };
            if tx.send(work).is_err() {
                warn!("volume dropped before oplock continuation fired");
            }
        })
    }

    /// Undo the locked part of an attempt: atomic oplock, share grant, instance
    pub(crate) fn unwind_locked(
        &self,
        request: &CreateRequest,
        cb: &ControlBlock,
        oi: &OpenInstance,
        state: &mut ControlBlockState,
    ) {
        if oi.atomic_oplock_pending() {
            self.oplocks.back_out_atomic_oplock(cb.oplock(), request);
            oi.set_atomic_oplock_pending(false);
        }
        if let Some(grant) = oi.take_share_grant() {
            state.share_access.remove(&grant);
        }
        if let Err(err) = self.instances.free(oi, state) {
            error!(error = %err, "failed to free open instance during unwind");
        }
    }

    /// Undo the unlocked part: drop the control-block reference and detach
    /// the file object
    pub(crate) fn detach(&self, irp: &CreateIrp, cb: &Arc<ControlBlock>) {
        if let Err(err) = self.cache.release(cb) {
            error!(error = %err, "failed to release control block during unwind");
        }
        irp.file_object().clear_context();
    }

    /// Full failure unwind for an attempt that already owns an instance
    ///
    /// A no-op when another path already unwound the instance.
    pub(crate) fn fail_instance(&self, irp: &CreateIrp, oi: &Arc<OpenInstance>) {
        let cb = oi.control_block().clone();
        if cb.check_identity().is_err() {
            irp.file_object().clear_context();
            return;
        }
        let unwound = {
            let mut state = cb.state().write();
            if oi.is_live() {
                self.unwind_locked(irp.request(), &cb, oi, &mut state);
                true
            } else {
                false
            }
        };
        if unwound {
            self.detach(irp, &cb);
        }
    }

    fn handle_deferred(&self, work: Deferred) {
        let (instance, failure) = match work {
            Deferred::Retry(instance) => (instance, None),
            Deferred::Fail(instance, err) => (instance, Some(err)),
        };
        // Whoever removes the entry owns the completion.
        let Some(irp) = self.suspended.lock().remove(&instance) else {
            debug!(
                instance = instance.0,
                "oplock continuation for a create that already completed"
            );
            return;
        };
        match failure {
            None => match irp.file_object().instance() {
                Some(oi) => {
                    oi.insert_flags(InstanceFlags::RETRY_CREATE);
                    self.dispatch_create(&irp);
                }
                None => {
                    irp.complete(Err(BridgeError::invalid_state(
                        "retried create has no open instance",
                    )));
                }
            },
            Some(err) => {
                debug!(path = %irp.request().path, error = %err, "oplock continuation failed create");
                if let Some(oi) = irp.file_object().instance() {
                    self.fail_instance(&irp, &oi);
                }
                irp.complete(Err(err));
            }
        }
    }

    /// Run queued retries and failures on the calling thread
    ///
    /// Returns 0 without doing anything while [`run_deferred_worker`]
    /// owns the queue.
    ///
    /// [`run_deferred_worker`]: Self::run_deferred_worker
    pub fn process_deferred(&self) -> usize {
        let Ok(mut rx) = self.deferred_rx.try_lock() else {
            return 0;
        };
        let mut handled = 0;
        while let Ok(work) = rx.try_recv() {
            self.handle_deferred(work);
            handled += 1;
        }
        handled
    }

    /// Drain retries and failures until the volume starts unmounting
    pub async fn run_deferred_worker(self: Arc<Self>) {
        let mut rx = self.deferred_rx.lock().await;
        loop {
            if self.is_unmounting() {
                break;
            }
            tokio::select! {
                work = rx.recv() => match work {
                    Some(work) => self.handle_deferred(work),
                    None => break,
                },
                _ = self.shutdown.notified() => break,
            }
        }
        while let Ok(work) = rx.try_recv() {
            self.handle_deferred(work);
        }
        debug!("deferred worker stopped");
    }

    /// Periodically collect control blocks whose grace period has ended
    pub fn spawn_collector(self: &Arc<Self>) -> JoinHandle<()> {
        let volume = Arc::downgrade(self);
        let period = Duration::from_millis(self.config.gc.sweep_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(volume) = volume.upgrade() else {
                    break;
                };
                if volume.is_unmounting() {
                    break;
                }
                volume.cache.collect_garbage(Instant::now());
            }
            debug!("control block collector stopped");
        })
    }

    /// Fail every outstanding create and refuse new ones
    ///
    /// Covers creates queued for the worker and creates parked on an oplock
    /// break; a continuation that fires afterwards finds nothing to resume.
    pub fn begin_unmount(&self) -> usize {
        self.unmount_pending.store(true, Ordering::Release);
        let drained = self.pending.shutdown();
        let mut failed = drained.len();
        for entry in drained {
            self.fail_instance(&entry.irp, &entry.instance);
            entry.irp.complete(Err(BridgeError::NoSuchDevice));
        }

        let parked: Vec<Arc<CreateIrp>> = self
            .suspended
            .lock()
            .drain()
            .map(|(_, irp)| irp)
            .collect();
        failed += parked.len();
        for irp in parked {
            if let Some(oi) = irp.file_object().instance() {
                self.fail_instance(&irp, &oi);
            }
            irp.complete(Err(BridgeError::NoSuchDevice));
        }
        self.shutdown.notify_one();
        info!(failed, "volume unmount started");
        failed
    }

    /// Close a handle: drop its share grant, instance and control-block reference
    pub fn close(&self, file_object: &FileObject) -> BridgeResult<()> {
        let oi = match file_object.context() {
            None => return Err(BridgeError::InvalidParameter("file object is not open")),
            Some(FileContext::Volume) => {
                file_object.clear_context();
                return Ok(());
            }
            Some(FileContext::Open(oi)) => oi,
        };
        oi.check_identity()?;
        if !oi.flags().contains(InstanceFlags::OPENED) {
            return Err(BridgeError::InvalidParameter("create has not completed"));
        }
        file_object.clear_context();

        let cb = oi.control_block().clone();
        {
            let mut state = cb.state().write();
            cb.check_identity()?;
            if let Some(grant) = oi.take_share_grant() {
                state.share_access.remove(&grant);
            }
            self.instances.free(&oi, &mut state)?;
        }
        debug!(path = %cb.path(), instance = oi.id().0, "handle closed");
        self.cache.release(&cb)
    }

    pub fn try_next_envelope(&self) -> Option<QueuedEnvelope> {
        self.pending.try_next_envelope()
    }

    /// Wait for the next envelope for the worker; `None` after unmount
    pub async fn next_envelope(&self) -> Option<QueuedEnvelope> {
        self.pending.next_envelope().await
    }

    pub fn pending_creates(&self) -> usize {
        self.pending.len()
    }

    /// Creates waiting on an oplock break or check
    pub fn suspended_creates(&self) -> usize {
        self.suspended.lock().len()
    }

    pub fn stats(&self) -> VolumeStats {
        let cache = self.cache.stats();
        VolumeStats {
            control_blocks_allocated: cache.allocated,
            control_blocks_freed: cache.freed,
            control_blocks_cached: cache.cached,
            pending_deletions: cache.pending_deletion,
            instances_allocated: self.instances.allocated(),
            instances_freed: self.instances.freed(),
            envelopes_queued: self.envelopes_queued.load(Ordering::Relaxed),
        }
    }
}
