// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use crate::config::BridgeConfig;
use crate::dispatch::{DispatchStatus, Volume};
use crate::error::{status, BridgeError};
use crate::oplock::{AtomicOplock, BreakStatus, MockOplockEngine, NoOplocks};
use crate::request::{CreateRequest, FileObject};
use crate::testing::{answer_next, logs, submit, volume, RecordingNotifier, Scripted, ScriptedOplock};
use crate::types::{
    AccessMask, ChangeAction, ChangeFilter, ControlBlockFlags, CreateInformation, CreateOptions,
    Disposition, FileAttributes, InstanceFlags, OplockId, RequestFlags, ShareAccess,
};
use bridgefs_proto::{information, CreateReply, EnvelopeReader};
use std::sync::Arc;

fn opened(serial: u64) -> CreateReply {
    CreateReply::success(serial, information::OPENED, 0xC0FFEE)
}

fn exclusive(path: &str) -> CreateRequest {
    CreateRequest::open(path)
        .with_access(AccessMask::READ_DATA | AccessMask::WRITE_DATA)
        .with_share(ShareAccess::empty())
}

fn default_volume(oplocks: Arc<ScriptedOplock>) -> Arc<Volume> {
    volume(BridgeConfig::default(), oplocks)
}

#[test]
fn test_open_round_trip_through_worker() {
    let volume = default_volume(Arc::new(ScriptedOplock::new()));
    let mut s = submit(&volume, CreateRequest::open("\\docs\\a.txt").with_process_id(12));
    assert_eq!(s.status, DispatchStatus::Pending);
    assert!(s.completion.try_take().is_none());
    assert_eq!(volume.pending_creates(), 1);

    let queued = volume.try_next_envelope().unwrap();
    let reader = EnvelopeReader::parse(&queued.bytes).unwrap();
    assert_eq!(reader.file_name().unwrap(), "\\docs\\a.txt");
    assert_eq!(reader.header().process_id, 12);
    assert_eq!(reader.header().serial, queued.serial);
    assert_eq!(s.irp.serial(), queued.serial);

    assert!(volume.complete_create(&opened(queued.serial)).unwrap());
    assert!(matches!(
        s.completion.try_take(),
        Some(Ok(CreateInformation::Opened))
    ));

    let oi = s.file_object.instance().unwrap();
    assert!(oi.flags().contains(InstanceFlags::OPENED));
    assert_eq!(oi.user_context(), 0xC0FFEE);
    assert_eq!(oi.control_block().open_count(), 1);

    volume.close(&s.file_object).unwrap();
    assert!(s.file_object.context().is_none());
    assert!(!oi.is_live());
    let stats = volume.stats();
    assert_eq!(stats.instances_allocated, 1);
    assert_eq!(stats.instances_freed, 1);
    assert_eq!(stats.envelopes_queued, 1);
    assert_eq!(stats.pending_deletions, 1);
}

#[test]
fn test_exclusive_create_on_open_path_collides() {
    let volume = default_volume(Arc::new(ScriptedOplock::new()));
    let first = submit(&volume, CreateRequest::open("\\a"));
    answer_next(&volume, opened);

    let mut second = submit(
        &volume,
        CreateRequest::open("\\a").with_disposition(Disposition::Create),
    );
    assert_eq!(second.status, DispatchStatus::Completed);
    assert!(matches!(
        second.completion.try_take(),
        Some(Err(BridgeError::NameCollision))
    ));
    assert!(second.file_object.context().is_none());

    let cb = first.file_object.instance().unwrap().control_block().clone();
    assert_eq!(cb.open_count(), 1);
    assert_eq!(volume.stats().instances_allocated, 1);
}

#[test]
fn test_sharing_violation_without_break_unwinds() {
    let oplocks = Arc::new(ScriptedOplock::new());
    let volume = default_volume(oplocks.clone());
    let first = submit(&volume, exclusive("\\f"));
    answer_next(&volume, opened);

    let mut second = submit(&volume, CreateRequest::open("\\f"));
    assert!(matches!(
        second.completion.try_take(),
        Some(Err(BridgeError::SharingViolation))
    ));
    assert_eq!(oplocks.break_calls(), 1);
    assert!(second.file_object.context().is_none());

    let cb = first.file_object.instance().unwrap().control_block().clone();
    assert_eq!(cb.open_count(), 1);
    let state = cb.state().read();
    assert_eq!(state.share_access.open_count, 1);
    assert_eq!(state.instances().len(), 1);
}

#[test]
fn test_sharing_violation_resolved_by_break_and_retry() {
    let oplocks = Arc::new(ScriptedOplock::new());
    let volume = default_volume(oplocks.clone());
    let first = submit(&volume, exclusive("\\shared.txt"));
    answer_next(&volume, opened);

    oplocks.on_break(Scripted::Hold);
    let mut second = submit(&volume, CreateRequest::open("\\shared.txt"));
    assert_eq!(second.status, DispatchStatus::Pending);
    assert!(second.completion.try_take().is_none());
    assert_eq!(oplocks.held(), 1);
    // Suspended on the break, not queued for the worker.
    assert!(volume.try_next_envelope().is_none());
    let waiting = second.file_object.instance().unwrap();
    assert!(waiting.share_grant().is_none());

    volume.close(&first.file_object).unwrap();
    assert_eq!(oplocks.release_held(Ok(())), 1);
    assert_eq!(volume.process_deferred(), 1);

    answer_next(&volume, opened);
    assert!(matches!(
        second.completion.try_take(),
        Some(Ok(CreateInformation::Opened))
    ));
    let oi = second.file_object.instance().unwrap();
    assert!(Arc::ptr_eq(&oi, &waiting));
    assert!(!oi.flags().contains(InstanceFlags::RETRY_CREATE));
    assert_eq!(oi.control_block().open_count(), 1);
    assert_eq!(volume.stats().instances_allocated, 2);
}

#[test]
fn test_failed_break_continuation_fails_create() {
    let oplocks = Arc::new(ScriptedOplock::new());
    let volume = default_volume(oplocks.clone());
    let first = submit(&volume, exclusive("\\f"));
    answer_next(&volume, opened);

    oplocks.on_break(Scripted::Hold);
    let mut second = submit(&volume, CreateRequest::open("\\f"));
    let waiting = second.file_object.instance().unwrap();

    oplocks.release_held(Err(BridgeError::AccessDenied));
    volume.process_deferred();
    assert!(matches!(
        second.completion.try_take(),
        Some(Err(BridgeError::AccessDenied))
    ));
    assert!(!waiting.is_live());
    assert!(second.file_object.context().is_none());
    let cb = first.file_object.instance().unwrap().control_block().clone();
    assert_eq!(cb.open_count(), 1);
}

#[test]
fn test_complete_if_oplocked_violation_is_terminal() {
    let oplocks = Arc::new(ScriptedOplock::new());
    let volume = default_volume(oplocks.clone());
    submit(&volume, exclusive("\\f"));
    answer_next(&volume, opened);

    let mut second = submit(
        &volume,
        CreateRequest::open("\\f").with_options(CreateOptions::COMPLETE_IF_OPLOCKED),
    );
    assert!(matches!(
        second.completion.try_take(),
        Some(Err(BridgeError::SharingViolation))
    ));
    assert_eq!(oplocks.break_calls(), 0);
}

#[test]
fn test_suspended_oplock_check_keeps_share_grant_on_replay() {
    let oplocks = Arc::new(ScriptedOplock::new());
    let volume = default_volume(oplocks.clone());
    let first = submit(&volume, CreateRequest::open("\\f"));
    answer_next(&volume, opened);

    oplocks.on_check(Scripted::Hold);
    let mut second = submit(&volume, CreateRequest::open("\\f"));
    assert_eq!(second.status, DispatchStatus::Pending);
    assert!(second.file_object.instance().unwrap().share_grant().is_some());

    oplocks.release_held(Ok(()));
    volume.process_deferred();
    answer_next(&volume, opened);
    assert!(matches!(
        second.completion.try_take(),
        Some(Ok(CreateInformation::Opened))
    ));

    let cb = first.file_object.instance().unwrap().control_block().clone();
    assert_eq!(cb.state().read().share_access.open_count, 2);
    assert_eq!(cb.open_count(), 2);
}

#[test]
fn test_read_only_refuses_mutating_dispositions_without_envelope() {
    let volume = volume(
        BridgeConfig::default().read_only(),
        Arc::new(NoOplocks::default()),
    );
    let writes = [
        Disposition::Create,
        Disposition::Overwrite,
        Disposition::OverwriteIf,
        Disposition::Supersede,
    ];
    for disposition in writes {
        let mut s = submit(&volume, CreateRequest::open("\\ro").with_disposition(disposition));
        assert!(matches!(
            s.completion.try_take(),
            Some(Err(BridgeError::WriteProtected))
        ));
    }
    let mut s = submit(
        &volume,
        CreateRequest::open("\\ro").with_options(CreateOptions::DELETE_ON_CLOSE),
    );
    assert!(matches!(
        s.completion.try_take(),
        Some(Err(BridgeError::WriteProtected))
    ));

    assert!(volume.try_next_envelope().is_none());
    let stats = volume.stats();
    assert_eq!(stats.envelopes_queued, 0);
    assert_eq!(stats.control_blocks_allocated, 0);
}

#[test]
fn test_read_only_open_if_not_found_becomes_write_protected() {
    let volume = volume(
        BridgeConfig::default().read_only(),
        Arc::new(NoOplocks::default()),
    );

    let mut s = submit(
        &volume,
        CreateRequest::open("\\missing").with_disposition(Disposition::OpenIf),
    );
    let queued = volume.try_next_envelope().unwrap();
    let header = EnvelopeReader::parse(&queued.bytes).unwrap().header();
    assert_eq!(header.create_options >> 24, Disposition::Open.as_raw());

    let reply = CreateReply::failure(
        queued.serial,
        status::OBJECT_NAME_NOT_FOUND,
        information::DOES_NOT_EXIST,
    );
    assert!(volume.complete_create(&reply).unwrap());
    assert!(matches!(
        s.completion.try_take(),
        Some(Err(BridgeError::WriteProtected))
    ));
    assert!(s.file_object.context().is_none());
    assert_eq!(volume.stats().instances_freed, 1);

    // A plain Open that misses keeps the worker's status.
    let mut plain = submit(&volume, CreateRequest::open("\\missing"));
    answer_next(&volume, |serial| {
        CreateReply::failure(serial, status::OBJECT_NAME_NOT_FOUND, information::DOES_NOT_EXIST)
    });
    assert!(matches!(
        plain.completion.try_take(),
        Some(Err(BridgeError::NotFound))
    ));
}

#[test]
fn test_cancel_and_reply_race_has_one_winner() {
    let volume = default_volume(Arc::new(ScriptedOplock::new()));

    let mut cancelled = submit(&volume, CreateRequest::open("\\c"));
    let serial = cancelled.irp.serial();
    assert!(volume.cancel_create(serial));
    assert!(!volume.complete_create(&opened(serial)).unwrap());
    assert!(!volume.cancel_create(serial));
    assert!(matches!(
        cancelled.completion.try_take(),
        Some(Err(BridgeError::Cancelled))
    ));
    assert!(cancelled.file_object.context().is_none());
    assert!(volume.try_next_envelope().is_none());

    let mut answered = submit(&volume, CreateRequest::open("\\c"));
    let serial = answered.irp.serial();
    assert!(volume.complete_create(&opened(serial)).unwrap());
    assert!(!volume.cancel_create(serial));
    assert!(matches!(
        answered.completion.try_take(),
        Some(Ok(CreateInformation::Opened))
    ));
}

#[test]
fn test_target_directory_opens_parent() {
    let volume = default_volume(Arc::new(ScriptedOplock::new()));
    let s = submit(
        &volume,
        CreateRequest::open("\\foo\\bar.txt").with_flags(RequestFlags::OPEN_TARGET_DIRECTORY),
    );
    let cb = s.file_object.instance().unwrap().control_block().clone();
    assert_eq!(cb.path(), "\\foo");

    let queued = volume.try_next_envelope().unwrap();
    let reader = EnvelopeReader::parse(&queued.bytes).unwrap();
    assert_eq!(reader.file_name().unwrap(), "\\foo");

    let mut root = submit(
        &volume,
        CreateRequest::open("\\").with_flags(RequestFlags::OPEN_TARGET_DIRECTORY),
    );
    assert!(matches!(
        root.completion.try_take(),
        Some(Err(BridgeError::AccessDenied))
    ));
}

#[test]
fn test_volume_open() {
    let volume = default_volume(Arc::new(ScriptedOplock::new()));
    let mut s = submit(&volume, CreateRequest::open(""));
    assert!(matches!(
        s.completion.try_take(),
        Some(Ok(CreateInformation::Opened))
    ));
    assert!(s.file_object.is_volume_open());

    let mut dir = submit(
        &volume,
        CreateRequest::open("").with_options(CreateOptions::DIRECTORY_FILE),
    );
    assert!(matches!(
        dir.completion.try_take(),
        Some(Err(BridgeError::NotADirectory))
    ));

    // A name relative to the volume open resolves from the root.
    let rel = submit(&volume, CreateRequest::open("x").with_related(s.file_object.clone()));
    assert_eq!(rel.status, DispatchStatus::Pending);
    let cb = rel.file_object.instance().unwrap().control_block().clone();
    assert_eq!(cb.path(), "\\x");

    volume.close(&s.file_object).unwrap();
    assert!(s.file_object.context().is_none());
}

#[test]
fn test_related_object_names() {
    let volume = default_volume(Arc::new(ScriptedOplock::new()));
    let dir = submit(
        &volume,
        CreateRequest::open("\\dir\\").with_options(CreateOptions::DIRECTORY_FILE),
    );
    answer_next(&volume, opened);

    let child = submit(&volume, CreateRequest::open("file").with_related(dir.file_object.clone()));
    let queued = volume.try_next_envelope().unwrap();
    assert_eq!(
        EnvelopeReader::parse(&queued.bytes).unwrap().file_name().unwrap(),
        "\\dir\\file"
    );
    assert_eq!(
        child.file_object.instance().unwrap().control_block().path(),
        "\\dir\\file"
    );

    let mut absolute = submit(
        &volume,
        CreateRequest::open("\\abs").with_related(dir.file_object.clone()),
    );
    assert!(matches!(
        absolute.completion.try_take(),
        Some(Err(BridgeError::InvalidParameter(_)))
    ));

    let unopened = FileObject::new();
    let mut dangling = submit(&volume, CreateRequest::open("x").with_related(unopened));
    assert!(matches!(
        dangling.completion.try_take(),
        Some(Err(BridgeError::InvalidParameter(_)))
    ));
}

#[test]
fn test_stream_names_follow_volume_setting() {
    let plain = default_volume(Arc::new(ScriptedOplock::new()));
    let mut s = submit(&plain, CreateRequest::open("\\f:stream"));
    assert!(matches!(
        s.completion.try_take(),
        Some(Err(BridgeError::InvalidParameter(_)))
    ));
    assert_eq!(plain.stats().control_blocks_allocated, 0);

    let config = BridgeConfig {
        alternate_streams: true,
        ..Default::default()
    };
    let streams = volume(config, Arc::new(NoOplocks::default()));
    let s = submit(&streams, CreateRequest::open("\\f:stream"));
    assert_eq!(s.status, DispatchStatus::Pending);
}

#[test]
fn test_temporary_directory_and_paging_file_are_refused() {
    let volume = volume(
        BridgeConfig::default().without_gc(),
        Arc::new(NoOplocks::default()),
    );
    let mut temp = submit(
        &volume,
        CreateRequest::open("\\t")
            .with_disposition(Disposition::Create)
            .with_options(CreateOptions::DIRECTORY_FILE)
            .with_attributes(FileAttributes::TEMPORARY),
    );
    assert!(matches!(
        temp.completion.try_take(),
        Some(Err(BridgeError::InvalidParameter(_)))
    ));

    let mut paging = submit(
        &volume,
        CreateRequest::open("\\pagefile.sys").with_flags(RequestFlags::OPEN_PAGING_FILE),
    );
    assert!(matches!(
        paging.completion.try_take(),
        Some(Err(BridgeError::AccessDenied))
    ));

    let stats = volume.stats();
    assert_eq!(stats.control_blocks_allocated, 2);
    assert_eq!(stats.control_blocks_freed, 2);
    assert_eq!(stats.instances_allocated, 0);
}

#[test]
fn test_worker_not_attached() {
    let volume = Volume::builder(BridgeConfig::default()).build().unwrap();

    let mut s = submit(&volume, CreateRequest::open("\\anything"));
    assert!(matches!(
        s.completion.try_take(),
        Some(Ok(CreateInformation::Opened))
    ));
    assert!(s.file_object.context().is_none());

    let mut svi = submit(&volume, CreateRequest::open("\\System Volume Information\\x"));
    assert!(matches!(
        svi.completion.try_take(),
        Some(Err(BridgeError::NotFound))
    ));
    assert_eq!(volume.stats().control_blocks_allocated, 0);
}

#[test]
fn test_keepalive_channel_completes_without_worker() {
    let buffer = logs();
    let volume = Volume::builder(BridgeConfig::default()).build().unwrap();

    let mut s = submit(
        &volume,
        CreateRequest::open("\\__bridgefs_keepalive").with_process_id(4242),
    );
    assert!(matches!(
        s.completion.try_take(),
        Some(Ok(CreateInformation::Opened))
    ));
    let oi = s.file_object.instance().unwrap();
    assert!(oi
        .control_block()
        .flags()
        .contains(ControlBlockFlags::KEEPALIVE | ControlBlockFlags::DISPATCH_BLOCKED));
    assert!(volume.try_next_envelope().is_none());

    let logged = String::from_utf8_lossy(&buffer.lock().unwrap()).to_string();
    assert!(logged.contains("keepalive channel opened"));

    volume.close(&s.file_object).unwrap();
}

#[test]
fn test_created_directory_sets_flags_and_notifies() {
    let notifier = Arc::new(RecordingNotifier::default());
    let volume = Volume::builder(BridgeConfig::default())
        .notifier(notifier.clone())
        .build()
        .unwrap();
    volume.attach_worker();

    let mut s = submit(
        &volume,
        CreateRequest::open("\\newdir")
            .with_disposition(Disposition::Create)
            .with_options(CreateOptions::DELETE_ON_CLOSE),
    );
    answer_next(&volume, |serial| {
        CreateReply::success(serial, information::CREATED, 1).with_directory()
    });
    assert!(matches!(
        s.completion.try_take(),
        Some(Ok(CreateInformation::Created))
    ));

    let oi = s.file_object.instance().unwrap();
    let flags = oi.control_block().flags();
    assert!(flags.contains(ControlBlockFlags::DIRECTORY | ControlBlockFlags::DELETE_ON_CLOSE));
    assert!(oi.flags().contains(InstanceFlags::DELETE_ON_CLOSE));

    let events = notifier.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].path, "\\newdir");
    assert_eq!(events[0].filter, ChangeFilter::DirName);
    assert_eq!(events[0].action, ChangeAction::Added);

    // Delete is pending, so a second open must share delete.
    let mut blocked = submit(&volume, CreateRequest::open("\\newdir").with_share(ShareAccess::READ));
    assert!(matches!(
        blocked.completion.try_take(),
        Some(Err(BridgeError::AccessDenied))
    ));
}

#[test]
fn test_atomic_oplock_backed_out_on_worker_failure() {
    let oplocks = Arc::new(ScriptedOplock::new());
    let volume = default_volume(oplocks.clone());

    let mut failed = submit(
        &volume,
        CreateRequest::open("\\o").with_options(CreateOptions::OPEN_REQUIRING_OPLOCK),
    );
    assert!(failed.file_object.instance().unwrap().atomic_oplock_pending());
    answer_next(&volume, |serial| {
        CreateReply::failure(serial, status::ACCESS_DENIED, information::OPENED)
    });
    assert!(matches!(
        failed.completion.try_take(),
        Some(Err(BridgeError::AccessDenied))
    ));
    assert_eq!(oplocks.back_outs(), 1);

    let mut ok = submit(
        &volume,
        CreateRequest::open("\\o").with_options(CreateOptions::OPEN_REQUIRING_OPLOCK),
    );
    answer_next(&volume, opened);
    assert!(matches!(ok.completion.try_take(), Some(Ok(_))));
    assert!(!ok.file_object.instance().unwrap().atomic_oplock_pending());
    assert_eq!(oplocks.back_outs(), 1);

    // A break in progress is not a failure and owes no back-out.
    oplocks.on_atomic(AtomicOplock::BreakInProgress);
    let racing = submit(
        &volume,
        CreateRequest::open("\\o").with_options(CreateOptions::OPEN_REQUIRING_OPLOCK),
    );
    assert_eq!(racing.status, DispatchStatus::Pending);
    assert!(!racing.file_object.instance().unwrap().atomic_oplock_pending());
}

#[test]
fn test_unmount_fails_outstanding_and_new_creates() {
    let volume = default_volume(Arc::new(ScriptedOplock::new()));
    let mut queued = submit(&volume, CreateRequest::open("\\q"));
    assert_eq!(volume.begin_unmount(), 1);
    assert!(matches!(
        queued.completion.try_take(),
        Some(Err(BridgeError::NoSuchDevice))
    ));
    assert!(queued.file_object.context().is_none());

    let mut late = submit(&volume, CreateRequest::open("\\q"));
    assert!(matches!(
        late.completion.try_take(),
        Some(Err(BridgeError::NoSuchDevice))
    ));
}

#[test]
fn test_unmount_fails_creates_parked_on_oplocks() {
    let oplocks = Arc::new(ScriptedOplock::new());
    let volume = default_volume(oplocks.clone());
    let first = submit(&volume, exclusive("\\busy"));
    answer_next(&volume, opened);
    let shared = submit(&volume, CreateRequest::open("\\other"));
    answer_next(&volume, opened);

    oplocks.on_break(Scripted::Hold);
    let mut on_break = submit(&volume, CreateRequest::open("\\busy"));
    oplocks.on_check(Scripted::Hold);
    let mut on_check = submit(&volume, CreateRequest::open("\\other"));
    assert_eq!(on_break.status, DispatchStatus::Pending);
    assert_eq!(on_check.status, DispatchStatus::Pending);
    assert_eq!(volume.suspended_creates(), 2);
    assert_eq!(volume.pending_creates(), 0);
    let parked = on_break.file_object.instance().unwrap();

    assert_eq!(volume.begin_unmount(), 2);
    for parked_create in [&mut on_break, &mut on_check] {
        assert!(matches!(
            parked_create.completion.try_take(),
            Some(Err(BridgeError::NoSuchDevice))
        ));
        assert!(parked_create.file_object.context().is_none());
    }
    assert!(!parked.is_live());
    assert_eq!(volume.suspended_creates(), 0);

    // Breaks finishing after the unmount find nothing left to resume.
    assert_eq!(oplocks.release_held(Ok(())), 2);
    assert_eq!(volume.process_deferred(), 2);
    for held in [&first, &shared] {
        let cb = held.file_object.instance().unwrap().control_block().clone();
        assert_eq!(cb.open_count(), 1);
        assert_eq!(cb.state().read().instances().len(), 1);
    }
    assert_eq!(volume.stats().instances_freed, 2);
}

#[test]
fn test_break_failure_reported_through_mock_engine() {
    let mut engine = MockOplockEngine::new();
    engine.expect_initialize().returning(|| OplockId(7));
    engine.expect_uninitialize().return_const(());
    engine.expect_check_oplock_key().returning(|_, _| Ok(()));
    engine
        .expect_break_handle()
        .withf(|oplock, request, _| *oplock == OplockId(7) && request.path == "\\m")
        .times(1)
        .returning(|_, _, _| BreakStatus::Failed(BridgeError::OplockNotGranted));

    let volume = volume(BridgeConfig::default(), Arc::new(engine));
    submit(&volume, exclusive("\\m"));
    answer_next(&volume, opened);

    let mut second = submit(&volume, CreateRequest::open("\\m"));
    assert!(matches!(
        second.completion.try_take(),
        Some(Err(BridgeError::OplockNotGranted))
    ));
    assert!(second.file_object.context().is_none());
}
