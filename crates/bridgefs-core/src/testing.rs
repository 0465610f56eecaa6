// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Shared fixtures for the scenario tests


use crate::config::BridgeConfig;
use crate::dispatch::{DispatchStatus, Volume};
use crate::oplock::OplockEngine;
use crate::request::{CompletionReceiver, CreateIrp, CreateRequest, FileObject};
use crate::types::{ChangeEvent, ChangeNotifier};
use bridgefs_logging::{init_for_test, TestLogBuffer};
use bridgefs_proto::{CreateReply, EnvelopeReader};
use parking_lot::Mutex;
use std::sync::Arc;

pub use scripted_oplock::{Scripted, ScriptedOplock};

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<ChangeEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events.lock().clone()
    }
}

impl ChangeNotifier for RecordingNotifier {
    fn report(&self, evt: &ChangeEvent) {
        self.events.lock().push(evt.clone());
    }
}

pub fn logs() -> TestLogBuffer {
    init_for_test("bridgefs-core", tracing::Level::TRACE)
}

/// Volume with the worker attached
pub fn volume(config: BridgeConfig, oplocks: Arc<dyn OplockEngine>) -> Arc<Volume> {
    let volume = Volume::builder(config)
        .oplocks(oplocks)
        .build()
        .expect("valid test configuration");
    volume.attach_worker();
    volume
}

pub struct Submitted {
    pub irp: Arc<CreateIrp>,
    pub file_object: Arc<FileObject>,
    pub completion: CompletionReceiver,
    pub status: DispatchStatus,
}

pub fn submit(volume: &Volume, request: CreateRequest) -> Submitted {
    let file_object = FileObject::new();
    let (irp, completion) = CreateIrp::new(request, file_object.clone());
    let status = volume.dispatch_create(&irp);
    Submitted {
        irp,
        file_object,
        completion,
        status,
    }
}

/// Answer the oldest queued envelope with `reply(serial)`
pub fn answer_next(volume: &Volume, reply: impl FnOnce(u64) -> CreateReply) -> u64 {
    let queued = volume
        .try_next_envelope()
        .expect("an envelope should be queued");
    EnvelopeReader::parse(&queued.bytes).expect("well-formed envelope");
    let serial = queued.serial;
    assert!(volume.complete_create(&reply(serial)).expect("valid reply"));
    serial
}
