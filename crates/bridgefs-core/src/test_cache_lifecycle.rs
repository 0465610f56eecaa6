// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use crate::config::{BridgeConfig, CacheLimits, CollectionPolicy, ReservedNames};
use crate::control_block::{ControlBlockCache, StreamContext};
use crate::error::BridgeError;
use crate::request::CreateRequest;
use crate::testing::{answer_next, logs, submit, volume, ScriptedOplock};
use crate::types::CreateInformation;
use bridgefs_proto::{information, CreateReply};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn cache_with(oplocks: Arc<ScriptedOplock>, grace_ms: u64) -> ControlBlockCache {
    ControlBlockCache::new(
        oplocks,
        CollectionPolicy {
            enabled: true,
            grace_period_ms: grace_ms,
            sweep_interval_ms: 10,
        },
        ReservedNames::default(),
        0,
    )
}

#[test]
fn test_concurrent_acquire_yields_one_block() {
    const THREADS: usize = 16;
    let oplocks = Arc::new(ScriptedOplock::new());
    let cache = cache_with(oplocks.clone(), 60_000);

    let blocks: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let cache = &cache;
                // Mix case so the case-insensitive lookup is exercised.
                let path = if i % 2 == 0 { "\\Shared\\File" } else { "\\shared\\file" };
                scope.spawn(move || cache.acquire_or_create(path, false).unwrap())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let first = &blocks[0];
    assert!(blocks.iter().all(|cb| Arc::ptr_eq(cb, first)));
    assert_eq!(first.open_count(), THREADS as u32);
    assert_eq!(cache.stats().allocated, 1);
    assert_eq!(oplocks.live_states(), 1);

    std::thread::scope(|scope| {
        for cb in &blocks {
            let cache = &cache;
            scope.spawn(move || cache.release(cb).unwrap());
        }
    });
    assert_eq!(first.open_count(), 0);
    assert!(cache.is_pending_deletion(first));
}

#[test]
fn test_grace_period_reuse_then_collection() {
    let oplocks = Arc::new(ScriptedOplock::new());
    let cache = cache_with(oplocks.clone(), 500);

    let cb = cache.acquire_or_create("\\g", false).unwrap();
    cache.release(&cb).unwrap();

    let reused = cache.acquire_or_create("\\g", false).unwrap();
    assert!(Arc::ptr_eq(&cb, &reused));
    assert_eq!(cache.stats().allocated, 1);
    assert_eq!(cache.stats().pending_deletion, 0);

    cache.release(&reused).unwrap();
    assert_eq!(cache.collect_garbage(Instant::now()), 0);
    assert!(cb.is_live());

    assert_eq!(
        cache.collect_garbage(Instant::now() + Duration::from_millis(501)),
        1
    );
    assert!(!cb.is_live());
    assert_eq!(oplocks.live_states(), 0);

    let fresh = cache.acquire_or_create("\\g", false).unwrap();
    assert!(!Arc::ptr_eq(&cb, &fresh));
    assert_eq!(cache.stats().allocated, 2);
}

#[test]
fn test_freed_block_is_never_dereferenced() {
    let buffer = logs();
    let cache = ControlBlockCache::new(
        Arc::new(ScriptedOplock::new()),
        CollectionPolicy {
            enabled: false,
            ..Default::default()
        },
        ReservedNames::default(),
        0,
    );
    let cb = cache.acquire_or_create("\\stale", false).unwrap();
    cache.release(&cb).unwrap();

    match cache.release(&cb) {
        Err(BridgeError::InvalidState { location, .. }) => {
            assert!(location.file().ends_with("control_block.rs"));
        }
        other => panic!("expected invalid state, got {other:?}"),
    }
    let logged = String::from_utf8_lossy(&buffer.lock().unwrap()).to_string();
    assert!(logged.contains("control block identity check failed"));
}

#[test]
fn test_resource_exhaustion_leaves_no_partial_state() {
    let config = BridgeConfig {
        limits: CacheLimits {
            max_control_blocks: 1,
        },
        ..Default::default()
    };
    let volume = volume(config, Arc::new(ScriptedOplock::new()));
    let held = submit(&volume, CreateRequest::open("\\a"));
    answer_next(&volume, |serial| {
        CreateReply::success(serial, information::OPENED, 0)
    });

    let mut refused = submit(&volume, CreateRequest::open("\\b"));
    assert!(matches!(
        refused.completion.try_take(),
        Some(Err(BridgeError::ResourceExhausted))
    ));
    assert!(refused.file_object.context().is_none());
    let stats = volume.stats();
    assert_eq!(stats.control_blocks_cached, 1);
    assert_eq!(stats.instances_allocated, 1);

    // Closing the only open parks its block; allocation pressure reclaims it.
    volume.close(&held.file_object).unwrap();
    let mut admitted = submit(&volume, CreateRequest::open("\\b"));
    answer_next(&volume, |serial| {
        CreateReply::success(serial, information::OPENED, 0)
    });
    assert!(matches!(
        admitted.completion.try_take(),
        Some(Ok(CreateInformation::Opened))
    ));
    assert_eq!(volume.stats().control_blocks_freed, 1);
}

struct Flag(Arc<AtomicBool>);

impl StreamContext for Flag {
    fn teardown(self: Box<Self>) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[test]
fn test_close_without_collection_deletes_block_and_stream_contexts() {
    let volume = volume(
        BridgeConfig::default().without_gc(),
        Arc::new(ScriptedOplock::new()),
    );
    let s = submit(&volume, CreateRequest::open("\\streams"));
    answer_next(&volume, |serial| {
        CreateReply::success(serial, information::OPENED, 0)
    });

    let torn_down = Arc::new(AtomicBool::new(false));
    let cb = s.file_object.instance().unwrap().control_block().clone();
    cb.state()
        .write()
        .attach_stream_context(Box::new(Flag(torn_down.clone())));
    cb.set_writable_mapping(true);

    volume.close(&s.file_object).unwrap();
    assert!(torn_down.load(Ordering::SeqCst));
    assert!(!cb.is_live());
    let stats = volume.stats();
    assert_eq!(stats.control_blocks_cached, 0);
    assert_eq!(stats.control_blocks_freed, 1);
    assert!(volume.close(&s.file_object).is_err());
}

#[test]
fn test_writable_mapping_blocks_non_write_sharing_opens() {
    let volume = volume(BridgeConfig::default(), Arc::new(ScriptedOplock::new()));
    let s = submit(&volume, CreateRequest::open("\\mapped"));
    answer_next(&volume, |serial| {
        CreateReply::success(serial, information::OPENED, 0)
    });
    let cb = s.file_object.instance().unwrap().control_block().clone();
    cb.set_writable_mapping(true);

    let mut refused = submit(
        &volume,
        CreateRequest::open("\\mapped").with_share(crate::types::ShareAccess::READ),
    );
    assert!(matches!(
        refused.completion.try_take(),
        Some(Err(BridgeError::SharingViolation))
    ));
    assert_eq!(cb.open_count(), 1);
}
