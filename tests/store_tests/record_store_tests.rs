//! Tests for RecordStore
//!
//! These tests verify:
//! - Id assignment for ordinary and log collections
//! - Counters across commit, rollback and write conflicts
//! - Update / update-in-place / delete rules
//! - Truncate, truncate-after, validate, stats
//! - Format checks at open and prefixed tables

use std::sync::Arc;

use bytes::Bytes;

use atlasrs::record::LogTimestamp;
use atlasrs::store::{
    AcceptAll, Damage, RecordValidator, TableMetadata, ValidateLevel, MAX_FORMAT_VERSION,
};
use atlasrs::{
    AtlasError, CollectionOptions, Config, Engine, KvEngine, MemEngine, RecordId, RecordStore,
};

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_engine() -> Engine {
    let config = Config::builder().background_reclaim(false).build();
    Engine::open_in_memory(config).unwrap()
}

fn setup_engine_with_kv() -> (MemEngine, Engine) {
    let mem = MemEngine::new();
    let config = Config::builder().background_reclaim(false).build();
    let engine = Engine::open(config, Arc::new(mem.clone())).unwrap();
    (mem, engine)
}

fn ordinary(engine: &Engine, ns: &str) -> Arc<RecordStore> {
    engine
        .create_record_store(&CollectionOptions::builder(ns).build())
        .unwrap()
}

fn log_store(engine: &Engine) -> Arc<RecordStore> {
    engine
        .create_record_store(
            &CollectionOptions::builder("local.oplog.rs")
                .capped(1 << 20)
                .log()
                .build(),
        )
        .unwrap()
}

fn insert_one(engine: &Engine, store: &RecordStore, data: &[u8]) -> RecordId {
    let mut ru = engine.recovery_unit();
    let id = store
        .insert_record(&mut ru, Bytes::copy_from_slice(data), LogTimestamp::default())
        .unwrap();
    ru.commit().unwrap();
    id
}

fn log_entry(inc: u32, body: &[u8]) -> Bytes {
    Bytes::from(LogTimestamp::new(1, inc).encode_entry(body))
}

fn scan_ids(engine: &Engine, store: &RecordStore) -> Vec<i64> {
    let mut ru = engine.recovery_unit();
    let mut cursor = store.cursor(true);
    let mut ids = Vec::new();
    while let Some(record) = cursor.next(&mut ru).unwrap() {
        ids.push(record.id.repr());
    }
    ids
}

struct RejectShort;

impl RecordValidator for RejectShort {
    fn validate(&self, _id: RecordId, data: &[u8]) -> Result<(), String> {
        if data.len() < 3 {
            Err("too short".into())
        } else {
            Ok(())
        }
    }
}

// =============================================================================
// Insert Tests
// =============================================================================

#[test]
fn test_insert_assigns_sequential_ids() {
    let engine = setup_engine();
    let store = ordinary(&engine, "test.c");

    let ids: Vec<_> = (0..5).map(|i| insert_one(&engine, &store, &[i as u8])).collect();

    assert_eq!(ids, (1..=5).map(RecordId::new).collect::<Vec<_>>());
    assert_eq!(store.num_records(), 5);
    assert_eq!(store.data_size(), 5);
}

#[test]
fn test_batch_insert_returns_ids_in_order() {
    let engine = setup_engine();
    let store = ordinary(&engine, "test.c");

    let mut ru = engine.recovery_unit();
    let batch = vec![Bytes::from_static(b"a"), Bytes::from_static(b"bb"), Bytes::from_static(b"ccc")];
    let ids = store.insert(&mut ru, &batch, &[]).unwrap();
    ru.commit().unwrap();

    assert_eq!(ids, vec![RecordId::new(1), RecordId::new(2), RecordId::new(3)]);
    assert_eq!(store.data_size(), 6);

    let mut ru = engine.recovery_unit();
    let record = store.find_by_id(&mut ru, RecordId::new(2)).unwrap().unwrap();
    assert_eq!(&record.data[..], b"bb");
}

#[test]
fn test_timestamp_count_must_match() {
    let engine = setup_engine();
    let store = ordinary(&engine, "test.c");

    let mut ru = engine.recovery_unit();
    let batch = vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")];
    let result = store.insert(&mut ru, &batch, &[LogTimestamp::new(1, 1)]);
    assert!(matches!(result, Err(AtlasError::BadValue(_))));
}

#[test]
fn test_aborted_insert_skips_ids_and_restores_counters() {
    let engine = setup_engine();
    let store = ordinary(&engine, "test.c");

    insert_one(&engine, &store, b"first");

    let mut ru = engine.recovery_unit();
    store
        .insert(&mut ru, &[Bytes::from_static(b"doomed"), Bytes::from_static(b"too")], &[])
        .unwrap();
    assert_eq!(store.num_records(), 3);
    ru.abort();

    assert_eq!(store.num_records(), 1);
    assert_eq!(store.data_size(), 5);

    let next = insert_one(&engine, &store, b"after");
    assert_eq!(next, RecordId::new(4));
    assert_eq!(scan_ids(&engine, &store), vec![1, 4]);
}

#[test]
fn test_write_conflict_rolls_back_counters() {
    let (mem, engine) = setup_engine_with_kv();
    let store = ordinary(&engine, "test.c");
    insert_one(&engine, &store, b"seed");

    mem.inject_write_conflicts(1);
    let mut ru = engine.recovery_unit();
    store.insert_record(&mut ru, &b"lost"[..], LogTimestamp::default()).unwrap();
    let err = ru.commit().unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(store.num_records(), 1);
    assert_eq!(store.data_size(), 4);
}

#[test]
fn test_concurrent_updates_conflict() {
    let engine = setup_engine();
    let store = ordinary(&engine, "test.c");
    let id = insert_one(&engine, &store, b"v0");

    let mut a = engine.recovery_unit();
    let mut b = engine.recovery_unit();
    store.update(&mut a, id, b"from-a").unwrap();
    store.update(&mut b, id, b"from-b-longer").unwrap();
    a.commit().unwrap();
    assert!(matches!(b.commit(), Err(AtlasError::WriteConflict)));

    assert_eq!(store.data_size(), 6);
    let mut ru = engine.recovery_unit();
    let record = store.find_by_id(&mut ru, id).unwrap().unwrap();
    assert_eq!(&record.data[..], b"from-a");
}

#[test]
fn test_ids_strictly_increase_with_interleaved_aborts() {
    let engine = setup_engine();
    let store = ordinary(&engine, "test.c");

    let mut committed = Vec::new();
    for i in 0..20 {
        let mut ru = engine.recovery_unit();
        let id = store.insert_record(&mut ru, vec![i as u8], LogTimestamp::default()).unwrap();
        if i % 3 == 0 {
            ru.abort();
        } else {
            ru.commit().unwrap();
            committed.push(id);
        }
    }

    assert!(committed.windows(2).all(|w| w[0] < w[1]));
    let scanned = scan_ids(&engine, &store);
    assert_eq!(scanned, committed.iter().map(|id| id.repr()).collect::<Vec<_>>());
}

// =============================================================================
// Log Id Tests
// =============================================================================

#[test]
fn test_log_ids_come_from_timestamps() {
    let engine = setup_engine();
    let store = log_store(&engine);

    let mut ru = engine.recovery_unit();
    let ids = store
        .insert(&mut ru, &[log_entry(1, b"a"), log_entry(2, b"b")], &[])
        .unwrap();
    ru.commit().unwrap();

    assert_eq!(ids[0], LogTimestamp::new(1, 1).record_id());
    assert_eq!(ids[1], LogTimestamp::new(1, 2).record_id());
}

#[test]
fn test_inserts_record_per_record_timestamps() {
    let (mem, engine) = setup_engine_with_kv();
    let log = log_store(&engine);
    let plain = ordinary(&engine, "test.c");
    let stamp_of = |store: &RecordStore, id: RecordId| {
        mem.latest_timestamp(store.table(), &store.key_format().encode(id))
            .unwrap()
    };

    // Each log record is stamped with its own id, even within one batch
    let mut ru = engine.recovery_unit();
    let ids = log
        .insert(&mut ru, &[log_entry(1, b"a"), log_entry(2, b"b")], &[])
        .unwrap();
    ru.commit().unwrap();
    for id in &ids {
        assert_eq!(stamp_of(&log, *id), Some(id.repr() as u64));
    }

    let explicit = LogTimestamp::new(3, 4);
    let mut ru = engine.recovery_unit();
    let stamped = plain.insert_record(&mut ru, &b"x"[..], explicit).unwrap();
    ru.commit().unwrap();
    assert_eq!(stamp_of(&plain, stamped), Some(explicit.as_u64()));

    let unstamped = insert_one(&engine, &plain, b"y");
    assert_eq!(stamp_of(&plain, unstamped), None);
}

#[test]
fn test_log_rejects_out_of_order_ids() {
    let engine = setup_engine();
    let store = log_store(&engine);

    let mut ru = engine.recovery_unit();
    store.insert(&mut ru, &[log_entry(5, b"a")], &[]).unwrap();
    ru.commit().unwrap();

    let mut ru = engine.recovery_unit();
    let err = store.insert(&mut ru, &[log_entry(5, b"dup")], &[]).unwrap_err();
    assert!(matches!(err, AtlasError::OutOfOrderLogId { .. }));
    assert!(!err.is_retryable());

    let err = store
        .insert(&mut ru, &[log_entry(7, b"a"), log_entry(6, b"b")], &[])
        .unwrap_err();
    assert!(matches!(err, AtlasError::OutOfOrderLogId { .. }));
}

#[test]
fn test_log_batch_can_be_retried_after_rollback() {
    let (mem, engine) = setup_engine_with_kv();
    let store = log_store(&engine);
    let batch = vec![log_entry(1, b"a"), log_entry(2, b"b")];

    mem.inject_write_conflicts(1);
    let mut ru = engine.recovery_unit();
    store.insert(&mut ru, &batch, &[]).unwrap();
    assert!(ru.commit().is_err());

    let mut ru = engine.recovery_unit();
    store.insert(&mut ru, &batch, &[]).unwrap();
    ru.commit().unwrap();
    assert_eq!(store.num_records(), 2);
}

#[test]
fn test_log_rejects_entry_without_timestamp() {
    let engine = setup_engine();
    let store = log_store(&engine);

    let mut ru = engine.recovery_unit();
    let err = store.insert(&mut ru, &[Bytes::from_static(b"abc")], &[]).unwrap_err();
    assert!(matches!(err, AtlasError::BadValue(_)));
}

// =============================================================================
// Update / Delete Tests
// =============================================================================

#[test]
fn test_update_adjusts_data_size() {
    let engine = setup_engine();
    let store = ordinary(&engine, "test.c");
    let id = insert_one(&engine, &store, b"abc");

    let mut ru = engine.recovery_unit();
    store.update(&mut ru, id, b"abcdef").unwrap();
    ru.commit().unwrap();

    assert_eq!(store.data_size(), 6);
    assert_eq!(store.num_records(), 1);
}

#[test]
fn test_update_missing_record() {
    let engine = setup_engine();
    let store = ordinary(&engine, "test.c");

    let mut ru = engine.recovery_unit();
    let err = store.update(&mut ru, RecordId::new(99), b"x").unwrap_err();
    assert!(matches!(err, AtlasError::RecordNotFound(id) if id == RecordId::new(99)));
}

#[test]
fn test_log_update_cannot_change_length() {
    let engine = setup_engine();
    let store = log_store(&engine);

    let mut ru = engine.recovery_unit();
    let id = store.insert_record(&mut ru, log_entry(1, b"abcd"), LogTimestamp::default()).unwrap();
    ru.commit().unwrap();

    let mut ru = engine.recovery_unit();
    let err = store.update(&mut ru, id, &log_entry(1, b"abcdef")).unwrap_err();
    assert!(matches!(err, AtlasError::IllegalOperation(_)));

    store.update(&mut ru, id, &log_entry(1, b"wxyz")).unwrap();
    ru.commit().unwrap();
    assert_eq!(store.data_size(), 12);
}

#[test]
fn test_update_in_place_patches_and_grows() {
    let engine = setup_engine();
    let store = ordinary(&engine, "test.c");
    let id = insert_one(&engine, &store, b"hello world");

    let mut ru = engine.recovery_unit();
    let damages = [
        Damage { source_offset: 0, target_offset: 0, size: 5 },
        Damage { source_offset: 5, target_offset: 11, size: 1 },
    ];
    let updated = store.update_in_place(&mut ru, id, b"HELLO!", &damages).unwrap();
    ru.commit().unwrap();

    assert_eq!(&updated[..], b"HELLO world!");
    assert_eq!(store.data_size(), 12);
}

#[test]
fn test_update_in_place_cannot_grow_log_record() {
    let engine = setup_engine();
    let store = log_store(&engine);

    let mut ru = engine.recovery_unit();
    let id = store.insert_record(&mut ru, log_entry(1, b"ab"), LogTimestamp::default()).unwrap();
    ru.commit().unwrap();

    let mut ru = engine.recovery_unit();
    let grow = [Damage { source_offset: 0, target_offset: 9, size: 2 }];
    let err = store.update_in_place(&mut ru, id, b"zz", &grow).unwrap_err();
    assert!(matches!(err, AtlasError::IllegalOperation(_)));

    let patch = [Damage { source_offset: 0, target_offset: 8, size: 2 }];
    let updated = store.update_in_place(&mut ru, id, b"zz", &patch).unwrap();
    assert_eq!(&updated[8..], b"zz");
}

#[test]
fn test_update_in_place_rejects_bad_source_range() {
    let engine = setup_engine();
    let store = ordinary(&engine, "test.c");
    let id = insert_one(&engine, &store, b"abc");

    let mut ru = engine.recovery_unit();
    let damages = [Damage { source_offset: 2, target_offset: 0, size: 5 }];
    let err = store.update_in_place(&mut ru, id, b"xyz", &damages).unwrap_err();
    assert!(matches!(err, AtlasError::BadValue(_)));
}

#[test]
fn test_update_in_place_rejects_overflowing_range() {
    let engine = setup_engine();
    let store = ordinary(&engine, "test.c");
    let id = insert_one(&engine, &store, b"abc");

    let mut ru = engine.recovery_unit();
    let source_overflow = [Damage { source_offset: usize::MAX, target_offset: 0, size: 2 }];
    let err = store
        .update_in_place(&mut ru, id, b"xyz", &source_overflow)
        .unwrap_err();
    assert!(matches!(err, AtlasError::BadValue(_)));

    let target_overflow = [Damage { source_offset: 0, target_offset: usize::MAX, size: 2 }];
    let err = store
        .update_in_place(&mut ru, id, b"xyz", &target_overflow)
        .unwrap_err();
    assert!(matches!(err, AtlasError::BadValue(_)));
    ru.abort();

    let mut ru = engine.recovery_unit();
    let record = store.find_by_id(&mut ru, id).unwrap().unwrap();
    assert_eq!(&record.data[..], b"abc");
    assert_eq!(store.data_size(), 3);
}

#[test]
fn test_delete_and_find() {
    let engine = setup_engine();
    let store = ordinary(&engine, "test.c");
    let id = insert_one(&engine, &store, b"gone");

    let mut ru = engine.recovery_unit();
    store.delete(&mut ru, id).unwrap();
    ru.commit().unwrap();

    let mut ru = engine.recovery_unit();
    assert!(store.find_by_id(&mut ru, id).unwrap().is_none());
    assert!(matches!(
        store.delete(&mut ru, id),
        Err(AtlasError::RecordNotFound(_))
    ));
    assert_eq!(store.num_records(), 0);
    assert_eq!(store.data_size(), 0);
}

#[test]
fn test_capped_delete_is_illegal() {
    let engine = setup_engine();
    let store = engine
        .create_record_store(&CollectionOptions::builder("test.capped").capped(4096).build())
        .unwrap();
    let id = insert_one(&engine, &store, b"x");

    let mut ru = engine.recovery_unit();
    assert!(matches!(
        store.delete(&mut ru, id),
        Err(AtlasError::IllegalOperation(_))
    ));
}

// =============================================================================
// Truncate Tests
// =============================================================================

#[test]
fn test_truncate_clears_records_and_counters() {
    let engine = setup_engine();
    let store = ordinary(&engine, "test.c");
    for i in 0..10 {
        insert_one(&engine, &store, &[i]);
    }

    let mut ru = engine.recovery_unit();
    store.truncate(&mut ru).unwrap();
    ru.commit().unwrap();

    assert_eq!(store.num_records(), 0);
    assert_eq!(store.data_size(), 0);
    assert!(scan_ids(&engine, &store).is_empty());

    // Ids keep increasing after truncate
    assert_eq!(insert_one(&engine, &store, b"x"), RecordId::new(11));
}

#[test]
fn test_truncate_rollback_restores_counters() {
    let engine = setup_engine();
    let store = ordinary(&engine, "test.c");
    for i in 0..3 {
        insert_one(&engine, &store, &[i]);
    }

    let mut ru = engine.recovery_unit();
    store.truncate(&mut ru).unwrap();
    ru.abort();

    assert_eq!(store.num_records(), 3);
    assert_eq!(scan_ids(&engine, &store), vec![1, 2, 3]);
}

#[test]
fn test_truncate_after_exclusive_and_inclusive() {
    let engine = setup_engine();
    let store = ordinary(&engine, "test.c");
    for i in 0..10 {
        insert_one(&engine, &store, &[i, i]);
    }

    store.truncate_after(RecordId::new(7), false).unwrap();
    assert_eq!(scan_ids(&engine, &store), (1..=7).collect::<Vec<_>>());
    assert_eq!(store.num_records(), 7);
    assert_eq!(store.data_size(), 14);

    store.truncate_after(RecordId::new(5), true).unwrap();
    assert_eq!(scan_ids(&engine, &store), vec![1, 2, 3, 4]);
    assert_eq!(store.num_records(), 4);
}

#[test]
fn test_truncate_after_missing_record() {
    let engine = setup_engine();
    let store = ordinary(&engine, "test.c");
    insert_one(&engine, &store, b"a");

    assert!(matches!(
        store.truncate_after(RecordId::new(42), false),
        Err(AtlasError::RecordNotFound(_))
    ));
}

#[test]
fn test_truncate_after_on_log_rewinds_oldest_timestamp() {
    let (mem, engine) = setup_engine_with_kv();
    let store = log_store(&engine);

    let mut ru = engine.recovery_unit();
    let batch: Vec<_> = (1..=5).map(|i| log_entry(i, b"op")).collect();
    store.insert(&mut ru, &batch, &[]).unwrap();
    ru.commit().unwrap();

    let keep = LogTimestamp::new(1, 3);
    store.truncate_after(keep.record_id(), false).unwrap();

    assert_eq!(mem.oldest_timestamp(), keep.as_u64());
    assert_eq!(store.num_records(), 3);

    // The truncated tail can be written again
    let mut ru = engine.recovery_unit();
    store.insert(&mut ru, &[log_entry(4, b"op")], &[]).unwrap();
    ru.commit().unwrap();
    assert_eq!(store.num_records(), 4);
}

#[test]
fn test_log_start_position() {
    let engine = setup_engine();
    let store = log_store(&engine);

    let mut ru = engine.recovery_unit();
    let batch: Vec<_> = [10, 20, 30].iter().map(|&i| log_entry(i, b"op")).collect();
    store.insert(&mut ru, &batch, &[]).unwrap();
    ru.commit().unwrap();

    let mut ru = engine.recovery_unit();
    let at = |inc| LogTimestamp::new(1, inc).record_id();
    assert_eq!(store.log_start_position(&mut ru, at(25)).unwrap(), Some(at(20)));
    assert_eq!(store.log_start_position(&mut ru, at(30)).unwrap(), Some(at(30)));
    assert_eq!(store.log_start_position(&mut ru, at(5)).unwrap(), Some(RecordId::NULL));

    let other = ordinary(&engine, "test.c");
    assert_eq!(other.log_start_position(&mut ru, at(25)).unwrap(), None);
}

// =============================================================================
// Validate / Stats Tests
// =============================================================================

#[test]
fn test_validate_counters_match_scan() {
    let engine = setup_engine();
    let store = ordinary(&engine, "test.c");
    let mut ids = Vec::new();
    for i in 1..=20u8 {
        ids.push(insert_one(&engine, &store, &vec![i; i as usize]));
    }
    let mut ru = engine.recovery_unit();
    store.delete(&mut ru, ids[3]).unwrap();
    store.update(&mut ru, ids[4], b"short").unwrap();
    ru.commit().unwrap();

    let expected_records = store.num_records();
    let expected_size = store.data_size();

    let mut ru = engine.recovery_unit();
    let results = store.validate(&mut ru, ValidateLevel::Full, &AcceptAll).unwrap();

    assert!(results.valid);
    assert_eq!(results.nrecords, expected_records);
    assert_eq!(results.data_size, expected_size);
    assert_eq!(store.num_records(), 19);
}

#[test]
fn test_validate_reports_invalid_records() {
    let engine = setup_engine();
    let store = ordinary(&engine, "test.c");
    insert_one(&engine, &store, b"ok-record");
    insert_one(&engine, &store, b"no");

    let mut ru = engine.recovery_unit();
    let results = store.validate(&mut ru, ValidateLevel::Quick, &RejectShort).unwrap();

    assert!(!results.valid);
    assert_eq!(results.n_invalid, 1);
    assert!(!results.errors.is_empty());
}

#[test]
fn test_validate_busy_table_is_warning() {
    let engine = setup_engine();
    let store = ordinary(&engine, "test.c");
    insert_one(&engine, &store, b"abc");

    let mut writer = engine.recovery_unit();
    store.insert_record(&mut writer, &b"pending"[..], LogTimestamp::default()).unwrap();

    let mut ru = engine.recovery_unit();
    let results = store.validate(&mut ru, ValidateLevel::Full, &AcceptAll).unwrap();
    assert!(results.valid);
    assert_eq!(results.warnings.len(), 1);
    assert_eq!(results.nrecords, 1);

    writer.abort();
}

#[test]
fn test_validate_repairs_counters() {
    let engine = setup_engine();
    let store = ordinary(&engine, "test.c");
    insert_one(&engine, &store, b"abc");

    // Truncating twice in one unit must not push the counters below zero
    let mut ru = engine.recovery_unit();
    store.truncate(&mut ru).unwrap();
    store.truncate(&mut ru).unwrap();
    ru.commit().unwrap();
    assert_eq!((store.num_records(), store.data_size()), (0, 0));

    insert_one(&engine, &store, b"abcd");

    let mut ru = engine.recovery_unit();
    let results = store.validate(&mut ru, ValidateLevel::Quick, &AcceptAll).unwrap();
    assert_eq!((results.nrecords, results.data_size), (1, 4));
    assert_eq!((store.num_records(), store.data_size()), (1, 4));
}

#[test]
fn test_append_stats() {
    let engine = setup_engine();
    let store = engine
        .create_record_store(&CollectionOptions::builder("test.capped").capped(2048).build())
        .unwrap();
    insert_one(&engine, &store, &[0u8; 1024]);

    let stats = store.append_stats(1024);
    assert!(stats.capped);
    assert_eq!(stats.max_size, Some(2));
    assert_eq!(stats.size, 1);
    assert_eq!(stats.count, 1);
    assert_eq!(stats.format_version, MAX_FORMAT_VERSION);

    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["ns"], "test.capped");
}

#[test]
fn test_compact_keeps_records() {
    let engine = setup_engine();
    let store = ordinary(&engine, "test.c");
    let id = insert_one(&engine, &store, b"v1");
    let mut ru = engine.recovery_unit();
    store.update(&mut ru, id, b"v2").unwrap();
    ru.commit().unwrap();

    let mut ru = engine.recovery_unit();
    store.compact(&mut ru).unwrap();
    let record = store.find_by_id(&mut ru, id).unwrap().unwrap();
    assert_eq!(&record.data[..], b"v2");
}

// =============================================================================
// Format / Prefix Tests
// =============================================================================

#[test]
fn test_open_rejects_incompatible_format() {
    let (mem, engine) = setup_engine_with_kv();
    let metadata = TableMetadata {
        format_version: MAX_FORMAT_VERSION + 1,
        log_key_version: None,
        prefixed: false,
    };
    mem.create_table("test.future", &metadata.encode().unwrap()).unwrap();

    let err = engine
        .open_record_store(&CollectionOptions::builder("test.future").build())
        .err()
        .unwrap();
    assert!(matches!(err, AtlasError::IncompatibleFormat { .. }));
    assert!(err.is_fatal());
}

#[test]
fn test_open_rejects_unparsable_metadata() {
    let (mem, engine) = setup_engine_with_kv();
    mem.create_table("test.garbage", b"\xff").unwrap();

    let err = engine
        .open_record_store(&CollectionOptions::builder("test.garbage").build())
        .err()
        .unwrap();
    assert!(matches!(err, AtlasError::MetadataParse(_)));
}

#[test]
fn test_prefixed_stores_share_table_in_isolation() {
    let engine = setup_engine();
    let a = engine
        .create_record_store(&CollectionOptions::builder("test.a").table("shared").prefix(1).build())
        .unwrap();
    let b = engine
        .create_record_store(&CollectionOptions::builder("test.b").table("shared").prefix(2).build())
        .unwrap();

    for i in 0..3 {
        insert_one(&engine, &a, &[i]);
    }
    for i in 0..2 {
        insert_one(&engine, &b, &[i]);
    }

    assert_eq!(scan_ids(&engine, &a), vec![1, 2, 3]);
    assert_eq!(scan_ids(&engine, &b), vec![1, 2]);

    let mut ru = engine.recovery_unit();
    a.truncate(&mut ru).unwrap();
    ru.commit().unwrap();
    assert!(scan_ids(&engine, &a).is_empty());
    assert_eq!(scan_ids(&engine, &b), vec![1, 2]);
}

#[test]
fn test_reopen_recovers_next_id_and_counts() {
    let (mem, engine) = setup_engine_with_kv();
    let options = CollectionOptions::builder("test.c").build();
    let store = engine.create_record_store(&options).unwrap();
    for i in 0..4 {
        insert_one(&engine, &store, &[i]);
    }
    drop(store);
    engine.close().unwrap();

    let config = Config::builder().background_reclaim(false).build();
    let engine = Engine::open(config, Arc::new(mem)).unwrap();
    let store = engine.open_record_store(&options).unwrap();

    assert_eq!(store.num_records(), 4);
    assert_eq!(insert_one(&engine, &store, b"next"), RecordId::new(5));
}
