//! Storage Integration Tests
//!
//! Persistence writer into a real sled store, then the historical query
//! engine and preset store over the same database.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use modbus_daq::storage::{group_by_address, HistoryStore, PersistenceWriter, RecordFilter, RegisterPreset};
use modbus_daq::{FunctionCode, Sample, SampleStore};

fn at(minute: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap() + ChronoDuration::minutes(minute)
}

fn sample(slave_id: u8, address: u16, minute: i64, raw: u16) -> Sample {
    Sample {
        channel: Arc::from(format!("s{slave_id}a{address}")),
        slave_id,
        address,
        function_code: FunctionCode::InputRegisters,
        timestamp: at(minute),
        raw,
        value: f64::from(raw) / 10.0,
        unit: Arc::from("bar"),
    }
}

/// Sixty minutes of data for two slaves, two addresses each.
fn seed(store: &HistoryStore) {
    let mut batch = Vec::new();
    for minute in 0..60 {
        for (slave, address) in [(1, 0), (1, 1), (2, 0), (2, 1)] {
            batch.push(sample(slave, address, minute, minute as u16));
        }
    }
    store.append_batch(&batch).unwrap();
}

#[tokio::test(start_paused = true)]
async fn writer_flushes_into_queryable_history() {
    let dir = tempfile::tempdir().unwrap();
    let history = HistoryStore::open(dir.path().join("db")).unwrap();
    let writer = PersistenceWriter::new(Arc::new(history.clone()), Duration::from_secs(2), 1_000);
    let queue = writer.queue();
    let cancel = CancellationToken::new();
    let handle = writer.spawn(cancel.clone());

    queue.enqueue((0..5).map(|m| sample(1, 0, m, 100 + m as u16)));
    tokio::time::sleep(Duration::from_millis(2_100)).await;
    assert_eq!(history.len(), 5);

    queue.enqueue([sample(1, 0, 5, 105)]);
    cancel.cancel();
    handle.await.unwrap();

    let records = history.query(at(0), at(10), Some(1)).unwrap();
    assert_eq!(records.len(), 6);
    assert!(records.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    assert!((records[5].value - 10.5).abs() < 1e-9);
}

#[test]
fn query_filters_and_grouping() {
    let history = HistoryStore::temporary().unwrap();
    seed(&history);

    let all = history.query(at(10), at(19), None).unwrap();
    assert_eq!(all.len(), 40);

    let slave_two = history.query(at(10), at(19), Some(2)).unwrap();
    assert_eq!(slave_two.len(), 20);
    assert!(slave_two.iter().all(|r| r.slave_id == 2));

    let groups = group_by_address(&slave_two);
    assert_eq!(groups.keys().copied().collect::<Vec<_>>(), vec![0, 1]);
    assert_eq!(groups[&0].len(), 10);
    assert_eq!(groups[&1][0].0, at(10));

    let filter = RecordFilter::range(at(0), at(59))
        .slave(Some(1))
        .address(Some(1))
        .limit(Some(5));
    let limited = history.query_filtered(&filter).unwrap();
    assert_eq!(limited.len(), 5);
    assert_eq!(limited[0].timestamp, at(0));
    assert_eq!(history.count_matching(&filter.limit(None)).unwrap(), 60);

    assert_eq!(
        history.list_channels().unwrap(),
        vec![
            (1, 0, FunctionCode::InputRegisters),
            (1, 1, FunctionCode::InputRegisters),
            (2, 0, FunctionCode::InputRegisters),
            (2, 1, FunctionCode::InputRegisters),
        ]
    );
}

#[test]
fn delete_by_query_reports_count_before_commit() {
    let history = HistoryStore::temporary().unwrap();
    seed(&history);

    let plan = history.plan_delete_by_query(at(20), at(29), Some(1)).unwrap();
    assert_eq!(plan.len(), 20);
    // Planning alone removes nothing
    assert_eq!(history.len(), 240);

    assert_eq!(history.commit_deletion(plan).unwrap(), 20);
    assert!(history.query(at(20), at(29), Some(1)).unwrap().is_empty());
    assert_eq!(history.query(at(20), at(29), Some(2)).unwrap().len(), 20);
    assert_eq!(history.len(), 220);
}

#[test]
fn delete_by_ids_removes_exactly_those() {
    let history = HistoryStore::temporary().unwrap();
    seed(&history);

    let victims: Vec<u64> = history
        .query(at(0), at(0), None)
        .unwrap()
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(victims.len(), 4);

    let before = history.len();
    assert_eq!(history.delete_by_ids(victims.clone()).unwrap(), 4);
    assert_eq!(history.len(), before - 4);
    for id in victims {
        assert!(history.get(id).unwrap().is_none());
    }
    assert_eq!(history.query(at(1), at(1), None).unwrap().len(), 4);
}

#[test]
fn unknown_ids_are_not_counted() {
    let history = HistoryStore::temporary().unwrap();
    seed(&history);
    let plan = history.plan_delete_by_ids([999_999, 1]).unwrap();
    assert_eq!(plan.len(), 1);
}

#[test]
fn history_and_presets_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("modbus_data.db");

    {
        let history = HistoryStore::open(&path).unwrap();
        seed(&history);
        let presets = history.presets().unwrap();
        presets
            .upsert_register(&RegisterPreset {
                name: "boiler".into(),
                slave_id: 5,
                address: 100,
                count: 1,
                function_code: 3,
                unit: "degC".into(),
                scale: 0.1,
                offset: 0.0,
                color: Some("red".into()),
            })
            .unwrap();
        history.flush().unwrap();
    }

    let history = HistoryStore::open(&path).unwrap();
    let stats = history.stats().unwrap();
    assert_eq!(stats.records, 240);
    assert_eq!(stats.oldest, Some(at(0)));
    assert_eq!(stats.newest, Some(at(59)));

    let preset = history.presets().unwrap().get_register("boiler").unwrap().unwrap();
    assert_eq!(preset.address, 100);
}
