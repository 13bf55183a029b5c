//! Read-path behavior over generated series, mirroring how the engine is
//! exercised in production: seed a few tagged series, read them back
//! through each spec shape, and compare full table contents.

use std::collections::BTreeMap;
use std::sync::Arc;

use arrow::array::{Array, Float64Array, Int64Array, StringArray, TimestampNanosecondArray};
use arrow::record_batch::RecordBatch;
use chrono::DateTime;

use rill_common::{Allocator, BucketId, ErrorKind, MemoryPool, OrgId};
use rill_storage::{
    AggregateKind, Engine, FieldValue, GroupMode, KeyValue, MemEngine, Point, ReadFilterSpec,
    ReadGroupSpec, ReadWindowAggregateSpec, StorageReader, Table, TableStream, TimeBounds,
    TimeColumn,
};

const ORG: OrgId = OrgId(0xa);
const BUCKET: BucketId = BucketId(0xb);

fn ns(rfc3339: &str) -> i64 {
    DateTime::parse_from_rfc3339(rfc3339)
        .expect("valid time literal")
        .timestamp_nanos_opt()
        .expect("in range")
}

fn secs(n: i64) -> i64 {
    n * 1_000_000_000
}

fn base() -> i64 {
    ns("2019-11-25T00:00:00Z")
}

/// Seed one series per tag value: samples every `delta_ns` across
/// `[start, stop)`, cycling through `pattern`.
fn generate(
    engine: &MemEngine,
    tag_values: &[&str],
    delta_ns: i64,
    pattern: &[f64],
    start: i64,
    stop: i64,
) {
    for tag in tag_values {
        let mut tags = BTreeMap::new();
        tags.insert("t0".to_string(), tag.to_string());
        let mut points = Vec::new();
        let mut t = start;
        let mut i = 0usize;
        while t < stop {
            points.push(Point::float("m0", tags.clone(), "f0", t, pattern[i % pattern.len()]));
            t += delta_ns;
            i += 1;
        }
        engine.write_points(ORG, BUCKET, points).expect("write");
    }
}

fn reader_over(engine: MemEngine) -> StorageReader {
    StorageReader::new(Arc::new(engine))
}

fn filter_spec(start: i64, stop: i64) -> ReadFilterSpec {
    ReadFilterSpec {
        org: ORG,
        bucket: BUCKET,
        bounds: TimeBounds::new(start, stop).expect("bounds"),
        predicate: None,
    }
}

fn collect(mut stream: rill_storage::BoxTableStream) -> Vec<(Table, RecordBatch)> {
    let mut out = Vec::new();
    while let Some(mut table) = stream.next_table().expect("stream") {
        let batch = table.take_batch().expect("payload");
        out.push((table, batch));
    }
    out
}

fn float_values(batch: &RecordBatch) -> Vec<Option<f64>> {
    let col = batch
        .column(batch.schema().index_of("_value").unwrap())
        .as_any()
        .downcast_ref::<Float64Array>()
        .expect("float _value")
        .clone();
    (0..col.len())
        .map(|i| (!col.is_null(i)).then(|| col.value(i)))
        .collect()
}

fn int_values(batch: &RecordBatch) -> Vec<Option<i64>> {
    let col = batch
        .column(batch.schema().index_of("_value").unwrap())
        .as_any()
        .downcast_ref::<Int64Array>()
        .expect("int _value")
        .clone();
    (0..col.len())
        .map(|i| (!col.is_null(i)).then(|| col.value(i)))
        .collect()
}

fn time_values(batch: &RecordBatch) -> Vec<Option<i64>> {
    let col = batch
        .column(batch.schema().index_of("_time").unwrap())
        .as_any()
        .downcast_ref::<TimestampNanosecondArray>()
        .expect("_time column")
        .clone();
    (0..col.len())
        .map(|i| (!col.is_null(i)).then(|| col.value(i)))
        .collect()
}

fn tag_of(table: &Table) -> String {
    match table.group_key().get("t0") {
        Some(KeyValue::Str(s)) => s.clone(),
        other => panic!("missing t0 key: {other:?}"),
    }
}

fn key_time(table: &Table, label: &str) -> i64 {
    match table.group_key().get(label) {
        Some(KeyValue::Time(t)) => *t,
        other => panic!("missing {label} key: {other:?}"),
    }
}

#[test]
fn read_filter_emits_one_table_per_series() {
    let engine = MemEngine::new();
    engine.open().unwrap();
    generate(
        &engine,
        &["a-0", "a-1", "a-2"],
        secs(10),
        &[1.0, 2.0, 3.0],
        base(),
        base() + secs(30),
    );
    let reader = reader_over(engine);

    let alloc = Allocator::unlimited();
    let stream = reader
        .read_filter(&filter_spec(base(), base() + secs(30)), &alloc)
        .unwrap();
    let tables = collect(stream);

    assert_eq!(tables.len(), 3);
    for (i, (table, batch)) in tables.iter().enumerate() {
        assert_eq!(tag_of(table), format!("a-{i}"));
        assert_eq!(batch.num_rows(), 3);
        assert_eq!(
            float_values(batch),
            vec![Some(1.0), Some(2.0), Some(3.0)]
        );
        assert_eq!(
            time_values(batch),
            vec![Some(base()), Some(base() + secs(10)), Some(base() + secs(20))]
        );
        let measurement = batch
            .column(batch.schema().index_of("_measurement").unwrap())
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap()
            .value(0)
            .to_string();
        assert_eq!(measurement, "m0");
    }
}

#[test]
fn window_count_emits_one_table_per_window() {
    let engine = MemEngine::new();
    engine.open().unwrap();
    generate(
        &engine,
        &["a-0", "a-1", "a-2"],
        secs(10),
        &[1.0, 2.0, 3.0, 4.0],
        base(),
        base() + secs(120),
    );
    let reader = reader_over(engine);

    let alloc = Allocator::unlimited();
    let stream = reader
        .read_window_aggregate(
            &ReadWindowAggregateSpec {
                filter: filter_spec(base(), base() + secs(120)),
                window_every: secs(30),
                offset: 0,
                aggregates: vec![AggregateKind::Count],
                time_column: None,
                create_empty: false,
            },
            &alloc,
        )
        .unwrap();
    let tables = collect(stream);

    // 3 tags x 4 windows.
    assert_eq!(tables.len(), 12);
    for (table, batch) in &tables {
        assert_eq!(batch.num_rows(), 1);
        assert_eq!(int_values(batch), vec![Some(3)]);
        // count carries no sample timestamp
        assert!(batch.schema().index_of("_time").is_err());
        let width = key_time(table, "_stop") - key_time(table, "_start");
        assert_eq!(width, secs(30));
    }
    // Windows of one series arrive in ascending _start.
    let starts: Vec<i64> = tables
        .iter()
        .filter(|(t, _)| tag_of(t) == "a-0")
        .map(|(t, _)| key_time(t, "_start"))
        .collect();
    assert_eq!(
        starts,
        vec![base(), base() + secs(30), base() + secs(60), base() + secs(90)]
    );
}

#[test]
fn window_min_by_stop_time_merges_windows_per_series() {
    let engine = MemEngine::new();
    engine.open().unwrap();
    generate(
        &engine,
        &["a-0", "a-1", "a-2"],
        secs(10),
        &[1.0, 2.0, 3.0, 4.0],
        base(),
        base() + secs(120),
    );
    let reader = reader_over(engine);

    let alloc = Allocator::unlimited();
    let stream = reader
        .read_window_aggregate(
            &ReadWindowAggregateSpec {
                filter: filter_spec(base(), base() + secs(120)),
                window_every: secs(30),
                offset: 0,
                aggregates: vec![AggregateKind::Min],
                time_column: Some(TimeColumn::Stop),
                create_empty: false,
            },
            &alloc,
        )
        .unwrap();
    let tables = collect(stream);

    assert_eq!(tables.len(), 3);
    for (table, batch) in &tables {
        // Whole bounds in the key, boundary times per row.
        assert_eq!(key_time(table, "_start"), base());
        assert_eq!(key_time(table, "_stop"), base() + secs(120));
        assert_eq!(batch.num_rows(), 4);
        assert_eq!(
            time_values(batch),
            vec![
                Some(base() + secs(30)),
                Some(base() + secs(60)),
                Some(base() + secs(90)),
                Some(base() + secs(120)),
            ]
        );
        assert_eq!(
            float_values(batch),
            vec![Some(1.0), Some(1.0), Some(1.0), Some(2.0)]
        );
    }
}

#[test]
fn create_empty_with_truncated_bounds_counts_zero() {
    let engine = MemEngine::new();
    engine.open().unwrap();
    generate(
        &engine,
        &["a-0", "a-1", "a-2"],
        secs(15),
        &[1.0, 2.0, 3.0, 4.0],
        base(),
        base() + secs(60),
    );
    let reader = reader_over(engine);

    let alloc = Allocator::unlimited();
    let stream = reader
        .read_window_aggregate(
            &ReadWindowAggregateSpec {
                filter: filter_spec(base() + secs(5), base() + secs(25)),
                window_every: secs(10),
                offset: 0,
                aggregates: vec![AggregateKind::Count],
                time_column: None,
                create_empty: true,
            },
            &alloc,
        )
        .unwrap();
    let tables = collect(stream);

    // 3 tags x 3 windows: [5,10) [10,20) [20,25).
    assert_eq!(tables.len(), 9);
    for tag in ["a-0", "a-1", "a-2"] {
        let per_tag: Vec<&(Table, RecordBatch)> = tables
            .iter()
            .filter(|(t, _)| tag_of(t) == tag)
            .collect();
        assert_eq!(per_tag.len(), 3);
        let counts: Vec<Option<i64>> = per_tag
            .iter()
            .map(|(_, b)| int_values(b)[0])
            .collect();
        assert_eq!(counts, vec![Some(0), Some(1), Some(0)]);
        assert_eq!(key_time(&per_tag[0].0, "_start"), base() + secs(5));
        assert_eq!(key_time(&per_tag[2].0, "_stop"), base() + secs(25));
    }
}

#[test]
fn window_mean_with_offset_truncates_edge_windows() {
    let engine = MemEngine::new();
    engine.open().unwrap();
    generate(
        &engine,
        &["a0"],
        secs(5),
        &[1.0, 2.0, 3.0, 4.0],
        base(),
        base() + secs(60),
    );
    let reader = reader_over(engine);

    let alloc = Allocator::unlimited();
    let stream = reader
        .read_window_aggregate(
            &ReadWindowAggregateSpec {
                filter: filter_spec(base(), base() + secs(60)),
                window_every: secs(10),
                offset: secs(2),
                aggregates: vec![AggregateKind::Mean],
                time_column: None,
                create_empty: false,
            },
            &alloc,
        )
        .unwrap();
    let tables = collect(stream);

    assert_eq!(tables.len(), 7);
    let means: Vec<Option<f64>> = tables.iter().map(|(_, b)| float_values(b)[0]).collect();
    assert_eq!(
        means,
        vec![
            Some(1.0),
            Some(2.5),
            Some(2.5),
            Some(2.5),
            Some(2.5),
            Some(2.5),
            Some(4.0),
        ]
    );
    assert_eq!(key_time(&tables[0].0, "_stop"), base() + secs(2));
    assert_eq!(key_time(&tables[6].0, "_start"), base() + secs(52));
    assert_eq!(key_time(&tables[6].0, "_stop"), base() + secs(60));
}

#[test]
fn unwindowed_mean_spans_the_bounds() {
    let engine = MemEngine::new();
    engine.open().unwrap();
    generate(
        &engine,
        &["a0"],
        secs(5),
        &[1.0, 2.0, 3.0, 4.0],
        base(),
        base() + secs(60),
    );
    let reader = reader_over(engine);

    let alloc = Allocator::unlimited();
    let stream = reader
        .read_window_aggregate(
            &ReadWindowAggregateSpec {
                filter: filter_spec(base(), base() + secs(60)),
                window_every: i64::MAX,
                offset: 0,
                aggregates: vec![AggregateKind::Mean],
                time_column: None,
                create_empty: false,
            },
            &alloc,
        )
        .unwrap();
    let tables = collect(stream);
    assert_eq!(tables.len(), 1);
    assert_eq!(float_values(&tables[0].1), vec![Some(2.5)]);
    assert_eq!(key_time(&tables[0].0, "_start"), base());
    assert_eq!(key_time(&tables[0].0, "_stop"), base() + secs(60));
}

#[test]
fn create_empty_sum_emits_null_rows_per_window_table() {
    let engine = MemEngine::new();
    engine.open().unwrap();
    // Samples every 20s: windows [5,15) and [25,35) and [45,55) and
    // [55,60) are empty under every=10s offset=5s.
    generate(
        &engine,
        &["a0"],
        secs(20),
        &[1.0, 2.0],
        base(),
        base() + secs(60),
    );
    let reader = reader_over(engine);

    let alloc = Allocator::unlimited();
    let stream = reader
        .read_window_aggregate(
            &ReadWindowAggregateSpec {
                filter: filter_spec(base(), base() + secs(60)),
                window_every: secs(10),
                offset: secs(5),
                aggregates: vec![AggregateKind::Sum],
                time_column: None,
                create_empty: true,
            },
            &alloc,
        )
        .unwrap();
    let tables = collect(stream);

    assert_eq!(tables.len(), 7);
    let sums: Vec<Option<f64>> = tables.iter().map(|(_, b)| float_values(b)[0]).collect();
    assert_eq!(
        sums,
        vec![Some(1.0), None, Some(2.0), None, Some(1.0), None, None]
    );
}

#[test]
fn create_empty_selector_emits_zero_row_window_tables() {
    let engine = MemEngine::new();
    engine.open().unwrap();
    generate(
        &engine,
        &["a0"],
        secs(15),
        &[1.0, 2.0, 3.0, 4.0],
        base(),
        base() + secs(60),
    );
    let reader = reader_over(engine);

    let alloc = Allocator::unlimited();
    let stream = reader
        .read_window_aggregate(
            &ReadWindowAggregateSpec {
                filter: filter_spec(base(), base() + secs(60)),
                window_every: secs(10),
                offset: 0,
                aggregates: vec![AggregateKind::Min],
                time_column: None,
                create_empty: true,
            },
            &alloc,
        )
        .unwrap();
    let tables = collect(stream);

    // Samples at 0,15,30,45: windows [20,30) and [50,60) are empty.
    assert_eq!(tables.len(), 6);
    let rows: Vec<usize> = tables.iter().map(|(_, b)| b.num_rows()).collect();
    assert_eq!(rows, vec![1, 1, 0, 1, 1, 0]);
    assert_eq!(float_values(&tables[1].1), vec![Some(2.0)]);
    assert_eq!(time_values(&tables[1].1), vec![Some(base() + secs(15))]);
}

#[test]
fn merged_sum_with_offset_keeps_null_rows_and_clipped_boundaries() {
    let engine = MemEngine::new();
    engine.open().unwrap();
    generate(
        &engine,
        &["a0"],
        secs(20),
        &[1.0, 2.0],
        base(),
        base() + secs(60),
    );
    let reader = reader_over(engine);

    let alloc = Allocator::unlimited();
    let stream = reader
        .read_window_aggregate(
            &ReadWindowAggregateSpec {
                filter: filter_spec(base(), base() + secs(60)),
                window_every: secs(10),
                offset: secs(18),
                aggregates: vec![AggregateKind::Sum],
                time_column: Some(TimeColumn::Stop),
                create_empty: true,
            },
            &alloc,
        )
        .unwrap();
    let tables = collect(stream);

    assert_eq!(tables.len(), 1);
    let (_, batch) = &tables[0];
    assert_eq!(
        time_values(batch),
        vec![
            Some(base() + secs(8)),
            Some(base() + secs(18)),
            Some(base() + secs(28)),
            Some(base() + secs(38)),
            Some(base() + secs(48)),
            Some(base() + secs(58)),
            // Final boundary clips to the read bounds.
            Some(base() + secs(60)),
        ]
    );
    assert_eq!(
        float_values(batch),
        vec![Some(1.0), None, Some(2.0), None, Some(1.0), None, None]
    );
}

#[test]
fn merged_selector_empty_windows_are_null_timestamp_rows() {
    let engine = MemEngine::new();
    engine.open().unwrap();
    generate(
        &engine,
        &["a0"],
        secs(20),
        &[1.0, 2.0],
        base(),
        base() + secs(60),
    );
    let reader = reader_over(engine);

    let alloc = Allocator::unlimited();
    let stream = reader
        .read_window_aggregate(
            &ReadWindowAggregateSpec {
                filter: filter_spec(base(), base() + secs(60)),
                window_every: secs(10),
                offset: 0,
                aggregates: vec![AggregateKind::First],
                time_column: Some(TimeColumn::Stop),
                create_empty: true,
            },
            &alloc,
        )
        .unwrap();
    let tables = collect(stream);

    assert_eq!(tables.len(), 1);
    let (_, batch) = &tables[0];
    assert_eq!(batch.num_rows(), 6);
    assert_eq!(
        time_values(batch),
        vec![
            Some(base() + secs(10)),
            None,
            Some(base() + secs(30)),
            None,
            Some(base() + secs(50)),
            None,
        ]
    );
    assert_eq!(
        float_values(batch),
        vec![Some(1.0), None, Some(2.0), None, Some(1.0), None]
    );
}

#[test]
fn read_group_by_tag_applies_one_terminal_aggregate() {
    let engine = MemEngine::new();
    engine.open().unwrap();
    generate(
        &engine,
        &["a-0", "a-1", "a-2"],
        secs(10),
        &[1.0, 2.0, 3.0, 4.0],
        base(),
        base() + secs(120),
    );
    let reader = reader_over(engine);

    let alloc = Allocator::unlimited();
    let stream = reader
        .read_group(
            &ReadGroupSpec {
                filter: filter_spec(base(), base() + secs(120)),
                group_mode: GroupMode::By,
                group_keys: vec![
                    "_measurement".to_string(),
                    "_field".to_string(),
                    "t0".to_string(),
                ],
                aggregate: Some(AggregateKind::Max),
            },
            &alloc,
        )
        .unwrap();
    let tables = collect(stream);

    assert_eq!(tables.len(), 3);
    for (table, batch) in &tables {
        assert_eq!(batch.num_rows(), 1);
        assert_eq!(float_values(batch), vec![Some(4.0)]);
        // First 4.0 is at +30s; ties resolve to the earliest sample.
        assert_eq!(time_values(batch), vec![Some(base() + secs(30))]);
        assert_eq!(key_time(table, "_start"), base());
        assert_eq!(key_time(table, "_stop"), base() + secs(120));
    }
}

#[test]
fn read_group_without_aggregate_merges_rows_in_time_order() {
    let engine = MemEngine::new();
    engine.open().unwrap();
    generate(
        &engine,
        &["a-0", "a-1"],
        secs(10),
        &[1.0, 2.0],
        base(),
        base() + secs(20),
    );
    let reader = reader_over(engine);

    let alloc = Allocator::unlimited();
    let stream = reader
        .read_group(
            &ReadGroupSpec {
                filter: filter_spec(base(), base() + secs(20)),
                group_mode: GroupMode::By,
                group_keys: vec!["_measurement".to_string()],
                aggregate: None,
            },
            &alloc,
        )
        .unwrap();
    let tables = collect(stream);

    assert_eq!(tables.len(), 1);
    let (_, batch) = &tables[0];
    assert_eq!(batch.num_rows(), 4);
    let times = time_values(batch);
    let mut sorted = times.clone();
    sorted.sort();
    assert_eq!(times, sorted);
}

#[test]
fn round_trip_returns_every_written_point() {
    let engine = MemEngine::new();
    engine.open().unwrap();
    let n: usize = 17;
    generate(
        &engine,
        &["a-0", "a-1"],
        secs(1),
        &[1.0, 2.0, 3.0],
        base(),
        base() + secs(n as i64),
    );
    let reader = reader_over(engine);

    let alloc = Allocator::unlimited();
    let stream = reader
        .read_filter(&filter_spec(base(), base() + secs(n as i64)), &alloc)
        .unwrap();
    let tables = collect(stream);
    assert_eq!(tables.len(), 2);
    for (_, batch) in &tables {
        assert_eq!(batch.num_rows(), n);
    }
}

#[test]
fn allocator_exhaustion_surfaces_resource_exhausted() {
    let engine = MemEngine::new();
    engine.open().unwrap();
    generate(
        &engine,
        &["a-0", "a-1", "a-2"],
        secs(1),
        &[1.0],
        base(),
        base() + secs(60),
    );
    let reader = reader_over(engine);

    let pool = MemoryPool::new(u64::MAX);
    // Enough for roughly one table, not three.
    let alloc = Allocator::with_pool(pool, 0, 4096).unwrap();
    let mut stream = reader
        .read_filter(&filter_spec(base(), base() + secs(60)), &alloc)
        .unwrap();

    let mut emitted = 0usize;
    let err = loop {
        match stream.next_table() {
            Ok(Some(mut table)) => {
                // Consume but keep holding the memory.
                let batch = table.take_batch().unwrap();
                std::mem::forget(table);
                std::mem::forget(batch);
                emitted += 1;
            }
            Ok(None) => panic!("expected exhaustion before end of stream"),
            Err(err) => break err,
        }
    };
    assert!(emitted < 3);
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);

    // The failure replays on the next poll.
    let again = stream.next_table().unwrap_err();
    assert_eq!(again.kind(), ErrorKind::ResourceExhausted);
}

#[test]
fn multiple_aggregates_are_rejected() {
    let engine = MemEngine::new();
    engine.open().unwrap();
    let reader = reader_over(engine);
    let alloc = Allocator::unlimited();
    let err = reader
        .read_window_aggregate(
            &ReadWindowAggregateSpec {
                filter: filter_spec(0, 10),
                window_every: 5,
                offset: 0,
                aggregates: vec![AggregateKind::Count, AggregateKind::Sum],
                time_column: None,
                create_empty: false,
            },
            &alloc,
        )
        .map(|_| ())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn predicate_restricts_series() {
    let engine = MemEngine::new();
    engine.open().unwrap();
    generate(
        &engine,
        &["a-0", "a-1"],
        secs(10),
        &[1.0],
        base(),
        base() + secs(30),
    );
    let reader = reader_over(engine);
    let alloc = Allocator::unlimited();
    let stream = reader
        .read_filter(
            &ReadFilterSpec {
                predicate: Some(rill_storage::Predicate::tag_eq("t0", "a-1")),
                ..filter_spec(base(), base() + secs(30))
            },
            &alloc,
        )
        .unwrap();
    let tables = collect(stream);
    assert_eq!(tables.len(), 1);
    assert_eq!(tag_of(&tables[0].0), "a-1");
}

#[test]
fn drive_visits_every_table_and_stops_on_visitor_error() {
    let engine = MemEngine::new();
    engine.open().unwrap();
    generate(
        &engine,
        &["a-0", "a-1", "a-2"],
        secs(10),
        &[1.0],
        base(),
        base() + secs(30),
    );
    let reader = reader_over(engine);
    let alloc = Allocator::unlimited();

    let mut visited = 0usize;
    rill_storage::drive(
        reader
            .read_filter(&filter_spec(base(), base() + secs(30)), &alloc)
            .unwrap(),
        |_| {
            visited += 1;
            Ok(())
        },
    )
    .unwrap();
    assert_eq!(visited, 3);

    let mut visited = 0usize;
    let err = rill_storage::drive(
        reader
            .read_filter(&filter_spec(base(), base() + secs(30)), &alloc)
            .unwrap(),
        |_| {
            visited += 1;
            Err(rill_common::RillError::Internal("stop".into()))
        },
    )
    .unwrap_err();
    assert_eq!(visited, 1);
    assert_eq!(err.kind(), ErrorKind::Internal);
}

#[test]
fn written_float_value_round_trips_exactly() {
    let engine = MemEngine::new();
    engine.open().unwrap();
    let mut tags = BTreeMap::new();
    tags.insert("t0".to_string(), "x".to_string());
    engine
        .write_points(
            ORG,
            BUCKET,
            vec![Point {
                measurement: "m0".into(),
                tags,
                field: "f0".into(),
                time: base(),
                value: FieldValue::Float(0.125),
            }],
        )
        .unwrap();
    let reader = reader_over(engine);
    let alloc = Allocator::unlimited();
    let tables = collect(
        reader
            .read_filter(&filter_spec(base(), base() + 1), &alloc)
            .unwrap(),
    );
    assert_eq!(float_values(&tables[0].1), vec![Some(0.125)]);
}
