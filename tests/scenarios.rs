//! Integration tests exercising the concrete scenarios against [`ReferenceEngine`].

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;

use frame_bridge::config::Config;
use frame_bridge::connection::{ConnectionCore, HolderSource};
use frame_bridge::engine::reference::ReferenceEngine;
use frame_bridge::engine::{Engine, QueryParams};
use frame_bridge::holder::Holder;
use frame_bridge::preprocessor::{ArrowCapable, Scope, ScopeBinding};
use frame_bridge::udtf::{UdtfArgs, UdtfSignature};

fn open() -> Arc<ConnectionCore> {
    ConnectionCore::open(
        |_| Ok(Arc::new(ReferenceEngine::new()) as Arc<dyn Engine>),
        Config::default(),
    )
    .unwrap()
}

fn int_string_batch(ids: Vec<i64>, labels: Vec<&str>) -> (Arc<Schema>, RecordBatch) {
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, true),
        Field::new("label", DataType::Utf8, true),
    ]));
    let id: ArrayRef = Arc::new(Int64Array::from(ids));
    let label: ArrayRef = Arc::new(StringArray::from(labels));
    let batch = RecordBatch::try_new(schema.clone(), vec![id, label]).unwrap();
    (schema, batch)
}

fn collect_rows(mut reader: Box<dyn arrow::record_batch::RecordBatchReader + Send>) -> usize {
    let mut total = 0;
    while let Some(batch) = reader.next() {
        total += batch.unwrap().num_rows();
    }
    total
}

#[test]
fn s1_replace_visibility() {
    let conn = open();
    let (schema, batch) = int_string_batch(vec![1, 2, 3], vec!["a", "b", "c"]);
    conn.register("t", HolderSource::ArrowTable(schema.clone(), vec![batch]), None, true)
        .unwrap();

    let reader = conn
        .execute("SELECT * FROM t", QueryParams::None, HashMap::new(), &Scope::new())
        .unwrap();
    assert_eq!(collect_rows(reader), 3);

    let (schema2, batch2) = int_string_batch(vec![10, 20], vec!["x", "y"]);
    conn.register("t", HolderSource::ArrowTable(schema2, vec![batch2]), None, true)
        .unwrap();

    let reader = conn
        .execute("SELECT * FROM t", QueryParams::None, HashMap::new(), &Scope::new())
        .unwrap();
    assert_eq!(collect_rows(reader), 2);
}

#[test]
fn s2_date_filter_pushdown() {
    let conn = open();
    let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Date32, true)]));
    // 2000-01-01, 2000-10-01, 2010-01-01, NULL (days since epoch)
    let arr: ArrayRef = Arc::new(arrow::array::Date32Array::from(vec![
        Some(10957),
        Some(11231),
        Some(14610),
        None,
    ]));
    let batch = RecordBatch::try_new(schema.clone(), vec![arr]).unwrap();
    conn.register("dates", HolderSource::ArrowTable(schema, vec![batch]), None, true)
        .unwrap();

    let reader = conn
        .execute(
            "SELECT count(*) FROM dates WHERE a = '2000-01-01'",
            QueryParams::None,
            HashMap::new(),
            &Scope::new(),
        )
        .unwrap();
    assert_eq!(first_count(reader), 1);

    let reader = conn
        .execute(
            "SELECT count(*) FROM dates WHERE a > '2000-01-01'",
            QueryParams::None,
            HashMap::new(),
            &Scope::new(),
        )
        .unwrap();
    assert_eq!(first_count(reader), 2);

    let reader = conn
        .execute(
            "SELECT count(*) FROM dates WHERE a IS NULL",
            QueryParams::None,
            HashMap::new(),
            &Scope::new(),
        )
        .unwrap();
    assert_eq!(first_count(reader), 1);
}

fn first_count(mut reader: Box<dyn arrow::record_batch::RecordBatchReader + Send>) -> i64 {
    let batch = reader.next().unwrap().unwrap();
    let arr = batch
        .column(0)
        .as_any()
        .downcast_ref::<Int64Array>()
        .unwrap();
    arr.value(0)
}

#[test]
fn s3_nan_equality_and_ordering() {
    let conn = open();
    let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Float64, true)]));
    let arr: ArrayRef = Arc::new(Float64Array::from(vec![
        f64::INFINITY,
        f64::NAN,
        0.34234,
        3.4e7,
        f64::NEG_INFINITY,
        -f64::NAN,
        42.0,
        -42.0,
        0.0,
    ]));
    let batch = RecordBatch::try_new(schema.clone(), vec![arr]).unwrap();
    conn.register("floats", HolderSource::ArrowTable(schema, vec![batch]), None, true)
        .unwrap();

    let reader = conn
        .execute(
            "SELECT count(*) FROM floats WHERE a = 'NaN'",
            QueryParams::None,
            HashMap::new(),
            &Scope::new(),
        )
        .unwrap();
    assert_eq!(first_count(reader), 2);

    let reader = conn
        .execute(
            "SELECT count(*) FROM floats WHERE a > 'NaN'",
            QueryParams::None,
            HashMap::new(),
            &Scope::new(),
        )
        .unwrap();
    assert_eq!(first_count(reader), 0);
}

#[test]
fn s4_udtf_with_conn_injection() {
    let conn = open();
    let (schema, batch) = int_string_batch((0..10).collect(), vec!["x"; 10]);
    conn.register("base_data", HolderSource::ArrowTable(schema, vec![batch]), None, true)
        .unwrap();

    conn.register_udtf(
        "query_wrapper",
        UdtfSignature::new(vec!["limit".to_string(), "conn".to_string()]),
        Arc::new(|args: UdtfArgs, conn: Option<Arc<ConnectionCore>>| {
            let conn = conn.expect("conn should be injected");
            let limit = match args.positional.first() {
                Some(frame_bridge::filter::ScalarValue::Int64(n)) => *n,
                _ => return Err(frame_bridge::error::Error::new("missing limit", frame_bridge::error::Status::Internal)),
            };
            let sql = format!("SELECT id FROM base_data LIMIT {limit}");
            let reader = conn.execute(&sql, QueryParams::None, HashMap::new(), &Scope::new())?;
            let mut batches = Vec::new();
            for b in reader {
                batches.push(b?);
            }
            let schema = batches
                .first()
                .map(|b| b.schema())
                .unwrap_or_else(|| Arc::new(Schema::empty()));
            Ok(Arc::new(Holder::ArrowTable(frame_bridge::holder::ArrowTableHolder::new(
                schema, batches,
            ))))
        }),
    );

    let reader = conn
        .execute(
            "SELECT * FROM query_wrapper(5)",
            QueryParams::None,
            HashMap::new(),
            &Scope::new(),
        )
        .unwrap();
    assert_eq!(collect_rows(reader), 5);
}

#[test]
fn s5_replacement_scan_respects_the_toggle() {
    struct InMemory(RecordBatch);
    impl ArrowCapable for InMemory {
        fn into_holder(&self) -> frame_bridge::error::Result<Arc<Holder>> {
            Ok(Arc::new(Holder::ArrowTable(
                frame_bridge::holder::ArrowTableHolder::new(self.0.schema(), vec![self.0.clone()]),
            )))
        }
    }

    let (schema, batch) = int_string_batch(vec![1, 2, 3], vec!["a", "b", "c"]);
    let _ = &schema;

    let mut config = Config::default();
    config.enable_replacement_scan = true;
    let conn = ConnectionCore::open(
        |_| Ok(Arc::new(ReferenceEngine::new()) as Arc<dyn Engine>),
        config,
    )
    .unwrap();

    let mut scope = Scope::new();
    let mut frame = HashMap::new();
    frame.insert(
        "my_table".to_string(),
        ScopeBinding::Arrow(Arc::new(InMemory(batch)) as Arc<dyn ArrowCapable>),
    );
    scope.push_frame(frame);

    let reader = conn
        .execute("SELECT * FROM my_table", QueryParams::None, HashMap::new(), &scope)
        .unwrap();
    assert_eq!(collect_rows(reader), 3);

    let mut disabled_config = Config::default();
    disabled_config.enable_replacement_scan = false;
    let conn2 = ConnectionCore::open(
        |_| Ok(Arc::new(ReferenceEngine::new()) as Arc<dyn Engine>),
        disabled_config,
    )
    .unwrap();
    let err = conn2
        .execute("SELECT * FROM my_table", QueryParams::None, HashMap::new(), &scope)
        .unwrap_err();
    assert_eq!(err.status, frame_bridge::error::Status::EngineError);
}

#[test]
fn s6_statistics_nan_skip() {
    let conn = open();
    let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Float64, true)]));
    let arr: ArrayRef = Arc::new(Float64Array::from(vec![1.0, f64::NAN, 3.0]));
    let batch = RecordBatch::try_new(schema.clone(), vec![arr]).unwrap();

    let err = conn.register(
        "nans",
        HolderSource::ArrowTable(schema, vec![batch]),
        Some(frame_bridge::config::StatisticsSpec::All),
        true,
    );
    assert!(err.is_ok());

    let schema2 = Arc::new(Schema::new(vec![Field::new("a", DataType::Int64, true)]));
    let arr2: ArrayRef = Arc::new(Int64Array::from(vec![1, 2, 3]));
    let batch2 = RecordBatch::try_new(schema2.clone(), vec![arr2]).unwrap();
    conn.register(
        "ints",
        HolderSource::ArrowTable(schema2, vec![batch2]),
        Some(frame_bridge::config::StatisticsSpec::All),
        true,
    )
    .unwrap();
}

#[test]
fn cursor_has_its_own_last_result_rows() {
    let conn = open();
    let (schema, batch) = int_string_batch(vec![1, 2, 3, 4], vec!["a", "b", "c", "d"]);
    conn.register("t", HolderSource::ArrowTable(schema, vec![batch]), None, true)
        .unwrap();
    assert_eq!(conn.last_result_rows(), None);

    let reader = conn
        .execute("SELECT * FROM t", QueryParams::None, HashMap::new(), &Scope::new())
        .unwrap();
    assert_eq!(collect_rows(reader), 4);
    assert_eq!(conn.last_result_rows(), Some(4));

    let cursor = conn.cursor();
    assert_eq!(cursor.last_result_rows(), None);
    let reader = cursor
        .execute("SELECT * FROM t WHERE id > 1", QueryParams::None, HashMap::new(), &Scope::new())
        .unwrap();
    assert_eq!(collect_rows(reader), 3);
    assert_eq!(cursor.last_result_rows(), Some(3));
    // The cursor's own query did not dirty the parent's slot.
    assert_eq!(conn.last_result_rows(), Some(4));
}
