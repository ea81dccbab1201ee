//! Tests for the xmin strategy

use super::*;
use crate::engine::ReadOutcome;
use crate::types::{JsonObject, StreamKey};
use futures::stream;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Mutex;
use test_case::test_case;

fn status(num_wraparound: i64, xid: i64) -> XminStatus {
    XminStatus::from_raw((num_wraparound << 32) | xid)
}

fn users() -> StreamKey {
    StreamKey::namespaced("public", "users")
}

fn catalog() -> ConfiguredCatalog {
    serde_json::from_value(json!({
        "streams": [{
            "stream": {"name": "users", "namespace": "public"},
            "sync_mode": "incremental"
        }]
    }))
    .unwrap()
}

fn row(id: i64) -> JsonObject {
    json!({"id": id}).as_object().unwrap().clone()
}

/// Query collaborator recording the plans it was asked for
struct RecordingQueries {
    current: XminStatus,
    rows: Mutex<Vec<Result<JsonObject>>>,
    plans: Mutex<Vec<XminQueryPlan>>,
}

impl RecordingQueries {
    fn new(current: XminStatus, rows: Vec<Result<JsonObject>>) -> Arc<Self> {
        Arc::new(Self {
            current,
            rows: Mutex::new(rows),
            plans: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl XminQueries for RecordingQueries {
    async fn current_xmin(&self) -> Result<XminStatus> {
        Ok(self.current)
    }

    async fn query_xmin(
        &self,
        _stream: &ConfiguredStream,
        plan: &XminQueryPlan,
    ) -> Result<RowStream> {
        self.plans.lock().unwrap().push(*plan);
        let rows = std::mem::take(&mut *self.rows.lock().unwrap());
        Ok(Box::pin(stream::iter(rows)))
    }
}

// ============================================================================
// Status Tests
// ============================================================================

#[test]
fn test_from_raw() {
    let status = XminStatus::from_raw(4_294_967_301);
    assert_eq!(status.num_wraparound, 1);
    assert_eq!(status.xmin_xid_value, 5);
    assert_eq!(status.xmin_raw_value, 4_294_967_301);
}

#[test]
fn test_wraparound_dominates_ordering() {
    assert!(status(1, 5) > status(0, 4_000_000_000));
    assert!(status(0, 6) > status(0, 5));
    assert_eq!(
        status(2, 1).cmp(&status(2, 1)),
        std::cmp::Ordering::Equal
    );
}

#[test_case(None, status(0, 100), XminQueryPlan::Full; "no prior state")]
#[test_case(Some(status(0, 50)), status(0, 100), XminQueryPlan::After { xid: 50 }; "same epoch")]
#[test_case(
    Some(status(0, 4_000_000_000)),
    status(1, 10),
    XminQueryPlan::AfterWrapped { previous_xid: 4_000_000_000, current_xid: 10 };
    "single wrap"
)]
#[test_case(Some(status(0, 10)), status(1, 20), XminQueryPlan::Full; "wrapped and caught up")]
#[test_case(Some(status(0, 10)), status(2, 5), XminQueryPlan::Full; "two wraps")]
fn test_query_plan(previous: Option<XminStatus>, current: XminStatus, expected: XminQueryPlan) {
    assert_eq!(XminQueryPlan::plan(previous.as_ref(), &current), expected);
}

#[test]
fn test_predicates() {
    assert_eq!(XminQueryPlan::Full.predicate(), None);
    assert_eq!(
        XminQueryPlan::After { xid: 50 }.predicate().unwrap(),
        "\"xmin\"::text::bigint > 50"
    );
    assert_eq!(
        XminQueryPlan::AfterWrapped {
            previous_xid: 90,
            current_xid: 3
        }
        .predicate()
        .unwrap(),
        "(\"xmin\"::text::bigint > 90 OR \"xmin\"::text::bigint <= 3)"
    );
}

// ============================================================================
// Driver Tests
// ============================================================================

#[tokio::test]
async fn test_checkpoint_carries_current_status() {
    let current = status(0, 500);
    let queries = RecordingQueries::new(current, vec![Ok(row(1)), Ok(row(2))]);
    let mut driver = XminDriver::new(queries.clone());

    let prior = vec![CheckpointMessage::stream(
        &users(),
        &StreamIncrementalState::Xmin(status(0, 100)),
    )
    .unwrap()];
    let scopes = driver.compute_baseline(&catalog(), &prior).await.unwrap();
    assert_eq!(driver.current_status(), Some(current));

    let mut iterator = driver.stream_records(&scopes[0]).await.unwrap();
    let mut count = 0;
    while iterator.next_record().await.unwrap().is_some() {
        count += 1;
    }
    assert_eq!(count, 2);
    assert_eq!(
        queries.plans.lock().unwrap().clone(),
        vec![XminQueryPlan::After { xid: 100 }]
    );

    let ReadOutcome::Exhausted(folded) = iterator.close().await.unwrap() else {
        panic!("expected exhaustion");
    };
    let checkpoint = driver.emit_checkpoint(&scopes[0], folded).await.unwrap();
    let value = serde_json::to_value(&checkpoint).unwrap();
    assert_eq!(value["stream"]["stream_state"]["state_type"], "xmin");
    assert_eq!(value["stream"]["stream_state"]["version"], 2);
    assert_eq!(value["stream"]["stream_state"]["xmin_xid_value"], 500);
}

#[tokio::test]
async fn test_read_error_ends_stream_without_checkpoint_state() {
    let queries = RecordingQueries::new(
        status(0, 500),
        vec![
            Ok(row(1)),
            Err(Error::query("public.users", "canceling statement")),
        ],
    );
    let mut driver = XminDriver::new(queries);
    let scopes = driver.compute_baseline(&catalog(), &[]).await.unwrap();

    let mut iterator = driver.stream_records(&scopes[0]).await.unwrap();
    assert!(iterator.next_record().await.unwrap().is_some());
    assert!(iterator.next_record().await.unwrap().is_none());
    assert!(matches!(
        iterator.close().await.unwrap(),
        ReadOutcome::EndedEarly { .. }
    ));
}

#[tokio::test]
async fn test_stream_records_requires_baseline() {
    let mut driver = XminDriver::new(RecordingQueries::new(status(0, 1), Vec::new()));
    let err = driver
        .stream_records(&CheckpointScope::Stream(users()))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::State { .. }));
}
