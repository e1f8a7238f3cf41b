//! Integration tests for the trace engine
//!
//! These tests drive the full stack — ingest rows into an in-memory
//! database, run the schedulers manually, and assert on persisted state —
//! so the idempotency and matching-precedence guarantees are verified the
//! way a deployment would hit them.

use anyhow::Result;
use callscope_trace_engine::prelude::*;
use serial_test::serial;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

async fn create_test_server() -> Result<CallScopeServer> {
    init_tracing();
    let mut config = TraceEngineConfig::default();
    // Short settle delay so fast-path tests stay fast.
    config.reconcile.settle_delay = Duration::from_millis(100);
    let server = CallScopeServerBuilder::new()
        .with_config(config)
        .with_in_memory_database()
        .build()
        .await?;
    Ok(server)
}

fn answered_cdr(unique_id: &str) -> CdrInsert {
    CdrInsert {
        unique_id: unique_id.to_string(),
        call_time: "2024-03-01T10:00:00Z".to_string(),
        duration_seconds: 42,
        disposition: "ANSWERED".to_string(),
        source_number: Some("5551000".to_string()),
        dest_number: Some("200".to_string()),
        dest_channel: Some("SIP/200".to_string()),
        caller_id_text: None,
        userfield: None,
    }
}

#[tokio::test]
#[serial]
async fn aggregation_is_idempotent() {
    let server = create_test_server().await.expect("server creation failed");
    let db = server.database();

    db.record_cdr(&answered_cdr("100.1")).await.unwrap();
    db.record_cdr(&answered_cdr("100.2")).await.unwrap();

    let first = server.aggregation().run_aggregation_pass().await.unwrap();
    assert_eq!(first.created, 2);

    // No new CDRs between runs: the second pass creates nothing.
    let second = server.aggregation().run_aggregation_pass().await.unwrap();
    assert_eq!(second.created, 0);
    assert_eq!(db.count_summaries().await.unwrap(), 2);
}

#[tokio::test]
#[serial]
async fn at_most_once_summary_with_reset_watermark() {
    let server = create_test_server().await.expect("server creation failed");
    let db = server.database();

    db.record_cdr(&answered_cdr("100.1")).await.unwrap();
    let first = server.aggregation().run_aggregation_pass().await.unwrap();
    assert_eq!(first.created, 1);

    // Artificially reset the watermark: the existence check, not the
    // watermark, must be what prevents duplicates.
    sqlx::query("UPDATE call_summaries SET cdr_sequence_id = NULL")
        .execute(db.pool())
        .await
        .unwrap();

    let rerun = server.aggregation().run_aggregation_pass().await.unwrap();
    assert!(rerun.scanned >= 1, "reset watermark must rescan old CDRs");
    assert_eq!(rerun.created, 0);
    assert_eq!(rerun.already_present, 1);
    assert_eq!(db.count_summaries().await.unwrap(), 1);
}

#[tokio::test]
#[serial]
async fn direct_answered_call_scenario() {
    let server = create_test_server().await.expect("server creation failed");
    let db = server.database();

    db.record_cdr(&answered_cdr("100.1")).await.unwrap();
    server.aggregation().run_aggregation_pass().await.unwrap();

    let summary = db.get_summary("100.1").await.unwrap().expect("summary missing");
    assert_eq!(summary.status, CallStatus::Answered);
    assert_eq!(summary.hangup_by, Some(HangupBy::Caller));
    assert!(!summary.queue_entered);
    assert_eq!(summary.duration_seconds, Some(42));
}

#[tokio::test]
#[serial]
async fn queued_and_abandoned_scenario() {
    let server = create_test_server().await.expect("server creation failed");
    let db = server.database();

    db.record_queue_event("1709287200.000", Some("200.1"), "sales", None, "ENTERQUEUE", &["2"])
        .await
        .unwrap();
    db.record_queue_event(
        "1709287230.000",
        Some("200.1"),
        "sales",
        None,
        "ABANDON",
        &["1", "1", "30"],
    )
    .await
    .unwrap();

    let traces = server
        .trace_builder()
        .build_traces(&["200.1".to_string()], None)
        .await
        .unwrap();
    let summary = &traces[0].summary;
    assert!(summary.queue_entered);
    assert_eq!(summary.queue_name.as_deref(), Some("sales"));
    assert!(!summary.answered);
    assert_eq!(summary.status, CallStatus::Abandon);
    assert_eq!(summary.hangup_by, Some(HangupBy::Caller));
    assert_eq!(summary.queue_wait_seconds, Some(30));
}

#[tokio::test]
#[serial]
async fn ignored_agents_then_transfer_scenario() {
    let server = create_test_server().await.expect("server creation failed");
    let db = server.database();

    let call = Some("300.1");
    db.record_queue_event("1709287200.000", call, "support", None, "ENTERQUEUE", &[])
        .await
        .unwrap();
    db.record_queue_event(
        "1709287205.000",
        call,
        "support",
        Some("Agent/100"),
        "RINGNOANSWER",
        &[],
    )
    .await
    .unwrap();
    db.record_queue_event(
        "1709287210.000",
        call,
        "support",
        Some("Agent/101"),
        "RINGNOANSWER",
        &[],
    )
    .await
    .unwrap();
    db.record_queue_event("1709287215.000", call, "support", None, "TRANSFER", &["2000"])
        .await
        .unwrap();

    let traces = server
        .trace_builder()
        .build_traces(&["300.1".to_string()], None)
        .await
        .unwrap();
    let summary = &traces[0].summary;
    assert_eq!(summary.ignored_agents, vec!["Agent/100", "Agent/101"]);
    assert!(summary.was_transferred);
    assert_eq!(summary.transfer_target.as_deref(), Some("2000"));
}

#[tokio::test]
#[serial]
async fn trace_timeline_merges_all_sources_in_order() {
    let server = create_test_server().await.expect("server creation failed");
    let db = server.database();

    db.record_cdr(&answered_cdr("400.1")).await.unwrap();
    db.record_ivr_event("400.1", "2024-03-01T09:59:50Z", "MENU", Some("main"), None, None)
        .await
        .unwrap();
    db.record_ivr_event("400.1", "2024-03-01T09:59:55Z", "QUEUE_ENTER", None, None, Some("sales"))
        .await
        .unwrap();
    db.record_queue_event(
        "1709287205.000",
        Some("400.1"),
        "sales",
        Some("Agent/200"),
        "CONNECT",
        &["5"],
    )
    .await
    .unwrap();

    let traces = server
        .trace_builder()
        .build_traces(&["400.1".to_string()], None)
        .await
        .unwrap();
    let trace = &traces[0];

    assert_eq!(trace.timeline.len(), 4);
    for pair in trace.timeline.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }
    assert!(trace.summary.answered);
    assert_eq!(trace.summary.agent.as_deref(), Some("Agent/200"));
    assert_eq!(trace.summary.queue_wait_seconds, Some(5));
}

#[tokio::test]
#[serial]
async fn trace_for_unknown_call_has_safe_defaults() {
    let server = create_test_server().await.expect("server creation failed");

    let traces = server
        .trace_builder()
        .build_traces(&["no-such-call".to_string()], None)
        .await
        .unwrap();
    assert_eq!(traces.len(), 1);
    assert_eq!(traces[0].summary.status, CallStatus::Unknown);
    assert!(!traces[0].summary.answered);
    assert!(traces[0].timeline.is_empty());
}

#[tokio::test]
#[serial]
async fn reconciliation_prefers_client_call_id_match() {
    let server = create_test_server().await.expect("server creation failed");
    let db = server.database();

    // Two candidate CDRs: one matches by userfield == client_call_id, a
    // different one matches by unique_id == sip_call_id.
    let mut by_userfield = answered_cdr("500.1");
    by_userfield.userfield = Some("client-abc".to_string());
    db.record_cdr(&by_userfield).await.unwrap();

    let mut by_unique_id = answered_cdr("sip-xyz");
    by_unique_id.duration_seconds = 99;
    db.record_cdr(&by_unique_id).await.unwrap();

    let record = db
        .create_call_log(Some("client-abc"), Some("sip-xyz"), None, CallLogStatus::AwaitingCdr)
        .await
        .unwrap();

    let outcome = server.reconciliation().run_reconciliation_pass().await.unwrap();
    assert_eq!(outcome.completed, 1);

    let updated = db.get_call_log(&record.id).await.unwrap().unwrap();
    assert_eq!(updated.status, "completed");
    assert_eq!(
        updated.asterisk_unique_id.as_deref(),
        Some("500.1"),
        "client_call_id match must win over sip_call_id"
    );
    assert_eq!(updated.duration_seconds, Some(42));
}

#[tokio::test]
#[serial]
async fn reconciliation_legacy_call_id_fallback() {
    let server = create_test_server().await.expect("server creation failed");
    let db = server.database();

    let mut cdr = answered_cdr("600.1");
    cdr.userfield = Some("600-legacy".to_string());
    db.record_cdr(&cdr).await.unwrap();

    let record = db
        .create_call_log(None, None, Some("600-legacy"), CallLogStatus::AwaitingCdr)
        .await
        .unwrap();

    server.reconciliation().run_reconciliation_pass().await.unwrap();
    let updated = db.get_call_log(&record.id).await.unwrap().unwrap();
    assert_eq!(updated.status, "completed");
    assert_eq!(updated.asterisk_unique_id.as_deref(), Some("600.1"));
}

#[tokio::test]
#[serial]
async fn unmatched_record_stays_awaiting() {
    let server = create_test_server().await.expect("server creation failed");
    let db = server.database();

    let record = db
        .create_call_log(Some("never-matches"), None, None, CallLogStatus::AwaitingCdr)
        .await
        .unwrap();

    // Several sweeps with no matching CDR: the record is left untouched,
    // not expired.
    for _ in 0..3 {
        let outcome = server.reconciliation().run_reconciliation_pass().await.unwrap();
        assert_eq!(outcome.completed, 0);
        assert_eq!(outcome.scanned, 1);
    }
    let unchanged = db.get_call_log(&record.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, "awaiting_cdr");
    assert!(unchanged.asterisk_unique_id.is_none());
}

#[tokio::test]
#[serial]
async fn fast_path_completes_after_settle_delay() {
    let server = create_test_server().await.expect("server creation failed");
    let db = server.database();

    let record = db
        .create_call_log(Some("fast-1"), None, None, CallLogStatus::AwaitingCdr)
        .await
        .unwrap();

    // The notification fires before the CDR writer has persisted; the
    // settle delay covers the gap.
    let reconcile = server.reconciliation().clone();
    let db_clone = db.clone();
    let (completed, _) = tokio::join!(
        reconcile.on_channel_destroyed(Some("fast-1"), None),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let mut cdr = answered_cdr("700.1");
            cdr.userfield = Some("fast-1".to_string());
            db_clone.record_cdr(&cdr).await.unwrap();
        }
    );
    assert_eq!(completed.unwrap(), 1);

    let updated = db.get_call_log(&record.id).await.unwrap().unwrap();
    assert_eq!(updated.status, "completed");
    assert_eq!(updated.asterisk_unique_id.as_deref(), Some("700.1"));
}

#[tokio::test]
#[serial]
async fn server_start_and_stop() {
    let mut server = create_test_server().await.expect("server creation failed");
    server.start().await.expect("start failed");
    server.stop().await.expect("stop failed");
}
