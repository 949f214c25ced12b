use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uptrack_core::{
    DeliveryError, FlushScheduler, FlushSettings, HttpTransport, Outbox, SessionStatus,
    Transport, UpdateRecord,
};
use uptrack_ingest::{routes, IngestStore, UpsertOutcome};
use uptrack_test_utils::{fixed_start, record, TestIngestServer, TEST_DEVICE};
use warp::http::StatusCode;
use warp::{Filter, Reply};

fn transport(url: String) -> HttpTransport {
    HttpTransport::new(url, Duration::from_secs(2)).unwrap()
}

#[tokio::test]
async fn http_delivery_is_idempotent() {
    let store = Arc::new(IngestStore::in_memory());
    let server = TestIngestServer::spawn(Arc::clone(&store));
    let client = transport(server.url());
    let update = record(60, SessionStatus::Open);

    client.attempt_deliver(&update).await.unwrap();
    client.attempt_deliver(&update).await.unwrap();

    assert_eq!(store.len(), 1);
    assert_eq!(store.get(&update.dedup_key), Some(update));
    assert_eq!(store.device(TEST_DEVICE).unwrap().deliveries, 2);
    server.stop().await;
}

#[tokio::test]
async fn concurrent_redeliveries_store_one_row() {
    let store = Arc::new(IngestStore::in_memory());
    let server = TestIngestServer::spawn(Arc::clone(&store));
    let client = Arc::new(transport(server.url()));
    let update = record(120, SessionStatus::Open);

    let attempts = (0..16).map(|_| {
        let client = Arc::clone(&client);
        let update = update.clone();
        async move { client.attempt_deliver(&update).await }
    });
    let results = futures::future::join_all(attempts).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(store.len(), 1);
    assert_eq!(store.session(TEST_DEVICE, fixed_start()).unwrap().progress_points, 1);
    server.stop().await;
}

#[tokio::test]
async fn reply_reports_outcome_and_key() {
    let store = Arc::new(IngestStore::in_memory());
    let server = TestIngestServer::spawn(Arc::clone(&store));
    let http = reqwest::Client::new();
    let update = record(180, SessionStatus::Open);
    let closing = record(180, SessionStatus::Closed);

    let first: serde_json::Value = http
        .post(server.url())
        .json(&update)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(first["acked"], true);
    assert_eq!(first["outcome"], "inserted");
    assert_eq!(first["dedup_key"], update.dedup_key.as_str());

    let upgraded: serde_json::Value = http
        .post(server.url())
        .json(&closing)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(upgraded["outcome"], "upgraded");
    assert!(store.session(TEST_DEVICE, fixed_start()).unwrap().closed);

    let get = http.get(server.url()).send().await.unwrap();
    assert_eq!(get.status().as_u16(), 405);
    server.stop().await;
}

#[tokio::test]
async fn first_attempt_rejected_then_delivered_on_next_cycle() {
    let store = Arc::new(IngestStore::in_memory());
    let calls = Arc::new(AtomicUsize::new(0));
    let flaky = {
        let calls = Arc::clone(&calls);
        warp::any()
            .and_then(move || {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Ok::<_, warp::Rejection>(StatusCode::SERVICE_UNAVAILABLE.into_response())
                    } else {
                        Err(warp::reject::not_found())
                    }
                }
            })
            .or(routes(Arc::clone(&store)))
    };
    let (addr, server) = warp::serve(flaky).bind_ephemeral(([127, 0, 0, 1], 0));
    let handle = tokio::spawn(server);

    let outbox = Arc::new(Outbox::in_memory());
    outbox.enqueue(record(60, SessionStatus::Open)).unwrap();
    let scheduler = FlushScheduler::new(
        Arc::clone(&outbox),
        Arc::new(transport(format!("http://{addr}/ingest"))),
        FlushSettings::default(),
    );

    let first = scheduler.flush_once().await;
    assert_eq!(first.failure, Some(DeliveryError::Status(503)));
    assert_eq!(outbox.delivered(), 0);
    assert!(store.is_empty());

    let second = scheduler.flush_once().await;
    assert_eq!(second.delivered, 1);
    assert_eq!(outbox.delivered(), 1);
    assert_eq!(store.len(), 1);

    handle.abort();
}

#[tokio::test]
async fn acknowledged_records_survive_a_server_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ingest.jsonl");
    let update: UpdateRecord = record(240, SessionStatus::Closed);

    {
        let store = Arc::new(IngestStore::open(&path).unwrap());
        let server = TestIngestServer::spawn(Arc::clone(&store));
        transport(server.url()).attempt_deliver(&update).await.unwrap();
        server.stop().await;
    }

    let store = IngestStore::open(&path).unwrap();
    assert_eq!(store.get(&update.dedup_key), Some(update.clone()));
    assert_eq!(store.upsert(update).unwrap(), UpsertOutcome::Duplicate);
}
