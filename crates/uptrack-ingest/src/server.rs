//! HTTP surface
//!
//! - `POST /ingest`: 200 `{"acked":true,...}` once the record is stored,
//!   400 for a malformed body, 405 for any other method, 500 if the store
//!   cannot persist (the device keeps the record and retries)
//! - `GET /healthz`
//! - `GET /devices`: last-seen markers
//! - `GET /devices/{id}/sessions`: per-session rollups

use crate::config::IngestConfig;
use crate::error::{IngestError, StoreError};
use crate::payload::IncomingRecord;
use crate::store::{IngestStore, UpsertOutcome};
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use warp::http::{Method, StatusCode};
use warp::hyper::body::Bytes;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

/// Largest accepted request body
pub const MAX_BODY_BYTES: u64 = 16 * 1024;

/// Reply body for `POST /ingest`
#[derive(Debug, Clone, Serialize)]
pub struct IngestReply {
    /// Whether the record is stored
    pub acked: bool,
    /// What the upsert did
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<UpsertOutcome>,
    /// Key the record was stored under
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,
    /// Failure description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IngestReply {
    fn failed(status: StatusCode, error: impl Into<String>) -> Response {
        let body = Self {
            acked: false,
            outcome: None,
            dedup_key: None,
            error: Some(error.into()),
        };
        warp::reply::with_status(warp::reply::json(&body), status).into_response()
    }
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    records: usize,
    version: &'static str,
}

/// All routes over a shared store
pub fn routes(
    store: Arc<IngestStore>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let ingest = warp::path("ingest")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::bytes())
        .and(with_store(Arc::clone(&store)))
        .and_then(handle_ingest);

    let wrong_method = warp::path("ingest")
        .and(warp::path::end())
        .and(warp::method())
        .and_then(|method: Method| async move {
            if method == Method::POST {
                Err(warp::reject::not_found())
            } else {
                Ok(IngestReply::failed(
                    StatusCode::METHOD_NOT_ALLOWED,
                    format!("{method} not allowed"),
                ))
            }
        });

    let healthz = warp::path("healthz")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_store(Arc::clone(&store)))
        .map(|store: Arc<IngestStore>| {
            warp::reply::json(&Health {
                status: "ok",
                records: store.len(),
                version: crate::VERSION,
            })
        });

    let devices = warp::path("devices")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_store(Arc::clone(&store)))
        .map(|store: Arc<IngestStore>| warp::reply::json(&store.devices()));

    let sessions = warp::path!("devices" / String / "sessions")
        .and(warp::get())
        .and(with_store(store))
        .map(|device: String, store: Arc<IngestStore>| warp::reply::json(&store.sessions(&device)));

    ingest.or(wrong_method).or(healthz).or(devices).or(sessions)
}

fn with_store(
    store: Arc<IngestStore>,
) -> impl Filter<Extract = (Arc<IngestStore>,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&store))
}

async fn handle_ingest(body: Bytes, store: Arc<IngestStore>) -> Result<Response, Rejection> {
    let record = match IncomingRecord::from_slice(&body).and_then(IncomingRecord::into_record) {
        Ok(record) => record,
        Err(e) => {
            tracing::warn!("rejecting payload: {e}");
            return Ok(IngestReply::failed(StatusCode::BAD_REQUEST, e.to_string()));
        }
    };

    let key = record.dedup_key.to_string();
    let label = record.label();
    let device = record.device_identifier.clone();
    let stored = tokio::task::spawn_blocking(move || store.upsert(record)).await;

    let outcome = match stored {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => return Ok(store_failure(&e)),
        Err(e) => {
            tracing::error!("upsert task failed: {e}");
            return Ok(IngestReply::failed(
                StatusCode::INTERNAL_SERVER_ERROR,
                "store unavailable",
            ));
        }
    };

    tracing::info!("[ingest] {device} {label} -> {outcome:?}");
    let body = IngestReply {
        acked: true,
        outcome: Some(outcome),
        dedup_key: Some(key),
        error: None,
    };
    Ok(warp::reply::json(&body).into_response())
}

fn store_failure(error: &StoreError) -> Response {
    tracing::error!("store failure, not acknowledging: {error}");
    IngestReply::failed(StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}

/// Build the store described by `config` and register its devices
///
/// # Errors
/// `StoreError` if the journal cannot be replayed.
pub fn open_store(config: &IngestConfig) -> Result<IngestStore, StoreError> {
    let store = match &config.journal_path {
        Some(path) => IngestStore::open(path)?,
        None => IngestStore::in_memory(),
    };
    for device in &config.devices {
        store.register_device(device);
    }
    Ok(store)
}

/// Bind the routes and return the server future
///
/// # Errors
/// `IngestError::Bind` if the address is unavailable.
pub fn bind<F>(
    store: Arc<IngestStore>,
    addr: SocketAddr,
    shutdown: F,
) -> Result<(SocketAddr, impl Future<Output = ()>), IngestError>
where
    F: Future<Output = ()> + Send + 'static,
{
    warp::serve(routes(store))
        .try_bind_with_graceful_shutdown(addr, shutdown)
        .map_err(|e| IngestError::Bind {
            addr,
            message: e.to_string(),
        })
}

/// Run the ingestion server until `shutdown` resolves
///
/// # Errors
/// Configuration, store or bind failures.
pub async fn serve<F>(config: &IngestConfig, shutdown: F) -> Result<(), IngestError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = config.socket_addr()?;
    let store = Arc::new(open_store(config)?);
    let (bound, server) = bind(store, addr, shutdown)?;

    tracing::info!("ingest listening on http://{bound}/ingest");
    server.await;
    tracing::info!("ingest server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use uptrack_core::{SessionStatus, UpdateRecord};

    fn record(run_seconds: u64) -> UpdateRecord {
        let start = Utc.with_ymd_and_hms(2025, 10, 23, 18, 0, 0).unwrap();
        UpdateRecord::new("dev", start, run_seconds, SessionStatus::Open)
    }

    fn json(response: &warp::http::Response<Bytes>) -> serde_json::Value {
        serde_json::from_slice(response.body()).unwrap()
    }

    #[tokio::test]
    async fn post_acks_and_duplicate_is_reported() {
        let store = Arc::new(IngestStore::in_memory());
        let api = routes(Arc::clone(&store));
        let body = serde_json::to_vec(&record(60)).unwrap();

        for expected in ["inserted", "duplicate"] {
            let response = warp::test::request()
                .method("POST")
                .path("/ingest")
                .body(body.clone())
                .reply(&api)
                .await;
            assert_eq!(response.status(), StatusCode::OK);
            let reply = json(&response);
            assert_eq!(reply["acked"], true);
            assert_eq!(reply["outcome"], expected);
        }
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn malformed_body_is_400() {
        let api = routes(Arc::new(IngestStore::in_memory()));
        let response = warp::test::request()
            .method("POST")
            .path("/ingest")
            .body("{not json")
            .reply(&api)
            .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(&response)["acked"], false);
    }

    #[tokio::test]
    async fn other_methods_are_405() {
        let api = routes(Arc::new(IngestStore::in_memory()));
        for method in ["GET", "PUT", "DELETE"] {
            let response = warp::test::request()
                .method(method)
                .path("/ingest")
                .reply(&api)
                .await;
            assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        }
    }

    #[tokio::test]
    async fn read_routes_expose_devices_and_sessions() {
        let store = Arc::new(IngestStore::in_memory());
        store.upsert(record(60)).unwrap();
        store.upsert(record(120)).unwrap();
        let api = routes(Arc::clone(&store));

        let health = warp::test::request().path("/healthz").reply(&api).await;
        assert_eq!(health.status(), StatusCode::OK);
        assert_eq!(json(&health)["records"], 2);

        let devices = warp::test::request().path("/devices").reply(&api).await;
        assert_eq!(json(&devices)[0]["device_identifier"], "dev");

        let sessions = warp::test::request()
            .path("/devices/dev/sessions")
            .reply(&api)
            .await;
        let sessions = json(&sessions);
        assert_eq!(sessions[0]["max_run_seconds"], 120);
        assert_eq!(sessions[0]["progress_points"], 2);
        assert_eq!(sessions[0]["closed"], false);
    }

    #[test]
    fn open_store_registers_configured_devices() {
        let config = IngestConfig {
            devices: vec!["airplane-N20503".to_string()],
            ..IngestConfig::new()
        };
        let store = open_store(&config).unwrap();
        assert!(store.device("airplane-N20503").unwrap().registered);
    }
}
