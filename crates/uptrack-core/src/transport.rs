//! Transport client
//!
//! One best-effort delivery attempt per call. Any non-2xx status, timeout or
//! connection error is a failure; retry policy lives in the flush scheduler.

use crate::error::DeliveryError;
use crate::policy::FaultPolicy;
use crate::types::UpdateRecord;
use std::sync::Arc;
use std::time::Duration;

/// A single delivery attempt
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one record
    ///
    /// # Errors
    /// Any failure to obtain a 2xx acknowledgment.
    async fn attempt_deliver(&self, record: &UpdateRecord) -> Result<(), DeliveryError>;
}

#[async_trait::async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn attempt_deliver(&self, record: &UpdateRecord) -> Result<(), DeliveryError> {
        (**self).attempt_deliver(record).await
    }
}

/// JSON-over-HTTP POST to the ingestion endpoint
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpTransport {
    /// Create a client with a fixed per-request timeout
    ///
    /// # Errors
    /// `DeliveryError::Transport` if the HTTP client cannot be built.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            timeout,
        })
    }

    /// Target URL
    #[inline]
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn classify(&self, error: &reqwest::Error) -> DeliveryError {
        if error.is_timeout() {
            DeliveryError::Timeout(u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX))
        } else {
            DeliveryError::Transport(error.to_string())
        }
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn attempt_deliver(&self, record: &UpdateRecord) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(record)
            .send()
            .await
            .map_err(|e| self.classify(&e))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Status(status.as_u16()))
        }
    }
}

/// Wraps a transport with a fault policy consulted before every attempt
#[derive(Debug)]
pub struct FaultyTransport<T, P> {
    inner: T,
    policy: P,
}

impl<T, P> FaultyTransport<T, P> {
    /// Create the wrapper
    #[inline]
    #[must_use]
    pub fn new(inner: T, policy: P) -> Self {
        Self { inner, policy }
    }

    /// Wrapped transport
    #[inline]
    #[must_use]
    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait::async_trait]
impl<T, P> Transport for FaultyTransport<T, P>
where
    T: Transport,
    P: FaultPolicy,
{
    async fn attempt_deliver(&self, record: &UpdateRecord) -> Result<(), DeliveryError> {
        self.policy.check()?;
        self.inner.attempt_deliver(record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ScriptedFaults;
    use crate::types::SessionStatus;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingTransport {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Transport for CountingTransport {
        async fn attempt_deliver(&self, _record: &UpdateRecord) -> Result<(), DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn policy_failure_short_circuits_network() {
        let transport = FaultyTransport::new(
            CountingTransport::default(),
            ScriptedFaults::fail_first(1, DeliveryError::Offline),
        );
        let record = UpdateRecord::new("dev", Utc::now(), 60, SessionStatus::Open);

        assert_eq!(transport.attempt_deliver(&record).await, Err(DeliveryError::Offline));
        assert_eq!(transport.inner().calls.load(Ordering::SeqCst), 0);

        assert_eq!(transport.attempt_deliver(&record).await, Ok(()));
        assert_eq!(transport.inner().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_transport_failure() {
        let transport =
            HttpTransport::new("http://127.0.0.1:9/ingest", Duration::from_millis(500)).unwrap();
        let record = UpdateRecord::new("dev", Utc::now(), 60, SessionStatus::Open);

        let err = transport.attempt_deliver(&record).await.unwrap_err();
        assert!(matches!(
            err,
            DeliveryError::Transport(_) | DeliveryError::Timeout(_)
        ));
    }
}
