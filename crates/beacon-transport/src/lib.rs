//! HTTP delivery of event batches to the ingest endpoint.
//!
//! [`HttpTransport`] POSTs a JSON array of events. `send` races the request
//! against a deadline and maps every non-2xx answer to a failure, so the
//! scheduler only ever sees delivered or retry. `send_beacon` is the
//! teardown path: it detaches the request onto the current tokio runtime
//! and returns at once.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use beacon_protocol::{Event, PipelineConfig, Transport, TransportError};
use parking_lot::RwLock;
use reqwest::header::CONTENT_TYPE;
use tokio::runtime::Handle;
use tracing::{debug, instrument, warn};

/// Largest body the teardown handoff will accept.
pub const BEACON_BODY_LIMIT: usize = 64 * 1024;

pub const LOGGER_CLIENT: &str = concat!("beacon-rust/", env!("CARGO_PKG_VERSION"));

pub const HEADER_APP_NAME: &str = "x-app-name";
pub const HEADER_APP_VERSION: &str = "x-app-version";
pub const HEADER_LOGGER_CLIENT: &str = "x-logger-client";

/// Shared slot holding the bearer token. The host writes it whenever the
/// user signs in or out; the transport reads it at send time.
#[derive(Debug, Clone, Default)]
pub struct AuthTokenSlot {
    token: Arc<RwLock<Option<String>>>,
}

impl AuthTokenSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, token: Option<String>) {
        *self.token.write() = token.filter(|token| !token.trim().is_empty());
    }

    pub fn get(&self) -> Option<String> {
        self.token.read().clone()
    }
}

#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub endpoint: String,
    pub timeout: Duration,
    pub app_name: String,
    pub app_version: String,
}

impl HttpTransportConfig {
    pub fn from_pipeline(config: &PipelineConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            timeout: config.timeout(),
            app_name: config.app_name.clone(),
            app_version: config.app_version.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    config: HttpTransportConfig,
    auth: AuthTokenSlot,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .build()
            .context("failed to build ingest http client")?;
        Ok(Self {
            client,
            config,
            auth: AuthTokenSlot::new(),
        })
    }

    /// Share an existing token slot instead of the transport's own.
    pub fn with_auth(mut self, auth: AuthTokenSlot) -> Self {
        self.auth = auth;
        self
    }

    pub fn auth(&self) -> &AuthTokenSlot {
        &self.auth
    }

    pub fn config(&self) -> &HttpTransportConfig {
        &self.config
    }

    fn request(&self, body: Vec<u8>) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .post(&self.config.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .header(HEADER_APP_NAME, &self.config.app_name)
            .header(HEADER_APP_VERSION, &self.config.app_version)
            .header(HEADER_LOGGER_CLIENT, LOGGER_CLIENT)
            .body(body);
        if let Some(token) = self.auth.get() {
            request = request.bearer_auth(token);
        }
        request
    }
}

fn encode(batch: &[Event]) -> Result<Vec<u8>, TransportError> {
    serde_json::to_vec(batch).map_err(|error| TransportError::Encode(error.to_string()))
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip_all, fields(batch_len = batch.len(), endpoint = %self.config.endpoint))]
    async fn send(&self, batch: &[Event]) -> Result<(), TransportError> {
        let body = encode(batch)?;
        let pending = self.request(body).send();

        // Dropping the request future at the deadline aborts the connection.
        let response = match tokio::time::timeout(self.config.timeout, pending).await {
            Err(_) => {
                warn!(timeout_ms = self.config.timeout.as_millis() as u64, "ingest request timed out");
                return Err(TransportError::Timeout(self.config.timeout));
            }
            Ok(Err(error)) => {
                warn!(%error, "ingest request failed");
                return Err(TransportError::Network(error.to_string()));
            }
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        if status.is_success() {
            debug!(status = status.as_u16(), "batch delivered");
            Ok(())
        } else {
            warn!(status = status.as_u16(), "ingest rejected batch");
            Err(TransportError::Http {
                status: status.as_u16(),
            })
        }
    }

    fn send_beacon(&self, batch: &[Event]) -> bool {
        let Ok(handle) = Handle::try_current() else {
            debug!("no runtime available for beacon handoff");
            return false;
        };
        let body = match encode(batch) {
            Ok(body) => body,
            Err(error) => {
                warn!(%error, "beacon handoff rejected");
                return false;
            }
        };
        if body.len() > BEACON_BODY_LIMIT {
            warn!(
                body_len = body.len(),
                limit = BEACON_BODY_LIMIT,
                "beacon body over limit"
            );
            return false;
        }

        let request = self.request(body).timeout(self.config.timeout);
        let batch_len = batch.len();
        handle.spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(batch_len, "beacon delivered");
                }
                Ok(response) => {
                    warn!(batch_len, status = response.status().as_u16(), "beacon rejected");
                }
                Err(error) => warn!(batch_len, %error, "beacon failed"),
            }
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use beacon_protocol::{
        AnonymousId, DeviceSnapshot, EVENT_VERSION, EventCategory, EventId, NetworkSnapshot,
        SessionId,
    };
    use parking_lot::Mutex;
    use serde_json::{Map, Value, json};

    #[derive(Clone)]
    struct Ingest {
        status: StatusCode,
        delay: Duration,
        seen: Arc<Mutex<Vec<(HeaderMap, String)>>>,
    }

    impl Ingest {
        fn answering(status: StatusCode) -> Self {
            Self {
                status,
                delay: Duration::ZERO,
                seen: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    async fn record(State(ingest): State<Ingest>, headers: HeaderMap, body: String) -> StatusCode {
        ingest.seen.lock().push((headers, body));
        if !ingest.delay.is_zero() {
            tokio::time::sleep(ingest.delay).await;
        }
        ingest.status
    }

    async fn serve(ingest: Ingest) -> anyhow::Result<String> {
        let router = Router::new()
            .route("/api/logs/ingest", post(record))
            .with_state(ingest);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        Ok(format!("http://{addr}/api/logs/ingest"))
    }

    fn transport(endpoint: String, timeout: Duration) -> anyhow::Result<HttpTransport> {
        HttpTransport::new(HttpTransportConfig {
            endpoint,
            timeout,
            app_name: "beacon-test".to_owned(),
            app_version: "9.9.9".to_owned(),
        })
    }

    fn event(id: &str) -> Event {
        Event {
            event_id: EventId::from_string(id),
            event_version: EVENT_VERSION,
            event_type: "TEST".to_owned(),
            category: EventCategory::System,
            action: "log".to_owned(),
            description: None,
            session_id: SessionId::from_string("sess_test"),
            anonymous_id: AnonymousId::from_string("anon_test"),
            user_id: None,
            timestamp_client: chrono::Utc::now(),
            device: DeviceSnapshot::default(),
            network: NetworkSnapshot::default(),
            retry_count: 0,
            payload: Map::new(),
        }
    }

    #[tokio::test]
    async fn success_status_delivers_json_array() -> anyhow::Result<()> {
        let ingest = Ingest::answering(StatusCode::OK);
        let endpoint = serve(ingest.clone()).await?;
        let transport = transport(endpoint, Duration::from_secs(5))?;

        transport.send(&[event("ev-1"), event("ev-2")]).await?;

        let seen = ingest.seen.lock();
        assert_eq!(seen.len(), 1);
        let (headers, body) = &seen[0];
        assert_eq!(headers["content-type"], "application/json");
        assert_eq!(headers[HEADER_APP_NAME], "beacon-test");
        assert_eq!(headers[HEADER_APP_VERSION], "9.9.9");
        assert_eq!(headers[HEADER_LOGGER_CLIENT], LOGGER_CLIENT);
        assert!(headers.get("authorization").is_none());

        let parsed: Value = serde_json::from_str(body)?;
        let ids: Vec<&str> = parsed
            .as_array()
            .map(|events| events.iter().filter_map(|e| e["event_id"].as_str()).collect())
            .unwrap_or_default();
        assert_eq!(ids, vec!["ev-1", "ev-2"]);
        Ok(())
    }

    #[tokio::test]
    async fn server_error_is_an_http_failure() -> anyhow::Result<()> {
        let endpoint = serve(Ingest::answering(StatusCode::INTERNAL_SERVER_ERROR)).await?;
        let transport = transport(endpoint, Duration::from_secs(5))?;

        let error = transport.send(&[event("ev-1")]).await.unwrap_err();
        assert_eq!(error, TransportError::Http { status: 500 });
        Ok(())
    }

    #[tokio::test]
    async fn redirect_status_is_not_success() -> anyhow::Result<()> {
        let endpoint = serve(Ingest::answering(StatusCode::NOT_MODIFIED)).await?;
        let transport = transport(endpoint, Duration::from_secs(5))?;

        let error = transport.send(&[event("ev-1")]).await.unwrap_err();
        assert_eq!(error.kind(), "http");
        Ok(())
    }

    #[tokio::test]
    async fn slow_server_times_out() -> anyhow::Result<()> {
        let mut ingest = Ingest::answering(StatusCode::OK);
        ingest.delay = Duration::from_secs(3);
        let endpoint = serve(ingest).await?;
        let transport = transport(endpoint, Duration::from_millis(100))?;

        let error = transport.send(&[event("ev-1")]).await.unwrap_err();
        assert_eq!(error, TransportError::Timeout(Duration::from_millis(100)));
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_network_failure() -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        drop(listener);
        let transport = transport(format!("http://{addr}/ingest"), Duration::from_secs(5))?;

        let error = transport.send(&[event("ev-1")]).await.unwrap_err();
        assert_eq!(error.kind(), "network");
        Ok(())
    }

    #[tokio::test]
    async fn bearer_token_is_read_at_send_time() -> anyhow::Result<()> {
        let ingest = Ingest::answering(StatusCode::ACCEPTED);
        let endpoint = serve(ingest.clone()).await?;
        let auth = AuthTokenSlot::new();
        let transport = transport(endpoint, Duration::from_secs(5))?.with_auth(auth.clone());

        auth.set(Some("token-123".to_owned()));
        transport.send(&[event("ev-1")]).await?;

        let seen = ingest.seen.lock();
        assert_eq!(seen[0].0["authorization"], "Bearer token-123");
        Ok(())
    }

    #[tokio::test]
    async fn beacon_is_handed_off_and_delivered() -> anyhow::Result<()> {
        let ingest = Ingest::answering(StatusCode::OK);
        let endpoint = serve(ingest.clone()).await?;
        let transport = transport(endpoint, Duration::from_secs(5))?;

        assert!(transport.send_beacon(&[event("ev-1")]));

        for _ in 0..100 {
            if !ingest.seen.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(ingest.seen.lock().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn oversized_beacon_is_rejected() -> anyhow::Result<()> {
        let transport = transport("http://127.0.0.1:9/ingest".to_owned(), Duration::from_secs(1))?;
        let mut big = event("ev-big");
        big.payload
            .insert("blob".to_owned(), json!("x".repeat(BEACON_BODY_LIMIT + 1)));

        assert!(!transport.send_beacon(&[big]));
        Ok(())
    }

    #[test]
    fn beacon_without_runtime_is_rejected() -> anyhow::Result<()> {
        let transport = transport("http://127.0.0.1:9/ingest".to_owned(), Duration::from_secs(1))?;
        assert!(!transport.send_beacon(&[event("ev-1")]));
        Ok(())
    }

    #[test]
    fn blank_tokens_clear_the_slot() {
        let auth = AuthTokenSlot::new();
        auth.set(Some("abc".to_owned()));
        assert_eq!(auth.get().as_deref(), Some("abc"));
        auth.set(Some("  ".to_owned()));
        assert_eq!(auth.get(), None);
    }
}
