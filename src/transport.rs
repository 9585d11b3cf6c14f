//! Outbound delivery of telemetry records.
//!
//! The simulator is generic over [`Transport`]. The binaries pick a concrete
//! backend at startup through [`Backend`], which dispatches by enum so the
//! async trait never needs to be object-safe.

use crate::config::{TransportConfig, DEFAULT_HEALTH_PATH};
use crate::telemetry::TelemetryRecord;
use std::io::Write;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const USER_AGENT: &str = concat!("fleetsim/", env!("CARGO_PKG_VERSION"));
const MAX_ERROR_BODY_CHARS: usize = 256;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to set up {backend} transport: {reason}")]
    Setup { backend: &'static str, reason: String },
    #[error("request failed: {0}")]
    Request(String),
    #[error("receiver rejected record with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("queue publish failed: {0}")]
    Queue(String),
    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("output error: {0}")]
    Io(#[from] std::io::Error),
}

/// Receipt for a delivered record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub backend: &'static str,
    /// HTTP status, when the backend has one.
    pub status: Option<u16>,
}

#[allow(async_fn_in_trait)]
pub trait Transport {
    fn name(&self) -> &'static str;

    async fn publish(&mut self, record: &TelemetryRecord) -> Result<Ack, TransportError>;
}

fn join_url(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// POSTs each record as JSON to the ingest endpoint.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    health_url: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, path: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| TransportError::Setup {
                backend: "http",
                reason: e.to_string(),
            })?;

        Ok(Self {
            client,
            endpoint: join_url(base_url, path),
            health_url: join_url(base_url, DEFAULT_HEALTH_PATH),
        })
    }

    /// Probe a different health route on the same receiver.
    pub fn with_health_path(mut self, base_url: &str, health_path: &str) -> Self {
        self.health_url = join_url(base_url, health_path);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn health_url(&self) -> &str {
        &self.health_url
    }

    /// GET the receiver's health route; any 2xx counts as healthy.
    pub async fn health_check(&self) -> Result<u16, TransportError> {
        let response = self
            .client
            .get(&self.health_url)
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }
        debug!(url = %self.health_url, status = status.as_u16(), "receiver healthy");
        Ok(status.as_u16())
    }
}

impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn publish(&mut self, record: &TelemetryRecord) -> Result<Ack, TransportError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(record)
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read error body".to_owned());
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }

        Ok(Ack {
            backend: self.name(),
            status: Some(status.as_u16()),
        })
    }
}

/// Publishes each record on a NATS subject.
pub struct NatsTransport {
    client: async_nats::Client,
    subject: String,
}

impl NatsTransport {
    pub async fn connect(url: &str, subject: &str) -> Result<Self, TransportError> {
        info!(url, subject, "connecting to NATS server");
        let client = async_nats::connect(url)
            .await
            .map_err(|e| TransportError::Setup {
                backend: "nats",
                reason: format!("failed to connect to {url}: {e}"),
            })?;
        Ok(Self {
            client,
            subject: subject.to_string(),
        })
    }
}

impl Transport for NatsTransport {
    fn name(&self) -> &'static str {
        "nats"
    }

    async fn publish(&mut self, record: &TelemetryRecord) -> Result<Ack, TransportError> {
        let payload = serde_json::to_vec(record)?;
        self.client
            .publish(self.subject.clone(), payload.into())
            .await
            .map_err(|e| TransportError::Queue(e.to_string()))?;

        Ok(Ack {
            backend: self.name(),
            status: None,
        })
    }
}

/// Writes one JSON record per line to stdout.
#[derive(Debug, Default)]
pub struct StdoutTransport;

impl Transport for StdoutTransport {
    fn name(&self) -> &'static str {
        "stdout"
    }

    async fn publish(&mut self, record: &TelemetryRecord) -> Result<Ack, TransportError> {
        let line = record.to_json()?;
        let mut out = std::io::stdout().lock();
        writeln!(out, "{line}")?;
        Ok(Ack {
            backend: self.name(),
            status: None,
        })
    }
}

/// Backend chosen from configuration.
pub enum Backend {
    Http(HttpTransport),
    Nats(NatsTransport),
    Stdout(StdoutTransport),
}

impl Backend {
    pub async fn from_config(config: &TransportConfig) -> Result<Self, TransportError> {
        let backend = match config {
            TransportConfig::Http {
                base_url,
                path,
                health_path,
                timeout,
            } => {
                let http = HttpTransport::new(base_url, path, *timeout)?.with_health_path(base_url, health_path);
                debug!(endpoint = http.endpoint(), health = http.health_url(), "http transport ready");
                Backend::Http(http)
            }
            TransportConfig::Nats { url, subject } => {
                Backend::Nats(NatsTransport::connect(url, subject).await?)
            }
            TransportConfig::Stdout => Backend::Stdout(StdoutTransport),
        };
        Ok(backend)
    }

    /// Check the receiver is reachable. Only HTTP has a health route; the
    /// other backends are already connected once built.
    pub async fn health_check(&self) -> Result<(), TransportError> {
        match self {
            Backend::Http(t) => t.health_check().await.map(|_| ()),
            Backend::Nats(_) | Backend::Stdout(_) => Ok(()),
        }
    }
}

impl Transport for Backend {
    fn name(&self) -> &'static str {
        match self {
            Backend::Http(t) => t.name(),
            Backend::Nats(t) => t.name(),
            Backend::Stdout(t) => t.name(),
        }
    }

    async fn publish(&mut self, record: &TelemetryRecord) -> Result<Ack, TransportError> {
        match self {
            Backend::Http(t) => t.publish(record).await,
            Backend::Nats(t) => t.publish(record).await,
            Backend::Stdout(t) => t.publish(record).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Consume the request head and any body announced by content-length.
    async fn read_request(socket: &mut tokio::net::TcpStream) {
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = match socket.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            request.extend_from_slice(&buf[..n]);

            let text = String::from_utf8_lossy(&request);
            let Some(head_end) = text.find("\r\n\r\n") else {
                continue;
            };
            let body_len = text[..head_end]
                .lines()
                .filter_map(|line| line.split_once(':'))
                .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
                .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if request.len() >= head_end + 4 + body_len {
                return;
            }
        }
    }

    /// Answer every connection with the same canned HTTP response.
    async fn canned_receiver(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                read_request(&mut socket).await;
                let body = "{\"status\":\"UP\"}";
                let response = format!(
                    "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}")
    }

    /// A localhost URL whose port had a listener a moment ago and no longer does.
    fn closed_port_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("http://127.0.0.1:{port}")
    }

    fn record() -> TelemetryRecord {
        use crate::specs::VehicleSpec;
        use crate::state::Location;
        use crate::telemetry::TelemetryEmitter;
        use rand::SeedableRng;

        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        TelemetryEmitter::new().emit(
            "TRUCK-001",
            chrono::Utc::now(),
            VehicleSpec::synthesize(&mut rng),
            Default::default(),
            false,
            Location::new(60.0, 15.0),
        )
    }

    #[test]
    fn test_endpoint_joining() {
        let timeout = Duration::from_secs(1);
        let a = HttpTransport::new("http://localhost:8081/", "/api/telemetry/ingest", timeout).unwrap();
        let b = HttpTransport::new("http://localhost:8081", "api/telemetry/ingest", timeout).unwrap();
        assert_eq!(a.endpoint(), "http://localhost:8081/api/telemetry/ingest");
        assert_eq!(a.endpoint(), b.endpoint());
        assert_eq!(a.health_url(), "http://localhost:8081/actuator/health");

        let c = b.with_health_path("http://localhost:8081/", "healthz");
        assert_eq!(c.health_url(), "http://localhost:8081/healthz");
    }

    #[tokio::test]
    async fn test_backend_from_config() {
        let backend = Backend::from_config(&TransportConfig::Stdout).await.unwrap();
        assert_eq!(backend.name(), "stdout");
        assert!(backend.health_check().await.is_ok());

        let backend = Backend::from_config(&TransportConfig::default()).await.unwrap();
        assert_eq!(backend.name(), "http");
    }

    #[tokio::test]
    async fn test_unreachable_receiver_is_request_error() {
        let mut http = HttpTransport::new(&closed_port_url(), "/ingest", Duration::from_millis(500)).unwrap();
        let result = http.publish(&record()).await;
        assert!(matches!(result, Err(TransportError::Request(_))));
        assert!(matches!(http.health_check().await, Err(TransportError::Request(_))));
    }

    #[tokio::test]
    async fn test_health_check_against_live_receiver() {
        let base_url = canned_receiver("200 OK").await;
        let http = HttpTransport::new(&base_url, "/ingest", Duration::from_secs(2)).unwrap();
        assert_eq!(http.health_check().await.unwrap(), 200);

        let mut http = http;
        let ack = http.publish(&record()).await.unwrap();
        assert_eq!(ack.status, Some(200));
    }

    #[tokio::test]
    async fn test_unhealthy_receiver_is_rejected() {
        let base_url = canned_receiver("503 Service Unavailable").await;
        let config = TransportConfig::Http {
            base_url,
            path: "/ingest".to_string(),
            health_path: "/status".to_string(),
            timeout: Duration::from_secs(2),
        };
        let backend = Backend::from_config(&config).await.unwrap();
        let err = backend.health_check().await.unwrap_err();
        assert!(matches!(err, TransportError::Rejected { status: 503, .. }), "{err}");
    }
}
