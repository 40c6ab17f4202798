//! HTTP transport
//!
//! One-shot HTTP/1.1 exchanges over hyper, with rustls for `https` URLs.
//! The backend sees a handful of requests per tunnel configuration, so
//! every request opens its own connection.

use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Bytes;
use hyper::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HOST, HeaderMap, USER_AGENT};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};
use url::Url;

/// HTTP transport errors
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Body read error: {0}")]
    Body(String),
}

/// HTTP transport configuration
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Timeout for the whole exchange, connect included
    pub timeout: Duration,
    pub user_agent: String,
    /// Responses larger than this fail with [`HttpError::Body`]
    pub max_body_size: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: concat!("egress/", env!("CARGO_PKG_VERSION")).to_string(),
            max_body_size: 4 * 1024 * 1024,
        }
    }
}

/// HTTP response
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

pub struct HttpClient {
    config: HttpClientConfig,
    tls: TlsConnector,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> Self {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let tls_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        debug!("HTTP client initialized (timeout: {:?})", config.timeout);

        Self {
            config,
            tls: TlsConnector::from(Arc::new(tls_config)),
        }
    }

    pub fn get<'a>(&'a self, url: &'a Url, bearer: Option<&'a str>) -> RequestBuilder<'a> {
        RequestBuilder::new(self, Method::GET, url, bearer)
    }

    pub fn post<'a>(&'a self, url: &'a Url, bearer: Option<&'a str>) -> RequestBuilder<'a> {
        RequestBuilder::new(self, Method::POST, url, bearer)
    }

    async fn execute(
        &self,
        method: Method,
        url: &Url,
        bearer: Option<&str>,
        body: Option<Vec<u8>>,
    ) -> Result<Response, HttpError> {
        let timeout = self.config.timeout;
        tokio::time::timeout(timeout, self.exchange(method, url, bearer, body))
            .await
            .map_err(|_| HttpError::Timeout(timeout))?
    }

    async fn exchange(
        &self,
        method: Method,
        url: &Url,
        bearer: Option<&str>,
        body: Option<Vec<u8>>,
    ) -> Result<Response, HttpError> {
        let start = Instant::now();

        let host = url
            .host_str()
            .ok_or_else(|| HttpError::InvalidUrl("No host in URL".to_string()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| HttpError::InvalidUrl(format!("No port for scheme {}", url.scheme())))?;
        let authority = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        let target = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };

        let mut builder = Request::builder()
            .method(method.clone())
            .uri(target)
            .header(HOST, authority)
            .header(USER_AGENT, &self.config.user_agent)
            .header(ACCEPT, "application/json");
        if let Some(token) = bearer {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        if body.is_some() {
            builder = builder.header(CONTENT_TYPE, "application/json");
        }
        let request = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| HttpError::Http(e.to_string()))?;

        // IPv6 literals come back bracketed from host_str
        let connect_host = host.trim_start_matches('[').trim_end_matches(']');
        let stream = TcpStream::connect((connect_host, port))
            .await
            .map_err(|e| HttpError::ConnectionFailed(e.to_string()))?;

        let response = match url.scheme() {
            "https" => {
                let server_name = ServerName::try_from(connect_host.to_string())
                    .map_err(|_| HttpError::Tls("Invalid server name".to_string()))?;
                let tls_stream = self
                    .tls
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| HttpError::Tls(e.to_string()))?;
                send(tls_stream, request).await?
            }
            "http" => send(stream, request).await?,
            scheme => return Err(HttpError::InvalidUrl(format!("Unsupported scheme {}", scheme))),
        };

        let status = response.status();
        let headers = response.headers().clone();
        let body = Limited::new(response.into_body(), self.config.max_body_size)
            .collect()
            .await
            .map_err(|e| HttpError::Body(e.to_string()))?
            .to_bytes();

        debug!(
            "HTTP {} {} -> {} ({} bytes, {:?})",
            method,
            url,
            status,
            body.len(),
            start.elapsed()
        );

        Ok(Response { status, headers, body })
    }
}

async fn send<S>(
    stream: S,
    request: Request<Full<Bytes>>,
) -> Result<hyper::Response<hyper::body::Incoming>, HttpError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| HttpError::Http(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            warn!("Connection error: {}", e);
        }
    });

    sender
        .send_request(request)
        .await
        .map_err(|e| HttpError::Http(e.to_string()))
}

/// A request waiting for an optional body
pub struct RequestBuilder<'a> {
    client: &'a HttpClient,
    method: Method,
    url: &'a Url,
    bearer: Option<&'a str>,
    body: Option<Vec<u8>>,
}

impl<'a> RequestBuilder<'a> {
    fn new(client: &'a HttpClient, method: Method, url: &'a Url, bearer: Option<&'a str>) -> Self {
        Self {
            client,
            method,
            url,
            bearer,
            body: None,
        }
    }

    pub fn json_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    pub async fn send(self) -> Result<Response, HttpError> {
        self.client
            .execute(self.method, self.url, self.bearer, self.body)
            .await
    }
}
