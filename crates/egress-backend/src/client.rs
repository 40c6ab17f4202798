//! Backend client
//!
//! [`NetworkClient`] speaking the controller's JSON API:
//!
//! | call | request | response |
//! |------|---------|----------|
//! | servers | `GET {endpoint}/servers` | `[Server]` |
//! | register | `POST {endpoint}/register` `{"publicKey", "server"}` | `[Server]` |
//!
//! Both calls carry the auth token as a bearer token.

use crate::http::{HttpClient, HttpClientConfig, HttpError, Response};
use async_trait::async_trait;
use egress_device::{ClientError, NetworkClient, PublicKey, Server, ServerInfo};
use hyper::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_ENDPOINT: &str = "https://controller.netp.duckduckgo.com";

/// Backend connection settings
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL every API path is appended to
    pub endpoint: String,
    pub auth_token: Option<String>,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        let http = HttpClientConfig::default();
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            auth_token: None,
            timeout_secs: http.timeout.as_secs(),
            user_agent: http.user_agent,
        }
    }
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConfig")
            .field("endpoint", &self.endpoint)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .field("timeout_secs", &self.timeout_secs)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterKeyRequest<'a> {
    public_key: String,
    server: &'a str,
}

pub struct BackendClient {
    http: HttpClient,
    servers_url: Url,
    register_url: Url,
    auth_token: Option<String>,
}

impl BackendClient {
    pub fn new(config: BackendConfig) -> Result<Self, HttpError> {
        let base = Url::parse(&config.endpoint)
            .map_err(|e| HttpError::InvalidUrl(format!("{}: {}", config.endpoint, e)))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(HttpError::InvalidUrl(format!(
                "Unsupported scheme {}",
                base.scheme()
            )));
        }

        let servers_url = endpoint(&base, "servers")?;
        let register_url = endpoint(&base, "register")?;

        let http = HttpClient::new(HttpClientConfig {
            timeout: Duration::from_secs(config.timeout_secs),
            user_agent: config.user_agent,
            ..HttpClientConfig::default()
        });

        info!("Backend client for {}", base);

        Ok(Self {
            http,
            servers_url,
            register_url,
            auth_token: config.auth_token,
        })
    }

    fn bearer(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }
}

/// `base` with `path` appended as a final segment
fn endpoint(base: &Url, path: &str) -> Result<Url, HttpError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| HttpError::InvalidUrl(format!("{} cannot be a base", base)))?
        .pop_if_empty()
        .push(path);
    Ok(url)
}

fn is_auth_failure(response: &Response) -> bool {
    matches!(
        response.status,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
    )
}

fn status_detail(response: &Response) -> String {
    format!("HTTP {}", response.status)
}

#[async_trait]
impl NetworkClient for BackendClient {
    async fn get_servers(&self) -> Result<Vec<Server>, ClientError> {
        let response = self
            .http
            .get(&self.servers_url, self.bearer())
            .send()
            .await
            .map_err(|e| ClientError::FailedToFetchServerList(Some(e.to_string())))?;

        if is_auth_failure(&response) {
            warn!("Server list request rejected ({})", response.status);
            return Err(ClientError::InvalidAuthToken);
        }
        if !response.is_success() {
            return Err(ClientError::FailedToFetchServerList(Some(status_detail(&response))));
        }

        let servers: Vec<Server> = serde_json::from_slice(&response.body)
            .map_err(|e| ClientError::FailedToParseServerListResponse(e.to_string()))?;

        debug!("Fetched {} servers", servers.len());
        Ok(servers)
    }

    async fn register(
        &self,
        public_key: &PublicKey,
        server: &ServerInfo,
    ) -> Result<Vec<Server>, ClientError> {
        let request = RegisterKeyRequest {
            public_key: public_key.to_base64(),
            server: &server.name,
        };
        let body =
            serde_json::to_vec(&request).map_err(|_| ClientError::FailedToEncodeRegisterKeyRequest)?;

        let response = self
            .http
            .post(&self.register_url, self.bearer())
            .json_body(body)
            .send()
            .await
            .map_err(|e| ClientError::FailedToFetchRegisteredServers(Some(e.to_string())))?;

        if is_auth_failure(&response) {
            warn!("Registration with {} rejected ({})", server.name, response.status);
            return Err(ClientError::InvalidAuthToken);
        }
        if !response.is_success() {
            return Err(ClientError::FailedToFetchRegisteredServers(Some(status_detail(
                &response,
            ))));
        }

        let servers: Vec<Server> = serde_json::from_slice(&response.body)
            .map_err(|e| ClientError::FailedToParseRegisteredServersResponse(e.to_string()))?;

        info!("Registered {:?} with {}", public_key, server.name);
        Ok(servers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use egress_device::PrivateKey;
    use http_body_util::{BodyExt, Full};
    use hyper::body::{Bytes, Incoming};
    use hyper::header::AUTHORIZATION;
    use hyper::service::service_fn;
    use hyper::{Method, Request};
    use hyper_util::rt::TokioIo;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    const SERVERS: &str = r#"[
        {
            "registeredPublicKeys": [],
            "allowedIPs": ["10.64.169.158/32"],
            "server": {
                "name": "egress.usw.1",
                "internalIp": "10.11.12.1",
                "publicKey": "ovn9RpzUuvQ4XLQt6B3RKuEXGIxa5QpTnehjduZlcSE=",
                "hostnames": ["usw1.egress.example.net"],
                "ips": ["162.245.204.100"],
                "port": 443,
                "attributes": {
                    "city": "Los Angeles",
                    "country": "us",
                    "state": "ca",
                    "timezoneOffset": -28800
                }
            },
            "expiresAt": "2030-01-01T00:00:00Z"
        }
    ]"#;

    #[derive(Debug, Clone)]
    struct Recorded {
        method: Method,
        path: String,
        authorization: Option<String>,
        body: Vec<u8>,
    }

    /// Serve canned responses on an ephemeral local port
    async fn serve(
        status: StatusCode,
        response_body: &'static str,
    ) -> (String, Arc<Mutex<Vec<Recorded>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let recorded = Arc::new(Mutex::new(Vec::new()));

        let log = recorded.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let log = log.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |request: Request<Incoming>| {
                        let log = log.clone();
                        async move {
                            let method = request.method().clone();
                            let path = request.uri().path().to_string();
                            let authorization = request
                                .headers()
                                .get(AUTHORIZATION)
                                .and_then(|v| v.to_str().ok())
                                .map(str::to_string);
                            let body = request.into_body().collect().await?.to_bytes().to_vec();
                            log.lock().unwrap().push(Recorded {
                                method,
                                path,
                                authorization,
                                body,
                            });

                            let response = hyper::Response::builder()
                                .status(status)
                                .body(Full::new(Bytes::from_static(response_body.as_bytes())))
                                .unwrap();
                            Ok::<_, hyper::Error>(response)
                        }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        (format!("http://{}", addr), recorded)
    }

    fn client(endpoint: String) -> BackendClient {
        BackendClient::new(BackendConfig {
            endpoint,
            auth_token: Some("secret-token".to_string()),
            timeout_secs: 5,
            ..BackendConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_endpoint_paths() {
        let base = Url::parse("https://controller.example.net").unwrap();
        assert_eq!(
            endpoint(&base, "servers").unwrap().as_str(),
            "https://controller.example.net/servers"
        );

        let base = Url::parse("https://controller.example.net/api/v1/").unwrap();
        assert_eq!(
            endpoint(&base, "register").unwrap().as_str(),
            "https://controller.example.net/api/v1/register"
        );
    }

    #[test]
    fn test_rejects_bad_endpoint() {
        let config = BackendConfig {
            endpoint: "ftp://controller.example.net".to_string(),
            ..BackendConfig::default()
        };
        assert!(matches!(BackendClient::new(config), Err(HttpError::InvalidUrl(_))));

        let config = BackendConfig {
            endpoint: "not a url".to_string(),
            ..BackendConfig::default()
        };
        assert!(BackendClient::new(config).is_err());
    }

    #[test]
    fn test_debug_redacts_token() {
        let config = BackendConfig {
            auth_token: Some("secret-token".to_string()),
            ..BackendConfig::default()
        };
        let debug = format!("{:?}", config);
        assert!(!debug.contains("secret-token"));
        assert!(debug.contains("REDACTED"));
    }

    #[tokio::test]
    async fn test_get_servers() {
        let (endpoint, recorded) = serve(StatusCode::OK, SERVERS).await;

        let servers = client(endpoint).get_servers().await.unwrap();

        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].name(), "egress.usw.1");
        assert_eq!(servers[0].timezone_offset(), -28800);
        assert_eq!(servers[0].info.server_location(), "Los Angeles, ca, us");

        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded[0].method, Method::GET);
        assert_eq!(recorded[0].path, "/servers");
        assert_eq!(recorded[0].authorization.as_deref(), Some("Bearer secret-token"));
    }

    #[tokio::test]
    async fn test_register() {
        let (endpoint, recorded) = serve(StatusCode::OK, SERVERS).await;
        let key = PrivateKey::generate().public_key();
        let server = serde_json::from_str::<Vec<Server>>(SERVERS).unwrap().remove(0);

        let servers = client(endpoint).register(&key, &server.info).await.unwrap();
        assert_eq!(servers, vec![server]);

        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded[0].method, Method::POST);
        assert_eq!(recorded[0].path, "/register");

        let body: serde_json::Value = serde_json::from_slice(&recorded[0].body).unwrap();
        assert_eq!(body["publicKey"], key.to_base64());
        assert_eq!(body["server"], "egress.usw.1");
    }

    #[tokio::test]
    async fn test_auth_failure() {
        let (endpoint, _) = serve(StatusCode::UNAUTHORIZED, "").await;
        let client = client(endpoint);

        assert_eq!(client.get_servers().await.unwrap_err(), ClientError::InvalidAuthToken);

        let server = serde_json::from_str::<Vec<Server>>(SERVERS).unwrap().remove(0);
        let key = PrivateKey::generate().public_key();
        assert_eq!(
            client.register(&key, &server.info).await.unwrap_err(),
            ClientError::InvalidAuthToken
        );
    }

    #[tokio::test]
    async fn test_server_error() {
        let (endpoint, _) = serve(StatusCode::INTERNAL_SERVER_ERROR, "oops").await;

        let error = client(endpoint).get_servers().await.unwrap_err();
        assert_eq!(
            error,
            ClientError::FailedToFetchServerList(Some("HTTP 500 Internal Server Error".to_string()))
        );
    }

    #[tokio::test]
    async fn test_malformed_response() {
        let (endpoint, _) = serve(StatusCode::OK, "{\"servers\": 1}").await;
        let client = client(endpoint);

        assert!(matches!(
            client.get_servers().await,
            Err(ClientError::FailedToParseServerListResponse(_))
        ));

        let server = serde_json::from_str::<Vec<Server>>(SERVERS).unwrap().remove(0);
        let key = PrivateKey::generate().public_key();
        assert!(matches!(
            client.register(&key, &server.info).await,
            Err(ClientError::FailedToParseRegisteredServersResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let error = client(format!("http://{}", addr)).get_servers().await.unwrap_err();
        assert!(matches!(error, ClientError::FailedToFetchServerList(Some(_))));
    }

    #[tokio::test]
    async fn test_timeout() {
        // Accepts and never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let client = BackendClient {
            http: HttpClient::new(HttpClientConfig {
                timeout: Duration::from_millis(100),
                ..HttpClientConfig::default()
            }),
            ..client(format!("http://{}", addr))
        };

        let error = client.get_servers().await.unwrap_err();
        assert!(matches!(
            error,
            ClientError::FailedToFetchServerList(Some(detail)) if detail.contains("timed out")
        ));
    }
}
