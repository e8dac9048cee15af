//! Request-oriented HTTP/1.1 client
//!
//! One connection per request: connect (optionally through a proxy
//! tunnel), upgrade to TLS for https, write the request, then feed socket
//! reads through [`ResponseDecoder`] until a response or redirect falls
//! out. Redirects are re-issued against the resolved URI.

use bytes::BytesMut;
use tracing::debug;
use url::Url;

use crate::common::{Endpoint, Error, Result};
use crate::http::{HttpResponse, HttpResult, ResponseDecoder};
use crate::proxy::ProxyTunnel;
use crate::socket::{SocketClient, SocketConfig};
use crate::tls::{RustlsEngine, TlsOptions};

const MAX_REDIRECTS: usize = 5;

#[derive(Debug, Clone, Default)]
pub struct HttpClient {
    tunnel: ProxyTunnel,
    config: SocketConfig,
    allow_insecure: bool,
}

impl HttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tunnel(mut self, tunnel: ProxyTunnel) -> Self {
        self.tunnel = tunnel;
        self
    }

    pub fn with_config(mut self, config: SocketConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_insecure_tls(mut self, allow: bool) -> Self {
        self.allow_insecure = allow;
        self
    }

    pub async fn get(&self, uri: &str) -> Result<HttpResponse> {
        self.request("GET", uri, None).await
    }

    pub async fn get_string(&self, uri: &str) -> Result<String> {
        let response = self.get(uri).await?;
        Ok(String::from_utf8_lossy(&response.body).into_owned())
    }

    pub async fn post(&self, uri: &str, body: &[u8]) -> Result<HttpResponse> {
        self.request("POST", uri, Some(body)).await
    }

    async fn request(&self, method: &str, uri: &str, body: Option<&[u8]>) -> Result<HttpResponse> {
        let mut url = Url::parse(uri)
            .map_err(|e| Error::InvalidAddress(format!("invalid request URI {uri}: {e}")))?;
        for _ in 0..=MAX_REDIRECTS {
            match self.roundtrip(method, &url, body).await? {
                HttpResult::Response(response) => return Ok(response),
                HttpResult::Redirect(next) => {
                    debug!(from = %url, to = %next, "following redirect");
                    url = next;
                }
            }
        }
        Err(Error::HttpDecode(format!("redirect limit reached for {uri}")))
    }

    async fn roundtrip(&self, method: &str, url: &Url, body: Option<&[u8]>) -> Result<HttpResult> {
        let secure = match url.scheme() {
            "http" | "ws" => false,
            "https" | "wss" => true,
            other => {
                return Err(Error::InvalidAddress(format!(
                    "unsupported scheme: {other}"
                )))
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidAddress(format!("URI without a host: {url}")))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::InvalidAddress(format!("URI without a port: {url}")))?;

        let mut socket = SocketClient::connect(
            Endpoint::new(host.clone(), port),
            self.tunnel.clone(),
            self.config.clone(),
        )
        .await?;
        if secure {
            let options = TlsOptions {
                alpn: vec!["http/1.1".into()],
                allow_insecure: self.allow_insecure,
            };
            let engine = RustlsEngine::client(&host, &options)?;
            socket.upgrade_to_tls(engine).await?;
        }

        socket.write(&build_request(method, url, body)).await?;

        let mut decoder = ResponseDecoder::new().with_base(url.clone());
        let mut buf = BytesMut::new();
        let mut chunk = vec![0u8; socket.receive_buffer_size()];
        let outcome = loop {
            match decoder.decode(&mut buf) {
                Err(e) => break Err(e),
                Ok(Some(result)) => break Ok(result),
                Ok(None) => {}
            }
            match socket.read(&mut chunk).await {
                Err(e) => break Err(e),
                Ok(0) => {
                    break Err(Error::HttpDecode(
                        "connection closed before the response completed".into(),
                    ))
                }
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        };
        socket.close().await;
        outcome
    }
}

fn build_request(method: &str, url: &Url, body: Option<&[u8]>) -> Vec<u8> {
    let mut target = url.path().to_string();
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }

    // Mirror the URI: the port appears in Host only when given explicitly
    let host_header = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => String::new(),
    };

    let mut request = format!("{method} {target} HTTP/1.1\r\nHost: {host_header}\r\n");
    if let Some(body) = body {
        request.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    request.push_str("\r\n");

    let mut bytes = request.into_bytes();
    if let Some(body) = body {
        bytes.extend_from_slice(body);
    }
    bytes
}
