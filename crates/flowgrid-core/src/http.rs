//! Minimal JSON-over-HTTP/1.1 client.
//!
//! Opens one TCP connection per request, performs the hyper handshake, and
//! drives the connection in a background task. The whole exchange is
//! bounded by a timeout. Used by the driver and LCM clients; neither needs
//! connection pooling at the call rates involved.

use std::time::Duration;

use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use thiserror::Error;
use tracing::debug;

/// Errors from a single HTTP exchange.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("invalid endpoint {0:?}")]
    Endpoint(String),

    #[error("connection to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },

    #[error("request failed: {0}")]
    Request(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to encode body: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A parsed `http://host:port[/base]` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// `host:port` used for the TCP connection and the Host header.
    pub authority: String,
    /// Path prefix prepended to every request path (no trailing slash).
    pub base_path: String,
}

impl Endpoint {
    pub fn parse(endpoint: &str) -> Result<Self, HttpError> {
        let rest = endpoint
            .strip_prefix("http://")
            .ok_or_else(|| HttpError::Endpoint(endpoint.to_string()))?;
        let (authority, base) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };
        if authority.is_empty() || !authority.contains(':') {
            return Err(HttpError::Endpoint(endpoint.to_string()));
        }
        Ok(Self {
            authority: authority.to_string(),
            base_path: base.trim_end_matches('/').to_string(),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}{}", self.authority, self.base_path, path)
    }
}

/// Response status plus the raw body.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Send one request with an optional JSON body.
pub async fn send_json<B: serde::Serialize>(
    endpoint: &Endpoint,
    method: Method,
    path: &str,
    headers: &[(&str, &str)],
    body: Option<&B>,
    timeout: Duration,
) -> Result<HttpResponse, HttpError> {
    let payload = match body {
        Some(b) => Bytes::from(serde_json::to_vec(b)?),
        None => Bytes::new(),
    };
    let uri = endpoint.url(path);

    let exchange = async {
        let stream = tokio::net::TcpStream::connect(&endpoint.authority)
            .await
            .map_err(|e| HttpError::Connect {
                addr: endpoint.authority.clone(),
                reason: e.to_string(),
            })?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| HttpError::Connect {
                addr: endpoint.authority.clone(),
                reason: e.to_string(),
            })?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = http::Request::builder()
            .method(method)
            .uri(&uri)
            .header("host", endpoint.authority.as_str())
            .header("user-agent", "flowgrid/0.1")
            .header("content-type", "application/json");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let req = builder
            .body(Full::new(payload))
            .map_err(|e| HttpError::Request(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| HttpError::Request(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| HttpError::Request(e.to_string()))?
            .to_bytes();

        debug!(%uri, %status, "http exchange complete");
        Ok(HttpResponse { status, body })
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => {
            debug!(%uri, "http exchange timed out");
            Err(HttpError::Timeout(timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parses_authority_and_base() {
        let ep = Endpoint::parse("http://127.0.0.1:2474/lcm/").unwrap();
        assert_eq!(ep.authority, "127.0.0.1:2474");
        assert_eq!(ep.base_path, "/lcm");
        assert_eq!(ep.url("/v1/x"), "http://127.0.0.1:2474/lcm/v1/x");
    }

    #[test]
    fn endpoint_without_base_path() {
        let ep = Endpoint::parse("http://localhost:2633").unwrap();
        assert_eq!(ep.url("/v1/vms/3"), "http://localhost:2633/v1/vms/3");
    }

    #[test]
    fn endpoint_rejects_other_schemes_and_missing_port() {
        assert!(Endpoint::parse("https://localhost:1").is_err());
        assert!(Endpoint::parse("http://localhost").is_err());
        assert!(Endpoint::parse("tcp://localhost:1").is_err());
    }

    #[tokio::test]
    async fn closed_port_reports_connect_error() {
        let ep = Endpoint::parse("http://127.0.0.1:1").unwrap();
        let result = send_json::<()>(
            &ep,
            Method::GET,
            "/",
            &[],
            None,
            Duration::from_millis(500),
        )
        .await;
        assert!(matches!(
            result,
            Err(HttpError::Connect { .. }) | Err(HttpError::Timeout(_))
        ));
    }
}
