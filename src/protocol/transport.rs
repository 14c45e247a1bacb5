//! Pluggable SOAP/HTTP transport.
//!
//! The connector talks to the wire only through [`SoapTransport`], so tests
//! substitute scripted transports and the production path is a thin
//! `reqwest` wrapper with a shared connection pool (safe for concurrent
//! reuse across workers).

use std::future::Future;
use std::time::Duration;

/// A raw HTTP response as the multipart decoder needs it: status, full
/// Content-Type header and unmodified body bytes.
#[derive(Debug, Clone)]
pub struct WireResponse {
    pub status: u16,
    pub content_type: String,
    pub body: bytes::Bytes,
}

impl WireResponse {
    pub fn is_multipart(&self) -> bool {
        self.content_type
            .to_ascii_lowercase()
            .starts_with("multipart/")
    }
}

/// Low-level transport failure, mapped into the error taxonomy by the
/// connector (which knows the insurer context).
#[derive(Debug, Clone)]
pub struct TransportFailure {
    pub timed_out: bool,
    pub connect_failed: bool,
    pub detail: String,
}

/// Executes one SOAP 1.1 POST. Implemented by [`HttpTransport`] in
/// production and scripted mocks in tests.
pub trait SoapTransport: Send + Sync {
    fn post(
        &self,
        url: &str,
        soap_action: &str,
        envelope: String,
    ) -> impl Future<Output = Result<WireResponse, TransportFailure>> + Send;
}

/// Production transport over a shared `reqwest` client.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a transport with the given per-request timeout.
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build HTTP client: {e}"))?;
        Ok(Self { client })
    }
}

impl SoapTransport for HttpTransport {
    async fn post(
        &self,
        url: &str,
        soap_action: &str,
        envelope: String,
    ) -> Result<WireResponse, TransportFailure> {
        let response = self
            .client
            .post(url)
            .header("Content-Type", "text/xml; charset=utf-8")
            .header("SOAPAction", format!("\"{soap_action}\""))
            .body(envelope)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response.bytes().await.map_err(classify_reqwest_error)?;

        Ok(WireResponse {
            status,
            content_type,
            body,
        })
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> TransportFailure {
    TransportFailure {
        timed_out: err.is_timeout(),
        connect_failed: err.is_connect(),
        detail: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multipart_detection() {
        let resp = WireResponse {
            status: 200,
            content_type: "Multipart/Related; boundary=\"x\"".into(),
            body: bytes::Bytes::new(),
        };
        assert!(resp.is_multipart());

        let xml = WireResponse {
            status: 200,
            content_type: "text/xml; charset=utf-8".into(),
            body: bytes::Bytes::new(),
        };
        assert!(!xml.is_multipart());
    }
}
