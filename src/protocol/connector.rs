//! Executes the protocol operations against one insurer.
//!
//! The connector owns the insurer's configuration and policy, shapes
//! requests through [`crate::protocol::envelope`], maps wire-level
//! conditions (HTTP status, SOAP faults, transport failures) into the
//! error taxonomy and delegates MTOM decoding to [`crate::mime`].
//!
//! Failure semantics: transport failures are retryable by the caller;
//! faults are terminal for the shipment; security faults on the token path
//! become auth errors.

use crate::config::{InsurerConfig, TOKEN_DEFAULT_LIFETIME};
use crate::error::{FetchError, TransportKind};
use crate::mime::xop::decode_mtom;
use crate::protocol::envelope;
use crate::protocol::messages::{
    self, ShipmentDescriptor, ShipmentFilters, ShipmentPayload,
};
use crate::protocol::policy::{CommitSignal, ConnectorPolicy};
use crate::protocol::transport::{SoapTransport, TransportFailure, WireResponse};
use crate::token::credential::Credential;
use crate::token::store::TokenIssuer;
use crate::token::token::{SecurityToken, TokenKey};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

/// One connector per insurer per run; cheap to share via `Arc` across
/// workers (the transport's connection pool handles concurrent reuse).
pub struct ProtocolConnector<T> {
    transport: Arc<T>,
    config: InsurerConfig,
    policy: ConnectorPolicy,
}

impl<T: SoapTransport> ProtocolConnector<T> {
    pub fn new(transport: Arc<T>, config: InsurerConfig) -> Self {
        let policy = config.connector_policy();
        Self {
            transport,
            config,
            policy,
        }
    }

    pub fn insurer(&self) -> &crate::error::InsurerId {
        &self.config.id
    }

    pub fn policy(&self) -> &ConnectorPolicy {
        &self.policy
    }

    /// Norm 410: request a fresh security token.
    pub async fn request_security_token(
        &self,
        credential: &Credential,
    ) -> Result<SecurityToken, FetchError> {
        let envelope = envelope::security_token_request(
            credential,
            &self.policy,
            self.config.consumer_id.as_deref(),
        );
        let response = self
            .call(
                &self.config.sts_url,
                envelope::SOAP_ACTION_REQUEST_TOKEN,
                envelope,
                None,
            )
            .await
            .map_err(escalate_token_fault)?;

        let (value, expires_at) =
            messages::parse_token_response(&response.body).map_err(|e| FetchError::Auth {
                insurer: self.config.id.clone(),
                detail: format!("undecodable token response: {e}"),
            })?;

        let issued_at = Utc::now();
        let expires_at = expires_at.unwrap_or_else(|| {
            issued_at + chrono::Duration::from_std(TOKEN_DEFAULT_LIFETIME).unwrap_or_default()
        });
        Ok(SecurityToken {
            value,
            issued_at,
            expires_at,
            key: TokenKey::new(self.config.id.clone(), credential.username.clone()),
        })
    }

    /// Norm 430: list shipments currently offered by the insurer.
    pub async fn list_shipments(
        &self,
        token: &SecurityToken,
        filters: &ShipmentFilters,
    ) -> Result<Vec<ShipmentDescriptor>, FetchError> {
        let envelope = envelope::list_shipments_request(token, filters, &self.policy);
        let response = self
            .call(
                &self.config.transfer_url,
                envelope::SOAP_ACTION_LIST_SHIPMENTS,
                envelope,
                None,
            )
            .await?;

        let descriptors =
            messages::parse_list_response(&response.body).map_err(|e| self.malformed(None, e))?;
        info!(
            insurer = %self.config.id,
            shipments = descriptors.len(),
            "shipment list retrieved"
        );
        Ok(descriptors)
    }

    /// Norm 430: retrieve one shipment's binary payload.
    pub async fn get_shipment(
        &self,
        token: &SecurityToken,
        descriptor: &ShipmentDescriptor,
    ) -> Result<ShipmentPayload, FetchError> {
        let envelope = envelope::get_shipment_request(token, &descriptor.id);
        let response = self
            .call(
                &self.config.transfer_url,
                envelope::SOAP_ACTION_GET_SHIPMENT,
                envelope,
                Some(&descriptor.id),
            )
            .await?;

        if !response.is_multipart() {
            return Err(self.malformed(
                Some(&descriptor.id),
                format!(
                    "expected multipart/related, got {}",
                    if response.content_type.is_empty() {
                        "<no content-type>"
                    } else {
                        &response.content_type
                    }
                ),
            ));
        }

        let decoded = decode_mtom(&response.content_type, &response.body)
            .map_err(|e| self.malformed(Some(&descriptor.id), e))?;

        debug!(
            insurer = %self.config.id,
            shipment = %descriptor.id,
            parts = decoded.parts.len(),
            "shipment payload decoded"
        );
        Ok(ShipmentPayload {
            shipment_id: descriptor.id.clone(),
            parts: decoded.parts,
        })
    }

    /// Norm 430: commit a delivered shipment. A no-op for policies whose
    /// gateways have no acknowledge operation.
    pub async fn acknowledge_shipment(
        &self,
        token: &SecurityToken,
        descriptor: &ShipmentDescriptor,
    ) -> Result<(), FetchError> {
        if self.policy.commit == CommitSignal::None {
            debug!(
                insurer = %self.config.id,
                shipment = %descriptor.id,
                "policy has no commit signal, skipping acknowledge"
            );
            return Ok(());
        }

        let envelope = envelope::acknowledge_request(token, &descriptor.id);
        self.call(
            &self.config.transfer_url,
            envelope::SOAP_ACTION_ACKNOWLEDGE,
            envelope,
            Some(&descriptor.id),
        )
        .await?;
        debug!(insurer = %self.config.id, shipment = %descriptor.id, "shipment acknowledged");
        Ok(())
    }

    /// Execute one SOAP call and map the wire-level outcome.
    async fn call(
        &self,
        url: &str,
        action: &str,
        envelope: String,
        shipment: Option<&str>,
    ) -> Result<WireResponse, FetchError> {
        let response = self
            .transport
            .post(url, action, envelope)
            .await
            .map_err(|failure| self.transport_error(failure))?;

        if self.config.is_throttle_status(response.status) {
            return Err(FetchError::Transport {
                insurer: self.config.id.clone(),
                kind: TransportKind::Throttled,
                detail: format!("HTTP {}", response.status),
            });
        }

        if response.status >= 400 {
            // SOAP faults normally ride on HTTP 500.
            if let Some(fault) = messages::extract_fault(&response.body) {
                return Err(FetchError::ProtocolFault {
                    insurer: self.config.id.clone(),
                    shipment: shipment.map(str::to_string),
                    code: fault.code,
                    message: fault.message,
                });
            }
            return Err(FetchError::ProtocolFault {
                insurer: self.config.id.clone(),
                shipment: shipment.map(str::to_string),
                code: format!("HTTP-{}", response.status),
                message: "non-SOAP error response".into(),
            });
        }

        // Some gateways return faults with HTTP 200.
        if !response.is_multipart() {
            if let Some(fault) = messages::extract_fault(&response.body) {
                return Err(FetchError::ProtocolFault {
                    insurer: self.config.id.clone(),
                    shipment: shipment.map(str::to_string),
                    code: fault.code,
                    message: fault.message,
                });
            }
        }

        Ok(response)
    }

    fn transport_error(&self, failure: TransportFailure) -> FetchError {
        let kind = if failure.timed_out {
            TransportKind::Timeout
        } else if failure.connect_failed {
            TransportKind::Connect
        } else {
            TransportKind::Io
        };
        FetchError::Transport {
            insurer: self.config.id.clone(),
            kind,
            detail: failure.detail,
        }
    }

    fn malformed(&self, shipment: Option<&str>, detail: impl ToString) -> FetchError {
        FetchError::MalformedResponse {
            insurer: self.config.id.clone(),
            shipment: shipment.map(str::to_string),
            detail: detail.to_string(),
        }
    }
}

/// On the token path a security-flavoured fault means the STS rejected our
/// credentials; that is an auth failure. Other faults (maintenance windows,
/// server errors) stay as protocol faults for the token store's retry
/// handling to wrap.
fn escalate_token_fault(err: FetchError) -> FetchError {
    match err {
        FetchError::ProtocolFault {
            insurer,
            shipment,
            code,
            message,
        } => {
            if messages::SoapFault::security_flavoured(&code, &message) {
                FetchError::Auth {
                    insurer,
                    detail: format!("[{code}] {message}"),
                }
            } else {
                FetchError::ProtocolFault {
                    insurer,
                    shipment,
                    code,
                    message,
                }
            }
        }
        other => other,
    }
}

impl<T: SoapTransport> TokenIssuer for ProtocolConnector<T> {
    async fn request_token(&self, credential: &Credential) -> Result<SecurityToken, FetchError> {
        self.request_security_token(credential).await
    }
}

impl<T: SoapTransport> super::ShipmentApi for ProtocolConnector<T> {
    async fn list_shipments(
        &self,
        token: &SecurityToken,
        filters: &ShipmentFilters,
    ) -> Result<Vec<ShipmentDescriptor>, FetchError> {
        ProtocolConnector::list_shipments(self, token, filters).await
    }

    async fn get_shipment(
        &self,
        token: &SecurityToken,
        descriptor: &ShipmentDescriptor,
    ) -> Result<ShipmentPayload, FetchError> {
        ProtocolConnector::get_shipment(self, token, descriptor).await
    }

    async fn acknowledge_shipment(
        &self,
        token: &SecurityToken,
        descriptor: &ShipmentDescriptor,
    ) -> Result<(), FetchError> {
        ProtocolConnector::acknowledge_shipment(self, token, descriptor).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GovernorConfig;
    use crate::error::InsurerId;
    use crate::token::credential::AuthKind;
    use bytes::Bytes;
    use std::sync::Mutex;

    /// Transport that replays scripted responses and records requests.
    struct ScriptedTransport {
        responses: Mutex<Vec<Result<WireResponse, TransportFailure>>>,
        requests: Mutex<Vec<(String, String, String)>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<WireResponse, TransportFailure>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    impl SoapTransport for ScriptedTransport {
        async fn post(
            &self,
            url: &str,
            action: &str,
            envelope: String,
        ) -> Result<WireResponse, TransportFailure> {
            self.requests
                .lock()
                .unwrap()
                .push((url.to_string(), action.to_string(), envelope));
            self.responses.lock().unwrap().remove(0)
        }
    }

    fn config(policy: &str) -> InsurerConfig {
        InsurerConfig {
            id: InsurerId::from("degenia"),
            name: "Degenia".into(),
            sts_url: "https://sts.test/410".into(),
            transfer_url: "https://transfer.test/430".into(),
            auth_kind: AuthKind::UsernamePassword,
            policy: policy.into(),
            consumer_id: Some("vendor-9".into()),
            governor: GovernorConfig::default(),
            refresh_margin_secs: 120,
            request_timeout_secs: 45,
            retryable_statuses: vec![429, 503],
        }
    }

    fn credential() -> Credential {
        Credential {
            insurer: InsurerId::from("degenia"),
            auth_kind: AuthKind::UsernamePassword,
            username: "broker".into(),
            secret: "pw".into(),
            cert_ref: None,
        }
    }

    fn token() -> SecurityToken {
        let now = Utc::now();
        SecurityToken {
            value: "tok".into(),
            issued_at: now,
            expires_at: now + chrono::Duration::minutes(20),
            key: TokenKey::new(InsurerId::from("degenia"), "broker"),
        }
    }

    fn descriptor(id: &str) -> ShipmentDescriptor {
        ShipmentDescriptor {
            id: id.into(),
            category: "100".into(),
            delivery_date: None,
            size_estimate: Some(1024),
            status: messages::ShipmentStatus::Available,
        }
    }

    fn xml_response(status: u16, body: &str) -> WireResponse {
        WireResponse {
            status,
            content_type: "text/xml; charset=utf-8".into(),
            body: Bytes::from(body.to_string()),
        }
    }

    #[tokio::test]
    async fn test_token_request_roundtrip() {
        let body = "<e><Token>tok-1</Token><Expires>2030-01-01T00:00:00Z</Expires></e>";
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(xml_response(200, body))]));
        let connector = ProtocolConnector::new(Arc::clone(&transport), config("generic"));

        let token = connector.request_security_token(&credential()).await.unwrap();
        assert_eq!(token.value, "tok-1");
        assert!(!token.expires_within(std::time::Duration::from_secs(120)));

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests[0].0, "https://sts.test/410");
        assert_eq!(requests[0].1, envelope::SOAP_ACTION_REQUEST_TOKEN);
        assert!(!requests[0].2.contains("ConsumerID"));
    }

    #[tokio::test]
    async fn test_vema_token_request_carries_consumer_id() {
        let body = "<e><Token>tok-v</Token></e>";
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(xml_response(200, body))]));
        let connector = ProtocolConnector::new(Arc::clone(&transport), config("vema"));

        connector.request_security_token(&credential()).await.unwrap();
        let requests = transport.requests.lock().unwrap();
        assert!(requests[0].2.contains("<sct:ConsumerID>vendor-9</sct:ConsumerID>"));
    }

    #[tokio::test]
    async fn test_security_fault_on_token_path_is_auth() {
        let fault = r#"<e><Fault><faultcode>wsse:FailedAuthentication</faultcode>
            <faultstring>bad password</faultstring></Fault></e>"#;
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(xml_response(500, fault))]));
        let connector = ProtocolConnector::new(transport, config("generic"));

        let err = connector.request_security_token(&credential()).await.unwrap_err();
        assert!(err.is_run_fatal());
    }

    #[tokio::test]
    async fn test_non_security_fault_on_token_path_stays_protocol_fault() {
        let fault = r#"<e><Fault><faultcode>soap:Server</faultcode>
            <faultstring>Wartungsfenster, bitte spaeter erneut versuchen</faultstring></Fault></e>"#;
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(xml_response(500, fault))]));
        let connector = ProtocolConnector::new(transport, config("generic"));

        let err = connector.request_security_token(&credential()).await.unwrap_err();
        assert!(matches!(err, FetchError::ProtocolFault { .. }));
        assert!(!err.is_run_fatal());
    }

    #[tokio::test]
    async fn test_throttle_status_maps_to_throttled_transport() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(xml_response(429, ""))]));
        let connector = ProtocolConnector::new(transport, config("generic"));

        let err = connector
            .list_shipments(&token(), &ShipmentFilters::default())
            .await
            .unwrap_err();
        assert!(err.is_throttle());
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_fault_on_shipment_path_is_protocol_fault() {
        let fault = r#"<e><Fault><faultcode>soap:Client</faultcode>
            <faultstring>Unbekannte Lieferung</faultstring></Fault></e>"#;
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(xml_response(500, fault))]));
        let connector = ProtocolConnector::new(transport, config("generic"));

        let err = connector
            .get_shipment(&token(), &descriptor("L-404"))
            .await
            .unwrap_err();
        match err {
            FetchError::ProtocolFault { shipment, code, .. } => {
                assert_eq!(shipment.as_deref(), Some("L-404"));
                assert_eq!(code, "soap:Client");
            }
            other => panic!("expected protocol fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_get_shipment_requires_multipart() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(xml_response(
            200,
            "<e><ok/></e>",
        ))]));
        let connector = ProtocolConnector::new(transport, config("generic"));

        let err = connector
            .get_shipment(&token(), &descriptor("L-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::MalformedResponse { .. }));
    }

    #[tokio::test]
    async fn test_get_shipment_decodes_mtom() {
        let boundary = "B42";
        let envelope_xml =
            "<e xmlns:xop=\"http://www.w3.org/2004/08/xop/include\">\
             <xop:Include href=\"cid:doc@vu\"/></e>";
        let pdf = b"%PDF-1.4 shipment doc";
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(
            b"Content-Type: application/xop+xml\r\nContent-ID: <root.xml>\r\n\r\n",
        );
        body.extend_from_slice(envelope_xml.as_bytes());
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(b"Content-Type: application/pdf\r\nContent-ID: <doc@vu>\r\n\r\n");
        body.extend_from_slice(pdf);
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

        let response = WireResponse {
            status: 200,
            content_type: format!(
                "multipart/related; type=\"application/xop+xml\"; boundary=\"{boundary}\"; \
                 start=\"<root.xml>\""
            ),
            body: Bytes::from(body),
        };
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(response)]));
        let connector = ProtocolConnector::new(transport, config("generic"));

        let payload = connector.get_shipment(&token(), &descriptor("L-9")).await.unwrap();
        assert_eq!(payload.shipment_id, "L-9");
        assert_eq!(payload.parts.len(), 1);
        assert_eq!(payload.primary().unwrap().data.as_ref(), pdf);
        assert!(payload.all_validated());
    }

    #[tokio::test]
    async fn test_vema_acknowledge_is_noop() {
        // No scripted response: a wire call would panic on the empty script.
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let connector = ProtocolConnector::new(Arc::clone(&transport), config("vema"));

        connector
            .acknowledge_shipment(&token(), &descriptor("L-1"))
            .await
            .unwrap();
        assert!(transport.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_maps_to_retryable_transport() {
        let transport = Arc::new(ScriptedTransport::new(vec![Err(TransportFailure {
            timed_out: true,
            connect_failed: false,
            detail: "operation timed out".into(),
        })]));
        let connector = ProtocolConnector::new(transport, config("generic"));

        let err = connector
            .list_shipments(&token(), &ShipmentFilters::default())
            .await
            .unwrap_err();
        match err {
            FetchError::Transport { kind, .. } => assert_eq!(kind, TransportKind::Timeout),
            other => panic!("expected transport error, got {other:?}"),
        }
        assert!(connector
            .transport_error(TransportFailure {
                timed_out: false,
                connect_failed: true,
                detail: String::new()
            })
            .is_retryable());
    }
}
