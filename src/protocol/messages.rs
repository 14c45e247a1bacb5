//! Typed protocol messages and response extraction.
//!
//! Responses are scanned with a pull parser on local element names, so
//! namespace prefixes chosen by the gateway (soapenv/soap/SOAP-ENV and
//! insurer-specific transfer prefixes) do not matter.

use crate::mime::xop::DocumentPart;
use chrono::{DateTime, NaiveDate, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

/// Response-extraction failure; wrapped into
/// [`crate::error::FetchError::MalformedResponse`] by the connector.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseFailure {
    #[error("invalid XML: {0}")]
    Xml(String),
    #[error("response is missing the {0} element")]
    Missing(&'static str),
}

// ── Shipment model ───────────────────────────────────────────────────────────

/// Lifecycle state a shipment is reported in by the insurer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShipmentStatus {
    /// Offered for download.
    Available,
    /// Already acknowledged in an earlier run.
    Acknowledged,
    Unknown,
}

impl ShipmentStatus {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "verfuegbar" | "available" | "neu" => Self::Available,
            "quittiert" | "bestaetigt" | "acknowledged" => Self::Acknowledged,
            _ => Self::Unknown,
        }
    }
}

/// One shipment as offered by `listShipments`.
#[derive(Debug, Clone)]
pub struct ShipmentDescriptor {
    pub id: String,
    /// Norm category code (e.g. "100" for GDV data, document categories).
    pub category: String,
    pub delivery_date: Option<NaiveDate>,
    /// Size estimate in bytes, when the gateway reports one.
    pub size_estimate: Option<u64>,
    pub status: ShipmentStatus,
}

/// Server-side filters for `listShipments`.
#[derive(Debug, Clone, Default)]
pub struct ShipmentFilters {
    pub categories: Vec<String>,
    pub since: Option<NaiveDate>,
    pub max_count: Option<u32>,
}

/// The decoded binary payload of one shipment, ready for archive hand-off.
#[derive(Debug)]
pub struct ShipmentPayload {
    pub shipment_id: String,
    /// Resolved parts in reference order; the first is the primary
    /// document.
    pub parts: Vec<DocumentPart>,
}

impl ShipmentPayload {
    pub fn primary(&self) -> Option<&DocumentPart> {
        self.parts.first()
    }

    pub fn all_validated(&self) -> bool {
        self.parts.iter().all(|p| p.validated)
    }

    /// Content-ids of parts that failed validation, for quarantine logs.
    pub fn unvalidated_ids(&self) -> Vec<&str> {
        self.parts
            .iter()
            .filter(|p| !p.validated)
            .map(|p| p.content_id.as_str())
            .collect()
    }
}

// ── SOAP faults ──────────────────────────────────────────────────────────────

/// A SOAP 1.1 fault extracted from a response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoapFault {
    pub code: String,
    pub message: String,
}

impl SoapFault {
    /// Security faults on the token path escalate to auth errors.
    pub fn is_security_fault(&self) -> bool {
        Self::security_flavoured(&self.code, &self.message)
    }

    /// Keyword classification, usable by callers that only hold the
    /// extracted code/message strings.
    pub fn security_flavoured(code: &str, message: &str) -> bool {
        let code = code.to_ascii_lowercase();
        let message = message.to_ascii_lowercase();
        code.contains("security")
            || code.contains("authentication")
            || message.contains("credential")
            || message.contains("passwort")
            || message.contains("password")
    }
}

/// Detect a SOAP fault anywhere in the body. Returns `None` for fault-free
/// documents and undecodable bytes alike; callers decide how strict to be.
pub fn extract_fault(body: &[u8]) -> Option<SoapFault> {
    let xml = std::str::from_utf8(body).ok()?;
    let mut reader = Reader::from_str(xml);
    let mut in_fault = false;
    let mut current: Vec<u8> = Vec::new();
    let mut code = None;
    let mut message = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if e.local_name().as_ref() == b"Fault" {
                    in_fault = true;
                }
                current = e.local_name().as_ref().to_vec();
            }
            Ok(Event::Text(t)) if in_fault => {
                let text = t.unescape().ok()?.trim().to_string();
                if text.is_empty() {
                    continue;
                }
                match current.as_slice() {
                    b"faultcode" | b"Code" | b"Value" => code.get_or_insert(text),
                    b"faultstring" | b"Reason" | b"Text" => message.get_or_insert(text),
                    _ => continue,
                };
            }
            Ok(Event::Eof) => break,
            Err(_) => return None,
            Ok(_) => {}
        }
    }

    if !in_fault {
        return None;
    }
    Some(SoapFault {
        code: code.unwrap_or_else(|| "soap:Server".into()),
        message: message.unwrap_or_else(|| "unspecified fault".into()),
    })
}

// ── Token response ───────────────────────────────────────────────────────────

/// Extract the token value and optional expiry from a norm 410 response.
pub fn parse_token_response(
    body: &[u8],
) -> Result<(String, Option<DateTime<Utc>>), ParseFailure> {
    let xml = std::str::from_utf8(body).map_err(|_| ParseFailure::Xml("not UTF-8".into()))?;
    let mut reader = Reader::from_str(xml);
    let mut current: Vec<u8> = Vec::new();
    let mut token = None;
    let mut expires = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => current = e.local_name().as_ref().to_vec(),
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| ParseFailure::Xml(e.to_string()))?
                    .trim()
                    .to_string();
                if text.is_empty() {
                    continue;
                }
                match current.as_slice() {
                    b"Token" => token.get_or_insert(text),
                    b"Expires" | b"GueltigBis" => expires.get_or_insert(text),
                    _ => continue,
                };
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ParseFailure::Xml(e.to_string())),
            Ok(_) => {}
        }
    }

    let token = token.ok_or(ParseFailure::Missing("Token"))?;
    let expires_at = expires.and_then(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    });
    Ok((token, expires_at))
}

// ── Shipment list response ───────────────────────────────────────────────────

/// Extract shipment descriptors from a norm 430 `listShipments` response.
///
/// An empty list is a normal outcome (nothing to fetch), not an error.
pub fn parse_list_response(body: &[u8]) -> Result<Vec<ShipmentDescriptor>, ParseFailure> {
    let xml = std::str::from_utf8(body).map_err(|_| ParseFailure::Xml("not UTF-8".into()))?;
    let mut reader = Reader::from_str(xml);
    let mut descriptors = Vec::new();
    let mut current: Vec<u8> = Vec::new();
    let mut builder: Option<DescriptorBuilder> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if e.local_name().as_ref() == b"Lieferung" {
                    builder = Some(DescriptorBuilder::default());
                }
                current = e.local_name().as_ref().to_vec();
            }
            Ok(Event::Text(t)) => {
                let Some(b) = builder.as_mut() else { continue };
                let text = t
                    .unescape()
                    .map_err(|e| ParseFailure::Xml(e.to_string()))?
                    .trim()
                    .to_string();
                if text.is_empty() {
                    continue;
                }
                match current.as_slice() {
                    b"ID" | b"LieferungID" => b.id = Some(text),
                    b"Kategorie" => b.category = Some(text),
                    b"Datum" | b"Lieferdatum" => b.delivery_date = Some(text),
                    b"GroesseInBytes" => b.size_estimate = Some(text),
                    b"Status" => b.status = Some(text),
                    _ => {}
                }
            }
            Ok(Event::End(e)) => {
                if e.local_name().as_ref() == b"Lieferung" {
                    if let Some(b) = builder.take() {
                        descriptors.push(b.build()?);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ParseFailure::Xml(e.to_string())),
            Ok(_) => {}
        }
    }

    Ok(descriptors)
}

#[derive(Default)]
struct DescriptorBuilder {
    id: Option<String>,
    category: Option<String>,
    delivery_date: Option<String>,
    size_estimate: Option<String>,
    status: Option<String>,
}

impl DescriptorBuilder {
    fn build(self) -> Result<ShipmentDescriptor, ParseFailure> {
        Ok(ShipmentDescriptor {
            id: self.id.ok_or(ParseFailure::Missing("Lieferung/ID"))?,
            category: self.category.unwrap_or_default(),
            delivery_date: self
                .delivery_date
                .and_then(|raw| NaiveDate::parse_from_str(raw.get(..10)?, "%Y-%m-%d").ok()),
            size_estimate: self.size_estimate.and_then(|raw| raw.parse().ok()),
            status: self
                .status
                .map(|raw| ShipmentStatus::parse(&raw))
                .unwrap_or(ShipmentStatus::Available),
        })
    }
}
