//! XOP reference resolution and payload validation.
//!
//! The SOAP root part references binary attachments via
//! `<xop:Include href="cid:..."/>`. Resolution walks the envelope with a
//! pull parser, pairs each reference with its MIME part and validates
//! declared-PDF parts against the `%PDF-` magic prefix.
//!
//! A part that fails validation is returned with `validated = false`
//! instead of being dropped, so the caller can quarantine it rather than
//! silently propagate corrupt bytes.

use crate::mime::multipart::{normalize_content_id, parse_multipart, MimeError, MimePart};
use bytes::Bytes;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::warn;

/// Magic prefix every well-formed PDF starts with.
const PDF_MAGIC: &[u8] = b"%PDF-";

/// One resolved binary attachment.
#[derive(Debug, Clone)]
pub struct DocumentPart {
    pub content_id: String,
    /// Media type declared by the MIME part.
    pub mime_type: String,
    pub data: Bytes,
    /// False when the part's declared type implies a check the bytes fail
    /// (currently: declared PDF without the `%PDF-` magic).
    pub validated: bool,
}

/// A fully decoded MTOM response: the envelope XML plus its resolved
/// attachments, in reference order.
#[derive(Debug)]
pub struct DecodedShipment {
    pub envelope_xml: String,
    pub parts: Vec<DocumentPart>,
}

impl DecodedShipment {
    /// The primary document: the first resolved part.
    pub fn primary(&self) -> Option<&DocumentPart> {
        self.parts.first()
    }

    pub fn all_validated(&self) -> bool {
        self.parts.iter().all(|p| p.validated)
    }
}

/// Decode a raw MTOM/XOP HTTP response body.
pub fn decode_mtom(content_type: &str, body: &[u8]) -> Result<DecodedShipment, MimeError> {
    let multipart = parse_multipart(content_type, body)?;

    let envelope_xml =
        String::from_utf8(multipart.root.data.to_vec()).map_err(|_| MimeError::RootNotXml)?;

    let references = collect_xop_references(&envelope_xml)?;

    let mut parts = Vec::with_capacity(references.len());
    for cid in &references {
        let part = multipart
            .attachment(cid)
            .ok_or_else(|| MimeError::UnresolvedContentId(cid.clone()))?;
        parts.push(validate_part(part));
    }

    for orphan in multipart
        .attachments
        .iter()
        .filter(|p| !p.content_id.as_deref().is_some_and(|id| references.iter().any(|r| r == id)))
    {
        warn!(
            content_id = ?orphan.content_id,
            content_type = %orphan.content_type,
            "attachment not referenced by any xop:Include, ignoring"
        );
    }

    Ok(DecodedShipment {
        envelope_xml,
        parts,
    })
}

/// Walk the envelope and collect `xop:Include` href content-ids in
/// document order.
fn collect_xop_references(envelope_xml: &str) -> Result<Vec<String>, MimeError> {
    let mut reader = Reader::from_str(envelope_xml);
    let mut refs = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Empty(e)) | Ok(Event::Start(e))
                if e.local_name().as_ref() == b"Include" =>
            {
                for attr in e.attributes().flatten() {
                    if attr.key.local_name().as_ref() == b"href" {
                        let href = attr
                            .unescape_value()
                            .map_err(|err| MimeError::BadEnvelope(err.to_string()))?;
                        refs.push(normalize_content_id(&href));
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(MimeError::BadEnvelope(err.to_string())),
            Ok(_) => {}
        }
    }

    Ok(refs)
}

fn validate_part(part: &MimePart) -> DocumentPart {
    let declares_pdf = part.content_type.contains("pdf");
    let validated = !declares_pdf || part.data.starts_with(PDF_MAGIC);
    if !validated {
        warn!(
            content_id = ?part.content_id,
            "declared-PDF part fails %PDF- magic check, marking unvalidated"
        );
    }
    DocumentPart {
        content_id: part.content_id.clone().unwrap_or_default(),
        mime_type: part.content_type.clone(),
        data: part.data.clone(),
        validated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDARY: &str = "MIMEBoundary_7";

    fn envelope_with_include(cid: &str) -> String {
        format!(
            "<soapenv:Envelope xmlns:soapenv=\"http://schemas.xmlsoap.org/soap/envelope/\">\
             <soapenv:Body><lief:getShipmentResponse xmlns:lief=\"urn:bipro:430\">\
             <lief:Lieferung><lief:Datei>\
             <xop:Include xmlns:xop=\"http://www.w3.org/2004/08/xop/include\" \
             href=\"cid:{cid}\"/>\
             </lief:Datei></lief:Lieferung>\
             </lief:getShipmentResponse></soapenv:Body></soapenv:Envelope>"
        )
    }

    fn build_mtom(envelope: &str, attachments: &[(&str, &str, &[u8])]) -> (String, Vec<u8>) {
        let content_type = format!(
            "multipart/related; type=\"application/xop+xml\"; \
             boundary=\"{BOUNDARY}\"; start=\"<root.xml>\""
        );
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            b"Content-Type: application/xop+xml; charset=UTF-8\r\nContent-ID: <root.xml>\r\n\r\n",
        );
        body.extend_from_slice(envelope.as_bytes());
        body.extend_from_slice(b"\r\n");
        for (cid, ctype, data) in attachments {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            body.extend_from_slice(
                format!("Content-Type: {ctype}\r\nContent-ID: <{cid}>\r\n\r\n").as_bytes(),
            );
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        (content_type, body)
    }

    #[test]
    fn test_roundtrip_pdf_byte_identical() {
        let pdf = b"%PDF-1.4\n% synthetic shipment document\n%%EOF";
        let envelope = envelope_with_include("doc1@vu");
        let (ct, body) = build_mtom(&envelope, &[("doc1@vu", "application/pdf", pdf)]);

        let decoded = decode_mtom(&ct, &body).unwrap();
        assert_eq!(decoded.parts.len(), 1);
        let part = decoded.primary().unwrap();
        assert_eq!(part.data.as_ref(), pdf);
        assert!(part.validated);
        assert!(decoded.all_validated());
        assert!(decoded.envelope_xml.contains("getShipmentResponse"));
    }

    #[test]
    fn test_declared_pdf_without_magic_is_unvalidated() {
        let not_pdf = b"PK\x03\x04 this is actually a zip";
        let envelope = envelope_with_include("doc1@vu");
        let (ct, body) = build_mtom(&envelope, &[("doc1@vu", "application/pdf", not_pdf)]);

        let decoded = decode_mtom(&ct, &body).unwrap();
        let part = decoded.primary().unwrap();
        assert!(!part.validated);
        assert!(!decoded.all_validated());
        // The bytes are kept for quarantine, not dropped.
        assert_eq!(part.data.as_ref(), not_pdf);
    }

    #[test]
    fn test_non_pdf_type_is_not_magic_checked() {
        let xml_doc = b"<gdv>not a pdf and fine</gdv>";
        let envelope = envelope_with_include("data@vu");
        let (ct, body) = build_mtom(&envelope, &[("data@vu", "application/octet-stream", xml_doc)]);

        let decoded = decode_mtom(&ct, &body).unwrap();
        assert!(decoded.primary().unwrap().validated);
    }

    #[test]
    fn test_unresolved_content_id() {
        let envelope = envelope_with_include("missing@vu");
        let (ct, body) = build_mtom(&envelope, &[("other@vu", "application/pdf", b"%PDF-1.4")]);

        let err = decode_mtom(&ct, &body).unwrap_err();
        assert_eq!(err, MimeError::UnresolvedContentId("missing@vu".into()));
    }

    #[test]
    fn test_reference_order_is_preserved() {
        let envelope = "<e xmlns:xop=\"http://www.w3.org/2004/08/xop/include\">\
             <xop:Include href=\"cid:second@vu\"/>\
             <xop:Include href=\"cid:first@vu\"/></e>"
            .to_string();
        let (ct, body) = build_mtom(
            &envelope,
            &[
                ("first@vu", "application/pdf", b"%PDF-1.4 first"),
                ("second@vu", "application/pdf", b"%PDF-1.4 second"),
            ],
        );
        let decoded = decode_mtom(&ct, &body).unwrap();
        assert_eq!(decoded.parts[0].content_id, "second@vu");
        assert_eq!(decoded.parts[1].content_id, "first@vu");
    }
}
