//! SOAP 1.1 request builders for the norm 410/430 operations.
//!
//! Envelopes are assembled from templates and shaped by the insurer's
//! [`ConnectorPolicy`]: the VEMA profile adds a `ConsumerID` to the token
//! request, the generic profile sets `BestaetigeLieferungen` on the list
//! request. All caller-provided values are XML-escaped.

use crate::protocol::messages::ShipmentFilters;
use crate::protocol::policy::ConnectorPolicy;
use crate::token::credential::Credential;
use crate::token::token::SecurityToken;

pub const SOAP_ACTION_REQUEST_TOKEN: &str = "urn:bipro:norm:410:requestSecurityToken";
pub const SOAP_ACTION_LIST_SHIPMENTS: &str = "urn:bipro:norm:430:listShipments";
pub const SOAP_ACTION_GET_SHIPMENT: &str = "urn:bipro:norm:430:getShipment";
pub const SOAP_ACTION_ACKNOWLEDGE: &str = "urn:bipro:norm:430:acknowledgeShipment";

const BIPRO_VERSION: &str = "2.6.0.1.0";
const NS_SOAP: &str = "http://schemas.xmlsoap.org/soap/envelope/";
const NS_WSSE: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd";
const NS_STS: &str = "urn:bipro:norm:410";
const NS_TRANSFER: &str = "urn:bipro:norm:430";

/// Escape a value for element content or attribute position.
pub fn xml_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

fn soap_envelope(header: &str, body: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <soapenv:Envelope xmlns:soapenv=\"{NS_SOAP}\">\
         <soapenv:Header>{header}</soapenv:Header>\
         <soapenv:Body>{body}</soapenv:Body>\
         </soapenv:Envelope>"
    )
}

fn token_header(token: &SecurityToken) -> String {
    format!(
        "<sct:SecurityToken xmlns:sct=\"{NS_STS}\">{}</sct:SecurityToken>",
        xml_escape(&token.value)
    )
}

/// Norm 410 token request. The `consumer_id` is emitted only for policies
/// that require it.
pub fn security_token_request(
    credential: &Credential,
    policy: &ConnectorPolicy,
    consumer_id: Option<&str>,
) -> String {
    let header = format!(
        "<wsse:Security xmlns:wsse=\"{NS_WSSE}\">\
         <wsse:UsernameToken>\
         <wsse:Username>{}</wsse:Username>\
         <wsse:Password>{}</wsse:Password>\
         </wsse:UsernameToken>\
         </wsse:Security>",
        xml_escape(&credential.username),
        xml_escape(&credential.secret)
    );

    let consumer = if policy.requires_consumer_id {
        let id = consumer_id.unwrap_or(credential.username.as_str());
        format!("<sct:ConsumerID>{}</sct:ConsumerID>", xml_escape(id))
    } else {
        String::new()
    };

    let body = format!(
        "<sct:requestSecurityToken xmlns:sct=\"{NS_STS}\">\
         <sct:BiPROVersion>{BIPRO_VERSION}</sct:BiPROVersion>{consumer}\
         </sct:requestSecurityToken>"
    );

    soap_envelope(&header, &body)
}

/// Norm 430 list request. `BestaetigeLieferungen` is emitted as `false`
/// (explicit acknowledge is the commit signal) for policies that set it,
/// and omitted entirely for those that do not.
pub fn list_shipments_request(
    token: &SecurityToken,
    filters: &ShipmentFilters,
    policy: &ConnectorPolicy,
) -> String {
    let mut body = format!(
        "<lief:listShipments xmlns:lief=\"{NS_TRANSFER}\">\
         <lief:BiPROVersion>{BIPRO_VERSION}</lief:BiPROVersion>"
    );
    if policy.sets_confirm_flag {
        body.push_str("<lief:BestaetigeLieferungen>false</lief:BestaetigeLieferungen>");
    }
    for category in &filters.categories {
        body.push_str(&format!(
            "<lief:Kategorie>{}</lief:Kategorie>",
            xml_escape(category)
        ));
    }
    if let Some(since) = filters.since {
        body.push_str(&format!(
            "<lief:AenderungenSeit>{}</lief:AenderungenSeit>",
            since.format("%Y-%m-%d")
        ));
    }
    if let Some(max) = filters.max_count {
        body.push_str(&format!("<lief:MaxAnzahl>{max}</lief:MaxAnzahl>"));
    }
    body.push_str("</lief:listShipments>");

    soap_envelope(&token_header(token), &body)
}

/// Norm 430 shipment retrieval.
pub fn get_shipment_request(token: &SecurityToken, shipment_id: &str) -> String {
    let body = format!(
        "<lief:getShipment xmlns:lief=\"{NS_TRANSFER}\">\
         <lief:BiPROVersion>{BIPRO_VERSION}</lief:BiPROVersion>\
         <lief:LieferungID>{}</lief:LieferungID>\
         </lief:getShipment>",
        xml_escape(shipment_id)
    );
    soap_envelope(&token_header(token), &body)
}

/// Norm 430 acknowledge (commit) of a delivered shipment.
pub fn acknowledge_request(token: &SecurityToken, shipment_id: &str) -> String {
    let body = format!(
        "<lief:acknowledgeShipment xmlns:lief=\"{NS_TRANSFER}\">\
         <lief:BiPROVersion>{BIPRO_VERSION}</lief:BiPROVersion>\
         <lief:LieferungID>{}</lief:LieferungID>\
         </lief:acknowledgeShipment>",
        xml_escape(shipment_id)
    );
    soap_envelope(&token_header(token), &body)
}
