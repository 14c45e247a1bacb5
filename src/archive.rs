//! Archive collaborator boundary.
//!
//! Validated document parts are handed to the archive exactly once per
//! part; the content hash in the metadata lets the archive de-duplicate a
//! re-download of an unacknowledged shipment in a later run.

use crate::error::InsurerId;
use crate::protocol::messages::ShipmentDescriptor;
use crate::util::hash::content_hash_hex;
use bytes::Bytes;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::future::Future;

/// Identifier assigned by the archive for an uploaded document.
pub type DocumentId = String;

/// Metadata accompanying one uploaded document part.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub insurer: InsurerId,
    pub shipment_id: String,
    pub content_id: String,
    pub mime_type: String,
    /// Norm category code of the shipment.
    pub category: String,
    pub delivery_date: Option<NaiveDate>,
    /// SHA3-256 hex digest of the document bytes; upload idempotency key.
    pub content_hash: String,
}

impl DocumentMeta {
    pub fn for_part(
        insurer: &InsurerId,
        descriptor: &ShipmentDescriptor,
        content_id: &str,
        mime_type: &str,
        data: &Bytes,
    ) -> Self {
        Self {
            insurer: insurer.clone(),
            shipment_id: descriptor.id.clone(),
            content_id: content_id.to_string(),
            mime_type: mime_type.to_string(),
            category: descriptor.category.clone(),
            delivery_date: descriptor.delivery_date,
            content_hash: content_hash_hex(data),
        }
    }
}

/// External document archive. Implemented by the embedding application.
pub trait ArchiveSink: Send + Sync {
    /// Store one validated document part. Must be idempotent with respect
    /// to `meta.content_hash`.
    fn upload_document(
        &self,
        data: Bytes,
        meta: DocumentMeta,
    ) -> impl Future<Output = anyhow::Result<DocumentId>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::ShipmentStatus;

    #[test]
    fn test_meta_carries_content_hash() {
        let descriptor = ShipmentDescriptor {
            id: "L-5".into(),
            category: "100".into(),
            delivery_date: NaiveDate::from_ymd_opt(2026, 8, 20),
            size_estimate: Some(10),
            status: ShipmentStatus::Available,
        };
        let data = Bytes::from_static(b"%PDF-1.4 content");
        let meta = DocumentMeta::for_part(
            &InsurerId::from("degenia"),
            &descriptor,
            "doc@vu",
            "application/pdf",
            &data,
        );
        assert_eq!(meta.shipment_id, "L-5");
        assert_eq!(meta.content_hash, content_hash_hex(&data));
        assert_eq!(meta.content_hash.len(), 64);
    }
}
